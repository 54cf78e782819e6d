use crate::core::cpu::cop0::COP0_REGISTER_ALIASES;
use crate::core::cpu::instruction::Instruction;
use crate::core::cpu::instruction::Opcode;

#[derive(Debug)]
pub struct Disassembled {
    pub address: u64,
    pub opcode: Opcode,
    pub parameters: String,
    pub formatted: String,
}

static REGISTER_ALIASES: [&str; 32] = [
    "$zero", "$at", "$v0", "$v1", "$a0", "$a1", "$a2", "$a3",
    "$t0", "$t1", "$t2", "$t3", "$t4", "$t5", "$t6", "$t7",
    "$s0", "$s1", "$s2", "$s3", "$s4", "$s5", "$s6", "$s7",
    "$t8", "$t9", "$k0", "$k1", "$gp", "$sp", "$fp", "$ra",
];

pub fn register_alias(reg_index: usize) -> String {
    String::from(REGISTER_ALIASES[reg_index])
}

/// Resolve "$t0", "t0", "$r8", "r8" or "8" to a GPR index.
pub fn gpr_index_by_name(name: &str) -> Option<usize> {
    let name = name.trim_start_matches('$');
    if let Some(i) = REGISTER_ALIASES
        .iter()
        .position(|alias| alias.trim_start_matches('$') == name)
    {
        return Some(i);
    }
    let name = name.trim_start_matches('r');
    match name.parse::<usize>() {
        Ok(i) if i < 32 => Some(i),
        _ => None,
    }
}

pub fn cop0_register_alias(reg_index: usize) -> String {
    String::from(COP0_REGISTER_ALIASES[reg_index])
}

/// Disassemble a single instruction word into a human-readable line.
pub fn disassemble(address: u64, word: u32) -> Disassembled {
    let i = Instruction(word);
    let opcode = Opcode::from_instruction(&i);
    let parameters = format_parameters(address, &i, opcode);
    let mnemonic = format!("{:?}", opcode).to_lowercase();
    let formatted = if parameters.is_empty() {
        format!("{:016x}: {:08x}  {}", address, word, mnemonic)
    } else {
        format!("{:016x}: {:08x}  {} {}", address, word, mnemonic, parameters)
    };
    Disassembled { address, opcode, parameters, formatted }
}

fn branch_target(address: u64, i: &Instruction) -> u64 {
    address.wrapping_add(4).wrapping_add(i.signed_immediate16() << 2)
}

fn format_parameters(address: u64, i: &Instruction, opcode: Opcode) -> String {
    use Opcode::*;
    let rs = register_alias(i.rs());
    let rt = register_alias(i.rt());
    let rd = register_alias(i.rd());

    match opcode {
        NOP | SYSCALL | BREAK | TLBR | TLBWI | TLBWR | TLBP | ERET | RFE | WAIT | SYNC
        | UNKNOWN => String::new(),

        SLL | SRL | SRA | DSLL | DSRL | DSRA | DSLL32 | DSRL32 | DSRA32 => {
            format!("{},{},{}", rd, rt, i.shift_amount())
        }
        SLLV | SRLV | SRAV | DSLLV | DSRLV | DSRAV => format!("{},{},{}", rd, rt, rs),

        ADD | ADDU | SUB | SUBU | AND | OR | XOR | NOR | SLT | SLTU | DADD | DADDU | DSUB
        | DSUBU | MOVZ | MOVN | MUL => format!("{},{},{}", rd, rs, rt),

        MULT | MULTU | DIV | DIVU | DMULT | DMULTU | DDIV | DDIVU | MADD | MADDU | MSUB
        | MSUBU | TGE | TGEU | TLT | TLTU | TEQ | TNE => format!("{},{}", rs, rt),

        CLZ | CLO | DCLZ | DCLO => format!("{},{}", rd, rs),

        MFHI | MFLO => rd,
        MTHI | MTLO | JR => rs,
        JALR => format!("{},{}", rd, rs),

        ADDI | ADDIU | SLTI | SLTIU | DADDI | DADDIU => {
            format!("{},{},{}", rt, rs, i.signed_immediate16() as i64)
        }
        ANDI | ORI | XORI => format!("{},{},{:#x}", rt, rs, i.unsigned_immediate16()),
        LUI => format!("{},{:#x}", rt, i.unsigned_immediate16()),

        TGEI | TGEIU | TLTI | TLTIU | TEQI | TNEI => {
            format!("{},{}", rs, i.signed_immediate16() as i64)
        }

        BEQ | BNE | BEQL | BNEL => {
            format!("{},{},{:#x}", rs, rt, branch_target(address, i))
        }
        BLEZ | BGTZ | BLEZL | BGTZL | BLTZ | BGEZ | BLTZL | BGEZL | BLTZAL | BGEZAL
        | BLTZALL | BGEZALL => format!("{},{:#x}", rs, branch_target(address, i)),

        J | JAL => {
            let target = (address.wrapping_add(4) & !0x0fff_ffff) | (i.imm26() << 2);
            format!("{:#x}", target)
        }

        MFC0 | DMFC0 | MTC0 | DMTC0 => {
            if i.sel() == 0 {
                format!("{},{}", rt, cop0_register_alias(i.rd()))
            } else {
                format!("{},{},{}", rt, cop0_register_alias(i.rd()), i.sel())
            }
        }

        MFC1 | DMFC1 | MTC1 | DMTC1 | CFC1 | CTC1 => format!("{},$f{}", rt, i.fs()),
        BC1 => format!("{:#x}", branch_target(address, i)),
        FPU => format!("$f{},$f{},$f{}", i.fd(), i.fs(), i.ft()),
        COPZ => format!("{:#x}", i.0 & 0x1ff_ffff),

        LB | LH | LWL | LW | LBU | LHU | LWR | LWU | SB | SH | SWL | SW | SDL | SDR | SWR
        | LDL | LDR | LD | SD | LL | LLD | SC | SCD | CACHE | PREF => {
            format!("{},{}({})", rt, i.signed_immediate16() as i64, rs)
        }
        LWC1 | LDC1 | SWC1 | SDC1 => {
            format!("$f{},{}({})", i.ft(), i.signed_immediate16() as i64, rs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_common_instructions() {
        let d = disassemble(0xffff_ffff_8000_0000, 0x00221821);
        assert_eq!(d.opcode, Opcode::ADDU);
        assert_eq!(d.parameters, "$v1,$at,$v0");

        let d = disassemble(0x10, 0x1000_0002); // beq $zero,$zero,+8
        assert_eq!(d.opcode, Opcode::BEQ);
        assert!(d.parameters.ends_with("0x1c"));

        let d = disassemble(0, 0x8C43_0004); // lw $v1,4($v0)
        assert_eq!(d.parameters, "$v1,4($v0)");
    }

    #[test]
    fn register_name_lookup() {
        assert_eq!(gpr_index_by_name("$t0"), Some(8));
        assert_eq!(gpr_index_by_name("ra"), Some(31));
        assert_eq!(gpr_index_by_name("r5"), Some(5));
        assert_eq!(gpr_index_by_name("31"), Some(31));
        assert_eq!(gpr_index_by_name("bogus"), None);
    }
}
