pub struct Instruction(pub u32);

static OPCODE_CACHE: [fn(&Instruction) -> Opcode; 64] = init_opcode_cache();
static OPCODE_CACHE_SPECIAL: [fn(&Instruction) -> Opcode; 64] = init_opcode_special_cache();
static OPCODE_CACHE_SPECIAL2: [fn(&Instruction) -> Opcode; 64] = init_opcode_special2_cache();

/*
Primary opcode field (bit 26..31)
  00h=SPECIAL 08h=ADDI  10h=COP0 18h=DADDI  20h=LB   28h=SB    30h=LL   38h=SC
  01h=REGIMM  09h=ADDIU 11h=COP1 19h=DADDIU 21h=LH   29h=SH    31h=LWC1 39h=SWC1
  02h=J       0Ah=SLTI  12h=COP2 1Ah=LDL    22h=LWL  2Ah=SWL   32h=LWC2 3Ah=SWC2
  03h=JAL     0Bh=SLTIU 13h=COP3 1Bh=LDR    23h=LW   2Bh=SW    33h=PREF 3Bh=N/A
  04h=BEQ     0Ch=ANDI  14h=BEQL 1Ch=SPEC2  24h=LBU  2Ch=SDL   34h=LLD  3Ch=SCD
  05h=BNE     0Dh=ORI   15h=BNEL 1Dh=N/A    25h=LHU  2Dh=SDR   35h=LDC1 3Dh=SDC1
  06h=BLEZ    0Eh=XORI  16h=BLEZL 1Eh=N/A   26h=LWR  2Eh=SWR   36h=LDC2 3Eh=SDC2
  07h=BGTZ    0Fh=LUI   17h=BGTZL 1Fh=N/A   27h=LWU  2Fh=CACHE 37h=LD   3Fh=SD
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    // SPECIAL
    NOP,
    SLL,
    SRL,
    SRA,
    SLLV,
    SRLV,
    SRAV,
    JR,
    JALR,
    MOVZ,
    MOVN,
    SYSCALL,
    BREAK,
    SYNC,
    MFHI,
    MTHI,
    MFLO,
    MTLO,
    DSLLV,
    DSRLV,
    DSRAV,
    MULT,
    MULTU,
    DIV,
    DIVU,
    DMULT,
    DMULTU,
    DDIV,
    DDIVU,
    ADD,
    ADDU,
    SUB,
    SUBU,
    AND,
    OR,
    XOR,
    NOR,
    SLT,
    SLTU,
    DADD,
    DADDU,
    DSUB,
    DSUBU,
    TGE,
    TGEU,
    TLT,
    TLTU,
    TEQ,
    TNE,
    DSLL,
    DSRL,
    DSRA,
    DSLL32,
    DSRL32,
    DSRA32,
    // SPECIAL2
    MADD,
    MADDU,
    MUL,
    MSUB,
    MSUBU,
    CLZ,
    CLO,
    DCLZ,
    DCLO,
    // REGIMM
    BLTZ,
    BGEZ,
    BLTZL,
    BGEZL,
    TGEI,
    TGEIU,
    TLTI,
    TLTIU,
    TEQI,
    TNEI,
    BLTZAL,
    BGEZAL,
    BLTZALL,
    BGEZALL,
    // normal
    J,
    JAL,
    BEQ,
    BNE,
    BLEZ,
    BGTZ,
    BEQL,
    BNEL,
    BLEZL,
    BGTZL,
    ADDI,
    ADDIU,
    SLTI,
    SLTIU,
    ANDI,
    ORI,
    XORI,
    LUI,
    DADDI,
    DADDIU,
    // COP0
    MFC0,
    DMFC0,
    MTC0,
    DMTC0,
    TLBR,
    TLBWI,
    TLBWR,
    TLBP,
    ERET,
    RFE,
    WAIT,
    // COP1
    MFC1,
    DMFC1,
    CFC1,
    MTC1,
    DMTC1,
    CTC1,
    BC1,
    FPU,
    // COP2/COP3 (no coprocessor attached; usability check then RI)
    COPZ,
    // loads/stores
    LB,
    LH,
    LWL,
    LW,
    LBU,
    LHU,
    LWR,
    LWU,
    SB,
    SH,
    SWL,
    SW,
    SDL,
    SDR,
    SWR,
    LDL,
    LDR,
    LD,
    SD,
    LL,
    LLD,
    SC,
    SCD,
    LWC1,
    LDC1,
    SWC1,
    SDC1,
    CACHE,
    PREF,
    UNKNOWN,
}

pub const OPCODE_COUNT: usize = Opcode::UNKNOWN as usize + 1;

impl Instruction {
    #[inline(always)]
    pub fn op(&self) -> u32 {
        self.0 >> 26
    }
    #[inline(always)]
    pub fn rs(&self) -> usize {
        ((self.0 >> 21) & 0x1F) as usize
    }
    #[inline(always)]
    pub fn rt(&self) -> usize {
        ((self.0 >> 16) & 0x1F) as usize
    }
    #[inline(always)]
    pub fn rd(&self) -> usize {
        ((self.0 >> 11) & 0x1F) as usize
    }
    #[inline(always)]
    pub fn shift_amount(&self) -> u32 {
        (self.0 >> 6) & 0x1F
    }
    #[inline(always)]
    pub fn function(&self) -> u32 {
        self.0 & 0x3F
    }
    /// Immediate sign-extended to 64 bits.
    #[inline(always)]
    pub fn signed_immediate16(&self) -> u64 {
        (self.0 & 0xFFFF) as i16 as i64 as u64
    }
    #[inline(always)]
    pub fn unsigned_immediate16(&self) -> u64 {
        (self.0 & 0xFFFF) as u64
    }
    #[inline(always)]
    pub fn imm26(&self) -> u64 {
        (self.0 & 0x3FF_FFFF) as u64
    }
    // COP1 field names
    #[inline(always)]
    pub fn fmt(&self) -> usize {
        self.rs()
    }
    #[inline(always)]
    pub fn ft(&self) -> usize {
        self.rt()
    }
    #[inline(always)]
    pub fn fs(&self) -> usize {
        self.rd()
    }
    #[inline(always)]
    pub fn fd(&self) -> usize {
        self.shift_amount() as usize
    }
    /// COP0 register select field (MIPS32/64 sel).
    #[inline(always)]
    pub fn sel(&self) -> usize {
        (self.0 & 7) as usize
    }
}

/*
SPECIAL function field (bit 0..5)
  00h=SLL   08h=JR      10h=MFHI  18h=MULT   20h=ADD  28h=N/A   30h=TGE  38h=DSLL
  01h=N/A   09h=JALR    11h=MTHI  19h=MULTU  21h=ADDU 29h=N/A   31h=TGEU 39h=N/A
  02h=SRL   0Ah=MOVZ    12h=MFLO  1Ah=DIV    22h=SUB  2Ah=SLT   32h=TLT  3Ah=DSRL
  03h=SRA   0Bh=MOVN    13h=MTLO  1Bh=DIVU   23h=SUBU 2Bh=SLTU  33h=TLTU 3Bh=DSRA
  04h=SLLV  0Ch=SYSCALL 14h=DSLLV 1Ch=DMULT  24h=AND  2Ch=DADD  34h=TEQ  3Ch=DSLL32
  05h=N/A   0Dh=BREAK   15h=N/A   1Dh=DMULTU 25h=OR   2Dh=DADDU 35h=N/A  3Dh=N/A
  06h=SRLV  0Eh=N/A     16h=DSRLV 1Eh=DDIV   26h=XOR  2Eh=DSUB  36h=TNE  3Eh=DSRL32
  07h=SRAV  0Fh=SYNC    17h=DSRAV 1Fh=DDIVU  27h=NOR  2Fh=DSUBU 37h=N/A  3Fh=DSRA32
*/
const fn init_opcode_special_cache() -> [fn(&Instruction) -> Opcode; 64] {
    let mut cache: [fn(&Instruction) -> Opcode; 64] = [|_| Opcode::UNKNOWN; 64];
    let mut fun: usize = 0;
    while fun < 64 {
        cache[fun] = match fun {
            0x00 => |i| {
                if i.rd() == 0 && i.rt() == 0 && i.shift_amount() == 0 {
                    Opcode::NOP
                } else {
                    Opcode::SLL
                }
            },
            0x02 => |_| Opcode::SRL,
            0x03 => |_| Opcode::SRA,
            0x04 => |_| Opcode::SLLV,
            0x06 => |_| Opcode::SRLV,
            0x07 => |_| Opcode::SRAV,
            0x08 => |_| Opcode::JR,
            0x09 => |_| Opcode::JALR,
            0x0A => |_| Opcode::MOVZ,
            0x0B => |_| Opcode::MOVN,
            0x0C => |_| Opcode::SYSCALL,
            0x0D => |_| Opcode::BREAK,
            0x0F => |_| Opcode::SYNC,
            0x10 => |_| Opcode::MFHI,
            0x11 => |_| Opcode::MTHI,
            0x12 => |_| Opcode::MFLO,
            0x13 => |_| Opcode::MTLO,
            0x14 => |_| Opcode::DSLLV,
            0x16 => |_| Opcode::DSRLV,
            0x17 => |_| Opcode::DSRAV,
            0x18 => |_| Opcode::MULT,
            0x19 => |_| Opcode::MULTU,
            0x1A => |_| Opcode::DIV,
            0x1B => |_| Opcode::DIVU,
            0x1C => |_| Opcode::DMULT,
            0x1D => |_| Opcode::DMULTU,
            0x1E => |_| Opcode::DDIV,
            0x1F => |_| Opcode::DDIVU,
            0x20 => |_| Opcode::ADD,
            0x21 => |_| Opcode::ADDU,
            0x22 => |_| Opcode::SUB,
            0x23 => |_| Opcode::SUBU,
            0x24 => |_| Opcode::AND,
            0x25 => |_| Opcode::OR,
            0x26 => |_| Opcode::XOR,
            0x27 => |_| Opcode::NOR,
            0x2A => |_| Opcode::SLT,
            0x2B => |_| Opcode::SLTU,
            0x2C => |_| Opcode::DADD,
            0x2D => |_| Opcode::DADDU,
            0x2E => |_| Opcode::DSUB,
            0x2F => |_| Opcode::DSUBU,
            0x30 => |_| Opcode::TGE,
            0x31 => |_| Opcode::TGEU,
            0x32 => |_| Opcode::TLT,
            0x33 => |_| Opcode::TLTU,
            0x34 => |_| Opcode::TEQ,
            0x36 => |_| Opcode::TNE,
            0x38 => |_| Opcode::DSLL,
            0x3A => |_| Opcode::DSRL,
            0x3B => |_| Opcode::DSRA,
            0x3C => |_| Opcode::DSLL32,
            0x3E => |_| Opcode::DSRL32,
            0x3F => |_| Opcode::DSRA32,
            _ => |_| Opcode::UNKNOWN,
        };

        fun += 1;
    }

    cache
}

const fn init_opcode_special2_cache() -> [fn(&Instruction) -> Opcode; 64] {
    let mut cache: [fn(&Instruction) -> Opcode; 64] = [|_| Opcode::UNKNOWN; 64];
    let mut fun: usize = 0;
    while fun < 64 {
        cache[fun] = match fun {
            0x00 => |_| Opcode::MADD,
            0x01 => |_| Opcode::MADDU,
            0x02 => |_| Opcode::MUL,
            0x04 => |_| Opcode::MSUB,
            0x05 => |_| Opcode::MSUBU,
            0x20 => |_| Opcode::CLZ,
            0x21 => |_| Opcode::CLO,
            0x24 => |_| Opcode::DCLZ,
            0x25 => |_| Opcode::DCLO,
            _ => |_| Opcode::UNKNOWN,
        };

        fun += 1;
    }

    cache
}

const fn init_opcode_cache() -> [fn(&Instruction) -> Opcode; 64] {
    let mut cache: [fn(&Instruction) -> Opcode; 64] = [|_| Opcode::UNKNOWN; 64];
    let mut op: usize = 0;
    while op < 64 {
        cache[op] = match op {
            0x01 => |i| {
                // REGIMM, sub-decoded on rt
                match i.rt() {
                    0x00 => Opcode::BLTZ,
                    0x01 => Opcode::BGEZ,
                    0x02 => Opcode::BLTZL,
                    0x03 => Opcode::BGEZL,
                    0x08 => Opcode::TGEI,
                    0x09 => Opcode::TGEIU,
                    0x0A => Opcode::TLTI,
                    0x0B => Opcode::TLTIU,
                    0x0C => Opcode::TEQI,
                    0x0E => Opcode::TNEI,
                    0x10 => Opcode::BLTZAL,
                    0x11 => Opcode::BGEZAL,
                    0x12 => Opcode::BLTZALL,
                    0x13 => Opcode::BGEZALL,
                    _ => Opcode::UNKNOWN,
                }
            },
            0x02 => |_| Opcode::J,
            0x03 => |_| Opcode::JAL,
            0x04 => |_| Opcode::BEQ,
            0x05 => |_| Opcode::BNE,
            0x06 => |_| Opcode::BLEZ,
            0x07 => |_| Opcode::BGTZ,
            0x08 => |_| Opcode::ADDI,
            0x09 => |_| Opcode::ADDIU,
            0x0A => |_| Opcode::SLTI,
            0x0B => |_| Opcode::SLTIU,
            0x0C => |_| Opcode::ANDI,
            0x0D => |_| Opcode::ORI,
            0x0E => |_| Opcode::XORI,
            0x0F => |_| Opcode::LUI,
            0x10 => |i| {
                // COP0
                match i.rs() {
                    0x00 => Opcode::MFC0,
                    0x01 => Opcode::DMFC0,
                    0x04 => Opcode::MTC0,
                    0x05 => Opcode::DMTC0,
                    rs if rs >= 0x10 => match i.function() {
                        0x01 => Opcode::TLBR,
                        0x02 => Opcode::TLBWI,
                        0x06 => Opcode::TLBWR,
                        0x08 => Opcode::TLBP,
                        0x10 => Opcode::RFE,
                        0x18 => Opcode::ERET,
                        0x20 => Opcode::WAIT,
                        _ => Opcode::UNKNOWN,
                    },
                    _ => Opcode::UNKNOWN,
                }
            },
            0x11 => |i| {
                // COP1
                match i.rs() {
                    0x00 => Opcode::MFC1,
                    0x01 => Opcode::DMFC1,
                    0x02 => Opcode::CFC1,
                    0x04 => Opcode::MTC1,
                    0x05 => Opcode::DMTC1,
                    0x06 => Opcode::CTC1,
                    0x08 => Opcode::BC1,
                    rs if rs >= 0x10 => Opcode::FPU,
                    _ => Opcode::UNKNOWN,
                }
            },
            0x12 | 0x13 => |_| Opcode::COPZ,
            0x14 => |_| Opcode::BEQL,
            0x15 => |_| Opcode::BNEL,
            0x16 => |_| Opcode::BLEZL,
            0x17 => |_| Opcode::BGTZL,
            0x18 => |_| Opcode::DADDI,
            0x19 => |_| Opcode::DADDIU,
            0x1A => |_| Opcode::LDL,
            0x1B => |_| Opcode::LDR,
            0x1C => |i| OPCODE_CACHE_SPECIAL2[i.function() as usize](i),
            0x20 => |_| Opcode::LB,
            0x21 => |_| Opcode::LH,
            0x22 => |_| Opcode::LWL,
            0x23 => |_| Opcode::LW,
            0x24 => |_| Opcode::LBU,
            0x25 => |_| Opcode::LHU,
            0x26 => |_| Opcode::LWR,
            0x27 => |_| Opcode::LWU,
            0x28 => |_| Opcode::SB,
            0x29 => |_| Opcode::SH,
            0x2A => |_| Opcode::SWL,
            0x2B => |_| Opcode::SW,
            0x2C => |_| Opcode::SDL,
            0x2D => |_| Opcode::SDR,
            0x2E => |_| Opcode::SWR,
            0x2F => |_| Opcode::CACHE,
            0x30 => |_| Opcode::LL,
            0x31 => |_| Opcode::LWC1,
            0x32 => |_| Opcode::COPZ,
            0x33 => |_| Opcode::PREF,
            0x34 => |_| Opcode::LLD,
            0x35 => |_| Opcode::LDC1,
            0x36 => |_| Opcode::COPZ,
            0x37 => |_| Opcode::LD,
            0x38 => |_| Opcode::SC,
            0x39 => |_| Opcode::SWC1,
            0x3A => |_| Opcode::COPZ,
            0x3C => |_| Opcode::SCD,
            0x3D => |_| Opcode::SDC1,
            0x3E => |_| Opcode::COPZ,
            0x3F => |_| Opcode::SD,
            _ => |_| Opcode::UNKNOWN,
        };

        op += 1;
    }
    cache
}

impl Opcode {
    #[inline(always)]
    pub fn from_instruction(instruction: &Instruction) -> Opcode {
        let op = instruction.op() as usize;
        if op == 0x00 {
            OPCODE_CACHE_SPECIAL[instruction.function() as usize](instruction)
        } else {
            OPCODE_CACHE[op](instruction)
        }
    }

    /// Branches whose delay slot is nullified when the branch is not taken.
    pub fn is_likely_branch(&self) -> bool {
        use Opcode::*;
        matches!(
            self,
            BEQL | BNEL | BLEZL | BGTZL | BLTZL | BGEZL | BLTZALL | BGEZALL
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(word: u32) -> Opcode {
        Opcode::from_instruction(&Instruction(word))
    }

    #[test]
    fn decodes_special_group() {
        assert_eq!(decode(0x00000000), Opcode::NOP);
        assert_eq!(decode(0x00011040), Opcode::SLL); // sll $2,$1,1
        assert_eq!(decode(0x00221821), Opcode::ADDU); // addu $3,$1,$2
        assert_eq!(decode(0x0022182D), Opcode::DADDU); // daddu $3,$1,$2
        assert_eq!(decode(0x0000000C), Opcode::SYSCALL);
        assert_eq!(decode(0x0000001F), Opcode::DDIVU);
        assert_eq!(decode(0x00221834), Opcode::TEQ);
        assert_eq!(decode(0x00011FF8), Opcode::DSLL);
    }

    #[test]
    fn decodes_regimm_group() {
        assert_eq!(decode(0x04200002), Opcode::BLTZ); // bltz $1,+2
        assert_eq!(decode(0x04230002), Opcode::BGEZL);
        assert_eq!(decode(0x04300002), Opcode::BLTZAL);
        assert_eq!(decode(0x042C0000), Opcode::TEQI);
    }

    #[test]
    fn decodes_cop0_group() {
        assert_eq!(decode(0x40016000), Opcode::MFC0); // mfc0 $1,$12
        assert_eq!(decode(0x40816000), Opcode::MTC0);
        assert_eq!(decode(0x42000018), Opcode::ERET);
        assert_eq!(decode(0x42000010), Opcode::RFE);
        assert_eq!(decode(0x42000002), Opcode::TLBWI);
        assert_eq!(decode(0x42000008), Opcode::TLBP);
    }

    #[test]
    fn decodes_loads_stores() {
        assert_eq!(decode(0x8C220004), Opcode::LW); // lw $2,4($1)
        assert_eq!(decode(0xDC220004), Opcode::LD);
        assert_eq!(decode(0xC0220004), Opcode::LL);
        assert_eq!(decode(0xE0220004), Opcode::SC);
        assert_eq!(decode(0xB8220004), Opcode::SWR);
        assert_eq!(decode(0xBC000000), Opcode::CACHE);
    }

    #[test]
    fn decodes_special2_group() {
        assert_eq!(decode(0x70221002), Opcode::MUL); // mul $2,$1,$2
        assert_eq!(decode(0x70221020), Opcode::CLZ);
        assert_eq!(decode(0x70220000), Opcode::MADD);
    }

    #[test]
    fn immediate_field_extraction() {
        let i = Instruction(0x2401FFFF); // addiu $1,$0,-1
        assert_eq!(i.signed_immediate16(), 0xFFFF_FFFF_FFFF_FFFF);
        assert_eq!(i.unsigned_immediate16(), 0xFFFF);
        let j = Instruction(0x0BFFFFFF);
        assert_eq!(j.imm26(), 0x03FF_FFFF);
    }
}
