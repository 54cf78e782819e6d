use tracing::{debug, warn};
use crate::core::config::ByteOrder;
use crate::core::cpu::cop0::Cop0;
use crate::core::cpu::cop1::Cop1;
use crate::core::cpu::cpu_types::{CpuTypeDef, FLAG_R5900_MULT_RD};
use crate::core::cpu::instruction::{Instruction, Opcode, OPCODE_COUNT};
use crate::core::cpu::mmu::Intent;
use crate::core::interrupt::InterruptController;
use crate::core::memory::bus::Bus;

pub mod instruction;
pub mod disassembler;
pub mod cop0;
pub mod cop1;
pub mod cpu_types;
pub mod mmu;

/// Power-on program counter (the boot ROM window in kseg1).
pub const RESET_ADDRESS: u64 = 0xffff_ffff_bfc0_0000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CpuException {
    Interrupt,
    TlbModified { vaddr: u64 },
    TlbLoad { vaddr: u64, refill: bool, x64: bool },
    TlbStore { vaddr: u64, refill: bool, x64: bool },
    AddressErrorLoad(u64),
    AddressErrorStore(u64),
    BusErrorFetch(u64),
    BusErrorData(u64),
    Syscall,
    Breakpoint,
    ReservedInstruction(u32),
    CoprocessorUnusable(usize),
    ArithmeticOverflow,
    Trap,
    FloatingPoint,
    // internal only: WAIT retired, give control back to the dispatch loop
    WaitHalt,
}

impl CpuException {
    /// CP0 Cause ExcCode value.
    pub fn code(&self) -> usize {
        use CpuException::*;
        match self {
            Interrupt => 0,
            TlbModified { .. } => 1,
            TlbLoad { .. } => 2,
            TlbStore { .. } => 3,
            AddressErrorLoad(_) => 4,
            AddressErrorStore(_) => 5,
            BusErrorFetch(_) => 6,
            BusErrorData(_) => 7,
            Syscall => 8,
            Breakpoint => 9,
            ReservedInstruction(_) => 10,
            CoprocessorUnusable(_) => 11,
            ArithmeticOverflow => 12,
            Trap => 13,
            FloatingPoint => 15,
            WaitHalt => unreachable!(),
        }
    }

    pub fn bad_vaddr(&self) -> Option<u64> {
        use CpuException::*;
        match self {
            TlbModified { vaddr }
            | TlbLoad { vaddr, .. }
            | TlbStore { vaddr, .. } => Some(*vaddr),
            AddressErrorLoad(vaddr) | AddressErrorStore(vaddr) => Some(*vaddr),
            _ => None,
        }
    }

    pub fn is_tlb(&self) -> bool {
        matches!(
            self,
            CpuException::TlbModified { .. }
                | CpuException::TlbLoad { .. }
                | CpuException::TlbStore { .. }
        )
    }

    pub fn is_tlb_refill(&self) -> bool {
        matches!(
            self,
            CpuException::TlbLoad { refill: true, .. } | CpuException::TlbStore { refill: true, .. }
        )
    }

    pub fn is_xtlb(&self) -> bool {
        matches!(
            self,
            CpuException::TlbLoad { x64: true, .. } | CpuException::TlbStore { x64: true, .. }
        )
    }
}

type OperationResult = Result<(), CpuException>;
type OpFn = fn(&mut Cpu, &mut Bus, &Instruction) -> OperationResult;

/// Where the CPU is relative to a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelaySlotState {
    NotDelayed,
    /// A branch just retired; the next instruction is its delay slot.
    ToBeDelayed,
    /// The instruction currently executing is the delay slot.
    Delayed,
    /// The delay slot raised an exception.
    ExceptionInDelaySlot,
}

/// Outcome of one `step()`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepResult {
    Continued,
    Exception(CpuException),
    /// A WAIT instruction retired; the dispatch loop should move on.
    Wait,
}

pub struct Cpu {
    op_functions: [OpFn; OPCODE_COUNT],
    pub cop0: Cop0,
    pub cop1: Cop1,
    def: &'static CpuTypeDef,
    byte_order: ByteOrder,
    cpu_id: usize,
    pc: u64,
    pc_last: u64,
    gpr: [u64; 32],
    hi: u64,
    lo: u64,
    pub delay_slot: DelaySlotState,
    delay_jmpaddr: u64,
    pub nullify_next: bool,
    pc_overridden: bool,
    rmw: bool,
    rmw_addr: u64,
    /// Retired guest instructions.
    ninstrs: u64,
    last_opcode: u32,
    /// Cached virtual mappings (in the translation engine) are stale and
    /// must be dropped before translated code runs again.
    pub vaddr_maps_stale: bool,
}

impl Cpu {
    pub fn new(def: &'static CpuTypeDef, byte_order: ByteOrder, cpu_id: usize) -> Self {
        let mut cpu = Cpu {
            op_functions: [Cpu::op_reserved; OPCODE_COUNT],
            cop0: Cop0::new(def),
            cop1: Cop1::new(),
            def,
            byte_order,
            cpu_id,
            pc: RESET_ADDRESS,
            pc_last: RESET_ADDRESS,
            gpr: [0; 32],
            hi: 0,
            lo: 0,
            delay_slot: DelaySlotState::NotDelayed,
            delay_jmpaddr: 0,
            nullify_next: false,
            pc_overridden: false,
            rmw: false,
            rmw_addr: 0,
            ninstrs: 0,
            last_opcode: 0,
            vaddr_maps_stale: false,
        };

        cpu.init_op_functions();

        cpu
    }

    fn init_op_functions(&mut self) {
        use Opcode::*;
        // architectural no-ops
        self.op_functions[NOP as usize] = Cpu::op_nop;
        self.op_functions[SYNC as usize] = Cpu::op_nop;
        self.op_functions[CACHE as usize] = Cpu::op_nop;
        self.op_functions[PREF as usize] = Cpu::op_nop;
        // lui
        self.op_functions[LUI as usize] = Cpu::op_lui;
        // 32-bit shifts
        self.op_functions[SLL as usize] = Cpu::op_shift32::<true, false, true>;
        self.op_functions[SRL as usize] = Cpu::op_shift32::<false, false, true>;
        self.op_functions[SRA as usize] = Cpu::op_shift32::<false, true, true>;
        self.op_functions[SLLV as usize] = Cpu::op_shift32::<true, false, false>;
        self.op_functions[SRLV as usize] = Cpu::op_shift32::<false, false, false>;
        self.op_functions[SRAV as usize] = Cpu::op_shift32::<false, true, false>;
        // 64-bit shifts
        self.op_functions[DSLL as usize] = Cpu::op_shift64::<true, false, true, false>;
        self.op_functions[DSRL as usize] = Cpu::op_shift64::<false, false, true, false>;
        self.op_functions[DSRA as usize] = Cpu::op_shift64::<false, true, true, false>;
        self.op_functions[DSLL32 as usize] = Cpu::op_shift64::<true, false, true, true>;
        self.op_functions[DSRL32 as usize] = Cpu::op_shift64::<false, false, true, true>;
        self.op_functions[DSRA32 as usize] = Cpu::op_shift64::<false, true, true, true>;
        self.op_functions[DSLLV as usize] = Cpu::op_shift64::<true, false, false, false>;
        self.op_functions[DSRLV as usize] = Cpu::op_shift64::<false, false, false, false>;
        self.op_functions[DSRAV as usize] = Cpu::op_shift64::<false, true, false, false>;
        // jumps
        self.op_functions[J as usize] = Cpu::op_j::<false>;
        self.op_functions[JAL as usize] = Cpu::op_j::<true>;
        self.op_functions[JR as usize] = Cpu::op_jr;
        self.op_functions[JALR as usize] = Cpu::op_jalr;
        // conditional moves
        self.op_functions[MOVZ as usize] = Cpu::op_movcond::<true>;
        self.op_functions[MOVN as usize] = Cpu::op_movcond::<false>;
        // syscall / break / wait
        self.op_functions[SYSCALL as usize] = Cpu::op_syscall;
        self.op_functions[BREAK as usize] = Cpu::op_break;
        self.op_functions[WAIT as usize] = Cpu::op_wait;
        // hi/lo
        self.op_functions[MFHI as usize] = Cpu::op_mf_lohi::<false>;
        self.op_functions[MFLO as usize] = Cpu::op_mf_lohi::<true>;
        self.op_functions[MTHI as usize] = Cpu::op_mt_lohi::<false>;
        self.op_functions[MTLO as usize] = Cpu::op_mt_lohi::<true>;
        // multiply / divide
        self.op_functions[MULT as usize] = Cpu::op_mult::<true>;
        self.op_functions[MULTU as usize] = Cpu::op_mult::<false>;
        self.op_functions[DIV as usize] = Cpu::op_div::<true>;
        self.op_functions[DIVU as usize] = Cpu::op_div::<false>;
        self.op_functions[DMULT as usize] = Cpu::op_dmult::<true>;
        self.op_functions[DMULTU as usize] = Cpu::op_dmult::<false>;
        self.op_functions[DDIV as usize] = Cpu::op_ddiv::<true>;
        self.op_functions[DDIVU as usize] = Cpu::op_ddiv::<false>;
        // SPECIAL2 multiply-accumulate and bit counts
        self.op_functions[MUL as usize] = Cpu::op_mul_special2;
        self.op_functions[MADD as usize] = Cpu::op_madd::<true, false>;
        self.op_functions[MADDU as usize] = Cpu::op_madd::<false, false>;
        self.op_functions[MSUB as usize] = Cpu::op_madd::<true, true>;
        self.op_functions[MSUBU as usize] = Cpu::op_madd::<false, true>;
        self.op_functions[CLZ as usize] = Cpu::op_count_bits::<false, false>;
        self.op_functions[CLO as usize] = Cpu::op_count_bits::<true, false>;
        self.op_functions[DCLZ as usize] = Cpu::op_count_bits::<false, true>;
        self.op_functions[DCLO as usize] = Cpu::op_count_bits::<true, true>;
        // add / sub, 32-bit results sign-extended
        self.op_functions[ADD as usize] = Cpu::op_arithmetic::<true, true, false, false>;
        self.op_functions[ADDU as usize] = Cpu::op_arithmetic::<true, false, false, false>;
        self.op_functions[SUB as usize] = Cpu::op_arithmetic::<false, true, false, false>;
        self.op_functions[SUBU as usize] = Cpu::op_arithmetic::<false, false, false, false>;
        self.op_functions[ADDI as usize] = Cpu::op_arithmetic::<true, true, true, false>;
        self.op_functions[ADDIU as usize] = Cpu::op_arithmetic::<true, false, true, false>;
        self.op_functions[DADD as usize] = Cpu::op_arithmetic::<true, true, false, true>;
        self.op_functions[DADDU as usize] = Cpu::op_arithmetic::<true, false, false, true>;
        self.op_functions[DSUB as usize] = Cpu::op_arithmetic::<false, true, false, true>;
        self.op_functions[DSUBU as usize] = Cpu::op_arithmetic::<false, false, false, true>;
        self.op_functions[DADDI as usize] = Cpu::op_arithmetic::<true, true, true, true>;
        self.op_functions[DADDIU as usize] = Cpu::op_arithmetic::<true, false, true, true>;
        // logical
        self.op_functions[AND as usize] = Cpu::op_and;
        self.op_functions[OR as usize] = Cpu::op_or;
        self.op_functions[XOR as usize] = Cpu::op_xor;
        self.op_functions[NOR as usize] = Cpu::op_nor;
        self.op_functions[ANDI as usize] = Cpu::op_andi;
        self.op_functions[ORI as usize] = Cpu::op_ori;
        self.op_functions[XORI as usize] = Cpu::op_xori;
        // compare
        self.op_functions[SLT as usize] = Cpu::op_compare::<true, false>;
        self.op_functions[SLTU as usize] = Cpu::op_compare::<false, false>;
        self.op_functions[SLTI as usize] = Cpu::op_compare::<true, true>;
        self.op_functions[SLTIU as usize] = Cpu::op_compare::<false, true>;
        // traps
        self.op_functions[TGE as usize] = Cpu::op_trap_ge::<true, false>;
        self.op_functions[TGEU as usize] = Cpu::op_trap_ge::<false, false>;
        self.op_functions[TLT as usize] = Cpu::op_trap_lt::<true, false>;
        self.op_functions[TLTU as usize] = Cpu::op_trap_lt::<false, false>;
        self.op_functions[TEQ as usize] = Cpu::op_trap_eq::<true, false>;
        self.op_functions[TNE as usize] = Cpu::op_trap_ne::<false>;
        self.op_functions[TGEI as usize] = Cpu::op_trap_ge::<true, true>;
        self.op_functions[TGEIU as usize] = Cpu::op_trap_ge::<false, true>;
        self.op_functions[TLTI as usize] = Cpu::op_trap_lt::<true, true>;
        self.op_functions[TLTIU as usize] = Cpu::op_trap_lt::<false, true>;
        self.op_functions[TEQI as usize] = Cpu::op_trap_eq::<true, true>;
        self.op_functions[TNEI as usize] = Cpu::op_trap_ne::<true>;
        // branches
        self.op_functions[BEQ as usize] = Cpu::op_beq::<false>;
        self.op_functions[BNE as usize] = Cpu::op_bne::<false>;
        self.op_functions[BLEZ as usize] = Cpu::op_blez::<false>;
        self.op_functions[BGTZ as usize] = Cpu::op_bgtz::<false>;
        self.op_functions[BEQL as usize] = Cpu::op_beq::<true>;
        self.op_functions[BNEL as usize] = Cpu::op_bne::<true>;
        self.op_functions[BLEZL as usize] = Cpu::op_blez::<true>;
        self.op_functions[BGTZL as usize] = Cpu::op_bgtz::<true>;
        self.op_functions[BLTZ as usize] = Cpu::op_bltz::<false, false>;
        self.op_functions[BGEZ as usize] = Cpu::op_bgez::<false, false>;
        self.op_functions[BLTZL as usize] = Cpu::op_bltz::<true, false>;
        self.op_functions[BGEZL as usize] = Cpu::op_bgez::<true, false>;
        self.op_functions[BLTZAL as usize] = Cpu::op_bltz::<false, true>;
        self.op_functions[BGEZAL as usize] = Cpu::op_bgez::<false, true>;
        self.op_functions[BLTZALL as usize] = Cpu::op_bltz::<true, true>;
        self.op_functions[BGEZALL as usize] = Cpu::op_bgez::<true, true>;
        // coprocessor 0
        self.op_functions[MFC0 as usize] = Cpu::op_mfc0::<false>;
        self.op_functions[DMFC0 as usize] = Cpu::op_mfc0::<true>;
        self.op_functions[MTC0 as usize] = Cpu::op_mtc0::<false>;
        self.op_functions[DMTC0 as usize] = Cpu::op_mtc0::<true>;
        self.op_functions[TLBP as usize] = Cpu::op_tlb;
        self.op_functions[TLBR as usize] = Cpu::op_tlb;
        self.op_functions[TLBWI as usize] = Cpu::op_tlb;
        self.op_functions[TLBWR as usize] = Cpu::op_tlb;
        self.op_functions[ERET as usize] = Cpu::op_eret;
        self.op_functions[RFE as usize] = Cpu::op_rfe;
        // coprocessor 1
        self.op_functions[MFC1 as usize] = Cpu::op_mfc1::<false>;
        self.op_functions[DMFC1 as usize] = Cpu::op_mfc1::<true>;
        self.op_functions[MTC1 as usize] = Cpu::op_mtc1::<false>;
        self.op_functions[DMTC1 as usize] = Cpu::op_mtc1::<true>;
        self.op_functions[CFC1 as usize] = Cpu::op_cfc1;
        self.op_functions[CTC1 as usize] = Cpu::op_ctc1;
        self.op_functions[BC1 as usize] = Cpu::op_bc1;
        self.op_functions[FPU as usize] = Cpu::op_fpu;
        self.op_functions[COPZ as usize] = Cpu::op_copz;
        // loads
        self.op_functions[LB as usize] = Cpu::op_load::<1, true>;
        self.op_functions[LBU as usize] = Cpu::op_load::<1, false>;
        self.op_functions[LH as usize] = Cpu::op_load::<2, true>;
        self.op_functions[LHU as usize] = Cpu::op_load::<2, false>;
        self.op_functions[LW as usize] = Cpu::op_load::<4, true>;
        self.op_functions[LWU as usize] = Cpu::op_load::<4, false>;
        self.op_functions[LD as usize] = Cpu::op_load::<8, false>;
        // stores
        self.op_functions[SB as usize] = Cpu::op_store::<1>;
        self.op_functions[SH as usize] = Cpu::op_store::<2>;
        self.op_functions[SW as usize] = Cpu::op_store::<4>;
        self.op_functions[SD as usize] = Cpu::op_store::<8>;
        // unaligned loads/stores
        self.op_functions[LWL as usize] = Cpu::op_lwlr::<true>;
        self.op_functions[LWR as usize] = Cpu::op_lwlr::<false>;
        self.op_functions[LDL as usize] = Cpu::op_ldlr::<true>;
        self.op_functions[LDR as usize] = Cpu::op_ldlr::<false>;
        self.op_functions[SWL as usize] = Cpu::op_swlr::<true>;
        self.op_functions[SWR as usize] = Cpu::op_swlr::<false>;
        self.op_functions[SDL as usize] = Cpu::op_sdlr::<true>;
        self.op_functions[SDR as usize] = Cpu::op_sdlr::<false>;
        // load-linked / store-conditional
        self.op_functions[LL as usize] = Cpu::op_ll::<false>;
        self.op_functions[LLD as usize] = Cpu::op_ll::<true>;
        self.op_functions[SC as usize] = Cpu::op_sc::<false>;
        self.op_functions[SCD as usize] = Cpu::op_sc::<true>;
        // coprocessor 1 loads/stores
        self.op_functions[LWC1 as usize] = Cpu::op_lwc1;
        self.op_functions[LDC1 as usize] = Cpu::op_ldc1;
        self.op_functions[SWC1 as usize] = Cpu::op_swc1;
        self.op_functions[SDC1 as usize] = Cpu::op_sdc1;
    }

    // ======================= accessors =======================

    pub fn def(&self) -> &'static CpuTypeDef {
        self.def
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    pub fn cpu_id(&self) -> usize {
        self.cpu_id
    }

    pub fn get_pc(&self) -> u64 {
        self.pc
    }

    pub fn set_pc(&mut self, pc: u64) {
        self.pc = if self.def.is_32bit() { pc as i32 as i64 as u64 } else { pc };
    }

    pub fn get_hi(&self) -> u64 {
        self.hi
    }

    pub fn get_lo(&self) -> u64 {
        self.lo
    }

    pub fn set_hi(&mut self, value: u64) {
        self.hi = value;
    }

    pub fn set_lo(&mut self, value: u64) {
        self.lo = value;
    }

    /// Credit guest instructions executed outside of step() (translated
    /// code) to the retirement counter.
    pub fn add_instructions(&mut self, n: u64) {
        self.ninstrs += n;
    }

    /// Arm the delay-slot machinery so the next executed instruction is
    /// treated as the slot of a taken branch to `target`. Used when
    /// translated code hands a half-executed branch back to the
    /// interpreter.
    pub fn set_delayed_branch(&mut self, target: u64) {
        self.delay_slot = DelaySlotState::ToBeDelayed;
        self.delay_jmpaddr = if self.def.is_32bit() {
            target as i32 as i64 as u64
        } else {
            target
        };
    }

    /// Raise an exception for the instruction at `pc` outside of step().
    pub fn raise_exception_at(&mut self, bus: &mut Bus, exc: CpuException, pc: u64) {
        self.pc_last = pc;
        self.delay_slot = DelaySlotState::NotDelayed;
        self.nullify_next = false;
        self.raise_exception(bus, exc);
    }

    /// eret: leave exception or error level and drop any atomic
    /// reservation.
    pub fn do_eret(&mut self, bus: &mut Bus) {
        let new_pc = self.cop0.eret();
        self.set_pc(new_pc);
        self.rmw = false;
        bus.clear_ll_reservation(self.cpu_id);
        self.vaddr_maps_stale = true;
    }

    pub fn get_last_opcode(&self) -> u32 {
        self.last_opcode
    }

    pub fn instruction_count(&self) -> u64 {
        self.ninstrs
    }

    /// Address of the live load-linked reservation, if any.
    pub fn rmw_reservation(&self) -> Option<u64> {
        self.rmw.then_some(self.rmw_addr)
    }

    pub fn read_gpr(&self, reg: usize) -> u64 {
        self.gpr[reg]
    }

    pub fn write_gpr(&mut self, reg: usize, value: u64) {
        self.gpr[reg] = value;
        self.gpr[0] = 0;
    }

    pub fn get_registers(&self) -> &[u64; 32] {
        &self.gpr
    }

    /// Named register access for front-ends: "pc", "hi", "lo", "r0".."r31",
    /// the usual assembler aliases, and the COP0 names.
    pub fn reg_by_name(&self, name: &str) -> Option<u64> {
        match name {
            "pc" => return Some(self.pc),
            "hi" => return Some(self.hi),
            "lo" => return Some(self.lo),
            _ => {}
        }
        if let Some(i) = disassembler::gpr_index_by_name(name) {
            return Some(self.gpr[i]);
        }
        cop0::COP0_REGISTER_ALIASES
            .iter()
            .position(|alias| alias.trim_start_matches('$') == name.trim_start_matches('$'))
            .map(|i| self.cop0.read_register(i, 0))
    }

    pub fn set_reg_by_name(&mut self, name: &str, value: u64) -> bool {
        match name {
            "pc" => {
                self.set_pc(value);
                return true;
            }
            "hi" => {
                self.hi = value;
                return true;
            }
            "lo" => {
                self.lo = value;
                return true;
            }
            _ => {}
        }
        if let Some(i) = disassembler::gpr_index_by_name(name) {
            self.write_gpr(i, value);
            return true;
        }
        false
    }

    pub fn reset(&mut self) {
        self.pc = RESET_ADDRESS;
        self.pc_last = RESET_ADDRESS;
        self.gpr = [0; 32];
        self.hi = 0;
        self.lo = 0;
        self.delay_slot = DelaySlotState::NotDelayed;
        self.delay_jmpaddr = 0;
        self.nullify_next = false;
        self.rmw = false;
        self.cop0.reset();
        self.vaddr_maps_stale = true;
    }

    // ======================= dispatch =======================

    /// Execute exactly one instruction.
    pub fn step(&mut self, bus: &mut Bus) -> StepResult {
        if self.delay_slot == DelaySlotState::ExceptionInDelaySlot {
            self.delay_slot = DelaySlotState::NotDelayed;
        }
        self.pc_last = self.pc;

        // interrupt delivery happens between instructions
        if self.cop0.interrupt_pending() {
            self.raise_exception(bus, CpuException::Interrupt);
            return StepResult::Exception(CpuException::Interrupt);
        }

        if self.pc & 3 != 0 {
            let exc = CpuException::AddressErrorLoad(self.pc);
            self.raise_exception(bus, exc);
            return StepResult::Exception(exc);
        }

        let word = match self.fetch(bus) {
            Ok(word) => word,
            Err(exc) => {
                self.raise_exception(bus, exc);
                return StepResult::Exception(exc);
            }
        };
        self.last_opcode = word;
        self.ninstrs += 1;
        self.cop0.tick(1);

        // the instruction now executing is the delay slot of the branch
        // that retired last step
        if self.delay_slot == DelaySlotState::ToBeDelayed {
            self.delay_slot = DelaySlotState::Delayed;
        }

        if self.nullify_next {
            // annulled slot of an untaken likely branch
            self.nullify_next = false;
            self.advance_pc();
            return StepResult::Continued;
        }

        let i = Instruction(word);
        let opcode = Opcode::from_instruction(&i);
        if opcode == Opcode::UNKNOWN {
            debug!("unknown opcode {:#010x} at pc {:#018x}", word, self.pc);
            let exc = CpuException::ReservedInstruction(word);
            self.raise_exception(bus, exc);
            return StepResult::Exception(exc);
        }

        match self.op_functions[opcode as usize](self, bus, &i) {
            Ok(()) => {
                self.advance_pc();
                StepResult::Continued
            }
            Err(CpuException::WaitHalt) => {
                self.advance_pc();
                StepResult::Wait
            }
            Err(exc) => {
                self.raise_exception(bus, exc);
                StepResult::Exception(exc)
            }
        }
    }

    fn advance_pc(&mut self) {
        if self.pc_overridden {
            self.pc_overridden = false;
            self.delay_slot = DelaySlotState::NotDelayed;
        } else if self.delay_slot == DelaySlotState::Delayed {
            self.delay_slot = DelaySlotState::NotDelayed;
            self.pc = self.delay_jmpaddr;
        } else {
            self.pc = self.pc.wrapping_add(4);
        }
        if self.def.is_32bit() {
            self.pc = self.pc as i32 as i64 as u64;
        }
    }

    fn fetch(&mut self, bus: &mut Bus) -> Result<u32, CpuException> {
        let t = mmu::translate(&self.cop0, self.pc, Intent::Instr)?;
        let mut buf = [0u8; 4];
        bus.read_phys(t.paddr, &mut buf)
            .map_err(|_| CpuException::BusErrorFetch(self.pc))?;
        Ok(match self.byte_order {
            ByteOrder::Little => u32::from_le_bytes(buf),
            ByteOrder::Big => u32::from_be_bytes(buf),
        })
    }

    /// Vector an exception: update COP0 state and jump to the handler.
    pub fn raise_exception(&mut self, bus: &mut Bus, exc: CpuException) {
        let in_delay_slot = matches!(
            self.delay_slot,
            DelaySlotState::ToBeDelayed | DelaySlotState::Delayed
        ) || self.nullify_next;

        // a pending atomic sequence does not survive an exception
        self.rmw = false;
        bus.clear_ll_reservation(self.cpu_id);

        self.pc = self.cop0.do_exception(self.pc_last, in_delay_slot, &exc);
        if self.def.is_32bit() {
            self.pc = self.pc as i32 as i64 as u64;
        }

        self.delay_slot = if in_delay_slot {
            DelaySlotState::ExceptionInDelaySlot
        } else {
            DelaySlotState::NotDelayed
        };
        self.nullify_next = false;
        self.pc_overridden = false;
        // mode changed (EXL / mode stack): cached user mappings are stale
        self.vaddr_maps_stale = true;
    }

    // ======================= memory access =======================

    pub(crate) fn decode_int(&self, bytes: &[u8]) -> u64 {
        let mut v: u64 = 0;
        match self.byte_order {
            ByteOrder::Little => {
                for (i, b) in bytes.iter().enumerate() {
                    v |= (*b as u64) << (i * 8);
                }
            }
            ByteOrder::Big => {
                for b in bytes.iter() {
                    v = (v << 8) | *b as u64;
                }
            }
        }
        v
    }

    pub(crate) fn encode_int(&self, value: u64, bytes: &mut [u8]) {
        match self.byte_order {
            ByteOrder::Little => {
                for (i, b) in bytes.iter_mut().enumerate() {
                    *b = (value >> (i * 8)) as u8;
                }
            }
            ByteOrder::Big => {
                let n = bytes.len();
                for (i, b) in bytes.iter_mut().enumerate() {
                    *b = (value >> ((n - 1 - i) * 8)) as u8;
                }
            }
        }
    }

    fn read_mem(&mut self, bus: &mut Bus, vaddr: u64, len: usize) -> Result<u64, CpuException> {
        if self.cop0.cache_isolated() {
            return Ok(0);
        }
        let t = mmu::translate(&self.cop0, vaddr, Intent::Load)?;
        let mut buf = [0u8; 8];
        bus.read_phys(t.paddr, &mut buf[..len])
            .map_err(|_| CpuException::BusErrorData(vaddr))?;
        Ok(self.decode_int(&buf[..len]))
    }

    fn write_mem(
        &mut self,
        bus: &mut Bus,
        vaddr: u64,
        len: usize,
        value: u64,
    ) -> OperationResult {
        if self.cop0.cache_isolated() {
            // stores land in the isolated cache, not in memory
            return Ok(());
        }
        let t = mmu::translate(&self.cop0, vaddr, Intent::Store)?;
        let mut buf = [0u8; 8];
        self.encode_int(value, &mut buf[..len]);
        bus.write_phys(t.paddr, &buf[..len])
            .map_err(|_| CpuException::BusErrorData(vaddr))
    }

    #[inline(always)]
    fn effective_address(&self, instr: &Instruction) -> u64 {
        let addr = self.gpr[instr.rs()].wrapping_add(instr.signed_immediate16());
        if self.def.is_32bit() { addr as i32 as i64 as u64 } else { addr }
    }

    fn check_64bit_instr(&self, instr: &Instruction) -> OperationResult {
        if self.def.has_64bit_isa() {
            Ok(())
        } else {
            Err(CpuException::ReservedInstruction(instr.0))
        }
    }

    // ======================= no-op =======================

    fn op_nop(&mut self, _bus: &mut Bus, _instr: &Instruction) -> OperationResult {
        Ok(())
    }

    fn op_reserved(&mut self, _bus: &mut Bus, instr: &Instruction) -> OperationResult {
        Err(CpuException::ReservedInstruction(instr.0))
    }

    fn op_wait(&mut self, _bus: &mut Bus, _instr: &Instruction) -> OperationResult {
        Err(CpuException::WaitHalt)
    }

    // ======================= logical =======================

    #[inline(always)]
    fn op_logical<F, const IMMEDIATE: bool>(&mut self, instr: &Instruction, log: F)
    where
        F: Fn(u64, u64) -> u64,
    {
        let rs = self.gpr[instr.rs()];
        let rt = if IMMEDIATE {
            instr.unsigned_immediate16()
        } else {
            self.gpr[instr.rt()]
        };
        if IMMEDIATE {
            self.write_gpr(instr.rt(), log(rs, rt));
        } else {
            self.write_gpr(instr.rd(), log(rs, rt));
        }
    }

    fn op_and(&mut self, _bus: &mut Bus, instr: &Instruction) -> OperationResult {
        self.op_logical::<_, false>(instr, |a, b| a & b);
        Ok(())
    }
    fn op_or(&mut self, _bus: &mut Bus, instr: &Instruction) -> OperationResult {
        self.op_logical::<_, false>(instr, |a, b| a | b);
        Ok(())
    }
    fn op_xor(&mut self, _bus: &mut Bus, instr: &Instruction) -> OperationResult {
        self.op_logical::<_, false>(instr, |a, b| a ^ b);
        Ok(())
    }
    fn op_nor(&mut self, _bus: &mut Bus, instr: &Instruction) -> OperationResult {
        self.op_logical::<_, false>(instr, |a, b| !(a | b));
        Ok(())
    }
    fn op_andi(&mut self, _bus: &mut Bus, instr: &Instruction) -> OperationResult {
        self.op_logical::<_, true>(instr, |a, b| a & b);
        Ok(())
    }
    fn op_ori(&mut self, _bus: &mut Bus, instr: &Instruction) -> OperationResult {
        self.op_logical::<_, true>(instr, |a, b| a | b);
        Ok(())
    }
    fn op_xori(&mut self, _bus: &mut Bus, instr: &Instruction) -> OperationResult {
        self.op_logical::<_, true>(instr, |a, b| a ^ b);
        Ok(())
    }

    // lui rt,imm: the 32-bit value is sign-extended like every 32-bit result
    fn op_lui(&mut self, _bus: &mut Bus, instr: &Instruction) -> OperationResult {
        let imm = (instr.unsigned_immediate16() as u32) << 16;
        self.write_gpr(instr.rt(), imm as i32 as i64 as u64);
        Ok(())
    }

    // ======================= shifts =======================

    fn op_shift32<const LEFT: bool, const ARITHMETIC: bool, const IMMEDIATE: bool>(
        &mut self,
        _bus: &mut Bus,
        instr: &Instruction,
    ) -> OperationResult {
        let sa = if IMMEDIATE {
            instr.shift_amount()
        } else {
            self.gpr[instr.rs()] as u32 & 0x1f
        };
        let rt = self.gpr[instr.rt()] as u32;

        let result = if LEFT {
            rt << sa
        } else if ARITHMETIC {
            ((rt as i32) >> sa) as u32
        } else {
            rt >> sa
        };
        self.write_gpr(instr.rd(), result as i32 as i64 as u64);
        Ok(())
    }

    fn op_shift64<
        const LEFT: bool,
        const ARITHMETIC: bool,
        const IMMEDIATE: bool,
        const PLUS32: bool,
    >(
        &mut self,
        _bus: &mut Bus,
        instr: &Instruction,
    ) -> OperationResult {
        self.check_64bit_instr(instr)?;
        let sa = if IMMEDIATE {
            instr.shift_amount() + if PLUS32 { 32 } else { 0 }
        } else {
            self.gpr[instr.rs()] as u32 & 0x3f
        };
        let rt = self.gpr[instr.rt()];

        let result = if LEFT {
            rt << sa
        } else if ARITHMETIC {
            ((rt as i64) >> sa) as u64
        } else {
            rt >> sa
        };
        self.write_gpr(instr.rd(), result);
        Ok(())
    }

    // ======================= compare =======================

    fn op_compare<const SIGNED: bool, const IMMEDIATE: bool>(
        &mut self,
        _bus: &mut Bus,
        instr: &Instruction,
    ) -> OperationResult {
        let rs = self.gpr[instr.rs()];
        let rt = if IMMEDIATE {
            instr.signed_immediate16()
        } else {
            self.gpr[instr.rt()]
        };
        let result = if SIGNED {
            ((rs as i64) < (rt as i64)) as u64
        } else {
            (rs < rt) as u64
        };
        if IMMEDIATE {
            self.write_gpr(instr.rt(), result);
        } else {
            self.write_gpr(instr.rd(), result);
        }
        Ok(())
    }

    // ======================= add / sub =======================

    /*
    add/sub with and without the overflow trap. The 32-bit forms compute
    in 32 bits and sign-extend the result; the trapping forms leave the
    destination untouched and raise Ov on overflow.
    */
    fn op_arithmetic<
        const ADD: bool,
        const WITH_OVERFLOW: bool,
        const IMMEDIATE: bool,
        const DOUBLE: bool,
    >(
        &mut self,
        _bus: &mut Bus,
        instr: &Instruction,
    ) -> OperationResult {
        if DOUBLE {
            self.check_64bit_instr(instr)?;
        }
        let rs = self.gpr[instr.rs()];
        let rt = if IMMEDIATE {
            instr.signed_immediate16()
        } else {
            self.gpr[instr.rt()]
        };

        let result = if DOUBLE {
            let (a, b) = (rs as i64, rt as i64);
            if WITH_OVERFLOW {
                let checked = if ADD { a.checked_add(b) } else { a.checked_sub(b) };
                match checked {
                    Some(v) => v as u64,
                    None => return Err(CpuException::ArithmeticOverflow),
                }
            } else if ADD {
                a.wrapping_add(b) as u64
            } else {
                a.wrapping_sub(b) as u64
            }
        } else {
            let (a, b) = (rs as i32, rt as i32);
            if WITH_OVERFLOW {
                let checked = if ADD { a.checked_add(b) } else { a.checked_sub(b) };
                match checked {
                    Some(v) => v as i64 as u64,
                    None => return Err(CpuException::ArithmeticOverflow),
                }
            } else if ADD {
                a.wrapping_add(b) as i64 as u64
            } else {
                a.wrapping_sub(b) as i64 as u64
            }
        };

        if IMMEDIATE {
            self.write_gpr(instr.rt(), result);
        } else {
            self.write_gpr(instr.rd(), result);
        }
        Ok(())
    }

    // ======================= hi/lo, multiply, divide =======================

    fn op_mf_lohi<const LO: bool>(&mut self, _bus: &mut Bus, instr: &Instruction) -> OperationResult {
        let v = if LO { self.lo } else { self.hi };
        self.write_gpr(instr.rd(), v);
        Ok(())
    }

    fn op_mt_lohi<const LO: bool>(&mut self, _bus: &mut Bus, instr: &Instruction) -> OperationResult {
        let v = self.gpr[instr.rs()];
        if LO {
            self.lo = v;
        } else {
            self.hi = v;
        }
        Ok(())
    }

    fn op_mult<const SIGNED: bool>(&mut self, _bus: &mut Bus, instr: &Instruction) -> OperationResult {
        let result = if SIGNED {
            (self.gpr[instr.rs()] as i32 as i64) * (self.gpr[instr.rt()] as i32 as i64)
        } else {
            ((self.gpr[instr.rs()] as u32 as u64) * (self.gpr[instr.rt()] as u32 as u64)) as i64
        };
        self.lo = result as i32 as i64 as u64;
        self.hi = (result >> 32) as i32 as i64 as u64;
        // R5900 quirk: MULT additionally writes rd
        if self.def.flags & FLAG_R5900_MULT_RD != 0 && instr.rd() != 0 {
            self.write_gpr(instr.rd(), self.lo);
        }
        Ok(())
    }

    fn op_dmult<const SIGNED: bool>(&mut self, _bus: &mut Bus, instr: &Instruction) -> OperationResult {
        self.check_64bit_instr(instr)?;
        let product = if SIGNED {
            ((self.gpr[instr.rs()] as i64 as i128) * (self.gpr[instr.rt()] as i64 as i128)) as u128
        } else {
            (self.gpr[instr.rs()] as u128) * (self.gpr[instr.rt()] as u128)
        };
        self.lo = product as u64;
        self.hi = (product >> 64) as u64;
        Ok(())
    }

    // divide by zero leaves HI/LO cleared
    fn op_div<const SIGNED: bool>(&mut self, _bus: &mut Bus, instr: &Instruction) -> OperationResult {
        if SIGNED {
            let rs = self.gpr[instr.rs()] as i32;
            let rt = self.gpr[instr.rt()] as i32;
            if rt == 0 {
                self.lo = 0;
                self.hi = 0;
            } else {
                self.lo = rs.wrapping_div(rt) as i64 as u64;
                self.hi = rs.wrapping_rem(rt) as i64 as u64;
            }
        } else {
            let rs = self.gpr[instr.rs()] as u32;
            let rt = self.gpr[instr.rt()] as u32;
            if rt == 0 {
                self.lo = 0;
                self.hi = 0;
            } else {
                self.lo = (rs / rt) as i32 as i64 as u64;
                self.hi = (rs % rt) as i32 as i64 as u64;
            }
        }
        Ok(())
    }

    fn op_ddiv<const SIGNED: bool>(&mut self, _bus: &mut Bus, instr: &Instruction) -> OperationResult {
        self.check_64bit_instr(instr)?;
        if SIGNED {
            let rs = self.gpr[instr.rs()] as i64;
            let rt = self.gpr[instr.rt()] as i64;
            if rt == 0 {
                self.lo = 0;
                self.hi = 0;
            } else {
                self.lo = rs.wrapping_div(rt) as u64;
                self.hi = rs.wrapping_rem(rt) as u64;
            }
        } else {
            let rs = self.gpr[instr.rs()];
            let rt = self.gpr[instr.rt()];
            if rt == 0 {
                self.lo = 0;
                self.hi = 0;
            } else {
                self.lo = rs / rt;
                self.hi = rs % rt;
            }
        }
        Ok(())
    }

    fn op_mul_special2(&mut self, _bus: &mut Bus, instr: &Instruction) -> OperationResult {
        let result = (self.gpr[instr.rs()] as i32).wrapping_mul(self.gpr[instr.rt()] as i32);
        self.write_gpr(instr.rd(), result as i64 as u64);
        Ok(())
    }

    fn op_madd<const SIGNED: bool, const SUBTRACT: bool>(
        &mut self,
        _bus: &mut Bus,
        instr: &Instruction,
    ) -> OperationResult {
        let acc = ((self.hi as u32 as u64) << 32) | self.lo as u32 as u64;
        let product = if SIGNED {
            ((self.gpr[instr.rs()] as i32 as i64) * (self.gpr[instr.rt()] as i32 as i64)) as u64
        } else {
            (self.gpr[instr.rs()] as u32 as u64) * (self.gpr[instr.rt()] as u32 as u64)
        };
        let result = if SUBTRACT {
            acc.wrapping_sub(product)
        } else {
            acc.wrapping_add(product)
        };
        self.lo = result as i32 as i64 as u64;
        self.hi = (result >> 32) as i32 as i64 as u64;
        Ok(())
    }

    fn op_count_bits<const ONES: bool, const DOUBLE: bool>(
        &mut self,
        _bus: &mut Bus,
        instr: &Instruction,
    ) -> OperationResult {
        if DOUBLE {
            self.check_64bit_instr(instr)?;
        }
        let rs = self.gpr[instr.rs()];
        let count = if DOUBLE {
            if ONES { rs.leading_ones() } else { rs.leading_zeros() }
        } else {
            let v = rs as u32;
            if ONES { v.leading_ones() } else { v.leading_zeros() }
        };
        self.write_gpr(instr.rd(), count as u64);
        Ok(())
    }

    // ======================= conditional moves =======================

    fn op_movcond<const ON_ZERO: bool>(&mut self, _bus: &mut Bus, instr: &Instruction) -> OperationResult {
        let rt = self.gpr[instr.rt()];
        if (rt == 0) == ON_ZERO {
            let rs = self.gpr[instr.rs()];
            self.write_gpr(instr.rd(), rs);
        }
        Ok(())
    }

    // ======================= traps =======================

    #[inline(always)]
    fn trap_operands<const IMMEDIATE: bool>(&self, instr: &Instruction) -> (u64, u64) {
        let rs = self.gpr[instr.rs()];
        let rt = if IMMEDIATE {
            instr.signed_immediate16()
        } else {
            self.gpr[instr.rt()]
        };
        (rs, rt)
    }

    fn op_trap_ge<const SIGNED: bool, const IMMEDIATE: bool>(
        &mut self,
        _bus: &mut Bus,
        instr: &Instruction,
    ) -> OperationResult {
        let (rs, rt) = self.trap_operands::<IMMEDIATE>(instr);
        let cond = if SIGNED { rs as i64 >= rt as i64 } else { rs >= rt };
        if cond { Err(CpuException::Trap) } else { Ok(()) }
    }

    fn op_trap_lt<const SIGNED: bool, const IMMEDIATE: bool>(
        &mut self,
        _bus: &mut Bus,
        instr: &Instruction,
    ) -> OperationResult {
        let (rs, rt) = self.trap_operands::<IMMEDIATE>(instr);
        let cond = if SIGNED { (rs as i64) < rt as i64 } else { rs < rt };
        if cond { Err(CpuException::Trap) } else { Ok(()) }
    }

    fn op_trap_eq<const _S: bool, const IMMEDIATE: bool>(
        &mut self,
        _bus: &mut Bus,
        instr: &Instruction,
    ) -> OperationResult {
        let (rs, rt) = self.trap_operands::<IMMEDIATE>(instr);
        if rs == rt { Err(CpuException::Trap) } else { Ok(()) }
    }

    fn op_trap_ne<const IMMEDIATE: bool>(
        &mut self,
        _bus: &mut Bus,
        instr: &Instruction,
    ) -> OperationResult {
        let (rs, rt) = self.trap_operands::<IMMEDIATE>(instr);
        if rs != rt { Err(CpuException::Trap) } else { Ok(()) }
    }

    // ======================= branches =======================

    /*
    target = pc_of_branch + 4 + (sign-extended offset << 2). A taken branch
    arms the delay-slot machinery; an untaken likely branch annuls the slot.
    Linking writes pc+8 unconditionally.
    */
    #[inline(always)]
    fn op_branch<F, const LIKELY: bool, const LINK: bool>(&mut self, instr: &Instruction, cond: F)
    where
        F: Fn(u64, u64) -> bool,
    {
        let rs = self.gpr[instr.rs()];
        let rt = self.gpr[instr.rt()];
        if LINK {
            self.write_gpr(31, self.pc.wrapping_add(8));
        }
        if cond(rs, rt) {
            self.arm_branch(self.pc.wrapping_add(4).wrapping_add(instr.signed_immediate16() << 2));
        } else if LIKELY {
            self.nullify_next = true;
        }
    }

    fn arm_branch(&mut self, target: u64) {
        if self.delay_slot == DelaySlotState::Delayed {
            // branch in a delay slot: architecturally undefined
            warn!("branch inside a delay slot at pc {:#018x}", self.pc);
        }
        self.delay_slot = DelaySlotState::ToBeDelayed;
        self.delay_jmpaddr = if self.def.is_32bit() {
            target as i32 as i64 as u64
        } else {
            target
        };
    }

    fn op_beq<const LIKELY: bool>(&mut self, _bus: &mut Bus, instr: &Instruction) -> OperationResult {
        self.op_branch::<_, LIKELY, false>(instr, |a, b| a == b);
        Ok(())
    }
    fn op_bne<const LIKELY: bool>(&mut self, _bus: &mut Bus, instr: &Instruction) -> OperationResult {
        self.op_branch::<_, LIKELY, false>(instr, |a, b| a != b);
        Ok(())
    }
    fn op_blez<const LIKELY: bool>(&mut self, _bus: &mut Bus, instr: &Instruction) -> OperationResult {
        self.op_branch::<_, LIKELY, false>(instr, |a, _| (a as i64) <= 0);
        Ok(())
    }
    fn op_bgtz<const LIKELY: bool>(&mut self, _bus: &mut Bus, instr: &Instruction) -> OperationResult {
        self.op_branch::<_, LIKELY, false>(instr, |a, _| (a as i64) > 0);
        Ok(())
    }
    fn op_bltz<const LIKELY: bool, const LINK: bool>(
        &mut self,
        _bus: &mut Bus,
        instr: &Instruction,
    ) -> OperationResult {
        self.op_branch::<_, LIKELY, LINK>(instr, |a, _| (a as i64) < 0);
        Ok(())
    }
    fn op_bgez<const LIKELY: bool, const LINK: bool>(
        &mut self,
        _bus: &mut Bus,
        instr: &Instruction,
    ) -> OperationResult {
        self.op_branch::<_, LIKELY, LINK>(instr, |a, _| (a as i64) >= 0);
        Ok(())
    }

    // j/jal: the target shares the upper bits of the delay slot's pc
    fn op_j<const LINK: bool>(&mut self, _bus: &mut Bus, instr: &Instruction) -> OperationResult {
        let target = (self.pc.wrapping_add(4) & !0x0fff_ffff) | (instr.imm26() << 2);
        if LINK {
            self.write_gpr(31, self.pc.wrapping_add(8));
        }
        self.arm_branch(target);
        Ok(())
    }

    fn op_jr(&mut self, _bus: &mut Bus, instr: &Instruction) -> OperationResult {
        let target = self.gpr[instr.rs()];
        self.arm_branch(target);
        Ok(())
    }

    fn op_jalr(&mut self, _bus: &mut Bus, instr: &Instruction) -> OperationResult {
        let target = self.gpr[instr.rs()];
        self.write_gpr(instr.rd(), self.pc.wrapping_add(8));
        self.arm_branch(target);
        Ok(())
    }

    // ======================= syscall / break =======================

    fn op_syscall(&mut self, _bus: &mut Bus, _instr: &Instruction) -> OperationResult {
        Err(CpuException::Syscall)
    }

    fn op_break(&mut self, _bus: &mut Bus, _instr: &Instruction) -> OperationResult {
        Err(CpuException::Breakpoint)
    }

    // ======================= loads and stores =======================

    fn op_load<const N: usize, const SIGNED: bool>(
        &mut self,
        bus: &mut Bus,
        instr: &Instruction,
    ) -> OperationResult {
        if N == 8 {
            self.check_64bit_instr(instr)?;
        }
        let vaddr = self.effective_address(instr);
        if vaddr & (N as u64 - 1) != 0 {
            return Err(CpuException::AddressErrorLoad(vaddr));
        }
        let raw = self.read_mem(bus, vaddr, N)?;
        let value = if SIGNED {
            match N {
                1 => raw as i8 as i64 as u64,
                2 => raw as i16 as i64 as u64,
                4 => raw as i32 as i64 as u64,
                _ => raw,
            }
        } else {
            raw
        };
        self.write_gpr(instr.rt(), value);
        Ok(())
    }

    fn op_store<const N: usize>(&mut self, bus: &mut Bus, instr: &Instruction) -> OperationResult {
        if N == 8 {
            self.check_64bit_instr(instr)?;
        }
        let vaddr = self.effective_address(instr);
        if vaddr & (N as u64 - 1) != 0 {
            return Err(CpuException::AddressErrorStore(vaddr));
        }
        let value = self.gpr[instr.rt()];
        self.write_mem(bus, vaddr, N, value)
    }

    /*
    lwl/lwr: read the aligned word containing the addressed byte and merge
    the selected bytes into rt. The byte selection mirrors between the two
    endiannesses; the merged 32-bit value is sign-extended.
    */
    fn op_lwlr<const LEFT: bool>(&mut self, bus: &mut Bus, instr: &Instruction) -> OperationResult {
        let vaddr = self.effective_address(instr);
        let aligned = vaddr & !3;
        let word = self.read_mem(bus, aligned, 4)? as u32;
        let cur = self.gpr[instr.rt()] as u32;

        let mut offset = (vaddr & 3) as u32;
        if self.byte_order == ByteOrder::Big {
            offset = 3 - offset;
        }
        let value = if LEFT {
            let keep = 0x00ff_ffffu32 >> (8 * offset);
            (cur & keep) | (word << (24 - 8 * offset))
        } else {
            let keep = if offset == 0 { 0 } else { !0u32 << (32 - 8 * offset) };
            (cur & keep) | (word >> (8 * offset))
        };
        self.write_gpr(instr.rt(), value as i32 as i64 as u64);
        Ok(())
    }

    fn op_ldlr<const LEFT: bool>(&mut self, bus: &mut Bus, instr: &Instruction) -> OperationResult {
        self.check_64bit_instr(instr)?;
        let vaddr = self.effective_address(instr);
        let aligned = vaddr & !7;
        let dword = self.read_mem(bus, aligned, 8)?;
        let cur = self.gpr[instr.rt()];

        let mut offset = (vaddr & 7) as u32;
        if self.byte_order == ByteOrder::Big {
            offset = 7 - offset;
        }
        let value = if LEFT {
            let keep = 0x00ff_ffff_ffff_ffffu64 >> (8 * offset);
            (cur & keep) | (dword << (56 - 8 * offset))
        } else {
            let keep = if offset == 0 { 0 } else { !0u64 << (64 - 8 * offset) };
            (cur & keep) | (dword >> (8 * offset))
        };
        self.write_gpr(instr.rt(), value);
        Ok(())
    }

    fn op_swlr<const LEFT: bool>(&mut self, bus: &mut Bus, instr: &Instruction) -> OperationResult {
        let vaddr = self.effective_address(instr);
        let aligned = vaddr & !3;
        let word = self.read_mem(bus, aligned, 4)? as u32;
        let rt = self.gpr[instr.rt()] as u32;

        let mut offset = (vaddr & 3) as u32;
        if self.byte_order == ByteOrder::Big {
            offset = 3 - offset;
        }
        let merged = if LEFT {
            let keep = if offset == 3 { 0 } else { !0u32 << (8 * (offset + 1)) };
            (word & keep) | (rt >> (24 - 8 * offset))
        } else {
            let keep = if offset == 0 { 0 } else { !0u32 >> (32 - 8 * offset) };
            (word & keep) | (rt << (8 * offset))
        };
        self.write_mem(bus, aligned, 4, merged as u64)
    }

    fn op_sdlr<const LEFT: bool>(&mut self, bus: &mut Bus, instr: &Instruction) -> OperationResult {
        self.check_64bit_instr(instr)?;
        let vaddr = self.effective_address(instr);
        let aligned = vaddr & !7;
        let dword = self.read_mem(bus, aligned, 8)?;
        let rt = self.gpr[instr.rt()];

        let mut offset = (vaddr & 7) as u32;
        if self.byte_order == ByteOrder::Big {
            offset = 7 - offset;
        }
        let merged = if LEFT {
            let keep = if offset == 7 { 0 } else { !0u64 << (8 * (offset + 1)) };
            (dword & keep) | (rt >> (56 - 8 * offset))
        } else {
            let keep = if offset == 0 { 0 } else { !0u64 >> (64 - 8 * offset) };
            (dword & keep) | (rt << (8 * offset))
        };
        self.write_mem(bus, aligned, 8, merged)
    }

    // ======================= ll/sc =======================

    fn op_ll<const DOUBLE: bool>(&mut self, bus: &mut Bus, instr: &Instruction) -> OperationResult {
        if !self.def.has_llsc() {
            return Err(CpuException::ReservedInstruction(instr.0));
        }
        if DOUBLE {
            self.check_64bit_instr(instr)?;
        }
        let n = if DOUBLE { 8 } else { 4 };
        let vaddr = self.effective_address(instr);
        if vaddr & (n as u64 - 1) != 0 {
            return Err(CpuException::AddressErrorLoad(vaddr));
        }
        let t = mmu::translate(&self.cop0, vaddr, Intent::Load)?;
        let mut buf = [0u8; 8];
        bus.read_phys(t.paddr, &mut buf[..n])
            .map_err(|_| CpuException::BusErrorData(vaddr))?;
        let raw = self.decode_int(&buf[..n]);
        let value = if DOUBLE { raw } else { raw as i32 as i64 as u64 };
        self.write_gpr(instr.rt(), value);

        self.rmw = true;
        self.rmw_addr = vaddr;
        self.cop0.reg[cop0::COP0_LLADDR] = t.paddr >> 4;
        bus.set_ll_reservation(self.cpu_id, t.paddr);
        Ok(())
    }

    /*
    sc succeeds only when the reservation from the matching ll is still
    intact; rt reports 1/0 and memory is written exactly on success.
    */
    fn op_sc<const DOUBLE: bool>(&mut self, bus: &mut Bus, instr: &Instruction) -> OperationResult {
        if !self.def.has_llsc() {
            return Err(CpuException::ReservedInstruction(instr.0));
        }
        if DOUBLE {
            self.check_64bit_instr(instr)?;
        }
        let n = if DOUBLE { 8 } else { 4 };
        let vaddr = self.effective_address(instr);
        if vaddr & (n as u64 - 1) != 0 {
            return Err(CpuException::AddressErrorStore(vaddr));
        }
        // address faults are raised whether or not the reservation holds
        let t = mmu::translate(&self.cop0, vaddr, Intent::Store)?;

        let success = self.rmw && bus.take_ll_reservation(self.cpu_id);
        self.rmw = false;
        if success {
            let mut buf = [0u8; 8];
            self.encode_int(self.gpr[instr.rt()], &mut buf[..n]);
            bus.write_phys(t.paddr, &buf[..n])
                .map_err(|_| CpuException::BusErrorData(vaddr))?;
        }
        self.write_gpr(instr.rt(), success as u64);
        Ok(())
    }

    // ======================= coprocessor 0 =======================

    fn check_cop0_usable(&self) -> OperationResult {
        if self.cop0.is_coprocessor_usable(0) {
            Ok(())
        } else {
            Err(CpuException::CoprocessorUnusable(0))
        }
    }

    fn op_mfc0<const DOUBLE: bool>(&mut self, _bus: &mut Bus, instr: &Instruction) -> OperationResult {
        self.check_cop0_usable()?;
        let v = self.cop0.read_register(instr.rd(), instr.sel());
        let v = if DOUBLE { v } else { v as i32 as i64 as u64 };
        self.write_gpr(instr.rt(), v);
        Ok(())
    }

    fn op_mtc0<const DOUBLE: bool>(&mut self, _bus: &mut Bus, instr: &Instruction) -> OperationResult {
        self.check_cop0_usable()?;
        let v = self.gpr[instr.rt()];
        let effect = self.cop0.write_register(instr.rd(), instr.sel(), v, DOUBLE);
        if effect.unimplemented {
            return Err(CpuException::CoprocessorUnusable(0));
        }
        if effect.asid_changed || effect.mode_changed || effect.tlb_changed {
            self.vaddr_maps_stale = true;
        }
        Ok(())
    }

    fn op_tlb(&mut self, _bus: &mut Bus, instr: &Instruction) -> OperationResult {
        self.check_cop0_usable()?;
        match instr.function() {
            0x01 => self.cop0.tlbr(),
            0x02 => {
                self.cop0.tlbwi();
                self.vaddr_maps_stale = true;
            }
            0x06 => {
                self.cop0.tlbwr();
                self.vaddr_maps_stale = true;
            }
            0x08 => self.cop0.tlbp(),
            _ => return Err(CpuException::ReservedInstruction(instr.0)),
        }
        Ok(())
    }

    fn op_eret(&mut self, bus: &mut Bus, _instr: &Instruction) -> OperationResult {
        self.check_cop0_usable()?;
        self.do_eret(bus);
        self.pc_overridden = true;
        Ok(())
    }

    fn op_rfe(&mut self, _bus: &mut Bus, _instr: &Instruction) -> OperationResult {
        self.check_cop0_usable()?;
        self.cop0.rfe();
        self.vaddr_maps_stale = true;
        Ok(())
    }

    // ======================= coprocessor 1 =======================

    fn check_cop1_usable(&self) -> OperationResult {
        if !self.def.has_fpu() || !self.cop0.is_coprocessor_usable(1) {
            Err(CpuException::CoprocessorUnusable(1))
        } else {
            Ok(())
        }
    }

    fn op_mfc1<const DOUBLE: bool>(&mut self, _bus: &mut Bus, instr: &Instruction) -> OperationResult {
        self.check_cop1_usable()?;
        let v = if DOUBLE {
            self.cop1.read_fpr64(self.cop0.status_fr(), instr.fs())
        } else {
            self.cop1.read_fpr32(instr.fs()) as i32 as i64 as u64
        };
        self.write_gpr(instr.rt(), v);
        Ok(())
    }

    fn op_mtc1<const DOUBLE: bool>(&mut self, _bus: &mut Bus, instr: &Instruction) -> OperationResult {
        self.check_cop1_usable()?;
        let v = self.gpr[instr.rt()];
        if DOUBLE {
            self.cop1.write_fpr64(self.cop0.status_fr(), instr.fs(), v);
        } else {
            self.cop1.write_fpr32(instr.fs(), v as u32);
        }
        Ok(())
    }

    fn op_cfc1(&mut self, _bus: &mut Bus, instr: &Instruction) -> OperationResult {
        self.check_cop1_usable()?;
        let v = self.cop1.read_control(instr.fs());
        self.write_gpr(instr.rt(), v as i32 as i64 as u64);
        Ok(())
    }

    fn op_ctc1(&mut self, _bus: &mut Bus, instr: &Instruction) -> OperationResult {
        self.check_cop1_usable()?;
        self.cop1.write_control(instr.fs(), self.gpr[instr.rt()] as u32);
        Ok(())
    }

    // bc1f/bc1t and the likely forms: rt bit 0 selects the sense,
    // bit 1 the likely variant, rt bits 4..2 the condition code.
    fn op_bc1(&mut self, _bus: &mut Bus, instr: &Instruction) -> OperationResult {
        self.check_cop1_usable()?;
        let rt = instr.rt();
        let want_true = rt & 1 != 0;
        let likely = rt & 2 != 0;
        let cc = rt >> 2;
        let cond = self.cop1.condition(cc);
        if cond == want_true {
            self.arm_branch(self.pc.wrapping_add(4).wrapping_add(instr.signed_immediate16() << 2));
        } else if likely {
            self.nullify_next = true;
        }
        Ok(())
    }

    fn op_fpu(&mut self, _bus: &mut Bus, instr: &Instruction) -> OperationResult {
        self.check_cop1_usable()?;
        let fr = self.cop0.status_fr();
        self.cop1.execute(fr, instr)
    }

    fn op_lwc1(&mut self, bus: &mut Bus, instr: &Instruction) -> OperationResult {
        self.check_cop1_usable()?;
        let vaddr = self.effective_address(instr);
        if vaddr & 3 != 0 {
            return Err(CpuException::AddressErrorLoad(vaddr));
        }
        let v = self.read_mem(bus, vaddr, 4)? as u32;
        self.cop1.write_fpr32(instr.ft(), v);
        Ok(())
    }

    fn op_ldc1(&mut self, bus: &mut Bus, instr: &Instruction) -> OperationResult {
        self.check_cop1_usable()?;
        let vaddr = self.effective_address(instr);
        if vaddr & 7 != 0 {
            return Err(CpuException::AddressErrorLoad(vaddr));
        }
        let v = self.read_mem(bus, vaddr, 8)?;
        self.cop1.write_fpr64(self.cop0.status_fr(), instr.ft(), v);
        Ok(())
    }

    fn op_swc1(&mut self, bus: &mut Bus, instr: &Instruction) -> OperationResult {
        self.check_cop1_usable()?;
        let vaddr = self.effective_address(instr);
        if vaddr & 3 != 0 {
            return Err(CpuException::AddressErrorStore(vaddr));
        }
        let v = self.cop1.read_fpr32(instr.ft()) as u64;
        self.write_mem(bus, vaddr, 4, v)
    }

    fn op_sdc1(&mut self, bus: &mut Bus, instr: &Instruction) -> OperationResult {
        self.check_cop1_usable()?;
        let vaddr = self.effective_address(instr);
        if vaddr & 7 != 0 {
            return Err(CpuException::AddressErrorStore(vaddr));
        }
        let v = self.cop1.read_fpr64(self.cop0.status_fr(), instr.ft());
        self.write_mem(bus, vaddr, 8, v)
    }

    // coprocessors 2/3: nothing is attached
    fn op_copz(&mut self, _bus: &mut Bus, instr: &Instruction) -> OperationResult {
        let nr = (instr.op() & 3) as usize;
        if self.cop0.is_coprocessor_usable(nr) {
            Err(CpuException::ReservedInstruction(instr.0))
        } else {
            Err(CpuException::CoprocessorUnusable(nr))
        }
    }
}

impl InterruptController for Cpu {
    fn assert_irq(&mut self, n: u8) {
        self.cop0.assert_irq(n);
    }

    fn deassert_irq(&mut self, n: u8) {
        self.cop0.deassert_irq(n);
    }
}

#[cfg(test)]
mod tests;
