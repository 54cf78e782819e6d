use crate::core::cpu::cop0::Cop0;
use crate::core::cpu::mmu::{self, Intent};
use crate::core::cpu::Cpu;
use crate::core::dyntrans::chunk::{self, AluImmKind, AluRegKind, ChunkOp, LoadKind, ShiftKind};
use crate::core::dyntrans::TranslationCache;
use crate::core::memory::bus::Bus;

/*
Chunk execution.

run() enters translated code at the CPU's pc and keeps chaining from block
to block until something needs the dispatch loop: the fuel budget ran out,
an access needs the slow path, or a store invalidated translated code.
Loads and stores resolve their addresses through a two-level table of
cached virtual-page mappings; everything the table cannot serve exits to
the interpreter, which replays the instruction with full fault semantics.

There is no pre-emption inside a chunk: fuel is only checked at block
edges, which bounds interrupt latency at one block.
*/

/// Fuel ceiling per entry; keeps interrupt latency bounded.
pub const N_SAFE_DYNTRANS_LIMIT: u64 = 8192;

/// Why translated code gave control back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkExit {
    /// Chained to a pc with no usable translation.
    Ok,
    /// Instruction budget exhausted.
    Fuel,
    /// The instruction at pc needs the interpreter (fault or slow path);
    /// it has not been executed.
    Fault,
    /// A store hit translated code (or another side effect committed);
    /// pc is past the completed instruction.
    SideEffect,
}

const FLAG_VALID: u8 = 1;
const FLAG_WRITABLE: u8 = 2;

#[derive(Clone, Copy)]
struct VaddrEntry {
    paddr_page: u64,
    flags: u8,
}

const EMPTY_ENTRY: VaddrEntry = VaddrEntry { paddr_page: 0, flags: 0 };

struct VaddrTable {
    entries: [VaddrEntry; 1024],
}

/// Two-level cache of virtual page mappings for 32-bit addresses,
/// indexed by the top and middle 10 bits of the page number. Only plain
/// RAM pages are entered; empty top-level slots stay unallocated.
pub struct VaddrCache {
    tables: Vec<Option<Box<VaddrTable>>>,
}

impl VaddrCache {
    pub fn new() -> Self {
        VaddrCache {
            tables: (0..1024).map(|_| None).collect(),
        }
    }

    pub fn clear(&mut self) {
        for t in self.tables.iter_mut() {
            *t = None;
        }
    }

    fn lookup(&self, vaddr: u64) -> Option<(u64, bool)> {
        let va = vaddr as u32;
        let table = self.tables[(va >> 22) as usize].as_ref()?;
        let e = table.entries[(va as usize >> 12) & 0x3ff];
        if e.flags & FLAG_VALID != 0 {
            Some((e.paddr_page, e.flags & FLAG_WRITABLE != 0))
        } else {
            None
        }
    }

    fn insert(&mut self, vaddr: u64, paddr_page: u64, writable: bool) {
        let va = vaddr as u32;
        let table = self.tables[(va >> 22) as usize]
            .get_or_insert_with(|| Box::new(VaddrTable { entries: [EMPTY_ENTRY; 1024] }));
        table.entries[(va as usize >> 12) & 0x3ff] = VaddrEntry {
            paddr_page,
            flags: FLAG_VALID | if writable { FLAG_WRITABLE } else { 0 },
        };
    }
}

impl Default for VaddrCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve a virtual address for translated code. Only addresses the
/// fast path can fully handle are returned; everything else (faults,
/// device ranges without direct buffers) goes back to the interpreter.
fn resolve(
    cop0: &Cop0,
    bus: &Bus,
    vcache: &mut VaddrCache,
    vaddr: u64,
    intent: Intent,
) -> Option<(u64, bool)> {
    let compat32 = vaddr as i32 as i64 as u64 == vaddr;
    if compat32 {
        if let Some((paddr_page, writable)) = vcache.lookup(vaddr) {
            if intent == Intent::Store && !writable {
                return None;
            }
            return Some((paddr_page | (vaddr & 0xfff), writable));
        }
    }
    let t = mmu::translate(cop0, vaddr, intent).ok()?;
    let paddr_page = t.paddr & !0xfff;
    if bus.page_is_pure_ram(paddr_page) {
        if compat32 {
            vcache.insert(vaddr, paddr_page, t.writable);
        }
        Some((t.paddr, t.writable))
    } else if bus.page_is_direct_ok(paddr_page, intent == Intent::Store) {
        // direct device buffers (frame buffers) are served without a
        // callback; never cached, so watermark updates stay precise
        Some((t.paddr, t.writable))
    } else {
        None
    }
}

fn exit_replay(
    cpu: &mut Cpu,
    pc: u64,
    in_slot: bool,
    branch_target: Option<u64>,
    executed: u64,
) -> (u64, ChunkExit) {
    if in_slot {
        if let Some(target) = branch_target {
            cpu.set_delayed_branch(target);
        }
    }
    cpu.set_pc(pc);
    (executed, ChunkExit::Fault)
}

/// Enter translated code at the CPU's pc. Returns the number of guest
/// instructions executed and the exit reason.
pub fn run(
    cpu: &mut Cpu,
    bus: &mut Bus,
    cache: &mut TranslationCache,
    vcache: &mut VaddrCache,
    fuel: u64,
) -> (u64, ChunkExit) {
    let mut executed: u64 = 0;
    let fuel = fuel.min(N_SAFE_DYNTRANS_LIMIT);

    'outer: loop {
        if cpu.vaddr_maps_stale {
            vcache.clear();
            cpu.vaddr_maps_stale = false;
        }

        let entry_pc = cpu.get_pc();
        if entry_pc & 3 != 0 {
            return (executed, ChunkExit::Ok);
        }
        let Some((entry_paddr, _)) = resolve(&cpu.cop0, bus, vcache, entry_pc, Intent::Instr)
        else {
            return (executed, ChunkExit::Ok);
        };
        let Some(mut idx) = cache.lookup(entry_paddr) else {
            return (executed, ChunkExit::Ok);
        };

        let mut pc = entry_pc;
        let mut branch_target: Option<u64> = None;
        let mut in_slot = false;
        let mut slot_next = false;
        let mut skip_next = false;

        loop {
            let op = cache.op_at(idx);
            match op {
                ChunkOp::Nop => {}

                ChunkOp::Lui { rt, imm } => {
                    let v = ((imm as u32) << 16) as i32 as i64 as u64;
                    cpu.write_gpr(rt as usize, v);
                }

                ChunkOp::AluImm { kind, rt, rs, imm } => {
                    let a = cpu.read_gpr(rs as usize);
                    let simm = imm as i16 as i64 as u64;
                    let v = match kind {
                        AluImmKind::Addiu => (a as i32).wrapping_add(simm as i32) as i64 as u64,
                        AluImmKind::Daddiu => a.wrapping_add(simm),
                        AluImmKind::Addi => match (a as i32).checked_add(simm as i32) {
                            Some(v) => v as i64 as u64,
                            None => return exit_replay(cpu, pc, in_slot, branch_target, executed),
                        },
                        AluImmKind::Daddi => match (a as i64).checked_add(simm as i64) {
                            Some(v) => v as u64,
                            None => return exit_replay(cpu, pc, in_slot, branch_target, executed),
                        },
                        AluImmKind::Slti => ((a as i64) < simm as i64) as u64,
                        AluImmKind::Sltiu => (a < simm) as u64,
                        AluImmKind::Andi => a & imm as u64,
                        AluImmKind::Ori => a | imm as u64,
                        AluImmKind::Xori => a ^ imm as u64,
                    };
                    cpu.write_gpr(rt as usize, v);
                }

                ChunkOp::AluReg { kind, rd, rs, rt } => {
                    let a = cpu.read_gpr(rs as usize);
                    let b = cpu.read_gpr(rt as usize);
                    let v = match kind {
                        AluRegKind::Addu => (a as i32).wrapping_add(b as i32) as i64 as u64,
                        AluRegKind::Subu => (a as i32).wrapping_sub(b as i32) as i64 as u64,
                        AluRegKind::Daddu => a.wrapping_add(b),
                        AluRegKind::Dsubu => a.wrapping_sub(b),
                        AluRegKind::And => a & b,
                        AluRegKind::Or => a | b,
                        AluRegKind::Xor => a ^ b,
                        AluRegKind::Nor => !(a | b),
                        AluRegKind::Slt => ((a as i64) < b as i64) as u64,
                        AluRegKind::Sltu => (a < b) as u64,
                    };
                    cpu.write_gpr(rd as usize, v);
                }

                ChunkOp::ShiftImm { kind, rd, rt, sa } => {
                    let v = shift_value(kind, cpu.read_gpr(rt as usize), sa as u32);
                    cpu.write_gpr(rd as usize, v);
                }

                ChunkOp::ShiftReg { kind, rd, rt, rs } => {
                    let amount = match kind {
                        ShiftKind::Sll | ShiftKind::Srl | ShiftKind::Sra => {
                            cpu.read_gpr(rs as usize) as u32 & 0x1f
                        }
                        _ => cpu.read_gpr(rs as usize) as u32 & 0x3f,
                    };
                    let v = shift_value(kind, cpu.read_gpr(rt as usize), amount);
                    cpu.write_gpr(rd as usize, v);
                }

                ChunkOp::MoveFromHi { rd } => {
                    let v = cpu.get_hi();
                    cpu.write_gpr(rd as usize, v);
                }
                ChunkOp::MoveFromLo { rd } => {
                    let v = cpu.get_lo();
                    cpu.write_gpr(rd as usize, v);
                }
                ChunkOp::MoveToHi { rs } => {
                    let v = cpu.read_gpr(rs as usize);
                    cpu.set_hi(v);
                }
                ChunkOp::MoveToLo { rs } => {
                    let v = cpu.read_gpr(rs as usize);
                    cpu.set_lo(v);
                }

                ChunkOp::Load { kind, rt, base, offset } => {
                    let vaddr = effective_address(cpu, base, offset);
                    let n = kind.width();
                    if vaddr & (n as u64 - 1) != 0 || cpu.cop0.cache_isolated() {
                        return exit_replay(cpu, pc, in_slot, branch_target, executed);
                    }
                    let Some((paddr, _)) = resolve(&cpu.cop0, bus, vcache, vaddr, Intent::Load)
                    else {
                        return exit_replay(cpu, pc, in_slot, branch_target, executed);
                    };
                    let mut buf = [0u8; 8];
                    if bus.read_phys(paddr, &mut buf[..n]).is_err() {
                        return exit_replay(cpu, pc, in_slot, branch_target, executed);
                    }
                    let raw = cpu.decode_int(&buf[..n]);
                    let v = match kind {
                        LoadKind::Lb => raw as i8 as i64 as u64,
                        LoadKind::Lh => raw as i16 as i64 as u64,
                        LoadKind::Lw => raw as i32 as i64 as u64,
                        LoadKind::Lbu | LoadKind::Lhu | LoadKind::Lwu | LoadKind::Ld => raw,
                    };
                    cpu.write_gpr(rt as usize, v);
                }

                ChunkOp::Store { kind, rt, base, offset } => {
                    let vaddr = effective_address(cpu, base, offset);
                    let n = kind.width();
                    if vaddr & (n as u64 - 1) != 0 || cpu.cop0.cache_isolated() {
                        return exit_replay(cpu, pc, in_slot, branch_target, executed);
                    }
                    let Some((paddr, _)) = resolve(&cpu.cop0, bus, vcache, vaddr, Intent::Store)
                    else {
                        return exit_replay(cpu, pc, in_slot, branch_target, executed);
                    };
                    let mut buf = [0u8; 8];
                    let value = cpu.read_gpr(rt as usize);
                    cpu.encode_int(value, &mut buf[..n]);
                    if bus.write_phys(paddr, &buf[..n]).is_err() {
                        return exit_replay(cpu, pc, in_slot, branch_target, executed);
                    }
                    if cache.page_has_translation(paddr & !0xfff) {
                        // self-modifying code: drop the stale chunks and
                        // leave before any of them can run
                        cache.invalidate_paddr_range(paddr, n as u64);
                        executed += 1;
                        let next = if in_slot {
                            branch_target.unwrap_or(pc.wrapping_add(4))
                        } else {
                            pc.wrapping_add(4)
                        };
                        cpu.set_pc(next);
                        return (executed, ChunkExit::SideEffect);
                    }
                }

                ChunkOp::Branch { cond, rs, rt, offset, likely, link } => {
                    let a = cpu.read_gpr(rs as usize);
                    let b = cpu.read_gpr(rt as usize);
                    if link {
                        cpu.write_gpr(31, pc.wrapping_add(8));
                    }
                    if chunk::eval_branch(cond, a, b) {
                        branch_target =
                            Some(pc.wrapping_add(4).wrapping_add(((offset as i64) << 2) as u64));
                        slot_next = true;
                    } else if likely {
                        skip_next = true;
                    } else {
                        slot_next = true;
                    }
                }

                ChunkOp::Jump { imm26, link } => {
                    if link {
                        cpu.write_gpr(31, pc.wrapping_add(8));
                    }
                    let target = (pc.wrapping_add(4) & !0x0fff_ffff) | ((imm26 as u64) << 2);
                    branch_target = Some(target);
                    slot_next = true;
                }

                ChunkOp::JumpReg { rs, link_rd } => {
                    let target = cpu.read_gpr(rs as usize);
                    if link_rd != 0 {
                        cpu.write_gpr(link_rd as usize, pc.wrapping_add(8));
                    }
                    branch_target = Some(target);
                    slot_next = true;
                }

                ChunkOp::MoveFromC0 { rt, rd, sel, dbl } => {
                    if !cpu.cop0.is_coprocessor_usable(0) {
                        return exit_replay(cpu, pc, in_slot, branch_target, executed);
                    }
                    let v = cpu.cop0.read_register(rd as usize, sel as usize);
                    let v = if dbl { v } else { v as i32 as i64 as u64 };
                    cpu.write_gpr(rt as usize, v);
                }

                ChunkOp::MoveToC0 { rt, rd, sel, dbl } => {
                    if !cpu.cop0.is_coprocessor_usable(0) {
                        return exit_replay(cpu, pc, in_slot, branch_target, executed);
                    }
                    let v = cpu.read_gpr(rt as usize);
                    // writes whose side effects need re-evaluation go back
                    // to the interpreter untouched
                    if cpu.cop0.mtc0_would_side_effect(rd as usize, sel as usize, v, dbl) {
                        return exit_replay(cpu, pc, in_slot, branch_target, executed);
                    }
                    cpu.cop0.write_register(rd as usize, sel as usize, v, dbl);
                }

                ChunkOp::Tlbp | ChunkOp::Tlbr | ChunkOp::Tlbwi | ChunkOp::Tlbwr => {
                    if !cpu.cop0.is_coprocessor_usable(0) {
                        return exit_replay(cpu, pc, in_slot, branch_target, executed);
                    }
                    match op {
                        ChunkOp::Tlbp => cpu.cop0.tlbp(),
                        ChunkOp::Tlbr => cpu.cop0.tlbr(),
                        ChunkOp::Tlbwi => {
                            cpu.cop0.tlbwi();
                            vcache.clear();
                        }
                        ChunkOp::Tlbwr => {
                            cpu.cop0.tlbwr();
                            vcache.clear();
                        }
                        _ => unreachable!(),
                    }
                }

                ChunkOp::Rfe => {
                    if !cpu.cop0.is_coprocessor_usable(0) {
                        return exit_replay(cpu, pc, in_slot, branch_target, executed);
                    }
                    cpu.cop0.rfe();
                    vcache.clear();
                }

                ChunkOp::Eret => {
                    if !cpu.cop0.is_coprocessor_usable(0) {
                        return exit_replay(cpu, pc, in_slot, branch_target, executed);
                    }
                    cpu.do_eret(bus);
                    executed += 1;
                    if executed >= fuel {
                        return (executed, ChunkExit::Fuel);
                    }
                    continue 'outer;
                }

                ChunkOp::Syscall | ChunkOp::Break => {
                    let exc = if op == ChunkOp::Syscall {
                        crate::core::cpu::CpuException::Syscall
                    } else {
                        crate::core::cpu::CpuException::Breakpoint
                    };
                    cpu.raise_exception_at(bus, exc, pc);
                    executed += 1;
                    if executed >= fuel {
                        return (executed, ChunkExit::Fuel);
                    }
                    continue 'outer;
                }

                ChunkOp::DelayedBranch => {
                    let next = branch_target.take().unwrap_or(pc);
                    cpu.set_pc(next);
                    if executed >= fuel {
                        return (executed, ChunkExit::Fuel);
                    }
                    continue 'outer;
                }

                ChunkOp::EndOfBlock => {
                    cpu.set_pc(pc);
                    if executed >= fuel {
                        return (executed, ChunkExit::Fuel);
                    }
                    continue 'outer;
                }
            }

            pc = pc.wrapping_add(4);
            idx += 1;
            executed += 1;
            if skip_next {
                // annulled delay slot of an untaken likely branch
                skip_next = false;
                pc = pc.wrapping_add(4);
                idx += 1;
                executed += 1;
                in_slot = false;
                slot_next = false;
            } else {
                in_slot = slot_next;
                slot_next = false;
            }
        }
    }
}

fn effective_address(cpu: &Cpu, base: u8, offset: i16) -> u64 {
    let addr = cpu.read_gpr(base as usize).wrapping_add(offset as i64 as u64);
    if cpu.def().is_32bit() {
        addr as i32 as i64 as u64
    } else {
        addr
    }
}

fn shift_value(kind: ShiftKind, rt: u64, amount: u32) -> u64 {
    match kind {
        ShiftKind::Sll => ((rt as u32) << amount) as i32 as i64 as u64,
        ShiftKind::Srl => ((rt as u32) >> amount) as i32 as i64 as u64,
        ShiftKind::Sra => ((rt as u32 as i32) >> amount) as i64 as u64,
        ShiftKind::Dsll => rt << amount,
        ShiftKind::Dsrl => rt >> amount,
        ShiftKind::Dsra => ((rt as i64) >> amount) as u64,
        ShiftKind::Dsll32 => rt << (amount + 32),
        ShiftKind::Dsrl32 => rt >> (amount + 32),
        ShiftKind::Dsra32 => ((rt as i64) >> (amount + 32)) as u64,
    }
}
