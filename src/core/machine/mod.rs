use tracing::{debug, info};
use crate::core::config::{MachineConfig, SetupError};
use crate::core::cpu::cpu_types::cpu_type_by_name;
use crate::core::cpu::mmu::{self, Intent};
use crate::core::cpu::{Cpu, DelaySlotState, StepResult};
use crate::core::dyntrans::runtime::{self, ChunkExit, VaddrCache, N_SAFE_DYNTRANS_LIMIT};
use crate::core::dyntrans::TranslationCache;
use crate::core::memory::bus::Bus;

/*
One emulated machine: its CPUs, the physical bus and the shared
translation cache. Execution is single-threaded and cooperative; SMP
machines interleave their CPUs round-robin at fuel-bounded bursts, so a
CPU can never starve the others for longer than one burst.
*/

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunReason {
    /// The requested instruction budget was consumed.
    Completed,
    /// Every CPU is sitting in WAIT with nothing pending.
    Halted,
    /// A CPU reached a registered breakpoint address.
    Breakpoint,
}

/// Result of a firmware-range hook.
pub enum PromAction {
    /// The call was emulated; resume at the return address.
    Handled,
    /// Re-enter the same routine on the next cycle.
    Loop,
}

pub type PromCallback = Box<dyn FnMut(&mut Cpu, &mut Bus) -> PromAction>;

struct PromRange {
    base: u64,
    len: u64,
    callback: PromCallback,
}

enum BurstEnd {
    Normal,
    Waited,
    Breakpoint,
}

pub struct Machine {
    cpus: Vec<Cpu>,
    vaddr_caches: Vec<VaddrCache>,
    bus: Bus,
    cache: TranslationCache,
    prom_ranges: Vec<PromRange>,
    breakpoints: Vec<u64>,
    dirty_scratch: Vec<(u64, u32)>,
}

impl Machine {
    pub fn new(config: &MachineConfig) -> Result<Self, SetupError> {
        let def = cpu_type_by_name(&config.cpu)
            .ok_or_else(|| SetupError::UnknownCpuType(config.cpu.clone()))?;
        info!(
            "machine: {} x {} ({:?} endian), {} MiB, dyntrans {}",
            config.ncpus,
            def.name,
            config.byte_order,
            config.memory_mib,
            if config.dyntrans.enabled { "on" } else { "off" }
        );

        let ncpus = config.ncpus.max(1);
        let mut cpus = Vec::with_capacity(ncpus);
        for id in 0..ncpus {
            let mut cpu = Cpu::new(def, config.byte_order, id);
            cpu.set_pc(config.initial_pc);
            cpus.push(cpu);
        }

        Ok(Machine {
            cpus,
            vaddr_caches: (0..ncpus).map(|_| VaddrCache::new()).collect(),
            bus: Bus::new(config.memory_bytes(), ncpus),
            cache: TranslationCache::new(config.dyntrans.enabled, config.dyntrans.pool_records),
            prom_ranges: Vec::new(),
            breakpoints: Vec::new(),
            dirty_scratch: Vec::new(),
        })
    }

    // ======================= host API =======================

    pub fn ncpus(&self) -> usize {
        self.cpus.len()
    }

    pub fn cpu(&self, i: usize) -> &Cpu {
        &self.cpus[i]
    }

    pub fn cpu_mut(&mut self, i: usize) -> &mut Cpu {
        &mut self.cpus[i]
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut Bus {
        &mut self.bus
    }

    pub fn translation_cache(&self) -> &TranslationCache {
        &self.cache
    }

    pub fn cpu_set_pc(&mut self, i: usize, pc: u64) {
        self.cpus[i].set_pc(pc);
    }

    /// Program one TLB entry directly (firmware setup glue).
    #[allow(clippy::too_many_arguments)]
    pub fn cpu_tlb_set_entry(
        &mut self,
        i: usize,
        index: usize,
        vaddr: u64,
        paddr0: u64,
        paddr1: u64,
        valid0: bool,
        valid1: bool,
        dirty0: bool,
        dirty1: bool,
        global: bool,
        asid: u64,
        pagemask: u64,
    ) {
        let cpu = &mut self.cpus[i];
        cpu.cop0.tlb_set_entry(
            index, vaddr, paddr0, paddr1, valid0, valid1, dirty0, dirty1, global, asid, pagemask,
        );
        cpu.vaddr_maps_stale = true;
    }

    /// Copy a raw image into physical memory before starting.
    pub fn load_raw_image(&mut self, paddr: u64, image: &[u8]) {
        self.bus.memory_mut().write(paddr, image);
    }

    pub fn add_breakpoint(&mut self, addr: u64) {
        self.breakpoints.push(addr);
    }

    pub fn remove_breakpoint(&mut self, addr: u64) {
        self.breakpoints.retain(|a| *a != addr);
    }

    /// Register a firmware range: fetching from it calls the hook instead
    /// of executing memory.
    pub fn register_prom_range(&mut self, base: u64, len: u64, callback: PromCallback) {
        self.prom_ranges.push(PromRange { base, len, callback });
    }

    // ======================= dispatch =======================

    /// Run up to `n_instructions` guest instructions, interleaving the
    /// machine's CPUs. Returns the count actually executed and why the
    /// run ended.
    pub fn run(&mut self, n_instructions: u64) -> (u64, RunReason) {
        let mut total: u64 = 0;
        while total < n_instructions {
            let mut all_waiting = true;
            for i in 0..self.cpus.len() {
                let budget = (n_instructions - total).min(N_SAFE_DYNTRANS_LIMIT);
                if budget == 0 {
                    break;
                }
                let (executed, end) = self.run_cpu_burst(i, budget);
                total += executed;
                match end {
                    BurstEnd::Breakpoint => return (total, RunReason::Breakpoint),
                    BurstEnd::Waited => {}
                    BurstEnd::Normal => all_waiting = false,
                }
            }
            if all_waiting {
                return (total, RunReason::Halted);
            }
        }
        (total, RunReason::Completed)
    }

    fn run_cpu_burst(&mut self, i: usize, budget: u64) -> (u64, BurstEnd) {
        let mut executed: u64 = 0;
        // set when translated code handed an instruction to the slow path;
        // exactly one interpreter step runs before re-entering chunks
        let mut interp_next = false;

        while executed < budget {
            // device interrupts raised during earlier accesses reach the
            // bootstrap CPU between instructions
            self.bus.irq.forward_to_controller(&mut self.cpus[0]);

            let pc = self.cpus[i].get_pc();

            if let Some(p) = self
                .prom_ranges
                .iter()
                .position(|r| pc >= r.base && pc < r.base + r.len)
            {
                let range = &mut self.prom_ranges[p];
                match (range.callback)(&mut self.cpus[i], &mut self.bus) {
                    PromAction::Handled => {
                        let ra = self.cpus[i].read_gpr(31);
                        self.cpus[i].set_pc(ra);
                        continue;
                    }
                    PromAction::Loop => {
                        executed += 1;
                        return (executed, BurstEnd::Normal);
                    }
                }
            }

            if self.breakpoints.contains(&pc) {
                debug!("breakpoint at {:#018x}", pc);
                return (executed, BurstEnd::Breakpoint);
            }

            let cpu = &mut self.cpus[i];
            let enter_translated = self.cache.enabled
                && !interp_next
                && cpu.delay_slot == DelaySlotState::NotDelayed
                && !cpu.nullify_next
                && !cpu.cop0.interrupt_pending();

            if enter_translated {
                let (n, exit) = runtime::run(
                    cpu,
                    &mut self.bus,
                    &mut self.cache,
                    &mut self.vaddr_caches[i],
                    budget - executed,
                );
                executed += n;
                cpu.add_instructions(n);
                cpu.cop0.tick(n);
                self.drain_dirty_log();
                match exit {
                    ChunkExit::Fuel | ChunkExit::SideEffect => {}
                    ChunkExit::Ok => {
                        // no translation at the new pc: translate it, or
                        // let the interpreter carry one instruction
                        if !self.try_translate(i) {
                            interp_next = true;
                        }
                    }
                    ChunkExit::Fault => interp_next = true,
                }
                continue;
            }

            interp_next = false;
            match self.interp_step(i) {
                StepResult::Wait => {
                    executed += 1;
                    return (executed, BurstEnd::Waited);
                }
                _ => executed += 1,
            }
        }

        (executed, BurstEnd::Normal)
    }

    fn interp_step(&mut self, i: usize) -> StepResult {
        let result = self.cpus[i].step(&mut self.bus);
        self.drain_dirty_log();
        result
    }

    fn try_translate(&mut self, i: usize) -> bool {
        let cpu = &self.cpus[i];
        let pc = cpu.get_pc();
        if pc & 3 != 0 {
            return false;
        }
        let Ok(t) = mmu::translate(&cpu.cop0, pc, Intent::Instr) else {
            return false;
        };
        let byte_order = cpu.byte_order();
        let has64 = cpu.def().has_64bit_isa();
        self.cache
            .attempt_translate(&mut self.bus, byte_order, has64, t.paddr)
    }

    /// Stores retired since the last drain invalidate any translations
    /// they touched, before the next chunk can run.
    fn drain_dirty_log(&mut self) {
        if self.bus.dirty_log_is_empty() {
            return;
        }
        self.dirty_scratch.clear();
        self.bus.take_dirty_log(&mut self.dirty_scratch);
        for k in 0..self.dirty_scratch.len() {
            let (paddr, len) = self.dirty_scratch[k];
            self.cache.invalidate_paddr_range(paddr, len as u64);
        }
    }
}
