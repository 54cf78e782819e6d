use tracing::{debug, warn};
use crate::core::cpu::CpuException;
use crate::core::cpu::cpu_types::{CpuTypeDef, MmuModel};

pub static COP0_REGISTER_ALIASES: [&str; 32] = [
    "$index", "$random", "$entrylo0", "$entrylo1", "$context", "$pagemask", "$wired", "$cop0_r7",
    "$badvaddr", "$count", "$entryhi", "$compare", "$status", "$cause", "$epc", "$prid",
    "$config", "$lladdr", "$watchlo", "$watchhi", "$xcontext", "$cop0_r21", "$cop0_r22", "$debug",
    "$depc", "$perfcnt", "$errctl", "$cacheerr", "$taglo", "$taghi", "$errorepc", "$desave",
];

// Coprocessor 0 register numbers.
pub const COP0_INDEX: usize = 0;
pub const COP0_RANDOM: usize = 1;
pub const COP0_ENTRYLO0: usize = 2;
pub const COP0_ENTRYLO1: usize = 3;
pub const COP0_CONTEXT: usize = 4;
pub const COP0_PAGEMASK: usize = 5;
pub const COP0_WIRED: usize = 6;
pub const COP0_BADVADDR: usize = 8;
pub const COP0_COUNT: usize = 9;
pub const COP0_ENTRYHI: usize = 10;
pub const COP0_COMPARE: usize = 11;
pub const COP0_STATUS: usize = 12;
pub const COP0_CAUSE: usize = 13;
pub const COP0_EPC: usize = 14;
pub const COP0_PRID: usize = 15;
pub const COP0_CONFIG: usize = 16;
pub const COP0_LLADDR: usize = 17;
pub const COP0_WATCHLO: usize = 18;
pub const COP0_WATCHHI: usize = 19;
pub const COP0_XCONTEXT: usize = 20;
pub const COP0_FRAMEMASK: usize = 21;
pub const COP0_DEBUG: usize = 23;
pub const COP0_DEPC: usize = 24;
pub const COP0_PERFCNT: usize = 25;
pub const COP0_ERRCTL: usize = 26;
pub const COP0_CACHEERR: usize = 27;
pub const COP0_TAGDATA_LO: usize = 28;
pub const COP0_TAGDATA_HI: usize = 29;
pub const COP0_ERROREPC: usize = 30;
pub const COP0_DESAVE: usize = 31;

/*
Status register layout (R4000 and newer):
  0     IE   global interrupt enable
  1     EXL  exception level
  2     ERL  error level
  3-4   KSU  mode (00=kernel, 01=supervisor, 10=user)
  5     UX   64-bit addressing in user mode
  6     SX   64-bit addressing in supervisor mode
  7     KX   64-bit addressing (XTLB refill) in kernel mode
  8-15  IM   interrupt mask
  16    Isc  isolate cache (R3000: loads/stores target the cache)
  17    Swc  swap caches (R3000)
  21    TS   TLB shutdown (read-only)
  22    BEV  bootstrap exception vectors
  25    RE   reverse endianness in user mode
  26    FR   32 double registers when set, 16 pairs when clear
  28-31 CU0..CU3 coprocessor usable

On the R2000/R3000 bits 0-5 are instead the three-deep
interrupt-enable/kernel-user mode stack: IEc,KUc / IEp,KUp / IEo,KUo.
*/
pub const STATUS_IE: u64 = 0x01;
pub const STATUS_EXL: u64 = 0x02;
pub const STATUS_ERL: u64 = 0x04;
pub const STATUS_KSU_MASK: u64 = 0x18;
pub const STATUS_KSU_SHIFT: u64 = 3;
pub const STATUS_UX: u64 = 0x20;
pub const STATUS_SX: u64 = 0x40;
pub const STATUS_KX: u64 = 0x80;
pub const STATUS_IM_MASK: u64 = 0xff00;
pub const STATUS_IM_SHIFT: u64 = 8;
pub const STATUS_TS: u64 = 1 << 21;
pub const STATUS_BEV: u64 = 1 << 22;
pub const STATUS_RE: u64 = 1 << 25;
pub const STATUS_FR: u64 = 1 << 26;
pub const STATUS_CU_SHIFT: u64 = 28;
pub const MIPS1_ISOL_CACHES: u64 = 1 << 16;

pub const CAUSE_BD: u64 = 1 << 31;
pub const CAUSE_CE_MASK: u64 = 0x30000000;
pub const CAUSE_CE_SHIFT: u64 = 28;
pub const CAUSE_IV: u64 = 1 << 23;
pub const CAUSE_IP_MASK: u64 = 0xff00;
pub const CAUSE_IP_SHIFT: u64 = 8;
pub const CAUSE_EXCCODE_MASK: u64 = 0x7c;
pub const R2K3K_CAUSE_EXCCODE_MASK: u64 = 0x3c;
pub const CAUSE_EXCCODE_SHIFT: u64 = 2;

// R4000-style EntryHi/EntryLo fields.
pub const ENTRYHI_R_MASK: u64 = 0xc000_0000_0000_0000;
pub const ENTRYHI_ASID: u64 = 0xff;
pub const TLB_G: u64 = 1 << 12;
pub const ENTRYLO_PFN_MASK: u64 = 0x3fff_ffc0;
pub const ENTRYLO_PFN_SHIFT: u64 = 6;
pub const ENTRYLO_C_MASK: u64 = 0x38;
pub const ENTRYLO_D: u64 = 0x04;
pub const ENTRYLO_V: u64 = 0x02;
pub const ENTRYLO_G: u64 = 0x01;
// R2000/R3000 fields.
pub const R2K3K_ENTRYHI_VPN_MASK: u64 = 0xfffff000;
pub const R2K3K_ENTRYHI_ASID_MASK: u64 = 0xfc0;
pub const R2K3K_ENTRYHI_ASID_SHIFT: u64 = 6;
pub const R2K3K_ENTRYLO_PFN_MASK: u64 = 0xfffff000;
pub const R2K3K_ENTRYLO_N: u64 = 0x800;
pub const R2K3K_ENTRYLO_D: u64 = 0x400;
pub const R2K3K_ENTRYLO_V: u64 = 0x200;
pub const R2K3K_ENTRYLO_G: u64 = 0x100;
pub const R2K3K_INDEX_SHIFT: u64 = 8;

pub const INDEX_P: u64 = 0x8000_0000;
pub const INDEX_MASK: u64 = 0x3f;
pub const PAGEMASK_MASK: u64 = 0x01ff_e000;
pub const PAGEMASK_SHIFT: u64 = 13;

pub const CONTEXT_BADVPN2_MASK: u64 = 0x007f_fff0;
pub const CONTEXT_BADVPN2_SHIFT: u64 = 4;
pub const R2K3K_CONTEXT_BADVPN_MASK: u64 = 0x001f_fffc;
pub const R2K3K_CONTEXT_BADVPN_SHIFT: u64 = 2;
pub const XCONTEXT_R_MASK: u64 = 0x1_8000_0000;
pub const XCONTEXT_R_SHIFT: u64 = 31;
pub const XCONTEXT_BADVPN2_MASK: u64 = 0x7fff_fff0;
pub const XCONTEXT_BADVPN2_SHIFT: u64 = 4;

pub const KSU_KERNEL: u64 = 0;
pub const KSU_SUPERVISOR: u64 = 1;
pub const KSU_USER: u64 = 2;

/// One TLB entry. The entry-global bit is kept in `hi` bit 12 (TLB_G) for
/// R4K-style MMUs; MMU3K keeps it in `lo0` as the architecture does.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TlbEntry {
    pub hi: u64,
    pub lo0: u64,
    pub lo1: u64,
    pub mask: u64,
}

/// Side effects of a COP0 register write that the CPU has to act on.
#[derive(Debug, Default, Clone, Copy)]
pub struct Cop0WriteEffect {
    /// EntryHi ASID changed: cached virtual mappings are stale.
    pub asid_changed: bool,
    /// Status mode/interrupt bits changed.
    pub mode_changed: bool,
    /// A TLB entry was (possibly) rewritten.
    pub tlb_changed: bool,
    /// The write raised Coprocessor Unusable (unimplemented register).
    pub unimplemented: bool,
}

pub struct Cop0 {
    pub reg: [u64; 32],
    config_select1: u64,
    pub tlb: Vec<TlbEntry>,
    def: &'static CpuTypeDef,
    /// Retired-instruction counter driving Count and Random.
    instr_count: u64,
}

impl Cop0 {
    pub fn new(def: &'static CpuTypeDef) -> Self {
        let mut c = Cop0 {
            reg: [0; 32],
            config_select1: 0,
            tlb: vec![TlbEntry::default(); def.nr_of_tlb_entries],
            def,
            instr_count: 0,
        };
        c.reset();
        c
    }

    pub fn def(&self) -> &'static CpuTypeDef {
        self.def
    }

    pub fn reset(&mut self) {
        self.reg = [0; 32];
        for e in self.tlb.iter_mut() {
            *e = TlbEntry::default();
        }
        // Kernel mode, interrupts masked, bootstrap vectors.
        self.reg[COP0_STATUS] = (STATUS_BEV as i32 as i64) as u64;
        self.reg[COP0_PRID] = self.def.prid();
        self.reg[COP0_RANDOM] = (self.def.nr_of_tlb_entries - 1) as u64;
        self.reg[COP0_WIRED] = if self.def.mmu_model.is_r3k() { 8 } else { 0 };
        self.instr_count = 0;
    }

    // ======================= mode helpers =======================

    pub fn is_kernel_mode(&self) -> bool {
        let sr = self.reg[COP0_STATUS];
        if self.def.exc_model.is_r3k() {
            sr & 0x02 == 0 // KUc
        } else {
            (sr & STATUS_KSU_MASK) >> STATUS_KSU_SHIFT == KSU_KERNEL
                || sr & (STATUS_EXL | STATUS_ERL) != 0
        }
    }

    pub fn is_user_mode(&self) -> bool {
        let sr = self.reg[COP0_STATUS];
        if self.def.exc_model.is_r3k() {
            sr & 0x02 != 0
        } else {
            (sr & STATUS_KSU_MASK) >> STATUS_KSU_SHIFT == KSU_USER
                && sr & (STATUS_EXL | STATUS_ERL) == 0
        }
    }

    /// R3000 isolated-cache mode: loads/stores do not reach memory.
    pub fn cache_isolated(&self) -> bool {
        self.def.exc_model.is_r3k() && self.reg[COP0_STATUS] & MIPS1_ISOL_CACHES != 0
    }

    pub fn status_fr(&self) -> bool {
        self.reg[COP0_STATUS] & STATUS_FR != 0
    }

    pub fn is_coprocessor_usable(&self, nr: usize) -> bool {
        if nr == 0 && self.is_kernel_mode() {
            return true;
        }
        self.reg[COP0_STATUS] & (1 << (STATUS_CU_SHIFT + nr as u64)) != 0
    }

    pub fn asid(&self) -> u64 {
        if self.def.mmu_model.is_r3k() {
            (self.reg[COP0_ENTRYHI] & R2K3K_ENTRYHI_ASID_MASK) >> R2K3K_ENTRYHI_ASID_SHIFT
        } else {
            self.reg[COP0_ENTRYHI] & ENTRYHI_ASID
        }
    }

    // ======================= register file =======================

    pub fn read_register(&self, reg_nr: usize, sel: usize) -> u64 {
        if sel != 0 {
            return match (reg_nr, sel) {
                (COP0_CONFIG, 1) => self.config_select1,
                _ => {
                    warn!("read from unimplemented cop0 register {} select {}", reg_nr, sel);
                    0
                }
            };
        }
        match reg_nr {
            COP0_RANDOM => self.random_value(),
            _ => self.reg[reg_nr],
        }
    }

    /// Random cycles through [wired, n-1], driven by the retired-instruction
    /// count. Any in-range value is architecturally valid.
    fn random_value(&self) -> u64 {
        let n = self.def.nr_of_tlb_entries as u64;
        let wired = if self.def.mmu_model.is_r3k() {
            8
        } else {
            self.reg[COP0_WIRED] & INDEX_MASK
        };
        let wired = wired.min(n - 1);
        let idx = wired + self.instr_count % (n - wired);
        if self.def.mmu_model.is_r3k() {
            idx << R2K3K_INDEX_SHIFT
        } else {
            idx
        }
    }

    /// Write a COP0 register, applying the per-register write masks.
    /// Returns the side effects the CPU must act on.
    pub fn write_register(
        &mut self,
        reg_nr: usize,
        sel: usize,
        value: u64,
        flag64: bool,
    ) -> Cop0WriteEffect {
        let mut effect = Cop0WriteEffect::default();
        let mut tmp = value;
        let r3k = self.def.mmu_model.is_r3k();

        if sel != 0 {
            match (reg_nr, sel) {
                (COP0_CONFIG, 1) => self.config_select1 = tmp,
                _ => warn!("write to unimplemented cop0 register {} select {}", reg_nr, sel),
            }
            return effect;
        }

        match reg_nr {
            COP0_INDEX => {
                tmp &= if r3k {
                    INDEX_P | (INDEX_MASK << R2K3K_INDEX_SHIFT)
                } else {
                    INDEX_P | INDEX_MASK
                };
            }
            COP0_RANDOM => {
                // read-only, decremented by hardware
                warn!("write to read-only cop0 register RANDOM ignored");
                return effect;
            }
            COP0_ENTRYLO0 | COP0_ENTRYLO1 => {
                tmp &= if r3k {
                    R2K3K_ENTRYLO_PFN_MASK
                        | R2K3K_ENTRYLO_N
                        | R2K3K_ENTRYLO_D
                        | R2K3K_ENTRYLO_V
                        | R2K3K_ENTRYLO_G
                } else {
                    ENTRYLO_PFN_MASK | ENTRYLO_C_MASK | ENTRYLO_D | ENTRYLO_V | ENTRYLO_G
                };
            }
            COP0_CONTEXT => {
                // BadVPN/BadVPN2 is read-only; only PTEBase is written.
                let old = self.reg[COP0_CONTEXT];
                let ro_mask = if r3k {
                    R2K3K_CONTEXT_BADVPN_MASK
                } else {
                    CONTEXT_BADVPN2_MASK
                };
                self.reg[COP0_CONTEXT] = (tmp & !ro_mask) | (old & ro_mask);
                return effect;
            }
            COP0_PAGEMASK => {
                let field = (tmp >> PAGEMASK_SHIFT) & 0xfff;
                if !matches!(field, 0x000 | 0x003 | 0x00f | 0x03f | 0x0ff | 0x3ff | 0xfff) {
                    warn!("invalid pagemask {:#010x} written to COP0_PAGEMASK", tmp);
                }
                tmp &= self.pagemask_mask();
            }
            COP0_WIRED => {
                if r3k {
                    warn!("r2k/r3k wired register is fixed at 8");
                    tmp = 8;
                } else {
                    tmp &= INDEX_MASK;
                }
                self.reg[COP0_RANDOM] = (self.def.nr_of_tlb_entries - 1) as u64;
            }
            COP0_COUNT => {
                tmp = tmp as i32 as i64 as u64;
                // writing the timer registers acknowledges the timer interrupt
                self.deassert_irq(7);
            }
            COP0_COMPARE => {
                tmp = tmp as i32 as i64 as u64;
                self.deassert_irq(7);
            }
            COP0_ENTRYHI => {
                // An ASID change makes every cached virtual mapping stale.
                let asid_mask = if r3k { R2K3K_ENTRYHI_ASID_MASK } else { ENTRYHI_ASID };
                if (self.reg[COP0_ENTRYHI] ^ tmp) & asid_mask != 0 {
                    effect.asid_changed = true;
                }
                tmp &= if r3k {
                    R2K3K_ENTRYHI_VPN_MASK | R2K3K_ENTRYHI_ASID_MASK
                } else if self.def.mmu_model == MmuModel::Mmu10k {
                    ENTRYHI_R_MASK | self.def.mmu_model.vpn2_mask() | ENTRYHI_ASID
                } else if self.def.page_shift == 10 {
                    ENTRYHI_R_MASK | self.def.mmu_model.vpn2_mask() | 0x1800 | ENTRYHI_ASID
                } else {
                    ENTRYHI_R_MASK | self.def.mmu_model.vpn2_mask() | ENTRYHI_ASID
                };
            }
            COP0_EPC | COP0_ERROREPC | COP0_BADVADDR | COP0_LLADDR | COP0_WATCHLO
            | COP0_WATCHHI | COP0_XCONTEXT | COP0_FRAMEMASK | COP0_TAGDATA_LO
            | COP0_TAGDATA_HI | COP0_DEPC | COP0_DESAVE | COP0_PERFCNT | COP0_ERRCTL
            | COP0_DEBUG | COP0_CACHEERR => {}
            COP0_PRID => {
                warn!("write to read-only cop0 register PRID ignored");
                return effect;
            }
            COP0_CONFIG => {
                // only K0 (bits 2..0) is writable
                let old = self.reg[COP0_CONFIG];
                self.reg[COP0_CONFIG] = (old & !0x7) | (tmp & 0x7);
                return effect;
            }
            COP0_STATUS => {
                let old = self.reg[COP0_STATUS];
                // TS (bit 21) is read-only and set only by hardware.
                tmp = (tmp & !STATUS_TS) | (old & STATUS_TS);
                let relevant = STATUS_IE
                    | STATUS_EXL
                    | STATUS_ERL
                    | STATUS_KSU_MASK
                    | STATUS_IM_MASK
                    | STATUS_RE
                    | MIPS1_ISOL_CACHES
                    | 0x3f;
                if (old ^ tmp) & relevant != 0 {
                    effect.mode_changed = true;
                }
            }
            COP0_CAUSE => {
                // only the software interrupt bits IP0/IP1 are writable
                let sw = 0x3 << CAUSE_IP_SHIFT;
                self.reg[COP0_CAUSE] =
                    ((self.reg[COP0_CAUSE] & !sw) | (tmp & sw)) as i32 as i64 as u64;
                return effect;
            }
            _ => {
                warn!(
                    "write to unimplemented cop0 register {} ({}) = {:#018x}",
                    reg_nr, COP0_REGISTER_ALIASES[reg_nr & 31], tmp
                );
                effect.unimplemented = true;
                return effect;
            }
        }

        self.reg[reg_nr] = tmp;
        if !flag64 {
            self.reg[reg_nr] = self.reg[reg_nr] as i32 as i64 as u64;
        }
        effect
    }

    /// Would this COP0 write require re-evaluating cached state
    /// (address-space change, interrupt delivery, and the like)?
    /// Translated code applies a write inline only when this is false;
    /// otherwise it returns to the interpreter.
    pub fn mtc0_would_side_effect(&self, reg_nr: usize, sel: usize, value: u64, flag64: bool) -> bool {
        if sel != 0 {
            return !matches!((reg_nr, sel), (COP0_CONFIG, 1));
        }
        let value = if flag64 { value } else { value as i32 as i64 as u64 };
        match reg_nr {
            COP0_ENTRYHI => {
                let asid_mask = if self.def.mmu_model.is_r3k() {
                    R2K3K_ENTRYHI_ASID_MASK
                } else {
                    ENTRYHI_ASID
                };
                (self.reg[COP0_ENTRYHI] ^ value) & asid_mask != 0
            }
            COP0_STATUS => {
                let relevant = STATUS_IE
                    | STATUS_EXL
                    | STATUS_ERL
                    | STATUS_KSU_MASK
                    | STATUS_IM_MASK
                    | STATUS_RE
                    | MIPS1_ISOL_CACHES
                    | 0x3f;
                (self.reg[COP0_STATUS] ^ value) & relevant != 0
            }
            // writes to the software interrupt bits can make an interrupt
            // pending
            COP0_CAUSE => (self.reg[COP0_CAUSE] ^ value) & (0x3 << CAUSE_IP_SHIFT) != 0,
            // these only feed later tlbwi/tlbwr or are plain data
            COP0_INDEX | COP0_ENTRYLO0 | COP0_ENTRYLO1 | COP0_CONTEXT | COP0_PAGEMASK
            | COP0_WIRED | COP0_BADVADDR | COP0_COUNT | COP0_COMPARE | COP0_EPC
            | COP0_ERROREPC | COP0_LLADDR | COP0_WATCHLO | COP0_WATCHHI | COP0_XCONTEXT
            | COP0_FRAMEMASK | COP0_TAGDATA_LO | COP0_TAGDATA_HI | COP0_DEPC | COP0_DESAVE
            | COP0_PERFCNT | COP0_ERRCTL | COP0_DEBUG | COP0_CACHEERR | COP0_CONFIG => false,
            _ => true,
        }
    }

    fn pagemask_mask(&self) -> u64 {
        // PageMask occupies 12 bits starting one above the base page shift.
        let shift = self.def.page_shift + 1;
        0xfff << shift
    }

    // ======================= TLB instructions =======================

    /// tlbp: probe for an entry matching EntryHi; Index gets the match or
    /// the probe-failure bit.
    pub fn tlbp(&mut self) {
        let r3k = self.def.mmu_model.is_r3k();
        let entry_hi = self.reg[COP0_ENTRYHI];
        let mut found: Option<usize> = None;

        for (i, e) in self.tlb.iter().enumerate() {
            let matched = if r3k {
                let vpn_match = (e.hi ^ entry_hi) & R2K3K_ENTRYHI_VPN_MASK == 0;
                let global = e.lo0 & R2K3K_ENTRYLO_G != 0;
                let asid_match = (e.hi ^ entry_hi) & R2K3K_ENTRYHI_ASID_MASK == 0;
                vpn_match && (global || asid_match)
            } else {
                let mask = e.mask | ((1 << (self.def.page_shift + 1)) - 1);
                let vpn_bits = ENTRYHI_R_MASK | self.def.mmu_model.vpn2_mask();
                let vpn_match = (e.hi ^ entry_hi) & vpn_bits & !mask == 0;
                let global = e.hi & TLB_G != 0;
                let asid_match = (e.hi ^ entry_hi) & ENTRYHI_ASID == 0;
                vpn_match && (global || asid_match)
            };
            if matched {
                if found.is_some() {
                    warn!("tlbp: multiple TLB entries match EntryHi {:#018x}", entry_hi);
                    break;
                }
                found = Some(i);
            }
        }

        self.reg[COP0_INDEX] = match found {
            Some(i) if r3k => (i as u64) << R2K3K_INDEX_SHIFT,
            Some(i) => i as u64,
            None => INDEX_P,
        };
    }

    /// tlbr: read the entry selected by Index into the TLB interface
    /// registers.
    pub fn tlbr(&mut self) {
        let i = self.tlb_index();
        let e = self.tlb[i];
        if self.def.mmu_model.is_r3k() {
            self.reg[COP0_ENTRYHI] = e.hi;
            self.reg[COP0_ENTRYLO0] = e.lo0;
        } else {
            self.reg[COP0_ENTRYHI] = e.hi & !TLB_G;
            self.reg[COP0_ENTRYLO0] = e.lo0;
            self.reg[COP0_ENTRYLO1] = e.lo1;
            self.reg[COP0_PAGEMASK] = e.mask;
        }
    }

    pub fn tlbwi(&mut self) -> Cop0WriteEffect {
        let i = self.tlb_index();
        self.tlb_write(i)
    }

    pub fn tlbwr(&mut self) -> Cop0WriteEffect {
        let i = if self.def.mmu_model.is_r3k() {
            (self.random_value() >> R2K3K_INDEX_SHIFT) as usize & 0x3f
        } else {
            self.random_value() as usize
        };
        self.tlb_write(i.min(self.tlb.len() - 1))
    }

    fn tlb_index(&self) -> usize {
        let raw = if self.def.mmu_model.is_r3k() {
            (self.reg[COP0_INDEX] >> R2K3K_INDEX_SHIFT) & 0x3f
        } else {
            self.reg[COP0_INDEX] & INDEX_MASK
        };
        (raw as usize).min(self.tlb.len() - 1)
    }

    fn tlb_write(&mut self, i: usize) -> Cop0WriteEffect {
        let pagemask_mask = self.pagemask_mask();
        let e = &mut self.tlb[i];
        if self.def.mmu_model.is_r3k() {
            e.hi = self.reg[COP0_ENTRYHI];
            e.lo0 = self.reg[COP0_ENTRYLO0];
            e.lo1 = 0;
            e.mask = 0;
        } else {
            // the entry is global only when both halves are
            let g = self.reg[COP0_ENTRYLO0] & self.reg[COP0_ENTRYLO1] & ENTRYLO_G != 0;
            e.hi = (self.reg[COP0_ENTRYHI] & !TLB_G) | if g { TLB_G } else { 0 };
            e.lo0 = self.reg[COP0_ENTRYLO0];
            e.lo1 = self.reg[COP0_ENTRYLO1];
            e.mask = self.reg[COP0_PAGEMASK] & pagemask_mask;
        }
        debug!(
            "tlb[{}] <= hi={:#018x} lo0={:#010x} lo1={:#010x} mask={:#010x}",
            i, self.tlb[i].hi, self.tlb[i].lo0, self.tlb[i].lo1, self.tlb[i].mask
        );
        Cop0WriteEffect { tlb_changed: true, ..Default::default() }
    }

    /// Direct TLB programming for integrators (firmware setup glue).
    #[allow(clippy::too_many_arguments)]
    pub fn tlb_set_entry(
        &mut self,
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
        let pagemask_mask = self.pagemask_mask();
        let e = &mut self.tlb[index];
        if self.def.mmu_model.is_r3k() {
            e.hi = (vaddr & R2K3K_ENTRYHI_VPN_MASK)
                | ((asid << R2K3K_ENTRYHI_ASID_SHIFT) & R2K3K_ENTRYHI_ASID_MASK);
            e.lo0 = (paddr0 & R2K3K_ENTRYLO_PFN_MASK)
                | if valid0 { R2K3K_ENTRYLO_V } else { 0 }
                | if dirty0 { R2K3K_ENTRYLO_D } else { 0 }
                | if global { R2K3K_ENTRYLO_G } else { 0 };
        } else {
            let shift = self.def.page_shift as u64;
            e.hi = (vaddr & (ENTRYHI_R_MASK | self.def.mmu_model.vpn2_mask()))
                | (asid & ENTRYHI_ASID)
                | if global { TLB_G } else { 0 };
            e.mask = pagemask & pagemask_mask;
            e.lo0 = (((paddr0 >> shift) << ENTRYLO_PFN_SHIFT) & ENTRYLO_PFN_MASK)
                | if valid0 { ENTRYLO_V } else { 0 }
                | if dirty0 { ENTRYLO_D } else { 0 };
            e.lo1 = (((paddr1 >> shift) << ENTRYLO_PFN_SHIFT) & ENTRYLO_PFN_MASK)
                | if valid1 { ENTRYLO_V } else { 0 }
                | if dirty1 { ENTRYLO_D } else { 0 };
        }
    }

    // ======================= exception entry/exit =======================

    /*
    Exception vectoring:
      base = 0xbfc00200 when Status.BEV is set, else 0x80000000.
      R2000/R3000: offset 0x000 for user-space TLB refills, 0x080 otherwise,
      and the 6-bit mode stack in Status is pushed.
      R4000 and newer: 0x000 for a 32-bit TLB refill with EXL clear, 0x080
      for the 64-bit XTLB refill, 0x200 for interrupts when Cause.IV is set,
      0x180 for everything else; EXL is set on entry.
    */
    pub fn do_exception(&mut self, pc_last: u64, in_delay_slot: bool, exc: &CpuException) -> u64 {
        let exccode = exc.code() as u64;
        let r3k = self.def.exc_model.is_r3k();

        // ExcCode and CE
        if r3k {
            self.reg[COP0_CAUSE] &= !R2K3K_CAUSE_EXCCODE_MASK;
        } else {
            self.reg[COP0_CAUSE] &= !CAUSE_EXCCODE_MASK;
        }
        self.reg[COP0_CAUSE] |= exccode << CAUSE_EXCCODE_SHIFT;
        self.reg[COP0_CAUSE] &= !CAUSE_CE_MASK;
        if let CpuException::CoprocessorUnusable(nr) = exc {
            self.reg[COP0_CAUSE] |= (*nr as u64) << CAUSE_CE_SHIFT;
        }

        // BadVAddr and the TLB interface registers
        if let Some(vaddr) = exc.bad_vaddr() {
            let mut bad = vaddr;
            if bad >> 32 == 0 && bad & 0x8000_0000 != 0 {
                bad |= 0xffff_ffff_0000_0000;
            }
            self.reg[COP0_BADVADDR] = bad;
            if exc.is_tlb() {
                self.record_tlb_fault_address(vaddr);
            }
        }

        // EPC and the branch-delay flag. R4000 and newer do not overwrite
        // EPC when EXL is already set.
        let exl_was_set = !r3k && self.reg[COP0_STATUS] & STATUS_EXL != 0;
        if !exl_was_set {
            if in_delay_slot {
                self.reg[COP0_EPC] = pc_last.wrapping_sub(4);
                self.reg[COP0_CAUSE] |= CAUSE_BD;
            } else {
                self.reg[COP0_EPC] = pc_last;
                self.reg[COP0_CAUSE] &= !CAUSE_BD;
            }
        }

        let base: u64 = if self.reg[COP0_STATUS] & STATUS_BEV != 0 {
            0xffff_ffff_bfc0_0200
        } else {
            0xffff_ffff_8000_0000
        };

        let new_pc = if r3k {
            let user_tlb_refill = exc.is_tlb_refill()
                && matches!(exc, CpuException::TlbLoad { vaddr, .. } | CpuException::TlbStore { vaddr, .. }
                    if vaddr & 0x8000_0000 == 0);
            if user_tlb_refill { base } else { base + 0x080 }
        } else if exc.is_tlb_refill() && !exl_was_set {
            if exc.is_xtlb() { base + 0x080 } else { base }
        } else if matches!(exc, CpuException::Interrupt) && self.reg[COP0_CAUSE] & CAUSE_IV != 0 {
            base + 0x200
        } else {
            base + 0x180
        };

        if r3k {
            // push kernel-mode/interrupts-disabled onto the mode stack
            let sr = self.reg[COP0_STATUS];
            self.reg[COP0_STATUS] = (sr & !0x3f) | ((sr & 0xf) << 2);
        } else {
            self.reg[COP0_STATUS] |= STATUS_EXL;
        }

        self.reg[COP0_CAUSE] = self.reg[COP0_CAUSE] as i32 as i64 as u64;
        self.reg[COP0_STATUS] = self.reg[COP0_STATUS] as i32 as i64 as u64;
        if self.def.is_32bit() {
            self.reg[COP0_EPC] = self.reg[COP0_EPC] as i32 as i64 as u64;
        }

        new_pc
    }

    /// On TLB faults Context, XContext and EntryHi receive the faulting
    /// page so the refill handler can use them directly.
    fn record_tlb_fault_address(&mut self, vaddr: u64) {
        let asid = self.asid();
        if self.def.mmu_model.is_r3k() {
            let badvpn = vaddr >> 12;
            self.reg[COP0_CONTEXT] &= !R2K3K_CONTEXT_BADVPN_MASK;
            self.reg[COP0_CONTEXT] |=
                (badvpn << R2K3K_CONTEXT_BADVPN_SHIFT) & R2K3K_CONTEXT_BADVPN_MASK;
            self.reg[COP0_ENTRYHI] = (vaddr & R2K3K_ENTRYHI_VPN_MASK)
                | (asid << R2K3K_ENTRYHI_ASID_SHIFT);
            self.reg[COP0_CONTEXT] = self.reg[COP0_CONTEXT] as i32 as i64 as u64;
            self.reg[COP0_ENTRYHI] = self.reg[COP0_ENTRYHI] as i32 as i64 as u64;
        } else {
            let vpn2 = vaddr >> (self.def.page_shift + 1);
            let ctx_mask = if self.def.page_shift == 10 {
                0x00ff_fff0
            } else {
                CONTEXT_BADVPN2_MASK
            };
            self.reg[COP0_CONTEXT] &= !ctx_mask;
            self.reg[COP0_CONTEXT] |= (vpn2 << CONTEXT_BADVPN2_SHIFT) & ctx_mask;

            self.reg[COP0_XCONTEXT] &= !(XCONTEXT_R_MASK | XCONTEXT_BADVPN2_MASK);
            self.reg[COP0_XCONTEXT] |= (vpn2 << XCONTEXT_BADVPN2_SHIFT) & XCONTEXT_BADVPN2_MASK;
            self.reg[COP0_XCONTEXT] |= ((vaddr >> 62) & 0x3) << XCONTEXT_R_SHIFT;

            let vpn_bits = if self.def.page_shift == 10 {
                ENTRYHI_R_MASK | self.def.mmu_model.vpn2_mask() | 0x1800
            } else {
                ENTRYHI_R_MASK | self.def.mmu_model.vpn2_mask()
            };
            self.reg[COP0_ENTRYHI] = (vaddr & vpn_bits) | asid;
        }
    }

    /// eret: return from exception (R4000 and newer).
    pub fn eret(&mut self) -> u64 {
        if self.reg[COP0_STATUS] & STATUS_ERL != 0 {
            self.reg[COP0_STATUS] &= !STATUS_ERL;
            self.reg[COP0_ERROREPC]
        } else {
            self.reg[COP0_STATUS] &= !STATUS_EXL;
            self.reg[COP0_EPC]
        }
    }

    /// rfe: pop the R2000/R3000 mode stack.
    pub fn rfe(&mut self) {
        let sr = self.reg[COP0_STATUS];
        self.reg[COP0_STATUS] = (sr & !0xf) | ((sr >> 2) & 0xf);
    }

    // ======================= interrupts and the timer =======================

    pub fn assert_irq(&mut self, n: u8) {
        self.reg[COP0_CAUSE] |= 1 << (CAUSE_IP_SHIFT + n as u64);
    }

    pub fn deassert_irq(&mut self, n: u8) {
        self.reg[COP0_CAUSE] &= !(1 << (CAUSE_IP_SHIFT + n as u64));
    }

    pub fn interrupt_pending(&self) -> bool {
        let sr = self.reg[COP0_STATUS];
        let enabled = if self.def.exc_model.is_r3k() {
            sr & 0x01 != 0
        } else {
            sr & STATUS_IE != 0 && sr & (STATUS_EXL | STATUS_ERL) == 0
        };
        enabled && (sr & self.reg[COP0_CAUSE] & CAUSE_IP_MASK) != 0
    }

    /// Advance Count by `n` retired instructions; raises IP7 when Count
    /// passes Compare.
    pub fn tick(&mut self, n: u64) {
        self.instr_count = self.instr_count.wrapping_add(n);
        let old = self.reg[COP0_COUNT] as u32;
        let new = old.wrapping_add(n as u32);
        let compare = self.reg[COP0_COMPARE] as u32;
        let distance = compare.wrapping_sub(old);
        if distance != 0 && (distance as u64) <= n {
            debug!("count/compare crossing, raising timer interrupt");
            self.assert_irq(7);
        }
        self.reg[COP0_COUNT] = new as i32 as i64 as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cpu::cpu_types::cpu_type_by_name;

    fn cop0(model: &str) -> Cop0 {
        Cop0::new(cpu_type_by_name(model).unwrap())
    }

    #[test]
    fn reset_state() {
        let c = cop0("R4000");
        assert_ne!(c.reg[COP0_STATUS] & STATUS_BEV, 0);
        assert!(c.is_kernel_mode());
        assert!(!c.interrupt_pending());
    }

    #[test]
    fn status_write_mask_roundtrip() {
        let mut c = cop0("R4000");
        // attempt to set TS (bit 21): read-only, preserved from the old value
        c.write_register(COP0_STATUS, 0, (1 << 21) | STATUS_IE, false);
        let sr = c.read_register(COP0_STATUS, 0);
        assert_eq!(sr & STATUS_TS, 0);
        assert_ne!(sr & STATUS_IE, 0);
    }

    #[test]
    fn cause_write_touches_only_software_ip() {
        let mut c = cop0("R4000");
        c.assert_irq(7);
        c.write_register(COP0_CAUSE, 0, 0xffff_ffff, false);
        let cause = c.read_register(COP0_CAUSE, 0);
        assert_eq!(cause & CAUSE_IP_MASK, (1 << 15) | 0x300);
        assert_eq!(cause & CAUSE_EXCCODE_MASK, 0);
    }

    #[test]
    fn entryhi_asid_change_reports_effect() {
        let mut c = cop0("R4000");
        let e = c.write_register(COP0_ENTRYHI, 0, 0x10, false);
        assert!(e.asid_changed);
        let e = c.write_register(COP0_ENTRYHI, 0, 0x10, false);
        assert!(!e.asid_changed);
    }

    #[test]
    fn pagemask_accepts_only_valid_masks() {
        let mut c = cop0("R4000");
        c.write_register(COP0_PAGEMASK, 0, 0x3ff << PAGEMASK_SHIFT, false);
        assert_eq!(c.reg[COP0_PAGEMASK], 0x3ff << PAGEMASK_SHIFT);
    }

    #[test]
    fn tlbp_finds_written_entry() {
        let mut c = cop0("R4000");
        c.write_register(COP0_INDEX, 0, 3, false);
        c.write_register(COP0_ENTRYHI, 0, 0x0004_0000 | 0x10, false);
        c.write_register(COP0_ENTRYLO0, 0, (0x1000 >> 12 << 6) | ENTRYLO_V | ENTRYLO_D, false);
        c.write_register(COP0_ENTRYLO1, 0, ENTRYLO_V, false);
        c.write_register(COP0_PAGEMASK, 0, 0, false);
        c.tlbwi();

        // probe with a different index selected
        c.write_register(COP0_INDEX, 0, 0, false);
        c.tlbp();
        assert_eq!(c.reg[COP0_INDEX], 3);

        // tlbr at the returned index restores the entry
        c.tlbr();
        assert_eq!(c.reg[COP0_ENTRYHI], 0x0004_0000 | 0x10);

        // a non-matching probe sets the failure bit
        c.write_register(COP0_ENTRYHI, 0, 0x0008_0000 | 0x11, false);
        c.tlbp();
        assert_ne!(c.reg[COP0_INDEX] & INDEX_P, 0);
    }

    #[test]
    fn r3k_exception_pushes_mode_stack() {
        let mut c = cop0("R3000");
        c.reg[COP0_STATUS] = 0x01; // IEc set, kernel mode
        let pc = c.do_exception(0xffff_ffff_8001_0000, false, &CpuException::Syscall);
        // interrupts now disabled, old state pushed
        assert_eq!(c.reg[COP0_STATUS] & 0x3f, 0x04);
        assert_eq!(pc, 0xffff_ffff_8000_0080);
        assert_eq!(
            (c.reg[COP0_CAUSE] & R2K3K_CAUSE_EXCCODE_MASK) >> CAUSE_EXCCODE_SHIFT,
            8
        );
    }

    #[test]
    fn r4k_exception_sets_exl_and_epc() {
        let mut c = cop0("R4000");
        c.reg[COP0_STATUS] = 0; // BEV clear
        let pc = c.do_exception(0xffff_ffff_8000_1000, false, &CpuException::ArithmeticOverflow);
        assert_eq!(pc, 0xffff_ffff_8000_0180);
        assert_ne!(c.reg[COP0_STATUS] & STATUS_EXL, 0);
        assert_eq!(c.reg[COP0_EPC], 0xffff_ffff_8000_1000);

        // nested exception must not overwrite EPC
        let pc2 = c.do_exception(0xffff_ffff_8000_2000, false, &CpuException::Syscall);
        assert_eq!(pc2, 0xffff_ffff_8000_0180);
        assert_eq!(c.reg[COP0_EPC], 0xffff_ffff_8000_1000);
    }

    #[test]
    fn tlb_refill_vector_and_context() {
        let mut c = cop0("R4000");
        c.reg[COP0_STATUS] = 0;
        c.reg[COP0_ENTRYHI] = 0x10; // ASID
        let exc = CpuException::TlbLoad { vaddr: 0x4000_0000, refill: true, x64: false };
        let pc = c.do_exception(0xffff_ffff_8000_0100, false, &exc);
        assert_eq!(pc, 0xffff_ffff_8000_0000);
        assert_eq!(c.reg[COP0_BADVADDR], 0x4000_0000);
        assert_eq!(
            c.reg[COP0_CONTEXT] & CONTEXT_BADVPN2_MASK,
            ((0x4000_0000u64 >> 13) << 4) & CONTEXT_BADVPN2_MASK
        );
        assert_eq!(c.reg[COP0_ENTRYHI], 0x4000_0000 | 0x10);
    }

    #[test]
    fn delay_slot_exception_records_bd() {
        let mut c = cop0("R4000");
        c.reg[COP0_STATUS] = 0;
        c.do_exception(0xffff_ffff_8000_0104, true, &CpuException::Syscall);
        assert_ne!(c.reg[COP0_CAUSE] & CAUSE_BD, 0);
        assert_eq!(c.reg[COP0_EPC], 0xffff_ffff_8000_0100);
    }

    #[test]
    fn eret_clears_exl() {
        let mut c = cop0("R4000");
        c.reg[COP0_STATUS] = STATUS_EXL;
        c.reg[COP0_EPC] = 0xffff_ffff_8000_0400;
        assert_eq!(c.eret(), 0xffff_ffff_8000_0400);
        assert_eq!(c.reg[COP0_STATUS] & STATUS_EXL, 0);
    }

    #[test]
    fn timer_crossing_raises_ip7() {
        let mut c = cop0("R4000");
        c.write_register(COP0_COMPARE, 0, 100, false);
        c.write_register(COP0_COUNT, 0, 90, false);
        assert_eq!(c.reg[COP0_CAUSE] & (1 << 15), 0);
        c.tick(9);
        assert_eq!(c.reg[COP0_CAUSE] & (1 << 15), 0);
        c.tick(1);
        assert_ne!(c.reg[COP0_CAUSE] & (1 << 15), 0);
        // writing Compare acknowledges the interrupt
        c.write_register(COP0_COMPARE, 0, 200, false);
        assert_eq!(c.reg[COP0_CAUSE] & (1 << 15), 0);
    }
}
