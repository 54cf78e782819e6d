use tracing::warn;
use crate::core::cpu::CpuException;
use crate::core::cpu::cop0::*;
use crate::core::cpu::cpu_types::MmuModel;

/// What the access is for; selects the fault kind on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Instr,
    Load,
    Store,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Translation {
    pub paddr: u64,
    pub writable: bool,
}

/*
Memory map, R2000/R3000:

  kuseg  00000000-7fffffff  mapped through the TLB, user accessible
  kseg0  80000000-9fffffff  unmapped, cached, kernel only
  kseg1  a0000000-bfffffff  unmapped, uncached, kernel only
  kseg2  c0000000-ffffffff  mapped through the TLB, kernel only

R4000 and newer add the 64-bit spaces: xuseg, xkphys (unmapped windows
covering all of physical memory) and the sign-extended 32-bit compatibility
segments at 0xffffffff80000000 upward.
*/
pub fn translate(cop0: &Cop0, vaddr: u64, intent: Intent) -> Result<Translation, CpuException> {
    match cop0.def().mmu_model {
        MmuModel::Mmu3k => translate_3k(cop0, vaddr, intent),
        _ => translate_4k(cop0, vaddr, intent),
    }
}

fn addr_error(intent: Intent, vaddr: u64) -> CpuException {
    match intent {
        Intent::Store => CpuException::AddressErrorStore(vaddr),
        _ => CpuException::AddressErrorLoad(vaddr),
    }
}

fn tlb_fault(intent: Intent, vaddr: u64, refill: bool, x64: bool) -> CpuException {
    match intent {
        Intent::Store => CpuException::TlbStore { vaddr, refill, x64 },
        _ => CpuException::TlbLoad { vaddr, refill, x64 },
    }
}

fn translate_3k(cop0: &Cop0, vaddr: u64, intent: Intent) -> Result<Translation, CpuException> {
    let va = vaddr as u32;

    if !cop0.is_kernel_mode() && va >= 0x8000_0000 {
        return Err(addr_error(intent, vaddr));
    }

    match va >> 29 {
        0b100 => {
            // kseg0
            return Ok(Translation { paddr: (va - 0x8000_0000) as u64, writable: true });
        }
        0b101 => {
            // kseg1
            return Ok(Translation { paddr: (va - 0xa000_0000) as u64, writable: true });
        }
        _ => {}
    }

    // kuseg and kseg2 go through the TLB; fixed 4 KiB pages
    let vpn = (va as u64) & R2K3K_ENTRYHI_VPN_MASK;
    let asid = cop0.reg[COP0_ENTRYHI] & R2K3K_ENTRYHI_ASID_MASK;
    let mut hit: Option<&TlbEntry> = None;

    for e in cop0.tlb.iter() {
        let vpn_match = e.hi & R2K3K_ENTRYHI_VPN_MASK == vpn;
        let global = e.lo0 & R2K3K_ENTRYLO_G != 0;
        let asid_match = e.hi & R2K3K_ENTRYHI_ASID_MASK == asid;
        if vpn_match && (global || asid_match) {
            if hit.is_some() {
                warn!("multiple TLB entries match vaddr {:#010x}", va);
                break;
            }
            hit = Some(e);
        }
    }

    let Some(e) = hit else {
        return Err(tlb_fault(intent, vaddr, true, false));
    };
    if e.lo0 & R2K3K_ENTRYLO_V == 0 {
        return Err(tlb_fault(intent, vaddr, false, false));
    }
    let dirty = e.lo0 & R2K3K_ENTRYLO_D != 0;
    if intent == Intent::Store && !dirty {
        return Err(CpuException::TlbModified { vaddr });
    }

    Ok(Translation {
        paddr: (e.lo0 & R2K3K_ENTRYLO_PFN_MASK) | (va as u64 & 0xfff),
        writable: dirty,
    })
}

fn translate_4k(cop0: &Cop0, vaddr: u64, intent: Intent) -> Result<Translation, CpuException> {
    let def = cop0.def();
    let vaddr = if def.is_32bit() { vaddr as i32 as i64 as u64 } else { vaddr };
    let kernel = cop0.is_kernel_mode();
    let user = cop0.is_user_mode();

    // sign-extended 32-bit compatibility segments
    if (0xffff_ffff_8000_0000..=0xffff_ffff_bfff_ffff).contains(&vaddr) {
        // kseg0 / kseg1: unmapped windows onto the first 512 MB
        if !kernel {
            return Err(addr_error(intent, vaddr));
        }
        return Ok(Translation { paddr: vaddr & 0x1fff_ffff, writable: true });
    }

    // xkphys: unmapped kernel windows covering all of physical memory
    if !def.is_32bit() && (0x8000_0000_0000_0000..=0xbfff_ffff_ffff_ffff).contains(&vaddr) {
        if !kernel {
            return Err(addr_error(intent, vaddr));
        }
        return Ok(Translation { paddr: vaddr & 0x0fff_ffff_ffff, writable: true });
    }

    // user space bounds: useg below 2 GB, xuseg up to 2^40
    if user {
        let in_useg = if def.is_32bit() || cop0.reg[COP0_STATUS] & STATUS_UX == 0 {
            vaddr < 0x8000_0000
        } else {
            vaddr <= 0x0000_00ff_ffff_ffff
        };
        if !in_useg {
            return Err(addr_error(intent, vaddr));
        }
    }

    // everything else is mapped through the TLB
    let page_low_bits = (1u64 << (def.page_shift + 1)) - 1;
    let vpn_bits = ENTRYHI_R_MASK | def.mmu_model.vpn2_mask();
    let entry_hi = cop0.reg[COP0_ENTRYHI];
    let mut hit: Option<&TlbEntry> = None;

    for e in cop0.tlb.iter() {
        let mask = e.mask | page_low_bits;
        let vpn_match = (e.hi ^ vaddr) & vpn_bits & !mask == 0;
        let global = e.hi & TLB_G != 0;
        let asid_match = (e.hi ^ entry_hi) & ENTRYHI_ASID == 0;
        if vpn_match && (global || asid_match) {
            if hit.is_some() {
                warn!("multiple TLB entries match vaddr {:#018x}", vaddr);
                break;
            }
            hit = Some(e);
        }
    }

    // XTLB refill when the mode's 64-bit addressing bit is enabled
    let x64 = !def.is_32bit() && {
        let sr = cop0.reg[COP0_STATUS];
        if user {
            sr & STATUS_UX != 0
        } else if kernel {
            sr & STATUS_KX != 0
        } else {
            sr & STATUS_SX != 0
        }
    };

    let Some(e) = hit else {
        return Err(tlb_fault(intent, vaddr, true, x64));
    };

    let mask = e.mask | page_low_bits;
    // bit selecting the odd page of the pair
    let select = (mask + 1) >> 1;
    let lo = if vaddr & select != 0 { e.lo1 } else { e.lo0 };

    if lo & ENTRYLO_V == 0 {
        return Err(tlb_fault(intent, vaddr, false, x64));
    }
    let dirty = lo & ENTRYLO_D != 0;
    if intent == Intent::Store && !dirty {
        return Err(CpuException::TlbModified { vaddr });
    }

    let pfn = (lo & ENTRYLO_PFN_MASK) >> ENTRYLO_PFN_SHIFT;
    Ok(Translation {
        paddr: (pfn << def.page_shift) | (vaddr & (select - 1)),
        writable: dirty,
    })
}
