/*
CPU capability descriptors.

Every supported processor model is described by one entry in
MIPS_CPU_TYPE_DEFS. All model-dependent behaviour in the core (exception
vectoring, MMU layout, TLB geometry, optional instruction quirks) is
dispatched through these descriptors; nothing else in the tree tests a
model name.

  Exception models:
    EXC3K   R2000/R3000 style: 6-bit kernel/user mode stack in Status,
            rotated on exception entry, RFE to return.
    EXC4K   R4000 and newer (including MIPS32/64): EXL/ERL bits in
            Status, ERET to return.

  MMU models:
    MMU3K   64 entries, fixed 4 KiB pages, 6-bit ASID, global bit in lo0.
    MMU4K   variable page size per entry (PageMask), 8-bit ASID,
            per-half global bits.
    MMU8K   R8000: as MMU4K but 192 entries.
    MMU10K  as MMU4K with a 44-bit VPN2 field.
    MMU32/MMU64  MIPS32/MIPS64 cores, MMU4K-compatible layout.
*/

/// Exception handling model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExcModel {
    Exc3k,
    Exc4k,
    Exc32,
    Exc64,
}

impl ExcModel {
    /// R2000/R3000 mode-stack style exception entry.
    pub fn is_r3k(&self) -> bool {
        matches!(self, ExcModel::Exc3k)
    }
}

/// MMU model, selecting TLB layout and segment decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmuModel {
    Mmu3k,
    Mmu4k,
    Mmu8k,
    Mmu10k,
    Mmu32,
    Mmu64,
}

impl MmuModel {
    pub fn is_r3k(&self) -> bool {
        matches!(self, MmuModel::Mmu3k)
    }

    /// VPN2 comparison mask for R4K-style entries.
    pub fn vpn2_mask(&self) -> u64 {
        match self {
            MmuModel::Mmu10k => 0x0000_0fff_ffff_e000,
            _ => 0x0000_00ff_ffff_e000,
        }
    }
}

// Flag bits for CpuTypeDef::flags.
pub const FLAG_NO_LLSC: u32 = 1;
pub const FLAG_DCOUNT: u32 = 2;
pub const FLAG_NO_FPU: u32 = 4;
/// R5900 quirk: MULT/MULTU additionally write rd.
pub const FLAG_R5900_MULT_RD: u32 = 8;

#[derive(Debug)]
pub struct CpuTypeDef {
    pub name: &'static str,
    /// PRId implementation and revision fields.
    pub prid_imp: u32,
    pub prid_rev: u32,
    pub flags: u32,
    pub exc_model: ExcModel,
    pub mmu_model: MmuModel,
    /// MIPS ISA level: 1..=5, or 32/64 for the post-V architectures.
    pub isa_level: u8,
    pub nr_of_tlb_entries: usize,
    /// Base page shift: 12 everywhere except the VR4100 family (10).
    pub page_shift: u32,
}

impl CpuTypeDef {
    pub fn is_32bit(&self) -> bool {
        matches!(self.exc_model, ExcModel::Exc3k | ExcModel::Exc32)
    }

    pub fn has_fpu(&self) -> bool {
        self.flags & FLAG_NO_FPU == 0
    }

    pub fn has_llsc(&self) -> bool {
        self.flags & FLAG_NO_LLSC == 0
    }

    pub fn prid(&self) -> u64 {
        ((self.prid_imp << 8) | self.prid_rev) as u64
    }

    /// True for the 64-bit ISA levels (III and up, and MIPS64).
    pub fn has_64bit_isa(&self) -> bool {
        self.isa_level >= 3 && self.isa_level != 32
    }
}

// PRId implementation numbers.
const IMP_R2000: u32 = 0x01;
const IMP_R3000: u32 = 0x02;
const IMP_R6000: u32 = 0x03;
const IMP_R4000: u32 = 0x04;
const IMP_R4100: u32 = 0x0c;
const IMP_R4200: u32 = 0x0a;
const IMP_R4300: u32 = 0x0b;
const IMP_R4600: u32 = 0x20;
const IMP_R4700: u32 = 0x21;
const IMP_R5000: u32 = 0x23;
const IMP_R5900: u32 = 0x2e;
const IMP_R8000: u32 = 0x10;
const IMP_R10000: u32 = 0x09;
const IMP_R12000: u32 = 0x0e;
const IMP_RM5200: u32 = 0x28;
const IMP_RM7000: u32 = 0x27;
const IMP_4KC: u32 = 0x80;
const IMP_5KC: u32 = 0x81;

pub static MIPS_CPU_TYPE_DEFS: &[CpuTypeDef] = &[
    CpuTypeDef { name: "R2000",  prid_imp: IMP_R2000, prid_rev: 0x00, flags: FLAG_NO_LLSC, exc_model: ExcModel::Exc3k, mmu_model: MmuModel::Mmu3k, isa_level: 1, nr_of_tlb_entries: 64, page_shift: 12 },
    CpuTypeDef { name: "R2000A", prid_imp: IMP_R2000, prid_rev: 0x10, flags: FLAG_NO_LLSC, exc_model: ExcModel::Exc3k, mmu_model: MmuModel::Mmu3k, isa_level: 1, nr_of_tlb_entries: 64, page_shift: 12 },
    CpuTypeDef { name: "R3000",  prid_imp: IMP_R3000, prid_rev: 0x20, flags: FLAG_NO_LLSC, exc_model: ExcModel::Exc3k, mmu_model: MmuModel::Mmu3k, isa_level: 1, nr_of_tlb_entries: 64, page_shift: 12 },
    CpuTypeDef { name: "R3000A", prid_imp: IMP_R3000, prid_rev: 0x30, flags: FLAG_NO_LLSC, exc_model: ExcModel::Exc3k, mmu_model: MmuModel::Mmu3k, isa_level: 1, nr_of_tlb_entries: 64, page_shift: 12 },
    CpuTypeDef { name: "R6000",  prid_imp: IMP_R6000, prid_rev: 0x00, flags: 0, exc_model: ExcModel::Exc3k, mmu_model: MmuModel::Mmu3k, isa_level: 2, nr_of_tlb_entries: 32, page_shift: 12 },
    CpuTypeDef { name: "R4000",  prid_imp: IMP_R4000, prid_rev: 0x00, flags: FLAG_DCOUNT, exc_model: ExcModel::Exc4k, mmu_model: MmuModel::Mmu4k, isa_level: 3, nr_of_tlb_entries: 48, page_shift: 12 },
    CpuTypeDef { name: "R4200",  prid_imp: IMP_R4200, prid_rev: 0x00, flags: 0, exc_model: ExcModel::Exc4k, mmu_model: MmuModel::Mmu4k, isa_level: 3, nr_of_tlb_entries: 32, page_shift: 12 },
    CpuTypeDef { name: "R4300",  prid_imp: IMP_R4300, prid_rev: 0x00, flags: 0, exc_model: ExcModel::Exc4k, mmu_model: MmuModel::Mmu4k, isa_level: 3, nr_of_tlb_entries: 32, page_shift: 12 },
    CpuTypeDef { name: "R4100",  prid_imp: IMP_R4100, prid_rev: 0x00, flags: 0, exc_model: ExcModel::Exc4k, mmu_model: MmuModel::Mmu4k, isa_level: 3, nr_of_tlb_entries: 32, page_shift: 10 },
    CpuTypeDef { name: "VR4102", prid_imp: IMP_R4100, prid_rev: 0x40, flags: FLAG_NO_FPU, exc_model: ExcModel::Exc4k, mmu_model: MmuModel::Mmu4k, isa_level: 3, nr_of_tlb_entries: 32, page_shift: 10 },
    CpuTypeDef { name: "VR4121", prid_imp: IMP_R4100, prid_rev: 0x60, flags: FLAG_NO_FPU, exc_model: ExcModel::Exc4k, mmu_model: MmuModel::Mmu4k, isa_level: 3, nr_of_tlb_entries: 32, page_shift: 10 },
    CpuTypeDef { name: "VR4131", prid_imp: IMP_R4100, prid_rev: 0x80, flags: FLAG_NO_FPU, exc_model: ExcModel::Exc4k, mmu_model: MmuModel::Mmu4k, isa_level: 3, nr_of_tlb_entries: 32, page_shift: 10 },
    CpuTypeDef { name: "R4400",  prid_imp: IMP_R4000, prid_rev: 0x40, flags: FLAG_DCOUNT, exc_model: ExcModel::Exc4k, mmu_model: MmuModel::Mmu4k, isa_level: 3, nr_of_tlb_entries: 48, page_shift: 12 },
    CpuTypeDef { name: "R4600",  prid_imp: IMP_R4600, prid_rev: 0x00, flags: FLAG_DCOUNT, exc_model: ExcModel::Exc4k, mmu_model: MmuModel::Mmu4k, isa_level: 3, nr_of_tlb_entries: 48, page_shift: 12 },
    CpuTypeDef { name: "R4700",  prid_imp: IMP_R4700, prid_rev: 0x00, flags: 0, exc_model: ExcModel::Exc4k, mmu_model: MmuModel::Mmu4k, isa_level: 3, nr_of_tlb_entries: 48, page_shift: 12 },
    CpuTypeDef { name: "R5000",  prid_imp: IMP_R5000, prid_rev: 0x21, flags: FLAG_DCOUNT, exc_model: ExcModel::Exc4k, mmu_model: MmuModel::Mmu4k, isa_level: 4, nr_of_tlb_entries: 48, page_shift: 12 },
    CpuTypeDef { name: "R5900",  prid_imp: IMP_R5900, prid_rev: 0x20, flags: FLAG_R5900_MULT_RD, exc_model: ExcModel::Exc4k, mmu_model: MmuModel::Mmu4k, isa_level: 3, nr_of_tlb_entries: 48, page_shift: 12 },
    CpuTypeDef { name: "RM5200", prid_imp: IMP_RM5200, prid_rev: 0xa0, flags: 0, exc_model: ExcModel::Exc4k, mmu_model: MmuModel::Mmu4k, isa_level: 4, nr_of_tlb_entries: 48, page_shift: 12 },
    CpuTypeDef { name: "RM7000", prid_imp: IMP_RM7000, prid_rev: 0x00, flags: FLAG_DCOUNT, exc_model: ExcModel::Exc4k, mmu_model: MmuModel::Mmu4k, isa_level: 4, nr_of_tlb_entries: 48, page_shift: 12 },
    CpuTypeDef { name: "R8000",  prid_imp: IMP_R8000, prid_rev: 0x00, flags: 0, exc_model: ExcModel::Exc4k, mmu_model: MmuModel::Mmu8k, isa_level: 4, nr_of_tlb_entries: 192, page_shift: 12 },
    CpuTypeDef { name: "R10000", prid_imp: IMP_R10000, prid_rev: 0x26, flags: 0, exc_model: ExcModel::Exc4k, mmu_model: MmuModel::Mmu10k, isa_level: 4, nr_of_tlb_entries: 64, page_shift: 12 },
    CpuTypeDef { name: "R12000", prid_imp: IMP_R12000, prid_rev: 0x23, flags: 0, exc_model: ExcModel::Exc4k, mmu_model: MmuModel::Mmu10k, isa_level: 4, nr_of_tlb_entries: 64, page_shift: 12 },
    CpuTypeDef { name: "4Kc",    prid_imp: IMP_4KC, prid_rev: 0x01, flags: 0, exc_model: ExcModel::Exc32, mmu_model: MmuModel::Mmu32, isa_level: 32, nr_of_tlb_entries: 16, page_shift: 12 },
    CpuTypeDef { name: "5Kc",    prid_imp: IMP_5KC, prid_rev: 0x01, flags: 0, exc_model: ExcModel::Exc64, mmu_model: MmuModel::Mmu64, isa_level: 64, nr_of_tlb_entries: 48, page_shift: 12 },
];

/// Look up a CPU model by name, case-insensitively.
pub fn cpu_type_by_name(name: &str) -> Option<&'static CpuTypeDef> {
    MIPS_CPU_TYPE_DEFS
        .iter()
        .find(|def| def.name.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        assert_eq!(cpu_type_by_name("r4000").unwrap().name, "R4000");
        assert_eq!(cpu_type_by_name("R10000").unwrap().nr_of_tlb_entries, 64);
        assert!(cpu_type_by_name("Z80").is_none());
    }

    #[test]
    fn model_properties() {
        let r3k = cpu_type_by_name("R3000").unwrap();
        assert!(r3k.is_32bit());
        assert!(r3k.exc_model.is_r3k());
        assert!(!r3k.has_llsc());

        let r4k = cpu_type_by_name("R4000").unwrap();
        assert!(!r4k.is_32bit());
        assert!(r4k.has_64bit_isa());

        let vr = cpu_type_by_name("VR4121").unwrap();
        assert_eq!(vr.page_shift, 10);
        assert!(!vr.has_fpu());
    }
}
