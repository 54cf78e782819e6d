use super::*;
use crate::core::config::ByteOrder;
use crate::core::cpu::cop0::{
    COP0_BADVADDR, COP0_CAUSE, COP0_CONTEXT, COP0_EPC, COP0_STATUS, CAUSE_BD, CAUSE_EXCCODE_SHIFT,
    CONTEXT_BADVPN2_MASK, STATUS_EXL, STATUS_IE,
};
use crate::core::cpu::cpu_types::cpu_type_by_name;
use crate::core::memory::bus::Bus;

const KSEG0: u64 = 0xffff_ffff_8000_0000;

fn make(model: &str, order: ByteOrder) -> (Cpu, Bus) {
    let def = cpu_type_by_name(model).unwrap();
    let cpu = Cpu::new(def, order, 0);
    // cover the whole kseg window including the boot ROM area
    let bus = Bus::new(512 * 1024 * 1024, 1);
    (cpu, bus)
}

fn load_code(cpu: &mut Cpu, bus: &mut Bus, vaddr: u64, words: &[u32]) {
    for (i, w) in words.iter().enumerate() {
        let bytes = match cpu.byte_order() {
            ByteOrder::Little => w.to_le_bytes(),
            ByteOrder::Big => w.to_be_bytes(),
        };
        bus.memory_mut().write((vaddr & 0x1fff_ffff) + i as u64 * 4, &bytes);
    }
    cpu.set_pc(vaddr);
}

fn step_n(cpu: &mut Cpu, bus: &mut Bus, n: usize) {
    for _ in 0..n {
        cpu.step(bus);
    }
}

#[test]
fn addu_sign_extends_the_32bit_result() {
    let (mut cpu, mut bus) = make("R4000", ByteOrder::Big);
    cpu.write_gpr(1, 0x0000_0000_7fff_ffff);
    cpu.write_gpr(2, 1);
    load_code(&mut cpu, &mut bus, KSEG0 | 0x1000, &[0x0022_1821]); // addu $3,$1,$2
    step_n(&mut cpu, &mut bus, 1);
    assert_eq!(cpu.read_gpr(3), 0xffff_ffff_8000_0000);
}

#[test]
fn add_overflow_traps_and_leaves_rd_unchanged() {
    let (mut cpu, mut bus) = make("R4000", ByteOrder::Big);
    cpu.cop0.write_register(COP0_STATUS, 0, 0, false); // BEV off
    cpu.write_gpr(1, 0x0000_0000_7fff_ffff);
    cpu.write_gpr(2, 1);
    cpu.write_gpr(3, 0xdead);
    let pc = KSEG0 | 0x1000;
    load_code(&mut cpu, &mut bus, pc, &[0x0022_1820]); // add $3,$1,$2
    let r = cpu.step(&mut bus);
    assert_eq!(r, StepResult::Exception(CpuException::ArithmeticOverflow));
    assert_eq!(cpu.read_gpr(3), 0xdead);
    assert_eq!(cpu.cop0.reg[COP0_EPC], pc);
    assert_ne!(cpu.cop0.reg[COP0_STATUS] & STATUS_EXL, 0);
    assert_eq!(cpu.get_pc(), 0xffff_ffff_8000_0180);
    assert_eq!(
        (cpu.cop0.reg[COP0_CAUSE] >> CAUSE_EXCCODE_SHIFT) & 0x1f,
        12
    );
}

#[test]
fn branch_executes_its_delay_slot() {
    let (mut cpu, mut bus) = make("R4000", ByteOrder::Big);
    let base = KSEG0 | 0x10;
    // beq $0,$0,+3 ; addiu $1,$0,5
    load_code(&mut cpu, &mut bus, base, &[0x1000_0003, 0x2401_0005]);
    step_n(&mut cpu, &mut bus, 2);
    assert_eq!(cpu.get_pc(), KSEG0 | 0x20);
    assert_eq!(cpu.read_gpr(1), 5);
}

#[test]
fn untaken_likely_branch_annuls_the_slot() {
    let (mut cpu, mut bus) = make("R4000", ByteOrder::Big);
    cpu.write_gpr(1, 1);
    cpu.write_gpr(2, 2);
    let base = KSEG0 | 0x10;
    // beql $1,$2,+3 ; addiu $3,$0,9
    load_code(&mut cpu, &mut bus, base, &[0x5022_0003, 0x2403_0009]);
    step_n(&mut cpu, &mut bus, 2);
    assert_eq!(cpu.read_gpr(3), 0);
    assert_eq!(cpu.get_pc(), base + 8);
}

#[test]
fn taken_likely_branch_executes_the_slot() {
    let (mut cpu, mut bus) = make("R4000", ByteOrder::Big);
    cpu.write_gpr(1, 7);
    cpu.write_gpr(2, 7);
    let base = KSEG0 | 0x10;
    load_code(&mut cpu, &mut bus, base, &[0x5022_0003, 0x2403_0009]);
    step_n(&mut cpu, &mut bus, 2);
    assert_eq!(cpu.read_gpr(3), 9);
    assert_eq!(cpu.get_pc(), base + 4 + 12);
}

#[test]
fn jal_links_past_the_delay_slot() {
    let (mut cpu, mut bus) = make("R4000", ByteOrder::Big);
    let base = KSEG0 | 0x100;
    // jal 0x80002000 ; nop
    load_code(&mut cpu, &mut bus, base, &[(3 << 26) | (0x2000 >> 2), 0]);
    step_n(&mut cpu, &mut bus, 2);
    assert_eq!(cpu.read_gpr(31), base + 8);
    assert_eq!(cpu.get_pc(), 0xffff_ffff_8000_2000);
}

#[test]
fn tlb_refill_on_load_fills_the_cop0_refill_registers() {
    let (mut cpu, mut bus) = make("R4000", ByteOrder::Big);
    cpu.cop0.write_register(COP0_STATUS, 0, 0, false);
    cpu.cop0.write_register(cop0::COP0_ENTRYHI, 0, 0x10, false);
    cpu.write_gpr(4, 0x4000_0000);
    let pc = KSEG0 | 0x1000;
    load_code(&mut cpu, &mut bus, pc, &[0x8c81_0000]); // lw $1,0($4)
    let r = cpu.step(&mut bus);
    assert!(matches!(
        r,
        StepResult::Exception(CpuException::TlbLoad { refill: true, .. })
    ));
    assert_eq!(cpu.get_pc(), 0xffff_ffff_8000_0000); // refill vector
    assert_eq!(cpu.cop0.reg[COP0_BADVADDR], 0x4000_0000);
    assert_eq!(
        (cpu.cop0.reg[COP0_CAUSE] >> CAUSE_EXCCODE_SHIFT) & 0x1f,
        2
    );
    assert_eq!(
        cpu.cop0.reg[COP0_CONTEXT] & CONTEXT_BADVPN2_MASK,
        ((0x4000_0000u64 >> 13) << 4) & CONTEXT_BADVPN2_MASK
    );
    assert_eq!(cpu.cop0.reg[COP0_EPC], pc);
}

#[test]
fn lwl_lwr_reassemble_an_unaligned_word() {
    let (mut cpu, mut bus) = make("R4000", ByteOrder::Little);
    bus.memory_mut().write(0x100, &[0x12, 0x34, 0x56, 0x78]);
    cpu.write_gpr(4, KSEG0 | 0x100);
    let base = KSEG0 | 0x1000;
    // lwl $1,3($4) ; lwr $1,0($4)
    load_code(&mut cpu, &mut bus, base, &[0x8881_0003, 0x9881_0000]);
    step_n(&mut cpu, &mut bus, 2);
    assert_eq!(cpu.read_gpr(1), 0x0000_0000_7856_3412);
}

#[test]
fn lwl_lwr_big_endian_mirror() {
    let (mut cpu, mut bus) = make("R4000", ByteOrder::Big);
    bus.memory_mut().write(0x100, &[0x12, 0x34, 0x56, 0x78]);
    cpu.write_gpr(4, KSEG0 | 0x100);
    let base = KSEG0 | 0x1000;
    // lwl $1,0($4) ; lwr $1,3($4) assembles the word on big-endian
    load_code(&mut cpu, &mut bus, base, &[0x8881_0000, 0x9881_0003]);
    step_n(&mut cpu, &mut bus, 2);
    assert_eq!(cpu.read_gpr(1), 0x0000_0000_1234_5678);
}

#[test]
fn gpr0_stays_zero() {
    let (mut cpu, mut bus) = make("R4000", ByteOrder::Big);
    let base = KSEG0 | 0x1000;
    // addiu $0,$0,123 ; lui $0,0xffff
    load_code(&mut cpu, &mut bus, base, &[0x2400_007b, 0x3c00_ffff]);
    step_n(&mut cpu, &mut bus, 2);
    assert_eq!(cpu.read_gpr(0), 0);
}

#[test]
fn ll_sc_succeeds_without_intervening_store() {
    let (mut cpu, mut bus) = make("R4000", ByteOrder::Big);
    cpu.write_gpr(4, KSEG0 | 0x200);
    bus.memory_mut().write(0x200, &[0, 0, 0, 5]);
    let base = KSEG0 | 0x1000;
    // ll $1,0($4) ; addiu $1,$1,1 ; sc $1,0($4)
    load_code(&mut cpu, &mut bus, base, &[0xc081_0000, 0x2421_0001, 0xe081_0000]);
    step_n(&mut cpu, &mut bus, 3);
    assert_eq!(cpu.read_gpr(1), 1); // success flag
    let mut buf = [0u8; 4];
    bus.memory().read(0x200, &mut buf);
    assert_eq!(u32::from_be_bytes(buf), 6);
}

#[test]
fn sc_fails_after_conflicting_store() {
    let (mut cpu, mut bus) = make("R4000", ByteOrder::Big);
    cpu.write_gpr(4, KSEG0 | 0x200);
    cpu.write_gpr(2, 0x99);
    let base = KSEG0 | 0x1000;
    // ll $1,0($4) ; sw $2,0($4) ; addiu $1,$0,42 ; sc $1,0($4)
    load_code(
        &mut cpu,
        &mut bus,
        base,
        &[0xc081_0000, 0xac82_0000, 0x2401_002a, 0xe081_0000],
    );
    step_n(&mut cpu, &mut bus, 4);
    assert_eq!(cpu.read_gpr(1), 0); // sc failed
    let mut buf = [0u8; 4];
    bus.memory().read(0x200, &mut buf);
    assert_eq!(u32::from_be_bytes(buf), 0x99); // memory untouched by sc
}

#[test]
fn interrupt_is_taken_when_enabled_and_pending() {
    let (mut cpu, mut bus) = make("R4000", ByteOrder::Big);
    // BEV off, IE on, IM2 unmasked
    cpu.cop0
        .write_register(COP0_STATUS, 0, STATUS_IE | (1 << 10), false);
    cpu.cop0.assert_irq(2);
    let base = KSEG0 | 0x1000;
    load_code(&mut cpu, &mut bus, base, &[0x2401_0005]);
    let r = cpu.step(&mut bus);
    assert_eq!(r, StepResult::Exception(CpuException::Interrupt));
    assert_eq!(cpu.get_pc(), 0xffff_ffff_8000_0180);
    assert_eq!(cpu.cop0.reg[COP0_EPC], base);
    assert_eq!((cpu.cop0.reg[COP0_CAUSE] >> CAUSE_EXCCODE_SHIFT) & 0x1f, 0);
    // EXL now blocks further delivery
    assert!(!cpu.cop0.interrupt_pending());
}

#[test]
fn exception_in_delay_slot_sets_bd_and_branch_epc() {
    let (mut cpu, mut bus) = make("R4000", ByteOrder::Big);
    cpu.cop0.write_register(COP0_STATUS, 0, 0, false);
    cpu.write_gpr(4, 0x4000_0000); // unmapped
    let base = KSEG0 | 0x10;
    // beq $0,$0,+4 ; lw $1,0($4)  (slot faults)
    load_code(&mut cpu, &mut bus, base, &[0x1000_0004, 0x8c81_0000]);
    step_n(&mut cpu, &mut bus, 2);
    assert_ne!(cpu.cop0.reg[COP0_CAUSE] & CAUSE_BD, 0);
    assert_eq!(cpu.cop0.reg[COP0_EPC], base);
}

#[test]
fn eret_returns_to_epc_and_clears_exl() {
    let (mut cpu, mut bus) = make("R4000", ByteOrder::Big);
    cpu.cop0.write_register(COP0_STATUS, 0, 0, false);
    let base = KSEG0 | 0x1000;
    load_code(&mut cpu, &mut bus, base, &[0x0000_000c]); // syscall
    cpu.step(&mut bus);
    assert_eq!(cpu.get_pc(), 0xffff_ffff_8000_0180);

    // handler: eret
    load_code(&mut cpu, &mut bus, 0xffff_ffff_8000_0180, &[0x4200_0018]);
    cpu.step(&mut bus);
    assert_eq!(cpu.get_pc(), base); // EPC pointed at the syscall
    assert_eq!(cpu.cop0.reg[COP0_STATUS] & STATUS_EXL, 0);
}

#[test]
fn trap_instruction_raises_on_condition() {
    let (mut cpu, mut bus) = make("R4000", ByteOrder::Big);
    cpu.write_gpr(1, 3);
    cpu.write_gpr(2, 3);
    let base = KSEG0 | 0x1000;
    load_code(&mut cpu, &mut bus, base, &[0x0022_0034]); // teq $1,$2
    let r = cpu.step(&mut bus);
    assert_eq!(r, StepResult::Exception(CpuException::Trap));

    // untaken: different values
    let (mut cpu, mut bus) = make("R4000", ByteOrder::Big);
    cpu.write_gpr(1, 3);
    cpu.write_gpr(2, 4);
    load_code(&mut cpu, &mut bus, base, &[0x0022_0034]);
    assert_eq!(cpu.step(&mut bus), StepResult::Continued);
}

#[test]
fn r3k_exception_and_rfe_roundtrip() {
    let (mut cpu, mut bus) = make("R3000", ByteOrder::Little);
    // enable interrupts in the current mode bits (IEc)
    cpu.cop0.reg[COP0_STATUS] |= 0x01;
    let base = KSEG0 | 0x1000;
    load_code(&mut cpu, &mut bus, base, &[0x0000_000c]); // syscall
    cpu.step(&mut bus);
    // interrupts disabled, old state pushed
    assert_eq!(cpu.cop0.reg[COP0_STATUS] & 0x3f, 0x04);
    assert_eq!(cpu.get_pc(), 0xffff_ffff_bfc0_0280); // BEV still set

    let pc = cpu.get_pc();
    load_code(&mut cpu, &mut bus, pc, &[0x4200_0010]); // rfe
    cpu.step(&mut bus);
    assert_eq!(cpu.cop0.reg[COP0_STATUS] & 0x3f, 0x01);
}

#[test]
fn dmult_produces_a_128bit_product() {
    let (mut cpu, mut bus) = make("R4000", ByteOrder::Big);
    cpu.write_gpr(1, u64::MAX); // -1
    cpu.write_gpr(2, 2);
    let base = KSEG0 | 0x1000;
    load_code(&mut cpu, &mut bus, base, &[0x0022_001c]); // dmult $1,$2
    cpu.step(&mut bus);
    assert_eq!(cpu.get_lo(), (-2i64) as u64);
    assert_eq!(cpu.get_hi(), u64::MAX);
}

#[test]
fn divide_by_zero_clears_hi_lo() {
    let (mut cpu, mut bus) = make("R4000", ByteOrder::Big);
    cpu.write_gpr(1, 100);
    cpu.write_gpr(2, 0);
    cpu.set_hi(0x1234);
    cpu.set_lo(0x5678);
    let base = KSEG0 | 0x1000;
    load_code(&mut cpu, &mut bus, base, &[0x0022_001a]); // div $1,$2
    cpu.step(&mut bus);
    assert_eq!(cpu.get_hi(), 0);
    assert_eq!(cpu.get_lo(), 0);
}

#[test]
fn misaligned_load_raises_address_error() {
    let (mut cpu, mut bus) = make("R4000", ByteOrder::Big);
    cpu.write_gpr(4, KSEG0 | 0x101);
    let base = KSEG0 | 0x1000;
    load_code(&mut cpu, &mut bus, base, &[0x8c81_0000]); // lw $1,0($4)
    let r = cpu.step(&mut bus);
    assert!(matches!(
        r,
        StepResult::Exception(CpuException::AddressErrorLoad(_))
    ));
    assert_eq!(cpu.cop0.reg[COP0_BADVADDR], KSEG0 | 0x101);
}

#[test]
fn sixty_four_bit_ops_are_reserved_on_32bit_cpus() {
    let (mut cpu, mut bus) = make("R3000", ByteOrder::Little);
    let base = KSEG0 | 0x1000;
    load_code(&mut cpu, &mut bus, base, &[0x0022_182d]); // daddu $3,$1,$2
    let r = cpu.step(&mut bus);
    assert!(matches!(
        r,
        StepResult::Exception(CpuException::ReservedInstruction(_))
    ));
}

#[test]
fn swl_swr_store_an_unaligned_word() {
    let (mut cpu, mut bus) = make("R4000", ByteOrder::Little);
    bus.memory_mut().write(0x200, &[0xaa; 8]);
    cpu.write_gpr(4, KSEG0 | 0x201);
    cpu.write_gpr(1, 0x1122_3344);
    let base = KSEG0 | 0x1000;
    // swl $1,3($4) ; swr $1,0($4): unaligned word store at 0x201
    load_code(&mut cpu, &mut bus, base, &[0xa881_0003, 0xb881_0000]);
    step_n(&mut cpu, &mut bus, 2);
    let mut buf = [0u8; 6];
    bus.memory().read(0x200, &mut buf);
    assert_eq!(buf, [0xaa, 0x44, 0x33, 0x22, 0x11, 0xaa]);
}

#[test]
fn wait_yields_to_the_dispatch_loop() {
    let (mut cpu, mut bus) = make("R4000", ByteOrder::Big);
    let base = KSEG0 | 0x1000;
    load_code(&mut cpu, &mut bus, base, &[0x4200_0020]); // wait
    assert_eq!(cpu.step(&mut bus), StepResult::Wait);
    assert_eq!(cpu.get_pc(), base + 4);
}
