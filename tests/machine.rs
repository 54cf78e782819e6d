mod common;

use common::*;
use r_mips::core::cpu::cop0::{COP0_CAUSE, COP0_EPC, COP0_STATUS};
use r_mips::core::interrupt::IrqHandler;
use r_mips::core::machine::{Machine, PromAction, RunReason};
use r_mips::core::memory::bus::{DeviceHandler, DEV_DYNTRANS_OK, DEV_DYNTRANS_WRITE_OK, DEV_READ, DEV_WRITE};

struct IrqOnWrite;

impl DeviceHandler for IrqOnWrite {
    fn access(&mut self, irq: &mut IrqHandler, _offset: u64, data: &mut [u8], write: bool) -> bool {
        if write {
            irq.assert_irq(2);
        } else {
            data.fill(0);
        }
        true
    }
}

#[test]
fn device_write_raises_an_interrupt_that_vectors() {
    let code = [
        // $1 = IE | IM2, mtc0 $1,$status (clears BEV as a side effect)
        ori(1, 0, 0x0401),
        (0x10 << 26) | (0x04 << 21) | (1 << 16) | (12 << 11),
        // $4 = device base through kseg1
        lui(4, 0xbf00),
        sw(0, 0, 4),
        NOP,
        NOP,
        WAIT,
    ];
    // the handler parks the machine
    let handler = [WAIT];

    let mut m = machine_with_code("R4000", false, &code);
    load_words(&mut m, 0x180, &handler);
    m.bus_mut()
        .device_register("intc", 0x1f00_0000, 0x100, DEV_READ | DEV_WRITE, Box::new(IrqOnWrite), None)
        .unwrap();

    let (_, reason) = m.run(1000);
    assert_eq!(reason, RunReason::Halted);

    let cpu = m.cpu(0);
    // the interrupt vectored: EPC inside the main code, ExcCode = Int
    let epc = cpu.cop0.reg[COP0_EPC];
    assert!(epc >= CODE_VADDR && epc < CODE_VADDR + 0x40, "epc = {:#x}", epc);
    assert_eq!((cpu.cop0.reg[COP0_CAUSE] >> 2) & 0x1f, 0);
    assert_ne!(cpu.cop0.reg[COP0_CAUSE] & (1 << 10), 0); // IP2 still asserted
    assert_ne!(cpu.cop0.reg[COP0_STATUS] & 0x2, 0); // EXL set in the handler
}

struct NeverCalled;

impl DeviceHandler for NeverCalled {
    fn access(&mut self, _irq: &mut IrqHandler, _offset: u64, _data: &mut [u8], _write: bool) -> bool {
        panic!("direct buffer should have served this access");
    }
}

#[test]
fn frame_buffer_writes_are_coalesced_into_watermarks() {
    for dyntrans in [false, true] {
        let code = [
            lui(4, 0xb200),  // kseg1 -> paddr 0x12000000
            ori(1, 0, 0xab),
            sb(1, 0x40, 4),
            sb(1, 0x7f, 4),
            WAIT,
        ];
        let mut m = machine_with_code("R4000", dyntrans, &code);
        let id = m
            .bus_mut()
            .device_register(
                "fb",
                0x1200_0000,
                0x2000,
                DEV_READ | DEV_WRITE | DEV_DYNTRANS_OK | DEV_DYNTRANS_WRITE_OK,
                Box::new(NeverCalled),
                Some(vec![0u8; 0x2000]),
            )
            .unwrap();

        let (_, reason) = m.run(1000);
        assert_eq!(reason, RunReason::Halted);

        assert_eq!(m.bus_mut().device_dyntrans_watermark(id), Some((0x40, 0x7f)));
        assert_eq!(m.bus_mut().device_dyntrans_watermark(id), None);
        let data = m.bus().device_direct_data(id).unwrap();
        assert_eq!(data[0x40], 0xab);
        assert_eq!(data[0x7f], 0xab);
    }
}

#[test]
fn prom_range_hook_is_invoked_and_returns() {
    // the jal target lands in the kseg0 alias of the ROM window
    let prom_base = 0xffff_ffff_9fc0_0000u64;
    let code = [
        // call the firmware entry point, then park
        jal(0x1fc0_0000),
        NOP,
        WAIT,
    ];
    let mut m = machine_with_code("R4000", false, &code);
    m.register_prom_range(
        prom_base,
        0x1000,
        Box::new(|cpu, _bus| {
            cpu.write_gpr(2, 42);
            PromAction::Handled
        }),
    );

    let (_, reason) = m.run(1000);
    assert_eq!(reason, RunReason::Halted);
    assert_eq!(m.cpu(0).read_gpr(2), 42);
    // execution resumed after the call site
    assert_eq!(m.cpu(0).get_pc(), CODE_VADDR + 0xc);
}

#[test]
fn breakpoints_report_back_to_the_front_end() {
    let code = [addiu(1, 0, 1), addiu(2, 0, 2), addiu(3, 0, 3), WAIT];
    let mut m = machine_with_code("R4000", false, &code);
    m.add_breakpoint(CODE_VADDR + 8);
    let (executed, reason) = m.run(1000);
    assert_eq!(reason, RunReason::Breakpoint);
    assert_eq!(executed, 2);
    assert_eq!(m.cpu(0).get_pc(), CODE_VADDR + 8);
    assert_eq!(m.cpu(0).read_gpr(3), 0);

    m.remove_breakpoint(CODE_VADDR + 8);
    let (_, reason) = m.run(10);
    assert_eq!(reason, RunReason::Halted);
    assert_eq!(m.cpu(0).read_gpr(3), 3);
}

#[test]
fn unknown_cpu_type_is_a_setup_error() {
    let cfg = config("Z9000", false);
    assert!(Machine::new(&cfg).is_err());
}

#[test]
fn run_reports_completed_when_budget_is_consumed() {
    // straight-line nops into a self-loop
    let code = [NOP, NOP, NOP, NOP, j(0x1010), NOP];
    let mut m = machine_with_code("R4000", false, &code);
    let (executed, reason) = m.run(100);
    assert_eq!(reason, RunReason::Completed);
    assert_eq!(executed, 100);
}
