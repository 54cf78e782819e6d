/*
Interrupt plumbing between device models and the CPU.

MIPS has eight interrupt-pending bits in the Cause register: IP0/IP1 are
software interrupts, IP2..IP6 are the hardware lines and IP7 is the
internal Count/Compare timer. Devices never hold a CPU reference; they are
handed an IrqHandler during an access and the machine forwards the latched
changes to the CPU afterwards.
*/

pub trait InterruptController {
    fn assert_irq(&mut self, n: u8);
    fn deassert_irq(&mut self, n: u8);
}

pub struct IrqHandler {
    asserted: u8,
    deasserted: u8,
    changed: bool,
}

impl IrqHandler {
    pub fn new() -> Self {
        Self {
            asserted: 0,
            deasserted: 0,
            changed: false,
        }
    }

    pub fn assert_irq(&mut self, n: u8) {
        debug_assert!(n < 8);
        self.asserted |= 1 << n;
        self.deasserted &= !(1 << n);
        self.changed = true;
    }

    pub fn deassert_irq(&mut self, n: u8) {
        debug_assert!(n < 8);
        self.deasserted |= 1 << n;
        self.asserted &= !(1 << n);
        self.changed = true;
    }

    pub fn forward_to_controller<T: InterruptController>(&mut self, controller: &mut T) {
        if self.changed {
            self.changed = false;
            for n in 0..8 {
                if self.asserted & (1 << n) != 0 {
                    controller.assert_irq(n);
                }
                if self.deasserted & (1 << n) != 0 {
                    controller.deassert_irq(n);
                }
            }
            self.asserted = 0;
            self.deasserted = 0;
        }
    }
}

impl Default for IrqHandler {
    fn default() -> Self {
        Self::new()
    }
}
