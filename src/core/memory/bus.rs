use tracing::{debug, info, warn};
use crate::core::config::SetupError;
use crate::core::interrupt::IrqHandler;
use crate::core::memory::SparseMemory;

/*
Physical address routing.

RAM accesses go to the sparse memory store. Device ranges shadow RAM:
anything inside [base, base+len) is dispatched to the device handler (or
served from its direct buffer) and never touches the RAM backing. Devices
do not hold CPU references; interrupts are raised through the IrqHandler
passed into each access and forwarded by the machine afterwards.
*/

pub const DEV_READ: u32 = 1;
pub const DEV_WRITE: u32 = 2;
/// Reads inside the direct buffer may bypass the handler.
pub const DEV_DYNTRANS_OK: u32 = 4;
/// Writes inside the direct buffer may bypass the handler.
pub const DEV_DYNTRANS_WRITE_OK: u32 = 8;

/// Device ranges (and their direct buffers) are aligned to the page size
/// used by the translation engine.
pub const DEV_ALIGNMENT: u64 = 0xfff;

/// Granularity at which stores break load-linked reservations.
pub const RMW_LINE: u64 = 16;

pub trait DeviceHandler {
    /// Returns false on failure, which the CPU turns into a bus error.
    fn access(&mut self, irq: &mut IrqHandler, offset: u64, data: &mut [u8], write: bool) -> bool;
}

struct DirectBuffer {
    data: Vec<u8>,
    write_low: u64,
    write_high: u64,
}

struct Device {
    name: String,
    base: u64,
    len: u64,
    flags: u32,
    handler: Box<dyn DeviceHandler>,
    direct: Option<DirectBuffer>,
}

/// Failed bus access; the CPU raises a bus-error exception for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusFault;

pub struct Bus {
    mem: SparseMemory,
    devices: Vec<Device>,
    pub irq: IrqHandler,
    dev_min: u64,
    dev_max: u64,
    /// One load-linked reservation (an aligned RMW_LINE address) per CPU.
    ll_reservations: Vec<Option<u64>>,
    /// RAM ranges stored to since the last drain; feeds translation
    /// invalidation.
    dirty_log: Vec<(u64, u32)>,
}

impl Bus {
    pub fn new(physical_max: u64, ncpus: usize) -> Self {
        Bus {
            mem: SparseMemory::new(physical_max),
            devices: Vec::new(),
            irq: IrqHandler::new(),
            dev_min: u64::MAX,
            dev_max: 0,
            ll_reservations: vec![None; ncpus],
            dirty_log: Vec::new(),
        }
    }

    pub fn memory(&self) -> &SparseMemory {
        &self.mem
    }

    pub fn memory_mut(&mut self) -> &mut SparseMemory {
        &mut self.mem
    }

    // ======================= device registration =======================

    pub fn device_register(
        &mut self,
        name: &str,
        base: u64,
        len: u64,
        flags: u32,
        handler: Box<dyn DeviceHandler>,
        direct_buffer: Option<Vec<u8>>,
    ) -> Result<usize, SetupError> {
        for d in &self.devices {
            if base + len > d.base && base < d.base + d.len {
                return Err(SetupError::OverlappingDevice {
                    name: name.to_string(),
                    existing: d.name.clone(),
                });
            }
        }
        if flags & (DEV_DYNTRANS_OK | DEV_DYNTRANS_WRITE_OK) != 0 && base & DEV_ALIGNMENT != 0 {
            return Err(SetupError::MisalignedDevice { name: name.to_string(), base });
        }

        info!("device {} at {:#010x}, len {:#x}", name, base, len);
        self.devices.push(Device {
            name: name.to_string(),
            base,
            len,
            flags,
            handler,
            direct: direct_buffer.map(|data| DirectBuffer {
                data,
                write_low: u64::MAX,
                write_high: 0,
            }),
        });
        self.recompute_device_span();
        Ok(self.devices.len() - 1)
    }

    pub fn device_remove(&mut self, id: usize) {
        if id >= self.devices.len() {
            warn!("device_remove: invalid device id {}", id);
            return;
        }
        self.devices.remove(id);
        self.recompute_device_span();
    }

    fn recompute_device_span(&mut self) {
        self.dev_min = u64::MAX;
        self.dev_max = 0;
        for d in &self.devices {
            self.dev_min = self.dev_min.min(d.base & !DEV_ALIGNMENT);
            self.dev_max = self.dev_max.max((d.base + d.len - 1) | DEV_ALIGNMENT);
        }
    }

    /// Harvest and reset a device's direct-buffer dirty window. Devices
    /// with frame buffers use this to coalesce repaints.
    pub fn device_dyntrans_watermark(&mut self, id: usize) -> Option<(u64, u64)> {
        let d = self.devices.get_mut(id)?;
        let buf = d.direct.as_mut()?;
        if buf.write_low == u64::MAX {
            return None;
        }
        let window = (buf.write_low, buf.write_high);
        buf.write_low = u64::MAX;
        buf.write_high = 0;
        Some(window)
    }

    /// Read-only view of a device's direct buffer.
    pub fn device_direct_data(&self, id: usize) -> Option<&[u8]> {
        self.devices.get(id)?.direct.as_ref().map(|b| b.data.as_slice())
    }

    // ======================= physical access =======================

    fn device_index(&self, paddr: u64) -> Option<usize> {
        if paddr < self.dev_min || paddr > self.dev_max {
            return None;
        }
        self.devices
            .iter()
            .position(|d| paddr >= d.base && paddr < d.base + d.len)
    }

    /// True when no device range intersects the 4 KiB page; such pages may
    /// be cached by the translation engine's fast path.
    pub fn page_is_pure_ram(&self, paddr_page: u64) -> bool {
        let page_end = paddr_page + 0x1000;
        !self
            .devices
            .iter()
            .any(|d| page_end > d.base && paddr_page < d.base + d.len)
    }

    /// True when the whole page sits inside one device's direct buffer and
    /// the device allows handler-free access of the requested kind, so
    /// translated code may touch it without a callback.
    pub fn page_is_direct_ok(&self, paddr_page: u64, write: bool) -> bool {
        let needed = if write {
            DEV_DYNTRANS_OK | DEV_DYNTRANS_WRITE_OK
        } else {
            DEV_DYNTRANS_OK
        };
        self.devices.iter().any(|d| {
            d.flags & needed == needed
                && paddr_page >= d.base
                && match &d.direct {
                    Some(direct) => {
                        paddr_page + 0x1000 <= d.base + direct.data.len() as u64
                    }
                    None => false,
                }
        })
    }

    pub fn read_phys(&mut self, paddr: u64, buf: &mut [u8]) -> Result<(), BusFault> {
        if let Some(i) = self.device_index(paddr) {
            let d = &mut self.devices[i];
            let offset = paddr - d.base;
            if d.flags & DEV_READ == 0 {
                warn!("read from write-only device {} at offset {:#x}", d.name, offset);
                return Err(BusFault);
            }
            if d.flags & DEV_DYNTRANS_OK != 0 {
                if let Some(direct) = &d.direct {
                    let end = offset as usize + buf.len();
                    if end <= direct.data.len() {
                        buf.copy_from_slice(&direct.data[offset as usize..end]);
                        return Ok(());
                    }
                }
            }
            if d.handler.access(&mut self.irq, offset, buf, false) {
                Ok(())
            } else {
                debug!("device {} failed read at offset {:#x}", d.name, offset);
                Err(BusFault)
            }
        } else {
            self.mem.read(paddr, buf);
            Ok(())
        }
    }

    pub fn write_phys(&mut self, paddr: u64, data: &[u8]) -> Result<(), BusFault> {
        self.break_reservations(paddr, data.len() as u64);

        if let Some(i) = self.device_index(paddr) {
            let d = &mut self.devices[i];
            let offset = paddr - d.base;
            if d.flags & DEV_WRITE == 0 {
                warn!("write to read-only device {} at offset {:#x}", d.name, offset);
                return Err(BusFault);
            }
            if d.flags & DEV_DYNTRANS_WRITE_OK != 0 {
                if let Some(direct) = &mut d.direct {
                    let end = offset as usize + data.len();
                    if end <= direct.data.len() {
                        direct.data[offset as usize..end].copy_from_slice(data);
                        direct.write_low = direct.write_low.min(offset);
                        direct.write_high = direct.write_high.max(end as u64 - 1);
                        self.dirty_log.push((paddr, data.len() as u32));
                        return Ok(());
                    }
                }
            }
            let mut tmp = data.to_vec();
            if d.handler.access(&mut self.irq, offset, &mut tmp, true) {
                Ok(())
            } else {
                debug!("device {} failed write at offset {:#x}", d.name, offset);
                Err(BusFault)
            }
        } else {
            self.mem.write(paddr, data);
            self.dirty_log.push((paddr, data.len() as u32));
            Ok(())
        }
    }

    /// Read without side effects: no device handlers, no allocation.
    /// Used by introspection (disassembly dumps).
    pub fn peek_phys(&self, paddr: u64, buf: &mut [u8]) -> bool {
        if let Some(i) = self.device_index(paddr) {
            let d = &self.devices[i];
            let offset = (paddr - d.base) as usize;
            if let Some(direct) = &d.direct {
                if offset + buf.len() <= direct.data.len() {
                    buf.copy_from_slice(&direct.data[offset..offset + buf.len()]);
                    return true;
                }
            }
            return false;
        }
        self.mem.read(paddr, buf);
        true
    }

    /// Drain the RAM ranges stored to since the last call.
    pub fn take_dirty_log(&mut self, out: &mut Vec<(u64, u32)>) {
        out.append(&mut self.dirty_log);
    }

    pub fn dirty_log_is_empty(&self) -> bool {
        self.dirty_log.is_empty()
    }

    // ======================= load-linked tracking =======================

    pub fn set_ll_reservation(&mut self, cpu_id: usize, paddr: u64) {
        self.ll_reservations[cpu_id] = Some(paddr & !(RMW_LINE - 1));
    }

    pub fn clear_ll_reservation(&mut self, cpu_id: usize) {
        self.ll_reservations[cpu_id] = None;
    }

    /// SC: returns whether the reservation survived, consuming it.
    pub fn take_ll_reservation(&mut self, cpu_id: usize) -> bool {
        self.ll_reservations[cpu_id].take().is_some()
    }

    fn break_reservations(&mut self, paddr: u64, len: u64) {
        let lo = paddr & !(RMW_LINE - 1);
        let hi = (paddr + len.max(1) - 1) & !(RMW_LINE - 1);
        for r in self.ll_reservations.iter_mut() {
            if let Some(line) = r {
                if *line >= lo && *line <= hi {
                    *r = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestDevice {
        fail: bool,
        last_write: Option<(u64, Vec<u8>)>,
        raise_on_write: Option<u8>,
    }

    impl DeviceHandler for TestDevice {
        fn access(&mut self, irq: &mut IrqHandler, offset: u64, data: &mut [u8], write: bool) -> bool {
            if self.fail {
                return false;
            }
            if write {
                self.last_write = Some((offset, data.to_vec()));
                if let Some(n) = self.raise_on_write {
                    irq.assert_irq(n);
                }
            } else {
                data.fill(0x5a);
            }
            true
        }
    }

    fn test_device() -> Box<TestDevice> {
        Box::new(TestDevice { fail: false, last_write: None, raise_on_write: None })
    }

    #[test]
    fn ram_read_write_roundtrip() {
        let mut bus = Bus::new(16 * 1024 * 1024, 1);
        bus.write_phys(0x1000, &[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 4];
        bus.read_phys(0x1000, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn device_shadows_ram() {
        let mut bus = Bus::new(16 * 1024 * 1024, 1);
        bus.device_register("test", 0x1f00_0000, 0x100, DEV_READ | DEV_WRITE, test_device(), None)
            .unwrap();
        let mut buf = [0u8; 4];
        bus.read_phys(0x1f00_0010, &mut buf).unwrap();
        assert_eq!(buf, [0x5a; 4]);
    }

    #[test]
    fn overlapping_registration_is_rejected() {
        let mut bus = Bus::new(16 * 1024 * 1024, 1);
        bus.device_register("a", 0x1000_0000, 0x2000, DEV_READ, test_device(), None)
            .unwrap();
        let err = bus
            .device_register("b", 0x1000_1000, 0x1000, DEV_READ, test_device(), None)
            .unwrap_err();
        assert!(matches!(err, SetupError::OverlappingDevice { .. }));
    }

    #[test]
    fn dyntrans_device_must_be_aligned() {
        let mut bus = Bus::new(16 * 1024 * 1024, 1);
        let err = bus
            .device_register("fb", 0x1000_0800, 0x1000, DEV_READ | DEV_DYNTRANS_OK, test_device(), None)
            .unwrap_err();
        assert!(matches!(err, SetupError::MisalignedDevice { .. }));
    }

    #[test]
    fn direct_buffer_serves_access_and_tracks_watermarks() {
        let mut bus = Bus::new(16 * 1024 * 1024, 1);
        let id = bus
            .device_register(
                "fb",
                0x1200_0000,
                0x1000,
                DEV_READ | DEV_WRITE | DEV_DYNTRANS_OK | DEV_DYNTRANS_WRITE_OK,
                test_device(),
                Some(vec![0u8; 0x1000]),
            )
            .unwrap();

        assert!(bus.device_dyntrans_watermark(id).is_none());
        bus.write_phys(0x1200_0040, &[9, 9]).unwrap();
        bus.write_phys(0x1200_0100, &[7]).unwrap();
        assert_eq!(bus.device_dyntrans_watermark(id), Some((0x40, 0x100)));
        assert!(bus.device_dyntrans_watermark(id).is_none());

        let mut buf = [0u8; 2];
        bus.read_phys(0x1200_0040, &mut buf).unwrap();
        assert_eq!(buf, [9, 9]);
    }

    #[test]
    fn failed_device_access_is_a_bus_fault() {
        let mut bus = Bus::new(16 * 1024 * 1024, 1);
        bus.device_register(
            "bad",
            0x1f00_0000,
            0x100,
            DEV_READ | DEV_WRITE,
            Box::new(TestDevice { fail: true, last_write: None, raise_on_write: None }),
            None,
        )
        .unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(bus.read_phys(0x1f00_0000, &mut buf), Err(BusFault));
        assert_eq!(bus.write_phys(0x1f00_0000, &buf), Err(BusFault));
    }

    #[test]
    fn stores_break_ll_reservations_on_the_same_line() {
        let mut bus = Bus::new(16 * 1024 * 1024, 2);
        bus.set_ll_reservation(0, 0x2000);
        bus.set_ll_reservation(1, 0x3000);
        bus.write_phys(0x2008, &[1]).unwrap(); // same 16-byte line as 0x2000
        assert!(!bus.take_ll_reservation(0));
        assert!(bus.take_ll_reservation(1));
        assert!(!bus.take_ll_reservation(1)); // consumed
    }

    #[test]
    fn dirty_log_records_ram_stores() {
        let mut bus = Bus::new(16 * 1024 * 1024, 1);
        bus.write_phys(0x4000, &[1, 2, 3, 4]).unwrap();
        let mut log = Vec::new();
        bus.take_dirty_log(&mut log);
        assert_eq!(log, vec![(0x4000, 4)]);
        assert!(bus.dirty_log_is_empty());
    }
}
