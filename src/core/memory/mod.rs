use tracing::warn;

pub mod bus;

/*
Sparse physical memory.

A two-level scheme: the top-level table holds one slot per 1 MiB block,
blocks are allocated zero-filled on the first write. Reading an
unallocated block returns zeroes without allocating, so a guest touching
a few megabytes of a nominally multi-gigabyte machine costs only what it
actually dirties.
*/

pub const BITS_PER_MEMBLOCK: usize = 20;
pub const MEMBLOCK_SIZE: usize = 1 << BITS_PER_MEMBLOCK;

pub struct SparseMemory {
    physical_max: u64,
    table: Vec<Option<Box<[u8]>>>,
    warned_out_of_range: bool,
}

impl SparseMemory {
    pub fn new(physical_max: u64) -> Self {
        let nblocks = physical_max.div_ceil(MEMBLOCK_SIZE as u64).max(1) as usize;
        SparseMemory {
            physical_max,
            table: (0..nblocks).map(|_| None).collect(),
            warned_out_of_range: false,
        }
    }

    pub fn physical_max(&self) -> u64 {
        self.physical_max
    }

    /// Host view of the block backing `paddr`, or None when the block has
    /// never been written (reads are all zeroes) or `writeflag` is set and
    /// the address is beyond physical memory. Writing allocates.
    pub fn paddr_to_host(&mut self, paddr: u64, writeflag: bool) -> Option<&mut [u8]> {
        if paddr >= self.physical_max {
            return None;
        }
        let idx = (paddr >> BITS_PER_MEMBLOCK) as usize;
        let slot = &mut self.table[idx];
        if slot.is_none() {
            if !writeflag {
                return None;
            }
            *slot = Some(vec![0u8; MEMBLOCK_SIZE].into_boxed_slice());
        }
        slot.as_deref_mut()
    }

    pub fn read(&self, paddr: u64, buf: &mut [u8]) {
        let mut paddr = paddr;
        let mut done = 0;
        while done < buf.len() {
            if paddr >= self.physical_max {
                buf[done..].fill(0);
                return;
            }
            let idx = (paddr >> BITS_PER_MEMBLOCK) as usize;
            let offset = (paddr & (MEMBLOCK_SIZE as u64 - 1)) as usize;
            let n = (MEMBLOCK_SIZE - offset).min(buf.len() - done);
            match &self.table[idx] {
                Some(block) => buf[done..done + n].copy_from_slice(&block[offset..offset + n]),
                None => buf[done..done + n].fill(0),
            }
            done += n;
            paddr += n as u64;
        }
    }

    pub fn write(&mut self, paddr: u64, data: &[u8]) {
        let mut paddr = paddr;
        let mut done = 0;
        while done < data.len() {
            if paddr >= self.physical_max {
                if !self.warned_out_of_range {
                    warn!(
                        "write beyond physical memory at {:#x} (max {:#x}) ignored",
                        paddr, self.physical_max
                    );
                    self.warned_out_of_range = true;
                }
                return;
            }
            let idx = (paddr >> BITS_PER_MEMBLOCK) as usize;
            let offset = (paddr & (MEMBLOCK_SIZE as u64 - 1)) as usize;
            let n = (MEMBLOCK_SIZE - offset).min(data.len() - done);
            let block = self.table[idx]
                .get_or_insert_with(|| vec![0u8; MEMBLOCK_SIZE].into_boxed_slice());
            block[offset..offset + n].copy_from_slice(&data[done..done + n]);
            done += n;
            paddr += n as u64;
        }
    }

    /// Allocated blocks, keyed by their top-level index. Front-ends use
    /// this to snapshot the RAM contents.
    pub fn leaves(&self) -> impl Iterator<Item = (usize, &[u8])> {
        self.table
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_deref().map(|b| (i, b)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_of_unallocated_memory_are_zero() {
        let mem = SparseMemory::new(64 * 1024 * 1024);
        let mut buf = [0xffu8; 8];
        mem.read(0x12345, &mut buf);
        assert_eq!(buf, [0; 8]);
        assert_eq!(mem.leaves().count(), 0);
    }

    #[test]
    fn write_allocates_only_the_touched_block() {
        let mut mem = SparseMemory::new(64 * 1024 * 1024);
        mem.write(0x30_0000, &[1, 2, 3, 4]);
        assert_eq!(mem.leaves().count(), 1);
        assert_eq!(mem.leaves().next().unwrap().0, 3);

        let mut buf = [0u8; 4];
        mem.read(0x30_0000, &mut buf);
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn access_crossing_block_boundary() {
        let mut mem = SparseMemory::new(64 * 1024 * 1024);
        let base = MEMBLOCK_SIZE as u64 - 2;
        mem.write(base, &[0xaa, 0xbb, 0xcc, 0xdd]);
        let mut buf = [0u8; 4];
        mem.read(base, &mut buf);
        assert_eq!(buf, [0xaa, 0xbb, 0xcc, 0xdd]);
        assert_eq!(mem.leaves().count(), 2);
    }

    #[test]
    fn writes_beyond_physical_max_are_dropped() {
        let mut mem = SparseMemory::new(1024 * 1024);
        mem.write(0x200_0000, &[1]);
        assert_eq!(mem.leaves().count(), 0);
        let mut buf = [0xffu8; 1];
        mem.read(0x200_0000, &mut buf);
        assert_eq!(buf, [0]);
    }
}
