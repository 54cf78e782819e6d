use std::collections::HashMap;
use tracing::{debug, info};
use crate::core::config::ByteOrder;
use crate::core::cpu::instruction::{Instruction, Opcode};
use crate::core::memory::bus::Bus;

pub mod chunk;
pub mod runtime;

use chunk::ChunkOp;

/*
Dynamic translation cache.

Translation operates on physical pages, which keeps chunks valid across
process switches and TLB refills. Each translated page tracks, per 4-byte
instruction slot, the pool offset of the chunk starting there (zero
meaning none) and an untranslatable flag so failed attempts are not
repeated. When the operation pool runs into its margin the whole cache is
flushed and translation starts over; there is no partial eviction.
*/

pub const DYNTRANS_PAGE_SIZE: u64 = 0x1000;
pub const SLOTS_PER_PAGE: usize = 1024;
/// Upper bound on guest instructions per translated block.
pub const MAX_BLOCK_INSTRUCTIONS: usize = 128;
/// Blocks shorter than this are not worth entering.
pub const MIN_BLOCK_INSTRUCTIONS: usize = 2;
/// Flush headroom: the longest block plus its stubs must always fit.
pub const CODE_POOL_MARGIN: usize = MAX_BLOCK_INSTRUCTIONS + 8;

pub struct TranslationPage {
    /// Pool offset + 1 of the chunk starting at each slot; 0 = none.
    chunk_start: [u32; SLOTS_PER_PAGE],
    untranslatable: [u8; SLOTS_PER_PAGE / 8],
    live_chunks: u32,
}

impl TranslationPage {
    fn new() -> Self {
        TranslationPage {
            chunk_start: [0; SLOTS_PER_PAGE],
            untranslatable: [0; SLOTS_PER_PAGE / 8],
            live_chunks: 0,
        }
    }

    fn chunk_at(&self, slot: usize) -> Option<usize> {
        match self.chunk_start[slot] {
            0 => None,
            ofs => Some(ofs as usize - 1),
        }
    }

    fn set_chunk(&mut self, slot: usize, pool_offset: usize) {
        if self.chunk_start[slot] == 0 {
            self.live_chunks += 1;
        }
        self.chunk_start[slot] = pool_offset as u32 + 1;
    }

    fn is_untranslatable(&self, slot: usize) -> bool {
        self.untranslatable[slot >> 3] & (1 << (slot & 7)) != 0
    }

    fn mark_untranslatable(&mut self, slot: usize) {
        self.untranslatable[slot >> 3] |= 1 << (slot & 7);
    }

    /// Drop every chunk on the page, keeping the untranslatable flags.
    fn invalidate(&mut self) {
        if self.live_chunks > 0 {
            self.chunk_start = [0; SLOTS_PER_PAGE];
            self.live_chunks = 0;
        }
    }
}

pub struct TranslationCache {
    pages: HashMap<u64, TranslationPage>,
    pool: Vec<ChunkOp>,
    pool_capacity: usize,
    pub enabled: bool,
    translations: u64,
    flushes: u64,
}

impl TranslationCache {
    pub fn new(enabled: bool, pool_capacity: usize) -> Self {
        TranslationCache {
            pages: HashMap::new(),
            pool: Vec::with_capacity(if enabled { pool_capacity } else { 0 }),
            pool_capacity,
            enabled,
            translations: 0,
            flushes: 0,
        }
    }

    pub fn lookup(&self, paddr: u64) -> Option<usize> {
        let page = self.pages.get(&(paddr & !(DYNTRANS_PAGE_SIZE - 1)))?;
        page.chunk_at(((paddr & (DYNTRANS_PAGE_SIZE - 1)) >> 2) as usize)
    }

    pub fn is_marked_untranslatable(&self, paddr: u64) -> bool {
        match self.pages.get(&(paddr & !(DYNTRANS_PAGE_SIZE - 1))) {
            Some(page) => page.is_untranslatable(((paddr & (DYNTRANS_PAGE_SIZE - 1)) >> 2) as usize),
            None => false,
        }
    }

    pub fn op_at(&self, index: usize) -> ChunkOp {
        self.pool[index]
    }

    /// Any live chunk translated from this physical page?
    pub fn page_has_translation(&self, paddr_page: u64) -> bool {
        self.pages
            .get(&paddr_page)
            .is_some_and(|p| p.live_chunks > 0)
    }

    /// Drop all translations that intersect [paddr, paddr+len). Stores
    /// into translated pages go through this, so code that rewrites
    /// itself self-invalidates.
    pub fn invalidate_paddr_range(&mut self, paddr: u64, len: u64) {
        let first = paddr & !(DYNTRANS_PAGE_SIZE - 1);
        let last = (paddr + len.max(1) - 1) & !(DYNTRANS_PAGE_SIZE - 1);
        let mut page = first;
        loop {
            if let Some(p) = self.pages.get_mut(&page) {
                p.invalidate();
            }
            if page == last {
                break;
            }
            page += DYNTRANS_PAGE_SIZE;
        }
    }

    /// Throw away everything and start over.
    pub fn flush(&mut self) {
        info!("translation cache full, flushing and starting over");
        self.pages.clear();
        self.pool.clear();
        self.flushes += 1;
    }

    pub fn stats(&self) -> (u64, u64) {
        (self.translations, self.flushes)
    }

    /// Try to translate a block starting at `paddr`. Returns true when a
    /// chunk is now available there.
    pub fn attempt_translate(
        &mut self,
        bus: &mut Bus,
        byte_order: ByteOrder,
        has_64bit_isa: bool,
        paddr: u64,
    ) -> bool {
        if !self.enabled || paddr & 3 != 0 {
            return false;
        }
        let paddr_page = paddr & !(DYNTRANS_PAGE_SIZE - 1);
        let slot0 = ((paddr & (DYNTRANS_PAGE_SIZE - 1)) >> 2) as usize;

        if let Some(page) = self.pages.get(&paddr_page) {
            if page.is_untranslatable(slot0) {
                return false;
            }
            if page.chunk_at(slot0).is_some() {
                return true;
            }
        }
        // only code in plain RAM is translated
        if !bus.page_is_pure_ram(paddr_page) {
            return false;
        }

        if self.pool.len() + CODE_POOL_MARGIN >= self.pool_capacity {
            self.flush();
        }

        let mut page_bytes = [0u8; DYNTRANS_PAGE_SIZE as usize];
        if bus.read_phys(paddr_page, &mut page_bytes).is_err() {
            return false;
        }
        let word_at = |slot: usize| -> u32 {
            let b: [u8; 4] = page_bytes[slot * 4..slot * 4 + 4].try_into().unwrap();
            match byte_order {
                ByteOrder::Little => u32::from_le_bytes(b),
                ByteOrder::Big => u32::from_be_bytes(b),
            }
        };

        let pool_start = self.pool.len();
        let mut slot = slot0;
        let mut count = 0usize;
        let mut open_ended = true;

        'build: while slot < SLOTS_PER_PAGE && count < MAX_BLOCK_INSTRUCTIONS {
            let i = Instruction(word_at(slot));
            let opcode = Opcode::from_instruction(&i);
            let translated = if !has_64bit_isa && chunk::needs_64bit(opcode) {
                None
            } else {
                chunk::translate_op(opcode, &i)
            };

            match translated {
                Some(op) if chunk::ends_block(&op) => {
                    match op {
                        ChunkOp::Branch { .. } | ChunkOp::Jump { .. } | ChunkOp::JumpReg { .. } => {
                            // a branch needs its delay slot in the same page
                            if slot + 1 >= SLOTS_PER_PAGE {
                                break 'build;
                            }
                            let di = Instruction(word_at(slot + 1));
                            let dop = Opcode::from_instruction(&di);
                            let delay = if !has_64bit_isa && chunk::needs_64bit(dop) {
                                None
                            } else {
                                chunk::translate_op(dop, &di)
                            };
                            match delay {
                                Some(d) if !chunk::ends_block(&d) => {
                                    self.pool.push(op);
                                    self.pool.push(d);
                                    self.pool.push(ChunkOp::DelayedBranch);
                                    count += 2;
                                    open_ended = false;
                                }
                                _ => {}
                            }
                            break 'build;
                        }
                        ChunkOp::Eret | ChunkOp::Syscall | ChunkOp::Break => {
                            self.pool.push(op);
                            count += 1;
                            open_ended = false;
                            break 'build;
                        }
                        _ => break 'build,
                    }
                }
                Some(op) => {
                    self.pool.push(op);
                    count += 1;
                    slot += 1;
                }
                None => break 'build,
            }
        }

        if count < MIN_BLOCK_INSTRUCTIONS {
            self.pool.truncate(pool_start);
            self.pages
                .entry(paddr_page)
                .or_insert_with(TranslationPage::new)
                .mark_untranslatable(slot0);
            return false;
        }

        if open_ended {
            self.pool.push(ChunkOp::EndOfBlock);
        }
        self.pages
            .entry(paddr_page)
            .or_insert_with(TranslationPage::new)
            .set_chunk(slot0, pool_start);
        self.translations += 1;
        debug!(
            "translated {} instructions at paddr {:#x} (pool {}..{})",
            count,
            paddr,
            pool_start,
            self.pool.len()
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::memory::bus::Bus;

    fn bus_with_code(paddr: u64, words: &[u32]) -> Bus {
        let mut bus = Bus::new(16 * 1024 * 1024, 1);
        for (i, w) in words.iter().enumerate() {
            bus.write_phys(paddr + i as u64 * 4, &w.to_le_bytes()).unwrap();
        }
        let mut sink = Vec::new();
        bus.take_dirty_log(&mut sink);
        bus
    }

    #[test]
    fn translates_a_straight_line_block() {
        // addiu $1,$0,5 ; addiu $2,$0,7 ; addu $3,$1,$2 ; jr $ra ; nop
        let code = [0x2401_0005, 0x2402_0007, 0x0022_1821, 0x03E0_0008, 0x0000_0000];
        let mut bus = bus_with_code(0x1000, &code);
        let mut cache = TranslationCache::new(true, 4096);

        assert!(cache.attempt_translate(&mut bus, ByteOrder::Little, true, 0x1000));
        let start = cache.lookup(0x1000).unwrap();
        // 3 ALU records, the jump, its delay slot, and the stub
        assert_eq!(cache.op_at(start + 3), ChunkOp::JumpReg { rs: 31, link_rd: 0 });
        assert_eq!(cache.op_at(start + 5), ChunkOp::DelayedBranch);
    }

    #[test]
    fn untranslatable_head_is_marked() {
        // syscall is a block of one: too short
        let code = [0x0000_000C, 0x0000_0000];
        let mut bus = bus_with_code(0x2000, &code);
        let mut cache = TranslationCache::new(true, 4096);
        assert!(!cache.attempt_translate(&mut bus, ByteOrder::Little, true, 0x2000));
        assert!(cache.is_marked_untranslatable(0x2000));
        // a second attempt is refused cheaply
        assert!(!cache.attempt_translate(&mut bus, ByteOrder::Little, true, 0x2000));
    }

    #[test]
    fn invalidation_drops_page_chunks() {
        let code = [0x2401_0005, 0x2402_0007, 0x0022_1821, 0x03E0_0008, 0x0000_0000];
        let mut bus = bus_with_code(0x3000, &code);
        let mut cache = TranslationCache::new(true, 4096);
        assert!(cache.attempt_translate(&mut bus, ByteOrder::Little, true, 0x3000));
        assert!(cache.page_has_translation(0x3000));

        cache.invalidate_paddr_range(0x3004, 4);
        assert!(!cache.page_has_translation(0x3000));
        assert!(cache.lookup(0x3000).is_none());
    }

    #[test]
    fn pool_exhaustion_triggers_full_flush() {
        let code = [0x2401_0005, 0x2402_0007, 0x0022_1821, 0x03E0_0008, 0x0000_0000];
        let mut bus = bus_with_code(0x4000, &code);
        // capacity barely above the margin: the second translation flushes
        let mut cache = TranslationCache::new(true, CODE_POOL_MARGIN + 4);
        assert!(cache.attempt_translate(&mut bus, ByteOrder::Little, true, 0x4000));
        let mut bus2 = bus_with_code(0x5000, &code);
        assert!(cache.attempt_translate(&mut bus2, ByteOrder::Little, true, 0x5000));
        let (_, flushes) = cache.stats();
        assert_eq!(flushes, 1);
        // the first page was dropped by the flush
        assert!(cache.lookup(0x4000).is_none());
    }

    #[test]
    fn sixty_four_bit_ops_stay_untranslated_on_32bit_cpus() {
        // daddu $3,$1,$2 ; jr $ra ; nop
        let code = [0x0022_182D, 0x03E0_0008, 0x0000_0000];
        let mut bus = bus_with_code(0x6000, &code);
        let mut cache = TranslationCache::new(true, 4096);
        assert!(!cache.attempt_translate(&mut bus, ByteOrder::Little, false, 0x6000));
        let mut bus = bus_with_code(0x7000, &code);
        assert!(cache.attempt_translate(&mut bus, ByteOrder::Little, true, 0x7000));
    }
}
