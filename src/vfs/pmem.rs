// ZUS CORE — VFS: PMEM REGION
// Persistent-memory binding for a superblock: a dedicated relay handle, a
// GRAB_PMEM exchange, and one shared mapping of the whole region. On-medium
// pointers cross the kernel boundary as offsets inside this window.

use crate::engine::runtime::{Errno, SysResult};
use crate::relay::abi::PMEM_BLOCK_SIZE;
use crate::relay::{Mapping, Relay, RelayChannel};
use std::sync::Arc;

pub struct PmemRegion {
    map: Mapping,
    blocks: u64,
    /// Keeps the grabbing handle open for the region lifetime; None for
    /// regions built over transport-owned memory.
    _chan: Option<Arc<dyn RelayChannel>>,
}

impl PmemRegion {
    /// Bind and map the pmem region `pmem_kern_id` through a fresh handle.
    pub fn grab(relay: &dyn Relay, pmem_kern_id: u32) -> SysResult<PmemRegion> {
        let chan = relay.open()?;
        let info = chan.grab_pmem(pmem_kern_id)?;
        if info.total_blocks == 0 {
            eprintln!("[ZUS-VFS] pmem id={} has zero blocks", pmem_kern_id);
            return Err(Errno(libc::EINVAL));
        }
        let len = info.total_blocks as usize * PMEM_BLOCK_SIZE;
        let map = chan.mmap_shared(0, len)?;
        eprintln!(
            "[ZUS-VFS] pmem id={} mapped: {} blocks ({} MiB)",
            pmem_kern_id,
            info.total_blocks,
            len >> 20
        );
        Ok(PmemRegion { map, blocks: info.total_blocks, _chan: Some(chan) })
    }

    /// Build a region over an existing window (back-end unit tests and the
    /// fake transport use this).
    pub fn from_mapping(map: Mapping, blocks: u64) -> PmemRegion {
        PmemRegion { map, blocks, _chan: None }
    }

    #[inline(always)]
    pub fn base(&self) -> *mut u8 {
        self.map.as_mut_ptr()
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    #[inline(always)]
    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    /// Translate an in-region pointer to the offset the kernel expects.
    /// Out-of-region pointers are a back-end bug: yell, hand back offset 0.
    pub fn addr_to_offset(&self, p: *const u8) -> u64 {
        let base = self.base() as usize;
        let addr = p as usize;
        if addr < base || addr >= base + self.len() {
            eprintln!("[ZUS-VFS] addr {:p} outside pmem region", p);
            return 0;
        }
        (addr - base) as u64
    }

    pub fn offset_to_addr(&self, offset: u64) -> *mut u8 {
        debug_assert!((offset as usize) < self.len());
        // SAFETY: offset is within the mapped window.
        unsafe { self.base().add(offset as usize) }
    }
}

/// A kernel-shared scratch buffer a back-end can hand to the kernel for
/// execution payloads: ALLOC_BUFFER on a fresh handle, then one mapping.
pub struct ExecBuffer {
    map: Mapping,
    _chan: Arc<dyn RelayChannel>,
}

impl ExecBuffer {
    pub fn alloc(relay: &dyn Relay, max_bytes: u32) -> SysResult<ExecBuffer> {
        let chan = relay.open()?;
        chan.alloc_buffer(max_bytes, max_bytes)?;
        let map = chan.mmap_shared(0, max_bytes as usize)?;
        Ok(ExecBuffer { map, _chan: chan })
    }

    #[inline(always)]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.map.as_mut_ptr()
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn heap_region(blocks: u64) -> (Vec<u64>, PmemRegion) {
        let words = blocks as usize * PMEM_BLOCK_SIZE / 8;
        let mut arena = vec![0u64; words];
        let map = Mapping::borrowed(arena.as_mut_ptr() as *mut u8, words * 8);
        let region = PmemRegion::from_mapping(map, blocks);
        (arena, region)
    }

    #[test]
    fn offset_translation_round_trips() {
        let (_arena, region) = heap_region(2);
        let p = region.offset_to_addr(4096 + 128);
        assert_eq!(region.addr_to_offset(p), 4096 + 128);
        assert_eq!(region.addr_to_offset(region.base()), 0);
    }

    #[test]
    fn out_of_region_pointer_reads_zero() {
        let (_arena, region) = heap_region(1);
        let one_past_end = region.base().wrapping_add(region.len()) as *const u8;
        assert_eq!(region.addr_to_offset(one_past_end), 0);
    }
}
