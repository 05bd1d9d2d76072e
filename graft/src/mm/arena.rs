// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Graft Project Developers

//! Bump allocation of executable code slices. Pages are mapped with no
//! access, raised to R-X, and handed out in aligned slices that stay put
//! until process exit.

use log::warn;

use crate::error::MemError;
use crate::platform::{MemoryOps, PagePerms};
use crate::types::MemRegion;

const SLICE_ALIGN: usize = 8;

/// One R-X page handed out in aligned bump slices.
#[derive(Debug)]
struct ArenaPage {
    base: usize,
    used: usize,
    capacity: usize,
    align: usize,
}

impl ArenaPage {
    /// Rounds the cursor up to the page alignment, then reserves `size`
    /// bytes. The alignment slack is consumed even when the reservation
    /// fails, as the slack is unusable for any later request too.
    fn bump(&mut self, size: usize) -> Option<usize> {
        let cursor = self.base + self.used;
        self.used += cursor.next_multiple_of(self.align) - cursor;
        if self.used + size > self.capacity {
            return None;
        }
        let start = self.base + self.used;
        self.used += size;
        Some(start)
    }
}

/// Process-wide executable-region allocator.
#[derive(Debug, Default)]
pub struct CodeArena {
    pages: Vec<ArenaPage>,
}

impl CodeArena {
    pub const fn new() -> Self {
        Self { pages: Vec::new() }
    }

    /// Reserves `size` bytes inside an R-X page. Returned slices are
    /// 8-byte aligned, disjoint, and never moved or individually freed.
    pub fn alloc(&mut self, ops: &dyn MemoryOps, size: usize) -> Result<MemRegion, MemError> {
        let page_size = ops.page_size();
        if size > page_size {
            warn!("executable slice request of {size} bytes exceeds the page size");
            return Err(MemError::Overflow);
        }

        if let Some(start) = self.pages.iter_mut().find_map(|page| page.bump(size)) {
            return Ok(MemRegion::new(start, size));
        }

        let base = ops.map_anon(page_size)?;
        ops.protect(base, page_size, PagePerms::RX)?;

        let mut page = ArenaPage {
            base,
            used: 0,
            capacity: page_size,
            align: SLICE_ALIGN,
        };
        let start = page.bump(size).ok_or(MemError::Overflow)?;
        self.pages.push(page);
        Ok(MemRegion::new(start, size))
    }

    /// Drops the bookkeeping table. The pages themselves stay mapped
    /// until process exit.
    pub fn reset(&mut self) {
        self.pages.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::test_support::FakeOps;

    #[test]
    fn test_slices_are_aligned_and_disjoint() {
        let ops = FakeOps::new(4096);
        let mut arena = CodeArena::new();

        let a = arena.alloc(&ops, 12).unwrap();
        let b = arena.alloc(&ops, 5).unwrap();
        let c = arena.alloc(&ops, 16).unwrap();

        assert_eq!(a.start % 8, 0);
        assert_eq!(b.start, a.end().next_multiple_of(8));
        assert_eq!(c.start, (b.end()).next_multiple_of(8));
        assert_eq!(ops.maps(), 1);
    }

    #[test]
    fn test_fresh_page_is_mapped_then_raised() {
        let ops = FakeOps::new(4096);
        let mut arena = CodeArena::new();
        arena.alloc(&ops, 64).unwrap();

        assert_eq!(ops.maps(), 1);
        assert_eq!(ops.protects(), vec![PagePerms::RX]);
    }

    #[test]
    fn test_second_page_when_first_is_full() {
        let ops = FakeOps::new(4096);
        let mut arena = CodeArena::new();
        arena.alloc(&ops, 4096).unwrap();
        arena.alloc(&ops, 64).unwrap();
        assert_eq!(ops.maps(), 2);
    }

    #[test]
    fn test_oversized_request() {
        let ops = FakeOps::new(4096);
        let mut arena = CodeArena::new();
        assert_eq!(arena.alloc(&ops, 4097), Err(MemError::Overflow));
        assert_eq!(ops.maps(), 0);
    }

    #[test]
    fn test_reset_forgets_pages() {
        let ops = FakeOps::new(4096);
        let mut arena = CodeArena::new();
        arena.alloc(&ops, 8).unwrap();
        arena.reset();
        arena.alloc(&ops, 8).unwrap();
        assert_eq!(ops.maps(), 2);
    }
}
