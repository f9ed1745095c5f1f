// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Power-of-two buddy arena.
//!
//! Serves small and medium requests out of a fixed base region of
//! `1 << max_order` pages. Requests are rounded up to the next power of
//! two (internal fragmentation up to a factor of two is part of the
//! contract), blocks are split on demand and merged back with their
//! buddy on free.
//!
//! # Invariants
//!
//! - every descriptor of order `k` sits at a `k`-aligned page index
//!   (`page_index % (1 << k) == 0`);
//! - no two free descriptors of the same order are buddies of each other
//!   (they would have merged);
//! - the page-index map covers every live descriptor, used and free.

use std::collections::{BTreeSet, HashMap};

use super::pool::ChunkPool;
use crate::config::{pages_to_bytes, PAGE_BYTES};

/// One block inside the buddy arena.
///
/// The block spans `1 << order` pages starting `page_index` pages past
/// the arena base; the byte size is implied by the order, so it is not
/// stored separately.
#[derive(Debug)]
struct BuddyChunk {
    page_index: usize,
    order: u8,
    used: bool,
}

/// A successful buddy allocation: the byte address and the rounded-up
/// page count actually reserved for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuddyAlloc {
    pub addr: usize,
    pub pages: usize,
}

/// Dispatch view of a buddy block, handed to the allocator facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuddyView {
    pub pages: usize,
    pub used: bool,
}

/// Buddy splitter/coalescer over a contiguous base region.
#[derive(Debug)]
pub struct BuddyArena {
    /// Byte address of page index 0.
    base: usize,
    max_order: u8,
    chunks: ChunkPool<BuddyChunk>,
    /// page index -> descriptor handle, for every live descriptor.
    index: HashMap<usize, u32>,
    /// `free_lists[k]` holds the page indices of free order-`k` blocks.
    free_lists: Vec<BTreeSet<usize>>,
}

impl BuddyArena {
    /// Build an arena over a region of exactly `1 << max_order` pages.
    pub fn new(base: usize, max_order: u8) -> Self {
        debug_assert_eq!(base % PAGE_BYTES, 0, "buddy base must be page aligned");

        let mut chunks = ChunkPool::new();
        let mut index = HashMap::new();
        let mut free_lists: Vec<BTreeSet<usize>> = (0..=max_order).map(|_| BTreeSet::new()).collect();

        let handle = chunks.insert(BuddyChunk {
            page_index: 0,
            order: max_order,
            used: false,
        });
        index.insert(0, handle);
        free_lists[max_order as usize].insert(0);

        Self {
            base,
            max_order,
            chunks,
            index,
            free_lists,
        }
    }

    /// Total pages managed by this arena.
    #[inline]
    pub fn total_pages(&self) -> usize {
        1 << self.max_order
    }

    /// Whether `addr` falls inside this arena's base region.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + pages_to_bytes(self.total_pages())
    }

    /// Smallest order whose block covers `pages`.
    #[must_use]
    pub fn order_of(pages: usize) -> u8 {
        debug_assert!(pages > 0);
        let mut order = 0u8;
        while (1usize << order) < pages {
            order += 1;
        }
        order
    }

    /// Reserve a block of at least `pages` pages.
    ///
    /// Returns `None` when no free block of a sufficient order exists;
    /// the caller falls through to the free-tree path.
    pub fn alloc(&mut self, pages: usize) -> Option<BuddyAlloc> {
        if pages == 0 || pages > self.total_pages() {
            return None;
        }
        let want = Self::order_of(pages);

        // Find the lowest-order free list that can serve the request.
        let mut order = want;
        while order <= self.max_order && self.free_lists[order as usize].is_empty() {
            order += 1;
        }
        if order > self.max_order {
            return None;
        }

        let page_index = *self.free_lists[order as usize]
            .first()
            .expect("free list checked non-empty");
        self.free_lists[order as usize].remove(&page_index);
        let handle = self.index[&page_index];

        // Halve the block until it fits, parking each high half as a new
        // free descriptor one order down.
        while order > want {
            order -= 1;
            let upper_index = page_index + (1usize << order);
            let upper = self.chunks.insert(BuddyChunk {
                page_index: upper_index,
                order,
                used: false,
            });
            self.index.insert(upper_index, upper);
            self.free_lists[order as usize].insert(upper_index);
        }

        let chunk = self.chunks.get_mut(handle);
        chunk.order = want;
        chunk.used = true;

        Some(BuddyAlloc {
            addr: self.base + pages_to_bytes(page_index),
            pages: 1 << want,
        })
    }

    /// Look up the block starting at `addr` for dispatch: its page span
    /// and whether it is currently allocated.
    pub fn lookup(&self, addr: usize) -> Option<BuddyView> {
        self.block_at(addr).map(|c| BuddyView {
            pages: 1usize << c.order,
            used: c.used,
        })
    }

    fn block_at(&self, addr: usize) -> Option<&BuddyChunk> {
        if !self.contains(addr) || (addr - self.base) % PAGE_BYTES != 0 {
            return None;
        }
        let page_index = (addr - self.base) / PAGE_BYTES;
        self.index.get(&page_index).map(|&h| self.chunks.get(h))
    }

    /// Release the block starting at `addr`, merging it with free
    /// buddies as far as possible. Returns the page span released.
    ///
    /// # Panics
    ///
    /// Panics when `addr` is not the start of a used block; only
    /// allocator-issued pointers may come back.
    pub fn free(&mut self, addr: usize) -> usize {
        assert!(
            self.contains(addr) && (addr - self.base) % PAGE_BYTES == 0,
            "buddy arena: freeing pointer {addr:#x} outside the arena"
        );
        let page_index = (addr - self.base) / PAGE_BYTES;
        let &handle = self
            .index
            .get(&page_index)
            .unwrap_or_else(|| panic!("buddy arena: freeing unallocated pointer {addr:#x}"));

        let (mut idx, mut order) = {
            let chunk = self.chunks.get(handle);
            assert!(
                chunk.used,
                "buddy arena: double free of pointer {addr:#x}"
            );
            (chunk.page_index, chunk.order)
        };
        let released = 1usize << order;

        // The survivor may move to a lower page index while merging, so
        // take its map entry out up front and re-insert at the end.
        self.index.remove(&idx);

        while order < self.max_order {
            let buddy_index = idx ^ (1usize << order);
            let absorb = match self.index.get(&buddy_index) {
                Some(&bh) => {
                    let buddy = self.chunks.get(bh);
                    (!buddy.used && buddy.order == order).then_some(bh)
                }
                None => None,
            };
            let Some(buddy_handle) = absorb else { break };

            self.free_lists[order as usize].remove(&buddy_index);
            self.index.remove(&buddy_index);
            self.chunks.remove(buddy_handle);
            idx &= buddy_index;
            order += 1;
        }

        let chunk = self.chunks.get_mut(handle);
        chunk.page_index = idx;
        chunk.order = order;
        chunk.used = false;
        self.index.insert(idx, handle);
        self.free_lists[order as usize].insert(idx);

        released
    }

    /// Pages currently free across all orders.
    pub fn free_pages(&self) -> usize {
        self.free_lists
            .iter()
            .enumerate()
            .map(|(order, list)| list.len() << order)
            .sum()
    }

    #[cfg(test)]
    fn free_list_len(&self, order: u8) -> usize {
        self.free_lists[order as usize].len()
    }

    #[cfg(test)]
    fn descriptor_count(&self) -> usize {
        self.chunks.len()
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        for (order, list) in self.free_lists.iter().enumerate() {
            for &idx in list {
                // Alignment: order-k blocks live at k-aligned indices.
                assert_eq!(idx % (1usize << order), 0, "misaligned free block");
                let chunk = self.chunks.get(self.index[&idx]);
                assert!(!chunk.used);
                assert_eq!(chunk.order as usize, order);

                // No un-merged buddy pairs.
                if order < self.max_order as usize {
                    let buddy = idx ^ (1usize << order);
                    assert!(
                        !list.contains(&buddy),
                        "free buddies of order {order} at {idx}/{buddy} did not merge"
                    );
                }
            }
        }
    }
}
