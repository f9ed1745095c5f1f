// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Allocator facade: request dispatch, per-node arenas, the hash-segment
//! slab and accounting.
//!
//! The strategy:
//!
//! 1. heaps for all NUMA nodes are initialised lazily on the first
//!    request;
//! 2. the distinguished hash-segment size goes to a slab whose segments
//!    are recycled intact and never returned to the OS;
//! 3. requests up to the buddy heap size go to the target node's buddy
//!    arena, falling through on exhaustion;
//! 4. everything else is served best-fit from the free tree, first on
//!    the target node, then round-robin across the other nodes, and as a
//!    last resort by growing the heap with a fresh OS region;
//! 5. chunk metadata lives outside user memory so the pages stay
//!    eligible for zero-copy disk I/O, and protection can be flipped in
//!    place per chunk.
//!
//! The facade is thread safe: one exclusive lock guards all state, and
//! the hot path holds it for a couple of ordered-map operations.

use std::collections::HashSet;
use std::ptr::NonNull;
use std::sync::OnceLock;

use parking_lot::Mutex;
use serde::Serialize;

use super::buddy::BuddyArena;
use super::tree::TreeArena;
use crate::config::{
    bytes_to_pages, pages_to_bytes, HASH_SEG_BYTES, HEAP_GROW_PAGES, INIT_HEAP_PAGES, MAX_ORDER,
};
use crate::sysmap::{numa_node_count, Protection, SysMap, UnixSysMap};

/// Runtime configuration of the allocator.
///
/// Defaults come from [`crate::config`]; override with struct-update
/// syntax.
#[derive(Debug, Clone)]
pub struct AllocConfig {
    /// Number of NUMA node arenas. Defaults to the detected node count.
    pub nodes: usize,

    /// Buddy depth per node, or `None` to disable the buddy arena and
    /// serve everything from the free tree.
    pub buddy_max_order: Option<u8>,

    /// Initial free-tree region size per node, in pages.
    pub init_heap_pages: usize,

    /// Region size added on heap growth, in pages.
    pub heap_grow_pages: usize,

    /// Byte size of the distinguished hash-segment class.
    pub hash_seg_bytes: usize,

    /// Whether slab segments enter the `allocated_pages`/`free_pages`
    /// counters. When `false` (the default) the slab is tracked only by
    /// its own gauges, since its segments never return to the OS.
    pub count_slab_pages: bool,
}

impl Default for AllocConfig {
    fn default() -> Self {
        Self {
            nodes: numa_node_count(),
            buddy_max_order: Some(MAX_ORDER),
            init_heap_pages: INIT_HEAP_PAGES,
            heap_grow_pages: HEAP_GROW_PAGES,
            hash_seg_bytes: HASH_SEG_BYTES,
            count_slab_pages: false,
        }
    }
}

/// Point-in-time allocator statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AllocStats {
    /// Pages currently handed out from buddy/tree arenas (plus slab
    /// pages when slab accounting is on).
    pub allocated_pages: usize,
    /// Pages currently free in buddy/tree arenas (plus reserved slab
    /// pages when slab accounting is on).
    pub free_pages: usize,
    /// Pages mapped into buddy/tree arenas across all nodes.
    pub arena_pages: usize,
    /// Hash segments currently handed out.
    pub slab_occupied_segs: usize,
    /// Hash segments parked for reuse.
    pub slab_reserved_segs: usize,
    /// Page span of one hash segment.
    pub hash_seg_pages: usize,
    /// Number of heap growth events so far.
    pub grow_count: u64,
    /// Number of NUMA node arenas.
    pub nodes: usize,
}

struct NodeArena {
    buddy: Option<BuddyArena>,
    tree: TreeArena,
}

struct AllocatorState {
    initialized: bool,
    nodes: Vec<NodeArena>,
    reserved_hash_segs: Vec<usize>,
    occupied_hash_segs: HashSet<usize>,
    allocated_pages: usize,
    free_pages: usize,
    /// Every OS reservation made (arena regions and slab segments), for
    /// best-effort release at teardown.
    regions: Vec<(usize, usize)>,
    grow_count: u64,
}

/// The hybrid page allocator. One instance serves the whole process; see
/// [`PageAllocator::global`].
pub struct PageAllocator<M: SysMap = UnixSysMap> {
    sysmap: M,
    config: AllocConfig,
    hash_seg_pages: usize,
    state: Mutex<AllocatorState>,
}

impl PageAllocator<UnixSysMap> {
    /// Build an allocator with the default OS page layer.
    #[must_use]
    pub fn new(config: AllocConfig) -> Self {
        Self::with_sysmap(UnixSysMap, config)
    }

    /// The process-wide allocator, constructed on first use with the
    /// default configuration.
    pub fn global() -> &'static PageAllocator<UnixSysMap> {
        static GLOBAL: OnceLock<PageAllocator<UnixSysMap>> = OnceLock::new();
        GLOBAL.get_or_init(|| PageAllocator::new(AllocConfig::default()))
    }
}

impl<M: SysMap> PageAllocator<M> {
    /// Build an allocator over a custom OS page layer.
    pub fn with_sysmap(sysmap: M, config: AllocConfig) -> Self {
        let hash_seg_pages = bytes_to_pages(config.hash_seg_bytes);
        Self {
            sysmap,
            config,
            hash_seg_pages,
            state: Mutex::new(AllocatorState {
                initialized: false,
                nodes: Vec::new(),
                reserved_hash_segs: Vec::new(),
                occupied_hash_segs: HashSet::new(),
                allocated_pages: 0,
                free_pages: 0,
                regions: Vec::new(),
                grow_count: 0,
            }),
        }
    }

    /// Page span of one hash segment under the current configuration.
    #[inline]
    #[must_use]
    pub fn hash_seg_pages(&self) -> usize {
        self.hash_seg_pages
    }

    /// Allocate `num_bytes` rounded up to whole pages, preferring
    /// `node`'s arena. Returns null for a zero-byte request (explicit
    /// policy, not an error).
    ///
    /// # Panics
    ///
    /// Aborts the process when the OS cannot map more memory.
    pub fn alloc(&self, num_bytes: usize, node: usize) -> *mut u8 {
        if num_bytes == 0 {
            return std::ptr::null_mut();
        }

        let mut state = self.state.lock();
        if !state.initialized {
            self.heap_init(&mut state);
        }
        let node = node % state.nodes.len();

        let num_pages = bytes_to_pages(num_bytes);
        if num_pages == self.hash_seg_pages {
            return self.hash_seg_alloc(&mut state) as *mut u8;
        }

        // Buddy path: strictly per-target-node, falls through to the
        // free tree on exhaustion.
        if let Some(got) = state.nodes[node]
            .buddy
            .as_mut()
            .filter(|buddy| num_pages <= buddy.total_pages())
            .and_then(|buddy| buddy.alloc(num_pages))
        {
            state.allocated_pages += got.pages;
            state.free_pages -= got.pages;
            return got.addr as *mut u8;
        }

        // Free-tree path: target node, then the other nodes round-robin.
        let node_count = state.nodes.len();
        for step in 0..node_count {
            let candidate = (node + step) % node_count;
            if let Some(addr) = state.nodes[candidate].tree.alloc(num_pages) {
                state.allocated_pages += num_pages;
                state.free_pages -= num_pages;
                return addr as *mut u8;
            }
        }

        // Last resort: grow the target node's heap and retry there.
        self.grow_heap(&mut state, num_pages, node);
        let addr = state.nodes[node]
            .tree
            .alloc(num_pages)
            .expect("freshly grown region must satisfy the request");
        state.allocated_pages += num_pages;
        state.free_pages -= num_pages;
        addr as *mut u8
    }

    /// Release a pointer previously returned by [`Self::alloc`].
    ///
    /// A null pointer is logged and ignored; a pointer the allocator
    /// never issued is a fatal programmer error.
    pub fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            log::warn!("[PageAllocator::free] attempted free of null pointer");
            return;
        }
        let addr = ptr as usize;

        let mut state = self.state.lock();
        if state.occupied_hash_segs.remove(&addr) {
            state.reserved_hash_segs.push(addr);
            if self.config.count_slab_pages {
                state.allocated_pages -= self.hash_seg_pages;
                state.free_pages += self.hash_seg_pages;
            }
            return;
        }

        let node_count = state.nodes.len();
        for i in 0..node_count {
            if let Some(view) = state.nodes[i].buddy.as_ref().and_then(|b| b.lookup(addr)) {
                assert!(view.used, "double free of buddy pointer {addr:#x}");
                let released = state.nodes[i]
                    .buddy
                    .as_mut()
                    .expect("buddy arena checked above")
                    .free(addr);
                state.allocated_pages -= released;
                state.free_pages += released;
                return;
            }
        }
        for i in 0..node_count {
            if let Some(view) = state.nodes[i].tree.lookup(addr) {
                assert!(view.used, "double free of pointer {addr:#x}");
                let released = state.nodes[i].tree.free(addr);
                state.allocated_pages -= released;
                state.free_pages += released;
                return;
            }
        }

        panic!("freeing unallocated pointer {addr:#x}");
    }

    /// Change the protection of an allocated chunk in place. Null is
    /// ignored; an unknown pointer is a fatal programmer error; an OS
    /// refusal is logged and survived (the caller may fault later on
    /// that region).
    pub fn protect(&self, ptr: *mut u8, mode: Protection) {
        if ptr.is_null() {
            return;
        }
        let addr = ptr as usize;

        let state = self.state.lock();
        let pages = if state.occupied_hash_segs.contains(&addr) {
            self.hash_seg_pages
        } else if let Some(view) = state
            .nodes
            .iter()
            .find_map(|n| n.buddy.as_ref().and_then(|b| b.lookup(addr)))
            .filter(|view| view.used)
        {
            view.pages
        } else if let Some(view) = state
            .nodes
            .iter()
            .find_map(|n| n.tree.lookup(addr))
            .filter(|view| view.used)
        {
            view.pages
        } else {
            panic!("changing the protection of unallocated pointer {addr:#x}");
        };

        let base = NonNull::new(ptr).expect("null checked above");
        if let Err(e) = self.sysmap.protect(base, pages, mode) {
            log::warn!(
                "[PageAllocator::protect] changing protection of {pages} pages at {addr:#x} failed: {e}"
            );
        }
    }

    /// Pages currently allocated from the arenas.
    pub fn allocated_pages(&self) -> usize {
        self.state.lock().allocated_pages
    }

    /// Pages currently free in the arenas.
    pub fn free_pages(&self) -> usize {
        self.state.lock().free_pages
    }

    /// Bytes currently allocated (page-granular).
    pub fn used_bytes(&self) -> usize {
        pages_to_bytes(self.allocated_pages())
    }

    /// Point-in-time statistics snapshot.
    pub fn stats(&self) -> AllocStats {
        let state = self.state.lock();
        let arena_pages = state
            .nodes
            .iter()
            .map(|n| {
                n.tree.total_pages() + n.buddy.as_ref().map_or(0, BuddyArena::total_pages)
            })
            .sum();
        AllocStats {
            allocated_pages: state.allocated_pages,
            free_pages: state.free_pages,
            arena_pages,
            slab_occupied_segs: state.occupied_hash_segs.len(),
            slab_reserved_segs: state.reserved_hash_segs.len(),
            hash_seg_pages: self.hash_seg_pages,
            grow_count: state.grow_count,
            nodes: state.nodes.len(),
        }
    }

    /// Map the initial heap for every node: one free-tree region plus
    /// (when enabled) one buddy region, both bound to the node.
    fn heap_init(&self, state: &mut AllocatorState) {
        state.initialized = true;
        let node_count = self.config.nodes.max(1);

        for node in 0..node_count {
            let tree_base = self.reserve_or_die(self.config.init_heap_pages, Some(node));
            let mut arena = NodeArena {
                buddy: None,
                tree: TreeArena::new(node),
            };
            arena.tree.install_region(tree_base, self.config.init_heap_pages);
            state.free_pages += self.config.init_heap_pages;
            state.regions.push((tree_base, self.config.init_heap_pages));

            if let Some(order) = self.config.buddy_max_order {
                let pages = 1usize << order;
                let buddy_base = self.reserve_or_die(pages, Some(node));
                arena.buddy = Some(BuddyArena::new(buddy_base, order));
                state.free_pages += pages;
                state.regions.push((buddy_base, pages));
            }

            state.nodes.push(arena);
        }

        log::info!(
            "[PageAllocator::heap_init] {} node(s), {} pages per tree region, buddy order {:?}",
            node_count,
            self.config.init_heap_pages,
            self.config.buddy_max_order
        );
    }

    /// Add a fresh region to `node`'s free tree, sized for the request
    /// or the configured growth step, whichever is larger.
    fn grow_heap(&self, state: &mut AllocatorState, num_pages: usize, node: usize) {
        let grow_pages = self.config.heap_grow_pages.max(num_pages);
        let base = self.reserve_or_die(grow_pages, Some(node));
        state.nodes[node].tree.install_region(base, grow_pages);
        state.free_pages += grow_pages;
        state.regions.push((base, grow_pages));
        state.grow_count += 1;
        log::info!(
            "[PageAllocator::grow_heap] grew node {} by {} pages ({} grow(s) so far)",
            node,
            grow_pages,
            state.grow_count
        );
    }

    /// Hand out a hash segment: recycle a reserved one, or map a new
    /// segment that will never be unmapped while the allocator lives.
    fn hash_seg_alloc(&self, state: &mut AllocatorState) -> usize {
        let addr = if let Some(addr) = state.reserved_hash_segs.pop() {
            if self.config.count_slab_pages {
                state.free_pages -= self.hash_seg_pages;
                state.allocated_pages += self.hash_seg_pages;
            }
            addr
        } else {
            let base = self.reserve_or_die(self.hash_seg_pages, None);
            state.regions.push((base, self.hash_seg_pages));
            if self.config.count_slab_pages {
                state.allocated_pages += self.hash_seg_pages;
            }
            base
        };
        state.occupied_hash_segs.insert(addr);

        let base = NonNull::new(addr as *mut u8).expect("slab segments are never null");
        if let Err(e) = self.sysmap.protect(base, self.hash_seg_pages, Protection::ReadWrite) {
            log::warn!("[PageAllocator::hash_seg_alloc] protect of fresh segment failed: {e}");
        }
        addr
    }

    /// Reserve pages from the OS, optionally binding them to a node.
    /// Failure aborts: nothing can make progress without the mapping.
    fn reserve_or_die(&self, pages: usize, node: Option<usize>) -> usize {
        match self.sysmap.reserve(pages) {
            Ok(base) => {
                if let Some(node) = node {
                    self.sysmap.bind(base, pages, node);
                }
                base.as_ptr() as usize
            }
            Err(e) => {
                log::error!(
                    "[PageAllocator::reserve_or_die] request for {pages} pages: {e}"
                );
                panic!("the memory allocator could not allocate memory: {e}");
            }
        }
    }
}

impl<M: SysMap> Drop for PageAllocator<M> {
    fn drop(&mut self) {
        // Best-effort release of every OS reservation, slab segments
        // included.
        let state = self.state.get_mut();
        for &(addr, pages) in &state.regions {
            if let Some(base) = NonNull::new(addr as *mut u8) {
                self.sysmap.release(base, pages);
            }
        }
    }
}

// ---------------------------------------------------------------------
// C-style diagnostic facade over the process-wide instance
// ---------------------------------------------------------------------

/// Allocate through the process-wide allocator. `file`/`line` feed the
/// diagnostic log only.
pub fn mmap_alloc(num_bytes: usize, node: usize, file: &str, line: u32) -> *mut u8 {
    let ptr = PageAllocator::global().alloc(num_bytes, node);
    log::trace!("[mmap_alloc] {num_bytes} bytes on node {node} -> {ptr:p} ({file}:{line})");
    ptr
}

/// Switch a chunk to read-only through the process-wide allocator.
pub fn mmap_prot_read(ptr: *mut u8, file: &str, line: u32) {
    log::trace!("[mmap_prot_read] {ptr:p} ({file}:{line})");
    PageAllocator::global().protect(ptr, Protection::Read);
}

/// Switch a chunk back to read/write through the process-wide allocator.
pub fn mmap_prot_readwrite(ptr: *mut u8, file: &str, line: u32) {
    log::trace!("[mmap_prot_readwrite] {ptr:p} ({file}:{line})");
    PageAllocator::global().protect(ptr, Protection::ReadWrite);
}

/// Free through the process-wide allocator, with a diagnostic for null.
pub fn mmap_free(ptr: *mut u8, file: &str, line: u32) {
    if ptr.is_null() {
        log::warn!("[mmap_free] attempted free of null pointer at {file}:{line}");
        return;
    }
    PageAllocator::global().free(ptr);
}

/// Bytes currently allocated by the process-wide allocator.
#[must_use]
pub fn mmap_used_bytes() -> usize {
    PageAllocator::global().used_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_BYTES;

    fn small_config() -> AllocConfig {
        AllocConfig {
            nodes: 1,
            buddy_max_order: Some(6),
            init_heap_pages: 128,
            heap_grow_pages: 64,
            hash_seg_bytes: 16 * PAGE_BYTES,
            count_slab_pages: false,
        }
    }

    fn alloc_with(config: AllocConfig) -> PageAllocator<UnixSysMap> {
        PageAllocator::new(config)
    }

    #[test]
    fn test_zero_byte_alloc_returns_null() {
        let alloc = alloc_with(small_config());
        assert!(alloc.alloc(0, 0).is_null());
        assert_eq!(alloc.allocated_pages(), 0);
    }

    #[test]
    fn test_alloc_is_page_aligned() {
        let alloc = alloc_with(small_config());
        let ptr = alloc.alloc(100, 0);
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % PAGE_BYTES, 0);
        alloc.free(ptr);
    }

    #[test]
    fn test_small_request_takes_buddy_with_rounding() {
        let alloc = alloc_with(small_config());
        // 5 pages round up to 8 in the buddy arena.
        let ptr = alloc.alloc(5 * PAGE_BYTES, 0);
        assert_eq!(alloc.allocated_pages(), 8);
        alloc.free(ptr);
        assert_eq!(alloc.allocated_pages(), 0);
    }

    #[test]
    fn test_large_request_takes_tree_exact() {
        let alloc = alloc_with(small_config());
        // 65 pages exceed the 64-page buddy heap.
        let ptr = alloc.alloc(65 * PAGE_BYTES, 0);
        assert_eq!(alloc.allocated_pages(), 65);
        alloc.free(ptr);
        assert_eq!(alloc.allocated_pages(), 0);
    }

    #[test]
    fn test_buddy_disabled_everything_goes_tree() {
        let alloc = alloc_with(AllocConfig {
            buddy_max_order: None,
            ..small_config()
        });
        let ptr = alloc.alloc(5 * PAGE_BYTES, 0);
        // No power-of-two rounding on the tree path.
        assert_eq!(alloc.allocated_pages(), 5);
        alloc.free(ptr);
    }

    #[test]
    fn test_buddy_exhaustion_falls_through_to_tree() {
        let alloc = alloc_with(small_config());
        let big = alloc.alloc(64 * PAGE_BYTES, 0); // consumes the whole buddy heap
        let next = alloc.alloc(4 * PAGE_BYTES, 0); // buddy is full, tree serves it
        assert_eq!(alloc.allocated_pages(), 64 + 4);
        alloc.free(big);
        alloc.free(next);
        assert_eq!(alloc.allocated_pages(), 0);
    }

    #[test]
    fn test_hash_seg_recycled_same_pointer() {
        let alloc = alloc_with(small_config());
        let seg_bytes = 16 * PAGE_BYTES;

        let first = alloc.alloc(seg_bytes, 0);
        assert!(!first.is_null());
        assert_eq!(alloc.stats().slab_occupied_segs, 1);
        assert_eq!(alloc.stats().slab_reserved_segs, 0);

        alloc.free(first);
        assert_eq!(alloc.stats().slab_occupied_segs, 0);
        assert_eq!(alloc.stats().slab_reserved_segs, 1);

        // The recycled segment comes back with the same address.
        let second = alloc.alloc(seg_bytes, 0);
        assert_eq!(first, second);
        assert_eq!(alloc.stats().slab_reserved_segs, 0);
        alloc.free(second);
    }

    #[test]
    fn test_slab_not_counted_by_default() {
        let alloc = alloc_with(small_config());
        let ptr = alloc.alloc(16 * PAGE_BYTES, 0);
        assert_eq!(alloc.allocated_pages(), 0);
        alloc.free(ptr);
        assert_eq!(alloc.allocated_pages(), 0);
    }

    #[test]
    fn test_slab_counted_when_configured() {
        let alloc = alloc_with(AllocConfig {
            count_slab_pages: true,
            ..small_config()
        });
        let ptr = alloc.alloc(16 * PAGE_BYTES, 0);
        assert_eq!(alloc.allocated_pages(), 16);
        alloc.free(ptr);
        assert_eq!(alloc.allocated_pages(), 0);

        // Recycling keeps the books balanced.
        let again = alloc.alloc(16 * PAGE_BYTES, 0);
        assert_eq!(alloc.allocated_pages(), 16);
        alloc.free(again);
        assert_eq!(alloc.allocated_pages(), 0);
    }

    #[test]
    fn test_heap_grows_for_oversized_request() {
        let alloc = alloc_with(small_config());
        // Larger than the initial 128-page tree region and the 64-page
        // growth step: the grown region is sized by the request.
        let ptr = alloc.alloc(500 * PAGE_BYTES, 0);
        assert!(!ptr.is_null());
        let stats = alloc.stats();
        assert_eq!(stats.grow_count, 1);
        assert_eq!(stats.allocated_pages, 500);
        alloc.free(ptr);
        assert_eq!(alloc.allocated_pages(), 0);
    }

    #[test]
    fn test_cross_node_fallback_before_grow() {
        let alloc = alloc_with(AllocConfig {
            nodes: 2,
            ..small_config()
        });
        // Exhaust node 0's tree region (128 pages).
        let hog = alloc.alloc(128 * PAGE_BYTES, 0);
        // The next tree-sized request on node 0 is served by node 1
        // without growing the heap.
        let spill = alloc.alloc(100 * PAGE_BYTES, 0);
        assert!(!spill.is_null());
        assert_eq!(alloc.stats().grow_count, 0);
        alloc.free(hog);
        alloc.free(spill);
        assert_eq!(alloc.allocated_pages(), 0);
    }

    #[test]
    fn test_page_conservation_round_trip() {
        let alloc = alloc_with(small_config());
        let initial_free = alloc.free_pages();
        assert_eq!(initial_free, alloc.stats().arena_pages);

        let mut live = Vec::new();
        for bytes in [100, 3 * PAGE_BYTES, 70 * PAGE_BYTES, PAGE_BYTES + 1, 40 * PAGE_BYTES] {
            live.push(alloc.alloc(bytes, 0));
        }
        let stats = alloc.stats();
        assert_eq!(stats.allocated_pages + stats.free_pages, stats.arena_pages);

        // Free in a scrambled order; the allocator returns to its
        // initial state up to metadata recycling.
        for idx in [2usize, 0, 4, 1, 3] {
            alloc.free(live[idx]);
        }
        assert_eq!(alloc.allocated_pages(), 0);
        assert_eq!(alloc.free_pages(), alloc.stats().arena_pages);
    }

    #[test]
    fn test_protect_round_trip() {
        let alloc = alloc_with(small_config());
        let ptr = alloc.alloc(3 * PAGE_BYTES, 0);
        alloc.protect(ptr, Protection::Read);
        // SAFETY: ptr points at 3 live read-only pages.
        unsafe {
            assert_eq!(*ptr, 0);
        }
        alloc.protect(ptr, Protection::ReadWrite);
        // SAFETY: region is writable again.
        unsafe {
            *ptr = 0x5A;
        }
        alloc.free(ptr);
    }

    #[test]
    fn test_protect_null_is_silent() {
        let alloc = alloc_with(small_config());
        alloc.protect(std::ptr::null_mut(), Protection::Read);
    }

    #[test]
    fn test_free_null_is_survivable() {
        let alloc = alloc_with(small_config());
        alloc.free(std::ptr::null_mut());
        assert_eq!(alloc.allocated_pages(), 0);
    }

    #[test]
    #[should_panic(expected = "unallocated pointer")]
    fn test_free_unknown_pointer_is_fatal() {
        let alloc = alloc_with(small_config());
        // Force heap init first so the panic comes from the lookup.
        let ptr = alloc.alloc(PAGE_BYTES, 0);
        alloc.free(ptr);
        alloc.free(0xDEAD_B000 as *mut u8);
    }

    #[test]
    #[should_panic(expected = "unallocated pointer")]
    fn test_protect_unknown_pointer_is_fatal() {
        let alloc = alloc_with(small_config());
        let ptr = alloc.alloc(PAGE_BYTES, 0);
        alloc.free(ptr);
        alloc.protect(0xDEAD_B000 as *mut u8, Protection::Read);
    }

    #[test]
    fn test_used_bytes_tracks_pages() {
        let alloc = alloc_with(small_config());
        let ptr = alloc.alloc(PAGE_BYTES + 1, 0);
        assert_eq!(alloc.used_bytes(), 2 * PAGE_BYTES);
        alloc.free(ptr);
        assert_eq!(alloc.used_bytes(), 0);
    }

    #[test]
    fn test_memory_is_writable_and_zeroed() {
        let alloc = alloc_with(small_config());
        let ptr = alloc.alloc(2 * PAGE_BYTES, 0);
        // SAFETY: ptr spans 2 freshly mapped pages.
        unsafe {
            assert_eq!(*ptr, 0);
            assert_eq!(*ptr.add(2 * PAGE_BYTES - 1), 0);
            *ptr = 1;
            *ptr.add(PAGE_BYTES) = 2;
        }
        alloc.free(ptr);
    }
}
