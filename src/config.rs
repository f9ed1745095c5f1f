// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Riptide global configuration - single source of truth.
//!
//! This module centralizes the page-size constants and the default pool
//! sizes. **Never hardcode these elsewhere!**
//!
//! Two levels:
//!
//! - **Level 1 (static)**: compile-time constants (page size, buddy depth,
//!   heap sizes).
//! - **Level 2 (dynamic)**: [`crate::alloc::AllocConfig`],
//!   [`crate::engine::EngineConfig`] and
//!   [`crate::congestion::WindowConfig`] structs whose defaults come from
//!   the constants below and can be overridden with struct-update syntax.

/// log2 of the allocation page size.
///
/// 12 gives 4 KiB pages; builds targeting huge pages use 19 (512 KiB).
/// Every allocation size is rounded up to a whole number of pages of this
/// size, and every pointer handed out is aligned to it.
pub const PAGE_BYTES_EXP: u32 = 12;

/// Allocation page size in bytes, derived from [`PAGE_BYTES_EXP`].
pub const PAGE_BYTES: usize = 1 << PAGE_BYTES_EXP;

/// Default buddy arena depth: the largest buddy block spans
/// `1 << MAX_ORDER` pages, which is also the per-node buddy heap size.
pub const MAX_ORDER: u8 = 10;

/// Initial free-tree region size per NUMA node, in pages.
pub const INIT_HEAP_PAGES: usize = 1024;

/// Region size added on heap growth, in pages (or the request size if it
/// is larger).
pub const HEAP_GROW_PAGES: usize = 4096;

/// Default byte size of the distinguished hash-segment slab class.
///
/// Workload-specific: it equals the hash-table capacity times the entry
/// size, rounded up to whole pages. The default matches a 16-page
/// segment; deployments override it through
/// [`crate::alloc::AllocConfig::hash_seg_bytes`].
pub const HASH_SEG_BYTES: usize = 16 * PAGE_BYTES;

/// Default number of disk work tokens (tied to device count).
pub const NUM_DISK_TOKENS: usize = 2;

/// Priority cutoff that admits everything. Smaller numbers are higher
/// priority, so any realistic request priority is below this.
pub const PRIORITY_CUTOFF_OPEN: i32 = 999;

/// Sliding-window length of the congestion controller, in chunk records.
pub const CONGESTION_WINDOW: usize = 100;

/// Drop ratio above which the congestion controller starts suggesting a
/// non-zero inter-chunk delay.
pub const CONGESTION_DROP_THRESHOLD: f64 = 0.05;

/// Dispatcher nudge period for time-delayed token requests, in
/// milliseconds. There is no timer daemon; the engine's run loop converts
/// due delayed requests at this cadence.
pub const DELAY_TICK_MS: u64 = 50;

/// Default number of CPU work tokens: one per available core.
#[must_use]
pub fn default_cpu_tokens() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
}

/// Convert a page count to bytes.
#[inline]
#[must_use]
pub const fn pages_to_bytes(pages: usize) -> usize {
    pages << PAGE_BYTES_EXP
}

/// Convert a byte count to pages, rounding up to cover the overflow.
#[inline]
#[must_use]
pub const fn bytes_to_pages(bytes: usize) -> usize {
    let pages = bytes >> PAGE_BYTES_EXP;
    if bytes != pages_to_bytes(pages) {
        pages + 1
    } else {
        pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_round_trip() {
        assert_eq!(pages_to_bytes(1), PAGE_BYTES);
        assert_eq!(bytes_to_pages(PAGE_BYTES), 1);
        assert_eq!(bytes_to_pages(PAGE_BYTES + 1), 2);
        assert_eq!(bytes_to_pages(PAGE_BYTES - 1), 1);
        assert_eq!(bytes_to_pages(0), 0);
    }

    #[test]
    fn test_hash_seg_is_page_aligned() {
        assert_eq!(HASH_SEG_BYTES % PAGE_BYTES, 0);
    }

    #[test]
    fn test_default_cpu_tokens_nonzero() {
        assert!(default_cpu_tokens() >= 1);
    }
}
