// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Abstract OS page operations.
//!
//! The allocator never calls `mmap` directly; it goes through the
//! [`SysMap`] trait so the page-mapping primitive stays swappable and the
//! arenas stay testable. All operations are page-aligned and sized in
//! whole pages.
//!
//! # Semantics
//!
//! - `reserve` returns a zeroed, page-aligned region with no committed
//!   faults (anonymous private mapping on Unix).
//! - `release` gives the region back to the OS.
//! - `protect` flips a region between read-only and read/write in place,
//!   which is what keeps internal pages eligible for zero-copy disk I/O.
//! - `bind` is a best-effort NUMA placement hint; after a bind the pages
//!   are touched once so first-touch policy makes them resident on the
//!   requested node.

use std::fmt;
use std::io;
use std::ptr::NonNull;

use crate::config::{pages_to_bytes, PAGE_BYTES};

/// Page protection mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    /// Read-only (pages about to be handed to disk I/O).
    Read,
    /// Read and write (normal working state).
    ReadWrite,
}

/// Errors raised by the OS page layer.
#[derive(Debug)]
pub enum SysMapError {
    /// The kernel refused to map the requested number of pages.
    Reserve { pages: usize, source: io::Error },

    /// Changing protection on a mapped region failed.
    Protect { pages: usize, source: io::Error },
}

impl fmt::Display for SysMapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reserve { pages, source } => {
                write!(f, "reserving {pages} pages from the OS failed: {source}")
            }
            Self::Protect { pages, source } => {
                write!(f, "changing protection of {pages} pages failed: {source}")
            }
        }
    }
}

impl std::error::Error for SysMapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Reserve { source, .. } | Self::Protect { source, .. } => Some(source),
        }
    }
}

/// Result type for OS page operations.
pub type Result<T> = std::result::Result<T, SysMapError>;

/// OS page-mapping primitive used by the allocator.
///
/// Implementations must hand out zeroed, page-aligned regions and accept
/// any region previously returned by `reserve` (in whole) for `release`,
/// and any page-aligned sub-range of one for `protect`.
pub trait SysMap: Send + Sync {
    /// Reserve `pages` zeroed pages. Failure is fatal in allocation
    /// context; callers abort with a diagnostic.
    fn reserve(&self, pages: usize) -> Result<NonNull<u8>>;

    /// Return a region obtained from `reserve` to the OS.
    fn release(&self, base: NonNull<u8>, pages: usize);

    /// Change the protection of a mapped range.
    fn protect(&self, base: NonNull<u8>, pages: usize, mode: Protection) -> Result<()>;

    /// Best-effort NUMA placement hint; a no-op where unsupported.
    fn bind(&self, base: NonNull<u8>, pages: usize, node: usize);
}

/// [`SysMap`] over anonymous private `mmap` on Unix-like systems.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixSysMap;

// Linux mempolicy constants for the mbind syscall (numaif.h). The libc
// crate does not export them.
#[cfg(target_os = "linux")]
const MPOL_PREFERRED: libc::c_int = 1;
#[cfg(target_os = "linux")]
const MPOL_MF_MOVE: libc::c_uint = 1 << 1;

impl SysMap for UnixSysMap {
    fn reserve(&self, pages: usize) -> Result<NonNull<u8>> {
        let len = pages_to_bytes(pages);

        // SAFETY:
        // - addr is null, letting the kernel choose a page-aligned address
        // - len is a whole number of pages (pages_to_bytes)
        // - PROT_READ | PROT_WRITE are valid protection flags
        // - MAP_PRIVATE | MAP_ANONYMOUS needs no backing fd (fd = -1)
        // - anonymous mappings are zero-filled by the kernel
        // - mmap returns MAP_FAILED on error (checked below)
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(SysMapError::Reserve {
                pages,
                source: io::Error::last_os_error(),
            });
        }

        // mmap never returns null for a non-zero length on success.
        Ok(NonNull::new(ptr.cast::<u8>()).expect("mmap returned null"))
    }

    fn release(&self, base: NonNull<u8>, pages: usize) {
        // SAFETY:
        // - base was obtained from a successful mmap in reserve()
        // - pages is the exact page count that was reserved
        // - munmap on a valid mapping cannot fault; an EINVAL from a bad
        //   caller is logged and ignored since the process is shutting
        //   the region down either way
        let ret = unsafe { libc::munmap(base.as_ptr().cast::<libc::c_void>(), pages_to_bytes(pages)) };
        if ret != 0 {
            log::warn!(
                "[UnixSysMap::release] munmap of {} pages at {:p} failed: {}",
                pages,
                base.as_ptr(),
                io::Error::last_os_error()
            );
        }
    }

    fn protect(&self, base: NonNull<u8>, pages: usize, mode: Protection) -> Result<()> {
        let prot = match mode {
            Protection::Read => libc::PROT_READ,
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        };

        // SAFETY:
        // - base is page-aligned (allocator hands out page-aligned chunks)
        // - the range [base, base + pages) lies within one reserved region
        // - prot is a valid protection combination
        let ret = unsafe {
            libc::mprotect(base.as_ptr().cast::<libc::c_void>(), pages_to_bytes(pages), prot)
        };

        if ret != 0 {
            return Err(SysMapError::Protect {
                pages,
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn bind(&self, base: NonNull<u8>, pages: usize, node: usize) {
        if node >= 64 {
            log::warn!("[UnixSysMap::bind] node {} outside the supported mask width", node);
            return;
        }
        let node_mask: libc::c_ulong = 1 << node;

        // SAFETY:
        // - base/len describe a mapping owned by this process
        // - MPOL_PREFERRED with a one-bit mask is a valid policy; the
        //   kernel treats it as a hint, so failure is harmless
        // - maxnode must exceed the highest bit index in the mask
        let ret = unsafe {
            libc::syscall(
                libc::SYS_mbind,
                base.as_ptr() as libc::c_ulong,
                pages_to_bytes(pages) as libc::c_ulong,
                MPOL_PREFERRED,
                std::ptr::addr_of!(node_mask),
                64usize + 1,
                MPOL_MF_MOVE,
            )
        };
        if ret != 0 {
            log::debug!(
                "[UnixSysMap::bind] mbind of {} pages to node {} failed: {}",
                pages,
                node,
                io::Error::last_os_error()
            );
            return;
        }

        touch_pages(base, pages);
    }

    #[cfg(not(target_os = "linux"))]
    fn bind(&self, _base: NonNull<u8>, _pages: usize, _node: usize) {
        // NUMA binding is unsupported; first-touch placement applies.
    }
}

/// Write one byte per page so first-touch policy commits the pages on the
/// node the mapping was bound to.
#[cfg(target_os = "linux")]
fn touch_pages(base: NonNull<u8>, pages: usize) {
    for page in 0..pages {
        // SAFETY:
        // - each offset is strictly inside the reserved [0, pages) range
        // - the mapping is PROT_WRITE at this point (fresh reservation)
        // - the region is still zeroed, so writing 0 does not clobber data
        unsafe {
            base.as_ptr().add(page * PAGE_BYTES).write_volatile(0);
        }
    }
}

/// Number of NUMA nodes on this machine.
///
/// Counts `node<N>` entries under `/sys/devices/system/node`; falls back
/// to 1 when the sysfs tree is missing (non-Linux, containers).
#[must_use]
pub fn numa_node_count() -> usize {
    let Ok(entries) = std::fs::read_dir("/sys/devices/system/node") else {
        return 1;
    };

    let count = entries
        .flatten()
        .filter(|e| {
            e.file_name()
                .to_str()
                .map(|name| {
                    name.strip_prefix("node")
                        .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
                })
                .unwrap_or(false)
        })
        .count();

    count.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_is_zeroed_and_aligned() {
        let map = UnixSysMap;
        let base = map.reserve(4).expect("reserve failed");
        assert_eq!(base.as_ptr() as usize % PAGE_BYTES, 0);

        // SAFETY: base points at 4 freshly reserved pages.
        unsafe {
            assert_eq!(*base.as_ptr(), 0);
            assert_eq!(*base.as_ptr().add(pages_to_bytes(4) - 1), 0);
        }
        map.release(base, 4);
    }

    #[test]
    fn test_reserve_write_read_back() {
        let map = UnixSysMap;
        let base = map.reserve(1).expect("reserve failed");
        // SAFETY: offset 42 is within the one reserved page.
        unsafe {
            *base.as_ptr().add(42) = 0xAB;
            assert_eq!(*base.as_ptr().add(42), 0xAB);
        }
        map.release(base, 1);
    }

    #[test]
    fn test_protect_read_then_readwrite() {
        let map = UnixSysMap;
        let base = map.reserve(2).expect("reserve failed");

        map.protect(base, 2, Protection::Read).expect("prot read");
        // SAFETY: region is mapped; reading is allowed under PROT_READ.
        unsafe {
            assert_eq!(*base.as_ptr(), 0);
        }

        map.protect(base, 2, Protection::ReadWrite).expect("prot rw");
        // SAFETY: region is PROT_READ | PROT_WRITE again.
        unsafe {
            *base.as_ptr() = 7;
            assert_eq!(*base.as_ptr(), 7);
        }
        map.release(base, 2);
    }

    #[test]
    fn test_bind_is_best_effort() {
        let map = UnixSysMap;
        let base = map.reserve(2).expect("reserve failed");
        // Must not abort even on machines with a single node or no NUMA
        // support at all.
        map.bind(base, 2, 0);
        map.release(base, 2);
    }

    #[test]
    fn test_numa_node_count_at_least_one() {
        assert!(numa_node_count() >= 1);
    }
}
