// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # Riptide - page-granular memory management and dataflow execution
//!
//! Riptide is the resource substrate of a dataflow execution runtime. It
//! provides two tightly coupled subsystems:
//!
//! 1. A **hybrid page allocator** that carves large, page-aligned,
//!    NUMA-aware regions out of the process address space and serves them
//!    through three strategies: a fixed-size slab for hash segments, a
//!    power-of-two buddy arena for small and medium requests, and a
//!    best-fit sized free tree with physical-neighbour coalescing for
//!    everything else. Chunk metadata is kept outside user memory so
//!    pages stay eligible for zero-copy disk I/O, and protection can be
//!    flipped between read-only and read/write in place.
//!
//! 2. A **cooperative execution engine** that routes typed hopping
//!    messages along a directed graph of waypoints from a single-threaded
//!    dispatcher, and arbitrates two bounded pools of CPU and disk work
//!    tokens with priority cutoffs, delayed grants and a narrow reclaim
//!    window.
//!
//! A thin **congestion controller** links the two: it turns per-chunk
//! ack/drop statistics into an ideal inter-chunk delay that feeds the
//! engine's time-delayed token requests.
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------+
//! |                       Worker threads                          |
//! |        (heavy waypoint work, allocator callers)               |
//! +---------------------------------------------------------------+
//!        | alloc/free/protect                 | mailbox send
//!        v                                    v
//! +---------------------+      +--------------------------------+
//! |   PageAllocator     |      |          ExecEngine            |
//! |  slab | buddy | tree|      |  FIFO -> routing graph ->      |
//! |  per-NUMA arenas    |      |  waypoints; token pools        |
//! +---------------------+      +--------------------------------+
//!        |                                    ^
//!        v                                    |
//! +---------------------+      +--------------------------------+
//! |       SysMap        |      |     CongestionController       |
//! |  reserve/protect/   |      |  ack/drop window -> delay hint |
//! |  release/bind       |      +--------------------------------+
//! +---------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`alloc::PageAllocator`] | Hybrid page allocator facade, one per process |
//! | [`sysmap::UnixSysMap`] | Anonymous-mmap implementation of the OS page ops |
//! | [`engine::ExecEngine`] | Single-threaded cooperative dispatcher |
//! | [`engine::RoutingGraph`] | Immutable query-exit annotated routing graph |
//! | [`congestion::CongestionController`] | Sliding-window delay estimator |

/// Page-size and pool-size constants plus runtime configuration structs.
pub mod config;
/// Compile-time optional console logger behind the `log` facade.
pub mod logging;
/// Abstract OS page operations (reserve, release, protect, bind).
pub mod sysmap;

/// Hybrid page allocator (descriptor pools, buddy arena, free tree, facade).
pub mod alloc;

/// Per-chunk timing statistics and ideal-delay estimation.
pub mod congestion;

/// Execution engine (dispatcher, routing graph, waypoints, token pools).
pub mod engine;

pub use alloc::{AllocConfig, AllocStats, PageAllocator};
pub use congestion::{CongestionController, WindowConfig};
pub use engine::{
    EngineConfig, EngineMessage, ExecEngine, QueryExit, RoutingGraph, RoutingGraphBuilder,
    TokenKind, Waypoint, WaypointId, WorkToken,
};
pub use sysmap::{Protection, SysMap, UnixSysMap};

/// Riptide version string.
pub const VERSION: &str = "0.3.0";
