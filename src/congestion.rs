// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Congestion controller: per-chunk timing statistics and the ideal
//! inter-chunk delay.
//!
//! A producing waypoint records when each chunk leaves, and feeds the
//! matching ack or drop back in when it returns. The controller keeps a
//! sliding window of the most recently finished chunks; once the drop
//! ratio inside the window crosses the threshold, it suggests pacing
//! production by the average processing time of the acked chunks. The
//! suggestion feeds the engine's time-delayed token requests
//! ([`crate::engine::ExecEngine`]): instead of asking for the next work
//! token immediately, the waypoint asks for it `ideal_delay_ms()`
//! milliseconds from now.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use crate::config::{CONGESTION_DROP_THRESHOLD, CONGESTION_WINDOW};

/// Sliding-window parameters.
#[derive(Debug, Clone, Copy)]
pub struct WindowConfig {
    /// Number of finished chunks the window retains.
    pub window: usize,

    /// Drop ratio at which pacing kicks in.
    pub drop_threshold: f64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            window: CONGESTION_WINDOW,
            drop_threshold: CONGESTION_DROP_THRESHOLD,
        }
    }
}

/// One finished chunk: how long it took, and whether it was dropped.
#[derive(Debug, Clone, Copy)]
struct ChunkRecord {
    processing_ms: u64,
    dropped: bool,
}

/// Collects chunk processing statistics and derives the ideal delay for
/// producing the next chunk.
///
/// Invariant: `running_sum` equals the sum of `processing_ms` over the
/// non-dropped records currently in the window.
#[derive(Debug)]
pub struct CongestionController {
    config: WindowConfig,
    /// Monotonic epoch all millisecond timestamps are measured from.
    epoch: Instant,
    /// chunk id -> start time, for chunks still in flight.
    in_flight: HashMap<u64, u64>,
    window: VecDeque<ChunkRecord>,
    drops: usize,
    running_sum: u64,
}

impl CongestionController {
    #[must_use]
    pub fn new(config: WindowConfig) -> Self {
        Self {
            config,
            epoch: Instant::now(),
            in_flight: HashMap::new(),
            window: VecDeque::with_capacity(config.window),
            drops: 0,
            running_sum: 0,
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Remember that `chunk_id` started processing now.
    pub fn record_chunk_start(&mut self, chunk_id: u64) {
        let now = self.now_ms();
        self.record_chunk_start_at(chunk_id, now);
    }

    /// An ack came back for `chunk_id`; unknown ids are ignored (the
    /// window may have been reset while the chunk was in flight).
    pub fn process_ack(&mut self, chunk_id: u64) {
        let now = self.now_ms();
        self.process_ack_at(chunk_id, now);
    }

    /// A drop came back for `chunk_id`; unknown ids are ignored.
    pub fn process_drop(&mut self, chunk_id: u64) {
        if self.in_flight.remove(&chunk_id).is_none() {
            return;
        }
        self.evict_for_insert();
        self.drops += 1;
        self.window.push_back(ChunkRecord {
            processing_ms: 0,
            dropped: true,
        });
    }

    /// The suggested delay before producing the next chunk.
    ///
    /// Zero while the window is empty or the drop ratio stays under the
    /// threshold; otherwise the integer average processing time of the
    /// acked chunks in the window.
    #[must_use]
    pub fn ideal_delay_ms(&self) -> u64 {
        if self.window.is_empty() {
            return 0;
        }
        let ratio = self.drops as f64 / self.window.len() as f64;
        if ratio < self.config.drop_threshold {
            return 0;
        }
        let acked = self.window.len() - self.drops;
        if acked == 0 {
            return 0;
        }
        self.running_sum / acked as u64
    }

    /// Forget everything: the window, the counters and the in-flight
    /// map.
    pub fn reset(&mut self) {
        self.in_flight.clear();
        self.window.clear();
        self.drops = 0;
        self.running_sum = 0;
    }

    /// Number of records currently in the window.
    #[must_use]
    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    /// Number of dropped records currently in the window.
    #[must_use]
    pub fn drop_count(&self) -> usize {
        self.drops
    }

    fn record_chunk_start_at(&mut self, chunk_id: u64, now_ms: u64) {
        self.in_flight.entry(chunk_id).or_insert(now_ms);
    }

    fn process_ack_at(&mut self, chunk_id: u64, now_ms: u64) {
        let Some(start) = self.in_flight.remove(&chunk_id) else {
            return;
        };
        self.evict_for_insert();
        let processing_ms = now_ms.saturating_sub(start);
        self.running_sum += processing_ms;
        self.window.push_back(ChunkRecord {
            processing_ms,
            dropped: false,
        });
    }

    /// Make room for one more record, evicting the oldest when the
    /// window is full and unwinding its contribution.
    fn evict_for_insert(&mut self) {
        if self.window.len() < self.config.window {
            return;
        }
        if let Some(oldest) = self.window.pop_front() {
            if oldest.dropped {
                self.drops -= 1;
            } else {
                self.running_sum -= oldest.processing_ms;
            }
        }
    }

    #[cfg(test)]
    fn check_running_sum(&self) {
        let expected: u64 = self
            .window
            .iter()
            .filter(|r| !r.dropped)
            .map(|r| r.processing_ms)
            .sum();
        assert_eq!(self.running_sum, expected, "running sum drifted");
        let drops = self.window.iter().filter(|r| r.dropped).count();
        assert_eq!(self.drops, drops, "drop count drifted");
    }
}

impl Default for CongestionController {
    fn default() -> Self {
        Self::new(WindowConfig::default())
    }
}
