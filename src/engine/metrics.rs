// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Engine telemetry counters.
//!
//! All fields use relaxed atomics; consumers only need monotonic
//! snapshots for observability.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters updated by the dispatcher as it delivers work.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub data_delivered: AtomicU64,
    pub downstream_delivered: AtomicU64,
    pub upstream_delivered: AtomicU64,
    pub direct_delivered: AtomicU64,
    pub acks_delivered: AtomicU64,
    pub drops_delivered: AtomicU64,
    /// Data messages whose destination set matched no out-edge.
    pub data_unroutable: AtomicU64,
    pub tokens_granted: AtomicU64,
    pub grants_frozen: AtomicU64,
    pub tokens_reclaimed: AtomicU64,
    /// Requests for services nobody registered.
    pub service_errors: AtomicU64,
}

impl EngineMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Current counter values, without synchronisation penalties.
    #[must_use]
    pub fn snapshot(&self) -> EngineMetricsSnapshot {
        EngineMetricsSnapshot {
            data_delivered: self.data_delivered.load(Ordering::Relaxed),
            downstream_delivered: self.downstream_delivered.load(Ordering::Relaxed),
            upstream_delivered: self.upstream_delivered.load(Ordering::Relaxed),
            direct_delivered: self.direct_delivered.load(Ordering::Relaxed),
            acks_delivered: self.acks_delivered.load(Ordering::Relaxed),
            drops_delivered: self.drops_delivered.load(Ordering::Relaxed),
            data_unroutable: self.data_unroutable.load(Ordering::Relaxed),
            tokens_granted: self.tokens_granted.load(Ordering::Relaxed),
            grants_frozen: self.grants_frozen.load(Ordering::Relaxed),
            tokens_reclaimed: self.tokens_reclaimed.load(Ordering::Relaxed),
            service_errors: self.service_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`EngineMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineMetricsSnapshot {
    pub data_delivered: u64,
    pub downstream_delivered: u64,
    pub upstream_delivered: u64,
    pub direct_delivered: u64,
    pub acks_delivered: u64,
    pub drops_delivered: u64,
    pub data_unroutable: u64,
    pub tokens_granted: u64,
    pub grants_frozen: u64,
    pub tokens_reclaimed: u64,
    pub service_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_bumps() {
        let metrics = EngineMetrics::new();
        EngineMetrics::bump(&metrics.data_delivered);
        EngineMetrics::bump(&metrics.data_delivered);
        EngineMetrics::bump(&metrics.tokens_granted);

        let snap = metrics.snapshot();
        assert_eq!(snap.data_delivered, 2);
        assert_eq!(snap.tokens_granted, 1);
        assert_eq!(snap.acks_delivered, 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = EngineMetrics::new();
        let json = serde_json::to_value(metrics.snapshot()).expect("serialize");
        assert_eq!(json["data_delivered"], 0);
    }
}
