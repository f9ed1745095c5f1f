// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Hopping message envelopes, lineage records and payloads.
//!
//! Six envelope kinds travel through the dispatcher: data, downstream
//! control, upstream control, direct, ack and drop. Data and downstream
//! envelopes are routed forward through the graph toward a set of query
//! exits; upstream envelopes walk backward toward a single query exit;
//! ack and drop envelopes unwind a lineage one frame per hop.

use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Identifier of a waypoint in the routing graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WaypointId(pub u32);

impl fmt::Display for WaypointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wp{}", self.0)
    }
}

/// An endpoint label on graph edges; routing selects edges whose
/// annotation includes a requested query exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueryExit(pub u32);

impl fmt::Display for QueryExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "qe{}", self.0)
    }
}

/// Destination set of a downstream or data envelope.
pub type QueryExitSet = BTreeSet<QueryExit>;

/// Worker result code returned with a finished data message.
pub type ResultCode = i32;

/// Opaque message payload, shared between the clones an envelope leaves
/// behind at each routing fan-out.
///
/// Payload typing is a construction-time invariant: a handler that
/// downcasts to the wrong type hits a fatal error, never a silent
/// fallback.
#[derive(Clone)]
pub struct Payload(Arc<dyn Any + Send + Sync>);

impl Payload {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Borrow the payload as `T`.
    ///
    /// # Panics
    ///
    /// Panics when the payload is not a `T`; a mistyped payload means a
    /// broken routing contract.
    #[must_use]
    pub fn downcast_ref<T: Any + Send + Sync>(&self) -> &T {
        self.0.downcast_ref::<T>().unwrap_or_else(|| {
            panic!(
                "message carried an unexpected payload type (wanted {})",
                std::any::type_name::<T>()
            )
        })
    }

    /// Whether the payload is a `T`.
    #[must_use]
    pub fn is<T: Any + Send + Sync>(&self) -> bool {
        self.0.downcast_ref::<T>().is_some()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Payload(..)")
    }
}

/// One hop of provenance: which waypoint produced a chunk, and the NUMA
/// node mask its data lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineageFrame {
    pub waypoint: WaypointId,
    pub node_mask: u64,
}

/// Stack of lineage frames carried by data envelopes and unwound by
/// acks and drops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Lineage(Vec<LineageFrame>);

impl Lineage {
    #[must_use]
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, frame: LineageFrame) {
        self.0.push(frame);
    }

    /// Remove and return the innermost frame.
    pub fn pop(&mut self) -> Option<LineageFrame> {
        self.0.pop()
    }

    #[must_use]
    pub fn last(&self) -> Option<&LineageFrame> {
        self.0.last()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A data envelope advancing one graph hop per delivery. The payload is
/// `None` when a worker produced nothing (end of stream).
#[derive(Debug, Clone)]
pub struct HoppingDataMsg {
    pub current: WaypointId,
    pub dests: QueryExitSet,
    pub lineage: Lineage,
    pub payload: Option<Payload>,
}

/// A downstream control envelope, routed the same way data is.
#[derive(Debug, Clone)]
pub struct HoppingDownstreamMsg {
    pub current: WaypointId,
    pub dests: QueryExitSet,
    pub payload: Payload,
}

/// An upstream control envelope, walking toward the producers relevant
/// to one query exit.
#[derive(Debug, Clone)]
pub struct HoppingUpstreamMsg {
    pub current: WaypointId,
    pub dest: QueryExit,
    pub payload: Payload,
}

/// A point-to-point message for a single receiver.
#[derive(Debug, Clone)]
pub struct DirectMsg {
    pub receiver: WaypointId,
    pub payload: Payload,
}

/// The shared shape of ack and drop deliveries: the query exits they
/// speak for, plus the lineage to unwind.
#[derive(Debug, Clone)]
pub struct LineageMsg {
    pub dests: QueryExitSet,
    pub lineage: Lineage,
}

/// A request or control payload addressed to a registered service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceData {
    pub service: String,
    pub payload: serde_json::Value,
}

/// Build a query-exit set from ids.
#[must_use]
pub fn query_exits<const N: usize>(ids: [u32; N]) -> QueryExitSet {
    ids.into_iter().map(QueryExit).collect()
}
