// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The execution engine.
//!
//! A single-threaded cooperative dispatcher routes typed hopping
//! messages along a directed graph of waypoints and arbitrates two
//! bounded pools of work tokens.
//!
//! # Architecture
//!
//! ```text
//! mailbox (crossbeam channel)
//!       v
//! ExecEngine::handle -> central FIFO of event tags
//!       v                      v
//! RoutingGraph            TokenPool[CPU|disk]
//!       v                      v
//! WaypointMap.take -> Waypoint callback(&mut EngineCore)
//! ```
//!
//! # Components
//!
//! - **Dispatcher** ([`ExecEngine`], [`EngineCore`]): the FIFO, the
//!   drain loop, the reclaim holder, the mailbox handlers.
//! - **Routing** ([`RoutingGraph`]): immutable query-exit annotated
//!   edges with forward and backward queries.
//! - **Tokens** ([`TokenKind`], [`WorkToken`]): bounded CPU/disk
//!   capabilities with priority cutoffs and delayed grants.
//! - **Waypoints** ([`Waypoint`], [`WaypointMap`]): the callback
//!   surface business logic plugs into.
//! - **Telemetry** ([`EngineMetrics`]): relaxed-ordering counters with
//!   snapshots.

/// The dispatcher loop, engine core and mailbox ABI.
pub mod dispatcher;
/// Directed routing graph over waypoints.
pub mod graph;
/// Envelope types, lineage records and payloads.
pub mod message;
/// Engine telemetry counters.
pub mod metrics;
/// Work-token pools and request queues.
pub mod token;
/// Waypoint capability set and waypoint map.
pub mod waypoint;

pub use dispatcher::{
    EngineConfig, EngineCore, EngineMailbox, EngineMessage, EngineTask, ExecEngine, LogReplySink,
    LogTaskExecutor, ServiceReplySink, TaskExecutor, WaypointInstall,
};
pub use graph::{RoutingGraph, RoutingGraphBuilder};
pub use message::{
    query_exits, DirectMsg, HoppingDataMsg, HoppingDownstreamMsg, HoppingUpstreamMsg, Lineage,
    LineageFrame, LineageMsg, Payload, QueryExit, QueryExitSet, ResultCode, ServiceData,
    WaypointId,
};
pub use metrics::{EngineMetrics, EngineMetricsSnapshot};
pub use token::{TokenKind, TokenRequest, WorkToken};
pub use waypoint::{Waypoint, WaypointConfig, WaypointMap};
