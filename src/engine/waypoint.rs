// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The waypoint capability set and the waypoint map.
//!
//! A waypoint is a processing node in the routing graph. Its business
//! logic (scan, join, print, ...) lives outside this crate; the engine
//! only relies on the fixed callback set below. Callbacks run inside
//! the dispatcher context and receive the engine core so they can send
//! messages, request tokens and reclaim the token they just returned.

use std::collections::HashMap;

use serde_json::Value;

use super::dispatcher::EngineCore;
use super::message::{
    DirectMsg, HoppingDataMsg, HoppingDownstreamMsg, HoppingUpstreamMsg, Lineage, Payload,
    QueryExitSet, ResultCode, ServiceData, WaypointId,
};
use super::token::WorkToken;

/// Configuration handed to a waypoint at install or update time.
#[derive(Debug, Clone)]
pub struct WaypointConfig {
    pub id: WaypointId,
    pub name: String,
    /// Waypoint-specific parameters, opaque to the engine.
    pub params: Value,
}

/// The callback surface the dispatcher invokes on a waypoint.
///
/// Every method has a default that logs and stays inert, so concrete
/// waypoints implement only the deliveries they expect; an unexpected
/// delivery is a wiring problem worth a warning, not an abort.
pub trait Waypoint: Send {
    /// Apply a new configuration (also called once right after install).
    fn configure(&mut self, _core: &mut EngineCore, _config: &WaypointConfig) {}

    fn process_downstream(&mut self, _core: &mut EngineCore, msg: HoppingDownstreamMsg) {
        log::warn!(
            "[Waypoint::process_downstream] {} ignored a downstream message",
            msg.current
        );
    }

    fn process_upstream(&mut self, _core: &mut EngineCore, msg: HoppingUpstreamMsg) {
        log::warn!(
            "[Waypoint::process_upstream] {} ignored an upstream message",
            msg.current
        );
    }

    fn process_data(&mut self, _core: &mut EngineCore, msg: HoppingDataMsg) {
        log::warn!(
            "[Waypoint::process_data] {} ignored a data message",
            msg.current
        );
    }

    fn process_direct(&mut self, _core: &mut EngineCore, msg: DirectMsg) {
        log::warn!(
            "[Waypoint::process_direct] {} ignored a direct message",
            msg.receiver
        );
    }

    fn process_ack(&mut self, _core: &mut EngineCore, _dests: QueryExitSet, _lineage: Lineage) {}

    fn process_drop(&mut self, _core: &mut EngineCore, _dests: QueryExitSet, _lineage: Lineage) {}

    /// A token this waypoint asked for has been granted. The default
    /// hands it straight back so an unexpected grant cannot strand the
    /// token outside the pool.
    fn request_granted(&mut self, core: &mut EngineCore, token: WorkToken) {
        log::warn!("[Waypoint::request_granted] unexpected grant of {token}, returning it");
        core.give_back_token(token);
    }

    /// A worker finished one of this waypoint's data messages. Runs
    /// inside the reclaim window: calling
    /// [`EngineCore::reclaim_token`] here repossesses the returned
    /// token.
    fn done_producing(
        &mut self,
        _core: &mut EngineCore,
        _dests: &QueryExitSet,
        _lineage: &Lineage,
        _result: ResultCode,
        _data: Option<Payload>,
    ) {
    }

    fn process_service_request(&mut self, _core: &mut EngineCore, data: ServiceData) {
        log::warn!(
            "[Waypoint::process_service_request] unhandled request for service '{}'",
            data.service
        );
    }

    fn process_service_control(&mut self, _core: &mut EngineCore, data: ServiceData) {
        log::warn!(
            "[Waypoint::process_service_control] unhandled control for service '{}'",
            data.service
        );
    }
}

struct Slot {
    name: String,
    waypoint: Option<Box<dyn Waypoint>>,
}

/// The `waypoint id -> waypoint` table.
///
/// The dispatcher takes a waypoint out of its slot for the duration of a
/// callback (so the callback can borrow the engine core mutably) and
/// puts it back afterwards. Callbacks never nest, so a taken slot being
/// taken again means the single-threading contract was broken.
#[derive(Default)]
pub struct WaypointMap {
    slots: HashMap<WaypointId, Slot>,
}

impl WaypointMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: WaypointId, name: String, waypoint: Box<dyn Waypoint>) {
        self.slots.insert(
            id,
            Slot {
                name,
                waypoint: Some(waypoint),
            },
        );
    }

    #[must_use]
    pub fn contains(&self, id: WaypointId) -> bool {
        self.slots.contains_key(&id)
    }

    #[must_use]
    pub fn name(&self, id: WaypointId) -> Option<&str> {
        self.slots.get(&id).map(|slot| slot.name.as_str())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub(crate) fn take(&mut self, id: WaypointId) -> Option<Box<dyn Waypoint>> {
        let slot = self.slots.get_mut(&id)?;
        Some(
            slot.waypoint
                .take()
                .unwrap_or_else(|| panic!("re-entered waypoint {id} during its own callback")),
        )
    }

    pub(crate) fn put(&mut self, id: WaypointId, waypoint: Box<dyn Waypoint>) {
        let slot = self
            .slots
            .get_mut(&id)
            .unwrap_or_else(|| panic!("returning waypoint {id} to a missing slot"));
        debug_assert!(slot.waypoint.is_none());
        slot.waypoint = Some(waypoint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Inert;
    impl Waypoint for Inert {}

    #[test]
    fn test_insert_take_put() {
        let mut map = WaypointMap::new();
        map.insert(WaypointId(1), "scan".into(), Box::new(Inert));

        assert!(map.contains(WaypointId(1)));
        assert_eq!(map.name(WaypointId(1)), Some("scan"));
        assert_eq!(map.len(), 1);

        let wp = map.take(WaypointId(1)).expect("waypoint");
        map.put(WaypointId(1), wp);
        assert!(map.contains(WaypointId(1)));
    }

    #[test]
    fn test_take_missing_is_none() {
        let mut map = WaypointMap::new();
        assert!(map.take(WaypointId(9)).is_none());
    }

    #[test]
    #[should_panic(expected = "re-entered waypoint")]
    fn test_double_take_panics() {
        let mut map = WaypointMap::new();
        map.insert(WaypointId(1), "scan".into(), Box::new(Inert));
        let _held = map.take(WaypointId(1));
        let _ = map.take(WaypointId(1));
    }
}
