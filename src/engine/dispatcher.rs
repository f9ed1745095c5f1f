// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The dispatcher loop.
//!
//! A single-threaded cooperative dispatcher owns all engine state: the
//! central FIFO of event tags, the per-kind side queues holding the
//! actual payloads, the token pools, the routing graph and the waypoint
//! map. Waypoint callbacks run to completion synchronously inside the
//! dispatcher; parallelism lives below it, in worker pools that execute
//! data-message payloads and re-enter through the mailbox.
//!
//! # Ordering guarantees
//!
//! - messages for a fixed next hop are delivered in enqueue order;
//! - token grants of a fixed kind are FIFO over eligible requests,
//!   ineligible ones are bypassed (frozen) until the cutoff admits
//!   them;
//! - the reclaim window is exactly the call-stack extent of one
//!   `done_producing` invocation.
//!
//! # Mailbox
//!
//! Workers and the frontend talk to the engine exclusively through
//! [`EngineMailbox`]; the engine drains the channel in [`ExecEngine::run`]
//! and nudges the time-delayed token queues whenever the mailbox stays
//! quiet for one tick.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use serde_json::json;

use super::graph::RoutingGraph;
use super::message::{
    DirectMsg, HoppingDataMsg, HoppingDownstreamMsg, HoppingUpstreamMsg, Lineage, LineageMsg,
    QueryExitSet, ResultCode, ServiceData, WaypointId,
};
use super::metrics::{EngineMetrics, EngineMetricsSnapshot};
use super::token::{GrantOutcome, TokenKind, TokenPool, TokenRequest, WorkToken};
use super::waypoint::{Waypoint, WaypointConfig, WaypointMap};
use crate::config::{default_cpu_tokens, DELAY_TICK_MS, NUM_DISK_TOKENS};

/// Engine sizing and pacing parameters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// CPU token pool size (defaults to the core count).
    pub cpu_tokens: usize,

    /// Disk token pool size (defaults to the device-count constant).
    pub disk_tokens: usize,

    /// Quiet-mailbox tick that drains due time-delayed token requests.
    pub delay_tick_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cpu_tokens: default_cpu_tokens(),
            disk_tokens: NUM_DISK_TOKENS,
            delay_tick_ms: DELAY_TICK_MS,
        }
    }
}

/// Event tags ordered by the central FIFO. The payloads live in per-kind
/// side queues; tag order is the delivery order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventTag {
    Data,
    Downstream,
    Upstream,
    Direct,
    Ack,
    Drop,
    Grant(TokenKind),
}

/// Sink for service replies leaving the engine (the frontend actor is
/// an external collaborator).
pub trait ServiceReplySink: Send {
    fn reply(&mut self, data: ServiceData);
}

/// Default sink: logs the reply and drops it.
#[derive(Debug, Default)]
pub struct LogReplySink;

impl ServiceReplySink for LogReplySink {
    fn reply(&mut self, data: ServiceData) {
        log::info!(
            "[LogReplySink] service '{}' reply: {}",
            data.service,
            data.payload
        );
    }
}

/// A task shipped with an engine configuration, executed before the
/// waypoints are (re)configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineTask {
    /// Ask the storage layer to delete a relation's content.
    DropRelation { relation: String },
}

/// Executor for configuration-time tasks (the storage layer is an
/// external collaborator).
pub trait TaskExecutor: Send {
    fn execute(&mut self, task: EngineTask);
}

/// Default executor: logs the task and drops it.
#[derive(Debug, Default)]
pub struct LogTaskExecutor;

impl TaskExecutor for LogTaskExecutor {
    fn execute(&mut self, task: EngineTask) {
        log::info!("[LogTaskExecutor] ignoring configuration task {task:?}");
    }
}

/// One waypoint in a configuration message: a fresh instance to
/// install, or `None` to reconfigure the waypoint already registered
/// under `config.id`.
pub struct WaypointInstall {
    pub config: WaypointConfig,
    pub waypoint: Option<Box<dyn Waypoint>>,
}

/// The dispatcher mailbox ABI.
pub enum EngineMessage {
    /// (Re)configure waypoints, swap in a routing graph, run tasks.
    ConfigureExecEngine {
        installs: Vec<WaypointInstall>,
        graph: RoutingGraph,
        tasks: Vec<EngineTask>,
    },

    /// A worker finished a hopping data message; the producing waypoint
    /// gets its completion callback and the token becomes reclaimable.
    HoppingDataMsgReady {
        message: HoppingDataMsg,
        token: WorkToken,
        result: ResultCode,
    },

    /// Return a token without a data message attached.
    GiveTokenBack { token: WorkToken },

    /// Forward a request to the waypoint registered for the service.
    ServiceRequest { data: ServiceData },

    /// Forward a control message to the waypoint registered for the
    /// service.
    ServiceControl { data: ServiceData },
}

/// Cloneable sender half of the dispatcher mailbox.
#[derive(Clone)]
pub struct EngineMailbox(Sender<EngineMessage>);

impl EngineMailbox {
    /// Post a message; returns `false` when the engine is gone.
    pub fn send(&self, msg: EngineMessage) -> bool {
        if self.0.send(msg).is_err() {
            log::error!("[EngineMailbox::send] engine receiver disconnected");
            return false;
        }
        true
    }
}

/// Everything the dispatcher owns except the waypoints themselves.
///
/// Waypoint callbacks receive `&mut EngineCore` so they can send
/// messages, request tokens, and reclaim; the waypoint map stays with
/// [`ExecEngine`] so a callback can never re-enter another waypoint
/// directly.
pub struct EngineCore {
    requests: VecDeque<EventTag>,
    data_msgs: VecDeque<HoppingDataMsg>,
    downstream_msgs: VecDeque<HoppingDownstreamMsg>,
    upstream_msgs: VecDeque<HoppingUpstreamMsg>,
    direct_msgs: VecDeque<DirectMsg>,
    acks: VecDeque<LineageMsg>,
    drops: VecDeque<LineageMsg>,
    graph: RoutingGraph,
    pools: [TokenPool; 2],
    /// The one-slot reclaim holder; populated only for the dynamic
    /// extent of a `done_producing` call.
    holder: Option<WorkToken>,
    services: HashMap<String, WaypointId>,
    reply_sink: Box<dyn ServiceReplySink>,
    metrics: EngineMetrics,
    epoch: Instant,
}

impl EngineCore {
    fn new(config: &EngineConfig, reply_sink: Box<dyn ServiceReplySink>) -> Self {
        Self {
            requests: VecDeque::new(),
            data_msgs: VecDeque::new(),
            downstream_msgs: VecDeque::new(),
            upstream_msgs: VecDeque::new(),
            direct_msgs: VecDeque::new(),
            acks: VecDeque::new(),
            drops: VecDeque::new(),
            graph: RoutingGraph::default(),
            pools: [
                TokenPool::new(TokenKind::Cpu, config.cpu_tokens, 100),
                TokenPool::new(TokenKind::Disk, config.disk_tokens, 200),
            ],
            holder: None,
            services: HashMap::new(),
            reply_sink,
            metrics: EngineMetrics::new(),
            epoch: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    // -- message sends (callable from waypoint callbacks) --------------

    pub fn send_hopping_data_msg(&mut self, msg: HoppingDataMsg) {
        self.data_msgs.push_back(msg);
        self.requests.push_back(EventTag::Data);
    }

    pub fn send_hopping_downstream_msg(&mut self, msg: HoppingDownstreamMsg) {
        self.downstream_msgs.push_back(msg);
        self.requests.push_back(EventTag::Downstream);
    }

    pub fn send_hopping_upstream_msg(&mut self, msg: HoppingUpstreamMsg) {
        self.upstream_msgs.push_back(msg);
        self.requests.push_back(EventTag::Upstream);
    }

    pub fn send_direct_msg(&mut self, msg: DirectMsg) {
        self.direct_msgs.push_back(msg);
        self.requests.push_back(EventTag::Direct);
    }

    pub fn send_ack_msg(&mut self, dests: QueryExitSet, lineage: Lineage) {
        self.acks.push_back(LineageMsg { dests, lineage });
        self.requests.push_back(EventTag::Ack);
    }

    pub fn send_drop_msg(&mut self, dests: QueryExitSet, lineage: Lineage) {
        self.drops.push_back(LineageMsg { dests, lineage });
        self.requests.push_back(EventTag::Drop);
    }

    // -- token economy --------------------------------------------------

    /// Non-blocking token request; `None` means drop the work or retry
    /// later.
    pub fn request_token_immediate(&mut self, kind: TokenKind, priority: i32) -> Option<WorkToken> {
        self.pools[kind.index()].request_immediate(priority)
    }

    /// Queue a token request to be granted whenever one is available.
    pub fn request_token_delay_ok(&mut self, waypoint: WaypointId, kind: TokenKind, priority: i32) {
        let request = TokenRequest { waypoint, priority };
        if self.pools[kind.index()].push_delay_ok(request) {
            self.requests.push_back(EventTag::Grant(kind));
        }
    }

    /// Queue a token request that may not be granted earlier than
    /// `millis` milliseconds from now.
    pub fn request_token_delay_millis(
        &mut self,
        waypoint: WaypointId,
        kind: TokenKind,
        millis: u64,
        priority: i32,
    ) {
        let now = self.now_ms();
        let request = TokenRequest { waypoint, priority };
        self.pools[kind.index()].push_delayed(request, millis, now);
    }

    /// Convert every due time-delayed request into a delay-OK request.
    /// Must be nudged periodically; the run loop does so on quiet
    /// ticks.
    pub fn grant_delay_tokens(&mut self, kind: TokenKind) {
        let now = self.now_ms();
        for request in self.pools[kind.index()].take_due(now) {
            self.request_token_delay_ok(request.waypoint, kind, request.priority);
        }
    }

    /// Change the priority cutoff for `kind`. Newly eligible frozen
    /// requests rejoin the delay-OK queue; newly ineligible pending
    /// requests freeze.
    pub fn set_priority_cutoff(&mut self, kind: TokenKind, priority: i32) {
        for request in self.pools[kind.index()].set_cutoff(priority) {
            self.request_token_delay_ok(request.waypoint, kind, request.priority);
        }
    }

    #[must_use]
    pub fn get_priority_cutoff(&self, kind: TokenKind) -> i32 {
        self.pools[kind.index()].cutoff()
    }

    /// Hand a token back to its pool; wakes a waiter when one exists.
    pub fn give_back_token(&mut self, token: WorkToken) {
        let kind = token.kind();
        if self.pools[kind.index()].give_back(token) {
            self.requests.push_back(EventTag::Grant(kind));
        }
    }

    /// Repossess the token returned with the data message currently
    /// being completed.
    ///
    /// # Panics
    ///
    /// Panics outside the dynamic extent of a `done_producing` call;
    /// that is the only window in which the holder is populated.
    pub fn reclaim_token(&mut self) -> WorkToken {
        let token = self
            .holder
            .take()
            .unwrap_or_else(|| panic!("reclaim_token called outside of done_producing"));
        EngineMetrics::bump(&self.metrics.tokens_reclaimed);
        token
    }

    // -- services --------------------------------------------------------

    /// Register `waypoint` as the handler for `service`. Refuses (with a
    /// warning) when the service is already registered.
    pub fn register_service(&mut self, service: impl Into<String>, waypoint: WaypointId) -> bool {
        let service = service.into();
        match self.services.get(&service) {
            Some(existing) => {
                log::warn!(
                    "[EngineCore::register_service] duplicate registration of '{service}' by {waypoint} (already registered to {existing})"
                );
                false
            }
            None => {
                self.services.insert(service, waypoint);
                true
            }
        }
    }

    /// Remove a service registration. Further requests for it are
    /// rejected with a structured error.
    pub fn remove_service(&mut self, service: &str) -> bool {
        if self.services.remove(service).is_none() {
            log::warn!("[EngineCore::remove_service] unregistered service '{service}'");
            return false;
        }
        true
    }

    /// Send a reply toward the service frontend.
    pub fn send_service_reply(&mut self, reply: ServiceData) {
        self.reply_sink.reply(reply);
    }

    // -- introspection ---------------------------------------------------

    #[must_use]
    pub fn metrics(&self) -> EngineMetricsSnapshot {
        self.metrics.snapshot()
    }

    #[must_use]
    pub fn pool_size(&self, kind: TokenKind) -> usize {
        self.pools[kind.index()].pool_size()
    }

    #[must_use]
    pub fn unused_tokens(&self, kind: TokenKind) -> usize {
        self.pools[kind.index()].unused_len()
    }

    #[must_use]
    pub fn pending_requests(&self, kind: TokenKind) -> usize {
        self.pools[kind.index()].pending_len()
    }

    #[must_use]
    pub fn frozen_requests(&self, kind: TokenKind) -> usize {
        self.pools[kind.index()].frozen_len()
    }

    #[must_use]
    pub fn scheduled_requests(&self, kind: TokenKind) -> usize {
        self.pools[kind.index()].scheduled_len()
    }
}

/// The execution engine: [`EngineCore`] plus the waypoint map and the
/// drain loop.
pub struct ExecEngine {
    core: EngineCore,
    waypoints: WaypointMap,
    task_executor: Box<dyn TaskExecutor>,
    delay_tick: Duration,
}

impl ExecEngine {
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self::with_sinks(config, Box::new(LogReplySink), Box::new(LogTaskExecutor))
    }

    /// Build an engine with custom service-reply and task sinks.
    #[must_use]
    pub fn with_sinks(
        config: EngineConfig,
        reply_sink: Box<dyn ServiceReplySink>,
        task_executor: Box<dyn TaskExecutor>,
    ) -> Self {
        Self {
            delay_tick: Duration::from_millis(config.delay_tick_ms.max(1)),
            core: EngineCore::new(&config, reply_sink),
            waypoints: WaypointMap::new(),
            task_executor,
        }
    }

    /// Create a mailbox pair for this engine. The receiver goes to
    /// [`Self::run`]; senders go to workers and the frontend.
    #[must_use]
    pub fn channel() -> (EngineMailbox, Receiver<EngineMessage>) {
        let (tx, rx) = unbounded();
        (EngineMailbox(tx), rx)
    }

    /// Mutable access to the engine core, for waypoint wiring and
    /// integration code running in the dispatcher context.
    pub fn core(&mut self) -> &mut EngineCore {
        &mut self.core
    }

    #[must_use]
    pub fn waypoints(&self) -> &WaypointMap {
        &self.waypoints
    }

    /// Block on the mailbox, handling messages until every sender is
    /// dropped. Quiet ticks nudge the time-delayed token queues.
    pub fn run(&mut self, rx: &Receiver<EngineMessage>) {
        loop {
            match rx.recv_timeout(self.delay_tick) {
                Ok(msg) => self.handle(msg),
                Err(RecvTimeoutError::Timeout) => {
                    self.core.grant_delay_tokens(TokenKind::Cpu);
                    self.core.grant_delay_tokens(TokenKind::Disk);
                    self.deliver_pending();
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    /// Handle one mailbox message, then deliver everything it made
    /// deliverable.
    pub fn handle(&mut self, msg: EngineMessage) {
        match msg {
            EngineMessage::ConfigureExecEngine {
                installs,
                graph,
                tasks,
            } => {
                for task in tasks {
                    self.task_executor.execute(task);
                }
                for install in installs {
                    self.install(install);
                }
                self.core.graph = graph;
            }

            EngineMessage::HoppingDataMsgReady {
                message,
                token,
                result,
            } => {
                if !self.waypoints.contains(message.current) {
                    panic!(
                        "data returned from a worker for unknown waypoint {}",
                        message.current
                    );
                }

                // Publish the token for reclaiming, run the completion
                // callback, then give the token back unless the
                // waypoint took it.
                self.core.holder = Some(token);
                let dests = message.dests.clone();
                let lineage = message.lineage.clone();
                let payload = message.payload.clone();
                self.with_waypoint(message.current, |wp, core| {
                    wp.done_producing(core, &dests, &lineage, result, payload);
                });
                if let Some(token) = self.core.holder.take() {
                    self.core.give_back_token(token);
                }

                // A non-empty payload means the waypoint produced new
                // data: queue the message for onward routing.
                if message.payload.is_some() {
                    self.core.send_hopping_data_msg(message);
                }
            }

            EngineMessage::GiveTokenBack { token } => {
                self.core.give_back_token(token);
            }

            EngineMessage::ServiceRequest { data } => {
                self.route_service(data, true);
            }

            EngineMessage::ServiceControl { data } => {
                self.route_service(data, false);
            }
        }

        self.deliver_pending();
    }

    /// Set a priority cutoff and immediately deliver whatever the
    /// change made grantable.
    pub fn set_priority_cutoff(&mut self, kind: TokenKind, priority: i32) {
        self.core.set_priority_cutoff(kind, priority);
        self.deliver_pending();
    }

    /// Drain due time-delayed requests and deliver the resulting
    /// grants.
    pub fn grant_delay_tokens(&mut self, kind: TokenKind) {
        self.core.grant_delay_tokens(kind);
        self.deliver_pending();
    }

    /// Drain the central FIFO.
    pub fn deliver_pending(&mut self) {
        while self.deliver_one() {}
    }

    /// Pop one event tag and deliver it. Returns `false` when the FIFO
    /// is empty.
    fn deliver_one(&mut self) -> bool {
        let Some(tag) = self.core.requests.pop_front() else {
            return false;
        };

        match tag {
            EventTag::Downstream => {
                let msg = self
                    .core
                    .downstream_msgs
                    .pop_front()
                    .expect("downstream queue out of sync with the request FIFO");
                let routings = self.core.graph.find_all_routings(msg.current, &msg.dests);
                for (next_hop, subset) in routings {
                    let mut fwd = msg.clone();
                    fwd.current = next_hop;
                    fwd.dests = subset;
                    EngineMetrics::bump(&self.core.metrics.downstream_delivered);
                    self.with_waypoint(next_hop, |wp, core| wp.process_downstream(core, fwd));
                }
            }

            EventTag::Data => {
                let msg = self
                    .core
                    .data_msgs
                    .pop_front()
                    .expect("data queue out of sync with the request FIFO");
                let routings = self.core.graph.find_all_routings(msg.current, &msg.dests);
                if routings.is_empty() {
                    EngineMetrics::bump(&self.core.metrics.data_unroutable);
                    log::warn!(
                        "[ExecEngine::deliver_one] data message from {} did not get delivered",
                        msg.current
                    );
                }
                for (next_hop, subset) in routings {
                    let mut fwd = msg.clone();
                    fwd.current = next_hop;
                    fwd.dests = subset;
                    EngineMetrics::bump(&self.core.metrics.data_delivered);
                    self.with_waypoint(next_hop, |wp, core| wp.process_data(core, fwd));
                }
            }

            EventTag::Upstream => {
                let msg = self
                    .core
                    .upstream_msgs
                    .pop_front()
                    .expect("upstream queue out of sync with the request FIFO");
                let preds = self.core.graph.find_upstream_waypoints(msg.current, msg.dest);
                for pred in preds {
                    let mut fwd = msg.clone();
                    fwd.current = pred;
                    EngineMetrics::bump(&self.core.metrics.upstream_delivered);
                    self.with_waypoint(pred, |wp, core| wp.process_upstream(core, fwd));
                }
            }

            EventTag::Direct => {
                let msg = self
                    .core
                    .direct_msgs
                    .pop_front()
                    .expect("direct queue out of sync with the request FIFO");
                EngineMetrics::bump(&self.core.metrics.direct_delivered);
                let receiver = msg.receiver;
                self.with_waypoint(receiver, |wp, core| wp.process_direct(core, msg));
            }

            EventTag::Ack => {
                let mut msg = self
                    .core
                    .acks
                    .pop_front()
                    .expect("ack queue out of sync with the request FIFO");
                let frame = msg
                    .lineage
                    .pop()
                    .unwrap_or_else(|| panic!("ack delivery with an empty lineage"));
                EngineMetrics::bump(&self.core.metrics.acks_delivered);
                self.with_waypoint(frame.waypoint, |wp, core| {
                    wp.process_ack(core, msg.dests, msg.lineage);
                });
            }

            EventTag::Drop => {
                let mut msg = self
                    .core
                    .drops
                    .pop_front()
                    .expect("drop queue out of sync with the request FIFO");
                let frame = msg
                    .lineage
                    .pop()
                    .unwrap_or_else(|| panic!("drop delivery with an empty lineage"));
                EngineMetrics::bump(&self.core.metrics.drops_delivered);
                self.with_waypoint(frame.waypoint, |wp, core| {
                    wp.process_drop(core, msg.dests, msg.lineage);
                });
            }

            EventTag::Grant(kind) => match self.core.pools[kind.index()].process_grant() {
                GrantOutcome::Granted(request, token) => {
                    if !self.waypoints.contains(request.waypoint) {
                        panic!(
                            "a {kind} token was requested by unknown waypoint {}",
                            request.waypoint
                        );
                    }
                    EngineMetrics::bump(&self.core.metrics.tokens_granted);
                    self.with_waypoint(request.waypoint, |wp, core| {
                        wp.request_granted(core, token);
                    });
                }
                GrantOutcome::Frozen(request) => {
                    EngineMetrics::bump(&self.core.metrics.grants_frozen);
                    log::debug!(
                        "[ExecEngine::deliver_one] froze a {kind} request from {} (priority {} above cutoff {})",
                        request.waypoint,
                        request.priority,
                        self.core.get_priority_cutoff(kind)
                    );
                }
                GrantOutcome::Idle => {
                    log::trace!("[ExecEngine::deliver_one] {kind} grant event found no work");
                }
            },
        }

        true
    }

    /// Run a callback on a waypoint while lending it the engine core.
    ///
    /// # Panics
    ///
    /// Panics when the waypoint is unknown: routing to a waypoint that
    /// was never configured is a broken configuration.
    fn with_waypoint<F>(&mut self, id: WaypointId, f: F)
    where
        F: FnOnce(&mut dyn Waypoint, &mut EngineCore),
    {
        let Some(mut wp) = self.waypoints.take(id) else {
            panic!("message routed to unknown waypoint {id}");
        };
        f(wp.as_mut(), &mut self.core);
        self.waypoints.put(id, wp);
    }

    /// Install a new waypoint or reconfigure the existing one in place.
    fn install(&mut self, install: WaypointInstall) {
        let id = install.config.id;
        if self.waypoints.contains(id) {
            if install.waypoint.is_some() {
                log::debug!(
                    "[ExecEngine::install] {id} already present; reconfiguring the existing instance"
                );
            }
            let config = install.config;
            self.with_waypoint(id, |wp, core| wp.configure(core, &config));
        } else {
            let Some(mut wp) = install.waypoint else {
                panic!("configuration update for unknown waypoint {id} carries no instance");
            };
            wp.configure(&mut self.core, &install.config);
            self.waypoints.insert(id, install.config.name, wp);
        }
    }

    /// Route a service request or control message, or reply with a
    /// structured error for an unknown service.
    fn route_service(&mut self, data: ServiceData, is_request: bool) {
        match self.core.services.get(&data.service).copied() {
            Some(id) => {
                self.with_waypoint(id, |wp, core| {
                    if is_request {
                        wp.process_service_request(core, data);
                    } else {
                        wp.process_service_control(core, data);
                    }
                });
            }
            None => {
                EngineMetrics::bump(&self.core.metrics.service_errors);
                let reply = ServiceData {
                    service: data.service.clone(),
                    payload: json!({
                        "error": "no such service",
                        "service": data.service,
                    }),
                };
                self.core.send_service_reply(reply);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::graph::RoutingGraphBuilder;
    use crate::engine::message::{query_exits, LineageFrame, Payload, QueryExit};
    use std::sync::{Arc, Mutex};

    /// Shared event log the test waypoints append to.
    type EventLog = Arc<Mutex<Vec<String>>>;

    /// Delivery events only; install-time configure entries are noise
    /// for most tests.
    fn log_of(log: &EventLog) -> Vec<String> {
        raw_log(log)
            .into_iter()
            .filter(|e| !e.starts_with("configure:"))
            .collect()
    }

    fn raw_log(log: &EventLog) -> Vec<String> {
        log.lock().expect("event log").clone()
    }

    /// Records every delivery; stores granted tokens instead of giving
    /// them back.
    struct Recorder {
        id: WaypointId,
        log: EventLog,
        tokens: Arc<Mutex<Vec<WorkToken>>>,
        reclaim: bool,
    }

    impl Recorder {
        fn install(
            engine: &mut ExecEngine,
            id: u32,
            log: &EventLog,
        ) -> Arc<Mutex<Vec<WorkToken>>> {
            Self::install_with_reclaim(engine, id, log, false)
        }

        fn install_with_reclaim(
            engine: &mut ExecEngine,
            id: u32,
            log: &EventLog,
            reclaim: bool,
        ) -> Arc<Mutex<Vec<WorkToken>>> {
            let tokens = Arc::new(Mutex::new(Vec::new()));
            let wp = Box::new(Recorder {
                id: WaypointId(id),
                log: log.clone(),
                tokens: tokens.clone(),
                reclaim,
            });
            engine.handle(EngineMessage::ConfigureExecEngine {
                installs: vec![WaypointInstall {
                    config: WaypointConfig {
                        id: WaypointId(id),
                        name: format!("recorder-{id}"),
                        params: serde_json::Value::Null,
                    },
                    waypoint: Some(wp),
                }],
                graph: RoutingGraph::default(),
                tasks: Vec::new(),
            });
            tokens
        }

        fn note(&self, event: String) {
            self.log.lock().expect("event log").push(event);
        }
    }

    impl Waypoint for Recorder {
        fn configure(&mut self, _core: &mut EngineCore, config: &WaypointConfig) {
            self.note(format!("configure:{}:{}", self.id, config.name));
        }

        fn process_downstream(&mut self, _core: &mut EngineCore, msg: HoppingDownstreamMsg) {
            self.note(format!(
                "downstream:{}:{}",
                self.id,
                msg.payload.downcast_ref::<&'static str>()
            ));
        }

        fn process_upstream(&mut self, _core: &mut EngineCore, msg: HoppingUpstreamMsg) {
            self.note(format!("upstream:{}:{}", self.id, msg.dest));
        }

        fn process_data(&mut self, _core: &mut EngineCore, msg: HoppingDataMsg) {
            let dests: Vec<String> = msg.dests.iter().map(ToString::to_string).collect();
            self.note(format!("data:{}:[{}]", self.id, dests.join(",")));
        }

        fn process_direct(&mut self, _core: &mut EngineCore, _msg: DirectMsg) {
            self.note(format!("direct:{}", self.id));
        }

        fn process_ack(&mut self, _core: &mut EngineCore, _dests: QueryExitSet, lineage: Lineage) {
            self.note(format!("ack:{}:depth{}", self.id, lineage.len()));
        }

        fn process_drop(&mut self, _core: &mut EngineCore, _dests: QueryExitSet, lineage: Lineage) {
            self.note(format!("drop:{}:depth{}", self.id, lineage.len()));
        }

        fn request_granted(&mut self, _core: &mut EngineCore, token: WorkToken) {
            self.note(format!("granted:{}:{}", self.id, token.id()));
            self.tokens.lock().expect("token stash").push(token);
        }

        fn done_producing(
            &mut self,
            core: &mut EngineCore,
            _dests: &QueryExitSet,
            _lineage: &Lineage,
            result: ResultCode,
            _data: Option<Payload>,
        ) {
            self.note(format!("done:{}:{}", self.id, result));
            if self.reclaim {
                let token = core.reclaim_token();
                self.note(format!("reclaimed:{}:{}", self.id, token.id()));
                self.tokens.lock().expect("token stash").push(token);
            }
        }

        fn process_service_request(&mut self, _core: &mut EngineCore, data: ServiceData) {
            self.note(format!("service:{}:{}", self.id, data.service));
        }
    }

    fn engine(cpu: usize, disk: usize) -> ExecEngine {
        ExecEngine::new(EngineConfig {
            cpu_tokens: cpu,
            disk_tokens: disk,
            delay_tick_ms: 5,
        })
    }

    fn set_graph(engine: &mut ExecEngine, graph: RoutingGraph) {
        engine.handle(EngineMessage::ConfigureExecEngine {
            installs: Vec::new(),
            graph,
            tasks: Vec::new(),
        });
    }

    #[test]
    fn test_downstream_routing_fans_out() {
        let mut eng = engine(1, 1);
        let log = EventLog::default();
        Recorder::install(&mut eng, 2, &log);
        Recorder::install(&mut eng, 3, &log);
        set_graph(
            &mut eng,
            RoutingGraphBuilder::new()
                .edge(WaypointId(1), WaypointId(2), query_exits([1]))
                .edge(WaypointId(1), WaypointId(3), query_exits([2]))
                .build(),
        );

        eng.core().send_hopping_downstream_msg(HoppingDownstreamMsg {
            current: WaypointId(1),
            dests: query_exits([1, 2]),
            payload: Payload::new("flush"),
        });
        eng.deliver_pending();

        let mut events = log_of(&log);
        events.sort();
        assert_eq!(events, vec!["downstream:wp2:flush", "downstream:wp3:flush"]);
        assert_eq!(eng.core().metrics().downstream_delivered, 2);
    }

    #[test]
    fn test_data_routing_narrows_destinations() {
        let mut eng = engine(1, 1);
        let log = EventLog::default();
        Recorder::install(&mut eng, 2, &log);
        Recorder::install(&mut eng, 3, &log);
        set_graph(
            &mut eng,
            RoutingGraphBuilder::new()
                .edge(WaypointId(1), WaypointId(2), query_exits([1, 2]))
                .edge(WaypointId(1), WaypointId(3), query_exits([3]))
                .build(),
        );

        eng.core().send_hopping_data_msg(HoppingDataMsg {
            current: WaypointId(1),
            dests: query_exits([1, 2, 3]),
            lineage: Lineage::new(),
            payload: Some(Payload::new(1u32)),
        });
        eng.deliver_pending();

        let mut events = log_of(&log);
        events.sort();
        assert_eq!(events, vec!["data:wp2:[qe1,qe2]", "data:wp3:[qe3]"]);
    }

    #[test]
    fn test_fifo_order_per_next_hop() {
        let mut eng = engine(1, 1);
        let log = EventLog::default();
        Recorder::install(&mut eng, 2, &log);
        set_graph(
            &mut eng,
            RoutingGraphBuilder::new()
                .edge(WaypointId(1), WaypointId(2), query_exits([1]))
                .build(),
        );

        for tag in ["a", "b", "c"] {
            eng.core().send_hopping_downstream_msg(HoppingDownstreamMsg {
                current: WaypointId(1),
                dests: query_exits([1]),
                payload: Payload::new(tag),
            });
        }
        eng.deliver_pending();

        assert_eq!(
            log_of(&log),
            vec!["downstream:wp2:a", "downstream:wp2:b", "downstream:wp2:c"]
        );
    }

    #[test]
    fn test_unroutable_data_is_counted_not_fatal() {
        let mut eng = engine(1, 1);
        eng.core().send_hopping_data_msg(HoppingDataMsg {
            current: WaypointId(9),
            dests: query_exits([1]),
            lineage: Lineage::new(),
            payload: Some(Payload::new(0u8)),
        });
        eng.deliver_pending();
        assert_eq!(eng.core().metrics().data_unroutable, 1);
        assert_eq!(eng.core().metrics().data_delivered, 0);
    }

    #[test]
    fn test_upstream_walks_predecessors() {
        let mut eng = engine(1, 1);
        let log = EventLog::default();
        Recorder::install(&mut eng, 1, &log);
        Recorder::install(&mut eng, 2, &log);
        set_graph(
            &mut eng,
            RoutingGraphBuilder::new()
                .edge(WaypointId(1), WaypointId(3), query_exits([7]))
                .edge(WaypointId(2), WaypointId(3), query_exits([7]))
                .build(),
        );

        eng.core().send_hopping_upstream_msg(HoppingUpstreamMsg {
            current: WaypointId(3),
            dest: QueryExit(7),
            payload: Payload::new("rewind"),
        });
        eng.deliver_pending();

        let mut events = log_of(&log);
        events.sort();
        assert_eq!(events, vec!["upstream:wp1:qe7", "upstream:wp2:qe7"]);
    }

    #[test]
    fn test_ack_unwinds_innermost_frame() {
        let mut eng = engine(1, 1);
        let log = EventLog::default();
        Recorder::install(&mut eng, 5, &log);

        let mut lineage = Lineage::new();
        lineage.push(LineageFrame {
            waypoint: WaypointId(4),
            node_mask: 1,
        });
        lineage.push(LineageFrame {
            waypoint: WaypointId(5),
            node_mask: 2,
        });

        eng.core().send_ack_msg(query_exits([1]), lineage);
        eng.deliver_pending();

        // Delivered to the innermost frame's waypoint with one frame
        // left on the stack.
        assert_eq!(log_of(&log), vec!["ack:wp5:depth1"]);
    }

    #[test]
    fn test_drop_unwinds_like_ack() {
        let mut eng = engine(1, 1);
        let log = EventLog::default();
        Recorder::install(&mut eng, 5, &log);

        let mut lineage = Lineage::new();
        lineage.push(LineageFrame {
            waypoint: WaypointId(5),
            node_mask: 1,
        });
        eng.core().send_drop_msg(query_exits([2]), lineage);
        eng.deliver_pending();

        assert_eq!(log_of(&log), vec!["drop:wp5:depth0"]);
    }

    #[test]
    #[should_panic(expected = "empty lineage")]
    fn test_ack_with_empty_lineage_is_fatal() {
        let mut eng = engine(1, 1);
        eng.core().send_ack_msg(query_exits([1]), Lineage::new());
        eng.deliver_pending();
    }

    #[test]
    fn test_direct_message() {
        let mut eng = engine(1, 1);
        let log = EventLog::default();
        Recorder::install(&mut eng, 8, &log);

        eng.core().send_direct_msg(DirectMsg {
            receiver: WaypointId(8),
            payload: Payload::new(0u8),
        });
        eng.deliver_pending();
        assert_eq!(log_of(&log), vec!["direct:wp8"]);
    }

    #[test]
    #[should_panic(expected = "unknown waypoint")]
    fn test_direct_to_unknown_waypoint_is_fatal() {
        let mut eng = engine(1, 1);
        eng.core().send_direct_msg(DirectMsg {
            receiver: WaypointId(99),
            payload: Payload::new(0u8),
        });
        eng.deliver_pending();
    }

    #[test]
    fn test_token_cutoff_freeze_and_unfreeze() {
        let mut eng = engine(2, 1);
        let log = EventLog::default();
        let stash1 = Recorder::install(&mut eng, 1, &log);
        let _stash2 = Recorder::install(&mut eng, 2, &log);
        let _stash3 = Recorder::install(&mut eng, 3, &log);

        eng.core().request_token_delay_ok(WaypointId(1), TokenKind::Cpu, 2);
        eng.core().request_token_delay_ok(WaypointId(2), TokenKind::Cpu, 2);
        eng.core().request_token_delay_ok(WaypointId(3), TokenKind::Cpu, 5);

        // Cutoff 2: both priority-2 requests get the two tokens, the
        // priority-5 request freezes.
        eng.set_priority_cutoff(TokenKind::Cpu, 2);
        assert_eq!(eng.core().metrics().tokens_granted, 2);
        assert_eq!(eng.core().frozen_requests(TokenKind::Cpu), 1);
        assert_eq!(eng.core().unused_tokens(TokenKind::Cpu), 0);

        // Raising the cutoff re-queues the frozen request; it is
        // granted once a token comes back.
        eng.set_priority_cutoff(TokenKind::Cpu, 5);
        assert_eq!(eng.core().frozen_requests(TokenKind::Cpu), 0);
        assert_eq!(eng.core().pending_requests(TokenKind::Cpu), 1);

        let returned = stash1.lock().expect("stash").remove(0);
        eng.handle(EngineMessage::GiveTokenBack { token: returned });
        assert_eq!(eng.core().metrics().tokens_granted, 3);

        let granted: Vec<String> = log_of(&log)
            .into_iter()
            .filter(|e| e.starts_with("granted"))
            .collect();
        assert_eq!(granted.len(), 3);
        assert!(granted[2].starts_with("granted:wp3"));
    }

    #[test]
    fn test_priority_monotonicity() {
        let mut eng = engine(1, 1);
        let log = EventLog::default();
        let _stash = Recorder::install(&mut eng, 1, &log);

        eng.set_priority_cutoff(TokenKind::Cpu, 3);
        eng.core().request_token_delay_ok(WaypointId(1), TokenKind::Cpu, 7);
        eng.deliver_pending();

        // The request sits frozen; the token stays in the pool.
        assert_eq!(eng.core().metrics().tokens_granted, 0);
        assert_eq!(eng.core().frozen_requests(TokenKind::Cpu), 1);
        assert_eq!(eng.core().unused_tokens(TokenKind::Cpu), 1);

        eng.set_priority_cutoff(TokenKind::Cpu, 7);
        assert_eq!(eng.core().metrics().tokens_granted, 1);
    }

    #[test]
    fn test_reclaim_keeps_token_out_of_pool() {
        let mut eng = engine(1, 1);
        let log = EventLog::default();
        let stash = Recorder::install_with_reclaim(&mut eng, 1, &log, true);

        // The waypoint runs a worker with the pool's only token.
        let token = eng
            .core()
            .request_token_immediate(TokenKind::Cpu, 1)
            .expect("token");
        let token_id = token.id();
        assert_eq!(eng.core().unused_tokens(TokenKind::Cpu), 0);

        eng.handle(EngineMessage::HoppingDataMsgReady {
            message: HoppingDataMsg {
                current: WaypointId(1),
                dests: query_exits([]),
                lineage: Lineage::new(),
                payload: None,
            },
            token,
            result: 0,
        });

        // The waypoint reclaimed inside done_producing: the pool never
        // saw the token come back.
        assert_eq!(eng.core().unused_tokens(TokenKind::Cpu), 0);
        let held = stash.lock().expect("stash");
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].id(), token_id);
        assert_eq!(eng.core().metrics().tokens_reclaimed, 1);
    }

    #[test]
    fn test_unreclaimed_token_returns_to_pool() {
        let mut eng = engine(1, 1);
        let log = EventLog::default();
        let _stash = Recorder::install(&mut eng, 1, &log);

        let token = eng
            .core()
            .request_token_immediate(TokenKind::Cpu, 1)
            .expect("token");

        eng.handle(EngineMessage::HoppingDataMsgReady {
            message: HoppingDataMsg {
                current: WaypointId(1),
                dests: query_exits([]),
                lineage: Lineage::new(),
                payload: None,
            },
            token,
            result: 0,
        });

        assert_eq!(eng.core().unused_tokens(TokenKind::Cpu), 1);
    }

    #[test]
    fn test_data_ready_requeues_nonempty_payload() {
        let mut eng = engine(1, 1);
        let log = EventLog::default();
        Recorder::install(&mut eng, 1, &log);
        Recorder::install(&mut eng, 2, &log);
        set_graph(
            &mut eng,
            RoutingGraphBuilder::new()
                .edge(WaypointId(1), WaypointId(2), query_exits([1]))
                .build(),
        );

        let token = eng
            .core()
            .request_token_immediate(TokenKind::Cpu, 1)
            .expect("token");
        eng.handle(EngineMessage::HoppingDataMsgReady {
            message: HoppingDataMsg {
                current: WaypointId(1),
                dests: query_exits([1]),
                lineage: Lineage::new(),
                payload: Some(Payload::new("rows")),
            },
            token,
            result: 7,
        });

        // done_producing ran on the producer, then the payload hopped to
        // the next waypoint.
        assert_eq!(log_of(&log), vec!["done:wp1:7", "data:wp2:[qe1]"]);
    }

    #[test]
    #[should_panic(expected = "outside of done_producing")]
    fn test_reclaim_outside_window_is_fatal() {
        let mut eng = engine(1, 1);
        let _ = eng.core().reclaim_token();
    }

    #[test]
    #[should_panic(expected = "unknown waypoint")]
    fn test_data_ready_for_unknown_waypoint_is_fatal() {
        let mut eng = engine(1, 1);
        let token = eng
            .core()
            .request_token_immediate(TokenKind::Cpu, 1)
            .expect("token");
        eng.handle(EngineMessage::HoppingDataMsgReady {
            message: HoppingDataMsg {
                current: WaypointId(42),
                dests: query_exits([]),
                lineage: Lineage::new(),
                payload: None,
            },
            token,
            result: 0,
        });
    }

    #[test]
    fn test_delayed_token_request_grants_after_nudge() {
        let mut eng = engine(1, 1);
        let log = EventLog::default();
        let _stash = Recorder::install(&mut eng, 1, &log);

        eng.core()
            .request_token_delay_millis(WaypointId(1), TokenKind::Cpu, 0, 1);
        assert_eq!(eng.core().scheduled_requests(TokenKind::Cpu), 1);
        assert_eq!(eng.core().metrics().tokens_granted, 0);

        // The periodic nudge converts the due request and grants it.
        eng.grant_delay_tokens(TokenKind::Cpu);
        assert_eq!(eng.core().scheduled_requests(TokenKind::Cpu), 0);
        assert_eq!(eng.core().metrics().tokens_granted, 1);
    }

    #[test]
    fn test_token_conservation_across_engine_ops() {
        let mut eng = engine(2, 1);
        let log = EventLog::default();
        let stash1 = Recorder::install(&mut eng, 1, &log);
        let stash2 = Recorder::install(&mut eng, 2, &log);

        eng.core().request_token_delay_ok(WaypointId(1), TokenKind::Cpu, 1);
        eng.core().request_token_delay_ok(WaypointId(2), TokenKind::Cpu, 1);
        eng.deliver_pending();

        let held = stash1.lock().expect("s1").len() + stash2.lock().expect("s2").len();
        assert_eq!(
            eng.core().unused_tokens(TokenKind::Cpu) + held,
            eng.core().pool_size(TokenKind::Cpu)
        );

        let token = stash1.lock().expect("s1").pop().expect("token");
        eng.handle(EngineMessage::GiveTokenBack { token });
        let held = stash1.lock().expect("s1").len() + stash2.lock().expect("s2").len();
        assert_eq!(
            eng.core().unused_tokens(TokenKind::Cpu) + held,
            eng.core().pool_size(TokenKind::Cpu)
        );
    }

    #[test]
    fn test_service_routing_and_unknown_service_reply() {
        struct CollectSink(Arc<Mutex<Vec<ServiceData>>>);
        impl ServiceReplySink for CollectSink {
            fn reply(&mut self, data: ServiceData) {
                self.0.lock().expect("replies").push(data);
            }
        }

        let replies = Arc::new(Mutex::new(Vec::new()));
        let mut eng = ExecEngine::with_sinks(
            EngineConfig {
                cpu_tokens: 1,
                disk_tokens: 1,
                delay_tick_ms: 5,
            },
            Box::new(CollectSink(replies.clone())),
            Box::new(LogTaskExecutor),
        );
        let log = EventLog::default();
        Recorder::install(&mut eng, 1, &log);
        assert!(eng.core().register_service("metadata", WaypointId(1)));
        assert!(!eng.core().register_service("metadata", WaypointId(2)));

        eng.handle(EngineMessage::ServiceRequest {
            data: ServiceData {
                service: "metadata".into(),
                payload: json!({"op": "list"}),
            },
        });
        assert_eq!(log_of(&log), vec!["service:wp1:metadata"]);

        eng.handle(EngineMessage::ServiceRequest {
            data: ServiceData {
                service: "nope".into(),
                payload: json!({}),
            },
        });
        let replies = replies.lock().expect("replies");
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].service, "nope");
        assert_eq!(replies[0].payload["error"], "no such service");
        assert_eq!(eng.core().metrics().service_errors, 1);
    }

    #[test]
    fn test_configure_runs_tasks_and_reconfigures() {
        struct CollectTasks(Arc<Mutex<Vec<EngineTask>>>);
        impl TaskExecutor for CollectTasks {
            fn execute(&mut self, task: EngineTask) {
                self.0.lock().expect("tasks").push(task);
            }
        }

        let tasks = Arc::new(Mutex::new(Vec::new()));
        let mut eng = ExecEngine::with_sinks(
            EngineConfig::default(),
            Box::new(LogReplySink),
            Box::new(CollectTasks(tasks.clone())),
        );
        let log = EventLog::default();
        Recorder::install(&mut eng, 1, &log);

        // Reconfigure the existing waypoint: no instance attached.
        eng.handle(EngineMessage::ConfigureExecEngine {
            installs: vec![WaypointInstall {
                config: WaypointConfig {
                    id: WaypointId(1),
                    name: "retuned".into(),
                    params: json!({"buffer_pages": 64}),
                },
                waypoint: None,
            }],
            graph: RoutingGraph::default(),
            tasks: vec![EngineTask::DropRelation {
                relation: "lineitem".into(),
            }],
        });

        assert_eq!(
            raw_log(&log),
            vec!["configure:wp1:recorder-1", "configure:wp1:retuned"]
        );
        assert_eq!(
            tasks.lock().expect("tasks").as_slice(),
            &[EngineTask::DropRelation {
                relation: "lineitem".into()
            }]
        );
    }

    #[test]
    fn test_run_loop_drains_mailbox_until_disconnect() {
        let (mailbox, rx) = ExecEngine::channel();
        let log = EventLog::default();

        let mut eng = engine(1, 1);
        Recorder::install(&mut eng, 8, &log);

        let handle = std::thread::spawn(move || {
            eng.run(&rx);
            eng
        });

        mailbox.send(EngineMessage::ServiceRequest {
            data: ServiceData {
                service: "missing".into(),
                payload: json!({}),
            },
        });
        drop(mailbox);

        let mut eng = handle.join().expect("engine thread");
        assert_eq!(eng.core().metrics().service_errors, 1);
    }
}
