// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Work-token pools and request queues.
//!
//! Two bounded pools of opaque capabilities - CPU tokens and disk tokens
//! - arbitrate access to the worker pools. Tokens are created once at
//! engine startup and never after; holding one authorises exactly one
//! unit of work of its kind.
//!
//! Requests come in three flavours:
//!
//! - **immediate**: non-blocking yes/no, refused when older waiters
//!   would be starved;
//! - **delay-OK**: queued FIFO, granted through the dispatcher's event
//!   queue;
//! - **time-delayed**: parked in a min-heap until an earliest-grant
//!   time, then converted to delay-OK by the periodic nudge.
//!
//! A priority cutoff per kind freezes out low-priority requests: a
//! request with `priority > cutoff` (smaller number = higher priority)
//! is parked on the frozen list until the cutoff rises to admit it.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::fmt;

use super::message::WaypointId;
use crate::config::PRIORITY_CUTOFF_OPEN;

/// The two kinds of work a token can authorise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Cpu,
    Disk,
}

impl TokenKind {
    pub const ALL: [TokenKind; 2] = [TokenKind::Cpu, TokenKind::Disk];

    /// Index into per-kind state arrays.
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::Cpu => 0,
            Self::Disk => 1,
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("CPU"),
            Self::Disk => f.write_str("disk"),
        }
    }
}

/// An opaque work capability. Deliberately not `Clone`: a token moves
/// from the pool to a waypoint and back, it is never duplicated.
#[derive(Debug, PartialEq, Eq)]
pub struct WorkToken {
    kind: TokenKind,
    id: u32,
}

impl WorkToken {
    pub(crate) fn new(kind: TokenKind, id: u32) -> Self {
        Self { kind, id }
    }

    #[inline]
    #[must_use]
    pub fn kind(&self) -> TokenKind {
        self.kind
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl fmt::Display for WorkToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} token #{}", self.kind, self.id)
    }
}

/// A queued token request. Smaller priority numbers are more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenRequest {
    pub waypoint: WaypointId,
    pub priority: i32,
}

/// A time-delayed request, eligible no earlier than `earliest_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DelayedRequest {
    request: TokenRequest,
    inserted_ms: u64,
    earliest_ms: u64,
}

// Inverted ordering so the BinaryHeap pops the request with the
// smallest (earliest_ms, inserted_ms) first.
impl Ord for DelayedRequest {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.earliest_ms, other.inserted_ms).cmp(&(self.earliest_ms, self.inserted_ms))
    }
}

impl PartialOrd for DelayedRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Outcome of processing one grant event.
#[derive(Debug)]
pub(crate) enum GrantOutcome {
    /// Bind this token to this request's waypoint.
    Granted(TokenRequest, WorkToken),
    /// The head request was frozen out by the cutoff; the event is
    /// consumed without binding a token.
    Frozen(TokenRequest),
    /// Nothing to do: no waiter or no token. Events are hints, not
    /// obligations.
    Idle,
}

/// All scheduling state for one token kind.
#[derive(Debug)]
pub(crate) struct TokenPool {
    kind: TokenKind,
    size: usize,
    unused: VecDeque<WorkToken>,
    pending: VecDeque<TokenRequest>,
    frozen: Vec<TokenRequest>,
    scheduled: BinaryHeap<DelayedRequest>,
    cutoff: i32,
}

impl TokenPool {
    pub(crate) fn new(kind: TokenKind, count: usize, id_base: u32) -> Self {
        let unused = (0..count)
            .map(|i| WorkToken::new(kind, id_base + i as u32))
            .collect();
        Self {
            kind,
            size: count,
            unused,
            pending: VecDeque::new(),
            frozen: Vec::new(),
            scheduled: BinaryHeap::new(),
            cutoff: PRIORITY_CUTOFF_OPEN,
        }
    }

    /// Non-blocking request. Refused when the cutoff excludes it or when
    /// granting would starve queued waiters (there must be strictly more
    /// free tokens than pending requests).
    pub(crate) fn request_immediate(&mut self, priority: i32) -> Option<WorkToken> {
        if priority > self.cutoff {
            return None;
        }
        if self.unused.len() <= self.pending.len() {
            return None;
        }
        self.unused.pop_front()
    }

    /// Queue a delay-OK request. Returns `true` when the caller should
    /// enqueue a grant event: the queue just grew and every waiter is
    /// still covered by a free token.
    #[must_use]
    pub(crate) fn push_delay_ok(&mut self, request: TokenRequest) -> bool {
        self.pending.push_back(request);
        self.unused.len() >= self.pending.len()
    }

    /// Park a request until `now + millis`.
    pub(crate) fn push_delayed(&mut self, request: TokenRequest, millis: u64, now_ms: u64) {
        self.scheduled.push(DelayedRequest {
            request,
            inserted_ms: now_ms,
            earliest_ms: now_ms.saturating_add(millis),
        });
    }

    /// Pop every delayed request whose earliest-grant time has passed,
    /// in (earliest, inserted) order.
    pub(crate) fn take_due(&mut self, now_ms: u64) -> Vec<TokenRequest> {
        let mut due = Vec::new();
        while let Some(top) = self.scheduled.peek() {
            if top.earliest_ms > now_ms {
                break;
            }
            let delayed = self.scheduled.pop().expect("peeked entry");
            due.push(delayed.request);
        }
        due
    }

    /// Take a token back. Returns `true` when the caller should enqueue
    /// a grant event: a waiter exists that this token can now cover.
    #[must_use]
    pub(crate) fn give_back(&mut self, token: WorkToken) -> bool {
        debug_assert_eq!(token.kind(), self.kind, "token returned to the wrong pool");
        self.unused.push_back(token);
        self.unused.len() <= self.pending.len()
    }

    /// Process one grant event against the head of the pending queue.
    pub(crate) fn process_grant(&mut self) -> GrantOutcome {
        let Some(head) = self.pending.front() else {
            return GrantOutcome::Idle;
        };
        if head.priority > self.cutoff {
            let frozen = self.pending.pop_front().expect("head exists");
            self.frozen.push(frozen);
            return GrantOutcome::Frozen(frozen);
        }
        if self.unused.is_empty() {
            return GrantOutcome::Idle;
        }
        let request = self.pending.pop_front().expect("head exists");
        let token = self.unused.pop_front().expect("token exists");
        GrantOutcome::Granted(request, token)
    }

    /// Change the cutoff. Requests frozen out before and now eligible
    /// are returned for re-queueing as delay-OK (in their frozen order);
    /// pending requests the new cutoff excludes move to the frozen list.
    pub(crate) fn set_cutoff(&mut self, priority: i32) -> Vec<TokenRequest> {
        self.cutoff = priority;

        let mut promoted = Vec::new();
        self.frozen.retain(|request| {
            if request.priority <= priority {
                promoted.push(*request);
                false
            } else {
                true
            }
        });

        let mut still_pending = VecDeque::with_capacity(self.pending.len());
        while let Some(request) = self.pending.pop_front() {
            if request.priority > priority {
                self.frozen.push(request);
            } else {
                still_pending.push_back(request);
            }
        }
        self.pending = still_pending;

        promoted
    }

    #[inline]
    pub(crate) fn cutoff(&self) -> i32 {
        self.cutoff
    }

    #[inline]
    pub(crate) fn kind(&self) -> TokenKind {
        self.kind
    }

    #[inline]
    pub(crate) fn pool_size(&self) -> usize {
        self.size
    }

    #[inline]
    pub(crate) fn unused_len(&self) -> usize {
        self.unused.len()
    }

    #[inline]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    #[inline]
    pub(crate) fn frozen_len(&self) -> usize {
        self.frozen.len()
    }

    #[inline]
    pub(crate) fn scheduled_len(&self) -> usize {
        self.scheduled.len()
    }
}
