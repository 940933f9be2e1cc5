//! # Runtime events emitted by the supervisor and worker runtimes.
//!
//! The [`EventKind`] enum classifies event types across the cluster:
//! - **Pool events**: worker fork/listen/exit/death, replacement
//! - **Worker-local events**: drain, recycle, idle-timeout warnings,
//!   enable/disable state changes
//! - **Heartbeat events**: the aggregated cluster heartbeat
//! - **Delegate events**: request/resolve/timeout/notification on the
//!   control channel's delegate pattern
//! - **Shutdown events**: shutdown request, pool-empty, grace exceeded
//!
//! The [`Event`] struct carries optional metadata: the worker PID, a
//! reason string, a delegate topic and payload, or an aggregated
//! heartbeat.
//!
//! ## Ordering guarantees
//! Each event has a process-local monotonically increasing sequence number
//! (`seq`). Use `seq` to restore exact order when events are observed out
//! of order. Sequence numbers are per-process: master and worker events
//! are separate streams.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::SystemTime;

use crate::protocol::ClusterHeartbeat;

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of runtime events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // === Pool events (master side) ===
    /// A worker process was forked and its PID file written.
    ///
    /// Sets: `pid`, `at`, `seq`.
    WorkerForked,

    /// A worker reported that all its listeners are bound and accepting.
    ///
    /// Sets: `pid`, `at`, `seq`.
    WorkerListening,

    /// A worker exited cleanly (status 0, planned drain). No replacement
    /// is spawned.
    ///
    /// Sets: `pid`, `at`, `seq`.
    WorkerExited,

    /// A worker terminated abnormally. A replacement fork follows
    /// immediately.
    ///
    /// Sets: `pid`, `reason` (exit status description), `at`, `seq`.
    WorkerDied,

    // === Worker-local events ===
    /// The worker stopped accepting and is waiting for in-flight
    /// connections to close.
    ///
    /// Sets: `pid`, `reason` (`"drain"` or `"recycle"`), `at`, `seq`.
    DrainStarted,

    /// Cumulative connections exceeded the recycle threshold; the worker
    /// begins a self-drain.
    ///
    /// Sets: `pid`, `count` (cumulative connections), `at`, `seq`.
    RecycleTriggered,

    /// An idle socket hit the configured timeout and was destroyed.
    ///
    /// Sets: `pid`, `at`, `seq`.
    ConnectionTimedOut,

    /// The worker's health-check state was switched to disabled.
    ///
    /// Sets: `pid`, `at`, `seq`.
    WorkerDisabled,

    /// The worker's health-check state was switched back to enabled.
    ///
    /// Sets: `pid`, `at`, `seq`.
    WorkerEnabled,

    // === Heartbeat events ===
    /// One aggregated cluster heartbeat (per aggregation interval with at
    /// least one buffered sample).
    ///
    /// Sets: `heartbeat`, `at`, `seq`.
    HeartbeatAggregated,

    // === Delegate events ===
    /// A worker requested delegated work on a topic.
    ///
    /// Sets: `pid` (requester), `topic`, `payload`, `at`, `seq`.
    DelegateRequested,

    /// A delegate response was correlated and routed back to workers.
    ///
    /// Sets: `topic`, `payload`, `at`, `seq`.
    DelegateResolved,

    /// A delegate request timed out; the origin message was redelivered
    /// with an attached error.
    ///
    /// Sets: `topic`, `reason`, `at`, `seq`.
    DelegateTimedOut,

    /// A routed delegate response or notification arrived at this worker.
    ///
    /// Sets: `topic`, `payload`, `reason` (attached error, if any), `at`,
    /// `seq`.
    DelegateNotified,

    // === Shutdown events ===
    /// Shutdown requested (OS signal observed or shutdown API invoked).
    ///
    /// Sets: `reason` (`"interrupt"` or `"terminate"`), `at`, `seq`.
    ShutdownRequested,

    /// All workers exited during a coordinated shutdown.
    ///
    /// Sets: `at`, `seq`.
    AllWorkersExited,

    /// Shutdown grace exceeded; some workers had to be force-terminated.
    ///
    /// Sets: `at`, `seq`.
    GraceExceeded,
}

/// Runtime event with optional metadata.
///
/// - `seq`: monotonic per-process sequence for ordering
/// - `at`: wall-clock timestamp (for logs)
/// - other optional fields are set depending on the [`EventKind`]
#[derive(Clone, Debug)]
pub struct Event {
    /// Process-locally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp.
    pub at: SystemTime,
    /// Event classification.
    pub kind: EventKind,

    /// Worker PID, if applicable.
    pub pid: Option<u32>,
    /// Generic counter value (e.g. cumulative connections at recycle).
    pub count: Option<u64>,
    /// Human-readable reason (exit status, errors, timeout details).
    pub reason: Option<Arc<str>>,
    /// Delegate topic, if applicable.
    pub topic: Option<Arc<str>>,
    /// Delegate payload, if applicable.
    pub payload: Option<serde_json::Value>,
    /// Aggregated cluster heartbeat (only for `HeartbeatAggregated`).
    pub heartbeat: Option<ClusterHeartbeat>,
}

impl Event {
    /// Creates a new event of the given kind with the current timestamp
    /// and next sequence number.
    pub fn new(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            pid: None,
            count: None,
            reason: None,
            topic: None,
            payload: None,
            heartbeat: None,
        }
    }

    /// Attaches a worker PID.
    #[inline]
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    /// Attaches a counter value.
    #[inline]
    pub fn with_count(mut self, count: u64) -> Self {
        self.count = Some(count);
        self
    }

    /// Attaches a human-readable reason.
    #[inline]
    pub fn with_reason(mut self, reason: impl Into<Arc<str>>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attaches a delegate topic.
    #[inline]
    pub fn with_topic(mut self, topic: impl Into<Arc<str>>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Attaches a delegate payload.
    #[inline]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Attaches an aggregated heartbeat.
    #[inline]
    pub fn with_heartbeat(mut self, hb: ClusterHeartbeat) -> Self {
        self.heartbeat = Some(hb);
        self
    }

}
