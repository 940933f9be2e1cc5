//! # Control-channel message types.
//!
//! [`ControlMessage`] is the closed, serde-tagged union exchanged between
//! the master and each worker. Using a tagged enum instead of
//! stringly-typed event names gives exhaustiveness checking at compile
//! time: every consumer matches on every variant.
//!
//! Wire format is one JSON object per line (see
//! [`channel`](crate::protocol::channel)), e.g.:
//!
//! ```json
//! {"type":"counter","name":"listening"}
//! {"type":"heartbeat","pid":4242,"uptime_secs":12,"free_mem":1048576,"total_connections":7,"pending_connections":2,"timedout_connections":0}
//! {"type":"command","command":"drain"}
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default delegate timeout when a request does not carry one.
pub const DEFAULT_DELEGATE_TIMEOUT: Duration = Duration::from_secs(10);

/// A broadcastable worker command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// Stop accepting, wait for in-flight connections, exit cleanly.
    Drain,
    /// Set the worker's health-check state to disabled (ECV reports
    /// DISABLED; acceptance is unaffected).
    Disable,
    /// Clear the disabled state.
    Enable,
}

/// One per-worker liveness/load snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatSample {
    /// PID of the reporting worker.
    pub pid: u32,
    /// Worker process uptime, whole seconds.
    pub uptime_secs: u64,
    /// Free system memory in bytes at sampling time.
    pub free_mem: u64,
    /// Cumulative accepted connections.
    pub total_connections: u64,
    /// Currently open connections.
    pub pending_connections: u64,
    /// Connections destroyed by the idle timeout.
    pub timedout_connections: u64,
}

/// The aggregated cluster heartbeat the master republishes.
///
/// Uptime and free memory are arithmetic means over the buffered samples;
/// connection counts are sums.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterHeartbeat {
    /// PID of the master that produced the aggregate.
    pub pid: u32,
    /// Number of samples aggregated into this heartbeat.
    pub workers: usize,
    /// Mean worker uptime in seconds.
    pub uptime_secs: f64,
    /// Mean free memory in bytes.
    pub free_mem: f64,
    /// Summed cumulative connections.
    pub total_connections: u64,
    /// Summed open connections.
    pub pending_connections: u64,
    /// Summed timed-out connections.
    pub timedout_connections: u64,
}

/// A delegate request: a worker proposing that the master (or peers,
/// via routing) perform work and/or await a correlated response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegateRequest {
    /// Topic naming the delegated work.
    pub delegate: String,

    /// Response topic this request expects an answer on. `None` makes the
    /// request fire-and-forget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect: Option<String>,

    /// Body fields whose equality correlates a response with this
    /// specific request.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matches: Vec<String>,

    /// Specific worker PIDs to route the eventual response to. Absent
    /// means broadcast to all workers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub targets: Option<Vec<u32>>,

    /// Registers the `expect` topic for future update notifications after
    /// the first response. Registration is idempotent per topic.
    #[serde(default)]
    pub notification: bool,

    /// Correlation timeout in milliseconds. Absent → 10s default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Opaque request payload.
    #[serde(default)]
    pub body: Value,
}

impl DelegateRequest {
    /// Creates a fire-and-forget request on `topic`.
    pub fn new(topic: impl Into<String>, body: Value) -> Self {
        Self {
            delegate: topic.into(),
            expect: None,
            matches: Vec::new(),
            targets: None,
            notification: false,
            timeout_ms: None,
            body,
        }
    }

    /// Returns the effective correlation timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_DELEGATE_TIMEOUT)
    }
}

/// Tagged union exchanged over the control channel.
///
/// Worker → master: `Counter`, `Heartbeat`, `Command` (re-broadcast
/// requests from the ECV control routes), `Delegate`.
/// Master → worker: `Command`, `Notify`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Fire-and-forget increment of a named counter scoped to the
    /// sending worker's PID.
    Counter {
        /// Counter name (e.g. `"listening"`).
        name: String,
    },

    /// Periodic liveness/load report.
    Heartbeat(HeartbeatSample),

    /// Worker command. Workers send these upward to request a cluster
    /// broadcast; the master sends them downward to apply them.
    Command {
        /// The command to apply or broadcast.
        command: Command,
    },

    /// Delegate request (worker → master only).
    Delegate(DelegateRequest),

    /// Routed delegate response or notification (master → worker only).
    Notify {
        /// The `expect` topic the payload answers.
        topic: String,
        /// Response payload, or the origin request body on timeout.
        body: Value,
        /// Attached error, set when the correlation timed out.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tag_format_is_stable() {
        let msg = ControlMessage::Counter {
            name: "listening".into(),
        };
        let line = serde_json::to_string(&msg).unwrap();
        assert_eq!(line, r#"{"type":"counter","name":"listening"}"#);
    }

    #[test]
    fn command_decodes_from_snake_case() {
        let msg: ControlMessage =
            serde_json::from_str(r#"{"type":"command","command":"drain"}"#).unwrap();
        assert_eq!(
            msg,
            ControlMessage::Command {
                command: Command::Drain
            }
        );
    }

    #[test]
    fn delegate_defaults_apply() {
        let msg: ControlMessage = serde_json::from_str(
            r#"{"type":"delegate","delegate":"lookup","body":{"key":"a"}}"#,
        )
        .unwrap();
        let ControlMessage::Delegate(req) = msg else {
            panic!("wrong variant");
        };
        assert!(req.expect.is_none());
        assert!(req.matches.is_empty());
        assert!(!req.notification);
        assert_eq!(req.timeout(), DEFAULT_DELEGATE_TIMEOUT);
        assert_eq!(req.body, json!({"key": "a"}));
    }

    #[test]
    fn notify_error_is_omitted_when_absent() {
        let msg = ControlMessage::Notify {
            topic: "resolved".into(),
            body: json!({"ok": true}),
            error: None,
        };
        let line = serde_json::to_string(&msg).unwrap();
        assert!(!line.contains("error"));
    }
}
