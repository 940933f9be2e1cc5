//! Error types used by the clustervisor runtime.
//!
//! This module defines two main error enums:
//!
//! - [`ClusterError`] — errors raised by the master-side supervisor runtime.
//! - [`WorkerError`] — errors raised inside a worker process.
//!
//! Both types provide helper methods (`as_label`, `as_message`) for logging
//! and metrics. Recoverable conditions (a worker crashing, a delegate
//! timeout, a missing PID target) are *not* modeled here — they are events,
//! handled by the supervisor loops and surfaced through the bus.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// # Errors produced by the master-side supervisor.
///
/// These represent failures of the orchestration process itself. Worker
/// crashes are deliberately absent: they are recovered by replacement and
/// reported as `WorkerDied` events, never as errors.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ClusterError {
    /// A listener could not be bound at startup (monitor or ECV port).
    ///
    /// Fatal by design: a second supervisor instance sharing a port would
    /// corrupt the PID registry, so the process exits instead of limping
    /// with a partial pool.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The address that could not be bound.
        addr: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Configuration rejected during startup validation.
    #[error("invalid configuration: {reason}")]
    Config {
        /// Human-readable description of the violated constraint.
        reason: String,
    },

    /// A worker process could not be launched.
    #[error("failed to spawn worker: {reason}")]
    Spawn {
        /// The underlying failure description.
        reason: String,
    },

    /// PID registry I/O failure outside of the best-effort kill-all path.
    #[error("pid registry error at {path}: {source}")]
    Registry {
        /// The registry path involved.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Shutdown grace period was exceeded; some workers had to be
    /// force-terminated.
    #[error("shutdown grace {grace:?} exceeded; stuck workers: {stuck:?}")]
    GraceExceeded {
        /// The configured grace duration.
        grace: Duration,
        /// PIDs of workers that did not exit in time.
        stuck: Vec<u32>,
    },

    /// Miscellaneous I/O failure (pids/logs directory creation and similar).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClusterError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            ClusterError::Bind { .. } => "cluster_bind_failed",
            ClusterError::Config { .. } => "cluster_config_invalid",
            ClusterError::Spawn { .. } => "cluster_spawn_failed",
            ClusterError::Registry { .. } => "cluster_registry_error",
            ClusterError::GraceExceeded { .. } => "cluster_grace_exceeded",
            ClusterError::Io(_) => "cluster_io_error",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        self.to_string()
    }
}

/// # Errors produced inside a worker process.
///
/// Connection-level failures (a handler error on one socket, an idle
/// timeout) are not errors of the worker: they are counted and reported
/// through events. `WorkerError` covers conditions that prevent the worker
/// from serving at all.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum WorkerError {
    /// A shared listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The address that could not be bound.
        addr: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The control channel to the master closed unexpectedly.
    ///
    /// The worker cannot receive drain/enable/disable commands without it,
    /// so this is terminal for the worker (the master replaces it).
    #[error("control channel closed")]
    ChannelClosed,

    /// Worker-side configuration could not be decoded from the environment.
    #[error("worker bootstrap failed: {reason}")]
    Bootstrap {
        /// Description of the decode failure.
        reason: String,
    },

    /// Miscellaneous I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            WorkerError::Bind { .. } => "worker_bind_failed",
            WorkerError::ChannelClosed => "worker_channel_closed",
            WorkerError::Bootstrap { .. } => "worker_bootstrap_failed",
            WorkerError::Io(_) => "worker_io_error",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        self.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_labels_are_stable() {
        let err = ClusterError::Config {
            reason: "port clash".into(),
        };
        assert_eq!(err.as_label(), "cluster_config_invalid");
        assert!(err.as_message().contains("port clash"));
    }

    #[test]
    fn worker_channel_closed_label() {
        assert_eq!(
            WorkerError::ChannelClosed.as_label(),
            "worker_channel_closed"
        );
    }
}
