//! # Global cluster configuration.
//!
//! Provides [`ClusterConfig`], the immutable configuration resolved once at
//! startup and shared by the master and every worker. The master serializes
//! it into the worker's environment on spawn, so the whole struct is
//! `Serialize`/`Deserialize`.
//!
//! ## Sentinel values
//! - `workers = 0` → one worker per available CPU
//! - `idle_timeout = 0s` → idle sockets are never timed out
//! - `conn_threshold = 0` → recycling disabled
//!
//! Prefer the helper accessors (`workers_resolved`, `idle_timeout_opt`,
//! `conn_threshold_opt`) over sprinkling sentinel checks across the codebase.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ClusterError;

/// Health-check (ECV) responder configuration.
///
/// Each worker serves the ECV endpoint on `port`, bound with
/// `SO_REUSEPORT` so external traffic managers can probe the cluster
/// address and reach whichever worker the kernel picks.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EcvConfig {
    /// Port the ECV responder listens on (shared across workers).
    pub port: u16,
    /// Probe path. Defaults to `/ecv`.
    pub path: String,
    /// Enables the `POST <path>/enable` / `POST <path>/disable` control
    /// routes. Disabled by default.
    pub control: bool,
}

impl Default for EcvConfig {
    fn default() -> Self {
        Self {
            port: 8082,
            path: "/ecv".to_string(),
            control: false,
        }
    }
}

/// Immutable configuration for a process cluster.
///
/// Defines:
/// - **Listening surface**: application port(s) and host, shared by all
///   workers via `SO_REUSEPORT`
/// - **Pool sizing**: worker count
/// - **Lifecycle thresholds**: idle-socket timeout, connection recycle
///   threshold, drain/recycle poll intervals
/// - **Heartbeats**: per-worker emission interval and master-side
///   aggregation interval
/// - **Registry layout**: pids and logs directories
///
/// ## Invariants (checked by [`ClusterConfig::validate`])
/// - at least one application port
/// - application ports, monitor port and ECV port are pairwise distinct
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Application listening port(s), in binding order.
    pub ports: Vec<u16>,

    /// Host/interface the workers bind. Defaults to `0.0.0.0`.
    pub host: String,

    /// Monitor port on the master (stats endpoint). Must differ from the
    /// application ports.
    pub monitor_port: u16,

    /// Host/interface the monitor binds. Defaults to `0.0.0.0`.
    pub monitor_host: String,

    /// Number of worker processes. `0` = one per available CPU.
    pub workers: usize,

    /// Idle-socket timeout applied to every accepted connection, measured
    /// from the last successful read or write on the stream.
    ///
    /// `0s` = no timeout. On expiry the socket is destroyed, the
    /// connection is counted as timed out (not closed cleanly), and a
    /// warning event is published.
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,

    /// Cumulative-connection recycle threshold.
    ///
    /// Once a worker has accepted more than this many connections in
    /// total it drains itself and exits so the master replaces it with a
    /// fresh process. `0` = recycling disabled.
    pub conn_threshold: u64,

    /// Interval at which each worker emits a heartbeat sample.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Interval at which the master drains the heartbeat buffer and
    /// publishes one aggregated cluster heartbeat.
    #[serde(with = "humantime_serde")]
    pub aggregation_interval: Duration,

    /// Interval at which a draining worker polls its live-connection
    /// count while waiting to exit.
    #[serde(with = "humantime_serde")]
    pub drain_poll: Duration,

    /// Interval at which a worker checks its cumulative-connection count
    /// against `conn_threshold`.
    #[serde(with = "humantime_serde")]
    pub recycle_poll: Duration,

    /// Maximum wait for workers to drain during graceful shutdown before
    /// force-terminating. `0s` = no limit (wait for the live-connection
    /// count to reach zero however long it takes).
    #[serde(with = "humantime_serde")]
    pub grace: Duration,

    /// Health-check responder configuration. `None` disables the ECV
    /// surface entirely.
    pub ecv: Option<EcvConfig>,

    /// Directory holding one PID file per live process.
    pub pids_dir: PathBuf,

    /// Directory for operational logs (existence only; format/rotation is
    /// out of scope).
    pub logs_dir: PathBuf,

    /// Capacity of the event bus ring buffer (min 1; clamped).
    pub bus_capacity: usize,
}

impl ClusterConfig {
    /// Returns the worker count with the CPU-count default applied.
    ///
    /// Always at least 1.
    pub fn workers_resolved(&self) -> usize {
        if self.workers == 0 {
            std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(1)
        } else {
            self.workers
        }
    }

    /// Returns the idle timeout as an `Option` (`0s` → `None`).
    #[inline]
    pub fn idle_timeout_opt(&self) -> Option<Duration> {
        if self.idle_timeout == Duration::ZERO {
            None
        } else {
            Some(self.idle_timeout)
        }
    }

    /// Returns the recycle threshold as an `Option` (`0` → `None`).
    #[inline]
    pub fn conn_threshold_opt(&self) -> Option<u64> {
        if self.conn_threshold == 0 {
            None
        } else {
            Some(self.conn_threshold)
        }
    }

    /// Returns a bus capacity clamped to a minimum of 1.
    #[inline]
    pub fn bus_capacity_clamped(&self) -> usize {
        self.bus_capacity.max(1)
    }

    /// Validates cross-field invariants.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Config`] when no application port is
    /// configured, when the monitor or ECV port collides with an
    /// application port, when the ECV path does not start with `/`, or
    /// when a timer interval is zero (the sentinel durations
    /// `idle_timeout` and `grace` may be zero; the tick intervals may
    /// not).
    pub fn validate(&self) -> Result<(), ClusterError> {
        if self.ports.is_empty() {
            return Err(ClusterError::Config {
                reason: "at least one application port is required".into(),
            });
        }
        for (name, value) in [
            ("heartbeat_interval", self.heartbeat_interval),
            ("aggregation_interval", self.aggregation_interval),
            ("drain_poll", self.drain_poll),
            ("recycle_poll", self.recycle_poll),
        ] {
            if value.is_zero() {
                return Err(ClusterError::Config {
                    reason: format!("{name} must be non-zero"),
                });
            }
        }
        if self.ports.contains(&self.monitor_port) {
            return Err(ClusterError::Config {
                reason: format!(
                    "monitor port {} collides with an application port",
                    self.monitor_port
                ),
            });
        }
        if let Some(ecv) = &self.ecv {
            if self.ports.contains(&ecv.port) || ecv.port == self.monitor_port {
                return Err(ClusterError::Config {
                    reason: format!("ecv port {} collides with another port", ecv.port),
                });
            }
            if !ecv.path.starts_with('/') {
                return Err(ClusterError::Config {
                    reason: format!("ecv path {:?} must start with '/'", ecv.path),
                });
            }
        }
        Ok(())
    }
}

impl Default for ClusterConfig {
    /// Default configuration:
    ///
    /// - `ports = [8080]`, `host = 0.0.0.0`
    /// - `monitor_port = 8081`
    /// - `workers = 0` (one per CPU)
    /// - `idle_timeout = 0s` (no idle timeout)
    /// - `conn_threshold = 0` (recycling disabled)
    /// - `heartbeat_interval = 60s`, `aggregation_interval = 60s`
    /// - `drain_poll = 100ms`, `recycle_poll = 100ms`
    /// - `grace = 0s` (graceful shutdown waits indefinitely)
    /// - `ecv = None`
    /// - `pids_dir = ./pids`, `logs_dir = ./logs`
    /// - `bus_capacity = 1024`
    fn default() -> Self {
        Self {
            ports: vec![8080],
            host: "0.0.0.0".to_string(),
            monitor_port: 8081,
            monitor_host: "0.0.0.0".to_string(),
            workers: 0,
            idle_timeout: Duration::ZERO,
            conn_threshold: 0,
            heartbeat_interval: Duration::from_secs(60),
            aggregation_interval: Duration::from_secs(60),
            drain_poll: Duration::from_millis(100),
            recycle_poll: Duration::from_millis(100),
            grace: Duration::ZERO,
            ecv: None,
            pids_dir: PathBuf::from("pids"),
            logs_dir: PathBuf::from("logs"),
            bus_capacity: 1024,
        }
    }
}
