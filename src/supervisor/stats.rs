//! # Cluster statistics and per-worker records.
//!
//! [`ClusterStats`] is the master's single authoritative view of the pool.
//! It is owned by the supervisor core loop: every mutation happens on that
//! one task, so observers (the monitor endpoint reads through a shared
//! lock) always see a consistent pool — never a half-applied
//! death-and-replacement.
//!
//! The struct is `Serialize` because the monitor endpoint returns it as
//! JSON verbatim.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::protocol::HeartbeatSample;

/// Lifecycle state of one worker process.
///
/// Exit is terminal and deletes the record, so it has no variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Forked; listeners not yet confirmed.
    Spawning,
    /// All listeners bound, confirmed over the control channel.
    Listening,
    /// Serving traffic (heartbeats arriving).
    Accepting,
    /// Stopped accepting; waiting for in-flight connections.
    Draining,
}

/// Live record for one worker process.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerRecord {
    /// OS process id.
    pub pid: u32,
    /// Application ports this worker serves (shared with its siblings).
    pub ports: Vec<u16>,
    /// Current lifecycle state.
    pub state: WorkerState,
    /// Health-check disabled flag, as last reported.
    pub disabled: bool,
    /// Currently open connections, from the last heartbeat.
    pub pending_connections: u64,
    /// Cumulative accepted connections, from the last heartbeat.
    pub total_connections: u64,
    /// Idle-timeout destroyed connections, from the last heartbeat.
    pub timedout_connections: u64,
    /// Named counters bumped over the control channel.
    pub counters: HashMap<String, u64>,
}

impl WorkerRecord {
    fn new(pid: u32, ports: Vec<u16>) -> Self {
        Self {
            pid,
            ports,
            state: WorkerState::Spawning,
            disabled: false,
            pending_connections: 0,
            total_connections: 0,
            timedout_connections: 0,
            counters: HashMap::new(),
        }
    }
}

/// Aggregate view of the whole cluster, exposed by the monitor endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterStats {
    /// Master PID.
    pub pid: u32,
    /// Master start time, seconds since the Unix epoch.
    pub started_epoch_secs: u64,
    /// Host total memory at master start, bytes.
    pub total_mem: u64,
    /// Host free memory at master start, bytes.
    pub free_mem: u64,
    /// Number of currently live workers.
    pub live_workers: usize,
    /// Cumulative count of workers that terminated abnormally.
    pub workers_killed: u64,
    /// Per-worker records keyed by PID.
    pub workers: HashMap<u32, WorkerRecord>,
}

impl ClusterStats {
    /// Creates an empty stats view for the master with PID `pid`.
    pub fn new(pid: u32) -> Self {
        let started = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let mut sys = sysinfo::System::new();
        sys.refresh_memory();
        Self {
            pid,
            started_epoch_secs: started,
            total_mem: sys.total_memory(),
            free_mem: sys.free_memory(),
            live_workers: 0,
            workers_killed: 0,
            workers: HashMap::new(),
        }
    }

    /// Records a fresh fork: inserts a `Spawning` record and increments
    /// the live count.
    pub fn record_fork(&mut self, pid: u32, ports: Vec<u16>) {
        self.workers.insert(pid, WorkerRecord::new(pid, ports));
        self.live_workers += 1;
    }

    /// Marks a worker's listeners as confirmed.
    pub fn record_listening(&mut self, pid: u32) {
        if let Some(rec) = self.workers.get_mut(&pid) {
            rec.state = WorkerState::Listening;
        }
    }

    /// Marks a worker as draining.
    pub fn record_draining(&mut self, pid: u32) {
        if let Some(rec) = self.workers.get_mut(&pid) {
            rec.state = WorkerState::Draining;
        }
    }

    /// Records a worker exit: removes its record and decrements the live
    /// count. Abnormal exits additionally bump the killed counter.
    pub fn record_exit(&mut self, pid: u32, clean: bool) {
        if self.workers.remove(&pid).is_some() {
            self.live_workers = self.live_workers.saturating_sub(1);
        }
        if !clean {
            self.workers_killed += 1;
        }
    }

    /// Increments a named counter on one worker's record.
    pub fn bump_counter(&mut self, pid: u32, name: &str) {
        if let Some(rec) = self.workers.get_mut(&pid) {
            *rec.counters.entry(name.to_string()).or_insert(0) += 1;
        }
    }

    /// Applies the connection counts carried by a heartbeat sample. The
    /// first heartbeat is the evidence that a listening worker serves
    /// traffic, and promotes it to `Accepting`.
    pub fn apply_heartbeat(&mut self, sample: &HeartbeatSample) {
        if let Some(rec) = self.workers.get_mut(&sample.pid) {
            rec.pending_connections = sample.pending_connections;
            rec.total_connections = sample.total_connections;
            rec.timedout_connections = sample.timedout_connections;
            if rec.state == WorkerState::Listening {
                rec.state = WorkerState::Accepting;
            }
        }
    }

    /// Sets the health-check disabled flag across the whole pool (the
    /// enable/disable commands are always cluster-wide broadcasts).
    pub fn set_disabled_all(&mut self, disabled: bool) {
        for rec in self.workers.values_mut() {
            rec.disabled = disabled;
        }
    }

    /// PIDs of all live workers, unordered.
    pub fn worker_pids(&self) -> Vec<u32> {
        self.workers.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fork_then_exit_keeps_counts_consistent() {
        let mut stats = ClusterStats::new(1);
        stats.record_fork(10, vec![8080]);
        stats.record_fork(11, vec![8080]);
        assert_eq!(stats.live_workers, 2);

        stats.record_exit(10, true);
        assert_eq!(stats.live_workers, 1);
        assert_eq!(stats.workers_killed, 0);

        stats.record_exit(11, false);
        assert_eq!(stats.live_workers, 0);
        assert_eq!(stats.workers_killed, 1);
        assert!(stats.workers.is_empty());
    }

    #[test]
    fn exit_of_unknown_pid_only_counts_the_kill() {
        let mut stats = ClusterStats::new(1);
        stats.record_exit(99, false);
        assert_eq!(stats.live_workers, 0);
        assert_eq!(stats.workers_killed, 1);
    }

    #[test]
    fn counters_and_heartbeats_update_records() {
        let mut stats = ClusterStats::new(1);
        stats.record_fork(10, vec![8080]);
        stats.bump_counter(10, "requests");
        stats.bump_counter(10, "requests");
        stats.apply_heartbeat(&HeartbeatSample {
            pid: 10,
            uptime_secs: 5,
            free_mem: 1024,
            total_connections: 7,
            pending_connections: 2,
            timedout_connections: 1,
        });

        let rec = &stats.workers[&10];
        assert_eq!(rec.counters["requests"], 2);
        assert_eq!(rec.total_connections, 7);
        assert_eq!(rec.pending_connections, 2);
        assert_eq!(rec.timedout_connections, 1);
    }

    #[test]
    fn state_transitions() {
        let mut stats = ClusterStats::new(1);
        stats.record_fork(10, vec![8080]);
        assert_eq!(stats.workers[&10].state, WorkerState::Spawning);
        stats.record_listening(10);
        assert_eq!(stats.workers[&10].state, WorkerState::Listening);
        stats.apply_heartbeat(&HeartbeatSample {
            pid: 10,
            uptime_secs: 1,
            free_mem: 1024,
            total_connections: 0,
            pending_connections: 0,
            timedout_connections: 0,
        });
        assert_eq!(stats.workers[&10].state, WorkerState::Accepting);
        stats.record_draining(10);
        assert_eq!(stats.workers[&10].state, WorkerState::Draining);
        // A late heartbeat never un-drains a worker.
        stats.apply_heartbeat(&HeartbeatSample {
            pid: 10,
            uptime_secs: 2,
            free_mem: 1024,
            total_connections: 3,
            pending_connections: 1,
            timedout_connections: 0,
        });
        assert_eq!(stats.workers[&10].state, WorkerState::Draining);
    }

    #[test]
    fn serializes_for_the_monitor_endpoint() {
        let mut stats = ClusterStats::new(42);
        stats.record_fork(10, vec![8080]);
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["pid"], 42);
        assert_eq!(json["live_workers"], 1);
        assert_eq!(json["workers"]["10"]["state"], "spawning");
        // The host memory snapshot taken at master start.
        assert!(json["total_mem"].is_u64());
        assert!(json["free_mem"].is_u64());
    }
}
