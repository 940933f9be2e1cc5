//! # Heartbeat aggregation.
//!
//! Workers emit one [`HeartbeatSample`] per heartbeat interval. The master
//! buffers them and, on each aggregation tick, collapses the buffer into a
//! single [`ClusterHeartbeat`]: mean uptime and free memory, summed
//! connection counts. The buffer is cleared on every aggregation.
//!
//! ## Rules
//! - An empty buffer produces nothing: a silent cluster emits no
//!   heartbeat rather than a zeroed one.
//! - `workers` counts buffered samples, not pool slots; a worker that
//!   reported twice between ticks is counted twice.

use crate::protocol::{ClusterHeartbeat, HeartbeatSample};

/// Buffers worker heartbeat samples between aggregation ticks.
pub struct HeartbeatAggregator {
    master_pid: u32,
    buffer: Vec<HeartbeatSample>,
}

impl HeartbeatAggregator {
    /// Creates an aggregator stamping aggregates with `master_pid`.
    pub fn new(master_pid: u32) -> Self {
        Self {
            master_pid,
            buffer: Vec::new(),
        }
    }

    /// Buffers one sample until the next aggregation tick.
    pub fn push(&mut self, sample: HeartbeatSample) {
        self.buffer.push(sample);
    }

    /// Number of buffered samples.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// True when no samples arrived since the last aggregation.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Drains the buffer into one aggregate, or `None` when it is empty.
    pub fn aggregate(&mut self) -> Option<ClusterHeartbeat> {
        if self.buffer.is_empty() {
            return None;
        }
        let n = self.buffer.len();
        let mut uptime_sum = 0u64;
        let mut free_sum = 0u64;
        let mut total = 0u64;
        let mut pending = 0u64;
        let mut timedout = 0u64;
        for s in self.buffer.drain(..) {
            uptime_sum += s.uptime_secs;
            free_sum += s.free_mem;
            total += s.total_connections;
            pending += s.pending_connections;
            timedout += s.timedout_connections;
        }
        Some(ClusterHeartbeat {
            pid: self.master_pid,
            workers: n,
            uptime_secs: uptime_sum as f64 / n as f64,
            free_mem: free_sum as f64 / n as f64,
            total_connections: total,
            pending_connections: pending,
            timedout_connections: timedout,
        })
    }
}
