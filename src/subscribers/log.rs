//! # Simple logging subscriber for debugging and demos.
//!
//! [`LogWriter`] prints events to stderr in a human-readable format.
//! Stderr is deliberate: in worker processes stdout carries the control
//! channel, so anything written there would corrupt the protocol stream.
//!
//! ## Output format
//! ```text
//! [forked] pid=4242
//! [listening] pid=4242
//! [died] pid=4242 reason="exit status 1"
//! [drain] pid=4242 reason="recycle"
//! [heartbeat] workers=4 total=120 pending=3 timedout=1
//! [shutdown-requested] reason="terminate"
//! ```

use async_trait::async_trait;

use crate::events::{Event, EventKind};

use super::Subscribe;

/// Stderr logging subscriber.
///
/// Enabled via the `logging` feature. Prints human-readable event
/// descriptions for development and demos. Not intended for production
/// use — implement a custom [`Subscribe`] for structured logging or
/// metrics collection.
pub struct LogWriter;

#[async_trait]
impl Subscribe for LogWriter {
    async fn on_event(&self, e: &Event) {
        match e.kind {
            EventKind::WorkerForked => {
                eprintln!("[forked] pid={:?}", e.pid);
            }
            EventKind::WorkerListening => {
                eprintln!("[listening] pid={:?}", e.pid);
            }
            EventKind::WorkerExited => {
                eprintln!("[exited] pid={:?}", e.pid);
            }
            EventKind::WorkerDied => {
                eprintln!("[died] pid={:?} reason={:?}", e.pid, e.reason);
            }
            EventKind::DrainStarted => {
                eprintln!("[drain] pid={:?} reason={:?}", e.pid, e.reason);
            }
            EventKind::RecycleTriggered => {
                eprintln!("[recycle] pid={:?} total_conns={:?}", e.pid, e.count);
            }
            EventKind::ConnectionTimedOut => {
                eprintln!("[conn-timeout] pid={:?}", e.pid);
            }
            EventKind::WorkerDisabled => {
                eprintln!("[disabled] pid={:?}", e.pid);
            }
            EventKind::WorkerEnabled => {
                eprintln!("[enabled] pid={:?}", e.pid);
            }
            EventKind::HeartbeatAggregated => {
                if let Some(hb) = &e.heartbeat {
                    eprintln!(
                        "[heartbeat] workers={} total={} pending={} timedout={}",
                        hb.workers, hb.total_connections, hb.pending_connections,
                        hb.timedout_connections
                    );
                }
            }
            EventKind::DelegateRequested => {
                eprintln!("[delegate] pid={:?} topic={:?}", e.pid, e.topic);
            }
            EventKind::DelegateResolved => {
                eprintln!("[delegate-resolved] topic={:?}", e.topic);
            }
            EventKind::DelegateTimedOut => {
                eprintln!("[delegate-timeout] topic={:?}", e.topic);
            }
            EventKind::DelegateNotified => {
                eprintln!("[delegate-notified] topic={:?} err={:?}", e.topic, e.reason);
            }
            EventKind::ShutdownRequested => {
                eprintln!("[shutdown-requested] reason={:?}", e.reason);
            }
            EventKind::AllWorkersExited => {
                eprintln!("[all-workers-exited]");
            }
            EventKind::GraceExceeded => {
                eprintln!("[grace-exceeded]");
            }
        }
    }

    fn name(&self) -> &'static str {
        "log_writer"
    }
}
