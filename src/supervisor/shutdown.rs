//! # Shutdown signals and the registry kill-all sweep.
//!
//! Two distinct shutdown paths exist:
//! - **Interrupt** (SIGINT/SIGQUIT): abrupt. The master sweeps the PID
//!   registry with SIGKILL and exits immediately.
//! - **Terminate** (SIGTERM): graceful. The master broadcasts a drain
//!   command, waits for the pool to empty, then exits.
//!
//! [`kill_all`] is the sweep both the signal paths and the out-of-process
//! `stop`/`shutdown` APIs use. It operates on the durable registry, not on
//! in-memory state, so it works from a process that never forked the
//! workers (e.g. a fresh invocation stopping a running cluster).
//!
//! ## Rules
//! - Workers are signaled before masters, so a master never observes its
//!   own shutdown signal while its pool still needs sweeping.
//! - Reaching our own PID means everything else was already handled: the
//!   entry is deleted and the process exits 0 on the spot.
//! - The sweep is best-effort: unreadable files and vanished processes
//!   (ESRCH) are logged and skipped, never fatal.

use std::io;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::signal::unix::{signal, Signal as SignalStream, SignalKind};

use crate::registry::{ProcessRegistry, Role};

/// Which shutdown path a signal selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Abrupt termination (SIGINT, SIGQUIT).
    Interrupt,
    /// Graceful drain (SIGTERM).
    Terminate,
}

/// Registered shutdown signal streams.
///
/// Created once, polled many times: a signal delivered while no `recv`
/// call is in flight stays latched in the streams instead of being lost,
/// which re-registering per poll would not guarantee.
pub struct ShutdownListener {
    interrupt: SignalStream,
    quit: SignalStream,
    terminate: SignalStream,
}

impl ShutdownListener {
    /// Registers the SIGINT/SIGQUIT/SIGTERM streams.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the signal handlers cannot be
    /// registered.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            quit: signal(SignalKind::quit())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Waits for the next shutdown signal.
    pub async fn recv(&mut self) -> ShutdownSignal {
        tokio::select! {
            _ = self.interrupt.recv() => ShutdownSignal::Interrupt,
            _ = self.quit.recv() => ShutdownSignal::Interrupt,
            _ = self.terminate.recv() => ShutdownSignal::Terminate,
        }
    }
}

/// Signals every registered process, workers first, deleting each entry
/// after it is handled.
///
/// If the sweep reaches the current process's own entry, the entry is
/// deleted and the process exits 0 immediately.
///
/// # Errors
///
/// Returns an I/O error only when the registry cannot be listed at all;
/// per-entry failures are logged and skipped.
pub async fn kill_all(registry: &dyn ProcessRegistry, sig: Signal) -> io::Result<()> {
    let mut entries = registry.list().await?;
    entries.sort_by_key(|e| match e.role {
        Role::Worker => 0,
        Role::Master => 1,
    });

    let own = std::process::id();
    for entry in entries {
        let pid = match registry.read(entry).await {
            Ok(pid) => pid,
            Err(e) => {
                eprintln!(
                    "[clustervisor] skipping unreadable pid file {}.{}: {e}",
                    entry.role.as_str(),
                    entry.pid
                );
                continue;
            }
        };

        if pid == own {
            let _ = registry.delete(entry).await;
            std::process::exit(0);
        }

        match kill(Pid::from_raw(pid as i32), sig) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => {
                eprintln!("[clustervisor] failed to signal pid {pid}: {e}");
            }
        }
        if let Err(e) = registry.delete(entry).await {
            eprintln!(
                "[clustervisor] failed to delete pid file {}.{}: {e}",
                entry.role.as_str(),
                entry.pid
            );
        }
    }
    Ok(())
}
