//! # Worker actor: one pool slot, one process at a time.
//!
//! Each actor owns one slot of the pool. It launches a worker, registers
//! its PID file, bridges the child's stdio control channel to the core
//! loop, waits for the child to exit, and then decides:
//!
//! - **clean exit (status 0)** — a planned drain. The slot retires; no
//!   replacement is launched.
//! - **abnormal exit** — a death. The actor immediately launches a
//!   replacement, unless the pool is draining or shut down.
//!
//! All pool-state mutation happens in the core loop; the actor only sends
//! [`CoreMsg`]s, so every observer sees death and replacement in a single
//! consistent order (`Down` strictly before the replacement's `Up`).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::process::ChildStdout;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::ClusterConfig;
use crate::events::{Bus, Event, EventKind};
use crate::protocol::{ControlMessage, ControlReceiver, ControlSender};
use crate::registry::{PidEntry, ProcessRegistry, Role};

use super::launcher::{Launcher, SpawnedWorker};

/// Delay before retrying after a failed launch.
const RELAUNCH_BACKOFF: Duration = Duration::from_secs(1);

/// Messages from worker actors to the supervisor core loop.
pub(crate) enum CoreMsg {
    /// A worker is up; `outbound` delivers messages to its stdin.
    Up {
        pid: u32,
        outbound: mpsc::Sender<ControlMessage>,
    },
    /// A control message arrived from the worker's stdout.
    Inbound { pid: u32, message: ControlMessage },
    /// The worker exited. `clean` is true for exit status 0.
    Down { pid: u32, clean: bool },
}

/// One pool slot.
pub(crate) struct WorkerActor {
    pub cfg: ClusterConfig,
    pub launcher: Arc<dyn Launcher>,
    pub registry: Arc<dyn ProcessRegistry>,
    pub bus: Bus,
    pub core_tx: mpsc::Sender<CoreMsg>,
    /// Set by the core loop during graceful shutdown; stops replacements.
    pub draining: Arc<AtomicBool>,
}

impl WorkerActor {
    /// Runs the slot until its worker exits cleanly or the pool stops.
    pub async fn run(self, token: CancellationToken) {
        loop {
            if token.is_cancelled() || self.draining.load(Ordering::SeqCst) {
                break;
            }
            let spawned = match self.launcher.launch(&self.cfg).await {
                Ok(s) => s,
                Err(e) => {
                    eprintln!("[clustervisor] worker launch failed: {}", e.as_message());
                    tokio::time::sleep(RELAUNCH_BACKOFF).await;
                    continue;
                }
            };
            let clean = self.supervise(spawned).await;
            if clean {
                break;
            }
        }
    }

    /// Supervises one child from fork to exit. Returns true on clean exit.
    async fn supervise(&self, mut spawned: SpawnedWorker) -> bool {
        let pid = spawned.pid;
        let entry = PidEntry {
            role: Role::Worker,
            pid,
        };
        if let Err(e) = self.registry.write(entry).await {
            eprintln!("[clustervisor] cannot write pid file for worker {pid}: {e}");
        }
        self.bus
            .publish(Event::new(EventKind::WorkerForked).with_pid(pid));

        // stdin leg: core loop → child
        let (out_tx, mut out_rx) = mpsc::channel::<ControlMessage>(64);
        let stdin = spawned.child.stdin.take();
        let writer = tokio::spawn(async move {
            let Some(stdin) = stdin else { return };
            let mut sender = ControlSender::new(stdin);
            while let Some(msg) = out_rx.recv().await {
                if sender.send(&msg).await.is_err() {
                    break;
                }
            }
        });

        let mut receiver = spawned.child.stdout.take().map(ControlReceiver::new);
        let _ = self.core_tx.send(CoreMsg::Up { pid, outbound: out_tx }).await;

        // stdout leg multiplexed with the exit wait.
        let status = loop {
            tokio::select! {
                status = spawned.child.wait() => break status,
                msg = recv_from(&mut receiver) => match msg {
                    Some(message) => {
                        let _ = self.core_tx.send(CoreMsg::Inbound { pid, message }).await;
                    }
                    None => receiver = None,
                }
            }
        };
        writer.abort();

        if let Err(e) = self.registry.delete(entry).await {
            eprintln!("[clustervisor] cannot delete pid file for worker {pid}: {e}");
        }

        let (clean, describe) = match status {
            Ok(st) => (st.success(), st.to_string()),
            Err(e) => (false, format!("wait failed: {e}")),
        };
        if clean {
            self.bus
                .publish(Event::new(EventKind::WorkerExited).with_pid(pid));
        } else {
            self.bus.publish(
                Event::new(EventKind::WorkerDied)
                    .with_pid(pid)
                    .with_reason(describe),
            );
        }
        let _ = self.core_tx.send(CoreMsg::Down { pid, clean }).await;
        clean
    }
}

/// Receives from the child's stdout, or parks forever once it is closed
/// (the exit-wait branch of the select ends the loop).
async fn recv_from(rx: &mut Option<ControlReceiver<ChildStdout>>) -> Option<ControlMessage> {
    match rx {
        Some(r) => r.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::testutil::ScriptLauncher;

    fn actor(
        launcher: Arc<ScriptLauncher>,
        registry: Arc<dyn ProcessRegistry>,
        core_tx: mpsc::Sender<CoreMsg>,
    ) -> WorkerActor {
        WorkerActor {
            cfg: ClusterConfig::default(),
            launcher,
            registry,
            bus: Bus::new(64),
            core_tx,
            draining: Arc::new(AtomicBool::new(false)),
        }
    }

    fn registry() -> (tempfile::TempDir, Arc<dyn ProcessRegistry>) {
        let tmp = tempfile::tempdir().unwrap();
        let reg = Arc::new(crate::registry::PidFileRegistry::new(tmp.path()));
        (tmp, reg)
    }

    #[tokio::test]
    async fn clean_exit_retires_the_slot() {
        let (_tmp, reg) = registry();
        let (tx, mut rx) = mpsc::channel(32);
        let launcher = ScriptLauncher::new(&["exit 0"]);
        reg.ensure().await.unwrap();

        actor(launcher, reg.clone(), tx)
            .run(CancellationToken::new())
            .await;

        let CoreMsg::Up { pid, .. } = rx.recv().await.unwrap() else {
            panic!("expected Up");
        };
        let CoreMsg::Down { pid: down, clean } = rx.recv().await.unwrap() else {
            panic!("expected Down");
        };
        assert_eq!(pid, down);
        assert!(clean);
        // No replacement, and the pid file is gone.
        assert!(rx.recv().await.is_none());
        assert!(reg.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn abnormal_exit_is_replaced_exactly_once() {
        let (_tmp, reg) = registry();
        let (tx, mut rx) = mpsc::channel(32);
        // First incarnation dies; its replacement drains cleanly.
        let launcher = ScriptLauncher::new(&["exit 1", "exit 0"]);
        reg.ensure().await.unwrap();

        actor(launcher, reg, tx).run(CancellationToken::new()).await;

        let mut downs = Vec::new();
        let mut ups = 0;
        while let Some(msg) = rx.recv().await {
            match msg {
                CoreMsg::Up { .. } => ups += 1,
                CoreMsg::Down { clean, .. } => downs.push(clean),
                CoreMsg::Inbound { .. } => {}
            }
        }
        assert_eq!(ups, 2);
        assert_eq!(downs, vec![false, true]);
    }

    #[tokio::test]
    async fn draining_pool_launches_nothing() {
        let (_tmp, reg) = registry();
        let (tx, mut rx) = mpsc::channel(32);
        let launcher = ScriptLauncher::new(&["exit 1"]);
        reg.ensure().await.unwrap();

        let a = actor(launcher, reg, tx);
        a.draining.store(true, Ordering::SeqCst);
        a.run(CancellationToken::new()).await;

        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn kill_during_shutdown_is_not_replaced() {
        let (_tmp, reg) = registry();
        let (tx, mut rx) = mpsc::channel(32);
        // A second script is queued so a (wrong) replacement would be
        // observable as a second Up.
        let launcher = ScriptLauncher::new(&["sleep 30", "exit 0"]);
        reg.ensure().await.unwrap();

        let a = actor(launcher, reg, tx);
        let draining = Arc::clone(&a.draining);
        let running = tokio::spawn(a.run(CancellationToken::new()));

        let CoreMsg::Up { pid, .. } = rx.recv().await.unwrap() else {
            panic!("expected Up");
        };

        // Shutdown decided, then the sweep kills the child abruptly.
        draining.store(true, Ordering::SeqCst);
        nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGKILL,
        )
        .unwrap();

        let CoreMsg::Down { clean, .. } = rx.recv().await.unwrap() else {
            panic!("expected Down");
        };
        assert!(!clean);
        // The slot retires instead of forking a replacement.
        assert!(rx.recv().await.is_none());
        running.await.unwrap();
    }

    #[tokio::test]
    async fn stdout_lines_are_forwarded_to_the_core() {
        let (_tmp, reg) = registry();
        let (tx, mut rx) = mpsc::channel(32);
        let launcher =
            ScriptLauncher::new(&[r#"printf '%s\n' '{"type":"counter","name":"listening"}'"#]);
        reg.ensure().await.unwrap();

        actor(launcher, reg, tx).run(CancellationToken::new()).await;

        let mut saw_counter = false;
        while let Some(msg) = rx.recv().await {
            if let CoreMsg::Inbound { message, .. } = msg {
                assert_eq!(
                    message,
                    ControlMessage::Counter {
                        name: "listening".into()
                    }
                );
                saw_counter = true;
            }
        }
        assert!(saw_counter);
    }
}
