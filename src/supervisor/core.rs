//! # Supervisor core.
//!
//! [`Supervisor`] is the single entry point for both roles: `run` detects
//! from the environment whether this process is the master or a spawned
//! worker and drives the matching runtime.
//!
//! The master side is built around one core loop that owns every mutation
//! of [`ClusterStats`]. Worker actors, the delegate broker, the
//! aggregation ticker and the signal waiters all feed it through
//! channels, so pool state changes in one serialized stream: a death is
//! always recorded before its replacement appears.
//!
//! ```text
//!                    ┌────────────────────────────┐
//!  actor slot 1 ──┐  │         core loop          │──► Bus ──► subscribers
//!  actor slot 2 ──┼─►│  Up / Inbound / Down       │
//!  actor slot N ──┘  │  aggregation tick          │──► stats ──► monitor
//!  delegate broker ─►│  outbound routing          │
//!  signal waiters ──►│  interrupt / terminate     │──► worker stdin legs
//!                    └────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::ClusterConfig;
use crate::error::ClusterError;
use crate::events::{Bus, Event, EventKind};
use crate::protocol::{Command, ControlMessage, DelegateBroker, DelegateHub, Outbound};
use crate::registry::{PidEntry, PidFileRegistry, ProcessRegistry, Role};
use crate::subscribers::{forward, Subscribe, SubscriberSet};
use crate::worker::{ConnectionHandler, WorkerRuntime};

use super::actor::{CoreMsg, WorkerActor};
use super::heartbeat::HeartbeatAggregator;
use super::launcher::{is_worker_process, Launcher};
use super::monitor;
use super::shutdown::{kill_all, ShutdownListener, ShutdownSignal};
use super::stats::ClusterStats;

/// A process-cluster supervisor.
///
/// Construct through [`Supervisor::builder`], then call
/// [`run`](Supervisor::run) from `main`. In the master process `run`
/// orchestrates the pool; in a spawned worker it never returns (the
/// process exits with the worker's exit code).
pub struct Supervisor {
    cfg: ClusterConfig,
    bus: Bus,
    subscribers: Arc<SubscriberSet>,
    registry: Arc<dyn ProcessRegistry>,
    launcher: Arc<dyn Launcher>,
    broker: Arc<DelegateBroker>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Outbound>>>,
    token: CancellationToken,
}

impl Supervisor {
    /// Starts building a supervisor for `cfg`.
    pub fn builder(cfg: ClusterConfig) -> super::builder::SupervisorBuilder {
        super::builder::SupervisorBuilder::new(cfg)
    }

    pub(crate) fn assemble(
        cfg: ClusterConfig,
        subscribers: Vec<Arc<dyn Subscribe>>,
        registry: Arc<dyn ProcessRegistry>,
        launcher: Arc<dyn Launcher>,
    ) -> Self {
        let bus = Bus::new(cfg.bus_capacity_clamped());
        let subscribers = Arc::new(SubscriberSet::new(subscribers));
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let broker = DelegateBroker::new(bus.clone(), out_tx);
        Self {
            cfg,
            bus,
            subscribers,
            registry,
            launcher,
            broker,
            outbound_rx: Mutex::new(Some(out_rx)),
            token: CancellationToken::new(),
        }
    }

    /// The event bus of this process.
    pub fn bus(&self) -> Bus {
        self.bus.clone()
    }

    /// A handle for responding to delegate topics (master side).
    pub fn hub(&self) -> DelegateHub {
        DelegateHub::new(Arc::clone(&self.broker))
    }

    /// The configuration this supervisor runs with.
    pub fn config(&self) -> &ClusterConfig {
        &self.cfg
    }

    /// Runs the cluster.
    ///
    /// In a worker process this function does not return: the worker
    /// runtime runs to completion and the process exits with its code
    /// (0 after a planned drain, non-zero otherwise).
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] for master-side startup failures (invalid
    /// configuration, monitor port taken, registry not writable) and for
    /// an exceeded shutdown grace.
    pub async fn run(&self, handler: Arc<dyn ConnectionHandler>) -> Result<(), ClusterError> {
        if is_worker_process() {
            let code = match WorkerRuntime::from_env(
                handler,
                self.bus.clone(),
                Arc::clone(&self.subscribers),
            ) {
                Ok(runtime) => match runtime.run().await {
                    Ok(code) => code,
                    Err(e) => {
                        eprintln!("[clustervisor] worker failed: {}", e.as_message());
                        1
                    }
                },
                Err(e) => {
                    eprintln!("[clustervisor] worker bootstrap failed: {}", e.as_message());
                    1
                }
            };
            std::process::exit(code);
        }
        self.run_master().await
    }

    /// Immediately terminates a running cluster registered under
    /// `cfg.pids_dir` (SIGKILL sweep; no draining).
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the registry cannot be listed.
    pub async fn stop(cfg: &ClusterConfig) -> std::io::Result<()> {
        let registry = PidFileRegistry::new(&cfg.pids_dir);
        kill_all(&registry, Signal::SIGKILL).await
    }

    /// Gracefully shuts down a running cluster registered under
    /// `cfg.pids_dir` (SIGTERM sweep; workers drain, the master waits for
    /// its pool).
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the registry cannot be listed.
    pub async fn shutdown(cfg: &ClusterConfig) -> std::io::Result<()> {
        let registry = PidFileRegistry::new(&cfg.pids_dir);
        kill_all(&registry, Signal::SIGTERM).await
    }

    async fn run_master(&self) -> Result<(), ClusterError> {
        self.cfg.validate()?;
        self.registry
            .ensure()
            .await
            .map_err(|e| ClusterError::Registry {
                path: self.cfg.pids_dir.clone(),
                source: e,
            })?;
        tokio::fs::create_dir_all(&self.cfg.logs_dir).await?;

        let master_pid = std::process::id();
        forward(&self.bus, Arc::clone(&self.subscribers));

        // The monitor port is bound exclusively; failure is fatal because
        // it means another supervisor already owns this cluster.
        let monitor_addr = format!("{}:{}", self.cfg.monitor_host, self.cfg.monitor_port);
        let monitor_listener = tokio::net::TcpListener::bind(&monitor_addr)
            .await
            .map_err(|e| ClusterError::Bind {
                addr: monitor_addr,
                source: e,
            })?;
        let stats = Arc::new(RwLock::new(ClusterStats::new(master_pid)));
        tokio::spawn(monitor::serve(
            monitor_listener,
            Arc::clone(&stats),
            self.token.child_token(),
        ));

        let master_entry = PidEntry {
            role: Role::Master,
            pid: master_pid,
        };
        self.registry
            .write(master_entry)
            .await
            .map_err(|e| ClusterError::Registry {
                path: self.cfg.pids_dir.clone(),
                source: e,
            })?;

        let mut outbound_rx = self
            .outbound_rx
            .lock()
            .expect("supervisor outbound lock poisoned")
            .take()
            .ok_or_else(|| ClusterError::Config {
                reason: "supervisor is already running".to_string(),
            })?;

        let (core_tx, mut core_rx) = mpsc::channel::<CoreMsg>(256);
        let draining = Arc::new(AtomicBool::new(false));
        for _ in 0..self.cfg.workers_resolved() {
            let actor = WorkerActor {
                cfg: self.cfg.clone(),
                launcher: Arc::clone(&self.launcher),
                registry: Arc::clone(&self.registry),
                bus: self.bus.clone(),
                core_tx: core_tx.clone(),
                draining: Arc::clone(&draining),
            };
            tokio::spawn(actor.run(self.token.child_token()));
        }
        // The core loop's end-of-pool signal is the channel closing once
        // every actor has retired its slot.
        drop(core_tx);

        let mut aggregator = HeartbeatAggregator::new(master_pid);
        let mut agg_ticker = tokio::time::interval(self.cfg.aggregation_interval);
        agg_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        agg_ticker.tick().await; // the first tick is immediate

        // Registered once: re-registering streams per poll could lose a
        // signal delivered in the gap.
        let mut signals = ShutdownListener::new()?;

        let mut senders: HashMap<u32, mpsc::Sender<ControlMessage>> = HashMap::new();
        let mut grace_deadline: Option<tokio::time::Instant> = None;
        let mut graced: Option<Vec<u32>> = None;

        loop {
            tokio::select! {
                msg = core_rx.recv() => {
                    let Some(msg) = msg else { break };
                    match msg {
                        CoreMsg::Up { pid, outbound } => {
                            senders.insert(pid, outbound);
                            stats.write().await.record_fork(pid, self.cfg.ports.clone());
                            if draining.load(Ordering::SeqCst) {
                                // Raced the drain decision: retire it too.
                                if let Some(tx) = senders.get(&pid) {
                                    let _ = tx
                                        .send(ControlMessage::Command { command: Command::Drain })
                                        .await;
                                }
                            }
                        }
                        CoreMsg::Inbound { pid, message } => {
                            self.handle_inbound(pid, message, &stats, &mut aggregator, &senders)
                                .await;
                        }
                        CoreMsg::Down { pid, clean } => {
                            senders.remove(&pid);
                            stats.write().await.record_exit(pid, clean);
                        }
                    }
                }
                out = outbound_rx.recv() => {
                    if let Some(out) = out {
                        deliver(&senders, out).await;
                    }
                }
                _ = agg_ticker.tick() => {
                    if let Some(hb) = aggregator.aggregate() {
                        self.bus.publish(
                            Event::new(EventKind::HeartbeatAggregated)
                                .with_pid(master_pid)
                                .with_heartbeat(hb),
                        );
                    }
                }
                sig = signals.recv() => {
                    match sig {
                        ShutdownSignal::Interrupt => {
                            // Actors must not replace children the sweep
                            // kills; a replacement forked mid-sweep would
                            // outlive the master with a stale pid file.
                            draining.store(true, Ordering::SeqCst);
                            self.bus.publish(
                                Event::new(EventKind::ShutdownRequested).with_reason("interrupt"),
                            );
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            kill_all(self.registry.as_ref(), Signal::SIGKILL).await?;
                            // kill_all exits at our own registry entry;
                            // reaching here means it was already gone.
                            break;
                        }
                        ShutdownSignal::Terminate => {
                            if !draining.swap(true, Ordering::SeqCst) {
                                self.bus.publish(
                                    Event::new(EventKind::ShutdownRequested)
                                        .with_reason("terminate"),
                                );
                                {
                                    let mut st = stats.write().await;
                                    let pids = st.worker_pids();
                                    for pid in pids {
                                        st.record_draining(pid);
                                    }
                                }
                                for tx in senders.values() {
                                    let _ = tx
                                        .send(ControlMessage::Command { command: Command::Drain })
                                        .await;
                                }
                                if self.cfg.grace > Duration::ZERO {
                                    grace_deadline =
                                        Some(tokio::time::Instant::now() + self.cfg.grace);
                                }
                            }
                        }
                    }
                }
                _ = deadline(grace_deadline), if grace_deadline.is_some() => {
                    let stuck = stats.read().await.worker_pids();
                    self.bus.publish(
                        Event::new(EventKind::GraceExceeded)
                            .with_reason(format!("{} workers force-killed", stuck.len())),
                    );
                    for pid in &stuck {
                        let _ = nix::sys::signal::kill(
                            Pid::from_raw(*pid as i32),
                            Signal::SIGKILL,
                        );
                    }
                    graced = Some(stuck);
                    grace_deadline = None;
                }
            }
        }

        self.bus.publish(Event::new(EventKind::AllWorkersExited));
        if let Err(e) = self.registry.delete(master_entry).await {
            eprintln!("[clustervisor] cannot delete master pid file: {e}");
        }
        self.token.cancel();
        // Give the subscriber fan-out a beat to flush queued events.
        tokio::time::sleep(Duration::from_millis(20)).await;

        match graced {
            Some(stuck) => Err(ClusterError::GraceExceeded {
                grace: self.cfg.grace,
                stuck,
            }),
            None => Ok(()),
        }
    }

    async fn handle_inbound(
        &self,
        pid: u32,
        message: ControlMessage,
        stats: &RwLock<ClusterStats>,
        aggregator: &mut HeartbeatAggregator,
        senders: &HashMap<u32, mpsc::Sender<ControlMessage>>,
    ) {
        match message {
            ControlMessage::Counter { name } => {
                let mut st = stats.write().await;
                st.bump_counter(pid, &name);
                if name == "listening" {
                    st.record_listening(pid);
                    drop(st);
                    self.bus
                        .publish(Event::new(EventKind::WorkerListening).with_pid(pid));
                }
            }
            ControlMessage::Heartbeat(sample) => {
                stats.write().await.apply_heartbeat(&sample);
                aggregator.push(sample);
            }
            ControlMessage::Command { command } => {
                match command {
                    Command::Disable => stats.write().await.set_disabled_all(true),
                    Command::Enable => stats.write().await.set_disabled_all(false),
                    Command::Drain => {
                        // A pool-wide drain is the master's decision.
                        eprintln!(
                            "[clustervisor] ignoring drain request from worker {pid}"
                        );
                        return;
                    }
                }
                for tx in senders.values() {
                    let _ = tx.send(ControlMessage::Command { command }).await;
                }
            }
            ControlMessage::Delegate(request) => self.broker.handle_request(pid, request),
            // Master → worker only; a worker echoing one back is noise.
            ControlMessage::Notify { .. } => {}
        }
    }
}

async fn deliver(senders: &HashMap<u32, mpsc::Sender<ControlMessage>>, out: Outbound) {
    match out.targets {
        Some(pids) => {
            for pid in pids {
                if let Some(tx) = senders.get(&pid) {
                    let _ = tx.send(out.message.clone()).await;
                }
            }
        }
        None => {
            for tx in senders.values() {
                let _ = tx.send(out.message.clone()).await;
            }
        }
    }
}

async fn deadline(at: Option<tokio::time::Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::testutil::ScriptLauncher;
    use crate::worker::HandlerFn;
    use nix::sys::signal::kill;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn noop_handler() -> Arc<dyn ConnectionHandler> {
        HandlerFn::new(|_stream, _ctl, _shutdown| async move { Ok(()) })
    }

    #[tokio::test]
    async fn terminate_drains_the_pool_and_cleans_the_registry() {
        let pids = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        let cfg = ClusterConfig {
            workers: 2,
            monitor_port: free_port(),
            monitor_host: "127.0.0.1".to_string(),
            pids_dir: pids.path().to_path_buf(),
            logs_dir: logs.path().to_path_buf(),
            ..ClusterConfig::default()
        };
        // "Workers" that block until the drain command line arrives on
        // stdin, then exit 0.
        let launcher = ScriptLauncher::new(&["read line", "read line"]);
        let sup = Arc::new(
            Supervisor::builder(cfg)
                .with_launcher(launcher)
                .build(),
        );
        let mut events = sup.bus().subscribe();

        let running = {
            let sup = Arc::clone(&sup);
            tokio::spawn(async move { sup.run(noop_handler()).await })
        };

        // Wait for both forks to register.
        let mut forked = 0;
        while forked < 2 {
            let ev = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            if ev.kind == EventKind::WorkerForked {
                forked += 1;
            }
        }

        kill(Pid::this(), Signal::SIGTERM).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());

        // Clean exits: nothing replaced, registry swept, events emitted.
        let mut kinds = Vec::new();
        while let Ok(ev) = events.try_recv() {
            kinds.push(ev.kind);
        }
        assert!(kinds.contains(&EventKind::ShutdownRequested));
        assert!(kinds.contains(&EventKind::AllWorkersExited));
        assert_eq!(
            kinds
                .iter()
                .filter(|k| **k == EventKind::WorkerExited)
                .count(),
            2
        );
        assert!(!kinds.contains(&EventKind::WorkerDied));
        assert!(sup.registry.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn monitor_port_collision_is_fatal() {
        let pids = tempfile::tempdir().unwrap();
        let port = free_port();
        let _taken = tokio::net::TcpListener::bind(("127.0.0.1", port))
            .await
            .unwrap();
        let cfg = ClusterConfig {
            workers: 1,
            monitor_port: port,
            monitor_host: "127.0.0.1".to_string(),
            pids_dir: pids.path().to_path_buf(),
            logs_dir: pids.path().join("logs"),
            ..ClusterConfig::default()
        };
        let sup = Supervisor::builder(cfg)
            .with_launcher(ScriptLauncher::new(&[]))
            .build();
        let err = sup.run(noop_handler()).await.unwrap_err();
        assert_eq!(err.as_label(), "cluster_bind_failed");
    }
}
