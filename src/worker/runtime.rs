//! # Worker runtime.
//!
//! Entry point of a worker process. The master re-executed this binary
//! with the serialized configuration in the environment; the runtime
//! decodes it, binds the shared listeners, reports readiness, and then
//! multiplexes until something decides how the process ends:
//!
//! - `drain` command or SIGTERM → graceful drain, exit 0 (no replacement)
//! - recycle threshold crossed → graceful drain, exit 1 (replaced)
//! - SIGINT → immediate exit
//! - control channel EOF → error exit (the master is gone)
//!
//! The exit code is the whole interface back to the master: 0 means
//! planned retirement, anything else asks for a replacement.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::ClusterConfig;
use crate::ecv::{EcvState, TcpProbe, Validator};
use crate::error::WorkerError;
use crate::events::{Bus, Event, EventKind};
use crate::protocol::{
    Command, ControlMessage, ControlReceiver, ControlSender, HeartbeatSample,
};
use crate::subscribers::{forward, SubscriberSet};
use crate::supervisor::CONFIG_ENV;

use super::drain::{bind_shared, serve_listener, wait_drained, DrainState};
use super::handler::{ConnectionHandler, ControlHandle};

/// How one worker process ends.
enum ExitPlan {
    /// Drain first, then exit with `code`.
    Graceful { code: i32, reason: &'static str },
    /// Exit now.
    Immediate { code: i32 },
}

/// The runtime driving one worker process.
pub struct WorkerRuntime {
    cfg: ClusterConfig,
    handler: Arc<dyn ConnectionHandler>,
    bus: Bus,
    subscribers: Arc<SubscriberSet>,
    validator: Option<Arc<dyn Validator>>,
}

impl WorkerRuntime {
    /// Creates a runtime from an explicit configuration.
    pub fn new(
        cfg: ClusterConfig,
        handler: Arc<dyn ConnectionHandler>,
        bus: Bus,
        subscribers: Arc<SubscriberSet>,
    ) -> Self {
        Self {
            cfg,
            handler,
            bus,
            subscribers,
            validator: None,
        }
    }

    /// Creates a runtime from the environment the master spawned us with.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Bootstrap`] when the configuration variable
    /// is missing or does not decode.
    pub fn from_env(
        handler: Arc<dyn ConnectionHandler>,
        bus: Bus,
        subscribers: Arc<SubscriberSet>,
    ) -> Result<Self, WorkerError> {
        let raw = std::env::var(CONFIG_ENV).map_err(|_| WorkerError::Bootstrap {
            reason: format!("{CONFIG_ENV} is not set"),
        })?;
        let cfg: ClusterConfig =
            serde_json::from_str(&raw).map_err(|e| WorkerError::Bootstrap {
                reason: format!("cannot decode {CONFIG_ENV}: {e}"),
            })?;
        Ok(Self::new(cfg, handler, bus, subscribers))
    }

    /// Substitutes the ECV validator (default: a loopback TCP probe of
    /// the first application port).
    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Runs the worker to completion and returns its exit code.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError`] when a listener cannot be bound, the
    /// control channel closes unexpectedly, or signal handlers cannot be
    /// registered.
    pub async fn run(self) -> Result<i32, WorkerError> {
        let pid = std::process::id();
        let started = Instant::now();
        forward(&self.bus, Arc::clone(&self.subscribers));

        let state = DrainState::new();
        let (ctl_tx, mut ctl_rx) = mpsc::channel::<ControlMessage>(64);
        let ctl = ControlHandle::new(pid, ctl_tx);

        // stdout leg: everything the worker tells the master.
        tokio::spawn(async move {
            let mut sender = ControlSender::new(tokio::io::stdout());
            while let Some(msg) = ctl_rx.recv().await {
                if sender.send(&msg).await.is_err() {
                    break;
                }
            }
        });

        let accept_token = CancellationToken::new();
        let conn_token = CancellationToken::new();
        for port in &self.cfg.ports {
            let addr = self.listen_addr(*port)?;
            let listener = bind_shared(addr).map_err(|e| WorkerError::Bind {
                addr: addr.to_string(),
                source: e,
            })?;
            tokio::spawn(serve_listener(
                listener,
                Arc::clone(&self.handler),
                ctl.clone(),
                Arc::clone(&state),
                self.cfg.idle_timeout_opt(),
                self.bus.clone(),
                accept_token.child_token(),
                conn_token.clone(),
            ));
        }

        if let Some(ecv_cfg) = self.cfg.ecv.clone() {
            let addr = self.listen_addr(ecv_cfg.port)?;
            let listener = bind_shared(addr).map_err(|e| WorkerError::Bind {
                addr: addr.to_string(),
                source: e,
            })?;
            let first_port =
                *self
                    .cfg
                    .ports
                    .first()
                    .ok_or_else(|| WorkerError::Bootstrap {
                        reason: "no application ports configured".to_string(),
                    })?;
            let validator = self
                .validator
                .clone()
                .unwrap_or_else(|| Arc::new(TcpProbe::new(first_port)));
            let ecv_state = EcvState::new(
                ecv_cfg,
                Arc::clone(&state),
                first_port,
                validator,
                ctl.clone(),
                self.bus.clone(),
            );
            let stop = conn_token.clone();
            tokio::spawn(async move {
                let _ = axum::serve(listener, crate::ecv::router(ecv_state))
                    .with_graceful_shutdown(stop.cancelled_owned())
                    .await;
            });
        }

        // Everything is bound: tell the master we are accepting.
        ctl.counter("listening").await;

        // heartbeat emission
        {
            let ctl = ctl.clone();
            let state = Arc::clone(&state);
            let every = self.cfg.heartbeat_interval;
            tokio::spawn(async move {
                let mut sys = sysinfo::System::new();
                let mut ticker = tokio::time::interval(every);
                ticker.tick().await; // the first tick is immediate
                loop {
                    ticker.tick().await;
                    sys.refresh_memory();
                    ctl.send(ControlMessage::Heartbeat(HeartbeatSample {
                        pid,
                        uptime_secs: started.elapsed().as_secs(),
                        free_mem: sys.free_memory(),
                        total_connections: state.total(),
                        pending_connections: state.live(),
                        timedout_connections: state.timedout(),
                    }))
                    .await;
                }
            });
        }

        let mut inbound = ControlReceiver::new(tokio::io::stdin());
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut recycle = tokio::time::interval(self.cfg.recycle_poll);

        let plan = loop {
            tokio::select! {
                msg = inbound.recv() => match msg {
                    Some(ControlMessage::Command { command }) => match command {
                        Command::Drain => break ExitPlan::Graceful { code: 0, reason: "drain" },
                        Command::Disable => {
                            if !state.set_disabled(true) {
                                self.bus.publish(
                                    Event::new(EventKind::WorkerDisabled).with_pid(pid),
                                );
                            }
                        }
                        Command::Enable => {
                            if state.set_disabled(false) {
                                self.bus.publish(
                                    Event::new(EventKind::WorkerEnabled).with_pid(pid),
                                );
                            }
                        }
                    },
                    Some(ControlMessage::Notify { topic, body, error }) => {
                        let mut ev = Event::new(EventKind::DelegateNotified)
                            .with_pid(pid)
                            .with_topic(topic)
                            .with_payload(body);
                        if let Some(error) = error {
                            ev = ev.with_reason(error);
                        }
                        self.bus.publish(ev);
                    }
                    // The master never sends the worker→master variants.
                    Some(_) => {}
                    None => return Err(WorkerError::ChannelClosed),
                },
                _ = sigterm.recv() => break ExitPlan::Graceful { code: 0, reason: "drain" },
                _ = sigint.recv() => break ExitPlan::Immediate { code: 0 },
                _ = recycle.tick() => {
                    if let Some(limit) = self.cfg.conn_threshold_opt() {
                        let total = state.total();
                        if total > limit {
                            self.bus.publish(
                                Event::new(EventKind::RecycleTriggered)
                                    .with_pid(pid)
                                    .with_count(total),
                            );
                            break ExitPlan::Graceful { code: 1, reason: "recycle" };
                        }
                    }
                }
            }
        };

        match plan {
            ExitPlan::Immediate { code } => Ok(code),
            ExitPlan::Graceful { code, reason } => {
                accept_token.cancel();
                self.bus.publish(
                    Event::new(EventKind::DrainStarted)
                        .with_pid(pid)
                        .with_reason(reason),
                );
                wait_drained(&state, self.cfg.drain_poll).await;
                conn_token.cancel();
                // Give the fan-out a beat to flush queued events.
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(code)
            }
        }
    }

    fn listen_addr(&self, port: u16) -> Result<SocketAddr, WorkerError> {
        format!("{}:{port}", self.cfg.host)
            .parse()
            .map_err(|e| WorkerError::Bootstrap {
                reason: format!("invalid listen host {:?}: {e}", self.cfg.host),
            })
    }
}
