//! # Connection handler contract.
//!
//! [`ConnectionHandler`] is the seam between the worker runtime and the
//! application: the runtime owns listening, acceptance, draining and
//! timeouts; the handler owns every byte on the socket. The runtime never
//! inspects traffic.
//!
//! [`ControlHandle`] is the application's narrow window into the cluster:
//! named counters (surfaced on the master's monitor endpoint) and delegate
//! requests on the control channel.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::protocol::{Command, ControlMessage, DelegateRequest};

use super::drain::Connection;

/// Cloneable handle for application code to talk to the cluster.
///
/// All sends are best-effort: once the worker is past the point of
/// forwarding (shutdown), they become no-ops rather than errors.
#[derive(Clone)]
pub struct ControlHandle {
    pid: u32,
    tx: mpsc::Sender<ControlMessage>,
}

impl ControlHandle {
    /// Creates a handle for worker `pid` sending through `tx`.
    pub fn new(pid: u32, tx: mpsc::Sender<ControlMessage>) -> Self {
        Self { pid, tx }
    }

    /// PID of the worker this handle belongs to.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Bumps a named counter on this worker's master-side record.
    pub async fn counter(&self, name: impl Into<String>) {
        self.send(ControlMessage::Counter { name: name.into() }).await;
    }

    /// Requests a cluster-wide command broadcast.
    pub async fn command(&self, command: Command) {
        self.send(ControlMessage::Command { command }).await;
    }

    /// Sends a delegate request to the master.
    pub async fn delegate(&self, request: DelegateRequest) {
        self.send(ControlMessage::Delegate(request)).await;
    }

    pub(crate) async fn send(&self, msg: ControlMessage) {
        let _ = self.tx.send(msg).await;
    }
}

/// Application-side handler for one accepted connection.
///
/// Dropped mid-flight when the connection sits idle past the configured
/// timeout (reads and writes on the stream rearm it); `shutdown` cancels
/// when the worker wants in-flight work to wind down early.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Serves one connection to completion.
    async fn handle(
        &self,
        stream: Connection,
        ctl: ControlHandle,
        shutdown: CancellationToken,
    ) -> std::io::Result<()>;
}

/// Function-backed [`ConnectionHandler`] for closures.
pub struct HandlerFn<F> {
    f: F,
}

impl<F, Fut> HandlerFn<F>
where
    F: Fn(Connection, ControlHandle, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::io::Result<()>> + Send + 'static,
{
    /// Wraps `f` as a shareable handler.
    pub fn new(f: F) -> Arc<Self> {
        Arc::new(Self { f })
    }
}

#[async_trait]
impl<F, Fut> ConnectionHandler for HandlerFn<F>
where
    F: Fn(Connection, ControlHandle, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::io::Result<()>> + Send + 'static,
{
    async fn handle(
        &self,
        stream: Connection,
        ctl: ControlHandle,
        shutdown: CancellationToken,
    ) -> std::io::Result<()> {
        (self.f)(stream, ctl, shutdown).await
    }
}
