//! # clustervisor
//!
//! **Clustervisor** is a process-cluster supervisor for socket servers:
//! one master process owns a pool of worker processes that all accept on
//! the same ports (`SO_REUSEPORT`), with death detection and replacement,
//! connection draining, recycling, heartbeat aggregation, a control
//! protocol with a delegate pattern, and an ECV health-check endpoint for
//! external traffic managers.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!                      ┌─────────────────────────────────────────────┐
//!                      │  Master (Supervisor)                        │
//!                      │  - core loop (owns ClusterStats)            │
//!                      │  - Bus (broadcast events)                   │
//!                      │  - SubscriberSet (fans out to subscribers)  │
//!                      │  - DelegateBroker (correlation + routing)   │
//!                      │  - HeartbeatAggregator                      │
//!                      │  - monitor endpoint (stats JSON)            │
//!                      │  - PID registry (master.<pid>.pid, ...)     │
//!                      └──────┬──────────────┬──────────────┬────────┘
//!                             ▼              ▼              ▼
//!                      ┌────────────┐ ┌────────────┐ ┌────────────┐
//!                      │WorkerActor │ │WorkerActor │ │WorkerActor │
//!                      │ (slot 1)   │ │ (slot 2)   │ │ (slot N)   │
//!                      └─────┬──────┘ └─────┬──────┘ └─────┬──────┘
//!                       stdio│JSON      stdio│JSON     stdio│JSON
//!                             ▼              ▼              ▼
//!                      ┌────────────┐ ┌────────────┐ ┌────────────┐
//!                      │  worker 1  │ │  worker 2  │ │  worker N  │
//!                      │ - accept   │ │            │ │            │
//!                      │ - drain    │ │  (same)    │ │  (same)    │
//!                      │ - recycle  │ │            │ │            │
//!                      │ - ECV      │ │            │ │            │
//!                      └─────┬──────┘ └─────┬──────┘ └─────┬──────┘
//!                            └──────────────┼──────────────┘
//!                                           ▼
//!                         app ports + ECV port (SO_REUSEPORT,
//!                         kernel picks the accepting worker)
//! ```
//!
//! ### Worker lifecycle
//! ```text
//! actor.launch() ──► write worker.<pid>.pid ──► WorkerForked
//!
//! worker: bind ports ──► Counter{"listening"} ──► Listening
//!   │                     (first heartbeat) ──► Accepting
//!   │
//!   ├─ Command::Drain / SIGTERM ─► stop accepting, wait in-flight,
//!   │                              exit 0 ─► WorkerExited (slot retires)
//!   ├─ total > conn_threshold ───► RecycleTriggered, drain,
//!   │                              exit 1 ─► WorkerDied ─► replacement
//!   └─ crash / abnormal exit ────► WorkerDied ─► replacement fork
//! ```
//!
//! ## Features
//! | Area            | Description                                             | Key types / traits                        |
//! |-----------------|---------------------------------------------------------|-------------------------------------------|
//! | **Supervision** | Pool orchestration, death replacement, shutdown.        | [`Supervisor`], [`SupervisorBuilder`]     |
//! | **Serving**     | Application seam: one handler per accepted connection.  | [`ConnectionHandler`], [`HandlerFn`]      |
//! | **Control**     | Stdio JSON protocol, counters, commands, delegates.     | [`ControlHandle`], [`DelegateRequest`]    |
//! | **Health**      | ECV probe endpoint with pluggable validation.           | [`Validator`], [`EcvConfig`]              |
//! | **Events**      | Bus + subscriber fan-out for the whole lifecycle.       | [`Subscribe`], [`Event`], [`EventKind`]   |
//! | **Errors**      | Typed errors for master and worker failures.            | [`ClusterError`], [`WorkerError`]         |
//!
//! ## Optional features
//! - `logging`: exports a simple built-in [`LogWriter`] _(demo/reference only)_.
//!
//! ## Example
//! ```no_run
//! use std::sync::Arc;
//! use clustervisor::{ClusterConfig, HandlerFn, Supervisor};
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cfg = ClusterConfig {
//!         ports: vec![8080],
//!         workers: 4,
//!         ..ClusterConfig::default()
//!     };
//!
//!     // The same binary runs as master and as workers: run() detects
//!     // the role from the spawning environment.
//!     let supervisor = Supervisor::builder(cfg).build();
//!
//!     let echo = HandlerFn::new(|mut stream, _ctl, _shutdown| async move {
//!         let mut buf = [0u8; 1024];
//!         loop {
//!             let n = stream.read(&mut buf).await?;
//!             if n == 0 {
//!                 return Ok(());
//!             }
//!             stream.write_all(&buf[..n]).await?;
//!         }
//!     });
//!
//!     supervisor.run(echo).await?;
//!     Ok(())
//! }
//! ```

mod config;
mod ecv;
mod error;
mod events;
mod protocol;
mod registry;
mod subscribers;
mod supervisor;
mod worker;

// ---- Public re-exports ----

pub use config::{ClusterConfig, EcvConfig};
pub use ecv::{TcpProbe, Validator};
pub use error::{ClusterError, WorkerError};
pub use events::{Bus, Event, EventKind};
pub use protocol::{
    ClusterHeartbeat, Command, ControlMessage, DelegateHub, DelegateRequest, HeartbeatSample,
};
pub use registry::{PidEntry, PidFileRegistry, ProcessRegistry, Role};
pub use subscribers::{Subscribe, SubscriberSet};
pub use supervisor::{
    ClusterStats, ExecLauncher, Launcher, SpawnedWorker, Supervisor, SupervisorBuilder,
    WorkerRecord, WorkerState,
};
pub use worker::{
    Connection, ConnectionHandler, ControlHandle, DrainState, HandlerFn, WorkerRuntime,
};

// Optional: expose a simple built-in logger subscriber (demo/reference).
// Enable with: `--features logging`
#[cfg(feature = "logging")]
pub use subscribers::LogWriter;
