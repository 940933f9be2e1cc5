//! # Worker process launcher.
//!
//! Workers are not threads: they are full OS processes created by
//! re-executing the current binary with a role marker and the serialized
//! [`ClusterConfig`] in the environment. The re-executed process calls the
//! same `Supervisor::run` entry point, detects the worker role, and runs
//! the worker runtime instead of the master.
//!
//! [`Launcher`] is the seam between the pool logic and process creation,
//! so actor and core-loop tests can substitute stub processes.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use crate::config::ClusterConfig;
use crate::error::ClusterError;

/// Environment variable carrying the process role (`"worker"`).
pub const ROLE_ENV: &str = "CLUSTERVISOR_ROLE";

/// Environment variable carrying the JSON-encoded [`ClusterConfig`].
pub const CONFIG_ENV: &str = "CLUSTERVISOR_CONFIG";

/// True when the current process was launched as a worker.
pub fn is_worker_process() -> bool {
    std::env::var(ROLE_ENV).as_deref() == Ok("worker")
}

/// A freshly launched worker process.
///
/// `child` still owns its piped stdin/stdout; the worker actor takes them
/// to build the control channel.
pub struct SpawnedWorker {
    /// OS process id of the child.
    pub pid: u32,
    /// The child handle (stdin/stdout piped, stderr inherited).
    pub child: Child,
}

/// Creates worker processes.
#[async_trait]
pub trait Launcher: Send + Sync + 'static {
    /// Launches one worker for `cfg`.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Spawn`] when the process cannot be created.
    async fn launch(&self, cfg: &ClusterConfig) -> Result<SpawnedWorker, ClusterError>;
}

/// Production launcher: re-executes the current binary as a worker.
pub struct ExecLauncher;

#[async_trait]
impl Launcher for ExecLauncher {
    async fn launch(&self, cfg: &ClusterConfig) -> Result<SpawnedWorker, ClusterError> {
        let exe = std::env::current_exe().map_err(|e| ClusterError::Spawn {
            reason: format!("cannot resolve current executable: {e}"),
        })?;
        let encoded = serde_json::to_string(cfg).map_err(|e| ClusterError::Spawn {
            reason: format!("cannot encode config: {e}"),
        })?;

        let child = Command::new(exe)
            .env(ROLE_ENV, "worker")
            .env(CONFIG_ENV, encoded)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| ClusterError::Spawn {
                reason: e.to_string(),
            })?;

        let pid = child.id().ok_or_else(|| ClusterError::Spawn {
            reason: "child exited before its pid was observed".to_string(),
        })?;
        Ok(SpawnedWorker { pid, child })
    }
}
