//! Test doubles for pool tests: shell scripts standing in for workers.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::ClusterConfig;
use crate::error::ClusterError;

use super::launcher::{Launcher, SpawnedWorker};

/// Launcher replaying a fixed sequence of shell scripts as "workers".
pub(crate) struct ScriptLauncher {
    scripts: Mutex<VecDeque<&'static str>>,
}

impl ScriptLauncher {
    pub(crate) fn new(scripts: &[&'static str]) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.iter().copied().collect()),
        })
    }
}

#[async_trait]
impl Launcher for ScriptLauncher {
    async fn launch(&self, _cfg: &ClusterConfig) -> Result<SpawnedWorker, ClusterError> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .expect("launcher exhausted");
        let child = Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| ClusterError::Spawn {
                reason: e.to_string(),
            })?;
        let pid = child.id().unwrap();
        Ok(SpawnedWorker { pid, child })
    }
}
