//! # Supervisor builder.
//!
//! Assembles a [`Supervisor`] from a configuration plus optional parts:
//! event subscribers, a custom [`Launcher`] (tests substitute stub
//! processes), and a custom [`ProcessRegistry`].
//!
//! ```no_run
//! use clustervisor::{ClusterConfig, Supervisor};
//!
//! let supervisor = Supervisor::builder(ClusterConfig {
//!     ports: vec![8080],
//!     workers: 4,
//!     ..ClusterConfig::default()
//! })
//! .build();
//! ```

use std::sync::Arc;

use crate::config::ClusterConfig;
use crate::registry::{PidFileRegistry, ProcessRegistry};
use crate::subscribers::Subscribe;

use super::core::Supervisor;
use super::launcher::{ExecLauncher, Launcher};

/// Builder for [`Supervisor`].
pub struct SupervisorBuilder {
    cfg: ClusterConfig,
    subscribers: Vec<Arc<dyn Subscribe>>,
    registry: Option<Arc<dyn ProcessRegistry>>,
    launcher: Option<Arc<dyn Launcher>>,
}

impl SupervisorBuilder {
    /// Starts a builder for `cfg`.
    pub fn new(cfg: ClusterConfig) -> Self {
        Self {
            cfg,
            subscribers: Vec::new(),
            registry: None,
            launcher: None,
        }
    }

    /// Adds an event subscriber.
    #[must_use]
    pub fn with_subscriber(mut self, subscriber: Arc<dyn Subscribe>) -> Self {
        self.subscribers.push(subscriber);
        self
    }

    /// Substitutes the PID registry (default: files under
    /// `cfg.pids_dir`).
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<dyn ProcessRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Substitutes the worker launcher (default: re-exec of the current
    /// binary).
    #[must_use]
    pub fn with_launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Builds the supervisor.
    #[must_use]
    pub fn build(self) -> Supervisor {
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(PidFileRegistry::new(&self.cfg.pids_dir)));
        let launcher = self.launcher.unwrap_or_else(|| Arc::new(ExecLauncher));
        Supervisor::assemble(self.cfg, self.subscribers, registry, launcher)
    }
}
