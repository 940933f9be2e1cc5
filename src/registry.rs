//! # Durable process registry (PID files).
//!
//! One file per live process under the pids directory, named by role and
//! PID (`master.<pid>.pid`, `worker.<pid>.pid`), containing the PID as
//! text. File existence is the durable source of truth for "is this
//! process part of the cluster": the kill-all routine reads the directory
//! to signal processes even across restarts of the supervisor itself.
//!
//! The registry is deliberately a small storage interface
//! ([`ProcessRegistry`]) so the mechanism is swappable without touching
//! supervisor logic. [`PidFileRegistry`] is the filesystem implementation.
//!
//! ## Rules
//! - Only the master writes entries; each process deletes only entries it
//!   owns (the master deletes worker entries on confirmed exit).
//! - Reads tolerate junk: files that do not parse are skipped by `list`.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

/// Role of a registered process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// The supervisor process owning the pool.
    Master,
    /// A forked serving process.
    Worker,
}

impl Role {
    /// Stable file-name prefix for this role.
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::Worker => "worker",
        }
    }
}

/// One registry entry: a role plus the registered PID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PidEntry {
    /// The process role.
    pub role: Role,
    /// The registered OS process id.
    pub pid: u32,
}

/// Storage interface for the durable process registry.
#[async_trait]
pub trait ProcessRegistry: Send + Sync + 'static {
    /// Ensures the underlying storage exists (idempotent).
    async fn ensure(&self) -> io::Result<()>;

    /// Registers a process.
    async fn write(&self, entry: PidEntry) -> io::Result<()>;

    /// Reads back the stored PID for an entry.
    async fn read(&self, entry: PidEntry) -> io::Result<u32>;

    /// Removes an entry. Removing a missing entry is not an error.
    async fn delete(&self, entry: PidEntry) -> io::Result<()>;

    /// Lists all registered processes. Unparseable entries are skipped.
    async fn list(&self) -> io::Result<Vec<PidEntry>>;
}

/// Filesystem-backed registry: one `<role>.<pid>.pid` file per process.
pub struct PidFileRegistry {
    dir: PathBuf,
}

impl PidFileRegistry {
    /// Creates a registry rooted at `dir` (not yet created on disk; see
    /// [`ProcessRegistry::ensure`]).
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The directory this registry stores files in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, entry: PidEntry) -> PathBuf {
        self.dir
            .join(format!("{}.{}.pid", entry.role.as_str(), entry.pid))
    }

    fn parse_name(name: &str) -> Option<PidEntry> {
        let mut parts = name.split('.');
        let role = match parts.next()? {
            "master" => Role::Master,
            "worker" => Role::Worker,
            _ => return None,
        };
        let pid: u32 = parts.next()?.parse().ok()?;
        match (parts.next(), parts.next()) {
            (Some("pid"), None) => Some(PidEntry { role, pid }),
            _ => None,
        }
    }
}

#[async_trait]
impl ProcessRegistry for PidFileRegistry {
    async fn ensure(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await
    }

    async fn write(&self, entry: PidEntry) -> io::Result<()> {
        tokio::fs::write(self.path_for(entry), entry.pid.to_string()).await
    }

    async fn read(&self, entry: PidEntry) -> io::Result<u32> {
        let text = tokio::fs::read_to_string(self.path_for(entry)).await?;
        text.trim()
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    async fn delete(&self, entry: PidEntry) -> io::Result<()> {
        match tokio::fs::remove_file(self.path_for(entry)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn list(&self) -> io::Result<Vec<PidEntry>> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(item) = dir.next_entry().await? {
            if let Some(name) = item.file_name().to_str() {
                if let Some(entry) = Self::parse_name(name) {
                    entries.push(entry);
                }
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (tempfile::TempDir, PidFileRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let reg = PidFileRegistry::new(dir.path());
        (dir, reg)
    }

    #[tokio::test]
    async fn write_read_delete_round_trip() {
        let (_tmp, reg) = registry();
        reg.ensure().await.unwrap();
        let entry = PidEntry {
            role: Role::Worker,
            pid: 4242,
        };
        reg.write(entry).await.unwrap();
        assert_eq!(reg.read(entry).await.unwrap(), 4242);
        reg.delete(entry).await.unwrap();
        assert!(reg.read(entry).await.is_err());
    }

    #[tokio::test]
    async fn delete_missing_entry_is_ok() {
        let (_tmp, reg) = registry();
        reg.ensure().await.unwrap();
        let entry = PidEntry {
            role: Role::Worker,
            pid: 1,
        };
        assert!(reg.delete(entry).await.is_ok());
    }

    #[tokio::test]
    async fn list_skips_unparseable_files() {
        let (_tmp, reg) = registry();
        reg.ensure().await.unwrap();
        reg.write(PidEntry {
            role: Role::Master,
            pid: 10,
        })
        .await
        .unwrap();
        reg.write(PidEntry {
            role: Role::Worker,
            pid: 20,
        })
        .await
        .unwrap();
        tokio::fs::write(reg.dir().join("garbage.txt"), "zz")
            .await
            .unwrap();

        let mut listed = reg.list().await.unwrap();
        listed.sort_by_key(|e| e.pid);
        assert_eq!(
            listed,
            vec![
                PidEntry {
                    role: Role::Master,
                    pid: 10
                },
                PidEntry {
                    role: Role::Worker,
                    pid: 20
                },
            ]
        );
    }

    #[test]
    fn parse_name_rejects_trailing_parts() {
        assert!(PidFileRegistry::parse_name("worker.12.pid.bak").is_none());
        assert!(PidFileRegistry::parse_name("worker.x.pid").is_none());
        assert_eq!(
            PidFileRegistry::parse_name("master.99.pid"),
            Some(PidEntry {
                role: Role::Master,
                pid: 99
            })
        );
    }
}
