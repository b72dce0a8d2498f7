//! Error taxonomy shared across the virtkeep workspace.
//!
//! Every external call's status is checked explicitly and no error is
//! swallowed; the only local recovery anywhere is the crash-recovery commit
//! in the snapshot coordinator.

use std::io;
use thiserror::Error;

pub type BackupResult<T> = Result<T, BackupError>;

#[derive(Debug, Error)]
pub enum BackupError {
    /// Another orchestrator instance holds the run lock on this host.
    #[error("another backup run is already active (pid {pid})")]
    AlreadyRunning { pid: u32 },

    /// Enumeration of domains or devices failed; the whole run aborts.
    #[error("inventory query failed: {0}")]
    Inventory(String),

    #[error("snapshot creation failed: {0}")]
    SnapshotCreate(String),

    #[error("export to archive failed: {0}")]
    Export(String),

    #[error("retention prune failed: {0}")]
    Prune(String),

    /// The most severe failure: the live domain may now reference a broken
    /// disk chain. Never retried automatically.
    #[error("snapshot commit failed: {0}")]
    Commit(String),

    /// Crash recovery could not locate the expected base image. Requires
    /// operator intervention; the coordinator never guesses an image name.
    #[error("disk chain is corrupt: {0}")]
    CorruptChain(String),

    /// A system provider's external tool invocation failed.
    #[error("{0}")]
    Provider(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("failed to parse TOML configuration: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("failed to render TOML configuration: {0}")]
    TomlRender(#[from] toml::ser::Error),

    #[error("failed to parse YAML configuration: {0}")]
    YamlParse(#[from] serde_yaml::Error),
}
