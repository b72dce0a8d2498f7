//! System-backed `PoolProvider` implementation wrapping the `rbd` CLI.

use crate::command::RbdCommand;
use crate::parse::{parse_image_list, parse_snapshot_list};
use log::debug;
use std::env;
use std::path::{Path, PathBuf};
use virtkeep_core::config::VirtkeepConfig;
use virtkeep_core::error::{BackupError, BackupResult};
use virtkeep_provider::pool::{ExportStream, PoolProvider};

pub const DEFAULT_RBD_PATHS: &[&str] = &["/usr/bin/rbd", "/bin/rbd", "/usr/local/bin/rbd"];

/// System provider that manages pool images via the host `rbd` binary.
#[derive(Debug, Clone)]
pub struct SystemPool {
    rbd: RbdCommand,
}

impl SystemPool {
    /// Build a provider from configuration, resolving the `rbd` path.
    ///
    /// An explicitly configured path must exist; otherwise the well-known
    /// locations are probed with `PATH` as the last resort. Hosts without
    /// RBD-backed guests never spawn the binary, so resolution stays soft.
    pub fn from_config(config: &VirtkeepConfig) -> BackupResult<Self> {
        let binary = resolve_rbd_path(config)?;
        Ok(Self {
            rbd: RbdCommand::new(binary, config.pool.id.clone()),
        })
    }
}

impl PoolProvider for SystemPool {
    type Error = BackupError;

    fn list_images(&self, pool: &str) -> BackupResult<Vec<String>> {
        Ok(parse_image_list(&self.rbd.ls(pool)?))
    }

    fn create_snapshot(&self, pool: &str, image: &str, name: &str) -> BackupResult<()> {
        self.rbd.snap_create(&format!("{pool}/{image}@{name}"))
    }

    fn list_snapshots(&self, pool: &str, image: &str) -> BackupResult<Vec<String>> {
        Ok(parse_snapshot_list(
            &self.rbd.snap_ls(&format!("{pool}/{image}"))?,
        ))
    }

    fn delete_snapshot(&self, pool: &str, image: &str, name: &str) -> BackupResult<()> {
        self.rbd.snap_rm(&format!("{pool}/{image}@{name}"))
    }

    fn export_snapshot(
        &self,
        pool: &str,
        image: &str,
        snapshot: &str,
    ) -> BackupResult<ExportStream> {
        self.rbd.export(&format!("{pool}/{image}@{snapshot}"))
    }
}

fn resolve_rbd_path(config: &VirtkeepConfig) -> BackupResult<PathBuf> {
    if let Some(path) = config
        .pool
        .rbd_path
        .as_deref()
        .map(str::trim)
        .filter(|path| !path.is_empty())
    {
        let candidate = Path::new(path);
        if !candidate.exists() {
            return Err(BackupError::InvalidConfig(format!(
                "rbd binary not found at {}",
                candidate.display()
            )));
        }
        return Ok(candidate.to_path_buf());
    }

    for candidate in DEFAULT_RBD_PATHS {
        let path = Path::new(candidate);
        if path.exists() {
            return Ok(path.to_path_buf());
        }
    }

    if let Some(found) = find_in_path("rbd") {
        return Ok(found);
    }

    debug!("rbd binary not found; deferring to PATH resolution at spawn time");
    Ok(PathBuf::from("rbd"))
}

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths).find_map(|dir| {
        let candidate = dir.join(binary);
        if candidate.exists() {
            Some(candidate)
        } else {
            None
        }
    })
}
