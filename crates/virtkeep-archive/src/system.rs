//! System-backed `ArchiveStore` implementation wrapping the `borg` CLI.

use crate::command::BorgCommand;
use log::debug;
use std::env;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use virtkeep_core::config::VirtkeepConfig;
use virtkeep_core::error::{BackupError, BackupResult};
use virtkeep_provider::archive::{ArchiveStore, RetentionPolicy};

pub const DEFAULT_BORG_PATHS: &[&str] = &["/usr/bin/borg", "/usr/local/bin/borg", "/bin/borg"];

/// System store that writes archive entries via the host `borg` binary.
#[derive(Debug, Clone)]
pub struct SystemArchiveStore {
    borg: BorgCommand,
}

impl SystemArchiveStore {
    /// Build a store from configuration, resolving the binary, the
    /// repository, and the passphrase source.
    pub fn from_config(config: &VirtkeepConfig) -> BackupResult<Self> {
        let binary = resolve_borg_path(config)?;
        debug!("using borg at {}", binary.display());
        let repository = config.require_repository()?.to_string();
        let passphrase = match &config.archive.passphrase_file {
            Some(path) => Some(read_passphrase_file(Path::new(path))?),
            None => None,
        };

        Ok(Self {
            borg: BorgCommand::new(binary, repository, passphrase, config.archive.unattended),
        })
    }

    /// Replace the passphrase, e.g. with one prompted interactively.
    pub fn with_passphrase(mut self, passphrase: String) -> Self {
        self.borg.set_passphrase(passphrase);
        self
    }
}

impl ArchiveStore for SystemArchiveStore {
    type Error = BackupError;

    fn create_from_path(&self, key: &str, source: &Path) -> BackupResult<()> {
        self.borg.create_from_path(key, source)
    }

    fn create_from_reader(&self, key: &str, source: &mut dyn Read) -> BackupResult<()> {
        self.borg.create_from_reader(key, source)
    }

    fn prune(&self, key_glob: &str, policy: &RetentionPolicy) -> BackupResult<()> {
        self.borg.prune(key_glob, policy)
    }

    fn compact(&self) -> BackupResult<()> {
        self.borg.compact()
    }
}

fn read_passphrase_file(path: &Path) -> BackupResult<String> {
    let contents = fs::read_to_string(path).map_err(|err| {
        BackupError::InvalidConfig(format!(
            "unable to read archive.passphrase_file {}: {err}",
            path.display()
        ))
    })?;
    let passphrase = contents.lines().next().unwrap_or("").to_string();
    if passphrase.is_empty() {
        return Err(BackupError::InvalidConfig(format!(
            "archive.passphrase_file {} is empty",
            path.display()
        )));
    }
    Ok(passphrase)
}

fn resolve_borg_path(config: &VirtkeepConfig) -> BackupResult<PathBuf> {
    if let Some(path) = config
        .archive
        .borg_path
        .as_deref()
        .map(str::trim)
        .filter(|path| !path.is_empty())
    {
        let candidate = Path::new(path);
        if !candidate.exists() {
            return Err(BackupError::InvalidConfig(format!(
                "borg binary not found at {}",
                candidate.display()
            )));
        }
        return Ok(candidate.to_path_buf());
    }

    for candidate in DEFAULT_BORG_PATHS {
        let path = Path::new(candidate);
        if path.exists() {
            return Ok(path.to_path_buf());
        }
    }

    find_in_path("borg").ok_or_else(|| {
        BackupError::InvalidConfig(format!(
            "unable to locate borg binary; tried {DEFAULT_BORG_PATHS:?} and PATH"
        ))
    })
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

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn passphrase_file_yields_its_first_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("archive.pass");
        fs::write(&path, "sw0rdfish\ntrailing noise\n").unwrap();

        let passphrase = read_passphrase_file(&path).expect("readable passphrase");
        assert_eq!(passphrase, "sw0rdfish");
    }

    #[test]
    fn empty_passphrase_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("archive.pass");
        fs::write(&path, "\n").unwrap();

        match read_passphrase_file(&path) {
            Err(BackupError::InvalidConfig(message)) => assert!(message.contains("empty")),
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
    }

    #[test]
    fn missing_passphrase_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.pass");

        assert!(read_passphrase_file(&path).is_err());
    }
}
