//! System-backed `HypervisorProvider` implementation.
//!
//! Wraps the host `virsh` binary; connection URI and binary path come from
//! configuration with well-known locations as fallback.

use crate::command::VirshCommand;
use crate::parse::{parse_block_list, parse_domain_list};
use log::debug;
use std::env;
use std::path::{Path, PathBuf};
use virtkeep_core::config::VirtkeepConfig;
use virtkeep_core::error::{BackupError, BackupResult};
use virtkeep_provider::hypervisor::{BlockDeviceRecord, DomainRecord, HypervisorProvider};

pub const DEFAULT_VIRSH_PATHS: &[&str] = &[
    "/usr/bin/virsh",
    "/bin/virsh",
    "/usr/local/bin/virsh",
];

/// System provider that manages guests via the host `virsh` binary.
#[derive(Debug, Clone)]
pub struct SystemHypervisor {
    virsh: VirshCommand,
}

impl SystemHypervisor {
    /// Build a provider from configuration, resolving the `virsh` path.
    pub fn from_config(config: &VirtkeepConfig) -> BackupResult<Self> {
        let binary = resolve_virsh_path(config)?;
        debug!("using virsh at {}", binary.display());
        Ok(Self {
            virsh: VirshCommand::new(binary, config.hypervisor.uri.clone()),
        })
    }
}

impl HypervisorProvider for SystemHypervisor {
    type Error = BackupError;

    fn list_domains(&self) -> BackupResult<Vec<DomainRecord>> {
        Ok(parse_domain_list(&self.virsh.list_all()?))
    }

    fn list_block_devices(&self, domain: &str) -> BackupResult<Vec<BlockDeviceRecord>> {
        Ok(parse_block_list(&self.virsh.domblklist(domain)?))
    }

    fn dump_config(&self, domain: &str) -> BackupResult<Vec<u8>> {
        self.virsh.dumpxml(domain)
    }

    fn create_external_snapshot(
        &self,
        domain: &str,
        target: &str,
        overlay: &Path,
    ) -> BackupResult<()> {
        self.virsh.snapshot_create(domain, target, overlay)
    }

    fn commit_snapshot(&self, domain: &str, target: &str) -> BackupResult<()> {
        self.virsh.blockcommit(domain, target)
    }
}

fn resolve_virsh_path(config: &VirtkeepConfig) -> BackupResult<PathBuf> {
    if let Some(path) = config
        .hypervisor
        .virsh_path
        .as_deref()
        .map(str::trim)
        .filter(|path| !path.is_empty())
    {
        let candidate = Path::new(path);
        if !candidate.exists() {
            return Err(BackupError::InvalidConfig(format!(
                "virsh binary not found at {}",
                candidate.display()
            )));
        }
        return Ok(candidate.to_path_buf());
    }

    for candidate in DEFAULT_VIRSH_PATHS {
        let path = Path::new(candidate);
        if path.exists() {
            return Ok(path.to_path_buf());
        }
    }

    find_in_path("virsh").ok_or_else(|| {
        BackupError::InvalidConfig(format!(
            "unable to locate virsh binary; tried {DEFAULT_VIRSH_PATHS:?} and PATH"
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
