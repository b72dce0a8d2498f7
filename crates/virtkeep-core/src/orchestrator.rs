//! Top-level backup driver: lock, enumerate, per-device cycles, compact.
//!
//! Strictly sequential and fail-fast: devices and domains are processed one
//! at a time, and the first fatal error stops the entire run. The run lock
//! is released on every exit path.

use crate::archive::ArchiveClient;
use crate::config::VirtkeepConfig;
use crate::error::{BackupError, BackupResult};
use crate::inventory::{DeviceClass, Inventory};
use crate::lock::RunLock;
use crate::snapshot::SnapshotCoordinator;
use log::{info, warn};
use virtkeep_provider::archive::ArchiveStore;
use virtkeep_provider::hypervisor::HypervisorProvider;
use virtkeep_provider::pool::PoolProvider;

/// What one run accomplished, for operator logging and tests.
#[derive(Debug, Default, Clone)]
pub struct RunSummary {
    pub domains: usize,
    pub devices: usize,
    pub skipped: usize,
    pub entries: Vec<String>,
}

/// Drives a full backup run across all selected domains and devices.
pub struct BackupOrchestrator<'a, H, P, S> {
    config: &'a VirtkeepConfig,
    hypervisor: &'a H,
    pool: &'a P,
    store: &'a S,
}

impl<'a, H, P, S> BackupOrchestrator<'a, H, P, S>
where
    H: HypervisorProvider<Error = BackupError>,
    P: PoolProvider<Error = BackupError>,
    S: ArchiveStore<Error = BackupError>,
{
    pub fn new(
        config: &'a VirtkeepConfig,
        hypervisor: &'a H,
        pool: &'a P,
        store: &'a S,
    ) -> Self {
        Self {
            config,
            hypervisor,
            pool,
            store,
        }
    }

    /// Run the whole protocol, optionally restricted to one domain name.
    pub fn run(&self, domain_filter: Option<&str>) -> BackupResult<RunSummary> {
        let lock_path = self.config.lock_path();
        let mut lock = RunLock::acquire(&lock_path)?;

        let outcome = self.run_locked(domain_filter);

        if let Err(release_err) = lock.release() {
            if outcome.is_ok() {
                return Err(release_err);
            }
            warn!("run lock release failed after aborted run: {release_err}");
        }
        outcome
    }

    fn run_locked(&self, domain_filter: Option<&str>) -> BackupResult<RunSummary> {
        let inventory = Inventory::new(self.config, self.hypervisor);
        let archive = ArchiveClient::new(self.store, self.config.retention_policy());
        let mut coordinator =
            SnapshotCoordinator::new(self.config, self.hypervisor, self.pool, &archive);

        let domains = inventory.list_domains(domain_filter)?;
        if domains.is_empty() {
            match domain_filter {
                Some(name) => info!("no domain named {name}; nothing to do"),
                None => info!("no domains found; nothing to do"),
            }
        }

        let mut summary = RunSummary {
            domains: domains.len(),
            ..RunSummary::default()
        };

        for domain in &domains {
            info!("processing domain {} ({:?})", domain.name, domain.state);
            for (device, class) in inventory.devices(&domain.name)? {
                match class {
                    DeviceClass::Skip(reason) => {
                        info!(
                            "skipping {}/{} ({}): {reason}",
                            domain.name,
                            device.target,
                            device.locator.describe()
                        );
                        summary.skipped += 1;
                    }
                    DeviceClass::Backup => {
                        let key = coordinator.run_device(domain, &device)?;
                        summary.devices += 1;
                        summary.entries.push(key);
                    }
                }
            }

            let key = coordinator.export_domain_config(&domain.name)?;
            summary.entries.push(key);
        }

        archive.compact()?;
        info!(
            "run complete: {} domains, {} devices backed up, {} skipped, {} entries",
            summary.domains,
            summary.devices,
            summary.skipped,
            summary.entries.len()
        );
        Ok(summary)
    }
}
