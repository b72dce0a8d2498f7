//! The per-device backup cycle: crash recovery, snapshot, export, commit.
//!
//! Path-backed devices go through the external-overlay protocol; RBD-backed
//! devices use named pool snapshots. Either way the cycle is strictly
//! sequential and blocking: once a snapshot or commit has started it runs to
//! completion, and a half-committed chain is never interrupted from here.

use crate::archive::{self, ArchiveClient};
use crate::config::VirtkeepConfig;
use crate::error::{BackupError, BackupResult};
use log::{debug, error, info, warn};
use std::ffi::OsStr;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use virtkeep_provider::archive::ArchiveStore;
use virtkeep_provider::hypervisor::{
    BlockDeviceRecord, DomainRecord, DomainState, HypervisorProvider, ImageLocator,
};
use virtkeep_provider::pool::PoolProvider;

/// Fixed name of the protocol's ephemeral snapshot. Path overlays carry it
/// as their extension; RBD snapshots carry it as their name prefix.
pub const SNAPSHOT_NAME: &str = "backup";

/// Observable protocol state for one device cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Clean,
    CrashDetected,
    SnapshotPending,
    Exported,
    Committed,
}

/// Runs the backup cycle for one device at a time.
pub struct SnapshotCoordinator<'a, H, P, S> {
    config: &'a VirtkeepConfig,
    hypervisor: &'a H,
    pool: &'a P,
    archive: &'a ArchiveClient<'a, S>,
    state: CycleState,
}

impl<'a, H, P, S> SnapshotCoordinator<'a, H, P, S>
where
    H: HypervisorProvider<Error = BackupError>,
    P: PoolProvider<Error = BackupError>,
    S: ArchiveStore<Error = BackupError>,
{
    pub fn new(
        config: &'a VirtkeepConfig,
        hypervisor: &'a H,
        pool: &'a P,
        archive: &'a ArchiveClient<'a, S>,
    ) -> Self {
        Self {
            config,
            hypervisor,
            pool,
            archive,
            state: CycleState::Clean,
        }
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    /// Run one full cycle for `device`, returning the archive entry key.
    pub fn run_device(
        &mut self,
        domain: &DomainRecord,
        device: &BlockDeviceRecord,
    ) -> BackupResult<String> {
        self.state = CycleState::Clean;
        info!(
            "backing up {}/{} ({})",
            domain.name,
            device.target,
            device.locator.describe()
        );
        match &device.locator {
            ImageLocator::Path(path) => self.run_path_device(domain, &device.target, path),
            ImageLocator::Rbd { pool, image } => {
                self.run_rbd_device(&domain.name, &device.target, pool, image)
            }
            ImageLocator::Empty => Err(BackupError::Inventory(format!(
                "device {}/{} has no media to back up",
                domain.name, device.target
            ))),
        }
    }

    /// Export the domain's descriptor XML and apply retention to its prefix.
    pub fn export_domain_config(&mut self, domain: &str) -> BackupResult<String> {
        let descriptor = self
            .hypervisor
            .dump_config(domain)
            .map_err(|err| BackupError::Export(format!("descriptor of {domain}: {err}")))?;
        let stamp = archive::timestamp();
        let key = self.archive.create_config_entry(domain, &stamp, &descriptor)?;
        self.archive.prune_config(domain)?;
        Ok(key)
    }

    fn run_path_device(
        &mut self,
        domain: &DomainRecord,
        target: &str,
        current: &Path,
    ) -> BackupResult<String> {
        let base = self.recover_interrupted(&domain.name, target, current)?;
        let stamp = archive::timestamp();

        if domain.state != DomainState::Running {
            // quiescent disk: read it directly, no snapshot machinery
            let key = self
                .archive
                .create_device_entry(&domain.name, target, &stamp, &base)?;
            self.archive.prune_device(&domain.name, target)?;
            self.state = CycleState::Clean;
            return Ok(key);
        }

        let overlay = overlay_path(&base);
        self.hypervisor
            .create_external_snapshot(&domain.name, target, &overlay)
            .map_err(|err| {
                BackupError::SnapshotCreate(format!("{}/{target}: {err}", domain.name))
            })?;
        self.state = CycleState::SnapshotPending;

        let export = self
            .archive
            .create_device_entry(&domain.name, target, &stamp, &base);
        if export.is_ok() {
            self.state = CycleState::Exported;
        }
        let prune = match &export {
            Ok(_) => self.archive.prune_device(&domain.name, target),
            Err(_) => Ok(()),
        };

        // the overlay must be merged back no matter what happened above;
        // chain integrity outranks archive bookkeeping
        if let Err(err) = self.commit(&domain.name, target) {
            error!(
                "COMMIT FAILED for {}/{target}: the live domain may reference a broken disk \
                 chain; manual inspection required before the next run: {err}",
                domain.name
            );
            if let Err(prior) = &export {
                error!("export had already failed before the commit attempt: {prior}");
            }
            if let Err(prior) = &prune {
                error!("prune had already failed before the commit attempt: {prior}");
            }
            return Err(err);
        }
        self.state = CycleState::Committed;
        remove_overlay_file(&overlay);

        let key = export?;
        prune?;
        self.state = CycleState::Clean;
        Ok(key)
    }

    /// Recovery edge taken before any new snapshot: a locator still carrying
    /// the overlay extension means a prior run died between snapshot and
    /// commit. Returns the base image path the rest of the cycle works on.
    fn recover_interrupted(
        &mut self,
        domain: &str,
        target: &str,
        current: &Path,
    ) -> BackupResult<PathBuf> {
        let is_overlay = current.extension().and_then(OsStr::to_str) == Some(SNAPSHOT_NAME);
        if !is_overlay {
            return Ok(current.to_path_buf());
        }

        self.state = CycleState::CrashDetected;
        warn!(
            "device {domain}/{target} still points at overlay {}; committing the leftover \
             snapshot from an interrupted run",
            current.display()
        );
        self.commit(domain, target)?;
        self.state = CycleState::Committed;

        let base = current.with_extension(&self.config.snapshot.base_format);
        if !base.exists() {
            return Err(BackupError::CorruptChain(format!(
                "expected base image {} is missing after committing {}; refusing to guess \
                 an image name, manual intervention required",
                base.display(),
                current.display()
            )));
        }
        remove_overlay_file(current);
        Ok(base)
    }

    fn run_rbd_device(
        &mut self,
        scope: &str,
        target: &str,
        pool: &str,
        image: &str,
    ) -> BackupResult<String> {
        let images = self
            .pool
            .list_images(pool)
            .map_err(|err| BackupError::Inventory(format!("pool {pool}: {err}")))?;
        if !images.iter().any(|name| name == image) {
            return Err(BackupError::Inventory(format!(
                "image {pool}/{image} for {scope}/{target} not present in pool"
            )));
        }

        let stamp = archive::timestamp();
        let snapshot = format!("{SNAPSHOT_NAME}-{stamp}");
        self.pool
            .create_snapshot(pool, image, &snapshot)
            .map_err(|err| {
                BackupError::SnapshotCreate(format!("{pool}/{image}@{snapshot}: {err}"))
            })?;
        self.state = CycleState::SnapshotPending;

        let export = self.export_rbd_snapshot(scope, target, pool, image, &snapshot, &stamp);
        if export.is_ok() {
            self.state = CycleState::Exported;
        }
        let archive_prune = match &export {
            Ok(_) => self.archive.prune_device(scope, target),
            Err(_) => Ok(()),
        };

        // named snapshots are the committed-chain analogue here; retention
        // runs even after a failed export so they cannot pile up
        let snapshot_prune = self.prune_pool_snapshots(pool, image);
        self.state = CycleState::Committed;
        if (export.is_err() || archive_prune.is_err()) && snapshot_prune.is_err() {
            if let Err(masked) = &snapshot_prune {
                warn!("snapshot retention also failed for {pool}/{image}: {masked}");
            }
        }

        let key = export?;
        archive_prune?;
        snapshot_prune?;
        self.state = CycleState::Clean;
        Ok(key)
    }

    fn export_rbd_snapshot(
        &self,
        scope: &str,
        target: &str,
        pool: &str,
        image: &str,
        snapshot: &str,
        stamp: &str,
    ) -> BackupResult<String> {
        let mut stream = self
            .pool
            .export_snapshot(pool, image, snapshot)
            .map_err(|err| BackupError::Export(format!("{pool}/{image}@{snapshot}: {err}")))?;
        let key = self
            .archive
            .create_device_stream(scope, target, stamp, &mut stream)?;
        stream
            .finish()
            .map_err(|err| BackupError::Export(format!("{pool}/{image}@{snapshot}: {err}")))?;
        Ok(key)
    }

    /// Keep exactly the configured number of most-recent managed snapshots,
    /// deleting the rest oldest first.
    fn prune_pool_snapshots(&self, pool: &str, image: &str) -> BackupResult<()> {
        let keep = self.config.retention.keep_snapshots as usize;
        let snapshots = self
            .pool
            .list_snapshots(pool, image)
            .map_err(|err| BackupError::Prune(format!("{pool}/{image}: {err}")))?;
        let managed: Vec<String> = snapshots
            .into_iter()
            .filter(|name| name.starts_with(SNAPSHOT_NAME))
            .collect();
        if managed.len() <= keep {
            return Ok(());
        }
        for name in &managed[..managed.len() - keep] {
            self.pool
                .delete_snapshot(pool, image, name)
                .map_err(|err| BackupError::Prune(format!("{pool}/{image}@{name}: {err}")))?;
            info!("deleted aged snapshot {pool}/{image}@{name}");
        }
        Ok(())
    }

    fn commit(&self, domain: &str, target: &str) -> BackupResult<()> {
        self.hypervisor
            .commit_snapshot(domain, target)
            .map_err(|err| BackupError::Commit(format!("{domain}/{target}: {err}")))
    }
}

/// Overlay file created next to the base image by the external snapshot.
pub(crate) fn overlay_path(base: &Path) -> PathBuf {
    base.with_extension(SNAPSHOT_NAME)
}

fn remove_overlay_file(overlay: &Path) {
    match fs::remove_file(overlay) {
        Ok(()) => debug!("removed overlay file {}", overlay.display()),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!(
            "could not remove overlay file {}: {err}",
            overlay.display()
        ),
    }
}
