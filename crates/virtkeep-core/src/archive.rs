//! Archive client: key and glob composition over the external archive store.
//!
//! Keys follow `{scope}-{target}-{timestamp}` for disk exports and
//! `{scope}-xml-{timestamp}` for domain descriptors. Prune globs are scoped
//! to one domain/device prefix and must never cross scopes. Fatality of a
//! failed call is the coordinator's decision; nothing is retried here.

use crate::error::{BackupError, BackupResult};
use chrono::Local;
use std::io::Read;
use std::path::Path;
use virtkeep_provider::archive::{ArchiveStore, RetentionPolicy};

/// Sortable timestamp used in archive keys and snapshot names.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Stamp the current local time in the sortable key format.
pub fn timestamp() -> String {
    Local::now().format(TIMESTAMP_FORMAT).to_string()
}

pub fn device_key(scope: &str, target: &str, timestamp: &str) -> String {
    format!("{scope}-{target}-{timestamp}")
}

pub fn config_key(scope: &str, timestamp: &str) -> String {
    format!("{scope}-xml-{timestamp}")
}

pub fn device_glob(scope: &str, target: &str) -> String {
    format!("{scope}-{target}-*")
}

pub fn config_glob(scope: &str) -> String {
    format!("{scope}-xml-*")
}

/// Thin adapter composing keys for an [`ArchiveStore`].
pub struct ArchiveClient<'a, S> {
    store: &'a S,
    retention: RetentionPolicy,
}

impl<'a, S> ArchiveClient<'a, S>
where
    S: ArchiveStore<Error = BackupError>,
{
    pub fn new(store: &'a S, retention: RetentionPolicy) -> Self {
        Self { store, retention }
    }

    /// Archive a frozen disk image from a local file. Returns the entry key.
    pub fn create_device_entry(
        &self,
        scope: &str,
        target: &str,
        timestamp: &str,
        source: &Path,
    ) -> BackupResult<String> {
        let key = device_key(scope, target, timestamp);
        self.store
            .create_from_path(&key, source)
            .map_err(|err| BackupError::Export(format!("entry {key}: {err}")))?;
        Ok(key)
    }

    /// Archive a frozen disk image from a byte stream. Returns the entry key.
    pub fn create_device_stream(
        &self,
        scope: &str,
        target: &str,
        timestamp: &str,
        source: &mut dyn Read,
    ) -> BackupResult<String> {
        let key = device_key(scope, target, timestamp);
        self.store
            .create_from_reader(&key, source)
            .map_err(|err| BackupError::Export(format!("entry {key}: {err}")))?;
        Ok(key)
    }

    /// Archive a domain descriptor. Returns the entry key.
    pub fn create_config_entry(
        &self,
        scope: &str,
        timestamp: &str,
        descriptor: &[u8],
    ) -> BackupResult<String> {
        let key = config_key(scope, timestamp);
        let mut cursor = descriptor;
        self.store
            .create_from_reader(&key, &mut cursor)
            .map_err(|err| BackupError::Export(format!("entry {key}: {err}")))?;
        Ok(key)
    }

    /// Apply retention to one device's entries.
    pub fn prune_device(&self, scope: &str, target: &str) -> BackupResult<()> {
        let glob = device_glob(scope, target);
        self.store
            .prune(&glob, &self.retention)
            .map_err(|err| BackupError::Prune(format!("glob {glob}: {err}")))
    }

    /// Apply retention to one domain's descriptor entries.
    pub fn prune_config(&self, scope: &str) -> BackupResult<()> {
        let glob = config_glob(scope);
        self.store
            .prune(&glob, &self.retention)
            .map_err(|err| BackupError::Prune(format!("glob {glob}: {err}")))
    }

    /// Reclaim space once per run, after all domains are processed.
    pub fn compact(&self) -> BackupResult<()> {
        self.store
            .compact()
            .map_err(|err| BackupError::Prune(format!("compact: {err}")))
    }
}
