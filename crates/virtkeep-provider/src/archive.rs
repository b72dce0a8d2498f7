//! Provider contract for the deduplicating archive store.

use std::error::Error;
use std::io::Read;
use std::path::Path;

/// Keep-count retention rules applied when pruning archive entries.
///
/// The store owns the exact time-bucketing algorithm; callers only supply
/// the counts and the key glob scoping a prune to one domain/device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub keep_daily: u32,
    pub keep_weekly: u32,
    pub keep_monthly: u32,
}

/// Abstraction over the archive store commands.
///
/// All operations are opaque calls to the external tool; implementations
/// forward exit status faithfully and invent no retries. The caller decides
/// fatality.
pub trait ArchiveStore {
    type Error: Error + Send + Sync + 'static;

    /// Create the immutable entry `key` from a local file.
    fn create_from_path(&self, key: &str, source: &Path) -> Result<(), Self::Error>;

    /// Create the immutable entry `key` from a byte stream.
    fn create_from_reader(&self, key: &str, source: &mut dyn Read) -> Result<(), Self::Error>;

    /// Apply `policy` to the entries matching `key_glob`.
    fn prune(&self, key_glob: &str, policy: &RetentionPolicy) -> Result<(), Self::Error>;

    /// Reclaim space freed by earlier prunes.
    fn compact(&self) -> Result<(), Self::Error>;
}
