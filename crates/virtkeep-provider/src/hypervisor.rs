//! Provider contract for the virtualization layer.
//!
//! Concrete implementations wrap the host hypervisor tooling (`virsh` for
//! libvirt guests). Workflows consume these typed records so they never
//! depend on external tool output formatting.

use std::error::Error;
use std::path::{Path, PathBuf};

/// Run state reported by the hypervisor for a guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainState {
    Running,
    Stopped,
}

/// One guest known to the hypervisor. Obtained fresh each run, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainRecord {
    pub name: String,
    pub state: DomainState,
}

/// Where a block device's backing image lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageLocator {
    /// Local image file (qcow2 and friends).
    Path(PathBuf),
    /// Ceph RBD volume addressed as `pool/image`.
    Rbd { pool: String, image: String },
    /// Removable-media slot with nothing inserted.
    Empty,
}

impl ImageLocator {
    /// Render the locator the way the hypervisor listing showed it.
    pub fn describe(&self) -> String {
        match self {
            ImageLocator::Path(path) => path.display().to_string(),
            ImageLocator::Rbd { pool, image } => format!("{pool}/{image}"),
            ImageLocator::Empty => "-".to_string(),
        }
    }
}

/// One virtual block device attached to a domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDeviceRecord {
    /// Target bus id (e.g. `vda`).
    pub target: String,
    pub locator: ImageLocator,
}

/// Abstraction over the hypervisor commands the backup protocol needs.
///
/// Every operation maps to one external invocation whose exit status the
/// implementation must surface faithfully; an unrecorded status is a failure.
pub trait HypervisorProvider {
    type Error: Error + Send + Sync + 'static;

    /// All guests and their run state.
    fn list_domains(&self) -> Result<Vec<DomainRecord>, Self::Error>;

    /// Block devices attached to `domain`, with parsed locators.
    fn list_block_devices(&self, domain: &str) -> Result<Vec<BlockDeviceRecord>, Self::Error>;

    /// The domain's configuration descriptor (XML) as raw bytes.
    fn dump_config(&self, domain: &str) -> Result<Vec<u8>, Self::Error>;

    /// Create a disk-only, atomic, metadata-less external snapshot on the
    /// device at `target`, redirecting new writes into `overlay`.
    fn create_external_snapshot(
        &self,
        domain: &str,
        target: &str,
        overlay: &Path,
    ) -> Result<(), Self::Error>;

    /// Merge the active overlay on `target` back into its base image and
    /// pivot the domain onto the merged result.
    fn commit_snapshot(&self, domain: &str, target: &str) -> Result<(), Self::Error>;
}
