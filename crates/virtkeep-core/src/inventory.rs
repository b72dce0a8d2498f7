//! Domain and device enumeration with eligibility classification.
//!
//! A device is eligible for backup unless its locator names ISO media, an
//! unmanaged host path, or an RBD pool other than the configured one. The
//! verdicts are surfaced so operator views can show why a device was left
//! out of a run.

use crate::config::VirtkeepConfig;
use crate::error::{BackupError, BackupResult};
use std::fmt;
use std::path::Path;
use virtkeep_provider::hypervisor::{
    BlockDeviceRecord, DomainRecord, HypervisorProvider, ImageLocator,
};

/// Why a device was left out of the backup work list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoMedia,
    IsoMedia,
    UnmanagedPath,
    ForeignPool,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SkipReason::NoMedia => "no media inserted",
            SkipReason::IsoMedia => "ISO media",
            SkipReason::UnmanagedPath => "path outside managed image roots",
            SkipReason::ForeignPool => "image outside configured pool",
        };
        f.write_str(text)
    }
}

/// Eligibility verdict for one block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Backup,
    Skip(SkipReason),
}

/// Enumerates guarded domains and their devices through the hypervisor
/// provider, applying the eligibility filter.
pub struct Inventory<'a, H> {
    config: &'a VirtkeepConfig,
    hypervisor: &'a H,
}

impl<'a, H> Inventory<'a, H>
where
    H: HypervisorProvider<Error = BackupError>,
{
    pub fn new(config: &'a VirtkeepConfig, hypervisor: &'a H) -> Self {
        Self { config, hypervisor }
    }

    /// All guarded domains, optionally restricted to a single name. A filter
    /// that matches nothing yields an empty work list, not an error.
    pub fn list_domains(&self, filter: Option<&str>) -> BackupResult<Vec<DomainRecord>> {
        let mut domains = self
            .hypervisor
            .list_domains()
            .map_err(|err| BackupError::Inventory(err.to_string()))?;
        if let Some(name) = filter {
            domains.retain(|domain| domain.name == name);
        }
        Ok(domains)
    }

    /// Devices of `domain` paired with their eligibility verdict.
    pub fn devices(&self, domain: &str) -> BackupResult<Vec<(BlockDeviceRecord, DeviceClass)>> {
        let devices = self
            .hypervisor
            .list_block_devices(domain)
            .map_err(|err| BackupError::Inventory(err.to_string()))?;
        Ok(devices
            .into_iter()
            .map(|device| {
                let class = self.classify(&device);
                (device, class)
            })
            .collect())
    }

    /// Apply the eligibility filter to one device.
    pub fn classify(&self, device: &BlockDeviceRecord) -> DeviceClass {
        match &device.locator {
            ImageLocator::Empty => DeviceClass::Skip(SkipReason::NoMedia),
            ImageLocator::Path(path) => {
                if has_iso_extension(path) {
                    return DeviceClass::Skip(SkipReason::IsoMedia);
                }
                let managed = self
                    .config
                    .image_roots()
                    .iter()
                    .any(|root| path.starts_with(root));
                if managed {
                    DeviceClass::Backup
                } else {
                    DeviceClass::Skip(SkipReason::UnmanagedPath)
                }
            }
            ImageLocator::Rbd { pool, .. } => match &self.config.source.pool {
                Some(configured) if configured != pool => {
                    DeviceClass::Skip(SkipReason::ForeignPool)
                }
                _ => DeviceClass::Backup,
            },
        }
    }
}

fn has_iso_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("iso"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use virtkeep_provider::hypervisor::DomainState;

    #[derive(Clone, Default)]
    struct MockHypervisor {
        domains: Vec<DomainRecord>,
        devices: Vec<BlockDeviceRecord>,
        fail_domains: bool,
    }

    impl HypervisorProvider for MockHypervisor {
        type Error = BackupError;

        fn list_domains(&self) -> BackupResult<Vec<DomainRecord>> {
            if self.fail_domains {
                return Err(BackupError::Provider(
                    "virsh list exited with code 1".into(),
                ));
            }
            Ok(self.domains.clone())
        }

        fn list_block_devices(&self, _domain: &str) -> BackupResult<Vec<BlockDeviceRecord>> {
            Ok(self.devices.clone())
        }

        fn dump_config(&self, _domain: &str) -> BackupResult<Vec<u8>> {
            Ok(b"<domain/>".to_vec())
        }

        fn create_external_snapshot(
            &self,
            _domain: &str,
            _target: &str,
            _overlay: &Path,
        ) -> BackupResult<()> {
            Ok(())
        }

        fn commit_snapshot(&self, _domain: &str, _target: &str) -> BackupResult<()> {
            Ok(())
        }
    }

    fn sample_config() -> VirtkeepConfig {
        let mut config = VirtkeepConfig::default();
        config.source.image_roots = vec!["/var/lib/libvirt/images".to_string()];
        config
    }

    fn device(target: &str, locator: ImageLocator) -> BlockDeviceRecord {
        BlockDeviceRecord {
            target: target.to_string(),
            locator,
        }
    }

    #[test]
    fn classification_covers_the_filter_table() {
        let config = sample_config();
        let hypervisor = MockHypervisor::default();
        let inventory = Inventory::new(&config, &hypervisor);

        let cases = [
            (
                device(
                    "vda",
                    ImageLocator::Path(PathBuf::from("/var/lib/libvirt/images/vm1.qcow2")),
                ),
                DeviceClass::Backup,
            ),
            (
                device(
                    "sda",
                    ImageLocator::Path(PathBuf::from("/var/lib/libvirt/images/install.iso")),
                ),
                DeviceClass::Skip(SkipReason::IsoMedia),
            ),
            (
                device("vdb", ImageLocator::Path(PathBuf::from("/srv/scratch.qcow2"))),
                DeviceClass::Skip(SkipReason::UnmanagedPath),
            ),
            (
                device("sdb", ImageLocator::Empty),
                DeviceClass::Skip(SkipReason::NoMedia),
            ),
            (
                device(
                    "vdc",
                    ImageLocator::Rbd {
                        pool: "vms".into(),
                        image: "vm1-disk".into(),
                    },
                ),
                DeviceClass::Backup,
            ),
        ];

        for (device, expected) in cases {
            assert_eq!(inventory.classify(&device), expected, "{}", device.target);
        }
    }

    #[test]
    fn configured_pool_restricts_rbd_devices() {
        let mut config = sample_config();
        config.source.pool = Some("vms".to_string());
        let hypervisor = MockHypervisor::default();
        let inventory = Inventory::new(&config, &hypervisor);

        let own = device(
            "vda",
            ImageLocator::Rbd {
                pool: "vms".into(),
                image: "vm1-disk".into(),
            },
        );
        let foreign = device(
            "vdb",
            ImageLocator::Rbd {
                pool: "scratch".into(),
                image: "tmp".into(),
            },
        );
        assert_eq!(inventory.classify(&own), DeviceClass::Backup);
        assert_eq!(
            inventory.classify(&foreign),
            DeviceClass::Skip(SkipReason::ForeignPool)
        );
    }

    #[test]
    fn unmatched_domain_filter_yields_empty_list() {
        let config = sample_config();
        let hypervisor = MockHypervisor {
            domains: vec![DomainRecord {
                name: "vm1".into(),
                state: DomainState::Running,
            }],
            ..MockHypervisor::default()
        };
        let inventory = Inventory::new(&config, &hypervisor);

        let matched = inventory.list_domains(Some("vm1")).unwrap();
        assert_eq!(matched.len(), 1);

        let unmatched = inventory.list_domains(Some("vm9")).unwrap();
        assert!(unmatched.is_empty());
    }

    #[test]
    fn enumeration_failure_becomes_inventory_error() {
        let config = sample_config();
        let hypervisor = MockHypervisor {
            fail_domains: true,
            ..MockHypervisor::default()
        };
        let inventory = Inventory::new(&config, &hypervisor);

        match inventory.list_domains(None) {
            Err(BackupError::Inventory(message)) => {
                assert!(message.contains("virsh list"));
            }
            other => panic!("expected Inventory error, got {other:?}"),
        }
    }
}
