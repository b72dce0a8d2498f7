use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::{tempdir, TempDir};
use virtkeep_core::config::VirtkeepConfig;
use virtkeep_core::error::{BackupError, BackupResult};
use virtkeep_core::BackupOrchestrator;
use virtkeep_provider::archive::{ArchiveStore, RetentionPolicy};
use virtkeep_provider::hypervisor::{
    BlockDeviceRecord, DomainRecord, DomainState, HypervisorProvider, ImageLocator,
};
use virtkeep_provider::pool::{ExportStream, PoolProvider};

#[derive(Clone, Default)]
struct MockHypervisor {
    domains: Vec<DomainRecord>,
    devices: HashMap<String, Vec<BlockDeviceRecord>>,
    calls: Arc<Mutex<Vec<String>>>,
    fail_domains: bool,
}

impl MockHypervisor {
    fn with_domain(
        mut self,
        name: &str,
        state: DomainState,
        devices: Vec<BlockDeviceRecord>,
    ) -> Self {
        self.domains.push(DomainRecord {
            name: name.to_string(),
            state,
        });
        self.devices.insert(name.to_string(), devices);
        self
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl HypervisorProvider for MockHypervisor {
    type Error = BackupError;

    fn list_domains(&self) -> BackupResult<Vec<DomainRecord>> {
        if self.fail_domains {
            return Err(BackupError::Provider(
                "virsh failed to list domains: no status recorded (exit code -1)".into(),
            ));
        }
        self.calls.lock().unwrap().push("list".to_string());
        Ok(self.domains.clone())
    }

    fn list_block_devices(&self, domain: &str) -> BackupResult<Vec<BlockDeviceRecord>> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("domblklist {domain}"));
        Ok(self.devices.get(domain).cloned().unwrap_or_default())
    }

    fn dump_config(&self, domain: &str) -> BackupResult<Vec<u8>> {
        self.calls.lock().unwrap().push(format!("dumpxml {domain}"));
        Ok(format!("<domain><name>{domain}</name></domain>").into_bytes())
    }

    fn create_external_snapshot(
        &self,
        domain: &str,
        target: &str,
        _overlay: &Path,
    ) -> BackupResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("snapshot {domain} {target}"));
        Ok(())
    }

    fn commit_snapshot(&self, domain: &str, target: &str) -> BackupResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("commit {domain} {target}"));
        Ok(())
    }
}

#[derive(Clone, Default)]
struct MockPool {
    images: Vec<String>,
    snapshots: Arc<Mutex<Vec<String>>>,
}

impl PoolProvider for MockPool {
    type Error = BackupError;

    fn list_images(&self, _pool: &str) -> BackupResult<Vec<String>> {
        Ok(self.images.clone())
    }

    fn create_snapshot(&self, _pool: &str, _image: &str, name: &str) -> BackupResult<()> {
        self.snapshots.lock().unwrap().push(name.to_string());
        Ok(())
    }

    fn list_snapshots(&self, _pool: &str, _image: &str) -> BackupResult<Vec<String>> {
        Ok(self.snapshots.lock().unwrap().clone())
    }

    fn delete_snapshot(&self, _pool: &str, _image: &str, name: &str) -> BackupResult<()> {
        self.snapshots.lock().unwrap().retain(|snap| snap != name);
        Ok(())
    }

    fn export_snapshot(
        &self,
        _pool: &str,
        _image: &str,
        _snapshot: &str,
    ) -> BackupResult<ExportStream> {
        Ok(ExportStream::new(
            Box::new(&b"frozen rbd bytes"[..]),
            Box::new(|| Ok(())),
        ))
    }
}

#[derive(Clone, Default)]
struct MockStore {
    entries: Arc<Mutex<Vec<String>>>,
    ops: Arc<Mutex<Vec<String>>>,
    fail_create_for: Option<String>,
}

impl MockStore {
    fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    fn record_create(&self, key: &str) -> BackupResult<()> {
        if let Some(prefix) = &self.fail_create_for {
            if key.starts_with(prefix.as_str()) {
                return Err(BackupError::Provider("borg create exited 2".into()));
            }
        }
        self.entries.lock().unwrap().push(key.to_string());
        self.ops.lock().unwrap().push(format!("create {key}"));
        Ok(())
    }
}

impl ArchiveStore for MockStore {
    type Error = BackupError;

    fn create_from_path(&self, key: &str, _source: &Path) -> BackupResult<()> {
        self.record_create(key)
    }

    fn create_from_reader(&self, key: &str, source: &mut dyn Read) -> BackupResult<()> {
        let mut sink = Vec::new();
        source.read_to_end(&mut sink).unwrap();
        self.record_create(key)
    }

    fn prune(&self, key_glob: &str, _policy: &RetentionPolicy) -> BackupResult<()> {
        self.ops.lock().unwrap().push(format!("prune {key_glob}"));
        Ok(())
    }

    fn compact(&self) -> BackupResult<()> {
        self.ops.lock().unwrap().push("compact".to_string());
        Ok(())
    }
}

fn sample_config(dir: &TempDir) -> VirtkeepConfig {
    let mut config = VirtkeepConfig::default();
    config.archive.repository = "/srv/backup/vms".to_string();
    config.source.image_roots = vec![dir.path().to_string_lossy().into_owned()];
    config.lock.path = dir
        .path()
        .join("virtkeep.lock")
        .to_string_lossy()
        .into_owned();
    config
}

fn image_device(target: &str, path: PathBuf) -> BlockDeviceRecord {
    BlockDeviceRecord {
        target: target.to_string(),
        locator: ImageLocator::Path(path),
    }
}

#[test]
fn full_run_produces_device_and_descriptor_entries() {
    let dir = tempdir().unwrap();
    let config = sample_config(&dir);
    let hypervisor = MockHypervisor::default().with_domain(
        "vm1",
        DomainState::Running,
        vec![image_device("vda", dir.path().join("vm1.qcow2"))],
    );
    let pool = MockPool::default();
    let store = MockStore::default();

    let orchestrator = BackupOrchestrator::new(&config, &hypervisor, &pool, &store);
    let summary = orchestrator.run(None).expect("run succeeds");

    assert_eq!(summary.domains, 1);
    assert_eq!(summary.devices, 1);
    assert_eq!(summary.skipped, 0);
    assert_eq!(summary.entries.len(), 2);
    assert!(summary.entries[0].starts_with("vm1-vda-"));
    assert!(summary.entries[1].starts_with("vm1-xml-"));

    let calls = hypervisor.calls();
    assert!(calls.contains(&"snapshot vm1 vda".to_string()));
    assert!(calls.contains(&"commit vm1 vda".to_string()));

    let ops = store.ops();
    assert!(ops.contains(&"prune vm1-vda-*".to_string()));
    assert!(ops.contains(&"prune vm1-xml-*".to_string()));
    assert_eq!(ops.last(), Some(&"compact".to_string()));

    assert!(!config.lock_path().exists());
}

#[test]
fn stopped_domain_is_read_without_snapshot_or_commit() {
    let dir = tempdir().unwrap();
    let config = sample_config(&dir);
    let hypervisor = MockHypervisor::default().with_domain(
        "vm1",
        DomainState::Stopped,
        vec![image_device("vda", dir.path().join("vm1.qcow2"))],
    );
    let pool = MockPool::default();
    let store = MockStore::default();

    let orchestrator = BackupOrchestrator::new(&config, &hypervisor, &pool, &store);
    let summary = orchestrator.run(None).expect("run succeeds");

    assert_eq!(summary.devices, 1);
    let calls = hypervisor.calls();
    assert!(!calls.iter().any(|call| call.starts_with("snapshot")));
    assert!(!calls.iter().any(|call| call.starts_with("commit")));
    assert_eq!(store.entries().len(), 2);
}

#[test]
fn inventory_failure_creates_no_archive_entries() {
    let dir = tempdir().unwrap();
    let config = sample_config(&dir);
    let hypervisor = MockHypervisor {
        fail_domains: true,
        ..MockHypervisor::default()
    };
    let pool = MockPool::default();
    let store = MockStore::default();

    let orchestrator = BackupOrchestrator::new(&config, &hypervisor, &pool, &store);
    match orchestrator.run(None) {
        Err(BackupError::Inventory(message)) => assert!(message.contains("virsh")),
        other => panic!("expected Inventory error, got {other:?}"),
    }

    assert!(store.ops().is_empty());
    assert!(!config.lock_path().exists());
}

#[test]
fn failing_device_stops_the_run_before_later_domains() {
    let dir = tempdir().unwrap();
    let config = sample_config(&dir);
    let hypervisor = MockHypervisor::default()
        .with_domain(
            "vm1",
            DomainState::Running,
            vec![image_device("vda", dir.path().join("vm1.qcow2"))],
        )
        .with_domain(
            "vm2",
            DomainState::Running,
            vec![image_device("vda", dir.path().join("vm2.qcow2"))],
        );
    let pool = MockPool::default();
    let store = MockStore {
        fail_create_for: Some("vm1-vda".to_string()),
        ..MockStore::default()
    };

    let orchestrator = BackupOrchestrator::new(&config, &hypervisor, &pool, &store);
    match orchestrator.run(None) {
        Err(BackupError::Export(_)) => {}
        other => panic!("expected Export error, got {other:?}"),
    }

    let calls = hypervisor.calls();
    // the failed device still reached a committed state
    assert!(calls.contains(&"commit vm1 vda".to_string()));
    // vm2 was never enumerated, let alone snapshotted
    assert!(!calls.contains(&"domblklist vm2".to_string()));
    assert!(!store.ops().contains(&"compact".to_string()));
    assert!(!config.lock_path().exists());
}

#[test]
fn second_invocation_fails_while_the_lock_holder_is_alive() {
    let dir = tempdir().unwrap();
    let config = sample_config(&dir);
    fs::write(&config.lock_path(), format!("{}\n", std::process::id())).unwrap();

    let hypervisor = MockHypervisor::default().with_domain(
        "vm1",
        DomainState::Running,
        vec![image_device("vda", dir.path().join("vm1.qcow2"))],
    );
    let pool = MockPool::default();
    let store = MockStore::default();

    let orchestrator = BackupOrchestrator::new(&config, &hypervisor, &pool, &store);
    match orchestrator.run(None) {
        Err(BackupError::AlreadyRunning { pid }) => assert_eq!(pid, std::process::id()),
        other => panic!("expected AlreadyRunning, got {other:?}"),
    }

    assert!(hypervisor.calls().is_empty());
    assert!(store.ops().is_empty());
    // the foreign lock record stays untouched
    assert!(config.lock_path().exists());
}

#[test]
fn ineligible_devices_are_skipped_but_counted() {
    let dir = tempdir().unwrap();
    let config = sample_config(&dir);
    let hypervisor = MockHypervisor::default().with_domain(
        "vm1",
        DomainState::Running,
        vec![
            image_device("vda", dir.path().join("vm1.qcow2")),
            image_device("sda", dir.path().join("install.iso")),
            BlockDeviceRecord {
                target: "sdb".to_string(),
                locator: ImageLocator::Empty,
            },
        ],
    );
    let pool = MockPool::default();
    let store = MockStore::default();

    let orchestrator = BackupOrchestrator::new(&config, &hypervisor, &pool, &store);
    let summary = orchestrator.run(None).expect("run succeeds");

    assert_eq!(summary.devices, 1);
    assert_eq!(summary.skipped, 2);
    let calls = hypervisor.calls();
    assert!(!calls.contains(&"snapshot vm1 sda".to_string()));
    assert!(!calls.contains(&"snapshot vm1 sdb".to_string()));
}

#[test]
fn domain_filter_limits_the_run_to_one_domain() {
    let dir = tempdir().unwrap();
    let config = sample_config(&dir);
    let hypervisor = MockHypervisor::default()
        .with_domain(
            "vm1",
            DomainState::Running,
            vec![image_device("vda", dir.path().join("vm1.qcow2"))],
        )
        .with_domain(
            "vm2",
            DomainState::Running,
            vec![image_device("vda", dir.path().join("vm2.qcow2"))],
        );
    let pool = MockPool::default();
    let store = MockStore::default();

    let orchestrator = BackupOrchestrator::new(&config, &hypervisor, &pool, &store);
    let summary = orchestrator.run(Some("vm2")).expect("run succeeds");

    assert_eq!(summary.domains, 1);
    assert!(summary.entries[0].starts_with("vm2-vda-"));

    let unmatched = orchestrator.run(Some("vm9")).expect("empty run succeeds");
    assert_eq!(unmatched.domains, 0);
    assert!(unmatched.entries.is_empty());
}

#[test]
fn interrupted_run_is_recovered_before_the_new_cycle() {
    let dir = tempdir().unwrap();
    let config = sample_config(&dir);
    let base = dir.path().join("vm1.qcow2");
    fs::write(&base, b"base image").unwrap();
    let overlay = dir.path().join("vm1.backup");
    fs::write(&overlay, b"overlay").unwrap();

    let hypervisor = MockHypervisor::default().with_domain(
        "vm1",
        DomainState::Running,
        vec![image_device("vda", overlay.clone())],
    );
    let pool = MockPool::default();
    let store = MockStore::default();

    let orchestrator = BackupOrchestrator::new(&config, &hypervisor, &pool, &store);
    let summary = orchestrator.run(None).expect("recovered run succeeds");

    assert_eq!(summary.devices, 1);
    let calls = hypervisor.calls();
    let first_commit = calls.iter().position(|c| c == "commit vm1 vda").unwrap();
    let snapshot = calls.iter().position(|c| c == "snapshot vm1 vda").unwrap();
    assert!(first_commit < snapshot, "recovery commit precedes snapshot");
    assert!(!overlay.exists());
    assert!(base.exists());
}

#[test]
fn rbd_devices_flow_through_named_snapshots() {
    let dir = tempdir().unwrap();
    let config = sample_config(&dir);
    let hypervisor = MockHypervisor::default().with_domain(
        "vm1",
        DomainState::Running,
        vec![BlockDeviceRecord {
            target: "vda".to_string(),
            locator: ImageLocator::Rbd {
                pool: "vms".to_string(),
                image: "vm1-disk".to_string(),
            },
        }],
    );
    let pool = MockPool {
        images: vec!["vm1-disk".to_string()],
        ..MockPool::default()
    };
    let store = MockStore::default();

    let orchestrator = BackupOrchestrator::new(&config, &hypervisor, &pool, &store);
    let summary = orchestrator.run(None).expect("run succeeds");

    assert_eq!(summary.devices, 1);
    assert!(summary.entries[0].starts_with("vm1-vda-"));
    let snapshots = pool.snapshots.lock().unwrap().clone();
    assert_eq!(snapshots.len(), 1);
    assert!(snapshots[0].starts_with("backup-"));
    // no overlay protocol for rbd devices
    assert!(!hypervisor
        .calls()
        .iter()
        .any(|call| call.starts_with("snapshot") || call.starts_with("commit")));
}
