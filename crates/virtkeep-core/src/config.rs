//! Configuration model and helpers used by virtkeep binaries.

use crate::error::{BackupError, BackupResult};
use directories_next::ProjectDirs;
use log::{info, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use virtkeep_provider::archive::RetentionPolicy;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/virtkeep.toml";
pub const PLACEHOLDER_REPOSITORY: &str = "REPLACE_WITH_ARCHIVE_REPO";
const LOCK_PATH_ENV: &str = "VIRTKEEP_LOCK_PATH";
const BOOTSTRAP_FILE_NAME: &str = "virtkeep.toml";
const APP_QUALIFIER: &str = "io";
const APP_ORGANIZATION: &str = "Virtkeep";
const APP_NAME: &str = "virtkeep";

const KNOWN_VIRSH_PATHS: &[&str] = &[
    "/usr/bin/virsh",
    "/bin/virsh",
    "/usr/local/bin/virsh",
];
const KNOWN_BORG_PATHS: &[&str] = &[
    "/usr/bin/borg",
    "/usr/local/bin/borg",
    "/bin/borg",
];

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
}

fn detect_binary_path(candidates: &[&str]) -> Option<String> {
    candidates
        .iter()
        .map(Path::new)
        .find(|path| path.exists())
        .map(|path| path.to_string_lossy().into_owned())
}

/// Lightweight sanity check that an image root is a usable absolute path.
pub fn looks_like_image_root(path: &str) -> bool {
    let trimmed = path.trim();
    !trimmed.is_empty() && trimmed.starts_with('/') && !trimmed.contains('\0')
}

fn render_bootstrap_template() -> String {
    let virsh_path = detect_binary_path(KNOWN_VIRSH_PATHS).unwrap_or_else(|| "/usr/bin/virsh".to_string());
    let borg_path = detect_binary_path(KNOWN_BORG_PATHS).unwrap_or_else(|| "/usr/bin/borg".to_string());

    format!(
        "# Auto-generated virtkeep configuration bootstrap.\n\
         # Customize these values before running production backups.\n\
         \n\
         [source]\n\
         # Image files outside these directories are skipped as unmanaged.\n\
         image_roots = [\"/var/lib/libvirt/images\"]\n\
         # Restrict RBD-backed devices to one pool; leave unset to accept any pool.\n\
         # pool = \"rbd\"\n\
         \n\
         [hypervisor]\n\
         virsh_path = \"{virsh_path}\"\n\
         # uri = \"qemu:///system\"\n\
         \n\
         [pool]\n\
         # rbd_path = \"/usr/bin/rbd\"\n\
         # id = \"admin\"\n\
         \n\
         [archive]\n\
         repository = \"{PLACEHOLDER_REPOSITORY}\"\n\
         borg_path = \"{borg_path}\"\n\
         # passphrase_file = \"/etc/virtkeep.pass\"\n\
         # Answer repository-access confirmations automatically (timer-driven runs).\n\
         unattended = false\n\
         \n\
         [retention]\n\
         keep_daily = 7\n\
         keep_weekly = 4\n\
         keep_monthly = 6\n\
         # Named RBD snapshots kept per image, newest first.\n\
         keep_snapshots = 3\n\
         \n\
         [snapshot]\n\
         # Extension the crash-recovery step expects the base image to carry.\n\
         base_format = \"qcow2\"\n\
         \n\
         [lock]\n\
         path = \"/run/virtkeep.lock\"\n"
    )
}

pub fn bootstrap_template() -> String {
    render_bootstrap_template()
}

/// Which image sources are considered managed and eligible for backup.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SourceCfg {
    #[serde(default = "default_image_roots")]
    pub image_roots: Vec<String>,

    /// When set, RBD-backed devices in other pools are skipped.
    #[serde(default)]
    pub pool: Option<String>,
}

fn default_image_roots() -> Vec<String> {
    vec!["/var/lib/libvirt/images".to_string()]
}

impl Default for SourceCfg {
    fn default() -> Self {
        Self {
            image_roots: default_image_roots(),
            pool: None,
        }
    }
}

/// Paths and connection settings for the hypervisor CLI.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct HypervisorCfg {
    #[serde(default)]
    pub virsh_path: Option<String>,

    #[serde(default)]
    pub uri: Option<String>,
}

/// Paths and credentials for the block-storage pool CLI.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct PoolCfg {
    #[serde(default)]
    pub rbd_path: Option<String>,

    /// Ceph client id passed to `rbd --id`.
    #[serde(default)]
    pub id: Option<String>,
}

/// Archive store location and credential handling.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ArchiveCfg {
    #[serde(default)]
    pub repository: String,

    #[serde(default)]
    pub borg_path: Option<String>,

    /// File whose first line is the archive passphrase.
    #[serde(default)]
    pub passphrase_file: Option<String>,

    /// Answer repository-access confirmations automatically.
    #[serde(default)]
    pub unattended: bool,
}

impl Default for ArchiveCfg {
    fn default() -> Self {
        Self {
            repository: String::new(),
            borg_path: None,
            passphrase_file: None,
            unattended: false,
        }
    }
}

/// Keep-counts per period for archive entries, plus the RBD snapshot cap.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RetentionCfg {
    #[serde(default = "default_keep_daily")]
    pub keep_daily: u32,

    #[serde(default = "default_keep_weekly")]
    pub keep_weekly: u32,

    #[serde(default = "default_keep_monthly")]
    pub keep_monthly: u32,

    /// Named RBD snapshots kept per image, newest first.
    #[serde(default = "default_keep_snapshots")]
    pub keep_snapshots: u32,
}

fn default_keep_daily() -> u32 {
    7
}

fn default_keep_weekly() -> u32 {
    4
}

fn default_keep_monthly() -> u32 {
    6
}

fn default_keep_snapshots() -> u32 {
    3
}

impl Default for RetentionCfg {
    fn default() -> Self {
        Self {
            keep_daily: default_keep_daily(),
            keep_weekly: default_keep_weekly(),
            keep_monthly: default_keep_monthly(),
            keep_snapshots: default_keep_snapshots(),
        }
    }
}

/// Snapshot chain expectations for the image-file variant.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SnapshotCfg {
    /// Extension the base image is expected to carry after a commit.
    #[serde(default = "default_base_format")]
    pub base_format: String,
}

fn default_base_format() -> String {
    "qcow2".to_string()
}

impl Default for SnapshotCfg {
    fn default() -> Self {
        Self {
            base_format: default_base_format(),
        }
    }
}

/// Run-lock location.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LockCfg {
    #[serde(default = "default_lock_path")]
    pub path: String,
}

fn default_lock_path() -> String {
    "/run/virtkeep.lock".to_string()
}

impl Default for LockCfg {
    fn default() -> Self {
        Self {
            path: default_lock_path(),
        }
    }
}

/// Top-level configuration snapshot loaded from disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct VirtkeepConfig {
    #[serde(default)]
    pub source: SourceCfg,

    #[serde(default)]
    pub hypervisor: HypervisorCfg,

    #[serde(default)]
    pub pool: PoolCfg,

    #[serde(default)]
    pub archive: ArchiveCfg,

    #[serde(default)]
    pub retention: RetentionCfg,

    #[serde(default)]
    pub snapshot: SnapshotCfg,

    #[serde(default)]
    pub lock: LockCfg,

    #[serde(skip)]
    pub path: PathBuf,

    #[serde(skip)]
    pub format: ConfigFormat,
}

/// Tracks whether we parsed TOML or YAML so writes preserve format.
#[derive(Debug, Clone, Copy, Default)]
pub enum ConfigFormat {
    #[default]
    Toml,
    Yaml,
}

impl VirtkeepConfig {
    /// Return the canonical system-wide configuration path.
    pub fn default_path() -> &'static Path {
        Path::new(DEFAULT_CONFIG_PATH)
    }

    /// Resolve the per-user configuration path used for bootstrapping.
    pub fn user_config_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join(BOOTSTRAP_FILE_NAME))
    }

    /// Load configuration from disk, creating a bootstrap copy when missing.
    ///
    /// If the requested path does not exist, virtkeep will attempt to
    /// materialise a bootstrap template at that location. When the caller
    /// requests the global default (`/etc/virtkeep.toml`) and the process
    /// lacks permission to create it, a per-user configuration is written to
    /// the platform config directory instead.
    pub fn load_or_bootstrap<P: AsRef<Path>>(path: P) -> BackupResult<Self> {
        let target = path.as_ref();
        if target.exists() {
            return Self::load(target);
        }

        match ensure_bootstrap_file(target) {
            Ok(created) => {
                if created {
                    info!("virtkeep config bootstrap created at {}", target.display());
                }
                Self::load(target)
            }
            Err(err) => {
                if target != Self::default_path() {
                    return Err(BackupError::InvalidConfig(format!(
                        "failed to initialise configuration at {}: {err}",
                        target.display()
                    )));
                }

                let user_path = Self::user_config_path().ok_or_else(|| {
                    BackupError::InvalidConfig(
                        "unable to determine user configuration directory; \
                        create /etc/virtkeep.toml manually"
                            .to_string(),
                    )
                })?;

                let created_user = ensure_bootstrap_file(&user_path).map_err(|io_err| {
                    BackupError::InvalidConfig(format!(
                        "failed to prepare bootstrap configuration at {}: {io_err}",
                        user_path.display()
                    ))
                })?;

                if created_user {
                    info!(
                        "virtkeep config bootstrap created at {}",
                        user_path.display()
                    );
                }

                warn!(
                    "configuration missing at {}; using per-user bootstrap at {}",
                    target.display(),
                    user_path.display()
                );

                Self::load(&user_path)
            }
        }
    }

    /// Read a config file from disk, detect format, and validate basics.
    pub fn load<P: AsRef<Path>>(path: P) -> BackupResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let is_toml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some(ext) if ext.eq_ignore_ascii_case("toml")
        );
        let mut cfg = if is_toml {
            toml::from_str::<Self>(&contents)?
        } else {
            serde_yaml::from_str::<Self>(&contents)?
        };

        cfg.path = path.to_path_buf();
        cfg.format = if is_toml {
            ConfigFormat::Toml
        } else {
            ConfigFormat::Yaml
        };

        if cfg.source.image_roots.is_empty() {
            return Err(BackupError::InvalidConfig(
                "source.image_roots must list at least one managed directory".to_string(),
            ));
        }

        Ok(cfg)
    }

    /// Perform a best-effort validation pass and return human-readable issues.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if self.source.image_roots.is_empty() {
            issues.push("source.image_roots must list at least one managed directory".to_string());
        }
        for root in &self.source.image_roots {
            if !looks_like_image_root(root) {
                issues.push(format!(
                    "source.image_roots contains a non-absolute entry: {root}"
                ));
            }
        }

        if self.archive.repository.trim().is_empty() {
            issues.push("archive.repository is not set".to_string());
        } else if self.archive.repository == PLACEHOLDER_REPOSITORY {
            issues.push("archive.repository still carries the bootstrap placeholder".to_string());
        }

        if self.retention.keep_daily == 0
            && self.retention.keep_weekly == 0
            && self.retention.keep_monthly == 0
        {
            issues.push(
                "retention keeps nothing; set at least one of keep_daily/keep_weekly/keep_monthly"
                    .to_string(),
            );
        }
        if self.retention.keep_snapshots == 0 {
            issues.push("retention.keep_snapshots must be at least 1".to_string());
        }

        let base = self.snapshot.base_format.trim();
        if base.is_empty() || !base.chars().all(|ch| ch.is_ascii_alphanumeric()) {
            issues.push(format!(
                "snapshot.base_format must be a bare extension, got: {base:?}"
            ));
        }

        if !self.lock.path.starts_with('/') {
            issues.push(format!(
                "lock.path must be absolute, got: {}",
                self.lock.path
            ));
        }

        issues
    }

    /// Resolve the run-lock path, honoring the environment override used by
    /// tests and service units.
    pub fn lock_path(&self) -> PathBuf {
        if let Ok(override_path) = env::var(LOCK_PATH_ENV) {
            if !override_path.is_empty() {
                return PathBuf::from(override_path);
            }
        }
        PathBuf::from(&self.lock.path)
    }

    /// Managed image directories as paths.
    pub fn image_roots(&self) -> Vec<PathBuf> {
        self.source.image_roots.iter().map(PathBuf::from).collect()
    }

    /// Archive retention keep-counts as the provider-level policy.
    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            keep_daily: self.retention.keep_daily,
            keep_weekly: self.retention.keep_weekly,
            keep_monthly: self.retention.keep_monthly,
        }
    }

    /// Fail unless the archive repository has been configured for real use.
    pub fn require_repository(&self) -> BackupResult<&str> {
        let repository = self.archive.repository.trim();
        if repository.is_empty() || repository == PLACEHOLDER_REPOSITORY {
            return Err(BackupError::InvalidConfig(format!(
                "archive.repository is not configured in {}",
                self.path.display()
            )));
        }
        Ok(repository)
    }

    /// Persist the configuration back to its original on-disk format.
    pub fn save(&self) -> BackupResult<()> {
        let payload = match self.format {
            ConfigFormat::Toml => toml::to_string_pretty(self)?,
            ConfigFormat::Yaml => serde_yaml::to_string(self)?,
        };
        fs::write(&self.path, payload)?;
        Ok(())
    }
}

fn ensure_bootstrap_file(path: &Path) -> io::Result<bool> {
    if path.exists() {
        return Ok(false);
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    match OpenOptions::new().create_new(true).write(true).open(path) {
        Ok(mut file) => {
            let template = render_bootstrap_template();
            file.write_all(template.as_bytes())?;
            file.flush()?;
            #[cfg(unix)]
            {
                let mode = if path.starts_with("/etc/") { 0o640 } else { 0o600 };
                fs::set_permissions(path, PermissionsExt::from_mode(mode))?;
            }
            Ok(true)
        }
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EnvGuard {
        key: &'static str,
        prev: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: impl Into<String>) -> Self {
            let prev = env::var(key).ok();
            env::set_var(key, value.into());
            Self { key, prev }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            if let Some(prev) = &self.prev {
                env::set_var(self.key, prev);
            } else {
                env::remove_var(self.key);
            }
        }
    }

    #[test]
    fn bootstrap_template_parses_and_flags_placeholder() {
        let cfg: VirtkeepConfig = toml::from_str(&bootstrap_template()).expect("template parses");
        assert_eq!(cfg.archive.repository, PLACEHOLDER_REPOSITORY);
        assert_eq!(cfg.retention.keep_daily, 7);
        assert_eq!(cfg.snapshot.base_format, "qcow2");

        let issues = cfg.validate();
        assert!(issues
            .iter()
            .any(|issue| issue.contains("bootstrap placeholder")));
        assert!(cfg.require_repository().is_err());
    }

    #[test]
    fn lock_path_respects_env_override() {
        let config = VirtkeepConfig::default();

        let guard = EnvGuard::set(LOCK_PATH_ENV, "/tmp/override.lock");
        assert_eq!(config.lock_path(), PathBuf::from("/tmp/override.lock"));
        drop(guard);
        assert_eq!(config.lock_path(), PathBuf::from(default_lock_path()));
    }

    #[test]
    fn validate_reports_retention_and_root_issues() {
        let mut config = VirtkeepConfig::default();
        config.archive.repository = "/srv/backup/vms".to_string();
        assert!(config.validate().is_empty());

        config.retention.keep_daily = 0;
        config.retention.keep_weekly = 0;
        config.retention.keep_monthly = 0;
        config.source.image_roots = vec!["images".to_string()];
        config.snapshot.base_format = "qcow.2".to_string();

        let issues = config.validate();
        assert!(issues.iter().any(|issue| issue.contains("keeps nothing")));
        assert!(issues.iter().any(|issue| issue.contains("non-absolute")));
        assert!(issues.iter().any(|issue| issue.contains("base_format")));
    }

    #[test]
    fn image_root_validator_rejects_relative_paths() {
        assert!(looks_like_image_root("/var/lib/libvirt/images"));
        assert!(looks_like_image_root("/data"));

        assert!(!looks_like_image_root(""));
        assert!(!looks_like_image_root("images"));
        assert!(!looks_like_image_root("  "));
    }
}
