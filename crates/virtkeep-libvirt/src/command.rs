//! Execution wrapper for invoking `virsh`.
//!
//! The goal is to keep shell integration isolated so provider logic stays
//! testable (fake binaries, deterministic stdout parsing). Every invocation
//! blocks until the tool finishes; a missing exit code counts as failure.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use virtkeep_core::error::{BackupError, BackupResult};
use virtkeep_core::snapshot::SNAPSHOT_NAME;

#[derive(Debug, Clone)]
pub(crate) struct VirshCommand {
    binary: PathBuf,
    uri: Option<String>,
}

#[derive(Debug)]
struct Output {
    stdout: String,
    stderr: String,
    status: i32,
}

impl VirshCommand {
    pub(crate) fn new(binary: PathBuf, uri: Option<String>) -> Self {
        Self { binary, uri }
    }

    pub(crate) fn list_all(&self) -> BackupResult<String> {
        let out = self.run(&["list", "--all"])?;
        self.expect_success("list domains", out).map(|o| o.stdout)
    }

    pub(crate) fn domblklist(&self, domain: &str) -> BackupResult<String> {
        let out = self.run(&["domblklist", domain])?;
        self.expect_success(&format!("list block devices of `{domain}`"), out)
            .map(|o| o.stdout)
    }

    pub(crate) fn dumpxml(&self, domain: &str) -> BackupResult<Vec<u8>> {
        let out = self.run(&["dumpxml", domain])?;
        let out = self.expect_success(&format!("dump descriptor of `{domain}`"), out)?;
        Ok(out.stdout.into_bytes())
    }

    pub(crate) fn snapshot_create(
        &self,
        domain: &str,
        target: &str,
        overlay: &Path,
    ) -> BackupResult<()> {
        let diskspec = format!("{target},file={}", overlay.display());
        let out = self.run(&[
            "snapshot-create-as",
            "--domain",
            domain,
            SNAPSHOT_NAME,
            "--diskspec",
            &diskspec,
            "--disk-only",
            "--atomic",
            "--no-metadata",
        ])?;
        self.expect_success(
            &format!("create external snapshot on `{domain}` target `{target}`"),
            out,
        )
        .map(|_| ())
    }

    pub(crate) fn blockcommit(&self, domain: &str, target: &str) -> BackupResult<()> {
        let out = self.run(&[
            "blockcommit",
            domain,
            target,
            "--active",
            "--pivot",
            "--wait",
        ])?;
        self.expect_success(
            &format!("commit overlay on `{domain}` target `{target}`"),
            out,
        )
        .map(|_| ())
    }

    fn run(&self, args: &[&str]) -> BackupResult<Output> {
        let mut command = Command::new(&self.binary);
        if let Some(uri) = &self.uri {
            command.arg("--connect").arg(uri);
        }
        command.args(args);
        command.stdin(Stdio::null());

        let output = command.output()?;
        Ok(Output {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            status: output.status.code().unwrap_or(-1),
        })
    }

    fn expect_success(&self, action: &str, out: Output) -> BackupResult<Output> {
        if out.status == 0 {
            return Ok(out);
        }
        let message = classify_failure(action, &out);
        Err(BackupError::Provider(format!(
            "{message} (exit code {})",
            out.status
        )))
    }
}

fn classify_failure(action: &str, out: &Output) -> String {
    let diagnostic = output_diagnostic(out);
    let lower = diagnostic.to_ascii_lowercase();
    let diagnostic = if diagnostic.is_empty() {
        "no additional output".to_string()
    } else {
        diagnostic
    };

    if lower.contains("failed to get domain") || lower.contains("no domain with matching") {
        return format!(
            "virsh could not {action}: the domain is unknown to the hypervisor: {diagnostic}"
        );
    }

    if lower.contains("domain is not running") || lower.contains("requested operation is not valid")
    {
        return format!(
            "virsh could not {action}: the domain is not in a state that allows it: {diagnostic}"
        );
    }

    if lower.contains("permission denied")
        || lower.contains("authentication")
        || lower.contains("operation not permitted")
    {
        return format!(
            "virsh could not {action}: {diagnostic}. This usually requires access to the \
             system libvirt socket (run as root or a member of the libvirt group)"
        );
    }

    format!("virsh failed to {action}: {diagnostic}")
}

fn output_diagnostic(out: &Output) -> String {
    let stderr = out.stderr.trim();
    let stdout = out.stdout.trim();
    if !stderr.is_empty() {
        stderr.to_string()
    } else {
        stdout.to_string()
    }
}
