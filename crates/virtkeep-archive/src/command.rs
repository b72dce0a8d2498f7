//! Execution wrapper for invoking `borg`.
//!
//! Credentials and automation confirmations travel via the environment, the
//! way the tool expects them for unattended runs. Every invocation blocks to
//! completion and a missing exit code counts as failure.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use virtkeep_core::error::{BackupError, BackupResult};
use virtkeep_provider::archive::RetentionPolicy;

#[derive(Debug, Clone)]
pub(crate) struct BorgCommand {
    binary: PathBuf,
    repository: String,
    passphrase: Option<String>,
    unattended: bool,
}

#[derive(Debug)]
struct Output {
    stdout: String,
    stderr: String,
    status: i32,
}

impl BorgCommand {
    pub(crate) fn new(
        binary: PathBuf,
        repository: String,
        passphrase: Option<String>,
        unattended: bool,
    ) -> Self {
        Self {
            binary,
            repository,
            passphrase,
            unattended,
        }
    }

    pub(crate) fn set_passphrase(&mut self, passphrase: String) {
        self.passphrase = Some(passphrase);
    }

    pub(crate) fn create_from_path(&self, key: &str, source: &Path) -> BackupResult<()> {
        let entry = self.entry_spec(key);
        let source = source.to_string_lossy().into_owned();
        let out = self.run(&["create", &entry, &source], None)?;
        self.expect_success(&format!("create archive entry `{key}`"), out)
    }

    pub(crate) fn create_from_reader(
        &self,
        key: &str,
        source: &mut dyn Read,
    ) -> BackupResult<()> {
        let entry = self.entry_spec(key);
        let out = self.run(&["create", &entry, "-"], Some(source))?;
        self.expect_success(&format!("create archive entry `{key}`"), out)
    }

    pub(crate) fn prune(&self, key_glob: &str, policy: &RetentionPolicy) -> BackupResult<()> {
        let mut args = prune_args(key_glob, policy).ok_or_else(|| {
            BackupError::InvalidConfig(
                "retention keeps nothing; refusing to prune everything".to_string(),
            )
        })?;
        args.push(self.repository.clone());
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = self.run(&arg_refs, None)?;
        self.expect_success(&format!("prune entries matching `{key_glob}`"), out)
    }

    pub(crate) fn compact(&self) -> BackupResult<()> {
        let out = self.run(&["compact", &self.repository], None)?;
        self.expect_success("compact the repository", out)
    }

    fn entry_spec(&self, key: &str) -> String {
        format!("{}::{key}", self.repository)
    }

    fn run(&self, args: &[&str], input: Option<&mut dyn Read>) -> BackupResult<Output> {
        let mut command = Command::new(&self.binary);
        command.args(args);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        if let Some(passphrase) = &self.passphrase {
            command.env("BORG_PASSPHRASE", passphrase);
        }
        if self.unattended {
            command.env("BORG_UNKNOWN_UNENCRYPTED_REPO_ACCESS_IS_OK", "yes");
            command.env("BORG_RELOCATED_REPO_ACCESS_IS_OK", "yes");
        }

        let mut child = command.spawn()?;
        let stdout_handle = spawn_output_reader(child.stdout.take());
        let stderr_handle = spawn_output_reader(child.stderr.take());

        if let Some(payload) = input {
            if let Some(mut stdin) = child.stdin.take() {
                io::copy(payload, &mut stdin)?;
                stdin.flush().ok();
            }
        }

        let status = child.wait()?;
        let stdout = join_reader(stdout_handle)?;
        let stderr = join_reader(stderr_handle)?;

        Ok(Output {
            stdout,
            stderr,
            status: status.code().unwrap_or(-1),
        })
    }

    fn expect_success(&self, action: &str, out: Output) -> BackupResult<()> {
        if out.status == 0 {
            return Ok(());
        }
        let message = classify_failure(action, &out);
        Err(BackupError::Provider(format!(
            "{message} (exit code {})",
            out.status
        )))
    }
}

/// Build the prune invocation up to the repository argument, skipping zero
/// keep-counts. Returns `None` when every count is zero: such a prune would
/// delete the whole prefix.
pub(crate) fn prune_args(key_glob: &str, policy: &RetentionPolicy) -> Option<Vec<String>> {
    let mut args = vec![
        "prune".to_string(),
        "--glob-archives".to_string(),
        key_glob.to_string(),
    ];
    for (flag, count) in [
        ("--keep-daily", policy.keep_daily),
        ("--keep-weekly", policy.keep_weekly),
        ("--keep-monthly", policy.keep_monthly),
    ] {
        if count > 0 {
            args.push(flag.to_string());
            args.push(count.to_string());
        }
    }
    if args.len() == 3 {
        return None;
    }
    Some(args)
}

fn classify_failure(action: &str, out: &Output) -> String {
    let diagnostic = output_diagnostic(out);
    let lower = diagnostic.to_ascii_lowercase();
    let diagnostic = if diagnostic.is_empty() {
        "no additional output".to_string()
    } else {
        diagnostic
    };

    if lower.contains("passphrase") {
        return format!(
            "borg could not {action}: {diagnostic}. Check archive.passphrase_file against the \
             repository key"
        );
    }

    if lower.contains("does not exist") || lower.contains("is not a valid repository") {
        return format!(
            "borg could not {action}: the repository is missing or invalid: {diagnostic}. \
             Initialise it with `borg init` before the first run"
        );
    }

    if lower.contains("failed to create/acquire the lock") || lower.contains("lock.exclusive") {
        return format!(
            "borg could not {action}: the repository is locked by another process: {diagnostic}"
        );
    }

    format!("borg failed to {action}: {diagnostic}")
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

fn spawn_output_reader<R>(pipe: Option<R>) -> thread::JoinHandle<io::Result<String>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || -> io::Result<String> {
        if let Some(mut reader) = pipe {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf)?;
            Ok(String::from_utf8_lossy(&buf).to_string())
        } else {
            Ok(String::new())
        }
    })
}

fn join_reader(handle: thread::JoinHandle<io::Result<String>>) -> BackupResult<String> {
    handle
        .join()
        .map_err(|_| BackupError::Provider("output reader thread panicked".to_string()))?
        .map_err(BackupError::from)
}
