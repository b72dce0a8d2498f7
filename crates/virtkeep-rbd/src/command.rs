//! Execution wrapper for invoking `rbd`.
//!
//! Control commands block until the tool finishes. Exports hand the child's
//! stdout to the caller as a stream; the exit status is observed when the
//! stream is finished, never assumed from EOF alone.

use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{ChildStderr, Command, Stdio};
use std::thread;
use virtkeep_core::error::{BackupError, BackupResult};
use virtkeep_provider::pool::ExportStream;

#[derive(Debug, Clone)]
pub(crate) struct RbdCommand {
    binary: PathBuf,
    id: Option<String>,
}

#[derive(Debug)]
struct Output {
    stdout: String,
    stderr: String,
    status: i32,
}

impl RbdCommand {
    pub(crate) fn new(binary: PathBuf, id: Option<String>) -> Self {
        Self { binary, id }
    }

    pub(crate) fn ls(&self, pool: &str) -> BackupResult<String> {
        let out = self.run(&["ls", pool])?;
        let out = self.expect_success(&format!("list images in pool `{pool}`"), out)?;
        Ok(out.stdout)
    }

    pub(crate) fn snap_create(&self, spec: &str) -> BackupResult<()> {
        let out = self.run(&["snap", "create", spec])?;
        self.expect_success(&format!("create snapshot `{spec}`"), out)
            .map(|_| ())
    }

    pub(crate) fn snap_ls(&self, spec: &str) -> BackupResult<String> {
        let out = self.run(&["snap", "ls", spec])?;
        let out = self.expect_success(&format!("list snapshots of `{spec}`"), out)?;
        Ok(out.stdout)
    }

    pub(crate) fn snap_rm(&self, spec: &str) -> BackupResult<()> {
        let out = self.run(&["snap", "rm", spec])?;
        self.expect_success(&format!("delete snapshot `{spec}`"), out)
            .map(|_| ())
    }

    /// Start `rbd export <spec> -` and hand back its stdout as a stream.
    pub(crate) fn export(&self, spec: &str) -> BackupResult<ExportStream> {
        let mut command = self.base_command();
        command.args(["export", spec, "-"]);
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let mut child = command.spawn()?;
        let stdout = child.stdout.take().ok_or_else(|| {
            BackupError::Provider("rbd export produced no stdout pipe".to_string())
        })?;
        let stderr_handle = spawn_stderr_reader(child.stderr.take());

        let spec = spec.to_string();
        let finish = move || -> io::Result<()> {
            let status = child.wait()?;
            let stderr = stderr_handle
                .join()
                .unwrap_or_else(|_| String::new());
            let code = status.code().unwrap_or(-1);
            if code != 0 {
                return Err(io::Error::other(format!(
                    "rbd export {spec} exited with code {code}: {}",
                    stderr.trim()
                )));
            }
            Ok(())
        };

        Ok(ExportStream::new(Box::new(stdout), Box::new(finish)))
    }

    fn base_command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        if let Some(id) = &self.id {
            command.arg("--id").arg(id);
        }
        command
    }

    fn run(&self, args: &[&str]) -> BackupResult<Output> {
        let mut command = self.base_command();
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

    if lower.contains("no such file or directory") || lower.contains("error opening image") {
        return format!("rbd could not {action}: the image or pool does not exist: {diagnostic}");
    }

    if lower.contains("permission denied") || lower.contains("operation not permitted") {
        return format!(
            "rbd could not {action}: {diagnostic}. Check the configured client id and its \
             cephx capabilities"
        );
    }

    format!("rbd failed to {action}: {diagnostic}")
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

fn spawn_stderr_reader(pipe: Option<ChildStderr>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        if let Some(mut reader) = pipe {
            let mut buf = Vec::new();
            let _ = reader.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).to_string()
        } else {
            String::new()
        }
    })
}
