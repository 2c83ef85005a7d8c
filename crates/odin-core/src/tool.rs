//! External authoritative tool invocation.
//!
//! Wraps the pre-existing flashing utility preferred over the raw
//! protocol. A non-zero exit, spawn failure or timeout all surface as
//! [`ToolError`]; the orchestrator absorbs every one of them and moves
//! on to the next strategy.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

/// Timeout for metadata-class invocations (print-pit, reboot).
pub const METADATA_TIMEOUT: Duration = Duration::from_secs(20);
/// Timeout for pulling the PIT off the device.
pub const PIT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);
/// Timeout for dump/flash/erase invocations.
pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("failed to spawn {tool}: {source}")]
    Spawn {
        tool: String,
        source: std::io::Error,
    },

    #[error("{tool} exited with status {code}: {stderr}")]
    Failed {
        tool: String,
        code: i32,
        stderr: String,
    },

    #[error("{tool} timed out after {seconds}s")]
    TimedOut { tool: String, seconds: u64 },
}

/// Handle to the external flashing tool.
///
/// The path is resolved once (injected or looked up on PATH) and passed
/// explicitly; there is no ambient lookup at call sites.
#[derive(Debug, Clone)]
pub struct HeimdallTool {
    path: PathBuf,
}

impl HeimdallTool {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Look the tool up on PATH. Absence is not an error, just a signal
    /// that every operation will use the raw protocol.
    pub fn locate() -> Option<Self> {
        which::which("heimdall").ok().map(|path| Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pretty-print an on-disk PIT file, trying the `--pit <path>` form
    /// first and the bare-path form some builds expect second.
    pub fn print_pit_file(&self, pit_path: &Path) -> Result<String, ToolError> {
        let mut cmd = self.command();
        cmd.arg("print-pit").arg("--pit").arg(pit_path);
        match self.run(cmd, METADATA_TIMEOUT) {
            Ok(output) => Ok(output),
            Err(first) => {
                debug!(error = %first, "print-pit --pit form failed, trying bare path");
                let mut cmd = self.command();
                cmd.arg("print-pit").arg(pit_path);
                self.run(cmd, METADATA_TIMEOUT).map_err(|_| first)
            }
        }
    }

    /// Pull the device PIT to `output`.
    pub fn download_pit(&self, output: &Path) -> Result<(), ToolError> {
        let mut cmd = self.command();
        cmd.arg("download-pit").arg("--output").arg(output);
        self.run(cmd, PIT_DOWNLOAD_TIMEOUT).map(|_| ())
    }

    /// Dump a partition to `output`.
    pub fn dump(&self, partition: &str, output: &Path) -> Result<(), ToolError> {
        let mut cmd = self.command();
        cmd.arg("dump").arg(partition).arg("--output").arg(output);
        self.run(cmd, TRANSFER_TIMEOUT).map(|_| ())
    }

    /// Flash a file to a partition.
    pub fn flash(&self, partition: &str, input: &Path) -> Result<(), ToolError> {
        let mut cmd = self.command();
        cmd.arg("flash").arg(partition).arg(input);
        self.run(cmd, TRANSFER_TIMEOUT).map(|_| ())
    }

    /// Erase a partition.
    pub fn erase(&self, partition: &str) -> Result<(), ToolError> {
        let mut cmd = self.command();
        cmd.arg("erase").arg(partition);
        self.run(cmd, TRANSFER_TIMEOUT).map(|_| ())
    }

    /// Reboot the device out of download mode.
    pub fn reboot(&self) -> Result<(), ToolError> {
        let mut cmd = self.command();
        cmd.arg("reboot");
        self.run(cmd, METADATA_TIMEOUT).map(|_| ())
    }

    fn command(&self) -> Command {
        Command::new(&self.path)
    }

    /// Run a prepared invocation with a deadline, killing on overrun.
    /// Returns captured stdout on a zero exit.
    fn run(&self, mut cmd: Command, timeout: Duration) -> Result<String, ToolError> {
        let tool = self.path.display().to_string();
        debug!(%tool, ?cmd, "invoking external tool");

        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ToolError::Spawn {
                tool: tool.clone(),
                source,
            })?;

        let deadline = Instant::now() + timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        warn!(%tool, seconds = timeout.as_secs(), "external tool timed out");
                        return Err(ToolError::TimedOut {
                            tool,
                            seconds: timeout.as_secs(),
                        });
                    }
                    thread::sleep(Duration::from_millis(50));
                }
                Err(source) => return Err(ToolError::Spawn { tool, source }),
            }
        };

        let mut stdout = String::new();
        if let Some(mut out) = child.stdout.take() {
            let _ = out.read_to_string(&mut stdout);
        }

        if status.success() {
            Ok(stdout)
        } else {
            let mut stderr = String::new();
            if let Some(mut err) = child.stderr.take() {
                let _ = err.read_to_string(&mut stderr);
            }
            Err(ToolError::Failed {
                tool,
                code: status.code().unwrap_or(-1),
                stderr: stderr.trim().to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_exit_is_success() {
        let tool = HeimdallTool::new("true");
        tool.reboot().unwrap();
    }

    #[test]
    fn test_nonzero_exit_is_failure() {
        let tool = HeimdallTool::new("false");
        let err = tool.reboot().unwrap_err();
        assert!(matches!(err, ToolError::Failed { code: 1, .. }));
    }

    #[test]
    fn test_missing_binary_is_spawn_error() {
        let tool = HeimdallTool::new("/nonexistent/flashing-tool");
        let err = tool.reboot().unwrap_err();
        assert!(matches!(err, ToolError::Spawn { .. }));
    }

    #[test]
    fn test_deadline_kills_and_reports_timeout() {
        let tool = HeimdallTool::new("sleep");
        let mut cmd = tool.command();
        cmd.arg("5");
        let err = tool.run(cmd, Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, ToolError::TimedOut { .. }));
    }
}
