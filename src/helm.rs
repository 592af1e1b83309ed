//! helm invocation
//!
//! Packaging and release operations shell out to the helm binary. The
//! [`HelmRunner`] trait abstracts that command execution for testability;
//! [`HelmCli`] is the real implementation.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::process::Command;
use tracing::debug;

/// Captured result of one helm invocation
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HelmOutput {
    /// Whether helm exited with status 0
    pub success: bool,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
}

impl HelmOutput {
    /// Successful invocation with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed invocation with the given stderr
    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Why helm could not be run to completion
#[derive(Debug, thiserror::Error)]
pub enum HelmError {
    /// The process could not be started
    #[error("failed to run helm: {0}")]
    Spawn(#[from] std::io::Error),

    /// The process did not finish in time and was killed
    #[error("helm timed out after {0:?}")]
    TimedOut(Duration),
}

/// Trait for running helm commands
///
/// Implementations run `helm <args>` and capture its output. A non-zero exit
/// is reported through [`HelmOutput::success`], not as an error.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HelmRunner: Send + Sync {
    /// Run helm with the given arguments
    async fn run(&self, args: Vec<String>) -> Result<HelmOutput, HelmError>;
}

/// helm runner that spawns the helm binary
pub struct HelmCli {
    binary: PathBuf,
    timeout: Duration,
}

impl HelmCli {
    /// Create a runner for the given binary with a per-invocation timeout
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }
}

#[async_trait]
impl HelmRunner for HelmCli {
    async fn run(&self, args: Vec<String>) -> Result<HelmOutput, HelmError> {
        debug!(binary = %self.binary.display(), ?args, "Running helm");

        let child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| HelmError::TimedOut(self.timeout))??;

        Ok(HelmOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
