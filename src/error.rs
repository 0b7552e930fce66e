//! Error taxonomy for the provisioning pipeline and the emulator harness.
//!
//! Every error knows the phase it was raised in, so callers can report
//! "what failed" and "where" without matching on variants.

use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::Output;
use std::time::Duration;

use thiserror::Error;

use crate::esp::Step;
use crate::qemu::Terminal;

pub type Result<T, E = HarnessError> = std::result::Result<T, E>;

/// Boxed cause carried by provisioning failures.
pub type Cause = Box<dyn StdError + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    #[error("cannot allocate image {}: {source}", path.display())]
    Allocation {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot partition {}: {reason}", image.display())]
    Partition { image: PathBuf, reason: String },

    #[error(
        "partition node {} did not appear within {:?} after binding {}",
        node.display(),
        waited,
        loop_device.display()
    )]
    BindTimeout {
        loop_device: PathBuf,
        node: PathBuf,
        waited: Duration,
    },

    #[error("no loop device available (retry once one is released): {reason}")]
    BindUnavailable { reason: String },

    #[error("{} is already bound to {}", image.display(), loop_device.display())]
    BindConflict { image: PathBuf, loop_device: PathBuf },

    #[error("provisioning failed at step `{step}`: {source}")]
    Provisioning {
        step: Step,
        #[source]
        source: Cause,
    },

    #[error("emulator {terminal} after forwarding {serial_bytes} serial bytes")]
    EmulatorExit { terminal: Terminal, serial_bytes: u64 },

    #[error(transparent)]
    Tool(#[from] ToolFailure),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl HarnessError {
    /// Name of the pipeline phase that produced this error.
    pub fn phase(&self) -> &'static str {
        match self {
            HarnessError::Precondition(_) => "preconditions",
            HarnessError::Allocation { .. } => "allocate",
            HarnessError::Partition { .. } => "partition",
            HarnessError::BindTimeout { .. }
            | HarnessError::BindUnavailable { .. }
            | HarnessError::BindConflict { .. } => "bind",
            HarnessError::Provisioning { .. } => "provision",
            HarnessError::EmulatorExit { .. } => "emulator",
            HarnessError::Tool(_) => "tool",
            HarnessError::Io(_) => "io",
        }
    }

    /// Loop device exhaustion is the only failure a caller may sensibly retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HarnessError::BindUnavailable { .. })
    }

    pub(crate) fn provisioning(step: Step, source: impl Into<Cause>) -> Self {
        HarnessError::Provisioning {
            step,
            source: source.into(),
        }
    }
}

/// Detected before any side effect; aborts the invocation.
#[derive(Debug, Error)]
pub enum PreconditionError {
    #[error("required tool `{tool}` was not found\n{hint}")]
    MissingTool { tool: &'static str, hint: String },

    #[error("{what} not found: {}", path.display())]
    MissingInput { what: &'static str, path: PathBuf },
}

/// An external command exited unsuccessfully or could not be started.
#[derive(Debug, Error)]
pub struct ToolFailure {
    pub command: String,
    pub status: Option<i32>,
    pub stderr: String,
}

impl ToolFailure {
    pub(crate) fn from_output(command: String, output: &Output) -> Self {
        ToolFailure {
            command,
            status: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    }

    pub(crate) fn spawn(command: String, err: &io::Error) -> Self {
        ToolFailure {
            command,
            status: None,
            stderr: format!("failed to start: {err}"),
        }
    }
}

impl fmt::Display for ToolFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(code) => write!(f, "`{}` exited with status {code}", self.command)?,
            None => write!(f, "`{}` did not run to completion", self.command)?,
        }
        if !self.stderr.is_empty() {
            write!(f, ": {}", self.stderr)?;
        }
        Ok(())
    }
}
