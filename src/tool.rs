//! Running external utilities (parted, mkfs.fat, losetup, ...).

use std::process::{Command, Output, Stdio};

use tracing::debug;

use crate::error::ToolFailure;

/// Run `cmd` to completion and fail unless it exits successfully.
pub fn run(cmd: &mut Command) -> Result<Output, ToolFailure> {
    let line = describe(cmd);
    debug!(command = %line, "running");

    let output = cmd
        .stdin(Stdio::null())
        .output()
        .map_err(|e| ToolFailure::spawn(line.clone(), &e))?;

    if !output.status.success() {
        return Err(ToolFailure::from_output(line, &output));
    }
    Ok(output)
}

/// Render a command the way a user would type it.
pub fn describe(cmd: &Command) -> String {
    let mut line = cmd.get_program().to_string_lossy().into_owned();
    for arg in cmd.get_args() {
        line.push(' ');
        line.push_str(&arg.to_string_lossy());
    }
    line
}
