use anyhow::Result;
use tracing::debug;

use crate::error::GraftError;

/// An external tool the pipeline shells out to, with the distro package
/// that provides it for the error message.
#[derive(Debug, Clone, Copy)]
pub struct Tool {
    pub command: &'static str,
    pub package: &'static str,
}

/// Needed by every run: tree extraction and final assembly.
pub const ISO_TOOLS: &[Tool] = &[Tool {
    command: "xorriso",
    package: "xorriso",
}];

/// Needed only when the boot image turns out to be a squashfs.
pub const SQUASHFS_TOOLS: &[Tool] = &[
    Tool {
        command: "unsquashfs",
        package: "squashfs-tools",
    },
    Tool {
        command: "mksquashfs",
        package: "squashfs-tools",
    },
];

pub fn command_exists(command: &str) -> bool {
    which::which(command).is_ok()
}

/// Verifies every tool is on PATH before any work starts, so a missing
/// host package cannot strand a half-finished work directory.
pub fn check_tools(tools: &[Tool]) -> Result<()> {
    for tool in tools {
        if !command_exists(tool.command) {
            return Err(GraftError::MissingTool {
                tool: tool.command.to_string(),
                package: tool.package.to_string(),
            }
            .into());
        }
        debug!("Found required tool: {}", tool.command);
    }
    Ok(())
}
