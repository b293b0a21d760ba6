use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::Stage;
use crate::utils::proc;

pub const SQUASHFS_MAGIC: [u8; 4] = *b"hsqs";

/// Unpacks a squashfs image into `dest` with the host unsquashfs tool.
/// `dest` must not already exist; unsquashfs refuses to merge trees.
pub fn extract(image: &Path, dest: &Path, remaining: Option<Duration>) -> Result<()> {
    info!("Unpacking squashfs {} -> {}", image.display(), dest.display());
    proc::run_tool(
        Stage::Extract,
        "unsquashfs",
        [
            "-no-progress".as_ref(),
            "-d".as_ref(),
            dest.as_os_str(),
            image.as_os_str(),
        ],
        remaining,
    )
    .with_context(|| format!("Failed to unpack squashfs: {}", image.display()))
}

/// Rebuilds a squashfs image from `tree`. Gzip compression and no
/// xattrs keeps the output loadable by older installer kernels.
pub fn pack(tree: &Path, image: &Path, remaining: Option<Duration>) -> Result<()> {
    info!("Packing squashfs {} -> {}", tree.display(), image.display());
    if image.exists() {
        std::fs::remove_file(image)
            .with_context(|| format!("Failed to remove stale image: {}", image.display()))?;
    }
    proc::run_tool(
        Stage::Assemble,
        "mksquashfs",
        [
            tree.as_os_str(),
            image.as_os_str(),
            "-noappend".as_ref(),
            "-comp".as_ref(),
            "gzip".as_ref(),
            "-no-xattrs".as_ref(),
            "-all-root".as_ref(),
            "-quiet".as_ref(),
        ],
        remaining,
    )
    .with_context(|| format!("Failed to pack squashfs: {}", image.display()))
}
