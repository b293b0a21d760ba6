use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

/// Bytes available to unprivileged writes on the filesystem holding `path`.
#[cfg(unix)]
pub fn available_space(path: &Path) -> Result<u64> {
    let stat = nix::sys::statvfs::statvfs(path)
        .with_context(|| format!("Failed to statvfs: {}", path.display()))?;
    Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}

#[cfg(not(unix))]
pub fn available_space(_path: &Path) -> Result<u64> {
    Ok(u64::MAX)
}

/// Adds the owner write bit across a tree. ISO filesystems carry
/// read-only permissions, which would otherwise block in-place patching
/// of the extracted copy.
#[cfg(unix)]
pub fn make_tree_writable(root: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    debug!("Making extracted tree writable: {}", root.display());
    for entry in WalkDir::new(root) {
        let entry = entry.with_context(|| format!("Failed to walk: {}", root.display()))?;
        let meta = entry
            .metadata()
            .with_context(|| format!("Failed to stat: {}", entry.path().display()))?;
        if meta.file_type().is_symlink() {
            continue;
        }
        let mode = meta.permissions().mode();
        let wanted = if meta.is_dir() {
            mode | 0o300
        } else {
            mode | 0o200
        };
        if wanted != mode {
            fs::set_permissions(entry.path(), fs::Permissions::from_mode(wanted))
                .with_context(|| format!("Failed to chmod: {}", entry.path().display()))?;
        }
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn make_tree_writable(_root: &Path) -> Result<()> {
    Ok(())
}

/// Copies a single file, creating parent directories and carrying the
/// source permission bits over.
pub fn copy_file(source: &Path, dest: &Path) -> Result<u64> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::copy(source, dest).with_context(|| {
        format!(
            "Failed to copy {} to {}",
            source.display(),
            dest.display()
        )
    })
}

/// Total on-disk size of all regular files under `root` (or of `root`
/// itself when it is a file).
pub fn tree_size(root: &Path) -> Result<u64> {
    let mut total = 0u64;
    for entry in WalkDir::new(root) {
        let entry = entry.with_context(|| format!("Failed to walk: {}", root.display()))?;
        if entry.file_type().is_file() {
            total += entry
                .metadata()
                .with_context(|| format!("Failed to stat: {}", entry.path().display()))?
                .len();
        }
    }
    Ok(total)
}
