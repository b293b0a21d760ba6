use anyhow::{Context, Result};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::archive::iso9660::IsoImage;
use crate::boot::BootLayout;
use crate::error::{GraftError, Stage};
use crate::utils::{checksum, proc};

/// Builds the final ISO from the patched tree. The image is written to
/// a temporary file in the output directory and renamed into place only
/// after its boot catalog has been re-parsed and verified, so a crashed
/// or failed run never leaves a half-written output behind.
pub fn assemble(
    tree: &Path,
    layout: &BootLayout,
    source: &IsoImage,
    output_dir: &Path,
    arch: &str,
    remaining: Option<Duration>,
) -> Result<PathBuf> {
    let file_name = output_file_name(&source.path, tree, arch);
    let final_path = output_dir.join(&file_name);
    if paths_alias(&final_path, &source.path) {
        return Err(GraftError::Input(format!(
            "output {} would overwrite the source image",
            final_path.display()
        ))
        .into());
    }

    let staging = tempfile::Builder::new()
        .prefix(".isograft-")
        .suffix(".iso.tmp")
        .tempfile_in(output_dir)
        .with_context(|| format!("Failed to create staging file in {}", output_dir.display()))?;

    let volume_id = sanitize_volume_id(&source.volume_id);
    info!(
        "Assembling {} (volume '{}') from {}",
        final_path.display(),
        volume_id,
        tree.display()
    );

    let args = mkisofs_args(tree, layout, &volume_id, staging.path());
    proc::run_tool(Stage::Assemble, "xorriso", &args, remaining)
        .context("ISO assembly failed")?;

    let rebuilt = IsoImage::open(staging.path()).map_err(|e| {
        GraftError::BootCatalogRebuildFailed(format!("rebuilt image is unreadable: {:#}", e))
    })?;
    verify_boot_chain(&rebuilt, layout)?;

    staging
        .persist(&final_path)
        .with_context(|| format!("Failed to move output into place: {}", final_path.display()))?;

    checksum::write_sidecar(&final_path)?;
    Ok(final_path)
}

fn mkisofs_args(
    tree: &Path,
    layout: &BootLayout,
    volume_id: &str,
    output: &Path,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "-as".into(),
        "mkisofs".into(),
        "-quiet".into(),
        "-R".into(),
        "-J".into(),
        "-joliet-long".into(),
        "-V".into(),
        volume_id.into(),
        "-o".into(),
        output.as_os_str().to_os_string(),
    ];

    if let Some(bios) = layout.bios() {
        args.push("-b".into());
        args.push(bios.tree_path.as_os_str().to_os_string());
        if let Some(catalog) = &layout.boot_catalog_path {
            args.push("-c".into());
            args.push(catalog.as_os_str().to_os_string());
        }
        args.push("-no-emul-boot".into());
        args.push("-boot-load-size".into());
        args.push("4".into());
        args.push("-boot-info-table".into());
    }
    if let Some(efi) = layout.efi() {
        if layout.bios().is_some() {
            args.push("-eltorito-alt-boot".into());
        }
        args.push("-e".into());
        args.push(efi.tree_path.as_os_str().to_os_string());
        args.push("-no-emul-boot".into());
    }

    args.push(tree.as_os_str().to_os_string());
    debug!("mkisofs arguments: {:?}", args);
    args
}

/// The rebuilt catalog must carry a bootable entry for every platform
/// the source image booted, with sane geometry.
fn verify_boot_chain(rebuilt: &IsoImage, expected: &BootLayout) -> Result<()> {
    let catalog = rebuilt.boot_catalog.as_ref().ok_or_else(|| {
        GraftError::BootCatalogRebuildFailed("rebuilt image has no boot catalog".into())
    })?;

    for entry in &catalog.entries {
        if entry.bootable && entry.load_rba >= rebuilt.volume_space_sectors {
            return Err(GraftError::BootCatalogRebuildFailed(format!(
                "entry for platform {:#04x} points past the volume ({} >= {})",
                entry.platform_id, entry.load_rba, rebuilt.volume_space_sectors
            ))
            .into());
        }
        if entry.bootable && entry.sector_count == 0 {
            return Err(GraftError::BootCatalogRebuildFailed(format!(
                "entry for platform {:#04x} has a zero sector count",
                entry.platform_id
            ))
            .into());
        }
    }

    for wanted in &expected.entries {
        let platform = wanted.entry.platform_id;
        if !catalog
            .entries
            .iter()
            .any(|e| e.bootable && e.platform_id == platform)
        {
            return Err(GraftError::BootCatalogRebuildFailed(format!(
                "no bootable entry for platform {:#04x}",
                platform
            ))
            .into());
        }
    }

    debug!(
        "Rebuilt boot catalog verified: {} entries",
        catalog.entries.len()
    );
    Ok(())
}

/// `<name>-<version>-<arch>.iso` when the tree carries a .treeinfo
/// identity, otherwise `<source-stem>-graft.iso`.
pub fn output_file_name(source_iso: &Path, tree: &Path, arch: &str) -> String {
    if let Some((name, version)) = read_treeinfo_identity(&tree.join(".treeinfo")) {
        return format!("{}-{}-{}.iso", slugify(&name), slugify(&version), arch);
    }
    let stem = source_iso
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    format!("{}-graft.iso", stem)
}

/// Minimal INI scan of the `[general]` section of a .treeinfo file.
fn read_treeinfo_identity(path: &Path) -> Option<(String, String)> {
    let text = std::fs::read_to_string(path).ok()?;
    let mut in_general = false;
    let mut name = None;
    let mut version = None;
    for line in text.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            in_general = line == "[general]";
            continue;
        }
        if !in_general {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            match key.trim() {
                "name" => name = Some(value.trim().to_string()),
                "version" => version = Some(value.trim().to_string()),
                _ => {}
            }
        }
    }
    Some((name?, version?))
}

fn slugify(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect::<String>()
        .trim_matches('-')
        .to_string()
}

/// ISO 9660 volume identifiers: up to 32 characters from [A-Z0-9_].
fn sanitize_volume_id(id: &str) -> String {
    let mut out: String = id
        .to_uppercase()
        .chars()
        .map(|c| {
            if c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    out.truncate(32);
    if out.is_empty() {
        out.push_str("ISOGRAFT");
    }
    out
}

fn paths_alias(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(x), Ok(y)) => x == y,
        _ => a == b,
    }
}
