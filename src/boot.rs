use anyhow::{Context, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::archive::iso9660::{CatalogEntry, IsoImage, PLATFORM_EFI};
use crate::error::GraftError;

/// Conventional locations of El Torito boot images inside an ISO tree,
/// by platform. Catalog entries only carry block addresses, which do
/// not survive extraction, so resolution goes through these paths.
const BIOS_CANDIDATES: &[&str] = &[
    "isolinux/isolinux.bin",
    "boot/isolinux/isolinux.bin",
    "syslinux/isolinux.bin",
    "boot/eltorito.img",
    "boot/grub/i386-pc/eltorito.img",
    "boot/grub2/i386-pc/eltorito.img",
];

const EFI_CANDIDATES: &[&str] = &[
    "images/efiboot.img",
    "EFI/BOOT/efiboot.img",
    "boot/efiboot.img",
    "efiboot.img",
    "boot/grub/efi.img",
];

const LOADER_CONFIGS: &[&str] = &[
    "isolinux/isolinux.cfg",
    "syslinux/syslinux.cfg",
    "isolinux.cfg",
    "boot/grub/grub.cfg",
    "boot/grub2/grub.cfg",
    "EFI/BOOT/grub.cfg",
];

/// A catalog entry paired with the tree file it resolves to.
#[derive(Debug, Clone)]
pub struct ResolvedEntry {
    pub entry: CatalogEntry,
    pub tree_path: PathBuf,
}

/// Everything the merge and assemble stages need to know about how the
/// image boots: resolved catalog entries plus the initrd the default
/// loader entry actually loads.
#[derive(Debug)]
pub struct BootLayout {
    pub entries: Vec<ResolvedEntry>,
    pub boot_catalog_path: Option<PathBuf>,
    pub kernel: Option<PathBuf>,
    pub initrd: Option<PathBuf>,
}

impl BootLayout {
    pub fn bios(&self) -> Option<&ResolvedEntry> {
        self.entries
            .iter()
            .find(|e| e.entry.platform_id != PLATFORM_EFI)
    }

    pub fn efi(&self) -> Option<&ResolvedEntry> {
        self.entries
            .iter()
            .find(|e| e.entry.platform_id == PLATFORM_EFI)
    }
}

/// Resolves the boot catalog of `iso` against the extracted `tree` and
/// parses the loader configs for the kernel/initrd pair used at boot.
/// Fails when no catalog entry resolves to an existing file.
pub fn locate(iso: &IsoImage, tree: &Path) -> Result<BootLayout> {
    let catalog = iso
        .boot_catalog
        .as_ref()
        .ok_or(GraftError::BootImageNotFound)
        .context("image has no El Torito boot record")?;

    let mut entries = Vec::new();
    let mut used = std::collections::HashSet::new();
    for entry in &catalog.entries {
        let candidates = if entry.platform_id == PLATFORM_EFI {
            EFI_CANDIDATES
        } else {
            BIOS_CANDIDATES
        };
        match pick_candidate(tree, candidates, entry, &used) {
            Some(rel) => {
                debug!(
                    "Catalog entry (platform {:#04x}) resolved to {}",
                    entry.platform_id,
                    rel.display()
                );
                used.insert(rel.clone());
                entries.push(ResolvedEntry {
                    entry: entry.clone(),
                    tree_path: rel,
                });
            }
            None => warn!(
                "Catalog entry (platform {:#04x}, lba {}) has no matching tree file",
                entry.platform_id, entry.load_rba
            ),
        }
    }

    if entries.is_empty() {
        return Err(GraftError::BootImageNotFound.into());
    }

    let boot_catalog_path = entries
        .iter()
        .find(|e| e.entry.platform_id != PLATFORM_EFI)
        .map(|e| {
            e.tree_path
                .parent()
                .unwrap_or_else(|| Path::new(""))
                .join("boot.cat")
        });

    let (kernel, initrd) = parse_loader_configs(tree)?;
    if let Some(initrd) = &initrd {
        info!("Default boot entry loads initrd {}", initrd.display());
    } else {
        warn!("No initrd reference found in loader configs");
    }

    Ok(BootLayout {
        entries,
        boot_catalog_path,
        kernel,
        initrd,
    })
}

/// Picks the tree file for one catalog entry. The catalog records how
/// many 512-byte virtual sectors the firmware loads, so a candidate
/// whose on-disk length matches that size wins over plain path order.
/// Files claimed by an earlier entry are skipped so two entries of the
/// same platform never resolve to the same image.
fn pick_candidate(
    tree: &Path,
    candidates: &[&str],
    entry: &CatalogEntry,
    used: &std::collections::HashSet<PathBuf>,
) -> Option<PathBuf> {
    let available: Vec<PathBuf> = candidates
        .iter()
        .map(PathBuf::from)
        .filter(|rel| !used.contains(rel) && tree.join(rel).is_file())
        .collect();

    let expected_len = u64::from(entry.sector_count) * 512;
    available
        .iter()
        .find(|rel| {
            tree.join(rel)
                .metadata()
                .is_ok_and(|m| m.len() == expected_len)
        })
        .or_else(|| available.first())
        .cloned()
}

/// Scans known loader config locations and returns the first kernel and
/// initrd references that resolve to files in the tree.
fn parse_loader_configs(tree: &Path) -> Result<(Option<PathBuf>, Option<PathBuf>)> {
    // isolinux: "append initrd=..." and "kernel vmlinuz"; grub:
    // "initrd /path" and "linux /path", with optional efi suffixes.
    let initrd_re = Regex::new(r"(?m)^\s*(?:append\s.*?\binitrd=|initrd(?:efi)?\s+)(\S+)")
        .context("invalid initrd pattern")?;
    let kernel_re = Regex::new(r"(?m)^\s*(?:kernel|linux(?:efi)?)\s+(\S+)")
        .context("invalid kernel pattern")?;

    let mut kernel = None;
    let mut initrd = None;

    for config in LOADER_CONFIGS {
        let config_path = tree.join(config);
        if !config_path.is_file() {
            continue;
        }
        let text = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read loader config: {}", config_path.display()))?;
        let config_dir = Path::new(config).parent().unwrap_or_else(|| Path::new(""));

        if initrd.is_none() {
            initrd = initrd_re
                .captures_iter(&text)
                .filter_map(|c| resolve_ref(tree, config_dir, &c[1]))
                .next();
        }
        if kernel.is_none() {
            kernel = kernel_re
                .captures_iter(&text)
                .filter_map(|c| resolve_ref(tree, config_dir, &c[1]))
                .next();
        }
        if initrd.is_some() && kernel.is_some() {
            break;
        }
    }

    Ok((kernel, initrd))
}

/// Loader paths are either absolute from the ISO root or relative to
/// the config file's directory.
fn resolve_ref(tree: &Path, config_dir: &Path, reference: &str) -> Option<PathBuf> {
    let trimmed = reference.trim_start_matches('/');
    let from_root = PathBuf::from(trimmed);
    if tree.join(&from_root).is_file() {
        return Some(from_root);
    }
    let from_config = config_dir.join(trimmed);
    if tree.join(&from_config).is_file() {
        return Some(from_config);
    }
    None
}
