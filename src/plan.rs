use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::artifact::{versions_compatible, KernelModule, RpmPackage};
use crate::error::GraftError;

/// Which extracted tree a step applies to: the ISO directory tree or
/// the unpacked boot image tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetTree {
    Outer,
    Boot,
}

/// One file placement, relative to its target tree root.
#[derive(Debug, Clone)]
pub struct CopyStep {
    pub source: PathBuf,
    pub dest: PathBuf,
    pub tree: TargetTree,
}

/// One keyed line upsert into a text manifest. Applying the same edit
/// twice leaves a single line for the key.
#[derive(Debug, Clone)]
pub struct ManifestEdit {
    pub tree: TargetTree,
    pub file: PathBuf,
    pub key: String,
    pub line: String,
}

#[derive(Debug, Default)]
pub struct InjectionPlan {
    pub copies: Vec<CopyStep>,
    pub edits: Vec<ManifestEdit>,
    /// Shell commands for the installer kickstart `%post` hook, one per
    /// staged package, so injected RPMs end up installed on the target.
    pub post_install: Vec<String>,
    pub module_count: usize,
    pub rpm_count: usize,
}

impl InjectionPlan {
    /// An empty plan turns the run into a plain repack of the image.
    pub fn is_empty(&self) -> bool {
        self.copies.is_empty() && self.edits.is_empty()
    }
}

pub const RPM_STAGING_DIR: &str = "extra-rpms";
pub const RPM_MANIFEST: &str = "extra-rpms/install-manifest.txt";
pub const MODULES_LOAD_CONF: &str = "etc/modules-load.d/extra-drivers.conf";

/// Builds the full plan for a run. `boot_tree` is the unpacked boot
/// image root and is required when kernel modules are present.
pub fn build_plan(
    modules: &[KernelModule],
    rpms: &[RpmPackage],
    boot_tree: Option<&Path>,
    explicit_kernel: Option<&str>,
) -> Result<InjectionPlan> {
    let mut plan = InjectionPlan::default();

    if !modules.is_empty() {
        let boot_tree = boot_tree
            .ok_or(GraftError::BootImageNotFound)
            .context("kernel modules require an unpacked boot image")?;
        plan_modules(modules, boot_tree, explicit_kernel, &mut plan)?;
    }
    plan_rpms(rpms, &mut plan);

    if plan.is_empty() {
        info!("Nothing to inject; the image will be repacked unchanged");
    } else {
        info!(
            "Planned {} file placement(s) and {} manifest edit(s)",
            plan.copies.len(),
            plan.edits.len()
        );
    }
    Ok(plan)
}

fn plan_modules(
    modules: &[KernelModule],
    boot_tree: &Path,
    explicit_kernel: Option<&str>,
    plan: &mut InjectionPlan,
) -> Result<()> {
    let prefix = module_prefix(boot_tree);
    let tree_versions = kernel_versions_in(&boot_tree.join(&prefix))?;
    debug!(
        "Boot tree module prefix {}, kernel versions {:?}",
        prefix.display(),
        tree_versions
    );

    for module in modules {
        let version = resolve_kernel_version(module, &tree_versions, explicit_kernel)?;
        let module_dir = prefix.join(&version);

        plan.copies.push(CopyStep {
            source: module.path.clone(),
            dest: module_dir.join("extra").join(&module.file_name),
            tree: TargetTree::Boot,
        });
        plan.edits.push(ManifestEdit {
            tree: TargetTree::Boot,
            file: PathBuf::from(MODULES_LOAD_CONF),
            key: module.name.clone(),
            line: module.name.clone(),
        });
        let dep_entry = format!("extra/{}:", module.file_name);
        plan.edits.push(ManifestEdit {
            tree: TargetTree::Boot,
            file: module_dir.join("modules.dep"),
            key: dep_entry.clone(),
            line: dep_entry,
        });
        plan.module_count += 1;
    }
    Ok(())
}

fn plan_rpms(rpms: &[RpmPackage], plan: &mut InjectionPlan) {
    for rpm in rpms {
        plan.copies.push(CopyStep {
            source: rpm.path.clone(),
            dest: Path::new(RPM_STAGING_DIR).join(&rpm.file_name),
            tree: TargetTree::Outer,
        });
        plan.edits.push(ManifestEdit {
            tree: TargetTree::Outer,
            file: PathBuf::from(RPM_MANIFEST),
            key: rpm.name.clone(),
            line: format!(
                "{} {}-{} {} {}",
                rpm.name, rpm.version, rpm.release, rpm.arch, rpm.file_name
            ),
        });
        // Anaconda mounts the install media at /run/install/repo.
        plan.post_install.push(format!(
            "rpm -ivh --nodeps /run/install/repo/{}/{}",
            RPM_STAGING_DIR, rpm.file_name
        ));
        plan.rpm_count += 1;
    }
}

/// Picks the kernel version directory a module installs into. An
/// explicit version always wins; otherwise the module's own vermagic,
/// then the tree's single version. Multiple candidates with no signal
/// from the module is an error rather than a guess.
fn resolve_kernel_version(
    module: &KernelModule,
    tree_versions: &[String],
    explicit: Option<&str>,
) -> Result<String> {
    if let Some(version) = explicit {
        if let Some(built_for) = &module.kernel_version {
            if !versions_compatible(built_for, version) {
                return Err(incompatible(module, built_for, version));
            }
        }
        return Ok(version.to_string());
    }

    if let Some(built_for) = &module.kernel_version {
        if tree_versions.iter().any(|v| v == built_for) {
            return Ok(built_for.clone());
        }
        if let Some(compatible) = tree_versions
            .iter()
            .find(|v| versions_compatible(built_for, v))
        {
            warn!(
                "{}: built for {}, installing into close tree version {}",
                module.file_name, built_for, compatible
            );
            return Ok(compatible.clone());
        }
        return match tree_versions.len() {
            // No module tree in the boot image; trust the vermagic.
            0 => Ok(built_for.clone()),
            1 => Err(incompatible(module, built_for, &tree_versions[0])),
            _ => Err(GraftError::AmbiguousKernelVersion {
                candidates: tree_versions.to_vec(),
            }
            .into()),
        };
    }

    match tree_versions.len() {
        0 => Err(GraftError::KernelVersionNotFound.into()),
        1 => Ok(tree_versions[0].clone()),
        _ => Err(GraftError::AmbiguousKernelVersion {
            candidates: tree_versions.to_vec(),
        }
        .into()),
    }
}

fn incompatible(module: &KernelModule, built_for: &str, provided: &str) -> anyhow::Error {
    GraftError::IncompatibleModule {
        module: module.file_name.clone(),
        built_for: built_for.to_string(),
        provided: provided.to_string(),
    }
    .into()
}

fn module_prefix(boot_tree: &Path) -> PathBuf {
    if boot_tree.join("usr/lib/modules").is_dir() {
        PathBuf::from("usr/lib/modules")
    } else {
        PathBuf::from("lib/modules")
    }
}

fn kernel_versions_in(modules_dir: &Path) -> Result<Vec<String>> {
    let mut versions = Vec::new();
    if !modules_dir.is_dir() {
        return Ok(versions);
    }
    for entry in fs::read_dir(modules_dir)
        .with_context(|| format!("Failed to read directory: {}", modules_dir.display()))?
    {
        let entry = entry
            .with_context(|| format!("Failed to read directory: {}", modules_dir.display()))?;
        if entry.path().is_dir() {
            versions.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    versions.sort();
    Ok(versions)
}
