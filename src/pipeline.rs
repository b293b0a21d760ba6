use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::archive::{self, iso9660::IsoImage, ArchiveFormat, BootImageKind};
use crate::artifact;
use crate::assemble;
use crate::boot;
use crate::config::RunConfig;
use crate::error::{GraftError, Stage};
use crate::merge;
use crate::plan;
use crate::preflight;
use crate::utils::fs as fsutil;

const LOCK_FILE: &str = ".isograft.lock";
const ISO_ROOT: &str = "iso-root";
const BOOT_ROOT: &str = "boot-root";

#[derive(Debug)]
pub struct Summary {
    pub output_iso: PathBuf,
    pub modules_injected: usize,
    pub rpms_injected: usize,
}

/// Exclusive work directory lease, held for the whole run. The lock
/// file stays behind after release; only the flock matters.
#[derive(Debug)]
struct WorkDirLock {
    file: File,
}

impl WorkDirLock {
    fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open lock file: {}", path.display()))?;
        file.try_lock_exclusive().map_err(|e| {
            if e.kind() == fs2::lock_contended_error().kind() {
                anyhow::Error::new(GraftError::WorkDirBusy {
                    dir: dir.to_path_buf(),
                })
            } else {
                anyhow::Error::new(e).context(format!("Failed to lock: {}", path.display()))
            }
        })?;
        debug!("Acquired work directory lock: {}", path.display());
        Ok(WorkDirLock { file })
    }
}

impl Drop for WorkDirLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

pub struct Pipeline {
    config: RunConfig,
}

impl Pipeline {
    pub fn new(config: RunConfig) -> Self {
        Pipeline { config }
    }

    /// Runs the whole injection: extract, locate, plan, merge,
    /// assemble. On failure the work directory is left as-is for
    /// inspection; on success its scratch trees are removed unless
    /// `--keep-work-dir` was given.
    pub fn run(&self) -> Result<Summary> {
        preflight::check_tools(preflight::ISO_TOOLS)?;
        let deadline = self.config.timeout.map(|t| Instant::now() + t);

        let lock = WorkDirLock::acquire(&self.config.work_dir)?;

        let iso = IsoImage::open(&self.config.iso)?;
        info!(
            "Source image: {} (volume '{}', {} MiB declared)",
            self.config.iso.display(),
            iso.volume_id,
            iso.declared_size() / (1024 * 1024)
        );
        self.check_space(&iso)?;

        let modules = match &self.config.ko_dir {
            Some(dir) => artifact::scan_modules(dir)?,
            None => Vec::new(),
        };
        let rpms = match &self.config.rpm_dir {
            Some(dir) => artifact::scan_rpms(dir)?,
            None => Vec::new(),
        };
        info!(
            "Artifacts: {} kernel module(s), {} RPM package(s)",
            modules.len(),
            rpms.len()
        );

        let iso_root = self.config.work_dir.join(ISO_ROOT);
        iso.extract_tree(&iso_root, remaining(deadline, Stage::Extract)?)?;

        remaining(deadline, Stage::Locate)?;
        let layout = boot::locate(&iso, &iso_root)?;

        let boot_image = if modules.is_empty() {
            None
        } else {
            Some(self.unpack_boot_image(&layout, &iso_root, deadline)?)
        };

        remaining(deadline, Stage::Plan)?;
        let plan = plan::build_plan(
            &modules,
            &rpms,
            boot_image.as_ref().map(|b| b.tree.as_path()),
            self.config.kernel_version.as_deref(),
        )?;

        remaining(deadline, Stage::Merge)?;
        merge::apply(&plan, &iso_root, boot_image.as_ref().map(|b| b.tree.as_path()))?;

        if let Some(boot_image) = &boot_image {
            archive::repack_boot_image(
                &boot_image.kind,
                &boot_image.tree,
                &boot_image.image,
                remaining(deadline, Stage::Assemble)?,
            )?;
        }

        let output_iso = assemble::assemble(
            &iso_root,
            &layout,
            &iso,
            &self.config.output_dir,
            &self.config.arch,
            remaining(deadline, Stage::Assemble)?,
        )?;

        drop(lock);
        if self.config.keep_work_dir {
            info!("Keeping work directory: {}", self.config.work_dir.display());
        } else {
            self.cleanup_scratch();
        }

        Ok(Summary {
            output_iso,
            modules_injected: plan.module_count,
            rpms_injected: plan.rpm_count,
        })
    }

    fn unpack_boot_image(
        &self,
        layout: &boot::BootLayout,
        iso_root: &Path,
        deadline: Option<Instant>,
    ) -> Result<UnpackedBootImage> {
        let initrd_rel = layout
            .initrd
            .clone()
            .ok_or(GraftError::BootImageNotFound)
            .context("kernel modules require an initrd reference in the loader config")?;
        let image = iso_root.join(&initrd_rel);

        if archive::sniff(&image)? == ArchiveFormat::Squashfs {
            preflight::check_tools(preflight::SQUASHFS_TOOLS)?;
        }

        let tree = self.config.work_dir.join(BOOT_ROOT);
        let kind = archive::unpack_boot_image(&image, &tree, remaining(deadline, Stage::Extract)?)?;
        Ok(UnpackedBootImage { kind, tree, image })
    }

    /// Both trees count: the extracted payload lands in the work
    /// directory, the rebuilt image in the output directory.
    fn check_space(&self, iso: &IsoImage) -> Result<()> {
        ensure_space(&self.config.work_dir, iso.declared_size())?;
        ensure_space(&self.config.output_dir, self.output_bytes_needed()?)
    }

    /// The rebuilt image is the source image plus everything injected,
    /// so the output estimate adds the artifact trees to the ISO size.
    fn output_bytes_needed(&self) -> Result<u64> {
        let mut needed = fs::metadata(&self.config.iso)
            .with_context(|| format!("Failed to stat: {}", self.config.iso.display()))?
            .len();
        let artifact_dirs = [self.config.rpm_dir.as_deref(), self.config.ko_dir.as_deref()];
        for dir in artifact_dirs.into_iter().flatten() {
            needed += fsutil::tree_size(dir)?;
        }
        Ok(needed)
    }

    fn cleanup_scratch(&self) {
        for name in [ISO_ROOT, BOOT_ROOT] {
            let path = self.config.work_dir.join(name);
            if path.exists() {
                if let Err(e) = fs::remove_dir_all(&path) {
                    warn!("Failed to clean up {}: {}", path.display(), e);
                }
            }
        }
        let _ = fs::remove_file(self.config.work_dir.join(LOCK_FILE));
    }
}

struct UnpackedBootImage {
    kind: BootImageKind,
    tree: PathBuf,
    image: PathBuf,
}

fn ensure_space(dir: &Path, needed: u64) -> Result<()> {
    let available = fsutil::available_space(dir)?;
    if available < needed {
        return Err(GraftError::Space {
            dir: dir.to_path_buf(),
            needed,
            available,
        }
        .into());
    }
    Ok(())
}

/// Time left before the run deadline, as a budget for the next stage.
/// An already-expired deadline aborts with that stage's timeout.
fn remaining(deadline: Option<Instant>, stage: Stage) -> Result<Option<Duration>> {
    match deadline {
        None => Ok(None),
        Some(deadline) => {
            let now = Instant::now();
            if now >= deadline {
                Err(GraftError::Timeout { stage }.into())
            } else {
                Ok(Some(deadline - now))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn second_lock_on_same_dir_is_busy() {
        let dir = TempDir::new().unwrap();
        let _first = WorkDirLock::acquire(dir.path()).unwrap();

        let err = WorkDirLock::acquire(dir.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GraftError>(),
            Some(GraftError::WorkDirBusy { .. })
        ));
    }

    #[test]
    fn lock_is_released_on_drop() {
        let dir = TempDir::new().unwrap();
        {
            let _lock = WorkDirLock::acquire(dir.path()).unwrap();
        }
        WorkDirLock::acquire(dir.path()).unwrap();
    }

    #[test]
    fn expired_deadline_reports_the_stage() {
        let deadline = Some(Instant::now() - Duration::from_secs(1));
        let err = remaining(deadline, Stage::Plan).unwrap_err();
        match err.downcast_ref::<GraftError>() {
            Some(GraftError::Timeout { stage }) => assert_eq!(*stage, Stage::Plan),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[test]
    fn live_deadline_yields_a_budget() {
        let deadline = Some(Instant::now() + Duration::from_secs(60));
        let budget = remaining(deadline, Stage::Extract).unwrap().unwrap();
        assert!(budget <= Duration::from_secs(60));
        assert!(budget > Duration::from_secs(50));
    }

    #[test]
    fn no_deadline_means_no_budget() {
        assert_eq!(remaining(None, Stage::Merge).unwrap(), None);
    }

    #[test]
    fn impossible_space_requirement_is_rejected() {
        let dir = TempDir::new().unwrap();
        let err = ensure_space(dir.path(), u64::MAX).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GraftError>(),
            Some(GraftError::Space { .. })
        ));
    }

    #[test]
    fn reasonable_space_requirement_passes() {
        let dir = TempDir::new().unwrap();
        ensure_space(dir.path(), 1).unwrap();
    }

    #[test]
    fn output_estimate_includes_injected_artifacts() {
        let dir = TempDir::new().unwrap();
        let iso = dir.path().join("source.iso");
        fs::write(&iso, vec![0u8; 100]).unwrap();
        let rpm_dir = dir.path().join("rpms");
        fs::create_dir_all(&rpm_dir).unwrap();
        fs::write(rpm_dir.join("a.rpm"), vec![0u8; 30]).unwrap();
        let ko_dir = dir.path().join("drivers");
        fs::create_dir_all(&ko_dir).unwrap();
        fs::write(ko_dir.join("igb.ko"), vec![0u8; 20]).unwrap();

        let pipeline = Pipeline::new(RunConfig {
            iso,
            rpm_dir: Some(rpm_dir),
            ko_dir: Some(ko_dir),
            work_dir: dir.path().join("work"),
            output_dir: dir.path().join("out"),
            arch: "x86_64".into(),
            kernel_version: None,
            timeout: None,
            keep_work_dir: false,
        });
        assert_eq!(pipeline.output_bytes_needed().unwrap(), 150);
    }
}
