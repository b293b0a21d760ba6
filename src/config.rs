use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::cli::Cli;
use crate::error::GraftError;

const SUPPORTED_ARCHES: &[&str] = &["x86_64", "aarch64"];

/// Validated run configuration. Every path has been checked against the
/// filesystem by the time this exists, so later stages can treat it as
/// trustworthy.
#[derive(Debug)]
pub struct RunConfig {
    pub iso: PathBuf,
    pub rpm_dir: Option<PathBuf>,
    pub ko_dir: Option<PathBuf>,
    pub work_dir: PathBuf,
    pub output_dir: PathBuf,
    pub arch: String,
    pub kernel_version: Option<String>,
    pub timeout: Option<Duration>,
    pub keep_work_dir: bool,
}

impl RunConfig {
    pub fn from_cli(cli: Cli) -> Result<Self> {
        if !cli.iso.is_file() {
            return Err(input(format!(
                "ISO image does not exist: {}",
                cli.iso.display()
            )));
        }

        if !SUPPORTED_ARCHES.contains(&cli.arch.as_str()) {
            return Err(input(format!(
                "unsupported arch '{}' (supported: {})",
                cli.arch,
                SUPPORTED_ARCHES.join(", ")
            )));
        }

        if let Some(dir) = &cli.rpm_path {
            check_artifact_dir(dir, "rpm")?;
        }
        if let Some(dir) = &cli.ko_path {
            check_artifact_dir(dir, "ko")?;
        }

        let timeout = match cli.timeout_secs {
            Some(0) => return Err(input("--timeout-secs must be greater than zero".into())),
            Some(secs) => Some(Duration::from_secs(secs)),
            None => None,
        };

        fs::create_dir_all(&cli.work_dir).with_context(|| {
            format!("Failed to create work directory: {}", cli.work_dir.display())
        })?;
        fs::create_dir_all(&cli.output).with_context(|| {
            format!("Failed to create output directory: {}", cli.output.display())
        })?;

        debug!(
            "Run configured: iso={}, arch={}, rpms={:?}, modules={:?}",
            cli.iso.display(),
            cli.arch,
            cli.rpm_path,
            cli.ko_path
        );

        Ok(RunConfig {
            iso: cli.iso,
            rpm_dir: cli.rpm_path,
            ko_dir: cli.ko_path,
            work_dir: cli.work_dir,
            output_dir: cli.output,
            arch: cli.arch,
            kernel_version: cli.kernel_version,
            timeout,
            keep_work_dir: cli.keep_work_dir,
        })
    }
}

/// An artifact directory must exist and hold at least one file with the
/// expected extension; an empty directory is almost always a mistyped
/// path.
fn check_artifact_dir(dir: &Path, extension: &str) -> Result<()> {
    if !dir.is_dir() {
        return Err(input(format!(
            "artifact directory does not exist: {}",
            dir.display()
        )));
    }
    let entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory: {}", dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("Failed to read directory: {}", dir.display()))?;
        let path = entry.path();
        if path.is_file() && path.extension().is_some_and(|e| e == extension) {
            return Ok(());
        }
    }
    Err(input(format!(
        "no .{} files in {}",
        extension,
        dir.display()
    )))
}

fn input(message: String) -> anyhow::Error {
    GraftError::Input(message).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tempfile::TempDir;

    fn base_cli(dir: &Path, extra: &[&str]) -> Cli {
        let iso = dir.join("in.iso");
        fs::write(&iso, b"iso").unwrap();
        let mut args = vec![
            "isograft".to_string(),
            "--iso".into(),
            iso.display().to_string(),
            "--work-dir".into(),
            dir.join("work").display().to_string(),
            "--output".into(),
            dir.join("out").display().to_string(),
        ];
        args.extend(extra.iter().map(|s| s.to_string()));
        Cli::parse_from(args)
    }

    #[test]
    fn valid_config_creates_work_and_output_dirs() {
        let dir = TempDir::new().unwrap();
        let config = RunConfig::from_cli(base_cli(dir.path(), &[])).unwrap();
        assert!(config.work_dir.is_dir());
        assert!(config.output_dir.is_dir());
        assert_eq!(config.arch, "x86_64");
        assert!(config.timeout.is_none());
    }

    #[test]
    fn missing_iso_is_an_input_error() {
        let dir = TempDir::new().unwrap();
        let mut cli = base_cli(dir.path(), &[]);
        cli.iso = dir.path().join("nope.iso");

        let err = RunConfig::from_cli(cli).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GraftError>(),
            Some(GraftError::Input(_))
        ));
    }

    #[test]
    fn unsupported_arch_is_rejected() {
        let dir = TempDir::new().unwrap();
        let err = RunConfig::from_cli(base_cli(dir.path(), &["--arch", "riscv64"])).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GraftError>(),
            Some(GraftError::Input(_))
        ));
    }

    #[test]
    fn empty_rpm_dir_is_rejected() {
        let dir = TempDir::new().unwrap();
        let rpms = dir.path().join("rpms");
        fs::create_dir_all(&rpms).unwrap();

        let err = RunConfig::from_cli(base_cli(
            dir.path(),
            &["--rpm-path", &rpms.display().to_string()],
        ))
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GraftError>(),
            Some(GraftError::Input(_))
        ));
    }

    #[test]
    fn populated_ko_dir_is_accepted() {
        let dir = TempDir::new().unwrap();
        let kos = dir.path().join("kos");
        fs::create_dir_all(&kos).unwrap();
        fs::write(kos.join("igb.ko"), b"x").unwrap();

        let config = RunConfig::from_cli(base_cli(
            dir.path(),
            &["--ko-path", &kos.display().to_string()],
        ))
        .unwrap();
        assert_eq!(config.ko_dir, Some(kos));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let dir = TempDir::new().unwrap();
        let err =
            RunConfig::from_cli(base_cli(dir.path(), &["--timeout-secs", "0"])).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GraftError>(),
            Some(GraftError::Input(_))
        ));
    }

    #[test]
    fn timeout_is_converted_to_duration() {
        let dir = TempDir::new().unwrap();
        let config =
            RunConfig::from_cli(base_cli(dir.path(), &["--timeout-secs", "600"])).unwrap();
        assert_eq!(config.timeout, Some(Duration::from_secs(600)));
    }
}
