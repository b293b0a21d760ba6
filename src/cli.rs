use clap::{ArgAction, Parser};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "isograft")]
#[command(about = "Inject kernel modules and RPM packages into a bootable Linux ISO")]
#[command(version, disable_version_flag = true, long_about = None)]
pub struct Cli {
    /// Path to the source ISO image
    #[arg(long, value_name = "FILE")]
    pub iso: PathBuf,

    /// Directory containing .rpm packages to inject
    #[arg(long = "rpm-path", value_name = "DIR")]
    pub rpm_path: Option<PathBuf>,

    /// Directory containing .ko kernel modules to inject
    #[arg(long = "ko-path", value_name = "DIR")]
    pub ko_path: Option<PathBuf>,

    /// Scratch directory for extraction and repacking
    #[arg(long = "work-dir", value_name = "DIR")]
    pub work_dir: PathBuf,

    /// Directory the rebuilt ISO is written into
    #[arg(long, value_name = "DIR")]
    pub output: PathBuf,

    /// Target architecture of the image (x86_64, aarch64)
    #[arg(long, value_name = "ARCH", default_value = "x86_64")]
    pub arch: String,

    /// Kernel version to install modules for, overriding autodetection
    #[arg(long = "kernel-version", value_name = "VERSION")]
    pub kernel_version: Option<String>,

    /// Abort the run if it exceeds this many seconds
    #[arg(long = "timeout-secs", value_name = "SECS")]
    pub timeout_secs: Option<u64>,

    /// Keep the work directory after a successful run
    #[arg(long = "keep-work-dir")]
    pub keep_work_dir: bool,

    /// Enable debug logging
    #[arg(long)]
    pub verbose: bool,

    /// Print version information
    #[arg(short = 'v', long = "version", action = ArgAction::Version)]
    version: Option<bool>,
}
