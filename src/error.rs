use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Pipeline stages, in execution order. Used for timeout attribution
/// and log spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Preflight,
    Extract,
    Locate,
    Plan,
    Merge,
    Assemble,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Preflight => "preflight",
            Stage::Extract => "extract",
            Stage::Locate => "locate",
            Stage::Plan => "plan",
            Stage::Merge => "merge",
            Stage::Assemble => "assemble",
        };
        f.write_str(name)
    }
}

/// Error classes surfaced to the operator. Each class maps to a stable
/// process exit code so wrapper scripts can branch on the failure kind.
#[derive(Debug, Error)]
pub enum GraftError {
    #[error("invalid input: {0}")]
    Input(String),

    #[error("insufficient space in {}: need {needed} bytes, have {available}", .dir.display())]
    Space {
        dir: PathBuf,
        needed: u64,
        available: u64,
    },

    #[error("corrupt archive {}: {reason}", .path.display())]
    CorruptArchive { path: PathBuf, reason: String },

    #[error("unrecognized archive format: {}", .path.display())]
    UnsupportedFormat { path: PathBuf },

    #[error("cannot determine target kernel version (candidates: {candidates:?}); pass --kernel-version")]
    AmbiguousKernelVersion { candidates: Vec<String> },

    #[error("no kernel version directories in the boot image; pass --kernel-version")]
    KernelVersionNotFound,

    #[error("unsupported artifact {}: {reason}", .path.display())]
    UnsupportedArtifact { path: PathBuf, reason: String },

    #[error("module {module} was built for kernel {built_for}, target tree provides {provided}")]
    IncompatibleModule {
        module: String,
        built_for: String,
        provided: String,
    },

    #[error("merge step '{step}' failed: {reason}")]
    MergeFailed { step: String, reason: String },

    #[error("no boot catalog entry resolves to a file in the extracted tree")]
    BootImageNotFound,

    #[error("boot catalog verification failed on rebuilt image: {0}")]
    BootCatalogRebuildFailed(String),

    #[error("timed out during {stage} stage")]
    Timeout { stage: Stage },

    #[error("work directory {} is already in use by another run", .dir.display())]
    WorkDirBusy { dir: PathBuf },

    #[error("required tool '{tool}' not found on PATH (install {package})")]
    MissingTool { tool: String, package: String },
}

impl GraftError {
    /// Stable exit code for scripting. 1 is reserved for uncategorized
    /// failures and handled by the binary entry point.
    pub fn exit_code(&self) -> i32 {
        match self {
            GraftError::Input(_) => 2,
            GraftError::Space { .. } => 3,
            GraftError::CorruptArchive { .. } | GraftError::UnsupportedFormat { .. } => 4,
            GraftError::AmbiguousKernelVersion { .. }
            | GraftError::KernelVersionNotFound
            | GraftError::UnsupportedArtifact { .. }
            | GraftError::IncompatibleModule { .. } => 5,
            GraftError::MergeFailed { .. } => 6,
            GraftError::BootImageNotFound | GraftError::BootCatalogRebuildFailed(_) => 7,
            GraftError::Timeout { .. } => 8,
            GraftError::WorkDirBusy { .. } => 9,
            GraftError::MissingTool { .. } => 2,
        }
    }
}

/// Walks an anyhow error chain and returns the exit code of the first
/// `GraftError` found, or 1 if the failure is uncategorized.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<GraftError>())
        .map(GraftError::exit_code)
        .unwrap_or(1)
}
