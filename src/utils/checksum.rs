use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::info;

/// Streaming SHA-256 of a file, hex encoded.
pub fn sha256_file(path: &Path) -> Result<String> {
    let file =
        File::open(path).with_context(|| format!("Failed to open file: {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let n = reader
            .read(&mut buffer)
            .with_context(|| format!("Failed to read file: {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Writes a `<file>.sha256` sidecar next to `path` in the two-space
/// format `sha256sum -c` accepts. Returns the sidecar path.
pub fn write_sidecar(path: &Path) -> Result<PathBuf> {
    let digest = sha256_file(path)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let sidecar = path.with_file_name(format!("{}.sha256", file_name));

    std::fs::write(&sidecar, format!("{}  {}\n", digest, file_name))
        .with_context(|| format!("Failed to write checksum file: {}", sidecar.display()))?;

    info!("Generated checksum file: {}", sidecar.display());
    Ok(sidecar)
}
