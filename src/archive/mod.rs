pub mod initrd;
pub mod iso9660;
pub mod squashfs;

use anyhow::{Context, Result};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use crate::error::GraftError;

/// Container formats the pipeline can open. Detection is by magic
/// bytes, never by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Iso9660,
    InitrdGzip,
    InitrdCpio,
    Squashfs,
}

pub fn sniff(path: &Path) -> Result<ArchiveFormat> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to open: {}", path.display()))?;
    let mut head = [0u8; 6];
    let n = file
        .read(&mut head)
        .with_context(|| format!("Failed to read: {}", path.display()))?;

    if n >= 4 && head[..4] == squashfs::SQUASHFS_MAGIC {
        return Ok(ArchiveFormat::Squashfs);
    }
    if n >= 2 && head[..2] == [0x1f, 0x8b] {
        return Ok(ArchiveFormat::InitrdGzip);
    }
    if n >= 6 && (&head == b"070701" || &head == b"070702") {
        return Ok(ArchiveFormat::InitrdCpio);
    }

    // ISO 9660 keeps its signature at the start of sector 16.
    use std::io::{Seek, SeekFrom};
    let mut sig = [0u8; 6];
    if file.seek(SeekFrom::Start(16 * iso9660::SECTOR_SIZE)).is_ok()
        && file.read_exact(&mut sig).is_ok()
        && sig[1..6] == *b"CD001"
    {
        return Ok(ArchiveFormat::Iso9660);
    }

    Err(GraftError::UnsupportedFormat {
        path: path.to_path_buf(),
    }
    .into())
}

/// How an unpacked boot image must be reassembled, carrying whatever
/// extraction learned that the tree alone cannot represent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootImageKind {
    Initrd(initrd::UnpackedInitrd),
    Squashfs,
}

/// Unpacks a boot image (initrd or squashfs) into `dest` and reports
/// how to repack it.
pub fn unpack_boot_image(
    image: &Path,
    dest: &Path,
    remaining: Option<Duration>,
) -> Result<BootImageKind> {
    match sniff(image)? {
        ArchiveFormat::InitrdGzip | ArchiveFormat::InitrdCpio => {
            let unpacked = initrd::extract(image, dest)?;
            Ok(BootImageKind::Initrd(unpacked))
        }
        ArchiveFormat::Squashfs => {
            squashfs::extract(image, dest, remaining)?;
            Ok(BootImageKind::Squashfs)
        }
        ArchiveFormat::Iso9660 => Err(GraftError::UnsupportedArtifact {
            path: image.to_path_buf(),
            reason: "nested ISO images are not patchable boot images".into(),
        }
        .into()),
    }
}

/// Rewrites `image` in place from the patched `tree`.
pub fn repack_boot_image(
    kind: &BootImageKind,
    tree: &Path,
    image: &Path,
    remaining: Option<Duration>,
) -> Result<()> {
    match kind {
        BootImageKind::Initrd(unpacked) => {
            initrd::pack(tree, image, unpacked.compression, &unpacked.specials)
        }
        BootImageKind::Squashfs => squashfs::pack(tree, image, remaining),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn sniffs_gzip_and_cpio_and_squashfs() {
        let dir = TempDir::new().unwrap();

        let gz = dir.path().join("a.img");
        std::fs::write(&gz, [0x1f, 0x8b, 0x08, 0x00]).unwrap();
        assert_eq!(sniff(&gz).unwrap(), ArchiveFormat::InitrdGzip);

        let cpio = dir.path().join("b.img");
        std::fs::write(&cpio, b"070701rest").unwrap();
        assert_eq!(sniff(&cpio).unwrap(), ArchiveFormat::InitrdCpio);

        let sq = dir.path().join("c.img");
        std::fs::write(&sq, b"hsqs....").unwrap();
        assert_eq!(sniff(&sq).unwrap(), ArchiveFormat::Squashfs);
    }

    #[test]
    fn sniffs_iso_by_sector_16_signature() {
        let dir = TempDir::new().unwrap();
        let iso = dir.path().join("d.iso");
        iso9660::tests::write_synthetic_iso(&iso, "SNIFF");
        assert_eq!(sniff(&iso).unwrap(), ArchiveFormat::Iso9660);
    }

    #[test]
    fn unknown_bytes_are_unsupported() {
        let dir = TempDir::new().unwrap();
        let blob = dir.path().join("e.bin");
        std::fs::write(&blob, b"zzzzzzzz").unwrap();
        let err = sniff(&blob).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GraftError>(),
            Some(GraftError::UnsupportedFormat { .. })
        ));
    }
}
