use anyhow::{Context, Result};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{GraftError, Stage};
use crate::utils::{fs as fsutil, proc};

pub const SECTOR_SIZE: u64 = 2048;

const VD_PRIMARY: u8 = 1;
const VD_BOOT_RECORD: u8 = 0;
const VD_TERMINATOR: u8 = 255;
const EL_TORITO_ID: &[u8] = b"EL TORITO SPECIFICATION";

pub const PLATFORM_X86: u8 = 0x00;
pub const PLATFORM_EFI: u8 = 0xEF;

/// One resolved El Torito catalog entry (the default entry or a section
/// entry). `sector_count` is in 512-byte virtual sectors, `load_rba` in
/// 2048-byte ISO sectors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub platform_id: u8,
    pub bootable: bool,
    pub media_type: u8,
    pub load_segment: u16,
    pub sector_count: u16,
    pub load_rba: u32,
}

#[derive(Debug, Clone)]
pub struct BootCatalog {
    pub lba: u32,
    pub entries: Vec<CatalogEntry>,
}

/// Parsed identity of an ISO 9660 image: primary volume descriptor
/// fields plus the El Torito boot catalog when the image carries one.
#[derive(Debug)]
pub struct IsoImage {
    pub path: PathBuf,
    pub volume_id: String,
    pub volume_space_sectors: u32,
    pub boot_catalog: Option<BootCatalog>,
}

impl IsoImage {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)
            .with_context(|| format!("Failed to open ISO: {}", path.display()))?;

        let mut volume_id = None;
        let mut volume_space_sectors = 0u32;
        let mut catalog_lba = None;

        // Volume descriptors start at sector 16 and run until the
        // set terminator.
        for lba in 16u64.. {
            let sector = read_sector(&mut file, lba)
                .map_err(|_| corrupt(path, "truncated volume descriptor set"))?;
            if sector[1..6] != *b"CD001" {
                return Err(corrupt(path, "missing CD001 descriptor signature").into());
            }
            match sector[0] {
                VD_PRIMARY => {
                    volume_id = Some(decode_str(&sector[40..72]));
                    volume_space_sectors =
                        u32::from_le_bytes([sector[80], sector[81], sector[82], sector[83]]);
                }
                VD_BOOT_RECORD => {
                    if sector[7..7 + EL_TORITO_ID.len()] == *EL_TORITO_ID {
                        catalog_lba = Some(u32::from_le_bytes([
                            sector[71], sector[72], sector[73], sector[74],
                        ]));
                    }
                }
                VD_TERMINATOR => break,
                _ => {}
            }
            // A descriptor set longer than this is not a real image.
            if lba > 16 + 64 {
                return Err(corrupt(path, "unterminated volume descriptor set").into());
            }
        }

        let volume_id = volume_id.ok_or_else(|| corrupt(path, "no primary volume descriptor"))?;

        let boot_catalog = match catalog_lba {
            Some(lba) => {
                let sector = read_sector(&mut file, lba as u64)
                    .map_err(|_| corrupt(path, "boot catalog points past end of image"))?;
                Some(BootCatalog {
                    lba,
                    entries: parse_catalog(&sector).map_err(|reason| corrupt(path, &reason))?,
                })
            }
            None => None,
        };

        debug!(
            "Parsed ISO {}: volume '{}', {} sectors, {} boot entries",
            path.display(),
            volume_id,
            volume_space_sectors,
            boot_catalog.as_ref().map_or(0, |c| c.entries.len())
        );

        Ok(IsoImage {
            path: path.to_path_buf(),
            volume_id,
            volume_space_sectors,
            boot_catalog,
        })
    }

    /// Uncompressed payload size the volume descriptor declares. Used
    /// for the up-front work directory space check.
    pub fn declared_size(&self) -> u64 {
        self.volume_space_sectors as u64 * SECTOR_SIZE
    }

    /// Extracts the full directory tree into `dest` and lifts the
    /// read-only permission bits the ISO filesystem imposes.
    pub fn extract_tree(&self, dest: &Path, remaining: Option<Duration>) -> Result<()> {
        info!("Extracting ISO tree to {}", dest.display());
        std::fs::create_dir_all(dest)
            .with_context(|| format!("Failed to create directory: {}", dest.display()))?;

        proc::run_tool(
            Stage::Extract,
            "xorriso",
            [
                "-report_about".as_ref(),
                "SORRY".as_ref(),
                "-osirrox".as_ref(),
                "on".as_ref(),
                "-indev".as_ref(),
                self.path.as_os_str(),
                "-extract".as_ref(),
                "/".as_ref(),
                dest.as_os_str(),
            ],
            remaining,
        )
        .context("ISO tree extraction failed")?;

        fsutil::make_tree_writable(dest)
    }
}

fn read_sector(file: &mut File, lba: u64) -> std::io::Result<[u8; SECTOR_SIZE as usize]> {
    let mut buf = [0u8; SECTOR_SIZE as usize];
    file.seek(SeekFrom::Start(lba * SECTOR_SIZE))?;
    file.read_exact(&mut buf)?;
    Ok(buf)
}

fn corrupt(path: &Path, reason: &str) -> GraftError {
    GraftError::CorruptArchive {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

fn decode_str(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches([' ', '\0'])
        .to_string()
}

/// Parses the 2048-byte boot catalog sector: validation entry, default
/// entry, then optional section headers with their entries.
fn parse_catalog(sector: &[u8]) -> std::result::Result<Vec<CatalogEntry>, String> {
    let validation = &sector[0..32];
    if validation[0] != 0x01 {
        return Err("boot catalog validation entry has wrong header id".into());
    }
    if validation[30] != 0x55 || validation[31] != 0xAA {
        return Err("boot catalog validation entry has wrong key bytes".into());
    }
    let mut sum = 0u16;
    for word in validation.chunks_exact(2) {
        sum = sum.wrapping_add(u16::from_le_bytes([word[0], word[1]]));
    }
    if sum != 0 {
        return Err("boot catalog validation entry checksum mismatch".into());
    }

    let mut entries = vec![parse_entry(&sector[32..64], validation[1])];

    let mut offset = 64;
    while offset + 32 <= sector.len() {
        let record = &sector[offset..offset + 32];
        offset += 32;
        match record[0] {
            0x90 | 0x91 => {
                let platform = record[1];
                let count = u16::from_le_bytes([record[2], record[3]]) as usize;
                for _ in 0..count {
                    if offset + 32 > sector.len() {
                        return Err("boot catalog section entry past end of sector".into());
                    }
                    entries.push(parse_entry(&sector[offset..offset + 32], platform));
                    offset += 32;
                }
                if record[0] == 0x91 {
                    break;
                }
            }
            _ => break,
        }
    }

    Ok(entries)
}

fn parse_entry(record: &[u8], platform_id: u8) -> CatalogEntry {
    CatalogEntry {
        platform_id,
        bootable: record[0] == 0x88,
        media_type: record[1] & 0x0F,
        load_segment: u16::from_le_bytes([record[2], record[3]]),
        sector_count: u16::from_le_bytes([record[6], record[7]]),
        load_rba: u32::from_le_bytes([record[8], record[9], record[10], record[11]]),
    }
}
