use anyhow::{bail, Context, Result};
use cpio::newc::{self, Builder, ModeFileType};
use cpio::NewcReader;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::GraftError;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const NEWC_MAGIC: [u8; 6] = *b"070701";
const NEWC_CRC_MAGIC: [u8; 6] = *b"070702";

const S_IFMT: u32 = 0o170000;
const S_IFIFO: u32 = 0o010000;
const S_IFCHR: u32 = 0o020000;
const S_IFDIR: u32 = 0o040000;
const S_IFBLK: u32 = 0o060000;
const S_IFREG: u32 = 0o100000;
const S_IFLNK: u32 = 0o120000;
const S_IFSOCK: u32 = 0o140000;

/// Outer compression detected on an initrd, reapplied on repack so the
/// rebuilt image matches what the bootloader config expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    None,
}

/// An archive entry that cannot be materialized as a plain file, held
/// in memory so repacking can re-emit it verbatim. Losing /dev/console
/// from an initrd breaks early boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecialEntry {
    pub name: String,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev_major: u32,
    pub rdev_minor: u32,
}

/// What extraction learned about the archive beyond its file tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnpackedInitrd {
    pub compression: Compression,
    pub specials: Vec<SpecialEntry>,
}

/// Unpacks a (possibly gzip-wrapped) newc cpio archive into `dest` and
/// reports the compression and special entries found.
pub fn extract(archive: &Path, dest: &Path) -> Result<UnpackedInitrd> {
    let mut file = File::open(archive)
        .with_context(|| format!("Failed to open initrd: {}", archive.display()))?;
    let mut magic = [0u8; 6];
    file.read_exact(&mut magic)
        .map_err(|_| corrupt(archive, "file too short for archive magic"))?;
    file.seek(SeekFrom::Start(0))
        .with_context(|| format!("Failed to rewind: {}", archive.display()))?;

    fs::create_dir_all(dest)
        .with_context(|| format!("Failed to create directory: {}", dest.display()))?;

    let (compression, specials) = if magic[..2] == GZIP_MAGIC {
        info!("Unpacking gzip initrd {}", archive.display());
        let specials = unpack(GzDecoder::new(BufReader::new(file)), dest, archive)?;
        (Compression::Gzip, specials)
    } else if magic == NEWC_MAGIC || magic == NEWC_CRC_MAGIC {
        info!("Unpacking uncompressed initrd {}", archive.display());
        let specials = unpack(BufReader::new(file), dest, archive)?;
        (Compression::None, specials)
    } else {
        return Err(GraftError::UnsupportedFormat {
            path: archive.to_path_buf(),
        }
        .into());
    };

    Ok(UnpackedInitrd {
        compression,
        specials,
    })
}

/// Packs `tree` into a newc archive at `dest`, reapplying `compression`
/// and re-emitting `specials` recorded at extraction. Entries go out in
/// sorted order with fixed inode numbers and a zero mtime, so packing
/// the same tree twice yields identical bytes.
pub fn pack(
    tree: &Path,
    dest: &Path,
    compression: Compression,
    specials: &[SpecialEntry],
) -> Result<()> {
    info!("Packing initrd tree {} -> {}", tree.display(), dest.display());
    let out = File::create(dest)
        .with_context(|| format!("Failed to create initrd: {}", dest.display()))?;

    match compression {
        Compression::Gzip => {
            let encoder = GzEncoder::new(BufWriter::new(out), flate2::Compression::new(6));
            let encoder = pack_entries(tree, encoder, specials)?;
            let mut inner = encoder.finish().context("Failed to finish gzip stream")?;
            inner.flush().context("Failed to flush initrd")?;
        }
        Compression::None => {
            let mut writer = pack_entries(tree, BufWriter::new(out), specials)?;
            writer.flush().context("Failed to flush initrd")?;
        }
    }
    Ok(())
}

fn unpack<R: Read>(mut stream: R, dest: &Path, archive: &Path) -> Result<Vec<SpecialEntry>> {
    let mut count = 0usize;
    let mut specials = Vec::new();
    // GNU cpio and dracut store hardlink data only on the final name of
    // an inode group; earlier names arrive with a zero size. Groups are
    // keyed by archive inode until their data entry shows up.
    let mut pending: HashMap<u32, (u32, Vec<PathBuf>)> = HashMap::new();
    let mut seen_data: HashMap<u32, PathBuf> = HashMap::new();

    loop {
        let mut entry_reader = NewcReader::new(stream)
            .map_err(|e| corrupt(archive, &format!("bad cpio header: {}", e)))?;
        let entry = entry_reader.entry();
        if entry.is_trailer() {
            break;
        }

        let name = entry.name().to_string();
        let mode = entry.mode();
        let ino = entry.ino();
        let nlink = entry.nlink();
        let file_size = entry.file_size();
        let (uid, gid) = (entry.uid(), entry.gid());
        let rdev = (entry.rdev_major(), entry.rdev_minor());
        if name != "." {
            let rel = sanitize_entry_name(&name)
                .ok_or_else(|| corrupt(archive, &format!("unsafe entry path: {}", name)))?;
            let target = dest.join(rel);

            match mode & S_IFMT {
                S_IFDIR => {
                    fs::create_dir_all(&target).with_context(|| {
                        format!("Failed to create directory: {}", target.display())
                    })?;
                    fs::set_permissions(&target, fs::Permissions::from_mode(mode & 0o7777))
                        .with_context(|| format!("Failed to chmod: {}", target.display()))?;
                }
                S_IFREG if nlink > 1 && file_size == 0 => {
                    if let Some(existing) = seen_data.get(&ino) {
                        ensure_parent(&target)?;
                        fs::hard_link(existing, &target)
                            .with_context(|| format!("Failed to link: {}", target.display()))?;
                    } else {
                        pending
                            .entry(ino)
                            .or_insert_with(|| (mode, Vec::new()))
                            .1
                            .push(target);
                    }
                }
                S_IFREG => {
                    ensure_parent(&target)?;
                    let mut out = File::create(&target)
                        .with_context(|| format!("Failed to create: {}", target.display()))?;
                    io::copy(&mut entry_reader, &mut out)
                        .map_err(|e| corrupt(archive, &format!("short entry {}: {}", name, e)))?;
                    fs::set_permissions(&target, fs::Permissions::from_mode(mode & 0o7777))
                        .with_context(|| format!("Failed to chmod: {}", target.display()))?;
                    if nlink > 1 {
                        if let Some((_, names)) = pending.remove(&ino) {
                            for link in names {
                                ensure_parent(&link)?;
                                fs::hard_link(&target, &link).with_context(|| {
                                    format!("Failed to link: {}", link.display())
                                })?;
                            }
                        }
                        seen_data.insert(ino, target);
                    }
                }
                S_IFLNK => {
                    let mut link = Vec::new();
                    entry_reader
                        .read_to_end(&mut link)
                        .map_err(|e| corrupt(archive, &format!("short symlink {}: {}", name, e)))?;
                    ensure_parent(&target)?;
                    let link_target = PathBuf::from(std::ffi::OsStr::from_bytes(&link));
                    std::os::unix::fs::symlink(&link_target, &target)
                        .with_context(|| format!("Failed to symlink: {}", target.display()))?;
                }
                S_IFCHR | S_IFBLK | S_IFIFO | S_IFSOCK => {
                    debug!("Recording special entry {} (mode {:o})", name, mode);
                    specials.push(SpecialEntry {
                        name,
                        mode,
                        uid,
                        gid,
                        rdev_major: rdev.0,
                        rdev_minor: rdev.1,
                    });
                }
                other => {
                    warn!("Dropping entry {} of unknown type {:o}", name, other);
                }
            }
            count += 1;
        }

        stream = entry_reader
            .finish()
            .map_err(|e| corrupt(archive, &format!("bad entry padding: {}", e)))?;
    }

    // Groups whose data entry never appeared are genuinely empty files.
    for (_, (mode, names)) in pending {
        let mut names = names.into_iter();
        if let Some(first) = names.next() {
            ensure_parent(&first)?;
            File::create(&first)
                .with_context(|| format!("Failed to create: {}", first.display()))?;
            fs::set_permissions(&first, fs::Permissions::from_mode(mode & 0o7777))
                .with_context(|| format!("Failed to chmod: {}", first.display()))?;
            for link in names {
                ensure_parent(&link)?;
                fs::hard_link(&first, &link)
                    .with_context(|| format!("Failed to link: {}", link.display()))?;
            }
        }
    }

    debug!("Unpacked {} entries from {}", count, archive.display());
    Ok(specials)
}

enum PackItem {
    Tree(String, PathBuf, fs::Metadata),
    Special(SpecialEntry),
}

impl PackItem {
    fn name(&self) -> &str {
        match self {
            PackItem::Tree(name, _, _) => name,
            PackItem::Special(special) => &special.name,
        }
    }
}

fn pack_entries<W: Write>(tree: &Path, mut writer: W, specials: &[SpecialEntry]) -> Result<W> {
    let mut items = Vec::new();
    let mut tree_names = HashSet::new();
    for entry in WalkDir::new(tree).min_depth(1).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to walk: {}", tree.display()))?;
        let rel = entry
            .path()
            .strip_prefix(tree)
            .context("walked entry outside tree root")?;
        let name = rel.to_string_lossy().into_owned();
        let meta = entry
            .metadata()
            .with_context(|| format!("Failed to stat: {}", entry.path().display()))?;
        tree_names.insert(name.clone());
        items.push(PackItem::Tree(name, entry.into_path(), meta));
    }
    for special in specials {
        if tree_names.contains(&special.name) {
            warn!(
                "Tree entry shadows recorded special entry {}; keeping the tree entry",
                special.name
            );
            continue;
        }
        items.push(PackItem::Special(special.clone()));
    }
    items.sort_by(|a, b| a.name().cmp(b.name()));

    // Hardlinked files share one archive inode and carry their data on
    // the last name only, matching how GNU cpio writes them.
    let mut group_sizes: HashMap<(u64, u64), u32> = HashMap::new();
    for item in &items {
        if let PackItem::Tree(_, _, meta) = item {
            if meta.is_file() && meta.nlink() > 1 {
                *group_sizes.entry((meta.dev(), meta.ino())).or_insert(0) += 1;
            }
        }
    }
    group_sizes.retain(|_, count| *count > 1);
    let mut group_left = group_sizes.clone();
    let mut group_inos: HashMap<(u64, u64), u32> = HashMap::new();

    let mut next_ino = 1u32;
    for item in &items {
        match item {
            PackItem::Special(special) => {
                let file_type = match special.mode & S_IFMT {
                    S_IFIFO => ModeFileType::Fifo,
                    S_IFCHR => ModeFileType::Char,
                    S_IFBLK => ModeFileType::Block,
                    _ => ModeFileType::Socket,
                };
                let ino = next_ino;
                next_ino = next_ino.wrapping_add(1);
                writer = Builder::new(&special.name)
                    .ino(ino)
                    .uid(special.uid)
                    .gid(special.gid)
                    .mtime(0)
                    .mode(special.mode & 0o7777)
                    .set_mode_file_type(file_type)
                    .rdev_major(special.rdev_major)
                    .rdev_minor(special.rdev_minor)
                    .nlink(1)
                    .write(writer, 0)
                    .finish()
                    .with_context(|| format!("Failed to write entry: {}", special.name))?;
            }
            PackItem::Tree(name, path, meta) => {
                let perms = meta.permissions().mode() & 0o7777;
                let file_type = meta.file_type();

                if file_type.is_dir() {
                    let ino = next_ino;
                    next_ino = next_ino.wrapping_add(1);
                    writer = Builder::new(name)
                        .ino(ino)
                        .uid(0)
                        .gid(0)
                        .mtime(0)
                        .mode(perms)
                        .set_mode_file_type(ModeFileType::Directory)
                        .nlink(2)
                        .write(writer, 0)
                        .finish()
                        .with_context(|| format!("Failed to write entry: {}", name))?;
                } else if file_type.is_symlink() {
                    let link = fs::read_link(path)
                        .with_context(|| format!("Failed to read link: {}", path.display()))?;
                    let bytes = link.as_os_str().as_bytes();
                    let ino = next_ino;
                    next_ino = next_ino.wrapping_add(1);
                    let mut entry_writer = Builder::new(name)
                        .ino(ino)
                        .uid(0)
                        .gid(0)
                        .mtime(0)
                        .mode(perms)
                        .set_mode_file_type(ModeFileType::Symlink)
                        .nlink(1)
                        .write(writer, bytes.len() as u32);
                    entry_writer
                        .write_all(bytes)
                        .with_context(|| format!("Failed to write entry: {}", name))?;
                    writer = entry_writer
                        .finish()
                        .with_context(|| format!("Failed to write entry: {}", name))?;
                } else if file_type.is_file() {
                    if meta.len() > u32::MAX as u64 {
                        bail!("{} is too large for a newc archive", path.display());
                    }
                    let key = (meta.dev(), meta.ino());
                    let (ino, nlink, carries_data) = match group_sizes.get(&key) {
                        Some(&total) => {
                            let ino = *group_inos.entry(key).or_insert_with(|| {
                                let ino = next_ino;
                                next_ino = next_ino.wrapping_add(1);
                                ino
                            });
                            let left = group_left
                                .get_mut(&key)
                                .context("hardlink group accounting out of sync")?;
                            *left -= 1;
                            (ino, total, *left == 0)
                        }
                        None => {
                            let ino = next_ino;
                            next_ino = next_ino.wrapping_add(1);
                            (ino, 1, true)
                        }
                    };
                    let builder = Builder::new(name)
                        .ino(ino)
                        .uid(0)
                        .gid(0)
                        .mtime(0)
                        .mode(perms)
                        .set_mode_file_type(ModeFileType::Regular)
                        .nlink(nlink);
                    if carries_data {
                        let mut source = File::open(path)
                            .with_context(|| format!("Failed to open: {}", path.display()))?;
                        let mut entry_writer = builder.write(writer, meta.len() as u32);
                        io::copy(&mut source, &mut entry_writer)
                            .with_context(|| format!("Failed to write entry: {}", name))?;
                        writer = entry_writer
                            .finish()
                            .with_context(|| format!("Failed to write entry: {}", name))?;
                    } else {
                        writer = builder
                            .write(writer, 0)
                            .finish()
                            .with_context(|| format!("Failed to write entry: {}", name))?;
                    }
                }
            }
        }
    }

    newc::trailer(writer).context("Failed to write cpio trailer")
}

fn ensure_parent(target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

/// Rejects absolute names and parent traversal, and strips a leading
/// `./` so entries land under the destination root.
fn sanitize_entry_name(name: &str) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if clean.as_os_str().is_empty() {
        None
    } else {
        Some(clean)
    }
}

fn corrupt(path: &Path, reason: &str) -> GraftError {
    GraftError::CorruptArchive {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}
