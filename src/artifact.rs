use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::GraftError;

const RPM_LEAD_MAGIC: [u8; 4] = [0xed, 0xab, 0xee, 0xdb];
const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

/// A kernel module staged for injection. `kernel_version` is the first
/// vermagic token when the module carries one.
#[derive(Debug, Clone)]
pub struct KernelModule {
    pub path: PathBuf,
    pub file_name: String,
    pub name: String,
    pub kernel_version: Option<String>,
}

/// An RPM package staged for injection, with the header fields the
/// install manifest records.
#[derive(Debug, Clone)]
pub struct RpmPackage {
    pub path: PathBuf,
    pub file_name: String,
    pub name: String,
    pub version: String,
    pub release: String,
    pub arch: String,
}

/// Scans a directory for `.ko` files, sorted by file name so plans are
/// deterministic.
pub fn scan_modules(dir: &Path) -> Result<Vec<KernelModule>> {
    let mut modules = Vec::new();
    for path in sorted_files_with_extension(dir, "ko")? {
        modules.push(inspect_module(&path)?);
    }
    Ok(modules)
}

/// Scans a directory for `.rpm` files, sorted by file name.
pub fn scan_rpms(dir: &Path) -> Result<Vec<RpmPackage>> {
    let mut packages = Vec::new();
    for path in sorted_files_with_extension(dir, "rpm")? {
        packages.push(inspect_rpm(&path)?);
    }
    Ok(packages)
}

fn inspect_module(path: &Path) -> Result<KernelModule> {
    let data =
        fs::read(path).with_context(|| format!("Failed to read module: {}", path.display()))?;
    if data.len() < 4 || data[..4] != ELF_MAGIC {
        return Err(unsupported(path, "not an ELF object"));
    }

    let elf = goblin::elf::Elf::parse(&data)
        .map_err(|e| unsupported(path, &format!("unparseable ELF: {}", e)))?;

    let mut kernel_version = None;
    for header in &elf.section_headers {
        if elf.shdr_strtab.get_at(header.sh_name) != Some(".modinfo") {
            continue;
        }
        let start = header.sh_offset as usize;
        let end = start.saturating_add(header.sh_size as usize);
        let section = data
            .get(start..end)
            .ok_or_else(|| unsupported(path, "modinfo section out of bounds"))?;
        for field in section.split(|b| *b == 0) {
            let field = String::from_utf8_lossy(field);
            if let Some(value) = field.strip_prefix("vermagic=") {
                kernel_version = value.split_whitespace().next().map(str::to_string);
            }
        }
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = file_name.trim_end_matches(".ko").to_string();

    if kernel_version.is_none() {
        warn!("{}: no vermagic in .modinfo", path.display());
    }
    debug!(
        "Module {}: name={}, kernel={:?}",
        path.display(),
        name,
        kernel_version
    );

    Ok(KernelModule {
        path: path.to_path_buf(),
        file_name,
        name,
        kernel_version,
    })
}

fn inspect_rpm(path: &Path) -> Result<RpmPackage> {
    let mut lead = [0u8; 4];
    {
        use std::io::Read;
        let mut file = fs::File::open(path)
            .with_context(|| format!("Failed to open package: {}", path.display()))?;
        file.read_exact(&mut lead)
            .map_err(|_| unsupported(path, "file too short for an RPM lead"))?;
    }
    if lead != RPM_LEAD_MAGIC {
        return Err(unsupported(path, "missing RPM lead magic"));
    }

    let package = rpm::Package::open(path)
        .map_err(|e| unsupported(path, &format!("unparseable RPM header: {}", e)))?;
    let metadata = &package.metadata;

    let name = metadata
        .get_name()
        .map_err(|e| unsupported(path, &format!("no package name: {}", e)))?
        .to_string();
    let version = metadata
        .get_version()
        .map_err(|e| unsupported(path, &format!("no package version: {}", e)))?
        .to_string();
    let release = metadata
        .get_release()
        .map_err(|e| unsupported(path, &format!("no package release: {}", e)))?
        .to_string();
    let arch = metadata
        .get_arch()
        .map_err(|e| unsupported(path, &format!("no package arch: {}", e)))?
        .to_string();

    debug!(
        "Package {}: {}-{}-{}.{}",
        path.display(),
        name,
        version,
        release,
        arch
    );

    Ok(RpmPackage {
        path: path.to_path_buf(),
        file_name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        name,
        version,
        release,
        arch,
    })
}

fn sorted_files_with_extension(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    let entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory: {}", dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("Failed to read directory: {}", dir.display()))?;
        let path = entry.path();
        if path.is_file() && path.extension().is_some_and(|e| e == extension) {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

fn unsupported(path: &Path, reason: &str) -> anyhow::Error {
    GraftError::UnsupportedArtifact {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
    .into()
}

/// True when two kernel versions agree on major.minor. Patch level and
/// distro build suffix are allowed to differ.
pub fn versions_compatible(a: &str, b: &str) -> bool {
    match (major_minor(a), major_minor(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

fn major_minor(version: &str) -> Option<(u64, u64)> {
    let mut parts = version.split(['.', '-']);
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Hand-assembled relocatable ELF64 with only a .modinfo section,
    /// enough for section-header parsing.
    pub(crate) fn write_minimal_ko(path: &Path, modinfo: &[u8]) {
        let shstrtab: &[u8] = b"\0.modinfo\0.shstrtab\0";
        let modinfo_off = 64u64;
        let shstrtab_off = modinfo_off + modinfo.len() as u64;
        let mut shoff = shstrtab_off + shstrtab.len() as u64;
        shoff += (8 - shoff % 8) % 8;

        let mut data = Vec::new();
        data.extend_from_slice(&ELF_MAGIC);
        data.extend_from_slice(&[2, 1, 1, 0]); // 64-bit, LE, current
        data.extend_from_slice(&[0u8; 8]);
        data.extend_from_slice(&1u16.to_le_bytes()); // ET_REL
        data.extend_from_slice(&62u16.to_le_bytes()); // EM_X86_64
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(&0u64.to_le_bytes()); // e_entry
        data.extend_from_slice(&0u64.to_le_bytes()); // e_phoff
        data.extend_from_slice(&shoff.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes()); // e_flags
        data.extend_from_slice(&64u16.to_le_bytes()); // e_ehsize
        data.extend_from_slice(&0u16.to_le_bytes()); // e_phentsize
        data.extend_from_slice(&0u16.to_le_bytes()); // e_phnum
        data.extend_from_slice(&64u16.to_le_bytes()); // e_shentsize
        data.extend_from_slice(&3u16.to_le_bytes()); // e_shnum
        data.extend_from_slice(&2u16.to_le_bytes()); // e_shstrndx
        assert_eq!(data.len(), 64);

        data.extend_from_slice(modinfo);
        data.extend_from_slice(shstrtab);
        while (data.len() as u64) < shoff {
            data.push(0);
        }

        let mut push_section = |name: u32, kind: u32, offset: u64, size: u64| {
            data.extend_from_slice(&name.to_le_bytes());
            data.extend_from_slice(&kind.to_le_bytes());
            data.extend_from_slice(&0u64.to_le_bytes()); // sh_flags
            data.extend_from_slice(&0u64.to_le_bytes()); // sh_addr
            data.extend_from_slice(&offset.to_le_bytes());
            data.extend_from_slice(&size.to_le_bytes());
            data.extend_from_slice(&0u32.to_le_bytes()); // sh_link
            data.extend_from_slice(&0u32.to_le_bytes()); // sh_info
            data.extend_from_slice(&1u64.to_le_bytes()); // sh_addralign
            data.extend_from_slice(&0u64.to_le_bytes()); // sh_entsize
        };
        push_section(0, 0, 0, 0);
        push_section(1, 1, modinfo_off, modinfo.len() as u64); // .modinfo, PROGBITS
        push_section(10, 3, shstrtab_off, shstrtab.len() as u64); // .shstrtab, STRTAB

        fs::write(path, data).unwrap();
    }

    #[test]
    fn module_vermagic_is_extracted() {
        let dir = TempDir::new().unwrap();
        let ko = dir.path().join("igb.ko");
        write_minimal_ko(
            &ko,
            b"license=GPL\0vermagic=5.14.0-70.el9.x86_64 SMP mod_unload\0",
        );

        let modules = scan_modules(dir.path()).unwrap();
        assert_eq!(modules.len(), 1);
        assert_eq!(modules[0].name, "igb");
        assert_eq!(modules[0].file_name, "igb.ko");
        assert_eq!(
            modules[0].kernel_version.as_deref(),
            Some("5.14.0-70.el9.x86_64")
        );
    }

    #[test]
    fn module_without_vermagic_has_no_version() {
        let dir = TempDir::new().unwrap();
        let ko = dir.path().join("bare.ko");
        write_minimal_ko(&ko, b"license=GPL\0");

        let modules = scan_modules(dir.path()).unwrap();
        assert_eq!(modules[0].kernel_version, None);
    }

    #[test]
    fn non_elf_module_is_rejected() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("fake.ko"), b"not an object").unwrap();

        let err = scan_modules(dir.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GraftError>(),
            Some(GraftError::UnsupportedArtifact { .. })
        ));
    }

    #[test]
    fn rpm_metadata_is_extracted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tools.rpm");

        let package = rpm::PackageBuilder::new(
            "net-tools",
            "2.10",
            "MIT",
            "x86_64",
            "network diagnostics",
        )
        .release("3.el9")
        .build()
        .unwrap();
        let mut out = fs::File::create(&path).unwrap();
        package.write(&mut out).unwrap();

        let packages = scan_rpms(dir.path()).unwrap();
        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].name, "net-tools");
        assert_eq!(packages[0].version, "2.10");
        assert_eq!(packages[0].release, "3.el9");
        assert_eq!(packages[0].arch, "x86_64");
    }

    #[test]
    fn non_rpm_payload_is_rejected() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("fake.rpm"), b"definitely not an rpm").unwrap();

        let err = scan_rpms(dir.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GraftError>(),
            Some(GraftError::UnsupportedArtifact { .. })
        ));
    }

    #[test]
    fn scan_order_is_sorted_by_file_name() {
        let dir = TempDir::new().unwrap();
        write_minimal_ko(&dir.path().join("zz.ko"), b"vermagic=6.1.0 SMP\0");
        write_minimal_ko(&dir.path().join("aa.ko"), b"vermagic=6.1.0 SMP\0");

        let modules = scan_modules(dir.path()).unwrap();
        let names: Vec<&str> = modules.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["aa", "zz"]);
    }

    #[test]
    fn major_minor_compatibility_gate() {
        assert!(versions_compatible("5.14.0-70.el9.x86_64", "5.14.0-362.el9"));
        assert!(versions_compatible("6.1.55", "6.1.0"));
        assert!(!versions_compatible("5.14.0", "5.15.0"));
        assert!(!versions_compatible("5.14.0", "6.14.0"));
        assert!(!versions_compatible("garbage", "5.14.0"));
    }
}
