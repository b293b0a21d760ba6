use anyhow::{Context, Result};
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::GraftError;
use crate::plan::{InjectionPlan, ManifestEdit, TargetTree};
use crate::utils::fs as fsutil;

/// Applies a plan to the extracted trees: file placements in parallel,
/// then manifest edits sequentially in plan order. Failures leave the
/// trees as they are for inspection.
pub fn apply(plan: &InjectionPlan, outer_tree: &Path, boot_tree: Option<&Path>) -> Result<()> {
    if plan.is_empty() {
        return Ok(());
    }
    info!(
        "Merging {} file(s) and {} manifest edit(s)",
        plan.copies.len(),
        plan.edits.len()
    );

    plan.copies.par_iter().try_for_each(|step| {
        let root = resolve_tree(step.tree, outer_tree, boot_tree)
            .map_err(|reason| merge_failed(&format!("copy {}", step.dest.display()), &reason))?;
        let dest = root.join(&step.dest);
        fsutil::copy_file(&step.source, &dest).map_err(|e| {
            merge_failed(&format!("copy {}", step.dest.display()), &format!("{:#}", e))
        })?;
        debug!("Placed {}", dest.display());
        Ok::<(), anyhow::Error>(())
    })?;

    for edit in &plan.edits {
        let root = resolve_tree(edit.tree, outer_tree, boot_tree)
            .map_err(|reason| merge_failed(&format!("edit {}", edit.file.display()), &reason))?;
        upsert_line(&root.join(&edit.file), &edit.key, &edit.line).map_err(|e| {
            merge_failed(&format!("edit {}", edit.file.display()), &format!("{:#}", e))
        })?;
    }

    if !plan.post_install.is_empty() {
        install_post_hook(outer_tree, &plan.post_install)
            .map_err(|e| merge_failed("kickstart %post hook", &format!("{:#}", e)))?;
    }

    Ok(())
}

/// Kickstart locations checked relative to the ISO tree root, in order.
const KICKSTART_CANDIDATES: &[&str] = &["ks.cfg", "kickstart/ks.cfg"];

const POST_HOOK_MARKER: &str = "# extra-rpms install hook";

fn install_post_hook(outer_tree: &Path, commands: &[String]) -> Result<()> {
    let Some(kickstart) = find_kickstart(outer_tree) else {
        warn!(
            "No kickstart file in the image; staged RPMs are listed in the \
             install manifest but will not auto-install"
        );
        return Ok(());
    };
    info!("Adding %post install hook to {}", kickstart.display());
    upsert_post_block(&kickstart, commands)
}

fn find_kickstart(outer_tree: &Path) -> Option<PathBuf> {
    KICKSTART_CANDIDATES
        .iter()
        .map(|candidate| outer_tree.join(candidate))
        .find(|path| path.is_file())
}

/// Appends a marker-delimited `%post` block running `commands` to a
/// kickstart file. An existing block with the same marker is replaced,
/// so re-running a merge never stacks duplicate hooks.
pub fn upsert_post_block(path: &Path, commands: &[String]) -> Result<()> {
    let existing = fs::read_to_string(path)
        .with_context(|| format!("Failed to read kickstart: {}", path.display()))?;
    let mut lines: Vec<String> = existing.lines().map(str::to_string).collect();

    if let Some(marker_idx) = lines.iter().position(|l| l.trim() == POST_HOOK_MARKER) {
        let start = lines[..marker_idx]
            .iter()
            .rposition(|l| l.trim_start().starts_with("%post"))
            .unwrap_or(marker_idx);
        let end = lines[marker_idx..]
            .iter()
            .position(|l| l.trim() == "%end")
            .map(|offset| marker_idx + offset)
            .unwrap_or(lines.len() - 1);
        lines.drain(start..=end);
    }

    while lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }
    lines.push(String::new());
    lines.push("%post".into());
    lines.push(POST_HOOK_MARKER.into());
    lines.extend(commands.iter().cloned());
    lines.push("%end".into());

    let mut text = lines.join("\n");
    text.push('\n');
    fs::write(path, text)
        .with_context(|| format!("Failed to write kickstart: {}", path.display()))
}

fn resolve_tree<'a>(
    tree: TargetTree,
    outer: &'a Path,
    boot: Option<&'a Path>,
) -> std::result::Result<&'a Path, String> {
    match tree {
        TargetTree::Outer => Ok(outer),
        TargetTree::Boot => boot.ok_or_else(|| "no boot image tree was unpacked".to_string()),
    }
}

fn merge_failed(step: &str, reason: &str) -> anyhow::Error {
    GraftError::MergeFailed {
        step: step.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

/// Inserts `line` into a line-oriented manifest, replacing an existing
/// line for the same key instead of appending a duplicate. The file is
/// created (with parents) when missing.
pub fn upsert_line(path: &Path, key: &str, line: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let existing = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read manifest: {}", path.display()))
        }
    };

    let mut lines: Vec<String> = existing.lines().map(str::to_string).collect();
    match lines.iter_mut().find(|l| line_matches_key(l, key)) {
        Some(slot) => *slot = line.to_string(),
        None => lines.push(line.to_string()),
    }

    let mut text = lines.join("\n");
    text.push('\n');
    fs::write(path, text).with_context(|| format!("Failed to write manifest: {}", path.display()))
}

/// A line belongs to `key` when it is the key itself or starts with the
/// key followed by whitespace (dependency lists, version columns).
fn line_matches_key(line: &str, key: &str) -> bool {
    let trimmed = line.trim();
    trimmed == key
        || trimmed
            .strip_prefix(key)
            .is_some_and(|rest| rest.starts_with(char::is_whitespace))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{CopyStep, MODULES_LOAD_CONF};
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn plan_with_one_module(source: PathBuf) -> InjectionPlan {
        InjectionPlan {
            copies: vec![CopyStep {
                source,
                dest: PathBuf::from("lib/modules/5.14.0/extra/igb.ko"),
                tree: TargetTree::Boot,
            }],
            edits: vec![ManifestEdit {
                tree: TargetTree::Boot,
                file: PathBuf::from(MODULES_LOAD_CONF),
                key: "igb".into(),
                line: "igb".into(),
            }],
            module_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn applies_copies_and_edits() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("igb.ko");
        fs::write(&source, b"module").unwrap();
        let outer = dir.path().join("outer");
        let boot = dir.path().join("boot");
        fs::create_dir_all(&outer).unwrap();
        fs::create_dir_all(&boot).unwrap();

        let plan = plan_with_one_module(source);
        apply(&plan, &outer, Some(&boot)).unwrap();

        assert_eq!(
            fs::read(boot.join("lib/modules/5.14.0/extra/igb.ko")).unwrap(),
            b"module"
        );
        assert_eq!(
            fs::read_to_string(boot.join(MODULES_LOAD_CONF)).unwrap(),
            "igb\n"
        );
    }

    #[test]
    fn applying_twice_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("igb.ko");
        fs::write(&source, b"module").unwrap();
        let outer = dir.path().join("outer");
        let boot = dir.path().join("boot");
        fs::create_dir_all(&outer).unwrap();
        fs::create_dir_all(&boot).unwrap();

        let plan = plan_with_one_module(source);
        apply(&plan, &outer, Some(&boot)).unwrap();
        apply(&plan, &outer, Some(&boot)).unwrap();

        assert_eq!(
            fs::read_to_string(boot.join(MODULES_LOAD_CONF)).unwrap(),
            "igb\n"
        );
    }

    #[test]
    fn missing_source_surfaces_as_merge_failure() {
        let dir = TempDir::new().unwrap();
        let outer = dir.path().join("outer");
        fs::create_dir_all(&outer).unwrap();

        let plan = InjectionPlan {
            copies: vec![CopyStep {
                source: dir.path().join("missing.rpm"),
                dest: PathBuf::from("extra-rpms/missing.rpm"),
                tree: TargetTree::Outer,
            }],
            ..Default::default()
        };

        let err = apply(&plan, &outer, None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GraftError>(),
            Some(GraftError::MergeFailed { .. })
        ));
    }

    #[test]
    fn upsert_replaces_matching_line_in_place() {
        let dir = TempDir::new().unwrap();
        let manifest = dir.path().join("install-manifest.txt");
        fs::write(&manifest, "net-tools 1.0-1 x86_64 a.rpm\nvim 9.0-2 x86_64 b.rpm\n").unwrap();

        upsert_line(&manifest, "net-tools", "net-tools 2.0-1 x86_64 c.rpm").unwrap();

        assert_eq!(
            fs::read_to_string(&manifest).unwrap(),
            "net-tools 2.0-1 x86_64 c.rpm\nvim 9.0-2 x86_64 b.rpm\n"
        );
    }

    #[test]
    fn upsert_does_not_match_key_prefixes() {
        let dir = TempDir::new().unwrap();
        let manifest = dir.path().join("m.txt");
        fs::write(&manifest, "net-tools-extra 1.0-1 x86_64 x.rpm\n").unwrap();

        upsert_line(&manifest, "net-tools", "net-tools 1.0-1 x86_64 y.rpm").unwrap();

        assert_eq!(
            fs::read_to_string(&manifest).unwrap(),
            "net-tools-extra 1.0-1 x86_64 x.rpm\nnet-tools 1.0-1 x86_64 y.rpm\n"
        );
    }

    #[test]
    fn post_hook_is_appended_to_kickstart() {
        let dir = TempDir::new().unwrap();
        let outer = dir.path().join("outer");
        fs::create_dir_all(&outer).unwrap();
        fs::write(outer.join("ks.cfg"), "lang en_US.UTF-8\n%packages\n@core\n%end\n").unwrap();

        let plan = InjectionPlan {
            post_install: vec!["rpm -ivh --nodeps /run/install/repo/extra-rpms/a.rpm".into()],
            edits: vec![ManifestEdit {
                tree: TargetTree::Outer,
                file: PathBuf::from("extra-rpms/install-manifest.txt"),
                key: "a".into(),
                line: "a 1.0-1 x86_64 a.rpm".into(),
            }],
            ..Default::default()
        };
        apply(&plan, &outer, None).unwrap();

        let ks = fs::read_to_string(outer.join("ks.cfg")).unwrap();
        assert!(ks.starts_with("lang en_US.UTF-8\n%packages\n@core\n%end\n"));
        assert!(ks.contains("%post\n"));
        assert!(ks.contains("rpm -ivh --nodeps /run/install/repo/extra-rpms/a.rpm"));
        assert!(ks.trim_end().ends_with("%end"));
    }

    #[test]
    fn post_hook_is_replaced_not_stacked() {
        let dir = TempDir::new().unwrap();
        let ks = dir.path().join("ks.cfg");
        fs::write(&ks, "install\n").unwrap();

        upsert_post_block(&ks, &["echo one".into()]).unwrap();
        upsert_post_block(&ks, &["echo one".into(), "echo two".into()]).unwrap();

        let text = fs::read_to_string(&ks).unwrap();
        assert_eq!(text.matches("%post").count(), 1);
        assert_eq!(text.matches("%end").count(), 1);
        assert!(text.contains("echo two"));
        assert!(text.starts_with("install\n"));
    }

    #[test]
    fn missing_kickstart_leaves_manifest_as_only_record() {
        let dir = TempDir::new().unwrap();
        let outer = dir.path().join("outer");
        fs::create_dir_all(&outer).unwrap();

        let plan = InjectionPlan {
            post_install: vec!["rpm -ivh x.rpm".into()],
            ..Default::default()
        };
        apply(&plan, &outer, None).unwrap();
        assert!(!outer.join("ks.cfg").exists());
    }

    #[test]
    fn upsert_matches_dependency_style_keys() {
        let dir = TempDir::new().unwrap();
        let dep = dir.path().join("modules.dep");
        fs::write(&dep, "kernel/net/igb.ko: kernel/net/core.ko\nextra/igb.ko: old\n").unwrap();

        upsert_line(&dep, "extra/igb.ko:", "extra/igb.ko:").unwrap();

        assert_eq!(
            fs::read_to_string(&dep).unwrap(),
            "kernel/net/igb.ko: kernel/net/core.ko\nextra/igb.ko:\n"
        );
    }
}
