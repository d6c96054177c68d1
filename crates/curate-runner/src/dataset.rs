//! Whole-directory chores: session renumbering, perfusion import and the
//! participants listing.

use crate::{Action, OperationReport};
use anyhow::Result;
use curate_core::table::Table;
use curate_core::{file_name_str, list_dirs_with_prefix, list_files_matching, require_dir};
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use walkdir::WalkDir;

/// Replaces `ses-1` of one subject with the contents of `ses-2`, renaming
/// every file that mentions `ses-2`.
pub fn fix_sessions(subject_dir: &Path, dry_run: bool) -> Result<OperationReport> {
    require_dir(subject_dir)?;
    let mut report = OperationReport::new(dry_run);
    let ses1 = subject_dir.join("ses-1");
    let ses2 = subject_dir.join("ses-2");
    if ses1.exists() {
        if !dry_run {
            fs::remove_dir_all(&ses1)?;
        }
        report.record(Action::Remove { path: ses1.clone() });
    }
    if !ses2.is_dir() {
        report.skip(&ses2, "no ses-2 directory");
        return Ok(report);
    }
    let mut files: Vec<PathBuf> = Vec::new();
    for entry in WalkDir::new(&ses2).sort_by_file_name() {
        let entry = entry?;
        if entry.file_type().is_file() && file_name_str(entry.path()).contains("ses-2") {
            files.push(entry.into_path());
        }
    }
    if !dry_run {
        fs::rename(&ses2, &ses1)?;
    }
    report.record(Action::Rename {
        src: ses2.clone(),
        dst: ses1.clone(),
    });
    for old in files {
        let Ok(rel) = old.strip_prefix(&ses2) else {
            continue;
        };
        let moved = ses1.join(rel);
        let new_name = file_name_str(&moved).replace("ses-2", "ses-1");
        let dst = moved.with_file_name(new_name);
        if !dry_run {
            if let Err(err) = fs::rename(&moved, &dst) {
                report.fail(&moved, err);
                continue;
            }
        }
        report.record(Action::Rename { src: moved, dst });
    }
    Ok(report)
}

fn session_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"ses-\d+").expect("static regex"))
}

/// Copies each subject's first `ses-*/perf` directory from `source` into
/// `<dest>/<subject>/<session>/perf`, relabelling the session in filenames.
pub fn copy_perfusion(
    source: &Path,
    dest: &Path,
    session: &str,
    dry_run: bool,
) -> Result<OperationReport> {
    require_dir(source)?;
    let mut report = OperationReport::new(dry_run);
    for sub_dir in list_dirs_with_prefix(source, "sub-")? {
        let subject = file_name_str(&sub_dir).to_string();
        let perf = list_dirs_with_prefix(&sub_dir, "ses-")?
            .into_iter()
            .map(|s| s.join("perf"))
            .find(|p| p.is_dir());
        let Some(perf) = perf else {
            report.skip(&sub_dir, "no perfusion data");
            continue;
        };
        let dest_dir = dest.join(&subject).join(session).join("perf");
        if !dry_run {
            fs::create_dir_all(&dest_dir)?;
        }
        for src in list_files_matching(&perf, |_| true)? {
            let name = session_re().replace_all(file_name_str(&src), regex::NoExpand(session));
            let dst = dest_dir.join(name.as_ref());
            if !dry_run {
                if let Err(err) = fs::copy(&src, &dst) {
                    report.fail(&src, err);
                    continue;
                }
            }
            report.record(Action::Copy { src, dst });
        }
    }
    Ok(report)
}

/// Writes `participants.tsv` with one `participant_id` per `sub-*` directory.
pub fn init_participants(bids_dir: &Path) -> Result<(PathBuf, usize)> {
    require_dir(bids_dir)?;
    let mut table = Table::new(vec!["participant_id".to_string()]);
    for sub_dir in list_dirs_with_prefix(bids_dir, "sub-")? {
        let label = file_name_str(&sub_dir).trim_start_matches("sub-").to_string();
        table.rows.push(vec![format!("sub-{}", label)]);
    }
    let path = bids_dir.join("participants.tsv");
    table.write_tsv(&path)?;
    Ok((path, table.rows.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{scratch_dir, touch};

    #[test]
    fn ses2_replaces_ses1() {
        let root = scratch_dir("fix_sessions");
        let sub = root.join("sub-5");
        touch(&sub.join("ses-1/anat/sub-5_ses-1_T1w.nii.gz"), "old");
        touch(&sub.join("ses-2/anat/sub-5_ses-2_T1w.nii.gz"), "new");
        touch(&sub.join("ses-2/anat/notes.txt"), "");
        let report = fix_sessions(&sub, false).expect("fix");
        assert!(!sub.join("ses-2").exists());
        let t1 = sub.join("ses-1/anat/sub-5_ses-1_T1w.nii.gz");
        assert_eq!(fs::read_to_string(t1).expect("t1"), "new");
        assert!(sub.join("ses-1/anat/notes.txt").exists());
        assert_eq!(report.count("remove"), 1);
        assert_eq!(report.count("rename"), 2);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn fix_sessions_dry_run_leaves_tree() {
        let root = scratch_dir("fix_sessions_dry");
        let sub = root.join("sub-5");
        touch(&sub.join("ses-2/func/sub-5_ses-2_bold.nii.gz"), "");
        let report = fix_sessions(&sub, true).expect("dry");
        assert!(sub.join("ses-2/func/sub-5_ses-2_bold.nii.gz").exists());
        assert_eq!(report.count("rename"), 2);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn perfusion_copy_relabels_session() {
        let root = scratch_dir("copy_perf");
        let src = root.join("src");
        touch(&src.join("sub-3/ses-2/perf/sub-3_ses-2_asl.nii.gz"), "x");
        touch(&src.join("sub-4/ses-1/anat/sub-4_ses-1_T1w.nii.gz"), "");
        let dest = root.join("dest");
        let report = copy_perfusion(&src, &dest, "ses-1", false).expect("copy");
        assert!(dest.join("sub-3/ses-1/perf/sub-3_ses-1_asl.nii.gz").exists());
        assert_eq!(report.count("copy"), 1);
        assert_eq!(report.skipped.len(), 1);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn participants_lists_sorted_subjects() {
        let root = scratch_dir("participants");
        fs::create_dir_all(root.join("sub-b")).expect("dir");
        fs::create_dir_all(root.join("sub-a")).expect("dir");
        touch(&root.join("sub-file.txt"), "");
        let (path, n) = init_participants(&root).expect("init");
        assert_eq!(n, 2);
        assert_eq!(
            fs::read_to_string(path).expect("read"),
            "participant_id\nsub-a\nsub-b\n"
        );
        let _ = fs::remove_dir_all(root);
    }
}
