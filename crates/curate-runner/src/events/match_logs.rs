//! Pairs BIDS fracback runs with the behavioural logs exported per subject.

use anyhow::{anyhow, Result};
use curate_core::table::Table;
use curate_core::{file_name_str, to_posix, CurateError};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq)]
pub struct LogMatch {
    pub subject: String,
    pub func: Option<PathBuf>,
    pub log: Option<PathBuf>,
}

/// `sub-ABC` and `abc` name the same subject.
pub fn normalize_subject(raw: &str) -> String {
    raw.strip_prefix("sub-").unwrap_or(raw).to_lowercase()
}

fn collect_funcs(bids_root: &Path) -> Result<BTreeMap<String, Vec<PathBuf>>> {
    let pattern = bids_root.join("sub-*/ses-1/func/*task-fracback*.nii.gz");
    let pattern = pattern
        .to_str()
        .ok_or_else(|| anyhow!("non UTF-8 path {}", bids_root.display()))?;
    let mut out: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    for entry in glob::glob(pattern)? {
        let path = entry?;
        if !path.is_file() {
            continue;
        }
        let subject = path
            .ancestors()
            .skip(1)
            .map(file_name_str)
            .find(|n| n.starts_with("sub-"));
        match subject {
            Some(s) => out.entry(normalize_subject(s)).or_default().push(path.clone()),
            None => warn!(path = %path.display(), "could not infer subject"),
        }
    }
    for files in out.values_mut() {
        files.sort();
    }
    Ok(out)
}

fn is_frac2b_log(name: &str) -> bool {
    name.ends_with(".log") && (name.contains("frac2B") || name.contains("frac2b"))
}

fn collect_logs(subjects_root: &Path) -> Result<BTreeMap<String, Vec<PathBuf>>> {
    if !subjects_root.is_dir() {
        return Err(CurateError::NotADirectory(subjects_root.to_path_buf()).into());
    }
    let mut out = BTreeMap::new();
    for subj_dir in curate_core::list_dirs_with_prefix(subjects_root, "")? {
        let mut logs = BTreeSet::new();
        for entry in WalkDir::new(&subj_dir) {
            let entry = entry?;
            if entry.file_type().is_file() && is_frac2b_log(file_name_str(entry.path())) {
                logs.insert(entry.into_path());
            }
        }
        if !logs.is_empty() {
            out.insert(normalize_subject(file_name_str(&subj_dir)), logs.into_iter().collect());
        }
    }
    Ok(out)
}

/// Pairs runs and logs per subject in sorted order. Unpaired leftovers on
/// either side still get a row with the other cell empty.
pub fn pair_records(
    funcs: &BTreeMap<String, Vec<PathBuf>>,
    logs: &BTreeMap<String, Vec<PathBuf>>,
) -> Vec<LogMatch> {
    let subjects: BTreeSet<&String> = funcs.keys().chain(logs.keys()).collect();
    let empty = Vec::new();
    let mut rows = Vec::new();
    for subject in subjects {
        let f = funcs.get(subject).unwrap_or(&empty);
        let l = logs.get(subject).unwrap_or(&empty);
        for i in 0..f.len().max(l.len()) {
            rows.push(LogMatch {
                subject: format!("sub-{}", subject),
                func: f.get(i).cloned(),
                log: l.get(i).cloned(),
            });
        }
    }
    rows
}

pub fn match_fracback_logs(bids_root: &Path, subjects_root: &Path, out: &Path) -> Result<Vec<LogMatch>> {
    info!(bids_root = %bids_root.display(), "scanning fracback runs");
    let funcs = collect_funcs(bids_root)?;
    info!(
        runs = funcs.values().map(Vec::len).sum::<usize>(),
        subjects = funcs.len(),
        "found fracback runs"
    );
    let logs = collect_logs(subjects_root)?;
    info!(
        logs = logs.values().map(Vec::len).sum::<usize>(),
        subjects = logs.len(),
        "found frac2B logs"
    );
    let rows = pair_records(&funcs, &logs);

    let mut table = Table::new(vec![
        "subject_id".to_string(),
        "func_path".to_string(),
        "log_path".to_string(),
    ]);
    let cell = |p: &Option<PathBuf>| p.as_deref().map(to_posix).unwrap_or_default();
    for r in &rows {
        table
            .rows
            .push(vec![r.subject.clone(), cell(&r.func), cell(&r.log)]);
    }
    if let Some(parent) = out.parent() {
        curate_core::ensure_dir(parent)?;
    }
    table.write_tsv(out)?;
    info!(rows = rows.len(), out = %out.display(), "wrote match report");
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{scratch_dir, touch};
    use std::fs;

    #[test]
    fn subjects_normalise_case_and_prefix() {
        assert_eq!(normalize_subject("sub-ABC12"), "abc12");
        assert_eq!(normalize_subject("ABC12"), "abc12");
    }

    #[test]
    fn unmatched_sides_keep_rows() {
        let root = scratch_dir("match_logs");
        let bids = root.join("bids");
        let fw = root.join("SUBJECTS");
        touch(&bids.join("sub-100/ses-1/func/sub-100_ses-1_task-fracback_bold.nii.gz"), "");
        touch(&bids.join("sub-200/ses-1/func/sub-200_ses-1_task-fracback_bold.nii.gz"), "");
        touch(&bids.join("sub-200/ses-2/func/sub-200_ses-2_task-fracback_bold.nii.gz"), "");
        touch(&fw.join("100/SESSIONS/a/x-frac2B_1.00.log"), "");
        touch(&fw.join("100/SESSIONS/b/y-frac2b_1.00.log"), "");
        touch(&fw.join("300/SESSIONS/a/z-frac2B.log"), "");
        let out = root.join("report.tsv");
        let rows = match_fracback_logs(&bids, &fw, &out).expect("match");
        let summary: Vec<(&str, bool, bool)> = rows
            .iter()
            .map(|r| (r.subject.as_str(), r.func.is_some(), r.log.is_some()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("sub-100", true, true),
                ("sub-100", false, true),
                ("sub-200", true, false),
                ("sub-300", false, true),
            ]
        );
        let text = fs::read_to_string(&out).expect("tsv");
        assert!(text.starts_with("subject_id\tfunc_path\tlog_path\n"));
        let first = text.lines().nth(1).expect("first row");
        assert!(first.starts_with("sub-100\t"), "{}", first);
        assert!(first.contains("task-fracback_bold.nii.gz\t"), "{}", first);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn subject_comes_from_directory_not_file_name() {
        let root = scratch_dir("match_subject_dir");
        let bids = root.join("bids");
        touch(&bids.join("sub-7/ses-1/func/sub-7_ses-1_task-fracback_bold.nii.gz"), "");
        let funcs = collect_funcs(&bids).expect("funcs");
        assert_eq!(funcs.keys().collect::<Vec<_>>(), vec!["7"]);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_subjects_root_is_an_error() {
        let root = scratch_dir("match_missing");
        let err = match_fracback_logs(&root, &root.join("nope"), &root.join("o.tsv"))
            .expect_err("missing root");
        assert!(err.to_string().contains("is not a directory"));
        let _ = fs::remove_dir_all(root);
    }
}
