//! Curation-sheet driven handling of duplicate runs.

use crate::{Action, OperationReport};
use anyhow::Result;
use curate_core::mover::Mover;
use curate_core::sidecar::{read_sidecar, sidecar_for, write_json, JsonStyle};
use curate_core::table::{parse_number, Table};
use curate_core::{file_name_str, list_files_matching, require_dir, CurateError};
use regex::Regex;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, info};

/// Key parameter groups whose second run becomes the only run.
pub const DEFAULT_RUN_GROUPS: [&str; 3] = [
    "datatype-func_run-02_suffix-bold_task-rest_acquisition-multiband__1",
    "datatype-func_run-02_suffix-bold_task-face_acquisition-singleband__1",
    "datatype-func_run-02_suffix-bold_task-fracback_acquisition-singleband__1",
];

fn zero_run_between_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"_run-0\d+_").expect("static regex"))
}

fn zero_run_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"_run-0\d+").expect("static regex"))
}

/// Dataset path for a sheet `FilePath`, which is written with a leading `/`.
pub fn dataset_path(bids_dir: &Path, file_path: &str) -> PathBuf {
    bids_dir.join(file_path.trim_start_matches('/'))
}

fn renamed(path: &Path, re: &Regex, with: &str) -> PathBuf {
    let name = file_name_str(path);
    path.with_file_name(re.replace_all(name, with).as_ref())
}

fn read_sheet(path: &Path, columns: &[&str]) -> Result<Table> {
    if !path.is_file() {
        return Err(CurateError::MissingFile(path.to_path_buf()).into());
    }
    let table = Table::read_tsv(path)?;
    table.require_columns(path, columns)?;
    Ok(table)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DropFlag {
    Remove,
    Keep,
}

fn drop_flag(cell: &str) -> Option<DropFlag> {
    let v = parse_number(cell);
    if v == 1.0 {
        Some(DropFlag::Remove)
    } else if v == 0.0 {
        Some(DropFlag::Keep)
    } else {
        None
    }
}

/// Executes a `DROP`/`FilePath` sheet: `1` removes the image and its sidecar,
/// `0` strips the zero-padded run token from both names.
pub fn cleanup_multiruns(bids_dir: &Path, sheet: &Path, mover: &dyn Mover) -> Result<OperationReport> {
    require_dir(bids_dir)?;
    let table = read_sheet(sheet, &["DROP", "FilePath"])?;
    let mut report = OperationReport::new(mover.is_dry_run());
    for row in &table.rows {
        let Some(flag) = table.cell(row, "DROP").and_then(drop_flag) else {
            continue;
        };
        let Some(rel) = table.cell(row, "FilePath") else {
            continue;
        };
        let file = dataset_path(bids_dir, rel);
        let json = sidecar_for(&file);
        if !file.exists() {
            report.skip(&file, "file not found");
            continue;
        }
        match flag {
            DropFlag::Remove => {
                if let Err(err) = mover.remove(&file) {
                    report.fail(&file, err);
                    continue;
                }
                report.record(Action::Remove { path: file.clone() });
                if json.exists() {
                    match mover.remove(&json) {
                        Ok(()) => report.record(Action::Remove { path: json }),
                        Err(err) => report.fail(&json, err),
                    }
                }
            }
            DropFlag::Keep => {
                let re = zero_run_between_re();
                let dst = renamed(&file, re, "_");
                if dst == file {
                    debug!(path = %file.display(), "no zero-padded run token");
                    continue;
                }
                let json_dst = renamed(&json, re, "_");
                let taken = [(&file, &dst), (&json, &json_dst)]
                    .into_iter()
                    .find(|(src, dst)| src.exists() && dst.exists());
                if let Some((_, taken)) = taken {
                    report.skip(&file, format!("destination already exists: {}", taken.display()));
                    continue;
                }
                if let Err(err) = mover.rename(&file, &dst) {
                    report.fail(&file, err);
                    continue;
                }
                report.record(Action::Rename {
                    src: file.clone(),
                    dst,
                });
                if json.exists() {
                    match mover.rename(&json, &json_dst) {
                        Ok(()) => report.record(Action::Rename {
                            src: json,
                            dst: json_dst,
                        }),
                        Err(err) => report.fail(&json, err),
                    }
                }
            }
        }
    }
    Ok(report)
}

fn subject_of(file_path: &str) -> Option<&str> {
    file_path
        .trim_start_matches('/')
        .split('/')
        .find(|p| p.starts_with("sub-"))
}

fn fieldmap_pattern(old_rel: &str) -> Result<Regex> {
    static TASK_ACQ: OnceLock<Regex> = OnceLock::new();
    let task_acq = TASK_ACQ
        .get_or_init(|| Regex::new(r"task-([^_]+)_acq-([^_]+)").expect("static regex"));
    let pattern = match task_acq.captures(old_rel) {
        Some(c) => format!(
            r"task-{}_acq-{}_run-\d+_bold\.nii\.gz$",
            regex::escape(&c[1]),
            regex::escape(&c[2])
        ),
        None => r"_run-\d+_bold\.nii\.gz$".to_string(),
    };
    Ok(Regex::new(&pattern)?)
}

fn is_fieldmap_sidecar(name: &str) -> bool {
    ["magnitude1.json", "magnitude2.json", "phasediff.json"]
        .iter()
        .any(|s| name.ends_with(s))
}

/// Points fieldmap `IntendedFor` entries that match the old run at the new
/// path, then stages each rewritten sidecar.
fn retarget_fieldmaps(
    bids_dir: &Path,
    session: &str,
    old_file_path: &str,
    new_file: &Path,
    mover: &dyn Mover,
    report: &mut OperationReport,
) -> Result<()> {
    let Some(subject) = subject_of(old_file_path) else {
        report.skip(old_file_path, "no subject in path");
        return Ok(());
    };
    let sub_root = bids_dir.join(subject);
    let fmap_dir = sub_root.join(session).join("fmap");
    if !fmap_dir.is_dir() {
        report.skip(&fmap_dir, "no fieldmap directory");
        return Ok(());
    }
    let old_rel = old_file_path
        .trim_start_matches('/')
        .trim_start_matches(&format!("{}/", subject))
        .to_string();
    let new_rel = new_file
        .strip_prefix(&sub_root)
        .map(curate_core::to_posix)
        .unwrap_or_else(|_| new_file.display().to_string());
    let pattern = fieldmap_pattern(&old_rel)?;
    for json_path in list_files_matching(&fmap_dir, is_fieldmap_sidecar)? {
        let mut data = match read_sidecar(&json_path) {
            Ok(d) => d,
            Err(err) => {
                report.fail(&json_path, err);
                continue;
            }
        };
        let mut details = Vec::new();
        if let Some(Value::Array(items)) = data.get_mut("IntendedFor") {
            for item in items.iter_mut() {
                if let Value::String(s) = item {
                    if pattern.is_match(s) {
                        details.push(format!("{} -> {}", s, new_rel));
                        *s = new_rel.clone();
                    }
                }
            }
        }
        if details.is_empty() {
            continue;
        }
        if !mover.is_dry_run() {
            if let Err(err) = write_json(&json_path, &Value::Object(data), JsonStyle::INDENT_2)
            {
                report.fail(&json_path, err);
                continue;
            }
        }
        if let Err(err) = mover.stage(&json_path) {
            report.fail(&json_path, err);
            continue;
        }
        report.record(Action::Update {
            path: json_path,
            details,
        });
    }
    Ok(())
}

/// For files whose `KeyParamGroup` is listed, drops the zero-padded run token
/// from image and sidecar and retargets fieldmaps in `session`.
pub fn rename_group_runs(
    bids_dir: &Path,
    files_tsv: &Path,
    groups: &[String],
    session: &str,
    mover: &dyn Mover,
) -> Result<OperationReport> {
    require_dir(bids_dir)?;
    let table = read_sheet(files_tsv, &["KeyParamGroup", "FilePath"])?;
    let mut report = OperationReport::new(mover.is_dry_run());
    let matching: Vec<&Vec<String>> = table
        .rows
        .iter()
        .filter(|row| {
            table
                .cell(row, "KeyParamGroup")
                .map(|g| groups.iter().any(|t| t == g))
                .unwrap_or(false)
        })
        .collect();
    info!(rows = matching.len(), "matching key parameter groups");
    for row in matching {
        let Some(rel) = table.cell(row, "FilePath") else {
            continue;
        };
        let file = dataset_path(bids_dir, rel);
        let json = sidecar_for(&file);
        if !file.exists() {
            report.skip(&file, "file not found");
            continue;
        }
        if !json.exists() {
            report.skip(&json, "sidecar not found");
            continue;
        }
        let re = zero_run_re();
        let new_file = renamed(&file, re, "");
        let new_json = renamed(&json, re, "");
        if new_file.exists() {
            report.skip(&file, format!("destination already exists: {}", new_file.display()));
            continue;
        }
        if new_json.exists() {
            report.skip(&json, format!("destination already exists: {}", new_json.display()));
            continue;
        }
        if let Err(err) = mover.rename(&file, &new_file) {
            report.fail(&file, err);
            continue;
        }
        report.record(Action::Rename {
            src: file,
            dst: new_file.clone(),
        });
        if let Err(err) = mover.rename(&json, &new_json) {
            report.fail(&json, err);
            continue;
        }
        report.record(Action::Rename {
            src: json,
            dst: new_json,
        });
        retarget_fieldmaps(bids_dir, session, rel, &new_file, mover, &mut report)?;
    }
    Ok(report)
}

/// Copies the rows whose last column mentions `run` (any case) to `output`.
pub fn find_multiruns(input: &Path, output: &Path) -> Result<usize> {
    let table = Table::read_tsv(input)?;
    let mut out = Table::new(table.headers.clone());
    if let Some(last) = table.headers.len().checked_sub(1) {
        out.rows = table
            .rows
            .iter()
            .filter(|r| {
                r.get(last)
                    .map(|c| c.to_lowercase().contains("run"))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
    }
    out.write_tsv(output)?;
    Ok(out.rows.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{scratch_dir, touch};
    use curate_core::mover::{DryRunMover, FsMover};
    use serde_json::json;
    use std::fs;

    #[test]
    fn drop_zero_strips_run_from_image_and_sidecar() {
        let root = scratch_dir("cleanup_keep");
        let func = root.join("sub-01/func");
        touch(&func.join("sub-01_run-01_task-rest_bold.nii.gz"), "");
        touch(&func.join("sub-01_run-01_task-rest_bold.json"), "{}");
        let sheet = root.join("sheet.tsv");
        touch(
            &sheet,
            "FilePath\tDROP\n/sub-01/func/sub-01_run-01_task-rest_bold.nii.gz\t0\n",
        );
        let report = cleanup_multiruns(&root, &sheet, &FsMover).expect("cleanup");
        assert_eq!(report.count("rename"), 2);
        assert!(func.join("sub-01_task-rest_bold.nii.gz").exists());
        assert!(func.join("sub-01_task-rest_bold.json").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn drop_one_removes_and_other_values_are_ignored() {
        let root = scratch_dir("cleanup_drop");
        let anat = root.join("sub-01/anat");
        touch(&anat.join("sub-01_run-02_T1w.nii.gz"), "");
        touch(&anat.join("sub-01_run-02_T1w.json"), "{}");
        touch(&anat.join("sub-01_run-03_T1w.nii.gz"), "");
        let sheet = root.join("sheet.tsv");
        touch(
            &sheet,
            "DROP\tFilePath\n1.0\t/sub-01/anat/sub-01_run-02_T1w.nii.gz\n2\t/sub-01/anat/sub-01_run-03_T1w.nii.gz\n1\t/sub-01/anat/missing.nii.gz\n",
        );
        let report = cleanup_multiruns(&root, &sheet, &FsMover).expect("cleanup");
        assert_eq!(report.count("remove"), 2);
        assert!(!anat.join("sub-01_run-02_T1w.json").exists());
        assert!(anat.join("sub-01_run-03_T1w.nii.gz").exists());
        assert_eq!(report.skipped.len(), 1);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn existing_sidecar_destination_blocks_the_rename() {
        let root = scratch_dir("cleanup_sidecar_taken");
        let anat = root.join("sub-01/anat");
        touch(&anat.join("sub-01_run-01_T1w.nii.gz"), "");
        touch(&anat.join("sub-01_run-01_T1w.json"), "{\"new\":1}");
        touch(&anat.join("sub-01_T1w.json"), "{\"precious\":1}");
        let sheet = root.join("sheet.tsv");
        touch(&sheet, "DROP\tFilePath\n0\t/sub-01/anat/sub-01_run-01_T1w.nii.gz\n");
        let report = cleanup_multiruns(&root, &sheet, &FsMover).expect("cleanup");
        assert_eq!(report.count("rename"), 0);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(
            fs::read_to_string(anat.join("sub-01_T1w.json")).expect("kept"),
            "{\"precious\":1}"
        );
        assert!(anat.join("sub-01_run-01_T1w.nii.gz").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn failed_sidecar_move_still_reports_image_rename() {
        struct SidecarFails;
        impl Mover for SidecarFails {
            fn rename(&self, src: &Path, dst: &Path) -> Result<()> {
                if file_name_str(src).ends_with(".json") {
                    return Err(anyhow::anyhow!("locked"));
                }
                FsMover.rename(src, dst)
            }
            fn remove(&self, path: &Path) -> Result<()> {
                FsMover.remove(path)
            }
            fn stage(&self, _path: &Path) -> Result<()> {
                Ok(())
            }
        }
        let root = scratch_dir("kpg_partial");
        let func = root.join("sub-9/ses-1/func");
        let old = "sub-9_ses-1_task-rest_acq-multiband_run-02_bold";
        touch(&func.join(format!("{}.nii.gz", old)), "");
        touch(&func.join(format!("{}.json", old)), "{}");
        let sheet = root.join("files.tsv");
        touch(
            &sheet,
            &format!(
                "KeyParamGroup\tFilePath\n{}\t/sub-9/ses-1/func/{}.nii.gz\n",
                DEFAULT_RUN_GROUPS[0], old
            ),
        );
        let groups = vec![DEFAULT_RUN_GROUPS[0].to_string()];
        let report =
            rename_group_runs(&root, &sheet, &groups, "ses-1", &SidecarFails).expect("rename");
        assert_eq!(report.count("rename"), 1);
        assert_eq!(report.errors.len(), 1);
        assert!(func.join("sub-9_ses-1_task-rest_acq-multiband_bold.nii.gz").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_sheet_column_is_fatal() {
        let root = scratch_dir("cleanup_cols");
        let sheet = root.join("sheet.tsv");
        touch(&sheet, "FilePath\n/sub-01/x.nii.gz\n");
        let err = cleanup_multiruns(&root, &sheet, &DryRunMover::new()).expect_err("no DROP");
        assert!(err.to_string().contains("DROP"), "{}", err);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn group_runs_are_renamed_and_fieldmaps_retargeted() {
        let root = scratch_dir("kpg");
        let func = root.join("sub-9/ses-1/func");
        let old = "sub-9_ses-1_task-rest_acq-multiband_run-02_bold";
        touch(&func.join(format!("{}.nii.gz", old)), "");
        touch(&func.join(format!("{}.json", old)), "{}");
        let fmap = root.join("sub-9/ses-1/fmap/sub-9_ses-1_phasediff.json");
        touch(
            &fmap,
            &json!({"IntendedFor": [
                "ses-1/func/sub-9_ses-1_task-rest_acq-multiband_run-02_bold.nii.gz",
                "ses-1/func/sub-9_ses-1_task-face_acq-singleband_bold.nii.gz"
            ]})
            .to_string(),
        );
        let sheet = root.join("files.tsv");
        touch(
            &sheet,
            &format!(
                "KeyParamGroup\tFilePath\n{}\t/sub-9/ses-1/func/{}.nii.gz\nother\t/sub-9/x.nii.gz\n",
                DEFAULT_RUN_GROUPS[0], old
            ),
        );
        let groups: Vec<String> = DEFAULT_RUN_GROUPS.iter().map(|s| s.to_string()).collect();
        let report =
            rename_group_runs(&root, &sheet, &groups, "ses-1", &FsMover).expect("rename");
        assert_eq!(report.count("rename"), 2);
        assert_eq!(report.count("update"), 1);
        let data = read_sidecar(&fmap).expect("fmap");
        assert_eq!(
            data["IntendedFor"][0],
            json!("ses-1/func/sub-9_ses-1_task-rest_acq-multiband_bold.nii.gz")
        );
        assert_eq!(
            data["IntendedFor"][1],
            json!("ses-1/func/sub-9_ses-1_task-face_acq-singleband_bold.nii.gz")
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn find_multiruns_filters_on_last_column() {
        let root = scratch_dir("find_multi");
        let input = root.join("in.tsv");
        touch(
            &input,
            "KeyGroup\tFilePath\na\t/sub-1/func/sub-1_RUN-1_bold.nii.gz\nb\t/sub-1/anat/sub-1_T1w.nii.gz\n",
        );
        let output = root.join("out/multi.tsv");
        assert_eq!(find_multiruns(&input, &output).expect("filter"), 1);
        let text = fs::read_to_string(&output).expect("output");
        assert_eq!(text, "KeyGroup\tFilePath\na\t/sub-1/func/sub-1_RUN-1_bold.nii.gz\n");
        let _ = fs::remove_dir_all(root);
    }
}
