//! Renames that drop or reorder BIDS entities, keeping sidecars and fieldmap
//! `IntendedFor` references in step.

use crate::{Action, OperationReport};
use anyhow::Result;
use curate_core::bids::{
    has_run_token, is_nifti, remove_run_token, reorder_run_rec, split_name_suffix,
    subject_and_session, SIDECAR_EXTENSIONS,
};
use curate_core::mover::Mover;
use curate_core::sidecar::{
    intended_for_list, read_sidecar, unique_preserve_order, write_json, JsonStyle,
};
use curate_core::{file_name_str, list_files_matching, require_dir, to_posix};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenamePlan {
    pub src: PathBuf,
    pub dst: PathBuf,
}

fn sorted_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Plans a rename for every file carrying `_run-<digits>`, refusing any
/// destination that exists or is already claimed.
pub fn plan_run_removal(bids_dir: &Path, report: &mut OperationReport) -> Result<Vec<RenamePlan>> {
    let mut plans = Vec::new();
    let mut claimed: HashSet<PathBuf> = HashSet::new();
    for src in sorted_files(bids_dir)? {
        let name = file_name_str(&src);
        if !has_run_token(name) {
            continue;
        }
        let (stem, ext) = split_name_suffix(name);
        let new_stem = remove_run_token(stem);
        if new_stem == stem {
            continue;
        }
        let dst = src.with_file_name(format!("{}{}", new_stem, ext));
        if dst.exists() || claimed.contains(&dst) {
            report.skip(
                &src,
                format!("destination collision: {}", dst.display()),
            );
            continue;
        }
        claimed.insert(dst.clone());
        plans.push(RenamePlan { src, dst });
    }
    Ok(plans)
}

/// Adds sidecar renames for each NIfTI plan, unless the sidecar already has
/// its own plan.
pub fn expand_with_sidecars(plans: &[RenamePlan]) -> Vec<RenamePlan> {
    let planned_srcs: HashSet<&Path> = plans.iter().map(|p| p.src.as_path()).collect();
    let mut out = Vec::with_capacity(plans.len());
    for plan in plans {
        out.push(plan.clone());
        let src_name = file_name_str(&plan.src);
        if !is_nifti(src_name) {
            continue;
        }
        let (src_stem, _) = split_name_suffix(src_name);
        let (dst_stem, _) = split_name_suffix(file_name_str(&plan.dst));
        for ext in SIDECAR_EXTENSIONS {
            let src_sc = plan.src.with_file_name(format!("{}{}", src_stem, ext));
            if src_sc.exists() && !planned_srcs.contains(src_sc.as_path()) {
                out.push(RenamePlan {
                    dst: plan.dst.with_file_name(format!("{}{}", dst_stem, ext)),
                    src: src_sc,
                });
            }
        }
    }
    out
}

fn apply_plans(plans: &[RenamePlan], mover: &dyn Mover, report: &mut OperationReport) {
    for plan in plans {
        if !report.dry_run && plan.dst.exists() {
            report.skip(
                &plan.src,
                format!("destination already exists: {}", plan.dst.display()),
            );
            continue;
        }
        match mover.rename(&plan.src, &plan.dst) {
            Ok(()) => report.record(Action::Rename {
                src: plan.src.clone(),
                dst: plan.dst.clone(),
            }),
            Err(err) => report.fail(&plan.src, err),
        }
    }
}

/// Subject-relative posix paths of renamed NIfTI images, old to new.
pub fn intended_for_map(plans: &[RenamePlan], bids_dir: &Path) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for plan in plans {
        if !is_nifti(file_name_str(&plan.src)) {
            continue;
        }
        let Ok(rel) = plan.src.strip_prefix(bids_dir) else {
            continue;
        };
        let (Some(subject), _) = subject_and_session(rel) else {
            continue;
        };
        let sub_root = bids_dir.join(&subject);
        if let (Ok(src_rel), Ok(dst_rel)) = (
            plan.src.strip_prefix(&sub_root),
            plan.dst.strip_prefix(&sub_root),
        ) {
            map.insert(to_posix(src_rel), to_posix(dst_rel));
        }
    }
    map
}

fn normalize_rel(rel: &str) -> String {
    rel.split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Rewrites one fieldmap's `IntendedFor`: mapped entries are substituted,
/// unmapped entries survive only if the file still exists, and duplicates
/// collapse. Returns the change lines, empty when nothing changed.
pub fn repair_intended_for(
    json_path: &Path,
    subject_root: &Path,
    rel_map: &BTreeMap<String, String>,
    dry_run: bool,
) -> Result<Vec<String>> {
    let mut data = read_sidecar(json_path)?;
    if !data.contains_key("IntendedFor") {
        return Ok(Vec::new());
    }
    let original = intended_for_list(data.get("IntendedFor"));
    let mut updated = Vec::new();
    let mut changes = Vec::new();
    for rel in &original {
        let rel = normalize_rel(rel);
        if let Some(new_rel) = rel_map.get(&rel) {
            if *new_rel != rel {
                changes.push(format!("{} -> {}", rel, new_rel));
            }
            updated.push(new_rel.clone());
        } else if subject_root.join(&rel).exists() {
            updated.push(rel);
        } else {
            changes.push(format!("REMOVE: {}", rel));
        }
    }
    let updated = unique_preserve_order(updated);
    if updated == original {
        return Ok(Vec::new());
    }
    if changes.is_empty() {
        changes.push("deduplicated".to_string());
    }
    if !dry_run {
        data.insert(
            "IntendedFor".to_string(),
            Value::Array(updated.into_iter().map(Value::String).collect()),
        );
        write_json(json_path, &Value::Object(data), JsonStyle::INDENT_2)?;
    }
    Ok(changes)
}

fn subject_sessions(bids_dir: &Path) -> Result<BTreeMap<String, BTreeSet<Option<String>>>> {
    let mut out: BTreeMap<String, BTreeSet<Option<String>>> = BTreeMap::new();
    for path in sorted_files(bids_dir)? {
        if !file_name_str(&path).contains(".nii") {
            continue;
        }
        let Ok(rel) = path.strip_prefix(bids_dir) else {
            continue;
        };
        if let (Some(sub), ses) = subject_and_session(rel) {
            out.entry(sub).or_default().insert(ses);
        }
    }
    Ok(out)
}

fn update_all_intended_for(
    bids_dir: &Path,
    rel_map: &BTreeMap<String, String>,
    report: &mut OperationReport,
) -> Result<()> {
    for (subject, sessions) in subject_sessions(bids_dir)? {
        let sub_root = bids_dir.join(&subject);
        for session in sessions {
            let base = match &session {
                Some(ses) => sub_root.join(ses),
                None => sub_root.clone(),
            };
            for json_path in list_files_matching(&base.join("fmap"), |n| n.ends_with(".json"))? {
                match repair_intended_for(&json_path, &sub_root, rel_map, report.dry_run) {
                    Ok(details) if details.is_empty() => {}
                    Ok(details) => report.record(Action::Update {
                        path: json_path,
                        details,
                    }),
                    Err(err) => report.fail(&json_path, err),
                }
            }
        }
    }
    Ok(())
}

/// Drops `_run-<digits>` from every filename under `bids_dir` and repairs the
/// fieldmap references that pointed at the old names.
pub fn remove_run_entities(bids_dir: &Path, mover: &dyn Mover) -> Result<OperationReport> {
    require_dir(bids_dir)?;
    let mut report = OperationReport::new(mover.is_dry_run());
    let core = plan_run_removal(bids_dir, &mut report)?;
    if core.is_empty() {
        debug!(dir = %bids_dir.display(), "no files with run entities");
    } else {
        let all = expand_with_sidecars(&core);
        apply_plans(&all, mover, &mut report);
    }
    let rel_map = intended_for_map(&core, bids_dir);
    update_all_intended_for(bids_dir, &rel_map, &mut report)?;
    Ok(report)
}

fn is_session_anat(rel: &Path) -> bool {
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    match parts.iter().position(|p| p == "anat") {
        Some(i) if i >= 2 => parts[i - 2].starts_with("sub-") && parts[i - 1].starts_with("ses-"),
        _ => false,
    }
}

/// Puts `rec-` ahead of `run-` for anatomical images under `sub-*/ses-*/anat`.
pub fn fix_run_rec_order(bids_dir: &Path, mover: &dyn Mover) -> Result<OperationReport> {
    require_dir(bids_dir)?;
    let mut report = OperationReport::new(mover.is_dry_run());
    let mut plans = Vec::new();
    for img in sorted_files(bids_dir)? {
        let name = file_name_str(&img);
        if !is_nifti(name) {
            continue;
        }
        let Ok(rel) = img.strip_prefix(bids_dir) else {
            continue;
        };
        if !is_session_anat(rel) {
            continue;
        }
        let (stem, ext) = split_name_suffix(name);
        let Some(new_stem) = reorder_run_rec(stem) else {
            continue;
        };
        plans.push(RenamePlan {
            dst: img.with_file_name(format!("{}{}", new_stem, ext)),
            src: img.clone(),
        });
        let sidecar = img.with_file_name(format!("{}.json", stem));
        if sidecar.exists() {
            plans.push(RenamePlan {
                src: sidecar,
                dst: img.with_file_name(format!("{}.json", new_stem)),
            });
        }
    }
    apply_plans(&plans, mover, &mut report);
    Ok(report)
}

/// Gives every `*_m0scan.nii.gz` under `sub-*/<session>/perf` the canonical
/// `sub-<id>_<session>_m0scan` name, moving its sidecar along.
pub fn rename_m0scans(root: &Path, session: &str, mover: &dyn Mover) -> Result<OperationReport> {
    require_dir(root)?;
    let mut report = OperationReport::new(mover.is_dry_run());
    for sub_dir in curate_core::list_dirs_with_prefix(root, "sub-")? {
        let subject = file_name_str(&sub_dir).to_string();
        let perf = sub_dir.join(session).join("perf");
        for nii in list_files_matching(&perf, |n| n.ends_with("_m0scan.nii.gz"))? {
            let base = format!("{}_{}_m0scan", subject, session);
            let dst = perf.join(format!("{}.nii.gz", base));
            if nii == dst {
                continue;
            }
            if dst.exists() {
                report.skip(&nii, format!("destination exists: {}", dst.display()));
            } else {
                match mover.rename(&nii, &dst) {
                    Ok(()) => report.record(Action::Rename {
                        src: nii.clone(),
                        dst,
                    }),
                    Err(err) => {
                        report.fail(&nii, err);
                        continue;
                    }
                }
            }
            let src_json = curate_core::sidecar::sidecar_for(&nii);
            if !src_json.exists() {
                continue;
            }
            let dst_json = perf.join(format!("{}.json", base));
            if dst_json.exists() {
                report.skip(&src_json, format!("destination exists: {}", dst_json.display()));
                continue;
            }
            match mover.rename(&src_json, &dst_json) {
                Ok(()) => report.record(Action::Rename {
                    src: src_json,
                    dst: dst_json,
                }),
                Err(err) => report.fail(&src_json, err),
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{scratch_dir, touch};
    use curate_core::mover::{DryRunMover, FsMover};
    use serde_json::json;
    use std::fs;

    #[test]
    fn intended_for_substitutes_and_drops_stale_entries() {
        let root = scratch_dir("ifor");
        let sub = root.join("sub-01");
        touch(&sub.join("func/sub-01_task-rest_bold.nii.gz"), "");
        let fmap = sub.join("fmap/sub-01_phasediff.json");
        touch(
            &fmap,
            &json!({"IntendedFor": ["func/sub-01_task-rest_run-1_bold.nii.gz", "func/gone.nii.gz"]})
                .to_string(),
        );
        let mut map = BTreeMap::new();
        map.insert(
            "func/sub-01_task-rest_run-1_bold.nii.gz".to_string(),
            "func/sub-01_task-rest_bold.nii.gz".to_string(),
        );
        let changes = repair_intended_for(&fmap, &sub, &map, false).expect("repair");
        assert_eq!(changes.len(), 2);
        let data = read_sidecar(&fmap).expect("read back");
        assert_eq!(data["IntendedFor"], json!(["func/sub-01_task-rest_bold.nii.gz"]));
        let again = repair_intended_for(&fmap, &sub, &map, false).expect("second pass");
        assert!(again.is_empty(), "second pass should be a no-op");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn remove_run_renames_image_sidecars_and_fieldmaps() {
        let root = scratch_dir("remove_run");
        let func = root.join("sub-01/ses-1/func");
        touch(&func.join("sub-01_ses-1_task-rest_run-01_bold.nii.gz"), "img");
        touch(&func.join("sub-01_ses-1_task-rest_run-01_bold.json"), "{}");
        let fmap = root.join("sub-01/ses-1/fmap/sub-01_ses-1_epi.json");
        touch(
            &fmap,
            &json!({"IntendedFor": "ses-1/func/sub-01_ses-1_task-rest_run-01_bold.nii.gz"})
                .to_string(),
        );
        let report = remove_run_entities(&root, &FsMover).expect("remove run");
        assert_eq!(report.count("rename"), 2, "{:?}", report);
        assert!(func.join("sub-01_ses-1_task-rest_bold.nii.gz").exists());
        assert!(func.join("sub-01_ses-1_task-rest_bold.json").exists());
        let data = read_sidecar(&fmap).expect("fmap");
        assert_eq!(
            data["IntendedFor"],
            json!(["ses-1/func/sub-01_ses-1_task-rest_bold.nii.gz"])
        );
        assert!(report.errors.is_empty());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn remove_run_skips_collisions_and_dry_run_touches_nothing() {
        let root = scratch_dir("remove_run_collide");
        let func = root.join("sub-01/func");
        touch(&func.join("sub-01_task-a_run-1_bold.nii.gz"), "");
        touch(&func.join("sub-01_task-a_run-2_bold.nii.gz"), "");
        let mover = DryRunMover::new();
        let report = remove_run_entities(&root, &mover).expect("dry run");
        assert_eq!(report.count("rename"), 1);
        assert_eq!(report.skipped.len(), 1);
        assert!(func.join("sub-01_task-a_run-1_bold.nii.gz").exists());
        assert!(!func.join("sub-01_task-a_bold.nii.gz").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_root_is_a_configuration_error() {
        let root = scratch_dir("remove_run_missing").join("nope");
        assert!(remove_run_entities(&root, &FsMover).is_err());
    }

    #[test]
    fn fix_run_rec_only_touches_session_anat() {
        let root = scratch_dir("run_rec");
        let anat = root.join("sub-1/ses-1/anat");
        touch(&anat.join("sub-1_ses-1_run-01_rec-norm_T1w.nii.gz"), "");
        touch(&anat.join("sub-1_ses-1_run-01_rec-norm_T1w.json"), "{}");
        let other = root.join("sub-1/ses-1/func/sub-1_ses-1_run-01_rec-x_bold.nii.gz");
        touch(&other, "");
        let report = fix_run_rec_order(&root, &FsMover).expect("fix");
        assert_eq!(report.count("rename"), 2);
        assert!(anat.join("sub-1_ses-1_rec-norm_run-01_T1w.nii.gz").exists());
        assert!(anat.join("sub-1_ses-1_rec-norm_run-01_T1w.json").exists());
        assert!(other.exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn m0scan_gets_canonical_name() {
        let root = scratch_dir("m0");
        let perf = root.join("sub-7/ses-1/perf");
        touch(&perf.join("sub-7_ses-1_acq-x_m0scan.nii.gz"), "");
        touch(&perf.join("sub-7_ses-1_acq-x_m0scan.json"), "{}");
        let report = rename_m0scans(&root, "ses-1", &FsMover).expect("rename");
        assert_eq!(report.count("rename"), 2);
        assert!(perf.join("sub-7_ses-1_m0scan.nii.gz").exists());
        assert!(perf.join("sub-7_ses-1_m0scan.json").exists());
        let again = rename_m0scans(&root, "ses-1", &FsMover).expect("rerun");
        assert!(again.actions.is_empty());
        let _ = fs::remove_dir_all(root);
    }
}
