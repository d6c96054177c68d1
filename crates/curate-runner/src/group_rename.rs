//! Renames (or deletes) whole CuBIDS key/parameter groups, folding the
//! group's variant description into the `acq-` entity.

use crate::{Action, OperationReport};
use anyhow::{anyhow, Result};
use curate_core::bids::split_name_suffix;
use curate_core::mover::Mover;
use curate_core::table::Table;
use curate_core::{file_name_str, require_dir, CurateError};
use regex::Regex;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct GroupRenameOptions {
    pub bids_dir: PathBuf,
    pub summary_tsv: PathBuf,
    pub files_tsv: PathBuf,
    pub rename_log: PathBuf,
    /// Substring selecting `RenameEntitySet` values, e.g. `datatype-dwi`.
    pub search_term: String,
    pub delete_patterns: Vec<String>,
    /// Deletions only run when a log destination is given.
    pub delete_log: Option<PathBuf>,
    /// Long to short acquisition spellings, applied longest key first.
    pub acq_map: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupRenameReport {
    pub operations: OperationReport,
    pub renamed: Vec<(PathBuf, PathBuf)>,
    pub deleted: Vec<PathBuf>,
}

/// Loads an acquisition map from a JSON or YAML object, keeping file order.
pub fn load_acq_map(path: &Path) -> Result<Vec<(String, String)>> {
    let data = fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read acquisition map {}: {}", path.display(), e))?;
    let mapping: serde_yaml::Mapping = serde_yaml::from_str(&data)
        .map_err(|e| anyhow!("invalid acquisition map {}: {}", path.display(), e))?;
    let mut out = Vec::new();
    for (k, v) in mapping {
        match (k.as_str(), v.as_str()) {
            (Some(k), Some(v)) => out.push((k.to_string(), v.to_string())),
            _ => {
                return Err(anyhow!(
                    "acquisition map {} must map strings to strings",
                    path.display()
                ))
            }
        }
    }
    Ok(out)
}

/// Merges two acquisition labels without repeating either.
pub fn unify_acq(existing: &str, new: &str) -> String {
    if existing.is_empty() {
        return new.to_string();
    }
    if existing.contains(new) {
        return existing.to_string();
    }
    if new.contains(existing) {
        return new.to_string();
    }
    format!("{}_{}", existing, new)
}

/// Keeps only the first `VARIANT` marker.
pub fn merge_variants(acq: &str) -> String {
    let parts: Vec<&str> = acq.split("VARIANT").collect();
    if parts.len() < 2 {
        return acq.to_string();
    }
    format!("{}VARIANT{}", parts[0], parts[1..].concat())
}

/// Final acquisition label: unify, shorten via the map (longest key first),
/// then collapse variant markers.
pub fn modify_acq(existing: &str, new: &str, acq_map: &[(String, String)]) -> String {
    let mut merged = unify_acq(existing, new);
    let mut ordered: Vec<&(String, String)> = acq_map.iter().collect();
    ordered.sort_by_key(|(k, _)| std::cmp::Reverse(k.len()));
    for (long, short) in ordered {
        merged = merged.replace(long.as_str(), short);
    }
    merge_variants(&merged)
}

fn entity_value<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    let start = text.find(&format!("{}-", key))? + key.len() + 1;
    let rest = &text[start..];
    let end = rest.find('_').unwrap_or(rest.len());
    Some(&rest[..end]).filter(|v| !v.is_empty())
}

fn acq_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"acq-[^_]+").expect("static regex"))
}

/// `run-N` or `mt-on|off`, ending at `_` or end of stem.
fn insert_before_token(stem: &str) -> Option<usize> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"_(run-\d+|mt-(?:on|off))(_|$)").expect("static regex"));
    re.find(stem).map(|m| m.start())
}

/// New stem with `acq-<label>` replaced or inserted before `run-`/`mt-`,
/// else before the suffix, else at the end.
pub fn stem_with_acq(stem: &str, acq: &str, suffix: &str) -> String {
    let new_stem = if acq_re().is_match(stem) {
        let replacement = format!("acq-{}", acq);
        acq_re()
            .replace_all(stem, regex::NoExpand(&replacement))
            .into_owned()
    } else if let Some(idx) = insert_before_token(stem) {
        format!("{}_acq-{}{}", &stem[..idx], acq, &stem[idx..])
    } else {
        let suffix_token = format!("_{}", suffix);
        match stem.strip_suffix(&suffix_token) {
            Some(head) if !suffix.is_empty() => format!("{}_acq-{}{}", head, acq, suffix_token),
            _ => format!("{}_acq-{}", stem, acq),
        }
    };
    collapse_underscores(
        &new_stem
            .replace("ObliquityFalse", "Plumb")
            .replace("ObliquityTrue", "Oblique"),
    )
}

fn collapse_underscores(s: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"__+").expect("static regex"))
        .replace_all(s, "_")
        .into_owned()
}

fn companion_extensions(search_term: &str) -> Vec<&'static str> {
    if search_term.contains("dwi") && !search_term.contains("epi") {
        vec![".json", ".bvec", ".bval"]
    } else {
        vec![".json"]
    }
}

fn image_with_ext(image: &Path, ext: &str) -> PathBuf {
    let (stem, _) = split_name_suffix(file_name_str(image));
    image.with_file_name(format!("{}{}", stem, ext))
}

struct Sheets {
    summary: Table,
    files: Table,
}

impl Sheets {
    fn load(opts: &GroupRenameOptions) -> Result<Self> {
        for p in [&opts.summary_tsv, &opts.files_tsv] {
            if !p.is_file() {
                return Err(CurateError::MissingFile(p.clone()).into());
            }
        }
        let summary = Table::read_tsv(&opts.summary_tsv)?;
        summary.require_columns(&opts.summary_tsv, &["RenameEntitySet", "KeyParamGroup"])?;
        let files = Table::read_tsv(&opts.files_tsv)?;
        files.require_columns(&opts.files_tsv, &["KeyParamGroup", "FilePath"])?;
        Ok(Self { summary, files })
    }

    fn rename_sets(&self) -> Vec<String> {
        let mut out = Vec::new();
        for row in &self.summary.rows {
            let set = self.summary.cell(row, "RenameEntitySet").unwrap_or("").trim();
            if !out.iter().any(|s: &String| s == set) {
                out.push(set.to_string());
            }
        }
        out
    }

    fn sets_with_prefix(&self, pattern: &str) -> Vec<String> {
        self.rename_sets()
            .into_iter()
            .filter(|s| s.starts_with(pattern))
            .collect()
    }

    fn files_for_set(&self, set: &str) -> Vec<String> {
        let groups: HashSet<&str> = self
            .summary
            .rows
            .iter()
            .filter(|r| self.summary.cell(r, "RenameEntitySet").map(str::trim) == Some(set))
            .filter_map(|r| self.summary.cell(r, "KeyParamGroup"))
            .collect();
        self.files
            .rows
            .iter()
            .filter(|r| {
                self.files
                    .cell(r, "KeyParamGroup")
                    .map(|g| groups.contains(g))
                    .unwrap_or(false)
            })
            .filter_map(|r| self.files.cell(r, "FilePath").map(str::to_string))
            .collect()
    }
}

fn move_or_note(
    mover: &dyn Mover,
    src: &Path,
    dst: &Path,
    report: &mut OperationReport,
) {
    if !src.exists() {
        report.skip(src, "not found");
        return;
    }
    if dst.exists() {
        report.skip(src, format!("destination already exists: {}", dst.display()));
        return;
    }
    match mover.rename(src, dst) {
        Ok(()) => report.record(Action::Rename {
            src: src.to_path_buf(),
            dst: dst.to_path_buf(),
        }),
        Err(err) => report.fail(src, err),
    }
}

pub fn group_rename(opts: &GroupRenameOptions, mover: &dyn Mover) -> Result<GroupRenameReport> {
    require_dir(&opts.bids_dir)?;
    let sheets = Sheets::load(opts)?;
    let mut out = GroupRenameReport {
        operations: OperationReport::new(mover.is_dry_run()),
        ..Default::default()
    };
    let patterns: Vec<String> = sheets
        .rename_sets()
        .into_iter()
        .filter(|s| s.contains(&opts.search_term))
        .filter(|s| !opts.delete_patterns.contains(s))
        .collect();
    let extensions = companion_extensions(&opts.search_term);
    let mut done: HashSet<String> = HashSet::new();

    for pattern in &patterns {
        for set in sheets.sets_with_prefix(pattern) {
            if !done.insert(set.clone()) {
                continue;
            }
            let suffix = entity_value(&set, "suffix").unwrap_or("");
            let group_acq = entity_value(&set, "acquisition").unwrap_or("");
            let files = sheets.files_for_set(&set);
            info!(set = %set, files = files.len(), "renaming entity set");
            for rel in files {
                let image = opts.bids_dir.join(rel.trim_start_matches('/'));
                let name = file_name_str(&image).to_string();
                let (stem, ext) = split_name_suffix(&name);
                let existing = entity_value(stem, "acq").unwrap_or("");
                let acq = modify_acq(existing, group_acq, &opts.acq_map);
                if acq.is_empty() {
                    out.operations.skip(&image, "no acquisition label to apply");
                    continue;
                }
                let new_stem = stem_with_acq(stem, &acq, suffix);
                let new_image = image.with_file_name(format!("{}{}", new_stem, ext));
                out.renamed.push((image.clone(), new_image.clone()));
                move_or_note(mover, &image, &new_image, &mut out.operations);
                for ext in &extensions {
                    let src = image_with_ext(&image, ext);
                    let dst = image_with_ext(&new_image, ext);
                    move_or_note(mover, &src, &dst, &mut out.operations);
                }
            }
        }
    }

    let mut log = Table::new(vec!["orig_name".to_string(), "rename_to".to_string()]);
    log.rows = out
        .renamed
        .iter()
        .map(|(a, b)| vec![a.display().to_string(), b.display().to_string()])
        .collect();
    log.write_tsv(&opts.rename_log)?;

    if let Some(delete_log) = &opts.delete_log {
        for pattern in &opts.delete_patterns {
            for set in sheets.sets_with_prefix(pattern) {
                for rel in sheets.files_for_set(&set) {
                    let image = opts.bids_dir.join(rel.trim_start_matches('/'));
                    let mut targets = vec![image.clone()];
                    targets.extend(extensions.iter().map(|e| image_with_ext(&image, e)));
                    for target in targets {
                        if !target.exists() {
                            out.operations.skip(&target, "not found for deletion");
                            continue;
                        }
                        match mover.remove(&target) {
                            Ok(()) => {
                                out.operations.record(Action::Remove {
                                    path: target.clone(),
                                });
                                out.deleted.push(target);
                            }
                            Err(err) => out.operations.fail(&target, err),
                        }
                    }
                }
            }
        }
        let mut log = Table::new(vec!["file_deleted".to_string()]);
        log.rows = out
            .deleted
            .iter()
            .map(|p| vec![p.display().to_string()])
            .collect();
        log.write_tsv(delete_log)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{scratch_dir, touch};
    use curate_core::mover::FsMover;

    #[test]
    fn unify_acq_prefers_containing_label() {
        assert_eq!(unify_acq("", "VARIANTA"), "VARIANTA");
        assert_eq!(unify_acq("multibandVARIANTA", "VARIANTA"), "multibandVARIANTA");
        assert_eq!(unify_acq("mb", "mbVARIANTB"), "mbVARIANTB");
        assert_eq!(unify_acq("mb", "VARIANTB"), "mb_VARIANTB");
    }

    #[test]
    fn modify_acq_applies_longest_key_first_and_merges_variants() {
        let map = vec![
            ("Obliquity".to_string(), "Obl".to_string()),
            ("ObliquityTrue".to_string(), "Oblique".to_string()),
        ];
        assert_eq!(
            modify_acq("mb", "VARIANTObliquityTrueVARIANTNumVolumes", &map),
            "mb_VARIANTObliqueNumVolumes"
        );
        assert_eq!(merge_variants("noVariants"), "noVariants");
    }

    #[test]
    fn stem_with_acq_replaces_or_inserts() {
        assert_eq!(
            stem_with_acq("sub-1_acq-mb_run-1_bold", "mbVARIANTX", "bold"),
            "sub-1_acq-mbVARIANTX_run-1_bold"
        );
        assert_eq!(
            stem_with_acq("sub-1_task-rest_run-2_bold", "X", "bold"),
            "sub-1_task-rest_acq-X_run-2_bold"
        );
        assert_eq!(
            stem_with_acq("sub-1_mt-on_MTR", "X", "MTR"),
            "sub-1_acq-X_mt-on_MTR"
        );
        assert_eq!(stem_with_acq("sub-1_dwi", "X", "dwi"), "sub-1_acq-X_dwi");
        assert_eq!(stem_with_acq("sub-1_thing", "X", ""), "sub-1_thing_acq-X");
        assert_eq!(
            stem_with_acq("sub-1_dwi", "VARIANTObliquityFalse", "dwi"),
            "sub-1_acq-VARIANTPlumb_dwi"
        );
    }

    #[test]
    fn group_rename_moves_dwi_companions_and_logs() {
        let root = scratch_dir("group_rename");
        let bids = root.join("bids");
        let dwi = bids.join("sub-1/ses-1/dwi");
        for ext in [".nii.gz", ".json", ".bvec", ".bval"] {
            touch(&dwi.join(format!("sub-1_ses-1_dwi{}", ext)), "");
        }
        touch(&bids.join("sub-2/ses-1/dwi/sub-2_ses-1_dwi.nii.gz"), "");
        let summary = root.join("summary.tsv");
        touch(
            &summary,
            "RenameEntitySet\tKeyParamGroup\n\
             datatype-dwi_suffix-dwi_acquisition-VARIANTNumVolumes\tkpg1\n\
             datatype-dwi_suffix-dwi_acquisition-VARIANTDrop\tkpg2\n",
        );
        let files = root.join("files.tsv");
        touch(
            &files,
            "KeyParamGroup\tFilePath\n\
             kpg1\t/sub-1/ses-1/dwi/sub-1_ses-1_dwi.nii.gz\n\
             kpg2\t/sub-2/ses-1/dwi/sub-2_ses-1_dwi.nii.gz\n",
        );
        let opts = GroupRenameOptions {
            bids_dir: bids.clone(),
            summary_tsv: summary,
            files_tsv: files,
            rename_log: root.join("rename.tsv"),
            search_term: "datatype-dwi".to_string(),
            delete_patterns: vec!["datatype-dwi_suffix-dwi_acquisition-VARIANTDrop".to_string()],
            delete_log: Some(root.join("deleted.tsv")),
            acq_map: Vec::new(),
        };
        let report = group_rename(&opts, &FsMover).expect("group rename");
        assert_eq!(report.renamed.len(), 1);
        for ext in [".nii.gz", ".json", ".bvec", ".bval"] {
            assert!(dwi.join(format!("sub-1_ses-1_acq-VARIANTNumVolumes_dwi{}", ext)).exists());
        }
        assert_eq!(report.deleted.len(), 1);
        assert!(!bids.join("sub-2/ses-1/dwi/sub-2_ses-1_dwi.nii.gz").exists());
        let log = fs::read_to_string(root.join("rename.tsv")).expect("log");
        assert!(log.starts_with("orig_name\trename_to\n"));
        let deleted = fs::read_to_string(root.join("deleted.tsv")).expect("delete log");
        assert!(deleted.starts_with("file_deleted\n"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn existing_destination_is_skipped_not_overwritten() {
        let root = scratch_dir("group_rename_taken");
        let bids = root.join("bids");
        let func = bids.join("sub-1/ses-1/func");
        touch(&func.join("sub-1_ses-1_task-rest_bold.nii.gz"), "image");
        touch(&func.join("sub-1_ses-1_task-rest_bold.json"), "{\"new\":1}");
        touch(&func.join("sub-1_ses-1_task-rest_acq-VARIANTX_bold.json"), "{\"precious\":1}");
        let summary = root.join("summary.tsv");
        touch(
            &summary,
            "RenameEntitySet\tKeyParamGroup\ndatatype-func_suffix-bold_acquisition-VARIANTX\tkpg1\n",
        );
        let files = root.join("files.tsv");
        touch(
            &files,
            "KeyParamGroup\tFilePath\nkpg1\t/sub-1/ses-1/func/sub-1_ses-1_task-rest_bold.nii.gz\n",
        );
        let opts = GroupRenameOptions {
            bids_dir: bids,
            summary_tsv: summary,
            files_tsv: files,
            rename_log: root.join("rename.tsv"),
            search_term: "datatype-func".to_string(),
            ..Default::default()
        };
        let report = group_rename(&opts, &FsMover).expect("group rename");
        assert_eq!(report.operations.count("rename"), 1);
        assert!(report
            .operations
            .skipped
            .iter()
            .any(|s| s.reason.starts_with("destination already exists")));
        assert_eq!(
            fs::read_to_string(func.join("sub-1_ses-1_task-rest_acq-VARIANTX_bold.json")).expect("kept"),
            "{\"precious\":1}"
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn acq_map_keeps_file_order() {
        let root = scratch_dir("acq_map");
        let path = root.join("map.json");
        touch(&path, "{\"VARIANTLong\": \"L\", \"VARIANTA\": \"A\"}");
        let map = load_acq_map(&path).expect("map");
        assert_eq!(map[0], ("VARIANTLong".to_string(), "L".to_string()));
        assert_eq!(map.len(), 2);
        let _ = fs::remove_dir_all(root);
    }
}
