//! Self-report phenotype tables: harvesting Flywheel `info` metadata, splitting
//! item-wise exports per instrument, and adding summary scores.

pub mod score;
pub mod separate;

use anyhow::Result;
use curate_core::sidecar::{read_json, value_kind, value_to_plain_string};
use curate_core::table::Table;
use curate_core::{file_name_str, list_dirs_with_prefix, require_dir};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub use score::{score_instruments, ScoreReport};
pub use separate::{separate_instruments, SeparateReport};

/// `<root>/<id>/<id>.flywheel.json` for every immediate subject directory.
pub fn subject_jsons(subjects_root: &Path) -> Result<Vec<(String, PathBuf)>> {
    require_dir(subjects_root)?;
    let mut out = Vec::new();
    for dir in list_dirs_with_prefix(subjects_root, "")? {
        let id = file_name_str(&dir).to_string();
        let candidate = dir.join(format!("{}.flywheel.json", id));
        if candidate.is_file() {
            out.push((id, candidate));
        }
    }
    Ok(out)
}

/// Dot-joined leaf paths of nested objects. Lists stay whole.
pub fn flatten(obj: &Map<String, Value>) -> BTreeMap<String, Value> {
    fn walk(obj: &Map<String, Value>, parent: &str, out: &mut BTreeMap<String, Value>) {
        for (key, value) in obj {
            let path = if parent.is_empty() {
                key.clone()
            } else {
                format!("{}.{}", parent, key)
            };
            match value {
                Value::Object(inner) => walk(inner, &path, out),
                other => {
                    out.insert(path, other.clone());
                }
            }
        }
    }
    let mut out = BTreeMap::new();
    walk(obj, "", &mut out);
    out
}

/// Null, empty strings and empty containers count as absent; `0` and `false`
/// do not.
pub fn is_absent(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

fn load_subject(path: &Path) -> Option<Value> {
    match read_json(path) {
        Ok(v) => Some(v),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "skipping unreadable subject JSON");
            None
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldSummary {
    pub present: usize,
    pub types: BTreeSet<&'static str>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InfoSummary {
    pub candidates: usize,
    /// Subject files that parsed.
    pub subjects: usize,
    pub fields: BTreeMap<String, FieldSummary>,
}

/// Presence of each flattened `info` field across subjects, written as
/// `field, n_present, n_missing, present_pct, types`.
pub fn summarize_info(subjects_root: &Path, output: &Path) -> Result<InfoSummary> {
    let files = subject_jsons(subjects_root)?;
    let mut summary = InfoSummary {
        candidates: files.len(),
        ..Default::default()
    };
    for (_, path) in &files {
        let Some(data) = load_subject(path) else {
            continue;
        };
        summary.subjects += 1;
        let Some(Value::Object(info)) = data.get("info") else {
            continue;
        };
        for (field, value) in flatten(info) {
            if is_absent(&value) {
                continue;
            }
            let entry = summary.fields.entry(field).or_default();
            entry.present += 1;
            entry.types.insert(value_kind(&value));
        }
    }

    let mut table = Table::new(
        ["field", "n_present", "n_missing", "present_pct", "types"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
    );
    let total = summary.subjects;
    for (field, stats) in &summary.fields {
        let pct = if total > 0 {
            stats.present as f64 / total as f64
        } else {
            0.0
        };
        table.rows.push(vec![
            field.clone(),
            stats.present.to_string(),
            total.saturating_sub(stats.present).to_string(),
            format!("{:.4}", pct),
            stats.types.iter().copied().collect::<Vec<_>>().join(","),
        ]);
    }
    if let Some(parent) = output.parent() {
        curate_core::ensure_dir(parent)?;
    }
    table.write_tsv(output)?;
    debug!(fields = summary.fields.len(), subjects = total, "info summary written");
    Ok(summary)
}

/// Splits repeated and comma-separated exclude values, dropping duplicates.
pub fn split_excludes<S: AsRef<str>>(values: &[S]) -> Vec<String> {
    let items = values
        .iter()
        .flat_map(|v| v.as_ref().split(','))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    curate_core::sidecar::unique_preserve_order(items)
}

/// An exclude drops the field itself and everything beneath it.
pub fn is_excluded(field: &str, excludes: &[String]) -> bool {
    excludes
        .iter()
        .any(|ex| field == ex || field.starts_with(&format!("{}.", ex)))
}

/// Resolves a dot path under `info`. Objects flatten; a scalar or list becomes
/// one field named after the last segment; an unresolvable path is empty.
pub fn resolve_subfield(info: &Value, subpath: &str) -> BTreeMap<String, Value> {
    let segments: Vec<&str> = subpath.split('.').filter(|s| !s.is_empty()).collect();
    let mut node = info;
    if !node.is_object() {
        return BTreeMap::new();
    }
    for seg in &segments {
        match node.get(*seg) {
            Some(next) => node = next,
            None => return BTreeMap::new(),
        }
    }
    match node {
        Value::Object(obj) => flatten(obj),
        other => {
            let leaf = segments.last().copied().unwrap_or("value");
            BTreeMap::from([(leaf.to_string(), other.clone())])
        }
    }
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
        other => value_to_plain_string(other),
    }
}

/// One row per subject holding the flattened `info.<subfield>` values.
/// Returns the number of rows and field columns written.
pub fn extract_info_subfield(
    subjects_root: &Path,
    subfield: &str,
    excludes: &[String],
    output: &Path,
) -> Result<(usize, usize)> {
    let mut rows: Vec<(String, BTreeMap<String, String>)> = Vec::new();
    let mut fields: BTreeSet<String> = BTreeSet::new();
    for (id, path) in subject_jsons(subjects_root)? {
        let Some(data) = load_subject(&path) else {
            continue;
        };
        let info = data.get("info").cloned().unwrap_or(Value::Null);
        let kept: BTreeMap<String, String> = resolve_subfield(&info, subfield)
            .into_iter()
            .filter(|(field, _)| !is_excluded(field, excludes))
            .map(|(field, value)| (field, cell_text(&value)))
            .collect();
        fields.extend(kept.keys().cloned());
        rows.push((format!("sub-{}", id), kept));
    }

    let mut headers = vec!["participant_id".to_string()];
    headers.extend(fields.iter().cloned());
    let mut table = Table::new(headers);
    for (participant, values) in &rows {
        let mut row = vec![participant.clone()];
        row.extend(fields.iter().map(|f| values.get(f).cloned().unwrap_or_default()));
        table.rows.push(row);
    }
    if let Some(parent) = output.parent() {
        curate_core::ensure_dir(parent)?;
    }
    table.write_tsv(output)?;
    Ok((rows.len(), fields.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{scratch_dir, touch};
    use serde_json::json;
    use std::fs;

    fn subject(root: &Path, id: &str, body: Value) {
        touch(&root.join(id).join(format!("{}.flywheel.json", id)), &body.to_string());
    }

    #[test]
    fn summary_counts_presence_and_types() {
        let root = scratch_dir("pheno_summary");
        subject(&root, "100", json!({"info": {"demo": {"age": 12, "sex": "F"}, "notes": ""}}));
        subject(&root, "101", json!({"info": {"demo": {"age": 13.5, "sex": null}}}));
        subject(&root, "102", json!({"label": "no info"}));
        touch(&root.join("103/103.flywheel.json"), "{not json");
        touch(&root.join("104/other.json"), "{}");
        let out = root.join("summary.tsv");
        let summary = summarize_info(&root, &out).expect("summary");
        assert_eq!(summary.candidates, 4);
        assert_eq!(summary.subjects, 3);
        let text = fs::read_to_string(&out).expect("tsv");
        assert_eq!(
            text,
            "field\tn_present\tn_missing\tpresent_pct\ttypes\n\
             demo.age\t2\t1\t0.6667\tfloat,int\n\
             demo.sex\t1\t2\t0.3333\tstr\n"
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn extract_flattens_and_excludes() {
        let root = scratch_dir("pheno_extract");
        subject(
            &root,
            "A1",
            json!({"info": {"demo": {"age": 12, "body": {"height": 150, "weight": 40}, "langs": ["en", "es"]}}}),
        );
        subject(&root, "B2", json!({"info": {"other": 1}}));
        let out = root.join("demo.tsv");
        let excludes = split_excludes(&["body.weight,", "langs", "langs"]);
        assert_eq!(excludes, vec!["body.weight", "langs"]);
        let (rows, cols) = extract_info_subfield(&root, "demo", &excludes, &out).expect("extract");
        assert_eq!((rows, cols), (2, 2));
        assert_eq!(
            fs::read_to_string(&out).expect("tsv"),
            "participant_id\tage\tbody.height\nsub-A1\t12\t150\nsub-B2\t\t\n"
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn scalar_subfield_uses_leaf_name() {
        let info = json!({"session1": {"score": [1, 2]}});
        let got = resolve_subfield(&info, "session1.score");
        assert_eq!(got.get("score"), Some(&json!([1, 2])));
        assert!(resolve_subfield(&info, "session2").is_empty());
        assert!(is_excluded("body.height", &["body".to_string()]));
        assert!(!is_excluded("bodyfat", &["body".to_string()]));
    }
}
