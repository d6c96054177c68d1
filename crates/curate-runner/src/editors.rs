//! Field-level sidecar edits. Each editor writes a file only when its value
//! actually changes, so a second pass over the same tree is a no-op.

use crate::{Action, OperationReport};
use anyhow::Result;
use curate_core::sidecar::{read_json, read_sidecar, value_to_plain_string, write_json, JsonStyle};
use curate_core::{file_name_str, list_dirs_with_prefix, list_files_matching, require_dir};
use regex::Regex;
use serde_json::{Map, Value};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::warn;
use walkdir::WalkDir;

fn json_files_under(root: &Path, keep: impl Fn(&Path) -> bool) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type().is_file() && file_name_str(path).ends_with(".json") && keep(path) {
            out.push(entry.into_path());
        }
    }
    Ok(out)
}

fn has_component(path: &Path, name: &str) -> bool {
    path.components().any(|c| c.as_os_str() == name)
}

fn bids_uri_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"bids::sub-[^/]+/").expect("static regex"))
}

/// Turns `bids::sub-XX/ses-1/...` entries of fieldmap `IntendedFor` back into
/// subject-relative paths.
pub fn strip_bids_uris(bids_dir: &Path, dry_run: bool) -> Result<OperationReport> {
    require_dir(bids_dir)?;
    let mut report = OperationReport::new(dry_run);
    let files = json_files_under(bids_dir, |p| {
        p.strip_prefix(bids_dir)
            .map(|rel| has_component(rel, "fmap"))
            .unwrap_or(false)
    })?;
    for path in files {
        let mut data = match read_sidecar(&path) {
            Ok(d) => d,
            Err(err) => {
                report.fail(&path, err);
                continue;
            }
        };
        let stripped = match data.get("IntendedFor") {
            Some(Value::String(s)) => Value::String(bids_uri_re().replace_all(s, "").into_owned()),
            Some(Value::Array(items)) => Value::Array(
                items
                    .iter()
                    .map(|v| match v {
                        Value::String(s) => Value::String(bids_uri_re().replace_all(s, "").into_owned()),
                        other => other.clone(),
                    })
                    .collect(),
            ),
            _ => continue,
        };
        if data.get("IntendedFor") == Some(&stripped) {
            continue;
        }
        data.insert("IntendedFor".to_string(), stripped);
        if !dry_run {
            if let Err(err) = write_json(&path, &Value::Object(data), JsonStyle::INDENT_4) {
                report.fail(&path, err);
                continue;
            }
        }
        report.record(Action::Update {
            path,
            details: vec!["IntendedFor: removed BIDS URI prefix".to_string()],
        });
    }
    Ok(report)
}

/// Time of day with microsecond precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeOfDay {
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
    pub micro: u32,
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}:{:02}", self.hour, self.minute, self.second)
    }
}

fn micro_from(frac: Option<&str>) -> u32 {
    frac.map(|f| format!("{:0<6}", f).parse().unwrap_or(0))
        .unwrap_or(0)
}

/// Parses `H:MM`, `HH:MM:SS[.ffffff]` or `HHMMSS[.ffffff]`; out-of-range
/// fields are rejected rather than guessed.
pub fn parse_time(value: &str) -> Option<TimeOfDay> {
    static COLON: OnceLock<Regex> = OnceLock::new();
    static COMPACT: OnceLock<Regex> = OnceLock::new();
    let colon = COLON.get_or_init(|| {
        Regex::new(r"^(\d{1,2}):(\d{2})(?::(\d{2})(?:\.(\d{1,6}))?)?$").expect("static regex")
    });
    let compact = COMPACT.get_or_init(|| {
        Regex::new(r"^(\d{2})(\d{2})(\d{2})(?:\.(\d{1,6}))?$").expect("static regex")
    });
    let s = value.trim();
    let caps = colon.captures(s).or_else(|| compact.captures(s))?;
    let hour: u32 = caps.get(1)?.as_str().parse().ok()?;
    let minute: u32 = caps.get(2)?.as_str().parse().ok()?;
    let second: u32 = caps.get(3).map(|m| m.as_str().parse().unwrap_or(0)).unwrap_or(0);
    let micro = micro_from(caps.get(4).map(|m| m.as_str()));
    if hour > 23 || minute > 59 || second > 59 {
        return None;
    }
    Some(TimeOfDay {
        hour,
        minute,
        second,
        micro,
    })
}

/// Half an hour or more past the hour rounds up, wrapping 23 to 0.
pub fn round_to_nearest_hour(t: TimeOfDay) -> TimeOfDay {
    let offset_us = (u64::from(t.minute) * 60 + u64::from(t.second)) * 1_000_000 + u64::from(t.micro);
    let hour = if offset_us >= 30 * 60 * 1_000_000 {
        (t.hour + 1) % 24
    } else {
        t.hour
    };
    TimeOfDay {
        hour,
        minute: 0,
        second: 0,
        micro: 0,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TimeOutcome {
    Rounded { before: String, after: String, changed: bool },
    Skipped { before: String, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimeEntry {
    pub path: PathBuf,
    pub outcome: TimeOutcome,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeRoundingReport {
    pub bids_dir: PathBuf,
    pub dry_run: bool,
    pub scanned: usize,
    pub entries: Vec<TimeEntry>,
    /// Files that could not be read or rewritten.
    pub errors: Vec<(PathBuf, String)>,
}

impl TimeRoundingReport {
    pub fn changed(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.outcome, TimeOutcome::Rounded { changed: true, .. }))
            .count()
    }

    pub fn unparseable(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.outcome, TimeOutcome::Skipped { .. }))
            .count()
    }

    /// Plain-text listing of every file that carried an `AcquisitionTime`.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("# AcquisitionTime rounding report\n");
        out.push_str(&format!("BIDS dir: {}\n", self.bids_dir.display()));
        out.push_str(&format!("Dry run: {}\n", self.dry_run));
        out.push_str(&format!("Total JSON files scanned: {}\n", self.scanned));
        out.push_str(&format!("Files with AcquisitionTime: {}\n", self.entries.len()));
        out.push_str(&format!("Files changed: {}\n", self.changed()));
        out.push_str(&format!("Files skipped (unparseable): {}\n", self.unparseable()));
        out.push('\n');
        for e in &self.entries {
            match &e.outcome {
                TimeOutcome::Rounded {
                    before,
                    after,
                    changed,
                } => out.push_str(&format!(
                    "{}: AcquisitionTime: {} -> {}{}\n",
                    e.path.display(),
                    before,
                    after,
                    if *changed { " [CHANGED]" } else { "" }
                )),
                TimeOutcome::Skipped { before, reason } => out.push_str(&format!(
                    "{}: AcquisitionTime: {} -> SKIPPED ({})\n",
                    e.path.display(),
                    before,
                    reason
                )),
            }
        }
        out
    }
}

pub const DEFAULT_TIME_REPORT: &str = "acquisition_time_rounding_report.txt";

/// Rounds `AcquisitionTime` in every JSON file to the nearest hour and writes
/// the before/after listing to `report_path`.
pub fn round_acquisition_times(
    bids_dir: &Path,
    report_path: &Path,
    dry_run: bool,
) -> Result<TimeRoundingReport> {
    require_dir(bids_dir)?;
    let files = json_files_under(bids_dir, |_| true)?;
    let mut report = TimeRoundingReport {
        bids_dir: fs::canonicalize(bids_dir).unwrap_or_else(|_| bids_dir.to_path_buf()),
        dry_run,
        scanned: files.len(),
        ..Default::default()
    };
    for path in files {
        let mut data = match read_json(&path) {
            Ok(Value::Object(map)) => map,
            Ok(_) => continue,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "unreadable JSON");
                report.errors.push((path, err.to_string()));
                continue;
            }
        };
        let Some(raw) = data.get("AcquisitionTime") else {
            continue;
        };
        let before = value_to_plain_string(raw);
        let Some(parsed) = parse_time(&before) else {
            report.entries.push(TimeEntry {
                path,
                outcome: TimeOutcome::Skipped {
                    before,
                    reason: "Unrecognized time format".to_string(),
                },
            });
            continue;
        };
        let rounded = round_to_nearest_hour(parsed);
        let changed = parsed.minute != 0 || parsed.second != 0 || parsed.micro != 0;
        let after = if changed { rounded.to_string() } else { before.clone() };
        if changed && !dry_run {
            data.insert("AcquisitionTime".to_string(), Value::String(after.clone()));
            if let Err(err) = write_json(&path, &Value::Object(data), JsonStyle::INDENT_4_NEWLINE) {
                report.errors.push((path, err.to_string()));
                continue;
            }
        }
        report.entries.push(TimeEntry {
            path,
            outcome: TimeOutcome::Rounded {
                before,
                after,
                changed,
            },
        });
    }
    curate_core::atomic_write_bytes(report_path, report.render().as_bytes())?;
    Ok(report)
}

fn is_false_like(value: &Value) -> bool {
    match value {
        Value::Bool(b) => !*b,
        Value::String(s) => s.trim().eq_ignore_ascii_case("false"),
        _ => false,
    }
}

/// Sets `BackgroundSuppression` to `true` in ASL sidecars under `perf/`
/// (outside `derivatives/`) where it is currently false.
pub fn set_background_suppression(bids_dir: &Path, dry_run: bool) -> Result<OperationReport> {
    require_dir(bids_dir)?;
    let mut report = OperationReport::new(dry_run);
    let files = json_files_under(bids_dir, |p| {
        let Ok(rel) = p.strip_prefix(bids_dir) else {
            return false;
        };
        file_name_str(p).ends_with("_asl.json")
            && has_component(rel, "perf")
            && !has_component(rel, "derivatives")
    })?;
    for path in files {
        let mut data = match read_sidecar(&path) {
            Ok(d) => d,
            Err(err) => {
                report.fail(&path, err);
                continue;
            }
        };
        match data.get("BackgroundSuppression") {
            None => {
                report.skip(&path, "missing field");
                continue;
            }
            Some(v) if !is_false_like(v) => {
                report.skip(&path, "already true or non-false");
                continue;
            }
            Some(_) => {}
        }
        data.insert("BackgroundSuppression".to_string(), Value::Bool(true));
        if !dry_run {
            if let Err(err) = write_json(&path, &Value::Object(data), JsonStyle::INDENT_4_NEWLINE) {
                report.fail(&path, err);
                continue;
            }
        }
        report.record(Action::Update {
            path,
            details: vec!["BackgroundSuppression: false -> true".to_string()],
        });
    }
    Ok(report)
}

fn json_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(p, q)| json_equal(p, q))
        }
        _ => a == b,
    }
}

fn set_if_different(
    data: &mut Map<String, Value>,
    key: &str,
    value: Value,
    details: &mut Vec<String>,
) {
    if data.get(key).map(|old| json_equal(old, &value)).unwrap_or(false) {
        return;
    }
    details.push(format!("{} = {}", key, value));
    data.insert(key.to_string(), value);
}

fn sync_shared_fields(path: &Path, data: &mut Map<String, Value>, details: &mut Vec<String>) {
    match data.get("RepetitionTime").cloned() {
        Some(tr) => set_if_different(data, "RepetitionTimePreparation", tr, details),
        None => warn!(path = %path.display(), "RepetitionTime missing; RepetitionTimePreparation not set"),
    }
    let dims: Option<Vec<Value>> = ["VoxelSizeDim1", "VoxelSizeDim2", "VoxelSizeDim3"]
        .iter()
        .map(|k| data.get(*k).cloned())
        .collect();
    match dims {
        Some(dims) => set_if_different(data, "AcquisitionVoxelSize", Value::Array(dims), details),
        None => warn!(path = %path.display(), "VoxelSizeDim keys missing; AcquisitionVoxelSize not set"),
    }
}

fn sync_asl(path: &Path, data: &mut Map<String, Value>) -> Vec<String> {
    let mut details = Vec::new();
    match data.get("NumVolumes").and_then(Value::as_f64) {
        Some(n) => {
            if let Some(pairs) = serde_json::Number::from_f64(n / 2.0) {
                set_if_different(data, "TotalAcquiredPairs", Value::Number(pairs), &mut details);
            }
        }
        None => warn!(path = %path.display(), "NumVolumes missing; TotalAcquiredPairs not set"),
    }
    sync_shared_fields(path, data, &mut details);
    details
}

fn session_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"ses-[a-zA-Z0-9]+").expect("static regex"))
}

fn sync_m0(path: &Path, data: &mut Map<String, Value>, session: &str) -> Vec<String> {
    let mut details = Vec::new();
    match data.get("IntendedFor").cloned() {
        Some(Value::String(s)) => {
            let fixed = session_token_re().replace_all(&s, regex::NoExpand(session)).into_owned();
            details.push(format!("IntendedFor = [{}]", fixed));
            data.insert("IntendedFor".to_string(), Value::Array(vec![Value::String(fixed)]));
        }
        Some(Value::Array(items)) => {
            let fixed: Vec<Value> = items
                .iter()
                .map(|v| match v {
                    Value::String(s) => {
                        Value::String(session_token_re().replace_all(s, regex::NoExpand(session)).into_owned())
                    }
                    other => other.clone(),
                })
                .collect();
            if fixed != items {
                details.push("IntendedFor sessions normalised".to_string());
                data.insert("IntendedFor".to_string(), Value::Array(fixed));
            }
        }
        Some(_) => warn!(path = %path.display(), "IntendedFor is neither string nor list"),
        None => warn!(path = %path.display(), "IntendedFor missing"),
    }
    sync_shared_fields(path, data, &mut details);
    details
}

/// Keeps derived perfusion fields in `sub-*/<session>/perf` consistent with
/// their sources.
pub fn sync_perf_metadata(bids_dir: &Path, session: &str, dry_run: bool) -> Result<OperationReport> {
    require_dir(bids_dir)?;
    let mut report = OperationReport::new(dry_run);
    for sub_dir in list_dirs_with_prefix(bids_dir, "sub-")? {
        let perf = sub_dir.join(session).join("perf");
        let targets = list_files_matching(&perf, |n| {
            n.ends_with("_asl.json") || n.ends_with("_m0scan.json")
        })?;
        for path in targets {
            let mut data = match read_sidecar(&path) {
                Ok(d) => d,
                Err(err) => {
                    report.fail(&path, err);
                    continue;
                }
            };
            let details = if file_name_str(&path).ends_with("_asl.json") {
                sync_asl(&path, &mut data)
            } else {
                sync_m0(&path, &mut data, session)
            };
            if details.is_empty() {
                continue;
            }
            if !dry_run {
                if let Err(err) = write_json(&path, &Value::Object(data), JsonStyle::INDENT_4) {
                    report.fail(&path, err);
                    continue;
                }
            }
            report.record(Action::Update { path, details });
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{mtime_of, scratch_dir, touch};
    use serde_json::json;

    fn t(h: u32, m: u32, s: u32) -> TimeOfDay {
        TimeOfDay {
            hour: h,
            minute: m,
            second: s,
            micro: 0,
        }
    }

    #[test]
    fn parse_time_accepts_both_layouts() {
        assert_eq!(parse_time("14:29:59.5"), Some(TimeOfDay { micro: 500_000, ..t(14, 29, 59) }));
        assert_eq!(parse_time("9:05"), Some(t(9, 5, 0)));
        assert_eq!(parse_time("142959"), Some(t(14, 29, 59)));
        assert_eq!(parse_time("24:00:00"), None);
        assert_eq!(parse_time("12:60"), None);
        assert_eq!(parse_time("noon"), None);
    }

    #[test]
    fn rounding_uses_thirty_minute_threshold() {
        assert_eq!(round_to_nearest_hour(t(14, 29, 59)), t(14, 0, 0));
        assert_eq!(round_to_nearest_hour(t(14, 30, 0)), t(15, 0, 0));
        assert_eq!(round_to_nearest_hour(t(23, 31, 0)), t(0, 0, 0));
        let almost = TimeOfDay { micro: 999_999, ..t(10, 29, 59) };
        assert_eq!(round_to_nearest_hour(almost), t(10, 0, 0));
    }

    #[test]
    fn acquisition_times_round_once_and_report() {
        let root = scratch_dir("acq_time");
        let a = root.join("sub-1/func/a.json");
        touch(&a, &json!({"AcquisitionTime": "23:31:00"}).to_string());
        touch(&root.join("sub-1/func/b.json"), &json!({"AcquisitionTime": "bad"}).to_string());
        touch(&root.join("sub-1/func/c.json"), &json!({"AcquisitionTime": "08:00:00"}).to_string());
        touch(&root.join("sub-1/func/d.json"), &json!({"Other": 1}).to_string());
        let report_path = root.join("report.txt");
        let report = round_acquisition_times(&root, &report_path, false).expect("round");
        assert_eq!(report.scanned, 4);
        assert_eq!(report.entries.len(), 3);
        assert_eq!(report.changed(), 1);
        assert_eq!(report.unparseable(), 1);
        let text = fs::read_to_string(&a).expect("a");
        assert!(text.contains("\"AcquisitionTime\": \"00:00:00\""));
        assert!(text.ends_with("}\n"));
        let listing = fs::read_to_string(&report_path).expect("report");
        assert!(listing.contains("23:31:00 -> 00:00:00 [CHANGED]"), "{}", listing);
        assert!(listing.contains("bad -> SKIPPED (Unrecognized time format)"));
        let second = round_acquisition_times(&root, &report_path, false).expect("again");
        assert_eq!(second.changed(), 0);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn background_suppression_flips_false_only() {
        let root = scratch_dir("bgs");
        let perf = root.join("sub-1/ses-1/perf");
        touch(&perf.join("a_asl.json"), &json!({"BackgroundSuppression": false}).to_string());
        touch(&perf.join("b_asl.json"), &json!({"BackgroundSuppression": " FALSE "}).to_string());
        touch(&perf.join("c_asl.json"), &json!({"BackgroundSuppression": true}).to_string());
        touch(&perf.join("d_asl.json"), &json!({}).to_string());
        touch(
            &root.join("derivatives/sub-1/perf/e_asl.json"),
            &json!({"BackgroundSuppression": false}).to_string(),
        );
        let report = set_background_suppression(&root, false).expect("bgs");
        assert_eq!(report.count("update"), 2);
        assert_eq!(report.skipped.len(), 2);
        let a = read_sidecar(&perf.join("a_asl.json")).expect("a");
        assert_eq!(a["BackgroundSuppression"], json!(true));
        let derived = read_sidecar(&root.join("derivatives/sub-1/perf/e_asl.json")).expect("e");
        assert_eq!(derived["BackgroundSuppression"], json!(false));
        let again = set_background_suppression(&root, false).expect("again");
        assert_eq!(again.count("update"), 0);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn strip_bids_uri_handles_string_and_list() {
        let root = scratch_dir("strip_uri");
        let fmap = root.join("sub-1/ses-1/fmap");
        touch(
            &fmap.join("a_epi.json"),
            &json!({"IntendedFor": ["bids::sub-1/ses-1/func/x.nii.gz", "ses-1/func/y.nii.gz"]})
                .to_string(),
        );
        touch(
            &fmap.join("b_epi.json"),
            &json!({"IntendedFor": "bids::sub-1/ses-1/dwi/z.nii.gz"}).to_string(),
        );
        let report = strip_bids_uris(&root, false).expect("strip");
        assert_eq!(report.count("update"), 2);
        let a = read_sidecar(&fmap.join("a_epi.json")).expect("a");
        assert_eq!(a["IntendedFor"], json!(["ses-1/func/x.nii.gz", "ses-1/func/y.nii.gz"]));
        let b = read_sidecar(&fmap.join("b_epi.json")).expect("b");
        assert_eq!(b["IntendedFor"], json!("ses-1/dwi/z.nii.gz"));
        assert_eq!(strip_bids_uris(&root, false).expect("again").count("update"), 0);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn perf_metadata_is_idempotent() {
        let root = scratch_dir("perf_meta");
        let perf = root.join("sub-1/ses-1/perf");
        let asl = perf.join("sub-1_ses-1_asl.json");
        let m0 = perf.join("sub-1_ses-1_m0scan.json");
        touch(
            &asl,
            &json!({
                "NumVolumes": 80, "RepetitionTime": 4.0,
                "VoxelSizeDim1": 3.4, "VoxelSizeDim2": 3.4, "VoxelSizeDim3": 5
            })
            .to_string(),
        );
        touch(
            &m0,
            &json!({"IntendedFor": "ses-2/perf/sub-1_ses-2_asl.nii.gz", "RepetitionTime": 4.0})
                .to_string(),
        );
        let report = sync_perf_metadata(&root, "ses-1", false).expect("sync");
        assert_eq!(report.count("update"), 2);
        let asl_data = read_sidecar(&asl).expect("asl");
        assert_eq!(asl_data["TotalAcquiredPairs"], json!(40.0));
        assert_eq!(asl_data["RepetitionTimePreparation"], json!(4.0));
        assert_eq!(asl_data["AcquisitionVoxelSize"], json!([3.4, 3.4, 5]));
        let m0_data = read_sidecar(&m0).expect("m0");
        assert_eq!(m0_data["IntendedFor"], json!(["ses-1/perf/sub-1_ses-1_asl.nii.gz"]));
        let before = (mtime_of(&asl), mtime_of(&m0));
        let again = sync_perf_metadata(&root, "ses-1", false).expect("again");
        assert_eq!(again.count("update"), 0);
        assert_eq!(before, (mtime_of(&asl), mtime_of(&m0)));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn integral_pairs_compare_numerically() {
        let mut data = Map::new();
        data.insert("NumVolumes".to_string(), json!(80));
        data.insert("TotalAcquiredPairs".to_string(), json!(40));
        let details = sync_asl(Path::new("x_asl.json"), &mut data);
        assert!(details.is_empty(), "{:?}", details);
    }
}
