//! Fractal n-back logs to scored BIDS events plus per-session performance.
//!
//! Inputs are a scoring template (XML), a Flywheel export tree holding
//! `<bblid>/SESSIONS/<scanid>/.../*-frac2B_1.00_no1B.log`, and a session map
//! TSV (`bblid`, `scanid`, `session_id`). Events land next to the highest-run
//! `*task-nback*bold.json` of each session; metrics go into the subject's
//! `sessions.tsv`.

use crate::Skipped;
use anyhow::{anyhow, Context, Result};
use curate_core::sidecar::{read_sidecar, write_json, JsonStyle};
use curate_core::table::{Table, NA};
use curate_core::{file_name_str, format_float, format_number, CurateError};
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Map, Value};
use statrs::distribution::{ContinuousCDF, Normal};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{info, warn};
use walkdir::WalkDir;

pub const LOG_SUFFIX: &str = "-frac2B_1.00_no1B.log";
/// Seconds between stimulus onsets.
pub const TRIAL_SECONDS: f64 = 0.8;
/// Responses slower than this count as misses.
pub const RESPONSE_WINDOW: f64 = 2.4;

const TARGETS_PER_BLOCK: f64 = 15.0;
const FOILS_PER_BLOCK: f64 = 45.0;

/// One scored stimulus from the template.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateTrial {
    pub category: String,
    pub expected: String,
    pub index: i64,
}

/// Reads the stimulus list (the sixth element under the root) and keeps the
/// 0-back and 2-back trials, 0-back first.
pub fn load_template(xml_path: &Path) -> Result<Vec<TemplateTrial>> {
    let text = fs::read_to_string(xml_path)
        .with_context(|| format!("failed to read {}", xml_path.display()))?;
    let invalid = |reason: String| CurateError::InvalidTemplate {
        path: xml_path.to_path_buf(),
        reason,
    };
    let doc = roxmltree::Document::parse(&text).map_err(|e| invalid(e.to_string()))?;
    let stim = doc
        .root_element()
        .children()
        .filter(|n| n.is_element())
        .nth(5)
        .ok_or_else(|| invalid("fewer than six top-level elements".to_string()))?;
    let mut zero = Vec::new();
    let mut two = Vec::new();
    for node in stim.children().filter(|n| n.is_element()) {
        let bucket = match node.attribute("category") {
            Some("0BACK") => &mut zero,
            Some("2BACK") => &mut two,
            _ => continue,
        };
        let Some(index) = node.attribute("index") else {
            continue;
        };
        let index: i64 = index
            .trim()
            .parse()
            .map_err(|_| invalid(format!("non-integer trial index '{}'", index)))?;
        bucket.push(TemplateTrial {
            category: node.attribute("category").unwrap_or_default().to_string(),
            expected: node.attribute("expected").unwrap_or_default().to_string(),
            index,
        });
    }
    zero.extend(two);
    Ok(zero)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogRow {
    pub trial: f64,
    pub ttime: f64,
}

/// Parses a presentation log: three preamble lines, then a 13-column table
/// whose first two non-blank rows are headers.
pub fn parse_log(text: &str) -> Vec<LogRow> {
    let num = |cell: Option<&str>| {
        cell.and_then(|c| c.trim().parse::<f64>().ok())
            .unwrap_or(f64::NAN)
    };
    text.lines()
        .skip(3)
        .filter(|l| !l.trim().is_empty())
        .skip(2)
        .map(|line| {
            let cells: Vec<&str> = line.split('\t').collect();
            LogRow {
                trial: num(cells.get(1).copied()),
                ttime: num(cells.get(5).copied()),
            }
        })
        .collect()
}

fn read_log(path: &Path) -> Result<Vec<LogRow>> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(parse_log(&String::from_utf8_lossy(&bytes)))
}

/// Response time in milliseconds for the stimulus at `index`, taken from the
/// `TTime` values of trials `index - 2 ..= index`.
pub fn response_ms(rows: &[LogRow], index: i64) -> Option<f64> {
    let lo = (index - 2) as f64;
    let hi = index as f64;
    let window: Vec<f64> = rows
        .iter()
        .filter(|r| r.trial >= lo && r.trial <= hi)
        .map(|r| r.ttime)
        .collect();
    if window.len() <= 6 {
        return None;
    }
    if window[0] > 0.0 {
        return Some(window[0] / 10.0);
    }
    // any non-zero slot, NaN included, counts as a response
    let res = window.iter().step_by(2).position(|v| *v != 0.0)?;
    let centre = if res == 0 { window.len() - 1 } else { 2 * res - 1 };
    let ms = window[centre] / 10.0 + (res as f64 - 1.0) * 800.0;
    (!ms.is_nan()).then_some(ms)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Score {
    TruePositive,
    TrueNegative,
    FalsePositive,
    FalseNegative,
    Unknown,
}

impl Score {
    pub fn as_str(self) -> &'static str {
        match self {
            Score::TruePositive => "true_positive",
            Score::TrueNegative => "true_negative",
            Score::FalsePositive => "false_positive",
            Score::FalseNegative => "false_negative",
            Score::Unknown => "unknown",
        }
    }
}

/// `NR` trials expect no press; `Match` trials expect one within the window.
pub fn classify(expected: &str, response_time: Option<f64>) -> Score {
    if expected.contains("NR") {
        return match response_time {
            Some(_) => Score::FalsePositive,
            None => Score::TrueNegative,
        };
    }
    if expected.contains("Match") {
        return match response_time {
            Some(rt) if rt <= RESPONSE_WINDOW => Score::TruePositive,
            _ => Score::FalseNegative,
        };
    }
    Score::Unknown
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrialEvent {
    pub onset: f64,
    pub duration: f64,
    pub trial_type: String,
    pub results: String,
    /// Seconds.
    pub response_time: Option<f64>,
    pub score: Score,
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

pub fn build_events(template: &[TemplateTrial], rows: &[LogRow]) -> Vec<TrialEvent> {
    template
        .iter()
        .map(|t| {
            let response_time = response_ms(rows, t.index).map(|ms| ms / 1000.0);
            TrialEvent {
                onset: round1(TRIAL_SECONDS * t.index as f64),
                duration: round1(3.0 * TRIAL_SECONDS),
                trial_type: t.category.clone(),
                results: t.expected.clone(),
                response_time,
                score: classify(&t.expected, response_time),
            }
        })
        .collect()
}

pub fn events_table(events: &[TrialEvent]) -> Table {
    let mut table = Table::new(
        ["onset", "duration", "trial_type", "results", "response_time", "score"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
    );
    for e in events {
        table.rows.push(vec![
            format_float(e.onset),
            format_float(e.duration),
            e.trial_type.clone(),
            e.results.clone(),
            e.response_time.map(format_float).unwrap_or_else(|| NA.to_string()),
            e.score.as_str().to_string(),
        ]);
    }
    table
}

pub fn events_sidecar() -> Value {
    json!({
        "trial_type": {
            "Description": "Task condition for each trial",
            "Levels": {
                "0BACK": "0-back trial: respond to target picture",
                "2BACK": "2-back trial: respond if picture matches the one shown two trials before"
            }
        },
        "results": {
            "Description": "Expected outcome for each trial based on task rules",
            "Levels": {
                "NR": "No response expected",
                "Match": "Response expected"
            }
        },
        "score": {
            "Description": "Trial outcome classification",
            "Levels": {
                "false_positive": "No response expected, response detected",
                "true_negative": "No response expected, no response detected",
                "true_positive": "Response expected, response detected",
                "false_negative": "Response expected, no response detected"
            }
        }
    })
}

/// d' = Z(hit rate) - Z(false-alarm rate). Rates of exactly 0 or 1 are pulled
/// in by half a trial so the result stays finite.
pub fn dprime(hits: usize, misses: usize, fas: usize, crs: usize) -> Result<f64> {
    let adjusted = |k: usize, n: usize| {
        let n = n.max(1) as f64;
        let half = 0.5 / n;
        let rate = k as f64 / n;
        if rate >= 1.0 {
            1.0 - half
        } else if rate <= 0.0 {
            half
        } else {
            rate
        }
    };
    let z = Normal::new(0.0, 1.0).map_err(|e| anyhow!("standard normal: {}", e))?;
    let hit_rate = adjusted(hits, hits + misses);
    let fa_rate = adjusted(fas, fas + crs);
    Ok(z.inverse_cdf(hit_rate) - z.inverse_cdf(fa_rate))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Tally {
    tp: usize,
    tn: usize,
    fp: usize,
    fn_: usize,
}

impl Tally {
    fn add(self, other: Tally) -> Tally {
        Tally {
            tp: self.tp + other.tp,
            tn: self.tn + other.tn,
            fp: self.fp + other.fp,
            fn_: self.fn_ + other.fn_,
        }
    }
}

fn tally(events: &[TrialEvent], trial_type: &str) -> Tally {
    let mut t = Tally::default();
    for e in events.iter().filter(|e| e.trial_type == trial_type) {
        match e.score {
            Score::TruePositive => t.tp += 1,
            Score::TrueNegative => t.tn += 1,
            Score::FalsePositive => t.fp += 1,
            Score::FalseNegative => t.fn_ += 1,
            Score::Unknown => {}
        }
    }
    t
}

/// Per-session signal-detection summary, in output column order.
pub fn session_metrics(events: &[TrialEvent]) -> Result<Vec<(String, Value)>> {
    let zero = tally(events, "0BACK");
    let two = tally(events, "2BACK");
    let all = zero.add(two);
    let mut m: Vec<(String, Value)> = Vec::new();
    for (prefix, t) in [("0_back", zero), ("2_back", two)] {
        m.push((format!("{}_false_positive", prefix), json!(t.fp)));
        m.push((format!("{}_false_negative", prefix), json!(t.fn_)));
        m.push((format!("{}_true_positive", prefix), json!(t.tp)));
        m.push((format!("{}_true_negative", prefix), json!(t.tn)));
    }
    m.push(("all_back_true_positive".into(), json!(all.tp)));
    m.push(("all_back_true_negative".into(), json!(all.tn)));
    m.push(("all_back_false_positive".into(), json!(all.fp)));
    m.push(("all_back_false_negative".into(), json!(all.fn_)));
    for (prefix, t) in [("0_back", zero), ("2_back", two), ("all_back", all)] {
        m.push((format!("{}_all_correct", prefix), json!(t.tp + t.tn)));
        m.push((format!("{}_all_incorrect", prefix), json!(t.fp + t.fn_)));
    }
    for (prefix, t, blocks) in [("0_back", zero, 1.0), ("2_back", two, 1.0), ("all_back", all, 2.0)] {
        m.push((
            format!("{}_hit_rate", prefix),
            json!(t.tp as f64 / (TARGETS_PER_BLOCK * blocks)),
        ));
        m.push((
            format!("{}_false_alarm_rate", prefix),
            json!(t.fp as f64 / (FOILS_PER_BLOCK * blocks)),
        ));
    }
    for (prefix, t) in [("0_back", zero), ("2_back", two), ("all_back", all)] {
        m.push((format!("{}_dprime", prefix), json!(dprime(t.tp, t.fn_, t.fp, t.tn)?)));
    }
    Ok(m)
}

fn block_label(prefix: &str) -> String {
    match prefix {
        "0_back" => "0-back".to_string(),
        "2_back" => "2-back".to_string(),
        "all_back" => "0- and 2-back".to_string(),
        other => other.replace('_', "-"),
    }
}

pub fn describe_metric(key: &str) -> (String, &'static str) {
    const KINDS: [(&str, &str, &str); 9] = [
        ("_dprime", "d' sensitivity index for {} (Z(H) - Z(FA))", "arbitrary"),
        ("_hit_rate", "Hit rate in {} (true positives / targets)", "proportion (0-1)"),
        ("_false_alarm_rate", "False alarm rate in {} (false positives / foils)", "proportion (0-1)"),
        ("_true_positive", "True positives in {}", "count"),
        ("_true_negative", "True negatives in {}", "count"),
        ("_false_positive", "False positives in {}", "count"),
        ("_false_negative", "False negatives in {}", "count"),
        ("_all_correct", "All correct responses in {} (true positives + true negatives)", "count"),
        ("_all_incorrect", "All incorrect responses in {} (false positives + false negatives)", "count"),
    ];
    for (suffix, template, units) in KINDS {
        if let Some(prefix) = key.strip_suffix(suffix) {
            return (template.replace("{}", &block_label(prefix)), units);
        }
    }
    (format!("Metric {}", key.replace('_', " ")), "")
}

fn reorder_leading(table: &mut Table, leading: &[&str]) {
    let mut order: Vec<usize> = leading.iter().filter_map(|c| table.column(c)).collect();
    let rest: Vec<usize> = (0..table.headers.len())
        .filter(|i| !order.contains(i))
        .collect();
    order.extend(rest);
    table.headers = order.iter().map(|&i| table.headers[i].clone()).collect();
    for row in &mut table.rows {
        *row = order
            .iter()
            .map(|&i| row.get(i).cloned().unwrap_or_default())
            .collect();
    }
}

fn metric_cell(value: &Value) -> String {
    match value {
        Value::Number(n) if n.is_f64() => n.as_f64().map(format_number).unwrap_or_default(),
        other => curate_core::sidecar::value_to_plain_string(other),
    }
}

/// Writes one session's metrics into `sub-<id>_sessions.tsv`, adding the row
/// and any missing columns, and refreshes the column descriptions in
/// `sub-<id>_sessions.json`.
pub fn update_sessions(
    subject_dir: &Path,
    subject: &str,
    session: &str,
    metrics: &[(String, Value)],
) -> Result<()> {
    curate_core::ensure_dir(subject_dir)?;
    let tsv_path = subject_dir.join(format!("{}_sessions.tsv", subject));
    let mut table = if tsv_path.exists() {
        Table::read_tsv(&tsv_path)?
    } else {
        let mut t = Table::new(vec!["session_id".to_string()]);
        t.rows.push(vec![session.to_string()]);
        t
    };
    if table.column("session_id").is_none() {
        table.headers.insert(0, "session_id".to_string());
        for row in &mut table.rows {
            row.insert(0, String::new());
        }
    }
    let sid = table.column("session_id").unwrap_or(0);
    let row_idx = match table.rows.iter().position(|r| r.get(sid).map(String::as_str) == Some(session)) {
        Some(i) => i,
        None => {
            let mut row = vec![String::new(); table.headers.len()];
            row[sid] = session.to_string();
            table.rows.push(row);
            table.rows.len() - 1
        }
    };
    for (key, value) in metrics {
        let col = table.ensure_column(key, "");
        let row = &mut table.rows[row_idx];
        if row.len() <= col {
            row.resize(col + 1, String::new());
        }
        row[col] = metric_cell(value);
    }
    reorder_leading(&mut table, &["session_id", "acq_time"]);
    for row in &mut table.rows {
        row.resize(table.headers.len(), String::new());
        for cell in row.iter_mut().filter(|c| c.trim().is_empty()) {
            *cell = NA.to_string();
        }
    }
    table.write_tsv(&tsv_path)?;

    let json_path = subject_dir.join(format!("{}_sessions.json", subject));
    let mut sidecar = read_sidecar(&json_path).unwrap_or_default();
    sidecar.entry("session_id").or_insert_with(|| {
        json!({"Description": "BIDS session label assigned chronologically via Flywheel created timestamp"})
    });
    sidecar.entry("acq_time").or_insert_with(|| {
        json!({"Description": "Acquisition time for the session rounded to the nearest hour and half-month period for anonymization"})
    });
    for (key, _) in metrics {
        let (description, units) = describe_metric(key);
        let mut entry = Map::new();
        entry.insert("Description".to_string(), json!(description));
        if !units.is_empty() {
            entry.insert("Units".to_string(), json!(units));
        }
        sidecar.insert(key.clone(), Value::Object(entry));
    }
    write_json(&json_path, &Value::Object(sidecar), JsonStyle::INDENT_2)
}

/// Flywheel logs keyed by `(bblid, scanid)`, taken from the path components
/// either side of `SESSIONS`.
pub fn discover_logs(logs_dir: &Path) -> Result<BTreeMap<(String, String), Vec<PathBuf>>> {
    let mut out: BTreeMap<(String, String), Vec<PathBuf>> = BTreeMap::new();
    for entry in WalkDir::new(logs_dir).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() || !file_name_str(entry.path()).ends_with(LOG_SUFFIX) {
            continue;
        }
        let parts: Vec<&str> = entry.path().iter().filter_map(|c| c.to_str()).collect();
        let Some(idx) = parts.iter().position(|p| *p == "SESSIONS") else {
            continue;
        };
        if idx == 0 || idx + 1 >= parts.len() {
            continue;
        }
        let key = (parts[idx - 1].to_string(), parts[idx + 1].to_string());
        out.entry(key).or_default().push(entry.into_path());
    }
    Ok(out)
}

fn load_session_map(path: &Path) -> Result<BTreeMap<(String, String), String>> {
    if !path.is_file() {
        return Err(CurateError::MissingFile(path.to_path_buf()).into());
    }
    let table = Table::read_tsv(path)?;
    table.require_columns(path, &["bblid", "scanid", "session_id"])?;
    let mut map = BTreeMap::new();
    for row in &table.rows {
        let get = |c: &str| table.cell(row, c).unwrap_or("").trim().to_string();
        map.insert((get("bblid"), get("scanid")), get("session_id"));
    }
    Ok(map)
}

fn run_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"run-(\d+)").expect("static regex"))
}

fn is_nback_bold_sidecar(name: &str) -> bool {
    name.find("task-nback")
        .map(|i| name[i..].ends_with("bold.json"))
        .unwrap_or(false)
}

pub fn highest_run_sidecar(func_dir: &Path) -> Result<Option<PathBuf>> {
    let run_of = |p: &Path| -> u64 {
        run_re()
            .captures(file_name_str(p))
            .and_then(|c| c[1].parse().ok())
            .unwrap_or(1)
    };
    let candidates = curate_core::list_files_matching(func_dir, is_nback_bold_sidecar)?;
    Ok(candidates
        .into_iter()
        .max_by(|a, b| (run_of(a), file_name_str(a)).cmp(&(run_of(b), file_name_str(b)))))
}

pub fn events_paths(bold_sidecar: &Path) -> (PathBuf, PathBuf) {
    let name = file_name_str(bold_sidecar);
    let stem = name.strip_suffix(".json").unwrap_or(name);
    let prefix = stem.strip_suffix("_bold").unwrap_or(stem);
    (
        bold_sidecar.with_file_name(format!("{}_events.tsv", prefix)),
        bold_sidecar.with_file_name(format!("{}_events.json", prefix)),
    )
}

fn latest_log(logs: &[PathBuf]) -> Option<&PathBuf> {
    logs.iter().max_by_key(|p| {
        fs::metadata(p)
            .and_then(|m| m.modified())
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
    })
}

#[derive(Debug, Clone)]
pub struct FracbackOptions {
    pub xml: PathBuf,
    pub logs_dir: PathBuf,
    /// Defaults to `<logs_dir>/bids_out`.
    pub output_dir: Option<PathBuf>,
    pub session_map: PathBuf,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionOutcome {
    pub subject: String,
    pub session: String,
    pub log: PathBuf,
    pub bold_sidecar: PathBuf,
    pub events_tsv: PathBuf,
    pub events_json: PathBuf,
    pub num_events: usize,
    pub metrics: Map<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct FracbackReport {
    pub dry_run: bool,
    pub sessions: Vec<SessionOutcome>,
    pub skipped: Vec<Skipped>,
    pub errors: Vec<Skipped>,
}

fn process_session(
    opts: &FracbackOptions,
    template: &[TemplateTrial],
    output_dir: &Path,
    bblid: &str,
    session: &str,
    bold_sidecar: PathBuf,
    log: &Path,
) -> Result<SessionOutcome> {
    let rows = read_log(log)?;
    let events = build_events(template, &rows);
    let metrics = session_metrics(&events)?;
    let (events_tsv, events_json) = events_paths(&bold_sidecar);
    let subject = format!("sub-{}", bblid);
    if !opts.dry_run {
        events_table(&events).write_tsv(&events_tsv)?;
        write_json(&events_json, &events_sidecar(), JsonStyle::INDENT_2)?;
        update_sessions(&output_dir.join(&subject), &subject, session, &metrics)?;
        info!(subject = %subject, session, log = %file_name_str(log), "processed");
    }
    Ok(SessionOutcome {
        subject,
        session: session.to_string(),
        log: log.to_path_buf(),
        bold_sidecar,
        events_tsv,
        events_json,
        num_events: events.len(),
        metrics: metrics.into_iter().collect(),
    })
}

pub fn convert_fracback(opts: &FracbackOptions) -> Result<FracbackReport> {
    let output_dir = opts
        .output_dir
        .clone()
        .unwrap_or_else(|| opts.logs_dir.join("bids_out"));
    if !opts.dry_run {
        curate_core::ensure_dir(&output_dir)?;
    }
    let template = load_template(&opts.xml)?;
    let logs = discover_logs(&opts.logs_dir)?;
    if logs.is_empty() {
        return Err(anyhow!(
            "no *{} files found under {} in a <bblid>/SESSIONS/<scanid> layout",
            LOG_SUFFIX,
            opts.logs_dir.display()
        ));
    }
    let session_map = load_session_map(&opts.session_map)?;

    let mut report = FracbackReport {
        dry_run: opts.dry_run,
        ..Default::default()
    };
    for ((bblid, scanid), log_list) in &logs {
        let Some(session) = session_map
            .get(&(bblid.clone(), scanid.clone()))
            .filter(|s| !s.is_empty())
        else {
            continue;
        };
        let func_dir = output_dir.join(format!("sub-{}", bblid)).join(session).join("func");
        let Some(bold_sidecar) = highest_run_sidecar(&func_dir)? else {
            let reason = format!("no *task-nback*bold.json for sub-{} {}", bblid, session);
            warn!(dir = %func_dir.display(), "{}", reason);
            report.skipped.push(Skipped::new(func_dir, reason));
            continue;
        };
        let Some(log) = latest_log(log_list) else {
            continue;
        };
        match process_session(opts, &template, &output_dir, bblid, session, bold_sidecar, log) {
            Ok(outcome) => report.sessions.push(outcome),
            Err(err) => {
                warn!(log = %log.display(), error = %err, "failed to process log");
                report.errors.push(Skipped::new(log.clone(), err.to_string()));
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{scratch_dir, touch};

    fn rows(ttimes: &[(f64, f64)]) -> Vec<LogRow> {
        ttimes
            .iter()
            .map(|&(trial, ttime)| LogRow { trial, ttime })
            .collect()
    }

    #[test]
    fn response_uses_first_positive_ttime() {
        let r = rows(&[
            (8.0, 5230.0),
            (8.0, 0.0),
            (9.0, 0.0),
            (9.0, 0.0),
            (10.0, 0.0),
            (10.0, 0.0),
            (10.0, 0.0),
            (11.0, 99.0),
        ]);
        assert_eq!(response_ms(&r, 10), Some(523.0));
    }

    #[test]
    fn response_falls_back_to_later_pair() {
        let r = rows(&[
            (8.0, 0.0),
            (8.0, 2500.0),
            (9.0, 4000.0),
            (9.0, 3000.0),
            (10.0, 0.0),
            (10.0, 0.0),
            (10.0, 0.0),
        ]);
        // second even slot responds; its time sits in the slot before it
        assert_eq!(response_ms(&r, 10), Some(250.0));
        let short = rows(&[(10.0, 100.0); 3]);
        assert_eq!(response_ms(&short, 10), None);
        let silent = rows(&[(10.0, 0.0); 7]);
        assert_eq!(response_ms(&silent, 10), None);
    }

    #[test]
    fn classification_follows_window() {
        assert_eq!(classify("NR", Some(0.4)), Score::FalsePositive);
        assert_eq!(classify("NR", None), Score::TrueNegative);
        assert_eq!(classify("Match", Some(2.4)), Score::TruePositive);
        assert_eq!(classify("Match", Some(2.5)), Score::FalseNegative);
        assert_eq!(classify("Match", None), Score::FalseNegative);
        assert_eq!(classify("", Some(1.0)), Score::Unknown);
    }

    #[test]
    fn dprime_is_finite_at_extremes() {
        for (h, m, f, c) in [(0, 0, 0, 0), (15, 0, 0, 45), (0, 15, 45, 0), (7, 8, 3, 42)] {
            let d = dprime(h, m, f, c).expect("dprime");
            assert!(d.is_finite(), "{:?} -> {}", (h, m, f, c), d);
        }
        let perfect = dprime(15, 0, 0, 45).expect("dprime");
        assert!(perfect > 3.0);
        assert!((dprime(5, 5, 5, 5).expect("dprime")).abs() < 1e-9);
    }

    #[test]
    fn metrics_count_by_block() {
        let ev = |tt: &str, score| TrialEvent {
            onset: 0.0,
            duration: 2.4,
            trial_type: tt.to_string(),
            results: String::new(),
            response_time: None,
            score,
        };
        let events = vec![
            ev("0BACK", Score::TruePositive),
            ev("0BACK", Score::FalsePositive),
            ev("2BACK", Score::TrueNegative),
            ev("2BACK", Score::TruePositive),
        ];
        let m: BTreeMap<String, Value> = session_metrics(&events).expect("metrics").into_iter().collect();
        assert_eq!(m["all_back_true_positive"], json!(2));
        assert_eq!(m["0_back_all_incorrect"], json!(1));
        assert_eq!(m["2_back_all_correct"], json!(2));
        assert_eq!(m["all_back_hit_rate"], json!(2.0 / 30.0));
        assert_eq!(m["0_back_false_alarm_rate"], json!(1.0 / 45.0));
        assert_eq!(m.len(), 8 + 4 + 6 + 6 + 3);
    }

    #[test]
    fn leading_columns_move_to_front() {
        let mut table = Table::new(vec!["x".to_string(), "acq_time".to_string(), "session_id".to_string()]);
        table.rows.push(vec!["1".to_string(), "t".to_string(), "ses-1".to_string()]);
        reorder_leading(&mut table, &["session_id", "acq_time", "absent"]);
        assert_eq!(table.headers, vec!["session_id", "acq_time", "x"]);
        assert_eq!(table.rows[0], vec!["ses-1", "t", "1"]);
    }

    #[test]
    fn metric_descriptions() {
        assert_eq!(
            describe_metric("all_back_dprime"),
            ("d' sensitivity index for 0- and 2-back (Z(H) - Z(FA))".to_string(), "arbitrary")
        );
        assert_eq!(describe_metric("0_back_true_positive").1, "count");
        assert_eq!(describe_metric("misc_value").0, "Metric misc value");
    }

    #[test]
    fn highest_run_and_event_paths() {
        let root = scratch_dir("nback_runs");
        let func = root.join("func");
        touch(&func.join("sub-1_ses-1_task-nback_run-01_bold.json"), "{}");
        touch(&func.join("sub-1_ses-1_task-nback_run-02_bold.json"), "{}");
        touch(&func.join("sub-1_ses-1_task-rest_bold.json"), "{}");
        let best = highest_run_sidecar(&func).expect("scan").expect("found");
        assert!(file_name_str(&best).contains("run-02"));
        let (tsv, js) = events_paths(&best);
        assert_eq!(file_name_str(&tsv), "sub-1_ses-1_task-nback_run-02_events.tsv");
        assert_eq!(file_name_str(&js), "sub-1_ses-1_task-nback_run-02_events.json");
        let _ = fs::remove_dir_all(root);
    }

    fn template_xml() -> String {
        let mut trials = String::new();
        trials.push_str(r#"<s category="0BACK" expected="Match" index="10"/>"#);
        trials.push_str(r#"<s category="1BACK" expected="NR" index="11"/>"#);
        trials.push_str(r#"<s category="2BACK" expected="NR" index="20"/>"#);
        format!(
            "<task><a/><b/><c/><d/><e/><stim>{}</stim></task>",
            trials
        )
    }

    fn log_text() -> String {
        let mut text = String::from("Scenario - x\nLogfile written\n\n");
        text.push_str("Subject\tTrial\tEvent Type\tCode\tTime\tTTime\tUncertainty\tDuration\tUncertainty\tReqTime\tReqDur\tStim Type\tPair Index\n\n");
        text.push_str("\t\t\t\t\t(num)\n");
        for trial in 8..=10 {
            for ttime in [if trial == 8 { 5230 } else { 0 }, 0, 0] {
                text.push_str(&format!("s1\t{}\tPicture\tx\t0\t{}\t1\t0\t1\t0\tnext\tother\t0\n", trial, ttime));
            }
        }
        text
    }

    #[test]
    fn converts_session_and_updates_tables() {
        let root = scratch_dir("fracback");
        let xml = root.join("template.xml");
        touch(&xml, &template_xml());
        let logs = root.join("SUBJECTS");
        let log = logs.join("1234/SESSIONS/9876/ACQUISITIONS/a/FILES/1234-frac2B_1.00_no1B.log");
        touch(&log, &log_text());
        let map = root.join("session_map.tsv");
        touch(&map, "bblid\tscanid\tsession_id\n1234\t9876\tses-2\n");
        let out = root.join("bids");
        let func = out.join("sub-1234/ses-2/func");
        touch(&func.join("sub-1234_ses-2_task-nback_bold.json"), "{}");
        touch(
            &out.join("sub-1234/sub-1234_sessions.tsv"),
            "session_id\tacq_time\nses-1\t2020-01-01T10:00:00\n",
        );

        let opts = FracbackOptions {
            xml,
            logs_dir: logs,
            output_dir: Some(out.clone()),
            session_map: map,
            dry_run: false,
        };
        let report = convert_fracback(&opts).expect("convert");
        assert!(report.errors.is_empty(), "{:?}", report.errors);
        assert_eq!(report.sessions.len(), 1);
        assert_eq!(report.sessions[0].num_events, 2);

        let events = Table::read_tsv(&func.join("sub-1234_ses-2_task-nback_events.tsv")).expect("events");
        assert_eq!(
            events.headers,
            vec!["onset", "duration", "trial_type", "results", "response_time", "score"]
        );
        assert_eq!(events.rows[0], vec!["8.0", "2.4", "0BACK", "Match", "0.523", "true_positive"]);
        assert_eq!(events.rows[1][4], "n/a");
        assert_eq!(events.rows[1][5], "true_negative");

        let sessions = Table::read_tsv(&out.join("sub-1234/sub-1234_sessions.tsv")).expect("sessions");
        assert_eq!(&sessions.headers[..2], &["session_id".to_string(), "acq_time".to_string()]);
        assert_eq!(sessions.rows.len(), 2);
        assert_eq!(sessions.cell(&sessions.rows[0], "0_back_true_positive"), Some("n/a"));
        assert_eq!(sessions.cell(&sessions.rows[1], "0_back_true_positive"), Some("1"));
        assert_eq!(sessions.cell(&sessions.rows[1], "acq_time"), Some("n/a"));
        let sidecar = read_sidecar(&out.join("sub-1234/sub-1234_sessions.json")).expect("json");
        assert_eq!(sidecar["0_back_hit_rate"]["Units"], json!("proportion (0-1)"));
        assert!(sidecar.contains_key("session_id"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn template_without_stimulus_list_is_rejected() {
        let root = scratch_dir("fracback_template");
        let xml = root.join("short.xml");
        touch(&xml, "<task><a/><b/></task>");
        let err = load_template(&xml).expect_err("too short");
        assert!(err.to_string().contains("invalid scoring template"), "{}", err);
        touch(&xml, &template_xml());
        let trials = load_template(&xml).expect("template");
        let categories: Vec<&str> = trials.iter().map(|t| t.category.as_str()).collect();
        assert_eq!(categories, vec!["0BACK", "2BACK"]);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_session_map_is_fatal() {
        let root = scratch_dir("fracback_nomap");
        let xml = root.join("t.xml");
        touch(&xml, &template_xml());
        touch(&root.join("logs/1/SESSIONS/2/x-frac2B_1.00_no1B.log"), "");
        let opts = FracbackOptions {
            xml,
            logs_dir: root.join("logs"),
            output_dir: None,
            session_map: root.join("missing.tsv"),
            dry_run: true,
        };
        assert!(convert_fracback(&opts).is_err());
        let _ = fs::remove_dir_all(root);
    }
}
