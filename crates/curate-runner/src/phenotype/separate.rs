//! Splits an item-wise self-report export into one TSV per instrument.
//!
//! An item column is one with a `_`-separated token starting with a digit
//! (`aces_1`, `hcl16_3_1`, `eswan_dmdd_01a`); the instrument is every token
//! before it. Other columns attach to the instrument whose name they contain,
//! and completion flags go to `misc.tsv`.

use anyhow::{anyhow, Result};
use curate_core::table::Table;
use curate_core::CurateError;
use regex::Regex;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::info;

pub const PARTICIPANT_ID: &str = "participant_id";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum KeyPart {
    Text(String),
    Num(u64),
}

/// Numeric-aware sort key: `2` < `2a` < `10`.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    natural_key(a).cmp(&natural_key(b))
}

/// Alternating text and number runs, always starting and ending with text so
/// that keys compare position by position.
fn natural_key(text: &str) -> Vec<KeyPart> {
    let mut parts = Vec::new();
    let mut rest = text;
    loop {
        let text_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        parts.push(KeyPart::Text(rest[..text_len].to_string()));
        rest = &rest[text_len..];
        if rest.is_empty() {
            break;
        }
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        parts.push(KeyPart::Num(rest[..digits].parse().unwrap_or(u64::MAX)));
        rest = &rest[digits..];
    }
    parts
}

fn tokens(column: &str) -> Vec<String> {
    column
        .to_lowercase()
        .split('_')
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn starts_with_digit(token: &str) -> bool {
    token.chars().next().is_some_and(|c| c.is_ascii_digit())
}

/// Instrument of an item column, or `None` for non-item columns.
pub fn item_instrument(column: &str) -> Option<String> {
    let toks = tokens(column);
    let first_item = toks.iter().position(|t| starts_with_digit(t))?;
    (first_item > 0).then(|| toks[..first_item].join("_"))
}

fn suffix_after(column: &str, instrument: &str) -> String {
    let prefix = format!("{}_", instrument);
    if column.to_lowercase().starts_with(&prefix) {
        column.get(prefix.len()..).unwrap_or(column).to_string()
    } else {
        column.to_string()
    }
}

/// Best instrument for a non-item column: whole-token match (longest name
/// first), then prefix, then a plural (`ace_flag` -> `aces`).
pub fn assign_column(column: &str, instruments: &[String]) -> Option<String> {
    let lower = column.to_lowercase();
    let mut candidates: Vec<&String> = instruments.iter().collect();
    candidates.sort_by(|a, b| b.len().cmp(&a.len()));

    for inst in &candidates {
        let pattern = format!("(^|_){}(_|$)", regex::escape(inst));
        if Regex::new(&pattern).map(|re| re.is_match(&lower)).unwrap_or(false) {
            return Some((*inst).clone());
        }
    }
    if let Some(inst) = candidates.iter().find(|inst| lower.starts_with(inst.as_str())) {
        return Some((*inst).clone());
    }
    let first = tokens(column).into_iter().next()?;
    candidates
        .iter()
        .find(|inst| {
            inst.strip_suffix("es") == Some(first.as_str())
                || inst.strip_suffix('s') == Some(first.as_str())
        })
        .map(|inst| (*inst).clone())
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstrumentColumns {
    pub items: Vec<String>,
    pub others: Vec<String>,
}

/// Instruments in first-seen order with their columns, plus the columns
/// bound for `misc.tsv`.
pub fn group_columns(columns: &[String]) -> (Vec<(String, InstrumentColumns)>, Vec<String>) {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, InstrumentColumns> = HashMap::new();
    let mut is_item = vec![false; columns.len()];
    for (i, col) in columns.iter().enumerate() {
        if col == PARTICIPANT_ID {
            continue;
        }
        if let Some(inst) = item_instrument(col) {
            if !groups.contains_key(&inst) {
                order.push(inst.clone());
            }
            groups.entry(inst).or_default().items.push(col.clone());
            is_item[i] = true;
        }
    }

    let mut leftover = Vec::new();
    for (i, col) in columns.iter().enumerate() {
        if col == PARTICIPANT_ID || is_item[i] {
            continue;
        }
        if col.to_lowercase().contains("complete") {
            leftover.push(col.clone());
            continue;
        }
        match assign_column(col, &order) {
            Some(inst) => groups.entry(inst).or_default().others.push(col.clone()),
            None => leftover.push(col.clone()),
        }
    }

    let grouped = order
        .into_iter()
        .map(|inst| {
            let mut cols = groups.remove(&inst).unwrap_or_default();
            cols.items
                .sort_by(|a, b| natural_cmp(&suffix_after(a, &inst), &suffix_after(b, &inst)));
            cols.others.sort_by_key(|c| c.to_lowercase());
            (inst, cols)
        })
        .collect();
    (grouped, leftover)
}

fn project(input: &Table, header: &[String]) -> Table {
    let mut out = Table::new(header.to_vec());
    let idx: Vec<Option<usize>> = header.iter().map(|h| input.column(h)).collect();
    for row in &input.rows {
        out.rows.push(
            idx.iter()
                .map(|i| i.and_then(|i| row.get(i)).cloned().unwrap_or_default())
                .collect(),
        );
    }
    out
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeparateReport {
    pub instruments: Vec<(String, PathBuf)>,
    pub misc: Option<PathBuf>,
}

pub fn separate_instruments(input: &Path, output_dir: &Path, write_misc: bool) -> Result<SeparateReport> {
    if !input.is_file() {
        return Err(CurateError::MissingFile(input.to_path_buf()).into());
    }
    let table = Table::read_tsv(input)?;
    if table.headers.is_empty() || table.headers.iter().all(|h| h.is_empty()) {
        return Err(anyhow!("{} has no header", input.display()));
    }
    let (groups, leftover) = group_columns(&table.headers);
    curate_core::ensure_dir(output_dir)?;

    let mut report = SeparateReport::default();
    for (inst, cols) in &groups {
        let mut header = vec![PARTICIPANT_ID.to_string()];
        header.extend(cols.items.iter().cloned());
        header.extend(cols.others.iter().cloned());
        let path = output_dir.join(format!("{}.tsv", inst));
        project(&table, &header).write_tsv(&path)?;
        report.instruments.push((inst.clone(), path));
    }
    if write_misc && !leftover.is_empty() {
        let mut misc = leftover;
        misc.sort_by_key(|c| c.to_lowercase());
        let mut header = vec![PARTICIPANT_ID.to_string()];
        header.extend(misc);
        let path = output_dir.join("misc.tsv");
        project(&table, &header).write_tsv(&path)?;
        report.misc = Some(path);
    }
    info!(
        files = report.instruments.len() + usize::from(report.misc.is_some()),
        dir = %output_dir.display(),
        "instrument tables written"
    );
    Ok(report)
}
