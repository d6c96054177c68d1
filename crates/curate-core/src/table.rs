//! Delimited tables (TSV curation sheets, CSV QC outputs).

use crate::{atomic_write_bytes, CurateError};
use anyhow::{anyhow, Result};
use csv::{ReaderBuilder, WriterBuilder};
use std::path::Path;

pub const TAB: u8 = b'\t';
pub const COMMA: u8 = b',';

/// BIDS spelling of a missing cell.
pub const NA: &str = "n/a";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(headers: Vec<String>) -> Self {
        Self {
            headers,
            rows: Vec::new(),
        }
    }

    pub fn read(path: &Path, delimiter: u8) -> Result<Self> {
        let mut reader = ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .flexible(true)
            .from_path(path)
            .map_err(|e| anyhow!("failed to open {}: {}", path.display(), e))?;
        let headers = reader
            .headers()?
            .iter()
            .map(|h| h.trim_start_matches('\u{feff}').to_string())
            .collect::<Vec<_>>();
        let width = headers.len();
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            let mut row: Vec<String> = record.iter().map(|c| c.to_string()).collect();
            row.resize(width.max(row.len()), String::new());
            rows.push(row);
        }
        Ok(Self { headers, rows })
    }

    pub fn read_tsv(path: &Path) -> Result<Self> {
        Self::read(path, TAB)
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    /// Fails with every missing column named at once.
    pub fn require_columns(&self, path: &Path, names: &[&str]) -> Result<()> {
        let missing: Vec<String> = names
            .iter()
            .filter(|n| self.column(n).is_none())
            .map(|n| n.to_string())
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        Err(CurateError::MissingColumns {
            path: path.to_path_buf(),
            columns: missing,
        }
        .into())
    }

    pub fn cell<'a>(&'a self, row: &'a [String], name: &str) -> Option<&'a str> {
        self.column(name)
            .and_then(|i| row.get(i))
            .map(|s| s.as_str())
    }

    /// Values of one column; absent cells read as empty strings.
    pub fn column_values(&self, name: &str) -> Option<Vec<&str>> {
        let idx = self.column(name)?;
        Some(
            self.rows
                .iter()
                .map(|r| r.get(idx).map(|s| s.as_str()).unwrap_or(""))
                .collect(),
        )
    }

    /// Replaces an existing column in place or appends a new one.
    pub fn set_column(&mut self, name: &str, values: Vec<String>) {
        let idx = match self.column(name) {
            Some(i) => i,
            None => {
                self.headers.push(name.to_string());
                for row in &mut self.rows {
                    row.push(String::new());
                }
                self.headers.len() - 1
            }
        };
        for (row, value) in self.rows.iter_mut().zip(values) {
            if row.len() <= idx {
                row.resize(idx + 1, String::new());
            }
            row[idx] = value;
        }
    }

    /// Appends a column header if absent, filling existing rows with `fill`.
    pub fn ensure_column(&mut self, name: &str, fill: &str) -> usize {
        if let Some(i) = self.column(name) {
            return i;
        }
        self.headers.push(name.to_string());
        for row in &mut self.rows {
            row.resize(self.headers.len() - 1, fill.to_string());
            row.push(fill.to_string());
        }
        self.headers.len() - 1
    }

    pub fn to_bytes(&self, delimiter: u8) -> Result<Vec<u8>> {
        let mut writer = WriterBuilder::new()
            .delimiter(delimiter)
            .flexible(true)
            .from_writer(Vec::new());
        writer.write_record(&self.headers)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }
        writer
            .into_inner()
            .map_err(|e| anyhow!("failed to flush table: {}", e))
    }

    pub fn write(&self, path: &Path, delimiter: u8) -> Result<()> {
        let bytes = self.to_bytes(delimiter)?;
        atomic_write_bytes(path, &bytes)
    }

    pub fn write_tsv(&self, path: &Path) -> Result<()> {
        self.write(path, TAB)
    }
}

/// Numeric reading of a cell. Blank, `n/a` and unparseable cells are NaN.
pub fn parse_number(cell: &str) -> f64 {
    let t = cell.trim();
    if t.is_empty() || t.eq_ignore_ascii_case(NA) {
        return f64::NAN;
    }
    t.parse::<f64>().unwrap_or(f64::NAN)
}

/// True for cells that carry no value.
pub fn is_missing(cell: &str) -> bool {
    let t = cell.trim();
    t.is_empty() || t.eq_ignore_ascii_case(NA) || t.eq_ignore_ascii_case("nan")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn read_pads_short_rows_and_strips_bom() {
        let dir = crate::scratch_dir("table_read");
        let path = dir.join("t.tsv");
        fs::write(&path, "\u{feff}a\tb\tc\n1\t2\n4\t5\t6\n").expect("write");
        let table = Table::read_tsv(&path).expect("read");
        assert_eq!(table.headers, vec!["a", "b", "c"]);
        assert_eq!(table.rows[0], vec!["1", "2", ""]);
        assert_eq!(table.cell(&table.rows[1], "c"), Some("6"));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn require_columns_lists_every_missing_name() {
        let table = Table::new(vec!["FilePath".to_string()]);
        let err = table
            .require_columns(Path::new("x.tsv"), &["DROP", "FilePath", "Notes"])
            .expect_err("missing columns");
        let msg = err.to_string();
        assert!(msg.contains("DROP") && msg.contains("Notes"), "{}", msg);
        assert!(!msg.contains("FilePath,"), "{}", msg);
    }

    #[test]
    fn set_column_overwrites_in_place_or_appends() {
        let mut table = Table::new(vec!["a".to_string(), "b".to_string()]);
        table.rows.push(vec!["1".to_string(), "2".to_string()]);
        table.set_column("a", vec!["9".to_string()]);
        table.set_column("z", vec!["7".to_string()]);
        assert_eq!(table.headers, vec!["a", "b", "z"]);
        assert_eq!(table.rows[0], vec!["9", "2", "7"]);
    }

    #[test]
    fn tsv_output_is_tab_separated() {
        let mut table = Table::new(vec!["x".to_string(), "y".to_string()]);
        table.rows.push(vec!["1".to_string(), NA.to_string()]);
        let text = String::from_utf8(table.to_bytes(TAB).expect("bytes")).expect("utf8");
        assert_eq!(text, "x\ty\n1\tn/a\n");
    }

    #[test]
    fn parse_number_treats_na_as_nan() {
        assert!(parse_number("n/a").is_nan());
        assert!(parse_number("").is_nan());
        assert_eq!(parse_number(" 3.5 "), 3.5);
        assert!(is_missing("NaN"));
        assert!(!is_missing("0"));
    }
}
