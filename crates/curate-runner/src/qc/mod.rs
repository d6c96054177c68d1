//! Quality-control summary tables built from XCP-D and QSIPrep/QSIRecon
//! derivatives, plus the T1w rating page.

pub mod qsi;
pub mod t1;
pub mod xcpd;

use anyhow::{anyhow, Result};
use curate_core::table::{Table, COMMA};
use curate_core::{ensure_dir, file_name_str, format_number};
use std::path::{Path, PathBuf};

pub use qsi::{qsi_qc, QsiReport};
pub use t1::{generate_slices, t1_qc_html, SliceOptions, SliceReport, T1HtmlOptions, T1HtmlReport};
pub use xcpd::{xcpd_qc, XcpdReport, DEFAULT_ATLAS};

/// One output row as ordered `(column, cell)` pairs.
pub type Record = Vec<(String, String)>;

/// Sorted matches of `pattern` relative to `root`.
pub fn glob_sorted(root: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let full = root.join(pattern);
    let full = full
        .to_str()
        .ok_or_else(|| anyhow!("non UTF-8 path {}", root.display()))?;
    let mut out = Vec::new();
    for entry in glob::glob(full)? {
        let path = entry?;
        if path.is_file() {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

/// `key-value` entities of a BIDS file name, excluding the trailing suffix.
pub fn filename_entities(path: &Path) -> Record {
    let name = file_name_str(path);
    let parts: Vec<&str> = name.split('_').collect();
    let Some((_, entities)) = parts.split_last() else {
        return Vec::new();
    };
    entities
        .iter()
        .filter_map(|part| {
            let mut pieces = part.split('-');
            let key = pieces.next()?;
            let value = pieces.next()?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

/// Stacks records into a table whose columns are `seed` followed by the
/// union of record columns in first-seen order. Absent cells stay empty.
pub fn stack_records(seed: &[String], records: &[Record]) -> Table {
    let mut headers: Vec<String> = seed.to_vec();
    for record in records {
        for (col, _) in record {
            if !headers.contains(col) {
                headers.push(col.clone());
            }
        }
    }
    let mut table = Table::new(headers);
    for record in records {
        let row = table
            .headers
            .iter()
            .map(|h| {
                record
                    .iter()
                    .rev()
                    .find(|(col, _)| col == h)
                    .map(|(_, v)| v.clone())
                    .unwrap_or_default()
            })
            .collect();
        table.rows.push(row);
    }
    table
}

/// First data row of a delimited file as a record.
pub fn first_row(path: &Path, delimiter: u8) -> Result<Record> {
    let table = Table::read(path, delimiter)?;
    let row = table
        .rows
        .first()
        .ok_or_else(|| anyhow!("{} has no data rows", path.display()))?;
    Ok(table.headers.iter().cloned().zip(row.iter().cloned()).collect())
}

/// Numeric cell text for CSV outputs; missing values stay empty.
pub fn csv_number(value: f64) -> String {
    if value.is_nan() {
        String::new()
    } else {
        format_number(value)
    }
}

pub fn write_csv(table: &Table, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    table.write(path, COMMA)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entities_skip_the_suffix() {
        let got = filename_entities(Path::new("sub-1_ses-2_task-rest_motion.tsv"));
        assert_eq!(
            got,
            vec![
                ("sub".to_string(), "1".to_string()),
                ("ses".to_string(), "2".to_string()),
                ("task".to_string(), "rest".to_string()),
            ]
        );
    }

    #[test]
    fn stacking_unions_columns_in_order() {
        let a: Record = vec![("sub".into(), "1".into()), ("x".into(), "0.5".into())];
        let b: Record = vec![("sub".into(), "2".into()), ("acq".into(), "hi".into())];
        let t = stack_records(&[], &[a, b]);
        assert_eq!(t.headers, vec!["sub", "x", "acq"]);
        assert_eq!(t.rows[1], vec!["2", "", "hi"]);
    }
}
