use super::{csv_number, filename_entities, first_row, glob_sorted, stack_records, write_csv, Record};
use anyhow::Result;
use curate_core::table::{parse_number, Table, TAB};
use statrs::statistics::{Data, Median};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const DEFAULT_ATLAS: &str = "4S1056Parcels";
pub const COVERAGE_THRESHOLD: f64 = 0.5;

/// Entity columns of a coverage table; everything else is a parcel.
pub const METADATA_COLUMNS: [&str; 7] = ["sub", "ses", "task", "space", "seg", "stat", "acq"];

const MOTION_PATTERN: &str = "sub-*/ses-*/func/sub-*_ses-*_task-*_motion.tsv";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct XcpdReport {
    pub motion_files: usize,
    pub coverage_files: usize,
    pub outputs: Vec<PathBuf>,
}

fn column_median(values: Vec<&str>) -> f64 {
    let present: Vec<f64> = values
        .into_iter()
        .map(parse_number)
        .filter(|v| !v.is_nan())
        .collect();
    if present.is_empty() {
        return f64::NAN;
    }
    Data::new(present).median()
}

/// One row per motion file: its entities then the median of every column.
pub fn median_motion(xcpd_dir: &Path) -> Result<(usize, Table)> {
    let files = glob_sorted(xcpd_dir, MOTION_PATTERN)?;
    let mut records: Vec<Record> = Vec::new();
    let mut seed: Vec<String> = Vec::new();
    let mut widest = 0;
    for path in &files {
        let motion = Table::read_tsv(path)?;
        let mut record = filename_entities(path);
        let entity_count = record.len();
        for header in &motion.headers {
            let median = motion.column_values(header).map(column_median).unwrap_or(f64::NAN);
            record.push((header.clone(), csv_number(median)));
        }
        if entity_count > widest {
            widest = entity_count;
            seed = record.iter().map(|(k, _)| k.clone()).collect();
        }
        records.push(record);
    }
    Ok((files.len(), stack_records(&seed, &records)))
}

pub fn coverage_table(xcpd_dir: &Path, atlas: &str) -> Result<(usize, Table)> {
    let pattern = format!(
        "sub-*/ses-*/func/sub-*_ses-*_task-*_space-*_seg-{}_stat-coverage_bold.tsv",
        atlas
    );
    let files = glob_sorted(xcpd_dir, &pattern)?;
    let mut records = Vec::new();
    for path in &files {
        let mut record = filename_entities(path);
        match first_row(path, TAB) {
            Ok(values) => record.extend(values),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "coverage file unreadable");
                continue;
            }
        }
        records.push(record);
    }
    Ok((files.len(), stack_records(&[], &records)))
}

pub fn parcel_columns(table: &Table) -> Vec<usize> {
    (0..table.headers.len())
        .filter(|&i| !METADATA_COLUMNS.contains(&table.headers[i].as_str()))
        .collect()
}

fn below_threshold(cell: &str) -> bool {
    parse_number(cell) < COVERAGE_THRESHOLD
}

/// Appends a `col_sum` row counting, per parcel, the rows under threshold.
pub fn with_column_sums(coverage: &Table) -> Table {
    let parcels = parcel_columns(coverage);
    let mut out = coverage.clone();
    for col in METADATA_COLUMNS {
        out.ensure_column(col, "");
    }
    let mut row = vec![String::new(); out.headers.len()];
    if let Some(i) = out.column("sub") {
        row[i] = "col_sum".to_string();
    }
    for &p in &parcels {
        let count = coverage
            .rows
            .iter()
            .filter(|r| r.get(p).is_some_and(|c| below_threshold(c)))
            .count();
        row[p] = count.to_string();
    }
    out.rows.push(row);
    out
}

/// Adds `row_sum`: parcels under threshold per row.
pub fn with_row_sums(coverage: &Table) -> Table {
    let parcels = parcel_columns(coverage);
    let mut out = coverage.clone();
    let sums = coverage
        .rows
        .iter()
        .map(|r| {
            parcels
                .iter()
                .filter(|&&p| r.get(p).is_some_and(|c| below_threshold(c)))
                .count()
                .to_string()
        })
        .collect();
    out.set_column("row_sum", sums);
    out
}

/// Writes the median-motion and parcel-coverage summaries into `output_dir`.
pub fn xcpd_qc(xcpd_dir: &Path, output_dir: &Path, atlas: &str) -> Result<XcpdReport> {
    curate_core::require_dir(xcpd_dir)?;
    let mut report = XcpdReport::default();

    let (motion_files, medians) = median_motion(xcpd_dir)?;
    report.motion_files = motion_files;
    if medians.rows.is_empty() {
        warn!(dir = %xcpd_dir.display(), "no motion files found");
    } else {
        let fd_path = output_dir.join("xcpd_qc_median_fd.csv");
        write_csv(&medians, &fd_path)?;
        info!(files = motion_files, out = %fd_path.display(), "median motion summary written");
        report.outputs.push(fd_path);
    }

    let (coverage_files, coverage) = coverage_table(xcpd_dir, atlas)?;
    report.coverage_files = coverage_files;
    if coverage.rows.is_empty() {
        warn!(atlas, "no coverage files found");
        return Ok(report);
    }
    let outputs = [
        (format!("xcpd_{}_qc_coverage.csv", atlas), coverage.clone()),
        (format!("xcpd_{}_qc_coverage_col_sums.csv", atlas), with_column_sums(&coverage)),
        (format!("xcpd_{}_qc_coverage_row_sums.csv", atlas), with_row_sums(&coverage)),
    ];
    for (name, table) in outputs {
        let path = output_dir.join(name);
        write_csv(&table, &path)?;
        report.outputs.push(path);
    }
    info!(files = coverage_files, atlas, "coverage summaries written");
    Ok(report)
}
