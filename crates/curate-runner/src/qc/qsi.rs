use super::{csv_number, filename_entities, first_row, glob_sorted, stack_records, write_csv, Record};
use anyhow::{anyhow, Result};
use curate_core::bids::subject_and_session;
use curate_core::table::{parse_number, Table, COMMA, TAB};
use statrs::statistics::Statistics;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const VOLUME_PREFIX: &str = "total_volume_mm3_";
pub const TOTAL_COLUMN: &str = "total_volume_all_bundles";
pub const MEAN_COLUMN: &str = "mean_bundle_volume";
pub const OUTLIER_SD: f64 = 3.0;

const VOLUME_SUFFIX: &str = "_space-ACPC_model-gqi_volume.csv";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QsiReport {
    /// Per-session volume files written from bundle stats.
    pub pivoted: Vec<PathBuf>,
    pub volume_rows: usize,
    pub image_qc_rows: usize,
    pub outputs: Vec<PathBuf>,
}

fn session_ids(root: &Path, path: &Path) -> Result<(String, String)> {
    let rel = path.strip_prefix(root).unwrap_or(path);
    match subject_and_session(rel) {
        (Some(sub), Some(ses)) => Ok((sub, ses)),
        _ => Err(anyhow!("no subject/session in {}", path.display())),
    }
}

fn pivot_one(root: &Path, csv_file: &Path) -> Result<Option<PathBuf>> {
    let stats = Table::read(csv_file, COMMA)?;
    let (Some(name_idx), Some(vol_idx)) = (stats.column("bundle_name"), stats.column("total_volume_mm3"))
    else {
        warn!(path = %csv_file.display(), "missing bundle_name or total_volume_mm3, skipping");
        return Ok(None);
    };
    let mut pivot = Table::new(Vec::new());
    pivot.rows.push(Vec::new());
    for row in &stats.rows {
        let bundle = row.get(name_idx).cloned().unwrap_or_default();
        let volume = row.get(vol_idx).cloned().unwrap_or_default();
        pivot.set_column(&format!("{}{}", VOLUME_PREFIX, bundle), vec![volume]);
    }
    let (sub, ses) = session_ids(root, csv_file)?;
    let dir = csv_file.parent().unwrap_or(root);
    let out = dir.join(format!("{}_{}{}", sub, ses, VOLUME_SUFFIX));
    pivot.write(&out, COMMA)?;
    Ok(Some(out))
}

/// Turns every `*_bundlestats.csv` into a one-row table of bundle volumes
/// next to it. Unreadable files are logged and skipped.
pub fn pivot_bundle_stats(qsirecon_dir: &Path) -> Result<Vec<PathBuf>> {
    let files = glob_sorted(qsirecon_dir, "sub-*/ses-*/dwi/*_bundlestats.csv")?;
    info!(files = files.len(), "found bundle stats");
    let mut written = Vec::new();
    for file in &files {
        match pivot_one(qsirecon_dir, file) {
            Ok(Some(out)) => written.push(out),
            Ok(None) => {}
            Err(err) => warn!(path = %file.display(), error = %err, "bundle stats failed"),
        }
    }
    Ok(written)
}

pub fn volume_columns(table: &Table) -> Vec<usize> {
    (0..table.headers.len())
        .filter(|&i| table.headers[i].starts_with(VOLUME_PREFIX))
        .collect()
}

fn row_numbers(row: &[String], cols: &[usize]) -> Vec<f64> {
    cols.iter()
        .map(|&i| row.get(i).map(|c| parse_number(c)).unwrap_or(f64::NAN))
        .collect()
}

/// Concatenated per-session volumes with the row total and mean bundle volume.
pub fn concatenate_volumes(qsirecon_dir: &Path) -> Result<Option<Table>> {
    let pattern = format!("sub-*/ses-*/dwi/*{}", VOLUME_SUFFIX);
    let files = glob_sorted(qsirecon_dir, &pattern)?;
    let mut records: Vec<Record> = Vec::new();
    for file in &files {
        let loaded = session_ids(qsirecon_dir, file)
            .and_then(|ids| first_row(file, COMMA).map(|values| (ids, values)));
        match loaded {
            Ok(((sub, ses), values)) => {
                let mut record = vec![("subject".to_string(), sub), ("session".to_string(), ses)];
                record.extend(values);
                records.push(record);
            }
            Err(err) => warn!(path = %file.display(), error = %err, "volume file failed"),
        }
    }
    if records.is_empty() {
        return Ok(None);
    }
    let mut table = stack_records(&[], &records);
    let cols = volume_columns(&table);
    let mut totals = Vec::with_capacity(table.rows.len());
    let mut means = Vec::with_capacity(table.rows.len());
    for row in &table.rows {
        let present: Vec<f64> = row_numbers(row, &cols)
            .into_iter()
            .filter(|v| !v.is_nan())
            .collect();
        totals.push(csv_number(present.iter().sum()));
        means.push(csv_number(present.iter().mean()));
    }
    table.set_column(TOTAL_COLUMN, totals);
    table.set_column(MEAN_COLUMN, means);
    Ok(Some(table))
}

/// Bundle columns: everything but the identifiers and row summaries.
pub fn bundle_columns(table: &Table) -> Vec<usize> {
    (0..table.headers.len())
        .filter(|&i| {
            !matches!(
                table.headers[i].as_str(),
                "subject" | "session" | TOTAL_COLUMN | MEAN_COLUMN
            )
        })
        .collect()
}

fn column_numbers(table: &Table, col: usize) -> Vec<f64> {
    table
        .rows
        .iter()
        .map(|r| r.get(col).map(|c| parse_number(c)).unwrap_or(f64::NAN))
        .collect()
}

/// Appends a row counting, per bundle, the sessions missing a volume.
pub fn with_missing_counts(volumes: &Table) -> Table {
    let mut out = volumes.clone();
    let mut row = vec![String::new(); out.headers.len()];
    if let Some(i) = out.column("subject") {
        row[i] = "num_subjects_with_missing_bundle".to_string();
    }
    for col in bundle_columns(volumes) {
        let missing = column_numbers(volumes, col).iter().filter(|v| v.is_nan()).count();
        row[col] = missing.to_string();
    }
    out.rows.push(row);
    out
}

/// Replaces bundle volumes with 0/1 flags: missing, or at least three
/// standard deviations from the bundle mean. Adds per-row counts.
pub fn with_outlier_flags(volumes: &Table) -> Table {
    let cols = bundle_columns(volumes);
    let mut out = volumes.clone();
    let mut outliers = vec![0usize; volumes.rows.len()];
    let mut missing = vec![0usize; volumes.rows.len()];
    for &col in &cols {
        let values = column_numbers(volumes, col);
        let present: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
        let mean = present.iter().mean();
        let sd = present.iter().std_dev();
        let upper = mean + OUTLIER_SD * sd;
        let lower = mean - OUTLIER_SD * sd;
        for (i, v) in values.iter().enumerate() {
            let flagged = v.is_nan() || *v >= upper || *v <= lower;
            if v.is_nan() {
                missing[i] += 1;
            }
            if flagged {
                outliers[i] += 1;
            }
            out.rows[i][col] = usize::from(flagged).to_string();
        }
    }
    out.set_column(
        "num_row_outliers",
        outliers.iter().map(ToString::to_string).collect(),
    );
    out.set_column(
        "num_missing_bundles",
        missing.iter().map(ToString::to_string).collect(),
    );
    out
}

/// One row per QSIPrep `desc-image_qc.tsv`: filename entities then its values.
pub fn image_qc_table(qsiprep_dir: &Path) -> Result<Table> {
    let files = glob_sorted(qsiprep_dir, "sub-*/ses-*/dwi/sub-*_ses-*_space-*_desc-image_qc.tsv")?;
    let mut records = Vec::new();
    for file in &files {
        let mut record = filename_entities(file);
        record.extend(first_row(file, TAB)?);
        records.push(record);
    }
    Ok(stack_records(&[], &records))
}

pub fn qsi_qc(qsiprep_dir: &Path, qsirecon_dir: &Path, output_dir: &Path) -> Result<QsiReport> {
    curate_core::require_dir(qsirecon_dir)?;
    curate_core::require_dir(qsiprep_dir)?;
    let mut report = QsiReport {
        pivoted: pivot_bundle_stats(qsirecon_dir)?,
        ..QsiReport::default()
    };

    match concatenate_volumes(qsirecon_dir)? {
        Some(volumes) => {
            report.volume_rows = volumes.rows.len();
            let outputs = [
                ("qsirecon_DSIStudio_bundle_volume.csv", volumes.clone()),
                ("qsirecon_DSIStudio_missing_bundle_column_sum.csv", with_missing_counts(&volumes)),
                ("qsirecon_DSIStudio_row_sum_bundle_volume.csv", with_outlier_flags(&volumes)),
            ];
            for (name, table) in outputs {
                let path = output_dir.join(name);
                write_csv(&table, &path)?;
                report.outputs.push(path);
            }
        }
        None => warn!(dir = %qsirecon_dir.display(), "no volume summary files found"),
    }

    let image_qc = image_qc_table(qsiprep_dir)?;
    report.image_qc_rows = image_qc.rows.len();
    if image_qc.rows.is_empty() {
        warn!(dir = %qsiprep_dir.display(), "no image QC files found");
    } else {
        let path = output_dir.join("qsiprep_qc.csv");
        write_csv(&image_qc, &path)?;
        report.outputs.push(path);
    }
    info!(
        volumes = report.volume_rows,
        image_qc = report.image_qc_rows,
        out = %output_dir.display(),
        "QSI QC tables written"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{scratch_dir, touch};
    use std::fs;

    fn stats(root: &Path, sub: &str, rows: &str) {
        touch(
            &root.join(format!("{sub}/ses-1/dwi/{sub}_ses-1_space-ACPC_bundlestats.csv")),
            &format!("bundle_name,total_volume_mm3\n{}", rows),
        );
    }

    #[test]
    fn bundle_stats_pivot_and_summaries() {
        let root = scratch_dir("qsi");
        let recon = root.join("qsirecon");
        let prep = root.join("qsiprep");
        stats(&recon, "sub-1", "AF_L,100\nCST_R,50\n");
        stats(&recon, "sub-2", "AF_L,300\n");
        touch(&recon.join("sub-3/ses-1/dwi/sub-3_ses-1_bundlestats.csv"), "name,vol\nx,1\n");
        touch(
            &prep.join("sub-1/ses-1/dwi/sub-1_ses-1_space-ACPC_desc-image_qc.tsv"),
            "raw_neighbor_corr\tmean_fd\n0.5\t0.25\n",
        );

        let out = root.join("out");
        let report = qsi_qc(&prep, &recon, &out).expect("qsi");
        assert_eq!(report.pivoted.len(), 2);
        assert_eq!(report.volume_rows, 2);
        assert_eq!(report.image_qc_rows, 1);
        assert_eq!(report.outputs.len(), 4);

        let pivot = fs::read_to_string(recon.join("sub-1/ses-1/dwi/sub-1_ses-1_space-ACPC_model-gqi_volume.csv"))
            .expect("pivot");
        assert_eq!(pivot, "total_volume_mm3_AF_L,total_volume_mm3_CST_R\n100,50\n");

        let volumes = fs::read_to_string(out.join("qsirecon_DSIStudio_bundle_volume.csv")).expect("volumes");
        assert_eq!(
            volumes,
            "subject,session,total_volume_mm3_AF_L,total_volume_mm3_CST_R,total_volume_all_bundles,mean_bundle_volume\n\
             sub-1,ses-1,100,50,150,75\n\
             sub-2,ses-1,300,,300,300\n"
        );
        let missing = fs::read_to_string(out.join("qsirecon_DSIStudio_missing_bundle_column_sum.csv"))
            .expect("missing");
        assert!(missing.ends_with("num_subjects_with_missing_bundle,,0,1,,\n"));

        let qc = fs::read_to_string(out.join("qsiprep_qc.csv")).expect("qc");
        assert_eq!(qc, "sub,ses,space,desc,raw_neighbor_corr,mean_fd\n1,1,ACPC,image,0.5,0.25\n");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn outliers_flag_missing_and_extremes() {
        let mut t = Table::new(vec!["subject".into(), "session".into(), "total_volume_mm3_A".into()]);
        for (i, v) in ["10", "10", "10", "10", "10", "10", "10", "10", "10", "10", "1000", ""]
            .iter()
            .enumerate()
        {
            t.rows.push(vec![format!("sub-{}", i), "ses-1".into(), v.to_string()]);
        }
        let flagged = with_outlier_flags(&t);
        let flags: Vec<&str> = flagged.column_values("total_volume_mm3_A").expect("flags");
        assert_eq!(&flags[..3], &["0", "0", "0"]);
        assert_eq!(flags[10], "1");
        assert_eq!(flags[11], "1");
        assert_eq!(flagged.column_values("num_missing_bundles").expect("missing")[11], "1");
        assert_eq!(flagged.column_values("num_row_outliers").expect("outliers")[0], "0");
    }
}
