use anyhow::{anyhow, Result};
use curate_core::format_number;
use curate_core::table::{Table, TAB};
use csv::ReaderBuilder;
use std::path::Path;

#[derive(Debug, Clone, PartialEq)]
pub struct BlockEvent {
    pub onset: f64,
    pub duration: f64,
    pub trial_type: String,
}

/// Reads a headerless `onset<TAB>duration<TAB>weight` file.
fn read_timings(path: &Path) -> Result<Vec<(f64, f64)>> {
    let mut reader = ReaderBuilder::new()
        .delimiter(TAB)
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|e| anyhow!("failed to open {}: {}", path.display(), e))?;
    let mut out = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record?;
        let field = |i: usize| -> Result<f64> {
            record
                .get(i)
                .and_then(|c| c.trim().parse::<f64>().ok())
                .ok_or_else(|| anyhow!("{}:{}: expected numeric column {}", path.display(), line + 1, i + 1))
        };
        out.push((field(0)?, field(1)?));
    }
    Ok(out)
}

/// Collapses back-to-back blocks (onset equal to the previous end) into one.
pub fn merge_blocks(mut timings: Vec<(f64, f64)>, trial_type: &str) -> Vec<BlockEvent> {
    timings.sort_by(|a, b| a.0.total_cmp(&b.0));
    let mut out: Vec<BlockEvent> = Vec::new();
    for (onset, duration) in timings {
        match out.last_mut() {
            Some(prev) if onset == prev.onset + prev.duration => prev.duration += duration,
            _ => out.push(BlockEvent {
                onset,
                duration,
                trial_type: trial_type.to_string(),
            }),
        }
    }
    out
}

fn trial_type_of(path: &Path) -> String {
    let name = curate_core::file_name_str(path);
    name.split('.').next().unwrap_or(name).to_string()
}

/// Merges each timing file's blocks and writes one events TSV ordered by onset.
pub fn merge_block_files(inputs: &[impl AsRef<Path>], output: &Path) -> Result<Vec<BlockEvent>> {
    let mut events = Vec::new();
    for input in inputs {
        let input = input.as_ref();
        let timings = read_timings(input)?;
        events.extend(merge_blocks(timings, &trial_type_of(input)));
    }
    events.sort_by(|a, b| a.onset.total_cmp(&b.onset));

    let mut table = Table::new(vec![
        "onset".to_string(),
        "duration".to_string(),
        "trial_type".to_string(),
    ]);
    for e in &events {
        table.rows.push(vec![
            format_number(e.onset),
            format_number(e.duration),
            e.trial_type.clone(),
        ]);
    }
    table.write_tsv(output)?;
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{scratch_dir, touch};
    use std::fs;

    #[test]
    fn adjacent_blocks_merge() {
        let merged = merge_blocks(vec![(30.0, 10.0), (0.0, 10.0), (10.0, 10.0)], "0back");
        assert_eq!(merged.len(), 2);
        assert_eq!((merged[0].onset, merged[0].duration), (0.0, 20.0));
        assert_eq!((merged[1].onset, merged[1].duration), (30.0, 10.0));
    }

    #[test]
    fn files_combine_sorted_by_onset() {
        let root = scratch_dir("blocks");
        let zero = root.join("0back.txt");
        let two = root.join("2back.txt");
        touch(&zero, "0\t12\t1\n12\t12\t1\n60\t12\t1\n");
        touch(&two, "24\t12\t1\n");
        let out = root.join("task-fracback_events.tsv");
        let events = merge_block_files(&[zero, two], &out).expect("merge");
        assert_eq!(events.len(), 3);
        assert_eq!(
            fs::read_to_string(&out).expect("tsv"),
            "onset\tduration\ttrial_type\n0\t24\t0back\n24\t12\t2back\n60\t12\t0back\n"
        );
        let _ = fs::remove_dir_all(root);
    }
}
