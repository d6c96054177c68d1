//! Summary scores for per-instrument self-report tables.
//!
//! Item cells are read as numbers; blanks and non-numeric cells are missing.
//! Row sums need at least one present item, otherwise the score is missing.
//! Score columns are appended (or overwritten on a re-run); every other
//! column is written back untouched.

use anyhow::Result;
use curate_core::table::{parse_number, Table};
use curate_core::{file_name_str, format_number, list_files_matching, require_dir};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

type Series = Vec<f64>;

fn missing(t: &Table) -> Series {
    vec![f64::NAN; t.rows.len()]
}

fn numeric(t: &Table, col: &str) -> Option<Series> {
    t.column_values(col)
        .map(|vals| vals.into_iter().map(parse_number).collect())
}

fn present_columns(t: &Table, cols: &[String]) -> Vec<Series> {
    cols.iter().filter_map(|c| numeric(t, c)).collect()
}

/// Row-wise sum over present values; NaN when a row has none.
fn row_sum(t: &Table, parts: &[Series]) -> Series {
    (0..t.rows.len())
        .map(|i| {
            let vals: Vec<f64> = parts.iter().map(|p| p[i]).filter(|v| !v.is_nan()).collect();
            if vals.is_empty() {
                f64::NAN
            } else {
                vals.iter().sum()
            }
        })
        .collect()
}

fn sum_columns(t: &Table, cols: &[String]) -> Series {
    row_sum(t, &present_columns(t, cols))
}

fn mean_columns(t: &Table, cols: &[String]) -> Series {
    let parts = present_columns(t, cols);
    (0..t.rows.len())
        .map(|i| {
            let vals: Vec<f64> = parts.iter().map(|p| p[i]).filter(|v| !v.is_nan()).collect();
            if vals.is_empty() {
                f64::NAN
            } else {
                vals.iter().sum::<f64>() / vals.len() as f64
            }
        })
        .collect()
}

fn add(a: &[f64], b: &[f64]) -> Series {
    a.iter().zip(b).map(|(x, y)| x + y).collect()
}

fn map_series(s: &[f64], f: impl Fn(f64) -> f64) -> Series {
    s.iter().map(|&v| if v.is_nan() { v } else { f(v) }).collect()
}

fn reversed_sum(t: &Table, cols: &[String], flip: impl Fn(f64) -> f64) -> Series {
    let parts: Vec<Series> = present_columns(t, cols)
        .into_iter()
        .map(|s| map_series(&s, &flip))
        .collect();
    if parts.is_empty() {
        return missing(t);
    }
    row_sum(t, &parts)
}

fn items(prefix: &str, numbers: impl IntoIterator<Item = usize>) -> Vec<String> {
    numbers
        .into_iter()
        .map(|i| format!("{}_{}", prefix, i))
        .collect()
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// Numbered item columns under `prefix`; computed score columns never match.
fn prefixed(t: &Table, prefix: &str) -> Vec<String> {
    t.headers
        .iter()
        .filter(|h| {
            h.strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with(|c: char| c.is_ascii_digit()))
        })
        .cloned()
        .collect()
}

fn put(t: &mut Table, name: &str, values: &[f64]) {
    let cells = values
        .iter()
        .map(|&v| if v.is_nan() { String::new() } else { format_number(v) })
        .collect();
    t.set_column(name, cells);
}

fn flag(cond: impl Fn(f64, f64) -> bool, a: &[f64], b: &[f64]) -> Series {
    a.iter()
        .zip(b)
        .map(|(&x, &y)| if cond(x, y) { 1.0 } else { 0.0 })
        .collect()
}

/// Maps a value through `(low, high, score)` bands; later bands win on overlap
/// and values outside every band are missing.
fn banded(s: &[f64], bands: &[(f64, f64, f64)]) -> Series {
    s.iter()
        .map(|&v| {
            let mut out = f64::NAN;
            if v.is_nan() {
                return out;
            }
            for &(lo, hi, score) in bands {
                if v >= lo && v <= hi {
                    out = score;
                }
            }
            out
        })
        .collect()
}

fn score_als(t: &mut Table) {
    let avg = mean_columns(t, &items("als", 1..=18));
    put(t, "als_score_avg", &avg);
}

fn score_mapssr(t: &mut Table) {
    let all = prefixed(t, "mapssr_");
    if !all.is_empty() {
        let total = sum_columns(t, &all);
        put(t, "mapsr_rawtot_sum", &total);
    }
    let social = sum_columns(t, &items("mapssr", 1..=3));
    let recvoc = sum_columns(t, &items("mapssr", 4..=6));
    let motrelation = sum_columns(t, &items("mapssr", 7..=9));
    let engage = sum_columns(t, &items("mapssr", 10..=15));
    put(t, "mapsr_social_sum", &social);
    put(t, "mapsr_recvoc_sum", &recvoc);
    put(t, "mapsr_motrelation_sum", &motrelation);
    put(t, "mapsr_engage_sum", &engage);
}

fn score_swan(t: &mut Table) {
    let t1 = sum_columns(t, &items("swan", 1..=9));
    let t2 = sum_columns(t, &items("swan", 10..=18));
    put(t, "swan_total1", &t1);
    put(t, "swan_total2", &t2);
    // comparisons against a missing total are false, so such rows score 0
    put(t, "eswanADHD_score_combined", &flag(|a, b| a >= 6.0 && b >= 6.0, &t1, &t2));
    put(t, "eswanADHD_score_inattentive", &flag(|a, b| a >= 6.0 && b < 6.0, &t1, &t2));
    put(t, "eswanADHD_score_hyperactive", &flag(|a, b| a < 6.0 && b >= 6.0, &t1, &t2));
    put(t, "eswanADHD_score_noADHD", &flag(|a, b| a < 6.0 && b < 6.0, &t1, &t2));
}

fn score_aces(t: &mut Table) {
    let total = sum_columns(t, &items("aces", 1..=10));
    put(t, "aces_score_total", &total);
}

fn score_scared(t: &mut Table) {
    let total = sum_columns(t, &items("scared", 1..=41));
    let disorder = map_series(&total, |v| if v >= 25.0 { 1.0 } else { 0.0 });
    put(t, "scared_score_total", &total);
    put(t, "scared_score_anxietyDisorder", &disorder);
}

fn score_rpaq(t: &mut Table) {
    let proactive = sum_columns(t, &items("rpaq", [2, 4, 6, 9, 10, 12, 15, 17, 18, 20, 21, 23]));
    let reactive = sum_columns(t, &items("rpaq", [1, 3, 5, 7, 8, 11, 13, 14, 16, 19, 22]));
    put(t, "rpaq_score_proactiveTotal", &proactive);
    put(t, "rpaq_score_reactiveTotal", &reactive);
}

fn score_ari(t: &mut Table) {
    let cols = items("ari", 1..=6);
    let avg = mean_columns(t, &cols);
    let total = sum_columns(t, &cols);
    put(t, "ari_score_avg", &avg);
    put(t, "ari_score_total", &total);
}

fn score_bdi(t: &mut Table) {
    let cols: Vec<String> = prefixed(t, "bdi_")
        .into_iter()
        .filter(|c| c != "bdi_19a")
        .collect();
    let total = if cols.is_empty() {
        missing(t)
    } else {
        sum_columns(t, &cols)
    };
    put(t, "bdi_score_total", &total);
}

fn score_bisbas(t: &mut Table) {
    let flip = |x: f64| 5.0 - x;
    let bis_reversed = items("bisbas", [8, 13, 16, 19, 24]);
    let bis_plain = items("bisbas", [2, 22]);
    let mut parts: Vec<Series> = Vec::new();
    if !present_columns(t, &bis_reversed).is_empty() {
        parts.push(reversed_sum(t, &bis_reversed, flip));
    }
    if !present_columns(t, &bis_plain).is_empty() {
        parts.push(sum_columns(t, &bis_plain));
    }
    let bis = match parts.split_first() {
        Some((first, rest)) => rest.iter().fold(first.clone(), |acc, p| add(&acc, p)),
        None => missing(t),
    };
    let drive = reversed_sum(t, &items("bisbas", [3, 9, 12, 21]), flip);
    let fun = reversed_sum(t, &items("bisbas", [5, 10, 15, 20]), flip);
    let reward = reversed_sum(t, &items("bisbas", [4, 7, 14, 18, 23]), flip);
    put(t, "bis_score_total", &bis);
    put(t, "bas_score_driveTotal", &drive);
    put(t, "bas_score_funTotal", &fun);
    put(t, "bas_score_rewardTotal", &reward);
}

fn score_grit(t: &mut Table) {
    let grittiness = mean_columns(t, &items("grit", [2, 4, 5, 7, 8, 10]));
    let openness = mean_columns(t, &items("grit", [1, 3, 6, 9, 11, 12]));
    put(t, "grit_score_grittiness", &grittiness);
    put(t, "grit_score_openness", &openness);
}

fn score_hcl16(t: &mut Table) {
    let mut cols = prefixed(t, "hcl16_3_");
    if cols.is_empty() {
        cols = prefixed(t, "hcl16_");
    }
    let total = if cols.is_empty() {
        missing(t)
    } else {
        sum_columns(t, &cols)
    };
    put(t, "hcl_score_total", &total);
}

fn score_bss(t: &mut Table) {
    let mean = mean_columns(t, &items("bss", 1..=8));
    let experience = mean_columns(t, &names(&["bss_1", "bss_5"]));
    let boredom = mean_columns(t, &names(&["bss_2", "bss_6"]));
    let thrill = mean_columns(t, &names(&["bss_3", "bss_7"]));
    let disinhibition = mean_columns(t, &names(&["bss_4", "bss_8"]));
    put(t, "bss_score_mean", &mean);
    put(t, "bss_score_experience", &experience);
    put(t, "bss_score_boredom", &boredom);
    put(t, "bss_score_thrill", &thrill);
    put(t, "bss_score_disinhibition", &disinhibition);
}

fn mixed_key_total(t: &Table, prefix: &str, plain: &[usize], reversed: &[usize]) -> Series {
    let s1 = sum_columns(t, &items(prefix, plain.iter().copied()));
    let s2 = reversed_sum(t, &items(prefix, reversed.iter().copied()), |x| 1.0 - x);
    add(&s1, &s2)
}

fn score_phys_anhed(t: &mut Table) {
    let total = mixed_key_total(t, "phys_anhed", &[5, 6, 8, 10], &[1, 2, 3, 4, 7, 9, 11, 12, 13, 14, 15]);
    put(t, "rpasShort_score_total", &total);
}

fn score_soc_anhed(t: &mut Table) {
    let total = mixed_key_total(t, "soc_anhed", &[1, 2, 3, 5, 6, 7, 8, 10, 15], &[4, 9, 11, 12, 13, 14]);
    put(t, "rsasShort_score_total", &total);
}

fn score_eswan_dmdd(t: &mut Table) {
    let setting = |tag: &str| -> Vec<String> {
        (1..=10).map(|i| format!("eswan_dmdd_{:02}{}", i, tag)).collect()
    };
    let home = sum_columns(t, &setting("a"));
    let friend = sum_columns(t, &setting("b"));
    let school = sum_columns(t, &setting("c"));
    let total = add(&add(&home, &friend), &school);
    put(t, "eswanDMDD_score_homeOutburst", &home);
    put(t, "eswanDMDD_score_friendOutburst", &friend);
    put(t, "eswanDMDD_score_schoolOutburst", &school);
    put(t, "eswanDMDD_score_total", &total);
}

/// `HHMM` clock value (e.g. `2230`) as decimal hours.
pub fn hhmm_to_hours(cell: &str) -> Option<f64> {
    let v = parse_number(cell);
    if v.is_nan() || v < 0.0 {
        return None;
    }
    let digits = format!("{:04}", v.trunc() as u64);
    let hh: u32 = digits.get(..2)?.parse().ok()?;
    let mm: u32 = digits.get(2..)?.parse().ok()?;
    (hh <= 23 && mm <= 59).then(|| f64::from(hh) + f64::from(mm) / 60.0)
}

fn score_psqi(t: &mut Table) {
    let col = |t: &Table, name: &str| numeric(t, name).unwrap_or_else(|| missing(t));

    let comp1 = col(t, "psqi_6");

    let latency = map_series(&col(t, "psqi_2"), |minutes| {
        if minutes <= 15.0 {
            0.0
        } else if (16.0..=30.0).contains(&minutes) {
            1.0
        } else if (31.0..=60.0).contains(&minutes) {
            2.0
        } else if minutes > 60.0 {
            3.0
        } else {
            f64::NAN
        }
    });
    let latency_total = add(&latency, &col(t, "psqi_5a"));
    let comp2 = banded(&latency_total, &[(0.0, 0.0, 0.0), (1.0, 2.0, 1.0), (3.0, 4.0, 2.0), (5.0, 6.0, 3.0)]);

    let hours = col(t, "psqi_4");
    let comp3 = map_series(&hours, |h| {
        if h < 5.0 {
            3.0
        } else if (4.0..=5.0).contains(&h) {
            2.0
        } else if (6.0..=7.0).contains(&h) {
            1.0
        } else if h > 7.0 {
            0.0
        } else {
            f64::NAN
        }
    });

    let comp4: Series = match (t.column_values("psqi_1"), t.column_values("psqi_3")) {
        (Some(bed), Some(wake)) if t.column("psqi_4").is_some() => bed
            .iter()
            .zip(wake.iter())
            .zip(hours.iter())
            .map(|((b, w), &slept)| {
                let (Some(b), Some(w)) = (hhmm_to_hours(b), hhmm_to_hours(w)) else {
                    return f64::NAN;
                };
                let in_bed = if w >= b { w - b } else { 24.0 - b + w };
                let efficiency = slept / in_bed * 100.0;
                if !efficiency.is_finite() {
                    f64::NAN
                } else if efficiency > 85.0 {
                    0.0
                } else if (75.0..=84.0).contains(&efficiency) {
                    1.0
                } else if (65.0..=74.0).contains(&efficiency) {
                    2.0
                } else if efficiency < 65.0 {
                    3.0
                } else {
                    f64::NAN
                }
            })
            .collect(),
        _ => missing(t),
    };

    let disturbances = sum_columns(
        t,
        &names(&[
            "psqi_5b", "psqi_5c", "psqi_5d", "psqi_5e", "psqi_5f", "psqi_5g", "psqi_5h", "psqi_5i",
            "psqi_5othera",
        ]),
    );
    let comp5 = banded(&disturbances, &[(0.0, 0.0, 0.0), (1.0, 9.0, 1.0), (10.0, 18.0, 2.0), (19.0, 27.0, 3.0)]);

    let comp6 = col(t, "psqi_7");

    let daytime = sum_columns(t, &names(&["psqi_8", "psqi_9"]));
    let comp7 = banded(&daytime, &[(0.0, 0.0, 0.0), (1.0, 2.0, 1.0), (3.0, 4.0, 2.0), (5.0, 6.0, 3.0)]);

    let components = [comp1, comp2, comp3, comp4, comp5, comp6, comp7];
    let global = row_sum(t, &components);
    for (i, comp) in components.iter().enumerate() {
        put(t, &format!("psqi_score_component{}", i + 1), comp);
    }
    put(t, "psqi_score_global", &global);
}

fn score_best_ms(t: &mut Table) {
    let a = sum_columns(t, &items("best_ms", 1..=8));
    let b = sum_columns(t, &items("best_ms", 9..=12));
    let both = add(&a, &b);
    put(t, "best_score_subscaleA", &a);
    put(t, "best_score_subscaleB", &b);
    put(t, "best_score_finalNoComponentC", &both);
}

/// Scoring routine for an instrument table, keyed by file stem.
pub fn scorer_for(instrument: &str) -> Option<fn(&mut Table)> {
    let f: fn(&mut Table) = match instrument {
        "als" => score_als,
        "mapssr" => score_mapssr,
        "swan" => score_swan,
        "aces" => score_aces,
        "scared" => score_scared,
        "rpaq" => score_rpaq,
        "ari" => score_ari,
        "bdi" => score_bdi,
        "bisbas" => score_bisbas,
        "grit" => score_grit,
        "hcl16" => score_hcl16,
        "bss" => score_bss,
        "phys_anhed" => score_phys_anhed,
        "soc_anhed" => score_soc_anhed,
        "eswan_dmdd" => score_eswan_dmdd,
        "psqi" => score_psqi,
        "best_ms" => score_best_ms,
        _ => return None,
    };
    Some(f)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoreReport {
    pub scored: Vec<PathBuf>,
    /// File names with no matching scorer.
    pub skipped: Vec<String>,
}

/// Scores every `<instrument>.tsv` in `input_dir`, writing to `output_dir`
/// (the input directory when `None`).
pub fn score_instruments(input_dir: &Path, output_dir: Option<&Path>) -> Result<ScoreReport> {
    require_dir(input_dir)?;
    let output_dir = output_dir.unwrap_or(input_dir);
    let mut report = ScoreReport::default();
    for path in list_files_matching(input_dir, |n| n.ends_with(".tsv"))? {
        let name = file_name_str(&path).to_string();
        let stem = name.strip_suffix(".tsv").unwrap_or(&name);
        let Some(scorer) = scorer_for(stem) else {
            debug!(file = %name, "no scorer");
            report.skipped.push(name);
            continue;
        };
        let mut table = Table::read_tsv(&path)?;
        scorer(&mut table);
        curate_core::ensure_dir(output_dir)?;
        let out = output_dir.join(&name);
        table.write_tsv(&out)?;
        report.scored.push(out);
    }
    info!(
        scored = report.scored.len(),
        skipped = report.skipped.len(),
        dir = %output_dir.display(),
        "instrument scoring finished"
    );
    Ok(report)
}
