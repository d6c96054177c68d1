//! ASL series with an odd number of volumes cannot form label/control pairs;
//! the trailing volume is dropped and the sidecar plus `aslcontext.tsv` are
//! regenerated to match.

use crate::{Action, OperationReport};
use anyhow::{anyhow, Result};
use curate_core::sidecar::{read_sidecar, sidecar_for, write_json, JsonStyle};
use curate_core::{atomic_write_bytes, file_name_str, list_dirs_with_prefix, list_files_matching, require_dir};
use ndarray::{Axis, Slice};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, NiftiType, ReaderOptions};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Which condition the first volume of the series holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VolumeType {
    #[default]
    Label,
    Control,
}

impl VolumeType {
    pub fn as_str(self) -> &'static str {
        match self {
            VolumeType::Label => "label",
            VolumeType::Control => "control",
        }
    }

    fn other(self) -> Self {
        match self {
            VolumeType::Label => VolumeType::Control,
            VolumeType::Control => VolumeType::Label,
        }
    }
}

impl FromStr for VolumeType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "label" => Ok(VolumeType::Label),
            "control" => Ok(VolumeType::Control),
            other => Err(anyhow!("unknown volume type '{}' (expected label or control)", other)),
        }
    }
}

/// `aslcontext.tsv` body for `n` alternating volumes.
pub fn aslcontext_contents(n: usize, first: VolumeType) -> String {
    let mut out = String::from("volume_type\n");
    let mut current = first;
    for _ in 0..n {
        out.push_str(current.as_str());
        out.push('\n');
        current = current.other();
    }
    out
}

fn aslcontext_for(json_path: &Path) -> PathBuf {
    let name = file_name_str(json_path).replace("_asl.json", "_aslcontext.tsv");
    json_path.with_file_name(name)
}

fn count_from_aslcontext(path: &Path) -> Option<usize> {
    let text = fs::read_to_string(path).ok()?;
    let lines = text.lines().filter(|l| !l.trim().is_empty()).count();
    (lines >= 2).then(|| lines - 1)
}

fn count_from_image(path: &Path) -> Result<usize> {
    let header = NiftiHeader::from_file(path)?;
    if header.dim[0] != 4 {
        return Err(anyhow!("non-4D image ({} dimensions)", header.dim[0]));
    }
    Ok(usize::from(header.dim[4]))
}

/// Volume count from `NumVolumes`, then `aslcontext.tsv`, then the image header.
fn volume_count(image: &Path, json_path: &Path) -> Result<usize> {
    let sidecar = read_sidecar(json_path)?;
    if let Some(n) = sidecar.get("NumVolumes").and_then(Value::as_f64) {
        return Ok(n as usize);
    }
    if let Some(n) = count_from_aslcontext(&aslcontext_for(json_path)) {
        return Ok(n);
    }
    count_from_image(image)
}

macro_rules! drop_last_volume {
    ($volume:expr, $header:expr, $image:expr, $elem:ty) => {{
        let data = $volume.into_ndarray::<$elem>()?;
        if data.ndim() != 4 || data.shape()[3] < 1 {
            return Err(anyhow!(
                "expected a 4D ASL image, got shape {:?} for {}",
                data.shape(),
                $image.display()
            ));
        }
        let keep = data.shape()[3] - 1;
        let trimmed = data.slice_axis(Axis(3), Slice::from(0..keep)).to_owned();
        WriterOptions::new($image)
            .reference_header($header)
            .write_nifti(&trimmed)?;
        keep
    }};
}

/// Rewrites `image` without its last volume and returns the new count. The
/// stored datatype is kept unless the series carries an intensity scaling,
/// which the writer cannot reproduce; those are written as float32.
pub fn trim_last_volume(image: &Path) -> Result<usize> {
    let obj = ReaderOptions::new().read_file(image)?;
    let header = obj.header().clone();
    let volume = obj.into_volume();
    let scaled = header.scl_slope != 0.0 && (header.scl_slope != 1.0 || header.scl_inter != 0.0);
    if scaled {
        warn!(
            image = %image.display(),
            slope = header.scl_slope,
            inter = header.scl_inter,
            "scaled series rewritten as float32"
        );
        return Ok(drop_last_volume!(volume, &header, image, f32));
    }
    let kept = match header.data_type()? {
        NiftiType::Uint8 => drop_last_volume!(volume, &header, image, u8),
        NiftiType::Int8 => drop_last_volume!(volume, &header, image, i8),
        NiftiType::Uint16 => drop_last_volume!(volume, &header, image, u16),
        NiftiType::Int16 => drop_last_volume!(volume, &header, image, i16),
        NiftiType::Uint32 => drop_last_volume!(volume, &header, image, u32),
        NiftiType::Int32 => drop_last_volume!(volume, &header, image, i32),
        NiftiType::Uint64 => drop_last_volume!(volume, &header, image, u64),
        NiftiType::Int64 => drop_last_volume!(volume, &header, image, i64),
        NiftiType::Float32 => drop_last_volume!(volume, &header, image, f32),
        NiftiType::Float64 => drop_last_volume!(volume, &header, image, f64),
        other => {
            return Err(anyhow!(
                "unsupported ASL datatype {:?} in {}",
                other,
                image.display()
            ))
        }
    };
    Ok(kept)
}

fn sidecar_matches(json_path: &Path, n: usize) -> Result<bool> {
    let data = read_sidecar(json_path)?;
    let num_ok = data.get("NumVolumes").and_then(Value::as_f64) == Some(n as f64);
    let pairs_ok = data.get("TotalAcquiredPairs").and_then(Value::as_f64) == Some(n as f64 / 2.0);
    Ok(num_ok && pairs_ok)
}

fn write_counts(json_path: &Path, n: usize) -> Result<()> {
    let mut data = read_sidecar(json_path)?;
    data.insert("NumVolumes".to_string(), json!(n));
    data.insert("TotalAcquiredPairs".to_string(), json!(n as f64 / 2.0));
    write_json(json_path, &Value::Object(data), JsonStyle::INDENT_4)
}

fn process_series(
    image: &Path,
    first: VolumeType,
    report: &mut OperationReport,
) -> Result<()> {
    let json_path = sidecar_for(image);
    if !json_path.exists() {
        report.skip(image, "missing sidecar JSON");
        return Ok(());
    }
    let tsv_path = aslcontext_for(&json_path);
    let count = volume_count(image, &json_path)?;
    let dry_run = report.dry_run;

    let target = if count % 2 == 1 {
        info!(image = %image.display(), volumes = count, "odd volume count");
        let kept = if dry_run { count - 1 } else { trim_last_volume(image)? };
        report.record(Action::Update {
            path: image.to_path_buf(),
            details: vec![format!("trimmed last volume: {} -> {}", count, kept)],
        });
        kept
    } else {
        debug!(image = %image.display(), volumes = count, "even volume count");
        count
    };

    let context = aslcontext_contents(target, first);
    let context_current = fs::read_to_string(&tsv_path).map(|t| t == context).unwrap_or(false);
    if !context_current {
        if !dry_run {
            atomic_write_bytes(&tsv_path, context.as_bytes())?;
        }
        report.record(Action::Write { path: tsv_path });
    }
    if !sidecar_matches(&json_path, target)? {
        if !dry_run {
            write_counts(&json_path, target)?;
        }
        report.record(Action::Update {
            path: json_path,
            details: vec![
                format!("NumVolumes = {}", target),
                format!("TotalAcquiredPairs = {}", target as f64 / 2.0),
            ],
        });
    }
    Ok(())
}

/// Walks `sub-*/ses-*/perf` (or `sub-*/perf` when a subject has no sessions)
/// and evens out every `*_asl.nii.gz` series.
pub fn fix_odd_volumes(bids_dir: &Path, first: VolumeType, dry_run: bool) -> Result<OperationReport> {
    require_dir(bids_dir)?;
    let mut report = OperationReport::new(dry_run);
    for sub_dir in list_dirs_with_prefix(bids_dir, "sub-")? {
        let mut containers = list_dirs_with_prefix(&sub_dir, "ses-")?;
        if containers.is_empty() {
            containers.push(sub_dir.clone());
        }
        for container in containers {
            let perf = container.join("perf");
            for image in list_files_matching(&perf, |n| n.ends_with("_asl.nii.gz"))? {
                if let Err(err) = process_series(&image, first, &mut report) {
                    report.fail(&image, err);
                }
            }
        }
    }
    Ok(report)
}
