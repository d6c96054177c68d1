pub mod bids;
pub mod config;
pub mod error;
pub mod mover;
pub mod sidecar;
pub mod table;

use anyhow::Result;
use chrono::Utc;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

pub use error::CurateError;

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Writes through a hidden sibling temp file and renames it into place.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            ensure_dir(parent)?;
        }
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Fails with `CurateError::NotADirectory` unless `path` is an existing directory.
pub fn require_dir(path: &Path) -> Result<()> {
    if !path.is_dir() {
        return Err(CurateError::NotADirectory(path.to_path_buf()).into());
    }
    Ok(())
}

/// Forward-slash rendering of a relative path, independent of platform.
pub fn to_posix(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().to_string()),
            Component::ParentDir => Some("..".to_string()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

pub fn file_name_str(path: &Path) -> &str {
    path.file_name().and_then(|s| s.to_str()).unwrap_or("")
}

/// Directories directly under `root` whose name starts with `prefix`, sorted.
pub fn list_dirs_with_prefix(root: &Path, prefix: &str) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(root)? {
        let path = entry?.path();
        if path.is_dir() && file_name_str(&path).starts_with(prefix) {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

/// Files directly under `dir` accepted by `keep`, sorted. A missing dir yields nothing.
pub fn list_files_matching(dir: &Path, keep: impl Fn(&str) -> bool) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    if !dir.is_dir() {
        return Ok(out);
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && keep(file_name_str(&path)) {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

/// Renders a float the way tabular outputs expect: integral values without a
/// fractional part, `n/a` for NaN, otherwise the shortest round-trip form.
pub fn format_number(value: f64) -> String {
    if value.is_nan() {
        return "n/a".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if value.fract() == 0.0 && value.abs() < 1e15 {
        return format!("{}", value as i64);
    }
    format!("{}", value)
}

/// Like `format_number`, but a float column keeps its decimal point: `8.0`.
pub fn format_float(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        return format!("{:.1}", value);
    }
    format_number(value)
}

#[cfg(test)]
pub(crate) fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "curate_{}_{}_{}",
        tag,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    ensure_dir(&dir).expect("scratch dir");
    dir
}
