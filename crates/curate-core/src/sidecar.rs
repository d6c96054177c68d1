use crate::atomic_write_bytes;
use anyhow::{anyhow, Result};
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use serde_json::Value;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Output layout for rewritten JSON sidecars. Keys are always sorted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JsonStyle {
    pub indent: usize,
    pub trailing_newline: bool,
}

impl JsonStyle {
    pub const INDENT_2: JsonStyle = JsonStyle {
        indent: 2,
        trailing_newline: false,
    };
    pub const INDENT_4: JsonStyle = JsonStyle {
        indent: 4,
        trailing_newline: false,
    };
    pub const INDENT_4_NEWLINE: JsonStyle = JsonStyle {
        indent: 4,
        trailing_newline: true,
    };
}

pub fn read_json(path: &Path) -> Result<Value> {
    let data = fs::read_to_string(path)?;
    serde_json::from_str(&data).map_err(|e| anyhow!("invalid JSON in {}: {}", path.display(), e))
}

/// Reads a sidecar that must be a JSON object.
pub fn read_sidecar(path: &Path) -> Result<serde_json::Map<String, Value>> {
    match read_json(path)? {
        Value::Object(map) => Ok(map),
        other => Err(anyhow!(
            "{} does not hold a JSON object (found {})",
            path.display(),
            value_kind(&other)
        )),
    }
}

pub fn to_json_bytes(value: &Value, style: JsonStyle) -> Result<Vec<u8>> {
    let indent = " ".repeat(style.indent);
    let mut buf = Vec::new();
    let formatter = PrettyFormatter::with_indent(indent.as_bytes());
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value.serialize(&mut ser)?;
    if style.trailing_newline {
        buf.push(b'\n');
    }
    Ok(buf)
}

pub fn write_json(path: &Path, value: &Value, style: JsonStyle) -> Result<()> {
    let bytes = to_json_bytes(value, style)?;
    atomic_write_bytes(path, &bytes)
}

pub fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

/// `IntendedFor` may be a single string or a list; both become a list.
pub fn intended_for_list(value: Option<&Value>) -> Vec<String> {
    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.iter().map(value_to_plain_string).collect(),
        Some(other) => vec![value_to_plain_string(other)],
    }
}

/// String content without JSON quoting.
pub fn value_to_plain_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn unique_preserve_order<I: IntoIterator<Item = String>>(items: I) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .collect()
}

/// Sidecar JSON path for an image: same stem, `.json` extension.
pub fn sidecar_for(image: &Path) -> PathBuf {
    let name = crate::file_name_str(image);
    let (stem, _) = crate::bids::split_name_suffix(name);
    image.with_file_name(format!("{}.json", stem))
}

/// Numeric value of a JSON field, accepting numeric strings.
pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
