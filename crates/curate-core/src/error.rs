use std::path::PathBuf;
use thiserror::Error;

/// Configuration problems that stop an operation before it touches anything.
#[derive(Debug, Error)]
pub enum CurateError {
    #[error("'{}' is not a directory", .0.display())]
    NotADirectory(PathBuf),
    #[error("{}: missing required column(s): {}", .path.display(), .columns.join(", "))]
    MissingColumns { path: PathBuf, columns: Vec<String> },
    #[error("required file not found: {}", .0.display())]
    MissingFile(PathBuf),
    #[error("invalid scoring template {}: {reason}", .path.display())]
    InvalidTemplate { path: PathBuf, reason: String },
}
