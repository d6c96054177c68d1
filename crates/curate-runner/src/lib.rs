pub mod asl;
pub mod dataset;
pub mod editors;
pub mod entities;
pub mod events;
pub mod group_rename;
pub mod multirun;
pub mod phenotype;
pub mod qc;

use std::fmt;
use std::path::PathBuf;

/// One dataset change that was applied, or would be under dry-run.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Rename { src: PathBuf, dst: PathBuf },
    Remove { path: PathBuf },
    Update { path: PathBuf, details: Vec<String> },
    Write { path: PathBuf },
    Copy { src: PathBuf, dst: PathBuf },
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Rename { .. } => "rename",
            Action::Remove { .. } => "remove",
            Action::Update { .. } => "update",
            Action::Write { .. } => "write",
            Action::Copy { .. } => "copy",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Rename { src, dst } => {
                write!(f, "RENAME: {} -> {}", src.display(), dst.display())
            }
            Action::Remove { path } => write!(f, "REMOVE: {}", path.display()),
            Action::Update { path, details } => {
                write!(f, "UPDATE: {}", path.display())?;
                for d in details {
                    write!(f, "\n  {}", d)?;
                }
                Ok(())
            }
            Action::Write { path } => write!(f, "WRITE: {}", path.display()),
            Action::Copy { src, dst } => {
                write!(f, "COPY: {} -> {}", src.display(), dst.display())
            }
        }
    }
}

/// An item left alone, with the reason.
#[derive(Debug, Clone, PartialEq)]
pub struct Skipped {
    pub path: PathBuf,
    pub reason: String,
}

impl Skipped {
    pub fn new(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Outcome of a batch operation. Per-item failures land in `errors` and never
/// stop the batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationReport {
    pub dry_run: bool,
    pub actions: Vec<Action>,
    pub skipped: Vec<Skipped>,
    pub errors: Vec<Skipped>,
}

impl OperationReport {
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            ..Self::default()
        }
    }

    pub fn skip(&mut self, path: impl Into<PathBuf>, reason: impl Into<String>) {
        let s = Skipped::new(path, reason);
        tracing::warn!(path = %s.path.display(), reason = %s.reason, "skipped");
        self.skipped.push(s);
    }

    pub fn fail(&mut self, path: impl Into<PathBuf>, err: impl fmt::Display) {
        let s = Skipped::new(path, err.to_string());
        tracing::warn!(path = %s.path.display(), error = %s.reason, "item failed");
        self.errors.push(s);
    }

    pub fn record(&mut self, action: Action) {
        tracing::info!(dry_run = self.dry_run, "{}", action);
        self.actions.push(action);
    }

    pub fn count(&self, kind: &str) -> usize {
        self.actions.iter().filter(|a| a.kind() == kind).count()
    }
}
