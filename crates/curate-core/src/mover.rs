//! File moves and deletions, either through version control or the plain
//! filesystem. Operations that rename dataset files take a `&dyn Mover`.

use anyhow::{anyhow, Result};
use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;

pub trait Mover {
    fn rename(&self, src: &Path, dst: &Path) -> Result<()>;
    fn remove(&self, path: &Path) -> Result<()>;
    /// Records a content change with version control; a no-op elsewhere.
    fn stage(&self, path: &Path) -> Result<()>;
    fn is_dry_run(&self) -> bool {
        false
    }
}

/// Runs `git mv`, `git rm` and `git add` so history follows the files.
#[derive(Debug, Clone)]
pub struct GitMover {
    pub program: String,
    pub work_dir: Option<PathBuf>,
}

impl GitMover {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            work_dir: None,
        }
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    fn run(&self, args: &[&str], paths: &[&Path]) -> Result<()> {
        let mut cmd = Command::new(&self.program);
        cmd.args(args);
        for p in paths {
            cmd.arg(p);
        }
        if let Some(dir) = &self.work_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        debug!(program = %self.program, ?args, ?paths, "running version control command");
        let output = cmd
            .output()
            .map_err(|e| anyhow!("failed to spawn {}: {}", self.program, e))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr_tail = String::from_utf8_lossy(&output.stderr)
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("no output")
            .to_string();
        Err(anyhow!(
            "{} {} failed (exit {}): {}",
            self.program,
            args.join(" "),
            output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string()),
            stderr_tail
        ))
    }
}

impl Default for GitMover {
    fn default() -> Self {
        Self::new("git")
    }
}

impl Mover for GitMover {
    fn rename(&self, src: &Path, dst: &Path) -> Result<()> {
        self.run(&["mv"], &[src, dst])
    }

    fn remove(&self, path: &Path) -> Result<()> {
        self.run(&["rm"], &[path])
    }

    fn stage(&self, path: &Path) -> Result<()> {
        self.run(&["add"], &[path])
    }
}

/// Plain filesystem moves for datasets outside version control.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsMover;

impl Mover for FsMover {
    fn rename(&self, src: &Path, dst: &Path) -> Result<()> {
        if dst.exists() {
            return Err(anyhow!(
                "rename {} -> {}: destination already exists",
                src.display(),
                dst.display()
            ));
        }
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(src, dst)
            .map_err(|e| anyhow!("rename {} -> {}: {}", src.display(), dst.display(), e))
    }

    fn remove(&self, path: &Path) -> Result<()> {
        fs::remove_file(path).map_err(|e| anyhow!("remove {}: {}", path.display(), e))
    }

    fn stage(&self, _path: &Path) -> Result<()> {
        Ok(())
    }
}

/// Records what would happen without touching the dataset.
#[derive(Debug, Default)]
pub struct DryRunMover {
    planned: RefCell<Vec<String>>,
}

impl DryRunMover {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn planned(&self) -> Vec<String> {
        self.planned.borrow().clone()
    }
}

impl Mover for DryRunMover {
    fn rename(&self, src: &Path, dst: &Path) -> Result<()> {
        self.planned
            .borrow_mut()
            .push(format!("mv {} {}", src.display(), dst.display()));
        Ok(())
    }

    fn remove(&self, path: &Path) -> Result<()> {
        self.planned
            .borrow_mut()
            .push(format!("rm {}", path.display()));
        Ok(())
    }

    fn stage(&self, path: &Path) -> Result<()> {
        self.planned
            .borrow_mut()
            .push(format!("add {}", path.display()));
        Ok(())
    }

    fn is_dry_run(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fs_mover_renames_and_removes() {
        let dir = crate::scratch_dir("fs_mover");
        let src = dir.join("a.json");
        let dst = dir.join("sub").join("b.json");
        fs::write(&src, "{}").expect("write");
        FsMover.rename(&src, &dst).expect("rename");
        assert!(!src.exists() && dst.exists());
        FsMover.remove(&dst).expect("remove");
        assert!(!dst.exists());
        assert!(FsMover.remove(&dst).is_err());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn fs_mover_refuses_to_overwrite() {
        let dir = crate::scratch_dir("fs_mover_exists");
        let src = dir.join("a.json");
        let dst = dir.join("b.json");
        fs::write(&src, "{\"new\":1}").expect("write src");
        fs::write(&dst, "{\"kept\":1}").expect("write dst");
        let err = FsMover.rename(&src, &dst).expect_err("existing destination");
        assert!(err.to_string().contains("already exists"), "{}", err);
        assert_eq!(fs::read_to_string(&dst).expect("dst"), "{\"kept\":1}");
        assert!(src.exists());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn dry_run_mover_only_records() {
        let dir = crate::scratch_dir("dry_mover");
        let src = dir.join("a.json");
        fs::write(&src, "{}").expect("write");
        let mover = DryRunMover::new();
        mover.rename(&src, &dir.join("b.json")).expect("rename");
        mover.remove(&src).expect("remove");
        assert!(src.exists());
        let planned = mover.planned();
        assert_eq!(planned.len(), 2);
        assert!(planned[0].starts_with("mv "));
        assert!(planned[1].starts_with("rm "));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn git_mover_reports_spawn_failure() {
        let mover = GitMover::new("curate-no-such-binary");
        let err = mover
            .rename(Path::new("a"), Path::new("b"))
            .expect_err("missing binary");
        assert!(err.to_string().contains("failed to spawn"), "{}", err);
    }
}
