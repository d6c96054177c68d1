use crate::mover::{DryRunMover, FsMover, GitMover, Mover};
use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = ".curate.yaml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VcsMode {
    Git,
    Filesystem,
}

impl VcsMode {
    pub fn as_str(self) -> &'static str {
        match self {
            VcsMode::Git => "git",
            VcsMode::Filesystem => "filesystem",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CurateConfig {
    /// Forces one mover for every command; unset keeps each command's default.
    pub vcs: Option<VcsMode>,
    pub git_command: String,
    pub dry_run: bool,
    /// Working directory for version-control commands; defaults to the caller's.
    pub repo_root: Option<PathBuf>,
}

impl Default for CurateConfig {
    fn default() -> Self {
        Self {
            vcs: None,
            git_command: "git".to_string(),
            dry_run: false,
            repo_root: None,
        }
    }
}

impl CurateConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read config {}: {}", path.display(), e))?;
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&data)
            .map_err(|e| anyhow!("invalid config {}: {}", path.display(), e))
    }

    /// Explicit path if given, else `.curate.yaml` in `cwd` when present, else defaults.
    pub fn resolve(explicit: Option<&Path>, cwd: &Path) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        let fallback = cwd.join(DEFAULT_CONFIG_FILE);
        if fallback.is_file() {
            return Self::load(&fallback);
        }
        Ok(Self::default())
    }

    pub fn mover(&self, command_default: VcsMode, dry_run: bool) -> Box<dyn Mover> {
        if dry_run {
            return Box::new(DryRunMover::new());
        }
        match self.vcs.unwrap_or(command_default) {
            VcsMode::Git => {
                let mut git = GitMover::new(self.git_command.clone());
                if let Some(root) = &self.repo_root {
                    git = git.in_dir(root.clone());
                }
                Box::new(git)
            }
            VcsMode::Filesystem => Box::new(FsMover),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let dir = crate::scratch_dir("config");
        let path = dir.join("c.yaml");
        fs::write(&path, "vcs: filesystem\n").expect("write");
        let cfg = CurateConfig::load(&path).expect("load");
        assert_eq!(cfg.vcs, Some(VcsMode::Filesystem));
        assert_eq!(cfg.git_command, "git");
        assert!(!cfg.dry_run);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn resolve_prefers_explicit_then_cwd_file() {
        let dir = crate::scratch_dir("config_resolve");
        assert_eq!(CurateConfig::resolve(None, &dir).expect("defaults").vcs, None);
        fs::write(dir.join(DEFAULT_CONFIG_FILE), "dry_run: true\n").expect("write");
        assert!(CurateConfig::resolve(None, &dir).expect("cwd file").dry_run);
        let other = dir.join("other.yaml");
        fs::write(&other, "git_command: /usr/bin/git\n").expect("write");
        let cfg = CurateConfig::resolve(Some(&other), &dir).expect("explicit");
        assert_eq!(cfg.git_command, "/usr/bin/git");
        assert!(!cfg.dry_run);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn unknown_vcs_mode_is_rejected() {
        let dir = crate::scratch_dir("config_bad");
        let path = dir.join("c.yaml");
        fs::write(&path, "vcs: svn\n").expect("write");
        assert!(CurateConfig::load(&path).is_err());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn dry_run_mover_wins_over_vcs_mode() {
        let cfg = CurateConfig::default();
        assert!(cfg.mover(VcsMode::Git, true).is_dry_run());
        assert!(!cfg.mover(VcsMode::Filesystem, false).is_dry_run());
    }
}
