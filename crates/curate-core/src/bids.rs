//! BIDS filename and path helpers.
//!
//! A BIDS filename is `key-value` entities joined by `_`, a suffix and an
//! extension, e.g. `sub-01_ses-1_task-rest_run-01_bold.nii.gz`.

use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

pub const NIFTI_EXTENSIONS: [&str; 2] = [".nii.gz", ".nii"];

/// Files that travel with an image when it is renamed.
pub const SIDECAR_EXTENSIONS: [&str; 5] = [".json", ".tsv", ".tsv.gz", ".bval", ".bvec"];

/// Splits a filename into stem and extension; multi-part NIfTI and gzip TSV
/// extensions are kept whole.
pub fn split_name_suffix(name: &str) -> (&str, &str) {
    for ext in [".nii.gz", ".nii", ".tsv.gz"] {
        if let Some(stem) = name.strip_suffix(ext) {
            return (stem, ext);
        }
    }
    match name.rfind('.') {
        Some(dot) => (&name[..dot], &name[dot..]),
        None => (name, ""),
    }
}

pub fn is_nifti(name: &str) -> bool {
    NIFTI_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
}

fn run_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"_run-\d+").expect("static regex"))
}

/// True when the name carries a `_run-<digits>` token.
pub fn has_run_token(name: &str) -> bool {
    run_token_re().is_match(name)
}

/// Removes every `_run-<digits>` token from a stem.
pub fn remove_run_token(stem: &str) -> String {
    run_token_re().replace_all(stem, "").into_owned()
}

/// Byte offset and text of the first `_run-<digits>` token.
pub fn find_run_token(stem: &str) -> Option<(usize, String)> {
    run_token_re()
        .find(stem)
        .map(|m| (m.start(), m.as_str().to_string()))
}

/// Puts a removed token back at its recorded offset.
pub fn insert_token(stem: &str, offset: usize, token: &str) -> String {
    let mut out = String::with_capacity(stem.len() + token.len());
    out.push_str(&stem[..offset]);
    out.push_str(token);
    out.push_str(&stem[offset..]);
    out
}

fn token_end(stem: &str, start: usize) -> usize {
    stem[start + 1..]
        .find('_')
        .map(|i| start + 1 + i)
        .unwrap_or(stem.len())
}

/// Moves the first `_rec-` token in front of the first `_run-` token when run
/// currently comes first. Text between the tokens stays where it was.
pub fn reorder_run_rec(stem: &str) -> Option<String> {
    let run_start = stem.find("_run-")?;
    let rec_start = stem.find("_rec-")?;
    if rec_start < run_start {
        return None;
    }
    let run_end = token_end(stem, run_start);
    let rec_end = token_end(stem, rec_start);
    if run_end > rec_start {
        return None;
    }
    Some(format!(
        "{}{}{}{}{}",
        &stem[..run_start],
        &stem[rec_start..rec_end],
        &stem[run_end..rec_start],
        &stem[run_start..run_end],
        &stem[rec_end..]
    ))
}

/// First `sub-*` and `ses-*` components found in a path.
pub fn subject_and_session(path: &Path) -> (Option<String>, Option<String>) {
    let mut subject = None;
    let mut session = None;
    for part in path.components() {
        let part = part.as_os_str().to_string_lossy();
        if subject.is_none() && part.starts_with("sub-") {
            subject = Some(part.to_string());
        } else if session.is_none() && part.starts_with("ses-") {
            session = Some(part.to_string());
        }
        if subject.is_some() && session.is_some() {
            break;
        }
    }
    (subject, session)
}

/// Parsed entity view of a BIDS filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BidsName {
    pub entities: Vec<(String, String)>,
    pub suffix: Option<String>,
    pub extension: String,
}

impl BidsName {
    pub fn parse(name: &str) -> Self {
        let (stem, extension) = split_name_suffix(name);
        let mut entities = Vec::new();
        let mut suffix = None;
        for part in stem.split('_').filter(|p| !p.is_empty()) {
            match part.split_once('-') {
                Some((key, value)) => entities.push((key.to_string(), value.to_string())),
                None => suffix = Some(part.to_string()),
            }
        }
        Self {
            entities,
            suffix,
            extension: extension.to_string(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entities
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn to_filename(&self) -> String {
        let mut parts: Vec<String> = self
            .entities
            .iter()
            .map(|(k, v)| format!("{}-{}", k, v))
            .collect();
        if let Some(suffix) = &self.suffix {
            parts.push(suffix.clone());
        }
        format!("{}{}", parts.join("_"), self.extension)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn split_name_suffix_keeps_compound_extensions() {
        assert_eq!(split_name_suffix("a_bold.nii.gz"), ("a_bold", ".nii.gz"));
        assert_eq!(split_name_suffix("a_bold.nii"), ("a_bold", ".nii"));
        assert_eq!(split_name_suffix("a_events.tsv.gz"), ("a_events", ".tsv.gz"));
        assert_eq!(split_name_suffix("a_bold.json"), ("a_bold", ".json"));
        assert_eq!(split_name_suffix("README"), ("README", ""));
    }

    #[test]
    fn run_token_removal_round_trips() {
        let stems = [
            "sub-01_task-rest_run-01_bold",
            "sub-01_run-1_task-rest_bold",
            "sub-01_ses-1_acq-mb_run-12_dir-AP_epi",
        ];
        for stem in stems {
            let (offset, token) = find_run_token(stem).expect("token present");
            let removed = remove_run_token(stem);
            assert!(!has_run_token(&removed), "{} still has a run token", removed);
            assert_eq!(insert_token(&removed, offset, &token), stem);
        }
    }

    #[test]
    fn run_token_requires_digits() {
        assert!(!has_run_token("sub-01_run-x_bold"));
        assert_eq!(remove_run_token("sub-01_run-x_bold"), "sub-01_run-x_bold");
    }

    #[test]
    fn reorder_run_rec_swaps_when_run_first() {
        assert_eq!(
            reorder_run_rec("sub-1_ses-1_run-01_rec-norm_T1w").as_deref(),
            Some("sub-1_ses-1_rec-norm_run-01_T1w")
        );
        assert_eq!(
            reorder_run_rec("sub-1_run-01_acq-x_rec-norm_T1w").as_deref(),
            Some("sub-1_rec-norm_acq-x_run-01_T1w")
        );
        assert_eq!(reorder_run_rec("sub-1_rec-norm_run-01_T1w"), None);
        assert_eq!(reorder_run_rec("sub-1_run-01_T1w"), None);
    }

    #[test]
    fn subject_and_session_reads_path_components() {
        let p = PathBuf::from("/data/bids/sub-01/ses-2/func/x.nii.gz");
        assert_eq!(
            subject_and_session(&p),
            (Some("sub-01".to_string()), Some("ses-2".to_string()))
        );
        let p = PathBuf::from("bids/sub-01/anat/x.nii.gz");
        assert_eq!(subject_and_session(&p), (Some("sub-01".to_string()), None));
    }

    #[test]
    fn bids_name_parses_entities_and_suffix() {
        let name = BidsName::parse("sub-01_ses-1_task-rest_motion.tsv");
        assert_eq!(name.get("sub"), Some("01"));
        assert_eq!(name.get("task"), Some("rest"));
        assert_eq!(name.suffix.as_deref(), Some("motion"));
        assert_eq!(name.extension, ".tsv");
        assert_eq!(name.to_filename(), "sub-01_ses-1_task-rest_motion.tsv");
    }
}
