//! Pipeline output validators.
//!
//! Validators form a closed family keyed by the pipeline's derivatives
//! directory name. Each one walks the BIDS source tree next to the
//! pipeline's output tree and emits findings for units whose outputs are
//! missing or malformed. No mutation, no network: re-running over an
//! unchanged tree yields the same finding set.

mod fmriprep;
mod freesurfer;
mod qsiprep;
mod qsirecon;

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use bidsrun_glob::glob_match;
use bidsrun_types::Finding;

/// The supported pipeline checkers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pipeline {
    FmriPrep,
    QsiPrep,
    FreeSurfer,
    QsiRecon,
}

impl Pipeline {
    /// Map a derivatives directory name to its checker.
    pub fn from_dir_name(name: &str) -> Option<Self> {
        match name {
            "fmriprep" => Some(Pipeline::FmriPrep),
            "qsiprep" => Some(Pipeline::QsiPrep),
            "freesurfer" => Some(Pipeline::FreeSurfer),
            _ if name.starts_with("qsirecon") => Some(Pipeline::QsiRecon),
            _ => None,
        }
    }

    /// Run this pipeline's checks. `tag` is the derivatives directory
    /// name and becomes the findings' pipeline field.
    pub fn check(&self, tag: &str, bids_dir: &Path, pipeline_dir: &Path) -> Vec<Finding> {
        match self {
            Pipeline::FmriPrep => fmriprep::check(tag, bids_dir, pipeline_dir),
            Pipeline::QsiPrep => qsiprep::check(tag, bids_dir, pipeline_dir),
            Pipeline::FreeSurfer => freesurfer::check(tag, bids_dir, pipeline_dir),
            Pipeline::QsiRecon => qsirecon::check(tag, bids_dir, pipeline_dir),
        }
    }
}

/// Discover pipeline output directories under the output root.
pub fn discover_pipelines(output_root: &Path) -> Vec<(String, Pipeline)> {
    let mut found = Vec::new();
    let Ok(entries) = fs::read_dir(output_root) else {
        return found;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy().into_owned();
        if name.starts_with('.') || !entry.path().is_dir() {
            continue;
        }
        if let Some(pipeline) = Pipeline::from_dir_name(&name) {
            found.push((name, pipeline));
        }
    }
    found.sort_by(|a, b| a.0.cmp(&b.0));
    found
}

/// Validate every discovered pipeline (or just `filter`).
///
/// Returns the sorted findings plus the list of pipeline tags checked.
pub fn validate_all(
    bids_dir: &Path,
    output_root: &Path,
    filter: Option<&str>,
) -> (Vec<Finding>, Vec<String>) {
    let mut discovered = discover_pipelines(output_root);
    if let Some(name) = filter {
        discovered.retain(|(tag, _)| tag == name);
        if discovered.is_empty() {
            warn!(pipeline = name, "no such pipeline directory under the output root");
        }
    }

    let mut findings = Vec::new();
    let mut checked = Vec::new();
    for (tag, pipeline) in discovered {
        info!(pipeline = %tag, "validating pipeline outputs");
        let pipeline_dir = output_root.join(&tag);
        findings.extend(pipeline.check(&tag, bids_dir, &pipeline_dir));
        checked.push(tag);
    }
    findings.sort_by_key(|f| f.sort_key());
    (findings, checked)
}

// ---------------------------------------------------------------------------
// Shared tree helpers for the checkers.

/// Sorted `sub-*` directories of the BIDS source.
pub(crate) fn subject_dirs(bids_dir: &Path) -> Vec<PathBuf> {
    sorted_dirs(bids_dir, "sub-*")
}

/// Session directories of one subject, or the subject directory itself
/// for single-session datasets.
pub(crate) fn session_dirs(subject_dir: &Path) -> Vec<PathBuf> {
    let sessions = sorted_dirs(subject_dir, "ses-*");
    if sessions.is_empty() {
        vec![subject_dir.to_path_buf()]
    } else {
        sessions
    }
}

pub(crate) fn sorted_dirs(dir: &Path, pattern: &str) -> Vec<PathBuf> {
    let mut out = list_matching(dir, pattern);
    out.retain(|p| p.is_dir());
    out
}

/// Direct children of `dir` whose names match `pattern`, sorted.
pub(crate) fn list_matching(dir: &Path, pattern: &str) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let Ok(entries) = fs::read_dir(dir) else {
        return out;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') {
            continue;
        }
        if glob_match(pattern, &name) {
            out.push(entry.path());
        }
    }
    out.sort();
    out
}

/// File name of a path as an owned string.
pub(crate) fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Strip everything from the given suffix marker on, and any `.nii`
/// remnant: `sub-01_task-rest_bold.nii.gz` → `sub-01_task-rest`.
pub(crate) fn input_prefix(name: &str, marker: &str) -> String {
    let base = name.split(marker).next().unwrap_or(name);
    base.trim_end_matches(".nii").to_string()
}
