//! Completion oracle — "is this unit already done?"
//!
//! Policy is a layered cascade; the first layer that answers yes wins:
//! 1. success marker for the unit
//! 2. configured output pattern (`{subject}`/`{session}` substituted)
//! 3. generic pipeline locations most BIDS apps produce
//! 4. subject directory containing at least one regular file
//!
//! Probing is depth-bounded and never raises: an unreadable output tree is
//! logged and conservatively treated as not-done.

use std::path::{Path, PathBuf};

use tracing::debug;

use bidsrun_glob::{dir_contains_file, find_matches, DEFAULT_PROBE_DEPTH};
use bidsrun_types::Unit;

use crate::config::OutputCheck;
use crate::markers;

/// Oracle verdict for one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Done,
    NotDone,
    /// Force flag set: dispatch regardless of what the layers say.
    ForceRerun,
}

/// Completion oracle over one output root.
#[derive(Debug, Clone)]
pub struct Oracle {
    output_root: PathBuf,
    check: Option<OutputCheck>,
}

impl Oracle {
    pub fn new(output_root: &Path, check: Option<OutputCheck>) -> Self {
        Self {
            output_root: output_root.to_path_buf(),
            check,
        }
    }

    /// Full cascade, marker layer included.
    pub fn verdict(&self, unit: &Unit, force: bool) -> Verdict {
        if force {
            return Verdict::ForceRerun;
        }
        if markers::marker_exists(&self.output_root, unit) {
            debug!(unit = %unit, "success marker present");
            return Verdict::Done;
        }
        if self.outputs_exist(unit) {
            Verdict::Done
        } else {
            Verdict::NotDone
        }
    }

    /// Layers 2–4 only — used by the dispatcher after a zero exit to
    /// confirm the container actually produced outputs. The marker layer
    /// is deliberately excluded: the marker is what gets written next.
    pub fn outputs_exist(&self, unit: &Unit) -> bool {
        self.pattern_matches(unit) || self.generic_outputs(unit) || self.subject_dir_non_empty(unit)
    }

    /// Layer 2: configured glob template.
    fn pattern_matches(&self, unit: &Unit) -> bool {
        let Some(check) = &self.check else {
            return false;
        };
        let mut pattern = check.pattern.replace("{subject}", &unit.subject);
        if let Some(session) = &unit.session {
            pattern = pattern.replace("{session}", session);
        }
        let root = if check.directory.is_empty() {
            self.output_root.clone()
        } else {
            self.output_root.join(&check.directory)
        };
        let hits = find_matches(&root, &pattern, DEFAULT_PROBE_DEPTH);
        if !hits.is_empty() {
            debug!(unit = %unit, pattern = %pattern, hit = %hits[0].display(), "output pattern matched");
            return true;
        }
        false
    }

    /// Layer 3: conventional per-pipeline locations.
    fn generic_outputs(&self, unit: &Unit) -> bool {
        let subject = unit.bids_subject();
        let patterns = [
            format!("derivatives/*/{subject}"),
            format!("{subject}/anat/{subject}_*"),
            format!("{subject}/func/{subject}_*"),
            format!("{subject}/dwi/{subject}_*"),
            format!("{subject}.html"),
        ];
        patterns
            .iter()
            .any(|p| !find_matches(&self.output_root, p, DEFAULT_PROBE_DEPTH).is_empty())
    }

    /// Layer 4: subject directory with at least one regular file.
    fn subject_dir_non_empty(&self, unit: &Unit) -> bool {
        let dir = self.output_root.join(unit.bids_subject());
        dir.is_dir() && dir_contains_file(&dir, DEFAULT_PROBE_DEPTH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use tempfile::TempDir;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        File::create(path).unwrap();
    }

    #[test]
    fn fresh_tree_is_not_done() {
        let tmp = TempDir::new().unwrap();
        let oracle = Oracle::new(tmp.path(), None);
        assert_eq!(oracle.verdict(&Unit::subject("001"), false), Verdict::NotDone);
    }

    #[test]
    fn force_wins_over_everything() {
        let tmp = TempDir::new().unwrap();
        let unit = Unit::subject("001");
        markers::write_marker(tmp.path(), &unit, "test").unwrap();
        let oracle = Oracle::new(tmp.path(), None);
        assert_eq!(oracle.verdict(&unit, true), Verdict::ForceRerun);
    }

    #[test]
    fn marker_layer_answers_first() {
        let tmp = TempDir::new().unwrap();
        let unit = Unit::subject("001");
        markers::write_marker(tmp.path(), &unit, "test").unwrap();
        let oracle = Oracle::new(tmp.path(), None);
        assert_eq!(oracle.verdict(&unit, false), Verdict::Done);
        // but the post-run check ignores the marker
        assert!(!oracle.outputs_exist(&unit));
    }

    #[test]
    fn configured_pattern_substitutes_ids() {
        let tmp = TempDir::new().unwrap();
        touch(&tmp.path().join("sub-001.html"));
        let oracle = Oracle::new(
            tmp.path(),
            Some(OutputCheck {
                pattern: "sub-{subject}.html".into(),
                directory: String::new(),
            }),
        );
        assert_eq!(oracle.verdict(&Unit::subject("001"), false), Verdict::Done);
        assert_eq!(oracle.verdict(&Unit::subject("002"), false), Verdict::NotDone);
    }

    #[test]
    fn session_pattern_needs_the_session() {
        let tmp = TempDir::new().unwrap();
        touch(&tmp.path().join("fmriprep/sub-01_ses-02_report.html"));
        let oracle = Oracle::new(
            tmp.path(),
            Some(OutputCheck {
                pattern: "sub-{subject}_ses-{session}_report.html".into(),
                directory: "fmriprep".into(),
            }),
        );
        assert!(oracle.outputs_exist(&Unit::session("01", "02")));
        assert!(!oracle.outputs_exist(&Unit::session("01", "01")));
    }

    #[test]
    fn generic_html_report_counts() {
        let tmp = TempDir::new().unwrap();
        touch(&tmp.path().join("sub-007.html"));
        let oracle = Oracle::new(tmp.path(), None);
        assert!(oracle.outputs_exist(&Unit::subject("007")));
    }

    #[test]
    fn non_empty_subject_dir_counts() {
        let tmp = TempDir::new().unwrap();
        touch(&tmp.path().join("sub-003/figures/plot.svg"));
        let oracle = Oracle::new(tmp.path(), None);
        assert_eq!(oracle.verdict(&Unit::subject("003"), false), Verdict::Done);
    }

    #[test]
    fn empty_subject_dir_does_not_count() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("sub-004")).unwrap();
        let oracle = Oracle::new(tmp.path(), None);
        assert_eq!(oracle.verdict(&Unit::subject("004"), false), Verdict::NotDone);
    }
}
