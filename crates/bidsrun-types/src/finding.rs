//! Validator findings — one structured record per missing or malformed output.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Why a validator flagged a unit. Closed enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FindingReason {
    /// Pipeline-level subject directory does not exist.
    MissingSubjectDir,
    /// Subject-level HTML report is absent.
    MissingReport,
    /// An input file has no corresponding preprocessed output.
    MissingPreprocessed,
    /// A surface file exists for one hemisphere but not the other.
    MissingHemispherePair,
    /// Some subjects have surface outputs and this one does not.
    InconsistentSurfaceAcrossCohort,
    /// Reconstruction folder count does not match the session count.
    WrongFolderCount,
    /// A reconstruction folder lacks its completion sentinel.
    MissingCompletionSentinel,
    /// A longitudinal folder lacks its `.long`-tagged segmentation files.
    MissingLongitudinalFile,
    /// A cross-sectional folder contains `.long`-tagged files.
    LongitudinalFileInCrossSectional,
    /// A session's reconstruction directory has no data file.
    MissingReconOutput,
    /// An expected output directory exists but is empty.
    EmptyOutputDir,
}

impl FindingReason {
    /// Stable label used in reports and logs.
    pub fn label(&self) -> &'static str {
        match self {
            FindingReason::MissingSubjectDir => "missing_subject_dir",
            FindingReason::MissingReport => "missing_report",
            FindingReason::MissingPreprocessed => "missing_preprocessed",
            FindingReason::MissingHemispherePair => "missing_hemisphere_pair",
            FindingReason::InconsistentSurfaceAcrossCohort => {
                "inconsistent_surface_across_cohort"
            }
            FindingReason::WrongFolderCount => "wrong_folder_count",
            FindingReason::MissingCompletionSentinel => "missing_completion_sentinel",
            FindingReason::MissingLongitudinalFile => "missing_longitudinal_file",
            FindingReason::LongitudinalFileInCrossSectional => {
                "longitudinal_file_in_cross_sectional"
            }
            FindingReason::MissingReconOutput => "missing_recon_output",
            FindingReason::EmptyOutputDir => "empty_output_dir",
        }
    }
}

impl fmt::Display for FindingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// One missing-output finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    /// Pipeline tag, e.g. `fmriprep`.
    pub pipeline: String,
    /// Subject id without the `sub-` prefix.
    pub subject: String,
    /// Closed reason code.
    pub reason: FindingReason,
    /// Human-readable detail (paths, expectations).
    pub detail: String,
}

impl Finding {
    pub fn new(
        pipeline: impl Into<String>,
        subject: impl Into<String>,
        reason: FindingReason,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            pipeline: pipeline.into(),
            subject: crate::unit::normalize_subject(&subject.into()),
            reason,
            detail: detail.into(),
        }
    }

    /// Sort key making finding sets stable under re-evaluation.
    pub fn sort_key(&self) -> (String, String, FindingReason, String) {
        (
            self.pipeline.clone(),
            self.subject.clone(),
            self.reason,
            self.detail.clone(),
        )
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] sub-{} {}: {}",
            self.pipeline, self.subject, self.reason, self.detail
        )
    }
}
