//! Diffusion reconstruction checks.
//!
//! For every session with diffusion input data, the reconstruction
//! pipeline's `sub-*/[ses-*/]dwi/` directory must exist and contain at
//! least one reconstructed data file.

use std::path::Path;

use bidsrun_types::{Finding, FindingReason};

use super::{file_name, list_matching, session_dirs, subject_dirs};

pub(crate) fn check(tag: &str, bids_dir: &Path, pipeline_dir: &Path) -> Vec<Finding> {
    let mut findings = Vec::new();

    for subject_dir in subject_dirs(bids_dir) {
        let subject = file_name(&subject_dir);

        for sess_dir in session_dirs(&subject_dir) {
            if list_matching(&sess_dir.join("dwi"), "*_dwi.nii*").is_empty() {
                continue;
            }

            let sess_name = file_name(&sess_dir);
            let out_dwi = if sess_name.starts_with("ses-") {
                pipeline_dir.join(&subject).join(&sess_name).join("dwi")
            } else {
                pipeline_dir.join(&subject).join("dwi")
            };

            if !out_dwi.is_dir() {
                findings.push(Finding::new(
                    tag,
                    &subject,
                    FindingReason::MissingReconOutput,
                    format!("expected {}", out_dwi.display()),
                ));
            } else if list_matching(&out_dwi, "*").iter().all(|p| !p.is_file()) {
                findings.push(Finding::new(
                    tag,
                    &subject,
                    FindingReason::EmptyOutputDir,
                    format!("{} has no reconstructed data files", out_dwi.display()),
                ));
            }
        }
    }

    findings
}
