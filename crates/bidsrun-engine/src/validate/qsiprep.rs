//! Diffusion preprocessing checks.
//!
//! Subjects with diffusion data need a subject-level output directory and
//! an HTML report, plus one `desc-preproc_dwi` file per input DWI file in
//! the matching session's dwi subdirectory.

use std::path::Path;

use bidsrun_types::{Finding, FindingReason};

use super::{file_name, input_prefix, list_matching, session_dirs, subject_dirs};

pub(crate) fn check(tag: &str, bids_dir: &Path, pipeline_dir: &Path) -> Vec<Finding> {
    let mut findings = Vec::new();

    for subject_dir in subject_dirs(bids_dir) {
        let subject = file_name(&subject_dir);

        let sessions = session_dirs(&subject_dir);
        let has_dwi = sessions
            .iter()
            .any(|sess| !list_matching(&sess.join("dwi"), "*_dwi.nii*").is_empty());
        if !has_dwi {
            continue;
        }

        let out_subject = pipeline_dir.join(&subject);
        if !out_subject.is_dir() {
            findings.push(Finding::new(
                tag,
                &subject,
                FindingReason::MissingSubjectDir,
                format!("expected {}", out_subject.display()),
            ));
            continue;
        }

        let report = pipeline_dir.join(format!("{subject}.html"));
        if !report.is_file() {
            findings.push(Finding::new(
                tag,
                &subject,
                FindingReason::MissingReport,
                format!("expected {}", report.display()),
            ));
        }

        for sess_dir in &sessions {
            let dwi_dir = sess_dir.join("dwi");
            let inputs = list_matching(&dwi_dir, "*_dwi.nii*");
            if inputs.is_empty() {
                continue;
            }

            let sess_name = file_name(sess_dir);
            let out_dwi = if sess_name.starts_with("ses-") {
                out_subject.join(&sess_name).join("dwi")
            } else {
                out_subject.join("dwi")
            };

            for input in inputs {
                let prefix = input_prefix(&file_name(&input), "_dwi");
                let pattern = format!("{prefix}*desc-preproc_dwi.nii*");
                if !out_dwi.is_dir() || list_matching(&out_dwi, &pattern).is_empty() {
                    findings.push(Finding::new(
                        tag,
                        &subject,
                        FindingReason::MissingPreprocessed,
                        format!(
                            "no preprocessed DWI for {} (expected {}/{pattern})",
                            file_name(&input),
                            out_dwi.display()
                        ),
                    ));
                }
            }
        }
    }

    findings
}
