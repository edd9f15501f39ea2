//! Functional preprocessing checks.
//!
//! Every input BOLD file needs a `desc-preproc_bold` counterpart in the
//! pipeline's matching func directory. Surface outputs must come in
//! hemisphere pairs, and if any subject in the cohort produced surface
//! files, every subject must have them.

use std::collections::BTreeMap;
use std::path::Path;

use bidsrun_types::{Finding, FindingReason};

use super::{file_name, input_prefix, list_matching, session_dirs, subject_dirs};

pub(crate) fn check(tag: &str, bids_dir: &Path, pipeline_dir: &Path) -> Vec<Finding> {
    let mut findings = Vec::new();
    let mut has_surface: BTreeMap<String, bool> = BTreeMap::new();

    for subject_dir in subject_dirs(bids_dir) {
        let subject = file_name(&subject_dir);
        let mut surface_seen = false;

        for sess_dir in session_dirs(&subject_dir) {
            let func_dir = sess_dir.join("func");
            if !func_dir.is_dir() {
                continue;
            }

            // The pipeline mirrors the sub-*/ses-*/func layout.
            let sess_name = file_name(&sess_dir);
            let out_func = if sess_name.starts_with("ses-") {
                pipeline_dir.join(&subject).join(&sess_name).join("func")
            } else {
                pipeline_dir.join(&subject).join("func")
            };

            for bold in list_matching(&func_dir, "*_bold.nii*") {
                let prefix = input_prefix(&file_name(&bold), "_bold");
                let pattern = format!("{prefix}*desc-preproc_bold.nii*");
                if !out_func.is_dir() {
                    findings.push(Finding::new(
                        tag,
                        &subject,
                        FindingReason::MissingPreprocessed,
                        format!(
                            "func directory missing for {}: expected {}",
                            file_name(&bold),
                            out_func.display()
                        ),
                    ));
                    continue;
                }
                if list_matching(&out_func, &pattern).is_empty() {
                    findings.push(Finding::new(
                        tag,
                        &subject,
                        FindingReason::MissingPreprocessed,
                        format!(
                            "no preprocessed BOLD for {} (expected {}/{pattern})",
                            file_name(&bold),
                            out_func.display()
                        ),
                    ));
                }
            }

            // Surface outputs: hemisphere pairing.
            if out_func.is_dir() {
                for surface in list_matching(&out_func, "*_hemi-*_bold.func.gii") {
                    surface_seen = true;
                    let name = file_name(&surface);
                    let (this, other) = if name.contains("hemi-L") {
                        ("hemi-L", "hemi-R")
                    } else if name.contains("hemi-R") {
                        ("hemi-R", "hemi-L")
                    } else {
                        continue;
                    };
                    let paired = out_func.join(name.replace(this, other));
                    if !paired.is_file() {
                        findings.push(Finding::new(
                            tag,
                            &subject,
                            FindingReason::MissingHemispherePair,
                            format!("{name} has no {other} counterpart"),
                        ));
                    }
                }
            }
        }

        has_surface.insert(subject, surface_seen);
    }

    // Cross-cohort rule: surface outputs are all-or-nothing.
    if has_surface.values().any(|&v| v) {
        for (subject, seen) in &has_surface {
            if !seen {
                findings.push(Finding::new(
                    tag,
                    subject,
                    FindingReason::InconsistentSurfaceAcrossCohort,
                    "no surface outputs while other subjects have them",
                ));
            }
        }
    }

    findings
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

    fn setup() -> (TempDir, std::path::PathBuf, std::path::PathBuf) {
        let tmp = TempDir::new().unwrap();
        let bids = tmp.path().join("bids");
        let pipeline = tmp.path().join("derivatives/fmriprep");
        (tmp, bids, pipeline)
    }

    #[test]
    fn complete_outputs_yield_no_findings() {
        let (_tmp, bids, pipeline) = setup();
        touch(&bids.join("sub-01/func/sub-01_task-rest_bold.nii.gz"));
        touch(&pipeline.join("sub-01/func/sub-01_task-rest_space-T1w_desc-preproc_bold.nii.gz"));

        assert!(check("fmriprep", &bids, &pipeline).is_empty());
    }

    #[test]
    fn missing_preprocessed_bold_is_flagged() {
        let (_tmp, bids, pipeline) = setup();
        touch(&bids.join("sub-01/func/sub-01_task-rest_bold.nii.gz"));
        fs::create_dir_all(pipeline.join("sub-01/func")).unwrap();

        let findings = check("fmriprep", &bids, &pipeline);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].reason, FindingReason::MissingPreprocessed);
        assert_eq!(findings[0].subject, "01");
    }

    #[test]
    fn sessions_are_checked_independently() {
        let (_tmp, bids, pipeline) = setup();
        touch(&bids.join("sub-01/ses-1/func/sub-01_ses-1_bold.nii.gz"));
        touch(&bids.join("sub-01/ses-2/func/sub-01_ses-2_bold.nii.gz"));
        touch(&pipeline.join("sub-01/ses-1/func/sub-01_ses-1_desc-preproc_bold.nii.gz"));
        fs::create_dir_all(pipeline.join("sub-01/ses-2/func")).unwrap();

        let findings = check("fmriprep", &bids, &pipeline);
        assert_eq!(findings.len(), 1);
        assert!(findings[0].detail.contains("ses-2"));
    }

    #[test]
    fn hemisphere_pairs_must_both_exist() {
        let (_tmp, bids, pipeline) = setup();
        touch(&bids.join("sub-01/func/sub-01_bold.nii.gz"));
        touch(&pipeline.join("sub-01/func/sub-01_desc-preproc_bold.nii.gz"));
        touch(&pipeline.join("sub-01/func/sub-01_hemi-L_bold.func.gii"));

        let findings = check("fmriprep", &bids, &pipeline);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].reason, FindingReason::MissingHemispherePair);
        assert!(findings[0].detail.contains("hemi-R"));
    }

    #[test]
    fn surface_outputs_are_all_or_nothing_across_the_cohort() {
        let (_tmp, bids, pipeline) = setup();
        for subject in ["sub-01", "sub-02", "sub-03"] {
            touch(&bids.join(subject).join("func").join(format!("{subject}_bold.nii.gz")));
            touch(
                &pipeline
                    .join(subject)
                    .join("func")
                    .join(format!("{subject}_desc-preproc_bold.nii.gz")),
            );
        }
        for subject in ["sub-01", "sub-02"] {
            for hemi in ["hemi-L", "hemi-R"] {
                touch(
                    &pipeline
                        .join(subject)
                        .join("func")
                        .join(format!("{subject}_{hemi}_bold.func.gii")),
                );
            }
        }

        let findings = check("fmriprep", &bids, &pipeline);
        assert_eq!(findings.len(), 1);
        assert_eq!(
            findings[0].reason,
            FindingReason::InconsistentSurfaceAcrossCohort
        );
        assert_eq!(findings[0].subject, "03");
    }

    #[test]
    fn stability_under_reevaluation() {
        let (_tmp, bids, pipeline) = setup();
        touch(&bids.join("sub-01/func/sub-01_bold.nii.gz"));
        touch(&bids.join("sub-02/func/sub-02_bold.nii.gz"));
        fs::create_dir_all(pipeline.join("sub-01/func")).unwrap();

        let first = check("fmriprep", &bids, &pipeline);
        let second = check("fmriprep", &bids, &pipeline);
        assert_eq!(first, second);
    }
}
