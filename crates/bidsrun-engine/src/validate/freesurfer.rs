//! Structural reconstruction checks.
//!
//! A subject with N anatomical sessions owns 1 reconstruction folder when
//! N = 1 and `2N+1` folders when N ≥ 2 (N cross-sectional, one base
//! template, N longitudinal). Every folder carries the
//! `scripts/recon-all.done` sentinel. Longitudinal segmentation files
//! (`.long` in the name) belong in longitudinal folders and nowhere else.

use std::path::Path;

use bidsrun_types::{Finding, FindingReason};

use super::{file_name, list_matching, session_dirs, sorted_dirs, subject_dirs};

pub(crate) fn check(tag: &str, bids_dir: &Path, pipeline_dir: &Path) -> Vec<Finding> {
    let mut findings = Vec::new();

    for subject_dir in subject_dirs(bids_dir) {
        let subject = file_name(&subject_dir);

        let anat_sessions = session_dirs(&subject_dir)
            .iter()
            .filter(|sess| !list_matching(&sess.join("anat"), "*_T1w.nii*").is_empty())
            .count();
        if anat_sessions == 0 {
            continue;
        }

        let mut fs_dirs = sorted_dirs(pipeline_dir, &format!("{subject}*"));
        fs_dirs.retain(|d| {
            let name = file_name(d);
            !name.starts_with("fsaverage") && !name.starts_with("local")
        });

        if fs_dirs.is_empty() {
            findings.push(Finding::new(
                tag,
                &subject,
                FindingReason::MissingSubjectDir,
                format!(
                    "no reconstruction folders under {} ({anat_sessions} T1w session(s))",
                    pipeline_dir.display()
                ),
            ));
            continue;
        }

        let expected = if anat_sessions == 1 {
            1
        } else {
            2 * anat_sessions + 1
        };
        if fs_dirs.len() != expected {
            findings.push(Finding::new(
                tag,
                &subject,
                FindingReason::WrongFolderCount,
                format!("expected {expected}, got {}", fs_dirs.len()),
            ));
        }

        for fs_dir in &fs_dirs {
            let sentinel = fs_dir.join("scripts").join("recon-all.done");
            if !sentinel.is_file() {
                findings.push(Finding::new(
                    tag,
                    &subject,
                    FindingReason::MissingCompletionSentinel,
                    format!("{} lacks scripts/recon-all.done", file_name(fs_dir)),
                ));
            }
            check_segmentations(tag, &subject, fs_dir, &mut findings);
        }
    }

    findings
}

/// Hippocampal and amygdala segmentation placement rules.
fn check_segmentations(tag: &str, subject: &str, fs_dir: &Path, findings: &mut Vec<Finding>) {
    let mri_dir = fs_dir.join("mri");
    let name = file_name(fs_dir);
    let is_longitudinal = name.contains(".long");

    let hippo = list_matching(&mri_dir, "*hippoSfVolumes*.txt");
    let mut amyg = list_matching(&mri_dir, "*hippoAmygLabels*.txt");
    amyg.extend(list_matching(&mri_dir, "*amygNucVolumes*.txt"));

    let long_tagged = |files: &[std::path::PathBuf]| {
        files
            .iter()
            .filter(|f| file_name(f).contains(".long"))
            .count()
    };

    if is_longitudinal {
        if long_tagged(&hippo) == 0 {
            findings.push(Finding::new(
                tag,
                subject,
                FindingReason::MissingLongitudinalFile,
                format!("{name} lacks longitudinal hippocampal subfield volumes"),
            ));
        }
        if long_tagged(&amyg) == 0 {
            findings.push(Finding::new(
                tag,
                subject,
                FindingReason::MissingLongitudinalFile,
                format!("{name} lacks longitudinal amygdala volumes"),
            ));
        }
    } else if long_tagged(&hippo) + long_tagged(&amyg) > 0 {
        findings.push(Finding::new(
            tag,
            subject,
            FindingReason::LongitudinalFileInCrossSectional,
            format!("{name} contains .long-tagged segmentation files"),
        ));
    }
}
