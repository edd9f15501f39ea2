//! Report round-trip and validate-only orchestrator flow.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use serde_json::json;
use tempfile::TempDir;

use bidsrun_engine::validate;
use bidsrun_engine::{Orchestrator, RunOptions};
use bidsrun_types::{
    missing_subjects_from_value, Finding, FindingReason, Report, ReportMetadata,
};

fn touch(path: &Path) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    File::create(path).unwrap();
}

fn metadata() -> ReportMetadata {
    ReportMetadata {
        generated_by: "bidsrun test".into(),
        timestamp: "2025-06-01T00:00:00Z".into(),
        command: "test".into(),
        pipeline_filter: None,
        bids_dir: "/bids".into(),
        output_dir: "/out".into(),
    }
}

#[test]
fn report_to_plan_to_report_preserves_missing_units() {
    let findings = vec![
        Finding::new("fmriprep", "002", FindingReason::MissingPreprocessed, "x"),
        Finding::new("qsiprep", "005", FindingReason::MissingReport, "y"),
    ];
    let checked = vec!["fmriprep".to_string(), "qsiprep".to_string()];
    let report = Report::from_findings(&findings, &checked, metadata());

    // Serialize, re-ingest, and rebuild an equivalent report.
    let value = serde_json::to_value(&report).unwrap();
    let subjects = missing_subjects_from_value(&value, None).unwrap();
    assert_eq!(subjects, vec!["002", "005"]);

    let refound: Vec<Finding> = subjects
        .iter()
        .map(|s| Finding::new("fmriprep", s.as_str(), FindingReason::MissingPreprocessed, "x"))
        .collect();
    let second = Report::from_findings(&refound, &["fmriprep".to_string()], metadata());
    assert_eq!(
        second.summary.all_missing_subjects,
        vec!["sub-002", "sub-005"]
    );
}

#[test]
fn validator_sweep_is_stable_across_pipelines() {
    let tmp = TempDir::new().unwrap();
    let bids = tmp.path().join("bids");
    let out = tmp.path().join("derivatives");

    // One functional subject with outputs, one without; a diffusion
    // subject with no preprocessed file.
    touch(&bids.join("sub-01/func/sub-01_bold.nii.gz"));
    touch(&bids.join("sub-02/func/sub-02_bold.nii.gz"));
    touch(&bids.join("sub-03/dwi/sub-03_dwi.nii.gz"));
    touch(&out.join("fmriprep/sub-01/func/sub-01_desc-preproc_bold.nii.gz"));
    fs::create_dir_all(out.join("fmriprep/sub-02/func")).unwrap();
    touch(&out.join("qsiprep/sub-03.html"));
    fs::create_dir_all(out.join("qsiprep/sub-03/dwi")).unwrap();

    let (first, checked) = validate::validate_all(&bids, &out, None);
    let (second, _) = validate::validate_all(&bids, &out, None);
    assert_eq!(first, second, "stable under re-evaluation");
    assert_eq!(checked, vec!["fmriprep", "qsiprep"]);

    let pipelines: Vec<&str> = first.iter().map(|f| f.pipeline.as_str()).collect();
    assert_eq!(pipelines, vec!["fmriprep", "qsiprep"]);
    assert_eq!(first[0].subject, "02");
    assert_eq!(first[1].subject, "03");

    // Pipeline filter narrows the sweep.
    let (only_qsiprep, checked) = validate::validate_all(&bids, &out, Some("qsiprep"));
    assert_eq!(checked, vec!["qsiprep"]);
    assert!(only_qsiprep.iter().all(|f| f.pipeline == "qsiprep"));
}

struct Fixture {
    tmp: TempDir,
    config_path: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        touch(&tmp.path().join("bids/sub-01/func/sub-01_bold.nii.gz"));
        File::create(tmp.path().join("app.sif")).unwrap();
        let config = json!({
            "common": {
                "bids_folder": tmp.path().join("bids").to_string_lossy(),
                "output_folder": tmp.path().join("out").to_string_lossy(),
                "tmp_folder": tmp.path().join("work").to_string_lossy(),
                "log_dir": tmp.path().join("logs").to_string_lossy(),
                "reports_dir": tmp.path().join("reports").to_string_lossy(),
                "container": tmp.path().join("app.sif").to_string_lossy(),
            },
            "app": {"analysis_level": "participant"}
        });
        let config_path = tmp.path().join("config.json");
        fs::write(&config_path, config.to_string()).unwrap();
        Self { tmp, config_path }
    }
}

#[tokio::test]
async fn validate_only_reports_missing_and_then_clean() {
    let fixture = Fixture::new();
    fs::create_dir_all(fixture.tmp.path().join("out/fmriprep/sub-01/func")).unwrap();

    let options = RunOptions {
        config_path: fixture.config_path.clone(),
        validate_only: true,
        reprocess_limit: 3,
        ..Default::default()
    };

    let summary = Orchestrator::new(options.clone()).run().await.unwrap();
    assert!(summary.verified);
    assert_eq!(summary.findings.len(), 1);
    assert_eq!(summary.exit_code(), 1);
    let report_path = summary.report_path.unwrap();
    assert!(report_path.is_file());
    let report: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&report_path).unwrap()).unwrap();
    assert_eq!(
        report["summary"]["all_missing_subjects"],
        json!(["sub-01"])
    );

    // Provide the missing output; the next pass is clean.
    touch(
        &fixture
            .tmp
            .path()
            .join("out/fmriprep/sub-01/func/sub-01_desc-preproc_bold.nii.gz"),
    );
    let summary = Orchestrator::new(options).run().await.unwrap();
    assert!(summary.findings.is_empty());
    assert_eq!(summary.exit_code(), 0);
}

#[tokio::test]
async fn from_report_plans_exactly_the_reported_subjects() {
    let fixture = Fixture::new();
    // Dataset needs the reported subjects on disk.
    for subject in ["sub-002", "sub-005"] {
        fs::create_dir_all(fixture.tmp.path().join("bids").join(subject)).unwrap();
    }
    let report_path = fixture.tmp.path().join("missing.json");
    fs::write(
        &report_path,
        json!({
            "missing_data_by_pipeline": {
                "fmriprep": {"subjects_with_missing_data": ["sub-002", "sub-005"]}
            }
        })
        .to_string(),
    )
    .unwrap();

    let options = RunOptions {
        config_path: fixture.config_path.clone(),
        from_report: Some(report_path),
        dry_run: true,
        reprocess_limit: 3,
        ..Default::default()
    };
    let summary = Orchestrator::new(options).run().await.unwrap();
    assert_eq!(summary.dry_run_commands.len(), 2);
    assert!(summary.dry_run_commands[0].contains("--participant-label 002"));
    assert!(summary.dry_run_commands[1].contains("--participant-label 005"));
}
