//! Reprocess-feedback engine — validator reports back into plans.
//!
//! Converts a report (ours or an external tool's) into the subject list
//! for a forced re-run, and serializes fresh reports to the reports
//! directory. The orchestrator decides whether to loop; this module never
//! does.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use bidsrun_types::{missing_subjects_from_value, Finding, Report, ReportError};

/// Errors while ingesting a report. Planning-fatal (exit 2).
#[derive(Debug, Error)]
pub enum ReprocessError {
    #[error("cannot read report {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("report {path} is not valid JSON: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("report {path}: {source}")]
    Shape {
        path: PathBuf,
        #[source]
        source: ReportError,
    },
}

/// Read a report file and extract the subjects to re-run, optionally
/// restricted to one pipeline's findings.
pub fn subjects_from_report_file(
    path: &Path,
    pipeline: Option<&str>,
) -> Result<Vec<String>, ReprocessError> {
    let text = fs::read_to_string(path).map_err(|source| ReprocessError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    let value: Value =
        serde_json::from_str(&text).map_err(|source| ReprocessError::Malformed {
            path: path.to_path_buf(),
            source,
        })?;
    let subjects =
        missing_subjects_from_value(&value, pipeline).map_err(|source| ReprocessError::Shape {
            path: path.to_path_buf(),
            source,
        })?;
    info!(
        report = %path.display(),
        subjects = subjects.len(),
        "loaded subjects from report"
    );
    Ok(subjects)
}

/// Subjects to re-run from an in-memory finding set (first-occurrence
/// order, optionally one pipeline only).
pub fn subjects_from_findings(findings: &[Finding], pipeline: Option<&str>) -> Vec<String> {
    let mut subjects = Vec::new();
    for finding in findings {
        if let Some(name) = pipeline {
            if finding.pipeline != name {
                continue;
            }
        }
        if !subjects.contains(&finding.subject) {
            subjects.push(finding.subject.clone());
        }
    }
    subjects
}

/// Serialize a report under the reports directory; returns its path.
pub fn write_report(report: &Report, reports_dir: &Path) -> std::io::Result<PathBuf> {
    fs::create_dir_all(reports_dir)?;
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let name = match &report.metadata.pipeline_filter {
        Some(pipeline) => format!("report_{pipeline}_{stamp}.json"),
        None => format!("report_{stamp}.json"),
    };
    let path = reports_dir.join(name);
    let body = serde_json::to_string_pretty(report).map_err(std::io::Error::other)?;
    fs::write(&path, body)?;
    info!(report = %path.display(), "validation report written");
    Ok(path)
}
