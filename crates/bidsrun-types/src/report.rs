//! Validator reports — serialization and re-ingest.
//!
//! The native report shape mirrors what the validator writes. For
//! reprocessing, three input shapes are accepted:
//!
//! 1. the native shape (`missing_data_by_pipeline` / `summary`),
//! 2. `{"pipelines": {"<name>": {"subjects": [...]}}}` from external tools,
//! 3. a bare `{"all_missing_subjects": [...]}` list.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::finding::Finding;
use crate::unit::normalize_subject;

/// Errors raised while ingesting a report for reprocessing.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("report is not a JSON object")]
    NotAnObject,
    #[error("report shape not recognized: expected missing_data_by_pipeline, pipelines, or all_missing_subjects")]
    UnknownShape,
    #[error("pipeline {0} not present in report")]
    UnknownPipeline(String),
}

/// Report metadata block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub generated_by: String,
    /// RFC 3339 generation timestamp.
    pub timestamp: String,
    pub command: String,
    #[serde(default)]
    pub pipeline_filter: Option<String>,
    pub bids_dir: String,
    pub output_dir: String,
}

/// Per-pipeline missing-output block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineMissing {
    /// Formatted finding lines.
    pub missing_items: Vec<String>,
    pub total_missing: usize,
    /// Subject ids rendered with the `sub-` prefix.
    pub subjects_with_missing_data: Vec<String>,
}

/// Summary block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total_pipelines_checked: usize,
    pub pipelines_with_missing_data: usize,
    /// Flattened, de-duplicated union of subject ids (with `sub-` prefix).
    pub all_missing_subjects: Vec<String>,
}

/// A serialized validator run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub metadata: ReportMetadata,
    pub missing_data_by_pipeline: BTreeMap<String, PipelineMissing>,
    pub summary: ReportSummary,
}

impl Report {
    /// Assemble a report from a sorted finding set.
    ///
    /// `checked` lists every pipeline the validator ran, including those
    /// with no findings.
    pub fn from_findings(
        findings: &[Finding],
        checked: &[String],
        metadata: ReportMetadata,
    ) -> Self {
        let mut by_pipeline: BTreeMap<String, PipelineMissing> = BTreeMap::new();
        for name in checked {
            by_pipeline.entry(name.clone()).or_default();
        }

        for finding in findings {
            let entry = by_pipeline.entry(finding.pipeline.clone()).or_default();
            entry.missing_items.push(finding.to_string());
            let rendered = format!("sub-{}", finding.subject);
            if !entry.subjects_with_missing_data.contains(&rendered) {
                entry.subjects_with_missing_data.push(rendered);
            }
        }

        let mut all: Vec<String> = Vec::new();
        for entry in by_pipeline.values_mut() {
            entry.total_missing = entry.missing_items.len();
            entry.subjects_with_missing_data.sort();
            for subject in &entry.subjects_with_missing_data {
                if !all.contains(subject) {
                    all.push(subject.clone());
                }
            }
        }
        all.sort();

        let summary = ReportSummary {
            total_pipelines_checked: by_pipeline.len(),
            pipelines_with_missing_data: by_pipeline
                .values()
                .filter(|p| p.total_missing > 0)
                .count(),
            all_missing_subjects: all,
        };

        Self {
            metadata,
            missing_data_by_pipeline: by_pipeline,
            summary,
        }
    }

    /// True when no pipeline reported missing outputs.
    pub fn is_clean(&self) -> bool {
        self.summary.pipelines_with_missing_data == 0
    }
}

/// Extract the missing subjects from any accepted report shape.
///
/// Returns normalized subject ids (no `sub-` prefix), de-duplicated in
/// first-occurrence order. With `pipeline` set, only that pipeline's block
/// is consulted; otherwise the union of every pipeline is returned.
pub fn missing_subjects_from_value(
    value: &Value,
    pipeline: Option<&str>,
) -> Result<Vec<String>, ReportError> {
    let obj = value.as_object().ok_or(ReportError::NotAnObject)?;

    // Native shape.
    if let Some(by_pipeline) = obj.get("missing_data_by_pipeline").and_then(Value::as_object) {
        return collect_pipeline_subjects(by_pipeline, "subjects_with_missing_data", pipeline);
    }

    // External shape: {"pipelines": {"<name>": {"subjects": [...]}}}.
    if let Some(pipelines) = obj.get("pipelines").and_then(Value::as_object) {
        return collect_pipeline_subjects(pipelines, "subjects", pipeline);
    }

    // Bare union shape.
    if let Some(subjects) = obj.get("all_missing_subjects").and_then(Value::as_array) {
        return Ok(dedup_normalized(
            subjects.iter().filter_map(Value::as_str),
        ));
    }

    Err(ReportError::UnknownShape)
}

fn collect_pipeline_subjects(
    pipelines: &serde_json::Map<String, Value>,
    subjects_key: &str,
    filter: Option<&str>,
) -> Result<Vec<String>, ReportError> {
    if let Some(name) = filter {
        let block = pipelines
            .get(name)
            .ok_or_else(|| ReportError::UnknownPipeline(name.to_string()))?;
        return Ok(dedup_normalized(subject_strings(block, subjects_key)));
    }

    let mut out = Vec::new();
    for block in pipelines.values() {
        for id in subject_strings(block, subjects_key) {
            let id = normalize_subject(id);
            if !out.contains(&id) {
                out.push(id);
            }
        }
    }
    Ok(out)
}

fn subject_strings<'a>(block: &'a Value, key: &str) -> impl Iterator<Item = &'a str> {
    block
        .get(key)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
}

fn dedup_normalized<'a>(ids: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut out = Vec::new();
    for id in ids {
        let id = normalize_subject(id);
        if !out.contains(&id) {
            out.push(id);
        }
    }
    out
}
