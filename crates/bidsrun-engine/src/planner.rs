//! Work planner — walker output + oracle verdicts + user filters in,
//! immutable plan out.
//!
//! Filter sources, highest priority first: report re-ingest (implies
//! force), explicit subject list, pilot sampling, everything. Exactly one
//! source is active; lower-priority requests are logged as overridden.

use std::fs::{self, OpenOptions};
use std::path::Path;

use rand::seq::SliceRandom;
use thiserror::Error;
use tracing::{info, warn};

use bidsrun_types::{Plan, Provenance, RunRecord, Unit};

use crate::config::{AnalysisLevel, Config};
use crate::dataset::{walk_units, WalkError};
use crate::oracle::{Oracle, Verdict};

/// Fatal planning errors. All map to exit code 2.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error(transparent)]
    Walk(#[from] WalkError),
    #[error("preflight failed: {0}")]
    Preflight(String),
}

/// User-facing planning inputs (from the command line).
#[derive(Debug, Clone, Default)]
pub struct PlanOptions {
    /// `--subjects`, ids with or without the `sub-` prefix.
    pub subjects: Option<Vec<String>>,
    /// Subjects extracted from a validator report (`--from-report`).
    pub from_report: Option<Vec<String>>,
    /// `--pilot`: one random unit, parallelism 1.
    pub pilot: bool,
    /// `--force`: ignore oracle "done" verdicts.
    pub force: bool,
    /// `--jobs`: parallelism override.
    pub jobs: Option<usize>,
    /// `--debug`: clamps local parallelism to 1.
    pub debug: bool,
}

/// A plan plus the records for units skipped at plan time.
#[derive(Debug)]
pub struct PlanOutcome {
    pub plan: Plan,
    pub skipped: Vec<RunRecord>,
}

/// Build the dispatch plan. Checks writability of the shared roots once,
/// here, so dispatch never starts against an unwritable tree.
pub fn build_plan(
    config: &Config,
    oracle: &Oracle,
    opts: &PlanOptions,
) -> Result<PlanOutcome, PlanError> {
    preflight(config)?;

    if config.app.analysis_level == AnalysisLevel::Group {
        info!("group analysis level: planning a single group unit");
        let plan = Plan::new(vec![Unit::group()], Provenance::Fresh, opts.force, 1);
        return Ok(PlanOutcome {
            plan,
            skipped: Vec::new(),
        });
    }

    let (provenance, filter) = select_filter(opts);
    let force = opts.force || provenance == Provenance::FromReport;

    // Session-aware planning is keyed off the configured output pattern:
    // a `{session}` placeholder means completion is tracked per session.
    let session_aware = config
        .app
        .output_check
        .as_ref()
        .map(|c| c.pattern.contains("{session}"))
        .unwrap_or(false);

    let walked = walk_units(&config.common.bids_folder, filter.as_deref(), session_aware)?;

    // Report order is preserved for re-ingested plans; everything else
    // keeps the walker's natural order.
    let ordered = match (&provenance, &filter) {
        (Provenance::FromReport, Some(report_subjects)) => {
            reorder_by_subject(walked, report_subjects)
        }
        _ => walked,
    };

    // Oracle pass. Re-ingested reports always reprocess.
    let mut units = Vec::new();
    let mut skipped = Vec::new();
    for unit in ordered {
        if provenance == Provenance::FromReport {
            units.push(unit);
            continue;
        }
        match oracle.verdict(&unit, force) {
            Verdict::Done => {
                info!(unit = %unit, "already done, skipping");
                skipped.push(RunRecord::skipped(unit));
            }
            Verdict::ForceRerun => {
                info!(unit = %unit, "force: rerunning despite completion state");
                units.push(unit);
            }
            Verdict::NotDone => units.push(unit),
        }
    }

    // Pilot sampling happens after the oracle so the sampled unit is real work.
    let units = if provenance == Provenance::Pilot {
        let mut rng = rand::thread_rng();
        match units.choose(&mut rng) {
            Some(unit) => {
                info!(unit = %unit, "pilot mode: sampled one unit");
                vec![unit.clone()]
            }
            None => Vec::new(),
        }
    } else {
        units
    };

    let mut parallelism = opts.jobs.unwrap_or(config.common.jobs);
    if provenance == Provenance::Pilot || opts.debug {
        if parallelism > 1 {
            info!("clamping parallelism to 1 (pilot/debug)");
        }
        parallelism = 1;
    }

    Ok(PlanOutcome {
        plan: Plan::new(units, provenance, force, parallelism),
        skipped,
    })
}

/// Pick the active filter source and warn about overridden ones.
fn select_filter(opts: &PlanOptions) -> (Provenance, Option<Vec<String>>) {
    if let Some(report_subjects) = &opts.from_report {
        if opts.subjects.is_some() {
            warn!("--subjects overridden by --from-report");
        }
        if opts.pilot {
            warn!("--pilot overridden by --from-report");
        }
        return (Provenance::FromReport, Some(report_subjects.clone()));
    }
    if let Some(subjects) = &opts.subjects {
        if opts.pilot {
            warn!("--pilot overridden by --subjects");
        }
        return (Provenance::Explicit, Some(subjects.clone()));
    }
    if opts.pilot {
        return (Provenance::Pilot, None);
    }
    (Provenance::Fresh, None)
}

/// Order units by the position of their subject in `subjects`, keeping the
/// walker's order within one subject.
fn reorder_by_subject(units: Vec<Unit>, subjects: &[String]) -> Vec<Unit> {
    let normalized: Vec<String> = subjects
        .iter()
        .map(|s| bidsrun_types::normalize_subject(s))
        .collect();
    let mut out = Vec::with_capacity(units.len());
    for subject in &normalized {
        out.extend(units.iter().filter(|u| &u.subject == subject).cloned());
    }
    out
}

/// Verify the shared roots are writable before dispatch begins.
fn preflight(config: &Config) -> Result<(), PlanError> {
    if !config.common.container.is_file() {
        return Err(PlanError::Preflight(format!(
            "container image unreadable: {}",
            config.common.container.display()
        )));
    }
    for (label, dir) in [
        ("output root", &config.common.output_folder),
        ("scratch root", &config.common.tmp_folder),
        ("log root", &config.common.log_dir),
    ] {
        check_writable(label, dir)?;
    }
    Ok(())
}

fn check_writable(label: &str, dir: &Path) -> Result<(), PlanError> {
    fs::create_dir_all(dir)
        .map_err(|e| PlanError::Preflight(format!("cannot create {label} {}: {e}", dir.display())))?;
    let probe = dir.join(".bidsrun_write_check");
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&probe)
        .map_err(|e| {
            PlanError::Preflight(format!("{label} {} not writable: {e}", dir.display()))
        })?;
    let _ = fs::remove_file(&probe);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OutputCheck;
    use crate::markers;
    use serde_json::json;
    use std::fs::File;
    use tempfile::TempDir;

    fn config_with_subjects(subjects: &[&str]) -> (TempDir, Config) {
        let tmp = TempDir::new().unwrap();
        for s in subjects {
            fs::create_dir_all(tmp.path().join("bids").join(s)).unwrap();
        }
        fs::create_dir_all(tmp.path().join("bids")).unwrap();
        File::create(tmp.path().join("app.sif")).unwrap();
        let value = json!({
            "common": {
                "bids_folder": tmp.path().join("bids").to_string_lossy(),
                "output_folder": tmp.path().join("out").to_string_lossy(),
                "tmp_folder": tmp.path().join("work").to_string_lossy(),
                "log_dir": tmp.path().join("logs").to_string_lossy(),
                "container": tmp.path().join("app.sif").to_string_lossy(),
                "jobs": 4
            },
            "app": {"analysis_level": "participant"}
        });
        let config = Config::from_value(value).unwrap();
        (tmp, config)
    }

    fn oracle_for(config: &Config) -> Oracle {
        Oracle::new(&config.common.output_folder, config.app.output_check.clone())
    }

    #[test]
    fn fresh_plan_covers_all_subjects_in_order() {
        let (_tmp, config) = config_with_subjects(&["sub-002", "sub-001", "sub-010"]);
        let outcome =
            build_plan(&config, &oracle_for(&config), &PlanOptions::default()).unwrap();
        assert_eq!(
            outcome.plan.units(),
            &[
                Unit::subject("001"),
                Unit::subject("002"),
                Unit::subject("010")
            ]
        );
        assert_eq!(outcome.plan.provenance, Provenance::Fresh);
        assert!(!outcome.plan.force);
    }

    #[test]
    fn plans_are_deterministic() {
        let (_tmp, config) = config_with_subjects(&["sub-003", "sub-001", "sub-002"]);
        let oracle = oracle_for(&config);
        let a = build_plan(&config, &oracle, &PlanOptions::default()).unwrap();
        let b = build_plan(&config, &oracle, &PlanOptions::default()).unwrap();
        assert_eq!(a.plan.units(), b.plan.units());
    }

    #[test]
    fn marker_skips_unless_forced() {
        let (_tmp, config) = config_with_subjects(&["sub-001", "sub-002", "sub-003"]);
        let oracle = oracle_for(&config);
        markers::write_marker(&config.common.output_folder, &Unit::subject("001"), "t").unwrap();

        let outcome = build_plan(&config, &oracle, &PlanOptions::default()).unwrap();
        assert_eq!(
            outcome.plan.units(),
            &[Unit::subject("002"), Unit::subject("003")]
        );
        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(outcome.skipped[0].unit, Unit::subject("001"));

        let forced = build_plan(
            &config,
            &oracle,
            &PlanOptions {
                force: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(forced.plan.len(), 3, "force dominance: nothing skipped");
        assert!(forced.skipped.is_empty());
    }

    #[test]
    fn report_filter_preserves_report_order_and_forces() {
        let (_tmp, config) = config_with_subjects(&["sub-002", "sub-005", "sub-001"]);
        let outcome = build_plan(
            &config,
            &oracle_for(&config),
            &PlanOptions {
                from_report: Some(vec!["sub-005".into(), "sub-002".into()]),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(
            outcome.plan.units(),
            &[Unit::subject("005"), Unit::subject("002")]
        );
        assert_eq!(outcome.plan.provenance, Provenance::FromReport);
        assert!(outcome.plan.force, "report re-ingest implies force");
    }

    #[test]
    fn explicit_filter_rejects_unknown_subjects() {
        let (_tmp, config) = config_with_subjects(&["sub-001"]);
        let err = build_plan(
            &config,
            &oracle_for(&config),
            &PlanOptions {
                subjects: Some(vec!["sub-042".into()]),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::Walk(WalkError::UnknownSubjects(_))));
    }

    #[test]
    fn pilot_samples_one_survivor_and_clamps_jobs() {
        let (_tmp, config) = config_with_subjects(&["sub-001", "sub-002", "sub-003"]);
        let outcome = build_plan(
            &config,
            &oracle_for(&config),
            &PlanOptions {
                pilot: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(outcome.plan.len(), 1);
        assert_eq!(outcome.plan.provenance, Provenance::Pilot);
        assert_eq!(outcome.plan.parallelism, 1);
    }

    #[test]
    fn pilot_with_no_survivors_plans_nothing() {
        let (_tmp, config) = config_with_subjects(&["sub-001"]);
        markers::write_marker(&config.common.output_folder, &Unit::subject("001"), "t").unwrap();
        let outcome = build_plan(
            &config,
            &oracle_for(&config),
            &PlanOptions {
                pilot: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(outcome.plan.is_empty());
    }

    #[test]
    fn empty_dataset_plans_nothing() {
        let (_tmp, config) = config_with_subjects(&[]);
        let outcome =
            build_plan(&config, &oracle_for(&config), &PlanOptions::default()).unwrap();
        assert!(outcome.plan.is_empty());
    }

    #[test]
    fn session_pattern_switches_to_session_units() {
        let (tmp, mut config) = config_with_subjects(&["sub-01"]);
        fs::create_dir_all(tmp.path().join("bids/sub-01/ses-a")).unwrap();
        fs::create_dir_all(tmp.path().join("bids/sub-01/ses-b")).unwrap();
        config.app.output_check = Some(OutputCheck {
            pattern: "sub-{subject}_ses-{session}.html".into(),
            directory: String::new(),
        });
        let oracle = oracle_for(&config);
        let outcome = build_plan(&config, &oracle, &PlanOptions::default()).unwrap();
        assert_eq!(
            outcome.plan.units(),
            &[Unit::session("01", "a"), Unit::session("01", "b")]
        );
    }

    #[test]
    fn group_level_plans_single_unit() {
        let (_tmp, mut config) = config_with_subjects(&["sub-01"]);
        config.app.analysis_level = AnalysisLevel::Group;
        let outcome =
            build_plan(&config, &oracle_for(&config), &PlanOptions::default()).unwrap();
        assert_eq!(outcome.plan.units(), &[Unit::group()]);
        assert_eq!(outcome.plan.parallelism, 1);
    }
}
