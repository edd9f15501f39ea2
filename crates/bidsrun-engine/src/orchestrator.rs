//! Orchestrator — the single entry point composing config, planning,
//! dispatch, verification, and the reprocess loop.
//!
//! States: Loading → Planning → Dispatching → Verifying → (Replanning →
//! Dispatching → …)? → Summarizing. Cancellation jumps straight to
//! Summarizing with the partial records. Exit codes: 0 all good, 1 any
//! unit failure or unresolved findings, 2 configuration/planning errors.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{info, warn};

use bidsrun_types::{Finding, Plan, RunRecord, Unit, UnitState};

use crate::cancel::CancelToken;
use crate::command::CommandBuilder;
use crate::config::{Config, ConfigError};
use crate::dispatch::{Backend, ClusterDispatcher, LocalDispatcher, SystemScheduler};
use crate::oracle::Oracle;
use crate::planner::{self, PlanError, PlanOptions};
use crate::reprocess::{self, ReprocessError};
use crate::validate;
use bidsrun_types::{Report, ReportMetadata};

/// Orchestrator-level failures.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Report(#[from] ReprocessError),
    #[error(transparent)]
    Dispatch(#[from] anyhow::Error),
}

impl RunError {
    /// Configuration and planning problems exit 2; runtime failures 1.
    pub fn exit_code(&self) -> u8 {
        match self {
            RunError::Config(_) | RunError::Plan(_) | RunError::Report(_) => 2,
            RunError::Dispatch(_) => 1,
        }
    }
}

/// Everything the command line can ask for.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub config_path: PathBuf,
    pub subjects: Option<Vec<String>>,
    pub from_report: Option<PathBuf>,
    pub pipeline: Option<String>,
    pub force: bool,
    pub dry_run: bool,
    pub pilot: bool,
    pub jobs: Option<usize>,
    pub debug: bool,
    pub validate: bool,
    pub validate_only: bool,
    pub reprocess_missing: bool,
    /// Iteration cap for `--reprocess-missing`.
    pub reprocess_limit: usize,
    /// Backend override; auto-detected from the config otherwise.
    pub backend: Option<Backend>,
}

/// What a run did, for the final summary and the exit code.
#[derive(Debug, Default)]
pub struct RunSummary {
    /// Records for dispatched units, in plan order (all rounds).
    pub records: Vec<RunRecord>,
    /// Units skipped at plan time because they were already done.
    pub skipped: Vec<RunRecord>,
    /// Findings of the last verification pass.
    pub findings: Vec<Finding>,
    pub report_path: Option<PathBuf>,
    /// Rendered commands (dry-run only).
    pub dry_run_commands: Vec<String>,
    pub log_dir: PathBuf,
    pub elapsed_secs: f64,
    pub cancelled: bool,
    pub dry_run: bool,
    /// True when a verification pass ran.
    pub verified: bool,
}

impl RunSummary {
    /// Last state per unit (re-runs supersede earlier rounds).
    pub fn final_states(&self) -> BTreeMap<Unit, UnitState> {
        let mut states = BTreeMap::new();
        for record in &self.skipped {
            states.insert(record.unit.clone(), record.state);
        }
        for record in &self.records {
            states.insert(record.unit.clone(), record.state);
        }
        states
    }

    /// Counts by classification label, for the summary print-out.
    pub fn classification_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for state in self.final_states().values() {
            *counts.entry(state.label()).or_insert(0) += 1;
        }
        counts
    }

    pub fn exit_code(&self) -> u8 {
        if self.final_states().values().any(|s| s.is_failure()) {
            return 1;
        }
        if self.verified && !self.findings.is_empty() {
            return 1;
        }
        0
    }
}

/// One-shot top-level runner.
pub struct Orchestrator {
    options: RunOptions,
    cancel: CancelToken,
}

impl Orchestrator {
    pub fn new(options: RunOptions) -> Self {
        Self {
            options,
            cancel: CancelToken::new(),
        }
    }

    /// The token to wire into the process signal handler.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub async fn run(&self) -> Result<RunSummary, RunError> {
        let started = Instant::now();
        let opts = &self.options;

        info!(config = %opts.config_path.display(), "loading configuration");
        let config = Arc::new(Config::load(&opts.config_path)?);
        let oracle = Arc::new(Oracle::new(
            &config.common.output_folder,
            config.app.output_check.clone(),
        ));

        let mut summary = RunSummary {
            log_dir: config.common.log_dir.clone(),
            dry_run: opts.dry_run,
            ..Default::default()
        };

        if opts.validate_only {
            self.verify(&config, &mut summary)?;
            summary.elapsed_secs = started.elapsed().as_secs_f64();
            return Ok(summary);
        }

        let report_subjects = match &opts.from_report {
            Some(path) => Some(reprocess::subjects_from_report_file(
                path,
                opts.pipeline.as_deref(),
            )?),
            None => None,
        };

        info!("planning");
        let plan_opts = PlanOptions {
            subjects: opts.subjects.clone(),
            from_report: report_subjects,
            pilot: opts.pilot,
            force: opts.force,
            jobs: opts.jobs,
            debug: opts.debug,
        };
        let outcome = planner::build_plan(&config, &oracle, &plan_opts)?;
        summary.skipped = outcome.skipped;
        let plan = outcome.plan;

        if opts.dry_run {
            summary.dry_run_commands = self.render_dry_run(&config, &oracle, &plan)?;
            summary.elapsed_secs = started.elapsed().as_secs_f64();
            return Ok(summary);
        }

        if plan.is_empty() {
            info!("nothing to do");
        } else {
            let records = self.dispatch(&config, &oracle, &plan).await?;
            summary.records.extend(records);
        }
        summary.cancelled = self.cancel.is_cancelled();

        if (opts.validate || opts.reprocess_missing) && !summary.cancelled {
            self.verify(&config, &mut summary)?;

            let mut round = 0;
            while opts.reprocess_missing
                && !summary.findings.is_empty()
                && round < opts.reprocess_limit
                && !self.cancel.is_cancelled()
            {
                round += 1;
                info!(round, missing = summary.findings.len(), "reprocessing missing units");
                let subjects =
                    reprocess::subjects_from_findings(&summary.findings, opts.pipeline.as_deref());
                let replan = planner::build_plan(
                    &config,
                    &oracle,
                    &PlanOptions {
                        subjects: None,
                        from_report: Some(subjects),
                        pilot: false,
                        force: true,
                        jobs: opts.jobs,
                        debug: opts.debug,
                    },
                )?;
                if replan.plan.is_empty() {
                    break;
                }
                let records = self.dispatch(&config, &oracle, &replan.plan).await?;
                summary.records.extend(records);
                self.verify(&config, &mut summary)?;
            }
            if opts.reprocess_missing && !summary.findings.is_empty() {
                warn!(
                    remaining = summary.findings.len(),
                    "findings remain after reprocess rounds"
                );
            }
        }

        summary.cancelled = self.cancel.is_cancelled();
        summary.elapsed_secs = started.elapsed().as_secs_f64();
        Ok(summary)
    }

    async fn dispatch(
        &self,
        config: &Arc<Config>,
        oracle: &Arc<Oracle>,
        plan: &Plan,
    ) -> Result<Vec<RunRecord>, RunError> {
        let backend = self
            .options
            .backend
            .unwrap_or(if config.cluster_by_default() {
                Backend::Cluster
            } else {
                Backend::Local
            });

        info!(?backend, units = plan.len(), "dispatching");
        let records = match backend {
            Backend::Local => {
                LocalDispatcher::new(
                    config.clone(),
                    oracle.clone(),
                    self.cancel.clone(),
                    self.options.debug,
                )
                .run(plan)
                .await?
            }
            Backend::Cluster => {
                let cluster = config.cluster.as_ref().ok_or_else(|| {
                    RunError::Config(ConfigError::Semantic(
                        "--cluster requires a cluster config section".into(),
                    ))
                })?;
                let scheduler = Arc::new(SystemScheduler::new(
                    &cluster.submit_cmd,
                    &cluster.status_cmd,
                    &cluster.cancel_cmd,
                ));
                ClusterDispatcher::new(
                    config.clone(),
                    oracle.clone(),
                    scheduler,
                    self.cancel.clone(),
                )
                .run(plan)
                .await?
            }
        };
        Ok(records)
    }

    /// Run the validators and write a report.
    fn verify(&self, config: &Config, summary: &mut RunSummary) -> Result<(), RunError> {
        info!("verifying pipeline outputs");
        let (findings, checked) = validate::validate_all(
            &config.common.bids_folder,
            &config.common.output_folder,
            self.options.pipeline.as_deref(),
        );
        let report = Report::from_findings(
            &findings,
            &checked,
            ReportMetadata {
                generated_by: format!("bidsrun {}", env!("CARGO_PKG_VERSION")),
                timestamp: chrono::Utc::now().to_rfc3339(),
                command: std::env::args().collect::<Vec<_>>().join(" "),
                pipeline_filter: self.options.pipeline.clone(),
                bids_dir: config.common.bids_folder.display().to_string(),
                output_dir: config.common.output_folder.display().to_string(),
            },
        );
        let path = reprocess::write_report(&report, &config.common.reports_dir)
            .map_err(|e| RunError::Dispatch(anyhow::anyhow!("cannot write report: {e}")))?;
        summary.report_path = Some(path);
        summary.findings = findings;
        summary.verified = true;
        Ok(())
    }

    /// Dry run: render without executing. Local plans print the container
    /// invocation per unit; cluster plans print the job scripts.
    fn render_dry_run(
        &self,
        config: &Arc<Config>,
        oracle: &Arc<Oracle>,
        plan: &Plan,
    ) -> Result<Vec<String>, RunError> {
        let backend = self
            .options
            .backend
            .unwrap_or(if config.cluster_by_default() {
                Backend::Cluster
            } else {
                Backend::Local
            });
        let mut lines = Vec::new();
        match backend {
            Backend::Local => {
                let builder = CommandBuilder::new(config, self.options.debug);
                for unit in plan.units() {
                    let scratch = config.common.tmp_folder.join(unit.key());
                    lines.push(builder.build(unit, &scratch, "dryrun").shell_line());
                }
            }
            Backend::Cluster => {
                let scheduler = Arc::new(SystemScheduler::new("true", "true", "true"));
                let dispatcher = ClusterDispatcher::new(
                    config.clone(),
                    oracle.clone(),
                    scheduler,
                    self.cancel.clone(),
                );
                for unit in plan.units() {
                    lines.push(dispatcher.render_script(unit).map_err(RunError::Dispatch)?);
                }
            }
        }
        Ok(lines)
    }
}
