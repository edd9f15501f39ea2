//! Cluster dispatcher — one job script per unit, submitted to an external
//! scheduler in plan order.
//!
//! No in-process concurrency: the scheduler owns the parallelism. Each
//! script carries the scheduler directives, module loads and environment
//! exports, the optional content-addressed dataset steps (clone/fetch
//! under an advisory lock, per-unit branch, push on success under the
//! same lock), the container invocation with the same semantics as local
//! dispatch, and scratch cleanup.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{error, info, warn};

use bidsrun_types::{Plan, RunRecord, Unit, UnitState};

use crate::cancel::CancelToken;
use crate::command::CommandBuilder;
use crate::config::Config;
use crate::dispatch::scheduler::{QueueState, SchedulerCli};
use crate::dispatch::{backfill_cancelled, in_plan_order, RecordLog};
use crate::markers;
use crate::oracle::Oracle;

/// Submits and (optionally) tracks one scheduler job per unit.
pub struct ClusterDispatcher {
    config: Arc<Config>,
    oracle: Arc<Oracle>,
    scheduler: Arc<dyn SchedulerCli>,
    cancel: CancelToken,
}

/// One submitted job being tracked by the monitor.
struct TrackedJob {
    unit: Unit,
    job_id: String,
    last_seen: QueueState,
}

impl ClusterDispatcher {
    pub fn new(
        config: Arc<Config>,
        oracle: Arc<Oracle>,
        scheduler: Arc<dyn SchedulerCli>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            config,
            oracle,
            scheduler,
            cancel,
        }
    }

    /// Submit the plan; with monitoring enabled, poll until every tracked
    /// job reaches a terminal state. Records come back in plan order.
    pub async fn run(&self, plan: &Plan) -> Result<Vec<RunRecord>> {
        let cluster = self
            .config
            .cluster
            .as_ref()
            .context("cluster dispatch requires a cluster config section")?;

        let jobs_dir = self.config.common.log_dir.join("jobs");
        fs::create_dir_all(&jobs_dir).context("cannot create job script directory")?;

        let log = RecordLog::new();
        let mut tracked: Vec<TrackedJob> = Vec::new();

        for unit in plan.units() {
            if self.cancel.is_cancelled() {
                warn!("cancellation: stopping submissions");
                break;
            }
            if plan.force {
                let _ = markers::clear_marker(&self.config.common.output_folder, unit);
            }

            let script_path = jobs_dir.join(format!("job_{}.sh", unit.key()));
            let script = self.render_script(unit)?;
            fs::write(&script_path, script)
                .with_context(|| format!("cannot write job script {}", script_path.display()))?;
            make_executable(&script_path)?;

            match self.scheduler.submit(&script_path).await {
                Ok(job_id) => {
                    info!(unit = %unit, job_id = %job_id, "job submitted");
                    let mut record = RunRecord::new(unit.clone(), UnitState::Submitted);
                    record.started_at = Some(Utc::now());
                    record.job_id = Some(job_id.clone());
                    log.push(record).await;
                    tracked.push(TrackedJob {
                        unit: unit.clone(),
                        job_id,
                        last_seen: QueueState::Pending,
                    });
                }
                Err(e) => {
                    error!(unit = %unit, error = %e, "submit failed");
                    let mut record = RunRecord::new(unit.clone(), UnitState::SubmitFailed);
                    record.finished_at = Some(Utc::now());
                    log.push(record).await;
                }
            }
        }

        if cluster.monitor && !tracked.is_empty() {
            self.monitor(&log, &mut tracked, cluster.poll_interval_secs)
                .await;
        }

        if self.cancel.is_cancelled() {
            self.cancel_tracked(&log, &tracked).await;
            backfill_cancelled(plan, &log).await;
        }

        Ok(in_plan_order(plan, log.snapshot().await))
    }

    /// Poll the scheduler until no tracked job remains queued. Jobs that
    /// leave the queue are classified through the completion oracle so
    /// cluster runs and local runs agree on what "done" means.
    async fn monitor(&self, log: &RecordLog, tracked: &mut Vec<TrackedJob>, interval_secs: u64) {
        info!(jobs = tracked.len(), "monitoring submitted jobs");
        let interval = Duration::from_secs(interval_secs.max(1));

        while !tracked.is_empty() && !self.cancel.is_cancelled() {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.cancel.cancelled() => break,
            }

            let ids: Vec<String> = tracked.iter().map(|j| j.job_id.clone()).collect();
            let states = match self.scheduler.status(&ids).await {
                Ok(states) => states,
                Err(e) => {
                    warn!(error = %e, "status poll failed");
                    continue;
                }
            };

            let mut still_queued = Vec::new();
            for mut job in tracked.drain(..) {
                match states.iter().find(|(id, _)| id == &job.job_id) {
                    Some((_, QueueState::Running)) => {
                        if job.last_seen != QueueState::Running {
                            info!(unit = %job.unit, job_id = %job.job_id, "job running");
                            log.update(&job.unit, |r| r.state = UnitState::Running).await;
                            job.last_seen = QueueState::Running;
                        }
                        still_queued.push(job);
                    }
                    Some((_, QueueState::Pending)) => still_queued.push(job),
                    None => self.finish_job(log, &job).await,
                }
            }
            *tracked = still_queued;
        }
    }

    /// A job left the queue: decide success via the oracle's non-marker
    /// layers and write the marker on success, mirroring local dispatch.
    async fn finish_job(&self, log: &RecordLog, job: &TrackedJob) {
        let done = self.oracle.outputs_exist(&job.unit);
        let state = if done {
            UnitState::Succeeded
        } else {
            UnitState::Failed
        };
        info!(unit = %job.unit, job_id = %job.job_id, state = %state, "job finished");
        if done {
            if let Err(e) = markers::write_marker(
                &self.config.common.output_folder,
                &job.unit,
                env!("CARGO_PKG_VERSION"),
            ) {
                warn!(unit = %job.unit, error = %e, "could not write success marker");
            }
        }
        log.update(&job.unit, |r| {
            r.state = state;
            r.finished_at = Some(Utc::now());
        })
        .await;
    }

    /// Cancel tracked jobs in reverse submission order.
    async fn cancel_tracked(&self, log: &RecordLog, tracked: &[TrackedJob]) {
        for job in tracked.iter().rev() {
            let state = match job.last_seen {
                QueueState::Pending => UnitState::CancelledSubmitted,
                QueueState::Running => UnitState::CancelledRunning,
            };
            if let Err(e) = self.scheduler.cancel(&job.job_id).await {
                warn!(job_id = %job.job_id, error = %e, "cancel request failed");
            }
            log.update(&job.unit, |r| {
                r.state = state;
                r.finished_at = Some(Utc::now());
            })
            .await;
        }
    }

    /// Render the job script for one unit.
    pub fn render_script(&self, unit: &Unit) -> Result<String> {
        let common = &self.config.common;
        let cluster = self
            .config
            .cluster
            .as_ref()
            .context("cluster dispatch requires a cluster config section")?;
        let key = unit.key();

        let scratch = common.tmp_folder.join(format!("job_{key}"));
        let spec = CommandBuilder::new(&self.config, false).build(unit, &scratch, "job");

        let mut script = String::new();
        script.push_str("#!/bin/bash\n");
        script.push_str(&format!("#SBATCH --job-name={}_{key}\n", cluster.job_name));
        script.push_str(&format!("#SBATCH --partition={}\n", cluster.partition));
        script.push_str(&format!("#SBATCH --time={}\n", cluster.time));
        script.push_str(&format!("#SBATCH --mem={}\n", cluster.mem));
        script.push_str(&format!("#SBATCH --cpus-per-task={}\n", cluster.cpus));
        script.push_str(&format!(
            "#SBATCH --output={}\n",
            common.log_dir.join(&cluster.output_pattern).display()
        ));
        script.push_str(&format!(
            "#SBATCH --error={}\n",
            common.log_dir.join(&cluster.error_pattern).display()
        ));
        script.push('\n');
        script.push_str("set -u\n\n");
        script.push_str(&format!("echo \"bidsrun unit {unit} (job $SLURM_JOB_ID)\"\n"));
        script.push_str("echo \"start: $(date)\"\n\n");

        if !cluster.modules.is_empty() {
            for module in &cluster.modules {
                script.push_str(&format!("module load {module}\n"));
            }
            script.push('\n');
        }
        // Env allow-list plus the cluster map, exactly as local dispatch
        // applies them; the builder already gave the allow-list precedence.
        for (name, value) in &spec.env {
            script.push_str(&format!("export {name}={value}\n"));
        }
        script.push('\n');

        script.push_str(&format!("SCRATCH={}\n", sh_quote(&scratch.display().to_string())));
        script.push_str("mkdir -p \"$SCRATCH\"\n\n");

        if let Some(dataset) = &self.config.dataset {
            let lock = cluster
                .lock_file
                .clone()
                .unwrap_or_else(|| common.tmp_folder.join("datalad.lock"));
            script.push_str(&format!("LOCKFILE={}\n", sh_quote(&lock.display().to_string())));
            script.push_str("mkdir -p \"$(dirname \"$LOCKFILE\")\"\n");
            script.push_str(&format!(
                "DS_DIR={}\n",
                sh_quote(&common.bids_folder.display().to_string())
            ));
            script.push_str("if [ ! -d \"$DS_DIR\" ]; then\n");
            script.push_str(&format!(
                "    flock \"$LOCKFILE\" datalad clone --branch {} {} \"$DS_DIR\"\n",
                dataset.input_branch,
                sh_quote(&dataset.input_dataset)
            ));
            script.push_str("fi\n");
            script.push_str("cd \"$DS_DIR\"\n");
            // Structure only; file bodies are fetched per unit.
            script.push_str("datalad get -n -r -R1 .\n");
            if dataset.branch_per_subject {
                script.push_str(&format!(
                    "git checkout -b processing-{key} 2>/dev/null || git checkout processing-{key}\n"
                ));
            }
            script.push_str(&format!("datalad get {}\n\n", unit.bids_subject()));
        }

        script.push_str(&format!("if {}; then\n", spec.shell_line()));
        script.push_str(&format!("    echo \"unit {unit} completed\"\n"));
        if let Some(dataset) = &self.config.dataset {
            if dataset.auto_push {
                script.push_str(&format!(
                    "    cd {}\n",
                    sh_quote(&common.output_folder.display().to_string())
                ));
                script.push_str(&format!(
                    "    git checkout {0} 2>/dev/null || git checkout -b {0}\n",
                    dataset.output_branch
                ));
                script.push_str(&format!(
                    "    datalad save -m \"Add results for {} (job $SLURM_JOB_ID)\"\n",
                    unit.bids_subject()
                ));
                script.push_str("    flock \"$LOCKFILE\" datalad push --to origin\n");
            }
        }
        script.push_str("    rm -rf \"$SCRATCH\"\n");
        script.push_str("else\n");
        script.push_str(&format!(
            "    echo \"unit {unit} failed; scratch preserved at $SCRATCH\"\n"
        ));
        script.push_str("    exit 1\n");
        script.push_str("fi\n\n");
        script.push_str("echo \"end: $(date)\"\n");
        Ok(script)
    }
}

fn sh_quote(s: &str) -> String {
    if s.chars()
        .all(|c| c.is_ascii_alphanumeric() || "/_.-+:#@%".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

#[cfg(unix)]
fn make_executable(path: &PathBuf) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn make_executable(_path: &PathBuf) -> Result<()> {
    Ok(())
}
