//! Local dispatcher — bounded worker pool over one shared unit queue.
//!
//! Workers share nothing mutable except the queue and the record log.
//! Each worker loops: dequeue a unit, run its container, verify outputs,
//! write the success marker, emit the run record. On cancellation the
//! queue stops handing out units, running containers get SIGTERM then
//! (after the grace period) SIGKILL, and scratch is still cleaned up.

use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use bidsrun_types::{Plan, RunRecord, Unit, UnitState};

use crate::cancel::CancelToken;
use crate::command::{CommandBuilder, CommandSpec};
use crate::config::Config;
use crate::datalad::DataladHelper;
use crate::dispatch::{backfill_cancelled, in_plan_order, RecordLog};
use crate::markers;
use crate::oracle::Oracle;

/// Runs a plan on this machine with `min(parallelism, |plan|)` workers.
pub struct LocalDispatcher {
    config: Arc<Config>,
    oracle: Arc<Oracle>,
    cancel: CancelToken,
    debug: bool,
}

impl LocalDispatcher {
    pub fn new(config: Arc<Config>, oracle: Arc<Oracle>, cancel: CancelToken, debug: bool) -> Self {
        Self {
            config,
            oracle,
            cancel,
            debug,
        }
    }

    /// Execute the plan; returns run records in plan order.
    pub async fn run(&self, plan: &Plan) -> Result<Vec<RunRecord>> {
        let queue: Arc<Mutex<VecDeque<Unit>>> =
            Arc::new(Mutex::new(plan.units().iter().cloned().collect()));
        let log = RecordLog::new();
        let stamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();

        fs::create_dir_all(&self.config.common.log_dir)
            .context("cannot create log directory")?;

        let helper = Arc::new(DataladHelper::new());
        let workers = plan.worker_count();
        info!(units = plan.len(), workers, "local dispatch starting");

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let queue = queue.clone();
            let log = log.clone();
            let worker = UnitRunner {
                config: self.config.clone(),
                oracle: self.oracle.clone(),
                cancel: self.cancel.clone(),
                helper: helper.clone(),
                debug: self.debug,
                force: plan.force,
                stamp: stamp.clone(),
            };
            handles.push(tokio::spawn(async move {
                loop {
                    if worker.cancel.is_cancelled() {
                        return Ok(());
                    }
                    let unit = { queue.lock().await.pop_front() };
                    let Some(unit) = unit else {
                        return Ok(());
                    };
                    let record = worker.process_unit(unit).await?;
                    log.push(record).await;
                }
            }));
        }

        let mut first_error: Option<anyhow::Error> = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(anyhow::anyhow!("worker panicked: {e}"));
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        if self.cancel.is_cancelled() {
            backfill_cancelled(plan, &log).await;
        }
        Ok(in_plan_order(plan, log.snapshot().await))
    }
}

/// Everything one worker needs to process units.
struct UnitRunner {
    config: Arc<Config>,
    oracle: Arc<Oracle>,
    cancel: CancelToken,
    helper: Arc<DataladHelper>,
    debug: bool,
    force: bool,
    stamp: String,
}

impl UnitRunner {
    async fn process_unit(&self, unit: Unit) -> Result<RunRecord> {
        let common = &self.config.common;
        info!(unit = %unit, "processing unit");

        let scratch = common.tmp_folder.join(unit.key());
        fs::create_dir_all(&scratch)
            .with_context(|| format!("cannot create scratch {}", scratch.display()))?;

        // A forced re-run owns its marker slot again.
        if self.force {
            let _ = markers::clear_marker(&common.output_folder, &unit);
        }

        self.helper.get_unit_data(&common.bids_folder, &unit).await;

        let spec = CommandBuilder::new(&self.config, self.debug).build(&unit, &scratch, &self.stamp);
        let mut record = RunRecord::new(unit.clone(), UnitState::FailedContainer);
        record.log_path = spec.stdout_path.clone();
        record.started_at = Some(Utc::now());

        let outcome = self.spawn_and_wait(&spec).await;
        record.finished_at = Some(Utc::now());

        match outcome {
            WaitOutcome::Exited(code) if code == 0 => {
                if unit.is_group() || self.oracle.outputs_exist(&unit) {
                    if !unit.is_group() {
                        self.write_marker(&unit)?;
                        self.helper
                            .save_unit_results(&common.output_folder, &unit)
                            .await;
                    }
                    record.state = UnitState::Success;
                    record.exit_code = Some(0);
                    info!(unit = %unit, "unit succeeded");
                } else {
                    record.state = UnitState::FailedOutputCheck;
                    record.exit_code = Some(0);
                    warn!(unit = %unit, "container exited zero but no expected output found");
                }
            }
            WaitOutcome::Exited(code) => {
                record.state = UnitState::FailedContainer;
                record.exit_code = Some(code);
                error!(unit = %unit, code, "container failed");
            }
            WaitOutcome::SpawnFailed(e) => {
                record.state = UnitState::FailedContainer;
                error!(unit = %unit, error = %e, "container spawn failed");
            }
            WaitOutcome::Cancelled => {
                record.state = UnitState::Cancelled;
                warn!(unit = %unit, "unit cancelled");
            }
        }

        // Scratch is removed on every path except an uncancelled failure
        // without force, where it is kept for debugging.
        let keep_scratch =
            record.state.is_failure() && record.state != UnitState::Cancelled && !self.force;
        if keep_scratch {
            warn!(unit = %unit, scratch = %scratch.display(), "keeping scratch for debugging");
            record.scratch_kept = Some(scratch);
        } else if let Err(e) = fs::remove_dir_all(&scratch) {
            warn!(unit = %unit, error = %e, "could not remove scratch");
        }

        Ok(record)
    }

    /// Marker creation is create-exclusive; a duplicate means the same
    /// unit was dispatched twice and the whole run must fail.
    fn write_marker(&self, unit: &Unit) -> Result<()> {
        markers::write_marker(
            &self.config.common.output_folder,
            unit,
            env!("CARGO_PKG_VERSION"),
        )
        .with_context(|| format!("duplicate or unwritable success marker for {unit}"))
    }

    async fn spawn_and_wait(&self, spec: &CommandSpec) -> WaitOutcome {
        let (stdout, stderr) = match open_sinks(spec) {
            Ok(pair) => pair,
            Err(e) => return WaitOutcome::SpawnFailed(e.to_string()),
        };

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().cloned())
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return WaitOutcome::SpawnFailed(e.to_string()),
        };

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = self.cancel.cancelled() => None,
        };
        match waited {
            Some(Ok(status)) => WaitOutcome::Exited(status.code().unwrap_or(-1)),
            Some(Err(e)) => WaitOutcome::SpawnFailed(e.to_string()),
            None => {
                self.terminate(&mut child).await;
                WaitOutcome::Cancelled
            }
        }
    }

    /// SIGTERM, wait out the grace period, then SIGKILL.
    async fn terminate(&self, child: &mut tokio::process::Child) {
        if let Some(pid) = child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
        let grace = Duration::from_secs(self.config.common.grace_period_secs);
        if tokio::time::timeout(grace, child.wait()).await.is_err() {
            warn!("grace period elapsed; killing container");
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

enum WaitOutcome {
    Exited(i32),
    SpawnFailed(String),
    Cancelled,
}

/// Open the per-unit log sinks. Outside debug mode both streams share one
/// file handle.
fn open_sinks(spec: &CommandSpec) -> std::io::Result<(Stdio, Stdio)> {
    let open = |path: &PathBuf| -> std::io::Result<fs::File> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::File::create(path)
    };
    match (&spec.stdout_path, &spec.stderr_path) {
        (Some(out), Some(err)) if out == err => {
            let file = open(out)?;
            let clone = file.try_clone()?;
            Ok((Stdio::from(file), Stdio::from(clone)))
        }
        (Some(out), Some(err)) => Ok((Stdio::from(open(out)?), Stdio::from(open(err)?))),
        (Some(out), None) => Ok((Stdio::from(open(out)?), Stdio::null())),
        (None, Some(err)) => Ok((Stdio::null(), Stdio::from(open(err)?))),
        (None, None) => Ok((Stdio::null(), Stdio::null())),
    }
}
