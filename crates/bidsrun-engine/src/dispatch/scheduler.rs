//! Scheduler command-line abstraction.
//!
//! The cluster dispatcher talks to the job scheduler exclusively through
//! this trait, so tests (and dry runs) can substitute a fake scheduler.

use std::path::Path;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

/// Queue-side state of a tracked job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Accepted but not started.
    Pending,
    /// Observed running (or completing).
    Running,
}

#[async_trait]
pub trait SchedulerCli: Send + Sync {
    /// Submit a job script; returns the scheduler's job id.
    async fn submit(&self, script: &Path) -> Result<String>;

    /// Query the given job ids. Jobs missing from the result have left
    /// the queue.
    async fn status(&self, job_ids: &[String]) -> Result<Vec<(String, QueueState)>>;

    /// Request cancellation of one job.
    async fn cancel(&self, job_id: &str) -> Result<()>;
}

/// Real scheduler driven via its command-line tools (SLURM conventions:
/// `sbatch` / `squeue` / `scancel`, overridable in config).
#[derive(Debug, Clone)]
pub struct SystemScheduler {
    pub submit_cmd: String,
    pub status_cmd: String,
    pub cancel_cmd: String,
}

impl SystemScheduler {
    pub fn new(submit_cmd: &str, status_cmd: &str, cancel_cmd: &str) -> Self {
        Self {
            submit_cmd: submit_cmd.to_string(),
            status_cmd: status_cmd.to_string(),
            cancel_cmd: cancel_cmd.to_string(),
        }
    }
}

#[async_trait]
impl SchedulerCli for SystemScheduler {
    async fn submit(&self, script: &Path) -> Result<String> {
        let output = Command::new(&self.submit_cmd)
            .arg(script)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("failed to run {}", self.submit_cmd))?;
        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                self.submit_cmd,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        // Job id is the trailing token of stdout ("Submitted batch job 42").
        let stdout = String::from_utf8_lossy(&output.stdout);
        let job_id = stdout
            .split_whitespace()
            .last()
            .map(str::to_string)
            .filter(|id| !id.is_empty());
        job_id.with_context(|| format!("{} returned no job id", self.submit_cmd))
    }

    async fn status(&self, job_ids: &[String]) -> Result<Vec<(String, QueueState)>> {
        let output = Command::new(&self.status_cmd)
            .arg("-j")
            .arg(job_ids.join(","))
            .arg("--format=%i,%T")
            .arg("--noheader")
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("failed to run {}", self.status_cmd))?;
        // A failing status command usually means no tracked job is queued
        // any more; report an empty queue rather than an error.
        if !output.status.success() {
            debug!(status = %output.status, "status command reported no jobs");
            return Ok(Vec::new());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut states = Vec::new();
        for line in stdout.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some((id, state)) = line.split_once(',') else {
                continue;
            };
            let state = match state.trim() {
                "PENDING" | "CONFIGURING" => QueueState::Pending,
                "RUNNING" | "COMPLETING" => QueueState::Running,
                // Terminal queue states count as "left the queue".
                _ => continue,
            };
            states.push((id.trim().to_string(), state));
        }
        Ok(states)
    }

    async fn cancel(&self, job_id: &str) -> Result<()> {
        let status = Command::new(&self.cancel_cmd)
            .arg(job_id)
            .stdin(Stdio::null())
            .status()
            .await
            .with_context(|| format!("failed to run {}", self.cancel_cmd))?;
        if !status.success() {
            bail!("{} {} exited with {}", self.cancel_cmd, job_id, status);
        }
        Ok(())
    }
}
