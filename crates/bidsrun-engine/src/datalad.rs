//! Content-addressed dataset helper (DataLad).
//!
//! Local dispatch treats DataLad as an optional pre-step (fetch a unit's
//! data) and post-step (save results). The first helper failure demotes
//! auto-detection to plain-filesystem behavior for the rest of the run,
//! reported once; cluster jobs instead run their DataLad steps inside the
//! generated script.

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, warn};

use bidsrun_types::Unit;

/// Timeout for individual helper invocations.
const HELPER_TIMEOUT: Duration = Duration::from_secs(300);

/// True when `path` is the root of a DataLad dataset.
pub fn is_datalad_dataset(path: &Path) -> bool {
    path.join(".datalad").join("config").is_file()
}

/// Stateful helper handle shared by all local workers.
#[derive(Debug, Default)]
pub struct DataladHelper {
    demoted: AtomicBool,
}

impl DataladHelper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a unit's data before running its container. Best-effort.
    pub async fn get_unit_data(&self, bids_dir: &Path, unit: &Unit) {
        if self.demoted() || !is_datalad_dataset(bids_dir) {
            return;
        }
        info!(unit = %unit, "fetching unit data via datalad");
        let target = unit.bids_subject();
        if !self
            .run(bids_dir, &["get", &target])
            .await
        {
            self.demote("datalad get failed");
        }
    }

    /// Save results after a successful unit. Best-effort.
    pub async fn save_unit_results(&self, output_dir: &Path, unit: &Unit) {
        if self.demoted() || !is_datalad_dataset(output_dir) {
            return;
        }
        info!(unit = %unit, "saving unit results via datalad");
        let message = format!("Add results for {}", unit.bids_subject());
        if !self.run(output_dir, &["save", "-m", &message]).await {
            self.demote("datalad save failed");
        }
    }

    fn demoted(&self) -> bool {
        self.demoted.load(Ordering::Relaxed)
    }

    /// Switch to plain-filesystem behavior, reporting once.
    fn demote(&self, why: &str) {
        if !self.demoted.swap(true, Ordering::Relaxed) {
            warn!(why, "disabling datalad integration for the rest of this run");
        }
    }

    async fn run(&self, cwd: &Path, args: &[&str]) -> bool {
        debug!(?args, cwd = %cwd.display(), "running datalad");
        let child = Command::new("datalad")
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        let mut child = match child {
            Ok(child) => child,
            Err(e) => {
                warn!(error = %e, "datalad not runnable");
                return false;
            }
        };
        match tokio::time::timeout(HELPER_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                warn!(error = %e, "datalad wait failed");
                false
            }
            Err(_) => {
                warn!("datalad timed out; killing");
                let _ = child.start_kill();
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn dataset_detection_needs_config_file() {
        let tmp = TempDir::new().unwrap();
        assert!(!is_datalad_dataset(tmp.path()));

        fs::create_dir_all(tmp.path().join(".datalad")).unwrap();
        assert!(!is_datalad_dataset(tmp.path()));

        fs::write(tmp.path().join(".datalad/config"), "[datalad]\n").unwrap();
        assert!(is_datalad_dataset(tmp.path()));
    }

    #[tokio::test]
    async fn plain_directories_are_a_no_op() {
        let tmp = TempDir::new().unwrap();
        let helper = DataladHelper::new();
        helper.get_unit_data(tmp.path(), &Unit::subject("001")).await;
        helper
            .save_unit_results(tmp.path(), &Unit::subject("001"))
            .await;
        assert!(!helper.demoted());
    }

    #[test]
    fn demotion_reports_once() {
        let helper = DataladHelper::new();
        helper.demote("first");
        helper.demote("second");
        assert!(helper.demoted());
    }
}
