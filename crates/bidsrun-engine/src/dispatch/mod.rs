//! Dispatch backends.
//!
//! Two backends share the command builder and the completion oracle so a
//! unit classifies identically wherever it ran:
//! - **local**: bounded pool of worker tasks spawning container processes
//! - **cluster**: one job script per unit, submitted to an external
//!   scheduler and optionally polled
//!
//! Run records are appended under a mutex; readers always see a
//! consistent prefix.

mod local;
mod scheduler;

pub mod cluster;

pub use cluster::ClusterDispatcher;
pub use local::LocalDispatcher;
pub use scheduler::{QueueState, SchedulerCli, SystemScheduler};

use std::sync::Arc;

use tokio::sync::Mutex;

use bidsrun_types::{Plan, RunRecord, Unit, UnitState};

/// Which backend a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Local,
    Cluster,
}

/// Shared, mutex-guarded run-record log.
#[derive(Debug, Clone, Default)]
pub struct RecordLog {
    inner: Arc<Mutex<Vec<RunRecord>>>,
}

impl RecordLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, record: RunRecord) {
        self.inner.lock().await.push(record);
    }

    /// Replace the record for `unit` (cluster state transitions).
    pub async fn update(&self, unit: &Unit, apply: impl FnOnce(&mut RunRecord)) {
        let mut records = self.inner.lock().await;
        if let Some(record) = records.iter_mut().find(|r| &r.unit == unit) {
            apply(record);
        }
    }

    pub async fn snapshot(&self) -> Vec<RunRecord> {
        self.inner.lock().await.clone()
    }
}

/// Order records by plan position (summary order), appending any record
/// for units outside the plan at the end.
pub fn in_plan_order(plan: &Plan, mut records: Vec<RunRecord>) -> Vec<RunRecord> {
    let mut ordered = Vec::with_capacity(records.len());
    for unit in plan.units() {
        while let Some(pos) = records.iter().position(|r| &r.unit == unit) {
            ordered.push(records.remove(pos));
        }
    }
    ordered.append(&mut records);
    ordered
}

/// Give every planned unit with no record yet a terminal `Cancelled`
/// record, so cancellation leaves no unit unaccounted for.
pub async fn backfill_cancelled(plan: &Plan, log: &RecordLog) {
    let seen: Vec<Unit> = log
        .snapshot()
        .await
        .into_iter()
        .map(|r| r.unit)
        .collect();
    for unit in plan.units() {
        if !seen.contains(unit) {
            log.push(RunRecord::new(unit.clone(), UnitState::Cancelled))
                .await;
        }
    }
}
