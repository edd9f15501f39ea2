//! Plan — the ordered, duplicate-free list of units the dispatcher will run.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::unit::Unit;

/// Where a plan's unit list came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Full walker output.
    Fresh,
    /// Units re-ingested from a validator report; implies force.
    FromReport,
    /// Units listed explicitly on the command line.
    Explicit,
    /// One randomly sampled unit.
    Pilot,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Provenance::Fresh => "fresh",
            Provenance::FromReport => "from_report",
            Provenance::Explicit => "explicit",
            Provenance::Pilot => "pilot",
        };
        write!(f, "{s}")
    }
}

/// An immutable dispatch plan.
///
/// Construction removes duplicate units while preserving first-occurrence
/// order; callers that need natural-sort order sort before constructing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    units: Vec<Unit>,
    /// How the unit list was selected.
    pub provenance: Provenance,
    /// Ignore "already done" verdicts when dispatching.
    pub force: bool,
    /// Worker count for the local backend.
    pub parallelism: usize,
}

impl Plan {
    /// Build a plan, de-duplicating units in first-occurrence order.
    pub fn new(units: Vec<Unit>, provenance: Provenance, force: bool, parallelism: usize) -> Self {
        let mut seen = HashSet::new();
        let units = units
            .into_iter()
            .filter(|u| seen.insert(u.clone()))
            .collect();
        Self {
            units,
            provenance,
            force,
            parallelism: parallelism.max(1),
        }
    }

    /// The planned units, in dispatch order.
    pub fn units(&self) -> &[Unit] {
        &self.units
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Effective worker count: `min(parallelism, |plan|)`, at least 1.
    pub fn worker_count(&self) -> usize {
        self.parallelism.min(self.units.len()).max(1)
    }
}
