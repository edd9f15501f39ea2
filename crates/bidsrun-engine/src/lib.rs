//! The bidsrun engine — everything between the parsed command line and the
//! process exit code.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Orchestrator                          │
//! │  config ─▶ walker ─▶ oracle ─▶ planner ─▶ plan               │
//! │                                   │                          │
//! │               ┌───────────────────┴───────────────┐          │
//! │               ▼                                   ▼          │
//! │        LocalDispatcher                    ClusterDispatcher  │
//! │        (worker pool,                      (job scripts,      │
//! │         tokio::process)                    submit + poll)    │
//! │               └───────────────────┬───────────────┘          │
//! │                                   ▼                          │
//! │                       validators ─▶ report ─▶ reprocess      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Both dispatch backends share the command builder and the completion
//! oracle, so a unit that counts as "done" locally is also "done" after a
//! cluster run.

pub mod cancel;
pub mod command;
pub mod config;
pub mod datalad;
pub mod dataset;
pub mod dispatch;
pub mod markers;
pub mod oracle;
pub mod orchestrator;
pub mod planner;
pub mod reprocess;
pub mod validate;

pub use cancel::CancelToken;
pub use config::{AnalysisLevel, Config, ConfigError};
pub use orchestrator::{Orchestrator, RunOptions, RunSummary};
