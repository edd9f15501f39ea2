//! Success markers — small files recording completed units.
//!
//! Markers live in a reserved subdirectory of the output root, keyed by
//! unit id. They are written by the dispatcher on success and by nothing
//! else. Writes use create-exclusive semantics: two writes for the same
//! unit in one run mean the planner produced a duplicate, which is a bug
//! worth failing loudly on.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;

use bidsrun_types::Unit;

/// Reserved marker directory under the output root.
pub const MARKER_DIR: &str = ".bidsrun";

/// Path of the marker for one unit.
pub fn marker_path(output_root: &Path, unit: &Unit) -> PathBuf {
    output_root
        .join(MARKER_DIR)
        .join(format!("{}_success", unit.key()))
}

/// True when the unit's marker exists.
pub fn marker_exists(output_root: &Path, unit: &Unit) -> bool {
    marker_path(output_root, unit).is_file()
}

/// Write the unit's marker. Fails with `AlreadyExists` if the marker is
/// present, which callers treat as a duplicate-dispatch bug.
pub fn write_marker(output_root: &Path, unit: &Unit, tool_version: &str) -> io::Result<()> {
    let path = marker_path(output_root, unit);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().write(true).create_new(true).open(&path)?;
    writeln!(file, "bidsrun {tool_version}")?;
    writeln!(file, "completed: {}", Utc::now().to_rfc3339())?;
    file.sync_all()
}

/// Remove a unit's marker if present (used by force re-runs).
pub fn clear_marker(output_root: &Path, unit: &Unit) -> io::Result<()> {
    match fs::remove_file(marker_path(output_root, unit)) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
