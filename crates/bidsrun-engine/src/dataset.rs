//! Dataset walker — enumerate subjects (and optionally sessions) from a
//! BIDS-shaped tree: `<root>/sub-XXX/[ses-YYY/][anat|func|dwi|fmap]/…`.
//!
//! The walker only lists directories. Content-addressed datasets keep file
//! bodies elsewhere; directory structure is all that is needed here.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::warn;

use bidsrun_types::{natural_cmp, normalize_subject, Unit};

/// Errors while enumerating the dataset. Fatal at plan time.
#[derive(Debug, Error)]
pub enum WalkError {
    #[error("cannot list dataset root {path}: {source}")]
    Unlistable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("subjects not found in dataset: {}", .0.join(", "))]
    UnknownSubjects(Vec<String>),
}

/// List units in deterministic natural-sort order.
///
/// `filter` restricts the walk to the given subjects (ids with or without
/// the `sub-` prefix); an entry that matches nothing is an error. With
/// `session_aware` set, each subject expands to one unit per `ses-*`
/// directory; a subject without sessions then contributes nothing and is
/// warned about.
pub fn walk_units(
    root: &Path,
    filter: Option<&[String]>,
    session_aware: bool,
) -> Result<Vec<Unit>, WalkError> {
    let mut subjects = list_prefixed_dirs(root, "sub-").map_err(|source| WalkError::Unlistable {
        path: root.to_path_buf(),
        source,
    })?;
    subjects.sort_by(|a, b| natural_cmp(a, b));

    if let Some(wanted) = filter {
        let wanted: Vec<String> = wanted.iter().map(|s| normalize_subject(s)).collect();
        let missing: Vec<String> = wanted
            .iter()
            .filter(|id| !subjects.iter().any(|s| s == *id))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(WalkError::UnknownSubjects(missing));
        }
        subjects.retain(|s| wanted.iter().any(|id| id == s));
    }

    let mut units = Vec::new();
    for subject in subjects {
        if !session_aware {
            units.push(Unit::subject(&subject));
            continue;
        }
        let subject_dir = root.join(format!("sub-{subject}"));
        let mut sessions = list_prefixed_dirs(&subject_dir, "ses-").unwrap_or_default();
        sessions.sort_by(|a, b| natural_cmp(a, b));
        if sessions.is_empty() {
            warn!(subject = %subject, "session-aware walk found no sessions; skipping subject");
            continue;
        }
        for session in sessions {
            units.push(Unit::session(&subject, &session));
        }
    }
    Ok(units)
}

/// List the sessions of one subject (bare ids, natural order).
pub fn subject_sessions(root: &Path, subject: &str) -> Vec<String> {
    let subject_dir = root.join(format!("sub-{}", normalize_subject(subject)));
    let mut sessions = list_prefixed_dirs(&subject_dir, "ses-").unwrap_or_default();
    sessions.sort_by(|a, b| natural_cmp(a, b));
    sessions
}

/// Directory names under `dir` starting with `prefix`, with the prefix
/// stripped. Hidden entries are skipped; symlinked directories count.
fn list_prefixed_dirs(dir: &Path, prefix: &str) -> io::Result<Vec<String>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') {
            continue;
        }
        if let Some(id) = name.strip_prefix(prefix) {
            // entry.path().is_dir() follows symlinks once.
            if !id.is_empty() && entry.path().is_dir() {
                out.push(id.to_string());
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn dataset(subjects: &[(&str, &[&str])]) -> TempDir {
        let tmp = TempDir::new().unwrap();
        for (subject, sessions) in subjects {
            let dir = tmp.path().join(subject);
            fs::create_dir_all(&dir).unwrap();
            for session in *sessions {
                fs::create_dir_all(dir.join(session)).unwrap();
            }
        }
        tmp
    }

    #[test]
    fn subjects_come_back_in_natural_order() {
        let tmp = dataset(&[("sub-10", &[]), ("sub-2", &[]), ("sub-1", &[])]);
        let units = walk_units(tmp.path(), None, false).unwrap();
        assert_eq!(
            units,
            vec![Unit::subject("1"), Unit::subject("2"), Unit::subject("10")]
        );
    }

    #[test]
    fn hidden_and_non_subject_entries_are_ignored() {
        let tmp = dataset(&[("sub-01", &[])]);
        fs::create_dir_all(tmp.path().join(".git")).unwrap();
        fs::create_dir_all(tmp.path().join("derivatives")).unwrap();
        fs::write(tmp.path().join("sub-02"), b"a file, not a dir").unwrap();

        let units = walk_units(tmp.path(), None, false).unwrap();
        assert_eq!(units, vec![Unit::subject("01")]);
    }

    #[test]
    fn session_aware_expands_sessions() {
        let tmp = dataset(&[("sub-01", &["ses-02", "ses-01"]), ("sub-02", &[])]);
        let units = walk_units(tmp.path(), None, true).unwrap();
        // sub-02 has no sessions and drops out with a warning.
        assert_eq!(
            units,
            vec![Unit::session("01", "01"), Unit::session("01", "02")]
        );
    }

    #[test]
    fn filter_restricts_and_flags_unknown() {
        let tmp = dataset(&[("sub-01", &[]), ("sub-02", &[]), ("sub-03", &[])]);
        let units = walk_units(
            tmp.path(),
            Some(&["sub-03".to_string(), "01".to_string()]),
            false,
        )
        .unwrap();
        assert_eq!(units, vec![Unit::subject("01"), Unit::subject("03")]);

        let err = walk_units(tmp.path(), Some(&["09".to_string()]), false).unwrap_err();
        assert!(matches!(err, WalkError::UnknownSubjects(ref ids) if ids == &["09"]));
    }

    #[test]
    fn missing_root_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let err = walk_units(&tmp.path().join("nope"), None, false).unwrap_err();
        assert!(matches!(err, WalkError::Unlistable { .. }));
    }

    #[test]
    fn zero_subjects_is_an_empty_walk() {
        let tmp = TempDir::new().unwrap();
        assert!(walk_units(tmp.path(), None, false).unwrap().is_empty());
    }
}
