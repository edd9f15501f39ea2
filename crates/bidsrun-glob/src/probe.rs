//! Bounded-depth filesystem probing.
//!
//! Completion checks and validators only ever need shallow looks at the
//! output tree, so every helper here takes an explicit depth bound and
//! refuses to recurse past it. Hidden entries are skipped; directory
//! symlinks are followed once (a visited set breaks cycles).

use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::glob::glob_match;

/// Default traversal depth for completion probing.
pub const DEFAULT_PROBE_DEPTH: usize = 3;

/// Find paths under `root` whose trailing path segments match `pattern`.
///
/// The pattern is split on `/`; a visited entry matches when its last `k`
/// segments (relative to `root`) match the pattern's `k` segments. This
/// makes a one-segment pattern match anywhere under the root, while a
/// multi-segment pattern still pins its own directory shape.
///
/// Results are sorted. A missing or unreadable root yields an empty set.
pub fn find_matches(root: &Path, pattern: &str, max_depth: usize) -> Vec<PathBuf> {
    let segments: Vec<&str> = pattern
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();
    if segments.is_empty() {
        return Vec::new();
    }

    let mut matches = Vec::new();
    let mut visited = HashSet::new();
    walk(root, root, &segments, max_depth, &mut visited, &mut |path| {
        matches.push(path.to_path_buf());
    });
    matches.sort();
    matches
}

/// True when `dir` holds at least one regular file within the depth bound.
pub fn dir_contains_file(dir: &Path, max_depth: usize) -> bool {
    let mut found = false;
    let mut visited = HashSet::new();
    scan_for_file(dir, max_depth, &mut visited, &mut found);
    found
}

fn walk(
    root: &Path,
    dir: &Path,
    segments: &[&str],
    depth_left: usize,
    visited: &mut HashSet<PathBuf>,
    on_match: &mut dyn FnMut(&Path),
) {
    if !mark_visited(dir, visited) {
        return;
    }
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') {
            continue;
        }
        let path = entry.path();
        if tail_matches(root, &path, segments) {
            on_match(&path);
        }
        if depth_left > 1 && path.is_dir() {
            walk(root, &path, segments, depth_left - 1, visited, on_match);
        }
    }
}

/// Match the last `segments.len()` components of `path` (relative to `root`)
/// against the pattern segments.
fn tail_matches(root: &Path, path: &Path, segments: &[&str]) -> bool {
    let rel = match path.strip_prefix(root) {
        Ok(rel) => rel,
        Err(_) => return false,
    };
    let parts: Vec<String> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(os) => Some(os.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.len() < segments.len() {
        return false;
    }
    let tail = &parts[parts.len() - segments.len()..];
    tail.iter()
        .zip(segments.iter())
        .all(|(part, pat)| glob_match(pat, part))
}

fn scan_for_file(
    dir: &Path,
    depth_left: usize,
    visited: &mut HashSet<PathBuf>,
    found: &mut bool,
) {
    if *found || !mark_visited(dir, visited) {
        return;
    }
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        if *found {
            return;
        }
        let name = entry.file_name();
        if name.to_string_lossy().starts_with('.') {
            continue;
        }
        let path = entry.path();
        if path.is_file() {
            *found = true;
            return;
        }
        if depth_left > 1 && path.is_dir() {
            scan_for_file(&path, depth_left - 1, visited, found);
        }
    }
}

/// Record a directory in the visited set; false when already seen
/// (symlink cycle) so the caller skips it.
fn mark_visited(dir: &Path, visited: &mut HashSet<PathBuf>) -> bool {
    let key = fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
    visited.insert(key)
}
