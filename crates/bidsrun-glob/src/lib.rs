//! bidsrun-glob: glob matching and bounded filesystem probing.
//!
//! Provides:
//! - **glob_match**: shell-style pattern matching with brace expansion
//! - **find_matches**: bounded-depth search for paths matching a pattern
//! - **dir_contains_file**: bounded-depth "does this tree hold any file?"
//!
//! The probing helpers never recurse past their depth bound; completion
//! checks over large derivative trees stay cheap no matter how deep the
//! pipeline nests its outputs.

pub mod glob;
mod probe;

pub use glob::{contains_glob, expand_braces, glob_match};
pub use probe::{dir_contains_file, find_matches, DEFAULT_PROBE_DEPTH};
