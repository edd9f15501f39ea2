//! Unit — the atomic scheduling granularity.
//!
//! A unit is one subject, optionally narrowed to a single session when the
//! dataset (or the pipeline) is session-aware. Ids are stored without their
//! BIDS prefixes (`sub-`, `ses-`) and rendered with them.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Reserved subject id for the group-level pseudo-unit.
const GROUP_SUBJECT: &str = "group";

/// A unit of work: `(subject, optional session)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Unit {
    /// Subject id without the `sub-` prefix.
    pub subject: String,
    /// Session id without the `ses-` prefix, when session-scoped.
    pub session: Option<String>,
}

impl Unit {
    /// Create a subject-level unit. The id may carry a `sub-` prefix.
    pub fn subject(id: impl AsRef<str>) -> Self {
        Self {
            subject: normalize_subject(id.as_ref()),
            session: None,
        }
    }

    /// Create a session-scoped unit. Ids may carry their BIDS prefixes.
    pub fn session(subject: impl AsRef<str>, session: impl AsRef<str>) -> Self {
        Self {
            subject: normalize_subject(subject.as_ref()),
            session: Some(normalize_session(session.as_ref())),
        }
    }

    /// The pseudo-unit used for group-level analysis.
    pub fn group() -> Self {
        Self {
            subject: GROUP_SUBJECT.to_string(),
            session: None,
        }
    }

    /// True for the group-level pseudo-unit.
    pub fn is_group(&self) -> bool {
        self.subject == GROUP_SUBJECT && self.session.is_none()
    }

    /// The subject rendered with its BIDS prefix, e.g. `sub-001`.
    pub fn bids_subject(&self) -> String {
        if self.is_group() {
            return GROUP_SUBJECT.to_string();
        }
        format!("sub-{}", self.subject)
    }

    /// The session rendered with its BIDS prefix, e.g. `ses-01`.
    pub fn bids_session(&self) -> Option<String> {
        self.session.as_ref().map(|s| format!("ses-{s}"))
    }

    /// File-name-safe key used for markers, logs, and job scripts:
    /// `001` or `001_ses-01`.
    pub fn key(&self) -> String {
        match &self.session {
            Some(ses) => format!("{}_ses-{}", self.subject, ses),
            None => self.subject.clone(),
        }
    }

    /// Ordering key: natural sort on subject, then session.
    fn cmp_key(&self, other: &Self) -> Ordering {
        natural_cmp(&self.subject, &other.subject).then_with(|| {
            match (&self.session, &other.session) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(a), Some(b)) => natural_cmp(a, b),
            }
        })
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bids_subject())?;
        if let Some(ses) = self.bids_session() {
            write!(f, " {ses}")?;
        }
        Ok(())
    }
}

impl PartialOrd for Unit {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Unit {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp_key(other)
    }
}

/// Strip the `sub-` prefix if present.
pub fn normalize_subject(raw: &str) -> String {
    raw.strip_prefix("sub-").unwrap_or(raw).to_string()
}

/// Strip the `ses-` prefix if present.
pub fn normalize_session(raw: &str) -> String {
    raw.strip_prefix("ses-").unwrap_or(raw).to_string()
}

/// Natural-sort comparison: digit runs compare numerically, everything else
/// byte-wise. `sub-2` sorts before `sub-10`.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut ia = a.chars().peekable();
    let mut ib = b.chars().peekable();

    loop {
        match (ia.peek().copied(), ib.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(ca), Some(cb)) => {
                if ca.is_ascii_digit() && cb.is_ascii_digit() {
                    let na = take_digits(&mut ia);
                    let nb = take_digits(&mut ib);
                    // Compare numerically: longer (trimmed) run wins, then lexicographic.
                    let ta = na.trim_start_matches('0');
                    let tb = nb.trim_start_matches('0');
                    let ord = ta
                        .len()
                        .cmp(&tb.len())
                        .then_with(|| ta.cmp(tb))
                        .then_with(|| na.len().cmp(&nb.len()));
                    if ord != Ordering::Equal {
                        return ord;
                    }
                } else {
                    let ord = ca.cmp(&cb);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                    ia.next();
                    ib.next();
                }
            }
        }
    }
}

fn take_digits(it: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut out = String::new();
    while let Some(c) = it.peek() {
        if c.is_ascii_digit() {
            out.push(*c);
            it.next();
        } else {
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_prefix_once() {
        assert_eq!(normalize_subject("sub-001"), "001");
        assert_eq!(normalize_subject("001"), "001");
        assert_eq!(normalize_session("ses-baseline"), "baseline");
        assert_eq!(normalize_session("baseline"), "baseline");
    }

    #[test]
    fn round_trip_rendering() {
        let unit = Unit::subject("sub-001");
        assert_eq!(unit.subject, "001");
        assert_eq!(unit.bids_subject(), "sub-001");
        assert_eq!(Unit::subject("001"), unit);
    }

    #[test]
    fn key_includes_session() {
        assert_eq!(Unit::subject("007").key(), "007");
        assert_eq!(Unit::session("007", "ses-02").key(), "007_ses-02");
    }

    #[test]
    fn natural_order_sorts_numerically() {
        assert_eq!(natural_cmp("sub-2", "sub-10"), Ordering::Less);
        assert_eq!(natural_cmp("sub-10", "sub-2"), Ordering::Greater);
        assert_eq!(natural_cmp("a", "a"), Ordering::Equal);
        assert_eq!(natural_cmp("02", "2"), Ordering::Greater);
    }

    #[test]
    fn units_order_subject_then_session() {
        let mut units = vec![
            Unit::session("002", "02"),
            Unit::subject("002"),
            Unit::session("002", "01"),
            Unit::subject("001"),
        ];
        units.sort();
        assert_eq!(
            units,
            vec![
                Unit::subject("001"),
                Unit::subject("002"),
                Unit::session("002", "01"),
                Unit::session("002", "02"),
            ]
        );
    }

    #[test]
    fn group_unit_renders_without_prefix() {
        let g = Unit::group();
        assert!(g.is_group());
        assert_eq!(g.bids_subject(), "group");
        assert_eq!(g.key(), "group");
    }
}
