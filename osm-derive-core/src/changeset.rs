//! Change vocabularies and the per-cycle changeset container.
//!
//! Upstream changesets describe what a diff did to the base data
//! (`Created`/`Modified`/`Deleted`). Output changesets describe what a derived
//! table did to its own rows (`Added`/`Modified`/`Deleted`). The two
//! vocabularies are deliberately distinct: a derived event is never an
//! upstream event.

use std::collections::BTreeMap;
use std::fmt;

use crate::OsmId;

/// Action recorded by the diff importer for a base element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpstreamAction {
    /// The element did not exist before the diff.
    Created,
    /// The element existed and was rewritten.
    Modified,
    /// The element was removed.
    Deleted,
}

impl UpstreamAction {
    /// Persisted single-letter code (`C`, `M`, `D`).
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Created => "C",
            Self::Modified => "M",
            Self::Deleted => "D",
        }
    }

    /// Parse a persisted code.
    #[must_use]
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "C" => Some(Self::Created),
            "M" => Some(Self::Modified),
            "D" => Some(Self::Deleted),
            _ => None,
        }
    }

    /// Combine two actions recorded for the same element within one diff.
    ///
    /// The result describes the net effect relative to the state before the
    /// diff: creating then modifying is still a creation, creating then
    /// deleting leaves a deletion the tables can verify, and deleting then
    /// recreating is a modification.
    #[must_use]
    pub const fn merge(self, next: Self) -> Self {
        match (self, next) {
            (Self::Created, Self::Modified) => Self::Created,
            (Self::Deleted, Self::Created | Self::Modified) => Self::Modified,
            (_, later) => later,
        }
    }
}

/// Action recorded by a derived table for one of its own keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputAction {
    /// The key gained a row this cycle.
    Added,
    /// The key's row changed.
    Modified,
    /// The key lost its row.
    Deleted,
}

impl OutputAction {
    /// Persisted single-letter code (`A`, `M`, `D`).
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Added => "A",
            Self::Modified => "M",
            Self::Deleted => "D",
        }
    }

    /// Parse a persisted code.
    #[must_use]
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "A" => Some(Self::Added),
            "M" => Some(Self::Modified),
            "D" => Some(Self::Deleted),
            _ => None,
        }
    }
}

impl fmt::Display for OutputAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Classify a recomputed row against the row stored before the cycle.
///
/// Returns `None` when nothing changed; omission from a changeset means the
/// key is unaffected.
///
/// # Examples
///
/// ```
/// use osm_derive_core::{OutputAction, classify};
///
/// assert_eq!(classify(None, Some(&1)), Some(OutputAction::Added));
/// assert_eq!(classify(Some(&1), Some(&2)), Some(OutputAction::Modified));
/// assert_eq!(classify(Some(&1), None::<&i32>), Some(OutputAction::Deleted));
/// assert_eq!(classify(Some(&1), Some(&1)), None);
/// ```
#[must_use]
pub fn classify<R: PartialEq>(before: Option<&R>, after: Option<&R>) -> Option<OutputAction> {
    match (before, after) {
        (None, None) => None,
        (None, Some(_)) => Some(OutputAction::Added),
        (Some(_), None) => Some(OutputAction::Deleted),
        (Some(old), Some(new)) => (old != new).then_some(OutputAction::Modified),
    }
}

/// Keyed log of actions for one cycle; each key appears at most once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Changeset<A> {
    entries: BTreeMap<OsmId, A>,
}

impl<A> Default for Changeset<A> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<A: Copy> Changeset<A> {
    /// Create an empty changeset.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `action` for `id`, replacing any earlier action.
    pub fn insert(&mut self, id: OsmId, action: A) -> Option<A> {
        self.entries.insert(id, action)
    }

    /// Action recorded for `id`, if any.
    #[must_use]
    pub fn get(&self, id: OsmId) -> Option<A> {
        self.entries.get(&id).copied()
    }

    /// Whether `id` was recorded.
    #[must_use]
    pub fn contains(&self, id: OsmId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Iterate over `(id, action)` pairs in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = (OsmId, A)> + '_ {
        self.entries.iter().map(|(id, action)| (*id, *action))
    }

    /// Iterate over recorded ids in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = OsmId> + '_ {
        self.entries.keys().copied()
    }

    /// Number of recorded keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Changeset<UpstreamAction> {
    /// Record an upstream action, merging with an earlier one for the same id.
    pub fn record(&mut self, id: OsmId, action: UpstreamAction) {
        let merged = self
            .entries
            .get(&id)
            .map_or(action, |previous| previous.merge(action));
        self.entries.insert(id, merged);
    }
}

impl<A: Copy> FromIterator<(OsmId, A)> for Changeset<A> {
    fn from_iter<I: IntoIterator<Item = (OsmId, A)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(UpstreamAction::Created, UpstreamAction::Modified, UpstreamAction::Created)]
    #[case(UpstreamAction::Created, UpstreamAction::Deleted, UpstreamAction::Deleted)]
    #[case(UpstreamAction::Deleted, UpstreamAction::Created, UpstreamAction::Modified)]
    #[case(UpstreamAction::Modified, UpstreamAction::Modified, UpstreamAction::Modified)]
    #[case(UpstreamAction::Modified, UpstreamAction::Deleted, UpstreamAction::Deleted)]
    fn merges_repeated_upstream_actions(
        #[case] first: UpstreamAction,
        #[case] second: UpstreamAction,
        #[case] expected: UpstreamAction,
    ) {
        let mut changeset = Changeset::new();
        changeset.record(5, first);
        changeset.record(5, second);
        assert_eq!(changeset.get(5), Some(expected));
        assert_eq!(changeset.len(), 1);
    }

    #[rstest]
    fn unchanged_rows_are_omitted() {
        let row = vec![1, 2, 3];
        assert_eq!(classify(Some(&row), Some(&row.clone())), None);
        assert_eq!(classify::<Vec<i32>>(None, None), None);
    }

    #[rstest]
    #[case("A", Some(OutputAction::Added))]
    #[case("M", Some(OutputAction::Modified))]
    #[case("D", Some(OutputAction::Deleted))]
    #[case("C", None)]
    fn parses_output_codes(#[case] code: &str, #[case] expected: Option<OutputAction>) {
        assert_eq!(OutputAction::from_code(code), expected);
    }

    #[rstest]
    fn upstream_vocabulary_differs_from_output() {
        assert_eq!(UpstreamAction::from_code("A"), None);
        assert_eq!(UpstreamAction::Created.code(), "C");
    }

    #[rstest]
    fn iterates_in_key_order() {
        let changeset: Changeset<OutputAction> = [
            (9, OutputAction::Deleted),
            (2, OutputAction::Added),
            (5, OutputAction::Modified),
        ]
        .into_iter()
        .collect();
        assert_eq!(changeset.ids().collect::<Vec<_>>(), vec![2, 5, 9]);
    }
}
