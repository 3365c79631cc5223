//! In-memory representation of a change set against the base data.

use osm_derive_core::{Element, ElementKind, OsmId};

use crate::opl::{self, OplError};

/// One change to a base element.
#[derive(Debug, Clone, PartialEq)]
pub enum DiffEntry {
    /// Create the element, or replace it wholesale if it exists.
    Upsert(Element),
    /// Remove the element if it exists.
    Delete {
        /// Kind of the removed element.
        kind: ElementKind,
        /// Id of the removed element.
        id: OsmId,
    },
}

impl DiffEntry {
    /// Kind of the affected element.
    #[must_use]
    pub const fn kind(&self) -> ElementKind {
        match self {
            Self::Upsert(element) => element.kind(),
            Self::Delete { kind, .. } => *kind,
        }
    }

    /// Id of the affected element.
    #[must_use]
    pub const fn id(&self) -> OsmId {
        match self {
            Self::Upsert(element) => element.id(),
            Self::Delete { id, .. } => *id,
        }
    }
}

/// Ordered list of changes applied as one unit.
///
/// Entries are applied in order; the same element may appear more than once.
///
/// # Examples
///
/// ```
/// use osm_derive_core::ElementKind;
/// use osm_derive_data::Diff;
///
/// let diff = Diff::from_opl("w1 v1 Nn1,n2\nr2 v2 dD\n").expect("valid OPL");
/// assert_eq!(diff.len(), 2);
/// assert_eq!(diff.entries()[1].kind(), ElementKind::Relation);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Diff {
    entries: Vec<DiffEntry>,
}

impl Diff {
    /// Create an empty diff.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse OPL text, one object per line.
    pub fn from_opl(text: &str) -> Result<Self, OplError> {
        opl::parse(text)
    }

    /// Append a create-or-replace entry.
    pub fn upsert(&mut self, element: Element) -> &mut Self {
        self.entries.push(DiffEntry::Upsert(element));
        self
    }

    /// Append a deletion.
    pub fn delete(&mut self, kind: ElementKind, id: OsmId) -> &mut Self {
        self.entries.push(DiffEntry::Delete { kind, id });
        self
    }

    /// Entries in application order.
    #[must_use]
    pub fn entries(&self) -> &[DiffEntry] {
        &self.entries
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the diff has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Upserted elements in order, dropping deletions.
    ///
    /// Used when a diff-formatted file seeds an empty database.
    pub fn into_elements(self) -> impl Iterator<Item = Element> {
        self.entries.into_iter().filter_map(|entry| match entry {
            DiffEntry::Upsert(element) => Some(element),
            DiffEntry::Delete { .. } => None,
        })
    }
}

impl FromIterator<DiffEntry> for Diff {
    fn from_iter<I: IntoIterator<Item = DiffEntry>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl Extend<DiffEntry> for Diff {
    fn extend<I: IntoIterator<Item = DiffEntry>>(&mut self, iter: I) {
        self.entries.extend(iter);
    }
}
