//! Core domain types for the osm-derive engine.
//!
//! The crate defines the entity model shared by the base store and every
//! derived table, the changeset vocabulary used to propagate changes between
//! tables, the persistent point index and the geometry wire encoding.
//!
//! Responsibilities:
//! - Model points, ways, relations and their members.
//! - Define upstream and output changeset actions and the classification
//!   rule that turns a recomputed row into an output action.
//! - Persist point coordinates in a disk-resident index.
//!
//! Boundaries:
//! - No database access (lives in `osm-derive-data`).

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use geo::Coord;

pub mod changeset;
pub mod geometry;
pub mod point_index;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use changeset::{Changeset, OutputAction, UpstreamAction, classify};
pub use geometry::{GeometryError, Srid};
pub use point_index::{PointIndex, PointIndexError, PointIndexOptions};

/// Identifier of an OpenStreetMap element.
///
/// Ids are unique per element kind only. Negative ids appear in unpublished
/// editing data and are accepted everywhere.
pub type OsmId = i64;

/// Free-form key/value tags.
///
/// A `BTreeMap` keeps iteration order stable so serialised tags compare
/// byte-for-byte.
pub type Tags = BTreeMap<String, String>;

/// The three kinds of OSM element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ElementKind {
    /// A node with a coordinate.
    Point,
    /// An ordered list of point references.
    Way,
    /// An ordered list of typed members.
    Relation,
}

impl ElementKind {
    /// Single-letter code used in persisted membership rows.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Point => "N",
            Self::Way => "W",
            Self::Relation => "R",
        }
    }

    /// Parse a persisted single-letter code.
    #[must_use]
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "N" => Some(Self::Point),
            "W" => Some(Self::Way),
            "R" => Some(Self::Relation),
            _ => None,
        }
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Point => "point",
            Self::Way => "way",
            Self::Relation => "relation",
        };
        f.write_str(name)
    }
}

/// A node with a WGS84 location (`x = longitude`, `y = latitude`).
///
/// # Examples
///
/// ```
/// use geo::Coord;
/// use osm_derive_core::Point;
///
/// let point = Point::new(3, Coord { x: 10.0, y: 10.0 });
/// assert_eq!(point.id, 3);
/// assert!(point.tags.is_empty());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    /// Unique point id.
    pub id: OsmId,
    /// Location in degrees.
    pub location: Coord<f64>,
    /// Free-form tags.
    pub tags: Tags,
}

impl Point {
    /// Construct an untagged point.
    #[must_use]
    pub fn new(id: OsmId, location: Coord<f64>) -> Self {
        Self {
            id,
            location,
            tags: Tags::new(),
        }
    }

    /// Attach tags to the point.
    #[must_use]
    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }
}

/// An ordered sequence of point references.
///
/// Duplicate references are allowed; a way is closed when its first and
/// last references coincide.
///
/// # Examples
///
/// ```
/// use osm_derive_core::Way;
///
/// let ring = Way::new(1, vec![1, 2, 3, 1]);
/// assert!(ring.is_closed());
/// assert!(!Way::new(2, vec![1, 2]).is_closed());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Way {
    /// Unique way id.
    pub id: OsmId,
    /// Referenced point ids in order.
    pub nodes: Vec<OsmId>,
    /// Free-form tags.
    pub tags: Tags,
}

impl Way {
    /// Construct an untagged way.
    #[must_use]
    pub fn new(id: OsmId, nodes: Vec<OsmId>) -> Self {
        Self {
            id,
            nodes,
            tags: Tags::new(),
        }
    }

    /// Attach tags to the way.
    #[must_use]
    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }

    /// Whether the way forms a ring.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.nodes.len() > 1 && self.nodes.first() == self.nodes.last()
    }
}

/// A typed reference from a relation to another element.
///
/// The member's position inside [`Relation::members`] is its sequence index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    /// Kind of the referenced element.
    pub kind: ElementKind,
    /// Id of the referenced element.
    pub id: OsmId,
    /// Free-form role, possibly empty.
    pub role: String,
}

impl Member {
    /// Construct a member reference.
    #[must_use]
    pub fn new(kind: ElementKind, id: OsmId, role: impl Into<String>) -> Self {
        Self {
            kind,
            id,
            role: role.into(),
        }
    }
}

/// An ordered collection of members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    /// Unique relation id.
    pub id: OsmId,
    /// Members in sequence order.
    pub members: Vec<Member>,
    /// Free-form tags.
    pub tags: Tags,
}

impl Relation {
    /// Construct an untagged relation.
    #[must_use]
    pub fn new(id: OsmId, members: Vec<Member>) -> Self {
        Self {
            id,
            members,
            tags: Tags::new(),
        }
    }

    /// Attach tags to the relation.
    #[must_use]
    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }

    /// Ids of way members in sequence order, duplicates included.
    pub fn way_members(&self) -> impl Iterator<Item = OsmId> + '_ {
        self.members
            .iter()
            .filter(|member| member.kind == ElementKind::Way)
            .map(|member| member.id)
    }
}

/// Any of the three element kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum Element {
    /// A point.
    Point(Point),
    /// A way.
    Way(Way),
    /// A relation.
    Relation(Relation),
}

impl Element {
    /// Kind of the wrapped element.
    #[must_use]
    pub const fn kind(&self) -> ElementKind {
        match self {
            Self::Point(_) => ElementKind::Point,
            Self::Way(_) => ElementKind::Way,
            Self::Relation(_) => ElementKind::Relation,
        }
    }

    /// Id of the wrapped element.
    #[must_use]
    pub const fn id(&self) -> OsmId {
        match self {
            Self::Point(point) => point.id,
            Self::Way(way) => way.id,
            Self::Relation(relation) => relation.id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ElementKind::Point, "N")]
    #[case(ElementKind::Way, "W")]
    #[case(ElementKind::Relation, "R")]
    fn kind_codes_round_trip(#[case] kind: ElementKind, #[case] code: &str) {
        assert_eq!(kind.code(), code);
        assert_eq!(ElementKind::from_code(code), Some(kind));
    }

    #[rstest]
    fn unknown_kind_code_is_rejected() {
        assert_eq!(ElementKind::from_code("X"), None);
    }

    #[rstest]
    #[case(vec![], false)]
    #[case(vec![1], false)]
    #[case(vec![1, 1], true)]
    #[case(vec![1, 2, 3], false)]
    #[case(vec![1, 2, 3, 1], true)]
    fn detects_closed_ways(#[case] nodes: Vec<OsmId>, #[case] closed: bool) {
        assert_eq!(Way::new(1, nodes).is_closed(), closed);
    }

    #[rstest]
    fn way_members_skip_other_kinds() {
        let relation = Relation::new(
            1,
            vec![
                Member::new(ElementKind::Way, 10, "outer"),
                Member::new(ElementKind::Point, 3, "label"),
                Member::new(ElementKind::Relation, 2, ""),
                Member::new(ElementKind::Way, 10, "inner"),
            ],
        );
        assert_eq!(relation.way_members().collect::<Vec<_>>(), vec![10, 10]);
    }

    #[rstest]
    fn element_reports_kind_and_id() {
        let element = Element::Way(Way::new(7, vec![1, 2]));
        assert_eq!(element.kind(), ElementKind::Way);
        assert_eq!(element.id(), 7);
    }
}
