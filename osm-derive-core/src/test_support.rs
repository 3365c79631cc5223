//! Test-only builders for OSM elements used by unit and behaviour tests.

use geo::Coord;

use crate::{Element, ElementKind, Member, OsmId, Point, Relation, Tags, Way};

/// Build a tag map from key/value pairs.
pub fn tags(pairs: &[(&str, &str)]) -> Tags {
    pairs
        .iter()
        .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
        .collect()
}

/// Untagged point at `(x, y)`.
pub fn point(id: OsmId, x: f64, y: f64) -> Element {
    Element::Point(Point::new(id, Coord { x, y }))
}

/// Untagged way over `nodes`.
pub fn way(id: OsmId, nodes: &[OsmId]) -> Element {
    Element::Way(Way::new(id, nodes.to_vec()))
}

/// Untagged relation whose members are all ways, given as `(id, role)`.
pub fn way_relation(id: OsmId, members: &[(OsmId, &str)]) -> Element {
    let members = members
        .iter()
        .map(|(way, role)| Member::new(ElementKind::Way, *way, *role))
        .collect();
    Element::Relation(Relation::new(id, members))
}

/// Untagged relation with arbitrary members given as `(kind, id, role)`.
pub fn relation(id: OsmId, members: &[(ElementKind, OsmId, &str)]) -> Element {
    let members = members
        .iter()
        .map(|(kind, member, role)| Member::new(*kind, *member, *role))
        .collect();
    Element::Relation(Relation::new(id, members))
}

/// Points on a regular grid with ids `first..first + count`, one per
/// hundredth of a degree along the diagonal.
pub fn diagonal_points(first: OsmId, count: usize) -> Vec<Element> {
    (0..count)
        .map(|offset| {
            let step = f64::from(u32::try_from(offset).unwrap_or(u32::MAX)) / 100.0;
            let id = first + OsmId::try_from(offset).unwrap_or(OsmId::MAX - first);
            point(id, step, step)
        })
        .collect()
}
