//! Conversion from decoded PBF elements to the entity model.

use geo::Coord;
use osm_derive_core::{Element, ElementKind, Member, OsmId, Point, Relation, Tags, Way};
use osmpbf::RelMemberType;

/// Result of converting one PBF element.
#[derive(Debug)]
pub(super) enum Converted {
    /// A storable element.
    Element(Element),
    /// A node whose coordinates are outside the WGS84 range.
    InvalidPoint(OsmId),
}

pub(super) fn convert(element: osmpbf::Element<'_>) -> Result<Converted, osmpbf::Error> {
    let converted = match element {
        osmpbf::Element::Node(node) => point(node.id(), node.lon(), node.lat(), node.tags()),
        osmpbf::Element::DenseNode(node) => point(node.id(), node.lon(), node.lat(), node.tags()),
        osmpbf::Element::Way(way) => Converted::Element(Element::Way(
            Way::new(way.id(), way.refs().collect()).with_tags(collect_tags(way.tags())),
        )),
        osmpbf::Element::Relation(relation) => {
            let mut members = Vec::new();
            for member in relation.members() {
                let kind = match member.member_type {
                    RelMemberType::Node => ElementKind::Point,
                    RelMemberType::Way => ElementKind::Way,
                    RelMemberType::Relation => ElementKind::Relation,
                };
                members.push(Member::new(kind, member.member_id, member.role()?));
            }
            Converted::Element(Element::Relation(
                Relation::new(relation.id(), members).with_tags(collect_tags(relation.tags())),
            ))
        }
    };
    Ok(converted)
}

fn point<'a, T>(id: OsmId, lon: f64, lat: f64, tags: T) -> Converted
where
    T: IntoIterator<Item = (&'a str, &'a str)>,
{
    match validated_coord(lon, lat) {
        Some(location) => Converted::Element(Element::Point(
            Point::new(id, location).with_tags(collect_tags(tags)),
        )),
        None => Converted::InvalidPoint(id),
    }
}

fn collect_tags<'a, T>(tags: T) -> Tags
where
    T: IntoIterator<Item = (&'a str, &'a str)>,
{
    tags.into_iter()
        .map(|(key, value)| (key.to_owned(), value.to_owned()))
        .collect()
}

pub(super) fn validated_coord(lon: f64, lat: f64) -> Option<Coord<f64>> {
    (lon.is_finite()
        && lat.is_finite()
        && (-180.0..=180.0).contains(&lon)
        && (-90.0..=90.0).contains(&lat))
    .then_some(Coord { x: lon, y: lat })
}
