//! Reader for the OPL text format, one OSM object per line.
//!
//! ```text
//! n10 v1 dV Tamenity=bench x8.1 y47.3
//! w1 v2 dV Thighway=path Nn10,n11
//! r2 v2 dV Ttype=route Mw1@forward,n10@stop
//! r3 v4 dD
//! ```
//!
//! Metadata fields (`v`, `c`, `t`, `i`, `u`) are accepted and ignored. A
//! `dD` field marks the object as deleted. Tags, user names and member roles
//! use `%xx%` escapes where `xx` is a hexadecimal code point.

use std::collections::BTreeMap;

use geo::Coord;
use osm_derive_core::{Element, ElementKind, Member, OsmId, Point, Relation, Tags, Way};
use thiserror::Error;

use crate::diff::{Diff, DiffEntry};

/// A malformed line in OPL input.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed OPL on line {line}: {reason}")]
pub struct OplError {
    /// One-based line number.
    pub line: usize,
    /// What was wrong with the line.
    #[source]
    pub reason: OplReason,
}

/// Reasons an OPL line is rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OplReason {
    /// The object type prefix is not `n`, `w` or `r`.
    #[error("unknown object type in {0:?}")]
    UnknownType(String),
    /// An id could not be parsed.
    #[error("invalid id {0:?}")]
    InvalidId(String),
    /// A field prefix is not part of the format.
    #[error("unknown field {0:?}")]
    UnknownField(char),
    /// A numeric field could not be parsed.
    #[error("invalid value {value:?} for field {field:?}")]
    InvalidValue {
        /// Field prefix.
        field: char,
        /// Raw value.
        value: String,
    },
    /// A visible point lacks a coordinate.
    #[error("point is missing its {0} coordinate")]
    MissingCoordinate(&'static str),
    /// A tag lacks the `=` separator.
    #[error("invalid tag {0:?}")]
    InvalidTag(String),
    /// A node reference is not of the form `n<id>`.
    #[error("invalid node reference {0:?}")]
    InvalidNodeRef(String),
    /// A member is not of the form `<type><id>@<role>`.
    #[error("invalid member {0:?}")]
    InvalidMember(String),
    /// A `%xx%` escape is unterminated or not a valid code point.
    #[error("invalid escape in {0:?}")]
    InvalidEscape(String),
}

/// Parse a complete OPL document. Blank lines are skipped.
pub(crate) fn parse(text: &str) -> Result<Diff, OplError> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            parse_line(line.trim()).map_err(|reason| OplError {
                line: index + 1,
                reason,
            })
        })
        .collect()
}

#[derive(Default)]
struct Fields<'a> {
    deleted: bool,
    tags: Option<&'a str>,
    x: Option<&'a str>,
    y: Option<&'a str>,
    nodes: Option<&'a str>,
    members: Option<&'a str>,
}

fn parse_line(line: &str) -> Result<DiffEntry, OplReason> {
    let mut tokens = line.split_whitespace();
    let head = tokens.next().unwrap_or_default();
    let mut head_chars = head.chars();
    let kind = match head_chars.next() {
        Some('n') => ElementKind::Point,
        Some('w') => ElementKind::Way,
        Some('r') => ElementKind::Relation,
        _ => return Err(OplReason::UnknownType(head.to_owned())),
    };
    let id = parse_id(head_chars.as_str())?;

    let mut fields = Fields::default();
    for token in tokens {
        let mut chars = token.chars();
        let Some(prefix) = chars.next() else {
            continue;
        };
        let value = chars.as_str();
        match prefix {
            'v' | 'c' | 't' | 'i' | 'u' => {}
            'd' => match value {
                "D" => fields.deleted = true,
                "V" | "" => fields.deleted = false,
                other => {
                    return Err(OplReason::InvalidValue {
                        field: 'd',
                        value: other.to_owned(),
                    });
                }
            },
            'T' => fields.tags = Some(value),
            'x' => fields.x = Some(value),
            'y' => fields.y = Some(value),
            'N' => fields.nodes = Some(value),
            'M' => fields.members = Some(value),
            other => return Err(OplReason::UnknownField(other)),
        }
    }

    if fields.deleted {
        return Ok(DiffEntry::Delete { kind, id });
    }

    let tags = parse_tags(fields.tags.unwrap_or_default())?;
    let element = match kind {
        ElementKind::Point => {
            let x = parse_coordinate('x', fields.x, "x")?;
            let y = parse_coordinate('y', fields.y, "y")?;
            Element::Point(Point::new(id, Coord { x, y }).with_tags(tags))
        }
        ElementKind::Way => {
            let nodes = parse_nodes(fields.nodes.unwrap_or_default())?;
            Element::Way(Way::new(id, nodes).with_tags(tags))
        }
        ElementKind::Relation => {
            let members = parse_members(fields.members.unwrap_or_default())?;
            Element::Relation(Relation::new(id, members).with_tags(tags))
        }
    };
    Ok(DiffEntry::Upsert(element))
}

fn parse_id(raw: &str) -> Result<OsmId, OplReason> {
    raw.parse()
        .map_err(|_| OplReason::InvalidId(raw.to_owned()))
}

fn parse_coordinate(
    field: char,
    value: Option<&str>,
    axis: &'static str,
) -> Result<f64, OplReason> {
    let raw = value
        .filter(|raw| !raw.is_empty())
        .ok_or(OplReason::MissingCoordinate(axis))?;
    raw.parse::<f64>()
        .ok()
        .filter(|parsed| parsed.is_finite())
        .ok_or_else(|| OplReason::InvalidValue {
            field,
            value: raw.to_owned(),
        })
}

fn parse_tags(raw: &str) -> Result<Tags, OplReason> {
    let mut tags = BTreeMap::new();
    for pair in raw.split(',').filter(|pair| !pair.is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| OplReason::InvalidTag(pair.to_owned()))?;
        tags.insert(unescape(key)?, unescape(value)?);
    }
    Ok(tags)
}

fn parse_nodes(raw: &str) -> Result<Vec<OsmId>, OplReason> {
    raw.split(',')
        .filter(|node| !node.is_empty())
        .map(|node| {
            node.strip_prefix('n')
                .and_then(|id| id.parse().ok())
                .ok_or_else(|| OplReason::InvalidNodeRef(node.to_owned()))
        })
        .collect()
}

fn parse_members(raw: &str) -> Result<Vec<Member>, OplReason> {
    raw.split(',')
        .filter(|member| !member.is_empty())
        .map(|member| {
            let invalid = || OplReason::InvalidMember(member.to_owned());
            let (reference, role) = member.split_once('@').ok_or_else(invalid)?;
            let mut chars = reference.chars();
            let kind = match chars.next() {
                Some('n') => ElementKind::Point,
                Some('w') => ElementKind::Way,
                Some('r') => ElementKind::Relation,
                _ => return Err(invalid()),
            };
            let id = chars.as_str().parse().map_err(|_| invalid())?;
            Ok(Member::new(kind, id, unescape(role)?))
        })
        .collect()
}

fn unescape(raw: &str) -> Result<String, OplReason> {
    if !raw.contains('%') {
        return Ok(raw.to_owned());
    }
    let invalid = || OplReason::InvalidEscape(raw.to_owned());
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some((before, after)) = rest.split_once('%') {
        out.push_str(before);
        let (hex, remainder) = after.split_once('%').ok_or_else(invalid)?;
        let code = u32::from_str_radix(hex, 16).map_err(|_| invalid())?;
        out.push(char::from_u32(code).ok_or_else(invalid)?);
        rest = remainder;
    }
    out.push_str(rest);
    Ok(out)
}
