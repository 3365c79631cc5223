//! SQLite base entity store and upstream changeset log.
//!
//! The module is split into two parts:
//! - [`schema`] materialises the base tables, changeset tables and indexes.
//! - this module reads and writes base elements and records what a diff did
//!   to them.
//!
//! Node lists and tags are stored as JSON text. Every function takes a plain
//! `&Connection` so callers decide the transaction boundaries.
#![forbid(unsafe_code)]

mod schema;

use geo::Coord;
use log::debug;
use osm_derive_core::{
    Changeset, Element, ElementKind, Member, OsmId, Point, Relation, Tags, UpstreamAction, Way,
};
use rusqlite::{Connection, Error as SqliteError, OptionalExtension};
use thiserror::Error;

use crate::diff::{Diff, DiffEntry};

pub use schema::{SCHEMA_VERSION, SchemaError, initialise_schema};

/// Errors raised by the base store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A SQLite statement failed.
    #[error("base store operation '{operation}' failed")]
    Sqlite {
        /// Operation being performed.
        operation: &'static str,
        /// Source error returned by `rusqlite`.
        #[source]
        source: SqliteError,
    },
    /// Encoding a node list or tags as JSON failed.
    #[error("failed to encode {kind} {id} as JSON")]
    Encode {
        /// Kind of the element being written.
        kind: ElementKind,
        /// Id of the element being written.
        id: OsmId,
        /// Source error produced by `serde_json`.
        #[source]
        source: serde_json::Error,
    },
    /// A stored JSON column could not be decoded.
    #[error("failed to decode column {column} of {kind} {id}")]
    Decode {
        /// Kind of the element being read.
        kind: ElementKind,
        /// Id of the element being read.
        id: OsmId,
        /// Column holding the JSON text.
        column: &'static str,
        /// Source error produced by `serde_json`.
        #[source]
        source: serde_json::Error,
    },
    /// A changeset row holds an unknown action code.
    #[error("changeset for {kind} {id} holds unknown action {code:?}")]
    UnknownAction {
        /// Kind whose changeset was read.
        kind: ElementKind,
        /// Id of the changeset row.
        id: OsmId,
        /// Raw action code.
        code: String,
    },
    /// A membership row holds an unknown member type.
    #[error("relation {relation_id} has a member of unknown type {code:?}")]
    UnknownMemberType {
        /// Relation owning the member.
        relation_id: OsmId,
        /// Raw member type code.
        code: String,
    },
    /// Schema initialisation failed.
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

fn sqlite(operation: &'static str) -> impl FnOnce(SqliteError) -> StoreError {
    move |source| StoreError::Sqlite { operation, source }
}

/// Changes a diff made to the base data, one changeset per element kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpstreamChangesets {
    /// Point changes.
    pub points: Changeset<UpstreamAction>,
    /// Way changes.
    pub ways: Changeset<UpstreamAction>,
    /// Relation changes.
    pub relations: Changeset<UpstreamAction>,
}

impl UpstreamChangesets {
    /// Changeset for `kind`.
    #[must_use]
    pub const fn get(&self, kind: ElementKind) -> &Changeset<UpstreamAction> {
        match kind {
            ElementKind::Point => &self.points,
            ElementKind::Way => &self.ways,
            ElementKind::Relation => &self.relations,
        }
    }

    fn get_mut(&mut self, kind: ElementKind) -> &mut Changeset<UpstreamAction> {
        match kind {
            ElementKind::Point => &mut self.points,
            ElementKind::Way => &mut self.ways,
            ElementKind::Relation => &mut self.relations,
        }
    }

    /// Whether no base element changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty() && self.ways.is_empty() && self.relations.is_empty()
    }
}

/// Number of elements written by a bulk load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ElementCounts {
    /// Points written.
    pub points: u64,
    /// Ways written.
    pub ways: u64,
    /// Relations written.
    pub relations: u64,
}

impl ElementCounts {
    pub(crate) fn record(&mut self, kind: ElementKind) {
        match kind {
            ElementKind::Point => self.points += 1,
            ElementKind::Way => self.ways += 1,
            ElementKind::Relation => self.relations += 1,
        }
    }
}

const fn base_table(kind: ElementKind) -> &'static str {
    match kind {
        ElementKind::Point => "points",
        ElementKind::Way => "ways",
        ElementKind::Relation => "relations",
    }
}

const fn changeset_table(kind: ElementKind) -> &'static str {
    match kind {
        ElementKind::Point => "point_changeset",
        ElementKind::Way => "way_changeset",
        ElementKind::Relation => "relation_changeset",
    }
}

const KINDS: [ElementKind; 3] = [ElementKind::Point, ElementKind::Way, ElementKind::Relation];

fn encode<T: serde::Serialize>(
    kind: ElementKind,
    id: OsmId,
    value: &T,
) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|source| StoreError::Encode { kind, id, source })
}

fn decode<T: serde::de::DeserializeOwned>(
    kind: ElementKind,
    id: OsmId,
    column: &'static str,
    text: &str,
) -> Result<T, StoreError> {
    serde_json::from_str(text).map_err(|source| StoreError::Decode {
        kind,
        id,
        column,
        source,
    })
}

/// Create or replace an element. Relation members are replaced wholesale.
pub fn insert_element(connection: &Connection, element: &Element) -> Result<(), StoreError> {
    match element {
        Element::Point(point) => {
            let tags = encode(ElementKind::Point, point.id, &point.tags)?;
            connection
                .prepare_cached(
                    "INSERT OR REPLACE INTO points (id, lon, lat, tags) VALUES (?1, ?2, ?3, ?4)",
                )
                .map_err(sqlite("prepare point insert"))?
                .execute((point.id, point.location.x, point.location.y, tags))
                .map_err(sqlite("insert point"))?;
        }
        Element::Way(way) => {
            let nodes = encode(ElementKind::Way, way.id, &way.nodes)?;
            let tags = encode(ElementKind::Way, way.id, &way.tags)?;
            connection
                .prepare_cached("INSERT OR REPLACE INTO ways (id, nodes, tags) VALUES (?1, ?2, ?3)")
                .map_err(sqlite("prepare way insert"))?
                .execute((way.id, nodes, tags))
                .map_err(sqlite("insert way"))?;
        }
        Element::Relation(relation) => {
            let tags = encode(ElementKind::Relation, relation.id, &relation.tags)?;
            connection
                .prepare_cached("INSERT OR REPLACE INTO relations (id, tags) VALUES (?1, ?2)")
                .map_err(sqlite("prepare relation insert"))?
                .execute((relation.id, tags))
                .map_err(sqlite("insert relation"))?;
            replace_members(connection, relation)?;
        }
    }
    Ok(())
}

fn replace_members(connection: &Connection, relation: &Relation) -> Result<(), StoreError> {
    connection
        .prepare_cached("DELETE FROM relation_members WHERE relation_id = ?1")
        .map_err(sqlite("prepare member removal"))?
        .execute([relation.id])
        .map_err(sqlite("remove relation members"))?;
    let mut insert = connection
        .prepare_cached(
            "INSERT INTO relation_members (
                relation_id, member_id, member_type, member_role, sequence_id
            ) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .map_err(sqlite("prepare member insert"))?;
    for (sequence, member) in relation.members.iter().enumerate() {
        let sequence = i64::try_from(sequence).unwrap_or(i64::MAX);
        insert
            .execute((
                relation.id,
                member.id,
                member.kind.code(),
                member.role.as_str(),
                sequence,
            ))
            .map_err(sqlite("insert relation member"))?;
    }
    Ok(())
}

/// Remove an element, returning whether it existed.
pub fn delete_element(
    connection: &Connection,
    kind: ElementKind,
    id: OsmId,
) -> Result<bool, StoreError> {
    if kind == ElementKind::Relation {
        connection
            .prepare_cached("DELETE FROM relation_members WHERE relation_id = ?1")
            .map_err(sqlite("prepare member removal"))?
            .execute([id])
            .map_err(sqlite("remove relation members"))?;
    }
    let sql = format!("DELETE FROM {} WHERE id = ?1", base_table(kind));
    let removed = connection
        .prepare_cached(&sql)
        .map_err(sqlite("prepare element removal"))?
        .execute([id])
        .map_err(sqlite("remove element"))?;
    Ok(removed > 0)
}

/// Whether an element of `kind` with `id` is stored.
pub fn element_exists(
    connection: &Connection,
    kind: ElementKind,
    id: OsmId,
) -> Result<bool, StoreError> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?1", base_table(kind));
    connection
        .prepare_cached(&sql)
        .map_err(sqlite("prepare existence check"))?
        .query_row([id], |_| Ok(()))
        .optional()
        .map(|found| found.is_some())
        .map_err(sqlite("check element existence"))
}

/// Bulk-load elements without recording changesets.
pub fn load_elements<I>(connection: &Connection, elements: I) -> Result<ElementCounts, StoreError>
where
    I: IntoIterator<Item = Element>,
{
    let mut counts = ElementCounts::default();
    for element in elements {
        insert_element(connection, &element)?;
        counts.record(element.kind());
    }
    debug!(
        "loaded {} points, {} ways and {} relations",
        counts.points, counts.ways, counts.relations
    );
    Ok(counts)
}

/// Apply a diff to the base tables and record the upstream changesets.
///
/// Changes already recorded but not yet consumed by an update cycle are
/// merged with the new ones, so several diffs may be imported before the
/// derived tables catch up.
pub fn apply_diff(connection: &Connection, diff: &Diff) -> Result<UpstreamChangesets, StoreError> {
    let mut changesets = read_upstream_changesets(connection)?;
    for entry in diff.entries() {
        match entry {
            DiffEntry::Upsert(element) => {
                let existed = element_exists(connection, element.kind(), element.id())?;
                insert_element(connection, element)?;
                let action = if existed {
                    UpstreamAction::Modified
                } else {
                    UpstreamAction::Created
                };
                changesets.get_mut(element.kind()).record(element.id(), action);
            }
            DiffEntry::Delete { kind, id } => {
                if delete_element(connection, *kind, *id)? {
                    changesets.get_mut(*kind).record(*id, UpstreamAction::Deleted);
                } else {
                    debug!("ignoring deletion of unknown {kind} {id}");
                }
            }
        }
    }
    write_upstream_changesets(connection, &changesets)?;
    Ok(changesets)
}

/// Read the recorded upstream changesets.
pub fn read_upstream_changesets(connection: &Connection) -> Result<UpstreamChangesets, StoreError> {
    let mut changesets = UpstreamChangesets::default();
    for kind in KINDS {
        let sql = format!("SELECT id, action FROM {} ORDER BY id", changeset_table(kind));
        let mut statement = connection
            .prepare_cached(&sql)
            .map_err(sqlite("prepare changeset read"))?;
        let mut rows = statement.query([]).map_err(sqlite("read changeset"))?;
        while let Some(row) = rows.next().map_err(sqlite("read changeset row"))? {
            let id: OsmId = row.get(0).map_err(sqlite("read changeset id"))?;
            let code: String = row.get(1).map_err(sqlite("read changeset action"))?;
            let action = UpstreamAction::from_code(&code)
                .ok_or(StoreError::UnknownAction { kind, id, code })?;
            changesets.get_mut(kind).insert(id, action);
        }
    }
    Ok(changesets)
}

fn write_upstream_changesets(
    connection: &Connection,
    changesets: &UpstreamChangesets,
) -> Result<(), StoreError> {
    clear_upstream_changesets(connection)?;
    for kind in KINDS {
        let sql = format!("INSERT INTO {} (id, action) VALUES (?1, ?2)", changeset_table(kind));
        let mut insert = connection
            .prepare_cached(&sql)
            .map_err(sqlite("prepare changeset insert"))?;
        for (id, action) in changesets.get(kind).iter() {
            insert
                .execute((id, action.code()))
                .map_err(sqlite("insert changeset row"))?;
        }
    }
    Ok(())
}

/// Forget all recorded upstream changes.
pub fn clear_upstream_changesets(connection: &Connection) -> Result<(), StoreError> {
    for kind in KINDS {
        let sql = format!("DELETE FROM {}", changeset_table(kind));
        connection
            .execute(&sql, [])
            .map_err(sqlite("clear changeset"))?;
    }
    Ok(())
}

/// Value stored under `key` in `osm_derive_metadata`.
pub fn metadata(connection: &Connection, key: &str) -> Result<Option<String>, StoreError> {
    connection
        .prepare_cached("SELECT value FROM osm_derive_metadata WHERE key = ?1")
        .map_err(sqlite("prepare metadata lookup"))?
        .query_row([key], |row| row.get(0))
        .optional()
        .map_err(sqlite("look up metadata"))
}

/// Store `value` under `key`, replacing an earlier value.
pub fn set_metadata(connection: &Connection, key: &str, value: &str) -> Result<(), StoreError> {
    connection
        .prepare_cached("INSERT OR REPLACE INTO osm_derive_metadata (key, value) VALUES (?1, ?2)")
        .map_err(sqlite("prepare metadata write"))?
        .execute([key, value])
        .map(|_| ())
        .map_err(sqlite("write metadata"))
}

/// Look up a point.
pub fn point(connection: &Connection, id: OsmId) -> Result<Option<Point>, StoreError> {
    let row: Option<(f64, f64, String)> = connection
        .prepare_cached("SELECT lon, lat, tags FROM points WHERE id = ?1")
        .map_err(sqlite("prepare point lookup"))?
        .query_row([id], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
        .optional()
        .map_err(sqlite("look up point"))?;
    row.map(|(x, y, tags)| {
        let tags: Tags = decode(ElementKind::Point, id, "tags", &tags)?;
        Ok(Point::new(id, Coord { x, y }).with_tags(tags))
    })
    .transpose()
}

/// Look up only the location of a point.
pub fn point_location(
    connection: &Connection,
    id: OsmId,
) -> Result<Option<Coord<f64>>, StoreError> {
    connection
        .prepare_cached("SELECT lon, lat FROM points WHERE id = ?1")
        .map_err(sqlite("prepare location lookup"))?
        .query_row([id], |row| Ok(Coord { x: row.get(0)?, y: row.get(1)? }))
        .optional()
        .map_err(sqlite("look up point location"))
}

/// Look up a way.
pub fn way(connection: &Connection, id: OsmId) -> Result<Option<Way>, StoreError> {
    let row: Option<(String, String)> = connection
        .prepare_cached("SELECT nodes, tags FROM ways WHERE id = ?1")
        .map_err(sqlite("prepare way lookup"))?
        .query_row([id], |row| Ok((row.get(0)?, row.get(1)?)))
        .optional()
        .map_err(sqlite("look up way"))?;
    row.map(|(nodes, tags)| {
        let nodes: Vec<OsmId> = decode(ElementKind::Way, id, "nodes", &nodes)?;
        let tags: Tags = decode(ElementKind::Way, id, "tags", &tags)?;
        Ok(Way::new(id, nodes).with_tags(tags))
    })
    .transpose()
}

/// Look up a relation with its members in sequence order.
pub fn relation(connection: &Connection, id: OsmId) -> Result<Option<Relation>, StoreError> {
    let tags: Option<String> = connection
        .prepare_cached("SELECT tags FROM relations WHERE id = ?1")
        .map_err(sqlite("prepare relation lookup"))?
        .query_row([id], |row| row.get(0))
        .optional()
        .map_err(sqlite("look up relation"))?;
    let Some(tags) = tags else {
        return Ok(None);
    };
    let tags: Tags = decode(ElementKind::Relation, id, "tags", &tags)?;

    let mut statement = connection
        .prepare_cached(
            "SELECT member_id, member_type, member_role FROM relation_members
             WHERE relation_id = ?1 ORDER BY sequence_id",
        )
        .map_err(sqlite("prepare member lookup"))?;
    let mut rows = statement.query([id]).map_err(sqlite("read members"))?;
    let mut members = Vec::new();
    while let Some(row) = rows.next().map_err(sqlite("read member row"))? {
        let member_id: OsmId = row.get(0).map_err(sqlite("read member id"))?;
        let code: String = row.get(1).map_err(sqlite("read member type"))?;
        let role: String = row.get(2).map_err(sqlite("read member role"))?;
        let kind = ElementKind::from_code(&code).ok_or(StoreError::UnknownMemberType {
            relation_id: id,
            code,
        })?;
        members.push(Member::new(kind, member_id, role));
    }
    Ok(Some(Relation::new(id, members).with_tags(tags)))
}

/// Ids of relations currently listing `way_id` as a member, ascending and
/// without duplicates.
pub fn relations_with_way(
    connection: &Connection,
    way_id: OsmId,
) -> Result<Vec<OsmId>, StoreError> {
    let mut statement = connection
        .prepare_cached(
            "SELECT DISTINCT relation_id FROM relation_members
             WHERE member_type = 'W' AND member_id = ?1 ORDER BY relation_id",
        )
        .map_err(sqlite("prepare membership lookup"))?;
    let ids = statement
        .query_map([way_id], |row| row.get(0))
        .map_err(sqlite("look up memberships"))?
        .collect::<Result<Vec<OsmId>, _>>()
        .map_err(sqlite("read membership row"))?;
    Ok(ids)
}

/// Ids of the ways `relation_id` currently lists as members, ascending and
/// without duplicates.
pub fn way_members(connection: &Connection, relation_id: OsmId) -> Result<Vec<OsmId>, StoreError> {
    let mut statement = connection
        .prepare_cached(
            "SELECT DISTINCT member_id FROM relation_members
             WHERE relation_id = ?1 AND member_type = 'W' ORDER BY member_id",
        )
        .map_err(sqlite("prepare way member lookup"))?;
    let ids = statement
        .query_map([relation_id], |row| row.get(0))
        .map_err(sqlite("look up way members"))?
        .collect::<Result<Vec<OsmId>, _>>()
        .map_err(sqlite("read way member row"))?;
    Ok(ids)
}

/// Visit every stored point in ascending id order.
pub fn for_each_point<F, E>(connection: &Connection, mut visit: F) -> Result<(), E>
where
    F: FnMut(Point) -> Result<(), E>,
    E: From<StoreError>,
{
    let mut statement = connection
        .prepare("SELECT id, lon, lat, tags FROM points ORDER BY id")
        .map_err(sqlite("prepare point scan"))?;
    let mut rows = statement.query([]).map_err(sqlite("scan points"))?;
    while let Some(row) = rows.next().map_err(sqlite("read point row"))? {
        let id: OsmId = row.get(0).map_err(sqlite("read point id"))?;
        let x: f64 = row.get(1).map_err(sqlite("read point lon"))?;
        let y: f64 = row.get(2).map_err(sqlite("read point lat"))?;
        let tags: String = row.get(3).map_err(sqlite("read point tags"))?;
        let tags: Tags = decode(ElementKind::Point, id, "tags", &tags)?;
        visit(Point::new(id, Coord { x, y }).with_tags(tags))?;
    }
    Ok(())
}

/// Visit every way referenced by at least one relation, in ascending way id
/// order, with the ascending distinct ids of the relations referencing it.
pub fn for_each_way_membership<F, E>(connection: &Connection, mut visit: F) -> Result<(), E>
where
    F: FnMut(OsmId, Vec<OsmId>) -> Result<(), E>,
    E: From<StoreError>,
{
    let mut statement = connection
        .prepare(
            "SELECT member_id, relation_id FROM relation_members
             WHERE member_type = 'W'
             GROUP BY member_id, relation_id
             ORDER BY member_id, relation_id",
        )
        .map_err(sqlite("prepare membership scan"))?;
    let mut rows = statement.query([]).map_err(sqlite("scan memberships"))?;
    let mut current: Option<(OsmId, Vec<OsmId>)> = None;
    while let Some(row) = rows.next().map_err(sqlite("read membership row"))? {
        let way_id: OsmId = row.get(0).map_err(sqlite("read member id"))?;
        let relation_id: OsmId = row.get(1).map_err(sqlite("read relation id"))?;
        match current.as_mut() {
            Some((current_way, relations)) if *current_way == way_id => {
                relations.push(relation_id);
            }
            _ => {
                if let Some((finished, relations)) = current.replace((way_id, vec![relation_id])) {
                    visit(finished, relations)?;
                }
            }
        }
    }
    if let Some((way_id, relations)) = current {
        visit(way_id, relations)?;
    }
    Ok(())
}
