//! Way to relation membership table.
//!
//! One row per way that is a member of at least one relation, holding the
//! way's node list and the ascending, distinct ids of the relations that list
//! it. Rows are keyed by way id.
//!
//! Besides the main table the membership pairs are mirrored into
//! `<name>_relations(relation_id, way_id)` so the ways a relation used to
//! reference can be found without scanning every row.
//!
//! A [`WayTransform`] may narrow the table to selected ways and attach extra
//! columns derived from the way's tags. The columns take part in change
//! detection, so a tag edit that changes them reports `Modified`.

use std::{fmt, sync::Arc};

use log::{debug, info};
use osm_derive_core::{Changeset, ElementKind, OsmId, OutputAction, Tags, UpstreamAction};
use rusqlite::{Connection, OptionalExtension};

use crate::store;

use super::{
    Dependency, DerivedTable, DirtyKeys, Inconsistency, KeyedRows, TableContext, TableError,
    create_changeset_table, refresh_keys, sqlite_error, write_changeset,
};

/// How relation members that reference unknown ways are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemberPolicy {
    /// Abort the build or cycle with a dependency inconsistency.
    #[default]
    Strict,
    /// Ignore such members, as needed for clipped extracts.
    SkipMissing,
}

/// Hook turning a member way's tags into the row's extra columns.
///
/// # Examples
///
/// ```
/// use osm_derive_core::{OsmId, Tags};
/// use osm_derive_data::WayTransform;
///
/// #[derive(Debug)]
/// struct UpperName;
///
/// impl WayTransform for UpperName {
///     fn transform(&self, _way_id: OsmId, tags: &Tags) -> Option<Tags> {
///         let name = tags.get("name")?;
///         Some(Tags::from([("name".to_owned(), name.to_uppercase())]))
///     }
/// }
///
/// let tags = Tags::from([("name".to_owned(), "oak lane".to_owned())]);
/// assert_eq!(
///     UpperName.transform(1, &tags).and_then(|c| c.get("name").cloned()),
///     Some("OAK LANE".to_owned())
/// );
/// assert_eq!(UpperName.transform(2, &Tags::new()), None);
/// ```
pub trait WayTransform: fmt::Debug + Send + Sync {
    /// Extra columns for the way, or `None` to leave it without a row.
    fn transform(&self, way_id: OsmId, tags: &Tags) -> Option<Tags>;
}

/// A materialised membership row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationWayRow {
    /// Way id, the row key.
    pub way_id: OsmId,
    /// The way's node list, verbatim.
    pub node_ids: Vec<OsmId>,
    /// Ids of relations listing the way, ascending and distinct.
    pub relation_ids: Vec<OsmId>,
    /// Columns produced by the table's [`WayTransform`]; empty without one.
    pub columns: Tags,
}

/// Derived table aggregating way membership in relations.
///
/// # Examples
///
/// ```
/// use osm_derive_data::{MemberPolicy, RelationWayTable, DerivedTable};
///
/// let table = RelationWayTable::new().with_policy(MemberPolicy::SkipMissing);
/// assert_eq!(table.name(), "relation_ways");
/// assert_eq!(table.policy(), MemberPolicy::SkipMissing);
/// ```
#[derive(Debug, Clone)]
pub struct RelationWayTable {
    name: String,
    policy: MemberPolicy,
    transform: Option<Arc<dyn WayTransform>>,
}

impl Default for RelationWayTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RelationWayTable {
    /// Name used by [`RelationWayTable::new`].
    pub const DEFAULT_NAME: &'static str = "relation_ways";

    /// Table called `relation_ways` with the strict member policy.
    #[must_use]
    pub fn new() -> Self {
        Self::named(Self::DEFAULT_NAME)
    }

    /// Table with a custom name.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            policy: MemberPolicy::default(),
            transform: None,
        }
    }

    /// Override the member policy.
    #[must_use]
    pub const fn with_policy(mut self, policy: MemberPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Select ways and derive extra columns with `transform`.
    #[must_use]
    pub fn with_transform(mut self, transform: impl WayTransform + 'static) -> Self {
        self.transform = Some(Arc::new(transform));
        self
    }

    /// Active member policy.
    #[must_use]
    pub const fn policy(&self) -> MemberPolicy {
        self.policy
    }

    /// Row stored for `way_id`.
    pub fn get(
        &self,
        connection: &Connection,
        way_id: OsmId,
    ) -> Result<Option<RelationWayRow>, TableError> {
        let sql = format!(
            "SELECT node_ids, relation_ids, columns FROM {} WHERE way_id = ?1",
            self.name
        );
        let raw: Option<[String; 3]> = connection
            .prepare_cached(&sql)
            .map_err(sqlite_error(&self.name, "prepare row lookup"))?
            .query_row([way_id], |row| Ok([row.get(0)?, row.get(1)?, row.get(2)?]))
            .optional()
            .map_err(sqlite_error(&self.name, "look up row"))?;
        raw.map(|columns| self.decode_row(way_id, &columns)).transpose()
    }

    /// Every stored row in ascending way id order.
    pub fn rows(&self, connection: &Connection) -> Result<Vec<RelationWayRow>, TableError> {
        let sql = format!(
            "SELECT way_id, node_ids, relation_ids, columns FROM {} ORDER BY way_id",
            self.name
        );
        let mut statement = connection
            .prepare(&sql)
            .map_err(sqlite_error(&self.name, "prepare row scan"))?;
        let mut rows = statement
            .query([])
            .map_err(sqlite_error(&self.name, "scan rows"))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(sqlite_error(&self.name, "read row"))? {
            let way_id: OsmId = row.get(0).map_err(sqlite_error(&self.name, "read way id"))?;
            let nodes: String = row.get(1).map_err(sqlite_error(&self.name, "read node ids"))?;
            let relations: String = row
                .get(2)
                .map_err(sqlite_error(&self.name, "read relation ids"))?;
            let columns: String = row.get(3).map_err(sqlite_error(&self.name, "read columns"))?;
            out.push(self.decode_row(way_id, &[nodes, relations, columns])?);
        }
        Ok(out)
    }

    fn membership_table(&self) -> String {
        format!("{}_relations", self.name)
    }

    /// Decode the JSON `node_ids`, `relation_ids` and `columns` fields.
    fn decode_row(&self, way_id: OsmId, raw: &[String; 3]) -> Result<RelationWayRow, TableError> {
        let [nodes, relations, columns] = raw;
        let error = |source: serde_json::Error| TableError::Decode {
            table: self.name.clone(),
            key: way_id,
            source,
        };
        Ok(RelationWayRow {
            way_id,
            node_ids: serde_json::from_str(nodes).map_err(error)?,
            relation_ids: serde_json::from_str(relations).map_err(error)?,
            columns: serde_json::from_str(columns).map_err(error)?,
        })
    }

    fn inconsistency(&self, problem: Inconsistency) -> TableError {
        TableError::DependencyInconsistency {
            table: self.name.clone(),
            problem,
        }
    }

    /// Assemble the row for `way_id` from the relations that list it.
    fn build_row(
        &self,
        connection: &Connection,
        way_id: OsmId,
        relation_ids: Vec<OsmId>,
    ) -> Result<Option<RelationWayRow>, TableError> {
        let Some(&first_relation) = relation_ids.first() else {
            return Ok(None);
        };
        let Some(way) = store::way(connection, way_id)? else {
            return match self.policy {
                MemberPolicy::Strict => Err(self.inconsistency(Inconsistency::UnresolvedMember {
                    relation_id: first_relation,
                    way_id,
                })),
                MemberPolicy::SkipMissing => Ok(None),
            };
        };
        let columns = match &self.transform {
            Some(transform) => match transform.transform(way_id, &way.tags) {
                Some(columns) => columns,
                None => return Ok(None),
            },
            None => Tags::new(),
        };
        Ok(Some(RelationWayRow {
            way_id,
            node_ids: way.nodes,
            relation_ids,
            columns,
        }))
    }

    fn write_row(
        &self,
        connection: &Connection,
        way_id: OsmId,
        row: Option<&RelationWayRow>,
    ) -> Result<(), TableError> {
        let membership = self.membership_table();
        connection
            .prepare_cached(&format!("DELETE FROM {membership} WHERE way_id = ?1"))
            .map_err(sqlite_error(&self.name, "prepare membership removal"))?
            .execute([way_id])
            .map_err(sqlite_error(&self.name, "remove memberships"))?;

        let Some(row) = row else {
            connection
                .prepare_cached(&format!("DELETE FROM {} WHERE way_id = ?1", self.name))
                .map_err(sqlite_error(&self.name, "prepare row removal"))?
                .execute([way_id])
                .map_err(sqlite_error(&self.name, "remove row"))?;
            return Ok(());
        };

        let error = |source: serde_json::Error| TableError::Encode {
            table: self.name.clone(),
            key: way_id,
            source,
        };
        let nodes = serde_json::to_string(&row.node_ids).map_err(error)?;
        let relations = serde_json::to_string(&row.relation_ids).map_err(error)?;
        let columns = serde_json::to_string(&row.columns).map_err(error)?;
        connection
            .prepare_cached(&format!(
                "INSERT OR REPLACE INTO {} (way_id, node_ids, relation_ids, columns)
                 VALUES (?1, ?2, ?3, ?4)",
                self.name
            ))
            .map_err(sqlite_error(&self.name, "prepare row insert"))?
            .execute((way_id, nodes, relations, columns))
            .map_err(sqlite_error(&self.name, "insert row"))?;

        let mut insert = connection
            .prepare_cached(&format!(
                "INSERT INTO {membership} (relation_id, way_id) VALUES (?1, ?2)"
            ))
            .map_err(sqlite_error(&self.name, "prepare membership insert"))?;
        for relation_id in &row.relation_ids {
            insert
                .execute((relation_id, way_id))
                .map_err(sqlite_error(&self.name, "insert membership"))?;
        }
        Ok(())
    }

    /// Ways whose stored row lists `relation_id`.
    fn stored_ways_of(
        &self,
        connection: &Connection,
        relation_id: OsmId,
    ) -> Result<Vec<OsmId>, TableError> {
        let sql = format!(
            "SELECT way_id FROM {} WHERE relation_id = ?1",
            self.membership_table()
        );
        let mut statement = connection
            .prepare_cached(&sql)
            .map_err(sqlite_error(&self.name, "prepare previous member lookup"))?;
        let ids = statement
            .query_map([relation_id], |row| row.get(0))
            .map_err(sqlite_error(&self.name, "look up previous members"))?
            .collect::<Result<Vec<OsmId>, _>>()
            .map_err(sqlite_error(&self.name, "read previous member"))?;
        Ok(ids)
    }

    fn mark_way_changes(
        &self,
        context: &TableContext<'_>,
        dirty: &mut DirtyKeys,
    ) -> Result<(), TableError> {
        for (way_id, action) in context.upstream.ways.iter() {
            let present = store::element_exists(context.connection, ElementKind::Way, way_id)?;
            match action {
                UpstreamAction::Created | UpstreamAction::Modified if !present => {
                    return Err(self.inconsistency(Inconsistency::MissingWay { way_id, action }));
                }
                UpstreamAction::Deleted if present => {
                    return Err(self.inconsistency(Inconsistency::DeletedWayPresent { way_id }));
                }
                _ => {}
            }
            dirty.insert(way_id);
        }
        Ok(())
    }

    fn mark_relation_changes(
        &self,
        context: &TableContext<'_>,
        dirty: &mut DirtyKeys,
    ) -> Result<(), TableError> {
        for relation_id in context.upstream.relations.ids() {
            dirty.extend(store::way_members(context.connection, relation_id)?);
            dirty.extend(self.stored_ways_of(context.connection, relation_id)?);
        }
        Ok(())
    }
}

impl KeyedRows for RelationWayTable {
    type Row = RelationWayRow;

    fn stored(
        &self,
        context: &mut TableContext<'_>,
        key: OsmId,
    ) -> Result<Option<RelationWayRow>, TableError> {
        self.get(context.connection, key)
    }

    fn recompute(
        &self,
        context: &mut TableContext<'_>,
        key: OsmId,
    ) -> Result<Option<RelationWayRow>, TableError> {
        let relation_ids = store::relations_with_way(context.connection, key)?;
        self.build_row(context.connection, key, relation_ids)
    }

    fn write(
        &self,
        context: &mut TableContext<'_>,
        key: OsmId,
        row: Option<&RelationWayRow>,
    ) -> Result<(), TableError> {
        self.write_row(context.connection, key, row)
    }
}

impl DerivedTable for RelationWayTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> Vec<Dependency> {
        vec![
            Dependency::Base(ElementKind::Way),
            Dependency::Base(ElementKind::Relation),
        ]
    }

    fn create(&self, connection: &Connection) -> Result<(), TableError> {
        connection
            .execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS {} (
                        way_id INTEGER PRIMARY KEY,
                        node_ids TEXT NOT NULL,
                        relation_ids TEXT NOT NULL,
                        columns TEXT NOT NULL
                    )",
                    self.name
                ),
                [],
            )
            .map_err(sqlite_error(&self.name, "create table"))?;
        connection
            .execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS {} (
                        relation_id INTEGER NOT NULL,
                        way_id INTEGER NOT NULL,
                        PRIMARY KEY (relation_id, way_id)
                    ) WITHOUT ROWID",
                    self.membership_table()
                ),
                [],
            )
            .map_err(sqlite_error(&self.name, "create membership table"))?;
        create_changeset_table(connection, &self.name)
    }

    fn construct(&self, context: &mut TableContext<'_>) -> Result<(), TableError> {
        let connection = context.connection;
        for table in [self.name.clone(), self.membership_table()] {
            connection
                .execute(&format!("DELETE FROM {table}"), [])
                .map_err(sqlite_error(&self.name, "clear table"))?;
        }
        write_changeset(connection, &self.name, &Changeset::new())?;

        let mut rows = 0_u64;
        store::for_each_way_membership(connection, |way_id, relation_ids| {
            if let Some(row) = self.build_row(connection, way_id, relation_ids)? {
                self.write_row(connection, way_id, Some(&row))?;
                rows += 1;
            }
            Ok::<(), TableError>(())
        })?;
        info!("{}: built {rows} membership rows", self.name);
        Ok(())
    }

    fn update(
        &self,
        context: &mut TableContext<'_>,
    ) -> Result<Changeset<OutputAction>, TableError> {
        let mut dirty = DirtyKeys::new();
        self.mark_way_changes(context, &mut dirty)?;
        self.mark_relation_changes(context, &mut dirty)?;
        let changes = refresh_keys(self, context, &dirty)?;
        debug!(
            "{}: {} dirty ways, {} changed rows",
            self.name,
            dirty.len(),
            changes.len()
        );
        Ok(changes)
    }
}

#[cfg(test)]
mod tests;
