//! Tagged point table.
//!
//! Keeps one row per point carrying at least one of the configured tag keys,
//! with the point's tags and its location as an EWKB point.

use std::collections::BTreeSet;

use log::{debug, info};
use osm_derive_core::geometry::ewkb_point;
use osm_derive_core::{Changeset, ElementKind, OsmId, OutputAction, Point, Srid, Tags};
use rusqlite::{Connection, OptionalExtension};

use crate::store;

use super::{
    Dependency, DerivedTable, DirtyKeys, KeyedRows, TableContext, TableError,
    create_changeset_table, refresh_keys, sqlite_error, write_changeset,
};

/// A materialised point row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointRow {
    /// Point id, the row key.
    pub id: OsmId,
    /// All tags of the point.
    pub tags: Tags,
    /// EWKB point in the table's reference system.
    pub geom: Vec<u8>,
}

/// Derived table of points selected by tag key.
///
/// An empty key set selects every tagged point.
#[derive(Debug, Clone)]
pub struct PointTable {
    name: String,
    tag_keys: BTreeSet<String>,
    srid: Srid,
}

impl PointTable {
    /// Table selecting every tagged point, stored as WGS84.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tag_keys: BTreeSet::new(),
            srid: Srid::default(),
        }
    }

    /// Only keep points carrying one of `keys`.
    #[must_use]
    pub fn with_tag_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tag_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Store geometries in `srid`.
    #[must_use]
    pub const fn with_srid(mut self, srid: Srid) -> Self {
        self.srid = srid;
        self
    }

    /// Reference system of stored geometries.
    #[must_use]
    pub const fn srid(&self) -> Srid {
        self.srid
    }

    fn selects(&self, tags: &Tags) -> bool {
        if self.tag_keys.is_empty() {
            !tags.is_empty()
        } else {
            tags.keys().any(|key| self.tag_keys.contains(key))
        }
    }

    fn build_row(&self, point: Point) -> Option<PointRow> {
        if !self.selects(&point.tags) {
            return None;
        }
        let projected = self.srid.project(point.location);
        Some(PointRow {
            id: point.id,
            geom: ewkb_point(projected, self.srid.code()).to_vec(),
            tags: point.tags,
        })
    }

    /// Row stored for `id`.
    pub fn get(&self, connection: &Connection, id: OsmId) -> Result<Option<PointRow>, TableError> {
        let sql = format!("SELECT tags, geom FROM {} WHERE id = ?1", self.name);
        let raw: Option<(String, Vec<u8>)> = connection
            .prepare_cached(&sql)
            .map_err(sqlite_error(&self.name, "prepare row lookup"))?
            .query_row([id], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()
            .map_err(sqlite_error(&self.name, "look up row"))?;
        let Some((tags, geom)) = raw else {
            return Ok(None);
        };
        let tags = serde_json::from_str(&tags).map_err(|source| TableError::Decode {
            table: self.name.clone(),
            key: id,
            source,
        })?;
        Ok(Some(PointRow { id, tags, geom }))
    }

    /// Ids of every stored row, ascending.
    pub fn ids(&self, connection: &Connection) -> Result<Vec<OsmId>, TableError> {
        let mut statement = connection
            .prepare(&format!("SELECT id FROM {} ORDER BY id", self.name))
            .map_err(sqlite_error(&self.name, "prepare id scan"))?;
        let ids = statement
            .query_map([], |row| row.get(0))
            .map_err(sqlite_error(&self.name, "scan ids"))?
            .collect::<Result<Vec<OsmId>, _>>()
            .map_err(sqlite_error(&self.name, "read id"))?;
        Ok(ids)
    }

    fn write_row(
        &self,
        connection: &Connection,
        id: OsmId,
        row: Option<&PointRow>,
    ) -> Result<(), TableError> {
        match row {
            Some(row) => {
                let tags = serde_json::to_string(&row.tags).map_err(|source| {
                    TableError::Encode {
                        table: self.name.clone(),
                        key: id,
                        source,
                    }
                })?;
                connection
                    .prepare_cached(&format!(
                        "INSERT OR REPLACE INTO {} (id, tags, geom) VALUES (?1, ?2, ?3)",
                        self.name
                    ))
                    .map_err(sqlite_error(&self.name, "prepare row insert"))?
                    .execute((id, tags, &row.geom))
                    .map_err(sqlite_error(&self.name, "insert row"))?;
            }
            None => {
                connection
                    .prepare_cached(&format!("DELETE FROM {} WHERE id = ?1", self.name))
                    .map_err(sqlite_error(&self.name, "prepare row removal"))?
                    .execute([id])
                    .map_err(sqlite_error(&self.name, "remove row"))?;
            }
        }
        Ok(())
    }
}

impl KeyedRows for PointTable {
    type Row = PointRow;

    fn stored(
        &self,
        context: &mut TableContext<'_>,
        key: OsmId,
    ) -> Result<Option<PointRow>, TableError> {
        self.get(context.connection, key)
    }

    fn recompute(
        &self,
        context: &mut TableContext<'_>,
        key: OsmId,
    ) -> Result<Option<PointRow>, TableError> {
        Ok(store::point(context.connection, key)?.and_then(|point| self.build_row(point)))
    }

    fn write(
        &self,
        context: &mut TableContext<'_>,
        key: OsmId,
        row: Option<&PointRow>,
    ) -> Result<(), TableError> {
        self.write_row(context.connection, key, row)
    }
}

impl DerivedTable for PointTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> Vec<Dependency> {
        vec![Dependency::Base(ElementKind::Point)]
    }

    fn create(&self, connection: &Connection) -> Result<(), TableError> {
        connection
            .execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS {} (
                        id INTEGER PRIMARY KEY,
                        tags TEXT NOT NULL,
                        geom BLOB NOT NULL
                    )",
                    self.name
                ),
                [],
            )
            .map_err(sqlite_error(&self.name, "create table"))?;
        create_changeset_table(connection, &self.name)
    }

    fn construct(&self, context: &mut TableContext<'_>) -> Result<(), TableError> {
        let connection = context.connection;
        connection
            .execute(&format!("DELETE FROM {}", self.name), [])
            .map_err(sqlite_error(&self.name, "clear table"))?;
        write_changeset(connection, &self.name, &Changeset::new())?;

        let mut rows = 0_u64;
        store::for_each_point(connection, |point| {
            let id = point.id;
            if let Some(row) = self.build_row(point) {
                self.write_row(connection, id, Some(&row))?;
                rows += 1;
            }
            Ok::<(), TableError>(())
        })?;
        info!("{}: built {rows} point rows", self.name);
        Ok(())
    }

    fn update(
        &self,
        context: &mut TableContext<'_>,
    ) -> Result<Changeset<OutputAction>, TableError> {
        let dirty: DirtyKeys = context.upstream.points.ids().collect();
        let changes = refresh_keys(self, context, &dirty)?;
        debug!(
            "{}: {} dirty points, {} changed rows",
            self.name,
            dirty.len(),
            changes.len()
        );
        Ok(changes)
    }
}
