//! Linestring geometries for the ways of an upstream membership table.
//!
//! The table is chained: its keys are the way ids of a source table exposing
//! `way_id` and a JSON `node_ids` column (normally [`RelationWayTable`]).
//! A row exists for every source row whose nodes resolve to at least two
//! locations.
//!
//! Point-to-way usage is mirrored in `<name>_points(point_id, way_id)` so a
//! moved point can be mapped to the geometries it shapes.
//!
//! [`RelationWayTable`]: super::relation_ways::RelationWayTable

use geo::{Coord, LineString};
use log::{debug, info};
use osm_derive_core::geometry::ewkb_linestring;
use osm_derive_core::{Changeset, ElementKind, OsmId, OutputAction, Srid};
use rusqlite::{Connection, OptionalExtension};

use super::{
    Dependency, DerivedTable, DirtyKeys, KeyedRows, TableContext, TableError,
    create_changeset_table, refresh_keys, sqlite_error, write_changeset,
};

/// Offset added to the longitude of a point repeating its predecessor.
const DUPLICATE_NUDGE: f64 = 0.000_000_01;

/// A materialised geometry row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WayGeometryRow {
    /// Way id, the row key.
    pub way_id: OsmId,
    /// EWKB linestring in the table's reference system.
    pub geom: Vec<u8>,
}

/// Derived table of way linestrings.
#[derive(Debug, Clone)]
pub struct WayGeometryTable {
    name: String,
    source: String,
    srid: Srid,
}

impl WayGeometryTable {
    /// Geometry table `name` fed by the membership table `source`.
    #[must_use]
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            srid: Srid::default(),
        }
    }

    /// Store geometries in `srid`.
    #[must_use]
    pub const fn with_srid(mut self, srid: Srid) -> Self {
        self.srid = srid;
        self
    }

    /// Name of the source table.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Row stored for `way_id`.
    pub fn get(
        &self,
        connection: &Connection,
        way_id: OsmId,
    ) -> Result<Option<WayGeometryRow>, TableError> {
        let sql = format!("SELECT geom FROM {} WHERE way_id = ?1", self.name);
        let geom: Option<Vec<u8>> = connection
            .prepare_cached(&sql)
            .map_err(sqlite_error(&self.name, "prepare row lookup"))?
            .query_row([way_id], |row| row.get(0))
            .optional()
            .map_err(sqlite_error(&self.name, "look up row"))?;
        Ok(geom.map(|geom| WayGeometryRow { way_id, geom }))
    }

    /// Ids of every stored row, ascending.
    pub fn ids(&self, connection: &Connection) -> Result<Vec<OsmId>, TableError> {
        let mut statement = connection
            .prepare(&format!("SELECT way_id FROM {} ORDER BY way_id", self.name))
            .map_err(sqlite_error(&self.name, "prepare id scan"))?;
        let ids = statement
            .query_map([], |row| row.get(0))
            .map_err(sqlite_error(&self.name, "scan ids"))?
            .collect::<Result<Vec<OsmId>, _>>()
            .map_err(sqlite_error(&self.name, "read id"))?;
        Ok(ids)
    }

    fn point_table(&self) -> String {
        format!("{}_points", self.name)
    }

    fn decode_nodes(&self, way_id: OsmId, text: &str) -> Result<Vec<OsmId>, TableError> {
        serde_json::from_str(text).map_err(|source| TableError::Decode {
            table: self.source.clone(),
            key: way_id,
            source,
        })
    }

    /// Node list of the source row for `way_id`.
    fn source_nodes(
        &self,
        connection: &Connection,
        way_id: OsmId,
    ) -> Result<Option<Vec<OsmId>>, TableError> {
        let sql = format!("SELECT node_ids FROM {} WHERE way_id = ?1", self.source);
        let text: Option<String> = connection
            .prepare_cached(&sql)
            .map_err(sqlite_error(&self.name, "prepare source lookup"))?
            .query_row([way_id], |row| row.get(0))
            .optional()
            .map_err(sqlite_error(&self.name, "look up source row"))?;
        text.map(|text| self.decode_nodes(way_id, &text)).transpose()
    }

    /// Replace the recorded points used by `way_id`.
    fn sync_points(
        &self,
        connection: &Connection,
        way_id: OsmId,
        nodes: Option<&[OsmId]>,
    ) -> Result<(), TableError> {
        let point_table = self.point_table();
        connection
            .prepare_cached(&format!("DELETE FROM {point_table} WHERE way_id = ?1"))
            .map_err(sqlite_error(&self.name, "prepare point usage removal"))?
            .execute([way_id])
            .map_err(sqlite_error(&self.name, "remove point usage"))?;
        let Some(nodes) = nodes else {
            return Ok(());
        };
        let mut insert = connection
            .prepare_cached(&format!(
                "INSERT OR IGNORE INTO {point_table} (point_id, way_id) VALUES (?1, ?2)"
            ))
            .map_err(sqlite_error(&self.name, "prepare point usage insert"))?;
        for point_id in nodes {
            insert
                .execute((point_id, way_id))
                .map_err(sqlite_error(&self.name, "insert point usage"))?;
        }
        Ok(())
    }

    fn ways_using_point(
        &self,
        connection: &Connection,
        point_id: OsmId,
    ) -> Result<Vec<OsmId>, TableError> {
        let sql = format!(
            "SELECT way_id FROM {} WHERE point_id = ?1",
            self.point_table()
        );
        let mut statement = connection
            .prepare_cached(&sql)
            .map_err(sqlite_error(&self.name, "prepare point usage lookup"))?;
        let ids = statement
            .query_map([point_id], |row| row.get(0))
            .map_err(sqlite_error(&self.name, "look up point usage"))?
            .collect::<Result<Vec<OsmId>, _>>()
            .map_err(sqlite_error(&self.name, "read point usage"))?;
        Ok(ids)
    }

    /// Resolve `nodes` to a linestring, skipping unknown points and nudging
    /// repeated locations apart.
    fn line(
        &self,
        context: &mut TableContext<'_>,
        way_id: OsmId,
        nodes: &[OsmId],
    ) -> Result<Option<WayGeometryRow>, TableError> {
        let connection = context.connection;
        let mut coords: Vec<Coord<f64>> = Vec::with_capacity(nodes.len());
        let mut previous: Option<Coord<f64>> = None;
        for &node in nodes {
            let Some(mut coord) = context.coordinates.locate(connection, node)? else {
                continue;
            };
            if previous == Some(coord) {
                coord.x += DUPLICATE_NUDGE;
            }
            previous = Some(coord);
            coords.push(coord);
        }
        if coords.len() < 2 {
            return Ok(None);
        }
        let line: LineString<f64> = coords
            .into_iter()
            .map(|coord| self.srid.project(coord))
            .collect();
        Ok(Some(WayGeometryRow {
            way_id,
            geom: ewkb_linestring(&line, self.srid.code()),
        }))
    }

    fn write_row(
        &self,
        connection: &Connection,
        way_id: OsmId,
        row: Option<&WayGeometryRow>,
    ) -> Result<(), TableError> {
        match row {
            Some(row) => connection
                .prepare_cached(&format!(
                    "INSERT OR REPLACE INTO {} (way_id, geom) VALUES (?1, ?2)",
                    self.name
                ))
                .map_err(sqlite_error(&self.name, "prepare row insert"))?
                .execute((way_id, &row.geom))
                .map_err(sqlite_error(&self.name, "insert row"))?,
            None => connection
                .prepare_cached(&format!("DELETE FROM {} WHERE way_id = ?1", self.name))
                .map_err(sqlite_error(&self.name, "prepare row removal"))?
                .execute([way_id])
                .map_err(sqlite_error(&self.name, "remove row"))?,
        };
        Ok(())
    }
}

impl KeyedRows for WayGeometryTable {
    type Row = WayGeometryRow;

    fn stored(
        &self,
        context: &mut TableContext<'_>,
        key: OsmId,
    ) -> Result<Option<WayGeometryRow>, TableError> {
        self.get(context.connection, key)
    }

    fn recompute(
        &self,
        context: &mut TableContext<'_>,
        key: OsmId,
    ) -> Result<Option<WayGeometryRow>, TableError> {
        match self.source_nodes(context.connection, key)? {
            Some(nodes) => self.line(context, key, &nodes),
            None => Ok(None),
        }
    }

    fn write(
        &self,
        context: &mut TableContext<'_>,
        key: OsmId,
        row: Option<&WayGeometryRow>,
    ) -> Result<(), TableError> {
        self.write_row(context.connection, key, row)
    }
}

impl DerivedTable for WayGeometryTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> Vec<Dependency> {
        vec![
            Dependency::Table(self.source.clone()),
            Dependency::Base(ElementKind::Point),
        ]
    }

    fn create(&self, connection: &Connection) -> Result<(), TableError> {
        let point_table = self.point_table();
        connection
            .execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {name} (
                    way_id INTEGER PRIMARY KEY,
                    geom BLOB NOT NULL
                );
                CREATE TABLE IF NOT EXISTS {point_table} (
                    point_id INTEGER NOT NULL,
                    way_id INTEGER NOT NULL,
                    PRIMARY KEY (point_id, way_id)
                ) WITHOUT ROWID;
                CREATE INDEX IF NOT EXISTS idx_{point_table}_way ON {point_table} (way_id);",
                name = self.name
            ))
            .map_err(sqlite_error(&self.name, "create tables"))?;
        create_changeset_table(connection, &self.name)
    }

    fn construct(&self, context: &mut TableContext<'_>) -> Result<(), TableError> {
        let connection = context.connection;
        for table in [self.name.clone(), self.point_table()] {
            connection
                .execute(&format!("DELETE FROM {table}"), [])
                .map_err(sqlite_error(&self.name, "clear table"))?;
        }
        write_changeset(connection, &self.name, &Changeset::new())?;

        let mut statement = connection
            .prepare(&format!(
                "SELECT way_id, node_ids FROM {} ORDER BY way_id",
                self.source
            ))
            .map_err(sqlite_error(&self.name, "prepare source scan"))?;
        let mut rows = statement
            .query([])
            .map_err(sqlite_error(&self.name, "scan source"))?;
        let mut built = 0_u64;
        while let Some(row) = rows.next().map_err(sqlite_error(&self.name, "read source row"))? {
            let way_id: OsmId = row
                .get(0)
                .map_err(sqlite_error(&self.name, "read source way id"))?;
            let text: String = row
                .get(1)
                .map_err(sqlite_error(&self.name, "read source node ids"))?;
            let nodes = self.decode_nodes(way_id, &text)?;
            self.sync_points(connection, way_id, Some(&nodes))?;
            if let Some(line) = self.line(context, way_id, &nodes)? {
                self.write_row(connection, way_id, Some(&line))?;
                built += 1;
            }
        }
        info!("{}: built {built} way geometries", self.name);
        Ok(())
    }

    fn update(
        &self,
        context: &mut TableContext<'_>,
    ) -> Result<Changeset<OutputAction>, TableError> {
        let connection = context.connection;
        let mut dirty = DirtyKeys::new();
        if let Some(changes) = context.table_changes(&self.source) {
            for way_id in changes.ids() {
                let nodes = self.source_nodes(connection, way_id)?;
                self.sync_points(connection, way_id, nodes.as_deref())?;
                dirty.insert(way_id);
            }
        }
        for point_id in context.upstream.points.ids() {
            dirty.extend(self.ways_using_point(connection, point_id)?);
        }
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
