//! Update cycle driver.
//!
//! [`DerivedDatabase`] owns the SQLite connection, the registered derived
//! tables and the optional point index. Full loads and update cycles each run
//! in a single transaction; point index writes made by a cycle are staged and
//! only reach the index after the transaction commits.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use log::{debug, info};
use osm_derive_core::{
    Changeset, Element, OutputAction, PointIndex, PointIndexError, PointIndexOptions,
    UpstreamAction,
};
use rusqlite::{Connection, Error as SqliteError};
use thiserror::Error;

use crate::diff::Diff;
use crate::ingest::{IngestError, IngestSummary, ingest_osm_pbf};
use crate::store::{self, ElementCounts, SchemaError, StoreError, UpstreamChangesets};
use crate::table::{
    Coordinates, PendingPoints, TableContext, TableError, TableRegistry, read_changeset,
    write_changeset,
};

/// Errors raised by [`DerivedDatabase`].
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// The database file could not be opened.
    #[error("failed to open database at {path}")]
    Open {
        /// Database path.
        path: Utf8PathBuf,
        /// Source error returned by `rusqlite`.
        #[source]
        source: SqliteError,
    },
    /// The directory holding the database could not be created.
    #[error("failed to create the directory for {path}")]
    CreateDirectory {
        /// Database path.
        path: Utf8PathBuf,
        /// Source error from the filesystem.
        #[source]
        source: io::Error,
    },
    /// A transaction statement failed.
    #[error("database operation '{operation}' failed")]
    Sqlite {
        /// Operation being performed.
        operation: &'static str,
        /// Source error returned by `rusqlite`.
        #[source]
        source: SqliteError,
    },
    /// Schema initialisation failed.
    #[error(transparent)]
    Schema(#[from] SchemaError),
    /// Base data access failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A derived table failed to build or update.
    #[error(transparent)]
    Table(#[from] TableError),
    /// The point index failed.
    #[error(transparent)]
    PointIndex(#[from] PointIndexError),
    /// Bulk loading failed.
    #[error(transparent)]
    Ingest(#[from] IngestError),
}

fn sqlite(operation: &'static str) -> impl FnOnce(SqliteError) -> DatabaseError {
    move |source| DatabaseError::Sqlite { operation, source }
}

/// How a [`DerivedDatabase`] resolves point locations.
#[derive(Debug, Clone, Default)]
pub struct DatabaseOptions {
    /// Backing file of the point index; `None` reads locations from the
    /// base `points` table.
    pub point_index: Option<PathBuf>,
    /// Options used when opening the point index.
    pub point_index_options: PointIndexOptions,
}

impl DatabaseOptions {
    /// Keep point locations in the index file at `path`.
    #[must_use]
    pub fn with_point_index(mut self, path: impl Into<PathBuf>) -> Self {
        self.point_index = Some(path.into());
        self
    }

    /// Override the point index options.
    #[must_use]
    pub fn with_point_index_options(mut self, options: PointIndexOptions) -> Self {
        self.point_index_options = options;
        self
    }
}

/// Output of one update cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// What the diff changed in the base data.
    pub upstream: UpstreamChangesets,
    /// Output changeset of every table, in update order.
    pub outputs: Vec<(String, Changeset<OutputAction>)>,
}

impl CycleReport {
    /// Output changeset of `table`.
    #[must_use]
    pub fn output(&self, table: &str) -> Option<&Changeset<OutputAction>> {
        self.outputs
            .iter()
            .find(|(name, _)| name == table)
            .map(|(_, changes)| changes)
    }
}

/// A SQLite database holding base data and its derived tables.
///
/// # Examples
///
/// ```
/// use osm_derive_data::{DatabaseOptions, DerivedDatabase, Diff, RelationWayTable, TableRegistry};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut tables = TableRegistry::new();
/// tables.register(RelationWayTable::new())?;
/// let mut db = DerivedDatabase::open_in_memory(tables, DatabaseOptions::default())?;
/// db.import(Diff::from_opl("w1 Nn1,n2\nr1 Mw1@")?.into_elements())?;
///
/// let report = db.apply_diff(&Diff::from_opl("r2 Mw1@")?)?;
/// let changes = report.output("relation_ways").expect("table updated");
/// assert_eq!(changes.len(), 1);
/// db.close()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct DerivedDatabase {
    connection: Connection,
    tables: TableRegistry,
    point_index: Option<PointIndex>,
}

impl DerivedDatabase {
    /// Open or create the database at `path`, creating missing tables.
    pub fn open(
        path: &Utf8Path,
        tables: TableRegistry,
        options: DatabaseOptions,
    ) -> Result<Self, DatabaseError> {
        osm_derive_fs::ensure_parent_dir(path).map_err(|source| {
            DatabaseError::CreateDirectory {
                path: path.to_path_buf(),
                source,
            }
        })?;
        let connection = Connection::open(path.as_std_path()).map_err(|source| {
            DatabaseError::Open {
                path: path.to_path_buf(),
                source,
            }
        })?;
        debug!("opened database {path}");
        Self::with_connection(connection, tables, options)
    }

    /// Open a transient in-memory database.
    pub fn open_in_memory(
        tables: TableRegistry,
        options: DatabaseOptions,
    ) -> Result<Self, DatabaseError> {
        let connection = Connection::open_in_memory().map_err(|source| DatabaseError::Open {
            path: Utf8PathBuf::from(":memory:"),
            source,
        })?;
        Self::with_connection(connection, tables, options)
    }

    fn with_connection(
        mut connection: Connection,
        tables: TableRegistry,
        options: DatabaseOptions,
    ) -> Result<Self, DatabaseError> {
        store::initialise_schema(&mut connection)?;
        for table in tables.iter() {
            table.create(&connection)?;
        }
        let point_index = options
            .point_index
            .map(|path| PointIndex::open(path, options.point_index_options))
            .transpose()?;
        Ok(Self {
            connection,
            tables,
            point_index,
        })
    }

    /// Underlying connection, for queries against the tables.
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Registered tables in update order.
    #[must_use]
    pub fn tables(&self) -> &TableRegistry {
        &self.tables
    }

    /// The point index, if one is configured.
    pub fn point_index(&mut self) -> Option<&mut PointIndex> {
        self.point_index.as_mut()
    }

    /// Load `elements` as base data and build every table, in one
    /// transaction.
    pub fn import<I>(&mut self, elements: I) -> Result<ElementCounts, DatabaseError>
    where
        I: IntoIterator<Item = Element>,
    {
        let transaction = self
            .connection
            .transaction()
            .map_err(sqlite("begin import"))?;
        let mut counts = ElementCounts::default();
        for element in elements {
            if let (Element::Point(point), Some(index)) = (&element, self.point_index.as_mut()) {
                index.set(point.id, point.location)?;
            }
            store::insert_element(&transaction, &element)?;
            counts.record(element.kind());
        }
        construct_tables(&transaction, &self.tables, self.point_index.as_mut())?;
        transaction.commit().map_err(sqlite("commit import"))?;
        if let Some(index) = self.point_index.as_mut() {
            index.flush()?;
        }
        info!(
            "imported {} points, {} ways and {} relations",
            counts.points, counts.ways, counts.relations
        );
        Ok(counts)
    }

    /// Load an OSM PBF extract and build every table, in one transaction.
    pub fn import_pbf(&mut self, path: &Path) -> Result<IngestSummary, DatabaseError> {
        let transaction = self
            .connection
            .transaction()
            .map_err(sqlite("begin import"))?;
        let summary = ingest_osm_pbf(path, &transaction, self.point_index.as_mut())?;
        construct_tables(&transaction, &self.tables, self.point_index.as_mut())?;
        transaction.commit().map_err(sqlite("commit import"))?;
        if let Some(index) = self.point_index.as_mut() {
            index.flush()?;
        }
        Ok(summary)
    }

    /// Rebuild every table from the current base data.
    pub fn construct(&mut self) -> Result<(), DatabaseError> {
        let transaction = self
            .connection
            .transaction()
            .map_err(sqlite("begin construct"))?;
        construct_tables(&transaction, &self.tables, self.point_index.as_mut())?;
        transaction.commit().map_err(sqlite("commit construct"))
    }

    /// Apply `diff` and bring every table up to date, in one transaction.
    ///
    /// On error nothing is committed and the point index is left untouched.
    pub fn apply_diff(&mut self, diff: &Diff) -> Result<CycleReport, DatabaseError> {
        let transaction = self
            .connection
            .transaction()
            .map_err(sqlite("begin cycle"))?;
        let upstream = store::apply_diff(&transaction, diff)?;

        let mut pending = PendingPoints::default();
        if self.point_index.is_some() {
            for (id, action) in upstream.points.iter() {
                match action {
                    UpstreamAction::Deleted => pending.delete(id),
                    UpstreamAction::Created | UpstreamAction::Modified => {
                        if let Some(location) = store::point_location(&transaction, id)? {
                            pending.set(id, location)?;
                        }
                    }
                }
            }
        }

        let mut outputs = BTreeMap::new();
        let mut order = Vec::with_capacity(self.tables.len());
        for table in self.tables.iter() {
            let changes = {
                let coordinates = match self.point_index.as_mut() {
                    Some(index) => Coordinates::Index {
                        index,
                        pending: &pending,
                    },
                    None => Coordinates::Store,
                };
                let mut context = TableContext {
                    connection: &transaction,
                    upstream: &upstream,
                    outputs: &outputs,
                    coordinates,
                };
                table.update(&mut context)?
            };
            write_changeset(&transaction, table.name(), &changes)?;
            debug!("{}: {} output changes", table.name(), changes.len());
            order.push(table.name().to_owned());
            outputs.insert(table.name().to_owned(), changes);
        }
        store::clear_upstream_changesets(&transaction)?;
        transaction.commit().map_err(sqlite("commit cycle"))?;

        if let Some(index) = self.point_index.as_mut() {
            pending.apply(index)?;
            index.flush()?;
        }

        let outputs = order
            .into_iter()
            .filter_map(|name| outputs.remove(&name).map(|changes| (name, changes)))
            .collect();
        Ok(CycleReport { upstream, outputs })
    }

    /// Application metadata stored under `key`.
    pub fn metadata(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        Ok(store::metadata(&self.connection, key)?)
    }

    /// Store application metadata under `key`, replacing an earlier value.
    pub fn set_metadata(&mut self, key: &str, value: &str) -> Result<(), DatabaseError> {
        Ok(store::set_metadata(&self.connection, key, value)?)
    }

    /// Output changeset persisted by the last cycle for `table`.
    pub fn output_changeset(&self, table: &str) -> Result<Changeset<OutputAction>, DatabaseError> {
        Ok(read_changeset(&self.connection, table)?)
    }

    /// Close the point index and the connection.
    pub fn close(self) -> Result<(), DatabaseError> {
        if let Some(index) = self.point_index {
            index.close()?;
        }
        self.connection
            .close()
            .map_err(|(_, source)| DatabaseError::Sqlite {
                operation: "close",
                source,
            })
    }
}

/// Build every table in registration order.
fn construct_tables(
    connection: &Connection,
    tables: &TableRegistry,
    mut index: Option<&mut PointIndex>,
) -> Result<(), TableError> {
    let upstream = UpstreamChangesets::default();
    let outputs = BTreeMap::new();
    let pending = PendingPoints::default();
    for table in tables.iter() {
        let coordinates = match index.as_deref_mut() {
            Some(index) => Coordinates::Index {
                index,
                pending: &pending,
            },
            None => Coordinates::Store,
        };
        let mut context = TableContext {
            connection,
            upstream: &upstream,
            outputs: &outputs,
            coordinates,
        };
        table.construct(&mut context)?;
        debug!("constructed {}", table.name());
    }
    Ok(())
}

#[cfg(test)]
mod tests;
