//! Derived table contract and shared machinery.
//!
//! A derived table declares its dependencies, can rebuild itself from the
//! current base data and can bring itself up to date from the changesets of
//! its dependencies. The per-key refresh loop (recompute, compare, classify,
//! persist) is shared by all tables through [`KeyedRows`] and
//! [`refresh_keys`]; tables only supply dirty-key derivation and row logic.
//!
//! Every table owns a `<name>_changeset(id, action)` table holding the output
//! changeset of the last cycle.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use log::debug;
use osm_derive_core::{
    Changeset, ElementKind, OsmId, OutputAction, PointIndexError, UpstreamAction, classify,
};
use rusqlite::{Connection, Error as SqliteError};
use thiserror::Error;

use crate::store::{StoreError, UpstreamChangesets};

mod coordinates;
#[cfg(test)]
mod harness;
pub mod points;
pub mod relation_ways;
pub mod way_geometry;

pub use coordinates::{Coordinates, PendingPoints};

/// Something a derived table reads from.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Dependency {
    /// A base element kind and its upstream changeset.
    Base(ElementKind),
    /// Another derived table, by name, and its output changeset.
    Table(String),
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Base(kind) => write!(f, "base {kind}s"),
            Self::Table(name) => write!(f, "table {name}"),
        }
    }
}

/// Dependency data that contradicts itself.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Inconsistency {
    /// A way is recorded as created or modified but is not stored.
    #[error("way {way_id} is recorded as {action:?} but is missing from the base data")]
    MissingWay {
        /// Way id from the changeset.
        way_id: OsmId,
        /// Recorded action.
        action: UpstreamAction,
    },
    /// A way is recorded as deleted but is still stored.
    #[error("way {way_id} is recorded as deleted but is still present")]
    DeletedWayPresent {
        /// Way id from the changeset.
        way_id: OsmId,
    },
    /// A relation lists a way that was never stored.
    #[error("relation {relation_id} references way {way_id}, which is not in the base data")]
    UnresolvedMember {
        /// Referencing relation.
        relation_id: OsmId,
        /// Missing way.
        way_id: OsmId,
    },
}

/// Errors raised while building or updating a derived table.
#[derive(Debug, Error)]
pub enum TableError {
    /// A SQLite statement failed.
    #[error("table {table}: operation '{operation}' failed")]
    Sqlite {
        /// Table being maintained.
        table: String,
        /// Operation being performed.
        operation: &'static str,
        /// Source error returned by `rusqlite`.
        #[source]
        source: SqliteError,
    },
    /// Reading base data failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Reading the point index failed.
    #[error(transparent)]
    PointIndex(#[from] PointIndexError),
    /// A row column could not be encoded as JSON.
    #[error("table {table}: failed to encode row {key}")]
    Encode {
        /// Table being maintained.
        table: String,
        /// Row key.
        key: OsmId,
        /// Source error produced by `serde_json`.
        #[source]
        source: serde_json::Error,
    },
    /// A stored row column could not be decoded.
    #[error("table {table}: failed to decode row {key}")]
    Decode {
        /// Table being maintained.
        table: String,
        /// Row key.
        key: OsmId,
        /// Source error produced by `serde_json`.
        #[source]
        source: serde_json::Error,
    },
    /// A changeset row holds an unknown action code.
    #[error("table {table}: changeset row {key} holds unknown action {code:?}")]
    UnknownAction {
        /// Table whose changeset was read.
        table: String,
        /// Row key.
        key: OsmId,
        /// Raw action code.
        code: String,
    },
    /// Dependency data contradicts itself; the cycle must be aborted.
    #[error("table {table}: {problem}")]
    DependencyInconsistency {
        /// Table that detected the problem.
        table: String,
        /// What was inconsistent.
        #[source]
        problem: Inconsistency,
    },
}

pub(crate) fn sqlite_error<'a>(
    table: &'a str,
    operation: &'static str,
) -> impl FnOnce(SqliteError) -> TableError + 'a {
    move |source| TableError::Sqlite {
        table: table.to_owned(),
        operation,
        source,
    }
}

/// Everything a table may read while building or updating.
///
/// During a full build the changesets are empty.
#[derive(Debug)]
pub struct TableContext<'a> {
    /// Connection inside the running transaction.
    pub connection: &'a Connection,
    /// What the diff changed in the base data.
    pub upstream: &'a UpstreamChangesets,
    /// Output changesets of the tables already updated in this cycle.
    pub outputs: &'a BTreeMap<String, Changeset<OutputAction>>,
    /// Point location source.
    pub coordinates: Coordinates<'a>,
}

impl TableContext<'_> {
    /// Output changeset of an upstream table, empty if it recorded nothing.
    #[must_use]
    pub fn table_changes(&self, name: &str) -> Option<&Changeset<OutputAction>> {
        self.outputs.get(name)
    }
}

/// Ordered set of output keys whose rows must be recomputed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirtyKeys {
    keys: BTreeSet<OsmId>,
}

impl DirtyKeys {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `key` dirty.
    pub fn insert(&mut self, key: OsmId) {
        self.keys.insert(key);
    }

    /// Whether `key` is marked.
    #[must_use]
    pub fn contains(&self, key: OsmId) -> bool {
        self.keys.contains(&key)
    }

    /// Marked keys in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = OsmId> + '_ {
        self.keys.iter().copied()
    }

    /// Number of marked keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether nothing is marked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl Extend<OsmId> for DirtyKeys {
    fn extend<I: IntoIterator<Item = OsmId>>(&mut self, iter: I) {
        self.keys.extend(iter);
    }
}

impl FromIterator<OsmId> for DirtyKeys {
    fn from_iter<I: IntoIterator<Item = OsmId>>(iter: I) -> Self {
        Self {
            keys: iter.into_iter().collect(),
        }
    }
}

/// Row-level access for tables keyed by a single id.
pub trait KeyedRows {
    /// Materialised row; `PartialEq` decides between Modified and unchanged.
    type Row: PartialEq;

    /// Row currently stored for `key`.
    fn stored(&self, context: &mut TableContext<'_>, key: OsmId)
    -> Result<Option<Self::Row>, TableError>;

    /// Row `key` should hold given the current dependency state.
    fn recompute(
        &self,
        context: &mut TableContext<'_>,
        key: OsmId,
    ) -> Result<Option<Self::Row>, TableError>;

    /// Replace the stored row for `key`; `None` removes it.
    fn write(
        &self,
        context: &mut TableContext<'_>,
        key: OsmId,
        row: Option<&Self::Row>,
    ) -> Result<(), TableError>;
}

/// Recompute every dirty key, persist the rows that changed and return the
/// resulting output changeset.
pub fn refresh_keys<T>(
    table: &T,
    context: &mut TableContext<'_>,
    dirty: &DirtyKeys,
) -> Result<Changeset<OutputAction>, TableError>
where
    T: KeyedRows + ?Sized,
{
    let mut changes = Changeset::new();
    for key in dirty.iter() {
        let before = table.stored(context, key)?;
        let after = table.recompute(context, key)?;
        if let Some(action) = classify(before.as_ref(), after.as_ref()) {
            table.write(context, key, after.as_ref())?;
            changes.insert(key, action);
        }
    }
    Ok(changes)
}

/// A table maintained from base data and other tables.
pub trait DerivedTable: fmt::Debug {
    /// SQL name of the table; also prefixes its auxiliary tables.
    fn name(&self) -> &str;

    /// What the table reads.
    fn dependencies(&self) -> Vec<Dependency>;

    /// Create the table and its auxiliary tables if missing.
    fn create(&self, connection: &Connection) -> Result<(), TableError>;

    /// Rebuild every row from the current base data.
    fn construct(&self, context: &mut TableContext<'_>) -> Result<(), TableError>;

    /// Bring the table up to date with the changesets in `context` and return
    /// the table's own output changeset.
    fn update(&self, context: &mut TableContext<'_>)
    -> Result<Changeset<OutputAction>, TableError>;
}

/// Errors raised when registering a table.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistrationError {
    /// The name is not a plain lowercase SQL identifier.
    #[error("table name {name:?} must match [a-z_][a-z0-9_]*")]
    InvalidName {
        /// Rejected name.
        name: String,
    },
    /// The name collides with a base table or changeset table.
    #[error("table name {name:?} is reserved")]
    Reserved {
        /// Rejected name.
        name: String,
    },
    /// A table with the same name is already registered.
    #[error("table {name} is already registered")]
    Duplicate {
        /// Rejected name.
        name: String,
    },
    /// A table dependency has not been registered yet.
    #[error("table {table} depends on {dependency}, which must be registered first")]
    UnknownDependency {
        /// Table being registered.
        table: String,
        /// Missing dependency.
        dependency: String,
    },
}

const RESERVED_NAMES: [&str; 5] = [
    "points",
    "ways",
    "relations",
    "relation_members",
    "osm_derive_schema_version",
];

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|first| first.is_ascii_lowercase() || first == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Derived tables in dependency order.
///
/// # Examples
///
/// ```
/// use osm_derive_data::{RelationWayTable, TableRegistry, WayGeometryTable};
///
/// let mut tables = TableRegistry::new();
/// tables.register(RelationWayTable::new()).expect("register membership table");
/// tables
///     .register(WayGeometryTable::new("relation_way_geometry", "relation_ways"))
///     .expect("register geometry table");
/// assert_eq!(tables.names(), vec!["relation_ways", "relation_way_geometry"]);
/// ```
#[derive(Debug, Default)]
pub struct TableRegistry {
    tables: Vec<Box<dyn DerivedTable>>,
}

impl TableRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a table after checking its name and dependencies.
    pub fn register<T>(&mut self, table: T) -> Result<&mut Self, RegistrationError>
    where
        T: DerivedTable + 'static,
    {
        let name = table.name().to_owned();
        if !is_valid_name(&name) {
            return Err(RegistrationError::InvalidName { name });
        }
        if RESERVED_NAMES.contains(&name.as_str()) || name.ends_with("_changeset") {
            return Err(RegistrationError::Reserved { name });
        }
        if self.get(&name).is_some() {
            return Err(RegistrationError::Duplicate { name });
        }
        for dependency in table.dependencies() {
            if let Dependency::Table(upstream) = dependency {
                if self.get(&upstream).is_none() {
                    return Err(RegistrationError::UnknownDependency {
                        table: name,
                        dependency: upstream,
                    });
                }
            }
        }
        debug!("registered derived table {name}");
        self.tables.push(Box::new(table));
        Ok(self)
    }

    /// Registered table called `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&dyn DerivedTable> {
        self.tables
            .iter()
            .find(|table| table.name() == name)
            .map(|table| &**table)
    }

    /// Tables in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &dyn DerivedTable> + '_ {
        self.tables.iter().map(|table| &**table)
    }

    /// Names in registration order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.tables.iter().map(|table| table.name()).collect()
    }

    /// Number of registered tables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Whether no table is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Create the `<table>_changeset` table if missing.
pub fn create_changeset_table(connection: &Connection, table: &str) -> Result<(), TableError> {
    let sql = format!(
        "CREATE TABLE IF NOT EXISTS {table}_changeset (
            id INTEGER PRIMARY KEY,
            action TEXT NOT NULL CHECK (action IN ('A', 'M', 'D'))
        )"
    );
    connection
        .execute(&sql, [])
        .map(|_| ())
        .map_err(sqlite_error(table, "create changeset table"))
}

/// Replace the persisted output changeset of `table`.
pub fn write_changeset(
    connection: &Connection,
    table: &str,
    changes: &Changeset<OutputAction>,
) -> Result<(), TableError> {
    connection
        .execute(&format!("DELETE FROM {table}_changeset"), [])
        .map_err(sqlite_error(table, "clear changeset"))?;
    let mut insert = connection
        .prepare_cached(&format!(
            "INSERT INTO {table}_changeset (id, action) VALUES (?1, ?2)"
        ))
        .map_err(sqlite_error(table, "prepare changeset insert"))?;
    for (key, action) in changes.iter() {
        insert
            .execute((key, action.code()))
            .map_err(sqlite_error(table, "insert changeset row"))?;
    }
    Ok(())
}

/// Read the persisted output changeset of `table`.
pub fn read_changeset(
    connection: &Connection,
    table: &str,
) -> Result<Changeset<OutputAction>, TableError> {
    let mut statement = connection
        .prepare_cached(&format!("SELECT id, action FROM {table}_changeset ORDER BY id"))
        .map_err(sqlite_error(table, "prepare changeset read"))?;
    let mut rows = statement
        .query([])
        .map_err(sqlite_error(table, "read changeset"))?;
    let mut changes = Changeset::new();
    while let Some(row) = rows.next().map_err(sqlite_error(table, "read changeset row"))? {
        let key: OsmId = row.get(0).map_err(sqlite_error(table, "read changeset key"))?;
        let code: String = row
            .get(1)
            .map_err(sqlite_error(table, "read changeset action"))?;
        let action = OutputAction::from_code(&code).ok_or_else(|| TableError::UnknownAction {
            table: table.to_owned(),
            key,
            code: code.clone(),
        })?;
        changes.insert(key, action);
    }
    Ok(changes)
}
