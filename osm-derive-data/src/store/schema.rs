//! SQLite schema for the base entity store.

use rusqlite::{Connection, Error as SqliteError, OptionalExtension, Transaction};
use thiserror::Error;

/// Version recorded in `osm_derive_schema_version`.
pub const SCHEMA_VERSION: i64 = 1;

/// Create the base tables, changeset tables and indexes if missing and check
/// the recorded schema version.
///
/// # Examples
/// ```
/// use rusqlite::Connection;
/// use osm_derive_data::store::initialise_schema;
///
/// let mut conn = Connection::open_in_memory().expect("create in-memory database");
/// initialise_schema(&mut conn).expect("create base schema");
///
/// let version: i64 = conn
///     .query_row("SELECT version FROM osm_derive_schema_version", [], |row| row.get(0))
///     .expect("read schema version");
/// assert_eq!(version, 1);
/// ```
pub fn initialise_schema(connection: &mut Connection) -> Result<(), SchemaError> {
    let transaction = connection
        .transaction()
        .map_err(|source| SchemaError::Migration {
            step: "begin schema transaction",
            source,
        })?;

    create_base_tables(&transaction)?;
    create_changeset_tables(&transaction)?;
    create_indexes(&transaction)?;
    ensure_schema_version(&transaction)?;

    transaction
        .commit()
        .map_err(|source| SchemaError::Migration {
            step: "commit schema transaction",
            source,
        })
}

fn create_base_tables(transaction: &Transaction<'_>) -> Result<(), SchemaError> {
    run_migration_step(
        transaction,
        "create points",
        "CREATE TABLE IF NOT EXISTS points (
            id INTEGER PRIMARY KEY,
            lon REAL NOT NULL,
            lat REAL NOT NULL,
            tags TEXT NOT NULL
        )",
    )?;
    run_migration_step(
        transaction,
        "create ways",
        "CREATE TABLE IF NOT EXISTS ways (
            id INTEGER PRIMARY KEY,
            nodes TEXT NOT NULL,
            tags TEXT NOT NULL
        )",
    )?;
    run_migration_step(
        transaction,
        "create relations",
        "CREATE TABLE IF NOT EXISTS relations (
            id INTEGER PRIMARY KEY,
            tags TEXT NOT NULL
        )",
    )?;
    run_migration_step(
        transaction,
        "create relation_members",
        "CREATE TABLE IF NOT EXISTS relation_members (
            relation_id INTEGER NOT NULL,
            member_id INTEGER NOT NULL,
            member_type TEXT NOT NULL CHECK (member_type IN ('N', 'W', 'R')),
            member_role TEXT NOT NULL,
            sequence_id INTEGER NOT NULL,
            PRIMARY KEY (relation_id, sequence_id)
        ) WITHOUT ROWID",
    )?;
    run_migration_step(
        transaction,
        "create osm_derive_metadata",
        "CREATE TABLE IF NOT EXISTS osm_derive_metadata (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        ) WITHOUT ROWID",
    )
}

fn create_changeset_tables(transaction: &Transaction<'_>) -> Result<(), SchemaError> {
    for (step, sql) in [
        (
            "create point_changeset",
            "CREATE TABLE IF NOT EXISTS point_changeset (
                id INTEGER PRIMARY KEY,
                action TEXT NOT NULL CHECK (action IN ('C', 'M', 'D'))
            )",
        ),
        (
            "create way_changeset",
            "CREATE TABLE IF NOT EXISTS way_changeset (
                id INTEGER PRIMARY KEY,
                action TEXT NOT NULL CHECK (action IN ('C', 'M', 'D'))
            )",
        ),
        (
            "create relation_changeset",
            "CREATE TABLE IF NOT EXISTS relation_changeset (
                id INTEGER PRIMARY KEY,
                action TEXT NOT NULL CHECK (action IN ('C', 'M', 'D'))
            )",
        ),
    ] {
        run_migration_step(transaction, step, sql)?;
    }
    Ok(())
}

fn create_indexes(transaction: &Transaction<'_>) -> Result<(), SchemaError> {
    run_migration_step(
        transaction,
        "index relation_members",
        "CREATE INDEX IF NOT EXISTS idx_relation_members_member
            ON relation_members(member_type, member_id, relation_id)",
    )
}

fn ensure_schema_version(transaction: &Transaction<'_>) -> Result<(), SchemaError> {
    run_migration_step(
        transaction,
        "create schema version table",
        "CREATE TABLE IF NOT EXISTS osm_derive_schema_version (
            version INTEGER PRIMARY KEY CHECK (version > 0),
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        ) WITHOUT ROWID",
    )?;

    let existing_version: Option<i64> = transaction
        .query_row(
            "SELECT version FROM osm_derive_schema_version LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(|source| SchemaError::Migration {
            step: "read schema version",
            source,
        })?;

    match existing_version {
        Some(version) if version == SCHEMA_VERSION => Ok(()),
        Some(found) => Err(SchemaError::VersionMismatch {
            expected: SCHEMA_VERSION,
            found,
        }),
        None => transaction
            .execute(
                "INSERT INTO osm_derive_schema_version (version) VALUES (?1)",
                [SCHEMA_VERSION],
            )
            .map(|_| ())
            .map_err(|source| SchemaError::Migration {
                step: "record schema version",
                source,
            }),
    }
}

fn run_migration_step(
    transaction: &Transaction<'_>,
    step: &'static str,
    sql: &str,
) -> Result<(), SchemaError> {
    transaction
        .execute(sql, [])
        .map(|_| ())
        .map_err(|source| SchemaError::Migration { step, source })
}

/// Errors raised when initialising the base schema.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// A schema statement failed.
    #[error("failed to execute migration step '{step}'")]
    Migration {
        /// Step being executed.
        step: &'static str,
        /// Source error returned by `rusqlite`.
        #[source]
        source: SqliteError,
    },
    /// The database was created by an incompatible version.
    #[error(
        "expected osm-derive schema version {expected} but found {found}; rebuild the database"
    )]
    VersionMismatch {
        /// Version this build understands.
        expected: i64,
        /// Version recorded in the database.
        found: i64,
    },
}
