//! Error types emitted by the osm-derive CLI.
//!
//! Keep this error type reasonably small, as every CLI helper returns
//! `Result<_, CliError>`; large library errors are boxed.

use std::sync::Arc;

use camino::Utf8PathBuf;
use osm_derive_data::{DatabaseError, OplError, RegistrationError};
use thiserror::Error;

/// Errors emitted by the osm-derive CLI.
#[derive(Debug, Error)]
pub enum CliError {
    /// Provided arguments failed Clap validation.
    #[error(transparent)]
    ArgumentParsing(#[from] clap::Error),
    /// Configuration layering failed (files, env, CLI).
    #[error("failed to load configuration: {0}")]
    Configuration(#[from] Arc<ortho_config::OrthoError>),
    /// A required option is missing after configuration merging.
    #[error("missing {field} (set --{field} or {env})")]
    MissingArgument {
        field: &'static str,
        env: &'static str,
    },
    /// Two options that exclude each other were both set.
    #[error("--{first} and --{second} cannot be combined")]
    ConflictingArguments {
        first: &'static str,
        second: &'static str,
    },
    /// The requested SRID has no projection.
    #[error("unsupported --{field} {code} (expected 4326 or 3857)")]
    UnsupportedSrid { field: &'static str, code: u32 },
    /// A referenced input path does not exist on disk.
    #[error("{field} path {path:?} does not exist")]
    MissingSourceFile {
        field: &'static str,
        path: Utf8PathBuf,
    },
    /// A referenced input path exists but is not a file.
    #[error("{field} path {path:?} exists but is not a file")]
    SourcePathNotFile {
        field: &'static str,
        path: Utf8PathBuf,
    },
    /// A referenced input path could not be inspected due to an IO error.
    #[error("failed to inspect {field} path {path:?}: {source}")]
    InspectSourcePath {
        field: &'static str,
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Removing an existing file before a fresh import failed.
    #[error("failed to remove {path:?}: {source}")]
    RemoveExisting {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// An OPL file could not be read.
    #[error("failed to read OPL file {path:?}: {source}")]
    ReadOpl {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// An OPL file could not be parsed.
    #[error("failed to parse OPL file {path:?}: {source}")]
    ParseOpl {
        path: Utf8PathBuf,
        #[source]
        source: OplError,
    },
    /// The derived table layout was rejected.
    #[error("invalid table layout: {0}")]
    Layout(#[from] RegistrationError),
    /// The database was imported with different table options.
    #[error("{database} was imported with {stored}, but this run uses {requested}")]
    LayoutMismatch {
        database: Utf8PathBuf,
        stored: String,
        requested: String,
    },
    /// The database holds no recorded table options.
    #[error("{database} has no recorded table layout; import it with osm-derive first")]
    LayoutMissing { database: Utf8PathBuf },
    /// The recorded table options could not be encoded.
    #[error("failed to record the table layout in {database}: {source}")]
    EncodeLayout {
        database: Utf8PathBuf,
        #[source]
        source: serde_json::Error,
    },
    /// The recorded table options could not be decoded.
    #[error("failed to read the table layout recorded in {database}: {source}")]
    DecodeLayout {
        database: Utf8PathBuf,
        #[source]
        source: serde_json::Error,
    },
    /// Building or updating the database failed.
    #[error("database failure: {0}")]
    Database(#[source] Box<DatabaseError>),
    /// Writing the command summary failed.
    #[error("failed to write output: {0}")]
    WriteOutput(#[source] std::io::Error),
}

impl From<DatabaseError> for CliError {
    fn from(err: DatabaseError) -> Self {
        Self::Database(Box::new(err))
    }
}
