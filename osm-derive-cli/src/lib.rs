//! Command-line interface for building and maintaining derived OSM tables.
//!
//! `import` loads base data (PBF or OPL) into a fresh database and builds
//! every derived table; `update` applies OPL diffs one cycle at a time and
//! reports each table's output changeset.
#![forbid(unsafe_code)]

use camino::Utf8Path;
use clap::{Parser, Subcommand};
use osm_derive_data::Diff;
use std::io::{self, Write};

mod error;
mod import;
mod layout;
mod update;

pub use error::CliError;
use import::{ImportArgs, ImportConfig, ImportOutcome};
use update::{UpdateArgs, UpdateConfig, UpdateOutcome};

pub(crate) const ARG_DATABASE: &str = "database";
pub(crate) const ARG_POINT_INDEX: &str = "point-index";
pub(crate) const ARG_OSM_PBF: &str = "osm-pbf";
pub(crate) const ARG_OPL: &str = "opl";
pub(crate) const ARG_DIFF: &str = "diff";
pub(crate) const ARG_POINT_TAG: &str = "point-tag";
pub(crate) const ARG_SRID: &str = "srid";
pub(crate) const ARG_SKIP_MISSING_MEMBERS: &str = "skip-missing-members";
pub(crate) const ARG_FRESH: &str = "fresh";
pub(crate) const ENV_IMPORT_DATABASE: &str = "OSM_DERIVE_CMDS_IMPORT_DATABASE";
pub(crate) const ENV_IMPORT_OSM_PBF: &str = "OSM_DERIVE_CMDS_IMPORT_OSM_PBF";
pub(crate) const ENV_UPDATE_DATABASE: &str = "OSM_DERIVE_CMDS_UPDATE_DATABASE";
pub(crate) const ENV_UPDATE_DIFF: &str = "OSM_DERIVE_CMDS_UPDATE_DIFF";

/// Run the CLI with the current process arguments and environment.
pub fn run() -> Result<(), CliError> {
    let cli = Cli::try_parse().map_err(CliError::ArgumentParsing)?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    match cli.command {
        Command::Import(args) => {
            let outcome = run_import(args)?;
            outcome.write_summary(&mut out)
        }
        Command::Update(args) => {
            let outcome = run_update(args)?;
            outcome.write_summary(&mut out)
        }
    }
    .and_then(|()| out.flush())
    .map_err(CliError::WriteOutput)
}

fn run_import(args: ImportArgs) -> Result<ImportOutcome, CliError> {
    let config = args.into_config()?;
    config.validate_sources()?;
    import::execute(&config)
}

fn run_update(args: UpdateArgs) -> Result<UpdateOutcome, CliError> {
    let config = args.into_config()?;
    config.validate_sources()?;
    update::execute(&config)
}

#[derive(Debug, Parser)]
#[command(
    name = "osm-derive",
    about = "Build derived tables from OpenStreetMap data and keep them current",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load base data and build every derived table.
    Import(ImportArgs),
    /// Apply OPL diffs and update every derived table.
    Update(UpdateArgs),
}

/// Fail unless `path` names an existing regular file.
pub(crate) fn require_existing(path: &Utf8Path, field: &'static str) -> Result<(), CliError> {
    match osm_derive_fs::file_is_file(path) {
        Ok(true) => Ok(()),
        Ok(false) => Err(CliError::SourcePathNotFile {
            field,
            path: path.to_path_buf(),
        }),
        Err(source) if source.kind() == io::ErrorKind::NotFound => {
            Err(CliError::MissingSourceFile {
                field,
                path: path.to_path_buf(),
            })
        }
        Err(source) => Err(CliError::InspectSourcePath {
            field,
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Read and parse the OPL file at `path`.
pub(crate) fn read_opl(path: &Utf8Path) -> Result<Diff, CliError> {
    let text = osm_derive_fs::read_to_string(path).map_err(|source| CliError::ReadOpl {
        path: path.to_path_buf(),
        source,
    })?;
    Diff::from_opl(&text).map_err(|source| CliError::ParseOpl {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests;
