//! Import command: load base data and build every derived table.

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use log::info;
use ortho_config::{OrthoConfig, SubcmdConfigMerge};
use osm_derive_data::{DatabaseOptions, DerivedDatabase};
use serde::{Deserialize, Serialize};
use std::io::{self, Write};

use crate::layout::Layout;
use crate::{
    ARG_DATABASE, ARG_FRESH, ARG_OPL, ARG_OSM_PBF, ARG_POINT_INDEX, ARG_POINT_TAG, ARG_SRID,
    ARG_SKIP_MISSING_MEMBERS, CliError, ENV_IMPORT_DATABASE, ENV_IMPORT_OSM_PBF, read_opl,
    require_existing,
};

/// CLI arguments for the `import` subcommand.
#[derive(Debug, Clone, Parser, Deserialize, Serialize, OrthoConfig, Default)]
#[command(
    name = "import",
    long_about = "Load an OSM PBF extract or an OPL file as base data and build \
                 every derived table. Paths can come from CLI flags, \
                 configuration files, or environment variables.",
    about = "Load base data and build every derived table"
)]
#[ortho_config(prefix = "OSM_DERIVE")]
pub(crate) struct ImportArgs {
    /// SQLite database to create or extend.
    #[arg(long = ARG_DATABASE, value_name = "path")]
    #[serde(default)]
    pub(crate) database: Option<Utf8PathBuf>,
    /// OpenStreetMap PBF extract to load.
    #[arg(long = ARG_OSM_PBF, value_name = "path")]
    #[serde(default)]
    pub(crate) osm_pbf: Option<Utf8PathBuf>,
    /// OPL file to load instead of a PBF extract.
    #[arg(long = ARG_OPL, value_name = "path")]
    #[serde(default)]
    pub(crate) opl: Option<Utf8PathBuf>,
    /// Keep point locations in this index file.
    #[arg(long = ARG_POINT_INDEX, value_name = "path")]
    #[serde(default)]
    pub(crate) point_index: Option<Utf8PathBuf>,
    /// Tag key selecting points for the point table; repeatable.
    #[arg(long = ARG_POINT_TAG, value_name = "key")]
    #[serde(default)]
    pub(crate) point_tag: Vec<String>,
    /// Output SRID, 4326 or 3857.
    #[arg(long = ARG_SRID, value_name = "code")]
    #[serde(default)]
    pub(crate) srid: Option<u32>,
    /// Drop relation members naming unknown ways instead of failing.
    #[arg(long = ARG_SKIP_MISSING_MEMBERS)]
    #[serde(default)]
    pub(crate) skip_missing_members: bool,
    /// Remove an existing database and point index first.
    #[arg(long = ARG_FRESH)]
    #[serde(default)]
    pub(crate) fresh: bool,
}

impl ImportArgs {
    pub(crate) fn into_config(self) -> Result<ImportConfig, CliError> {
        let merged = self.load_and_merge().map_err(CliError::Configuration)?;
        ImportConfig::try_from(merged)
    }
}

/// Where the base data comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ImportSource {
    Pbf(Utf8PathBuf),
    Opl(Utf8PathBuf),
}

impl ImportSource {
    fn path(&self) -> &Utf8Path {
        match self {
            Self::Pbf(path) | Self::Opl(path) => path,
        }
    }

    const fn field(&self) -> &'static str {
        match self {
            Self::Pbf(_) => ARG_OSM_PBF,
            Self::Opl(_) => ARG_OPL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ImportConfig {
    pub(crate) database: Utf8PathBuf,
    pub(crate) source: ImportSource,
    pub(crate) point_index: Option<Utf8PathBuf>,
    pub(crate) fresh: bool,
    pub(crate) layout: Layout,
}

impl ImportConfig {
    pub(crate) fn validate_sources(&self) -> Result<(), CliError> {
        require_existing(self.source.path(), self.source.field())
    }

    fn database_options(&self) -> DatabaseOptions {
        match &self.point_index {
            Some(path) => DatabaseOptions::default().with_point_index(path.clone()),
            None => DatabaseOptions::default(),
        }
    }
}

impl TryFrom<ImportArgs> for ImportConfig {
    type Error = CliError;

    fn try_from(args: ImportArgs) -> Result<Self, Self::Error> {
        let database = args.database.ok_or(CliError::MissingArgument {
            field: ARG_DATABASE,
            env: ENV_IMPORT_DATABASE,
        })?;
        let source = match (args.osm_pbf, args.opl) {
            (Some(_), Some(_)) => {
                return Err(CliError::ConflictingArguments {
                    first: ARG_OSM_PBF,
                    second: ARG_OPL,
                });
            }
            (Some(path), None) => ImportSource::Pbf(path),
            (None, Some(path)) => ImportSource::Opl(path),
            (None, None) => {
                return Err(CliError::MissingArgument {
                    field: ARG_OSM_PBF,
                    env: ENV_IMPORT_OSM_PBF,
                });
            }
        };
        let layout = Layout::from_options(args.point_tag, args.skip_missing_members, args.srid)?;
        Ok(Self {
            database,
            source,
            point_index: args.point_index,
            fresh: args.fresh,
            layout,
        })
    }
}

/// What an import wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ImportOutcome {
    pub(crate) database: Utf8PathBuf,
    pub(crate) points: u64,
    pub(crate) ways: u64,
    pub(crate) relations: u64,
    pub(crate) skipped_points: u64,
    pub(crate) tables: Vec<String>,
}

impl ImportOutcome {
    pub(crate) fn write_summary<W: Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(
            out,
            "imported {} points, {} ways and {} relations into {}",
            self.points, self.ways, self.relations, self.database
        )?;
        if self.skipped_points > 0 {
            writeln!(
                out,
                "skipped {} points with invalid locations",
                self.skipped_points
            )?;
        }
        writeln!(out, "built {}", self.tables.join(", "))
    }
}

fn remove_existing(path: &Utf8Path) -> Result<(), CliError> {
    let removed =
        osm_derive_fs::remove_file_if_present(path).map_err(|source| CliError::RemoveExisting {
            path: path.to_path_buf(),
            source,
        })?;
    if removed {
        info!("removed {path}");
    }
    Ok(())
}

pub(crate) fn execute(config: &ImportConfig) -> Result<ImportOutcome, CliError> {
    if config.fresh {
        remove_existing(&config.database)?;
        if let Some(index) = &config.point_index {
            remove_existing(index)?;
        }
    }
    let tables = config.layout.registry()?;
    let mut db = DerivedDatabase::open(&config.database, tables, config.database_options())?;
    config.layout.record(&mut db, &config.database)?;
    let mut outcome = ImportOutcome {
        database: config.database.clone(),
        points: 0,
        ways: 0,
        relations: 0,
        skipped_points: 0,
        tables: db.tables().names().into_iter().map(str::to_owned).collect(),
    };
    match &config.source {
        ImportSource::Pbf(path) => {
            let summary = db.import_pbf(path.as_std_path())?;
            outcome.points = summary.points;
            outcome.ways = summary.ways;
            outcome.relations = summary.relations;
            outcome.skipped_points = summary.skipped_points;
        }
        ImportSource::Opl(path) => {
            let diff = read_opl(path)?;
            let counts = db.import(diff.into_elements())?;
            outcome.points = counts.points;
            outcome.ways = counts.ways;
            outcome.relations = counts.relations;
        }
    }
    db.close()?;
    Ok(outcome)
}
