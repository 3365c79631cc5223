//! Update command: apply OPL diffs, one cycle per file.

use camino::Utf8PathBuf;
use clap::Parser;
use log::info;
use ortho_config::{OrthoConfig, SubcmdConfigMerge};
use osm_derive_core::{Changeset, OutputAction};
use osm_derive_data::{CycleReport, DatabaseOptions, DerivedDatabase};
use serde::{Deserialize, Serialize};
use std::io::{self, Write};

use crate::layout::Layout;
use crate::{
    ARG_DATABASE, ARG_DIFF, ARG_POINT_INDEX, ARG_POINT_TAG, ARG_SKIP_MISSING_MEMBERS, ARG_SRID,
    CliError, ENV_UPDATE_DATABASE, ENV_UPDATE_DIFF, read_opl, require_existing,
};

/// CLI arguments for the `update` subcommand.
#[derive(Debug, Clone, Parser, Deserialize, Serialize, OrthoConfig, Default)]
#[command(
    name = "update",
    long_about = "Apply OPL diffs to an imported database. Each diff runs as \
                 one update cycle in the order given; a failing diff stops \
                 the run and leaves the database as the previous cycle \
                 committed it. Table options must match the ones the \
                 database was imported with.",
    about = "Apply OPL diffs and update every derived table"
)]
#[ortho_config(prefix = "OSM_DERIVE")]
pub(crate) struct UpdateArgs {
    /// SQLite database written by `import`.
    #[arg(long = ARG_DATABASE, value_name = "path")]
    #[serde(default)]
    pub(crate) database: Option<Utf8PathBuf>,
    /// OPL diff to apply; repeatable.
    #[arg(long = ARG_DIFF, value_name = "path")]
    #[serde(default)]
    pub(crate) diff: Vec<Utf8PathBuf>,
    /// Point index file written by `import`.
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
}

impl UpdateArgs {
    pub(crate) fn into_config(self) -> Result<UpdateConfig, CliError> {
        let merged = self.load_and_merge().map_err(CliError::Configuration)?;
        UpdateConfig::try_from(merged)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct UpdateConfig {
    pub(crate) database: Utf8PathBuf,
    pub(crate) diffs: Vec<Utf8PathBuf>,
    pub(crate) point_index: Option<Utf8PathBuf>,
    pub(crate) layout: Layout,
}

impl UpdateConfig {
    /// The database, the point index and every diff must already exist.
    pub(crate) fn validate_sources(&self) -> Result<(), CliError> {
        require_existing(&self.database, ARG_DATABASE)?;
        if let Some(index) = &self.point_index {
            require_existing(index, ARG_POINT_INDEX)?;
        }
        for diff in &self.diffs {
            require_existing(diff, ARG_DIFF)?;
        }
        Ok(())
    }
}

impl TryFrom<UpdateArgs> for UpdateConfig {
    type Error = CliError;

    fn try_from(args: UpdateArgs) -> Result<Self, Self::Error> {
        let database = args.database.ok_or(CliError::MissingArgument {
            field: ARG_DATABASE,
            env: ENV_UPDATE_DATABASE,
        })?;
        if args.diff.is_empty() {
            return Err(CliError::MissingArgument {
                field: ARG_DIFF,
                env: ENV_UPDATE_DIFF,
            });
        }
        let layout = Layout::from_options(args.point_tag, args.skip_missing_members, args.srid)?;
        Ok(Self {
            database,
            diffs: args.diff,
            point_index: args.point_index,
            layout,
        })
    }
}

/// Reports of the cycles an update ran, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct UpdateOutcome {
    pub(crate) cycles: Vec<(Utf8PathBuf, CycleReport)>,
}

impl UpdateOutcome {
    pub(crate) fn write_summary<W: Write>(&self, out: &mut W) -> io::Result<()> {
        for (path, report) in &self.cycles {
            let upstream = &report.upstream;
            writeln!(
                out,
                "{path}: {} points, {} ways and {} relations changed",
                upstream.points.len(),
                upstream.ways.len(),
                upstream.relations.len()
            )?;
            for (table, changes) in &report.outputs {
                write_changes(out, table, changes)?;
            }
        }
        Ok(())
    }
}

fn write_changes<W: Write>(
    out: &mut W,
    table: &str,
    changes: &Changeset<OutputAction>,
) -> io::Result<()> {
    let (mut added, mut modified, mut deleted) = (0_usize, 0_usize, 0_usize);
    for (_, action) in changes.iter() {
        match action {
            OutputAction::Added => added += 1,
            OutputAction::Modified => modified += 1,
            OutputAction::Deleted => deleted += 1,
        }
    }
    writeln!(
        out,
        "  {table}: {added} added, {modified} modified, {deleted} deleted"
    )
}

pub(crate) fn execute(config: &UpdateConfig) -> Result<UpdateOutcome, CliError> {
    let tables = config.layout.registry()?;
    let options = match &config.point_index {
        Some(path) => DatabaseOptions::default().with_point_index(path.clone()),
        None => DatabaseOptions::default(),
    };
    let mut db = DerivedDatabase::open(&config.database, tables, options)?;
    config.layout.verify(&db, &config.database)?;
    let mut cycles = Vec::with_capacity(config.diffs.len());
    for path in &config.diffs {
        let diff = read_opl(path)?;
        let report = db.apply_diff(&diff)?;
        info!("applied {} entries from {path}", diff.len());
        cycles.push((path.clone(), report));
    }
    db.close()?;
    Ok(UpdateOutcome { cycles })
}
