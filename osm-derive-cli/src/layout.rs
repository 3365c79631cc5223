//! The derived tables maintained by the CLI.
//!
//! `import` records the layout it built in the database metadata and
//! `update` refuses to run with a different one, since the derived tables
//! would silently stop matching their definition.

use camino::Utf8Path;
use osm_derive_core::Srid;
use osm_derive_data::{
    DerivedDatabase, MemberPolicy, PointTable, RelationWayTable, TableRegistry, WayGeometryTable,
};
use serde::{Deserialize, Serialize};

use crate::{ARG_SRID, CliError};

/// Table of tagged points.
pub(crate) const POINTS_TABLE: &str = "tagged_points";
/// Linestrings of every relation member way.
pub(crate) const LINES_TABLE: &str = "relation_way_lines";

/// Metadata key holding the layout a database was imported with.
pub(crate) const LAYOUT_KEY: &str = "cli_layout";

/// Options shaping the registered tables.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct Layout {
    pub(crate) point_tags: Vec<String>,
    pub(crate) policy: MemberPolicy,
    pub(crate) srid: Srid,
}

impl Layout {
    pub(crate) fn from_options(
        point_tags: Vec<String>,
        skip_missing_members: bool,
        srid: Option<u32>,
    ) -> Result<Self, CliError> {
        let srid = match srid {
            None | Some(4326) => Srid::Wgs84,
            Some(3857) => Srid::WebMercator,
            Some(code) => {
                return Err(CliError::UnsupportedSrid {
                    field: ARG_SRID,
                    code,
                });
            }
        };
        let policy = if skip_missing_members {
            MemberPolicy::SkipMissing
        } else {
            MemberPolicy::Strict
        };
        Ok(Self {
            point_tags,
            policy,
            srid,
        })
    }

    fn stored(&self) -> StoredLayout {
        let mut point_tags = self.point_tags.clone();
        point_tags.sort();
        point_tags.dedup();
        StoredLayout {
            point_tags,
            srid: self.srid.code(),
            skip_missing_members: self.policy == MemberPolicy::SkipMissing,
        }
    }

    /// Record this layout in `db`, failing if an earlier import used
    /// another one.
    pub(crate) fn record(
        &self,
        db: &mut DerivedDatabase,
        database: &Utf8Path,
    ) -> Result<(), CliError> {
        if read_stored(db, database)?.is_some() {
            self.verify(db, database)?;
        }
        let encoded = serde_json::to_string(&self.stored()).map_err(|source| {
            CliError::EncodeLayout {
                database: database.to_path_buf(),
                source,
            }
        })?;
        db.set_metadata(LAYOUT_KEY, &encoded)?;
        Ok(())
    }

    /// Check that `db` was imported with this layout.
    pub(crate) fn verify(&self, db: &DerivedDatabase, database: &Utf8Path) -> Result<(), CliError> {
        let Some(stored) = read_stored(db, database)? else {
            return Err(CliError::LayoutMissing {
                database: database.to_path_buf(),
            });
        };
        let requested = self.stored();
        if stored == requested {
            Ok(())
        } else {
            Err(CliError::LayoutMismatch {
                database: database.to_path_buf(),
                stored: stored.to_string(),
                requested: requested.to_string(),
            })
        }
    }

    /// Registry holding the point, membership and line tables in update
    /// order.
    pub(crate) fn registry(&self) -> Result<TableRegistry, CliError> {
        let mut tables = TableRegistry::new();
        tables
            .register(
                PointTable::new(POINTS_TABLE)
                    .with_tag_keys(self.point_tags.iter().map(String::as_str))
                    .with_srid(self.srid),
            )?
            .register(RelationWayTable::new().with_policy(self.policy))?
            .register(
                WayGeometryTable::new(LINES_TABLE, RelationWayTable::DEFAULT_NAME)
                    .with_srid(self.srid),
            )?;
        Ok(tables)
    }
}

/// Layout as recorded in the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StoredLayout {
    point_tags: Vec<String>,
    srid: u32,
    skip_missing_members: bool,
}

impl std::fmt::Display for StoredLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "srid {}, point tags [{}], {} members",
            self.srid,
            self.point_tags.join(", "),
            if self.skip_missing_members {
                "skipped missing"
            } else {
                "strict"
            }
        )
    }
}

fn read_stored(
    db: &DerivedDatabase,
    database: &Utf8Path,
) -> Result<Option<StoredLayout>, CliError> {
    db.metadata(LAYOUT_KEY)?
        .map(|text| {
            serde_json::from_str(&text).map_err(|source| CliError::DecodeLayout {
                database: database.to_path_buf(),
                source,
            })
        })
        .transpose()
}
