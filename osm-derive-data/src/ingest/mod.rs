//! Bulk loading of OSM PBF extracts into the base store.

use std::path::{Path, PathBuf};

use geo::{Coord, Rect};
use log::{debug, info, warn};
use osm_derive_core::{Element, PointIndex, PointIndexError};
use osmpbf::ElementReader;
use rusqlite::Connection;
use thiserror::Error;

use crate::store::{self, StoreError};

mod convert;

use convert::{Converted, convert};

/// Counts of elements written by a PBF load.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IngestSummary {
    /// Points written, including dense-node entries.
    pub points: u64,
    /// Ways written.
    pub ways: u64,
    /// Relations written.
    pub relations: u64,
    /// Points dropped because their location was outside the WGS84 range.
    pub skipped_points: u64,
    /// Bounding box of the written points, if any.
    /// Coordinates are WGS84 with `x = longitude`, `y = latitude`.
    pub bounds: Option<Rect<f64>>,
}

impl IngestSummary {
    fn record(&mut self, element: &Element) {
        match element {
            Element::Point(point) => {
                self.points += 1;
                self.include(point.location);
            }
            Element::Way(_) => self.ways += 1,
            Element::Relation(_) => self.relations += 1,
        }
    }

    fn include(&mut self, coord: Coord<f64>) {
        let bounds = match self.bounds {
            Some(existing) => Rect::new(
                Coord {
                    x: existing.min().x.min(coord.x),
                    y: existing.min().y.min(coord.y),
                },
                Coord {
                    x: existing.max().x.max(coord.x),
                    y: existing.max().y.max(coord.y),
                },
            ),
            None => Rect::new(coord, coord),
        };
        self.bounds = Some(bounds);
    }
}

/// Errors returned when ingesting an OSM PBF file.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The file could not be opened.
    #[error("failed to open OSM PBF file at {path:?}")]
    Open {
        /// Source error produced by `osmpbf`.
        #[source]
        source: osmpbf::Error,
        /// File being read.
        path: PathBuf,
    },
    /// The file could not be decoded.
    #[error("failed to decode OSM PBF data at {path:?}")]
    Decode {
        /// Source error produced by `osmpbf`.
        #[source]
        source: osmpbf::Error,
        /// File being read.
        path: PathBuf,
    },
    /// Writing to the base store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Writing to the point index failed.
    #[error(transparent)]
    PointIndex(#[from] PointIndexError),
}

/// Stream an OSM PBF file into the base store, and into `index` when given.
///
/// Elements are written without changesets; callers wrap the load in a
/// transaction and rebuild the derived tables afterwards.
///
/// # Examples
/// ```no_run
/// use std::path::Path;
/// use osm_derive_data::ingest_osm_pbf;
/// use rusqlite::Connection;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut connection = Connection::open("derived.sqlite")?;
/// osm_derive_data::store::initialise_schema(&mut connection)?;
/// let summary = ingest_osm_pbf(Path::new("berlin.osm.pbf"), &connection, None)?;
/// assert!(summary.points > 0);
/// # Ok(())
/// # }
/// ```
pub fn ingest_osm_pbf(
    path: &Path,
    connection: &Connection,
    mut index: Option<&mut PointIndex>,
) -> Result<IngestSummary, IngestError> {
    let reader = ElementReader::from_path(path).map_err(|source| IngestError::Open {
        source,
        path: path.to_path_buf(),
    })?;

    let mut summary = IngestSummary::default();
    let mut failure: Option<IngestError> = None;
    reader
        .for_each(|element| {
            if failure.is_some() {
                return;
            }
            let result = write_element(element, connection, index.as_deref_mut(), &mut summary)
                .map_err(|err| match err {
                    WriteError::Decode(source) => IngestError::Decode {
                        source,
                        path: path.to_path_buf(),
                    },
                    WriteError::Ingest(err) => err,
                });
            if let Err(err) = result {
                failure = Some(err);
            }
        })
        .map_err(|source| IngestError::Decode {
            source,
            path: path.to_path_buf(),
        })?;
    if let Some(err) = failure {
        return Err(err);
    }

    if summary.skipped_points > 0 {
        warn!(
            "skipped {} points with coordinates outside the WGS84 range",
            summary.skipped_points
        );
    }
    info!(
        "loaded {} points, {} ways and {} relations from {}",
        summary.points,
        summary.ways,
        summary.relations,
        path.display()
    );
    Ok(summary)
}

enum WriteError {
    Decode(osmpbf::Error),
    Ingest(IngestError),
}

fn write_element(
    element: osmpbf::Element<'_>,
    connection: &Connection,
    index: Option<&mut PointIndex>,
    summary: &mut IngestSummary,
) -> Result<(), WriteError> {
    let converted = convert(element).map_err(WriteError::Decode)?;
    store_converted(converted, connection, index, summary).map_err(WriteError::Ingest)
}

fn store_converted(
    converted: Converted,
    connection: &Connection,
    index: Option<&mut PointIndex>,
    summary: &mut IngestSummary,
) -> Result<(), IngestError> {
    let element = match converted {
        Converted::Element(element) => element,
        Converted::InvalidPoint(id) => {
            debug!("skipping point {id} with a location outside the WGS84 range");
            summary.skipped_points += 1;
            return Ok(());
        }
    };
    if let (Element::Point(point), Some(index)) = (&element, index) {
        index.set(point.id, point.location)?;
    }
    store::insert_element(connection, &element)?;
    summary.record(&element);
    Ok(())
}
