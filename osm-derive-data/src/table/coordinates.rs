//! Coordinate lookup for geometry-bearing tables.

use std::collections::BTreeMap;

use geo::Coord;
use osm_derive_core::{OsmId, PointIndex, PointIndexError};
use rusqlite::Connection;

use crate::store;

use super::TableError;

/// Point writes made during a cycle that have not reached the point index.
///
/// The index is not transactional, so a cycle stages its point changes here
/// and only applies them once the database transaction commits. Lookups made
/// during the cycle see the staged values first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingPoints {
    staged: BTreeMap<OsmId, Option<Coord<f64>>>,
}

impl PendingPoints {
    /// Stage a new location for `id`.
    pub fn set(&mut self, id: OsmId, coord: Coord<f64>) -> Result<(), PointIndexError> {
        if !(coord.x.is_finite() && coord.y.is_finite()) {
            return Err(PointIndexError::InvalidCoordinate {
                id,
                x: coord.x,
                y: coord.y,
            });
        }
        self.staged.insert(id, Some(coord));
        Ok(())
    }

    /// Stage the removal of `id`.
    pub fn delete(&mut self, id: OsmId) {
        self.staged.insert(id, None);
    }

    /// Staged state for `id`: `None` when nothing is staged, `Some(None)`
    /// when a removal is staged.
    #[must_use]
    pub fn get(&self, id: OsmId) -> Option<Option<Coord<f64>>> {
        self.staged.get(&id).copied()
    }

    /// Number of staged ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.staged.len()
    }

    /// Whether nothing is staged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// Write every staged change into `index`.
    pub fn apply(self, index: &mut PointIndex) -> Result<(), PointIndexError> {
        for (id, staged) in self.staged {
            match staged {
                Some(coord) => index.set(id, coord)?,
                None => index.delete(id)?,
            }
        }
        Ok(())
    }
}

/// Where geometry tables resolve point locations from.
#[derive(Debug)]
pub enum Coordinates<'a> {
    /// Read locations from the base `points` table.
    Store,
    /// Read locations from the point index, overlaid with staged changes.
    Index {
        /// Persistent index.
        index: &'a mut PointIndex,
        /// Changes staged by the running cycle.
        pending: &'a PendingPoints,
    },
}

impl Coordinates<'_> {
    /// Location of point `id`, or `None` when it is unknown.
    pub fn locate(
        &mut self,
        connection: &Connection,
        id: OsmId,
    ) -> Result<Option<Coord<f64>>, TableError> {
        match self {
            Self::Store => Ok(store::point_location(connection, id)?),
            Self::Index { index, pending } => match pending.get(id) {
                Some(staged) => Ok(staged),
                None => Ok(index.get(id)?),
            },
        }
    }
}
