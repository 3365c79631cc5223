//! Storage, ingestion and incremental maintenance for osm-derive.
//!
//! Responsibilities:
//! - Persist base points, ways and relations in SQLite and record what each
//!   diff changed as upstream changesets.
//! - Read diffs (OPL) and bulk extracts (PBF).
//! - Define the derived table contract and the concrete derived tables.
//! - Drive full builds and per-diff update cycles transactionally.
//!
//! Boundaries:
//! - Domain types and the point index live in `osm-derive-core`.
//! - One writer at a time; cycles are never run concurrently.
//!
//! Invariants:
//! - After a committed cycle every derived row equals what a full build over
//!   the current base data would produce.
//! - No global mutable state.
#![forbid(unsafe_code)]

pub mod database;
pub mod diff;
pub mod ingest;
pub mod opl;
pub mod store;
pub mod table;

pub use database::{CycleReport, DatabaseError, DatabaseOptions, DerivedDatabase};
pub use diff::{Diff, DiffEntry};
pub use ingest::{IngestError, IngestSummary, ingest_osm_pbf};
pub use opl::OplError;
pub use store::{StoreError, UpstreamChangesets};
pub use table::{
    Dependency, DerivedTable, DirtyKeys, KeyedRows, RegistrationError, TableContext, TableError,
    TableRegistry,
    points::{PointRow, PointTable},
    relation_ways::{MemberPolicy, RelationWayRow, RelationWayTable, WayTransform},
    way_geometry::{WayGeometryRow, WayGeometryTable},
};
