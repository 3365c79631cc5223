//! Facade crate for osm-derive.
//!
//! Re-exports the domain model, changesets, geometry encoding and point index
//! from `osm-derive-core`, and with the `store-sqlite` feature the SQLite
//! store, diff readers and derived tables from `osm-derive-data`.

#![forbid(unsafe_code)]

pub use osm_derive_core::{
    Changeset, Element, ElementKind, GeometryError, Member, OsmId, OutputAction, Point,
    PointIndex, PointIndexError, PointIndexOptions, Relation, Srid, Tags, UpstreamAction, Way,
    classify, geometry,
};

#[cfg(feature = "store-sqlite")]
pub use osm_derive_data::{
    CycleReport, DatabaseError, DatabaseOptions, Dependency, DerivedDatabase, DerivedTable, Diff,
    DiffEntry, DirtyKeys, IngestError, IngestSummary, KeyedRows, MemberPolicy, OplError,
    PointRow, PointTable, RegistrationError, RelationWayRow, RelationWayTable, TableContext,
    TableError, TableRegistry, UpstreamChangesets, WayGeometryRow, WayGeometryTable, WayTransform,
    ingest_osm_pbf,
};
