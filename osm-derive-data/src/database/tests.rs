//! Unit tests for the update cycle driver.

use super::*;
use crate::table::points::PointTable;
use crate::table::relation_ways::RelationWayTable;
use crate::table::way_geometry::WayGeometryTable;
use geo::{Coord, LineString};
use osm_derive_core::geometry::ewkb_linestring;
use osm_derive_core::{ElementKind, OsmId};
use rstest::{fixture, rstest};
use tempfile::TempDir;

const BASE: &str = "n1 Tamenity=bench x1.0 y1.0
n2 x2.0 y2.0
n3 x3.0 y3.0
w1 Nn1,n2
w2 Nn2,n3
r1 Mw1@,w2@
";

fn registry() -> TableRegistry {
    let mut tables = TableRegistry::new();
    tables
        .register(PointTable::new("benches").with_tag_keys(["amenity"]))
        .expect("register points")
        .register(RelationWayTable::new())
        .expect("register memberships")
        .register(WayGeometryTable::new("way_lines", "relation_ways"))
        .expect("register geometry");
    tables
}

fn opl(text: &str) -> Diff {
    Diff::from_opl(text).expect("parse opl")
}

fn line(coords: &[(f64, f64)]) -> Vec<u8> {
    let line: LineString<f64> = coords.iter().map(|&(x, y)| Coord { x, y }).collect();
    ewkb_linestring(&line, 4326)
}

fn geometry(db: &DerivedDatabase, way_id: OsmId) -> Option<Vec<u8>> {
    WayGeometryTable::new("way_lines", "relation_ways")
        .get(db.connection(), way_id)
        .expect("lookup geometry")
        .map(|row| row.geom)
}

#[fixture]
fn imported() -> DerivedDatabase {
    let mut db =
        DerivedDatabase::open_in_memory(registry(), DatabaseOptions::default()).expect("open");
    db.import(opl(BASE).into_elements()).expect("import");
    db
}

#[rstest]
fn import_counts_and_builds_every_table(imported: DerivedDatabase) {
    assert_eq!(imported.tables().names(), vec!["benches", "relation_ways", "way_lines"]);
    assert_eq!(geometry(&imported, 1), Some(line(&[(1.0, 1.0), (2.0, 2.0)])));
    let memberships = RelationWayTable::new()
        .rows(imported.connection())
        .expect("rows");
    assert_eq!(memberships.len(), 2);
}

#[rstest]
fn cycles_report_outputs_in_update_order(mut imported: DerivedDatabase) {
    let report = imported
        .apply_diff(&opl("n2 v2 x2.5 y2.0\nn1 v2 x1.0 y1.0"))
        .expect("cycle");
    assert_eq!(
        report.upstream.points.get(2),
        Some(UpstreamAction::Modified)
    );
    let names: Vec<&str> = report.outputs.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, vec!["benches", "relation_ways", "way_lines"]);
    assert_eq!(
        report.output("benches").map(Changeset::len),
        Some(1),
        "bench lost its tag"
    );
    assert!(report.output("relation_ways").is_some_and(Changeset::is_empty));
    let lines = report.output("way_lines").expect("geometry output");
    assert_eq!(lines.get(1), Some(OutputAction::Modified));
    assert_eq!(lines.get(2), Some(OutputAction::Modified));
    assert_eq!(
        imported.output_changeset("way_lines").expect("persisted"),
        lines.clone()
    );
}

#[rstest]
fn consumed_changesets_are_cleared(mut imported: DerivedDatabase) {
    imported.apply_diff(&opl("w2 v2 Nn3,n2")).expect("cycle");
    let upstream = store::read_upstream_changesets(imported.connection()).expect("read");
    assert!(upstream.is_empty());
    let report = imported.apply_diff(&Diff::new()).expect("empty cycle");
    assert!(report.outputs.iter().all(|(_, changes)| changes.is_empty()));
}

#[rstest]
fn failed_cycles_commit_nothing() {
    let dir = TempDir::new().expect("temp dir");
    let options = DatabaseOptions::default().with_point_index(dir.path().join("points.idx"));
    let mut db = DerivedDatabase::open_in_memory(registry(), options).expect("open");
    db.import(opl(BASE).into_elements()).expect("import");

    let err = db
        .apply_diff(&opl("n2 v2 x9.0 y9.0\nr2 Mw1@,w42@"))
        .expect_err("unknown way member");
    assert!(matches!(
        err,
        DatabaseError::Table(TableError::DependencyInconsistency { .. })
    ));

    let connection = db.connection();
    assert!(!store::element_exists(connection, ElementKind::Relation, 2).expect("lookup"));
    assert_eq!(
        store::point_location(connection, 2).expect("lookup"),
        Some(Coord { x: 2.0, y: 2.0 })
    );
    assert!(store::read_upstream_changesets(connection).expect("read").is_empty());
    let index = db.point_index().expect("index configured");
    assert_eq!(index.get(2).expect("index lookup"), Some(Coord { x: 2.0, y: 2.0 }));
    db.close().expect("close");
}

#[rstest]
fn geometry_reads_locations_from_the_index() {
    let dir = TempDir::new().expect("temp dir");
    let index_path = dir.path().join("points.idx");
    let options = DatabaseOptions::default().with_point_index(&index_path);
    let mut db = DerivedDatabase::open_in_memory(registry(), options).expect("open");
    db.import(opl(BASE).into_elements()).expect("import");

    db.point_index()
        .expect("index configured")
        .set(1, Coord { x: 0.0, y: 0.0 })
        .expect("override location");
    db.construct().expect("rebuild");
    assert_eq!(geometry(&db, 1), Some(line(&[(0.0, 0.0), (2.0, 2.0)])));

    let report = db.apply_diff(&opl("n3 v2 x4.0 y4.0")).expect("cycle");
    assert_eq!(
        report.output("way_lines").and_then(|changes| changes.get(2)),
        Some(OutputAction::Modified)
    );
    assert_eq!(geometry(&db, 2), Some(line(&[(2.0, 2.0), (4.0, 4.0)])));
    db.close().expect("close");

    let mut reopened = PointIndex::open(&index_path, PointIndexOptions::default()).expect("reopen");
    assert_eq!(reopened.get(3).expect("lookup"), Some(Coord { x: 4.0, y: 4.0 }));
    reopened.close().expect("close index");
}

#[rstest]
fn deleted_points_leave_the_index() {
    let dir = TempDir::new().expect("temp dir");
    let options = DatabaseOptions::default().with_point_index(dir.path().join("points.idx"));
    let mut db = DerivedDatabase::open_in_memory(registry(), options).expect("open");
    db.import(opl(BASE).into_elements()).expect("import");
    let report = db.apply_diff(&opl("n3 v2 dD")).expect("cycle");
    assert_eq!(report.output("way_lines").and_then(|c| c.get(2)), Some(OutputAction::Deleted));
    let index = db.point_index().expect("index configured");
    assert_eq!(index.get(3).expect("lookup"), None);
    db.close().expect("close");
}

#[rstest]
fn file_databases_survive_reopening() {
    let dir = TempDir::new().expect("temp dir");
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf-8 path");
    let path = root.join("nested/derived.sqlite");

    let mut db = DerivedDatabase::open(&path, registry(), DatabaseOptions::default())
        .expect("create database");
    db.import(opl(BASE).into_elements()).expect("import");
    db.close().expect("close");

    let mut reopened = DerivedDatabase::open(&path, registry(), DatabaseOptions::default())
        .expect("reopen database");
    assert_eq!(reopened.metadata("origin").expect("read metadata"), None);
    let report = reopened.apply_diff(&opl("r1 v2 dD")).expect("cycle");
    let removed = report.output("relation_ways").expect("membership output");
    assert_eq!(removed.len(), 2);
    assert!(removed.iter().all(|(_, action)| action == OutputAction::Deleted));
    reopened.close().expect("close");
}

#[rstest]
fn metadata_survives_reopening() {
    let dir = TempDir::new().expect("temp dir");
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf-8 path");
    let path = root.join("derived.sqlite");

    let mut db = DerivedDatabase::open(&path, registry(), DatabaseOptions::default())
        .expect("create database");
    db.set_metadata("origin", "first").expect("write metadata");
    db.set_metadata("origin", "second").expect("replace metadata");
    db.close().expect("close");

    let reopened = DerivedDatabase::open(&path, registry(), DatabaseOptions::default())
        .expect("reopen database");
    assert_eq!(reopened.metadata("origin").expect("read metadata"), Some("second".to_owned()));
    assert_eq!(reopened.metadata("other").expect("read metadata"), None);
    reopened.close().expect("close");
}
