//! Shared helpers for the integration tests.

use osm_derive_data::{
    DatabaseOptions, DerivedDatabase, Diff, MemberPolicy, PointTable, RelationWayTable,
    TableRegistry, WayGeometryTable,
};

/// Name of the geometry table chained after the membership table.
pub const LINES: &str = "relation_way_lines";

/// Name of the tagged point table.
pub const BENCHES: &str = "benches";

/// Registry with the membership table and everything derived from it.
pub fn registry(policy: MemberPolicy) -> TableRegistry {
    let mut tables = TableRegistry::new();
    tables
        .register(PointTable::new(BENCHES).with_tag_keys(["amenity"]))
        .expect("register point table")
        .register(RelationWayTable::new().with_policy(policy))
        .expect("register membership table")
        .register(WayGeometryTable::new(LINES, RelationWayTable::DEFAULT_NAME))
        .expect("register geometry table");
    tables
}

/// In-memory database built from `opl`.
pub fn database(opl: &str, policy: MemberPolicy) -> DerivedDatabase {
    database_with(opl, policy, DatabaseOptions::default())
}

/// In-memory database built from `opl` with explicit options, such as a
/// point index.
pub fn database_with(opl: &str, policy: MemberPolicy, options: DatabaseOptions) -> DerivedDatabase {
    let mut db = DerivedDatabase::open_in_memory(registry(policy), options).expect("open database");
    let elements = Diff::from_opl(opl).expect("parse base data").into_elements();
    db.import(elements).expect("import base data");
    db
}

/// Every derived row, rendered for comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// `(way_id, node_ids, relation_ids)` rows.
    pub memberships: Vec<(i64, Vec<i64>, Vec<i64>)>,
    /// `(way_id, geom)` rows.
    pub lines: Vec<(i64, Vec<u8>)>,
    /// `(id, geom)` rows.
    pub benches: Vec<(i64, Vec<u8>)>,
}

/// Capture every derived row of `db`.
pub fn snapshot(db: &DerivedDatabase) -> Snapshot {
    let connection = db.connection();
    let memberships = RelationWayTable::new()
        .rows(connection)
        .expect("membership rows")
        .into_iter()
        .map(|row| (row.way_id, row.node_ids, row.relation_ids))
        .collect();
    let lines_table = WayGeometryTable::new(LINES, RelationWayTable::DEFAULT_NAME);
    let lines = lines_table
        .ids(connection)
        .expect("line ids")
        .into_iter()
        .map(|id| {
            let row = lines_table
                .get(connection, id)
                .expect("line lookup")
                .expect("listed line");
            (id, row.geom)
        })
        .collect();
    let benches_table = PointTable::new(BENCHES);
    let benches = benches_table
        .ids(connection)
        .expect("bench ids")
        .into_iter()
        .map(|id| {
            let row = benches_table
                .get(connection, id)
                .expect("bench lookup")
                .expect("listed bench");
            (id, row.geom)
        })
        .collect();
    Snapshot {
        memberships,
        lines,
        benches,
    }
}
