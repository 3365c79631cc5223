//! Unit tests for the way to relation membership table.

use super::*;
use crate::table::harness::{database, labels, update};
use rstest::rstest;

type Summary = (OsmId, Vec<OsmId>, Vec<OsmId>);

fn summary(table: &RelationWayTable, connection: &Connection) -> Vec<Summary> {
    table
        .rows(connection)
        .expect("read rows")
        .into_iter()
        .map(|row| (row.way_id, row.node_ids, row.relation_ids))
        .collect()
}

const TWO_RELATIONS: &str = "n3 x10.0 y10.0
w1 Nn1,n2,n3
w2 Nn3,n4,n5
r1 Mw1@,w2@
r2 Mw1@,w2@
";

#[rstest]
#[case::single(
    "w1 Nn1,n2,n3\nw2 Nn3,n4,n5\nr1 Mw1@,w2@",
    vec![(1, vec![1, 2, 3], vec![1]), (2, vec![3, 4, 5], vec![1])],
)]
#[case::overlapping(
    "w1 Nn1,n2,n3\nw2 Nn3,n4,n5\nw3 Nn10,n11\nr1 Mw1@,w2@\nr2 Mw2@,w3@",
    vec![
        (1, vec![1, 2, 3], vec![1]),
        (2, vec![3, 4, 5], vec![1, 2]),
        (3, vec![10, 11], vec![2]),
    ],
)]
#[case::way_without_relation(
    "w1 Nn1,n2,n3\nw2 Nn3,n4,n5\nr1 Mw1@",
    vec![(1, vec![1, 2, 3], vec![1])],
)]
#[case::repeated_member(
    "w1 Nn1,n2\nr1 Mw1@a,w1@b,n1@c",
    vec![(1, vec![1, 2], vec![1])],
)]
fn builds_rows_from_base_data(#[case] opl: &str, #[case] expected: Vec<Summary>) {
    let table = RelationWayTable::new();
    let connection = database(&[&table], opl);
    assert_eq!(summary(&table, &connection), expected);
}

#[rstest]
fn strict_build_rejects_unknown_member_ways() {
    let table = RelationWayTable::new();
    let mut connection = rusqlite::Connection::open_in_memory().expect("open database");
    crate::store::initialise_schema(&mut connection).expect("schema");
    let elements = crate::Diff::from_opl("w1 Nn1\nr1 Mw1@,w3@")
        .expect("parse")
        .into_elements();
    store::load_elements(&connection, elements).expect("load");
    table.create(&connection).expect("create");
    let upstream = crate::UpstreamChangesets::default();
    let outputs = std::collections::BTreeMap::new();
    let mut context = TableContext {
        connection: &connection,
        upstream: &upstream,
        outputs: &outputs,
        coordinates: crate::table::Coordinates::Store,
    };
    let err = table.construct(&mut context).expect_err("unknown way");
    assert!(matches!(
        err,
        TableError::DependencyInconsistency {
            problem: Inconsistency::UnresolvedMember {
                relation_id: 1,
                way_id: 3
            },
            ..
        }
    ));
}

#[rstest]
fn lenient_build_skips_unknown_member_ways() {
    let table = RelationWayTable::new().with_policy(MemberPolicy::SkipMissing);
    let connection = database(&[&table], "w1 Nn1,n2,n3\nw2 Nn3,n4,n5\nr1 Mw1@,w2@,w3@");
    assert_eq!(
        summary(&table, &connection),
        vec![(1, vec![1, 2, 3], vec![1]), (2, vec![3, 4, 5], vec![1])]
    );
}

#[rstest]
#[case::move_node("n3 x10.1 y10.1", vec![], vec![1, 2, 3], vec![3, 4, 5])]
#[case::way_tags_only("w1 v2 Tfoo=bar Nn1,n2,n3", vec![], vec![1, 2, 3], vec![3, 4, 5])]
#[case::add_node("w1 v2 Nn1,n23,n2,n3", vec!["M1"], vec![1, 23, 2, 3], vec![3, 4, 5])]
#[case::remove_node("w2 v2 Nn3,n4", vec!["M2"], vec![1, 2, 3], vec![3, 4])]
#[case::single_node_way("w2 v2 Nn3", vec!["M2"], vec![1, 2, 3], vec![3])]
fn way_changes_touch_only_their_own_row(
    #[case] diff: &str,
    #[case] expected_changes: Vec<&str>,
    #[case] first_nodes: Vec<OsmId>,
    #[case] second_nodes: Vec<OsmId>,
) {
    let table = RelationWayTable::new();
    let connection = database(
        &[&table],
        "n3 x10.0 y10.0\nw1 Nn1,n2,n3\nw2 Nn3,n4,n5\nr1 Mw1@,w2@",
    );
    let outputs = update(&connection, &[&table], diff).expect("update");
    assert_eq!(labels(&outputs["relation_ways"]), expected_changes);
    assert_eq!(
        summary(&table, &connection),
        vec![(1, first_nodes, vec![1]), (2, second_nodes, vec![1])]
    );
}

#[rstest]
#[case::add_relation("r20 Mw1@", vec!["M1"], vec![
    (1, vec![1, 2, 3], vec![1, 2, 20]),
    (2, vec![3, 4, 5], vec![1, 2]),
])]
#[case::delete_relation("r2 v2 dD", vec!["M1", "M2"], vec![
    (1, vec![1, 2, 3], vec![1]),
    (2, vec![3, 4, 5], vec![1]),
])]
#[case::add_way("w3 v1 Nn10,n11\nr1 v2 Mw1@,w3@,w2@", vec!["A3"], vec![
    (1, vec![1, 2, 3], vec![1, 2]),
    (2, vec![3, 4, 5], vec![1, 2]),
    (3, vec![10, 11], vec![1]),
])]
#[case::remove_way("r2 v2 Mw2@", vec!["M1"], vec![
    (1, vec![1, 2, 3], vec![1]),
    (2, vec![3, 4, 5], vec![1, 2]),
])]
#[case::remove_all_ways("r2 v2 Mw2@\nr1 v2 Mw2@", vec!["D1"], vec![
    (2, vec![3, 4, 5], vec![1, 2]),
])]
fn relation_changes_update_memberships(
    #[case] diff: &str,
    #[case] expected_changes: Vec<&str>,
    #[case] expected_rows: Vec<Summary>,
) {
    let table = RelationWayTable::new();
    let connection = database(&[&table], TWO_RELATIONS);
    let outputs = update(&connection, &[&table], diff).expect("update");
    assert_eq!(labels(&outputs["relation_ways"]), expected_changes);
    assert_eq!(summary(&table, &connection), expected_rows);
}

#[rstest]
#[case::relation_tags("r2 v2 Tname=foo Mw1@,w2@")]
#[case::member_roles("r2 v2 Mw1@foo,w2@bar")]
#[case::node_member("r2 v2 Mw1@,w2@,n2@")]
#[case::relation_member("r2 v2 Mr3@,w1@,w2@")]
fn irrelevant_relation_edits_change_nothing(#[case] diff: &str) {
    let table = RelationWayTable::new();
    let connection = database(&[&table], TWO_RELATIONS);
    let outputs = update(&connection, &[&table], diff).expect("update");
    assert!(outputs["relation_ways"].is_empty());
    assert_eq!(
        summary(&table, &connection),
        vec![
            (1, vec![1, 2, 3], vec![1, 2]),
            (2, vec![3, 4, 5], vec![1, 2]),
        ]
    );
}

#[rstest]
fn created_way_outside_relations_stays_absent() {
    let table = RelationWayTable::new();
    let connection = database(&[&table], TWO_RELATIONS);
    let outputs = update(&connection, &[&table], "w7 Nn1,n2").expect("update");
    assert!(outputs["relation_ways"].is_empty());
    assert_eq!(table.get(&connection, 7).expect("lookup"), None);
}

#[rstest]
fn strict_update_rejects_references_to_unknown_ways() {
    let table = RelationWayTable::new();
    let connection = database(&[&table], TWO_RELATIONS);
    let err = update(&connection, &[&table], "r5 Mw9@").expect_err("unknown way");
    assert!(matches!(
        err,
        TableError::DependencyInconsistency {
            problem: Inconsistency::UnresolvedMember {
                relation_id: 5,
                way_id: 9
            },
            ..
        }
    ));
}

#[rstest]
fn lenient_update_ignores_references_to_unknown_ways() {
    let table = RelationWayTable::new().with_policy(MemberPolicy::SkipMissing);
    let connection = database(&[&table], TWO_RELATIONS);
    let outputs = update(&connection, &[&table], "r5 Mw9@,w1@").expect("update");
    assert_eq!(labels(&outputs["relation_ways"]), vec!["M1"]);
    let row = table.get(&connection, 1).expect("lookup").expect("row");
    assert_eq!(row.relation_ids, vec![1, 2, 5]);
}

#[rstest]
#[case::modified_but_missing("M", 8, Inconsistency::MissingWay {
    way_id: 8,
    action: UpstreamAction::Modified,
})]
#[case::deleted_but_present("D", 1, Inconsistency::DeletedWayPresent { way_id: 1 })]
fn contradictory_way_changesets_abort(
    #[case] code: &str,
    #[case] way_id: OsmId,
    #[case] expected: Inconsistency,
) {
    let table = RelationWayTable::new();
    let connection = database(&[&table], TWO_RELATIONS);
    connection
        .execute(
            "INSERT INTO way_changeset (id, action) VALUES (?1, ?2)",
            (way_id, code),
        )
        .expect("seed changeset");
    let err = update(&connection, &[&table], "").expect_err("inconsistent changeset");
    match err {
        TableError::DependencyInconsistency { table, problem } => {
            assert_eq!(table, "relation_ways");
            assert_eq!(problem, expected);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[rstest]
fn custom_names_prefix_auxiliary_tables() {
    let table = RelationWayTable::named("routes");
    let connection = database(&[&table], "w1 Nn1,n2\nr4 Mw1@");
    let pairs: i64 = connection
        .query_row("SELECT count(*) FROM routes_relations", [], |row| row.get(0))
        .expect("count memberships");
    assert_eq!(pairs, 1);
    let changes: i64 = connection
        .query_row("SELECT count(*) FROM routes_changeset", [], |row| row.get(0))
        .expect("count changes");
    assert_eq!(changes, 0);
}

#[derive(Debug)]
struct UpperName;

impl WayTransform for UpperName {
    fn transform(&self, _way_id: OsmId, tags: &Tags) -> Option<Tags> {
        let name = tags.get("name")?;
        Some(Tags::from([("name".to_owned(), name.to_uppercase())]))
    }
}

const NAMED_WAYS: &str = "n3 x10.0 y10.0
w1 Tname=w1 Nn1,n2,n3
w2 Tname=w2 Nn3,n4,n5
w3 Nn99,n98
r1 Mw1@,w2@,w3@
";

fn names(table: &RelationWayTable, connection: &Connection) -> Vec<(OsmId, String)> {
    table
        .rows(connection)
        .expect("read rows")
        .into_iter()
        .map(|row| {
            let name = row.columns.get("name").cloned().unwrap_or_default();
            (row.way_id, name)
        })
        .collect()
}

#[rstest]
fn transforms_select_ways_and_fill_columns() {
    let table = RelationWayTable::new().with_transform(UpperName);
    let connection = database(&[&table], NAMED_WAYS);
    assert_eq!(
        names(&table, &connection),
        vec![(1, "W1".to_owned()), (2, "W2".to_owned())]
    );
    let row = table.get(&connection, 2).expect("lookup").expect("row");
    assert_eq!(row.node_ids, vec![3, 4, 5]);
    assert_eq!(row.relation_ids, vec![1]);
}

#[rstest]
#[case::remove_relevant_tag("w2 v2 Nn3,n4,n5", vec!["D2"], vec![(1, "W1")])]
#[case::add_relevant_tag(
    "w3 v2 Tname=w3 Nn99,n98",
    vec!["A3"],
    vec![(1, "W1"), (2, "W2"), (3, "W3")],
)]
#[case::tags_without_changed_output("w1 v2 Tname=W1 Nn1,n2,n3", vec![], vec![(1, "W1"), (2, "W2")])]
#[case::unrelated_tags("w1 v2 Tfoo=bar,name=w1 Nn1,n2,n3", vec![], vec![(1, "W1"), (2, "W2")])]
#[case::renamed("w1 v2 Tname=wnew Nn1,n2,n3", vec!["M1"], vec![(1, "WNEW"), (2, "W2")])]
fn transformed_columns_drive_change_detection(
    #[case] diff: &str,
    #[case] expected_changes: Vec<&str>,
    #[case] expected_names: Vec<(OsmId, &str)>,
) {
    let table = RelationWayTable::new().with_transform(UpperName);
    let connection = database(&[&table], NAMED_WAYS);
    let outputs = update(&connection, &[&table], diff).expect("update");
    assert_eq!(labels(&outputs["relation_ways"]), expected_changes);
    let expected: Vec<(OsmId, String)> = expected_names
        .into_iter()
        .map(|(id, name)| (id, name.to_owned()))
        .collect();
    assert_eq!(names(&table, &connection), expected);
}

#[rstest]
fn rows_without_a_transform_carry_no_columns() {
    let table = RelationWayTable::new();
    let connection = database(&[&table], NAMED_WAYS);
    let rows = table.rows(&connection).expect("rows");
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|row| row.columns.is_empty()));
}
