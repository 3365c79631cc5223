//! Behavioural tests for the way membership table.

use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};
use std::{cell::RefCell, fs, path::PathBuf};

use osm_derive_data::{
    CycleReport, DerivedDatabase, Diff, MemberPolicy, RelationWayRow, RelationWayTable,
};
use osm_derive_core::OutputAction;

mod support;

const ONE_RELATION: &str = "n3 x10.0 y10.0
w1 Nn1,n2,n3
w2 Nn3,n4,n5
r1 Mw1@,w2@
";

const TWO_RELATIONS: &str = "n3 x10.0 y10.0
w1 Nn1,n2,n3
w2 Nn3,n4,n5
r1 Mw1@,w2@
r2 Mw1@,w2@
";

#[fixture]
fn database() -> RefCell<Option<DerivedDatabase>> {
    RefCell::new(None)
}

#[fixture]
fn report() -> RefCell<Option<CycleReport>> {
    RefCell::new(None)
}

fn apply(
    database: &RefCell<Option<DerivedDatabase>>,
    report: &RefCell<Option<CycleReport>>,
    opl: &str,
) {
    let diff = Diff::from_opl(opl).expect("parse diff");
    let outcome = database
        .borrow_mut()
        .as_mut()
        .expect("database prepared")
        .apply_diff(&diff)
        .expect("apply diff");
    *report.borrow_mut() = Some(outcome);
}

fn row(database: &RefCell<Option<DerivedDatabase>>, way_id: i64) -> Option<RelationWayRow> {
    let guard = database.borrow();
    let db = guard.as_ref().expect("database prepared");
    RelationWayTable::new()
        .get(db.connection(), way_id)
        .expect("look up membership row")
}

fn assert_row(
    database: &RefCell<Option<DerivedDatabase>>,
    way_id: i64,
    nodes: &[i64],
    relations: &[i64],
) {
    let found = row(database, way_id).expect("membership row present");
    assert_eq!(found.node_ids, nodes, "nodes of way {way_id}");
    assert_eq!(found.relation_ids, relations, "relations of way {way_id}");
}

fn reported(report: &RefCell<Option<CycleReport>>) -> Vec<(i64, OutputAction)> {
    report
        .borrow()
        .as_ref()
        .expect("cycle ran")
        .output(RelationWayTable::DEFAULT_NAME)
        .expect("membership output")
        .iter()
        .collect()
}

#[given("ways w1 and w2 belonging to relation r1")]
fn one_relation(#[from(database)] database: &RefCell<Option<DerivedDatabase>>) {
    *database.borrow_mut() = Some(support::database(ONE_RELATION, MemberPolicy::Strict));
}

#[given("ways w1 and w2 belonging to relations r1 and r2")]
fn two_relations(#[from(database)] database: &RefCell<Option<DerivedDatabase>>) {
    *database.borrow_mut() = Some(support::database(TWO_RELATIONS, MemberPolicy::Strict));
}

#[when("point n3 moves")]
fn move_point(
    #[from(database)] database: &RefCell<Option<DerivedDatabase>>,
    #[from(report)] report: &RefCell<Option<CycleReport>>,
) {
    apply(database, report, "n3 v2 x10.1 y10.1");
}

#[when("way w1 gains node n23 after n1")]
fn extend_way(
    #[from(database)] database: &RefCell<Option<DerivedDatabase>>,
    #[from(report)] report: &RefCell<Option<CycleReport>>,
) {
    apply(database, report, "w1 v2 Nn1,n23,n2,n3");
}

#[when("relation r2 is created with member w1")]
fn add_relation(
    #[from(database)] database: &RefCell<Option<DerivedDatabase>>,
    #[from(report)] report: &RefCell<Option<CycleReport>>,
) {
    apply(database, report, "r2 v1 Mw1@");
}

#[when("relation r2 is deleted")]
fn delete_relation(
    #[from(database)] database: &RefCell<Option<DerivedDatabase>>,
    #[from(report)] report: &RefCell<Option<CycleReport>>,
) {
    apply(database, report, "r2 v2 dD");
}

#[when("way w2 is removed from both relations")]
fn remove_way(
    #[from(database)] database: &RefCell<Option<DerivedDatabase>>,
    #[from(report)] report: &RefCell<Option<CycleReport>>,
) {
    apply(database, report, "r1 v2 Mw1@\nr2 v2 Mw1@");
}

#[then("no membership row changes")]
fn nothing_reported(#[from(report)] report: &RefCell<Option<CycleReport>>) {
    assert!(reported(report).is_empty());
}

#[then("only way 1 is reported as modified")]
fn first_modified(#[from(report)] report: &RefCell<Option<CycleReport>>) {
    assert_eq!(reported(report), vec![(1, OutputAction::Modified)]);
}

#[then("ways 1 and 2 are reported as modified")]
fn both_modified(#[from(report)] report: &RefCell<Option<CycleReport>>) {
    assert_eq!(
        reported(report),
        vec![(1, OutputAction::Modified), (2, OutputAction::Modified)]
    );
}

#[then("only way 2 is reported as deleted")]
fn second_deleted(#[from(report)] report: &RefCell<Option<CycleReport>>) {
    assert_eq!(reported(report), vec![(2, OutputAction::Deleted)]);
}

#[then("way 2 has no membership row")]
fn second_absent(#[from(database)] database: &RefCell<Option<DerivedDatabase>>) {
    assert_eq!(row(database, 2), None);
}

#[then("way 1 holds nodes 1,2,3 in relation 1")]
fn first_in_one(#[from(database)] database: &RefCell<Option<DerivedDatabase>>) {
    assert_row(database, 1, &[1, 2, 3], &[1]);
}

#[then("way 2 holds nodes 3,4,5 in relation 1")]
fn second_in_one(#[from(database)] database: &RefCell<Option<DerivedDatabase>>) {
    assert_row(database, 2, &[3, 4, 5], &[1]);
}

#[then("way 1 holds nodes 1,23,2,3 in relation 1")]
fn extended_first(#[from(database)] database: &RefCell<Option<DerivedDatabase>>) {
    assert_row(database, 1, &[1, 23, 2, 3], &[1]);
}

#[then("way 1 holds nodes 1,2,3 in relations 1 and 2")]
fn first_in_two(#[from(database)] database: &RefCell<Option<DerivedDatabase>>) {
    assert_row(database, 1, &[1, 2, 3], &[1, 2]);
}

#[test]
fn scenario_indices_follow_feature_order() {
    let feature =
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/features/relation_ways.feature");
    let contents = fs::read_to_string(&feature).unwrap_or_else(|err| {
        panic!("failed to read feature file {feature:?}: {err}");
    });
    let titles: Vec<&str> = contents
        .lines()
        .filter_map(|line| line.trim().strip_prefix("Scenario: "))
        .collect();
    assert_eq!(
        titles,
        vec![
            "Building memberships from base data",
            "Moving a point leaves memberships untouched",
            "Editing a member way's nodes",
            "Adding a relation",
            "Deleting a relation",
            "Removing a way from every relation",
        ]
    );
}

#[scenario(path = "tests/features/relation_ways.feature", index = 0)]
fn building_memberships(
    database: RefCell<Option<DerivedDatabase>>,
    report: RefCell<Option<CycleReport>>,
) {
    let _ = (database, report);
}

#[scenario(path = "tests/features/relation_ways.feature", index = 1)]
fn moving_points(database: RefCell<Option<DerivedDatabase>>, report: RefCell<Option<CycleReport>>) {
    let _ = (database, report);
}

#[scenario(path = "tests/features/relation_ways.feature", index = 2)]
fn editing_member_ways(
    database: RefCell<Option<DerivedDatabase>>,
    report: RefCell<Option<CycleReport>>,
) {
    let _ = (database, report);
}

#[scenario(path = "tests/features/relation_ways.feature", index = 3)]
fn adding_relations(
    database: RefCell<Option<DerivedDatabase>>,
    report: RefCell<Option<CycleReport>>,
) {
    let _ = (database, report);
}

#[scenario(path = "tests/features/relation_ways.feature", index = 4)]
fn deleting_relations(
    database: RefCell<Option<DerivedDatabase>>,
    report: RefCell<Option<CycleReport>>,
) {
    let _ = (database, report);
}

#[scenario(path = "tests/features/relation_ways.feature", index = 5)]
fn removing_ways(database: RefCell<Option<DerivedDatabase>>, report: RefCell<Option<CycleReport>>) {
    let _ = (database, report);
}
