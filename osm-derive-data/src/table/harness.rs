//! In-memory fixtures shared by the table unit tests.

use std::collections::BTreeMap;

use osm_derive_core::{Changeset, OutputAction};
use rusqlite::Connection;

use crate::diff::Diff;
use crate::store::{self, UpstreamChangesets, initialise_schema};

use super::{Coordinates, DerivedTable, TableContext, TableError};

/// Create `tables`, load `opl` as base data and build every table.
pub(crate) fn database(tables: &[&dyn DerivedTable], opl: &str) -> Connection {
    let mut connection = Connection::open_in_memory().expect("open in-memory database");
    initialise_schema(&mut connection).expect("initialise schema");
    let elements = Diff::from_opl(opl).expect("parse base data").into_elements();
    store::load_elements(&connection, elements).expect("load base data");
    let upstream = UpstreamChangesets::default();
    let outputs = BTreeMap::new();
    for table in tables {
        table.create(&connection).expect("create table");
        let mut context = TableContext {
            connection: &connection,
            upstream: &upstream,
            outputs: &outputs,
            coordinates: Coordinates::Store,
        };
        table.construct(&mut context).expect("construct table");
    }
    connection
}

/// Apply `opl` as a diff and update `tables` in order, returning each
/// table's output changeset.
pub(crate) fn update(
    connection: &Connection,
    tables: &[&dyn DerivedTable],
    opl: &str,
) -> Result<BTreeMap<String, Changeset<OutputAction>>, TableError> {
    let diff = Diff::from_opl(opl).expect("parse diff");
    let upstream = store::apply_diff(connection, &diff)?;
    let mut outputs = BTreeMap::new();
    for table in tables {
        let changes = {
            let mut context = TableContext {
                connection,
                upstream: &upstream,
                outputs: &outputs,
                coordinates: Coordinates::Store,
            };
            table.update(&mut context)?
        };
        outputs.insert(table.name().to_owned(), changes);
    }
    store::clear_upstream_changesets(connection)?;
    Ok(outputs)
}

/// Render a changeset as `A1`, `M2`, `D3` labels in key order.
pub(crate) fn labels(changes: &Changeset<OutputAction>) -> Vec<String> {
    changes
        .iter()
        .map(|(key, action)| format!("{}{key}", action.code()))
        .collect()
}
