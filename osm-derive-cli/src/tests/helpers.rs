//! Test helpers for laying out CLI inputs in a scratch directory.

use super::*;
use camino::{Utf8Path, Utf8PathBuf};
use osm_derive_data::{DatabaseOptions, DerivedDatabase, RelationWayRow, RelationWayTable};
use std::fs;
use tempfile::TempDir;

/// Two ways sharing point 3, both members of relation 1.
pub(super) const BASE_OPL: &str = "n1 Tamenity=bench x1.0 y1.0
n2 x2.0 y2.0
n3 x3.0 y3.0
n4 x4.0 y4.0
n5 x5.0 y5.0
w1 Nn1,n2,n3
w2 Nn3,n4,n5
r1 Mw1@,w2@
";

#[derive(Debug)]
pub(super) struct Workspace {
    _dir: TempDir,
    root: Utf8PathBuf,
}

impl Workspace {
    pub(super) fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let root =
            Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf-8 workspace path");
        Self { _dir: dir, root }
    }

    pub(super) fn path(&self, name: &str) -> Utf8PathBuf {
        self.root.join(name)
    }

    pub(super) fn write(&self, name: &str, contents: &str) -> Utf8PathBuf {
        let path = self.path(name);
        fs::write(path.as_std_path(), contents).expect("write workspace file");
        path
    }

    pub(super) fn database(&self) -> Utf8PathBuf {
        self.path("derived.sqlite")
    }
}

pub(super) fn import_args(database: Utf8PathBuf, opl: Utf8PathBuf) -> ImportArgs {
    ImportArgs {
        database: Some(database),
        opl: Some(opl),
        ..ImportArgs::default()
    }
}

pub(super) fn update_args(database: Utf8PathBuf, diffs: Vec<Utf8PathBuf>) -> UpdateArgs {
    UpdateArgs {
        database: Some(database),
        diff: diffs,
        ..UpdateArgs::default()
    }
}

/// Import [`BASE_OPL`] into the workspace database with default options.
pub(super) fn imported(workspace: &Workspace) -> Utf8PathBuf {
    let opl = workspace.write("base.opl", BASE_OPL);
    let database = workspace.database();
    run_import(import_args(database.clone(), opl)).expect("import base data");
    database
}

/// Membership row of `way_id` as persisted in `database`.
pub(super) fn membership(database: &Utf8Path, way_id: i64) -> Option<RelationWayRow> {
    let tables = crate::layout::Layout::default().registry().expect("default layout");
    let db = DerivedDatabase::open(database, tables, DatabaseOptions::default())
        .expect("reopen database");
    let row = RelationWayTable::new()
        .get(db.connection(), way_id)
        .expect("look up membership row");
    db.close().expect("close database");
    row
}
