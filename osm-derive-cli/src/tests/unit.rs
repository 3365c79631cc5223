//! Focused unit tests covering CLI configuration validation.

use super::helpers::Workspace;
use super::*;
use crate::import::ImportSource;
use crate::layout::{LINES_TABLE, Layout, POINTS_TABLE};
use camino::Utf8PathBuf;
use osm_derive_core::Srid;
use osm_derive_data::{MemberPolicy, RelationWayTable};
use rstest::rstest;

#[rstest]
#[case(None, Some(Utf8PathBuf::from("base.opl")), ARG_DATABASE, ENV_IMPORT_DATABASE)]
#[case(Some(Utf8PathBuf::from("derived.sqlite")), None, ARG_OSM_PBF, ENV_IMPORT_OSM_PBF)]
fn converting_import_without_required_fields_errors(
    #[case] database: Option<Utf8PathBuf>,
    #[case] opl: Option<Utf8PathBuf>,
    #[case] field: &'static str,
    #[case] env_var: &'static str,
) {
    let args = ImportArgs {
        database,
        opl,
        ..ImportArgs::default()
    };
    let err = ImportConfig::try_from(args).expect_err("missing field should error");
    match err {
        CliError::MissingArgument {
            field: missing,
            env,
        } => {
            assert_eq!(missing, field);
            assert_eq!(env, env_var);
        }
        other => panic!("expected MissingArgument, found {other:?}"),
    }
}

#[rstest]
fn import_rejects_two_sources() {
    let args = ImportArgs {
        database: Some(Utf8PathBuf::from("derived.sqlite")),
        osm_pbf: Some(Utf8PathBuf::from("planet.osm.pbf")),
        opl: Some(Utf8PathBuf::from("base.opl")),
        ..ImportArgs::default()
    };
    match ImportConfig::try_from(args).expect_err("conflicting sources") {
        CliError::ConflictingArguments { first, second } => {
            assert_eq!((first, second), (ARG_OSM_PBF, ARG_OPL));
        }
        other => panic!("expected ConflictingArguments, found {other:?}"),
    }
}

#[rstest]
fn import_config_carries_the_layout() {
    let args = ImportArgs {
        database: Some(Utf8PathBuf::from("derived.sqlite")),
        osm_pbf: Some(Utf8PathBuf::from("planet.osm.pbf")),
        point_tag: vec!["amenity".to_owned(), "shop".to_owned()],
        srid: Some(3857),
        skip_missing_members: true,
        fresh: true,
        ..ImportArgs::default()
    };
    let config = ImportConfig::try_from(args).expect("config should build");
    assert_eq!(
        config.source,
        ImportSource::Pbf(Utf8PathBuf::from("planet.osm.pbf"))
    );
    assert!(config.fresh);
    assert_eq!(
        config.layout,
        Layout {
            point_tags: vec!["amenity".to_owned(), "shop".to_owned()],
            policy: MemberPolicy::SkipMissing,
            srid: Srid::WebMercator,
        }
    );
}

#[rstest]
#[case(None, Srid::Wgs84)]
#[case(Some(4326), Srid::Wgs84)]
#[case(Some(3857), Srid::WebMercator)]
fn layout_maps_srid_codes(#[case] code: Option<u32>, #[case] expected: Srid) {
    let layout = Layout::from_options(Vec::new(), false, code).expect("supported srid");
    assert_eq!(layout.srid, expected);
    assert_eq!(layout.policy, MemberPolicy::Strict);
}

#[rstest]
fn layout_rejects_unknown_srids() {
    match Layout::from_options(Vec::new(), false, Some(27700)).expect_err("unsupported") {
        CliError::UnsupportedSrid { field, code } => {
            assert_eq!(field, ARG_SRID);
            assert_eq!(code, 27700);
        }
        other => panic!("expected UnsupportedSrid, found {other:?}"),
    }
}

#[rstest]
fn layout_registers_tables_in_update_order() {
    let tables = Layout::default().registry().expect("registry");
    assert_eq!(
        tables.names(),
        vec![POINTS_TABLE, RelationWayTable::DEFAULT_NAME, LINES_TABLE]
    );
}

#[rstest]
#[case(None, vec![Utf8PathBuf::from("a.opl")], ARG_DATABASE, ENV_UPDATE_DATABASE)]
#[case(Some(Utf8PathBuf::from("derived.sqlite")), Vec::new(), ARG_DIFF, ENV_UPDATE_DIFF)]
fn converting_update_without_required_fields_errors(
    #[case] database: Option<Utf8PathBuf>,
    #[case] diff: Vec<Utf8PathBuf>,
    #[case] field: &'static str,
    #[case] env_var: &'static str,
) {
    let args = UpdateArgs {
        database,
        diff,
        ..UpdateArgs::default()
    };
    match UpdateConfig::try_from(args).expect_err("missing field should error") {
        CliError::MissingArgument {
            field: missing,
            env,
        } => {
            assert_eq!(missing, field);
            assert_eq!(env, env_var);
        }
        other => panic!("expected MissingArgument, found {other:?}"),
    }
}

#[rstest]
fn update_flags_repeat() {
    let cli = Cli::try_parse_from([
        "osm-derive",
        "update",
        "--database",
        "derived.sqlite",
        "--diff",
        "first.opl",
        "--diff",
        "second.opl",
        "--point-tag",
        "amenity",
    ])
    .expect("arguments parse");
    let Command::Update(args) = cli.command else {
        panic!("expected the update subcommand");
    };
    let config = UpdateConfig::try_from(args).expect("config should build");
    assert_eq!(
        config.diffs,
        vec![Utf8PathBuf::from("first.opl"), Utf8PathBuf::from("second.opl")]
    );
    assert_eq!(config.layout.point_tags, vec!["amenity".to_owned()]);
}

#[rstest]
fn unknown_subcommands_fail_to_parse() {
    let err = Cli::try_parse_from(["osm-derive", "solve"]).expect_err("unknown subcommand");
    assert_eq!(err.kind(), clap::error::ErrorKind::InvalidSubcommand);
}

#[rstest]
fn validate_sources_reports_missing_files() {
    let workspace = Workspace::new();
    let config = ImportConfig {
        database: workspace.database(),
        source: ImportSource::Opl(workspace.path("absent.opl")),
        point_index: None,
        fresh: false,
        layout: Layout::default(),
    };
    match config.validate_sources().expect_err("expected failure") {
        CliError::MissingSourceFile { field, path } => {
            assert_eq!(field, ARG_OPL);
            assert_eq!(path, workspace.path("absent.opl"));
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[rstest]
fn validate_sources_rejects_directories() {
    let workspace = Workspace::new();
    std::fs::create_dir(workspace.path("extract.osm.pbf").as_std_path()).expect("mkdir");
    let config = ImportConfig {
        database: workspace.database(),
        source: ImportSource::Pbf(workspace.path("extract.osm.pbf")),
        point_index: None,
        fresh: false,
        layout: Layout::default(),
    };
    match config.validate_sources().expect_err("expected directory rejection") {
        CliError::SourcePathNotFile { field, .. } => assert_eq!(field, ARG_OSM_PBF),
        other => panic!("unexpected error {other:?}"),
    }
}

#[rstest]
fn update_requires_an_existing_database() {
    let workspace = Workspace::new();
    let diff = workspace.write("change.opl", "n1 v2 x1.5 y1.0\n");
    let config = UpdateConfig {
        database: workspace.database(),
        diffs: vec![diff],
        point_index: None,
        layout: Layout::default(),
    };
    match config.validate_sources().expect_err("database missing") {
        CliError::MissingSourceFile { field, .. } => assert_eq!(field, ARG_DATABASE),
        other => panic!("unexpected error {other:?}"),
    }
}
