use std::path::PathBuf;

use clap::Parser;
use possync_core::{
    ActorId, OperationId, OperationKind, OperationStatus, Record, RecordKey, ReviewChoice,
    SyncConfig, TenantId, Version,
};
use pretty_assertions::assert_eq;
use serde_json::json;

use crate::cli::{Cli, Commands, CompletionShell, GlobalArgs, KeepArg, KindArg, StatusArg};
use crate::commands::common::{
    format_record_lines, format_relative_time, format_sync_timestamp, open_store, parse_fields,
    Settings,
};
use crate::commands::completions::run_completions;
use crate::commands::enqueue::{run_enqueue, EnqueueArgs};
use crate::commands::ops::parse_operation_id;
use crate::commands::profile::{apply_update, ProfileUpdate};
use crate::config_profiles::{CliProfile, CliProfilesConfig};
use crate::error::CliError;

fn args() -> GlobalArgs {
    GlobalArgs::default()
}

#[test]
fn parse_fields_reads_json_and_falls_back_to_text() {
    let fields = parse_fields(&[
        "status=ready".to_string(),
        "total=12.5".to_string(),
        "note=\"no onions\"".to_string(),
        "items=[1,2]".to_string(),
        "empty=".to_string(),
    ])
    .unwrap();

    assert_eq!(fields["status"], json!("ready"));
    assert_eq!(fields["total"], json!(12.5));
    assert_eq!(fields["note"], json!("no onions"));
    assert_eq!(fields["items"], json!([1, 2]));
    assert_eq!(fields["empty"], json!(""));
}

#[test]
fn parse_fields_rejects_missing_name() {
    assert!(matches!(
        parse_fields(&["ready".to_string()]),
        Err(CliError::InvalidField(_))
    ));
    assert!(matches!(
        parse_fields(&[" =ready".to_string()]),
        Err(CliError::InvalidField(_))
    ));
}

#[test]
fn flags_take_precedence_over_profile() {
    let profile = CliProfile {
        db_path: Some(PathBuf::from("/tmp/profile.db")),
        tenant: Some("bistro".to_string()),
        device: Some("till-1".to_string()),
        server_url: Some("https://sync.example.com".to_string()),
        config_path: None,
    };
    let mut flags = args();
    flags.tenant = Some("diner".to_string());
    flags.device = Some("  ".to_string());

    let settings = Settings::merge(&flags, Some(&profile));
    assert_eq!(settings.db_path, PathBuf::from("/tmp/profile.db"));
    assert_eq!(settings.tenant.as_deref(), Some("diner"));
    assert_eq!(settings.device, "till-1");
    assert_eq!(settings.server_url.as_deref(), Some("https://sync.example.com"));
}

#[test]
fn missing_tenant_and_server_are_reported() {
    let settings = Settings::merge(&args(), None);
    assert_eq!(settings.device, "possync-cli");
    assert!(matches!(settings.tenant(), Err(CliError::MissingTenant)));
    assert!(matches!(settings.client(), Err(CliError::SyncNotConfigured)));
}

#[test]
fn cli_parses_enqueue_with_global_flags() {
    let cli = Cli::try_parse_from([
        "possync",
        "enqueue",
        "status",
        "order",
        "42",
        "status=ready",
        "--tenant",
        "bistro",
    ])
    .unwrap();

    assert_eq!(cli.settings.tenant.as_deref(), Some("bistro"));
    match cli.command {
        Commands::Enqueue {
            kind,
            entity_type,
            entity_id,
            fields,
            operation_id,
            json,
        } => {
            assert_eq!(OperationKind::from(kind), OperationKind::StatusTransition);
            assert_eq!(operation_id, None);
            assert_eq!(entity_type, "order");
            assert_eq!(entity_id, "42");
            assert_eq!(fields, vec!["status=ready".to_string()]);
            assert!(!json);
        }
        _ => panic!("expected enqueue"),
    }
}

#[test]
fn ops_rejects_status_with_failures() {
    assert!(Cli::try_parse_from(["possync", "ops", "--failures", "--status", "failed"]).is_err());
}

#[test]
fn value_enums_map_to_core_types() {
    assert_eq!(OperationKind::from(KindArg::Delete), OperationKind::Delete);
    assert_eq!(OperationStatus::from(StatusArg::InFlight), OperationStatus::InFlight);
    assert_eq!(ReviewChoice::from(KeepArg::Local), ReviewChoice::KeepLocal);
    assert_eq!(ReviewChoice::from(KeepArg::Remote), ReviewChoice::KeepRemote);
}

#[test]
fn operation_ids_must_be_uuids() {
    assert!(parse_operation_id("not-an-id").is_err());
    let id = possync_core::OperationId::new();
    assert_eq!(parse_operation_id(&format!(" {id} ")).unwrap(), id);
}

#[test]
fn profile_update_only_touches_given_fields() {
    let mut config = CliProfilesConfig::default();
    apply_update(
        &mut config,
        "front",
        ProfileUpdate {
            tenant: Some("bistro".to_string()),
            server_url: Some("https://sync.example.com".to_string()),
            ..ProfileUpdate::default()
        },
    );
    apply_update(
        &mut config,
        "front",
        ProfileUpdate {
            device: Some("till-2".to_string()),
            ..ProfileUpdate::default()
        },
    );

    let profile = config.profile("front").unwrap();
    assert_eq!(profile.tenant.as_deref(), Some("bistro"));
    assert_eq!(profile.device.as_deref(), Some("till-2"));
    assert_eq!(profile.server_url.as_deref(), Some("https://sync.example.com"));
}

#[test]
fn relative_time_buckets() {
    let now = 10 * 86_400_000;
    assert_eq!(format_relative_time(now - 5_000, now), "just now");
    assert_eq!(format_relative_time(now - 5 * 60_000, now), "5m ago");
    assert_eq!(format_relative_time(now - 3 * 3_600_000, now), "3h ago");
    assert_eq!(format_relative_time(now - 2 * 86_400_000, now), "2d ago");
    assert_eq!(format_sync_timestamp(0), "1970-01-01 00:00:00 UTC");
}

#[test]
fn enqueued_record_is_shown_dirty() {
    let dir = tempfile::tempdir().unwrap();
    let mut flags = args();
    flags.db_path = Some(dir.path().join("store").join("possync.db"));
    flags.tenant = Some("bistro".to_string());
    let settings = Settings::merge(&flags, None);

    let store = open_store(&settings.db_path, SyncConfig::default()).unwrap();
    let key = settings.record_key("order", "42").unwrap();
    store
        .enqueue(
            &key,
            OperationKind::Create,
            parse_fields(&["status=placed".to_string()]).unwrap(),
            &settings.actor().unwrap(),
        )
        .unwrap();

    let record = store.get(&key).unwrap().unwrap();
    let lines = format_record_lines(&record);
    assert_eq!(lines[0], "bistro/order/42 v0 by possync-cli [dirty]");
    assert_eq!(lines[1], "  status = \"placed\"");
}

#[test]
fn repeated_enqueue_with_operation_id_queues_once() {
    let dir = tempfile::tempdir().unwrap();
    let mut flags = args();
    flags.db_path = Some(dir.path().join("possync.db"));
    flags.tenant = Some("bistro".to_string());
    let settings = Settings::merge(&flags, None);
    let id = OperationId::new().as_str();
    let fields = vec!["status=placed".to_string()];

    for _ in 0..2 {
        run_enqueue(
            &settings,
            EnqueueArgs {
                kind: OperationKind::Create,
                entity_type: "order",
                entity_id: "42",
                fields: &fields,
                operation_id: Some(&id),
            },
            false,
        )
        .unwrap();
    }

    let store = settings.open_store().unwrap();
    let queued = store
        .operations(&settings.tenant().unwrap(), None, 10)
        .unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].operation_id.as_str(), id);
}

#[test]
fn merged_record_shows_server_version() {
    let key = RecordKey::new(TenantId::new("bistro").unwrap(), "order", "42").unwrap();
    let mut record = Record::new(
        key,
        Version(7),
        ActorId::new("driver").unwrap(),
        parse_fields(&["status=delivered".to_string()]).unwrap(),
    );
    record.server_version = Version(6);
    assert_eq!(
        format_record_lines(&record)[0],
        "bistro/order/42 v7 (server v6) by driver"
    );
}

#[test]
fn completions_are_written_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("possync.bash");
    run_completions(CompletionShell::Bash, Some(&path)).unwrap();
    let script = std::fs::read_to_string(path).unwrap();
    assert!(script.contains("possync"));
}
