//! End-to-end runs against in-memory databases.

mod common;

use common::{config_yaml, Fixture, TABLES};
use hotelops_migrate::error::{
    EXIT_BACKUP_ERROR, EXIT_CANCELLED, EXIT_MIGRATION_ERROR, EXIT_ROLLBACK_ERROR,
};
use hotelops_migrate::{
    Config, MigrateError, MigrateOptions, MigrationReport, PlanError, RunMode, RunStatus,
    SqlValue, TableStatus, VerificationResult,
};
use tokio_util::sync::CancellationToken;

fn names(report: &MigrationReport) -> Vec<&str> {
    report.tables.iter().map(|t| t.table.as_str()).collect()
}

async fn migrate(fixture: &Fixture, options: MigrateOptions) -> MigrationReport {
    fixture
        .orchestrator("")
        .run(options, CancellationToken::new())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_full_run_follows_dependency_order() {
    let fixture = Fixture::new();
    let report = migrate(&fixture, MigrateOptions::default()).await;

    assert!(report.success, "{}", report.render_text());
    assert_eq!(report.mode, RunMode::Full);
    assert_eq!(report.exit_code, 0);
    assert_eq!(
        names(&report),
        vec!["guests", "hotels", "invoices", "rooms", "reservations"]
    );

    let plan = fixture.orchestrator("").plan(&[]).unwrap();
    let position = |t: &str| plan.iter().position(|s| s.destination == t).unwrap();
    for spec in &plan {
        for dep in &spec.depends_on {
            assert!(position(dep) < position(&spec.destination));
        }
    }
}

#[tokio::test]
async fn test_lossless_round_trip() {
    let fixture = Fixture::new();
    let report = migrate(&fixture, MigrateOptions::default()).await;
    assert!(report.success);

    for (table, expected) in [
        ("hotels", 3),
        ("guests", 4),
        ("rooms", 6),
        ("reservations", 10),
        ("invoices", 5),
    ] {
        let t = report.tables.iter().find(|t| t.table == table).unwrap();
        assert_eq!(t.status, TableStatus::Verified);
        assert_eq!(t.source_rows, Some(expected));
        assert_eq!(t.destination_rows_after, Some(expected));
        assert_eq!(t.rows_written, expected as u64);
        match &t.verification {
            Some(VerificationResult::Match {
                checksum,
                rows_checksummed,
                ..
            }) => {
                assert!(checksum.is_some());
                assert_eq!(*rows_checksummed, expected as u64);
            }
            other => panic!("{}: unexpected verification {:?}", table, other),
        }
    }

    let hotels = fixture.destination_rows("hotels");
    assert_eq!(
        hotels[0],
        vec![
            SqlValue::I32(1),
            SqlValue::Text("Harbour View".into()),
            SqlValue::Text("active".into()),
        ]
    );
    let guests = fixture.destination_rows("guests");
    assert_eq!(guests[0][1], SqlValue::Text("guest1@example.com".into()));
    let reservations = fixture.destination_rows("reservations");
    assert!(reservations.iter().all(|r| matches!(r[3], SqlValue::I64(_))));
}

#[tokio::test]
async fn test_report_is_persisted() {
    let fixture = Fixture::new();
    let report = migrate(&fixture, MigrateOptions::default()).await;

    let path = fixture.report_dir().join(report.file_name());
    let stored: MigrationReport =
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
    assert_eq!(stored.run_id, report.run_id);
    assert_eq!(stored.status, RunStatus::Success);
    assert_eq!(stored.snapshot_id, report.snapshot_id);
    assert_eq!(stored.rows_written, 28);
}

#[tokio::test]
async fn test_cyclic_plan_fails_before_any_io() {
    let fixture = Fixture::new();
    let plan = r#"
plan:
  tables:
    - { source: legacy_hotel, destination: hotels, primary_key: [id], depends_on: [rooms], columns: [{ source: hotel_id, destination: id }] }
    - { source: legacy_room, destination: rooms, primary_key: [id], depends_on: [hotels], columns: [{ source: room_id, destination: id }] }
"#;
    let config =
        Config::from_yaml(&config_yaml(&fixture.backup_dir(), &fixture.report_dir(), "", plan))
            .unwrap();

    let err = fixture
        .orchestrator_with(config)
        .run(MigrateOptions::default(), CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        MigrateError::Plan(PlanError::CyclicDependency { .. })
    ));
    assert_eq!(err.exit_code(), hotelops_migrate::error::EXIT_PLAN_ERROR);
    assert!(!fixture.backup_dir().exists());
    assert!(!fixture.report_dir().exists());
    assert_eq!(fixture.destination_rows("hotels").len(), 1);
}

#[tokio::test]
async fn test_unknown_column_fails_before_any_io() {
    let fixture = Fixture::new();
    let plan = r#"
plan:
  tables:
    - { source: legacy_hotel, destination: hotels, primary_key: [id], columns: [{ source: hotel_id, destination: id }, { source: stars, destination: rating }] }
"#;
    let config =
        Config::from_yaml(&config_yaml(&fixture.backup_dir(), &fixture.report_dir(), "", plan))
            .unwrap();

    let err = fixture
        .orchestrator_with(config)
        .run(MigrateOptions::default(), CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        MigrateError::Plan(PlanError::UnknownColumn { .. })
    ));
    assert!(!fixture.backup_dir().exists());
}

#[tokio::test]
async fn test_dry_run_changes_nothing() {
    let fixture = Fixture::new();
    let before = fixture.destination_counts();

    let report = migrate(
        &fixture,
        MigrateOptions {
            dry_run: true,
            tables: Vec::new(),
        },
    )
    .await;

    assert!(report.success);
    assert_eq!(report.mode, RunMode::DryRun);
    assert!(report.snapshot_id.is_none());
    // Transformed, never committed.
    assert_eq!(report.rows_written, 28);
    assert!(report
        .tables
        .iter()
        .all(|t| t.status == TableStatus::Simulated));
    assert_eq!(fixture.destination_counts(), before);
    assert!(!fixture.backup_dir().exists());
}

#[tokio::test]
async fn test_dry_run_with_writes_still_changes_nothing() {
    let fixture = Fixture::new();
    let before = fixture.destination_counts();

    let report = fixture
        .orchestrator("dry_run_writes: true")
        .run(
            MigrateOptions {
                dry_run: true,
                tables: Vec::new(),
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(report.success);
    assert_eq!(fixture.destination_counts(), before);
}

#[tokio::test]
async fn test_failure_rolls_back_every_table() {
    let fixture = Fixture::new();
    let before: Vec<_> = TABLES
        .iter()
        .map(|t| fixture.destination_rows(t))
        .collect();
    fixture
        .source
        .replace_row(
            "legacy_reservation",
            vec![
                SqlValue::I32(7),
                SqlValue::I32(4),
                SqlValue::I32(2),
                SqlValue::Text("seven".into()),
            ],
        )
        .unwrap();

    let report = migrate(&fixture, MigrateOptions::default()).await;

    assert!(!report.success);
    assert_eq!(report.status, RunStatus::RolledBack);
    assert_eq!(report.exit_code, EXIT_MIGRATION_ERROR);

    let reservations = report
        .tables
        .iter()
        .find(|t| t.table == "reservations")
        .unwrap();
    assert_eq!(reservations.status, TableStatus::RolledBack);
    let error = reservations.error.as_ref().unwrap();
    assert_eq!(error.row.as_deref(), Some("res_id=7"));
    assert_eq!(error.exit_code, EXIT_MIGRATION_ERROR);

    // Tables migrated before the failure stay verified in the report and are
    // flagged as restored: their rows are gone again.
    for table in ["guests", "hotels", "invoices", "rooms"] {
        let t = report.tables.iter().find(|t| t.table == table).unwrap();
        assert_eq!(t.status, TableStatus::Verified);
        assert!(t.restored, "{} not flagged as restored", table);
    }
    assert!(!reservations.restored);
    let after: Vec<_> = TABLES
        .iter()
        .map(|t| fixture.destination_rows(t))
        .collect();
    assert_eq!(after, before);

    let rollback = report.rollback.as_ref().unwrap();
    assert!(rollback.succeeded);
    assert_eq!(Some(&rollback.snapshot_id), report.snapshot_id.as_ref());
    assert_eq!(rollback.tables.len(), 5);

    let hint = report.recovery_hint.as_deref().unwrap();
    assert!(hint.contains(report.snapshot_id.as_deref().unwrap()));
    assert!(hint.contains("reservations"));
}

#[tokio::test]
async fn test_failed_rollback_needs_manual_intervention() {
    let fixture = Fixture::new();
    // Every insert into hotels fails, the reload of the placeholder row included.
    fixture.destination.fail_inserts("hotels", 0);

    let report = migrate(&fixture, MigrateOptions::default()).await;

    assert_eq!(report.status, RunStatus::RollbackFailed);
    assert_eq!(report.exit_code, EXIT_ROLLBACK_ERROR);
    assert!(!report.rollback.as_ref().unwrap().succeeded);
    assert!(report
        .recovery_hint
        .as_deref()
        .unwrap()
        .contains("--rollback --snapshot="));
}

#[tokio::test]
async fn test_backup_failure_migrates_nothing() {
    let fixture = Fixture::new();
    fixture.destination.fail_reads("rooms");
    let before = fixture.destination_counts();

    let report = migrate(&fixture, MigrateOptions::default()).await;

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.exit_code, EXIT_BACKUP_ERROR);
    assert!(report.snapshot_id.is_none());
    assert!(report
        .tables
        .iter()
        .all(|t| t.status == TableStatus::Pending));

    fixture.destination.clear_faults();
    assert_eq!(fixture.destination_counts(), before);
    assert!(fixture.orchestrator("").snapshots().unwrap().is_empty());
}

#[tokio::test]
async fn test_table_selection_pulls_in_dependencies() {
    let fixture = Fixture::new();
    let report = migrate(
        &fixture,
        MigrateOptions {
            dry_run: false,
            tables: vec!["invoices".to_string()],
        },
    )
    .await;

    assert!(report.success);
    assert_eq!(report.mode, RunMode::TableSubset);
    assert_eq!(names(&report), vec!["hotels", "invoices"]);
    assert_eq!(fixture.destination_rows("invoices").len(), 5);
    assert_eq!(fixture.destination_rows("hotels").len(), 3);
    assert!(fixture.destination_rows("guests").is_empty());
    assert!(fixture.destination_rows("reservations").is_empty());

    let snapshots = fixture.orchestrator("").snapshots().unwrap();
    assert_eq!(snapshots.len(), 1);
    let covered: Vec<_> = snapshots[0].tables.iter().map(|t| t.table.as_str()).collect();
    assert_eq!(covered, vec!["hotels", "invoices"]);
}

#[tokio::test]
async fn test_truncate_clears_referencing_tables_first() {
    let fixture = Fixture::new();
    fixture
        .destination
        .add_reference("invoices", "hotel_id", "hotels", "id");
    fixture
        .destination
        .insert_rows(
            "invoices",
            vec![vec![SqlValue::I64(50), SqlValue::I64(99), SqlValue::I64(100)]],
        )
        .unwrap();
    let options = MigrateOptions {
        dry_run: false,
        tables: vec!["invoices".to_string()],
    };

    let first = migrate(&fixture, options.clone()).await;
    assert!(first.success, "{}", first.render_text());

    // Hotels can only be emptied once the invoices pointing at them are gone.
    let rerun = migrate(&fixture, options).await;
    assert!(rerun.success, "{}", rerun.render_text());

    assert_eq!(fixture.destination_rows("hotels").len(), 3);
    let invoices = fixture.destination_rows("invoices");
    assert_eq!(invoices.len(), 5);
    assert!(invoices.iter().all(|row| row[1] != SqlValue::I64(99)));
}

#[tokio::test]
async fn test_explicit_rollback_restores_manifest_counts() {
    let fixture = Fixture::new();
    let migrated = migrate(&fixture, MigrateOptions::default()).await;
    assert!(migrated.success);
    assert_eq!(fixture.destination_rows("hotels").len(), 3);

    let report = fixture.orchestrator("").rollback(None).await.unwrap();

    assert!(report.success, "{}", report.render_text());
    assert_eq!(report.mode, RunMode::Rollback);
    assert_eq!(report.exit_code, 0);
    assert_eq!(report.snapshot_id, migrated.snapshot_id);

    let snapshots = fixture.orchestrator("").snapshots().unwrap();
    let manifest = snapshots
        .iter()
        .find(|m| Some(&m.snapshot_id) == migrated.snapshot_id.as_ref())
        .unwrap();
    for entry in &manifest.tables {
        assert_eq!(
            fixture.destination_rows(&entry.table).len() as i64,
            entry.row_count,
            "{}",
            entry.table
        );
    }
    assert!(report
        .tables
        .iter()
        .all(|t| t.status == TableStatus::RolledBack));
}

#[tokio::test]
async fn test_rollback_to_unknown_snapshot() {
    let fixture = Fixture::new();
    let err = fixture
        .orchestrator("")
        .rollback(Some("20200101T000000000Z-00000000"))
        .await
        .unwrap_err();
    assert_eq!(err.exit_code(), EXIT_ROLLBACK_ERROR);
}

#[tokio::test]
async fn test_rerun_after_restore_is_idempotent() {
    let fixture = Fixture::new();
    let first = migrate(&fixture, MigrateOptions::default()).await;
    assert!(first.success);
    let migrated: Vec<_> = TABLES
        .iter()
        .map(|t| fixture.destination_rows(t))
        .collect();

    let snapshot = first.snapshot_id.clone().unwrap();
    let restored = fixture
        .orchestrator("")
        .rollback(Some(&snapshot))
        .await
        .unwrap();
    assert!(restored.success);

    let second = migrate(&fixture, MigrateOptions::default()).await;
    assert!(second.success);
    assert_ne!(second.snapshot_id, first.snapshot_id);
    let again: Vec<_> = TABLES
        .iter()
        .map(|t| fixture.destination_rows(t))
        .collect();
    assert_eq!(again, migrated);

    // And once more without restoring first: truncate loading converges.
    let third = migrate(&fixture, MigrateOptions::default()).await;
    assert!(third.success);
    let once_more: Vec<_> = TABLES
        .iter()
        .map(|t| fixture.destination_rows(t))
        .collect();
    assert_eq!(once_more, migrated);
}

#[tokio::test]
async fn test_append_mode_adds_to_existing_rows() {
    let fixture = Fixture::new();
    let report = fixture
        .orchestrator("load_mode: append")
        .run(
            MigrateOptions {
                dry_run: false,
                tables: vec!["hotels".to_string()],
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(report.success);
    let hotels = &report.tables[0];
    assert_eq!(hotels.destination_rows_before, Some(1));
    assert_eq!(hotels.destination_rows_after, Some(4));
    assert_eq!(fixture.destination_rows("hotels").len(), 4);
}

#[tokio::test]
async fn test_parallel_workers_migrate_every_table() {
    let fixture = Fixture::new();
    let report = fixture
        .orchestrator("workers: 3")
        .run(MigrateOptions::default(), CancellationToken::new())
        .await
        .unwrap();

    assert!(report.success, "{}", report.render_text());
    assert_eq!(report.rows_written, 28);
    assert_eq!(fixture.destination_rows("reservations").len(), 10);
}

#[tokio::test]
async fn test_parallel_failure_rolls_back() {
    let fixture = Fixture::new();
    fixture.source.fail_reads("legacy_invoice");
    let before = fixture.destination_counts();

    let report = fixture
        .orchestrator("workers: 3")
        .run(MigrateOptions::default(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::RolledBack);
    assert_eq!(report.exit_code, EXIT_MIGRATION_ERROR);
    let invoices = report.tables.iter().find(|t| t.table == "invoices").unwrap();
    assert_eq!(invoices.status, TableStatus::RolledBack);
    // The level after the failed one never starts.
    let reservations = report
        .tables
        .iter()
        .find(|t| t.table == "reservations")
        .unwrap();
    assert_eq!(reservations.status, TableStatus::Pending);
    assert_eq!(fixture.destination_counts(), before);
}

#[tokio::test]
async fn test_cancelled_run_is_partial() {
    let fixture = Fixture::new();
    let before = fixture.destination_counts();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = fixture
        .orchestrator("")
        .run(MigrateOptions::default(), cancel)
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Partial);
    assert_eq!(report.exit_code, EXIT_CANCELLED);
    assert!(report.snapshot_id.is_some());
    assert!(report.rollback.is_none());
    assert_eq!(fixture.destination_counts(), before);
}

#[tokio::test]
async fn test_verify_counts_after_run() {
    let fixture = Fixture::new();
    let orchestrator = fixture.orchestrator("");

    let before = orchestrator.verify_counts().await.unwrap();
    assert!(!before.all_match());

    let report = orchestrator
        .run(MigrateOptions::default(), CancellationToken::new())
        .await
        .unwrap();
    assert!(report.success);

    let after = orchestrator.verify_counts().await.unwrap();
    assert!(after.all_match());
    assert_eq!(after.tables_matched, 5);
}

#[tokio::test]
async fn test_health_check_with_memory_databases() {
    let fixture = Fixture::new();
    let health = fixture.orchestrator("").health_check().await.unwrap();
    assert!(health.healthy);
    assert!(health.source_connected && health.destination_connected);
}
