//! Shared fixtures: a small hotel-operations schema on both sides.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use hotelops_migrate::{ColumnInfo, Config, MemoryDatabase, Orchestrator, SqlValue};
use tempfile::TempDir;

pub const TABLES: [&str; 5] = ["hotels", "guests", "rooms", "reservations", "invoices"];

/// Configured in reverse dependency order so the plan has to sort it.
const PLAN: &str = r#"
plan:
  tables:
    - source: legacy_invoice
      destination: invoices
      primary_key: [id]
      depends_on: [hotels]
      columns:
        - { source: inv_id, destination: id }
        - { source: hotel_ref, destination: hotel_id }
        - { source: amount_cents, destination: amount_cents, transforms: [to_integer] }
    - source: legacy_reservation
      destination: reservations
      primary_key: [id]
      depends_on: [guests, rooms]
      columns:
        - { source: res_id, destination: id }
        - { source: guest_ref, destination: guest_id }
        - { source: room_ref, destination: room_id }
        - { source: nights, destination: nights, transforms: [trim, to_integer] }
    - source: legacy_room
      destination: rooms
      primary_key: [id]
      depends_on: [hotels]
      columns:
        - { source: room_id, destination: id }
        - { source: hotel_ref, destination: hotel_id }
        - { source: room_no, destination: number, transforms: [trim, uppercase] }
    - source: legacy_guest
      destination: guests
      primary_key: [id]
      columns:
        - { source: guest_id, destination: id }
        - { source: email, destination: email, transforms: [trim, lowercase] }
    - source: legacy_hotel
      destination: hotels
      primary_key: [id]
      columns:
        - { source: hotel_id, destination: id }
        - { source: hotel_name, destination: name, transforms: [trim] }
      defaults: { status: active }
"#;

pub struct Fixture {
    pub dir: TempDir,
    pub source: MemoryDatabase,
    pub destination: MemoryDatabase,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            source: legacy_database(),
            destination: new_database(),
        }
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.dir.path().join("backups")
    }

    pub fn report_dir(&self) -> PathBuf {
        self.dir.path().join("reports")
    }

    pub fn config(&self, migration: &str) -> Config {
        Config::from_yaml(&config_yaml(&self.backup_dir(), &self.report_dir(), migration, PLAN))
            .unwrap()
    }

    pub fn orchestrator(&self, migration: &str) -> Orchestrator {
        self.orchestrator_with(self.config(migration))
    }

    pub fn orchestrator_with(&self, config: Config) -> Orchestrator {
        Orchestrator::with_databases(
            config,
            Arc::new(self.source.clone()),
            Arc::new(self.destination.clone()),
        )
    }

    pub fn destination_rows(&self, table: &str) -> Vec<Vec<SqlValue>> {
        self.destination.rows(table).unwrap()
    }

    pub fn destination_counts(&self) -> Vec<(String, usize)> {
        TABLES
            .iter()
            .map(|t| (t.to_string(), self.destination_rows(t).len()))
            .collect()
    }
}

/// `migration` holds extra `migration:` entries, e.g. `"workers: 3"`.
pub fn config_yaml(backups: &Path, reports: &Path, migration: &str, plan: &str) -> String {
    let migration = if migration.is_empty() {
        "batch_size: 3".to_string()
    } else {
        format!("batch_size: 3, {}", migration)
    };
    format!(
        r#"
source: {{ host: legacy-db, database: pms, user: reader, ssl_mode: disable }}
destination: {{ host: new-db, database: hotelops, user: loader, ssl_mode: disable }}
migration: {{ {migration} }}
verification: {{ level: full }}
backup: {{ directory: "{backups}" }}
report: {{ directory: "{reports}" }}
{plan}
"#,
        migration = migration,
        backups = backups.display(),
        reports = reports.display(),
        plan = plan,
    )
}

fn int(name: &str) -> ColumnInfo {
    ColumnInfo::new(name, "int4", false)
}

fn text(name: &str) -> ColumnInfo {
    ColumnInfo::new(name, "text", true)
}

fn bigint(name: &str) -> ColumnInfo {
    ColumnInfo::new(name, "int8", false)
}

fn s(v: &str) -> SqlValue {
    SqlValue::Text(v.to_string())
}

pub fn legacy_database() -> MemoryDatabase {
    let db = MemoryDatabase::new("legacy");

    db.create_table("legacy_hotel", vec![int("hotel_id"), text("hotel_name")], vec!["hotel_id"]);
    db.insert_rows(
        "legacy_hotel",
        vec![
            vec![SqlValue::I32(1), s("  Harbour View ")],
            vec![SqlValue::I32(2), s("Old Mill")],
            vec![SqlValue::I32(3), s("Seaside Lodge")],
        ],
    )
    .unwrap();

    db.create_table("legacy_guest", vec![int("guest_id"), text("email")], vec!["guest_id"]);
    db.insert_rows(
        "legacy_guest",
        (1..=4)
            .map(|i| vec![SqlValue::I32(i), s(&format!(" Guest{}@Example.COM", i))])
            .collect(),
    )
    .unwrap();

    db.create_table(
        "legacy_room",
        vec![int("room_id"), int("hotel_ref"), text("room_no")],
        vec!["room_id"],
    );
    db.insert_rows(
        "legacy_room",
        (1..=6)
            .map(|i| {
                vec![
                    SqlValue::I32(i),
                    SqlValue::I32(1 + i % 3),
                    s(&format!("{}0{}a", 1 + i / 3, i)),
                ]
            })
            .collect(),
    )
    .unwrap();

    db.create_table(
        "legacy_reservation",
        vec![int("res_id"), int("guest_ref"), int("room_ref"), text("nights")],
        vec!["res_id"],
    );
    db.insert_rows(
        "legacy_reservation",
        (1..=10)
            .map(|i| {
                vec![
                    SqlValue::I32(i),
                    SqlValue::I32(1 + i % 4),
                    SqlValue::I32(1 + i % 6),
                    s(&format!(" {} ", 1 + i % 5)),
                ]
            })
            .collect(),
    )
    .unwrap();

    db.create_table(
        "legacy_invoice",
        vec![int("inv_id"), int("hotel_ref"), text("amount_cents")],
        vec!["inv_id"],
    );
    db.insert_rows(
        "legacy_invoice",
        (1..=5)
            .map(|i| vec![SqlValue::I32(i), SqlValue::I32(1 + i % 3), s(&format!("{}", i * 12_50))])
            .collect(),
    )
    .unwrap();

    db
}

/// The new schema, with one hotel already present.
pub fn new_database() -> MemoryDatabase {
    let db = MemoryDatabase::new("hotelops");

    db.create_table(
        "hotels",
        vec![bigint("id"), text("name"), text("status")],
        vec!["id"],
    );
    db.insert_rows(
        "hotels",
        vec![vec![SqlValue::I64(99), s("Placeholder"), s("closed")]],
    )
    .unwrap();

    db.create_table("guests", vec![bigint("id"), text("email")], vec!["id"]);
    db.create_table(
        "rooms",
        vec![bigint("id"), bigint("hotel_id"), text("number")],
        vec!["id"],
    );
    db.create_table(
        "reservations",
        vec![bigint("id"), bigint("guest_id"), bigint("room_id"), bigint("nights")],
        vec!["id"],
    );
    db.create_table(
        "invoices",
        vec![bigint("id"), bigint("hotel_id"), bigint("amount_cents")],
        vec!["id"],
    );

    db
}
