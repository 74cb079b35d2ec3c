#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::path::Path;
use std::str::FromStr;
use std::thread;

use anyhow::{anyhow, Context, Result};
use inventory_tags_core::{
    format_rfc3339, now_utc, parse_date, parse_rfc3339_utc, EngineConfig, InventoryError, Tag,
    TagStatus,
};
use rusqlite::types::{Type, ValueRef};
use rusqlite::{params, Connection, ErrorCode};
use rust_decimal::Decimal;
use time::{Date, OffsetDateTime};
use tracing::{debug, warn};

mod archive;
mod audit_log;
mod cache;
mod diff_auditor;
mod order_store;
mod service;
mod subtag_ledger;
mod tag_store;

pub use archive::ArchiveManager;
pub use audit_log::AuditLedger;
pub use cache::{CacheKey, ReadCache};
pub use diff_auditor::{DiffAuditor, DiffOutcome};
pub use order_store::OrderStore;
pub use service::InventoryService;
pub use subtag_ledger::SubtagLedger;
pub use tag_store::TagStore;

const INVENTORY_MIGRATION_VERSION: i64 = 1;

const SCHEMA_INVENTORY_V1: &str = r"
CREATE TABLE IF NOT EXISTS tags (
  id INTEGER PRIMARY KEY CHECK (id > 0),
  caliber TEXT,
  weight TEXT NOT NULL DEFAULT '0',
  client TEXT,
  supplier TEXT,
  expiry TEXT,
  status TEXT,
  reference_number TEXT,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tags_status ON tags(status);

CREATE TABLE IF NOT EXISTS subtags (
  tag_id INTEGER NOT NULL,
  letter TEXT NOT NULL COLLATE NOCASE,
  client TEXT NOT NULL,
  weight TEXT NOT NULL,
  status TEXT,
  created_at TEXT NOT NULL,
  created_by TEXT NOT NULL,
  PRIMARY KEY (tag_id, letter),
  FOREIGN KEY (tag_id) REFERENCES tags(id)
);

CREATE TABLE IF NOT EXISTS orders (
  id INTEGER PRIMARY KEY,
  client_name TEXT NOT NULL,
  status TEXT NOT NULL,
  payment TEXT NOT NULL,
  reference_number TEXT,
  observation TEXT,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_log (
  entry_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  entry_id TEXT NOT NULL UNIQUE,
  recorded_at TEXT NOT NULL,
  entity_kind TEXT NOT NULL CHECK (entity_kind IN ('tag', 'subtag', 'order')),
  subject_id INTEGER NOT NULL,
  actor TEXT NOT NULL CHECK (length(trim(actor)) > 0),
  field TEXT NOT NULL,
  old_value TEXT NOT NULL,
  new_value TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_audit_log_no_update
BEFORE UPDATE ON audit_log
BEGIN
  SELECT RAISE(FAIL, 'audit_log is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_audit_log_no_delete
BEFORE DELETE ON audit_log
BEGIN
  SELECT RAISE(FAIL, 'audit_log is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_audit_log_subject_seq
  ON audit_log(entity_kind, subject_id, entry_seq);

CREATE TABLE IF NOT EXISTS archived_tags (
  archive_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  tag_id INTEGER NOT NULL,
  caliber TEXT,
  weight TEXT NOT NULL,
  client TEXT,
  supplier TEXT,
  expiry TEXT,
  status TEXT,
  reference_number TEXT,
  archived_at TEXT NOT NULL,
  archived_by TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_archived_tags_tag_seq
  ON archived_tags(tag_id, archive_seq);

CREATE TABLE IF NOT EXISTS archived_subtags (
  archive_seq INTEGER NOT NULL,
  tag_id INTEGER NOT NULL,
  letter TEXT NOT NULL,
  client TEXT NOT NULL,
  weight TEXT NOT NULL,
  status TEXT,
  created_at TEXT NOT NULL,
  created_by TEXT NOT NULL,
  PRIMARY KEY (archive_seq, letter),
  FOREIGN KEY (archive_seq) REFERENCES archived_tags(archive_seq)
);

CREATE TABLE IF NOT EXISTS pending_archives (
  tag_id INTEGER PRIMARY KEY,
  archive_seq INTEGER NOT NULL,
  completed_steps INTEGER NOT NULL CHECK (completed_steps BETWEEN 1 AND 4),
  FOREIGN KEY (archive_seq) REFERENCES archived_tags(archive_seq)
);

CREATE TRIGGER IF NOT EXISTS trg_archived_tags_no_update
BEFORE UPDATE ON archived_tags
BEGIN
  SELECT RAISE(FAIL, 'archived_tags is immutable');
END;

CREATE TRIGGER IF NOT EXISTS trg_archived_tags_no_delete
BEFORE DELETE ON archived_tags
BEGIN
  SELECT RAISE(FAIL, 'archived_tags is immutable');
END;

CREATE TRIGGER IF NOT EXISTS trg_archived_subtags_no_update
BEFORE UPDATE ON archived_subtags
BEGIN
  SELECT RAISE(FAIL, 'archived_subtags is immutable');
END;

CREATE TRIGGER IF NOT EXISTS trg_archived_subtags_no_delete
BEFORE DELETE ON archived_subtags
BEGIN
  SELECT RAISE(FAIL, 'archived_subtags is immutable');
END;
";

pub(crate) const TAG_COLUMNS: &str =
    "id, caliber, weight, client, supplier, expiry, status, reference_number";

/// Failure of one storage step: either a domain rejection that must reach
/// the caller as-is, or a SQLite error subject to retry classification.
#[derive(Debug)]
pub(crate) enum StepError {
    Sqlite(rusqlite::Error),
    Domain(InventoryError),
}

impl From<rusqlite::Error> for StepError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Sqlite(err)
    }
}

impl From<InventoryError> for StepError {
    fn from(err: InventoryError) -> Self {
        Self::Domain(err)
    }
}

pub struct SqliteBackend {
    conn: Connection,
    config: EngineConfig,
}

impl SqliteBackend {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_config(path, EngineConfig::default())
    }

    pub fn open_with_config(path: &Path, config: EngineConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|err| anyhow!("engine config rejected: {err}"))?;

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(&format!(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = {};",
            config.busy_timeout_ms
        ))
        .context("failed to configure sqlite pragmas")?;

        debug!(path = %path.display(), "opened inventory database");
        Ok(Self { conn, config })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_INVENTORY_V1)
            .context("failed to apply inventory schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![INVENTORY_MIGRATION_VERSION, now],
            )
            .context("failed to register inventory schema migration")?;

        Ok(())
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn tags(&self) -> TagStore<'_> {
        TagStore::new(self)
    }

    #[must_use]
    pub fn orders(&self) -> OrderStore<'_> {
        OrderStore::new(self)
    }

    #[must_use]
    pub fn subtags(&self) -> SubtagLedger<'_> {
        SubtagLedger::new(self)
    }

    #[must_use]
    pub fn audit(&self) -> AuditLedger<'_> {
        AuditLedger::new(self)
    }

    #[must_use]
    pub fn archive(&self) -> ArchiveManager<'_> {
        ArchiveManager::new(self)
    }

    #[must_use]
    pub fn diff_auditor(&self) -> DiffAuditor<'_> {
        DiffAuditor::new(self)
    }

    /// Runs one storage step, retrying while SQLite reports the database as
    /// busy or locked. Each attempt re-runs `step` from the start, so a step
    /// must open and commit its own transaction.
    pub(crate) fn run<T>(
        &self,
        operation: &str,
        mut step: impl FnMut(&Connection) -> std::result::Result<T, StepError>,
    ) -> std::result::Result<T, InventoryError> {
        let attempts = self.config.retry_attempts.max(1);
        let mut attempt = 1;
        loop {
            match step(&self.conn) {
                Ok(value) => return Ok(value),
                Err(StepError::Domain(err)) => return Err(err),
                Err(StepError::Sqlite(err)) if is_contention(&err) && attempt < attempts => {
                    warn!(operation, attempt, error = %err, "sqlite busy, retrying");
                    thread::sleep(self.config.retry_backoff());
                    attempt += 1;
                }
                Err(StepError::Sqlite(err)) => {
                    warn!(operation, attempt, error = %err, "storage step failed");
                    return Err(InventoryError::storage(format!("{operation}: {err}")));
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn is_contention(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _)
            if matches!(inner.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _) if inner.code == ErrorCode::ConstraintViolation
    )
}

pub(crate) fn conversion_error(idx: usize, ty: Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        ty,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

/// Reads a weight column. Canonical rows hold decimal text; legacy rows may
/// hold integers, reals or NULL.
pub(crate) fn read_weight(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    match row.get_ref(idx)? {
        ValueRef::Null => Ok(Decimal::ZERO),
        ValueRef::Integer(value) => Ok(Decimal::from(value)),
        ValueRef::Real(value) => Decimal::try_from(value)
            .map_err(|err| conversion_error(idx, Type::Real, format!("invalid weight: {err}"))),
        ValueRef::Text(bytes) => {
            let raw = String::from_utf8_lossy(bytes);
            Decimal::from_str(raw.trim())
                .map_err(|err| conversion_error(idx, Type::Text, format!("invalid weight {raw:?}: {err}")))
        }
        ValueRef::Blob(_) => Err(conversion_error(
            idx,
            Type::Blob,
            "weight stored as blob".to_string(),
        )),
    }
}

pub(crate) fn read_status(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<TagStatus> {
    let raw: Option<String> = row.get(idx)?;
    TagStatus::from_label(raw.as_deref()).ok_or_else(|| {
        conversion_error(
            idx,
            Type::Text,
            format!("invalid status label: {}", raw.unwrap_or_default()),
        )
    })
}

pub(crate) fn read_date(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<Date>> {
    let raw: Option<String> = row.get(idx)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => parse_date(value)
            .map(Some)
            .map_err(|err| conversion_error(idx, Type::Text, err.to_string())),
    }
}

pub(crate) fn read_timestamp(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<OffsetDateTime> {
    let raw: String = row.get(idx)?;
    parse_rfc3339_utc(&raw).map_err(|err| conversion_error(idx, Type::Text, err.to_string()))
}

fn blank_to_none(value: Option<String>) -> Option<String> {
    value.and_then(|text| {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

/// Parses a row selected with [`TAG_COLUMNS`] starting at `offset`.
pub(crate) fn parse_tag_columns(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<Tag> {
    Ok(Tag {
        id: row.get(offset)?,
        caliber: blank_to_none(row.get(offset + 1)?),
        weight: read_weight(row, offset + 2)?,
        client: blank_to_none(row.get(offset + 3)?),
        supplier: blank_to_none(row.get(offset + 4)?),
        expiry: read_date(row, offset + 5)?,
        status: read_status(row, offset + 6)?,
        reference_number: blank_to_none(row.get(offset + 7)?),
    })
}

pub(crate) fn parse_tag_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Tag> {
    parse_tag_columns(row, 0)
}

pub(crate) fn optional_text(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub(crate) fn now_text() -> std::result::Result<String, InventoryError> {
    format_rfc3339(now_utc())
}

pub(crate) fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> rusqlite::Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn schema_contains_expected_tables_and_triggers() {
        let backend = fixture_backend();
        let mut stmt = must(backend.connection().prepare(
            "SELECT name FROM sqlite_master WHERE type IN ('table', 'trigger') ORDER BY name",
        ));
        let rows = must(stmt.query_map([], |row| row.get::<_, String>(0)));
        let names: BTreeSet<String> = must(collect_rows(rows)).into_iter().collect();

        for expected in [
            "tags",
            "subtags",
            "orders",
            "audit_log",
            "archived_tags",
            "archived_subtags",
            "schema_migrations",
            "trg_audit_log_no_update",
            "trg_audit_log_no_delete",
            "trg_archived_tags_no_update",
            "trg_archived_subtags_no_delete",
        ] {
            assert!(names.contains(expected), "missing schema object {expected}");
        }
    }

    #[test]
    fn migration_is_idempotent() {
        let backend = fixture_backend();
        seed_open_tag(&backend, 5, kg(10, 0));
        must(backend.migrate());
        must(backend.migrate());

        let count: i64 = must(backend.connection().query_row(
            "SELECT COUNT(*) FROM schema_migrations",
            [],
            |row| row.get(0),
        ));
        assert_eq!(count, 1);
        assert!(must(backend.tags().get(5)).is_some());
    }

    #[test]
    fn invalid_config_is_rejected_at_open() {
        let config = EngineConfig {
            retry_attempts: 0,
            ..EngineConfig::default()
        };
        assert!(SqliteBackend::open_with_config(Path::new(":memory:"), config).is_err());
    }

    #[test]
    fn legacy_rows_are_read_through_translation_boundary() {
        let backend = fixture_backend();
        must(backend.connection().execute_batch(
            "INSERT INTO tags(id, caliber, weight, status, updated_at)
               VALUES (1, ' 10/12 ', 12.5, 'GERADO', '2026-01-01T00:00:00Z');
             INSERT INTO tags(id, weight, status, updated_at)
               VALUES (2, 3, NULL, '2026-01-01T00:00:00Z');
             INSERT INTO tags(id, weight, status, expiry, updated_at)
               VALUES (3, '4.250', ' Orçamento ', '2026-07-01', '2026-01-01T00:00:00Z');",
        ));

        let tags = must(backend.tags().get_by_range(1, 3));
        assert_eq!(tags.len(), 3);
        assert_eq!(tags[0].status, TagStatus::Generated);
        assert_eq!(tags[0].caliber.as_deref(), Some("10/12"));
        assert_eq!(tags[0].weight, kg(125, 1));
        assert_eq!(tags[1].status, TagStatus::Free);
        assert_eq!(tags[1].weight, kg(3, 0));
        assert_eq!(tags[2].status, TagStatus::Quoted);
        assert!(tags[2].expiry.is_some());
    }

    #[test]
    fn unknown_status_label_is_reported_as_storage_error() {
        let backend = fixture_backend();
        must(backend.connection().execute(
            "INSERT INTO tags(id, weight, status, updated_at) VALUES (9, '1', 'shipped', '2026-01-01T00:00:00Z')",
            [],
        ));
        assert!(matches!(
            backend.tags().get(9),
            Err(InventoryError::StorageUnavailable { .. })
        ));
    }

    #[test]
    fn busy_database_is_retried_until_lock_release() {
        let db_path = std::env::temp_dir().join(format!(
            "inventory-lock-test-{}.sqlite3",
            ulid::Ulid::new()
        ));

        let config = EngineConfig {
            busy_timeout_ms: 0,
            retry_attempts: 20,
            retry_backoff_ms: 50,
            ..EngineConfig::default()
        };
        let setup = must(SqliteBackend::open_with_config(&db_path, config.clone()));
        must(setup.migrate());
        drop(setup);

        let lock_conn = must(Connection::open(&db_path));
        must(lock_conn.execute_batch("BEGIN IMMEDIATE;"));

        let writer_path = db_path.clone();
        let handle = std::thread::spawn(move || {
            let backend = must(SqliteBackend::open_with_config(&writer_path, config));
            let mut patch = inventory_tags_core::TagPatch::new(1);
            patch.weight = Some(Decimal::ONE);
            backend.tags().upsert(&[patch])
        });

        std::thread::sleep(std::time::Duration::from_millis(150));
        must(lock_conn.execute_batch("COMMIT;"));

        let result = match handle.join() {
            Ok(result) => result,
            Err(err) => panic!("writer thread join failed: {err:?}"),
        };
        assert_eq!(result, Ok(1));

        let _ = std::fs::remove_file(&db_path);
    }
}
