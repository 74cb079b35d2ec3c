use inventory_tags_core::{
    format_rfc3339, now_utc, AuditEntry, AuditEntryInput, EntityKind, InventoryError,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection};
use tracing::info;
use ulid::Ulid;

use crate::{collect_rows, conversion_error, read_timestamp, SqliteBackend, StepError};

const AUDIT_COLUMNS: &str = "entry_seq, entry_id, recorded_at, entity_kind, subject_id, actor, field, old_value, new_value";

/// Append-only field-change history. There is no update or delete API, and
/// the table triggers reject both.
pub struct AuditLedger<'a> {
    backend: &'a SqliteBackend,
}

impl<'a> AuditLedger<'a> {
    pub(crate) fn new(backend: &'a SqliteBackend) -> Self {
        Self { backend }
    }

    /// Appends `entries` in one transaction; either all are stored or none.
    pub fn append(&self, entries: &[AuditEntryInput]) -> Result<Vec<AuditEntry>, InventoryError> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        for entry in entries {
            entry.validate()?;
        }

        let stored = self.backend.run("audit.append", |conn| {
            let tx = conn.unchecked_transaction()?;
            let mut stored = Vec::with_capacity(entries.len());
            for entry in entries {
                stored.push(insert_entry(&tx, entry)?);
            }
            tx.commit()?;
            Ok(stored)
        })?;

        info!(count = stored.len(), "appended audit entries");
        Ok(stored)
    }

    /// Entries for one subject in insertion order.
    pub fn entries_for(
        &self,
        kind: EntityKind,
        subject_id: i64,
    ) -> Result<Vec<AuditEntry>, InventoryError> {
        self.backend.run("audit.entries_for", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {AUDIT_COLUMNS} FROM audit_log
                 WHERE entity_kind = ?1 AND subject_id = ?2
                 ORDER BY entry_seq ASC"
            ))?;
            let rows = stmt.query_map(params![kind.as_str(), subject_id], parse_entry_row)?;
            Ok(collect_rows(rows)?)
        })
    }

    /// The newest `limit` entries, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<AuditEntry>, InventoryError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.backend.run("audit.recent", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {AUDIT_COLUMNS} FROM audit_log ORDER BY entry_seq DESC LIMIT ?1"
            ))?;
            let rows = stmt.query_map(params![limit], parse_entry_row)?;
            Ok(collect_rows(rows)?)
        })
    }
}

/// Inserts one entry on an open connection or transaction.
pub(crate) fn insert_entry(
    conn: &Connection,
    input: &AuditEntryInput,
) -> Result<AuditEntry, StepError> {
    let entry_id = Ulid::new();
    let recorded_at = now_utc();

    conn.execute(
        "INSERT INTO audit_log(entry_id, recorded_at, entity_kind, subject_id, actor, field, old_value, new_value)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            entry_id.to_string(),
            format_rfc3339(recorded_at)?,
            input.entity_kind.as_str(),
            input.subject_id,
            input.actor.trim(),
            input.field,
            input.old_value,
            input.new_value,
        ],
    )?;

    Ok(AuditEntry {
        entry_seq: conn.last_insert_rowid(),
        entry_id,
        recorded_at,
        entity_kind: input.entity_kind,
        subject_id: input.subject_id,
        actor: input.actor.trim().to_string(),
        field: input.field.clone(),
        old_value: input.old_value.clone(),
        new_value: input.new_value.clone(),
    })
}

fn parse_entry_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEntry> {
    let entry_id_raw: String = row.get(1)?;
    let kind_raw: String = row.get(3)?;

    let entry_id = Ulid::from_string(&entry_id_raw).map_err(|err| {
        conversion_error(1, Type::Text, format!("invalid entry_id {entry_id_raw}: {err}"))
    })?;
    let entity_kind = EntityKind::parse(&kind_raw).ok_or_else(|| {
        conversion_error(3, Type::Text, format!("invalid entity_kind: {kind_raw}"))
    })?;

    Ok(AuditEntry {
        entry_seq: row.get(0)?,
        entry_id,
        recorded_at: read_timestamp(row, 2)?,
        entity_kind,
        subject_id: row.get(4)?,
        actor: row.get(5)?,
        field: row.get(6)?,
        old_value: row.get(7)?,
        new_value: row.get(8)?,
    })
}
