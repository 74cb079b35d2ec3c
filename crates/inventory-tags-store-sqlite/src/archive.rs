use inventory_tags_core::{
    Actor, ArchiveFailure, ArchiveRecord, ArchiveReport, AuditEntryInput, EntityKind,
    InventoryError, TagId, ARCHIVE_RESET_FIELD,
};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{info, warn};

use crate::audit_log::insert_entry;
use crate::subtag_ledger::parse_subtag_row;
use crate::tag_store::reset_tag;
use crate::{collect_rows, now_text, parse_tag_columns, read_timestamp, SqliteBackend, StepError};

/// Moves terminal tags into immutable history and frees their ids.
///
/// Each tag goes through five steps, each committed before the next:
/// snapshot the tag, snapshot its subtags, delete the live subtags, reset the
/// tag, log `ARCHIVE_RESET`. A failing step stops that tag only; the
/// remaining ids are still attempted.
///
/// Progress of an unfinished archive is kept in `pending_archives`, so
/// archiving the same id again resumes after the last committed step instead
/// of taking a second snapshot.
pub struct ArchiveManager<'a> {
    backend: &'a SqliteBackend,
}

impl<'a> ArchiveManager<'a> {
    pub(crate) fn new(backend: &'a SqliteBackend) -> Self {
        Self { backend }
    }

    pub fn archive(&self, ids: &[TagId], actor: &Actor) -> Result<ArchiveReport, InventoryError> {
        let actor_name = actor.name.trim();
        if actor_name.is_empty() {
            return Err(InventoryError::Validation(
                "actor MUST be provided for every write".to_string(),
            ));
        }

        let mut report = ArchiveReport::default();
        let mut seen = Vec::with_capacity(ids.len());
        for &id in ids {
            if seen.contains(&id) {
                continue;
            }
            seen.push(id);

            match self.archive_one(id, actor_name) {
                Ok(archive_seq) => {
                    info!(tag_id = id, archive_seq, actor = actor_name, "archived tag");
                    report.archived.push(id);
                }
                Err(failure) => {
                    warn!(
                        tag_id = id,
                        completed_steps = failure.completed_steps,
                        reason = %failure.reason,
                        "archive step failed"
                    );
                    report.failures.push(failure);
                }
            }
        }

        if report.is_complete() {
            Ok(report)
        } else {
            Err(InventoryError::PartialArchiveFailure(report))
        }
    }

    fn archive_one(&self, id: TagId, actor: &str) -> Result<i64, ArchiveFailure> {
        let failed = |completed_steps: usize, err: InventoryError| ArchiveFailure {
            tag_id: id,
            completed_steps,
            reason: err.to_string(),
        };

        let pending = self
            .backend
            .run("archive.pending", |conn| select_pending(conn, id))
            .map_err(|err| failed(0, err))?;

        let (archive_seq, done) = match pending {
            Some((archive_seq, done)) => {
                info!(tag_id = id, archive_seq, completed_steps = done, "resuming archive");
                (archive_seq, done)
            }
            None => {
                let archive_seq = self
                    .backend
                    .run("archive.snapshot_tag", |conn| snapshot_tag(conn, id, actor))
                    .map_err(|err| failed(0, err))?;
                (archive_seq, 1)
            }
        };

        if done < 2 {
            self.backend
                .run("archive.snapshot_subtags", |conn| {
                    let tx = conn.unchecked_transaction()?;
                    tx.execute(
                        "INSERT OR IGNORE INTO archived_subtags(
                            archive_seq, tag_id, letter, client, weight, status, created_at, created_by
                         )
                         SELECT ?1, tag_id, upper(trim(letter)), client, weight, status, created_at, created_by
                         FROM subtags WHERE tag_id = ?2",
                        params![archive_seq, id],
                    )?;
                    advance(&tx, id, 2)?;
                    tx.commit()?;
                    Ok(())
                })
                .map_err(|err| failed(1, err))?;
        }

        if done < 3 {
            self.backend
                .run("archive.delete_subtags", |conn| {
                    let tx = conn.unchecked_transaction()?;
                    tx.execute("DELETE FROM subtags WHERE tag_id = ?1", params![id])?;
                    advance(&tx, id, 3)?;
                    tx.commit()?;
                    Ok(())
                })
                .map_err(|err| failed(2, err))?;
        }

        if done < 4 {
            self.backend
                .run("archive.reset_tag", |conn| {
                    let tx = conn.unchecked_transaction()?;
                    reset_tag(&tx, id)?;
                    advance(&tx, id, 4)?;
                    tx.commit()?;
                    Ok(())
                })
                .map_err(|err| failed(3, err))?;
        }

        self.backend
            .run("archive.log", |conn| {
                let tx = conn.unchecked_transaction()?;
                insert_entry(
                    &tx,
                    &AuditEntryInput {
                        entity_kind: EntityKind::Tag,
                        subject_id: id,
                        actor: actor.to_string(),
                        field: ARCHIVE_RESET_FIELD.to_string(),
                        old_value: format!("TAG-{id}"),
                        new_value: "reset".to_string(),
                    },
                )?;
                tx.execute("DELETE FROM pending_archives WHERE tag_id = ?1", params![id])?;
                tx.commit()?;
                Ok(())
            })
            .map_err(|err| failed(4, err))?;

        Ok(archive_seq)
    }

    /// Archive records for tag ids in `[low, high]`, by tag id then archive
    /// sequence. A reused id can have several records.
    pub fn history_range(&self, low: TagId, high: TagId) -> Result<Vec<ArchiveRecord>, InventoryError> {
        if low > high {
            return Ok(Vec::new());
        }

        self.backend.run("archive.history_range", |conn| {
            let mut stmt = conn.prepare(
                "SELECT archive_seq, archived_at, archived_by,
                        tag_id, caliber, weight, client, supplier, expiry, status, reference_number
                 FROM archived_tags
                 WHERE tag_id BETWEEN ?1 AND ?2
                 ORDER BY tag_id ASC, archive_seq ASC",
            )?;
            let rows = stmt.query_map(params![low, high], |row| {
                Ok(ArchiveRecord {
                    archive_seq: row.get(0)?,
                    archived_at: read_timestamp(row, 1)?,
                    archived_by: row.get(2)?,
                    tag: parse_tag_columns(row, 3)?,
                    subtags: Vec::new(),
                })
            })?;
            let mut records = collect_rows(rows)?;
            for record in &mut records {
                record.subtags = select_archived_subtags(conn, record.archive_seq)?;
            }
            Ok(records)
        })
    }

    pub fn archived_count(&self) -> Result<usize, InventoryError> {
        let count = self.backend.run("archive.count", |conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM archived_tags", [], |row| {
                row.get::<_, i64>(0)
            })?)
        })?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

/// Step 0: copies the live tag into history and opens its progress row.
fn snapshot_tag(conn: &Connection, id: TagId, actor: &str) -> Result<i64, StepError> {
    let tx = conn.unchecked_transaction()?;
    let now = now_text()?;
    let inserted = tx.execute(
        "INSERT INTO archived_tags(
            tag_id, caliber, weight, client, supplier, expiry, status, reference_number,
            archived_at, archived_by
         )
         SELECT id, caliber, weight, client, supplier, expiry, status, reference_number, ?2, ?3
         FROM tags WHERE id = ?1",
        params![id, now, actor],
    )?;
    if inserted == 0 {
        return Err(StepError::Domain(InventoryError::NotFound {
            kind: EntityKind::Tag,
            id,
        }));
    }
    let archive_seq = tx.last_insert_rowid();
    tx.execute(
        "INSERT INTO pending_archives(tag_id, archive_seq, completed_steps) VALUES (?1, ?2, 1)",
        params![id, archive_seq],
    )?;
    tx.commit()?;
    Ok(archive_seq)
}

fn select_pending(conn: &Connection, id: TagId) -> Result<Option<(i64, usize)>, StepError> {
    let pending = conn
        .query_row(
            "SELECT archive_seq, completed_steps FROM pending_archives WHERE tag_id = ?1",
            params![id],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        )
        .optional()?;
    Ok(pending.map(|(archive_seq, done)| (archive_seq, usize::try_from(done).unwrap_or(0))))
}

fn advance(conn: &Connection, id: TagId, completed_steps: i64) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE pending_archives SET completed_steps = ?2 WHERE tag_id = ?1",
        params![id, completed_steps],
    )
}

fn select_archived_subtags(
    conn: &Connection,
    archive_seq: i64,
) -> rusqlite::Result<Vec<inventory_tags_core::Subtag>> {
    let mut stmt = conn.prepare(
        "SELECT tag_id, letter, client, weight, status, created_at, created_by
         FROM archived_subtags WHERE archive_seq = ?1 ORDER BY letter ASC",
    )?;
    let rows = stmt.query_map(params![archive_seq], parse_subtag_row)?;
    collect_rows(rows)
}

#[cfg(test)]
mod tests {
    use crate::test_support::*;
    use inventory_tags_core::{
        EntityKind, InventoryError, SubtagInput, TagPatch, TagStatus, ARCHIVE_RESET_FIELD,
    };

    fn split_off(backend: &crate::SqliteBackend, tag_id: i64, letter: &str, units: i64) {
        must(backend.subtags().add(
            &SubtagInput {
                tag_id,
                letter: letter.to_string(),
                client: "Client X".to_string(),
                weight: kg(units, 1),
                status: TagStatus::Reserved,
            },
            &operator(),
        ));
    }

    fn mark_generated(backend: &crate::SqliteBackend, tag_id: i64) {
        let mut patch = TagPatch::new(tag_id);
        patch.status = Some(TagStatus::Generated);
        must(backend.tags().upsert(&[patch]));
    }

    #[test]
    fn archive_snapshots_then_resets_live_tag() {
        let backend = fixture_backend();
        seed_open_tag(&backend, 100, kg(100, 1));
        split_off(&backend, 100, "A", 40);
        mark_generated(&backend, 100);

        let report = must(backend.archive().archive(&[100], &operator()));
        assert_eq!(report.archived, vec![100]);

        let history = must(backend.archive().history_range(100, 100));
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].tag.weight, kg(100, 1));
        assert_eq!(history[0].tag.status, TagStatus::Generated);
        assert_eq!(history[0].subtags.len(), 1);
        assert_eq!(history[0].subtags[0].letter, "A");
        assert_eq!(history[0].archived_by, "operador");

        let live = must(backend.tags().require(100));
        assert!(live.is_empty_slot());
        assert!(must(backend.subtags().list(100)).is_empty());

        let entries = must(backend.audit().entries_for(EntityKind::Tag, 100));
        let last = &entries[entries.len() - 1];
        assert_eq!(last.field, ARCHIVE_RESET_FIELD);
        assert_eq!(last.old_value, "TAG-100");
        assert_eq!(last.new_value, "reset");
    }

    #[test]
    fn reused_id_accumulates_history_records() {
        let backend = fixture_backend();
        for round in 0..2 {
            seed_open_tag(&backend, 7, kg(10 + round, 0));
            mark_generated(&backend, 7);
            must(backend.archive().archive(&[7], &operator()));
        }

        let history = must(backend.archive().history_range(1, 10));
        assert_eq!(history.len(), 2);
        assert!(history[0].archive_seq < history[1].archive_seq);
        assert_eq!(history[1].tag.weight, kg(11, 0));
        assert_eq!(must(backend.archive().archived_count()), 2);
    }

    #[test]
    fn missing_id_fails_at_step_zero_but_others_are_archived() {
        let backend = fixture_backend();
        seed_open_tag(&backend, 1, kg(5, 0));
        seed_open_tag(&backend, 3, kg(5, 0));

        let result = backend.archive().archive(&[1, 2, 3], &operator());
        let report = match result {
            Err(InventoryError::PartialArchiveFailure(report)) => report,
            other => panic!("expected partial archive failure, got {other:?}"),
        };
        assert_eq!(report.archived, vec![1, 3]);
        assert_eq!(report.failed_ids(), vec![2]);
        assert_eq!(report.failures[0].completed_steps, 0);
        assert!(must(backend.tags().require(3)).is_empty_slot());
    }

    #[test]
    fn storage_failure_mid_archive_reports_completed_steps() {
        let backend = fixture_backend();
        seed_open_tag(&backend, 100, kg(100, 1));
        split_off(&backend, 100, "A", 40);
        must(backend.connection().execute_batch(
            "DROP TRIGGER trg_archived_subtags_no_update;
             DROP TRIGGER trg_archived_subtags_no_delete;
             DROP TABLE archived_subtags;",
        ));

        let result = backend.archive().archive(&[100], &operator());
        let report = match result {
            Err(InventoryError::PartialArchiveFailure(report)) => report,
            other => panic!("expected partial archive failure, got {other:?}"),
        };
        assert_eq!(report.failures[0].completed_steps, 1);

        let live = must(backend.tags().require(100));
        assert_eq!(live.weight, kg(100, 1));
        assert_eq!(must(backend.subtags().list(100)).len(), 1);
    }

    #[test]
    fn retry_after_subtag_snapshot_failure_reuses_the_first_snapshot() {
        let backend = fixture_backend();
        seed_open_tag(&backend, 100, kg(100, 1));
        split_off(&backend, 100, "A", 40);
        mark_generated(&backend, 100);
        must(backend.connection().execute_batch(
            "DROP TRIGGER trg_archived_subtags_no_update;
             DROP TRIGGER trg_archived_subtags_no_delete;
             DROP TABLE archived_subtags;",
        ));
        assert!(backend.archive().archive(&[100], &operator()).is_err());

        must(backend.migrate());
        let report = must(backend.archive().archive(&[100], &operator()));
        assert_eq!(report.archived, vec![100]);

        let history = must(backend.archive().history_range(100, 100));
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].tag.weight, kg(100, 1));
        assert_eq!(history[0].tag.status, TagStatus::Generated);
        assert_eq!(history[0].subtags.len(), 1);
        assert!(must(backend.tags().require(100)).is_empty_slot());
        assert!(must(backend.subtags().list(100)).is_empty());
    }

    #[test]
    fn retry_after_log_failure_does_not_snapshot_the_reset_tag() {
        let backend = fixture_backend();
        seed_open_tag(&backend, 100, kg(100, 1));
        mark_generated(&backend, 100);
        must(backend.connection().execute_batch(
            "DROP TRIGGER trg_audit_log_no_update;
             DROP TRIGGER trg_audit_log_no_delete;
             DROP TABLE audit_log;",
        ));

        let report = match backend.archive().archive(&[100], &operator()) {
            Err(InventoryError::PartialArchiveFailure(report)) => report,
            other => panic!("expected partial archive failure, got {other:?}"),
        };
        assert_eq!(report.failures[0].completed_steps, 4);
        assert!(must(backend.tags().require(100)).is_empty_slot());

        must(backend.migrate());
        must(backend.archive().archive(&[100], &operator()));

        let history = must(backend.archive().history_range(100, 100));
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].tag.weight, kg(100, 1));
        assert_eq!(history[0].tag.status, TagStatus::Generated);

        let entries = must(backend.audit().entries_for(EntityKind::Tag, 100));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].field, ARCHIVE_RESET_FIELD);

        seed_open_tag(&backend, 100, kg(7, 0));
        must(backend.archive().archive(&[100], &operator()));
        let history = must(backend.archive().history_range(100, 100));
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].tag.weight, kg(7, 0));
    }

    #[test]
    fn duplicate_ids_are_archived_once() {
        let backend = fixture_backend();
        seed_open_tag(&backend, 4, kg(5, 0));
        let report = must(backend.archive().archive(&[4, 4], &operator()));
        assert_eq!(report.archived, vec![4]);
        assert_eq!(must(backend.archive().archived_count()), 1);
    }

    #[test]
    fn archive_history_is_immutable() {
        let backend = fixture_backend();
        seed_open_tag(&backend, 4, kg(5, 0));
        must(backend.archive().archive(&[4], &operator()));
        assert!(backend
            .connection()
            .execute("UPDATE archived_tags SET weight = '1'", [])
            .is_err());
        assert!(backend
            .connection()
            .execute("DELETE FROM archived_tags", [])
            .is_err());
    }
}
