use std::collections::BTreeMap;

use inventory_tags_core::{format_date, EntityKind, InventoryError, Tag, TagId, TagPatch, TagStatus};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::{
    collect_rows, now_text, optional_text, parse_tag_row, SqliteBackend, StepError, TAG_COLUMNS,
};

/// Live tag rows: range reads, batch upsert, reset and aggregates.
pub struct TagStore<'a> {
    backend: &'a SqliteBackend,
}

impl<'a> TagStore<'a> {
    pub(crate) fn new(backend: &'a SqliteBackend) -> Self {
        Self { backend }
    }

    /// Tags with `low <= id <= high` in ascending id order. An inverted range
    /// yields an empty list.
    pub fn get_by_range(&self, low: TagId, high: TagId) -> Result<Vec<Tag>, InventoryError> {
        if low > high {
            debug!(low, high, "inverted tag range, nothing to read");
            return Ok(Vec::new());
        }

        self.backend.run("tags.get_by_range", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TAG_COLUMNS} FROM tags WHERE id BETWEEN ?1 AND ?2 ORDER BY id ASC"
            ))?;
            let rows = stmt.query_map(params![low, high], parse_tag_row)?;
            Ok(collect_rows(rows)?)
        })
    }

    pub fn get(&self, id: TagId) -> Result<Option<Tag>, InventoryError> {
        self.backend
            .run("tags.get", |conn| Ok(select_tag(conn, id)?))
    }

    pub fn require(&self, id: TagId) -> Result<Tag, InventoryError> {
        self.get(id)?.ok_or(InventoryError::NotFound {
            kind: EntityKind::Tag,
            id,
        })
    }

    /// Writes every present field of each patch, creating rows for unknown
    /// ids. All patches commit in one transaction. Returns the number of
    /// patches written.
    pub fn upsert(&self, patches: &[TagPatch]) -> Result<usize, InventoryError> {
        if patches.is_empty() {
            return Ok(0);
        }
        for patch in patches {
            patch.validate()?;
        }

        let written = self.backend.run("tags.upsert", |conn| {
            let tx = conn.unchecked_transaction()?;
            let now = now_text()?;
            for patch in patches {
                tx.execute(
                    "INSERT INTO tags(id, updated_at) VALUES (?1, ?2) ON CONFLICT(id) DO NOTHING",
                    params![patch.id, now],
                )?;
                update_tag_fields(&tx, patch, &now)?;
            }
            tx.commit()?;
            Ok(patches.len())
        })?;

        info!(count = written, "upserted tags");
        Ok(written)
    }

    /// Returns tags to the empty state so their ids can be reused. All ids
    /// are reset in one transaction; a missing id resets none of them.
    pub fn reset(&self, ids: &[TagId]) -> Result<(), InventoryError> {
        self.backend.run("tags.reset", |conn| {
            let tx = conn.unchecked_transaction()?;
            for &id in ids {
                if reset_tag(&tx, id)? == 0 {
                    return Err(StepError::Domain(InventoryError::NotFound {
                        kind: EntityKind::Tag,
                        id,
                    }));
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Tag count per decoded status. Rows carrying an unrecognized label are
    /// skipped with a warning.
    pub fn count_by_status(&self) -> Result<BTreeMap<TagStatus, usize>, InventoryError> {
        let grouped = self.backend.run("tags.count_by_status", |conn| {
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tags GROUP BY status")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, Option<String>>(0)?, row.get::<_, i64>(1)?))
            })?;
            Ok(collect_rows(rows)?)
        })?;

        let mut tallies = BTreeMap::new();
        for (label, count) in grouped {
            let count = usize::try_from(count).unwrap_or(0);
            match TagStatus::from_label(label.as_deref()) {
                Some(status) => *tallies.entry(status).or_insert(0) += count,
                None => warn!(label = ?label, count, "skipping tags with unrecognized status"),
            }
        }
        Ok(tallies)
    }

    pub fn distinct_calibers(&self) -> Result<Vec<String>, InventoryError> {
        self.backend.run("tags.distinct_calibers", |conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT trim(caliber) FROM tags
                 WHERE caliber IS NOT NULL AND trim(caliber) <> ''
                 ORDER BY 1 ASC",
            )?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            Ok(collect_rows(rows)?)
        })
    }
}

pub(crate) fn select_tag(conn: &Connection, id: TagId) -> rusqlite::Result<Option<Tag>> {
    conn.query_row(
        &format!("SELECT {TAG_COLUMNS} FROM tags WHERE id = ?1"),
        params![id],
        parse_tag_row,
    )
    .optional()
}

pub(crate) fn reset_tag(conn: &Connection, id: TagId) -> Result<usize, StepError> {
    let now = now_text()?;
    Ok(conn.execute(
        "UPDATE tags SET
            caliber = NULL,
            weight = '0',
            client = NULL,
            supplier = NULL,
            expiry = NULL,
            status = ?2,
            reference_number = NULL,
            updated_at = ?3
         WHERE id = ?1",
        params![id, TagStatus::Free.as_str(), now],
    )?)
}

fn tag_assignments(patch: &TagPatch) -> Vec<(&'static str, SqlValue)> {
    fn text(value: &str) -> SqlValue {
        optional_text(value).map_or(SqlValue::Null, SqlValue::Text)
    }

    let mut assignments = Vec::new();
    if let Some(caliber) = &patch.caliber {
        assignments.push(("caliber", text(caliber)));
    }
    if let Some(weight) = patch.weight {
        assignments.push(("weight", SqlValue::Text(weight.to_string())));
    }
    if let Some(client) = &patch.client {
        assignments.push(("client", text(client)));
    }
    if let Some(supplier) = &patch.supplier {
        assignments.push(("supplier", text(supplier)));
    }
    if let Some(expiry) = patch.expiry {
        let value = expiry.map_or(SqlValue::Null, |date| SqlValue::Text(format_date(date)));
        assignments.push(("expiry", value));
    }
    if let Some(status) = patch.status {
        assignments.push(("status", SqlValue::Text(status.as_str().to_string())));
    }
    if let Some(reference_number) = &patch.reference_number {
        assignments.push(("reference_number", text(reference_number)));
    }
    assignments
}

/// Issues a single UPDATE for the present fields of `patch`. Returns the
/// number of rows touched (0 when the id does not exist or nothing is set).
pub(crate) fn update_tag_fields(
    conn: &Connection,
    patch: &TagPatch,
    now: &str,
) -> rusqlite::Result<usize> {
    let assignments = tag_assignments(patch);
    if assignments.is_empty() {
        return Ok(0);
    }

    let set_clause = assignments
        .iter()
        .enumerate()
        .map(|(idx, (column, _))| format!("{column} = ?{}", idx + 1))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "UPDATE tags SET {set_clause}, updated_at = ?{} WHERE id = ?{}",
        assignments.len() + 1,
        assignments.len() + 2
    );

    let mut values: Vec<SqlValue> = assignments.into_iter().map(|(_, value)| value).collect();
    values.push(SqlValue::Text(now.to_string()));
    values.push(SqlValue::Integer(patch.id));
    conn.execute(&sql, params_from_iter(values))
}

#[cfg(test)]
mod tests {
    use crate::test_support::*;
    use inventory_tags_core::{InventoryError, TagPatch, TagStatus};

    #[test]
    fn range_read_is_inclusive_and_ordered() {
        let backend = fixture_backend();
        for id in [12, 10, 11, 14] {
            seed_open_tag(&backend, id, kg(5, 0));
        }

        let ids: Vec<i64> = must(backend.tags().get_by_range(10, 12))
            .into_iter()
            .map(|tag| tag.id)
            .collect();
        assert_eq!(ids, vec![10, 11, 12]);
        assert!(must(backend.tags().get_by_range(12, 10)).is_empty());
    }

    #[test]
    fn upsert_creates_then_updates_only_present_fields() {
        let backend = fixture_backend();
        let mut create = TagPatch::new(7);
        create.weight = Some(kg(80, 1));
        create.client = Some("  Peixaria ".to_string());
        assert_eq!(must(backend.tags().upsert(&[create])), 1);

        let mut update = TagPatch::new(7);
        update.caliber = Some("16/18".to_string());
        must(backend.tags().upsert(&[update]));

        let tag = must(backend.tags().require(7));
        assert_eq!(tag.weight, kg(80, 1));
        assert_eq!(tag.client.as_deref(), Some("Peixaria"));
        assert_eq!(tag.caliber.as_deref(), Some("16/18"));
        assert_eq!(tag.status, TagStatus::Free);
        assert_eq!(must(backend.tags().upsert(&[])), 0);
    }

    #[test]
    fn upsert_rejects_invalid_batch_without_writing() {
        let backend = fixture_backend();
        let mut good = TagPatch::new(1);
        good.weight = Some(kg(1, 0));
        let mut bad = TagPatch::new(2);
        bad.weight = Some(kg(-1, 0));

        assert!(matches!(
            backend.tags().upsert(&[good, bad]),
            Err(InventoryError::Validation(_))
        ));
        assert!(must(backend.tags().get(1)).is_none());
    }

    #[test]
    fn reset_clears_fields_and_reports_missing_ids() {
        let backend = fixture_backend();
        seed_open_tag(&backend, 3, kg(10, 0));
        seed_open_tag(&backend, 4, kg(2, 0));
        must(backend.tags().reset(&[3]));

        let tag = must(backend.tags().require(3));
        assert!(tag.is_empty_slot());
        assert_eq!(tag.caliber, None);
        assert_eq!(tag.client, None);

        assert!(matches!(
            backend.tags().reset(&[4, 99]),
            Err(InventoryError::NotFound { id: 99, .. })
        ));
        assert!(!must(backend.tags().require(4)).is_empty_slot());
    }

    #[test]
    fn status_counts_merge_legacy_and_canonical_labels() {
        let backend = fixture_backend();
        seed_open_tag(&backend, 1, kg(1, 0));
        must(backend.connection().execute_batch(
            "INSERT INTO tags(id, weight, status, updated_at) VALUES (2, '0', 'Livre', '2026-01-01T00:00:00Z');
             INSERT INTO tags(id, weight, status, updated_at) VALUES (3, '0', NULL, '2026-01-01T00:00:00Z');
             INSERT INTO tags(id, weight, status, updated_at) VALUES (4, '0', 'free', '2026-01-01T00:00:00Z');
             INSERT INTO tags(id, weight, status, updated_at) VALUES (5, '0', 'Aberto', '2026-01-01T00:00:00Z');",
        ));

        let tallies = must(backend.tags().count_by_status());
        assert_eq!(tallies.get(&TagStatus::Free), Some(&3));
        assert_eq!(tallies.get(&TagStatus::Open), Some(&2));
    }

    #[test]
    fn calibers_are_distinct_trimmed_and_sorted() {
        let backend = fixture_backend();
        for (id, caliber) in [(1, "16/18"), (2, " 12/14"), (3, "16/18"), (4, "")] {
            let mut patch = TagPatch::new(id);
            patch.caliber = Some(caliber.to_string());
            must(backend.tags().upsert(&[patch]));
        }
        assert_eq!(
            must(backend.tags().distinct_calibers()),
            vec!["12/14".to_string(), "16/18".to_string()]
        );
    }
}
