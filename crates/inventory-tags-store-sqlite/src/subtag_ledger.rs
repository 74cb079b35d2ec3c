use inventory_tags_core::{
    check_conservation, format_rfc3339, format_weight, now_utc, Actor, AuditEntryInput,
    Consumption, EntityKind, InventoryError, StatusWorkflow, Subtag, SubtagInput, TagId,
    FRACTIONING_FIELD,
};
use rusqlite::{params, Connection, TransactionBehavior};
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::audit_log::insert_entry;
use crate::tag_store::select_tag;
use crate::{
    collect_rows, is_constraint_violation, read_status, read_timestamp, read_weight,
    SqliteBackend, StepError,
};

/// Fractions of a tag and the weight they consume.
pub struct SubtagLedger<'a> {
    backend: &'a SqliteBackend,
}

impl<'a> SubtagLedger<'a> {
    pub(crate) fn new(backend: &'a SqliteBackend) -> Self {
        Self { backend }
    }

    /// Letters and weight already committed to `tag_id`.
    pub fn consumed(&self, tag_id: TagId) -> Result<Consumption, InventoryError> {
        self.backend
            .run("subtags.consumed", |conn| Ok(select_consumption(conn, tag_id)?))
    }

    pub fn list(&self, tag_id: TagId) -> Result<Vec<Subtag>, InventoryError> {
        self.backend
            .run("subtags.list", |conn| Ok(select_subtags(conn, tag_id)?))
    }

    /// Uncommitted weight of `tag_id`, floored at zero.
    pub fn saldo(&self, tag_id: TagId) -> Result<Decimal, InventoryError> {
        self.backend.run("subtags.saldo", |conn| {
            let tag = select_tag(conn, tag_id)?.ok_or(InventoryError::NotFound {
                kind: EntityKind::Tag,
                id: tag_id,
            })?;
            Ok(select_consumption(conn, tag_id)?.saldo(tag.weight))
        })
    }

    /// Records one fraction of an Open tag together with its FRACTIONING audit
    /// entry. Shape checks run before any read; the parent, letter and
    /// conservation checks run inside the write transaction.
    pub fn add(&self, input: &SubtagInput, actor: &Actor) -> Result<Subtag, InventoryError> {
        let config = self.backend.config();
        let input = input.normalized(config)?;
        let actor_name = actor.name.trim().to_string();
        if actor_name.is_empty() {
            return Err(InventoryError::Validation(
                "actor MUST be provided for every write".to_string(),
            ));
        }
        let tolerance = config.weight_tolerance;

        let subtag = self.backend.run("subtags.add", |conn| {
            let tx = rusqlite::Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;

            let tag = select_tag(&tx, input.tag_id)?.ok_or(InventoryError::NotFound {
                kind: EntityKind::Tag,
                id: input.tag_id,
            })?;
            if !StatusWorkflow::allows_fractioning(tag.status) {
                return Err(StepError::Domain(InventoryError::Validation(format!(
                    "tag {} MUST be open to be fractioned, status is {}",
                    tag.id, tag.status
                ))));
            }

            let consumption = select_consumption(&tx, tag.id)?;
            if consumption.contains_letter(&input.letter) {
                return Err(StepError::Domain(InventoryError::DuplicateLetter {
                    tag_id: tag.id,
                    letter: input.letter.clone(),
                }));
            }
            check_conservation(tag.id, tag.weight, &consumption, input.weight, tolerance)?;

            let created_at = now_utc();
            let inserted = tx.execute(
                "INSERT INTO subtags(tag_id, letter, client, weight, status, created_at, created_by)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    tag.id,
                    input.letter,
                    input.client,
                    input.weight.to_string(),
                    input.status.as_str(),
                    format_rfc3339(created_at)?,
                    actor_name,
                ],
            );
            match inserted {
                Ok(_) => {}
                Err(err) if is_constraint_violation(&err) => {
                    return Err(StepError::Domain(InventoryError::DuplicateLetter {
                        tag_id: tag.id,
                        letter: input.letter.clone(),
                    }));
                }
                Err(err) => return Err(err.into()),
            }

            insert_entry(
                &tx,
                &AuditEntryInput {
                    entity_kind: EntityKind::Tag,
                    subject_id: tag.id,
                    actor: actor_name.clone(),
                    field: FRACTIONING_FIELD.to_string(),
                    old_value: format!("TAG-{}", tag.id),
                    new_value: format!("{}: {}kg", input.letter, format_weight(input.weight)),
                },
            )?;
            tx.commit()?;

            Ok(Subtag {
                tag_id: tag.id,
                letter: input.letter.clone(),
                client: input.client.clone(),
                weight: input.weight,
                status: input.status,
                created_at,
                created_by: actor_name.clone(),
            })
        })?;

        info!(
            tag_id = subtag.tag_id,
            letter = %subtag.letter,
            weight = %subtag.weight,
            actor = %subtag.created_by,
            "recorded subtag"
        );
        Ok(subtag)
    }
}

pub(crate) fn select_consumption(conn: &Connection, tag_id: TagId) -> rusqlite::Result<Consumption> {
    let mut stmt = conn.prepare("SELECT letter, weight FROM subtags WHERE tag_id = ?1")?;
    let rows = stmt.query_map(params![tag_id], |row| {
        Ok((row.get::<_, String>(0)?, read_weight(row, 1)?))
    })?;

    let mut consumption = Consumption::default();
    for row in rows {
        let (letter, weight) = row?;
        consumption.used_letters.insert(letter.trim().to_ascii_uppercase());
        consumption.used_weight += weight;
    }
    debug!(
        tag_id,
        letters = consumption.used_letters.len(),
        used_weight = %consumption.used_weight,
        "read tag consumption"
    );
    Ok(consumption)
}

pub(crate) fn select_subtags(conn: &Connection, tag_id: TagId) -> rusqlite::Result<Vec<Subtag>> {
    let mut stmt = conn.prepare(
        "SELECT tag_id, letter, client, weight, status, created_at, created_by
         FROM subtags WHERE tag_id = ?1 ORDER BY letter ASC",
    )?;
    let rows = stmt.query_map(params![tag_id], parse_subtag_row)?;
    collect_rows(rows)
}

pub(crate) fn parse_subtag_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Subtag> {
    let letter: String = row.get(1)?;
    Ok(Subtag {
        tag_id: row.get(0)?,
        letter: letter.trim().to_ascii_uppercase(),
        client: row.get(2)?,
        weight: read_weight(row, 3)?,
        status: read_status(row, 4)?,
        created_at: read_timestamp(row, 5)?,
        created_by: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use crate::test_support::*;
    use inventory_tags_core::{
        Actor, EntityKind, InventoryError, SubtagInput, TagPatch, TagStatus, FRACTIONING_FIELD,
    };
    use proptest::prelude::*;
    use rust_decimal::Decimal;

    fn input(tag_id: i64, letter: &str, weight: Decimal) -> SubtagInput {
        SubtagInput {
            tag_id,
            letter: letter.to_string(),
            client: "Client X".to_string(),
            weight,
            status: TagStatus::Reserved,
        }
    }

    #[test]
    fn fractioning_consumes_weight_and_logs_entry() {
        let backend = fixture_backend();
        seed_open_tag(&backend, 100, kg(100, 1));

        let subtag = must(backend.subtags().add(&input(100, "a", kg(40, 1)), &operator()));
        assert_eq!(subtag.letter, "A");

        let consumption = must(backend.subtags().consumed(100));
        assert!(consumption.used_letters.contains("A"));
        assert_eq!(consumption.used_weight, kg(40, 1));
        assert_eq!(must(backend.subtags().saldo(100)), kg(60, 1));

        let entries = must(backend.audit().entries_for(EntityKind::Tag, 100));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].field, FRACTIONING_FIELD);
        assert_eq!(entries[0].old_value, "TAG-100");
        assert_eq!(entries[0].new_value, "A: 4kg");
    }

    #[test]
    fn over_saldo_request_is_rejected_without_writes() {
        let backend = fixture_backend();
        seed_open_tag(&backend, 100, kg(100, 1));
        must(backend.subtags().add(&input(100, "A", kg(40, 1)), &operator()));

        let result = backend.subtags().add(&input(100, "B", kg(65, 1)), &operator());
        assert_eq!(
            result,
            Err(InventoryError::Conservation {
                tag_id: 100,
                requested: kg(65, 1),
                saldo: kg(60, 1),
            })
        );
        assert_eq!(must(backend.subtags().list(100)).len(), 1);
        assert_eq!(must(backend.audit().entries_for(EntityKind::Tag, 100)).len(), 1);
    }

    #[test]
    fn exact_fill_succeeds_and_next_request_fails() {
        let backend = fixture_backend();
        seed_open_tag(&backend, 100, kg(100, 1));
        must(backend.subtags().add(&input(100, "A", kg(40, 1)), &operator()));
        must(backend.subtags().add(&input(100, "B", kg(60, 1)), &operator()));

        assert_eq!(must(backend.subtags().saldo(100)), Decimal::ZERO);
        assert!(matches!(
            backend.subtags().add(&input(100, "C", kg(1, 2)), &operator()),
            Err(InventoryError::Conservation { .. })
        ));
    }

    #[test]
    fn duplicate_letter_is_case_insensitive() {
        let backend = fixture_backend();
        seed_open_tag(&backend, 100, kg(100, 1));
        must(backend.subtags().add(&input(100, "A", kg(1, 0)), &operator()));

        assert_eq!(
            backend.subtags().add(&input(100, "a", kg(1, 0)), &operator()),
            Err(InventoryError::DuplicateLetter {
                tag_id: 100,
                letter: "A".to_string(),
            })
        );
    }

    #[test]
    fn parent_must_exist_and_be_open() {
        let backend = fixture_backend();
        assert!(matches!(
            backend.subtags().add(&input(5, "A", kg(1, 0)), &operator()),
            Err(InventoryError::NotFound { id: 5, .. })
        ));

        let mut reserved = TagPatch::new(6);
        reserved.weight = Some(kg(10, 0));
        reserved.status = Some(TagStatus::Reserved);
        must(backend.tags().upsert(&[reserved]));
        assert!(matches!(
            backend.subtags().add(&input(6, "A", kg(1, 0)), &operator()),
            Err(InventoryError::Validation(_))
        ));
    }

    #[test]
    fn shape_errors_are_reported_before_parent_lookup() {
        let backend = fixture_backend();
        assert!(matches!(
            backend.subtags().add(&input(5, "AB", kg(1, 0)), &operator()),
            Err(InventoryError::Validation(_))
        ));
        assert!(matches!(
            backend.subtags().add(&input(5, "A", kg(1, 0)), &Actor::operator("")),
            Err(InventoryError::Validation(_))
        ));
    }

    #[test]
    fn list_is_ordered_by_letter() {
        let backend = fixture_backend();
        seed_open_tag(&backend, 1, kg(10, 0));
        for letter in ["C", "A", "B"] {
            must(backend.subtags().add(&input(1, letter, kg(1, 0)), &operator()));
        }
        let letters: Vec<String> = must(backend.subtags().list(1))
            .into_iter()
            .map(|subtag| subtag.letter)
            .collect();
        assert_eq!(letters, vec!["A", "B", "C"]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_committed_weight_never_exceeds_tag_weight(requests in prop::collection::vec(1i64..4_000, 1..26)) {
            let backend = fixture_backend();
            let tag_weight = kg(10_000, 3);
            seed_open_tag(&backend, 1, tag_weight);

            for (offset, grams) in requests.into_iter().enumerate() {
                let letter = char::from(b'A' + u8::try_from(offset).unwrap_or(0)).to_string();
                let _ = backend.subtags().add(&input(1, &letter, kg(grams, 3)), &operator());
                let used = must(backend.subtags().consumed(1)).used_weight;
                prop_assert!(used <= tag_weight + backend.config().weight_tolerance);
            }
        }
    }
}
