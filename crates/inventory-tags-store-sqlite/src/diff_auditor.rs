use inventory_tags_core::{
    diff_order, diff_tag, Actor, AuditEntry, AuditEntryInput, EntityKind, EntityPatch,
    FieldChange, InventoryError, OrderPatch, TagPatch,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::order_store::{select_order, update_order_fields};
use crate::subtag_ledger::select_consumption;
use crate::tag_store::{select_tag, update_tag_fields};
use crate::{now_text, SqliteBackend, StepError};

/// What a diff write did: the changed fields and their audit entries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffOutcome {
    pub kind: EntityKind,
    pub subject_id: i64,
    pub changes: Vec<FieldChange>,
    pub entries: Vec<AuditEntry>,
    pub dropped_write_once: bool,
}

impl DiffOutcome {
    #[must_use]
    pub fn applied_fields(&self) -> usize {
        self.changes.len()
    }

    #[must_use]
    pub fn changed(&self, field: &str) -> bool {
        self.changes.iter().any(|change| change.field == field)
    }
}

enum Staged {
    Tag(TagPatch),
    Order(OrderPatch),
}

/// Minimal writes: compares candidates with the stored row, updates only the
/// fields that differ, then logs one audit entry per changed field.
pub struct DiffAuditor<'a> {
    backend: &'a SqliteBackend,
}

impl<'a> DiffAuditor<'a> {
    pub(crate) fn new(backend: &'a SqliteBackend) -> Self {
        Self { backend }
    }

    /// Applies one patch. The row write and the audit batch are two
    /// sequential commits; a storage failure on the audit batch reports one
    /// completed step.
    pub fn apply_patch(
        &self,
        patch: &EntityPatch,
        actor: &Actor,
    ) -> Result<DiffOutcome, InventoryError> {
        let actor_name = actor.name.trim();
        if actor_name.is_empty() {
            return Err(InventoryError::Validation(
                "actor MUST be provided for every write".to_string(),
            ));
        }
        if let EntityPatch::Tag(tag_patch) = patch {
            tag_patch.validate()?;
        }

        let kind = patch.kind();
        let subject_id = patch.id();

        let (staged, changes, dropped_write_once) = self.stage(patch)?;
        if dropped_write_once {
            warn!(
                kind = %kind,
                subject_id,
                actor = actor_name,
                "ignored change to write-once reference number"
            );
        }
        if changes.is_empty() {
            debug!(kind = %kind, subject_id, "no field differs, nothing to write");
            return Ok(DiffOutcome {
                kind,
                subject_id,
                changes,
                entries: Vec::new(),
                dropped_write_once,
            });
        }

        self.backend.run("diff.write", |conn| {
            let tx = conn.unchecked_transaction()?;
            let now = now_text()?;
            let touched = match &staged {
                Staged::Tag(staged) => update_tag_fields(&tx, staged, &now)?,
                Staged::Order(staged) => update_order_fields(&tx, staged, &now)?,
            };
            if touched == 0 {
                return Err(StepError::Domain(InventoryError::NotFound {
                    kind,
                    id: subject_id,
                }));
            }
            tx.commit()?;
            Ok(())
        })?;

        let inputs: Vec<AuditEntryInput> = changes
            .iter()
            .map(|change| AuditEntryInput::from_change(kind, subject_id, actor_name, change))
            .collect();
        let entries = self
            .backend
            .audit()
            .append(&inputs)
            .map_err(|err| err.after_steps(1))?;

        let fields: Vec<&str> = changes.iter().map(|change| change.field.as_str()).collect();
        info!(
            kind = %kind,
            subject_id,
            actor = actor_name,
            fields = ?fields,
            "applied diff"
        );

        Ok(DiffOutcome {
            kind,
            subject_id,
            changes,
            entries,
            dropped_write_once,
        })
    }

    fn stage(
        &self,
        patch: &EntityPatch,
    ) -> Result<(Staged, Vec<FieldChange>, bool), InventoryError> {
        match patch {
            EntityPatch::Tag(candidate) => {
                let (current, used_weight) = self.backend.run("diff.read_tag", |conn| {
                    let current = select_tag(conn, candidate.id)?.ok_or(
                        InventoryError::NotFound {
                            kind: EntityKind::Tag,
                            id: candidate.id,
                        },
                    )?;
                    let used = if candidate.weight.is_some() {
                        select_consumption(conn, candidate.id)?.used_weight
                    } else {
                        Decimal::ZERO
                    };
                    Ok((current, used))
                })?;

                let diff = diff_tag(&current, candidate);
                if let Some(weight) = diff.staged.weight {
                    let tolerance = self.backend.config().weight_tolerance;
                    if weight + tolerance < used_weight {
                        return Err(InventoryError::Conservation {
                            tag_id: current.id,
                            requested: used_weight,
                            saldo: weight,
                        });
                    }
                }
                Ok((Staged::Tag(diff.staged), diff.changes, diff.dropped_write_once))
            }
            EntityPatch::Order(candidate) => {
                let current = self.backend.run("diff.read_order", |conn| {
                    select_order(conn, candidate.id)?.ok_or_else(|| {
                        StepError::Domain(InventoryError::NotFound {
                            kind: EntityKind::Order,
                            id: candidate.id,
                        })
                    })
                })?;
                let diff = diff_order(&current, candidate);
                Ok((Staged::Order(diff.staged), diff.changes, diff.dropped_write_once))
            }
        }
    }
}
