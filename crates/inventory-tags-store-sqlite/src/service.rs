use std::path::Path;

use anyhow::Result;
use inventory_tags_core::{
    format_weight, next_available_letter, Actor, ArchiveRecord, ArchiveReport, AuditEntry,
    AuditEntryInput, EngineConfig, EntityKind, EntityPatch, InventoryError, OrderPatch,
    SaveOutcome, StatusCounts, StatusWorkflow, Subtag, SubtagInput, Tag, TagId, TagPatch,
    TagStatus, RECEIVING_FIELD,
};
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::{DiffOutcome, ReadCache, SqliteBackend};

/// Entry point for the presentation layer. Orchestrates the components
/// strictly in sequence and keeps the aggregate cache coherent.
pub struct InventoryService {
    backend: SqliteBackend,
    cache: ReadCache,
}

impl InventoryService {
    #[must_use]
    pub fn new(backend: SqliteBackend) -> Self {
        let cache = ReadCache::new(backend.config().cache_ttl());
        Self { backend, cache }
    }

    /// Opens and migrates the database at `path`.
    pub fn open(path: &Path, config: EngineConfig) -> Result<Self> {
        let backend = SqliteBackend::open_with_config(path, config)?;
        backend.migrate()?;
        Ok(Self::new(backend))
    }

    #[must_use]
    pub fn backend(&self) -> &SqliteBackend {
        &self.backend
    }

    pub fn load_range(&self, low: TagId, high: TagId) -> Result<Vec<Tag>, InventoryError> {
        self.backend.tags().get_by_range(low, high)
    }

    pub fn tag(&self, id: TagId) -> Result<Tag, InventoryError> {
        self.backend.tags().require(id)
    }

    pub fn subtags(&self, tag_id: TagId) -> Result<Vec<Subtag>, InventoryError> {
        self.backend.subtags().list(tag_id)
    }

    pub fn saldo(&self, tag_id: TagId) -> Result<Decimal, InventoryError> {
        self.backend.subtags().saldo(tag_id)
    }

    /// Applies each patch through the diff auditor in order. A patch that
    /// moves a tag to Generated is archived right after its own write.
    ///
    /// A storage failure reports the committed steps (one per write and one
    /// per archive). A failed archive returns [`InventoryError::SaveInterrupted`]
    /// with what was saved so far.
    pub fn save_edits(
        &mut self,
        patches: &[TagPatch],
        actor: &Actor,
    ) -> Result<SaveOutcome, InventoryError> {
        StatusWorkflow::authorize_mutation(actor, "save_edits")?;
        for patch in patches {
            patch.validate()?;
        }

        let result = self.apply_tag_patches(patches, actor);
        self.cache.invalidate_all();
        result
    }

    fn apply_tag_patches(
        &self,
        patches: &[TagPatch],
        actor: &Actor,
    ) -> Result<SaveOutcome, InventoryError> {
        let mut outcome = SaveOutcome::default();
        let mut completed_steps = 0;

        for patch in patches {
            let diff = self
                .backend
                .diff_auditor()
                .apply_patch(&EntityPatch::Tag(patch.clone()), actor)
                .map_err(|err| err.after_steps(completed_steps))?;
            outcome.applied_fields += diff.applied_fields();
            completed_steps += 1;

            match self.archive_if_generated(patch, &diff, actor) {
                Ok(true) => {
                    outcome.archived.push(patch.id);
                    completed_steps += 1;
                }
                Ok(false) => {}
                Err(InventoryError::PartialArchiveFailure(report)) => {
                    return Err(InventoryError::SaveInterrupted {
                        completed_steps,
                        saved: outcome,
                        report,
                    });
                }
                Err(err) => return Err(err.after_steps(completed_steps)),
            }
        }

        info!(
            actor = %actor.name,
            patches = patches.len(),
            applied_fields = outcome.applied_fields,
            archived = outcome.archived.len(),
            "saved edits"
        );
        Ok(outcome)
    }

    /// Archives the patched tag when its write moved it to Generated.
    /// Returns whether an archive ran.
    fn archive_if_generated(
        &self,
        patch: &TagPatch,
        diff: &DiffOutcome,
        actor: &Actor,
    ) -> Result<bool, InventoryError> {
        if !(diff.changed("status") && patch.status == Some(TagStatus::Generated)) {
            return Ok(false);
        }
        self.backend.archive().archive(&[patch.id], actor)?;
        Ok(true)
    }

    /// Saves `parent_patch` and then records the subtag. A failing subtag
    /// does not undo the parent write. The parent must stay open to be
    /// fractioned, so a patch moving it to Generated is rejected before any
    /// write; Generated goes through [`Self::save_edits`].
    pub fn split(
        &mut self,
        parent_patch: &TagPatch,
        subtag: &SubtagInput,
        actor: &Actor,
    ) -> Result<Subtag, InventoryError> {
        StatusWorkflow::authorize_mutation(actor, "split")?;
        if parent_patch.id != subtag.tag_id {
            return Err(InventoryError::Validation(format!(
                "parent patch targets tag {} but subtag targets tag {}",
                parent_patch.id, subtag.tag_id
            )));
        }
        parent_patch.validate()?;
        if parent_patch.status == Some(TagStatus::Generated) {
            return Err(InventoryError::Validation(format!(
                "split cannot move tag {} to generated, the parent MUST stay open",
                parent_patch.id
            )));
        }
        subtag.normalized(self.backend.config())?;

        let result = self.split_in_sequence(parent_patch, subtag, actor);
        self.cache.invalidate_all();
        result
    }

    fn split_in_sequence(
        &self,
        parent_patch: &TagPatch,
        subtag: &SubtagInput,
        actor: &Actor,
    ) -> Result<Subtag, InventoryError> {
        let parent = self
            .backend
            .diff_auditor()
            .apply_patch(&EntityPatch::Tag(parent_patch.clone()), actor)?;

        self.backend.subtags().add(subtag, actor).map_err(|err| {
            if parent.applied_fields() > 0 {
                warn!(
                    tag_id = subtag.tag_id,
                    parent_fields = parent.applied_fields(),
                    error = %err,
                    "subtag rejected after parent patch was saved"
                );
            }
            err.after_steps(1)
        })
    }

    pub fn archive(&mut self, ids: &[TagId], actor: &Actor) -> Result<ArchiveReport, InventoryError> {
        StatusWorkflow::authorize_mutation(actor, "archive")?;
        let result = self.backend.archive().archive(ids, actor);
        self.cache.invalidate_all();
        result
    }

    /// Batch receiving into empty tag slots. One RECEIVING entry is logged
    /// per received tag.
    pub fn receive(&mut self, tags: &[Tag], actor: &Actor) -> Result<usize, InventoryError> {
        StatusWorkflow::authorize_mutation(actor, "receive")?;
        let result = self.receive_into_empty_slots(tags, actor);
        self.cache.invalidate_all();
        result
    }

    fn receive_into_empty_slots(&self, tags: &[Tag], actor: &Actor) -> Result<usize, InventoryError> {
        if tags.is_empty() {
            return Ok(0);
        }

        let patches: Vec<TagPatch> = tags.iter().map(Tag::as_full_patch).collect();
        for patch in &patches {
            patch.validate()?;
        }
        for tag in tags {
            if let Some(existing) = self.backend.tags().get(tag.id)? {
                if !existing.is_empty_slot() {
                    return Err(InventoryError::Validation(format!(
                        "tag {} is in use with status {} and cannot receive a new lot",
                        tag.id, existing.status
                    )));
                }
            }
        }

        let written = self.backend.tags().upsert(&patches)?;

        let entries: Vec<AuditEntryInput> = tags
            .iter()
            .map(|tag| AuditEntryInput {
                entity_kind: EntityKind::Tag,
                subject_id: tag.id,
                actor: actor.name.clone(),
                field: RECEIVING_FIELD.to_string(),
                old_value: String::new(),
                new_value: format!(
                    "{} {}kg",
                    tag.caliber.as_deref().unwrap_or("-"),
                    format_weight(tag.weight)
                ),
            })
            .collect();
        self.backend
            .audit()
            .append(&entries)
            .map_err(|err| err.after_steps(1))?;

        info!(actor = %actor.name, count = written, "received tags");
        Ok(written)
    }

    /// Applies order patches; returns the number of fields changed.
    pub fn save_order_edits(
        &mut self,
        patches: &[OrderPatch],
        actor: &Actor,
    ) -> Result<usize, InventoryError> {
        StatusWorkflow::authorize_mutation(actor, "save_order_edits")?;

        let mut applied_fields = 0;
        for (completed_steps, patch) in patches.iter().enumerate() {
            let outcome = self
                .backend
                .diff_auditor()
                .apply_patch(&EntityPatch::Order(patch.clone()), actor)
                .map_err(|err| err.after_steps(completed_steps))?;
            applied_fields += outcome.applied_fields();
        }
        Ok(applied_fields)
    }

    /// The next unused letter for `tag_id`, or `??` when A-Z are taken.
    pub fn suggest_letter(&self, tag_id: TagId) -> Result<String, InventoryError> {
        self.backend.tags().require(tag_id)?;
        let consumption = self.backend.subtags().consumed(tag_id)?;
        Ok(next_available_letter(&consumption.used_letters))
    }

    pub fn global_counts(&mut self) -> Result<StatusCounts, InventoryError> {
        let backend = &self.backend;
        self.cache.counts_or_load(|| {
            let tallies = backend.tags().count_by_status()?;
            let archived = backend.archive().archived_count()?;
            Ok(StatusCounts::from_tallies(&tallies, archived))
        })
    }

    pub fn caliber_options(&mut self) -> Result<Vec<String>, InventoryError> {
        let backend = &self.backend;
        self.cache
            .calibers_or_load(|| backend.tags().distinct_calibers())
    }

    pub fn audit_trail(&self, kind: EntityKind, id: i64) -> Result<Vec<AuditEntry>, InventoryError> {
        self.backend.audit().entries_for(kind, id)
    }

    pub fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEntry>, InventoryError> {
        self.backend.audit().recent(limit)
    }

    pub fn history_range(
        &self,
        low: TagId,
        high: TagId,
    ) -> Result<Vec<ArchiveRecord>, InventoryError> {
        self.backend.archive().history_range(low, high)
    }
}
