//! JSON merge patch over a single record.
//!
//! A merge patch document may touch `data`, `tags` and `deleted` only.
//! Data changes produce a new version through ingestion; tag changes
//! mutate metadata in place without a version bump; `deleted` toggles
//! the soft-delete status and must be the only field in the patch.

use std::collections::BTreeMap;
use std::sync::Arc;

use record_common::{
    BlobStore, Clock, CollaborationContext, MetadataRepository, OperationType, RecordState,
};
use serde_json::Value;

use crate::audit::AuditLogger;
use crate::authorization::AuthorizationGate;
use crate::config::Config;
use crate::delete::SoftDeleteEngine;
use crate::error::{Error, Result};
use crate::ingestion::IngestionEngine;
use crate::persistence::PersistenceService;
use crate::query::record_from_parts;
use crate::validation::ensure_collaboration_enabled;

const PATCHABLE_FIELDS: [&str; 3] = ["data", "tags", "deleted"];

/// RFC 7396 merge. A null in the patch removes the key; nested objects
/// merge recursively; everything else replaces.
pub fn merge(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Default::default());
    }
    let Value::Object(target_map) = target else {
        return;
    };
    for (key, value) in patch_map {
        if value.is_null() {
            target_map.remove(key);
        } else {
            let slot = target_map.entry(key.clone()).or_insert(Value::Null);
            merge(slot, value);
        }
    }
}

pub struct MergePatchEngine {
    repository: Arc<dyn MetadataRepository>,
    blob_store: Arc<dyn BlobStore>,
    persistence: Arc<PersistenceService>,
    ingestion: Arc<IngestionEngine>,
    soft_delete: Arc<SoftDeleteEngine>,
    gate: Arc<AuthorizationGate>,
    audit: AuditLogger,
    clock: Arc<dyn Clock>,
    config: Config,
}

impl MergePatchEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repository: Arc<dyn MetadataRepository>,
        blob_store: Arc<dyn BlobStore>,
        persistence: Arc<PersistenceService>,
        ingestion: Arc<IngestionEngine>,
        soft_delete: Arc<SoftDeleteEngine>,
        gate: Arc<AuthorizationGate>,
        clock: Arc<dyn Clock>,
        config: Config,
    ) -> Self {
        Self {
            repository,
            blob_store,
            persistence,
            ingestion,
            soft_delete,
            gate,
            audit: AuditLogger::new(),
            clock,
            config,
        }
    }

    /// Applies one merge patch document to one record.
    pub async fn merge_patch_record(
        &self,
        id: &str,
        patch: &Value,
        user: &str,
        ctx: Option<&CollaborationContext>,
    ) -> Result<()> {
        ensure_collaboration_enabled(&self.config, ctx)?;
        let patch_map = match patch {
            Value::Object(map) => map,
            _ => {
                return Err(Error::bad_request(
                    "Invalid merge patch",
                    "The merge patch document must be a JSON object",
                ))
            }
        };
        for key in patch_map.keys() {
            if !PATCHABLE_FIELDS.contains(&key.as_str()) {
                return Err(Error::bad_request(
                    "Invalid merge patch",
                    format!(
                        "Merge patch cannot modify field '/{key}'. Only 'data', 'tags' and 'deleted' can be patched"
                    ),
                ));
            }
        }

        let metadata = self.repository.get(id, ctx).await?.ok_or_else(|| {
            Error::not_found("Record not found", format!("The record '{id}' was not found"))
        })?;

        if metadata.status == RecordState::Deleted {
            // the only patch a deleted record accepts is a recovery
            if patch_map.len() == 1 && patch_map.get("deleted") == Some(&Value::Bool(false)) {
                return self.recover_record(metadata, user, ctx).await;
            }
            return Err(Error::bad_request(
                "Invalid merge patch",
                format!("The record '{id}' is deleted; only {{\"deleted\": false}} is accepted"),
            ));
        }

        if let Some(deleted) = patch_map.get("deleted") {
            if patch_map.len() > 1 {
                return Err(Error::bad_request(
                    "Invalid merge patch",
                    "The 'deleted' field must be the only field in the patch",
                ));
            }
            return match deleted {
                Value::Bool(true) => self.soft_delete.delete_record(id, user, ctx).await,
                Value::Bool(false) => Ok(()),
                _ => Err(Error::bad_request(
                    "Invalid merge patch",
                    "The 'deleted' field must be a boolean",
                )),
            };
        }

        match patch_map.get("data") {
            Some(data_patch) => {
                self.merge_record_data(metadata, data_patch, patch_map.get("tags"), user, ctx)
                    .await
            }
            None => match patch_map.get("tags") {
                Some(tags_patch) => self.merge_tags(metadata, tags_patch, user, ctx).await,
                None => Ok(()),
            },
        }
    }

    /// Data merge makes a new version through the ingestion path, so
    /// access checks, hashing and notifications all apply as usual.
    async fn merge_record_data(
        &self,
        metadata: record_common::RecordMetadata,
        data_patch: &Value,
        tags_patch: Option<&Value>,
        user: &str,
        ctx: Option<&CollaborationContext>,
    ) -> Result<()> {
        let version = metadata.latest_version().ok_or_else(|| {
            Error::not_found(
                "Record not found",
                format!("The record '{}' was not found", metadata.id),
            )
        })?;
        let body = self.blob_store.read(&metadata, version, false).await?;
        let mut record = record_from_parts(&metadata, body, version);
        merge(&mut record.data, data_patch);
        if let Some(tags_patch) = tags_patch {
            record.tags = merged_tags(&record.tags, tags_patch)?;
        }
        self.ingestion
            .create_update_records(false, vec![record], user, ctx)
            .await?;
        Ok(())
    }

    /// Tag-only merge mutates metadata in place; the record version is
    /// unchanged.
    async fn merge_tags(
        &self,
        mut metadata: record_common::RecordMetadata,
        tags_patch: &Value,
        user: &str,
        ctx: Option<&CollaborationContext>,
    ) -> Result<()> {
        let allowed = self
            .gate
            .validate_owner_access(user, &metadata, OperationType::Update)
            .await?;
        if !allowed {
            return Err(Error::forbidden(
                "Access denied",
                "The user is not authorized to perform this action",
            ));
        }
        metadata.tags = merged_tags(&metadata.tags, tags_patch)?;
        metadata.modify_user = Some(user.to_string());
        metadata.modify_time = Some(self.clock.now_millis());
        let id = metadata.id.clone();
        let locked = self.persistence.update_metadata(vec![metadata], ctx).await?;
        if !locked.is_empty() {
            self.audit.update_records_fail(&locked);
            return Err(Error::locked(
                "Locked",
                format!("The record '{id}' is locked for modification"),
            ));
        }
        self.audit.update_records_success(&[id]);
        Ok(())
    }

    async fn recover_record(
        &self,
        mut metadata: record_common::RecordMetadata,
        user: &str,
        ctx: Option<&CollaborationContext>,
    ) -> Result<()> {
        let allowed = self
            .gate
            .validate_owner_access(user, &metadata, OperationType::Update)
            .await?;
        if !allowed {
            return Err(Error::forbidden(
                "Access denied",
                "The user is not authorized to perform this action",
            ));
        }
        metadata.status = RecordState::Active;
        metadata.modify_user = Some(user.to_string());
        metadata.modify_time = Some(self.clock.now_millis());
        let id = metadata.id.clone();
        let locked = self.persistence.update_metadata(vec![metadata], ctx).await?;
        if !locked.is_empty() {
            self.audit.update_records_fail(&locked);
            return Err(Error::locked(
                "Locked",
                format!("The record '{id}' is locked for modification"),
            ));
        }
        self.audit.update_records_success(&[id]);
        Ok(())
    }
}

fn merged_tags(current: &BTreeMap<String, String>, patch: &Value) -> Result<BTreeMap<String, String>> {
    let Value::Object(patch_map) = patch else {
        return Err(Error::bad_request(
            "Invalid merge patch",
            "The 'tags' field must be a JSON object of string values",
        ));
    };
    let mut merged = current.clone();
    for (key, value) in patch_map {
        match value {
            Value::Null => {
                merged.remove(key);
            }
            Value::String(s) => {
                merged.insert(key.clone(), s.clone());
            }
            _ => {
                return Err(Error::bad_request(
                    "Invalid merge patch",
                    "The 'tags' field must be a JSON object of string values",
                ));
            }
        }
    }
    Ok(merged)
}
