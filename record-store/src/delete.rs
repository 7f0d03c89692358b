//! Soft deletion: single records and bulk requests.
//!
//! Soft deletion flips the metadata status to `deleted` and keeps
//! every version body in place so the record can be recovered later.

use std::sync::Arc;

use record_common::namespace::with_namespace;
use record_common::{
    Clock, CollaborationContext, MetadataRepository, OperationType, RecordMetadata, RecordState,
};
use thiserror::Error as ThisError;
use uuid::Uuid;

use crate::audit::AuditLogger;
use crate::authorization::AuthorizationGate;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::messaging::{DeletionType, MessageBus, MessageHeaders, RecordChanged, RecordChangedV2};
use crate::validation::{ensure_collaboration_enabled, validate_record_ids};

/// Bulk outcome when some records could not be deleted. The deletable
/// subset has already been committed when this is returned.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
#[error("{} record(s) were not deleted", not_deleted.len())]
pub struct DeleteRecordsError {
    pub not_deleted: Vec<NotDeletedRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotDeletedRecord {
    pub id: String,
    pub message: String,
}

#[derive(Debug, ThisError)]
pub enum BulkDeleteError {
    #[error(transparent)]
    Request(#[from] Error),
    #[error(transparent)]
    NotDeleted(#[from] DeleteRecordsError),
}

pub struct SoftDeleteEngine {
    repository: Arc<dyn MetadataRepository>,
    bus: Arc<dyn MessageBus>,
    gate: Arc<AuthorizationGate>,
    audit: AuditLogger,
    clock: Arc<dyn Clock>,
    config: Config,
}

impl SoftDeleteEngine {
    pub fn new(
        repository: Arc<dyn MetadataRepository>,
        bus: Arc<dyn MessageBus>,
        gate: Arc<AuthorizationGate>,
        clock: Arc<dyn Clock>,
        config: Config,
    ) -> Self {
        Self {
            repository,
            bus,
            gate,
            audit: AuditLogger::new(),
            clock,
            config,
        }
    }

    fn headers(&self) -> MessageHeaders {
        MessageHeaders::new(&self.config.tenant, Uuid::new_v4().to_string())
    }

    /// Marks one active record as deleted. Already-deleted and missing
    /// records both surface as not found.
    pub async fn delete_record(
        &self,
        id: &str,
        user: &str,
        ctx: Option<&CollaborationContext>,
    ) -> Result<()> {
        ensure_collaboration_enabled(&self.config, ctx)?;
        let metadata = self
            .repository
            .get(id, ctx)
            .await?
            .filter(|m| m.status == RecordState::Active)
            .ok_or_else(|| {
                Error::not_found(
                    "Record not found",
                    format!("Record with id '{id}' does not exist"),
                )
            })?;

        let allowed = self
            .gate
            .validate_owner_access(user, &metadata, OperationType::Delete)
            .await?;
        if !allowed {
            self.audit.delete_record_fail(&[id.to_string()]);
            return Err(Error::forbidden(
                "Access denied",
                "The user is not authorized to perform this action",
            ));
        }

        let stamped = self.stamp_deleted(metadata, user);
        if let Err(e) = self
            .repository
            .create_or_update(vec![stamped.clone()], ctx)
            .await
        {
            self.audit.delete_record_fail(&[id.to_string()]);
            return Err(e.into());
        }

        self.audit.delete_record_success(&[id.to_string()]);
        self.publish_deleted(&stamped, ctx).await;
        Ok(())
    }

    /// Bulk soft delete. Deletable records commit even when others
    /// fail; failures come back with a per-id message.
    pub async fn bulk_delete_records(
        &self,
        ids: &[String],
        user: &str,
        ctx: Option<&CollaborationContext>,
    ) -> std::result::Result<(), BulkDeleteError> {
        ensure_collaboration_enabled(&self.config, ctx)?;
        validate_record_ids(ids, &self.config.tenant, &self.config)?;

        let existing = self.repository.get_batch(ids, ctx).await.map_err(Error::from)?;
        let mut not_deleted = Vec::new();
        let mut deletable = Vec::new();
        for id in ids {
            let Some(metadata) = existing
                .get(&with_namespace(id, ctx))
                .filter(|m| m.status == RecordState::Active)
            else {
                not_deleted.push(NotDeletedRecord {
                    id: id.clone(),
                    message: format!("Record with id '{id}' not found"),
                });
                continue;
            };
            let allowed = self
                .gate
                .validate_owner_access(user, metadata, OperationType::Delete)
                .await?;
            if !allowed {
                not_deleted.push(NotDeletedRecord {
                    id: id.clone(),
                    message: format!(
                        "The user is not authorized to perform delete record with id {id}"
                    ),
                });
                continue;
            }
            deletable.push(self.stamp_deleted(metadata.clone(), user));
        }

        if !deletable.is_empty() {
            let deleted_ids: Vec<String> = deletable.iter().map(|m| m.id.clone()).collect();
            if let Err(e) = self.repository.create_or_update(deletable.clone(), ctx).await {
                self.audit.delete_record_fail(&deleted_ids);
                return Err(Error::from(e).into());
            }
            self.audit.delete_record_success(&deleted_ids);
            for metadata in &deletable {
                self.publish_deleted(metadata, ctx).await;
            }
        }

        if not_deleted.is_empty() {
            Ok(())
        } else {
            let failed_ids: Vec<String> = not_deleted.iter().map(|r| r.id.clone()).collect();
            self.audit.delete_record_fail(&failed_ids);
            Err(DeleteRecordsError { not_deleted }.into())
        }
    }

    fn stamp_deleted(&self, mut metadata: RecordMetadata, user: &str) -> RecordMetadata {
        metadata.status = RecordState::Deleted;
        metadata.modify_user = Some(user.to_string());
        metadata.modify_time = Some(self.clock.now_millis());
        metadata
    }

    async fn publish_deleted(&self, metadata: &RecordMetadata, ctx: Option<&CollaborationContext>) {
        let headers = self.headers();
        if self.config.collaboration_enabled {
            let message = RecordChangedV2 {
                id: metadata.id.clone(),
                version: metadata.latest_version(),
                modified_by: metadata.modify_user.clone(),
                kind: metadata.kind.clone(),
                op: OperationType::Delete,
                previous_version_kind: None,
                deletion_type: Some(DeletionType::Soft),
            };
            if let Err(e) = self.bus.publish_v2(ctx, &headers, &[message]).await {
                tracing::warn!(error = %e, "failed to publish delete notification");
            }
        }
        if ctx.is_none() {
            let message =
                RecordChanged::deleted(&metadata.id, &metadata.kind, DeletionType::Soft);
            if let Err(e) = self.bus.publish(&headers, &[message]).await {
                tracing::warn!(error = %e, "failed to publish delete notification");
            }
        }
    }
}
