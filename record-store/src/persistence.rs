//! Transactional commit of record batches.
//!
//! The write order is fixed: version bodies first, metadata second.
//! A metadata failure triggers best-effort cleanup of the bodies just
//! written (and, for updates, restoration of the pre-batch metadata)
//! before the original failure is re-raised. Change
//! notifications go out only after a successful commit.

use std::sync::Arc;

use record_common::{
    BlobStore, CollaborationContext, MetadataRepository, OperationType, RecordMetadata,
    TransferBatch,
};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::messaging::{MessageBus, MessageHeaders, RecordChanged, RecordChangedV2};

pub struct PersistenceService {
    repository: Arc<dyn MetadataRepository>,
    blob_store: Arc<dyn BlobStore>,
    bus: Arc<dyn MessageBus>,
    config: Config,
}

fn write_error() -> Error {
    Error::internal(
        "Error writing record.",
        "The server could not process your request at the moment.",
    )
}

impl PersistenceService {
    pub fn new(
        repository: Arc<dyn MetadataRepository>,
        blob_store: Arc<dyn BlobStore>,
        bus: Arc<dyn MessageBus>,
        config: Config,
    ) -> Self {
        Self {
            repository,
            blob_store,
            bus,
            config,
        }
    }

    fn headers(&self) -> MessageHeaders {
        MessageHeaders::new(&self.config.tenant, Uuid::new_v4().to_string())
    }

    /// Commits an ingestion batch atomically: either every record in
    /// the batch gets its new version, or none does.
    pub async fn persist_record_batch(
        &self,
        batch: &TransferBatch,
        ctx: Option<&CollaborationContext>,
    ) -> Result<()> {
        if let Err(e) = self.blob_store.write(&batch.records).await {
            tracing::error!(error = %e, "blob write failed");
            return Err(write_error());
        }

        let metadata: Vec<RecordMetadata> = batch
            .records
            .iter()
            .map(|p| p.record_metadata.clone())
            .collect();
        match self.repository.create_or_update(metadata, ctx).await {
            Ok(locked) if locked.is_empty() => {}
            Ok(locked) => {
                self.cleanup_written_versions(batch, ctx).await;
                return Err(Error::locked(
                    "Locked",
                    format!("The following records are locked for modification: {locked:?}"),
                ));
            }
            Err(e) => {
                tracing::error!(error = %e, "metadata commit failed");
                self.cleanup_written_versions(batch, ctx).await;
                return Err(write_error());
            }
        }

        self.publish_batch_changes(batch, ctx).await;
        Ok(())
    }

    /// Governance-only metadata update, no new version. Returns the
    /// ids the backend refused to persist.
    pub async fn update_metadata(
        &self,
        metadata: Vec<RecordMetadata>,
        ctx: Option<&CollaborationContext>,
    ) -> Result<Vec<String>> {
        let locked = self
            .repository
            .create_or_update(metadata.clone(), ctx)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "metadata update failed");
                write_error()
            })?;

        let committed: Vec<&RecordMetadata> = metadata
            .iter()
            .filter(|m| !locked.contains(&m.id))
            .collect();
        let headers = self.headers();
        if self.config.collaboration_enabled {
            let messages: Vec<RecordChangedV2> = committed
                .iter()
                .map(|m| RecordChangedV2 {
                    id: m.id.clone(),
                    version: m.latest_version(),
                    modified_by: m.modify_user.clone(),
                    kind: m.kind.clone(),
                    op: OperationType::Update,
                    previous_version_kind: m.previous_version_kind.clone(),
                    deletion_type: None,
                })
                .collect();
            if let Err(e) = self.bus.publish_v2(ctx, &headers, &messages).await {
                tracing::warn!(error = %e, "failed to publish update notifications");
            }
        }
        if ctx.is_none() {
            let messages: Vec<RecordChanged> = committed
                .iter()
                .map(|m| {
                    RecordChanged::upsert(
                        &m.id,
                        &m.kind,
                        OperationType::Update,
                        m.previous_version_kind.clone(),
                    )
                })
                .collect();
            if let Err(e) = self.bus.publish(&headers, &messages).await {
                tracing::warn!(error = %e, "failed to publish update notifications");
            }
        }
        Ok(locked)
    }

    async fn publish_batch_changes(&self, batch: &TransferBatch, ctx: Option<&CollaborationContext>) {
        let headers = self.headers();
        if self.config.collaboration_enabled {
            let messages: Vec<RecordChangedV2> = batch
                .records
                .iter()
                .map(|p| {
                    let m = &p.record_metadata;
                    RecordChangedV2 {
                        id: m.id.clone(),
                        version: Some(batch.transfer_info.version),
                        modified_by: m
                            .modify_user
                            .clone()
                            .or_else(|| Some(batch.transfer_info.user.clone())),
                        kind: m.kind.clone(),
                        op: p.operation_type,
                        previous_version_kind: m.previous_version_kind.clone(),
                        deletion_type: None,
                    }
                })
                .collect();
            if let Err(e) = self.bus.publish_v2(ctx, &headers, &messages).await {
                tracing::warn!(error = %e, "failed to publish record change notifications");
            }
        }
        if ctx.is_none() {
            let messages: Vec<RecordChanged> = batch
                .records
                .iter()
                .map(|p| {
                    RecordChanged::upsert(
                        &p.record_metadata.id,
                        &p.record_metadata.kind,
                        p.operation_type,
                        p.record_metadata.previous_version_kind.clone(),
                    )
                })
                .collect();
            if let Err(e) = self.bus.publish(&headers, &messages).await {
                tracing::warn!(error = %e, "failed to publish record change notifications");
            }
        }
    }

    /// Best-effort rollback after a failed metadata commit. Errors
    /// here are logged and suppressed into the original failure.
    async fn cleanup_written_versions(
        &self,
        batch: &TransferBatch,
        ctx: Option<&CollaborationContext>,
    ) {
        for processing in &batch.records {
            let metadata = &processing.record_metadata;
            if let Some(path) = metadata.version_paths.last() {
                if let Err(e) = self.blob_store.delete_versions(&[path.clone()]).await {
                    tracing::warn!(record_id = %metadata.id, error = %e, "cleanup of written version failed");
                }
            }
            let rollback = match processing.operation_type {
                OperationType::Create => self.repository.delete(&metadata.id, ctx).await,
                _ => {
                    // the pre-batch metadata, not the failed write minus
                    // its version pointer; hash and governance fields
                    // must revert too
                    let previous = match &processing.prior_metadata {
                        Some(prior) => prior.clone(),
                        None => {
                            let mut fallback = metadata.clone();
                            fallback.version_paths.pop();
                            fallback
                        }
                    };
                    self.repository
                        .create_or_update(vec![previous], ctx)
                        .await
                        .map(|_| ())
                }
            };
            if let Err(e) = rollback {
                tracing::warn!(record_id = %metadata.id, error = %e, "metadata rollback failed");
            }
        }
    }
}
