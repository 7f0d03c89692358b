//! Hard deletion: whole records and version windows.
//!
//! Version purge never deletes the latest version. The retained
//! metadata is committed before blob deletion; a blob failure restores
//! the previous version list.

use std::sync::Arc;

use record_common::{
    BlobStore, Clock, CollaborationContext, MetadataRepository, OperationType, RecordMetadata,
    StorageError,
};
use uuid::Uuid;

use crate::audit::AuditLogger;
use crate::authorization::AuthorizationGate;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::messaging::{DeletionType, MessageBus, MessageHeaders, RecordChanged, RecordChangedV2};
use crate::validation::{
    ensure_collaboration_enabled, invalid_from_version_message,
    invalid_limit_for_from_version_message, validate_version_ids, INVALID_FROM_VERSION,
    INVALID_LIMIT,
};

pub struct PurgeEngine {
    repository: Arc<dyn MetadataRepository>,
    blob_store: Arc<dyn BlobStore>,
    bus: Arc<dyn MessageBus>,
    gate: Arc<AuthorizationGate>,
    audit: AuditLogger,
    clock: Arc<dyn Clock>,
    config: Config,
}

impl PurgeEngine {
    pub fn new(
        repository: Arc<dyn MetadataRepository>,
        blob_store: Arc<dyn BlobStore>,
        bus: Arc<dyn MessageBus>,
        gate: Arc<AuthorizationGate>,
        clock: Arc<dyn Clock>,
        config: Config,
    ) -> Self {
        Self {
            repository,
            blob_store,
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

    /// Removes a record entirely: metadata row, then every version
    /// body. Soft-deleted records can still be purged.
    pub async fn purge_record(
        &self,
        id: &str,
        user: &str,
        ctx: Option<&CollaborationContext>,
    ) -> Result<()> {
        ensure_collaboration_enabled(&self.config, ctx)?;
        let metadata = self.record_metadata(id, true, ctx).await?;

        let allowed = self
            .gate
            .validate_owner_access(user, &metadata, OperationType::Purge)
            .await?;
        if !allowed {
            self.audit.purge_record_fail(&[id.to_string()]);
            return Err(Error::forbidden(
                "Access denied",
                "The user is not authorized to perform this action",
            ));
        }

        if let Err(e) = self.repository.delete(id, ctx).await {
            self.audit.purge_record_fail(&[id.to_string()]);
            return Err(e.into());
        }

        if let Err(e) = self.blob_store.delete(&metadata).await {
            if !matches!(e, StorageError::NotFound(_)) {
                if let Err(restore) = self
                    .repository
                    .create_or_update(vec![metadata.clone()], ctx)
                    .await
                {
                    tracing::warn!(record_id = %id, error = %restore, "metadata restore failed");
                }
            }
            self.audit.purge_record_fail(&[id.to_string()]);
            return Err(e.into());
        }

        self.audit.purge_record_success(&[id.to_string()]);
        let headers = self.headers();
        if self.config.collaboration_enabled {
            let message = delete_message_v2(id, &metadata, metadata.latest_version());
            if let Err(e) = self.bus.publish_v2(ctx, &headers, &[message]).await {
                tracing::warn!(error = %e, "failed to publish purge notification");
            }
        }
        if ctx.is_none() {
            let message = RecordChanged::deleted(id, &metadata.kind, DeletionType::Hard);
            if let Err(e) = self.bus.publish(&headers, &[message]).await {
                tracing::warn!(error = %e, "failed to publish purge notification");
            }
        }
        Ok(())
    }

    /// Deletes a window of non-latest versions selected by explicit
    /// version ids, a count from the oldest, a `from` upper bound, or
    /// `from` combined with a count.
    pub async fn purge_record_versions(
        &self,
        id: &str,
        version_ids: Option<&[i64]>,
        limit: Option<usize>,
        from: Option<i64>,
        user: &str,
        ctx: Option<&CollaborationContext>,
    ) -> Result<()> {
        ensure_collaboration_enabled(&self.config, ctx)?;
        if version_ids.is_none() && limit.is_none() && from.is_none() {
            return Err(Error::bad_request(
                "Invalid versionIds/limit/from",
                "Either [versionIds or limit or from] value is required",
            ));
        }

        let mut metadata = self.record_metadata(id, true, ctx).await?;
        let existing_paths = metadata.version_paths.clone();

        let allowed = self
            .gate
            .validate_owner_access(user, &metadata, OperationType::Purge)
            .await?;
        if !allowed {
            self.audit
                .purge_record_versions_fail(id, &[id.to_string()]);
            return Err(Error::forbidden(
                "Access denied",
                "The user is not authorized to perform this action",
            ));
        }

        if existing_paths.len() == 1 {
            return Err(Error::bad_request(
                "No Record versions to purge",
                format!("The record '{id}' has only one version"),
            ));
        }

        if let Some(ids) = version_ids {
            validate_version_ids(ids, &metadata, &self.config)?;
        }
        if version_ids.is_none() {
            if let Some(limit) = limit {
                validate_limit(limit, id, existing_paths.len())?;
            }
        }
        if let Some(from) = from {
            validate_from_version(from, &existing_paths)?;
        }

        let (retain, delete) = match version_ids {
            Some(ids) => extract_by_version_ids(&existing_paths, ids),
            None => extract_by_limit_and_from(&existing_paths, limit, from)?,
        };

        metadata.version_paths = retain;
        metadata.modify_time = Some(self.clock.now_millis());
        metadata.modify_user = Some(user.to_string());

        if let Err(e) = self
            .repository
            .create_or_update(vec![metadata.clone()], ctx)
            .await
        {
            self.audit.purge_record_versions_fail(id, &delete);
            return Err(e.into());
        }

        if let Err(e) = self.blob_store.delete_versions(&delete).await {
            metadata.version_paths = existing_paths;
            if let Err(restore) = self
                .repository
                .create_or_update(vec![metadata.clone()], ctx)
                .await
            {
                tracing::warn!(record_id = %id, error = %restore, "metadata restore failed");
            }
            self.audit.purge_record_versions_fail(id, &delete);
            return Err(e.into());
        }

        self.audit.purge_record_versions_success(id, &delete);
        let headers = self.headers();
        for path in &delete {
            let parts: Vec<&str> = path.split('/').collect();
            let Some(version) = parts
                .get(2)
                .filter(|_| parts.len() == 3)
                .and_then(|v| v.parse::<i64>().ok())
            else {
                self.audit.purge_record_versions_fail(id, &[path.clone()]);
                continue;
            };
            if self.config.collaboration_enabled {
                let message = delete_message_v2(id, &metadata, Some(version));
                if let Err(e) = self.bus.publish_v2(ctx, &headers, &[message]).await {
                    tracing::warn!(error = %e, "failed to publish purge notification");
                }
            }
            if ctx.is_none() {
                let message = RecordChanged::deleted(
                    format!("{id}/{version}"),
                    &metadata.kind,
                    DeletionType::Hard,
                );
                if let Err(e) = self.bus.publish(&headers, &[message]).await {
                    tracing::warn!(error = %e, "failed to publish purge notification");
                }
            }
        }
        Ok(())
    }

    /// Fetches record metadata, checking tenant ownership of the id.
    /// Purge requests may address soft-deleted records; everything
    /// else requires an active record.
    async fn record_metadata(
        &self,
        id: &str,
        is_purge: bool,
        ctx: Option<&CollaborationContext>,
    ) -> Result<RecordMetadata> {
        let tenant = &self.config.tenant;
        if !id.starts_with(&format!("{tenant}:")) || id.split(':').count() != 3 {
            return Err(Error::bad_request(
                "Invalid record ID",
                format!("The record '{id}' does not belong to account '{tenant}'"),
            ));
        }
        let metadata = self.repository.get(id, ctx).await?;
        let not_found = || {
            Error::not_found(
                "Record not found",
                format!("Record with id '{id}' does not exist"),
            )
        };
        match metadata {
            None => Err(not_found()),
            Some(m) if !is_purge && m.status != record_common::RecordState::Active => {
                Err(not_found())
            }
            Some(m) => Ok(m),
        }
    }
}

fn delete_message_v2(
    id: &str,
    metadata: &RecordMetadata,
    version: Option<i64>,
) -> RecordChangedV2 {
    RecordChangedV2 {
        id: id.to_string(),
        version,
        modified_by: metadata.modify_user.clone(),
        kind: metadata.kind.clone(),
        op: OperationType::Delete,
        previous_version_kind: None,
        deletion_type: Some(DeletionType::Hard),
    }
}

fn validate_limit(limit: usize, id: &str, version_count: usize) -> Result<()> {
    if limit == 0 {
        return Err(Error::bad_request(
            INVALID_LIMIT,
            format!("Invalid limit value '{limit}'. It should be greater than 0"),
        ));
    }
    if version_count - 1 < limit {
        return Err(Error::bad_request(
            INVALID_LIMIT,
            format!(
                "The record '{id}' version count (excluding latest version) is : {} , which is less than limit value : {limit} ",
                version_count - 1
            ),
        ));
    }
    Ok(())
}

fn validate_from_version(from: i64, paths: &[String]) -> Result<()> {
    let suffix = format!("/{from}");
    if !paths.iter().any(|p| p.ends_with(&suffix)) {
        return Err(Error::bad_request(
            INVALID_FROM_VERSION,
            invalid_from_version_message(from),
        ));
    }
    Ok(())
}

fn extract_by_version_ids(paths: &[String], version_ids: &[i64]) -> (Vec<String>, Vec<String>) {
    let suffixes: Vec<String> = version_ids.iter().map(|v| format!("/{v}")).collect();
    let mut retain = Vec::new();
    let mut delete = Vec::new();
    for path in paths {
        if suffixes.iter().any(|s| path.ends_with(s)) {
            delete.push(path.clone());
        } else {
            retain.push(path.clone());
        }
    }
    (retain, delete)
}

fn extract_by_limit_and_from(
    paths: &[String],
    limit: Option<usize>,
    from: Option<i64>,
) -> Result<(Vec<String>, Vec<String>)> {
    let total = paths.len();
    match from {
        // window of the oldest `limit` versions
        None => {
            let limit = limit.unwrap_or(0);
            Ok((paths[limit..].to_vec(), paths[..limit].to_vec()))
        }
        Some(from) => {
            let suffix = format!("/{from}");
            let from_index = paths
                .iter()
                .position(|p| p.ends_with(&suffix))
                .ok_or_else(|| {
                    Error::bad_request(INVALID_FROM_VERSION, invalid_from_version_message(from))
                })?;
            let is_latest = from_index == total - 1;
            let end = if is_latest { from_index } else { from_index + 1 };
            match limit {
                // everything up to and including `from`
                None => Ok((paths[end..].to_vec(), paths[..end].to_vec())),
                // `limit` versions ending at `from`
                Some(limit) => {
                    if limit > end {
                        return Err(Error::bad_request(
                            INVALID_LIMIT,
                            invalid_limit_for_from_version_message(limit, from),
                        ));
                    }
                    let start = end - limit;
                    let delete: Vec<String> = paths[start..end].to_vec();
                    let retain: Vec<String> = paths
                        .iter()
                        .filter(|p| !delete.contains(p))
                        .cloned()
                        .collect();
                    Ok((retain, delete))
                }
            }
        }
    }
}
