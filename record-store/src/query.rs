//! Record reads and cross-namespace reference copying.

use std::sync::Arc;

use record_common::namespace::with_namespace;
use record_common::{
    BlobStore, CollaborationContext, MetadataRepository, OperationType, Record, RecordData,
    RecordMetadata, RecordState,
};
use serde::{Deserialize, Serialize};

use crate::audit::AuditLogger;
use crate::authorization::AuthorizationGate;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::ingestion::IngestionEngine;
use crate::validation::ensure_collaboration_enabled;

/// Valid/invalid partition of a multi-record fetch. Unauthorized and
/// missing ids both land in `invalid_records`; the response never
/// reveals which ids exist but are hidden.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MultiRecordInfo {
    pub records: Vec<Record>,
    pub invalid_records: Vec<String>,
}

/// Version numbers of one record, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordVersions {
    pub record_id: String,
    pub versions: Vec<i64>,
}

/// Builds the outward record shape from stored metadata and one
/// version body.
pub(crate) fn record_from_parts(
    metadata: &RecordMetadata,
    body: RecordData,
    version: i64,
) -> Record {
    Record {
        id: Some(metadata.id.clone()),
        kind: metadata.kind.clone(),
        acl: metadata.acl.clone(),
        legal: metadata.legal.clone(),
        data: body.data,
        meta: body.meta,
        tags: metadata.tags.clone(),
        ancestry: metadata.ancestry.clone(),
        version: Some(version),
    }
}

pub struct QueryEngine {
    repository: Arc<dyn MetadataRepository>,
    blob_store: Arc<dyn BlobStore>,
    ingestion: Arc<IngestionEngine>,
    gate: Arc<AuthorizationGate>,
    audit: AuditLogger,
    config: Config,
}

impl QueryEngine {
    pub fn new(
        repository: Arc<dyn MetadataRepository>,
        blob_store: Arc<dyn BlobStore>,
        ingestion: Arc<IngestionEngine>,
        gate: Arc<AuthorizationGate>,
        config: Config,
    ) -> Self {
        Self {
            repository,
            blob_store,
            ingestion,
            gate,
            audit: AuditLogger::new(),
            config,
        }
    }

    /// Fetches an active record's metadata and checks viewer access.
    async fn authorized_metadata(
        &self,
        id: &str,
        user: &str,
        ctx: Option<&CollaborationContext>,
    ) -> Result<RecordMetadata> {
        ensure_collaboration_enabled(&self.config, ctx)?;
        let metadata = self
            .repository
            .get(id, ctx)
            .await?
            .filter(|m| m.status == RecordState::Active)
            .ok_or_else(|| {
                Error::not_found("Record not found", format!("The record '{id}' was not found"))
            })?;

        let authorized = self
            .gate
            .validate_viewer_or_owner_access(user, &metadata, OperationType::Update)
            .await?;
        if !authorized {
            return Err(Error::forbidden(
                "Access denied",
                "The user is not authorized to perform this action",
            ));
        }
        Ok(metadata)
    }

    /// Latest version of an active record, subject to viewer access.
    pub async fn get_record(
        &self,
        id: &str,
        user: &str,
        ctx: Option<&CollaborationContext>,
    ) -> Result<Record> {
        let metadata = self.authorized_metadata(id, user, ctx).await?;
        let version = metadata.latest_version().ok_or_else(|| {
            Error::not_found("Record not found", format!("The record '{id}' was not found"))
        })?;
        let body = self.blob_store.read(&metadata, version, false).await?;
        self.audit.read_records_success(&[id.to_string()]);
        Ok(record_from_parts(&metadata, body, version))
    }

    /// One specific stored version of an active record.
    pub async fn get_record_version(
        &self,
        id: &str,
        version: i64,
        user: &str,
        ctx: Option<&CollaborationContext>,
    ) -> Result<Record> {
        let metadata = self.authorized_metadata(id, user, ctx).await?;
        if !metadata.has_version(version) {
            return Err(Error::not_found(
                "Record not found",
                format!("The record '{id}' version '{version}' was not found"),
            ));
        }
        let body = self.blob_store.read(&metadata, version, false).await?;
        self.audit.read_records_success(&[id.to_string()]);
        Ok(record_from_parts(&metadata, body, version))
    }

    /// Lists the version numbers of an active record, oldest first.
    pub async fn get_record_versions(
        &self,
        id: &str,
        user: &str,
        ctx: Option<&CollaborationContext>,
    ) -> Result<RecordVersions> {
        let metadata = self.authorized_metadata(id, user, ctx).await?;
        self.audit.read_records_success(&[id.to_string()]);
        Ok(RecordVersions {
            versions: metadata.version_ids(),
            record_id: metadata.id,
        })
    }

    /// Batch fetch; missing, deleted, and unreadable records land in
    /// the invalid partition without failing the rest.
    pub async fn get_multiple_records(
        &self,
        ids: &[String],
        user: &str,
        ctx: Option<&CollaborationContext>,
    ) -> Result<MultiRecordInfo> {
        ensure_collaboration_enabled(&self.config, ctx)?;
        let existing = self.repository.get_batch(ids, ctx).await?;

        let mut info = MultiRecordInfo::default();
        for id in ids {
            let Some(metadata) = existing
                .get(&with_namespace(id, ctx))
                .filter(|m| m.status == RecordState::Active)
            else {
                info.invalid_records.push(id.clone());
                continue;
            };
            let authorized = self
                .gate
                .validate_viewer_or_owner_access(user, metadata, OperationType::Update)
                .await?;
            if !authorized {
                info.invalid_records.push(id.clone());
                continue;
            }
            let Some(version) = metadata.latest_version() else {
                info.invalid_records.push(id.clone());
                continue;
            };
            match self.blob_store.read(metadata, version, false).await {
                Ok(body) => info.records.push(record_from_parts(metadata, body, version)),
                Err(e) => {
                    tracing::warn!(record_id = %id, error = %e, "failed to read record body");
                    info.invalid_records.push(id.clone());
                }
            }
        }
        if !info.records.is_empty() {
            let ids: Vec<String> = info
                .records
                .iter()
                .map(|r| r.id_str().to_string())
                .collect();
            self.audit.read_records_success(&ids);
        }
        Ok(info)
    }

    /// Copies record references between the primary store and a
    /// collaboration namespace by re-ingesting the source bodies under
    /// the target namespace.
    pub async fn copy_record_references(
        &self,
        record_ids: Vec<String>,
        target: Option<CollaborationContext>,
        source: Option<&CollaborationContext>,
        user: &str,
    ) -> Result<()> {
        if target.is_none() && source.is_none() {
            return Err(Error::conflict(
                "Can't copy from SOR to SOR",
                "Source and target id is absent. You cant copy from System of Record to System of Record.",
            ));
        }

        let source_info = self.get_multiple_records(&record_ids, user, source).await?;
        if !source_info.invalid_records.is_empty() {
            return Err(Error::not_found(
                "Records not found",
                format!(
                    "Source records not found: {:?}",
                    source_info.invalid_records
                ),
            ));
        }

        let target_info = self
            .get_multiple_records(&record_ids, user, target.as_ref())
            .await?;
        if !target_info.records.is_empty() {
            let present: Vec<String> = target_info
                .records
                .iter()
                .map(|r| r.id_str().to_string())
                .collect();
            return Err(Error::conflict(
                "Records already exists",
                format!("One or more references already exist in the target namespace: {present:?}"),
            ));
        }

        self.ingestion
            .create_update_records(false, source_info.records, user, target.as_ref())
            .await?;
        Ok(())
    }
}
