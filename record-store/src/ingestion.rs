//! Record ingestion: batch create/update with versioning and dedup.
//!
//! The batch is all-or-nothing: every record passes validation and
//! authorization before anything is written, and the persistence
//! service commits every new version or none. Records whose incoming
//! body hashes identically to their current version can be skipped
//! (`skip_dupes`), reported in `skipped_record_ids`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use record_common::namespace::with_namespace;
use record_common::{
    BlobStore, Clock, CollaborationContext, MetadataRepository, OperationType, Record, RecordData,
    RecordMetadata, RecordProcessing, TransferBatch, TransferInfo,
};

use crate::audit::AuditLogger;
use crate::authorization::{AuthorizationGate, EntitlementsService};
use crate::config::{AuthorizationBackend, Config};
use crate::error::{Error, Result};
use crate::hash::{ensure_hash, hash_record_data};
use crate::persistence::PersistenceService;
use crate::validation::{
    ensure_collaboration_enabled, validate_kind, validate_record_id_for_kind,
};

/// A parent reference parsed out of `ancestry.parents`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ParentReference {
    record_id: String,
    version: i64,
}

pub struct IngestionEngine {
    repository: Arc<dyn MetadataRepository>,
    blob_store: Arc<dyn BlobStore>,
    persistence: Arc<PersistenceService>,
    gate: Arc<AuthorizationGate>,
    entitlements: Arc<dyn EntitlementsService>,
    audit: AuditLogger,
    clock: Arc<dyn Clock>,
    config: Config,
}

impl IngestionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repository: Arc<dyn MetadataRepository>,
        blob_store: Arc<dyn BlobStore>,
        persistence: Arc<PersistenceService>,
        gate: Arc<AuthorizationGate>,
        entitlements: Arc<dyn EntitlementsService>,
        clock: Arc<dyn Clock>,
        config: Config,
    ) -> Self {
        Self {
            repository,
            blob_store,
            persistence,
            gate,
            entitlements,
            audit: AuditLogger::new(),
            clock,
            config,
        }
    }

    pub async fn create_update_records(
        &self,
        skip_dupes: bool,
        mut records: Vec<Record>,
        user: &str,
        ctx: Option<&CollaborationContext>,
    ) -> Result<TransferInfo> {
        ensure_collaboration_enabled(&self.config, ctx)?;
        self.validate_kind_format(&records)?;
        self.validate_record_ids(&mut records)?;
        self.validate_acl(&records, user).await?;

        let version = self.clock.now_millis();
        let mut transfer = TransferInfo {
            user: user.to_string(),
            record_count: records.len(),
            version,
            record_ids: Vec::new(),
            record_id_versions: Vec::new(),
            skipped_record_ids: Vec::new(),
        };

        let processing = self
            .records_for_processing(skip_dupes, &records, &mut transfer, ctx)
            .await?;
        transfer.record_count = processing.len();
        transfer.record_ids = processing
            .iter()
            .map(|p| p.record_metadata.id.clone())
            .collect();
        transfer.record_id_versions = transfer
            .record_ids
            .iter()
            .map(|id| format!("{id}:{version}"))
            .collect();

        if !processing.is_empty() {
            let batch = TransferBatch {
                transfer_info: transfer.clone(),
                records: processing,
            };
            self.persistence.persist_record_batch(&batch, ctx).await?;
            self.audit
                .create_or_update_records_success(&transfer.record_ids);
        }
        Ok(transfer)
    }

    fn validate_kind_format(&self, records: &[Record]) -> Result<()> {
        for record in records {
            validate_kind(&record.kind)?;
            if record.acl.viewers.is_empty() || record.acl.owners.is_empty() {
                return Err(Error::bad_request(
                    "Validation error",
                    "Record acl cannot be empty",
                ));
            }
            if record.legal.legaltags.is_empty() {
                return Err(Error::bad_request(
                    "Validation error",
                    "Record legal tags cannot be empty",
                ));
            }
        }
        Ok(())
    }

    /// Checks explicit ids against the naming convention and mints ids
    /// for records that arrived without one. The same id may appear at
    /// most once per request.
    fn validate_record_ids(&self, records: &mut [Record]) -> Result<()> {
        let tenant = self.config.tenant.clone();
        let mut seen = HashSet::new();
        for record in records {
            match record.id.as_deref() {
                Some(id) => {
                    if !seen.insert(id.to_string()) {
                        return Err(Error::bad_request(
                            "Bad request",
                            format!(
                                "Cannot update the same record multiple times in the same request. Id: {id}"
                            ),
                        ));
                    }
                    validate_record_id_for_kind(id, &tenant, &record.kind, &self.config)?;
                }
                None => {
                    record.id = Some(Record::mint_id(&tenant, &record.kind));
                }
            }
        }
        Ok(())
    }

    async fn validate_acl(&self, records: &[Record], user: &str) -> Result<()> {
        let mut acls = HashSet::new();
        for record in records {
            acls.extend(record.acl.viewers.iter().cloned());
            acls.extend(record.acl.owners.iter().cloned());
        }
        let valid = self
            .entitlements
            .is_valid_acl(user, &acls)
            .await
            .map_err(Error::from)?;
        if !valid {
            return Err(Error::bad_request(
                "Invalid ACL",
                "Acl not match with tenant or domain",
            ));
        }
        Ok(())
    }

    async fn records_for_processing(
        &self,
        skip_dupes: bool,
        records: &[Record],
        transfer: &mut TransferInfo,
        ctx: Option<&CollaborationContext>,
    ) -> Result<Vec<RecordProcessing>> {
        let parent_map = parse_parent_references(records)?;

        let mut ids: Vec<String> = records.iter().map(|r| r.id_str().to_string()).collect();
        ids.extend(parent_map.values().flatten().map(|p| p.record_id.clone()));
        let existing = self.repository.get_batch(&ids, ctx).await?;

        validate_parents_exist(&existing, &parent_map, ctx)?;
        self.validate_user_access(records, &existing, &transfer.user, ctx)
            .await?;

        let now = transfer.version;
        let mut processing = Vec::new();
        for record in records {
            let body = RecordData {
                data: record.data.clone(),
                meta: record.meta.clone(),
            };
            let hash = hash_record_data(&body);
            let key = with_namespace(record.id_str(), ctx);
            match existing.get(&key) {
                None => {
                    let mut metadata = RecordMetadata::new_from_record(record, &transfer.user, now);
                    metadata.hash = Some(hash);
                    metadata.add_version(now);
                    processing.push(RecordProcessing {
                        operation_type: OperationType::Create,
                        record_metadata: metadata,
                        record_data: body,
                        prior_metadata: None,
                    });
                }
                Some(current) => {
                    if skip_dupes {
                        let current_hash = ensure_hash(current, self.blob_store.as_ref()).await?;
                        if current_hash.as_ref() == Some(&hash) {
                            transfer.skipped_record_ids.push(current.id.clone());
                            continue;
                        }
                    }
                    let mut metadata = RecordMetadata::new_from_record(record, &current.user, current.create_time);
                    if !current.kind.eq_ignore_ascii_case(&record.kind) {
                        metadata.previous_version_kind = Some(current.kind.clone());
                    }
                    metadata.version_paths = current.version_paths.clone();
                    if metadata.version_paths.is_empty() {
                        tracing::warn!(record_id = %metadata.id, "record does not have versions available");
                    }
                    metadata.hash = Some(hash);
                    metadata.add_version(now);
                    metadata.modify_user = Some(transfer.user.clone());
                    metadata.modify_time = Some(now);
                    processing.push(RecordProcessing {
                        operation_type: OperationType::Update,
                        record_metadata: metadata,
                        record_data: body,
                        prior_metadata: Some(current.clone()),
                    });
                }
            }
        }
        Ok(processing)
    }

    async fn validate_user_access(
        &self,
        records: &[Record],
        existing: &HashMap<String, RecordMetadata>,
        user: &str,
        ctx: Option<&CollaborationContext>,
    ) -> Result<()> {
        let updated_existing: Vec<RecordMetadata> = records
            .iter()
            .filter_map(|r| existing.get(&with_namespace(r.id_str(), ctx)))
            .cloned()
            .collect();

        match self.config.authorization {
            AuthorizationBackend::Policy => {
                let mut creates = Vec::new();
                let mut updates = Vec::new();
                for record in records {
                    let candidate = RecordMetadata::new_from_record(record, user, 0);
                    if existing.contains_key(&with_namespace(record.id_str(), ctx)) {
                        updates.push(candidate);
                    } else {
                        creates.push(candidate);
                    }
                }
                self.gate
                    .validate_records_or_fail(user, &creates, OperationType::Create)
                    .await?;
                self.gate
                    .validate_records_or_fail(user, &updates, OperationType::Update)
                    .await?;
            }
            AuthorizationBackend::Entitlements => {
                if !updated_existing.is_empty() {
                    let accessible = self
                        .blob_store
                        .has_access(&updated_existing)
                        .await
                        .map_err(Error::from)?;
                    if !accessible {
                        return Err(Error::forbidden(
                            "Access denied",
                            "The user is not authorized to perform this action",
                        ));
                    }
                }
                self.gate
                    .validate_records_or_fail(user, &updated_existing, OperationType::Update)
                    .await?;
            }
        }
        Ok(())
    }
}

fn parse_parent_references(
    records: &[Record],
) -> Result<HashMap<String, Vec<ParentReference>>> {
    let mut map = HashMap::new();
    for record in records {
        let Some(ancestry) = &record.ancestry else {
            continue;
        };
        let mut parents = Vec::new();
        for parent in &ancestry.parents {
            let reference = parent
                .rsplit_once(':')
                .and_then(|(id, version)| {
                    version.parse::<i64>().ok().map(|version| ParentReference {
                        record_id: id.to_string(),
                        version,
                    })
                })
                .ok_or_else(|| {
                    Error::bad_request(
                        "Validation error",
                        format!(
                            "Invalid parent record format: '{parent}'. The following format is expected: {{record-id}}:{{record-version}}"
                        ),
                    )
                })?;
            parents.push(reference);
        }
        if !parents.is_empty() {
            map.insert(record.id_str().to_string(), parents);
        }
    }
    Ok(map)
}

fn validate_parents_exist(
    existing: &HashMap<String, RecordMetadata>,
    parent_map: &HashMap<String, Vec<ParentReference>>,
    ctx: Option<&CollaborationContext>,
) -> Result<()> {
    for parents in parent_map.values() {
        for parent in parents {
            let key = with_namespace(&parent.record_id, ctx);
            let Some(metadata) = existing.get(&key) else {
                return Err(Error::not_found(
                    "Record not found",
                    format!(
                        "The record '{}:{}' was not found",
                        parent.record_id, parent.version
                    ),
                ));
            };
            if !metadata.has_version(parent.version) {
                return Err(Error::not_found(
                    "RecordMetadata version not found",
                    format!(
                        "The RecordMetadata version {} for parent record '{}' was not found",
                        parent.version, parent.record_id
                    ),
                ));
            }
        }
    }
    Ok(())
}
