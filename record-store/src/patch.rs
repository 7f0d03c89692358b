//! Bulk op-based record patching.
//!
//! Operations against `/data` or `/meta` change record content and go
//! through ingestion, producing a new version per touched record.
//! Everything else is a governance change applied to metadata in
//! place, leaving `version_paths` untouched. Failures are partitioned
//! per record; one bad record never fails its siblings.

use std::sync::Arc;

use record_common::namespace::with_namespace;
use record_common::{
    BlobStore, Clock, CollaborationContext, MetadataRepository, OperationType, Record,
    RecordMetadata, RecordState,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::audit::AuditLogger;
use crate::authorization::AuthorizationGate;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::ingestion::IngestionEngine;
use crate::json_patch::{add_value, remove_value, replace_value};
use crate::persistence::PersistenceService;
use crate::query::record_from_parts;
use crate::validation::{
    ensure_collaboration_enabled, validate_record_ids, INVALID_PATCH_OPERATION_SIZE,
    INVALID_PATCH_PATH_END, INVALID_PATCH_PATH_FOR_KIND, INVALID_PATCH_PATH_FOR_REMOVE_OPERATION,
    INVALID_PATCH_PATH_START, INVALID_PATCH_OPERATION_TYPE_FOR_KIND,
    INVALID_PATCH_VALUES_FORMAT_FOR_KIND, INVALID_PATCH_VALUES_FORMAT_FOR_TAGS,
    MAX_RECORD_ID_NUMBER, PATCH_RECORDS_MAX, RECORD_ID_LIST_NOT_EMPTY,
};

const KIND_PATH: &str = "/kind";
const TAGS_PATH: &str = "/tags";
const DATA_PATH: &str = "/data";
const META_PATH: &str = "/meta";
const ARRAY_PATHS: [&str; 4] = [
    "/acl/viewers",
    "/acl/owners",
    "/legal/legaltags",
    "/ancestry/parents",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    Add,
    Replace,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchOperation {
    pub op: PatchOp,
    pub path: String,
    #[serde(default)]
    pub value: Vec<Value>,
}

/// Per-record outcome partition of a bulk patch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchRecordsResponse {
    pub record_ids: Vec<String>,
    pub not_found_record_ids: Vec<String>,
    pub unauthorized_record_ids: Vec<String>,
    pub locked_record_ids: Vec<String>,
    pub failed_record_ids: Vec<String>,
    pub errors: Vec<String>,
}

impl PatchRecordsResponse {
    /// 200 when every record succeeded, 206 otherwise.
    pub fn http_status(&self) -> u16 {
        if self.not_found_record_ids.is_empty()
            && self.unauthorized_record_ids.is_empty()
            && self.locked_record_ids.is_empty()
            && self.failed_record_ids.is_empty()
        {
            200
        } else {
            206
        }
    }
}

pub struct PatchEngine {
    repository: Arc<dyn MetadataRepository>,
    blob_store: Arc<dyn BlobStore>,
    persistence: Arc<PersistenceService>,
    ingestion: Arc<IngestionEngine>,
    gate: Arc<AuthorizationGate>,
    audit: AuditLogger,
    clock: Arc<dyn Clock>,
    config: Config,
}

impl PatchEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repository: Arc<dyn MetadataRepository>,
        blob_store: Arc<dyn BlobStore>,
        persistence: Arc<PersistenceService>,
        ingestion: Arc<IngestionEngine>,
        gate: Arc<AuthorizationGate>,
        clock: Arc<dyn Clock>,
        config: Config,
    ) -> Self {
        Self {
            repository,
            blob_store,
            persistence,
            ingestion,
            gate,
            audit: AuditLogger::new(),
            clock,
            config,
        }
    }

    pub async fn patch_records(
        &self,
        ids: Vec<String>,
        ops: Vec<PatchOperation>,
        user: &str,
        ctx: Option<&CollaborationContext>,
    ) -> Result<PatchRecordsResponse> {
        ensure_collaboration_enabled(&self.config, ctx)?;
        if ids.is_empty() {
            return Err(Error::bad_request("Validation error", RECORD_ID_LIST_NOT_EMPTY));
        }
        if ids.len() > MAX_RECORD_ID_NUMBER {
            return Err(Error::bad_request("Validation error", PATCH_RECORDS_MAX));
        }
        validate_record_ids(&ids, &self.config.tenant, &self.config)?;
        validate_patch_operations(&ops, &self.config)?;
        let ops = dedup_operations(ops);

        let mut response = PatchRecordsResponse::default();
        let existing = self.repository.get_batch(&ids, ctx).await?;

        let mut targets: Vec<RecordMetadata> = Vec::new();
        for id in &ids {
            match existing.get(&with_namespace(id, ctx)) {
                Some(meta) if meta.status == RecordState::Active => targets.push(meta.clone()),
                _ => response.not_found_record_ids.push(id.clone()),
            }
        }

        let denied = self
            .gate
            .unauthorized_ids(user, &targets, OperationType::Update)
            .await?;
        response.unauthorized_record_ids = denied.clone();
        targets.retain(|m| !denied.contains(&m.id));

        if is_data_or_meta_update(&ops) {
            self.patch_record_content(targets, &ops, user, ctx, &mut response)
                .await?;
        } else {
            self.patch_metadata(targets, &ops, user, ctx, &mut response)
                .await?;
        }

        if !response.record_ids.is_empty() {
            self.audit.update_records_success(&response.record_ids);
        }
        let failed: Vec<String> = response
            .not_found_record_ids
            .iter()
            .chain(&response.unauthorized_record_ids)
            .chain(&response.locked_record_ids)
            .chain(&response.failed_record_ids)
            .cloned()
            .collect();
        if !failed.is_empty() {
            self.audit.update_records_fail(&failed);
        }
        Ok(response)
    }

    /// `/data` or `/meta` ops: patch the full record document and
    /// re-ingest, so every touched record gets a new version.
    async fn patch_record_content(
        &self,
        targets: Vec<RecordMetadata>,
        ops: &[PatchOperation],
        user: &str,
        ctx: Option<&CollaborationContext>,
        response: &mut PatchRecordsResponse,
    ) -> Result<()> {
        let mut patched = Vec::new();
        for metadata in targets {
            let Some(version) = metadata.latest_version() else {
                response.failed_record_ids.push(metadata.id.clone());
                response
                    .errors
                    .push(format!("{}: record has no versions", metadata.id));
                continue;
            };
            let body = match self.blob_store.read(&metadata, version, false).await {
                Ok(body) => body,
                Err(e) => {
                    tracing::warn!(record_id = %metadata.id, error = %e, "failed to read record body");
                    response.failed_record_ids.push(metadata.id.clone());
                    response
                        .errors
                        .push(format!("{}: could not read record body", metadata.id));
                    continue;
                }
            };
            let record = record_from_parts(&metadata, body, version);
            let mut doc = serde_json::to_value(&record).map_err(|e| {
                Error::internal("Internal server error", e.to_string())
            })?;
            match apply_ops_to_document(&mut doc, ops).and_then(|()| {
                guard_governance(&doc)?;
                serde_json::from_value::<Record>(doc)
                    .map_err(|e| Error::bad_request("Validation error", e.to_string()))
            }) {
                Ok(record) => patched.push(record),
                Err(e) => {
                    response.failed_record_ids.push(metadata.id.clone());
                    response.errors.push(format!("{}: {}", metadata.id, e.reason));
                }
            }
        }

        if !patched.is_empty() {
            let transfer = self
                .ingestion
                .create_update_records(false, patched, user, ctx)
                .await?;
            response.record_ids = transfer.record_ids;
        }
        Ok(())
    }

    /// Governance-only ops: mutate metadata in place, never touching
    /// the version list.
    async fn patch_metadata(
        &self,
        targets: Vec<RecordMetadata>,
        ops: &[PatchOperation],
        user: &str,
        ctx: Option<&CollaborationContext>,
        response: &mut PatchRecordsResponse,
    ) -> Result<()> {
        let now = self.clock.now_millis();
        let mut updated = Vec::new();
        for metadata in targets {
            match update_metadata_for_patch(&metadata, ops, user, now) {
                Ok(meta) => updated.push(meta),
                Err(e) => {
                    response.failed_record_ids.push(metadata.id.clone());
                    response.errors.push(format!("{}: {}", metadata.id, e.reason));
                }
            }
        }

        if !updated.is_empty() {
            let committed: Vec<String> = updated.iter().map(|m| m.id.clone()).collect();
            let locked = self.persistence.update_metadata(updated, ctx).await?;
            response.record_ids = committed
                .into_iter()
                .filter(|id| !locked.contains(id))
                .collect();
            response.locked_record_ids = locked;
        }
        Ok(())
    }
}

pub fn is_data_or_meta_update(ops: &[PatchOperation]) -> bool {
    ops.iter().any(|op| {
        op.path == DATA_PATH
            || op.path == META_PATH
            || op.path.starts_with("/data/")
            || op.path.starts_with("/meta/")
    })
}

/// Keeps the first occurrence of each `(op, path)` pair.
pub fn dedup_operations(ops: Vec<PatchOperation>) -> Vec<PatchOperation> {
    let mut seen = std::collections::HashSet::new();
    ops.into_iter()
        .filter(|op| seen.insert((op.op, op.path.clone())))
        .collect()
}

pub fn validate_patch_operations(ops: &[PatchOperation], config: &Config) -> Result<()> {
    if ops.is_empty() || ops.len() > config.max_patch_ops {
        return Err(Error::bad_request(
            "Validation error",
            INVALID_PATCH_OPERATION_SIZE,
        ));
    }
    for op in ops {
        if op.path.ends_with('/') {
            return Err(Error::bad_request("Validation error", INVALID_PATCH_PATH_END));
        }
        if op.path.starts_with(KIND_PATH) {
            if op.path != KIND_PATH {
                return Err(Error::bad_request(
                    "Validation error",
                    INVALID_PATCH_PATH_FOR_KIND,
                ));
            }
            if op.op != PatchOp::Replace {
                return Err(Error::bad_request(
                    "Validation error",
                    INVALID_PATCH_OPERATION_TYPE_FOR_KIND,
                ));
            }
            if op.value.len() != 1 {
                return Err(Error::bad_request(
                    "Validation error",
                    INVALID_PATCH_VALUES_FORMAT_FOR_KIND,
                ));
            }
            continue;
        }
        if op.op == PatchOp::Remove && ARRAY_PATHS.contains(&op.path.as_str()) {
            return Err(Error::bad_request(
                "Validation error",
                INVALID_PATCH_PATH_FOR_REMOVE_OPERATION,
            ));
        }
        let valid_start = op.path == TAGS_PATH
            || op.path.starts_with("/tags/")
            || op.path == DATA_PATH
            || op.path == META_PATH
            || op.path.starts_with("/data/")
            || op.path.starts_with("/meta/")
            || ARRAY_PATHS
                .iter()
                .any(|p| op.path == *p || op.path.starts_with(&format!("{p}/")));
        if !valid_start {
            return Err(Error::bad_request(
                "Validation error",
                INVALID_PATCH_PATH_START,
            ));
        }
    }
    Ok(())
}

fn first_value(op: &PatchOperation) -> Result<Value> {
    op.value.first().cloned().ok_or_else(|| {
        Error::bad_request(
            "Validation error",
            "Invalid Patch Operation: value is required",
        )
    })
}

fn as_string(value: &Value) -> Result<&str> {
    value.as_str().ok_or_else(|| {
        Error::bad_request(
            "Validation error",
            INVALID_PATCH_VALUES_FORMAT_FOR_TAGS,
        )
    })
}

fn ensure_object(doc: &mut Value, key: &str) {
    let Value::Object(map) = doc else { return };
    let entry = map.entry(key.to_string()).or_insert(Value::Null);
    if entry.is_null() {
        *entry = Value::Object(Default::default());
    }
}

/// Makes sure the container behind an exact array path exists, so adds
/// against absent `ancestry` or `tags` blocks succeed.
fn ensure_array_container(doc: &mut Value, path: &str) {
    if path == "/ancestry/parents" {
        ensure_object(doc, "ancestry");
        if let Some(ancestry) = doc.get_mut("ancestry") {
            if let Value::Object(map) = ancestry {
                map.entry("parents".to_string())
                    .or_insert_with(|| Value::Array(Vec::new()));
            }
        }
    }
}

/// Applies validated, deduplicated operations to a record or metadata
/// document.
pub fn apply_ops_to_document(doc: &mut Value, ops: &[PatchOperation]) -> Result<()> {
    for op in ops {
        apply_one(doc, op)?;
    }
    Ok(())
}

fn apply_one(doc: &mut Value, op: &PatchOperation) -> Result<()> {
    let path = op.path.as_str();

    if path == KIND_PATH {
        return replace_value(doc, KIND_PATH, first_value(op)?);
    }

    if path == TAGS_PATH {
        ensure_object(doc, "tags");
        for value in &op.value {
            let raw = as_string(value)?;
            match op.op {
                PatchOp::Add | PatchOp::Replace => {
                    let (key, tag_value) = raw.split_once(':').ok_or_else(|| {
                        Error::bad_request(
                            "Validation error",
                            INVALID_PATCH_VALUES_FORMAT_FOR_TAGS,
                        )
                    })?;
                    add_value(doc, &format!("/tags/{key}"), Value::String(tag_value.into()))?;
                }
                PatchOp::Remove => {
                    remove_value(doc, &format!("/tags/{raw}"))?;
                }
            }
        }
        return Ok(());
    }

    if let Some(key) = path.strip_prefix("/tags/") {
        return match op.op {
            PatchOp::Add | PatchOp::Replace => {
                ensure_object(doc, "tags");
                add_value(doc, &format!("/tags/{key}"), first_value(op)?)
            }
            PatchOp::Remove => remove_value(doc, path),
        };
    }

    if ARRAY_PATHS.contains(&path) {
        ensure_array_container(doc, path);
        match op.op {
            PatchOp::Add => {
                // tentative dedup: values already present are dropped
                let existing = doc.pointer(path).cloned().unwrap_or(Value::Array(Vec::new()));
                let current = existing.as_array().cloned().unwrap_or_default();
                for value in &op.value {
                    if !current.contains(value) {
                        add_value(doc, &format!("{path}/-"), value.clone())?;
                    }
                }
            }
            PatchOp::Replace => {
                let values = Value::Array(op.value.clone());
                if doc.pointer(path).is_some() {
                    replace_value(doc, path, values)?;
                } else {
                    add_value(doc, path, values)?;
                }
            }
            PatchOp::Remove => unreachable!("rejected by validation"),
        }
        return Ok(());
    }

    if ARRAY_PATHS
        .iter()
        .any(|p| path.starts_with(&format!("{p}/")))
    {
        return match op.op {
            PatchOp::Add => {
                let value = first_value(op)?;
                let parent = path.rsplit_once('/').map(|(p, _)| p).unwrap_or_default();
                let current = doc
                    .pointer(parent)
                    .and_then(|v| v.as_array())
                    .cloned()
                    .unwrap_or_default();
                if current.contains(&value) {
                    return Ok(());
                }
                add_value(doc, path, value)
            }
            PatchOp::Replace => replace_value(doc, path, first_value(op)?),
            PatchOp::Remove => remove_value(doc, path),
        };
    }

    // /data, /meta and their subtrees
    match op.op {
        PatchOp::Add => add_value(doc, path, first_value(op)?),
        PatchOp::Replace => replace_value(doc, path, first_value(op)?),
        PatchOp::Remove => remove_value(doc, path),
    }
}

/// Rejects documents whose governance arrays were emptied by a patch.
pub fn guard_governance(doc: &Value) -> Result<()> {
    let empty = |path: &str| {
        doc.pointer(path)
            .and_then(|v| v.as_array())
            .map(|a| a.is_empty())
            .unwrap_or(true)
    };
    if empty("/acl/viewers") {
        return Err(Error::bad_request("Cannot remove all acl viewers", "Cannot delete"));
    }
    if empty("/acl/owners") {
        return Err(Error::bad_request("Cannot remove all acl owners", "Cannot delete"));
    }
    if empty("/legal/legaltags") {
        return Err(Error::bad_request("Cannot remove all legaltags", "Cannot delete"));
    }
    Ok(())
}

/// Applies governance ops to record metadata, stamping the modifier.
/// `version_paths` is never touched.
pub fn update_metadata_for_patch(
    metadata: &RecordMetadata,
    ops: &[PatchOperation],
    user: &str,
    now: i64,
) -> Result<RecordMetadata> {
    let mut doc = serde_json::to_value(metadata)
        .map_err(|e| Error::internal("Internal server error", e.to_string()))?;
    apply_ops_to_document(&mut doc, ops)?;
    guard_governance(&doc)?;
    let mut updated: RecordMetadata = serde_json::from_value(doc)
        .map_err(|e| Error::bad_request("Validation error", e.to_string()))?;
    updated.modify_user = Some(user.to_string());
    updated.modify_time = Some(now);
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use record_common::{Acl, Legal};
    use serde_json::json;

    fn op(op: PatchOp, path: &str, values: &[Value]) -> PatchOperation {
        PatchOperation {
            op,
            path: path.into(),
            value: values.to_vec(),
        }
    }

    fn metadata() -> RecordMetadata {
        let mut meta = RecordMetadata {
            id: "tenant1:well:1".into(),
            kind: "tenant1:src:well:1.0.0".into(),
            previous_version_kind: None,
            acl: Acl {
                viewers: vec!["viewers@tenant1".into()],
                owners: vec!["owners@tenant1".into()],
            },
            legal: Legal {
                legaltags: vec!["tag-a".into()],
                other_relevant_data_countries: vec![],
            },
            tags: [("env".to_string(), "dev".to_string())].into(),
            ancestry: None,
            status: RecordState::Active,
            user: "creator".into(),
            create_time: 1,
            modify_user: None,
            modify_time: None,
            hash: None,
            version_paths: vec!["tenant1:src:well:1.0.0/tenant1:well:1/100".into()],
        };
        meta.add_version(200);
        meta
    }

    #[test]
    fn should_reject_remove_of_whole_governance_array() {
        // given
        let ops = [op(PatchOp::Remove, "/acl/viewers", &[])];

        // when
        let err = validate_patch_operations(&ops, &Config::default()).unwrap_err();

        // then
        assert_eq!(err.message, INVALID_PATCH_PATH_FOR_REMOVE_OPERATION);
    }

    #[test]
    fn should_reject_non_replace_op_on_kind() {
        // given
        let ops = [op(PatchOp::Add, "/kind", &[json!("tenant1:src:well:2.0.0")])];

        // when
        let err = validate_patch_operations(&ops, &Config::default()).unwrap_err();

        // then
        assert_eq!(err.message, INVALID_PATCH_OPERATION_TYPE_FOR_KIND);
    }

    #[test]
    fn should_reject_unknown_path_start() {
        // given
        let ops = [op(PatchOp::Add, "/status", &[json!("deleted")])];

        // when
        let err = validate_patch_operations(&ops, &Config::default()).unwrap_err();

        // then
        assert_eq!(err.message, INVALID_PATCH_PATH_START);
    }

    #[test]
    fn should_drop_duplicate_op_path_pairs() {
        // given
        let ops = vec![
            op(PatchOp::Add, "/acl/viewers", &[json!("a@tenant1")]),
            op(PatchOp::Add, "/acl/viewers", &[json!("b@tenant1")]),
            op(PatchOp::Remove, "/tags/env", &[]),
        ];

        // when
        let deduped = dedup_operations(ops);

        // then
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].value, vec![json!("a@tenant1")]);
    }

    #[test]
    fn should_append_on_add_to_whole_array_and_skip_duplicates() {
        // given
        let meta = metadata();
        let ops = [op(
            PatchOp::Add,
            "/acl/viewers",
            &[json!("viewers@tenant1"), json!("extra@tenant1")],
        )];

        // when
        let updated = update_metadata_for_patch(&meta, &ops, "editor", 42).unwrap();

        // then
        assert_eq!(
            updated.acl.viewers,
            vec!["viewers@tenant1".to_string(), "extra@tenant1".to_string()]
        );
        assert_eq!(updated.modify_user.as_deref(), Some("editor"));
        assert_eq!(updated.modify_time, Some(42));
    }

    #[test]
    fn should_replace_whole_array_on_replace() {
        // given
        let meta = metadata();
        let ops = [op(
            PatchOp::Replace,
            "/legal/legaltags",
            &[json!("tag-b"), json!("tag-c")],
        )];

        // when
        let updated = update_metadata_for_patch(&meta, &ops, "editor", 42).unwrap();

        // then
        assert_eq!(
            updated.legal.legaltags,
            vec!["tag-b".to_string(), "tag-c".to_string()]
        );
    }

    #[test]
    fn should_update_tags_from_key_value_strings() {
        // given
        let meta = metadata();
        let ops = [
            op(PatchOp::Replace, "/tags", &[json!("env:prod")]),
            op(PatchOp::Add, "/tags", &[json!("team:subsurface")]),
        ];

        // when
        let updated = update_metadata_for_patch(&meta, &ops, "editor", 42).unwrap();

        // then
        assert_eq!(updated.tags["env"], "prod");
        assert_eq!(updated.tags["team"], "subsurface");
    }

    #[test]
    fn should_never_touch_version_paths() {
        // given
        let meta = metadata();
        let ops = [op(PatchOp::Replace, "/kind", &[json!("tenant1:src:well:2.0.0")])];

        // when
        let updated = update_metadata_for_patch(&meta, &ops, "editor", 42).unwrap();

        // then
        assert_eq!(updated.version_paths, meta.version_paths);
        assert_eq!(updated.kind, "tenant1:src:well:2.0.0");
    }

    #[test]
    fn should_refuse_to_empty_owner_acl() {
        // given
        let meta = metadata();
        let ops = [op(PatchOp::Remove, "/acl/owners/0", &[])];

        // when
        let err = update_metadata_for_patch(&meta, &ops, "editor", 42).unwrap_err();

        // then
        assert_eq!(err.reason, "Cannot remove all acl owners");
        assert_eq!(err.message, "Cannot delete");
    }

    #[test]
    fn should_create_ancestry_block_on_add() {
        // given
        let meta = metadata();
        let ops = [op(
            PatchOp::Add,
            "/ancestry/parents",
            &[json!("tenant1:well:parent:100")],
        )];

        // when
        let updated = update_metadata_for_patch(&meta, &ops, "editor", 42).unwrap();

        // then
        assert_eq!(
            updated.ancestry.unwrap().parents,
            vec!["tenant1:well:parent:100".to_string()]
        );
    }

    #[test]
    fn should_detect_data_and_meta_updates() {
        assert!(is_data_or_meta_update(&[op(
            PatchOp::Replace,
            "/data/props/depth",
            &[json!(100)]
        )]));
        assert!(!is_data_or_meta_update(&[op(
            PatchOp::Replace,
            "/tags",
            &[json!("a:b")]
        )]));
    }
}
