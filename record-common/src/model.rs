//! Shared record model.
//!
//! A record is an opaque JSON `data` document plus governance metadata
//! (ACLs, legal tags, tags, ancestry). Every write creates an immutable
//! version; `RecordMetadata::version_paths` keeps the ordered list of
//! version blob paths, oldest first, with the last entry being the
//! current version.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Access control lists attached to a record.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Acl {
    pub viewers: Vec<String>,
    pub owners: Vec<String>,
}

/// Legal compliance block. `legaltags` must never be emptied by a
/// mutation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Legal {
    pub legaltags: Vec<String>,
    #[serde(default)]
    pub other_relevant_data_countries: Vec<String>,
}

/// Parent record references, each formatted as `"{id}:{version}"`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RecordAncestry {
    pub parents: Vec<String>,
}

/// Lifecycle state of a record. Soft-deleted records keep their
/// versions and can be recovered; purged records are gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordState {
    Active,
    Deleted,
}

/// The kind of change applied to a record, as reported on the message
/// bus and fed to authorization policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Update,
    Delete,
    Purge,
}

/// A record as submitted by a producer or returned to a consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// `<tenant>:<kindSubType>:<uniqueId>`. Absent on input when the
    /// server should mint one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub kind: String,
    pub acl: Acl,
    pub legal: Legal,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ancestry: Option<RecordAncestry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
}

impl Record {
    /// The entity component of a kind, e.g. `"wellbore"` in
    /// `"tenant:source:wellbore:1.0.0"`.
    pub fn kind_sub_type(kind: &str) -> Option<&str> {
        kind.split(':').nth(2)
    }

    /// Mints a server-side record id for the given tenant and kind.
    pub fn mint_id(tenant: &str, kind: &str) -> String {
        let sub_type = Self::kind_sub_type(kind).unwrap_or_default();
        format!("{tenant}:{sub_type}:{}", Uuid::new_v4())
    }

    pub fn id_str(&self) -> &str {
        self.id.as_deref().unwrap_or_default()
    }
}

/// Hex SHA-256 digests of a version's `data` and `meta` bodies, used to
/// skip duplicate writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordHash {
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<String>,
}

/// Authoritative per-record state, persisted by the metadata
/// repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMetadata {
    pub id: String,
    pub kind: String,
    /// Set when an update changed the record's kind; the kind the
    /// previous version was written under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_version_kind: Option<String>,
    pub acl: Acl,
    pub legal: Legal,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ancestry: Option<RecordAncestry>,
    pub status: RecordState,
    /// Original creator; never overwritten by updates.
    pub user: String,
    pub create_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modify_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modify_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<RecordHash>,
    /// Ordered `"{kind}/{id}/{version}"` entries, oldest first. The
    /// last entry is the current version and is never deleted by a
    /// version purge.
    #[serde(default)]
    pub version_paths: Vec<String>,
}

impl RecordMetadata {
    /// Fresh metadata for a record being created, with no versions yet.
    pub fn new_from_record(record: &Record, user: &str, create_time: i64) -> Self {
        Self {
            id: record.id_str().to_string(),
            kind: record.kind.clone(),
            previous_version_kind: None,
            acl: record.acl.clone(),
            legal: record.legal.clone(),
            tags: record.tags.clone(),
            ancestry: record.ancestry.clone(),
            status: RecordState::Active,
            user: user.to_string(),
            create_time,
            modify_user: None,
            modify_time: None,
            hash: None,
            version_paths: Vec::new(),
        }
    }

    pub fn version_path(&self, version: i64) -> String {
        format!("{}/{}/{}", self.kind, self.id, version)
    }

    pub fn add_version(&mut self, version: i64) {
        let path = self.version_path(version);
        self.version_paths.push(path);
    }

    /// Version number of the last (current) entry in `version_paths`.
    pub fn latest_version(&self) -> Option<i64> {
        self.version_paths
            .last()
            .and_then(|p| p.rsplit('/').next())
            .and_then(|v| v.parse().ok())
    }

    pub fn has_version(&self, version: i64) -> bool {
        let suffix = format!("/{version}");
        self.version_paths.iter().any(|p| p.ends_with(&suffix))
    }

    /// All version numbers, oldest first.
    pub fn version_ids(&self) -> Vec<i64> {
        self.version_paths
            .iter()
            .filter_map(|p| p.rsplit('/').next())
            .filter_map(|v| v.parse().ok())
            .collect()
    }
}

/// One version's stored body.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RecordData {
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

/// A single record write within an ingestion batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordProcessing {
    pub operation_type: OperationType,
    pub record_metadata: RecordMetadata,
    pub record_data: RecordData,
    /// Metadata as it stood before this batch. Restored verbatim when
    /// the batch rolls back; `None` for creates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior_metadata: Option<RecordMetadata>,
}

/// Summary of an ingestion batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferInfo {
    pub user: String,
    pub record_count: usize,
    /// Batch timestamp; the version number assigned to every record
    /// written by this batch.
    pub version: i64,
    #[serde(default)]
    pub record_ids: Vec<String>,
    #[serde(default)]
    pub record_id_versions: Vec<String>,
    #[serde(default)]
    pub skipped_record_ids: Vec<String>,
}

/// The unit handed to the persistence layer: batch summary plus the
/// per-record writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferBatch {
    pub transfer_info: TransferInfo,
    pub records: Vec<RecordProcessing>,
}

/// Namespacing context for collaboration workspaces. Never persisted
/// inside records; used only to prefix storage keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollaborationContext {
    pub id: Uuid,
    pub application: String,
}
