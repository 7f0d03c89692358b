//! Storage capabilities consumed by the record engines.
//!
//! The engines never talk to a concrete backend; they hold
//! `Arc<dyn MetadataRepository>` / `Arc<dyn BlobStore>` /
//! `Arc<dyn QueryRepository>` and the embedder decides what sits
//! behind them. The in-memory implementations in [`in_memory`] back
//! the test suites and the default wiring.

pub mod in_memory;

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{CollaborationContext, RecordData, RecordMetadata, RecordProcessing};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("blob not found: {0}")]
    NotFound(String),
    #[error("storage backend failure: {0}")]
    Backend(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Authoritative record metadata store. All methods take the optional
/// collaboration context; implementations namespace their keys with it.
#[async_trait]
pub trait MetadataRepository: Send + Sync {
    /// Batch fetch. The returned map is keyed by the namespaced
    /// storage key; absent ids are simply missing from the map.
    async fn get_batch(
        &self,
        ids: &[String],
        ctx: Option<&CollaborationContext>,
    ) -> StorageResult<HashMap<String, RecordMetadata>>;

    async fn get(
        &self,
        id: &str,
        ctx: Option<&CollaborationContext>,
    ) -> StorageResult<Option<RecordMetadata>>;

    /// Upserts a batch. Ids the backend refused to persist (optimistic
    /// concurrency conflicts) are returned; they are a data-driven
    /// outcome, not an error, and the rest of the batch still commits.
    async fn create_or_update(
        &self,
        records: Vec<RecordMetadata>,
        ctx: Option<&CollaborationContext>,
    ) -> StorageResult<Vec<String>>;

    async fn delete(&self, id: &str, ctx: Option<&CollaborationContext>) -> StorageResult<()>;
}

/// Immutable version bodies, addressed by `"{kind}/{id}/{version}"`
/// paths taken from `RecordMetadata::version_paths`.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn read(
        &self,
        metadata: &RecordMetadata,
        version: i64,
        data_only: bool,
    ) -> StorageResult<RecordData>;

    async fn write(&self, records: &[RecordProcessing]) -> StorageResult<()>;

    /// Removes every version body of the record.
    async fn delete(&self, metadata: &RecordMetadata) -> StorageResult<()>;

    async fn delete_versions(&self, paths: &[String]) -> StorageResult<()>;

    /// Backend-level access probe used by the entitlements-backed
    /// authorization path.
    async fn has_access(&self, metadata: &[RecordMetadata]) -> StorageResult<bool>;
}

/// Read-side index over record metadata, used by replay.
#[async_trait]
pub trait QueryRepository: Send + Sync {
    /// Active record count per kind, over all kinds.
    async fn get_active_records_count(&self) -> StorageResult<BTreeMap<String, u64>>;

    async fn get_active_records_count_for_kinds(
        &self,
        kinds: &[String],
    ) -> StorageResult<BTreeMap<String, u64>>;

    /// One page of `(id, kind)` pairs over all active records, with an
    /// opaque continuation cursor.
    async fn get_all_record_ids_and_kind(
        &self,
        page_size: usize,
        cursor: Option<String>,
    ) -> StorageResult<(Vec<(String, String)>, Option<String>)>;

    /// One page of active record ids for a single kind.
    async fn get_all_record_ids_from_kind(
        &self,
        kind: &str,
        page_size: usize,
        cursor: Option<String>,
    ) -> StorageResult<(Vec<String>, Option<String>)>;
}
