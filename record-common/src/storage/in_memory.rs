//! In-memory storage backends for tests and the default wiring.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::model::{
    CollaborationContext, RecordData, RecordMetadata, RecordProcessing, RecordState,
};
use crate::namespace::with_namespace;
use crate::storage::{
    BlobStore, MetadataRepository, QueryRepository, StorageError, StorageResult,
};

/// Metadata repository over a sorted map, keyed by namespaced id.
/// Also serves as the `QueryRepository` since it holds the full index.
#[derive(Default)]
pub struct InMemoryMetadataRepository {
    records: RwLock<BTreeMap<String, RecordMetadata>>,
    locked: RwLock<HashSet<String>>,
}

impl InMemoryMetadataRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a storage key as conflicted; subsequent upserts of it are
    /// reported back as locked instead of applied.
    pub async fn lock(&self, key: &str) {
        self.locked.write().await.insert(key.to_string());
    }

    pub async fn unlock(&self, key: &str) {
        self.locked.write().await.remove(key);
    }
}

#[async_trait]
impl MetadataRepository for InMemoryMetadataRepository {
    async fn get_batch(
        &self,
        ids: &[String],
        ctx: Option<&CollaborationContext>,
    ) -> StorageResult<HashMap<String, RecordMetadata>> {
        let records = self.records.read().await;
        let mut found = HashMap::new();
        for id in ids {
            let key = with_namespace(id, ctx);
            if let Some(meta) = records.get(&key) {
                found.insert(key, meta.clone());
            }
        }
        Ok(found)
    }

    async fn get(
        &self,
        id: &str,
        ctx: Option<&CollaborationContext>,
    ) -> StorageResult<Option<RecordMetadata>> {
        let key = with_namespace(id, ctx);
        Ok(self.records.read().await.get(&key).cloned())
    }

    async fn create_or_update(
        &self,
        records: Vec<RecordMetadata>,
        ctx: Option<&CollaborationContext>,
    ) -> StorageResult<Vec<String>> {
        let locked = self.locked.read().await;
        let mut store = self.records.write().await;
        let mut rejected = Vec::new();
        for meta in records {
            let key = with_namespace(&meta.id, ctx);
            if locked.contains(&key) {
                rejected.push(meta.id);
            } else {
                store.insert(key, meta);
            }
        }
        Ok(rejected)
    }

    async fn delete(&self, id: &str, ctx: Option<&CollaborationContext>) -> StorageResult<()> {
        let key = with_namespace(id, ctx);
        self.records.write().await.remove(&key);
        Ok(())
    }
}

#[async_trait]
impl QueryRepository for InMemoryMetadataRepository {
    async fn get_active_records_count(&self) -> StorageResult<BTreeMap<String, u64>> {
        let records = self.records.read().await;
        let mut counts = BTreeMap::new();
        for meta in records.values() {
            if meta.status == RecordState::Active {
                *counts.entry(meta.kind.clone()).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    async fn get_active_records_count_for_kinds(
        &self,
        kinds: &[String],
    ) -> StorageResult<BTreeMap<String, u64>> {
        let all = self.get_active_records_count().await?;
        Ok(kinds
            .iter()
            .filter_map(|k| all.get(k).map(|c| (k.clone(), *c)))
            .collect())
    }

    async fn get_all_record_ids_and_kind(
        &self,
        page_size: usize,
        cursor: Option<String>,
    ) -> StorageResult<(Vec<(String, String)>, Option<String>)> {
        let records = self.records.read().await;
        let mut page = Vec::new();
        let mut last_key = None;
        for (key, meta) in records.iter() {
            if let Some(after) = &cursor {
                if key <= after {
                    continue;
                }
            }
            if meta.status != RecordState::Active {
                continue;
            }
            page.push((meta.id.clone(), meta.kind.clone()));
            last_key = Some(key.clone());
            if page.len() >= page_size {
                break;
            }
        }
        // the cursor is only returned when another page may exist
        let next = if page.len() >= page_size { last_key } else { None };
        Ok((page, next))
    }

    async fn get_all_record_ids_from_kind(
        &self,
        kind: &str,
        page_size: usize,
        cursor: Option<String>,
    ) -> StorageResult<(Vec<String>, Option<String>)> {
        let records = self.records.read().await;
        let mut page = Vec::new();
        let mut last_key = None;
        for (key, meta) in records.iter() {
            if let Some(after) = &cursor {
                if key <= after {
                    continue;
                }
            }
            if meta.status != RecordState::Active || meta.kind != kind {
                continue;
            }
            page.push(meta.id.clone());
            last_key = Some(key.clone());
            if page.len() >= page_size {
                break;
            }
        }
        let next = if page.len() >= page_size { last_key } else { None };
        Ok((page, next))
    }
}

/// Version bodies keyed by version path, with failure injection hooks
/// for rollback tests.
#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: RwLock<HashMap<String, RecordData>>,
    fail_next_write: AtomicBool,
    fail_next_delete: AtomicBool,
    deny_access: AtomicBool,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_write(&self) {
        self.fail_next_write.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_delete(&self) {
        self.fail_next_delete.store(true, Ordering::SeqCst);
    }

    pub fn deny_access(&self, deny: bool) {
        self.deny_access.store(deny, Ordering::SeqCst);
    }

    pub async fn contains(&self, path: &str) -> bool {
        self.blobs.read().await.contains_key(path)
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn read(
        &self,
        metadata: &RecordMetadata,
        version: i64,
        data_only: bool,
    ) -> StorageResult<RecordData> {
        let path = metadata.version_path(version);
        let blobs = self.blobs.read().await;
        let mut body = blobs
            .get(&path)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(path))?;
        if data_only {
            body.meta = None;
        }
        Ok(body)
    }

    async fn write(&self, records: &[RecordProcessing]) -> StorageResult<()> {
        if self.fail_next_write.swap(false, Ordering::SeqCst) {
            return Err(StorageError::Backend("injected write failure".into()));
        }
        let mut blobs = self.blobs.write().await;
        for processing in records {
            let path = processing
                .record_metadata
                .version_paths
                .last()
                .cloned()
                .ok_or_else(|| {
                    StorageError::Backend(format!(
                        "record {} has no version to write",
                        processing.record_metadata.id
                    ))
                })?;
            blobs.insert(path, processing.record_data.clone());
        }
        Ok(())
    }

    async fn delete(&self, metadata: &RecordMetadata) -> StorageResult<()> {
        if self.fail_next_delete.swap(false, Ordering::SeqCst) {
            return Err(StorageError::Backend("injected delete failure".into()));
        }
        let mut blobs = self.blobs.write().await;
        for path in &metadata.version_paths {
            blobs.remove(path);
        }
        Ok(())
    }

    async fn delete_versions(&self, paths: &[String]) -> StorageResult<()> {
        if self.fail_next_delete.swap(false, Ordering::SeqCst) {
            return Err(StorageError::Backend("injected delete failure".into()));
        }
        let mut blobs = self.blobs.write().await;
        for path in paths {
            blobs.remove(path);
        }
        Ok(())
    }

    async fn has_access(&self, _metadata: &[RecordMetadata]) -> StorageResult<bool> {
        Ok(!self.deny_access.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Acl, Legal, OperationType, Record};
    use serde_json::json;
    use uuid::Uuid;

    fn record(id: &str) -> Record {
        Record {
            id: Some(id.to_string()),
            kind: "tenant1:src:well:1.0.0".into(),
            acl: Acl {
                viewers: vec!["viewers@tenant1".into()],
                owners: vec!["owners@tenant1".into()],
            },
            legal: Legal {
                legaltags: vec!["tag".into()],
                other_relevant_data_countries: vec![],
            },
            data: json!({"x": 1}),
            meta: None,
            tags: Default::default(),
            ancestry: None,
            version: None,
        }
    }

    fn metadata(id: &str) -> RecordMetadata {
        RecordMetadata::new_from_record(&record(id), "user@tenant1.com", 1)
    }

    #[tokio::test]
    async fn should_namespace_keys_per_collaboration_context() {
        // given
        let repo = InMemoryMetadataRepository::new();
        let ctx = CollaborationContext {
            id: Uuid::new_v4(),
            application: "app".into(),
        };
        let id = "tenant1:well:1".to_string();

        // when
        repo.create_or_update(vec![metadata(&id)], Some(&ctx))
            .await
            .unwrap();

        // then
        assert!(repo.get(&id, None).await.unwrap().is_none());
        assert!(repo.get(&id, Some(&ctx)).await.unwrap().is_some());
        let batch = repo.get_batch(&[id.clone()], Some(&ctx)).await.unwrap();
        assert!(batch.contains_key(&with_namespace(&id, Some(&ctx))));
    }

    #[tokio::test]
    async fn should_report_locked_ids_without_applying_them() {
        // given
        let repo = InMemoryMetadataRepository::new();
        repo.lock("tenant1:well:locked").await;

        // when
        let rejected = repo
            .create_or_update(
                vec![metadata("tenant1:well:locked"), metadata("tenant1:well:ok")],
                None,
            )
            .await
            .unwrap();

        // then
        assert_eq!(rejected, vec!["tenant1:well:locked".to_string()]);
        assert!(repo.get("tenant1:well:locked", None).await.unwrap().is_none());
        assert!(repo.get("tenant1:well:ok", None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn should_page_active_records_with_cursor() {
        // given
        let repo = InMemoryMetadataRepository::new();
        for i in 0..5 {
            repo.create_or_update(vec![metadata(&format!("tenant1:well:{i}"))], None)
                .await
                .unwrap();
        }

        // when
        let (first, cursor) = repo.get_all_record_ids_and_kind(3, None).await.unwrap();
        let (second, done) = repo
            .get_all_record_ids_and_kind(3, cursor.clone())
            .await
            .unwrap();

        // then
        assert_eq!(first.len(), 3);
        assert!(cursor.is_some());
        assert_eq!(second.len(), 2);
        assert!(done.is_none());
    }

    #[tokio::test]
    async fn should_read_back_written_version_body() {
        // given
        let store = InMemoryBlobStore::new();
        let mut meta = metadata("tenant1:well:1");
        meta.add_version(100);
        let processing = RecordProcessing {
            operation_type: OperationType::Create,
            record_metadata: meta.clone(),
            record_data: RecordData {
                data: json!({"x": 1}),
                meta: Some(json!([{"unit": "m"}])),
            },
            prior_metadata: None,
        };

        // when
        store.write(&[processing]).await.unwrap();

        // then
        let body = store.read(&meta, 100, false).await.unwrap();
        assert_eq!(body.data, json!({"x": 1}));
        let data_only = store.read(&meta, 100, true).await.unwrap();
        assert!(data_only.meta.is_none());
        assert!(matches!(
            store.read(&meta, 999, false).await,
            Err(StorageError::NotFound(_))
        ));
    }
}
