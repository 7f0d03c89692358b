//! Content digests used by the ingestion dedup path.

use record_common::{BlobStore, RecordData, RecordHash, RecordMetadata, StorageError};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::Result;

fn digest_value(value: &Value) -> String {
    let digest = Sha256::digest(value.to_string().as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Hex SHA-256 digests of a version body's `data` and `meta` parts.
pub fn hash_record_data(body: &RecordData) -> RecordHash {
    RecordHash {
        data: digest_value(&body.data),
        meta: body.meta.as_ref().map(digest_value),
    }
}

/// Returns the stored hash, computing and backfilling it from the
/// latest version body when metadata predates hashing. `None` when the
/// record has no readable version to hash.
pub async fn ensure_hash(
    metadata: &RecordMetadata,
    blob_store: &dyn BlobStore,
) -> Result<Option<RecordHash>> {
    if let Some(hash) = &metadata.hash {
        return Ok(Some(hash.clone()));
    }
    let Some(version) = metadata.latest_version() else {
        return Ok(None);
    };
    match blob_store.read(metadata, version, false).await {
        Ok(body) => Ok(Some(hash_record_data(&body))),
        Err(StorageError::NotFound(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}
