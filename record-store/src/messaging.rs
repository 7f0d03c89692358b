//! Change-notification messages and the bus they go out on.
//!
//! Two message shapes exist: the flat legacy shape, published only for
//! operations outside any collaboration context, and the richer
//! versioned shape published whenever collaboration messaging is
//! enabled. Publishing is at-most-once and best-effort; engines log
//! and swallow publish failures after a successful commit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use record_common::{CollaborationContext, OperationType, StorageError, StorageResult};
use serde::{Deserialize, Serialize};

use crate::replay::ReplayMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeletionType {
    Soft,
    Hard,
}

/// Per-request message attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeaders {
    pub data_partition_id: String,
    pub correlation_id: String,
}

impl MessageHeaders {
    pub fn new(data_partition_id: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self {
            data_partition_id: data_partition_id.into(),
            correlation_id: correlation_id.into(),
        }
    }
}

/// Legacy flat change message. For version purges `id` is the
/// composite `"{id}/{version}"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordChanged {
    pub id: String,
    pub kind: String,
    pub op: OperationType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_version_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_type: Option<DeletionType>,
}

impl RecordChanged {
    pub fn upsert(
        id: impl Into<String>,
        kind: impl Into<String>,
        op: OperationType,
        previous_version_kind: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            op,
            previous_version_kind,
            deletion_type: None,
        }
    }

    pub fn deleted(
        id: impl Into<String>,
        kind: impl Into<String>,
        deletion_type: DeletionType,
    ) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            op: OperationType::Delete,
            previous_version_kind: None,
            deletion_type: Some(deletion_type),
        }
    }
}

/// Collaboration-aware change message, one per record version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordChangedV2 {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_by: Option<String>,
    pub kind: String,
    pub op: OperationType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_version_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_type: Option<DeletionType>,
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(
        &self,
        headers: &MessageHeaders,
        messages: &[RecordChanged],
    ) -> StorageResult<()>;

    async fn publish_v2(
        &self,
        ctx: Option<&CollaborationContext>,
        headers: &MessageHeaders,
        messages: &[RecordChangedV2],
    ) -> StorageResult<()>;

    async fn publish_replay(
        &self,
        headers: &MessageHeaders,
        messages: &[ReplayMessage],
    ) -> StorageResult<()>;
}

/// Captures published messages for assertions; failure injection for
/// the replay kick-off path.
#[derive(Default)]
pub struct InMemoryMessageBus {
    legacy: Mutex<Vec<RecordChanged>>,
    v2: Mutex<Vec<(Option<CollaborationContext>, RecordChangedV2)>>,
    replay: Mutex<Vec<ReplayMessage>>,
    fail_next_replay: AtomicBool,
}

impl InMemoryMessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn legacy_messages(&self) -> Vec<RecordChanged> {
        self.legacy.lock().unwrap().clone()
    }

    pub fn v2_messages(&self) -> Vec<(Option<CollaborationContext>, RecordChangedV2)> {
        self.v2.lock().unwrap().clone()
    }

    pub fn replay_messages(&self) -> Vec<ReplayMessage> {
        self.replay.lock().unwrap().clone()
    }

    pub fn take_replay_messages(&self) -> Vec<ReplayMessage> {
        std::mem::take(&mut self.replay.lock().unwrap())
    }

    pub fn fail_next_replay_publish(&self) {
        self.fail_next_replay.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessageBus for InMemoryMessageBus {
    async fn publish(
        &self,
        _headers: &MessageHeaders,
        messages: &[RecordChanged],
    ) -> StorageResult<()> {
        self.legacy.lock().unwrap().extend_from_slice(messages);
        Ok(())
    }

    async fn publish_v2(
        &self,
        ctx: Option<&CollaborationContext>,
        _headers: &MessageHeaders,
        messages: &[RecordChangedV2],
    ) -> StorageResult<()> {
        let mut v2 = self.v2.lock().unwrap();
        for message in messages {
            v2.push((ctx.cloned(), message.clone()));
        }
        Ok(())
    }

    async fn publish_replay(
        &self,
        _headers: &MessageHeaders,
        messages: &[ReplayMessage],
    ) -> StorageResult<()> {
        if self.fail_next_replay.swap(false, Ordering::SeqCst) {
            return Err(StorageError::Backend("injected publish failure".into()));
        }
        self.replay.lock().unwrap().extend_from_slice(messages);
        Ok(())
    }
}
