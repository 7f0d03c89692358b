//! Change-notification replay over the record corpus.
//!
//! A replay request fans out into one message per kind. Each message
//! re-publishes change notifications for a page of records and then
//! re-enqueues itself with a continuation cursor until the kind is
//! exhausted. Progress is tracked in per-kind status rows plus one
//! overall row keyed by the replay id alone.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use record_common::{OperationType, QueryRepository, StorageResult};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::audit::AuditLogger;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::messaging::{MessageBus, MessageHeaders, RecordChanged};

pub const REPLAY_OPERATION: &str = "replay";
pub const REINDEX_OPERATION: &str = "reindex";
pub const VALID_REPLAY_OPERATIONS: [&str; 2] = [REPLAY_OPERATION, REINDEX_OPERATION];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplayType {
    ReplayAll,
    ReplayKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplayState {
    Queued,
    InProgress,
    Failed,
    Completed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayFilter {
    pub kinds: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayRequest {
    pub replay_id: String,
    pub operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<ReplayFilter>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayResponse {
    pub replay_id: String,
}

/// Body of one replay work item: a kind, its total, and how far the
/// paging has come.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayData {
    pub id: String,
    pub replay_id: String,
    pub kind: String,
    pub operation: String,
    pub replay_type: ReplayType,
    pub total_count: u64,
    pub completion_count: u64,
    pub start_at_timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayMessage {
    pub headers: MessageHeaders,
    pub body: ReplayData,
}

/// Status row. The overall row has `kind: None`; per-kind rows carry
/// their kind and progress counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayMetaData {
    pub id: String,
    pub replay_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub operation: String,
    pub total_records: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_records: Option<u64>,
    pub state: ReplayState,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<ReplayFilter>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayStatus {
    pub kind: String,
    pub state: ReplayState,
    pub total_records: u64,
    pub processed_records: u64,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_time: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayStatusResponse {
    pub replay_id: String,
    pub operation: String,
    pub overall_state: ReplayState,
    pub total_records: u64,
    pub processed_records: u64,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<ReplayFilter>,
    pub status: Vec<ReplayStatus>,
}

#[async_trait]
pub trait ReplayRepository: Send + Sync {
    /// Every status row of a replay, overall row first.
    async fn get_replay_status(&self, replay_id: &str) -> StorageResult<Vec<ReplayMetaData>>;

    async fn get_replay_status_by_kind(
        &self,
        kind: &str,
        replay_id: &str,
    ) -> StorageResult<Option<ReplayMetaData>>;

    async fn save(&self, row: ReplayMetaData) -> StorageResult<()>;
}

/// Status rows in a sorted map keyed by `(replay_id, kind)`; the
/// overall row sorts first under the empty kind.
#[derive(Default)]
pub struct InMemoryReplayRepository {
    rows: RwLock<BTreeMap<(String, String), ReplayMetaData>>,
}

impl InMemoryReplayRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReplayRepository for InMemoryReplayRepository {
    async fn get_replay_status(&self, replay_id: &str) -> StorageResult<Vec<ReplayMetaData>> {
        let rows = self.rows.read().await;
        Ok(rows
            .iter()
            .filter(|((id, _), _)| id == replay_id)
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn get_replay_status_by_kind(
        &self,
        kind: &str,
        replay_id: &str,
    ) -> StorageResult<Option<ReplayMetaData>> {
        let key = (replay_id.to_string(), kind.to_string());
        Ok(self.rows.read().await.get(&key).cloned())
    }

    async fn save(&self, row: ReplayMetaData) -> StorageResult<()> {
        let key = (
            row.replay_id.clone(),
            row.kind.clone().unwrap_or_default(),
        );
        self.rows.write().await.insert(key, row);
        Ok(())
    }
}

/// Correlation id chain: the kick-off derives `<base>_kind_<n>_SEQ_0`
/// per kind (base truncated to 64 characters), continuations bump the
/// sequence number.
pub fn next_correlation_id(correlation_id: &str, kind_counter: Option<usize>) -> String {
    if let Some(n) = kind_counter {
        let end = correlation_id
            .char_indices()
            .map(|(i, _)| i)
            .nth(64)
            .unwrap_or(correlation_id.len());
        return format!("{}_kind_{n}_SEQ_0", &correlation_id[..end]);
    }
    match correlation_id.split_once("_SEQ_") {
        Some((base, seq)) => {
            let next = seq.parse::<u64>().map(|s| s + 1).unwrap_or(1);
            format!("{base}_SEQ_{next}")
        }
        None => format!("{correlation_id}_SEQ_1"),
    }
}

fn format_elapsed(elapsed_millis: i64) -> String {
    let seconds = elapsed_millis.max(0) / 1000;
    let minutes = seconds / 60;
    let hours = minutes / 60;
    format!("{hours}h {}m {}s", minutes % 60, seconds % 60)
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

pub struct ReplayOrchestrator {
    replay_repository: Arc<dyn ReplayRepository>,
    query_repository: Arc<dyn QueryRepository>,
    bus: Arc<dyn MessageBus>,
    audit: AuditLogger,
    clock: Arc<dyn record_common::Clock>,
    config: Config,
}

impl ReplayOrchestrator {
    pub fn new(
        replay_repository: Arc<dyn ReplayRepository>,
        query_repository: Arc<dyn QueryRepository>,
        bus: Arc<dyn MessageBus>,
        clock: Arc<dyn record_common::Clock>,
        config: Config,
    ) -> Self {
        Self {
            replay_repository,
            query_repository,
            bus,
            audit: AuditLogger::new(),
            clock,
            config,
        }
    }

    /// Validates and kicks off a replay: saves the status rows and
    /// publishes one work item per kind. A publish failure here fails
    /// the whole request.
    pub async fn handle_replay_request(
        &self,
        request: &ReplayRequest,
        correlation_id: &str,
    ) -> Result<ReplayResponse> {
        if !VALID_REPLAY_OPERATIONS.contains(&request.operation.as_str()) {
            return Err(Error::bad_request(
                "Validation Error",
                format!(
                    "Not a valid operation. The valid operations are: {VALID_REPLAY_OPERATIONS:?}"
                ),
            ));
        }

        let kinds = request
            .filter
            .as_ref()
            .map(|f| f.kinds.clone())
            .unwrap_or_default();
        let replay_type = if kinds.is_empty() {
            ReplayType::ReplayAll
        } else {
            ReplayType::ReplayKind
        };
        let counts: BTreeMap<String, u64> = if kinds.is_empty() {
            self.query_repository.get_active_records_count().await?
        } else {
            self.query_repository
                .get_active_records_count_for_kinds(&kinds)
                .await?
        };
        if counts.is_empty() {
            return Err(Error::bad_request(
                "Kind is invalid.",
                "The requested kind does not exist.",
            ));
        }

        let started_millis = self.clock.now_millis();
        let started_at = millis_to_datetime(started_millis);
        let mut messages = Vec::new();
        let mut kind_rows = Vec::new();
        for (kind_counter, (kind, total)) in counts.iter().enumerate() {
            let body = ReplayData {
                id: Uuid::new_v4().to_string(),
                replay_id: request.replay_id.clone(),
                kind: kind.clone(),
                operation: request.operation.clone(),
                replay_type,
                total_count: *total,
                completion_count: 0,
                start_at_timestamp: started_millis,
                cursor: None,
            };
            kind_rows.push(ReplayMetaData {
                id: body.id.clone(),
                replay_id: request.replay_id.clone(),
                kind: Some(kind.clone()),
                operation: request.operation.clone(),
                total_records: *total,
                processed_records: Some(0),
                state: ReplayState::Queued,
                started_at,
                elapsed_time: None,
                filter: None,
            });
            messages.push(ReplayMessage {
                headers: MessageHeaders::new(
                    &self.config.tenant,
                    next_correlation_id(correlation_id, Some(kind_counter)),
                ),
                body,
            });
        }

        let overall = ReplayMetaData {
            id: Uuid::new_v4().to_string(),
            replay_id: request.replay_id.clone(),
            kind: None,
            operation: request.operation.clone(),
            total_records: counts.values().sum(),
            processed_records: None,
            state: ReplayState::Queued,
            started_at,
            elapsed_time: None,
            filter: request.filter.clone(),
        };

        let kicked_off = async {
            self.replay_repository.save(overall).await?;
            for row in kind_rows {
                self.replay_repository.save(row).await?;
            }
            let headers = MessageHeaders::new(&self.config.tenant, correlation_id.to_string());
            self.bus.publish_replay(&headers, &messages).await
        }
        .await;
        if let Err(e) = kicked_off {
            tracing::error!(replay_id = %request.replay_id, error = %e, "replay kick-off failed");
            self.audit
                .create_replay_request_fail(&request.replay_id, &request.operation);
            return Err(Error::internal(
                "The exception occurred during the start replay operation.",
                "Request could not be processed due to an internal server issue.",
            ));
        }
        self.audit
            .create_replay_request_success(&request.replay_id, &request.operation);
        Ok(ReplayResponse {
            replay_id: request.replay_id.clone(),
        })
    }

    /// One unit of replay work: republish notifications for a page of
    /// records, track progress, and re-enqueue when a cursor remains.
    pub async fn process_replay_message(&self, message: &ReplayMessage) -> Result<()> {
        let body = &message.body;
        let (ids_and_kinds, cursor) = self.record_page(body).await?;

        let changed: Vec<RecordChanged> = ids_and_kinds
            .iter()
            .map(|(id, kind)| RecordChanged::upsert(id, kind, OperationType::Create, None))
            .collect();
        if !changed.is_empty() {
            self.bus.publish(&message.headers, &changed).await?;
        }

        let processed = body.completion_count + ids_and_kinds.len() as u64;
        let state = if cursor.is_none() {
            ReplayState::Completed
        } else {
            ReplayState::InProgress
        };
        let elapsed = self.clock.now_millis() - body.start_at_timestamp;
        self.replay_repository
            .save(ReplayMetaData {
                id: body.id.clone(),
                replay_id: body.replay_id.clone(),
                kind: Some(body.kind.clone()),
                operation: body.operation.clone(),
                total_records: body.total_count,
                processed_records: Some(processed),
                state,
                started_at: millis_to_datetime(body.start_at_timestamp),
                elapsed_time: Some(format_elapsed(elapsed)),
                filter: None,
            })
            .await?;
        tracing::info!(
            replay_id = %body.replay_id,
            kind = %body.kind,
            ?state,
            processed,
            total = body.total_count,
            "replay progress"
        );

        let Some(cursor) = cursor else {
            return Ok(());
        };
        let next = ReplayMessage {
            headers: MessageHeaders::new(
                &self.config.tenant,
                next_correlation_id(&message.headers.correlation_id, None),
            ),
            body: ReplayData {
                completion_count: processed,
                cursor: Some(cursor),
                ..body.clone()
            },
        };
        self.bus
            .publish_replay(&message.headers, &[next])
            .await
            .map_err(Error::from)
    }

    /// Marks the kind of a failed work item as failed.
    pub async fn process_failure(&self, message: &ReplayMessage) -> Result<()> {
        let body = &message.body;
        let Some(mut row) = self
            .replay_repository
            .get_replay_status_by_kind(&body.kind, &body.replay_id)
            .await?
        else {
            return Err(Error::not_found(
                "Replay ID does not exist.",
                format!("The replay ID {} is invalid.", body.replay_id),
            ));
        };
        row.state = ReplayState::Failed;
        self.replay_repository.save(row).await?;
        self.audit
            .create_replay_request_fail(&body.replay_id, &body.operation);
        tracing::error!(replay_id = %body.replay_id, kind = %body.kind, "replay failed");
        Ok(())
    }

    /// Aggregates the per-kind rows into one response. Overall state:
    /// queued until any kind starts, failed dominates, in-progress
    /// otherwise, completed only when every kind is done.
    pub async fn get_replay_status(&self, replay_id: &str) -> Result<ReplayStatusResponse> {
        let rows = self.replay_repository.get_replay_status(replay_id).await?;
        if rows.is_empty() {
            return Err(Error::not_found(
                "Replay ID does not exist.",
                format!("The replay ID {replay_id} is invalid."),
            ));
        }

        let mut response = ReplayStatusResponse {
            replay_id: replay_id.to_string(),
            operation: String::new(),
            overall_state: ReplayState::Queued,
            total_records: 0,
            processed_records: 0,
            started_at: DateTime::<Utc>::UNIX_EPOCH,
            filter: None,
            status: Vec::new(),
        };
        let mut all_queued = true;
        let mut has_failed = false;
        let mut has_in_progress = false;
        for row in rows {
            match row.kind {
                None => {
                    response.operation = row.operation;
                    response.filter = row.filter;
                    response.total_records = row.total_records;
                    response.started_at = row.started_at;
                }
                Some(kind) => {
                    response.processed_records += row.processed_records.unwrap_or(0);
                    response.status.push(ReplayStatus {
                        kind,
                        state: row.state,
                        total_records: row.total_records,
                        processed_records: row.processed_records.unwrap_or(0),
                        started_at: row.started_at,
                        elapsed_time: row.elapsed_time,
                    });
                    match row.state {
                        ReplayState::Failed => {
                            has_failed = true;
                            all_queued = false;
                        }
                        ReplayState::InProgress => {
                            has_in_progress = true;
                            all_queued = false;
                        }
                        ReplayState::Completed => all_queued = false,
                        ReplayState::Queued => {}
                    }
                }
            }
        }
        response.overall_state = if all_queued {
            ReplayState::Queued
        } else if has_failed {
            ReplayState::Failed
        } else if has_in_progress {
            ReplayState::InProgress
        } else {
            ReplayState::Completed
        };
        Ok(response)
    }

    async fn record_page(
        &self,
        body: &ReplayData,
    ) -> Result<(Vec<(String, String)>, Option<String>)> {
        let page_size = self.config.replay_batch_size;
        match body.replay_type {
            ReplayType::ReplayKind => {
                let (ids, cursor) = self
                    .query_repository
                    .get_all_record_ids_from_kind(&body.kind, page_size, body.cursor.clone())
                    .await?;
                let pairs = ids.into_iter().map(|id| (id, body.kind.clone())).collect();
                Ok((pairs, cursor))
            }
            ReplayType::ReplayAll => Ok(self
                .query_repository
                .get_all_record_ids_and_kind(page_size, body.cursor.clone())
                .await?),
        }
    }
}
