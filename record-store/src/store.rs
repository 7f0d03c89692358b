//! Store assembly: wires the engines over a set of storage backends.
//!
//! [`RecordStoreBuilder`] defaults every backend to the in-memory
//! implementation; embedders (and tests) inject their own by handing
//! in trait objects before `build`.

use std::sync::Arc;

use record_common::{
    BlobStore, Clock, InMemoryBlobStore, InMemoryMetadataRepository, MetadataRepository,
    QueryRepository, SystemClock,
};

use crate::authorization::{
    AuthorizationGate, EntitlementsService, GroupEntitlements, PolicyService,
};
use crate::config::Config;
use crate::delete::SoftDeleteEngine;
use crate::ingestion::IngestionEngine;
use crate::merge_patch::MergePatchEngine;
use crate::messaging::{InMemoryMessageBus, MessageBus};
use crate::patch::PatchEngine;
use crate::persistence::PersistenceService;
use crate::purge::PurgeEngine;
use crate::query::QueryEngine;
use crate::replay::{InMemoryReplayRepository, ReplayOrchestrator, ReplayRepository};

pub struct RecordStoreBuilder {
    config: Config,
    clock: Option<Arc<dyn Clock>>,
    repository: Option<Arc<dyn MetadataRepository>>,
    query_repository: Option<Arc<dyn QueryRepository>>,
    blob_store: Option<Arc<dyn BlobStore>>,
    bus: Option<Arc<dyn MessageBus>>,
    replay_repository: Option<Arc<dyn ReplayRepository>>,
    entitlements: Option<Arc<dyn EntitlementsService>>,
    policy: Option<Arc<dyn PolicyService>>,
}

impl RecordStoreBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            clock: None,
            repository: None,
            query_repository: None,
            blob_store: None,
            bus: None,
            replay_repository: None,
            entitlements: None,
            policy: None,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn metadata_repository(mut self, repository: Arc<dyn MetadataRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn query_repository(mut self, repository: Arc<dyn QueryRepository>) -> Self {
        self.query_repository = Some(repository);
        self
    }

    pub fn blob_store(mut self, blob_store: Arc<dyn BlobStore>) -> Self {
        self.blob_store = Some(blob_store);
        self
    }

    pub fn message_bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn replay_repository(mut self, repository: Arc<dyn ReplayRepository>) -> Self {
        self.replay_repository = Some(repository);
        self
    }

    pub fn entitlements(mut self, entitlements: Arc<dyn EntitlementsService>) -> Self {
        self.entitlements = Some(entitlements);
        self
    }

    pub fn policy(mut self, policy: Arc<dyn PolicyService>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn build(self) -> RecordStore {
        let config = self.config;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let (repository, query_repository): (Arc<dyn MetadataRepository>, Arc<dyn QueryRepository>) =
            match (self.repository, self.query_repository) {
                (Some(r), Some(q)) => (r, q),
                (Some(r), None) => (r, Arc::new(InMemoryMetadataRepository::new())),
                (None, query) => {
                    let shared = Arc::new(InMemoryMetadataRepository::new());
                    match query {
                        Some(q) => (shared, q),
                        None => (shared.clone(), shared),
                    }
                }
            };
        let blob_store = self
            .blob_store
            .unwrap_or_else(|| Arc::new(InMemoryBlobStore::new()));
        let bus: Arc<dyn MessageBus> = self
            .bus
            .unwrap_or_else(|| Arc::new(InMemoryMessageBus::new()));
        let replay_repository = self
            .replay_repository
            .unwrap_or_else(|| Arc::new(InMemoryReplayRepository::new()) as Arc<dyn ReplayRepository>);
        let entitlements: Arc<dyn EntitlementsService> = self
            .entitlements
            .unwrap_or_else(|| Arc::new(GroupEntitlements::new()));
        let gate = Arc::new(AuthorizationGate::new(
            config.authorization,
            entitlements.clone(),
            self.policy,
        ));

        let persistence = Arc::new(PersistenceService::new(
            repository.clone(),
            blob_store.clone(),
            bus.clone(),
            config.clone(),
        ));
        let ingestion = Arc::new(IngestionEngine::new(
            repository.clone(),
            blob_store.clone(),
            persistence.clone(),
            gate.clone(),
            entitlements,
            clock.clone(),
            config.clone(),
        ));
        let patch = Arc::new(PatchEngine::new(
            repository.clone(),
            blob_store.clone(),
            persistence.clone(),
            ingestion.clone(),
            gate.clone(),
            clock.clone(),
            config.clone(),
        ));
        let delete = Arc::new(SoftDeleteEngine::new(
            repository.clone(),
            bus.clone(),
            gate.clone(),
            clock.clone(),
            config.clone(),
        ));
        let merge_patch = Arc::new(MergePatchEngine::new(
            repository.clone(),
            blob_store.clone(),
            persistence,
            ingestion.clone(),
            delete.clone(),
            gate.clone(),
            clock.clone(),
            config.clone(),
        ));
        let purge = Arc::new(PurgeEngine::new(
            repository.clone(),
            blob_store.clone(),
            bus.clone(),
            gate.clone(),
            clock.clone(),
            config.clone(),
        ));
        let query = Arc::new(QueryEngine::new(
            repository,
            blob_store,
            ingestion.clone(),
            gate,
            config.clone(),
        ));
        let replay = Arc::new(ReplayOrchestrator::new(
            replay_repository,
            query_repository,
            bus,
            clock,
            config,
        ));

        RecordStore {
            ingestion,
            patch,
            merge_patch,
            delete,
            purge,
            query,
            replay,
        }
    }
}

/// The assembled store. Each engine owns one slice of the record
/// lifecycle; they share backends and configuration.
pub struct RecordStore {
    ingestion: Arc<IngestionEngine>,
    patch: Arc<PatchEngine>,
    merge_patch: Arc<MergePatchEngine>,
    delete: Arc<SoftDeleteEngine>,
    purge: Arc<PurgeEngine>,
    query: Arc<QueryEngine>,
    replay: Arc<ReplayOrchestrator>,
}

impl RecordStore {
    pub fn builder(config: Config) -> RecordStoreBuilder {
        RecordStoreBuilder::new(config)
    }

    pub fn ingestion(&self) -> &IngestionEngine {
        &self.ingestion
    }

    pub fn patch(&self) -> &PatchEngine {
        &self.patch
    }

    pub fn merge_patch(&self) -> &MergePatchEngine {
        &self.merge_patch
    }

    pub fn delete(&self) -> &SoftDeleteEngine {
        &self.delete
    }

    pub fn purge(&self) -> &PurgeEngine {
        &self.purge
    }

    pub fn query(&self) -> &QueryEngine {
        &self.query
    }

    pub fn replay(&self) -> &ReplayOrchestrator {
        &self.replay
    }
}
