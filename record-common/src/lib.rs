//! Shared model and storage capabilities for the record store.
//!
//! This crate carries everything the engines and the storage backends
//! both need: the record data model, collaboration-context key
//! namespacing, the clock abstraction, and the storage capability
//! traits with in-memory implementations.

pub mod clock;
pub mod model;
pub mod namespace;
pub mod storage;

pub use clock::{Clock, MockClock, SystemClock};
pub use model::{
    Acl, CollaborationContext, Legal, OperationType, Record, RecordAncestry, RecordData,
    RecordHash, RecordMetadata, RecordProcessing, RecordState, TransferBatch, TransferInfo,
};
pub use storage::in_memory::{InMemoryBlobStore, InMemoryMetadataRepository};
pub use storage::{BlobStore, MetadataRepository, QueryRepository, StorageError, StorageResult};
