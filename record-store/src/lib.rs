//! Versioned, multi-tenant record store.
//!
//! Records are JSON documents filed under a `kind`, with governance
//! metadata (ACLs, legal tags, tags, ancestry) kept separately from
//! the immutable version bodies. Every write produces a new version;
//! reads serve the latest one. Soft deletion hides a record without
//! touching its versions, purge removes data for good, and replay
//! republishes change notifications over the existing corpus.
//!
//! [`store::RecordStore`] assembles the engines over pluggable storage
//! backends; [`record_common`] carries the model and the capability
//! traits those backends implement.

pub mod audit;
pub mod authorization;
pub mod config;
pub mod delete;
pub mod error;
pub mod hash;
pub mod ingestion;
pub mod json_patch;
pub mod merge_patch;
pub mod messaging;
pub mod patch;
pub mod persistence;
pub mod purge;
pub mod query;
pub mod replay;
pub mod store;
pub mod validation;

pub use config::{AuthorizationBackend, Config};
pub use error::{Error, Result};
pub use store::{RecordStore, RecordStoreBuilder};
