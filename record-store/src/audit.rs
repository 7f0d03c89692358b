//! Audit trail, emitted as structured tracing events.

use tracing::{info, warn};

const TARGET: &str = "record_store::audit";

#[derive(Debug, Clone, Copy, Default)]
pub struct AuditLogger;

impl AuditLogger {
    pub fn new() -> Self {
        Self
    }

    pub fn create_or_update_records_success(&self, ids: &[String]) {
        info!(target: TARGET, action = "create_or_update", outcome = "success", ids = ?ids);
    }

    pub fn create_or_update_records_fail(&self, ids: &[String]) {
        warn!(target: TARGET, action = "create_or_update", outcome = "failure", ids = ?ids);
    }

    pub fn read_records_success(&self, ids: &[String]) {
        info!(target: TARGET, action = "read", outcome = "success", ids = ?ids);
    }

    pub fn delete_record_success(&self, ids: &[String]) {
        info!(target: TARGET, action = "delete", outcome = "success", ids = ?ids);
    }

    pub fn delete_record_fail(&self, details: &[String]) {
        warn!(target: TARGET, action = "delete", outcome = "failure", details = ?details);
    }

    pub fn purge_record_success(&self, ids: &[String]) {
        info!(target: TARGET, action = "purge", outcome = "success", ids = ?ids);
    }

    pub fn purge_record_fail(&self, ids: &[String]) {
        warn!(target: TARGET, action = "purge", outcome = "failure", ids = ?ids);
    }

    pub fn purge_record_versions_success(&self, id: &str, version_paths: &[String]) {
        info!(target: TARGET, action = "purge_versions", outcome = "success", id, version_paths = ?version_paths);
    }

    pub fn purge_record_versions_fail(&self, id: &str, version_paths: &[String]) {
        warn!(target: TARGET, action = "purge_versions", outcome = "failure", id, version_paths = ?version_paths);
    }

    pub fn update_records_success(&self, ids: &[String]) {
        info!(target: TARGET, action = "update", outcome = "success", ids = ?ids);
    }

    pub fn update_records_fail(&self, ids: &[String]) {
        warn!(target: TARGET, action = "update", outcome = "failure", ids = ?ids);
    }

    pub fn create_replay_request_success(&self, replay_id: &str, operation: &str) {
        info!(target: TARGET, action = "replay", outcome = "success", replay_id, operation);
    }

    pub fn create_replay_request_fail(&self, replay_id: &str, operation: &str) {
        warn!(target: TARGET, action = "replay", outcome = "failure", replay_id, operation);
    }
}
