//! Store configuration.

use serde::{Deserialize, Serialize};

/// Which backend the authorization gate consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationBackend {
    /// Group-membership checks against the entitlements service.
    #[default]
    Entitlements,
    /// Per-record decisions from an external policy engine.
    Policy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data partition the store serves; record ids must carry it as
    /// their first component.
    pub tenant: String,
    pub authorization: AuthorizationBackend,
    /// When false, any request carrying a collaboration context is
    /// rejected with 423.
    pub collaboration_enabled: bool,
    pub max_patch_ops: usize,
    pub max_version_ids: usize,
    pub max_record_id_length: usize,
    /// Page size used by the replay worker when walking the record
    /// index.
    pub replay_batch_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tenant: "tenant1".to_string(),
            authorization: AuthorizationBackend::Entitlements,
            collaboration_enabled: false,
            max_patch_ops: 100,
            max_version_ids: 50,
            max_record_id_length: 512,
            replay_batch_size: 1000,
        }
    }
}

impl Config {
    pub fn new(tenant: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            ..Self::default()
        }
    }

    pub fn with_collaboration(mut self, enabled: bool) -> Self {
        self.collaboration_enabled = enabled;
        self
    }

    pub fn with_authorization(mut self, backend: AuthorizationBackend) -> Self {
        self.authorization = backend;
        self
    }
}
