//! Authorization gate over two interchangeable backends.
//!
//! The gate hides whether decisions come from entitlements group
//! membership or from an external policy engine; callers ask about
//! records and operations and never branch on the backend.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use record_common::{OperationType, RecordMetadata, StorageResult};

use crate::config::AuthorizationBackend;
use crate::error::{Error, Result};

/// One policy-engine denial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyError {
    pub code: u16,
    pub reason: String,
    pub message: String,
}

/// Per-record policy decision; an empty error list means allowed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationOutputRecord {
    pub id: String,
    pub errors: Vec<PolicyError>,
}

/// Group-membership backend.
#[async_trait]
pub trait EntitlementsService: Send + Sync {
    /// Whether every ACL group in the set is a known, well-formed
    /// group for the tenant.
    async fn is_valid_acl(&self, user: &str, acls: &HashSet<String>) -> StorageResult<bool>;

    async fn has_owner_access(&self, user: &str, owners: &[String]) -> StorageResult<bool>;

    /// Filters the list down to records the user can read.
    async fn has_valid_access(
        &self,
        user: &str,
        metadata: Vec<RecordMetadata>,
    ) -> StorageResult<Vec<RecordMetadata>>;

    /// Data managers bypass per-record owner checks.
    async fn is_data_manager(&self, user: &str) -> StorageResult<bool>;
}

/// Policy-engine backend (OPA-style): per-record decisions with error
/// details.
#[async_trait]
pub trait PolicyService: Send + Sync {
    async fn validate_user_access(
        &self,
        user: &str,
        records: Vec<RecordMetadata>,
        operation: OperationType,
    ) -> StorageResult<Vec<ValidationOutputRecord>>;
}

pub struct AuthorizationGate {
    backend: AuthorizationBackend,
    entitlements: Arc<dyn EntitlementsService>,
    policy: Option<Arc<dyn PolicyService>>,
}

impl AuthorizationGate {
    pub fn new(
        backend: AuthorizationBackend,
        entitlements: Arc<dyn EntitlementsService>,
        policy: Option<Arc<dyn PolicyService>>,
    ) -> Self {
        Self {
            backend,
            entitlements,
            policy,
        }
    }

    fn policy(&self) -> Result<&Arc<dyn PolicyService>> {
        self.policy.as_ref().ok_or_else(|| {
            Error::internal(
                "Internal server error",
                "Policy authorization selected but no policy service configured",
            )
        })
    }

    /// Whether the user may perform a write-class operation on the
    /// record.
    pub async fn validate_owner_access(
        &self,
        user: &str,
        metadata: &RecordMetadata,
        operation: OperationType,
    ) -> Result<bool> {
        match self.backend {
            AuthorizationBackend::Policy => {
                let decisions = self
                    .policy()?
                    .validate_user_access(user, vec![metadata.clone()], operation)
                    .await?;
                Ok(decisions.iter().all(|d| d.errors.is_empty()))
            }
            AuthorizationBackend::Entitlements => {
                if self.entitlements.is_data_manager(user).await? {
                    return Ok(true);
                }
                Ok(self
                    .entitlements
                    .has_owner_access(user, &metadata.acl.owners)
                    .await?)
            }
        }
    }

    /// Whether the user may read the record.
    pub async fn validate_viewer_or_owner_access(
        &self,
        user: &str,
        metadata: &RecordMetadata,
        operation: OperationType,
    ) -> Result<bool> {
        match self.backend {
            AuthorizationBackend::Policy => {
                let decisions = self
                    .policy()?
                    .validate_user_access(user, vec![metadata.clone()], operation)
                    .await?;
                Ok(decisions.iter().all(|d| d.errors.is_empty()))
            }
            AuthorizationBackend::Entitlements => {
                if self.entitlements.is_data_manager(user).await? {
                    return Ok(true);
                }
                let readable = self
                    .entitlements
                    .has_valid_access(user, vec![metadata.clone()])
                    .await?;
                Ok(!readable.is_empty())
            }
        }
    }

    /// Ids within the batch the user may not write. Siblings are
    /// unaffected; bulk callers bucket these instead of failing.
    pub async fn unauthorized_ids(
        &self,
        user: &str,
        records: &[RecordMetadata],
        operation: OperationType,
    ) -> Result<Vec<String>> {
        match self.backend {
            AuthorizationBackend::Policy => {
                let decisions = self
                    .policy()?
                    .validate_user_access(user, records.to_vec(), operation)
                    .await?;
                Ok(decisions
                    .into_iter()
                    .filter(|d| !d.errors.is_empty())
                    .map(|d| d.id)
                    .collect())
            }
            AuthorizationBackend::Entitlements => {
                if self.entitlements.is_data_manager(user).await? {
                    return Ok(Vec::new());
                }
                let mut denied = Vec::new();
                for metadata in records {
                    if !self
                        .entitlements
                        .has_owner_access(user, &metadata.acl.owners)
                        .await?
                    {
                        denied.push(metadata.id.clone());
                    }
                }
                Ok(denied)
            }
        }
    }

    /// All-or-nothing check used by ingestion: the first denial fails
    /// the whole batch with the backend's error details.
    pub async fn validate_records_or_fail(
        &self,
        user: &str,
        records: &[RecordMetadata],
        operation: OperationType,
    ) -> Result<()> {
        match self.backend {
            AuthorizationBackend::Policy => {
                let decisions = self
                    .policy()?
                    .validate_user_access(user, records.to_vec(), operation)
                    .await?;
                for decision in decisions {
                    if let Some(error) = decision.errors.first() {
                        tracing::error!(
                            record_id = %decision.id,
                            reason = %error.reason,
                            "data authorization failure"
                        );
                        return Err(Error::new(
                            error.code,
                            error.reason.clone(),
                            error.message.clone(),
                        ));
                    }
                }
                Ok(())
            }
            AuthorizationBackend::Entitlements => {
                if self.entitlements.is_data_manager(user).await? {
                    return Ok(());
                }
                for metadata in records {
                    if !self
                        .entitlements
                        .has_owner_access(user, &metadata.acl.owners)
                        .await?
                    {
                        tracing::warn!(record_id = %metadata.id, "user does not have owner access");
                        return Err(Error::forbidden(
                            "User Unauthorized",
                            "User is not authorized to update records.",
                        ));
                    }
                }
                Ok(())
            }
        }
    }
}

/// Entitlements backend over explicit group grants, used by tests and
/// the default wiring.
#[derive(Default)]
pub struct GroupEntitlements {
    groups: RwLock<HashMap<String, HashSet<String>>>,
    /// `None` accepts any ACL group as valid.
    valid_groups: RwLock<Option<HashSet<String>>>,
    data_managers: RwLock<HashSet<String>>,
}

impl GroupEntitlements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, user: &str, group: &str) {
        self.groups
            .write()
            .unwrap()
            .entry(user.to_string())
            .or_default()
            .insert(group.to_string());
    }

    pub fn revoke(&self, user: &str, group: &str) {
        if let Some(groups) = self.groups.write().unwrap().get_mut(user) {
            groups.remove(group);
        }
    }

    pub fn set_valid_groups<I: IntoIterator<Item = String>>(&self, groups: I) {
        *self.valid_groups.write().unwrap() = Some(groups.into_iter().collect());
    }

    pub fn add_data_manager(&self, user: &str) {
        self.data_managers.write().unwrap().insert(user.to_string());
    }

    fn user_groups(&self, user: &str) -> HashSet<String> {
        self.groups
            .read()
            .unwrap()
            .get(user)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl EntitlementsService for GroupEntitlements {
    async fn is_valid_acl(&self, _user: &str, acls: &HashSet<String>) -> StorageResult<bool> {
        match self.valid_groups.read().unwrap().as_ref() {
            Some(valid) => Ok(acls.iter().all(|a| valid.contains(a))),
            None => Ok(true),
        }
    }

    async fn has_owner_access(&self, user: &str, owners: &[String]) -> StorageResult<bool> {
        let groups = self.user_groups(user);
        Ok(owners.iter().any(|o| groups.contains(o)))
    }

    async fn has_valid_access(
        &self,
        user: &str,
        metadata: Vec<RecordMetadata>,
    ) -> StorageResult<Vec<RecordMetadata>> {
        let groups = self.user_groups(user);
        Ok(metadata
            .into_iter()
            .filter(|m| {
                m.acl
                    .viewers
                    .iter()
                    .chain(m.acl.owners.iter())
                    .any(|g| groups.contains(g))
            })
            .collect())
    }

    async fn is_data_manager(&self, user: &str) -> StorageResult<bool> {
        Ok(self.data_managers.read().unwrap().contains(user))
    }
}
