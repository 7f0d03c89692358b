//! Request validation helpers and their stable error strings.
//!
//! The reason/message pairs raised here are part of the public
//! contract; integration tests assert on them verbatim.

use crate::config::Config;
use crate::error::{Error, Result};
use record_common::{CollaborationContext, Record, RecordMetadata};

pub const INVALID_PATCH_PATH_START: &str = "Invalid Patch Path: can only start with '/acl/viewers', 'acl/owners', '/legal/legaltags', '/tags', '/kind', '/ancestry/parents', '/data' or '/meta'";
pub const INVALID_PATCH_OPERATION_SIZE: &str =
    "Invalid Patch Operation: the number of operations can only be between 1 and 100";
pub const INVALID_PATCH_PATH_FOR_REMOVE_OPERATION: &str =
    "Invalid Patch Path: path for remove operation must contain index of the value to be deleted";
pub const INVALID_PATCH_PATH_END: &str = "Invalid Patch Path: path cannot end with '/'";
pub const INVALID_PATCH_OPERATION_TYPE_FOR_KIND: &str =
    "Invalid Patch Operation: for patching '/kind', only 'replace' operation is allowed";
pub const INVALID_PATCH_VALUES_FORMAT_FOR_KIND: &str =
    "Invalid Patch Operation: for patching '/kind', only one value is allowed";
pub const INVALID_PATCH_PATH_FOR_KIND: &str =
    "Invalid Patch Path: for patching kind, path must be exactly '/kind'";
pub const INVALID_PATCH_VALUES_FORMAT_FOR_TAGS: &str = "Invalid Patch Operation: for patching '/tags', value can only be in {'key':'value'} format and for patching '/tags/key' value can only be in a single string format";
pub const RECORD_ID_LIST_NOT_EMPTY: &str = "The list of record IDs cannot be empty";
pub const PATCH_RECORDS_MAX: &str = "Up to 100 records can be patched at a time";
pub const INVALID_LIMIT: &str = "Invalid limit.";
pub const INVALID_FROM_VERSION: &str = "Invalid 'from' version.";

/// Upper bound on records addressed by one bulk patch or delete.
pub const MAX_RECORD_ID_NUMBER: usize = 100;

pub fn invalid_kind_message(kind: &str) -> String {
    format!("Invalid kind: '{kind}', does not follow the required naming convention")
}

pub fn invalid_version_ids_size_message(count: usize) -> String {
    format!("Invalid Version Ids size : '{count}'. The number of versionId can only be between 1 and 50")
}

pub fn invalid_version_ids_latest_message(latest: i64) -> String {
    format!("Invalid Version Ids. The versionIds contains latest record version '{latest}'")
}

pub fn invalid_version_ids_non_existing_message(versions: &str) -> String {
    format!("Invalid Version Ids. The versionIds contains non existing version(s) '{versions}'")
}

pub fn invalid_from_version_message(from: i64) -> String {
    format!("{INVALID_FROM_VERSION} The record version does not contains specified from version '{from}'")
}

pub fn invalid_limit_for_from_version_message(limit: usize, from: i64) -> String {
    format!("{INVALID_LIMIT} Given limit count {limit}, exceeds the record versions count specified by the given 'from' version '{from}'")
}

/// Kind must be `authority:source:entityType:version` with four
/// non-empty components.
pub fn validate_kind(kind: &str) -> Result<()> {
    let parts: Vec<&str> = kind.split(':').collect();
    if parts.len() != 4 || parts.iter().any(|p| p.is_empty()) {
        return Err(Error::bad_request("Invalid kind", invalid_kind_message(kind)));
    }
    Ok(())
}

/// Ingestion-side id check: the id must be
/// `<tenant>:<kindSubType>:<uniqueId>` for the record's kind, and
/// within the configured length limit.
pub fn validate_record_id_for_kind(
    id: &str,
    tenant: &str,
    kind: &str,
    config: &Config,
) -> Result<()> {
    if id.len() > config.max_record_id_length {
        return Err(Error::bad_request(
            "Invalid record id",
            format!(
                "RecordId values which are exceeded {} limit: {}",
                config.max_record_id_length, id
            ),
        ));
    }
    let sub_type = Record::kind_sub_type(kind).unwrap_or_default();
    let prefix = format!("{tenant}:{sub_type}:");
    if !id.starts_with(&prefix) || id.len() == prefix.len() {
        return Err(Error::bad_request(
            "Invalid record id",
            format!(
                "The record '{id}' does not follow the naming convention: The record id must be in the format of <tenantId>:<kindSubType>:<uniqueId>. Example: {tenant}:{sub_type}:<uuid>"
            ),
        ));
    }
    Ok(())
}

/// Bulk-side id check: the first id component must name the tenant.
pub fn validate_record_ids(ids: &[String], tenant: &str, config: &Config) -> Result<()> {
    for id in ids {
        if id.len() > config.max_record_id_length {
            return Err(Error::bad_request(
                "Invalid record id",
                format!(
                    "RecordId values which are exceeded {} limit: {}",
                    config.max_record_id_length, id
                ),
            ));
        }
        let valid = id.split(':').count() == 3 && id.starts_with(&format!("{tenant}:"));
        if !valid {
            return Err(Error::bad_request(
                "Invalid record id",
                format!(
                    "The record '{id}' does not follow the naming convention: the first id component must be '{tenant}'"
                ),
            ));
        }
    }
    Ok(())
}

/// Rejects requests carrying a collaboration context while the feature
/// is disabled.
pub fn ensure_collaboration_enabled(
    config: &Config,
    ctx: Option<&CollaborationContext>,
) -> Result<()> {
    if ctx.is_some() && !config.collaboration_enabled {
        return Err(Error::locked(
            "Locked",
            "Collaboration feature is not enabled",
        ));
    }
    Ok(())
}

/// Version-ids selector validation for version purge: at most 50 ids,
/// never the latest version, only existing versions.
pub fn validate_version_ids(
    version_ids: &[i64],
    metadata: &RecordMetadata,
    config: &Config,
) -> Result<()> {
    if version_ids.is_empty() || version_ids.len() > config.max_version_ids {
        return Err(Error::bad_request(
            "Invalid versionIds",
            invalid_version_ids_size_message(version_ids.len()),
        ));
    }
    if let Some(latest) = metadata.latest_version() {
        if version_ids.contains(&latest) {
            return Err(Error::bad_request(
                "Invalid versionIds",
                invalid_version_ids_latest_message(latest),
            ));
        }
    }
    let missing: Vec<String> = version_ids
        .iter()
        .filter(|v| !metadata.has_version(**v))
        .map(|v| v.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(Error::bad_request(
            "Invalid versionIds",
            invalid_version_ids_non_existing_message(&missing.join(",")),
        ));
    }
    Ok(())
}
