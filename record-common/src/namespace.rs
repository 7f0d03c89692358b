//! Storage key namespacing for collaboration contexts.
//!
//! Records touched under a collaboration context live under keys
//! prefixed with the context id. The record id inside the document is
//! never rewritten; only the storage key changes, so the same logical
//! id can exist independently in the primary store and in any number of
//! collaboration workspaces.

use crate::model::CollaborationContext;

/// Storage key for `id` under an optional collaboration context.
pub fn with_namespace(id: &str, ctx: Option<&CollaborationContext>) -> String {
    match ctx {
        Some(c) => format!("{}{}", c.id, id),
        None => id.to_string(),
    }
}

/// Strips the context prefix from a storage key, returning the logical
/// record id.
pub fn without_namespace(key: &str, ctx: Option<&CollaborationContext>) -> String {
    match ctx {
        Some(c) => {
            let prefix = c.id.to_string();
            key.strip_prefix(prefix.as_str()).unwrap_or(key).to_string()
        }
        None => key.to_string(),
    }
}
