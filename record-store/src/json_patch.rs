//! JSON-pointer mutation primitives for patch application.
//!
//! RFC 6901 pointer semantics over `serde_json::Value`, with the
//! RFC 6902 `-` append reference for arrays.

use serde_json::Value;

use crate::error::{Error, Result};

fn unescape(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

fn path_error(path: &str) -> Error {
    Error::bad_request("Invalid Patch Path", format!("path '{path}' does not exist"))
}

/// Resolves the parent container of `path` and returns it with the
/// final (unescaped) token.
fn parent_of<'a>(doc: &'a mut Value, path: &str) -> Result<(&'a mut Value, String)> {
    if !path.starts_with('/') {
        return Err(path_error(path));
    }
    let mut tokens: Vec<String> = path[1..].split('/').map(unescape).collect();
    let last = tokens.pop().ok_or_else(|| path_error(path))?;
    let mut current = doc;
    for token in tokens {
        current = match current {
            Value::Object(map) => map.get_mut(&token).ok_or_else(|| path_error(path))?,
            Value::Array(items) => {
                let index: usize = token.parse().map_err(|_| path_error(path))?;
                items.get_mut(index).ok_or_else(|| path_error(path))?
            }
            _ => return Err(path_error(path)),
        };
    }
    Ok((current, last))
}

/// RFC 6902 `add`: inserts into arrays (supporting the `-` append
/// reference), sets object keys.
pub fn add_value(doc: &mut Value, path: &str, value: Value) -> Result<()> {
    let (parent, token) = parent_of(doc, path)?;
    match parent {
        Value::Object(map) => {
            map.insert(token, value);
            Ok(())
        }
        Value::Array(items) => {
            if token == "-" {
                items.push(value);
                return Ok(());
            }
            let index: usize = token.parse().map_err(|_| path_error(path))?;
            if index > items.len() {
                return Err(path_error(path));
            }
            items.insert(index, value);
            Ok(())
        }
        _ => Err(path_error(path)),
    }
}

/// RFC 6902 `replace`: the target location must already exist.
pub fn replace_value(doc: &mut Value, path: &str, value: Value) -> Result<()> {
    let (parent, token) = parent_of(doc, path)?;
    match parent {
        Value::Object(map) => {
            let slot = map.get_mut(&token).ok_or_else(|| path_error(path))?;
            *slot = value;
            Ok(())
        }
        Value::Array(items) => {
            let index: usize = token.parse().map_err(|_| path_error(path))?;
            let slot = items.get_mut(index).ok_or_else(|| path_error(path))?;
            *slot = value;
            Ok(())
        }
        _ => Err(path_error(path)),
    }
}

/// RFC 6902 `remove`: the target location must exist.
pub fn remove_value(doc: &mut Value, path: &str) -> Result<()> {
    let (parent, token) = parent_of(doc, path)?;
    match parent {
        Value::Object(map) => {
            map.remove(&token).ok_or_else(|| path_error(path))?;
            Ok(())
        }
        Value::Array(items) => {
            let index: usize = token.parse().map_err(|_| path_error(path))?;
            if index >= items.len() {
                return Err(path_error(path));
            }
            items.remove(index);
            Ok(())
        }
        _ => Err(path_error(path)),
    }
}
