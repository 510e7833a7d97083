use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::ipc::error::HandlerErr;
use crate::ipc::types::AppState;
use crate::lifecycle;
use crate::storage::ObjectStore;
use crate::viewer::Viewer;

pub fn db_conn(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn object_store(state: &AppState) -> Result<&ObjectStore, HandlerErr> {
    state
        .store
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

pub fn optional_bool(params: &serde_json::Value, key: &str) -> Option<bool> {
    params.get(key).and_then(|v| v.as_bool())
}

pub fn optional_i64(params: &serde_json::Value, key: &str) -> Option<i64> {
    params.get(key).and_then(|v| v.as_i64())
}

/// Resolves `params.actorId` into the acting profile.
pub fn load_viewer(conn: &Connection, params: &serde_json::Value) -> Result<Viewer, HandlerErr> {
    let actor_id = required_str(params, "actorId")?;
    Viewer::load(conn, &actor_id)
}

/// Optional RFC 3339 timestamp parameter; present-but-malformed is an error.
pub fn optional_ts(
    params: &serde_json::Value,
    key: &str,
) -> Result<Option<DateTime<Utc>>, HandlerErr> {
    let Some(raw) = params.get(key) else {
        return Ok(None);
    };
    if raw.is_null() {
        return Ok(None);
    }
    let Some(raw) = raw.as_str() else {
        return Err(HandlerErr::bad_params(format!("{} must be a string", key)));
    };
    match lifecycle::parse_ts(raw) {
        Some(ts) => Ok(Some(ts)),
        None => Err(HandlerErr::bad_params(format!(
            "{} must be an RFC 3339 timestamp",
            key
        ))),
    }
}

pub fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
