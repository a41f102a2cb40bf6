//! Host service adapters.
//!
//! Each module adapts one host subsystem and contributes a fixed set of
//! tools to the catalog:
//! - `calendar`  -- event store (calendar_read, calendar_create)
//! - `reminders` -- reminder store (reminders_read, reminder_create, reminder_complete)
//! - `contacts`  -- address book (contacts_me, contacts_search)
//! - `messages`  -- message database queries (messages_unread_count, messages_recent)
//!
//! Adapters are thin and mechanical; all policy (permissions, enablement)
//! lives in the dispatcher.

pub mod calendar;
pub mod contacts;
pub mod messages;
pub mod reminders;

use std::path::Path;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::mcp::ToolSpec;

/// Failure surfaced by a service adapter. The dispatcher converts these
/// into user-visible error results, never into protocol errors.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Invalid(String),

    #[error("service is not activated")]
    NotActivated,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// What a service hands back from `call`.
#[derive(Debug)]
pub enum ServiceResult {
    /// Structured data, JSON-encoded into a text content block.
    Value(Value),
    /// Typed binary payload, base64-wrapped for `image/*` and `audio/*`.
    Blob { mime_type: String, bytes: Vec<u8> },
    /// The tool name is not one of ours. With the precomputed tool map
    /// this is unreachable in practice and surfaces as "tool not found".
    NotHandled,
}

/// Capability set implemented by every host adapter.
#[async_trait]
pub trait Service: Send + Sync {
    /// Stable textual identity, e.g. `"CalendarService"`.
    fn id(&self) -> &'static str;

    /// The fixed, ordered tool list this service contributes.
    fn tools(&self) -> Vec<ToolSpec>;

    /// Whether host permissions are granted.
    fn is_activated(&self) -> bool;

    /// Request host permissions. May prompt externally.
    fn activate(&self) -> Result<(), ServiceError>;

    /// Execute one of this service's tools.
    async fn call(&self, tool: &str, args: &Value) -> Result<ServiceResult, ServiceError>;
}

// ---------------------------------------------------------------------------
// Shared store helpers
// ---------------------------------------------------------------------------

/// Read and parse a JSON store, returning the default when the file is
/// missing or mid-rewrite.
pub(crate) async fn read_json_file<T: serde::de::DeserializeOwned + Default>(path: &Path) -> T {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
        Err(_) => T::default(),
    }
}

/// Write a JSON store atomically (write to `.tmp`, then rename).
pub(crate) async fn atomic_write_json<T: Serialize>(
    path: &Path,
    data: &T,
) -> Result<(), ServiceError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_string_pretty(data)?;
    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, &json).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

/// Extract a required string argument.
pub(crate) fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, ServiceError> {
    args.get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ServiceError::Invalid(format!("missing required argument '{}'", key)))
}

/// Current time as Unix epoch seconds.
pub(crate) fn now_epoch() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_required_str_present() {
        let args = json!({"title": "standup"});
        assert_eq!(required_str(&args, "title").unwrap(), "standup");
    }

    #[test]
    fn test_required_str_missing_or_empty() {
        let args = json!({"title": ""});
        assert!(required_str(&args, "title").is_err());
        assert!(required_str(&json!({}), "title").is_err());
    }

    #[tokio::test]
    async fn test_atomic_write_and_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store.json");

        #[derive(Default, serde::Serialize, serde::Deserialize)]
        struct Store {
            items: Vec<String>,
        }

        let store = Store {
            items: vec!["a".into(), "b".into()],
        };
        atomic_write_json(&path, &store).await.unwrap();

        let read: Store = read_json_file(&path).await;
        assert_eq!(read.items, vec!["a", "b"]);
        // No temp file left behind.
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_read_json_file_corrupt_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        tokio::fs::write(&path, "{not json").await.unwrap();

        #[derive(Default, serde::Deserialize)]
        struct Store {
            items: Vec<String>,
        }
        let read: Store = read_json_file(&path).await;
        assert!(read.items.is_empty());
    }
}
