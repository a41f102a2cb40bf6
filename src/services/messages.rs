//! Messages service adapter.
//!
//! Read-only queries against the host message database (the same file the
//! message watcher observes). Queries run on the blocking pool; each call
//! opens its own read-only connection, so concurrent invocations need no
//! locking.

use async_trait::async_trait;
use rusqlite::{Connection, OpenFlags};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

use super::{Service, ServiceError, ServiceResult};
use crate::mcp::ToolSpec;

pub const SERVICE_ID: &str = "MessagesService";

const DEFAULT_RECENT_LIMIT: u32 = 20;
const MAX_RECENT_LIMIT: u32 = 200;

pub struct MessagesService {
    db_path: PathBuf,
}

impl MessagesService {
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open(path: &Path) -> Result<Connection, ServiceError> {
        Ok(Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?)
    }

    async fn unread_count(&self) -> Result<ServiceResult, ServiceError> {
        let path = self.db_path.clone();
        let count: i64 = tokio::task::spawn_blocking(move || -> Result<i64, ServiceError> {
            let conn = Self::open(&path)?;
            let count = conn.query_row(
                "SELECT COUNT(*) FROM message WHERE is_from_me = 0 AND is_read = 0",
                [],
                |row| row.get(0),
            )?;
            Ok(count)
        })
        .await
        .map_err(|e| ServiceError::Invalid(format!("query task failed: {}", e)))??;

        Ok(ServiceResult::Value(json!({ "unread": count })))
    }

    async fn recent(&self, args: &Value) -> Result<ServiceResult, ServiceError> {
        let limit = args
            .get("limit")
            .and_then(|v| v.as_u64())
            .map(|n| n as u32)
            .unwrap_or(DEFAULT_RECENT_LIMIT)
            .min(MAX_RECENT_LIMIT);

        let path = self.db_path.clone();
        let rows = tokio::task::spawn_blocking(move || -> Result<Vec<Value>, ServiceError> {
            let conn = Self::open(&path)?;
            let mut stmt = conn.prepare(
                "SELECT ROWID, text, is_from_me, date FROM message \
                 WHERE text IS NOT NULL ORDER BY ROWID DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map([limit], |row| {
                    Ok(json!({
                        "rowid": row.get::<_, i64>(0)?,
                        "text": row.get::<_, String>(1)?,
                        "isFromMe": row.get::<_, i64>(2)? != 0,
                        "date": row.get::<_, i64>(3)?,
                    }))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
        .map_err(|e| ServiceError::Invalid(format!("query task failed: {}", e)))??;

        Ok(ServiceResult::Value(json!({ "messages": rows })))
    }
}

#[async_trait]
impl Service for MessagesService {
    fn id(&self) -> &'static str {
        SERVICE_ID
    }

    fn tools(&self) -> Vec<ToolSpec> {
        vec![
            ToolSpec {
                name: "messages_unread_count",
                description: "Count unread incoming messages",
                input_schema: json!({ "type": "object", "properties": {} }),
                read_only: true,
            },
            ToolSpec {
                name: "messages_recent",
                description: "Return the most recent messages, newest first",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "limit": { "type": "integer", "maximum": MAX_RECENT_LIMIT }
                    }
                }),
                read_only: true,
            },
        ]
    }

    fn is_activated(&self) -> bool {
        self.db_path.is_file()
    }

    fn activate(&self) -> Result<(), ServiceError> {
        if self.is_activated() {
            Ok(())
        } else {
            Err(ServiceError::NotActivated)
        }
    }

    async fn call(&self, tool: &str, args: &Value) -> Result<ServiceResult, ServiceError> {
        if !self.is_activated() {
            return Err(ServiceError::NotActivated);
        }
        match tool {
            "messages_unread_count" => self.unread_count().await,
            "messages_recent" => self.recent(args).await,
            _ => Ok(ServiceResult::NotHandled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_db(dir: &Path) -> PathBuf {
        let path = dir.join("chat.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE message (\
                 ROWID INTEGER PRIMARY KEY AUTOINCREMENT,\
                 text TEXT,\
                 is_from_me INTEGER NOT NULL DEFAULT 0,\
                 is_read INTEGER NOT NULL DEFAULT 0,\
                 date INTEGER NOT NULL DEFAULT 0\
             );\
             INSERT INTO message (text, is_from_me, is_read, date) VALUES\
                 ('hey', 0, 0, 100),\
                 ('on my way', 1, 1, 200),\
                 ('see you soon', 0, 0, 300),\
                 ('ok', 0, 1, 400);",
        )
        .unwrap();
        path
    }

    #[tokio::test]
    async fn test_unread_count() {
        let dir = tempfile::tempdir().unwrap();
        let service = MessagesService::new(seed_db(dir.path()));

        match service
            .call("messages_unread_count", &json!({}))
            .await
            .unwrap()
        {
            ServiceResult::Value(v) => assert_eq!(v["unread"], 2),
            _ => panic!("expected value result"),
        }
    }

    #[tokio::test]
    async fn test_recent_is_newest_first_and_limited() {
        let dir = tempfile::tempdir().unwrap();
        let service = MessagesService::new(seed_db(dir.path()));

        match service
            .call("messages_recent", &json!({"limit": 2}))
            .await
            .unwrap()
        {
            ServiceResult::Value(v) => {
                let messages = v["messages"].as_array().unwrap();
                assert_eq!(messages.len(), 2);
                assert_eq!(messages[0]["text"], "ok");
                assert_eq!(messages[1]["text"], "see you soon");
            }
            _ => panic!("expected value result"),
        }
    }

    #[tokio::test]
    async fn test_missing_database_is_not_activated() {
        let dir = tempfile::tempdir().unwrap();
        let service = MessagesService::new(dir.path().join("absent.db"));
        assert!(!service.is_activated());
        let err = service
            .call("messages_unread_count", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotActivated));
    }
}
