//! Calendar service adapter.
//!
//! Events live in `{data_dir}/calendar.json`. Timestamps are Unix epoch
//! seconds throughout.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

use super::{atomic_write_json, now_epoch, read_json_file, required_str, Service, ServiceError, ServiceResult};
use crate::mcp::ToolSpec;

pub const SERVICE_ID: &str = "CalendarService";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CalendarStore {
    events: Vec<CalendarEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CalendarEvent {
    id: String,
    title: String,
    start: u64,
    #[serde(default)]
    end: Option<u64>,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    notes: Option<String>,
    created_at: u64,
}

pub struct CalendarService {
    store_path: PathBuf,
}

impl CalendarService {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            store_path: data_dir.join("calendar.json"),
        }
    }

    async fn read_events(&self, args: &Value) -> Result<ServiceResult, ServiceError> {
        let from = args.get("from").and_then(|v| v.as_u64());
        let to = args.get("to").and_then(|v| v.as_u64());

        let store: CalendarStore = read_json_file(&self.store_path).await;
        let events: Vec<&CalendarEvent> = store
            .events
            .iter()
            .filter(|e| from.map_or(true, |f| e.start >= f))
            .filter(|e| to.map_or(true, |t| e.start <= t))
            .collect();

        Ok(ServiceResult::Value(json!({ "events": events })))
    }

    async fn create_event(&self, args: &Value) -> Result<ServiceResult, ServiceError> {
        let title = required_str(args, "title")?;
        let start = args
            .get("start")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| ServiceError::Invalid("missing required argument 'start'".into()))?;

        let event = CalendarEvent {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.to_string(),
            start,
            end: args.get("end").and_then(|v| v.as_u64()),
            location: args
                .get("location")
                .and_then(|v| v.as_str())
                .map(String::from),
            notes: args.get("notes").and_then(|v| v.as_str()).map(String::from),
            created_at: now_epoch(),
        };

        let mut store: CalendarStore = read_json_file(&self.store_path).await;
        store.events.push(event.clone());
        store.events.sort_by_key(|e| e.start);
        atomic_write_json(&self.store_path, &store).await?;

        tracing::info!(event_id = %event.id, "Created calendar event");
        Ok(ServiceResult::Value(json!({ "created": event })))
    }
}

#[async_trait]
impl Service for CalendarService {
    fn id(&self) -> &'static str {
        SERVICE_ID
    }

    fn tools(&self) -> Vec<ToolSpec> {
        vec![
            ToolSpec {
                name: "calendar_read",
                description: "List calendar events, optionally within a time range",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "from": { "type": "integer", "description": "Earliest event start (Unix epoch seconds)" },
                        "to": { "type": "integer", "description": "Latest event start (Unix epoch seconds)" }
                    }
                }),
                read_only: true,
            },
            ToolSpec {
                name: "calendar_create",
                description: "Create a calendar event",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "title": { "type": "string" },
                        "start": { "type": "integer", "description": "Event start (Unix epoch seconds)" },
                        "end": { "type": "integer" },
                        "location": { "type": "string" },
                        "notes": { "type": "string" }
                    },
                    "required": ["title", "start"]
                }),
                read_only: false,
            },
        ]
    }

    fn is_activated(&self) -> bool {
        self.store_path
            .parent()
            .map(|dir| dir.exists())
            .unwrap_or(false)
    }

    fn activate(&self) -> Result<(), ServiceError> {
        if let Some(dir) = self.store_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    async fn call(&self, tool: &str, args: &Value) -> Result<ServiceResult, ServiceError> {
        match tool {
            "calendar_read" => self.read_events(args).await,
            "calendar_create" => self.create_event(args).await,
            _ => Ok(ServiceResult::NotHandled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> (tempfile::TempDir, CalendarService) {
        let dir = tempfile::tempdir().unwrap();
        let service = CalendarService::new(dir.path());
        (dir, service)
    }

    #[tokio::test]
    async fn test_create_then_read() {
        let (_dir, service) = service();

        let created = service
            .call("calendar_create", &json!({"title": "standup", "start": 1000}))
            .await
            .unwrap();
        match created {
            ServiceResult::Value(v) => assert_eq!(v["created"]["title"], "standup"),
            _ => panic!("expected value result"),
        }

        let read = service.call("calendar_read", &json!({})).await.unwrap();
        match read {
            ServiceResult::Value(v) => {
                assert_eq!(v["events"].as_array().unwrap().len(), 1);
            }
            _ => panic!("expected value result"),
        }
    }

    #[tokio::test]
    async fn test_read_range_filter() {
        let (_dir, service) = service();
        for (title, start) in [("early", 100u64), ("mid", 500), ("late", 900)] {
            service
                .call("calendar_create", &json!({"title": title, "start": start}))
                .await
                .unwrap();
        }

        let read = service
            .call("calendar_read", &json!({"from": 200, "to": 800}))
            .await
            .unwrap();
        match read {
            ServiceResult::Value(v) => {
                let events = v["events"].as_array().unwrap();
                assert_eq!(events.len(), 1);
                assert_eq!(events[0]["title"], "mid");
            }
            _ => panic!("expected value result"),
        }
    }

    #[tokio::test]
    async fn test_create_requires_title_and_start() {
        let (_dir, service) = service();
        assert!(service
            .call("calendar_create", &json!({"start": 10}))
            .await
            .is_err());
        assert!(service
            .call("calendar_create", &json!({"title": "x"}))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_unknown_tool_is_not_handled() {
        let (_dir, service) = service();
        let result = service.call("__unknown_tool__", &json!({})).await.unwrap();
        assert!(matches!(result, ServiceResult::NotHandled));
    }

    #[test]
    fn test_tool_catalog_hints() {
        let dir = tempfile::tempdir().unwrap();
        let service = CalendarService::new(dir.path());
        let tools = service.tools();
        assert_eq!(tools.len(), 2);
        assert!(tools[0].read_only);
        assert!(!tools[1].read_only);
    }
}
