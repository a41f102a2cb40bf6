//! Reminders service adapter.
//!
//! Reminders live in `{data_dir}/reminders.json`. Follows the same store
//! layout as the calendar adapter.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

use super::{atomic_write_json, now_epoch, read_json_file, required_str, Service, ServiceError, ServiceResult};
use crate::mcp::ToolSpec;

pub const SERVICE_ID: &str = "RemindersService";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ReminderStore {
    reminders: Vec<Reminder>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Reminder {
    id: String,
    title: String,
    #[serde(default)]
    due: Option<u64>,
    #[serde(default)]
    notes: Option<String>,
    completed: bool,
    created_at: u64,
}

pub struct RemindersService {
    store_path: PathBuf,
}

impl RemindersService {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            store_path: data_dir.join("reminders.json"),
        }
    }

    async fn list(&self, args: &Value) -> Result<ServiceResult, ServiceError> {
        let include_completed = args
            .get("includeCompleted")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let store: ReminderStore = read_json_file(&self.store_path).await;
        let reminders: Vec<&Reminder> = store
            .reminders
            .iter()
            .filter(|r| include_completed || !r.completed)
            .collect();

        Ok(ServiceResult::Value(json!({ "reminders": reminders })))
    }

    async fn create(&self, args: &Value) -> Result<ServiceResult, ServiceError> {
        let title = required_str(args, "title")?;

        let reminder = Reminder {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.to_string(),
            due: args.get("due").and_then(|v| v.as_u64()),
            notes: args.get("notes").and_then(|v| v.as_str()).map(String::from),
            completed: false,
            created_at: now_epoch(),
        };

        let mut store: ReminderStore = read_json_file(&self.store_path).await;
        store.reminders.push(reminder.clone());
        atomic_write_json(&self.store_path, &store).await?;

        tracing::info!(reminder_id = %reminder.id, "Created reminder");
        Ok(ServiceResult::Value(json!({ "created": reminder })))
    }

    async fn complete(&self, args: &Value) -> Result<ServiceResult, ServiceError> {
        let id = required_str(args, "id")?;

        let mut store: ReminderStore = read_json_file(&self.store_path).await;
        let reminder = store
            .reminders
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| ServiceError::Invalid(format!("no reminder with id '{}'", id)))?;
        reminder.completed = true;
        let completed = reminder.clone();
        atomic_write_json(&self.store_path, &store).await?;

        Ok(ServiceResult::Value(json!({ "completed": completed })))
    }
}

#[async_trait]
impl Service for RemindersService {
    fn id(&self) -> &'static str {
        SERVICE_ID
    }

    fn tools(&self) -> Vec<ToolSpec> {
        vec![
            ToolSpec {
                name: "reminders_read",
                description: "List reminders, excluding completed ones by default",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "includeCompleted": { "type": "boolean" }
                    }
                }),
                read_only: true,
            },
            ToolSpec {
                name: "reminder_create",
                description: "Create a reminder",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "title": { "type": "string" },
                        "due": { "type": "integer", "description": "Due time (Unix epoch seconds)" },
                        "notes": { "type": "string" }
                    },
                    "required": ["title"]
                }),
                read_only: false,
            },
            ToolSpec {
                name: "reminder_complete",
                description: "Mark a reminder as completed",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "id": { "type": "string" }
                    },
                    "required": ["id"]
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
            "reminders_read" => self.list(args).await,
            "reminder_create" => self.create(args).await,
            "reminder_complete" => self.complete(args).await,
            _ => Ok(ServiceResult::NotHandled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn created_id(result: ServiceResult) -> String {
        match result {
            ServiceResult::Value(v) => v["created"]["id"].as_str().unwrap().to_string(),
            _ => panic!("expected value result"),
        }
    }

    #[tokio::test]
    async fn test_create_complete_list() {
        let dir = tempfile::tempdir().unwrap();
        let service = RemindersService::new(dir.path());

        let id = created_id(
            service
                .call("reminder_create", &json!({"title": "water plants"}))
                .await
                .unwrap(),
        );
        service
            .call("reminder_create", &json!({"title": "buy milk"}))
            .await
            .unwrap();

        service
            .call("reminder_complete", &json!({"id": id}))
            .await
            .unwrap();

        // Default listing hides completed reminders.
        match service.call("reminders_read", &json!({})).await.unwrap() {
            ServiceResult::Value(v) => {
                let reminders = v["reminders"].as_array().unwrap();
                assert_eq!(reminders.len(), 1);
                assert_eq!(reminders[0]["title"], "buy milk");
            }
            _ => panic!("expected value result"),
        }

        match service
            .call("reminders_read", &json!({"includeCompleted": true}))
            .await
            .unwrap()
        {
            ServiceResult::Value(v) => {
                assert_eq!(v["reminders"].as_array().unwrap().len(), 2);
            }
            _ => panic!("expected value result"),
        }
    }

    #[tokio::test]
    async fn test_complete_unknown_id_fails() {
        let dir = tempfile::tempdir().unwrap();
        let service = RemindersService::new(dir.path());
        let err = service
            .call("reminder_complete", &json!({"id": "nope"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no reminder"));
    }
}
