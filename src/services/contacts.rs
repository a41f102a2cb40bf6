//! Contacts service adapter.
//!
//! The address book lives in `{data_dir}/contacts.json`, written by the
//! host sync layer. This adapter only reads it; both tools carry
//! `readOnlyHint = true`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

use super::{read_json_file, required_str, Service, ServiceError, ServiceResult};
use crate::mcp::ToolSpec;

pub const SERVICE_ID: &str = "ContactsService";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ContactStore {
    #[serde(default)]
    me: Option<Contact>,
    #[serde(default)]
    contacts: Vec<Contact>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Contact {
    name: String,
    #[serde(default)]
    emails: Vec<String>,
    #[serde(default)]
    phones: Vec<String>,
    #[serde(default)]
    organization: Option<String>,
}

impl Contact {
    fn matches(&self, query: &str) -> bool {
        let q = query.to_lowercase();
        self.name.to_lowercase().contains(&q)
            || self.emails.iter().any(|e| e.to_lowercase().contains(&q))
            || self.phones.iter().any(|p| p.contains(&q))
            || self
                .organization
                .as_deref()
                .map(|o| o.to_lowercase().contains(&q))
                .unwrap_or(false)
    }
}

pub struct ContactsService {
    store_path: PathBuf,
}

impl ContactsService {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            store_path: data_dir.join("contacts.json"),
        }
    }
}

#[async_trait]
impl Service for ContactsService {
    fn id(&self) -> &'static str {
        SERVICE_ID
    }

    fn tools(&self) -> Vec<ToolSpec> {
        vec![
            ToolSpec {
                name: "contacts_me",
                description: "Return the card of the device owner",
                input_schema: json!({ "type": "object", "properties": {} }),
                read_only: true,
            },
            ToolSpec {
                name: "contacts_search",
                description: "Search contacts by name, email, phone, or organization",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "query": { "type": "string" }
                    },
                    "required": ["query"]
                }),
                read_only: true,
            },
        ]
    }

    fn is_activated(&self) -> bool {
        self.store_path.exists()
    }

    fn activate(&self) -> Result<(), ServiceError> {
        if self.store_path.exists() {
            Ok(())
        } else {
            Err(ServiceError::NotActivated)
        }
    }

    async fn call(&self, tool: &str, args: &Value) -> Result<ServiceResult, ServiceError> {
        match tool {
            "contacts_me" => {
                let store: ContactStore = read_json_file(&self.store_path).await;
                match store.me {
                    Some(me) => Ok(ServiceResult::Value(json!({ "me": me }))),
                    None => Err(ServiceError::Invalid("no owner card on record".into())),
                }
            }
            "contacts_search" => {
                let query = required_str(args, "query")?;
                let store: ContactStore = read_json_file(&self.store_path).await;
                let matches: Vec<&Contact> = store
                    .contacts
                    .iter()
                    .filter(|c| c.matches(query))
                    .collect();
                Ok(ServiceResult::Value(json!({ "contacts": matches })))
            }
            _ => Ok(ServiceResult::NotHandled),
        }
    }
}
