//! Service registry and permission-gated tool dispatcher.
//!
//! The registry is a fixed, ordered list of services assembled at startup.
//! A tool-name lookup table is precomputed so `tools/call` resolves its
//! target service without scanning. Permissions are checked both when
//! listing and when calling, because a client may act on a stale
//! `tools/list` result.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;
use tracing::{debug, warn};

use crate::mcp::{McpToolResult, ToolSpec};
use crate::services::{Service, ServiceResult};
use crate::tokens::Token;

// ---------------------------------------------------------------------------
// Service-enabled bindings
// ---------------------------------------------------------------------------

/// Immutable snapshot of the per-service enabled flags. Services without an
/// entry are enabled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bindings {
    enabled: HashMap<String, bool>,
}

impl Bindings {
    pub fn new(enabled: HashMap<String, bool>) -> Self {
        Self { enabled }
    }

    pub fn is_enabled(&self, service_id: &str) -> bool {
        self.enabled.get(service_id).copied().unwrap_or(true)
    }
}

/// Atomically-swapped holder for the current [`Bindings`] snapshot.
#[derive(Debug, Default)]
pub struct BindingsStore {
    snapshot: RwLock<Arc<Bindings>>,
}

impl BindingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<Bindings> {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn replace(&self, bindings: Bindings) {
        let mut guard = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(bindings);
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// One catalog entry: a tool plus the index of its owning service.
struct CatalogEntry {
    spec: ToolSpec,
    service_idx: usize,
}

/// Fixed service catalog with the precomputed tool-name lookup.
pub struct Registry {
    services: Vec<Arc<dyn Service>>,
    catalog: Vec<CatalogEntry>,
    by_name: HashMap<&'static str, usize>,
}

impl Registry {
    /// Build the catalog from an ordered service list. Tool names must be
    /// unique across the whole catalog; a duplicate keeps the first owner
    /// and is dropped with a warning.
    pub fn new(services: Vec<Arc<dyn Service>>) -> Self {
        let mut catalog = Vec::new();
        let mut by_name: HashMap<&'static str, usize> = HashMap::new();

        for (service_idx, service) in services.iter().enumerate() {
            for spec in service.tools() {
                if by_name.contains_key(spec.name) {
                    warn!(
                        tool = spec.name,
                        service = service.id(),
                        "Duplicate tool name in catalog, keeping first registration"
                    );
                    continue;
                }
                by_name.insert(spec.name, catalog.len());
                catalog.push(CatalogEntry { spec, service_idx });
            }
        }

        Self {
            services,
            catalog,
            by_name,
        }
    }

    /// The services in registry order.
    pub fn services(&self) -> &[Arc<dyn Service>] {
        &self.services
    }

    /// Whether a token may see and call a given tool right now.
    fn permitted(&self, entry: &CatalogEntry, bindings: &Bindings, token: &Token) -> bool {
        let service = &self.services[entry.service_idx];
        bindings.is_enabled(service.id())
            && token.permission(service.id()).permits(entry.spec.read_only)
    }

    /// `tools/list`: every tool, in registry order, whose service is
    /// globally enabled and permitted for this token. A disabled server
    /// lists nothing.
    pub fn list_tools(
        &self,
        server_enabled: bool,
        bindings: &Bindings,
        token: &Token,
    ) -> Vec<Value> {
        if !server_enabled {
            return Vec::new();
        }
        self.catalog
            .iter()
            .filter(|entry| self.permitted(entry, bindings, token))
            .map(|entry| entry.spec.to_value())
            .collect()
    }

    /// `tools/call`: resolve, re-check permissions, invoke, encode.
    ///
    /// Every failure here is a user-visible error result; the JSON-RPC call
    /// itself succeeds at the protocol level.
    pub async fn dispatch(
        &self,
        name: &str,
        args: &Value,
        server_enabled: bool,
        bindings: &Bindings,
        token: &Token,
    ) -> McpToolResult {
        if !server_enabled {
            return McpToolResult::error("iMCP server is disabled");
        }

        let entry = match self.by_name.get(name) {
            Some(&idx) => &self.catalog[idx],
            None => {
                return McpToolResult::error(format!(
                    "tool '{}' not found or service not enabled",
                    name
                ))
            }
        };
        let service = &self.services[entry.service_idx];

        if !bindings.is_enabled(service.id()) {
            return McpToolResult::error(format!(
                "tool '{}' not found or service not enabled",
                name
            ));
        }
        if !token.permission(service.id()).permits(entry.spec.read_only) {
            return McpToolResult::error(format!("permission denied for '{}'", name));
        }

        debug!(tool = name, service = service.id(), "Dispatching tool call");

        match service.call(name, args).await {
            Ok(result) => encode_result(name, result),
            Err(e) => McpToolResult::error(e.to_string()),
        }
    }
}

/// Encode a service result into MCP content blocks.
fn encode_result(name: &str, result: ServiceResult) -> McpToolResult {
    match result {
        ServiceResult::Value(value) => match serde_json::to_string(&value) {
            Ok(text) => McpToolResult::text(text),
            Err(e) => McpToolResult::error(format!("failed to encode result: {}", e)),
        },
        ServiceResult::Blob { mime_type, bytes } => {
            let data = BASE64.encode(&bytes);
            if mime_type.starts_with("audio/") || mime_type.starts_with("image/") {
                McpToolResult::blob(data, mime_type)
            } else {
                // Unrecognised blob types travel as JSON like any other value.
                McpToolResult::text(
                    serde_json::json!({ "mimeType": mime_type, "data": data }).to_string(),
                )
            }
        }
        ServiceResult::NotHandled => McpToolResult::error(format!(
            "tool '{}' not found or service not enabled",
            name
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ServiceError;
    use crate::tokens::Permission;
    use async_trait::async_trait;
    use serde_json::json;

    struct StubService {
        id: &'static str,
        fail: bool,
        blob_mime: Option<&'static str>,
    }

    impl StubService {
        fn new(id: &'static str) -> Self {
            Self {
                id,
                fail: false,
                blob_mime: None,
            }
        }
    }

    #[async_trait]
    impl Service for StubService {
        fn id(&self) -> &'static str {
            self.id
        }

        fn tools(&self) -> Vec<ToolSpec> {
            vec![
                ToolSpec {
                    name: match self.id {
                        "CalendarService" => "calendar_read",
                        _ => "other_read",
                    },
                    description: "read",
                    input_schema: json!({"type": "object"}),
                    read_only: true,
                },
                ToolSpec {
                    name: match self.id {
                        "CalendarService" => "calendar_create",
                        _ => "other_create",
                    },
                    description: "create",
                    input_schema: json!({"type": "object"}),
                    read_only: false,
                },
            ]
        }

        fn is_activated(&self) -> bool {
            true
        }

        fn activate(&self) -> Result<(), ServiceError> {
            Ok(())
        }

        async fn call(&self, tool: &str, _args: &Value) -> Result<ServiceResult, ServiceError> {
            if self.fail {
                return Err(ServiceError::Invalid("backend unavailable".into()));
            }
            if let Some(mime) = self.blob_mime {
                return Ok(ServiceResult::Blob {
                    mime_type: mime.to_string(),
                    bytes: vec![1, 2, 3],
                });
            }
            Ok(ServiceResult::Value(json!({ "tool": tool })))
        }
    }

    fn token_with(service: &str, permission: Permission) -> Token {
        let mut token = Token::generate("test");
        token.permissions.insert(service.into(), permission);
        token
    }

    fn registry() -> Registry {
        Registry::new(vec![Arc::new(StubService::new("CalendarService"))])
    }

    #[test]
    fn test_list_respects_read_only_permission() {
        let registry = registry();
        let bindings = Bindings::default();
        let token = token_with("CalendarService", Permission::ReadOnly);

        let tools = registry.list_tools(true, &bindings, &token);
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["name"], "calendar_read");
    }

    #[test]
    fn test_list_full_permission_shows_everything() {
        let registry = registry();
        let token = token_with("CalendarService", Permission::Full);
        let tools = registry.list_tools(true, &Bindings::default(), &token);
        assert_eq!(tools.len(), 2);
    }

    #[test]
    fn test_list_empty_when_server_disabled_or_off() {
        let registry = registry();
        let full = token_with("CalendarService", Permission::Full);
        assert!(registry.list_tools(false, &Bindings::default(), &full).is_empty());

        let off = Token::generate("no-perms");
        assert!(registry.list_tools(true, &Bindings::default(), &off).is_empty());
    }

    #[test]
    fn test_list_respects_service_binding() {
        let registry = registry();
        let token = token_with("CalendarService", Permission::Full);
        let bindings = Bindings::new(HashMap::from([("CalendarService".to_string(), false)]));
        assert!(registry.list_tools(true, &bindings, &token).is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_permission_denied_for_write_under_read_only() {
        let registry = registry();
        let token = token_with("CalendarService", Permission::ReadOnly);

        let result = registry
            .dispatch("calendar_create", &json!({}), true, &Bindings::default(), &token)
            .await;
        assert!(result.is_error);
        match &result.content[0] {
            crate::mcp::McpContent::Text { text } => {
                assert!(text.contains("permission denied for 'calendar_create'"));
            }
            _ => panic!("expected text content"),
        }
    }

    #[tokio::test]
    async fn test_dispatch_parity_with_list() {
        // Anything list_tools excludes must come back as an error result.
        let registry = registry();
        let bindings = Bindings::default();
        let token = token_with("CalendarService", Permission::ReadOnly);

        let listed: Vec<String> = registry
            .list_tools(true, &bindings, &token)
            .into_iter()
            .map(|t| t["name"].as_str().unwrap().to_string())
            .collect();
        assert!(!listed.contains(&"calendar_create".to_string()));

        let result = registry
            .dispatch("calendar_create", &json!({}), true, &bindings, &token)
            .await;
        assert!(result.is_error);
    }

    #[tokio::test]
    async fn test_dispatch_unknown_tool() {
        let registry = registry();
        let token = token_with("CalendarService", Permission::Full);
        let result = registry
            .dispatch("no_such_tool", &json!({}), true, &Bindings::default(), &token)
            .await;
        assert!(result.is_error);
        match &result.content[0] {
            crate::mcp::McpContent::Text { text } => {
                assert!(text.contains("not found or service not enabled"));
            }
            _ => panic!("expected text content"),
        }
    }

    #[tokio::test]
    async fn test_dispatch_server_disabled() {
        let registry = registry();
        let token = token_with("CalendarService", Permission::Full);
        let result = registry
            .dispatch("calendar_read", &json!({}), false, &Bindings::default(), &token)
            .await;
        assert!(result.is_error);
        match &result.content[0] {
            crate::mcp::McpContent::Text { text } => assert!(text.contains("disabled")),
            _ => panic!("expected text content"),
        }
    }

    #[tokio::test]
    async fn test_dispatch_service_failure_is_error_result() {
        let mut stub = StubService::new("CalendarService");
        stub.fail = true;
        let registry = Registry::new(vec![Arc::new(stub)]);
        let token = token_with("CalendarService", Permission::Full);

        let result = registry
            .dispatch("calendar_read", &json!({}), true, &Bindings::default(), &token)
            .await;
        assert!(result.is_error);
        match &result.content[0] {
            crate::mcp::McpContent::Text { text } => assert!(text.contains("backend unavailable")),
            _ => panic!("expected text content"),
        }
    }

    #[tokio::test]
    async fn test_dispatch_image_blob_is_base64_wrapped() {
        let mut stub = StubService::new("CalendarService");
        stub.blob_mime = Some("image/png");
        let registry = Registry::new(vec![Arc::new(stub)]);
        let token = token_with("CalendarService", Permission::Full);

        let result = registry
            .dispatch("calendar_read", &json!({}), true, &Bindings::default(), &token)
            .await;
        assert!(!result.is_error);
        match &result.content[0] {
            crate::mcp::McpContent::Image { data, mime_type } => {
                assert_eq!(mime_type, "image/png");
                assert_eq!(data, &BASE64.encode([1u8, 2, 3]));
            }
            _ => panic!("expected image content"),
        }
    }

    #[test]
    fn test_bindings_default_enabled() {
        let bindings = Bindings::default();
        assert!(bindings.is_enabled("anything"));
        let store = BindingsStore::new();
        let old = store.snapshot();
        store.replace(Bindings::new(HashMap::from([("X".to_string(), false)])));
        assert!(old.is_enabled("X"));
        assert!(!store.snapshot().is_enabled("X"));
    }
}
