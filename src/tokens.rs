//! Authentication tokens and the process-wide token snapshot store.
//!
//! Tokens are created and persisted by the UI layer; the server only ever
//! consumes an immutable snapshot of them. Updates replace the whole
//! snapshot atomically — sessions already admitted keep the token they
//! authenticated with.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Length of a token secret in raw bytes (rendered as 64 lowercase hex chars).
pub const SECRET_LEN: usize = 32;

/// Per-service permission level carried by a token.
///
/// Absence of a service key in the permission map means `Off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Permission {
    #[default]
    #[serde(rename = "off")]
    Off,
    #[serde(rename = "readOnly")]
    ReadOnly,
    #[serde(rename = "full")]
    Full,
}

impl Permission {
    /// Whether a tool with the given `readOnlyHint` is allowed at this level.
    pub fn permits(self, read_only_hint: bool) -> bool {
        match self {
            Permission::Off => false,
            Permission::ReadOnly => read_only_hint,
            Permission::Full => true,
        }
    }
}

/// An authentication token with its per-service permission map.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub id: String,
    pub name: String,
    /// 32-byte secret rendered as 64 lowercase hex characters. Generated
    /// once from the OS RNG, never mutated, never logged.
    pub secret: String,
    #[serde(rename = "createdAt")]
    pub created_at: u64,
    #[serde(default)]
    pub permissions: HashMap<String, Permission>,
}

impl Token {
    /// Generate a fresh token with a random secret and no permissions.
    pub fn generate(name: impl Into<String>) -> Self {
        let mut bytes = [0u8; SECRET_LEN];
        OsRng.fill_bytes(&mut bytes);
        let secret: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            secret,
            created_at,
            permissions: HashMap::new(),
        }
    }

    /// Permission level for a service. Missing keys mean `Off`.
    pub fn permission(&self, service_id: &str) -> Permission {
        self.permissions.get(service_id).copied().unwrap_or_default()
    }
}

// The secret must never leak through debug formatting of sessions or
// server state.
impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("secret", &"<redacted>")
            .field("created_at", &self.created_at)
            .field("permissions", &self.permissions)
            .finish()
    }
}

/// Immutable, ordered snapshot of all known tokens.
#[derive(Debug, Default)]
pub struct TokenSnapshot {
    pub tokens: Vec<Token>,
}

impl TokenSnapshot {
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Process-wide token store.
///
/// Readers take one `Arc` reference for the duration of a request; writers
/// build a new snapshot and publish it with a single pointer swap. There is
/// no partial mutation.
#[derive(Debug, Default)]
pub struct TokenStore {
    snapshot: RwLock<Arc<TokenSnapshot>>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot. Cheap; clones only the Arc.
    pub fn snapshot(&self) -> Arc<TokenSnapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replace the whole snapshot. In-flight sessions keep the token they
    /// were admitted with.
    pub fn replace(&self, tokens: Vec<Token>) {
        let next = Arc::new(TokenSnapshot { tokens });
        let mut guard = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        *guard = next;
    }

    /// List tokens in stable creation order (UI boundary).
    pub fn list(&self) -> Vec<Token> {
        self.snapshot().tokens.clone()
    }

    /// Create a token, publish the new snapshot, and hand the token (with
    /// its secret) back exactly once (UI boundary).
    pub fn create(&self, name: impl Into<String>) -> Token {
        let token = Token::generate(name);
        let mut tokens = self.snapshot().tokens.clone();
        tokens.push(token.clone());
        self.replace(tokens);
        token
    }

    /// Revoke a token by id. Returns `true` if one was removed (UI boundary).
    pub fn revoke(&self, id: &str) -> bool {
        let mut tokens = self.snapshot().tokens.clone();
        let before = tokens.len();
        tokens.retain(|t| t.id != id);
        let removed = tokens.len() != before;
        if removed {
            self.replace(tokens);
        }
        removed
    }
}
