//! Server runtime: process-wide state, session tracking, and the change
//! broadcaster.
//!
//! The daemon owns exactly one [`Server`]. Starting it launches the
//! supervised loopback listener; every accepted connection becomes an
//! independent session task. The server can be enabled/disabled without
//! tearing sessions down — a disabled server answers `tools/list` with an
//! empty catalog and fails every `tools/call` with a user-visible error.
//!
//! Config snapshots (tokens, service bindings) are swapped atomically;
//! any change that could alter a session's tool catalog fans out one
//! `tools/list_changed` notification per live session.

pub mod auth;
pub mod listener;
pub mod port_file;
pub mod session;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::registry::{Bindings, BindingsStore, Registry};
use crate::tokens::{Token, TokenStore};

// ---------------------------------------------------------------------------
// Session set
// ---------------------------------------------------------------------------

/// Live sessions, keyed by connection id. Each entry holds the channel the
/// broadcaster pushes change notices through.
#[derive(Default)]
pub(crate) struct SessionSet {
    inner: Mutex<HashMap<Uuid, mpsc::UnboundedSender<()>>>,
}

impl SessionSet {
    pub(crate) fn register(&self, id: Uuid, notify_tx: mpsc::UnboundedSender<()>) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, notify_tx);
    }

    pub(crate) fn remove(&self, id: &Uuid) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Push one notice to every session live at the moment of the call.
    /// A closed channel just means the session is already tearing down.
    pub(crate) fn notify_all(&self) -> usize {
        let targets: Vec<_> = {
            let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            guard.values().cloned().collect()
        };
        let mut delivered = 0;
        for tx in targets {
            if tx.send(()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

// ---------------------------------------------------------------------------
// Shared state + server handle
// ---------------------------------------------------------------------------

/// State shared by the listener, every session, and the admin surface.
pub struct ServerShared {
    pub enabled: AtomicBool,
    pub tokens: TokenStore,
    pub bindings: BindingsStore,
    pub registry: Registry,
    pub(crate) sessions: SessionSet,
}

impl ServerShared {
    pub fn new(registry: Registry) -> Self {
        Self {
            enabled: AtomicBool::new(true),
            tokens: TokenStore::new(),
            bindings: BindingsStore::new(),
            registry,
            sessions: SessionSet::default(),
        }
    }
}

/// The process-wide server instance.
pub struct Server {
    shared: Arc<ServerShared>,
    support_dir: PathBuf,
    shutdown: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    pub fn new(registry: Registry, support_dir: PathBuf) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(ServerShared::new(registry)),
            support_dir,
            shutdown,
            supervisor: Mutex::new(None),
        }
    }

    pub fn shared(&self) -> Arc<ServerShared> {
        self.shared.clone()
    }

    /// Start the supervised listener. Idempotent.
    pub fn start(&self) {
        let mut guard = self.supervisor.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() {
            return;
        }
        info!("Starting server");
        let task = tokio::spawn(listener::supervise(
            self.shared.clone(),
            self.support_dir.clone(),
            self.shutdown.subscribe(),
        ));
        *guard = Some(task);
    }

    /// Stop the listener and cancel every session. The port file is
    /// removed before this returns.
    pub async fn stop(&self) {
        let task = {
            let mut guard = self.supervisor.lock().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        let Some(task) = task else { return };

        info!("Stopping server");
        let _ = self.shutdown.send(true);
        if let Err(e) = task.await {
            warn!(error = %e, "Listener supervisor ended abnormally");
        }
        if let Err(e) = port_file::delete(&self.support_dir).await {
            warn!(error = %e, "Failed to delete port file on stop");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::SeqCst)
    }

    /// Enable or disable tool serving without touching sessions. Crossing
    /// the boundary fans out a change notification.
    pub fn set_enabled(&self, enabled: bool) {
        let previous = self.shared.enabled.swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            info!(enabled, "Server enabled state changed");
            self.broadcast_tools_changed();
        }
    }

    /// Install a new token snapshot. Broadcasts only when something
    /// actually changed.
    pub fn update_tokens(&self, tokens: Vec<Token>) {
        if self.shared.tokens.snapshot().tokens == tokens {
            return;
        }
        self.shared.tokens.replace(tokens);
        debug!("Token snapshot replaced");
        self.broadcast_tools_changed();
    }

    /// Install new service bindings. Broadcasts only on change.
    pub fn update_bindings(&self, bindings: Bindings) {
        if *self.shared.bindings.snapshot() == bindings {
            return;
        }
        self.shared.bindings.replace(bindings);
        debug!("Service bindings replaced");
        self.broadcast_tools_changed();
    }

    /// Tell every live session its tool list may have changed.
    pub fn broadcast_tools_changed(&self) {
        let delivered = self.shared.sessions.notify_all();
        debug!(sessions = delivered, "Broadcast tools/list_changed");
    }

    pub fn session_count(&self) -> usize {
        self.shared.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::Permission;

    #[test]
    fn test_session_set_register_notify_remove() {
        let set = SessionSet::default();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        set.register(a, tx_a);
        set.register(b, tx_b);
        assert_eq!(set.len(), 2);

        assert_eq!(set.notify_all(), 2);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());

        set.remove(&a);
        assert_eq!(set.len(), 1);
        assert_eq!(set.notify_all(), 1);
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_update_tokens_broadcasts_once_per_change() {
        let server = Server::new(Registry::new(Vec::new()), PathBuf::from("/tmp/unused"));
        let (tx, mut rx) = mpsc::unbounded_channel();
        server.shared.sessions.register(Uuid::new_v4(), tx);

        let mut token = Token::generate("Claude");
        token
            .permissions
            .insert("CalendarService".into(), Permission::ReadOnly);
        server.update_tokens(vec![token.clone()]);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());

        // Same snapshot again: no notification.
        server.update_tokens(vec![token.clone()]);
        assert!(rx.try_recv().is_err());

        // Permission change: exactly one notification.
        token
            .permissions
            .insert("CalendarService".into(), Permission::Full);
        server.update_tokens(vec![token]);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_set_enabled_broadcasts_only_on_boundary() {
        let server = Server::new(Registry::new(Vec::new()), PathBuf::from("/tmp/unused"));
        let (tx, mut rx) = mpsc::unbounded_channel();
        server.shared.sessions.register(Uuid::new_v4(), tx);

        assert!(server.is_enabled());
        server.set_enabled(true); // no boundary crossed
        assert!(rx.try_recv().is_err());

        server.set_enabled(false);
        assert!(rx.try_recv().is_ok());
        server.set_enabled(false);
        assert!(rx.try_recv().is_err());
    }
}
