//! On-disk configuration snapshots and the settings watcher.
//!
//! The UI layer owns `tokens.json` and `services.json` in the support
//! directory; the daemon only ever reads them. A notify watcher picks up
//! every change, coalesces write bursts, and installs fresh snapshots into
//! the running server — which broadcasts `tools/list_changed` if anything
//! actually differs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config;
use crate::registry::Bindings;
use crate::server::Server;
use crate::tokens::Token;

/// Coalescing window for bursts of file events.
const DEBOUNCE: Duration = Duration::from_millis(500);

/// Shutdown-check interval for the watcher thread.
const IDLE_RECHECK: Duration = Duration::from_secs(5);

#[derive(Debug, Default, Serialize, Deserialize)]
struct TokenFile {
    #[serde(default)]
    tokens: Vec<Token>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ServiceFile {
    #[serde(default)]
    services: HashMap<String, bool>,
}

fn read_json<T: serde::de::DeserializeOwned + Default>(path: &Path) -> T {
    match std::fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
            // Mid-rewrite parse failures are expected with atomic writers.
            debug!(path = %path.display(), "Settings parse failed: {}", e);
            T::default()
        }),
        Err(_) => T::default(),
    }
}

/// Load the token snapshot file.
pub fn load_tokens(support_dir: &Path) -> Vec<Token> {
    read_json::<TokenFile>(&config::tokens_path(support_dir)).tokens
}

/// Load the per-service enabled flags.
pub fn load_bindings(support_dir: &Path) -> Bindings {
    Bindings::new(read_json::<ServiceFile>(&config::services_path(support_dir)).services)
}

/// Load both settings files and install them into the server.
pub fn apply(server: &Server, support_dir: &Path) {
    server.update_tokens(load_tokens(support_dir));
    server.update_bindings(load_bindings(support_dir));
}

/// Handle for controlling the settings watcher lifecycle.
pub struct SettingsWatcherHandle {
    running: Arc<Mutex<bool>>,
    _watcher: Option<RecommendedWatcher>,
}

impl SettingsWatcherHandle {
    pub fn is_running(&self) -> bool {
        *self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn stop(&mut self) {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        *running = false;
        self._watcher = None;
        info!("Settings watcher stopped");
    }
}

fn is_settings_file(path: &Path) -> bool {
    path.file_name()
        .map(|f| {
            f == "tokens.json"
                || f == "services.json"
                || f == "tokens.json.tmp"
                || f == "services.json.tmp"
        })
        .unwrap_or(false)
}

/// Watch the support directory for settings changes.
///
/// Follows the inbox-watcher lifecycle: a notify handle feeding a channel,
/// plus a processing thread that debounces and reloads.
pub fn start_watcher(
    server: Arc<Server>,
    support_dir: PathBuf,
) -> Result<SettingsWatcherHandle, notify::Error> {
    std::fs::create_dir_all(&support_dir).ok();

    let running = Arc::new(Mutex::new(true));
    let (tx, rx) = std::sync::mpsc::channel::<()>();

    let mut watcher =
        notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
            Ok(event) => {
                let relevant = matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
                    && event.paths.iter().any(|p| is_settings_file(p));
                if relevant {
                    let _ = tx.send(());
                }
            }
            Err(e) => error!("Settings watcher error: {}", e),
        })?;

    watcher.watch(&support_dir, RecursiveMode::NonRecursive)?;

    let running_clone = Arc::clone(&running);
    let thread = std::thread::Builder::new()
        .name("settings-watcher".into())
        .spawn(move || {
            info!(dir = %support_dir.display(), "Settings watcher started");
            loop {
                match rx.recv_timeout(IDLE_RECHECK) {
                    Ok(()) => {
                        // Coalesce the rest of the write burst.
                        std::thread::sleep(DEBOUNCE);
                        while rx.try_recv().is_ok() {}
                    }
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                        let is_running =
                            *running_clone.lock().unwrap_or_else(|e| e.into_inner());
                        if !is_running {
                            break;
                        }
                        continue;
                    }
                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
                }

                let is_running = *running_clone.lock().unwrap_or_else(|e| e.into_inner());
                if !is_running {
                    break;
                }

                debug!("Settings changed, reloading snapshots");
                apply(&server, &support_dir);
            }
            info!("Settings watcher thread exited");
        });

    if let Err(e) = thread {
        warn!("Failed to spawn settings watcher thread: {}", e);
    }

    Ok(SettingsWatcherHandle {
        running,
        _watcher: Some(watcher),
    })
}
