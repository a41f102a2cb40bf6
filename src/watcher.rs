//! Message database watcher.
//!
//! Keeps a high-water mark (HWM) over the largest incoming-message ROWID
//! in the host message database. A filesystem watch on the database (and
//! its WAL sidecar) plus a slow polling timer both trigger a re-query;
//! when the maximum grows, a configured external script runs once with
//! `IMCP_NEW_MESSAGE_COUNT` set to the delta. Bursts of file events within
//! the debounce window coalesce into a single trigger.
//!
//! Every failure in here is logged and survived — a broken query or a
//! crashing script never takes the watcher down.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use rusqlite::{Connection, OpenFlags};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::config::{default_message_db_path, WatcherConfig};

/// Environment variable carrying the new-message count to the script.
pub const ENV_NEW_MESSAGE_COUNT: &str = "IMCP_NEW_MESSAGE_COUNT";

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("watch error: {0}")]
    Notify(#[from] notify::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Handle for the running watcher. Dropping it does not stop the task;
/// call [`MessageWatcherHandle::stop`].
pub struct MessageWatcherHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    _watcher: RecommendedWatcher,
}

impl MessageWatcherHandle {
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Message watcher task ended abnormally");
        }
        info!("Message watcher stopped");
    }
}

// ---------------------------------------------------------------------------
// Core: HWM tracking and script execution
// ---------------------------------------------------------------------------

pub(crate) struct WatcherCore {
    db_path: PathBuf,
    script_path: Option<PathBuf>,
    script_timeout: Duration,
    hwm: i64,
}

impl WatcherCore {
    pub(crate) fn new(
        db_path: PathBuf,
        script_path: Option<PathBuf>,
        script_timeout: Duration,
        hwm: i64,
    ) -> Self {
        Self {
            db_path,
            script_path,
            script_timeout,
            hwm,
        }
    }

    pub(crate) fn hwm(&self) -> i64 {
        self.hwm
    }

    /// `MAX(ROWID)` over incoming messages; 0 for an empty table.
    pub(crate) fn query_hwm(db_path: &Path) -> Result<i64, rusqlite::Error> {
        let conn = Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        let max: Option<i64> = conn.query_row(
            "SELECT MAX(ROWID) FROM message WHERE is_from_me = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(max.unwrap_or(0))
    }

    /// Re-query the database; if the maximum grew, fire the script once
    /// and advance the HWM. Returns the detected increase.
    pub(crate) async fn scan(&mut self) -> Option<i64> {
        let db_path = self.db_path.clone();
        let queried =
            tokio::task::spawn_blocking(move || Self::query_hwm(&db_path)).await;
        let new = match queried {
            Ok(Ok(new)) => new,
            Ok(Err(e)) => {
                warn!(error = %e, "HWM query failed");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "HWM query task failed");
                return None;
            }
        };

        // The HWM never decreases.
        if new <= self.hwm {
            return None;
        }
        let count = new - self.hwm;
        info!(count, hwm = new, "New incoming messages detected");
        self.run_script(count).await;
        self.hwm = new;
        Some(count)
    }

    /// Run the configured script with the count in its environment.
    /// Non-zero exits and timeouts are logged, never fatal.
    async fn run_script(&self, count: i64) {
        let Some(script) = &self.script_path else {
            debug!("No message script configured");
            return;
        };

        let mut command = tokio::process::Command::new(script);
        command
            .env(ENV_NEW_MESSAGE_COUNT, count.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(script = %script.display(), error = %e, "Failed to spawn message script");
                return;
            }
        };
        let stderr = child.stderr.take();

        let waited = timeout(self.script_timeout, async {
            let stderr_text = async {
                let mut buf = String::new();
                if let Some(mut pipe) = stderr {
                    let _ = pipe.read_to_string(&mut buf).await;
                }
                buf
            };
            tokio::join!(child.wait(), stderr_text)
        })
        .await;

        match waited {
            Ok((Ok(status), stderr_text)) => {
                let stderr_text = stderr_text.trim();
                if !stderr_text.is_empty() {
                    debug!(script = %script.display(), "Script stderr: {}", stderr_text);
                }
                if !status.success() {
                    warn!(script = %script.display(), ?status, "Message script exited with failure");
                }
            }
            Ok((Err(e), _)) => {
                warn!(script = %script.display(), error = %e, "Failed to wait on message script");
            }
            Err(_) => {
                warn!(script = %script.display(), "Message script timed out, terminating");
                let _ = child.kill().await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Start watching the message database. Fails when the database cannot be
/// opened or the filesystem watch cannot be installed.
pub async fn start(config: &WatcherConfig) -> Result<MessageWatcherHandle, WatcherError> {
    let db_path = config
        .database_path
        .clone()
        .unwrap_or_else(default_message_db_path);

    let initial = {
        let path = db_path.clone();
        tokio::task::spawn_blocking(move || WatcherCore::query_hwm(&path))
            .await
            .map_err(|e| WatcherError::Io(std::io::Error::other(e)))??
    };
    info!(hwm = initial, db = %db_path.display(), "Message watcher starting");

    let core = WatcherCore::new(
        db_path.clone(),
        config.script_path.clone(),
        Duration::from_secs(config.script_timeout_secs),
        initial,
    );

    // Watch the containing directory so the WAL sidecar is covered too.
    let (event_tx, event_rx) = mpsc::unbounded_channel::<()>();
    let db_name = db_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut watcher =
        notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
            Ok(event) => {
                let relevant = matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
                    && event.paths.iter().any(|p| {
                        p.file_name()
                            .map(|f| f.to_string_lossy().starts_with(db_name.as_str()))
                            .unwrap_or(false)
                    });
                if relevant {
                    let _ = event_tx.send(());
                }
            }
            Err(e) => error!("Message watch error: {}", e),
        })?;
    let watch_dir = db_path.parent().unwrap_or(Path::new(".")).to_path_buf();
    watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let debounce = Duration::from_secs(config.debounce_secs);
    let poll = Duration::from_secs(config.poll_secs);
    let task = tokio::spawn(run(core, event_rx, shutdown_rx, debounce, poll));

    Ok(MessageWatcherHandle {
        shutdown: shutdown_tx,
        task,
        _watcher: watcher,
    })
}

async fn run(
    mut core: WatcherCore,
    mut events: mpsc::UnboundedReceiver<()>,
    mut shutdown: watch::Receiver<bool>,
    debounce: Duration,
    poll: Duration,
) {
    let mut poll_timer = interval_at(Instant::now() + poll, poll);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,

            Some(()) = events.recv() => {
                // Debounce: wait out the burst, then drain whatever queued.
                tokio::select! {
                    _ = sleep(debounce) => {}
                    _ = shutdown.changed() => break,
                }
                while events.try_recv().is_ok() {}
                core.scan().await;
            }

            _ = poll_timer.tick() => {
                core.scan().await;
            }
        }
    }

    debug!("Message watcher loop exited");
}
