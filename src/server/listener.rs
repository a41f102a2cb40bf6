//! Loopback TCP listener with self-healing supervision.
//!
//! The listener binds an OS-assigned ephemeral port on 127.0.0.1 — never
//! any other interface — and writes the port file once it is accepting.
//! A supervisor wraps it: if the serve task ends, or a 10-second poll
//! finds it stuck outside `Ready`, the port file is deleted and the
//! listener restarts on a fresh ephemeral port after a short delay.

use std::io;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::{interval_at, sleep, Instant};
use tracing::{debug, info, warn};

use super::{port_file, session, ServerShared};

/// Delay before rebinding after a failure.
pub const RESTART_DELAY: Duration = Duration::from_millis(1500);

/// Supervisor poll period.
pub const SUPERVISOR_POLL: Duration = Duration::from_secs(10);

/// Listener lifecycle states, published through a watch channel for the
/// supervisor poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Setup,
    Waiting,
    Ready,
    Failed,
    Cancelled,
}

enum Outcome {
    Shutdown,
    Ended,
    Stuck,
}

/// Run the listener under supervision until shutdown is signalled.
pub(crate) async fn supervise(
    shared: Arc<ServerShared>,
    support_dir: PathBuf,
    mut shutdown: watch::Receiver<bool>,
) {
    let (status_tx, status_rx) = watch::channel(ListenerState::Setup);

    loop {
        if *shutdown.borrow() {
            break;
        }

        let mut serve = tokio::spawn(bind_and_serve(
            shared.clone(),
            support_dir.clone(),
            shutdown.clone(),
            status_tx.clone(),
        ));
        // First poll lands after a full period so a listener still binding
        // is not treated as stuck.
        let mut poll = interval_at(Instant::now() + SUPERVISOR_POLL, SUPERVISOR_POLL);

        let outcome = loop {
            tokio::select! {
                result = &mut serve => {
                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!(error = %e, "Listener ended with error"),
                        Err(e) => warn!(error = %e, "Listener task aborted"),
                    }
                    break Outcome::Ended;
                }
                _ = shutdown.changed() => break Outcome::Shutdown,
                _ = poll.tick() => {
                    let state = *status_rx.borrow();
                    if state != ListenerState::Ready {
                        warn!(?state, "Listener left ready without recovering, forcing restart");
                        break Outcome::Stuck;
                    }
                }
            }
        };

        // Make sure the serve task is fully gone before touching the
        // port file it may still be writing.
        if !matches!(outcome, Outcome::Ended) {
            serve.abort();
            let _ = serve.await;
        }

        // The port file never outlives the listener that wrote it.
        if let Err(e) = port_file::delete(&support_dir).await {
            warn!(error = %e, "Failed to delete port file");
        }

        match outcome {
            Outcome::Shutdown => break,
            Outcome::Ended | Outcome::Stuck => {
                let _ = status_tx.send(ListenerState::Setup);
                sleep(RESTART_DELAY).await;
            }
        }
    }

    let _ = status_tx.send(ListenerState::Cancelled);
    debug!("Listener supervisor exited");
}

/// Bind, publish the port, and accept until an error ends the loop.
async fn bind_and_serve(
    shared: Arc<ServerShared>,
    support_dir: PathBuf,
    shutdown: watch::Receiver<bool>,
    status: watch::Sender<ListenerState>,
) -> io::Result<()> {
    let _ = status.send(ListenerState::Setup);

    let listener = match TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await {
        Ok(listener) => listener,
        Err(e) => {
            let state = if e.kind() == io::ErrorKind::AddrInUse {
                ListenerState::Waiting
            } else {
                ListenerState::Failed
            };
            let _ = status.send(state);
            return Err(e);
        }
    };

    let port = listener.local_addr()?.port();
    port_file::write(&support_dir, port).await?;
    let _ = status.send(ListenerState::Ready);
    info!(port, "Listening on 127.0.0.1");

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "Accepted connection");
                tokio::spawn(session::run_connection(
                    stream,
                    peer,
                    shared.clone(),
                    shutdown.clone(),
                ));
            }
            Err(e) => {
                warn!(error = %e, "Accept failed");
                let _ = status.send(ListenerState::Failed);
                return Err(e);
            }
        }
    }
}
