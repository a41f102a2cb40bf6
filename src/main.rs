//! iMCP daemon entry point.
//!
//! Builds the service registry, loads the settings snapshots, starts the
//! supervised listener, and runs until interrupted. The settings watcher
//! keeps token/service snapshots fresh; the optional message watcher
//! fires the configured script on new incoming messages.

use std::sync::Arc;

use tracing::{info, warn};

use imcp::config::{self, Config};
use imcp::registry::Registry;
use imcp::server::Server;
use imcp::services::{
    calendar::CalendarService, contacts::ContactsService, messages::MessagesService,
    reminders::RemindersService, Service,
};
use imcp::{logging, settings, watcher};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let support_dir = config::support_dir();
    let _log_guard = logging::init(&config::log_dir(&support_dir));

    let cfg = Config::load(&support_dir);
    let data_dir = config::data_dir(&support_dir);
    std::fs::create_dir_all(&data_dir)?;

    let message_db = cfg
        .watcher
        .database_path
        .clone()
        .unwrap_or_else(config::default_message_db_path);

    let services: Vec<Arc<dyn Service>> = vec![
        Arc::new(CalendarService::new(&data_dir)),
        Arc::new(RemindersService::new(&data_dir)),
        Arc::new(ContactsService::new(&data_dir)),
        Arc::new(MessagesService::new(message_db)),
    ];
    for service in &services {
        if !service.is_activated() {
            if let Err(e) = service.activate() {
                warn!(service = service.id(), error = %e, "Service not activated");
            }
        }
    }

    let server = Arc::new(Server::new(Registry::new(services), support_dir.clone()));
    settings::apply(&server, &support_dir);
    server.start();

    let mut settings_watcher = settings::start_watcher(server.clone(), support_dir.clone())?;

    let message_watcher = if cfg.watcher.enabled {
        match watcher::start(&cfg.watcher).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "Message watcher unavailable");
                None
            }
        }
    } else {
        None
    };

    info!(support_dir = %support_dir.display(), "iMCP daemon running");
    tokio::signal::ctrl_c().await?;
    info!("Interrupt received, shutting down");

    if let Some(handle) = message_watcher {
        handle.stop().await;
    }
    settings_watcher.stop();
    server.stop().await;

    Ok(())
}
