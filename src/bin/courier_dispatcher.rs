//! courier-dispatcher: standalone outbox and scheduled-message dispatcher
//!
//! Delivers what services wrote to a shared SQLite outbox and schedule,
//! so the services themselves need not run the dispatch loops.
//!
//! ## Architecture
//! ```text
//! [service] --(outbox / schedule rows)--> [SQLite] <--(poll)-- [courier-dispatcher]
//!                                                                      |
//!                                                                      v
//!                                                             transport hosts
//! ```
//!
//! ## Configuration
//! - `--config <path>` or COURIER_CONFIG: configuration file
//! - COURIER__STORAGE__PATH: SQLite database file
//! - COURIER_LOG: log filter (default: info)

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use courier::config::Config;
use courier::dispatch::{Delivery, OutboxDispatcher, ScheduledMessageDispatcher};
use courier::storage::{init_storage, StorageKind};
use courier::transport::registry::{TransportHostProvider, TransportRegistry};
use courier::utils::bootstrap::init_tracing;

/// `--config <path>` from the command line, if given.
fn config_path() -> Option<String> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    None
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(config_path().as_deref()).map_err(|e| {
        error!(error = %e, "Failed to load configuration");
        e
    })?;
    if config.storage.kind != StorageKind::Sqlite {
        return Err("courier-dispatcher requires storage.kind = sqlite".into());
    }

    let stores = init_storage(&config.storage).await?;
    info!(path = %config.storage.path, "Initialized storage");

    let registry = TransportRegistry::with_builtin();
    let hosts = Arc::new(
        TransportHostProvider::from_settings(&registry, &config.transport_settings()).await?,
    );
    let cancel = CancellationToken::new();
    for host in hosts.hosts() {
        host.start(&cancel).await?;
    }

    let delivery = Delivery::new(hosts.clone()).with_publish_address(config.bus.address()?);
    let outbox = Arc::new(OutboxDispatcher::new(
        stores.outbox.clone(),
        delivery.clone(),
        config.outbox.clone(),
    ))
    .spawn(cancel.child_token());
    let scheduled = Arc::new(ScheduledMessageDispatcher::new(
        stores.scheduled.clone(),
        delivery,
        config.scheduler.clone(),
    ))
    .spawn(cancel.child_token());

    info!(
        outbox_poll_ms = config.outbox.poll_interval_ms,
        scheduler_poll_ms = config.scheduler.poll_interval_ms,
        "courier-dispatcher started"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    outbox.stop().await;
    scheduled.stop().await;
    cancel.cancel();
    for host in hosts.hosts() {
        if let Err(e) = host.stop().await {
            error!(address = %host.address(), error = %e, "Failed to stop transport host");
        }
    }

    info!("courier-dispatcher stopped");
    Ok(())
}
