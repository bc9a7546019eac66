//! Bootstrap utilities for courier binaries.

use std::future::Future;

use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use backon::BackoffBuilder;

use super::retry::connection_backoff;

/// Initialize tracing with the COURIER_LOG environment variable.
///
/// Defaults to "info" level if COURIER_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env("COURIER_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Connect to a broker, retrying with [`connection_backoff`].
///
/// Returns the last error once attempts run out.
pub async fn connect_with_retry<T, E, F, Fut>(service_name: &str, address: &str, connect: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut result = connect().await;
    for (retry, delay) in connection_backoff().build().enumerate() {
        match &result {
            Ok(_) => break,
            Err(e) => {
                warn!(service = service_name, address, attempt = retry + 1, error = %e, ?delay, "Connection failed, retrying");
            }
        }
        tokio::time::sleep(delay).await;
        result = connect().await;
    }

    match &result {
        Ok(_) => info!(service = service_name, address, "Connected"),
        Err(e) => error!(service = service_name, address, error = %e, "Connection failed, giving up"),
    }
    result
}
