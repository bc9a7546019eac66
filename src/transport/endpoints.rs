//! Receive endpoint bookkeeping shared by every host.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use url::Url;

use super::{ReceiveEndpoint, Result};

/// Identity of an input address: scheme and host ignore case, a trailing
/// slash on the path is insignificant.
pub fn address_key(address: &Url) -> String {
    let host = address.host_str().unwrap_or_default().to_ascii_lowercase();
    let port = address
        .port()
        .map(|port| format!(":{port}"))
        .unwrap_or_default();
    format!(
        "{}://{}{}{}",
        address.scheme().to_ascii_lowercase(),
        host,
        port,
        address.path().trim_end_matches('/')
    )
}

/// Endpoints in connection order, unique per input address.
///
/// Once [`start_all`](Self::start_all) has run, newly attached endpoints are
/// started immediately with the same cancellation token.
#[derive(Default)]
pub struct EndpointSet {
    endpoints: Mutex<Vec<(String, Arc<dyn ReceiveEndpoint>)>>,
    running: Mutex<Option<CancellationToken>>,
}

impl EndpointSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, address: &Url) -> Option<Arc<dyn ReceiveEndpoint>> {
        let key = address_key(address);
        self.lock()
            .iter()
            .find(|(existing, _)| *existing == key)
            .map(|(_, endpoint)| endpoint.clone())
    }

    /// Register `endpoint` unless one already exists for its address, in
    /// which case the existing endpoint is returned and `endpoint` dropped.
    /// A new endpoint is started when the set is already running.
    pub async fn attach(&self, endpoint: Arc<dyn ReceiveEndpoint>) -> Result<Arc<dyn ReceiveEndpoint>> {
        let key = address_key(endpoint.input_address());
        {
            let mut endpoints = self.lock();
            if let Some((_, existing)) = endpoints.iter().find(|(existing, _)| *existing == key) {
                return Ok(existing.clone());
            }
            info!(address = %endpoint.input_address(), "Receive endpoint connected");
            endpoints.push((key, endpoint.clone()));
        }

        let running = self.running_token();
        if let Some(cancel) = running {
            endpoint.start(&cancel).await?;
        }
        Ok(endpoint)
    }

    /// Start every endpoint in connection order and keep `cancel` for
    /// endpoints attached later.
    pub async fn start_all(&self, cancel: &CancellationToken) -> Result<()> {
        *self
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(cancel.clone());
        for endpoint in self.all() {
            endpoint.start(cancel).await?;
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running_token().is_some()
    }

    fn running_token(&self) -> Option<CancellationToken> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn all(&self) -> Vec<Arc<dyn ReceiveEndpoint>> {
        self.lock()
            .iter()
            .map(|(_, endpoint)| endpoint.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Stop every endpoint in connection order. All endpoints are attempted;
    /// the first error is returned.
    pub async fn stop_all(&self) -> Result<()> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let mut first_error = None;
        for endpoint in self.all() {
            if let Err(e) = endpoint.stop().await {
                error!(address = %endpoint.input_address(), error = %e, "Failed to stop receive endpoint");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(String, Arc<dyn ReceiveEndpoint>)>> {
        self.endpoints
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
