//! Request/response over send transports.
//!
//! A request carries `RequestId` and `ResponseAddress` headers. The bus
//! connects one response endpoint on first use; responses are matched to
//! waiting requests by `RequestId`, falling back to the correlation id.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use super::{BusCore, BusError, Result};
use crate::message::{decode_message, headers, Message, TransportMessage};
use crate::transport::{self, handler_fn, ReceiveEndpointConfig};

/// Timeout applied when none is configured.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type Waiters = HashMap<Uuid, oneshot::Sender<TransportMessage>>;

/// Requests awaiting a response, keyed by request id.
#[derive(Clone, Default)]
pub(crate) struct PendingRequests {
    waiters: Arc<Mutex<Waiters>>,
}

impl PendingRequests {
    fn lock(&self) -> std::sync::MutexGuard<'_, Waiters> {
        self.waiters.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn register(&self, request_id: Uuid) -> oneshot::Receiver<TransportMessage> {
        let (sender, receiver) = oneshot::channel();
        self.lock().insert(request_id, sender);
        receiver
    }

    fn forget(&self, request_id: Uuid) {
        self.lock().remove(&request_id);
    }

    /// Hand `response` to its waiter. Returns `false` when nobody waits.
    pub(crate) fn complete(&self, response: TransportMessage) -> bool {
        let Some(request_id) = request_id_of(&response) else {
            return false;
        };
        let waiter = self.lock().remove(&request_id);
        match waiter {
            Some(sender) => sender.send(response).is_ok(),
            None => false,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}

fn request_id_of(message: &TransportMessage) -> Option<Uuid> {
    message
        .headers()
        .get(headers::REQUEST_ID)
        .and_then(|raw| Uuid::parse_str(raw).ok())
        .or(message.correlation_id())
}

/// Address responses are sent to: a dedicated queue under the bus address.
pub(crate) fn response_address(bus_address: &Url) -> Url {
    let mut address = bus_address.clone();
    address.set_path(&format!("responses-{}", Uuid::new_v4().simple()));
    address
}

impl BusCore {
    /// Connect the response endpoint once and return its address.
    pub(crate) async fn response_endpoint(&self) -> Result<&Url> {
        self.response_address
            .get_or_try_init(|| async {
                let address = response_address(&self.address);
                let pending = self.requests.clone();
                let handler = handler_fn(move |context: Arc<transport::ReceiveContext>| {
                    let pending = pending.clone();
                    async move {
                        let message = context.message().clone();
                        let message_type = message.message_type().map(str::to_string);
                        if !pending.complete(message) {
                            debug!(message_type = ?message_type, "Response has no waiting request, dropped");
                        }
                        Ok(())
                    }
                });

                let host = self.delivery.hosts().get_host(&address)?;
                host.connect_receive_endpoint(ReceiveEndpointConfig::new(address.clone(), handler))
                    .await?;
                debug!(address = %address, "Response endpoint connected");
                Ok::<Url, BusError>(address)
            })
            .await
    }
}

/// Sends requests of type `Req` to one destination and awaits responses.
pub struct RequestClient<Req> {
    core: Arc<BusCore>,
    destination: Url,
    timeout: Duration,
    _request: PhantomData<fn(Req)>,
}

impl<Req: Message> RequestClient<Req> {
    pub(crate) fn new(core: Arc<BusCore>, destination: Url, timeout: Duration) -> Self {
        Self {
            core,
            destination,
            timeout: if timeout.is_zero() {
                DEFAULT_REQUEST_TIMEOUT
            } else {
                timeout
            },
            _request: PhantomData,
        }
    }

    pub fn destination(&self) -> &Url {
        &self.destination
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send `request` and wait for a `Resp`.
    ///
    /// Fails with [`BusError::Timeout`] when no response arrives in time and
    /// [`BusError::Cancelled`] when `cancel` fires first.
    pub async fn get_response<Resp: Message>(
        &self,
        request: &Req,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<Resp> {
        let response_address = self.core.response_endpoint().await?.clone();
        let request_id = Uuid::now_v7();
        let receiver = self.core.requests.register(request_id);

        let outgoing = self
            .core
            .envelope(request, Some(request_id), None)?
            .message_id(request_id)
            .header(headers::REQUEST_ID, request_id.to_string())
            .header(headers::RESPONSE_ADDRESS, response_address.as_str())
            .build();

        if let Err(e) = self
            .core
            .send_transport(&self.destination, outgoing, cancel)
            .await
        {
            self.core.requests.forget(request_id);
            return Err(e);
        }
        debug!(request_id = %request_id, request_type = Req::MESSAGE_TYPE, destination = %self.destination, "Request sent");

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(BusError::Cancelled),
            _ = tokio::time::sleep(self.timeout) => Err(BusError::Timeout(self.timeout)),
            response = receiver => response.map_err(|_| BusError::Cancelled),
        };
        self.core.requests.forget(request_id);

        let response = match outcome {
            Ok(response) => response,
            Err(e) => {
                warn!(request_id = %request_id, request_type = Req::MESSAGE_TYPE, error = %e, "Request failed");
                return Err(e);
            }
        };
        let decoded = decode_message(
            self.core.serializer.as_ref(),
            response.content_type(),
            response.body(),
        )?;
        debug!(request_id = %request_id, "Response received");
        Ok(decoded)
    }
}
