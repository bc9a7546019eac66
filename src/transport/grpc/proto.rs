//! Wire types and tonic glue for the `courier.transport.Transport` service.
//!
//! Mirrors `proto/courier/transport.proto`. Written out by hand so building
//! the crate does not need `protoc`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use tonic::codegen::{http, Body, BoxFuture, Context, Poll, Service, StdError};
use tonic::transport::Channel;
use tonic::{Request, Response, Status};
use uuid::Uuid;

use crate::message::{Headers, TransportMessage};

pub const SERVICE_NAME: &str = "courier.transport.Transport";
const SEND_PATH: &str = "/courier.transport.Transport/Send";
const PUBLISH_PATH: &str = "/courier.transport.Transport/Publish";

/// A transport message on the wire.
#[derive(Clone, PartialEq, prost::Message)]
pub struct WireMessage {
    #[prost(bytes = "bytes", tag = "1")]
    pub body: Bytes,
    #[prost(string, optional, tag = "2")]
    pub content_type: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub message_id: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub correlation_id: Option<String>,
    #[prost(string, optional, tag = "5")]
    pub conversation_id: Option<String>,
    #[prost(string, optional, tag = "6")]
    pub message_type: Option<String>,
    #[prost(int64, optional, tag = "7")]
    pub sent_time_unix_ms: Option<i64>,
    #[prost(map = "string, string", tag = "8")]
    pub headers: HashMap<String, String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SendRequest {
    /// Full destination address; its first path segment names the endpoint.
    #[prost(string, tag = "1")]
    pub destination: String,
    #[prost(message, optional, tag = "2")]
    pub message: Option<WireMessage>,
}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct SendResponse {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PublishRequest {
    #[prost(message, optional, tag = "1")]
    pub message: Option<WireMessage>,
}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct PublishResponse {
    /// Endpoints the message was delivered to.
    #[prost(uint32, tag = "1")]
    pub delivered: u32,
}

impl From<&TransportMessage> for WireMessage {
    fn from(message: &TransportMessage) -> Self {
        WireMessage {
            body: message.body().clone(),
            content_type: message.content_type().map(str::to_string),
            message_id: message.message_id().map(|id| id.to_string()),
            correlation_id: message.correlation_id().map(|id| id.to_string()),
            conversation_id: message.conversation_id().map(|id| id.to_string()),
            message_type: message.message_type().map(str::to_string),
            sent_time_unix_ms: message.sent_time().map(|time| time.timestamp_millis()),
            headers: message
                .headers()
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
        }
    }
}

impl TryFrom<WireMessage> for TransportMessage {
    type Error = Status;

    fn try_from(wire: WireMessage) -> Result<Self, Status> {
        let mut builder = TransportMessage::builder(wire.body)
            .headers(wire.headers.into_iter().collect::<Headers>())
            .correlation_id(parse_id("correlation_id", wire.correlation_id)?)
            .conversation_id(parse_id("conversation_id", wire.conversation_id)?);
        if let Some(content_type) = wire.content_type {
            builder = builder.content_type(content_type);
        }
        if let Some(message_type) = wire.message_type {
            builder = builder.message_type(message_type);
        }
        if let Some(id) = parse_id("message_id", wire.message_id)? {
            builder = builder.message_id(id);
        }
        if let Some(millis) = wire.sent_time_unix_ms {
            builder = builder.sent_time(sent_time(millis)?);
        }
        Ok(builder.build())
    }
}

fn parse_id(field: &str, raw: Option<String>) -> Result<Option<Uuid>, Status> {
    match raw.filter(|raw| !raw.is_empty()) {
        None => Ok(None),
        Some(raw) => Uuid::parse_str(&raw)
            .map(Some)
            .map_err(|e| Status::invalid_argument(format!("{field} '{raw}' is not a UUID: {e}"))),
    }
}

fn sent_time(millis: i64) -> Result<DateTime<Utc>, Status> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| Status::invalid_argument(format!("sent_time_unix_ms {millis} is out of range")))
}

// ============================================================================
// Client
// ============================================================================

/// Unary client for the transport service.
#[derive(Debug, Clone)]
pub struct TransportClient {
    inner: tonic::client::Grpc<Channel>,
}

impl TransportClient {
    pub fn new(channel: Channel, max_message_size: usize) -> Self {
        let inner = tonic::client::Grpc::new(channel)
            .max_decoding_message_size(max_message_size)
            .max_encoding_message_size(max_message_size);
        Self { inner }
    }

    pub async fn send(&mut self, request: SendRequest) -> Result<Response<SendResponse>, Status> {
        self.unary(request, SEND_PATH).await
    }

    pub async fn publish(&mut self, request: PublishRequest) -> Result<Response<PublishResponse>, Status> {
        self.unary(request, PUBLISH_PATH).await
    }

    async fn unary<Req, Resp>(&mut self, request: Req, path: &'static str) -> Result<Response<Resp>, Status>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        self.inner
            .ready()
            .await
            .map_err(|e| Status::unavailable(format!("transport service not ready: {e}")))?;
        let codec = tonic::codec::ProstCodec::<Req, Resp>::default();
        let path = http::uri::PathAndQuery::from_static(path);
        self.inner.unary(Request::new(request), path, codec).await
    }
}

// ============================================================================
// Server
// ============================================================================

/// Server-side behavior of the transport service.
#[async_trait]
pub trait TransportService: Send + Sync + 'static {
    async fn send(&self, request: SendRequest) -> Result<SendResponse, Status>;

    async fn publish(&self, request: PublishRequest) -> Result<PublishResponse, Status>;
}

/// tower service routing the two unary methods to a [`TransportService`].
pub struct TransportServer<T> {
    inner: Arc<T>,
    max_message_size: usize,
}

impl<T: TransportService> TransportServer<T> {
    pub fn new(inner: Arc<T>, max_message_size: usize) -> Self {
        Self {
            inner,
            max_message_size,
        }
    }
}

impl<T> Clone for TransportServer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            max_message_size: self.max_message_size,
        }
    }
}

impl<T> tonic::server::NamedService for TransportServer<T> {
    const NAME: &'static str = SERVICE_NAME;
}

struct SendMethod<T>(Arc<T>);

impl<T: TransportService> tonic::server::UnaryService<SendRequest> for SendMethod<T> {
    type Response = SendResponse;
    type Future = BoxFuture<Response<SendResponse>, Status>;

    fn call(&mut self, request: Request<SendRequest>) -> Self::Future {
        let inner = self.0.clone();
        Box::pin(async move { inner.send(request.into_inner()).await.map(Response::new) })
    }
}

struct PublishMethod<T>(Arc<T>);

impl<T: TransportService> tonic::server::UnaryService<PublishRequest> for PublishMethod<T> {
    type Response = PublishResponse;
    type Future = BoxFuture<Response<PublishResponse>, Status>;

    fn call(&mut self, request: Request<PublishRequest>) -> Self::Future {
        let inner = self.0.clone();
        Box::pin(async move { inner.publish(request.into_inner()).await.map(Response::new) })
    }
}

impl<T, B> Service<http::Request<B>> for TransportServer<T>
where
    T: TransportService,
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<tonic::body::BoxBody>;
    type Error = std::convert::Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let inner = self.inner.clone();
        let limit = Some(self.max_message_size);
        match req.uri().path() {
            SEND_PATH => Box::pin(async move {
                let mut grpc = tonic::server::Grpc::new(tonic::codec::ProstCodec::default())
                    .apply_max_message_size_config(limit, limit);
                Ok(grpc.unary(SendMethod(inner), req).await)
            }),
            PUBLISH_PATH => Box::pin(async move {
                let mut grpc = tonic::server::Grpc::new(tonic::codec::ProstCodec::default())
                    .apply_max_message_size_config(limit, limit);
                Ok(grpc.unary(PublishMethod(inner), req).await)
            }),
            _ => Box::pin(async move {
                let mut response = http::Response::new(tonic::body::empty_body());
                let headers = response.headers_mut();
                headers.insert(
                    tonic::Status::GRPC_STATUS,
                    (tonic::Code::Unimplemented as i32).into(),
                );
                headers.insert(
                    http::header::CONTENT_TYPE,
                    tonic::metadata::GRPC_CONTENT_TYPE,
                );
                Ok(response)
            }),
        }
    }
}
