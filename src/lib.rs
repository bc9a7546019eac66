//! Courier - transport-agnostic reliable messaging
//!
//! Applications send, publish and receive messages through one abstraction
//! while pluggable hosts (RabbitMQ, Kafka, SNS/SQS, in-memory channels) do
//! the wire work. Delivery is at-least-once across process and transaction
//! boundaries via a transactional outbox and an idempotent inbox, with
//! scheduled dispatch, persisted sagas and per-endpoint resilience.

pub mod addressing;
pub mod bus;
pub mod config;
pub mod dispatch;
pub mod message;
pub mod resilience;
pub mod saga;
pub mod storage;
pub mod transport;
pub mod utils;

pub use bus::{Bus, BusError};
pub use message::{Headers, Message, TransportMessage};
pub use transport::{TransportError, TransportHost};
