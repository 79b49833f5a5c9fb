// mskit-messaging-core/src/broker.rs
//! Seam between the service and a concrete broker client.
//!
//! The service only ever talks to these traits; `mskit-messaging-rabbitmq`
//! implements them on top of `lapin`, tests implement them in memory.
use std::{fmt, str::FromStr, sync::Arc};

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use tokio::sync::mpsc;

use crate::{MessagingError, Result};

/// Exchange routing type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Headers,
    #[default]
    Topic,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Fanout => "fanout",
            Self::Headers => "headers",
            Self::Topic => "topic",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeKind {
    type Err = MessagingError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "fanout" => Ok(Self::Fanout),
            "headers" => Ok(Self::Headers),
            "topic" => Ok(Self::Topic),
            other => Err(MessagingError::InvalidParameters(format!(
                "unknown exchange type '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExchangeOptions {
    pub durable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueOptions {
    pub durable: bool,
    /// Enables broker-side priority ordering (`x-max-priority`).
    pub max_priority: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOptions {
    pub priority: u8,
    pub persistent: bool,
}

/// Queue metadata as reported by a declare or passive check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub queue: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// A message handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub priority: Option<u8>,
    pub data: Vec<u8>,
}

impl Delivery {
    /// Body decoded as UTF-8 (lossy) with surrounding whitespace removed.
    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(&self.data).trim().to_string()
    }
}

/// Stream of deliveries for one consumer. The stream ends when the
/// underlying channel closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Error text that marks a close we requested. Logged at trace level only.
pub const CONNECTION_CLOSING: &str = "Connection closing";

/// Lifecycle notifications emitted by a live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Error(String),
    Closed,
}

/// A freshly opened connection together with its event feed.
pub struct BrokerLink {
    pub connection: Arc<dyn BrokerConnection>,
    pub events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self, uri: &str) -> Result<BrokerLink>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn assert_exchange(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<()>;

    async fn assert_queue(&self, queue: &str, options: QueueOptions) -> Result<QueueInfo>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Passive declare; fails with `QueueNotFound` when the queue is missing.
    async fn check_queue(&self, queue: &str) -> Result<QueueInfo>;

    /// Passive declare; fails with `ExchangeNotFound` when the exchange is missing.
    async fn check_exchange(&self, exchange: &str) -> Result<()>;

    /// Returns the number of purged messages.
    async fn purge_queue(&self, queue: &str) -> Result<u32>;

    /// Returns the number of messages deleted along with the queue.
    async fn delete_queue(&self, queue: &str) -> Result<u32>;

    /// An empty `exchange` targets the default exchange, i.e. the queue named
    /// by `routing_key`.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        options: PublishOptions,
    ) -> Result<()>;

    async fn prefetch(&self, count: u16) -> Result<()>;

    async fn consume(&self, queue: &str, consumer_tag: &str, no_ack: bool)
        -> Result<DeliveryStream>;

    async fn get(&self, queue: &str, no_ack: bool) -> Result<Option<Delivery>>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
