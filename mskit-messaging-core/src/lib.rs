pub mod broker;
mod channel;
pub mod config;
mod connection;
pub mod error;
pub mod handler;
pub mod logging;
pub mod message;
mod service;
pub mod subscription;

pub use broker::{Broker, BrokerChannel, BrokerConnection, Delivery, ExchangeKind, QueueInfo};
pub use config::{load_config, load_config_from_file, AmqpConfig};
pub use connection::ConnectionPhase;
pub use error::{MessagingError, Result};
pub use handler::MessageHandler;
pub use message::Message;
pub use service::{AmqpService, DEFAULT_PRIORITY};
pub use subscription::{
    ResubscribePhase, SubscribeOptions, SubscriptionDescriptor, SubscriptionHandle, MAX_PRIORITY,
};
