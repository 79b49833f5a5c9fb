// mskit-messaging-core/src/service.rs
use std::sync::Arc;

use tracing::{error, trace};

use crate::{
    broker::{Broker, ExchangeKind, PublishOptions, QueueInfo, QueueOptions},
    channel::with_channel,
    connection::{ConnectionPhase, ConnectionSupervisor},
    subscription::{validate_max_priority, Subscriber, MAX_PRIORITY},
    AmqpConfig, Message, MessageHandler, MessagingError, Result, SubscribeOptions,
    SubscriptionDescriptor, SubscriptionHandle,
};

/// Priority used when the caller has no preference.
pub const DEFAULT_PRIORITY: u8 = 1;

enum Destination<'a> {
    Queue(&'a str),
    Exchange {
        exchange: &'a str,
        routing_key: &'a str,
    },
}

/// Messaging service over a single supervised broker connection.
///
/// Constructed once by the application and shared by cloning; all clones
/// drive the same connection.
#[derive(Clone)]
pub struct AmqpService {
    supervisor: Arc<ConnectionSupervisor>,
}

impl AmqpService {
    pub fn new(broker: Arc<dyn Broker>, config: AmqpConfig) -> Self {
        Self {
            supervisor: Arc::new(ConnectionSupervisor::new(broker, config)),
        }
    }

    pub fn config(&self) -> &AmqpConfig {
        self.supervisor.config()
    }

    /// Connects to the broker. Never fails loudly: a connect error is logged,
    /// a reconnect is scheduled after the configured delay and `false` is
    /// returned. Invalid configuration returns `false` without retrying.
    pub async fn init(&self) -> bool {
        self.supervisor.init().await
    }

    pub fn is_initialized(&self) -> bool {
        self.supervisor.is_initialized()
    }

    pub fn connection_phase(&self) -> ConnectionPhase {
        self.supervisor.phase()
    }

    /// Closes the connection and cancels any pending reconnect.
    /// Subscriptions are not cancelled and keep waiting for a new `init`.
    pub async fn close(&self) -> Result<()> {
        self.supervisor.close().await
    }

    fn ensure_initialized(&self) -> Result<()> {
        self.supervisor.connection().map(|_| ())
    }

    pub async fn subscribe(
        &self,
        exchange: &str,
        routing_key: &str,
        queue_name: &str,
        handler: Arc<dyn MessageHandler>,
        options: SubscribeOptions,
    ) -> Result<SubscriptionHandle> {
        self.ensure_initialized()?;
        trace!(exchange, routing_key, queue = queue_name, ?options, "subscribe");

        let descriptor = SubscriptionDescriptor {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            queue_name: queue_name.to_string(),
            handler,
            options,
        };
        descriptor.validate()?;

        Subscriber::start(Arc::clone(&self.supervisor), descriptor).await
    }

    pub async fn send_to_queue(&self, queue_name: &str, message: &Message, priority: u8) -> Result<()> {
        self.ensure_initialized()?;
        trace!(queue = queue_name, priority, action = %message.action, "post to queue");
        validate_queue_name(queue_name, "sendToQueue")?;
        validate_priority(priority)?;
        message.validate()?;

        self.deliver(Destination::Queue(queue_name), message.to_bytes()?, priority)
            .await
    }

    pub async fn send_string_to_queue(&self, queue_name: &str, message: &str, priority: u8) -> Result<()> {
        self.ensure_initialized()?;
        trace!(queue = queue_name, priority, "post to queue");
        validate_queue_name(queue_name, "sendStringToQueue")?;
        validate_priority(priority)?;
        validate_raw(message)?;

        self.deliver(Destination::Queue(queue_name), message.as_bytes().to_vec(), priority)
            .await
    }

    /// Publishes to an existing exchange. `exchange_kind` is only recorded in
    /// the trace log; the exchange is checked, never declared.
    pub async fn publish_message(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
        exchange_kind: ExchangeKind,
        priority: u8,
    ) -> Result<()> {
        self.ensure_initialized()?;
        trace!(exchange, routing_key, kind = %exchange_kind, priority, "publish");
        message.validate()?;
        validate_route(exchange, routing_key)?;
        validate_priority(priority)?;

        self.deliver(
            Destination::Exchange {
                exchange,
                routing_key,
            },
            message.to_bytes()?,
            priority,
        )
        .await
    }

    /// Raw-string variant of [`AmqpService::publish_message`].
    pub async fn publish_string(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &str,
        exchange_kind: ExchangeKind,
        priority: u8,
    ) -> Result<()> {
        self.ensure_initialized()?;
        trace!(exchange, routing_key, kind = %exchange_kind, priority, "publish");
        validate_raw(message)?;
        validate_route(exchange, routing_key)?;
        validate_priority(priority)?;

        self.deliver(
            Destination::Exchange {
                exchange,
                routing_key,
            },
            message.as_bytes().to_vec(),
            priority,
        )
        .await
    }

    async fn deliver(&self, destination: Destination<'_>, body: Vec<u8>, priority: u8) -> Result<()> {
        let conn = self.supervisor.connection()?;
        let result = with_channel(&conn, |ch| async move {
            match destination {
                Destination::Queue(queue) => {
                    ch.check_queue(queue).await?;
                    ch.publish(
                        "",
                        queue,
                        &body,
                        PublishOptions {
                            priority,
                            persistent: false,
                        },
                    )
                    .await
                }
                Destination::Exchange {
                    exchange,
                    routing_key,
                } => {
                    ch.check_exchange(exchange).await?;
                    ch.publish(
                        exchange,
                        routing_key,
                        &body,
                        PublishOptions {
                            priority,
                            persistent: true,
                        },
                    )
                    .await
                }
            }
        })
        .await;

        if let Err(e) = &result {
            error!(error = %e, "delivery to broker failed");
        }
        result
    }

    /// Number of ready messages. Fails when the queue does not exist.
    pub async fn get_queue_length(&self, queue_name: &str) -> Result<u32> {
        self.ensure_initialized()?;
        validate_queue_name(queue_name, "getQueueLength")?;

        let conn = self.supervisor.connection()?;
        let info = with_channel(&conn, |ch| async move { ch.check_queue(queue_name).await }).await?;
        Ok(info.message_count)
    }

    /// Queue metadata, or `None` when the queue (or a channel) is unavailable.
    pub async fn get_queue_info(&self, queue_name: &str) -> Result<Option<QueueInfo>> {
        self.ensure_initialized()?;
        validate_queue_name(queue_name, "getQueueInfo")?;

        let conn = self.supervisor.connection()?;
        match with_channel(&conn, |ch| async move { ch.check_queue(queue_name).await }).await {
            Ok(info) => Ok(Some(info)),
            Err(e) => {
                trace!(queue = queue_name, error = %e, "queue info unavailable");
                Ok(None)
            }
        }
    }

    pub async fn is_queue_exist(&self, queue_name: &str) -> Result<bool> {
        Ok(self.get_queue_info(queue_name).await?.is_some())
    }

    pub async fn create_queue(&self, queue_name: &str, max_priority: Option<u8>) -> Result<QueueInfo> {
        self.ensure_initialized()?;
        validate_queue_name(queue_name, "createQueue")?;
        validate_max_priority(max_priority)?;

        let options = QueueOptions {
            durable: self.config().options_durable,
            max_priority,
        };
        let conn = self.supervisor.connection()?;
        with_channel(&conn, |ch| async move { ch.assert_queue(queue_name, options).await }).await
    }

    /// Returns the number of purged messages.
    pub async fn purge_queue(&self, queue_name: &str) -> Result<u32> {
        self.ensure_initialized()?;
        validate_queue_name(queue_name, "purgeQueue")?;

        let conn = self.supervisor.connection()?;
        with_channel(&conn, |ch| async move { ch.purge_queue(queue_name).await }).await
    }

    /// Deletes the queue; returns the number of messages it still held.
    pub async fn remove_queue(&self, queue_name: &str) -> Result<u32> {
        self.ensure_initialized()?;
        validate_queue_name(queue_name, "removeQueue")?;

        let conn = self.supervisor.connection()?;
        with_channel(&conn, |ch| async move { ch.delete_queue(queue_name).await }).await
    }

    /// Takes a single message off the queue (auto-acknowledged) and returns
    /// its trimmed body, or `None` if the queue is empty.
    pub async fn get_message(&self, queue_name: &str) -> Result<Option<String>> {
        self.ensure_initialized()?;
        validate_queue_name(queue_name, "getMessage")?;

        let conn = self.supervisor.connection()?;
        let delivery = with_channel(&conn, |ch| async move { ch.get(queue_name, true).await }).await?;
        Ok(delivery.map(|d| d.body_str()))
    }
}

fn validate_queue_name(queue_name: &str, operation: &str) -> Result<()> {
    if queue_name.is_empty() {
        return Err(MessagingError::InvalidParameters(format!(
            "{operation}: queue name"
        )));
    }
    Ok(())
}

fn validate_priority(priority: u8) -> Result<()> {
    if priority > MAX_PRIORITY {
        return Err(MessagingError::InvalidParameters(format!(
            "priority {priority} out of range 0..={MAX_PRIORITY}"
        )));
    }
    Ok(())
}

fn validate_route(exchange: &str, routing_key: &str) -> Result<()> {
    if exchange.is_empty() || routing_key.is_empty() {
        return Err(MessagingError::InvalidParameters(
            "exchange and routingKey".into(),
        ));
    }
    Ok(())
}

fn validate_raw(message: &str) -> Result<()> {
    if message.is_empty() {
        return Err(MessagingError::InvalidMessage(
            "expecting message in string format, got an empty string".into(),
        ));
    }
    Ok(())
}
