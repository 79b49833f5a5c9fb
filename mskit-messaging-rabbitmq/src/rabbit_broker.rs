use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::*,
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, ConnectionState,
    ExchangeKind as LapinExchangeKind,
};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::options::{priority_args, RabbitMqOptions};
use mskit_messaging_core::{
    broker::{
        Broker, BrokerChannel, BrokerConnection, BrokerLink, ConnectionEvent, Delivery,
        DeliveryStream, ExchangeKind, ExchangeOptions, PublishOptions, QueueInfo, QueueOptions,
        CONNECTION_CLOSING,
    },
    MessagingError, Result,
};

const REPLY_SUCCESS: u16 = 200;
const PERSISTENT: u8 = 2;

fn is_not_found(e: &lapin::Error) -> bool {
    matches!(
        e,
        lapin::Error::ProtocolError(err)
            if matches!(err.kind(), AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND))
    )
}

/// Errors raised while a close is already under way are reported as the
/// benign closing message.
fn error_event(e: &lapin::Error) -> ConnectionEvent {
    match e {
        lapin::Error::InvalidConnectionState(ConnectionState::Closing | ConnectionState::Closed) => {
            ConnectionEvent::Error(CONNECTION_CLOSING.to_string())
        }
        other => ConnectionEvent::Error(other.to_string()),
    }
}

fn channel_err(e: lapin::Error) -> MessagingError {
    MessagingError::Channel(e.to_string())
}

fn queue_err(queue: &str, e: lapin::Error) -> MessagingError {
    if is_not_found(&e) {
        MessagingError::QueueNotFound(queue.to_string())
    } else {
        channel_err(e)
    }
}

fn exchange_kind(kind: ExchangeKind) -> LapinExchangeKind {
    match kind {
        ExchangeKind::Direct => LapinExchangeKind::Direct,
        ExchangeKind::Fanout => LapinExchangeKind::Fanout,
        ExchangeKind::Headers => LapinExchangeKind::Headers,
        ExchangeKind::Topic => LapinExchangeKind::Topic,
    }
}

fn into_delivery(d: lapin::message::Delivery) -> Delivery {
    Delivery {
        delivery_tag: d.delivery_tag,
        exchange: d.exchange.as_str().to_string(),
        routing_key: d.routing_key.as_str().to_string(),
        redelivered: d.redelivered,
        priority: *d.properties.priority(),
        data: d.data,
    }
}

/// Opens `lapin` connections.
pub struct RabbitBroker {
    opts: RabbitMqOptions,
}

impl RabbitBroker {
    pub fn new(opts: RabbitMqOptions) -> Self {
        Self { opts }
    }

    fn properties(&self) -> ConnectionProperties {
        let props = ConnectionProperties::default();
        match &self.opts.connection_name {
            Some(name) => props.with_connection_name(name.clone().into()),
            None => props,
        }
    }
}

#[async_trait]
impl Broker for RabbitBroker {
    async fn connect(&self, uri: &str) -> Result<BrokerLink> {
        let conn = Connection::connect(uri, self.properties())
            .await
            .map_err(|e| MessagingError::Connection(e.to_string()))?;

        // lapin reports loss of the connection through its error callback only.
        let (tx, rx) = mpsc::unbounded_channel();
        conn.on_error(move |err| {
            let _ = tx.send(error_event(&err));
            let _ = tx.send(ConnectionEvent::Closed);
        });

        info!("RabbitMQ connected");
        Ok(BrokerLink {
            connection: Arc::new(RabbitConnection {
                conn,
                confirms: self.opts.confirms,
            }),
            events: rx,
        })
    }
}

pub struct RabbitConnection {
    conn: Connection,
    confirms: bool,
}

#[async_trait]
impl BrokerConnection for RabbitConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let ch = self
            .conn
            .create_channel()
            .await
            .map_err(|e| MessagingError::Connection(e.to_string()))?;

        if self.confirms {
            ch.confirm_select(ConfirmSelectOptions { nowait: false })
                .await
                .map_err(channel_err)?;
        }
        Ok(Arc::new(RabbitChannel { ch }))
    }

    async fn close(&self) -> Result<()> {
        self.conn
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|e| MessagingError::Connection(e.to_string()))
    }
}

pub struct RabbitChannel {
    ch: Channel,
}

#[async_trait]
impl BrokerChannel for RabbitChannel {
    async fn assert_exchange(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<()> {
        self.ch
            .exchange_declare(
                exchange,
                exchange_kind(kind),
                ExchangeDeclareOptions {
                    durable: options.durable,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                    passive: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(channel_err)
    }

    async fn assert_queue(&self, queue: &str, options: QueueOptions) -> Result<QueueInfo> {
        let q = self
            .ch
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: options.durable,
                    auto_delete: false,
                    exclusive: false,
                    nowait: false,
                    passive: false,
                },
                priority_args(options.max_priority),
            )
            .await
            .map_err(channel_err)?;

        Ok(QueueInfo {
            queue: q.name().as_str().to_string(),
            message_count: q.message_count(),
            consumer_count: q.consumer_count(),
        })
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ch
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|e| queue_err(queue, e))
    }

    async fn check_queue(&self, queue: &str) -> Result<QueueInfo> {
        let q = self
            .ch
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| queue_err(queue, e))?;

        Ok(QueueInfo {
            queue: q.name().as_str().to_string(),
            message_count: q.message_count(),
            consumer_count: q.consumer_count(),
        })
    }

    async fn check_exchange(&self, exchange: &str) -> Result<()> {
        // The exchange type is ignored by a passive declare.
        self.ch
            .exchange_declare(
                exchange,
                LapinExchangeKind::Topic,
                ExchangeDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    MessagingError::ExchangeNotFound(exchange.to_string())
                } else {
                    channel_err(e)
                }
            })
    }

    async fn purge_queue(&self, queue: &str) -> Result<u32> {
        self.ch
            .queue_purge(queue, QueuePurgeOptions { nowait: false })
            .await
            .map_err(|e| queue_err(queue, e))
    }

    async fn delete_queue(&self, queue: &str) -> Result<u32> {
        self.ch
            .queue_delete(queue, QueueDeleteOptions::default())
            .await
            .map_err(|e| queue_err(queue, e))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        options: PublishOptions,
    ) -> Result<()> {
        let mut props = BasicProperties::default().with_priority(options.priority);
        if options.persistent {
            props = props.with_delivery_mode(PERSISTENT);
        }

        let confirm = self
            .ch
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: false,
                    immediate: false,
                },
                body,
                props,
            )
            .await
            .map_err(|e| MessagingError::Publish(e.to_string()))?
            .await
            .map_err(|e| MessagingError::Publish(e.to_string()))?;

        if confirm.is_nack() {
            return Err(MessagingError::Publish(
                "publisher confirm NACK".to_string(),
            ));
        }
        Ok(())
    }

    async fn prefetch(&self, count: u16) -> Result<()> {
        self.ch
            .basic_qos(count, BasicQosOptions { global: false })
            .await
            .map_err(channel_err)
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream> {
        let consumer = self
            .ch
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack,
                    exclusive: false,
                    nowait: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| queue_err(queue, e))?;

        Ok(consumer
            .map(|delivery| {
                delivery
                    .map(into_delivery)
                    .map_err(|e| MessagingError::Subscribe(e.to_string()))
            })
            .boxed())
    }

    async fn get(&self, queue: &str, no_ack: bool) -> Result<Option<Delivery>> {
        let message = self
            .ch
            .basic_get(queue, BasicGetOptions { no_ack })
            .await
            .map_err(|e| queue_err(queue, e))?;
        Ok(message.map(|m| into_delivery(m.delivery)))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.ch
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(channel_err)
    }

    async fn close(&self) -> Result<()> {
        if !self.ch.status().connected() {
            debug!(channel = self.ch.id(), "channel already closed");
            return Ok(());
        }
        self.ch
            .close(REPLY_SUCCESS, "Bye")
            .await
            .map_err(channel_err)
    }
}
