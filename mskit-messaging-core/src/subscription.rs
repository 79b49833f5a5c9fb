// mskit-messaging-core/src/subscription.rs
//! Long-lived consumers and their resubscribe supervision.
use std::{fmt, sync::Arc, time::Duration};

use futures_util::StreamExt;
use tokio::{sync::watch, task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace};
use uuid::Uuid;

use crate::{
    broker::{BrokerChannel, Delivery, DeliveryStream, ExchangeKind, ExchangeOptions, QueueOptions},
    connection::ConnectionSupervisor,
    MessageHandler, MessagingError, Result,
};

/// Highest priority a queue may be declared with.
pub const MAX_PRIORITY: u8 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub exchange_kind: ExchangeKind,
    pub max_priority: Option<u8>,
    pub reconnect_on_close: bool,
    /// Falls back to the service `prefetch`, then to 1.
    pub prefetch: Option<u16>,
    /// Falls back to the service `options_noAck`.
    pub no_ack: Option<bool>,
    /// Falls back to the service `options_durable`.
    pub durable: Option<bool>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            exchange_kind: ExchangeKind::Topic,
            max_priority: None,
            reconnect_on_close: true,
            prefetch: None,
            no_ack: None,
            durable: None,
        }
    }
}

/// Everything needed to (re)create a subscription. Never mutated after
/// registration; every resubscribe replays exactly these values.
pub struct SubscriptionDescriptor {
    pub exchange: String,
    pub routing_key: String,
    pub queue_name: String,
    pub handler: Arc<dyn MessageHandler>,
    pub options: SubscribeOptions,
}

impl fmt::Debug for SubscriptionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionDescriptor")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("queue_name", &self.queue_name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl SubscriptionDescriptor {
    pub fn validate(&self) -> Result<()> {
        if self.queue_name.is_empty() {
            return Err(MessagingError::InvalidParameters(
                "handler and queue name".into(),
            ));
        }
        if self.exchange.is_empty() != self.routing_key.is_empty() {
            return Err(MessagingError::InvalidParameters(
                "exchange and routing key".into(),
            ));
        }
        validate_max_priority(self.options.max_priority)
    }
}

pub(crate) fn validate_max_priority(max_priority: Option<u8>) -> Result<()> {
    match max_priority {
        Some(p) if p > MAX_PRIORITY => Err(MessagingError::InvalidParameters(format!(
            "maxPriority should be less or equal to {MAX_PRIORITY}"
        ))),
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResubscribePhase {
    /// Consuming normally.
    Idle,
    /// Channel lost while the connection is down; polling for it.
    WaitingForReconnect,
    /// Connection is up; a resubscribe attempt is scheduled or running.
    Resubscribing,
    /// Cancelled, or closed with `reconnect_on_close = false`.
    Stopped,
}

/// Returned by `AmqpService::subscribe`. Dropping the handle leaves the
/// subscription running; call [`SubscriptionHandle::cancel`] to stop it.
pub struct SubscriptionHandle {
    descriptor: Arc<SubscriptionDescriptor>,
    phase: watch::Receiver<ResubscribePhase>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("descriptor", &self.descriptor)
            .field("phase", &*self.phase.borrow())
            .finish_non_exhaustive()
    }
}

impl SubscriptionHandle {
    pub fn descriptor(&self) -> &SubscriptionDescriptor {
        &self.descriptor
    }

    pub fn phase(&self) -> ResubscribePhase {
        *self.phase.borrow()
    }

    pub fn watch_phase(&self) -> watch::Receiver<ResubscribePhase> {
        self.phase.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops consuming, ends any retry loop and closes the channel.
    pub async fn cancel(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

struct ActiveConsumer {
    channel: Arc<dyn BrokerChannel>,
    stream: DeliveryStream,
    no_ack: bool,
}

pub(crate) struct Subscriber {
    supervisor: Arc<ConnectionSupervisor>,
    descriptor: Arc<SubscriptionDescriptor>,
    phase: watch::Sender<ResubscribePhase>,
    cancel: CancellationToken,
}

impl Subscriber {
    /// Opens the first channel and hands the consumer to a supervised task.
    /// A failure here is returned to the caller and is not retried.
    pub(crate) async fn start(
        supervisor: Arc<ConnectionSupervisor>,
        descriptor: SubscriptionDescriptor,
    ) -> Result<SubscriptionHandle> {
        let descriptor = Arc::new(descriptor);
        let (phase_tx, phase_rx) = watch::channel(ResubscribePhase::Idle);
        let cancel = CancellationToken::new();

        let subscriber = Self {
            supervisor,
            descriptor: Arc::clone(&descriptor),
            phase: phase_tx,
            cancel: cancel.clone(),
        };
        let first = subscriber.open().await?;
        info!(
            queue = %descriptor.queue_name,
            exchange = %descriptor.exchange,
            "consuming queue"
        );

        Ok(SubscriptionHandle {
            descriptor,
            phase: phase_rx,
            cancel,
            task: tokio::spawn(subscriber.run(first)),
        })
    }

    async fn open(&self) -> Result<ActiveConsumer> {
        let d = &self.descriptor;
        let cfg = self.supervisor.config();
        let durable = d.options.durable.unwrap_or(cfg.options_durable);
        let no_ack = d.options.no_ack.unwrap_or(cfg.options_no_ack);
        let prefetch = d
            .options
            .prefetch
            .filter(|&p| p > 0)
            .or(Some(cfg.prefetch).filter(|&p| p > 0))
            .unwrap_or(1);

        let conn = self.supervisor.connection()?;
        let channel = conn.create_channel().await?;

        let opened = async {
            if !d.exchange.is_empty() {
                channel
                    .assert_exchange(&d.exchange, d.options.exchange_kind, ExchangeOptions { durable })
                    .await?;
            }

            let queue = channel
                .assert_queue(
                    &d.queue_name,
                    QueueOptions {
                        durable,
                        max_priority: d.options.max_priority,
                    },
                )
                .await?;

            if !d.exchange.is_empty() {
                channel
                    .bind_queue(&queue.queue, &d.exchange, &d.routing_key)
                    .await?;
                trace!(queue = %queue.queue, exchange = %d.exchange, "bind to queue");
            }

            channel.prefetch(prefetch).await?;

            let consumer_tag = format!("{}-{}", queue.queue, Uuid::new_v4());
            channel.consume(&queue.queue, &consumer_tag, no_ack).await
        }
        .await;

        match opened {
            Ok(stream) => Ok(ActiveConsumer {
                channel,
                stream,
                no_ack,
            }),
            Err(e) => {
                error!(queue = %d.queue_name, error = %e, "failed to open subscription");
                let _ = channel.close().await;
                Err(e)
            }
        }
    }

    async fn run(self, first: ActiveConsumer) {
        let mut active = first;
        loop {
            if self.consume(active).await {
                break;
            }
            if !self.descriptor.options.reconnect_on_close {
                info!(queue = %self.descriptor.queue_name, "subscription channel closed");
                break;
            }
            trace!(queue = %self.descriptor.queue_name, "subscribe channel reconnecting...");
            match self.resubscribe().await {
                Some(next) => active = next,
                None => break,
            }
        }
        self.phase.send_replace(ResubscribePhase::Stopped);
    }

    /// Drains deliveries until the stream ends. Returns `true` when cancelled.
    async fn consume(&self, active: ActiveConsumer) -> bool {
        let ActiveConsumer {
            channel,
            mut stream,
            no_ack,
        } = active;
        self.phase.send_replace(ResubscribePhase::Idle);

        let cancelled = loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => break true,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(delivery)) => self.dispatch(&channel, no_ack, delivery).await,
                Some(Err(e)) => {
                    error!(queue = %self.descriptor.queue_name, error = %e, "delivery error");
                    break false;
                }
                None => break false,
            }
        };

        let _ = channel.close().await;
        cancelled
    }

    async fn dispatch(&self, channel: &Arc<dyn BrokerChannel>, no_ack: bool, delivery: Delivery) {
        match self.descriptor.handler.handle(&delivery).await {
            Ok(return_code) => {
                trace!(return_code, "on ack msg");
                if !no_ack {
                    if let Err(e) = channel.ack(delivery.delivery_tag).await {
                        error!(delivery_tag = delivery.delivery_tag, error = %e, "ack failed");
                    }
                }
            }
            // Left unacknowledged, no nack.
            Err(e) => error!(
                queue = %self.descriptor.queue_name,
                routing_key = %delivery.routing_key,
                error = %e,
                "message handler failed"
            ),
        }
    }

    /// Retries with a fixed delay until a consumer is open again. Returns
    /// `None` when cancelled.
    async fn resubscribe(&self) -> Option<ActiveConsumer> {
        let delay = self.supervisor.config().reconnect_delay();
        loop {
            if self.supervisor.is_initialized() {
                self.phase.send_replace(ResubscribePhase::Resubscribing);
                trace!(
                    queue = %self.descriptor.queue_name,
                    exchange = %self.descriptor.exchange,
                    routing_key = %self.descriptor.routing_key,
                    "try to resubscribe.."
                );
                if !self.pause(delay).await {
                    return None;
                }
                match self.open().await {
                    Ok(active) => {
                        info!(queue = %self.descriptor.queue_name, "resubscribed");
                        return Some(active);
                    }
                    Err(e) => {
                        trace!(queue = %self.descriptor.queue_name, error = %e, "resubscribe failed")
                    }
                }
            } else {
                self.phase.send_replace(ResubscribePhase::WaitingForReconnect);
                if !self.pause(delay).await {
                    return None;
                }
            }
        }
    }

    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = sleep(delay) => true,
        }
    }
}
