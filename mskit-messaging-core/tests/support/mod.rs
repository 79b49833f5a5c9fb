//! In-memory broker used by the integration tests.
#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use futures_util::StreamExt;
use mskit_messaging_core::{
    broker::{
        Broker, BrokerChannel, BrokerConnection, BrokerLink, ConnectionEvent, Delivery,
        DeliveryStream, ExchangeKind, ExchangeOptions, PublishOptions, QueueInfo, QueueOptions,
    },
    AmqpConfig, AmqpService, MessageHandler, MessagingError, Result,
};
use tokio::sync::mpsc;

pub fn test_config() -> AmqpConfig {
    AmqpConfig {
        username: "guest".into(),
        password: "guest".into(),
        host: "memory".into(),
        ..Default::default()
    }
}

pub fn service(broker: &Arc<MemoryBroker>) -> AmqpService {
    AmqpService::new(Arc::clone(broker) as Arc<dyn Broker>, test_config())
}

/// Lets spawned tasks run without moving the paused clock.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

struct Stored {
    priority: u8,
    seq: u64,
    exchange: String,
    routing_key: String,
    data: Vec<u8>,
    redelivered: bool,
}

struct Consumer {
    tag: String,
    channel_id: u64,
    prefetch: u16,
    no_ack: bool,
    in_flight: usize,
    tx: mpsc::UnboundedSender<Result<Delivery>>,
}

#[derive(Default)]
struct Queue {
    max_priority: Option<u8>,
    ready: Vec<Stored>,
    unacked: HashMap<u64, (String, Stored)>,
    consumers: Vec<Consumer>,
}

impl Queue {
    fn effective(&self, priority: u8) -> u8 {
        match self.max_priority {
            Some(max) => priority.min(max),
            None => 0,
        }
    }

    fn next_ready(&mut self) -> Option<Stored> {
        let idx = self
            .ready
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                self.effective(a.priority)
                    .cmp(&self.effective(b.priority))
                    .then(b.seq.cmp(&a.seq))
            })
            .map(|(i, _)| i)?;
        Some(self.ready.remove(idx))
    }
}

struct ChannelSlot {
    connection_id: u64,
    open: bool,
    prefetch: u16,
}

struct ConnectionSlot {
    open: bool,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, Queue>,
    exchanges: HashMap<String, ExchangeKind>,
    bindings: Vec<(String, String, String)>,
    exchange_asserts: Vec<String>,
    channels: HashMap<u64, ChannelSlot>,
    connections: HashMap<u64, ConnectionSlot>,
    next_id: u64,
    next_seq: u64,
    next_tag: u64,
}

impl State {
    fn id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn ensure_open(&self, channel_id: u64) -> Result<()> {
        match self.channels.get(&channel_id) {
            Some(ch) if ch.open => Ok(()),
            _ => Err(MessagingError::Channel("channel closed".into())),
        }
    }

    fn enqueue(&mut self, queue: &str, exchange: &str, routing_key: &str, data: &[u8], priority: u8) {
        self.next_seq += 1;
        let seq = self.next_seq;
        if let Some(q) = self.queues.get_mut(queue) {
            q.ready.push(Stored {
                priority,
                seq,
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                data: data.to_vec(),
                redelivered: false,
            });
        }
        self.pump(queue);
    }

    fn pump(&mut self, queue: &str) {
        let Some(q) = self.queues.get_mut(queue) else {
            return;
        };
        loop {
            if q.ready.is_empty() {
                return;
            }
            let Some(ci) = q
                .consumers
                .iter()
                .position(|c| c.no_ack || c.in_flight < usize::from(c.prefetch.max(1)))
            else {
                return;
            };
            let Some(msg) = q.next_ready() else {
                return;
            };
            self.next_tag += 1;
            let tag = self.next_tag;
            let delivery = Delivery {
                delivery_tag: tag,
                exchange: msg.exchange.clone(),
                routing_key: msg.routing_key.clone(),
                redelivered: msg.redelivered,
                priority: Some(msg.priority),
                data: msg.data.clone(),
            };
            let consumer = &mut q.consumers[ci];
            if consumer.tx.send(Ok(delivery)).is_err() {
                q.consumers.remove(ci);
                q.ready.push(msg);
                continue;
            }
            if !consumer.no_ack {
                consumer.in_flight += 1;
                q.unacked.insert(tag, (consumer.tag.clone(), msg));
            }
        }
    }

    fn close_channel(&mut self, channel_id: u64) {
        if let Some(ch) = self.channels.get_mut(&channel_id) {
            ch.open = false;
        }
        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            if let Some(q) = self.queues.get_mut(&name) {
                let gone: Vec<String> = q
                    .consumers
                    .iter()
                    .filter(|c| c.channel_id == channel_id)
                    .map(|c| c.tag.clone())
                    .collect();
                q.consumers.retain(|c| c.channel_id != channel_id);
                let tags: Vec<u64> = q
                    .unacked
                    .iter()
                    .filter(|(_, (consumer, _))| gone.contains(consumer))
                    .map(|(tag, _)| *tag)
                    .collect();
                for tag in tags {
                    if let Some((_, mut msg)) = q.unacked.remove(&tag) {
                        msg.redelivered = true;
                        q.ready.push(msg);
                    }
                }
            }
            self.pump(&name);
        }
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Vec<String> {
        let kind = self.exchanges.get(exchange).copied().unwrap_or_default();
        self.bindings
            .iter()
            .filter(|(_, ex, pattern)| {
                ex == exchange
                    && match kind {
                        ExchangeKind::Fanout | ExchangeKind::Headers => true,
                        ExchangeKind::Direct => pattern == routing_key,
                        ExchangeKind::Topic => topic_matches(pattern, routing_key),
                    }
            })
            .map(|(q, _, _)| q.clone())
            .collect()
    }
}

fn topic_matches(pattern: &str, key: &str) -> bool {
    fn go(p: &[&str], k: &[&str]) -> bool {
        match (p.first(), k.first()) {
            (None, None) => true,
            (Some(&"#"), _) => go(&p[1..], k) || (!k.is_empty() && go(p, &k[1..])),
            (Some(&"*"), Some(_)) => go(&p[1..], &k[1..]),
            (Some(a), Some(b)) if a == b => go(&p[1..], &k[1..]),
            _ => false,
        }
    }
    let p: Vec<&str> = pattern.split('.').collect();
    let k: Vec<&str> = key.split('.').collect();
    go(&p, &k)
}

/// Broker state shared by every connection and channel it hands out.
#[derive(Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
    connects: AtomicUsize,
    failing_connects: AtomicUsize,
    failing_channels: Arc<AtomicUsize>,
    channels_opened: Arc<AtomicUsize>,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Number of connect attempts, successful or not.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn channels_opened(&self) -> usize {
        self.channels_opened.load(Ordering::SeqCst)
    }

    pub fn fail_next_connects(&self, n: usize) {
        self.failing_connects.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_channels(&self, n: usize) {
        self.failing_channels.store(n, Ordering::SeqCst);
    }

    pub fn exchange_asserts(&self) -> Vec<String> {
        self.state().exchange_asserts.clone()
    }

    pub fn bindings(&self) -> Vec<(String, String, String)> {
        self.state().bindings.clone()
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.state().queues.contains_key(queue)
    }

    pub fn declare_exchange(&self, exchange: &str, kind: ExchangeKind) {
        self.state().exchanges.insert(exchange.to_string(), kind);
    }

    pub fn ready_count(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, |q| q.consumers.len())
    }

    /// Closes every channel consuming from `queue`, as a broker-side channel
    /// error would.
    pub fn close_consumer_channels(&self, queue: &str) {
        let mut st = self.state();
        let ids: Vec<u64> = st
            .queues
            .get(queue)
            .map(|q| q.consumers.iter().map(|c| c.channel_id).collect())
            .unwrap_or_default();
        for id in ids {
            st.close_channel(id);
        }
    }

    /// Emits `Closed` on every live connection without closing anything.
    pub fn emit_closed(&self) {
        let st = self.state();
        for conn in st.connections.values().filter(|c| c.open) {
            let _ = conn.events.send(ConnectionEvent::Closed);
        }
    }

    /// Simulates a network failure: every connection and channel goes away and
    /// the connections report `Closed`.
    pub fn drop_connections(&self) {
        let mut st = self.state();
        let conn_ids: Vec<u64> = st
            .connections
            .iter()
            .filter(|(_, c)| c.open)
            .map(|(id, _)| *id)
            .collect();
        for conn_id in conn_ids {
            let channel_ids: Vec<u64> = st
                .channels
                .iter()
                .filter(|(_, ch)| ch.connection_id == conn_id && ch.open)
                .map(|(id, _)| *id)
                .collect();
            for id in channel_ids {
                st.close_channel(id);
            }
            if let Some(conn) = st.connections.get_mut(&conn_id) {
                conn.open = false;
                let _ = conn
                    .events
                    .send(ConnectionEvent::Error("connection reset by peer".into()));
                let _ = conn.events.send(ConnectionEvent::Closed);
            }
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self, _uri: &str) -> Result<BrokerLink> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_connects.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_connects.store(failing - 1, Ordering::SeqCst);
            return Err(MessagingError::Connection("connection refused".into()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut st = self.state();
            let id = st.id();
            st.connections.insert(id, ConnectionSlot { open: true, events: tx });
            id
        };
        Ok(BrokerLink {
            connection: Arc::new(MemoryConnection {
                id,
                state: Arc::clone(&self.state),
                failing_channels: Arc::clone(&self.failing_channels),
                channels_opened: Arc::clone(&self.channels_opened),
            }),
            events: rx,
        })
    }
}

pub struct MemoryConnection {
    id: u64,
    state: Arc<Mutex<State>>,
    failing_channels: Arc<AtomicUsize>,
    channels_opened: Arc<AtomicUsize>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        self.channels_opened.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_channels.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_channels.store(failing - 1, Ordering::SeqCst);
            return Err(MessagingError::Channel("channel refused".into()));
        }

        let mut st = self.state.lock().unwrap();
        if !st.connections.get(&self.id).is_some_and(|c| c.open) {
            return Err(MessagingError::Connection("connection closed".into()));
        }
        let id = st.id();
        st.channels.insert(
            id,
            ChannelSlot {
                connection_id: self.id,
                open: true,
                prefetch: 0,
            },
        );
        Ok(Arc::new(MemoryChannel {
            id,
            state: Arc::clone(&self.state),
        }))
    }

    async fn close(&self) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        let ids: Vec<u64> = st
            .channels
            .iter()
            .filter(|(_, ch)| ch.connection_id == self.id && ch.open)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            st.close_channel(id);
        }
        if let Some(conn) = st.connections.get_mut(&self.id) {
            conn.open = false;
        }
        Ok(())
    }
}

pub struct MemoryChannel {
    id: u64,
    state: Arc<Mutex<State>>,
}

impl MemoryChannel {
    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn assert_exchange(&self, exchange: &str, kind: ExchangeKind, _options: ExchangeOptions) -> Result<()> {
        let mut st = self.state();
        st.ensure_open(self.id)?;
        st.exchange_asserts.push(exchange.to_string());
        st.exchanges.entry(exchange.to_string()).or_insert(kind);
        Ok(())
    }

    async fn assert_queue(&self, queue: &str, options: QueueOptions) -> Result<QueueInfo> {
        let mut st = self.state();
        st.ensure_open(self.id)?;
        let q = st.queues.entry(queue.to_string()).or_insert_with(|| Queue {
            max_priority: options.max_priority,
            ..Default::default()
        });
        Ok(QueueInfo {
            queue: queue.to_string(),
            message_count: q.ready.len() as u32,
            consumer_count: q.consumers.len() as u32,
        })
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut st = self.state();
        st.ensure_open(self.id)?;
        let binding = (queue.to_string(), exchange.to_string(), routing_key.to_string());
        if !st.bindings.contains(&binding) {
            st.bindings.push(binding);
        }
        Ok(())
    }

    async fn check_queue(&self, queue: &str) -> Result<QueueInfo> {
        let mut st = self.state();
        st.ensure_open(self.id)?;
        let info = st.queues.get(queue).map(|q| QueueInfo {
            queue: queue.to_string(),
            message_count: q.ready.len() as u32,
            consumer_count: q.consumers.len() as u32,
        });
        match info {
            Some(info) => Ok(info),
            None => {
                st.close_channel(self.id);
                Err(MessagingError::QueueNotFound(queue.to_string()))
            }
        }
    }

    async fn check_exchange(&self, exchange: &str) -> Result<()> {
        let mut st = self.state();
        st.ensure_open(self.id)?;
        if st.exchanges.contains_key(exchange) {
            Ok(())
        } else {
            st.close_channel(self.id);
            Err(MessagingError::ExchangeNotFound(exchange.to_string()))
        }
    }

    async fn purge_queue(&self, queue: &str) -> Result<u32> {
        let mut st = self.state();
        st.ensure_open(self.id)?;
        let purged = st.queues.get_mut(queue).map(|q| q.ready.drain(..).count() as u32);
        match purged {
            Some(count) => Ok(count),
            None => {
                st.close_channel(self.id);
                Err(MessagingError::QueueNotFound(queue.to_string()))
            }
        }
    }

    async fn delete_queue(&self, queue: &str) -> Result<u32> {
        let mut st = self.state();
        st.ensure_open(self.id)?;
        st.bindings.retain(|(q, _, _)| q != queue);
        Ok(st.queues.remove(queue).map_or(0, |q| q.ready.len() as u32))
    }

    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8], options: PublishOptions) -> Result<()> {
        let mut st = self.state();
        st.ensure_open(self.id)?;
        let targets = if exchange.is_empty() {
            vec![routing_key.to_string()]
        } else {
            st.route(exchange, routing_key)
        };
        for queue in targets {
            st.enqueue(&queue, exchange, routing_key, body, options.priority);
        }
        Ok(())
    }

    async fn prefetch(&self, count: u16) -> Result<()> {
        let mut st = self.state();
        st.ensure_open(self.id)?;
        if let Some(ch) = st.channels.get_mut(&self.id) {
            ch.prefetch = count;
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str, no_ack: bool) -> Result<DeliveryStream> {
        let mut st = self.state();
        st.ensure_open(self.id)?;
        let prefetch = st.channels.get(&self.id).map_or(0, |ch| ch.prefetch);
        let (tx, rx) = mpsc::unbounded_channel();
        match st.queues.get_mut(queue) {
            Some(q) => q.consumers.push(Consumer {
                tag: consumer_tag.to_string(),
                channel_id: self.id,
                prefetch,
                no_ack,
                in_flight: 0,
                tx,
            }),
            None => return Err(MessagingError::QueueNotFound(queue.to_string())),
        }
        st.pump(queue);

        Ok(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn get(&self, queue: &str, _no_ack: bool) -> Result<Option<Delivery>> {
        let mut st = self.state();
        st.ensure_open(self.id)?;
        st.next_tag += 1;
        let tag = st.next_tag;
        let next = st.queues.get_mut(queue).map(|q| q.next_ready());
        match next {
            Some(next) => Ok(next.map(|m| Delivery {
                delivery_tag: tag,
                exchange: m.exchange,
                routing_key: m.routing_key,
                redelivered: m.redelivered,
                priority: Some(m.priority),
                data: m.data,
            })),
            None => {
                st.close_channel(self.id);
                Err(MessagingError::QueueNotFound(queue.to_string()))
            }
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        let mut st = self.state();
        st.ensure_open(self.id)?;
        let mut acked_on = None;
        for (name, q) in st.queues.iter_mut() {
            if let Some((consumer, _)) = q.unacked.remove(&delivery_tag) {
                if let Some(c) = q.consumers.iter_mut().find(|c| c.tag == consumer) {
                    c.in_flight = c.in_flight.saturating_sub(1);
                }
                acked_on = Some(name.clone());
                break;
            }
        }
        match acked_on {
            Some(queue) => {
                st.pump(&queue);
                Ok(())
            }
            None => Err(MessagingError::Channel(format!("unknown delivery tag {delivery_tag}"))),
        }
    }

    async fn close(&self) -> Result<()> {
        let mut st = self.state();
        if st.channels.get(&self.id).is_some_and(|ch| ch.open) {
            st.close_channel(self.id);
            Ok(())
        } else {
            Err(MessagingError::Channel("channel already closed".into()))
        }
    }
}

/// Handler that forwards every delivery to the test and can be told to fail.
pub struct RecordingHandler {
    tx: mpsc::UnboundedSender<Delivery>,
    fail: bool,
}

impl RecordingHandler {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx, fail: false }), rx)
    }

    pub fn failing() -> (Arc<Self>, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx, fail: true }), rx)
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, delivery: &Delivery) -> Result<bool> {
        let _ = self.tx.send(delivery.clone());
        if self.fail {
            return Err(MessagingError::Handler("boom".into()));
        }
        Ok(true)
    }
}

pub fn drain(rx: &mut mpsc::UnboundedReceiver<Delivery>) -> Vec<Delivery> {
    let mut out = Vec::new();
    while let Ok(d) = rx.try_recv() {
        out.push(d);
    }
    out
}
