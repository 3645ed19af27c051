// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker implementing the transport traits for unit tests.
//!
//! Supports default-exchange routing, server-named, exclusive and auto-delete
//! queues, consumer streams with ack/nack bookkeeping, scriptable publisher
//! confirms, endpoint outages and connection failure injection.

#![allow(dead_code)]

use crate::{
    config::BrokerEndpoint,
    errors::AmqpError,
    queue::QueueDefinition,
    transport::{
        ConfirmListener, Confirmation, Connector, Delivery, DeliveryStream, ErrorListener,
        OutboundMessage, TransportChannel, TransportConnection,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::sync::mpsc;

/// How the broker answers confirmed publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConfirmMode {
    Ack,
    Nack,
    /// Keep the confirm until [`MemoryBroker::release_confirms`].
    Hold,
}

type DeliverySender = mpsc::UnboundedSender<Result<Delivery, AmqpError>>;

struct ConsumerEntry {
    tag: String,
    channel: u64,
    sender: DeliverySender,
}

#[derive(Default)]
struct QueueState {
    owner: Option<u64>,
    messages: VecDeque<Delivery>,
    consumers: Vec<ConsumerEntry>,
    cursor: usize,
    auto_delete: bool,
    consumed: bool,
}

struct ConnectionState {
    open: Arc<AtomicBool>,
    listener: Option<ErrorListener>,
    channels: Vec<(u64, Arc<AtomicBool>)>,
}

struct Unacked {
    queue: String,
    channel: u64,
    delivery: Delivery,
}

struct State {
    down: HashSet<String>,
    attempts: Vec<String>,
    confirm_mode: ConfirmMode,
    held: Vec<(u64, ConfirmListener)>,
    next_id: u64,
    connections: HashMap<u64, ConnectionState>,
    queues: HashMap<String, QueueState>,
    unacked: HashMap<u64, Unacked>,
    published: Vec<OutboundMessage>,
    acked: Vec<Vec<u8>>,
    nacked: Vec<(Vec<u8>, bool)>,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn route(&mut self, message: OutboundMessage) {
        if !message.exchange.is_empty() {
            return;
        }
        let Some(queue) = self.queues.get_mut(&message.routing_key) else {
            return;
        };
        queue.messages.push_back(Delivery {
            delivery_tag: 0,
            exchange: message.exchange,
            routing_key: message.routing_key.clone(),
            redelivered: false,
            payload: message.payload,
            properties: message.properties,
        });
        self.dispatch(&message.routing_key);
    }

    fn dispatch(&mut self, queue_name: &str) {
        loop {
            let tag = self.next_id();
            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            if queue.consumers.is_empty() {
                return;
            }
            let Some(mut delivery) = queue.messages.pop_front() else {
                return;
            };

            let idx = queue.cursor % queue.consumers.len();
            queue.cursor = queue.cursor.wrapping_add(1);
            delivery.delivery_tag = tag;

            let consumer = &queue.consumers[idx];
            let channel = consumer.channel;
            if consumer.sender.send(Ok(delivery.clone())).is_err() {
                queue.consumers.remove(idx);
                delivery.delivery_tag = 0;
                queue.messages.push_front(delivery);
                continue;
            }

            self.unacked.insert(
                tag,
                Unacked {
                    queue: queue_name.to_owned(),
                    channel,
                    delivery,
                },
            );
        }
    }

    /// Drops the consumers of `channel` and puts its unacked deliveries back.
    fn release_channel(&mut self, channel: u64) {
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.channel != channel);
        }

        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.channel == channel)
            .map(|(tag, _)| *tag)
            .collect();

        let mut touched = HashSet::new();
        for tag in tags {
            if let Some(mut unacked) = self.unacked.remove(&tag) {
                if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                    unacked.delivery.redelivered = true;
                    unacked.delivery.delivery_tag = 0;
                    queue.messages.push_front(unacked.delivery);
                    touched.insert(unacked.queue);
                }
            }
        }
        for queue in touched {
            self.dispatch(&queue);
        }
        self.reap();
    }

    /// Deletes auto-delete queues whose last consumer went away.
    fn reap(&mut self) {
        self.queues
            .retain(|_, q| !(q.auto_delete && q.consumed && q.consumers.is_empty()));
    }

    /// Closes a connection, its channels and its exclusive queues. Returns its error
    /// listener.
    fn shutdown_connection(&mut self, id: u64) -> Option<ErrorListener> {
        let mut conn = self.connections.remove(&id)?;
        conn.open.store(false, Ordering::SeqCst);
        for (channel, open) in &conn.channels {
            open.store(false, Ordering::SeqCst);
            self.release_channel(*channel);
        }
        self.queues.retain(|_, q| q.owner != Some(id));
        conn.listener.take()
    }
}

/// Shared in-memory broker.
#[derive(Clone)]
pub(crate) struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    pub(crate) fn new() -> Self {
        MemoryBroker {
            state: Arc::new(Mutex::new(State {
                down: HashSet::new(),
                attempts: vec![],
                confirm_mode: ConfirmMode::Ack,
                held: vec![],
                next_id: 0,
                connections: HashMap::new(),
                queues: HashMap::new(),
                unacked: HashMap::new(),
                published: vec![],
                acked: vec![],
                nacked: vec![],
            })),
        }
    }

    pub(crate) fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MemoryConnector {
            broker: self.clone(),
        })
    }

    pub(crate) fn set_down(&self, host: &str, down: bool) {
        let mut state = self.state.lock();
        if down {
            state.down.insert(host.to_owned());
        } else {
            state.down.remove(host);
        }
    }

    pub(crate) fn connect_attempts(&self) -> Vec<String> {
        self.state.lock().attempts.clone()
    }

    /// Breaks every open connection and fires their error listeners.
    pub(crate) fn fail_connections(&self) {
        let listeners: Vec<ErrorListener> = {
            let mut state = self.state.lock();
            let ids: Vec<u64> = state.connections.keys().copied().collect();
            ids.into_iter()
                .filter_map(|id| state.shutdown_connection(id))
                .collect()
        };
        for listener in listeners {
            listener(AmqpError::ConnectionUnavailable);
        }
    }

    pub(crate) fn set_confirm_mode(&self, mode: ConfirmMode) {
        self.state.lock().confirm_mode = mode;
    }

    pub(crate) fn held_confirms(&self) -> usize {
        self.state.lock().held.len()
    }

    /// Answers every held confirm with `confirmation`.
    pub(crate) fn release_confirms(&self, confirmation: Confirmation) {
        let held = std::mem::take(&mut self.state.lock().held);
        for (sequence, listener) in held {
            listener(sequence, confirmation);
        }
    }

    /// Routes a message as if it had been published by another client.
    pub(crate) fn inject(&self, message: OutboundMessage) {
        self.state.lock().route(message);
    }

    pub(crate) fn declare(&self, queue: &str) {
        self.state
            .lock()
            .queues
            .entry(queue.to_owned())
            .or_default();
    }

    pub(crate) fn published(&self) -> Vec<OutboundMessage> {
        self.state.lock().published.clone()
    }

    pub(crate) fn acked(&self) -> Vec<Vec<u8>> {
        self.state.lock().acked.clone()
    }

    pub(crate) fn nacked(&self) -> Vec<(Vec<u8>, bool)> {
        self.state.lock().nacked.clone()
    }

    pub(crate) fn queue_exists(&self, queue: &str) -> bool {
        self.state.lock().queues.contains_key(queue)
    }

    pub(crate) fn queue_depth(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.messages.len())
    }

    pub(crate) fn consumer_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }

    pub(crate) fn open_connections(&self) -> usize {
        self.state.lock().connections.len()
    }

    pub(crate) fn open_channels(&self) -> usize {
        self.state
            .lock()
            .connections
            .values()
            .flat_map(|c| c.channels.iter())
            .filter(|(_, open)| open.load(Ordering::SeqCst))
            .count()
    }
}

struct MemoryConnector {
    broker: MemoryBroker,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        endpoint: &BrokerEndpoint,
        _connection_name: &str,
    ) -> Result<Arc<dyn TransportConnection>, AmqpError> {
        let mut state = self.broker.state.lock();
        state.attempts.push(endpoint.host.clone());
        if state.down.contains(&endpoint.host) {
            return Err(AmqpError::ConnectionError);
        }

        let id = state.next_id();
        let open = Arc::new(AtomicBool::new(true));
        state.connections.insert(
            id,
            ConnectionState {
                open: open.clone(),
                listener: None,
                channels: vec![],
            },
        );

        Ok(Arc::new(MemoryConnection {
            id,
            open,
            broker: self.broker.clone(),
        }))
    }
}

struct MemoryConnection {
    id: u64,
    open: Arc<AtomicBool>,
    broker: MemoryBroker,
}

#[async_trait]
impl TransportConnection for MemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn TransportChannel>, AmqpError> {
        let mut state = self.broker.state.lock();
        let key = state.next_id();
        let Some(conn) = state.connections.get_mut(&self.id) else {
            return Err(AmqpError::ChannelError);
        };

        let open = Arc::new(AtomicBool::new(true));
        conn.channels.push((key, open.clone()));

        Ok(Arc::new(MemoryChannel {
            key,
            connection: self.id,
            open,
            connection_open: self.open.clone(),
            listener: Mutex::new(None),
            broker: self.broker.clone(),
        }))
    }

    fn on_error(&self, listener: ErrorListener) {
        if let Some(conn) = self.broker.state.lock().connections.get_mut(&self.id) {
            conn.listener = Some(listener);
        }
    }

    fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.broker.state.lock().shutdown_connection(self.id);
        Ok(())
    }
}

struct MemoryChannel {
    key: u64,
    connection: u64,
    open: Arc<AtomicBool>,
    connection_open: Arc<AtomicBool>,
    listener: Mutex<Option<ConfirmListener>>,
    broker: MemoryBroker,
}

impl MemoryChannel {
    fn check_open(&self, err: AmqpError) -> Result<(), AmqpError> {
        if self.is_open() {
            return Ok(());
        }
        Err(err)
    }
}

#[async_trait]
impl TransportChannel for MemoryChannel {
    fn id(&self) -> u16 {
        self.key as u16
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.connection_open.load(Ordering::SeqCst)
    }

    async fn confirm_select(&self, listener: ConfirmListener) -> Result<(), AmqpError> {
        self.check_open(AmqpError::ConfirmSelectError)?;
        *self.listener.lock() = Some(listener);
        Ok(())
    }

    async fn qos(&self, _prefetch_count: u16) -> Result<(), AmqpError> {
        self.check_open(AmqpError::QoSDeclarationError("closed".to_owned()))
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        self.check_open(AmqpError::DeclareQueueError(def.name.clone()))?;
        let mut state = self.broker.state.lock();

        let name = if def.name.is_empty() {
            format!("amq.gen-{}", state.next_id())
        } else {
            def.name.clone()
        };

        if def.passive && !state.queues.contains_key(&name) {
            return Err(AmqpError::DeclareQueueError(name));
        }

        let owner = def.exclusive.then_some(self.connection);
        state.queues.entry(name.clone()).or_insert_with(|| QueueState {
            owner,
            auto_delete: def.delete,
            ..Default::default()
        });
        Ok(name)
    }

    async fn publish(
        &self,
        sequence: Option<u64>,
        message: OutboundMessage,
    ) -> Result<(), AmqpError> {
        self.check_open(AmqpError::PublishingError)?;

        let answer = {
            let mut state = self.broker.state.lock();
            state.published.push(message.clone());
            state.route(message);

            let listener = self.listener.lock().clone();
            match (sequence, listener) {
                (Some(sequence), Some(listener)) => match state.confirm_mode {
                    ConfirmMode::Ack => Some((sequence, listener, Confirmation::Ack)),
                    ConfirmMode::Nack => Some((sequence, listener, Confirmation::Nack)),
                    ConfirmMode::Hold => {
                        state.held.push((sequence, listener));
                        None
                    }
                },
                _ => None,
            }
        };

        // Answer before returning, like a broker acking faster than the client
        // gets back from the send.
        if let Some((sequence, listener, confirmation)) = answer {
            listener(sequence, confirmation);
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        self.check_open(AmqpError::BindingConsumerError(queue.to_owned()))?;
        let (sender, receiver) = mpsc::unbounded_channel();

        let mut state = self.broker.state.lock();
        let Some(q) = state.queues.get_mut(queue) else {
            return Err(AmqpError::BindingConsumerError(queue.to_owned()));
        };
        q.consumed = true;
        q.consumers.push(ConsumerEntry {
            tag: consumer_tag.to_owned(),
            channel: self.key,
            sender,
        });
        state.dispatch(queue);

        Ok(futures_util::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        })
        .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        let mut state = self.broker.state.lock();
        for queue in state.queues.values_mut() {
            queue
                .consumers
                .retain(|c| !(c.channel == self.key && c.tag == consumer_tag));
        }
        state.reap();
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.check_open(AmqpError::AckMessageError)?;
        let mut state = self.broker.state.lock();
        let Some(unacked) = state.unacked.remove(&delivery_tag) else {
            return Err(AmqpError::AckMessageError);
        };
        state.acked.push(unacked.delivery.payload);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.check_open(AmqpError::NackMessageError)?;
        let mut state = self.broker.state.lock();
        let Some(mut unacked) = state.unacked.remove(&delivery_tag) else {
            return Err(AmqpError::NackMessageError);
        };
        state.nacked.push((unacked.delivery.payload.clone(), requeue));

        if requeue {
            if let Some(queue) = state.queues.get_mut(&unacked.queue) {
                unacked.delivery.redelivered = true;
                unacked.delivery.delivery_tag = 0;
                queue.messages.push_back(unacked.delivery);
                state.dispatch(&unacked.queue);
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.open.store(false, Ordering::SeqCst);
        self.broker.state.lock().release_channel(self.key);
        Ok(())
    }
}
