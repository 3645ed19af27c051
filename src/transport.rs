// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Primitives
//!
//! The lower-level connection and channel contract the bus is built on. The
//! production implementation lives in [`crate::amqp`] on top of lapin; the rest of
//! the crate only talks to these traits, so framing and method encoding never leak
//! into the connection broker, the acknowledger or the requester.

use crate::{config::BrokerEndpoint, errors::AmqpError, queue::QueueDefinition};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::{collections::BTreeMap, sync::Arc};

/// Properties carried next to a message payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub content_type: Option<String>,
    pub kind: Option<String>,
    pub headers: BTreeMap<String, String>,
}

/// A message ready to be published.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub properties: MessageProperties,
}

impl OutboundMessage {
    pub fn new(exchange: &str, routing_key: &str, payload: Vec<u8>) -> Self {
        OutboundMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            payload,
            properties: MessageProperties::default(),
        }
    }
}

/// A message handed to a consumer by the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub payload: Vec<u8>,
    pub properties: MessageProperties,
}

/// Broker verdict on a confirmed publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Ack,
    Nack,
}

/// Receives `(sequence, verdict)` for every confirmed publish of a channel.
pub type ConfirmListener = Arc<dyn Fn(u64, Confirmation) + Send + Sync>;

/// Invoked once when the connection fails.
pub type ErrorListener = Box<dyn FnOnce(AmqpError) + Send>;

/// Deliveries of one consumer. The stream ends when the consumer is cancelled or
/// its channel goes away.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Opens transport sessions to broker endpoints.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &BrokerEndpoint,
        connection_name: &str,
    ) -> Result<Arc<dyn TransportConnection>, AmqpError>;
}

/// One live transport session.
#[async_trait]
pub trait TransportConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn TransportChannel>, AmqpError>;

    /// Registers the callback fired when the session fails.
    fn on_error(&self, listener: ErrorListener);

    fn is_connected(&self) -> bool;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A multiplexed channel over a [`TransportConnection`].
#[async_trait]
pub trait TransportChannel: Send + Sync {
    fn id(&self) -> u16;

    fn is_open(&self) -> bool;

    /// Puts the channel in confirm mode; verdicts are reported to `listener`.
    async fn confirm_select(&self, listener: ConfirmListener) -> Result<(), AmqpError>;

    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    /// Declares the queue and returns its name, which is broker generated when the
    /// definition has none.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError>;

    /// Publishes a message. `sequence` is the confirm sequence number the verdict
    /// will be reported under, when the channel is in confirm mode.
    async fn publish(&self, sequence: Option<u64>, message: OutboundMessage)
        -> Result<(), AmqpError>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}
