// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module hands out protocol channels multiplexed over the broker's live
//! connection. Every publish and every consumer registration gets a channel of its
//! own; channels are never pooled. A channel is bound to the connection it was
//! opened on and becomes invalid as soon as that connection is replaced.

use crate::{
    connection::{Connection, ConnectionBroker},
    errors::AmqpError,
    queue::QueueDefinition,
    transport::{ConfirmListener, DeliveryStream, OutboundMessage, TransportChannel},
};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Creates channels on the broker's live connection.
#[derive(Clone)]
pub struct ChannelFactory {
    broker: ConnectionBroker,
    next_id: Arc<AtomicU64>,
}

impl ChannelFactory {
    pub fn new(broker: ConnectionBroker) -> Self {
        ChannelFactory {
            broker,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn broker(&self) -> &ConnectionBroker {
        &self.broker
    }

    /// Opens a new channel.
    ///
    /// Waits while the connection is recovering; a channel is only returned when
    /// the connection it was opened on is still the live one. If the transport
    /// turns out to be dead, the connection is reported to the broker and the call
    /// waits for the next one.
    ///
    /// # Returns
    /// The channel, or `ChannelError` when a healthy connection refuses to open it.
    pub async fn create_channel(&self) -> Result<Channel, AmqpError> {
        loop {
            let conn = self.broker.get_connection().await;

            match conn.transport().open_channel().await {
                Ok(transport) => {
                    if self.broker.is_current(conn.id()) && transport.is_open() {
                        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                        debug!(id, connection = conn.id(), "channel ready");
                        return Ok(Channel::new(id, &conn, transport, self.broker.clone()));
                    }
                    // Opened on a connection that was replaced in the meantime.
                    if let Err(err) = transport.close().await {
                        debug!(error = err.to_string(), "failure to close a stale channel");
                    }
                }
                Err(err) => {
                    if conn.transport().is_connected() {
                        return Err(err);
                    }
                    warn!(connection = conn.id(), "connection dropped while opening a channel");
                    self.broker.report_failure(&conn);
                }
            }
        }
    }

    /// Same as [`create_channel`](Self::create_channel), giving up with
    /// `Cancelled` once `token` fires.
    pub async fn create_channel_with_cancel(
        &self,
        token: &CancellationToken,
    ) -> Result<Channel, AmqpError> {
        crate::pending::with_cancellation(token, self.create_channel()).await
    }
}

/// A channel scoped to one operation.
pub struct Channel {
    id: u64,
    connection_id: u64,
    transport: Arc<dyn TransportChannel>,
    broker: ConnectionBroker,
    pub(crate) sequence: tokio::sync::Mutex<u64>,
}

impl Channel {
    fn new(
        id: u64,
        conn: &Connection,
        transport: Arc<dyn TransportChannel>,
        broker: ConnectionBroker,
    ) -> Self {
        Channel {
            id,
            connection_id: conn.id(),
            transport,
            broker,
            sequence: tokio::sync::Mutex::new(0),
        }
    }

    /// Identity of the channel, unique for the lifetime of the factory.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Id of the connection the channel was opened on.
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// A channel is valid while its connection is the broker's live connection.
    pub fn is_valid(&self) -> bool {
        self.broker.is_current(self.connection_id) && self.transport.is_open()
    }

    fn ensure_valid(&self) -> Result<(), AmqpError> {
        if self.is_valid() {
            return Ok(());
        }
        Err(AmqpError::ChannelInvalidated)
    }

    /// Puts the channel in confirm mode.
    ///
    /// # Parameters
    /// * `listener` - Receives the broker verdict for every published sequence
    ///
    /// # Returns
    /// `ChannelInvalidated` if the connection was replaced, or `ConfirmSelectError`
    pub async fn enable_confirms(&self, listener: ConfirmListener) -> Result<(), AmqpError> {
        self.ensure_valid()?;
        self.transport.confirm_select(listener).await
    }

    /// Limits the unacked deliveries the broker pushes to this channel.
    ///
    /// # Parameters
    /// * `prefetch_count` - Maximum unacked deliveries, 0 for no limit
    pub async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.ensure_valid()?;
        self.transport.qos(prefetch_count).await
    }

    /// Declares `def`.
    ///
    /// # Returns
    /// The queue name, assigned by the broker when `def` is server-named
    pub async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        self.ensure_valid()?;
        self.transport.declare_queue(def).await
    }

    /// Publishes `message`.
    ///
    /// # Parameters
    /// * `sequence` - Confirm sequence number when confirm mode is on
    /// * `message` - The message and its destination
    pub async fn publish(
        &self,
        sequence: Option<u64>,
        message: OutboundMessage,
    ) -> Result<(), AmqpError> {
        self.ensure_valid()?;
        self.transport.publish(sequence, message).await
    }

    /// Starts consuming `queue` under `consumer_tag`.
    ///
    /// # Returns
    /// The delivery stream. It ends when the consumer is cancelled or the
    /// connection is lost.
    pub async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        self.ensure_valid()?;
        self.transport.consume(queue, consumer_tag).await
    }

    /// Cancels the consumer registered as `consumer_tag`.
    pub async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.ensure_valid()?;
        self.transport.cancel(consumer_tag).await
    }

    /// Acknowledges the delivery `delivery_tag`.
    pub async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.ensure_valid()?;
        self.transport.ack(delivery_tag).await
    }

    /// Rejects the delivery `delivery_tag`, putting it back on the queue when
    /// `requeue` is set.
    pub async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.ensure_valid()?;
        self.transport.nack(delivery_tag, requeue).await
    }

    /// Closes the channel. Closing an invalidated channel is a no-op.
    pub async fn close(&self) {
        if !self.is_valid() {
            return;
        }
        if let Err(err) = self.transport.close().await {
            debug!(error = err.to_string(), id = self.id, "failure to close the channel");
        }
    }
}
