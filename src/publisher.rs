// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! This module publishes messages with broker confirmation. Every publish gets a
//! channel of its own in confirm mode; the publish is registered with the
//! [`PublishAcknowledger`] before the frame goes out and the call returns once the
//! broker acked it, or fails with `PublishNotConfirmed` on a nack or timeout.

use crate::{
    acknowledger::{ConfirmHandle, PublishAcknowledger},
    channel::{Channel, ChannelFactory},
    codec::{Codec, JsonCodec},
    context::{ContextEnhancer, MessageContext},
    errors::AmqpError,
    pending::with_cancellation,
    transport::OutboundMessage,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use uuid::Uuid;

/// Publishes messages and waits for their broker confirmation.
#[derive(Clone)]
pub struct Publisher<C: Codec = JsonCodec> {
    channels: ChannelFactory,
    acknowledger: PublishAcknowledger,
    enhancer: ContextEnhancer,
    codec: C,
}

impl<C: Codec> Publisher<C> {
    /// Creates a new publisher.
    ///
    /// # Parameters
    /// * `channels` - Factory for the per-publish channels
    /// * `acknowledger` - Tracker of outstanding confirms
    /// * `codec` - Payload codec
    pub fn new(channels: ChannelFactory, acknowledger: PublishAcknowledger, codec: C) -> Self {
        Publisher {
            channels,
            acknowledger,
            enhancer: ContextEnhancer,
            codec,
        }
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Serializes `payload` and publishes it to `exchange` with `routing_key`.
    ///
    /// The message type is taken from the payload's Rust type name, trimmed to the
    /// last path segment.
    pub async fn publish<T: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &T,
        ctx: &MessageContext,
    ) -> Result<(), AmqpError> {
        let mut message = OutboundMessage::new(exchange, routing_key, self.codec.encode(payload)?);
        message.properties.kind = Some(message_type::<T>().to_owned());
        self.publish_message(message, ctx).await
    }

    /// Publishes an already encoded message.
    ///
    /// # Returns
    /// Ok(()) once the broker confirmed the message
    pub async fn publish_message(
        &self,
        message: OutboundMessage,
        ctx: &MessageContext,
    ) -> Result<(), AmqpError> {
        self.publish_traced(message, ctx, &opentelemetry::Context::current())
            .await
    }

    /// Publishes under the trace context `trace` instead of the current one.
    pub(crate) async fn publish_traced(
        &self,
        mut message: OutboundMessage,
        ctx: &MessageContext,
        trace: &opentelemetry::Context,
    ) -> Result<(), AmqpError> {
        self.enhancer.enhance_with(&mut message.properties, ctx, trace);
        if message.properties.message_id.is_none() {
            message.properties.message_id = Some(Uuid::new_v4().to_string());
        }
        if message.properties.content_type.is_none() {
            message.properties.content_type = Some(self.codec.content_type().to_owned());
        }

        let channel = self.channels.create_channel().await?;
        let result = self.publish_on(&channel, message).await;
        channel.close().await;
        result
    }

    /// Same as [`publish_message`](Self::publish_message), giving up with
    /// `Cancelled` once `token` fires. The pending confirm is dropped with it.
    pub async fn publish_with_cancel(
        &self,
        message: OutboundMessage,
        ctx: &MessageContext,
        token: &CancellationToken,
    ) -> Result<(), AmqpError> {
        with_cancellation(token, self.publish_message(message, ctx)).await
    }

    async fn publish_on(&self, channel: &Channel, message: OutboundMessage) -> Result<(), AmqpError> {
        channel
            .enable_confirms(self.acknowledger.listener(channel.id()))
            .await?;

        let confirm = self.send_tracked(channel, message).await?;
        confirm.await
    }

    /// Registers the next sequence number, then sends. The sequence lock keeps the
    /// numbering in the order the frames hit the wire.
    async fn send_tracked(
        &self,
        channel: &Channel,
        message: OutboundMessage,
    ) -> Result<ConfirmHandle, AmqpError> {
        let mut sequence = channel.sequence.lock().await;
        *sequence += 1;
        let seq = *sequence;

        let confirm = self.acknowledger.track_default(channel.id(), seq)?;

        debug!(
            exchange = message.exchange,
            routing_key = message.routing_key,
            seq,
            "publishing message"
        );

        if let Err(err) = channel.publish(Some(seq), message).await {
            error!(error = err.to_string(), "error publishing message");
            self.acknowledger.fail(channel.id(), seq, err);
        }

        Ok(confirm)
    }
}

/// Rust type name of `T` without its module path or generic arguments.
pub(crate) fn message_type<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
