// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Request / Reply: Requester Side
//!
//! Turns a publish and a later delivery into one awaited call. Every request is
//! registered in a [`PendingTable`] under its correlation id before it is
//! published; the reply consumer resolves the entry whose id the reply carries.
//!
//! ```text
//! Created ──► AwaitingReply ──┬──► Completed   reply with the same correlation id
//!                             ├──► TimedOut    request timeout elapsed
//!                             └──► Faulted     publish failed
//! ```
//!
//! Replies for ids that are not outstanding (timed out, cancelled or foreign) are
//! acked and dropped. Reply queues are exclusive to their connection: replies in
//! flight when the connection is lost are lost with it and their requests time out.

use crate::{
    codec::{Codec, JsonCodec},
    config::ReplyQueueMode,
    context::{MessageContext, HEADER_REPLY_ERROR},
    errors::AmqpError,
    handler::{ConsumerHandler, ConsumerMessage},
    pending::{with_cancellation, PendingTable},
    publisher::{message_type, Publisher},
    queue::QueueDefinition,
    subscriber::{Subscriber, Subscription},
    transport::OutboundMessage,
};
use async_trait::async_trait;
use opentelemetry::Context;
use serde::{de::DeserializeOwned, Serialize};
use std::{sync::Arc, time::Duration};
use tokio::{sync::Mutex, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

type PendingReplies = PendingTable<String, ConsumerMessage>;

/// Sends requests and waits for their correlated replies.
#[derive(Clone)]
pub struct Requester<C: Codec = JsonCodec> {
    publisher: Publisher<C>,
    subscriber: Subscriber,
    pending: PendingReplies,
    timeout: Duration,
    mode: ReplyQueueMode,
    reply_queue: Arc<Mutex<Option<Subscription>>>,
}

impl<C: Codec> Requester<C> {
    /// # Parameters
    /// * `publisher` - Publishes the requests
    /// * `subscriber` - Consumes the reply queues
    /// * `timeout` - How long a request waits for its reply
    /// * `mode` - Whether reply queues are shared by the requester or per request
    pub fn new(
        publisher: Publisher<C>,
        subscriber: Subscriber,
        timeout: Duration,
        mode: ReplyQueueMode,
    ) -> Self {
        Requester {
            publisher,
            subscriber,
            pending: PendingTable::new(),
            timeout,
            mode,
            reply_queue: Arc::new(Mutex::new(None)),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Sends `payload` to `exchange` with `routing_key` and waits for the reply.
    ///
    /// The correlation id is taken from `ctx` when set, otherwise generated.
    ///
    /// # Returns
    /// The decoded reply, or
    /// * `CorrelationCollision` if the correlation id is already outstanding
    /// * `RequestTimedOut` if no reply arrived in time
    /// * the publish error if the request could not be sent
    /// * `RemoteFailure` if the responder reported a failure
    pub async fn request<Req, Res>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &Req,
        ctx: &MessageContext,
    ) -> Result<Res, AmqpError>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        let codec = self.publisher.codec();
        let mut message = OutboundMessage::new(exchange, routing_key, codec.encode(payload)?);
        message.properties.kind = Some(message_type::<Req>().to_owned());

        let reply = self.send(message, ctx.clone()).await?;

        if let Some(failure) = reply.context.header(HEADER_REPLY_ERROR) {
            warn!(
                correlation_id = reply.context.correlation_id,
                failure, "request failed on the responder"
            );
            return Err(AmqpError::RemoteFailure(failure.to_owned()));
        }

        codec.decode(&reply.data)
    }

    /// Same as [`request`](Self::request), giving up with `Cancelled` once `token`
    /// fires. The pending request is removed with it.
    pub async fn request_with_cancel<Req, Res>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &Req,
        ctx: &MessageContext,
        token: &CancellationToken,
    ) -> Result<Res, AmqpError>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        with_cancellation(token, self.request(exchange, routing_key, payload, ctx)).await
    }

    /// Stops the shared reply consumer. Outstanding requests run into their
    /// timeout.
    pub async fn close(&self) {
        if let Some(subscription) = self.reply_queue.lock().await.take() {
            subscription.cancel().await;
        }
    }

    async fn send(
        &self,
        message: OutboundMessage,
        mut ctx: MessageContext,
    ) -> Result<ConsumerMessage, AmqpError> {
        if ctx.correlation_id.is_empty() {
            ctx.correlation_id = Uuid::new_v4().to_string();
        }

        match self.mode {
            ReplyQueueMode::PerRequester => {
                let reply_to = self.shared_reply_queue().await?;
                self.await_reply(message, &ctx, reply_to).await
            }
            ReplyQueueMode::PerRequest => {
                let subscription = self.open_reply_queue().await?;
                let _teardown = subscription.cancel_on_drop();
                let reply = match subscription.bound_queue().await {
                    Ok(reply_to) => self.await_reply(message, &ctx, reply_to).await,
                    Err(err) => Err(err),
                };
                subscription.cancel().await;
                reply
            }
        }
    }

    async fn await_reply(
        &self,
        mut message: OutboundMessage,
        ctx: &MessageContext,
        reply_to: String,
    ) -> Result<ConsumerMessage, AmqpError> {
        let correlation_id = ctx.correlation_id.clone();
        let reply = self
            .pending
            .register(
                correlation_id.clone(),
                Instant::now() + self.timeout,
                AmqpError::RequestTimedOut(correlation_id.clone()),
            )
            .ok_or_else(|| AmqpError::CorrelationCollision(correlation_id.clone()))?;

        debug!(
            correlation_id,
            reply_to,
            routing_key = message.routing_key,
            "sending request"
        );
        message.properties.reply_to = Some(reply_to);

        if let Err(err) = self.publisher.publish_message(message, ctx).await {
            error!(error = err.to_string(), correlation_id, "failure to send request");
            self.pending.resolve(&correlation_id, Err(err));
        }

        reply.await
    }

    /// Name of the shared reply queue, creating its consumer on first use. Waits
    /// while the consumer re-registers after a connection recovery.
    async fn shared_reply_queue(&self) -> Result<String, AmqpError> {
        let mut reply_queue = self.reply_queue.lock().await;
        if reply_queue.is_none() {
            *reply_queue = Some(self.open_reply_queue().await?);
        }
        match reply_queue.as_ref() {
            Some(subscription) => subscription.bound_queue().await,
            None => Err(AmqpError::ConsumerError("no reply queue".to_owned())),
        }
    }

    async fn open_reply_queue(&self) -> Result<Subscription, AmqpError> {
        let handler = Arc::new(ReplyHandler {
            pending: self.pending.clone(),
        });
        self.subscriber
            .subscribe(QueueDefinition::server_named(), handler)
            .await
    }
}

/// Consumes a reply queue and completes the matching pending requests.
struct ReplyHandler {
    pending: PendingReplies,
}

#[async_trait]
impl ConsumerHandler for ReplyHandler {
    async fn exec(&self, _ctx: &Context, msg: &ConsumerMessage) -> Result<(), AmqpError> {
        let correlation_id = &msg.context.correlation_id;
        if !self.pending.resolve(correlation_id, Ok(msg.clone())) {
            debug!(correlation_id, "discarding reply without pending request");
        }
        Ok(())
    }
}
