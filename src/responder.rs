// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Request / Reply: Responder Side
//!
//! Serves requests from a queue: each request is decoded and given to the
//! application function, and the result is published to the request's `reply_to`
//! queue under the same correlation id. When the function fails the requester gets
//! an error reply carrying the [`HEADER_REPLY_ERROR`] header, so it fails fast
//! instead of waiting for its timeout.

use crate::{
    codec::{Codec, JsonCodec},
    context::{MessageContext, HEADER_REPLY_ERROR},
    errors::AmqpError,
    handler::{ConsumerHandler, ConsumerMessage},
    publisher::{message_type, Publisher},
    queue::QueueDefinition,
    strategy::ErrorStrategy,
    subscriber::{Subscriber, Subscription},
    transport::OutboundMessage,
};
use async_trait::async_trait;
use opentelemetry::Context;
use serde::{de::DeserializeOwned, Serialize};
use std::{future::Future, marker::PhantomData, sync::Arc};
use tracing::{debug, warn};

/// Serves requests with an application function.
#[derive(Clone)]
pub struct Responder<C: Codec = JsonCodec> {
    publisher: Publisher<C>,
    subscriber: Subscriber,
    strategy: Arc<dyn ErrorStrategy>,
}

impl<C: Codec> Responder<C> {
    pub fn new(
        publisher: Publisher<C>,
        subscriber: Subscriber,
        strategy: Arc<dyn ErrorStrategy>,
    ) -> Self {
        Responder {
            publisher,
            subscriber,
            strategy,
        }
    }

    /// Consumes `def` and answers every request with `f`.
    ///
    /// A request is acked once its reply, or error reply, is confirmed by the
    /// broker. If the reply cannot be published the request is left to the error
    /// strategy.
    pub async fn respond<Req, Res, F, Fut>(
        &self,
        def: QueueDefinition,
        f: F,
    ) -> Result<Subscription, AmqpError>
    where
        Req: DeserializeOwned + Send + 'static,
        Res: Serialize + Send + 'static,
        F: Fn(Req, MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Res, AmqpError>> + Send + 'static,
    {
        let handler = ResponderHandler {
            publisher: self.publisher.clone(),
            strategy: self.strategy.clone(),
            f,
            _types: PhantomData,
        };
        self.subscriber.subscribe(def, Arc::new(handler)).await
    }
}

struct ResponderHandler<C: Codec, Req, Res, F> {
    publisher: Publisher<C>,
    strategy: Arc<dyn ErrorStrategy>,
    f: F,
    _types: PhantomData<fn(Req) -> Res>,
}

impl<C, Req, Res, F, Fut> ResponderHandler<C, Req, Res, F>
where
    C: Codec,
    Req: DeserializeOwned,
    Res: Serialize,
    F: Fn(Req, MessageContext) -> Fut,
    Fut: Future<Output = Result<Res, AmqpError>>,
{
    async fn answer(&self, msg: &ConsumerMessage) -> Result<Vec<u8>, AmqpError> {
        let codec = self.publisher.codec();
        let request = codec.decode::<Req>(&msg.data)?;
        let result = (self.f)(request, msg.context.clone()).await?;
        codec.encode(&result)
    }
}

#[async_trait]
impl<C, Req, Res, F, Fut> ConsumerHandler for ResponderHandler<C, Req, Res, F>
where
    C: Codec,
    Req: DeserializeOwned + Send + 'static,
    Res: Serialize + Send + 'static,
    F: Fn(Req, MessageContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Res, AmqpError>> + Send + 'static,
{
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<(), AmqpError> {
        let answer = self.answer(msg).await;

        let Some(reply_to) = msg.reply_to.as_deref() else {
            warn!(
                queue = msg.queue,
                correlation_id = msg.context.correlation_id,
                "request without reply destination, no reply sent"
            );
            return answer.map(|_| ());
        };

        let reply_ctx = MessageContext {
            correlation_id: msg.context.correlation_id.clone(),
            global_request_id: msg.context.global_request_id.clone(),
            ..Default::default()
        };

        let reply = match answer {
            Ok(payload) => {
                let mut reply = OutboundMessage::new("", reply_to, payload);
                reply.properties.kind = Some(message_type::<Res>().to_owned());
                reply
            }
            Err(err) => {
                let failure = self.strategy.on_responder_failure(msg, &err);
                warn!(
                    error = err.to_string(),
                    correlation_id = msg.context.correlation_id,
                    "request handler failure, sending error reply"
                );
                let mut reply = OutboundMessage::new("", reply_to, Vec::new());
                reply
                    .properties
                    .headers
                    .insert(HEADER_REPLY_ERROR.to_owned(), failure);
                reply
            }
        };

        self.publisher.publish_traced(reply, &reply_ctx, ctx).await?;
        debug!(
            reply_to,
            correlation_id = msg.context.correlation_id,
            "reply sent"
        );
        Ok(())
    }
}
