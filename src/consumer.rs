// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumption
//!
//! Processing of a single delivery: rebuild the message context from its headers,
//! open a consumer span, run the handler, then settle the delivery with the broker.
//! A successful handler acks; a failed one is settled by the error strategy. Handler
//! failures never escape this function, so one bad message cannot stop a consumer.

use crate::{
    channel::Channel,
    context::MessageContextProvider,
    errors::AmqpError,
    handler::{ConsumerHandler, ConsumerMessage},
    otel,
    strategy::{Disposition, ErrorStrategy},
    transport::Delivery,
};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use std::borrow::Cow;
use tracing::{debug, error, warn};

/// Consumes and processes a message.
///
/// # Parameters
/// * `tracer` - OpenTelemetry tracer for creating spans
/// * `channel` - Channel the delivery arrived on, used to settle it
/// * `queue` - Queue the consumer reads from
/// * `delivery` - The delivery to process
/// * `handler` - Application handler
/// * `provider` - Rebuilds the message context from the delivery headers
/// * `strategy` - Settles deliveries whose handler failed
///
/// # Returns
/// Ok(()) once the delivery is settled, or the error from acking/nacking it
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    channel: &Channel,
    queue: &str,
    delivery: Delivery,
    handler: &dyn ConsumerHandler,
    provider: &MessageContextProvider,
    strategy: &dyn ErrorStrategy,
) -> Result<(), AmqpError> {
    let msg_type = delivery.properties.kind.clone().unwrap_or_default();
    let span_name = if msg_type.is_empty() { queue } else { msg_type.as_str() };
    let (ctx, mut span) = otel::new_span(&delivery.properties.headers, tracer, span_name);

    debug!("received: {} - exchange: {}", msg_type, delivery.exchange);

    let msg = ConsumerMessage {
        queue: queue.to_owned(),
        msg_type: msg_type.clone(),
        context: provider.extract(&delivery.properties),
        reply_to: delivery.properties.reply_to,
        redelivered: delivery.redelivered,
        data: delivery.payload,
    };

    let err = match handler.exec(&ctx, &msg).await {
        Ok(()) => {
            debug!("message successfully processed");
            return match channel.ack(delivery.delivery_tag).await {
                Err(e) => {
                    error!("error whiling ack msg");
                    span.record_error(&e);
                    span.set_status(Status::Error {
                        description: Cow::from("error to ack msg"),
                    });
                    Err(AmqpError::AckMessageError)
                }
                _ => {
                    span.set_status(Status::Ok);
                    Ok(())
                }
            };
        }
        Err(err) => err,
    };

    warn!(error = err.to_string(), queue, "handler failure");
    span.record_error(&err);
    span.set_status(Status::Error {
        description: Cow::from(err.to_string()),
    });

    let settled = match strategy.on_handler_failure(&msg, &err) {
        Disposition::Ack => channel.ack(delivery.delivery_tag).await,
        Disposition::Nack { requeue } => channel.nack(delivery.delivery_tag, requeue).await,
    };

    if let Err(e) = settled {
        error!(error = e.to_string(), "error whiling settling failed msg");
        return Err(AmqpError::NackMessageError);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::ChannelFactory,
        config::BrokerEndpoint,
        connection::ConnectionBroker,
        handler::MockConsumerHandler,
        queue::QueueDefinition,
        strategy::MockErrorStrategy,
        testing::MemoryBroker,
        transport::OutboundMessage,
    };
    use futures_util::StreamExt;
    use opentelemetry::global;
    use std::time::Duration;

    async fn first_delivery(
        memory: &MemoryBroker,
        queue: &str,
        payload: &[u8],
    ) -> (Channel, Delivery) {
        let factory = ChannelFactory::new(ConnectionBroker::new(
            "tests",
            vec![BrokerEndpoint::new("a")],
            Duration::from_secs(1),
            memory.connector(),
        ));
        let channel = factory.create_channel().await.unwrap();
        channel.declare_queue(&QueueDefinition::new(queue)).await.unwrap();

        let mut message = OutboundMessage::new("", queue, payload.to_vec());
        message.properties.kind = Some("OrderPlaced".to_owned());
        message.properties.correlation_id = Some("c-1".to_owned());
        memory.inject(message);

        let mut stream = channel.consume(queue, "tag").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        (channel, delivery)
    }

    #[tokio::test]
    async fn successful_handler_acks() {
        let memory = MemoryBroker::new();
        let (channel, delivery) = first_delivery(&memory, "orders", b"1").await;

        let mut handler = MockConsumerHandler::new();
        handler
            .expect_exec()
            .withf(|_, msg| {
                msg.msg_type == "OrderPlaced"
                    && msg.queue == "orders"
                    && msg.context.correlation_id == "c-1"
            })
            .times(1)
            .returning(|_, _| Ok(()));
        let mut strategy = MockErrorStrategy::new();
        strategy.expect_on_handler_failure().never();

        consume(
            &global::tracer("tests"),
            &channel,
            "orders",
            delivery,
            &handler,
            &MessageContextProvider,
            &strategy,
        )
        .await
        .unwrap();

        assert_eq!(memory.acked(), vec![b"1".to_vec()]);
        assert!(memory.nacked().is_empty());
    }

    #[tokio::test]
    async fn failed_handler_is_settled_by_the_strategy() {
        let memory = MemoryBroker::new();
        let (channel, delivery) = first_delivery(&memory, "orders", b"2").await;

        let mut handler = MockConsumerHandler::new();
        handler
            .expect_exec()
            .returning(|_, _| Err(AmqpError::HandlerFailure("boom".to_owned())));
        let mut strategy = MockErrorStrategy::new();
        strategy
            .expect_on_handler_failure()
            .times(1)
            .returning(|_, _| Disposition::Nack { requeue: false });

        consume(
            &global::tracer("tests"),
            &channel,
            "orders",
            delivery,
            &handler,
            &MessageContextProvider,
            &strategy,
        )
        .await
        .unwrap();

        assert_eq!(memory.nacked(), vec![(b"2".to_vec(), false)]);
        assert!(memory.acked().is_empty());
    }

    #[tokio::test]
    async fn requeue_decision_reaches_the_broker() {
        let memory = MemoryBroker::new();
        let (channel, delivery) = first_delivery(&memory, "orders", b"3").await;

        let mut handler = MockConsumerHandler::new();
        handler
            .expect_exec()
            .returning(|_, _| Err(AmqpError::HandlerFailure("boom".to_owned())));
        let mut strategy = MockErrorStrategy::new();
        strategy
            .expect_on_handler_failure()
            .returning(|_, _| Disposition::Nack { requeue: true });

        consume(
            &global::tracer("tests"),
            &channel,
            "orders",
            delivery,
            &handler,
            &MessageContextProvider,
            &strategy,
        )
        .await
        .unwrap();

        assert_eq!(memory.nacked(), vec![(b"3".to_vec(), true)]);
    }
}
