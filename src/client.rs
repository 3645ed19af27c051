// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Bus Client
//!
//! Builds the bus from its configuration in dependency order and hands back one
//! handle owning every component:
//!
//! ```text
//! ConnectionBroker ─► ChannelFactory ─┬─► Publisher (+ PublishAcknowledger) ─┬─► Requester
//!                                     └─► Subscriber ─────────────────────────┴─► Responder
//! ```
//!
//! Nothing is global; an application may run several clients side by side.

use crate::{
    acknowledger::PublishAcknowledger,
    amqp::LapinConnector,
    channel::ChannelFactory,
    codec::{Codec, JsonCodec},
    config::RabbitMQConfigs,
    connection::ConnectionBroker,
    context::MessageContext,
    errors::AmqpError,
    handler::ConsumerHandler,
    publisher::Publisher,
    queue::QueueDefinition,
    requester::Requester,
    responder::Responder,
    strategy::{DefaultStrategy, ErrorStrategy},
    subscriber::{Subscriber, Subscription},
    transport::Connector,
};
use serde::{de::DeserializeOwned, Serialize};
use std::{future::Future, sync::Arc};
use tracing::debug;

/// Handle to a configured bus.
#[derive(Clone)]
pub struct BusClient<C: Codec = JsonCodec> {
    broker: ConnectionBroker,
    channels: ChannelFactory,
    acknowledger: PublishAcknowledger,
    publisher: Publisher<C>,
    subscriber: Subscriber,
    requester: Requester<C>,
    responder: Responder<C>,
}

impl BusClient<JsonCodec> {
    /// A client talking to RabbitMQ through lapin, with JSON payloads.
    pub fn new(cfg: &RabbitMQConfigs) -> Self {
        Self::with_connector(cfg, Arc::new(LapinConnector), JsonCodec)
    }
}

impl<C: Codec> BusClient<C> {
    /// A client over `connector` using `codec`, failing deliveries with the
    /// default strategy.
    pub fn with_connector(cfg: &RabbitMQConfigs, connector: Arc<dyn Connector>, codec: C) -> Self {
        let strategy = Arc::new(DefaultStrategy::new(cfg.requeue_on_failure));
        Self::with_strategy(cfg, connector, codec, strategy)
    }

    /// A client over `connector` using `codec` and `strategy`.
    pub fn with_strategy(
        cfg: &RabbitMQConfigs,
        connector: Arc<dyn Connector>,
        codec: C,
        strategy: Arc<dyn ErrorStrategy>,
    ) -> Self {
        let broker = ConnectionBroker::new(
            &cfg.app_name,
            cfg.endpoints(),
            cfg.reconnect_interval(),
            connector,
        );
        let channels = ChannelFactory::new(broker.clone());
        let acknowledger = PublishAcknowledger::new(cfg.publish_confirm_timeout());
        let publisher = Publisher::new(channels.clone(), acknowledger.clone(), codec);
        let subscriber = Subscriber::new(channels.clone(), strategy.clone(), cfg.prefetch_count);
        let requester = Requester::new(
            publisher.clone(),
            subscriber.clone(),
            cfg.request_timeout(),
            cfg.reply_queue,
        );
        let responder = Responder::new(publisher.clone(), subscriber.clone(), strategy);

        debug!(
            app = cfg.app_name,
            endpoints = broker.endpoints().len(),
            "bus client configured"
        );

        BusClient {
            broker,
            channels,
            acknowledger,
            publisher,
            subscriber,
            requester,
            responder,
        }
    }

    pub fn broker(&self) -> &ConnectionBroker {
        &self.broker
    }

    pub fn channels(&self) -> &ChannelFactory {
        &self.channels
    }

    pub fn acknowledger(&self) -> &PublishAcknowledger {
        &self.acknowledger
    }

    pub fn publisher(&self) -> &Publisher<C> {
        &self.publisher
    }

    pub fn subscriber(&self) -> &Subscriber {
        &self.subscriber
    }

    pub fn requester(&self) -> &Requester<C> {
        &self.requester
    }

    pub fn responder(&self) -> &Responder<C> {
        &self.responder
    }

    /// See [`Publisher::publish`].
    pub async fn publish<T: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &T,
        ctx: &MessageContext,
    ) -> Result<(), AmqpError> {
        self.publisher
            .publish(exchange, routing_key, payload, ctx)
            .await
    }

    /// See [`Requester::request`].
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
        self.requester
            .request(exchange, routing_key, payload, ctx)
            .await
    }

    /// See [`Subscriber::subscribe`].
    pub async fn subscribe(
        &self,
        def: QueueDefinition,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<Subscription, AmqpError> {
        self.subscriber.subscribe(def, handler).await
    }

    /// See [`Responder::respond`].
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
        self.responder.respond(def, f).await
    }

    /// Stops every consumer, letting in-flight handlers finish, then closes the
    /// connection.
    pub async fn shutdown(&self) {
        self.subscriber.close().await;
        self.requester.close().await;
        self.broker.close().await;
        debug!("bus client shut down");
    }
}
