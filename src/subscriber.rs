// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Subscriber
//!
//! Registers broker-side consumers and drives them. Each subscription owns a
//! channel, declares its queue, consumes from it and hands every delivery to
//! [`consumer::consume`](crate::consumer). When the connection is lost the delivery
//! stream ends; the subscription then waits for the broker to recover and registers
//! itself again on a fresh channel.

use crate::{
    channel::{Channel, ChannelFactory},
    consumer::consume,
    context::MessageContextProvider,
    errors::AmqpError,
    handler::ConsumerHandler,
    queue::QueueDefinition,
    strategy::ErrorStrategy,
    transport::DeliveryStream,
};
use futures_util::StreamExt;
use opentelemetry::global;
use std::sync::Arc;
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Creates consumers and dispatches their deliveries to handlers.
#[derive(Clone)]
pub struct Subscriber {
    channels: ChannelFactory,
    provider: MessageContextProvider,
    strategy: Arc<dyn ErrorStrategy>,
    prefetch_count: u16,
    shutdown: CancellationToken,
    running: Arc<watch::Sender<usize>>,
}

struct Bound {
    channel: Channel,
    queue: String,
    stream: DeliveryStream,
}

impl Subscriber {
    /// # Parameters
    /// * `channels` - Factory the consumer channels come from
    /// * `strategy` - Settles deliveries whose handler failed
    /// * `prefetch_count` - Unacked deliveries allowed per consumer
    pub fn new(
        channels: ChannelFactory,
        strategy: Arc<dyn ErrorStrategy>,
        prefetch_count: u16,
    ) -> Self {
        Subscriber {
            channels,
            provider: MessageContextProvider,
            strategy,
            prefetch_count,
            shutdown: CancellationToken::new(),
            running: Arc::new(watch::channel(0).0),
        }
    }

    /// Number of consumers currently running.
    pub fn running(&self) -> usize {
        *self.running.borrow()
    }

    /// Stops every subscription created through this subscriber, or any clone of
    /// it, and waits until their in-flight handlers are done. Later calls to
    /// [`subscribe`](Self::subscribe) fail.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let mut running = self.running.subscribe();
        let _ = running.wait_for(|n| *n == 0).await;
        debug!("subscriber closed");
    }

    /// Starts consuming `def` with `handler`.
    ///
    /// Returns once the consumer is registered with the broker. Deliveries are
    /// handled one at a time, in order; each is acked after the handler succeeds.
    pub async fn subscribe(
        &self,
        def: QueueDefinition,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<Subscription, AmqpError> {
        if self.shutdown.is_cancelled() {
            return Err(AmqpError::ConsumerError("subscriber closed".to_owned()));
        }

        let consumer_tag = Uuid::new_v4().to_string();
        let bound = self.bind(&def, &consumer_tag).await?;
        debug!(queue = bound.queue, consumer_tag, "consumer registered");

        let (queue_tx, queue) = watch::channel(Some(bound.queue.clone()));
        let token = self.shutdown.child_token();
        let running = RunningGuard::new(self.running.clone());

        let task = tokio::spawn(self.clone().run(
            def,
            consumer_tag.clone(),
            handler,
            bound,
            queue_tx,
            token.clone(),
            running,
        ));

        Ok(Subscription {
            consumer_tag,
            queue,
            token,
            task,
        })
    }

    async fn bind(&self, def: &QueueDefinition, consumer_tag: &str) -> Result<Bound, AmqpError> {
        let channel = self.channels.create_channel().await?;

        let setup = async {
            channel.qos(self.prefetch_count).await?;
            let queue = channel.declare_queue(def).await?;
            let stream = channel.consume(&queue, consumer_tag).await?;
            Ok::<_, AmqpError>((queue, stream))
        }
        .await;

        match setup {
            Ok((queue, stream)) => Ok(Bound {
                channel,
                queue,
                stream,
            }),
            Err(err) => {
                channel.close().await;
                Err(err)
            }
        }
    }

    async fn run(
        self,
        def: QueueDefinition,
        consumer_tag: String,
        handler: Arc<dyn ConsumerHandler>,
        mut bound: Bound,
        queue_name: watch::Sender<Option<String>>,
        token: CancellationToken,
        _running: RunningGuard,
    ) {
        let tracer = global::tracer("amqp consumer");

        'consume: loop {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = token.cancelled() => break 'consume,
                    next = bound.stream.next() => next,
                };

                match next {
                    Some(Ok(delivery)) => {
                        if let Err(err) = consume(
                            &tracer,
                            &bound.channel,
                            &bound.queue,
                            delivery,
                            handler.as_ref(),
                            &self.provider,
                            self.strategy.as_ref(),
                        )
                        .await
                        {
                            error!(error = err.to_string(), "error consume msg");
                        }
                    }
                    Some(Err(err)) => {
                        error!(error = err.to_string(), "errors consume msg");
                        break;
                    }
                    None => break,
                }
            }

            warn!(queue = bound.queue, "consumer stream ended, re-registering");
            queue_name.send_replace(None);
            bound.channel.close().await;

            bound = loop {
                let rebound = tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    rebound = self.bind(&def, &consumer_tag) => rebound,
                };

                match rebound {
                    Ok(rebound) => break rebound,
                    Err(err) => {
                        error!(error = err.to_string(), "failure to re-register consumer");
                        let retry_in = self.channels.broker().reconnect_interval();
                        tokio::select! {
                            _ = token.cancelled() => return,
                            _ = tokio::time::sleep(retry_in) => {}
                        }
                    }
                }
            };

            debug!(queue = bound.queue, consumer_tag, "consumer re-registered");
            queue_name.send_replace(Some(bound.queue.clone()));
        }

        queue_name.send_replace(None);
        if let Err(err) = bound.channel.cancel(&consumer_tag).await {
            debug!(error = err.to_string(), "failure to cancel consumer");
        }
        bound.channel.close().await;
        debug!(queue = bound.queue, consumer_tag, "consumer cancelled");
    }
}

/// Counts a consumer task as running until dropped.
struct RunningGuard(Arc<watch::Sender<usize>>);

impl RunningGuard {
    fn new(running: Arc<watch::Sender<usize>>) -> Self {
        running.send_modify(|n| *n += 1);
        RunningGuard(running)
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n -= 1);
    }
}

/// Handle to a running consumer.
///
/// Dropping the handle leaves the consumer running; use [`cancel`](Self::cancel)
/// or [`cancel_on_drop`](Self::cancel_on_drop) to stop it.
pub struct Subscription {
    consumer_tag: String,
    queue: watch::Receiver<Option<String>>,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl Subscription {
    /// Name of the consumed queue, `None` while the consumer is re-registering.
    /// Server-named queues get a new name after every connection recovery.
    pub fn queue_name(&self) -> Option<String> {
        self.queue.borrow().clone()
    }

    /// Waits until the consumer is registered and returns its queue name.
    ///
    /// # Returns
    /// The queue name, or `ConsumerError` if the subscription has stopped
    pub async fn bound_queue(&self) -> Result<String, AmqpError> {
        let mut queue = self.queue.clone();
        let bound = queue
            .wait_for(Option::is_some)
            .await
            .map_err(|_| AmqpError::ConsumerError("subscription stopped".to_owned()))?;
        Ok(bound.clone().unwrap_or_default())
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    /// Returns a guard that stops the consumer when dropped.
    ///
    /// The consumer task still cancels its consumer and closes its channel, it is
    /// just not awaited. Used for consumers owned by a future that may be dropped
    /// half way.
    pub fn cancel_on_drop(&self) -> DropGuard {
        self.token.clone().drop_guard()
    }

    /// Stops the consumer.
    ///
    /// The delivery being handled, if any, is finished and settled first; then the
    /// consumer is cancelled and its channel closed.
    pub async fn cancel(self) {
        self.token.cancel();
        if let Err(err) = self.task.await {
            error!(error = err.to_string(), "consumer task failure");
        }
    }
}
