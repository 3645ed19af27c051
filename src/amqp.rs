// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # lapin Transport
//!
//! This module implements the transport traits on top of lapin. It establishes
//! connections to RabbitMQ endpoints, opens channels on them and maps the channel
//! operations (confirm mode, publish, consume, ack/nack) onto the AMQP methods.

use crate::{
    config::BrokerEndpoint,
    errors::AmqpError,
    queue::QueueDefinition,
    transport::{
        ConfirmListener, Confirmation, Connector, Delivery, DeliveryStream, ErrorListener,
        MessageProperties, OutboundMessage, TransportChannel, TransportConnection,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use parking_lot::Mutex;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error, warn};

const REPLY_SUCCESS: u16 = 200;

/// Connects to RabbitMQ with lapin.
#[derive(Debug, Clone, Default)]
pub struct LapinConnector;

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(
        &self,
        endpoint: &BrokerEndpoint,
        connection_name: &str,
    ) -> Result<Arc<dyn TransportConnection>, AmqpError> {
        debug!(host = endpoint.host, "creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(connection_name.to_owned()));

        match Connection::connect(&endpoint.uri(), options).await {
            Ok(conn) => {
                debug!(host = endpoint.host, "amqp connected");
                Ok(Arc::new(LapinConnection { conn }))
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    host = endpoint.host,
                    "failure to connect"
                );
                Err(AmqpError::ConnectionError)
            }
        }
    }
}

pub struct LapinConnection {
    conn: Connection,
}

#[async_trait]
impl TransportConnection for LapinConnection {
    async fn open_channel(&self) -> Result<Arc<dyn TransportChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!(id = channel.id(), "channel created");
                Ok(Arc::new(LapinChannel {
                    channel,
                    listener: Mutex::new(None),
                }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }
    }

    fn on_error(&self, listener: ErrorListener) {
        let mut listener = Some(listener);
        self.conn.on_error(move |err| {
            error!(error = err.to_string(), "amqp connection failure");
            if let Some(listener) = listener.take() {
                listener(AmqpError::ConnectionUnavailable);
            }
        });
    }

    fn is_connected(&self) -> bool {
        self.conn.status().connected()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.conn
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| {
                warn!(error = err.to_string(), "failure to close the connection");
                AmqpError::ConnectionError
            })
    }
}

pub struct LapinChannel {
    channel: Channel,
    listener: Mutex<Option<ConfirmListener>>,
}

#[async_trait]
impl TransportChannel for LapinChannel {
    fn id(&self) -> u16 {
        self.channel.id()
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn confirm_select(&self, listener: ConfirmListener) -> Result<(), AmqpError> {
        if let Err(err) = self
            .channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
        {
            error!(error = err.to_string(), "failure to enable confirms");
            return Err(AmqpError::ConfirmSelectError);
        }

        *self.listener.lock() = Some(listener);
        Ok(())
    }

    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Ok(queue) => {
                debug!("queue: {} was declared", queue.name());
                Ok(queue.name().to_string())
            }
            Err(err) => {
                error!(error = err.to_string(), name = def.name, "failure to declare queue");
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
        }
    }

    async fn publish(
        &self,
        sequence: Option<u64>,
        message: OutboundMessage,
    ) -> Result<(), AmqpError> {
        let confirm = match self
            .channel
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &message.payload,
                to_amqp_properties(&message.properties),
            )
            .await
        {
            Ok(confirm) => confirm,
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                return Err(AmqpError::PublishingError);
            }
        };

        let listener = self.listener.lock().clone();
        if let (Some(sequence), Some(listener)) = (sequence, listener) {
            tokio::spawn(async move {
                match confirm.await {
                    Ok(confirmation) if confirmation.is_nack() => {
                        listener(sequence, Confirmation::Nack)
                    }
                    Ok(_) => listener(sequence, Confirmation::Ack),
                    Err(err) => {
                        warn!(error = err.to_string(), sequence, "confirm lost");
                        listener(sequence, Confirmation::Nack)
                    }
                }
            });
        }

        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::BindingConsumerError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| match result {
                Ok(delivery) => Ok(Delivery {
                    delivery_tag: delivery.delivery_tag,
                    exchange: delivery.exchange.to_string(),
                    routing_key: delivery.routing_key.to_string(),
                    redelivered: delivery.redelivered,
                    properties: from_amqp_properties(&delivery.properties),
                    payload: delivery.data,
                }),
                Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
            })
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| AmqpError::ConsumerError(err.to_string()))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.channel
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| {
                debug!(error = err.to_string(), "failure to close the channel");
                AmqpError::ChannelError
            })
    }
}

fn to_amqp_properties(props: &MessageProperties) -> BasicProperties {
    let headers: BTreeMap<ShortString, AMQPValue> = props
        .headers
        .iter()
        .map(|(k, v)| {
            (
                ShortString::from(k.clone()),
                AMQPValue::LongString(LongString::from(v.clone())),
            )
        })
        .collect();

    let mut amqp = BasicProperties::default().with_headers(FieldTable::from(headers));

    if let Some(v) = &props.message_id {
        amqp = amqp.with_message_id(ShortString::from(v.clone()));
    }
    if let Some(v) = &props.correlation_id {
        amqp = amqp.with_correlation_id(ShortString::from(v.clone()));
    }
    if let Some(v) = &props.reply_to {
        amqp = amqp.with_reply_to(ShortString::from(v.clone()));
    }
    if let Some(v) = &props.content_type {
        amqp = amqp.with_content_type(ShortString::from(v.clone()));
    }
    if let Some(v) = &props.kind {
        amqp = amqp.with_type(ShortString::from(v.clone()));
    }

    amqp
}

fn from_amqp_properties(props: &AMQPProperties) -> MessageProperties {
    let mut headers = BTreeMap::new();

    if let Some(table) = props.headers() {
        for (key, value) in table.inner() {
            let value = match value {
                AMQPValue::LongString(v) => match std::str::from_utf8(v.as_bytes()) {
                    Ok(v) => v.to_owned(),
                    Err(e) => {
                        error!("Error decoding header value {:?}", e);
                        continue;
                    }
                },
                AMQPValue::ShortString(v) => v.to_string(),
                _ => continue,
            };
            headers.insert(key.to_string(), value);
        }
    }

    MessageProperties {
        message_id: props.message_id().as_ref().map(|v| v.to_string()),
        correlation_id: props.correlation_id().as_ref().map(|v| v.to_string()),
        reply_to: props.reply_to().as_ref().map(|v| v.to_string()),
        content_type: props.content_type().as_ref().map(|v| v.to_string()),
        kind: props.kind().as_ref().map(|v| v.to_string()),
        headers,
    }
}
