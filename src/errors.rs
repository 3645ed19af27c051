// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Bus
//!
//! This module provides the error taxonomy shared by every component of the bus:
//! connection management, channel lifecycle, publish confirmation, request/reply
//! correlation and consumer dispatch. Transport level failures are mostly recovered
//! internally; the variants that reach a caller are the ones that caller can act on.

use thiserror::Error;

/// Why a publish was not confirmed by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmFailure {
    /// The broker answered with a negative acknowledgment.
    Nack,
    /// No answer arrived before the confirm deadline.
    Timeout,
}

impl std::fmt::Display for ConfirmFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfirmFailure::Nack => write!(f, "nack"),
            ConfirmFailure::Timeout => write!(f, "timeout"),
        }
    }
}

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// A single connection attempt to a broker endpoint failed
    #[error("failure to connect")]
    ConnectionError,

    /// No live connection is available right now
    #[error("connection unavailable")]
    ConnectionUnavailable,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// The channel belongs to a connection that is recovering or gone
    #[error("channel invalidated by connection recovery")]
    ChannelInvalidated,

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error enabling publisher confirms on a channel
    #[error("failure to enable publisher confirms")]
    ConfirmSelectError,

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// The broker did not confirm a publish
    #[error("publish not confirmed: {0}")]
    PublishNotConfirmed(ConfirmFailure),

    /// A sequence number was tracked twice on the same channel
    #[error("sequence number `{0}` already tracked")]
    DuplicateSequence(u64),

    /// Error encoding a payload
    #[error("failure to serialize payload `{0}`")]
    SerializationError(String),

    /// Error parsing a message payload
    #[error("failure to parse payload `{0}`")]
    ParsePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error consuming a message
    #[error("consumer failure `{0}`")]
    ConsumerError(String),

    /// An application handler failed to process a delivery
    #[error("handler failure `{0}`")]
    HandlerFailure(String),

    /// No reply arrived for the request with the given correlation id in time
    #[error("request `{0}` timed out")]
    RequestTimedOut(String),

    /// A correlation id was generated while another request still owns it
    #[error("correlation id `{0}` is already outstanding")]
    CorrelationCollision(String),

    /// The responder reported a failure instead of a result
    #[error("responder failure `{0}`")]
    RemoteFailure(String),

    /// The caller cancelled the operation
    #[error("operation cancelled")]
    Cancelled,
}
