// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Handlers
//!
//! The application side of a subscription: a handler receives each delivered
//! message together with the trace context extracted from its headers.

use crate::{context::MessageContext, errors::AmqpError};
use async_trait::async_trait;
use opentelemetry::Context;

/// A delivered message as seen by a handler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerMessage {
    pub queue: String,
    pub msg_type: String,
    pub data: Vec<u8>,
    pub reply_to: Option<String>,
    pub redelivered: bool,
    pub context: MessageContext,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    /// Processes one message. An error leaves the delivery to the error strategy.
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<(), AmqpError>;
}
