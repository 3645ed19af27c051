// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Context
//!
//! A [`MessageContext`] travels with every message: the correlation id that ties a
//! reply to its request, a global request id that follows a business operation
//! across services, and free-form string headers. The [`ContextEnhancer`] writes it
//! onto outgoing properties and the [`MessageContextProvider`] rebuilds it from
//! incoming ones.

use crate::{otel, transport::MessageProperties};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Header carrying the global request id.
pub const HEADER_GLOBAL_REQUEST_ID: &str = "x-global-request-id";
/// Header carrying the correlation id, mirrored from the message properties.
pub const HEADER_CORRELATION_ID: &str = "x-correlation-id";
/// Set on a reply whose request failed on the responder side; holds the failure text.
pub const HEADER_REPLY_ERROR: &str = "x-reply-error";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageContext {
    pub correlation_id: String,
    pub global_request_id: String,
    pub headers: BTreeMap<String, String>,
}

impl MessageContext {
    /// A context for a new operation, with a fresh global request id.
    pub fn new() -> Self {
        MessageContext {
            global_request_id: Uuid::new_v4().to_string(),
            ..Default::default()
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: &str) -> Self {
        self.correlation_id = correlation_id.to_owned();
        self
    }

    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_owned(), value.to_owned());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

/// Attaches a [`MessageContext`] to outgoing message properties.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextEnhancer;

impl ContextEnhancer {
    /// Writes `ctx` and the current trace context onto `props`.
    pub fn enhance(&self, props: &mut MessageProperties, ctx: &MessageContext) {
        self.enhance_with(props, ctx, &opentelemetry::Context::current());
    }

    /// Same as [`enhance`](Self::enhance) with an explicit trace context.
    pub fn enhance_with(
        &self,
        props: &mut MessageProperties,
        ctx: &MessageContext,
        trace: &opentelemetry::Context,
    ) {
        props.headers.extend(ctx.headers.clone());

        if !ctx.global_request_id.is_empty() {
            props.headers.insert(
                HEADER_GLOBAL_REQUEST_ID.to_owned(),
                ctx.global_request_id.clone(),
            );
        }

        if !ctx.correlation_id.is_empty() {
            props.correlation_id = Some(ctx.correlation_id.clone());
            props
                .headers
                .insert(HEADER_CORRELATION_ID.to_owned(), ctx.correlation_id.clone());
        }

        otel::inject(trace, &mut props.headers);
    }
}

/// Rebuilds a [`MessageContext`] from incoming message properties.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageContextProvider;

impl MessageContextProvider {
    /// Never fails: missing fields leave the context empty.
    pub fn extract(&self, props: &MessageProperties) -> MessageContext {
        let mut headers = props.headers.clone();

        let correlation_id = props
            .correlation_id
            .clone()
            .or_else(|| headers.get(HEADER_CORRELATION_ID).cloned())
            .unwrap_or_default();
        headers.remove(HEADER_CORRELATION_ID);

        let global_request_id = headers
            .remove(HEADER_GLOBAL_REQUEST_ID)
            .unwrap_or_default();

        MessageContext {
            correlation_id,
            global_request_id,
            headers,
        }
    }
}
