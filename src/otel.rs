// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Propagates trace context through message headers and opens a consumer span for
//! each delivery, so a request and the work it triggers on the other side of the
//! broker end up in one trace.

use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};

/// An adapter for injecting and extracting OpenTelemetry context from message
/// headers.
pub(crate) struct HeaderPropagator<'a> {
    headers: &'a mut BTreeMap<String, String>,
}

impl<'a> HeaderPropagator<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<String, String>) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderPropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(key.to_lowercase(), value);
    }
}

impl Extractor for HeaderPropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(String::as_str).collect()
    }
}

/// Writes the trace context of `ctx` into `headers`.
pub(crate) fn inject(ctx: &Context, headers: &mut BTreeMap<String, String>) {
    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderPropagator::new(headers))
    });
}

/// Creates a new OpenTelemetry span for message processing.
///
/// This function extracts trace context from the message headers and
/// creates a new span for processing the message.
///
/// # Parameters
/// * `headers` - Message headers
/// * `tracer` - OpenTelemetry tracer
/// * `name` - Name for the new span (typically the message type or queue)
///
/// # Returns
/// A tuple containing the extracted context and the new span
pub fn new_span(
    headers: &BTreeMap<String, String>,
    tracer: &BoxedTracer,
    name: &str,
) -> (Context, BoxedSpan) {
    let mut headers = headers.clone();
    let ctx = opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderPropagator::new(&mut headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injected_keys_are_lowercased_and_readable() {
        let mut headers = BTreeMap::new();
        let mut propagator = HeaderPropagator::new(&mut headers);
        propagator.set("TraceParent", "00-abc".to_owned());

        assert_eq!(propagator.get("traceparent"), Some("00-abc"));
        assert_eq!(propagator.keys(), vec!["traceparent"]);
    }
}
