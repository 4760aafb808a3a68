// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration for RabbitMQ
//!
//! Extracts the trace context carried in message headers so that the span of a
//! handler invocation is parented to the span of the original publish.

use lapin::{protocol::basic::AMQPProperties, types::AMQPValue, types::FieldTable};
use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    propagation::Extractor,
    trace::{SpanKind, Tracer},
    Context,
};
use std::borrow::Cow;
use tracing::error;

/// Reads trace context entries out of RabbitMQ headers.
pub(crate) struct RabbitMQTracePropagator<'a> {
    headers: &'a FieldTable,
}

impl<'a> RabbitMQTracePropagator<'a> {
    pub(crate) fn new(headers: &'a FieldTable) -> Self {
        Self { headers }
    }
}

impl Extractor for RabbitMQTracePropagator<'_> {
    /// Gets a trace context value from RabbitMQ message headers.
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.inner().get(key).and_then(|header_value| {
            if let AMQPValue::LongString(header_value) = header_value {
                std::str::from_utf8(header_value.as_bytes())
                    .map_err(|e| error!("Error decoding header value {:?}", e))
                    .ok()
            } else {
                None
            }
        })
    }

    fn keys(&self) -> Vec<&str> {
        self.headers
            .inner()
            .keys()
            .map(|header| header.as_str())
            .collect()
    }
}

/// Creates a consumer span parented to the context found in `props`.
///
/// Returns the extracted context, which handlers receive, and the new span.
pub(crate) fn new_span(
    props: &AMQPProperties,
    tracer: &BoxedTracer,
    name: &str,
) -> (Context, BoxedSpan) {
    let headers = props.headers().clone().unwrap_or_default();
    let ctx = opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&RabbitMQTracePropagator::new(&headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}
