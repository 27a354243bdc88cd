// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Trace context travels inside the AMQP message headers. Publishing injects the
//! current context, consuming extracts it again and opens a consumer span per
//! envelope.

use crate::client::Envelope;
use lapin::types::{AMQPValue, ShortString};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::error;

/// Adapter exposing AMQP headers to the OpenTelemetry propagators.
pub(crate) struct AmqpHeaderPropagator<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> AmqpHeaderPropagator<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for AmqpHeaderPropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

impl Extractor for AmqpHeaderPropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|header_value| {
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
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Writes the given context into outgoing headers, using the global text
/// map propagator.
///
/// # Parameters
/// * `ctx` - Context to propagate
/// * `headers` - Headers of the message being published
pub(crate) fn inject_context(ctx: &Context, headers: &mut BTreeMap<ShortString, AMQPValue>) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut AmqpHeaderPropagator::new(headers))
    });
}

/// Opens a consumer span for an envelope.
///
/// The span is parented on the trace context extracted from the envelope
/// headers, so it joins the trace of the publisher.
///
/// # Parameters
/// * `envelope` - The consumed message
/// * `tracer` - Tracer creating the span
/// * `name` - Span name, the queue name when consuming
///
/// # Returns
/// A started span of kind `Consumer`, ended by the caller
pub(crate) fn new_span(envelope: &Envelope, tracer: &BoxedTracer, name: &str) -> BoxedSpan {
    let ctx = envelope.trace_context();

    tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx)
}
