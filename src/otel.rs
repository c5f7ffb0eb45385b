// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration for RabbitMQ
//!
//! Trace context travels with each message in its AMQP headers: the publisher
//! injects the caller's context, and the consumer extracts it to parent the
//! span it opens around the handler.

use lapin::{
    types::{AMQPValue, ShortString},
    BasicProperties,
};
use opentelemetry::{
    global,
    propagation::{Extractor, Injector},
    trace::{SpanKind, TraceContextExt, Tracer},
    Context,
};
use std::collections::BTreeMap;
use tracing::error;

const TRACER_NAME: &str = "amqp consumer";

struct HeaderInjector<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

struct HeaderExtractor<'a> {
    headers: &'a BTreeMap<ShortString, AMQPValue>,
}

impl Extractor for HeaderExtractor<'_> {
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

/// Writes the trace context of `ctx` into `headers`.
pub(crate) fn inject(ctx: &Context, headers: &mut BTreeMap<ShortString, AMQPValue>) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderInjector { headers })
    });
}

/// Reads the trace context carried by a message's headers.
pub(crate) fn extract(props: &BasicProperties) -> Context {
    let empty = BTreeMap::new();
    let headers = props
        .headers()
        .as_ref()
        .map(|table| table.inner())
        .unwrap_or(&empty);

    global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor { headers })
    })
}

/// Opens a consumer span parented on the message's trace context and
/// returns a context carrying it.
pub(crate) fn consumer_context(props: &BasicProperties, name: &str) -> Context {
    let parent = extract(props);
    let tracer = global::tracer(TRACER_NAME);

    let span = tracer
        .span_builder(name.to_owned())
        .with_kind(SpanKind::Consumer)
        .start_with_context(&tracer, &parent);

    parent.with_span(span)
}
