// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Structured logging and trace propagation setup.

use crate::settings::{LogFormat, LogSettings};
use opentelemetry::global;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use std::io;
use tracing::Subscriber;
use tracing_subscriber::{
    fmt::{self, MakeWriter},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter, Layer, Registry,
};

const FALLBACK_LEVEL: &str = "info";

/// Builds the filter from `RUST_LOG` when set, else from the configured
/// level. An unparsable level falls back to `info`.
fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new(FALLBACK_LEVEL))
}

fn subscriber<W>(settings: &LogSettings, writer: W) -> impl Subscriber + Send + Sync + 'static
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let output = match settings.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .with_writer(writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_writer(writer)
            .boxed(),
    };

    Registry::default().with(filter(&settings.level)).with(output)
}

/// Installs the global subscriber and the W3C trace-context propagator.
///
/// # Parameters
/// * `settings` - Level and output format from the `logging` section
///
/// # Returns
/// An error if a global subscriber is already installed
pub fn init(settings: &LogSettings) -> Result<(), TryInitError> {
    global::set_text_map_propagator(TraceContextPropagator::new());
    subscriber(settings, io::stdout).try_init()
}
