// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use anyhow::{Context, Result};
use rabbitmq_relay::{
    connection::BrokerConnection,
    consumer::Consumer,
    driver::LapinTransport,
    logging,
    metrics::{spawn_sampler, Metrics, SAMPLE_INTERVAL},
    processor::QueueProcessor,
    publisher::Publisher,
    server,
    settings::Settings,
};
use std::{net::SocketAddr, sync::Arc};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load().context("failed to load configuration")?;
    logging::init(&settings.logging).context("failed to initialize logging")?;

    info!(
        app_name = settings.app.name.as_str(),
        version = env!("CARGO_PKG_VERSION"),
        "starting application"
    );

    let metrics = Arc::new(Metrics::new().context("failed to register metrics")?);

    let connection = BrokerConnection::dial_with(
        LapinTransport::new(&settings.app.name),
        &settings.amqp.dsn(),
        settings.amqp.reconnect_policy(),
        metrics.clone(),
    )
    .await
    .context("failed to connect to rabbitmq")?;

    let publisher = Publisher::new(
        connection
            .channel()
            .await
            .context("failed to open publisher channel")?,
    );
    let consumer = Consumer::new(
        connection
            .channel()
            .await
            .context("failed to open consumer channel")?,
        metrics.clone(),
        settings.amqp.consumer_settings(&settings.app.name),
    );
    let processor = QueueProcessor::new(
        publisher,
        &settings.queues.input_queue,
        &settings.queues.output_queue,
    );

    let cancel = CancellationToken::new();

    let sampler = spawn_sampler(metrics.clone(), SAMPLE_INTERVAL, cancel.clone());
    let server = tokio::spawn(server::serve(
        SocketAddr::from(([0, 0, 0, 0], settings.app.port)),
        server::router(metrics.clone(), connection.clone()),
        cancel.clone(),
    ));

    consumer
        .start_consuming(&cancel, &settings.queues.input_queue, processor)
        .await
        .context("failed to start consumer")?;

    info!(
        input_queue = settings.queues.input_queue.as_str(),
        output_queue = settings.queues.output_queue.as_str(),
        "queue processor started successfully"
    );

    shutdown_signal().await;
    info!("shutting down");

    if let Err(err) = consumer.stop().await {
        error!(error = err.to_string(), "failure to stop consumer");
    }
    cancel.cancel();

    if let Err(err) = sampler.await {
        warn!(error = err.to_string(), "metrics sampler ended abnormally");
    }
    match server.await {
        Ok(Err(err)) => error!(error = err.to_string(), "metrics server failed"),
        Err(err) => warn!(error = err.to_string(), "metrics server ended abnormally"),
        _ => {}
    }

    if let Err(err) = connection.close().await {
        warn!(error = err.to_string(), "failure to close amqp connection");
    }

    info!("application shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = err.to_string(), "failure to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to listen for sigterm");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}
