// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! A fixed-size pool of workers consuming one durable queue with manual
//! acknowledgment. Each delivery is handed to a `MessageHandler`; success
//! acks the delivery, while a returned error or a panic nacks it with
//! requeue. Lifecycle is `Idle -> Running -> Stopping -> Idle`, and calls
//! made out of turn are no-ops.

use crate::{
    channel::BrokerChannel,
    errors::AmqpError,
    metrics::Metrics,
    otel,
    transport::{Delivery, DeliveryStream},
};
use async_trait::async_trait;
use futures_util::{FutureExt, StreamExt};
use lapin::{
    options::{BasicConsumeOptions, QueueDeclareOptions},
    types::FieldTable,
};
use opentelemetry::{
    trace::{Status, TraceContextExt},
    Context,
};
use std::{
    any::Any,
    borrow::Cow,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::{sync::Mutex, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Unacknowledged deliveries allowed per consumer.
pub const DEFAULT_PREFETCH_COUNT: u16 = 50;
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CONSUMER_TAG_PREFIX: &str = "rabbitmq-relay";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSettings {
    /// Number of workers, each with its own broker-side consumer.
    pub concurrency: usize,
    pub prefetch_count: u16,
    pub prefetch_size: u32,
    pub global: bool,
    /// Upper bound on how long `stop` waits for in-flight work.
    pub stop_timeout: Duration,
    pub consumer_tag_prefix: String,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        ConsumerSettings {
            concurrency: 1,
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            prefetch_size: 0,
            global: false,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            consumer_tag_prefix: DEFAULT_CONSUMER_TAG_PREFIX.to_owned(),
        }
    }
}

impl ConsumerSettings {
    pub fn new(concurrency: usize) -> ConsumerSettings {
        ConsumerSettings {
            concurrency,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConsumerState {
    Idle = 0,
    Running = 1,
    Stopping = 2,
}

impl ConsumerState {
    fn from_u8(value: u8) -> ConsumerState {
        match value {
            1 => ConsumerState::Running,
            2 => ConsumerState::Stopping,
            _ => ConsumerState::Idle,
        }
    }
}

/// Per-delivery context handed to the handler.
#[derive(Debug, Clone)]
pub struct MessageContext {
    /// Fresh identifier correlating every log line of one delivery.
    pub request_id: String,
    pub worker_id: usize,
    /// Trace context carrying the consumer span of this delivery.
    pub trace: Context,
}

/// Processes one delivery.
///
/// Returning `Ok` acks the delivery. An error, or a panic, nacks it with
/// requeue.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, ctx: &MessageContext, delivery: &Delivery) -> Result<(), AmqpError>;
}

#[derive(Default)]
struct Workers {
    tasks: JoinSet<()>,
    cancel: Option<CancellationToken>,
}

/// Worker pool consuming a single queue.
pub struct Consumer {
    channel: BrokerChannel,
    metrics: Arc<Metrics>,
    settings: ConsumerSettings,
    state: AtomicU8,
    workers: Mutex<Workers>,
}

impl Consumer {
    /// Creates an idle consumer.
    ///
    /// # Parameters
    /// * `channel` - Channel the workers consume on; QoS is applied to it
    /// * `metrics` - Sink for delivery counters and the active-worker gauge
    /// * `settings` - Pool size, QoS and stop timeout
    pub fn new(
        channel: BrokerChannel,
        metrics: Arc<Metrics>,
        settings: ConsumerSettings,
    ) -> Consumer {
        Consumer {
            channel,
            metrics,
            settings,
            state: AtomicU8::new(ConsumerState::Idle as u8),
            workers: Mutex::new(Workers::default()),
        }
    }

    pub fn state(&self) -> ConsumerState {
        ConsumerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn transition(&self, from: ConsumerState, to: ConsumerState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Applies QoS, declares `queue` durable and spawns the worker pool.
    ///
    /// Workers stop when `parent` is cancelled or `stop` is called. Calling
    /// this while already running does nothing.
    ///
    /// # Parameters
    /// * `parent` - Token whose cancellation also stops the workers
    /// * `queue` - Queue to consume from
    /// * `handler` - Shared handler invoked for every delivery
    ///
    /// # Returns
    /// Ok(()) once the workers are spawned, or the QoS/declare error
    pub async fn start_consuming(
        &self,
        parent: &CancellationToken,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), AmqpError> {
        let mut workers = self.workers.lock().await;

        if !self.transition(ConsumerState::Idle, ConsumerState::Running) {
            debug!(queue, "consumer already running");
            return Ok(());
        }

        if let Err(err) = self.prepare(queue).await {
            self.state.store(ConsumerState::Idle as u8, Ordering::SeqCst);
            return Err(err);
        }

        let cancel = parent.child_token();
        for worker_id in 0..self.settings.concurrency {
            let worker = Worker {
                id: worker_id,
                queue: queue.to_owned(),
                tag: format!(
                    "{}-{}-{}",
                    self.settings.consumer_tag_prefix,
                    worker_id,
                    Uuid::new_v4().simple()
                ),
                channel: self.channel.clone(),
                metrics: self.metrics.clone(),
                handler: handler.clone(),
                cancel: cancel.clone(),
            };
            workers.tasks.spawn(worker.run());
        }
        workers.cancel = Some(cancel);

        info!(
            queue,
            concurrency = self.settings.concurrency,
            "started amqp consumer"
        );
        Ok(())
    }

    async fn prepare(&self, queue: &str) -> Result<(), AmqpError> {
        self.channel
            .qos(
                self.settings.prefetch_count,
                self.settings.prefetch_size,
                self.settings.global,
            )
            .await?;

        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        Ok(())
    }

    /// Signals every worker to stop and waits for them, at most
    /// `stop_timeout`. Workers still busy after that are aborted.
    pub async fn stop(&self) -> Result<(), AmqpError> {
        let mut workers = self.workers.lock().await;

        if !self.transition(ConsumerState::Running, ConsumerState::Stopping) {
            debug!("consumer not running");
            return Ok(());
        }

        info!("stopping amqp consumer");
        if let Some(cancel) = workers.cancel.take() {
            cancel.cancel();
        }

        let tasks = &mut workers.tasks;
        let drained = tokio::time::timeout(self.settings.stop_timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        match drained {
            Ok(()) => info!("all consumer workers stopped"),
            Err(_) => {
                warn!(
                    remaining = workers.tasks.len(),
                    "consumer stop timeout reached, aborting workers"
                );
                workers.tasks.abort_all();
                workers.tasks.detach_all();
            }
        }

        self.metrics.set_active_consumers(0);
        self.state.store(ConsumerState::Idle as u8, Ordering::SeqCst);
        Ok(())
    }
}

struct Worker {
    id: usize,
    queue: String,
    tag: String,
    channel: BrokerChannel,
    metrics: Arc<Metrics>,
    handler: Arc<dyn MessageHandler>,
    cancel: CancellationToken,
}

impl Worker {
    /// Consumes until cancelled. When the delivery stream ends because the
    /// connection dropped, the worker waits for the channel to be rebuilt and
    /// registers again.
    async fn run(self) {
        let mut generations = self.channel.subscribe_generation();

        loop {
            if let Some(deliveries) = self.register().await {
                self.metrics.inc_active_consumers();
                let cancelled = self.drain(deliveries).await;
                self.metrics.dec_active_consumers();

                if cancelled {
                    break;
                }
            }

            if self.channel.is_closed() {
                debug!(worker_id = self.id, "channel closed, consumer worker exiting");
                break;
            }

            warn!(worker_id = self.id, "waiting for channel recovery");
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                changed = generations.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        debug!(worker_id = self.id, "consumer worker stopped");
    }

    async fn register(&self) -> Option<DeliveryStream> {
        let options = BasicConsumeOptions {
            no_local: false,
            no_ack: false,
            exclusive: false,
            nowait: false,
        };

        match self
            .channel
            .consume(&self.queue, &self.tag, options, FieldTable::default())
            .await
        {
            Ok(deliveries) => {
                debug!(
                    worker_id = self.id,
                    consumer_tag = self.tag.as_str(),
                    "consumer registered"
                );
                Some(deliveries)
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    worker_id = self.id,
                    "failure to register consumer"
                );
                None
            }
        }
    }

    /// Handles deliveries until the stream ends or the worker is cancelled.
    /// Returns `true` on cancellation.
    async fn drain(&self, mut deliveries: DeliveryStream) -> bool {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!(worker_id = self.id, "consumer worker stopping");
                    return true;
                }
                next = deliveries.next() => match next {
                    None => {
                        warn!(worker_id = self.id, "delivery stream closed");
                        return false;
                    }
                    Some(Err(err)) => error!(
                        error = err.to_string(),
                        worker_id = self.id,
                        "failure to receive delivery"
                    ),
                    Some(Ok(delivery)) => self.process_message(delivery).await,
                }
            }
        }
    }

    async fn process_message(&self, delivery: Delivery) {
        let request_id = Uuid::new_v4().to_string();
        let span = info_span!(
            "message",
            request_id = request_id.as_str(),
            worker_id = self.id,
            delivery_tag = delivery.delivery_tag,
        );

        async {
            self.metrics.inc_messages_received();
            debug!(size = delivery.data.len(), "processing message");

            let ctx = MessageContext {
                request_id,
                worker_id: self.id,
                trace: otel::consumer_context(&delivery.properties, &self.queue),
            };

            let started = Instant::now();
            let result = match AssertUnwindSafe(self.handler.handle(&ctx, &delivery))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(panic) => Err(AmqpError::HandlerPanicked(panic_message(panic.as_ref()))),
            };
            let elapsed = started.elapsed();
            self.metrics.observe_processing_duration(elapsed);

            match result {
                Ok(()) => {
                    self.metrics.inc_messages_processed();
                    ctx.trace.span().set_status(Status::Ok);

                    match delivery.ack().await {
                        Err(err) => {
                            error!(error = err.to_string(), "failure to ack message");
                            ctx.trace.span().record_error(&err);
                        }
                        _ => info!(
                            duration_ms = elapsed.as_millis() as u64,
                            "message processed successfully"
                        ),
                    }
                }
                Err(err) => {
                    self.metrics.inc_messages_failed();
                    ctx.trace.span().record_error(&err);
                    ctx.trace.span().set_status(Status::Error {
                        description: Cow::from(err.to_string()),
                    });
                    error!(
                        error = err.to_string(),
                        duration_ms = elapsed.as_millis() as u64,
                        "failure to process message, requeuing"
                    );

                    if let Err(err) = delivery.nack(true).await {
                        error!(error = err.to_string(), "failure to nack message");
                    }
                }
            }

            ctx.trace.span().end();
        }
        .instrument(span)
        .await
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}
