// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Relay Metrics
//!
//! A metrics sink constructed once at process start and handed to every
//! component that reports to it. Each `Metrics` owns its own prometheus
//! registry; nothing is registered globally.

use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder,
};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use sysinfo::{Pid, System};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Interval between two process samples.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

const PROCESSING_BUCKETS: [f64; 11] = [
    0.001, 0.002, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
];

/// Counters and gauges reported by the relay.
pub struct Metrics {
    pub messages_received: IntCounter,
    pub messages_processed: IntCounter,
    pub messages_failed: IntCounter,
    pub reconnections: IntCounter,
    pub processing_duration: Histogram,
    pub active_consumers: IntGauge,
    pub amqp_connections: IntGauge,
    pub memory_usage: Gauge,
    pub cpu_usage: Gauge,
    pub alive_tasks: IntGauge,
    system: Mutex<System>,
    registry: Registry,
}

impl Metrics {
    /// Creates every collector and registers it on a fresh registry.
    ///
    /// # Returns
    /// The metrics sink, or a prometheus error on a duplicate registration
    pub fn new() -> prometheus::Result<Metrics> {
        let registry = Registry::new();

        let messages_received = IntCounter::with_opts(Opts::new(
            "messages_received_total",
            "Total number of messages received from the input queue",
        ))?;
        let messages_processed = IntCounter::with_opts(Opts::new(
            "messages_processed_total",
            "Total number of messages successfully processed",
        ))?;
        let messages_failed = IntCounter::with_opts(Opts::new(
            "messages_failed_total",
            "Total number of messages that failed processing",
        ))?;
        let reconnections = IntCounter::with_opts(Opts::new(
            "reconnections_total",
            "Total number of successful broker reconnections",
        ))?;
        let processing_duration = Histogram::with_opts(
            HistogramOpts::new(
                "message_processing_seconds",
                "Time taken by the handler to process a message",
            )
            .buckets(PROCESSING_BUCKETS.to_vec()),
        )?;
        let active_consumers = IntGauge::with_opts(Opts::new(
            "active_consumers",
            "Number of active consumer workers",
        ))?;
        let amqp_connections = IntGauge::with_opts(Opts::new(
            "amqp_connections_active",
            "Number of live broker connections",
        ))?;
        let memory_usage = Gauge::with_opts(Opts::new(
            "process_memory_bytes",
            "Resident memory of the process",
        ))?;
        let cpu_usage = Gauge::with_opts(Opts::new(
            "process_cpu_usage_percent",
            "CPU usage of the process",
        ))?;
        let alive_tasks = IntGauge::with_opts(Opts::new(
            "runtime_alive_tasks",
            "Number of tasks alive in the async runtime",
        ))?;

        registry.register(Box::new(messages_received.clone()))?;
        registry.register(Box::new(messages_processed.clone()))?;
        registry.register(Box::new(messages_failed.clone()))?;
        registry.register(Box::new(reconnections.clone()))?;
        registry.register(Box::new(processing_duration.clone()))?;
        registry.register(Box::new(active_consumers.clone()))?;
        registry.register(Box::new(amqp_connections.clone()))?;
        registry.register(Box::new(memory_usage.clone()))?;
        registry.register(Box::new(cpu_usage.clone()))?;
        registry.register(Box::new(alive_tasks.clone()))?;

        Ok(Metrics {
            messages_received,
            messages_processed,
            messages_failed,
            reconnections,
            processing_duration,
            active_consumers,
            amqp_connections,
            memory_usage,
            cpu_usage,
            alive_tasks,
            system: Mutex::new(System::new()),
            registry,
        })
    }

    /// Counts a delivery handed to a worker.
    pub fn inc_messages_received(&self) {
        self.messages_received.inc();
    }

    pub fn inc_messages_processed(&self) {
        self.messages_processed.inc();
    }

    pub fn inc_messages_failed(&self) {
        self.messages_failed.inc();
    }

    /// Counts a successful redial after a connection loss.
    pub fn inc_reconnections(&self) {
        self.reconnections.inc();
    }

    /// Records how long the handler took, in seconds.
    pub fn observe_processing_duration(&self, duration: Duration) {
        self.processing_duration.observe(duration.as_secs_f64());
    }

    pub fn set_active_consumers(&self, count: usize) {
        self.active_consumers.set(count as i64);
    }

    /// Counts one more worker holding a live broker subscription.
    pub fn inc_active_consumers(&self) {
        self.active_consumers.inc();
    }

    pub fn dec_active_consumers(&self) {
        self.active_consumers.dec();
    }

    pub fn set_amqp_connections(&self, count: i64) {
        self.amqp_connections.set(count);
    }

    /// Refreshes the process gauges (memory, cpu, alive tasks).
    pub fn update_system_metrics(&self) {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            self.alive_tasks
                .set(handle.metrics().num_alive_tasks() as i64);
        }

        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => pid,
            Err(err) => {
                warn!(error = err, "unable to resolve current pid");
                return;
            }
        };

        if let Ok(mut system) = self.system.lock() {
            self.sample_process(&mut system, pid);
        }
    }

    fn sample_process(&self, system: &mut System, pid: Pid) {
        if !system.refresh_process(pid) {
            return;
        }

        if let Some(process) = system.process(pid) {
            self.memory_usage.set(process.memory() as f64);
            self.cpu_usage.set(process.cpu_usage() as f64);

            debug!(
                cpu_percent = process.cpu_usage(),
                memory_bytes = process.memory(),
                "system metrics updated"
            );
        }
    }

    /// Renders every registered metric in the prometheus text format.
    pub fn encode(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;

        String::from_utf8(buffer).map_err(|err| prometheus::Error::Msg(err.to_string()))
    }
}

/// Samples the process gauges every `interval` until `cancel` fires.
pub fn spawn_sampler(
    metrics: Arc<Metrics>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("metrics sampler stopped");
                    break;
                }
                _ = ticker.tick() => metrics.update_system_metrics(),
            }
        }
    })
}
