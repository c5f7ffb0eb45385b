// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! A `BrokerChannel` is a logical channel that survives physical reconnects.
//! It remembers its QoS so the owning connection can replay it on the fresh
//! physical channel, and it guards the physical handle with a read/write lock
//! so a reconnect never swaps the handle out from under an in-flight call.

use crate::{
    connection::ConnectionShared,
    errors::AmqpError,
    transport::{DeliveryStream, QosSettings, QueueInfo, RawChannel},
};
use lapin::{
    options::{BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions},
    types::FieldTable,
    BasicProperties,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Weak,
};
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, warn};

struct ChannelInner {
    physical: Arc<dyn RawChannel>,
    qos: Option<QosSettings>,
}

pub(crate) struct ChannelShared {
    id: u64,
    connection: Weak<ConnectionShared>,
    inner: RwLock<ChannelInner>,
    closed: AtomicBool,
    /// Bumped each time a reconnect installs a new physical channel.
    generation: watch::Sender<u64>,
}

impl ChannelShared {
    pub(crate) fn new(
        id: u64,
        connection: Weak<ConnectionShared>,
        physical: Arc<dyn RawChannel>,
    ) -> Arc<ChannelShared> {
        Arc::new(ChannelShared {
            id,
            connection,
            inner: RwLock::new(ChannelInner {
                physical,
                qos: None,
            }),
            closed: AtomicBool::new(false),
            generation: watch::channel(0).0,
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Swaps in a physical channel opened after a reconnect and replays QoS.
    ///
    /// A failed QoS replay is logged; the swap itself always happens.
    pub(crate) async fn replace(&self, physical: Arc<dyn RawChannel>) {
        let mut inner = self.inner.write().await;
        inner.physical = physical;

        if let Some(qos) = inner.qos {
            match inner.physical.basic_qos(qos).await {
                Err(err) => error!(
                    error = err.to_string(),
                    channel_id = self.id,
                    "failure to restore qos settings"
                ),
                _ => debug!(channel_id = self.id, "qos settings restored"),
            }
        }

        self.generation.send_modify(|generation| *generation += 1);
    }

    /// Closes the physical channel without touching the owner's channel set.
    pub(crate) async fn shutdown(&self) -> Result<(), AmqpError> {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AmqpError::AlreadyClosed);
        }

        let inner = self.inner.write().await;
        inner.physical.close().await
    }
}

/// Logical channel handle. Clones share the same underlying channel.
#[derive(Clone)]
pub struct BrokerChannel {
    shared: Arc<ChannelShared>,
}

impl BrokerChannel {
    pub(crate) fn from_shared(shared: Arc<ChannelShared>) -> BrokerChannel {
        BrokerChannel { shared }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), AmqpError> {
        if self.is_closed() {
            return Err(AmqpError::ChannelClosed);
        }
        Ok(())
    }

    /// Applies flow control and records it for replay after a reconnect.
    ///
    /// On failure the previously recorded settings are left untouched.
    ///
    /// # Parameters
    /// * `prefetch_count` - Maximum number of unacknowledged deliveries
    /// * `prefetch_size` - Maximum unacknowledged bytes, 0 for no limit
    /// * `global` - Apply to the whole channel rather than per consumer
    pub async fn qos(
        &self,
        prefetch_count: u16,
        prefetch_size: u32,
        global: bool,
    ) -> Result<(), AmqpError> {
        self.ensure_open()?;

        let qos = QosSettings::new(prefetch_count, prefetch_size, global);
        let mut inner = self.shared.inner.write().await;
        inner.physical.basic_qos(qos).await?;
        inner.qos = Some(qos);

        debug!(
            channel_id = self.shared.id,
            prefetch_count, prefetch_size, global, "qos applied"
        );
        Ok(())
    }

    /// Watches the physical channel generation, which changes every time a
    /// reconnect swaps in a fresh physical channel.
    ///
    /// # Returns
    /// A receiver whose current value is already marked as seen
    pub fn subscribe_generation(&self) -> watch::Receiver<u64> {
        self.shared.generation.subscribe()
    }

    /// QoS settings that will be replayed on the next reconnect.
    pub async fn recorded_qos(&self) -> Option<QosSettings> {
        self.shared.inner.read().await.qos
    }

    /// Declares `name` on the broker. Redeclaring with the same options is
    /// harmless.
    ///
    /// # Parameters
    /// * `name` - Queue name
    /// * `options` - Declaration flags (durable, exclusive, auto-delete...)
    /// * `args` - Extra queue arguments
    ///
    /// # Returns
    /// Message and consumer counts reported by the broker
    pub async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        args: FieldTable,
    ) -> Result<QueueInfo, AmqpError> {
        self.ensure_open()?;

        let inner = self.shared.inner.read().await;
        inner.physical.queue_declare(name, options, args).await
    }

    /// Publishes raw bytes and waits for the broker confirm.
    ///
    /// # Parameters
    /// * `exchange` - Target exchange, empty for the default exchange
    /// * `routing_key` - Routing key, the queue name on the default exchange
    /// * `options` - Mandatory/immediate flags
    /// * `payload` - Message body
    /// * `properties` - AMQP message properties
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        self.ensure_open()?;

        let inner = self.shared.inner.read().await;
        inner
            .physical
            .basic_publish(exchange, routing_key, options, payload, properties)
            .await
    }

    /// Registers a consumer and returns its delivery stream.
    ///
    /// The stream is bound to the physical channel that was live at the time
    /// of the call and ends when that channel goes away.
    ///
    /// # Parameters
    /// * `queue` - Queue to consume from
    /// * `consumer_tag` - Broker-side consumer identifier
    /// * `options` - Consume flags; keep `no_ack` off for manual acknowledgment
    /// * `args` - Extra consumer arguments
    pub async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        args: FieldTable,
    ) -> Result<DeliveryStream, AmqpError> {
        self.ensure_open()?;

        let inner = self.shared.inner.read().await;
        inner
            .physical
            .basic_consume(queue, consumer_tag, options, args)
            .await
    }

    /// Closes the channel and removes it from its connection.
    ///
    /// A second call returns `AmqpError::AlreadyClosed`.
    pub async fn close(&self) -> Result<(), AmqpError> {
        if self
            .shared
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AmqpError::AlreadyClosed);
        }

        match self.shared.connection.upgrade() {
            Some(connection) => connection.unregister(self.shared.id).await,
            None => warn!(channel_id = self.shared.id, "owning connection already dropped"),
        }

        let inner = self.shared.inner.write().await;
        inner.physical.close().await
    }
}
