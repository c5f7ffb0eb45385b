// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Client Seam
//!
//! The resilient connection, the worker pool and the publisher never talk to
//! the AMQP client directly. They talk to the traits in this module, which
//! the lapin driver (`crate::driver`) implements against a live RabbitMQ and
//! the test suite implements in memory.
//!
//! Option structs, field tables and message properties are lapin's own types;
//! only the pieces that lapin cannot construct outside a live session
//! (deliveries and their acknowledgment handles) are redefined here.

use crate::errors::AmqpError;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::{
    options::{BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions},
    types::FieldTable,
    BasicProperties,
};
use std::{fmt, sync::Arc};

/// Lazy, unbounded, non-restartable sequence of deliveries.
///
/// The stream ends when the channel it was registered on closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Consumer flow-control parameters, replayed verbatim after a reconnect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QosSettings {
    pub prefetch_count: u16,
    pub prefetch_size: u32,
    pub global: bool,
}

impl QosSettings {
    pub fn new(prefetch_count: u16, prefetch_size: u32, global: bool) -> Self {
        QosSettings {
            prefetch_count,
            prefetch_size,
            global,
        }
    }
}

/// Broker answer to a queue declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub messages: u32,
    pub consumers: u32,
}

/// Dials physical connections to the broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a new physical connection to `url`.
    async fn dial(&self, url: &str) -> Result<Arc<dyn RawConnection>, AmqpError>;
}

/// A single physical connection as exposed by the client library.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RawConnection: Send + Sync {
    /// Opens a physical channel on this connection.
    async fn create_channel(&self) -> Result<Arc<dyn RawChannel>, AmqpError>;

    /// Resolves once the physical link has ended.
    ///
    /// Yields `Some(error)` when the link was lost and `None` when it was
    /// closed gracefully by this process.
    async fn closed(&self) -> Option<AmqpError>;

    /// Closes the physical connection.
    async fn close(&self) -> Result<(), AmqpError>;
}

/// A single physical channel as exposed by the client library.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RawChannel: Send + Sync {
    async fn basic_qos(&self, qos: QosSettings) -> Result<(), AmqpError>;

    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        args: FieldTable,
    ) -> Result<QueueInfo, AmqpError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        args: FieldTable,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// Manual acknowledgment handle for deliveries.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;
}

/// An inbound message together with its acknowledgment handle.
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
    acker: Arc<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        exchange: &str,
        routing_key: &str,
        redelivered: bool,
        properties: BasicProperties,
        data: Vec<u8>,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Delivery {
            delivery_tag,
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            redelivered,
            properties,
            data,
            acker,
        }
    }

    /// Confirms the delivery, removing it from the queue.
    pub async fn ack(&self) -> Result<(), AmqpError> {
        self.acker.ack(self.delivery_tag).await
    }

    /// Rejects the delivery; `requeue` puts it back on the queue.
    pub async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker.nack(self.delivery_tag, requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("size", &self.data.len())
            .finish()
    }
}
