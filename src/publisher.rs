// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! Publishes JSON payloads to a queue. Each call is tuned through functional
//! options applied to a pooled `PublisherOptions` record, which is reset to
//! defaults before use so no setting leaks from one call into the next.
//!
//! The caller's OpenTelemetry context is injected into the message headers
//! for distributed tracing.

use crate::{channel::BrokerChannel, errors::AmqpError, otel};
use crossbeam_queue::ArrayQueue;
use lapin::{
    options::{BasicPublishOptions, QueueDeclareOptions},
    types::{FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use serde::Serialize;
use std::{
    collections::BTreeMap,
    ops::{Deref, DerefMut},
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::{debug, error};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

const PERSISTENT_DELIVERY_MODE: u8 = 2;
const POOL_CAPACITY: usize = 64;

/// Per-call publish settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherOptions {
    pub exchange: String,
    pub routing_key: String,
    pub mandatory: bool,
    pub immediate: bool,
    pub content_type: String,
    pub priority: u8,
    pub persistent: bool,
}

impl Default for PublisherOptions {
    fn default() -> Self {
        let mut options = PublisherOptions::vacant();
        options.reset();
        options
    }
}

impl PublisherOptions {
    const fn vacant() -> PublisherOptions {
        PublisherOptions {
            exchange: String::new(),
            routing_key: String::new(),
            mandatory: false,
            immediate: false,
            content_type: String::new(),
            priority: 0,
            persistent: false,
        }
    }

    /// Restores defaults while keeping the string buffers allocated.
    fn reset(&mut self) {
        self.exchange.clear();
        self.routing_key.clear();
        self.mandatory = false;
        self.immediate = false;
        self.content_type.clear();
        self.content_type.push_str(JSON_CONTENT_TYPE);
        self.priority = 0;
        self.persistent = true;
    }
}

/// A single publish setting.
pub type PublishOption = Box<dyn Fn(&mut PublisherOptions) + Send + Sync>;

/// Publishes through `exchange` instead of the default exchange.
pub fn with_exchange(exchange: &str) -> PublishOption {
    let exchange = exchange.to_owned();
    Box::new(move |options| {
        options.exchange.clear();
        options.exchange.push_str(&exchange);
    })
}

/// Overrides the routing key, which otherwise is the queue name.
pub fn with_routing_key(routing_key: &str) -> PublishOption {
    let routing_key = routing_key.to_owned();
    Box::new(move |options| {
        options.routing_key.clear();
        options.routing_key.push_str(&routing_key);
    })
}

/// Asks the broker to return the message when no queue is bound.
pub fn with_mandatory(mandatory: bool) -> PublishOption {
    Box::new(move |options| options.mandatory = mandatory)
}

pub fn with_immediate(immediate: bool) -> PublishOption {
    Box::new(move |options| options.immediate = immediate)
}

/// Message priority, 0 (default) to 9.
pub fn with_priority(priority: u8) -> PublishOption {
    Box::new(move |options| options.priority = priority)
}

pub fn with_content_type(content_type: &str) -> PublishOption {
    let content_type = content_type.to_owned();
    Box::new(move |options| {
        options.content_type.clear();
        options.content_type.push_str(&content_type);
    })
}

/// Toggles persistent delivery mode, which is on by default.
pub fn with_persistent(persistent: bool) -> PublishOption {
    Box::new(move |options| options.persistent = persistent)
}

struct OptionsPool {
    slots: ArrayQueue<PublisherOptions>,
}

impl OptionsPool {
    fn new(capacity: usize) -> OptionsPool {
        OptionsPool {
            slots: ArrayQueue::new(capacity),
        }
    }

    fn get(&self) -> PooledOptions<'_> {
        let mut options = self.slots.pop().unwrap_or_else(PublisherOptions::vacant);
        options.reset();

        PooledOptions {
            pool: self,
            options,
        }
    }

    fn idle(&self) -> usize {
        self.slots.len()
    }
}

/// Options borrowed from the pool, handed back on drop.
struct PooledOptions<'p> {
    pool: &'p OptionsPool,
    options: PublisherOptions,
}

impl Deref for PooledOptions<'_> {
    type Target = PublisherOptions;

    fn deref(&self) -> &PublisherOptions {
        &self.options
    }
}

impl DerefMut for PooledOptions<'_> {
    fn deref_mut(&mut self) -> &mut PublisherOptions {
        &mut self.options
    }
}

impl Drop for PooledOptions<'_> {
    fn drop(&mut self) {
        let options = std::mem::replace(&mut self.options, PublisherOptions::vacant());
        // a full pool simply drops the record
        let _ = self.pool.slots.push(options);
    }
}

/// Publishes serialized messages on a dedicated channel.
pub struct Publisher {
    channel: BrokerChannel,
    pool: OptionsPool,
}

impl Publisher {
    /// Creates a new publisher.
    ///
    /// # Parameters
    /// * `channel` - A channel dedicated to publishing
    ///
    /// # Returns
    /// An Arc-wrapped Publisher for thread-safe sharing
    pub fn new(channel: BrokerChannel) -> Arc<Publisher> {
        Arc::new(Publisher {
            channel,
            pool: OptionsPool::new(POOL_CAPACITY),
        })
    }

    /// Serializes `message` to JSON and publishes it to `queue`.
    ///
    /// The queue is declared durable first. Messages are persistent and typed
    /// `application/json` unless an option says otherwise, and each carries a
    /// fresh message id and the publish time.
    ///
    /// # Parameters
    /// * `ctx` - OpenTelemetry context injected into the message headers
    /// * `queue` - Destination queue, also the default routing key
    /// * `message` - Value serialized as the JSON body
    /// * `options` - Per-call overrides, see the `with_*` constructors
    ///
    /// # Returns
    /// Ok(()) once the broker confirmed the message, or AmqpError on failure
    pub async fn publish<T>(
        &self,
        ctx: &Context,
        queue: &str,
        message: &T,
        options: &[PublishOption],
    ) -> Result<(), AmqpError>
    where
        T: Serialize + Sync,
    {
        let mut settings = self.pool.get();
        for option in options {
            option(&mut *settings);
        }

        let payload = match serde_json::to_vec(message) {
            Ok(payload) => payload,
            Err(err) => {
                error!(error = err.to_string(), queue, "failure to serialize payload");
                return Err(AmqpError::SerializePayloadError(err.to_string()));
            }
        };

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

        let mut headers = BTreeMap::new();
        otel::inject(ctx, &mut headers);

        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(settings.content_type.as_str()))
            .with_priority(settings.priority)
            .with_timestamp(unix_timestamp())
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(FieldTable::from(headers));
        if settings.persistent {
            properties = properties.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
        }

        let routing_key = if settings.routing_key.is_empty() {
            queue
        } else {
            settings.routing_key.as_str()
        };

        self.channel
            .publish(
                &settings.exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: settings.mandatory,
                    immediate: settings.immediate,
                },
                &payload,
                properties,
            )
            .await?;

        debug!(
            queue,
            exchange = settings.exchange.as_str(),
            routing_key,
            size = payload.len(),
            "message published"
        );
        Ok(())
    }

    #[cfg(test)]
    fn idle_options(&self) -> usize {
        self.pool.idle()
    }
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}
