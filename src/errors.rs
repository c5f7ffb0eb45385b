// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Relay
//!
//! This module provides the error type shared by every layer of the relay:
//! the broker transport, the resilient connection and channel wrappers, the
//! publisher, the consumer worker pool and the queue processor.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Variants fall into four groups: connectivity faults, channel-operation
/// faults, per-message faults and lifecycle misuse. Payloads carry the
/// underlying client error rendered as a string so the enum stays comparable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error `{0}`")]
    InternalError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// The physical connection was lost
    #[error("connection lost `{0}`")]
    ConnectionLost(String),

    /// Operation attempted on a connection that was explicitly closed
    #[error("connection closed")]
    ConnectionClosed,

    /// `close` called on a connection or channel that is already closed
    #[error("already closed")]
    AlreadyClosed,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// Operation attempted on a channel that was explicitly closed
    #[error("channel closed")]
    ChannelClosed,

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// Error serializing an outgoing message payload
    #[error("failure to serialize payload `{0}`")]
    SerializePayloadError(String),

    /// Error parsing a message payload
    #[error("failure to parse payload `{0}`")]
    ParsePayloadError(String),

    /// The message handler panicked while processing a delivery
    #[error("handler panicked `{0}`")]
    HandlerPanicked(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}
