// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;
#[cfg(test)]
mod testing;

pub mod channel;
pub mod connection;
pub mod consumer;
pub mod driver;
pub mod errors;
pub mod logging;
pub mod metrics;
pub mod processor;
pub mod publisher;
pub mod server;
pub mod settings;
pub mod transport;
