// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Processor
//!
//! The relay's business step: parse an order from the input queue, stamp it
//! with a fresh UUID and publish it to the output queue.

use crate::{
    consumer::{MessageContext, MessageHandler},
    errors::AmqpError,
    publisher::Publisher,
    transport::Delivery,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

/// Order as read from the input queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputMessage {
    pub user_id: String,
    pub product_name: String,
    pub quantity: i64,
    pub price: f64,
}

/// Order as written to the output queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputMessage {
    pub id: String,
    pub user_id: String,
    pub product_name: String,
    pub quantity: i64,
    pub price: f64,
}

impl OutputMessage {
    /// Copies every input field and assigns a new random identifier.
    pub fn from_input(input: InputMessage) -> OutputMessage {
        OutputMessage {
            id: Uuid::new_v4().to_string(),
            user_id: input.user_id,
            product_name: input.product_name,
            quantity: input.quantity,
            price: input.price,
        }
    }
}

/// Handler relaying input-queue messages to the output queue.
pub struct QueueProcessor {
    publisher: Arc<Publisher>,
    input_queue: String,
    output_queue: String,
}

impl QueueProcessor {
    /// Creates a new processor.
    ///
    /// # Parameters
    /// * `publisher` - Publisher used for the output queue
    /// * `input_queue` - Queue the processor is attached to, used in logs
    /// * `output_queue` - Destination of every transformed message
    ///
    /// # Returns
    /// An Arc-wrapped processor ready to hand to `Consumer::start_consuming`
    pub fn new(
        publisher: Arc<Publisher>,
        input_queue: &str,
        output_queue: &str,
    ) -> Arc<QueueProcessor> {
        Arc::new(QueueProcessor {
            publisher,
            input_queue: input_queue.to_owned(),
            output_queue: output_queue.to_owned(),
        })
    }
}

#[async_trait]
impl MessageHandler for QueueProcessor {
    async fn handle(&self, ctx: &MessageContext, delivery: &Delivery) -> Result<(), AmqpError> {
        let input: InputMessage = match serde_json::from_slice(&delivery.data) {
            Ok(input) => input,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    request_id = ctx.request_id.as_str(),
                    "failure to parse input message"
                );
                return Err(AmqpError::ParsePayloadError(err.to_string()));
            }
        };

        let output = OutputMessage::from_input(input);

        self.publisher
            .publish(&ctx.trace, &self.output_queue, &output, &[])
            .await?;

        info!(
            request_id = ctx.request_id.as_str(),
            input_queue = self.input_queue.as_str(),
            output_queue = self.output_queue.as_str(),
            uuid_added = output.id.as_str(),
            user_id = output.user_id.as_str(),
            product_name = output.product_name.as_str(),
            "message forwarded with uuid"
        );
        Ok(())
    }
}
