// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # lapin Driver
//!
//! Implements the broker client seam (`crate::transport`) on top of lapin.
//! Connection loss is reported by lapin through `Connection::on_error`; the
//! driver folds that callback into a watch channel so the resilient
//! connection can await it.

use crate::{
    errors::AmqpError,
    transport::{
        Acknowledger, Delivery, DeliveryStream, QosSettings, QueueInfo, RawChannel,
        RawConnection, Transport,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, QueueDeclareOptions,
    },
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error};

const REPLY_SUCCESS: u16 = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
enum LinkState {
    Open,
    Lost(String),
    Closed,
}

/// Dials lapin connections named after the application.
pub struct LapinTransport {
    connection_name: String,
}

impl LapinTransport {
    pub fn new(connection_name: &str) -> Arc<LapinTransport> {
        Arc::new(LapinTransport {
            connection_name: connection_name.to_owned(),
        })
    }
}

#[async_trait]
impl Transport for LapinTransport {
    async fn dial(&self, url: &str) -> Result<Arc<dyn RawConnection>, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        let conn = match Connection::connect(url, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        let (link, _) = watch::channel(LinkState::Open);
        let link = Arc::new(link);

        let notifier = link.clone();
        conn.on_error(move |err| {
            notifier.send_replace(LinkState::Lost(err.to_string()));
        });

        Ok(Arc::new(LapinConnection { conn, link }))
    }
}

struct LapinConnection {
    conn: Connection,
    link: Arc<watch::Sender<LinkState>>,
}

#[async_trait]
impl RawConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn RawChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(c) => {
                debug!("channel created");
                Ok(Arc::new(LapinChannel { channel: c }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    async fn closed(&self) -> Option<AmqpError> {
        link_loss(self.link.subscribe()).await
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.link.send_replace(LinkState::Closed);

        match self.conn.close(REPLY_SUCCESS, "OK").await {
            Err(err) => {
                error!(error = err.to_string(), "failure to close connection");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
            _ => Ok(()),
        }
    }
}

/// Waits until the link leaves `Open`. Only a lost link yields an error.
async fn link_loss(mut rx: watch::Receiver<LinkState>) -> Option<AmqpError> {
    let lost = match rx.wait_for(|state| *state != LinkState::Open).await {
        Ok(state) => match &*state {
            LinkState::Lost(reason) => Some(AmqpError::ConnectionLost(reason.clone())),
            _ => None,
        },
        Err(_) => None,
    };
    lost
}

struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl RawChannel for LapinChannel {
    async fn basic_qos(&self, qos: QosSettings) -> Result<(), AmqpError> {
        // AMQP 0-9-1 brokers reject byte-based prefetch and lapin does not expose it.
        if qos.prefetch_size != 0 {
            return Err(AmqpError::QoSDeclarationError(format!(
                "prefetch size {} is not supported",
                qos.prefetch_size
            )));
        }

        match self
            .channel
            .basic_qos(
                qos.prefetch_count,
                BasicQosOptions {
                    global: qos.global,
                },
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "failure to configure qos");
                Err(AmqpError::QoSDeclarationError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        args: FieldTable,
    ) -> Result<QueueInfo, AmqpError> {
        match self.channel.queue_declare(name, options, args).await {
            Err(err) => {
                error!(error = err.to_string(), name = name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(name.to_owned()))
            }
            Ok(queue) => Ok(QueueInfo {
                name: queue.name().to_string(),
                messages: queue.message_count(),
                consumers: queue.consumer_count(),
            }),
        }
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let confirm = match self
            .channel
            .basic_publish(exchange, routing_key, options, payload, properties)
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError(err.to_string()))
            }
            Ok(confirm) => Ok(confirm),
        }?;

        match confirm.await {
            Err(err) => {
                error!(error = err.to_string(), "error awaiting publisher confirm");
                Err(AmqpError::PublishingError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        args: FieldTable,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(queue, consumer_tag, options, args)
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::BindingConsumerError(consumer_tag.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        let deliveries = consumer.map(|result| match result {
            Ok(delivery) => Ok(Delivery::new(
                delivery.delivery_tag,
                delivery.exchange.as_str(),
                delivery.routing_key.as_str(),
                delivery.redelivered,
                delivery.properties,
                delivery.data,
                Arc::new(LapinAcker {
                    acker: delivery.acker,
                }),
            )),
            Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
        });

        Ok(deliveries.boxed())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        match self.channel.close(REPLY_SUCCESS, "OK").await {
            Err(err) => {
                error!(error = err.to_string(), "failure to close channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
            _ => Ok(()),
        }
    }
}

struct LapinAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self, _delivery_tag: u64) -> Result<(), AmqpError> {
        match self.acker.ack(BasicAckOptions { multiple: false }).await {
            Err(err) => {
                error!(error = err.to_string(), "error whiling ack msg");
                Err(AmqpError::AckMessageError)
            }
            _ => Ok(()),
        }
    }

    async fn nack(&self, _delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        match self
            .acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error whiling nack msg");
                Err(AmqpError::NackMessageError)
            }
            _ => Ok(()),
        }
    }
}
