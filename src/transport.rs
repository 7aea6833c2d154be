// Copyright (c) 2025, The Hutch Authors
// MIT License
// All rights reserved.

//! # Broker Transport Collaborator
//!
//! This module defines the transport capability the pattern layer consumes:
//! a connection that yields channels, and a channel that owns declarations,
//! publishing and consuming for one role instance. The core never touches
//! frames or sockets; everything broker-specific lives behind the
//! `AmqpConnection`/`AmqpChannel` traits, with a lapin-backed implementation
//! provided here.

use crate::{
    config::Config,
    errors::MessagingError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
        QueueDeleteOptions,
    },
    publisher_confirm::Confirmation,
    types::{FieldTable, LongString, ShortString},
    BasicProperties, ConnectionProperties,
};
use std::{pin::Pin, sync::Arc};
use tracing::{debug, error};
use uuid::Uuid;

/// Content type stamped on published message bodies
pub const OCTET_STREAM_CONTENT_TYPE: &str = "application/octet-stream";

/// Broker message properties carried alongside a published body.
///
/// `reply_to` and `correlation_id` implement the RPC wire contract; `kind`
/// distinguishes ordinary replies from server-side handler failures.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub kind: Option<String>,
}

/// Opaque handle identifying one delivered message for acknowledgment.
///
/// A receipt is not cloneable and acknowledgment consumes it by value, so
/// acknowledging the same delivery twice is unrepresentable.
#[derive(Debug, PartialEq, Eq)]
pub struct Receipt {
    pub(crate) delivery_tag: u64,
}

impl Receipt {
    pub(crate) fn new(delivery_tag: u64) -> Receipt {
        Receipt { delivery_tag }
    }
}

/// One message delivered by the broker on a consuming channel.
#[derive(Debug)]
pub struct Delivery {
    pub routing_key: String,
    pub body: Vec<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub kind: Option<String>,
    pub redelivered: bool,
    pub receipt: Receipt,
}

/// Stream of deliveries for one consumer, in broker arrival order.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, MessagingError>> + Send>>;

/// A session over a broker connection, exclusively owned by one role.
///
/// These are the broker operations the pattern layer consumes; the lapin
/// implementation below is the production binding, and tests mock it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    /// Declares an exchange. Idempotent on the broker when redeclared
    /// identically; broker rejections surface as configuration errors.
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), MessagingError>;

    /// Declares a queue and returns its resolved name (broker-assigned when
    /// the definition's name is empty).
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, MessagingError>;

    /// Deletes a queue unconditionally.
    async fn delete_queue(&self, name: &str) -> Result<(), MessagingError>;

    /// Registers a (queue, exchange, routing key) binding.
    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), MessagingError>;

    /// Publishes a body to an exchange with the given routing key.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), MessagingError>;

    /// Starts consuming from a queue, yielding deliveries in arrival order.
    /// With `no_ack` the broker considers every delivery settled on send.
    async fn consume(&self, queue: &str, no_ack: bool) -> Result<DeliveryStream, MessagingError>;

    /// Acknowledges one delivery, consuming its receipt.
    async fn ack(&self, receipt: Receipt) -> Result<(), MessagingError>;

    /// Caps the number of unacknowledged deliveries this channel may hold.
    async fn set_prefetch(&self, count: u16) -> Result<(), MessagingError>;

    /// Requests broker-side publish confirms on this channel.
    async fn confirm_delivery(&self) -> Result<(), MessagingError>;
}

/// A connection to a broker; yields channels.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    /// Creates a new channel on this connection.
    async fn channel(&self) -> Result<Arc<dyn AmqpChannel>, MessagingError>;

    /// Closes the connection; exclusive queues declared on it are deleted
    /// and unacknowledged deliveries are requeued by the broker.
    async fn close(&self) -> Result<(), MessagingError>;
}

/// Opens a lapin-backed connection to the broker named by the configuration.
pub async fn connect(cfg: &Config) -> Result<Arc<dyn AmqpConnection>, MessagingError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.app_name.clone()));

    let conn = match lapin::Connection::connect(&cfg.amqp_uri(), options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(MessagingError::Transport(err.to_string()))
        }
    }?;
    debug!("amqp connected");

    Ok(Arc::new(LapinConnection { inner: conn }))
}

/// Lapin-backed implementation of `AmqpConnection`.
pub struct LapinConnection {
    inner: lapin::Connection,
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    async fn channel(&self) -> Result<Arc<dyn AmqpChannel>, MessagingError> {
        debug!("creating amqp channel...");
        match self.inner.create_channel().await {
            Ok(c) => {
                debug!("channel created");
                Ok(Arc::new(LapinChannel { inner: c }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(MessagingError::Transport(err.to_string()))
            }
        }
    }

    async fn close(&self) -> Result<(), MessagingError> {
        debug!("closing amqp connection");
        self.inner
            .close(0, "client shutdown")
            .await
            .map_err(|err| MessagingError::Transport(err.to_string()))
    }
}

/// Lapin-backed implementation of `AmqpChannel`.
pub struct LapinChannel {
    inner: lapin::Channel,
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), MessagingError> {
        debug!(name = def.name, kind = def.kind.as_str(), "declaring exchange");

        match self
            .inner
            .exchange_declare(
                &def.name,
                (&def.kind).into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.auto_delete,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name,
                    "error to declare the exchange"
                );
                Err(MessagingError::Configuration(format!(
                    "failure to declare exchange `{}`: {err}",
                    def.name
                )))
            }
            _ => Ok(()),
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, MessagingError> {
        debug!(name = def.name, "declaring queue");

        match self
            .inner
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.auto_delete,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Ok(queue) => Ok(queue.name().as_str().to_owned()),
            Err(err) => {
                error!(error = err.to_string(), name = def.name, "error to declare the queue");
                Err(MessagingError::Configuration(format!(
                    "failure to declare queue `{}`: {err}",
                    def.name
                )))
            }
        }
    }

    async fn delete_queue(&self, name: &str) -> Result<(), MessagingError> {
        debug!(name, "deleting queue");

        match self
            .inner
            .queue_delete(name, QueueDeleteOptions::default())
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name, "error to delete the queue");
                Err(MessagingError::Configuration(format!(
                    "failure to delete queue `{name}`: {err}"
                )))
            }
            _ => Ok(()),
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), MessagingError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        match self
            .inner
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(MessagingError::Configuration(format!(
                    "failure to bind queue `{}` to exchange `{}`: {err}",
                    binding.queue_name, binding.exchange_name
                )))
            }
            _ => Ok(()),
        }
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), MessagingError> {
        let mut props = BasicProperties::default()
            .with_content_type(ShortString::from(OCTET_STREAM_CONTENT_TYPE))
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_delivery_mode(2);

        if let Some(correlation_id) = &properties.correlation_id {
            props = props.with_correlation_id(ShortString::from(correlation_id.as_str()));
        }
        if let Some(reply_to) = &properties.reply_to {
            props = props.with_reply_to(ShortString::from(reply_to.as_str()));
        }
        if let Some(kind) = &properties.kind {
            props = props.with_type(ShortString::from(kind.as_str()));
        }

        let confirm = match self
            .inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                body,
                props,
            )
            .await
        {
            Ok(confirm) => confirm.await.map_err(|err| {
                error!(error = err.to_string(), "error awaiting publish confirm");
                MessagingError::Transport(err.to_string())
            }),
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(MessagingError::Transport(err.to_string()))
            }
        }?;

        if matches!(confirm, Confirmation::Nack(_)) {
            error!(exchange, routing_key, "broker nacked publish");
            return Err(MessagingError::Transport("broker nacked publish".to_owned()));
        }

        Ok(())
    }

    async fn consume(&self, queue: &str, no_ack: bool) -> Result<DeliveryStream, MessagingError> {
        let tag = format!("{queue}-{}", Uuid::new_v4());

        let consumer = match self
            .inner
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(MessagingError::Transport(err.to_string()))
            }
            Ok(c) => Ok(c),
        }?;

        let stream = consumer.map(|item| match item {
            Ok(delivery) => Ok(Delivery {
                routing_key: delivery.routing_key.to_string(),
                correlation_id: delivery
                    .properties
                    .correlation_id()
                    .as_ref()
                    .map(|v| v.to_string()),
                reply_to: delivery.properties.reply_to().as_ref().map(|v| v.to_string()),
                kind: delivery.properties.kind().as_ref().map(|v| v.to_string()),
                redelivered: delivery.redelivered,
                receipt: Receipt::new(delivery.delivery_tag),
                body: delivery.data,
            }),
            Err(err) => Err(MessagingError::Transport(err.to_string())),
        });

        Ok(Box::pin(stream))
    }

    async fn ack(&self, receipt: Receipt) -> Result<(), MessagingError> {
        debug!(delivery_tag = receipt.delivery_tag, "acknowledging message");

        self.inner
            .basic_ack(receipt.delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                MessagingError::Transport(err.to_string())
            })
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), MessagingError> {
        self.inner
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to configure qos");
                MessagingError::Configuration(format!("failure to configure qos: {err}"))
            })
    }

    async fn confirm_delivery(&self) -> Result<(), MessagingError> {
        self.inner
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to enable publish confirms");
                MessagingError::Transport(err.to_string())
            })
    }
}
