// Copyright (c) 2025, The Hutch Authors
// MIT License
// All rights reserved.

//! # Pattern Roles
//!
//! The pub/sub, topic-routing and work-queue role pairs. Each role is a thin
//! wrapper over the shared driver with its capability profile:
//!
//! | Role | exchange kind | binds on subscribe | prefetch |
//! |---|---|---|---|
//! | Publisher / Subscriber | fanout | no / yes | default |
//! | TopicPublisher / TopicSubscriber | topic | no / yes | default |
//! | QueueServer / QueueWorker | fanout | no | default / 1 |
//!
//! Work-queue roles route through the default exchange with the queue name as
//! routing key, so published work reaches the named queue without a binding.

use crate::{
    config::Config,
    errors::MessagingError,
    exchange::ExchangeKind,
    queue::QueueDefinition,
    role::{Canceller, MessageHandler, Role, RoleProfile, SubscribeOptions},
    transport::AmqpChannel,
};
use std::sync::Arc;

/// Fanout publisher: every message reaches every bound queue.
pub struct Publisher {
    role: Role,
}

impl Publisher {
    /// Capability profile for this role.
    pub fn profile() -> RoleProfile {
        RoleProfile::new().exchange_kind(ExchangeKind::Fanout)
    }

    /// Connects a publisher on its own connection and channel.
    pub async fn connect(config: Config) -> Result<Publisher, MessagingError> {
        Ok(Publisher {
            role: Role::connect(config, Publisher::profile()).await?,
        })
    }

    /// Builds a publisher on an externally supplied channel.
    pub async fn with_channel(
        channel: Arc<dyn AmqpChannel>,
        config: Config,
    ) -> Result<Publisher, MessagingError> {
        Ok(Publisher {
            role: Role::with_channel(channel, config, Publisher::profile()).await?,
        })
    }

    /// Publishes a payload under the given topic.
    pub async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), MessagingError> {
        self.role.publish(topic, payload).await
    }

    /// Closes the owned connection.
    pub async fn close(&self) -> Result<(), MessagingError> {
        self.role.close().await
    }
}

/// Fanout subscriber: receives everything published on the exchange,
/// regardless of routing key.
pub struct Subscriber {
    role: Role,
}

impl Subscriber {
    pub fn profile() -> RoleProfile {
        RoleProfile::new()
            .exchange_kind(ExchangeKind::Fanout)
            .binds_on_subscribe()
    }

    pub async fn connect(config: Config) -> Result<Subscriber, MessagingError> {
        Ok(Subscriber {
            role: Role::connect(config, Subscriber::profile()).await?,
        })
    }

    pub async fn with_channel(
        channel: Arc<dyn AmqpChannel>,
        config: Config,
    ) -> Result<Subscriber, MessagingError> {
        Ok(Subscriber {
            role: Role::with_channel(channel, config, Subscriber::profile()).await?,
        })
    }

    /// Declares and binds a queue, then starts consuming from it. Returns the
    /// resolved queue name. The routing key is ignored by fanout exchanges.
    pub async fn subscribe(&mut self, opts: SubscribeOptions) -> Result<String, MessagingError> {
        self.role.subscribe(opts).await
    }

    /// Registers the delivery handler.
    pub fn on_message(&mut self, handler: Arc<dyn MessageHandler>) {
        self.role.on_message(handler);
    }

    /// Consumes deliveries until cancelled or the session ends.
    pub async fn listen(&mut self) -> Result<(), MessagingError> {
        self.role.listen().await
    }

    pub fn canceller(&self) -> Canceller {
        self.role.canceller()
    }

    pub async fn close(&self) -> Result<(), MessagingError> {
        self.role.close().await
    }
}

/// Topic publisher: routing-key based delivery with wildcard matching on the
/// subscriber side.
pub struct TopicPublisher {
    role: Role,
}

impl TopicPublisher {
    pub fn profile() -> RoleProfile {
        RoleProfile::new().exchange_kind(ExchangeKind::Topic)
    }

    pub async fn connect(config: Config) -> Result<TopicPublisher, MessagingError> {
        Ok(TopicPublisher {
            role: Role::connect(config, TopicPublisher::profile()).await?,
        })
    }

    pub async fn with_channel(
        channel: Arc<dyn AmqpChannel>,
        config: Config,
    ) -> Result<TopicPublisher, MessagingError> {
        Ok(TopicPublisher {
            role: Role::with_channel(channel, config, TopicPublisher::profile()).await?,
        })
    }

    pub async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), MessagingError> {
        self.role.publish(topic, payload).await
    }

    pub async fn close(&self) -> Result<(), MessagingError> {
        self.role.close().await
    }
}

/// Topic subscriber: binds with a topic pattern (`something.*` matches
/// `something.test` but not `other.test`).
pub struct TopicSubscriber {
    role: Role,
}

impl TopicSubscriber {
    pub fn profile() -> RoleProfile {
        RoleProfile::new()
            .exchange_kind(ExchangeKind::Topic)
            .binds_on_subscribe()
    }

    pub async fn connect(config: Config) -> Result<TopicSubscriber, MessagingError> {
        Ok(TopicSubscriber {
            role: Role::connect(config, TopicSubscriber::profile()).await?,
        })
    }

    pub async fn with_channel(
        channel: Arc<dyn AmqpChannel>,
        config: Config,
    ) -> Result<TopicSubscriber, MessagingError> {
        Ok(TopicSubscriber {
            role: Role::with_channel(channel, config, TopicSubscriber::profile()).await?,
        })
    }

    pub async fn subscribe(&mut self, opts: SubscribeOptions) -> Result<String, MessagingError> {
        self.role.subscribe(opts).await
    }

    pub fn on_message(&mut self, handler: Arc<dyn MessageHandler>) {
        self.role.on_message(handler);
    }

    pub async fn listen(&mut self) -> Result<(), MessagingError> {
        self.role.listen().await
    }

    pub fn canceller(&self) -> Canceller {
        self.role.canceller()
    }

    pub async fn close(&self) -> Result<(), MessagingError> {
        self.role.close().await
    }
}

/// Work-queue producer: publishes jobs to a named queue via the default
/// exchange.
pub struct QueueServer {
    role: Role,
}

impl QueueServer {
    pub fn profile() -> RoleProfile {
        RoleProfile::new()
            .exchange_kind(ExchangeKind::Fanout)
            .routes_via_default()
    }

    pub async fn connect(config: Config) -> Result<QueueServer, MessagingError> {
        Ok(QueueServer {
            role: Role::connect(config, QueueServer::profile()).await?,
        })
    }

    pub async fn with_channel(
        channel: Arc<dyn AmqpChannel>,
        config: Config,
    ) -> Result<QueueServer, MessagingError> {
        Ok(QueueServer {
            role: Role::with_channel(channel, config, QueueServer::profile()).await?,
        })
    }

    /// Declares the work queue jobs will be published to.
    pub async fn declare_queue(&self, name: &str) -> Result<String, MessagingError> {
        self.role.declare_queue(&QueueDefinition::new(name)).await
    }

    /// Deletes a work queue.
    pub async fn delete_queue(&self, name: &str) -> Result<(), MessagingError> {
        self.role.delete_queue(name).await
    }

    /// Publishes one job to the named queue.
    pub async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), MessagingError> {
        self.role.publish(queue, payload).await
    }

    pub async fn close(&self) -> Result<(), MessagingError> {
        self.role.close().await
    }
}

/// Work-queue consumer with fair dispatch: at most one unacknowledged job at
/// a time (prefetch 1), so the broker spreads load across workers.
pub struct QueueWorker {
    role: Role,
}

impl QueueWorker {
    pub fn profile() -> RoleProfile {
        RoleProfile::new()
            .exchange_kind(ExchangeKind::Fanout)
            .routes_via_default()
            .prefetch(1)
    }

    pub async fn connect(config: Config) -> Result<QueueWorker, MessagingError> {
        Ok(QueueWorker {
            role: Role::connect(config, QueueWorker::profile()).await?,
        })
    }

    pub async fn with_channel(
        channel: Arc<dyn AmqpChannel>,
        config: Config,
    ) -> Result<QueueWorker, MessagingError> {
        Ok(QueueWorker {
            role: Role::with_channel(channel, config, QueueWorker::profile()).await?,
        })
    }

    /// Starts consuming jobs from the named queue (no binding: the work-queue
    /// model routes by queue name).
    pub async fn subscribe(&mut self, queue: &str) -> Result<String, MessagingError> {
        self.role.subscribe(SubscribeOptions::new().queue(queue)).await
    }

    pub fn on_message(&mut self, handler: Arc<dyn MessageHandler>) {
        self.role.on_message(handler);
    }

    pub async fn listen(&mut self) -> Result<(), MessagingError> {
        self.role.listen().await
    }

    pub fn canceller(&self) -> Canceller {
        self.role.canceller()
    }

    pub async fn close(&self) -> Result<(), MessagingError> {
        self.role.close().await
    }
}
