// Copyright (c) 2025, The Hutch Authors
// MIT License
// All rights reserved.

//! # Topology Management
//!
//! Declares exchanges and queues and registers bindings on one channel. Each
//! role owns a `Topology` bound to its own channel; broker-rejected declares
//! and binds surface as configuration errors, never silently.

use crate::{
    errors::MessagingError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    transport::AmqpChannel,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Topology manager over one channel.
#[derive(Clone)]
pub struct Topology {
    channel: Arc<dyn AmqpChannel>,
}

impl Topology {
    /// Creates a topology manager for the given channel.
    pub fn new(channel: Arc<dyn AmqpChannel>) -> Topology {
        Topology { channel }
    }

    /// Declares an exchange.
    ///
    /// Declaring the empty name refers to the broker's default exchange,
    /// which pre-exists; that case is a warn-and-skip. The default exchange
    /// cannot subsequently be bound for subscription.
    pub async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), MessagingError> {
        if def.name().is_empty() {
            warn!("using the default exchange ('') makes subscription unavailable");
            return Ok(());
        }

        self.channel.declare_exchange(def).await?;
        debug!(name = def.name(), "exchange declared");
        Ok(())
    }

    /// Declares a queue and returns its resolved name.
    ///
    /// An empty definition name requests a broker-assigned unique name.
    pub async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, MessagingError> {
        let resolved = self.channel.declare_queue(def).await?;
        debug!(name = resolved, "queue declared");
        Ok(resolved)
    }

    /// Deletes a queue unconditionally (no if-unused/if-empty guard).
    pub async fn delete_queue(&self, name: &str) -> Result<(), MessagingError> {
        if name.is_empty() {
            return Err(MessagingError::Configuration(
                "queue name must be a non-empty string".to_owned(),
            ));
        }

        self.channel.delete_queue(name).await
    }

    /// Registers a (queue, exchange, routing key) binding.
    ///
    /// Binding to the default exchange is rejected locally; broker-reported
    /// bind failures propagate as configuration errors.
    pub async fn bind(&self, binding: &QueueBinding) -> Result<(), MessagingError> {
        if binding.exchange_name.is_empty() {
            return Err(MessagingError::Configuration(
                "the default exchange is not eligible for binding".to_owned(),
            ));
        }

        self.channel.bind_queue(binding).await?;
        debug!(
            queue = binding.queue_name,
            exchange = binding.exchange_name,
            "queue was bound"
        );
        Ok(())
    }
}
