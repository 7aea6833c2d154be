// Copyright (c) 2025, The Hutch Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Types for defining broker queues and their bindings to exchanges. A queue
//! declared with an empty name receives a broker-assigned unique name; the
//! resolved name is returned by the declaring operation.

/// Definition of a queue with its configuration parameters.
///
/// Queues default to durable (surviving broker restarts) and non-exclusive,
/// matching the reliability bias of this layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) exclusive: bool,
    pub(crate) auto_delete: bool,
}

impl Default for QueueDefinition {
    fn default() -> Self {
        QueueDefinition::new("")
    }
}

impl QueueDefinition {
    /// Creates a new queue definition. An empty name requests a
    /// broker-assigned one.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }

    /// Makes the queue non-durable.
    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }

    /// Makes the queue exclusive to the declaring connection.
    ///
    /// Exclusive queues are visible only to that connection and are deleted
    /// by the broker when it closes.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Returns the requested queue name (possibly empty).
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Configuration for binding a queue to an exchange.
///
/// A binding is a registered `(queue, exchange, routing key)` relationship,
/// not an owned entity; a queue may have zero or many bindings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a new binding for the given queue with an empty exchange and
    /// routing key; set them with `exchange` and `routing_key`.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    /// Sets the exchange to bind the queue to.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Sets the routing key for the binding.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}
