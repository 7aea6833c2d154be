// Copyright (c) 2025, The Hutch Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Types for defining broker exchanges. Exchanges are the routing entities in
//! an AMQP broker: messages are published to an exchange, which forwards them
//! to zero or more bound queues according to its kind and the routing key.

use crate::errors::MessagingError;
use std::fmt;
use std::str::FromStr;

/// Represents the kinds of exchanges recognized by this layer.
///
/// - Direct: routes messages to queues on an exact routing-key match
/// - Fanout: broadcasts messages to all bound queues regardless of routing key
/// - Topic: routes messages based on wildcard pattern matching of routing keys
/// - Headers: routes based on message header values instead of routing keys
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

/// The fixed set of recognized exchange kind names, used in error messages.
pub const EXCHANGE_KINDS: [&str; 4] = ["direct", "topic", "fanout", "headers"];

impl ExchangeKind {
    /// Returns the broker-side name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeKind {
    type Err = MessagingError;

    /// Parses an exchange kind name, failing with a `Configuration` error
    /// that names the invalid value and the valid set.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "direct" => Ok(ExchangeKind::Direct),
            "fanout" => Ok(ExchangeKind::Fanout),
            "topic" => Ok(ExchangeKind::Topic),
            "headers" => Ok(ExchangeKind::Headers),
            other => Err(MessagingError::Configuration(format!(
                "'{}' is not a valid exchange kind (expected one of: {})",
                other,
                EXCHANGE_KINDS.join(", "),
            ))),
        }
    }
}

impl From<&ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: &ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        }
    }
}

/// Definition of an exchange with its configuration parameters.
///
/// Implements the builder pattern. The empty name denotes the broker's default
/// exchange, which pre-exists and cannot be bound for subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
}

impl ExchangeDefinition {
    /// Creates a new exchange definition with the given name.
    ///
    /// Defaults to a non-durable direct exchange.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            durable: false,
            auto_delete: false,
        }
    }

    /// Sets the exchange kind.
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the exchange kind to Fanout.
    pub fn fanout(mut self) -> Self {
        self.kind = ExchangeKind::Fanout;
        self
    }

    /// Sets the exchange kind to Topic.
    pub fn topic(mut self) -> Self {
        self.kind = ExchangeKind::Topic;
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Returns the exchange name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_recognized_kinds() {
        for name in EXCHANGE_KINDS {
            let kind: ExchangeKind = name.parse().unwrap();
            assert_eq!(kind.as_str(), name);
        }
    }

    #[test]
    fn bogus_kind_is_a_configuration_error_naming_the_valid_set() {
        let err = "bogus".parse::<ExchangeKind>().unwrap_err();
        match err {
            MessagingError::Configuration(msg) => {
                assert!(msg.contains("'bogus'"));
                assert!(msg.contains("direct, topic, fanout, headers"));
            }
            other => panic!("expected configuration error, got {other:?}"),
        }
    }

    #[test]
    fn builder_defaults() {
        let def = ExchangeDefinition::new("events").fanout().durable();
        assert_eq!(def.name(), "events");
        assert_eq!(def.kind, ExchangeKind::Fanout);
        assert!(def.durable);
        assert!(!def.auto_delete);
    }
}
