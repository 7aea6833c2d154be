// Copyright (c) 2025, The Hutch Authors
// MIT License
// All rights reserved.

//! # Error Types for the Messaging Layer
//!
//! This module provides the error taxonomy for all pattern-layer operations.
//! The `MessagingError` enum covers configuration-time failures (bad exchange
//! kinds, rejected declares and binds), delivery-time failures (undecodable
//! envelope bodies), RPC-specific failures (call deadline exceeded, handler
//! errors surfaced by the server), and transport failures propagated unchanged
//! from the broker collaborator.

use thiserror::Error;

/// Represents errors that can occur during pattern-layer operations.
///
/// Configuration errors are raised synchronously at declare/bind time and
/// abort the caller's current operation. Transport errors are not retried by
/// this layer; they propagate to the caller, who may choose to reconnect.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum MessagingError {
    /// Invalid exchange kind, invalid queue name, or a broker-rejected
    /// declare/bind operation
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A delivered message body could not be decoded as an envelope
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// An RPC call exceeded its configured deadline
    #[error("rpc call timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// A user-supplied handler failed while processing an RPC request
    #[error("handler error: {0}")]
    Handler(String),

    /// A failure propagated unchanged from the broker transport
    #[error("transport error: {0}")]
    Transport(String),
}
