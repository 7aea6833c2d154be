// Copyright (c) 2025, The Hutch Authors
// MIT License
// All rights reserved.

//! # RPC Roles and Correlation Engine
//!
//! Correlated request/response over per-function queues on the broker's
//! default exchange. A request carries `reply_to` (the client's exclusive
//! callback queue) and a fresh 128-bit random correlation identifier; the
//! reply goes to the default exchange with routing key = `reply_to` and the
//! same identifier, body raw (non-enveloped).
//!
//! The client blocks by re-entering the role's one delivery loop until the
//! matching identifier arrives or the configured deadline expires. Stale
//! replies (from abandoned or timed-out calls) never match the currently
//! awaited identifier and are discarded.

use crate::{
    config::Config,
    envelope::Envelope,
    errors::MessagingError,
    role::{Canceller, MessageHandler, Role, RoleProfile, SubscribeOptions},
    transport::{AmqpChannel, Delivery, MessageProperties},
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Message kind stamped on replies that carry a handler failure instead of a
/// result.
pub const ERROR_REPLY_KIND: &str = "error";

/// User-supplied function invoked by an `RpcServer` for each request.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    /// Maps a raw request body to a raw response body. Errors are caught at
    /// the server boundary and surfaced to the caller as an error reply.
    async fn call(&self, request: &[u8]) -> Result<Vec<u8>, MessagingError>;
}

/// Bridges the role's consume loop to the RPC handler: executes the function,
/// publishes the reply, and lets the loop acknowledge the request.
struct ReplyBridge {
    channel: Arc<dyn AmqpChannel>,
    handler: Arc<dyn RpcHandler>,
}

#[async_trait]
impl MessageHandler for ReplyBridge {
    async fn handle(&self, envelope: &Envelope) -> Result<(), MessagingError> {
        let Some(reply_to) = envelope.reply_to.as_deref() else {
            warn!(function = envelope.topic, "rpc request without reply_to, dropping");
            return Ok(());
        };

        debug!(function = envelope.topic, "executing rpc function");
        let (kind, body) = match self.handler.call(&envelope.payload).await {
            Ok(response) => (None, response),
            Err(err) => {
                error!(
                    error = err.to_string(),
                    function = envelope.topic,
                    "rpc handler failed"
                );
                (
                    Some(ERROR_REPLY_KIND.to_owned()),
                    err.to_string().into_bytes(),
                )
            }
        };

        debug!(function = envelope.topic, "returning response message");
        let properties = MessageProperties {
            correlation_id: envelope.correlation_id.clone(),
            reply_to: None,
            kind,
        };
        self.channel.publish("", reply_to, &body, &properties).await
    }
}

/// Serves one RPC function from its named request queue, one request at a
/// time (prefetch 1 for fair dispatch across server instances).
pub struct RpcServer {
    role: Role,
}

impl RpcServer {
    /// Capability profile: no exchange (default/direct per-function queues),
    /// raw bodies, prefetch 1.
    pub fn profile() -> RoleProfile {
        RoleProfile::new()
            .raw_bodies()
            .routes_via_default()
            .prefetch(1)
    }

    /// Connects a server on its own connection and channel.
    pub async fn connect(
        config: Config,
        handler: Arc<dyn RpcHandler>,
    ) -> Result<RpcServer, MessagingError> {
        let role = Role::connect(config, RpcServer::profile()).await?;
        Ok(RpcServer::assemble(role, handler))
    }

    /// Builds a server on an externally supplied channel.
    pub async fn with_channel(
        channel: Arc<dyn AmqpChannel>,
        config: Config,
        handler: Arc<dyn RpcHandler>,
    ) -> Result<RpcServer, MessagingError> {
        let role = Role::with_channel(channel, config, RpcServer::profile()).await?;
        Ok(RpcServer::assemble(role, handler))
    }

    fn assemble(mut role: Role, handler: Arc<dyn RpcHandler>) -> RpcServer {
        let bridge = ReplyBridge {
            channel: role.channel(),
            handler,
        };
        role.on_message(Arc::new(bridge));
        RpcServer { role }
    }

    /// Declares the function's request queue and starts consuming from it.
    pub async fn bind(&mut self, function: &str) -> Result<String, MessagingError> {
        self.role
            .subscribe(SubscribeOptions::new().queue(function))
            .await
    }

    /// Serves requests until cancelled or the session ends.
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

/// One in-flight call awaiting its correlated reply.
#[derive(Debug)]
struct PendingCall {
    correlation_id: String,
}

impl PendingCall {
    /// Begins a call with a fresh 128-bit random identifier; collision
    /// probability is negligible.
    fn begin() -> PendingCall {
        PendingCall {
            correlation_id: Uuid::new_v4().to_string(),
        }
    }

    fn matches(&self, delivery: &Delivery) -> bool {
        delivery.correlation_id.as_deref() == Some(self.correlation_id.as_str())
    }
}

/// Issues correlated calls to named RPC functions, one in flight at a time
/// (enforced by `&mut self`).
pub struct RpcClient {
    role: Role,
    callback_queue: String,
}

impl RpcClient {
    /// Capability profile: no exchange, raw bodies, default-exchange routing.
    pub fn profile() -> RoleProfile {
        RoleProfile::new().raw_bodies().routes_via_default()
    }

    /// Connects a client on its own connection and channel, subscribing an
    /// exclusive broker-named callback queue for replies.
    pub async fn connect(config: Config) -> Result<RpcClient, MessagingError> {
        let role = Role::connect(config, RpcClient::profile()).await?;
        RpcClient::assemble(role).await
    }

    /// Builds a client on an externally supplied channel.
    pub async fn with_channel(
        channel: Arc<dyn AmqpChannel>,
        config: Config,
    ) -> Result<RpcClient, MessagingError> {
        let role = Role::with_channel(channel, config, RpcClient::profile()).await?;
        RpcClient::assemble(role).await
    }

    async fn assemble(mut role: Role) -> Result<RpcClient, MessagingError> {
        // Replies are settled on send: the client never acks its callback
        // queue, and the queue dies with the connection.
        let callback_queue = role
            .subscribe(SubscribeOptions::new().no_ack().exclusive())
            .await?;
        Ok(RpcClient {
            role,
            callback_queue,
        })
    }

    /// The broker-assigned reply queue for this client.
    pub fn callback_queue(&self) -> &str {
        &self.callback_queue
    }

    /// Calls a named function and blocks until its reply arrives or the
    /// configured deadline expires.
    ///
    /// Replies whose correlation identifier does not match the one just
    /// issued are discarded; a reply arriving after a timeout is likewise
    /// ignored by the next call.
    pub async fn call(&mut self, function: &str, request: &[u8]) -> Result<Vec<u8>, MessagingError> {
        let pending = PendingCall::begin();
        debug!(
            function,
            correlation_id = pending.correlation_id,
            "issuing rpc call"
        );

        let properties = MessageProperties {
            correlation_id: Some(pending.correlation_id.clone()),
            reply_to: Some(self.callback_queue.clone()),
            kind: None,
        };
        self.role
            .channel()
            .publish("", function, request, &properties)
            .await?;

        let deadline = self.role.config().call_timeout;
        let reply = self
            .role
            .pump(Some(deadline), |delivery| pending.matches(delivery))
            .await?;

        match reply {
            Some(reply) => {
                if reply.kind.as_deref() == Some(ERROR_REPLY_KIND) {
                    return Err(MessagingError::Handler(
                        String::from_utf8_lossy(&reply.body).into_owned(),
                    ));
                }
                Ok(reply.body)
            }
            None => Err(MessagingError::Transport(
                "reply stream ended before a response arrived".to_owned(),
            )),
        }
    }

    pub async fn close(&self) -> Result<(), MessagingError> {
        self.role.close().await
    }
}
