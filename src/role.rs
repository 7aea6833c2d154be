// Copyright (c) 2025, The Hutch Authors
// MIT License
// All rights reserved.

//! # Shared Pattern-Role Driver
//!
//! All four messaging patterns are configurations of one driver: connect,
//! declare the exchange, optionally declare-and-bind a queue, then consume.
//! A `RoleProfile` capability table selects which steps apply; there is no
//! role inheritance and no behavior disabled by overriding.
//!
//! The consume loop is single-threaded per role: deliveries are dispatched
//! strictly in arrival order, and the RPC client re-enters the same pump
//! primitive with a predicate and deadline instead of spawning a second loop.

use crate::{
    config::Config,
    envelope::{Envelope, ENVELOPE_DELIMITER},
    errors::MessagingError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
    topology::Topology,
    transport::{
        self, AmqpChannel, AmqpConnection, Delivery, DeliveryStream, MessageProperties, Receipt,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{debug, error, warn};

/// Capability table for one pattern role.
///
/// The profile replaces the source design's inheritance hierarchy: each role
/// is the shared driver plus this small set of flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleProfile {
    pub(crate) exchange_kind: Option<ExchangeKind>,
    pub(crate) binds_on_subscribe: bool,
    pub(crate) prefetch: Option<u16>,
    pub(crate) routes_via_default: bool,
    pub(crate) envelope_coded: bool,
}

impl RoleProfile {
    /// Creates an empty profile: no exchange, no binding, default prefetch,
    /// exchange-name routing, envelope-coded bodies.
    pub fn new() -> RoleProfile {
        RoleProfile {
            envelope_coded: true,
            ..RoleProfile::default()
        }
    }

    /// Declares an exchange of this kind at construction.
    pub fn exchange_kind(mut self, kind: ExchangeKind) -> Self {
        self.exchange_kind = Some(kind);
        self
    }

    /// Binds the subscribed queue to the role's exchange.
    pub fn binds_on_subscribe(mut self) -> Self {
        self.binds_on_subscribe = true;
        self
    }

    /// Caps unacknowledged deliveries held at once (fair dispatch uses 1).
    pub fn prefetch(mut self, count: u16) -> Self {
        self.prefetch = Some(count);
        self
    }

    /// Publishes via the broker's default exchange, routing by queue name.
    pub fn routes_via_default(mut self) -> Self {
        self.routes_via_default = true;
        self
    }

    /// Bodies travel raw instead of envelope-coded (RPC roles).
    pub fn raw_bodies(mut self) -> Self {
        self.envelope_coded = false;
        self
    }
}

/// Options for one subscription.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    pub queue_name: Option<String>,
    pub topic: Option<String>,
    /// Consume in acknowledge mode: the loop acks each delivery after its
    /// handler succeeds. When false the broker settles deliveries on send.
    pub acknowledge: bool,
    pub exclusive: bool,
}

impl SubscribeOptions {
    /// Subscription with acknowledgments on and a broker-assigned queue.
    pub fn new() -> SubscribeOptions {
        SubscribeOptions {
            acknowledge: true,
            ..SubscribeOptions::default()
        }
    }

    /// Subscribes to a named queue.
    pub fn queue(mut self, name: &str) -> Self {
        self.queue_name = Some(name.to_owned());
        self
    }

    /// Filters by topic or topic pattern (binding routing key).
    pub fn topic(mut self, topic: &str) -> Self {
        self.topic = Some(topic.to_owned());
        self
    }

    /// Disables acknowledgments (broker settles deliveries on send).
    pub fn no_ack(mut self) -> Self {
        self.acknowledge = false;
        self
    }

    /// Declares the queue exclusive to this connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }
}

/// Handler registered per role instance, invoked by the consume loop for each
/// decoded delivery in arrival order.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Processes one delivery. Returning `Err` leaves the delivery
    /// unacknowledged so the broker requeues it when the channel closes.
    async fn handle(&self, envelope: &Envelope) -> Result<(), MessagingError>;
}

/// Handle for cancelling a role's `listen` loop from outside.
///
/// Cancellation is sticky: once cancelled, the role's loop will not run again.
#[derive(Clone)]
pub struct Canceller {
    tx: Arc<watch::Sender<bool>>,
}

impl Canceller {
    /// Stops the listen loop at its next suspension point. Takes effect even
    /// when no loop is currently running: the flag is stored and the next
    /// loop observes it before consuming anything.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// The shared pattern driver. One role exclusively owns one channel (and the
/// connection it came from) plus the topology it declares.
pub struct Role {
    channel: Arc<dyn AmqpChannel>,
    connection: Option<Arc<dyn AmqpConnection>>,
    topology: Topology,
    config: Config,
    profile: RoleProfile,
    handler: Option<Arc<dyn MessageHandler>>,
    consumer: Option<DeliveryStream>,
    ack_on_delivery: bool,
    cancel: Arc<watch::Sender<bool>>,
}

impl Role {
    /// Opens a connection and channel per the configuration and runs the
    /// construction state machine: prefetch, publish confirms, exchange
    /// declaration. Construction is all-or-nothing; any failure aborts with
    /// no half-initialized role.
    pub async fn connect(config: Config, profile: RoleProfile) -> Result<Role, MessagingError> {
        let connection = transport::connect(&config).await?;
        let channel = connection.channel().await?;
        Role::initialize(Some(connection), channel, config, profile).await
    }

    /// Builds a role on an externally supplied channel. This is the seam for
    /// alternative transports and for tests.
    pub async fn with_channel(
        channel: Arc<dyn AmqpChannel>,
        config: Config,
        profile: RoleProfile,
    ) -> Result<Role, MessagingError> {
        Role::initialize(None, channel, config, profile).await
    }

    async fn initialize(
        connection: Option<Arc<dyn AmqpConnection>>,
        channel: Arc<dyn AmqpChannel>,
        config: Config,
        profile: RoleProfile,
    ) -> Result<Role, MessagingError> {
        if let Some(count) = profile.prefetch {
            channel.set_prefetch(count).await?;
        }

        if config.confirm_delivery {
            debug!("confirming delivery for this channel");
            channel.confirm_delivery().await?;
        }

        let topology = Topology::new(channel.clone());

        if let Some(kind) = &profile.exchange_kind {
            let def = ExchangeDefinition::new(&config.exchange_name).kind(kind.clone());
            topology.declare_exchange(&def).await?;
        }

        let (cancel, _) = watch::channel(false);

        Ok(Role {
            channel,
            connection,
            topology,
            config,
            profile,
            handler: None,
            consumer: None,
            ack_on_delivery: false,
            cancel: Arc::new(cancel),
        })
    }

    /// Publishes a payload with `topic` as the routing key. Envelope-coded
    /// profiles wrap the body as `topic:payload` and reject topics containing
    /// the delimiter; raw-body profiles send the payload untouched.
    ///
    /// Roles routing via the default exchange (work queues) address the
    /// queue named by `topic`; the others publish to their own exchange.
    pub async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), MessagingError> {
        let body = if self.profile.envelope_coded {
            if topic.as_bytes().contains(&ENVELOPE_DELIMITER) {
                return Err(MessagingError::Configuration(format!(
                    "topic `{topic}` must not contain the envelope delimiter ':'"
                )));
            }
            Envelope::new(topic, payload).encode()
        } else {
            payload.to_vec()
        };
        let exchange = if self.profile.routes_via_default {
            ""
        } else {
            self.config.exchange_name.as_str()
        };

        debug!(topic, exchange, "sending message");
        self.channel
            .publish(exchange, topic, &body, &MessageProperties::default())
            .await
    }

    /// Declares (and, per the profile, binds) a queue and starts consuming
    /// from it. Returns the resolved queue name.
    pub async fn subscribe(&mut self, opts: SubscribeOptions) -> Result<String, MessagingError> {
        let mut def = QueueDefinition::new(opts.queue_name.as_deref().unwrap_or(""));
        if opts.exclusive {
            def = def.exclusive();
        }

        let queue = self.topology.declare_queue(&def).await?;

        if self.profile.binds_on_subscribe {
            let topic = opts.topic.as_deref().unwrap_or("");
            let binding = QueueBinding::new(&queue)
                .exchange(&self.config.exchange_name)
                .routing_key(topic);
            self.topology.bind(&binding).await?;
        }

        let stream = self.channel.consume(&queue, !opts.acknowledge).await?;
        self.consumer = Some(stream);
        self.ack_on_delivery = opts.acknowledge;

        debug!(queue, "subscribed");
        Ok(queue)
    }

    /// Registers the delivery handler for this role instance.
    pub fn on_message(&mut self, handler: Arc<dyn MessageHandler>) {
        self.handler = Some(handler);
    }

    /// Returns a handle that cancels `listen` from another task.
    pub fn canceller(&self) -> Canceller {
        Canceller {
            tx: self.cancel.clone(),
        }
    }

    /// Consumes deliveries until cancelled or the underlying session ends,
    /// dispatching each to the registered handler in arrival order.
    pub async fn listen(&mut self) -> Result<(), MessagingError> {
        debug!("listening for messages...");
        self.pump(None, |_| false).await.map(|_| ())
    }

    /// Pumps the delivery loop until the predicate holds or the deadline
    /// expires. Non-matching deliveries are dispatched (or discarded when no
    /// handler is registered); the matching delivery is returned untouched.
    /// `Ok(None)` means the loop was cancelled or the stream ended.
    pub(crate) async fn pump<P>(
        &mut self,
        deadline: Option<Duration>,
        predicate: P,
    ) -> Result<Option<Delivery>, MessagingError>
    where
        P: FnMut(&Delivery) -> bool + Send,
    {
        let mut stream = self.consumer.take().ok_or_else(|| {
            MessagingError::Configuration(
                "no active subscription: call subscribe before listening".to_owned(),
            )
        })?;

        let ctx = LoopContext {
            channel: self.channel.clone(),
            handler: self.handler.clone(),
            envelope_coded: self.profile.envelope_coded,
            ack_on_delivery: self.ack_on_delivery,
            cancel: self.cancel.clone(),
        };

        let result = match deadline {
            Some(limit) => match tokio::time::timeout(limit, ctx.drain(&mut stream, predicate)).await
            {
                Ok(result) => result,
                Err(_) => Err(MessagingError::Timeout(limit)),
            },
            None => ctx.drain(&mut stream, predicate).await,
        };

        // The stream survives across pumps: an RPC client re-enters it on
        // every call.
        self.consumer = Some(stream);
        result
    }

    /// Acknowledges one delivery, consuming its receipt.
    pub async fn acknowledge(&self, receipt: Receipt) -> Result<(), MessagingError> {
        self.channel.ack(receipt).await
    }

    /// Declares a queue on this role's channel; returns the resolved name.
    pub async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, MessagingError> {
        self.topology.declare_queue(def).await
    }

    /// Deletes a queue on this role's channel.
    pub async fn delete_queue(&self, name: &str) -> Result<(), MessagingError> {
        self.topology.delete_queue(name).await
    }

    /// The topology manager bound to this role's channel.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Closes the connection this role owns, if it owns one.
    pub async fn close(&self) -> Result<(), MessagingError> {
        match &self.connection {
            Some(connection) => connection.close().await,
            None => Ok(()),
        }
    }

    pub(crate) fn channel(&self) -> Arc<dyn AmqpChannel> {
        self.channel.clone()
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }
}

/// Owned snapshot of the loop's collaborators, detached from the role so the
/// consume future stays `Send` while the role holds the stream.
struct LoopContext {
    channel: Arc<dyn AmqpChannel>,
    handler: Option<Arc<dyn MessageHandler>>,
    envelope_coded: bool,
    ack_on_delivery: bool,
    cancel: Arc<watch::Sender<bool>>,
}

impl LoopContext {
    async fn drain<P>(
        &self,
        stream: &mut DeliveryStream,
        mut predicate: P,
    ) -> Result<Option<Delivery>, MessagingError>
    where
        P: FnMut(&Delivery) -> bool + Send,
    {
        let mut cancelled = self.cancel.subscribe();
        if *cancelled.borrow() {
            debug!("listen cancelled");
            return Ok(None);
        }

        loop {
            tokio::select! {
                _ = cancelled.changed() => {
                    debug!("listen cancelled");
                    return Ok(None);
                }
                item = stream.next() => match item {
                    None => {
                        debug!("delivery stream ended");
                        return Ok(None);
                    }
                    Some(Err(err)) => return Err(err),
                    Some(Ok(delivery)) => {
                        if predicate(&delivery) {
                            return Ok(Some(delivery));
                        }
                        self.dispatch(delivery).await?;
                    }
                }
            }
        }
    }

    async fn dispatch(&self, delivery: Delivery) -> Result<(), MessagingError> {
        let Delivery {
            routing_key,
            body,
            correlation_id,
            reply_to,
            redelivered,
            receipt,
            ..
        } = delivery;

        let envelope = if self.envelope_coded {
            match Envelope::decode(&body) {
                Ok(mut envelope) => {
                    envelope.correlation_id = correlation_id;
                    envelope.reply_to = reply_to;
                    envelope.redelivered = redelivered;
                    envelope
                }
                Err(err) => {
                    // Ack-and-drop: a poison message must not loop forever.
                    error!(
                        error = err.to_string(),
                        routing_key, "dropping undecodable delivery"
                    );
                    if self.ack_on_delivery {
                        self.channel.ack(receipt).await?;
                    }
                    return Ok(());
                }
            }
        } else {
            Envelope {
                topic: routing_key,
                payload: body,
                correlation_id,
                reply_to,
                redelivered,
            }
        };

        let outcome = match &self.handler {
            Some(handler) => handler.handle(&envelope).await,
            None => {
                debug!("handling message {}: {} bytes", envelope.topic, envelope.payload.len());
                Ok(())
            }
        };

        match outcome {
            Ok(()) => {
                if self.ack_on_delivery {
                    self.channel.ack(receipt).await?;
                }
            }
            Err(err) => {
                // Left unacknowledged: the broker requeues on channel close.
                warn!(
                    error = err.to_string(),
                    topic = envelope.topic,
                    "handler failed, leaving delivery unacknowledged"
                );
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::test_support::{delivery, stream_of};
    use crate::transport::MockAmqpChannel;
    use std::sync::Mutex;

    fn quiet_config() -> Config {
        Config::new("events").without_confirms()
    }

    struct Recorder {
        seen: Mutex<Vec<String>>,
        fail: bool,
    }

    impl Recorder {
        fn new(fail: bool) -> Arc<Recorder> {
            Arc::new(Recorder {
                seen: Mutex::new(vec![]),
                fail,
            })
        }
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle(&self, envelope: &Envelope) -> Result<(), MessagingError> {
            self.seen.lock().unwrap().push(format!(
                "{}:{}",
                envelope.topic,
                String::from_utf8_lossy(&envelope.payload)
            ));
            if self.fail {
                return Err(MessagingError::Handler("induced".to_owned()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn construction_runs_the_full_state_machine() {
        let mut channel = MockAmqpChannel::new();
        channel.expect_set_prefetch().with(mockall::predicate::eq(1)).once().returning(|_| Ok(()));
        channel.expect_confirm_delivery().once().returning(|| Ok(()));
        channel
            .expect_declare_exchange()
            .withf(|def| def.name() == "events")
            .once()
            .returning(|_| Ok(()));

        let profile = RoleProfile::new()
            .exchange_kind(ExchangeKind::Fanout)
            .prefetch(1);
        Role::with_channel(Arc::new(channel), Config::new("events"), profile)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn construction_is_all_or_nothing() {
        let mut channel = MockAmqpChannel::new();
        channel.expect_set_prefetch().once().returning(|_| {
            Err(MessagingError::Configuration(
                "failure to configure qos".to_owned(),
            ))
        });
        channel.expect_confirm_delivery().never();
        channel.expect_declare_exchange().never();

        let profile = RoleProfile::new()
            .exchange_kind(ExchangeKind::Fanout)
            .prefetch(1);
        let result = Role::with_channel(Arc::new(channel), Config::new("events"), profile).await;
        assert!(matches!(result, Err(MessagingError::Configuration(_))));
    }

    #[tokio::test]
    async fn subscriber_profile_declares_binds_and_consumes() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_declare_exchange()
            .once()
            .returning(|_| Ok(()));
        channel
            .expect_declare_queue()
            .once()
            .returning(|_| Ok("amq.gen-xyz".to_owned()));
        channel
            .expect_bind_queue()
            .withf(|binding| {
                binding.queue_name == "amq.gen-xyz"
                    && binding.exchange_name == "events"
                    && binding.routing_key == "something.*"
            })
            .once()
            .returning(|_| Ok(()));
        channel
            .expect_consume()
            .withf(|queue, no_ack| queue == "amq.gen-xyz" && !no_ack)
            .once()
            .return_once(|_, _| Ok(stream_of(vec![])));

        let profile = RoleProfile::new()
            .exchange_kind(ExchangeKind::Topic)
            .binds_on_subscribe();
        let mut role = Role::with_channel(Arc::new(channel), quiet_config(), profile)
            .await
            .unwrap();
        let queue = role
            .subscribe(SubscribeOptions::new().topic("something.*"))
            .await
            .unwrap();
        assert_eq!(queue, "amq.gen-xyz");
    }

    #[tokio::test]
    async fn non_binding_profile_never_binds() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_declare_queue()
            .once()
            .returning(|_| Ok("work".to_owned()));
        channel.expect_bind_queue().never();
        channel
            .expect_consume()
            .once()
            .return_once(|_, _| Ok(stream_of(vec![])));

        let mut role = Role::with_channel(
            Arc::new(channel),
            Config::new("work").without_confirms(),
            RoleProfile::new().routes_via_default(),
        )
        .await
        .unwrap();
        role.subscribe(SubscribeOptions::new().queue("work"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn publish_envelopes_and_routes_on_the_exchange() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_publish()
            .withf(|exchange, key, body, _| {
                exchange == "events" && key == "t" && body == &b"t:payload"[..]
            })
            .once()
            .returning(|_, _, _, _| Ok(()));

        let role = Role::with_channel(Arc::new(channel), quiet_config(), RoleProfile::new())
            .await
            .unwrap();
        role.publish("t", b"payload").await.unwrap();
    }

    #[tokio::test]
    async fn default_routing_profile_publishes_to_the_default_exchange() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_publish()
            .withf(|exchange, key, _, _| exchange.is_empty() && key == "work")
            .once()
            .returning(|_, _, _, _| Ok(()));

        let role = Role::with_channel(
            Arc::new(channel),
            Config::new("work").without_confirms(),
            RoleProfile::new().routes_via_default(),
        )
        .await
        .unwrap();
        role.publish("work", b"n=1").await.unwrap();
    }

    #[tokio::test]
    async fn topics_containing_the_delimiter_are_rejected_before_publishing() {
        let mut channel = MockAmqpChannel::new();
        channel.expect_publish().never();

        let role = Role::with_channel(Arc::new(channel), quiet_config(), RoleProfile::new())
            .await
            .unwrap();
        let err = role.publish("bad:topic", b"x").await.unwrap_err();
        assert!(matches!(err, MessagingError::Configuration(_)));
    }

    #[tokio::test]
    async fn raw_body_profiles_publish_the_payload_untouched() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_publish()
            .withf(|exchange, key, body, _| {
                exchange.is_empty() && key == "square" && body == &b"6"[..]
            })
            .once()
            .returning(|_, _, _, _| Ok(()));

        let role = Role::with_channel(
            Arc::new(channel),
            Config::new("").without_confirms(),
            RoleProfile::new().raw_bodies().routes_via_default(),
        )
        .await
        .unwrap();
        role.publish("square", b"6").await.unwrap();
    }

    #[tokio::test]
    async fn listen_dispatches_in_order_and_acks_after_success() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_declare_queue()
            .returning(|_| Ok("inbox".to_owned()));
        channel.expect_consume().return_once(|_, _| {
            Ok(stream_of(vec![
                delivery("a", b"a:first", 1),
                delivery("b", b"b:second", 2),
            ]))
        });
        channel.expect_ack().times(2).returning(|_| Ok(()));

        let mut role = Role::with_channel(
            Arc::new(channel),
            Config::new("").without_confirms(),
            RoleProfile::new(),
        )
        .await
        .unwrap();
        role.subscribe(SubscribeOptions::new().queue("inbox"))
            .await
            .unwrap();

        let recorder = Recorder::new(false);
        role.on_message(recorder.clone());
        role.listen().await.unwrap();

        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec!["a:first".to_owned(), "b:second".to_owned()]
        );
    }

    #[tokio::test]
    async fn malformed_deliveries_are_acked_and_dropped() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_declare_queue()
            .returning(|_| Ok("inbox".to_owned()));
        channel.expect_consume().return_once(|_, _| {
            Ok(stream_of(vec![
                delivery("bad", b"no delimiter", 1),
                delivery("ok", b"ok:fine", 2),
            ]))
        });
        channel.expect_ack().times(2).returning(|_| Ok(()));

        let mut role = Role::with_channel(
            Arc::new(channel),
            Config::new("").without_confirms(),
            RoleProfile::new(),
        )
        .await
        .unwrap();
        role.subscribe(SubscribeOptions::new().queue("inbox"))
            .await
            .unwrap();

        let recorder = Recorder::new(false);
        role.on_message(recorder.clone());
        role.listen().await.unwrap();

        // Only the well-formed delivery reached the handler.
        assert_eq!(*recorder.seen.lock().unwrap(), vec!["ok:fine".to_owned()]);
    }

    #[tokio::test]
    async fn failed_handlers_leave_the_delivery_unacknowledged() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_declare_queue()
            .returning(|_| Ok("inbox".to_owned()));
        channel
            .expect_consume()
            .return_once(|_, _| Ok(stream_of(vec![delivery("t", b"t:x", 1)])));
        channel.expect_ack().never();

        let mut role = Role::with_channel(
            Arc::new(channel),
            Config::new("").without_confirms(),
            RoleProfile::new(),
        )
        .await
        .unwrap();
        role.subscribe(SubscribeOptions::new().queue("inbox"))
            .await
            .unwrap();
        role.on_message(Recorder::new(true));
        role.listen().await.unwrap();
    }

    #[tokio::test]
    async fn listen_without_a_subscription_is_a_configuration_error() {
        let channel = MockAmqpChannel::new();
        let mut role = Role::with_channel(
            Arc::new(channel),
            Config::new("").without_confirms(),
            RoleProfile::new(),
        )
        .await
        .unwrap();

        let err = role.listen().await.unwrap_err();
        assert!(matches!(err, MessagingError::Configuration(_)));
    }

    #[tokio::test]
    async fn cancellation_stops_an_idle_listener() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_declare_queue()
            .returning(|_| Ok("inbox".to_owned()));
        channel
            .expect_consume()
            .return_once(|_, _| {
                let stream: DeliveryStream =
                    Box::pin(futures_util::stream::pending::<Result<Delivery, MessagingError>>());
                Ok(stream)
            });

        let mut role = Role::with_channel(
            Arc::new(channel),
            Config::new("").without_confirms(),
            RoleProfile::new(),
        )
        .await
        .unwrap();
        role.subscribe(SubscribeOptions::new().queue("inbox"))
            .await
            .unwrap();

        let canceller = role.canceller();
        let task = tokio::spawn(async move { role.listen().await });
        canceller.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cancellation_is_sticky_before_the_loop_starts() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_declare_queue()
            .returning(|_| Ok("inbox".to_owned()));
        channel.expect_consume().return_once(|_, _| {
            let stream: DeliveryStream =
                Box::pin(futures_util::stream::pending::<Result<Delivery, MessagingError>>());
            Ok(stream)
        });

        let mut role = Role::with_channel(
            Arc::new(channel),
            Config::new("").without_confirms(),
            RoleProfile::new(),
        )
        .await
        .unwrap();
        role.subscribe(SubscribeOptions::new().queue("inbox"))
            .await
            .unwrap();

        // No loop is running yet, so the flag has no live subscriber; the
        // later listen must still observe it and return immediately.
        role.canceller().cancel();
        role.listen().await.unwrap();
    }

    #[tokio::test]
    async fn redelivered_deliveries_are_flagged_to_the_handler() {
        struct RedeliveryLog {
            seen: Mutex<Vec<bool>>,
        }

        #[async_trait]
        impl MessageHandler for RedeliveryLog {
            async fn handle(&self, envelope: &Envelope) -> Result<(), MessagingError> {
                self.seen.lock().unwrap().push(envelope.redelivered);
                Ok(())
            }
        }

        let mut channel = MockAmqpChannel::new();
        channel
            .expect_declare_queue()
            .returning(|_| Ok("inbox".to_owned()));
        channel.expect_consume().return_once(|_, _| {
            let retried = Delivery {
                redelivered: true,
                ..delivery("t", b"t:again", 2)
            };
            Ok(stream_of(vec![delivery("t", b"t:first", 1), retried]))
        });
        channel.expect_ack().times(2).returning(|_| Ok(()));

        let mut role = Role::with_channel(
            Arc::new(channel),
            Config::new("").without_confirms(),
            RoleProfile::new(),
        )
        .await
        .unwrap();
        role.subscribe(SubscribeOptions::new().queue("inbox"))
            .await
            .unwrap();

        let log = Arc::new(RedeliveryLog {
            seen: Mutex::new(vec![]),
        });
        role.on_message(log.clone());
        role.listen().await.unwrap();

        assert_eq!(*log.seen.lock().unwrap(), vec![false, true]);
    }
}
