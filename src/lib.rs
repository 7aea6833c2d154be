// Copyright (c) 2025, The Hutch Authors
// MIT License
// All rights reserved.

//! # hutch
//!
//! A thin pattern layer over an AMQP broker: publish/subscribe, topic
//! routing, work queues, and correlated RPC, built from one shared role
//! driver plus exchange/queue topology management and an envelope codec.
//! The broker transport is an opaque collaborator behind the traits in
//! [`transport`]; a lapin-backed implementation is provided.

pub mod config;
pub mod envelope;
pub mod errors;
pub mod exchange;
pub mod patterns;
pub mod queue;
pub mod role;
pub mod rpc;
pub mod topology;
pub mod transport;
