/*
 * Copyright 2017-2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! The connection engine.
//!
//! * `AsyncClient` is a single pipelined connection to one server, used for all one-request,
//! one-reply commands.  Commands are queued by priority, written in batches and matched with their
//! replies in order.
//! * `SubscriptionListener` is a connection subscribed to a fixed set of channels, forwarding
//! messages to a stream.

pub(crate) mod async_client;
pub(crate) mod connect;
pub(crate) mod pubsub;
pub(crate) mod queue;
pub(crate) mod sender;
pub(crate) mod socket;

pub use self::async_client::AsyncClient;
pub use self::pubsub::{PubsubMessage, SubscriptionListener};
