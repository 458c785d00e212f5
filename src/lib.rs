/*
 * Copyright 2017-2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! A pipelining Redis client using Tokio, with master/slave routing driven by Redis Sentinel.
//!
//! ## Connections
//!
//! [`AsyncClient`](client/struct.AsyncClient.html) is one connection to one server.  Commands are
//! queued (high priority ahead of normal), written to the socket in batches and matched with their
//! replies in the order they were sent.  Each command can be run blocking
//! ([`execute`](client/struct.AsyncClient.html#method.execute)) or as a future
//! ([`execute_async`](client/struct.AsyncClient.html#method.execute_async)).  The connection is
//! opened on first use, and a handshake discovers the server's role before any command is sent.
//!
//! The runtime is never implicit: every client is given the `tokio::runtime::Handle` it runs on.
//!
//! ## Topology
//!
//! [`SentinelManager`](topology/manager/struct.SentinelManager.html) asks a set of sentinels for
//! the master and slaves of a named replicated set, keeps a client for each, and routes commands:
//! writes to the master, read-only commands preferring slaves.  It follows the sentinels' events,
//! so a failover moves writes to the new master without the caller noticing.
//!
//! Health is tracked per node by a shared
//! [`HeartbeatService`](heartbeat/struct.HeartbeatService.html); a node failing enough pings in a
//! row stops being routed to until it answers again.
//!
//! ## Protocol
//!
//! [`RespValue`](protocol/enum.RespValue.html) is the raw wire value and
//! [`RespCodec`](protocol/struct.RespCodec.html) frames it for Tokio.  Replies are coerced into
//! the [`ReplyKind`](protocol/enum.ReplyKind.html) each command expects.

#[macro_use]
pub mod protocol;

pub mod client;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod role;
pub mod task;
pub mod topology;

#[cfg(test)]
mod testing;

pub use client::{AsyncClient, PubsubMessage, SubscriptionListener};
pub use config::{Endpoint, SendStrategy, Settings};
pub use error::Error;
pub use heartbeat::HeartbeatService;
pub use protocol::{Command, Priority, Reply, ReplyKind, RespValue};
pub use role::{Role, ServerMode};
pub use task::TaskStatus;
pub use topology::SentinelManager;
