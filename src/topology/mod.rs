/*
 * Copyright 2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Nodes, groups of nodes, and the sentinel manager that keeps them matched to the servers'
//! actual roles.

pub mod group;
pub mod manager;
pub mod message;
pub mod ms_group;
pub mod node;
pub mod sentinel_group;

pub use group::NodesGroup;
pub use manager::SentinelManager;
pub use message::{HelloMessage, SentinelEvent, SentinelMessage};
pub use ms_group::MsGroup;
pub use node::{Node, Seed};
pub use sentinel_group::{SentinelGroup, SentinelSeed};
