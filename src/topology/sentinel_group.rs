/*
 * Copyright 2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

use std::sync::{Arc, Mutex, MutexGuard};

use crate::{
    client::{AsyncClient, SubscriptionListener},
    config::Endpoint,
    role::Role,
    topology::{
        group::NodesGroup,
        node::{Node, PingFuture, Seed},
    },
};

/// A sentinel: a command connection, plus the event subscription while this sentinel is the
/// one being monitored
pub struct SentinelSeed {
    client: AsyncClient,
    listener: Mutex<Option<SubscriptionListener>>,
}

impl SentinelSeed {
    pub fn new(client: AsyncClient) -> Self {
        SentinelSeed {
            client,
            listener: Mutex::new(None),
        }
    }

    pub fn client(&self) -> &AsyncClient {
        &self.client
    }

    fn lock(&self) -> MutexGuard<'_, Option<SubscriptionListener>> {
        match self.listener.lock() {
            Ok(listener) => listener,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Hold `listener` as this sentinel's subscription, closing any previous one
    pub fn attach(&self, listener: SubscriptionListener) {
        if let Some(previous) = self.lock().replace(listener) {
            previous.close();
        }
    }

    pub fn detach(&self) {
        if let Some(listener) = self.lock().take() {
            listener.close();
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.lock().as_ref().map_or(false, |l| !l.is_closed())
    }
}

impl Seed for SentinelSeed {
    fn endpoint(&self) -> &Endpoint {
        self.client.endpoint()
    }

    fn ping(&self) -> PingFuture {
        Box::pin(self.client.ping())
    }

    fn is_down(&self) -> bool {
        Seed::is_down(&self.client)
    }

    fn role(&self) -> Role {
        self.client.role()
    }

    fn set_role(&self, role: Role) {
        Seed::set_role(&self.client, role)
    }

    fn set_closed(&self, closed: bool) {
        Seed::set_closed(&self.client, closed)
    }

    fn set_half_closed(&self, half_closed: bool) {
        Seed::set_half_closed(&self.client, half_closed)
    }

    fn dispose(&self) {
        self.detach();
        self.client.dispose();
    }
}

/// The known sentinels, and which of them is currently monitored for events
pub struct SentinelGroup {
    nodes: NodesGroup<SentinelSeed>,
    monitored: Mutex<Option<Endpoint>>,
}

impl Default for SentinelGroup {
    fn default() -> Self {
        SentinelGroup::new()
    }
}

impl SentinelGroup {
    pub fn new() -> Self {
        SentinelGroup {
            nodes: NodesGroup::new(Role::Sentinel),
            monitored: Mutex::new(None),
        }
    }

    pub fn nodes(&self) -> &NodesGroup<SentinelSeed> {
        &self.nodes
    }

    fn lock(&self) -> MutexGuard<'_, Option<Endpoint>> {
        match self.monitored.lock() {
            Ok(monitored) => monitored,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn monitored_endpoint(&self) -> Option<Endpoint> {
        self.lock().clone()
    }

    pub fn monitored(&self) -> Option<Arc<Node<SentinelSeed>>> {
        let endpoint = self.monitored_endpoint()?;
        self.nodes.find(&endpoint)
    }

    /// Record `node` as monitored, handing it the subscription
    pub fn set_monitored(&self, node: &Node<SentinelSeed>, listener: SubscriptionListener) {
        node.seed().attach(listener);
        let previous = self.lock().replace(node.endpoint().clone());
        if let Some(previous) = previous.filter(|p| p != node.endpoint()) {
            if let Some(old) = self.nodes.find(&previous) {
                old.seed().detach();
            }
        }
    }

    /// Forget the monitored sentinel, dropping its subscription.  Returns the node that was
    /// monitored.
    pub fn clear_monitored(&self) -> Option<Arc<Node<SentinelSeed>>> {
        let endpoint = self.lock().take()?;
        let node = self.nodes.find(&endpoint)?;
        node.seed().detach();
        Some(node)
    }

    pub fn dispose(&self) {
        self.lock().take();
        self.nodes.dispose();
    }
}
