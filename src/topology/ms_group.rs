/*
 * Copyright 2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::{
    config::Endpoint,
    error::{ConnectionReason, Error},
    role::Role,
    topology::{
        group::NodesGroup,
        node::{Node, Seed},
    },
};

/// Masters and slaves of one replicated set.
///
/// Reads prefer slaves and fall back to masters.  Writes go to masters, falling back to slaves
/// only when `slave_as_master` is set.
pub struct MsGroup<S: Seed> {
    masters: NodesGroup<S>,
    slaves: NodesGroup<S>,
    slave_as_master: AtomicBool,
}

impl<S: Seed> MsGroup<S> {
    pub fn new(slave_as_master: bool) -> Self {
        MsGroup {
            masters: NodesGroup::new(Role::Master),
            slaves: NodesGroup::new(Role::Slave),
            slave_as_master: AtomicBool::new(slave_as_master),
        }
    }

    pub fn masters(&self) -> &NodesGroup<S> {
        &self.masters
    }

    pub fn slaves(&self) -> &NodesGroup<S> {
        &self.slaves
    }

    pub fn slave_as_master(&self) -> bool {
        self.slave_as_master.load(Ordering::Acquire)
    }

    pub fn set_slave_as_master(&self, enabled: bool) {
        self.slave_as_master.store(enabled, Ordering::Release);
    }

    pub fn group_for(&self, role: Role) -> Option<&NodesGroup<S>> {
        match role {
            Role::Master => Some(&self.masters),
            Role::Slave => Some(&self.slaves),
            _ => None,
        }
    }

    pub fn select(&self, read_only: bool) -> Option<Arc<Node<S>>> {
        self.select_excluding(read_only, &HashSet::new())
    }

    /// As `select`, never handing out a node whose endpoint is in `tried`.  The fallback group is
    /// consulted once the preferred one has nothing left.
    pub fn select_excluding(
        &self,
        read_only: bool,
        tried: &HashSet<Endpoint>,
    ) -> Option<Arc<Node<S>>> {
        let untried = |node: &Node<S>| !tried.contains(node.endpoint());
        if read_only {
            self.slaves
                .select_where(untried)
                .or_else(|| self.masters.select_where(untried))
        } else {
            self.masters.select_where(untried).or_else(|| {
                if self.slave_as_master() {
                    self.slaves.select_where(untried)
                } else {
                    None
                }
            })
        }
    }

    /// As `select`, but an error once every route has been tried
    pub fn route(&self, read_only: bool) -> Result<Arc<Node<S>>, Error> {
        self.route_excluding(read_only, &HashSet::new())
    }

    pub fn route_excluding(
        &self,
        read_only: bool,
        tried: &HashSet<Endpoint>,
    ) -> Result<Arc<Node<S>>, Error> {
        self.select_excluding(read_only, tried)
            .ok_or(Error::Connection(ConnectionReason::NoReachableNode))
    }

    pub fn find(&self, endpoint: &Endpoint) -> Option<Arc<Node<S>>> {
        self.masters
            .find(endpoint)
            .or_else(|| self.slaves.find(endpoint))
    }

    /// Move the node at `endpoint` into the group for `role`, setting its role.  Returns the node
    /// if it was found in either group.
    pub fn relocate(&self, endpoint: &Endpoint, role: Role) -> Option<Arc<Node<S>>> {
        let target = self.group_for(role)?;
        if let Some(node) = target.find(endpoint) {
            node.set_role(role);
            return Some(node);
        }
        let other = if role == Role::Master {
            &self.slaves
        } else {
            &self.masters
        };
        let node = other.remove(endpoint)?;
        node.set_role(role);
        if !target.add(node.clone()) {
            // Raced with an insert of the same endpoint; keep the one already there
            node.dispose();
            return target.find(endpoint);
        }
        Some(node)
    }

    /// Add `node` to the group for its role, unless its endpoint is already known to either
    pub fn insert(&self, node: Arc<Node<S>>) -> bool {
        if self.find(node.endpoint()).is_some() {
            return false;
        }
        match self.group_for(node.role()) {
            Some(group) => group.add(node),
            None => false,
        }
    }

    /// Apply a failover: `new` becomes the master, and `old` (when known) is moved among the
    /// slaves.  If `new` is not yet known, `discover` is asked to create a node for it.
    pub fn change_master<F>(&self, old: &Endpoint, new: &Endpoint, discover: F) -> Option<Arc<Node<S>>>
    where
        F: FnOnce(&Endpoint) -> Option<Arc<Node<S>>>,
    {
        if old != new {
            self.relocate(old, Role::Slave);
        }
        if let Some(node) = self.relocate(new, Role::Master) {
            return Some(node);
        }
        let node = discover(new)?;
        node.set_role(Role::Master);
        if self.masters.add(node.clone()) {
            Some(node)
        } else {
            node.dispose();
            self.masters.find(new)
        }
    }

    /// Remove `endpoint` from whichever group holds it, disposing the node
    pub fn forget(&self, endpoint: &Endpoint) -> bool {
        match self
            .masters
            .remove(endpoint)
            .or_else(|| self.slaves.remove(endpoint))
        {
            Some(node) => {
                node.dispose();
                true
            }
            None => false,
        }
    }

    pub fn dispose(&self) {
        self.masters.dispose();
        self.slaves.dispose();
    }
}
