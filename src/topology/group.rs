/*
 * Copyright 2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use crate::{
    config::Endpoint,
    role::Role,
    topology::node::{Node, Seed},
};

type Members<S> = Arc<Vec<Arc<Node<S>>>>;

/// Nodes sharing one role.
///
/// Membership is an immutable array swapped wholesale under the lock, so a reader holding a
/// snapshot never sees a change half applied.  No two members share an endpoint.
pub struct NodesGroup<S: Seed> {
    role: Role,
    members: RwLock<Members<S>>,
    cursor: AtomicUsize,
}

impl<S: Seed> NodesGroup<S> {
    pub fn new(role: Role) -> Self {
        NodesGroup {
            role,
            members: RwLock::new(Arc::new(Vec::new())),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// The current members.  Later changes to the group are not reflected in the snapshot.
    pub fn snapshot(&self) -> Members<S> {
        match self.members.read() {
            Ok(members) => members.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn nodes(&self) -> Vec<Arc<Node<S>>> {
        self.snapshot().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Apply `change` to a copy of the members and install the copy
    fn update<F, R>(&self, change: F) -> R
    where
        F: FnOnce(&mut Vec<Arc<Node<S>>>) -> R,
    {
        let mut members = match self.members.write() {
            Ok(members) => members,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut next: Vec<_> = members.iter().cloned().collect();
        let result = change(&mut next);
        *members = Arc::new(next);
        result
    }

    /// The next selectable member in round-robin order.  Each member is tried at most once per
    /// call.
    pub fn select(&self) -> Option<Arc<Node<S>>> {
        self.select_where(|_| true)
    }

    /// As `select`, skipping members for which `accept` is false
    pub fn select_where<F>(&self, accept: F) -> Option<Arc<Node<S>>>
    where
        F: Fn(&Node<S>) -> bool,
    {
        let members = self.snapshot();
        let n = members.len();
        for _ in 0..n {
            let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % n;
            let node = &members[idx];
            if node.is_selectable(self.role) && accept(node) {
                return Some(node.clone());
            }
        }
        None
    }

    /// `true` when no member can be selected, including when there are none
    pub fn is_down(&self) -> bool {
        !self
            .snapshot()
            .iter()
            .any(|node| node.is_selectable(self.role))
    }

    pub fn find(&self, endpoint: &Endpoint) -> Option<Arc<Node<S>>> {
        self.snapshot()
            .iter()
            .find(|node| node.endpoint() == endpoint)
            .cloned()
    }

    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        self.find(endpoint).is_some()
    }

    /// Add `node` unless a member already has its endpoint.  Returns whether it was added.
    pub fn add(&self, node: Arc<Node<S>>) -> bool {
        self.update(|members| {
            if members.iter().any(|m| m.endpoint() == node.endpoint()) {
                false
            } else {
                members.push(node);
                true
            }
        })
    }

    /// Remove the member at `endpoint`, returning it.  It is not disposed.
    pub fn remove(&self, endpoint: &Endpoint) -> Option<Arc<Node<S>>> {
        self.update(|members| {
            let idx = members.iter().position(|m| m.endpoint() == endpoint)?;
            Some(members.remove(idx))
        })
    }

    /// Replace every member at once, returning the previous members.  Later duplicates of an
    /// endpoint are dropped.
    pub fn replace_all(&self, nodes: Vec<Arc<Node<S>>>) -> Vec<Arc<Node<S>>> {
        let mut unique: Vec<Arc<Node<S>>> = Vec::with_capacity(nodes.len());
        for node in nodes {
            if unique.iter().any(|u| u.endpoint() == node.endpoint()) {
                log::warn!("Duplicate endpoint {} ignored", node.endpoint());
                continue;
            }
            unique.push(node);
        }
        self.update(|members| std::mem::replace(members, unique))
    }

    /// Empty the group, disposing every member
    pub fn dispose(&self) {
        for node in self.replace_all(Vec::new()) {
            node.dispose();
        }
    }
}
