/*
 * Copyright 2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

use crate::{
    client::AsyncClient,
    config::Endpoint,
    error::{self, Error},
    heartbeat::{HeartbeatProbe, PulseFuture},
    role::Role,
};

pub type PingFuture = Pin<Box<dyn Future<Output = Result<(), Error>> + Send + 'static>>;

/// What a node needs from the connection it wraps
pub trait Seed: Send + Sync + 'static {
    fn endpoint(&self) -> &Endpoint;

    fn ping(&self) -> PingFuture;

    fn is_down(&self) -> bool;

    fn role(&self) -> Role;

    fn set_role(&self, role: Role);

    fn set_closed(&self, closed: bool);

    fn set_half_closed(&self, half_closed: bool);

    fn dispose(&self);
}

impl Seed for AsyncClient {
    fn endpoint(&self) -> &Endpoint {
        AsyncClient::endpoint(self)
    }

    fn ping(&self) -> PingFuture {
        Box::pin(AsyncClient::ping(self))
    }

    fn is_down(&self) -> bool {
        self.is_closed() || AsyncClient::is_disposed(self)
    }

    fn role(&self) -> Role {
        AsyncClient::role(self)
    }

    fn set_role(&self, role: Role) {
        AsyncClient::set_role(self, role)
    }

    fn set_closed(&self, closed: bool) {
        AsyncClient::set_closed(self, closed)
    }

    fn set_half_closed(&self, half_closed: bool) {
        AsyncClient::set_half_closed(self, half_closed)
    }

    fn dispose(&self) {
        AsyncClient::dispose(self)
    }
}

/// A member of the topology: one seed plus the health and role the topology layer tracks for
/// it.  Role and the closed/half-closed flags are mirrored onto the seed on every change.
///
/// A disposed node is always closed and never reopens.
pub struct Node<S: Seed> {
    endpoint: Endpoint,
    seed: RwLock<Arc<S>>,
    owns_seed: AtomicBool,
    role: AtomicU8,
    closed: AtomicBool,
    half_closed: AtomicBool,
    disposed: AtomicBool,
    failure_threshold: u32,
}

impl<S: Seed> Node<S> {
    /// Wrap `seed`, disposing it along with the node when `owns_seed` is set
    pub fn new(seed: Arc<S>, owns_seed: bool, role: Role, failure_threshold: u32) -> Self {
        seed.set_role(role);
        Node {
            endpoint: seed.endpoint().clone(),
            seed: RwLock::new(seed),
            owns_seed: AtomicBool::new(owns_seed),
            role: AtomicU8::new(role.to_u8()),
            closed: AtomicBool::new(false),
            half_closed: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            failure_threshold: failure_threshold.max(1),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn seed(&self) -> Arc<S> {
        match self.seed.read() {
            Ok(seed) => seed.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn owns_seed(&self) -> bool {
        self.owns_seed.load(Ordering::Acquire)
    }

    pub fn role(&self) -> Role {
        Role::from_u8(self.role.load(Ordering::Acquire))
    }

    pub fn set_role(&self, role: Role) {
        self.role.store(role.to_u8(), Ordering::Release);
        self.seed().set_role(role);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Ignored when opening a disposed node
    pub fn set_closed(&self, closed: bool) {
        if !closed && self.is_disposed() {
            return;
        }
        if self.closed.swap(closed, Ordering::AcqRel) != closed {
            log::info!(
                "{} node {} is now {}",
                self.role(),
                self.endpoint,
                if closed { "closed" } else { "open" }
            );
        }
        self.seed().set_closed(closed);
    }

    pub fn is_half_closed(&self) -> bool {
        self.half_closed.load(Ordering::Acquire)
    }

    pub fn set_half_closed(&self, half_closed: bool) {
        self.half_closed.store(half_closed, Ordering::Release);
        self.seed().set_half_closed(half_closed);
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Whether the node may be handed out to serve `role`
    pub fn is_selectable(&self, role: Role) -> bool {
        !self.is_closed() && !self.is_disposed() && self.role().serves(role)
    }

    /// Whether the node, or its seed, is known to be unusable
    pub fn is_down(&self) -> bool {
        self.is_closed() || self.is_disposed() || self.seed().is_down()
    }

    /// Replace the seed, keeping this node's identity and flags.  The previous seed is disposed
    /// if this node owned it.
    pub fn swap_seed(&self, seed: Arc<S>, owns_seed: bool) -> Result<(), Error> {
        if seed.endpoint() != &self.endpoint {
            return Err(error::internal(format!(
                "Cannot give node {} a seed for {}",
                self.endpoint,
                seed.endpoint()
            )));
        }
        if self.is_disposed() {
            return Err(Error::Connection(crate::error::ConnectionReason::Disposed));
        }
        seed.set_role(self.role());
        seed.set_closed(self.is_closed());
        seed.set_half_closed(self.is_half_closed());

        let previous = {
            let mut current = match self.seed.write() {
                Ok(current) => current,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::replace(&mut *current, seed)
        };
        let owned_previous = self.owns_seed.swap(owns_seed, Ordering::AcqRel);
        if owned_previous && !Arc::ptr_eq(&previous, &self.seed()) {
            previous.dispose();
        }
        Ok(())
    }

    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.closed.store(true, Ordering::Release);
        let seed = self.seed();
        seed.set_closed(true);
        if self.owns_seed() {
            seed.dispose();
        }
        log::debug!("Disposed node {}", self.endpoint);
    }
}

impl<S: Seed> HeartbeatProbe for Node<S> {
    fn pulse(&self) -> PulseFuture<'_> {
        if self.is_disposed() {
            return Box::pin(async { false });
        }
        let ping = self.seed().ping();
        Box::pin(async move { ping.await.is_ok() })
    }

    /// The first failure half-closes the node, reaching the threshold closes it, and a success
    /// reopens it fully
    fn pulse_result(&self, healthy: bool, consecutive_failures: u32) {
        if self.is_disposed() {
            return;
        }
        if healthy {
            self.set_half_closed(false);
            self.set_closed(false);
        } else {
            if !self.is_half_closed() {
                log::warn!("Heartbeat to {} failed", self.endpoint);
            }
            self.set_half_closed(true);
            if consecutive_failures >= self.failure_threshold {
                self.set_closed(true);
            }
        }
    }
}
