/*
 * Copyright 2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Sentinel-driven topology.
//!
//! The manager asks the sentinels who the master and slaves of the named set are, keeps one
//! client per data node, and routes commands through the master/slave groups.  One sentinel is
//! subscribed to for failover and health events; when that subscription ends another sentinel is
//! tried.  Separately the current master is subscribed to on the hello channel, through which
//! sentinels announce themselves.
//!
//! Topology failures are logged and absorbed; callers only see them as routing failures.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures_util::StreamExt;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::{
    client::{AsyncClient, PubsubMessage, SubscriptionListener},
    config::{Endpoint, Settings},
    error::{self, ConnectionReason, Error},
    heartbeat::{HeartbeatProbe, HeartbeatService, ProbeId},
    protocol::{Command, Reply, ReplyKind},
    role::Role,
    topology::{
        message::{HelloMessage, SentinelEvent, SentinelMessage, HELLO_CHANNEL},
        ms_group::MsGroup,
        node::{Node, Seed},
        sentinel_group::{SentinelGroup, SentinelSeed},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Member {
    Data,
    Sentinel,
}

/// One entry of a `SENTINEL replicas` or `SENTINEL sentinels` reply
#[derive(Debug)]
struct Instance {
    endpoint: Endpoint,
    flags: String,
}

impl Instance {
    fn has_flag(&self, flag: &str) -> bool {
        self.flags.split(',').any(|f| f == flag)
    }
}

#[derive(Debug)]
struct Topology {
    master: Endpoint,
    slaves: Vec<Instance>,
    sentinels: Vec<Instance>,
}

fn master_endpoint(master_name: &str, reply: &Reply) -> Result<Endpoint, Error> {
    match reply {
        Reply::Array(parts) if parts.is_empty() => Err(error::unexpected(format!(
            "Sentinel does not know master {}",
            master_name
        ))),
        Reply::Array(parts) => match (
            parts.first().and_then(Reply::as_str),
            parts.get(1).and_then(Reply::as_str).and_then(|p| p.parse().ok()),
        ) {
            (Some(host), Some(port)) => Ok(Endpoint::new(host, port)),
            _ => Err(error::unexpected(format!(
                "Malformed master address for {}: {:?}",
                master_name, parts
            ))),
        },
        other => Err(error::unexpected(format!(
            "Unexpected master address reply: {:?}",
            other
        ))),
    }
}

/// Each instance is a flat list of alternating field names and values
fn instances(reply: &Reply) -> Result<Vec<Instance>, Error> {
    let entries = match reply {
        Reply::Array(entries) => entries,
        other => {
            return Err(error::unexpected(format!(
                "Unexpected instance list: {:?}",
                other
            )))
        }
    };
    let mut found = Vec::with_capacity(entries.len());
    for entry in entries {
        let fields = match entry {
            Reply::Array(fields) => fields,
            other => return Err(error::unexpected(format!("Unexpected instance: {:?}", other))),
        };
        let (mut ip, mut port, mut flags) = (None, None, "");
        for pair in fields.chunks(2) {
            if let [name, value] = pair {
                match (name.as_str(), value.as_str()) {
                    (Some("ip"), Some(v)) => ip = Some(v),
                    (Some("port"), Some(v)) => port = v.parse::<u16>().ok(),
                    (Some("flags"), Some(v)) => flags = v,
                    _ => (),
                }
            }
        }
        match (ip, port) {
            (Some(ip), Some(port)) => found.push(Instance {
                endpoint: Endpoint::new(ip, port),
                flags: flags.to_string(),
            }),
            _ => log::warn!("Instance without an address ignored: {:?}", fields),
        }
    }
    Ok(found)
}

fn apply_event<S: Seed>(node: &Node<S>, event: SentinelEvent) {
    match event {
        SentinelEvent::SubjectiveDown => node.set_half_closed(true),
        SentinelEvent::SubjectiveUp => node.set_half_closed(false),
        SentinelEvent::ObjectiveDown => node.set_closed(true),
        SentinelEvent::ObjectiveUp => {
            node.set_closed(false);
            node.set_half_closed(false);
        }
        SentinelEvent::SwitchMaster | SentinelEvent::NewSentinel => (),
    }
}

struct ManagerInner {
    settings: Arc<Settings>,
    sentinel_settings: Arc<Settings>,
    master_name: Arc<str>,
    handle: Handle,
    heartbeat: HeartbeatService,
    data: MsGroup<AsyncClient>,
    sentinels: SentinelGroup,
    probes: Mutex<HashMap<(Member, Endpoint), ProbeId>>,
    started: AtomicBool,
    stop: CancellationToken,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl ManagerInner {
    fn lock_probes(&self) -> MutexGuard<'_, HashMap<(Member, Endpoint), ProbeId>> {
        match self.probes.lock() {
            Ok(probes) => probes,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn watch<S: Seed>(&self, member: Member, node: &Arc<Node<S>>) {
        if !self.settings.heartbeat_enabled {
            return;
        }
        let key = (member, node.endpoint().clone());
        let mut probes = self.lock_probes();
        if probes.contains_key(&key) {
            return;
        }
        let probe: Arc<dyn HeartbeatProbe> = node.clone();
        let id = self
            .heartbeat
            .register(Arc::downgrade(&probe), self.settings.heartbeat_interval);
        probes.insert(key, id);
    }

    fn unwatch(&self, member: Member, endpoint: &Endpoint) {
        if let Some(id) = self.lock_probes().remove(&(member, endpoint.clone())) {
            self.heartbeat.unregister(id);
        }
    }

    fn data_client(&self, endpoint: Endpoint) -> AsyncClient {
        AsyncClient::for_endpoint(endpoint, self.settings.clone(), self.handle.clone())
    }

    fn data_node(&self, endpoint: Endpoint, role: Role) -> Arc<Node<AsyncClient>> {
        Arc::new(Node::new(
            Arc::new(self.data_client(endpoint)),
            true,
            role,
            self.settings.heartbeat_failure_threshold,
        ))
    }

    fn sentinel_node(&self, endpoint: Endpoint) -> Arc<Node<SentinelSeed>> {
        let client =
            AsyncClient::for_endpoint(endpoint, self.sentinel_settings.clone(), self.handle.clone());
        Arc::new(Node::new(
            Arc::new(SentinelSeed::new(client)),
            true,
            Role::Sentinel,
            self.settings.heartbeat_failure_threshold,
        ))
    }

    fn add_sentinel(&self, endpoint: &Endpoint) {
        if self.sentinels.nodes().contains(endpoint) {
            return;
        }
        let node = self.sentinel_node(endpoint.clone());
        if self.sentinels.nodes().add(node.clone()) {
            log::info!("Discovered sentinel {} for {}", endpoint, self.master_name);
            self.watch(Member::Sentinel, &node);
        } else {
            node.dispose();
        }
    }

    fn sentinel_command(&self, subcommand: &str) -> Command {
        Command::new("SENTINEL")
            .arg(subcommand)
            .arg(&*self.master_name)
            .requires(Role::Sentinel)
            .expect(ReplyKind::Array)
    }

    async fn query_topology(&self, sentinel: &AsyncClient) -> Result<Topology, Error> {
        let master = sentinel
            .execute_async(self.sentinel_command("get-master-addr-by-name"))
            .await?;
        let master = master_endpoint(&self.master_name, &master)?;
        let slaves = sentinel
            .execute_async(self.sentinel_command("replicas"))
            .await?;
        let sentinels = sentinel
            .execute_async(self.sentinel_command("sentinels"))
            .await?;
        Ok(Topology {
            master,
            slaves: instances(&slaves)?,
            sentinels: instances(&sentinels)?,
        })
    }

    /// The node for `endpoint` in `role`, reusing the live node when there is one
    fn adopt(&self, endpoint: &Endpoint, role: Role) -> Arc<Node<AsyncClient>> {
        match self.data.find(endpoint) {
            Some(node) => {
                node.set_role(role);
                if node.seed().is_disposed() {
                    if let Err(e) = node.swap_seed(Arc::new(self.data_client(endpoint.clone())), true) {
                        log::warn!("Cannot renew the connection to {}: {}", endpoint, e);
                    }
                }
                node
            }
            None => self.data_node(endpoint.clone(), role),
        }
    }

    /// Install a freshly queried topology.  Nodes surviving the refresh keep their connections;
    /// nodes no longer listed are disposed.
    fn apply(&self, topology: Topology) {
        let master = self.adopt(&topology.master, Role::Master);
        let slaves: Vec<_> = topology
            .slaves
            .iter()
            .filter(|instance| instance.endpoint != topology.master)
            .map(|instance| {
                let node = self.adopt(&instance.endpoint, Role::Slave);
                if instance.has_flag("o_down") || instance.has_flag("disconnected") {
                    node.set_closed(true);
                } else if instance.has_flag("s_down") {
                    node.set_half_closed(true);
                }
                node
            })
            .collect();

        let mut keep: HashSet<Endpoint> = slaves.iter().map(|n| n.endpoint().clone()).collect();
        keep.insert(master.endpoint().clone());
        self.watch(Member::Data, &master);
        for node in &slaves {
            self.watch(Member::Data, node);
        }
        log::info!(
            "{} topology: master {}, {} slaves",
            self.master_name,
            master.endpoint(),
            slaves.len()
        );

        let previous_masters = self.data.masters().replace_all(vec![master]);
        let previous_slaves = self.data.slaves().replace_all(slaves);
        for node in previous_masters.into_iter().chain(previous_slaves) {
            if !keep.contains(node.endpoint()) {
                log::info!("{} left the topology of {}", node.endpoint(), self.master_name);
                self.unwatch(Member::Data, node.endpoint());
                node.dispose();
            }
        }

        for sentinel in &topology.sentinels {
            self.add_sentinel(&sentinel.endpoint);
        }
    }

    async fn refresh(&self) -> Result<(), Error> {
        let mut last_error = Error::Connection(ConnectionReason::NoReachableNode);
        for _ in 0..self.sentinels.nodes().len() {
            let node = match self.sentinels.nodes().select() {
                Some(node) => node,
                None => break,
            };
            match self.query_topology(node.seed().client()).await {
                Ok(topology) => {
                    self.apply(topology);
                    return Ok(());
                }
                Err(e) => {
                    log::warn!(
                        "Sentinel {} could not describe {}: {}",
                        node.endpoint(),
                        self.master_name,
                        e
                    );
                    if e.is_transport() {
                        node.set_half_closed(true);
                    }
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Connect to `endpoint` to learn its role.  If that fails the node is still created, in
    /// `fallback` role and half-closed.
    async fn discover(&self, endpoint: &Endpoint, fallback: Role) -> Arc<Node<AsyncClient>> {
        let client = self.data_client(endpoint.clone());
        let (role, reachable) = match client.connect().await {
            Ok(()) => match client.role() {
                role @ (Role::Master | Role::Slave) => (role, true),
                _ => (fallback, true),
            },
            Err(e) => {
                log::warn!("Could not probe the role of {}: {}", endpoint, e);
                (fallback, false)
            }
        };
        let node = Arc::new(Node::new(
            Arc::new(client),
            true,
            role,
            self.settings.heartbeat_failure_threshold,
        ));
        if !reachable {
            node.set_half_closed(true);
        }
        node
    }

    async fn known_or_discovered(&self, endpoint: &Endpoint, fallback: Role) -> Arc<Node<AsyncClient>> {
        if let Some(node) = self.data.find(endpoint) {
            return node;
        }
        let node = self.discover(endpoint, fallback).await;
        if self.data.insert(node.clone()) {
            log::info!("Discovered {} {}", node.role(), endpoint);
            self.watch(Member::Data, &node);
            node
        } else {
            node.dispose();
            self.data.find(endpoint).unwrap_or(node)
        }
    }

    async fn switch_master(&self, old: &Endpoint, new: &Endpoint) {
        let discovered = if self.data.find(new).is_some() {
            None
        } else {
            Some(self.discover(new, Role::Master).await)
        };
        let spare = discovered.clone();
        match self.data.change_master(old, new, move |_| discovered) {
            Some(promoted) => {
                log::info!(
                    "Master of {} switched from {} to {}",
                    self.master_name,
                    old,
                    new
                );
                self.watch(Member::Data, &promoted);
                if let Some(spare) = spare.filter(|s| !Arc::ptr_eq(s, &promoted)) {
                    spare.dispose();
                }
            }
            None => log::warn!("Could not promote {} to master of {}", new, self.master_name),
        }
    }

    async fn handle_message(&self, msg: SentinelMessage) {
        if !msg.concerns(&self.master_name) {
            log::debug!("Ignoring {} for another master", msg.event.channel());
            return;
        }
        log::info!(
            "Sentinel event {} for {} {}",
            msg.event.channel(),
            msg.role,
            msg.endpoint
        );
        match msg.event {
            SentinelEvent::SwitchMaster => {
                if let Some(old) = &msg.old_master {
                    self.switch_master(old, &msg.endpoint).await;
                }
            }
            SentinelEvent::NewSentinel => self.add_sentinel(&msg.endpoint),
            event if msg.role == Role::Sentinel => {
                if let Some(node) = self.sentinels.nodes().find(&msg.endpoint) {
                    apply_event(&node, event);
                }
            }
            event => {
                let node = self.known_or_discovered(&msg.endpoint, msg.role).await;
                apply_event(&node, event);
            }
        }
    }

    fn handle_hello(&self, hello: HelloMessage) {
        if hello.master_name != *self.master_name {
            return;
        }
        self.add_sentinel(&hello.sentinel);
    }

    async fn dispatch(&self, msg: PubsubMessage) {
        if msg.channel == HELLO_CHANNEL {
            match HelloMessage::parse(&msg.payload) {
                Ok(hello) => self.handle_hello(hello),
                Err(e) => log::warn!("Ignoring hello message: {}", e),
            }
        } else {
            match SentinelMessage::parse(&msg.channel, &msg.payload) {
                Ok(parsed) => self.handle_message(parsed).await,
                Err(e) => log::warn!("Ignoring sentinel message: {}", e),
            }
        }
    }

    /// Reopen every sentinel once all of them are closed, so monitoring can start over
    fn reopen_sentinels(&self) {
        for node in self.sentinels.nodes().nodes() {
            node.set_closed(false);
        }
    }

    fn dispose(&self) {
        self.stop.cancel();
        for (_, id) in self.lock_probes().drain() {
            self.heartbeat.unregister(id);
        }
        self.sentinels.dispose();
        self.data.dispose();
    }
}

/// Wait one heartbeat interval.  Returns `true` if the manager stopped meanwhile.
async fn pause(stop: &CancellationToken, settings: &Settings) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(settings.heartbeat_interval) => false,
        _ = stop.cancelled() => true,
    }
}

/// Forward messages to the manager until the subscription or the manager ends
async fn consume<M>(
    inner: &Weak<ManagerInner>,
    stop: &CancellationToken,
    mut messages: M,
) where
    M: futures_util::Stream<Item = PubsubMessage> + Unpin,
{
    loop {
        let msg = tokio::select! {
            msg = messages.next() => msg,
            _ = stop.cancelled() => None,
        };
        let (msg, inner) = match (msg, inner.upgrade()) {
            (Some(msg), Some(inner)) => (msg, inner),
            _ => return,
        };
        inner.dispatch(msg).await;
    }
}

async fn monitor_sentinels(inner: Weak<ManagerInner>, stop: CancellationToken) {
    let mut channels = SentinelEvent::channels();
    channels.push(HELLO_CHANNEL);

    while !stop.is_cancelled() {
        let manager = match inner.upgrade() {
            Some(manager) => manager,
            None => return,
        };
        let node = match manager.sentinels.nodes().select() {
            Some(node) => node,
            None => {
                log::warn!("No sentinel of {} can be monitored", manager.master_name);
                manager.reopen_sentinels();
                let settings = manager.settings.clone();
                drop(manager);
                if pause(&stop, &settings).await {
                    return;
                }
                continue;
            }
        };
        let subscribed = SubscriptionListener::subscribe(
            node.endpoint(),
            &manager.sentinel_settings,
            &channels,
            &manager.handle,
        )
        .await;
        let messages = match subscribed {
            Ok((listener, messages)) => {
                log::info!(
                    "Monitoring sentinel {} for {}",
                    node.endpoint(),
                    manager.master_name
                );
                manager.sentinels.set_monitored(&node, listener);
                messages
            }
            Err(e) => {
                log::warn!("Cannot subscribe to sentinel {}: {}", node.endpoint(), e);
                node.set_closed(true);
                continue;
            }
        };
        drop(manager);

        consume(&inner, &stop, messages).await;

        if stop.is_cancelled() {
            return;
        }
        log::warn!("Lost the subscription to sentinel {}", node.endpoint());
        if let Some(manager) = inner.upgrade() {
            manager.sentinels.clear_monitored();
        }
        node.set_closed(true);
    }
}

async fn listen_hello(inner: Weak<ManagerInner>, stop: CancellationToken) {
    while !stop.is_cancelled() {
        let manager = match inner.upgrade() {
            Some(manager) => manager,
            None => return,
        };
        let master = match manager.data.masters().select() {
            Some(master) => master,
            None => {
                let settings = manager.settings.clone();
                drop(manager);
                if pause(&stop, &settings).await {
                    return;
                }
                continue;
            }
        };
        let subscribed = SubscriptionListener::subscribe(
            master.endpoint(),
            &manager.settings,
            &[HELLO_CHANNEL],
            &manager.handle,
        )
        .await;
        let settings = manager.settings.clone();
        drop(manager);

        match subscribed {
            Ok((listener, messages)) => {
                log::debug!("Listening for sentinels on {}", master.endpoint());
                consume(&inner, &stop, messages).await;
                listener.close();
            }
            Err(e) => log::debug!("Cannot listen for sentinels on {}: {}", master.endpoint(), e),
        }
        if pause(&stop, &settings).await {
            return;
        }
    }
}

/// Routes commands to the master and slaves of one sentinel-monitored set, following failovers.
///
/// Writes go to the master (or to a slave when no master is reachable and `slave_as_master` is
/// set); commands marked read-only prefer slaves.  A command failing on a dead connection is
/// tried on the next route before the caller sees `NoReachableNode`.
#[derive(Clone)]
pub struct SentinelManager {
    inner: Arc<ManagerInner>,
}

impl SentinelManager {
    /// A manager for the sentinels at `settings.endpoints()`, monitoring `settings.master_name`.
    /// Nodes are probed by `heartbeat` when heartbeats are enabled.
    pub fn new(
        settings: Arc<Settings>,
        handle: Handle,
        heartbeat: HeartbeatService,
    ) -> Result<SentinelManager, Error> {
        settings.validate()?;
        let master_name = settings.require_master_name()?;
        let mut sentinel_settings = (*settings).clone();
        sentinel_settings.db(-1);

        let inner = Arc::new(ManagerInner {
            data: MsGroup::new(settings.slave_as_master),
            sentinels: SentinelGroup::new(),
            sentinel_settings: Arc::new(sentinel_settings),
            master_name,
            handle,
            heartbeat,
            probes: Mutex::new(HashMap::new()),
            started: AtomicBool::new(false),
            stop: CancellationToken::new(),
            settings,
        });
        for endpoint in inner.settings.endpoints() {
            inner.add_sentinel(endpoint);
        }
        Ok(SentinelManager { inner })
    }

    pub fn master_name(&self) -> &str {
        &self.inner.master_name
    }

    /// Learn the topology from the sentinels, then start following their events
    pub async fn start(&self) -> Result<(), Error> {
        self.refresh().await?;
        if !self.inner.started.swap(true, Ordering::AcqRel) {
            let weak = Arc::downgrade(&self.inner);
            let stop = self.inner.stop.clone();
            self.inner
                .handle
                .spawn(monitor_sentinels(weak.clone(), stop.clone()));
            self.inner.handle.spawn(listen_hello(weak, stop));
        }
        Ok(())
    }

    /// Ask the sentinels for the current topology and install it.  Each sentinel is tried in
    /// turn until one answers.
    pub async fn refresh(&self) -> Result<(), Error> {
        self.inner.refresh().await
    }

    /// Apply one sentinel event
    pub async fn handle_message(&self, msg: SentinelMessage) {
        self.inner.handle_message(msg).await
    }

    pub fn handle_hello(&self, hello: HelloMessage) {
        self.inner.handle_hello(hello)
    }

    pub fn masters(&self) -> Vec<Endpoint> {
        endpoints(&self.inner.data.masters().nodes())
    }

    pub fn slaves(&self) -> Vec<Endpoint> {
        endpoints(&self.inner.data.slaves().nodes())
    }

    pub fn sentinels(&self) -> Vec<Endpoint> {
        endpoints(&self.inner.sentinels.nodes().nodes())
    }

    /// The sentinel whose events are being followed, if any
    pub fn monitored_sentinel(&self) -> Option<Endpoint> {
        self.inner
            .sentinels
            .monitored()
            .filter(|node| node.seed().is_monitoring())
            .map(|node| node.endpoint().clone())
    }

    pub fn set_slave_as_master(&self, enabled: bool) {
        self.inner.data.set_slave_as_master(enabled);
    }

    /// The client a command would be routed to right now
    pub fn client_for(&self, read_only: bool) -> Result<Arc<AsyncClient>, Error> {
        self.inner.data.route(read_only).map(|node| node.seed())
    }

    /// Run a command on the node it routes to, blocking until the reply arrives.  Must not be
    /// called from a runtime thread.
    pub fn execute(&self, command: Command) -> Result<Reply, Error> {
        let read_only = command.is_read_only();
        let mut tried = HashSet::new();
        loop {
            let node = self.inner.data.route_excluding(read_only, &tried)?;
            tried.insert(node.endpoint().clone());
            match node.seed().execute(command.clone()) {
                Err(e) if e.is_transport() => {
                    log::warn!("{} failed on {}: {}", read_only_label(read_only), node.endpoint(), e);
                    node.set_half_closed(true);
                }
                result => return result,
            }
        }
    }

    pub fn execute_async(
        &self,
        command: Command,
    ) -> impl Future<Output = Result<Reply, Error>> + Send + 'static {
        let manager = self.clone();
        async move {
            let read_only = command.is_read_only();
            let mut tried = HashSet::new();
            loop {
                let node = manager.inner.data.route_excluding(read_only, &tried)?;
                tried.insert(node.endpoint().clone());
                let reply = node.seed().execute_async(command.clone());
                match reply.await {
                    Err(e) if e.is_transport() => {
                        log::warn!(
                            "{} failed on {}: {}",
                            read_only_label(read_only),
                            node.endpoint(),
                            e
                        );
                        node.set_half_closed(true);
                    }
                    result => return result,
                }
            }
        }
    }

    /// Stop following the sentinels and dispose every node
    pub fn dispose(&self) {
        self.inner.dispose();
    }
}

fn read_only_label(read_only: bool) -> &'static str {
    if read_only {
        "Read"
    } else {
        "Write"
    }
}

fn endpoints<S: Seed>(nodes: &[Arc<Node<S>>]) -> Vec<Endpoint> {
    nodes.iter().map(|node| node.endpoint().clone()).collect()
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::{
        config::{Endpoint, Settings},
        error::{ConnectionReason, Error},
        heartbeat::HeartbeatService,
        protocol::{Command, RespValue},
        testing::MockServer,
        topology::message::SentinelMessage,
    };

    use super::SentinelManager;

    fn instance(endpoint: &Endpoint, flags: &str) -> RespValue {
        let port = endpoint.port().to_string();
        resp_array![
            "name",
            endpoint.to_string(),
            "ip",
            endpoint.host(),
            "port",
            port.as_str(),
            "flags",
            flags
        ]
    }

    async fn sentinel(master: Endpoint, slaves: Vec<Endpoint>) -> MockServer {
        let server = MockServer::start().await;
        server.set_role("sentinel");
        server.respond("SENTINEL", move |args| {
            match args[1].to_ascii_lowercase().as_str() {
                "get-master-addr-by-name" => {
                    resp_array![master.host(), master.port().to_string()]
                }
                "replicas" => RespValue::Array(
                    slaves.iter().map(|s| instance(s, "slave")).collect(),
                ),
                _ => RespValue::Array(vec![]),
            }
        });
        server
    }

    fn manager(sentinels: &[&MockServer]) -> SentinelManager {
        manager_on(tokio::runtime::Handle::current(), sentinels)
    }

    fn manager_on(handle: tokio::runtime::Handle, sentinels: &[&MockServer]) -> SentinelManager {
        let mut settings = Settings::new(sentinels.iter().map(|s| s.endpoint()));
        settings
            .master_name("mymaster")
            .heartbeat(false, Duration::from_millis(50))
            .connect_timeout(Duration::from_millis(500))
            .command_timeout(Duration::from_secs(2));
        SentinelManager::new(
            Arc::new(settings),
            handle,
            HeartbeatService::new(Duration::from_millis(200)),
        )
        .unwrap()
    }

    /// Nothing listens here
    fn dead_endpoint() -> Endpoint {
        Endpoint::new("127.0.0.1", 1)
    }

    async fn eventually<F: Fn() -> bool>(check: F) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    fn switch(old: &Endpoint, new: &Endpoint) -> SentinelMessage {
        SentinelMessage::parse(
            "+switch-master",
            &format!(
                "mymaster {} {} {} {}",
                old.host(),
                old.port(),
                new.host(),
                new.port()
            ),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_requires_master_name() {
        let settings = Settings::new(vec![Endpoint::new("127.0.0.1", 26379)]);
        match SentinelManager::new(
            Arc::new(settings),
            tokio::runtime::Handle::current(),
            HeartbeatService::new(Duration::from_secs(1)),
        ) {
            Err(Error::MissingParameter("master_name")) => (),
            other => panic!("Unexpected: {:?}", other.map(|m| m.masters())),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_builds_topology() {
        let master = MockServer::start().await;
        let slave = MockServer::start().await;
        slave.set_role("slave");
        let sentinel = sentinel(master.endpoint(), vec![slave.endpoint()]).await;
        let manager = manager(&[&sentinel]);

        manager.start().await.unwrap();
        assert_eq!(manager.masters(), vec![master.endpoint()]);
        assert_eq!(manager.slaves(), vec![slave.endpoint()]);
        assert_eq!(manager.sentinels(), vec![sentinel.endpoint()]);
        assert!(eventually(|| sentinel.subscriber_count("+switch-master") == 1).await);
        assert!(eventually(|| manager.monitored_sentinel() == Some(sentinel.endpoint())).await);

        manager
            .execute_async(Command::new("SET").arg("k").arg("v"))
            .await
            .unwrap();
        manager
            .execute_async(Command::new("GET").arg("k").read_only())
            .await
            .unwrap();
        assert_eq!(master.count("SET"), 1);
        assert_eq!(slave.count("GET"), 1);
        manager.dispose();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_switch_master_swaps_roles() {
        let master = MockServer::start().await;
        let slave = MockServer::start().await;
        slave.set_role("slave");
        let sentinel = sentinel(master.endpoint(), vec![slave.endpoint()]).await;
        let manager = manager(&[&sentinel]);
        manager.refresh().await.unwrap();

        manager
            .handle_message(switch(&master.endpoint(), &slave.endpoint()))
            .await;
        assert_eq!(manager.masters(), vec![slave.endpoint()]);
        assert_eq!(manager.slaves(), vec![master.endpoint()]);

        manager
            .execute_async(Command::new("SET").arg("k").arg("v"))
            .await
            .unwrap();
        assert_eq!(slave.count("SET"), 1);
        assert_eq!(master.count("SET"), 0);
        manager.dispose();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_switch_to_unknown_master_discovers_it() {
        let master = MockServer::start().await;
        let slave = MockServer::start().await;
        slave.set_role("slave");
        let stranger = MockServer::start().await;
        let sentinel = sentinel(master.endpoint(), vec![slave.endpoint()]).await;
        let manager = manager(&[&sentinel]);
        manager.refresh().await.unwrap();

        manager
            .handle_message(switch(&master.endpoint(), &stranger.endpoint()))
            .await;
        assert_eq!(manager.masters(), vec![stranger.endpoint()]);
        let mut slaves = manager.slaves();
        slaves.sort();
        let mut expected = vec![slave.endpoint(), master.endpoint()];
        expected.sort();
        assert_eq!(slaves, expected);
        // The role probe connected to it
        assert_eq!(stranger.connections(), 1);
        manager.dispose();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_published_switch_is_followed() {
        let master = MockServer::start().await;
        let slave = MockServer::start().await;
        slave.set_role("slave");
        let sentinel = sentinel(master.endpoint(), vec![slave.endpoint()]).await;
        let manager = manager(&[&sentinel]);
        manager.start().await.unwrap();
        assert!(eventually(|| sentinel.subscriber_count("+switch-master") == 1).await);

        let payload = format!(
            "mymaster 127.0.0.1 {} 127.0.0.1 {}",
            master.endpoint().port(),
            slave.endpoint().port()
        );
        assert_eq!(sentinel.publish("+switch-master", &payload), 1);
        assert!(eventually(|| manager.masters() == vec![slave.endpoint()]).await);

        // Another master's failover is ignored
        sentinel.publish(
            "+switch-master",
            &format!(
                "othermaster 127.0.0.1 {} 127.0.0.1 {}",
                slave.endpoint().port(),
                master.endpoint().port()
            ),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.masters(), vec![slave.endpoint()]);
        manager.dispose();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_down_events_steer_routing() {
        let master = MockServer::start().await;
        let slave = MockServer::start().await;
        slave.set_role("slave");
        let sentinel = sentinel(master.endpoint(), vec![slave.endpoint()]).await;
        let manager = manager(&[&sentinel]);
        manager.refresh().await.unwrap();

        let about_slave = format!(
            "slave {0} 127.0.0.1 {1} @ mymaster 127.0.0.1 {2}",
            slave.endpoint(),
            slave.endpoint().port(),
            master.endpoint().port()
        );
        manager
            .handle_message(SentinelMessage::parse("+odown", &about_slave).unwrap())
            .await;
        assert_eq!(
            manager.client_for(true).unwrap().endpoint(),
            &master.endpoint()
        );

        manager
            .handle_message(SentinelMessage::parse("-odown", &about_slave).unwrap())
            .await;
        assert_eq!(
            manager.client_for(true).unwrap().endpoint(),
            &slave.endpoint()
        );

        let about_master = format!("master mymaster 127.0.0.1 {} #quorum 1/1", master.endpoint().port());
        manager
            .handle_message(SentinelMessage::parse("+odown", &about_master).unwrap())
            .await;
        match manager.client_for(false) {
            Err(Error::Connection(ConnectionReason::NoReachableNode)) => (),
            other => panic!("Unexpected: {:?}", other.map(|c| c.endpoint().clone())),
        }
        manager.set_slave_as_master(true);
        assert_eq!(
            manager.client_for(false).unwrap().endpoint(),
            &slave.endpoint()
        );
        manager.dispose();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_read_falls_back_to_master_when_slave_dies() {
        let master = MockServer::start().await;
        let sentinel = sentinel(master.endpoint(), vec![dead_endpoint()]).await;
        let manager = manager(&[&sentinel]);
        manager.refresh().await.unwrap();
        assert_eq!(manager.slaves(), vec![dead_endpoint()]);

        manager
            .execute_async(Command::new("GET").arg("k").read_only())
            .await
            .unwrap();
        assert_eq!(master.count("GET"), 1);

        // With the master gone too, every route has been tried
        manager.inner.data.masters().nodes()[0].seed().dispose();
        match manager
            .execute_async(Command::new("GET").arg("k").read_only())
            .await
        {
            Err(Error::Connection(ConnectionReason::NoReachableNode)) => (),
            other => panic!("Unexpected: {:?}", other),
        }
        manager.dispose();
    }

    #[test]
    fn test_blocking_read_falls_back_to_master() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let master = MockServer::start_on(&rt);
        let sentinel = rt.block_on(sentinel(master.endpoint(), vec![dead_endpoint()]));
        let manager = manager_on(rt.handle().clone(), &[&sentinel]);
        rt.block_on(manager.refresh()).unwrap();

        manager
            .execute(Command::new("GET").arg("k").read_only())
            .unwrap();
        assert_eq!(master.count("GET"), 1);

        manager
            .execute(Command::new("SET").arg("k").arg("v"))
            .unwrap();
        assert_eq!(master.count("SET"), 1);
        manager.dispose();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_new_sentinels_are_added() {
        let master = MockServer::start().await;
        let sentinel = sentinel(master.endpoint(), vec![]).await;
        let manager = manager(&[&sentinel]);
        manager.refresh().await.unwrap();

        let announced = format!(
            "sentinel 10.0.0.9:26379 10.0.0.9 26379 @ mymaster 127.0.0.1 {}",
            master.endpoint().port()
        );
        manager
            .handle_message(SentinelMessage::parse("+sentinel", &announced).unwrap())
            .await;
        manager.handle_hello(
            crate::topology::message::HelloMessage::parse(&format!(
                "10.0.0.10,26379,abc,1,mymaster,127.0.0.1,{},1",
                master.endpoint().port()
            ))
            .unwrap(),
        );
        manager.handle_hello(
            crate::topology::message::HelloMessage::parse("10.0.0.11,26379,abc,1,other,127.0.0.1,6379,1")
                .unwrap(),
        );
        let sentinels = manager.sentinels();
        assert_eq!(sentinels.len(), 3);
        assert!(sentinels.contains(&Endpoint::new("10.0.0.9", 26379)));
        assert!(sentinels.contains(&Endpoint::new("10.0.0.10", 26379)));
        manager.dispose();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_lost_subscription_moves_to_another_sentinel() {
        let master = MockServer::start().await;
        let first = sentinel(master.endpoint(), vec![]).await;
        let second = sentinel(master.endpoint(), vec![]).await;
        let manager = manager(&[&first, &second]);
        manager.start().await.unwrap();

        assert!(eventually(|| manager.monitored_sentinel().is_some()).await);
        let (lost, other) = if manager.monitored_sentinel() == Some(first.endpoint()) {
            (&first, &second)
        } else {
            (&second, &first)
        };
        lost.kick();
        assert!(eventually(|| other.subscriber_count("+switch-master") == 1).await);
        assert!(eventually(|| manager.monitored_sentinel() == Some(other.endpoint())).await);
        manager.dispose();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unknown_master_fails_start() {
        let sentinel = MockServer::start().await;
        sentinel.set_role("sentinel");
        sentinel.respond("SENTINEL", |_| RespValue::Nil);
        let manager = manager(&[&sentinel]);
        assert!(manager.start().await.is_err());
        assert!(manager.masters().is_empty());
    }
}
