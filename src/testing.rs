/*
 * Copyright 2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Test doubles: a scripted RESP server, and an in-memory seed for exercising the topology layer
//! without sockets.
//!
//! Each mock server connection is served by the crate's own codec; replies come from per-command
//! responders, falling back to canned answers for the commands a client issues while connecting.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;

use crate::{
    config::Endpoint,
    error,
    protocol::{RespCodec, RespValue},
    role::Role,
    topology::node::{PingFuture, Seed},
};

type Responder = Arc<dyn Fn(&[String]) -> RespValue + Send + Sync>;

struct MockState {
    commands: Vec<Vec<String>>,
    responders: HashMap<String, Responder>,
    close_on: HashSet<String>,
    role: String,
    mode: String,
    subscribers: Vec<(String, mpsc::UnboundedSender<RespValue>)>,
    kick: CancellationToken,
    connections: usize,
}

pub(crate) struct MockServer {
    endpoint: Endpoint,
    state: Arc<Mutex<MockState>>,
    shutdown: CancellationToken,
}

impl MockServer {
    pub(crate) async fn start() -> MockServer {
        let _ = env_logger::builder().is_test(true).try_init();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(MockState {
            commands: Vec::new(),
            responders: HashMap::new(),
            close_on: HashSet::new(),
            role: "master".into(),
            mode: "standalone".into(),
            subscribers: Vec::new(),
            kick: CancellationToken::new(),
            connections: 0,
        }));
        let shutdown = CancellationToken::new();

        let accept_state = state.clone();
        let accept_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let stream = tokio::select! {
                    res = listener.accept() => match res {
                        Ok((stream, _)) => stream,
                        Err(_) => return,
                    },
                    _ = accept_shutdown.cancelled() => return,
                };
                let kick = {
                    let mut state = accept_state.lock().unwrap();
                    state.connections += 1;
                    state.kick.clone()
                };
                tokio::spawn(serve(stream, accept_state.clone(), kick, accept_shutdown.clone()));
            }
        });

        MockServer {
            endpoint: Endpoint::new("127.0.0.1", addr.port()),
            state,
            shutdown,
        }
    }

    /// Start on a runtime from outside it, for tests driving blocking calls
    pub(crate) fn start_on(runtime: &tokio::runtime::Runtime) -> MockServer {
        runtime.block_on(MockServer::start())
    }

    pub(crate) fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    /// Every command received so far, excluding connection handshakes
    pub(crate) fn commands(&self) -> Vec<Vec<String>> {
        self.state
            .lock()
            .unwrap()
            .commands
            .iter()
            .filter(|cmd| !is_handshake(cmd))
            .cloned()
            .collect()
    }

    pub(crate) fn count(&self, name: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .commands
            .iter()
            .filter(|cmd| cmd[0].eq_ignore_ascii_case(name))
            .count()
    }

    pub(crate) fn connections(&self) -> usize {
        self.state.lock().unwrap().connections
    }

    pub(crate) fn respond<F>(&self, name: &str, responder: F)
    where
        F: Fn(&[String]) -> RespValue + Send + Sync + 'static,
    {
        self.state
            .lock()
            .unwrap()
            .responders
            .insert(name.to_ascii_uppercase(), Arc::new(responder));
    }

    /// Drop the connection instead of answering `name`
    pub(crate) fn close_on(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .close_on
            .insert(name.to_ascii_uppercase());
    }

    pub(crate) fn set_role(&self, role: &str) {
        self.state.lock().unwrap().role = role.into();
    }

    pub(crate) fn set_mode(&self, mode: &str) {
        self.state.lock().unwrap().mode = mode.into();
    }

    /// Deliver a message to every connection subscribed to `channel`
    pub(crate) fn publish(&self, channel: &str, payload: &str) -> usize {
        let mut state = self.state.lock().unwrap();
        state.subscribers.retain(|(_, tx)| !tx.is_closed());
        let mut delivered = 0;
        for (subscribed, tx) in &state.subscribers {
            if subscribed == channel {
                let msg = resp_array!["message", channel, payload];
                if tx.send(msg).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    pub(crate) fn subscriber_count(&self, channel: &str) -> usize {
        let mut state = self.state.lock().unwrap();
        state.subscribers.retain(|(_, tx)| !tx.is_closed());
        state.subscribers.iter().filter(|(c, _)| c == channel).count()
    }

    /// Drop every open connection; the server keeps accepting new ones
    pub(crate) fn kick(&self) {
        let mut state = self.state.lock().unwrap();
        state.kick.cancel();
        state.kick = CancellationToken::new();
        state.subscribers.clear();
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn is_handshake(cmd: &[String]) -> bool {
    match cmd[0].to_ascii_uppercase().as_str() {
        "AUTH" | "ROLE" => true,
        "CLIENT" => cmd.get(1).map_or(false, |s| s.eq_ignore_ascii_case("SETNAME")),
        "INFO" => true,
        "CLUSTER" => cmd.get(1).map_or(false, |s| s.eq_ignore_ascii_case("SLOTS")),
        _ => false,
    }
}

fn to_args(value: RespValue) -> Option<Vec<String>> {
    match value {
        RespValue::Array(items) => items
            .into_iter()
            .map(|item| item.as_text().map(|s| s.into_owned()))
            .collect(),
        _ => None,
    }
}

fn default_reply(state: &MockState, args: &[String]) -> RespValue {
    match args[0].to_ascii_uppercase().as_str() {
        "PING" => match args.get(1) {
            Some(msg) => RespValue::BulkString(msg.clone().into_bytes()),
            None => RespValue::SimpleString("PONG".into()),
        },
        "ECHO" => RespValue::BulkString(args.get(1).cloned().unwrap_or_default().into_bytes()),
        "ROLE" => resp_array![state.role.as_str(), RespValue::Integer(0), RespValue::Array(vec![])],
        "INFO" => {
            let info = match args.get(1).map(|s| s.to_ascii_lowercase()) {
                Some(ref section) if section == "replication" => {
                    format!("# Replication\r\nrole:{}\r\n", state.role)
                }
                _ => format!("# Server\r\nredis_version:7.2.0\r\nredis_mode:{}\r\n", state.mode),
            };
            RespValue::BulkString(info.into_bytes())
        }
        "GET" => RespValue::Nil,
        "EXISTS" | "DEL" | "INCR" => RespValue::Integer(1),
        _ => RespValue::SimpleString("OK".into()),
    }
}

async fn serve(
    stream: TcpStream,
    state: Arc<Mutex<MockState>>,
    kick: CancellationToken,
    shutdown: CancellationToken,
) {
    let mut framed = RespCodec.framed(stream);
    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel();
    loop {
        let request = tokio::select! {
            req = framed.next() => req,
            Some(msg) = msg_rx.recv() => {
                if framed.send(msg).await.is_err() {
                    return;
                }
                continue;
            }
            _ = kick.cancelled() => return,
            _ = shutdown.cancelled() => return,
        };
        let args = match request.and_then(|r| r.ok()).and_then(to_args) {
            Some(args) if !args.is_empty() => args,
            _ => return,
        };
        let name = args[0].to_ascii_uppercase();

        let (replies, responder) = {
            let mut state = state.lock().unwrap();
            state.commands.push(args.clone());
            if state.close_on.contains(&name) {
                return;
            }
            if name == "SUBSCRIBE" {
                let confirmations = args[1..]
                    .iter()
                    .enumerate()
                    .map(|(i, channel)| {
                        state.subscribers.push((channel.clone(), msg_tx.clone()));
                        resp_array!["subscribe", channel.as_str(), RespValue::Integer(i as i64 + 1)]
                    })
                    .collect();
                (confirmations, None)
            } else {
                match state.responders.get(&name).cloned() {
                    Some(responder) => (Vec::new(), Some(responder)),
                    None => (vec![default_reply(&state, &args)], None),
                }
            }
        };
        // Responders may be slow, so they run without the state lock held
        let replies = match responder {
            Some(responder) => vec![responder(&args)],
            None => replies,
        };
        for reply in replies {
            if framed.send(reply).await.is_err() {
                return;
            }
        }
    }
}

/// A seed with no connection behind it; pings succeed while it is marked healthy
pub(crate) struct FakeSeed {
    endpoint: Endpoint,
    healthy: AtomicBool,
    pings: AtomicUsize,
    role: AtomicU8,
    closed: AtomicBool,
    half_closed: AtomicBool,
    disposed: AtomicBool,
}

impl FakeSeed {
    pub(crate) fn new(endpoint: &str) -> FakeSeed {
        FakeSeed {
            endpoint: endpoint.parse().unwrap(),
            healthy: AtomicBool::new(true),
            pings: AtomicUsize::new(0),
            role: AtomicU8::new(Role::Undefined.to_u8()),
            closed: AtomicBool::new(false),
            half_closed: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    pub(crate) fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub(crate) fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub(crate) fn role(&self) -> Role {
        Role::from_u8(self.role.load(Ordering::SeqCst))
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn is_half_closed(&self) -> bool {
        self.half_closed.load(Ordering::SeqCst)
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl Seed for FakeSeed {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn ping(&self) -> PingFuture {
        self.pings.fetch_add(1, Ordering::SeqCst);
        let healthy = self.healthy.load(Ordering::SeqCst) && !self.is_disposed();
        let endpoint = self.endpoint.clone();
        Box::pin(async move {
            if healthy {
                Ok(())
            } else {
                Err(error::unexpected(format!("{} is unhealthy", endpoint)))
            }
        })
    }

    fn is_down(&self) -> bool {
        self.is_closed() || self.is_disposed()
    }

    fn role(&self) -> Role {
        FakeSeed::role(self)
    }

    fn set_role(&self, role: Role) {
        self.role.store(role.to_u8(), Ordering::SeqCst);
    }

    fn set_closed(&self, closed: bool) {
        self.closed.store(closed, Ordering::SeqCst);
    }

    fn set_half_closed(&self, half_closed: bool) {
        self.half_closed.store(half_closed, Ordering::SeqCst);
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }
}
