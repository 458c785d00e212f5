/*
 * Copyright 2020-2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Connection settings.  These are consumed read-only, usually shared as `Arc<Settings>`.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{self, Error};

pub const DEFAULT_PORT: u16 = 6379;
pub const DEFAULT_SENTINEL_PORT: u16 = 26379;

/// A host and port.  Two endpoints are the same node when both match exactly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Endpoint {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Parse `host[:port]`, falling back to `default_port`
    pub fn parse_with_default(s: &str, default_port: u16) -> Result<Self, Error> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::MissingParameter("endpoint host"));
        }
        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && !host.ends_with(':') => {
                let port = port
                    .parse()
                    .map_err(|_| error::internal(format!("Invalid port in endpoint: {}", s)))?;
                Ok(Endpoint::new(host.trim_matches(|c| c == '[' || c == ']'), port))
            }
            _ => Ok(Endpoint::new(s, default_port)),
        }
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Endpoint::parse_with_default(s, DEFAULT_PORT)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// How queued commands are drained onto the socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStrategy {
    /// A send pass is spawned on the runtime each time work is queued
    Pool,
    /// Each client runs one dedicated sender thread
    Dedicated,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub(crate) endpoints: Vec<Endpoint>,
    pub(crate) username: Option<Arc<str>>,
    pub(crate) password: Option<Arc<str>>,
    pub(crate) client_name: Option<Arc<str>>,
    pub(crate) db: i64,
    pub(crate) receive_buffer_size: usize,
    pub(crate) send_buffer_size: usize,
    pub(crate) connect_timeout: Duration,
    pub(crate) command_timeout: Duration,
    pub(crate) wait_poll_interval: Duration,
    pub(crate) heartbeat_enabled: bool,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) heartbeat_failure_threshold: u32,
    pub(crate) bulk_send_factor: usize,
    pub(crate) send_strategy: SendStrategy,
    pub(crate) master_name: Option<Arc<str>>,
    pub(crate) slave_as_master: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            endpoints: Vec::new(),
            username: None,
            password: None,
            client_name: None,
            db: -1,
            receive_buffer_size: 16 * 1024,
            send_buffer_size: 16 * 1024,
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(10),
            wait_poll_interval: Duration::from_millis(50),
            heartbeat_enabled: true,
            heartbeat_interval: Duration::from_secs(2),
            heartbeat_failure_threshold: 3,
            bulk_send_factor: 64,
            send_strategy: SendStrategy::Pool,
            master_name: None,
            slave_as_master: false,
        }
    }
}

impl Settings {
    pub fn new<I, E>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<Endpoint>,
    {
        Settings {
            endpoints: endpoints.into_iter().map(Into::into).collect(),
            ..Settings::default()
        }
    }

    /// Parse each of `endpoints` as `host[:port]`
    pub fn parse<S: AsRef<str>>(endpoints: &[S]) -> Result<Self, Error> {
        let endpoints = endpoints
            .iter()
            .map(|s| s.as_ref().parse())
            .collect::<Result<Vec<Endpoint>, _>>()?;
        Ok(Settings::new(endpoints))
    }

    /// As `parse`, but a missing port means the sentinel port rather than the data port
    pub fn parse_sentinels<S: AsRef<str>>(endpoints: &[S], master_name: &str) -> Result<Self, Error> {
        let endpoints = endpoints
            .iter()
            .map(|s| Endpoint::parse_with_default(s.as_ref(), DEFAULT_SENTINEL_PORT))
            .collect::<Result<Vec<Endpoint>, _>>()?;
        let mut settings = Settings::new(endpoints);
        settings.master_name(master_name);
        Ok(settings)
    }

    /// Set the username used when connecting
    pub fn username<V: Into<Arc<str>>>(&mut self, username: V) -> &mut Self {
        self.username = Some(username.into());
        self
    }

    /// Set the password used when connecting
    pub fn password<V: Into<Arc<str>>>(&mut self, password: V) -> &mut Self {
        self.password = Some(password.into());
        self
    }

    pub fn client_name<V: Into<Arc<str>>>(&mut self, name: V) -> &mut Self {
        self.client_name = Some(name.into());
        self
    }

    /// Database selected for commands that don't name one; negative leaves the server default
    pub fn db(&mut self, db: i64) -> &mut Self {
        self.db = db;
        self
    }

    pub fn buffer_sizes(&mut self, receive: usize, send: usize) -> &mut Self {
        self.receive_buffer_size = receive.max(64);
        self.send_buffer_size = send.max(64);
        self
    }

    pub fn connect_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn command_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.command_timeout = timeout;
        self
    }

    /// How often a blocked caller wakes to re-drive the receive pump
    pub fn wait_poll_interval(&mut self, interval: Duration) -> &mut Self {
        self.wait_poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn heartbeat(&mut self, enabled: bool, interval: Duration) -> &mut Self {
        self.heartbeat_enabled = enabled;
        self.heartbeat_interval = interval;
        self
    }

    pub fn heartbeat_failure_threshold(&mut self, threshold: u32) -> &mut Self {
        self.heartbeat_failure_threshold = threshold.max(1);
        self
    }

    /// Maximum number of commands written per network flush
    pub fn bulk_send_factor(&mut self, factor: usize) -> &mut Self {
        self.bulk_send_factor = factor.max(1);
        self
    }

    pub fn send_strategy(&mut self, strategy: SendStrategy) -> &mut Self {
        self.send_strategy = strategy;
        self
    }

    pub fn master_name<V: Into<Arc<str>>>(&mut self, name: V) -> &mut Self {
        self.master_name = Some(name.into());
        self
    }

    /// Allow writes to be routed to slaves when no master is reachable
    pub fn slave_as_master(&mut self, enabled: bool) -> &mut Self {
        self.slave_as_master = enabled;
        self
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.endpoints.is_empty() {
            return Err(Error::MissingParameter("endpoints"));
        }
        Ok(())
    }

    pub(crate) fn require_master_name(&self) -> Result<Arc<str>, Error> {
        self.master_name
            .clone()
            .filter(|name| !name.is_empty())
            .ok_or(Error::MissingParameter("master_name"))
    }
}

impl From<(&str, u16)> for Endpoint {
    fn from((host, port): (&str, u16)) -> Self {
        Endpoint::new(host, port)
    }
}
