/*
 * Copyright 2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Server roles and modes, and how they are read out of `ROLE`/`INFO` replies

use std::fmt;

use crate::{
    config::Endpoint,
    error::{self, Error},
    protocol::RespValue,
};

/// The replication role of a server.  `Undefined` is both "not yet discovered" for a connection
/// and "no requirement" for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Undefined,
    Master,
    Slave,
    Sentinel,
}

impl Role {
    pub fn parse(s: &str) -> Option<Role> {
        match s.trim().to_ascii_lowercase().as_str() {
            "master" => Some(Role::Master),
            "slave" | "replica" => Some(Role::Slave),
            "sentinel" => Some(Role::Sentinel),
            _ => None,
        }
    }

    /// Whether a connection in role `self` can serve a command requiring `required`.  An
    /// undiscovered role never conflicts.
    pub fn serves(self, required: Role) -> bool {
        match (required, self) {
            (Role::Undefined, _) | (_, Role::Undefined) => true,
            (required, actual) => required == actual,
        }
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            Role::Undefined => 0,
            Role::Master => 1,
            Role::Slave => 2,
            Role::Sentinel => 3,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Role {
        match v {
            1 => Role::Master,
            2 => Role::Slave,
            3 => Role::Sentinel,
            _ => Role::Undefined,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Role::Undefined => "undefined",
            Role::Master => "master",
            Role::Slave => "slave",
            Role::Sentinel => "sentinel",
        })
    }
}

/// How the server is deployed, as reported by `INFO server`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMode {
    Standalone,
    Cluster,
    Sentinel,
}

/// A range of hash slots and the endpoint of the master owning it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
    pub master: Endpoint,
}

/// The first element of a `ROLE` reply names the role
pub(crate) fn role_from_resp(value: &RespValue) -> Result<Role, Error> {
    let first = match value {
        RespValue::Array(items) => items.first(),
        _ => None,
    };
    first
        .and_then(|v| v.as_text())
        .and_then(|s| Role::parse(&s))
        .ok_or_else(|| error::corrupt("Unrecognised ROLE reply", value.clone()))
}

/// Look up `key:value` in the text of an `INFO` reply
pub(crate) fn info_field<'a>(info: &'a str, key: &str) -> Option<&'a str> {
    info.lines()
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| line.split_once(':'))
        .find(|(k, _)| k.trim() == key)
        .map(|(_, v)| v.trim())
}

pub(crate) fn role_from_info(info: &str) -> Option<Role> {
    info_field(info, "role").and_then(Role::parse)
}

pub(crate) fn mode_from_info(info: &str) -> Option<ServerMode> {
    match info_field(info, "redis_mode")? {
        "standalone" => Some(ServerMode::Standalone),
        "cluster" => Some(ServerMode::Cluster),
        "sentinel" => Some(ServerMode::Sentinel),
        _ => None,
    }
}

/// Parse a `CLUSTER SLOTS` reply: `[[start, end, [ip, port, id?], replicas...], ...]`
pub(crate) fn slots_from_resp(value: RespValue) -> Result<Vec<SlotRange>, Error> {
    let ranges = match value {
        RespValue::Array(ranges) => ranges,
        other => return Err(error::corrupt("CLUSTER SLOTS reply is not an array", other)),
    };
    let mut slots = Vec::with_capacity(ranges.len());
    for range in ranges {
        let parsed = match &range {
            RespValue::Array(parts) if parts.len() >= 3 => match (&parts[0], &parts[1], &parts[2]) {
                (RespValue::Integer(start), RespValue::Integer(end), RespValue::Array(master))
                    if master.len() >= 2 =>
                {
                    let host = master[0].as_text().map(|h| h.into_owned());
                    let port = match &master[1] {
                        RespValue::Integer(p) => u16::try_from(*p).ok(),
                        other => other.as_text().and_then(|p| p.parse().ok()),
                    };
                    match (host, port, u16::try_from(*start), u16::try_from(*end)) {
                        (Some(host), Some(port), Ok(start), Ok(end)) => Some(SlotRange {
                            start,
                            end,
                            master: Endpoint::new(host, port),
                        }),
                        _ => None,
                    }
                }
                _ => None,
            },
            _ => None,
        };
        match parsed {
            Some(slot) => slots.push(slot),
            None => return Err(error::corrupt("Malformed CLUSTER SLOTS entry", range)),
        }
    }
    Ok(slots)
}
