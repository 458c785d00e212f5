/*
 * Copyright 2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Sentinel event messages.
//!
//! Instance events are published as
//! `<instance-type> <name> <ip> <port> [@ <master-name> <master-ip> <master-port>]`, where the
//! `@` part is absent when the instance is itself a master.  `+odown` may carry a trailing
//! `#quorum` token.  `+switch-master` is `<master-name> <old-ip> <old-port> <new-ip> <new-port>`.
//!
//! Sentinels also announce themselves on the hello channel as
//! `ip,port,runid,epoch,mastername,masterip,masterport,masterepoch`.

use std::str::FromStr;

use crate::{config::Endpoint, error::Error, role::Role};

pub const HELLO_CHANNEL: &str = "__sentinel__:hello";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentinelEvent {
    SubjectiveDown,
    SubjectiveUp,
    ObjectiveDown,
    ObjectiveUp,
    SwitchMaster,
    NewSentinel,
}

impl SentinelEvent {
    pub const ALL: [SentinelEvent; 6] = [
        SentinelEvent::SubjectiveDown,
        SentinelEvent::SubjectiveUp,
        SentinelEvent::ObjectiveDown,
        SentinelEvent::ObjectiveUp,
        SentinelEvent::SwitchMaster,
        SentinelEvent::NewSentinel,
    ];

    pub fn channel(self) -> &'static str {
        match self {
            SentinelEvent::SubjectiveDown => "+sdown",
            SentinelEvent::SubjectiveUp => "-sdown",
            SentinelEvent::ObjectiveDown => "+odown",
            SentinelEvent::ObjectiveUp => "-odown",
            SentinelEvent::SwitchMaster => "+switch-master",
            SentinelEvent::NewSentinel => "+sentinel",
        }
    }

    pub fn from_channel(channel: &str) -> Option<SentinelEvent> {
        SentinelEvent::ALL
            .iter()
            .copied()
            .find(|event| event.channel() == channel)
    }

    /// Every channel a monitoring connection subscribes to
    pub fn channels() -> Vec<&'static str> {
        SentinelEvent::ALL.iter().map(|e| e.channel()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentinelMessage {
    pub event: SentinelEvent,
    /// The type of the instance the event is about
    pub role: Role,
    pub name: String,
    /// The instance the event is about; for `+switch-master` the new master
    pub endpoint: Endpoint,
    pub master_name: Option<String>,
    pub master: Option<Endpoint>,
    /// Only set for `+switch-master`
    pub old_master: Option<Endpoint>,
}

fn parse_error(what: &str, payload: &str) -> Error {
    Error::CorruptResponse(format!("Malformed {} message: {:?}", what, payload), None)
}

fn endpoint(host: &str, port: &str) -> Option<Endpoint> {
    let port = u16::from_str(port).ok()?;
    if host.is_empty() {
        None
    } else {
        Some(Endpoint::new(host, port))
    }
}

impl SentinelMessage {
    pub fn parse(channel: &str, payload: &str) -> Result<SentinelMessage, Error> {
        let event = SentinelEvent::from_channel(channel)
            .ok_or_else(|| parse_error("sentinel", channel))?;
        let parts: Vec<&str> = payload.split_whitespace().collect();

        if event == SentinelEvent::SwitchMaster {
            return match parts.as_slice() {
                [name, old_ip, old_port, new_ip, new_port, ..] => {
                    let old = endpoint(old_ip, old_port);
                    let new = endpoint(new_ip, new_port);
                    match (old, new) {
                        (Some(old), Some(new)) => Ok(SentinelMessage {
                            event,
                            role: Role::Master,
                            name: name.to_string(),
                            endpoint: new.clone(),
                            master_name: Some(name.to_string()),
                            master: Some(new),
                            old_master: Some(old),
                        }),
                        _ => Err(parse_error(channel, payload)),
                    }
                }
                _ => Err(parse_error(channel, payload)),
            };
        }

        let (kind, name, ip, port, rest) = match parts.as_slice() {
            [kind, name, ip, port, rest @ ..] => (*kind, *name, *ip, *port, rest),
            _ => return Err(parse_error(channel, payload)),
        };
        let role = Role::parse(kind).ok_or_else(|| parse_error(channel, payload))?;
        let instance = endpoint(ip, port).ok_or_else(|| parse_error(channel, payload))?;

        let (master_name, master) = match rest {
            ["@", master_name, master_ip, master_port, ..] => (
                Some(master_name.to_string()),
                Some(endpoint(master_ip, master_port).ok_or_else(|| parse_error(channel, payload))?),
            ),
            _ if role == Role::Master => (Some(name.to_string()), Some(instance.clone())),
            _ => (None, None),
        };

        Ok(SentinelMessage {
            event,
            role,
            name: name.to_string(),
            endpoint: instance,
            master_name,
            master,
            old_master: None,
        })
    }

    /// Whether the message concerns the replicated set named `master_name`
    pub fn concerns(&self, master_name: &str) -> bool {
        self.master_name.as_deref().map_or(true, |name| name == master_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloMessage {
    pub sentinel: Endpoint,
    pub run_id: String,
    pub epoch: u64,
    pub master_name: String,
    pub master: Endpoint,
    pub master_epoch: u64,
}

impl HelloMessage {
    pub fn parse(payload: &str) -> Result<HelloMessage, Error> {
        let parts: Vec<&str> = payload.trim().split(',').collect();
        let parsed = match parts.as_slice() {
            [ip, port, run_id, epoch, master_name, master_ip, master_port, master_epoch] => {
                match (
                    endpoint(ip, port),
                    epoch.parse(),
                    endpoint(master_ip, master_port),
                    master_epoch.parse(),
                ) {
                    (Some(sentinel), Ok(epoch), Some(master), Ok(master_epoch)) => {
                        Some(HelloMessage {
                            sentinel,
                            run_id: run_id.to_string(),
                            epoch,
                            master_name: master_name.to_string(),
                            master,
                            master_epoch,
                        })
                    }
                    _ => None,
                }
            }
            _ => None,
        };
        parsed.ok_or_else(|| parse_error(HELLO_CHANNEL, payload))
    }
}

#[cfg(test)]
mod test {
    use crate::{config::Endpoint, role::Role};

    use super::{HelloMessage, SentinelEvent, SentinelMessage};

    #[test]
    fn test_switch_master() {
        let msg = SentinelMessage::parse(
            "+switch-master",
            "mymaster 127.0.0.1 6379 127.0.0.1 6380",
        )
        .unwrap();
        assert_eq!(msg.event, SentinelEvent::SwitchMaster);
        assert_eq!(msg.name, "mymaster");
        assert_eq!(msg.old_master, Some(Endpoint::new("127.0.0.1", 6379)));
        assert_eq!(msg.endpoint, Endpoint::new("127.0.0.1", 6380));
        assert!(msg.concerns("mymaster"));
        assert!(!msg.concerns("other"));
    }

    #[test]
    fn test_instance_events() {
        let msg = SentinelMessage::parse(
            "+sdown",
            "slave 127.0.0.1:6380 127.0.0.1 6380 @ mymaster 127.0.0.1 6379",
        )
        .unwrap();
        assert_eq!(msg.role, Role::Slave);
        assert_eq!(msg.endpoint, Endpoint::new("127.0.0.1", 6380));
        assert_eq!(msg.master_name.as_deref(), Some("mymaster"));
        assert_eq!(msg.master, Some(Endpoint::new("127.0.0.1", 6379)));

        let msg =
            SentinelMessage::parse("+odown", "master mymaster 127.0.0.1 6379 #quorum 2/2").unwrap();
        assert_eq!(msg.event, SentinelEvent::ObjectiveDown);
        assert_eq!(msg.role, Role::Master);
        assert_eq!(msg.master_name.as_deref(), Some("mymaster"));

        let msg = SentinelMessage::parse(
            "+sentinel",
            "sentinel 10.0.0.5:26379 10.0.0.5 26379 @ mymaster 127.0.0.1 6379",
        )
        .unwrap();
        assert_eq!(msg.role, Role::Sentinel);
        assert_eq!(msg.endpoint, Endpoint::new("10.0.0.5", 26379));
    }

    #[test]
    fn test_malformed() {
        assert!(SentinelMessage::parse("+sdown", "slave x 127.0.0.1").is_err());
        assert!(SentinelMessage::parse("+sdown", "slave x 127.0.0.1 notaport").is_err());
        assert!(SentinelMessage::parse("+tilt", "").is_err());
        assert!(SentinelMessage::parse("+switch-master", "mymaster 1.1.1.1 1").is_err());
    }

    #[test]
    fn test_hello() {
        let hello = HelloMessage::parse(
            "10.0.0.5,26379,4d1e5c5b0a,7,mymaster,127.0.0.1,6379,7",
        )
        .unwrap();
        assert_eq!(hello.sentinel, Endpoint::new("10.0.0.5", 26379));
        assert_eq!(hello.master_name, "mymaster");
        assert_eq!(hello.master, Endpoint::new("127.0.0.1", 6379));
        assert_eq!(hello.epoch, 7);
        assert!(HelloMessage::parse("10.0.0.5,26379").is_err());
    }
}
