/*
 * Copyright 2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

use std::fmt;

use crate::{protocol::reply::ReplyKind, role::Role};

/// Commands at `High` priority are always written before any `Normal` one still queued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// The command produces exactly one reply, which completes the task
    SendReceive,
    /// The command produces no reply; the task completes once written
    SendOnly,
}

/// A single request, built per call and consumed once.
///
/// ```
/// use redis_failover::{Command, Priority, ReplyKind};
///
/// let cmd = Command::new("GET")
///     .arg("key")
///     .db(2)
///     .priority(Priority::High)
///     .expect(ReplyKind::BulkString)
///     .read_only();
/// assert_eq!(cmd.args().len(), 1);
/// ```
#[derive(Clone)]
pub struct Command {
    db: Option<i64>,
    name: Vec<u8>,
    args: Vec<Vec<u8>>,
    priority: Priority,
    mode: SendMode,
    role: Role,
    expected: ReplyKind,
    read_only: bool,
}

impl Command {
    pub fn new(name: impl Into<Vec<u8>>) -> Self {
        Command {
            db: None,
            name: name.into(),
            args: Vec::new(),
            priority: Priority::Normal,
            mode: SendMode::SendReceive,
            role: Role::Undefined,
            expected: ReplyKind::Any,
            read_only: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<Vec<u8>>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn arg_int(self, arg: i64) -> Self {
        self.arg(arg.to_string())
    }

    pub fn extend_args<T: Into<Vec<u8>>>(mut self, args: impl IntoIterator<Item = T>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Target a specific database; a negative index runs against whichever database the
    /// connection is on
    pub fn db(mut self, db: i64) -> Self {
        self.db = if db >= 0 { Some(db) } else { None };
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn send_only(mut self) -> Self {
        self.mode = SendMode::SendOnly;
        self
    }

    pub fn requires(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn expect(mut self, kind: ReplyKind) -> Self {
        self.expected = kind;
        self
    }

    /// Mark the command as safe to route to a slave
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn name(&self) -> &[u8] {
        &self.name
    }

    pub fn args(&self) -> &[Vec<u8>] {
        &self.args
    }

    pub fn target_db(&self) -> Option<i64> {
        self.db
    }

    pub fn get_priority(&self) -> Priority {
        self.priority
    }

    pub fn mode(&self) -> SendMode {
        self.mode
    }

    pub fn required_role(&self) -> Role {
        self.role
    }

    pub fn expected(&self) -> ReplyKind {
        self.expected
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub(crate) fn select(db: i64) -> Command {
        Command::new("SELECT")
            .arg_int(db)
            .priority(Priority::High)
            .expect(ReplyKind::Void)
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // Arguments may carry credentials, so only the name is shown
        f.debug_struct("Command")
            .field("name", &String::from_utf8_lossy(&self.name))
            .field("args", &self.args.len())
            .field("db", &self.db)
            .field("priority", &self.priority)
            .field("mode", &self.mode)
            .field("role", &self.role)
            .finish()
    }
}
