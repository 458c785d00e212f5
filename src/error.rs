/*
 * Copyright 2017-2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Error handling

use std::{error, fmt, io};

use futures_channel::oneshot;

use crate::{protocol::RespValue, task::TaskStatus};

#[derive(Debug)]
pub enum Error {
    /// A non-specific internal error that prevented an operation from completing
    Internal(String),

    /// An IO error occurred
    IO(io::Error),

    /// A reply could not be parsed, or did not match the type the caller expected
    CorruptResponse(String, Option<RespValue>),

    /// A remote error
    Remote(String),

    /// Error creating a connection, or no usable connection is available
    Connection(ConnectionReason),

    /// A timeout or an IO failure while sending or receiving
    Socket(SocketReason),

    /// A command was issued against a node whose role cannot serve it
    NotSupported(String),

    /// A required configuration parameter is absent
    MissingParameter(&'static str),

    /// A task result was read before the task completed
    UncompleteTransaction,

    /// The task was canceled before a reply arrived, e.g. on dispose or transport failure
    Canceled(TaskStatus),

    /// An unexpected error.  In this context "unexpected" means
    /// "unexpected because we check ahead of time", it used to maintain the type signature of
    /// chains of futures; but it occurring at runtime should be considered a catastrophic
    /// failure.
    Unexpected(String),
}

pub(crate) fn internal(msg: impl Into<String>) -> Error {
    Error::Internal(msg.into())
}

pub(crate) fn unexpected(msg: impl Into<String>) -> Error {
    Error::Unexpected(msg.into())
}

pub(crate) fn corrupt(msg: impl Into<String>, resp: RespValue) -> Error {
    Error::CorruptResponse(msg.into(), Some(resp))
}

pub(crate) fn not_supported(msg: impl Into<String>) -> Error {
    Error::NotSupported(msg.into())
}

pub(crate) fn timeout() -> Error {
    Error::Socket(SocketReason::Timeout)
}

impl Error {
    /// `true` for failures of the transport itself, as opposed to failures of a single command
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::IO(_) | Error::Connection(_) | Error::Socket(SocketReason::Io(_))
        )
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::IO(err)
    }
}

impl From<oneshot::Canceled> for Error {
    fn from(err: oneshot::Canceled) -> Error {
        Error::Unexpected(format!("Oneshot was cancelled before use: {}", err))
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::IO(err) => Some(err),
            Error::Socket(SocketReason::Io(err)) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Internal(s) => f.write_str(s),
            Error::IO(err) => fmt::Display::fmt(err, f),
            Error::CorruptResponse(s, Some(resp)) => write!(f, "{}: {:?}", s, resp),
            Error::CorruptResponse(s, None) => f.write_str(s),
            Error::Remote(s) => write!(f, "Remote error: {}", s),
            Error::Connection(reason) => fmt::Display::fmt(reason, f),
            Error::Socket(SocketReason::Timeout) => f.write_str("Timed out waiting for a reply"),
            Error::Socket(SocketReason::Io(err)) => write!(f, "Socket failure: {}", err),
            Error::NotSupported(s) => write!(f, "Not supported: {}", s),
            Error::MissingParameter(p) => write!(f, "Missing configuration parameter: {}", p),
            Error::UncompleteTransaction => f.write_str("Result accessed before completion"),
            Error::Canceled(status) => write!(f, "Task canceled ({:?})", status),
            Error::Unexpected(err) => f.write_str(err),
        }
    }
}

/// Details of a `ConnectionError`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionReason {
    /// The endpoint could not be resolved to an address
    Unresolvable(String),
    /// The endpoint resolved but no connection could be opened
    Unreachable(String),
    /// The connection is not currently connected
    NotConnected,
    /// Every route to a node has been tried and none is usable
    NoReachableNode,
    /// The owner of the connection has been disposed
    Disposed,
}

impl fmt::Display for ConnectionReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConnectionReason::Unresolvable(ep) => write!(f, "Cannot resolve endpoint {}", ep),
            ConnectionReason::Unreachable(ep) => write!(f, "Cannot connect to {}", ep),
            ConnectionReason::NotConnected => f.write_str("Connection has been closed"),
            ConnectionReason::NoReachableNode => f.write_str("No reachable node"),
            ConnectionReason::Disposed => f.write_str("Connection has been disposed"),
        }
    }
}

/// Details of a `SocketError`
#[derive(Debug)]
pub enum SocketReason {
    Timeout,
    Io(io::Error),
}
