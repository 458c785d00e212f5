/*
 * Copyright 2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Typed replies.
//!
//! Every `Command` declares the `ReplyKind` it expects, and the raw `RespValue` is coerced into
//! the matching `Reply` variant when the task completes.  A reply whose shape cannot be coerced is
//! a `CorruptResponse`; it is never retried.  Conversions and comparisons between variants are
//! explicit functions rather than operator overloads.

use crate::{
    error::{self, Error},
    protocol::resp::RespValue,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// Keep the natural shape of whatever arrives
    Any,
    Array,
    BulkString,
    Bytes,
    Integer,
    Double,
    NullableInteger,
    NullableDouble,
    Boolean,
    Void,
    ScanCursor,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Array(Vec<Reply>),
    BulkString(Option<String>),
    Bytes(Option<Vec<u8>>),
    Integer(i64),
    Double(f64),
    NullableInteger(Option<i64>),
    NullableDouble(Option<f64>),
    Boolean(bool),
    Error(String),
    Void,
    ScanCursor { cursor: u64, items: Vec<Reply> },
}

fn parse_text<T: std::str::FromStr>(value: &RespValue) -> Option<T> {
    value.as_text().and_then(|s| s.trim().parse().ok())
}

impl Reply {
    /// The natural reading of a raw value
    pub fn from_raw(value: RespValue) -> Reply {
        match value {
            RespValue::Nil => Reply::Bytes(None),
            RespValue::Array(items) => Reply::Array(items.into_iter().map(Reply::from_raw).collect()),
            RespValue::BulkString(bytes) => Reply::Bytes(Some(bytes)),
            RespValue::SimpleString(s) => Reply::BulkString(Some(s)),
            RespValue::Error(s) => Reply::Error(s),
            RespValue::Integer(i) => Reply::Integer(i),
        }
    }

    /// Coerce a raw value into the shape `kind` asks for.  Error replies are always kept as
    /// `Reply::Error`, whatever was expected.
    pub fn from_resp(kind: ReplyKind, value: RespValue) -> Result<Reply, Error> {
        if let RespValue::Error(s) = &value {
            return Ok(Reply::Error(s.clone()));
        }
        let reply = match (kind, &value) {
            (ReplyKind::Any, _) => Some(Reply::from_raw(value.clone())),
            (ReplyKind::Void, _) => Some(Reply::Void),

            (ReplyKind::Array, RespValue::Nil) => Some(Reply::Array(Vec::new())),
            (ReplyKind::Array, RespValue::Array(items)) => Some(Reply::Array(
                items.iter().cloned().map(Reply::from_raw).collect(),
            )),

            (ReplyKind::BulkString, RespValue::Nil) => Some(Reply::BulkString(None)),
            (ReplyKind::BulkString, RespValue::Integer(i)) => {
                Some(Reply::BulkString(Some(i.to_string())))
            }
            (ReplyKind::BulkString, v) => v.as_text().map(|s| Reply::BulkString(Some(s.into_owned()))),

            (ReplyKind::Bytes, RespValue::Nil) => Some(Reply::Bytes(None)),
            (ReplyKind::Bytes, RespValue::BulkString(b)) => Some(Reply::Bytes(Some(b.clone()))),
            (ReplyKind::Bytes, RespValue::SimpleString(s)) => {
                Some(Reply::Bytes(Some(s.as_bytes().to_vec())))
            }

            (ReplyKind::Integer, RespValue::Integer(i)) => Some(Reply::Integer(*i)),
            (ReplyKind::Integer, v) => parse_text(v).map(Reply::Integer),

            (ReplyKind::NullableInteger, RespValue::Nil) => Some(Reply::NullableInteger(None)),
            (ReplyKind::NullableInteger, RespValue::Integer(i)) => {
                Some(Reply::NullableInteger(Some(*i)))
            }
            (ReplyKind::NullableInteger, v) => parse_text(v).map(|i| Reply::NullableInteger(Some(i))),

            (ReplyKind::Double, RespValue::Integer(i)) => Some(Reply::Double(*i as f64)),
            (ReplyKind::Double, v) => parse_text(v).map(Reply::Double),

            (ReplyKind::NullableDouble, RespValue::Nil) => Some(Reply::NullableDouble(None)),
            (ReplyKind::NullableDouble, RespValue::Integer(i)) => {
                Some(Reply::NullableDouble(Some(*i as f64)))
            }
            (ReplyKind::NullableDouble, v) => parse_text(v).map(|d| Reply::NullableDouble(Some(d))),

            (ReplyKind::Boolean, RespValue::Nil) => Some(Reply::Boolean(false)),
            (ReplyKind::Boolean, RespValue::Integer(i)) => Some(Reply::Boolean(*i == 1)),
            (ReplyKind::Boolean, v) => v.as_text().and_then(|s| match &*s {
                "OK" | "1" => Some(Reply::Boolean(true)),
                "0" => Some(Reply::Boolean(false)),
                _ => None,
            }),

            (ReplyKind::ScanCursor, RespValue::Array(parts)) => match parts.as_slice() {
                [cursor, RespValue::Array(items)] => parse_text(cursor).map(|cursor| {
                    Reply::ScanCursor {
                        cursor,
                        items: items.iter().cloned().map(Reply::from_raw).collect(),
                    }
                }),
                _ => None,
            },

            _ => None,
        };
        reply.ok_or_else(|| error::corrupt(format!("Expected a {:?} reply", kind), value))
    }

    /// Turn an error reply into `Error::Remote`
    pub fn into_result(self) -> Result<Reply, Error> {
        match self {
            Reply::Error(s) => Err(Error::Remote(s)),
            reply => Ok(reply),
        }
    }

    pub fn kind(&self) -> Option<ReplyKind> {
        Some(match self {
            Reply::Array(_) => ReplyKind::Array,
            Reply::BulkString(_) => ReplyKind::BulkString,
            Reply::Bytes(_) => ReplyKind::Bytes,
            Reply::Integer(_) => ReplyKind::Integer,
            Reply::Double(_) => ReplyKind::Double,
            Reply::NullableInteger(_) => ReplyKind::NullableInteger,
            Reply::NullableDouble(_) => ReplyKind::NullableDouble,
            Reply::Boolean(_) => ReplyKind::Boolean,
            Reply::Void => ReplyKind::Void,
            Reply::ScanCursor { .. } => ReplyKind::ScanCursor,
            Reply::Error(_) => return None,
        })
    }

    pub fn is_nil(&self) -> bool {
        matches!(
            self,
            Reply::BulkString(None)
                | Reply::Bytes(None)
                | Reply::NullableInteger(None)
                | Reply::NullableDouble(None)
        )
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Reply::BulkString(Some(s)) => Some(s),
            Reply::Bytes(Some(b)) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Reply::Bytes(Some(b)) => Some(b),
            Reply::BulkString(Some(s)) => Some(s.as_bytes()),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Reply::Integer(i) | Reply::NullableInteger(Some(i)) => Some(*i),
            Reply::Boolean(b) => Some(*b as i64),
            Reply::Double(d) | Reply::NullableDouble(Some(d)) if d.fract() == 0.0 => Some(*d as i64),
            _ => self.as_str().and_then(|s| s.trim().parse().ok()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Reply::Double(d) | Reply::NullableDouble(Some(d)) => Some(*d),
            Reply::Integer(i) | Reply::NullableInteger(Some(i)) => Some(*i as f64),
            Reply::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => self.as_str().and_then(|s| s.trim().parse().ok()),
        }
    }

    /// Booleans are integers equal to one
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Reply::Boolean(b) => Some(*b),
            Reply::Void => None,
            other => other.as_i64().map(|i| i == 1),
        }
    }

    pub fn eq_i64(&self, other: i64) -> bool {
        self.as_i64() == Some(other)
    }

    pub fn eq_f64(&self, other: f64) -> bool {
        self.as_f64() == Some(other)
    }

    pub fn eq_bool(&self, other: bool) -> bool {
        self.as_bool() == Some(other)
    }

    pub fn eq_str(&self, other: &str) -> bool {
        match self {
            Reply::BulkString(Some(_)) | Reply::Bytes(Some(_)) => self.as_bytes() == Some(other.as_bytes()),
            Reply::Integer(_) | Reply::NullableInteger(Some(_)) => {
                other.trim().parse().map(|i| self.eq_i64(i)).unwrap_or(false)
            }
            Reply::Double(_) | Reply::NullableDouble(Some(_)) => {
                other.trim().parse().map(|d| self.eq_f64(d)).unwrap_or(false)
            }
            Reply::Boolean(b) => match other {
                "1" | "true" | "OK" => *b,
                "0" | "false" => !*b,
                _ => false,
            },
            Reply::Error(s) => s == other,
            _ => false,
        }
    }
}
