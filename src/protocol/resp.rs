/*
 * Copyright 2017-2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! An implementation of the RESP protocol

use std::borrow::Cow;
use std::sync::Arc;

use crate::error::{self, Error};

/// A single RESP value, this owns the data that is read/to-be written to Redis.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RespValue {
    /// A bulk string of length `-1`, distinct from an empty bulk string
    Nil,

    /// Zero, one or more other `RespValue`s.
    Array(Vec<RespValue>),

    /// A bulk string.  In Redis terminology a string is a byte-array, so this is stored as a
    /// vector of `u8`s to allow clients to interpret the bytes as appropriate.
    BulkString(Vec<u8>),

    /// An error from the Redis server
    Error(String),

    /// Redis documentation defines an integer as being a signed 64-bit integer:
    /// https://redis.io/topics/protocol#resp-integers
    Integer(i64),

    SimpleString(String),
}

impl RespValue {
    pub(crate) fn into_result(self) -> Result<RespValue, Error> {
        match self {
            RespValue::Error(string) => Err(Error::Remote(string)),
            x => Ok(x),
        }
    }

    /// The textual content of a simple or bulk string, lossily decoded
    pub fn as_text(&self) -> Option<Cow<'_, str>> {
        match self {
            RespValue::SimpleString(s) => Some(Cow::Borrowed(s)),
            RespValue::BulkString(b) => Some(String::from_utf8_lossy(b)),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, RespValue::Nil)
    }
}

/// Conversion of the handful of raw replies read during connection setup, before a connection is
/// handed to the command engine.  Commands proper are coerced through `Reply`.
pub(crate) trait FromResp: Sized {
    /// An error-typed value is raised as `Error::Remote`
    fn from_resp(resp: RespValue) -> Result<Self, Error> {
        Self::from_resp_int(resp.into_result()?)
    }

    fn from_resp_int(resp: RespValue) -> Result<Self, Error>;
}

impl FromResp for String {
    fn from_resp_int(resp: RespValue) -> Result<String, Error> {
        match resp {
            RespValue::BulkString(ref bytes) => Ok(String::from_utf8_lossy(bytes).into_owned()),
            RespValue::SimpleString(string) => Ok(string),
            _ => Err(error::corrupt("Cannot convert into a string", resp)),
        }
    }
}

impl FromResp for () {
    fn from_resp_int(resp: RespValue) -> Result<(), Error> {
        match resp {
            RespValue::SimpleString(ref string) if string == "OK" => Ok(()),
            _ => Err(error::corrupt("Unexpected value", resp)),
        }
    }
}

/// Macro to create a RESP array, useful for preparing raw requests.  Elements can be any type, or a mixture
/// of types, that satisfy `Into<RespValue>`.
///
/// ```
/// #[macro_use]
/// extern crate redis_failover;
///
/// fn main() {
///     let value = format!("something_{}", 123);
///     resp_array!["SET", "key_name", value];
/// }
/// ```
#[macro_export]
macro_rules! resp_array {
    ($($e:expr),* $(,)?) => {
        {
            $crate::protocol::RespValue::Array(vec![
                $(
                    $e.into(),
                )*
            ])
        }
    }
}

macro_rules! bulk_from {
    ($($t:ty => $conv:expr),* $(,)?) => {
        $(
            impl<'a> From<$t> for RespValue {
                fn from(from: $t) -> RespValue {
                    RespValue::BulkString($conv(from))
                }
            }
        )*
    };
}

bulk_from! {
    String => |s: String| s.into_bytes(),
    &'a String => |s: &String| s.as_bytes().to_vec(),
    &'a str => |s: &str| s.as_bytes().to_vec(),
    &'a [u8] => |b: &[u8]| b.to_vec(),
    Vec<u8> => |b: Vec<u8>| b,
    Arc<str> => |s: Arc<str>| s.as_bytes().to_vec(),
}

impl From<i64> for RespValue {
    fn from(from: i64) -> RespValue {
        RespValue::Integer(from)
    }
}

#[cfg(test)]
mod test {
    use crate::error::Error;

    use super::{FromResp, RespValue};

    #[test]
    fn test_remote_error_surfaces() {
        let res = String::from_resp(RespValue::Error("ERR wrong".into()));
        match res {
            Err(Error::Remote(msg)) => assert_eq!(msg, "ERR wrong"),
            other => panic!("Unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_ok_into_unit() {
        assert!(<()>::from_resp(RespValue::SimpleString("OK".into())).is_ok());
        match <()>::from_resp(RespValue::SimpleString("QUEUED".into())) {
            Err(Error::CorruptResponse(_, _)) => (),
            other => panic!("Unexpected: {:?}", other),
        }
    }
}
