/*
 * Copyright 2020-2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

mod decode;
mod encode;

use std::io;

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{error::Error, protocol::resp::RespValue};

pub(crate) use decode::decode;
pub(crate) use encode::{encode, encode_command};

/// Codec to read and write frames on connections driven through `Framed`, i.e. subscription
/// connections.  Command connections use `client::socket` with the same decoder.
pub struct RespCodec;

impl Decoder for RespCodec {
    type Item = RespValue;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match decode(buf, 0)? {
            None => Ok(None),
            Some((pos, item)) => {
                buf.advance(pos);
                Ok(Some(item))
            }
        }
    }
}

impl Encoder<RespValue> for RespCodec {
    type Error = io::Error;

    fn encode(&mut self, msg: RespValue, buf: &mut BytesMut) -> Result<(), Self::Error> {
        encode(&msg, buf);
        Ok(())
    }
}
