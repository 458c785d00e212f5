/*
 * Copyright 2020-2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

use std::cmp;

use bytes::{BufMut, BytesMut};

use crate::protocol::{command::Command, resp::RespValue};

const DEFAULT_MESSAGE_SIZE: usize = 1024;

fn check_and_reserve(buf: &mut BytesMut, amt: usize) {
    let remaining_bytes = buf.capacity() - buf.len();
    if remaining_bytes < amt {
        buf.reserve(cmp::max(amt, DEFAULT_MESSAGE_SIZE));
    }
}

fn write_rn(buf: &mut BytesMut) {
    buf.put_slice(b"\r\n");
}

fn write_simple_string(symb: u8, string: &str, buf: &mut BytesMut) {
    let bytes = string.as_bytes();
    check_and_reserve(buf, 1 + bytes.len() + 2);
    buf.put_u8(symb);
    buf.put_slice(bytes);
    write_rn(buf);
}

fn write_header(symb: u8, len: i64, buf: &mut BytesMut) {
    let len_as_string = len.to_string();
    let len_as_bytes = len_as_string.as_bytes();
    check_and_reserve(buf, 1 + len_as_bytes.len() + 2);
    buf.put_u8(symb);
    buf.put_slice(len_as_bytes);
    write_rn(buf);
}

fn encode_bulkstring(bstr: &[u8], buf: &mut BytesMut) {
    write_header(b'$', bstr.len() as i64, buf);
    check_and_reserve(buf, bstr.len() + 2);
    buf.put_slice(bstr);
    write_rn(buf);
}

pub(crate) fn encode(msg: &RespValue, buf: &mut BytesMut) {
    match msg {
        RespValue::Nil => write_header(b'$', -1, buf),
        RespValue::Array(ary) => {
            write_header(b'*', ary.len() as i64, buf);
            for v in ary {
                encode(v, buf);
            }
        }
        RespValue::BulkString(bstr) => encode_bulkstring(bstr, buf),
        RespValue::Error(string) => write_simple_string(b'-', string, buf),
        RespValue::Integer(val) => write_header(b':', *val, buf),
        RespValue::SimpleString(string) => write_simple_string(b'+', string, buf),
    }
}

/// A request is always an array of bulk strings: the command name followed by its arguments.
pub(crate) fn encode_command(cmd: &Command, buf: &mut BytesMut) {
    write_header(b'*', 1 + cmd.args().len() as i64, buf);
    encode_bulkstring(cmd.name(), buf);
    for arg in cmd.args() {
        encode_bulkstring(arg, buf);
    }
}
