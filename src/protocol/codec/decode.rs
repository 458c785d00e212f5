/*
 * Copyright 2020-2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

use std::str;

use crate::{error::Error, protocol::resp::RespValue};

/// `Ok(None)` means the window holds an incomplete frame and nothing was consumed; otherwise the
/// position just past the frame and the decoded value.
pub(crate) type DecodeResult = Result<Option<(usize, RespValue)>, Error>;

#[inline]
fn parse_error(message: String) -> Error {
    Error::CorruptResponse(message, None)
}

/// Lengths, element counts and integers are all sent as decimal text terminated by `\r\n`.
///
/// Only return the digits if the whole sequence is complete, including the terminator bytes (but those final
/// two bytes will not be returned)
fn scan_integer(buf: &[u8], idx: usize) -> Result<Option<(usize, &[u8])>, Error> {
    let mut at_end = false;
    let mut pos = idx;
    loop {
        if buf.len() <= pos {
            return Ok(None);
        }
        match (at_end, buf[pos]) {
            (true, b'\n') => return Ok(Some((pos + 1, &buf[idx..pos - 1]))),
            (false, b'\r') => at_end = true,
            (false, b'0'..=b'9') | (false, b'-') => (),
            (_, val) => {
                return Err(parse_error(format!(
                    "Unexpected byte in size_string: {}",
                    val
                )));
            }
        }
        pos += 1;
    }
}

fn scan_string(buf: &[u8], idx: usize) -> Option<(usize, String)> {
    let mut at_end = false;
    let mut pos = idx;
    loop {
        if buf.len() <= pos {
            return None;
        }
        match (at_end, buf[pos]) {
            (true, b'\n') => {
                let value = String::from_utf8_lossy(&buf[idx..pos - 1]).into_owned();
                return Some((pos + 1, value));
            }
            (true, b'\r') => (),
            (true, _) => at_end = false,
            (false, b'\r') => at_end = true,
            (false, _) => (),
        }
        pos += 1;
    }
}

fn decode_raw_integer(buf: &[u8], idx: usize) -> Result<Option<(usize, i64)>, Error> {
    let (pos, int_str) = match scan_integer(buf, idx)? {
        None => return Ok(None),
        Some(found) => found,
    };
    let string = str::from_utf8(int_str)
        .map_err(|_| parse_error(format!("Not a valid string: {:?}", int_str)))?;
    match string.parse() {
        Ok(int) => Ok(Some((pos, int))),
        Err(_) => Err(parse_error(format!("Not an integer: {}", string))),
    }
}

fn decode_bulk_string(buf: &[u8], idx: usize) -> DecodeResult {
    match decode_raw_integer(buf, idx)? {
        None => Ok(None),
        Some((pos, -1)) => Ok(Some((pos, RespValue::Nil))),
        Some((pos, size)) if size >= 0 => {
            let size = size as usize;
            let remaining = buf.len() - pos;
            let required_bytes = size + 2;

            if remaining < required_bytes {
                return Ok(None);
            }
            if &buf[pos + size..pos + required_bytes] != b"\r\n" {
                return Err(parse_error("Bulk string not terminated by CRLF".into()));
            }

            let bulk_string = RespValue::BulkString(buf[pos..(pos + size)].to_vec());
            Ok(Some((pos + required_bytes, bulk_string)))
        }
        Some((_, size)) => Err(parse_error(format!("Invalid string size: {}", size))),
    }
}

fn decode_array(buf: &[u8], idx: usize) -> DecodeResult {
    match decode_raw_integer(buf, idx)? {
        None => Ok(None),
        Some((pos, -1)) => Ok(Some((pos, RespValue::Nil))),
        Some((pos, size)) if size >= 0 => {
            let size = size as usize;
            let mut pos = pos;
            let mut values = Vec::with_capacity(size.min(1024));
            for _ in 0..size {
                match decode(buf, pos)? {
                    None => return Ok(None),
                    Some((new_pos, value)) => {
                        values.push(value);
                        pos = new_pos;
                    }
                }
            }
            Ok(Some((pos, RespValue::Array(values))))
        }
        Some((_, size)) => Err(parse_error(format!("Invalid array size: {}", size))),
    }
}

fn decode_integer(buf: &[u8], idx: usize) -> DecodeResult {
    Ok(decode_raw_integer(buf, idx)?.map(|(pos, int)| (pos, RespValue::Integer(int))))
}

/// A simple string is any series of bytes that ends with `\r\n`
fn decode_simple_string(buf: &[u8], idx: usize) -> DecodeResult {
    Ok(scan_string(buf, idx).map(|(pos, string)| (pos, RespValue::SimpleString(string))))
}

fn decode_error(buf: &[u8], idx: usize) -> DecodeResult {
    Ok(scan_string(buf, idx).map(|(pos, string)| (pos, RespValue::Error(string))))
}

/// Decode one frame starting at `idx` of the window.  Never reads beyond the window and never
/// consumes anything when the frame is incomplete.
pub(crate) fn decode(buf: &[u8], idx: usize) -> DecodeResult {
    if buf.len() <= idx {
        return Ok(None);
    }

    let first_byte = buf[idx];
    match first_byte {
        b'$' => decode_bulk_string(buf, idx + 1),
        b'*' => decode_array(buf, idx + 1),
        b':' => decode_integer(buf, idx + 1),
        b'+' => decode_simple_string(buf, idx + 1),
        b'-' => decode_error(buf, idx + 1),
        _ => Err(parse_error(format!("Unexpected byte: {}", first_byte))),
    }
}
