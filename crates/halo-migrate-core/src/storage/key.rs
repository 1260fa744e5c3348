//! Primary key encoding and timestamps.
//!
//! Keys are encoded so that byte order equals value order, which lets sled
//! range scans walk a table in primary key order. Each value is a tag byte
//! followed by its payload:
//!
//! - ints: big-endian with the sign bit flipped
//! - floats: IEEE bits, sign-adjusted for total order
//! - text and bytes: `0x00` escaped as `0x00 0xff`, terminated by `0x00 0x00`

use crate::catalog::Value;
use crate::error::{Error, Result};

const TAG_NULL: u8 = 0x00;
const TAG_BOOL: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_FLOAT: u8 = 0x03;
const TAG_TEXT: u8 = 0x04;
const TAG_BYTES: u8 = 0x05;

/// Encode key values into an order-preserving byte string.
pub fn encode_key(values: &[Value]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(values.len() * 9);
    for value in values {
        match value {
            Value::Null => buf.push(TAG_NULL),
            Value::Bool(b) => {
                buf.push(TAG_BOOL);
                buf.push(u8::from(*b));
            }
            Value::Int(i) => {
                buf.push(TAG_INT);
                buf.extend_from_slice(&((*i as u64) ^ (1 << 63)).to_be_bytes());
            }
            Value::Float(f) => {
                buf.push(TAG_FLOAT);
                let bits = f.to_bits();
                let ordered = if bits >> 63 == 1 { !bits } else { bits ^ (1 << 63) };
                buf.extend_from_slice(&ordered.to_be_bytes());
            }
            Value::Text(s) => {
                buf.push(TAG_TEXT);
                escape_into(&mut buf, s.as_bytes());
            }
            Value::Bytes(b) => {
                buf.push(TAG_BYTES);
                escape_into(&mut buf, b);
            }
        }
    }
    buf
}

fn escape_into(buf: &mut Vec<u8>, bytes: &[u8]) {
    for &b in bytes {
        buf.push(b);
        if b == 0 {
            buf.push(0xff);
        }
    }
    buf.extend_from_slice(&[0, 0]);
}

/// Decode a key produced by [`encode_key`].
pub fn decode_key(mut bytes: &[u8]) -> Result<Vec<Value>> {
    let mut values = Vec::new();
    while let Some((&tag, rest)) = bytes.split_first() {
        bytes = rest;
        let value = match tag {
            TAG_NULL => Value::Null,
            TAG_BOOL => {
                let (&b, rest) = bytes.split_first().ok_or(Error::InvalidKey)?;
                bytes = rest;
                Value::Bool(b != 0)
            }
            TAG_INT => {
                let raw = take_u64(&mut bytes)?;
                Value::Int((raw ^ (1 << 63)) as i64)
            }
            TAG_FLOAT => {
                let raw = take_u64(&mut bytes)?;
                let bits = if raw >> 63 == 1 { raw ^ (1 << 63) } else { !raw };
                Value::Float(f64::from_bits(bits))
            }
            TAG_TEXT => {
                let raw = unescape(&mut bytes)?;
                Value::Text(String::from_utf8(raw).map_err(|_| Error::InvalidKey)?)
            }
            TAG_BYTES => Value::Bytes(unescape(&mut bytes)?),
            _ => return Err(Error::InvalidKey),
        };
        values.push(value);
    }
    Ok(values)
}

fn take_u64(bytes: &mut &[u8]) -> Result<u64> {
    if bytes.len() < 8 {
        return Err(Error::InvalidKey);
    }
    let (head, rest) = bytes.split_at(8);
    *bytes = rest;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(head);
    Ok(u64::from_be_bytes(raw))
}

fn unescape(bytes: &mut &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut i = 0;
    loop {
        match (bytes.get(i), bytes.get(i + 1)) {
            (Some(0), Some(0)) => {
                *bytes = &bytes[i + 2..];
                return Ok(out);
            }
            (Some(0), Some(0xff)) => {
                out.push(0);
                i += 2;
            }
            (Some(&b), _) if b != 0 => {
                out.push(b);
                i += 1;
            }
            _ => return Err(Error::InvalidKey),
        }
    }
}

/// Render key bytes for messages, falling back to hex.
pub fn render_key(bytes: &[u8]) -> String {
    match decode_key(bytes) {
        Ok(values) => values
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", "),
        Err(_) => hex::encode(bytes),
    }
}

/// Get the current timestamp in microseconds since Unix epoch.
pub fn current_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
