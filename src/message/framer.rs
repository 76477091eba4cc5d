//! Binary message frame.
//!
//! Frames use Avro single-object encoding:
//!
//! ```text
//! C3 01 | fingerprint (8 bytes, little endian) | tstamp: long | msg: bytes
//! ```
//!
//! `long` is a zig-zag varint; `bytes` is a `long` length followed by the raw
//! bytes. The fingerprint is the CRC-64-AVRO (Rabin) fingerprint of the
//! record schema's canonical form and only guards wire compatibility.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::encoding::{decode_varint, encode_varint, encoded_len_varint};

use crate::error::{Error, Result};

/// Single-object encoding marker
pub const MARKER: [u8; 2] = [0xC3, 0x01];

/// Parsing canonical form of the message record schema
pub const MESSAGE_SCHEMA: &str = r#"{"name":"jp.ad.sinet.sinetstream.Message","type":"record","fields":[{"name":"tstamp","type":"long"},{"name":"msg","type":"bytes"}]}"#;

const HEADER_LEN: usize = MARKER.len() + 8;

const EMPTY: u64 = 0xc15d_213a_a4d7_a795;

const FP_TABLE: [u64; 256] = {
    let mut table = [0u64; 256];
    let mut i = 0;
    while i < 256 {
        let mut fp = i as u64;
        let mut j = 0;
        while j < 8 {
            fp = (fp >> 1) ^ (EMPTY & (0u64.wrapping_sub(fp & 1)));
            j += 1;
        }
        table[i] = fp;
        i += 1;
    }
    table
};

/// CRC-64-AVRO fingerprint of `data`
pub fn fingerprint64(data: &[u8]) -> u64 {
    data.iter().fold(EMPTY, |fp, &b| {
        (fp >> 8) ^ FP_TABLE[((fp ^ b as u64) & 0xff) as usize]
    })
}

fn zigzag(n: i64) -> u64 {
    ((n << 1) ^ (n >> 63)) as u64
}

fn unzigzag(n: u64) -> i64 {
    ((n >> 1) as i64) ^ -((n & 1) as i64)
}

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFrame {
    pub fingerprint: [u8; 8],
    /// Epoch milliseconds
    pub timestamp: i64,
    pub payload: Bytes,
}

/// Encoder/decoder bound to one schema. Holds no per-message state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageFramer {
    fingerprint: [u8; 8],
}

impl Default for MessageFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageFramer {
    pub fn new() -> Self {
        Self::with_schema(MESSAGE_SCHEMA)
    }

    /// Framer for another canonical schema with the same record layout
    pub fn with_schema(canonical_schema: &str) -> Self {
        Self {
            fingerprint: fingerprint64(canonical_schema.as_bytes()).to_le_bytes(),
        }
    }

    pub fn fingerprint(&self) -> [u8; 8] {
        self.fingerprint
    }

    pub fn encode(&self, timestamp: i64, payload: &[u8]) -> Bytes {
        let tstamp = zigzag(timestamp);
        let length = zigzag(payload.len() as i64);
        let mut buf = BytesMut::with_capacity(
            HEADER_LEN + encoded_len_varint(tstamp) + encoded_len_varint(length) + payload.len(),
        );

        buf.put_slice(&MARKER);
        buf.put_slice(&self.fingerprint);
        encode_varint(tstamp, &mut buf);
        encode_varint(length, &mut buf);
        buf.put_slice(payload);
        buf.freeze()
    }

    /// Decode a whole frame. Any violation rejects the frame as a unit.
    pub fn decode(&self, frame: &[u8]) -> Result<MessageFrame> {
        if frame.len() < HEADER_LEN {
            return Err(Error::invalid_message(format!(
                "frame of {} bytes is shorter than its header",
                frame.len()
            )));
        }
        if frame[..MARKER.len()] != MARKER {
            return Err(Error::invalid_message("missing single-object marker"));
        }
        let fingerprint = &frame[MARKER.len()..HEADER_LEN];
        if fingerprint != &self.fingerprint[..] {
            return Err(Error::invalid_message(format!(
                "schema fingerprint {:016x} does not match {:016x}",
                u64::from_le_bytes(fingerprint.try_into().unwrap_or_default()),
                u64::from_le_bytes(self.fingerprint)
            )));
        }

        let mut body = &frame[HEADER_LEN..];
        let timestamp = decode_varint(&mut body)
            .map(unzigzag)
            .map_err(|_| Error::invalid_message("truncated or oversized tstamp"))?;
        let length = decode_varint(&mut body)
            .map(unzigzag)
            .map_err(|_| Error::invalid_message("truncated or oversized msg length"))?;
        let length = usize::try_from(length)
            .map_err(|_| Error::invalid_message(format!("negative msg length {}", length)))?;
        if length > body.remaining() {
            return Err(Error::invalid_message(format!(
                "msg declares {} bytes, {} remain",
                length,
                body.remaining()
            )));
        }
        let payload = Bytes::copy_from_slice(&body[..length]);
        body.advance(length);
        if body.has_remaining() {
            return Err(Error::invalid_message(format!(
                "{} trailing bytes after record",
                body.remaining()
            )));
        }

        Ok(MessageFrame {
            fingerprint: self.fingerprint,
            timestamp,
            payload,
        })
    }
}
