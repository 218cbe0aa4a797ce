//! Length-prefixed CBOR framing for the tunnel control stream.
//!
//! Wire format: `[4-byte big-endian length][CBOR payload]`

use crate::error::TunnelResult;
use std::io::Cursor;

/// Encode a serializable value into a length-prefixed CBOR frame.
pub fn frame_encode<T: serde::Serialize>(value: &T) -> TunnelResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(value, &mut payload)?;

    let len = payload.len() as u32;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend(payload);
    Ok(frame)
}

/// Decode a CBOR payload (without length prefix) into a typed value.
pub fn cbor_decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> TunnelResult<T> {
    let cursor = Cursor::new(data);
    let value: T = ciborium::from_reader(cursor)?;
    Ok(value)
}

/// Streaming frame decoder: accumulates bytes and yields complete messages.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
        }
    }

    /// Feed bytes into the decoder and return all complete CBOR-decoded messages.
    pub fn feed<T: serde::de::DeserializeOwned>(&mut self, data: &[u8]) -> TunnelResult<Vec<T>> {
        self.buffer.extend_from_slice(data);
        let mut messages = Vec::new();

        loop {
            if self.buffer.len() < 4 {
                break;
            }
            let len =
                u32::from_be_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]])
                    as usize;

            if self.buffer.len() < 4 + len {
                break;
            }

            let payload = &self.buffer[4..4 + len];
            let msg: T = cbor_decode(payload)?;
            messages.push(msg);

            self.buffer.drain(..4 + len);
        }

        Ok(messages)
    }

    /// Feed raw bytes and return complete raw frames (undecoded CBOR payloads).
    pub fn feed_raw(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(data);
        let mut frames = Vec::new();

        loop {
            if self.buffer.len() < 4 {
                break;
            }
            let len =
                u32::from_be_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]])
                    as usize;

            if self.buffer.len() < 4 + len {
                break;
            }

            let payload = self.buffer[4..4 + len].to_vec();
            frames.push(payload);
            self.buffer.drain(..4 + len);
        }

        frames
    }

    /// Reset internal buffer.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Number of bytes remaining in the internal buffer.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestMsg {
        name: String,
        value: i64,
    }

    #[test]
    fn round_trip_single() {
        let msg = TestMsg {
            name: "hello".into(),
            value: 42,
        };
        let frame = frame_encode(&msg).unwrap();
        let mut decoder = FrameDecoder::new();
        let decoded: Vec<TestMsg> = decoder.feed(&frame).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0], msg);
    }

    #[test]
    fn round_trip_multiple() {
        let msgs = vec![
            TestMsg {
                name: "a".into(),
                value: 1,
            },
            TestMsg {
                name: "b".into(),
                value: 2,
            },
            TestMsg {
                name: "c".into(),
                value: 3,
            },
        ];

        let mut combined = Vec::new();
        for m in &msgs {
            combined.extend(frame_encode(m).unwrap());
        }

        let mut decoder = FrameDecoder::new();
        let decoded: Vec<TestMsg> = decoder.feed(&combined).unwrap();
        assert_eq!(decoded, msgs);
    }

    #[test]
    fn incremental_feed() {
        let msg = TestMsg {
            name: "test".into(),
            value: 99,
        };
        let frame = frame_encode(&msg).unwrap();
        let mut decoder = FrameDecoder::new();

        // Feed one byte at a time
        for i in 0..frame.len() - 1 {
            let decoded: Vec<TestMsg> = decoder.feed(&frame[i..i + 1]).unwrap();
            assert!(decoded.is_empty());
        }
        // Feed last byte
        let decoded: Vec<TestMsg> = decoder.feed(&frame[frame.len() - 1..]).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0], msg);
    }

    #[test]
    fn pending_bytes() {
        let msg = TestMsg {
            name: "x".into(),
            value: 0,
        };
        let frame = frame_encode(&msg).unwrap();
        let mut decoder = FrameDecoder::new();

        decoder.feed_raw(&frame[..3]);
        assert_eq!(decoder.pending(), 3);

        decoder.reset();
        assert_eq!(decoder.pending(), 0);
    }
}
