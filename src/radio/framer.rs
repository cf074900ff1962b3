//! Meshtastic stream API framing.
//!
//! Serial and TCP links carry protobuf messages as:
//!
//!   `0x94 0xC3 <len hi> <len lo> <protobuf bytes>`
//!
//! Radios also print plain-text debug output on the same link, so the decoder
//! resynchronises on the magic bytes and skips anything in between.
use bytes::{Buf, BytesMut};

pub const START1: u8 = 0x94;
pub const START2: u8 = 0xC3;
/// Largest payload the firmware will emit or accept.
pub const MAX_FRAME_SIZE: usize = 512;
const HEADER_LEN: usize = 4;

/// Prefix `payload` with the stream header.
pub fn encode_frame(payload: &[u8]) -> Option<Vec<u8>> {
    if payload.len() > MAX_FRAME_SIZE {
        return None;
    }
    let len = payload.len() as u16;
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&[START1, START2, (len >> 8) as u8, (len & 0xff) as u8]);
    out.extend_from_slice(payload);
    Some(out)
}

/// Incremental decoder fed with arbitrary chunks.
#[derive(Default)]
pub struct StreamFramer {
    buf: BytesMut,
}

impl StreamFramer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(1024),
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete payload, if one is buffered.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            if self.buf.len() < HEADER_LEN {
                return None;
            }
            if !(self.buf[0] == START1 && self.buf[1] == START2) {
                match self.buf.iter().skip(1).position(|&b| b == START1) {
                    Some(pos) => self.buf.advance(pos + 1),
                    None => {
                        // No start byte anywhere: all of it is noise.
                        self.buf.clear();
                        return None;
                    }
                }
                continue;
            }
            let declared = ((self.buf[2] as usize) << 8) | self.buf[3] as usize;
            if declared == 0 || declared > MAX_FRAME_SIZE {
                self.buf.advance(1);
                continue;
            }
            if self.buf.len() < HEADER_LEN + declared {
                return None;
            }
            self.buf.advance(HEADER_LEN);
            return Some(self.buf.split_to(declared).to_vec());
        }
    }
}
