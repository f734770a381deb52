//! Serial framing.
//!
//! The radio frames every protobuf payload as
//!
//! ```text
//! 0x94 0xC3 <len:u16be> <payload[len]>
//! ```
//!
//! with payloads capped at [`MAX_PAYLOAD`] bytes. The stream side of this
//! module is deliberately forgiving: radios emit log text and boot noise on
//! the same port, so anything that is not a well-formed frame is skipped by
//! scanning forward to the next start byte. A corrupt frame never faults the
//! stream; it only shows up in the [`FrameReader::take_skipped`] counter.
use std::fmt;

use thiserror::Error;

/// First start byte of a frame.
pub const START1: u8 = 0x94;
/// Second start byte of a frame.
pub const START2: u8 = 0xc3;
/// Maximum frame payload size in bytes.
pub const MAX_PAYLOAD: usize = 512;
/// Frame header size: two start bytes and a big-endian length.
pub const HEADER_SIZE: usize = 4;

#[derive(Error, Debug)]
pub enum Error {
    /// Outbound payload too large to frame.
    #[error("payload of {0} bytes exceeds maximum frame size of {MAX_PAYLOAD}")]
    Oversize(usize),
}

/// Wrap a payload in the device framing.
pub fn frame(payload: &[u8]) -> Result<Vec<u8>, Error> {
    if payload.len() > MAX_PAYLOAD {
        return Err(Error::Oversize(payload.len()));
    }
    let mut framed = Vec::with_capacity(HEADER_SIZE + payload.len());
    framed.push(START1);
    framed.push(START2);
    framed.push((payload.len() >> 8) as u8);
    framed.push((payload.len() & 0xff) as u8);
    framed.extend_from_slice(payload);

    Ok(framed)
}

/// Incremental frame decoder over a byte stream.
///
/// Feed bytes with [`FrameReader::input`] and drain complete payloads with
/// [`FrameReader::decode_next`].
#[derive(Default)]
pub struct FrameReader {
    unparsed: Vec<u8>,
    /// Bytes discarded while scanning for a frame start.
    skipped: usize,
}

impl fmt::Debug for FrameReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FrameReader {{ buffered: {}, skipped: {} }}",
            self.unparsed.len(),
            self.skipped
        )
    }
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Input bytes into the decoder.
    pub fn input(&mut self, bytes: &[u8]) {
        self.unparsed.extend_from_slice(bytes);
    }

    /// Decode and return the next payload. Returns [`None`] if no complete
    /// frame is buffered yet.
    pub fn decode_next(&mut self) -> Option<Vec<u8>> {
        loop {
            // Scan to the next start byte, discarding inter-frame noise.
            match self.unparsed.iter().position(|b| *b == START1) {
                Some(0) => {}
                Some(start) => {
                    self.skipped += start;
                    self.unparsed.drain(..start);
                }
                None => {
                    self.skipped += self.unparsed.len();
                    self.unparsed.clear();
                    return None;
                }
            }
            if self.unparsed.len() < 2 {
                return None;
            }
            if self.unparsed[1] != START2 {
                // A stray start byte; resynchronize one byte further on.
                self.skipped += 1;
                self.unparsed.drain(..1);
                continue;
            }
            if self.unparsed.len() < HEADER_SIZE {
                return None;
            }
            let len = usize::from(self.unparsed[2]) << 8 | usize::from(self.unparsed[3]);
            if len > MAX_PAYLOAD {
                // Corrupt length; drop the start bytes and rescan.
                self.skipped += 2;
                self.unparsed.drain(..2);
                continue;
            }
            if self.unparsed.len() < HEADER_SIZE + len {
                return None;
            }
            let payload = self.unparsed[HEADER_SIZE..HEADER_SIZE + len].to_vec();
            self.unparsed.drain(..HEADER_SIZE + len);

            return Some(payload);
        }
    }

    /// Number of non-frame bytes discarded since the last call.
    pub fn take_skipped(&mut self) -> usize {
        std::mem::take(&mut self.skipped)
    }
}

impl Iterator for FrameReader {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        self.decode_next()
    }
}
