//! Framed binary protocol over a byte stream.
//!
//! Every message is a fixed 24-byte header followed by exactly
//! `frame_size` payload bytes. The writer flushes after each message; there
//! is no batching and no resynchronisation marker, so a failed write ends
//! the session.
//!
//! ## Wire format
//!
//! ```text
//! magic:         u32  (4)  0xDEADBEEF
//! timestamp_ms:  u32  (4)  ms since the Unix epoch, truncated
//! frame_size:    u32  (4)  payload length
//! width:         u32  (4)
//! height:        u32  (4)
//! pixel_format:  u32  (4)  0 = RGBA, 1 = RGB, 2 = H.264, 3 = zstd units
//! payload:       [u8]      frame_size bytes
//! ```

use std::io::{self, Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::trace;

use crate::error::{CastError, Result};
use crate::pipeline::types::WireFormat;

// ── FrameHeader ──────────────────────────────────────────────────

/// Per-message metadata preceding each payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u32,
    pub timestamp_ms: u32,
    pub frame_size: u32,
    pub width: u32,
    pub height: u32,
    pub pixel_format: u32,
}

impl FrameHeader {
    /// Encoded size on the wire.
    pub const SIZE: usize = 24;

    /// Marks the start of every valid message.
    pub const MAGIC: u32 = 0xDEAD_BEEF;

    /// Header for a payload of `frame_size` bytes stamped with the current
    /// wall-clock time.
    pub fn new(frame_size: u32, width: u32, height: u32, format: WireFormat) -> Self {
        Self {
            magic: Self::MAGIC,
            timestamp_ms: now_ms_truncated(),
            frame_size,
            width,
            height,
            pixel_format: format.code(),
        }
    }

    /// Serialize to bytes (little-endian).
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.timestamp_ms.to_le_bytes());
        buf[8..12].copy_from_slice(&self.frame_size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.width.to_le_bytes());
        buf[16..20].copy_from_slice(&self.height.to_le_bytes());
        buf[20..24].copy_from_slice(&self.pixel_format.to_le_bytes());
        buf
    }

    /// Deserialize from bytes, rejecting a wrong magic value.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(CastError::Truncated {
                what: "frame header",
                needed: Self::SIZE,
                got: data.len(),
            });
        }
        let field = |i: usize| u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
        let magic = field(0);
        if magic != Self::MAGIC {
            return Err(CastError::InvalidMagic(magic));
        }
        Ok(Self {
            magic,
            timestamp_ms: field(4),
            frame_size: field(8),
            width: field(12),
            height: field(16),
            pixel_format: field(20),
        })
    }

    /// The pixel format, if the code is one this build understands.
    pub fn format(&self) -> Option<WireFormat> {
        WireFormat::from_code(self.pixel_format)
    }
}

fn now_ms_truncated() -> u32 {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    ms as u32
}

// ── FrameStreamWriter ────────────────────────────────────────────

/// Writes one framed message per call and flushes.
///
/// Not synchronised: exactly one thread owns the writer.
pub struct FrameStreamWriter<W: Write> {
    out: W,
    messages: u64,
    bytes: u64,
}

impl<W: Write> FrameStreamWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            messages: 0,
            bytes: 0,
        }
    }

    /// Write header and payload as one message, then flush.
    ///
    /// Any short or failed write is returned as an error; the stream
    /// framing is unrecoverable after that.
    pub fn send_frame(
        &mut self,
        payload: &[u8],
        width: u32,
        height: u32,
        format: WireFormat,
    ) -> Result<()> {
        let size = u32::try_from(payload.len()).map_err(|_| {
            CastError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("payload of {} bytes exceeds the u32 size field", payload.len()),
            ))
        })?;
        let header = FrameHeader::new(size, width, height, format);

        self.out
            .write_all(&header.encode())
            .map_err(CastError::from_write)?;
        self.out.write_all(payload).map_err(CastError::from_write)?;
        self.out.flush().map_err(CastError::from_write)?;

        self.messages += 1;
        self.bytes += (FrameHeader::SIZE + payload.len()) as u64;
        trace!(size, width, height, format = format.code(), "message written");
        Ok(())
    }

    /// Messages written so far.
    pub fn messages_written(&self) -> u64 {
        self.messages
    }

    /// Bytes written so far, headers included.
    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    pub fn get_ref(&self) -> &W {
        &self.out
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

// ── FrameStreamReader ────────────────────────────────────────────

/// Largest payload a reader accepts by default (256 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 256 * 1024 * 1024;

/// Consumer-side parser for the framed protocol.
pub struct FrameStreamReader<R: Read> {
    input: R,
    max_payload: usize,
}

impl<R: Read> FrameStreamReader<R> {
    pub fn new(input: R) -> Self {
        Self::with_max_payload(input, MAX_PAYLOAD_SIZE)
    }

    /// A reader rejecting payloads above `max_payload` bytes.
    pub fn with_max_payload(input: R, max_payload: usize) -> Self {
        Self { input, max_payload }
    }

    /// Read the next message.
    ///
    /// `Ok(None)` on a clean end of stream between messages. End of stream
    /// inside a header or payload is [`CastError::Truncated`].
    pub fn read_message(&mut self) -> Result<Option<(FrameHeader, Vec<u8>)>> {
        let mut raw = [0u8; FrameHeader::SIZE];
        let got = read_full(&mut self.input, &mut raw)?;
        if got == 0 {
            return Ok(None);
        }
        if got < FrameHeader::SIZE {
            return Err(CastError::Truncated {
                what: "frame header",
                needed: FrameHeader::SIZE,
                got,
            });
        }
        let header = FrameHeader::decode(&raw)?;

        let size = header.frame_size as usize;
        if size > self.max_payload {
            return Err(CastError::PayloadTooLarge {
                size,
                max: self.max_payload,
            });
        }
        let mut payload = vec![0u8; size];
        let got = read_full(&mut self.input, &mut payload)?;
        if got < payload.len() {
            return Err(CastError::Truncated {
                what: "frame payload",
                needed: payload.len(),
                got,
            });
        }
        Ok(Some((header, payload)))
    }
}

impl<R: Read> Iterator for FrameStreamReader<R> {
    type Item = Result<(FrameHeader, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_message().transpose()
    }
}

/// Fill `buf` as far as the reader allows. Returns bytes read; fewer than
/// `buf.len()` means end of stream.
fn read_full<R: Read>(input: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(CastError::Io(e)),
        }
    }
    Ok(filled)
}

// ── Tests ────────────────────────────────────────────────────────
