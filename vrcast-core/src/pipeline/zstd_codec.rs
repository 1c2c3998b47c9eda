//! zstd intra/inter codec (wire format 3).
//!
//! A lossless alternative to H.264 for consumers without a video decoder:
//!
//! - **Keyframe** (every GOP): all three I420 planes → zstd compress.
//! - **Inter frame**: byte-wise residual against the previous frame → zstd
//!   compress. Static desktop regions become runs of zeros.
//!
//! ## Access unit layout
//!
//! ```text
//! magic:        [u8; 4]  "VRAU"
//! pts:          u64
//! flags:        u8       bit 0 = keyframe
//! width:        u32
//! height:       u32
//! payload_len:  u32
//! payload:      [u8]     zstd frame, payload_len bytes
//! ```
//!
//! All integers little-endian. Units are self-delimiting, so several may be
//! concatenated into one wire message.

use std::collections::VecDeque;

use crate::error::{CastError, Result};
use crate::pipeline::convert::I420Frame;
use crate::pipeline::encoder::{EncodedAccessUnit, EncoderBackend, EncoderConfig, EncoderTuning};

// ── Constants ────────────────────────────────────────────────────

/// Leading bytes of every access unit.
pub const AU_MAGIC: [u8; 4] = *b"VRAU";

/// Size of the access unit header preceding the compressed payload.
pub const AU_HEADER_SIZE: usize = 25;

const FLAG_KEYFRAME: u8 = 0x01;

/// Serialize one access unit from its parts.
pub fn build_unit(pts: u64, keyframe: bool, width: u32, height: u32, payload: &[u8]) -> EncodedAccessUnit {
    let mut data = Vec::with_capacity(AU_HEADER_SIZE + payload.len());
    data.extend_from_slice(&AU_MAGIC);
    data.extend_from_slice(&pts.to_le_bytes());
    data.push(if keyframe { FLAG_KEYFRAME } else { 0 });
    data.extend_from_slice(&width.to_le_bytes());
    data.extend_from_slice(&height.to_le_bytes());
    data.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    data.extend_from_slice(payload);
    EncodedAccessUnit {
        pts,
        keyframe,
        data,
    }
}

/// Bytes of all three I420 planes at `width x height`, or `None` when the
/// product does not fit in memory.
fn plane_bytes(width: u32, height: u32) -> Option<usize> {
    (width as usize)
        .checked_mul(height as usize)?
        .checked_mul(3)
        .map(|n| n / 2)
}

// ── ZstdEncoder ──────────────────────────────────────────────────

/// zstd-based intra/inter encoder.
pub struct ZstdEncoder {
    width: u32,
    height: u32,
    tuning: EncoderTuning,
    max_latency: usize,
    /// Previous frame's planes, the reference for inter frames.
    reference: Option<Vec<u8>>,
    /// Encoded but not yet released (simulated pipeline depth).
    held: VecDeque<EncodedAccessUnit>,
    /// Released and waiting for `receive_packet`.
    ready: VecDeque<EncodedAccessUnit>,
    frames_since_key: u32,
    eof: bool,
    residual: Vec<u8>,
}

impl ZstdEncoder {
    /// Open the encoder with the given tuning.
    pub fn open(config: &EncoderConfig, tuning: EncoderTuning) -> Result<Self> {
        tuning.validate()?;
        if !(1..=22).contains(&tuning.compression_level) {
            return Err(CastError::EncoderInit(format!(
                "compression level {} out of range",
                tuning.compression_level
            )));
        }

        let bytes = plane_bytes(config.width, config.height).ok_or_else(|| {
            CastError::EncoderInit(format!("{}x{} is too large", config.width, config.height))
        })?;
        let mut residual = Vec::new();
        residual
            .try_reserve_exact(bytes)
            .map_err(|e| CastError::EncoderInit(format!("cannot allocate working buffer: {e}")))?;

        Ok(Self {
            width: config.width,
            height: config.height,
            tuning,
            max_latency: config.max_latency_frames,
            reference: None,
            held: VecDeque::new(),
            ready: VecDeque::new(),
            frames_since_key: 0,
            eof: false,
            residual,
        })
    }

    fn encode_unit(&mut self, frame: &I420Frame, pts: u64) -> Result<EncodedAccessUnit> {
        let planes = frame.to_contiguous();
        let keyframe = self.reference.is_none() || self.frames_since_key >= self.tuning.gop_size;

        let compressed = if keyframe {
            self.frames_since_key = 0;
            zstd::bulk::compress(&planes, self.tuning.compression_level)
        } else {
            let reference = self.reference.as_deref().unwrap_or_default();
            self.residual.clear();
            self.residual.extend(
                planes
                    .iter()
                    .zip(reference.iter())
                    .map(|(cur, prev)| cur.wrapping_sub(*prev)),
            );
            zstd::bulk::compress(&self.residual, self.tuning.compression_level)
        };
        let payload = compressed
            .map_err(|e| CastError::EncoderSubmit(format!("zstd compress failed: {e}")))?;

        self.frames_since_key += 1;
        self.reference = Some(planes);
        Ok(build_unit(pts, keyframe, self.width, self.height, &payload))
    }
}

impl EncoderBackend for ZstdEncoder {
    fn send_frame(&mut self, frame: &I420Frame, pts: u64) -> Result<()> {
        if self.eof {
            return Err(CastError::EncoderSubmit("encoder already flushed".into()));
        }
        if frame.width != self.width || frame.height != self.height {
            return Err(CastError::EncoderSubmit(format!(
                "frame is {}x{}, encoder opened for {}x{}",
                frame.width, frame.height, self.width, self.height
            )));
        }

        let unit = self.encode_unit(frame, pts)?;
        self.held.push_back(unit);
        while self.held.len() > self.max_latency {
            if let Some(unit) = self.held.pop_front() {
                self.ready.push_back(unit);
            }
        }
        Ok(())
    }

    fn send_eof(&mut self) -> Result<()> {
        self.eof = true;
        self.ready.extend(self.held.drain(..));
        Ok(())
    }

    fn receive_packet(&mut self) -> Result<Option<EncodedAccessUnit>> {
        Ok(self.ready.pop_front())
    }
}

// ── AccessUnitHeader ─────────────────────────────────────────────

/// Parsed access unit header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessUnitHeader {
    pub pts: u64,
    pub keyframe: bool,
    pub width: u32,
    pub height: u32,
    pub payload_len: u32,
}

impl AccessUnitHeader {
    /// Deserialize from the first [`AU_HEADER_SIZE`] bytes of `data`.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < AU_HEADER_SIZE {
            return Err(CastError::Truncated {
                what: "access unit header",
                needed: AU_HEADER_SIZE,
                got: data.len(),
            });
        }
        if data[0..4] != AU_MAGIC {
            return Err(CastError::InvalidMagic(u32::from_le_bytes(
                [data[0], data[1], data[2], data[3]],
            )));
        }
        Ok(Self {
            pts: u64::from_le_bytes(le_array(&data[4..12])),
            keyframe: data[12] & FLAG_KEYFRAME != 0,
            width: u32::from_le_bytes(le_array(&data[13..17])),
            height: u32::from_le_bytes(le_array(&data[17..21])),
            payload_len: u32::from_le_bytes(le_array(&data[21..25])),
        })
    }
}

/// Split a concatenation of access units into `(header, payload)` pairs.
pub fn split_access_units(mut data: &[u8]) -> Result<Vec<(AccessUnitHeader, &[u8])>> {
    let mut units = Vec::new();
    while !data.is_empty() {
        let header = AccessUnitHeader::decode(data)?;
        let end = AU_HEADER_SIZE + header.payload_len as usize;
        if data.len() < end {
            return Err(CastError::Truncated {
                what: "access unit payload",
                needed: end,
                got: data.len(),
            });
        }
        units.push((header, &data[AU_HEADER_SIZE..end]));
        data = &data[end..];
    }
    Ok(units)
}

// ── ZstdDecoder ──────────────────────────────────────────────────

/// A reconstructed frame.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub pts: u64,
    pub keyframe: bool,
    pub frame: I420Frame,
}

/// Stateful decoder holding the last reconstructed frame.
pub struct ZstdDecoder {
    reference: Option<I420Frame>,
    frames_decoded: u64,
    max_plane_bytes: usize,
}

impl ZstdDecoder {
    /// Largest frame accepted by default: 8K UHD.
    pub const DEFAULT_MAX_PLANE_BYTES: usize = 7680 * 4320 * 3 / 2;

    pub fn new() -> Self {
        Self {
            reference: None,
            frames_decoded: 0,
            max_plane_bytes: Self::DEFAULT_MAX_PLANE_BYTES,
        }
    }

    /// Decode every unit in a wire payload, in order.
    pub fn decode_payload(&mut self, payload: &[u8]) -> Result<Vec<DecodedFrame>> {
        split_access_units(payload)?
            .into_iter()
            .map(|(header, body)| self.decode_unit(&header, body))
            .collect()
    }

    /// Decode one unit.
    pub fn decode_unit(&mut self, header: &AccessUnitHeader, body: &[u8]) -> Result<DecodedFrame> {
        let bytes = plane_bytes(header.width, header.height)
            .filter(|n| *n <= self.max_plane_bytes)
            .ok_or_else(|| {
                CastError::EncoderReceive(format!(
                    "unit {} claims {}x{}, above the decoder limit",
                    header.pts, header.width, header.height
                ))
            })?;
        let raw = zstd::bulk::decompress(body, bytes)
            .map_err(|e| CastError::EncoderReceive(format!("zstd decode failed: {e}")))?;

        let planes = if header.keyframe {
            raw
        } else {
            let reference = match &self.reference {
                Some(r) if r.width == header.width && r.height == header.height => r,
                _ => {
                    return Err(CastError::EncoderReceive(format!(
                        "inter unit {} without a matching reference frame",
                        header.pts
                    )));
                }
            };
            let prev = reference.to_contiguous();
            raw.iter()
                .zip(prev.iter())
                .map(|(delta, prev)| prev.wrapping_add(*delta))
                .collect()
        };

        let frame = I420Frame::from_contiguous(header.width, header.height, &planes)?;
        self.reference = Some(frame.clone());
        self.frames_decoded += 1;

        Ok(DecodedFrame {
            pts: header.pts,
            keyframe: header.keyframe,
            frame,
        })
    }

    /// Frames reconstructed so far.
    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }
}

impl Default for ZstdDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

// ── Tests ────────────────────────────────────────────────────────
