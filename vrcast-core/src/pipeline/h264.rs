//! H.264 backend (wire format 2).
//!
//! [`H264Encoder`] drives OpenH264 in a latency-first configuration: the
//! constrained baseline profile (no B-frames), no frame skipping, bitrate
//! rate control without look-ahead, and an IDR forced every GOP. Every
//! access unit is emitted in Annex-B form, so units can be concatenated and
//! split again on start codes.
//!
//! [`H264Decoder`] is the consumer-side counterpart used by the inspector
//! and the tests.

use std::collections::VecDeque;

use openh264::OpenH264API;
use openh264::decoder::Decoder;
use openh264::encoder::{
    BitRate, Encoder, EncoderConfig as OpenH264Config, FrameRate, FrameType, RateControlMode,
    UsageType,
};
use openh264::formats::{YUVSlices, YUVSource};
use tracing::debug;

use crate::error::{CastError, Result};
use crate::pipeline::convert::I420Frame;
use crate::pipeline::encoder::{EncodedAccessUnit, EncoderBackend, EncoderConfig, EncoderTuning};

// ── NAL units ────────────────────────────────────────────────────

/// Instantaneous decoder refresh slice.
pub const NAL_TYPE_IDR: u8 = 5;
/// Sequence parameter set.
pub const NAL_TYPE_SPS: u8 = 7;
/// Picture parameter set.
pub const NAL_TYPE_PPS: u8 = 8;

/// Highest frame rate OpenH264's rate control accepts.
const MAX_RATE_CONTROL_FPS: f32 = 60.0;

/// NAL unit types in an Annex-B stream, in order.
pub fn nal_unit_types(stream: &[u8]) -> Vec<u8> {
    let mut types = Vec::new();
    let mut i = 0;
    while i + 3 < stream.len() {
        if stream[i] == 0 && stream[i + 1] == 0 && stream[i + 2] == 1 {
            types.push(stream[i + 3] & 0x1f);
            i += 4;
        } else {
            i += 1;
        }
    }
    types
}

/// Whether the stream holds an IDR slice.
pub fn contains_keyframe(stream: &[u8]) -> bool {
    nal_unit_types(stream).contains(&NAL_TYPE_IDR)
}

/// Whether the stream opens with an Annex-B start code.
pub fn is_annex_b(stream: &[u8]) -> bool {
    stream.starts_with(&[0, 0, 0, 1]) || stream.starts_with(&[0, 0, 1])
}

// ── H264Encoder ──────────────────────────────────────────────────

/// OpenH264 encoder session for one resolution.
pub struct H264Encoder {
    encoder: Encoder,
    width: u32,
    height: u32,
    gop_size: u32,
    frames_since_key: u32,
    max_latency: usize,
    held: VecDeque<EncodedAccessUnit>,
    ready: VecDeque<EncodedAccessUnit>,
    eof: bool,
}

impl H264Encoder {
    /// Open the encoder with the given tuning.
    pub fn open(config: &EncoderConfig, tuning: EncoderTuning) -> Result<Self> {
        tuning.validate()?;
        let bitrate = u32::try_from(tuning.target_bitrate).map_err(|_| {
            CastError::EncoderInit(format!("bitrate {} out of range", tuning.target_bitrate))
        })?;

        let settings = OpenH264Config::new()
            .bitrate(BitRate::from_bps(bitrate))
            .max_frame_rate(FrameRate::from_hz((config.fps as f32).min(MAX_RATE_CONTROL_FPS)))
            .rate_control_mode(RateControlMode::Bitrate)
            .usage_type(UsageType::ScreenContentRealTime)
            .skip_frames(false);
        let encoder = Encoder::with_api_config(OpenH264API::from_source(), settings)
            .map_err(|e| CastError::EncoderInit(format!("openh264: {e}")))?;

        Ok(Self {
            encoder,
            width: config.width,
            height: config.height,
            gop_size: tuning.gop_size,
            frames_since_key: 0,
            max_latency: config.max_latency_frames,
            held: VecDeque::new(),
            ready: VecDeque::new(),
            eof: false,
        })
    }
}

impl EncoderBackend for H264Encoder {
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

        let w = frame.width as usize;
        let yuv = YUVSlices::new(
            (frame.y.as_slice(), frame.u.as_slice(), frame.v.as_slice()),
            (w, frame.height as usize),
            (w, w / 2, w / 2),
        );

        if self.frames_since_key >= self.gop_size {
            self.encoder.force_intra_frame();
        }
        let bitstream = self
            .encoder
            .encode(&yuv)
            .map_err(|e| CastError::EncoderSubmit(format!("openh264: {e}")))?;
        let keyframe = matches!(bitstream.frame_type(), FrameType::IDR | FrameType::I);
        let data = bitstream.to_vec();

        if keyframe {
            self.frames_since_key = 0;
        }
        self.frames_since_key += 1;
        if data.is_empty() {
            debug!(pts, "encoder produced no output for frame");
            return Ok(());
        }

        self.held.push_back(EncodedAccessUnit {
            pts,
            keyframe,
            data,
        });
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

// ── H264Decoder ──────────────────────────────────────────────────

/// One decoded picture in canonical RGBA.
#[derive(Debug, Clone)]
pub struct DecodedPicture {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

/// OpenH264 decoder fed with whole wire payloads.
pub struct H264Decoder {
    decoder: Decoder,
    frames_decoded: u64,
}

impl H264Decoder {
    pub fn new() -> Result<Self> {
        let decoder =
            Decoder::new().map_err(|e| CastError::EncoderInit(format!("openh264: {e}")))?;
        Ok(Self {
            decoder,
            frames_decoded: 0,
        })
    }

    /// Decode every NAL unit in an Annex-B payload and return the pictures
    /// it completed, in order.
    pub fn decode_payload(&mut self, payload: &[u8]) -> Result<Vec<DecodedPicture>> {
        let mut pictures = Vec::new();
        for nal in openh264::nal_units(payload) {
            let decoded = self
                .decoder
                .decode(nal)
                .map_err(|e| CastError::EncoderReceive(format!("openh264: {e}")))?;
            if let Some(yuv) = decoded {
                let (w, h) = yuv.dimensions();
                let mut rgba = vec![0u8; w * h * 4];
                yuv.write_rgba8(&mut rgba);
                pictures.push(DecodedPicture {
                    width: w as u32,
                    height: h as u32,
                    rgba,
                });
            }
        }
        self.frames_decoded += pictures.len() as u64;
        Ok(pictures)
    }

    /// Pictures decoded so far.
    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }
}

// ── Tests ────────────────────────────────────────────────────────
