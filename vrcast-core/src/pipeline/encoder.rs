//! Low-latency video encoder adapter.
//!
//! [`VideoEncoderAdapter`] accepts canonical RGBA frames in presentation
//! order, converts them to I420, submits them to an [`EncoderBackend`] with
//! a monotonically increasing presentation index, and drains every access
//! unit the backend has ready. A backend may hold output back across calls,
//! so an empty result after a submit is normal.
//!
//! Two backends ship:
//!
//! | Backend | Codec | Wire format |
//! |---------|-------|-------------|
//! | [`H264Encoder`] | H.264 Annex-B via OpenH264 | 2 |
//! | [`ZstdEncoder`] | lossless zstd intra/inter units | 3 |

use tracing::{debug, info};

use crate::error::{CastError, Result};
use crate::pipeline::convert::{I420Frame, PixelConverter};
use crate::pipeline::h264::H264Encoder;
use crate::pipeline::types::WireFormat;
use crate::pipeline::zstd_codec::ZstdEncoder;

// ── Configuration ────────────────────────────────────────────────

/// Per-session encoder parameters. One adapter is built per resolution.
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    /// Frame width in pixels (even).
    pub width: u32,
    /// Frame height in pixels (even).
    pub height: u32,
    /// Target frame rate.
    pub fps: u32,
    /// How many submitted frames the backend may hold before emitting
    /// output. 0 emits every frame on the call that submitted it.
    pub max_latency_frames: usize,
}

impl EncoderConfig {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width,
            height,
            fps,
            max_latency_frames: 0,
        }
    }
}

/// Fixed latency-first tuning policy. Not exposed at the configuration
/// boundary.
#[derive(Debug, Clone, Copy)]
pub struct EncoderTuning {
    /// Nominal bitrate in bits/second (advisory for rate-controlled backends).
    pub target_bitrate: u64,
    /// Frames between keyframes.
    pub gop_size: u32,
    /// Bidirectional frames. Always 0: they add reorder latency.
    pub max_b_frames: u32,
    /// Frames of rate-control look-ahead. Always 0.
    pub lookahead: u32,
    /// zstd level for the lossless backend; 1 favours speed over ratio.
    pub compression_level: i32,
}

impl EncoderTuning {
    pub const LOW_LATENCY: EncoderTuning = EncoderTuning {
        target_bitrate: 2_000_000,
        gop_size: 10,
        max_b_frames: 0,
        lookahead: 0,
        compression_level: 1,
    };

    /// Reject settings that would add reorder or look-ahead latency.
    pub fn validate(&self) -> Result<()> {
        if self.max_b_frames != 0 || self.lookahead != 0 {
            return Err(CastError::EncoderInit(
                "B-frames and look-ahead are not supported in low-latency mode".into(),
            ));
        }
        if self.gop_size == 0 {
            return Err(CastError::EncoderInit("GOP size must be at least 1".into()));
        }
        Ok(())
    }
}

impl Default for EncoderTuning {
    fn default() -> Self {
        Self::LOW_LATENCY
    }
}

// ── EncodedAccessUnit ────────────────────────────────────────────

/// One compressed unit of encoder output, serialized and ready for the
/// wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedAccessUnit {
    /// Presentation index of the frame this unit encodes.
    pub pts: u64,
    /// Whether the unit decodes without a reference frame.
    pub keyframe: bool,
    /// Serialized unit, self-delimiting within a wire payload.
    pub data: Vec<u8>,
}

impl EncodedAccessUnit {
    /// Concatenate units into one wire payload, preserving order.
    pub fn concat(units: &[EncodedAccessUnit]) -> Vec<u8> {
        let total = units.iter().map(|u| u.data.len()).sum();
        let mut out = Vec::with_capacity(total);
        for unit in units {
            out.extend_from_slice(&unit.data);
        }
        out
    }
}

// ── EncoderBackend ───────────────────────────────────────────────

/// Send-frame / receive-packet codec interface.
pub trait EncoderBackend {
    /// Submit one planar frame with its presentation index.
    fn send_frame(&mut self, frame: &I420Frame, pts: u64) -> Result<()>;

    /// Signal end of input so held frames become available.
    fn send_eof(&mut self) -> Result<()>;

    /// Retrieve the next finished unit. `Ok(None)` means no more output is
    /// pending right now.
    fn receive_packet(&mut self) -> Result<Option<EncodedAccessUnit>>;
}

impl<B: EncoderBackend + ?Sized> EncoderBackend for Box<B> {
    fn send_frame(&mut self, frame: &I420Frame, pts: u64) -> Result<()> {
        (**self).send_frame(frame, pts)
    }

    fn send_eof(&mut self) -> Result<()> {
        (**self).send_eof()
    }

    fn receive_packet(&mut self) -> Result<Option<EncodedAccessUnit>> {
        (**self).receive_packet()
    }
}

/// Which backend a session encodes with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    H264,
    Zstd,
}

impl Codec {
    /// Wire format code of the messages this codec produces.
    pub fn wire_format(self) -> WireFormat {
        match self {
            Codec::H264 => WireFormat::Compressed,
            Codec::Zstd => WireFormat::ZstdUnits,
        }
    }
}

// ── VideoEncoderAdapter ──────────────────────────────────────────

/// Converts, submits and drains frames for one encoder session.
///
/// Any submit or receive failure leaves the adapter unusable; the caller
/// should end the streaming session.
pub struct VideoEncoderAdapter<B: EncoderBackend = H264Encoder> {
    config: EncoderConfig,
    converter: PixelConverter,
    backend: B,
    next_pts: u64,
    units_emitted: u64,
    failed: bool,
}

impl VideoEncoderAdapter<H264Encoder> {
    /// Construct the adapter with the H.264 backend and the fixed
    /// low-latency tuning.
    pub fn new(config: EncoderConfig) -> Result<Self> {
        let tuning = EncoderTuning::LOW_LATENCY;
        let backend = H264Encoder::open(&config, tuning)?;
        log_open(&config, &tuning, Codec::H264);
        Self::with_backend(config, backend)
    }
}

impl VideoEncoderAdapter<Box<dyn EncoderBackend>> {
    /// Construct the adapter for a codec chosen at run time.
    pub fn open(codec: Codec, config: EncoderConfig) -> Result<Self> {
        let tuning = EncoderTuning::LOW_LATENCY;
        let backend: Box<dyn EncoderBackend> = match codec {
            Codec::H264 => Box::new(H264Encoder::open(&config, tuning)?),
            Codec::Zstd => Box::new(ZstdEncoder::open(&config, tuning)?),
        };
        log_open(&config, &tuning, codec);
        Self::with_backend(config, backend)
    }
}

fn log_open(config: &EncoderConfig, tuning: &EncoderTuning, codec: Codec) {
    info!(
        ?codec,
        width = config.width,
        height = config.height,
        fps = config.fps,
        gop = tuning.gop_size,
        bitrate = tuning.target_bitrate,
        "encoder initialised"
    );
}

impl<B: EncoderBackend> VideoEncoderAdapter<B> {
    /// Construct the adapter around an already-opened backend.
    pub fn with_backend(config: EncoderConfig, backend: B) -> Result<Self> {
        if config.fps == 0 {
            return Err(CastError::EncoderInit("frame rate must be non-zero".into()));
        }
        let converter = PixelConverter::new(config.width, config.height)?;
        Ok(Self {
            config,
            converter,
            backend,
            next_pts: 0,
            units_emitted: 0,
            failed: false,
        })
    }

    /// Encode one RGBA frame and return every access unit that became
    /// available, in order. May be empty.
    pub fn encode_frame(&mut self, rgba: &[u8]) -> Result<Vec<EncodedAccessUnit>> {
        self.ensure_usable()?;

        let frame = self.converter.convert(rgba)?;
        let pts = self.next_pts;
        if let Err(e) = self.backend.send_frame(frame, pts) {
            self.failed = true;
            return Err(e);
        }
        self.next_pts += 1;

        self.drain()
    }

    /// Signal end of input and return whatever the backend still held.
    pub fn flush(&mut self) -> Result<Vec<EncodedAccessUnit>> {
        self.ensure_usable()?;
        if let Err(e) = self.backend.send_eof() {
            self.failed = true;
            return Err(e);
        }
        let units = self.drain()?;
        debug!(units = units.len(), "encoder flushed");
        Ok(units)
    }

    /// Frames submitted so far.
    pub fn frames_submitted(&self) -> u64 {
        self.next_pts
    }

    /// Access units returned so far.
    pub fn units_emitted(&self) -> u64 {
        self.units_emitted
    }

    /// Session parameters.
    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    fn drain(&mut self) -> Result<Vec<EncodedAccessUnit>> {
        let mut out = Vec::new();
        loop {
            match self.backend.receive_packet() {
                Ok(Some(unit)) => out.push(unit),
                Ok(None) => break,
                Err(e) => {
                    self.failed = true;
                    return Err(e);
                }
            }
        }
        self.units_emitted += out.len() as u64;
        Ok(out)
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.failed {
            return Err(CastError::EncoderSubmit(
                "encoder unusable after a previous failure".into(),
            ));
        }
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_frame(w: u32, h: u32, fill: u8) -> Vec<u8> {
        vec![fill; (w * h * 4) as usize]
    }

    #[test]
    fn zero_latency_emits_every_frame() {
        let mut enc = VideoEncoderAdapter::new(EncoderConfig::new(32, 32, 120)).unwrap();
        for i in 0..3u64 {
            let units = enc.encode_frame(&test_frame(32, 32, 0x40 + i as u8)).unwrap();
            assert_eq!(units.len(), 1);
            assert_eq!(units[0].pts, i);
        }
        assert_eq!(enc.frames_submitted(), 3);
        assert_eq!(enc.units_emitted(), 3);
        assert!(enc.flush().unwrap().is_empty());
    }

    #[test]
    fn default_codec_emits_h264_not_zstd_units() {
        let mut enc = VideoEncoderAdapter::new(EncoderConfig::new(32, 32, 60)).unwrap();
        let unit = enc.encode_frame(&test_frame(32, 32, 0x20)).unwrap().remove(0);
        assert_eq!(&unit.data[..4], &[0, 0, 0, 1]);
        assert_ne!(&unit.data[..4], b"VRAU");
    }

    #[test]
    fn codec_selected_at_run_time() {
        let config = EncoderConfig::new(32, 32, 60);
        let mut h264 = VideoEncoderAdapter::open(Codec::H264, config.clone()).unwrap();
        let mut zstd = VideoEncoderAdapter::open(Codec::Zstd, config).unwrap();
        let frame = test_frame(32, 32, 0x55);

        assert_eq!(&h264.encode_frame(&frame).unwrap()[0].data[..4], &[0, 0, 0, 1]);
        assert_eq!(&zstd.encode_frame(&frame).unwrap()[0].data[..4], b"VRAU");
        assert_eq!(Codec::H264.wire_format(), WireFormat::Compressed);
        assert_eq!(Codec::Zstd.wire_format(), WireFormat::ZstdUnits);
    }

    #[test]
    fn static_content_compresses() {
        let mut enc = VideoEncoderAdapter::new(EncoderConfig::new(64, 64, 60)).unwrap();
        let frame = test_frame(64, 64, 0x80);
        let key = enc.encode_frame(&frame).unwrap().remove(0);
        let inter = enc.encode_frame(&frame).unwrap().remove(0);
        assert!(key.keyframe);
        assert!(!inter.keyframe);
        assert!(key.data.len() < frame.len());
        assert!(inter.data.len() < key.data.len());
    }

    #[test]
    fn wrong_size_is_rejected() {
        let mut enc = VideoEncoderAdapter::new(EncoderConfig::new(32, 32, 60)).unwrap();
        let err = enc.encode_frame(&[0u8; 12]).unwrap_err();
        assert!(matches!(err, CastError::FrameSizeMismatch { .. }));
    }

    #[test]
    fn construction_fails_loudly() {
        assert!(matches!(
            VideoEncoderAdapter::new(EncoderConfig::new(31, 32, 60)),
            Err(CastError::EncoderInit(_))
        ));
        assert!(matches!(
            VideoEncoderAdapter::new(EncoderConfig::new(32, 32, 0)),
            Err(CastError::EncoderInit(_))
        ));
        let bad = EncoderTuning {
            max_b_frames: 2,
            ..EncoderTuning::LOW_LATENCY
        };
        assert!(H264Encoder::open(&EncoderConfig::new(32, 32, 60), bad).is_err());
        assert!(ZstdEncoder::open(&EncoderConfig::new(32, 32, 60), bad).is_err());
    }

    struct RejectingBackend;

    impl EncoderBackend for RejectingBackend {
        fn send_frame(&mut self, _frame: &I420Frame, _pts: u64) -> Result<()> {
            Err(CastError::EncoderSubmit("device lost".into()))
        }
        fn send_eof(&mut self) -> Result<()> {
            Ok(())
        }
        fn receive_packet(&mut self) -> Result<Option<EncodedAccessUnit>> {
            Ok(None)
        }
    }

    #[test]
    fn submit_failure_poisons_adapter() {
        let mut enc =
            VideoEncoderAdapter::with_backend(EncoderConfig::new(8, 8, 60), RejectingBackend)
                .unwrap();
        assert!(enc.encode_frame(&test_frame(8, 8, 0)).is_err());
        let again = enc.flush().unwrap_err();
        assert!(again.to_string().contains("previous failure"));
    }
}
