//! # Capture → encode → stream pipeline
//!
//! ```text
//! capture thread                      main thread
//! ┌────────────────────┐             ┌──────────────────────────────┐
//! │ CaptureBackend     │             │ StreamSession::tick          │
//! │   ↓ grab + RGBA    │  queue ≤ 3  │   ↓ SceneHost (render)       │
//! │ DesktopCapture-    │ ──────────► │   ↓ VideoEncoderAdapter      │
//! │   Source           │             │   ↓ FrameStreamWriter ─► out │
//! └────────────────────┘             └──────────────────────────────┘
//! ```
//!
//! | Module     | Purpose                                               |
//! |------------|-------------------------------------------------------|
//! | `types`    | Frame, channel order and wire-format types            |
//! | `capture`  | Capture thread and platform backends                  |
//! | `convert`  | BGRA/RGBA swap, RGB packing, RGBA → I420              |
//! | `encoder`  | Encoder adapter, backend trait, codec selection       |
//! | `h264`     | OpenH264 encoder/decoder, Annex-B NAL scanning        |
//! | `zstd_codec` | Lossless zstd intra/inter units and their decoder   |
//! | `stream`   | 24-byte framed protocol writer and reader             |
//! | `session`  | Per-frame driver with render/panel/encode cadences    |

pub mod capture;
pub mod convert;
pub mod encoder;
pub mod h264;
pub mod session;
pub mod stream;
pub mod types;
pub mod zstd_codec;

// ── Re-exports ───────────────────────────────────────────────────

pub use capture::{
    CaptureBackend, CaptureConfig, DesktopCaptureSource, SyntheticDesktop, open_native_backend,
};
pub use convert::{I420Frame, PixelConverter};
pub use encoder::{
    Codec, EncodedAccessUnit, EncoderBackend, EncoderConfig, EncoderTuning, VideoEncoderAdapter,
};
pub use h264::{DecodedPicture, H264Decoder, H264Encoder};
pub use session::{
    Cadence, CompositeFrame, OutputMode, SceneHost, SessionConfig, SessionStats, StreamSession,
};
pub use stream::{FrameHeader, FrameStreamReader, FrameStreamWriter};
pub use types::{CaptureState, CapturedFrame, ChannelOrder, WireFormat};
pub use zstd_codec::{AccessUnitHeader, DecodedFrame, ZstdDecoder, ZstdEncoder};
