//! # vrcast-core
//!
//! Real-time desktop streaming pipeline for a head-mounted viewer.
//!
//! This crate contains:
//! - **Queue**: `ConcurrentQueue`, the FIFO between every producer and consumer
//! - **Capture**: `DesktopCaptureSource` running a `CaptureBackend` on its own thread
//! - **Encoder**: `VideoEncoderAdapter` over a send/receive `EncoderBackend` (H.264 or zstd)
//! - **Stream**: `FrameStreamWriter` / `FrameStreamReader` for the framed stdout protocol
//! - **Ingest**: `SensorStreamReader` (stdin orientation) and `SharedSnapshotReader` (mmap hands)
//! - **Session**: `StreamSession`, one render iteration per `tick`
//! - **Error**: `CastError`, a typed, `thiserror`-based error hierarchy

pub mod error;
pub mod ingest;
pub mod pipeline;
pub mod queue;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use error::{CastError, ErrorClass, Result};
pub use ingest::{
    AlwaysReady, HandRecord, InputReadiness, Point3, SensorSample, SensorStreamReader,
    SharedSnapshotReader, StdinReadiness,
};
pub use pipeline::{
    CaptureBackend, CaptureConfig, CaptureState, CapturedFrame, ChannelOrder, Codec,
    CompositeFrame, DesktopCaptureSource, EncodedAccessUnit, EncoderConfig, FrameHeader,
    FrameStreamReader, FrameStreamWriter, H264Decoder, OutputMode, SceneHost, SessionConfig,
    SessionStats, StreamSession, SyntheticDesktop, VideoEncoderAdapter, WireFormat, ZstdDecoder,
};
pub use queue::ConcurrentQueue;
