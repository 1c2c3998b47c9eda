//! Domain-specific error types for the vrcast pipeline.
//!
//! All fallible operations return `Result<T, CastError>`. Outcomes that are
//! part of normal polling (no frame yet, no sensor sample this tick, no
//! encoder output for this call) are never errors: they surface as `None`
//! or an empty `Vec`.

use std::time::Duration;
use thiserror::Error;

/// How the caller is expected to react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// A subsystem could not be brought up. Abort its initialisation.
    StartupFatal,
    /// One record was bad. Skip it and keep going.
    Recoverable,
    /// The output session is broken. Stop streaming and clean up; the
    /// framed protocol has no resynchronisation marker.
    StreamFatal,
}

/// The canonical error type for the vrcast pipeline.
#[derive(Debug, Error)]
pub enum CastError {
    // ── Capture Errors ───────────────────────────────────────────
    /// The capture backend could not be acquired (no display, API missing).
    #[error("capture backend unavailable: {0}")]
    CaptureUnavailable(String),

    /// The capture thread did not reach `Running` within the deadline.
    #[error("capture thread did not start within {0:?}")]
    StartupTimeout(Duration),

    /// A single grab failed. The capture loop logs it and retries.
    #[error("capture failed: {0}")]
    CaptureFailed(String),

    // ── Encoder Errors ───────────────────────────────────────────
    /// The encoder could not be constructed or configured.
    #[error("encoder initialisation failed: {0}")]
    EncoderInit(String),

    /// The encoder rejected a submitted frame.
    #[error("encoder rejected frame: {0}")]
    EncoderSubmit(String),

    /// The encoder failed while producing output.
    #[error("encoder output failed: {0}")]
    EncoderReceive(String),

    /// A raw frame did not match the size the encoder was built for.
    #[error("frame size mismatch: expected {expected} bytes, got {actual}")]
    FrameSizeMismatch { expected: usize, actual: usize },

    // ── Stream Errors ────────────────────────────────────────────
    /// The output or input byte stream reported an error.
    #[error("stream i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The consumer closed the pipe.
    #[error("output stream closed by consumer")]
    BrokenStream,

    /// A framed message did not start with the expected magic value.
    #[error("invalid magic: {0:#010x}")]
    InvalidMagic(u32),

    /// A header announced a payload above the reader's limit.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The stream or an access unit ended in the middle of a message.
    #[error("truncated {what}: needed {needed} bytes, got {got}")]
    Truncated {
        what: &'static str,
        needed: usize,
        got: usize,
    },

    // ── Input Errors ─────────────────────────────────────────────
    /// A sensor line or snapshot payload could not be decoded.
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    // ── Configuration Errors ─────────────────────────────────────
    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl CastError {
    /// Classify this error against the pipeline's failure taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            CastError::CaptureUnavailable(_)
            | CastError::StartupTimeout(_)
            | CastError::EncoderInit(_)
            | CastError::Config(_) => ErrorClass::StartupFatal,
            CastError::CaptureFailed(_) | CastError::Parse(_) => ErrorClass::Recoverable,
            CastError::EncoderSubmit(_)
            | CastError::EncoderReceive(_)
            | CastError::FrameSizeMismatch { .. }
            | CastError::Io(_)
            | CastError::BrokenStream
            | CastError::InvalidMagic(_)
            | CastError::PayloadTooLarge { .. }
            | CastError::Truncated { .. } => ErrorClass::StreamFatal,
        }
    }

    /// Map a write error, singling out a closed consumer pipe.
    pub fn from_write(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::WriteZero => {
                CastError::BrokenStream
            }
            _ => CastError::Io(e),
        }
    }
}

/// Crate-wide result alias.
pub type Result<T, E = CastError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = CastError::InvalidMagic(0x1234_5678);
        assert!(e.to_string().contains("0x12345678"));

        let e = CastError::FrameSizeMismatch {
            expected: 1000,
            actual: 500,
        };
        assert!(e.to_string().contains("1000"));
        assert!(e.to_string().contains("500"));
    }

    #[test]
    fn classes_follow_taxonomy() {
        assert_eq!(
            CastError::EncoderInit("no codec".into()).class(),
            ErrorClass::StartupFatal
        );
        assert_eq!(
            CastError::StartupTimeout(Duration::from_secs(1)).class(),
            ErrorClass::StartupFatal
        );
        assert_eq!(
            CastError::CaptureFailed("blit".into()).class(),
            ErrorClass::Recoverable
        );
        assert_eq!(CastError::BrokenStream.class(), ErrorClass::StreamFatal);
        assert_eq!(
            CastError::EncoderSubmit("rejected".into()).class(),
            ErrorClass::StreamFatal
        );
        let big = CastError::PayloadTooLarge { size: 10, max: 4 };
        assert_eq!(big.class(), ErrorClass::StreamFatal);
        assert_eq!(big.to_string(), "payload too large: 10 bytes (max 4)");
    }

    #[test]
    fn broken_pipe_maps_to_broken_stream() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        assert!(matches!(CastError::from_write(io_err), CastError::BrokenStream));

        let io_err = std::io::Error::other("disk full");
        assert!(matches!(CastError::from_write(io_err), CastError::Io(_)));
    }

    #[test]
    fn from_json() {
        let err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let e: CastError = err.into();
        assert_eq!(e.class(), ErrorClass::Recoverable);
    }
}
