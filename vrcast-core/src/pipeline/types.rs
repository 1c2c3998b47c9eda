//! Shared types for the capture/encode pipeline.
//!
//! [`CapturedFrame`] is the internal frame representation passed from the
//! capture thread to the main loop. [`WireFormat`] is the pixel-format code
//! carried in every framed message header.

use std::time::Instant;

// ── ChannelOrder ─────────────────────────────────────────────────

/// Byte order of the four channels a capture backend produces natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelOrder {
    /// Blue, Green, Red, Alpha (GDI and X11 default).
    Bgra,
    /// Red, Green, Blue, Alpha (canonical layout).
    Rgba,
}

/// Channels per pixel in the canonical layout.
pub const CANONICAL_CHANNELS: u32 = 4;

// ── WireFormat ───────────────────────────────────────────────────

/// Pixel-format code carried in [`FrameHeader`](crate::pipeline::stream::FrameHeader).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireFormat {
    /// Uncompressed RGBA rows.
    RawRgba,
    /// Uncompressed RGB rows.
    RawRgb,
    /// H.264 Annex-B access units.
    Compressed,
    /// Access units of the zstd intra/inter codec.
    ZstdUnits,
}

impl WireFormat {
    /// Numeric code written to the wire.
    pub const fn code(self) -> u32 {
        match self {
            WireFormat::RawRgba => 0,
            WireFormat::RawRgb => 1,
            WireFormat::Compressed => 2,
            WireFormat::ZstdUnits => 3,
        }
    }

    /// Inverse of [`code`](Self::code).
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(WireFormat::RawRgba),
            1 => Some(WireFormat::RawRgb),
            2 => Some(WireFormat::Compressed),
            3 => Some(WireFormat::ZstdUnits),
            _ => None,
        }
    }
}

// ── CaptureState ─────────────────────────────────────────────────

/// Lifecycle of the capture thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CaptureState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl CaptureState {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => CaptureState::Starting,
            2 => CaptureState::Running,
            3 => CaptureState::Stopping,
            _ => CaptureState::Stopped,
        }
    }
}

// ── CapturedFrame ────────────────────────────────────────────────

/// One desktop snapshot in the canonical RGBA layout.
///
/// Created by the capture thread and moved to the consumer; never mutated
/// after it leaves the capture source. Rows are tightly packed
/// (`width * channels` bytes each).
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    /// Pixel data, `width * height * channels` bytes.
    pub pixels: Vec<u8>,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Channels per pixel (always [`CANONICAL_CHANNELS`] once captured).
    pub channels: u32,
    /// Whether the grab succeeded and `pixels` is complete.
    pub valid: bool,
    /// Monotonic capture timestamp.
    pub timestamp: Instant,
}

impl CapturedFrame {
    /// Build a valid frame from already-canonical RGBA pixels.
    pub fn from_rgba(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        let valid = pixels.len() == width as usize * height as usize * CANONICAL_CHANNELS as usize;
        Self {
            pixels,
            width,
            height,
            channels: CANONICAL_CHANNELS,
            valid,
            timestamp: Instant::now(),
        }
    }

    /// Bytes one row occupies.
    pub fn row_len(&self) -> usize {
        self.width as usize * self.channels as usize
    }

    /// Returns the pixel bytes at `(x, y)`.
    ///
    /// # Panics
    ///
    /// Panics if `(x, y)` is out of bounds.
    pub fn pixel(&self, x: u32, y: u32) -> &[u8] {
        let bpp = self.channels as usize;
        let offset = y as usize * self.row_len() + x as usize * bpp;
        &self.pixels[offset..offset + bpp]
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_are_stable() {
        assert_eq!(WireFormat::RawRgba.code(), 0);
        assert_eq!(WireFormat::RawRgb.code(), 1);
        assert_eq!(WireFormat::Compressed.code(), 2);
        assert_eq!(WireFormat::ZstdUnits.code(), 3);
        assert_eq!(WireFormat::from_code(2), Some(WireFormat::Compressed));
        assert_eq!(WireFormat::from_code(3), Some(WireFormat::ZstdUnits));
        assert_eq!(WireFormat::from_code(9), None);
    }

    #[test]
    fn from_rgba_validates_length() {
        let ok = CapturedFrame::from_rgba(2, 2, vec![0; 16]);
        assert!(ok.valid);
        assert_eq!(ok.channels, 4);

        let short = CapturedFrame::from_rgba(2, 2, vec![0; 15]);
        assert!(!short.valid);
    }

    #[test]
    fn pixel_lookup() {
        // 3x2 frame; pixel (2, 1) is the sixth pixel.
        let mut pixels = vec![0u8; 24];
        pixels[20..24].copy_from_slice(&[1, 2, 3, 4]);
        let frame = CapturedFrame::from_rgba(3, 2, pixels);
        assert_eq!(frame.pixel(2, 1), &[1, 2, 3, 4]);
    }

    #[test]
    fn state_roundtrip() {
        for s in [
            CaptureState::Stopped,
            CaptureState::Starting,
            CaptureState::Running,
            CaptureState::Stopping,
        ] {
            assert_eq!(CaptureState::from_u8(s as u8), s);
        }
    }
}
