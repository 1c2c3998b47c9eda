//! Pixel layout conversion.
//!
//! - Native capture order to canonical RGBA (in place, per frame).
//! - Canonical RGBA to planar I420 for the encoders, using OpenH264's
//!   BT.601 converter.

use openh264::formats::{RgbaSliceU8, YUVBuffer, YUVSource};

use crate::error::{CastError, Result};
use crate::pipeline::types::ChannelOrder;

/// Swap the red and blue channels of a 4-channel buffer so that it ends up
/// in canonical RGBA order. A buffer already in RGBA order is left alone.
pub fn to_canonical_rgba(pixels: &mut [u8], native: ChannelOrder) {
    if native == ChannelOrder::Rgba {
        return;
    }
    for px in pixels.chunks_exact_mut(4) {
        px.swap(0, 2);
    }
}

/// Drop the alpha channel: RGBA rows to tightly packed RGB rows.
pub fn rgba_to_rgb(rgba: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(rgba.len() / 4 * 3);
    for px in rgba.chunks_exact(4) {
        out.extend_from_slice(&px[..3]);
    }
    out
}

// ── I420Frame ────────────────────────────────────────────────────

/// Planar 4:2:0 YUV frame with tightly packed planes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct I420Frame {
    pub width: u32,
    pub height: u32,
    /// Full-resolution luma, `width * height` bytes.
    pub y: Vec<u8>,
    /// Quarter-resolution blue-difference chroma.
    pub u: Vec<u8>,
    /// Quarter-resolution red-difference chroma.
    pub v: Vec<u8>,
}

impl I420Frame {
    /// A black frame of the given size. Dimensions must be even.
    pub fn black(width: u32, height: u32) -> Self {
        let luma = width as usize * height as usize;
        Self {
            width,
            height,
            y: vec![16; luma],
            u: vec![128; luma / 4],
            v: vec![128; luma / 4],
        }
    }

    /// Total bytes of all three planes.
    pub fn byte_len(&self) -> usize {
        self.y.len() + self.u.len() + self.v.len()
    }

    /// Planes laid out back to back (Y, then U, then V).
    pub fn to_contiguous(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.byte_len());
        out.extend_from_slice(&self.y);
        out.extend_from_slice(&self.u);
        out.extend_from_slice(&self.v);
        out
    }

    /// Inverse of [`to_contiguous`](Self::to_contiguous).
    pub fn from_contiguous(width: u32, height: u32, data: &[u8]) -> Result<Self> {
        let luma = width as usize * height as usize;
        let chroma = luma / 4;
        let needed = luma + 2 * chroma;
        if data.len() != needed {
            return Err(CastError::Truncated {
                what: "i420 planes",
                needed,
                got: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            y: data[..luma].to_vec(),
            u: data[luma..luma + chroma].to_vec(),
            v: data[luma + chroma..].to_vec(),
        })
    }
}

// ── PixelConverter ───────────────────────────────────────────────

/// Reusable RGBA → I420 converter bound to one resolution.
///
/// Owns its destination planes; the returned frame is reused across calls.
pub struct PixelConverter {
    width: u32,
    height: u32,
    dst: I420Frame,
}

impl PixelConverter {
    /// Build a converter for `width x height`. Both must be non-zero and
    /// even, as 4:2:0 subsampling requires.
    pub fn new(width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 {
            return Err(CastError::EncoderInit(format!(
                "I420 needs even, non-zero dimensions (got {width}x{height})"
            )));
        }
        Ok(Self {
            width,
            height,
            dst: I420Frame::black(width, height),
        })
    }

    /// Expected RGBA input length in bytes.
    pub fn input_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }

    /// Convert one RGBA frame. The returned frame is overwritten by the
    /// next call.
    pub fn convert(&mut self, rgba: &[u8]) -> Result<&I420Frame> {
        let expected = self.input_len();
        if rgba.len() != expected {
            return Err(CastError::FrameSizeMismatch {
                expected,
                actual: rgba.len(),
            });
        }

        let dims = (self.width as usize, self.height as usize);
        let yuv = YUVBuffer::from_rgb_source(RgbaSliceU8::new(rgba, dims));
        copy_plane(&mut self.dst.y, yuv.y())?;
        copy_plane(&mut self.dst.u, yuv.u())?;
        copy_plane(&mut self.dst.v, yuv.v())?;
        Ok(&self.dst)
    }
}

fn copy_plane(dst: &mut [u8], src: &[u8]) -> Result<()> {
    let src = src.get(..dst.len()).ok_or(CastError::Truncated {
        what: "converted plane",
        needed: dst.len(),
        got: src.len(),
    })?;
    dst.copy_from_slice(src);
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_rgba(w: u32, h: u32, rgb: [u8; 3]) -> Vec<u8> {
        let mut out = Vec::with_capacity((w * h * 4) as usize);
        for _ in 0..w * h {
            out.extend_from_slice(&[rgb[0], rgb[1], rgb[2], 255]);
        }
        out
    }

    #[test]
    fn bgra_swap_to_rgba() {
        let mut px = vec![1, 2, 3, 4, 5, 6, 7, 8];
        to_canonical_rgba(&mut px, ChannelOrder::Bgra);
        assert_eq!(px, vec![3, 2, 1, 4, 7, 6, 5, 8]);

        let mut same = vec![1, 2, 3, 4];
        to_canonical_rgba(&mut same, ChannelOrder::Rgba);
        assert_eq!(same, vec![1, 2, 3, 4]);
    }

    #[test]
    fn rgb_drops_alpha() {
        assert_eq!(rgba_to_rgb(&[1, 2, 3, 255, 4, 5, 6, 255]), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn rejects_odd_dimensions() {
        assert!(PixelConverter::new(3, 2).is_err());
        assert!(PixelConverter::new(0, 2).is_err());
        assert!(PixelConverter::new(4, 2).is_ok());
    }

    #[test]
    fn rejects_wrong_input_size() {
        let mut conv = PixelConverter::new(4, 4).unwrap();
        let err = conv.convert(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, CastError::FrameSizeMismatch { expected: 64, actual: 10 }));
    }

    #[test]
    fn black_and_white_levels() {
        let mut conv = PixelConverter::new(4, 4).unwrap();
        let black = conv.convert(&solid_rgba(4, 4, [0, 0, 0])).unwrap().clone();
        assert!(black.y.iter().all(|&y| (15..=17).contains(&y)));
        assert!(black.u.iter().chain(&black.v).all(|&c| (127..=129).contains(&c)));

        let white = conv.convert(&solid_rgba(4, 4, [255, 255, 255])).unwrap();
        assert!(white.y.iter().all(|&y| (233..=236).contains(&y)));
    }

    #[test]
    fn red_lands_in_the_v_plane() {
        let mut conv = PixelConverter::new(4, 2).unwrap();
        let red = conv.convert(&solid_rgba(4, 2, [255, 0, 0])).unwrap();
        assert_eq!(red.y.len(), 8);
        assert_eq!(red.u.len(), 2);
        assert!(red.v.iter().all(|&v| v > 200));
        assert!(red.u.iter().all(|&u| u < 128));
    }

    #[test]
    fn contiguous_planes_roundtrip() {
        let frame = I420Frame::black(4, 2);
        let bytes = frame.to_contiguous();
        assert_eq!(bytes.len(), 12);
        assert_eq!(I420Frame::from_contiguous(4, 2, &bytes).unwrap(), frame);
        assert!(I420Frame::from_contiguous(4, 2, &bytes[..11]).is_err());
    }
}
