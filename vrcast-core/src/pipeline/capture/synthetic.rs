//! Moving test-pattern backend for headless runs and tests.

use crate::error::{CastError, Result};
use crate::pipeline::capture::CaptureBackend;
use crate::pipeline::types::ChannelOrder;

/// A fake desktop of fixed size that draws a phase-shifted BGRA gradient.
///
/// Each grab advances the phase, so consecutive frames differ and the
/// encoder sees realistic inter-frame changes.
pub struct SyntheticDesktop {
    width: u32,
    height: u32,
    frame_count: u64,
}

impl SyntheticDesktop {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            frame_count: 0,
        }
    }

    /// Grabs performed so far.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }
}

impl CaptureBackend for SyntheticDesktop {
    fn display_size(&mut self) -> Result<(u32, u32)> {
        Ok((self.width, self.height))
    }

    fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.width = width;
        self.height = height;
        Ok(())
    }

    fn grab(&mut self, buf: &mut [u8]) -> Result<ChannelOrder> {
        let w = self.width as usize;
        let needed = w * self.height as usize * 4;
        if buf.len() < needed {
            return Err(CastError::CaptureFailed(format!(
                "buffer holds {} bytes, frame needs {needed}",
                buf.len()
            )));
        }

        let phase = (self.frame_count % 256) as u8;
        for (i, px) in buf[..needed].chunks_exact_mut(4).enumerate() {
            let (x, y) = (i % w, i / w);
            px[0] = (x as u8).wrapping_add(phase);
            px[1] = (y as u8).wrapping_add(phase);
            px[2] = ((x + y) as u8).wrapping_add(phase);
            px[3] = 255;
        }
        self.frame_count += 1;
        Ok(ChannelOrder::Bgra)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_moves_between_grabs() {
        let mut desk = SyntheticDesktop::new(4, 4);
        let mut a = vec![0u8; 64];
        let mut b = vec![0u8; 64];
        assert_eq!(desk.grab(&mut a).unwrap(), ChannelOrder::Bgra);
        desk.grab(&mut b).unwrap();
        assert_ne!(a, b);
        assert_eq!(desk.frame_count(), 2);
        assert!(a.chunks_exact(4).all(|px| px[3] == 255));
    }

    #[test]
    fn short_buffer_is_rejected() {
        let mut desk = SyntheticDesktop::new(4, 4);
        assert!(desk.grab(&mut [0u8; 10]).is_err());
    }
}
