//! X11 `GetImage` capture of the root window.

use x11rb::connection::Connection;
use x11rb::protocol::xproto::{ConnectionExt, ImageFormat, Window};
use x11rb::rust_connection::RustConnection;

use crate::error::{CastError, Result};
use crate::pipeline::capture::CaptureBackend;
use crate::pipeline::types::ChannelOrder;

/// Root-window capture over a plain X11 connection.
pub struct X11Backend {
    conn: RustConnection,
    root: Window,
    width: u32,
    height: u32,
}

impl X11Backend {
    /// Connect to `$DISPLAY`.
    pub fn open() -> Result<Self> {
        let (conn, screen_num) = x11rb::connect(None)
            .map_err(|e| CastError::CaptureUnavailable(format!("X11 connect failed: {e}")))?;
        let root = conn
            .setup()
            .roots
            .get(screen_num)
            .map(|screen| screen.root)
            .ok_or_else(|| CastError::CaptureUnavailable(format!("screen {screen_num} not found")))?;
        Ok(Self {
            conn,
            root,
            width: 0,
            height: 0,
        })
    }
}

impl CaptureBackend for X11Backend {
    /// Asked of the server on every call; the setup block only holds the
    /// size at connect time.
    fn display_size(&mut self) -> Result<(u32, u32)> {
        let geometry = self
            .conn
            .get_geometry(self.root)
            .map_err(|e| CastError::CaptureFailed(format!("GetGeometry request failed: {e}")))?
            .reply()
            .map_err(|e| CastError::CaptureFailed(format!("GetGeometry reply failed: {e}")))?;
        Ok((u32::from(geometry.width), u32::from(geometry.height)))
    }

    fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        if width > u32::from(u16::MAX) || height > u32::from(u16::MAX) {
            return Err(CastError::CaptureFailed(format!(
                "display {width}x{height} exceeds the X11 request limits"
            )));
        }
        self.width = width;
        self.height = height;
        Ok(())
    }

    fn grab(&mut self, buf: &mut [u8]) -> Result<ChannelOrder> {
        let reply = self
            .conn
            .get_image(
                ImageFormat::Z_PIXMAP,
                self.root,
                0,
                0,
                self.width as u16,
                self.height as u16,
                !0,
            )
            .map_err(|e| CastError::CaptureFailed(format!("GetImage request failed: {e}")))?
            .reply()
            .map_err(|e| CastError::CaptureFailed(format!("GetImage reply failed: {e}")))?;

        let needed = self.width as usize * self.height as usize * 4;
        if reply.data.len() < needed || buf.len() < needed {
            return Err(CastError::CaptureFailed(format!(
                "GetImage returned {} bytes at depth {}, expected {needed}",
                reply.data.len(),
                reply.depth
            )));
        }
        buf[..needed].copy_from_slice(&reply.data[..needed]);
        // Depth-24 visuals leave the padding byte at zero.
        for px in buf[..needed].chunks_exact_mut(4) {
            px[3] = 255;
        }
        Ok(ChannelOrder::Bgra)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_size_comes_from_the_live_root_geometry() {
        // Needs an X server; nothing to check on a headless runner.
        let Ok(mut backend) = X11Backend::open() else {
            return;
        };
        let geometry = backend
            .conn
            .get_geometry(backend.root)
            .unwrap()
            .reply()
            .unwrap();
        let size = backend.display_size().unwrap();
        assert_eq!(size, (u32::from(geometry.width), u32::from(geometry.height)));
        assert_eq!(backend.display_size().unwrap(), size);
    }
}
