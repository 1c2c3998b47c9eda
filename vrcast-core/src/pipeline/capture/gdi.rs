//! GDI BitBlt capture for Windows.
//!
//! The screen DC and memory DC live as long as the backend; the compatible
//! bitmap is recreated only when the display size changes. All handles are
//! released in `Drop` on the capture thread that created them.

use std::ffi::c_void;
use std::mem;

use windows::Win32::Foundation::HWND;
use windows::Win32::Graphics::Gdi::{
    BI_RGB, BITMAPINFO, BITMAPINFOHEADER, BitBlt, CreateCompatibleBitmap, CreateCompatibleDC,
    DIB_RGB_COLORS, DeleteDC, DeleteObject, GetDC, GetDIBits, HBITMAP, HDC, HGDIOBJ, ReleaseDC,
    SRCCOPY, SelectObject,
};
use windows::Win32::UI::WindowsAndMessaging::{GetSystemMetrics, SM_CXSCREEN, SM_CYSCREEN};

use crate::error::{CastError, Result};
use crate::pipeline::capture::CaptureBackend;
use crate::pipeline::types::ChannelOrder;

/// Primary-monitor capture through a memory DC.
pub struct GdiBackend {
    screen_dc: HDC,
    memory_dc: HDC,
    bitmap: Option<HBITMAP>,
    info: BITMAPINFO,
    width: u32,
    height: u32,
}

impl GdiBackend {
    /// Acquire the screen DC and a compatible memory DC.
    pub fn open() -> Result<Self> {
        // SAFETY: plain GDI calls; every handle acquired here is released
        // in `Drop` or on the error path below.
        unsafe {
            let screen_dc = GetDC(HWND::default());
            if screen_dc.is_invalid() {
                return Err(CastError::CaptureUnavailable("GetDC(NULL) failed".into()));
            }
            let memory_dc = CreateCompatibleDC(screen_dc);
            if memory_dc.is_invalid() {
                ReleaseDC(HWND::default(), screen_dc);
                return Err(CastError::CaptureUnavailable(
                    "CreateCompatibleDC failed".into(),
                ));
            }
            Ok(Self {
                screen_dc,
                memory_dc,
                bitmap: None,
                info: BITMAPINFO::default(),
                width: 0,
                height: 0,
            })
        }
    }

    fn release_bitmap(&mut self) {
        if let Some(bitmap) = self.bitmap.take() {
            // SAFETY: the bitmap is not selected into any DC between grabs.
            unsafe {
                let _ = DeleteObject(HGDIOBJ(bitmap.0));
            }
        }
    }
}

impl CaptureBackend for GdiBackend {
    fn display_size(&mut self) -> Result<(u32, u32)> {
        // SAFETY: GetSystemMetrics has no preconditions.
        let (w, h) = unsafe { (GetSystemMetrics(SM_CXSCREEN), GetSystemMetrics(SM_CYSCREEN)) };
        if w <= 0 || h <= 0 {
            return Err(CastError::CaptureFailed(format!("invalid screen size {w}x{h}")));
        }
        Ok((w as u32, h as u32))
    }

    fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.release_bitmap();

        // SAFETY: screen_dc is valid for the backend's lifetime.
        let bitmap = unsafe { CreateCompatibleBitmap(self.screen_dc, width as i32, height as i32) };
        if bitmap.is_invalid() {
            return Err(CastError::CaptureFailed(
                "CreateCompatibleBitmap failed".into(),
            ));
        }
        self.bitmap = Some(bitmap);

        self.info = BITMAPINFO::default();
        self.info.bmiHeader = BITMAPINFOHEADER {
            biSize: mem::size_of::<BITMAPINFOHEADER>() as u32,
            biWidth: width as i32,
            // Negative height selects top-down rows.
            biHeight: -(height as i32),
            biPlanes: 1,
            biBitCount: 32,
            biCompression: BI_RGB.0,
            ..Default::default()
        };
        self.width = width;
        self.height = height;
        Ok(())
    }

    fn grab(&mut self, buf: &mut [u8]) -> Result<ChannelOrder> {
        let Some(bitmap) = self.bitmap else {
            return Err(CastError::CaptureFailed("grab before resize".into()));
        };
        let needed = self.width as usize * self.height as usize * 4;
        if buf.len() < needed {
            return Err(CastError::CaptureFailed(format!(
                "buffer holds {} bytes, frame needs {needed}",
                buf.len()
            )));
        }

        // SAFETY: DCs and bitmap are valid; `buf` holds `needed` bytes, which
        // is exactly what GetDIBits writes for a 32-bit top-down DIB.
        unsafe {
            let previous = SelectObject(self.memory_dc, HGDIOBJ(bitmap.0));
            let blit = BitBlt(
                self.memory_dc,
                0,
                0,
                self.width as i32,
                self.height as i32,
                self.screen_dc,
                0,
                0,
                SRCCOPY,
            );
            SelectObject(self.memory_dc, previous);
            blit.map_err(|e| CastError::CaptureFailed(format!("BitBlt failed: {e}")))?;

            let lines = GetDIBits(
                self.screen_dc,
                bitmap,
                0,
                self.height,
                Some(buf.as_mut_ptr() as *mut c_void),
                &mut self.info,
                DIB_RGB_COLORS,
            );
            if lines == 0 {
                return Err(CastError::CaptureFailed("GetDIBits failed".into()));
            }
        }

        // GDI leaves alpha undefined for screen bitmaps.
        for px in buf[..needed].chunks_exact_mut(4) {
            px[3] = 255;
        }
        Ok(ChannelOrder::Bgra)
    }
}

impl Drop for GdiBackend {
    fn drop(&mut self) {
        self.release_bitmap();
        // SAFETY: both DCs were acquired in `open` and are released once.
        unsafe {
            let _ = DeleteDC(self.memory_dc);
            ReleaseDC(HWND::default(), self.screen_dc);
        }
    }
}
