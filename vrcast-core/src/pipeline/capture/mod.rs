//! Desktop capture on a dedicated thread.
//!
//! [`DesktopCaptureSource`] owns one capture thread. The thread creates its
//! [`CaptureBackend`] itself (native handles are thread-affine), grabs the
//! desktop at a configurable rate, converts every frame to canonical RGBA
//! and pushes it into a depth-capped queue, discarding the oldest frames
//! when the consumer falls behind.
//!
//! ```text
//! Stopped ──initialize──▶ Starting ──backend ready──▶ Running
//!    ▲                                                  │
//!    └──────────── join ◀── Stopping ◀──cleanup─────────┘
//! ```
//!
//! A thread that leaves its loop on its own, panics included, lands in
//! `Stopped` as well.

mod synthetic;

#[cfg(target_os = "windows")]
mod gdi;

#[cfg(all(target_os = "linux", feature = "x11"))]
mod x11;

pub use synthetic::SyntheticDesktop;

#[cfg(target_os = "windows")]
pub use gdi::GdiBackend;

#[cfg(all(target_os = "linux", feature = "x11"))]
pub use x11::X11Backend;

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, mpsc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{CastError, Result};
use crate::pipeline::convert::to_canonical_rgba;
use crate::pipeline::types::{CANONICAL_CHANNELS, CaptureState, CapturedFrame, ChannelOrder};
use crate::queue::ConcurrentQueue;

/// Interval between throughput log lines.
const REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Longest single sleep, so a stop request is noticed promptly even at
/// low capture rates.
const MAX_SLEEP_SLICE: Duration = Duration::from_millis(20);

// ── CaptureBackend ───────────────────────────────────────────────

/// Platform framebuffer access, owned by the capture thread.
///
/// Resources are acquired lazily: [`resize`](Self::resize) is called
/// before the first grab and again only when the display size changes.
/// `Drop` releases everything exactly once.
pub trait CaptureBackend {
    /// Current display dimensions in pixels.
    fn display_size(&mut self) -> Result<(u32, u32)>;

    /// (Re)allocate size-dependent resources.
    fn resize(&mut self, width: u32, height: u32) -> Result<()>;

    /// Copy the framebuffer into `buf` (`width * height * 4` bytes, top-down
    /// rows) and report the native channel order written.
    fn grab(&mut self, buf: &mut [u8]) -> Result<ChannelOrder>;
}

impl<B: CaptureBackend + ?Sized> CaptureBackend for Box<B> {
    fn display_size(&mut self) -> Result<(u32, u32)> {
        (**self).display_size()
    }

    fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        (**self).resize(width, height)
    }

    fn grab(&mut self, buf: &mut [u8]) -> Result<ChannelOrder> {
        (**self).grab(buf)
    }
}

/// Open the native backend for this platform.
#[cfg(target_os = "windows")]
pub fn open_native_backend() -> Result<Box<dyn CaptureBackend>> {
    Ok(Box::new(GdiBackend::open()?))
}

/// Open the native backend for this platform.
#[cfg(all(target_os = "linux", feature = "x11"))]
pub fn open_native_backend() -> Result<Box<dyn CaptureBackend>> {
    Ok(Box::new(X11Backend::open()?))
}

/// No native backend is compiled in for this platform.
#[cfg(not(any(target_os = "windows", all(target_os = "linux", feature = "x11"))))]
pub fn open_native_backend() -> Result<Box<dyn CaptureBackend>> {
    Err(CastError::CaptureUnavailable(
        "no native capture backend for this platform".into(),
    ))
}

// ── CaptureConfig ────────────────────────────────────────────────

/// Capture thread parameters.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Target grabs per second.
    pub rate_fps: f32,
    /// Frames kept queued; older frames are discarded first.
    pub queue_depth: usize,
    /// How long `initialize` waits for the thread to reach `Running`.
    pub startup_timeout: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            rate_fps: 60.0,
            queue_depth: 3,
            startup_timeout: Duration::from_millis(1000),
        }
    }
}

// ── Shared state ─────────────────────────────────────────────────

/// Slowest accepted capture rate.
pub const MIN_RATE_FPS: f32 = 0.01;
/// Fastest accepted capture rate.
pub const MAX_RATE_FPS: f32 = 1000.0;

const MAX_PERIOD: Duration = Duration::from_secs(100);

/// State that outlives individual capture threads.
struct Shared {
    queue: ConcurrentQueue<CapturedFrame>,
    /// `f32` bits of the current rate.
    rate_bits: AtomicU32,
    depth: usize,
    captured: AtomicU64,
    dropped: AtomicU64,
}

impl Shared {
    fn period(&self) -> Duration {
        let fps = f32::from_bits(self.rate_bits.load(Ordering::Relaxed));
        Duration::try_from_secs_f32(1.0 / fps).unwrap_or(MAX_PERIOD)
    }
}

/// Stop flag and lifecycle state of one spawned thread. A thread left
/// behind by a startup timeout keeps its own copy, so it can never touch
/// the state of a later run.
struct Run {
    stop: AtomicBool,
    state: AtomicU8,
}

impl Run {
    fn new(state: CaptureState) -> Arc<Self> {
        Arc::new(Self {
            stop: AtomicBool::new(false),
            state: AtomicU8::new(state as u8),
        })
    }

    fn state(&self) -> CaptureState {
        CaptureState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: CaptureState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Move from `from` to `to`; false if another party moved first.
    fn advance(&self, from: CaptureState, to: CaptureState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Marks the run `Stopped` when the capture thread exits, panics included.
struct StoppedOnExit(Arc<Run>);

impl Drop for StoppedOnExit {
    fn drop(&mut self) {
        self.0.set_state(CaptureState::Stopped);
    }
}

fn validate_rate(fps: f32) -> Result<f32> {
    if (MIN_RATE_FPS..=MAX_RATE_FPS).contains(&fps) {
        Ok(fps)
    } else {
        Err(CastError::Config(format!(
            "capture rate must be within {MIN_RATE_FPS}..={MAX_RATE_FPS} fps, got {fps}"
        )))
    }
}

// ── DesktopCaptureSource ─────────────────────────────────────────

/// Owner of the capture thread and its frame queue.
pub struct DesktopCaptureSource {
    shared: Arc<Shared>,
    run: Arc<Run>,
    startup_timeout: Duration,
    handle: Option<JoinHandle<()>>,
}

impl DesktopCaptureSource {
    pub fn new(config: CaptureConfig) -> Result<Self> {
        let rate = validate_rate(config.rate_fps)?;
        if config.queue_depth == 0 {
            return Err(CastError::Config("capture queue depth must be at least 1".into()));
        }
        Ok(Self {
            shared: Arc::new(Shared {
                queue: ConcurrentQueue::new(),
                rate_bits: AtomicU32::new(rate.to_bits()),
                depth: config.queue_depth,
                captured: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
            run: Run::new(CaptureState::Stopped),
            startup_timeout: config.startup_timeout,
            handle: None,
        })
    }

    /// Spawn the capture thread and wait until it is `Running`.
    ///
    /// `open` runs on the capture thread and builds the backend there. Its
    /// error is returned as-is; a thread that does not report within the
    /// startup timeout yields [`CastError::StartupTimeout`]. Calling this
    /// on a running source is a no-op.
    pub fn initialize<B, F>(&mut self, open: F) -> Result<()>
    where
        B: CaptureBackend + 'static,
        F: FnOnce() -> Result<B> + Send + 'static,
    {
        if self.is_initialized() {
            debug!("capture already running");
            return Ok(());
        }
        if let Some(finished) = self.handle.take() {
            // A previous thread already left its loop.
            self.run.stop.store(true, Ordering::Release);
            if finished.join().is_err() {
                warn!("previous capture thread panicked");
            }
        }

        let run = Run::new(CaptureState::Starting);
        self.run = Arc::clone(&run);

        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("vrcast-capture".into())
            .spawn(move || match open() {
                Ok(backend) => {
                    if !run.advance(CaptureState::Starting, CaptureState::Running) {
                        // initialize gave up while the backend was opening
                        return;
                    }
                    let _exit = StoppedOnExit(Arc::clone(&run));
                    // The receiver is gone only if initialize already gave up.
                    let _ = ready_tx.send(Ok(()));
                    capture_loop(backend, &shared, &run.stop);
                }
                Err(e) => {
                    run.set_state(CaptureState::Stopped);
                    let _ = ready_tx.send(Err(e));
                }
            });
        let handle = match spawned {
            Ok(h) => h,
            Err(e) => {
                self.run.set_state(CaptureState::Stopped);
                return Err(CastError::CaptureUnavailable(format!(
                    "cannot spawn capture thread: {e}"
                )));
            }
        };

        let outcome = match ready_rx.recv_timeout(self.startup_timeout) {
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if self.run.advance(CaptureState::Starting, CaptureState::Stopped) {
                    // The thread sees the lost race once its backend opens
                    // and exits; it is detached so the caller is not held.
                    self.run.stop.store(true, Ordering::Release);
                    warn!(timeout = ?self.startup_timeout, "capture thread startup timed out");
                    return Err(CastError::StartupTimeout(self.startup_timeout));
                }
                // The thread moved first; its report is already on the way.
                ready_rx.recv().map_err(|_| mpsc::RecvTimeoutError::Disconnected)
            }
            other => other,
        };

        match outcome {
            Ok(Ok(())) => {
                self.handle = Some(handle);
                info!(
                    rate_fps = self.capture_rate(),
                    depth = self.shared.depth,
                    "screen capture running"
                );
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                warn!(error = %e, "capture backend failed to open");
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                self.run.set_state(CaptureState::Stopped);
                Err(CastError::CaptureUnavailable(
                    "capture thread exited during startup".into(),
                ))
            }
        }
    }

    /// Stop the thread, join it and drain residual frames.
    pub fn cleanup(&mut self) {
        let Some(handle) = self.handle.take() else {
            self.shared.queue.clear();
            return;
        };
        self.run.advance(CaptureState::Running, CaptureState::Stopping);
        self.run.stop.store(true, Ordering::Release);
        if handle.join().is_err() {
            warn!("capture thread panicked");
        }
        let residual = self.shared.queue.clear();
        self.run.set_state(CaptureState::Stopped);
        info!(
            residual,
            captured = self.frames_captured(),
            dropped = self.frames_dropped(),
            "screen capture stopped"
        );
    }

    /// Pop the oldest queued frame without blocking. `None` is the normal
    /// answer when the consumer polls faster than the producer.
    pub fn latest_frame(&self) -> Option<CapturedFrame> {
        self.shared.queue.try_pop()
    }

    /// Change the capture rate; takes effect on the next iteration.
    pub fn set_capture_rate(&self, fps: f32) -> Result<()> {
        let fps = validate_rate(fps)?;
        self.shared.rate_bits.store(fps.to_bits(), Ordering::Relaxed);
        Ok(())
    }

    pub fn capture_rate(&self) -> f32 {
        f32::from_bits(self.shared.rate_bits.load(Ordering::Relaxed))
    }

    pub fn state(&self) -> CaptureState {
        self.run.state()
    }

    pub fn is_initialized(&self) -> bool {
        self.handle.is_some() && self.state() == CaptureState::Running
    }

    /// Frames currently queued.
    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }

    /// Frames pushed since construction.
    pub fn frames_captured(&self) -> u64 {
        self.shared.captured.load(Ordering::Relaxed)
    }

    /// Frames discarded by the depth cap since construction.
    pub fn frames_dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for DesktopCaptureSource {
    fn drop(&mut self) {
        self.cleanup();
    }
}

// ── Capture loop ─────────────────────────────────────────────────

fn capture_loop<B: CaptureBackend>(mut backend: B, shared: &Shared, stop: &AtomicBool) {
    let mut size = (0u32, 0u32);
    let mut window_frames = 0u64;
    let mut last_report = Instant::now();

    while !stop.load(Ordering::Acquire) {
        let started = Instant::now();

        match grab_frame(&mut backend, &mut size) {
            Ok(frame) => {
                let dropped = shared.queue.push_bounded(frame, shared.depth);
                shared.captured.fetch_add(1, Ordering::Relaxed);
                shared.dropped.fetch_add(dropped as u64, Ordering::Relaxed);
                window_frames += 1;
            }
            Err(e) => debug!(error = %e, "desktop grab failed"),
        }

        if last_report.elapsed() >= REPORT_INTERVAL {
            info!(
                frames = window_frames,
                queue_len = shared.queue.len(),
                "capture throughput"
            );
            window_frames = 0;
            last_report = Instant::now();
        }

        let deadline = started + shared.period();
        loop {
            let now = Instant::now();
            if now >= deadline || stop.load(Ordering::Acquire) {
                break;
            }
            thread::sleep((deadline - now).min(MAX_SLEEP_SLICE));
        }
    }
    // `backend` drops here, on the thread that created it.
}

fn grab_frame<B: CaptureBackend>(backend: &mut B, size: &mut (u32, u32)) -> Result<CapturedFrame> {
    let (width, height) = backend.display_size()?;
    if width == 0 || height == 0 {
        return Err(CastError::CaptureFailed(format!(
            "invalid display size {width}x{height}"
        )));
    }
    if (width, height) != *size {
        backend.resize(width, height)?;
        debug!(width, height, "capture resources allocated");
        *size = (width, height);
    }

    let mut pixels = vec![0u8; width as usize * height as usize * CANONICAL_CHANNELS as usize];
    let order = backend.grab(&mut pixels)?;
    to_canonical_rgba(&mut pixels, order);
    Ok(CapturedFrame::from_rgba(width, height, pixels))
}

// ── Tests ────────────────────────────────────────────────────────
