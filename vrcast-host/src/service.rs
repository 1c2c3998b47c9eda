//! Host run loop.
//!
//! [`HostService`] wires the process's inputs and outputs into a
//! [`StreamSession`]: stdin feeds the sensor reader, the snapshot file is
//! polled every tick, the desktop comes from the configured capture
//! backend, and framed messages go to stdout. [`HeadlessScene`] stands in
//! for the renderer by compositing the desktop panel as-is.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use vrcast_core::pipeline::capture::open_native_backend;
use vrcast_core::pipeline::h264::contains_keyframe;
use vrcast_core::{
    CapturedFrame, CastError, CompositeFrame, DesktopCaptureSource, FrameStreamReader, H264Decoder,
    HandRecord, InputReadiness, SceneHost, SensorSample, SensorStreamReader, SessionStats,
    StdinReadiness, StreamSession, SyntheticDesktop, WireFormat, ZstdDecoder,
};

use crate::config::{BackendKind, HostConfig};

// ── HeadlessScene ────────────────────────────────────────────────

/// Scene host without a renderer: the composite is the desktop panel.
///
/// Odd desktop dimensions are cropped by one pixel so the composite always
/// meets the encoder's even-size requirement.
#[derive(Debug, Default)]
pub struct HeadlessScene {
    width: u32,
    height: u32,
    rgba: Vec<u8>,
    orientation: SensorSample,
    hands: usize,
    rendered: u64,
}

impl HeadlessScene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn orientation(&self) -> SensorSample {
        self.orientation
    }

    /// Hands in the last tracking update.
    pub fn hand_count(&self) -> usize {
        self.hands
    }

    pub fn frames_rendered(&self) -> u64 {
        self.rendered
    }
}

impl SceneHost for HeadlessScene {
    fn apply_orientation(&mut self, sample: &SensorSample) {
        self.orientation = *sample;
    }

    fn update_tracking(&mut self, hands: &[HandRecord]) {
        if hands.len() != self.hands {
            debug!(hands = hands.len(), "tracked hands changed");
        }
        self.hands = hands.len();
    }

    fn update_desktop(&mut self, frame: &CapturedFrame) {
        let width = frame.width & !1;
        let height = frame.height & !1;
        let row = frame.width as usize * 4;
        let kept = width as usize * 4;

        self.rgba.clear();
        if width == 0 || height == 0 {
            self.width = 0;
            self.height = 0;
            return;
        }
        for line in frame.pixels.chunks_exact(row).take(height as usize) {
            self.rgba.extend_from_slice(&line[..kept]);
        }
        self.width = width;
        self.height = height;
    }

    fn render(&mut self) {
        self.rendered += 1;
    }

    fn composite(&mut self) -> Option<CompositeFrame<'_>> {
        if self.width == 0 || self.height == 0 {
            return None;
        }
        Some(CompositeFrame {
            width: self.width,
            height: self.height,
            rgba: &self.rgba,
        })
    }
}

// ── HostService ──────────────────────────────────────────────────

/// The streaming host.
///
/// The service starts out running; clearing the flag (from [`stop`](Self::stop),
/// the stop handle or a signal handler) before or during [`stream`](Self::stream)
/// ends the loop.
pub struct HostService {
    config: HostConfig,
    running: Arc<AtomicBool>,
}

impl HostService {
    pub fn new(config: HostConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Get a handle to stop the service from another thread.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Stream stdout until stopped, the frame limit is reached or the
    /// consumer goes away. Orientation samples are read from stdin when
    /// enabled.
    pub fn run(&self) -> Result<SessionStats, CastError> {
        let out = io::stdout().lock();
        if self.config.inputs.sensor_stdin {
            self.stream(out, Some((io::stdin(), StdinReadiness)))
        } else {
            self.stream(out, None::<(io::Empty, StdinReadiness)>)
        }
    }

    /// Run a session writing to `out`, with an optional sensor input.
    pub fn stream<W, R, P>(&self, out: W, sensor: Option<(R, P)>) -> Result<SessionStats, CastError>
    where
        W: Write,
        R: Read + Send + 'static,
        P: InputReadiness + 'static,
    {
        self.stream_scene(out, sensor, &mut HeadlessScene::new())
    }

    /// [`stream`](Self::stream) driving a caller-owned scene.
    pub fn stream_scene<W, R, P>(
        &self,
        out: W,
        sensor: Option<(R, P)>,
        scene: &mut HeadlessScene,
    ) -> Result<SessionStats, CastError>
    where
        W: Write,
        R: Read + Send + 'static,
        P: InputReadiness + 'static,
    {
        let mut session = StreamSession::new(self.config.to_session_config(), out)?;
        session.attach_capture(self.open_capture()?);
        if let Some((input, readiness)) = sensor {
            let reader = SensorStreamReader::spawn(
                input,
                readiness,
                session.sensor_queue(),
                self.config.sensor_poll(),
            )?;
            session.attach_sensor_reader(reader);
        }

        let limit = self.config.pipeline.max_frames;
        let period = self.config.render_period();
        info!(
            backend = ?self.config.capture.backend,
            mode = ?self.config.encoder.mode,
            render_hz = self.config.pipeline.render_hz,
            limit,
            "streaming started"
        );

        let mut outcome = Ok(());
        while self.running.load(Ordering::SeqCst) {
            let started = Instant::now();
            if let Err(e) = session.tick(scene) {
                outcome = Err(e);
                break;
            }
            if limit > 0 && session.stats().frames_emitted >= limit {
                info!(frames = limit, "frame limit reached");
                break;
            }
            pace(started, period);
        }
        self.running.store(false, Ordering::SeqCst);

        let stats = session.shutdown();
        outcome.and(stats)
    }

    fn open_capture(&self) -> Result<DesktopCaptureSource, CastError> {
        let mut source = DesktopCaptureSource::new(self.config.to_capture_config())?;
        match self.config.capture.backend {
            BackendKind::Auto => source.initialize(open_native_backend)?,
            BackendKind::Synthetic => {
                let (w, h) = (
                    self.config.capture.synthetic_width,
                    self.config.capture.synthetic_height,
                );
                source.initialize(move || Ok(SyntheticDesktop::new(w, h)))?;
            }
        }
        Ok(source)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Sleep off the rest of `period`; an overrun starts the next tick at once.
fn pace(started: Instant, period: Duration) {
    let elapsed = started.elapsed();
    if elapsed < period {
        thread::sleep(period - elapsed);
    }
}

// ── Stream inspector ─────────────────────────────────────────────

/// Totals from [`inspect`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InspectSummary {
    pub messages: u64,
    pub payload_bytes: u64,
    pub raw_frames: u64,
    /// Pictures decoded from H.264 messages plus zstd units decoded.
    pub access_units: u64,
    /// H.264 messages carrying an IDR plus zstd keyframe units.
    pub keyframes: u64,
}

/// Read a framed stream to its end, logging one line per message and
/// decoding compressed payloads.
pub fn inspect<R: Read>(input: R) -> Result<InspectSummary, CastError> {
    let mut reader = FrameStreamReader::new(input);
    let mut h264 = H264Decoder::new()?;
    let mut zstd = ZstdDecoder::new();
    let mut summary = InspectSummary::default();

    while let Some((header, payload)) = reader.read_message()? {
        summary.messages += 1;
        summary.payload_bytes += payload.len() as u64;
        info!(
            seq = summary.messages,
            timestamp_ms = header.timestamp_ms,
            width = header.width,
            height = header.height,
            size = header.frame_size,
            format = header.pixel_format,
            "message"
        );

        match header.format() {
            Some(WireFormat::Compressed) => {
                let pictures = h264.decode_payload(&payload)?;
                summary.access_units += pictures.len() as u64;
                if contains_keyframe(&payload) {
                    summary.keyframes += 1;
                }
                debug!(pictures = pictures.len(), "h264 payload");
            }
            Some(WireFormat::ZstdUnits) => {
                for frame in zstd.decode_payload(&payload)? {
                    summary.access_units += 1;
                    if frame.keyframe {
                        summary.keyframes += 1;
                    }
                    debug!(pts = frame.pts, keyframe = frame.keyframe, "access unit");
                }
            }
            Some(format @ (WireFormat::RawRgba | WireFormat::RawRgb)) => {
                let channels = if format == WireFormat::RawRgba { 4 } else { 3 };
                let expected = header.width as usize * header.height as usize * channels;
                if payload.len() != expected {
                    warn!(expected, got = payload.len(), "raw payload size mismatch");
                }
                summary.raw_frames += 1;
            }
            None => warn!(format = header.pixel_format, "unknown pixel format"),
        }
    }

    info!(
        messages = summary.messages,
        bytes = summary.payload_bytes,
        units = summary.access_units,
        keyframes = summary.keyframes,
        "end of stream"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamMode;
    use std::io::Cursor;
    use std::time::Instant;
    use vrcast_core::AlwaysReady;

    fn synthetic_config(mode: StreamMode, frames: u64) -> HostConfig {
        let mut config = HostConfig::default();
        config.capture.backend = BackendKind::Synthetic;
        config.capture.synthetic_width = 64;
        config.capture.synthetic_height = 32;
        config.capture.rate_fps = 200.0;
        config.encoder.mode = mode;
        config.encoder.fps = 500;
        config.pipeline.panel_refresh_hz = 0.0;
        config.pipeline.max_frames = frames;
        config.inputs.sensor_stdin = false;
        config.inputs.snapshot_path = String::new();
        config
    }

    fn no_sensor() -> Option<(io::Empty, AlwaysReady)> {
        None
    }

    #[test]
    fn service_creates_with_defaults() {
        let svc = HostService::new(HostConfig::default());
        assert!(svc.is_running());
    }

    #[test]
    fn stop_handle_works() {
        let svc = HostService::new(HostConfig::default());
        let handle = svc.stop_handle();
        handle.store(false, Ordering::SeqCst);
        assert!(!svc.is_running());
    }

    #[test]
    fn stop_before_streaming_is_honoured() {
        let svc = HostService::new(synthetic_config(StreamMode::Rgba, 0));
        svc.stop_handle().store(false, Ordering::SeqCst);
        let stats = svc.stream(io::sink(), no_sensor()).unwrap();
        assert_eq!(stats.ticks, 0);
        assert_eq!(stats.messages_written, 0);
    }

    #[test]
    fn raw_stream_stops_at_frame_limit() {
        let svc = HostService::new(synthetic_config(StreamMode::Rgba, 3));
        let mut out = Vec::new();
        let stats = svc.stream(&mut out, no_sensor()).unwrap();
        assert_eq!(stats.frames_emitted, 3);
        assert_eq!(stats.messages_written, 3);
        assert!(!svc.is_running());

        let summary = inspect(Cursor::new(out)).unwrap();
        assert_eq!(summary.messages, 3);
        assert_eq!(summary.raw_frames, 3);
        assert_eq!(summary.payload_bytes, 3 * 64 * 32 * 4);
    }

    #[test]
    fn compressed_stream_decodes_in_inspector() {
        let svc = HostService::new(synthetic_config(StreamMode::Compressed, 5));
        let mut out = Vec::new();
        let stats = svc.stream(&mut out, no_sensor()).unwrap();
        assert_eq!(stats.frames_encoded, 5);

        assert!(out.len() > 24 + 4);
        assert_eq!(&out[24..28], &[0, 0, 0, 1]);
        let summary = inspect(Cursor::new(out)).unwrap();
        assert_eq!(summary.messages, 5);
        assert_eq!(summary.access_units, 5);
        assert!(summary.keyframes >= 1);
    }

    #[test]
    fn zstd_stream_decodes_in_inspector() {
        let svc = HostService::new(synthetic_config(StreamMode::Zstd, 4));
        let mut out = Vec::new();
        let stats = svc.stream(&mut out, no_sensor()).unwrap();

        assert_eq!(&out[20..24], &3u32.to_le_bytes());
        let summary = inspect(Cursor::new(out)).unwrap();
        assert_eq!(summary.access_units, stats.units_written);
        assert_eq!(summary.keyframes, 1);
    }

    /// Reports through a flag once its input is exhausted.
    struct FlagAtEof {
        inner: Cursor<Vec<u8>>,
        done: Arc<AtomicBool>,
    }

    impl Read for FlagAtEof {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.inner.read(buf)?;
            if n == 0 {
                self.done.store(true, Ordering::SeqCst);
            }
            Ok(n)
        }
    }

    #[test]
    fn sensor_input_reaches_the_session() {
        let svc = HostService::new(synthetic_config(StreamMode::Rgb, 0));
        let done = Arc::new(AtomicBool::new(false));
        let input = FlagAtEof {
            inner: Cursor::new(b"{\"alpha\":30}\n{\"alpha\":60}\n".to_vec()),
            done: Arc::clone(&done),
        };

        // Keep ticking until the reader has drained its input, then long
        // enough for the session to pop both samples.
        let handle = svc.stop_handle();
        let stopper = thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(5);
            while !done.load(Ordering::SeqCst) && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(2));
            }
            thread::sleep(Duration::from_millis(200));
            handle.store(false, Ordering::SeqCst);
        });

        let mut scene = HeadlessScene::new();
        let stats = svc
            .stream_scene(Vec::new(), Some((input, AlwaysReady)), &mut scene)
            .unwrap();
        stopper.join().unwrap();

        assert_eq!(stats.sensor_samples, 2);
        assert!(stats.ticks >= 2);
        assert!((scene.orientation().yaw - 60f32.to_radians()).abs() < 1e-6);
    }

    #[test]
    fn cleared_handle_ends_the_loop() {
        let svc = HostService::new(synthetic_config(StreamMode::Rgba, 0));
        let handle = svc.stop_handle();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            handle.store(false, Ordering::SeqCst);
        });
        let start = Instant::now();
        let stats = svc.stream(io::sink(), no_sensor()).unwrap();
        stopper.join().unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(stats.ticks > 0);
    }

    #[test]
    fn headless_scene_crops_odd_desktop() {
        let mut scene = HeadlessScene::new();
        assert!(scene.composite().is_none());

        let mut pixels = Vec::new();
        for i in 0..(3 * 3) {
            pixels.extend_from_slice(&[i as u8, 0, 0, 255]);
        }
        scene.update_desktop(&CapturedFrame {
            pixels,
            width: 3,
            height: 3,
            channels: 4,
            valid: true,
            timestamp: Instant::now(),
        });

        let frame = scene.composite().unwrap();
        assert_eq!((frame.width, frame.height), (2, 2));
        let reds: Vec<u8> = frame.rgba.chunks_exact(4).map(|px| px[0]).collect();
        assert_eq!(reds, vec![0, 1, 3, 4]);
    }

    #[test]
    fn inspect_rejects_bad_magic() {
        let err = inspect(Cursor::new(vec![0u8; 24])).unwrap_err();
        assert!(matches!(err, CastError::InvalidMagic(0)));
    }
}
