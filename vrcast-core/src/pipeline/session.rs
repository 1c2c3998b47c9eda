//! Per-frame driver tying the producers to the encoder and the output
//! stream.
//!
//! One [`StreamSession::tick`] is one render iteration:
//!
//! 1. Pop at most one sensor sample; reuse the last one when none arrived.
//! 2. Poll the shared snapshot file.
//! 3. On the panel cadence, pull a captured desktop frame.
//! 4. Render.
//! 5. On the encode cadence, encode the latest composite and write every
//!    access unit the encoder released as one message.
//!
//! Everything runs on the caller's thread, so the encoder and the writer
//! need no locking. An encoder or writer failure ends the session.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use crate::error::{CastError, Result};
use crate::ingest::sensor::{SensorSample, SensorStreamReader};
use crate::ingest::snapshot::{HandRecord, SharedSnapshotReader};
use crate::pipeline::capture::DesktopCaptureSource;
use crate::pipeline::convert::rgba_to_rgb;
use crate::pipeline::encoder::{
    Codec, EncodedAccessUnit, EncoderBackend, EncoderConfig, VideoEncoderAdapter,
};
use crate::pipeline::stream::FrameStreamWriter;
use crate::pipeline::types::{CapturedFrame, WireFormat};
use crate::queue::ConcurrentQueue;

// ── SceneHost ────────────────────────────────────────────────────

/// A rendered frame in canonical RGBA.
#[derive(Debug, Clone, Copy)]
pub struct CompositeFrame<'a> {
    pub width: u32,
    pub height: u32,
    pub rgba: &'a [u8],
}

/// The renderer the session drives.
pub trait SceneHost {
    /// Orient the view. Called every tick with the freshest known sample.
    fn apply_orientation(&mut self, sample: &SensorSample);

    /// Replace the tracked hands. Called every tick, possibly with none.
    fn update_tracking(&mut self, hands: &[HandRecord]);

    /// Upload a new desktop frame to the panel texture.
    fn update_desktop(&mut self, frame: &CapturedFrame);

    /// Draw one frame.
    fn render(&mut self);

    /// The most recently rendered frame, if one exists.
    fn composite(&mut self) -> Option<CompositeFrame<'_>>;
}

// ── Cadence ──────────────────────────────────────────────────────

/// Fixed-rate gate decoupling an activity from the render rate.
#[derive(Debug, Clone)]
pub struct Cadence {
    period: Duration,
    next: Option<Instant>,
}

impl Cadence {
    /// Longest period a gate waits between openings.
    pub const MAX_PERIOD: Duration = Duration::from_secs(3600);

    pub fn new(period: Duration) -> Self {
        Self {
            period: period.min(Self::MAX_PERIOD),
            next: None,
        }
    }

    /// A gate opening `hz` times per second. Non-positive rates open every
    /// time; rates too small to represent wait [`MAX_PERIOD`](Self::MAX_PERIOD).
    pub fn from_hz(hz: f32) -> Self {
        if hz.is_finite() && hz > 0.0 {
            Self::new(Duration::try_from_secs_f32(1.0 / hz).unwrap_or(Self::MAX_PERIOD))
        } else {
            Self::new(Duration::ZERO)
        }
    }

    /// Whether the gate is open at `now`. Opening schedules the next slot;
    /// a caller that fell more than a period behind is not paid back with
    /// a burst.
    pub fn ready(&mut self, now: Instant) -> bool {
        match self.next {
            Some(next) if now < next => false,
            Some(next) if now.duration_since(next) < self.period => {
                self.next = Some(next + self.period);
                true
            }
            _ => {
                self.next = Some(now + self.period);
                true
            }
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

// ── Configuration ────────────────────────────────────────────────

/// What the encode cadence writes to the output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// H.264 Annex-B access units (format 2).
    #[default]
    Compressed,
    /// Lossless zstd access units (format 3).
    Zstd,
    /// Uncompressed RGBA composites (format 0).
    RawRgba,
    /// Uncompressed RGB composites (format 1).
    RawRgb,
}

impl OutputMode {
    pub fn wire_format(self) -> WireFormat {
        match self {
            OutputMode::Compressed => WireFormat::Compressed,
            OutputMode::Zstd => WireFormat::ZstdUnits,
            OutputMode::RawRgba => WireFormat::RawRgba,
            OutputMode::RawRgb => WireFormat::RawRgb,
        }
    }
}

/// Session parameters.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub output: OutputMode,
    /// Encode cadence and encoder frame rate.
    pub encoder_fps: u32,
    /// Encoder pipeline depth; see [`EncoderConfig::max_latency_frames`].
    pub max_latency_frames: usize,
    /// Desktop panel refresh cadence.
    pub panel_refresh_hz: f32,
    /// Snapshot file to poll each tick; `None` disables tracking input.
    pub snapshot_path: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            output: OutputMode::Compressed,
            encoder_fps: 120,
            max_latency_frames: 0,
            panel_refresh_hz: 60.0,
            snapshot_path: None,
        }
    }
}

/// Running counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub ticks: u64,
    pub panel_updates: u64,
    pub sensor_samples: u64,
    /// Composites handed to the output, in any mode.
    pub frames_emitted: u64,
    pub frames_encoded: u64,
    pub units_written: u64,
    pub messages_written: u64,
    pub bytes_written: u64,
    /// Desktop frames the capture queue discarded.
    pub frames_dropped: u64,
}

// ── StreamSession ────────────────────────────────────────────────

/// Owns every per-session resource and drives them from one thread.
pub struct StreamSession<W: Write> {
    config: SessionConfig,
    capture: Option<DesktopCaptureSource>,
    sensor_queue: Arc<ConcurrentQueue<SensorSample>>,
    sensor_reader: Option<SensorStreamReader>,
    orientation: SensorSample,
    snapshot: SharedSnapshotReader,
    encoder: Option<VideoEncoderAdapter<Box<dyn EncoderBackend>>>,
    writer: FrameStreamWriter<W>,
    panel: Cadence,
    encode: Cadence,
    stats: SessionStats,
    ended: bool,
}

impl<W: Write> StreamSession<W> {
    pub fn new(config: SessionConfig, out: W) -> Result<Self> {
        if config.encoder_fps == 0 {
            return Err(CastError::Config("encoder fps must be non-zero".into()));
        }
        Ok(Self {
            panel: Cadence::from_hz(config.panel_refresh_hz),
            encode: Cadence::from_hz(config.encoder_fps as f32),
            config,
            capture: None,
            sensor_queue: Arc::new(ConcurrentQueue::new()),
            sensor_reader: None,
            orientation: SensorSample::default(),
            snapshot: SharedSnapshotReader::new(),
            encoder: None,
            writer: FrameStreamWriter::new(out),
            stats: SessionStats::default(),
            ended: false,
        })
    }

    /// Use an initialised capture source for desktop frames.
    pub fn attach_capture(&mut self, capture: DesktopCaptureSource) {
        self.capture = Some(capture);
    }

    /// Queue a sensor reader should push into.
    pub fn sensor_queue(&self) -> Arc<ConcurrentQueue<SensorSample>> {
        Arc::clone(&self.sensor_queue)
    }

    /// Hand over the reader thread feeding [`sensor_queue`](Self::sensor_queue)
    /// so the session stops and joins it on shutdown.
    pub fn attach_sensor_reader(&mut self, reader: SensorStreamReader) {
        self.sensor_reader = Some(reader);
    }

    /// One render iteration.
    ///
    /// An error is terminal: the session refuses further ticks and the
    /// caller should [`shutdown`](Self::shutdown).
    pub fn tick<H: SceneHost + ?Sized>(&mut self, host: &mut H) -> Result<()> {
        if self.ended {
            return Err(CastError::BrokenStream);
        }
        let now = Instant::now();
        self.stats.ticks += 1;

        if let Some(sample) = self.sensor_queue.try_pop() {
            self.orientation = sample;
            self.stats.sensor_samples += 1;
        }
        host.apply_orientation(&self.orientation);

        if let Some(path) = &self.config.snapshot_path {
            let hands = self.snapshot.read(path);
            host.update_tracking(&hands);
        }

        if let Some(capture) = &self.capture {
            if self.panel.ready(now) {
                if let Some(frame) = capture.latest_frame().filter(|f| f.valid) {
                    host.update_desktop(&frame);
                    self.stats.panel_updates += 1;
                }
            }
            self.stats.frames_dropped = capture.frames_dropped();
        }

        host.render();

        if self.encode.ready(now) {
            if let Some(frame) = host.composite() {
                if let Err(e) = self.emit(frame) {
                    self.ended = true;
                    error!(error = %e, "streaming session ended");
                    return Err(e);
                }
                self.stats.frames_emitted += 1;
            }
        }
        Ok(())
    }

    fn emit(&mut self, frame: CompositeFrame<'_>) -> Result<()> {
        let CompositeFrame { width, height, rgba } = frame;
        let codec = match self.config.output {
            OutputMode::Compressed => Codec::H264,
            OutputMode::Zstd => Codec::Zstd,
            OutputMode::RawRgba => {
                return self.write_message(rgba, width, height, WireFormat::RawRgba);
            }
            OutputMode::RawRgb => {
                let rgb = rgba_to_rgb(rgba);
                return self.write_message(&rgb, width, height, WireFormat::RawRgb);
            }
        };
        let encoder = self.encoder_for(codec, width, height)?;
        let units = encoder.encode_frame(rgba)?;
        self.stats.frames_encoded += 1;
        self.write_units(&units, width, height)
    }

    /// The encoder for this resolution, built on first use. A resolution
    /// change flushes the old encoder to the stream first.
    fn encoder_for(
        &mut self,
        codec: Codec,
        width: u32,
        height: u32,
    ) -> Result<&mut VideoEncoderAdapter<Box<dyn EncoderBackend>>> {
        let matches = self
            .encoder
            .as_ref()
            .is_some_and(|e| e.config().width == width && e.config().height == height);
        if !matches {
            if let Some(mut old) = self.encoder.take() {
                let (w, h) = (old.config().width, old.config().height);
                let rest = old.flush()?;
                self.write_units(&rest, w, h)?;
                info!(from = ?(w, h), to = ?(width, height), "composite resized, encoder rebuilt");
            }
            let config = EncoderConfig {
                max_latency_frames: self.config.max_latency_frames,
                ..EncoderConfig::new(width, height, self.config.encoder_fps)
            };
            self.encoder = Some(VideoEncoderAdapter::open(codec, config)?);
        }
        self.encoder
            .as_mut()
            .ok_or_else(|| CastError::EncoderInit("encoder missing after construction".into()))
    }

    fn write_units(&mut self, units: &[EncodedAccessUnit], width: u32, height: u32) -> Result<()> {
        if units.is_empty() {
            return Ok(());
        }
        let payload = EncodedAccessUnit::concat(units);
        let format = self.config.output.wire_format();
        self.write_message(&payload, width, height, format)?;
        self.stats.units_written += units.len() as u64;
        Ok(())
    }

    fn write_message(
        &mut self,
        payload: &[u8],
        width: u32,
        height: u32,
        format: WireFormat,
    ) -> Result<()> {
        self.writer.send_frame(payload, width, height, format)?;
        self.stats.messages_written = self.writer.messages_written();
        self.stats.bytes_written = self.writer.bytes_written();
        Ok(())
    }

    /// Flush the encoder, stop the input threads and drain their queues.
    ///
    /// Teardown always completes; the first flush or write error, if any,
    /// is returned after it.
    pub fn shutdown(&mut self) -> Result<SessionStats> {
        let mut outcome = Ok(());
        if let Some(mut encoder) = self.encoder.take() {
            if !self.ended {
                let (w, h) = (encoder.config().width, encoder.config().height);
                outcome = encoder.flush().and_then(|rest| self.write_units(&rest, w, h));
            }
        }
        self.ended = true;

        if let Some(reader) = self.sensor_reader.take() {
            reader.stop();
            let stats = reader.join();
            debug!(?stats, "sensor reader joined");
        }
        self.sensor_queue.clear();

        if let Some(mut capture) = self.capture.take() {
            capture.cleanup();
            self.stats.frames_dropped = capture.frames_dropped();
        }

        info!(stats = ?self.stats, "session shut down");
        outcome.map(|()| self.stats)
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Whether a failure or shutdown has ended the session.
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// The last orientation applied.
    pub fn orientation(&self) -> SensorSample {
        self.orientation
    }

    pub fn writer(&self) -> &FrameStreamWriter<W> {
        &self.writer
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::stream::FrameStreamReader;
    use std::io::Cursor;

    /// Renders a flat frame whose shade follows the applied yaw.
    struct FlatHost {
        width: u32,
        height: u32,
        pixels: Vec<u8>,
        rendered: u64,
        yaw: f32,
    }

    impl FlatHost {
        fn new(width: u32, height: u32) -> Self {
            Self {
                width,
                height,
                pixels: Vec::new(),
                rendered: 0,
                yaw: 0.0,
            }
        }
    }

    impl SceneHost for FlatHost {
        fn apply_orientation(&mut self, sample: &SensorSample) {
            self.yaw = sample.yaw;
        }
        fn update_tracking(&mut self, _hands: &[HandRecord]) {}
        fn update_desktop(&mut self, _frame: &CapturedFrame) {}
        fn render(&mut self) {
            let shade = (self.rendered % 200) as u8;
            self.pixels = vec![shade; (self.width * self.height * 4) as usize];
            self.rendered += 1;
        }
        fn composite(&mut self) -> Option<CompositeFrame<'_>> {
            Some(CompositeFrame {
                width: self.width,
                height: self.height,
                rgba: &self.pixels,
            })
        }
    }

    fn unthrottled(output: OutputMode) -> SessionConfig {
        SessionConfig {
            output,
            // 1 MHz is effectively "every tick" for a unit test.
            encoder_fps: 1_000_000,
            panel_refresh_hz: 0.0,
            ..SessionConfig::default()
        }
    }

    #[test]
    fn cadence_gates_and_does_not_burst() {
        let mut c = Cadence::new(Duration::from_millis(10));
        let t0 = Instant::now();
        assert!(c.ready(t0));
        assert!(!c.ready(t0 + Duration::from_millis(5)));
        assert!(c.ready(t0 + Duration::from_millis(10)));
        // Far behind: one opening, then back on schedule.
        assert!(c.ready(t0 + Duration::from_millis(100)));
        assert!(!c.ready(t0 + Duration::from_millis(101)));

        let mut every = Cadence::from_hz(0.0);
        assert!(every.ready(t0));
        assert!(every.ready(t0));
    }

    #[test]
    fn unrepresentable_rates_clamp_instead_of_panicking() {
        assert_eq!(Cadence::from_hz(1e-30).period(), Cadence::MAX_PERIOD);
        assert_eq!(Cadence::from_hz(f32::MIN_POSITIVE).period(), Cadence::MAX_PERIOD);
        assert_eq!(Cadence::from_hz(f32::INFINITY).period(), Duration::ZERO);
        assert_eq!(Cadence::new(Duration::MAX).period(), Cadence::MAX_PERIOD);

        let mut slow = Cadence::from_hz(1e-30);
        let t0 = Instant::now();
        assert!(slow.ready(t0));
        assert!(!slow.ready(t0 + Duration::from_secs(60)));

        let config = SessionConfig {
            panel_refresh_hz: 1e-30,
            ..SessionConfig::default()
        };
        assert!(StreamSession::new(config, Vec::new()).is_ok());
    }

    #[test]
    fn compressed_session_writes_one_message_per_tick() {
        let mut session = StreamSession::new(unthrottled(OutputMode::Compressed), Vec::new()).unwrap();
        let mut host = FlatHost::new(32, 32);
        for _ in 0..4 {
            session.tick(&mut host).unwrap();
        }
        let stats = session.shutdown().unwrap();
        assert_eq!(stats.ticks, 4);
        assert_eq!(stats.frames_emitted, 4);
        assert_eq!(stats.frames_encoded, 4);
        assert_eq!(stats.messages_written, 4);

        let reader = FrameStreamReader::new(Cursor::new(session.writer().get_ref().clone()));
        let messages: Vec<_> = reader.map(|m| m.unwrap()).collect();
        assert_eq!(messages.len(), 4);
        assert!(messages.iter().all(|(h, _)| h.pixel_format == 2 && h.width == 32));
        assert!(messages.iter().all(|(_, p)| p.starts_with(&[0, 0, 0, 1])));
    }

    #[test]
    fn zstd_session_writes_format_three() {
        let mut session = StreamSession::new(unthrottled(OutputMode::Zstd), Vec::new()).unwrap();
        let mut host = FlatHost::new(8, 8);
        session.tick(&mut host).unwrap();
        session.tick(&mut host).unwrap();
        session.shutdown().unwrap();

        let reader = FrameStreamReader::new(Cursor::new(session.writer().get_ref().clone()));
        let messages: Vec<_> = reader.map(|m| m.unwrap()).collect();
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|(h, p)| h.pixel_format == 3 && p.starts_with(b"VRAU")));
    }

    #[test]
    fn raw_rgb_mode_strips_alpha() {
        let mut session = StreamSession::new(unthrottled(OutputMode::RawRgb), Vec::new()).unwrap();
        let mut host = FlatHost::new(2, 2);
        session.tick(&mut host).unwrap();

        let bytes = session.writer().get_ref();
        assert_eq!(bytes.len(), 24 + 2 * 2 * 3);
        assert_eq!(&bytes[20..24], &1u32.to_le_bytes());
    }

    #[test]
    fn sensor_sample_is_reused_until_replaced() {
        let mut session = StreamSession::new(unthrottled(OutputMode::RawRgba), Vec::new()).unwrap();
        let queue = session.sensor_queue();
        let mut host = FlatHost::new(2, 2);

        queue.push(SensorSample::from_degrees(90.0, 0.0, 0.0));
        queue.push(SensorSample::from_degrees(45.0, 0.0, 0.0));
        session.tick(&mut host).unwrap();
        assert!((host.yaw - 90f32.to_radians()).abs() < 1e-6);
        session.tick(&mut host).unwrap();
        assert!((host.yaw - 45f32.to_radians()).abs() < 1e-6);
        session.tick(&mut host).unwrap();
        assert!((host.yaw - 45f32.to_radians()).abs() < 1e-6);
        assert_eq!(session.stats().sensor_samples, 2);
    }

    #[test]
    fn odd_composite_ends_the_session() {
        let mut session = StreamSession::new(unthrottled(OutputMode::Compressed), Vec::new()).unwrap();
        let mut host = FlatHost::new(3, 3);
        let err = session.tick(&mut host).unwrap_err();
        assert!(matches!(err, CastError::EncoderInit(_)));
        assert!(session.is_ended());
        assert!(session.tick(&mut host).is_err());
        assert!(session.shutdown().is_ok());
    }

    #[test]
    fn held_units_are_flushed_on_shutdown() {
        let mut config = unthrottled(OutputMode::Compressed);
        config.max_latency_frames = 2;
        let mut session = StreamSession::new(config, Vec::new()).unwrap();
        let mut host = FlatHost::new(32, 32);
        for _ in 0..3 {
            session.tick(&mut host).unwrap();
        }
        assert_eq!(session.stats().units_written, 1);
        let stats = session.shutdown().unwrap();
        assert_eq!(stats.units_written, 3);
        // One message for the first release, one for the flushed remainder.
        assert_eq!(stats.messages_written, 2);
    }
}
