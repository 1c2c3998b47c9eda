//! Host configuration loaded from TOML.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vrcast_core::{CaptureConfig, OutputMode, SessionConfig};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub capture: CaptureSection,
    pub encoder: EncoderSection,
    pub pipeline: PipelineSection,
    pub inputs: InputsSection,
    pub logging: LoggingSection,
}

/// Which capture backend the host opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// The platform's native screen capture.
    #[default]
    Auto,
    /// A generated test pattern; needs no display.
    Synthetic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSection {
    pub rate_fps: f32,
    pub queue_depth: usize,
    pub backend: BackendKind,
    pub startup_timeout_ms: u64,
    pub synthetic_width: u32,
    pub synthetic_height: u32,
}

impl Default for CaptureSection {
    fn default() -> Self {
        Self {
            rate_fps: 60.0,
            queue_depth: 3,
            backend: BackendKind::Auto,
            startup_timeout_ms: 1000,
            synthetic_width: 1280,
            synthetic_height: 720,
        }
    }
}

/// Stream payload written to stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// H.264 access units.
    #[default]
    Compressed,
    /// Lossless zstd access units.
    Zstd,
    Rgba,
    Rgb,
}

impl From<StreamMode> for OutputMode {
    fn from(mode: StreamMode) -> Self {
        match mode {
            StreamMode::Compressed => OutputMode::Compressed,
            StreamMode::Zstd => OutputMode::Zstd,
            StreamMode::Rgba => OutputMode::RawRgba,
            StreamMode::Rgb => OutputMode::RawRgb,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderSection {
    pub fps: u32,
    pub mode: StreamMode,
    pub max_latency_frames: usize,
}

impl Default for EncoderSection {
    fn default() -> Self {
        Self {
            fps: 120,
            mode: StreamMode::Compressed,
            max_latency_frames: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    pub render_hz: f32,
    pub panel_refresh_hz: f32,
    /// Stop after this many streamed frames; 0 runs until interrupted.
    pub max_frames: u64,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            render_hz: 300.0,
            panel_refresh_hz: 60.0,
            max_frames: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InputsSection {
    /// Read orientation samples from stdin.
    pub sensor_stdin: bool,
    pub sensor_poll_ms: u64,
    /// Hand-tracking snapshot file; empty disables polling.
    pub snapshot_path: String,
}

impl Default for InputsSection {
    fn default() -> Self {
        Self {
            sensor_stdin: true,
            sensor_poll_ms: 5,
            snapshot_path: "Shared/hands.dat".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    /// Log file; empty logs to stderr.
    pub file: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".into(),
            file: String::new(),
        }
    }
}

impl HostConfig {
    /// Load config from a TOML file, falling back to defaults on error.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("failed to parse config {}: {e}, using defaults", path.display());
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!("no config file at {}, using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Capture thread parameters, with out-of-range values clamped.
    pub fn to_capture_config(&self) -> CaptureConfig {
        let rate = if self.capture.rate_fps.is_finite() {
            self.capture.rate_fps.clamp(1.0, 240.0)
        } else {
            CaptureSection::default().rate_fps
        };
        CaptureConfig {
            rate_fps: rate,
            queue_depth: self.capture.queue_depth.max(1),
            startup_timeout: Duration::from_millis(self.capture.startup_timeout_ms.max(1)),
        }
    }

    /// Session parameters, with out-of-range values clamped.
    pub fn to_session_config(&self) -> SessionConfig {
        let snapshot = self.inputs.snapshot_path.trim();
        SessionConfig {
            output: self.encoder.mode.into(),
            encoder_fps: self.encoder.fps.clamp(1, 1000),
            max_latency_frames: self.encoder.max_latency_frames.min(16),
            panel_refresh_hz: clamp_hz(self.pipeline.panel_refresh_hz),
            snapshot_path: (!snapshot.is_empty()).then(|| PathBuf::from(snapshot)),
        }
    }

    /// Sleep between stdin readiness checks.
    pub fn sensor_poll(&self) -> Duration {
        Duration::from_millis(self.inputs.sensor_poll_ms.max(1))
    }

    /// Target period of one render iteration. Zero runs unpaced.
    pub fn render_period(&self) -> Duration {
        let hz = clamp_hz(self.pipeline.render_hz);
        if hz > 0.0 {
            Duration::try_from_secs_f32(1.0 / hz).unwrap_or(Duration::ZERO)
        } else {
            Duration::ZERO
        }
    }
}

/// Slowest cadence a config may ask for.
const MIN_HZ: f32 = 0.01;
/// Fastest cadence a config may ask for.
const MAX_HZ: f32 = 10_000.0;

/// Non-positive or non-finite rates mean "every iteration" (0); others are
/// clamped into the supported range.
fn clamp_hz(hz: f32) -> f32 {
    if hz.is_finite() && hz > 0.0 {
        hz.clamp(MIN_HZ, MAX_HZ)
    } else {
        0.0
    }
}
