//! Line-oriented orientation sensor input.
//!
//! Each input line is a JSON object `{"alpha": .., "beta": .., "gamma": ..}`
//! in degrees; missing fields are zero. The reader thread polls for
//! readiness instead of blocking in `read`, so it can be stopped, and it
//! exits on end of input.

use std::io::{self, BufRead, BufReader, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{CastError, Result};
use crate::queue::ConcurrentQueue;

// ── SensorSample ─────────────────────────────────────────────────

/// Device orientation in radians.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SensorSample {
    pub yaw: f32,
    pub pitch: f32,
    pub roll: f32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DeviceOrientation {
    alpha: f32,
    beta: f32,
    gamma: f32,
}

impl SensorSample {
    /// Map device orientation angles (degrees) onto yaw/pitch/roll:
    /// `yaw = alpha`, `pitch = gamma`, `roll = beta`.
    pub fn from_degrees(alpha: f32, beta: f32, gamma: f32) -> Self {
        Self {
            yaw: alpha.to_radians(),
            pitch: gamma.to_radians(),
            roll: beta.to_radians(),
        }
    }

    /// Decode one input line. `Ok(None)` for a blank line; anything but a
    /// JSON object is rejected.
    pub fn parse_line(line: &str) -> Result<Option<Self>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let value: serde_json::Value = serde_json::from_str(line)?;
        if !value.is_object() {
            return Err(CastError::Parse(serde::de::Error::custom(
                "sensor line is not a JSON object",
            )));
        }
        let o: DeviceOrientation = serde_json::from_value(value)?;
        Ok(Some(Self::from_degrees(o.alpha, o.beta, o.gamma)))
    }
}

// ── InputReadiness ───────────────────────────────────────────────

/// Non-blocking "would a read return now?" probe for the reader's input.
pub trait InputReadiness: Send {
    fn is_ready(&mut self) -> bool;
}

/// For inputs that never block (in-memory buffers, regular files).
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysReady;

impl InputReadiness for AlwaysReady {
    fn is_ready(&mut self) -> bool {
        true
    }
}

/// Readiness of the process's standard input.
///
/// Reports ready on hang-up as well, so the reader observes end of input.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdinReadiness;

#[cfg(unix)]
impl InputReadiness for StdinReadiness {
    fn is_ready(&mut self) -> bool {
        let mut fds = libc::pollfd {
            fd: libc::STDIN_FILENO,
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: one valid pollfd, zero timeout.
        let n = unsafe { libc::poll(&mut fds, 1, 0) };
        n > 0 && fds.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0
    }
}

#[cfg(windows)]
impl InputReadiness for StdinReadiness {
    fn is_ready(&mut self) -> bool {
        use windows::Win32::System::Console::{GetStdHandle, STD_INPUT_HANDLE};
        use windows::Win32::System::Pipes::PeekNamedPipe;

        // SAFETY: querying the process's own stdin handle.
        unsafe {
            let Ok(handle) = GetStdHandle(STD_INPUT_HANDLE) else {
                return true;
            };
            let mut available = 0u32;
            match PeekNamedPipe(handle, None, 0, None, Some(&mut available as *mut u32), None) {
                Ok(()) => available > 0,
                // Not a pipe, or the writer is gone: let the read decide.
                Err(_) => true,
            }
        }
    }
}

#[cfg(not(any(unix, windows)))]
impl InputReadiness for StdinReadiness {
    fn is_ready(&mut self) -> bool {
        true
    }
}

// ── SensorStreamReader ───────────────────────────────────────────

/// Line counters reported when the reader thread ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SensorReaderStats {
    pub lines: u64,
    pub samples: u64,
    pub rejected: u64,
}

/// Handle to the sensor reader thread.
pub struct SensorStreamReader {
    stop: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    handle: Option<JoinHandle<SensorReaderStats>>,
}

impl SensorStreamReader {
    /// Start reading `input` on a new thread, pushing one sample per valid
    /// line into `queue`. `poll` is the sleep between readiness checks.
    pub fn spawn<R, P>(
        input: R,
        readiness: P,
        queue: Arc<ConcurrentQueue<SensorSample>>,
        poll: Duration,
    ) -> Result<Self>
    where
        R: Read + Send + 'static,
        P: InputReadiness + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let handle = {
            let stop = Arc::clone(&stop);
            let finished = Arc::clone(&finished);
            thread::Builder::new()
                .name("vrcast-sensor".into())
                .spawn(move || {
                    let stats = read_loop(input, readiness, &queue, poll, &stop);
                    finished.store(true, Ordering::Release);
                    stats
                })
                .map_err(CastError::Io)?
        };
        debug!(?poll, "sensor reader started");
        Ok(Self {
            stop,
            finished,
            handle: Some(handle),
        })
    }

    /// Ask the thread to exit at its next readiness check.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Whether the thread has exited (end of input, error or stop).
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Wait for the thread to exit and return its counters.
    ///
    /// Does not request a stop; call [`stop`](Self::stop) first to end a
    /// reader whose input is still open. A thread blocked inside a
    /// partially received line waits for that line to complete.
    pub fn join(mut self) -> SensorReaderStats {
        self.join_inner()
    }

    fn join_inner(&mut self) -> SensorReaderStats {
        match self.handle.take().map(JoinHandle::join) {
            Some(Ok(stats)) => stats,
            Some(Err(_)) => {
                warn!("sensor reader thread panicked");
                SensorReaderStats::default()
            }
            None => SensorReaderStats::default(),
        }
    }
}

impl Drop for SensorStreamReader {
    fn drop(&mut self) {
        self.stop();
        self.join_inner();
    }
}

fn read_loop<R: Read, P: InputReadiness>(
    input: R,
    mut readiness: P,
    queue: &ConcurrentQueue<SensorSample>,
    poll: Duration,
    stop: &AtomicBool,
) -> SensorReaderStats {
    let mut reader = BufReader::new(input);
    let mut line = String::new();
    let mut stats = SensorReaderStats::default();

    while !stop.load(Ordering::Acquire) {
        if reader.buffer().is_empty() && !readiness.is_ready() {
            thread::sleep(poll);
            continue;
        }

        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => {
                info!(
                    samples = stats.samples,
                    rejected = stats.rejected,
                    "sensor input closed"
                );
                break;
            }
            Ok(_) => {
                stats.lines += 1;
                match SensorSample::parse_line(&line) {
                    Ok(Some(sample)) => {
                        queue.push(sample);
                        stats.samples += 1;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        stats.rejected += 1;
                        warn!(error = %e, "discarding malformed sensor line");
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                stats.lines += 1;
                stats.rejected += 1;
                warn!(error = %e, "discarding non-UTF-8 sensor line");
            }
            Err(e) => {
                warn!(error = %e, "sensor input failed");
                break;
            }
        }
    }
    stats
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Instant;

    #[test]
    fn parse_converts_degrees_and_axes() {
        let s = SensorSample::parse_line(r#"{"alpha":90,"beta":45,"gamma":-30}"#)
            .unwrap()
            .unwrap();
        assert!((s.yaw - std::f32::consts::FRAC_PI_2).abs() < 1e-6);
        assert!((s.roll - std::f32::consts::FRAC_PI_4).abs() < 1e-6);
        assert!((s.pitch + std::f32::consts::FRAC_PI_6).abs() < 1e-6);
    }

    #[test]
    fn missing_fields_default_to_zero() {
        let s = SensorSample::parse_line(r#"{"beta":180}"#).unwrap().unwrap();
        assert_eq!(s.yaw, 0.0);
        assert_eq!(s.pitch, 0.0);
        assert!((s.roll - std::f32::consts::PI).abs() < 1e-6);
    }

    #[test]
    fn blank_and_malformed_lines() {
        assert_eq!(SensorSample::parse_line("  \r\n").unwrap(), None);
        assert!(SensorSample::parse_line("not json").is_err());
        assert!(SensorSample::parse_line(r#"{"alpha":"north"}"#).is_err());
    }

    #[test]
    fn non_object_lines_are_rejected() {
        for line in ["[]", "[90,0,0]", "42", "\"x\"", "null", "true"] {
            let err = SensorSample::parse_line(line).unwrap_err();
            assert!(matches!(err, CastError::Parse(_)), "{line}: {err}");
        }
        assert!(SensorSample::parse_line("{}").unwrap().is_some());
    }

    #[test]
    fn malformed_line_is_skipped_and_reader_ends_at_eof() {
        let input = "{\"alpha\":10,\"beta\":0,\"gamma\":0}\nnot json\n\n{\"alpha\":20,\"beta\":0,\"gamma\":0}\n";
        let queue = Arc::new(ConcurrentQueue::new());
        let reader = SensorStreamReader::spawn(
            Cursor::new(input.as_bytes().to_vec()),
            AlwaysReady,
            Arc::clone(&queue),
            Duration::from_millis(1),
        )
        .unwrap();

        let stats = reader.join();
        assert_eq!(stats.samples, 2);
        assert_eq!(stats.rejected, 1);
        assert_eq!(queue.len(), 2);
        let first = queue.try_pop().unwrap();
        let second = queue.try_pop().unwrap();
        assert!((first.yaw - 10f32.to_radians()).abs() < 1e-6);
        assert!((second.yaw - 20f32.to_radians()).abs() < 1e-6);
    }

    struct NeverReady;

    impl InputReadiness for NeverReady {
        fn is_ready(&mut self) -> bool {
            false
        }
    }

    #[test]
    fn stop_ends_an_idle_reader() {
        let queue = Arc::new(ConcurrentQueue::new());
        let reader = SensorStreamReader::spawn(
            io::empty(),
            NeverReady,
            Arc::clone(&queue),
            Duration::from_millis(2),
        )
        .unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(!reader.is_finished());

        let start = Instant::now();
        reader.stop();
        let stats = reader.join();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(stats, SensorReaderStats::default());
        assert!(queue.is_empty());
    }
}
