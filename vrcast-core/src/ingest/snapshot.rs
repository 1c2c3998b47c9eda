//! Memory-mapped hand-tracking snapshots written by an external process.
//!
//! ## File layout
//!
//! ```text
//! length:   u32 LE  payload bytes that follow
//! payload:  [u8]    JSON array of hand records
//! ```
//!
//! The file is re-read in full on every poll. Anything unexpected (file
//! absent, zero or oversized length, bad JSON) reads as "no hands".

use std::fs::{self, File, Metadata};
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{CastError, Result};

const LENGTH_PREFIX: usize = 4;

// ── Records ──────────────────────────────────────────────────────

/// A landmark position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Point3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// One tracked hand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandRecord {
    /// `"Left"`, `"Right"` or empty when unknown.
    pub handedness: String,
    pub landmarks: Vec<Point3>,
    pub distance_factor: f32,
    pub depth_scale: f32,
    pub shoulder_calibrated: bool,
    pub confidence: f32,
}

impl Default for HandRecord {
    fn default() -> Self {
        Self {
            handedness: String::new(),
            landmarks: Vec::new(),
            distance_factor: 1.0,
            depth_scale: 1.0,
            shoulder_calibrated: false,
            confidence: 0.7,
        }
    }
}

/// All hands from one poll.
pub type TrackingSnapshot = Vec<HandRecord>;

/// Serialize `hands` in the snapshot file layout. Producer-side helper,
/// used by tests and tools that feed the reader.
pub fn encode_snapshot(hands: &[HandRecord]) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(hands)?;
    let len = u32::try_from(json.len())
        .map_err(|_| CastError::Config(format!("snapshot payload of {} bytes", json.len())))?;
    let mut out = Vec::with_capacity(LENGTH_PREFIX + json.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&json);
    Ok(out)
}

/// Decode a mapped region. Empty on any framing or payload error.
pub fn decode_snapshot(region: &[u8]) -> TrackingSnapshot {
    if region.len() < LENGTH_PREFIX {
        return Vec::new();
    }
    let len = u32::from_le_bytes([region[0], region[1], region[2], region[3]]) as usize;
    if len == 0 || len > region.len() - LENGTH_PREFIX {
        trace!(len, region = region.len(), "snapshot length out of range");
        return Vec::new();
    }
    match serde_json::from_slice(&region[LENGTH_PREFIX..LENGTH_PREFIX + len]) {
        Ok(hands) => hands,
        Err(e) => {
            debug!(error = %e, "malformed snapshot payload");
            Vec::new()
        }
    }
}

// ── SharedSnapshotReader ─────────────────────────────────────────

/// What the reader compares to decide whether the mapping is still valid.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FileIdentity {
    path: PathBuf,
    len: u64,
    #[cfg(unix)]
    inode: u64,
}

impl FileIdentity {
    fn of(path: &Path, meta: &Metadata) -> Self {
        Self {
            path: path.to_path_buf(),
            len: meta.len(),
            #[cfg(unix)]
            inode: std::os::unix::fs::MetadataExt::ino(meta),
        }
    }

    /// Same file object at the same size; content may still have changed.
    fn same_mapping(&self, other: &Self) -> bool {
        #[cfg(unix)]
        let same_file = self.inode == other.inode;
        #[cfg(not(unix))]
        let same_file = true;
        same_file && self.path == other.path && self.len == other.len
    }
}

/// Poll-driven reader over a read-only mapping of the snapshot file.
///
/// The mapping is kept across polls and replaced only when the file is
/// recreated or resized. The producer is expected to rewrite content in
/// place; a file truncated while mapped is outside what this reader can
/// guard against.
#[derive(Default)]
pub struct SharedSnapshotReader {
    mapping: Option<(FileIdentity, Mmap)>,
    remaps: u64,
}

impl SharedSnapshotReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-read the snapshot at `path`. Never fails; problems read as empty.
    pub fn read(&mut self, path: impl AsRef<Path>) -> TrackingSnapshot {
        match self.region(path.as_ref()) {
            Some(region) => decode_snapshot(region),
            None => Vec::new(),
        }
    }

    /// Times a mapping has been (re)established.
    pub fn remap_count(&self) -> u64 {
        self.remaps
    }

    fn region(&mut self, path: &Path) -> Option<&[u8]> {
        let meta = match fs::metadata(path) {
            Ok(meta) if meta.is_file() => meta,
            _ => {
                self.mapping = None;
                return None;
            }
        };
        let identity = FileIdentity::of(path, &meta);
        if (identity.len as usize) < LENGTH_PREFIX {
            self.mapping = None;
            return None;
        }

        let stale = match &self.mapping {
            Some((current, _)) => !current.same_mapping(&identity),
            None => true,
        };
        if stale {
            self.mapping = None;
            match map_file(path) {
                Ok(map) => {
                    self.remaps += 1;
                    debug!(path = %path.display(), len = map.len(), "snapshot mapped");
                    self.mapping = Some((identity, map));
                }
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "snapshot map failed");
                    return None;
                }
            }
        }
        self.mapping.as_ref().map(|(_, map)| &map[..])
    }
}

fn map_file(path: &Path) -> Result<Mmap> {
    let file = File::open(path)?;
    // SAFETY: read-only mapping. The producer only rewrites in place;
    // a size change is detected before the next access and remapped.
    let map = unsafe { Mmap::map(&file)? };
    Ok(map)
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::process;

    fn temp_path(name: &str) -> PathBuf {
        env::temp_dir().join(format!("vrcast-snapshot-{}-{name}", process::id()))
    }

    fn right_hand() -> HandRecord {
        HandRecord {
            handedness: "Right".into(),
            landmarks: vec![
                Point3 { x: 0.1, y: 0.2, z: 0.3 },
                Point3 { x: 0.4, y: 0.5, z: 0.6 },
            ],
            confidence: 0.9,
            ..HandRecord::default()
        }
    }

    #[test]
    fn well_formed_file_decodes() {
        let path = temp_path("ok");
        fs::write(&path, encode_snapshot(&[right_hand()]).unwrap()).unwrap();

        let mut reader = SharedSnapshotReader::new();
        let hands = reader.read(&path);
        assert_eq!(hands, vec![right_hand()]);
        // A second poll reuses the mapping.
        assert_eq!(reader.read(&path).len(), 1);
        assert_eq!(reader.remap_count(), 1);
        fs::remove_file(&path).ok();
    }

    #[test]
    fn oversized_length_reads_empty() {
        let path = temp_path("oversized");
        let mut bytes = encode_snapshot(&[right_hand()]).unwrap();
        let claimed = (bytes.len() as u32) * 2;
        bytes[0..4].copy_from_slice(&claimed.to_le_bytes());
        fs::write(&path, bytes).unwrap();

        assert!(SharedSnapshotReader::new().read(&path).is_empty());
        fs::remove_file(&path).ok();
    }

    #[test]
    fn missing_zero_and_garbage_read_empty() {
        let mut reader = SharedSnapshotReader::new();
        assert!(reader.read(temp_path("does-not-exist")).is_empty());

        let path = temp_path("zero");
        fs::write(&path, [0u8, 0, 0, 0, b'[', b']']).unwrap();
        assert!(reader.read(&path).is_empty());

        let garbage = temp_path("garbage");
        let mut bytes = 5u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(b"{{{{{");
        fs::write(&garbage, bytes).unwrap();
        assert!(reader.read(&garbage).is_empty());

        fs::remove_file(&path).ok();
        fs::remove_file(&garbage).ok();
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let json = br#"[{"handedness":"Left","landmarks":[{"x":1.0}]}]"#;
        let mut region = (json.len() as u32).to_le_bytes().to_vec();
        region.extend_from_slice(json);
        let hands = decode_snapshot(&region);
        assert_eq!(hands.len(), 1);
        assert_eq!(hands[0].landmarks, vec![Point3 { x: 1.0, y: 0.0, z: 0.0 }]);
        assert_eq!(hands[0].distance_factor, 1.0);
        assert_eq!(hands[0].depth_scale, 1.0);
        assert!(!hands[0].shoulder_calibrated);
        assert!((hands[0].confidence - 0.7).abs() < f32::EPSILON);
    }

    #[cfg(unix)]
    #[test]
    fn recreated_file_is_remapped() {
        let path = temp_path("recreated");
        fs::write(&path, encode_snapshot(&[right_hand()]).unwrap()).unwrap();
        let mut reader = SharedSnapshotReader::new();
        assert_eq!(reader.read(&path).len(), 1);

        let two = vec![right_hand(), HandRecord::default()];
        fs::remove_file(&path).unwrap();
        fs::write(&path, encode_snapshot(&two).unwrap()).unwrap();

        assert_eq!(reader.read(&path), two);
        assert_eq!(reader.remap_count(), 2);
        fs::remove_file(&path).ok();
    }
}
