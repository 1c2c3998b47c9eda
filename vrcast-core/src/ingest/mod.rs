//! Low-rate auxiliary inputs: orientation lines on a stream and
//! hand-tracking snapshots in a shared file.

pub mod sensor;
pub mod snapshot;

pub use sensor::{
    AlwaysReady, InputReadiness, SensorReaderStats, SensorSample, SensorStreamReader,
    StdinReadiness,
};
pub use snapshot::{HandRecord, Point3, SharedSnapshotReader, TrackingSnapshot};
