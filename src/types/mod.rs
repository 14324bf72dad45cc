//! Core data types shared by every pipeline stage.
//!
//! - [`VehicleStateRecord`] is the normalized sample both ingestion sources produce
//! - [`Position2D`] holds canonical degree coordinates with fixed-point conversion
//! - [`TaskInfo`] and [`TaskEvent`] describe delivery tasks and their lifecycle
//!
//! ```rust
//! use fleetwire::types::{Position2D, RecordSource, VehicleStateRecord};
//!
//! let record = VehicleStateRecord::new("V001", RecordSource::Device, 1_700_000_000_000,
//!     Position2D::new(116.3975, 39.9087))
//!     .with_motion(42.0, 90.0);
//! assert_eq!(record.speed, 42.0);
//! ```

mod position;
mod record;
mod task;

pub use position::{FIXED_POINT_SCALE, Position2D};
pub use record::{AssistFlags, LightState, RecordExtension, RecordSource, VehicleStateRecord};
pub use task::{TaskEvent, TaskEventKind, TaskInfo};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
