//! In-memory collaborators and frame builders shared by unit tests,
//! integration tests and benchmarks.

#![cfg(any(test, feature = "benchmark"))]

use std::collections::HashSet;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::frame::{FrameCategory, FrameHeader, VehicleStateFrame};
use crate::ingest::Ingest;
use crate::sink::{Point, TimeSeriesSink};
use crate::types::{Position2D, RecordSource, VehicleStateRecord};
use crate::{IngestError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Sink that keeps every written point in memory.
///
/// A blocked sink parks each write until [`MemorySink::unblock`] is called.
/// Writes for vehicles listed in `failing` are rejected.
pub struct MemorySink {
    points: Mutex<Vec<Point>>,
    open: watch::Sender<bool>,
    failing: HashSet<String>,
}

impl Default for MemorySink {
    fn default() -> Self {
        Self { points: Mutex::new(Vec::new()), open: watch::Sender::new(true), failing: HashSet::new() }
    }
}

impl MemorySink {
    pub fn blocked() -> Self {
        let sink = Self::default();
        sink.open.send_replace(false);
        sink
    }

    pub fn failing_for(vehicle_id: &str) -> Self {
        Self { failing: HashSet::from([vehicle_id.to_string()]), ..Self::default() }
    }

    pub fn unblock(&self) {
        self.open.send_replace(true);
    }

    pub fn len(&self) -> usize {
        self.points.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn points(&self) -> Vec<Point> {
        self.points.lock().clone()
    }

    /// Wait until at least `n` points have been written.
    pub async fn wait_for(&self, n: usize) {
        while self.len() < n {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[async_trait::async_trait]
impl TimeSeriesSink for MemorySink {
    async fn write_point(&self, point: Point) -> Result<()> {
        let mut open = self.open.subscribe();
        open.wait_for(|open| *open)
            .await
            .map_err(|_| IngestError::channel_closed("memory sink gate"))?;

        if point.tags.get("vehicleId").is_some_and(|id| self.failing.contains(id)) {
            return Err(IngestError::sink_failed("rejected by test sink"));
        }
        self.points.lock().push(point);
        Ok(())
    }
}

/// Ingest that records everything it is handed.
#[derive(Default)]
pub struct RecordingIngest {
    records: Mutex<Vec<VehicleStateRecord>>,
}

impl RecordingIngest {
    pub fn records(&self) -> Vec<VehicleStateRecord> {
        self.records.lock().clone()
    }

    pub async fn wait_for(&self, n: usize) {
        while self.records.lock().len() < n {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[async_trait::async_trait]
impl Ingest for RecordingIngest {
    async fn ingest(&self, record: VehicleStateRecord) -> Result<()> {
        self.records.lock().push(record);
        Ok(())
    }
}

/// A record with a fix near Tiananmen, moving east at 30 km/h.
pub fn record_at(vehicle_id: &str, timestamp_ms: u64) -> VehicleStateRecord {
    VehicleStateRecord::new(
        vehicle_id,
        RecordSource::Device,
        timestamp_ms,
        Position2D::new(116.3975, 39.9087),
    )
    .with_motion(30.0, 90.0)
}

/// A fully populated vehicle-state frame for `vehicle_id` (at most 8 bytes).
pub fn sample_state_frame(vehicle_id: &str) -> VehicleStateFrame {
    let mut id = [0u8; 8];
    let bytes = vehicle_id.as_bytes();
    let len = bytes.len().min(id.len());
    id[..len].copy_from_slice(&bytes[..len]);

    VehicleStateFrame {
        vehicle_id: id,
        message_id: *b"MSG00001",
        timestamp_gnss: 1_700_000_000_000,
        velocity_gnss: 1_000,
        lon: 1_163_975_000,
        lat: 399_087_000,
        elevation: 435,
        heading: 900_000,
        tap_pos: 4,
        steering_angle: 15_000,
        velocity_bus: 998,
        acc_lon: 120,
        acc_lat: (-35i16) as u16,
        acc_vert: 981,
        yaw_rate: 12,
        accel_pos: 2_500,
        engine_speed: 1_800,
        engine_torque: 240,
        brake_flag: 0,
        brake_pos: 0,
        brake_pressure: 0,
        fuel_consumption: 730,
        drive_mode: 1,
        dest_lon: 1_164_500_000,
        dest_lat: 399_300_000,
        pass_points: vec![(1_164_000_000, 399_100_000), (1_164_200_000, 399_200_000)],
    }
}

/// Header plus payload for a vehicle-state frame.
pub fn state_frame_bytes(frame: &VehicleStateFrame, version: u8) -> Vec<u8> {
    let payload = frame.encode();
    let header = FrameHeader {
        payload_len: payload.len() as u32,
        category: FrameCategory::VehicleState,
        version,
        timestamp_ms: 1_700_000_000_500,
        control: 0,
    };
    let mut bytes = header.encode().to_vec();
    bytes.extend_from_slice(&payload);
    bytes
}
