//! The normalized vehicle-state record shared by every ingestion source.

use super::Position2D;

/// Where a record entered the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordSource {
    /// Binary frame from an on-board device.
    Device,
    /// JSON message from the upstream push feed.
    Upstream,
}

impl RecordSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordSource::Device => "device",
            RecordSource::Upstream => "upstream",
        }
    }
}

/// Exterior light state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LightState {
    pub low_beam: bool,
    pub high_beam: bool,
    pub left_turn: bool,
    pub right_turn: bool,
    pub hazard: bool,
    pub fog: bool,
    pub daytime_running: bool,
    pub parking: bool,
    pub automatic: bool,
}

/// Driver-assistance system flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AssistFlags {
    pub abs: bool,
    pub tcs: bool,
    pub esp: bool,
    pub lka: bool,
    pub fcw: bool,
    pub ldw: bool,
    pub aeb: bool,
    pub lca: bool,
    pub dms: bool,
    pub acc_mode: u8,
}

/// Optional fields that only some sources or vehicles provide.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RecordExtension {
    pub category_code: Option<i32>,
    pub elevation_m: Option<f64>,
    /// Battery state of charge, percent.
    pub soc: Option<f64>,
    /// Odometer, km.
    pub mileage: Option<f64>,
    pub lights: Option<LightState>,
    pub assist: Option<AssistFlags>,
    pub doors: Option<Vec<u8>>,
    pub vehicle_fault: Option<bool>,
    pub destination: Option<Position2D>,
    pub pass_points: Vec<Position2D>,
}

/// One normalized telemetry sample.
///
/// Speed is km/h and heading is degrees clockwise from north regardless of
/// the source the record came from.
#[derive(Debug, Clone, PartialEq)]
pub struct VehicleStateRecord {
    pub vehicle_id: String,
    pub source: RecordSource,
    pub timestamp_ms: u64,
    pub position: Position2D,
    pub speed: f64,
    pub heading: f64,
    pub drive_mode: Option<u8>,
    pub tap_pos: Option<u8>,
    pub brake_flag: Option<bool>,
    pub accel_pos: Option<f64>,
    pub brake_pos: Option<f64>,
    pub steering_angle: Option<f64>,
    pub engine_speed: Option<f64>,
    pub fuel_consumption: Option<f64>,
    /// Accelerations in m/s^2.
    pub accel_longitudinal: Option<f64>,
    pub accel_lateral: Option<f64>,
    pub accel_vertical: Option<f64>,
    pub extension: RecordExtension,
}

impl VehicleStateRecord {
    /// Create a record with every optional field unset.
    pub fn new(
        vehicle_id: impl Into<String>,
        source: RecordSource,
        timestamp_ms: u64,
        position: Position2D,
    ) -> Self {
        Self {
            vehicle_id: vehicle_id.into(),
            source,
            timestamp_ms,
            position,
            speed: 0.0,
            heading: 0.0,
            drive_mode: None,
            tap_pos: None,
            brake_flag: None,
            accel_pos: None,
            brake_pos: None,
            steering_angle: None,
            engine_speed: None,
            fuel_consumption: None,
            accel_longitudinal: None,
            accel_lateral: None,
            accel_vertical: None,
            extension: RecordExtension::default(),
        }
    }

    pub fn with_motion(mut self, speed: f64, heading: f64) -> Self {
        self.speed = speed;
        self.heading = heading;
        self
    }

    pub fn with_category(mut self, category_code: i32) -> Self {
        self.extension.category_code = Some(category_code);
        self
    }
}
