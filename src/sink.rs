//! Time-series sink boundary and the point model written through it.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::types::VehicleStateRecord;
use crate::{IngestError, Result};

/// Measurement every record is written under.
pub const MEASUREMENT: &str = "vehicle_status";

/// Scalar field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Int(i64),
    UInt(u64),
    Bool(bool),
    Str(String),
}

/// One tagged time-series point.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    pub timestamp_ms: u64,
}

impl Point {
    /// Build the `vehicle_status` point for a record.
    ///
    /// Tags are `vehicleId` and `categoryCode`. Unset optional fields are
    /// omitted rather than written as zero.
    pub fn from_record(record: &VehicleStateRecord) -> Self {
        let mut tags = BTreeMap::new();
        tags.insert("vehicleId".to_string(), record.vehicle_id.clone());
        if let Some(code) = record.extension.category_code {
            tags.insert("categoryCode".to_string(), code.to_string());
        }

        let mut fields = BTreeMap::new();
        let mut put = |name: &str, value: FieldValue| {
            fields.insert(name.to_string(), value);
        };
        let float = |v: Option<f64>| v.map(FieldValue::Float);

        put("timestamp", FieldValue::UInt(record.timestamp_ms));
        put("lon", FieldValue::Float(record.position.lon));
        put("lat", FieldValue::Float(record.position.lat));
        put("speed", FieldValue::Float(record.speed));
        put("heading", FieldValue::Float(record.heading));
        put("source", FieldValue::Str(record.source.as_str().to_string()));

        let optional = [
            ("driveMode", record.drive_mode.map(|v| FieldValue::Int(i64::from(v)))),
            ("tapPos", record.tap_pos.map(|v| FieldValue::Int(i64::from(v)))),
            ("brakeFlag", record.brake_flag.map(FieldValue::Bool)),
            ("accelPos", float(record.accel_pos)),
            ("brakePos", float(record.brake_pos)),
            ("steeringAngle", float(record.steering_angle)),
            ("engineSpeed", float(record.engine_speed)),
            ("fuelConsumption", float(record.fuel_consumption)),
            ("accelerationH", float(record.accel_longitudinal)),
            ("accelerationLat", float(record.accel_lateral)),
            ("accelerationV", float(record.accel_vertical)),
            ("elevation", float(record.extension.elevation_m)),
            ("soc", float(record.extension.soc)),
            ("mileage", float(record.extension.mileage)),
            ("vehFault", record.extension.vehicle_fault.map(FieldValue::Bool)),
        ];
        for (name, value) in optional {
            if let Some(value) = value {
                put(name, value);
            }
        }

        if let Some(lights) = &record.extension.lights {
            put("lowBeam", FieldValue::Bool(lights.low_beam));
            put("highBeam", FieldValue::Bool(lights.high_beam));
            put("leftTurn", FieldValue::Bool(lights.left_turn));
            put("rightTurn", FieldValue::Bool(lights.right_turn));
            put("hazardSignal", FieldValue::Bool(lights.hazard));
            put("fogLight", FieldValue::Bool(lights.fog));
            put("daytimeRunning", FieldValue::Bool(lights.daytime_running));
            put("parking", FieldValue::Bool(lights.parking));
            put("automatic", FieldValue::Bool(lights.automatic));
        }
        if let Some(assist) = &record.extension.assist {
            put("absFlag", FieldValue::Bool(assist.abs));
            put("tcsFlag", FieldValue::Bool(assist.tcs));
            put("espFlag", FieldValue::Bool(assist.esp));
            put("lkaFlag", FieldValue::Bool(assist.lka));
            put("fcwFlag", FieldValue::Bool(assist.fcw));
            put("ldwFlag", FieldValue::Bool(assist.ldw));
            put("aebFlag", FieldValue::Bool(assist.aeb));
            put("lcaFlag", FieldValue::Bool(assist.lca));
            put("dmsFlag", FieldValue::Bool(assist.dms));
            put("accMode", FieldValue::Int(i64::from(assist.acc_mode)));
        }
        if let Some(doors) = &record.extension.doors
            && let Ok(json) = serde_json::to_string(doors)
        {
            put("doors", FieldValue::Str(json));
        }

        Self { measurement: MEASUREMENT.to_string(), tags, fields, timestamp_ms: record.timestamp_ms }
    }

    /// Render as one line of line protocol with millisecond precision.
    pub fn to_line_protocol(&self) -> String {
        let mut line = escape(&self.measurement, &[',', ' ']);
        for (key, value) in &self.tags {
            let value = escape(value, TAG_SPECIAL);
            if value.is_empty() {
                continue;
            }
            let _ = write!(line, ",{}={value}", escape(key, TAG_SPECIAL));
        }

        let mut first = true;
        for (key, value) in &self.fields {
            line.push(if first { ' ' } else { ',' });
            first = false;
            line.push_str(&escape(key, TAG_SPECIAL));
            line.push('=');
            match value {
                FieldValue::Float(v) => {
                    let _ = write!(line, "{v}");
                }
                FieldValue::Int(v) => {
                    let _ = write!(line, "{v}i");
                }
                FieldValue::UInt(v) => {
                    let _ = write!(line, "{v}u");
                }
                FieldValue::Bool(v) => line.push_str(if *v { "true" } else { "false" }),
                FieldValue::Str(v) => {
                    let _ = write!(line, "\"{}\"", escape(v, &['"', '\\']));
                }
            }
        }

        let _ = write!(line, " {}", self.timestamp_ms);
        line
    }
}

const TAG_SPECIAL: &[char] = &[',', '=', ' '];

/// Escape `special` and backslashes. Line breaks cannot be represented
/// inside a line and are dropped.
fn escape(raw: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '\n' | '\r' => {}
            '\\' => out.push_str("\\\\"),
            ch => {
                if special.contains(&ch) {
                    out.push('\\');
                }
                out.push(ch);
            }
        }
    }
    out
}

/// Durable time-series store.
#[async_trait::async_trait]
pub trait TimeSeriesSink: Send + Sync + 'static {
    /// Write one point. Failures are reported per point.
    async fn write_point(&self, point: Point) -> Result<()>;

    /// Push buffered points to the store once a batch is done.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Writes line protocol to any byte sink, one point per line.
pub struct LineProtocolSink<W> {
    writer: Mutex<W>,
}

impl<W> LineProtocolSink<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(writer: W) -> Self {
        Self { writer: Mutex::new(writer) }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait::async_trait]
impl<W> TimeSeriesSink for LineProtocolSink<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn write_point(&self, point: Point) -> Result<()> {
        let mut line = point.to_line_protocol();
        line.push('\n');
        self.writer
            .lock()
            .await
            .write_all(line.as_bytes())
            .await
            .map_err(|e| IngestError::sink_failed_with_source("line protocol write", Box::new(e)))
    }

    async fn flush(&self) -> Result<()> {
        self.writer
            .lock()
            .await
            .flush()
            .await
            .map_err(|e| IngestError::sink_failed_with_source("line protocol flush", Box::new(e)))
    }
}
