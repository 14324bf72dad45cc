//! Vehicle-state payload (category 0x15, version 1)

use super::header::FrameHeader;
use crate::types::{Position2D, RecordSource, VehicleStateRecord};
use crate::{IngestError, Result};

/// Fixed portion of a version 1 payload, before pass-points.
pub const VEHICLE_STATE_MIN_LEN: usize = 82;

/// Size of one encoded pass-point.
pub const PASS_POINT_LEN: usize = 8;

/// Wire unit conversions applied when a frame becomes a record.
pub mod scale {
    /// Raw speed unit, m/s.
    pub const SPEED_MPS: f64 = 0.01;
    pub const MPS_TO_KMH: f64 = 3.6;
    /// Raw heading and steering unit, degrees.
    pub const ANGLE_DEG: f64 = 1e-4;
    /// Raw elevation unit, metres.
    pub const ELEVATION_M: f64 = 0.1;
    /// Raw acceleration unit, m/s^2.
    pub const ACCEL_MPS2: f64 = 0.01;
    /// Raw pedal position and fuel consumption unit.
    pub const PERCENT: f64 = 0.01;
}

/// Raw vehicle-state frame exactly as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VehicleStateFrame {
    /// NUL padded.
    pub vehicle_id: [u8; 8],
    pub message_id: [u8; 8],
    pub timestamp_gnss: u64,
    pub velocity_gnss: u16,
    pub lon: u32,
    pub lat: u32,
    pub elevation: u32,
    pub heading: u32,
    pub tap_pos: u8,
    pub steering_angle: u32,
    pub velocity_bus: u16,
    pub acc_lon: u16,
    pub acc_lat: u16,
    pub acc_vert: u16,
    pub yaw_rate: u16,
    pub accel_pos: u16,
    pub engine_speed: u16,
    pub engine_torque: u32,
    pub brake_flag: u8,
    pub brake_pos: u16,
    pub brake_pressure: u16,
    pub fuel_consumption: u16,
    pub drive_mode: u8,
    pub dest_lon: u32,
    pub dest_lat: u32,
    pub pass_points: Vec<(u32, u32)>,
}

impl VehicleStateFrame {
    /// Decode a version 1 payload. Every read is bounds-checked.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < VEHICLE_STATE_MIN_LEN {
            return Err(IngestError::truncated(
                "vehicle-state payload",
                VEHICLE_STATE_MIN_LEN,
                payload.len(),
            ));
        }

        let mut c = Cursor::new(payload);
        let frame = Self {
            vehicle_id: c.array("vehicle id")?,
            message_id: c.array("message id")?,
            timestamp_gnss: c.u64("gnss timestamp")?,
            velocity_gnss: c.u16("gnss velocity")?,
            lon: c.u32("longitude")?,
            lat: c.u32("latitude")?,
            elevation: c.u32("elevation")?,
            heading: c.u32("heading")?,
            tap_pos: c.u8("tap position")?,
            steering_angle: c.u32("steering angle")?,
            velocity_bus: c.u16("bus velocity")?,
            acc_lon: c.u16("longitudinal acceleration")?,
            acc_lat: c.u16("lateral acceleration")?,
            acc_vert: c.u16("vertical acceleration")?,
            yaw_rate: c.u16("yaw rate")?,
            accel_pos: c.u16("accelerator position")?,
            engine_speed: c.u16("engine speed")?,
            engine_torque: c.u32("engine torque")?,
            brake_flag: c.u8("brake flag")?,
            brake_pos: c.u16("brake position")?,
            brake_pressure: c.u16("brake pressure")?,
            fuel_consumption: c.u16("fuel consumption")?,
            drive_mode: c.u8("drive mode")?,
            dest_lon: c.u32("destination longitude")?,
            dest_lat: c.u32("destination latitude")?,
            pass_points: {
                let count = c.u8("pass-point count")? as usize;
                let mut points = Vec::with_capacity(count);
                for _ in 0..count {
                    let lon = c.u32("pass-point longitude")?;
                    let lat = c.u32("pass-point latitude")?;
                    points.push((lon, lat));
                }
                points
            },
        };

        if c.remaining() > 0 {
            tracing::trace!(trailing = c.remaining(), "Ignoring trailing vehicle-state bytes");
        }
        Ok(frame)
    }

    /// Encode back into payload bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(VEHICLE_STATE_MIN_LEN + self.pass_points.len() * PASS_POINT_LEN);
        out.extend_from_slice(&self.vehicle_id);
        out.extend_from_slice(&self.message_id);
        out.extend_from_slice(&self.timestamp_gnss.to_be_bytes());
        out.extend_from_slice(&self.velocity_gnss.to_be_bytes());
        out.extend_from_slice(&self.lon.to_be_bytes());
        out.extend_from_slice(&self.lat.to_be_bytes());
        out.extend_from_slice(&self.elevation.to_be_bytes());
        out.extend_from_slice(&self.heading.to_be_bytes());
        out.push(self.tap_pos);
        out.extend_from_slice(&self.steering_angle.to_be_bytes());
        out.extend_from_slice(&self.velocity_bus.to_be_bytes());
        out.extend_from_slice(&self.acc_lon.to_be_bytes());
        out.extend_from_slice(&self.acc_lat.to_be_bytes());
        out.extend_from_slice(&self.acc_vert.to_be_bytes());
        out.extend_from_slice(&self.yaw_rate.to_be_bytes());
        out.extend_from_slice(&self.accel_pos.to_be_bytes());
        out.extend_from_slice(&self.engine_speed.to_be_bytes());
        out.extend_from_slice(&self.engine_torque.to_be_bytes());
        out.push(self.brake_flag);
        out.extend_from_slice(&self.brake_pos.to_be_bytes());
        out.extend_from_slice(&self.brake_pressure.to_be_bytes());
        out.extend_from_slice(&self.fuel_consumption.to_be_bytes());
        out.push(self.drive_mode);
        out.extend_from_slice(&self.dest_lon.to_be_bytes());
        out.extend_from_slice(&self.dest_lat.to_be_bytes());
        // Counts above 255 cannot be represented; extra points are not encoded.
        let count = self.pass_points.len().min(u8::MAX as usize);
        out.push(count as u8);
        for (lon, lat) in &self.pass_points[..count] {
            out.extend_from_slice(&lon.to_be_bytes());
            out.extend_from_slice(&lat.to_be_bytes());
        }
        out
    }

    /// Vehicle id with trailing NUL padding removed.
    pub fn vehicle_id_str(&self) -> String {
        let end = self.vehicle_id.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
        String::from_utf8_lossy(&self.vehicle_id[..end]).into_owned()
    }

    /// Normalize into a pipeline record.
    ///
    /// The GNSS timestamp wins; frames without a fix fall back to the header
    /// timestamp. Returns a protocol error when the vehicle id is blank.
    pub fn into_record(self, header: &FrameHeader) -> Result<VehicleStateRecord> {
        let vehicle_id = self.vehicle_id_str();
        if vehicle_id.trim().is_empty() {
            return Err(IngestError::protocol("vehicle-state payload", "empty vehicle id"));
        }

        let timestamp_ms =
            if self.timestamp_gnss != 0 { self.timestamp_gnss } else { header.timestamp_ms };

        let mut record = VehicleStateRecord::new(
            vehicle_id,
            RecordSource::Device,
            timestamp_ms,
            Position2D::from_fixed(self.lon, self.lat),
        );
        record.speed = f64::from(self.velocity_gnss) * scale::SPEED_MPS * scale::MPS_TO_KMH;
        record.heading = f64::from(self.heading) * scale::ANGLE_DEG;
        record.drive_mode = Some(self.drive_mode);
        record.tap_pos = Some(self.tap_pos);
        record.brake_flag = Some(self.brake_flag != 0);
        record.accel_pos = Some(f64::from(self.accel_pos) * scale::PERCENT);
        record.brake_pos = Some(f64::from(self.brake_pos) * scale::PERCENT);
        record.steering_angle = Some(f64::from(self.steering_angle as i32) * scale::ANGLE_DEG);
        record.engine_speed = Some(f64::from(self.engine_speed));
        record.fuel_consumption = Some(f64::from(self.fuel_consumption) * scale::PERCENT);
        record.accel_longitudinal = Some(f64::from(self.acc_lon as i16) * scale::ACCEL_MPS2);
        record.accel_lateral = Some(f64::from(self.acc_lat as i16) * scale::ACCEL_MPS2);
        record.accel_vertical = Some(f64::from(self.acc_vert as i16) * scale::ACCEL_MPS2);

        let ext = &mut record.extension;
        ext.elevation_m = Some(f64::from(self.elevation as i32) * scale::ELEVATION_M);
        if self.dest_lon != 0 || self.dest_lat != 0 {
            ext.destination = Some(Position2D::from_fixed(self.dest_lon, self.dest_lat));
        }
        ext.pass_points =
            self.pass_points.iter().map(|(lon, lat)| Position2D::from_fixed(*lon, *lat)).collect();

        Ok(record)
    }
}

/// Big-endian reader that reports the field name on a short buffer.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, field: &'static str, n: usize) -> Result<&'a [u8]> {
        let remaining = self.remaining();
        if n > remaining {
            return Err(IngestError::truncated(field, n, remaining));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self, field: &'static str) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(field, N)?);
        Ok(out)
    }

    fn u8(&mut self, field: &'static str) -> Result<u8> {
        Ok(self.take(field, 1)?[0])
    }

    fn u16(&mut self, field: &'static str) -> Result<u16> {
        Ok(u16::from_be_bytes(self.array(field)?))
    }

    fn u32(&mut self, field: &'static str) -> Result<u32> {
        Ok(u32::from_be_bytes(self.array(field)?))
    }

    fn u64(&mut self, field: &'static str) -> Result<u64> {
        Ok(u64::from_be_bytes(self.array(field)?))
    }
}
