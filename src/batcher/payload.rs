//! Live projections pushed to hub subscribers

use serde::Serialize;

use crate::directory::VehicleProfile;
use crate::hub::Payload;
use crate::types::VehicleStateRecord;

/// Per-record live update.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LivePayload<'a> {
    pub vehicle_id: &'a str,
    pub lon: f64,
    pub lat: f64,
    pub timestamp: u64,
    pub speed: f64,
    pub heading: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drive_mode: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub soc: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mileage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plate_no: Option<&'a str>,
}

impl<'a> LivePayload<'a> {
    pub fn new(record: &'a VehicleStateRecord, profile: Option<&'a VehicleProfile>) -> Self {
        Self {
            vehicle_id: &record.vehicle_id,
            lon: record.position.lon,
            lat: record.position.lat,
            timestamp: record.timestamp_ms,
            speed: record.speed,
            heading: record.heading,
            category_code: record
                .extension
                .category_code
                .or_else(|| profile.and_then(|p| p.category_code)),
            drive_mode: record.drive_mode,
            soc: record.extension.soc,
            mileage: record.extension.mileage,
            plate_no: profile.and_then(|p| p.plate_no.as_deref()),
        }
    }
}

/// Position-only projection used in batch arrays.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactPosition<'a> {
    pub vehicle_id: &'a str,
    pub lon: f64,
    pub lat: f64,
    pub timestamp: u64,
    pub speed: f64,
    pub heading: f64,
}

impl<'a> From<&'a VehicleStateRecord> for CompactPosition<'a> {
    fn from(record: &'a VehicleStateRecord) -> Self {
        Self {
            vehicle_id: &record.vehicle_id,
            lon: record.position.lon,
            lat: record.position.lat,
            timestamp: record.timestamp_ms,
            speed: record.speed,
            heading: record.heading,
        }
    }
}

/// Serialize a live update for one record.
pub fn live_payload(
    record: &VehicleStateRecord,
    profile: Option<&VehicleProfile>,
) -> serde_json::Result<Payload> {
    serde_json::to_string(&LivePayload::new(record, profile)).map(Payload::from)
}

/// Serialize a compact array for one flushed batch.
pub fn batch_payload(records: &[VehicleStateRecord]) -> serde_json::Result<Payload> {
    let compact: Vec<CompactPosition<'_>> = records.iter().map(CompactPosition::from).collect();
    serde_json::to_string(&compact).map(Payload::from)
}
