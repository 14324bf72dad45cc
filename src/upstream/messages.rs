//! JSON shapes exchanged with the upstream feed

use serde::{Deserialize, Serialize};

use crate::types::{
    AssistFlags, LightState, Position2D, RecordSource, VehicleStateRecord, now_ms,
};

/// Subscription or one-off query sent to the feed. Absent fields are omitted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vehicle_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category_code: Option<i32>,
}

impl SubscribeRequest {
    pub fn vehicle(vehicle_id: impl Into<String>) -> Self {
        Self { vehicle_id: Some(vehicle_id.into()), category_code: None }
    }

    pub fn category(category_code: i32) -> Self {
        Self { vehicle_id: None, category_code: Some(category_code) }
    }
}

/// Envelope of every inbound message.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UpstreamMessage {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Option<UpstreamVehicleState>,
}

impl UpstreamMessage {
    pub fn is_success(&self) -> bool {
        self.code == 0 || self.code == 200
    }

    /// Vehicle id carried by the data section, if any.
    pub fn vehicle_id(&self) -> Option<&str> {
        self.data.as_ref().map(|d| d.vehicle_id.as_str()).filter(|id| !id.is_empty())
    }
}

/// Vehicle state as the feed reports it. Flags arrive as 0/1 integers.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpstreamVehicleState {
    pub vehicle_id: String,
    pub category_code: Option<i32>,
    pub timestamp: Option<u64>,
    pub speed: Option<f64>,
    pub lon: Option<f64>,
    pub lat: Option<f64>,
    pub heading: Option<f64>,
    pub drive_mode: Option<u8>,
    pub tap_pos: Option<u8>,
    pub accel_pos: Option<f64>,
    pub brake_flag: Option<i64>,
    pub brake_pos: Option<f64>,
    pub fuel_consumption: Option<f64>,
    pub abs_flag: Option<i64>,
    pub tcs_flag: Option<i64>,
    pub esp_flag: Option<i64>,
    pub lka_flag: Option<i64>,
    pub acc_mode: Option<u8>,
    pub fcw_flag: Option<i64>,
    pub ldw_flag: Option<i64>,
    pub aeb_flag: Option<i64>,
    pub lca_flag: Option<i64>,
    pub dms_flag: Option<i64>,
    pub soc: Option<f64>,
    pub mileage: Option<f64>,
    pub acceleration_h: Option<f64>,
    pub acceleration_v: Option<f64>,
    pub low_beam: Option<i64>,
    pub high_beam: Option<i64>,
    pub left_turn: Option<i64>,
    pub right_turn: Option<i64>,
    pub hazard_signal: Option<i64>,
    pub automatic: Option<i64>,
    pub daytime_running: Option<i64>,
    pub fog_light: Option<i64>,
    pub parking: Option<i64>,
    pub veh_fault: Option<i64>,
    pub doors: Option<Vec<u8>>,
}

fn flag(value: Option<i64>) -> bool {
    value.is_some_and(|v| v != 0)
}

impl UpstreamVehicleState {
    fn has_lights(&self) -> bool {
        [
            self.low_beam,
            self.high_beam,
            self.left_turn,
            self.right_turn,
            self.hazard_signal,
            self.automatic,
            self.daytime_running,
            self.fog_light,
            self.parking,
        ]
        .iter()
        .any(Option::is_some)
    }

    fn has_assist(&self) -> bool {
        [
            self.abs_flag,
            self.tcs_flag,
            self.esp_flag,
            self.lka_flag,
            self.fcw_flag,
            self.ldw_flag,
            self.aeb_flag,
            self.lca_flag,
            self.dms_flag,
        ]
        .iter()
        .any(Option::is_some)
            || self.acc_mode.is_some()
    }

    /// Resolve into a pipeline record.
    ///
    /// Returns `None` without a vehicle id. A missing timestamp is replaced by
    /// the arrival time; missing coordinates become the no-fix origin.
    pub fn into_record(self) -> Option<VehicleStateRecord> {
        if self.vehicle_id.trim().is_empty() {
            return None;
        }

        let has_lights = self.has_lights();
        let has_assist = self.has_assist();
        let mut record = VehicleStateRecord::new(
            self.vehicle_id,
            RecordSource::Upstream,
            self.timestamp.filter(|t| *t != 0).unwrap_or_else(now_ms),
            Position2D::new(self.lon.unwrap_or(0.0), self.lat.unwrap_or(0.0)),
        );
        record.speed = self.speed.unwrap_or(0.0);
        record.heading = self.heading.unwrap_or(0.0);
        record.drive_mode = self.drive_mode;
        record.tap_pos = self.tap_pos;
        record.brake_flag = self.brake_flag.map(|v| v != 0);
        record.accel_pos = self.accel_pos;
        record.brake_pos = self.brake_pos;
        record.fuel_consumption = self.fuel_consumption;
        record.accel_longitudinal = self.acceleration_h;
        record.accel_vertical = self.acceleration_v;

        let ext = &mut record.extension;
        ext.category_code = self.category_code;
        ext.soc = self.soc;
        ext.mileage = self.mileage;
        ext.doors = self.doors;
        ext.vehicle_fault = self.veh_fault.map(|v| v != 0);
        if has_lights {
            ext.lights = Some(LightState {
                low_beam: flag(self.low_beam),
                high_beam: flag(self.high_beam),
                left_turn: flag(self.left_turn),
                right_turn: flag(self.right_turn),
                hazard: flag(self.hazard_signal),
                fog: flag(self.fog_light),
                daytime_running: flag(self.daytime_running),
                parking: flag(self.parking),
                automatic: flag(self.automatic),
            });
        }
        if has_assist {
            ext.assist = Some(AssistFlags {
                abs: flag(self.abs_flag),
                tcs: flag(self.tcs_flag),
                esp: flag(self.esp_flag),
                lka: flag(self.lka_flag),
                fcw: flag(self.fcw_flag),
                ldw: flag(self.ldw_flag),
                aeb: flag(self.aeb_flag),
                lca: flag(self.lca_flag),
                dms: flag(self.dms_flag),
                acc_mode: self.acc_mode.unwrap_or(0),
            });
        }
        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_request_omits_absent_fields() {
        assert_eq!(
            serde_json::to_string(&SubscribeRequest::vehicle("V001")).unwrap(),
            r#"{"vehicleId":"V001"}"#
        );
        assert_eq!(
            serde_json::to_string(&SubscribeRequest::category(3)).unwrap(),
            r#"{"categoryCode":3}"#
        );
    }

    #[test]
    fn full_message_resolves_into_record() {
        let json = r#"{
            "code": 0,
            "message": "ok",
            "data": {
                "vehicleId": "V001",
                "categoryCode": 2,
                "timestamp": 1700000000000,
                "speed": 35.5,
                "lon": 116.3975,
                "lat": 39.9087,
                "heading": 270.0,
                "driveMode": 1,
                "brakeFlag": 1,
                "absFlag": 0,
                "accMode": 2,
                "soc": 76.5,
                "mileage": 12034.2,
                "lowBeam": 1,
                "doors": [0, 0, 1, 0],
                "unknownField": "ignored"
            }
        }"#;
        let message: UpstreamMessage = serde_json::from_str(json).unwrap();
        assert!(message.is_success());
        assert_eq!(message.vehicle_id(), Some("V001"));

        let record = message.data.unwrap().into_record().unwrap();
        assert_eq!(record.source, RecordSource::Upstream);
        assert_eq!(record.timestamp_ms, 1_700_000_000_000);
        assert_eq!(record.speed, 35.5);
        assert_eq!(record.position, Position2D::new(116.3975, 39.9087));
        assert_eq!(record.brake_flag, Some(true));
        assert_eq!(record.extension.category_code, Some(2));
        assert_eq!(record.extension.doors, Some(vec![0, 0, 1, 0]));
        assert!(record.extension.lights.unwrap().low_beam);
        assert_eq!(record.extension.assist.unwrap().acc_mode, 2);
    }

    #[test]
    fn sparse_message_leaves_optionals_unset() {
        let message: UpstreamMessage =
            serde_json::from_str(r#"{"code":0,"data":{"vehicleId":"V2","timestamp":5}}"#).unwrap();
        let record = message.data.unwrap().into_record().unwrap();
        assert!(record.extension.lights.is_none());
        assert!(record.extension.assist.is_none());
        assert!(!record.position.has_fix());
    }

    #[test]
    fn blank_vehicle_id_yields_nothing() {
        let message: UpstreamMessage =
            serde_json::from_str(r#"{"code":1,"message":"no data"}"#).unwrap();
        assert!(!message.is_success());
        assert!(message.vehicle_id().is_none());
        assert!(UpstreamVehicleState::default().into_record().is_none());
    }
}
