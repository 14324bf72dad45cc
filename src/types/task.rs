//! Delivery task types tracked by the geofence monitor

use serde::Serialize;

use super::Position2D;

/// A delivery task with pickup and destination geofences.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskInfo {
    pub task_id: String,
    pub order_id: String,
    pub pickup: Position2D,
    pub destination: Position2D,
    pub vehicle_id: Option<String>,
    pub reached_pickup: bool,
    pub reached_destination: bool,
}

impl TaskInfo {
    pub fn new(
        task_id: impl Into<String>,
        order_id: impl Into<String>,
        pickup: Position2D,
        destination: Position2D,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            order_id: order_id.into(),
            pickup,
            destination,
            vehicle_id: None,
            reached_pickup: false,
            reached_destination: false,
        }
    }

    pub fn with_vehicle(mut self, vehicle_id: impl Into<String>) -> Self {
        self.vehicle_id = Some(vehicle_id.into());
        self
    }

    pub fn is_complete(&self) -> bool {
        self.reached_pickup && self.reached_destination
    }
}

/// Lifecycle transitions emitted by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventKind {
    ArrivedPickup,
    ArrivedDestination,
    TaskCompleted,
}

/// Event broadcast to the order consumer group.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    #[serde(rename = "type")]
    pub kind: TaskEventKind,
    pub task_id: String,
    pub order_id: String,
    pub vehicle_id: String,
    pub timestamp: u64,
    pub lon: f64,
    pub lat: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_with_wire_names() {
        let event = TaskEvent {
            kind: TaskEventKind::ArrivedPickup,
            task_id: "t-1".into(),
            order_id: "o-1".into(),
            vehicle_id: "V001".into(),
            timestamp: 1_700_000_000_000,
            lon: 116.4,
            lat: 39.9,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "arrived_pickup");
        assert_eq!(value["taskId"], "t-1");
        assert_eq!(value["orderId"], "o-1");
        assert_eq!(value["vehicleId"], "V001");
        assert_eq!(value["timestamp"], 1_700_000_000_000u64);
    }
}
