//! Geofence monitor for delivery tasks.
//!
//! Tasks are indexed by id and by assigned vehicle. Each incoming record is
//! checked only against the tasks of its own vehicle. Reaching the pickup and
//! the destination each emit one event; once both are reached a completion
//! event follows and the task is dropped from both indices.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::hub::{BroadcastHub, Payload};
use crate::types::{Position2D, TaskEvent, TaskEventKind, TaskInfo, VehicleStateRecord};

pub const DEFAULT_ARRIVAL_THRESHOLD_M: f64 = 100.0;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance in meters between two positions in degrees.
pub fn haversine_m(a: Position2D, b: Position2D) -> f64 {
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let d_lat = lat2 - lat1;
    let d_lon = (b.lon - a.lon).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

#[derive(Default)]
struct TaskIndex {
    by_task: HashMap<String, TaskInfo>,
    by_vehicle: HashMap<String, HashSet<String>>,
}

impl TaskIndex {
    fn unlink_vehicle(&mut self, vehicle_id: &str, task_id: &str) {
        if let Some(tasks) = self.by_vehicle.get_mut(vehicle_id) {
            tasks.remove(task_id);
            if tasks.is_empty() {
                self.by_vehicle.remove(vehicle_id);
            }
        }
    }

    fn remove(&mut self, task_id: &str) -> Option<TaskInfo> {
        let task = self.by_task.remove(task_id)?;
        if let Some(vehicle_id) = &task.vehicle_id {
            self.unlink_vehicle(vehicle_id, task_id);
        }
        Some(task)
    }
}

/// Tracks active tasks and publishes arrival events to one hub group.
pub struct TaskMonitor {
    index: Mutex<TaskIndex>,
    threshold_m: f64,
    hub: BroadcastHub,
    group: String,
}

impl TaskMonitor {
    pub fn new(config: &MonitorConfig, hub: BroadcastHub) -> Self {
        let threshold_m = if config.arrival_threshold_m > 0.0 {
            config.arrival_threshold_m
        } else {
            DEFAULT_ARRIVAL_THRESHOLD_M
        };
        Self {
            index: Mutex::new(TaskIndex::default()),
            threshold_m,
            hub,
            group: config.event_group.clone(),
        }
    }

    pub fn threshold_m(&self) -> f64 {
        self.threshold_m
    }

    /// Start tracking a task, replacing any task with the same id.
    pub fn register(&self, task: TaskInfo) {
        let mut index = self.index.lock();
        index.remove(&task.task_id);
        if let Some(vehicle_id) = &task.vehicle_id {
            index.by_vehicle.entry(vehicle_id.clone()).or_default().insert(task.task_id.clone());
        }
        debug!(task_id = %task.task_id, vehicle_id = ?task.vehicle_id, "Task registered");
        index.by_task.insert(task.task_id.clone(), task);
    }

    /// Move a task onto a vehicle. Returns `false` for unknown tasks.
    pub fn assign_vehicle(&self, task_id: &str, vehicle_id: &str) -> bool {
        let mut index = self.index.lock();
        let Some(task) = index.by_task.get_mut(task_id) else { return false };
        let previous = task.vehicle_id.replace(vehicle_id.to_string());

        if let Some(previous) = previous.filter(|p| p != vehicle_id) {
            index.unlink_vehicle(&previous, task_id);
        }
        index.by_vehicle.entry(vehicle_id.to_string()).or_default().insert(task_id.to_string());
        debug!(task_id, vehicle_id, "Task assigned");
        true
    }

    /// Stop tracking a task.
    pub fn unregister(&self, task_id: &str) -> Option<TaskInfo> {
        self.index.lock().remove(task_id)
    }

    pub fn task(&self, task_id: &str) -> Option<TaskInfo> {
        self.index.lock().by_task.get(task_id).cloned()
    }

    pub fn task_count(&self) -> usize {
        self.index.lock().by_task.len()
    }

    pub fn tasks_for_vehicle(&self, vehicle_id: &str) -> usize {
        self.index.lock().by_vehicle.get(vehicle_id).map_or(0, HashSet::len)
    }

    /// Check one record against its vehicle's tasks, publish and return the
    /// resulting events in emission order.
    pub fn evaluate(&self, record: &VehicleStateRecord) -> Vec<TaskEvent> {
        if !record.position.has_fix() {
            return Vec::new();
        }

        let mut events = Vec::new();
        {
            let mut index = self.index.lock();
            let Some(task_ids) = index.by_vehicle.get(&record.vehicle_id) else {
                return events;
            };
            let mut task_ids: Vec<String> = task_ids.iter().cloned().collect();
            task_ids.sort();

            let mut completed = Vec::new();
            for task_id in task_ids {
                let Some(task) = index.by_task.get_mut(&task_id) else { continue };
                let order_id = task.order_id.clone();
                let event = |kind| TaskEvent {
                    kind,
                    task_id: task_id.clone(),
                    order_id: order_id.clone(),
                    vehicle_id: record.vehicle_id.clone(),
                    timestamp: record.timestamp_ms,
                    lon: record.position.lon,
                    lat: record.position.lat,
                };

                let near_pickup = !task.reached_pickup
                    && task.pickup.is_valid()
                    && haversine_m(record.position, task.pickup) <= self.threshold_m;
                let near_destination = !task.reached_destination
                    && task.destination.is_valid()
                    && haversine_m(record.position, task.destination) <= self.threshold_m;

                if near_pickup {
                    events.push(event(TaskEventKind::ArrivedPickup));
                }
                if near_destination {
                    events.push(event(TaskEventKind::ArrivedDestination));
                }
                task.reached_pickup |= near_pickup;
                task.reached_destination |= near_destination;
                if task.is_complete() {
                    events.push(event(TaskEventKind::TaskCompleted));
                    completed.push(task_id);
                }
            }
            for task_id in completed {
                index.remove(&task_id);
            }
        }

        for event in &events {
            info!(
                task_id = %event.task_id,
                vehicle_id = %event.vehicle_id,
                kind = ?event.kind,
                "Task event"
            );
            self.publish(event);
        }
        events
    }

    fn publish(&self, event: &TaskEvent) {
        let text = match serde_json::to_string(event) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Task event serialization failed");
                return;
            }
        };
        let payload: Payload = Arc::from(text);
        let report = self.hub.broadcast_to_group(&self.group, payload);
        if report.delivered == 0 {
            debug!(group = %self.group, "Task event had no listeners");
        }
    }

    /// Evaluate every record from `records` until cancelled or the channel closes.
    pub fn spawn_listener(
        self: &Arc<Self>,
        mut records: mpsc::Receiver<VehicleStateRecord>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            info!(threshold_m = monitor.threshold_m, "Task monitor started");
            loop {
                let record = tokio::select! {
                    _ = cancel.cancelled() => break,
                    record = records.recv() => record,
                };
                let Some(record) = record else { break };
                monitor.evaluate(&record);
            }
            info!("Task monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::types::RecordSource;
    use proptest::prelude::*;

    const PICKUP: Position2D = Position2D { lon: 116.3975, lat: 39.9087 };
    const DESTINATION: Position2D = Position2D { lon: 116.4500, lat: 39.9300 };

    fn monitor() -> (TaskMonitor, BroadcastHub) {
        let hub = BroadcastHub::spawn(&HubConfig::default(), CancellationToken::new());
        (TaskMonitor::new(&MonitorConfig::default(), hub.clone()), hub)
    }

    fn at(vehicle_id: &str, ts: u64, position: Position2D) -> VehicleStateRecord {
        VehicleStateRecord::new(vehicle_id, RecordSource::Device, ts, position)
    }

    fn offset_north(p: Position2D, meters: f64) -> Position2D {
        Position2D::new(p.lon, p.lat + meters / 111_195.0)
    }

    #[test]
    fn haversine_basics() {
        assert_eq!(haversine_m(PICKUP, PICKUP), 0.0);
        let one_degree = haversine_m(Position2D::new(0.0, 0.0), Position2D::new(0.0, 1.0));
        assert!((one_degree - 111_000.0).abs() / 111_000.0 < 0.01, "{one_degree}");
    }

    #[tokio::test]
    async fn pickup_then_destination_emits_ordered_events() {
        let (monitor, hub) = monitor();
        let mut orders = hub.register(Some("orders".into()));
        monitor.register(TaskInfo::new("t-1", "o-1", PICKUP, DESTINATION).with_vehicle("V001"));

        let far = offset_north(PICKUP, 5_000.0);
        assert!(monitor.evaluate(&at("V001", 1, far)).is_empty());

        let mut kinds = Vec::new();
        for (ts, position) in [
            (2, offset_north(PICKUP, 60.0)),
            (3, offset_north(PICKUP, 10.0)),
            (4, offset_north(DESTINATION, 500.0)),
            (5, offset_north(DESTINATION, 40.0)),
            (6, DESTINATION),
        ] {
            kinds.extend(monitor.evaluate(&at("V001", ts, position)).into_iter().map(|e| e.kind));
        }
        assert_eq!(
            kinds,
            vec![
                TaskEventKind::ArrivedPickup,
                TaskEventKind::ArrivedDestination,
                TaskEventKind::TaskCompleted
            ]
        );
        assert!(monitor.task("t-1").is_none());
        assert_eq!(monitor.tasks_for_vehicle("V001"), 0);

        let first: serde_json::Value = serde_json::from_str(&orders.recv().await.unwrap()).unwrap();
        assert_eq!(first["type"], "arrived_pickup");
        assert_eq!(first["orderId"], "o-1");
        assert_eq!(first["timestamp"], 2);
        let types: Vec<String> = std::iter::from_fn(|| orders.try_recv())
            .map(|p| serde_json::from_str::<serde_json::Value>(&p).unwrap()["type"].to_string())
            .collect();
        assert_eq!(types, vec!["\"arrived_destination\"", "\"task_completed\""]);
    }

    #[tokio::test]
    async fn other_vehicles_and_missing_fixes_are_ignored() {
        let (monitor, _hub) = monitor();
        monitor.register(TaskInfo::new("t-1", "o-1", PICKUP, DESTINATION).with_vehicle("V001"));

        assert!(monitor.evaluate(&at("V002", 1, PICKUP)).is_empty());
        assert!(monitor.evaluate(&at("V001", 2, Position2D::new(0.0, 0.0))).is_empty());
        assert!(monitor.evaluate(&at("V001", 3, Position2D::new(f64::NAN, 39.9))).is_empty());
        assert!(!monitor.task("t-1").unwrap().reached_pickup);
    }

    #[tokio::test]
    async fn invalid_task_coordinates_never_match() {
        let (monitor, _hub) = monitor();
        let broken = Position2D::new(f64::NAN, f64::NAN);
        monitor.register(TaskInfo::new("t-1", "o-1", broken, DESTINATION).with_vehicle("V001"));

        let events = monitor.evaluate(&at("V001", 1, DESTINATION));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, TaskEventKind::ArrivedDestination);
        assert!(monitor.task("t-1").is_some());
    }

    #[tokio::test]
    async fn both_geofences_in_one_record() {
        let (monitor, _hub) = monitor();
        monitor.register(TaskInfo::new("t-1", "o-1", PICKUP, PICKUP).with_vehicle("V001"));

        let kinds: Vec<_> =
            monitor.evaluate(&at("V001", 1, PICKUP)).into_iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TaskEventKind::ArrivedPickup,
                TaskEventKind::ArrivedDestination,
                TaskEventKind::TaskCompleted
            ]
        );
        assert_eq!(monitor.task_count(), 0);
    }

    #[tokio::test]
    async fn reassignment_moves_the_vehicle_index() {
        let (monitor, _hub) = monitor();
        monitor.register(TaskInfo::new("t-1", "o-1", PICKUP, DESTINATION).with_vehicle("V001"));
        assert!(monitor.assign_vehicle("t-1", "V002"));
        assert!(!monitor.assign_vehicle("missing", "V002"));

        assert_eq!(monitor.tasks_for_vehicle("V001"), 0);
        assert!(monitor.evaluate(&at("V001", 1, PICKUP)).is_empty());
        assert_eq!(monitor.evaluate(&at("V002", 2, PICKUP)).len(), 1);

        assert!(monitor.unregister("t-1").is_some());
        assert_eq!(monitor.tasks_for_vehicle("V002"), 0);
    }

    #[tokio::test]
    async fn non_positive_threshold_falls_back() {
        let hub = BroadcastHub::spawn(&HubConfig::default(), CancellationToken::new());
        let config = MonitorConfig { arrival_threshold_m: -5.0, ..MonitorConfig::default() };
        assert_eq!(TaskMonitor::new(&config, hub).threshold_m(), DEFAULT_ARRIVAL_THRESHOLD_M);
    }

    #[tokio::test]
    async fn listener_evaluates_queued_records() {
        let (monitor, hub) = monitor();
        let monitor = Arc::new(monitor);
        let mut orders = hub.register(Some("orders".into()));
        monitor.register(TaskInfo::new("t-1", "o-1", PICKUP, DESTINATION).with_vehicle("V001"));

        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let listener = monitor.spawn_listener(rx, cancel.clone());
        tx.send(at("V001", 7, PICKUP)).await.unwrap();

        let event: serde_json::Value = serde_json::from_str(&orders.recv().await.unwrap()).unwrap();
        assert_eq!(event["type"], "arrived_pickup");
        cancel.cancel();
        listener.await.unwrap();
    }

    proptest! {
        #[test]
        fn haversine_is_symmetric_and_non_negative(
            lon1 in -180.0f64..180.0, lat1 in -90.0f64..90.0,
            lon2 in -180.0f64..180.0, lat2 in -90.0f64..90.0,
        ) {
            let a = Position2D::new(lon1, lat1);
            let b = Position2D::new(lon2, lat2);
            let ab = haversine_m(a, b);
            prop_assert!(ab >= 0.0);
            prop_assert!((ab - haversine_m(b, a)).abs() < 1e-6);
            prop_assert!(ab <= std::f64::consts::PI * EARTH_RADIUS_M + 1.0);
        }
    }
}
