//! Per-vehicle rate shaping for high-frequency feeds

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Admits at most one message per vehicle per `min_interval`, measured on
/// arrival. A zero interval admits everything.
#[derive(Debug)]
pub struct SampleGate {
    min_interval: Duration,
    last_processed: Mutex<HashMap<String, Instant>>,
}

impl SampleGate {
    pub fn new(min_interval: Duration) -> Self {
        Self { min_interval, last_processed: Mutex::new(HashMap::new()) }
    }

    pub fn disabled() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Returns `true` and records the arrival when the vehicle is due.
    pub fn admit(&self, vehicle_id: &str) -> bool {
        if self.min_interval.is_zero() {
            return true;
        }
        let now = Instant::now();
        let mut last = self.last_processed.lock();
        match last.get_mut(vehicle_id) {
            Some(previous) if now.duration_since(*previous) < self.min_interval => false,
            Some(previous) => {
                *previous = now;
                true
            }
            None => {
                last.insert(vehicle_id.to_string(), now);
                true
            }
        }
    }

    /// Forget vehicles whose last admitted message is older than `max_age`.
    /// Returns how many were removed.
    pub fn prune(&self, max_age: Duration) -> usize {
        let mut last = self.last_processed.lock();
        let before = last.len();
        last.retain(|_, previous| previous.elapsed() <= max_age);
        before - last.len()
    }

    /// Vehicles currently tracked.
    pub fn tracked(&self) -> usize {
        self.last_processed.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn drops_messages_inside_interval() {
        let gate = SampleGate::new(Duration::from_millis(1_000));
        assert!(gate.admit("V001"));
        assert!(!gate.admit("V001"));
        assert!(gate.admit("V002"));

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(!gate.admit("V001"));
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(gate.admit("V001"));
        assert_eq!(gate.tracked(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn prune_evicts_quiet_vehicles() {
        let gate = SampleGate::new(Duration::from_millis(100));
        assert!(gate.admit("V001"));
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(gate.admit("V002"));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(gate.prune(Duration::from_secs(60)), 1);
        assert_eq!(gate.tracked(), 1);
        assert!(gate.admit("V001"));
        assert_eq!(gate.tracked(), 2);
    }

    #[test]
    fn zero_interval_admits_everything() {
        let gate = SampleGate::disabled();
        assert!((0..10).all(|_| gate.admit("V001")));
        assert_eq!(gate.tracked(), 0);
    }
}
