//! Last-seen tracking for vehicles feeding the pipeline

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;

/// Per-vehicle last-seen instants, updated on every ingested record.
#[derive(Debug, Default)]
pub struct OnlineRegistry {
    last_seen: RwLock<HashMap<String, Instant>>,
}

impl OnlineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn touch(&self, vehicle_id: &str) {
        let now = Instant::now();
        let mut last_seen = self.last_seen.write();
        match last_seen.get_mut(vehicle_id) {
            Some(seen) => *seen = now,
            None => {
                last_seen.insert(vehicle_id.to_string(), now);
            }
        }
    }

    pub fn last_seen(&self, vehicle_id: &str) -> Option<Instant> {
        self.last_seen.read().get(vehicle_id).copied()
    }

    /// Seen within `window` of now.
    pub fn is_online(&self, vehicle_id: &str, window: Duration) -> bool {
        self.last_seen(vehicle_id).is_some_and(|seen| seen.elapsed() <= window)
    }

    pub fn online_count(&self, window: Duration) -> usize {
        self.last_seen.read().values().filter(|seen| seen.elapsed() <= window).count()
    }

    /// Forget vehicles silent for longer than `window`. Returns how many were removed.
    pub fn prune(&self, window: Duration) -> usize {
        let mut last_seen = self.last_seen.write();
        let before = last_seen.len();
        last_seen.retain(|_, seen| seen.elapsed() <= window);
        before - last_seen.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn window_decides_online_status() {
        let registry = OnlineRegistry::new();
        registry.touch("V001");
        tokio::time::advance(Duration::from_secs(20)).await;
        registry.touch("V002");

        let window = Duration::from_secs(30);
        assert!(registry.is_online("V001", window));
        assert_eq!(registry.online_count(window), 2);

        tokio::time::advance(Duration::from_secs(15)).await;
        assert!(!registry.is_online("V001", window));
        assert!(registry.is_online("V002", window));
        assert!(!registry.is_online("V404", window));
        assert_eq!(registry.online_count(window), 1);

        assert_eq!(registry.prune(window), 1);
        assert!(registry.last_seen("V001").is_none());
    }
}
