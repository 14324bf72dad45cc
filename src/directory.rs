//! Best-effort static vehicle lookup used to enrich live payloads

use std::collections::HashMap;

use parking_lot::RwLock;

/// Static attributes of a registered vehicle.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VehicleProfile {
    pub plate_no: Option<String>,
    pub category_code: Option<i32>,
}

/// Lookup of static vehicle attributes. Absence is not an error.
pub trait VehicleDirectory: Send + Sync + 'static {
    fn profile(&self, vehicle_id: &str) -> Option<VehicleProfile>;
}

/// Directory that knows no vehicles.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDirectory;

impl VehicleDirectory for NoDirectory {
    fn profile(&self, _vehicle_id: &str) -> Option<VehicleProfile> {
        None
    }
}

/// In-memory directory refreshed by whoever owns the relational store.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    profiles: RwLock<HashMap<String, VehicleProfile>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, vehicle_id: impl Into<String>, profile: VehicleProfile) {
        self.profiles.write().insert(vehicle_id.into(), profile);
    }

    /// Replace every profile at once.
    pub fn replace_all(&self, profiles: HashMap<String, VehicleProfile>) {
        *self.profiles.write() = profiles;
    }

    pub fn len(&self) -> usize {
        self.profiles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.read().is_empty()
    }
}

impl VehicleDirectory for StaticDirectory {
    fn profile(&self, vehicle_id: &str) -> Option<VehicleProfile> {
        self.profiles.read().get(vehicle_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_and_replace() {
        let directory = StaticDirectory::new();
        directory.insert(
            "V001",
            VehicleProfile { plate_no: Some("ABC-123".into()), category_code: Some(2) },
        );
        assert_eq!(directory.profile("V001").unwrap().plate_no.as_deref(), Some("ABC-123"));
        assert!(directory.profile("V404").is_none());

        directory.replace_all(HashMap::new());
        assert!(directory.is_empty());
        assert!(NoDirectory.profile("V001").is_none());
    }
}
