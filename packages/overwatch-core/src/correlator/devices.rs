//! Device registry: enrichment context and per-device quality statistics.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Registration record for one capture device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub device_id: String,
    pub tenant: String,
    pub site: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub area: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// `[longitude, latitude]`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geometry: Option<[f64; 2]>,
    /// Health score in `0.0..=1.0` (connectivity, decode quality).
    pub health: f64,
    /// Tags merged into every event from this device.
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Default)]
struct PairStats {
    events: u64,
    false_positives: u64,
}

/// Registry of known devices with false-positive bookkeeping per
/// (device, event type) pair.
pub struct DeviceRegistry {
    devices: DashMap<String, DeviceInfo>,
    stats: DashMap<(String, String), PairStats>,
}

impl DeviceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            devices: DashMap::new(),
            stats: DashMap::new(),
        }
    }

    /// Registers or replaces a device.
    pub fn register(&self, device: DeviceInfo) {
        self.devices.insert(device.device_id.clone(), device);
    }

    /// Looks up a device.
    #[must_use]
    pub fn get(&self, device_id: &str) -> Option<DeviceInfo> {
        self.devices.get(device_id).map(|d| d.clone())
    }

    /// Updates a device's health score (clamped to `0.0..=1.0`).
    pub fn set_health(&self, device_id: &str, health: f64) {
        if let Some(mut device) = self.devices.get_mut(device_id) {
            device.health = health.clamp(0.0, 1.0);
        }
    }

    /// Current health for a device; unknown devices score neutral.
    #[must_use]
    pub fn health_score(&self, device_id: &str) -> f64 {
        self.devices.get(device_id).map_or(0.5, |d| d.health)
    }

    /// Counts one emitted event for the (device, type) pair.
    pub fn record_event(&self, device_id: &str, kind: &str) {
        self.stats
            .entry((device_id.to_string(), kind.to_string()))
            .or_default()
            .events += 1;
    }

    /// Operator feedback on whether an event was a false positive.
    pub fn record_feedback(&self, device_id: &str, kind: &str, false_positive: bool) {
        if false_positive {
            self.stats
                .entry((device_id.to_string(), kind.to_string()))
                .or_default()
                .false_positives += 1;
        }
    }

    /// Historical false-positive rate for a (device, type) pair, in
    /// `0.0..=1.0`. Unknown pairs rate 0.
    #[must_use]
    pub fn fp_rate(&self, device_id: &str, kind: &str) -> f64 {
        self.stats
            .get(&(device_id.to_string(), kind.to_string()))
            .map_or(0.0, |s| {
                if s.events == 0 {
                    0.0
                } else {
                    (s.false_positives as f64 / s.events as f64).clamp(0.0, 1.0)
                }
            })
    }

    /// Number of registered devices.
    #[must_use]
    pub fn count(&self) -> usize {
        self.devices.len()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: &str) -> DeviceInfo {
        DeviceInfo {
            device_id: id.to_string(),
            tenant: "t".into(),
            site: "s".into(),
            area: None,
            location: None,
            geometry: None,
            health: 0.9,
            tags: vec![],
        }
    }

    #[test]
    fn unknown_device_gets_neutral_health() {
        let registry = DeviceRegistry::new();
        assert_eq!(registry.health_score("ghost"), 0.5);
    }

    #[test]
    fn health_is_clamped() {
        let registry = DeviceRegistry::new();
        registry.register(device("cam"));
        registry.set_health("cam", 7.0);
        assert_eq!(registry.health_score("cam"), 1.0);
    }

    #[test]
    fn fp_rate_tracks_feedback_per_pair() {
        let registry = DeviceRegistry::new();
        registry.register(device("cam"));
        for _ in 0..4 {
            registry.record_event("cam", "person");
        }
        registry.record_feedback("cam", "person", true);
        assert_eq!(registry.fp_rate("cam", "person"), 0.25);
        assert_eq!(registry.fp_rate("cam", "vehicle"), 0.0);
    }
}
