//! Event correlation: raw event projection, enrichment, dedup, scoring.
//!
//! Sink nodes configured as event emitters hand their payloads here. The
//! correlator enriches them from the device registry, computes a unified
//! confidence, and folds events sharing a group key within the dedup window
//! into one alarm.

mod devices;

pub use devices::{DeviceInfo, DeviceRegistry};

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::alarm::{Alarm, AlarmManager, Severity};
use crate::error::OverwatchResult;
use crate::persist::Persistence;
use crate::state::CorrelationConfig;
use crate::utils::now_millis;

/// Free-form attributes carried by an event.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct EventAttributes {
    /// Detection confidence in `0.0..=1.0`.
    pub confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Explicit severity from the emitting action, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Media captured alongside an event.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct EventMedia {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clip: Option<String>,
}

/// An enriched, deduplicatable signal derived from detections.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    pub id: String,
    pub tenant: String,
    pub site: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub area: Option<String>,
    /// Event type (e.g. "person", "line_cross", "audio_glass_break").
    #[serde(rename = "type")]
    pub kind: String,
    /// When the underlying detection happened, Unix milliseconds.
    pub observed_at: u64,
    /// When the runtime took the event in. Never before `observed_at`.
    pub ingested_at: u64,
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// `[longitude, latitude]` where known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geometry: Option<[f64; 2]>,
    pub attributes: EventAttributes,
    #[serde(default)]
    pub media: EventMedia,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl RawEvent {
    /// The dedup axis: `tenant:site:area:type`.
    #[must_use]
    pub fn group_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.tenant,
            self.site,
            self.area.as_deref().unwrap_or("-"),
            self.kind
        )
    }

    /// Severity requested by the emitting action, mapped onto alarm severity.
    #[must_use]
    pub fn severity_hint(&self) -> Option<Severity> {
        match self.attributes.severity.as_deref() {
            Some("info") => Some(Severity::Info),
            Some("warning") => Some(Severity::Major),
            Some("critical") => Some(Severity::Critical),
            _ => None,
        }
    }

    /// Builder used by tests across the crate.
    #[cfg(test)]
    #[must_use]
    pub fn test_event(id: &str, tenant: &str, site: &str, area: &str, kind: &str) -> Self {
        let now = now_millis();
        Self {
            id: id.to_string(),
            tenant: tenant.to_string(),
            site: site.to_string(),
            area: Some(area.to_string()),
            kind: kind.to_string(),
            observed_at: now,
            ingested_at: now,
            device_id: "dev-test".to_string(),
            location: None,
            geometry: None,
            attributes: EventAttributes {
                confidence: 0.8,
                ..Default::default()
            },
            media: EventMedia::default(),
            tags: Vec::new(),
        }
    }
}

/// Fields an emitting node provides; the correlator fills in the rest.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub device_id: String,
    pub kind: String,
    pub observed_at: u64,
    pub confidence: f32,
    pub count: Option<u32>,
    pub label: Option<String>,
    pub severity: Option<String>,
    pub snapshot: Option<String>,
    pub clip: Option<String>,
}

/// An open dedup window binding a group key to its alarm.
struct WindowState {
    window_start_ms: u64,
    alarm_id: String,
}

/// Correlates raw events into alarms.
pub struct Correlator {
    config: CorrelationConfig,
    devices: Arc<DeviceRegistry>,
    alarms: Arc<AlarmManager>,
    persistence: Arc<dyn Persistence>,
    windows: DashMap<String, WindowState>,
}

impl Correlator {
    #[must_use]
    pub fn new(
        config: CorrelationConfig,
        devices: Arc<DeviceRegistry>,
        alarms: Arc<AlarmManager>,
        persistence: Arc<dyn Persistence>,
    ) -> Self {
        Self {
            config,
            devices,
            alarms,
            persistence,
            windows: DashMap::new(),
        }
    }

    /// Projects a node-emitted draft into a [`RawEvent`] and ingests it.
    pub fn ingest_draft(&self, draft: EventDraft) -> OverwatchResult<Alarm> {
        let event = self.project(draft);
        self.ingest(event)
    }

    /// Ingests an already-projected event.
    ///
    /// Events with the same group key inside one window count as a single
    /// arrival: they are folded into the open alarm (event id appended,
    /// `updated_at` advanced) without re-scoring it. Only a new arrival
    /// re-evaluates confidence, auto-escalation, and history.
    pub fn ingest(&self, mut event: RawEvent) -> OverwatchResult<Alarm> {
        // Clock skew from devices must not violate the ordering invariant.
        if event.ingested_at < event.observed_at {
            event.ingested_at = event.observed_at;
        }

        let score = self.score(&event);
        self.persistence.append_event(&event)?;
        self.devices.record_event(&event.device_id, &event.kind);

        let group_key = event.group_key();
        let now = event.ingested_at;

        let new_arrival = self.windows.get(&group_key).map_or(true, |window| {
            now.saturating_sub(window.window_start_ms) >= self.config.window_ms
        });

        let alarm = self
            .alarms
            .upsert_from_event(&event, score, new_arrival)?;

        // (Re)open the window on a new arrival, or rebind it when the open
        // alarm changed mid-window (previous one reached a terminal state).
        let rebind = self
            .windows
            .get(&group_key)
            .map_or(true, |window| window.alarm_id != alarm.id);
        if new_arrival || rebind {
            self.windows.insert(
                group_key.clone(),
                WindowState {
                    window_start_ms: now,
                    alarm_id: alarm.id.clone(),
                },
            );
            log::debug!("[Correlator] window opened for {group_key} -> {}", alarm.id);
        } else {
            log::debug!("[Correlator] {group_key} folded into alarm {}", alarm.id);
        }
        Ok(alarm)
    }

    /// Unified confidence: weighted event confidence, device health, and
    /// historical false-positive rate for the (device, type) pair.
    #[must_use]
    pub fn score(&self, event: &RawEvent) -> f64 {
        let health = self.devices.health_score(&event.device_id);
        let fp_rate = self.devices.fp_rate(&event.device_id, &event.kind);
        let weights = &self.config;
        let total = weights.weight_confidence + weights.weight_health + weights.weight_fp_history;
        let weighted = weights.weight_confidence * f64::from(event.attributes.confidence)
            + weights.weight_health * health
            + weights.weight_fp_history * (1.0 - fp_rate);
        (weighted / total).clamp(0.0, 1.0)
    }

    fn project(&self, draft: EventDraft) -> RawEvent {
        let device = self.devices.get(&draft.device_id);
        let now = now_millis();
        let mut tags = self.config.enrichment_tags.clone();
        if let Some(device) = &device {
            tags.extend(device.tags.iter().cloned());
        }

        RawEvent {
            id: Uuid::new_v4().to_string(),
            tenant: device
                .as_ref()
                .map(|d| d.tenant.clone())
                .unwrap_or_else(|| "default".to_string()),
            site: device
                .as_ref()
                .map(|d| d.site.clone())
                .unwrap_or_else(|| "default".to_string()),
            area: device.as_ref().and_then(|d| d.area.clone()),
            kind: draft.kind,
            observed_at: draft.observed_at,
            ingested_at: now.max(draft.observed_at),
            device_id: draft.device_id,
            location: device.as_ref().and_then(|d| d.location.clone()),
            geometry: device.as_ref().and_then(|d| d.geometry),
            attributes: EventAttributes {
                confidence: draft.confidence,
                count: draft.count,
                label: draft.label,
                severity: draft.severity,
                extra: serde_json::Map::new(),
            },
            media: EventMedia {
                snapshot: draft.snapshot,
                clip: draft.clip,
            },
            tags,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEventEmitter;
    use crate::persist::MemoryPersistence;
    use crate::runtime::TokioSpawner;
    use crate::state::SlaConfig;
    use tokio_util::sync::CancellationToken;

    fn correlator_with(
        config: CorrelationConfig,
    ) -> (Correlator, Arc<AlarmManager>, Arc<DeviceRegistry>) {
        let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new());
        let alarms = AlarmManager::new(
            SlaConfig::default(),
            config.clone(),
            Arc::clone(&persistence),
            Arc::new(NoopEventEmitter),
            CancellationToken::new(),
            TokioSpawner::current(),
        )
        .unwrap();
        let devices = Arc::new(DeviceRegistry::new());
        devices.register(DeviceInfo {
            device_id: "cam-gate".into(),
            tenant: "t1".into(),
            site: "s1".into(),
            area: Some("gate".into()),
            location: Some("North gate".into()),
            geometry: Some([13.4, 52.5]),
            health: 1.0,
            tags: vec!["perimeter".into()],
        });
        let correlator = Correlator::new(
            config,
            Arc::clone(&devices),
            Arc::clone(&alarms),
            persistence,
        );
        (correlator, alarms, devices)
    }

    fn correlator() -> (Correlator, Arc<AlarmManager>, Arc<DeviceRegistry>) {
        correlator_with(CorrelationConfig::default())
    }

    fn draft(kind: &str) -> EventDraft {
        EventDraft {
            device_id: "cam-gate".into(),
            kind: kind.into(),
            observed_at: now_millis(),
            confidence: 0.9,
            count: Some(1),
            label: Some("person".into()),
            severity: None,
            snapshot: None,
            clip: None,
        }
    }

    #[tokio::test]
    async fn projection_enriches_from_device_registry() {
        let (correlator, _, _) = correlator();
        let event = correlator.project(draft("person"));
        assert_eq!(event.tenant, "t1");
        assert_eq!(event.site, "s1");
        assert_eq!(event.area.as_deref(), Some("gate"));
        assert_eq!(event.group_key(), "t1:s1:gate:person");
        assert!(event.tags.contains(&"perimeter".to_string()));
        assert!(event.ingested_at >= event.observed_at);
    }

    #[tokio::test]
    async fn two_events_in_window_fold_into_one_alarm() {
        let (correlator, alarms, _) = correlator();

        let first = correlator.ingest_draft(draft("person")).unwrap();
        let mut second = correlator.project(draft("person"));
        second.ingested_at = first.updated_at + 5_000;
        second.observed_at = second.ingested_at;
        let updated = correlator.ingest(second.clone()).unwrap();

        assert_eq!(first.id, updated.id);
        assert_eq!(updated.correlated_event_ids.len(), 2);
        assert_eq!(updated.updated_at, second.ingested_at);
        assert_eq!(alarms.count(), 1);
    }

    #[tokio::test]
    async fn expired_window_counts_as_new_arrival() {
        use crate::alarm::Severity;

        let mut config = CorrelationConfig::default();
        config.window_ms = 1_000;
        let (correlator, _, _) = correlator_with(config);

        let mut low = draft("person");
        low.confidence = 0.2;
        let first = correlator.ingest_draft(low).unwrap();
        assert_eq!(first.severity, Severity::Minor);

        // High confidence inside the open window: folded, no escalation.
        let mut hot = draft("person");
        hot.confidence = 0.95;
        let mut inside = correlator.project(hot.clone());
        inside.observed_at = first.updated_at + 500;
        inside.ingested_at = inside.observed_at;
        let folded = correlator.ingest(inside).unwrap();
        assert_eq!(folded.severity, Severity::Minor);
        assert!(!folded.history.iter().any(|h| h.action == "auto_escalated"));

        // The same event past the window is a new arrival and escalates.
        let mut outside = correlator.project(hot);
        outside.observed_at = first.updated_at + 5_000;
        outside.ingested_at = outside.observed_at;
        let escalated = correlator.ingest(outside).unwrap();
        assert_eq!(escalated.id, first.id);
        assert!(escalated.severity > Severity::Minor);
        assert!(escalated.history.iter().any(|h| h.action == "auto_escalated"));
    }

    #[tokio::test]
    async fn different_types_open_different_alarms() {
        let (correlator, alarms, _) = correlator();
        correlator.ingest_draft(draft("person")).unwrap();
        correlator.ingest_draft(draft("vehicle")).unwrap();
        assert_eq!(alarms.count(), 2);
    }

    #[tokio::test]
    async fn ingested_at_is_clamped_to_observed_at() {
        let (correlator, _, _) = correlator();
        let mut event = correlator.project(draft("person"));
        event.ingested_at = event.observed_at - 1_000;
        let alarm = correlator.ingest(event.clone()).unwrap();
        assert!(alarm.updated_at >= event.observed_at);
    }

    #[tokio::test]
    async fn healthy_device_scores_higher_than_degraded() {
        let (correlator, _, devices) = correlator();
        let event = correlator.project(draft("person"));
        let healthy = correlator.score(&event);

        devices.set_health("cam-gate", 0.2);
        let degraded = correlator.score(&event);
        assert!(healthy > degraded);
    }

    #[tokio::test]
    async fn false_positive_feedback_lowers_score() {
        let (correlator, _, devices) = correlator();
        let event = correlator.project(draft("person"));
        let before = correlator.score(&event);

        for _ in 0..10 {
            devices.record_event("cam-gate", "person");
            devices.record_feedback("cam-gate", "person", true);
        }
        let after = correlator.score(&event);
        assert!(before > after);
    }
}
