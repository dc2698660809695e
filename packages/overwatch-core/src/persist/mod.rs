//! Persistence layer: versioned workflows, alarms, events, snapshots.
//!
//! Alarm writes are synchronous so durability keeps ordering with history
//! appends; raw events are buffered and batched. The in-memory store is the
//! default for embedded and test use; [`JsonPersistence`](file::JsonPersistence)
//! adds on-disk durability with the same contract.

mod file;

pub use file::JsonPersistence;

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::alarm::{Alarm, AlarmState};
use crate::correlator::RawEvent;
use crate::error::OverwatchResult;
use crate::graph::WorkflowDoc;

/// What a stored snapshot payload contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    /// A single frame image.
    Snapshot,
    /// Concatenated pre/post buffered segments.
    Recording,
}

/// Index entry for one stored snapshot or recording.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alarm_id: Option<String>,
    pub source_id: String,
    /// Unix timestamp in milliseconds.
    pub timestamp_ms: u64,
    pub kind: SnapshotKind,
    /// Container or image format (jpg, png, mp4, mkv).
    pub format: String,
    /// Frames included in the payload.
    pub frame_count: u32,
    pub byte_size: u64,
}

/// Storage contract for the runtime.
///
/// `save_alarm` must be synchronous: the alarm manager calls it under the
/// per-alarm lock so the store observes mutations in history order.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Stores one workflow version. Versions are immutable once written.
    fn save_workflow(&self, doc: &WorkflowDoc) -> OverwatchResult<()>;

    /// Loads a workflow at a version, or the latest when `version` is `None`.
    fn load_workflow(&self, id: &str, version: Option<u32>)
        -> OverwatchResult<Option<WorkflowDoc>>;

    /// Latest version of every stored workflow.
    fn latest_workflows(&self) -> OverwatchResult<Vec<WorkflowDoc>>;

    /// All stored versions of a workflow, ascending.
    fn workflow_versions(&self, id: &str) -> OverwatchResult<Vec<u32>>;

    /// Stores an alarm synchronously.
    fn save_alarm(&self, alarm: &Alarm) -> OverwatchResult<()>;

    /// Loads every stored alarm.
    fn load_alarms(&self) -> OverwatchResult<Vec<Alarm>>;

    /// Alarm ids matching an indexed lookup.
    fn alarms_by_index(&self, index: AlarmIndex<'_>) -> OverwatchResult<Vec<String>>;

    /// Buffers a raw event for batched persistence.
    fn append_event(&self, event: &RawEvent) -> OverwatchResult<()>;

    /// Loads events by id (for alarm includes).
    fn load_events(&self, ids: &[String]) -> OverwatchResult<Vec<RawEvent>>;

    /// Stores a snapshot/recording payload and its index entry.
    fn save_snapshot(&self, record: &SnapshotRecord, payload: Bytes) -> OverwatchResult<()>;

    /// Index entries for one alarm.
    fn snapshots_for(&self, alarm_id: &str) -> OverwatchResult<Vec<SnapshotRecord>>;

    /// Forces buffered writes out.
    async fn flush(&self) -> OverwatchResult<()>;
}

/// Indexed alarm lookups supported by every store.
#[derive(Debug, Clone, Copy)]
pub enum AlarmIndex<'a> {
    Tenant(&'a str),
    Site(&'a str),
    GroupKey(&'a str),
    State(AlarmState),
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory store
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryInner {
    workflows: HashMap<String, BTreeMap<u32, WorkflowDoc>>,
    alarms: HashMap<String, Alarm>,
    by_tenant: HashMap<String, HashSet<String>>,
    by_site: HashMap<String, HashSet<String>>,
    by_group: HashMap<String, HashSet<String>>,
    by_state: HashMap<AlarmState, HashSet<String>>,
    events: HashMap<String, RawEvent>,
    snapshots: HashMap<String, (SnapshotRecord, Bytes)>,
}

/// Index-backed in-memory persistence.
#[derive(Default)]
pub struct MemoryPersistence {
    inner: Mutex<MemoryInner>,
}

impl MemoryPersistence {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn unindex_alarm(inner: &mut MemoryInner, alarm: &Alarm) {
        if let Some(set) = inner.by_tenant.get_mut(&alarm.tenant) {
            set.remove(&alarm.id);
        }
        if let Some(set) = inner.by_site.get_mut(&alarm.site) {
            set.remove(&alarm.id);
        }
        if let Some(set) = inner.by_group.get_mut(&alarm.group_key) {
            set.remove(&alarm.id);
        }
        if let Some(set) = inner.by_state.get_mut(&alarm.state) {
            set.remove(&alarm.id);
        }
    }

    fn index_alarm(inner: &mut MemoryInner, alarm: &Alarm) {
        inner
            .by_tenant
            .entry(alarm.tenant.clone())
            .or_default()
            .insert(alarm.id.clone());
        inner
            .by_site
            .entry(alarm.site.clone())
            .or_default()
            .insert(alarm.id.clone());
        inner
            .by_group
            .entry(alarm.group_key.clone())
            .or_default()
            .insert(alarm.id.clone());
        inner
            .by_state
            .entry(alarm.state)
            .or_default()
            .insert(alarm.id.clone());
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    fn save_workflow(&self, doc: &WorkflowDoc) -> OverwatchResult<()> {
        let mut inner = self.inner.lock();
        inner
            .workflows
            .entry(doc.id.clone())
            .or_default()
            .insert(doc.version, doc.clone());
        Ok(())
    }

    fn load_workflow(
        &self,
        id: &str,
        version: Option<u32>,
    ) -> OverwatchResult<Option<WorkflowDoc>> {
        let inner = self.inner.lock();
        let Some(versions) = inner.workflows.get(id) else {
            return Ok(None);
        };
        Ok(match version {
            Some(v) => versions.get(&v).cloned(),
            None => versions.values().next_back().cloned(),
        })
    }

    fn latest_workflows(&self) -> OverwatchResult<Vec<WorkflowDoc>> {
        let inner = self.inner.lock();
        Ok(inner
            .workflows
            .values()
            .filter_map(|versions| versions.values().next_back().cloned())
            .collect())
    }

    fn workflow_versions(&self, id: &str) -> OverwatchResult<Vec<u32>> {
        let inner = self.inner.lock();
        Ok(inner
            .workflows
            .get(id)
            .map(|versions| versions.keys().copied().collect())
            .unwrap_or_default())
    }

    fn save_alarm(&self, alarm: &Alarm) -> OverwatchResult<()> {
        let mut inner = self.inner.lock();
        if let Some(previous) = inner.alarms.remove(&alarm.id) {
            Self::unindex_alarm(&mut inner, &previous);
        }
        Self::index_alarm(&mut inner, alarm);
        inner.alarms.insert(alarm.id.clone(), alarm.clone());
        Ok(())
    }

    fn load_alarms(&self) -> OverwatchResult<Vec<Alarm>> {
        Ok(self.inner.lock().alarms.values().cloned().collect())
    }

    fn alarms_by_index(&self, index: AlarmIndex<'_>) -> OverwatchResult<Vec<String>> {
        let inner = self.inner.lock();
        let set = match index {
            AlarmIndex::Tenant(tenant) => inner.by_tenant.get(tenant),
            AlarmIndex::Site(site) => inner.by_site.get(site),
            AlarmIndex::GroupKey(key) => inner.by_group.get(key),
            AlarmIndex::State(state) => inner.by_state.get(&state),
        };
        Ok(set.map(|s| s.iter().cloned().collect()).unwrap_or_default())
    }

    fn append_event(&self, event: &RawEvent) -> OverwatchResult<()> {
        self.inner
            .lock()
            .events
            .insert(event.id.clone(), event.clone());
        Ok(())
    }

    fn load_events(&self, ids: &[String]) -> OverwatchResult<Vec<RawEvent>> {
        let inner = self.inner.lock();
        Ok(ids
            .iter()
            .filter_map(|id| inner.events.get(id).cloned())
            .collect())
    }

    fn save_snapshot(&self, record: &SnapshotRecord, payload: Bytes) -> OverwatchResult<()> {
        self.inner
            .lock()
            .snapshots
            .insert(record.id.clone(), (record.clone(), payload));
        Ok(())
    }

    fn snapshots_for(&self, alarm_id: &str) -> OverwatchResult<Vec<SnapshotRecord>> {
        let inner = self.inner.lock();
        Ok(inner
            .snapshots
            .values()
            .filter(|(record, _)| record.alarm_id.as_deref() == Some(alarm_id))
            .map(|(record, _)| record.clone())
            .collect())
    }

    async fn flush(&self) -> OverwatchResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::Severity;
    use serde_json::json;

    fn sample_workflow(version: u32) -> WorkflowDoc {
        serde_json::from_value(json!({
            "id": "wf", "name": "w", "version": version, "schemaVersion": 2,
            "nodes": [], "edges": []
        }))
        .unwrap()
    }

    fn sample_alarm(id: &str, state: AlarmState) -> Alarm {
        Alarm {
            id: id.to_string(),
            group_key: "t1:s1:gate:person".into(),
            severity: Severity::Major,
            state,
            created_at: 1,
            updated_at: 1,
            sla_deadline: None,
            confidence: 0.8,
            correlated_event_ids: vec![],
            assignee: None,
            runbook_id: None,
            escalation_policy: None,
            watchers: vec![],
            notes: vec![],
            history: vec![],
            tenant: "t1".into(),
            site: "s1".into(),
            snooze_seq: 0,
            sla_breached: false,
        }
    }

    #[test]
    fn workflow_versions_are_kept_and_latest_wins() {
        let store = MemoryPersistence::new();
        store.save_workflow(&sample_workflow(1)).unwrap();
        store.save_workflow(&sample_workflow(3)).unwrap();
        store.save_workflow(&sample_workflow(2)).unwrap();

        assert_eq!(store.workflow_versions("wf").unwrap(), vec![1, 2, 3]);
        assert_eq!(store.load_workflow("wf", None).unwrap().unwrap().version, 3);
        assert_eq!(
            store.load_workflow("wf", Some(2)).unwrap().unwrap().version,
            2
        );
    }

    #[test]
    fn alarm_indices_follow_state_changes() {
        let store = MemoryPersistence::new();
        let mut alarm = sample_alarm("a1", AlarmState::New);
        store.save_alarm(&alarm).unwrap();

        assert_eq!(
            store
                .alarms_by_index(AlarmIndex::State(AlarmState::New))
                .unwrap(),
            vec!["a1".to_string()]
        );

        alarm.state = AlarmState::Triage;
        store.save_alarm(&alarm).unwrap();

        assert!(store
            .alarms_by_index(AlarmIndex::State(AlarmState::New))
            .unwrap()
            .is_empty());
        assert_eq!(
            store
                .alarms_by_index(AlarmIndex::GroupKey("t1:s1:gate:person"))
                .unwrap(),
            vec!["a1".to_string()]
        );
    }
}
