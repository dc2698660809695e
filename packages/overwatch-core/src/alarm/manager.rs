//! Alarm lifecycle management.
//!
//! The manager exclusively owns the alarm set: every mutation flows through
//! it, serialised per alarm id over sharded locks, and is persisted
//! synchronously together with its history append. Reads never take the
//! write locks.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{Alarm, AlarmState, HistoryEntry, Note, Severity};
use crate::correlator::RawEvent;
use crate::error::{OverwatchError, OverwatchResult};
use crate::events::{EventEmitter, RuntimeEvent};
use crate::persist::Persistence;
use crate::runtime::{TaskSpawner, TokioSpawner};
use crate::state::{CorrelationConfig, SlaConfig};
use crate::utils::now_millis;

/// Lock shards for per-alarm mutation serialisation.
const LOCK_SHARDS: usize = 64;

/// How often the SLA monitor scans deadlines.
const SLA_SCAN_INTERVAL_MS: u64 = 1_000;

/// Filter for alarm queries and exports.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AlarmQuery {
    pub states: Vec<AlarmState>,
    pub severities: Vec<Severity>,
    pub assignee: Option<String>,
    pub tenant: Option<String>,
    pub site: Option<String>,
    /// Inclusive lower bound on `created_at`, Unix milliseconds.
    pub created_from: Option<u64>,
    /// Inclusive upper bound on `created_at`, Unix milliseconds.
    pub created_to: Option<u64>,
    /// Substring match over id, group key, and note text.
    pub search: Option<String>,
}

impl AlarmQuery {
    fn matches(&self, alarm: &Alarm) -> bool {
        if !self.states.is_empty() && !self.states.contains(&alarm.state) {
            return false;
        }
        if !self.severities.is_empty() && !self.severities.contains(&alarm.severity) {
            return false;
        }
        if let Some(assignee) = &self.assignee {
            if alarm.assignee.as_deref() != Some(assignee.as_str()) {
                return false;
            }
        }
        if let Some(tenant) = &self.tenant {
            if &alarm.tenant != tenant {
                return false;
            }
        }
        if let Some(site) = &self.site {
            if &alarm.site != site {
                return false;
            }
        }
        if let Some(from) = self.created_from {
            if alarm.created_at < from {
                return false;
            }
        }
        if let Some(to) = self.created_to {
            if alarm.created_at > to {
                return false;
            }
        }
        if let Some(search) = &self.search {
            let needle = search.to_lowercase();
            let hit = alarm.id.to_lowercase().contains(&needle)
                || alarm.group_key.to_lowercase().contains(&needle)
                || alarm
                    .notes
                    .iter()
                    .any(|n| n.text.to_lowercase().contains(&needle));
            if !hit {
                return false;
            }
        }
        true
    }
}

/// Pagination window.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
        }
    }
}

/// One page of query results.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub total: usize,
    pub items: Vec<Alarm>,
}

/// Per-id outcome of a bulk operation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkOutcome {
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Export formats for the alarm list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Csv,
}

/// Owns the alarm set and enforces the state machine.
pub struct AlarmManager {
    alarms: DashMap<String, Alarm>,
    /// group key -> open (non-terminal) alarm id. The uniqueness invariant.
    open_by_group: DashMap<String, String>,
    locks: Vec<Mutex<()>>,
    sla: SlaConfig,
    correlation: CorrelationConfig,
    persistence: Arc<dyn Persistence>,
    emitter: Arc<dyn EventEmitter>,
    cancel: CancellationToken,
    /// Spawner for the SLA monitor and snooze wake-up timers.
    spawner: TokioSpawner,
}

impl AlarmManager {
    /// Creates a manager, restoring persisted alarms into the working set.
    pub fn new(
        sla: SlaConfig,
        correlation: CorrelationConfig,
        persistence: Arc<dyn Persistence>,
        emitter: Arc<dyn EventEmitter>,
        cancel: CancellationToken,
        spawner: TokioSpawner,
    ) -> OverwatchResult<Arc<Self>> {
        let manager = Arc::new(Self {
            alarms: DashMap::new(),
            open_by_group: DashMap::new(),
            locks: (0..LOCK_SHARDS).map(|_| Mutex::new(())).collect(),
            sla,
            correlation,
            persistence,
            emitter,
            cancel,
            spawner,
        });

        for alarm in manager.persistence.load_alarms()? {
            if !alarm.state.is_terminal() {
                manager
                    .open_by_group
                    .insert(alarm.group_key.clone(), alarm.id.clone());
            }
            manager.alarms.insert(alarm.id.clone(), alarm);
        }

        Ok(manager)
    }

    /// Starts the background SLA deadline monitor.
    pub fn start_sla_monitor(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        self.spawner.spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(SLA_SCAN_INTERVAL_MS));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = manager.cancel.cancelled() => return,
                    _ = ticker.tick() => manager.scan_sla_deadlines(),
                }
            }
        });
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Creation / correlation entry point
    // ─────────────────────────────────────────────────────────────────────────

    /// Applies one enriched event: creates a new alarm for its group key or
    /// folds it into the open one.
    ///
    /// `new_arrival` is the correlator's dedup verdict. A folded event
    /// (inside an open window) only appends its id and advances
    /// `updated_at`; a new arrival additionally updates confidence, may
    /// auto-escalate severity, and records history.
    pub fn upsert_from_event(
        &self,
        event: &RawEvent,
        score: f64,
        new_arrival: bool,
    ) -> OverwatchResult<Alarm> {
        let group_key = event.group_key();

        if let Some(existing_id) = self.open_by_group.get(&group_key).map(|r| r.value().clone()) {
            let escalation_threshold = self.correlation.escalation_threshold;
            let updated = self.with_alarm(&existing_id, |alarm| {
                if !alarm.correlated_event_ids.contains(&event.id) {
                    alarm.correlated_event_ids.push(event.id.clone());
                }
                alarm.updated_at = event.ingested_at;
                if !new_arrival {
                    return Ok(());
                }
                alarm.confidence = alarm.confidence.max(score);
                alarm.history.push(HistoryEntry {
                    action: "event_correlated".into(),
                    actor: "correlator".into(),
                    timestamp: now_millis(),
                    note: None,
                    from_state: None,
                    to_state: None,
                    details: Some(serde_json::json!({ "eventId": event.id })),
                });
                if score >= escalation_threshold && alarm.severity != Severity::Critical {
                    let from = alarm.severity;
                    alarm.severity = alarm.severity.escalated();
                    alarm.history.push(HistoryEntry {
                        action: "auto_escalated".into(),
                        actor: "correlator".into(),
                        timestamp: now_millis(),
                        note: None,
                        from_state: None,
                        to_state: None,
                        details: Some(serde_json::json!({
                            "from": from, "to": alarm.severity, "score": score
                        })),
                    });
                }
                Ok(())
            })?;
            return Ok(updated);
        }

        self.create_from_event(event, score, &group_key)
    }

    fn create_from_event(
        &self,
        event: &RawEvent,
        score: f64,
        group_key: &str,
    ) -> OverwatchResult<Alarm> {
        let severity = event
            .severity_hint()
            .unwrap_or_else(|| severity_from_score(score));
        let now = now_millis();
        let mut alarm = Alarm {
            id: Uuid::new_v4().to_string(),
            group_key: group_key.to_string(),
            severity,
            state: AlarmState::New,
            created_at: now,
            updated_at: event.ingested_at,
            sla_deadline: None,
            confidence: score,
            correlated_event_ids: vec![event.id.clone()],
            assignee: None,
            runbook_id: None,
            escalation_policy: None,
            watchers: Vec::new(),
            notes: Vec::new(),
            history: vec![HistoryEntry {
                action: "created".into(),
                actor: "correlator".into(),
                timestamp: now,
                note: None,
                from_state: None,
                to_state: Some(AlarmState::New),
                details: Some(serde_json::json!({ "eventId": event.id })),
            }],
            tenant: event.tenant.clone(),
            site: event.site.clone(),
            snooze_seq: 0,
            sla_breached: false,
        };
        alarm.sla_deadline = self.deadline_for(&alarm);

        let _guard = self.shard(&alarm.id).lock();
        self.persistence.save_alarm(&alarm)?;
        self.open_by_group
            .insert(group_key.to_string(), alarm.id.clone());
        self.alarms.insert(alarm.id.clone(), alarm.clone());
        log::info!(
            "[Alarms] created {} ({group_key}, {:?})",
            alarm.id,
            alarm.severity
        );
        Ok(alarm)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Mutators
    // ─────────────────────────────────────────────────────────────────────────

    /// Moves an alarm to TRIAGE. Idempotent when already triaged: state is
    /// unchanged and one history entry records the acknowledgement.
    pub fn acknowledge(&self, id: &str, actor: &str) -> OverwatchResult<Alarm> {
        self.with_alarm(id, |alarm| {
            if alarm.state == AlarmState::Triage {
                alarm
                    .history
                    .push(HistoryEntry::action("acknowledged", actor, None));
                return Ok(());
            }
            Self::apply_transition(alarm, AlarmState::Triage, "acknowledged", actor, None)?;
            Ok(())
        })
        .map(|alarm| self.finish_transition(alarm))
    }

    /// Assigns an alarm. Re-assigning the same assignee only adds history.
    pub fn assign(&self, id: &str, assignee: &str, actor: &str) -> OverwatchResult<Alarm> {
        self.with_alarm(id, |alarm| {
            alarm.assignee = Some(assignee.to_string());
            alarm.history.push(HistoryEntry {
                details: Some(serde_json::json!({ "assignee": assignee })),
                ..HistoryEntry::action("assigned", actor, None)
            });
            Ok(())
        })
    }

    /// Applies an explicit state transition.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` when the machine forbids it; the alarm and its
    /// history are unchanged.
    pub fn transition(
        &self,
        id: &str,
        to: AlarmState,
        actor: &str,
        note: Option<String>,
    ) -> OverwatchResult<Alarm> {
        self.with_alarm(id, |alarm| {
            Self::apply_transition(alarm, to, "transition", actor, note.clone())
        })
        .map(|alarm| self.finish_transition(alarm))
    }

    /// Appends a note.
    pub fn add_note(&self, id: &str, text: &str, actor: &str) -> OverwatchResult<Alarm> {
        self.with_alarm(id, |alarm| {
            alarm.notes.push(Note {
                text: text.to_string(),
                actor: actor.to_string(),
                timestamp: now_millis(),
            });
            alarm
                .history
                .push(HistoryEntry::action("note_added", actor, Some(text.to_string())));
            Ok(())
        })
    }

    /// Changes severity and recomputes the current SLA deadline.
    pub fn update_severity(
        &self,
        id: &str,
        severity: Severity,
        actor: &str,
    ) -> OverwatchResult<Alarm> {
        let result = self.with_alarm(id, |alarm| {
            let from = alarm.severity;
            alarm.severity = severity;
            alarm.history.push(HistoryEntry {
                details: Some(serde_json::json!({ "from": from, "to": severity })),
                ..HistoryEntry::action("severity_changed", actor, None)
            });
            Ok(())
        })?;
        self.with_alarm(&result.id, |alarm| {
            alarm.sla_deadline = self.deadline_for(alarm);
            Ok(())
        })
    }

    /// Sets or clears the runbook reference.
    pub fn set_runbook(
        &self,
        id: &str,
        runbook_id: Option<String>,
        actor: &str,
    ) -> OverwatchResult<Alarm> {
        self.with_alarm(id, |alarm| {
            alarm.runbook_id = runbook_id.clone();
            alarm.history.push(HistoryEntry {
                details: Some(serde_json::json!({ "runbookId": runbook_id })),
                ..HistoryEntry::action("runbook_set", actor, None)
            });
            Ok(())
        })
    }

    /// Sets or clears the escalation policy.
    pub fn set_escalation_policy(
        &self,
        id: &str,
        policy: Option<String>,
        actor: &str,
    ) -> OverwatchResult<Alarm> {
        self.with_alarm(id, |alarm| {
            alarm.escalation_policy = policy.clone();
            alarm.history.push(HistoryEntry {
                details: Some(serde_json::json!({ "policy": policy })),
                ..HistoryEntry::action("escalation_policy_set", actor, None)
            });
            Ok(())
        })
    }

    /// Adds a watcher.
    ///
    /// # Errors
    ///
    /// `Conflict` when the watcher is already present.
    pub fn add_watcher(&self, id: &str, watcher: &str, actor: &str) -> OverwatchResult<Alarm> {
        self.with_alarm(id, |alarm| {
            if alarm.watchers.iter().any(|w| w == watcher) {
                return Err(OverwatchError::Conflict(format!(
                    "watcher {watcher} already on alarm {id}"
                )));
            }
            alarm.watchers.push(watcher.to_string());
            alarm.history.push(HistoryEntry {
                details: Some(serde_json::json!({ "watcher": watcher })),
                ..HistoryEntry::action("watcher_added", actor, None)
            });
            Ok(())
        })
    }

    /// Removes a watcher.
    ///
    /// # Errors
    ///
    /// `NotFound` when the watcher is not on the alarm.
    pub fn remove_watcher(&self, id: &str, watcher: &str, actor: &str) -> OverwatchResult<Alarm> {
        self.with_alarm(id, |alarm| {
            let before = alarm.watchers.len();
            alarm.watchers.retain(|w| w != watcher);
            if alarm.watchers.len() == before {
                return Err(OverwatchError::NotFound(format!(
                    "watcher {watcher} on alarm {id}"
                )));
            }
            alarm.history.push(HistoryEntry {
                details: Some(serde_json::json!({ "watcher": watcher })),
                ..HistoryEntry::action("watcher_removed", actor, None)
            });
            Ok(())
        })
    }

    /// Snoozes a triaged alarm; it auto-returns to TRIAGE after `duration_ms`.
    pub fn snooze(
        self: &Arc<Self>,
        id: &str,
        duration_ms: u64,
        actor: &str,
    ) -> OverwatchResult<Alarm> {
        let alarm = self.with_alarm(id, |alarm| {
            Self::apply_transition(alarm, AlarmState::Snoozed, "snoozed", actor, None)?;
            alarm.snooze_seq += 1;
            alarm.sla_deadline = None;
            Ok(())
        })?;
        let alarm = self.finish_transition(alarm);

        let manager = Arc::clone(self);
        let alarm_id = id.to_string();
        let token = alarm.snooze_seq;
        self.spawner.spawn(async move {
            tokio::select! {
                () = manager.cancel.cancelled() => {}
                () = tokio::time::sleep(Duration::from_millis(duration_ms)) => {
                    manager.wake_from_snooze(&alarm_id, token);
                }
            }
        });

        Ok(alarm)
    }

    fn wake_from_snooze(&self, id: &str, token: u64) {
        let result = self.with_alarm(id, |alarm| {
            // A newer snooze or a manual transition supersedes this timer.
            if alarm.state != AlarmState::Snoozed || alarm.snooze_seq != token {
                return Ok(());
            }
            Self::apply_transition(
                alarm,
                AlarmState::Triage,
                "snooze_expired",
                "scheduler",
                None,
            )?;
            Ok(())
        });
        match result {
            Ok(alarm) => {
                let _ = self.finish_transition(alarm);
                log::debug!("[Alarms] snooze expired for {id}");
            }
            Err(err) => log::warn!("[Alarms] snooze wake for {id} failed: {err}"),
        }
    }

    /// Suppresses an alarm (terminal).
    pub fn suppress(&self, id: &str, reason: &str, actor: &str) -> OverwatchResult<Alarm> {
        self.with_alarm(id, |alarm| {
            Self::apply_transition(
                alarm,
                AlarmState::Suppressed,
                "suppressed",
                actor,
                Some(reason.to_string()),
            )?;
            Ok(())
        })
        .map(|alarm| self.finish_transition(alarm))
    }

    /// Bulk state transition. Atomicity is per alarm; the result reports
    /// exactly one outcome per requested id.
    pub fn bulk_transition(
        &self,
        ids: &[String],
        to: AlarmState,
        actor: &str,
        note: Option<String>,
    ) -> Vec<BulkOutcome> {
        ids.iter()
            .map(|id| match self.transition(id, to, actor, note.clone()) {
                Ok(_) => BulkOutcome {
                    id: id.clone(),
                    ok: true,
                    error: None,
                },
                Err(err) => BulkOutcome {
                    id: id.clone(),
                    ok: false,
                    error: Some(err.to_string()),
                },
            })
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────────

    /// Fetches one alarm.
    pub fn get(&self, id: &str) -> OverwatchResult<Alarm> {
        self.alarms
            .get(id)
            .map(|a| a.clone())
            .ok_or_else(|| OverwatchError::NotFound(format!("alarm {id}")))
    }

    /// Fetches one alarm with its correlated events.
    pub fn get_with_events(&self, id: &str) -> OverwatchResult<(Alarm, Vec<RawEvent>)> {
        let alarm = self.get(id)?;
        let events = self.persistence.load_events(&alarm.correlated_event_ids)?;
        Ok((alarm, events))
    }

    /// Filtered, paginated query. Newest first.
    pub fn query(&self, filter: &AlarmQuery, page: Page) -> QueryResult {
        let mut matching: Vec<Alarm> = self
            .alarms
            .iter()
            .filter(|a| filter.matches(a.value()))
            .map(|a| a.value().clone())
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));

        let total = matching.len();
        let items = matching
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .collect();
        QueryResult { total, items }
    }

    /// Exports matching alarms as JSON or CSV.
    pub fn export(&self, filter: &AlarmQuery, format: ExportFormat) -> OverwatchResult<String> {
        let alarms = self
            .query(filter, Page { offset: 0, limit: usize::MAX })
            .items;
        match format {
            ExportFormat::Json => Ok(serde_json::to_string_pretty(&alarms)?),
            ExportFormat::Csv => {
                let mut writer = csv::Writer::from_writer(Vec::new());
                writer
                    .write_record([
                        "id", "groupKey", "severity", "state", "createdAt", "updatedAt",
                        "assignee", "tenant", "site", "confidence",
                    ])
                    .map_err(|e| OverwatchError::Internal(e.to_string()))?;
                for alarm in &alarms {
                    writer
                        .write_record([
                            alarm.id.as_str(),
                            alarm.group_key.as_str(),
                            &format!("{:?}", alarm.severity).to_lowercase(),
                            alarm.state.as_str(),
                            &alarm.created_at.to_string(),
                            &alarm.updated_at.to_string(),
                            alarm.assignee.as_deref().unwrap_or(""),
                            alarm.tenant.as_str(),
                            alarm.site.as_str(),
                            &format!("{:.3}", alarm.confidence),
                        ])
                        .map_err(|e| OverwatchError::Internal(e.to_string()))?;
                }
                let bytes = writer
                    .into_inner()
                    .map_err(|e| OverwatchError::Internal(e.to_string()))?;
                String::from_utf8(bytes).map_err(|e| OverwatchError::Internal(e.to_string()))
            }
        }
    }

    /// Streaming export, chunked by line for incremental transfer.
    pub fn export_stream(
        &self,
        filter: &AlarmQuery,
        format: ExportFormat,
    ) -> OverwatchResult<impl futures::Stream<Item = String>> {
        let rendered = self.export(filter, format)?;
        let lines: Vec<String> = rendered.lines().map(|line| format!("{line}\n")).collect();
        Ok(futures::stream::iter(lines))
    }

    /// Number of alarms in the working set.
    #[must_use]
    pub fn count(&self) -> usize {
        self.alarms.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────────

    fn shard(&self, id: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        &self.locks[(hasher.finish() as usize) % LOCK_SHARDS]
    }

    /// Runs a mutation under the alarm's shard lock and persists the result
    /// before publishing it to readers.
    ///
    /// The closure owns `updated_at`: correlation sets it to the event's
    /// arrival time, everything else leaves the default touch in place.
    fn with_alarm<F>(&self, id: &str, mutate: F) -> OverwatchResult<Alarm>
    where
        F: FnOnce(&mut Alarm) -> OverwatchResult<()>,
    {
        let _guard = self.shard(id).lock();
        let mut alarm = self
            .alarms
            .get(id)
            .map(|a| a.clone())
            .ok_or_else(|| OverwatchError::NotFound(format!("alarm {id}")))?;

        let updated_at_before = alarm.updated_at;
        mutate(&mut alarm)?;
        if alarm.updated_at == updated_at_before {
            alarm.updated_at = now_millis();
        }
        self.persistence.save_alarm(&alarm)?;
        self.alarms.insert(alarm.id.clone(), alarm.clone());
        Ok(alarm)
    }

    /// Validates and records a state transition on the alarm value.
    fn apply_transition(
        alarm: &mut Alarm,
        to: AlarmState,
        action: &str,
        actor: &str,
        note: Option<String>,
    ) -> OverwatchResult<()> {
        let from = alarm.state;
        if !from.can_transition(to) {
            return Err(OverwatchError::InvalidTransition(format!(
                "{} -> {} on alarm {}",
                from.as_str(),
                to.as_str(),
                alarm.id
            )));
        }
        alarm.state = to;
        alarm.sla_breached = false;
        alarm
            .history
            .push(HistoryEntry::transition(action, actor, from, to, note));
        Ok(())
    }

    /// Post-transition bookkeeping: group index and SLA deadline.
    fn finish_transition(&self, alarm: Alarm) -> Alarm {
        if alarm.state.is_terminal() {
            self.open_by_group.remove(&alarm.group_key);
        }
        // The per-state deadline resets only on an actual state entry, not
        // on idempotent mutations.
        let transitioned = alarm.history.last().is_some_and(|h| h.to_state.is_some());
        if !transitioned {
            return alarm;
        }
        match self.with_alarm(&alarm.id, |a| {
            a.sla_deadline = self.deadline_for(a);
            Ok(())
        }) {
            Ok(updated) => updated,
            Err(_) => alarm,
        }
    }

    fn deadline_for(&self, alarm: &Alarm) -> Option<u64> {
        let targets = self.sla.targets_for(alarm.severity);
        let budget = match alarm.state {
            AlarmState::New | AlarmState::Triage => targets.triage_ms,
            AlarmState::Active => targets.active_ms,
            AlarmState::Contained => targets.contained_ms,
            _ => return None,
        };
        Some(now_millis() + budget)
    }

    fn scan_sla_deadlines(&self) {
        let now = now_millis();
        let breached: Vec<(String, AlarmState, u64)> = self
            .alarms
            .iter()
            .filter(|a| {
                !a.state.is_terminal()
                    && !a.sla_breached
                    && a.sla_deadline.is_some_and(|d| d < now)
            })
            .map(|a| (a.id.clone(), a.state, a.sla_deadline.unwrap_or(0)))
            .collect();

        for (id, state, deadline) in breached {
            let marked = self.with_alarm(&id, |alarm| {
                if alarm.sla_breached || alarm.sla_deadline.is_none() {
                    return Ok(());
                }
                alarm.sla_breached = true;
                alarm.history.push(HistoryEntry {
                    details: Some(serde_json::json!({ "deadline": deadline })),
                    ..HistoryEntry::action("sla_breach", "scheduler", None)
                });
                Ok(())
            });
            if marked.is_ok() {
                log::warn!("[Alarms] SLA breach on {id} in {}", state.as_str());
                self.emitter.emit(RuntimeEvent::SlaBreach {
                    alarm_id: id,
                    state: state.as_str().to_string(),
                    deadline,
                    timestamp: now,
                });
            }
        }
    }
}

fn severity_from_score(score: f64) -> Severity {
    if score >= 0.85 {
        Severity::Critical
    } else if score >= 0.7 {
        Severity::Major
    } else if score >= 0.4 {
        Severity::Minor
    } else {
        Severity::Info
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEventEmitter;
    use crate::persist::MemoryPersistence;

    fn manager() -> Arc<AlarmManager> {
        AlarmManager::new(
            SlaConfig::default(),
            CorrelationConfig::default(),
            Arc::new(MemoryPersistence::new()),
            Arc::new(NoopEventEmitter),
            CancellationToken::new(),
            TokioSpawner::current(),
        )
        .unwrap()
    }

    fn event(id: &str) -> RawEvent {
        RawEvent::test_event(id, "t1", "s1", "gate", "person")
    }

    #[tokio::test]
    async fn creation_writes_created_history_first() {
        let manager = manager();
        let alarm = manager.upsert_from_event(&event("ev-1"), 0.6, true).unwrap();
        assert_eq!(alarm.state, AlarmState::New);
        assert_eq!(alarm.history[0].action, "created");
        assert!(alarm.sla_deadline.is_some());
    }

    #[tokio::test]
    async fn same_group_key_updates_existing_alarm() {
        let manager = manager();
        let first = manager.upsert_from_event(&event("ev-1"), 0.6, true).unwrap();

        let mut second_event = event("ev-2");
        second_event.ingested_at = first.updated_at + 5_000;
        let second = manager.upsert_from_event(&second_event, 0.6, true).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.correlated_event_ids.len(), 2);
        assert_eq!(second.updated_at, second_event.ingested_at);
        assert_eq!(manager.count(), 1);
    }

    #[tokio::test]
    async fn folded_event_appends_without_rescoring() {
        let manager = manager();
        let first = manager.upsert_from_event(&event("ev-1"), 0.5, true).unwrap();
        assert_eq!(first.severity, Severity::Minor);
        let history_len = first.history.len();

        // Same window: the event attaches but counts as the same arrival.
        let mut second = event("ev-2");
        second.ingested_at = first.updated_at + 5_000;
        let folded = manager.upsert_from_event(&second, 0.9, false).unwrap();

        assert_eq!(folded.correlated_event_ids.len(), 2);
        assert_eq!(folded.updated_at, second.ingested_at);
        assert_eq!(folded.severity, Severity::Minor, "folded events never escalate");
        assert_eq!(folded.history.len(), history_len, "folded events add no history");
        assert_eq!(folded.confidence, first.confidence);
    }

    #[tokio::test]
    async fn group_key_is_unique_among_non_terminal() {
        let manager = manager();
        let first = manager.upsert_from_event(&event("ev-1"), 0.6, true).unwrap();
        manager
            .suppress(&first.id, "maintenance window", "op")
            .unwrap();

        // The open alarm is terminal: the same key now creates a new alarm.
        let second = manager.upsert_from_event(&event("ev-2"), 0.6, true).unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(manager.count(), 2);
    }

    #[tokio::test]
    async fn invalid_transition_leaves_alarm_untouched() {
        let manager = manager();
        let alarm = manager.upsert_from_event(&event("ev-1"), 0.6, true).unwrap();
        let history_len = alarm.history.len();

        let result = manager.transition(&alarm.id, AlarmState::Contained, "op", None);
        assert!(matches!(result, Err(OverwatchError::InvalidTransition(_))));

        let unchanged = manager.get(&alarm.id).unwrap();
        assert_eq!(unchanged.state, AlarmState::New);
        assert_eq!(unchanged.history.len(), history_len);
    }

    #[tokio::test]
    async fn acknowledge_is_idempotent_on_triage() {
        let manager = manager();
        let alarm = manager.upsert_from_event(&event("ev-1"), 0.6, true).unwrap();

        let once = manager.acknowledge(&alarm.id, "op").unwrap();
        assert_eq!(once.state, AlarmState::Triage);
        let history_after_first = once.history.len();

        let twice = manager.acknowledge(&alarm.id, "op").unwrap();
        assert_eq!(twice.state, AlarmState::Triage);
        assert_eq!(twice.history.len(), history_after_first + 1);
    }

    #[tokio::test]
    async fn assign_twice_is_idempotent_modulo_history() {
        let manager = manager();
        let alarm = manager.upsert_from_event(&event("ev-1"), 0.6, true).unwrap();
        let a = manager.assign(&alarm.id, "casey", "op").unwrap();
        let b = manager.assign(&alarm.id, "casey", "op").unwrap();
        assert_eq!(a.assignee, b.assignee);
        assert_eq!(b.history.len(), a.history.len() + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn snooze_auto_wakes_to_triage() {
        let manager = manager();
        let alarm = manager.upsert_from_event(&event("ev-1"), 0.6, true).unwrap();
        manager.acknowledge(&alarm.id, "op").unwrap();
        manager.snooze(&alarm.id, 60_000, "op").unwrap();
        assert_eq!(manager.get(&alarm.id).unwrap().state, AlarmState::Snoozed);

        tokio::time::sleep(Duration::from_millis(61_000)).await;

        let woken = manager.get(&alarm.id).unwrap();
        assert_eq!(woken.state, AlarmState::Triage);
        let actions: Vec<&str> = woken.history.iter().map(|h| h.action.as_str()).collect();
        let snoozed_at = actions.iter().position(|a| *a == "snoozed").unwrap();
        let expired_at = actions.iter().position(|a| *a == "snooze_expired").unwrap();
        assert!(expired_at > snoozed_at);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_wake_supersedes_snooze_timer() {
        let manager = manager();
        let alarm = manager.upsert_from_event(&event("ev-1"), 0.6, true).unwrap();
        manager.acknowledge(&alarm.id, "op").unwrap();
        manager.snooze(&alarm.id, 60_000, "op").unwrap();
        manager
            .transition(&alarm.id, AlarmState::Triage, "op", None)
            .unwrap();
        manager
            .transition(&alarm.id, AlarmState::Active, "op", None)
            .unwrap();

        tokio::time::sleep(Duration::from_millis(61_000)).await;

        // The stale timer must not drag the alarm back to TRIAGE.
        assert_eq!(manager.get(&alarm.id).unwrap().state, AlarmState::Active);
    }

    #[tokio::test]
    async fn watcher_conflicts_and_not_found() {
        let manager = manager();
        let alarm = manager.upsert_from_event(&event("ev-1"), 0.6, true).unwrap();
        manager.add_watcher(&alarm.id, "casey", "op").unwrap();
        assert!(matches!(
            manager.add_watcher(&alarm.id, "casey", "op"),
            Err(OverwatchError::Conflict(_))
        ));
        assert!(matches!(
            manager.remove_watcher(&alarm.id, "robin", "op"),
            Err(OverwatchError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn bulk_transition_reports_per_id_outcomes() {
        let manager = manager();
        let a = manager.upsert_from_event(&event("ev-1"), 0.6, true).unwrap();
        let b = manager
            .upsert_from_event(&RawEvent::test_event("ev-2", "t1", "s1", "dock", "person"), 0.6, true)
            .unwrap();
        manager.acknowledge(&b.id, "op").unwrap();

        let ids = vec![a.id.clone(), b.id.clone(), "ghost".to_string()];
        let outcomes = manager.bulk_transition(&ids, AlarmState::Triage, "op", None);

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].ok);
        assert!(!outcomes[1].ok, "TRIAGE -> TRIAGE is not in the table");
        assert!(!outcomes[2].ok);
    }

    #[tokio::test]
    async fn query_filters_and_paginates() {
        let manager = manager();
        for i in 0..5 {
            manager
                .upsert_from_event(
                    &RawEvent::test_event(&format!("ev-{i}"), "t1", "s1", &format!("area-{i}"), "person"),
                    0.9,
                    true,
                )
                .unwrap();
        }
        let all = manager.query(&AlarmQuery::default(), Page::default());
        assert_eq!(all.total, 5);

        let page = manager.query(
            &AlarmQuery::default(),
            Page { offset: 0, limit: 2 },
        );
        assert_eq!(page.items.len(), 2);

        let filtered = manager.query(
            &AlarmQuery {
                severities: vec![Severity::Critical],
                ..Default::default()
            },
            Page::default(),
        );
        assert_eq!(filtered.total, 5, "score 0.9 creates critical alarms");
    }

    #[tokio::test]
    async fn csv_export_has_header_and_rows() {
        let manager = manager();
        manager.upsert_from_event(&event("ev-1"), 0.6, true).unwrap();
        let csv = manager
            .export(&AlarmQuery::default(), ExportFormat::Csv)
            .unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("id,groupKey,severity"));
    }

    #[tokio::test]
    async fn auto_escalation_at_high_score() {
        let manager = manager();
        let first = manager.upsert_from_event(&event("ev-1"), 0.5, true).unwrap();
        assert_eq!(first.severity, Severity::Minor);

        let updated = manager.upsert_from_event(&event("ev-2"), 0.9, true).unwrap();
        assert_eq!(updated.severity, Severity::Major);
        assert!(updated
            .history
            .iter()
            .any(|h| h.action == "auto_escalated"));
    }

    #[tokio::test]
    async fn sla_breach_is_detected_once() {
        // SLA deadlines are wall-clock; this test uses real (short) sleeps.
        let mut sla = SlaConfig::default();
        sla.minor.triage_ms = 30;
        let manager = AlarmManager::new(
            sla,
            CorrelationConfig::default(),
            Arc::new(MemoryPersistence::new()),
            Arc::new(NoopEventEmitter),
            CancellationToken::new(),
            TokioSpawner::current(),
        )
        .unwrap();

        let alarm = manager.upsert_from_event(&event("ev-1"), 0.5, true).unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        manager.scan_sla_deadlines();
        manager.scan_sla_deadlines();

        let breached = manager.get(&alarm.id).unwrap();
        assert!(breached.sla_breached);
        let breaches = breached
            .history
            .iter()
            .filter(|h| h.action == "sla_breach")
            .count();
        assert_eq!(breaches, 1);
    }
}
