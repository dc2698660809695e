//! Alarm types and the alarm lifecycle state machine.
//!
//! An alarm aggregates correlated events under a unique group key and walks
//! a strict state machine. Every mutation appends history; the machine is
//! the single authority on which transitions are legal.

mod manager;

pub use manager::{AlarmManager, AlarmQuery, BulkOutcome, ExportFormat, Page, QueryResult};

use serde::{Deserialize, Serialize};

use crate::utils::now_millis;

/// Alarm severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Minor,
    Major,
    Critical,
}

impl Severity {
    /// One step up, saturating at `Critical`.
    #[must_use]
    pub fn escalated(self) -> Self {
        match self {
            Self::Info => Self::Minor,
            Self::Minor => Self::Major,
            Self::Major | Self::Critical => Self::Critical,
        }
    }
}

/// Alarm lifecycle state.
///
/// `CLOSED` and `SUPPRESSED` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlarmState {
    New,
    Triage,
    Snoozed,
    Active,
    Contained,
    Resolved,
    Closed,
    Suppressed,
}

impl AlarmState {
    /// The transition table. Any pair not listed here is invalid.
    #[must_use]
    pub fn can_transition(self, to: Self) -> bool {
        use AlarmState::*;
        match self {
            New => matches!(to, Triage | Suppressed),
            Triage => matches!(to, Active | Snoozed | Suppressed | Resolved),
            Snoozed => matches!(to, Triage | Suppressed),
            Active => matches!(to, Contained | Resolved | Suppressed),
            Contained => matches!(to, Resolved | Active | Suppressed),
            Resolved => matches!(to, Closed | Active | Suppressed),
            Closed | Suppressed => false,
        }
    }

    /// Whether the alarm has left the working set.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Suppressed)
    }

    /// Wire name (uppercase, as serialized).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Triage => "TRIAGE",
            Self::Snoozed => "SNOOZED",
            Self::Active => "ACTIVE",
            Self::Contained => "CONTAINED",
            Self::Resolved => "RESOLVED",
            Self::Closed => "CLOSED",
            Self::Suppressed => "SUPPRESSED",
        }
    }
}

/// Append-only record of one alarm mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub action: String,
    pub actor: String,
    /// Unix timestamp in milliseconds.
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_state: Option<AlarmState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_state: Option<AlarmState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl HistoryEntry {
    /// Entry without state change.
    #[must_use]
    pub fn action(action: &str, actor: &str, note: Option<String>) -> Self {
        Self {
            action: action.to_string(),
            actor: actor.to_string(),
            timestamp: now_millis(),
            note,
            from_state: None,
            to_state: None,
            details: None,
        }
    }

    /// Entry recording a state transition.
    #[must_use]
    pub fn transition(
        action: &str,
        actor: &str,
        from: AlarmState,
        to: AlarmState,
        note: Option<String>,
    ) -> Self {
        Self {
            from_state: Some(from),
            to_state: Some(to),
            ..Self::action(action, actor, note)
        }
    }
}

/// A free-form note attached to an alarm.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub text: String,
    pub actor: String,
    /// Unix timestamp in milliseconds.
    pub timestamp: u64,
}

/// A lifecycle-tracked incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alarm {
    pub id: String,
    /// `tenant:site:area:type`, the dedup axis. Unique among non-terminal
    /// alarms at any instant.
    pub group_key: String,
    pub severity: Severity,
    pub state: AlarmState,
    /// Unix timestamp in milliseconds.
    pub created_at: u64,
    /// Unix timestamp in milliseconds.
    pub updated_at: u64,
    /// Current per-state SLA deadline, Unix milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sla_deadline: Option<u64>,
    /// Unified correlator confidence for this alarm.
    pub confidence: f64,
    pub correlated_event_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runbook_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation_policy: Option<String>,
    pub watchers: Vec<String>,
    pub notes: Vec<Note>,
    pub history: Vec<HistoryEntry>,
    pub tenant: String,
    pub site: String,
    /// Monotonic snooze token; a wake-up only fires for the snooze that
    /// created it.
    #[serde(default)]
    pub snooze_seq: u64,
    /// Set once the current state's deadline has been reported breached.
    #[serde(default)]
    pub sla_breached: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_can_only_triage_or_suppress() {
        use AlarmState::*;
        assert!(New.can_transition(Triage));
        assert!(New.can_transition(Suppressed));
        for to in [Active, Contained, Resolved, Closed, Snoozed, New] {
            assert!(!New.can_transition(to), "NEW -> {to:?} must be invalid");
        }
    }

    #[test]
    fn terminals_have_no_exits() {
        use AlarmState::*;
        for to in [New, Triage, Snoozed, Active, Contained, Resolved, Closed, Suppressed] {
            assert!(!Closed.can_transition(to));
            assert!(!Suppressed.can_transition(to));
        }
    }

    #[test]
    fn every_state_is_reachable_from_new() {
        use AlarmState::*;
        // Breadth-first over the transition table.
        let all = [New, Triage, Snoozed, Active, Contained, Resolved, Closed, Suppressed];
        let mut reachable = vec![New];
        let mut frontier = vec![New];
        while let Some(state) = frontier.pop() {
            for &to in &all {
                if state.can_transition(to) && !reachable.contains(&to) {
                    reachable.push(to);
                    frontier.push(to);
                }
            }
        }
        assert_eq!(reachable.len(), all.len());
    }

    #[test]
    fn severity_escalation_saturates() {
        assert_eq!(Severity::Info.escalated(), Severity::Minor);
        assert_eq!(Severity::Major.escalated(), Severity::Critical);
        assert_eq!(Severity::Critical.escalated(), Severity::Critical);
    }

    #[test]
    fn state_serializes_uppercase() {
        assert_eq!(
            serde_json::to_string(&AlarmState::Contained).unwrap(),
            "\"CONTAINED\""
        );
    }
}
