//! Core runtime configuration types.
//!
//! Provides the validated [`Config`] consumed by bootstrap, grouped into
//! per-component sections (ingestion, routing, correlation, alarms, bus).

use serde::{Deserialize, Serialize};

use crate::alarm::Severity;
use crate::queue::DropPolicy;

/// Configuration for stream ingestion behavior.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct IngestConfig {
    /// Ring buffer capacity per source, in frames.
    pub ring_capacity: usize,

    /// Transport connect timeout in seconds.
    pub connect_timeout_secs: u64,

    /// Maximum reconnect backoff in seconds.
    pub reconnect_max_backoff_secs: u64,

    /// Reconnect attempts before a source is declared unreachable.
    pub reconnect_max_retries: u32,

    /// Consecutive decode errors that trigger a reconnect.
    pub decode_error_threshold: u32,

    /// Capacity of the per-source frame broadcast channel.
    pub broadcast_capacity: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 300,
            connect_timeout_secs: 30,
            reconnect_max_backoff_secs: 30,
            reconnect_max_retries: 8,
            decode_error_threshold: 5,
            broadcast_capacity: 64,
        }
    }
}

/// Configuration for frame routing between sources and workflows.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RouterConfig {
    /// Default per-edge queue depth when a subscription does not specify one.
    pub default_queue_depth: usize,

    /// Default per-edge target FPS when a subscription does not specify one.
    pub default_target_fps: u32,

    /// Default drop policy for frame edges. Freshness is preferred.
    pub default_drop_policy: DropPolicy,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_queue_depth: 8,
            default_target_fps: 10,
            default_drop_policy: DropPolicy::DropOldest,
        }
    }
}

/// Configuration for event correlation and confidence scoring.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CorrelationConfig {
    /// Dedup window in milliseconds. Events with the same group key inside
    /// one window count as a single arrival: they attach to the open alarm
    /// but skip re-scoring, auto-escalation, and history. The next event
    /// after the window expires is a new arrival.
    pub window_ms: u64,

    /// Weight of the per-event confidence in the unified score.
    pub weight_confidence: f64,

    /// Weight of the device health score in the unified score.
    pub weight_health: f64,

    /// Weight of (1 - historical false-positive rate) in the unified score.
    pub weight_fp_history: f64,

    /// Unified score at or above which alarm severity is auto-escalated.
    pub escalation_threshold: f64,

    /// Static tags attached to every enriched event (weather/policy feeds).
    pub enrichment_tags: Vec<String>,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            window_ms: 30_000,
            weight_confidence: 0.6,
            weight_health: 0.2,
            weight_fp_history: 0.2,
            escalation_threshold: 0.85,
            enrichment_tags: Vec::new(),
        }
    }
}

/// Per-state SLA time budgets for one severity, in milliseconds.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct SlaTargets {
    /// Budget for leaving NEW/TRIAGE.
    pub triage_ms: u64,
    /// Budget while ACTIVE.
    pub active_ms: u64,
    /// Budget while CONTAINED.
    pub contained_ms: u64,
}

/// SLA targets per alarm severity.
#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct SlaConfig {
    pub info: SlaTargets,
    pub minor: SlaTargets,
    pub major: SlaTargets,
    pub critical: SlaTargets,
}

impl SlaConfig {
    /// Returns the SLA targets for a severity.
    #[must_use]
    pub fn targets_for(&self, severity: Severity) -> SlaTargets {
        match severity {
            Severity::Info => self.info,
            Severity::Minor => self.minor,
            Severity::Major => self.major,
            Severity::Critical => self.critical,
        }
    }
}

impl Default for SlaConfig {
    fn default() -> Self {
        Self {
            info: SlaTargets {
                triage_ms: 4 * 3_600_000,
                active_ms: 8 * 3_600_000,
                contained_ms: 24 * 3_600_000,
            },
            minor: SlaTargets {
                triage_ms: 3_600_000,
                active_ms: 4 * 3_600_000,
                contained_ms: 12 * 3_600_000,
            },
            major: SlaTargets {
                triage_ms: 900_000,
                active_ms: 3_600_000,
                contained_ms: 4 * 3_600_000,
            },
            critical: SlaTargets {
                triage_ms: 300_000,
                active_ms: 1_800_000,
                contained_ms: 3_600_000,
            },
        }
    }
}

/// Configuration for the in-process event bus.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct EventBusConfig {
    /// Bounded history of recently published events.
    pub history_capacity: usize,

    /// Per-subscriber bounded queue depth. Slow subscribers lose oldest.
    pub subscriber_queue_depth: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            history_capacity: 1000,
            subscriber_queue_depth: 256,
        }
    }
}

/// Configuration for workflow execution.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Node errors within the window that mark a node as persistently failed.
    pub node_error_threshold: u32,

    /// Sliding window for the persistent-failure threshold, in seconds.
    pub node_error_window_secs: u64,

    /// Depth of per-node input queues.
    pub node_queue_depth: usize,

    /// Maximum link-call nesting depth.
    pub link_call_depth_limit: u32,

    /// Timeout for an individual link call, in seconds.
    pub link_call_timeout_secs: u64,

    /// Deadline for cooperative teardown of node workers, in seconds.
    pub teardown_deadline_secs: u64,

    /// Stop all nodes when a single node fails persistently.
    pub fail_fast: bool,

    /// Default action delivery timeout in seconds.
    pub action_timeout_secs: u64,

    /// Default action retry count after the initial attempt.
    pub action_retries: u32,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            node_error_threshold: 10,
            node_error_window_secs: 30,
            node_queue_depth: 16,
            link_call_depth_limit: 8,
            link_call_timeout_secs: 10,
            teardown_deadline_secs: 5,
            fail_fast: false,
            action_timeout_secs: 10,
            action_retries: 3,
        }
    }
}

/// Configuration for the Overwatch runtime.
///
/// All fields have sensible defaults.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    /// Stream ingestion settings.
    pub ingest: IngestConfig,

    /// Frame routing settings.
    pub router: RouterConfig,

    /// Event correlation and scoring settings.
    pub correlation: CorrelationConfig,

    /// SLA targets per severity.
    pub sla: SlaConfig,

    /// Event bus settings.
    pub event_bus: EventBusConfig,

    /// Workflow execution settings.
    pub workflow: WorkflowConfig,
}

impl Config {
    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns a message describing the first value that would cause
    /// runtime issues.
    pub fn validate(&self) -> Result<(), String> {
        if self.ingest.ring_capacity == 0 {
            return Err("ingest.ring_capacity must be >= 1".to_string());
        }
        if self.ingest.broadcast_capacity == 0 {
            return Err(
                "ingest.broadcast_capacity must be >= 1 (broadcast::channel panics on 0)"
                    .to_string(),
            );
        }
        if self.router.default_target_fps == 0 {
            return Err("router.default_target_fps must be >= 1".to_string());
        }
        if self.router.default_queue_depth == 0 {
            return Err("router.default_queue_depth must be >= 1".to_string());
        }
        if self.correlation.window_ms == 0 {
            return Err("correlation.window_ms must be >= 1".to_string());
        }
        let weight_sum = self.correlation.weight_confidence
            + self.correlation.weight_health
            + self.correlation.weight_fp_history;
        if weight_sum <= 0.0 {
            return Err("correlation weights must sum to a positive value".to_string());
        }
        if !(0.0..=1.0).contains(&self.correlation.escalation_threshold) {
            return Err("correlation.escalation_threshold must be within 0..=1".to_string());
        }
        if self.event_bus.history_capacity == 0 {
            return Err("event_bus.history_capacity must be >= 1".to_string());
        }
        if self.workflow.node_error_threshold == 0 {
            return Err("workflow.node_error_threshold must be >= 1".to_string());
        }
        if self.workflow.link_call_depth_limit == 0 {
            return Err("workflow.link_call_depth_limit must be >= 1".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn zero_ring_capacity_is_rejected() {
        let mut config = Config::default();
        config.ingest.ring_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_weights_are_rejected() {
        let mut config = Config::default();
        config.correlation.weight_confidence = 0.0;
        config.correlation.weight_health = 0.0;
        config.correlation.weight_fp_history = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn sla_targets_tighten_with_severity() {
        let sla = SlaConfig::default();
        assert!(
            sla.targets_for(Severity::Critical).triage_ms < sla.targets_for(Severity::Info).triage_ms
        );
    }
}
