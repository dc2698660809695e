//! Event system for runtime observability.
//!
//! This module provides:
//! - [`EventEmitter`] trait for domain services to emit events
//! - [`RuntimeEvent`] covering node lifecycle, detections, metrics, and
//!   workflow/alarm observability
//! - [`EventBus`](bus::EventBus), the in-process pub/sub with bounded history
//!
//! Transports (WebSocket, SSE, UI frontends) are external collaborators; they
//! would subscribe to the bus the same way test subscribers do.

mod bus;
mod emitter;

pub use bus::{BusEmitter, EventBus, EventScope, EventSubscription};
pub use emitter::{EventEmitter, LoggingEventEmitter, NoopEventEmitter};

use serde::Serialize;

use crate::graph::WorkflowStatus;

/// Phase changes in a workflow's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkflowPhase {
    Deployed,
    Started,
    Stopped,
    Errored,
}

/// Events published on the runtime event bus.
///
/// Node lifecycle events for a given node are emitted in causal order:
/// `NodeStarted` always precedes `NodeCompleted` or `NodeError`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RuntimeEvent {
    /// A node worker started.
    NodeStarted {
        #[serde(rename = "workflowId")]
        workflow_id: String,
        #[serde(rename = "nodeId")]
        node_id: String,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
    /// A node worker exited cleanly.
    NodeCompleted {
        #[serde(rename = "workflowId")]
        workflow_id: String,
        #[serde(rename = "nodeId")]
        node_id: String,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
    /// A node reported a processing error.
    NodeError {
        #[serde(rename = "workflowId")]
        workflow_id: String,
        #[serde(rename = "nodeId")]
        node_id: String,
        message: String,
        /// Whether the node's error rate tripped the persistent-failure threshold.
        persistent: bool,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
    /// Status text for a workflow or node.
    StatusUpdate {
        #[serde(rename = "workflowId")]
        workflow_id: String,
        #[serde(rename = "nodeId", skip_serializing_if = "Option::is_none")]
        node_id: Option<String>,
        status: String,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
    /// Periodic per-node counters.
    MetricsUpdate {
        #[serde(rename = "workflowId")]
        workflow_id: String,
        #[serde(rename = "nodeId")]
        node_id: String,
        metrics: serde_json::Value,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
    /// Detections or preview payloads surfaced for observability.
    Detection {
        #[serde(rename = "workflowId")]
        workflow_id: String,
        #[serde(rename = "nodeId")]
        node_id: String,
        payload: serde_json::Value,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
    /// A workflow changed lifecycle phase.
    WorkflowLifecycle {
        #[serde(rename = "workflowId")]
        workflow_id: String,
        phase: WorkflowPhase,
        status: WorkflowStatus,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
    /// An alarm breached its per-state SLA deadline.
    SlaBreach {
        #[serde(rename = "alarmId")]
        alarm_id: String,
        state: String,
        /// The deadline that was missed, Unix milliseconds.
        deadline: u64,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
}

impl RuntimeEvent {
    /// Workflow the event belongs to, if any.
    #[must_use]
    pub fn workflow_id(&self) -> Option<&str> {
        match self {
            Self::NodeStarted { workflow_id, .. }
            | Self::NodeCompleted { workflow_id, .. }
            | Self::NodeError { workflow_id, .. }
            | Self::StatusUpdate { workflow_id, .. }
            | Self::MetricsUpdate { workflow_id, .. }
            | Self::Detection { workflow_id, .. }
            | Self::WorkflowLifecycle { workflow_id, .. } => Some(workflow_id),
            Self::SlaBreach { .. } => None,
        }
    }

    /// Node the event belongs to, if any.
    #[must_use]
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::NodeStarted { node_id, .. }
            | Self::NodeCompleted { node_id, .. }
            | Self::NodeError { node_id, .. }
            | Self::MetricsUpdate { node_id, .. }
            | Self::Detection { node_id, .. } => Some(node_id),
            Self::StatusUpdate { node_id, .. } => node_id.as_deref(),
            Self::WorkflowLifecycle { .. } | Self::SlaBreach { .. } => None,
        }
    }
}
