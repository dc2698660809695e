//! Node worker infrastructure and per-type behaviors.
//!
//! Every node is a long-lived task fed by a bounded input queue and pushing
//! into its outgoing edges' queues. Workers share a [`NodeCtx`] that carries
//! the merged config, counters, the workflow's cancellation token, and the
//! service handles a node type may need.

mod action;
mod audio;
mod catch;
mod day_night;
mod filter;
mod input;
mod link;
mod model;
mod parking;
mod preview;
mod zone;

pub use link::LinkRegistry;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::events::{EventEmitter, RuntimeEvent};
use crate::graph::NodeKind;
use crate::model::Detection;
use crate::queue::BoundedQueue;
use crate::router::FrameReceiver;
use crate::source::{AudioChunk, Frame};
use crate::state::WorkflowConfig;
use crate::utils::now_millis;

/// Detections paired with the frame they were observed on.
#[derive(Debug, Clone)]
pub struct DetectionBatch {
    pub frame: Frame,
    pub detections: Vec<Detection>,
}

/// An event produced inside the graph (state changes, triggers, errors).
#[derive(Debug, Clone)]
pub struct GraphEvent {
    /// Event kind (e.g. "day_night_change", "vu_trigger", "node_error").
    pub kind: String,
    /// Node that produced the event.
    pub node_id: String,
    pub timestamp_ms: u64,
    pub payload: serde_json::Value,
    /// Frame associated with the event, when one exists.
    pub frame: Option<Frame>,
}

/// Payload flowing over an in-graph edge.
#[derive(Debug, Clone)]
pub enum NodePayload {
    Frame(Frame),
    Detections(DetectionBatch),
    Audio(AudioChunk),
    Event(GraphEvent),
}

impl NodePayload {
    /// Observability projection of the payload.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Frame(frame) => serde_json::json!({
                "kind": "frame",
                "sourceId": frame.source_id(),
                "sequence": frame.sequence(),
                "timestampMs": frame.timestamp_ms(),
                "width": frame.meta().width,
                "height": frame.meta().height,
            }),
            Self::Detections(batch) => serde_json::json!({
                "kind": "detections",
                "sourceId": batch.frame.source_id(),
                "sequence": batch.frame.sequence(),
                "detections": batch.detections,
            }),
            Self::Audio(chunk) => serde_json::json!({
                "kind": "audio",
                "sourceId": chunk.source_id,
                "sampleRate": chunk.sample_rate,
                "durationMs": chunk.duration_ms,
            }),
            Self::Event(event) => serde_json::json!({
                "kind": event.kind,
                "nodeId": event.node_id,
                "timestampMs": event.timestamp_ms,
                "payload": event.payload,
            }),
        }
    }
}

/// A link call in flight, carried alongside payloads so `linkOut` in return
/// mode can resolve the caller.
#[derive(Debug, Clone, Copy)]
pub struct CallToken {
    pub id: u64,
    pub depth: u32,
}

/// Message passed between node workers.
#[derive(Debug, Clone)]
pub struct NodeMsg {
    pub payload: NodePayload,
    pub call: Option<CallToken>,
}

impl NodeMsg {
    #[must_use]
    pub fn new(payload: NodePayload) -> Self {
        Self {
            payload,
            call: None,
        }
    }

    /// Same call context, different payload.
    #[must_use]
    pub fn derive(&self, payload: NodePayload) -> Self {
        Self {
            payload,
            call: self.call,
        }
    }
}

/// A node error surfaced to catch nodes and the workflow status.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeErrorRecord {
    pub workflow_id: String,
    pub node_id: String,
    pub message: String,
    pub timestamp: u64,
}

/// Execution state of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Running,
    Error,
    Stopped,
}

/// Sliding-window error-rate tracker.
///
/// Trips when `threshold` errors land within `window_ms`, marking the node
/// persistently failed.
pub struct ErrorTracker {
    timestamps: Mutex<VecDeque<u64>>,
    threshold: u32,
    window_ms: u64,
}

impl ErrorTracker {
    #[must_use]
    pub fn new(threshold: u32, window_ms: u64) -> Self {
        Self {
            timestamps: Mutex::new(VecDeque::new()),
            threshold,
            window_ms,
        }
    }

    /// Records one error; returns true when the rate threshold trips.
    pub fn record(&self, now: u64) -> bool {
        let mut timestamps = self.timestamps.lock();
        timestamps.push_back(now);
        let cutoff = now.saturating_sub(self.window_ms);
        while timestamps.front().is_some_and(|&t| t < cutoff) {
            timestamps.pop_front();
        }
        timestamps.len() as u32 >= self.threshold
    }
}

/// Counters and state for one node instance.
pub struct NodeRuntime {
    pub node_id: String,
    pub kind: NodeKind,
    pub state: RwLock<NodeState>,
    pub processed: AtomicU64,
    pub emitted: AtomicU64,
    pub errors: AtomicU64,
    pub tracker: ErrorTracker,
}

impl NodeRuntime {
    #[must_use]
    pub fn new(node_id: &str, kind: NodeKind, config: &WorkflowConfig) -> Arc<Self> {
        Arc::new(Self {
            node_id: node_id.to_string(),
            kind,
            state: RwLock::new(NodeState::Running),
            processed: AtomicU64::new(0),
            emitted: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            tracker: ErrorTracker::new(
                config.node_error_threshold,
                config.node_error_window_secs * 1_000,
            ),
        })
    }

    /// Counter snapshot for metrics events.
    #[must_use]
    pub fn metrics(&self) -> serde_json::Value {
        serde_json::json!({
            "processed": self.processed.load(Ordering::Relaxed),
            "emitted": self.emitted.load(Ordering::Relaxed),
            "errors": self.errors.load(Ordering::Relaxed),
            "state": *self.state.read(),
        })
    }
}

/// Workflow-level state shared by all of its node workers.
pub struct WorkflowShared {
    pub workflow_id: String,
    pub status: RwLock<crate::graph::WorkflowStatus>,
    pub last_error: Mutex<Option<String>>,
    /// Most recent node errors, newest last, capped at 20.
    pub recent_errors: Mutex<VecDeque<NodeErrorRecord>>,
    pub cancel: CancellationToken,
    /// Fan-out of node errors to catch nodes.
    pub error_tx: broadcast::Sender<NodeErrorRecord>,
    pub fail_fast: bool,
}

/// Recent node errors kept on the workflow status.
const RECENT_ERROR_CAP: usize = 20;

impl WorkflowShared {
    fn record_error(&self, record: NodeErrorRecord) {
        let mut recent = self.recent_errors.lock();
        if recent.len() >= RECENT_ERROR_CAP {
            recent.pop_front();
        }
        recent.push_back(record.clone());
        drop(recent);
        let _ = self.error_tx.send(record);
    }

    fn enter_error(&self, message: &str) {
        *self.status.write() = crate::graph::WorkflowStatus::Error;
        *self.last_error.lock() = Some(message.to_string());
        if self.fail_fast {
            log::warn!(
                "[Workflow] {} failing fast after persistent node error",
                self.workflow_id
            );
            self.cancel.cancel();
        }
    }
}

/// Everything a node worker needs.
pub struct NodeCtx {
    pub config: serde_json::Value,
    pub input: Arc<BoundedQueue<NodeMsg>>,
    pub outputs: Vec<Arc<BoundedQueue<NodeMsg>>>,
    pub runtime: Arc<NodeRuntime>,
    pub workflow: Arc<WorkflowShared>,
    pub services: Arc<super::SchedulerShared>,
    /// Router subscription, for input nodes.
    pub frames: Option<FrameReceiver>,
    /// Source audio sidechannel, for the audio extractor.
    pub audio: Option<broadcast::Receiver<AudioChunk>>,
    /// Per-node FPS throttle, inherited from the input node when the node's
    /// own config does not declare one.
    pub effective_fps: u32,
}

impl NodeCtx {
    /// Node id shorthand.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.runtime.node_id
    }

    /// Workflow id shorthand.
    #[must_use]
    pub fn workflow_id(&self) -> &str {
        &self.workflow.workflow_id
    }

    /// Awaits the next input message; `None` on cancellation or queue close.
    pub async fn recv(&self) -> Option<NodeMsg> {
        tokio::select! {
            () = self.workflow.cancel.cancelled() => None,
            msg = self.input.pop() => msg,
        }
    }

    /// Pushes a message to every outgoing edge.
    pub fn send(&self, msg: NodeMsg) {
        self.runtime.emitted.fetch_add(1, Ordering::Relaxed);
        match self.outputs.split_last() {
            None => {}
            Some((last, rest)) => {
                for output in rest {
                    output.push(msg.clone());
                }
                last.push(msg);
            }
        }
    }

    /// Typed config accessor.
    #[must_use]
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }

    /// Typed config accessor.
    #[must_use]
    pub fn config_u64(&self, key: &str) -> Option<u64> {
        self.config.get(key).and_then(serde_json::Value::as_u64)
    }

    /// Typed config accessor.
    #[must_use]
    pub fn config_f64(&self, key: &str) -> Option<f64> {
        self.config.get(key).and_then(serde_json::Value::as_f64)
    }

    /// Typed config accessor.
    #[must_use]
    pub fn config_bool(&self, key: &str) -> Option<bool> {
        self.config.get(key).and_then(serde_json::Value::as_bool)
    }

    fn emitter(&self) -> &Arc<dyn EventEmitter> {
        &self.services.emitter
    }

    /// Records a recoverable processing error; the node continues unless the
    /// rate threshold trips, in which case the node and workflow enter the
    /// error state.
    pub fn report_error(&self, message: impl Into<String>) {
        let message = message.into();
        let now = now_millis();
        self.runtime.errors.fetch_add(1, Ordering::Relaxed);
        let persistent = self.runtime.tracker.record(now);

        let record = NodeErrorRecord {
            workflow_id: self.workflow_id().to_string(),
            node_id: self.node_id().to_string(),
            message: message.clone(),
            timestamp: now,
        };
        self.workflow.record_error(record);

        self.emitter().emit(RuntimeEvent::NodeError {
            workflow_id: self.workflow_id().to_string(),
            node_id: self.node_id().to_string(),
            message: message.clone(),
            persistent,
            timestamp: now,
        });

        if persistent && *self.runtime.state.read() != NodeState::Error {
            *self.runtime.state.write() = NodeState::Error;
            log::error!(
                "[Workflow] {}/{} persistently failing: {message}",
                self.workflow_id(),
                self.node_id()
            );
            self.workflow.enter_error(&message);
        } else {
            log::debug!(
                "[Workflow] {}/{} error: {message}",
                self.workflow_id(),
                self.node_id()
            );
        }
    }

    /// Emits a graph event downstream, preserving any call context.
    pub fn emit_event(
        &self,
        source: Option<&NodeMsg>,
        kind: &str,
        payload: serde_json::Value,
        frame: Option<Frame>,
    ) {
        let event = NodePayload::Event(GraphEvent {
            kind: kind.to_string(),
            node_id: self.node_id().to_string(),
            timestamp_ms: now_millis(),
            payload,
            frame,
        });
        let msg = match source {
            Some(msg) => msg.derive(event),
            None => NodeMsg::new(event),
        };
        self.send(msg);
    }
}

/// Runs the worker for a node kind to completion.
pub(super) async fn run_node(kind: NodeKind, mut ctx: NodeCtx) {
    let emitter = Arc::clone(&ctx.services.emitter);
    let workflow_id = ctx.workflow_id().to_string();
    let node_id = ctx.node_id().to_string();

    emitter.emit(RuntimeEvent::NodeStarted {
        workflow_id: workflow_id.clone(),
        node_id: node_id.clone(),
        timestamp: now_millis(),
    });

    match kind {
        NodeKind::Camera | NodeKind::VideoInput | NodeKind::Youtube => input::run(&mut ctx).await,
        NodeKind::Model => model::run(&ctx).await,
        NodeKind::Zone => zone::run(&ctx).await,
        NodeKind::DetectionFilter => filter::run(&ctx).await,
        NodeKind::ParkingViolation => parking::run(&ctx).await,
        NodeKind::DayNightDetector => day_night::run(&ctx).await,
        NodeKind::AudioExtractor => audio::run_extractor(&mut ctx).await,
        NodeKind::AudioAi => audio::run_ai(&ctx).await,
        NodeKind::AudioVu => audio::run_vu(&ctx).await,
        NodeKind::Action => action::run(&ctx).await,
        NodeKind::LinkIn => link::run_in(&ctx).await,
        NodeKind::LinkOut => link::run_out(&ctx).await,
        NodeKind::LinkCall => link::run_call(&ctx).await,
        NodeKind::Catch => catch::run(&ctx).await,
        NodeKind::DataPreview | NodeKind::Debug => preview::run(&ctx).await,
        // Config nodes are folded into their sinks at instantiation.
        NodeKind::Config => {}
    }

    let final_state = *ctx.runtime.state.read();
    if final_state != NodeState::Error {
        *ctx.runtime.state.write() = NodeState::Stopped;
        emitter.emit(RuntimeEvent::NodeCompleted {
            workflow_id,
            node_id,
            timestamp: now_millis(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_tracker_trips_on_rate() {
        let tracker = ErrorTracker::new(3, 30_000);
        assert!(!tracker.record(1_000));
        assert!(!tracker.record(2_000));
        assert!(tracker.record(3_000));
    }

    #[test]
    fn error_tracker_forgets_outside_window() {
        let tracker = ErrorTracker::new(3, 10_000);
        assert!(!tracker.record(0));
        assert!(!tracker.record(1_000));
        // 20s later the first two errors have aged out.
        assert!(!tracker.record(20_000));
        assert!(!tracker.record(21_000));
        assert!(tracker.record(22_000));
    }
}
