//! Frame router: fan-out from sources to subscribed workflows.
//!
//! Each (source, workflow) pair is an independent edge with its own FPS
//! throttle, bounded queue, drop policy, and metrics. Frames on one edge are
//! delivered in source order; edges do not order against each other.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{OverwatchError, OverwatchResult};
use crate::queue::{BoundedQueue, DropPolicy};
use crate::runtime::{TaskSpawner, TokioSpawner};
use crate::source::{Frame, SourceRegistry};
use crate::state::RouterConfig;

/// Identifies one routed edge.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct EdgeKey {
    pub source_id: String,
    pub workflow_id: String,
}

impl EdgeKey {
    #[must_use]
    pub fn new(source_id: &str, workflow_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            workflow_id: workflow_id.to_string(),
        }
    }
}

/// Subscription request from a workflow's input node.
#[derive(Debug, Clone)]
pub struct EdgeSpec {
    pub source_id: String,
    pub workflow_id: String,
    /// Desired delivery rate; may be lower than the source decode rate.
    pub target_fps: u32,
    pub queue_depth: usize,
    pub drop_policy: DropPolicy,
}

/// Point-in-time counters for one edge.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeMetrics {
    pub frames_offered: u64,
    pub frames_forwarded: u64,
    pub frames_dropped_throttle: u64,
    pub frames_dropped_queue: u64,
    pub queue_depth: usize,
}

struct RouteEdge {
    queue: Arc<BoundedQueue<Frame>>,
    offered: AtomicU64,
    forwarded: AtomicU64,
    dropped_throttle: AtomicU64,
    cancel: CancellationToken,
}

impl RouteEdge {
    fn metrics(&self) -> EdgeMetrics {
        EdgeMetrics {
            frames_offered: self.offered.load(Ordering::Relaxed),
            frames_forwarded: self.forwarded.load(Ordering::Relaxed),
            frames_dropped_throttle: self.dropped_throttle.load(Ordering::Relaxed),
            frames_dropped_queue: self.queue.dropped(),
            queue_depth: self.queue.len(),
        }
    }
}

/// Consumer end of a routed edge.
///
/// Dropping the receiver does not cancel the edge; use
/// [`FrameRouter::unsubscribe`] for that.
pub struct FrameReceiver {
    key: EdgeKey,
    queue: Arc<BoundedQueue<Frame>>,
}

impl FrameReceiver {
    /// Awaits the next frame. Returns `None` once the edge is cancelled and
    /// drained.
    pub async fn recv(&self) -> Option<Frame> {
        self.queue.pop().await
    }

    /// Removes the next frame without waiting.
    pub fn try_recv(&self) -> Option<Frame> {
        self.queue.try_pop()
    }

    /// The edge this receiver drains.
    #[must_use]
    pub fn key(&self) -> &EdgeKey {
        &self.key
    }
}

/// Minimum-interval FPS throttle.
///
/// Forwards a frame when at least `1/fps` has elapsed since the last forward
/// (with a small tolerance for timer jitter, so a source at exactly the
/// target rate is not halved).
pub struct FpsThrottle {
    interval_micros: u64,
    last: Option<Instant>,
}

/// Jitter allowance: an arrival this close to the nominal interval counts.
const THROTTLE_TOLERANCE_MICROS: u64 = 1_000;

impl FpsThrottle {
    #[must_use]
    pub fn new(fps: u32) -> Self {
        Self {
            interval_micros: 1_000_000 / u64::from(fps.max(1)),
            last: None,
        }
    }

    /// Whether a frame arriving now should pass.
    pub fn admit(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            None => {
                self.last = Some(now);
                true
            }
            Some(last) => {
                let elapsed = now.duration_since(last).as_micros() as u64;
                if elapsed + THROTTLE_TOLERANCE_MICROS >= self.interval_micros {
                    self.last = Some(now);
                    true
                } else {
                    false
                }
            }
        }
    }
}

/// Routes frames from every source to its subscribed workflows.
pub struct FrameRouter {
    edges: DashMap<EdgeKey, Arc<RouteEdge>>,
    sources: Arc<SourceRegistry>,
    config: RouterConfig,
    /// Spawner for the per-edge forwarder loops.
    spawner: TokioSpawner,
}

impl FrameRouter {
    /// Creates a router over the given source registry.
    #[must_use]
    pub fn new(sources: Arc<SourceRegistry>, config: RouterConfig, spawner: TokioSpawner) -> Self {
        Self {
            edges: DashMap::new(),
            sources,
            config,
            spawner,
        }
    }

    /// Subscribes a workflow to a source.
    ///
    /// Replaces any existing edge for the same (source, workflow) pair.
    ///
    /// # Errors
    ///
    /// `NotFound` when the source is unknown.
    pub fn subscribe(&self, spec: EdgeSpec) -> OverwatchResult<FrameReceiver> {
        let source = self.sources.get(&spec.source_id)?;
        let source_rx = source.subscribe();
        let state_rx = source.state_watch();
        let key = EdgeKey::new(&spec.source_id, &spec.workflow_id);

        // Replace semantics: cancel a previous subscription for this pair.
        self.unsubscribe(&key);

        let queue_depth = if spec.queue_depth == 0 {
            self.config.default_queue_depth
        } else {
            spec.queue_depth
        };
        let target_fps = if spec.target_fps == 0 {
            self.config.default_target_fps
        } else {
            spec.target_fps
        };

        let edge = Arc::new(RouteEdge {
            queue: Arc::new(BoundedQueue::new(queue_depth, spec.drop_policy)),
            offered: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            dropped_throttle: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        });
        self.edges.insert(key.clone(), Arc::clone(&edge));

        let receiver = FrameReceiver {
            key: key.clone(),
            queue: Arc::clone(&edge.queue),
        };

        self.spawner
            .spawn(forward_edge(key, edge, source_rx, state_rx, target_fps));
        Ok(receiver)
    }

    /// Cancels an edge; its queue drains and then yields `None`.
    ///
    /// No frames are delivered after the cancellation completes.
    pub fn unsubscribe(&self, key: &EdgeKey) {
        if let Some((_, edge)) = self.edges.remove(key) {
            edge.cancel.cancel();
            edge.queue.close();
        }
    }

    /// Cancels every edge belonging to a workflow.
    pub fn unsubscribe_workflow(&self, workflow_id: &str) {
        let keys: Vec<EdgeKey> = self
            .edges
            .iter()
            .filter(|e| e.key().workflow_id == workflow_id)
            .map(|e| e.key().clone())
            .collect();
        for key in keys {
            self.unsubscribe(&key);
        }
    }

    /// Metrics for one edge.
    pub fn metrics(&self, key: &EdgeKey) -> OverwatchResult<EdgeMetrics> {
        self.edges
            .get(key)
            .map(|e| e.metrics())
            .ok_or_else(|| {
                OverwatchError::NotFound(format!("edge {}/{}", key.source_id, key.workflow_id))
            })
    }

    /// Number of live edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }
}

/// Per-edge forwarder: throttle, then enqueue with the edge's drop policy.
async fn forward_edge(
    key: EdgeKey,
    edge: Arc<RouteEdge>,
    mut source_rx: tokio::sync::broadcast::Receiver<Frame>,
    mut state_rx: tokio::sync::watch::Receiver<crate::source::SourceState>,
    target_fps: u32,
) {
    let mut throttle = FpsThrottle::new(target_fps);
    log::debug!(
        "[Router] edge {}/{} up at {target_fps}fps",
        key.source_id,
        key.workflow_id
    );

    let offer = |frame: Frame, throttle: &mut FpsThrottle| {
        edge.offered.fetch_add(1, Ordering::Relaxed);
        if !throttle.admit() {
            edge.dropped_throttle.fetch_add(1, Ordering::Relaxed);
            return;
        }
        // Queue drops are counted by the queue itself.
        if edge.queue.push(frame).accepted() {
            edge.forwarded.fetch_add(1, Ordering::Relaxed);
        }
    };

    loop {
        tokio::select! {
            () = edge.cancel.cancelled() => break,
            terminal = source_terminal(&mut state_rx) => {
                if terminal {
                    // Drain frames published before the source wound down.
                    while let Ok(frame) = source_rx.try_recv() {
                        offer(frame, &mut throttle);
                    }
                }
                break;
            }
            received = source_rx.recv() => match received {
                Ok(frame) => offer(frame, &mut throttle),
                Err(RecvError::Lagged(skipped)) => {
                    // The broadcast ring overwrote frames we never saw.
                    edge.offered.fetch_add(skipped, Ordering::Relaxed);
                    log::warn!(
                        "[Router] edge {}/{} lagged by {skipped} frames",
                        key.source_id,
                        key.workflow_id
                    );
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    edge.queue.close();
    log::debug!(
        "[Router] edge {}/{} down",
        key.source_id,
        key.workflow_id
    );
}

/// Resolves once the source reaches a terminal state (`true`) or the source
/// runtime is gone (`false`).
async fn source_terminal(
    state_rx: &mut tokio::sync::watch::Receiver<crate::source::SourceState>,
) -> bool {
    loop {
        if state_rx.borrow().is_terminal() {
            return true;
        }
        if state_rx.changed().await.is_err() {
            return false;
        }
    }
}
