//! Workflow instantiation and teardown.
//!
//! The scheduler turns a validated document into a set of long-lived node
//! workers wired by bounded queues. Config nodes are folded into their sinks
//! here, before anything runs; teardown cancels cooperatively and waits out
//! a bounded deadline.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

use super::nodes::{
    run_node, NodeCtx, NodeMsg, NodeRuntime, NodeState, WorkflowShared,
};
use super::SchedulerShared;
use crate::error::{OverwatchError, OverwatchResult};
use crate::events::RuntimeEvent;
use crate::graph::{EdgeKind, NodeDoc, NodeKind, WorkflowDoc, WorkflowStatus};
use crate::queue::{BoundedQueue, DropPolicy};
use crate::router::EdgeSpec;
use crate::runtime::TaskSpawner;
use crate::source::{QualityLevel, SourceConfig, SourceKind};
use crate::utils::{deep_merge, now_millis};

/// Cadence of per-node metrics events.
const METRICS_INTERVAL_SECS: u64 = 10;

/// A running workflow instance.
///
/// Holds an immutable snapshot of the deployed document; editing produces a
/// new version which replaces this instance wholesale.
pub struct WorkflowRuntime {
    pub doc: Arc<WorkflowDoc>,
    pub shared: Arc<WorkflowShared>,
    nodes: HashMap<String, Arc<NodeRuntime>>,
    queues: HashMap<String, Arc<BoundedQueue<NodeMsg>>>,
    /// linkIn anchors registered by this instance, for teardown.
    anchors: Vec<(String, Arc<BoundedQueue<NodeMsg>>)>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkflowRuntime {
    /// Current lifecycle status.
    #[must_use]
    pub fn status(&self) -> WorkflowStatus {
        *self.shared.status.read()
    }

    /// Per-node counter snapshots.
    #[must_use]
    pub fn node_metrics(&self) -> serde_json::Map<String, serde_json::Value> {
        self.nodes
            .iter()
            .map(|(id, runtime)| (id.clone(), runtime.metrics()))
            .collect()
    }

    /// Stops the instance: cancels workers, drains queues, releases router
    /// subscriptions and link anchors. Guaranteed teardown on all paths.
    pub async fn stop(&self, services: &SchedulerShared) {
        self.shared.cancel.cancel();

        for queue in self.queues.values() {
            queue.close();
        }
        services.router.unsubscribe_workflow(&self.shared.workflow_id);
        for (name, queue) in &self.anchors {
            services.links.unregister_in(name, queue);
        }

        let deadline = Duration::from_secs(services.config.workflow.teardown_deadline_secs);
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for mut task in tasks {
            match timeout(deadline, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) if join_err.is_panic() => {
                    log::error!(
                        "[Workflow] {} node worker panicked during teardown",
                        self.shared.workflow_id
                    );
                }
                Ok(Err(_cancelled)) => {}
                Err(_elapsed) => {
                    log::warn!(
                        "[Workflow] {} node worker exceeded teardown deadline, aborting",
                        self.shared.workflow_id
                    );
                    task.abort();
                }
            }
        }

        *self.shared.status.write() = WorkflowStatus::Stopped;
        for runtime in self.nodes.values() {
            if *runtime.state.read() == NodeState::Running {
                *runtime.state.write() = NodeState::Stopped;
            }
        }
    }
}

/// Instantiates and starts a validated workflow document.
pub(super) fn start_workflow(
    doc: Arc<WorkflowDoc>,
    services: &Arc<SchedulerShared>,
) -> OverwatchResult<Arc<WorkflowRuntime>> {
    let workflow_config = &services.config.workflow;
    let (error_tx, _) = tokio::sync::broadcast::channel(64);

    let shared = Arc::new(WorkflowShared {
        workflow_id: doc.id.clone(),
        status: parking_lot::RwLock::new(WorkflowStatus::Running),
        last_error: Mutex::new(None),
        recent_errors: Mutex::new(std::collections::VecDeque::new()),
        cancel: services.cancel.child_token(),
        error_tx,
        fail_fast: workflow_config.fail_fast,
    });

    // Fold config nodes into their sinks, in edge order (later wins).
    let merged_configs = merge_configs(&doc);

    // One bounded input queue per runnable node. Frame-fed nodes prefer
    // freshness; event paths prefer integrity.
    let mut queues: HashMap<String, Arc<BoundedQueue<NodeMsg>>> = HashMap::new();
    for node in runnable_nodes(&doc) {
        let video_fed = doc
            .incoming(&node.id)
            .any(|e| e.data.kind == EdgeKind::Video);
        let policy = if video_fed {
            DropPolicy::DropOldest
        } else {
            DropPolicy::DropNew
        };
        queues.insert(
            node.id.clone(),
            Arc::new(BoundedQueue::new(workflow_config.node_queue_depth, policy)),
        );
    }

    // Register linkIn anchors before any worker starts.
    let mut anchors = Vec::new();
    for node in runnable_nodes(&doc) {
        if node.kind == NodeKind::LinkIn {
            if let Some(name) = merged_configs
                .get(&node.id)
                .and_then(|c| c.get("name"))
                .and_then(|v| v.as_str())
            {
                let queue = Arc::clone(&queues[&node.id]);
                services.links.register_in(name, Arc::clone(&queue));
                anchors.push((name.to_string(), queue));
            }
        }
    }

    let mut nodes = HashMap::new();
    let mut tasks = Vec::new();

    for node in runnable_nodes(&doc) {
        let runtime = NodeRuntime::new(&node.id, node.kind, workflow_config);
        nodes.insert(node.id.clone(), Arc::clone(&runtime));

        let config = merged_configs
            .get(&node.id)
            .cloned()
            .unwrap_or(serde_json::Value::Null);

        let outputs: Vec<Arc<BoundedQueue<NodeMsg>>> = doc
            .outgoing(&node.id)
            .filter(|e| e.target_handle != "config")
            .filter_map(|e| queues.get(&e.target).map(Arc::clone))
            .collect();

        let effective_fps = effective_fps(&doc, &node.id, &merged_configs)
            .unwrap_or(services.config.router.default_target_fps);

        let mut ctx = NodeCtx {
            config,
            input: Arc::clone(&queues[&node.id]),
            outputs,
            runtime,
            workflow: Arc::clone(&shared),
            services: Arc::clone(services),
            frames: None,
            audio: None,
            effective_fps,
        };

        if node.kind.is_input() {
            match subscribe_input(&doc.id, node, &ctx, services) {
                Ok(receiver) => ctx.frames = Some(receiver),
                Err(err) => {
                    log::error!(
                        "[Workflow] {}/{} source subscription failed: {err}",
                        doc.id,
                        node.id
                    );
                    // The worker reports the missing subscription as a node
                    // error; the rest of the graph still runs.
                }
            }
        }
        if node.kind == NodeKind::AudioExtractor {
            match audio_source_for(&doc, &node.id, &merged_configs, services) {
                Ok(receiver) => ctx.audio = Some(receiver),
                Err(err) => {
                    log::error!(
                        "[Workflow] {}/{} audio subscription failed: {err}",
                        doc.id,
                        node.id
                    );
                }
            }
        }

        let kind = node.kind;
        // Worker handles are join-tracked so stop() can enforce the
        // teardown deadline; they bypass the fire-and-forget spawner.
        tasks.push(tokio::spawn(async move {
            run_node(kind, ctx).await;
        }));
    }

    // Periodic metrics for every node until the workflow stops.
    {
        let shared = Arc::clone(&shared);
        let emitter = Arc::clone(&services.emitter);
        let node_runtimes: Vec<Arc<NodeRuntime>> = nodes.values().cloned().collect();
        services.spawner.spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(METRICS_INTERVAL_SECS));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = shared.cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        for runtime in &node_runtimes {
                            emitter.emit(RuntimeEvent::MetricsUpdate {
                                workflow_id: shared.workflow_id.clone(),
                                node_id: runtime.node_id.clone(),
                                metrics: runtime.metrics(),
                                timestamp: now_millis(),
                            });
                        }
                    }
                }
            }
        });
    }

    log::info!(
        "[Workflow] {} v{} started ({} nodes)",
        doc.id,
        doc.version,
        nodes.len()
    );

    Ok(Arc::new(WorkflowRuntime {
        doc,
        shared,
        nodes,
        queues,
        anchors,
        tasks: Mutex::new(tasks),
    }))
}

/// Nodes that get a worker (config nodes are compile-time only).
fn runnable_nodes(doc: &WorkflowDoc) -> impl Iterator<Item = &NodeDoc> {
    doc.nodes.iter().filter(|n| n.kind != NodeKind::Config)
}

/// Applies config-node attachments: deep-merge into the sink's config, in
/// document edge order, the config node's payload taking precedence.
fn merge_configs(doc: &WorkflowDoc) -> HashMap<String, serde_json::Value> {
    let mut merged: HashMap<String, serde_json::Value> = doc
        .nodes
        .iter()
        .map(|n| (n.id.clone(), n.config_value()))
        .collect();

    for edge in &doc.edges {
        if edge.target_handle != "config" {
            continue;
        }
        let Some(source) = doc.node(&edge.source) else {
            continue;
        };
        if source.kind != NodeKind::Config {
            continue;
        }
        if let Some(sink_config) = merged.get_mut(&edge.target) {
            deep_merge(sink_config, &source.config_value());
        }
    }
    merged
}

/// The FPS a node inherits from its upstream input node, when it does not
/// declare its own.
fn effective_fps(
    doc: &WorkflowDoc,
    node_id: &str,
    configs: &HashMap<String, serde_json::Value>,
) -> Option<u32> {
    let mut current = node_id.to_string();
    // Walk upstream along the primary input until an input node is found.
    for _ in 0..doc.nodes.len() {
        let node = doc.node(&current)?;
        if node.kind.is_input() {
            return configs
                .get(&current)?
                .get("fps")
                .and_then(serde_json::Value::as_u64)
                .map(|v| v as u32);
        }
        let upstream = doc
            .incoming(&current)
            .find(|e| e.target_handle != "config")?;
        current = upstream.source.clone();
    }
    None
}

/// Resolves and subscribes an input node's source through the router.
fn subscribe_input(
    workflow_id: &str,
    node: &NodeDoc,
    ctx: &NodeCtx,
    services: &SchedulerShared,
) -> OverwatchResult<crate::router::FrameReceiver> {
    let source_id = match node.kind {
        NodeKind::Camera => ctx
            .config_str("cameraId")
            .map(str::to_string)
            .ok_or_else(|| OverwatchError::Config(vec!["camera missing cameraId".into()]))?,
        // File/URL inputs own a dedicated source started on demand.
        NodeKind::VideoInput | NodeKind::Youtube => {
            let url = ctx
                .config_str("url")
                .map(str::to_string)
                .ok_or_else(|| OverwatchError::Config(vec!["input missing url".into()]))?;
            let source_id = format!("wf:{workflow_id}:{}", node.id);
            let kind = if url.starts_with("synthetic://") {
                SourceKind::Synthetic
            } else if node.kind == NodeKind::Youtube || url.starts_with("http") {
                SourceKind::Url
            } else {
                SourceKind::File
            };
            services.sources.start(SourceConfig {
                id: source_id.clone(),
                kind,
                location: url,
                quality: quality_from(ctx),
                target_fps: ctx.config_u64("fps").map_or(
                    services.config.router.default_target_fps,
                    |v| v as u32,
                ),
                ring_capacity: None,
            })?;
            source_id
        }
        _ => unreachable!("subscribe_input is only called for input nodes"),
    };

    services.router.subscribe(EdgeSpec {
        source_id,
        workflow_id: workflow_id.to_string(),
        target_fps: ctx.config_u64("fps").map_or(0, |v| v as u32),
        queue_depth: 0,
        drop_policy: services.config.router.default_drop_policy,
    })
}

fn quality_from(ctx: &NodeCtx) -> QualityLevel {
    match ctx.config_str("quality") {
        Some("low") => QualityLevel::Low,
        Some("high") => QualityLevel::High,
        _ => QualityLevel::Med,
    }
}

/// Finds the source feeding a node's upstream input and subscribes to its
/// audio sidechannel.
fn audio_source_for(
    doc: &WorkflowDoc,
    node_id: &str,
    configs: &HashMap<String, serde_json::Value>,
    services: &SchedulerShared,
) -> OverwatchResult<tokio::sync::broadcast::Receiver<crate::source::AudioChunk>> {
    let mut current = node_id.to_string();
    for _ in 0..doc.nodes.len() {
        let Some(node) = doc.node(&current) else {
            break;
        };
        if node.kind.is_input() {
            let source_id = match node.kind {
                NodeKind::Camera => configs
                    .get(&current)
                    .and_then(|c| c.get("cameraId"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                _ => Some(format!("wf:{}:{current}", doc.id)),
            };
            let source_id = source_id.ok_or_else(|| {
                OverwatchError::Config(vec!["audio upstream has no source".into()])
            })?;
            return services.sources.subscribe_audio(&source_id);
        }
        match doc.incoming(&current).find(|e| e.target_handle != "config") {
            Some(edge) => current = edge.source.clone(),
            None => break,
        }
    }
    Err(OverwatchError::Config(vec![format!(
        "audio extractor {node_id} has no upstream input node"
    )]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(nodes: serde_json::Value, edges: serde_json::Value) -> WorkflowDoc {
        serde_json::from_value(json!({
            "id": "wf", "name": "t", "version": 1, "schemaVersion": 2,
            "nodes": nodes, "edges": edges
        }))
        .unwrap()
    }

    #[test]
    fn config_nodes_merge_in_edge_order_later_wins() {
        let doc = doc(
            json!([
                {"id": "det", "type": "model",
                 "data": {"config": {"modelId": "yolo", "confidence": 0.5, "classes": [0]}}},
                {"id": "c1", "type": "config", "data": {"config": {"confidence": 0.7}}},
                {"id": "c2", "type": "config", "data": {"config": {"confidence": 0.9, "iou": 0.3}}},
            ]),
            json!([
                {"id": "e1", "source": "c1", "target": "det",
                 "sourceHandle": "out", "targetHandle": "config", "data": {"type": "config"}},
                {"id": "e2", "source": "c2", "target": "det",
                 "sourceHandle": "out", "targetHandle": "config", "data": {"type": "config"}},
            ]),
        );
        let merged = merge_configs(&doc);
        let det = &merged["det"];
        assert_eq!(det["confidence"], json!(0.9), "later config edge wins");
        assert_eq!(det["iou"], json!(0.3));
        assert_eq!(det["modelId"], json!("yolo"), "sink keys survive");
    }

    #[test]
    fn effective_fps_inherits_from_input_node() {
        let doc = doc(
            json!([
                {"id": "cam", "type": "camera", "data": {"config": {"cameraId": "c", "fps": 12}}},
                {"id": "det", "type": "model",
                 "data": {"config": {"modelId": "m", "confidence": 0.4, "classes": [0]}}},
            ]),
            json!([
                {"id": "e1", "source": "cam", "target": "det",
                 "sourceHandle": "out", "targetHandle": "input", "data": {"type": "video"}},
            ]),
        );
        let configs = merge_configs(&doc);
        assert_eq!(effective_fps(&doc, "det", &configs), Some(12));
        assert_eq!(effective_fps(&doc, "cam", &configs), Some(12));
    }
}
