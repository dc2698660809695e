//! Workflow engine: per-workflow DAG execution with full lifecycle.
//!
//! Deploy validates, persists a version, replaces any running instance of
//! the same workflow, and starts the new one. A running workflow is an
//! immutable snapshot; editing produces a new version.

pub mod actions;
pub mod nodes;
mod scheduler;

pub use actions::{ActionError, ActionRunner, ActionSpec, EmailTransport, LoggingEmailTransport};
pub use nodes::{
    DetectionBatch, GraphEvent, NodeErrorRecord, NodeMsg, NodePayload, NodeState, WorkflowShared,
};
pub use scheduler::WorkflowRuntime;

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::{OverwatchError, OverwatchResult};
use crate::events::{EventEmitter, RuntimeEvent, WorkflowPhase};
use crate::graph::{self, WorkflowDoc, WorkflowStatus};
use crate::model::ModelRegistry;
use crate::persist::Persistence;
use crate::router::FrameRouter;
use crate::runtime::TokioSpawner;
use crate::source::SourceRegistry;
use crate::state::Config;
use crate::utils::now_millis;

use nodes::LinkRegistry;

/// Service handles shared by every workflow's node workers.
pub struct SchedulerShared {
    pub sources: Arc<SourceRegistry>,
    pub router: Arc<FrameRouter>,
    pub models: Arc<ModelRegistry>,
    pub actions: Arc<ActionRunner>,
    pub emitter: Arc<dyn EventEmitter>,
    pub links: Arc<LinkRegistry>,
    pub config: Arc<Config>,
    /// Root token; each workflow gets a child for cascading shutdown.
    pub cancel: CancellationToken,
    /// Spawner for fire-and-forget background loops (metrics, monitors).
    pub spawner: TokioSpawner,
}

/// Point-in-time status of one workflow.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStatusReport {
    pub id: String,
    pub version: u32,
    pub status: WorkflowStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Most recent node errors, newest last (at most 20).
    pub node_errors: Vec<NodeErrorRecord>,
    /// Per-node counters.
    pub nodes: serde_json::Map<String, serde_json::Value>,
}

/// Owns all running workflow instances.
pub struct WorkflowEngine {
    services: Arc<SchedulerShared>,
    persistence: Arc<dyn Persistence>,
    running: DashMap<String, Arc<WorkflowRuntime>>,
}

impl WorkflowEngine {
    #[must_use]
    pub fn new(services: Arc<SchedulerShared>, persistence: Arc<dyn Persistence>) -> Self {
        Self {
            services,
            persistence,
            running: DashMap::new(),
        }
    }

    /// Validates a document against the deployed world without touching it.
    #[must_use]
    pub fn validate(&self, doc: &WorkflowDoc) -> graph::ValidationReport {
        graph::validate(doc, &self.external_link_names(&doc.id))
    }

    /// Diff between the stored version of a workflow and a candidate
    /// document, for review before deploy. `None` when nothing is stored.
    pub fn diff_pending(&self, doc: &WorkflowDoc) -> OverwatchResult<Option<graph::WorkflowDiff>> {
        Ok(self
            .persistence
            .load_workflow(&doc.id, None)?
            .map(|previous| graph::diff(&previous, doc)))
    }

    /// Deploys a workflow: validate, persist the version, replace any
    /// running instance, start.
    ///
    /// # Errors
    ///
    /// `Config` with the accumulated validation messages; the workflow is
    /// not started and nothing is persisted.
    pub async fn deploy(&self, doc: WorkflowDoc) -> OverwatchResult<()> {
        let report = self.validate(&doc);
        if !report.is_valid() {
            return Err(OverwatchError::Config(report.error_messages()));
        }

        self.persistence.save_workflow(&doc)?;
        self.emit_lifecycle(&doc.id, WorkflowPhase::Deployed, WorkflowStatus::Draft);

        if let Some((_, previous)) = self.running.remove(&doc.id) {
            log::info!("[Workflow] {} replacing running v{}", doc.id, previous.doc.version);
            previous.stop(&self.services).await;
        }

        self.start_doc(Arc::new(doc))
    }

    /// Starts the latest stored version of a workflow.
    pub async fn start(&self, id: &str) -> OverwatchResult<()> {
        if self.running.contains_key(id) {
            return Ok(());
        }
        let doc = self
            .persistence
            .load_workflow(id, None)?
            .ok_or_else(|| OverwatchError::NotFound(format!("workflow {id}")))?;
        self.start_doc(Arc::new(doc))
    }

    /// Stops a running workflow, cascading cancellation to all node workers.
    pub async fn stop(&self, id: &str) -> OverwatchResult<()> {
        let Some((_, runtime)) = self.running.remove(id) else {
            return Err(OverwatchError::NotFound(format!("running workflow {id}")));
        };
        runtime.stop(&self.services).await;
        self.emit_lifecycle(id, WorkflowPhase::Stopped, WorkflowStatus::Stopped);
        log::info!("[Workflow] {id} stopped");
        Ok(())
    }

    /// Stop followed by start of the same stored version.
    pub async fn restart(&self, id: &str) -> OverwatchResult<()> {
        self.stop(id).await?;
        self.start(id).await
    }

    /// Status report for a workflow (running or stored).
    pub fn status(&self, id: &str) -> OverwatchResult<WorkflowStatusReport> {
        if let Some(runtime) = self.running.get(id) {
            let status = runtime.status();
            return Ok(WorkflowStatusReport {
                id: id.to_string(),
                version: runtime.doc.version,
                status,
                last_error: runtime.shared.last_error.lock().clone(),
                node_errors: runtime.shared.recent_errors.lock().iter().cloned().collect(),
                nodes: runtime.node_metrics(),
            });
        }
        let doc = self
            .persistence
            .load_workflow(id, None)?
            .ok_or_else(|| OverwatchError::NotFound(format!("workflow {id}")))?;
        Ok(WorkflowStatusReport {
            id: id.to_string(),
            version: doc.version,
            status: WorkflowStatus::Stopped,
            last_error: None,
            node_errors: Vec::new(),
            nodes: serde_json::Map::new(),
        })
    }

    /// Canonical YAML export of the running (or latest stored) version.
    pub fn export_yaml(&self, id: &str) -> OverwatchResult<String> {
        if let Some(runtime) = self.running.get(id) {
            return graph::to_canonical_yaml(&runtime.doc);
        }
        let doc = self
            .persistence
            .load_workflow(id, None)?
            .ok_or_else(|| OverwatchError::NotFound(format!("workflow {id}")))?;
        graph::to_canonical_yaml(&doc)
    }

    /// Ids of all running workflows.
    #[must_use]
    pub fn running_ids(&self) -> Vec<String> {
        self.running.iter().map(|r| r.key().clone()).collect()
    }

    /// Stops everything; used during shutdown.
    pub async fn stop_all(&self) {
        let ids = self.running_ids();
        for id in ids {
            if let Err(err) = self.stop(&id).await {
                log::warn!("[Workflow] shutdown stop of {id} failed: {err}");
            }
        }
    }

    fn start_doc(&self, doc: Arc<WorkflowDoc>) -> OverwatchResult<()> {
        let id = doc.id.clone();
        let runtime = scheduler::start_workflow(doc, &self.services)?;
        self.running.insert(id.clone(), runtime);
        self.emit_lifecycle(&id, WorkflowPhase::Started, WorkflowStatus::Running);
        Ok(())
    }

    /// linkIn names visible from other deployed workflows.
    fn external_link_names(&self, excluding: &str) -> HashSet<String> {
        self.running
            .iter()
            .filter(|r| r.key() != excluding)
            .flat_map(|r| r.doc.link_in_names())
            .collect()
    }

    fn emit_lifecycle(&self, id: &str, phase: WorkflowPhase, status: WorkflowStatus) {
        self.services.emitter.emit(RuntimeEvent::WorkflowLifecycle {
            workflow_id: id.to_string(),
            phase,
            status,
            timestamp: now_millis(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::AlarmManager;
    use crate::correlator::{Correlator, DeviceRegistry};
    use crate::events::{EventBus, EventScope};
    use crate::persist::MemoryPersistence;
    use crate::source::SyntheticTransportFactory;
    use crate::workflow::actions::LoggingEmailTransport;
    use serde_json::json;

    /// Full service wiring over the in-memory store and synthetic sources.
    fn engine() -> (WorkflowEngine, Arc<EventBus>, Arc<AlarmManager>) {
        let config = Arc::new(Config::default());
        let cancel = CancellationToken::new();
        let spawner = TokioSpawner::current();
        let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new());
        let bus = Arc::new(EventBus::new(config.event_bus.clone()));
        let emitter: Arc<dyn EventEmitter> =
            Arc::new(crate::events::BusEmitter::new(Arc::clone(&bus)));

        let sources = Arc::new(SourceRegistry::new(
            Arc::new(SyntheticTransportFactory),
            config.ingest.clone(),
            cancel.child_token(),
            spawner.clone(),
        ));
        let router = Arc::new(FrameRouter::new(
            Arc::clone(&sources),
            config.router.clone(),
            spawner.clone(),
        ));
        let models = Arc::new(ModelRegistry::new());
        let devices = Arc::new(DeviceRegistry::new());
        let alarms = AlarmManager::new(
            config.sla,
            config.correlation.clone(),
            Arc::clone(&persistence),
            Arc::clone(&emitter),
            cancel.child_token(),
            spawner.clone(),
        )
        .unwrap();
        let correlator = Arc::new(Correlator::new(
            config.correlation.clone(),
            devices,
            Arc::clone(&alarms),
            Arc::clone(&persistence),
        ));
        let actions = Arc::new(ActionRunner::new(
            reqwest::Client::new(),
            Arc::clone(&sources),
            Arc::clone(&persistence),
            correlator,
            Arc::new(LoggingEmailTransport),
            config.workflow.clone(),
        ));

        let services = Arc::new(SchedulerShared {
            sources,
            router,
            models,
            actions,
            emitter,
            links: Arc::new(LinkRegistry::new()),
            config,
            cancel,
            spawner,
        });
        (
            WorkflowEngine::new(services, persistence),
            bus,
            alarms,
        )
    }

    fn simple_doc(version: u32) -> WorkflowDoc {
        serde_json::from_value(json!({
            "id": "wf-input", "name": "input only", "version": version, "schemaVersion": 2,
            "nodes": [
                {"id": "in", "type": "videoInput",
                 "data": {"config": {"url": "synthetic://?fps=30", "fps": 10}}},
                {"id": "dbg", "type": "debug", "data": {}}
            ],
            "edges": [
                {"id": "e1", "source": "in", "target": "dbg",
                 "sourceHandle": "out", "targetHandle": "input", "data": {"type": "video"}}
            ]
        }))
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn deploy_start_stop_lifecycle() {
        let (engine, bus, _) = engine();
        let sub = bus.subscribe(EventScope::workflow("wf-input"));

        engine.deploy(simple_doc(1)).await.unwrap();
        assert_eq!(engine.running_ids(), vec!["wf-input".to_string()]);
        assert_eq!(
            engine.status("wf-input").unwrap().status,
            WorkflowStatus::Running
        );

        // Let a few frames flow; the debug sink forwards them to the bus.
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;

        engine.stop("wf-input").await.unwrap();
        assert!(engine.running_ids().is_empty());
        assert_eq!(
            engine.status("wf-input").unwrap().status,
            WorkflowStatus::Stopped
        );

        let mut saw_started = false;
        let mut saw_detection = false;
        while let Some(event) = sub.try_recv() {
            match event {
                RuntimeEvent::WorkflowLifecycle { phase: WorkflowPhase::Started, .. } => {
                    saw_started = true;
                }
                RuntimeEvent::Detection { .. } => saw_detection = true,
                _ => {}
            }
        }
        assert!(saw_started);
        assert!(saw_detection, "debug sink forwards frames to the bus");
    }

    #[tokio::test]
    async fn invalid_workflow_is_rejected_and_not_persisted() {
        let (engine, _, _) = engine();
        let mut doc = simple_doc(1);
        doc.edges[0].target = "ghost".into();

        let err = engine.deploy(doc).await.unwrap_err();
        assert!(matches!(err, OverwatchError::Config(_)));
        assert!(matches!(
            engine.status("wf-input"),
            Err(OverwatchError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn redeploy_replaces_running_instance() {
        let (engine, _, _) = engine();
        engine.deploy(simple_doc(1)).await.unwrap();
        engine.deploy(simple_doc(2)).await.unwrap();

        assert_eq!(engine.running_ids().len(), 1);
        let status = engine.status("wf-input").unwrap();
        assert_eq!(status.version, 2);

        let diff = engine.diff_pending(&simple_doc(2)).unwrap().unwrap();
        assert!(diff.is_empty(), "same graph at a new version has no diff");
        engine.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn export_round_trips_through_yaml() {
        let (engine, _, _) = engine();
        engine.deploy(simple_doc(1)).await.unwrap();

        let yaml = engine.export_yaml("wf-input").unwrap();
        let reimported = graph::workflow_from_yaml(&yaml).unwrap();
        let diff = graph::diff(&simple_doc(1), &reimported);
        assert!(diff.is_empty(), "{diff:?}");
        engine.stop_all().await;
    }
}
