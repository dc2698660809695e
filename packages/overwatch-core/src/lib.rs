//! Overwatch Core - multi-camera video analytics runtime.
//!
//! This crate provides the core runtime for Overwatch: live stream
//! ingestion, user-authored detection workflows, and event-to-alarm
//! correlation with full lifecycle management. It is designed to be
//! embedded by the headless server as well as richer hosts.
//!
//! # Architecture
//!
//! The crate is organized into several modules, following the data flow:
//!
//! - [`source`]: Stream ingestion - one decode task per source, ring
//!   buffers, frame broadcast
//! - [`router`]: Frame fan-out to workflows with per-edge throttling and
//!   back-pressure
//! - [`model`]: Inference engine contract and shared, refcounted registry
//! - [`graph`]: Workflow documents, validation, canonical YAML and diffing
//! - [`workflow`]: The per-workflow DAG executor and node behaviors
//! - [`events`]: Runtime event bus with bounded history
//! - [`correlator`]: Event enrichment, dedup windows, confidence scoring
//! - [`alarm`]: The alarm state machine, SLA tracking, and bulk operations
//! - [`persist`]: Versioned workflow, alarm, event, and snapshot storage
//! - [`error`]: Centralized error types
//!
//! # Abstraction Traits
//!
//! Externals plug in behind traits so the core stays testable:
//!
//! - [`TransportFactory`](source::TransportFactory): media transports (RTSP,
//!   file demux, HTTP)
//! - [`DetectionEngine`](model::DetectionEngine) /
//!   [`AudioAnalysisEngine`](model::AudioAnalysisEngine): inference engines
//! - [`Persistence`](persist::Persistence): storage backends
//! - [`EmailTransport`](workflow::EmailTransport): mail delivery
//! - [`EventEmitter`](events::EventEmitter): observability transports

#![allow(missing_docs)]
#![warn(clippy::all)]

pub mod alarm;
pub mod bootstrap;
pub mod correlator;
pub mod error;
pub mod events;
pub mod graph;
pub mod model;
pub mod persist;
pub mod queue;
pub mod router;
pub mod runtime;
pub mod source;
pub mod state;
pub mod status;
pub mod utils;
pub mod workflow;

// Re-export commonly used types at the crate root
pub use alarm::{Alarm, AlarmManager, AlarmQuery, AlarmState, BulkOutcome, ExportFormat, Severity};
pub use bootstrap::{
    bootstrap_services, bootstrap_services_with, BootstrapOptions, BootstrappedServices,
};
pub use correlator::{Correlator, DeviceInfo, DeviceRegistry, EventDraft, RawEvent};
pub use error::{ErrorCode, OverwatchError, OverwatchResult};
pub use events::{EventBus, EventEmitter, EventScope, RuntimeEvent};
pub use graph::{validate, WorkflowDoc, WorkflowStatus};
pub use model::{DetectConfig, Detection, DetectionEngine, ModelRegistry};
pub use persist::{JsonPersistence, MemoryPersistence, Persistence};
pub use queue::DropPolicy;
pub use router::{EdgeMetrics, EdgeSpec, FrameRouter};
pub use runtime::{TaskSpawner, TokioSpawner};
pub use source::{Frame, SourceConfig, SourceKind, SourceRegistry, SourceState};
pub use state::Config;
pub use status::StatusApi;
pub use utils::now_millis;
pub use workflow::{WorkflowEngine, WorkflowStatusReport};
