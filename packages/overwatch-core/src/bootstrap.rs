//! Application bootstrap and dependency wiring.
//!
//! This module contains the composition root - the single place where all
//! services are instantiated and wired together. This pattern provides:
//!
//! - **Clarity**: All dependency relationships are visible in one place
//! - **Testability**: Easy to swap implementations for testing
//! - **Maintainability**: Service creation logic is isolated from usage

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio_util::sync::CancellationToken;

use crate::alarm::AlarmManager;
use crate::correlator::{Correlator, DeviceRegistry};
use crate::error::{OverwatchError, OverwatchResult};
use crate::events::{BusEmitter, EventBus, EventEmitter};
use crate::model::ModelRegistry;
use crate::persist::{MemoryPersistence, Persistence};
use crate::router::FrameRouter;
use crate::runtime::TokioSpawner;
use crate::source::{SourceRegistry, SyntheticTransportFactory, TransportFactory};
use crate::state::Config;
use crate::status::StatusApi;
use crate::workflow::{
    ActionRunner, EmailTransport, LoggingEmailTransport, SchedulerShared, WorkflowEngine,
};

/// HTTP client timeout for outbound action delivery.
const HTTP_TIMEOUT_SECS: u64 = 60;

/// Swappable externals for bootstrap.
///
/// Defaults suit tests and demo deployments; production wires real
/// transports, persistence, and mail delivery here.
pub struct BootstrapOptions {
    pub transport_factory: Arc<dyn TransportFactory>,
    pub persistence: Arc<dyn Persistence>,
    pub email: Arc<dyn EmailTransport>,
}

impl Default for BootstrapOptions {
    fn default() -> Self {
        Self {
            transport_factory: Arc::new(SyntheticTransportFactory),
            persistence: Arc::new(MemoryPersistence::new()),
            email: Arc::new(LoggingEmailTransport),
        }
    }
}

/// Container for all bootstrapped services.
#[derive(Clone)]
pub struct BootstrappedServices {
    /// Stream ingestion registry.
    pub sources: Arc<SourceRegistry>,
    /// Frame fan-out to workflows.
    pub router: Arc<FrameRouter>,
    /// Shared inference engines.
    pub models: Arc<ModelRegistry>,
    /// Workflow lifecycle and execution.
    pub engine: Arc<WorkflowEngine>,
    /// Observability pub/sub.
    pub bus: Arc<EventBus>,
    /// Event -> alarm correlation.
    pub correlator: Arc<Correlator>,
    /// Alarm lifecycle management.
    pub alarms: Arc<AlarmManager>,
    /// Device enrichment registry.
    pub devices: Arc<DeviceRegistry>,
    /// Storage backend.
    pub persistence: Arc<dyn Persistence>,
    /// Node type / model status surface.
    pub status: Arc<StatusApi>,
    /// Shared HTTP client for connection pooling.
    http_client: Client,
    /// Task spawner for background operations.
    pub spawner: TokioSpawner,
    /// Cancellation token for graceful shutdown.
    pub cancel_token: CancellationToken,
}

impl BootstrappedServices {
    /// Returns the shared HTTP client.
    pub fn http_client(&self) -> &Client {
        &self.http_client
    }

    /// Starts background monitors (SLA deadlines).
    pub fn start_background_tasks(&self) {
        self.alarms.start_sla_monitor();
    }

    /// Initiates graceful shutdown of all services.
    pub async fn shutdown(&self) {
        log::info!("[Bootstrap] Beginning graceful shutdown...");

        // Stop workflows first so node workers release sources and models.
        self.engine.stop_all().await;

        // Signal cancellation to all remaining background tasks.
        self.cancel_token.cancel();

        self.sources.shutdown().await;

        if let Err(err) = self.persistence.flush().await {
            log::warn!("[Bootstrap] persistence flush failed: {err}");
        }

        log::info!("[Bootstrap] Shutdown complete");
    }
}

/// Creates the shared HTTP client for action delivery.
///
/// Using a shared client enables connection pooling; it is created once
/// during bootstrap and injected into the services that need it.
fn create_http_client() -> OverwatchResult<Client> {
    Client::builder()
        .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
        .build()
        .map_err(|e| OverwatchError::Internal(format!("failed to create HTTP client: {e}")))
}

/// Bootstraps all services with default externals.
pub fn bootstrap_services(config: &Config) -> OverwatchResult<BootstrappedServices> {
    bootstrap_services_with(config, BootstrapOptions::default())
}

/// Bootstraps all application services with their dependencies.
///
/// This is the composition root. Wiring order matters - services are
/// created in dependency order:
///
/// 1. Shared infrastructure (HTTP client, event bus, cancellation token)
/// 2. Sources and the frame router
/// 3. Model registry and device registry
/// 4. Alarm manager (needs persistence + emitter)
/// 5. Correlator (needs devices + alarms)
/// 6. Action runner and the workflow engine
///
/// # Errors
///
/// Returns an error when the configuration is invalid or infrastructure
/// fails to initialize.
pub fn bootstrap_services_with(
    config: &Config,
    options: BootstrapOptions,
) -> OverwatchResult<BootstrappedServices> {
    config
        .validate()
        .map_err(|msg| OverwatchError::Config(vec![msg]))?;

    let spawner = TokioSpawner::current();
    let http_client = create_http_client()?;
    let cancel_token = CancellationToken::new();

    let bus = Arc::new(EventBus::new(config.event_bus.clone()));
    let emitter: Arc<dyn EventEmitter> = Arc::new(BusEmitter::new(Arc::clone(&bus)));

    let sources = Arc::new(SourceRegistry::new(
        Arc::clone(&options.transport_factory),
        config.ingest.clone(),
        cancel_token.child_token(),
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
        Arc::clone(&options.persistence),
        Arc::clone(&emitter),
        cancel_token.child_token(),
        spawner.clone(),
    )?;

    let correlator = Arc::new(Correlator::new(
        config.correlation.clone(),
        Arc::clone(&devices),
        Arc::clone(&alarms),
        Arc::clone(&options.persistence),
    ));

    let actions = Arc::new(ActionRunner::new(
        http_client.clone(),
        Arc::clone(&sources),
        Arc::clone(&options.persistence),
        Arc::clone(&correlator),
        Arc::clone(&options.email),
        config.workflow.clone(),
    ));

    let scheduler_shared = Arc::new(SchedulerShared {
        sources: Arc::clone(&sources),
        router: Arc::clone(&router),
        models: Arc::clone(&models),
        actions,
        emitter,
        links: Arc::new(crate::workflow::nodes::LinkRegistry::new()),
        config: Arc::new(config.clone()),
        cancel: cancel_token.child_token(),
        spawner: spawner.clone(),
    });

    let engine = Arc::new(WorkflowEngine::new(
        scheduler_shared,
        Arc::clone(&options.persistence),
    ));

    let status = Arc::new(StatusApi::new(Arc::clone(&models)));

    Ok(BootstrappedServices {
        sources,
        router,
        models,
        engine,
        bus,
        correlator,
        alarms,
        devices,
        persistence: options.persistence,
        status,
        http_client,
        spawner,
        cancel_token,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bootstrap_wires_default_services() {
        let services = bootstrap_services(&Config::default()).unwrap();
        assert_eq!(services.models.loaded_count(), 0);
        assert_eq!(services.alarms.count(), 0);
        assert!(services.engine.running_ids().is_empty());
        services.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let mut config = Config::default();
        config.ingest.ring_capacity = 0;
        assert!(matches!(
            bootstrap_services(&config),
            Err(OverwatchError::Config(_))
        ));
    }
}
