//! Keyed registry of running sources.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

use super::ingest::{run_source, SourceRuntime};
use super::{AudioChunk, Frame, QualityLevel, SourceConfig, SourceState, TransportFactory};
use crate::error::{OverwatchError, OverwatchResult};
use crate::runtime::{TaskSpawner, TokioSpawner};
use crate::state::IngestConfig;

/// Registry owning one ingest task per source.
///
/// All source lifecycle operations go through here; frames are owned
/// exclusively by each source's ring buffer and shared by reference.
pub struct SourceRegistry {
    sources: DashMap<String, Arc<SourceRuntime>>,
    factory: Arc<dyn TransportFactory>,
    ingest: IngestConfig,
    /// Parent token; every source gets a child so shutdown cascades.
    cancel: CancellationToken,
    /// Spawner for the per-source ingest tasks.
    spawner: TokioSpawner,
}

impl SourceRegistry {
    /// Creates a registry using the given transport factory.
    #[must_use]
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        ingest: IngestConfig,
        cancel: CancellationToken,
        spawner: TokioSpawner,
    ) -> Self {
        Self {
            sources: DashMap::new(),
            factory,
            ingest,
            cancel,
            spawner,
        }
    }

    /// Starts a source, or returns the existing handle if already running.
    ///
    /// Idempotent: a second `start` with the same id returns the running
    /// source untouched. A source in a terminal state is restarted.
    pub fn start(&self, config: SourceConfig) -> OverwatchResult<Arc<SourceRuntime>> {
        if let Some(existing) = self.sources.get(&config.id) {
            if !existing.state().is_terminal() {
                return Ok(Arc::clone(existing.value()));
            }
        }

        let runtime = SourceRuntime::new(config, &self.ingest, self.cancel.child_token());
        self.sources
            .insert(runtime.id(), Arc::clone(&runtime));

        let factory = Arc::clone(&self.factory);
        let ingest = self.ingest.clone();
        let task_runtime = Arc::clone(&runtime);
        self.spawner
            .spawn(run_source(task_runtime, factory, ingest));

        Ok(runtime)
    }

    /// Stops a source: cancels decode, waits for teardown, keeps the entry
    /// so `start` can revive it.
    ///
    /// # Errors
    ///
    /// `NotFound` when the id is unknown. A teardown that exceeds the
    /// deadline is logged, not an error; the transport is dropped regardless.
    pub async fn stop(&self, id: &str) -> OverwatchResult<()> {
        let runtime = self.get(id)?;
        runtime.cancel_token().cancel();

        let mut state_rx = runtime.state_watch();
        let wait = async {
            loop {
                if state_rx.borrow().is_terminal() {
                    return;
                }
                if state_rx.changed().await.is_err() {
                    return;
                }
            }
        };
        if timeout(Duration::from_secs(5), wait).await.is_err() {
            log::warn!("[Source] {id} did not stop within deadline");
        }
        Ok(())
    }

    /// Subscribes to a source's frames.
    pub fn subscribe(&self, id: &str) -> OverwatchResult<broadcast::Receiver<Frame>> {
        Ok(self.get(id)?.subscribe())
    }

    /// Subscribes to a source's audio sidechannel.
    pub fn subscribe_audio(&self, id: &str) -> OverwatchResult<broadcast::Receiver<AudioChunk>> {
        Ok(self.get(id)?.subscribe_audio())
    }

    /// Most recent frame from a source, non-blocking.
    pub fn latest(&self, id: &str) -> OverwatchResult<Option<Frame>> {
        Ok(self.get(id)?.latest())
    }

    /// Pre-event window query over a source's ring buffer.
    pub fn buffer(&self, id: &str, duration_ms: u64) -> OverwatchResult<Vec<Frame>> {
        Ok(self.get(id)?.buffer(duration_ms))
    }

    /// Switches a source to a different stream variant.
    pub fn quality(&self, id: &str, level: QualityLevel) -> OverwatchResult<()> {
        self.get(id)?.set_quality(level);
        Ok(())
    }

    /// Current state of a source.
    pub fn state(&self, id: &str) -> OverwatchResult<SourceState> {
        Ok(self.get(id)?.state())
    }

    /// Handle to a running source.
    pub fn get(&self, id: &str) -> OverwatchResult<Arc<SourceRuntime>> {
        self.sources
            .get(id)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| OverwatchError::NotFound(format!("source {id}")))
    }

    /// Ids of all registered sources.
    #[must_use]
    pub fn list(&self) -> Vec<String> {
        self.sources.iter().map(|r| r.key().clone()).collect()
    }

    /// Stops every source and waits briefly for teardown.
    pub async fn shutdown(&self) {
        let ids = self.list();
        for id in ids {
            if let Err(err) = self.stop(&id).await {
                log::warn!("[Source] shutdown of {id} failed: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{SourceKind, SyntheticTransportFactory};

    fn registry() -> SourceRegistry {
        SourceRegistry::new(
            Arc::new(SyntheticTransportFactory),
            IngestConfig::default(),
            CancellationToken::new(),
            TokioSpawner::current(),
        )
    }

    fn config(id: &str) -> SourceConfig {
        SourceConfig {
            id: id.to_string(),
            kind: SourceKind::Synthetic,
            location: "synthetic://?fps=50".to_string(),
            quality: QualityLevel::Med,
            target_fps: 10,
            ring_capacity: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent() {
        let registry = registry();
        let first = registry.start(config("cam")).unwrap();
        let second = registry.start(config("cam")).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        registry.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_reaches_terminal_state() {
        let registry = registry();
        let runtime = registry.start(config("cam")).unwrap();
        let mut rx = runtime.subscribe();
        let _ = rx.recv().await;

        registry.stop("cam").await.unwrap();
        assert!(registry.state("cam").unwrap().is_terminal());
    }

    #[tokio::test]
    async fn unknown_source_is_not_found() {
        let registry = registry();
        assert!(matches!(
            registry.latest("ghost"),
            Err(OverwatchError::NotFound(_))
        ));
    }
}
