//! Shared, reference-counted inference engine registry.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};

use super::{
    AudioAnalysisEngine, ComponentStatus, DetectConfig, Detection, DetectionEngine,
    EngineConcurrency, ModelError, ModelProvider,
};
use crate::source::Frame;

struct ModelEntry {
    model_id: String,
    engine: Arc<dyn DetectionEngine>,
    refs: AtomicUsize,
    /// Present for engines registered as serialized; one permit total.
    permit: Option<Semaphore>,
    status: ComponentStatus,
    dependencies: Vec<String>,
}

/// Status row for one loaded model, surfaced through the status API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelStatusReport {
    pub model_id: String,
    pub status: ComponentStatus,
    pub dependencies: Vec<String>,
    pub active_references: usize,
}

/// Holds singletons of inference engines keyed by model id.
///
/// First acquisition triggers the load; subsequent users share the instance.
/// The engine is unloaded when the last handle is released.
pub struct ModelRegistry {
    providers: parking_lot::RwLock<Vec<Arc<dyn ModelProvider>>>,
    entries: DashMap<String, Arc<ModelEntry>>,
    audio_engines: DashMap<String, Arc<dyn AudioAnalysisEngine>>,
    /// Serialises concurrent first-loads of the same model.
    load_lock: Mutex<()>,
}

impl ModelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            providers: parking_lot::RwLock::new(Vec::new()),
            entries: DashMap::new(),
            audio_engines: DashMap::new(),
            load_lock: Mutex::new(()),
        }
    }

    /// Registers a provider. Providers are consulted in registration order.
    pub fn register_provider(&self, provider: Arc<dyn ModelProvider>) {
        self.providers.write().push(provider);
    }

    /// Acquires a shared handle to a model, loading it on first use.
    ///
    /// # Errors
    ///
    /// `NotRegistered` when no provider knows the model; `Load` when the
    /// engine failed to initialize.
    pub async fn acquire(self: &Arc<Self>, model_id: &str) -> Result<ModelHandle, ModelError> {
        if let Some(entry) = self.entries.get(model_id) {
            entry.refs.fetch_add(1, Ordering::SeqCst);
            return Ok(ModelHandle {
                entry: Arc::clone(entry.value()),
                registry: Arc::clone(self),
                released: AtomicUsize::new(0),
            });
        }

        // One loader at a time; a racing caller finds the entry on re-check.
        let _guard = self.load_lock.lock().await;
        if let Some(entry) = self.entries.get(model_id) {
            entry.refs.fetch_add(1, Ordering::SeqCst);
            return Ok(ModelHandle {
                entry: Arc::clone(entry.value()),
                registry: Arc::clone(self),
                released: AtomicUsize::new(0),
            });
        }

        let loaded = self.load_from_providers(model_id).await?;
        log::info!(
            "[Models] loaded {model_id} ({:?}, {} deps)",
            loaded.concurrency,
            loaded.dependencies.len()
        );

        let entry = Arc::new(ModelEntry {
            model_id: model_id.to_string(),
            engine: loaded.engine,
            refs: AtomicUsize::new(1),
            permit: matches!(loaded.concurrency, EngineConcurrency::Serialized)
                .then(|| Semaphore::new(1)),
            status: loaded.status,
            dependencies: loaded.dependencies,
        });
        self.entries.insert(model_id.to_string(), Arc::clone(&entry));

        Ok(ModelHandle {
            entry,
            registry: Arc::clone(self),
            released: AtomicUsize::new(0),
        })
    }

    async fn load_from_providers(&self, model_id: &str) -> Result<super::LoadedModel, ModelError> {
        let providers: Vec<Arc<dyn ModelProvider>> = self.providers.read().clone();
        let mut last_err = ModelError::NotRegistered(model_id.to_string());
        for provider in providers {
            match provider.load(model_id).await {
                Ok(loaded) => return Ok(loaded),
                Err(ModelError::NotRegistered(_)) => continue,
                Err(err) => last_err = err,
            }
        }
        Err(last_err)
    }

    /// Acquires an audio analysis engine, loading it on first use.
    ///
    /// Audio engines are lightweight and shared without reference counting.
    pub async fn acquire_audio(
        &self,
        model_id: &str,
    ) -> Result<Arc<dyn AudioAnalysisEngine>, ModelError> {
        if let Some(engine) = self.audio_engines.get(model_id) {
            return Ok(Arc::clone(engine.value()));
        }
        let providers: Vec<Arc<dyn ModelProvider>> = self.providers.read().clone();
        for provider in providers {
            match provider.load_audio(model_id).await {
                Ok(engine) => {
                    self.audio_engines
                        .insert(model_id.to_string(), Arc::clone(&engine));
                    return Ok(engine);
                }
                Err(ModelError::NotRegistered(_)) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(ModelError::NotRegistered(model_id.to_string()))
    }

    /// Status of every loaded model.
    #[must_use]
    pub fn status_report(&self) -> Vec<ModelStatusReport> {
        self.entries
            .iter()
            .map(|e| ModelStatusReport {
                model_id: e.model_id.clone(),
                status: e.status,
                dependencies: e.dependencies.clone(),
                active_references: e.refs.load(Ordering::SeqCst),
            })
            .collect()
    }

    /// Number of currently loaded models.
    #[must_use]
    pub fn loaded_count(&self) -> usize {
        self.entries.len()
    }

    fn release_entry(&self, entry: &Arc<ModelEntry>) {
        let before = entry.refs.fetch_sub(1, Ordering::SeqCst);
        if before == 1 {
            self.entries.remove(&entry.model_id);
            let engine = Arc::clone(&entry.engine);
            let model_id = entry.model_id.clone();
            // Handles can drop outside a runtime (e.g. in teardown paths);
            // cleanup is skipped there rather than panicking.
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    engine.cleanup().await;
                    log::info!("[Models] unloaded {model_id} (last reference released)");
                });
            } else {
                log::warn!("[Models] {model_id} unloaded without async cleanup (no runtime)");
            }
        }
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared handle to a loaded model.
///
/// Dropping the handle releases the reference; the engine is unloaded when
/// the last workflow lets go.
pub struct ModelHandle {
    entry: Arc<ModelEntry>,
    registry: Arc<ModelRegistry>,
    released: AtomicUsize,
}

impl ModelHandle {
    /// Runs detection, serialising the call when the engine requires it.
    pub async fn detect(
        &self,
        frame: &Frame,
        config: &DetectConfig,
    ) -> Result<Vec<Detection>, ModelError> {
        let _permit = match &self.entry.permit {
            Some(semaphore) => Some(
                semaphore
                    .acquire()
                    .await
                    .map_err(|_| ModelError::Inference("engine shut down".into()))?,
            ),
            None => None,
        };
        self.entry.engine.detect(frame, config).await
    }

    /// Initializes the underlying engine with node config.
    pub async fn initialize(&self, config: &serde_json::Value) -> Result<(), ModelError> {
        self.entry.engine.initialize(config).await
    }

    /// The model this handle refers to.
    #[must_use]
    pub fn model_id(&self) -> &str {
        &self.entry.model_id
    }
}

impl Drop for ModelHandle {
    fn drop(&mut self) {
        if self.released.swap(1, Ordering::SeqCst) == 0 {
            self.registry.release_entry(&self.entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FrameRef, LoadedModel};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct StaticEngine {
        cleanups: Arc<AtomicU32>,
    }

    #[async_trait]
    impl DetectionEngine for StaticEngine {
        async fn initialize(&self, _config: &serde_json::Value) -> Result<(), ModelError> {
            Ok(())
        }

        async fn detect(
            &self,
            frame: &Frame,
            _config: &DetectConfig,
        ) -> Result<Vec<Detection>, ModelError> {
            Ok(vec![Detection {
                class_id: 0,
                class_name: "person".into(),
                confidence: 0.9,
                bbox: [0.0, 0.0, 4.0, 4.0],
                mask: None,
                keypoints: None,
                track_id: None,
                frame_ref: FrameRef::of(frame),
            }])
        }

        async fn cleanup(&self) {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct StaticProvider {
        loads: Arc<AtomicU32>,
        cleanups: Arc<AtomicU32>,
    }

    #[async_trait]
    impl ModelProvider for StaticProvider {
        async fn load(&self, model_id: &str) -> Result<LoadedModel, ModelError> {
            if model_id != "yolo-test" {
                return Err(ModelError::NotRegistered(model_id.into()));
            }
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(LoadedModel {
                engine: Arc::new(StaticEngine {
                    cleanups: Arc::clone(&self.cleanups),
                }),
                concurrency: EngineConcurrency::Serialized,
                status: ComponentStatus::Production,
                dependencies: vec!["onnxruntime".into()],
            })
        }
    }

    fn registry_with_provider() -> (Arc<ModelRegistry>, Arc<AtomicU32>, Arc<AtomicU32>) {
        let loads = Arc::new(AtomicU32::new(0));
        let cleanups = Arc::new(AtomicU32::new(0));
        let registry = Arc::new(ModelRegistry::new());
        registry.register_provider(Arc::new(StaticProvider {
            loads: Arc::clone(&loads),
            cleanups: Arc::clone(&cleanups),
        }));
        (registry, loads, cleanups)
    }

    #[tokio::test]
    async fn first_acquire_loads_second_shares() {
        let (registry, loads, _) = registry_with_provider();
        let a = registry.acquire("yolo-test").await.unwrap();
        let b = registry.acquire("yolo-test").await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(registry.loaded_count(), 1);
        drop(a);
        drop(b);
    }

    #[tokio::test]
    async fn last_release_unloads() {
        let (registry, _, cleanups) = registry_with_provider();
        let a = registry.acquire("yolo-test").await.unwrap();
        let b = registry.acquire("yolo-test").await.unwrap();
        drop(a);
        assert_eq!(registry.loaded_count(), 1);
        drop(b);
        // Cleanup runs on a spawned task.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(registry.loaded_count(), 0);
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_model_is_not_registered() {
        let (registry, _, _) = registry_with_provider();
        assert!(matches!(
            registry.acquire("missing").await,
            Err(ModelError::NotRegistered(_))
        ));
    }

    #[tokio::test]
    async fn status_report_lists_loaded_models() {
        let (registry, _, _) = registry_with_provider();
        let _handle = registry.acquire("yolo-test").await.unwrap();
        let report = registry.status_report();
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].model_id, "yolo-test");
        assert_eq!(report[0].status, ComponentStatus::Production);
        assert_eq!(report[0].dependencies, vec!["onnxruntime".to_string()]);
    }
}
