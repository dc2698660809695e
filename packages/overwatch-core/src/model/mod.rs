//! Inference engine contract and shared registry.
//!
//! Models are opaque transformers behind the [`DetectionEngine`] trait; the
//! [`ModelRegistry`](registry::ModelRegistry) lazy-loads them, shares one
//! instance across workflows under reference counting, and serialises calls
//! for engines that are not safe to invoke concurrently.

mod registry;

pub use registry::{ModelHandle, ModelRegistry, ModelStatusReport};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::source::{AudioChunk, Frame};

/// Errors from model loading and inference.
#[derive(Debug, Error)]
pub enum ModelError {
    /// No provider could supply the requested model.
    #[error("model not registered: {0}")]
    NotRegistered(String),

    /// The engine failed to initialize.
    #[error("model load failed: {0}")]
    Load(String),

    /// A detection call failed.
    #[error("inference failed: {0}")]
    Inference(String),
}

/// Reference to the frame a detection was observed on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FrameRef {
    pub source_id: String,
    pub sequence: u64,
    pub timestamp_ms: u64,
}

impl FrameRef {
    /// Builds a reference from a live frame.
    #[must_use]
    pub fn of(frame: &Frame) -> Self {
        Self {
            source_id: frame.source_id().to_string(),
            sequence: frame.sequence(),
            timestamp_ms: frame.timestamp_ms(),
        }
    }
}

/// One observation output by a model for one frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Detection {
    /// COCO class id.
    pub class_id: u32,
    pub class_name: String,
    /// Confidence in `0.0..=1.0`.
    pub confidence: f32,
    /// `[x1, y1, x2, y2]` in pixel coordinates.
    pub bbox: [f32; 4],
    /// Optional segmentation outline.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mask: Option<Vec<[f32; 2]>>,
    /// Optional pose keypoints `(x, y, score)`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keypoints: Option<Vec<[f32; 3]>>,
    /// Stable id across frames when a tracker runs upstream.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track_id: Option<u64>,
    pub frame_ref: FrameRef,
}

impl Detection {
    /// Center of the bounding box.
    #[must_use]
    pub fn bbox_center(&self) -> (f64, f64) {
        (
            f64::from(self.bbox[0] + self.bbox[2]) / 2.0,
            f64::from(self.bbox[1] + self.bbox[3]) / 2.0,
        )
    }
}

/// Per-call detection parameters, from the model node's merged config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectConfig {
    /// Minimum confidence; lower detections are dropped.
    pub confidence: f32,
    /// COCO class ids to keep. Empty keeps everything.
    #[serde(default)]
    pub classes: Vec<u32>,
    /// Non-maximum-suppression IoU threshold.
    #[serde(default = "default_iou")]
    pub iou: f32,
    /// Upper bound on detections per frame.
    #[serde(default = "default_max_detections")]
    pub max_detections: usize,
}

fn default_iou() -> f32 {
    0.45
}

fn default_max_detections() -> usize {
    100
}

impl DetectConfig {
    /// Applies class/confidence filtering and the detection cap.
    ///
    /// Engines are expected to filter themselves; this is the enforcement
    /// pass for engines that do not.
    #[must_use]
    pub fn apply(&self, mut detections: Vec<Detection>) -> Vec<Detection> {
        detections.retain(|d| {
            d.confidence >= self.confidence
                && (self.classes.is_empty() || self.classes.contains(&d.class_id))
        });
        if detections.len() > self.max_detections {
            detections.sort_by(|a, b| {
                b.confidence
                    .partial_cmp(&a.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            detections.truncate(self.max_detections);
        }
        detections
    }
}

/// Whether an engine tolerates concurrent `detect` calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineConcurrency {
    /// Safe for concurrent invocation from multiple workflows.
    Concurrent,
    /// The registry serialises calls through a permit.
    Serialized,
}

/// Maturity of a model or node type, surfaced through the status API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ComponentStatus {
    Production,
    NeedsConfig,
    Beta,
    NotImplemented,
}

/// Capability contract every inference engine implements.
///
/// `detect` must either be safe for concurrent invocation or the model must
/// be registered as [`EngineConcurrency::Serialized`].
#[async_trait]
pub trait DetectionEngine: Send + Sync {
    /// Prepares the engine (weights, device memory).
    async fn initialize(&self, config: &serde_json::Value) -> Result<(), ModelError>;

    /// Runs detection on one frame.
    async fn detect(
        &self,
        frame: &Frame,
        config: &DetectConfig,
    ) -> Result<Vec<Detection>, ModelError>;

    /// Releases engine resources. Called once, after the last release.
    async fn cleanup(&self);
}

/// Result of analysing one audio chunk.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum AudioAnalysis {
    /// Speech-to-text output.
    Transcription {
        text: String,
        language: String,
        confidence: f32,
        #[serde(rename = "keywordsDetected")]
        keywords_detected: Vec<String>,
    },
    /// Sound classification output.
    Classification {
        #[serde(rename = "soundClass")]
        sound_class: String,
        confidence: f32,
    },
}

/// Contract for audio transcription/classification engines.
#[async_trait]
pub trait AudioAnalysisEngine: Send + Sync {
    /// Analyses one buffered chunk.
    async fn analyze(
        &self,
        chunk: &AudioChunk,
        config: &serde_json::Value,
    ) -> Result<AudioAnalysis, ModelError>;
}

/// A model supplied by a provider, with its registry metadata.
pub struct LoadedModel {
    pub engine: std::sync::Arc<dyn DetectionEngine>,
    pub concurrency: EngineConcurrency,
    pub status: ComponentStatus,
    /// External dependencies the engine needs (runtimes, weight files).
    pub dependencies: Vec<String>,
}

/// Supplies engines to the registry on first use.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Loads the engine for `model_id`, or `NotRegistered` if this provider
    /// does not know it.
    async fn load(&self, model_id: &str) -> Result<LoadedModel, ModelError>;

    /// Loads an audio engine for `model_id`, if supported.
    async fn load_audio(
        &self,
        model_id: &str,
    ) -> Result<std::sync::Arc<dyn AudioAnalysisEngine>, ModelError> {
        Err(ModelError::NotRegistered(model_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(class_id: u32, confidence: f32) -> Detection {
        Detection {
            class_id,
            class_name: format!("class-{class_id}"),
            confidence,
            bbox: [0.0, 0.0, 10.0, 10.0],
            mask: None,
            keypoints: None,
            track_id: None,
            frame_ref: FrameRef {
                source_id: "cam".into(),
                sequence: 0,
                timestamp_ms: 0,
            },
        }
    }

    #[test]
    fn apply_filters_class_and_confidence() {
        let config = DetectConfig {
            confidence: 0.5,
            classes: vec![0, 2],
            iou: 0.45,
            max_detections: 100,
        };
        let out = config.apply(vec![
            detection(0, 0.9),
            detection(1, 0.9),
            detection(2, 0.4),
        ]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].class_id, 0);
    }

    #[test]
    fn apply_caps_by_confidence() {
        let config = DetectConfig {
            confidence: 0.0,
            classes: vec![],
            iou: 0.45,
            max_detections: 2,
        };
        let out = config.apply(vec![
            detection(0, 0.3),
            detection(0, 0.9),
            detection(0, 0.6),
        ]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].confidence, 0.9);
    }

    #[test]
    fn bbox_center_is_midpoint() {
        let mut d = detection(0, 1.0);
        d.bbox = [100.0, 100.0, 200.0, 200.0];
        assert_eq!(d.bbox_center(), (150.0, 150.0));
    }
}
