//! Status API: maturity and dependency reports for node types and models.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::graph::NodeKind;
use crate::model::{ComponentStatus, ModelRegistry};

/// Status row for one node type or model.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub status: ComponentStatus,
    pub dependencies: Vec<String>,
    pub dependencies_met: bool,
    pub setup_steps: Vec<String>,
}

/// Static maturity table for the closed node type set.
#[must_use]
pub fn node_type_status(kind: NodeKind) -> StatusReport {
    let (status, dependencies, setup_steps): (ComponentStatus, Vec<&str>, Vec<&str>) = match kind {
        NodeKind::Camera | NodeKind::VideoInput => {
            (ComponentStatus::Production, vec!["transport factory"], vec![])
        }
        NodeKind::Youtube => (
            ComponentStatus::Beta,
            vec!["transport factory", "stream resolver"],
            vec!["register a URL transport able to resolve YouTube streams"],
        ),
        NodeKind::Model => (
            ComponentStatus::NeedsConfig,
            vec!["model provider"],
            vec!["register a model provider", "configure modelId, confidence and classes"],
        ),
        NodeKind::Zone
        | NodeKind::DetectionFilter
        | NodeKind::DayNightDetector
        | NodeKind::Config
        | NodeKind::DataPreview
        | NodeKind::Debug
        | NodeKind::Catch
        | NodeKind::LinkIn
        | NodeKind::LinkOut
        | NodeKind::LinkCall => (ComponentStatus::Production, vec![], vec![]),
        NodeKind::ParkingViolation => (
            ComponentStatus::Beta,
            vec!["object tracker upstream"],
            vec!["run a tracking-capable model upstream so detections carry track ids"],
        ),
        NodeKind::AudioExtractor => (ComponentStatus::Production, vec!["audio sidechannel"], vec![]),
        NodeKind::AudioAi => (
            ComponentStatus::NeedsConfig,
            vec!["audio analysis engine"],
            vec!["register an audio model provider", "configure modelId"],
        ),
        NodeKind::AudioVu => (ComponentStatus::Production, vec!["audio sidechannel"], vec![]),
        NodeKind::Action => (ComponentStatus::Production, vec![], vec![]),
    };
    let dependencies_met = dependencies.is_empty();
    StatusReport {
        status,
        dependencies: dependencies.into_iter().map(str::to_string).collect(),
        // Node-type dependencies are deployment facts; per-model readiness
        // comes from the registry below.
        dependencies_met,
        setup_steps: setup_steps.into_iter().map(str::to_string).collect(),
    }
}

/// Aggregated status surface for node types and loaded models.
pub struct StatusApi {
    models: Arc<ModelRegistry>,
}

impl StatusApi {
    #[must_use]
    pub fn new(models: Arc<ModelRegistry>) -> Self {
        Self { models }
    }

    /// Status for every node type, keyed by wire name.
    #[must_use]
    pub fn node_types(&self) -> BTreeMap<String, StatusReport> {
        [
            NodeKind::Camera,
            NodeKind::VideoInput,
            NodeKind::Youtube,
            NodeKind::Model,
            NodeKind::Zone,
            NodeKind::DetectionFilter,
            NodeKind::ParkingViolation,
            NodeKind::DayNightDetector,
            NodeKind::AudioExtractor,
            NodeKind::AudioAi,
            NodeKind::AudioVu,
            NodeKind::Action,
            NodeKind::LinkIn,
            NodeKind::LinkOut,
            NodeKind::LinkCall,
            NodeKind::Catch,
            NodeKind::Config,
            NodeKind::DataPreview,
            NodeKind::Debug,
        ]
        .into_iter()
        .map(|kind| (kind.as_str().to_string(), node_type_status(kind)))
        .collect()
    }

    /// Status for every loaded model.
    #[must_use]
    pub fn models(&self) -> BTreeMap<String, StatusReport> {
        self.models
            .status_report()
            .into_iter()
            .map(|report| {
                (
                    report.model_id.clone(),
                    StatusReport {
                        status: report.status,
                        dependencies_met: report.active_references > 0,
                        dependencies: report.dependencies,
                        setup_steps: Vec::new(),
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_node_type_has_a_status_row() {
        let api = StatusApi::new(Arc::new(ModelRegistry::new()));
        let types = api.node_types();
        assert_eq!(types.len(), 19);
        assert_eq!(types["zone"].status, ComponentStatus::Production);
        assert_eq!(types["model"].status, ComponentStatus::NeedsConfig);
        assert!(!types["model"].dependencies_met);
    }
}
