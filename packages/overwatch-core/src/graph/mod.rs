//! Workflow document model: nodes, edges, ports, and validation.
//!
//! A workflow is a user-authored directed graph. Documents are JSON on the
//! wire (camelCase keys), immutable once deployed at a version, and fully
//! validated before they may run.

pub mod ports;
pub mod schema;
pub mod validate;
pub mod yaml;

pub use validate::{validate, IssueCode, ValidationIssue, ValidationReport};
pub use yaml::{diff, to_canonical_yaml, workflow_from_yaml, EntryChange, WorkflowDiff};

use serde::{Deserialize, Serialize};

/// Schema version this runtime authors.
pub const SCHEMA_VERSION: u32 = 2;

/// Schema versions the runtime can still migrate at deploy time.
pub const MIGRATABLE_SCHEMA_VERSIONS: [u32; 2] = [1, 2];

/// Closed set of node types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    #[serde(rename = "camera")]
    Camera,
    #[serde(rename = "videoInput")]
    VideoInput,
    #[serde(rename = "youtube")]
    Youtube,
    #[serde(rename = "model")]
    Model,
    #[serde(rename = "zone")]
    Zone,
    #[serde(rename = "detectionFilter")]
    DetectionFilter,
    #[serde(rename = "parkingViolation")]
    ParkingViolation,
    #[serde(rename = "dayNightDetector")]
    DayNightDetector,
    #[serde(rename = "audioExtractor")]
    AudioExtractor,
    #[serde(rename = "audioAI")]
    AudioAi,
    #[serde(rename = "audioVU")]
    AudioVu,
    #[serde(rename = "action")]
    Action,
    #[serde(rename = "linkIn")]
    LinkIn,
    #[serde(rename = "linkOut")]
    LinkOut,
    #[serde(rename = "linkCall")]
    LinkCall,
    #[serde(rename = "catch")]
    Catch,
    #[serde(rename = "config")]
    Config,
    #[serde(rename = "dataPreview")]
    DataPreview,
    #[serde(rename = "debug")]
    Debug,
}

impl NodeKind {
    /// Wire name of the node type.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Camera => "camera",
            Self::VideoInput => "videoInput",
            Self::Youtube => "youtube",
            Self::Model => "model",
            Self::Zone => "zone",
            Self::DetectionFilter => "detectionFilter",
            Self::ParkingViolation => "parkingViolation",
            Self::DayNightDetector => "dayNightDetector",
            Self::AudioExtractor => "audioExtractor",
            Self::AudioAi => "audioAI",
            Self::AudioVu => "audioVU",
            Self::Action => "action",
            Self::LinkIn => "linkIn",
            Self::LinkOut => "linkOut",
            Self::LinkCall => "linkCall",
            Self::Catch => "catch",
            Self::Config => "config",
            Self::DataPreview => "dataPreview",
            Self::Debug => "debug",
        }
    }

    /// Whether the node pulls frames from the frame router.
    #[must_use]
    pub const fn is_input(&self) -> bool {
        matches!(self, Self::Camera | Self::VideoInput | Self::Youtube)
    }

    /// Whether the node is a terminal consumer.
    #[must_use]
    pub const fn is_sink(&self) -> bool {
        matches!(self, Self::Action | Self::DataPreview | Self::Debug | Self::LinkOut)
    }

    /// Link and catch nodes create logical back-edges excluded from the
    /// data-flow cycle check.
    #[must_use]
    pub const fn is_link_like(&self) -> bool {
        matches!(self, Self::LinkIn | Self::LinkOut | Self::LinkCall | Self::Catch)
    }
}

/// Payload kind carried by an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    #[default]
    Video,
    Detections,
    Audio,
    AudioData,
    Config,
    Debug,
}

/// Canvas position of a node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// One node in a workflow document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDoc {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default)]
    pub position: Position,
    /// Editor payload; `data.config` is the schema-validated node config.
    #[serde(default)]
    pub data: serde_json::Value,
}

impl NodeDoc {
    /// The node's config object (`data.config`), if present.
    #[must_use]
    pub fn config(&self) -> Option<&serde_json::Map<String, serde_json::Value>> {
        self.data.get("config").and_then(|c| c.as_object())
    }

    /// The node's config as an owned JSON value, defaulting to `{}`.
    #[must_use]
    pub fn config_value(&self) -> serde_json::Value {
        self.data
            .get("config")
            .cloned()
            .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new()))
    }
}

/// Typed payload annotation on an edge.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EdgeData {
    #[serde(rename = "type", default)]
    pub kind: EdgeKind,
}

/// One edge in a workflow document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeDoc {
    pub id: String,
    /// Source node id.
    pub source: String,
    /// Target node id.
    pub target: String,
    #[serde(rename = "sourceHandle", default = "default_source_handle")]
    pub source_handle: String,
    #[serde(rename = "targetHandle", default = "default_target_handle")]
    pub target_handle: String,
    #[serde(default)]
    pub data: EdgeData,
}

fn default_source_handle() -> String {
    "out".to_string()
}

fn default_target_handle() -> String {
    "input".to_string()
}

/// Lifecycle status of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    #[default]
    Draft,
    Running,
    Stopped,
    Error,
}

/// A versioned workflow document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDoc {
    pub id: String,
    pub name: String,
    pub version: u32,
    #[serde(rename = "schemaVersion", default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(rename = "siteId", default, skip_serializing_if = "Option::is_none")]
    pub site_id: Option<String>,
    #[serde(rename = "isMaster", default)]
    pub is_master: bool,
    pub nodes: Vec<NodeDoc>,
    pub edges: Vec<EdgeDoc>,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

impl WorkflowDoc {
    /// Finds a node by id.
    #[must_use]
    pub fn node(&self, id: &str) -> Option<&NodeDoc> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Edges entering `node_id`.
    pub fn incoming<'a>(&'a self, node_id: &str) -> impl Iterator<Item = &'a EdgeDoc> + use<'a> {
        let node_id = node_id.to_string();
        self.edges.iter().filter(move |e| e.target == node_id)
    }

    /// Edges leaving `node_id`.
    pub fn outgoing<'a>(&'a self, node_id: &str) -> impl Iterator<Item = &'a EdgeDoc> + use<'a> {
        let node_id = node_id.to_string();
        self.edges.iter().filter(move |e| e.source == node_id)
    }

    /// Names of all `linkIn` nodes in this workflow.
    #[must_use]
    pub fn link_in_names(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| n.kind == NodeKind::LinkIn)
            .filter_map(|n| {
                n.config()
                    .and_then(|c| c.get("name"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn node_kind_wire_names_round_trip() {
        for kind in [
            NodeKind::Camera,
            NodeKind::AudioAi,
            NodeKind::AudioVu,
            NodeKind::DataPreview,
            NodeKind::LinkCall,
        ] {
            let wire = serde_json::to_string(&kind).unwrap();
            assert_eq!(wire, format!("\"{}\"", kind.as_str()));
            let back: NodeKind = serde_json::from_str(&wire).unwrap();
            assert_eq!(back, kind);
        }
    }

    #[test]
    fn workflow_document_parses_wire_format() {
        let doc: WorkflowDoc = serde_json::from_value(json!({
            "id": "wf-1",
            "name": "Gate watch",
            "version": 3,
            "schemaVersion": 2,
            "isMaster": false,
            "nodes": [
                {"id": "cam", "type": "camera", "position": {"x": 0.0, "y": 0.0},
                 "data": {"config": {"cameraId": "gate-cam", "fps": 10}}},
                {"id": "det", "type": "model", "position": {"x": 200.0, "y": 0.0},
                 "data": {"config": {"modelId": "yolo", "confidence": 0.5, "classes": [0]}}}
            ],
            "edges": [
                {"id": "e1", "source": "cam", "target": "det",
                 "sourceHandle": "out", "targetHandle": "input", "data": {"type": "video"}}
            ]
        }))
        .unwrap();

        assert_eq!(doc.nodes.len(), 2);
        assert_eq!(doc.edges[0].data.kind, EdgeKind::Video);
        assert_eq!(
            doc.node("cam").unwrap().config().unwrap()["cameraId"],
            json!("gate-cam")
        );
    }

    #[test]
    fn link_in_names_collects_configured_names() {
        let doc: WorkflowDoc = serde_json::from_value(json!({
            "id": "wf", "name": "links", "version": 1,
            "nodes": [
                {"id": "l1", "type": "linkIn", "data": {"config": {"name": "alerts"}}},
                {"id": "l2", "type": "linkIn", "data": {}}
            ],
            "edges": []
        }))
        .unwrap();
        assert_eq!(doc.link_in_names(), vec!["alerts".to_string()]);
    }
}
