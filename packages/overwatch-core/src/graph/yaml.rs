//! Canonical YAML export and workflow-level diffing.
//!
//! The canonical form has a stable key order (fixed top-level ordering,
//! nodes and edges sorted by id, object keys sorted), so two exports of
//! equivalent graphs are byte-identical and diffs are meaningful. The diff
//! is presented before deploy.

use serde::Serialize;
use serde_json::Value as JsonValue;
use serde_yaml::{Mapping, Value as YamlValue};

use super::{EdgeDoc, NodeDoc, WorkflowDoc};
use crate::error::{OverwatchError, OverwatchResult};

/// Kind of a diffed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Node,
    Edge,
}

/// One added/removed/modified entry in a workflow diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryChange {
    pub entry: EntryKind,
    pub id: String,
}

/// Workflow-level diff between two documents.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDiff {
    pub added: Vec<EntryChange>,
    pub removed: Vec<EntryChange>,
    pub modified: Vec<EntryChange>,
}

impl WorkflowDiff {
    /// Whether the two documents have equivalent node and edge sets.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

/// Exports a workflow to its canonical YAML representation.
///
/// # Errors
///
/// `Internal` if serialization fails (should not happen for valid documents).
pub fn to_canonical_yaml(doc: &WorkflowDoc) -> OverwatchResult<String> {
    let mut root = Mapping::new();
    root.insert(yaml_str("id"), yaml_str(&doc.id));
    root.insert(yaml_str("name"), yaml_str(&doc.name));
    root.insert(yaml_str("version"), YamlValue::from(doc.version));
    root.insert(yaml_str("schemaVersion"), YamlValue::from(doc.schema_version));
    if let Some(site_id) = &doc.site_id {
        root.insert(yaml_str("siteId"), yaml_str(site_id));
    }
    root.insert(yaml_str("isMaster"), YamlValue::from(doc.is_master));

    let mut nodes: Vec<&NodeDoc> = doc.nodes.iter().collect();
    nodes.sort_by(|a, b| a.id.cmp(&b.id));
    root.insert(
        yaml_str("nodes"),
        YamlValue::Sequence(nodes.into_iter().map(node_yaml).collect::<Result<_, _>>()?),
    );

    let mut edges: Vec<&EdgeDoc> = doc.edges.iter().collect();
    edges.sort_by(|a, b| a.id.cmp(&b.id));
    root.insert(
        yaml_str("edges"),
        YamlValue::Sequence(edges.into_iter().map(edge_yaml).collect::<Result<_, _>>()?),
    );

    serde_yaml::to_string(&YamlValue::Mapping(root))
        .map_err(|e| OverwatchError::Internal(format!("yaml export failed: {e}")))
}

/// Parses a workflow from its YAML representation.
///
/// # Errors
///
/// `Config` when the document does not parse as a workflow.
pub fn workflow_from_yaml(yaml: &str) -> OverwatchResult<WorkflowDoc> {
    serde_yaml::from_str(yaml)
        .map_err(|e| OverwatchError::Config(vec![format!("yaml parse failed: {e}")]))
}

/// Diffs two workflow documents at the entry level.
#[must_use]
pub fn diff(before: &WorkflowDoc, after: &WorkflowDoc) -> WorkflowDiff {
    let mut result = WorkflowDiff::default();

    diff_entries(
        EntryKind::Node,
        before.nodes.iter().map(|n| (n.id.as_str(), node_fingerprint(n))),
        after.nodes.iter().map(|n| (n.id.as_str(), node_fingerprint(n))),
        &mut result,
    );
    diff_entries(
        EntryKind::Edge,
        before.edges.iter().map(|e| (e.id.as_str(), edge_fingerprint(e))),
        after.edges.iter().map(|e| (e.id.as_str(), edge_fingerprint(e))),
        &mut result,
    );

    result
}

fn diff_entries<'a>(
    kind: EntryKind,
    before: impl Iterator<Item = (&'a str, String)>,
    after: impl Iterator<Item = (&'a str, String)>,
    result: &mut WorkflowDiff,
) {
    let before: std::collections::BTreeMap<&str, String> = before.collect();
    let after: std::collections::BTreeMap<&str, String> = after.collect();

    for (id, fingerprint) in &after {
        match before.get(id) {
            None => result.added.push(EntryChange {
                entry: kind,
                id: (*id).to_string(),
            }),
            Some(previous) if previous != fingerprint => result.modified.push(EntryChange {
                entry: kind,
                id: (*id).to_string(),
            }),
            Some(_) => {}
        }
    }
    for id in before.keys() {
        if !after.contains_key(id) {
            result.removed.push(EntryChange {
                entry: kind,
                id: (*id).to_string(),
            });
        }
    }
}

fn node_fingerprint(node: &NodeDoc) -> String {
    // Position is editor chrome; semantic identity is type + data.
    format!(
        "{}|{}",
        node.kind.as_str(),
        canonical_json(&node.data)
    )
}

fn edge_fingerprint(edge: &EdgeDoc) -> String {
    format!(
        "{}|{}|{}|{}|{:?}",
        edge.source, edge.source_handle, edge.target, edge.target_handle, edge.data.kind
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Canonical value construction
// ─────────────────────────────────────────────────────────────────────────────

fn yaml_str(s: &str) -> YamlValue {
    YamlValue::String(s.to_string())
}

fn node_yaml(node: &NodeDoc) -> OverwatchResult<YamlValue> {
    let mut map = Mapping::new();
    map.insert(yaml_str("id"), yaml_str(&node.id));
    map.insert(yaml_str("type"), yaml_str(node.kind.as_str()));

    let mut position = Mapping::new();
    position.insert(yaml_str("x"), YamlValue::from(node.position.x));
    position.insert(yaml_str("y"), YamlValue::from(node.position.y));
    map.insert(yaml_str("position"), YamlValue::Mapping(position));

    map.insert(yaml_str("data"), sorted_yaml(&node.data));
    Ok(YamlValue::Mapping(map))
}

fn edge_yaml(edge: &EdgeDoc) -> OverwatchResult<YamlValue> {
    let mut map = Mapping::new();
    map.insert(yaml_str("id"), yaml_str(&edge.id));
    map.insert(yaml_str("source"), yaml_str(&edge.source));
    map.insert(yaml_str("sourceHandle"), yaml_str(&edge.source_handle));
    map.insert(yaml_str("target"), yaml_str(&edge.target));
    map.insert(yaml_str("targetHandle"), yaml_str(&edge.target_handle));

    let kind = serde_json::to_value(edge.data.kind)
        .map_err(|e| OverwatchError::Internal(e.to_string()))?;
    let mut data = Mapping::new();
    data.insert(
        yaml_str("type"),
        yaml_str(kind.as_str().unwrap_or_default()),
    );
    map.insert(yaml_str("data"), YamlValue::Mapping(data));
    Ok(YamlValue::Mapping(map))
}

/// Converts JSON to YAML with all object keys sorted.
fn sorted_yaml(value: &JsonValue) -> YamlValue {
    match value {
        JsonValue::Null => YamlValue::Null,
        JsonValue::Bool(b) => YamlValue::from(*b),
        JsonValue::Number(n) => serde_yaml::to_value(n).unwrap_or(YamlValue::Null),
        JsonValue::String(s) => yaml_str(s),
        JsonValue::Array(items) => YamlValue::Sequence(items.iter().map(sorted_yaml).collect()),
        JsonValue::Object(object) => {
            let mut keys: Vec<&String> = object.keys().collect();
            keys.sort();
            let mut map = Mapping::new();
            for key in keys {
                map.insert(yaml_str(key), sorted_yaml(&object[key]));
            }
            YamlValue::Mapping(map)
        }
    }
}

/// JSON with sorted keys, used for entry fingerprints.
fn canonical_json(value: &JsonValue) -> String {
    match value {
        JsonValue::Object(object) => {
            let mut keys: Vec<&String> = object.keys().collect();
            keys.sort();
            let inner: Vec<String> = keys
                .iter()
                .map(|k| format!("{}:{}", k, canonical_json(&object[*k])))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        JsonValue::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> WorkflowDoc {
        serde_json::from_value(json!({
            "id": "wf-1", "name": "Gate", "version": 2, "schemaVersion": 2,
            "nodes": [
                {"id": "det", "type": "model", "position": {"x": 10.0, "y": 0.0},
                 "data": {"config": {"modelId": "yolo", "confidence": 0.5, "classes": [0]}}},
                {"id": "cam", "type": "camera", "position": {"x": 0.0, "y": 0.0},
                 "data": {"config": {"cameraId": "gate"}}}
            ],
            "edges": [
                {"id": "e1", "source": "cam", "target": "det",
                 "sourceHandle": "out", "targetHandle": "input", "data": {"type": "video"}}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn export_is_stable_and_sorted() {
        let doc = sample();
        let a = to_canonical_yaml(&doc).unwrap();
        let b = to_canonical_yaml(&doc).unwrap();
        assert_eq!(a, b);
        // Nodes sorted by id: cam before det despite document order.
        let cam_at = a.find("id: cam").unwrap();
        let det_at = a.find("id: det").unwrap();
        assert!(cam_at < det_at);
    }

    #[test]
    fn export_then_import_round_trips() {
        let doc = sample();
        let yaml = to_canonical_yaml(&doc).unwrap();
        let back = workflow_from_yaml(&yaml).unwrap();
        assert_eq!(back.id, doc.id);
        assert_eq!(back.nodes.len(), doc.nodes.len());
        assert_eq!(back.edges.len(), doc.edges.len());
        assert!(diff(&doc, &back).is_empty());
    }

    #[test]
    fn diff_reports_added_removed_modified() {
        let before = sample();
        let mut after = sample();
        // Modify det's config, remove the edge, add a node.
        after.nodes[0].data = json!({"config": {"modelId": "yolo", "confidence": 0.8, "classes": [0]}});
        after.edges.clear();
        after.nodes.push(
            serde_json::from_value(json!({
                "id": "dbg", "type": "debug", "data": {}
            }))
            .unwrap(),
        );

        let changes = diff(&before, &after);
        assert_eq!(
            changes.added,
            vec![EntryChange { entry: EntryKind::Node, id: "dbg".into() }]
        );
        assert_eq!(
            changes.removed,
            vec![EntryChange { entry: EntryKind::Edge, id: "e1".into() }]
        );
        assert_eq!(
            changes.modified,
            vec![EntryChange { entry: EntryKind::Node, id: "det".into() }]
        );
    }

    #[test]
    fn moving_a_node_is_not_a_modification() {
        let before = sample();
        let mut after = sample();
        after.nodes[0].position.x = 500.0;
        assert!(diff(&before, &after).is_empty());
    }
}
