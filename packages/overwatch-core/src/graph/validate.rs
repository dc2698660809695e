//! Workflow validation.
//!
//! Validation is total: every check runs and errors accumulate, so the
//! editor can surface all problems at once. Errors prevent deployment;
//! warnings do not.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use super::{ports, schema, NodeKind, WorkflowDoc, MIGRATABLE_SCHEMA_VERSIONS};

/// Category of a validation finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum IssueCode {
    /// Unsupported schema version.
    SchemaVersion,
    /// Node config failed its type schema.
    Schema,
    /// Duplicate node or edge id.
    DuplicateId,
    /// Edge references a node that does not exist.
    DanglingReference,
    /// Port pairing not in the static registry.
    PortIncompatible,
    /// Data-flow cycle.
    CycleDetected,
    /// Input with no consumers, or action with no producers.
    DanglingNode,
    /// Link reference to an unknown `linkIn` name.
    LinkIntegrity,
}

/// One validation finding.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    pub code: IssueCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edge_id: Option<String>,
    /// Members of the offending cycle, for [`IssueCode::CycleDetected`].
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<String>,
}

impl ValidationIssue {
    fn new(code: IssueCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            node_id: None,
            edge_id: None,
            nodes: Vec::new(),
        }
    }

    fn for_node(code: IssueCode, node_id: &str, message: impl Into<String>) -> Self {
        Self {
            node_id: Some(node_id.to_string()),
            ..Self::new(code, message)
        }
    }

    fn for_edge(code: IssueCode, edge_id: &str, message: impl Into<String>) -> Self {
        Self {
            edge_id: Some(edge_id.to_string()),
            ..Self::new(code, message)
        }
    }
}

/// Outcome of validating one workflow document.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationReport {
    /// Whether the workflow may be deployed.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Flattens error messages for the API boundary.
    #[must_use]
    pub fn error_messages(&self) -> Vec<String> {
        self.errors
            .iter()
            .map(|issue| match (&issue.node_id, &issue.edge_id) {
                (Some(node), _) => format!("node {node}: {}", issue.message),
                (None, Some(edge)) => format!("edge {edge}: {}", issue.message),
                (None, None) => issue.message.clone(),
            })
            .collect()
    }
}

/// Validates a workflow document.
///
/// `external_link_ins` carries the `linkIn` names of already-deployed
/// workflows, for cross-workflow link integrity.
#[must_use]
pub fn validate(doc: &WorkflowDoc, external_link_ins: &HashSet<String>) -> ValidationReport {
    let mut report = ValidationReport::default();

    check_schema_version(doc, &mut report);
    check_node_schemas(doc, &mut report);
    check_id_uniqueness(doc, &mut report);
    check_edge_references(doc, &mut report);
    check_port_compatibility(doc, &mut report);
    check_cycles(doc, &mut report);
    check_dangling_nodes(doc, &mut report);
    check_link_integrity(doc, external_link_ins, &mut report);

    report
}

fn check_schema_version(doc: &WorkflowDoc, report: &mut ValidationReport) {
    if !MIGRATABLE_SCHEMA_VERSIONS.contains(&doc.schema_version) {
        report.errors.push(ValidationIssue::new(
            IssueCode::SchemaVersion,
            format!(
                "schema version {} cannot be migrated by this runtime (supported: {:?})",
                doc.schema_version, MIGRATABLE_SCHEMA_VERSIONS
            ),
        ));
    }
}

fn check_node_schemas(doc: &WorkflowDoc, report: &mut ValidationReport) {
    for node in &doc.nodes {
        for message in schema::validate_node_config(node.kind, &node.config_value()) {
            report
                .errors
                .push(ValidationIssue::for_node(IssueCode::Schema, &node.id, message));
        }
    }
}

fn check_id_uniqueness(doc: &WorkflowDoc, report: &mut ValidationReport) {
    let mut seen_nodes = HashSet::new();
    for node in &doc.nodes {
        if !seen_nodes.insert(node.id.as_str()) {
            report.errors.push(ValidationIssue::for_node(
                IssueCode::DuplicateId,
                &node.id,
                "duplicate node id",
            ));
        }
    }
    let mut seen_edges = HashSet::new();
    for edge in &doc.edges {
        if !seen_edges.insert(edge.id.as_str()) {
            report.errors.push(ValidationIssue::for_edge(
                IssueCode::DuplicateId,
                &edge.id,
                "duplicate edge id",
            ));
        }
    }
}

fn check_edge_references(doc: &WorkflowDoc, report: &mut ValidationReport) {
    for edge in &doc.edges {
        if doc.node(&edge.source).is_none() {
            report.errors.push(ValidationIssue::for_edge(
                IssueCode::DanglingReference,
                &edge.id,
                format!("source node \"{}\" does not exist", edge.source),
            ));
        }
        if doc.node(&edge.target).is_none() {
            report.errors.push(ValidationIssue::for_edge(
                IssueCode::DanglingReference,
                &edge.id,
                format!("target node \"{}\" does not exist", edge.target),
            ));
        }
    }
}

fn check_port_compatibility(doc: &WorkflowDoc, report: &mut ValidationReport) {
    for edge in &doc.edges {
        let (Some(source), Some(target)) = (doc.node(&edge.source), doc.node(&edge.target)) else {
            continue; // already reported as a dangling reference
        };
        if !ports::compatible(
            source.kind,
            &edge.source_handle,
            target.kind,
            &edge.target_handle,
        ) {
            report.errors.push(ValidationIssue::for_edge(
                IssueCode::PortIncompatible,
                &edge.id,
                format!(
                    "({}, {}) -> ({}, {}) is not a permitted connection",
                    source.kind.as_str(),
                    edge.source_handle,
                    target.kind.as_str(),
                    edge.target_handle
                ),
            ));
        }
    }
}

/// DFS cycle detection over the data-flow graph.
///
/// Link and catch nodes create logical back-edges by design; edges touching
/// them are excluded here and bounded at runtime instead.
fn check_cycles(doc: &WorkflowDoc, report: &mut ValidationReport) {
    let kinds: HashMap<&str, NodeKind> =
        doc.nodes.iter().map(|n| (n.id.as_str(), n.kind)).collect();

    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in &doc.edges {
        let (Some(&source_kind), Some(&target_kind)) =
            (kinds.get(edge.source.as_str()), kinds.get(edge.target.as_str()))
        else {
            continue;
        };
        if source_kind.is_link_like() || target_kind.is_link_like() {
            continue;
        }
        adjacency
            .entry(edge.source.as_str())
            .or_default()
            .push(edge.target.as_str());
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        White,
        Gray,
        Black,
    }

    let mut marks: HashMap<&str, Mark> =
        doc.nodes.iter().map(|n| (n.id.as_str(), Mark::White)).collect();
    let mut cycle_members: HashSet<String> = HashSet::new();

    fn visit<'a>(
        node: &'a str,
        adjacency: &HashMap<&'a str, Vec<&'a str>>,
        marks: &mut HashMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
        cycle_members: &mut HashSet<String>,
    ) {
        marks.insert(node, Mark::Gray);
        stack.push(node);
        for &next in adjacency.get(node).into_iter().flatten() {
            match marks.get(next).copied().unwrap_or(Mark::White) {
                Mark::White => visit(next, adjacency, marks, stack, cycle_members),
                Mark::Gray => {
                    // Back edge: everything from `next` to the stack top cycles.
                    if let Some(start) = stack.iter().position(|&n| n == next) {
                        for &member in &stack[start..] {
                            cycle_members.insert(member.to_string());
                        }
                    }
                }
                Mark::Black => {}
            }
        }
        stack.pop();
        marks.insert(node, Mark::Black);
    }

    let ids: Vec<&str> = doc.nodes.iter().map(|n| n.id.as_str()).collect();
    let mut stack = Vec::new();
    for id in ids {
        if marks.get(id) == Some(&Mark::White) {
            visit(id, &adjacency, &mut marks, &mut stack, &mut cycle_members);
        }
    }

    if !cycle_members.is_empty() {
        let mut nodes: Vec<String> = cycle_members.into_iter().collect();
        nodes.sort();
        report.errors.push(ValidationIssue {
            code: IssueCode::CycleDetected,
            message: format!("data-flow cycle through nodes {{{}}}", nodes.join(", ")),
            node_id: None,
            edge_id: None,
            nodes,
        });
    }
}

fn check_dangling_nodes(doc: &WorkflowDoc, report: &mut ValidationReport) {
    for node in &doc.nodes {
        if node.kind.is_input() && doc.outgoing(&node.id).next().is_none() {
            report.warnings.push(ValidationIssue::for_node(
                IssueCode::DanglingNode,
                &node.id,
                "input node has no downstream consumers",
            ));
        }
        if node.kind == NodeKind::Action && doc.incoming(&node.id).next().is_none() {
            report.warnings.push(ValidationIssue::for_node(
                IssueCode::DanglingNode,
                &node.id,
                "action node has no upstream producers",
            ));
        }
    }
}

fn check_link_integrity(
    doc: &WorkflowDoc,
    external_link_ins: &HashSet<String>,
    report: &mut ValidationReport,
) {
    let local: HashSet<String> = doc.link_in_names().into_iter().collect();

    for node in &doc.nodes {
        let reference = match node.kind {
            NodeKind::LinkOut => node
                .config()
                .and_then(|c| c.get("name"))
                .and_then(|v| v.as_str()),
            NodeKind::LinkCall => node
                .config()
                .and_then(|c| c.get("target"))
                .and_then(|v| v.as_str()),
            _ => None,
        };
        if let Some(name) = reference {
            if !local.contains(name) && !external_link_ins.contains(name) {
                report.errors.push(ValidationIssue::for_node(
                    IssueCode::LinkIntegrity,
                    &node.id,
                    format!("references linkIn \"{name}\" which is not deployed"),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn workflow(nodes: serde_json::Value, edges: serde_json::Value) -> WorkflowDoc {
        serde_json::from_value(json!({
            "id": "wf", "name": "test", "version": 1, "schemaVersion": 2,
            "nodes": nodes, "edges": edges
        }))
        .unwrap()
    }

    fn camera(id: &str) -> serde_json::Value {
        json!({"id": id, "type": "camera", "data": {"config": {"cameraId": "cam"}}})
    }

    fn model(id: &str) -> serde_json::Value {
        json!({"id": id, "type": "model",
               "data": {"config": {"modelId": "yolo", "confidence": 0.5, "classes": [0]}}})
    }

    fn video_edge(id: &str, source: &str, target: &str) -> serde_json::Value {
        json!({"id": id, "source": source, "target": target,
               "sourceHandle": "out", "targetHandle": "input", "data": {"type": "video"}})
    }

    #[test]
    fn valid_linear_workflow_passes() {
        let doc = workflow(
            json!([camera("cam"), model("det")]),
            json!([video_edge("e1", "cam", "det")]),
        );
        let report = validate(&doc, &HashSet::new());
        assert!(report.is_valid(), "{:?}", report.errors);
    }

    #[test]
    fn cycle_is_detected_and_lists_members() {
        // zone -> filter -> zone2 -> zone, all detections-typed.
        let zone = |id: &str| {
            json!({"id": id, "type": "zone",
                   "data": {"config": {"polygon": [[0,0],[10,0],[10,10]], "filterType": "include"}}})
        };
        let det_edge = |id: &str, s: &str, t: &str| {
            json!({"id": id, "source": s, "target": t,
                   "sourceHandle": "out", "targetHandle": "input", "data": {"type": "detections"}})
        };
        let doc = workflow(
            json!([zone("a"), zone("b"), zone("c")]),
            json!([
                det_edge("e1", "a", "b"),
                det_edge("e2", "b", "c"),
                det_edge("e3", "c", "a"),
            ]),
        );
        let report = validate(&doc, &HashSet::new());
        let cycle = report
            .errors
            .iter()
            .find(|e| e.code == IssueCode::CycleDetected)
            .expect("cycle error");
        assert_eq!(cycle.nodes, vec!["a", "b", "c"]);
    }

    #[test]
    fn link_back_edges_do_not_count_as_cycles() {
        let doc = workflow(
            json!([
                camera("cam"), model("det"),
                {"id": "lo", "type": "linkOut", "data": {"config": {"name": "loop"}}},
                {"id": "li", "type": "linkIn", "data": {"config": {"name": "loop"}}},
            ]),
            json!([
                video_edge("e1", "cam", "det"),
                {"id": "e2", "source": "det", "target": "lo",
                 "sourceHandle": "out", "targetHandle": "input", "data": {"type": "detections"}},
            ]),
        );
        let report = validate(&doc, &HashSet::new());
        assert!(report.is_valid(), "{:?}", report.errors);
    }

    #[test]
    fn duplicate_ids_are_errors() {
        let doc = workflow(json!([camera("cam"), camera("cam")]), json!([]));
        let report = validate(&doc, &HashSet::new());
        assert!(report
            .errors
            .iter()
            .any(|e| e.code == IssueCode::DuplicateId));
    }

    #[test]
    fn edge_to_missing_node_is_error() {
        let doc = workflow(
            json!([camera("cam")]),
            json!([video_edge("e1", "cam", "ghost")]),
        );
        let report = validate(&doc, &HashSet::new());
        assert!(report
            .errors
            .iter()
            .any(|e| e.code == IssueCode::DanglingReference));
    }

    #[test]
    fn incompatible_ports_are_errors() {
        // camera video output into a zone (expects detections).
        let doc = workflow(
            json!([camera("cam"),
                   {"id": "z", "type": "zone",
                    "data": {"config": {"polygon": [[0,0],[1,0],[1,1]], "filterType": "include"}}}]),
            json!([video_edge("e1", "cam", "z")]),
        );
        let report = validate(&doc, &HashSet::new());
        assert!(report
            .errors
            .iter()
            .any(|e| e.code == IssueCode::PortIncompatible));
    }

    #[test]
    fn dangling_input_is_warning_not_error() {
        let doc = workflow(json!([camera("cam")]), json!([]));
        let report = validate(&doc, &HashSet::new());
        assert!(report.is_valid());
        assert!(report
            .warnings
            .iter()
            .any(|w| w.code == IssueCode::DanglingNode));
    }

    #[test]
    fn link_call_to_unknown_target_is_error() {
        let doc = workflow(
            json!([{"id": "lc", "type": "linkCall", "data": {"config": {"target": "missing"}}}]),
            json!([]),
        );
        let report = validate(&doc, &HashSet::new());
        assert!(report
            .errors
            .iter()
            .any(|e| e.code == IssueCode::LinkIntegrity));

        // Deployed elsewhere is fine.
        let mut external = HashSet::new();
        external.insert("missing".to_string());
        assert!(validate(&doc, &external).is_valid());
    }

    #[test]
    fn unsupported_schema_version_is_rejected() {
        let mut doc = workflow(json!([camera("cam")]), json!([]));
        doc.schema_version = 99;
        let report = validate(&doc, &HashSet::new());
        assert!(report
            .errors
            .iter()
            .any(|e| e.code == IssueCode::SchemaVersion));
    }

    #[test]
    fn all_checks_accumulate() {
        // Duplicate ids, bad schema, and a dangling edge at once.
        let doc = workflow(
            json!([
                {"id": "n", "type": "model", "data": {"config": {"modelId": "yolo"}}},
                {"id": "n", "type": "camera", "data": {"config": {}}},
            ]),
            json!([video_edge("e1", "n", "ghost")]),
        );
        let report = validate(&doc, &HashSet::new());
        let codes: Vec<IssueCode> = report.errors.iter().map(|e| e.code).collect();
        assert!(codes.contains(&IssueCode::Schema));
        assert!(codes.contains(&IssueCode::DuplicateId));
        assert!(codes.contains(&IssueCode::DanglingReference));
    }
}
