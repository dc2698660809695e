//! Catch node: routes node errors back into the graph.

use std::collections::HashSet;
use std::sync::atomic::Ordering;

use super::{NodeCtx, NodeMsg, NodePayload};

pub(super) async fn run(ctx: &NodeCtx) {
    let all_scope = ctx.config_str("scope") != Some("specific");
    let watched: HashSet<String> = ctx
        .config
        .get("nodeIds")
        .and_then(serde_json::Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    let mut errors_rx = ctx.workflow.error_tx.subscribe();

    loop {
        let record = tokio::select! {
            () = ctx.workflow.cancel.cancelled() => break,
            received = errors_rx.recv() => match received {
                Ok(record) => record,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        };

        // A catch node must not loop on its own failures.
        if record.node_id == ctx.node_id() {
            continue;
        }
        if !all_scope && !watched.contains(&record.node_id) {
            continue;
        }

        ctx.runtime.processed.fetch_add(1, Ordering::Relaxed);
        ctx.send(NodeMsg::new(NodePayload::Event(super::GraphEvent {
            kind: "node_error".to_string(),
            node_id: record.node_id.clone(),
            timestamp_ms: record.timestamp,
            payload: serde_json::json!({
                "workflowId": record.workflow_id,
                "nodeId": record.node_id,
                "message": record.message,
            }),
            frame: None,
        })));
    }
}
