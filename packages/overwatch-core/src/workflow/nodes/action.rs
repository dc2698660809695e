//! Action node worker: triggers the configured action per arriving payload.

use std::sync::atomic::Ordering;

use super::{NodeCtx, NodePayload};
use crate::workflow::actions::{ActionContext, ActionSpec};

pub(super) async fn run(ctx: &NodeCtx) {
    let spec = match ActionSpec::parse(&ctx.config) {
        Ok(spec) => spec,
        Err(err) => {
            ctx.report_error(format!("action config unusable: {err}"));
            return;
        }
    };

    while let Some(msg) = ctx.recv().await {
        let Some(trigger) = context_for(&msg.payload, ctx) else {
            continue;
        };
        ctx.runtime.processed.fetch_add(1, Ordering::Relaxed);

        if let Err(err) = ctx.services.actions.deliver(&spec, &trigger).await {
            ctx.report_error(format!("action delivery failed: {err}"));
        }
    }
}

/// Builds the delivery context; `None` means the payload does not trigger
/// (e.g. an empty detection batch).
fn context_for(payload: &NodePayload, ctx: &NodeCtx) -> Option<ActionContext> {
    match payload {
        NodePayload::Detections(batch) => {
            if batch.detections.is_empty() {
                return None;
            }
            let top = batch
                .detections
                .iter()
                .map(|d| d.confidence)
                .fold(0.0f32, f32::max);
            Some(ActionContext {
                workflow_id: ctx.workflow_id().to_string(),
                node_id: ctx.node_id().to_string(),
                source_id: Some(batch.frame.source_id().to_string()),
                alarm_id: None,
                payload: payload.to_json(),
                observed_at: batch.frame.timestamp_ms(),
                confidence: top,
                count: Some(batch.detections.len() as u32),
                label: batch.detections.first().map(|d| d.class_name.clone()),
            })
        }
        NodePayload::Event(event) => Some(ActionContext {
            workflow_id: ctx.workflow_id().to_string(),
            node_id: ctx.node_id().to_string(),
            source_id: event
                .payload
                .get("sourceId")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .or_else(|| event.frame.as_ref().map(|f| f.source_id().to_string())),
            alarm_id: None,
            payload: payload.to_json(),
            observed_at: event.timestamp_ms,
            confidence: event
                .payload
                .get("confidence")
                .and_then(serde_json::Value::as_f64)
                .map_or(1.0, |c| c as f32),
            count: None,
            label: Some(event.kind.clone()),
        }),
        NodePayload::Audio(chunk) => Some(ActionContext {
            workflow_id: ctx.workflow_id().to_string(),
            node_id: ctx.node_id().to_string(),
            source_id: Some(chunk.source_id.clone()),
            alarm_id: None,
            payload: payload.to_json(),
            observed_at: chunk.timestamp_ms,
            confidence: 1.0,
            count: None,
            label: None,
        }),
        // Raw frames do not trigger actions.
        NodePayload::Frame(_) => None,
    }
}
