//! Preview and debug sinks: forward payloads to the event bus.

use std::sync::atomic::Ordering;

use super::NodeCtx;
use crate::events::RuntimeEvent;
use crate::utils::now_millis;

pub(super) async fn run(ctx: &NodeCtx) {
    while let Some(msg) = ctx.recv().await {
        ctx.runtime.processed.fetch_add(1, Ordering::Relaxed);
        ctx.services.emitter.emit(RuntimeEvent::Detection {
            workflow_id: ctx.workflow_id().to_string(),
            node_id: ctx.node_id().to_string(),
            payload: msg.payload.to_json(),
            timestamp: now_millis(),
        });
    }
}
