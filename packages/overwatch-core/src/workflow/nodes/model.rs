//! Model node: frame-driven inference through the shared model registry.

use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::time::Instant;

use super::{DetectionBatch, NodeCtx, NodePayload};
use crate::model::DetectConfig;
use crate::router::FpsThrottle;

pub(super) async fn run(ctx: &NodeCtx) {
    let Some(model_id) = ctx.config_str("modelId").map(str::to_string) else {
        ctx.report_error("model node missing modelId");
        return;
    };

    // Acquire the shared engine; failure is a load error that downs the node.
    let handle = match ctx.services.models.acquire(&model_id).await {
        Ok(handle) => handle,
        Err(err) => {
            ctx.report_error(format!("model {model_id} failed to load: {err}"));
            // A load failure is immediately persistent, not rate-based.
            *ctx.runtime.state.write() = super::NodeState::Error;
            ctx.workflow.enter_error(&format!("model {model_id} failed to load: {err}"));
            return;
        }
    };
    if let Err(err) = handle.initialize(&ctx.config).await {
        ctx.report_error(format!("model {model_id} failed to initialize: {err}"));
        *ctx.runtime.state.write() = super::NodeState::Error;
        ctx.workflow.enter_error(&format!("model {model_id} failed to initialize: {err}"));
        return;
    }

    let detect_config: DetectConfig = match serde_json::from_value(ctx.config.clone()) {
        Ok(config) => config,
        Err(err) => {
            ctx.report_error(format!("model config invalid: {err}"));
            return;
        }
    };

    // Declared fps throttles compute; absent, the input node's rate applies.
    let fps = ctx
        .config_u64("fps")
        .map_or(ctx.effective_fps, |v| v as u32);
    let mut throttle = FpsThrottle::new(fps);
    let deadline = Duration::from_micros(1_000_000 / u64::from(fps.max(1)));

    while let Some(msg) = ctx.recv().await {
        let frame = match &msg.payload {
            NodePayload::Frame(frame) => frame.clone(),
            // Only video drives compute; anything else passes through.
            other => {
                ctx.send(msg.derive(other.clone()));
                continue;
            }
        };

        if !throttle.admit() {
            continue;
        }
        ctx.runtime.processed.fetch_add(1, Ordering::Relaxed);

        let started = Instant::now();
        match handle.detect(&frame, &detect_config).await {
            Ok(raw) => {
                let elapsed = started.elapsed();
                if elapsed > deadline {
                    // Overruns yield the next frame; the call is not killed.
                    log::warn!(
                        "[Workflow] {}/{} inference took {elapsed:?} (deadline {deadline:?})",
                        ctx.workflow_id(),
                        ctx.node_id()
                    );
                }
                let detections = detect_config.apply(raw);
                ctx.send(msg.derive(NodePayload::Detections(DetectionBatch {
                    frame,
                    detections,
                })));
            }
            Err(err) => ctx.report_error(format!("inference failed: {err}")),
        }
    }
}
