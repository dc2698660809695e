//! Input nodes: camera, videoInput, youtube.
//!
//! Input workers drain their frame router subscription and feed the graph.
//! The subscription (source id, fps, queue depth) is set up by the scheduler
//! before the worker starts.

use super::{NodeCtx, NodeMsg, NodePayload};
use crate::source::Frame;
use std::sync::atomic::Ordering;

/// Pixel-difference ratio below which two frames count as similar.
const SIMILARITY_EPSILON: f64 = 1.5;

pub(super) async fn run(ctx: &mut NodeCtx) {
    let Some(frames) = ctx.frames.take() else {
        ctx.report_error("input node has no router subscription");
        return;
    };
    let skip_similar = ctx.config_bool("skipSimilar").unwrap_or(false);
    let mut previous_intensity: Option<f64> = None;

    loop {
        let frame = tokio::select! {
            () = ctx.workflow.cancel.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        ctx.runtime.processed.fetch_add(1, Ordering::Relaxed);

        if skip_similar && is_similar(&frame, &mut previous_intensity) {
            continue;
        }

        ctx.send(NodeMsg::new(NodePayload::Frame(frame)));
    }
}

/// Cheap frame-similarity check over mean intensity.
fn is_similar(frame: &Frame, previous: &mut Option<f64>) -> bool {
    let intensity = frame.mean_intensity();
    let similar = previous.is_some_and(|p| (p - intensity).abs() < SIMILARITY_EPSILON);
    *previous = Some(intensity);
    similar
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::FrameMeta;
    use bytes::Bytes;

    fn frame(luma: u8) -> Frame {
        Frame::new(
            FrameMeta {
                width: 4,
                height: 4,
                channels: 1,
                timestamp_ms: 0,
                source_id: "cam".into(),
                sequence: 0,
            },
            Bytes::from(vec![luma; 16]),
        )
    }

    #[test]
    fn similar_frames_are_detected() {
        let mut previous = None;
        assert!(!is_similar(&frame(100), &mut previous));
        assert!(is_similar(&frame(100), &mut previous));
        assert!(!is_similar(&frame(150), &mut previous));
    }
}
