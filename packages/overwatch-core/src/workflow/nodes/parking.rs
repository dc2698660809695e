//! Parking violation node: per-track dwell timing inside a restricted zone.
//!
//! Requires tracking upstream: detections without a `track_id` cannot be
//! timed and are counted as errors.

use std::collections::HashMap;
use std::sync::atomic::Ordering;

use super::zone::point_in_polygon;
use super::{NodeCtx, NodePayload};

struct TrackDwell {
    entered_at_ms: u64,
    reported: bool,
}

pub(super) async fn run(ctx: &NodeCtx) {
    let polygon: Vec<(f64, f64)> = ctx
        .config
        .get("polygon")
        .and_then(serde_json::Value::as_array)
        .map(|points| {
            points
                .iter()
                .filter_map(|p| {
                    let pair = p.as_array()?;
                    Some((pair.first()?.as_f64()?, pair.get(1)?.as_f64()?))
                })
                .collect()
        })
        .unwrap_or_default();
    if polygon.len() < 3 {
        ctx.report_error("parking zone polygon is missing or degenerate");
        return;
    }
    let dwell_ms = ctx.config_u64("dwellSec").unwrap_or(60) * 1_000;
    let label = ctx.config_str("label").unwrap_or("parking").to_string();

    let mut tracks: HashMap<u64, TrackDwell> = HashMap::new();
    let mut untracked_warned = false;

    while let Some(msg) = ctx.recv().await {
        let batch = match &msg.payload {
            NodePayload::Detections(batch) => batch,
            // Frames on the video port only carry timing; nothing to do.
            NodePayload::Frame(_) => continue,
            other => {
                ctx.send(msg.derive(other.clone()));
                continue;
            }
        };
        ctx.runtime.processed.fetch_add(1, Ordering::Relaxed);

        let now_ms = batch.frame.timestamp_ms();
        let mut seen_in_zone: Vec<u64> = Vec::new();

        for detection in &batch.detections {
            let Some(track) = detection.track_id else {
                if !untracked_warned {
                    untracked_warned = true;
                    ctx.report_error("detections lack track_id; tracking is required upstream");
                }
                continue;
            };
            let (cx, cy) = detection.bbox_center();
            if !point_in_polygon(cx, cy, &polygon) {
                continue;
            }
            seen_in_zone.push(track);

            let entry = tracks.entry(track).or_insert(TrackDwell {
                entered_at_ms: now_ms,
                reported: false,
            });
            let dwelled = now_ms.saturating_sub(entry.entered_at_ms);
            if dwelled >= dwell_ms && !entry.reported {
                entry.reported = true;
                ctx.emit_event(
                    Some(&msg),
                    "parking_violation",
                    serde_json::json!({
                        "trackId": track,
                        "label": label,
                        "dwellMs": dwelled,
                        "sourceId": batch.frame.source_id(),
                        "classId": detection.class_id,
                        "className": detection.class_name,
                        "bbox": detection.bbox,
                    }),
                    Some(batch.frame.clone()),
                );
            }
        }

        // Leaving the zone resets the dwell timer.
        tracks.retain(|track, _| seen_in_zone.contains(track));
    }
}
