//! Zone node: polygon containment filtering with dwell and cooldown.

use std::collections::HashMap;
use std::sync::atomic::Ordering;

use serde_json::Value;
use tokio::time::Instant;

use super::{DetectionBatch, NodeCtx, NodePayload};
use crate::model::Detection;

/// Tolerance for the point-on-edge test, in pixels.
const EDGE_EPSILON: f64 = 1e-9;

/// Even-odd polygon containment. A point exactly on an edge is inside.
#[must_use]
pub fn point_in_polygon(px: f64, py: f64, polygon: &[(f64, f64)]) -> bool {
    if polygon.len() < 3 {
        return false;
    }

    // On-edge counts as inside, checked before the parity walk so boundary
    // points are not subject to ray direction.
    let mut j = polygon.len() - 1;
    for i in 0..polygon.len() {
        if point_on_segment(px, py, polygon[j], polygon[i]) {
            return true;
        }
        j = i;
    }

    let mut inside = false;
    let mut j = polygon.len() - 1;
    for i in 0..polygon.len() {
        let (xi, yi) = polygon[i];
        let (xj, yj) = polygon[j];
        if (yi > py) != (yj > py) {
            let x_cross = (xj - xi) * (py - yi) / (yj - yi) + xi;
            if px < x_cross {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

fn point_on_segment(px: f64, py: f64, a: (f64, f64), b: (f64, f64)) -> bool {
    let cross = (b.0 - a.0) * (py - a.1) - (b.1 - a.1) * (px - a.0);
    if cross.abs() > EDGE_EPSILON * ((b.0 - a.0).abs() + (b.1 - a.1).abs() + 1.0) {
        return false;
    }
    let within_x = px >= a.0.min(b.0) - EDGE_EPSILON && px <= a.0.max(b.0) + EDGE_EPSILON;
    let within_y = py >= a.1.min(b.1) - EDGE_EPSILON && py <= a.1.max(b.1) + EDGE_EPSILON;
    within_x && within_y
}

/// Parses the polygon from config.
fn parse_polygon(value: Option<&Value>) -> Vec<(f64, f64)> {
    value
        .and_then(Value::as_array)
        .map(|points| {
            points
                .iter()
                .filter_map(|p| {
                    let pair = p.as_array()?;
                    Some((pair.first()?.as_f64()?, pair.get(1)?.as_f64()?))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Where on the bbox the containment anchor sits.
#[derive(Clone, Copy, PartialEq)]
enum Anchor {
    Center,
    /// Bottom-center: where the object touches the ground.
    Footpoint,
}

fn anchor_point(detection: &Detection, anchor: Anchor) -> (f64, f64) {
    match anchor {
        Anchor::Center => detection.bbox_center(),
        Anchor::Footpoint => (
            f64::from(detection.bbox[0] + detection.bbox[2]) / 2.0,
            f64::from(detection.bbox[3]),
        ),
    }
}

pub(super) async fn run(ctx: &NodeCtx) {
    let polygon = parse_polygon(ctx.config.get("polygon"));
    if polygon.len() < 3 {
        ctx.report_error("zone polygon is missing or degenerate");
        return;
    }
    let include = ctx.config_str("filterType").unwrap_or("include") == "include";
    let anchor = match ctx.config_str("anchor") {
        Some("footpoint") => Anchor::Footpoint,
        _ => Anchor::Center,
    };
    let cooldown = ctx
        .config_u64("cooldownSec")
        .map(std::time::Duration::from_secs);
    let dwell_ms = ctx.config_u64("dwellSec").map(|s| s * 1_000);

    let mut last_emit: Option<Instant> = None;
    // track_id -> first timestamp seen inside the zone.
    let mut dwell_entries: HashMap<u64, u64> = HashMap::new();

    while let Some(msg) = ctx.recv().await {
        let batch = match &msg.payload {
            NodePayload::Detections(batch) => batch,
            other => {
                ctx.send(msg.derive(other.clone()));
                continue;
            }
        };
        ctx.runtime.processed.fetch_add(1, Ordering::Relaxed);

        let mut passed: Vec<Detection> = Vec::new();
        for detection in &batch.detections {
            let (ax, ay) = anchor_point(detection, anchor);
            let in_zone = point_in_polygon(ax, ay, &polygon);
            if in_zone != include {
                if let Some(track) = detection.track_id {
                    dwell_entries.remove(&track);
                }
                continue;
            }

            // Dwell applies only to tracked objects in the kept set.
            if let Some(required) = dwell_ms {
                match detection.track_id {
                    Some(track) => {
                        let first = *dwell_entries
                            .entry(track)
                            .or_insert(detection.frame_ref.timestamp_ms);
                        if detection.frame_ref.timestamp_ms.saturating_sub(first) < required {
                            continue;
                        }
                    }
                    None => continue,
                }
            }
            passed.push(detection.clone());
        }

        // Cooldown suppresses repeated non-empty emissions, not the stream.
        if !passed.is_empty() {
            if let Some(cooldown) = cooldown {
                let now = Instant::now();
                if last_emit.is_some_and(|t| now.duration_since(t) < cooldown) {
                    continue;
                }
                last_emit = Some(now);
            }
        }

        ctx.send(msg.derive(NodePayload::Detections(DetectionBatch {
            frame: batch.frame.clone(),
            detections: passed,
        })));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SQUARE: [(f64, f64); 4] = [(0.0, 0.0), (300.0, 0.0), (300.0, 300.0), (0.0, 300.0)];

    #[test]
    fn center_inside_square() {
        assert!(point_in_polygon(150.0, 150.0, &SQUARE));
    }

    #[test]
    fn point_outside_square() {
        assert!(!point_in_polygon(400.0, 150.0, &SQUARE));
        assert!(!point_in_polygon(-1.0, 150.0, &SQUARE));
    }

    #[test]
    fn point_on_edge_is_inside() {
        assert!(point_in_polygon(150.0, 0.0, &SQUARE));
        assert!(point_in_polygon(0.0, 150.0, &SQUARE));
        assert!(point_in_polygon(300.0, 300.0, &SQUARE));
    }

    #[test]
    fn even_odd_handles_concave_polygon() {
        // A "U" shape: the notch between the prongs is outside.
        let u_shape = [
            (0.0, 0.0),
            (30.0, 0.0),
            (30.0, 30.0),
            (20.0, 30.0),
            (20.0, 10.0),
            (10.0, 10.0),
            (10.0, 30.0),
            (0.0, 30.0),
        ];
        assert!(point_in_polygon(5.0, 20.0, &u_shape), "left prong");
        assert!(point_in_polygon(25.0, 20.0, &u_shape), "right prong");
        assert!(!point_in_polygon(15.0, 20.0, &u_shape), "notch");
    }

    #[test]
    fn degenerate_polygon_contains_nothing() {
        assert!(!point_in_polygon(0.0, 0.0, &[(0.0, 0.0), (1.0, 1.0)]));
    }
}
