//! Detection filter node: class, confidence, and count predicates.
//!
//! All configured predicates must pass for a batch to be forwarded. Count
//! semantics are explicit: `scope: "per_frame"` counts within one frame,
//! `scope: {window: ms}` counts across a sliding window.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;

use serde_json::Value;

use super::{DetectionBatch, NodeCtx, NodePayload};

#[derive(Clone, Copy, PartialEq)]
enum CountOp {
    Gte,
    Lte,
    Eq,
}

impl CountOp {
    fn check(self, count: u64, value: u64) -> bool {
        match self {
            Self::Gte => count >= value,
            Self::Lte => count <= value,
            Self::Eq => count == value,
        }
    }
}

enum CountScope {
    PerFrame,
    Window { ms: u64, seen: VecDeque<(u64, u64)> },
}

struct CountPredicate {
    op: CountOp,
    value: u64,
    scope: CountScope,
}

impl CountPredicate {
    fn from_config(config: &Value) -> Option<Self> {
        let count = config.get("count")?.as_object()?;
        let op = match count.get("op").and_then(Value::as_str) {
            Some("lte") => CountOp::Lte,
            Some("eq") => CountOp::Eq,
            _ => CountOp::Gte,
        };
        let value = count.get("value").and_then(Value::as_u64)?;
        // Scope is mandatory alongside count; validation enforced it.
        let scope = match config.get("scope") {
            Some(Value::String(s)) if s == "per_frame" => CountScope::PerFrame,
            Some(Value::Object(o)) => CountScope::Window {
                ms: o.get("window").and_then(Value::as_u64)?,
                seen: VecDeque::new(),
            },
            _ => return None,
        };
        Some(Self { op, value, scope })
    }

    /// Feeds one frame's kept-detection count; returns whether the predicate
    /// holds after this frame.
    fn admit(&mut self, timestamp_ms: u64, frame_count: u64) -> bool {
        match &mut self.scope {
            CountScope::PerFrame => self.op.check(frame_count, self.value),
            CountScope::Window { ms, seen } => {
                seen.push_back((timestamp_ms, frame_count));
                let cutoff = timestamp_ms.saturating_sub(*ms);
                while seen.front().is_some_and(|&(t, _)| t < cutoff) {
                    seen.pop_front();
                }
                let total: u64 = seen.iter().map(|&(_, c)| c).sum();
                self.op.check(total, self.value)
            }
        }
    }
}

pub(super) async fn run(ctx: &NodeCtx) {
    let classes: Option<Vec<u64>> = ctx
        .config
        .get("classes")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_u64).collect());
    let min_confidence = ctx.config_f64("minConfidence").map(|v| v as f32);
    let mut count_predicate = CountPredicate::from_config(&ctx.config);

    while let Some(msg) = ctx.recv().await {
        let batch = match &msg.payload {
            NodePayload::Detections(batch) => batch,
            other => {
                ctx.send(msg.derive(other.clone()));
                continue;
            }
        };
        ctx.runtime.processed.fetch_add(1, Ordering::Relaxed);

        let kept: Vec<_> = batch
            .detections
            .iter()
            .filter(|d| {
                classes
                    .as_ref()
                    .map_or(true, |c| c.contains(&u64::from(d.class_id)))
                    && min_confidence.map_or(true, |m| d.confidence >= m)
            })
            .cloned()
            .collect();

        if let Some(predicate) = &mut count_predicate {
            if !predicate.admit(batch.frame.timestamp_ms(), kept.len() as u64) {
                continue;
            }
        }

        ctx.send(msg.derive(NodePayload::Detections(DetectionBatch {
            frame: batch.frame.clone(),
            detections: kept,
        })));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn per_frame_count_checks_each_frame() {
        let config = json!({"count": {"op": "gte", "value": 3}, "scope": "per_frame"});
        let mut predicate = CountPredicate::from_config(&config).unwrap();
        assert!(!predicate.admit(0, 2));
        assert!(predicate.admit(33, 3));
        assert!(!predicate.admit(66, 0));
    }

    #[test]
    fn window_count_accumulates_and_expires() {
        let config = json!({"count": {"op": "gte", "value": 5}, "scope": {"window": 1000}});
        let mut predicate = CountPredicate::from_config(&config).unwrap();
        assert!(!predicate.admit(0, 2));
        assert!(!predicate.admit(400, 2));
        assert!(predicate.admit(800, 1));
        // 2s later the old frames aged out of the window.
        assert!(!predicate.admit(2_500, 1));
    }

    #[test]
    fn missing_scope_disables_the_predicate() {
        let config = json!({"count": {"op": "gte", "value": 3}});
        assert!(CountPredicate::from_config(&config).is_none());
    }

    #[test]
    fn lte_and_eq_ops() {
        assert!(CountOp::Lte.check(2, 3));
        assert!(!CountOp::Lte.check(4, 3));
        assert!(CountOp::Eq.check(3, 3));
    }
}
