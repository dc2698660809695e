//! Day/night detector: scene brightness classification with hysteresis.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;

use serde::Serialize;

use super::{NodeCtx, NodePayload};

/// Hysteresis margin as a fraction of the threshold being crossed.
const HYSTERESIS: f64 = 0.05;

/// Brightness samples kept in the rolling window.
const WINDOW_SAMPLES: usize = 5;

/// Scene illumination state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SceneState {
    Day,
    Dusk,
    Night,
    /// Monochrome sensor output (IR illumination).
    Ir,
}

/// Classifier with two thresholds and a ≥5% switch margin.
pub struct SceneClassifier {
    day_threshold: f64,
    night_threshold: f64,
    window: VecDeque<f64>,
    state: SceneState,
}

impl SceneClassifier {
    #[must_use]
    pub fn new(day_threshold: f64, night_threshold: f64) -> Self {
        Self {
            day_threshold,
            night_threshold,
            window: VecDeque::with_capacity(WINDOW_SAMPLES),
            state: SceneState::Day,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SceneState {
        self.state
    }

    /// Rolling mean brightness.
    #[must_use]
    pub fn brightness(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().sum::<f64>() / self.window.len() as f64
    }

    /// Feeds one sample; returns `Some((from, to))` on a state transition.
    pub fn observe(&mut self, brightness: f64, monochrome: bool) -> Option<(SceneState, SceneState)> {
        if self.window.len() >= WINDOW_SAMPLES {
            self.window.pop_front();
        }
        self.window.push_back(brightness);
        let avg = self.brightness();

        let next = if monochrome {
            SceneState::Ir
        } else {
            self.classify_with_hysteresis(avg)
        };

        if next != self.state {
            let from = self.state;
            self.state = next;
            return Some((from, next));
        }
        None
    }

    fn classify_with_hysteresis(&self, avg: f64) -> SceneState {
        let day_margin = self.day_threshold * HYSTERESIS;
        let night_margin = self.night_threshold * HYSTERESIS;

        match self.state {
            // Leaving a state requires clearing the threshold by the margin.
            SceneState::Day => {
                if avg < self.night_threshold - night_margin {
                    SceneState::Night
                } else if avg < self.day_threshold - day_margin {
                    SceneState::Dusk
                } else {
                    SceneState::Day
                }
            }
            SceneState::Night => {
                if avg > self.day_threshold + day_margin {
                    SceneState::Day
                } else if avg > self.night_threshold + night_margin {
                    SceneState::Dusk
                } else {
                    SceneState::Night
                }
            }
            SceneState::Dusk | SceneState::Ir => {
                if avg > self.day_threshold + day_margin {
                    SceneState::Day
                } else if avg < self.night_threshold - night_margin {
                    SceneState::Night
                } else {
                    SceneState::Dusk
                }
            }
        }
    }
}

pub(super) async fn run(ctx: &NodeCtx) {
    let interval_ms = ctx.config_u64("intervalSec").unwrap_or(10) * 1_000;
    let day_threshold = ctx.config_f64("dayThreshold").unwrap_or(120.0);
    let night_threshold = ctx.config_f64("nightThreshold").unwrap_or(50.0);

    let mut classifier = SceneClassifier::new(day_threshold, night_threshold);
    let mut last_sample_ms: Option<u64> = None;

    while let Some(msg) = ctx.recv().await {
        let frame = match &msg.payload {
            NodePayload::Frame(frame) => frame,
            other => {
                ctx.send(msg.derive(other.clone()));
                continue;
            }
        };

        // Time-driven sampling at the configured interval.
        let now_ms = frame.timestamp_ms();
        if last_sample_ms.is_some_and(|t| now_ms.saturating_sub(t) < interval_ms) {
            continue;
        }
        last_sample_ms = Some(now_ms);
        ctx.runtime.processed.fetch_add(1, Ordering::Relaxed);

        let monochrome = frame.meta().channels == 1;
        if let Some((from, to)) = classifier.observe(frame.mean_intensity(), monochrome) {
            log::info!(
                "[Workflow] {}/{} scene changed {from:?} -> {to:?} (brightness {:.1})",
                ctx.workflow_id(),
                ctx.node_id(),
                classifier.brightness()
            );
            ctx.emit_event(
                Some(&msg),
                "day_night_change",
                serde_json::json!({
                    "from": from,
                    "to": to,
                    "brightness": classifier.brightness(),
                    "sourceId": frame.source_id(),
                }),
                Some(frame.clone()),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn darkening_scene_walks_day_dusk_night() {
        let mut classifier = SceneClassifier::new(120.0, 50.0);
        // Saturate the window as daylight.
        for _ in 0..5 {
            classifier.observe(200.0, false);
        }
        assert_eq!(classifier.state(), SceneState::Day);

        let mut transitions = Vec::new();
        for brightness in [90.0, 80.0, 70.0, 60.0, 40.0, 30.0, 20.0, 10.0, 5.0, 5.0] {
            if let Some(change) = classifier.observe(brightness, false) {
                transitions.push(change);
            }
        }
        assert_eq!(
            transitions,
            vec![
                (SceneState::Day, SceneState::Dusk),
                (SceneState::Dusk, SceneState::Night)
            ]
        );
    }

    #[test]
    fn hysteresis_prevents_flapping_at_threshold() {
        let mut classifier = SceneClassifier::new(120.0, 50.0);
        for _ in 0..5 {
            classifier.observe(119.0, false);
        }
        // Oscillating right around the day threshold must not flap.
        let mut changes = 0;
        for brightness in [118.0, 121.0, 119.0, 122.0, 118.0, 121.0] {
            if classifier.observe(brightness, false).is_some() {
                changes += 1;
            }
        }
        assert_eq!(changes, 0, "within ±5% of the threshold nothing switches");
    }

    #[test]
    fn monochrome_frames_classify_as_ir() {
        let mut classifier = SceneClassifier::new(120.0, 50.0);
        let change = classifier.observe(100.0, true);
        assert_eq!(change, Some((SceneState::Day, SceneState::Ir)));
        assert_eq!(classifier.state(), SceneState::Ir);
    }
}
