//! Audio nodes: extractor, analysis (AI), and VU metering.
//!
//! Audio buffering is time-driven: the extractor flushes every `bufferSec`
//! regardless of video FPS, which is a frame-rate concept that does not
//! apply to the audio sidechannel.

use std::sync::atomic::Ordering;

use bytes::{Bytes, BytesMut};

use super::{NodeCtx, NodeMsg, NodePayload};
use crate::model::AudioAnalysis;
use crate::source::AudioChunk;

// ─────────────────────────────────────────────────────────────────────────────
// Extractor
// ─────────────────────────────────────────────────────────────────────────────

pub(super) async fn run_extractor(ctx: &mut NodeCtx) {
    let Some(mut audio_rx) = ctx.audio.take() else {
        ctx.report_error("audio extractor has no source audio subscription");
        return;
    };
    let buffer_ms = ctx.config_u64("bufferSec").unwrap_or(1) * 1_000;

    let mut pending = BytesMut::new();
    let mut pending_ms: u64 = 0;
    let mut chunk_start_ms: u64 = 0;
    let mut format: Option<(u32, u8)> = None;

    loop {
        let chunk = tokio::select! {
            () = ctx.workflow.cancel.cancelled() => break,
            received = audio_rx.recv() => match received {
                Ok(chunk) => chunk,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    ctx.report_error(format!("audio sidechannel lagged by {skipped} chunks"));
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        };
        ctx.runtime.processed.fetch_add(1, Ordering::Relaxed);

        if pending.is_empty() {
            chunk_start_ms = chunk.timestamp_ms;
        }
        format.get_or_insert((chunk.sample_rate, chunk.channels));
        pending.extend_from_slice(&chunk.samples);
        pending_ms += chunk.duration_ms;

        // Flush on the configured cadence.
        if pending_ms >= buffer_ms {
            let (sample_rate, channels) = format.unwrap_or((16_000, 1));
            let buffered = AudioChunk {
                samples: pending.split().freeze(),
                sample_rate,
                channels,
                timestamp_ms: chunk_start_ms,
                source_id: chunk.source_id.clone(),
                duration_ms: pending_ms,
            };
            pending_ms = 0;
            ctx.send(NodeMsg::new(NodePayload::Audio(buffered)));
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Audio AI
// ─────────────────────────────────────────────────────────────────────────────

pub(super) async fn run_ai(ctx: &NodeCtx) {
    let Some(model_id) = ctx.config_str("modelId").map(str::to_string) else {
        ctx.report_error("audioAI node missing modelId");
        return;
    };
    let engine = match ctx.services.models.acquire_audio(&model_id).await {
        Ok(engine) => engine,
        Err(err) => {
            ctx.report_error(format!("audio model {model_id} failed to load: {err}"));
            *ctx.runtime.state.write() = super::NodeState::Error;
            ctx.workflow
                .enter_error(&format!("audio model {model_id} failed to load: {err}"));
            return;
        }
    };

    let keywords: Vec<String> = ctx
        .config
        .get("keywords")
        .and_then(serde_json::Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str().map(str::to_lowercase))
                .collect()
        })
        .unwrap_or_default();
    let min_confidence = ctx.config_f64("confidence").unwrap_or(0.0) as f32;

    while let Some(msg) = ctx.recv().await {
        let chunk = match &msg.payload {
            NodePayload::Audio(chunk) => chunk,
            other => {
                ctx.send(msg.derive(other.clone()));
                continue;
            }
        };
        ctx.runtime.processed.fetch_add(1, Ordering::Relaxed);

        match engine.analyze(chunk, &ctx.config).await {
            Ok(AudioAnalysis::Transcription {
                text,
                language,
                confidence,
                keywords_detected,
            }) => {
                if confidence < min_confidence {
                    continue;
                }
                // Engine-reported hits plus our own keyword scan.
                let mut hits = keywords_detected;
                let lowered = text.to_lowercase();
                for keyword in &keywords {
                    if lowered.contains(keyword) && !hits.contains(keyword) {
                        hits.push(keyword.clone());
                    }
                }
                ctx.emit_event(
                    Some(&msg),
                    "audio_transcription",
                    serde_json::json!({
                        "text": text,
                        "language": language,
                        "confidence": confidence,
                        "keywordsDetected": hits,
                        "sourceId": chunk.source_id,
                    }),
                    None,
                );
            }
            Ok(AudioAnalysis::Classification {
                sound_class,
                confidence,
            }) => {
                if confidence < min_confidence {
                    continue;
                }
                ctx.emit_event(
                    Some(&msg),
                    "audio_classification",
                    serde_json::json!({
                        "soundClass": sound_class,
                        "confidence": confidence,
                        "sourceId": chunk.source_id,
                    }),
                    None,
                );
            }
            Err(err) => ctx.report_error(format!("audio analysis failed: {err}")),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// VU meter
// ─────────────────────────────────────────────────────────────────────────────

/// Trigger edge policy for the VU meter.
#[derive(Clone, Copy, PartialEq)]
enum EdgePolicy {
    Rising,
    Falling,
    Continuous,
}

/// RMS level of a PCM chunk in dBFS.
#[must_use]
pub fn rms_dbfs(samples: &Bytes) -> f64 {
    let mut sum_squares = 0.0f64;
    let mut count = 0u64;
    for pair in samples.chunks_exact(2) {
        let sample = f64::from(i16::from_le_bytes([pair[0], pair[1]])) / f64::from(i16::MAX);
        sum_squares += sample * sample;
        count += 1;
    }
    if count == 0 {
        return -96.0;
    }
    let rms = (sum_squares / count as f64).sqrt();
    if rms <= 0.0 {
        -96.0
    } else {
        (20.0 * rms.log10()).max(-96.0)
    }
}

pub(super) async fn run_vu(ctx: &NodeCtx) {
    let threshold = ctx.config_f64("threshold").unwrap_or(-30.0);
    let hysteresis = ctx.config_f64("hysteresisDb").unwrap_or(3.0);
    let edge = match ctx.config_str("edge") {
        Some("falling") => EdgePolicy::Falling,
        Some("continuous") => EdgePolicy::Continuous,
        _ => EdgePolicy::Rising,
    };

    let mut above = false;

    while let Some(msg) = ctx.recv().await {
        let chunk = match &msg.payload {
            NodePayload::Audio(chunk) => chunk,
            other => {
                ctx.send(msg.derive(other.clone()));
                continue;
            }
        };
        ctx.runtime.processed.fetch_add(1, Ordering::Relaxed);

        let level = rms_dbfs(&chunk.samples);
        // Hysteresis: the release point sits below the trigger point.
        let was_above = above;
        if above {
            if level < threshold - hysteresis {
                above = false;
            }
        } else if level >= threshold {
            above = true;
        }

        let fire = match edge {
            EdgePolicy::Rising => above && !was_above,
            EdgePolicy::Falling => !above && was_above,
            EdgePolicy::Continuous => above,
        };
        if fire {
            ctx.emit_event(
                Some(&msg),
                "vu_trigger",
                serde_json::json!({
                    "levelDb": level,
                    "thresholdDb": threshold,
                    "edge": match edge {
                        EdgePolicy::Rising => "rising",
                        EdgePolicy::Falling => "falling",
                        EdgePolicy::Continuous => "continuous",
                    },
                    "sourceId": chunk.source_id,
                }),
                None,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm(amplitude: i16, samples: usize) -> Bytes {
        let mut bytes = Vec::with_capacity(samples * 2);
        for _ in 0..samples {
            bytes.extend_from_slice(&amplitude.to_le_bytes());
        }
        Bytes::from(bytes)
    }

    #[test]
    fn silence_floors_at_minus_96() {
        assert_eq!(rms_dbfs(&pcm(0, 1024)), -96.0);
        assert_eq!(rms_dbfs(&Bytes::new()), -96.0);
    }

    #[test]
    fn full_scale_is_near_zero_dbfs() {
        let level = rms_dbfs(&pcm(i16::MAX, 1024));
        assert!(level.abs() < 0.1, "got {level}");
    }

    #[test]
    fn half_scale_is_about_minus_six() {
        let level = rms_dbfs(&pcm(i16::MAX / 2, 1024));
        assert!((level + 6.0).abs() < 0.2, "got {level}");
    }
}
