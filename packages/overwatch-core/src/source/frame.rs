//! Frame and audio chunk types, and the per-source ring buffer.
//!
//! Frames are immutable: pixel data lives behind [`bytes::Bytes`] and
//! metadata behind an `Arc`, so fan-out to many subscribers is a pair of
//! reference-count bumps, never a pixel copy.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;

/// Metadata describing one decoded frame.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameMeta {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Channels per pixel (1 = grayscale/IR, 3 = BGR/RGB).
    pub channels: u8,
    /// Capture timestamp, Unix milliseconds.
    pub timestamp_ms: u64,
    /// Owning source.
    pub source_id: String,
    /// Monotonic per-source sequence number.
    pub sequence: u64,
}

/// One decoded video frame.
///
/// Cloning is cheap (reference counts only). Consumers must treat the pixel
/// buffer as read-only and must not retain frames past a single delivery;
/// the owning source's ring buffer bounds the useful lifetime.
#[derive(Debug, Clone)]
pub struct Frame {
    meta: Arc<FrameMeta>,
    pixels: Bytes,
}

impl Frame {
    /// Creates a frame from metadata and a pixel buffer.
    #[must_use]
    pub fn new(meta: FrameMeta, pixels: Bytes) -> Self {
        Self {
            meta: Arc::new(meta),
            pixels,
        }
    }

    /// Frame metadata.
    #[must_use]
    pub fn meta(&self) -> &FrameMeta {
        &self.meta
    }

    /// Raw pixel bytes (row-major, interleaved channels).
    #[must_use]
    pub fn pixels(&self) -> &Bytes {
        &self.pixels
    }

    /// Per-source sequence number.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }

    /// Capture timestamp, Unix milliseconds.
    #[must_use]
    pub fn timestamp_ms(&self) -> u64 {
        self.meta.timestamp_ms
    }

    /// Owning source id.
    #[must_use]
    pub fn source_id(&self) -> &str {
        &self.meta.source_id
    }

    /// Mean pixel intensity over all channels, in `0.0..=255.0`.
    ///
    /// Sampling stride keeps this cheap enough for per-frame use on the
    /// day/night path.
    #[must_use]
    pub fn mean_intensity(&self) -> f64 {
        if self.pixels.is_empty() {
            return 0.0;
        }
        let stride = (self.pixels.len() / 4096).max(1);
        let mut sum = 0u64;
        let mut count = 0u64;
        let mut i = 0;
        while i < self.pixels.len() {
            sum += u64::from(self.pixels[i]);
            count += 1;
            i += stride;
        }
        sum as f64 / count as f64
    }
}

/// One buffered audio chunk from a source's audio sidechannel.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Interleaved 16-bit little-endian PCM samples.
    pub samples: Bytes,
    /// Samples per second.
    pub sample_rate: u32,
    /// Channel count (1 or 2).
    pub channels: u8,
    /// Capture timestamp of the first sample, Unix milliseconds.
    pub timestamp_ms: u64,
    /// Owning source.
    pub source_id: String,
    /// Chunk duration in milliseconds.
    pub duration_ms: u64,
}

impl AudioChunk {
    /// Decodes the PCM buffer into i16 samples.
    #[must_use]
    pub fn to_i16_samples(&self) -> Vec<i16> {
        self.samples
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect()
    }
}

/// Fixed-capacity frame ring buffer.
///
/// Single writer (the decode loop), multiple readers. The oldest frame is
/// dropped when full; the drop count is exposed as a metric. Supports the
/// pre-event window query used by recording actions.
pub struct FrameRing {
    frames: RwLock<VecDeque<Frame>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl FrameRing {
    /// Creates a ring with the given capacity (clamped to at least 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Appends a frame, evicting the oldest when full.
    pub fn push(&self, frame: Frame) {
        let mut frames = self.frames.write();
        if frames.len() >= self.capacity {
            frames.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        frames.push_back(frame);
    }

    /// Most recent buffered frame, if any. Non-blocking.
    #[must_use]
    pub fn latest(&self) -> Option<Frame> {
        self.frames.read().back().cloned()
    }

    /// Frames whose timestamps fall within the trailing `duration_ms` window,
    /// oldest first.
    #[must_use]
    pub fn window(&self, duration_ms: u64) -> Vec<Frame> {
        let frames = self.frames.read();
        let Some(newest) = frames.back() else {
            return Vec::new();
        };
        let cutoff = newest.timestamp_ms().saturating_sub(duration_ms);
        frames
            .iter()
            .filter(|f| f.timestamp_ms() >= cutoff)
            .cloned()
            .collect()
    }

    /// Clears all buffered frames.
    pub fn clear(&self) {
        self.frames.write().clear();
    }

    /// Number of buffered frames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.read().len()
    }

    /// Whether the ring is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.read().is_empty()
    }

    /// Frames evicted since creation.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Configured capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(source: &str, sequence: u64, timestamp_ms: u64) -> Frame {
        Frame::new(
            FrameMeta {
                width: 4,
                height: 4,
                channels: 1,
                timestamp_ms,
                source_id: source.to_string(),
                sequence,
            },
            Bytes::from_static(&[128u8; 16]),
        )
    }

    #[test]
    fn ring_keeps_latest_and_counts_drops() {
        let ring = FrameRing::new(3);
        for i in 0..5u64 {
            ring.push(frame("cam", i, i * 33));
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.dropped(), 2);
        assert_eq!(ring.latest().unwrap().sequence(), 4);
    }

    #[test]
    fn ring_of_n_with_n_plus_one_writes_loses_exactly_oldest() {
        let n = 10;
        let ring = FrameRing::new(n);
        for i in 0..=(n as u64) {
            ring.push(frame("cam", i, i));
        }
        assert_eq!(ring.dropped(), 1);
        let frames = ring.window(u64::MAX);
        assert_eq!(frames.first().unwrap().sequence(), 1);
        assert_eq!(frames.last().unwrap().sequence(), n as u64);
    }

    #[test]
    fn window_query_returns_trailing_duration() {
        let ring = FrameRing::new(100);
        for i in 0..10u64 {
            ring.push(frame("cam", i, 1000 + i * 100));
        }
        // Newest at 1900; a 300ms window spans 1600..=1900.
        let recent = ring.window(300);
        assert_eq!(recent.len(), 4);
        assert_eq!(recent[0].timestamp_ms(), 1600);
    }

    #[test]
    fn mean_intensity_of_uniform_frame() {
        let f = Frame::new(
            FrameMeta {
                width: 8,
                height: 8,
                channels: 1,
                timestamp_ms: 0,
                source_id: "cam".to_string(),
                sequence: 0,
            },
            Bytes::from(vec![200u8; 64]),
        );
        assert!((f.mean_intensity() - 200.0).abs() < f64::EPSILON);
    }

    #[test]
    fn audio_chunk_decodes_le_samples() {
        let chunk = AudioChunk {
            samples: Bytes::from(vec![0x01, 0x00, 0xFF, 0x7F]),
            sample_rate: 16_000,
            channels: 1,
            timestamp_ms: 0,
            source_id: "cam".to_string(),
            duration_ms: 0,
        };
        assert_eq!(chunk.to_i16_samples(), vec![1, i16::MAX]);
    }
}
