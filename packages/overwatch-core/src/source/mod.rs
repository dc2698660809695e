//! Stream ingestion: sources, frames, transports, and the source registry.
//!
//! One long-running ingest task per source owns the transport and the decode
//! loop, publishes frames into a ring buffer and a broadcast channel, and
//! walks the source state machine:
//!
//! ```text
//! INIT → CONNECTING → STREAMING → (RECONNECTING ↔ STREAMING) → STOPPED
//!                                          └──────────────────→ FAILED
//! ```

mod frame;
mod ingest;
mod registry;
mod transport;

pub use frame::{AudioChunk, Frame, FrameMeta, FrameRing};
pub use ingest::SourceRuntime;
pub use registry::SourceRegistry;
pub use transport::{
    FrameTransport, MediaPacket, SyntheticTransport, SyntheticTransportFactory, TransportError,
    TransportFactory,
};

use serde::{Deserialize, Serialize};

/// What kind of producer a source is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Live RTSP camera stream.
    Rtsp,
    /// Local media file.
    File,
    /// Remote HTTP(S) media URL.
    Url,
    /// Built-in deterministic generator (tests, demos).
    Synthetic,
}

/// Requested stream variant quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QualityLevel {
    Low,
    #[default]
    Med,
    High,
}

/// Lifecycle state of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceState {
    Init,
    Connecting,
    Streaming,
    Reconnecting,
    Stopped,
    /// Terminal until `start` is called again.
    Failed,
}

impl SourceState {
    /// Short identifier used in logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Connecting => "connecting",
            Self::Streaming => "streaming",
            Self::Reconnecting => "reconnecting",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }

    /// Whether the ingest task has exited for good.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

/// Configuration for one source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceConfig {
    /// Unique source id.
    pub id: String,
    /// Producer kind.
    pub kind: SourceKind,
    /// Kind-specific location (RTSP URL, file path, HTTP URL, synthetic spec).
    pub location: String,
    /// Requested stream variant.
    #[serde(default)]
    pub quality: QualityLevel,
    /// Decode target in frames per second.
    #[serde(default = "default_target_fps")]
    pub target_fps: u32,
    /// Ring buffer override; the global default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ring_capacity: Option<usize>,
}

fn default_target_fps() -> u32 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_config_round_trips_with_defaults() {
        let json = r#"{"id":"cam-1","kind":"rtsp","location":"rtsp://example/stream"}"#;
        let config: SourceConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.quality, QualityLevel::Med);
        assert_eq!(config.target_fps, 10);
        assert!(config.ring_capacity.is_none());
    }

    #[test]
    fn terminal_states() {
        assert!(SourceState::Stopped.is_terminal());
        assert!(SourceState::Failed.is_terminal());
        assert!(!SourceState::Reconnecting.is_terminal());
    }
}
