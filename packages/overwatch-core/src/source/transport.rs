//! Media transport abstraction.
//!
//! Codec and protocol handling is an external concern; the ingest loop only
//! needs something that can be opened, read packet-by-packet, and closed.
//! Deployments register a [`TransportFactory`] for the protocols they carry
//! (RTSP, file demux, HTTP pull); the built-in synthetic transport serves
//! tests and demo setups.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::time::{interval, Duration, MissedTickBehavior};

use super::{SourceConfig, SourceKind};
use crate::utils::now_millis;

/// Errors surfaced by a media transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection could not be established. Retried with backoff.
    #[error("connect failed: {0}")]
    Connect(String),

    /// A read or decode step failed. Counted; a run of these triggers reconnect.
    #[error("read failed: {0}")]
    Read(String),

    /// Credentials rejected. Fatal; no retry.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// The source location is malformed or unsupported. Fatal; no retry.
    #[error("invalid source location: {0}")]
    InvalidLocation(String),

    /// The stream ended. Terminal for files, a reconnect for live sources.
    #[error("end of stream")]
    EndOfStream,
}

impl TransportError {
    /// Whether the error is unrecoverable by reconnecting.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::InvalidLocation(_))
    }
}

/// One decoded packet from a transport.
pub enum MediaPacket {
    /// A decoded video frame.
    Video {
        width: u32,
        height: u32,
        channels: u8,
        pixels: Bytes,
    },
    /// A chunk of decoded PCM audio from the source's sidechannel.
    Audio {
        samples: Bytes,
        sample_rate: u32,
        channels: u8,
        duration_ms: u64,
    },
}

/// A connected media transport producing decoded packets.
#[async_trait]
pub trait FrameTransport: Send {
    /// Establishes the connection and prepares decoding.
    async fn open(&mut self) -> Result<(), TransportError>;

    /// Reads the next packet, waiting for source pacing as needed.
    async fn read(&mut self) -> Result<MediaPacket, TransportError>;

    /// Releases the transport. Must be safe to call more than once.
    async fn close(&mut self);
}

/// Creates transports for source configurations.
///
/// The factory is consulted on every (re)connect, so quality switches that
/// change the stream variant simply reopen through it.
pub trait TransportFactory: Send + Sync {
    /// Builds an unopened transport for the given source.
    fn open_transport(
        &self,
        config: &SourceConfig,
    ) -> Result<Box<dyn FrameTransport>, TransportError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Synthetic transport
// ─────────────────────────────────────────────────────────────────────────────

/// Deterministic frame generator for tests and demo deployments.
///
/// Location format: `synthetic://?fps=10&frames=0&w=64&h=36&luma=128&audio=0`
/// (`frames=0` means unbounded; `audio=1` interleaves one PCM chunk per
/// second of video).
pub struct SyntheticTransport {
    fps: u32,
    remaining: Option<u64>,
    width: u32,
    height: u32,
    luma: u8,
    audio: bool,
    emitted: u64,
    /// Frame count at which the last audio chunk was interleaved.
    last_audio_at: u64,
    ticker: Option<tokio::time::Interval>,
}

impl SyntheticTransport {
    /// Parses the synthetic location string.
    pub fn from_location(location: &str) -> Result<Self, TransportError> {
        let query = location
            .strip_prefix("synthetic://")
            .ok_or_else(|| TransportError::InvalidLocation(location.to_string()))?;
        let query = query.strip_prefix('?').unwrap_or(query);

        let mut fps = 10u32;
        let mut frames = 0u64;
        let mut width = 64u32;
        let mut height = 36u32;
        let mut luma = 128u8;
        let mut audio = false;

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| TransportError::InvalidLocation(format!("bad query pair: {pair}")))?;
            let parse_err =
                |_| TransportError::InvalidLocation(format!("bad value for {key}: {value}"));
            match key {
                "fps" => fps = value.parse().map_err(parse_err)?,
                "frames" => frames = value.parse().map_err(parse_err)?,
                "w" => width = value.parse().map_err(parse_err)?,
                "h" => height = value.parse().map_err(parse_err)?,
                "luma" => luma = value.parse().map_err(parse_err)?,
                "audio" => audio = value == "1" || value == "true",
                _ => {
                    return Err(TransportError::InvalidLocation(format!(
                        "unknown parameter: {key}"
                    )))
                }
            }
        }

        if fps == 0 {
            return Err(TransportError::InvalidLocation("fps must be >= 1".into()));
        }

        Ok(Self {
            fps,
            remaining: (frames > 0).then_some(frames),
            width,
            height,
            luma,
            audio,
            emitted: 0,
            last_audio_at: 0,
            ticker: None,
        })
    }
}

#[async_trait]
impl FrameTransport for SyntheticTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        let mut ticker = interval(Duration::from_micros(1_000_000 / u64::from(self.fps)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.ticker = Some(ticker);
        Ok(())
    }

    async fn read(&mut self) -> Result<MediaPacket, TransportError> {
        if let Some(remaining) = &mut self.remaining {
            if *remaining == 0 {
                return Err(TransportError::EndOfStream);
            }
            *remaining -= 1;
        }

        let ticker = self
            .ticker
            .as_mut()
            .ok_or_else(|| TransportError::Read("transport not opened".into()))?;
        ticker.tick().await;

        // Interleave one audio chunk each whole second of video.
        if self.audio
            && self.emitted > 0
            && self.emitted % u64::from(self.fps) == 0
            && self.last_audio_at != self.emitted
        {
            self.last_audio_at = self.emitted;
            let sample_rate = 16_000u32;
            let samples = vec![0u8; (sample_rate * 2) as usize];
            return Ok(MediaPacket::Audio {
                samples: Bytes::from(samples),
                sample_rate,
                channels: 1,
                duration_ms: 1_000,
            });
        }

        self.emitted += 1;
        let size = (self.width * self.height * 3) as usize;
        Ok(MediaPacket::Video {
            width: self.width,
            height: self.height,
            channels: 3,
            pixels: Bytes::from(vec![self.luma; size]),
        })
    }

    async fn close(&mut self) {
        self.ticker = None;
    }
}

/// Factory serving synthetic sources only.
///
/// Production deployments wrap this (or replace it) with factories for the
/// protocols they actually ingest.
pub struct SyntheticTransportFactory;

impl TransportFactory for SyntheticTransportFactory {
    fn open_transport(
        &self,
        config: &SourceConfig,
    ) -> Result<Box<dyn FrameTransport>, TransportError> {
        match config.kind {
            SourceKind::Synthetic => Ok(Box::new(SyntheticTransport::from_location(
                &config.location,
            )?)),
            _ => Err(TransportError::InvalidLocation(format!(
                "no transport registered for {:?} source {}",
                config.kind, config.id
            ))),
        }
    }
}

/// Stamps a video packet into a [`Frame`](super::Frame) with source metadata.
pub(crate) fn stamp_frame(
    source_id: &str,
    sequence: u64,
    packet_width: u32,
    packet_height: u32,
    packet_channels: u8,
    pixels: Bytes,
) -> super::Frame {
    super::Frame::new(
        super::FrameMeta {
            width: packet_width,
            height: packet_height,
            channels: packet_channels,
            timestamp_ms: now_millis(),
            source_id: source_id.to_string(),
            sequence,
        },
        pixels,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_location_parses() {
        let t = SyntheticTransport::from_location("synthetic://?fps=30&frames=5&w=8&h=8").unwrap();
        assert_eq!(t.fps, 30);
        assert_eq!(t.remaining, Some(5));
        assert_eq!(t.width, 8);
    }

    #[test]
    fn synthetic_rejects_unknown_params() {
        assert!(matches!(
            SyntheticTransport::from_location("synthetic://?bogus=1"),
            Err(TransportError::InvalidLocation(_))
        ));
    }

    #[test]
    fn fatal_classification() {
        assert!(TransportError::Auth("denied".into()).is_fatal());
        assert!(TransportError::InvalidLocation("x".into()).is_fatal());
        assert!(!TransportError::Read("jitter".into()).is_fatal());
        assert!(!TransportError::Connect("refused".into()).is_fatal());
    }

    #[tokio::test(start_paused = true)]
    async fn synthetic_emits_bounded_frame_count() {
        let mut t = SyntheticTransport::from_location("synthetic://?fps=100&frames=3").unwrap();
        t.open().await.unwrap();
        for _ in 0..3 {
            assert!(matches!(t.read().await, Ok(MediaPacket::Video { .. })));
        }
        assert!(matches!(t.read().await, Err(TransportError::EndOfStream)));
    }
}
