//! Per-source ingest task: transport lifecycle, decode loop, publication.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch, Notify};
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

use super::transport::stamp_frame;
use super::{
    AudioChunk, Frame, FrameRing, QualityLevel, SourceConfig, SourceKind, SourceState,
    TransportError, TransportFactory,
};
use crate::state::IngestConfig;

/// Base reconnect delay; doubles per attempt up to the configured cap.
const BACKOFF_BASE_MS: u64 = 500;

/// Runtime state for one source.
///
/// The ingest loop is the single writer for the ring buffer and the frame
/// broadcast; everything else reads.
pub struct SourceRuntime {
    config: RwLock<SourceConfig>,
    state_tx: watch::Sender<SourceState>,
    ring: FrameRing,
    frames_tx: broadcast::Sender<Frame>,
    audio_tx: broadcast::Sender<AudioChunk>,
    sequence: AtomicU64,
    decode_errors: AtomicU64,
    consecutive_decode_errors: AtomicU32,
    last_error: Mutex<Option<String>>,
    cancel: CancellationToken,
    /// Signals the decode loop to reopen the transport (quality switch).
    reopen: Notify,
}

impl SourceRuntime {
    pub(super) fn new(
        config: SourceConfig,
        ingest: &IngestConfig,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let ring_capacity = config.ring_capacity.unwrap_or(ingest.ring_capacity);
        let (frames_tx, _) = broadcast::channel(ingest.broadcast_capacity);
        let (audio_tx, _) = broadcast::channel(ingest.broadcast_capacity);
        let (state_tx, _) = watch::channel(SourceState::Init);
        Arc::new(Self {
            config: RwLock::new(config),
            state_tx,
            ring: FrameRing::new(ring_capacity),
            frames_tx,
            audio_tx,
            sequence: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            consecutive_decode_errors: AtomicU32::new(0),
            last_error: Mutex::new(None),
            cancel,
            reopen: Notify::new(),
        })
    }

    /// Source id.
    #[must_use]
    pub fn id(&self) -> String {
        self.config.read().id.clone()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SourceState {
        *self.state_tx.borrow()
    }

    /// Watch channel for state transitions.
    #[must_use]
    pub fn state_watch(&self) -> watch::Receiver<SourceState> {
        self.state_tx.subscribe()
    }

    /// Subscribes to decoded frames. Best-effort single-copy broadcast.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.frames_tx.subscribe()
    }

    /// Frame subscription as an async stream. Lag markers are dropped; a
    /// consumer that falls behind simply misses frames.
    pub fn subscribe_stream(&self) -> impl futures::Stream<Item = Frame> {
        use tokio_stream::StreamExt as _;
        tokio_stream::wrappers::BroadcastStream::new(self.subscribe()).filter_map(Result::ok)
    }

    /// Subscribes to the audio sidechannel.
    #[must_use]
    pub fn subscribe_audio(&self) -> broadcast::Receiver<AudioChunk> {
        self.audio_tx.subscribe()
    }

    /// Most recent buffered frame. Non-blocking; serves snapshot consumers.
    #[must_use]
    pub fn latest(&self) -> Option<Frame> {
        self.ring.latest()
    }

    /// Pre-event window query used by recording actions.
    #[must_use]
    pub fn buffer(&self, duration_ms: u64) -> Vec<Frame> {
        self.ring.window(duration_ms)
    }

    /// Frames evicted from the ring since start.
    #[must_use]
    pub fn frames_dropped(&self) -> u64 {
        self.ring.dropped()
    }

    /// Total decode errors since start.
    #[must_use]
    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    /// Last fatal or connection error message, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// Snapshot of the current configuration.
    #[must_use]
    pub fn config(&self) -> SourceConfig {
        self.config.read().clone()
    }

    /// Requests a different stream variant.
    ///
    /// The transport is reopened; previously buffered frames remain valid and
    /// subscribers experience a short gap.
    pub fn set_quality(&self, level: QualityLevel) {
        {
            let mut config = self.config.write();
            if config.quality == level {
                return;
            }
            config.quality = level;
        }
        log::info!(
            "[Source] {} switching quality to {:?}, reopening transport",
            self.id(),
            level
        );
        self.reopen.notify_one();
    }

    pub(super) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn set_state(&self, state: SourceState) {
        let previous = *self.state_tx.borrow();
        if previous != state {
            log::info!(
                "[Source] {}: {} -> {}",
                self.id(),
                previous.as_str(),
                state.as_str()
            );
            let _ = self.state_tx.send(state);
        }
    }

    fn record_error(&self, message: impl Into<String>) {
        *self.last_error.lock() = Some(message.into());
    }

    fn publish_frame(&self, width: u32, height: u32, channels: u8, pixels: bytes::Bytes) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let frame = stamp_frame(&self.config.read().id, sequence, width, height, channels, pixels);
        self.ring.push(frame.clone());
        // A send error only means no live subscribers.
        let _ = self.frames_tx.send(frame);
    }

    fn publish_audio(&self, samples: bytes::Bytes, sample_rate: u32, channels: u8, duration_ms: u64) {
        let chunk = AudioChunk {
            samples,
            sample_rate,
            channels,
            timestamp_ms: crate::utils::now_millis(),
            source_id: self.config.read().id.clone(),
            duration_ms,
        };
        let _ = self.audio_tx.send(chunk);
    }
}

/// Outcome of one connected streaming session.
enum SessionEnd {
    Cancelled,
    Reopen,
    Reconnect(String),
    EndOfStream,
    Fatal(String),
}

/// Drives one source to completion.
///
/// Owns the connect/read/reconnect loop; exits only into a terminal state
/// (`Stopped` or `Failed`), releasing the transport on every path.
pub(super) async fn run_source(
    runtime: Arc<SourceRuntime>,
    factory: Arc<dyn TransportFactory>,
    ingest: IngestConfig,
) {
    let id = runtime.id();
    let mut attempts: u32 = 0;

    loop {
        if runtime.cancel.is_cancelled() {
            runtime.set_state(SourceState::Stopped);
            return;
        }

        runtime.set_state(SourceState::Connecting);
        let config = runtime.config();
        let mut transport = match factory.open_transport(&config) {
            Ok(transport) => transport,
            Err(err) => {
                runtime.record_error(err.to_string());
                runtime.set_state(SourceState::Failed);
                log::error!("[Source] {id} transport creation failed: {err}");
                return;
            }
        };

        let opened = timeout(
            Duration::from_secs(ingest.connect_timeout_secs),
            transport.open(),
        )
        .await;

        match opened {
            Ok(Ok(())) => {}
            Ok(Err(err)) if err.is_fatal() => {
                runtime.record_error(err.to_string());
                runtime.set_state(SourceState::Failed);
                log::error!("[Source] {id} fatal connect error: {err}");
                transport.close().await;
                return;
            }
            Ok(Err(err)) => {
                transport.close().await;
                attempts += 1;
                if attempts > ingest.reconnect_max_retries {
                    runtime.record_error(format!("unreachable after {attempts} attempts: {err}"));
                    runtime.set_state(SourceState::Failed);
                    return;
                }
                runtime.set_state(SourceState::Reconnecting);
                if backoff_or_cancel(&runtime, attempts, &ingest).await {
                    runtime.set_state(SourceState::Stopped);
                    return;
                }
                continue;
            }
            Err(_elapsed) => {
                transport.close().await;
                attempts += 1;
                if attempts > ingest.reconnect_max_retries {
                    runtime.record_error(format!(
                        "connect timed out after {attempts} attempts"
                    ));
                    runtime.set_state(SourceState::Failed);
                    return;
                }
                runtime.set_state(SourceState::Reconnecting);
                if backoff_or_cancel(&runtime, attempts, &ingest).await {
                    runtime.set_state(SourceState::Stopped);
                    return;
                }
                continue;
            }
        }

        attempts = 0;
        runtime.consecutive_decode_errors.store(0, Ordering::Relaxed);
        runtime.set_state(SourceState::Streaming);

        let end = stream_session(&runtime, transport.as_mut(), &ingest).await;
        transport.close().await;

        match end {
            SessionEnd::Cancelled => {
                runtime.set_state(SourceState::Stopped);
                return;
            }
            SessionEnd::Reopen => {
                // Quality switch: reconnect immediately, no backoff.
                continue;
            }
            SessionEnd::EndOfStream => {
                // Finite media ends; only live transports reconnect.
                if matches!(
                    runtime.config().kind,
                    SourceKind::File | SourceKind::Synthetic
                ) {
                    runtime.set_state(SourceState::Stopped);
                    return;
                }
                runtime.set_state(SourceState::Reconnecting);
                attempts += 1;
                if attempts > ingest.reconnect_max_retries {
                    runtime.record_error("stream ended and reconnects exhausted".to_string());
                    runtime.set_state(SourceState::Failed);
                    return;
                }
                if backoff_or_cancel(&runtime, attempts, &ingest).await {
                    runtime.set_state(SourceState::Stopped);
                    return;
                }
            }
            SessionEnd::Reconnect(reason) => {
                log::warn!("[Source] {id} reconnecting: {reason}");
                runtime.set_state(SourceState::Reconnecting);
                attempts += 1;
                if attempts > ingest.reconnect_max_retries {
                    runtime.record_error(format!("unreachable after {attempts} attempts: {reason}"));
                    runtime.set_state(SourceState::Failed);
                    return;
                }
                if backoff_or_cancel(&runtime, attempts, &ingest).await {
                    runtime.set_state(SourceState::Stopped);
                    return;
                }
            }
            SessionEnd::Fatal(reason) => {
                runtime.record_error(reason.clone());
                runtime.set_state(SourceState::Failed);
                log::error!("[Source] {id} failed: {reason}");
                return;
            }
        }
    }
}

/// Runs the decode loop until the session ends.
async fn stream_session(
    runtime: &SourceRuntime,
    transport: &mut dyn super::FrameTransport,
    ingest: &IngestConfig,
) -> SessionEnd {
    loop {
        tokio::select! {
            () = runtime.cancel.cancelled() => return SessionEnd::Cancelled,
            () = runtime.reopen.notified() => return SessionEnd::Reopen,
            packet = transport.read() => match packet {
                Ok(super::MediaPacket::Video { width, height, channels, pixels }) => {
                    runtime.consecutive_decode_errors.store(0, Ordering::Relaxed);
                    runtime.publish_frame(width, height, channels, pixels);
                }
                Ok(super::MediaPacket::Audio { samples, sample_rate, channels, duration_ms }) => {
                    runtime.publish_audio(samples, sample_rate, channels, duration_ms);
                }
                Err(TransportError::EndOfStream) => return SessionEnd::EndOfStream,
                Err(err) if err.is_fatal() => return SessionEnd::Fatal(err.to_string()),
                Err(err) => {
                    runtime.decode_errors.fetch_add(1, Ordering::Relaxed);
                    let streak = runtime
                        .consecutive_decode_errors
                        .fetch_add(1, Ordering::Relaxed)
                        + 1;
                    log::debug!(
                        "[Source] {} decode error ({streak} consecutive): {err}",
                        runtime.id()
                    );
                    if streak >= ingest.decode_error_threshold {
                        return SessionEnd::Reconnect(format!(
                            "{streak} consecutive decode errors"
                        ));
                    }
                }
            }
        }
    }
}

/// Sleeps the exponential backoff for `attempt`. Returns true when cancelled.
async fn backoff_or_cancel(
    runtime: &SourceRuntime,
    attempt: u32,
    ingest: &IngestConfig,
) -> bool {
    let exp = BACKOFF_BASE_MS.saturating_mul(1u64 << attempt.min(16).saturating_sub(1));
    let delay = exp.min(ingest.reconnect_max_backoff_secs * 1_000);
    log::info!(
        "[Source] {} backing off {delay}ms before attempt {attempt}",
        runtime.id()
    );
    tokio::select! {
        () = runtime.cancel.cancelled() => true,
        () = tokio::time::sleep(Duration::from_millis(delay)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SyntheticTransportFactory;

    fn synthetic_config(id: &str, location: &str) -> SourceConfig {
        SourceConfig {
            id: id.to_string(),
            kind: SourceKind::Synthetic,
            location: location.to_string(),
            quality: QualityLevel::Med,
            target_fps: 10,
            ring_capacity: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_synthetic_source_runs_to_stopped() {
        let ingest = IngestConfig::default();
        let runtime = SourceRuntime::new(
            synthetic_config("cam-a", "synthetic://?fps=100&frames=4"),
            &ingest,
            CancellationToken::new(),
        );
        let mut rx = runtime.subscribe();

        let task = tokio::spawn(run_source(
            Arc::clone(&runtime),
            Arc::new(SyntheticTransportFactory),
            ingest,
        ));
        task.await.unwrap();

        let mut received = 0;
        while let Ok(frame) = rx.try_recv() {
            assert_eq!(frame.source_id(), "cam-a");
            received += 1;
        }
        assert_eq!(received, 4);
        assert_eq!(runtime.state(), SourceState::Stopped);
        assert_eq!(runtime.latest().unwrap().sequence(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_location_fails_terminally() {
        let ingest = IngestConfig::default();
        let runtime = SourceRuntime::new(
            synthetic_config("cam-b", "synthetic://?bogus=1"),
            &ingest,
            CancellationToken::new(),
        );
        run_source(
            Arc::clone(&runtime),
            Arc::new(SyntheticTransportFactory),
            ingest,
        )
        .await;

        assert_eq!(runtime.state(), SourceState::Failed);
        assert!(runtime.last_error().unwrap().contains("bogus"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_streaming_source() {
        let ingest = IngestConfig::default();
        let cancel = CancellationToken::new();
        let runtime = SourceRuntime::new(
            synthetic_config("cam-c", "synthetic://?fps=50"),
            &ingest,
            cancel.clone(),
        );
        let task = tokio::spawn(run_source(
            Arc::clone(&runtime),
            Arc::new(SyntheticTransportFactory),
            ingest,
        ));

        let mut rx = runtime.subscribe();
        // Wait until at least one frame flows, then cancel.
        let _ = rx.recv().await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(runtime.state(), SourceState::Stopped);
    }
}
