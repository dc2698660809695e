//! JSON file-backed persistence.
//!
//! Layout under the data directory:
//!
//! ```text
//! workflows/<id>_v<version>.json    one file per stored version
//! alarms/<id>.json                  overwritten on every mutation
//! events/events.jsonl               append-only, batched writes
//! snapshots/<id>.json + <id>.bin    index entry + payload
//! ```
//!
//! All JSON writes use temp-file-plus-rename so a crash never leaves a
//! half-written document. Alarm writes happen on the caller's thread
//! (synchronous, ordered with history); events flow through a bounded
//! channel to a batching writer task.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::{AlarmIndex, MemoryPersistence, Persistence, SnapshotRecord};
use crate::alarm::Alarm;
use crate::correlator::RawEvent;
use crate::error::{OverwatchError, OverwatchResult};
use crate::graph::WorkflowDoc;
use crate::runtime::{TaskSpawner, TokioSpawner};

/// Events buffered before the writer forces a batch out.
const EVENT_BATCH_SIZE: usize = 64;

/// Longest an event sits buffered before a time-based flush.
const EVENT_FLUSH_INTERVAL_SECS: u64 = 2;

enum WriterMsg {
    Event(Box<RawEvent>),
    Flush(oneshot::Sender<()>),
}

/// Durable JSON store with an in-memory read mirror.
pub struct JsonPersistence {
    dir: PathBuf,
    mirror: MemoryPersistence,
    events_tx: mpsc::Sender<WriterMsg>,
}

impl JsonPersistence {
    /// Opens (or creates) a store under `dir`, loading existing state into
    /// the read mirror and starting the event writer task.
    ///
    /// # Errors
    ///
    /// `Internal` when the directory layout cannot be created or existing
    /// files fail to parse.
    pub fn open(
        dir: impl Into<PathBuf>,
        cancel: CancellationToken,
        spawner: &TokioSpawner,
    ) -> OverwatchResult<Self> {
        let dir = dir.into();
        for sub in ["workflows", "alarms", "events", "snapshots"] {
            fs::create_dir_all(dir.join(sub))?;
        }

        let mirror = MemoryPersistence::new();
        load_existing(&dir, &mirror)?;

        let (events_tx, events_rx) = mpsc::channel(1024);
        let events_path = dir.join("events").join("events.jsonl");
        spawner.spawn(event_writer(events_path, events_rx, cancel));

        Ok(Self {
            dir,
            mirror,
            events_tx,
        })
    }

    fn workflow_path(&self, id: &str, version: u32) -> PathBuf {
        self.dir
            .join("workflows")
            .join(format!("{}_v{version}.json", sanitize(id)))
    }

    fn alarm_path(&self, id: &str) -> PathBuf {
        self.dir.join("alarms").join(format!("{}.json", sanitize(id)))
    }

    fn snapshot_paths(&self, id: &str) -> (PathBuf, PathBuf) {
        let base = self.dir.join("snapshots");
        (
            base.join(format!("{}.json", sanitize(id))),
            base.join(format!("{}.bin", sanitize(id))),
        )
    }
}

#[async_trait]
impl Persistence for JsonPersistence {
    fn save_workflow(&self, doc: &WorkflowDoc) -> OverwatchResult<()> {
        write_json_atomic(&self.workflow_path(&doc.id, doc.version), doc)?;
        self.mirror.save_workflow(doc)
    }

    fn load_workflow(
        &self,
        id: &str,
        version: Option<u32>,
    ) -> OverwatchResult<Option<WorkflowDoc>> {
        self.mirror.load_workflow(id, version)
    }

    fn latest_workflows(&self) -> OverwatchResult<Vec<WorkflowDoc>> {
        self.mirror.latest_workflows()
    }

    fn workflow_versions(&self, id: &str) -> OverwatchResult<Vec<u32>> {
        self.mirror.workflow_versions(id)
    }

    fn save_alarm(&self, alarm: &Alarm) -> OverwatchResult<()> {
        write_json_atomic(&self.alarm_path(&alarm.id), alarm)?;
        self.mirror.save_alarm(alarm)
    }

    fn load_alarms(&self) -> OverwatchResult<Vec<Alarm>> {
        self.mirror.load_alarms()
    }

    fn alarms_by_index(&self, index: AlarmIndex<'_>) -> OverwatchResult<Vec<String>> {
        self.mirror.alarms_by_index(index)
    }

    fn append_event(&self, event: &RawEvent) -> OverwatchResult<()> {
        self.mirror.append_event(event)?;
        // Best-effort: a full buffer drops the durable copy, surfaced in logs;
        // the in-memory mirror still has the event.
        if self
            .events_tx
            .try_send(WriterMsg::Event(Box::new(event.clone())))
            .is_err()
        {
            log::warn!("[Persist] event buffer full, durable write dropped for {}", event.id);
        }
        Ok(())
    }

    fn load_events(&self, ids: &[String]) -> OverwatchResult<Vec<RawEvent>> {
        self.mirror.load_events(ids)
    }

    fn save_snapshot(&self, record: &SnapshotRecord, payload: Bytes) -> OverwatchResult<()> {
        let (meta_path, bin_path) = self.snapshot_paths(&record.id);
        fs::write(&bin_path, &payload)?;
        write_json_atomic(&meta_path, record)?;
        self.mirror.save_snapshot(record, payload)
    }

    fn snapshots_for(&self, alarm_id: &str) -> OverwatchResult<Vec<SnapshotRecord>> {
        self.mirror.snapshots_for(alarm_id)
    }

    async fn flush(&self) -> OverwatchResult<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.events_tx.send(WriterMsg::Flush(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
        Ok(())
    }
}

/// Batching writer for the append-only event log.
async fn event_writer(
    path: PathBuf,
    mut rx: mpsc::Receiver<WriterMsg>,
    cancel: CancellationToken,
) {
    let mut pending: Vec<RawEvent> = Vec::with_capacity(EVENT_BATCH_SIZE);
    let mut ticker =
        tokio::time::interval(std::time::Duration::from_secs(EVENT_FLUSH_INTERVAL_SECS));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                write_batch(&path, &mut pending);
                return;
            }
            _ = ticker.tick() => write_batch(&path, &mut pending),
            msg = rx.recv() => match msg {
                Some(WriterMsg::Event(event)) => {
                    pending.push(*event);
                    if pending.len() >= EVENT_BATCH_SIZE {
                        write_batch(&path, &mut pending);
                    }
                }
                Some(WriterMsg::Flush(ack)) => {
                    write_batch(&path, &mut pending);
                    let _ = ack.send(());
                }
                None => {
                    write_batch(&path, &mut pending);
                    return;
                }
            }
        }
    }
}

fn write_batch(path: &Path, pending: &mut Vec<RawEvent>) {
    if pending.is_empty() {
        return;
    }
    let result = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| {
            for event in pending.iter() {
                match serde_json::to_string(event) {
                    Ok(line) => writeln!(file, "{line}")?,
                    Err(err) => log::error!("[Persist] event serialize failed: {err}"),
                }
            }
            Ok(())
        });
    if let Err(err) = result {
        log::error!("[Persist] event batch write failed: {err}");
    }
    pending.clear();
}

/// Atomic write: temp file then rename.
fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> OverwatchResult<()> {
    let contents = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn load_existing(dir: &Path, mirror: &MemoryPersistence) -> OverwatchResult<()> {
    for entry in fs::read_dir(dir.join("workflows"))? {
        let path = entry?.path();
        if path.extension().is_some_and(|e| e == "json") {
            let doc: WorkflowDoc = parse_file(&path)?;
            mirror.save_workflow(&doc)?;
        }
    }
    for entry in fs::read_dir(dir.join("alarms"))? {
        let path = entry?.path();
        if path.extension().is_some_and(|e| e == "json") {
            let alarm: Alarm = parse_file(&path)?;
            mirror.save_alarm(&alarm)?;
        }
    }
    let events_path = dir.join("events").join("events.jsonl");
    if events_path.exists() {
        for line in fs::read_to_string(&events_path)?.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RawEvent>(line) {
                Ok(event) => mirror.append_event(&event)?,
                Err(err) => log::warn!("[Persist] skipping corrupt event line: {err}"),
            }
        }
    }
    for entry in fs::read_dir(dir.join("snapshots"))? {
        let path = entry?.path();
        if path.extension().is_some_and(|e| e == "json") {
            let record: SnapshotRecord = parse_file(&path)?;
            let payload = fs::read(path.with_extension("bin"))
                .map(Bytes::from)
                .unwrap_or_default();
            mirror.save_snapshot(&record, payload)?;
        }
    }
    Ok(())
}

fn parse_file<T: serde::de::DeserializeOwned>(path: &Path) -> OverwatchResult<T> {
    let contents = fs::read_to_string(path)?;
    serde_json::from_str(&contents).map_err(|err| {
        OverwatchError::Internal(format!("corrupt store file {}: {err}", path.display()))
    })
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::{AlarmState, Severity};
    use serde_json::json;

    fn sample_workflow() -> WorkflowDoc {
        serde_json::from_value(json!({
            "id": "wf", "name": "w", "version": 1, "schemaVersion": 2,
            "nodes": [], "edges": []
        }))
        .unwrap()
    }

    fn sample_alarm() -> Alarm {
        Alarm {
            id: "a1".into(),
            group_key: "t:s:gate:person".into(),
            severity: Severity::Major,
            state: AlarmState::New,
            created_at: 1,
            updated_at: 1,
            sla_deadline: None,
            confidence: 0.9,
            correlated_event_ids: vec![],
            assignee: None,
            runbook_id: None,
            escalation_policy: None,
            watchers: vec![],
            notes: vec![],
            history: vec![],
            tenant: "t".into(),
            site: "s".into(),
            snooze_seq: 0,
            sla_breached: false,
        }
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        {
            let store =
                JsonPersistence::open(dir.path(), cancel.clone(), &TokioSpawner::current())
                    .unwrap();
            store.save_workflow(&sample_workflow()).unwrap();
            store.save_alarm(&sample_alarm()).unwrap();
            store
                .append_event(&RawEvent::test_event("ev-1", "t", "s", "gate", "person"))
                .unwrap();
            store.flush().await.unwrap();
        }
        cancel.cancel();

        let store =
            JsonPersistence::open(dir.path(), CancellationToken::new(), &TokioSpawner::current())
                .unwrap();
        assert_eq!(store.latest_workflows().unwrap().len(), 1);
        assert_eq!(store.load_alarms().unwrap().len(), 1);
        assert_eq!(
            store.load_events(&["ev-1".to_string()]).unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn snapshot_payload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            JsonPersistence::open(dir.path(), CancellationToken::new(), &TokioSpawner::current())
                .unwrap();
        let record = SnapshotRecord {
            id: "snap-1".into(),
            alarm_id: Some("a1".into()),
            source_id: "cam".into(),
            timestamp_ms: 42,
            kind: super::super::SnapshotKind::Snapshot,
            format: "jpg".into(),
            frame_count: 1,
            byte_size: 3,
        };
        store
            .save_snapshot(&record, Bytes::from_static(b"abc"))
            .unwrap();

        let store =
            JsonPersistence::open(dir.path(), CancellationToken::new(), &TokioSpawner::current())
                .unwrap();
        let records = store.snapshots_for("a1").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].byte_size, 3);
    }
}
