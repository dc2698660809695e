//! Action execution: the closed action set with retries and timeouts.
//!
//! Action nodes are fire-and-forget from the graph's perspective; delivery
//! runs in the action node's own worker with a per-action retry policy and
//! deadline. Webhooks go through the shared HTTP client; email goes through
//! a pluggable transport (credential handling is a deployment concern).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::time::Duration;
use uuid::Uuid;

use crate::correlator::{Correlator, EventDraft};
use crate::persist::{Persistence, SnapshotKind, SnapshotRecord};
use crate::source::SourceRegistry;
use crate::state::WorkflowConfig;
use crate::utils::now_millis;

/// Retry backoff: doubles from half a second, capped by the attempt budget.
const RETRY_BASE_MS: u64 = 500;

/// Errors from action delivery.
#[derive(Debug, Error)]
pub enum ActionError {
    /// Misconfigured action (should have been caught at validation).
    #[error("action config invalid: {0}")]
    Config(String),

    /// Delivery failed; retried until the budget is exhausted.
    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// Parsed action node config.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ActionSpec {
    #[serde(rename_all = "camelCase")]
    Email {
        to: String,
        #[serde(default)]
        cc: Vec<String>,
        #[serde(default)]
        subject: Option<String>,
        #[serde(default)]
        include_snapshot: bool,
        #[serde(default)]
        include_detections: bool,
    },
    #[serde(rename_all = "camelCase")]
    Webhook {
        url: String,
        #[serde(default)]
        method: Option<String>,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        timeout_sec: Option<u64>,
        #[serde(default)]
        retries: Option<u32>,
        #[serde(default)]
        secret_key: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Record {
        #[serde(default)]
        duration_sec: Option<u64>,
        #[serde(default)]
        pre_buffer_sec: Option<u64>,
        #[serde(default)]
        post_buffer_sec: Option<u64>,
        #[serde(default)]
        format: Option<String>,
        #[serde(default)]
        quality: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Alert {
        severity: String,
        #[serde(default)]
        notify: Vec<String>,
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Snapshot {
        #[serde(default)]
        draw_boxes: bool,
        #[serde(default)]
        draw_zones: bool,
        #[serde(default)]
        format: Option<String>,
        #[serde(default)]
        quality: Option<u32>,
    },
    #[serde(rename_all = "camelCase")]
    Log {
        #[serde(default)]
        label: Option<String>,
    },
}

impl ActionSpec {
    /// Parses an action node's merged config.
    pub fn parse(config: &serde_json::Value) -> Result<Self, ActionError> {
        serde_json::from_value(config.clone()).map_err(|e| ActionError::Config(e.to_string()))
    }

    /// Per-action retry budget, falling back to the runtime default.
    fn retries(&self, defaults: &WorkflowConfig) -> u32 {
        match self {
            Self::Webhook { retries: Some(r), .. } => *r,
            _ => defaults.action_retries,
        }
    }

    /// Per-attempt delivery deadline.
    fn timeout(&self, defaults: &WorkflowConfig) -> Duration {
        match self {
            Self::Webhook {
                timeout_sec: Some(t),
                ..
            } => Duration::from_secs(*t),
            _ => Duration::from_secs(defaults.action_timeout_secs),
        }
    }
}

/// What triggered an action.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub workflow_id: String,
    pub node_id: String,
    /// Source the trigger came from, when derivable.
    pub source_id: Option<String>,
    /// Alarm the trigger is associated with, if known.
    pub alarm_id: Option<String>,
    /// Observability projection of the triggering payload.
    pub payload: serde_json::Value,
    pub observed_at: u64,
    /// Detection confidence carried by the trigger.
    pub confidence: f32,
    pub count: Option<u32>,
    pub label: Option<String>,
}

/// Pluggable email delivery.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send(
        &self,
        to: &str,
        cc: &[String],
        subject: &str,
        body: &str,
    ) -> Result<(), ActionError>;
}

/// Default transport: logs the message. Real relays (SMTP, provider APIs)
/// live behind credential stores outside the core.
pub struct LoggingEmailTransport;

#[async_trait]
impl EmailTransport for LoggingEmailTransport {
    async fn send(
        &self,
        to: &str,
        cc: &[String],
        subject: &str,
        _body: &str,
    ) -> Result<(), ActionError> {
        log::info!("[Action] email to={to} cc={cc:?} subject={subject:?} (logging transport)");
        Ok(())
    }
}

/// Executes actions with retry, backoff, and deadlines.
pub struct ActionRunner {
    http: reqwest::Client,
    sources: Arc<SourceRegistry>,
    persistence: Arc<dyn Persistence>,
    correlator: Arc<Correlator>,
    email: Arc<dyn EmailTransport>,
    defaults: WorkflowConfig,
}

impl ActionRunner {
    #[must_use]
    pub fn new(
        http: reqwest::Client,
        sources: Arc<SourceRegistry>,
        persistence: Arc<dyn Persistence>,
        correlator: Arc<Correlator>,
        email: Arc<dyn EmailTransport>,
        defaults: WorkflowConfig,
    ) -> Self {
        Self {
            http,
            sources,
            persistence,
            correlator,
            email,
            defaults,
        }
    }

    /// Delivers with the action's retry policy.
    ///
    /// # Errors
    ///
    /// `Delivery` after the retry budget is exhausted; `Config` immediately
    /// for unusable specs.
    pub async fn deliver(&self, spec: &ActionSpec, ctx: &ActionContext) -> Result<(), ActionError> {
        let budget = spec.retries(&self.defaults);
        let deadline = spec.timeout(&self.defaults);

        let mut last_error = None;
        for attempt in 0..=budget {
            if attempt > 0 {
                let delay = RETRY_BASE_MS << (attempt - 1).min(6);
                log::info!(
                    "[Action] retrying {}/{} (attempt {}/{}) after {delay}ms",
                    ctx.workflow_id,
                    ctx.node_id,
                    attempt + 1,
                    budget + 1
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }

            let result = tokio::time::timeout(deadline, self.deliver_once(spec, ctx)).await;
            match result {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(err @ ActionError::Config(_))) => return Err(err),
                Ok(Err(err)) => {
                    log::warn!("[Action] {}/{} failed: {err}", ctx.workflow_id, ctx.node_id);
                    last_error = Some(err);
                }
                Err(_elapsed) => {
                    log::warn!(
                        "[Action] {}/{} timed out after {deadline:?}",
                        ctx.workflow_id,
                        ctx.node_id
                    );
                    last_error = Some(ActionError::Delivery(format!(
                        "timed out after {deadline:?}"
                    )));
                }
            }
        }
        Err(last_error.unwrap_or_else(|| ActionError::Delivery("exhausted retries".into())))
    }

    async fn deliver_once(
        &self,
        spec: &ActionSpec,
        ctx: &ActionContext,
    ) -> Result<(), ActionError> {
        match spec {
            ActionSpec::Email {
                to,
                cc,
                subject,
                include_detections,
                ..
            } => {
                let subject = subject
                    .clone()
                    .unwrap_or_else(|| format!("Overwatch alert from {}", ctx.workflow_id));
                let body = if *include_detections {
                    serde_json::to_string_pretty(&ctx.payload).unwrap_or_default()
                } else {
                    format!("Triggered by {}/{}", ctx.workflow_id, ctx.node_id)
                };
                self.email.send(to, cc, &subject, &body).await
            }

            ActionSpec::Webhook {
                url,
                method,
                headers,
                secret_key,
                ..
            } => {
                let body = serde_json::json!({
                    "workflowId": ctx.workflow_id,
                    "nodeId": ctx.node_id,
                    "timestamp": now_millis(),
                    "payload": ctx.payload,
                });
                let body_bytes =
                    serde_json::to_vec(&body).map_err(|e| ActionError::Config(e.to_string()))?;

                let mut request = match method.as_deref() {
                    Some("PUT") => self.http.put(url),
                    _ => self.http.post(url),
                };
                for (name, value) in headers {
                    request = request.header(name, value);
                }
                if let Some(secret) = secret_key {
                    let mut hasher = Sha256::new();
                    hasher.update(secret.as_bytes());
                    hasher.update(&body_bytes);
                    request =
                        request.header("X-Overwatch-Signature", hex::encode(hasher.finalize()));
                }

                let response = request
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(body_bytes)
                    .send()
                    .await
                    .map_err(|e| ActionError::Delivery(e.to_string()))?;
                if !response.status().is_success() {
                    return Err(ActionError::Delivery(format!(
                        "webhook returned {}",
                        response.status()
                    )));
                }
                Ok(())
            }

            ActionSpec::Record {
                duration_sec,
                pre_buffer_sec,
                format,
                ..
            } => {
                let source_id = ctx
                    .source_id
                    .as_deref()
                    .ok_or_else(|| ActionError::Config("record needs a source context".into()))?;
                let window_ms =
                    (pre_buffer_sec.unwrap_or(5) + duration_sec.unwrap_or(30)) * 1_000;
                let frames = self
                    .sources
                    .buffer(source_id, window_ms)
                    .map_err(|e| ActionError::Delivery(e.to_string()))?;
                if frames.is_empty() {
                    return Err(ActionError::Delivery(format!(
                        "no buffered frames on {source_id}"
                    )));
                }

                let mut payload = BytesMut::new();
                for frame in &frames {
                    payload.extend_from_slice(frame.pixels());
                }
                let record = SnapshotRecord {
                    id: Uuid::new_v4().to_string(),
                    alarm_id: ctx.alarm_id.clone(),
                    source_id: source_id.to_string(),
                    timestamp_ms: now_millis(),
                    kind: SnapshotKind::Recording,
                    format: format.clone().unwrap_or_else(|| "mp4".into()),
                    frame_count: frames.len() as u32,
                    byte_size: payload.len() as u64,
                };
                self.persistence
                    .save_snapshot(&record, payload.freeze())
                    .map_err(|e| ActionError::Delivery(e.to_string()))
            }

            ActionSpec::Alert {
                severity,
                notify,
                message,
            } => {
                let device_id = ctx
                    .source_id
                    .clone()
                    .unwrap_or_else(|| format!("{}/{}", ctx.workflow_id, ctx.node_id));
                let draft = EventDraft {
                    device_id,
                    kind: ctx
                        .label
                        .clone()
                        .unwrap_or_else(|| "alert".to_string()),
                    observed_at: ctx.observed_at,
                    confidence: ctx.confidence,
                    count: ctx.count,
                    label: message.clone(),
                    severity: Some(severity.clone()),
                    snapshot: None,
                    clip: None,
                };
                let alarm = self
                    .correlator
                    .ingest_draft(draft)
                    .map_err(|e| ActionError::Delivery(e.to_string()))?;
                if !notify.is_empty() {
                    log::info!(
                        "[Action] alarm {} raised, notify {notify:?}",
                        alarm.id
                    );
                }
                Ok(())
            }

            ActionSpec::Snapshot { format, .. } => {
                let source_id = ctx
                    .source_id
                    .as_deref()
                    .ok_or_else(|| ActionError::Config("snapshot needs a source context".into()))?;
                let frame = self
                    .sources
                    .latest(source_id)
                    .map_err(|e| ActionError::Delivery(e.to_string()))?
                    .ok_or_else(|| {
                        ActionError::Delivery(format!("no frame buffered on {source_id}"))
                    })?;
                let record = SnapshotRecord {
                    id: Uuid::new_v4().to_string(),
                    alarm_id: ctx.alarm_id.clone(),
                    source_id: source_id.to_string(),
                    timestamp_ms: frame.timestamp_ms(),
                    kind: SnapshotKind::Snapshot,
                    format: format.clone().unwrap_or_else(|| "jpg".into()),
                    frame_count: 1,
                    byte_size: frame.pixels().len() as u64,
                };
                self.persistence
                    .save_snapshot(&record, frame.pixels().clone())
                    .map_err(|e| ActionError::Delivery(e.to_string()))
            }

            ActionSpec::Log { label } => {
                log::info!(
                    "[Action] {} {}/{}: {}",
                    label.as_deref().unwrap_or("event"),
                    ctx.workflow_id,
                    ctx.node_id,
                    ctx.payload
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn action_specs_parse_from_validated_configs() {
        let webhook = ActionSpec::parse(&json!({
            "action": "webhook", "url": "https://hooks.example.com/x",
            "method": "PUT", "timeoutSec": 30, "retries": 2, "secretKey": "k"
        }))
        .unwrap();
        assert!(matches!(webhook, ActionSpec::Webhook { .. }));

        let email = ActionSpec::parse(&json!({
            "action": "email", "to": "ops@example.com", "includeDetections": true
        }))
        .unwrap();
        assert!(matches!(email, ActionSpec::Email { .. }));

        let log = ActionSpec::parse(&json!({"action": "log"})).unwrap();
        assert!(matches!(log, ActionSpec::Log { .. }));
    }

    #[test]
    fn webhook_overrides_retry_budget() {
        let defaults = WorkflowConfig::default();
        let spec = ActionSpec::parse(&json!({
            "action": "webhook", "url": "https://h.example.com", "retries": 0
        }))
        .unwrap();
        assert_eq!(spec.retries(&defaults), 0);

        let email = ActionSpec::parse(&json!({"action": "email", "to": "a@b.co"})).unwrap();
        assert_eq!(email.retries(&defaults), defaults.action_retries);
    }
}
