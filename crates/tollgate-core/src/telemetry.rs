//! Audit telemetry contract.
//!
//! Every decision the proxy makes is written as an [`AuditRecord`]; a
//! forward that then fails at the origin adds an `upstream_error` record.
//! Records always carry the same fields, whatever path produced them, so the
//! collector never has to cope with schema drift.
//!
//! Sinks are fire-and-forget: [`TelemetrySink::log_event`] must return
//! immediately and must never fail the caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::inspection::{InspectionAction, InspectionResult, Severity};

/// Outcome recorded for a request or connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordAction {
    /// Inspected and allowed.
    Allow,
    /// Inspected, findings reported, forwarded.
    Warn,
    /// Inspected, engine suggested redaction, forwarded unchanged.
    Redact,
    /// Inspected and blocked, or a BLOCK verdict observed without enforcement.
    Block,
    /// Inspection failed or timed out and the request was forwarded.
    Bypass,
    /// Not eligible for inspection (method, empty body, attachments off).
    Skipped,
    /// Body too large to inspect; streamed to the origin.
    SizeLimit,
    /// Body over the hard ceiling; answered with 413.
    Rejected,
    /// Inspection failed and fail-closed answered with 503.
    Unavailable,
    /// Connection recorded without content access.
    Metadata,
    /// The origin could not be reached or timed out.
    UpstreamError,
}

impl RecordAction {
    /// Returns the action as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Warn => "warn",
            Self::Redact => "redact",
            Self::Block => "block",
            Self::Bypass => "bypass",
            Self::Skipped => "skipped",
            Self::SizeLimit => "size_limit",
            Self::Rejected => "rejected",
            Self::Unavailable => "unavailable",
            Self::Metadata => "metadata",
            Self::UpstreamError => "upstream_error",
        }
    }
}

impl From<InspectionAction> for RecordAction {
    fn from(action: InspectionAction) -> Self {
        match action {
            InspectionAction::Allow => Self::Allow,
            InspectionAction::Warn => Self::Warn,
            InspectionAction::Redact => Self::Redact,
            InspectionAction::Block => Self::Block,
        }
    }
}

impl std::fmt::Display for RecordAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One audit event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    /// When the decision was made.
    pub timestamp: DateTime<Utc>,
    /// Request id, or connection id for connection-level records.
    pub request_id: String,
    /// Destination host.
    pub hostname: String,
    /// HTTP method, empty for connection-level records.
    pub method: String,
    /// Request path, empty for connection-level records.
    pub path: String,
    /// Declared body size in bytes.
    pub body_size: u64,
    /// Inspection result, if inspection ran and succeeded.
    pub inspection: Option<InspectionResult>,
    /// What happened.
    pub action: RecordAction,
    /// Severity derived from the risk score.
    pub severity: Severity,
    /// Whether the client was denied.
    pub blocked: bool,
    /// Free-form detail.
    pub reason: Option<String>,
}

impl AuditRecord {
    /// Creates a request-level record.
    pub fn request(
        request_id: impl Into<String>,
        hostname: impl Into<String>,
        method: impl Into<String>,
        path: impl Into<String>,
        body_size: u64,
        action: RecordAction,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            request_id: request_id.into(),
            hostname: hostname.into(),
            method: method.into(),
            path: path.into(),
            body_size,
            inspection: None,
            action,
            severity: Severity::Low,
            blocked: false,
            reason: None,
        }
    }

    /// Creates a connection-level record (metadata-only routing).
    pub fn connection(connection_id: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self::request(
            connection_id,
            hostname,
            String::new(),
            String::new(),
            0,
            RecordAction::Metadata,
        )
    }

    /// Attaches an inspection result and derives the severity from it.
    pub fn with_inspection(mut self, inspection: Option<InspectionResult>) -> Self {
        self.severity = Severity::of(inspection.as_ref());
        self.inspection = inspection;
        self
    }

    /// Marks the record as blocked.
    pub fn blocked(mut self) -> Self {
        self.blocked = true;
        self
    }

    /// Sets the reason.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Receives audit records.
pub trait TelemetrySink: Send + Sync {
    /// Records an event without blocking the caller.
    fn log_event(&self, record: AuditRecord);
}

/// Sink that writes records to the tracing log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn log_event(&self, record: AuditRecord) {
        tracing::info!(
            target: "tollgate::audit",
            request_id = %record.request_id,
            host = %record.hostname,
            method = %record.method,
            path = %record.path,
            body_size = record.body_size,
            action = %record.action,
            severity = %record.severity,
            blocked = record.blocked,
            risk_score = record.inspection.as_ref().map(|i| i.risk_score),
            reason = record.reason.as_deref(),
            "audit"
        );
    }
}

/// Default capacity of the [`HttpTelemetry`] delivery queue.
pub const DEFAULT_TELEMETRY_QUEUE: usize = 4096;

/// Default timeout for a single audit record POST.
pub const DEFAULT_TELEMETRY_TIMEOUT: Duration = Duration::from_secs(5);

/// Sink that posts records to an HTTP collector from a background task.
///
/// Records are queued on a bounded channel so `log_event` never waits. When
/// the collector falls behind and the queue is full, new records are dropped
/// and counted.
#[derive(Debug, Clone)]
pub struct HttpTelemetry {
    tx: mpsc::Sender<AuditRecord>,
    dropped: Arc<AtomicU64>,
}

impl HttpTelemetry {
    /// Creates the sink with default queue and timeout and spawns its
    /// delivery task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(url: impl Into<String>) -> Self {
        Self::spawn_with(url, DEFAULT_TELEMETRY_QUEUE, DEFAULT_TELEMETRY_TIMEOUT)
    }

    /// Creates the sink with an explicit queue capacity and per-POST timeout.
    pub fn spawn_with(url: impl Into<String>, queue_capacity: usize, timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        tokio::spawn(deliver(reqwest::Client::new(), url.into(), timeout, rx));
        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Records dropped because the queue was full or the task had stopped.
    pub fn dropped_records(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl TelemetrySink for HttpTelemetry {
    fn log_event(&self, record: AuditRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(request_id = %record.request_id, "Telemetry queue full, dropping audit record");
            }
            Err(TrySendError::Closed(record)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    request_id = %record.request_id,
                    "Telemetry delivery task has stopped, dropping audit record"
                );
            }
        }
    }
}

async fn deliver(
    client: reqwest::Client,
    url: String,
    timeout: Duration,
    mut rx: mpsc::Receiver<AuditRecord>,
) {
    while let Some(record) = rx.recv().await {
        match client.post(&url).json(&record).timeout(timeout).send().await {
            Ok(resp) if !resp.status().is_success() => {
                tracing::warn!(
                    status = resp.status().as_u16(),
                    request_id = %record.request_id,
                    "Telemetry collector rejected audit record"
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(request_id = %record.request_id, "Failed to deliver audit record: {}", e);
            }
        }
    }
}
