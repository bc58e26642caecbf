//! Inspection and forwarding pipeline.
//!
//! Processes each intercepted request: inspects it, records the decision,
//! enforces the block policy and forwards to the origin.
//!
//! ```text
//! Request ─► eligible? ─► inspect (timeout) ─► audit ─► BLOCK + enforcement? ─► 403
//!                │              │ error                        │ no
//!                │ no           ├─ fail open ─► bypass ────────┤
//!                ▼              └─ fail closed ─► 503          ▼
//!             skipped ─────────────────────────────────► forward ─► relay response
//! ```
//!
//! Large multipart bodies skip inspection and stream to the origin while
//! they arrive. Bodies above the hard ceiling are answered with 413 and
//! never forwarded.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use hyper::body::Incoming;
use hyper::Response;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use tollgate_core::{
    service_name, AuditRecord, DomainPolicy, InspectionAction, InspectionContext,
    InspectionError, InspectionResult, Inspector, PolicySnapshot, RecordAction,
    SettingsSource, TelemetrySink,
};

use crate::ca::CertificateAuthority;
use crate::connect::ConnectTarget;
use crate::error::{ProxyError, UpstreamError};
use crate::guards::Limits;
use crate::parser::{ParsedRequest, RequestHead};
use crate::responses::{self, SyntheticResponse};
use crate::upstream::{build_request, channel_body, full_body, relay_response, Upstream};

/// Chunks buffered between the client reader and a streaming upstream body.
const STREAM_CHANNEL_CAPACITY: usize = 8;

const SIZE_LIMIT_REASON: &str = "size limit, inspection skipped";

/// External collaborators used by the pipeline.
#[derive(Clone)]
pub struct HandlerConfig {
    /// The DLP engine.
    pub inspector: Arc<dyn Inspector>,
    /// Where audit records go.
    pub telemetry: Arc<dyn TelemetrySink>,
    /// Where policy snapshots come from.
    pub settings: Arc<dyn SettingsSource>,
    /// Outbound client for origin servers.
    pub upstream: Arc<dyn Upstream>,
}

impl std::fmt::Debug for HandlerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerConfig")
            .field("inspector", &"dyn Inspector")
            .field("telemetry", &"dyn TelemetrySink")
            .field("settings", &"dyn SettingsSource")
            .field("upstream", &"dyn Upstream")
            .finish()
    }
}

/// Connection counters shown on the status page.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    total: AtomicU64,
    active: AtomicU64,
}

impl ConnectionStats {
    /// Registers a new connection and returns its id.
    pub fn open(self: &Arc<Self>) -> ConnectionGuard {
        let id = self.total.fetch_add(1, Ordering::Relaxed) + 1;
        self.active.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            id,
            stats: Arc::clone(self),
        }
    }

    /// Connections accepted since startup.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Connections currently open.
    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }
}

/// Decrements the active count when the connection ends.
#[derive(Debug)]
pub struct ConnectionGuard {
    id: u64,
    stats: Arc<ConnectionStats>,
}

impl ConnectionGuard {
    /// Connection id, counting from 1.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.stats.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// What the connection should do after a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    KeepAlive,
    Close,
}

/// Identifies one request on an intercepted connection.
#[derive(Debug, Clone)]
pub struct RequestScope<'a> {
    pub request_id: String,
    pub target: &'a ConnectTarget,
}

/// The shared proxy state and request pipeline.
#[derive(Clone)]
pub struct ProxyHandler {
    config: HandlerConfig,
    policy: Arc<DomainPolicy>,
    limits: Limits,
    authority: Arc<CertificateAuthority>,
    stats: Arc<ConnectionStats>,
}

impl std::fmt::Debug for ProxyHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyHandler")
            .field("config", &self.config)
            .field("limits", &self.limits)
            .field("authority", &self.authority)
            .field("stats", &self.stats)
            .finish()
    }
}

impl ProxyHandler {
    /// Creates a handler.
    pub fn new(
        config: HandlerConfig,
        policy: Arc<DomainPolicy>,
        limits: Limits,
        authority: Arc<CertificateAuthority>,
    ) -> Self {
        Self {
            config,
            policy,
            limits,
            authority,
            stats: Arc::new(ConnectionStats::default()),
        }
    }

    pub fn policy(&self) -> &DomainPolicy {
        &self.policy
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn authority(&self) -> &Arc<CertificateAuthority> {
        &self.authority
    }

    pub fn stats(&self) -> &Arc<ConnectionStats> {
        &self.stats
    }

    /// Fetches the current policy snapshot.
    pub async fn snapshot(&self) -> PolicySnapshot {
        self.config.settings.fetch_settings().await
    }

    /// Hands a record to the telemetry sink without waiting.
    pub fn record(&self, record: AuditRecord) {
        self.config.telemetry.log_event(record);
    }

    /// Runs the inspector under the configured timeout.
    async fn inspect(
        &self,
        host: &str,
        body: &[u8],
        snapshot: &PolicySnapshot,
    ) -> Result<InspectionResult, InspectionError> {
        let context = InspectionContext {
            app_name: service_name(host).to_string(),
            destination_type: self.policy.destination_type(host),
            risk_threshold: snapshot.risk_threshold,
        };
        let text = String::from_utf8_lossy(body);
        let timeout = self.limits.inspection_timeout;

        match tokio::time::timeout(timeout, self.config.inspector.inspect(&text, &context)).await {
            Ok(result) => result,
            Err(_) => Err(InspectionError::Timeout(timeout)),
        }
    }

    /// Processes a fully buffered request.
    pub async fn handle_request<W>(
        &self,
        client: &mut W,
        scope: &RequestScope<'_>,
        request: ParsedRequest,
    ) -> Result<Disposition, ProxyError>
    where
        W: AsyncWrite + Unpin,
    {
        let host = scope.target.host.as_str();
        let ParsedRequest { head, body } = request;
        let snapshot = self.snapshot().await;

        let eligible = head.method.eq_ignore_ascii_case("POST")
            && !body.is_empty()
            && (!head.multipart || snapshot.inspect_attachments_enabled);

        let mut inspection = None;
        let mut reason = None;
        let action = if !eligible {
            RecordAction::Skipped
        } else if !self.limits.inspectable(body.len()) {
            reason = Some(SIZE_LIMIT_REASON.to_string());
            RecordAction::SizeLimit
        } else {
            let started = Instant::now();
            match self.inspect(host, &body, &snapshot).await {
                Ok(result) => {
                    let action = RecordAction::from(result.action);
                    inspection = Some(result);
                    action
                }
                Err(e) => {
                    tracing::error!(
                        request_id = %scope.request_id,
                        host,
                        body_size = body.len(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        fail_open = self.limits.fail_open,
                        "Inspection failed: {}",
                        e
                    );
                    if !self.limits.fail_open {
                        self.record(
                            audit(scope, &head, body.len() as u64, RecordAction::Unavailable)
                                .blocked()
                                .with_reason(e.to_string()),
                        );
                        responses::inspection_unavailable().write_to(client).await?;
                        return Ok(Disposition::KeepAlive);
                    }
                    reason = Some(e.to_string());
                    RecordAction::Bypass
                }
            }
        };

        let block = snapshot.block_high_risk_enabled
            && inspection
                .as_ref()
                .is_some_and(|r| r.action == InspectionAction::Block);

        let mut record = audit(scope, &head, body.len() as u64, action).with_inspection(inspection);
        if let Some(reason) = reason {
            record = record.with_reason(reason);
        }

        if block {
            tracing::info!(
                request_id = %scope.request_id,
                host,
                method = %head.method,
                path = %head.path,
                "Request blocked by policy"
            );
            self.record(record.blocked());
            responses::blocked(host).write_to(client).await?;
            return Ok(Disposition::KeepAlive);
        }

        tracing::debug!(
            request_id = %scope.request_id,
            host,
            method = %head.method,
            path = %head.path,
            action = %action,
            "Forwarding request"
        );
        self.record(record);

        let request = match build_request(&head, host, full_body(body.clone())) {
            Ok(request) => request,
            Err(e) => return self.upstream_failed(client, scope, &head, body.len() as u64, e).await,
        };
        match self
            .config
            .upstream
            .send(host, scope.target.port, request)
            .await
        {
            Ok(response) => self.relay(client, scope, &head, response).await,
            Err(e) => self.upstream_failed(client, scope, &head, body.len() as u64, e).await,
        }
    }

    /// Answers a request whose body exceeds the hard ceiling.
    ///
    /// The parser keeps discarding the body; the connection stays usable.
    pub async fn reject_oversized<W>(
        &self,
        client: &mut W,
        scope: &RequestScope<'_>,
        head: &RequestHead,
    ) -> Result<Disposition, ProxyError>
    where
        W: AsyncWrite + Unpin,
    {
        tracing::info!(
            request_id = %scope.request_id,
            host = %scope.target.host,
            content_length = head.content_length,
            limit = self.limits.max_body_bytes,
            "Request body over limit, rejecting"
        );
        self.record(
            audit(scope, head, head.content_length, RecordAction::Rejected)
                .blocked()
                .with_reason(format!("body exceeds {} bytes", self.limits.max_body_bytes)),
        );
        responses::payload_too_large(self.limits.max_body_bytes)
            .write_to(client)
            .await?;
        Ok(Disposition::KeepAlive)
    }

    /// Opens the upstream request for a streamed body.
    ///
    /// Inspection is skipped; chunks are pushed with
    /// [`StreamingForward::push`] as they arrive.
    pub fn start_streaming(&self, scope: &RequestScope<'_>, head: RequestHead) -> StreamingForward {
        let host = scope.target.host.clone();
        let port = scope.target.port;

        tracing::info!(
            request_id = %scope.request_id,
            host = %host,
            content_length = head.content_length,
            "Streaming large body without inspection"
        );
        self.record(
            audit(scope, &head, head.content_length, RecordAction::SizeLimit)
                .with_reason(SIZE_LIMIT_REASON),
        );

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let request = build_request(&head, &host, channel_body(rx));
        let upstream = Arc::clone(&self.config.upstream);
        let response = tokio::spawn(async move {
            let request = request?;
            upstream.send(&host, port, request).await
        });

        StreamingForward {
            head,
            tx: Some(tx),
            response,
            forwarded: 0,
        }
    }

    /// Completes a streamed request and relays the response.
    pub async fn finish_streaming<W>(
        &self,
        client: &mut W,
        scope: &RequestScope<'_>,
        forward: StreamingForward,
    ) -> Result<Disposition, ProxyError>
    where
        W: AsyncWrite + Unpin,
    {
        let StreamingForward {
            head,
            tx,
            response,
            forwarded,
        } = forward;
        drop(tx);

        let result = match response.await {
            Ok(result) => result,
            Err(e) => Err(UpstreamError::InvalidRequest(format!("upstream task failed: {}", e))),
        };

        match result {
            Ok(response) => {
                let disposition = self.relay(client, scope, &head, response).await?;
                if forwarded < head.content_length {
                    // The origin answered before taking the whole body.
                    tracing::debug!(
                        request_id = %scope.request_id,
                        forwarded,
                        content_length = head.content_length,
                        "Origin responded early to streamed body"
                    );
                    return Ok(Disposition::Close);
                }
                Ok(disposition)
            }
            Err(e) => {
                self.upstream_failed(client, scope, &head, head.content_length, e)
                    .await
            }
        }
    }

    async fn relay<W>(
        &self,
        client: &mut W,
        scope: &RequestScope<'_>,
        head: &RequestHead,
        response: Response<Incoming>,
    ) -> Result<Disposition, ProxyError>
    where
        W: AsyncWrite + Unpin,
    {
        let outcome = relay_response(client, response, head.is_head()).await?;
        tracing::debug!(
            request_id = %scope.request_id,
            status = outcome.status,
            body_bytes = outcome.body_bytes,
            "Response relayed"
        );
        Ok(if outcome.close {
            Disposition::Close
        } else {
            Disposition::KeepAlive
        })
    }

    async fn upstream_failed<W>(
        &self,
        client: &mut W,
        scope: &RequestScope<'_>,
        head: &RequestHead,
        body_size: u64,
        error: UpstreamError,
    ) -> Result<Disposition, ProxyError>
    where
        W: AsyncWrite + Unpin,
    {
        let host = scope.target.host.as_str();
        tracing::warn!(
            request_id = %scope.request_id,
            host,
            method = %head.method,
            path = %head.path,
            "Upstream request failed: {}",
            error
        );
        self.record(
            audit(scope, head, body_size, RecordAction::UpstreamError).with_reason(error.to_string()),
        );

        let response: SyntheticResponse = if error.is_timeout() {
            responses::gateway_timeout(host)
        } else {
            responses::bad_gateway(host)
        };
        response.write_to(client).await?;
        Ok(Disposition::Close)
    }
}

/// A request whose body is being streamed to the origin.
#[derive(Debug)]
pub struct StreamingForward {
    head: RequestHead,
    tx: Option<mpsc::Sender<Bytes>>,
    response: JoinHandle<Result<Response<Incoming>, UpstreamError>>,
    forwarded: u64,
}

impl StreamingForward {
    /// Forwards one body chunk, waiting while the origin is slower than the
    /// client.
    ///
    /// Once the upstream request has failed, chunks are discarded so the
    /// client body is still consumed.
    pub async fn push(&mut self, chunk: Bytes) {
        let Some(tx) = &self.tx else {
            return;
        };
        let len = chunk.len() as u64;
        if tx.send(chunk).await.is_ok() {
            self.forwarded += len;
        } else {
            tracing::debug!("Upstream stopped reading the streamed body");
            self.tx = None;
        }
    }

    /// Body bytes handed to the upstream so far.
    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }

    pub fn head(&self) -> &RequestHead {
        &self.head
    }
}

fn audit(scope: &RequestScope<'_>, head: &RequestHead, body_size: u64, action: RecordAction) -> AuditRecord {
    AuditRecord::request(
        scope.request_id.clone(),
        scope.target.host.clone(),
        head.method.clone(),
        head.path.clone(),
        body_size,
        action,
    )
}
