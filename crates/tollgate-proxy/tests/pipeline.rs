//! End-to-end tests: a TLS client trusting the generated root, the proxy
//! listener, and a plain-TCP hyper origin standing in for the provider.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use tollgate_core::{
    AuditRecord, InspectionAction, InspectionContext, InspectionError, InspectionResult,
    Inspector, PolicySnapshot, RecordAction, StaticSettings, TelemetrySink,
};
use tollgate_proxy::{
    send_over, CertificateAuthority, Limits, ProxyConfig, ProxyHandle, ProxyServer, Upstream,
    UpstreamBody, UpstreamError,
};

const AI_HOST: &str = "api.openai.com";

// Origin

async fn echo(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let host = req
        .headers()
        .get("host")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => Bytes::new(),
    };

    let response = Response::builder()
        .header("x-origin-method", method)
        .header("x-origin-path", path)
        .header("x-origin-host", host)
        .body(Full::new(body))
        .unwrap();
    Ok(response)
}

async fn spawn_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service_fn(echo))
                    .await;
            });
        }
    });
    addr
}

/// Sends every request to the local origin over plain TCP.
struct LocalUpstream {
    origin: SocketAddr,
    targets: Mutex<Vec<String>>,
}

#[async_trait]
impl Upstream for LocalUpstream {
    async fn send(
        &self,
        host: &str,
        port: u16,
        request: Request<UpstreamBody>,
    ) -> Result<Response<Incoming>, UpstreamError> {
        self.targets.lock().push(format!("{}:{}", host, port));
        let stream = TcpStream::connect(self.origin)
            .await
            .map_err(|source| UpstreamError::Connect {
                addr: self.origin.to_string(),
                source,
            })?;
        send_over(stream, request, Duration::from_secs(5)).await
    }
}

// Collaborators

#[derive(Default)]
struct RecordingTelemetry(Mutex<Vec<AuditRecord>>);

impl TelemetrySink for RecordingTelemetry {
    fn log_event(&self, record: AuditRecord) {
        self.0.lock().push(record);
    }
}

impl RecordingTelemetry {
    fn actions(&self) -> Vec<RecordAction> {
        self.0.lock().iter().map(|r| r.action).collect()
    }
}

/// Returns a fixed verdict, or fails, and counts calls.
struct ScriptedInspector {
    verdict: Option<InspectionAction>,
    calls: AtomicUsize,
}

impl ScriptedInspector {
    fn verdict(action: InspectionAction) -> Self {
        Self {
            verdict: Some(action),
            calls: AtomicUsize::new(0),
        }
    }

    fn down() -> Self {
        Self {
            verdict: None,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Inspector for ScriptedInspector {
    async fn inspect(
        &self,
        _body: &str,
        _context: &InspectionContext,
    ) -> Result<InspectionResult, InspectionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.verdict {
            Some(InspectionAction::Block) => Ok(InspectionResult::new(
                InspectionAction::Block,
                95,
                vec!["api_key".into()],
            )),
            Some(action) => Ok(InspectionResult::new(action, 0, Vec::new())),
            None => Err(InspectionError::Unreachable("connection refused".into())),
        }
    }
}

struct Harness {
    _dir: TempDir,
    proxy: ProxyHandle,
    authority: Arc<CertificateAuthority>,
    upstream: Arc<LocalUpstream>,
    telemetry: Arc<RecordingTelemetry>,
    inspector: Arc<ScriptedInspector>,
    origin: SocketAddr,
}

impl Harness {
    async fn start(inspector: ScriptedInspector, limits: Limits, snapshot: PolicySnapshot) -> Self {
        let dir = TempDir::new().unwrap();
        let origin = spawn_origin().await;
        let upstream = Arc::new(LocalUpstream {
            origin,
            targets: Mutex::new(Vec::new()),
        });
        let telemetry = Arc::new(RecordingTelemetry::default());
        let inspector = Arc::new(inspector);

        let config = ProxyConfig::with_ca_dir(dir.path().join("certs"))
            .with_port(0)
            .with_limits(limits)
            .with_inspector(inspector.clone())
            .with_telemetry(telemetry.clone())
            .with_settings(Arc::new(StaticSettings::new(snapshot)))
            .with_upstream(upstream.clone());

        let server = ProxyServer::new(config).unwrap();
        let authority = server.authority().clone();
        let proxy = server.start().await.unwrap();

        Self {
            _dir: dir,
            proxy,
            authority,
            upstream,
            telemetry,
            inspector,
            origin,
        }
    }

    async fn default_with(inspector: ScriptedInspector) -> Self {
        Self::start(inspector, Limits::default(), PolicySnapshot::default()).await
    }

    /// CONNECTs to `host` and completes a TLS handshake trusting the root.
    async fn open_intercepted(&self, host: &str) -> TlsStream<TcpStream> {
        let mut tcp = TcpStream::connect(self.proxy.addr()).await.unwrap();
        tcp.write_all(format!("CONNECT {host}:443 HTTP/1.1\r\nHost: {host}:443\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let head = read_head(&mut tcp).await;
        assert!(head.starts_with("HTTP/1.1 200"), "unexpected reply: {head}");

        let mut roots = RootCertStore::empty();
        roots.add(self.authority.cert_der().clone()).unwrap();
        let mut config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::aws_lc_rs::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        let server_name = ServerName::try_from(host.to_string()).unwrap();
        TlsConnector::from(Arc::new(config))
            .connect(server_name, tcp)
            .await
            .unwrap()
    }

    fn targets(&self) -> Vec<String> {
        self.upstream.targets.lock().clone()
    }
}

// Client-side wire helpers

async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        assert_ne!(n, 0, "connection closed mid-head");
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

fn header<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.split("\r\n")
        .skip(1)
        .filter_map(|line| line.split_once(':'))
        .find(|(n, _)| n.trim().eq_ignore_ascii_case(name))
        .map(|(_, v)| v.trim())
}

async fn read_response<S: AsyncRead + Unpin>(stream: &mut S) -> (String, Vec<u8>) {
    let head = read_head(stream).await;
    let len: usize = header(&head, "content-length")
        .map(|v| v.parse().unwrap())
        .unwrap_or(0);
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.unwrap();
    (head, body)
}

async fn post<S: AsyncWrite + Unpin>(stream: &mut S, path: &str, body: &[u8]) {
    post_typed(stream, path, "application/json", body).await
}

async fn post_typed<S: AsyncWrite + Unpin>(stream: &mut S, path: &str, content_type: &str, body: &[u8]) {
    let head = format!(
        "POST {path} HTTP/1.1\r\nHost: {AI_HOST}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    stream.write_all(head.as_bytes()).await.unwrap();
    stream.write_all(body).await.unwrap();
    stream.flush().await.unwrap();
}

// Tests

#[tokio::test]
async fn inspected_request_reaches_origin_byte_for_byte() {
    let h = Harness::default_with(ScriptedInspector::verdict(InspectionAction::Allow)).await;
    let mut tls = h.open_intercepted(AI_HOST).await;

    let mut body = br#"{"model":"gpt-4o","messages":[{"role":"user","content":"hello"}]}"#.to_vec();
    body.extend_from_slice(&[0xff, 0x00, 0xfe]);
    post(&mut tls, "/v1/chat/completions", &body).await;

    let (head, echoed) = read_response(&mut tls).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");
    assert_eq!(echoed, body);
    assert_eq!(header(&head, "x-origin-method"), Some("POST"));
    assert_eq!(header(&head, "x-origin-path"), Some("/v1/chat/completions"));
    assert_eq!(header(&head, "x-origin-host"), Some(AI_HOST));

    // Same connection, second request.
    tls.write_all(format!("GET /v1/models HTTP/1.1\r\nHost: {AI_HOST}\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let (head, _) = read_response(&mut tls).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");
    assert_eq!(header(&head, "x-origin-method"), Some("GET"));

    assert_eq!(h.inspector.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.targets(), vec![format!("{AI_HOST}:443"), format!("{AI_HOST}:443")]);
    assert_eq!(h.telemetry.actions(), vec![RecordAction::Allow, RecordAction::Skipped]);

    let records = h.telemetry.0.lock().clone();
    assert_eq!(records[0].request_id, "c1-r1");
    assert_eq!(records[1].request_id, "c1-r2");
    assert_eq!(records[0].hostname, AI_HOST);
    assert_eq!(records[0].body_size, body.len() as u64);
}

#[tokio::test]
async fn pipelined_requests_are_answered_in_order() {
    let h = Harness::default_with(ScriptedInspector::verdict(InspectionAction::Allow)).await;
    let mut tls = h.open_intercepted(AI_HOST).await;

    let batch = format!(
        "POST /one HTTP/1.1\r\nHost: {AI_HOST}\r\nContent-Length: 3\r\n\r\none\
         POST /two HTTP/1.1\r\nHost: {AI_HOST}\r\nContent-Length: 3\r\n\r\ntwo"
    );
    tls.write_all(batch.as_bytes()).await.unwrap();

    let (first, body) = read_response(&mut tls).await;
    assert_eq!(header(&first, "x-origin-path"), Some("/one"));
    assert_eq!(body, b"one");
    let (second, body) = read_response(&mut tls).await;
    assert_eq!(header(&second, "x-origin-path"), Some("/two"));
    assert_eq!(body, b"two");
}

#[tokio::test]
async fn fail_open_forwards_when_inspector_is_down() {
    let h = Harness::default_with(ScriptedInspector::down()).await;
    let mut tls = h.open_intercepted(AI_HOST).await;

    post(&mut tls, "/v1/messages", br#"{"prompt":"hi"}"#).await;
    let (head, echoed) = read_response(&mut tls).await;

    assert!(head.starts_with("HTTP/1.1 200"), "{head}");
    assert_eq!(echoed, br#"{"prompt":"hi"}"#);
    assert_eq!(h.telemetry.actions(), vec![RecordAction::Bypass]);
}

#[tokio::test]
async fn fail_closed_answers_503_without_forwarding() {
    let limits = Limits {
        fail_open: false,
        ..Limits::default()
    };
    let h = Harness::start(ScriptedInspector::down(), limits, PolicySnapshot::default()).await;
    let mut tls = h.open_intercepted(AI_HOST).await;

    post(&mut tls, "/v1/messages", b"{}").await;
    let (head, body) = read_response(&mut tls).await;

    assert!(head.starts_with("HTTP/1.1 503"), "{head}");
    assert!(header(&head, "content-type").unwrap().starts_with("text/plain"));
    assert_eq!(header(&head, "content-length"), Some(body.len().to_string().as_str()));
    assert!(h.targets().is_empty());
    assert_eq!(h.telemetry.actions(), vec![RecordAction::Unavailable]);
}

#[tokio::test]
async fn block_verdict_is_enforced_only_when_enabled() {
    let enforcing = PolicySnapshot {
        block_high_risk_enabled: true,
        ..PolicySnapshot::default()
    };
    let h = Harness::start(
        ScriptedInspector::verdict(InspectionAction::Block),
        Limits::default(),
        enforcing,
    )
    .await;
    let mut tls = h.open_intercepted(AI_HOST).await;
    post(&mut tls, "/v1/messages", b"sk-live-secret").await;
    let (head, _) = read_response(&mut tls).await;
    assert!(head.starts_with("HTTP/1.1 403"), "{head}");
    assert!(h.targets().is_empty());

    let records = h.telemetry.0.lock().clone();
    assert_eq!(records.len(), 1);
    assert!(records[0].blocked);

    let h = Harness::default_with(ScriptedInspector::verdict(InspectionAction::Block)).await;
    let mut tls = h.open_intercepted(AI_HOST).await;
    post(&mut tls, "/v1/messages", b"sk-live-secret").await;
    let (head, _) = read_response(&mut tls).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");
    assert_eq!(h.targets().len(), 1);
    assert_eq!(h.telemetry.actions(), vec![RecordAction::Block]);
    assert!(!h.telemetry.0.lock()[0].blocked);
}

#[tokio::test]
async fn large_attachment_streams_without_inspection() {
    let limits = Limits {
        max_inspection_bytes: 1024,
        ..Limits::default()
    };
    let h = Harness::start(
        ScriptedInspector::verdict(InspectionAction::Allow),
        limits,
        PolicySnapshot::default(),
    )
    .await;
    let mut tls = h.open_intercepted(AI_HOST).await;

    let body: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    post_typed(&mut tls, "/v1/files", "multipart/form-data; boundary=xyz", &body).await;
    let (head, echoed) = read_response(&mut tls).await;

    assert!(head.starts_with("HTTP/1.1 200"), "{head}");
    assert_eq!(echoed.len(), body.len());
    assert_eq!(echoed, body);
    assert_eq!(h.inspector.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.telemetry.actions(), vec![RecordAction::SizeLimit]);

    // A large non-multipart body is buffered, still not inspected.
    post(&mut tls, "/v1/chat/completions", &body[..4096]).await;
    let (head, echoed) = read_response(&mut tls).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");
    assert_eq!(echoed, &body[..4096]);
    assert_eq!(h.inspector.calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        h.telemetry.actions(),
        vec![RecordAction::SizeLimit, RecordAction::SizeLimit]
    );
}

#[tokio::test]
async fn oversized_body_is_rejected_and_connection_survives() {
    let limits = Limits {
        max_body_bytes: 4096,
        max_inspection_bytes: 1024,
        ..Limits::default()
    };
    let h = Harness::start(
        ScriptedInspector::verdict(InspectionAction::Allow),
        limits,
        PolicySnapshot::default(),
    )
    .await;
    let mut tls = h.open_intercepted(AI_HOST).await;

    post(&mut tls, "/v1/files", &vec![b'x'; 10_000]).await;
    let (head, body) = read_response(&mut tls).await;
    assert!(head.starts_with("HTTP/1.1 413"), "{head}");
    assert_eq!(header(&head, "content-length"), Some(body.len().to_string().as_str()));

    tls.write_all(format!("GET /v1/models HTTP/1.1\r\nHost: {AI_HOST}\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let (head, _) = read_response(&mut tls).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");

    assert_eq!(h.targets().len(), 1);
    assert_eq!(
        h.telemetry.actions(),
        vec![RecordAction::Rejected, RecordAction::Skipped]
    );
}

#[tokio::test]
async fn transfer_encoding_request_gets_411() {
    let h = Harness::default_with(ScriptedInspector::verdict(InspectionAction::Allow)).await;
    let mut tls = h.open_intercepted(AI_HOST).await;

    tls.write_all(
        format!("POST /v1/messages HTTP/1.1\r\nHost: {AI_HOST}\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n")
            .as_bytes(),
    )
    .await
    .unwrap();
    let (head, _) = read_response(&mut tls).await;
    assert!(head.starts_with("HTTP/1.1 411"), "{head}");
    assert_eq!(header(&head, "connection"), Some("close"));
    assert!(h.targets().is_empty());
}

#[tokio::test]
async fn expect_continue_gets_interim_response() {
    let h = Harness::default_with(ScriptedInspector::verdict(InspectionAction::Allow)).await;
    let mut tls = h.open_intercepted(AI_HOST).await;

    tls.write_all(
        format!("POST /v1/messages HTTP/1.1\r\nHost: {AI_HOST}\r\nExpect: 100-continue\r\nContent-Length: 5\r\n\r\n")
            .as_bytes(),
    )
    .await
    .unwrap();
    let interim = read_head(&mut tls).await;
    assert_eq!(interim, "HTTP/1.1 100 Continue\r\n\r\n");

    tls.write_all(b"hello").await.unwrap();
    let (head, body) = read_response(&mut tls).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");
    assert_eq!(body, b"hello");
}

#[tokio::test]
async fn other_hosts_are_tunnelled_untouched() {
    let h = Harness::default_with(ScriptedInspector::verdict(InspectionAction::Allow)).await;

    let mut tcp = TcpStream::connect(h.proxy.addr()).await.unwrap();
    tcp.write_all(format!("CONNECT {} HTTP/1.1\r\n\r\n", h.origin).as_bytes())
        .await
        .unwrap();
    let head = read_head(&mut tcp).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");

    // Plain HTTP inside the tunnel goes straight to the origin.
    tcp.write_all(b"POST /direct HTTP/1.1\r\nHost: origin\r\nContent-Length: 4\r\n\r\nping")
        .await
        .unwrap();
    let (head, body) = read_response(&mut tcp).await;
    assert_eq!(header(&head, "x-origin-path"), Some("/direct"));
    assert_eq!(body, b"ping");

    assert_eq!(h.inspector.calls.load(Ordering::SeqCst), 0);
    assert!(h.targets().is_empty());
    assert!(h.telemetry.actions().is_empty());
}

#[tokio::test]
async fn leaf_certificates_are_cached_across_connections() {
    let h = Harness::default_with(ScriptedInspector::verdict(InspectionAction::Allow)).await;

    let _first = h.open_intercepted(AI_HOST).await;
    let _second = h.open_intercepted(AI_HOST).await;
    let _other = h.open_intercepted("claude.ai").await;

    assert_eq!(h.authority.cached_leaf_count(), 2);
}
