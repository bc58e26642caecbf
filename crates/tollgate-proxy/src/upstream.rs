//! Forwarding intercepted requests to the real origin.
//!
//! Each forwarded request gets its own outbound connection. The response head
//! and body are written back to the client as raw HTTP/1.1; bodies the origin
//! sent chunked are re-chunked so the client sees the same framing.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{HeaderName, HeaderValue, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;

use crate::error::{ProxyError, UpstreamError};
use crate::guards::Limits;
use crate::parser::RequestHead;

/// Body type for outbound requests.
pub type UpstreamBody = UnsyncBoxBody<Bytes, Infallible>;

/// Headers that describe a single connection and are never forwarded.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authorization",
    "proxy-authenticate",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// A fully buffered body.
pub fn full_body(bytes: Bytes) -> UpstreamBody {
    Full::new(bytes).boxed_unsync()
}

/// A body fed chunk by chunk; it ends when the sender is dropped.
pub fn channel_body(rx: mpsc::Receiver<Bytes>) -> UpstreamBody {
    let chunks = stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|chunk| (Ok::<_, Infallible>(Frame::data(chunk)), rx))
    });
    StreamBody::new(chunks).boxed_unsync()
}

fn is_hop_by_hop(name: &str, listed: &[String]) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| name.eq_ignore_ascii_case(h))
        || listed.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Builds the outbound request from a parsed head.
///
/// Method, path, headers and body are carried over unchanged apart from
/// hop-by-hop headers, including any named in `Connection`.
pub fn build_request(
    head: &RequestHead,
    host: &str,
    body: UpstreamBody,
) -> Result<Request<UpstreamBody>, UpstreamError> {
    let invalid = |e: &dyn std::fmt::Display| UpstreamError::InvalidRequest(e.to_string());

    let method = Method::from_bytes(head.method.as_bytes()).map_err(|e| invalid(&e))?;

    let listed: Vec<String> = head
        .headers
        .get("connection")
        .map(|v| v.split(',').map(|t| t.trim().to_string()).collect())
        .unwrap_or_default();

    let mut builder = Request::builder().method(method).uri(head.path.as_str());
    for (name, value) in head.headers.iter() {
        if is_hop_by_hop(name, &listed) {
            continue;
        }
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid(&e))?;
        let value = HeaderValue::from_str(value).map_err(|e| invalid(&e))?;
        builder = builder.header(name, value);
    }
    if !head.headers.contains("host") {
        builder = builder.header(HOST, host);
    }

    builder.body(body).map_err(|e| invalid(&e))
}

/// Sends requests to origin servers.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Opens a connection to `host:port` and sends one request.
    ///
    /// Resolves once the response head has arrived; the body streams
    /// afterwards.
    async fn send(
        &self,
        host: &str,
        port: u16,
        request: Request<UpstreamBody>,
    ) -> Result<Response<Incoming>, UpstreamError>;
}

/// Runs one HTTP/1.1 exchange over an established stream.
pub async fn send_over<IO>(
    io: IO,
    request: Request<UpstreamBody>,
    response_timeout: Duration,
) -> Result<Response<Incoming>, UpstreamError>
where
    IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(io)).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::debug!("Upstream connection ended: {}", e);
        }
    });

    tokio::time::timeout(response_timeout, sender.send_request(request))
        .await
        .map_err(|_| UpstreamError::Timeout(response_timeout))?
        .map_err(UpstreamError::from)
}

/// TLS client for origin servers, verified against the webpki roots.
#[derive(Clone)]
pub struct TlsUpstream {
    connector: TlsConnector,
    connect_timeout: Duration,
    response_timeout: Duration,
}

impl std::fmt::Debug for TlsUpstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsUpstream")
            .field("connect_timeout", &self.connect_timeout)
            .field("response_timeout", &self.response_timeout)
            .finish_non_exhaustive()
    }
}

impl TlsUpstream {
    /// Creates a client using the timeouts from `limits`.
    pub fn new(limits: &Limits) -> Result<Self, ProxyError> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let mut config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::aws_lc_rs::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
        // The response relay writes HTTP/1.1 framing.
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            connect_timeout: limits.upstream_connect_timeout,
            response_timeout: limits.upstream_response_timeout,
        })
    }
}

#[async_trait]
impl Upstream for TlsUpstream {
    async fn send(
        &self,
        host: &str,
        port: u16,
        request: Request<UpstreamBody>,
    ) -> Result<Response<Incoming>, UpstreamError> {
        let addr = format!("{}:{}", host, port);
        let tcp = tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| UpstreamError::Timeout(self.connect_timeout))?
            .map_err(|source| UpstreamError::Connect { addr, source })?;
        let _ = tcp.set_nodelay(true);

        let handshake_err = |reason: String| UpstreamError::Handshake {
            host: host.to_string(),
            reason,
        };
        let server_name =
            ServerName::try_from(host.to_string()).map_err(|e| handshake_err(e.to_string()))?;
        let tls = tokio::time::timeout(
            self.connect_timeout,
            self.connector.connect(server_name, tcp),
        )
        .await
        .map_err(|_| UpstreamError::Timeout(self.connect_timeout))?
        .map_err(|e| handshake_err(e.to_string()))?;

        send_over(tls, request, self.response_timeout).await
    }
}

/// How a relayed response ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOutcome {
    pub status: u16,
    pub body_bytes: u64,
    /// The body was delimited by connection close; the client connection must
    /// close too.
    pub close: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Empty,
    Chunked,
    Length,
    Close,
}

fn response_framing(response: &Response<Incoming>, request_was_head: bool) -> Framing {
    let status = response.status();
    if request_was_head
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return Framing::Empty;
    }

    let headers = response.headers();
    let chunked = headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("chunked"));

    if chunked {
        Framing::Chunked
    } else if headers.contains_key(CONTENT_LENGTH) {
        Framing::Length
    } else {
        Framing::Close
    }
}

/// Writes an upstream response to the client.
pub async fn relay_response<W>(
    client: &mut W,
    mut response: Response<Incoming>,
    request_was_head: bool,
) -> Result<RelayOutcome, ProxyError>
where
    W: AsyncWrite + Unpin,
{
    let framing = response_framing(&response, request_was_head);
    let status = response.status();

    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    );
    for (name, value) in response.headers() {
        let name = name.as_str();
        if name != "transfer-encoding" && HOP_BY_HOP_HEADERS.contains(&name) {
            continue;
        }
        head.push_str(name);
        head.push_str(": ");
        head.push_str(&String::from_utf8_lossy(value.as_bytes()));
        head.push_str("\r\n");
    }
    if framing == Framing::Close {
        head.push_str("connection: close\r\n");
    }
    head.push_str("\r\n");
    client.write_all(head.as_bytes()).await?;

    let mut body_bytes = 0u64;
    if framing != Framing::Empty {
        while let Some(frame) = response.body_mut().frame().await {
            let frame = frame.map_err(UpstreamError::from)?;
            let Ok(data) = frame.into_data() else {
                // Trailers are dropped.
                continue;
            };
            if data.is_empty() {
                continue;
            }

            body_bytes += data.len() as u64;
            if framing == Framing::Chunked {
                client
                    .write_all(format!("{:x}\r\n", data.len()).as_bytes())
                    .await?;
                client.write_all(&data).await?;
                client.write_all(b"\r\n").await?;
            } else {
                client.write_all(&data).await?;
            }
            client.flush().await?;
        }

        if framing == Framing::Chunked {
            client.write_all(b"0\r\n\r\n").await?;
        }
    }
    client.flush().await?;

    Ok(RelayOutcome {
        status: status.as_u16(),
        body_bytes,
        close: framing == Framing::Close,
    })
}
