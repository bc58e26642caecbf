//! Per-connection dispatch.
//!
//! ```text
//! accept ─► read CONNECT ─► classify(host, snapshot)
//!                              ├─ passthrough ──► TCP tunnel
//!                              ├─ metadata-only ► audit record ─► TCP tunnel
//!                              └─ deep-inspect ─► TLS with leaf cert ─► parser ─► pipeline
//!                                                   └─ handshake fails ─► TCP tunnel (replay)
//! ```
//!
//! Requests that are not CONNECT are answered locally: PAC script, status
//! page, or an error.

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::TlsAcceptor;

use tollgate_core::{AuditRecord, Route};

use crate::connect::{read_opening_request, ConnectTarget, OpeningRequest, CONNECT_ESTABLISHED};
use crate::error::{ParseError, ProxyError, Result};
use crate::handler::{Disposition, ProxyHandler, RequestScope, StreamingForward};
use crate::parser::{ParseEvent, RequestHead, RequestParser};
use crate::responses::{self, StatusReport};
use crate::tunnel::{connect_target, run_tunnel, HandshakeRecorder, PrefixedStream};

const READ_CHUNK_SIZE: usize = 16 * 1024;

const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Routes accepted connections.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    handler: ProxyHandler,
    listen_addr: SocketAddr,
}

impl Dispatcher {
    pub fn new(handler: ProxyHandler, listen_addr: SocketAddr) -> Self {
        Self {
            handler,
            listen_addr,
        }
    }

    pub fn handler(&self) -> &ProxyHandler {
        &self.handler
    }

    /// Serves one client connection to completion.
    ///
    /// Never returns an error: failures are logged and the connection closed.
    pub async fn serve<S>(&self, stream: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let guard = self.handler.stats().open();
        let conn_id = guard.id();

        if let Err(e) = self.dispatch(stream, conn_id).await {
            match e {
                ProxyError::Io(_) | ProxyError::IdleTimeout(_) | ProxyError::Parse(_) => {
                    tracing::debug!(conn_id, %peer, "Connection ended: {}", e)
                }
                _ => tracing::warn!(conn_id, %peer, "Connection failed: {}", e),
            }
        }
    }

    async fn dispatch<S>(&self, mut stream: S, conn_id: u64) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let idle = self.handler.limits().idle_timeout;

        let opening = match tokio::time::timeout(idle, read_opening_request(&mut stream)).await {
            Err(_) => return Err(ProxyError::IdleTimeout(idle)),
            Ok(Ok(Some(opening))) => opening,
            Ok(Ok(None)) => return Ok(()),
            Ok(Err(ProxyError::InvalidConnect(detail))) => {
                responses::bad_request(&detail).write_to(&mut stream).await?;
                return Err(ProxyError::InvalidConnect(detail));
            }
            Ok(Err(e)) => return Err(e),
        };

        if !opening.is_connect() {
            return self.serve_local(&mut stream, &opening.head).await;
        }

        let target = match ConnectTarget::parse(&opening.head.path) {
            Ok(target) => target,
            Err(e) => {
                responses::bad_request("malformed CONNECT target")
                    .write_to(&mut stream)
                    .await?;
                return Err(e);
            }
        };

        let snapshot = self.handler.snapshot().await;
        let route = self.handler.policy().classify(&target.host, &snapshot);
        tracing::debug!(conn_id, host = %target.host, port = target.port, route = %route, "CONNECT");

        let OpeningRequest { leftover, .. } = opening;
        match route {
            Route::Passthrough => self.passthrough(stream, &target, leftover.freeze()).await,
            Route::MetadataOnly => {
                self.handler
                    .record(AuditRecord::connection(format!("c{}", conn_id), target.host.clone()));
                self.passthrough(stream, &target, leftover.freeze()).await
            }
            Route::DeepInspect => self.intercept(stream, &target, leftover.freeze(), conn_id).await,
        }
    }

    /// Answers a plain HTTP request addressed to the proxy itself.
    async fn serve_local<S>(&self, stream: &mut S, head: &RequestHead) -> Result<()>
    where
        S: AsyncWrite + Unpin,
    {
        let path = head.path.split('?').next().unwrap_or_default();

        let response = if path.starts_with("http://") || path.starts_with("https://") {
            responses::not_implemented()
        } else if !head.method.eq_ignore_ascii_case("GET") && !head.is_head() {
            responses::not_found()
        } else {
            match path {
                "/proxy.pac" | "/wpad.dat" => {
                    responses::pac_response(self.handler.policy(), self.listen_addr)
                }
                "/" | "/status" => responses::status_response(&self.status_report()),
                _ => responses::not_found(),
            }
        };

        response.write_to(stream).await?;
        Ok(())
    }

    /// Current proxy state for the status page.
    pub fn status_report(&self) -> StatusReport {
        let stats = self.handler.stats();
        StatusReport {
            status: "running",
            version: env!("CARGO_PKG_VERSION"),
            listen_addr: self.listen_addr.to_string(),
            ai_domains: self.handler.policy().ai_domains().count(),
            passthrough_domains: self.handler.policy().passthrough_domains().count(),
            cached_leaf_certificates: self.handler.authority().cached_leaf_count(),
            active_connections: stats.active(),
            total_connections: stats.total(),
            fail_open: self.handler.limits().fail_open,
        }
    }

    async fn passthrough<S>(&self, mut client: S, target: &ConnectTarget, replay: Bytes) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let limits = self.handler.limits();
        let mut upstream = match connect_target(target, limits.upstream_connect_timeout).await {
            Ok(upstream) => upstream,
            Err(e) => {
                tracing::warn!(host = %target.host, "Tunnel connect failed: {}", e);
                responses::bad_gateway(&target.host).write_to(&mut client).await?;
                return Ok(());
            }
        };

        client.write_all(CONNECT_ESTABLISHED).await?;
        client.flush().await?;

        let (up, down) = run_tunnel(&mut client, &mut upstream, &replay, limits.idle_timeout).await?;
        tracing::debug!(host = %target.host, bytes_up = up, bytes_down = down, "Tunnel closed");
        Ok(())
    }

    async fn intercept<S>(
        &self,
        mut client: S,
        target: &ConnectTarget,
        leftover: Bytes,
        conn_id: u64,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let limits = self.handler.limits();
        client.write_all(CONNECT_ESTABLISHED).await?;
        client.flush().await?;

        let leaf = match self.handler.authority().leaf_for_domain(&target.host).await {
            Ok(leaf) => leaf,
            Err(e) => {
                tracing::warn!(host = %target.host, "No leaf certificate, tunnelling instead: {}", e);
                return self.fallback_tunnel(client, target, &leftover).await;
            }
        };

        let acceptor = TlsAcceptor::from(leaf.server_config());
        let recorder = HandshakeRecorder::new(PrefixedStream::new(leftover, client));

        let accepted =
            match tokio::time::timeout(limits.idle_timeout, acceptor.accept(recorder).into_fallible()).await {
                Ok(accepted) => accepted,
                Err(_) => return Err(ProxyError::IdleTimeout(limits.idle_timeout)),
            };

        match accepted {
            Ok(mut tls) => {
                tls.get_mut().0.stop();
                let result = self.mitm_session(&mut tls, target, conn_id).await;
                let _ = tls.shutdown().await;
                result
            }
            Err((e, recorder)) => {
                tracing::warn!(host = %target.host, "TLS handshake failed, tunnelling instead: {}", e);
                let (client, replay) = recorder.into_replay();
                match replay {
                    Some(replay) => self.fallback_tunnel(client, target, &replay).await,
                    None => Err(ProxyError::Tls(e.to_string())),
                }
            }
        }
    }

    /// Tunnels after the 200 has already been sent.
    async fn fallback_tunnel<S>(&self, mut client: S, target: &ConnectTarget, replay: &[u8]) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let limits = self.handler.limits();
        let mut upstream = connect_target(target, limits.upstream_connect_timeout).await?;
        run_tunnel(&mut client, &mut upstream, replay, limits.idle_timeout).await?;
        Ok(())
    }

    /// Feeds decrypted client bytes through the parser and pipeline.
    async fn mitm_session<S>(&self, tls: &mut S, target: &ConnectTarget, conn_id: u64) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let limits = self.handler.limits();
        let mut parser = RequestParser::new(limits.max_body_bytes, limits.max_inspection_bytes);
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        let mut seq = 0u64;
        let mut streaming: Option<(String, StreamingForward)> = None;

        loop {
            while let Some(event) = self.next_event(&mut parser, tls).await? {
                let disposition = match event {
                    ParseEvent::ContinueRequested => {
                        tls.write_all(CONTINUE_RESPONSE).await?;
                        tls.flush().await?;
                        Disposition::KeepAlive
                    }
                    ParseEvent::Request(request) => {
                        seq += 1;
                        let scope = scope(conn_id, seq, target);
                        self.handler.handle_request(tls, &scope, request).await?
                    }
                    ParseEvent::Oversized(head) => {
                        seq += 1;
                        let scope = scope(conn_id, seq, target);
                        self.handler.reject_oversized(tls, &scope, &head).await?
                    }
                    ParseEvent::LargeBodyStart(head) => {
                        seq += 1;
                        let scope = scope(conn_id, seq, target);
                        let forward = self.handler.start_streaming(&scope, head);
                        streaming = Some((scope.request_id, forward));
                        Disposition::KeepAlive
                    }
                    ParseEvent::BodyChunk(chunk) => {
                        if let Some((_, forward)) = streaming.as_mut() {
                            forward.push(chunk).await;
                        }
                        Disposition::KeepAlive
                    }
                    ParseEvent::LargeBodyEnd => match streaming.take() {
                        Some((request_id, forward)) => {
                            let scope = RequestScope { request_id, target };
                            self.handler.finish_streaming(tls, &scope, forward).await?
                        }
                        None => Disposition::KeepAlive,
                    },
                };

                if disposition == Disposition::Close {
                    return Ok(());
                }
            }

            let n = match tokio::time::timeout(limits.idle_timeout, tls.read(&mut buf)).await {
                Ok(read) => read?,
                Err(_) => return Err(ProxyError::IdleTimeout(limits.idle_timeout)),
            };
            if n == 0 {
                if !parser.is_idle() {
                    tracing::debug!(conn_id, host = %target.host, "Client closed mid-request");
                }
                return Ok(());
            }
            parser.feed(&buf[..n]);
        }
    }

    /// Pulls the next parser event, answering protocol errors on the wire.
    async fn next_event<S>(&self, parser: &mut RequestParser, tls: &mut S) -> Result<Option<ParseEvent>>
    where
        S: AsyncWrite + Unpin,
    {
        match parser.next_event() {
            Ok(event) => Ok(event),
            Err(e) => {
                let response = match &e {
                    ParseError::UnsupportedTransferEncoding(_) => responses::length_required(),
                    other => responses::bad_request(&other.to_string()),
                };
                response.write_to(tls).await?;
                Err(e.into())
            }
        }
    }
}

fn scope(conn_id: u64, seq: u64, target: &ConnectTarget) -> RequestScope<'_> {
    RequestScope {
        request_id: format!("c{}-r{}", conn_id, seq),
        target,
    }
}
