//! Transparent tunnelling and stream adapters.
//!
//! - [`PrefixedStream`] replays bytes already read from a socket.
//! - [`HandshakeRecorder`] keeps a copy of what the client sent during the
//!   TLS handshake so a failed interception can fall back to a tunnel.
//! - [`pipe_bidirectional`] copies both directions with an idle timeout.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::connect::ConnectTarget;
use crate::error::{ProxyError, UpstreamError};

/// Most client bytes kept for a handshake fallback.
pub const MAX_RECORDED_HANDSHAKE_BYTES: usize = 64 * 1024;

/// A stream that yields `prefix` before reading from `inner`.
#[derive(Debug)]
pub struct PrefixedStream<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: impl Into<Bytes>, inner: S) -> Self {
        Self {
            prefix: prefix.into(),
            inner,
        }
    }

    /// Returns unread prefix bytes and the inner stream.
    pub fn into_parts(self) -> (Bytes, S) {
        (self.prefix, self.inner)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Records bytes read through it until [`stop`](Self::stop) is called.
#[derive(Debug)]
pub struct HandshakeRecorder<S> {
    inner: S,
    recorded: BytesMut,
    recording: bool,
    overflowed: bool,
}

impl<S> HandshakeRecorder<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            recorded: BytesMut::new(),
            recording: true,
            overflowed: false,
        }
    }

    /// Stops recording and frees the copy.
    pub fn stop(&mut self) {
        self.recording = false;
        self.recorded = BytesMut::new();
    }

    /// Returns the inner stream and everything read so far, or `None` if
    /// more than [`MAX_RECORDED_HANDSHAKE_BYTES`] went through.
    pub fn into_replay(self) -> (S, Option<Bytes>) {
        let replay = (!self.overflowed).then(|| self.recorded.freeze());
        (self.inner, replay)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for HandshakeRecorder<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let this = &mut *self;
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);

        if this.recording && !this.overflowed {
            if let Poll::Ready(Ok(())) = &result {
                let fresh = &buf.filled()[before..];
                if this.recorded.len() + fresh.len() > MAX_RECORDED_HANDSHAKE_BYTES {
                    this.overflowed = true;
                    this.recorded = BytesMut::new();
                } else {
                    this.recorded.extend_from_slice(fresh);
                }
            }
        }
        result
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for HandshakeRecorder<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Opens the TCP connection behind a tunnel.
pub async fn connect_target(
    target: &ConnectTarget,
    connect_timeout: Duration,
) -> Result<TcpStream, UpstreamError> {
    let addr = target.socket_addr();
    let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| UpstreamError::Timeout(connect_timeout))?
        .map_err(|source| UpstreamError::Connect { addr, source })?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// Stream wrapper that stamps `last_activity` whenever bytes move.
struct ActivityStream<'a, S: ?Sized> {
    inner: &'a mut S,
    last_activity: Arc<Mutex<Instant>>,
}

impl<S: ?Sized> ActivityStream<'_, S> {
    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }
}

impl<S: AsyncRead + Unpin + ?Sized> AsyncRead for ActivityStream<'_, S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let result = Pin::new(&mut *self.inner).poll_read(cx, buf);
        if matches!(result, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            self.touch();
        }
        result
    }
}

impl<S: AsyncWrite + Unpin + ?Sized> AsyncWrite for ActivityStream<'_, S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let result = Pin::new(&mut *self.inner).poll_write(cx, buf);
        if matches!(result, Poll::Ready(Ok(n)) if n > 0) {
            self.touch();
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.inner).poll_shutdown(cx)
    }
}

/// Resolves once `idle_timeout` passes with no bytes read or written.
async fn idle_watchdog(last_activity: Arc<Mutex<Instant>>, idle_timeout: Duration) {
    loop {
        let deadline = *last_activity.lock() + idle_timeout;
        tokio::time::sleep_until(deadline).await;
        if last_activity.lock().elapsed() >= idle_timeout {
            return;
        }
    }
}

/// Copies bytes both ways until both sides close.
///
/// Returns bytes copied `(a → b, b → a)`. Each direction runs independently,
/// so a blocked write on one side never stalls the other. An error or
/// `idle_timeout` without progress in either direction (reads and writes
/// both count) ends the pipe; both streams are dropped together.
pub async fn pipe_bidirectional<A, B>(
    side_a: &mut A,
    side_b: &mut B,
    idle_timeout: Duration,
) -> Result<(u64, u64), ProxyError>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let last_activity = Arc::new(Mutex::new(Instant::now()));
    let mut a = ActivityStream {
        inner: side_a,
        last_activity: last_activity.clone(),
    };
    let mut b = ActivityStream {
        inner: side_b,
        last_activity: last_activity.clone(),
    };

    tokio::select! {
        result = tokio::io::copy_bidirectional(&mut a, &mut b) => Ok(result?),
        _ = idle_watchdog(last_activity, idle_timeout) => {
            Err(ProxyError::IdleTimeout(idle_timeout))
        }
    }
}

/// Writes `replay` upstream, then pipes the two streams.
pub async fn run_tunnel<C>(
    client: &mut C,
    upstream: &mut TcpStream,
    replay: &[u8],
    idle_timeout: Duration,
) -> Result<(u64, u64), ProxyError>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    if !replay.is_empty() {
        upstream.write_all(replay).await?;
    }
    let (up, down) = pipe_bidirectional(client, upstream, idle_timeout).await?;
    Ok((up + replay.len() as u64, down))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn prefixed_stream_replays_prefix_first() {
        let inner = &b" world"[..];
        let mut stream = PrefixedStream::new(Bytes::from_static(b"hello"), inner);
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn recorder_captures_until_stopped() {
        let (mut client, server) = duplex(1024);
        let mut recorder = HandshakeRecorder::new(server);

        client.write_all(b"clienthello").await.unwrap();
        let mut buf = [0u8; 11];
        recorder.read_exact(&mut buf).await.unwrap();

        let (_, replay) = recorder.into_replay();
        assert_eq!(replay.unwrap().as_ref(), b"clienthello");
    }

    #[tokio::test]
    async fn recorder_stop_discards() {
        let (mut client, server) = duplex(1024);
        let mut recorder = HandshakeRecorder::new(server);
        recorder.stop();

        client.write_all(b"appdata").await.unwrap();
        let mut buf = [0u8; 7];
        recorder.read_exact(&mut buf).await.unwrap();

        let (_, replay) = recorder.into_replay();
        assert!(replay.unwrap().is_empty());
    }

    #[tokio::test]
    async fn recorder_gives_up_past_limit() {
        let (mut client, server) = duplex(MAX_RECORDED_HANDSHAKE_BYTES * 2);
        let mut recorder = HandshakeRecorder::new(server);

        let payload = vec![7u8; MAX_RECORDED_HANDSHAKE_BYTES + 1];
        client.write_all(&payload).await.unwrap();
        let mut buf = vec![0u8; payload.len()];
        recorder.read_exact(&mut buf).await.unwrap();

        let (_, replay) = recorder.into_replay();
        assert!(replay.is_none());
    }

    #[tokio::test]
    async fn pipe_copies_both_directions() {
        let (mut client, mut client_side) = duplex(1024);
        let (mut origin, mut origin_side) = duplex(1024);

        let pipe = tokio::spawn(async move {
            pipe_bidirectional(&mut client_side, &mut origin_side, Duration::from_secs(5)).await
        });

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        origin.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        origin.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        drop(client);
        drop(origin);
        let (up, down) = pipe.await.unwrap().unwrap();
        assert_eq!((up, down), (4, 5));
    }

    #[tokio::test]
    async fn pipe_idle_timeout_drops_both_sides() {
        let (mut client, mut client_side) = duplex(64);
        let (mut origin, mut origin_side) = duplex(64);

        let result =
            pipe_bidirectional(&mut client_side, &mut origin_side, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(ProxyError::IdleTimeout(_))));

        drop(client_side);
        drop(origin_side);
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        assert_eq!(origin.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn pipe_carries_full_duplex_bulk_traffic() {
        const PAYLOAD: usize = 1024 * 1024;
        let (client, mut client_side) = duplex(8 * 1024);
        let (origin, mut origin_side) = duplex(8 * 1024);

        let pipe = tokio::spawn(async move {
            pipe_bidirectional(&mut client_side, &mut origin_side, Duration::from_secs(2)).await
        });

        // Each peer writes its whole payload while the other direction is still in flight.
        let peer = |stream: tokio::io::DuplexStream, fill: u8| async move {
            let (mut rx, mut tx) = tokio::io::split(stream);
            let writer = async {
                tx.write_all(&vec![fill; PAYLOAD]).await.unwrap();
                tx.shutdown().await.unwrap();
            };
            let reader = async {
                let mut received = Vec::new();
                rx.read_to_end(&mut received).await.unwrap();
                received
            };
            tokio::join!(writer, reader).1
        };

        let both = async { tokio::join!(peer(client, b'c'), peer(origin, b'o')) };
        let (at_client, at_origin) = tokio::time::timeout(Duration::from_secs(10), both)
            .await
            .expect("tunnel stalled");

        assert_eq!(at_client.len(), PAYLOAD);
        assert!(at_client.iter().all(|&b| b == b'o'));
        assert_eq!(at_origin.len(), PAYLOAD);
        assert!(at_origin.iter().all(|&b| b == b'c'));

        let (up, down) = pipe.await.unwrap().unwrap();
        assert_eq!((up, down), (PAYLOAD as u64, PAYLOAD as u64));
    }

    #[tokio::test]
    async fn pipe_times_out_when_both_peers_stop_reading() {
        let (mut client, mut client_side) = duplex(8 * 1024);
        let (mut origin, mut origin_side) = duplex(8 * 1024);

        let pipe = tokio::spawn(async move {
            pipe_bidirectional(&mut client_side, &mut origin_side, Duration::from_millis(200))
                .await
        });

        // Both peers write without ever reading; the buffers fill and every write blocks.
        let payload = vec![1u8; 1024 * 1024];
        let client_payload = payload.clone();
        let client_writer =
            tokio::spawn(async move { client.write_all(&client_payload).await.is_err() });
        let origin_writer = tokio::spawn(async move { origin.write_all(&payload).await.is_err() });

        let result = tokio::time::timeout(Duration::from_secs(5), pipe)
            .await
            .expect("idle timeout never fired")
            .unwrap();
        assert!(matches!(result, Err(ProxyError::IdleTimeout(_))));

        // The pipe dropped both ends, so the stuck writers fail instead of hanging.
        assert!(client_writer.await.unwrap());
        assert!(origin_writer.await.unwrap());
    }

    #[tokio::test]
    async fn tunnel_replays_then_pipes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let origin = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 10];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(b"ok").await.unwrap();
            buf
        });

        let target = ConnectTarget::parse(&format!("127.0.0.1:{}", port)).unwrap();
        let mut upstream = connect_target(&target, Duration::from_secs(2)).await.unwrap();
        let (mut client, mut client_side) = duplex(1024);

        let tunnel = tokio::spawn(async move {
            run_tunnel(&mut client_side, &mut upstream, b"hello", Duration::from_secs(2)).await
        });

        client.write_all(b"world").await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ok");
        assert_eq!(&origin.await.unwrap(), b"helloworld");

        drop(client);
        let (up, _) = tunnel.await.unwrap().unwrap();
        assert_eq!(up, 10);
    }

    #[tokio::test]
    async fn connect_failure_is_reported() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let target = ConnectTarget::parse(&format!("127.0.0.1:{}", port)).unwrap();
        let err = connect_target(&target, Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, UpstreamError::Connect { .. }));
    }
}
