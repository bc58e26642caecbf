//! Proxy server.
//!
//! Binds the listener, spawns one task per accepted connection and runs the
//! memory watchdog until shutdown.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast;

use tollgate_core::{
    DomainPolicy, Inspector, PassiveInspector, PolicySnapshot, SettingsSource, StaticSettings,
    TelemetrySink, TracingTelemetry,
};

use crate::ca::{CaManager, CertificateAuthority};
use crate::dispatcher::Dispatcher;
use crate::error::{ProxyError, Result};
use crate::guards::{Limits, MemoryWatchdog};
use crate::handler::{HandlerConfig, ProxyHandler};
use crate::upstream::{TlsUpstream, Upstream};
use crate::DEFAULT_PROXY_PORT;

/// Pause after a failed accept, so descriptor exhaustion does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Proxy server configuration.
#[derive(Clone)]
pub struct ProxyConfig {
    /// Address to bind the proxy to.
    pub addr: SocketAddr,
    /// The CA manager for certificate generation.
    pub ca_manager: CaManager,
    pub limits: Limits,
    pub policy: Arc<DomainPolicy>,
    pub inspector: Arc<dyn Inspector>,
    pub telemetry: Arc<dyn TelemetrySink>,
    pub settings: Arc<dyn SettingsSource>,
    /// Outbound client; a TLS client is built from `limits` when unset.
    pub upstream: Option<Arc<dyn Upstream>>,
}

impl std::fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("addr", &self.addr)
            .field("ca_manager", &self.ca_manager)
            .field("limits", &self.limits)
            .field("ai_domains", &self.policy.ai_domains().count())
            .field("upstream", &self.upstream.is_some())
            .finish()
    }
}

impl ProxyConfig {
    /// Creates a configuration with the CA in the default data directory.
    pub fn new() -> Result<Self> {
        let ca_manager = CaManager::with_default_dir()?;
        Ok(Self::with_ca_dir(ca_manager.ca_dir()))
    }

    /// Creates a configuration with the CA stored in `dir`.
    ///
    /// Collaborators default to standalone implementations: every request is
    /// allowed, records go to the log and the policy snapshot is the default.
    pub fn with_ca_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PROXY_PORT)),
            ca_manager: CaManager::new(dir.into()),
            limits: Limits::default(),
            policy: Arc::new(DomainPolicy::with_defaults()),
            inspector: Arc::new(PassiveInspector),
            telemetry: Arc::new(TracingTelemetry),
            settings: Arc::new(StaticSettings::new(PolicySnapshot::default())),
            upstream: None,
        }
    }

    /// Sets the listen address.
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Sets the port (uses 127.0.0.1 as host).
    pub fn with_port(mut self, port: u16) -> Self {
        self.addr = SocketAddr::from(([127, 0, 0, 1], port));
        self
    }

    /// Sets the CA manager.
    pub fn with_ca_manager(mut self, ca_manager: CaManager) -> Self {
        self.ca_manager = ca_manager;
        self
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_policy(mut self, policy: DomainPolicy) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    /// Sets the DLP engine.
    pub fn with_inspector(mut self, inspector: Arc<dyn Inspector>) -> Self {
        self.inspector = inspector;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn with_settings(mut self, settings: Arc<dyn SettingsSource>) -> Self {
        self.settings = settings;
        self
    }

    /// Replaces the outbound client.
    pub fn with_upstream(mut self, upstream: Arc<dyn Upstream>) -> Self {
        self.upstream = Some(upstream);
        self
    }
}

/// TLS-terminating proxy for AI-provider traffic.
pub struct ProxyServer {
    config: ProxyConfig,
    authority: Arc<CertificateAuthority>,
}

impl ProxyServer {
    /// Creates a proxy server, generating the CA if it is missing.
    ///
    /// Fails when the CA cannot be read or persisted.
    pub fn new(config: ProxyConfig) -> Result<Self> {
        let authority = config.ca_manager.ensure_ca()?;

        Ok(Self {
            config,
            authority: Arc::new(authority),
        })
    }

    /// Creates a proxy server with default configuration.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ProxyConfig::new()?)
    }

    /// Returns the address the proxy is configured to listen on.
    pub fn addr(&self) -> SocketAddr {
        self.config.addr
    }

    /// Returns the CA certificate path for user installation.
    pub fn ca_cert_path(&self) -> PathBuf {
        self.config.ca_manager.cert_path()
    }

    /// Returns the CA certificate as DER bytes.
    pub fn ca_cert_der(&self) -> Result<Vec<u8>> {
        Ok(self.config.ca_manager.read_cert_der()?)
    }

    pub fn authority(&self) -> &Arc<CertificateAuthority> {
        &self.authority
    }

    /// Runs the proxy until the task is cancelled.
    pub async fn run(self) -> Result<()> {
        let handle = self.start().await?;
        handle.wait().await;
        tracing::info!("Proxy server stopped");
        Ok(())
    }

    /// Binds the listener and serves in the background.
    ///
    /// Returns a handle that can be used to stop the server.
    pub async fn start(self) -> Result<ProxyHandle> {
        let upstream = match self.config.upstream.clone() {
            Some(upstream) => upstream,
            None => Arc::new(TlsUpstream::new(&self.config.limits)?),
        };

        let listener = TcpListener::bind(self.config.addr)
            .await
            .map_err(|e| ProxyError::Proxy(format!("bind {}: {}", self.config.addr, e)))?;
        let addr = listener.local_addr()?;

        let handler_config = HandlerConfig {
            inspector: self.config.inspector.clone(),
            telemetry: self.config.telemetry.clone(),
            settings: self.config.settings.clone(),
            upstream,
        };
        let handler = ProxyHandler::new(
            handler_config,
            self.config.policy.clone(),
            self.config.limits,
            self.authority.clone(),
        );
        let dispatcher = Dispatcher::new(handler, addr);

        tracing::info!("Starting proxy on {}", addr);
        tracing::info!("CA certificate: {:?}", self.ca_cert_path());
        tracing::info!(
            fail_open = self.config.limits.fail_open,
            ai_domains = self.config.policy.ai_domains().count(),
            "Proxy configured"
        );

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let watchdog = MemoryWatchdog::new(&self.config.limits).spawn(shutdown_tx.subscribe());
        let shutdown_rx = shutdown_tx.subscribe();
        let handle = tokio::spawn(accept_loop(listener, dispatcher, shutdown_rx));

        Ok(ProxyHandle {
            shutdown_tx,
            addr,
            handle,
            watchdog,
        })
    }
}

async fn accept_loop(listener: TcpListener, dispatcher: Dispatcher, mut shutdown_rx: broadcast::Receiver<()>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    let dispatcher = dispatcher.clone();
                    tokio::spawn(async move { dispatcher.serve(stream, peer).await });
                }
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            _ = shutdown_rx.recv() => {
                tracing::info!("Proxy shutdown signal received");
                break;
            }
        }
    }
}

/// Handle for controlling a running proxy server.
pub struct ProxyHandle {
    shutdown_tx: broadcast::Sender<()>,
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
    watchdog: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    /// Returns the address the proxy is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signals the proxy to stop accepting connections.
    ///
    /// Connections already in flight run to completion.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Waits for the proxy to finish.
    pub async fn wait(self) {
        let _ = self.handle.await;
        let _ = self.watchdog.await;
    }

    /// Shuts down the proxy and waits for it to finish.
    pub async fn stop(self) {
        self.shutdown();
        self.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn test_config(dir: &TempDir) -> ProxyConfig {
        ProxyConfig::with_ca_dir(dir.path().join("ca")).with_port(0)
    }

    #[test]
    fn proxy_config_with_port() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir).with_port(8888);
        assert_eq!(config.addr.port(), 8888);
    }

    #[test]
    fn proxy_config_with_addr() {
        let dir = TempDir::new().unwrap();
        let addr = SocketAddr::from(([0, 0, 0, 0], 9999));
        let config = test_config(&dir).with_addr(addr);
        assert_eq!(config.addr, addr);
    }

    #[test]
    fn proxy_config_defaults() {
        let dir = TempDir::new().unwrap();
        let config = ProxyConfig::with_ca_dir(dir.path());
        assert_eq!(config.addr, SocketAddr::from(([127, 0, 0, 1], 8080)));
        assert!(config.limits.fail_open);
        assert!(config.upstream.is_none());
        assert!(config.policy.is_ai_domain("api.openai.com"));
    }

    #[test]
    fn proxy_server_new() {
        let dir = TempDir::new().unwrap();
        let server = ProxyServer::new(test_config(&dir));
        assert!(server.is_ok());
    }

    #[test]
    fn proxy_server_ca_paths() {
        let dir = TempDir::new().unwrap();
        let server = ProxyServer::new(test_config(&dir)).unwrap();

        let cert_path = server.ca_cert_path();
        assert!(cert_path.to_string_lossy().contains("tollgate-ca.crt"));

        let der = server.ca_cert_der();
        assert!(der.is_ok());
    }

    #[tokio::test]
    async fn start_serves_status_and_stops() {
        let dir = TempDir::new().unwrap();
        let server = ProxyServer::new(test_config(&dir)).unwrap();
        let handle = server.start().await.unwrap();
        assert_ne!(handle.addr().port(), 0);

        let mut client = TcpStream::connect(handle.addr()).await.unwrap();
        client.write_all(b"GET /status HTTP/1.1\r\n\r\n").await.unwrap();
        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        assert!(out.starts_with("HTTP/1.1 200 OK"));
        assert!(out.contains(&format!("\"listenAddr\": \"{}\"", handle.addr())));

        tokio::time::timeout(Duration::from_secs(5), handle.stop())
            .await
            .unwrap();
    }
}
