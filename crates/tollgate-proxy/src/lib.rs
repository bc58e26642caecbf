//! Tollgate Proxy - TLS-terminating proxy for AI-provider traffic.
//!
//! Clients send `CONNECT host:port` to the listener. Hosts outside the AI
//! domain set are tunnelled untouched; AI hosts are terminated with a leaf
//! certificate signed by the local root CA, and every decrypted request is
//! inspected before it is forwarded.
//!
//! ## Features
//!
//! - Generates the root CA on first run, mints leaf certificates on demand
//! - Incremental HTTP/1.1 parser with keep-alive and pipelining
//! - Bodies above the inspection limit stream straight upstream
//! - Bodies above the size limit are drained and answered with 413
//! - Inspector failures fail open or closed depending on configuration
//! - Serves a PAC script and a status page on plain HTTP requests
//!
//! ## Architecture
//!
//! ```text
//! Client ─► CONNECT ─► Domain Check ─┬─ passthrough ───────────► TCP tunnel
//!                                    ├─ metadata-only ─► record ─► TCP tunnel
//!                                    └─ deep-inspect
//!                                           │
//!                                           ▼
//!                                   TLS (leaf cert) ─► Parser
//!                                                        │
//!                                           ┌────────────┼──────────────┐
//!                                           │ ≤ inspect  │ ≤ max body   │ > max body
//!                                           ▼            ▼              ▼
//!                                        Inspect      Stream          413
//!                                           │         upstream
//!                                  ┌────────┴────────┐
//!                                  │ Allow/Warn      │ Block
//!                                  ▼                 ▼
//!                            Forward Request        403
//! ```

mod ca;
mod connect;
mod dispatcher;
mod error;
mod guards;
mod handler;
mod parser;
mod proxy;
mod responses;
mod tunnel;
mod upstream;

pub use ca::{CaManager, CertificateAuthority, LeafCertificate, CA_COMMON_NAME};
pub use connect::{ConnectTarget, DEFAULT_CONNECT_PORT};
pub use dispatcher::Dispatcher;
pub use error::{CaManagerError, ParseError, ProxyError, Result, UpstreamError};
pub use guards::{
    Limits, MemoryWatchdog, DEFAULT_IDLE_TIMEOUT, DEFAULT_INSPECTION_TIMEOUT, DEFAULT_MAX_BODY_BYTES,
    DEFAULT_MAX_INSPECTION_BYTES, DEFAULT_MAX_MEMORY_MB,
};
pub use handler::{ConnectionStats, Disposition, HandlerConfig, ProxyHandler, RequestScope};
pub use parser::{Headers, ParseEvent, ParsedRequest, RequestHead, RequestParser, MAX_HEADER_BYTES};
pub use proxy::{ProxyConfig, ProxyHandle, ProxyServer};
pub use responses::{pac_script, StatusReport, SyntheticResponse};
pub use upstream::{send_over, RelayOutcome, TlsUpstream, Upstream, UpstreamBody};

/// Default proxy port.
pub const DEFAULT_PROXY_PORT: u16 = 8080;
