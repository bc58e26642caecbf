//! Error types for the proxy.

use thiserror::Error;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// CA certificate error.
    #[error("CA error: {0}")]
    Ca(#[from] CaManagerError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Malformed request from the client.
    #[error("HTTP parse error: {0}")]
    Parse(#[from] ParseError),

    /// Upstream error.
    #[error("upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    /// Invalid CONNECT request.
    #[error("invalid CONNECT request: {0}")]
    InvalidConnect(String),

    /// An idle timeout fired.
    #[error("connection idle for more than {0:?}")]
    IdleTimeout(std::time::Duration),

    /// Proxy server error.
    #[error("Proxy error: {0}")]
    Proxy(String),
}

/// CA manager error type.
#[derive(Debug, Error)]
pub enum CaManagerError {
    /// Failed to generate a certificate or key.
    #[error("Failed to generate CA: {0}")]
    Generation(String),

    /// Failed to read CA certificate.
    #[error("Failed to read CA: {0}")]
    Read(#[from] std::io::Error),

    /// Failed to parse CA certificate.
    #[error("Failed to parse CA: {0}")]
    Parse(String),

    /// Failed to write CA certificate.
    #[error("Failed to write CA: {0}")]
    Write(String),

    /// Failed to sign a leaf certificate.
    #[error("Failed to sign certificate for {domain}: {reason}")]
    Signing {
        /// Domain the leaf was for.
        domain: String,
        /// Underlying error.
        reason: String,
    },
}

/// HTTP/1.1 request parse errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// The header block grew past the limit without a terminator.
    #[error("request headers exceed {0} bytes")]
    HeadersTooLarge(usize),

    /// The request line is not `METHOD TARGET VERSION`.
    #[error("malformed request line: {0:?}")]
    MalformedRequestLine(String),

    /// A header line has no colon.
    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),

    /// Content-Length is not a number.
    #[error("invalid content-length: {0:?}")]
    InvalidContentLength(String),

    /// The request uses Transfer-Encoding framing.
    #[error("unsupported transfer-encoding: {0:?}")]
    UnsupportedTransferEncoding(String),

    /// The header block is not valid UTF-8.
    #[error("request headers are not valid UTF-8")]
    NotUtf8,

    /// The parser already failed on this connection.
    #[error("parser is in a failed state")]
    Poisoned,
}

/// Errors talking to the origin server.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// TCP connect or DNS failed.
    #[error("connect to {addr} failed: {source}")]
    Connect {
        /// Target address.
        addr: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// TLS handshake with the origin failed.
    #[error("TLS handshake with {host} failed: {reason}")]
    Handshake {
        /// Origin host.
        host: String,
        /// Underlying error.
        reason: String,
    },

    /// The origin did not answer in time.
    #[error("upstream timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// HTTP protocol error on the upstream connection.
    #[error("upstream HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// The request could not be built.
    #[error("invalid upstream request: {0}")]
    InvalidRequest(String),
}

impl UpstreamError {
    /// Whether this error should be reported as a gateway timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
