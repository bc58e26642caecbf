//! Responses generated by the proxy itself.
//!
//! Error responses are plain text with an exact `Content-Length`. The
//! listener also serves a PAC script and a small JSON status page to
//! non-CONNECT requests.

use std::net::SocketAddr;

use hyper::StatusCode;
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use tollgate_core::DomainPolicy;

/// A complete HTTP/1.1 response built in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntheticResponse {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub body: String,
    /// Send `Connection: close`; the caller closes after writing.
    pub close: bool,
}

impl SyntheticResponse {
    /// Plain text response.
    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: "text/plain; charset=utf-8",
            body: body.into(),
            close: false,
        }
    }

    /// Marks the response as ending the connection.
    pub fn closing(mut self) -> Self {
        self.close = true;
        self
    }

    /// Serializes status line, headers and body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\n",
            self.status.as_u16(),
            self.status.canonical_reason().unwrap_or(""),
            self.content_type,
            self.body.len()
        );
        out.push_str("Cache-Control: no-store\r\n");
        if self.close {
            out.push_str("Connection: close\r\n");
        }
        out.push_str("\r\n");
        out.push_str(&self.body);
        out.into_bytes()
    }

    /// Writes the response and flushes.
    pub async fn write_to<W>(&self, writer: &mut W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(&self.to_bytes()).await?;
        writer.flush().await
    }
}

/// 400 for a CONNECT target that cannot be parsed.
pub fn bad_request(detail: &str) -> SyntheticResponse {
    SyntheticResponse::text(StatusCode::BAD_REQUEST, format!("Bad request: {}\n", detail)).closing()
}

/// 403 for a request blocked by policy.
pub fn blocked(hostname: &str) -> SyntheticResponse {
    SyntheticResponse::text(
        StatusCode::FORBIDDEN,
        format!(
            "Request to {} was blocked by your organization's data protection policy.\n",
            hostname
        ),
    )
}

/// 411 for request bodies framed with Transfer-Encoding.
pub fn length_required() -> SyntheticResponse {
    SyntheticResponse::text(
        StatusCode::LENGTH_REQUIRED,
        "Requests must declare a Content-Length.\n",
    )
    .closing()
}

/// 413 for a body above the hard ceiling.
pub fn payload_too_large(limit: u64) -> SyntheticResponse {
    SyntheticResponse::text(
        StatusCode::PAYLOAD_TOO_LARGE,
        format!("Request body exceeds the {} byte limit.\n", limit),
    )
}

/// 502 when the origin could not be reached or misbehaved.
pub fn bad_gateway(hostname: &str) -> SyntheticResponse {
    SyntheticResponse::text(
        StatusCode::BAD_GATEWAY,
        format!("Could not reach {}.\n", hostname),
    )
    .closing()
}

/// 503 when inspection failed and the proxy fails closed.
pub fn inspection_unavailable() -> SyntheticResponse {
    SyntheticResponse::text(
        StatusCode::SERVICE_UNAVAILABLE,
        "Content inspection is unavailable; the request was not sent.\n",
    )
}

/// 504 when the origin did not answer in time.
pub fn gateway_timeout(hostname: &str) -> SyntheticResponse {
    SyntheticResponse::text(
        StatusCode::GATEWAY_TIMEOUT,
        format!("{} did not respond in time.\n", hostname),
    )
    .closing()
}

pub fn not_found() -> SyntheticResponse {
    SyntheticResponse::text(StatusCode::NOT_FOUND, "Not found.\n").closing()
}

/// 501 for absolute-form requests; only CONNECT is proxied.
pub fn not_implemented() -> SyntheticResponse {
    SyntheticResponse::text(
        StatusCode::NOT_IMPLEMENTED,
        "Only CONNECT tunnels are supported.\n",
    )
    .closing()
}

/// PAC script routing AI domains through the proxy.
pub fn pac_script(policy: &DomainPolicy, proxy_addr: SocketAddr) -> String {
    let domains = policy
        .ai_domains()
        .map(|d| format!("    \"{}\"", d))
        .collect::<Vec<_>>()
        .join(",\n");

    format!(
        r#"function FindProxyForURL(url, host) {{
  host = host.toLowerCase();
  var domains = [
{domains}
  ];
  for (var i = 0; i < domains.length; i++) {{
    var d = domains[i];
    if (host === d || dnsDomainIs(host, "." + d)) {{
      return "PROXY {proxy_addr}";
    }}
  }}
  return "DIRECT";
}}
"#
    )
}

/// The PAC script as a response.
pub fn pac_response(policy: &DomainPolicy, proxy_addr: SocketAddr) -> SyntheticResponse {
    SyntheticResponse {
        status: StatusCode::OK,
        content_type: "application/x-ns-proxy-autoconfig",
        body: pac_script(policy, proxy_addr),
        close: true,
    }
}

/// Snapshot shown on the status page.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub status: &'static str,
    pub version: &'static str,
    pub listen_addr: String,
    pub ai_domains: usize,
    pub passthrough_domains: usize,
    pub cached_leaf_certificates: usize,
    pub active_connections: u64,
    pub total_connections: u64,
    pub fail_open: bool,
}

/// The status page as a response.
pub fn status_response(report: &StatusReport) -> SyntheticResponse {
    let body = serde_json::to_string_pretty(report).unwrap_or_else(|_| "{}".to_string());
    SyntheticResponse {
        status: StatusCode::OK,
        content_type: "application/json",
        body: body + "\n",
        close: true,
    }
}
