//! Reading the first request on a proxy connection.
//!
//! Clients open with `CONNECT host:port HTTP/1.1`. Anything read past the
//! header block belongs to the tunnel (usually the TLS ClientHello) and is
//! handed back to the caller for replay.

use std::fmt;
use std::net::Ipv6Addr;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{ProxyError, Result};
use crate::parser::{find_terminator, parse_head, RequestHead, HEADER_TERMINATOR};

/// Maximum size of the head of a proxy request.
pub const MAX_CONNECT_HEAD_BYTES: usize = 8 * 1024;

/// Port used when a CONNECT target has none.
pub const DEFAULT_CONNECT_PORT: u16 = 443;

/// Reply sent once a tunnel is accepted.
pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// The opening request plus bytes the client sent after it.
#[derive(Debug)]
pub struct OpeningRequest {
    pub head: RequestHead,
    pub leftover: BytesMut,
}

impl OpeningRequest {
    pub fn is_connect(&self) -> bool {
        self.head.method.eq_ignore_ascii_case("CONNECT")
    }
}

/// Reads the first request head.
///
/// Returns `Ok(None)` if the client closed before sending anything.
pub async fn read_opening_request<R>(reader: &mut R) -> Result<Option<OpeningRequest>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);

    let end = loop {
        if let Some(end) = find_terminator(&buf) {
            break end;
        }
        if buf.len() > MAX_CONNECT_HEAD_BYTES {
            return Err(ProxyError::InvalidConnect(format!(
                "request head exceeds {} bytes",
                MAX_CONNECT_HEAD_BYTES
            )));
        }

        let n = reader.read_buf(&mut buf).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(ProxyError::InvalidConnect(
                "connection closed mid-request".into(),
            ));
        }
    };

    let head = parse_head(&buf[..end]).map_err(|e| ProxyError::InvalidConnect(e.to_string()))?;
    let leftover = buf.split_off(end + HEADER_TERMINATOR.len());

    Ok(Some(OpeningRequest { head, leftover }))
}

/// Host and port from a CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectTarget {
    /// Lowercased host, IPv6 without brackets.
    pub host: String,
    pub port: u16,
}

impl ConnectTarget {
    /// Parses `host[:port]`, `[v6]:port` or a bare IPv6 literal.
    pub fn parse(target: &str) -> Result<Self> {
        let invalid = || ProxyError::InvalidConnect(format!("malformed target {:?}", target));
        let target = target.trim();

        let (host, port) = if let Some(rest) = target.strip_prefix('[') {
            let (host, after) = rest.split_once(']').ok_or_else(invalid)?;
            host.parse::<Ipv6Addr>().map_err(|_| invalid())?;
            let port = match after {
                "" => None,
                p => Some(p.strip_prefix(':').ok_or_else(invalid)?),
            };
            (host, port)
        } else if target.parse::<Ipv6Addr>().is_ok() {
            (target, None)
        } else {
            match target.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (target, None),
            }
        };

        let port = match port {
            Some(p) => match p.parse::<u16>() {
                Ok(0) | Err(_) => return Err(invalid()),
                Ok(p) => p,
            },
            None => DEFAULT_CONNECT_PORT,
        };

        if host.is_empty() || !host.chars().all(is_host_char) {
            return Err(invalid());
        }

        Ok(Self {
            host: host.to_ascii_lowercase(),
            port,
        })
    }

    /// Address suitable for `TcpStream::connect`.
    pub fn socket_addr(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

fn is_host_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | ':')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_with_explicit_port() {
        let t = ConnectTarget::parse("api.openai.com:8443").unwrap();
        assert_eq!(t.host, "api.openai.com");
        assert_eq!(t.port, 8443);
        assert_eq!(t.to_string(), "api.openai.com:8443");
    }

    #[test]
    fn target_defaults_to_443() {
        let t = ConnectTarget::parse("Claude.AI").unwrap();
        assert_eq!(t.host, "claude.ai");
        assert_eq!(t.port, 443);
    }

    #[test]
    fn ipv6_targets() {
        let t = ConnectTarget::parse("[::1]:8443").unwrap();
        assert_eq!(t.host, "::1");
        assert_eq!(t.port, 8443);
        assert_eq!(t.socket_addr(), "[::1]:8443");

        let t = ConnectTarget::parse("[2001:db8::1]").unwrap();
        assert_eq!(t.port, 443);

        let t = ConnectTarget::parse("2001:db8::1").unwrap();
        assert_eq!(t.host, "2001:db8::1");
        assert_eq!(t.port, 443);
    }

    #[test]
    fn malformed_targets() {
        for bad in [
            "",
            ":443",
            "host:",
            "host:0",
            "host:99999",
            "host:abc",
            "[::1",
            "[::1]443",
            "[not-ip]:443",
            "ho st:443",
            "a:b:c",
            "host/path:443",
        ] {
            assert!(ConnectTarget::parse(bad).is_err(), "{:?} should be rejected", bad);
        }
    }

    #[tokio::test]
    async fn reads_connect_and_keeps_leftover() {
        let data = b"CONNECT api.openai.com:443 HTTP/1.1\r\nHost: api.openai.com:443\r\n\r\n\x16\x03\x01hello";
        let mut reader = &data[..];

        let opening = read_opening_request(&mut reader).await.unwrap().unwrap();
        assert!(opening.is_connect());
        assert_eq!(opening.head.path, "api.openai.com:443");
        assert_eq!(&opening.leftover[..], b"\x16\x03\x01hello");
    }

    #[tokio::test]
    async fn head_split_across_reads() {
        let mut reader = tokio_test::io::Builder::new()
            .read(b"CONNECT claude.ai:4")
            .read(b"43 HTTP/1.1\r\nHost: claude.ai\r")
            .read(b"\n\r\n\x16\x03")
            .build();

        let opening = read_opening_request(&mut reader).await.unwrap().unwrap();
        assert_eq!(ConnectTarget::parse(&opening.head.path).unwrap().port, 443);
        assert_eq!(opening.head.headers.get("host"), Some("claude.ai"));
        assert_eq!(&opening.leftover[..], b"\x16\x03");
    }

    #[tokio::test]
    async fn eof_before_request() {
        let mut reader = &b""[..];
        assert!(read_opening_request(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_head_is_rejected() {
        let mut data = b"CONNECT a:443 HTTP/1.1\r\n".to_vec();
        data.extend(std::iter::repeat(b'x').take(MAX_CONNECT_HEAD_BYTES + 10));
        let mut reader = &data[..];

        assert!(matches!(
            read_opening_request(&mut reader).await,
            Err(ProxyError::InvalidConnect(_))
        ));
    }

    #[tokio::test]
    async fn truncated_head_is_rejected() {
        let mut reader = &b"CONNECT a:443 HTTP/1.1\r\n"[..];
        assert!(read_opening_request(&mut reader).await.is_err());
    }
}
