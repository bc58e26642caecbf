//! Incremental HTTP/1.1 request parser.
//!
//! The parser owns an append-only buffer fed with decrypted bytes from the
//! client. Callers push bytes with [`RequestParser::feed`] and then pull
//! events with [`RequestParser::next_event`] until it returns `Ok(None)`.
//!
//! ```text
//! HEADERS ──► BODY ──────► HEADERS   (buffered, emits Request)
//!        ├──► STREAMING ─► HEADERS   (LargeBodyStart, BodyChunk*, LargeBodyEnd)
//!        └──► DRAINING ──► HEADERS   (Oversized, bytes discarded)
//! ```
//!
//! Each logical request yields exactly one of `Request`, `LargeBodyStart` or
//! `Oversized`. Bytes past the end of one message are parsed as the next
//! message in the same pull loop, so pipelined requests come out in order.

use bytes::{Bytes, BytesMut};

use crate::error::ParseError;

/// Maximum size of a request line plus header block.
pub const MAX_HEADER_BYTES: usize = 64 * 1024;

pub(crate) const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Ordered header list with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    /// Creates an empty header list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a header, keeping duplicates.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// First value for `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether a header named `name` is present.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Iterates headers in wire order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Number of header lines, duplicates included.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the request carried no headers.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Parsed request line and headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    /// Request target as sent (origin-form for MITM traffic).
    pub path: String,
    pub version: String,
    pub headers: Headers,
    /// Declared `Content-Length`, 0 when absent.
    pub content_length: u64,
    /// `Content-Type` is `multipart/*`.
    pub multipart: bool,
    /// `Expect: 100-continue` was sent.
    pub expects_continue: bool,
}

impl RequestHead {
    /// Whether the request is a `HEAD`.
    pub fn is_head(&self) -> bool {
        self.method.eq_ignore_ascii_case("HEAD")
    }
}

/// A fully buffered request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
    pub head: RequestHead,
    pub body: Bytes,
}

/// Events produced by the parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseEvent {
    /// The client is waiting for `100 Continue` before sending the body.
    ContinueRequested,
    /// A complete request with its whole body.
    Request(ParsedRequest),
    /// A multipart body too large to inspect; chunks follow.
    LargeBodyStart(RequestHead),
    /// Part of a streamed body.
    BodyChunk(Bytes),
    /// The streamed body is complete.
    LargeBodyEnd,
    /// The body exceeds the hard ceiling and will be discarded.
    Oversized(RequestHead),
}

#[derive(Debug)]
enum State {
    Headers,
    Body {
        head: RequestHead,
        continue_pending: bool,
    },
    Streaming {
        remaining: u64,
        continue_pending: bool,
    },
    Draining {
        remaining: u64,
    },
    Failed,
}

/// Per-connection HTTP/1.1 request parser.
#[derive(Debug)]
pub struct RequestParser {
    buffer: BytesMut,
    state: State,
    max_body_bytes: u64,
    max_inspection_bytes: u64,
    bytes_streamed: u64,
}

impl RequestParser {
    /// Creates a parser with the given body ceilings.
    pub fn new(max_body_bytes: u64, max_inspection_bytes: u64) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
            state: State::Headers,
            max_body_bytes,
            max_inspection_bytes,
            bytes_streamed: 0,
        }
    }

    /// Appends bytes read from the client.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes emitted so far for the current streamed body.
    pub fn bytes_streamed(&self) -> u64 {
        self.bytes_streamed
    }

    /// True when no message is partially parsed.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Headers) && self.buffer.is_empty()
    }

    /// Pulls the next event, or `Ok(None)` when more bytes are needed.
    ///
    /// Any error leaves the parser poisoned; later calls return
    /// [`ParseError::Poisoned`].
    pub fn next_event(&mut self) -> Result<Option<ParseEvent>, ParseError> {
        loop {
            match std::mem::replace(&mut self.state, State::Headers) {
                State::Failed => {
                    self.state = State::Failed;
                    return Err(ParseError::Poisoned);
                }

                State::Headers => match self.parse_headers() {
                    Ok(Some(event)) => return Ok(Some(event)),
                    Ok(None) => return Ok(None),
                    Err(e) => {
                        self.state = State::Failed;
                        return Err(e);
                    }
                },

                State::Body {
                    head,
                    continue_pending,
                } => {
                    if continue_pending {
                        self.state = State::Body {
                            head,
                            continue_pending: false,
                        };
                        return Ok(Some(ParseEvent::ContinueRequested));
                    }

                    let needed = head.content_length as usize;
                    if self.buffer.len() < needed {
                        self.state = State::Body {
                            head,
                            continue_pending: false,
                        };
                        return Ok(None);
                    }

                    let body = self.buffer.split_to(needed).freeze();
                    return Ok(Some(ParseEvent::Request(ParsedRequest { head, body })));
                }

                State::Streaming {
                    remaining,
                    continue_pending,
                } => {
                    if continue_pending {
                        self.state = State::Streaming {
                            remaining,
                            continue_pending: false,
                        };
                        return Ok(Some(ParseEvent::ContinueRequested));
                    }

                    if remaining == 0 {
                        return Ok(Some(ParseEvent::LargeBodyEnd));
                    }

                    if self.buffer.is_empty() {
                        self.state = State::Streaming {
                            remaining,
                            continue_pending: false,
                        };
                        return Ok(None);
                    }

                    let take = take_len(self.buffer.len(), remaining);
                    let chunk = self.buffer.split_to(take).freeze();
                    self.bytes_streamed += take as u64;
                    self.state = State::Streaming {
                        remaining: remaining - take as u64,
                        continue_pending: false,
                    };
                    return Ok(Some(ParseEvent::BodyChunk(chunk)));
                }

                State::Draining { remaining } => {
                    let take = take_len(self.buffer.len(), remaining);
                    let _ = self.buffer.split_to(take);
                    let remaining = remaining - take as u64;
                    if remaining > 0 {
                        self.state = State::Draining { remaining };
                        return Ok(None);
                    }
                    // Drained; parse whatever follows.
                }
            }
        }
    }

    /// Parses a header block if one is complete and picks the body mode.
    fn parse_headers(&mut self) -> Result<Option<ParseEvent>, ParseError> {
        // Tolerate stray CRLFs between pipelined messages.
        while self.buffer.starts_with(b"\r\n") {
            let _ = self.buffer.split_to(2);
        }

        let Some(end) = find_terminator(&self.buffer) else {
            if self.buffer.len() > MAX_HEADER_BYTES {
                return Err(ParseError::HeadersTooLarge(MAX_HEADER_BYTES));
            }
            return Ok(None);
        };

        if end + HEADER_TERMINATOR.len() > MAX_HEADER_BYTES {
            return Err(ParseError::HeadersTooLarge(MAX_HEADER_BYTES));
        }

        let raw = self.buffer.split_to(end + HEADER_TERMINATOR.len());
        let head = parse_head(&raw[..end])?;

        let length = head.content_length;
        if length > self.max_body_bytes {
            self.state = State::Draining { remaining: length };
            return Ok(Some(ParseEvent::Oversized(head)));
        }

        if head.multipart && length > self.max_inspection_bytes {
            self.bytes_streamed = 0;
            self.state = State::Streaming {
                remaining: length,
                continue_pending: head.expects_continue,
            };
            return Ok(Some(ParseEvent::LargeBodyStart(head)));
        }

        if length == 0 {
            return Ok(Some(ParseEvent::Request(ParsedRequest {
                head,
                body: Bytes::new(),
            })));
        }

        let continue_pending = head.expects_continue;
        self.state = State::Body {
            head,
            continue_pending,
        };
        // The body may already be buffered; let the caller pull again.
        self.next_event()
    }
}

fn take_len(available: usize, remaining: u64) -> usize {
    usize::try_from(remaining).map_or(available, |r| available.min(r))
}

pub(crate) fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|w| w == HEADER_TERMINATOR)
}

/// Parses a request line and header block (without the blank line).
pub(crate) fn parse_head(raw: &[u8]) -> Result<RequestHead, ParseError> {
    let text = std::str::from_utf8(raw).map_err(|_| ParseError::NotUtf8)?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let (method, path, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(p), Some(v), None) if v.starts_with("HTTP/") => (m, p, v),
        _ => return Err(ParseError::MalformedRequestLine(request_line.to_string())),
    };

    let mut headers = Headers::new();
    for line in lines.filter(|l| !l.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ParseError::MalformedHeader(line.to_string()))?;
        headers.push(name.trim(), value.trim());
    }

    if let Some(te) = headers.get("transfer-encoding") {
        return Err(ParseError::UnsupportedTransferEncoding(te.to_string()));
    }

    let content_length = match headers.get("content-length") {
        Some(v) => v
            .parse::<u64>()
            .map_err(|_| ParseError::InvalidContentLength(v.to_string()))?,
        None => 0,
    };

    let multipart = headers
        .get("content-type")
        .is_some_and(|ct| ct.to_ascii_lowercase().starts_with("multipart/"));

    let expects_continue = headers
        .get("expect")
        .is_some_and(|v| v.eq_ignore_ascii_case("100-continue"));

    Ok(RequestHead {
        method: method.to_string(),
        path: path.to_string(),
        version: version.to_string(),
        headers,
        content_length,
        multipart,
        expects_continue,
    })
}
