//! HTTP upgrade negotiation (RFC 6455 Section 4) and the few plain-HTTP
//! routes this server answers.
//!
//! The negotiator parses one buffered request known to end in `\r\n\r\n`,
//! walks the headers linearly (no generic header map — exactly four
//! headers matter), and computes the `Sec-WebSocket-Accept` token by
//! splicing a SHA-1/base64 digest into a fixed response template.
//!
//! Routes:
//! - `GET /` — WebSocket upgrade.
//! - `GET /json/version` — static JSON advertising the WebSocket URL,
//!   after which the caller half-closes the read side of the socket.
//!   Some driver clients probe this endpoint on a separate connection
//!   before upgrading on another; since only one connection is served at
//!   a time, closing keeps the second connection from queueing behind
//!   this probe's idle timeout.
//! - anything else — 404.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha1::{Digest, Sha1};
use std::fmt;

/// RFC 6455 GUID appended to the client key before hashing.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Ceiling on the size of an accepted request's header block.
pub const MAX_REQUEST_SIZE: usize = 4096;

/// Fixed 101 response; the accept token is spliced in at
/// [`ACCEPT_OFFSET`].
const RESPONSE_TEMPLATE: &[u8] = b"HTTP/1.1 101 Switching Protocols\r\n\
Upgrade: websocket\r\n\
Connection: upgrade\r\n\
Sec-Websocket-Accept: 0000000000000000000000000000\r\n\r\n";

/// Byte offset of the accept-token placeholder in the template.
const ACCEPT_OFFSET: usize = 97;

/// Length of the base64-encoded SHA-1 digest.
const ACCEPT_LEN: usize = 28;

// Required-header bits for the linear header walk.
const SEEN_UPGRADE: u8 = 1 << 0;
const SEEN_VERSION: u8 = 1 << 1;
const SEEN_CONNECTION: u8 = 1 << 2;
const SEEN_KEY: u8 = 1 << 3;
const SEEN_ALL: u8 = SEEN_UPGRADE | SEEN_VERSION | SEEN_CONNECTION | SEEN_KEY;

/// Upgrade / plain-HTTP errors. Each maps to a fixed 4xx response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeError {
    /// Malformed request line or header (missing terminator, no `:`).
    InvalidRequest,
    /// Request line does not end in `HTTP/1.1`.
    InvalidProtocol,
    /// `Upgrade` header present with a value other than `websocket`.
    InvalidUpgradeHeader,
    /// `Sec-WebSocket-Version` header present with a value other than `13`.
    InvalidVersionHeader,
    /// `Connection` header present without an `upgrade` token.
    InvalidConnectionHeader,
    /// Not all four required upgrade headers were seen.
    MissingHeaders,
    /// Unknown request path.
    NotFound,
    /// Header block exceeds [`MAX_REQUEST_SIZE`].
    RequestTooLarge,
}

impl UpgradeError {
    /// HTTP status code for the error response.
    #[must_use]
    pub fn status(self) -> u16 {
        match self {
            Self::NotFound => 404,
            Self::RequestTooLarge => 413,
            _ => 400,
        }
    }

    /// Fixed response body.
    #[must_use]
    pub fn body(self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid request",
            Self::InvalidProtocol => "Invalid protocol",
            Self::InvalidUpgradeHeader => "Invalid Upgrade header",
            Self::InvalidVersionHeader => "Invalid Sec-WebSocket-Version header",
            Self::InvalidConnectionHeader => "Invalid Connection header",
            Self::MissingHeaders => "Missing required headers",
            Self::NotFound => "Not found",
            Self::RequestTooLarge => "Request too large",
        }
    }

    /// The complete error response for this error.
    #[must_use]
    pub fn response(self) -> Vec<u8> {
        error_response(self.status(), self.body())
    }
}

impl fmt::Display for UpgradeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRequest => write!(f, "malformed HTTP request"),
            Self::InvalidProtocol => write!(f, "request is not HTTP/1.1"),
            Self::InvalidUpgradeHeader => write!(f, "Upgrade header must be 'websocket'"),
            Self::InvalidVersionHeader => write!(f, "Sec-WebSocket-Version must be '13'"),
            Self::InvalidConnectionHeader => {
                write!(f, "Connection header must contain 'upgrade'")
            }
            Self::MissingHeaders => write!(f, "missing required upgrade headers"),
            Self::NotFound => write!(f, "unknown path"),
            Self::RequestTooLarge => write!(f, "request exceeds {MAX_REQUEST_SIZE} bytes"),
        }
    }
}

impl std::error::Error for UpgradeError {}

/// What the buffered request asks the connection to do next.
#[derive(Debug)]
pub enum HttpAction {
    /// Upgrade accepted: send these bytes, then switch to the protocol.
    Upgrade(Vec<u8>),
    /// Send the version document, then half-close the read side.
    ServeJsonVersion,
}

/// Parse one buffered request (ending in `\r\n\r\n`) and decide what to
/// do with the connection.
///
/// # Errors
///
/// Any [`UpgradeError`]; the caller sends [`UpgradeError::response`] and
/// tears the connection down.
pub fn parse_request(head: &[u8]) -> Result<HttpAction, UpgradeError> {
    let line_end = find_crlf(head).ok_or(UpgradeError::InvalidRequest)?;
    let line = &head[..line_end];

    let path = request_path(line)?;
    match path {
        b"/" => {
            let response = negotiate_upgrade(&head[line_end + 2..])?;
            Ok(HttpAction::Upgrade(response))
        }
        b"/json/version" => Ok(HttpAction::ServeJsonVersion),
        _ => Err(UpgradeError::NotFound),
    }
}

/// Extract the path from a `GET <path> HTTP/1.1` request line.
fn request_path(line: &[u8]) -> Result<&[u8], UpgradeError> {
    const VERSION: &[u8] = b"HTTP/1.1";

    let rest = line
        .strip_prefix(b"GET ")
        .ok_or(UpgradeError::InvalidRequest)?;
    if rest.len() < VERSION.len() + 1 {
        return Err(UpgradeError::InvalidProtocol);
    }
    let (path, version) = rest.split_at(rest.len() - VERSION.len());
    if !version.eq_ignore_ascii_case(VERSION) {
        return Err(UpgradeError::InvalidProtocol);
    }
    let path = trim_ascii(path);
    if path.is_empty() {
        return Err(UpgradeError::InvalidRequest);
    }
    Ok(path)
}

/// Walk the header block and build the 101 response.
fn negotiate_upgrade(headers: &[u8]) -> Result<Vec<u8>, UpgradeError> {
    let mut seen = 0u8;
    let mut key: &[u8] = b"";

    let mut rest = headers;
    loop {
        let line_end = find_crlf(rest).ok_or(UpgradeError::InvalidRequest)?;
        let line = &rest[..line_end];
        rest = &rest[line_end + 2..];
        if line.is_empty() {
            break;
        }

        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or(UpgradeError::InvalidRequest)?;
        let name = trim_ascii(&line[..colon]);
        let value = trim_ascii(&line[colon + 1..]);

        if name.eq_ignore_ascii_case(b"upgrade") {
            if !value.eq_ignore_ascii_case(b"websocket") {
                return Err(UpgradeError::InvalidUpgradeHeader);
            }
            seen |= SEEN_UPGRADE;
        } else if name.eq_ignore_ascii_case(b"sec-websocket-version") {
            if value != b"13" {
                return Err(UpgradeError::InvalidVersionHeader);
            }
            seen |= SEEN_VERSION;
        } else if name.eq_ignore_ascii_case(b"connection") {
            // The value commonly lists several tokens ("keep-alive,
            // Upgrade"); match the substring anywhere.
            if !contains_ignore_ascii_case(value, b"upgrade") {
                return Err(UpgradeError::InvalidConnectionHeader);
            }
            seen |= SEEN_CONNECTION;
        } else if name.eq_ignore_ascii_case(b"sec-websocket-key") {
            key = value;
            seen |= SEEN_KEY;
        }
    }

    if seen != SEEN_ALL {
        return Err(UpgradeError::MissingHeaders);
    }
    Ok(upgrade_response(key))
}

/// Build the 101 response for a client key: splice
/// base64(SHA-1(key || GUID)) into the fixed template.
#[must_use]
pub fn upgrade_response(key: &[u8]) -> Vec<u8> {
    let mut response = RESPONSE_TEMPLATE.to_vec();
    let token = compute_accept_token(key);
    response[ACCEPT_OFFSET..ACCEPT_OFFSET + ACCEPT_LEN].copy_from_slice(token.as_bytes());
    response
}

/// Compute the `Sec-WebSocket-Accept` token for a client key.
///
/// Per RFC 6455 Section 4.2.2: SHA-1 over the key concatenated with the
/// GUID, base64-encoded.
#[must_use]
pub fn compute_accept_token(key: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key);
    hasher.update(WS_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Build the `/json/version` response advertising the WebSocket URL.
#[must_use]
pub fn json_version_response(host: &str, port: u16) -> Vec<u8> {
    let body = format!("{{\"webSocketDebuggerUrl\": \"ws://{host}:{port}/\"}}");
    let mut response = format!(
        "HTTP/1.1 200 OK\r\nConnection: Close\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    response.push_str(&body);
    response.into_bytes()
}

/// Build a fixed-format error response.
#[must_use]
pub fn error_response(status: u16, body: &str) -> Vec<u8> {
    let mut response = format!(
        "HTTP/1.1 {status} \r\nConnection: Close\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    response.push_str(body);
    response.into_bytes()
}

/// The 500 response for errors outside the upgrade taxonomy.
#[must_use]
pub fn internal_error_response() -> Vec<u8> {
    error_response(500, "Internal server error")
}

fn find_crlf(bytes: &[u8]) -> Option<usize> {
    bytes.windows(2).position(|w| w == b"\r\n")
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace());
    let Some(start) = start else { return &[] };
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .expect("non-empty after start found");
    &bytes[start..=end]
}

fn contains_ignore_ascii_case(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|w| w.eq_ignore_ascii_case(needle))
}
