// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! Websocket client [handshake].
//!
//! [handshake]: https://tools.ietf.org/html/rfc6455#section-4

pub mod client;
pub mod request;
pub mod response;

mod notify;
mod validate;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use futures::task::SpawnError;
use http::HeaderMap;
use sha1::{Digest, Sha1};
use std::{fmt, io, str};

pub use client::{Config, UpgradeConnection};
pub use notify::Handshake;
pub use request::Request;
pub use response::{Response, ResponseParser};
pub use validate::validate;

// Defined in RFC6455 and used to generate the `Sec-WebSocket-Accept` header
// in the server handshake response.
const KEY: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

// How many HTTP headers do we support during parsing?
const MAX_NUM_HEADERS: usize = 32;

// Some HTTP headers we need to check during parsing.
const SEC_WEBSOCKET_ACCEPT: &str = "Sec-WebSocket-Accept";
const SEC_WEBSOCKET_EXTENSIONS: &str = "Sec-WebSocket-Extensions";
const SEC_WEBSOCKET_PROTOCOL: &str = "Sec-WebSocket-Protocol";

/// Compute the `Sec-WebSocket-Accept` token the server must answer with for
/// the given `Sec-WebSocket-Key`.
pub fn accept_key(key: &[u8]) -> String {
    let mut digest = Sha1::new();
    digest.update(key);
    digest.update(KEY);
    BASE64.encode(digest.finalize())
}

/// Check that a header is present and that one of its comma-separated
/// values matches `ours`, ignoring ASCII case.
fn expect_ascii_header(headers: &HeaderMap, name: &str, ours: &str) -> Result<(), Error> {
    let mut found = false;
    for value in headers.get_all(name) {
        found = true;
        let theirs = value.to_str().map_err(|_| Error::UnexpectedHeader(name.into()))?;
        if theirs.split(',').any(|v| v.trim().eq_ignore_ascii_case(ours)) {
            return Ok(())
        }
    }
    if found {
        Err(Error::UnexpectedHeader(name.into()))
    } else {
        Err(Error::HeaderNotFound(name.into()))
    }
}

/// Pick the first header with the given name and apply the given closure to it.
fn with_first_header<'a, F, R>(headers: &'a HeaderMap, name: &str, f: F) -> Result<R, Error>
where
    F: Fn(&'a [u8]) -> Result<R, Error>
{
    if let Some(h) = headers.get(name) {
        f(h.as_bytes())
    } else {
        Err(Error::HeaderNotFound(name.into()))
    }
}

// Error type /////////////////////////////////////////////////////////////////////////////////////

/// The failure classes a handshake may end with.
///
/// The class decides how the endpoint is shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// I/O failure or end of stream before a complete response.
    Transport,
    /// The response could not be parsed.
    Protocol,
    /// The peer responded but did not accept the upgrade correctly.
    Validation,
    /// The handshake request itself was unusable.
    Construction
}

impl Kind {
    /// Is the underlying stream itself broken?
    ///
    /// If so, the endpoint is closed right away instead of shutting down
    /// its output first.
    pub fn is_stream_fault(self) -> bool {
        matches!(self, Kind::Transport | Kind::Protocol)
    }
}

/// Enumeration of possible handshake errors.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// An I/O error has been encountered.
    Io(io::Error),
    /// The stream ended before a complete response was received.
    Closed,
    /// The handshake was aborted before it could complete.
    Aborted,
    /// The task sending the request could not be spawned.
    Spawn(SpawnError),
    /// The HTTP entity could not be parsed successfully.
    Http(Box<dyn std::error::Error + Send + Sync + 'static>),
    /// The response head exceeded the configured maximum size.
    HeadTooLarge(usize),
    /// An HTTP version =/= 1.1 was encountered.
    UnsupportedHttpVersion,
    /// The HTTP response code was unexpected.
    UnexpectedStatusCode(u16),
    /// An HTTP header has not been present.
    HeaderNotFound(String),
    /// An HTTP header value was not expected.
    UnexpectedHeader(String),
    /// The Sec-WebSocket-Accept header value did not match.
    InvalidSecWebSocketAccept,
    /// The server returned a protocol we did not ask for.
    UnsolicitedProtocol,
    /// UTF-8 decoding failed.
    Utf8(str::Utf8Error),
    /// The handshake request could not be constructed.
    InvalidRequest(String)
}

impl Error {
    /// The failure class of this error.
    pub fn kind(&self) -> Kind {
        match self {
            Error::Io(_)
            | Error::Closed
            | Error::Aborted
            | Error::Spawn(_) => Kind::Transport,
            Error::Http(_)
            | Error::HeadTooLarge(_) => Kind::Protocol,
            Error::UnsupportedHttpVersion
            | Error::UnexpectedStatusCode(_)
            | Error::HeaderNotFound(_)
            | Error::UnexpectedHeader(_)
            | Error::InvalidSecWebSocketAccept
            | Error::UnsolicitedProtocol
            | Error::Utf8(_) => Kind::Validation,
            Error::InvalidRequest(_) => Kind::Construction
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "i/o error: {}", e),
            Error::Closed => f.write_str("connection closed before handshake completed"),
            Error::Aborted => f.write_str("handshake aborted"),
            Error::Spawn(e) => write!(f, "failed to spawn request task: {}", e),
            Error::Http(e) => write!(f, "http parser error: {}", e),
            Error::HeadTooLarge(n) => write!(f, "response head exceeds {} bytes", n),
            Error::UnsupportedHttpVersion => f.write_str("http version was not 1.1"),
            Error::UnexpectedStatusCode(c) => write!(f, "unexpected response status: {}", c),
            Error::HeaderNotFound(n) => write!(f, "header {} not found", n),
            Error::UnexpectedHeader(n) => write!(f, "header {} had unexpected value", n),
            Error::InvalidSecWebSocketAccept => f.write_str("websocket key mismatch"),
            Error::UnsolicitedProtocol => f.write_str("unsolicited protocol returned"),
            Error::Utf8(e) => write!(f, "utf-8 decoding error: {}", e),
            Error::InvalidRequest(msg) => write!(f, "invalid handshake request: {}", msg)
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Spawn(e) => Some(e),
            Error::Http(e) => Some(&**e),
            Error::Utf8(e) => Some(e),
            Error::Closed
            | Error::Aborted
            | Error::HeadTooLarge(_)
            | Error::UnsupportedHttpVersion
            | Error::UnexpectedStatusCode(_)
            | Error::HeaderNotFound(_)
            | Error::UnexpectedHeader(_)
            | Error::InvalidSecWebSocketAccept
            | Error::UnsolicitedProtocol
            | Error::InvalidRequest(_) => None
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<str::Utf8Error> for Error {
    fn from(e: str::Utf8Error) -> Self {
        Error::Utf8(e)
    }
}

impl From<httparse::Error> for Error {
    fn from(e: httparse::Error) -> Self {
        Error::Http(Box::new(e))
    }
}

impl From<SpawnError> for Error {
    fn from(e: SpawnError) -> Self {
        Error::Spawn(e)
    }
}
