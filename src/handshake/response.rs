// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! The server handshake response and its incremental parser.

use bytes::BytesMut;
use crate::extension::ExtensionConfig;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Version};
use log::trace;
use super::{Error, MAX_NUM_HEADERS};

const END_OF_HEAD: &[u8; 4] = b"\r\n\r\n";

/// The default upper bound of a response head in bytes.
pub const DEFAULT_MAX_HEAD_SIZE: usize = 8 * 1024;

/// A parsed server handshake response.
#[derive(Debug, Clone)]
pub struct Response {
    version: Version,
    status: StatusCode,
    reason: Option<String>,
    headers: HeaderMap,
    /// Extensions the server accepted, in header order.
    extensions: Vec<ExtensionConfig>,
    /// The sub-protocol the server selected.
    protocol: Option<String>
}

impl Response {
    /// The HTTP version of the response.
    pub fn version(&self) -> Version {
        self.version
    }

    /// The response status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The reason phrase, if any.
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    /// All response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The extensions the server accepted.
    ///
    /// Only populated once the response has been validated.
    pub fn extensions(&self) -> &[ExtensionConfig] {
        &self.extensions
    }

    /// The sub-protocol the server selected, if any.
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    pub(crate) fn set_extensions(&mut self, e: Vec<ExtensionConfig>) {
        self.extensions = e
    }

    pub(crate) fn set_protocol(&mut self, p: Option<String>) {
        self.protocol = p
    }
}

/// Incremental parser of a response head.
///
/// Bytes may arrive in arbitrary chunks. Every call only looks at the newly
/// supplied bytes to find the end of the head; the head is parsed as a whole
/// once complete. Bytes after the head are never consumed.
#[derive(Debug)]
pub struct ResponseParser {
    /// Head bytes seen so far.
    head: BytesMut,
    /// How many bytes of `END_OF_HEAD` the tail of `head` matches.
    matched: usize,
    max_head_size: usize
}

impl Default for ResponseParser {
    fn default() -> Self {
        ResponseParser::new(DEFAULT_MAX_HEAD_SIZE)
    }
}

impl ResponseParser {
    /// Create a parser accepting heads of at most `max_head_size` bytes.
    pub fn new(max_head_size: usize) -> Self {
        ResponseParser {
            head: BytesMut::new(),
            matched: 0,
            max_head_size
        }
    }

    /// Feed the bytes of `buf` to this parser.
    ///
    /// Returns `Ok(None)` if more input is needed, in which case all of
    /// `buf` has been consumed. Once the head is complete, only the head
    /// bytes are removed from `buf`.
    pub fn parse(&mut self, buf: &mut BytesMut) -> Result<Option<Response>, Error> {
        let mut end = None;
        for (i, b) in buf.iter().enumerate() {
            self.matched = if *b == END_OF_HEAD[self.matched] {
                self.matched + 1
            } else if *b == END_OF_HEAD[0] {
                1
            } else {
                0
            };
            if self.matched == END_OF_HEAD.len() {
                end = Some(i + 1);
                break
            }
        }

        let n = end.unwrap_or(buf.len());
        if self.head.len() + n > self.max_head_size {
            return Err(Error::HeadTooLarge(self.max_head_size))
        }
        self.head.extend_from_slice(&buf.split_to(n));

        if end.is_none() {
            trace!("response head incomplete after {} bytes", self.head.len());
            return Ok(None)
        }

        self.matched = 0;
        let head = self.head.split();
        decode(&head).map(Some)
    }
}

fn decode(head: &[u8]) -> Result<Response, Error> {
    let mut header_buf = [httparse::EMPTY_HEADER; MAX_NUM_HEADERS];
    let mut response = httparse::Response::new(&mut header_buf);

    match response.parse(head)? {
        httparse::Status::Complete(_) => {}
        httparse::Status::Partial => return Err(Error::Http("truncated response head".into()))
    }

    let version = match response.version {
        Some(1) => Version::HTTP_11,
        Some(0) => Version::HTTP_10,
        _ => return Err(Error::Http("unknown http version".into()))
    };
    let status = response.code
        .ok_or_else(|| Error::Http("missing status code".into()))
        .and_then(|c| StatusCode::from_u16(c).map_err(|e| Error::Http(Box::new(e))))?;

    let mut headers = HeaderMap::with_capacity(response.headers.len());
    for h in response.headers.iter() {
        let name = HeaderName::from_bytes(h.name.as_bytes()).map_err(|e| Error::Http(Box::new(e)))?;
        let value = HeaderValue::from_bytes(h.value).map_err(|e| Error::Http(Box::new(e)))?;
        headers.append(name, value);
    }

    Ok(Response {
        version,
        status,
        reason: response.reason.map(String::from),
        headers,
        extensions: Vec::new(),
        protocol: None
    })
}
