// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! The client handshake request.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use bytes::BytesMut;
use crate::extension::{Extension, ExtensionConfig};
use http::{HeaderMap, HeaderName, HeaderValue, Uri};
use smallvec::SmallVec;
use super::{Error, SEC_WEBSOCKET_EXTENSIONS, SEC_WEBSOCKET_PROTOCOL};

/// A websocket upgrade request.
///
/// The request is validated when constructed; once the handshake has
/// started it is only read.
#[derive(Debug, Clone)]
pub struct Request {
    /// The value of the `Host` header.
    host: String,
    /// The HTTP resource (path and query).
    resource: String,
    /// The base-64 encoded request nonce.
    key: String,
    /// The HTTP origin header.
    origin: Option<String>,
    /// The protocols to include in the handshake.
    protocols: SmallVec<[String; 4]>,
    /// The extensions offered in the handshake.
    extensions: SmallVec<[ExtensionConfig; 4]>,
    /// Additional HTTP headers.
    headers: HeaderMap
}

impl Request {
    /// Create a new request for the given target URI with a random key.
    ///
    /// The URI must use one of the schemes `ws`, `wss`, `http` or `https`
    /// and must contain a host.
    pub fn new(uri: &str) -> Result<Self, Error> {
        let uri: Uri = uri.parse().map_err(|e| Error::InvalidRequest(format!("{}: {}", uri, e)))?;
        Request::from_uri(&uri)
    }

    /// Create a new request for the given target URI with a random key.
    pub fn from_uri(uri: &Uri) -> Result<Self, Error> {
        match uri.scheme_str() {
            Some("ws") | Some("wss") | Some("http") | Some("https") => {}
            Some(other) => return Err(Error::InvalidRequest(format!("unsupported scheme: {}", other))),
            None => return Err(Error::InvalidRequest(format!("missing scheme: {}", uri)))
        }
        let host = match uri.authority() {
            Some(a) if !a.host().is_empty() => a.as_str().to_string(),
            _ => return Err(Error::InvalidRequest(format!("missing host: {}", uri)))
        };
        let resource = uri.path_and_query().map(|p| p.as_str()).filter(|p| !p.is_empty()).unwrap_or("/");
        let nonce: [u8; 16] = rand::random();
        Ok(Request {
            host,
            resource: resource.to_string(),
            key: BASE64.encode(nonce),
            origin: None,
            protocols: SmallVec::new(),
            extensions: SmallVec::new(),
            headers: HeaderMap::new()
        })
    }

    /// Use the given `Sec-WebSocket-Key` instead of the random one.
    ///
    /// The key must be the base-64 encoding of 16 bytes.
    pub fn set_key(&mut self, key: impl Into<String>) -> Result<&mut Self, Error> {
        let key = key.into();
        match BASE64.decode(&key) {
            Ok(nonce) if nonce.len() == 16 => {
                self.key = key;
                Ok(self)
            }
            _ => Err(Error::InvalidRequest(format!("invalid key: {:?}", key)))
        }
    }

    /// Set the handshake origin header.
    pub fn set_origin(&mut self, o: impl Into<String>) -> &mut Self {
        self.origin = Some(o.into());
        self
    }

    /// Add a protocol to be included in the handshake.
    pub fn add_protocol(&mut self, p: impl Into<String>) -> &mut Self {
        self.protocols.push(p.into());
        self
    }

    /// Add an extension offer to be included in the handshake.
    pub fn add_extension(&mut self, e: ExtensionConfig) -> &mut Self {
        self.extensions.push(e);
        self
    }

    /// Offer the given extension with its current parameters.
    pub fn offer_extension(&mut self, e: &dyn Extension) -> &mut Self {
        self.add_extension(ExtensionConfig::offer(e))
    }

    /// Add some other HTTP header to be included in the handshake.
    pub fn add_header(&mut self, name: &str, value: &str) -> Result<&mut Self, Error> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::InvalidRequest(format!("header name {:?}: {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::InvalidRequest(format!("header value {:?}: {}", value, e)))?;
        self.headers.append(name, value);
        Ok(self)
    }

    /// The value of the `Host` header.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The HTTP resource requested.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// The `Sec-WebSocket-Key` of this request.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The protocols offered.
    pub fn protocols(&self) -> impl Iterator<Item = &str> {
        self.protocols.iter().map(|p| p.as_str())
    }

    /// The extensions offered.
    pub fn extensions(&self) -> &[ExtensionConfig] {
        &self.extensions
    }

    /// Encode this request as an HTTP/1.1 upgrade request.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.extend_from_slice(b"GET ");
        buf.extend_from_slice(self.resource.as_bytes());
        buf.extend_from_slice(b" HTTP/1.1");
        buf.extend_from_slice(b"\r\nHost: ");
        buf.extend_from_slice(self.host.as_bytes());
        buf.extend_from_slice(b"\r\nUpgrade: websocket\r\nConnection: Upgrade");
        buf.extend_from_slice(b"\r\nSec-WebSocket-Key: ");
        buf.extend_from_slice(self.key.as_bytes());
        if let Some(o) = &self.origin {
            buf.extend_from_slice(b"\r\nOrigin: ");
            buf.extend_from_slice(o.as_bytes())
        }
        if let Some((last, prefix)) = self.protocols.split_last() {
            buf.extend_from_slice(b"\r\n");
            buf.extend_from_slice(SEC_WEBSOCKET_PROTOCOL.as_bytes());
            buf.extend_from_slice(b": ");
            for p in prefix {
                buf.extend_from_slice(p.as_bytes());
                buf.extend_from_slice(b", ")
            }
            buf.extend_from_slice(last.as_bytes())
        }
        if let Some((last, prefix)) = self.extensions.split_last() {
            buf.extend_from_slice(b"\r\n");
            buf.extend_from_slice(SEC_WEBSOCKET_EXTENSIONS.as_bytes());
            buf.extend_from_slice(b": ");
            for e in prefix {
                buf.extend_from_slice(e.to_string().as_bytes());
                buf.extend_from_slice(b", ")
            }
            buf.extend_from_slice(last.to_string().as_bytes())
        }
        for (name, value) in &self.headers {
            buf.extend_from_slice(b"\r\n");
            buf.extend_from_slice(name.as_str().as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes())
        }
        buf.extend_from_slice(b"\r\nSec-WebSocket-Version: 13\r\n\r\n")
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use bytes::BytesMut;
    use crate::extension::{ExtensionConfig, Param};
    use super::{Error, Request};

    #[test]
    fn encode_minimal_request() {
        let mut r = Request::new("ws://example.com:8080/chat?room=1").unwrap();
        r.set_key("dGhlIHNhbXBsZSBub25jZQ==").unwrap();
        let mut buf = BytesMut::new();
        r.encode(&mut buf);
        assert_eq!(
            "GET /chat?room=1 HTTP/1.1\r\n\
             Host: example.com:8080\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n",
            std::str::from_utf8(&buf).unwrap()
        )
    }

    #[test]
    fn encode_offers() {
        let mut r = Request::new("ws://example.com").unwrap();
        let mut deflate = ExtensionConfig::new("permessage-deflate");
        let mut bits = Param::new("client_max_window_bits");
        bits.set_value(Some("10"));
        deflate.add_param(bits);
        r.set_origin("http://example.com")
            .add_protocol("chat")
            .add_protocol("superchat")
            .add_extension(deflate)
            .add_extension(ExtensionConfig::new("identity"));
        r.add_header("Authorization", "Bearer x").unwrap();

        let mut buf = BytesMut::new();
        r.encode(&mut buf);
        let text = std::str::from_utf8(&buf).unwrap();
        assert!(text.starts_with("GET / HTTP/1.1\r\nHost: example.com\r\n"));
        assert!(text.contains("\r\nOrigin: http://example.com\r\n"));
        assert!(text.contains("\r\nSec-WebSocket-Protocol: chat, superchat\r\n"));
        assert!(text.contains("\r\nSec-WebSocket-Extensions: permessage-deflate; client_max_window_bits=10, identity\r\n"));
        assert!(text.contains("\r\nauthorization: Bearer x\r\n"));
        assert!(text.ends_with("\r\n\r\n"))
    }

    #[test]
    fn random_keys_are_valid() {
        let a = Request::new("ws://localhost/").unwrap();
        let b = Request::new("ws://localhost/").unwrap();
        assert_eq!(24, a.key().len());
        assert_ne!(a.key(), b.key());
        assert!(a.clone().set_key(a.key()).is_ok())
    }

    #[test]
    fn malformed_requests_are_rejected() {
        assert_matches!(Request::new("ftp://example.com/"), Err(Error::InvalidRequest(_)));
        assert_matches!(Request::new("/just/a/path"), Err(Error::InvalidRequest(_)));
        assert_matches!(Request::new("not a uri"), Err(Error::InvalidRequest(_)));
        let mut r = Request::new("ws://example.com").unwrap();
        assert_matches!(r.set_key("c2hvcnQ="), Err(Error::InvalidRequest(_)));
        assert_matches!(r.add_header("bad header", "x"), Err(Error::InvalidRequest(_)))
    }
}
