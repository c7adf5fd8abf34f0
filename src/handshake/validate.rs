// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

use crate::{extension::ExtensionConfig, util};
use http::{StatusCode, Version};
use log::debug;
use super::{
    Error,
    Request,
    Response,
    SEC_WEBSOCKET_ACCEPT,
    SEC_WEBSOCKET_EXTENSIONS,
    SEC_WEBSOCKET_PROTOCOL,
    accept_key,
    expect_ascii_header,
    with_first_header
};

/// Check that `response` accepts the upgrade `request` asked for.
///
/// On success the negotiated extensions and sub-protocol are recorded
/// in the response.
pub fn validate(request: &Request, response: &mut Response) -> Result<(), Error> {
    if response.version() != Version::HTTP_11 {
        return Err(Error::UnsupportedHttpVersion)
    }

    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Err(Error::UnexpectedStatusCode(response.status().as_u16()))
    }

    expect_ascii_header(response.headers(), "Upgrade", "websocket")?;
    expect_ascii_header(response.headers(), "Connection", "upgrade")?;

    let expected = accept_key(request.key().as_bytes());
    with_first_header(response.headers(), SEC_WEBSOCKET_ACCEPT, |theirs| {
        if theirs != expected.as_bytes() {
            return Err(Error::InvalidSecWebSocketAccept)
        }
        Ok(())
    })?;

    let mut extensions = Vec::new();
    for value in response.headers().get_all(SEC_WEBSOCKET_EXTENSIONS) {
        let value = std::str::from_utf8(value.as_bytes())?;
        for entry in util::split_quoted(value, ',') {
            match ExtensionConfig::parse(entry) {
                Some(c) => extensions.push(c),
                None => return Err(Error::UnexpectedHeader(SEC_WEBSOCKET_EXTENSIONS.into()))
            }
        }
    }

    let protocol = match response.headers().get(SEC_WEBSOCKET_PROTOCOL) {
        Some(p) => {
            let p = std::str::from_utf8(p.as_bytes())?.trim();
            if !request.protocols().any(|ours| ours == p) {
                return Err(Error::UnsolicitedProtocol)
            }
            Some(p.to_string())
        }
        None => None
    };

    debug!("handshake accepted: extensions = {:?}, protocol = {:?}", extensions, protocol);
    response.set_extensions(extensions);
    response.set_protocol(protocol);
    Ok(())
}
