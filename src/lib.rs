// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! The client side of the [RFC6455][rfc6455] websocket upgrade, driven by
//! readiness callbacks of a non-blocking transport.
//!
//! An [`UpgradeConnection`](handshake::UpgradeConnection) is installed as the
//! [`Handler`](endpoint::Handler) of a connected [`Endpoint`](endpoint::Endpoint).
//! It sends the upgrade request, incrementally reads and validates the
//! response, instantiates the negotiated [extensions](extension) and finally
//! hands the endpoint over to a steady-state [`Connection`](connection::Connection)
//! whose frames flow through the extension [pipeline].
//!
//! The outcome is reported exactly once through the [`Handshake`](handshake::Handshake)
//! future returned alongside the upgrade connection.
//!
//! [rfc6455]: https://tools.ietf.org/html/rfc6455

#![deny(missing_docs)]

pub mod base;
pub mod connection;
pub mod endpoint;
pub mod extension;
pub mod handshake;
pub mod pipeline;
pub mod pool;

mod util;

#[cfg(test)]
mod tests;

/// A boxed error as produced by extensions.
pub type BoxedError = Box<dyn std::error::Error + Send + Sync>;

pub use connection::{Connection, Sender};
pub use endpoint::{Endpoint, Fill, Handler};
pub use handshake::{Handshake, Request, Response, UpgradeConnection};

static_assertions::assert_impl_all!(handshake::Handshake: Send, Unpin);
static_assertions::assert_impl_all!(handshake::Error: Send, Sync);
