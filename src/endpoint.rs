// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! The transport abstraction the handshake and the steady-state channel run on.
//!
//! An [`Endpoint`] is a handle onto a non-blocking byte stream which is driven
//! by some external reactor. The reactor owns a single [`Handler`] per
//! endpoint and invokes it whenever the stream becomes readable or a write
//! has completed. A handler may replace itself via [`Endpoint::set_handler`].

use bytes::{Bytes, BytesMut};
use std::io;

/// Outcome of a non-blocking [`Endpoint::fill`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    /// This many bytes were appended to the buffer.
    Read(usize),
    /// No bytes are available right now.
    Empty,
    /// The remote has closed its side of the stream.
    Eof
}

/// Handle onto a readiness-driven byte stream.
///
/// Handles are cheap to clone and all clones refer to the same stream.
pub trait Endpoint: Clone + Send + Sync + 'static {
    /// Append whatever bytes are available without blocking to `buf`.
    fn fill(&self, buf: &mut BytesMut) -> io::Result<Fill>;

    /// Start writing `buf`.
    ///
    /// Completion (or failure) is reported to the active handler through
    /// [`Handler::on_write_complete`].
    fn write(&self, buf: Bytes);

    /// Ask the reactor to invoke [`Handler::on_fillable`] once bytes arrive.
    fn fill_interested(&self);

    /// Shutdown the output side of the stream.
    fn shutdown_output(&self);

    /// Close the stream in both directions.
    fn close(&self);

    /// Replace the active handler.
    ///
    /// The endpoint calls [`Handler::on_open`] on the new handler once it
    /// has been installed. The previous handler receives no further callbacks.
    fn set_handler(&self, handler: Box<dyn Handler>);
}

/// Callbacks invoked by the reactor on the active handler of an endpoint.
pub trait Handler: Send {
    /// The handler has become the active handler of its endpoint.
    fn on_open(&mut self);

    /// The endpoint is readable.
    fn on_fillable(&mut self);

    /// A previously started write completed.
    fn on_write_complete(&mut self, result: io::Result<()>);

    /// Tear the connection down, e.g. because some timer expired.
    fn abort(&mut self);
}
