// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! The client side of the upgrade, driven by endpoint callbacks.
//!
//! An [`UpgradeConnection`] is installed as the handler of a freshly
//! connected endpoint. It sends the upgrade request, reads and validates
//! the response and finally replaces itself with a [`Connection`].

use bytes::BytesMut;
use crate::{
    connection::{Connection, Sender},
    endpoint::{Endpoint, Fill, Handler},
    extension::ExtensionRegistry,
    pipeline::IncomingFrames,
    pool::BufferPool
};
use futures::task::{Spawn, SpawnExt};
use log::{debug, trace, warn};
use std::{fmt, io, mem, sync::Arc};
use super::{
    Error,
    Handshake,
    Request,
    Response,
    ResponseParser,
    notify::{self, Notifier},
    response::DEFAULT_MAX_HEAD_SIZE,
    validate
};

/// Upgrade configuration.
#[derive(Debug, Clone)]
pub struct Config {
    input_buffer_size: usize,
    max_head_size: usize
}

impl Default for Config {
    fn default() -> Self {
        Config {
            input_buffer_size: 4096,
            max_head_size: DEFAULT_MAX_HEAD_SIZE
        }
    }
}

impl Config {
    /// Capacity of the pooled buffer each read cycle uses (default = 4 KiB).
    pub fn set_input_buffer_size(&mut self, size: usize) -> &mut Self {
        self.input_buffer_size = size;
        self
    }

    /// Max. size of the response head (default = 8 KiB).
    pub fn set_max_head_size(&mut self, size: usize) -> &mut Self {
        self.max_head_size = size;
        self
    }

    /// Capacity of the pooled buffer each read cycle uses.
    pub fn input_buffer_size(&self) -> usize {
        self.input_buffer_size
    }

    /// Max. size of the response head.
    pub fn max_head_size(&self) -> usize {
        self.max_head_size
    }
}

/// What the upgrade still owes its caller.
struct Pending {
    notifier: Notifier,
    session: Box<dyn IncomingFrames>
}

enum State {
    /// Waiting for the endpoint to open.
    Connecting(Pending),
    /// The request is being written.
    Sending(Pending),
    /// Waiting for the response.
    Reading(Pending),
    /// Upgraded or failed.
    Done
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            State::Connecting(_) => "Connecting",
            State::Sending(_) => "Sending",
            State::Reading(_) => "Reading",
            State::Done => "Done"
        })
    }
}

/// Outcome of a read cycle.
enum Read {
    /// No more bytes for now.
    Suspend,
    /// The complete response and whatever followed it.
    Complete(Response, BytesMut)
}

/// Endpoint handler performing the client side of the upgrade.
pub struct UpgradeConnection<E, S> {
    endpoint: E,
    spawner: S,
    request: Arc<Request>,
    parser: ResponseParser,
    pool: BufferPool,
    config: Config,
    registry: Arc<ExtensionRegistry>,
    sender: Sender<E>,
    state: State
}

impl<E, S> fmt::Debug for UpgradeConnection<E, S> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("UpgradeConnection")
            .field("request", &self.request)
            .field("config", &self.config)
            .field("state", &self.state)
            .finish()
    }
}

impl<E: Endpoint, S: Spawn + Send> UpgradeConnection<E, S> {
    /// Create a new upgrade of `endpoint`.
    ///
    /// The request is sent from a task spawned onto `spawner`. Once upgraded,
    /// incoming frames are delivered to `session`. The returned future
    /// resolves to the outcome of the upgrade.
    pub fn new(endpoint: E, spawner: S, request: Request, session: Box<dyn IncomingFrames>) -> (Self, Handshake) {
        let (notifier, handshake) = notify::channel();
        let config = Config::default();
        let upgrade = UpgradeConnection {
            sender: Sender::new(endpoint.clone()),
            endpoint,
            spawner,
            request: Arc::new(request),
            parser: ResponseParser::new(config.max_head_size),
            pool: BufferPool::new(),
            config,
            registry: Arc::new(ExtensionRegistry::default()),
            state: State::Connecting(Pending { notifier, session })
        };
        (upgrade, handshake)
    }

    /// Replace the default configuration.
    pub fn set_config(&mut self, c: Config) -> &mut Self {
        self.parser = ResponseParser::new(c.max_head_size);
        self.config = c;
        self
    }

    /// Use the given pool for read buffers.
    pub fn set_buffer_pool(&mut self, p: BufferPool) -> &mut Self {
        self.pool = p;
        self
    }

    /// Use the given registry to instantiate negotiated extensions.
    pub fn set_registry(&mut self, r: Arc<ExtensionRegistry>) -> &mut Self {
        self.registry = r;
        self
    }

    /// A sender for frames, usable once the upgrade has succeeded.
    pub fn sender(&self) -> Sender<E> {
        self.sender.clone()
    }

    /// Read until the response is complete or no more bytes are available.
    ///
    /// The pooled buffer is released on every exit path.
    fn read(&mut self) -> Result<Read, Error> {
        let mut buffer = self.pool.acquire(self.config.input_buffer_size);
        loop {
            match self.endpoint.fill(&mut buffer)? {
                Fill::Read(0) | Fill::Empty => return Ok(Read::Suspend),
                Fill::Eof => {
                    debug!("read: eof reached");
                    return Err(Error::Closed)
                }
                Fill::Read(n) => {
                    trace!("filled {} bytes", n);
                    if let Some(response) = self.parser.parse(&mut buffer)? {
                        return Ok(Read::Complete(response, buffer.split()))
                    }
                }
            }
        }
    }

    /// Validate the response, report success and hand the endpoint over.
    fn upgrade(&mut self, pending: Pending, mut response: Response, leftover: BytesMut) {
        if let Err(e) = validate(&self.request, &mut response) {
            return self.fail(pending, e)
        }

        let Pending { notifier, session } = pending;
        let extensions = self.registry.instantiate(response.extensions());
        let protocol = response.protocol().map(String::from);
        notifier.complete(response);

        let mut connection = Connection::new(&self.sender, session, extensions);
        connection.set_buffer(leftover).set_input_buffer_size(self.config.input_buffer_size);
        debug!("upgraded (protocol = {:?}), handing endpoint over", protocol);
        self.endpoint.set_handler(Box::new(connection))
    }

    /// Report the failure and shut the endpoint down.
    fn fail(&mut self, pending: Pending, e: Error) {
        warn!("handshake failed: {}", e);
        let graceful = !e.kind().is_stream_fault();
        pending.notifier.fail(e);
        self.disconnect(!graceful)
    }

    fn disconnect(&self, close_only: bool) {
        if !close_only {
            debug!("shutting down output");
            self.endpoint.shutdown_output()
        }
        debug!("closing endpoint");
        self.endpoint.close()
    }
}

impl<E, S> Handler for UpgradeConnection<E, S>
where
    E: Endpoint,
    S: Spawn + Send
{
    fn on_open(&mut self) {
        let pending = match mem::replace(&mut self.state, State::Done) {
            State::Connecting(p) => p,
            other => {
                trace!("on_open: ignored in state {:?}", other);
                self.state = other;
                return
            }
        };
        let endpoint = self.endpoint.clone();
        let request = self.request.clone();
        let task = async move {
            let mut buf = BytesMut::new();
            request.encode(&mut buf);
            debug!("sending upgrade request to {}{}", request.host(), request.resource());
            endpoint.write(buf.freeze())
        };
        match self.spawner.spawn(task) {
            Ok(()) => self.state = State::Sending(pending),
            Err(e) => self.fail(pending, e.into())
        }
    }

    fn on_write_complete(&mut self, result: io::Result<()>) {
        let pending = match mem::replace(&mut self.state, State::Done) {
            State::Sending(p) => p,
            other => {
                trace!("on_write_complete: ignored in state {:?}", other);
                self.state = other;
                return
            }
        };
        match result {
            Ok(()) => {
                trace!("upgrade request written");
                self.state = State::Reading(pending);
                self.endpoint.fill_interested()
            }
            Err(e) => self.fail(pending, e.into())
        }
    }

    fn on_fillable(&mut self) {
        let pending = match mem::replace(&mut self.state, State::Done) {
            State::Reading(p) => p,
            other => {
                trace!("on_fillable: ignored in state {:?}", other);
                self.state = other;
                return
            }
        };
        match self.read() {
            Ok(Read::Suspend) => {
                self.state = State::Reading(pending);
                self.endpoint.fill_interested()
            }
            Ok(Read::Complete(response, leftover)) => self.upgrade(pending, response, leftover),
            Err(e) => self.fail(pending, e)
        }
    }

    fn abort(&mut self) {
        match mem::replace(&mut self.state, State::Done) {
            State::Connecting(p) | State::Sending(p) | State::Reading(p) => self.fail(p, Error::Aborted),
            State::Done => trace!("abort: handshake already done")
        }
    }
}
