// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! The steady-state websocket channel an upgraded endpoint switches to.
//!
//! A [`Connection`] is installed as the endpoint's handler once the handshake
//! succeeded. It decodes incoming bytes into frames and runs them through the
//! incoming extension chain to the application. The application sends frames
//! through a [`Sender`] which runs them through the outgoing chain, encodes
//! them and writes them to the endpoint.

use bytes::{Bytes, BytesMut};
use crate::{
    BoxedError,
    base::{self, Codec, Frame, OpCode, MAX_CTRL_BODY_SIZE},
    endpoint::{Endpoint, Fill, Handler},
    extension::Extension,
    pipeline::{IncomingFrames, OutgoingFrames, Pipeline}
};
use futures::channel::mpsc;
use log::{debug, trace, warn};
use std::{collections::VecDeque, fmt, io, sync::{Arc, Mutex, MutexGuard, PoisonError}};

/// Max. length of a close reason in bytes.
const MAX_CLOSE_REASON: u64 = 123;

static_assertions::const_assert_eq!(MAX_CTRL_BODY_SIZE, MAX_CLOSE_REASON + 2);

/// Default size of the read buffer.
const DEFAULT_INPUT_BUFFER_SIZE: usize = 4096;

// Outbound half //////////////////////////////////////////////////////////////////////////////////

struct Outbound<E> {
    endpoint: E,
    encoder: Codec,
    /// Head of the outgoing chain, present once upgraded.
    chain: Option<Box<dyn OutgoingFrames>>,
    /// Tail of the outgoing chain feeds `egress`.
    sink: mpsc::UnboundedSender<Frame>,
    egress: mpsc::UnboundedReceiver<Frame>,
    /// Encoded bytes in the order their frames were accepted.
    pending: VecDeque<Bytes>,
    /// Some sender is writing `pending` to the endpoint.
    writing: bool,
    close_sent: bool,
    closed: bool
}

impl<E: Endpoint> Outbound<E> {
    /// Run `frame` through the outgoing chain and encode the result.
    fn prepare(&mut self, mut frame: Frame) -> Result<Bytes, Error> {
        if self.closed || self.close_sent {
            return Err(Error::Closed)
        }
        let chain = self.chain.as_mut().ok_or(Error::NotConnected)?;
        if frame.header().opcode() == OpCode::Close {
            self.close_sent = true
        }
        frame.header_mut().set_masked(true).set_mask(rand::random());
        chain.outgoing_frame(frame)?;
        let mut buf = BytesMut::new();
        while let Ok(f) = self.egress.try_recv() {
            trace!("encoding {}", f.header());
            self.encoder.encode(&f, &mut buf)?
        }
        Ok(buf.freeze())
    }
}

/// The tail of the outgoing chain.
struct Egress(mpsc::UnboundedSender<Frame>);

impl OutgoingFrames for Egress {
    fn outgoing_frame(&mut self, frame: Frame) -> Result<(), Error> {
        self.0.unbounded_send(frame).map_err(|_| Error::Closed)
    }
}

/// Sends frames over an upgraded endpoint.
///
/// Frames are masked with a fresh random key. Sending fails with
/// [`Error::NotConnected`] until the upgrade completed.
pub struct Sender<E> {
    outbound: Arc<Mutex<Outbound<E>>>
}

impl<E> Clone for Sender<E> {
    fn clone(&self) -> Self {
        Sender { outbound: self.outbound.clone() }
    }
}

impl<E> fmt::Debug for Sender<E> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Sender").finish()
    }
}

impl<E: Endpoint> Sender<E> {
    pub(crate) fn new(endpoint: E) -> Self {
        let (sink, egress) = mpsc::unbounded();
        let outbound = Outbound {
            endpoint,
            encoder: Codec::new(),
            chain: None,
            sink,
            egress,
            pending: VecDeque::new(),
            writing: false,
            close_sent: false,
            closed: false
        };
        Sender { outbound: Arc::new(Mutex::new(outbound)) }
    }

    fn lock(&self) -> MutexGuard<'_, Outbound<E>> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send a frame.
    ///
    /// Frames reach the endpoint in the order they were accepted, even when
    /// several clones send concurrently or an endpoint write sends again.
    pub fn send(&self, frame: Frame) -> Result<(), Error> {
        {
            let mut outbound = self.lock();
            let bytes = outbound.prepare(frame)?;
            if !bytes.is_empty() {
                outbound.pending.push_back(bytes)
            }
            if outbound.writing {
                return Ok(())
            }
            outbound.writing = true
        }
        self.flush();
        Ok(())
    }

    /// Write pending bytes until none are left.
    ///
    /// Only one sender flushes at a time. Bytes queued meanwhile are
    /// written by the flushing sender.
    fn flush(&self) {
        loop {
            let (endpoint, bytes) = {
                let mut outbound = self.lock();
                match outbound.pending.pop_front() {
                    Some(b) => (outbound.endpoint.clone(), b),
                    None => {
                        outbound.writing = false;
                        return
                    }
                }
            };
            endpoint.write(bytes)
        }
    }

    /// Send a text message as a single frame.
    pub fn send_text(&self, text: &str) -> Result<(), Error> {
        self.send(Frame::new(OpCode::Text, text.as_bytes()))
    }

    /// Send a binary message as a single frame.
    pub fn send_binary(&self, data: &[u8]) -> Result<(), Error> {
        self.send(Frame::new(OpCode::Binary, data))
    }

    /// Send a ping with the given payload.
    pub fn send_ping(&self, data: &[u8]) -> Result<(), Error> {
        if data.len() as u64 > MAX_CTRL_BODY_SIZE {
            return Err(Error::Codec(base::Error::InvalidControlFrameLen))
        }
        self.send(Frame::new(OpCode::Ping, data))
    }

    /// Initiate the closing handshake.
    ///
    /// No other frames can be sent afterwards. The endpoint is closed once
    /// the peer answers with its own close frame. Reasons longer than 123
    /// bytes are cut at a character boundary.
    pub fn close(&self, code: u16, reason: &str) -> Result<(), Error> {
        self.send(Frame::new(OpCode::Close, close_payload(code, reason)))
    }

    /// Can frames still be sent?
    pub fn is_open(&self) -> bool {
        let outbound = self.lock();
        outbound.chain.is_some() && !outbound.closed && !outbound.close_sent
    }

    /// Let `f` build the outgoing chain around our encoder and egress, then install it.
    fn connect<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut Codec, Box<dyn OutgoingFrames>) -> (Box<dyn OutgoingFrames>, R)
    {
        let mut outbound = self.lock();
        let egress = Box::new(Egress(outbound.sink.clone()));
        let (chain, r) = f(&mut outbound.encoder, egress);
        outbound.chain = Some(chain);
        r
    }

    fn set_closed(&self) {
        self.lock().closed = true
    }

    fn close_sent(&self) -> bool {
        self.lock().close_sent
    }
}

fn close_payload(code: u16, reason: &str) -> BytesMut {
    let mut end = std::cmp::min(reason.len(), MAX_CLOSE_REASON as usize);
    while !reason.is_char_boundary(end) {
        end -= 1
    }
    let mut payload = BytesMut::with_capacity(2 + end);
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(reason[.. end].as_bytes());
    payload
}

// Inbound half ///////////////////////////////////////////////////////////////////////////////////

/// The tail of the incoming chain.
///
/// Queues the answers to pings and close frames before passing every frame
/// on to the application.
struct Ingress {
    session: Box<dyn IncomingFrames>,
    replies: mpsc::UnboundedSender<Frame>
}

impl IncomingFrames for Ingress {
    fn incoming_frame(&mut self, frame: Frame) -> Result<(), Error> {
        let reply = match frame.header().opcode() {
            OpCode::Ping => Some(Frame::new(OpCode::Pong, frame.payload())),
            OpCode::Close => Some(close_answer(&frame)),
            _ => None
        };
        if let Some(r) = reply {
            self.replies.unbounded_send(r).map_err(|_| Error::Closed)?
        }
        self.session.incoming_frame(frame)
    }
}

fn close_answer(frame: &Frame) -> Frame {
    let mut answer = Frame::new(OpCode::Close, BytesMut::new());
    let data = frame.payload();
    if data.len() >= 2 {
        let code = u16::from_be_bytes([data[0], data[1]]);
        debug!("received close frame; code = {}; reason = {}", code, String::from_utf8_lossy(&data[2 ..]));
        let code = match code {
            1000 ..= 1003 | 1007 ..= 1011 | 1015 | 3000 ..= 4999 => code, // acceptable codes
            _ => 1002 // protocol error
        };
        answer.set_payload(&code.to_be_bytes()[..]);
    } else {
        debug!("received close frame")
    }
    answer
}

/// The steady-state channel of an upgraded endpoint.
pub struct Connection<E> {
    endpoint: E,
    decoder: Codec,
    /// Bytes read but not yet decoded.
    buffer: BytesMut,
    input_buffer_size: usize,
    /// Head of the incoming chain.
    incoming: Box<dyn IncomingFrames>,
    replies: mpsc::UnboundedReceiver<Frame>,
    sender: Sender<E>,
    closed: bool
}

impl<E> fmt::Debug for Connection<E> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Connection")
            .field("buffered", &self.buffer.len())
            .field("closed", &self.closed)
            .finish()
    }
}

impl<E: Endpoint> Connection<E> {
    /// Create the channel for the endpoint `sender` writes to.
    ///
    /// The extensions are wired into both frame chains of the channel.
    /// Incoming frames end up in `session`.
    pub fn new(sender: &Sender<E>, session: Box<dyn IncomingFrames>, extensions: Vec<Box<dyn Extension>>) -> Self {
        let (tx, replies) = mpsc::unbounded();
        let ingress = Box::new(Ingress { session, replies: tx });
        let mut decoder = Codec::new();
        let incoming = sender.connect(|encoder, egress| {
            let pipeline = Pipeline::build(extensions, ingress, egress, encoder, &mut decoder);
            debug!("pipeline built with extensions {:?}", pipeline.extension_names());
            let (incoming, outgoing) = pipeline.into_parts();
            (outgoing, incoming)
        });
        let endpoint = sender.lock().endpoint.clone();
        Connection {
            endpoint,
            decoder,
            buffer: BytesMut::new(),
            input_buffer_size: DEFAULT_INPUT_BUFFER_SIZE,
            incoming,
            replies,
            sender: sender.clone(),
            closed: false
        }
    }

    /// Bytes which arrived behind the handshake response.
    ///
    /// They are decoded before anything is read from the endpoint.
    pub fn set_buffer(&mut self, buffer: BytesMut) -> &mut Self {
        self.buffer = buffer;
        self
    }

    /// Set the number of bytes to reserve before each read.
    pub fn set_input_buffer_size(&mut self, size: usize) -> &mut Self {
        self.input_buffer_size = size;
        self
    }

    /// Set the max. payload size an incoming frame may have.
    pub fn set_max_payload_size(&mut self, size: u64) -> &mut Self {
        self.decoder.set_max_payload_size(size);
        self
    }

    /// Decode and dispatch every complete frame in the buffer.
    fn process(&mut self) -> Result<(), Error> {
        while !self.closed {
            match self.decoder.decode(&mut self.buffer)? {
                Some(frame) => {
                    trace!("decoded {}", frame.header());
                    self.incoming.incoming_frame(frame)?;
                    self.answer()?
                }
                None => break
            }
        }
        Ok(())
    }

    /// Send the queued answers to pings and close frames.
    fn answer(&mut self) -> Result<(), Error> {
        while let Ok(reply) = self.replies.try_recv() {
            match reply.header().opcode() {
                OpCode::Close => {
                    if !self.sender.close_sent() {
                        self.sender.send(reply)?
                    }
                    self.shutdown();
                    return Ok(())
                }
                _ => match self.sender.send(reply) {
                    Ok(()) | Err(Error::Closed) => {}
                    Err(e) => return Err(e)
                }
            }
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        debug!("closing connection");
        self.closed = true;
        self.sender.set_closed();
        self.endpoint.close()
    }

    fn fail(&mut self, e: Error) {
        warn!("connection failed: {}", e);
        self.shutdown()
    }
}

impl<E: Endpoint> Handler for Connection<E> {
    fn on_open(&mut self) {
        trace!("connection open with {} buffered bytes", self.buffer.len());
        if let Err(e) = self.process() {
            return self.fail(e)
        }
        if !self.closed {
            self.endpoint.fill_interested()
        }
    }

    fn on_fillable(&mut self) {
        while !self.closed {
            self.buffer.reserve(self.input_buffer_size);
            match self.endpoint.fill(&mut self.buffer) {
                Ok(Fill::Read(0)) | Ok(Fill::Empty) => {
                    self.endpoint.fill_interested();
                    return
                }
                Ok(Fill::Read(n)) => {
                    trace!("read {} bytes", n);
                    if let Err(e) = self.process() {
                        return self.fail(e)
                    }
                }
                Ok(Fill::Eof) => {
                    debug!("remote closed the stream");
                    return self.shutdown()
                }
                Err(e) => return self.fail(Error::Io(e))
            }
        }
    }

    fn on_write_complete(&mut self, result: io::Result<()>) {
        if let Err(e) = result {
            self.fail(Error::Io(e))
        }
    }

    fn abort(&mut self) {
        if !self.closed {
            debug!("connection aborted");
            self.shutdown()
        }
    }
}

// Connection error type //////////////////////////////////////////////////////////////////////////

/// Connection error cases.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// The base codec errored.
    Codec(base::Error),
    /// An extension failed to process a frame.
    Extension(BoxedError),
    /// An I/O error has been encountered.
    Io(io::Error),
    /// The upgrade has not completed yet.
    NotConnected,
    /// The connection is closed.
    Closed
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Codec(e) => write!(f, "codec error: {}", e),
            Error::Extension(e) => write!(f, "extension error: {}", e),
            Error::Io(e) => write!(f, "i/o error: {}", e),
            Error::NotConnected => f.write_str("not connected"),
            Error::Closed => f.write_str("connection closed")
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Codec(e) => Some(e),
            Error::Extension(e) => Some(&**e),
            Error::Io(e) => Some(e),
            Error::NotConnected
            | Error::Closed => None
        }
    }
}

impl From<base::Error> for Error {
    fn from(e: base::Error) -> Self {
        Error::Codec(e)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
