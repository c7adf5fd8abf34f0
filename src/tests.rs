// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

// Upgrades driven end to end over an in-memory endpoint.

use assert_matches::assert_matches;
use bytes::{Bytes, BytesMut};
use crate::{
    base::{Codec, Frame, OpCode},
    connection,
    endpoint::{Endpoint, Fill, Handler},
    handshake::{Error, Handshake, Request, Response, UpgradeConnection},
    pool::BufferPool
};
use futures::{
    executor::block_on,
    future::FutureObj,
    task::{Spawn, SpawnError}
};
use std::{collections::VecDeque, io, sync::{Arc, Mutex, MutexGuard}};

const KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
const ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

// Mock endpoint //////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Write(Bytes),
    FillInterested,
    ShutdownOutput,
    Close
}

enum Input {
    Data(Vec<u8>),
    Eof
}

type WriteHook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Inner {
    input: VecDeque<Input>,
    calls: Vec<Call>,
    fills: usize,
    /// Runs inside the next `write`, before its bytes are recorded.
    write_hook: Option<WriteHook>,
    handler: Option<Box<dyn Handler>>,
    replacement: Option<Box<dyn Handler>>
}

/// Endpoint whose reactor is the test itself.
#[derive(Clone, Default)]
struct MockEndpoint(Arc<Mutex<Inner>>);

impl MockEndpoint {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.0.lock().unwrap()
    }

    fn push(&self, data: &[u8]) {
        self.lock().input.push_back(Input::Data(data.to_vec()))
    }

    fn push_eof(&self) {
        self.lock().input.push_back(Input::Eof)
    }

    fn before_next_write(&self, hook: impl FnOnce() + Send + 'static) {
        self.lock().write_hook = Some(Box::new(hook))
    }

    fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    fn fills(&self) -> usize {
        self.lock().fills
    }

    fn writes(&self) -> Vec<Bytes> {
        self.calls().into_iter().filter_map(|c| if let Call::Write(b) = c { Some(b) } else { None }).collect()
    }

    /// Shutdown and close calls in order.
    fn teardown(&self) -> Vec<Call> {
        self.calls().into_iter().filter(|c| *c == Call::ShutdownOutput || *c == Call::Close).collect()
    }

    /// Frames written after the upgrade request.
    fn frames(&self, codec: &mut Codec) -> Vec<Frame> {
        let mut buf = BytesMut::new();
        for w in self.writes().into_iter().skip(1) {
            buf.extend_from_slice(&w)
        }
        let mut frames = Vec::new();
        while let Some(f) = codec.decode(&mut buf).unwrap() {
            frames.push(f)
        }
        assert!(buf.is_empty());
        frames
    }

    /// Invoke the active handler, then open every handler it installed.
    fn dispatch(&self, f: impl FnOnce(&mut dyn Handler)) {
        let mut handler = self.lock().handler.take();
        if let Some(h) = handler.as_mut() {
            f(&mut **h)
        }
        loop {
            let next = self.lock().replacement.take();
            let Some(mut h) = next else { break };
            h.on_open();
            handler = Some(h)
        }
        self.lock().handler = handler
    }

    fn install(&self, h: Box<dyn Handler>) {
        self.set_handler(h);
        self.dispatch(|_| ())
    }

    fn readable(&self) {
        self.dispatch(|h| h.on_fillable())
    }

    fn write_done(&self, r: io::Result<()>) {
        self.dispatch(|h| h.on_write_complete(r))
    }

    fn abort(&self) {
        self.dispatch(|h| h.abort())
    }
}

impl Endpoint for MockEndpoint {
    fn fill(&self, buf: &mut BytesMut) -> io::Result<Fill> {
        let mut inner = self.lock();
        inner.fills += 1;
        match inner.input.pop_front() {
            Some(Input::Data(d)) => {
                buf.extend_from_slice(&d);
                Ok(Fill::Read(d.len()))
            }
            Some(Input::Eof) => {
                inner.input.push_front(Input::Eof);
                Ok(Fill::Eof)
            }
            None => Ok(Fill::Empty)
        }
    }

    fn write(&self, buf: Bytes) {
        let hook = self.lock().write_hook.take();
        if let Some(h) = hook {
            h()
        }
        self.lock().calls.push(Call::Write(buf))
    }

    fn fill_interested(&self) {
        self.lock().calls.push(Call::FillInterested)
    }

    fn shutdown_output(&self) {
        self.lock().calls.push(Call::ShutdownOutput)
    }

    fn close(&self) {
        self.lock().calls.push(Call::Close)
    }

    fn set_handler(&self, handler: Box<dyn Handler>) {
        self.lock().replacement = Some(handler)
    }
}

// Task spawner ///////////////////////////////////////////////////////////////////////////////////

/// Collects spawned tasks until `run` is called.
#[derive(Clone, Default)]
struct Tasks {
    queue: Arc<Mutex<Vec<FutureObj<'static, ()>>>>,
    refuse: bool
}

impl Tasks {
    fn refusing() -> Self {
        Tasks { refuse: true, .. Tasks::default() }
    }

    fn run(&self) {
        let tasks = std::mem::take(&mut *self.queue.lock().unwrap());
        for t in tasks {
            block_on(t)
        }
    }
}

impl Spawn for Tasks {
    fn spawn_obj(&self, future: FutureObj<'static, ()>) -> Result<(), SpawnError> {
        if self.refuse {
            return Err(SpawnError::shutdown())
        }
        self.queue.lock().unwrap().push(future);
        Ok(())
    }
}

// Fixture ////////////////////////////////////////////////////////////////////////////////////////

type Received = Arc<Mutex<Vec<Frame>>>;

struct Fixture {
    endpoint: MockEndpoint,
    tasks: Tasks,
    received: Received,
    handshake: Handshake,
    sender: connection::Sender<MockEndpoint>
}

fn request() -> Request {
    let mut r = Request::new("ws://example.com/chat").unwrap();
    r.set_key(KEY).unwrap();
    r
}

fn fixture_with(request: Request, tasks: Tasks) -> Fixture {
    let _ = env_logger::try_init();
    let endpoint = MockEndpoint::default();
    let received = Received::default();
    let r = received.clone();
    let session = move |f: Frame| -> Result<(), connection::Error> {
        r.lock().unwrap().push(f);
        Ok(())
    };
    let (mut upgrade, handshake) = UpgradeConnection::new(endpoint.clone(), tasks.clone(), request, Box::new(session));
    upgrade.set_buffer_pool(BufferPool::new());
    let sender = upgrade.sender();
    endpoint.install(Box::new(upgrade));
    Fixture { endpoint, tasks, received, handshake, sender }
}

/// An upgrade whose request has been written and which waits for the response.
fn reading() -> Fixture {
    let f = fixture_with(request(), Tasks::default());
    f.tasks.run();
    f.endpoint.write_done(Ok(()));
    f
}

fn response(extra: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n{}\r\n",
        ACCEPT,
        extra
    )
}

// Tests //////////////////////////////////////////////////////////////////////////////////////////

#[test]
fn request_is_sent_from_spawned_task() {
    let f = fixture_with(request(), Tasks::default());
    assert!(f.endpoint.writes().is_empty());
    f.tasks.run();
    let writes = f.endpoint.writes();
    assert_eq!(1, writes.len());
    let text = std::str::from_utf8(&writes[0]).unwrap();
    assert!(text.starts_with("GET /chat HTTP/1.1\r\n"));
    assert!(text.contains(&format!("Sec-WebSocket-Key: {}\r\n", KEY)));

    assert!(!f.endpoint.calls().contains(&Call::FillInterested));
    f.endpoint.write_done(Ok(()));
    assert_eq!(Some(&Call::FillInterested), f.endpoint.calls().last())
}

#[test]
fn reference_vector_upgrades() {
    let f = reading();
    f.endpoint.push(response("").as_bytes());
    f.endpoint.readable();

    let r = block_on(f.handshake).unwrap();
    assert_eq!(101, r.status().as_u16());
    assert!(r.extensions().is_empty());
    assert!(f.endpoint.teardown().is_empty());

    // the connection took over and waits for frames
    assert_eq!(Some(&Call::FillInterested), f.endpoint.calls().last());
    assert!(f.sender.is_open());
    f.sender.send_text("hello").unwrap();
    let frames = f.endpoint.frames(&mut Codec::new());
    assert_eq!(1, frames.len());
    assert!(frames[0].header().is_masked());
    assert_eq!(OpCode::Text, frames[0].header().opcode());
    assert_eq!(b"hello", frames[0].payload())
}

#[test]
fn byte_by_byte_response_upgrades() {
    let f = reading();
    for b in response("Sec-WebSocket-Extensions: identity\r\n").as_bytes() {
        f.endpoint.push(&[*b])
    }
    f.endpoint.readable();
    let r = block_on(f.handshake).unwrap();
    assert_eq!(1, r.extensions().len());
    assert_eq!("identity", r.extensions()[0].name())
}

fn upgrade_in_chunks(request: Request, chunks: &[&[u8]]) -> (Response, usize) {
    let f = fixture_with(request, Tasks::default());
    f.tasks.run();
    f.endpoint.write_done(Ok(()));
    for c in chunks {
        f.endpoint.push(c);
        f.endpoint.readable()
    }
    let armed = f.endpoint.calls().into_iter().filter(|c| *c == Call::FillInterested).count();
    (block_on(f.handshake).unwrap(), armed)
}

fn chat_request() -> Request {
    let mut r = request();
    r.add_protocol("chat");
    r
}

#[test]
fn one_byte_per_callback_yields_same_response() {
    let text = response(
        "Sec-WebSocket-Protocol: chat\r\n\
         Sec-WebSocket-Extensions: identity; x=\"a, b\", x-other\r\n\
         X-Custom: 1\r\n"
    );
    let (whole, _) = upgrade_in_chunks(chat_request(), &[text.as_bytes()]);
    let bytes: Vec<&[u8]> = text.as_bytes().chunks(1).collect();
    let (split, armed) = upgrade_in_chunks(chat_request(), &bytes);

    // read interest re-armed after every byte but the last, plus once after the request
    // and once by the connection taking over
    assert_eq!(bytes.len() + 1, armed);
    assert_eq!(whole.version(), split.version());
    assert_eq!(whole.status(), split.status());
    assert_eq!(whole.reason(), split.reason());
    assert_eq!(whole.headers(), split.headers());
    assert_eq!(whole.extensions(), split.extensions());
    assert_eq!(whole.protocol(), split.protocol());
    assert_eq!(2, split.extensions().len());
    assert_eq!(Some("a, b"), split.extensions()[0].params()[0].value());
    assert_eq!(Some("chat"), split.protocol())
}

#[test]
fn response_may_arrive_over_several_callbacks() {
    let f = reading();
    let text = response("");
    let (a, b) = text.as_bytes().split_at(20);
    f.endpoint.push(a);
    f.endpoint.readable();
    assert_eq!(Some(&Call::FillInterested), f.endpoint.calls().last());
    f.endpoint.push(b);
    f.endpoint.readable();
    assert!(block_on(f.handshake).is_ok())
}

#[test]
fn bytes_after_response_reach_the_session() {
    let f = reading();
    let mut bytes = response("").into_bytes();
    bytes.extend_from_slice(&[0x81, 0x02, b'h', b'i']);
    f.endpoint.push(&bytes);
    f.endpoint.readable();
    assert!(block_on(f.handshake).is_ok());

    let received = f.received.lock().unwrap();
    assert_eq!(1, received.len());
    assert_eq!(OpCode::Text, received[0].header().opcode());
    assert_eq!(b"hi", received[0].payload())
}

#[test]
fn accept_mismatch_shuts_down_gracefully() {
    let f = reading();
    let bad = response("").replace(ACCEPT, "AAAAAAAAAAAAAAAAAAAAAAAAAAA=");
    f.endpoint.push(bad.as_bytes());
    f.endpoint.readable();

    assert_matches!(block_on(f.handshake), Err(Error::InvalidSecWebSocketAccept));
    assert_eq!(vec![Call::ShutdownOutput, Call::Close], f.endpoint.teardown());

    let fills = f.endpoint.fills();
    f.endpoint.push(b"more");
    f.endpoint.readable();
    assert_eq!(fills, f.endpoint.fills());
    assert_matches!(f.sender.send_text("x"), Err(connection::Error::NotConnected))
}

#[test]
fn rejected_upgrade_shuts_down_gracefully() {
    let f = reading();
    f.endpoint.push(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n");
    f.endpoint.readable();
    assert_matches!(block_on(f.handshake), Err(Error::UnexpectedStatusCode(403)));
    assert_eq!(vec![Call::ShutdownOutput, Call::Close], f.endpoint.teardown())
}

#[test]
fn eof_before_response_fails_once() {
    let f = reading();
    f.endpoint.push(b"HTTP/1.1 101 Switching");
    f.endpoint.push_eof();
    f.endpoint.readable();
    f.endpoint.readable();
    assert_matches!(block_on(f.handshake), Err(Error::Closed));
    assert_eq!(vec![Call::Close], f.endpoint.teardown());
    assert!(f.received.lock().unwrap().is_empty())
}

#[test]
fn garbage_response_closes_directly() {
    let f = reading();
    f.endpoint.push(b"\x00\x01\x02 garbage\r\n\r\n");
    f.endpoint.readable();
    assert_matches!(block_on(f.handshake), Err(Error::Http(_)));
    assert_eq!(vec![Call::Close], f.endpoint.teardown())
}

#[test]
fn failed_write_is_a_transport_fault() {
    let f = fixture_with(request(), Tasks::default());
    f.tasks.run();
    f.endpoint.write_done(Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone")));
    assert_matches!(block_on(f.handshake), Err(Error::Io(_)));
    assert_eq!(vec![Call::Close], f.endpoint.teardown())
}

#[test]
fn refused_spawn_fails_handshake() {
    let f = fixture_with(request(), Tasks::refusing());
    assert_matches!(block_on(f.handshake), Err(Error::Spawn(_)));
    assert_eq!(vec![Call::Close], f.endpoint.teardown());
    assert!(f.endpoint.writes().is_empty())
}

#[test]
fn abort_before_handoff_closes() {
    let f = reading();
    f.endpoint.abort();
    assert_matches!(block_on(f.handshake), Err(Error::Aborted));
    assert_eq!(vec![Call::Close], f.endpoint.teardown());

    // late bytes are ignored
    let fills = f.endpoint.fills();
    f.endpoint.push(response("").as_bytes());
    f.endpoint.readable();
    assert_eq!(fills, f.endpoint.fills())
}

#[test]
fn unknown_extension_is_skipped() {
    let f = reading();
    f.endpoint.push(response("Sec-WebSocket-Extensions: x-unknown; a=1, identity\r\n").as_bytes());
    f.endpoint.push(&[0x82, 0x01, 0x2a]);
    f.endpoint.readable();
    f.endpoint.readable();
    let r = block_on(f.handshake).unwrap();
    assert_eq!(2, r.extensions().len());
    assert_eq!(b"\x2a", f.received.lock().unwrap()[0].payload());
}

#[test]
fn unsolicited_protocol_is_rejected() {
    let mut req = request();
    req.add_protocol("chat");
    let f = fixture_with(req, Tasks::default());
    f.tasks.run();
    f.endpoint.write_done(Ok(()));
    f.endpoint.push(response("Sec-WebSocket-Protocol: superchat\r\n").as_bytes());
    f.endpoint.readable();
    assert_matches!(block_on(f.handshake), Err(Error::UnsolicitedProtocol))
}

#[test]
fn ping_is_answered_with_pong() {
    let f = reading();
    let mut bytes = response("").into_bytes();
    bytes.extend_from_slice(&[0x89, 0x03, b'a', b'b', b'c']);
    f.endpoint.push(&bytes);
    f.endpoint.readable();
    assert!(block_on(f.handshake).is_ok());

    let frames = f.endpoint.frames(&mut Codec::new());
    assert_eq!(1, frames.len());
    assert_eq!(OpCode::Pong, frames[0].header().opcode());
    assert_eq!(b"abc", frames[0].payload());
    assert_eq!(OpCode::Ping, f.received.lock().unwrap()[0].header().opcode());
}

#[test]
fn close_is_echoed_and_endpoint_closed() {
    let f = reading();
    f.endpoint.push(response("").as_bytes());
    f.endpoint.readable();
    assert!(block_on(f.handshake).is_ok());

    f.endpoint.push(&[0x88, 0x02, 0x03, 0xe8]);
    f.endpoint.readable();
    let frames = f.endpoint.frames(&mut Codec::new());
    assert_eq!(1, frames.len());
    assert_eq!(OpCode::Close, frames[0].header().opcode());
    assert_eq!(&1000_u16.to_be_bytes()[..], frames[0].payload());
    assert_eq!(vec![Call::Close], f.endpoint.teardown());
    assert!(!f.sender.is_open());
    assert_matches!(f.sender.send_text("late"), Err(connection::Error::Closed))
}

#[test]
fn client_initiated_close_waits_for_answer() {
    let f = reading();
    f.endpoint.push(response("").as_bytes());
    f.endpoint.readable();
    assert!(block_on(f.handshake).is_ok());

    f.sender.close(1000, "bye").unwrap();
    assert!(f.endpoint.teardown().is_empty());
    f.endpoint.push(&[0x88, 0x02, 0x03, 0xe8]);
    f.endpoint.readable();

    // only our own close frame was written
    assert_eq!(1, f.endpoint.frames(&mut Codec::new()).len());
    assert_eq!(vec![Call::Close], f.endpoint.teardown())
}

#[test]
fn frames_reach_the_wire_in_send_order() {
    let f = reading();
    f.endpoint.push(response("").as_bytes());
    f.endpoint.readable();
    assert!(block_on(f.handshake).is_ok());

    // another sender closes while the text frame is being written
    let other = f.sender.clone();
    f.endpoint.before_next_write(move || other.close(1000, "").unwrap());
    f.sender.send_text("first").unwrap();

    let frames = f.endpoint.frames(&mut Codec::new());
    let opcodes: Vec<OpCode> = frames.iter().map(|f| f.header().opcode()).collect();
    assert_eq!(vec![OpCode::Text, OpCode::Close], opcodes);
    assert_eq!(b"first", frames[0].payload())
}

#[test]
fn unexpected_reserved_bit_closes_connection() {
    let f = reading();
    let mut bytes = response("").into_bytes();
    bytes.extend_from_slice(&[0xc1, 0x01, b'x']);
    f.endpoint.push(&bytes);
    f.endpoint.readable();
    assert!(block_on(f.handshake).is_ok());
    assert_eq!(vec![Call::Close], f.endpoint.teardown());
    assert!(f.received.lock().unwrap().is_empty())
}

#[cfg(feature = "deflate")]
#[test]
fn deflate_is_negotiated_and_used() {
    use crate::extension::{Extension, ExtensionConfig, deflate::Deflate};

    let f = reading();
    let mut bytes = response("Sec-WebSocket-Extensions: permessage-deflate; server_no_context_takeover\r\n").into_bytes();
    // cf. RFC 7692, section 7.2.3.1
    bytes.extend_from_slice(&[0xc1, 0x07, 0xf2, 0x48, 0xcd, 0xc9, 0xc9, 0x07, 0x00]);
    f.endpoint.push(&bytes);
    f.endpoint.readable();
    let r = block_on(f.handshake).unwrap();
    assert_eq!("permessage-deflate", r.extensions()[0].name());
    assert_eq!(b"Hello", f.received.lock().unwrap()[0].payload());

    f.sender.send_text("Hello").unwrap();
    let mut codec = Codec::new();
    codec.set_rsv1_in_use();
    let mut frames = f.endpoint.frames(&mut codec);
    assert!(frames[0].header().is_rsv1());
    assert_ne!(b"Hello", frames[0].payload());

    let mut inflate = Deflate::new();
    let params = ExtensionConfig::parse("permessage-deflate; server_no_context_takeover").unwrap();
    inflate.configure(params.params()).unwrap();
    inflate.decode(&mut frames[0]).unwrap();
    assert_eq!(b"Hello", frames[0].payload())
}
