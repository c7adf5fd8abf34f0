// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! Client-side deflate compression extension mostly conformant with [RFC 7692][rfc7692].
//!
//! [rfc7692]: https://tools.ietf.org/html/rfc7692

use crate::{
    BoxedError,
    base::{Frame, OpCode},
    extension::{Extension, Param}
};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};
use log::{debug, trace};
use smallvec::SmallVec;
use std::fmt;

/// Name of the deflate extension.
pub const NAME: &str = "permessage-deflate";

const SERVER_NO_CONTEXT_TAKEOVER: &str = "server_no_context_takeover";
const SERVER_MAX_WINDOW_BITS: &str = "server_max_window_bits";

const CLIENT_NO_CONTEXT_TAKEOVER: &str = "client_no_context_takeover";
const CLIENT_MAX_WINDOW_BITS: &str = "client_max_window_bits";

/// Default max. size of an inflated message (256 MiB).
const DEFAULT_MAX_MESSAGE_SIZE: usize = 256 * 1024 * 1024;

// cf. RFC 7692, sections 7.2.1 and 7.2.2
const TRAILER: [u8; 4] = [0, 0, 0xFF, 0xFF];

/// The deflate extension type.
///
/// The extension asks for no context takeover in both directions, so every
/// message gets a fresh compression context.
pub struct Deflate {
    params: SmallVec<[Param<'static>; 3]>,
    our_max_window_bits: u8,
    their_max_window_bits: u8,
    max_message_size: usize,
    /// Bytes inflated so far for the current incoming message.
    inflated: usize,
    /// Compressor of the outgoing message currently being fragmented.
    compress: Option<Compress>,
    /// Decompressor of the incoming message currently being fragmented.
    decompress: Option<Decompress>
}

impl fmt::Debug for Deflate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Deflate")
            .field("params", &self.params)
            .field("our_max_window_bits", &self.our_max_window_bits)
            .field("their_max_window_bits", &self.their_max_window_bits)
            .field("max_message_size", &self.max_message_size)
            .finish()
    }
}

impl Default for Deflate {
    fn default() -> Self {
        Deflate::new()
    }
}

impl Deflate {
    /// Create a new client-side deflate extension.
    pub fn new() -> Self {
        let mut params = SmallVec::new();
        params.push(Param::new(SERVER_NO_CONTEXT_TAKEOVER));
        params.push(Param::new(CLIENT_NO_CONTEXT_TAKEOVER));
        params.push(Param::new(CLIENT_MAX_WINDOW_BITS));
        Deflate {
            params,
            our_max_window_bits: 15,
            their_max_window_bits: 15,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            inflated: 0,
            compress: None,
            decompress: None
        }
    }

    /// Set the client's max. window bits.
    ///
    /// The value must be within 9 ..= 15.
    pub fn set_max_client_window_bits(&mut self, max: u8) -> Result<(), BoxedError> {
        if !(9 ..= 15).contains(&max) {
            return Err(format!("max. client window bits have to be within 9 ..= 15, not {}", max).into())
        }
        self.our_max_window_bits = max;
        if let Some(p) = self.params.iter_mut().find(|p| p.name() == CLIENT_MAX_WINDOW_BITS) {
            p.set_value(Some(max.to_string()));
        }
        Ok(())
    }

    /// Set the max. size an incoming message may inflate to (default = 256 MiB).
    pub fn set_max_message_size(&mut self, max: usize) -> &mut Self {
        self.max_message_size = max;
        self
    }

    fn window_bits(p: &Param) -> Result<Option<u8>, BoxedError> {
        let Some(v) = p.value() else {
            return Ok(None)
        };
        match v.parse::<u8>() {
            Ok(n) if (8 ..= 15).contains(&n) => Ok(Some(n)),
            _ => Err(format!("invalid {}: {:?} (expected range: 8 ..= 15)", p.name(), v).into())
        }
    }
}

impl Extension for Deflate {
    fn name(&self) -> &str {
        NAME
    }

    fn params(&self) -> &[Param] {
        &self.params
    }

    fn configure(&mut self, params: &[Param]) -> Result<(), BoxedError> {
        let mut server_no_context_takeover = false;
        for p in params {
            match p.name() {
                SERVER_NO_CONTEXT_TAKEOVER => server_no_context_takeover = true,
                CLIENT_NO_CONTEXT_TAKEOVER => {} // we never take over context anyway
                SERVER_MAX_WINDOW_BITS =>
                    if let Some(v) = Deflate::window_bits(p)? {
                        // zlib supports 9 ..= 15 only
                        self.their_max_window_bits = std::cmp::max(9, v)
                    }
                CLIENT_MAX_WINDOW_BITS =>
                    if let Some(v) = Deflate::window_bits(p)? {
                        self.our_max_window_bits = std::cmp::min(self.our_max_window_bits, std::cmp::max(9, v))
                    }
                other => return Err(format!("{}: unknown parameter: {}", NAME, other).into())
            }
        }
        if !server_no_context_takeover {
            return Err(format!("{}: server did not confirm no context takeover", NAME).into())
        }
        debug!("{}: window bits ours = {}, theirs = {}", NAME, self.our_max_window_bits, self.their_max_window_bits);
        Ok(())
    }

    fn reserved_bits(&self) -> (bool, bool, bool) {
        (true, false, false)
    }

    fn decode(&mut self, frame: &mut Frame) -> Result<(), BoxedError> {
        match frame.header().opcode() {
            OpCode::Binary | OpCode::Text if frame.header().is_rsv1() => {
                self.decompress = Some(Decompress::new_with_window_bits(false, self.their_max_window_bits));
                self.inflated = 0
            }
            OpCode::Continue if self.decompress.is_some() => {}
            _ => {
                trace!("deflate: not decoding {}", frame.header());
                return Ok(())
            }
        }
        trace!("deflate: decoding {}", frame.header());

        let is_fin = frame.header().is_fin();
        let mut input = std::mem::take(frame.payload_mut()).to_vec();
        if is_fin {
            input.extend_from_slice(&TRAILER)
        }

        let mut output = Vec::with_capacity(input.len() * 2);
        let limit = self.max_message_size.saturating_sub(self.inflated);
        if let Some(d) = self.decompress.as_mut() {
            if let Err(e) = inflate(d, &input, &mut output, limit) {
                self.decompress = None;
                return Err(e)
            }
        }
        self.inflated += output.len();
        if is_fin {
            self.decompress = None
        }

        frame.header_mut().set_rsv1(false);
        frame.set_payload(&output[..]);
        Ok(())
    }

    fn encode(&mut self, frame: &mut Frame) -> Result<(), BoxedError> {
        match frame.header().opcode() {
            OpCode::Binary | OpCode::Text => {
                let c = Compress::new_with_window_bits(Compression::fast(), false, self.our_max_window_bits);
                self.compress = Some(c);
                frame.header_mut().set_rsv1(true);
            }
            OpCode::Continue if self.compress.is_some() => {}
            _ => {
                trace!("deflate: not encoding {}", frame.header());
                return Ok(())
            }
        }
        trace!("deflate: encoding {}", frame.header());

        let mut output = Vec::with_capacity(frame.payload().len() + 16);
        if let Some(c) = self.compress.as_mut() {
            deflate(c, frame.payload(), &mut output)?
        }
        if frame.header().is_fin() {
            if output.ends_with(&TRAILER) {
                output.truncate(output.len() - TRAILER.len())
            }
            self.compress = None
        }

        frame.set_payload(&output[..]);
        Ok(())
    }
}

/// Compress all of `input` into `output`, finishing with a sync flush.
fn deflate(c: &mut Compress, input: &[u8], output: &mut Vec<u8>) -> Result<(), BoxedError> {
    let start = c.total_in();
    loop {
        let consumed = usize::try_from(c.total_in() - start)?;
        output.reserve(input.len() - consumed + 64);
        let before = c.total_out();
        c.compress_vec(&input[consumed ..], output, FlushCompress::Sync)?;
        let now_consumed = usize::try_from(c.total_in() - start)?;
        let stalled = c.total_out() == before && now_consumed == consumed;
        if now_consumed == input.len() && (output.len() < output.capacity() || stalled) {
            return Ok(())
        }
        if stalled {
            return Err("deflate: compressor made no progress".into())
        }
    }
}

/// Decompress all of `input` into `output`, producing at most `limit` bytes.
fn inflate(d: &mut Decompress, input: &[u8], output: &mut Vec<u8>, limit: usize) -> Result<(), BoxedError> {
    let start = d.total_in();
    loop {
        let consumed = usize::try_from(d.total_in() - start)?;
        output.reserve(2 * (input.len() - consumed) + 64);
        let before = d.total_out();
        d.decompress_vec(&input[consumed ..], output, FlushDecompress::Sync)?;
        if output.len() > limit {
            return Err(format!("deflate: inflated message exceeds {} bytes", limit).into())
        }
        let now_consumed = usize::try_from(d.total_in() - start)?;
        let stalled = d.total_out() == before && now_consumed == consumed;
        if now_consumed == input.len() && (output.len() < output.capacity() || stalled) {
            return Ok(())
        }
        if stalled {
            return Err("deflate: decompressor made no progress".into())
        }
    }
}
