// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! A websocket [base] frame and the framing codec used after the upgrade.
//!
//! The codec is used in both directions by the steady-state channel: one
//! instance as the outgoing framer, one as the incoming parser. Each keeps
//! its own set of reserved bits which negotiated extensions mark as in use.
//!
//! [base]: https://tools.ietf.org/html/rfc6455#section-5.2

use bytes::{Buf, BufMut, BytesMut};
use std::{convert::TryFrom, fmt};

// OpCode /////////////////////////////////////////////////////////////////////////////////////////

/// Operation codes defined in [RFC6455](https://tools.ietf.org/html/rfc6455#section-5.2).
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum OpCode {
    /// Indicates a continuation frame of a fragmented message.
    Continue,
    /// Indicates a text data frame.
    Text,
    /// Indicates a binary data frame.
    Binary,
    /// Indicates a close control frame.
    Close,
    /// Indicates a ping control frame.
    Ping,
    /// Indicates a pong control frame.
    Pong,
    /// Indicates a reserved op code.
    Reserved
}

impl OpCode {
    /// Is this a control opcode?
    pub fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }

    /// Is this opcode reserved?
    pub fn is_reserved(self) -> bool {
        matches!(self, OpCode::Reserved)
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            OpCode::Continue => f.write_str("Continue"),
            OpCode::Text => f.write_str("Text"),
            OpCode::Binary => f.write_str("Binary"),
            OpCode::Close => f.write_str("Close"),
            OpCode::Ping => f.write_str("Ping"),
            OpCode::Pong => f.write_str("Pong"),
            OpCode::Reserved => f.write_str("Reserved")
        }
    }
}

/// Error returned by `OpCode::try_from` if an unknown opcode
/// number is encountered.
#[derive(Debug)]
pub struct UnknownOpCode(());

impl fmt::Display for UnknownOpCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("unknown opcode")
    }
}

impl std::error::Error for UnknownOpCode {}

impl TryFrom<u8> for OpCode {
    type Error = UnknownOpCode;

    fn try_from(val: u8) -> Result<OpCode, Self::Error> {
        match val {
            0 => Ok(OpCode::Continue),
            1 => Ok(OpCode::Text),
            2 => Ok(OpCode::Binary),
            8 => Ok(OpCode::Close),
            9 => Ok(OpCode::Ping),
            10 => Ok(OpCode::Pong),
            3 ..= 7 | 11 ..= 15 => Ok(OpCode::Reserved),
            _ => Err(UnknownOpCode(()))
        }
    }
}

impl From<OpCode> for u8 {
    fn from(opcode: OpCode) -> u8 {
        match opcode {
            OpCode::Continue => 0,
            OpCode::Text => 1,
            OpCode::Binary => 2,
            OpCode::Close => 8,
            OpCode::Ping => 9,
            OpCode::Pong => 10,
            OpCode::Reserved => 3
        }
    }
}

// Header /////////////////////////////////////////////////////////////////////////////////////////

/// A base [`Frame`] header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    fin: bool,
    rsv1: bool,
    rsv2: bool,
    rsv3: bool,
    masked: bool,
    opcode: OpCode,
    mask: u32
}

impl Header {
    /// Create a new header with a given [`OpCode`].
    ///
    /// The `fin` flag is set, i.e. the header describes an unfragmented frame.
    pub fn new(oc: OpCode) -> Self {
        Self {
            fin: true,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            masked: false,
            opcode: oc,
            mask: 0
        }
    }

    /// Is the `fin` flag set?
    pub fn is_fin(&self) -> bool {
        self.fin
    }

    /// Set the `fin` flag.
    pub fn set_fin(&mut self, fin: bool) -> &mut Self {
        self.fin = fin;
        self
    }

    /// Is the `rsv1` flag set?
    pub fn is_rsv1(&self) -> bool {
        self.rsv1
    }

    /// Set the `rsv1` flag.
    pub fn set_rsv1(&mut self, rsv1: bool) -> &mut Self {
        self.rsv1 = rsv1;
        self
    }

    /// Is the `rsv2` flag set?
    pub fn is_rsv2(&self) -> bool {
        self.rsv2
    }

    /// Set the `rsv2` flag.
    pub fn set_rsv2(&mut self, rsv2: bool) -> &mut Self {
        self.rsv2 = rsv2;
        self
    }

    /// Is the `rsv3` flag set?
    pub fn is_rsv3(&self) -> bool {
        self.rsv3
    }

    /// Set the `rsv3` flag.
    pub fn set_rsv3(&mut self, rsv3: bool) -> &mut Self {
        self.rsv3 = rsv3;
        self
    }

    /// Is the `masked` flag set?
    pub fn is_masked(&self) -> bool {
        self.masked
    }

    /// Set the `masked` flag.
    pub fn set_masked(&mut self, masked: bool) -> &mut Self {
        self.masked = masked;
        self
    }

    /// Get the `opcode`.
    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    /// Set the `opcode`
    pub fn set_opcode(&mut self, opcode: OpCode) -> &mut Self {
        self.opcode = opcode;
        self
    }

    /// Get the `mask`.
    pub fn mask(&self) -> u32 {
        self.mask
    }

    /// Set the `mask`
    pub fn set_mask(&mut self, mask: u32) -> &mut Self {
        self.mask = mask;
        self
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({} (fin {}) (rsv {}{}{}) (mask {}))",
            self.opcode,
            u8::from(self.fin),
            u8::from(self.rsv1),
            u8::from(self.rsv2),
            u8::from(self.rsv3),
            u8::from(self.masked))
    }
}

impl From<Header> for Frame {
    fn from(header: Header) -> Self {
        Frame { header, payload: BytesMut::new() }
    }
}

// Frame //////////////////////////////////////////////////////////////////////////////////////////

/// A websocket [base](https://tools.ietf.org/html/rfc6455#section-5.2) frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    header: Header,
    payload: BytesMut
}

impl Frame {
    /// Create a new, unfragmented frame with the given opcode and payload.
    pub fn new(opcode: OpCode, payload: impl Into<BytesMut>) -> Self {
        Frame { header: Header::new(opcode), payload: payload.into() }
    }

    /// Get the frame header.
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Get a mutable reference to the frame header.
    pub fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    /// Get the (unmasked) payload data.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Get a mutable reference to the payload data.
    pub fn payload_mut(&mut self) -> &mut BytesMut {
        &mut self.payload
    }

    /// Set the payload data.
    pub fn set_payload(&mut self, bytes: impl Into<BytesMut>) -> &mut Self {
        self.payload = bytes.into();
        self
    }

    /// Consume this frame and return the payload data.
    pub fn into_payload(self) -> BytesMut {
        self.payload
    }
}

// Frame codec ////////////////////////////////////////////////////////////////////////////////////

/// Max. size of a control frame payload.
pub(crate) const MAX_CTRL_BODY_SIZE: u64 = 125;

/// If the payload length byte is 126, the following two bytes represent the
/// actual payload length.
const TWO_EXT: u8 = 126;

/// If the payload length byte is 127, the following eight bytes represent
/// the actual payload length.
const EIGHT_EXT: u8 = 127;

const RSV1: u8 = 0x4;
const RSV2: u8 = 0x2;
const RSV3: u8 = 0x1;

/// Codec for encoding/decoding websocket [base] [`Frame`]s.
///
/// [base]: https://tools.ietf.org/html/rfc6455#section-5.2
#[derive(Debug)]
pub struct Codec {
    /// Decode state
    state: Option<DecodeState>,
    /// Bits reserved by extensions.
    reserved_bits: u8,
    /// Max. accepted payload size.
    max_payload_size: u64
}

#[derive(Debug)]
enum DecodeState {
    Start,
    HeaderStart {
        header: Header,
        length_code: u8
    },
    HeaderLength {
        header: Header,
        length: u64
    },
    Body {
        header: Header,
        length: u64
    }
}

impl Default for Codec {
    fn default() -> Self {
        Codec::new()
    }
}

impl Codec {
    /// Create a new codec with no reserved bits in use.
    pub fn new() -> Self {
        Self {
            state: Some(DecodeState::Start),
            reserved_bits: 0,
            max_payload_size: 256 * 1024 * 1024
        }
    }

    /// The reserved bits currently in use, as `(rsv1, rsv2, rsv3)`.
    pub fn reserved_bits(&self) -> (bool, bool, bool) {
        let r = self.reserved_bits;
        (r & RSV1 != 0, r & RSV2 != 0, r & RSV3 != 0)
    }

    /// Mark rsv1 as used by an extension.
    pub fn set_rsv1_in_use(&mut self) -> &mut Self {
        self.reserved_bits |= RSV1;
        self
    }

    /// Mark rsv2 as used by an extension.
    pub fn set_rsv2_in_use(&mut self) -> &mut Self {
        self.reserved_bits |= RSV2;
        self
    }

    /// Mark rsv3 as used by an extension.
    pub fn set_rsv3_in_use(&mut self) -> &mut Self {
        self.reserved_bits |= RSV3;
        self
    }

    /// Set the max. payload size a decoded frame may have.
    pub fn set_max_payload_size(&mut self, size: u64) -> &mut Self {
        self.max_payload_size = size;
        self
    }

    /// Decode the next frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` if `buf` does not hold a complete frame yet. Partially
    /// decoded header state is retained across calls.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, Error> {
        loop {
            match self.state.take() {
                Some(DecodeState::Start) => {
                    if buf.len() < 2 {
                        self.state = Some(DecodeState::Start);
                        return Ok(None)
                    }

                    let first = buf.get_u8();
                    let second = buf.get_u8();

                    let fin = first & 0x80 != 0;
                    let opcode = OpCode::try_from(first & 0x0F)?;
                    if opcode.is_reserved() {
                        return Err(Error::ReservedOpCode)
                    }
                    if opcode.is_control() && !fin {
                        return Err(Error::FragmentedControl)
                    }

                    let mut header = Header::new(opcode);
                    header.set_fin(fin);

                    let rsv1 = first & 0x40 != 0;
                    if rsv1 && (self.reserved_bits & RSV1 == 0) {
                        return Err(Error::InvalidReservedBit(1))
                    }
                    header.set_rsv1(rsv1);

                    let rsv2 = first & 0x20 != 0;
                    if rsv2 && (self.reserved_bits & RSV2 == 0) {
                        return Err(Error::InvalidReservedBit(2))
                    }
                    header.set_rsv2(rsv2);

                    let rsv3 = first & 0x10 != 0;
                    if rsv3 && (self.reserved_bits & RSV3 == 0) {
                        return Err(Error::InvalidReservedBit(3))
                    }
                    header.set_rsv3(rsv3);
                    header.set_masked(second & 0x80 != 0);

                    self.state = Some(DecodeState::HeaderStart { header, length_code: second & 0x7F })
                }
                Some(DecodeState::HeaderStart { header, length_code }) => {
                    let len = match length_code {
                        TWO_EXT => {
                            if buf.len() < 2 {
                                self.state = Some(DecodeState::HeaderStart { header, length_code });
                                return Ok(None)
                            }
                            u64::from(buf.get_u16())
                        }
                        EIGHT_EXT => {
                            if buf.len() < 8 {
                                self.state = Some(DecodeState::HeaderStart { header, length_code });
                                return Ok(None)
                            }
                            buf.get_u64()
                        }
                        n => u64::from(n)
                    };

                    if len > MAX_CTRL_BODY_SIZE && header.opcode().is_control() {
                        return Err(Error::InvalidControlFrameLen)
                    }
                    if len > self.max_payload_size {
                        return Err(Error::PayloadTooLarge { actual: len, maximum: self.max_payload_size })
                    }

                    self.state = Some(DecodeState::HeaderLength { header, length: len })
                }
                Some(DecodeState::HeaderLength { mut header, length }) => {
                    if !header.is_masked() {
                        self.state = Some(DecodeState::Body { header, length });
                        continue
                    }
                    if buf.len() < 4 {
                        self.state = Some(DecodeState::HeaderLength { header, length });
                        return Ok(None)
                    }
                    header.set_mask(buf.get_u32());
                    self.state = Some(DecodeState::Body { header, length })
                }
                Some(DecodeState::Body { header, length }) => {
                    // `length` is bounded by `max_payload_size` which fits into memory.
                    let length = length as usize;
                    if buf.len() < length {
                        buf.reserve(length - buf.len());
                        self.state = Some(DecodeState::Body { header, length: length as u64 });
                        return Ok(None)
                    }
                    let mut payload = buf.split_to(length);
                    if header.is_masked() {
                        apply_mask(&mut payload, header.mask())
                    }
                    self.state = Some(DecodeState::Start);
                    return Ok(Some(Frame { header, payload }))
                }
                None => return Err(Error::IllegalState)
            }
        }
    }

    /// Encode the given frame into `buf`.
    ///
    /// If the frame header is masked, the payload is masked while copying.
    /// Reserved bits set on the frame must have been marked as in use.
    pub fn encode(&mut self, frame: &Frame, buf: &mut BytesMut) -> Result<(), Error> {
        let header = frame.header();

        let mut first_byte = 0_u8;
        if header.is_fin() {
            first_byte |= 0x80
        }
        if header.is_rsv1() {
            if self.reserved_bits & RSV1 == 0 {
                return Err(Error::InvalidReservedBit(1))
            }
            first_byte |= 0x40
        }
        if header.is_rsv2() {
            if self.reserved_bits & RSV2 == 0 {
                return Err(Error::InvalidReservedBit(2))
            }
            first_byte |= 0x20
        }
        if header.is_rsv3() {
            if self.reserved_bits & RSV3 == 0 {
                return Err(Error::InvalidReservedBit(3))
            }
            first_byte |= 0x10
        }

        let opcode: u8 = header.opcode().into();
        first_byte |= opcode;

        let len = frame.payload().len();
        buf.reserve(14 + len);
        buf.put_u8(first_byte);

        let mut second_byte = 0_u8;
        if header.is_masked() {
            second_byte |= 0x80
        }

        if len < usize::from(TWO_EXT) {
            second_byte |= len as u8;
            buf.put_u8(second_byte);
        } else if len <= usize::from(u16::MAX) {
            second_byte |= TWO_EXT;
            buf.put_u8(second_byte);
            buf.put_u16(len as u16)
        } else {
            second_byte |= EIGHT_EXT;
            buf.put_u8(second_byte);
            buf.put_u64(len as u64)
        }

        if header.is_masked() {
            buf.put_u32(header.mask());
            let start = buf.len();
            buf.extend_from_slice(frame.payload());
            apply_mask(&mut buf[start ..], header.mask())
        } else {
            buf.extend_from_slice(frame.payload())
        }

        Ok(())
    }
}

/// Apply the (un-)masking to the given data.
pub(crate) fn apply_mask(buf: &mut [u8], mask: u32) {
    let mask_buf = mask.to_be_bytes();
    for (byte, &key) in buf.iter_mut().zip(mask_buf.iter().cycle()) {
        *byte ^= key;
    }
}

// Codec error type ///////////////////////////////////////////////////////////////////////////////

/// Frame codec errors.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// An unknown opcode was encountered.
    UnknownOpCode,
    /// A reserved opcode was encountered.
    ReservedOpCode,
    /// A control frame was not final.
    FragmentedControl,
    /// A control frame payload exceeded 125 bytes.
    InvalidControlFrameLen,
    /// A reserved bit was set which no negotiated extension uses.
    InvalidReservedBit(u8),
    /// The payload length exceeded the configured maximum.
    PayloadTooLarge {
        /// The announced payload length.
        actual: u64,
        /// The configured maximum.
        maximum: u64
    },
    /// The decoder was left in an unusable state by a previous error.
    IllegalState
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::UnknownOpCode => f.write_str("unknown opcode"),
            Error::ReservedOpCode => f.write_str("reserved opcode"),
            Error::FragmentedControl => f.write_str("fragmented control frame"),
            Error::InvalidControlFrameLen => f.write_str("invalid control frame (len > 125)"),
            Error::InvalidReservedBit(n) => write!(f, "invalid rsv{} bit set", n),
            Error::PayloadTooLarge { actual, maximum } =>
                write!(f, "payload too large: len = {}, maximum = {}", actual, maximum),
            Error::IllegalState => f.write_str("illegal codec state")
        }
    }
}

impl std::error::Error for Error {}

impl From<UnknownOpCode> for Error {
    fn from(_: UnknownOpCode) -> Self {
        Error::UnknownOpCode
    }
}

// Tests //////////////////////////////////////////////////////////////////////////////////////////
