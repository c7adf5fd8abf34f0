// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! Frame pipelines through the negotiated extensions.
//!
//! Given the extensions `[E1, E2, E3]` in negotiation order, outgoing frames
//! travel `E1 -> E2 -> E3 -> egress` and incoming frames travel
//! `E3 -> E2 -> E1 -> application`.

use crate::{base::{Codec, Frame}, connection::Error, extension::Extension};
use log::{debug, trace};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Accepts frames arriving from the peer.
pub trait IncomingFrames: Send {
    /// Process an incoming frame.
    fn incoming_frame(&mut self, frame: Frame) -> Result<(), Error>;
}

/// Accepts frames on their way to the peer.
pub trait OutgoingFrames: Send {
    /// Process an outgoing frame.
    fn outgoing_frame(&mut self, frame: Frame) -> Result<(), Error>;
}

impl<F> IncomingFrames for F
where
    F: FnMut(Frame) -> Result<(), Error> + Send
{
    fn incoming_frame(&mut self, frame: Frame) -> Result<(), Error> {
        self(frame)
    }
}

/// An extension instance used by both pipelines of a connection.
pub type SharedExtension = Arc<Mutex<Box<dyn Extension>>>;

fn lock(e: &SharedExtension) -> MutexGuard<'_, Box<dyn Extension>> {
    e.lock().unwrap_or_else(PoisonError::into_inner)
}

struct OutgoingStage {
    extension: SharedExtension,
    next: Box<dyn OutgoingFrames>
}

impl OutgoingFrames for OutgoingStage {
    fn outgoing_frame(&mut self, mut frame: Frame) -> Result<(), Error> {
        {
            let mut e = lock(&self.extension);
            trace!("{}: outgoing {}", e.name(), frame.header());
            e.encode(&mut frame).map_err(Error::Extension)?
        }
        self.next.outgoing_frame(frame)
    }
}

struct IncomingStage {
    extension: SharedExtension,
    next: Box<dyn IncomingFrames>
}

impl IncomingFrames for IncomingStage {
    fn incoming_frame(&mut self, mut frame: Frame) -> Result<(), Error> {
        {
            let mut e = lock(&self.extension);
            trace!("{}: incoming {}", e.name(), frame.header());
            e.decode(&mut frame).map_err(Error::Extension)?
        }
        self.next.incoming_frame(frame)
    }
}

/// The two frame chains of a connection.
pub struct Pipeline {
    incoming: Box<dyn IncomingFrames>,
    outgoing: Box<dyn OutgoingFrames>,
    extensions: Vec<SharedExtension>
}

impl Pipeline {
    /// Build both chains around the given extensions.
    ///
    /// `ingress` receives what comes out of the incoming chain and `egress`
    /// what comes out of the outgoing chain. Every reserved bit an extension
    /// uses is marked on both codecs. Two extensions claiming the same bit
    /// are not rejected here; keeping the bits distinct is up to negotiation.
    pub fn build
        ( extensions: Vec<Box<dyn Extension>>
        , ingress: Box<dyn IncomingFrames>
        , egress: Box<dyn OutgoingFrames>
        , encoder: &mut Codec
        , decoder: &mut Codec
        ) -> Self
    {
        let extensions: Vec<SharedExtension> =
            extensions.into_iter().map(|e| Arc::new(Mutex::new(e))).collect();

        for e in &extensions {
            let e = lock(e);
            let (rsv1, rsv2, rsv3) = e.reserved_bits();
            debug!("{}: reserved bits in use: rsv1 = {}, rsv2 = {}, rsv3 = {}", e.name(), rsv1, rsv2, rsv3);
            for codec in [&mut *encoder, &mut *decoder] {
                if rsv1 {
                    codec.set_rsv1_in_use();
                }
                if rsv2 {
                    codec.set_rsv2_in_use();
                }
                if rsv3 {
                    codec.set_rsv3_in_use();
                }
            }
        }

        let mut outgoing = egress;
        for e in extensions.iter().rev() {
            outgoing = Box::new(OutgoingStage { extension: e.clone(), next: outgoing })
        }

        let mut incoming = ingress;
        for e in &extensions {
            incoming = Box::new(IncomingStage { extension: e.clone(), next: incoming })
        }

        Pipeline { incoming, outgoing, extensions }
    }

    /// Number of extensions in this pipeline.
    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    /// Does this pipeline pass frames through unchanged?
    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    /// Names of the extensions in negotiation order.
    pub fn extension_names(&self) -> Vec<String> {
        self.extensions.iter().map(|e| lock(e).name().to_string()).collect()
    }

    /// Split into the head of the incoming and the head of the outgoing chain.
    pub fn into_parts(self) -> (Box<dyn IncomingFrames>, Box<dyn OutgoingFrames>) {
        (self.incoming, self.outgoing)
    }
}

impl IncomingFrames for Pipeline {
    fn incoming_frame(&mut self, frame: Frame) -> Result<(), Error> {
        self.incoming.incoming_frame(frame)
    }
}

impl OutgoingFrames for Pipeline {
    fn outgoing_frame(&mut self, frame: Frame) -> Result<(), Error> {
        self.outgoing.outgoing_frame(frame)
    }
}
