// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! An extension which passes frames through unchanged.

use crate::{BoxedError, base::Frame, extension::{Extension, Param}};
use log::trace;
use smallvec::SmallVec;

/// Name of the identity extension.
pub const NAME: &str = "identity";

/// The identity extension.
///
/// Keeps whatever parameters it was configured with but never touches a frame.
#[derive(Debug, Default)]
pub struct Identity {
    params: SmallVec<[Param<'static>; 2]>
}

impl Identity {
    /// Create a new identity extension.
    pub fn new() -> Self {
        Identity::default()
    }
}

impl Extension for Identity {
    fn name(&self) -> &str {
        NAME
    }

    fn params(&self) -> &[Param] {
        &self.params
    }

    fn configure(&mut self, params: &[Param]) -> Result<(), BoxedError> {
        self.params = params.iter().cloned().map(Param::acquire).collect();
        Ok(())
    }

    fn encode(&mut self, frame: &mut Frame) -> Result<(), BoxedError> {
        trace!("identity: encoding {}", frame.header());
        Ok(())
    }

    fn decode(&mut self, frame: &mut Frame) -> Result<(), BoxedError> {
        trace!("identity: decoding {}", frame.header());
        Ok(())
    }
}
