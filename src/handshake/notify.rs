// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

use futures::{channel::oneshot, prelude::*};
use log::debug;
use std::{pin::Pin, task::{Context, Poll}};
use super::{Error, Response};

/// Create a connected notifier and handshake future.
pub(crate) fn channel() -> (Notifier, Handshake) {
    let (tx, rx) = oneshot::channel();
    (Notifier { tx }, Handshake { rx })
}

/// Reports the outcome of a handshake exactly once.
///
/// Both reporting methods consume the notifier, so a handshake can not
/// be reported as succeeded and failed.
#[derive(Debug)]
pub(crate) struct Notifier {
    tx: oneshot::Sender<Result<Response, Error>>
}

impl Notifier {
    pub(crate) fn complete(self, response: Response) {
        if self.tx.send(Ok(response)).is_err() {
            debug!("handshake succeeded but nobody is waiting for it")
        }
    }

    pub(crate) fn fail(self, error: Error) {
        if let Err(Err(e)) = self.tx.send(Err(error)) {
            debug!("handshake failed but nobody is waiting for it: {}", e)
        }
    }
}

/// Resolves to the outcome of an upgrade.
///
/// If the upgrade connection is dropped before reporting an outcome,
/// the handshake resolves to [`Error::Aborted`].
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct Handshake {
    rx: oneshot::Receiver<Result<Response, Error>>
}

impl Future for Handshake {
    type Output = Result<Response, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        match self.rx.poll_unpin(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(Error::Aborted)),
            Poll::Pending => Poll::Pending
        }
    }
}
