// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! A pool of reusable read buffers.

use bytes::BytesMut;
use std::{ops::{Deref, DerefMut}, sync::{Arc, Mutex, PoisonError}};

/// Max. number of idle buffers kept per pool.
const MAX_IDLE: usize = 64;

/// Shared pool of byte buffers.
///
/// Buffers are handed out as [`Pooled`] guards which go back into the pool
/// when dropped.
#[derive(Debug, Clone, Default)]
pub struct BufferPool {
    idle: Arc<Mutex<Vec<BytesMut>>>
}

impl BufferPool {
    /// Create a new, empty pool.
    pub fn new() -> Self {
        BufferPool::default()
    }

    /// Take a cleared buffer with at least `capacity` bytes of capacity.
    pub fn acquire(&self, capacity: usize) -> Pooled {
        let idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner).pop();
        let mut buffer = idle.unwrap_or_default();
        buffer.clear();
        buffer.reserve(capacity);
        Pooled { buffer, pool: self.clone() }
    }

    /// Number of idle buffers in this pool.
    pub fn idle(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn release(&self, buffer: BytesMut) {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < MAX_IDLE {
            idle.push(buffer)
        }
    }
}

/// A buffer borrowed from a [`BufferPool`].
#[derive(Debug)]
pub struct Pooled {
    buffer: BytesMut,
    pool: BufferPool
}

impl Deref for Pooled {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buffer
    }
}

impl DerefMut for Pooled {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }
}

impl Drop for Pooled {
    fn drop(&mut self) {
        let buffer = std::mem::take(&mut self.buffer);
        self.pool.release(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::BufferPool;

    #[test]
    fn buffers_return_on_drop() {
        let pool = BufferPool::new();
        {
            let mut a = pool.acquire(16);
            a.extend_from_slice(b"abc");
            let _b = pool.acquire(16);
            assert_eq!(0, pool.idle())
        }
        assert_eq!(2, pool.idle());
        let a = pool.acquire(16);
        assert!(a.is_empty());
        assert!(a.capacity() >= 16);
        assert_eq!(1, pool.idle())
    }
}
