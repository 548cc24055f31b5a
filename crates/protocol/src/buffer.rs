use std::sync::Mutex;

use bytes::BytesMut;

use crate::limits::BUFFER_POOL_ELEMENT;

/// Reusable scratch buffers for the encode path.
///
/// Encoding a segment-sized frame needs a multi-megabyte buffer; recycling
/// them keeps the writer from re-allocating per message. Buffers that grew
/// past the element size are dropped instead of hoarded.
pub struct BufferPool {
    element_size: usize,
    max_pooled: usize,
    shelf: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    /// Pool of `max_pooled` buffers of `element_size` capacity each.
    #[must_use]
    pub fn new(element_size: usize, max_pooled: usize) -> Self {
        Self {
            element_size,
            max_pooled,
            shelf: Mutex::new(Vec::with_capacity(max_pooled)),
        }
    }

    /// Takes a cleared buffer from the pool, or allocates a fresh one.
    #[must_use]
    pub fn get(&self) -> BytesMut {
        let mut shelf = self.shelf.lock().expect("buffer pool lock poisoned");
        shelf
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.element_size))
    }

    /// Returns a buffer to the pool.
    pub fn put(&self, mut buf: BytesMut) {
        if buf.capacity() > self.element_size {
            return;
        }
        buf.clear();
        let mut shelf = self.shelf.lock().expect("buffer pool lock poisoned");
        if shelf.len() < self.max_pooled {
            shelf.push(buf);
        }
    }

    /// Buffers currently shelved.
    #[must_use]
    pub fn pooled(&self) -> usize {
        self.shelf.lock().expect("buffer pool lock poisoned").len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(BUFFER_POOL_ELEMENT, 8)
    }
}
