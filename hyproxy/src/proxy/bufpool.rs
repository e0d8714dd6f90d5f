//! Reusable receive buffers for the demux hot path.
//!
//! A concurrent free list of max-size UDP buffers; checkout/return brackets
//! each `recv_from` so steady-state traffic does not allocate. Buffer
//! contents are not cleared between uses.

use std::sync::Mutex;

use crate::constants::UDP_BUFFER_SIZE;

/// Free list of 65535-byte buffers.
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    max_pooled: usize,
}

impl BufferPool {
    pub fn new(max_pooled: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            max_pooled,
        }
    }

    /// Takes a buffer from the pool, allocating one when empty.
    pub fn get(&self) -> Vec<u8> {
        self.free
            .lock()
            .expect("buffer pool poisoned")
            .pop()
            .unwrap_or_else(|| vec![0u8; UDP_BUFFER_SIZE])
    }

    /// Returns a buffer to the pool. Buffers beyond the pool cap are freed.
    pub fn put(&self, buf: Vec<u8>) {
        if buf.len() != UDP_BUFFER_SIZE {
            return;
        }
        let mut free = self.free.lock().expect("buffer pool poisoned");
        if free.len() < self.max_pooled {
            free.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_returned_buffers() {
        let pool = BufferPool::new(4);
        let buf = pool.get();
        assert_eq!(buf.len(), UDP_BUFFER_SIZE);
        let ptr = buf.as_ptr();
        pool.put(buf);
        let again = pool.get();
        assert_eq!(again.as_ptr(), ptr);
    }

    #[test]
    fn cap_is_enforced() {
        let pool = BufferPool::new(1);
        pool.put(vec![0u8; UDP_BUFFER_SIZE]);
        pool.put(vec![0u8; UDP_BUFFER_SIZE]);
        let free = pool.free.lock().unwrap();
        assert_eq!(free.len(), 1);
    }

    #[test]
    fn wrong_size_buffers_rejected() {
        let pool = BufferPool::new(4);
        pool.put(vec![0u8; 100]);
        assert_eq!(pool.free.lock().unwrap().len(), 0);
    }
}
