//! Reusable copy buffers.
//!
//! Every splice direction borrows one fixed-size buffer; a free-list keeps
//! the steady-state allocation rate at zero regardless of connection churn.

use std::sync::{Mutex, OnceLock};

/// Size of one copy buffer.
pub const COPY_BUF_LEN: usize = 4096;

/// Maximum idle buffers retained by the shared pool.
const MAX_IDLE: usize = 64;

/// A thread-safe free-list of copy buffers.
#[derive(Debug, Default)]
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a zero-initialized buffer of [`COPY_BUF_LEN`] bytes.
    pub fn get(&self) -> Vec<u8> {
        let mut free = self.free.lock().unwrap();
        free.pop().unwrap_or_else(|| vec![0u8; COPY_BUF_LEN])
    }

    /// Return a buffer for reuse. Foreign-sized buffers are dropped.
    pub fn put(&self, buf: Vec<u8>) {
        if buf.len() != COPY_BUF_LEN {
            return;
        }
        let mut free = self.free.lock().unwrap();
        if free.len() < MAX_IDLE {
            free.push(buf);
        }
    }

    #[cfg(test)]
    fn idle(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

/// The process-wide pool used by the splice engine.
pub fn copy_buffers() -> &'static BufferPool {
    static POOL: OnceLock<BufferPool> = OnceLock::new();
    POOL.get_or_init(BufferPool::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_returned_buffers() {
        let pool = BufferPool::new();
        let buf = pool.get();
        assert_eq!(buf.len(), COPY_BUF_LEN);
        pool.put(buf);
        assert_eq!(pool.idle(), 1);
        let _again = pool.get();
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn drops_foreign_buffers() {
        let pool = BufferPool::new();
        pool.put(vec![0u8; 16]);
        assert_eq!(pool.idle(), 0);
    }
}
