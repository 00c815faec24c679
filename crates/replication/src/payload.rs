//! Record payloads and the pooled copy allocator behind them.
//!
//! Every replicated command is copied once, on the producer side, into a
//! [`PayloadBuf`] drawn from a slab pool; the copy lives until the ring
//! overwrites its slot and drops it back into the pool. Payloads larger than
//! the pool's object size fall back to the global allocator. Snapshot anchor
//! payloads are the 32-byte hash stored inline — no allocation, nothing to
//! free.

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};
use sysutil::MemPool;

/// Byte size of a snapshot (SDB) content hash.
pub const SDB_HASH_SIZE: usize = 32;

/// One record payload as stored in the ring.
#[derive(Debug)]
pub enum Payload {
    /// A replicated command's opaque bytes, owned by the ring.
    Command(PayloadBuf),
    /// A snapshot anchor: the dump's content hash, inline.
    Anchor([u8; SDB_HASH_SIZE]),
}

impl Payload {
    /// Returns the payload bytes to put on the wire.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Command(buf) => buf.as_bytes(),
            Payload::Anchor(hash) => hash,
        }
    }
}

/// Pool of fixed-size payload buffers for command copies.
///
/// The pool itself is single-threaded; the mutex gates it because buffers
/// are returned from whichever thread drops the displaced record (in
/// practice the producer, inside the insert path).
pub struct PayloadPool {
    pool: Mutex<MemPool>,
    obj_size: usize,
}

impl PayloadPool {
    /// Default slab size: 4 MiB.
    pub const DEFAULT_SLAB_SIZE: usize = 4 * 1024 * 1024;
    /// Default pooled object size. Commands above this size are rare enough
    /// that the global allocator handles them.
    pub const DEFAULT_OBJ_SIZE: usize = 512;

    /// Creates a pool with the given slab and object sizes.
    pub fn new(slab_size: usize, obj_size: usize) -> Arc<Self> {
        Arc::new(Self {
            pool: Mutex::new(MemPool::new(slab_size, obj_size, 8)),
            obj_size,
        })
    }

    /// Creates a pool with the default sizes.
    pub fn with_defaults() -> Arc<Self> {
        Self::new(Self::DEFAULT_SLAB_SIZE, Self::DEFAULT_OBJ_SIZE)
    }

    /// Copies `bytes` into an owned buffer, pooled when it fits.
    pub fn copy_from(self: &Arc<Self>, bytes: &[u8]) -> PayloadBuf {
        let len = bytes.len();

        if len <= self.obj_size {
            if let Some(ptr) = self.pool.lock().unwrap().get() {
                // SAFETY: The pool object is obj_size >= len bytes and ours
                // exclusively until put() in PayloadBuf::drop.
                unsafe {
                    ptr.as_ptr().copy_from_nonoverlapping(bytes.as_ptr(), len);
                }
                return PayloadBuf {
                    ptr,
                    len,
                    source: BufSource::Pool,
                    pool: Arc::clone(self),
                };
            }
        }

        // Oversized payload, or the kernel refused the pool a new slab.
        let ptr = if len == 0 {
            NonNull::dangling()
        } else {
            // SAFETY: len > 0, so the layout is non-zero-sized; allocation
            // failure is handled below.
            let raw = unsafe { alloc::alloc(Layout::from_size_align(len, 1).unwrap()) };
            let Some(ptr) = NonNull::new(raw) else {
                alloc::handle_alloc_error(Layout::from_size_align(len, 1).unwrap());
            };
            // SAFETY: raw is a fresh len-byte allocation.
            unsafe {
                ptr.as_ptr().copy_from_nonoverlapping(bytes.as_ptr(), len);
            }
            ptr
        };

        PayloadBuf {
            ptr,
            len,
            source: BufSource::Heap,
            pool: Arc::clone(self),
        }
    }

    /// Releases every slab the pool no longer needs.
    pub fn gc(&self) {
        self.pool.lock().unwrap().gc();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufSource {
    Pool,
    Heap,
}

/// An owned, immutable copy of one command payload.
pub struct PayloadBuf {
    ptr: NonNull<u8>,
    len: usize,
    source: BufSource,
    pool: Arc<PayloadPool>,
}

// SAFETY: The buffer contents are immutable for the PayloadBuf's lifetime
// and uniquely owned; the pool return path in drop is gated by the pool
// mutex. Shared references only ever read the bytes.
unsafe impl Send for PayloadBuf {}
unsafe impl Sync for PayloadBuf {}

impl PayloadBuf {
    /// Returns the payload bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: ptr/len describe a live allocation (or a dangling pointer
        // with len 0, which from_raw_parts permits).
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Returns the payload length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true for an empty payload.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for PayloadBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadBuf")
            .field("len", &self.len)
            .field("source", &self.source)
            .finish()
    }
}

impl Drop for PayloadBuf {
    fn drop(&mut self) {
        match self.source {
            // SAFETY: ptr came from this pool's get() and is not used after
            // this point.
            BufSource::Pool => unsafe {
                self.pool.pool.lock().unwrap().put(self.ptr);
            },
            BufSource::Heap => {
                if self.len > 0 {
                    // SAFETY: ptr came from alloc() with this exact layout.
                    unsafe {
                        alloc::dealloc(
                            self.ptr.as_ptr(),
                            Layout::from_size_align(self.len, 1).unwrap(),
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pooled_copy() {
        let pool = PayloadPool::new(64 * 1024, 128);

        let buf = pool.copy_from(b"hello world");
        assert_eq!(buf.as_bytes(), b"hello world");
        assert_eq!(buf.len(), 11);
        assert_eq!(buf.source, BufSource::Pool);
    }

    #[test]
    fn test_oversized_goes_to_heap() {
        let pool = PayloadPool::new(64 * 1024, 16);

        let big = vec![7u8; 1000];
        let buf = pool.copy_from(&big);
        assert_eq!(buf.as_bytes(), &big[..]);
        assert_eq!(buf.source, BufSource::Heap);
    }

    #[test]
    fn test_empty_payload() {
        let pool = PayloadPool::new(64 * 1024, 16);

        let buf = pool.copy_from(b"");
        assert!(buf.is_empty());
        assert_eq!(buf.as_bytes(), b"");
    }

    #[test]
    fn test_buffers_recycle_through_gc() {
        let pool = PayloadPool::new(64 * 1024, 64);

        let bufs: Vec<_> = (0..10).map(|i| pool.copy_from(&[i as u8; 32])).collect();
        for (i, b) in bufs.iter().enumerate() {
            assert_eq!(b.as_bytes(), &[i as u8; 32]);
        }
        drop(bufs);

        // All buffers returned; gc releases the slab.
        pool.gc();
        assert_eq!(pool.pool.lock().unwrap().nr_slabs(), 0);
    }

    #[test]
    fn test_anchor_bytes() {
        let hash = [0xabu8; SDB_HASH_SIZE];
        let payload = Payload::Anchor(hash);
        assert_eq!(payload.as_bytes(), &hash);
    }
}
