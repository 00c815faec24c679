//! Slab pool allocator.
//!
//! A pool handing out fixed-size objects carved out of page-aligned slabs.
//! Every object is prefixed by a hidden header carrying a back-pointer to its
//! slab and the free-list links, so returning an object is O(1) and `gc()`
//! can unlink a whole slab's objects without scanning the pool.
//!
//! The pool is intentionally single-threaded: callers that share one across
//! threads must gate it with an external lock. Objects never move once handed
//! out, and no preference is given to partially-full slabs on allocation, so
//! some fragmentation is accepted in exchange for a trivial hot path.

use std::mem;
use std::ptr::{self, NonNull};

/// Header at the start of every slab.
#[repr(C)]
struct SlabHeader {
    /// Number of free chunks currently in this slab.
    nr_free: usize,
    /// Next slab in the pool's slab list.
    next_slab: *mut SlabHeader,
}

/// Hidden header preceding every object.
///
/// When the object is free, `prev`/`next` link it into the pool's free list;
/// `slab` always points back at the owning slab.
#[repr(C)]
struct ChunkHeader {
    slab: *mut SlabHeader,
    prev: *mut ChunkHeader,
    next: *mut ChunkHeader,
}

/// A slab pool of fixed-size objects.
pub struct MemPool {
    slab_size: usize,
    obj_size: usize,
    /// Offset of the first chunk inside a slab.
    first_chunk: usize,
    /// Stride from one chunk to the next.
    chunk_size: usize,
    /// Offset from a chunk header to the object it carries.
    obj_offset: usize,
    /// Objects per slab.
    nr_objects: usize,
    /// Singly-linked list of all slabs.
    slabs: *mut SlabHeader,
    /// Doubly-linked list of free chunks across all slabs.
    free_head: *mut ChunkHeader,
}

// SAFETY: The pool owns all of its slabs exclusively; the raw pointers never
// alias another pool. Moving the pool to another thread is sound as long as
// calls stay externally serialized, which is the pool's usage contract.
unsafe impl Send for MemPool {}

impl MemPool {
    /// Creates a pool carving `obj_size`-byte objects (aligned to `align`)
    /// out of `slab_size`-byte slabs.
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a power of two or the slab is too small to
    /// hold at least one object.
    pub fn new(slab_size: usize, obj_size: usize, align: usize) -> Self {
        assert!(align.is_power_of_two(), "align must be a power of two");
        assert!(obj_size > 0, "obj_size must be non-zero");

        let chunk_align = mem::align_of::<ChunkHeader>().max(align);
        let first_chunk = mem::size_of::<SlabHeader>().next_multiple_of(chunk_align);
        let header = mem::size_of::<ChunkHeader>().next_multiple_of(align);
        let chunk_size = (header + obj_size).next_multiple_of(chunk_align);
        let nr_objects = slab_size.saturating_sub(first_chunk) / chunk_size;

        assert!(nr_objects > 0, "slab_size too small for even one object");

        Self {
            slab_size,
            obj_size,
            first_chunk,
            chunk_size,
            obj_offset: header,
            nr_objects,
            slabs: ptr::null_mut(),
            free_head: ptr::null_mut(),
        }
    }

    /// Returns the object size this pool hands out.
    #[inline]
    pub fn obj_size(&self) -> usize {
        self.obj_size
    }

    /// Returns how many objects fit in one slab.
    #[inline]
    pub fn objects_per_slab(&self) -> usize {
        self.nr_objects
    }

    /// Counts the slabs currently held by the pool.
    pub fn nr_slabs(&self) -> usize {
        let mut n = 0;
        let mut slab = self.slabs;
        while !slab.is_null() {
            n += 1;
            // SAFETY: slab came from our own slab list and is live until
            // munmap'ed by gc()/drop, which also unlink it.
            slab = unsafe { (*slab).next_slab };
        }
        n
    }

    /// Gets a free object, growing the pool by one slab when empty.
    ///
    /// Returns `None` only if the kernel refuses to map a new slab.
    pub fn get(&mut self) -> Option<NonNull<u8>> {
        if self.free_head.is_null() {
            self.new_slab()?;
        }

        // SAFETY: free_head is non-null after a successful new_slab() and
        // points at a chunk we own. Unlinking the head and bumping the slab's
        // free count only touches memory inside our own slabs.
        unsafe {
            let chunk = self.free_head;
            self.unlink(chunk);
            (*(*chunk).slab).nr_free -= 1;

            NonNull::new(chunk.cast::<u8>().add(self.obj_offset))
        }
    }

    /// Returns an object previously handed out by [`MemPool::get`].
    ///
    /// # Safety
    ///
    /// `obj` must have come from this pool and must not be used afterwards.
    pub unsafe fn put(&mut self, obj: NonNull<u8>) {
        let chunk = obj.as_ptr().sub(self.obj_offset).cast::<ChunkHeader>();

        self.link_front(chunk);
        (*(*chunk).slab).nr_free += 1;

        // Slabs are never freed here; only gc() releases fully-free slabs.
    }

    /// Releases every slab whose objects are all free.
    pub fn gc(&mut self) {
        let mut prevp: *mut *mut SlabHeader = &mut self.slabs;

        // SAFETY: We walk our own slab list; for a fully-free slab every
        // chunk is on the free list, so unlinking them all before munmap
        // leaves no dangling free-list entry.
        unsafe {
            while !(*prevp).is_null() {
                let slab = *prevp;

                if (*slab).nr_free == self.nr_objects {
                    let mut chunk = slab.cast::<u8>().add(self.first_chunk);
                    for _ in 0..self.nr_objects {
                        self.unlink(chunk.cast::<ChunkHeader>());
                        chunk = chunk.add(self.chunk_size);
                    }

                    *prevp = (*slab).next_slab;
                    self.unmap_slab(slab);
                } else {
                    prevp = &mut (*slab).next_slab;
                }
            }
        }
    }

    /// Maps a fresh slab and pushes all of its chunks onto the free list.
    fn new_slab(&mut self) -> Option<()> {
        // SAFETY: An anonymous private mapping of slab_size bytes; checked
        // for MAP_FAILED before use. mmap returns page-aligned memory, which
        // satisfies every alignment this pool can be configured with.
        unsafe {
            let mem = libc::mmap(
                ptr::null_mut(),
                self.slab_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if mem == libc::MAP_FAILED {
                return None;
            }

            let slab = mem.cast::<SlabHeader>();
            (*slab).nr_free = self.nr_objects;
            (*slab).next_slab = self.slabs;
            self.slabs = slab;

            let mut chunk = mem.cast::<u8>().add(self.first_chunk);
            for _ in 0..self.nr_objects {
                let c = chunk.cast::<ChunkHeader>();
                (*c).slab = slab;
                self.link_front(c);
                chunk = chunk.add(self.chunk_size);
            }
        }

        Some(())
    }

    /// # Safety: `chunk` must point into one of this pool's slabs.
    unsafe fn link_front(&mut self, chunk: *mut ChunkHeader) {
        (*chunk).prev = ptr::null_mut();
        (*chunk).next = self.free_head;
        if !self.free_head.is_null() {
            (*self.free_head).prev = chunk;
        }
        self.free_head = chunk;
    }

    /// # Safety: `chunk` must currently be linked into the free list.
    unsafe fn unlink(&mut self, chunk: *mut ChunkHeader) {
        if (*chunk).prev.is_null() {
            self.free_head = (*chunk).next;
        } else {
            (*(*chunk).prev).next = (*chunk).next;
        }
        if !(*chunk).next.is_null() {
            (*(*chunk).next).prev = (*chunk).prev;
        }
    }

    /// # Safety: `slab` must be an unlinked slab of this pool.
    unsafe fn unmap_slab(&mut self, slab: *mut SlabHeader) {
        let _ = libc::munmap(slab.cast::<libc::c_void>(), self.slab_size);
    }
}

impl Drop for MemPool {
    fn drop(&mut self) {
        // SAFETY: Dropping releases every slab wholesale. Like the gc path,
        // this assumes the caller is done with all objects; outstanding
        // pointers into the slabs become dangling, which is why put() and
        // the pool's lifetime are the caller's contract.
        unsafe {
            let mut slab = self.slabs;
            while !slab.is_null() {
                let next = (*slab).next_slab;
                self.unmap_slab(slab);
                slab = next;
            }
        }
        self.slabs = ptr::null_mut();
        self.free_head = ptr::null_mut();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SLAB: usize = 64 * 1024;

    #[test]
    fn test_get_put_roundtrip() {
        let mut pool = MemPool::new(SLAB, 64, 8);
        let per_slab = pool.objects_per_slab();
        assert!(per_slab > 0);

        // Drain more than one slab's worth.
        let n = per_slab + per_slab / 2;
        let mut objs = Vec::with_capacity(n);
        for i in 0..n {
            let p = pool.get().expect("mmap slab");
            // Stamp the object; overlapping chunks would corrupt a stamp.
            unsafe { p.as_ptr().cast::<u64>().write(i as u64) };
            objs.push(p);
        }
        assert_eq!(pool.nr_slabs(), 2);

        for (i, p) in objs.iter().enumerate() {
            let v = unsafe { p.as_ptr().cast::<u64>().read() };
            assert_eq!(v, i as u64);
        }

        for p in objs {
            unsafe { pool.put(p) };
        }

        // Everything returned: gc releases every slab, drop is then a no-op.
        pool.gc();
        assert_eq!(pool.nr_slabs(), 0);
    }

    #[test]
    fn test_gc_keeps_partial_slabs() {
        let mut pool = MemPool::new(SLAB, 32, 8);

        let keep = pool.get().expect("mmap slab");
        let spare = pool.get().expect("second object");
        unsafe { pool.put(spare) };

        pool.gc();
        assert_eq!(pool.nr_slabs(), 1, "slab with a live object must survive gc");

        unsafe { pool.put(keep) };
        pool.gc();
        assert_eq!(pool.nr_slabs(), 0);
    }

    #[test]
    fn test_objects_do_not_move() {
        let mut pool = MemPool::new(SLAB, 128, 16);

        let a = pool.get().expect("mmap slab");
        let addr = a.as_ptr() as usize;
        unsafe { a.as_ptr().write_bytes(0xa5, 128) };

        // Churn the free list around the live object.
        for _ in 0..64 {
            let b = pool.get().expect("object");
            unsafe { pool.put(b) };
        }

        assert_eq!(a.as_ptr() as usize, addr);
        for i in 0..128 {
            assert_eq!(unsafe { a.as_ptr().add(i).read() }, 0xa5);
        }

        unsafe { pool.put(a) };
    }

    #[test]
    fn test_alignment() {
        let mut pool = MemPool::new(SLAB, 48, 16);

        for _ in 0..16 {
            let p = pool.get().expect("object");
            assert_eq!(p.as_ptr() as usize % 16, 0);
        }
    }
}
