use crate::{Eid, Record, RingConfig};
use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::ops::Deref;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};
use thiserror::Error;

// =============================================================================
// SYNCHRONIZATION PROTOCOL
// =============================================================================
//
// One producer, up to 32 readers. Three pieces of shared state:
//
// - `tail` (slot index of the next insert) lives under the ring mutex. The
//   producer is the only writer; readers take the mutex solely to wait on the
//   condvar for `tail` to move past them.
// - `readers_mask` (ring-level membership) is an atomic word. Bits are added
//   before a reader's worker starts and removed either by the reader on exit
//   or by the producer when it evicts a slow reader.
// - `not_read` (per slot) is an atomic word. Bit i set means reader i has not
//   consumed the slot yet, which also pins the slot's record in place.
//
// ## Publication
//
// The producer writes the record under the mutex and then stores the
// membership snapshot to the slot's `not_read` with Release. A reader only
// dereferences a slot after observing `tail` past it under the same mutex, so
// the record contents are visible; the Release store is what makes the
// hand-off airtight on the lock-free paths below.
//
// ## Consumption and overwrite
//
// A reader finishing with a slot clears its bit with a Release AND-NOT; the
// producer's Acquire load of `not_read` at the head of insert() therefore
// happens-after every read of the record the reader performed. A slot whose
// `not_read` is zero is the producer's to overwrite; a non-zero mask is
// returned to the caller as the set of readers stalling the log, and the
// record is handed back untouched.
//
// ## Why readers never block the producer
//
// insert() does not wait. Back-pressure surfaces as the returned holder mask
// and the caller decides whom to evict; the evicted reader wakes from the
// condvar, finds its membership bit gone and unwinds, clearing its slot bits
// on the way out.
//
// =============================================================================

/// Maximum number of concurrent readers, bounded by the mask width.
pub const MAX_READERS: usize = 32;

/// A bitmask of reader ids.
pub type ReaderMask = u32;

/// Mask covering every possible reader.
pub const READERS_ALL: ReaderMask = ReaderMask::MAX;

/// Error type for ring operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RingError {
    /// The requested starting EID is not resident in the ring.
    #[error("start eid {eid} is not in the ring")]
    StartEidNotFound {
        /// The EID that was looked up.
        eid: Eid,
    },
}

/// Outcome of [`Ring::insert`].
#[derive(Debug)]
pub enum InsertOutcome<T> {
    /// The record was published to every current reader.
    Inserted,
    /// The next slot is still held by the readers in `not_read`; nothing was
    /// written and the record is handed back.
    Blocked {
        /// Readers that have not consumed the slot the producer needs.
        not_read: ReaderMask,
        /// The record that could not be inserted.
        record: Record<T>,
    },
}

/// One slot of the ring.
struct Slot<T> {
    /// Readers that have not consumed this slot yet.
    not_read: AtomicU32,
    /// The slot's record. `None` until the producer first reaches the slot.
    rec: UnsafeCell<Option<Record<T>>>,
}

/// Per-reader cursor, created by [`Ring::init_reader`].
///
/// The state is consumed by [`Ring::reader_exit`], so a reader cannot keep
/// consuming after it has unwound.
#[derive(Debug, PartialEq)]
pub struct ReaderState {
    /// Index of the last slot this reader consumed or skipped.
    index: usize,
    /// The reader's id, also its bit position in every mask.
    reader_id: u32,
}

impl ReaderState {
    /// Returns the reader id this state was initialized with.
    #[inline]
    pub fn reader_id(&self) -> u32 {
        self.reader_id
    }
}

/// Read guard for one record.
///
/// Holding the guard keeps the slot pinned (the reader's `not_read` bit is
/// still set, so the producer refuses to overwrite it). Call
/// [`RecordRef::release`] once the record has been fully processed; dropping
/// the guard without releasing leaves the slot pinned until the reader exits,
/// which is exactly what a reader that failed mid-record wants.
pub struct RecordRef<'a, T> {
    rec: &'a Record<T>,
    not_read: &'a AtomicU32,
    mask: ReaderMask,
}

impl<T> RecordRef<'_, T> {
    /// Marks the record consumed by this reader, allowing the producer to
    /// overwrite the slot once every reader has done the same.
    pub fn release(self) {
        // Release so the payload reads above happen-before the producer's
        // overwrite of this slot.
        self.not_read.fetch_and(!self.mask, Ordering::Release);
    }
}

impl<T> Deref for RecordRef<'_, T> {
    type Target = Record<T>;

    fn deref(&self) -> &Record<T> {
        self.rec
    }
}

/// Single-producer multi-consumer ring buffer of replication records.
pub struct Ring<T> {
    /// The slots. Fixed at construction.
    slots: Box<[Slot<T>]>,
    /// Membership mask of active readers.
    readers_mask: CachePadded<AtomicU32>,
    /// Index of the slot the next insert writes. Readers wait on `cond` for
    /// it to advance.
    tail: Mutex<usize>,
    cond: Condvar,
}

// SAFETY: Slots are shared across the producer and reader threads. All
// mutable access to a slot's record goes through the protocol above: the
// producer writes only slots whose not_read is zero (no reader will touch
// them) while holding the tail mutex, and readers only dereference slots
// pinned by their own not_read bit. T: Sync because multiple readers may
// hold references to the same record concurrently.
unsafe impl<T: Send + Sync> Send for Ring<T> {}
unsafe impl<T: Send + Sync> Sync for Ring<T> {}

impl<T> Ring<T> {
    /// Creates an empty ring with the capacity from `config`.
    pub fn new(config: RingConfig) -> Self {
        let slots = (0..config.capacity)
            .map(|_| Slot {
                not_read: AtomicU32::new(0),
                rec: UnsafeCell::new(None),
            })
            .collect();

        Self {
            slots,
            readers_mask: CachePadded::new(AtomicU32::new(0)),
            tail: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    /// Returns the ring capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Returns the current reader membership mask.
    #[inline]
    pub fn readers_mask(&self) -> ReaderMask {
        self.readers_mask.load(Ordering::Acquire)
    }

    #[inline]
    fn is_member(&self, mask: ReaderMask) -> bool {
        self.readers_mask() & mask != 0
    }

    // ---------------------------------------------------------------------
    // READER MEMBERSHIP
    // ---------------------------------------------------------------------

    /// Adds a reader to the membership mask.
    ///
    /// Must be called before the reader's worker is started, so every insert
    /// from that point on is marked unread for the new reader.
    ///
    /// # Panics
    ///
    /// Panics if `reader_id` is not below [`MAX_READERS`].
    pub fn add_reader(&self, reader_id: u32) {
        assert!((reader_id as usize) < MAX_READERS);

        self.readers_mask.fetch_or(1 << reader_id, Ordering::SeqCst);
    }

    /// Removes every reader in `readers` from the membership mask.
    ///
    /// Readers waiting in [`Ring::get_next`] are woken so they can observe
    /// the removal and unwind.
    pub fn del_readers_mask(&self, readers: ReaderMask) {
        let prev;
        {
            // Taking the lock orders the removal against a concurrent
            // insert's membership snapshot and against waiters entering the
            // condvar.
            let _tail = self.tail.lock().unwrap();
            prev = self.readers_mask.fetch_and(!readers, Ordering::SeqCst);
        }

        if prev & readers != 0 {
            self.cond.notify_all();
        }
    }

    /// Removes a single reader from the membership mask.
    pub fn del_reader(&self, reader_id: u32) {
        self.del_readers_mask(1 << reader_id);
    }

    // ---------------------------------------------------------------------
    // READER API
    // ---------------------------------------------------------------------

    /// Initializes a reader cursor positioned at the record `start_eid`.
    ///
    /// The record with `start_eid` is treated as already consumed by this
    /// reader; every record physically after it is marked unread so the
    /// reader observes everything strictly newer. Fails if `start_eid` is no
    /// longer (or not yet) resident.
    pub fn init_reader(&self, start_eid: Eid, reader_id: u32) -> Result<ReaderState, RingError> {
        assert!((reader_id as usize) < MAX_READERS);

        let mask: ReaderMask = 1 << reader_id;
        let mut found = None;

        let tail = self.tail.lock().unwrap();

        // Scan in physical order starting from the oldest possible slot.
        let mut j = *tail;
        for _ in 0..self.capacity() {
            let slot = &self.slots[j];
            // SAFETY: The tail lock blocks the producer, so no slot is
            // concurrently written.
            let rec = unsafe { (*slot.rec.get()).as_ref() };

            match rec {
                Some(r) if r.eid == start_eid => {
                    slot.not_read.fetch_and(!mask, Ordering::AcqRel);
                    found = Some(j);
                }
                Some(_) if found.is_some() => {
                    slot.not_read.fetch_or(mask, Ordering::AcqRel);
                }
                _ => {}
            }

            j = (j + 1) % self.capacity();
        }

        drop(tail);

        match found {
            Some(index) => Ok(ReaderState { index, reader_id }),
            None => Err(RingError::StartEidNotFound { eid: start_eid }),
        }
    }

    /// Initializes a reader cursor positioned at the producer's tail.
    ///
    /// The reader observes nothing already in the ring; every record inserted
    /// after its membership bit was added is delivered. This is the join mode
    /// for a reader that has no starting record to anchor on yet.
    pub fn init_reader_at_tail(&self, reader_id: u32) -> ReaderState {
        assert!((reader_id as usize) < MAX_READERS);

        let mask: ReaderMask = 1 << reader_id;
        let tail = self.tail.lock().unwrap();

        // Inserts that raced between add_reader() and this call marked slots
        // unread for us even though the cursor starts past them; unpin them
        // so the producer never waits on a slot this reader will skip.
        for slot in self.slots.iter() {
            slot.not_read.fetch_and(!mask, Ordering::AcqRel);
        }

        let index = (*tail + self.capacity() - 1) % self.capacity();

        ReaderState { index, reader_id }
    }

    /// Waits for and returns the next record after the reader's cursor.
    ///
    /// Blocks while the reader is caught up with the producer. Returns `None`
    /// when the reader is no longer a member of the ring (evicted, or removed
    /// during shutdown); the reader must then unwind via
    /// [`Ring::reader_exit`].
    pub fn get_next(&self, state: &mut ReaderState) -> Option<RecordRef<'_, T>> {
        let mask: ReaderMask = 1 << state.reader_id;
        let next = (state.index + 1) % self.capacity();

        let mut tail = self.tail.lock().unwrap();
        while next == *tail && self.is_member(mask) {
            tail = self.cond.wait(tail).unwrap();
        }
        drop(tail);

        if !self.is_member(mask) {
            return None;
        }

        let slot = &self.slots[next];
        state.index = next;

        // SAFETY: `next` is behind the tail we observed under the lock, so
        // the producer has fully written it, and this reader's bit in the
        // slot's not_read (set at publication) keeps the producer from
        // overwriting it until release() or reader exit.
        let rec = unsafe { (*slot.rec.get()).as_ref() }?;

        Some(RecordRef {
            rec,
            not_read: &slot.not_read,
            mask,
        })
    }

    /// Unwinds an exiting reader.
    ///
    /// Removes the reader from the membership mask and clears its bit from
    /// every slot so the producer is never left waiting on a reader that is
    /// gone. Consuming the state makes a second exit impossible; the
    /// underlying mask operations are idempotent regardless.
    pub fn reader_exit(&self, state: ReaderState) {
        let mask: ReaderMask = 1 << state.reader_id;

        self.del_readers_mask(mask);

        for slot in self.slots.iter() {
            // Release for the same reason as RecordRef::release: reads of
            // any still-pinned record must complete before the producer can
            // recycle the slot.
            slot.not_read.fetch_and(!mask, Ordering::Release);
        }
    }

    // ---------------------------------------------------------------------
    // PRODUCER API
    // ---------------------------------------------------------------------

    /// Inserts a record at the tail.
    ///
    /// Never waits for readers. If the tail slot is still unread the insert
    /// is refused and [`InsertOutcome::Blocked`] names the holders; the
    /// caller is expected to evict them with [`Ring::del_readers_mask`] and
    /// retry. The record displaced from the slot is dropped outside the lock.
    pub fn insert(&self, record: Record<T>) -> InsertOutcome<T> {
        let old;
        {
            let mut tail = self.tail.lock().unwrap();
            let slot = &self.slots[*tail];

            // Acquire pairs with the Release clears in release()/reader_exit
            // so the displaced record is no longer referenced anywhere.
            let not_read = slot.not_read.load(Ordering::Acquire);
            if not_read != 0 {
                return InsertOutcome::Blocked { not_read, record };
            }

            // SAFETY: not_read == 0 means no reader holds the slot, and the
            // tail lock serializes producers, so the cell is exclusively
            // ours.
            old = unsafe { (*slot.rec.get()).replace(record) };

            // Publication point: every current member sees the slot unread.
            let members = self.readers_mask.load(Ordering::Acquire);
            slot.not_read.store(members, Ordering::Release);

            *tail = (*tail + 1) % self.capacity();
        }

        self.cond.notify_all();

        // The displaced record's drop may be arbitrarily expensive (payload
        // deallocation), so it runs after the lock and the wakeup.
        drop(old);

        InsertOutcome::Inserted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn rec(eid: u64, cmd_id: i8, data: &str) -> Record<String> {
        Record {
            eid: Eid::command(eid),
            cmd_id,
            data: data.to_string(),
        }
    }

    fn insert_ok(ring: &Ring<String>, r: Record<String>) {
        assert!(matches!(ring.insert(r), InsertOutcome::Inserted));
    }

    #[test]
    fn test_single_reader_sees_inserts_in_order() {
        let ring = Ring::new(RingConfig::new(4));

        ring.add_reader(0);
        insert_ok(&ring, rec(1, 1, "a"));
        let mut state = ring.init_reader(Eid::command(1), 0).unwrap();

        insert_ok(&ring, rec(2, 1, "b"));
        insert_ok(&ring, rec(3, 2, "c"));

        let r = ring.get_next(&mut state).unwrap();
        assert_eq!(r.eid, Eid::command(2));
        assert_eq!(r.data, "b");
        r.release();

        let r = ring.get_next(&mut state).unwrap();
        assert_eq!(r.eid, Eid::command(3));
        assert_eq!(r.cmd_id, 2);
        r.release();
    }

    #[test]
    fn test_seek_unknown_eid_fails() {
        let ring: Ring<String> = Ring::new(RingConfig::new(4));

        ring.add_reader(0);
        insert_ok(&ring, rec(1, 1, "a"));

        assert_eq!(
            ring.init_reader(Eid::command(99), 0),
            Err(RingError::StartEidNotFound {
                eid: Eid::command(99)
            })
        );
    }

    #[test]
    fn test_insert_refuses_held_slot() {
        let ring = Ring::new(RingConfig::new(2));

        ring.add_reader(3);
        insert_ok(&ring, rec(1, 1, "a"));
        let mut state = ring.init_reader(Eid::command(1), 3).unwrap();

        insert_ok(&ring, rec(2, 1, "b")); // slot 1, unread by reader 3

        // Slot 0 is the reader's start position, already consumed, so the
        // producer may still overwrite it.
        insert_ok(&ring, rec(3, 1, "c"));

        // Tail is back on slot 1 (eid 2), still pinned by reader 3.
        match ring.insert(rec(4, 1, "d")) {
            InsertOutcome::Blocked { not_read, record } => {
                assert_eq!(not_read, 1 << 3);
                assert_eq!(record.eid, Eid::command(4));
            }
            InsertOutcome::Inserted => panic!("insert must refuse a held slot"),
        }

        // Eviction unblocks the slot only after the reader's bits are gone.
        ring.del_reader(3);
        assert!(ring.get_next(&mut state).is_none());
        ring.reader_exit(state);

        insert_ok(&ring, rec(4, 1, "d"));
    }

    #[test]
    fn test_release_allows_overwrite() {
        let ring = Ring::new(RingConfig::new(2));

        ring.add_reader(0);
        insert_ok(&ring, rec(1, 1, "a"));
        let mut state = ring.init_reader(Eid::command(1), 0).unwrap();

        insert_ok(&ring, rec(2, 1, "b"));
        let r = ring.get_next(&mut state).unwrap();
        r.release();

        // Both slots are consumed; the producer can lap the whole ring.
        insert_ok(&ring, rec(3, 1, "c"));
        insert_ok(&ring, rec(4, 1, "d"));
    }

    #[test]
    fn test_del_readers_mask_wakes_waiter() {
        let ring: Arc<Ring<String>> = Arc::new(Ring::new(RingConfig::new(4)));

        ring.add_reader(0);
        insert_ok(&ring, rec(1, 1, "a"));

        let r = Arc::clone(&ring);
        let reader = thread::spawn(move || {
            let mut state = r.init_reader(Eid::command(1), 0).unwrap();
            // Caught up: blocks until membership is revoked.
            let next = r.get_next(&mut state);
            assert!(next.is_none());
            r.reader_exit(state);
        });

        thread::sleep(Duration::from_millis(50));
        ring.del_readers_mask(1 << 0);
        reader.join().unwrap();

        assert_eq!(ring.readers_mask(), 0);
    }

    #[test]
    fn test_two_readers_same_physical_order() {
        let ring: Arc<Ring<String>> = Arc::new(Ring::new(RingConfig::new(8)));
        const COUNT: u64 = 64;

        ring.add_reader(0);
        ring.add_reader(1);
        insert_ok(&ring, rec(1, 1, "start"));

        let spawn_reader = |id: u32| {
            let r = Arc::clone(&ring);
            thread::spawn(move || {
                let mut seen = Vec::new();
                let mut state = r.init_reader(Eid::command(1), id).unwrap();
                while let Some(e) = r.get_next(&mut state) {
                    seen.push(e.eid);
                    e.release();
                    if seen.len() as u64 == COUNT - 1 {
                        break;
                    }
                }
                r.reader_exit(state);
                seen
            })
        };

        let r0 = spawn_reader(0);
        let r1 = spawn_reader(1);

        // Give the readers a moment to seek before the producer laps slot 0.
        thread::sleep(Duration::from_millis(20));

        for eid in 2..=COUNT {
            let mut record = rec(eid, 1, "x");
            loop {
                match ring.insert(record) {
                    InsertOutcome::Inserted => break,
                    InsertOutcome::Blocked { record: r, .. } => {
                        record = r;
                        thread::yield_now();
                    }
                }
            }
        }

        let seen0 = r0.join().unwrap();
        let seen1 = r1.join().unwrap();
        let expect: Vec<Eid> = (2..=COUNT).map(Eid::command).collect();
        assert_eq!(seen0, expect);
        assert_eq!(seen1, expect);
    }

    #[test]
    fn test_reader_exit_clears_slot_bits() {
        let ring = Ring::new(RingConfig::new(4));

        ring.add_reader(0);
        insert_ok(&ring, rec(1, 1, "a"));
        let state = ring.init_reader(Eid::command(1), 0).unwrap();

        insert_ok(&ring, rec(2, 1, "b"));
        insert_ok(&ring, rec(3, 1, "c"));

        ring.reader_exit(state);

        // With the bits cleared the producer can lap the ring freely.
        for eid in 4..=9 {
            insert_ok(&ring, rec(eid, 1, "z"));
        }
    }

    #[test]
    fn test_drop_releases_records() {
        use std::sync::atomic::AtomicUsize;

        static DROPS: AtomicUsize = AtomicUsize::new(0);

        struct Tracked;
        impl Drop for Tracked {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        DROPS.store(0, Ordering::SeqCst);
        {
            let ring: Ring<Tracked> = Ring::new(RingConfig::new(4));
            for eid in 1..=6 {
                // 6 inserts into 4 slots: 2 drop on overwrite, 4 with the ring.
                assert!(matches!(
                    ring.insert(Record {
                        eid: Eid::command(eid),
                        cmd_id: 0,
                        data: Tracked,
                    }),
                    InsertOutcome::Inserted
                ));
            }
            assert_eq!(DROPS.load(Ordering::SeqCst), 2);
        }
        assert_eq!(DROPS.load(Ordering::SeqCst), 6);
    }
}
