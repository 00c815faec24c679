//! Replica slots and the per-replica reader worker.

use crate::origin::SdbAnchor;
use crate::payload::Payload;
use crate::stream::ReplicaStream;
use crate::{MAX_REPLICAS, SDB_MARKER};
use replring::{ReaderState, Ring};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use sysutil::{Bitmap, TrxLabel, TrxState};
use tracing::{debug, error, info};

/// Where a freshly registered replica starts reading.
#[derive(Debug, Clone, Copy)]
pub(crate) enum StartPoint {
    /// Stream the anchor frame itself, then everything after it in the ring.
    Anchor(SdbAnchor),
    /// No snapshot exists yet; stream everything from registration onward.
    Tail,
}

/// One replica slot.
#[derive(Debug, Default)]
struct ReplicaSlot {
    /// Marker for the controller's eviction bookkeeping traversals.
    label: TrxLabel,
    /// The worker's join handle, kept for stop(). A finished worker's handle
    /// may linger here until the slot is reused.
    worker: Option<JoinHandle<()>>,
}

/// The table of replica slots.
///
/// Slot ids double as reader ids in every ring mask. Allocation is a
/// first-free scan over the membership bitmap; the worker releases its own
/// slot on exit, so a slot is free again only once its reader is fully
/// unwound from the ring.
pub(crate) struct ReplicaTable {
    in_use: Bitmap,
    slots: Vec<ReplicaSlot>,
    /// Traversal state for eviction bookkeeping.
    pub(crate) trx: TrxState,
}

impl ReplicaTable {
    pub(crate) fn new() -> Self {
        Self {
            in_use: Bitmap::new(MAX_REPLICAS),
            slots: (0..MAX_REPLICAS).map(|_| ReplicaSlot::default()).collect(),
            trx: TrxState::new(),
        }
    }

    /// Allocates the first free slot, if any.
    pub(crate) fn allocate(&mut self) -> Option<u32> {
        for id in 0..MAX_REPLICAS {
            if !self.in_use.get(id).unwrap_or(true) {
                let _ = self.in_use.set(id);
                return Some(id as u32);
            }
        }

        None
    }

    /// Releases a slot. Idempotent.
    pub(crate) fn release(&mut self, id: u32) {
        let _ = self.in_use.clear(id as usize);
    }

    pub(crate) fn is_active(&self, id: u32) -> bool {
        self.in_use.get(id as usize).unwrap_or(false)
    }

    /// Number of slots currently in use.
    pub(crate) fn active_count(&self) -> u64 {
        self.in_use.popcount()
    }

    pub(crate) fn store_worker(&mut self, id: u32, handle: JoinHandle<()>) {
        self.slots[id as usize].worker = Some(handle);
    }

    /// Takes every stored worker handle, for joining at shutdown.
    pub(crate) fn take_workers(&mut self) -> Vec<JoinHandle<()>> {
        self.slots
            .iter_mut()
            .filter_map(|s| s.worker.take())
            .collect()
    }

    pub(crate) fn label_mut(&mut self, id: u32) -> &mut TrxLabel {
        &mut self.slots[id as usize].label
    }
}

/// Spawns the reader worker for one replica.
pub(crate) fn spawn_worker(
    ring: Arc<Ring<Payload>>,
    table: Arc<Mutex<ReplicaTable>>,
    id: u32,
    start: StartPoint,
    stream: Box<dyn ReplicaStream>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("replica-{id}"))
        .spawn(move || run_worker(&ring, &table, id, start, stream))
}

/// The worker loop: drain the ring into the replica's stream.
///
/// This is the only code that ever reads a record's payload. It touches no
/// ring state beyond its own not-read bits, and it owns its slot's release
/// on every exit path, voluntary or evicted.
fn run_worker(
    ring: &Ring<Payload>,
    table: &Mutex<ReplicaTable>,
    id: u32,
    start: StartPoint,
    mut stream: Box<dyn ReplicaStream>,
) {
    let state = init_cursor(ring, id, start, stream.as_mut());

    let Some(mut state) = state else {
        // No cursor: the anchor rotated out before we could seek, or the
        // anchor frame itself could not be delivered. The replica must
        // reconnect and restart from a fresh snapshot.
        log_exit(stream.as_ref(), id);
        stream.end();
        ring.del_reader(id);
        table.lock().unwrap().release(id);
        return;
    };

    while let Some(rec) = ring.get_next(&mut state) {
        debug!(replica = id, eid = %rec.eid, "sending record");

        if stream
            .send_replication_frame(rec.eid, rec.cmd_id, rec.data.as_bytes())
            .is_err()
        {
            break;
        }
        if stream.flush().is_err() {
            break;
        }

        rec.release();
    }

    log_exit(stream.as_ref(), id);
    stream.end();
    ring.reader_exit(state);
    table.lock().unwrap().release(id);
}

/// Positions the reader and delivers the snapshot anchor frame when there is
/// one.
///
/// The ring treats the starting record as already consumed, so the anchor
/// frame the replica restores from is sent here, outside the ring, from the
/// controller's copy of the latest anchor.
fn init_cursor(
    ring: &Ring<Payload>,
    id: u32,
    start: StartPoint,
    stream: &mut dyn ReplicaStream,
) -> Option<ReaderState> {
    match start {
        StartPoint::Tail => Some(ring.init_reader_at_tail(id)),
        StartPoint::Anchor(anchor) => {
            let state = match ring.init_reader(anchor.eid, id) {
                Ok(state) => state,
                Err(err) => {
                    error!(replica = id, %err, "failed to position replica cursor");
                    return None;
                }
            };

            if stream
                .send_replication_frame(anchor.eid, SDB_MARKER, &anchor.hash)
                .is_err()
                || stream.flush().is_err()
            {
                // The cursor was already registered in the slot masks; undo
                // it the same way a mid-stream failure would.
                ring.reader_exit(state);
                return None;
            }

            Some(state)
        }
    }
}

fn log_exit(stream: &dyn ReplicaStream, id: u32) {
    info!(replica = id, peer = %stream.peer_description(), "replica going offline");
}
