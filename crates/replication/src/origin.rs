//! Origin-side replication state: the ring, the replica table, snapshot
//! anchoring and the insert drain loop.

use crate::payload::{Payload, PayloadPool, SDB_HASH_SIZE};
use crate::replica::{spawn_worker, ReplicaTable, StartPoint};
use crate::stream::ReplicaStream;
use crate::{ReplicationError, MAX_REPLICAS, SDB_MARKER};
use replring::{Backoff, Eid, InsertOutcome, ReaderMask, Record, Ring, RingConfig, READERS_ALL};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use sysutil::{sdb_name, Trx};
use tracing::{error, info, warn};

/// The latest snapshot anchor: content hash plus the anchor EID under which
/// it was published to the ring.
#[derive(Debug, Clone, Copy)]
pub struct SdbAnchor {
    /// Content hash of the dump.
    pub hash: [u8; SDB_HASH_SIZE],
    /// Anchor EID (MSB set).
    pub eid: Eid,
}

/// Origin-side replication state.
///
/// Owns the command log ring and the replica table. `replicate` and
/// `new_sdb` are producer-side operations and expect a single caller thread
/// (the command dispatch); registration and shutdown may come from anywhere.
pub struct Origin {
    ring: Arc<Ring<Payload>>,
    replicas: Arc<Mutex<ReplicaTable>>,
    pool: Arc<PayloadPool>,
    /// Sequence of the last command EID issued.
    cmd_eid: AtomicU64,
    /// Sequence of the last anchor EID issued.
    sdb_seq: AtomicU64,
    last_sdb: Mutex<Option<SdbAnchor>>,
    stopping: AtomicBool,
}

impl std::fmt::Debug for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Origin").finish_non_exhaustive()
    }
}

impl Origin {
    /// Creates an origin with the default ring capacity and payload pool.
    pub fn new() -> Self {
        Self::with_config(RingConfig::default())
    }

    /// Creates an origin with a specific ring configuration.
    pub fn with_config(config: RingConfig) -> Self {
        Self {
            ring: Arc::new(Ring::new(config)),
            replicas: Arc::new(Mutex::new(ReplicaTable::new())),
            pool: PayloadPool::with_defaults(),
            cmd_eid: AtomicU64::new(0),
            sdb_seq: AtomicU64::new(0),
            last_sdb: Mutex::new(None),
            stopping: AtomicBool::new(false),
        }
    }

    /// Publishes a fresh snapshot to the log.
    ///
    /// Issues a new anchor EID (monotonic within the process, MSB set),
    /// remembers `(hash, eid)` as the starting point for future replicas and
    /// inserts the anchor record so currently streaming replicas observe the
    /// checkpoint in order.
    pub fn new_sdb(&self, hash: &[u8; SDB_HASH_SIZE]) {
        if self.stopping.load(Ordering::Acquire) {
            return;
        }

        let seq = self.sdb_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let eid = Eid::anchor(seq);

        *self.last_sdb.lock().unwrap() = Some(SdbAnchor { hash: *hash, eid });
        info!(file = %sdb_name(None, seq), %eid, "new snapshot anchor");

        self.insert_with_drain(Record {
            eid,
            cmd_id: SDB_MARKER,
            data: Payload::Anchor(*hash),
        });
    }

    /// Appends a command to the replication log.
    pub fn replicate(&self, cmd_id: i8, buf: &[u8]) {
        if self.stopping.load(Ordering::Acquire) {
            return;
        }

        let eid = Eid::command(self.cmd_eid.fetch_add(1, Ordering::Relaxed) + 1);
        let data = Payload::Command(self.pool.copy_from(buf));

        self.insert_with_drain(Record { eid, cmd_id, data });
    }

    /// Inserts a record, evicting whoever stalls the log.
    ///
    /// A refused insert names the slow readers; they are dropped from the
    /// ring and the insert retried until the evicted workers have unwound
    /// their slot pins. The producer never waits on reader progress in any
    /// other way.
    fn insert_with_drain(&self, mut record: Record<Payload>) {
        let mut backoff = Backoff::new();
        let mut drain: Option<Trx> = None;

        loop {
            match self.ring.insert(record) {
                InsertOutcome::Inserted => break,
                InsertOutcome::Blocked { not_read, record: r } => {
                    record = r;
                    self.ring.del_readers_mask(not_read);
                    self.note_evicted(not_read, &mut drain);
                    backoff.snooze();
                }
            }
        }

        if let Some(trx) = drain {
            self.replicas.lock().unwrap().trx.end(trx);
        }
    }

    /// Reconciles eviction bookkeeping for the replicas in `mask`.
    ///
    /// One traversal spans a whole drain episode, so a replica whose pin
    /// keeps the insert blocked across several retries is visited (and
    /// logged) exactly once.
    fn note_evicted(&self, mask: ReaderMask, drain: &mut Option<Trx>) {
        let mut table = self.replicas.lock().unwrap();

        let trx = match *drain {
            Some(trx) => trx,
            None => {
                let Some(trx) = table.trx.begin() else {
                    // All traversal colors in flight; bookkeeping is
                    // best-effort and the eviction itself already happened.
                    return;
                };
                *drain = Some(trx);
                trx
            }
        };

        for id in 0..MAX_REPLICAS as u32 {
            if mask & (1 << id) != 0 && table.is_active(id) && trx.visit(table.label_mut(id)) {
                warn!(replica = id, "evicting replica too slow to keep up with the log");
            }
        }
    }

    /// Registers a new replica and starts its stream.
    ///
    /// The replica starts from the latest snapshot anchor; with no snapshot
    /// taken yet it streams from the point of registration onward. Returns
    /// the replica id.
    pub fn register_replica(
        &self,
        stream: Box<dyn ReplicaStream>,
    ) -> Result<u32, ReplicationError> {
        let start = match *self.last_sdb.lock().unwrap() {
            Some(anchor) => StartPoint::Anchor(anchor),
            None => StartPoint::Tail,
        };

        let mut table = self.replicas.lock().unwrap();
        let id = table.allocate().ok_or(ReplicationError::NoBuffers)?;

        self.ring.add_reader(id);

        match spawn_worker(
            Arc::clone(&self.ring),
            Arc::clone(&self.replicas),
            id,
            start,
            stream,
        ) {
            Ok(handle) => {
                table.store_worker(id, handle);
                info!(replica = id, "replica registered");
                Ok(id)
            }
            Err(err) => {
                error!(replica = id, %err, "failed to spawn replica worker");
                self.ring.del_reader(id);
                table.release(id);
                Err(ReplicationError::NoBuffers)
            }
        }
    }

    /// Stops all replica streams and joins their workers.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.ring.del_readers_mask(READERS_ALL);

        let workers = self.replicas.lock().unwrap().take_workers();
        for worker in workers {
            let _ = worker.join();
        }
    }

    /// Returns the latest snapshot anchor, if any.
    pub fn last_sdb(&self) -> Option<SdbAnchor> {
        *self.last_sdb.lock().unwrap()
    }

    /// Returns the EID sequence of the last replicated command.
    pub fn last_cmd_eid(&self) -> u64 {
        self.cmd_eid.load(Ordering::Acquire)
    }

    /// Returns the number of replica slots in use.
    pub fn active_replicas(&self) -> u64 {
        self.replicas.lock().unwrap().active_count()
    }
}

impl Default for Origin {
    fn default() -> Self {
        Self::new()
    }
}
