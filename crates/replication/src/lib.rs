//! Replication controller.
//!
//! Streams a totally-ordered, at-least-once command log from an origin node
//! to its replicas, anchored to periodic snapshot (SDB) checkpoints. The log
//! lives in a bounded in-memory ring ([`replring`]); back-pressure from a
//! slow replica surfaces as eviction, never as a stalled producer.
//!
//! A node starts in mode `NONE` and moves exactly once, either to `ORIGIN`
//! (first `REPLICASYNC` from a client) or to `REPLICA` (`REPLICAOF`). The
//! origin side maintains the ring, a table of up to 32 replica slots each
//! driven by its own worker thread, and the latest snapshot anchor that new
//! replicas start from.
//!
//! Hosts plug in through two small traits: [`ReplicaStream`] carries the
//! ordered replication frames to one replica, [`ControlResponse`] carries
//! RPC replies and opens streams.

pub mod commands;
mod error;
pub mod frame;
mod origin;
mod payload;
mod replica;
mod state;
mod stream;

pub use error::ReplicationError;
pub use frame::Frame;
pub use origin::{Origin, SdbAnchor};
pub use payload::{Payload, PayloadBuf, PayloadPool, SDB_HASH_SIZE};
pub use state::{Mode, Replication, ReplicationInfo};
pub use stream::{ControlResponse, ReplicaStream, StreamError, WireStream};

use std::sync::OnceLock;

/// Maximum number of concurrently registered replicas.
pub const MAX_REPLICAS: usize = replring::MAX_READERS;

/// Command id of snapshot anchor frames. Reserved: no replicated command may
/// use it.
pub const SDB_MARKER: i8 = -1;

static REPLICATION: OnceLock<Replication> = OnceLock::new();

/// Returns the process-wide replication state.
///
/// Created lazily on first use; the mode machine inside starts at
/// [`Mode::None`] and is set once for the lifetime of the process.
pub fn replication() -> &'static Replication {
    REPLICATION.get_or_init(Replication::new)
}
