//! SPMC replication log ring buffer.
//!
//! A bounded ring of ordered records written by a single producer and read
//! concurrently by up to 32 independent readers. Each slot carries an atomic
//! bitmask of the readers that have not yet consumed it; the producer never
//! waits for readers — when it catches up with a slot that is still held, it
//! reports the holders so the caller can evict them and retry.
//!
//! # Example
//!
//! ```
//! use replring::{Eid, InsertOutcome, Record, Ring, RingConfig};
//!
//! let ring: Ring<Vec<u8>> = Ring::new(RingConfig::new(8));
//!
//! // A reader joins before any record it needs to observe is written.
//! ring.add_reader(0);
//! let outcome = ring.insert(Record {
//!     eid: Eid::command(1),
//!     cmd_id: 1,
//!     data: b"x".to_vec(),
//! });
//! assert!(matches!(outcome, InsertOutcome::Inserted));
//!
//! let _state = ring.init_reader(Eid::command(1), 0).unwrap();
//! // eid 1 is the reader's starting point, so there is nothing to read until
//! // the producer inserts eid 2.
//! ```

mod backoff;
mod config;
mod eid;
mod record;
mod ring;

pub use backoff::Backoff;
pub use config::{RingConfig, DEFAULT_RING_CAPACITY};
pub use eid::Eid;
pub use record::Record;
pub use ring::{
    InsertOutcome, ReaderState, RecordRef, Ring, RingError, ReaderMask, MAX_READERS,
    READERS_ALL,
};
