//! Shared server primitives.
//!
//! Small, self-contained building blocks used across the server:
//!
//! - [`Bitmap`] — a flexible bitmap of arbitrary width backed by 128-bit lanes
//! - [`MemPool`] — a slab allocator handing out fixed-size objects
//! - [`trx`] — reentrant traversal markers ("transaction colors")
//! - [`sdb_name`] — snapshot dump filename generation

pub mod bitmap;
pub mod mempool;
pub mod sdb_name;
pub mod trx;

pub use bitmap::{Bitmap, BitmapError};
pub use mempool::MemPool;
pub use sdb_name::{sdb_name, SDB_NAME_MIN_BUF_SIZE};
pub use trx::{Trx, TrxLabel, TrxState};
