//! Node-level replication mode machine.

use crate::origin::Origin;
use crate::ReplicationError;
use replring::RingConfig;
use std::fmt;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock};
use tracing::info;

/// Replication mode of this node. Set once for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Mode {
    /// Not participating in replication.
    None = 0,
    /// Serving the replication log to replicas.
    Origin = 1,
    /// Following an origin.
    Replica = 2,
}

impl Mode {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Mode::Origin,
            2 => Mode::Replica,
            _ => Mode::None,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::None => "NONE",
            Mode::Origin => "ORIGIN",
            Mode::Replica => "REPLICA",
        })
    }
}

/// Read-only snapshot of the replication state, as reported to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationInfo {
    /// Current mode.
    pub mode: Mode,
    /// Hex of the latest snapshot hash; empty when no snapshot exists.
    pub last_sdb_hash_hex: String,
    /// EID sequence of the last replicated command.
    pub last_eid: u64,
}

/// The node-level replication state machine.
///
/// `new_sdb`, `replicate` and `stop` can be called in any mode; outside
/// `ORIGIN` they are no-ops, so command handlers never need to check the
/// mode themselves. The two transitions (`become_origin`, `become_replica`)
/// are guarded by a mutex; once away from `NONE` the mode is final and all
/// reads are lock-free.
pub struct Replication {
    mode: AtomicU8,
    /// Serializes mode transitions and origin construction.
    transition: Mutex<()>,
    origin: OnceLock<Origin>,
    /// Ring configuration the origin is built with on first REPLICASYNC.
    ring_config: RingConfig,
    /// The origin this node follows in `REPLICA` mode. The outbound
    /// connection machinery lives with the host; only the target is kept.
    replica_of: Mutex<Option<(String, u16)>>,
}

impl Replication {
    /// Creates a node in mode `NONE` with the default ring configuration.
    pub fn new() -> Self {
        Self::with_config(RingConfig::default())
    }

    /// Creates a node in mode `NONE`; the origin side, if this node becomes
    /// one, uses `ring_config`.
    pub fn with_config(ring_config: RingConfig) -> Self {
        Self {
            mode: AtomicU8::new(Mode::None as u8),
            transition: Mutex::new(()),
            origin: OnceLock::new(),
            ring_config,
            replica_of: Mutex::new(None),
        }
    }

    /// Returns the current mode.
    #[inline]
    pub fn mode(&self) -> Mode {
        Mode::from_u8(self.mode.load(Ordering::Acquire))
    }

    /// Returns the origin side when this node is an origin.
    pub fn origin(&self) -> Option<&Origin> {
        if self.mode() == Mode::Origin {
            self.origin.get()
        } else {
            None
        }
    }

    /// Moves the node to `ORIGIN` mode, or returns the already-running
    /// origin. Idempotent; fails only from `REPLICA` mode.
    pub fn become_origin(&self) -> Result<&Origin, ReplicationError> {
        if let Some(origin) = self.origin() {
            return Ok(origin);
        }

        let _guard = self.transition.lock().unwrap();

        match self.mode() {
            Mode::Replica => Err(ReplicationError::NotSupported {
                mode: Mode::Replica,
            }),
            _ => {
                let origin = self.origin.get_or_init(|| {
                    info!("entering ORIGIN mode");
                    Origin::with_config(self.ring_config)
                });
                // Publish after the origin exists, so lock-free readers that
                // observe ORIGIN always find it.
                self.mode.store(Mode::Origin as u8, Ordering::Release);
                Ok(origin)
            }
        }
    }

    /// Moves the node to `REPLICA` mode, following `host:port`. Fails from
    /// any mode but `NONE`.
    pub fn become_replica(&self, host: &str, port: u16) -> Result<(), ReplicationError> {
        let _guard = self.transition.lock().unwrap();

        let mode = self.mode();
        if mode != Mode::None {
            return Err(ReplicationError::NotSupported { mode });
        }

        *self.replica_of.lock().unwrap() = Some((host.to_string(), port));
        self.mode.store(Mode::Replica as u8, Ordering::Release);
        info!(host, port, "entering REPLICA mode");

        Ok(())
    }

    /// Returns the origin target set by `become_replica`.
    pub fn replica_of(&self) -> Option<(String, u16)> {
        self.replica_of.lock().unwrap().clone()
    }

    /// Publishes a fresh snapshot. A no-op outside `ORIGIN` mode.
    pub fn new_sdb(&self, hash: &[u8; crate::SDB_HASH_SIZE]) {
        if let Some(origin) = self.origin() {
            origin.new_sdb(hash);
        }
    }

    /// Appends a command to the replication log. A no-op outside `ORIGIN`
    /// mode.
    pub fn replicate(&self, cmd_id: i8, buf: &[u8]) {
        if let Some(origin) = self.origin() {
            origin.replicate(cmd_id, buf);
        }
    }

    /// Shuts replication down. A no-op outside `ORIGIN` mode; the mode
    /// itself does not change.
    pub fn stop(&self) {
        if let Some(origin) = self.origin() {
            origin.stop();
        }
    }

    /// Returns an atomic snapshot of `(mode, last hash, last command EID)`.
    pub fn info(&self) -> ReplicationInfo {
        let mode = self.mode();

        let (last_sdb_hash_hex, last_eid) = match self.origin() {
            Some(origin) => {
                let hex = origin.last_sdb().map_or_else(String::new, |anchor| {
                    let mut s = String::with_capacity(anchor.hash.len() * 2);
                    for b in anchor.hash {
                        let _ = write!(s, "{b:02x}");
                    }
                    s
                });
                (hex, origin.last_cmd_eid())
            }
            None => (String::new(), 0),
        };

        ReplicationInfo {
            mode,
            last_sdb_hash_hex,
            last_eid,
        }
    }
}

impl Default for Replication {
    fn default() -> Self {
        Self::new()
    }
}
