use crate::state::Mode;
use thiserror::Error;

/// Errors surfaced to clients of the replication RPCs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReplicationError {
    /// All replica slots are in use.
    #[error("no free replica slots")]
    NoBuffers,

    /// The request contradicts the node's established mode. The mode is set
    /// once per process; there is no way back.
    #[error("this server is already configured as {mode}")]
    NotSupported {
        /// The node's current mode.
        mode: Mode,
    },

    /// Wrong number of RPC payload fields.
    #[error("wrong number of arguments")]
    BadArity,

    /// The host could not open a response stream for the replica.
    #[error("failed to create a stream")]
    StreamSetupFailed,
}
