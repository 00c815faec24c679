//! Replication RPC command handlers.
//!
//! The host's command dispatch routes the three replication commands here,
//! passing the raw payload fields and the response handle. Handlers reply
//! through [`ControlResponse`] and never panic on malformed input.

use crate::state::Replication;
use crate::stream::ControlResponse;
use crate::ReplicationError;
use tracing::warn;

/// Command id of `REPLICASYNC`.
pub const CMD_REPLICASYNC_ID: u8 = 112;
/// Command id of `REPLICAOF`.
pub const CMD_REPLICAOF_ID: u8 = 113;
/// Command id of `REPLICAINFO`.
pub const CMD_REPLICAINFO_ID: u8 = 114;

/// `REPLICASYNC` — start sending replication traffic to the caller.
///
/// Takes no payload. Moves the node to `ORIGIN` mode (first call only),
/// opens a stream on the response, registers the caller as a replica and
/// replies with the integer `1`; the replication frames follow on the
/// stream.
pub fn replicasync(repl: &Replication, resp: &mut dyn ControlResponse, args: &[&[u8]]) {
    if !args.is_empty() {
        resp.send_error(&ReplicationError::BadArity);
        return;
    }

    let origin = match repl.become_origin() {
        Ok(origin) => origin,
        Err(err) => {
            resp.send_error(&err);
            return;
        }
    };

    let stream = match resp.start_stream() {
        Ok(stream) => stream,
        Err(err) => {
            warn!(%err, "replica stream setup failed");
            resp.send_error(&ReplicationError::StreamSetupFailed);
            return;
        }
    };

    match origin.register_replica(stream) {
        Ok(_) => resp.send_long(1),
        Err(err) => resp.send_error(&err),
    }
}

/// `REPLICAOF` — make this node a replica of `host:port`.
pub fn replicaof(repl: &Replication, resp: &mut dyn ControlResponse, args: &[&[u8]]) {
    if args.len() != 2 {
        resp.send_error(&ReplicationError::BadArity);
        return;
    }

    let host = String::from_utf8_lossy(args[0]);
    let Some(port) = std::str::from_utf8(args[1])
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
    else {
        resp.send_error(&ReplicationError::BadArity);
        return;
    };

    match repl.become_replica(&host, port) {
        Ok(()) => resp.send_str("OK"),
        Err(err) => resp.send_error(&err),
    }
}

/// `REPLICAINFO` — report `(mode, last snapshot hash, last command EID)`.
pub fn replicainfo(repl: &Replication, resp: &mut dyn ControlResponse, args: &[&[u8]]) {
    if !args.is_empty() {
        resp.send_error(&ReplicationError::BadArity);
        return;
    }

    let info = repl.info();

    resp.send_array(3);
    resp.send_str(&info.mode.to_string());
    resp.send_str(&info.last_sdb_hash_hex);
    resp.send_long(info.last_eid as i64);
}
