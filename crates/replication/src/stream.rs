//! Host collaborator interfaces.
//!
//! The controller talks to the outside world through two narrow traits: a
//! [`ReplicaStream`] carries ordered replication frames to one replica, a
//! [`ControlResponse`] carries RPC replies and can open such streams. Hosts
//! implement both against their own connection machinery; [`WireStream`] is
//! a ready-made [`ReplicaStream`] over any [`std::io::Write`] using the
//! mandatory frame envelope.

use crate::frame::Frame;
use crate::ReplicationError;
use replring::Eid;
use std::io::Write;
use thiserror::Error;

/// Error type for stream operations.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The peer is gone; no more frames can be delivered.
    #[error("stream closed by peer")]
    Closed,

    /// Transport-level failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// An ordered stream of replication frames to one replica.
///
/// Implementations are driven from the replica's worker thread only, so no
/// internal synchronization is required. Any error return terminates the
/// stream: the worker stops, calls [`ReplicaStream::end`] and unwinds.
pub trait ReplicaStream: Send {
    /// Sends one replication frame.
    fn send_replication_frame(
        &mut self,
        eid: Eid,
        cmd_id: i8,
        payload: &[u8],
    ) -> Result<(), StreamError>;

    /// Flushes frames queued by the transport.
    fn flush(&mut self) -> Result<(), StreamError>;

    /// Finalizes the stream. Called exactly once, last.
    fn end(&mut self);

    /// A short description of the peer, for diagnostics.
    fn peer_description(&self) -> String;
}

/// The response side of one RPC.
pub trait ControlResponse {
    /// Opens a streaming response handle for replication frames.
    fn start_stream(&mut self) -> Result<Box<dyn ReplicaStream>, StreamError>;

    /// Sends an integer reply.
    fn send_long(&mut self, value: i64);

    /// Sends a string reply.
    fn send_str(&mut self, value: &str);

    /// Announces an array reply of `len` elements, sent next.
    fn send_array(&mut self, len: usize);

    /// Sends an error reply.
    fn send_error(&mut self, err: &ReplicationError);
}

/// A [`ReplicaStream`] writing the frame envelope to any byte sink.
pub struct WireStream<W> {
    writer: W,
    peer: String,
    buf: Vec<u8>,
}

impl<W: Write + Send> WireStream<W> {
    /// Wraps `writer` as a replica stream; `peer` is used in log lines.
    pub fn new(writer: W, peer: impl Into<String>) -> Self {
        Self {
            writer,
            peer: peer.into(),
            buf: Vec::new(),
        }
    }

    /// Unwraps the inner writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> ReplicaStream for WireStream<W> {
    fn send_replication_frame(
        &mut self,
        eid: Eid,
        cmd_id: i8,
        payload: &[u8],
    ) -> Result<(), StreamError> {
        self.buf.clear();
        Frame {
            eid,
            cmd_id,
            payload,
        }
        .encode_into(&mut self.buf);

        self.writer.write_all(&self.buf)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StreamError> {
        self.writer.flush()?;
        Ok(())
    }

    fn end(&mut self) {
        let _ = self.writer.flush();
    }

    fn peer_description(&self) -> String {
        self.peer.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_stream_emits_envelope() {
        let mut stream = WireStream::new(Vec::new(), "test-peer");

        stream
            .send_replication_frame(Eid::command(5), 2, b"abc")
            .unwrap();
        stream.flush().unwrap();
        stream.end();

        let bytes = stream.into_inner();
        let (frame, rest) = Frame::decode(&bytes).unwrap();
        assert_eq!(frame.eid, Eid::command(5));
        assert_eq!(frame.cmd_id, 2);
        assert_eq!(frame.payload, b"abc");
        assert!(rest.is_empty());
    }
}
