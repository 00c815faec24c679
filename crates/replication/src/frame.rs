//! Replication frame envelope.
//!
//! Every record crosses the wire as a fixed little-endian header followed by
//! the payload:
//!
//! ```text
//! +--------+--------+----------+------------------+
//! | eid u64 LE      | cmd_id i8| size u32 LE      | payload (size bytes)
//! +--------+--------+----------+------------------+
//! ```
//!
//! Snapshot anchor frames set the EID's MSB, carry [`crate::SDB_MARKER`] as
//! the command id and the 32-byte snapshot hash as payload.

use replring::Eid;
use thiserror::Error;

/// Byte size of the fixed frame header.
pub const FRAME_HEADER_SIZE: usize = 8 + 1 + 4;

/// Error type for frame decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The buffer ends before the frame does.
    #[error("truncated frame: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
}

/// One replication frame, borrowing its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    /// Event id of the record.
    pub eid: Eid,
    /// Command id replayed on the replica.
    pub cmd_id: i8,
    /// The record payload.
    pub payload: &'a [u8],
}

impl<'a> Frame<'a> {
    /// Returns the encoded size of this frame.
    #[inline]
    pub fn encoded_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }

    /// Appends the encoded frame to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.reserve(self.encoded_size());
        out.extend_from_slice(&self.eid.raw().to_le_bytes());
        out.push(self.cmd_id as u8);
        out.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        out.extend_from_slice(self.payload);
    }

    /// Decodes one frame from the front of `buf`, returning it and the
    /// remaining bytes.
    pub fn decode(buf: &'a [u8]) -> Result<(Self, &'a [u8]), FrameError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(FrameError::Truncated {
                need: FRAME_HEADER_SIZE,
                have: buf.len(),
            });
        }

        let eid = Eid::from_raw(u64::from_le_bytes(buf[0..8].try_into().unwrap()));
        let cmd_id = buf[8] as i8;
        let size = u32::from_le_bytes(buf[9..13].try_into().unwrap()) as usize;

        let total = FRAME_HEADER_SIZE + size;
        if buf.len() < total {
            return Err(FrameError::Truncated {
                need: total,
                have: buf.len(),
            });
        }

        Ok((
            Self {
                eid,
                cmd_id,
                payload: &buf[FRAME_HEADER_SIZE..total],
            },
            &buf[total..],
        ))
    }
}
