use crate::Eid;

/// One record of the replication log.
///
/// The ring owns its records: the previous occupant of a slot is dropped when
/// the slot is overwritten, so whatever cleanup the payload type needs runs
/// exactly once, on the producer side. Payload types whose drop is trivial
/// (inline snapshot hashes, for example) cost nothing there.
#[derive(Debug)]
pub struct Record<T> {
    /// Event id used for ordering and reader seeks.
    pub eid: Eid,
    /// Command id the record replays on the receiving side.
    pub cmd_id: i8,
    /// The payload.
    pub data: T,
}
