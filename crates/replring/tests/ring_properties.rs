//! Property tests for the ring buffer's ordering and eviction invariants.

use proptest::prelude::*;
use replring::{Eid, InsertOutcome, Record, Ring, RingConfig};

fn rec(eid: u64, payload: u8) -> Record<Vec<u8>> {
    Record {
        eid: Eid::command(eid),
        cmd_id: 1,
        data: vec![payload],
    }
}

proptest! {
    /// A reader that keeps up observes exactly the inserted EIDs, in
    /// insertion order, for any capacity and record count.
    #[test]
    fn prop_ordered_delivery(
        capacity in 2usize..32,
        count in 1u64..200,
    ) {
        let ring = Ring::new(RingConfig::new(capacity));

        ring.add_reader(0);
        prop_assert!(matches!(ring.insert(rec(1, 0)), InsertOutcome::Inserted));
        let mut state = ring.init_reader(Eid::command(1), 0).unwrap();

        let mut seen = Vec::new();
        for eid in 2..=count + 1 {
            // Keep the reader drained so the producer never blocks.
            prop_assert!(matches!(ring.insert(rec(eid, 0)), InsertOutcome::Inserted));
            let r = ring.get_next(&mut state).unwrap();
            seen.push(r.eid.raw());
            r.release();
        }

        let expect: Vec<u64> = (2..=count + 1).collect();
        prop_assert_eq!(seen, expect);
    }

    /// The producer never overwrites a held slot: once the ring wraps onto a
    /// pinned record, the insert is refused with exactly the holder's mask
    /// and the record comes back intact.
    #[test]
    fn prop_blocked_insert_names_holder(
        capacity in 2usize..16,
        reader_id in 0u32..32,
    ) {
        let ring = Ring::new(RingConfig::new(capacity));

        ring.add_reader(reader_id);
        prop_assert!(matches!(ring.insert(rec(1, 0)), InsertOutcome::Inserted));
        let _state = ring.init_reader(Eid::command(1), reader_id).unwrap();

        // Fill every remaining slot without consuming.
        let mut eid = 2;
        let mut blocked_at = None;
        for _ in 0..capacity + 1 {
            match ring.insert(rec(eid, 0)) {
                InsertOutcome::Inserted => eid += 1,
                InsertOutcome::Blocked { not_read, record } => {
                    blocked_at = Some((not_read, record.eid.raw()));
                    break;
                }
            }
        }

        let (mask, refused) = blocked_at.expect("a full ring must refuse");
        prop_assert_eq!(mask, 1u32 << reader_id);
        prop_assert_eq!(refused, eid);
        // capacity - 1 unread records fit, plus one more over the consumed
        // start slot, before the producer wraps onto a pinned record.
        prop_assert_eq!(eid - 2, capacity as u64);
    }

    /// Eviction liveness: after removing the offending readers and clearing
    /// their pins, the refused insert succeeds with no one else evicted.
    #[test]
    fn prop_eviction_unblocks(capacity in 2usize..16) {
        let ring = Ring::new(RingConfig::new(capacity));

        ring.add_reader(0);
        prop_assert!(matches!(ring.insert(rec(1, 0)), InsertOutcome::Inserted));
        let state = ring.init_reader(Eid::command(1), 0).unwrap();

        let mut eid = 2;
        loop {
            match ring.insert(rec(eid, 0)) {
                InsertOutcome::Inserted => eid += 1,
                InsertOutcome::Blocked { not_read, .. } => {
                    prop_assert_eq!(not_read, 1);
                    break;
                }
            }
        }

        ring.del_readers_mask(1);
        ring.reader_exit(state);

        prop_assert!(matches!(ring.insert(rec(eid, 0)), InsertOutcome::Inserted));
    }
}
