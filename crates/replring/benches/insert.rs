//! Insert-path benchmark: producer throughput with a draining reader.

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use replring::{Eid, InsertOutcome, Record, Ring, RingConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_insert");
    group.throughput(Throughput::Elements(1));

    group.bench_function("uncontended", |b| {
        // No readers registered: every insert publishes to nobody and the
        // previous record drops immediately.
        let ring: Ring<Vec<u8>> = Ring::new(RingConfig::default());
        let mut eid = 0u64;

        b.iter(|| {
            eid += 1;
            let outcome = ring.insert(Record {
                eid: Eid::command(eid),
                cmd_id: 1,
                data: vec![0u8; 64],
            });
            assert!(matches!(outcome, InsertOutcome::Inserted));
        });
    });

    group.bench_function("one_draining_reader", |b| {
        let ring: Arc<Ring<Vec<u8>>> = Arc::new(Ring::new(RingConfig::default()));
        let stop = Arc::new(AtomicBool::new(false));

        ring.add_reader(0);
        assert!(matches!(
            ring.insert(Record {
                eid: Eid::command(1),
                cmd_id: 1,
                data: Vec::new(),
            }),
            InsertOutcome::Inserted
        ));

        let reader = {
            let ring = Arc::clone(&ring);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut state = ring.init_reader(Eid::command(1), 0).unwrap();
                while let Some(r) = ring.get_next(&mut state) {
                    r.release();
                    if stop.load(Ordering::Relaxed) {
                        break;
                    }
                }
                ring.reader_exit(state);
            })
        };

        let mut eid = 1u64;
        b.iter(|| {
            eid += 1;
            let mut record = Record {
                eid: Eid::command(eid),
                cmd_id: 1,
                data: vec![0u8; 64],
            };
            loop {
                match ring.insert(record) {
                    InsertOutcome::Inserted => break,
                    InsertOutcome::Blocked { record: r, .. } => {
                        record = r;
                        thread::yield_now();
                    }
                }
            }
        });

        stop.store(true, Ordering::Relaxed);
        ring.del_reader(0);
        reader.join().unwrap();
    });

    group.finish();
}

criterion_group!(benches, bench_insert);
criterion_main!(benches);
