//! Live resizing: contents survive, readers keep going, and retired
//! generations are only freed once nobody can be reading them.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Barrier,
    },
    thread,
};

use tcuckoo::{CuckooTable, InsertError, TableBuilder};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn readers_never_miss_during_resizes() {
    const PRELOADED: u64 = 2_000;
    const INSERTED: u64 = 20_000;
    const NUM_READERS: usize = 4;

    init_logger();
    let table = Arc::new(
        TableBuilder::new(PRELOADED as usize)
            .slot_per_bucket(4)
            .name("resize")
            .build(),
    );
    {
        let handle = table.handle();
        for key in 0..PRELOADED {
            assert!(handle.insert(key, key + 1));
        }
    }
    let initial_hashpower = table.hashpower();
    let done = Arc::new(AtomicBool::new(false));
    let barrier = Arc::new(Barrier::new(NUM_READERS + 1));

    let readers: Vec<_> = (0..NUM_READERS)
        .map(|_| {
            let table = Arc::clone(&table);
            let done = Arc::clone(&done);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let handle = table.handle();
                barrier.wait();
                let mut rounds = 0;
                while !done.load(Ordering::Acquire) || rounds == 0 {
                    for key in 0..PRELOADED {
                        assert_eq!(handle.find(&key), Some(key + 1), "lost key {key}");
                    }
                    rounds += 1;
                }
            })
        })
        .collect();

    barrier.wait();
    let handle = table.handle();
    for key in PRELOADED..(PRELOADED + INSERTED) {
        assert!(handle.insert(key, key + 1));
    }
    done.store(true, Ordering::Release);
    for reader in readers {
        reader.join().expect("reader panicked");
    }

    assert!(table.hashpower() > initial_hashpower);
    assert!(table.retired_generations() >= 1);
    assert_eq!(table.size(), (PRELOADED + INSERTED) as usize);
    for key in 0..(PRELOADED + INSERTED) {
        assert_eq!(handle.find(&key), Some(key + 1));
    }
}

#[test]
fn concurrent_explicit_expansions() {
    const NUM_THREADS: usize = 4;

    let table = Arc::new(TableBuilder::new(256).slot_per_bucket(4).build());
    {
        let handle = table.handle();
        for key in 0..200_u32 {
            assert!(handle.insert(key, key));
        }
    }
    let target = table.hashpower() + 3;
    let barrier = Arc::new(Barrier::new(NUM_THREADS));

    let workers: Vec<_> = (0..NUM_THREADS)
        .map(|t| {
            let table = Arc::clone(&table);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                if t % 2 == 0 {
                    table.expand(target);
                } else {
                    let handle = table.handle();
                    for key in 0..200_u32 {
                        assert!(handle.update(&key, key * 2));
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker panicked");
    }

    assert_eq!(table.hashpower(), target);
    assert!(!table.is_expanding());
    let handle = table.handle();
    assert_eq!(table.size(), 200);
    for key in 0..200_u32 {
        assert_eq!(handle.find(&key), Some(key * 2));
    }
}

#[test]
fn tight_search_bounds_with_concurrent_writers() {
    const NUM_THREADS: u32 = 4;
    const KEYS_PER_THREAD: u32 = 5_000;

    init_logger();
    // The shortest legal cuckoo search: most inserts that find both buckets
    // full grow the table.
    let table = Arc::new(
        TableBuilder::new(8)
            .slot_per_bucket(2)
            .max_bfs_depth(1)
            .max_cuckoo_count(2)
            .build(),
    );
    let barrier = Arc::new(Barrier::new(NUM_THREADS as usize));

    let workers: Vec<_> = (0..NUM_THREADS)
        .map(|t| {
            let table = Arc::clone(&table);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let handle = table.handle();
                barrier.wait();
                let keys = (t * KEYS_PER_THREAD)..((t + 1) * KEYS_PER_THREAD);
                for key in keys.clone() {
                    assert!(handle.insert(key, key));
                }
                for key in keys {
                    assert_eq!(handle.find(&key), Some(key), "lost key {key}");
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker panicked");
    }

    assert_eq!(table.size(), (NUM_THREADS * KEYS_PER_THREAD) as usize);
    let handle = table.handle();
    for key in 0..(NUM_THREADS * KEYS_PER_THREAD) {
        assert_eq!(handle.find(&key), Some(key));
    }
}

#[test]
fn pinned_transaction_delays_reclamation() -> anyhow::Result<()> {
    let table = CuckooTable::new(100);
    let handle = table.handle();
    for key in 0..50_u32 {
        assert!(handle.insert(key, key.to_string()));
    }

    let mut txn = handle.transaction();
    assert_eq!(txn.get(&7)?, Some("7".to_string()));

    let hashpower = table.hashpower();
    assert!(table.expand(hashpower + 1));
    assert_eq!(table.retired_generations(), 1);

    // The transaction may still hold references into the old generation.
    table.try_reclaim();
    assert_eq!(table.freed_generations(), 0);

    // Entries moved, not copied: the transaction still sees its read.
    assert_eq!(txn.get(&7)?, Some("7".to_string()));
    assert_eq!(txn.get(&8)?, Some("8".to_string()));
    txn.commit()?;

    table.try_reclaim();
    assert_eq!(table.freed_generations(), 1);
    assert_eq!(handle.find(&49), Some("49".to_string()));
    Ok(())
}

#[test]
fn absence_observed_before_a_resize_conflicts() {
    let table = CuckooTable::new(100);
    let handle = table.handle();
    assert!(handle.insert(1, 1));

    let mut txn = handle.transaction();
    assert_eq!(txn.get(&2), Ok(None));
    assert_eq!(txn.insert(3, 3), Ok(true));
    // Migration moves the observed buckets and the phantom entry.
    assert!(table.expand(table.hashpower() + 1));
    assert_eq!(txn.commit(), Err(tcuckoo::TxnError::Conflict));

    assert_eq!(handle.find(&3), None);
    assert_eq!(table.size(), 1);
}

#[test]
fn fixed_size_table_reports_full_until_expanded() {
    let table = TableBuilder::new(16)
        .slot_per_bucket(4)
        .auto_resize(false)
        .build();
    let handle = table.handle();

    let mut key = 0_u32;
    loop {
        match handle.try_insert(key, key) {
            Ok(()) => key += 1,
            Err(InsertError::TableFull) => break,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    let inserted = key;
    assert_eq!(table.size(), inserted as usize);
    assert!(table.load_factor() > 0.5);

    assert!(table.reserve(table.size() * 4));
    assert!(handle.insert(key, key));
    for key in 0..=inserted {
        assert_eq!(handle.find(&key), Some(key));
    }
}
