mod test_utils;

use small_hash::{adaptive::Fingerprint, Database, FragmentParams, HashStore, MemTupleStore,
    OpOutcome, StoreConfig};
use test_utils::*;

/// Repeated key lookups with a stable prefix recommendation eventually
/// build hash entries for the hot pages, and later lookups hit them.
#[test]
fn test_adaptive_hash_builds_and_hits() {
    let _guard = search_sys_guard();
    setup();
    let mut store = new_store("adaptive");
    let root = default_root(&mut store);

    let n = 160u32;
    for i in 0..n {
        insert_committed(&mut store, root, tx(100 + i), &[i, 0x42], 2 * i);
    }

    // several rounds of searches: the analysis warms up, the potential
    // crosses the build limit, and the page gets hashed
    for _round in 0..3 {
        for i in 0..n {
            let got = read_outcome(&mut store, root, tx(7), &[i, 0x42], 2 * i);
            assert!(matches!(got, OpOutcome::Done(_)));
        }
    }
    assert!(
        Database::search_sys().entries() > 0,
        "no page hash index was ever built"
    );

    let guesses_before = Database::search_sys().n_guesses;
    let hits_before = Database::search_sys().n_hits;
    for i in 0..n {
        let got = read_outcome(&mut store, root, tx(8), &[i, 0x42], 2 * i);
        assert!(matches!(got, OpOutcome::Done(_)));
    }
    let sys = Database::search_sys();
    assert!(sys.n_guesses > guesses_before);
    assert!(sys.n_hits > hits_before, "guesses never validated");
}

/// Deleting a key invalidates its cached guess; the next search falls
/// back to the descent and reports the miss.
#[test]
fn test_adaptive_hash_entry_dropped_on_delete() {
    let _guard = search_sys_guard();
    setup();
    let mut store = new_store("adaptive-drop");
    let root = default_root(&mut store);

    let n = 160u32;
    for i in 0..n {
        insert_committed(&mut store, root, tx(100 + i), &[i, 0x43], 2 * i);
    }
    for _round in 0..3 {
        for i in 0..n {
            read_outcome(&mut store, root, tx(7), &[i, 0x43], 2 * i);
        }
    }
    let entries = Database::search_sys().entries();
    assert!(entries > 0);

    delete_committed(&mut store, root, tx(900), &[40, 0x43], 80);
    assert!(Database::search_sys().entries() < entries);

    assert!(matches!(
        read_outcome(&mut store, root, tx(901), &[40, 0x43], 80),
        OpOutcome::Refused(_)
    ));
    // neighbours are still served, possibly via their guesses
    assert!(matches!(
        read_outcome(&mut store, root, tx(902), &[41, 0x43], 82),
        OpOutcome::Done(_)
    ));
    store.check_integrity(root);
}

/// The search-system latch really is one writer / many readers: probes
/// from worker threads interleave with exclusive rebuilds.
#[test]
fn test_search_latch_shared_and_exclusive() {
    let _guard = search_sys_guard();
    setup();

    for i in 0..64u32 {
        Database::mut_search_sys().insert(
            0xF000 + i,
            Fingerprint {
                frag: 0,
                page: 1,
                con_ptr: 32,
                elem_ptr: 34 + i,
                forward: true,
            },
        );
    }

    let (sender, receiver) = crossbeam::channel::unbounded();
    let mut workers = Vec::new();
    for t in 0..4 {
        let sender = sender.clone();
        workers.push(std::thread::spawn(move || {
            let mut found = 0u32;
            for round in 0..200u32 {
                let fold = 0xF000 + ((t * 7 + round) % 64);
                if Database::search_sys().lookup(fold).is_some() {
                    found += 1;
                }
            }
            sender.send(found).unwrap();
        }));
    }
    // exclusive churn while the readers probe
    for i in 0..64u32 {
        Database::mut_search_sys().drop_element(1, 34 + i);
        Database::mut_search_sys().insert(
            0xF000 + i,
            Fingerprint {
                frag: 0,
                page: 1,
                con_ptr: 32,
                elem_ptr: 34 + i,
                forward: true,
            },
        );
    }
    for w in workers {
        w.join().unwrap();
    }
    drop(sender);
    let mut total = 0;
    while let Ok(found) = receiver.try_recv() {
        total += found;
    }
    // lookups may race the churn, but the structure stays sound
    assert!(total > 0);
    assert_eq!(Database::search_sys().entries(), 64);
}

/// Mispredicted guesses are corrected, not fatal: a poisoned entry only
/// costs one descent.
#[test]
fn test_mispredicted_guess_recovers() {
    let _guard = search_sys_guard();
    setup();
    let mut store = HashStore::new(
        StoreConfig::with_root(test_dir("adaptive-stale")),
        Box::new(MemTupleStore::new()),
    );
    let root = store.add_fragment(FragmentParams::default()).unwrap();

    let n = 160u32;
    for i in 0..n {
        insert_committed(&mut store, root, tx(100 + i), &[i, 0x44], 2 * i);
    }
    for _round in 0..3 {
        for i in 0..n {
            read_outcome(&mut store, root, tx(7), &[i, 0x44], 2 * i);
        }
    }
    assert!(Database::search_sys().entries() > 0);

    // poison one entry by pointing it at the wrong element; tree id 0
    // is the fragment handling the even hashes
    let fold = small_hash::adaptive::fold(&[5, 0x44], 1, 0, 0);
    Database::mut_search_sys().insert(
        fold,
        Fingerprint {
            frag: 0,
            page: 0,
            con_ptr: 32,
            elem_ptr: 35,
            forward: true,
        },
    );

    // every key still resolves correctly
    for i in 0..n {
        let got = read_outcome(&mut store, root, tx(9), &[i, 0x44], 2 * i);
        assert!(matches!(got, OpOutcome::Done(_)), "key {} misrouted", i);
    }
    store.check_integrity(root);
}
