mod test_utils;

use std::rc::Rc;

use small_hash::{
    ErrorKind, FragmentParams, HashStore, OpOutcome, OpRequest, StoreConfig, StoreEvent,
};
use test_utils::*;

fn drain_events(store: &mut HashStore) -> Vec<StoreEvent> {
    let mut out = Vec::new();
    while let Some(e) = store.take_event() {
        out.push(e);
    }
    out
}

/// Checkpoint, then restore into a fresh store: every committed row
/// survives, the counters match, and the structure checks out.
#[test]
fn test_lcp_restore_round_trip() {
    setup();
    let (mut store, tuples, dir) = new_shared_store("lcp-rt");
    let root = default_root(&mut store);

    let n = 120u32;
    for i in 0..n {
        insert_committed(&mut store, root, tx(100 + i), &[i, 9], i);
    }
    let elements = store.no_of_elements(root);

    store.lcp_start(root, 1).unwrap();
    store.run();
    let events = drain_events(&mut store);
    assert!(events.contains(&StoreEvent::LcpDone(root)));

    // a second store takes over from the files
    let mut restored = HashStore::new(
        StoreConfig::with_root(dir),
        Box::new(SharedTupleStore(Rc::clone(&tuples))),
    );
    let new_root = restored.restore_fragment(0, [0, 1], 1).unwrap();
    assert_eq!(restored.no_of_elements(new_root), elements);

    for i in 0..n {
        let got = read_outcome(&mut restored, new_root, tx(1), &[i, 9], i);
        assert!(matches!(got, OpOutcome::Done(_)), "key {} lost", i);
    }
    restored.check_integrity(new_root);
}

/// A commit that lands after its page was copied is invisible at the
/// restored checkpoint: the undo log wins over the fuzzy copy.
#[test]
fn test_lcp_insert_during_window_is_absent_after_restore() {
    setup();
    let (mut store, tuples, dir) = new_shared_store("lcp-fuzzy");
    let root = default_root(&mut store);

    for i in 0..40u32 {
        insert_committed(&mut store, root, tx(100 + i), &[i, 8], i);
    }
    let elements = store.no_of_elements(root);

    store.lcp_start(root, 7).unwrap();
    // let the hold phase and the first copy group go out, nothing more
    while store.run_pending() {}
    assert!(store.pump_io());

    // a fresh insert into the snapshot window, committed mid-checkpoint
    let key = [0x7777, 0x1];
    insert_committed(&mut store, root, tx(900), &key, 0x10);
    store.run();
    assert!(drain_events(&mut store).contains(&StoreEvent::LcpDone(root)));

    let mut restored = HashStore::new(
        StoreConfig::with_root(dir),
        Box::new(SharedTupleStore(Rc::clone(&tuples))),
    );
    let new_root = restored.restore_fragment(0, [0, 1], 7).unwrap();

    // the checkpoint image predates the insert
    assert_eq!(restored.no_of_elements(new_root), elements);
    assert_eq!(
        read_outcome(&mut restored, new_root, tx(1), &key, 0x10),
        OpOutcome::Refused(ErrorKind::TupleNotFound)
    );
    // while everything older is intact
    for i in 0..40u32 {
        let got = read_outcome(&mut restored, new_root, tx(1), &[i, 8], i);
        assert!(matches!(got, OpOutcome::Done(_)), "key {} lost", i);
    }
    restored.check_integrity(new_root);
}

/// An insert whose transaction never committed is taken back by the
/// op-undo record during recovery.
#[test]
fn test_lcp_uncommitted_insert_is_removed_on_restore() {
    setup();
    let (mut store, tuples, dir) = new_shared_store("lcp-opundo");
    let root = default_root(&mut store);

    for i in 0..20u32 {
        insert_committed(&mut store, root, tx(100 + i), &[i, 6], i);
    }
    let elements = store.no_of_elements(root);

    // executed but never committed: a lock owner at checkpoint start
    let hanging = store
        .exec_op(root, OpRequest::insert(tx(500), &[0x4444, 2], 0x2A))
        .unwrap();
    assert!(matches!(store.op_outcome(hanging), OpOutcome::Done(_)));

    store.lcp_start(root, 3).unwrap();
    store.run();
    assert!(drain_events(&mut store).contains(&StoreEvent::LcpDone(root)));

    let mut restored = HashStore::new(
        StoreConfig::with_root(dir),
        Box::new(SharedTupleStore(Rc::clone(&tuples))),
    );
    let new_root = restored.restore_fragment(0, [0, 1], 3).unwrap();

    assert_eq!(restored.no_of_elements(new_root), elements);
    assert_eq!(
        read_outcome(&mut restored, new_root, tx(1), &[0x4444, 2], 0x2A),
        OpOutcome::Refused(ErrorKind::TupleNotFound)
    );
    restored.check_integrity(new_root);

    store.abort_op(hanging).unwrap();
}

/// Saturating the undo ring stalls commits; once a group write lands
/// they fire in arrival order, none lost.
#[test]
fn test_undo_back_pressure_preserves_commit_order() {
    setup();
    let mut store = HashStore::new(
        StoreConfig::with_root(test_dir("lcp-press")),
        Box::new(small_hash::MemTupleStore::new()),
    );
    let mut params = FragmentParams::default();
    params.max_load_factor = 2;
    params.min_load_factor = 1;
    let root = store.add_fragment(params).unwrap();

    // grow fragment 0 well past a dozen bucket pages so deletes can
    // touch that many distinct pages inside the window
    let n = 2000u32;
    fill_even(&mut store, root, n);
    store.run();
    let (buckets, _) = store.bucket_count(root);
    assert!(buckets > 13 * 64, "not enough bucket pages: {}", buckets);

    store.lcp_start(root, 5).unwrap();
    // run the hold phase only; no I/O completes from here on
    while store.run_pending() {}

    // thirteen deletes on thirteen distinct pages fill the undo ring
    let mut deletes = Vec::new();
    for page in 0..13u32 {
        let i = page * 64;
        let op = store
            .exec_op(root, OpRequest::delete(tx(3000 + page), &[i, 0xABCD], 2 * i))
            .unwrap();
        assert!(matches!(store.op_outcome(op), OpOutcome::Done(_)));
        deletes.push(op);
    }

    // every commit stalls on undo credit now
    let before = store.commit_count(root);
    for &op in deletes.iter() {
        store.commit_op(op).unwrap();
    }
    assert_eq!(store.commit_count(root), before, "commits went through early");

    // completing the queued writes releases them in arrival order
    store.run();
    let commit_events: Vec<StoreEvent> = drain_events(&mut store)
        .into_iter()
        .filter(|e| matches!(e, StoreEvent::CommitDone(_)))
        .collect();
    let expected: Vec<StoreEvent> =
        deletes.iter().map(|&op| StoreEvent::CommitDone(op)).collect();
    assert_eq!(commit_events, expected);
    assert_eq!(store.commit_count(root), before + 13);
    assert_eq!(store.no_of_elements(root) as u32, n - 13);
    store.check_integrity(root);
}
