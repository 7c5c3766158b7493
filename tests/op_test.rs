mod test_utils;

use small_hash::{ErrorKind, OpOutcome, OpRequest, StoreConfig};
use test_utils::*;

/// Insert, read, delete, read again on a single key. The second read
/// refuses with TupleNotFound, the element count returns to zero, and
/// exactly the three successful operations commit.
#[test]
fn test_insert_read_delete_single_key() {
    setup();
    let mut store = new_store("ird");
    let root = default_root(&mut store);

    let key = [0xAA, 0x01];
    let hash = 0x12345678;

    let lk = insert_committed(&mut store, root, tx(1), &key, hash);
    assert_eq!((lk.page_no, lk.page_idx), (0, 0));

    let read1 = read_outcome(&mut store, root, tx(2), &key, hash);
    assert_eq!(read1, OpOutcome::Done(lk));

    delete_committed(&mut store, root, tx(3), &key, hash);

    let read2 = read_outcome(&mut store, root, tx(4), &key, hash);
    assert_eq!(read2, OpOutcome::Refused(ErrorKind::TupleNotFound));

    assert_eq!(store.no_of_elements(root), 0);
    assert_eq!(store.commit_count(root), 3);
    store.check_integrity(root);
}

#[test]
fn test_insert_existing_key_is_refused() {
    setup();
    let mut store = new_store("dup");
    let root = default_root(&mut store);

    insert_committed(&mut store, root, tx(1), &[7, 7], 0x40);

    let op = store
        .exec_op(root, OpRequest::insert(tx(2), &[7, 7], 0x40))
        .unwrap();
    assert_eq!(
        store.op_outcome(op),
        OpOutcome::Refused(ErrorKind::WriteError)
    );
    store.abort_op(op).unwrap();

    assert_eq!(store.no_of_elements(root), 1);
    store.check_integrity(root);
}

#[test]
fn test_update_and_delete_of_missing_key() {
    setup();
    let mut store = new_store("missing");
    let root = default_root(&mut store);

    let op = store
        .exec_op(root, OpRequest::update(tx(1), &[1, 2], 0x10))
        .unwrap();
    assert_eq!(
        store.op_outcome(op),
        OpOutcome::Refused(ErrorKind::TupleNotFound)
    );
    store.abort_op(op).unwrap();

    let op = store
        .exec_op(root, OpRequest::delete(tx(1), &[1, 2], 0x10))
        .unwrap();
    assert_eq!(
        store.op_outcome(op),
        OpOutcome::Refused(ErrorKind::TupleNotFound)
    );
    store.abort_op(op).unwrap();
}

/// A write (upsert) on a missing key turns into an insert.
#[test]
fn test_write_upserts_missing_key() {
    setup();
    let mut store = new_store("upsert");
    let root = default_root(&mut store);

    let mut req = OpRequest::insert(tx(1), &[5, 5], 0x20);
    req.kind = small_hash::OpKind::Write;
    let op = store.exec_op(root, req).unwrap();
    match store.op_outcome(op) {
        OpOutcome::Done(_) => {}
        other => panic!("upsert failed: {:?}", other),
    }
    store.commit_op(op).unwrap();
    assert_eq!(store.no_of_elements(root), 1);
}

/// A read-committed read never takes a lock, even on a locked element.
#[test]
fn test_read_committed_skips_locking() {
    setup();
    let mut store = new_store("dirty");
    let root = default_root(&mut store);

    let lk = insert_committed(&mut store, root, tx(1), &[3, 3], 0x30);

    // exclusive update holds the element
    let upd = store
        .exec_op(root, OpRequest::update(tx(2), &[3, 3], 0x30))
        .unwrap();
    assert!(matches!(store.op_outcome(upd), OpOutcome::Done(_)));

    let mut req = OpRequest::read(tx(3), &[3, 3], 0x30);
    req.read_committed = true;
    let op = store.exec_op(root, req).unwrap();
    assert_eq!(store.op_outcome(op), OpOutcome::Done(lk));
    store.commit_op(op).unwrap();

    store.commit_op(upd).unwrap();
    store.check_integrity(root);
}

/// Aborting an insert physically removes the element again.
#[test]
fn test_insert_abort_rolls_back() {
    setup();
    let mut store = new_store("abortins");
    let root = default_root(&mut store);

    let op = store
        .exec_op(root, OpRequest::insert(tx(1), &[9, 9], 0x50))
        .unwrap();
    assert!(matches!(store.op_outcome(op), OpOutcome::Done(_)));
    store.abort_op(op).unwrap();

    assert_eq!(store.no_of_elements(root), 0);
    assert_eq!(
        read_outcome(&mut store, root, tx(2), &[9, 9], 0x50),
        OpOutcome::Refused(ErrorKind::TupleNotFound)
    );
    store.check_integrity(root);
}

/// Operation records are a bounded pool; exhaustion is a typed refusal.
#[test]
fn test_out_of_operation_records() {
    setup();
    let mut config = StoreConfig::with_root(test_dir("oppool"));
    config.op_recs = 4;
    let mut store = small_hash::HashStore::new(
        config,
        Box::new(small_hash::MemTupleStore::new()),
    );
    let root = default_root(&mut store);

    let mut held = Vec::new();
    for i in 0..4 {
        let op = store
            .exec_op(root, OpRequest::insert(tx(i), &[i, 0], (2 * i) as u32))
            .unwrap();
        held.push(op);
    }
    let err = store
        .exec_op(root, OpRequest::read(tx(9), &[0, 0], 0))
        .unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::OutOfConnections));

    for op in held {
        store.commit_op(op).unwrap();
    }
}

/// Fragments with character keys compare case-insensitively.
#[test]
fn test_char_key_case_folding() {
    setup();
    let mut store = new_store("charkey");
    let mut params = small_hash::FragmentParams::default();
    params.has_char_attr = true;
    let root = store.add_fragment(params).unwrap();

    let upper = [u32::from_le_bytes(*b"ABCD"), 1];
    let lower = [u32::from_le_bytes(*b"abcd"), 1];

    insert_committed(&mut store, root, tx(1), &upper, 0x60);
    let got = read_outcome(&mut store, root, tx(2), &lower, 0x60);
    assert!(matches!(got, OpOutcome::Done(_)));
}
