mod test_utils;

use small_hash::{ErrorKind, LockMode, OpOutcome, OpRequest, StoreEvent};
use test_utils::*;

/// Two readers queue behind an exclusive update and are served in order
/// once it commits, each with its own shared lock and the committed
/// value.
#[test]
fn test_conflict_queue_serves_readers_in_order() {
    setup();
    let mut store = new_store("queue");
    let root = default_root(&mut store);

    let key = [0x11, 0x22];
    let hash = 0x80;
    insert_committed(&mut store, root, tx(1), &key, hash);

    let a = store
        .exec_op(root, OpRequest::update(tx(10), &key, hash))
        .unwrap();
    assert!(matches!(store.op_outcome(a), OpOutcome::Done(_)));

    let b = store
        .exec_op(root, OpRequest::read(tx(11), &key, hash))
        .unwrap();
    let c = store
        .exec_op(root, OpRequest::read(tx(12), &key, hash))
        .unwrap();
    assert_eq!(store.op_outcome(b), OpOutcome::Pending);
    assert_eq!(store.op_outcome(c), OpOutcome::Pending);

    store.commit_op(a).unwrap();

    // both wake, b first
    assert_eq!(store.take_event(), Some(StoreEvent::OpReady(b)));
    assert_eq!(store.take_event(), Some(StoreEvent::OpReady(c)));
    let lk_b = match store.op_outcome(b) {
        OpOutcome::Done(lk) => lk,
        other => panic!("b not served: {:?}", other),
    };
    let lk_c = match store.op_outcome(c) {
        OpOutcome::Done(lk) => lk,
        other => panic!("c not served: {:?}", other),
    };
    assert_eq!(lk_b, lk_c);

    store.commit_op(b).unwrap();
    store.commit_op(c).unwrap();
    assert_eq!(store.commit_count(root), 4);
    store.check_integrity(root);
}

/// A committed delete propagates to queued operations: the waiting read
/// reports TupleNotFound, and the element is physically removed on its
/// release, with the element count decreasing exactly once.
#[test]
fn test_delete_propagates_to_queue() {
    setup();
    let mut store = new_store("delprop");
    let root = default_root(&mut store);

    let key = [0x33, 0x44];
    let hash = 0x90;
    insert_committed(&mut store, root, tx(1), &key, hash);
    assert_eq!(store.no_of_elements(root), 1);

    let a = store
        .exec_op(root, OpRequest::delete(tx(20), &key, hash))
        .unwrap();
    assert!(matches!(store.op_outcome(a), OpOutcome::Done(_)));

    let b = store
        .exec_op(root, OpRequest::read(tx(21), &key, hash))
        .unwrap();
    assert_eq!(store.op_outcome(b), OpOutcome::Pending);

    store.commit_op(a).unwrap();
    assert_eq!(store.no_of_elements(root), 0);

    assert_eq!(store.take_event(), Some(StoreEvent::OpReady(b)));
    assert_eq!(
        store.op_outcome(b),
        OpOutcome::Refused(ErrorKind::TupleNotFound)
    );

    // the physical remove happens on b's release
    store.commit_op(b).unwrap();
    assert_eq!(store.no_of_elements(root), 0);
    assert_eq!(
        read_outcome(&mut store, root, tx(22), &key, hash),
        OpOutcome::Refused(ErrorKind::TupleNotFound)
    );
    store.check_integrity(root);
}

/// Same transaction shares its own lock: read after own update succeeds
/// immediately, in the parallel queue.
#[test]
fn test_same_transaction_parallel_queue() {
    setup();
    let mut store = new_store("parq");
    let root = default_root(&mut store);

    let key = [0x55, 0x66];
    let hash = 0xA0;
    insert_committed(&mut store, root, tx(1), &key, hash);

    let upd = store
        .exec_op(root, OpRequest::update(tx(30), &key, hash))
        .unwrap();
    assert!(matches!(store.op_outcome(upd), OpOutcome::Done(_)));

    let rd = store
        .exec_op(root, OpRequest::read(tx(30), &key, hash))
        .unwrap();
    assert!(matches!(store.op_outcome(rd), OpOutcome::Done(_)));

    store.commit_op(rd).unwrap();
    store.commit_op(upd).unwrap();
    store.check_integrity(root);
}

/// Reading a key the same transaction already deleted reports
/// TupleNotFound; insert behind the own delete revives the slot.
#[test]
fn test_write_after_delete_in_same_transaction() {
    setup();
    let mut store = new_store("wad");
    let root = default_root(&mut store);

    let key = [0x77, 0x88];
    let hash = 0xB0;
    insert_committed(&mut store, root, tx(1), &key, hash);

    let del = store
        .exec_op(root, OpRequest::delete(tx(40), &key, hash))
        .unwrap();
    assert!(matches!(store.op_outcome(del), OpOutcome::Done(_)));

    // reading our own deletion fails
    let rd = store
        .exec_op(root, OpRequest::read(tx(40), &key, hash))
        .unwrap();
    assert_eq!(
        store.op_outcome(rd),
        OpOutcome::Refused(ErrorKind::TupleNotFound)
    );

    // inserting behind our own delete revives the element
    let ins = store
        .exec_op(root, OpRequest::insert(tx(40), &key, hash))
        .unwrap();
    assert!(matches!(store.op_outcome(ins), OpOutcome::Done(_)));

    store.commit_op(rd).unwrap();
    store.commit_op(del).unwrap();
    store.commit_op(ins).unwrap();

    assert_eq!(store.no_of_elements(root), 1);
    assert!(matches!(
        read_outcome(&mut store, root, tx(41), &key, hash),
        OpOutcome::Done(_)
    ));
    store.check_integrity(root);
}

/// Lock upgrade: the last foreign reader leaves, and a same-transaction
/// writer waiting at the serial head is spliced into the owning group.
#[test]
fn test_lock_upgrade_on_reader_exit() {
    setup();
    let mut store = new_store("upgrade");
    let root = default_root(&mut store);

    let key = [0x99, 0xAA];
    let hash = 0xC0;
    insert_committed(&mut store, root, tx(1), &key, hash);

    // two shared readers of different transactions co-own the lock
    let t_read = store
        .exec_op(root, OpRequest::read(tx(50), &key, hash))
        .unwrap();
    let u_read = store
        .exec_op(root, OpRequest::read(tx(51), &key, hash))
        .unwrap();
    assert!(matches!(store.op_outcome(t_read), OpOutcome::Done(_)));
    assert!(matches!(store.op_outcome(u_read), OpOutcome::Done(_)));

    // the first reader's transaction now wants to write: it must wait
    // for the other reader
    let t_write = store
        .exec_op(root, OpRequest::update(tx(50), &key, hash))
        .unwrap();
    assert_eq!(store.op_outcome(t_write), OpOutcome::Pending);

    // the foreign reader leaves; the write is upgraded in place
    store.commit_op(u_read).unwrap();
    assert_eq!(store.take_event(), Some(StoreEvent::OpReady(t_write)));
    assert!(matches!(store.op_outcome(t_write), OpOutcome::Done(_)));

    store.commit_op(t_read).unwrap();
    store.commit_op(t_write).unwrap();
    store.check_integrity(root);
}

/// Aborting a pending delete leaves the element exactly as it was.
#[test]
fn test_delete_abort_restores_element() {
    setup();
    let mut store = new_store("delabort");
    let root = default_root(&mut store);

    let key = [0xBB, 0xCC];
    let hash = 0xD0;
    let lk = insert_committed(&mut store, root, tx(1), &key, hash);

    let del = store
        .exec_op(root, OpRequest::delete(tx(60), &key, hash))
        .unwrap();
    assert!(matches!(store.op_outcome(del), OpOutcome::Done(_)));
    store.abort_op(del).unwrap();

    assert_eq!(store.no_of_elements(root), 1);
    assert_eq!(
        read_outcome(&mut store, root, tx(61), &key, hash),
        OpOutcome::Done(lk)
    );
    store.check_integrity(root);
}

/// Shared readers of different transactions co-own an unlocked element
/// without queueing.
#[test]
fn test_shared_readers_coexist() {
    setup();
    let mut store = new_store("shared");
    let root = default_root(&mut store);

    let key = [0xDD, 0xEE];
    let hash = 0xE0;
    insert_committed(&mut store, root, tx(1), &key, hash);

    let mut readers = Vec::new();
    for t in 0..5 {
        let mut req = OpRequest::read(tx(70 + t), &key, hash);
        req.lock_mode = LockMode::Shared;
        let op = store.exec_op(root, req).unwrap();
        assert!(matches!(store.op_outcome(op), OpOutcome::Done(_)));
        readers.push(op);
    }
    for op in readers {
        store.commit_op(op).unwrap();
    }
    store.check_integrity(root);
}
