#![allow(dead_code)]

use std::{cell::RefCell, path::PathBuf, rc::Rc, sync::Once};

use rand::Rng;
use small_hash::{
    error::SmallError,
    tuple_store::{MemTupleStore, TupleStore},
    types::LocalKey,
    Database, FragmentParams, HashStore, OpOutcome, OpRequest, StoreConfig, TransId,
};

static INIT: Once = Once::new();

/// Tests asserting on the process-wide search system take this lock so
/// the harness cannot interleave them.
pub fn search_sys_guard() -> std::sync::MutexGuard<'static, ()> {
    use once_cell::sync::Lazy;
    static LOCK: Lazy<std::sync::Mutex<()>> = Lazy::new(|| std::sync::Mutex::new(()));
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

/// # Conduct the initialization
///
/// - Setting up log configurations.
/// - Dropping every cached adaptive-hash guess.
pub fn setup() {
    INIT.call_once(small_hash::init_log);
    Database::reset();
}

/// A unique on-disk root per test so checkpoint files never collide.
pub fn test_dir(name: &str) -> PathBuf {
    let mut rng = rand::thread_rng();
    std::env::temp_dir().join(format!("small-hash-{}-{}", name, rng.gen::<u32>()))
}

/// Tuple manager shared between two store instances, so a restored store
/// can resolve the keys the original stored.
pub struct SharedTupleStore(pub Rc<RefCell<MemTupleStore>>);

impl TupleStore for SharedTupleStore {
    fn allocate(
        &mut self,
        table_id: u32,
        frag_id: u32,
        key: &[u32],
    ) -> Result<LocalKey, SmallError> {
        self.0.borrow_mut().allocate(table_id, frag_id, key)
    }

    fn deallocate(&mut self, table_id: u32, frag_id: u32, local_key: LocalKey) {
        self.0.borrow_mut().deallocate(table_id, frag_id, local_key)
    }

    fn read_pk(
        &self,
        table_id: u32,
        frag_id: u32,
        local_key: LocalKey,
        out: &mut [u32],
    ) -> Result<usize, SmallError> {
        self.0.borrow().read_pk(table_id, frag_id, local_key, out)
    }
}

pub fn new_store(name: &str) -> HashStore {
    HashStore::new(
        StoreConfig::with_root(test_dir(name)),
        Box::new(MemTupleStore::new()),
    )
}

pub fn new_shared_store(name: &str) -> (HashStore, Rc<RefCell<MemTupleStore>>, PathBuf) {
    let tuples = Rc::new(RefCell::new(MemTupleStore::new()));
    let dir = test_dir(name);
    let store = HashStore::new(
        StoreConfig::with_root(dir.clone()),
        Box::new(SharedTupleStore(Rc::clone(&tuples))),
    );
    (store, tuples, dir)
}

pub fn default_root(store: &mut HashStore) -> u32 {
    store.add_fragment(FragmentParams::default()).unwrap()
}

pub fn tx(n: u32) -> TransId {
    TransId(n, 0)
}

/// Insert and commit one key; panics unless it goes straight through.
pub fn insert_committed(
    store: &mut HashStore,
    root: u32,
    trans: TransId,
    key: &[u32],
    hash: u32,
) -> LocalKey {
    let op = store
        .exec_op(root, OpRequest::insert(trans, key, hash))
        .unwrap();
    let lk = match store.op_outcome(op) {
        OpOutcome::Done(lk) => lk,
        other => panic!("insert did not complete: {:?}", other),
    };
    store.commit_op(op).unwrap();
    lk
}

pub fn delete_committed(store: &mut HashStore, root: u32, trans: TransId, key: &[u32], hash: u32) {
    let op = store
        .exec_op(root, OpRequest::delete(trans, key, hash))
        .unwrap();
    match store.op_outcome(op) {
        OpOutcome::Done(_) => {}
        other => panic!("delete did not complete: {:?}", other),
    }
    store.commit_op(op).unwrap();
}

/// Read one key; commits on success, aborts on refusal.
pub fn read_outcome(
    store: &mut HashStore,
    root: u32,
    trans: TransId,
    key: &[u32],
    hash: u32,
) -> OpOutcome {
    let op = store
        .exec_op(root, OpRequest::read(trans, key, hash))
        .unwrap();
    let outcome = store.op_outcome(op);
    match outcome {
        OpOutcome::Done(_) => store.commit_op(op).unwrap(),
        _ => store.abort_op(op).unwrap(),
    }
    outcome
}

/// Fill the store with `n` committed keys routed to local fragment 0
/// (even hashes). Key `i` is `[i, 0xABCD]` with hash `2 * i`.
pub fn fill_even(store: &mut HashStore, root: u32, n: u32) {
    for i in 0..n {
        insert_committed(store, root, tx(1000 + i), &[i, 0xABCD], 2 * i);
        store.run();
    }
}
