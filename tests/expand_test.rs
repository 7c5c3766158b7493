mod test_utils;

use small_hash::{FragmentParams, HashStore, MemTupleStore, OpOutcome, StoreConfig};
use test_utils::*;

fn growth_store(name: &str) -> (HashStore, u32) {
    let mut store = HashStore::new(
        StoreConfig::with_root(test_dir(name)),
        Box::new(MemTupleStore::new()),
    );
    let mut params = FragmentParams::default();
    params.max_load_factor = 2;
    params.min_load_factor = 1;
    let root = store.add_fragment(params).unwrap();
    (store, root)
}

/// Driving the slack negative expands the table bucket by bucket, and
/// every key stays reachable across the splits.
#[test]
fn test_expand_keeps_keys_reachable() {
    setup();
    let (mut store, root) = growth_store("expand");

    let n = 200u32;
    fill_even(&mut store, root, n);

    let (buckets0, buckets1) = store.bucket_count(root);
    assert!(buckets0 > 64, "fragment 0 never expanded: {}", buckets0);
    assert_eq!(buckets1, 64);

    for i in 0..n {
        let got = read_outcome(&mut store, root, tx(1), &[i, 0xABCD], 2 * i);
        assert!(matches!(got, OpOutcome::Done(_)), "key {} lost", i);
    }
    store.check_integrity(root);
}

/// An expand crossing `p == maxp` doubles the address range and resets
/// the split pointer.
#[test]
fn test_expand_doubles_across_maxp() {
    setup();
    let (mut store, root) = growth_store("double");

    // enough committed inserts to push past 128 buckets on fragment 0
    fill_even(&mut store, root, 300);
    store.run();

    let (buckets0, _) = store.bucket_count(root);
    assert!(buckets0 > 128, "no doubling happened: {}", buckets0);
    store.check_integrity(root);
}

/// Deleting most keys shrinks the table back and releases the emptied
/// tail pages; expand and shrink stay inverse of each other.
#[test]
fn test_shrink_after_deletes() {
    setup();
    let (mut store, root) = growth_store("shrink");

    let n = 200u32;
    fill_even(&mut store, root, n);
    store.run();
    let (expanded, _) = store.bucket_count(root);
    assert!(expanded > 64);

    for i in 0..n {
        delete_committed(&mut store, root, tx(2000 + i), &[i, 0xABCD], 2 * i);
        store.run();
    }
    let (after, _) = store.bucket_count(root);
    assert!(after < expanded, "table never shrank: {}", after);
    assert_eq!(store.no_of_elements(root), 0);
    store.check_integrity(root);
}

/// Overfilling one bucket spills its chain onto an overflow page, and
/// emptying it hands the page back.
#[test]
fn test_bucket_overflow_page_lifecycle() {
    setup();
    let mut store = new_store("overflow");
    let mut params = FragmentParams::default();
    // large load factors so no expand interferes
    params.max_load_factor = 1000;
    params.min_load_factor = 500;
    let root = store.add_fragment(params).unwrap();

    // a bucket page carries at most 64 container halves of 13 two-word
    // elements for one chain; push past that so the chain spills onto a
    // fresh overflow page
    let n = 1000u32;
    for i in 0..n {
        // same bucket: identical low hash bits, distinct keys
        let hash = (i << 13) | 0x24;
        insert_committed(&mut store, root, tx(100 + i), &[0x5000 + i, 7], hash);
    }
    for i in 0..n {
        let hash = (i << 13) | 0x24;
        let got = read_outcome(&mut store, root, tx(1), &[0x5000 + i, 7], hash);
        assert!(matches!(got, OpOutcome::Done(_)), "key {} lost in chain", i);
    }
    store.check_integrity(root);

    for i in 0..n {
        let hash = (i << 13) | 0x24;
        delete_committed(&mut store, root, tx(200 + i), &[0x5000 + i, 7], hash);
    }
    assert_eq!(store.no_of_elements(root), 0);
    store.check_integrity(root);
}

/// Expand followed by the inverse shrink restores the bucket layout.
#[test]
fn test_expand_then_shrink_round_trip() {
    setup();
    let (mut store, root) = growth_store("roundtrip");

    fill_even(&mut store, root, 140);
    store.run();
    let (expanded, _) = store.bucket_count(root);
    assert!(expanded > 64);

    for i in 0..140 {
        delete_committed(&mut store, root, tx(3000 + i), &[i, 0xABCD], 2 * i);
        store.run();
    }
    let (after, _) = store.bucket_count(root);
    assert_eq!(after, 64, "layout did not return to the initial size");
    store.check_integrity(root);
}
