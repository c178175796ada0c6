//! Property-style laws the tree must uphold regardless of access
//! pattern, plus one concurrency smoke test exercising several writers
//! racing through the same leaf and its SMOs at once.

use bztree_pm::{BzConfig, ByteCompare, Error, HeapPool, Tree};
use std::sync::Arc;
use std::thread;

const W: usize = 4;
const M: usize = 16;

fn fresh() -> Arc<Tree<HeapPool, W, M>> {
    let pool = Arc::new(HeapPool::new(1 << 22).unwrap());
    Arc::new(Tree::first_use(pool, BzConfig::test_config(), Box::new(ByteCompare)).unwrap())
}

#[test]
fn insert_then_read_round_trips_without_an_intervening_write() {
    let tree = fresh();
    tree.insert(b"alpha", b"one").unwrap();
    assert_eq!(tree.read(b"alpha").unwrap(), b"one");
    // a read of an unrelated key doesn't count as an intervening write
    let _ = tree.read(b"beta");
    assert_eq!(tree.read(b"alpha").unwrap(), b"one");
}

#[test]
fn delete_is_idempotent_in_the_ok_then_not_found_sense() {
    let tree = fresh();
    tree.insert(b"k", b"v").unwrap();
    tree.remove(b"k").unwrap();
    assert!(matches!(tree.remove(b"k").unwrap_err(), Error::ENotFound));
}

#[test]
fn upsert_behaves_as_insert_or_update_regardless_of_prior_state() {
    let tree = fresh();
    // no prior state: upsert behaves as insert
    tree.upsert(b"k", b"first").unwrap();
    assert_eq!(tree.read(b"k").unwrap(), b"first");
    // prior state present: upsert behaves as update
    tree.upsert(b"k", b"second").unwrap();
    assert_eq!(tree.read(b"k").unwrap(), b"second");
}

#[test]
fn range_scan_is_sorted_and_bound_respecting() {
    let tree = fresh();
    for i in 0u32..30 {
        tree.insert(&i.to_be_bytes(), &i.to_be_bytes()).unwrap();
    }
    let got = tree.range_scan(&10u32.to_be_bytes(), &20u32.to_be_bytes()).unwrap();
    let keys: Vec<u32> = got
        .iter()
        .map(|(k, _)| u32::from_be_bytes(k[..4].try_into().unwrap()))
        .collect();
    let mut sorted = keys.clone();
    sorted.sort_unstable();
    assert_eq!(keys, sorted, "range scan must return keys in ascending order");
    assert!(keys.iter().all(|&k| (10..20).contains(&k)));
    assert_eq!(keys, (10u32..20).collect::<Vec<_>>());
}

/// Insertion order shouldn't matter: shuffle a key range and insert it
/// out of order, then confirm every key is readable and a range scan
/// still comes back sorted regardless of the order records landed in
/// their leaves.
#[test]
fn shuffled_insertion_order_does_not_disturb_sorted_range_scans() {
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    let tree = fresh();
    let mut keys: Vec<u32> = (0u32..200).collect();
    let mut rng = rand::rngs::StdRng::seed_from_u64(0xB2_7A_EE_51);
    keys.shuffle(&mut rng);

    for &k in &keys {
        tree.insert(&k.to_be_bytes(), &k.to_le_bytes()).unwrap();
    }
    for &k in &keys {
        let got = tree.read(&k.to_be_bytes()).unwrap();
        assert_eq!(u32::from_le_bytes(got.try_into().unwrap()), k);
    }

    let got = tree.range_scan(&50u32.to_be_bytes(), &150u32.to_be_bytes()).unwrap();
    let scanned: Vec<u32> = got
        .iter()
        .map(|(k, _)| u32::from_be_bytes(k[..4].try_into().unwrap()))
        .collect();
    assert_eq!(scanned, (50u32..150).collect::<Vec<_>>());
}

/// Several threads insert disjoint key ranges into the same tree
/// concurrently, each racing the others' SMOs as the tree grows. Every
/// key either thread inserted must be readable with its own value once
/// all threads have joined — no reader may observe a torn PMwCAS or a
/// lost insert.
#[test]
fn concurrent_disjoint_inserts_are_all_readable_afterward() {
    let tree = fresh();
    let threads: Vec<_> = (0u32..4)
        .map(|t| {
            let tree = tree.clone();
            thread::spawn(move || {
                for i in 0u32..40 {
                    let k = t * 1000 + i;
                    tree.insert(&k.to_be_bytes(), &k.to_le_bytes()).unwrap();
                }
            })
        })
        .collect();
    for h in threads {
        h.join().unwrap();
    }

    for t in 0u32..4 {
        for i in 0u32..40 {
            let k = t * 1000 + i;
            let got = tree.read(&k.to_be_bytes()).unwrap();
            assert_eq!(u32::from_le_bytes(got.try_into().unwrap()), k);
        }
    }
}
