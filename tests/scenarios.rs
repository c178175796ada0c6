//! Concrete end-to-end scenarios run against `HeapPool`, each exercising
//! one behavior of the tree as a whole rather than one module in
//! isolation.

use bztree_pm::{BzConfig, ByteCompare, Error, HeapPool, PmPool, Tree};
use std::sync::Arc;

const W: usize = 4;
const M: usize = 16;

fn fresh(cfg: BzConfig) -> Tree<HeapPool, W, M> {
    let pool = Arc::new(HeapPool::new(1 << 22).unwrap());
    Tree::first_use(pool, cfg, Box::new(ByteCompare)).unwrap()
}

#[test]
fn single_threaded_insert_and_read_sweep() {
    let tree = fresh(BzConfig::test_config());
    for k in 0u32..64 {
        tree.insert(&k.to_be_bytes(), &(k * 10).to_le_bytes()).unwrap();
    }
    for k in 0u32..64 {
        let got = tree.read(&k.to_be_bytes()).unwrap();
        assert_eq!(u32::from_le_bytes(got.try_into().unwrap()), k * 10);
    }
}

#[test]
fn duplicate_key_is_rejected_without_disturbing_the_original() {
    let tree = fresh(BzConfig::test_config());
    tree.insert(&7u32.to_be_bytes(), &70u32.to_le_bytes()).unwrap();
    assert!(matches!(
        tree.insert(&7u32.to_be_bytes(), &77u32.to_le_bytes()).unwrap_err(),
        Error::EUniqueKey
    ));
    let got = tree.read(&7u32.to_be_bytes()).unwrap();
    assert_eq!(u32::from_le_bytes(got.try_into().unwrap()), 70);
}

#[test]
fn update_path_round_trips_and_rejects_missing_keys() {
    let tree = fresh(BzConfig::test_config());
    tree.insert(&9u32.to_be_bytes(), &90u32.to_le_bytes()).unwrap();
    tree.update(&9u32.to_be_bytes(), &99u32.to_le_bytes()).unwrap();
    let got = tree.read(&9u32.to_be_bytes()).unwrap();
    assert_eq!(u32::from_le_bytes(got.try_into().unwrap()), 99);

    assert!(matches!(
        tree.update(&10u32.to_be_bytes(), &0u32.to_le_bytes()).unwrap_err(),
        Error::ENotFound
    ));
}

#[test]
fn consolidate_trigger_keeps_the_tree_correct_after_heavy_deletion() {
    let mut cfg = BzConfig::test_config();
    // two 8-byte records' worth of delete debt is enough to demand a
    // consolidate the next time this leaf is touched
    cfg.max_delete = 2 * 8;
    let tree = fresh(cfg);

    tree.insert(&1u32.to_be_bytes(), &1u32.to_le_bytes()).unwrap();
    tree.insert(&2u32.to_be_bytes(), &2u32.to_le_bytes()).unwrap();
    tree.remove(&1u32.to_be_bytes()).unwrap();
    tree.remove(&2u32.to_be_bytes()).unwrap();
    tree.insert(&3u32.to_be_bytes(), &3u32.to_le_bytes()).unwrap();
    tree.finish();

    assert!(matches!(tree.read(&1u32.to_be_bytes()).unwrap_err(), Error::ENotFound));
    assert!(matches!(tree.read(&2u32.to_be_bytes()).unwrap_err(), Error::ENotFound));
    let got = tree.read(&3u32.to_be_bytes()).unwrap();
    assert_eq!(u32::from_le_bytes(got.try_into().unwrap()), 3);
}

#[test]
fn split_keeps_every_key_readable_across_the_new_root() {
    let mut cfg = BzConfig::test_config();
    cfg.split_threshold = 6 * 8;
    let tree = fresh(cfg);
    for k in 0u32..7 {
        tree.insert(&k.to_be_bytes(), &k.to_le_bytes()).unwrap();
    }
    for k in 0u32..7 {
        let got = tree.read(&k.to_be_bytes()).unwrap();
        assert_eq!(u32::from_le_bytes(got.try_into().unwrap()), k);
    }
}

/// Forges the exact target-word state a crash between `finalize`
/// (status decided SUCCESS) and `install finals` would leave behind on
/// a 2-word reservation — both target words still carry the MD's own
/// MwCAS|DIRTY tag, `status` is already `ST_SUCCESS` — and asserts
/// `recovery` rolls both words forward to their post-values with no
/// live commit in progress.
#[test]
fn crash_mid_commit_is_completed_by_recovery() {
    use bztree_pm::mem::word;
    use bztree_pm::pmwcas::descriptor::{state_of, ST_FREE, ST_SUCCESS};
    use bztree_pm::pmwcas::{PmwcasPool, RecyclePolicy};
    use bztree_pm::rp::RP;
    use core::sync::atomic::{AtomicU64, Ordering};

    let pool = Arc::new(HeapPool::new(1 << 20).unwrap());
    bztree_pm::rp::set_base(pool.base());
    let cfg = BzConfig::test_config();
    let engine = PmwcasPool::<HeapPool, 4>::new(pool.clone(), &cfg).unwrap();

    let layout = core::alloc::Layout::new::<AtomicU64>();
    let a_ptr = unsafe { pool.alloc(layout) }.unwrap() as *mut AtomicU64;
    let b_ptr = unsafe { pool.alloc(layout) }.unwrap() as *mut AtomicU64;
    unsafe {
        a_ptr.write(AtomicU64::new(1));
        b_ptr.write(AtomicU64::new(2));
    }
    let a: RP<AtomicU64> = unsafe { RP::from_abs(a_ptr as *const AtomicU64) };
    let b: RP<AtomicU64> = unsafe { RP::from_abs(b_ptr as *const AtomicU64) };

    let md_rp = engine.alloc(RecyclePolicy::None).unwrap();
    unsafe {
        engine.add(md_rp, a, 1, 42, RecyclePolicy::None).unwrap();
        engine.add(md_rp, b, 2, 43, RecyclePolicy::None).unwrap();
    }

    let md = unsafe { md_rp.as_ref() };
    let tagged = word::with_dirty(word::as_mwcas(md_rp.offset()));
    unsafe { a.as_ref() }.store(tagged, Ordering::Relaxed);
    unsafe { b.as_ref() }.store(tagged, Ordering::Relaxed);
    md.status.store(ST_SUCCESS, Ordering::Relaxed);

    engine.recovery(&|_| {});

    assert_eq!(unsafe { a.as_ref() }.load(Ordering::Acquire), 42);
    assert_eq!(unsafe { b.as_ref() }.load(Ordering::Acquire), 43);
    assert_eq!(state_of(md.status.load(Ordering::Acquire)), ST_FREE);
}
