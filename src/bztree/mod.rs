//! The BzTree index proper: node layout, binary search with holes,
//! root-to-leaf traversal, leaf record operations, and the structure
//! modification operations (consolidate/split/merge) that keep a tree
//! balanced, all built on [`crate::pmwcas`].

pub mod key;
pub mod leaf;
pub mod node;
pub mod search;
pub mod smo;
pub mod traverse;

pub use key::{ByteCompare, KeyCompare, MAX_KEY, MIN_KEY};
pub use node::Node;

use crate::alloc::NodeAllocator;
use crate::config::BzConfig;
use crate::error::{Error, Result};
use crate::pm::PmPool;
use crate::pmwcas::PmwcasPool;
use crate::rp::RP;
use crate::sync::{Ebr, EpochBuckets};
use smo::SmoDecision;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use traverse::Traversal;

/// A persistent, lock-free key-value index: a [`crate::pmwcas`]-backed
/// BzTree over a [`PmPool`]-provided byte-addressable region.
///
/// `W` bounds how many words a single PMwCAS may touch (interior SMO
/// repoints need only 1, leaf `update` needs 3 — `W >= 3` covers every
/// operation this crate performs). `M` bounds how many records a single
/// node may hold (see [`Node::HEADER_SIZE`]).
pub struct Tree<P: PmPool, const W: usize, const M: usize> {
    /// kept only to hold the backing region alive for as long as the
    /// tree exists; every access goes through `rp::RP`, not this field
    #[allow(dead_code)]
    pool: Arc<P>,
    pmwcas: PmwcasPool<P, W>,
    alloc: NodeAllocator<P>,
    cfg: BzConfig,
    cmp: Box<dyn KeyCompare>,
    root: AtomicU64,
    ebr: Ebr,
    retired: EpochBuckets<RP<u8>>,
}

impl<P: PmPool, const W: usize, const M: usize> Tree<P, W, M> {
    /// Build a tree over a PM region that has never held one before:
    /// allocates the PMwCAS descriptor pool and pre-fills the node
    /// allocator's ring. The tree starts empty (`root` is null).
    pub fn first_use(pool: Arc<P>, cfg: BzConfig, cmp: Box<dyn KeyCompare>) -> Result<Self> {
        assert!(
            traverse::MAX_PATH_DEPTH >= cfg.max_path_depth,
            "logic,configured max_path_depth exceeds the compiled-in traversal stack capacity"
        );
        crate::rp::set_base(pool.base());
        let pmwcas = PmwcasPool::new(pool.clone(), &cfg)?;
        let alloc = NodeAllocator::new(pool.clone(), &cfg)?;
        log::info!("bztree first_use: node_size={} M={}", cfg.node_size, M);
        Ok(Self {
            pool,
            pmwcas,
            alloc,
            cfg,
            cmp,
            root: AtomicU64::new(0),
            ebr: Ebr::new(),
            retired: EpochBuckets::new(),
        })
    }

    /// Attach to a PM region an earlier process already ran
    /// [`Tree::first_use`] against.
    ///
    /// This crate's [`PmPool`] implementations are non-durable test/demo
    /// backing stores (see [`crate::pm::HeapPool`]) — there is no real
    /// "previous process" to reattach to, and the descriptor pool/node
    /// allocator's layout is not itself persisted in a rediscoverable
    /// form. A genuinely durable backing store would need the pool's
    /// base offsets written to a fixed, well-known location so `init`
    /// could read them back instead of rebuilding from scratch; until
    /// one exists, `init` behaves identically to `first_use`.
    pub fn init(pool: Arc<P>, cfg: BzConfig, cmp: Box<dyn KeyCompare>) -> Result<Self> {
        Self::first_use(pool, cfg, cmp)
    }

    /// Run the PMwCAS recovery sweep: complete or roll back every
    /// in-flight multi-word CAS left behind by a crash mid-commit.
    /// Node blocks a `ReleaseNewOnFailed`/`ReleaseExpOnSuccess` policy
    /// frees during recovery are returned straight to the allocator —
    /// there are no concurrent readers during recovery to wait out.
    pub fn recovery(&self) {
        let alloc = &self.alloc;
        self.pmwcas.recovery(&|off| {
            if off != 0 {
                alloc.release(RP::from_offset(off));
            }
        });
    }

    /// Drain any records still pending garbage collection and release
    /// them to the allocator. Intended as an orderly shutdown step; the
    /// tree remains usable afterward (nothing about it is consumed).
    pub fn finish(&self) {
        let (_, gc_epoch) = self.ebr.sync();
        for rp in self.retired.collect(gc_epoch) {
            self.alloc.release(rp);
        }
    }

    fn node(&self, off: u64) -> &Node<M> {
        // SAFETY: every offset reachable from `root` or a path entry was
        // published by a successful PMwCAS and is kept alive by the
        // caller's EBR guard.
        unsafe { RP::<Node<M>>::from_offset(off).as_ref() }
    }

    fn new_empty_leaf(&self) -> Result<RP<u8>> {
        let raw = self.alloc.acquire()?;
        // SAFETY: `raw` was just claimed from the allocator, exclusively ours
        unsafe { Node::<M>::init_empty(raw.cast::<Node<M>>().as_ptr(), self.alloc.node_size(), true) };
        Ok(raw)
    }

    fn retire(&self, off: u64) {
        if off == 0 {
            return;
        }
        self.retired.retire(self.ebr.staging_epoch(), RP::from_offset(off));
    }

    fn node_allocator_fn(&self) -> impl Fn() -> Result<RP<u8>> + '_ {
        move || self.alloc.acquire()
    }

    /// the path entry one level above `depth` (`depth == t.path.len()` is
    /// the leaf; `depth` in `0..t.path.len()` is the interior node at
    /// `t.path[depth]`). `None` means `depth`'s node is itself the root —
    /// its parent is the root word, not a path entry.
    fn parent_of<'a>(t: &'a Traversal<M>, depth: usize) -> Option<&'a traverse::PathEntry<M>> {
        if depth == 0 {
            None
        } else {
            Some(&t.path[depth - 1])
        }
    }

    /// After a leaf op succeeds, opportunistically run whatever SMO each
    /// node on the path wants — the leaf first, then every interior
    /// ancestor, deepest first, so a routing-record insert that just
    /// filled a parent gets noticed and split in the same pass rather
    /// than waiting on a future operation to stumble onto it. A lost
    /// race (someone else already fixed it, or the node changed
    /// underneath us) is not an error: the next operation through this
    /// path will see the current state and decide again.
    fn maybe_smo_path(&self, t: &Traversal<M>, leaf_off: u64) {
        self.maybe_smo(t, t.path.len(), leaf_off);
        for depth in (0..t.path.len()).rev() {
            let node_off = t.path[depth].node.offset();
            self.maybe_smo(t, depth, node_off);
        }
    }

    fn maybe_smo(&self, t: &Traversal<M>, depth: usize, node_off: u64) {
        let node = self.node(node_off);
        let is_root = depth == 0;
        match smo::decide(node, &self.cfg, is_root) {
            SmoDecision::None => {}
            SmoDecision::Consolidate => {
                let alloc_fn = self.node_allocator_fn();
                if let Ok(new_off) = smo::consolidate(node, &self.pmwcas, &alloc_fn, &*self.cmp) {
                    if self.repoint(t, depth, node_off, new_off) {
                        self.retire(node_off);
                    } else {
                        self.retire(new_off);
                    }
                }
            }
            SmoDecision::Split => {
                let alloc_fn = self.node_allocator_fn();
                if let Ok((left_off, right_off, sep)) =
                    smo::split(node, &self.pmwcas, &alloc_fn, &*self.cmp)
                {
                    self.publish_split(t, depth, node_off, left_off, right_off, &sep);
                }
            }
            SmoDecision::Merge => {
                self.try_merge(t, depth, node_off);
            }
        }
    }

    /// repoint `old_off` to `new_off` wherever it's currently reachable
    /// from (the root word if the node at `depth` is the root, else the
    /// parent slot recorded in `t`). Returns whether the repoint won.
    fn repoint(&self, t: &Traversal<M>, depth: usize, old_off: u64, new_off: u64) -> bool {
        match Self::parent_of(t, depth) {
            None => self
                .root
                .compare_exchange(old_off, new_off, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
            Some(p) => {
                let parent = self.node(p.node.offset());
                smo::repoint_child(parent, p.slot, old_off, new_off, &self.pmwcas).unwrap_or(false)
            }
        }
    }

    fn publish_split(&self, t: &Traversal<M>, depth: usize, old_off: u64, left_off: u64, right_off: u64, sep: &[u8]) {
        match Self::parent_of(t, depth) {
            None => {
                // the node at `depth` was itself the root (a leaf-root or
                // an interior root); grow a new interior root over the
                // two halves
                let Ok(raw) = self.alloc.acquire() else { return };
                let entries = [(key::MIN_KEY.to_vec(), left_off), (sep.to_vec(), right_off)];
                // SAFETY: `raw` was just claimed, exclusively ours
                if unsafe { smo::build_interior::<M>(raw, self.alloc.node_size(), &entries) }.is_err() {
                    self.alloc.release(raw);
                    return;
                }
                if self
                    .root
                    .compare_exchange(old_off, raw.offset(), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.retire(old_off);
                } else {
                    self.alloc.release(raw);
                    self.retire(left_off);
                    self.retire(right_off);
                }
            }
            Some(p) => {
                let parent = self.node(p.node.offset());
                if !smo::repoint_child(parent, p.slot, old_off, left_off, &self.pmwcas).unwrap_or(false) {
                    self.retire(left_off);
                    self.retire(right_off);
                    return;
                }
                // depth - 1 is p's own index in `t.path` — insert the new
                // separator/right-child record there, cascading into a
                // parent split (and so on up the path) if it's full.
                self.insert_routing_record(t, depth - 1, sep, right_off);
                self.retire(old_off);
            }
        }
    }

    /// insert `(sep, child_off)` as a routing record into the interior
    /// node at `t.path[parent_depth]`. A full parent is split in place
    /// (cascading further up the path via [`Tree::publish_split`] if
    /// *its* parent is also full) rather than left to silently orphan
    /// `child_off` — the record is retried into whichever half of the
    /// freshly split parent now covers `sep`.
    fn insert_routing_record(&self, t: &Traversal<M>, parent_depth: usize, sep: &[u8], child_off: u64) {
        let parent_off = t.path[parent_depth].node.offset();
        let parent = self.node(parent_off);
        let value = child_off.to_le_bytes();
        match leaf::insert(parent, sep, &value, &self.pmwcas, &*self.cmp) {
            Ok(()) => {}
            Err(Error::EAllocSize) | Err(Error::ENoSpace) => {
                let alloc_fn = self.node_allocator_fn();
                let Ok((left_off, right_off, mid_sep)) =
                    smo::split(parent, &self.pmwcas, &alloc_fn, &*self.cmp)
                else {
                    log::warn!("routing record insert found a full parent but splitting it also failed; child unreachable pending a future consolidate");
                    return;
                };
                self.publish_split(t, parent_depth, parent_off, left_off, right_off, &mid_sep);
                let target_off = if self.cmp.compare(sep, &mid_sep) != core::cmp::Ordering::Less {
                    right_off
                } else {
                    left_off
                };
                let target = self.node(target_off);
                if let Err(e) = leaf::insert(target, sep, &value, &self.pmwcas, &*self.cmp) {
                    log::warn!("routing record insert into freshly split parent half failed ({e}); child unreachable pending a future consolidate");
                }
            }
            Err(e) => {
                log::warn!("routing record insert into parent lost a race ({e}); child unreachable pending a future consolidate");
            }
        }
    }

    fn try_merge(&self, t: &Traversal<M>, depth: usize, node_off: u64) {
        let Some(p) = Self::parent_of(t, depth) else { return };
        let parent = self.node(p.node.offset());
        let rc = parent.rec_count();
        let sibling_slot = if p.slot + 1 < rc {
            p.slot + 1
        } else if p.slot > 0 {
            p.slot - 1
        } else {
            return;
        };
        if sibling_slot >= parent.rec_count() || !parent.meta_fields(sibling_slot).visible {
            return;
        }
        // SAFETY: `sibling_slot` was just validated as a visible record
        let sibling_off = unsafe { parent.record_child_offset(sibling_slot) };
        let node = self.node(node_off);
        let sibling = self.node(sibling_off);

        let alloc_fn = self.node_allocator_fn();
        let Ok(merged_off) = smo::merge_with_sibling(node, sibling, &self.pmwcas, &alloc_fn, &*self.cmp)
        else {
            return;
        };

        if !smo::repoint_child(parent, p.slot, node_off, merged_off, &self.pmwcas).unwrap_or(false) {
            self.retire(merged_off);
            return;
        }
        // SAFETY: `sibling_slot` was read from `parent` just above and is
        // a currently-visible record
        let sibling_key = unsafe { parent.record_key(sibling_slot) }.to_vec();
        let _ = leaf::delete(parent, &sibling_key, &self.pmwcas, &*self.cmp);
        self.retire(node_off);
        self.retire(sibling_off);
    }

    /// run `op` against the current leaf for `key`, retrying from the
    /// root on a lost race (frozen node, concurrent SMO) and creating an
    /// empty root the first time the tree is used.
    fn with_leaf<T>(&self, key: &[u8], op: impl Fn(&Node<M>) -> Result<T>) -> Result<T> {
        self.ebr.register();
        loop {
            let _guard = self.ebr.enter();
            // SAFETY: the EBR guard above keeps every node reachable from
            // `root` at this instant alive for the rest of this iteration
            let t = match unsafe { traverse::traverse::<M>(&self.root, key, &*self.cmp) } {
                Ok(t) => t,
                Err(Error::ENotFound) if self.root.load(Ordering::Acquire) == 0 => {
                    let Ok(raw) = self.new_empty_leaf() else {
                        return Err(Error::ENoSpace);
                    };
                    if self
                        .root
                        .compare_exchange(0, raw.offset(), Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        // another thread already created the root first
                        self.alloc.release(raw);
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };
            let leaf = self.node(t.leaf.offset());
            match op(leaf) {
                Ok(v) => {
                    self.maybe_smo_path(&t, t.leaf.offset());
                    return Ok(v);
                }
                Err(Error::EFrozen) | Err(Error::ERace) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.with_leaf(key, |leaf| leaf::insert(leaf, key, value, &self.pmwcas, &*self.cmp))
    }

    pub fn update(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.with_leaf(key, |leaf| leaf::update(leaf, key, value, &self.pmwcas, &*self.cmp))
    }

    pub fn upsert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.with_leaf(key, |leaf| leaf::upsert(leaf, key, value, &self.pmwcas, &*self.cmp))
    }

    pub fn remove(&self, key: &[u8]) -> Result<()> {
        self.with_leaf(key, |leaf| leaf::delete(leaf, key, &self.pmwcas, &*self.cmp))
    }

    pub fn read(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.ebr.register();
        let _guard = self.ebr.enter();
        // SAFETY: the guard above keeps the traversed path alive
        let t = unsafe { traverse::traverse::<M>(&self.root, key, &*self.cmp) }?;
        let leaf = self.node(t.leaf.offset());
        leaf::read(leaf, key, &*self.cmp)
    }

    /// collect every visible `(key, value)` pair with key in `[lo, hi)`.
    ///
    /// Walks leaves left to right by re-traversing from the root with an
    /// advancing lower bound rather than following leaf sibling pointers
    /// (the node layout carries none) — the same no-parent-pointers,
    /// re-traverse-to-move-sideways approach the tree already uses for
    /// merge's sibling lookup.
    pub fn range_scan(&self, lo: &[u8], hi: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.ebr.register();
        let mut out = Vec::new();
        let mut cursor = lo.to_vec();
        loop {
            let _guard = self.ebr.enter();
            // SAFETY: the guard above keeps this iteration's leaf alive
            let t = match unsafe { traverse::traverse::<M>(&self.root, &cursor, &*self.cmp) } {
                Ok(t) => t,
                Err(Error::ENotFound) => break,
                Err(e) => return Err(e),
            };
            let leaf = self.node(t.leaf.offset());
            let batch = leaf::range_scan_leaf(leaf, &cursor, hi, &*self.cmp);
            if batch.is_empty() {
                break;
            }
            let last_key = batch.last().unwrap().0.clone();
            out.extend(batch);
            if self.cmp.compare(&last_key, hi) != core::cmp::Ordering::Less {
                break;
            }
            // advance one past the last key this leaf produced, so the
            // next traversal lands past it even without a sibling link
            cursor = last_key;
            cursor.push(0);
        }
        Ok(out)
    }
}
