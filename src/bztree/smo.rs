/*!
    # Structure modification operations

    [`decide`] inspects a node's live size and freshness and names what
    it wants done; [`consolidate`], [`split`], and [`merge_with_sibling`]
    do it. Every SMO freezes its input node(s) with a single-word PMwCAS
    on `status` first — once frozen, no further leaf op can land on that
    node, so every subsequent step runs against an immutable snapshot and
    only needs to win one more PMwCAS: the parent-slot (or root) repoint
    that publishes the replacement.

    A lost race on the freeze, the repoint, or the node allocator simply
    means another thread already performed (or is performing) the same
    SMO; the caller treats that as success-by-someone-else and moves on,
    matching the original's cooperative-helping stance on SMOs.

    Only single-level merge is implemented: two sibling leaves directly
    under the same parent collapse into one. Cascading underflow (the
    parent itself becoming underfull and needing to merge with *its*
    sibling) is not propagated further up the tree — a deliberate scope
    cut recorded in `DESIGN.md`, not a correctness gap for the covered
    depths.
*/

use crate::bztree::key::KeyCompare;
use crate::bztree::leaf::live_records;
use crate::bztree::node::{pack_length, pack_status, LengthFields, Node, StatusFields};
use crate::config::BzConfig;
use crate::error::{Error, Result};
use crate::pm::PmPool;
use crate::pmwcas::{PmwcasPool, RecyclePolicy};
use crate::rp::RP;
use core::sync::atomic::AtomicU64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmoDecision {
    None,
    Consolidate,
    Split,
    Merge,
}

/// what, if anything, `node` wants done — mirrors the original's
/// `triger_consolidate`: oversized live data wants a split, undersized
/// wants a merge (subject to the caller knowing whether this node is the
/// root, in which case merge never applies), and fragmentation (too
/// little free space or too much accumulated delete debt) wants a plain
/// consolidate.
pub fn decide<const M: usize>(node: &Node<M>, cfg: &BzConfig, is_root: bool) -> SmoDecision {
    let sf = node.status_fields();
    if sf.frozen {
        return SmoDecision::None;
    }
    let live = node.live_size();
    if live > cfg.split_threshold {
        return SmoDecision::Split;
    }
    if !is_root && live <= cfg.merge_threshold {
        return SmoDecision::Merge;
    }
    if node.free_space() < cfg.min_free || sf.delete_size > cfg.max_delete {
        return SmoDecision::Consolidate;
    }
    SmoDecision::None
}

fn freeze<P: PmPool, const W: usize, const M: usize>(
    node: &Node<M>,
    pmwcas: &PmwcasPool<P, W>,
) -> Result<bool> {
    let sf = node.status_fields();
    if sf.frozen {
        return Ok(true);
    }
    let frozen_status = pack_status(StatusFields { frozen: true, ..sf });
    let md = pmwcas.alloc(RecyclePolicy::None)?;
    let word: RP<AtomicU64> = unsafe { RP::from_abs(&node.status as *const AtomicU64) };
    unsafe { pmwcas.add(md, word, pack_status(sf), frozen_status, RecyclePolicy::None)? };
    Ok(pmwcas.commit(md, &|_| {}))
}

/// build and initialize a brand-new node (leaf or interior, per
/// `is_leaf`) holding exactly `records`, sorted, from the allocator. The
/// node is not yet reachable from anywhere — the caller publishes it
/// with one more PMwCAS.
unsafe fn build_node<const M: usize>(
    raw: RP<u8>,
    node_size: u32,
    is_leaf: bool,
    records: &[(Vec<u8>, Vec<u8>)],
) -> Result<()> {
    let node = raw.cast::<Node<M>>().as_ptr();
    Node::init_empty(node, node_size, is_leaf);
    let node = &*node;

    let mut cursor = node_size;
    for (i, (k, v)) in records.iter().enumerate() {
        let total_len = k.len() + v.len();
        cursor -= total_len as u32;
        node.write_payload(cursor, k);
        node.write_payload(cursor + k.len() as u32, v);
        node.meta[i].store(
            crate::bztree::node::pack_meta(crate::bztree::node::MetaFields {
                visible: true,
                offset: cursor,
                key_len: k.len() as u16,
                total_len: total_len as u16,
            }),
            core::sync::atomic::Ordering::Relaxed,
        );
    }
    node.status.store(
        pack_status(StatusFields {
            frozen: false,
            rec_count: records.len() as u32,
            block_size: node_size - cursor,
            delete_size: 0,
        }),
        core::sync::atomic::Ordering::Relaxed,
    );
    node.length.store(
        pack_length(LengthFields {
            node_size,
            sorted_count: records.len() as u32,
            is_leaf,
        }),
        core::sync::atomic::Ordering::Relaxed,
    );
    Ok(())
}

/// freeze `node` and rebuild its live records into a fresh, compact
/// node. Returns the new node's raw offset for the caller to publish
/// into the parent slot (or root word) with a single-word PMwCAS.
pub fn consolidate<P: PmPool, const W: usize, const M: usize>(
    node: &Node<M>,
    pmwcas: &PmwcasPool<P, W>,
    alloc_fn: &dyn Fn() -> Result<RP<u8>>,
    cmp: &dyn KeyCompare,
) -> Result<u64> {
    if !freeze(node, pmwcas)? {
        return Err(Error::ERace);
    }
    let records = live_records(node, cmp);
    let raw = alloc_fn()?;
    // SAFETY: `raw` is a freshly claimed, exclusively-owned block
    unsafe { build_node::<M>(raw, node.node_size(), node.is_leaf(), &records)? };
    Ok(raw.offset())
}

/// freeze `node` and split its live records across two fresh nodes at
/// the median key. Returns `(left_offset, right_offset, separator)`
/// where `separator` is the smallest key in the right node — the key a
/// parent slot for the right node must carry.
pub fn split<P: PmPool, const W: usize, const M: usize>(
    node: &Node<M>,
    pmwcas: &PmwcasPool<P, W>,
    alloc_fn: &dyn Fn() -> Result<RP<u8>>,
    cmp: &dyn KeyCompare,
) -> Result<(u64, u64, Vec<u8>)> {
    if !freeze(node, pmwcas)? {
        return Err(Error::ERace);
    }
    let records = live_records(node, cmp);
    if records.len() < 2 {
        return Err(Error::ENoNeed);
    }
    let mid = records.len() / 2;
    let (left_recs, right_recs) = records.split_at(mid);
    let separator = right_recs[0].0.clone();

    let left_raw = alloc_fn()?;
    let right_raw = alloc_fn()?;
    let is_leaf = node.is_leaf();
    // SAFETY: both blocks are freshly claimed and exclusively owned
    unsafe {
        build_node::<M>(left_raw, node.node_size(), is_leaf, left_recs)?;
        build_node::<M>(right_raw, node.node_size(), is_leaf, right_recs)?;
    }
    Ok((left_raw.offset(), right_raw.offset(), separator))
}

/// freeze both `a` and `b` (adjacent sibling leaves) and merge their
/// live records into one fresh node. Returns the merged node's offset.
pub fn merge_with_sibling<P: PmPool, const W: usize, const M: usize>(
    a: &Node<M>,
    b: &Node<M>,
    pmwcas: &PmwcasPool<P, W>,
    alloc_fn: &dyn Fn() -> Result<RP<u8>>,
    cmp: &dyn KeyCompare,
) -> Result<u64> {
    if !freeze(a, pmwcas)? || !freeze(b, pmwcas)? {
        return Err(Error::ERace);
    }
    let mut records = live_records(a, cmp);
    records.extend(live_records(b, cmp));
    records.sort_by(|x, y| cmp.compare(&x.0, &y.0));

    let raw = alloc_fn()?;
    // SAFETY: `raw` is a freshly claimed, exclusively-owned block
    unsafe { build_node::<M>(raw, a.node_size(), a.is_leaf(), &records)? };
    Ok(raw.offset())
}

/// swap an interior record's child pointer in place with a single-word
/// PMwCAS on the value bytes themselves (the key and meta entry are
/// untouched) — how a parent learns that one of its children was
/// replaced by consolidate/split/merge, without touching the parent's
/// record layout at all.
pub fn repoint_child<P: PmPool, const W: usize, const M: usize>(
    parent: &Node<M>,
    slot: u32,
    old_off: u64,
    new_off: u64,
    pmwcas: &PmwcasPool<P, W>,
) -> Result<bool> {
    let mf = parent.meta_fields(slot);
    if mf.total_len - mf.key_len != 8 {
        return Err(Error::EAllocSize);
    }
    let value_offset = mf.offset + mf.key_len as u32;
    let base = parent as *const Node<M> as *const u8;
    // SAFETY: `value_offset` addresses this record's 8-byte child-pointer
    // value, which is always 8-byte aligned since every record is placed
    // on an 8-byte boundary by `build_node`/`build_interior`.
    let word: RP<AtomicU64> = unsafe { RP::from_abs(base.add(value_offset as usize) as *const AtomicU64) };
    let md = pmwcas.alloc(RecyclePolicy::None)?;
    unsafe { pmwcas.add(md, word, old_off, new_off, RecyclePolicy::None)? };
    Ok(pmwcas.commit(md, &|_| {}))
}

/// build a brand-new interior node routing to `entries` (`(routing key,
/// child offset)`, sorted ascending, `entries[0]`'s key expected to be
/// the all-zero minimum so every key routes somewhere).
///
/// # Safety
/// `raw` must reference a freshly claimed, exclusively-owned block of at
/// least `node_size` bytes.
pub unsafe fn build_interior<const M: usize>(
    raw: RP<u8>,
    node_size: u32,
    entries: &[(Vec<u8>, u64)],
) -> Result<()> {
    let records: Vec<(Vec<u8>, Vec<u8>)> = entries
        .iter()
        .map(|(k, off)| (k.clone(), off.to_le_bytes().to_vec()))
        .collect();
    build_node::<M>(raw, node_size, false, &records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bztree::key::ByteCompare;
    use crate::bztree::leaf::insert;
    use std::sync::Arc;

    const W: usize = 4;
    const M: usize = 16;
    const NODE_SIZE: u32 = 512;

    fn fresh() -> (
        Box<Node<M>>,
        Arc<crate::pm::HeapPool>,
        PmwcasPool<crate::pm::HeapPool, W>,
    ) {
        let cfg = BzConfig::test_config();
        let pool = Arc::new(crate::pm::HeapPool::new(1 << 20).unwrap());
        crate::rp::set_base(pool.base());
        let pmwcas = PmwcasPool::<crate::pm::HeapPool, W>::new(pool.clone(), &cfg).unwrap();
        let mut node = Box::new(unsafe { core::mem::zeroed::<Node<M>>() });
        unsafe { Node::init_empty(&mut *node as *mut Node<M>, NODE_SIZE, true) };
        (node, pool, pmwcas)
    }

    fn block_allocator(pool: Arc<crate::pm::HeapPool>) -> impl Fn() -> Result<RP<u8>> {
        move || {
            let layout = core::alloc::Layout::from_size_align(NODE_SIZE as usize, 8).unwrap();
            let p = unsafe { pool.alloc(layout)? };
            Ok(unsafe { RP::from_abs(p) })
        }
    }

    #[test]
    fn decide_flags_split_when_oversized() {
        let (node, _pool, pmwcas) = fresh();
        let cfg = BzConfig::test_config();
        let cmp = ByteCompare;
        for k in 0u8..7 {
            insert(&node, &[k; 1].repeat(8), &[k; 8], &pmwcas, &cmp).unwrap();
        }
        assert_eq!(decide(&node, &cfg, false), SmoDecision::Split);
    }

    #[test]
    fn consolidate_compacts_deleted_records() {
        let (node, pool, pmwcas) = fresh();
        let cmp = ByteCompare;
        crate::bztree::leaf::insert(&node, b"a", b"1", &pmwcas, &cmp).unwrap();
        crate::bztree::leaf::insert(&node, b"b", b"2", &pmwcas, &cmp).unwrap();
        crate::bztree::leaf::delete(&node, b"a", &pmwcas, &cmp).unwrap();

        let alloc = block_allocator(pool);
        let new_off = consolidate(&node, &pmwcas, &alloc, &cmp).unwrap();
        let new_node = unsafe { &*(RP::<Node<M>>::from_offset(new_off).as_ptr()) };
        assert_eq!(new_node.rec_count(), 1);
        assert_eq!(unsafe { new_node.record_key(0) }, b"b");
    }

    #[test]
    fn split_divides_records_at_median() {
        let (node, pool, pmwcas) = fresh();
        let cmp = ByteCompare;
        for k in [b'a', b'b', b'c', b'd'] {
            crate::bztree::leaf::insert(&node, &[k], &[k], &pmwcas, &cmp).unwrap();
        }
        let alloc = block_allocator(pool);
        let (left_off, right_off, sep) = split(&node, &pmwcas, &alloc, &cmp).unwrap();
        let left = unsafe { &*(RP::<Node<M>>::from_offset(left_off).as_ptr()) };
        let right = unsafe { &*(RP::<Node<M>>::from_offset(right_off).as_ptr()) };
        assert_eq!(left.rec_count(), 2);
        assert_eq!(right.rec_count(), 2);
        assert_eq!(sep, vec![b'c']);
    }

    #[test]
    fn merge_combines_two_leaves() {
        let (a, pool, pmwcas) = fresh();
        let mut b = Box::new(unsafe { core::mem::zeroed::<Node<M>>() });
        unsafe { Node::init_empty(&mut *b as *mut Node<M>, NODE_SIZE, true) };
        let cmp = ByteCompare;
        crate::bztree::leaf::insert(&a, b"a", b"1", &pmwcas, &cmp).unwrap();
        crate::bztree::leaf::insert(&b, b"b", b"2", &pmwcas, &cmp).unwrap();

        let alloc = block_allocator(pool);
        let merged_off = merge_with_sibling(&a, &b, &pmwcas, &alloc, &cmp).unwrap();
        let merged = unsafe { &*(RP::<Node<M>>::from_offset(merged_off).as_ptr()) };
        assert_eq!(merged.rec_count(), 2);
    }
}
