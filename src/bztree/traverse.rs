/*!
    # Root-to-leaf descent

    Interior records route by the convention that record `i`'s key is
    the smallest key stored anywhere in child `i`'s subtree (so a record
    match routes *into* that child, and a miss routes into the child
    just left of the insertion point). There is no separate "leftmost
    pointer" field — the collapsed node type has none — so every interior
    node's first record's key must be (or be below) every key that can
    ever route there; the tree seeds this with [`crate::bztree::key::MAX_KEY`]'s
    complement, an all-zero minimum key, when a node is first split off.

    The path recorded here is a plain call-stack-local structure (never
    PM-resident), so it uses a fixed-capacity [`UArray`] sized generously
    rather than the config's runtime `max_path_depth` — callers assert
    `max_path_depth <= MAX_PATH_DEPTH` once at tree construction.
*/

use crate::bztree::key::KeyCompare;
use crate::bztree::node::Node;
use crate::bztree::search::{binary_search_sorted, SearchResult};
use crate::error::{Error, Result};
use crate::mem::UArray;
use crate::rp::RP;
use core::sync::atomic::{AtomicU64, Ordering};

pub const MAX_PATH_DEPTH: usize = 32;

#[derive(Clone, Copy)]
pub struct PathEntry<const M: usize> {
    pub node: RP<Node<M>>,
    /// slot in `node` the descent continued through
    pub slot: u32,
}

impl<const M: usize> Default for PathEntry<M> {
    fn default() -> Self {
        Self {
            node: RP::null(),
            slot: 0,
        }
    }
}

pub struct Traversal<const M: usize> {
    pub path: UArray<MAX_PATH_DEPTH, PathEntry<M>>,
    pub leaf: RP<Node<M>>,
}

impl<const M: usize> Traversal<M> {
    pub fn parent(&self) -> Option<&PathEntry<M>> {
        self.path.last()
    }
}

/// walk from `root` down to the leaf that would hold `key`.
///
/// Returns `Err(Error::ENotFound)` when the tree is empty (`root` is
/// still null) — callers that can create the root (insert/upsert) handle
/// that case themselves rather than treating it as a real miss.
///
/// # Safety
/// must be called from within an EBR critical section so that nodes
/// reachable from `root` at entry stay valid for the duration of the
/// walk even if concurrent SMOs retire them.
pub unsafe fn traverse<const M: usize>(
    root: &AtomicU64,
    key: &[u8],
    cmp: &dyn KeyCompare,
) -> Result<Traversal<M>> {
    let mut path = UArray::<MAX_PATH_DEPTH, PathEntry<M>>::default();
    let mut cur = root.load(Ordering::Acquire);
    if cur == 0 {
        return Err(Error::ENotFound);
    }

    loop {
        let node_rp: RP<Node<M>> = RP::from_offset(cur);
        let node = node_rp.as_ref();
        if node.is_leaf() {
            return Ok(Traversal { path, leaf: node_rp });
        }

        let sorted = node.sorted_count();
        if sorted == 0 {
            // an interior node with nothing sorted yet can't route; this
            // only happens mid-split, the caller should restart
            return Err(Error::ERace);
        }
        let slot = match binary_search_sorted(node, key, cmp) {
            SearchResult::Found(i) => i,
            SearchResult::NotFound(0) => 0,
            SearchResult::NotFound(i) => i - 1,
        };
        path.try_push(PathEntry { node: node_rp, slot })
            .ok_or(Error::ERace)?;
        cur = node.record_child_offset(slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bztree::key::ByteCompare;
    use crate::bztree::node::{pack_length, pack_meta, pack_status, LengthFields, MetaFields, StatusFields};
    use core::sync::atomic::AtomicU64;

    const NODE_SIZE: u32 = 512;

    #[test]
    fn empty_tree_reports_not_found() {
        crate::rp::set_base(core::ptr::null_mut());
        let root = AtomicU64::new(0);
        let cmp = ByteCompare;
        let err = unsafe { traverse::<16>(&root, b"k", &cmp) }.unwrap_err();
        assert!(matches!(err, Error::ENotFound));
    }

    #[test]
    fn single_leaf_root_is_returned_directly() {
        let mut arena = vec![0u8; 4096].into_boxed_slice();
        let arena_ptr = arena.as_mut_ptr();
        crate::rp::set_base(arena_ptr);

        // place a leaf node's worth of bytes at offset 0 of the arena and
        // point `root` at it
        let node_ptr = arena_ptr as *mut Node<16>;
        unsafe {
            Node::init_empty(node_ptr, NODE_SIZE, true);
            let node = &*node_ptr;
            let bytes = [42u8, 0x01];
            let offset = NODE_SIZE - bytes.len() as u32;
            node.write_payload(offset, &bytes);
            node.meta[0].store(
                pack_meta(MetaFields {
                    visible: true,
                    offset,
                    key_len: 1,
                    total_len: 2,
                }),
                Ordering::Relaxed,
            );
            node.length.store(
                pack_length(LengthFields {
                    node_size: NODE_SIZE,
                    sorted_count: 1,
                    is_leaf: true,
                }),
                Ordering::Relaxed,
            );
            node.status.store(
                pack_status(StatusFields {
                    frozen: false,
                    rec_count: 1,
                    block_size: 2,
                    delete_size: 0,
                }),
                Ordering::Relaxed,
            );
        }

        let root = AtomicU64::new(0);
        let cmp = ByteCompare;
        let t = unsafe { traverse::<16>(&root, &[42], &cmp) }.unwrap();
        assert!(t.path.is_empty());
        assert_eq!(t.leaf.offset(), 0);
        core::mem::forget(arena);
    }
}
