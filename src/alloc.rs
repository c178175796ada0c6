/*!
    # Node allocator

    A bounded ring of pre-allocated, fixed-size PM node blocks. `acquire`
    pops a free block (falling back to a fresh pool allocation once the
    ring runs dry); `release` pushes a retired block back unless the ring
    is already at capacity, in which case it's returned to the pool.

    Grounded on [`crate::sync::ebr`]'s sibling `cell.rs`: there, a
    `parking_lot::Mutex` serializes writers around an atomically-read
    cell. Here the ring itself is the thing readers and writers contend
    on, so the mutex guards the `Vec` directly rather than a separate
    atomic — the same "PM mutex" idiom, sized to what this data structure
    actually needs.
*/

use crate::config::BzConfig;
use crate::error::{Error, Result};
use crate::pm::PmPool;
use crate::rp::RP;
use core::alloc::Layout;
use parking_lot::Mutex;
use std::sync::Arc;

pub struct NodeAllocator<P: PmPool> {
    pool: Arc<P>,
    node_layout: Layout,
    ring: Mutex<Vec<RP<u8>>>,
    max_alloc: usize,
}

impl<P: PmPool> NodeAllocator<P> {
    pub fn new(pool: Arc<P>, cfg: &BzConfig) -> Result<Self> {
        let node_layout =
            Layout::from_size_align(cfg.node_size as usize, 8).map_err(|_| Error::EAllocSize)?;
        let mut ring = Vec::with_capacity(cfg.pre_alloc);
        for _ in 0..cfg.pre_alloc {
            let p = unsafe { pool.alloc(node_layout)? };
            ring.push(unsafe { RP::from_abs(p) });
        }
        log::debug!(
            "node allocator pre-filled {} blocks of {} bytes",
            ring.len(),
            cfg.node_size
        );
        Ok(Self {
            pool,
            node_layout,
            ring: Mutex::new(ring),
            max_alloc: cfg.max_alloc,
        })
    }

    pub fn node_size(&self) -> u32 {
        self.node_layout.size() as u32
    }

    /// hand out a free block, pre-filled ring first, falling back to a
    /// fresh pool allocation
    pub fn acquire(&self) -> Result<RP<u8>> {
        if let Some(rp) = self.ring.lock().pop() {
            return Ok(rp);
        }
        log::trace!("node ring empty, allocating fresh block from pool");
        let p = unsafe { self.pool.alloc(self.node_layout)? };
        Ok(unsafe { RP::from_abs(p) })
    }

    /// retire a block the caller no longer references. Must not be
    /// called until every reader has exited its epoch for this block
    /// (the caller is expected to route this through an
    /// [`crate::sync::EpochBuckets`] limbo queue, not call it directly
    /// from a still-reachable SMO).
    pub fn release(&self, rp: RP<u8>) {
        let mut ring = self.ring.lock();
        if ring.len() < self.max_alloc {
            ring.push(rp);
            return;
        }
        drop(ring);
        unsafe { self.pool.dealloc(rp.as_ptr(), self.node_layout) };
    }
}
