/*!
    # Word and multi-word descriptors

    `Wd<W>` mirrors the original's `word_entry`: a target address, the
    expected and new values, a back-pointer to the owning `Md`, and a
    recycle policy. `Md<W>` mirrors `pmwcas_entry`: a `status` state
    machine (`FREE/UNDECIDED/SUCCESS/FAILED`, DIRTY bit overlaid at bit
    63), a `count` of live WDs, and a fixed `W`-capacity WD array.

    Only the owning thread mutates a `Wd`'s fields or a not-yet-installed
    `Md`'s `count`/`default_recycle` — other threads only ever read an
    `Md` after it has been published into a target word, by which point
    those fields are fixed. `status` is the one field genuinely raced on
    (`alloc`'s `FREE → UNDECIDED` CAS, and every helper's reads), so it's
    the only truly atomic field.
*/

use crate::mem::word::DIRTY_BIT as ST_DIRTY;
use crate::rp::RP;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

pub const ST_FREE: u64 = 0;
pub const ST_UNDECIDED: u64 = 1;
pub const ST_SUCCESS: u64 = 2;
pub const ST_FAILED: u64 = 3;
const ST_STATE_MASK: u64 = 0b11;

#[inline(always)]
pub const fn state_of(s: u64) -> u64 {
    s & ST_STATE_MASK
}
#[inline(always)]
pub const fn is_dirty(s: u64) -> bool {
    s & ST_DIRTY != 0
}
#[inline(always)]
pub const fn dirty(s: u64) -> u64 {
    s | ST_DIRTY
}
#[inline(always)]
pub const fn undirty(s: u64) -> u64 {
    s & !ST_DIRTY
}

/// When and how a WD's target is handed back to the node allocator once
/// an MD's outcome is known. Matches the original's six recycle
/// policies plus a no-op default for WDs that were only ever meant to be
/// CASed, not reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecyclePolicy {
    /// nothing to recycle: a plain status/meta CAS
    None,
    /// on FAILED, free `new_val` (a block this operation would have
    /// installed had it won)
    ReleaseNewOnFailed,
    /// on SUCCESS, free `expect` (the block this operation displaced)
    ReleaseExpOnSuccess,
    /// both of the above, applied to the same WD
    ReleaseSwapPtr,
    /// on SUCCESS only, free the address's prior occupant without any
    /// CAS having been involved — used to couple an allocation to a
    /// commit that turned out not to need the CAS form
    NocasReleaseAddrOnSuccess,
    /// on FAILED, perform a single compensating CAS (used when a
    /// `reserve`d slot's value must be undone manually)
    NocasExecuteOnFailed,
    /// on FAILED, free `new_val` without any CAS having run
    NocasReleaseNewOnFailed,
}

#[derive(Clone, Copy)]
#[repr(C)]
pub struct Wd<const W: usize> {
    pub addr: RP<AtomicU64>,
    pub expect: u64,
    pub new_val: u64,
    pub owner: RP<Md<W>>,
    pub recycle_policy: RecyclePolicy,
    in_use: bool,
}

impl<const W: usize> Wd<W> {
    const fn null() -> Self {
        Self {
            addr: RP::null(),
            expect: 0,
            new_val: 0,
            owner: RP::null(),
            recycle_policy: RecyclePolicy::None,
            in_use: false,
        }
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use
    }
}

#[repr(C)]
pub struct Md<const W: usize> {
    pub status: AtomicU64,
    /// intrusive next-pointer slot for an EBR limbo list; the crate's own
    /// EBR uses heap-allocated [`crate::sync::EpochBuckets`] instead, so
    /// this is kept only for on-PM layout fidelity with the original and
    /// is otherwise unused.
    pub gc_link: AtomicU64,
    count: AtomicUsize,
    pub default_recycle: RecyclePolicy,
    wdescs: [Wd<W>; W],
}

impl<const W: usize> Md<W> {
    fn reset_in_place(&self) {
        self.status.store(ST_FREE, Ordering::Relaxed);
        self.gc_link.store(0, Ordering::Relaxed);
        self.count.store(0, Ordering::Relaxed);
        // SAFETY: `status` is FREE at this point; no concurrent reader
        // will inspect `wdescs` until a subsequent `alloc` republishes it.
        let this = unsafe { &mut *(self as *const Self as *mut Self) };
        this.default_recycle = RecyclePolicy::None;
        for wd in this.wdescs.iter_mut() {
            *wd = Wd::null();
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn wds(&self) -> &[Wd<W>] {
        &self.wdescs[..self.count()]
    }

    /// first index in `wdescs[..count]` whose target address sorts after
    /// `addr`; `wdescs[..count]` is kept sorted ascending by address so
    /// install/commit visits WDs in that order and two commits racing
    /// over the same words can't deadlock by installing them in opposite
    /// orders.
    fn insertion_point(&self, count: usize, addr: RP<AtomicU64>) -> usize {
        self.wdescs[..count].iter().position(|w| addr < w.addr).unwrap_or(count)
    }

    /// # Safety
    /// caller must be the thread that owns this MD (holds it between
    /// `alloc` and `commit`/abort); no other thread may be able to
    /// observe it yet.
    unsafe fn push_wd(&self, wd: Wd<W>) {
        let this = &mut *(self as *const Self as *mut Self);
        let count = this.count.load(Ordering::Relaxed);
        let insert_at = this.insertion_point(count, wd.addr);
        if insert_at != count {
            this.wdescs.copy_within(insert_at..count, insert_at + 1);
        }
        this.wdescs[insert_at] = wd;
        this.count.store(count + 1, Ordering::Relaxed);
    }

    pub fn status(&self) -> u64 {
        self.status.load(Ordering::Acquire)
    }
}

/// A contiguous, pool-allocated array of `D` descriptors (`D` a runtime
/// config value, `W` the compile-time per-descriptor WD capacity).
pub struct DescriptorPool<const W: usize> {
    base: RP<Md<W>>,
    capacity: usize,
}

impl<const W: usize> DescriptorPool<W> {
    /// # Safety
    /// `base` must reference `capacity` contiguous, exclusively-owned
    /// `Md<W>` slots, already zero-initialized by the allocator (the raw
    /// bytes the embedder's pool hands back are zeroed by construction).
    pub unsafe fn from_raw(base: RP<Md<W>>, capacity: usize) -> Self {
        let this = Self { base, capacity };
        for i in 0..capacity {
            this.descriptor(i).reset_in_place();
        }
        this
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn descriptor(&self, idx: usize) -> &Md<W> {
        debug_assert!(idx < self.capacity);
        // SAFETY: `base` was constructed over `capacity` live slots.
        unsafe { &*self.base.as_ptr().add(idx) }
    }

    /// scan for a `FREE` descriptor, CAS it to `UNDECIDED`, and return it
    pub fn alloc(&self, default_recycle: RecyclePolicy) -> Option<RP<Md<W>>> {
        for i in 0..self.capacity {
            let md = self.descriptor(i);
            if md
                .status
                .compare_exchange(ST_FREE, ST_UNDECIDED, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                md.count.store(0, Ordering::Relaxed);
                // SAFETY: status just transitioned FREE -> UNDECIDED under
                // our CAS; no other thread can see this slot as anything
                // but UNDECIDED-with-count-0 until we publish it.
                let this = unsafe { &mut *(md as *const Md<W> as *mut Md<W>) };
                this.default_recycle = default_recycle;
                return Some(unsafe { RP::from_abs(md as *const Md<W>) });
            }
        }
        None
    }

    /// append a WD with a known `new_val`
    ///
    /// # Safety
    /// `md` must be owned by the calling thread (between `alloc` and
    /// `commit`) and not yet full.
    pub unsafe fn add(
        &self,
        md: &Md<W>,
        addr: RP<AtomicU64>,
        expect: u64,
        new_val: u64,
        recycle_policy: RecyclePolicy,
    ) {
        md.push_wd(Wd {
            addr,
            expect,
            new_val,
            owner: RP::from_abs(md as *const Md<W>),
            recycle_policy,
            in_use: true,
        });
    }

    /// append a WD whose `new_val` isn't known yet; returns the raw PM
    /// address of that WD's `new_val` field so the caller can fill it in
    /// before `commit`.
    ///
    /// # Safety
    /// see [`DescriptorPool::add`]. In addition, since WDs are kept
    /// sorted by address, this must be the last WD added to `md` before
    /// `commit` — a later `add`/`reserve` call on the same `md` may
    /// insert ahead of this one and shift it, invalidating the returned
    /// pointer.
    pub unsafe fn reserve(
        &self,
        md: &Md<W>,
        addr: RP<AtomicU64>,
        expect: u64,
        recycle_policy: RecyclePolicy,
    ) -> RP<u64> {
        let idx = md.insertion_point(md.count(), addr);
        self.add(md, addr, expect, 0, recycle_policy);
        RP::from_abs(&md.wdescs[idx].new_val as *const u64)
    }

    /// return a descriptor to `FREE`. Only valid once no thread can
    /// still be helping-commit it (the caller routes this through EBR).
    pub fn free(&self, md: &Md<W>) {
        md.reset_in_place();
    }
}
