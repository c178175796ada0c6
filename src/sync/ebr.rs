/*!
    # Epoch-based reclamation

    A direct port of the three-epoch EBR scheme used to guard node and
    descriptor reclamation: a global epoch counter cycling through
    `0, 1, 2`, a lock-free list of per-thread local epochs, and a
    `sync()` that advances the global epoch once every registered,
    active thread has observed it.

    The shape (separate `register`/`enter`/`exit`/`sync`, a distinct
    "staging" vs. "gc" epoch) follows the original `ebr.cpp` line for
    line; the ordering-constant style (`ORD_*`) follows
    [`crate::sync`]'s sibling module for `Atomic<T>`.
*/

use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};
use parking_lot::Mutex;
use std::cell::Cell;

const ORD_RLX: Ordering = Ordering::Relaxed;
const ORD_SEQ: Ordering = Ordering::SeqCst;

const ACTIVE_FLAG: u32 = 0x8000_0000;
const EPOCHS: u32 = 3;

struct ThreadState {
    local_epoch: AtomicU32,
    next: AtomicPtr<ThreadState>,
}

/// Three epoch counters and the lock-free list of registered threads.
///
/// `Ebr` itself holds no retired objects — pair it with one or more
/// [`EpochBuckets`] per kind of reclaimed object (the core keeps one for
/// nodes and one for PMwCAS descriptor slots).
pub struct Ebr {
    global_epoch: AtomicU32,
    list: AtomicPtr<ThreadState>,
}

impl Default for Ebr {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    static LOCAL: Cell<*mut ThreadState> = const { Cell::new(core::ptr::null_mut()) };
}

impl Ebr {
    pub const fn new() -> Self {
        Self {
            global_epoch: AtomicU32::new(0),
            list: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Register the calling thread. Idempotent: calling it again from a
    /// thread that is already registered is a no-op.
    pub fn register(&self) {
        if !LOCAL.with(|l| l.get().is_null()) {
            return;
        }
        let ts = Box::into_raw(Box::new(ThreadState {
            local_epoch: AtomicU32::new(0),
            next: AtomicPtr::new(core::ptr::null_mut()),
        }));
        loop {
            let head = self.list.load(ORD_RLX);
            unsafe { (*ts).next.store(head, ORD_RLX) };
            if self
                .list
                .compare_exchange(head, ts, Ordering::AcqRel, ORD_RLX)
                .is_ok()
            {
                break;
            }
        }
        LOCAL.with(|l| l.set(ts));
    }

    /// Enter a critical path on the calling thread. Panics if the thread
    /// has not called [`Ebr::register`] first.
    pub fn enter(&self) -> Guard<'_> {
        let ts = LOCAL.with(|l| l.get());
        assert!(!ts.is_null(), "logic,thread entered EBR without registering");
        let epoch = self.global_epoch.load(ORD_RLX);
        // SAFETY: ts was produced by `register` and leaked for the process
        // lifetime; it is never freed while the thread is registered.
        unsafe { (*ts).local_epoch.store(epoch | ACTIVE_FLAG, ORD_RLX) };
        core::sync::atomic::fence(ORD_SEQ);
        Guard { ebr: self, ts }
    }

    /// Attempt to synchronize and announce a new global epoch.
    ///
    /// Returns `(advanced, gc_epoch)`: `gc_epoch` is always the epoch
    /// whose retired objects are now safe to destroy; `advanced` tells
    /// the caller whether this call is what made that true (useful for
    /// logging, not for correctness — `gc_epoch` is valid either way).
    pub fn sync(&self) -> (bool, u32) {
        let epoch = self.global_epoch.load(ORD_RLX);
        core::sync::atomic::fence(ORD_SEQ);

        let mut t = self.list.load(ORD_RLX);
        while !t.is_null() {
            // SAFETY: list nodes are leaked for the process lifetime.
            let local = unsafe { (*t).local_epoch.load(ORD_RLX) };
            let active = local & ACTIVE_FLAG != 0;
            if active && local != (epoch | ACTIVE_FLAG) {
                return (false, gc_epoch_of(epoch));
            }
            t = unsafe { (*t).next.load(ORD_RLX) };
        }

        let advanced_epoch = (epoch + 1) % EPOCHS;
        let won = self
            .global_epoch
            .compare_exchange(epoch, advanced_epoch, Ordering::AcqRel, ORD_RLX)
            .is_ok();
        (won, gc_epoch_of(if won { advanced_epoch } else { epoch }))
    }

    /// the epoch objects are currently staged into by `retire`
    pub fn staging_epoch(&self) -> u32 {
        self.global_epoch.load(ORD_RLX)
    }

    /// the epoch whose staged objects are guaranteed safe to reclaim
    pub fn gc_epoch(&self) -> u32 {
        gc_epoch_of(self.global_epoch.load(ORD_RLX))
    }
}

fn gc_epoch_of(global_epoch: u32) -> u32 {
    (global_epoch + 1) % EPOCHS
}

/// RAII critical-path marker; exiting clears the thread's active flag.
pub struct Guard<'a> {
    ebr: &'a Ebr,
    ts: *mut ThreadState,
}

impl Drop for Guard<'_> {
    fn drop(&mut self) {
        let _ = self.ebr;
        core::sync::atomic::fence(ORD_SEQ);
        // SAFETY: see `enter`.
        unsafe {
            debug_assert!((*self.ts).local_epoch.load(ORD_RLX) & ACTIVE_FLAG != 0);
            (*self.ts).local_epoch.store(0, ORD_RLX);
        }
    }
}

/// Three epoch-indexed retirement queues for one kind of reclaimed
/// object. `retire` stages into the current epoch's bucket; `collect`
/// drains whatever bucket `Ebr::gc_epoch` currently names.
pub struct EpochBuckets<T> {
    buckets: [Mutex<Vec<T>>; 3],
}

impl<T> Default for EpochBuckets<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EpochBuckets<T> {
    pub fn new() -> Self {
        Self {
            buckets: [Mutex::new(Vec::new()), Mutex::new(Vec::new()), Mutex::new(Vec::new())],
        }
    }

    pub fn retire(&self, staging_epoch: u32, item: T) {
        self.buckets[staging_epoch as usize % 3].lock().push(item);
    }

    /// drain the bucket named by `gc_epoch`, returning everything now
    /// safe to destroy
    pub fn collect(&self, gc_epoch: u32) -> Vec<T> {
        core::mem::take(&mut *self.buckets[gc_epoch as usize % 3].lock())
    }

    pub fn pending_len(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn single_thread_advances_epoch() {
        let ebr = Ebr::new();
        ebr.register();
        {
            let _g = ebr.enter();
        }
        let (advanced, gc) = ebr.sync();
        assert!(advanced);
        assert_eq!(gc, gc_epoch_of(1));
    }

    #[test]
    fn active_thread_blocks_sync() {
        let ebr = Ebr::new();
        ebr.register();
        let guard = ebr.enter();
        let (advanced, _) = ebr.sync();
        assert!(!advanced, "an active thread on the current epoch must block advancement");
        drop(guard);
        let (advanced, _) = ebr.sync();
        assert!(advanced);
    }

    #[test]
    fn retire_and_collect_round_trip() {
        let ebr = Arc::new(Ebr::new());
        let buckets: EpochBuckets<u64> = EpochBuckets::new();
        ebr.register();
        buckets.retire(ebr.staging_epoch(), 42);
        assert_eq!(buckets.pending_len(), 1);
        // nothing is collectible yet: gc_epoch trails staging_epoch by one slot
        assert!(buckets.collect(ebr.gc_epoch()).is_empty());
        ebr.sync();
        ebr.sync();
        let collected = buckets.collect(ebr.gc_epoch());
        assert_eq!(collected, vec![42]);
    }

    #[test]
    fn concurrent_threads_register_and_sync() {
        let ebr = Arc::new(Ebr::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ebr = ebr.clone();
                thread::spawn(move || {
                    ebr.register();
                    for _ in 0..100 {
                        let _g = ebr.enter();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let (_, gc) = ebr.sync();
        assert!(gc < EPOCHS);
    }
}
