/*!
    # Install / commit / read / recovery

    A direct translation of the original `pmwcas_commit`/`pmwcas_read`/
    `pmwcas_recovery` trio, with one deliberate correction: the extracted
    reference source wraps its per-WD retry in a `do { ... } while
    (false)` (a single-pass block, not an actual loop), even though its
    own comments describe retrying. The prose specification is explicit
    that a WD install must retry after helping a conflicting RDCSS or
    MwCAS — that's what a lock-free multi-CAS requires to make progress
    under contention — so this module implements the described retry
    loop rather than reproducing the apparent copy/paste artifact.
*/

use super::descriptor::{self, is_dirty, state_of, DescriptorPool, Md, RecyclePolicy, Wd, ST_FAILED, ST_SUCCESS, ST_UNDECIDED};
use crate::config::BzConfig;
use crate::error::{Error, Result};
use crate::mem::word;
use crate::pm::PmPool;
use crate::rp::RP;
use crate::sync::backoff::Backoff;
use core::alloc::Layout;
use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const ACQ: Ordering = Ordering::Acquire;
const ACR: Ordering = Ordering::AcqRel;

/// The descriptor pool plus the commit protocol over it. `W` bounds how
/// many words one commit may touch; `P` is the backing PM pool used
/// only to persist dirtied cache lines.
pub struct PmwcasPool<P: PmPool, const W: usize> {
    pool: Arc<P>,
    descriptors: DescriptorPool<W>,
}

impl<P: PmPool, const W: usize> PmwcasPool<P, W> {
    pub fn new(pool: Arc<P>, cfg: &BzConfig) -> Result<Self> {
        let layout =
            Layout::array::<Md<W>>(cfg.descriptor_pool_size).map_err(|_| Error::EGcCreate)?;
        let raw = unsafe { pool.alloc(layout)? };
        let base: RP<Md<W>> = unsafe { RP::from_abs(raw as *const Md<W>) };
        // SAFETY: `raw` references `descriptor_pool_size` freshly
        // allocated, exclusively-owned, zeroed `Md<W>`-sized slots.
        let descriptors = unsafe { DescriptorPool::from_raw(base, cfg.descriptor_pool_size) };
        Ok(Self { pool, descriptors })
    }

    pub fn capacity(&self) -> usize {
        self.descriptors.capacity()
    }

    pub fn alloc(&self, default_recycle: RecyclePolicy) -> Result<RP<Md<W>>> {
        self.descriptors.alloc(default_recycle).ok_or_else(|| {
            log::warn!("pmwcas descriptor pool exhausted");
            Error::EPmwcasAlloc
        })
    }

    /// abandon an MD allocated but never committed (e.g. an SMO that
    /// decided it has nothing to do)
    pub fn abort(&self, md: RP<Md<W>>) {
        self.descriptors.free(unsafe { md.as_ref() });
    }

    /// # Safety
    /// `md` must be owned by the calling thread and not yet committed.
    pub unsafe fn add(
        &self,
        md: RP<Md<W>>,
        addr: RP<AtomicU64>,
        expect: u64,
        new_val: u64,
        recycle_policy: RecyclePolicy,
    ) -> Result<()> {
        let mdr = md.as_ref();
        if mdr.count() >= W {
            return Err(Error::EAllocSize);
        }
        self.descriptors.add(mdr, addr, expect, new_val, recycle_policy);
        Ok(())
    }

    /// # Safety
    /// see [`PmwcasPool::add`]
    pub unsafe fn reserve(
        &self,
        md: RP<Md<W>>,
        addr: RP<AtomicU64>,
        expect: u64,
        recycle_policy: RecyclePolicy,
    ) -> Result<RP<u64>> {
        let mdr = md.as_ref();
        if mdr.count() >= W {
            return Err(Error::EAllocSize);
        }
        Ok(self.descriptors.reserve(mdr, addr, expect, recycle_policy))
    }

    fn persist_clear(&self, target: &AtomicU64, val: u64) {
        self.pool.persist(target as *const AtomicU64 as *const u8, 8);
        let _ = target.compare_exchange(val, word::without_dirty(val), ACR, ACQ);
    }

    fn complete_install(&self, md: &Md<W>, wd: &Wd<W>) {
        let wd_rp: RP<Wd<W>> = unsafe { RP::from_abs(wd as *const Wd<W>) };
        let undecided = state_of(md.status()) == ST_UNDECIDED;
        let desired = if undecided {
            word::with_dirty(word::as_mwcas(wd.owner.offset()))
        } else {
            wd.expect
        };
        let tagged = word::as_rdcss(wd_rp.offset());
        let target = unsafe { wd.addr.as_ref() };
        let _ = target.compare_exchange(tagged, desired, ACR, ACQ);
    }

    /// install one WD, helping any conflicting RDCSS/MwCAS out of the
    /// way and retrying until this WD resolves one way or the other.
    /// Returns `false` only when the target word genuinely disagrees
    /// with `expect` and was not installed or owned by us.
    fn install(&self, md_rp: RP<Md<W>>, wd: &Wd<W>, reclaim: &dyn Fn(u64)) -> bool {
        let wd_rp: RP<Wd<W>> = unsafe { RP::from_abs(wd as *const Wd<W>) };
        let target = unsafe { wd.addr.as_ref() };
        let mut backoff = Backoff::new();
        loop {
            match target.compare_exchange(wd.expect, word::as_rdcss(wd_rp.offset()), ACR, ACQ) {
                Ok(_) => {
                    self.complete_install(unsafe { md_rp.as_ref() }, wd);
                    return true;
                }
                Err(cur) => {
                    if word::is_rdcss(cur) && word::descriptor_offset(cur) == wd_rp.offset() {
                        return true;
                    }
                    if word::is_rdcss(cur) {
                        let other_wd_rp: RP<Wd<W>> = RP::from_offset(word::descriptor_offset(cur));
                        let other_wd = unsafe { other_wd_rp.as_ref() };
                        let other_md = unsafe { other_wd.owner.as_ref() };
                        self.complete_install(other_md, other_wd);
                        backoff.spin();
                        continue;
                    }
                    if word::is_mwcas(cur) {
                        let other_off = word::descriptor_offset(cur);
                        if other_off == md_rp.offset() {
                            return true;
                        }
                        if word::is_dirty(cur) {
                            self.persist_clear(target, cur);
                        }
                        let other_md_rp: RP<Md<W>> = RP::from_offset(other_off);
                        log::trace!("helping commit conflicting descriptor at offset {other_off:#x}");
                        self.commit(other_md_rp, reclaim);
                        backoff.spin();
                        continue;
                    }
                    return false;
                }
            }
        }
    }

    fn apply_recycle(&self, wd: &Wd<W>, success: bool, reclaim: &dyn Fn(u64)) {
        use RecyclePolicy::*;
        match wd.recycle_policy {
            None => {}
            ReleaseNewOnFailed | NocasReleaseNewOnFailed => {
                if !success {
                    reclaim(wd.new_val);
                }
            }
            ReleaseExpOnSuccess | NocasReleaseAddrOnSuccess => {
                if success {
                    reclaim(wd.expect);
                }
            }
            ReleaseSwapPtr => {
                if success {
                    reclaim(wd.expect);
                } else {
                    reclaim(wd.new_val);
                }
            }
            NocasExecuteOnFailed => {
                // the compensating single-CAS this policy names is exactly
                // what install-finals already performs (restoring `expect`
                // on failure); nothing further to do.
            }
        }
    }

    /// run the full install/persist/finalize/install-finals protocol.
    /// `reclaim` is invoked with the raw offset of any node block a
    /// recycle policy determines is now garbage (the caller interprets
    /// it as an `RP<u8>` and routes it to its node allocator via EBR).
    pub fn commit(&self, md_rp: RP<Md<W>>, reclaim: &dyn Fn(u64)) -> bool {
        let md = unsafe { md_rp.as_ref() };
        let mut status = ST_SUCCESS;
        for wd in md.wds() {
            if status != ST_SUCCESS {
                break;
            }
            if !self.install(md_rp, wd, reclaim) {
                status = ST_FAILED;
            }
        }

        let md_tagged = word::with_dirty(word::as_mwcas(md_rp.offset()));
        if status == ST_SUCCESS {
            for wd in md.wds() {
                let target = unsafe { wd.addr.as_ref() };
                self.persist_clear(target, md_tagged);
            }
        }

        let _ = md
            .status
            .compare_exchange(ST_UNDECIDED, word::with_dirty(status), ACR, ACQ);
        self.pool.persist(&md.status as *const AtomicU64 as *const u8, 8);
        let dirtied = md.status.load(ACQ);
        let _ = md
            .status
            .compare_exchange(dirtied, word::without_dirty(dirtied), ACR, ACQ);

        let final_status = state_of(md.status.load(ACQ));
        let success = final_status == ST_SUCCESS;

        for wd in md.wds() {
            let chosen = if success { wd.new_val } else { wd.expect };
            let val = word::with_dirty(chosen);
            let target = unsafe { wd.addr.as_ref() };
            if let Err(old) = target.compare_exchange(md_tagged, val, ACR, ACQ) {
                if old == word::without_dirty(md_tagged) {
                    let _ = target.compare_exchange(word::without_dirty(md_tagged), val, ACR, ACQ);
                }
            }
            self.persist_clear(target, val);
            self.apply_recycle(wd, success, reclaim);
        }

        log::debug!("pmwcas commit on descriptor {:#x} -> {}", md_rp.offset(), success);
        success
    }

    /// read a target word, helping along any in-progress install or
    /// commit observed along the way
    pub fn read(&self, addr: RP<AtomicU64>, reclaim: &dyn Fn(u64)) -> u64 {
        let target = unsafe { addr.as_ref() };
        loop {
            let r = target.load(ACQ);
            if word::is_rdcss(r) {
                let wd_rp: RP<Wd<W>> = RP::from_offset(word::descriptor_offset(r));
                let wd = unsafe { wd_rp.as_ref() };
                let md = unsafe { wd.owner.as_ref() };
                self.complete_install(md, wd);
                continue;
            }
            if is_dirty(r) {
                self.persist_clear(target, r);
                continue;
            }
            if word::is_mwcas(r) {
                let md_rp: RP<Md<W>> = RP::from_offset(word::descriptor_offset(r));
                self.commit(md_rp, reclaim);
                continue;
            }
            return r;
        }
    }

    /// single-threaded recovery sweep over every descriptor: clear any
    /// stale DIRTY bit on `status`, roll forward/back every target word
    /// of every non-`FREE` descriptor, then mark it `FREE` again.
    pub fn recovery(&self, reclaim: &dyn Fn(u64)) {
        for i in 0..self.descriptors.capacity() {
            let md = self.descriptors.descriptor(i);
            let mut status = md.status.load(Ordering::Relaxed);
            if is_dirty(status) {
                status = word::without_dirty(status);
                md.status.store(status, Ordering::Relaxed);
                self.pool.persist(&md.status as *const AtomicU64 as *const u8, 8);
            }
            if state_of(status) == descriptor::ST_FREE {
                continue;
            }
            let done = state_of(status) == ST_SUCCESS;
            let md_rp: RP<Md<W>> = unsafe { RP::from_abs(md as *const Md<W>) };
            let md_tagged = word::with_dirty(word::as_mwcas(md_rp.offset()));

            for wd in md.wds() {
                let val = word::with_dirty(if done { wd.new_val } else { wd.expect });
                let target = unsafe { wd.addr.as_ref() };
                if let Err(old) = target.compare_exchange(md_tagged, val, Ordering::Relaxed, Ordering::Relaxed) {
                    if old == word::without_dirty(md_tagged) {
                        let _ = target.compare_exchange(
                            word::without_dirty(md_tagged),
                            val,
                            Ordering::Relaxed,
                            Ordering::Relaxed,
                        );
                    } else if word::is_rdcss(old) {
                        let wd_rp: RP<Wd<W>> = unsafe { RP::from_abs(wd as *const Wd<W>) };
                        let _ = target.compare_exchange(
                            word::as_rdcss(wd_rp.offset()),
                            wd.expect,
                            Ordering::Relaxed,
                            Ordering::Relaxed,
                        );
                    }
                }
                self.pool.persist(target as *const AtomicU64 as *const u8, 8);
                self.apply_recycle(wd, done, reclaim);
            }
            md.status.store(descriptor::ST_FREE, Ordering::Relaxed);
            self.pool.persist(&md.status as *const AtomicU64 as *const u8, 8);
        }
        log::info!("pmwcas recovery complete over {} descriptors", self.descriptors.capacity());
    }
}
