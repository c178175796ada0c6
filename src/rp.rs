/*!
    # Relative pointers

    A durable reference is never an absolute address — PM pools are
    remapped at a different address on every process restart. Every
    durable pointer is instead a 64-bit byte offset from a base that is
    fixed once, at pool mount, for the lifetime of the process.

    Grounded on the original `rel_ptr<T>` template: construct from an
    absolute pointer or a raw offset, dereference through `base + offset`,
    compare by offset, treat offset `0` as null. Per the design notes, the
    base is process-scope state held in a [`OnceLock`] rather than an
    ambient mutable global.
*/

use core::{cmp::Ordering, fmt, marker::PhantomData, sync::atomic::AtomicPtr};
use std::sync::OnceLock;

static BASE: OnceLock<usize> = OnceLock::new();

/// Set the process-wide PM base address. Must be called exactly once,
/// before any [`RP`] is dereferenced. Subsequent calls are no-ops if the
/// value already matches (idempotent re-mount at the same address), and
/// panic otherwise — remounting at a different base without a process
/// restart would silently corrupt every live `RP`.
pub fn set_base(base: *mut u8) {
    let base = base as usize;
    match BASE.set(base) {
        Ok(()) => {}
        Err(_) => {
            let existing = *BASE.get().unwrap();
            assert_eq!(existing, base, "logic,RP base re-initialized at a different address");
        }
    }
}

#[inline(always)]
fn base() -> usize {
    *BASE.get().expect("RP base not initialized; call rp::set_base first")
}

/// A 64-bit byte offset from the PM base, typed by what it points to.
///
/// Copyable, totally ordered by offset, carries no ownership. Offset `0`
/// is reserved for null; dereferencing a null `RP` is a programming
/// error (UB), matching the contract of the original `rel_ptr<T>`.
pub struct RP<T> {
    off: u64,
    _m: PhantomData<AtomicPtr<T>>,
}

impl<T> Clone for RP<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for RP<T> {}

impl<T> fmt::Debug for RP<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RP(0x{:x})", self.off)
    }
}

impl<T> PartialEq for RP<T> {
    fn eq(&self, other: &Self) -> bool {
        self.off == other.off
    }
}
impl<T> Eq for RP<T> {}

impl<T> PartialOrd for RP<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl<T> Ord for RP<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.off.cmp(&other.off)
    }
}

impl<T> core::hash::Hash for RP<T> {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.off.hash(state);
    }
}

impl<T> RP<T> {
    /// the null relative pointer
    #[inline(always)]
    pub const fn null() -> Self {
        Self {
            off: 0,
            _m: PhantomData,
        }
    }
    /// construct from a raw PM-relative offset
    #[inline(always)]
    pub const fn from_offset(off: u64) -> Self {
        Self {
            off,
            _m: PhantomData,
        }
    }
    #[inline(always)]
    pub const fn offset(self) -> u64 {
        self.off
    }
    #[inline(always)]
    pub const fn is_null(self) -> bool {
        self.off == 0
    }
    /// construct from an absolute address that lies inside the mounted pool
    ///
    /// # Safety
    /// `ptr` must lie within the mounted PM region (i.e. `ptr >= base`).
    #[inline(always)]
    pub unsafe fn from_abs(ptr: *const T) -> Self {
        let off = (ptr as usize).wrapping_sub(base());
        Self::from_offset(off as u64)
    }
    /// resolve to an absolute, mutable pointer
    ///
    /// # Safety
    /// `self` must not be null, and the pointed-to storage must be valid
    /// for `T` (correctly initialized, not concurrently freed).
    #[inline(always)]
    pub unsafe fn as_ptr(self) -> *mut T {
        debug_assert!(!self.is_null(), "logic,deref of null RP");
        (base() + self.off as usize) as *mut T
    }
    /// # Safety
    /// see [`RP::as_ptr`]
    #[inline(always)]
    pub unsafe fn as_ref<'a>(self) -> &'a T {
        &*self.as_ptr()
    }
    /// # Safety
    /// see [`RP::as_ptr`]
    #[inline(always)]
    pub unsafe fn as_mut<'a>(self) -> &'a mut T {
        &mut *self.as_ptr()
    }
    /// reinterpret the pointee type; used when a PM word's tag bits are
    /// resolved into either a `WD` or an `MD` offset
    #[inline(always)]
    pub const fn cast<U>(self) -> RP<U> {
        RP::from_offset(self.off)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_is_zero_offset() {
        let p: RP<u64> = RP::null();
        assert!(p.is_null());
        assert_eq!(p.offset(), 0);
    }

    #[test]
    fn ordering_is_by_offset() {
        let a: RP<u64> = RP::from_offset(8);
        let b: RP<u64> = RP::from_offset(16);
        assert!(a < b);
        assert_eq!(a, RP::from_offset(8));
    }
}
