/*!
    A non-durable [`PmPool`] backed by a leaked, fixed-size heap arena.
    Test/demo infrastructure only — `persist` is a plain fence, nothing is
    ever flushed to a device — analogous to the in-memory filesystem used
    by this workspace's own `fs_test` suite.
*/

use super::{check_bounds, PmPool};
use crate::error::{Error, Result};
use core::alloc::Layout;
use core::sync::atomic::{fence, Ordering};
use parking_lot::Mutex;

struct FreeBlock {
    offset: usize,
    layout: Layout,
}

/// Bump-allocates from a fixed arena, reusing exact-layout-match blocks
/// off a free list before falling back to the bump cursor. Good enough
/// for test workloads with a handful of recurring allocation sizes (node
/// blocks, descriptor pools); not a general-purpose allocator.
pub struct HeapPool {
    arena: *mut u8,
    len: usize,
    cursor: Mutex<usize>,
    free: Mutex<Vec<FreeBlock>>,
}

// SAFETY: `arena` is a leaked allocation never aliased outside the
// pool's own alloc/dealloc bookkeeping, which is mutex-guarded.
unsafe impl Send for HeapPool {}
unsafe impl Sync for HeapPool {}

impl HeapPool {
    /// allocate and leak a `len`-byte arena; `len` must be nonzero
    pub fn new(len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::EGcCreate);
        }
        let layout = Layout::array::<u8>(len).map_err(|_| Error::EGcCreate)?;
        let arena = unsafe { std::alloc::alloc_zeroed(layout) };
        if arena.is_null() {
            return Err(Error::EGcCreate);
        }
        Ok(Self {
            arena,
            len,
            cursor: Mutex::new(0),
            free: Mutex::new(Vec::new()),
        })
    }
}

impl Drop for HeapPool {
    fn drop(&mut self) {
        let layout = Layout::array::<u8>(self.len).unwrap();
        unsafe { std::alloc::dealloc(self.arena, layout) };
    }
}

impl PmPool for HeapPool {
    fn base(&self) -> *mut u8 {
        self.arena
    }

    fn len(&self) -> usize {
        self.len
    }

    unsafe fn alloc(&self, layout: Layout) -> Result<*mut u8> {
        let mut free = self.free.lock();
        if let Some(pos) = free.iter().position(|b| b.layout == layout) {
            let block = free.swap_remove(pos);
            return Ok(self.arena.add(block.offset));
        }
        drop(free);

        let mut cursor = self.cursor.lock();
        let start = (*cursor + layout.align() - 1) & !(layout.align() - 1);
        let end = start.checked_add(layout.size()).ok_or(Error::ENoSpace)?;
        if end > self.len {
            return Err(Error::ENoSpace);
        }
        *cursor = end;
        Ok(self.arena.add(start))
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        check_bounds(self.arena, self.len, ptr, layout.size())
            .expect("logic,dealloc of out-of-bounds pointer");
        let offset = (ptr as usize) - (self.arena as usize);
        self.free.lock().push(FreeBlock { offset, layout });
    }

    fn persist(&self, _ptr: *const u8, _len: usize) {
        fence(Ordering::SeqCst);
    }
}
