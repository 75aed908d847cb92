use crate::id::PageId;
use crate::pager::manager::Pager;
use crate::PAGE_SIZE;
use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

/// Latch-protected frame metadata. Valid content implies the frame
/// currently holds the page named by `id`.
#[derive(Debug)]
pub(super) struct PageMeta {
    pub(super) id: Option<PageId>,
}

/// Pin-only handle on a resident page. Keeps the page in its frame but
/// grants no access to the content; upgrade to a read or write guard to
/// look at the bytes.
pub struct PagePin<'a> {
    pub(super) pager: &'a Pager,
    pub(super) frame_id: usize,
    pub(super) pgid: PageId,
}

impl<'a> PagePin<'a> {
    pub fn page_id(&self) -> PageId {
        self.pgid
    }

    /// Acquires the page's read latch, keeping the pin.
    pub fn into_read(self) -> PageRead<'a> {
        let meta = self.pager.latch(self.frame_id).read();
        debug_assert_eq!(Some(self.pgid), meta.id);
        let guard = PageRead {
            pager: self.pager,
            frame_id: self.frame_id,
            pgid: self.pgid,
            meta: Some(meta),
        };
        // the pin moved into the new guard
        std::mem::forget(self);
        guard
    }

    /// Acquires the page's write latch, keeping the pin.
    pub fn into_write(self) -> PageWrite<'a> {
        let meta = self.pager.latch(self.frame_id).write();
        debug_assert_eq!(Some(self.pgid), meta.id);
        let guard = PageWrite {
            pager: self.pager,
            frame_id: self.frame_id,
            pgid: self.pgid,
            dirty: false,
            meta: Some(meta),
        };
        std::mem::forget(self);
        guard
    }
}

impl Drop for PagePin<'_> {
    fn drop(&mut self) {
        self.pager.release(self.frame_id, false);
    }
}

/// Shared guard: one pin plus the page's read latch. Releases the
/// latch first and the pin second on drop, so a writer that wins the
/// latch immediately afterwards always observes the frame as pinned or
/// correctly evictable, never half-released.
pub struct PageRead<'a> {
    pub(super) pager: &'a Pager,
    pub(super) frame_id: usize,
    pub(super) pgid: PageId,
    pub(super) meta: Option<RwLockReadGuard<'a, PageMeta>>,
}

impl<'a> PageRead<'a> {
    pub fn page_id(&self) -> PageId {
        self.pgid
    }

    pub fn data(&self) -> &[u8] {
        // SAFETY: the guard holds the frame's read latch, so the frame
        // buffer has no mutable reference for as long as `self` lives.
        unsafe { std::slice::from_raw_parts(self.pager.frame_ptr(self.frame_id), PAGE_SIZE) }
    }
}

impl Drop for PageRead<'_> {
    fn drop(&mut self) {
        // unlatch, then unpin
        drop(self.meta.take());
        self.pager.release(self.frame_id, false);
    }
}

/// Exclusive guard: one pin plus the page's write latch. Mutation goes
/// through `data_mut`, which marks the guard dirty; the dirty bit is
/// merged into the frame on release and never cleared by it.
pub struct PageWrite<'a> {
    pub(super) pager: &'a Pager,
    pub(super) frame_id: usize,
    pub(super) pgid: PageId,
    pub(super) dirty: bool,
    pub(super) meta: Option<RwLockWriteGuard<'a, PageMeta>>,
}

impl<'a> PageWrite<'a> {
    pub fn page_id(&self) -> PageId {
        self.pgid
    }

    pub fn data(&self) -> &[u8] {
        // SAFETY: the guard holds the frame's write latch, so the frame
        // buffer is not aliased for as long as `self` lives.
        unsafe { std::slice::from_raw_parts(self.pager.frame_ptr(self.frame_id), PAGE_SIZE) }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.dirty = true;
        // SAFETY: same as `data`, and `&mut self` guarantees this is
        // the only live reference derived from the guard.
        unsafe { std::slice::from_raw_parts_mut(self.pager.frame_ptr(self.frame_id), PAGE_SIZE) }
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Atomically trades the write latch for a read latch, keeping the
    /// pin. Writers blocked on this page stay blocked; readers proceed.
    pub fn downgrade(mut self) -> PageRead<'a> {
        if self.dirty {
            self.pager.note_dirty(self.frame_id);
        }
        let meta = RwLockWriteGuard::downgrade(self.meta.take().unwrap());
        let guard = PageRead {
            pager: self.pager,
            frame_id: self.frame_id,
            pgid: self.pgid,
            meta: Some(meta),
        };
        std::mem::forget(self);
        guard
    }
}

impl Drop for PageWrite<'_> {
    fn drop(&mut self) {
        // unlatch, then unpin
        drop(self.meta.take());
        self.pager.release(self.frame_id, self.dirty);
    }
}
