use crate::disk::DiskManager;
use crate::id::PageId;
use crate::pager::evictor::LruKEvictor;
use crate::pager::page::{PageMeta, PagePin, PageRead, PageWrite};
use crate::PAGE_SIZE;
use anyhow::anyhow;
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use std::collections::{HashMap, HashSet};

/// Buffer pool. Maps page ids to a fixed array of in-memory frames,
/// loading and evicting through the disk manager as frames run out.
///
/// Locking is layered: each frame has its own reader/writer latch
/// guarding the frame's metadata and buffer bytes, and one pool-wide
/// mutex guards the page table, free list, pin counts and dirty set.
/// The pool mutex is the innermost lock. A thread may take it while
/// holding page latches, but never blocks on a latch while holding it;
/// the only latches acquired under the pool mutex belong to frames
/// with pin count zero, which no guard can be holding. The one piece
/// of disk I/O performed under the pool mutex is the write-back of a
/// dirty eviction victim.
pub struct Pager {
    n: usize,
    disk: Box<dyn DiskManager>,
    latches: Box<[RwLock<PageMeta>]>,
    buffer: *mut u8,
    internal: Mutex<PagerInternal>,
    evictor: Mutex<LruKEvictor>,
}

// SAFETY: the frame buffer behind the raw pointer is only ever turned
// into a reference while the owning frame's latch is held (shared for
// `&`, exclusive for `&mut`), or while the pool mutex is held and the
// frame's pin count is zero, in which case no guard can alias it.
unsafe impl Send for Pager {}
unsafe impl Sync for Pager {}

struct PagerInternal {
    page_to_frame: HashMap<PageId, usize>,
    free_list: Vec<usize>,
    ref_count: Box<[usize]>,
    dirty_frames: HashSet<usize>,
}

enum Acquired<'a> {
    /// The page was resident; the caller still has to latch it.
    Hit(usize),
    /// The page was loaded into a fresh frame; the caller inherits the
    /// frame's write latch, already holding the page content.
    Loaded(usize, RwLockWriteGuard<'a, PageMeta>),
}

impl Pager {
    pub fn new(disk: Box<dyn DiskManager>, pool_size: usize, k: usize) -> anyhow::Result<Self> {
        if pool_size < 1 {
            return Err(anyhow!(
                "the size of the buffer pool must be at least 1, but got {pool_size}",
            ));
        }
        if k < 1 {
            return Err(anyhow!("the evictor's k must be at least 1, but got {k}"));
        }

        let Some(buffer_size) = PAGE_SIZE.checked_mul(pool_size) else {
            return Err(anyhow!("page size * pool size overflows: {pool_size}"));
        };

        let latches = (0..pool_size)
            .map(|_| RwLock::new(PageMeta { id: None }))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            n: pool_size,
            disk,
            latches,
            buffer: vec![0u8; buffer_size].leak().as_mut_ptr(),
            internal: Mutex::new(PagerInternal {
                page_to_frame: HashMap::with_capacity(pool_size),
                free_list: (0..pool_size).rev().collect(),
                ref_count: vec![0; pool_size].into_boxed_slice(),
                dirty_frames: HashSet::default(),
            }),
            evictor: Mutex::new(LruKEvictor::new(pool_size, k)),
        })
    }

    pub fn pool_size(&self) -> usize {
        self.n
    }

    /// Number of pages currently resident.
    pub fn page_count(&self) -> usize {
        self.internal.lock().page_to_frame.len()
    }

    /// Pin count of a resident page, None if the page is not resident.
    pub fn pin_count(&self, pgid: PageId) -> Option<usize> {
        let internal = self.internal.lock();
        let frame_id = internal.page_to_frame.get(&pgid).copied()?;
        Some(internal.ref_count[frame_id])
    }

    /// Number of resident frames whose pin count is zero.
    pub fn evictable_count(&self) -> usize {
        self.evictor.lock().len()
    }

    /// Fetches a page shared: pin plus read latch.
    pub fn fetch_read(&self, pgid: PageId) -> anyhow::Result<PageRead> {
        match self.pin_or_load(pgid)? {
            Acquired::Hit(frame_id) => {
                let meta = self.latches[frame_id].read();
                debug_assert_eq!(Some(pgid), meta.id);
                Ok(PageRead {
                    pager: self,
                    frame_id,
                    pgid,
                    meta: Some(meta),
                })
            }
            Acquired::Loaded(frame_id, meta) => Ok(PageRead {
                pager: self,
                frame_id,
                pgid,
                meta: Some(RwLockWriteGuard::downgrade(meta)),
            }),
        }
    }

    /// Fetches a page exclusive: pin plus write latch.
    pub fn fetch_write(&self, pgid: PageId) -> anyhow::Result<PageWrite> {
        match self.pin_or_load(pgid)? {
            Acquired::Hit(frame_id) => {
                let meta = self.latches[frame_id].write();
                debug_assert_eq!(Some(pgid), meta.id);
                Ok(PageWrite {
                    pager: self,
                    frame_id,
                    pgid,
                    dirty: false,
                    meta: Some(meta),
                })
            }
            Acquired::Loaded(frame_id, meta) => Ok(PageWrite {
                pager: self,
                frame_id,
                pgid,
                dirty: false,
                meta: Some(meta),
            }),
        }
    }

    /// Fetches a page pinned but unlatched.
    pub fn fetch_pin(&self, pgid: PageId) -> anyhow::Result<PagePin> {
        match self.pin_or_load(pgid)? {
            Acquired::Hit(frame_id) => Ok(PagePin {
                pager: self,
                frame_id,
                pgid,
            }),
            Acquired::Loaded(frame_id, meta) => {
                drop(meta);
                Ok(PagePin {
                    pager: self,
                    frame_id,
                    pgid,
                })
            }
        }
    }

    /// Allocates a fresh page id and installs a zeroed page for it,
    /// returning it pinned and write-latched. The new frame starts
    /// clean; the disk manager guarantees the backing region also
    /// reads as zeroes.
    pub fn alloc(&self) -> anyhow::Result<PageWrite> {
        let (frame_id, mut meta) = {
            let mut internal = self.internal.lock();
            self.take_frame(&mut internal)?
        };

        let pgid = match self.disk.allocate_page() {
            Ok(pgid) => pgid,
            Err(err) => {
                drop(meta);
                self.internal.lock().free_list.push(frame_id);
                return Err(err);
            }
        };

        // SAFETY: we hold the frame's write latch, so the buffer is
        // not aliased.
        let buffer =
            unsafe { std::slice::from_raw_parts_mut(self.frame_ptr(frame_id), PAGE_SIZE) };
        buffer.fill(0);
        meta.id = Some(pgid);

        let mut internal = self.internal.lock();
        internal.page_to_frame.insert(pgid, frame_id);
        internal.ref_count[frame_id] = 1;
        self.evictor.lock().record_access(frame_id);
        drop(internal);

        log::debug!("allocated pgid={} frame={frame_id}", pgid.get());
        Ok(PageWrite {
            pager: self,
            frame_id,
            pgid,
            dirty: false,
            meta: Some(meta),
        })
    }

    /// Writes a resident page back to disk and clears its dirty flag.
    /// Returns false if the page is not resident.
    pub fn flush_page(&self, pgid: PageId) -> anyhow::Result<bool> {
        let frame_id = {
            let mut internal = self.internal.lock();
            let Some(frame_id) = internal.page_to_frame.get(&pgid).copied() else {
                return Ok(false);
            };
            // pin without an access stamp so the flush itself doesn't
            // perturb the eviction order
            internal.ref_count[frame_id] += 1;
            if internal.ref_count[frame_id] == 1 {
                self.evictor.lock().set_evictable(frame_id, false);
            }
            frame_id
        };

        let meta = self.latches[frame_id].read();
        debug_assert_eq!(Some(pgid), meta.id);
        // SAFETY: the read latch is held, so the buffer has no mutable
        // reference.
        let buffer = unsafe { std::slice::from_raw_parts(self.frame_ptr(frame_id), PAGE_SIZE) };
        let result = self.disk.write_page(pgid, buffer);

        if result.is_ok() {
            self.internal.lock().dirty_frames.remove(&frame_id);
        }
        drop(meta);
        self.release(frame_id, false);
        result.map(|_| true)
    }

    /// Flushes every resident page and syncs the disk.
    pub fn flush_all(&self) -> anyhow::Result<()> {
        let resident: Vec<PageId> = {
            let internal = self.internal.lock();
            internal.page_to_frame.keys().copied().collect()
        };
        for pgid in resident {
            self.flush_page(pgid)?;
        }
        self.disk.sync()?;
        Ok(())
    }

    /// Flushes everything and lets the disk manager finish. Owning
    /// `self` proves no guard is outstanding, so nothing can dirty a
    /// page after the flush.
    pub fn shutdown(self) -> anyhow::Result<()> {
        self.flush_all()?;
        self.disk.shutdown()?;
        Ok(())
    }

    /// Drops a page from the pool and returns its id to the disk
    /// manager. Returns false while the page is pinned.
    pub fn delete_page(&self, pgid: PageId) -> anyhow::Result<bool> {
        {
            let mut internal = self.internal.lock();
            let Some(frame_id) = internal.page_to_frame.get(&pgid).copied() else {
                drop(internal);
                self.disk.deallocate_page(pgid)?;
                return Ok(true);
            };
            if internal.ref_count[frame_id] > 0 {
                return Ok(false);
            }

            // latch is instant: pin count zero means no guard holds it
            let mut meta = self.latches[frame_id].write();
            if internal.dirty_frames.contains(&frame_id) {
                // SAFETY: the write latch is held.
                let buffer =
                    unsafe { std::slice::from_raw_parts(self.frame_ptr(frame_id), PAGE_SIZE) };
                self.disk.write_page(pgid, buffer)?;
                internal.dirty_frames.remove(&frame_id);
            }
            meta.id = None;
            internal.page_to_frame.remove(&pgid);
            internal.free_list.push(frame_id);
            self.evictor.lock().remove(frame_id);
        }

        self.disk.deallocate_page(pgid)?;
        log::debug!("deleted pgid={}", pgid.get());
        Ok(true)
    }

    /// Pins `pgid`, loading it from disk into a free or evicted frame
    /// on a miss.
    ///
    /// Concurrent misses on the same page may both load it from disk;
    /// after the read we re-check the page table and the loser discards
    /// its frame and retries. Wasteful but correct, and it keeps disk
    /// reads out of the pool mutex.
    fn pin_or_load(&self, pgid: PageId) -> anyhow::Result<Acquired> {
        loop {
            let (frame_id, mut meta) = {
                let mut internal = self.internal.lock();
                if let Some(frame_id) = internal.page_to_frame.get(&pgid).copied() {
                    internal.ref_count[frame_id] += 1;
                    let mut evictor = self.evictor.lock();
                    evictor.record_access(frame_id);
                    evictor.set_evictable(frame_id, false);
                    return Ok(Acquired::Hit(frame_id));
                }
                self.take_frame(&mut internal)?
            };

            // SAFETY: we hold the frame's write latch, so the buffer
            // is not aliased.
            let buffer =
                unsafe { std::slice::from_raw_parts_mut(self.frame_ptr(frame_id), PAGE_SIZE) };
            if let Err(err) = self.disk.read_page(pgid, buffer) {
                drop(meta);
                self.internal.lock().free_list.push(frame_id);
                return Err(err);
            }

            let mut internal = self.internal.lock();
            if internal.page_to_frame.contains_key(&pgid) {
                // another thread installed the page while we read it
                drop(meta);
                internal.free_list.push(frame_id);
                continue;
            }
            meta.id = Some(pgid);
            internal.page_to_frame.insert(pgid, frame_id);
            internal.ref_count[frame_id] = 1;
            self.evictor.lock().record_access(frame_id);
            return Ok(Acquired::Loaded(frame_id, meta));
        }
    }

    /// Produces an empty frame, write-latched, with `meta.id == None`.
    /// Takes the head of the free list, or evicts the coldest frame,
    /// writing it back first if dirty.
    fn take_frame<'a>(
        &'a self,
        internal: &mut PagerInternal,
    ) -> anyhow::Result<(usize, RwLockWriteGuard<'a, PageMeta>)> {
        if let Some(frame_id) = internal.free_list.pop() {
            // latch is instant: free frames have no guards
            let meta = self.latches[frame_id].write();
            debug_assert!(meta.id.is_none());
            return Ok((frame_id, meta));
        }

        let Some(frame_id) = self.evictor.lock().evict() else {
            return Err(anyhow!("all pages are pinned"));
        };
        assert_eq!(
            0, internal.ref_count[frame_id],
            "evicted frame {frame_id} is still pinned",
        );

        // latch is instant: an evictable frame has pin count zero
        let mut meta = self.latches[frame_id].write();
        let old_pgid = meta.id.expect("evicted frame must hold a page");

        if internal.dirty_frames.contains(&frame_id) {
            // SAFETY: the write latch is held.
            let buffer = unsafe { std::slice::from_raw_parts(self.frame_ptr(frame_id), PAGE_SIZE) };
            if let Err(err) = self.disk.write_page(old_pgid, buffer) {
                // put the victim back so the pool stays consistent
                let mut evictor = self.evictor.lock();
                evictor.record_access(frame_id);
                evictor.set_evictable(frame_id, true);
                return Err(err);
            }
            internal.dirty_frames.remove(&frame_id);
        }

        meta.id = None;
        internal.page_to_frame.remove(&old_pgid);
        log::debug!("evicted pgid={} frame={frame_id}", old_pgid.get());
        Ok((frame_id, meta))
    }

    /// Unpin. OR-merges the dirty bit; when the pin count reaches zero
    /// the frame becomes an eviction candidate. Called by guards after
    /// they dropped their latch.
    pub(super) fn release(&self, frame_id: usize, dirty: bool) {
        let mut internal = self.internal.lock();
        if dirty {
            internal.dirty_frames.insert(frame_id);
        }
        if internal.ref_count[frame_id] > 0 {
            internal.ref_count[frame_id] -= 1;
            if internal.ref_count[frame_id] == 0 {
                self.evictor.lock().set_evictable(frame_id, true);
            }
        }
    }

    pub(super) fn note_dirty(&self, frame_id: usize) {
        self.internal.lock().dirty_frames.insert(frame_id);
    }

    pub(super) fn latch(&self, frame_id: usize) -> &RwLock<PageMeta> {
        &self.latches[frame_id]
    }

    pub(super) fn frame_ptr(&self, frame_id: usize) -> *mut u8 {
        assert!(frame_id < self.n);
        // SAFETY: frame_id < n, and the buffer is n pages long, so the
        // resulting address stays inside the allocation.
        unsafe { self.buffer.add(frame_id * PAGE_SIZE) }
    }
}

impl Drop for Pager {
    fn drop(&mut self) {
        // SAFETY: the buffer was leaked from a Vec of exactly this
        // length in `new`, and `&mut self` proves no guard is alive.
        unsafe {
            drop(Vec::from_raw_parts(
                self.buffer,
                PAGE_SIZE * self.n,
                PAGE_SIZE * self.n,
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::MemDisk;
    use rand::Rng;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_pager(pool_size: usize, k: usize) -> Pager {
        Pager::new(Box::new(MemDisk::new()), pool_size, k).unwrap()
    }

    #[test]
    fn test_alloc_pins_until_dropped() {
        let pager = test_pager(3, 2);

        let page = pager.alloc().unwrap();
        let pgid = page.page_id();
        assert_eq!(1, pager.page_count());
        assert_eq!(Some(1), pager.pin_count(pgid));
        assert_eq!(0, pager.evictable_count());

        drop(page);
        assert_eq!(Some(0), pager.pin_count(pgid));
        assert_eq!(1, pager.evictable_count());
    }

    #[test]
    fn test_pool_exhaustion_and_eviction() {
        let pager = test_pager(3, 2);

        let p0 = pager.alloc().unwrap();
        let p1 = pager.alloc().unwrap();
        let p2 = pager.alloc().unwrap();
        assert_eq!(0, pager.evictable_count());

        // every frame is pinned
        assert!(pager.alloc().is_err());

        let evicted_pgid = p1.page_id();
        drop(p1);
        assert_eq!(1, pager.evictable_count());

        // the only unpinned page gets evicted
        let p3 = pager.alloc().unwrap();
        assert_eq!(None, pager.pin_count(evicted_pgid));
        assert_eq!(3, pager.page_count());

        drop(p0);
        drop(p2);
        drop(p3);
    }

    #[test]
    fn test_fetch_same_page_twice_hits() {
        let pager = test_pager(3, 2);
        let pgid = {
            let page = pager.alloc().unwrap();
            page.page_id()
        };

        let a = pager.fetch_read(pgid).unwrap();
        let b = pager.fetch_read(pgid).unwrap();
        assert_eq!(a.page_id(), b.page_id());
        assert_eq!(Some(2), pager.pin_count(pgid));
        assert_eq!(1, pager.page_count());

        drop(a);
        assert_eq!(Some(1), pager.pin_count(pgid));
        drop(b);
        assert_eq!(Some(0), pager.pin_count(pgid));
    }

    #[test]
    fn test_write_survives_eviction() {
        let pager = test_pager(1, 2);

        let pgid = {
            let mut page = pager.alloc().unwrap();
            let id = page.page_id();
            page.data_mut()[0] = 42;
            page.data_mut()[PAGE_SIZE - 1] = 24;
            id
        };

        // force the dirty page out of the single frame
        let other = pager.alloc().unwrap();
        drop(other);

        let page = pager.fetch_read(pgid).unwrap();
        assert_eq!(42, page.data()[0]);
        assert_eq!(24, page.data()[PAGE_SIZE - 1]);
    }

    #[test]
    fn test_flush_clears_dirty() {
        let pager = test_pager(2, 2);

        let pgid = {
            let mut page = pager.alloc().unwrap();
            let id = page.page_id();
            page.data_mut()[7] = 7;
            id
        };

        assert!(pager.flush_page(pgid).unwrap());
        let missing = PageId::new(999).unwrap();
        assert!(!pager.flush_page(missing).unwrap());

        let page = pager.fetch_read(pgid).unwrap();
        assert_eq!(7, page.data()[7]);
    }

    #[test]
    fn test_delete_page() {
        let pager = test_pager(2, 2);
        let page = pager.alloc().unwrap();
        let pgid = page.page_id();

        // pinned pages refuse deletion
        assert!(!pager.delete_page(pgid).unwrap());
        drop(page);

        assert!(pager.delete_page(pgid).unwrap());
        assert_eq!(0, pager.page_count());
        assert_eq!(0, pager.evictable_count());

        // non-resident deletion succeeds trivially
        assert!(pager.delete_page(PageId::new(50).unwrap()).unwrap());
    }

    #[test]
    fn test_pin_guard_upgrades() {
        let pager = test_pager(2, 2);
        let pgid = {
            let mut page = pager.alloc().unwrap();
            page.data_mut()[0] = 9;
            page.page_id()
        };

        let pin = pager.fetch_pin(pgid).unwrap();
        assert_eq!(pgid, pin.page_id());
        assert_eq!(Some(1), pager.pin_count(pgid));

        let read = pin.into_read();
        assert_eq!(9, read.data()[0]);
        assert_eq!(Some(1), pager.pin_count(pgid));
        drop(read);

        let pin = pager.fetch_pin(pgid).unwrap();
        let mut write = pin.into_write();
        write.data_mut()[0] = 10;
        drop(write);

        assert_eq!(Some(0), pager.pin_count(pgid));
        let read = pager.fetch_read(pgid).unwrap();
        assert_eq!(10, read.data()[0]);
    }

    #[test]
    fn test_downgrade_keeps_pin_and_dirt() {
        let pager = test_pager(1, 2);
        let mut page = pager.alloc().unwrap();
        let pgid = page.page_id();
        page.data_mut()[3] = 3;

        let read = page.downgrade();
        assert_eq!(3, read.data()[3]);
        assert_eq!(Some(1), pager.pin_count(pgid));
        drop(read);

        // the write must survive eviction, so the dirty bit carried over
        let other = pager.alloc().unwrap();
        drop(other);
        let page = pager.fetch_read(pgid).unwrap();
        assert_eq!(3, page.data()[3]);
    }

    #[test]
    fn test_fetch_unknown_page_leaves_pool_intact() {
        let pager = test_pager(2, 2);
        let never_allocated = PageId::new(77).unwrap();
        assert!(pager.fetch_read(never_allocated).is_err());

        // the reserved frame went back to the free list
        assert_eq!(0, pager.page_count());
        assert_eq!(None, pager.pin_count(never_allocated));
        let page = pager.alloc().unwrap();
        let other = pager.alloc().unwrap();
        drop(page);
        drop(other);
        assert_eq!(2, pager.page_count());
    }

    #[test]
    fn test_shutdown_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main");

        let pgid;
        {
            let disk = Box::new(crate::disk::FileDisk::open(&path).unwrap());
            let pager = Pager::new(disk, 2, 2).unwrap();
            let mut page = pager.alloc().unwrap();
            pgid = page.page_id();
            page.data_mut()[0] = 11;
            drop(page);
            pager.shutdown().unwrap();
        }

        let disk = Box::new(crate::disk::FileDisk::open(&path).unwrap());
        let pager = Pager::new(disk, 2, 2).unwrap();
        let page = pager.fetch_read(pgid).unwrap();
        assert_eq!(11, page.data()[0]);
    }

    #[test]
    fn test_concurrent_fetches_single_residency() {
        let pager = test_pager(10, 2);
        let mut pgids = Vec::new();
        for _ in 0..5 {
            pgids.push(pager.alloc().unwrap().page_id());
        }

        let hits = AtomicUsize::new(0);
        std::thread::scope(|scope| {
            let pager = &pager;
            let pgids = &pgids;
            let hits = &hits;
            for _ in 0..8 {
                scope.spawn(move || {
                    let mut randomizer = rand::thread_rng();
                    for _ in 0..200 {
                        let pgid = pgids[randomizer.gen_range(0..pgids.len())];
                        if randomizer.gen_bool(0.5) {
                            let page = pager.fetch_read(pgid).unwrap();
                            assert_eq!(pgid, page.page_id());
                        } else {
                            let mut page = pager.fetch_write(pgid).unwrap();
                            let probe = page.data()[1];
                            page.data_mut()[0] = probe;
                        }
                        hits.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(8 * 200, hits.into_inner());
        assert_eq!(5, pager.page_count());
        for pgid in pgids {
            assert_eq!(Some(0), pager.pin_count(pgid));
        }
        assert_eq!(5, pager.evictable_count());
    }

    #[test]
    fn test_concurrent_eviction_churn() {
        let pager = test_pager(4, 2);
        let mut pgids = Vec::new();
        for i in 0..16u8 {
            let mut page = pager.alloc().unwrap();
            page.data_mut().fill(i);
            pgids.push(page.page_id());
        }

        std::thread::scope(|scope| {
            let pager = &pager;
            let pgids = &pgids;
            for _ in 0..6 {
                scope.spawn(move || {
                    let mut randomizer = rand::thread_rng();
                    for _ in 0..100 {
                        let i = randomizer.gen_range(0..pgids.len());
                        let page = pager.fetch_read(pgids[i]).unwrap();
                        let first = page.data()[0];
                        assert_eq!(i as u8, first);
                        assert!(page.data().iter().all(|b| *b == first));
                    }
                });
            }
        });

        assert_eq!(4, pager.page_count());
    }
}
