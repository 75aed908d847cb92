use crate::id::PageId;
use crate::PAGE_SIZE;
use anyhow::anyhow;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Blocking page-granular storage backend. The pager is the only caller;
/// it serializes its own access to each page, so implementations only
/// need to be internally consistent, not transactional.
pub trait DiskManager: Send + Sync {
    fn read_page(&self, pgid: PageId, buff: &mut [u8]) -> anyhow::Result<()>;
    fn write_page(&self, pgid: PageId, buff: &[u8]) -> anyhow::Result<()>;

    /// Returns a fresh page id whose backing region reads as zeroes.
    /// Deallocated ids may be recycled.
    fn allocate_page(&self) -> anyhow::Result<PageId>;
    fn deallocate_page(&self, pgid: PageId) -> anyhow::Result<()>;

    fn sync(&self) -> anyhow::Result<()>;

    /// Final flush before the backend is discarded. No further calls
    /// are made after this returns.
    fn shutdown(&self) -> anyhow::Result<()> {
        self.sync()
    }
}

struct AllocState {
    next_pgid: u32,
    freelist: Vec<PageId>,
}

impl AllocState {
    fn allocate(&mut self) -> PageId {
        if let Some(pgid) = self.freelist.pop() {
            return pgid;
        }
        let pgid = PageId::new(self.next_pgid).unwrap();
        self.next_pgid += 1;
        pgid
    }
}

/// Single-file disk manager. Page `i` lives at byte offset
/// `i * PAGE_SIZE`; slot 0 of the file is reserved so that offset 0
/// never aliases a real page.
pub struct FileDisk {
    f: Mutex<File>,
    state: Mutex<AllocState>,
}

impl FileDisk {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        if !f.metadata()?.is_file() {
            return Err(anyhow!("db file is not a regular file"));
        }

        let size = f.metadata()?.len();
        let next_pgid = std::cmp::max(1, (size / PAGE_SIZE as u64) as u32);

        Ok(Self {
            f: Mutex::new(f),
            state: Mutex::new(AllocState {
                next_pgid,
                freelist: Vec::new(),
            }),
        })
    }
}

impl DiskManager for FileDisk {
    fn read_page(&self, pgid: PageId, buff: &mut [u8]) -> anyhow::Result<()> {
        assert_eq!(PAGE_SIZE, buff.len());
        let mut f = self.f.lock();
        let offset = pgid.get() as u64 * PAGE_SIZE as u64;
        let file_size = f.metadata()?.len();
        if offset + PAGE_SIZE as u64 > file_size {
            return Err(anyhow!(
                "page {:?} is out of bound for reading since file_size={}",
                pgid,
                file_size,
            ));
        }
        f.seek(SeekFrom::Start(offset))?;
        f.read_exact(buff)?;
        Ok(())
    }

    fn write_page(&self, pgid: PageId, buff: &[u8]) -> anyhow::Result<()> {
        assert_eq!(PAGE_SIZE, buff.len());
        let mut f = self.f.lock();
        let offset = pgid.get() as u64 * PAGE_SIZE as u64;
        let file_size = f.metadata()?.len();
        if offset + PAGE_SIZE as u64 > file_size {
            f.set_len(offset + PAGE_SIZE as u64)?;
        }
        f.seek(SeekFrom::Start(offset))?;
        f.write_all(buff)?;
        Ok(())
    }

    fn allocate_page(&self) -> anyhow::Result<PageId> {
        let pgid = self.state.lock().allocate();

        // Grow the file eagerly. set_len zero-fills, so a page that is
        // fetched before its first write reads as all zeroes.
        let mut f = self.f.lock();
        let min_size = (pgid.get() as u64 + 1) * PAGE_SIZE as u64;
        if f.metadata()?.len() < min_size {
            f.set_len(min_size)?;
        }
        Ok(pgid)
    }

    fn deallocate_page(&self, pgid: PageId) -> anyhow::Result<()> {
        self.state.lock().freelist.push(pgid);
        Ok(())
    }

    fn sync(&self) -> anyhow::Result<()> {
        self.f.lock().sync_all()?;
        Ok(())
    }
}

/// In-memory disk manager for tests and benchmarks.
pub struct MemDisk {
    pages: Mutex<HashMap<PageId, Box<[u8]>>>,
    state: Mutex<AllocState>,
}

impl MemDisk {
    pub fn new() -> Self {
        Self {
            pages: Mutex::new(HashMap::new()),
            state: Mutex::new(AllocState {
                next_pgid: 1,
                freelist: Vec::new(),
            }),
        }
    }
}

impl Default for MemDisk {
    fn default() -> Self {
        Self::new()
    }
}

impl DiskManager for MemDisk {
    fn read_page(&self, pgid: PageId, buff: &mut [u8]) -> anyhow::Result<()> {
        assert_eq!(PAGE_SIZE, buff.len());
        let pages = self.pages.lock();
        let Some(page) = pages.get(&pgid) else {
            return Err(anyhow!("page {:?} was never allocated", pgid));
        };
        buff.copy_from_slice(page);
        Ok(())
    }

    fn write_page(&self, pgid: PageId, buff: &[u8]) -> anyhow::Result<()> {
        assert_eq!(PAGE_SIZE, buff.len());
        let mut pages = self.pages.lock();
        let Some(page) = pages.get_mut(&pgid) else {
            return Err(anyhow!("page {:?} was never allocated", pgid));
        };
        page.copy_from_slice(buff);
        Ok(())
    }

    fn allocate_page(&self) -> anyhow::Result<PageId> {
        let pgid = self.state.lock().allocate();
        self.pages
            .lock()
            .insert(pgid, vec![0u8; PAGE_SIZE].into_boxed_slice());
        Ok(pgid)
    }

    fn deallocate_page(&self, pgid: PageId) -> anyhow::Result<()> {
        self.pages.lock().remove(&pgid);
        self.state.lock().freelist.push(pgid);
        Ok(())
    }

    fn sync(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_disk_round_trip() {
        let disk = MemDisk::new();
        let pgid = disk.allocate_page().unwrap();
        assert_eq!(1, pgid.get());

        let mut content = vec![0u8; PAGE_SIZE];
        content[0] = 0xab;
        content[PAGE_SIZE - 1] = 0xcd;
        disk.write_page(pgid, &content).unwrap();

        let mut buff = vec![0u8; PAGE_SIZE];
        disk.read_page(pgid, &mut buff).unwrap();
        assert_eq!(content, buff);
    }

    #[test]
    fn test_mem_disk_recycles_deallocated_ids() {
        let disk = MemDisk::new();
        let a = disk.allocate_page().unwrap();
        let b = disk.allocate_page().unwrap();
        assert_ne!(a, b);

        disk.deallocate_page(a).unwrap();
        let c = disk.allocate_page().unwrap();
        assert_eq!(a, c);

        let mut buff = vec![1u8; PAGE_SIZE];
        disk.read_page(c, &mut buff).unwrap();
        assert!(buff.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_file_disk_fresh_page_reads_zeroes() {
        let dir = tempfile::tempdir().unwrap();
        let disk = FileDisk::open(&dir.path().join("main")).unwrap();

        let pgid = disk.allocate_page().unwrap();
        let mut buff = vec![1u8; PAGE_SIZE];
        disk.read_page(pgid, &mut buff).unwrap();
        assert!(buff.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_file_disk_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main");

        let pgid;
        {
            let disk = FileDisk::open(&path).unwrap();
            pgid = disk.allocate_page().unwrap();
            disk.write_page(pgid, &vec![7u8; PAGE_SIZE]).unwrap();
            disk.sync().unwrap();
        }

        let disk = FileDisk::open(&path).unwrap();
        let mut buff = vec![0u8; PAGE_SIZE];
        disk.read_page(pgid, &mut buff).unwrap();
        assert!(buff.iter().all(|b| *b == 7));

        // ids handed out after reopen must not collide with live pages
        let fresh = disk.allocate_page().unwrap();
        assert_ne!(pgid, fresh);
    }
}
