mod btree;
mod disk;
mod id;
mod pager;

pub use btree::{BPlusTree, BytewiseComparator, Cursor, KeyComparator};
pub use disk::{DiskManager, FileDisk, MemDisk};
pub use id::{PageId, PageIdExt, RecordId};
pub use pager::{PagePin, PageRead, PageWrite, Pager};

/// Size of every page, in memory and on disk.
pub const PAGE_SIZE: usize = 4096;
