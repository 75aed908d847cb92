use minnow::{FileDisk, Pager, PAGE_SIZE};
use std::sync::Once;

static INIT: Once = Once::new();
fn setup() {
    INIT.call_once(|| {
        env_logger::init();
    });
}

#[test]
fn test_file_backed_pager_round_trip() {
    setup();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("main");

    let mut pgids = Vec::new();
    {
        let disk = Box::new(FileDisk::open(&path).unwrap());
        let pager = Pager::new(disk, 4, 2).unwrap();

        // more pages than frames, so some writes reach the file
        // through eviction and the rest through the final flush
        for i in 0u8..10 {
            let mut page = pager.alloc().unwrap();
            page.data_mut().fill(i);
            pgids.push(page.page_id());
        }
        pager.shutdown().unwrap();
    }

    let disk = Box::new(FileDisk::open(&path).unwrap());
    let pager = Pager::new(disk, 4, 2).unwrap();
    for (i, pgid) in pgids.iter().enumerate() {
        let page = pager.fetch_read(*pgid).unwrap();
        assert!(
            page.data().iter().all(|b| *b == i as u8),
            "page {pgid:?} lost its content",
        );
    }
}

#[test]
fn test_write_guard_scope_and_flush() {
    setup();

    let dir = tempfile::tempdir().unwrap();
    let disk = Box::new(FileDisk::open(&dir.path().join("main")).unwrap());
    let pager = Pager::new(disk, 3, 2).unwrap();

    let pgid = {
        let mut page = pager.alloc().unwrap();
        let pgid = page.page_id();
        page.data_mut()[0] = 0x5a;
        page.data_mut()[PAGE_SIZE - 1] = 0xa5;
        page.mark_dirty();
        pgid
    };

    // the guard went out of scope: the pin is gone
    assert_eq!(Some(0), pager.pin_count(pgid));
    assert_eq!(1, pager.evictable_count());

    assert!(pager.flush_page(pgid).unwrap());
    let page = pager.fetch_read(pgid).unwrap();
    assert_eq!(0x5a, page.data()[0]);
    assert_eq!(0xa5, page.data()[PAGE_SIZE - 1]);
}
