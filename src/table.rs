//! Record-level CRUD over a paged file, coordinating slot allocation,
//! free-slot accounting, and write-ahead logging.

use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::buffer_pool::BufferPool;
use crate::page::{DataPage, DirectoryPage};
use crate::paged_file::PagedFile;
use crate::wal::LogManager;
use crate::{PageId, Rid};

/// A table of fixed-size records.
///
/// Every mutation is buffered in the log before the page image changes;
/// durability of those records is deferred to transaction commit.
pub struct Table {
    name: String,
    file: PagedFile,
    record_size: u16,
    // The page new inserts currently target.
    next_free_pid: Mutex<PageId>,
    pool: Arc<BufferPool>,
    log: Arc<LogManager>,
}

impl Table {
    /// Creates the table's paged file at `path` and allocates its first
    /// data page.
    pub fn create<P: AsRef<Path>>(
        path: P,
        record_size: u16,
        pool: Arc<BufferPool>,
        log: Arc<LogManager>,
    ) -> io::Result<Self> {
        let name = path.as_ref().display().to_string();
        let file = PagedFile::create(path, record_size, Arc::clone(&pool))?;
        let first = file.allocate_page();
        if !first.is_valid() {
            return Err(io::Error::other("failed to allocate first table page"));
        }
        Ok(Self {
            name,
            file,
            record_size,
            next_free_pid: Mutex::new(first),
            pool,
            log,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn record_size(&self) -> u16 {
        self.record_size
    }

    pub fn paged_file(&self) -> &PagedFile {
        &self.file
    }

    /// Inserts a record, returning its RID or [`Rid::INVALID`] if no page
    /// can take it or the log append fails.
    pub fn insert(&self, record: &[u8]) -> Rid {
        if record.len() != self.record_size as usize {
            return Rid::INVALID;
        }

        loop {
            let local_pid = *self.next_free_pid.lock().unwrap();
            let Some(frame) = self.pool.pin_page(local_pid) else {
                return Rid::INVALID;
            };

            let inserted = {
                let mut buf = frame.data();
                let mut page = DataPage::new(&mut buf);
                match page.insert(record) {
                    Some(slot) => {
                        let new_rid = Rid::new(local_pid, slot);
                        if self.log.log_insert(new_rid, record) {
                            frame.mark_dirty();
                            Some(new_rid)
                        } else {
                            // Give the slot back so the resident frame still
                            // matches the directory's free count; the frame
                            // is not dirtied.
                            page.delete(slot);
                            None
                        }
                    }
                    None => Some(Rid::INVALID),
                }
            };
            self.pool.unpin_page(&frame);

            match inserted {
                Some(rid) if rid.is_valid() => {
                    if !self.take_free_slot(local_pid) {
                        return Rid::INVALID;
                    }
                    return rid;
                }
                Some(_) => {
                    // Page full. Re-check under the table latch whether a
                    // concurrent insert already switched pages.
                    let mut next = self.next_free_pid.lock().unwrap();
                    if *next == local_pid {
                        let new_pid = self.file.allocate_page();
                        if !new_pid.is_valid() {
                            return Rid::INVALID;
                        }
                        crate::granite_debug_log!(
                            "[Table::insert] {} switching to page {new_pid:?}",
                            self.name
                        );
                        *next = new_pid;
                    }
                }
                None => return Rid::INVALID,
            }
        }
    }

    /// Copies the record at `rid` into `out`. No log record is written.
    pub fn read(&self, rid: Rid, out: &mut [u8]) -> bool {
        if !rid.is_valid() || !self.file.page_exists(rid.page_id()) {
            return false;
        }
        let Some(frame) = self.pool.pin_page(rid.page_id()) else {
            return false;
        };
        let found = {
            let mut buf = frame.data();
            DataPage::new(&mut buf).read(rid.slot(), out)
        };
        self.pool.unpin_page(&frame);
        found
    }

    /// Overwrites the record at `rid` with the given after-image.
    pub fn update(&self, rid: Rid, record: &[u8]) -> bool {
        if !rid.is_valid() || record.len() != self.record_size as usize {
            return false;
        }
        let Some(frame) = self.pool.pin_page(rid.page_id()) else {
            return false;
        };
        let updated = {
            let mut buf = frame.data();
            self.log.log_update(rid, record) && DataPage::new(&mut buf).update(rid.slot(), record)
        };
        if updated {
            frame.mark_dirty();
        }
        self.pool.unpin_page(&frame);
        updated
    }

    /// Deletes the record at `rid` and returns its slot to the directory's
    /// free count.
    pub fn delete(&self, rid: Rid) -> bool {
        if !rid.is_valid() {
            return false;
        }
        let Some(frame) = self.pool.pin_page(rid.page_id()) else {
            return false;
        };
        let deleted = {
            let mut buf = frame.data();
            self.log.log_delete(rid) && DataPage::new(&mut buf).delete(rid.slot())
        };
        if deleted {
            frame.mark_dirty();
        }
        self.pool.unpin_page(&frame);
        if !deleted {
            return false;
        }
        self.return_free_slot(rid.page_id())
    }

    // Decrements free_slots for the page's directory entry after a
    // successful insert.
    fn take_free_slot(&self, pid: PageId) -> bool {
        let (dir_pid, idx) = self.file.dir_entry_location(pid);
        let Some(frame) = self.pool.pin_page(dir_pid) else {
            return false;
        };
        {
            let mut buf = frame.data();
            let mut dir = DirectoryPage::new(&mut buf);
            let mut entry = dir.entry(idx);
            assert!(entry.free_slots > 0, "free-slot accounting underflow");
            entry.free_slots -= 1;
            dir.set_entry(idx, entry);
        }
        frame.mark_dirty();
        self.pool.unpin_page(&frame);
        true
    }

    // Increments free_slots after a successful delete, capped at capacity.
    fn return_free_slot(&self, pid: PageId) -> bool {
        let (dir_pid, idx) = self.file.dir_entry_location(pid);
        let Some(frame) = self.pool.pin_page(dir_pid) else {
            return false;
        };
        {
            let mut buf = frame.data();
            let mut dir = DirectoryPage::new(&mut buf);
            let mut entry = dir.entry(idx);
            if entry.free_slots < DataPage::capacity(self.record_size) {
                entry.free_slots += 1;
            }
            dir.set_entry(idx, entry);
        }
        frame.mark_dirty();
        self.pool.unpin_page(&frame);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::DataPage;
    use tempfile::tempdir;

    struct Harness {
        _dir: tempfile::TempDir,
        table: Table,
        log: Arc<LogManager>,
    }

    fn harness(record_size: u16) -> Harness {
        let dir = tempdir().unwrap();
        let pool = Arc::new(BufferPool::new(16));
        let log = Arc::new(LogManager::open(dir.path().join("table.log"), 1 << 16).unwrap());
        let table = Table::create(
            dir.path().join("records"),
            record_size,
            pool,
            Arc::clone(&log),
        )
        .unwrap();
        Harness {
            _dir: dir,
            table,
            log,
        }
    }

    #[test]
    fn insert_read_round_trip() {
        let h = harness(8);
        let rid = h.table.insert(b"record-1");
        assert!(rid.is_valid());

        let mut out = [0u8; 8];
        assert!(h.table.read(rid, &mut out));
        assert_eq!(&out, b"record-1");
    }

    #[test]
    fn wrong_length_record_is_rejected() {
        let h = harness(8);
        assert!(!h.table.insert(b"too-long-record").is_valid());
        assert!(!h.table.insert(b"tiny").is_valid());
    }

    #[test]
    fn update_overwrites_in_place() {
        let h = harness(8);
        let rid = h.table.insert(b"original");
        assert!(h.table.update(rid, b"replaced"));

        let mut out = [0u8; 8];
        assert!(h.table.read(rid, &mut out));
        assert_eq!(&out, b"replaced");
        assert!(!h.table.update(Rid::INVALID, b"replaced"));
    }

    #[test]
    fn delete_makes_the_record_unreadable() {
        let h = harness(8);
        let rid = h.table.insert(b"deleteme");
        assert!(h.table.delete(rid));

        let mut out = [0u8; 8];
        assert!(!h.table.read(rid, &mut out));
        assert!(!h.table.delete(rid));
    }

    #[test]
    fn read_of_invalid_rid_fails() {
        let h = harness(8);
        let mut out = [0u8; 8];
        assert!(!h.table.read(Rid::INVALID, &mut out));
    }

    #[test]
    fn free_slots_track_live_records() {
        let h = harness(8);
        let capacity = DataPage::capacity(8);

        let r0 = h.table.insert(b"first---");
        let r1 = h.table.insert(b"second--");
        let pid = r0.page_id();

        let entry = h.table.paged_file().dir_entry(pid).unwrap();
        assert_eq!(entry.free_slots, capacity - 2);

        assert!(h.table.delete(r1));
        let entry = h.table.paged_file().dir_entry(pid).unwrap();
        assert_eq!(entry.free_slots, capacity - 1);
    }

    #[test]
    fn failed_log_append_fails_the_insert() {
        let h = harness(8);
        h.log.faults().arm_times("wal.append", 1);
        assert!(!h.table.insert(b"blocked!").is_valid());

        // The slot was not handed out: once the one-shot fault has burned
        // off, the next insert takes slot 0.
        let rid = h.table.insert(b"welcome!");
        assert!(rid.is_valid());
        assert_eq!(rid.slot(), 0);
    }

    #[test]
    fn failed_log_append_fails_update_and_delete() {
        let h = harness(8);
        let rid = h.table.insert(b"persists");

        h.log.faults().arm("wal.append");
        assert!(!h.table.update(rid, b"mutation"));
        assert!(!h.table.delete(rid));
        h.log.faults().disarm("wal.append");

        let mut out = [0u8; 8];
        assert!(h.table.read(rid, &mut out));
        assert_eq!(&out, b"persists");
    }
}
