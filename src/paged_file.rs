//! A paged file: one data file plus a `<name>.dir` directory file whose
//! entries track creation, allocation, and free-slot counts for every data
//! page.

use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::base_file::BaseFile;
use crate::buffer_pool::BufferPool;
use crate::page::{DataPage, DirEntry, DirectoryPage, ENTRIES_PER_DIR_PAGE};
use crate::PageId;

pub struct PagedFile {
    data: Arc<BaseFile>,
    dir: Arc<BaseFile>,
    record_size: u16,
    pool: Arc<BufferPool>,
    // Serializes directory mutation so two allocators cannot claim the same
    // scavenged slot or create overlapping directory pages.
    alloc_latch: Mutex<()>,
}

impl PagedFile {
    /// Opens `<path>` and `<path>.dir`, registers both with the buffer
    /// pool, and initializes the first directory page.
    pub fn create<P: AsRef<Path>>(
        path: P,
        record_size: u16,
        pool: Arc<BufferPool>,
    ) -> io::Result<Self> {
        if DataPage::capacity(record_size) == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported record size {record_size}"),
            ));
        }

        let path = path.as_ref();
        let data = Arc::new(BaseFile::open(path)?);
        let mut dir_path = path.as_os_str().to_os_string();
        dir_path.push(".dir");
        let dir = Arc::new(BaseFile::open(&dir_path)?);

        pool.register_file(Arc::clone(&data));
        pool.register_file(Arc::clone(&dir));

        let file = Self {
            data,
            dir,
            record_size,
            pool,
            alloc_latch: Mutex::new(()),
        };

        let dir_pid = file.dir.create_page();
        if !dir_pid.is_valid() {
            return Err(io::Error::other("failed to create first directory page"));
        }
        if !file.init_directory_page(dir_pid) {
            return Err(io::Error::other("failed to initialize first directory page"));
        }
        Ok(file)
    }

    pub fn data_file(&self) -> &Arc<BaseFile> {
        &self.data
    }

    pub fn dir_file(&self) -> &Arc<BaseFile> {
        &self.dir
    }

    pub fn record_size(&self) -> u16 {
        self.record_size
    }

    /// The directory page and entry index describing `pid`.
    pub fn dir_entry_location(&self, pid: PageId) -> (PageId, usize) {
        let page_num = pid.page_num() as usize;
        (
            PageId::new(self.dir.id(), (page_num / ENTRIES_PER_DIR_PAGE) as u16),
            page_num % ENTRIES_PER_DIR_PAGE,
        )
    }

    /// Reads the directory entry for `pid`, if the directory tracks it.
    pub fn dir_entry(&self, pid: PageId) -> Option<DirEntry> {
        if !pid.is_valid() {
            return None;
        }
        let page_num = pid.page_num() as usize;
        if page_num >= ENTRIES_PER_DIR_PAGE * self.dir.page_count() as usize {
            return None;
        }
        let (dir_pid, idx) = self.dir_entry_location(pid);
        let frame = self.pool.pin_page(dir_pid)?;
        let entry = {
            let mut buf = frame.data();
            DirectoryPage::new(&mut buf).entry(idx)
        };
        self.pool.unpin_page(&frame);
        Some(entry)
    }

    /// Allocates a data page, preferring a scavenged one. Returns
    /// [`PageId::INVALID`] on failure.
    pub fn allocate_page(&self) -> PageId {
        let _guard = self.alloc_latch.lock().unwrap();

        // 1. Reclaim a previously deallocated page if one exists.
        let scavenged = self.scavenge_locked();
        if scavenged.is_valid() {
            if let Some(frame) = self.pool.pin_page(scavenged) {
                {
                    let mut buf = frame.data();
                    DataPage::new(&mut buf).init(self.record_size);
                }
                frame.mark_dirty();
                self.pool.unpin_page(&frame);
            }
            crate::granite_debug_log!("[PagedFile::allocate_page] Scavenged {scavenged:?}");
            return scavenged;
        }

        // 2. Create a new data page, growing the directory first if this
        //    page falls beyond the entries it tracks.
        let data_pid = self.data.create_page();
        if !data_pid.is_valid() {
            return PageId::INVALID;
        }
        let page_num = data_pid.page_num() as usize;
        if page_num >= ENTRIES_PER_DIR_PAGE * self.dir.page_count() as usize {
            let new_dir_pid = self.dir.create_page();
            if !new_dir_pid.is_valid() || !self.init_directory_page(new_dir_pid) {
                return PageId::INVALID;
            }
        }

        // 3. Flip the new entry to created + allocated.
        let (dir_pid, idx) = self.dir_entry_location(data_pid);
        let Some(frame) = self.pool.pin_page(dir_pid) else {
            return PageId::INVALID;
        };
        {
            let mut buf = frame.data();
            DirectoryPage::new(&mut buf).set_entry(
                idx,
                DirEntry {
                    free_slots: DataPage::capacity(self.record_size),
                    allocated: 1,
                    created: 1,
                },
            );
        }
        frame.mark_dirty();
        self.pool.unpin_page(&frame);

        // 4. Format the data page header.
        let Some(frame) = self.pool.pin_page(data_pid) else {
            return PageId::INVALID;
        };
        {
            let mut buf = frame.data();
            DataPage::new(&mut buf).init(self.record_size);
        }
        frame.mark_dirty();
        self.pool.unpin_page(&frame);

        crate::granite_debug_log!("[PagedFile::allocate_page] Created {data_pid:?}");
        data_pid
    }

    /// Marks `pid` deallocated and zeroes its record count. False if the
    /// page was never created or is already deallocated.
    pub fn deallocate_page(&self, pid: PageId) -> bool {
        if !pid.is_valid() {
            return false;
        }
        let _guard = self.alloc_latch.lock().unwrap();

        let page_num = pid.page_num() as usize;
        if page_num >= ENTRIES_PER_DIR_PAGE * self.dir.page_count() as usize {
            return false;
        }
        let (dir_pid, idx) = self.dir_entry_location(pid);
        let Some(frame) = self.pool.pin_page(dir_pid) else {
            return false;
        };
        let deallocated = {
            let mut buf = frame.data();
            let mut dir = DirectoryPage::new(&mut buf);
            let mut entry = dir.entry(idx);
            if !entry.is_created() || !entry.is_allocated() {
                false
            } else {
                entry.allocated = 0;
                dir.set_entry(idx, entry);
                true
            }
        };
        if deallocated {
            frame.mark_dirty();
        }
        self.pool.unpin_page(&frame);
        if !deallocated {
            return false;
        }

        if let Some(frame) = self.pool.pin_page(pid) {
            {
                let mut buf = frame.data();
                DataPage::new(&mut buf).set_record_count(0);
            }
            frame.mark_dirty();
            self.pool.unpin_page(&frame);
        }
        true
    }

    /// True iff the directory entry for `pid` is allocated.
    pub fn page_exists(&self, pid: PageId) -> bool {
        self.dir_entry(pid).is_some_and(|e| e.is_allocated())
    }

    /// Reclaims the first created-but-deallocated page, if any.
    pub fn scavenge_page(&self) -> PageId {
        let _guard = self.alloc_latch.lock().unwrap();
        self.scavenge_locked()
    }

    // Linear directory scan; caller holds the allocation latch.
    fn scavenge_locked(&self) -> PageId {
        for dir_page_num in 0..self.dir.page_count() {
            let dir_pid = PageId::new(self.dir.id(), dir_page_num as u16);
            let Some(frame) = self.pool.pin_page(dir_pid) else {
                return PageId::INVALID;
            };
            let mut found = PageId::INVALID;
            {
                let mut buf = frame.data();
                let mut dir = DirectoryPage::new(&mut buf);
                for idx in 0..ENTRIES_PER_DIR_PAGE {
                    let mut entry = dir.entry(idx);
                    if entry.is_created() && !entry.is_allocated() {
                        entry.allocated = 1;
                        entry.free_slots = DataPage::capacity(self.record_size);
                        dir.set_entry(idx, entry);
                        let page_num = dir_page_num as usize * ENTRIES_PER_DIR_PAGE + idx;
                        found = PageId::new(self.data.id(), page_num as u16);
                        break;
                    }
                }
            }
            if found.is_valid() {
                frame.mark_dirty();
                self.pool.unpin_page(&frame);
                return found;
            }
            self.pool.unpin_page(&frame);
        }
        PageId::INVALID
    }

    fn init_directory_page(&self, dir_pid: PageId) -> bool {
        let Some(frame) = self.pool.pin_page(dir_pid) else {
            return false;
        };
        {
            let mut buf = frame.data();
            DirectoryPage::new(&mut buf).init(self.record_size);
        }
        frame.mark_dirty();
        self.pool.unpin_page(&frame);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn new_paged_file(record_size: u16) -> (tempfile::TempDir, Arc<BufferPool>, PagedFile) {
        let dir = tempdir().unwrap();
        let pool = Arc::new(BufferPool::new(16));
        let file =
            PagedFile::create(dir.path().join("table"), record_size, Arc::clone(&pool)).unwrap();
        (dir, pool, file)
    }

    #[test]
    fn create_initializes_first_directory_page() {
        let (_dir, _pool, file) = new_paged_file(8);
        assert_eq!(file.dir_file().page_count(), 1);
        assert_eq!(file.data_file().page_count(), 0);

        let entry = file.dir_entry(PageId::new(file.data_file().id(), 0)).unwrap();
        assert!(!entry.is_created());
        assert!(!entry.is_allocated());
        assert_eq!(entry.free_slots, DataPage::capacity(8));
    }

    #[test]
    fn zero_record_size_is_rejected() {
        let dir = tempdir().unwrap();
        let pool = Arc::new(BufferPool::new(4));
        assert!(PagedFile::create(dir.path().join("t"), 0, pool).is_err());
    }

    #[test]
    fn allocate_marks_entry_and_formats_page() {
        let (_dir, pool, file) = new_paged_file(8);
        let pid = file.allocate_page();
        assert!(pid.is_valid());
        assert!(file.page_exists(pid));

        let entry = file.dir_entry(pid).unwrap();
        assert!(entry.is_created());
        assert!(entry.is_allocated());
        assert_eq!(entry.free_slots, DataPage::capacity(8));

        let frame = pool.pin_page(pid).unwrap();
        {
            let mut buf = frame.data();
            let page = DataPage::new(&mut buf);
            assert_eq!(page.record_count(), 0);
            assert_eq!(page.record_size(), 8);
        }
        pool.unpin_page(&frame);
    }

    #[test]
    fn deallocate_then_scavenge_reuses_the_page() {
        let (_dir, _pool, file) = new_paged_file(8);
        let p0 = file.allocate_page();
        let p1 = file.allocate_page();
        assert_ne!(p0, p1);

        assert!(file.deallocate_page(p0));
        assert!(!file.page_exists(p0));
        // Deallocating twice fails.
        assert!(!file.deallocate_page(p0));

        // The next allocation scavenges p0 instead of growing the file.
        let data_pages_before = file.data_file().page_count();
        let reused = file.allocate_page();
        assert_eq!(reused, p0);
        assert!(file.page_exists(reused));
        assert_eq!(file.data_file().page_count(), data_pages_before);
    }

    #[test]
    fn scavenge_on_fresh_file_finds_nothing() {
        let (_dir, _pool, file) = new_paged_file(8);
        assert!(!file.scavenge_page().is_valid());
    }

    #[test]
    fn page_exists_rejects_untracked_pages() {
        let (_dir, _pool, file) = new_paged_file(8);
        assert!(!file.page_exists(PageId::INVALID));
        assert!(!file.page_exists(PageId::new(file.data_file().id(), 1234)));
    }

    #[test]
    fn directory_covers_every_data_page() {
        let (_dir, _pool, file) = new_paged_file(8);
        for _ in 0..5 {
            assert!(file.allocate_page().is_valid());
        }
        assert!(
            file.dir_file().page_count() as usize * ENTRIES_PER_DIR_PAGE
                >= file.data_file().page_count() as usize
        );
    }
}
