//! Low-level page-granular I/O against a single OS file.

use std::fs::{create_dir_all, File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::{PageId, PAGE_SIZE};

// Process-wide file id source; ids must be unique across every open file
// registered with a buffer pool.
static NEXT_FILE_ID: AtomicU32 = AtomicU32::new(1);

/// One OS file addressed as a contiguous sequence of `PAGE_SIZE` pages.
///
/// The page counter is the sole source of truth for allocated page numbers;
/// concurrent [`BaseFile::create_page`] calls receive distinct, contiguous
/// numbers.
pub struct BaseFile {
    file: File,
    id: u32,
    page_count: AtomicU32,
}

impl BaseFile {
    /// Opens the file read/write, truncating any previous content.
    /// Failure here is fatal to the caller: there is no engine without its
    /// backing files.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path_ref = path.as_ref();
        crate::granite_debug_log!("[BaseFile::open] Opening file at: {path_ref:?}");
        if let Some(parent) = path_ref.parent() {
            if !parent.as_os_str().is_empty() {
                create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path_ref)?;

        Ok(Self {
            file,
            id: NEXT_FILE_ID.fetch_add(1, Ordering::SeqCst),
            page_count: AtomicU32::new(0),
        })
    }

    /// The process-unique id of this file.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Number of pages created so far.
    pub fn page_count(&self) -> u32 {
        self.page_count.load(Ordering::SeqCst)
    }

    /// Creates a new zero-filled page at the end of the file.
    /// Returns [`PageId::INVALID`] if the page could not be written; the
    /// page counter is rolled back in that case.
    pub fn create_page(&self) -> PageId {
        let page_num = self.page_count.fetch_add(1, Ordering::SeqCst);
        if page_num > u16::MAX as u32 {
            self.page_count.fetch_sub(1, Ordering::SeqCst);
            return PageId::INVALID;
        }
        let pid = PageId::new(self.id, page_num as u16);
        let zeroes = [0u8; PAGE_SIZE];
        if !self.flush_page(pid, &zeroes) {
            self.page_count.fetch_sub(1, Ordering::SeqCst);
            return PageId::INVALID;
        }
        pid
    }

    /// Reads exactly one page at the position given by `pid`.
    /// Returns false on an invalid pid or a short read.
    pub fn load_page(&self, pid: PageId, out: &mut [u8; PAGE_SIZE]) -> bool {
        if !pid.is_valid() {
            return false;
        }
        let offset = pid.page_num() as u64 * PAGE_SIZE as u64;
        self.file.read_exact_at(out, offset).is_ok()
    }

    /// Writes one page at the position given by `pid` and issues a
    /// durability barrier before reporting success.
    pub fn flush_page(&self, pid: PageId, buf: &[u8; PAGE_SIZE]) -> bool {
        if !pid.is_valid() {
            return false;
        }
        let offset = pid.page_num() as u64 * PAGE_SIZE as u64;
        if self.file.write_all_at(buf, offset).is_err() {
            return false;
        }
        self.file.sync_data().is_ok()
    }
}

impl Drop for BaseFile {
    fn drop(&mut self) {
        // Final barrier on teardown.
        let _ = self.file.sync_data();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn new_file_is_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("base");
        let bf = BaseFile::open(&path).unwrap();

        assert_eq!(bf.page_count(), 0);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn file_ids_are_distinct() {
        let dir = tempdir().unwrap();
        let a = BaseFile::open(dir.path().join("a")).unwrap();
        let b = BaseFile::open(dir.path().join("b")).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn load_from_empty_file_fails() {
        let dir = tempdir().unwrap();
        let bf = BaseFile::open(dir.path().join("base")).unwrap();

        let mut out = [0u8; PAGE_SIZE];
        assert!(!bf.load_page(PageId::new(bf.id(), 0), &mut out));
        assert!(!bf.load_page(PageId::INVALID, &mut out));
    }

    #[test]
    fn create_flush_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("base");
        let bf = BaseFile::open(&path).unwrap();

        let pid = bf.create_page();
        assert!(pid.is_valid());
        assert_eq!(pid.page_num(), 0);

        let mut page = [0u8; PAGE_SIZE];
        for (i, b) in page.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        assert!(bf.flush_page(pid, &page));

        let mut out = [0u8; PAGE_SIZE];
        assert!(bf.load_page(pid, &mut out));
        assert_eq!(page[..], out[..]);

        // On-disk size must equal exactly one page.
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            PAGE_SIZE as u64
        );
    }

    #[test]
    fn concurrent_create_page_numbers_are_contiguous() {
        use std::sync::Arc;

        let dir = tempdir().unwrap();
        let path = dir.path().join("base");
        let bf = Arc::new(BaseFile::open(&path).unwrap());

        const THREADS: usize = 4;
        const PAGES: usize = 8;

        let mut handles = Vec::new();
        for _ in 0..THREADS {
            let bf = Arc::clone(&bf);
            handles.push(std::thread::spawn(move || {
                let mut nums = Vec::new();
                for _ in 0..PAGES {
                    let pid = bf.create_page();
                    assert!(pid.is_valid());
                    nums.push(pid.page_num());
                }
                nums
            }));
        }

        let mut all: Vec<u16> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        let expect: Vec<u16> = (0..(THREADS * PAGES) as u16).collect();
        assert_eq!(all, expect);
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            (THREADS * PAGES * PAGE_SIZE) as u64
        );
    }
}
