//! The buffer pool: a fixed-size cache of in-memory page frames with pin
//! counts and LRU victim selection.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::base_file::BaseFile;
use crate::{PageId, PAGE_SIZE};

/// A single frame in the buffer pool.
///
/// The `data` mutex is the frame latch: it serializes mutation of the page
/// image during logical operations and is held by the table layer, never by
/// pin/unpin.
pub struct Frame {
    page_id: PageId,
    pin_count: Mutex<u16>,
    is_dirty: Mutex<bool>,
    data: Mutex<[u8; PAGE_SIZE]>,
}

impl Frame {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn pin_count(&self) -> u16 {
        *self.pin_count.lock().unwrap()
    }

    pub fn is_dirty(&self) -> bool {
        *self.is_dirty.lock().unwrap()
    }

    /// Callers set the dirty bit after mutating the page image.
    pub fn mark_dirty(&self) {
        *self.is_dirty.lock().unwrap() = true;
    }

    /// Takes the frame latch, giving access to the page image.
    pub fn data(&self) -> MutexGuard<'_, [u8; PAGE_SIZE]> {
        self.data.lock().unwrap()
    }
}

struct PoolState {
    page_table: HashMap<u64, Arc<Frame>>,
    // Front is the eviction candidate; holds every resident page.
    lru: VecDeque<u64>,
    files: HashMap<u32, Arc<BaseFile>>,
}

/// The buffer pool manager.
///
/// One pool-wide mutex protects the page table, the LRU list, the file
/// registry, and pin transitions. The mutex is never held across I/O:
/// victims are detached under the mutex and written back after it is
/// released, and a freshly inserted frame keeps its frame latch through the
/// load so concurrent pinners of the same page serialize behind the read.
pub struct BufferPool {
    capacity: usize,
    state: Mutex<PoolState>,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(PoolState {
                page_table: HashMap::new(),
                lru: VecDeque::new(),
                files: HashMap::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Records `file_id -> file` so the pool can load and write back frames
    /// for any registered file.
    pub fn register_file(&self, file: Arc<BaseFile>) {
        let mut state = self.state.lock().unwrap();
        state.files.insert(file.id(), file);
    }

    pub fn file(&self, file_id: u32) -> Option<Arc<BaseFile>> {
        self.state.lock().unwrap().files.get(&file_id).cloned()
    }

    /// Pins the page, loading it into a frame if necessary.
    /// Returns `None` if the pid is invalid, the owning file is not
    /// registered, every frame is pinned, or the load fails. Pin failure is
    /// never retried here; callers decide.
    pub fn pin_page(&self, pid: PageId) -> Option<Arc<Frame>> {
        if !pid.is_valid() {
            return None;
        }

        let mut state = self.state.lock().unwrap();
        loop {
            // 1. Already resident: bump the pin count and move to the MRU end.
            if let Some(frame) = state.page_table.get(&pid.value()).cloned() {
                *frame.pin_count.lock().unwrap() += 1;
                Self::touch_lru(&mut state.lru, pid.value());
                return Some(frame);
            }

            if state.page_table.len() < self.capacity {
                break;
            }

            // 2. Full: detach the least recently used unpinned frame and
            //    write it back outside the pool mutex.
            let victim = Self::take_victim(&mut state)?;
            let file = state.files.get(&victim.page_id.file_id()).cloned();
            drop(state);
            crate::granite_debug_log!("[BufferPool::pin_page] Evicting {:?}", victim.page_id);
            // The victim is detached and unpinned, so nothing else holds
            // its latches.
            let dirty = *victim.is_dirty.lock().unwrap();
            if dirty {
                if let Some(file) = file {
                    let data = victim.data.lock().unwrap();
                    file.flush_page(victim.page_id, &data);
                }
            }
            state = self.state.lock().unwrap();
            // Re-check residency and capacity: both may have changed.
        }

        // 3. Load into a fresh frame. The frame latch is held across the
        //    read so a concurrent pinner of the same page waits for it.
        let file = state.files.get(&pid.file_id()).cloned()?;
        let frame = Arc::new(Frame {
            page_id: pid,
            pin_count: Mutex::new(1),
            is_dirty: Mutex::new(false),
            data: Mutex::new([0u8; PAGE_SIZE]),
        });
        let mut data = frame.data.lock().unwrap();
        state.page_table.insert(pid.value(), Arc::clone(&frame));
        Self::touch_lru(&mut state.lru, pid.value());
        drop(state);

        let loaded = file.load_page(pid, &mut data);
        drop(data);
        if !loaded {
            let mut state = self.state.lock().unwrap();
            state.page_table.remove(&pid.value());
            if let Some(pos) = state.lru.iter().position(|v| *v == pid.value()) {
                let _ = state.lru.remove(pos);
            }
            return None;
        }
        Some(frame)
    }

    /// Drops one pin. At zero the frame stays resident and remains (or
    /// becomes) eligible for eviction.
    pub fn unpin_page(&self, frame: &Arc<Frame>) {
        let mut state = self.state.lock().unwrap();
        let mut pin = frame.pin_count.lock().unwrap();
        if *pin > 0 {
            *pin -= 1;
        }
        if *pin == 0 {
            let value = frame.page_id.value();
            if state.page_table.contains_key(&value) && !state.lru.contains(&value) {
                state.lru.push_back(value);
            }
        }
    }

    /// Writes every dirty resident frame back through its owning file.
    pub fn flush_all(&self) {
        let state = self.state.lock().unwrap();
        for frame in state.page_table.values() {
            // Frame latch before dirty bit, matching the mutation path.
            let data = frame.data.lock().unwrap();
            let mut dirty = frame.is_dirty.lock().unwrap();
            if *dirty {
                if let Some(file) = state.files.get(&frame.page_id.file_id()) {
                    if file.flush_page(frame.page_id, &data) {
                        *dirty = false;
                    }
                }
            }
        }
    }

    fn touch_lru(lru: &mut VecDeque<u64>, value: u64) {
        if let Some(pos) = lru.iter().position(|v| *v == value) {
            let _ = lru.remove(pos);
        }
        lru.push_back(value);
    }

    // Removes and returns the first unpinned frame from the LRU front.
    fn take_victim(state: &mut PoolState) -> Option<Arc<Frame>> {
        let pos = state.lru.iter().position(|value| {
            state
                .page_table
                .get(value)
                .is_some_and(|f| *f.pin_count.lock().unwrap() == 0)
        })?;
        let value = state.lru.remove(pos)?;
        state.page_table.remove(&value)
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        self.flush_all();
    }
}
