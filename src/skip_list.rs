//! A concurrent skip list mapping fixed-size keys to fixed-size payloads.
//!
//! Concurrency model: one reader/writer latch per level, always acquired in
//! descending level order. Traversal is hand-over-hand: the next level's
//! latch is taken before the current one is released. Mutators write-latch
//! the levels they splice or unlink; a node is freed only while write
//! latches on every level it occupies are held, so no traversal can still
//! reference it.

use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use rand::Rng;

use crate::SKIP_LIST_MAX_LEVEL;

// A tower: key and payload live in one allocation, key first.
struct Node {
    nlevels: usize,
    key_size: usize,
    next: [*mut Node; SKIP_LIST_MAX_LEVEL],
    data: Box<[u8]>,
}

impl Node {
    fn sentinel() -> Box<Node> {
        Box::new(Node {
            nlevels: SKIP_LIST_MAX_LEVEL,
            key_size: 0,
            next: [ptr::null_mut(); SKIP_LIST_MAX_LEVEL],
            data: Box::from([]),
        })
    }

    fn key(&self) -> &[u8] {
        &self.data[..self.key_size]
    }

    fn payload(&self) -> &[u8] {
        &self.data[self.key_size..]
    }

    fn payload_mut(&mut self) -> &mut [u8] {
        let key_size = self.key_size;
        &mut self.data[key_size..]
    }
}

enum LevelGuard<'a> {
    Read(#[allow(dead_code)] RwLockReadGuard<'a, ()>),
    Write(#[allow(dead_code)] RwLockWriteGuard<'a, ()>),
}

/// A concurrent ordered map over `key_size`-byte keys and `payload_size`-
/// byte payloads, compared lexicographically.
pub struct SkipList {
    key_size: usize,
    payload_size: usize,
    head: *mut Node,
    tail: *mut Node,
    // Current tower height; raised only under the affected level's write
    // latch, read as a descent starting point.
    height: AtomicUsize,
    latches: [RwLock<()>; SKIP_LIST_MAX_LEVEL],
}

// Raw node pointers are only ever dereferenced under the latch protocol.
unsafe impl Send for SkipList {}
unsafe impl Sync for SkipList {}

impl SkipList {
    pub fn new(key_size: usize, payload_size: usize) -> Self {
        let tail = Box::into_raw(Node::sentinel());
        let head = Box::into_raw(Node::sentinel());
        unsafe {
            (*head).next = [tail; SKIP_LIST_MAX_LEVEL];
        }
        Self {
            key_size,
            payload_size,
            head,
            tail,
            height: AtomicUsize::new(1),
            latches: std::array::from_fn(|_| RwLock::new(())),
        }
    }

    pub fn key_size(&self) -> usize {
        self.key_size
    }

    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    pub fn height(&self) -> usize {
        self.height.load(Ordering::Acquire)
    }

    /// Inserts a new key. Returns false if the key already exists or the
    /// key/payload lengths do not match the list's parameters.
    pub fn insert(&self, key: &[u8], payload: &[u8]) -> bool {
        if key.len() != self.key_size || payload.len() != self.payload_size {
            return false;
        }

        // Tower height by geometric coin flip.
        let mut rng = rand::thread_rng();
        let mut node_level = 1;
        while node_level < SKIP_LIST_MAX_LEVEL && rng.gen_bool(0.5) {
            node_level += 1;
        }

        let top = node_level.max(self.height.load(Ordering::Acquire));
        let mut guards: [Option<LevelGuard>; SKIP_LIST_MAX_LEVEL] =
            std::array::from_fn(|_| None);
        let mut preds = [self.head; SKIP_LIST_MAX_LEVEL];

        // Descend collecting predecessors at every level, including levels
        // at or above the current height: the traversal finds the head
        // sentinel there, which keeps concurrent height growth consistent.
        let mut curr = self.head;
        for level in (0..top).rev() {
            guards[level] = Some(if level < node_level {
                LevelGuard::Write(self.latches[level].write())
            } else {
                LevelGuard::Read(self.latches[level].read())
            });
            curr = unsafe { self.advance(curr, level, key) };
            preds[level] = curr;
        }

        let at = unsafe { (*curr).next[0] };
        if at != self.tail && unsafe { (*at).key() } == key {
            return false;
        }

        let node = self.new_node(node_level, key, payload);
        if node.is_null() {
            return false;
        }

        // Splice bottom-up, raising the height as new levels come live.
        for level in 0..node_level {
            unsafe {
                (*node).next[level] = (*preds[level]).next[level];
                (*preds[level]).next[level] = node;
            }
            self.height.fetch_max(level + 1, Ordering::AcqRel);
            guards[level] = None;
        }
        true
    }

    /// Looks the key up; on a hit copies the payload into `out_payload` if
    /// one is given.
    pub fn search(&self, key: &[u8], mut out_payload: Option<&mut [u8]>) -> bool {
        if key.len() != self.key_size {
            return false;
        }
        let (_guard, pred) = self.descend_read(key);
        let target = unsafe { (*pred).next[0] };
        if target == self.tail || unsafe { (*target).key() } != key {
            return false;
        }
        if let Some(out) = out_payload.as_deref_mut() {
            out.copy_from_slice(unsafe { (*target).payload() });
        }
        true
    }

    /// Overwrites the payload of an existing key in place. The level-0
    /// latch is held exclusively for the overwrite so readers never observe
    /// a torn payload.
    pub fn update(&self, key: &[u8], payload: &[u8]) -> bool {
        if key.len() != self.key_size || payload.len() != self.payload_size {
            return false;
        }

        let top = self.height.load(Ordering::Acquire) - 1;
        let mut curr = self.head;
        let write_guard;

        if top == 0 {
            write_guard = self.latches[0].write();
        } else {
            let mut guard = self.latches[top].read();
            let mut level = top;
            loop {
                curr = unsafe { self.advance(curr, level, key) };
                if level == 1 {
                    // Take the bottom latch exclusively before letting the
                    // level-1 latch go.
                    write_guard = self.latches[0].write();
                    drop(guard);
                    break;
                }
                let next_guard = self.latches[level - 1].read();
                guard = next_guard;
                level -= 1;
            }
        }

        curr = unsafe { self.advance(curr, 0, key) };
        let target = unsafe { (*curr).next[0] };
        if target == self.tail || unsafe { (*target).key() } != key {
            return false;
        }
        unsafe {
            (*target).payload_mut().copy_from_slice(payload);
        }
        drop(write_guard);
        true
    }

    /// Unlinks and frees the key's tower. Returns false if the key does not
    /// exist.
    pub fn delete(&self, key: &[u8]) -> bool {
        if key.len() != self.key_size {
            return false;
        }

        // Write-latch every level, not just the current height: a tower
        // taller than the height snapshot may still be mid-splice, and the
        // latches are the only thing serializing against it.
        let mut guards: [Option<RwLockWriteGuard<'_, ()>>; SKIP_LIST_MAX_LEVEL] =
            std::array::from_fn(|_| None);
        let mut preds = [self.head; SKIP_LIST_MAX_LEVEL];

        let mut curr = self.head;
        for level in (0..SKIP_LIST_MAX_LEVEL).rev() {
            guards[level] = Some(self.latches[level].write());
            curr = unsafe { self.advance(curr, level, key) };
            preds[level] = curr;
        }

        let victim = unsafe { (*curr).next[0] };
        if victim == self.tail || unsafe { (*victim).key() } != key {
            return false;
        }

        let nlevels = unsafe { (*victim).nlevels };
        // Levels above the victim's tower are not touched.
        for guard in guards.iter_mut().skip(nlevels) {
            *guard = None;
        }
        for (level, pred) in preds.iter().enumerate().take(nlevels) {
            unsafe {
                if (**pred).next[level] == victim {
                    (**pred).next[level] = (*victim).next[level];
                }
            }
        }
        // Write latches on all of the victim's levels are still held here,
        // so no traversal can reference it.
        unsafe {
            drop(Box::from_raw(victim));
        }
        true
    }

    /// Emits up to `nkeys` key/payload pairs in ascending order, starting
    /// at the smallest key `>= start_key` (or the first key when
    /// `start_key` is `None`). With `inclusive` unset, an exact match of
    /// `start_key` is skipped. The copies are owned by the caller.
    pub fn scan(
        &self,
        start_key: Option<&[u8]>,
        nkeys: u32,
        inclusive: bool,
        out: &mut Vec<(Vec<u8>, Vec<u8>)>,
    ) {
        if nkeys == 0 {
            return;
        }

        let (_guard, mut curr) = match start_key {
            Some(key) => {
                if key.len() != self.key_size {
                    return;
                }
                let (guard, pred) = self.descend_read(key);
                let mut first = unsafe { (*pred).next[0] };
                if !inclusive && first != self.tail && unsafe { (*first).key() } == key {
                    first = unsafe { (*first).next[0] };
                }
                (guard, first)
            }
            None => {
                let guard = self.latches[0].read();
                (guard, unsafe { (*self.head).next[0] })
            }
        };

        let mut emitted = 0u32;
        while curr != self.tail && emitted < nkeys {
            unsafe {
                out.push(((*curr).key().to_vec(), (*curr).payload().to_vec()));
                curr = (*curr).next[0];
            }
            emitted += 1;
        }
    }

    // Hand-over-hand read descent; returns the level-0 predecessor with the
    // level-0 read latch held.
    fn descend_read(&self, key: &[u8]) -> (RwLockReadGuard<'_, ()>, *mut Node) {
        let mut level = self.height.load(Ordering::Acquire) - 1;
        let mut guard = self.latches[level].read();
        let mut curr = self.head;
        loop {
            curr = unsafe { self.advance(curr, level, key) };
            if level == 0 {
                return (guard, curr);
            }
            let next_guard = self.latches[level - 1].read();
            guard = next_guard;
            level -= 1;
        }
    }

    // Walks right on `level` until the next key is >= `key`. Caller holds
    // the level's latch.
    unsafe fn advance(&self, mut curr: *mut Node, level: usize, key: &[u8]) -> *mut Node {
        while (*curr).next[level] != self.tail
            && (*(*curr).next[level]).key() < key
        {
            curr = (*curr).next[level];
        }
        curr
    }

    fn new_node(&self, nlevels: usize, key: &[u8], payload: &[u8]) -> *mut Node {
        if nlevels == 0 || nlevels > SKIP_LIST_MAX_LEVEL {
            return ptr::null_mut();
        }
        let mut data = vec![0u8; self.key_size + self.payload_size].into_boxed_slice();
        data[..self.key_size].copy_from_slice(key);
        data[self.key_size..].copy_from_slice(payload);
        Box::into_raw(Box::new(Node {
            nlevels,
            key_size: self.key_size,
            next: [ptr::null_mut(); SKIP_LIST_MAX_LEVEL],
            data,
        }))
    }
}

impl Drop for SkipList {
    fn drop(&mut self) {
        unsafe {
            let mut curr = (*self.head).next[0];
            while curr != self.tail {
                let next = (*curr).next[0];
                drop(Box::from_raw(curr));
                curr = next;
            }
            drop(Box::from_raw(self.head));
            drop(Box::from_raw(self.tail));
        }
    }
}
