//! A generic intrusive LRU queue, adapted from the teacher's
//! `pbs-tools::lru_cache::LruCache` doubly-linked-list technique but
//! carrying only an id (no value): every queue in this crate — the node
//! table's active/reusable/cleanup queues (spec §4.3), the chunk LRU, and a
//! directory's detached-dirent LRU (spec §3 invariant 3) — is one of these.
//!
//! `std::collections::LinkedList` doesn't support O(1) "move this node to
//! the front" or "drop the tail", which every one of those queues needs on
//! every access, hence the hand-rolled pointer list.

use std::collections::HashMap;
use std::hash::Hash;
use std::marker::PhantomData;
use std::ptr;

struct Node<T> {
    id: T,
    prev: *mut Node<T>,
    next: *mut Node<T>,
}

/// An intrusive, doubly-linked LRU queue of ids. The *front* is the
/// most-recently-used end; [`LruQueue::pop_lru`] evicts from the back.
pub struct LruQueue<T> {
    index: HashMap<T, *mut Node<T>>,
    head: *mut Node<T>,
    tail: *mut Node<T>,
    _marker: PhantomData<Box<Node<T>>>,
}

// Safety: mirrors pbs-tools::lru_cache::LruCache — the queue owns every
// node it points to and never exposes a raw pointer across the API
// boundary, so Send follows from `T: Send`.
unsafe impl<T: Send> Send for LruQueue<T> {}

impl<T> Drop for LruQueue<T> {
    fn drop(&mut self) {
        self.clear();
    }
}

impl<T: Eq + Hash + Copy> Default for LruQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Eq + Hash + Copy> LruQueue<T> {
    pub fn new() -> Self {
        LruQueue { index: HashMap::new(), head: ptr::null_mut(), tail: ptr::null_mut(), _marker: PhantomData }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, id: T) -> bool {
        self.index.contains_key(&id)
    }

    /// Insert `id` at the MRU end. No-op if already present (use
    /// [`LruQueue::bump`] to re-promote an existing entry).
    pub fn push_front(&mut self, id: T) {
        if self.index.contains_key(&id) {
            return;
        }
        let node = Box::new(Node { id, prev: ptr::null_mut(), next: self.head });
        let node_ptr = Box::into_raw(node);
        if !self.head.is_null() {
            unsafe { (*self.head).prev = node_ptr };
        }
        self.head = node_ptr;
        if self.tail.is_null() {
            self.tail = node_ptr;
        }
        self.index.insert(id, node_ptr);
    }

    /// Move `id` to the MRU end. No-op if `id` is not present.
    pub fn bump(&mut self, id: T) {
        let Some(&node_ptr) = self.index.get(&id) else { return };
        if node_ptr == self.head {
            return;
        }
        self.unlink(node_ptr);
        unsafe {
            (*node_ptr).prev = ptr::null_mut();
            (*node_ptr).next = self.head;
        }
        if !self.head.is_null() {
            unsafe { (*self.head).prev = node_ptr };
        }
        self.head = node_ptr;
        if self.tail.is_null() {
            self.tail = node_ptr;
        }
    }

    /// Unlink a node from the chain without freeing or touching the index.
    fn unlink(&mut self, node_ptr: *mut Node<T>) {
        unsafe {
            let prev = (*node_ptr).prev;
            let next = (*node_ptr).next;
            if !prev.is_null() {
                (*prev).next = next;
            } else {
                self.head = next;
            }
            if !next.is_null() {
                (*next).prev = prev;
            } else {
                self.tail = prev;
            }
        }
    }

    /// Remove `id` from the queue entirely.
    pub fn remove(&mut self, id: T) -> bool {
        let Some(node_ptr) = self.index.remove(&id) else { return false };
        self.unlink(node_ptr);
        unsafe { drop(Box::from_raw(node_ptr)) };
        true
    }

    /// Evict and return the LRU (tail) id, if any.
    pub fn pop_lru(&mut self) -> Option<T> {
        if self.tail.is_null() {
            return None;
        }
        let node_ptr = self.tail;
        let id = unsafe { (*node_ptr).id };
        self.unlink(node_ptr);
        self.index.remove(&id);
        unsafe { drop(Box::from_raw(node_ptr)) };
        Some(id)
    }

    /// Peek the LRU (tail) id without removing it.
    pub fn peek_lru(&self) -> Option<T> {
        if self.tail.is_null() {
            None
        } else {
            Some(unsafe { (*self.tail).id })
        }
    }

    pub fn clear(&mut self) {
        let mut cur = self.head;
        while !cur.is_null() {
            let next = unsafe { (*cur).next };
            unsafe { drop(Box::from_raw(cur)) };
            cur = next;
        }
        self.head = ptr::null_mut();
        self.tail = ptr::null_mut();
        self.index.clear();
    }

    /// Iterate from MRU to LRU. Used only by tests and diagnostics; never
    /// on a hot path.
    pub fn iter_mru_to_lru(&self) -> impl Iterator<Item = T> + '_ {
        let mut cur = self.head;
        std::iter::from_fn(move || {
            if cur.is_null() {
                return None;
            }
            let id = unsafe { (*cur).id };
            cur = unsafe { (*cur).next };
            Some(id)
        })
    }
}
