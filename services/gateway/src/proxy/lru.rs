//! Bounded least-recently-used map.
//!
//! Entries live in a slab with an intrusive doubly linked recency list, so
//! lookups, inserts and evictions are O(1). Not thread safe; callers wrap it
//! in a lock.

use std::collections::HashMap;
use std::hash::Hash;

const NIL: usize = usize::MAX;

struct Entry<K, V> {
    key: K,
    value: V,
    prev: usize,
    next: usize,
}

pub struct LruCache<K, V> {
    capacity: usize,
    index: HashMap<K, usize>,
    slots: Vec<Entry<K, V>>,
    /// Most recently used.
    head: usize,
    /// Least recently used.
    tail: usize,
}

impl<K: Clone + Eq + Hash, V> LruCache<K, V> {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            index: HashMap::with_capacity(capacity.min(1024)),
            slots: Vec::new(),
            head: NIL,
            tail: NIL,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Look up a value and mark it most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let slot = *self.index.get(key)?;
        self.touch(slot);
        Some(&self.slots[slot].value)
    }

    /// Insert or replace a value, evicting the least recently used entry
    /// when full.
    pub fn insert(&mut self, key: K, value: V) {
        if let Some(&slot) = self.index.get(&key) {
            self.slots[slot].value = value;
            self.touch(slot);
            return;
        }

        let slot = if self.index.len() >= self.capacity {
            // Reuse the evicted slot.
            let slot = self.tail;
            self.unlink(slot);
            let old = std::mem::replace(
                &mut self.slots[slot],
                Entry {
                    key: key.clone(),
                    value,
                    prev: NIL,
                    next: NIL,
                },
            );
            self.index.remove(&old.key);
            slot
        } else {
            self.slots.push(Entry {
                key: key.clone(),
                value,
                prev: NIL,
                next: NIL,
            });
            self.slots.len() - 1
        };

        self.index.insert(key, slot);
        self.push_front(slot);
    }

    /// Remove a key, returning whether it was present.
    pub fn remove(&mut self, key: &K) -> bool {
        let Some(slot) = self.index.remove(key) else {
            return false;
        };
        self.unlink(slot);
        // Move the last slot into the hole so `slots` stays dense.
        let last = self.slots.len() - 1;
        if slot != last {
            self.slots.swap(slot, last);
            let moved_key = self.slots[slot].key.clone();
            if let Some(entry) = self.index.get_mut(&moved_key) {
                *entry = slot;
            }
            let (prev, next) = (self.slots[slot].prev, self.slots[slot].next);
            if prev == NIL {
                self.head = slot;
            } else {
                self.slots[prev].next = slot;
            }
            if next == NIL {
                self.tail = slot;
            } else {
                self.slots[next].prev = slot;
            }
        }
        self.slots.pop();
        true
    }

    fn touch(&mut self, slot: usize) {
        if self.head == slot {
            return;
        }
        self.unlink(slot);
        self.push_front(slot);
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = (self.slots[slot].prev, self.slots[slot].next);
        if prev == NIL {
            self.head = next;
        } else {
            self.slots[prev].next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.slots[next].prev = prev;
        }
        self.slots[slot].prev = NIL;
        self.slots[slot].next = NIL;
    }

    fn push_front(&mut self, slot: usize) {
        self.slots[slot].prev = NIL;
        self.slots[slot].next = self.head;
        if self.head != NIL {
            self.slots[self.head].prev = slot;
        }
        self.head = slot;
        if self.tail == NIL {
            self.tail = slot;
        }
    }
}
