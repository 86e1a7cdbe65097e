//! Capacity-bounded least-recently-used cache.
//!
//! Entries live in a slab of slots linked into a recency list by index, and a hash map points
//! each key at its slot, so `get`, `put` and `remove` never scan.

use std::collections::HashMap;

#[derive(Debug)]
struct Entry<V> {
    key: String,
    value: V,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug)]
pub struct LruCache<V> {
    capacity: usize,
    index: HashMap<String, usize>,
    slots: Vec<Option<Entry<V>>>,
    vacant: Vec<usize>,
    // most recently used
    head: Option<usize>,
    // least recently used
    tail: Option<usize>,
}

impl<V: Clone> LruCache<V> {
    /// A capacity of zero disables caching.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            index: HashMap::with_capacity(capacity),
            slots: Vec::with_capacity(capacity),
            vacant: Vec::new(),
            head: None,
            tail: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Look up a key, promoting it to most recently used.
    pub fn get(&mut self, key: &str) -> Option<V> {
        let slot = *self.index.get(key)?;
        self.promote(slot);
        self.slots[slot].as_ref().map(|entry| entry.value.clone())
    }

    /// Insert or update a key. Inserting a new key into a full cache evicts the least recently
    /// used entry first.
    pub fn put(&mut self, key: String, value: V) {
        if self.capacity == 0 {
            return;
        }
        if let Some(&slot) = self.index.get(&key) {
            if let Some(entry) = self.slots[slot].as_mut() {
                entry.value = value;
            }
            self.promote(slot);
            return;
        }
        if self.index.len() >= self.capacity {
            self.evict();
        }
        let entry = Entry {
            key: key.clone(),
            value,
            prev: None,
            next: None,
        };
        let slot = match self.vacant.pop() {
            Some(slot) => {
                self.slots[slot] = Some(entry);
                slot
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        };
        self.index.insert(key, slot);
        self.push_front(slot);
    }

    pub fn remove(&mut self, key: &str) -> Option<V> {
        let slot = self.index.remove(key)?;
        self.unlink(slot);
        self.vacant.push(slot);
        self.slots[slot].take().map(|entry| entry.value)
    }

    fn evict(&mut self) {
        if let Some(slot) = self.tail {
            self.unlink(slot);
            if let Some(entry) = self.slots[slot].take() {
                self.index.remove(&entry.key);
            }
            self.vacant.push(slot);
        }
    }

    fn promote(&mut self, slot: usize) {
        if self.head != Some(slot) {
            self.unlink(slot);
            self.push_front(slot);
        }
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = match self.slots[slot].as_ref() {
            Some(entry) => (entry.prev, entry.next),
            None => return,
        };
        match prev {
            Some(prev) => {
                if let Some(entry) = self.slots[prev].as_mut() {
                    entry.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(next) => {
                if let Some(entry) = self.slots[next].as_mut() {
                    entry.prev = prev;
                }
            }
            None => self.tail = prev,
        }
        if let Some(entry) = self.slots[slot].as_mut() {
            entry.prev = None;
            entry.next = None;
        }
    }

    fn push_front(&mut self, slot: usize) {
        let old_head = self.head;
        if let Some(entry) = self.slots[slot].as_mut() {
            entry.prev = None;
            entry.next = old_head;
        }
        if let Some(old_head) = old_head {
            if let Some(entry) = self.slots[old_head].as_mut() {
                entry.prev = Some(slot);
            }
        }
        self.head = Some(slot);
        if self.tail.is_none() {
            self.tail = Some(slot);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn filled(capacity: usize, keys: &[&str]) -> LruCache<usize> {
        let mut cache = LruCache::new(capacity);
        for (value, key) in keys.iter().enumerate() {
            cache.put(key.to_string(), value);
        }
        cache
    }

    #[test]
    fn overflow_evicts_first_inserted() {
        let mut cache = filled(3, &["/a", "/b", "/c", "/d"]);
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get("/a"), None);
        assert_eq!(cache.get("/b"), Some(1));
        assert_eq!(cache.get("/c"), Some(2));
        assert_eq!(cache.get("/d"), Some(3));
    }

    #[test]
    fn get_promotes_entry() {
        let mut cache = filled(3, &["/a", "/b", "/c"]);
        assert_eq!(cache.get("/a"), Some(0));
        cache.put("/d".to_string(), 3);
        assert_eq!(cache.get("/b"), None);
        assert_eq!(cache.get("/a"), Some(0));
        assert_eq!(cache.get("/c"), Some(2));
        assert_eq!(cache.get("/d"), Some(3));
    }

    #[test]
    fn updating_existing_key_does_not_evict() {
        let mut cache = filled(2, &["/a", "/b"]);
        cache.put("/a".to_string(), 10);
        assert_eq!(cache.len(), 2);
        cache.put("/c".to_string(), 2);
        assert_eq!(cache.get("/b"), None);
        assert_eq!(cache.get("/a"), Some(10));
    }

    #[test]
    fn remove_frees_slot_for_reuse() {
        let mut cache = filled(2, &["/a", "/b"]);
        assert_eq!(cache.remove("/a"), Some(0));
        assert_eq!(cache.remove("/a"), None);
        assert_eq!(cache.len(), 1);
        cache.put("/c".to_string(), 2);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("/b"), Some(1));
        assert_eq!(cache.get("/c"), Some(2));
        assert_eq!(cache.slots.len(), 2);
    }

    #[test]
    fn removing_only_entry_empties_cache() {
        let mut cache = filled(1, &["/a"]);
        cache.remove("/a");
        assert!(cache.is_empty());
        assert_eq!(cache.head, None);
        assert_eq!(cache.tail, None);
        cache.put("/b".to_string(), 1);
        assert_eq!(cache.get("/b"), Some(1));
    }

    #[test]
    fn zero_capacity_caches_nothing() {
        let mut cache = filled(0, &["/a"]);
        assert!(cache.is_empty());
        assert_eq!(cache.get("/a"), None);
    }

    #[test]
    fn capacity_one_keeps_latest() {
        let mut cache = filled(1, &["/a", "/b", "/c"]);
        assert_eq!(cache.capacity(), 1);
        assert_eq!(cache.get("/c"), Some(2));
        assert_eq!(cache.get("/b"), None);
    }
}
