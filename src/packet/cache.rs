//
// Copyright (c) The exabgp-core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Process-wide content-addressed attribute cache (§3 "Attribute", Design
//! Notes "From content-addressed attribute cache with weak references").
//!
//! Two attributes with identical `(type code, packed bytes)` are the same
//! object: [`AttributeCache::intern`] returns a shared [`Arc`] handle, and
//! [`AttributeCollection`](super::attribute::AttributeCollection) stores
//! handles rather than copies. Eviction is safe because interned values are
//! immutable; a plain LRU is enough, no weak references are needed in a
//! single-threaded reactor.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;

use crate::packet::attribute::Attribute;

type Key = (u8, Bytes);

/// A bounded, least-recently-used cache of interned [`Attribute`] values.
#[derive(Debug)]
pub struct AttributeCache {
    capacity: usize,
    entries: HashMap<Key, Arc<Attribute>>,
    // Most-recently-used at the back.
    recency: VecDeque<Key>,
}

impl AttributeCache {
    pub fn new(capacity: usize) -> AttributeCache {
        AttributeCache {
            capacity,
            entries: HashMap::new(),
            recency: VecDeque::new(),
        }
    }

    /// Interns `attr`, returning the shared handle for its `(type, bytes)`
    /// key. Packed bytes are only computed once per call; identical bytes
    /// for the same type always hit the same cache entry.
    pub fn intern(&mut self, attr: Attribute) -> Arc<Attribute> {
        let key: Key = (attr.code(), attr.packed_bytes());
        if let Some(existing) = self.entries.get(&key) {
            self.touch(&key);
            return Arc::clone(existing);
        }
        let handle = Arc::new(attr);
        self.entries.insert(key.clone(), Arc::clone(&handle));
        self.recency.push_back(key);
        self.evict_if_needed();
        handle
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn touch(&mut self, key: &Key) {
        if let Some(pos) = self.recency.iter().position(|k| k == key) {
            let key = self.recency.remove(pos).unwrap();
            self.recency.push_back(key);
        }
    }

    fn evict_if_needed(&mut self) {
        while self.entries.len() > self.capacity {
            if let Some(oldest) = self.recency.pop_front() {
                self.entries.remove(&oldest);
            } else {
                break;
            }
        }
    }
}

impl Default for AttributeCache {
    fn default() -> AttributeCache {
        // Generous default: attribute sets are small and highly repetitive
        // across routes in the same group.
        AttributeCache::new(4096)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::consts::Origin;

    #[test]
    fn identical_bytes_are_same_handle() {
        let mut cache = AttributeCache::new(8);
        let a = cache.intern(Attribute::Origin(Origin::Igp));
        let b = cache.intern(Attribute::Origin(Origin::Igp));
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn eviction_respects_capacity() {
        let mut cache = AttributeCache::new(1);
        let _a = cache.intern(Attribute::Med(1));
        let _b = cache.intern(Attribute::Med(2));
        assert_eq!(cache.len(), 1);
    }
}
