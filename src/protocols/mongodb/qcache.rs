// Copyright (c) Viable Systems
// SPDX-License-Identifier: MIT

use lru::LruCache;

use super::Event;

/// Pending requests awaiting their reply, keyed by request id.
///
/// The cache is recency-ordered with a fixed capacity so that queries
/// whose reply never arrives cannot pin memory; the oldest pending entry
/// is silently dropped when a new one would exceed the bound.
pub struct QCache {
    cache: LruCache<i32, Event>,
}

impl QCache {
    pub fn new(capacity: usize) -> Self {
        QCache {
            cache: LruCache::new(capacity.max(1)),
        }
    }

    /// Insert a pending event. Returns whether an unrelated entry was
    /// evicted to make room; replacing an entry under the same request id
    /// is not an eviction.
    pub fn add(&mut self, request_id: i32, event: Event) -> bool {
        let evicts = self.cache.len() == self.cache.cap() && !self.cache.contains(&request_id);
        self.cache.put(request_id, event);
        evicts
    }

    /// Remove and return the pending event for `request_id`, transferring
    /// ownership to the caller.
    pub fn pop(&mut self, request_id: i32) -> Option<Event> {
        self.cache.pop(&request_id)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
