// Copyright 2021-Present Datadog, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::hash::Hash;
use std::time::Duration;

use lru::LruCache;
use tokio::time::Instant;

/// When an entry counts as expired for [`EvictingCache::remove_expired`].
#[derive(Clone, Copy, Debug)]
pub(crate) enum EvictionPolicy {
    /// Expired once the entry has not been looked up for this long. Used by
    /// the check cache, where every served check refreshes the entry.
    IdleTimeout(Duration),
    /// Expired once the entry has been in the cache for this long, no matter
    /// how often it was touched. Used by the report cache, where age bounds
    /// how long an operation may stay buffered.
    MaxAge(Duration),
}

struct StoredEntry<V> {
    inserted_at: Instant,
    last_access: Instant,
    value: V,
}

/// A bounded keyed cache with least-recently-used capacity eviction and
/// policy-driven expiration.
///
/// Mutating operations hand evicted values back to the caller instead of
/// invoking a delete callback: the owning aggregator turns them into outbound
/// requests while it still holds its lock and delivers them once the lock is
/// released.
pub(crate) struct EvictingCache<K: Hash + Eq, V> {
    // The capacity is enforced by hand on insert so that evicted values can
    // be collected and returned.
    lru_cache: LruCache<K, StoredEntry<V>>,
    capacity: usize,
    policy: EvictionPolicy,
}

impl<K: Hash + Eq + Clone, V> EvictingCache<K, V> {
    pub fn new(capacity: usize, policy: EvictionPolicy) -> Self {
        assert!(capacity > 0, "the cache capacity must be positive");
        EvictingCache {
            lru_cache: LruCache::unbounded(),
            capacity,
            policy,
        }
    }

    pub fn len(&self) -> usize {
        self.lru_cache.len()
    }

    /// Inserts an entry, evicting the least recently used entries beyond
    /// capacity. The evicted values, including a replaced value for an
    /// existing key, are appended to `evicted`.
    pub fn insert(&mut self, key: K, value: V, evicted: &mut Vec<V>) {
        let now = Instant::now();
        if let Some(replaced) = self.lru_cache.put(
            key,
            StoredEntry {
                inserted_at: now,
                last_access: now,
                value,
            },
        ) {
            evicted.push(replaced.value);
        }
        while self.lru_cache.len() > self.capacity {
            let (_, entry) = self
                .lru_cache
                .pop_lru()
                .expect("the cache holds more entries than its capacity");
            evicted.push(entry.value);
        }
    }

    /// Looks up an entry, marking it as most recently used.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let entry = self.lru_cache.get_mut(key)?;
        entry.last_access = Instant::now();
        Some(&mut entry.value)
    }

    /// Looks up an entry without touching its recency or access time.
    pub fn peek_mut(&mut self, key: &K) -> Option<&mut V> {
        let entry = self.lru_cache.peek_mut(key)?;
        Some(&mut entry.value)
    }

    /// Removes and returns every entry the eviction policy considers expired
    /// at `now`, least recently used first.
    pub fn remove_expired(&mut self, now: Instant) -> Vec<V> {
        // `iter` walks from the most recently used entry; reverse so callers
        // see the oldest entries first.
        let expired_keys: Vec<K> = self
            .lru_cache
            .iter()
            .rev()
            .filter(|(_, entry)| self.is_expired(entry, now))
            .map(|(key, _)| key.clone())
            .collect();
        expired_keys
            .into_iter()
            .filter_map(|key| self.lru_cache.pop(&key))
            .map(|entry| entry.value)
            .collect()
    }

    /// Removes and returns every entry, least recently used first.
    pub fn drain(&mut self) -> Vec<V> {
        let mut values = Vec::with_capacity(self.lru_cache.len());
        while let Some((_, entry)) = self.lru_cache.pop_lru() {
            values.push(entry.value);
        }
        values
    }

    fn is_expired(&self, entry: &StoredEntry<V>, now: Instant) -> bool {
        match self.policy {
            EvictionPolicy::IdleTimeout(idle_timeout) => {
                now.duration_since(entry.last_access) >= idle_timeout
            }
            EvictionPolicy::MaxAge(max_age) => now.duration_since(entry.inserted_at) >= max_age,
        }
    }
}
