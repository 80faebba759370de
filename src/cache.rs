//! Event cache - ring buffer of recently consumed events
//!
//! Diagnostics only: nothing in the forwarding path reads from it.
//!
//! Entries are numbered by a monotonic counter. Clearing the cache keeps the
//! counter running unless a reset is asked for, so a consumer polling the
//! cache can tell "cache was cleared" apart from "sequence restarted".

use std::collections::{BTreeMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, trace};

use crate::config::CacheConfig;
use crate::event::EventPayload;

/// One cached event
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntry {
    pub destination: String,
    pub counter: u64,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
    pub properties: BTreeMap<String, String>,
}

struct Ring {
    entries: VecDeque<CacheEntry>,
    next_counter: u64,
}

/// Fixed-capacity cache of the most recent events
pub struct EventCache {
    capacity: usize,
    ring: Mutex<Ring>,
    excluded: RwLock<HashSet<String>>,
}

impl EventCache {
    /// Create a cache holding up to `capacity` events (0 disables caching)
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ring: Mutex::new(Ring {
                entries: VecDeque::with_capacity(capacity),
                next_counter: 0,
            }),
            excluded: RwLock::new(HashSet::new()),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        let capacity = if config.enabled { config.size } else { 0 };
        let cache = Self::new(capacity);
        for destination in &config.exclude_destinations {
            cache.exclude_destination(destination);
        }
        debug!("event cache created: capacity={capacity}");
        cache
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Record an event consumed from `destination`
    ///
    /// Returns the counter assigned to the entry, or None when the event was
    /// not cached (cache disabled or destination excluded).
    pub fn cache_event(&self, destination: &str, payload: &EventPayload) -> Option<u64> {
        if !self.is_enabled() || self.excluded.read().contains(destination) {
            return None;
        }

        let mut ring = self.ring.lock();
        while ring.entries.len() >= self.capacity {
            ring.entries.pop_front();
        }
        let counter = ring.next_counter;
        ring.next_counter += 1;
        ring.entries.push_back(CacheEntry {
            destination: destination.to_string(),
            counter,
            timestamp: Utc::now(),
            payload: payload.to_value(),
            properties: payload.properties(),
        });
        trace!("cached event: destination={destination}, counter={counter}");
        Some(counter)
    }

    /// Snapshot of the cached entries, oldest first
    pub fn entries(&self) -> Vec<CacheEntry> {
        self.ring.lock().entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counter the next cached entry will get
    pub fn counter(&self) -> u64 {
        self.ring.lock().next_counter
    }

    /// Empty the cache, keeping the counter
    pub fn clear(&self) {
        self.clear_cache(false);
    }

    /// Empty the cache, optionally restarting the counter at 0
    pub fn clear_cache(&self, reset_counter: bool) {
        let mut ring = self.ring.lock();
        ring.entries.clear();
        if reset_counter {
            ring.next_counter = 0;
        }
        debug!("event cache cleared: reset_counter={reset_counter}");
    }

    pub fn exclude_destination(&self, destination: &str) {
        let destination = destination.trim();
        if destination.is_empty() {
            return;
        }
        self.excluded.write().insert(destination.to_string());
    }

    pub fn include_destination(&self, destination: &str) {
        let destination = destination.trim();
        if destination.is_empty() {
            return;
        }
        self.excluded.write().remove(destination);
    }

    pub fn excluded_destinations(&self) -> Vec<String> {
        let mut excluded: Vec<_> = self.excluded.read().iter().cloned().collect();
        excluded.sort();
        excluded
    }
}
