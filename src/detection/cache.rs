//! Bounded detection result cache
//!
//! Keyed by a payload-derived fingerprint so repeated traffic (polling
//! loops dominate industrial captures) skips the analyzer pass entirely.
//! Eviction discards roughly half the entries, unordered; callers must not
//! depend on which entries survive.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::DetectionResult;
use crate::network::CapturedPacket;

/// How many leading payload bytes participate in the cache key
const KEY_PREFIX_LEN: usize = 16;

/// Derive the cache key for a packet: payload length plus leading bytes
/// when a payload exists, the ordered decoded layer list otherwise.
pub fn cache_key(packet: &CapturedPacket) -> u64 {
    let mut hasher = DefaultHasher::new();
    if packet.has_payload() {
        packet.payload.len().hash(&mut hasher);
        let prefix = &packet.payload[..packet.payload.len().min(KEY_PREFIX_LEN)];
        prefix.hash(&mut hasher);
    } else {
        packet.layers.hash(&mut hasher);
    }
    hasher.finish()
}

/// Bounded key → result map with half-eviction
pub struct DetectionCache {
    entries: Mutex<HashMap<u64, DetectionResult>>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl DetectionCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::with_capacity(capacity)),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up a cached result, recording a hit or miss
    pub fn get(&self, key: u64) -> Option<DetectionResult> {
        let entries = self.entries.lock().unwrap();
        match entries.get(&key) {
            Some(result) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(result.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a result, evicting roughly half the entries at capacity
    pub fn insert(&self, key: u64, result: DetectionResult) {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() >= self.capacity {
            let mut keep = false;
            entries.retain(|_, _| {
                keep = !keep;
                keep
            });
            log::debug!(
                "detection cache evicted down to {} of {} entries",
                entries.len(),
                self.capacity
            );
        }
        entries.insert(key, result);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}
