//! Two-tier waveform cache.
//!
//! The memory tier is always consulted first. On a miss the optional durable
//! tier is read and a hit there is promoted into memory. The memory tier is
//! bounded by entry count only: inserting past `max_entries` drops the
//! oldest-inserted entries.

use crate::store::{DurableStore, StoredWaveform};
use sampledeck_core::{
    CacheConfig, DownsampleMethod, QualityLevel, SampleDeckError, WaveformMetadata, WaveformResult,
};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

/// A cached result with its bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub result: Arc<WaveformResult>,
    /// Estimated bytes held by `result`.
    pub size: usize,
}

/// Counters for the cache.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Hits served by the durable tier.
    pub durable_hits: u64,
    pub write_errors: u64,
    pub evictions: u64,
    pub entries: usize,
    pub bytes: usize,
    pub max_entries: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

/// Waveform result cache keyed by request fingerprint.
pub struct CacheManager {
    config: CacheConfig,
    entries: HashMap<String, CacheEntry>,
    /// Keys in insertion order, oldest at the front.
    order: VecDeque<String>,
    bytes: usize,
    durable: Option<Arc<dyn DurableStore>>,
    stats: CacheStats,
}

impl CacheManager {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            order: VecDeque::new(),
            bytes: 0,
            durable: None,
            stats: CacheStats::default(),
        }
    }

    /// Attach a durable tier. Ignored when `CacheConfig::durable` is false.
    pub fn with_durable(mut self, store: Arc<dyn DurableStore>) -> Self {
        if self.config.durable {
            self.durable = Some(store);
        }
        self
    }

    pub fn has_durable(&self) -> bool {
        self.durable.is_some()
    }

    /// Look up `key`, falling back to the durable tier.
    pub fn get(&mut self, key: &str) -> Option<Arc<WaveformResult>> {
        if let Some(entry) = self.entries.get(key) {
            self.stats.hits += 1;
            return Some(Arc::clone(&entry.result));
        }

        if let Some(store) = &self.durable {
            match store.get(key) {
                Ok(Some(stored)) => {
                    debug!(key, "promoting waveform from durable cache");
                    let result = Arc::new(from_stored(stored));
                    self.stats.hits += 1;
                    self.stats.durable_hits += 1;
                    self.insert_memory(key, Arc::clone(&result));
                    return Some(result);
                }
                Ok(None) => {}
                Err(e) => warn!(key, error = %e, "durable cache read failed"),
            }
        }

        self.stats.misses += 1;
        None
    }

    /// Whether `key` is in the memory tier. Does not count as a lookup.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Store a result in both tiers. Durable write failures are logged and
    /// swallowed.
    pub fn set(&mut self, key: &str, result: Arc<WaveformResult>) {
        if let Some(store) = &self.durable {
            if let Err(e) = store.put(key, &StoredWaveform::from(result.as_ref())) {
                let err = SampleDeckError::CacheWrite(e.to_string());
                warn!(key, error = %err, "durable cache write failed, continuing");
                self.stats.write_errors += 1;
            }
        }
        self.insert_memory(key, result);
    }

    fn insert_memory(&mut self, key: &str, result: Arc<WaveformResult>) {
        self.remove_memory(key);
        let size = result.size_estimate();
        self.bytes += size;
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                key: key.to_string(),
                result,
                size,
            },
        );
        self.order.push_back(key.to_string());
        self.enforce_limit();
    }

    fn remove_memory(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.bytes -= entry.size;
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        Some(entry)
    }

    fn enforce_limit(&mut self) -> usize {
        let mut evicted = 0;
        while self.entries.len() > self.config.max_entries {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if let Some(entry) = self.entries.remove(&oldest) {
                self.bytes -= entry.size;
                evicted += 1;
            }
        }
        if evicted > 0 {
            self.stats.evictions += evicted as u64;
            debug!(evicted, remaining = self.entries.len(), "cache trimmed");
        }
        evicted
    }

    /// Drop an entry from both tiers.
    pub fn remove(&mut self, key: &str) -> bool {
        if let Some(store) = &self.durable {
            if let Err(e) = store.delete(key) {
                warn!(key, error = %e, "durable cache delete failed");
            }
        }
        self.remove_memory(key).is_some()
    }

    /// Change the memory-tier limit, trimming immediately. Returns the
    /// number of entries dropped.
    pub fn set_max_entries(&mut self, max_entries: usize) -> usize {
        self.config.max_entries = max_entries;
        self.enforce_limit()
    }

    pub fn max_entries(&self) -> usize {
        self.config.max_entries
    }

    /// Empty both tiers.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
        self.bytes = 0;
        if let Some(store) = &self.durable {
            if let Err(e) = store.clear() {
                warn!(error = %e, "durable cache clear failed");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            bytes: self.bytes,
            max_entries: self.config.max_entries,
            ..self.stats.clone()
        }
    }
}

fn from_stored(stored: StoredWaveform) -> WaveformResult {
    let metadata = stored.metadata.unwrap_or_else(|| WaveformMetadata {
        method: DownsampleMethod::Rms,
        quality: QualityLevel::High,
        generated_at_ms: 0,
        source: "durable".into(),
        cooperative: false,
    });
    WaveformResult {
        samples: stored.samples,
        sample_rate: stored.sample_rate,
        duration: stored.duration,
        channels: stored.channels,
        metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use sampledeck_core::Result;

    fn result(len: usize) -> Arc<WaveformResult> {
        Arc::new(WaveformResult {
            samples: vec![0.5; len],
            sample_rate: len as f64 / 10.0,
            duration: 10.0,
            channels: 1,
            metadata: WaveformMetadata {
                method: DownsampleMethod::Rms,
                quality: QualityLevel::High,
                generated_at_ms: 1,
                source: "test".into(),
                cooperative: false,
            },
        })
    }

    fn cache(max_entries: usize) -> CacheManager {
        CacheManager::new(CacheConfig {
            max_entries,
            durable: true,
        })
    }

    #[test]
    fn test_hit_and_miss() {
        let mut c = cache(10);
        assert!(c.get("a").is_none());
        c.set("a", result(4));
        assert_eq!(c.get("a").unwrap().samples.len(), 4);
        let stats = c.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_oldest_inserted_evicted_first() {
        let mut c = cache(2);
        c.set("a", result(1));
        c.set("b", result(1));
        // Reading does not refresh insertion order.
        c.get("a");
        c.set("c", result(1));
        assert!(!c.contains("a"));
        assert!(c.contains("b"));
        assert!(c.contains("c"));
        assert_eq!(c.stats().evictions, 1);
    }

    #[test]
    fn test_reinsert_moves_to_back() {
        let mut c = cache(2);
        c.set("a", result(1));
        c.set("b", result(1));
        c.set("a", result(2));
        c.set("c", result(1));
        assert!(c.contains("a"));
        assert!(!c.contains("b"));
    }

    #[test]
    fn test_shrinking_limit_trims_now() {
        let mut c = cache(10);
        for key in ["a", "b", "c", "d"] {
            c.set(key, result(8));
        }
        assert_eq!(c.set_max_entries(1), 3);
        assert!(c.contains("d"));
        assert_eq!(c.len(), 1);
        assert_eq!(c.stats().bytes, result(8).size_estimate());
    }

    #[test]
    fn test_durable_hit_is_promoted() {
        let store = Arc::new(MemoryStore::new());
        let mut writer = cache(10).with_durable(store.clone());
        writer.set("k", result(16));

        let mut reader = cache(10).with_durable(store);
        assert!(!reader.contains("k"));
        let hit = reader.get("k").unwrap();
        assert_eq!(hit.samples.len(), 16);
        assert_eq!(hit.metadata.source, "test");
        assert!(reader.contains("k"));
        assert_eq!(reader.stats().durable_hits, 1);
    }

    #[test]
    fn test_durable_disabled_by_config() {
        let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
        let c = CacheManager::new(CacheConfig {
            max_entries: 10,
            durable: false,
        })
        .with_durable(store);
        assert!(!c.has_durable());
    }

    struct FailingStore;

    impl DurableStore for FailingStore {
        fn get(&self, _key: &str) -> Result<Option<StoredWaveform>> {
            Ok(None)
        }
        fn put(&self, _key: &str, _value: &StoredWaveform) -> Result<()> {
            Err(SampleDeckError::Io(std::io::Error::other("disk full")))
        }
        fn delete(&self, _key: &str) -> Result<()> {
            Ok(())
        }
        fn clear(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_error_is_swallowed() {
        let mut c = cache(10).with_durable(Arc::new(FailingStore));
        c.set("k", result(4));
        assert!(c.get("k").is_some());
        assert_eq!(c.stats().write_errors, 1);
    }

    #[test]
    fn test_clear_empties_both_tiers() {
        let store = Arc::new(MemoryStore::new());
        let mut c = cache(10).with_durable(store.clone());
        c.set("a", result(4));
        c.clear();
        assert!(c.is_empty());
        assert!(store.is_empty());
        assert_eq!(c.stats().bytes, 0);
    }
}
