//! Memory manager for decoded audio buffers.
//!
//! Tracks every registered buffer against a byte and count budget. Room for a
//! new registration is made *before* it is committed, by evicting
//! non-persistent buffers in ascending keep-rank order. A periodic sweep
//! ([`MemoryManager::collect_garbage`]) drops idle buffers.
//!
//! Callbacks added with [`MemoryManager::add_cleanup_callback`] run
//! synchronously on every unregister and must not call back into the manager.

use sampledeck_core::{MemoryConfig, Result, SampleDeckError, SharedAudioBuffer};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Coarse eviction class. `High` buffers are kept longest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum BufferPriority {
    Low,
    #[default]
    Medium,
    High,
}

/// Options for [`MemoryManager::register_buffer`].
#[derive(Debug, Clone, Default)]
pub struct RegisterOptions {
    pub priority: BufferPriority,
    /// Persistent buffers are never evicted by cleanup or GC.
    pub persistent: bool,
    pub tags: Vec<String>,
    /// Where the buffer came from (file name, recording, URL...).
    pub source: Option<String>,
}

/// Lifecycle data for one registered buffer.
#[derive(Debug, Clone)]
pub struct BufferMetadata {
    pub id: String,
    /// `channels x samples x 4`.
    pub size: usize,
    pub created_at: Instant,
    pub last_accessed: Instant,
    pub access_count: u64,
    pub priority: BufferPriority,
    pub persistent: bool,
    pub tags: Vec<String>,
    pub source: Option<String>,
}

impl BufferMetadata {
    /// Compare how strongly two buffers should be kept.
    ///
    /// `Greater` means `self` is kept longer. Keys in order: priority,
    /// persistent flag, last access (recent wins), access count (frequent
    /// wins), creation time (newer wins).
    pub fn keep_rank_cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(self.persistent.cmp(&other.persistent))
            .then(self.last_accessed.cmp(&other.last_accessed))
            .then(self.access_count.cmp(&other.access_count))
            .then(self.created_at.cmp(&other.created_at))
    }
}

/// Observer invoked with `(id, metadata)` whenever a buffer is unregistered.
pub type CleanupCallback = Box<dyn Fn(&str, &BufferMetadata) + Send + Sync>;

struct Entry {
    buffer: SharedAudioBuffer,
    metadata: BufferMetadata,
}

/// Outcome of a dry run of the admission rules.
struct AdmissionPlan {
    admitted: bool,
    /// Tracked bytes once `evict` (and any replaced entry) are gone.
    total_after: usize,
    evict: Vec<String>,
}

/// Usage snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub total_bytes: usize,
    pub buffer_count: usize,
    pub persistent_bytes: usize,
    pub max_memory_usage: usize,
    pub max_buffer_count: usize,
    pub usage_ratio: f64,
    pub low_bytes: usize,
    pub medium_bytes: usize,
    pub high_bytes: usize,
}

/// Budgeted registry of audio buffers.
pub struct MemoryManager {
    config: MemoryConfig,
    buffers: HashMap<String, Entry>,
    total_bytes: usize,
    callbacks: Vec<CleanupCallback>,
}

impl MemoryManager {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config,
            buffers: HashMap::new(),
            total_bytes: 0,
            callbacks: Vec::new(),
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Register `buffer` under `id`, evicting lower-ranked buffers first if
    /// the budget requires it. Returns the ids that were evicted.
    ///
    /// Admission is decided before anything changes: on `MemoryPressure` no
    /// buffer has been evicted. Re-registering an existing id counts the old
    /// buffer's bytes as freed and releases it only once the new one is
    /// admitted.
    pub fn register_buffer(
        &mut self,
        id: impl Into<String>,
        buffer: SharedAudioBuffer,
        options: RegisterOptions,
    ) -> Result<Vec<String>> {
        let id = id.into();
        if id.is_empty() {
            return Err(SampleDeckError::InvalidInput("buffer id is empty".into()));
        }
        if buffer.is_empty() {
            return Err(SampleDeckError::InvalidInput(format!(
                "buffer {id} has no samples"
            )));
        }

        let size = buffer.byte_size();
        if size > self.config.max_memory_usage {
            return Err(SampleDeckError::MemoryPressure {
                requested: size,
                available: self
                    .config
                    .max_memory_usage
                    .saturating_sub(self.persistent_bytes()),
            });
        }

        let plan = self.plan_admission(&id, size);
        if !plan.admitted {
            warn!(
                buffer = %id,
                requested = size,
                total = self.total_bytes,
                "no evictable buffers left, registration refused"
            );
            return Err(SampleDeckError::MemoryPressure {
                requested: size,
                available: self
                    .config
                    .max_memory_usage
                    .saturating_sub(plan.total_after),
            });
        }

        let mut evicted = Vec::with_capacity(plan.evict.len());
        let mut freed = 0usize;
        for victim in plan.evict {
            if let Some(meta) = self.unregister_buffer(&victim) {
                freed += meta.size;
                evicted.push(victim);
            }
        }
        if !evicted.is_empty() {
            info!(
                freed,
                evicted = evicted.len(),
                total = self.total_bytes,
                "emergency cleanup for registration"
            );
        }
        if self.buffers.contains_key(&id) {
            debug!(buffer = %id, "replacing registered buffer");
            self.unregister_buffer(&id);
        }

        let now = Instant::now();
        let metadata = BufferMetadata {
            id: id.clone(),
            size,
            created_at: now,
            last_accessed: now,
            access_count: 0,
            priority: options.priority,
            persistent: options.persistent,
            tags: options.tags,
            source: options.source,
        };
        self.total_bytes += size;
        self.buffers.insert(id.clone(), Entry { buffer, metadata });

        info!(
            buffer = %id,
            size,
            total = self.total_bytes,
            evicted = evicted.len(),
            "registered audio buffer"
        );
        Ok(evicted)
    }

    /// Release a buffer and notify cleanup callbacks. Returns its metadata.
    pub fn unregister_buffer(&mut self, id: &str) -> Option<BufferMetadata> {
        let entry = self.buffers.remove(id)?;
        self.total_bytes -= entry.metadata.size;
        debug!(buffer = %id, size = entry.metadata.size, "unregistered audio buffer");

        for (idx, callback) in self.callbacks.iter().enumerate() {
            let outcome = catch_unwind(AssertUnwindSafe(|| callback(id, &entry.metadata)));
            if outcome.is_err() {
                error!(buffer = %id, callback = idx, "cleanup callback panicked");
            }
        }
        Some(entry.metadata)
    }

    /// Fetch a buffer and mark it as used.
    pub fn get_buffer(&mut self, id: &str) -> Option<SharedAudioBuffer> {
        let entry = self.buffers.get_mut(id)?;
        entry.metadata.last_accessed = Instant::now();
        entry.metadata.access_count += 1;
        Some(SharedAudioBuffer::clone(&entry.buffer))
    }

    /// Metadata without touching access statistics.
    pub fn metadata(&self, id: &str) -> Option<&BufferMetadata> {
        self.buffers.get(id).map(|e| &e.metadata)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.buffers.contains_key(id)
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Bytes currently tracked.
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Ids carrying `tag`, in no particular order.
    pub fn buffers_by_tag(&self, tag: &str) -> Vec<String> {
        self.buffers
            .values()
            .filter(|e| e.metadata.tags.iter().any(|t| t == tag))
            .map(|e| e.metadata.id.clone())
            .collect()
    }

    pub fn add_cleanup_callback(
        &mut self,
        callback: impl Fn(&str, &BufferMetadata) + Send + Sync + 'static,
    ) {
        self.callbacks.push(Box::new(callback));
    }

    fn persistent_bytes(&self) -> usize {
        self.buffers
            .values()
            .filter(|e| e.metadata.persistent)
            .map(|e| e.metadata.size)
            .sum()
    }

    fn eviction_candidates(&self) -> Vec<&BufferMetadata> {
        let mut candidates: Vec<&BufferMetadata> = self
            .buffers
            .values()
            .map(|e| &e.metadata)
            .filter(|m| !m.persistent)
            .collect();
        candidates.sort_by(|a, b| a.keep_rank_cmp(b));
        candidates
    }

    /// Non-persistent ids, lowest keep rank first.
    pub fn eviction_order(&self) -> Vec<String> {
        self.eviction_candidates()
            .into_iter()
            .map(|m| m.id.clone())
            .collect()
    }

    /// Work out which buffers a registration of `size` bytes under `id`
    /// would evict, without touching the registry. An existing entry for
    /// `id` is treated as already released and is never a candidate.
    fn plan_admission(&self, id: &str, size: usize) -> AdmissionPlan {
        let threshold = self.config.threshold_bytes();
        let max = self.config.max_memory_usage;
        let max_count = self.config.max_buffer_count;

        let replaced = self.buffers.get(id).map(|e| e.metadata.size);
        let mut total = self.total_bytes - replaced.unwrap_or(0);
        let mut count = self.buffers.len() - usize::from(replaced.is_some());
        let mut freed = 0usize;
        let mut evict = Vec::new();

        if total + size > threshold || count >= max_count {
            for meta in self.eviction_candidates().into_iter().filter(|m| m.id != id) {
                let target_met = freed >= size || total + size <= threshold;
                let fits = total + size <= max && count < max_count;
                if target_met && fits {
                    break;
                }
                total -= meta.size;
                count -= 1;
                freed += meta.size;
                evict.push(meta.id.clone());
            }
        }

        AdmissionPlan {
            admitted: total + size <= max && count < max_count,
            total_after: total,
            evict,
        }
    }

    /// Evict non-persistent buffers, lowest rank first, until `bytes_needed`
    /// bytes were freed or usage is back under the cleanup threshold.
    pub fn emergency_cleanup(&mut self, bytes_needed: usize) -> Vec<String> {
        let threshold = self.config.threshold_bytes();
        let mut freed = 0usize;
        let mut evicted = Vec::new();

        for id in self.eviction_order() {
            if freed >= bytes_needed || self.total_bytes <= threshold {
                break;
            }
            if let Some(meta) = self.unregister_buffer(&id) {
                freed += meta.size;
                evicted.push(id);
            }
        }

        if freed < bytes_needed && self.total_bytes > threshold {
            warn!(
                freed,
                bytes_needed,
                total = self.total_bytes,
                "emergency cleanup ran out of evictable buffers"
            );
        } else if !evicted.is_empty() {
            info!(freed, evicted = evicted.len(), "emergency cleanup complete");
        }
        evicted
    }

    /// Bytes above the cleanup threshold, zero when under it.
    pub fn bytes_over_threshold(&self) -> usize {
        self.total_bytes.saturating_sub(self.config.threshold_bytes())
    }

    /// Periodic sweep. See [`collect_garbage_at`](Self::collect_garbage_at).
    pub fn collect_garbage(&mut self) -> Vec<String> {
        self.collect_garbage_at(Instant::now())
    }

    /// Evict non-persistent buffers idle longer than `max_buffer_age` as of
    /// `now`, then trim the count back to `max_buffer_count` by keep rank.
    pub fn collect_garbage_at(&mut self, now: Instant) -> Vec<String> {
        let max_age = self.config.max_buffer_age;
        let expired: Vec<String> = self
            .buffers
            .values()
            .map(|e| &e.metadata)
            .filter(|m| !m.persistent && now.saturating_duration_since(m.last_accessed) > max_age)
            .map(|m| m.id.clone())
            .collect();

        let mut evicted = Vec::new();
        for id in expired {
            if self.unregister_buffer(&id).is_some() {
                evicted.push(id);
            }
        }

        if self.buffers.len() > self.config.max_buffer_count {
            for id in self.eviction_order() {
                if self.buffers.len() <= self.config.max_buffer_count {
                    break;
                }
                if self.unregister_buffer(&id).is_some() {
                    evicted.push(id);
                }
            }
        }

        if evicted.is_empty() {
            debug!(buffers = self.buffers.len(), "garbage collection found nothing to evict");
        } else {
            info!(
                evicted = evicted.len(),
                total = self.total_bytes,
                "garbage collection evicted buffers"
            );
        }
        evicted
    }

    /// Unregister everything, persistent buffers included.
    pub fn clear(&mut self) -> Vec<String> {
        let ids: Vec<String> = self.buffers.keys().cloned().collect();
        for id in &ids {
            self.unregister_buffer(id);
        }
        ids
    }

    pub fn stats(&self) -> MemoryStats {
        let bytes_for = |priority: BufferPriority| {
            self.buffers
                .values()
                .filter(|e| e.metadata.priority == priority)
                .map(|e| e.metadata.size)
                .sum()
        };
        MemoryStats {
            total_bytes: self.total_bytes,
            buffer_count: self.buffers.len(),
            persistent_bytes: self.persistent_bytes(),
            max_memory_usage: self.config.max_memory_usage,
            max_buffer_count: self.config.max_buffer_count,
            usage_ratio: if self.config.max_memory_usage == 0 {
                0.0
            } else {
                self.total_bytes as f64 / self.config.max_memory_usage as f64
            },
            low_bytes: bytes_for(BufferPriority::Low),
            medium_bytes: bytes_for(BufferPriority::Medium),
            high_bytes: bytes_for(BufferPriority::High),
        }
    }
}
