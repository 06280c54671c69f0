//! Engine configuration.
//!
//! Every struct has documented defaults and deserializes with
//! `#[serde(default)]`, so a JSON file only needs the fields it overrides.
//! Durations are written as milliseconds.

use crate::error::Result;
use crate::waveform::QualityLevel;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Budget constants used by the defaults below.
pub mod memory_budget {
    /// Raw audio the memory manager may track (512 MB).
    pub const MAX_MEMORY_USAGE: usize = 512 * 1024 * 1024;

    /// Maximum number of registered buffers.
    pub const MAX_BUFFER_COUNT: usize = 50;

    /// Fraction of the budget at which emergency cleanup starts.
    pub const CLEANUP_THRESHOLD: f64 = 0.8;

    /// Cached waveform results kept in memory.
    pub const MAX_CACHE_ENTRIES: usize = 100;

    /// Input samples processed per cooperative step.
    pub const PROGRESS_CHUNK: usize = 65_536;
}

/// Memory manager settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Hard budget in bytes for registered buffers.
    pub max_memory_usage: usize,
    /// Maximum number of registered buffers.
    pub max_buffer_count: usize,
    /// Fraction of `max_memory_usage` that triggers emergency cleanup.
    pub cleanup_threshold: f64,
    /// Idle time after which the GC sweep evicts a non-persistent buffer.
    #[serde(with = "duration_ms")]
    pub max_buffer_age: Duration,
    /// Interval between GC sweeps.
    #[serde(with = "duration_ms")]
    pub gc_interval: Duration,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_memory_usage: memory_budget::MAX_MEMORY_USAGE,
            max_buffer_count: memory_budget::MAX_BUFFER_COUNT,
            cleanup_threshold: memory_budget::CLEANUP_THRESHOLD,
            max_buffer_age: Duration::from_secs(10 * 60),
            gc_interval: Duration::from_secs(30),
        }
    }
}

impl MemoryConfig {
    /// Byte level at which emergency cleanup kicks in.
    pub fn threshold_bytes(&self) -> usize {
        (self.max_memory_usage as f64 * self.cleanup_threshold) as usize
    }
}

/// Waveform cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum in-memory entries before the oldest are dropped.
    pub max_entries: usize,
    /// Use the durable tier when a store is attached.
    pub durable: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: memory_budget::MAX_CACHE_ENTRIES,
            durable: true,
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Upper bound on workers; the pool never exceeds the CPU count.
    pub max_workers: usize,
    /// Deadline for a dispatched task.
    #[serde(with = "duration_ms")]
    pub task_timeout: Duration,
    /// Set to false to always compute on the calling task.
    pub enabled: bool,
    /// Input samples per progress step.
    pub progress_chunk: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            task_timeout: Duration::from_secs(30),
            enabled: true,
            progress_chunk: memory_budget::PROGRESS_CHUNK,
        }
    }
}

/// Performance monitor thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Samples retained per operation name.
    pub max_samples_per_operation: usize,
    /// Rolling generation latency that counts as degraded.
    #[serde(with = "duration_ms")]
    pub latency_warning: Duration,
    /// Rolling generation latency that counts as critical.
    #[serde(with = "duration_ms")]
    pub latency_critical: Duration,
    /// Frame rate below which the host is considered degraded.
    pub min_frame_rate: f64,
    /// Frame rate below which the host is considered critical.
    pub critical_frame_rate: f64,
    /// Memory usage ratio reported as a warning.
    pub memory_warning_ratio: f64,
    /// Memory usage ratio reported as critical.
    pub memory_critical_ratio: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_samples_per_operation: 100,
            latency_warning: Duration::from_secs(1),
            latency_critical: Duration::from_secs(5),
            min_frame_rate: 30.0,
            critical_frame_rate: 15.0,
            memory_warning_ratio: 0.75,
            memory_critical_ratio: 0.9,
        }
    }
}

/// Adaptive quality settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Level used until the first signal arrives.
    pub initial_level: QualityLevel,
    /// React to performance signals.
    pub adaptive: bool,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            initial_level: QualityLevel::High,
            adaptive: true,
        }
    }
}

/// Top-level configuration for a `WaveformEngine`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub memory: MemoryConfig,
    pub cache: CacheConfig,
    pub pool: PoolConfig,
    pub monitor: MonitorConfig,
    pub quality: QualityConfig,
    /// Retry on the synchronous path when a worker times out or fails.
    pub fallback_on_timeout: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            memory: MemoryConfig::default(),
            cache: CacheConfig::default(),
            pool: PoolConfig::default(),
            monitor: MonitorConfig::default(),
            quality: QualityConfig::default(),
            fallback_on_timeout: true,
        }
    }
}

impl EngineConfig {
    /// Load a configuration from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Parse a configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
