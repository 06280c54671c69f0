//! SampleDeck Engine - Waveform generation under resource budgets
//!
//! Turns decoded audio into display waveforms while keeping memory, CPU and
//! cache use bounded:
//! - `memory`: budgeted buffer registry with priority eviction and GC
//! - `cache`: two-tier result cache keyed by request fingerprint
//! - `store`: durable cache backends (in-memory map, JSON files)
//! - `pool` / `worker` / `protocol`: bounded worker threads with timeouts
//! - `fallback`: cooperative generation on the calling task
//! - `monitor` / `quality`: performance signals and adaptive quality levels
//! - `engine`: the `WaveformEngine` facade tying it all together

pub mod cache;
pub mod engine;
pub mod fallback;
pub mod memory;
pub mod monitor;
pub mod pool;
pub mod protocol;
pub mod quality;
pub mod store;
pub mod worker;

pub use cache::{CacheEntry, CacheManager, CacheStats};
pub use engine::{AudioSource, WaveformEngine};
pub use fallback::generate_cooperative;
pub use memory::{
    BufferMetadata, BufferPriority, CleanupCallback, MemoryManager, MemoryStats, RegisterOptions,
};
pub use monitor::{
    MemorySnapshot, Measurement, OperationSummary, PerformanceMetrics, PerformanceMonitor,
    PerformanceSample, PerformanceSignal, COMPUTE_OPERATION, GENERATE_OPERATION,
};
pub use pool::{pool_size, PoolStats, TaskStatus, WorkerPool};
pub use protocol::{GenerationProgress, WorkerConfig, WorkerRequest, WorkerResponse};
pub use quality::{QualityController, QualitySettings, QualityTransition};
pub use store::{DurableStore, FileStore, MemoryStore, StoredWaveform};
pub use worker::{DownsampleCompute, WaveformCompute};
