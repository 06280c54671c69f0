//! The `WaveformEngine` facade.
//!
//! Owns one instance of every subsystem and wires them together:
//!
//! ```text
//! generate(source, options)
//!   ├─ quality controller  -> level, target cap
//!   ├─ cache               -> hit? return shared result
//!   ├─ worker pool         -> compute (cooperative fallback on timeout)
//!   ├─ cache.set
//!   └─ monitor.evaluate    -> quality / cache / pool / memory adjustments
//! ```
//!
//! `start` spins up the worker pool and the periodic GC sweep; `shutdown`
//! (or dropping the engine) stops both. Before `start`, or with the pool
//! disabled, generation runs cooperatively on the calling task.

use crate::cache::{CacheManager, CacheStats};
use crate::fallback::generate_cooperative;
use crate::memory::{BufferMetadata, MemoryManager, MemoryStats, RegisterOptions};
use crate::monitor::{
    metadata, MemorySnapshot, PerformanceMetrics, PerformanceMonitor, PerformanceSignal,
    COMPUTE_OPERATION, GENERATE_OPERATION,
};
use crate::pool::{PoolStats, WorkerPool};
use crate::protocol::{GenerationProgress, WorkerConfig};
use crate::quality::{QualityController, QualitySettings, QualityTransition};
use crate::store::DurableStore;
use crate::worker::{DownsampleCompute, WaveformCompute};
use parking_lot::Mutex;
use sampledeck_core::{
    fingerprint, unix_millis, AudioBuffer, EngineConfig, GenerateOptions, QualityLevel, Result,
    SampleDeckError, SharedAudioBuffer, SourceShape, WaveformMetadata, WaveformResult,
};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc::UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where the samples for a request come from.
#[derive(Debug, Clone)]
pub enum AudioSource {
    /// A decoded buffer held by the caller.
    Buffer(SharedAudioBuffer),
    /// A buffer previously passed to [`WaveformEngine::register_buffer`].
    Registered(String),
    /// Mono samples not wrapped in a buffer yet.
    Raw { samples: Vec<f32>, sample_rate: u32 },
}

#[derive(Default)]
struct Lifecycle {
    started: bool,
    stopped: bool,
    pool: Option<Arc<WorkerPool>>,
}

/// Waveform generation with budgeted memory, caching and adaptive quality.
pub struct WaveformEngine {
    config: EngineConfig,
    memory: Arc<Mutex<MemoryManager>>,
    cache: Mutex<CacheManager>,
    monitor: PerformanceMonitor,
    quality: Mutex<QualityController>,
    compute: Arc<dyn WaveformCompute>,
    lifecycle: Mutex<Lifecycle>,
    cancel: CancellationToken,
}

impl WaveformEngine {
    pub fn new(config: EngineConfig) -> Self {
        let memory = Arc::new(Mutex::new(MemoryManager::new(config.memory.clone())));
        let sampler = Arc::clone(&memory);
        let budget = config.memory.max_memory_usage;
        let monitor =
            PerformanceMonitor::new(config.monitor.clone()).with_memory_sampler(move || {
                MemorySnapshot {
                    used_bytes: sampler.lock().total_bytes(),
                    budget_bytes: budget,
                }
            });

        Self {
            cache: Mutex::new(CacheManager::new(config.cache.clone())),
            quality: Mutex::new(QualityController::new(&config.quality)),
            memory,
            monitor,
            compute: Arc::new(DownsampleCompute),
            lifecycle: Mutex::new(Lifecycle::default()),
            cancel: CancellationToken::new(),
            config,
        }
    }

    /// Attach a durable cache tier.
    pub fn with_store(mut self, store: Arc<dyn DurableStore>) -> Self {
        let cache = self.cache.get_mut();
        let plain = std::mem::replace(cache, CacheManager::new(self.config.cache.clone()));
        *cache = plain.with_durable(store);
        self
    }

    /// Replace the computation run by worker threads.
    pub fn with_compute(mut self, compute: Arc<dyn WaveformCompute>) -> Self {
        self.compute = compute;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start the worker pool and the periodic GC sweep. Must be called from
    /// within a tokio runtime. Calling it twice is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.stopped {
            return Err(SampleDeckError::PoolShutdown);
        }
        if lifecycle.started {
            return Ok(());
        }
        let runtime = Handle::try_current().map_err(|_| {
            SampleDeckError::InvalidInput("waveform engine requires a tokio runtime".into())
        })?;

        if self.config.pool.enabled {
            let pool = WorkerPool::new(&self.config.pool, Arc::clone(&self.compute))?;
            let workers = self.quality.lock().settings().max_workers;
            pool.resize(workers.min(self.config.pool.max_workers));
            lifecycle.pool = Some(Arc::new(pool));
        } else {
            info!("worker pool disabled, generating on the calling task");
        }

        let memory = Arc::clone(&self.memory);
        let cancel = self.cancel.child_token();
        let period = self.config.memory.gc_interval;
        runtime.spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let evicted = memory.lock().collect_garbage();
                        if !evicted.is_empty() {
                            debug!(evicted = ?evicted, "periodic sweep released buffers");
                        }
                    }
                }
            }
        });

        lifecycle.started = true;
        info!(
            gc_interval_ms = period.as_millis() as u64,
            "waveform engine started"
        );
        Ok(())
    }

    /// Stop background work. In-flight worker tasks fail with
    /// [`SampleDeckError::PoolShutdown`]. The engine cannot be restarted.
    pub fn shutdown(&self) {
        let pool = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.stopped {
                return;
            }
            lifecycle.stopped = true;
            lifecycle.pool.take()
        };
        self.cancel.cancel();
        if let Some(pool) = pool {
            pool.shutdown();
        }
        info!("waveform engine stopped");
    }

    pub fn is_running(&self) -> bool {
        let lifecycle = self.lifecycle.lock();
        lifecycle.started && !lifecycle.stopped
    }

    fn pool(&self) -> Option<Arc<WorkerPool>> {
        self.lifecycle.lock().pool.clone()
    }

    // ── Generation ──────────────────────────────────────────────

    /// Produce (or fetch from cache) the waveform for `source`.
    pub async fn generate(
        &self,
        source: AudioSource,
        options: GenerateOptions,
    ) -> Result<Arc<WaveformResult>> {
        self.generate_with_cancel(source, options, None, &CancellationToken::new())
            .await
    }

    /// Like [`generate`](Self::generate), streaming progress updates to
    /// `progress`. Cache hits produce no updates.
    pub async fn generate_with_progress(
        &self,
        source: AudioSource,
        options: GenerateOptions,
        progress: UnboundedSender<GenerationProgress>,
    ) -> Result<Arc<WaveformResult>> {
        self.generate_with_cancel(source, options, Some(progress), &CancellationToken::new())
            .await
    }

    /// Generate until done or until `cancel` fires, in which case the
    /// request fails with [`SampleDeckError::Cancelled`], its pool task is
    /// abandoned and nothing is cached. Engine shutdown ends the request
    /// with [`SampleDeckError::PoolShutdown`].
    pub async fn generate_with_cancel(
        &self,
        source: AudioSource,
        options: GenerateOptions,
        progress: Option<UnboundedSender<GenerationProgress>>,
        cancel: &CancellationToken,
    ) -> Result<Arc<WaveformResult>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SampleDeckError::PoolShutdown),
            outcome = self.generate_inner(source, options, progress, cancel) => outcome,
        }
    }

    async fn generate_inner(
        &self,
        source: AudioSource,
        options: GenerateOptions,
        progress: Option<UnboundedSender<GenerationProgress>>,
        cancel: &CancellationToken,
    ) -> Result<Arc<WaveformResult>> {
        if cancel.is_cancelled() {
            return Err(SampleDeckError::Cancelled);
        }
        let measurement = self.monitor.start_measurement(GENERATE_OPERATION);

        if options.target_samples == 0 {
            return Err(SampleDeckError::InvalidInput(
                "target sample count must be at least 1".into(),
            ));
        }
        let (buffer, label) = self.resolve(source)?;
        let channel = buffer.channel(options.channel).ok_or_else(|| {
            SampleDeckError::InvalidInput(format!(
                "channel {} out of range for a {}-channel buffer",
                options.channel,
                buffer.channel_count()
            ))
        })?;

        let level = match options.quality {
            Some(level) => level,
            None => self.quality.lock().level(),
        };
        let target = options
            .target_samples
            .min(QualitySettings::for_level(level).max_target_samples);
        let effective = GenerateOptions {
            target_samples: target,
            ..options
        };
        let shape = SourceShape::from(buffer.as_ref());
        let key = fingerprint(&shape, &effective);

        let cached = self.cache.lock().get(&key);
        if let Some(hit) = cached {
            debug!(key = %key, "waveform cache hit");
            measurement.end(metadata([("cache", "hit".into())]));
            return Ok(hit);
        }

        let config = WorkerConfig {
            target_samples: target,
            method: level.method(),
            normalize: effective.normalize,
            progress_chunk: self.config.pool.progress_chunk,
            report_progress: progress.is_some(),
        };

        let timing = self.monitor.start_measurement(COMPUTE_OPERATION);
        let (samples, cooperative) = self
            .run_compute(channel, &config, progress.as_ref(), cancel)
            .await?;
        timing.end(metadata([
            ("method", format!("{:?}", config.method)),
            ("target", target.to_string()),
            ("input", channel.len().to_string()),
            ("cooperative", cooperative.to_string()),
        ]));

        let duration = buffer.duration();
        let result = Arc::new(WaveformResult {
            sample_rate: if duration > 0.0 {
                samples.len() as f64 / duration
            } else {
                0.0
            },
            samples,
            duration,
            channels: buffer.channel_count(),
            metadata: WaveformMetadata {
                method: config.method,
                quality: level,
                generated_at_ms: unix_millis(),
                source: label,
                cooperative,
            },
        });

        self.cache.lock().set(&key, Arc::clone(&result));
        measurement.end(metadata([("cache", "miss".into())]));
        self.adapt();
        Ok(result)
    }

    fn resolve(&self, source: AudioSource) -> Result<(SharedAudioBuffer, String)> {
        match source {
            AudioSource::Buffer(buffer) => Ok((buffer, "buffer".into())),
            AudioSource::Registered(id) => {
                let buffer = self.memory.lock().get_buffer(&id);
                match buffer {
                    Some(buffer) => Ok((buffer, id)),
                    None => Err(SampleDeckError::InvalidInput(format!(
                        "no buffer registered as {id:?}"
                    ))),
                }
            }
            AudioSource::Raw {
                samples,
                sample_rate,
            } => Ok((Arc::new(AudioBuffer::mono(samples, sample_rate)?), "raw".into())),
        }
    }

    /// Run the reduction on the pool, falling back to the calling task when
    /// the pool is absent or (per policy) a worker fails.
    async fn run_compute(
        &self,
        channel: &[f32],
        config: &WorkerConfig,
        progress: Option<&UnboundedSender<GenerationProgress>>,
        cancel: &CancellationToken,
    ) -> Result<(Vec<f32>, bool)> {
        let Some(pool) = self.pool() else {
            let samples = generate_cooperative(channel, config, cancel, progress).await?;
            return Ok((samples, true));
        };

        let submitted = pool
            .submit_with_cancel(channel.to_vec(), config.clone(), progress.cloned(), cancel)
            .await;
        match submitted {
            Ok(samples) => Ok((samples, false)),
            Err(e) if self.config.fallback_on_timeout && e.is_retryable() => {
                warn!(error = %e, "worker path failed, generating on the calling task");
                let samples = generate_cooperative(channel, config, cancel, progress).await?;
                Ok((samples, true))
            }
            Err(e) => Err(e),
        }
    }

    // ── Adaptation ──────────────────────────────────────────────

    /// Evaluate the monitor and apply whatever the signal calls for.
    fn adapt(&self) -> PerformanceSignal {
        let signal = self.monitor.evaluate();
        let transition = self.quality.lock().on_signal(&signal);
        if let Some(transition) = &transition {
            self.apply_transition(transition);
        }
        if let PerformanceSignal::Critical { reason } = &signal {
            let evicted = {
                let mut memory = self.memory.lock();
                let over = memory.bytes_over_threshold();
                memory.emergency_cleanup(over)
            };
            if !evicted.is_empty() {
                warn!(reason = %reason, evicted = ?evicted, "critical signal released buffers");
            }
        }
        signal
    }

    fn apply_transition(&self, transition: &QualityTransition) {
        let entries = transition
            .settings
            .cache_entries
            .min(self.config.cache.max_entries);
        let dropped = self.cache.lock().set_max_entries(entries);
        let workers = self.pool().map(|pool| {
            pool.resize(
                transition
                    .settings
                    .max_workers
                    .min(self.config.pool.max_workers),
            )
        });
        info!(
            level = transition.to.name(),
            cache_entries = entries,
            cache_dropped = dropped,
            workers = ?workers,
            "applied quality settings"
        );
    }

    /// Feed the host's frame rate to the monitor and react to the result.
    pub fn report_frame_rate(&self, fps: f64) -> PerformanceSignal {
        self.monitor.record_frame_rate(fps);
        self.adapt()
    }

    pub fn quality_level(&self) -> QualityLevel {
        self.quality.lock().level()
    }

    /// Pin the quality level and apply its settings.
    pub fn set_quality_level(&self, level: QualityLevel) {
        let transition = self.quality.lock().set_level(level);
        if let Some(transition) = transition {
            self.apply_transition(&transition);
        }
    }

    /// Receive every signal the monitor produces.
    pub fn subscribe_signals(&self) -> broadcast::Receiver<PerformanceSignal> {
        self.monitor.subscribe()
    }

    // ── Buffers ─────────────────────────────────────────────────

    /// Track a decoded buffer. Returns the ids evicted to make room.
    pub fn register_buffer(
        &self,
        id: impl Into<String>,
        buffer: SharedAudioBuffer,
        options: RegisterOptions,
    ) -> Result<Vec<String>> {
        self.memory.lock().register_buffer(id, buffer, options)
    }

    pub fn unregister_buffer(&self, id: &str) -> Option<BufferMetadata> {
        self.memory.lock().unregister_buffer(id)
    }

    pub fn get_buffer(&self, id: &str) -> Option<SharedAudioBuffer> {
        self.memory.lock().get_buffer(id)
    }

    /// Observe unregistrations. Callbacks run under the memory manager's
    /// lock and must not call back into the engine.
    pub fn add_cleanup_callback(
        &self,
        callback: impl Fn(&str, &BufferMetadata) + Send + Sync + 'static,
    ) {
        self.memory.lock().add_cleanup_callback(callback);
    }

    /// Run a GC sweep now.
    pub fn collect_garbage(&self) -> Vec<String> {
        self.memory.lock().collect_garbage()
    }

    // ── Introspection ───────────────────────────────────────────

    pub fn performance_metrics(&self) -> PerformanceMetrics {
        self.monitor.metrics()
    }

    pub fn memory_optimization_recommendations(&self) -> Vec<String> {
        self.monitor.memory_optimization_recommendations()
    }

    pub fn memory_stats(&self) -> MemoryStats {
        self.memory.lock().stats()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.lock().stats()
    }

    /// `None` until `start` has run with the pool enabled.
    pub fn pool_stats(&self) -> Option<PoolStats> {
        self.pool().map(|pool| pool.stats())
    }

    /// Empty both cache tiers.
    pub fn clear_cache(&self) {
        self.cache.lock().clear();
        info!("waveform cache cleared");
    }
}

impl Drop for WaveformEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
