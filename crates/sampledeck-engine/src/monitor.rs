//! Performance monitor.
//!
//! Times named operations, keeps a bounded history per name, and turns the
//! rolling numbers into [`PerformanceSignal`]s for the quality controller.

use parking_lot::Mutex;
use sampledeck_core::{unix_millis, MonitorConfig};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Operation name wrapping a whole `generate` call, cache hits included.
pub const GENERATE_OPERATION: &str = "waveform.generate";
/// Operation name wrapping the actual downsampling work on a cache miss.
pub const COMPUTE_OPERATION: &str = "waveform.compute";

/// Free-form key/value annotations for a measurement.
pub type Metadata = BTreeMap<String, String>;

/// Memory usage reported by the sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemorySnapshot {
    pub used_bytes: usize,
    pub budget_bytes: usize,
}

impl MemorySnapshot {
    pub fn ratio(&self) -> f64 {
        if self.budget_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f64 / self.budget_bytes as f64
    }
}

/// One completed measurement.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceSample {
    pub operation: String,
    pub duration: Duration,
    /// Unix timestamp in milliseconds.
    pub timestamp_ms: u64,
    /// Tracked memory when the measurement ended.
    pub memory_bytes: usize,
    /// Change in tracked memory over the measurement.
    pub memory_delta: i64,
    pub metadata: Metadata,
}

/// Aggregate for one operation name.
#[derive(Debug, Clone, Serialize)]
pub struct OperationSummary {
    pub count: u64,
    pub min: Duration,
    pub max: Duration,
    pub avg: Duration,
    pub total: Duration,
    /// Average over the retained samples only.
    pub recent_avg: Duration,
}

#[derive(Debug, Default)]
struct OperationStats {
    count: u64,
    min: Option<Duration>,
    max: Duration,
    total: Duration,
    recent: VecDeque<PerformanceSample>,
}

impl OperationStats {
    fn record(&mut self, sample: PerformanceSample, capacity: usize) {
        self.count += 1;
        self.total += sample.duration;
        self.max = self.max.max(sample.duration);
        self.min = Some(self.min.map_or(sample.duration, |m| m.min(sample.duration)));
        if self.recent.len() >= capacity.max(1) {
            self.recent.pop_front();
        }
        self.recent.push_back(sample);
    }

    fn recent_avg(&self) -> Duration {
        if self.recent.is_empty() {
            return Duration::ZERO;
        }
        let sum: Duration = self.recent.iter().map(|s| s.duration).sum();
        sum / self.recent.len() as u32
    }

    fn summary(&self) -> OperationSummary {
        let avg = if self.count == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(self.total.as_secs_f64() / self.count as f64)
        };
        OperationSummary {
            count: self.count,
            min: self.min.unwrap_or_default(),
            max: self.max,
            avg,
            total: self.total,
            recent_avg: self.recent_avg(),
        }
    }
}

/// Health verdict derived from the rolling statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum PerformanceSignal {
    Healthy,
    Degraded { reason: String },
    Critical { reason: String },
}

impl PerformanceSignal {
    fn severity(&self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::Degraded { .. } => 1,
            Self::Critical { .. } => 2,
        }
    }

    fn worst(self, other: Self) -> Self {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

/// Snapshot returned by [`PerformanceMonitor::metrics`].
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceMetrics {
    pub operations: BTreeMap<String, OperationSummary>,
    pub frame_rate: Option<f64>,
    pub memory: Option<MemorySnapshot>,
}

type MemorySampler = Box<dyn Fn() -> MemorySnapshot + Send + Sync>;

#[derive(Default)]
struct MonitorState {
    operations: HashMap<String, OperationStats>,
    frame_rate: Option<f64>,
}

/// Records timings and emits degradation signals.
pub struct PerformanceMonitor {
    config: MonitorConfig,
    state: Mutex<MonitorState>,
    memory_sampler: Option<MemorySampler>,
    signals: broadcast::Sender<PerformanceSignal>,
}

impl PerformanceMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        let (signals, _) = broadcast::channel(16);
        Self {
            config,
            state: Mutex::new(MonitorState::default()),
            memory_sampler: None,
            signals,
        }
    }

    /// Attach a sampler used for memory snapshots and memory-based signals.
    pub fn with_memory_sampler(
        mut self,
        sampler: impl Fn() -> MemorySnapshot + Send + Sync + 'static,
    ) -> Self {
        self.memory_sampler = Some(Box::new(sampler));
        self
    }

    /// Start timing `name`. Call [`Measurement::end`] to record it.
    pub fn start_measurement(&self, name: impl Into<String>) -> Measurement<'_> {
        Measurement {
            monitor: self,
            name: name.into(),
            started: Instant::now(),
            memory_before: self.memory_used(),
        }
    }

    /// Record the host's observed frame rate.
    pub fn record_frame_rate(&self, fps: f64) {
        self.state.lock().frame_rate = Some(fps);
    }

    /// Receive every signal produced by [`evaluate`](Self::evaluate).
    pub fn subscribe(&self) -> broadcast::Receiver<PerformanceSignal> {
        self.signals.subscribe()
    }

    /// Current memory snapshot, if a sampler is attached.
    pub fn memory_snapshot(&self) -> Option<MemorySnapshot> {
        self.memory_sampler.as_ref().map(|sampler| sampler())
    }

    fn memory_used(&self) -> usize {
        self.memory_snapshot().map_or(0, |m| m.used_bytes)
    }

    fn record(&self, sample: PerformanceSample) {
        let capacity = self.config.max_samples_per_operation;
        let mut state = self.state.lock();
        state
            .operations
            .entry(sample.operation.clone())
            .or_default()
            .record(sample, capacity);
    }

    /// Summary for one operation, if it has been measured.
    pub fn operation(&self, name: &str) -> Option<OperationSummary> {
        self.state.lock().operations.get(name).map(OperationStats::summary)
    }

    /// Retained samples for one operation, oldest first.
    pub fn recent_samples(&self, name: &str) -> Vec<PerformanceSample> {
        self.state
            .lock()
            .operations
            .get(name)
            .map(|stats| stats.recent.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of every aggregate.
    pub fn metrics(&self) -> PerformanceMetrics {
        let state = self.state.lock();
        PerformanceMetrics {
            operations: state
                .operations
                .iter()
                .map(|(name, stats)| (name.clone(), stats.summary()))
                .collect(),
            frame_rate: state.frame_rate,
            memory: self.memory_snapshot(),
        }
    }

    /// Derive a signal from compute latency, frame rate and memory usage,
    /// publish it to subscribers, and return it.
    pub fn evaluate(&self) -> PerformanceSignal {
        let (latency, frame_rate) = {
            let state = self.state.lock();
            let latency = state
                .operations
                .get(COMPUTE_OPERATION)
                .filter(|s| !s.recent.is_empty())
                .map(OperationStats::recent_avg);
            (latency, state.frame_rate)
        };

        let mut signal = PerformanceSignal::Healthy;

        if let Some(latency) = latency {
            if latency >= self.config.latency_critical {
                signal = signal.worst(PerformanceSignal::Critical {
                    reason: format!("average compute latency {} ms", latency.as_millis()),
                });
            } else if latency >= self.config.latency_warning {
                signal = signal.worst(PerformanceSignal::Degraded {
                    reason: format!("average compute latency {} ms", latency.as_millis()),
                });
            }
        }

        if let Some(fps) = frame_rate {
            if fps < self.config.critical_frame_rate {
                signal = signal.worst(PerformanceSignal::Critical {
                    reason: format!("frame rate {fps:.1} fps"),
                });
            } else if fps < self.config.min_frame_rate {
                signal = signal.worst(PerformanceSignal::Degraded {
                    reason: format!("frame rate {fps:.1} fps"),
                });
            }
        }

        if let Some(memory) = self.memory_snapshot() {
            let ratio = memory.ratio();
            if ratio > self.config.memory_critical_ratio {
                signal = signal.worst(PerformanceSignal::Critical {
                    reason: format!("memory at {:.0}% of budget", ratio * 100.0),
                });
            } else if ratio > self.config.memory_warning_ratio {
                signal = signal.worst(PerformanceSignal::Degraded {
                    reason: format!("memory at {:.0}% of budget", ratio * 100.0),
                });
            }
        }

        match &signal {
            PerformanceSignal::Healthy => {}
            PerformanceSignal::Degraded { reason } => debug!(%reason, "performance degraded"),
            PerformanceSignal::Critical { reason } => warn!(%reason, "performance critical"),
        }
        // No subscribers is fine.
        let _ = self.signals.send(signal.clone());
        signal
    }

    /// Advisory strings for the host. Nothing here is enforced.
    pub fn memory_optimization_recommendations(&self) -> Vec<String> {
        let mut recommendations = Vec::new();

        if let Some(memory) = self.memory_snapshot() {
            let percent = memory.ratio() * 100.0;
            if memory.ratio() > self.config.memory_critical_ratio {
                recommendations.push(format!(
                    "critical: buffer memory at {percent:.0}% of budget, release unused audio buffers"
                ));
            } else if memory.ratio() > self.config.memory_warning_ratio {
                recommendations.push(format!(
                    "warning: buffer memory at {percent:.0}% of budget, consider lowering buffer priorities"
                ));
            }
        }

        if let Some(summary) = self.operation(COMPUTE_OPERATION) {
            if summary.recent_avg >= self.config.latency_warning {
                recommendations.push(format!(
                    "slow waveform generation ({} ms average), reduce target resolution",
                    summary.recent_avg.as_millis()
                ));
            }
        }

        if let Some(fps) = self.state.lock().frame_rate {
            if fps < self.config.min_frame_rate {
                recommendations.push(format!(
                    "low frame rate ({fps:.1} fps), reduce worker count or waveform quality"
                ));
            }
        }

        recommendations
    }

    /// Forget every recorded sample and the last frame rate.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.operations.clear();
        state.frame_rate = None;
    }
}

/// An in-flight timing started by [`PerformanceMonitor::start_measurement`].
pub struct Measurement<'a> {
    monitor: &'a PerformanceMonitor,
    name: String,
    started: Instant,
    memory_before: usize,
}

impl Measurement<'_> {
    /// Record the elapsed time with `metadata` and return it.
    pub fn end(self, metadata: Metadata) -> Duration {
        let duration = self.started.elapsed();
        let memory_bytes = self.monitor.memory_used();
        self.monitor.record(PerformanceSample {
            operation: self.name,
            duration,
            timestamp_ms: unix_millis(),
            memory_bytes,
            memory_delta: memory_bytes as i64 - self.memory_before as i64,
            metadata,
        });
        duration
    }
}

/// Build a [`Metadata`] map from string pairs.
pub fn metadata<const N: usize>(pairs: [(&str, String); N]) -> Metadata {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn sample(name: &str, ms: u64) -> PerformanceSample {
        PerformanceSample {
            operation: name.into(),
            duration: Duration::from_millis(ms),
            timestamp_ms: 0,
            memory_bytes: 0,
            memory_delta: 0,
            metadata: Metadata::new(),
        }
    }

    #[test]
    fn test_measurement_records_aggregate() {
        let monitor = PerformanceMonitor::new(MonitorConfig::default());
        for _ in 0..3 {
            let m = monitor.start_measurement("op");
            m.end(metadata([("k", "v".to_string())]));
        }
        let summary = monitor.operation("op").unwrap();
        assert_eq!(summary.count, 3);
        assert!(summary.min <= summary.avg && summary.avg <= summary.max);
        assert_eq!(monitor.recent_samples("op")[0].metadata["k"], "v");
    }

    #[test]
    fn test_aggregate_min_max_avg() {
        let monitor = PerformanceMonitor::new(MonitorConfig::default());
        monitor.record(sample("op", 10));
        monitor.record(sample("op", 30));
        let summary = monitor.operation("op").unwrap();
        assert_eq!(summary.min, Duration::from_millis(10));
        assert_eq!(summary.max, Duration::from_millis(30));
        assert_eq!(summary.avg, Duration::from_millis(20));
        assert_eq!(summary.total, Duration::from_millis(40));
    }

    #[test]
    fn test_history_is_bounded() {
        let config = MonitorConfig {
            max_samples_per_operation: 5,
            ..Default::default()
        };
        let monitor = PerformanceMonitor::new(config);
        for i in 0..20 {
            monitor.record(sample("op", i));
        }
        let recent = monitor.recent_samples("op");
        assert_eq!(recent.len(), 5);
        assert_eq!(recent[0].duration, Duration::from_millis(15));
        assert_eq!(monitor.operation("op").unwrap().count, 20);
    }

    #[test]
    fn test_memory_delta_uses_sampler() {
        let used = Arc::new(AtomicUsize::new(100));
        let sampled_used = Arc::clone(&used);
        let monitor =
            PerformanceMonitor::new(MonitorConfig::default()).with_memory_sampler(move || {
                MemorySnapshot {
                    used_bytes: sampled_used.load(Ordering::SeqCst),
                    budget_bytes: 1000,
                }
            });
        let m = monitor.start_measurement("alloc");
        used.store(350, Ordering::SeqCst);
        m.end(Metadata::new());
        let recent = monitor.recent_samples("alloc");
        assert_eq!(recent[0].memory_bytes, 350);
        assert_eq!(recent[0].memory_delta, 250);
    }

    #[test]
    fn test_slow_compute_is_critical() {
        let monitor = PerformanceMonitor::new(MonitorConfig::default());
        monitor.record(sample(COMPUTE_OPERATION, 6_000));
        assert!(matches!(
            monitor.evaluate(),
            PerformanceSignal::Critical { .. }
        ));
    }

    #[test]
    fn test_moderate_latency_is_degraded() {
        let monitor = PerformanceMonitor::new(MonitorConfig::default());
        monitor.record(sample(COMPUTE_OPERATION, 1_500));
        assert!(matches!(
            monitor.evaluate(),
            PerformanceSignal::Degraded { .. }
        ));
    }

    #[test]
    fn test_low_frame_rate_signals() {
        let monitor = PerformanceMonitor::new(MonitorConfig::default());
        monitor.record_frame_rate(60.0);
        assert_eq!(monitor.evaluate(), PerformanceSignal::Healthy);
        monitor.record_frame_rate(24.0);
        assert!(matches!(monitor.evaluate(), PerformanceSignal::Degraded { .. }));
        monitor.record_frame_rate(10.0);
        assert!(matches!(monitor.evaluate(), PerformanceSignal::Critical { .. }));
    }

    #[test]
    fn test_subscribers_receive_signals() {
        let monitor = PerformanceMonitor::new(MonitorConfig::default());
        let mut rx = monitor.subscribe();
        monitor.record_frame_rate(5.0);
        monitor.evaluate();
        assert!(matches!(rx.try_recv(), Ok(PerformanceSignal::Critical { .. })));
    }

    #[test]
    fn test_recommendations_thresholds() {
        let monitor = PerformanceMonitor::new(MonitorConfig::default()).with_memory_sampler(|| {
            MemorySnapshot {
                used_bytes: 95,
                budget_bytes: 100,
            }
        });
        let recs = monitor.memory_optimization_recommendations();
        assert!(recs.iter().any(|r| r.starts_with("critical")));

        let calm = PerformanceMonitor::new(MonitorConfig::default()).with_memory_sampler(|| {
            MemorySnapshot {
                used_bytes: 10,
                budget_bytes: 100,
            }
        });
        assert!(calm.memory_optimization_recommendations().is_empty());
    }

    #[test]
    fn test_metrics_snapshot() {
        let monitor = PerformanceMonitor::new(MonitorConfig::default());
        monitor.record(sample("a", 1));
        monitor.record(sample("b", 2));
        monitor.record_frame_rate(59.9);
        let metrics = monitor.metrics();
        assert_eq!(metrics.operations.len(), 2);
        assert_eq!(metrics.frame_rate, Some(59.9));
        assert!(metrics.memory.is_none());
        monitor.reset();
        assert!(monitor.metrics().operations.is_empty());
    }
}
