//! Integration tests for the worker pool.

use sampledeck_core::{DownsampleMethod, PoolConfig, Result, SampleDeckError};
use sampledeck_engine::{pool_size, WaveformCompute, WorkerConfig, WorkerPool};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn worker_config() -> WorkerConfig {
    WorkerConfig {
        target_samples: 4,
        method: DownsampleMethod::Peak,
        normalize: false,
        progress_chunk: 1024,
        report_progress: false,
    }
}

/// Returns the first input sample, tracking how many calls overlap.
#[derive(Default)]
struct Overlap {
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl WaveformCompute for Overlap {
    fn compute(
        &self,
        audio: &[f32],
        config: &WorkerConfig,
        _cancel: &CancellationToken,
        _on_progress: &mut dyn FnMut(f32, &[f32]),
    ) -> Result<Vec<f32>> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(vec![audio[0]; config.target_samples])
    }
}

/// Never replies to a request whose first sample is negative, even after
/// cancellation.
struct Silent;

impl WaveformCompute for Silent {
    fn compute(
        &self,
        audio: &[f32],
        config: &WorkerConfig,
        _cancel: &CancellationToken,
        _on_progress: &mut dyn FnMut(f32, &[f32]),
    ) -> Result<Vec<f32>> {
        if audio[0] < 0.0 {
            loop {
                std::thread::sleep(Duration::from_secs(3600));
            }
        }
        Ok(vec![audio[0]; config.target_samples])
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pool_of_two_runs_two_tasks_at_a_time() {
    let compute = Arc::new(Overlap::default());
    let config = PoolConfig {
        max_workers: 2,
        ..Default::default()
    };
    let pool = WorkerPool::new(&config, compute.clone()).unwrap();

    let results = tokio::join!(
        pool.submit(vec![1.0], worker_config()),
        pool.submit(vec![2.0], worker_config()),
        pool.submit(vec![3.0], worker_config()),
        pool.submit(vec![4.0], worker_config()),
    );
    let outputs = [results.0, results.1, results.2, results.3];
    for (i, output) in outputs.into_iter().enumerate() {
        assert_eq!(output.unwrap(), vec![(i + 1) as f32; 4]);
    }

    // Exactly two at once on any machine with two or more CPUs.
    let peak = compute.peak.load(Ordering::SeqCst);
    assert_eq!(peak, pool_size(2), "{peak} tasks overlapped");
    let stats = pool.stats();
    assert_eq!(stats.submitted, 4);
    assert_eq!(stats.completed, 4);
    assert_eq!(stats.queued, 0);
    assert_eq!(stats.workers, pool_size(2));
}

#[tokio::test]
async fn silent_worker_times_out_and_slot_is_reused() {
    let config = PoolConfig {
        max_workers: 1,
        task_timeout: Duration::from_millis(100),
        ..Default::default()
    };
    let pool = WorkerPool::new(&config, Arc::new(Silent)).unwrap();

    let started = std::time::Instant::now();
    let (stuck, queued) = tokio::join!(
        pool.submit(vec![-1.0], worker_config()),
        pool.submit(vec![0.5], worker_config()),
    );

    match stuck {
        Err(SampleDeckError::WorkerTimeout { timeout_ms, .. }) => assert_eq!(timeout_ms, 100),
        other => panic!("expected timeout, got {other:?}"),
    }
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(queued.unwrap(), vec![0.5; 4]);

    let stats = pool.stats();
    assert_eq!(stats.timed_out, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.workers, 1);
    assert_eq!(stats.busy, 0);
}

#[tokio::test]
async fn shutdown_fails_waiting_tasks() {
    let config = PoolConfig {
        max_workers: 1,
        task_timeout: Duration::from_secs(60),
        ..Default::default()
    };
    let pool = Arc::new(WorkerPool::new(&config, Arc::new(Silent)).unwrap());

    let waiting = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.submit(vec![-1.0], worker_config()).await })
    };
    while pool.stats().busy == 0 {
        tokio::task::yield_now().await;
    }
    pool.shutdown();
    let err = waiting.await.unwrap().unwrap_err();
    assert!(matches!(err, SampleDeckError::PoolShutdown));
}
