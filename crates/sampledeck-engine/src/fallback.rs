//! Cooperative in-task generation.
//!
//! Used when the pool is disabled or a timed-out task is retried. The input
//! is processed one chunk at a time on the calling task, yielding to the
//! runtime after every chunk so other tasks keep running.

use crate::protocol::{GenerationProgress, WorkerConfig};
use sampledeck_audio::{normalize, ChunkedDownsampler};
use sampledeck_core::{Result, SampleDeckError};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Downsample `samples` per `config`, suspending once per chunk.
pub async fn generate_cooperative(
    samples: &[f32],
    config: &WorkerConfig,
    cancel: &CancellationToken,
    progress: Option<&UnboundedSender<GenerationProgress>>,
) -> Result<Vec<f32>> {
    if config.target_samples == 0 {
        return Err(SampleDeckError::InvalidInput(
            "target sample count must be at least 1".into(),
        ));
    }

    let mut downsampler = ChunkedDownsampler::new(
        samples,
        config.target_samples,
        config.method,
        config.progress_chunk,
    );
    let mut chunks = 0usize;
    while let Some(step) = downsampler.step() {
        chunks += 1;
        if let Some(tx) = progress {
            let _ = tx.send(GenerationProgress {
                fraction: step.fraction,
                partial: downsampler.partial().to_vec(),
            });
        }
        if cancel.is_cancelled() {
            return Err(SampleDeckError::Cancelled);
        }
        tokio::task::yield_now().await;
    }

    let mut output = downsampler.finish();
    if config.normalize {
        normalize(&mut output);
    }
    debug!(chunks, len = output.len(), "cooperative generation finished");
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sampledeck_audio::downsample;
    use sampledeck_core::DownsampleMethod;
    use tokio::sync::mpsc;

    fn config(target: usize, chunk: usize) -> WorkerConfig {
        WorkerConfig {
            target_samples: target,
            method: DownsampleMethod::Rms,
            normalize: false,
            progress_chunk: chunk,
            report_progress: true,
        }
    }

    #[tokio::test]
    async fn test_matches_whole_buffer_when_single_chunk() {
        let samples: Vec<f32> = (0..4410).map(|i| (i as f32 * 0.01).sin()).collect();
        let out = generate_cooperative(
            &samples,
            &config(40, samples.len()),
            &CancellationToken::new(),
            None,
        )
        .await
        .unwrap();
        assert_eq!(out, downsample(&samples, 40, DownsampleMethod::Rms));
    }

    #[tokio::test]
    async fn test_reports_progress_per_chunk() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let out = generate_cooperative(
            &[0.3; 1000],
            &config(10, 250),
            &CancellationToken::new(),
            Some(&tx),
        )
        .await
        .unwrap();
        assert_eq!(out.len(), 10);

        let mut fractions = Vec::new();
        while let Ok(update) = rx.try_recv() {
            fractions.push(update.fraction);
        }
        assert_eq!(fractions, vec![0.25, 0.5, 0.75, 1.0]);
    }

    #[tokio::test]
    async fn test_cancelled_between_chunks() {
        let token = CancellationToken::new();
        token.cancel();
        let err = generate_cooperative(&[0.3; 1000], &config(10, 100), &token, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SampleDeckError::Cancelled));
    }

    #[tokio::test]
    async fn test_other_tasks_progress_while_generating() {
        let ticks = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = ticks.clone();
        let ticker = tokio::spawn(async move {
            loop {
                counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                tokio::task::yield_now().await;
            }
        });

        generate_cooperative(
            &vec![0.1; 64 * 50],
            &config(50, 64),
            &CancellationToken::new(),
            None,
        )
        .await
        .unwrap();
        ticker.abort();
        assert!(ticks.load(std::sync::atomic::Ordering::Relaxed) > 0);
    }

    #[tokio::test]
    async fn test_normalizes_output() {
        let samples: Vec<f32> = (0..100).map(|i| i as f32 / 100.0).collect();
        let cfg = WorkerConfig {
            normalize: true,
            method: DownsampleMethod::Peak,
            ..config(4, 25)
        };
        let out = generate_cooperative(&samples, &cfg, &CancellationToken::new(), None)
            .await
            .unwrap();
        assert!((out[3] - 1.0).abs() < 1e-6);
    }
}
