//! Worker threads.
//!
//! Each worker is a named OS thread that owns nothing but its request
//! receiver and a clone of the shared response sender. Sample data is moved
//! into the request, so workers never touch controller state.

use crate::protocol::{WorkerConfig, WorkerRequest, WorkerResponse};
use crossbeam_channel::{Receiver, Sender};
use sampledeck_audio::{normalize, ChunkedDownsampler};
use sampledeck_core::{Result, SampleDeckError};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

/// The computation a worker runs for each request.
pub trait WaveformCompute: Send + Sync {
    /// Reduce `audio` to `config.target_samples` values.
    ///
    /// Implementations should check `cancel` regularly and may report
    /// `(fraction, partial_output)` through `on_progress`.
    fn compute(
        &self,
        audio: &[f32],
        config: &WorkerConfig,
        cancel: &CancellationToken,
        on_progress: &mut dyn FnMut(f32, &[f32]),
    ) -> Result<Vec<f32>>;
}

/// Chunked RMS/peak downsampling, normalized when requested.
#[derive(Debug, Default, Clone, Copy)]
pub struct DownsampleCompute;

impl WaveformCompute for DownsampleCompute {
    fn compute(
        &self,
        audio: &[f32],
        config: &WorkerConfig,
        cancel: &CancellationToken,
        on_progress: &mut dyn FnMut(f32, &[f32]),
    ) -> Result<Vec<f32>> {
        if config.target_samples == 0 {
            return Err(SampleDeckError::InvalidInput(
                "target sample count must be at least 1".into(),
            ));
        }
        let downsampler = ChunkedDownsampler::new(
            audio,
            config.target_samples,
            config.method,
            config.progress_chunk,
        );
        let mut output = downsampler
            .run(
                |progress, partial| on_progress(progress.fraction, partial),
                || cancel.is_cancelled(),
            )
            .ok_or(SampleDeckError::Cancelled)?;
        if config.normalize {
            normalize(&mut output);
        }
        Ok(output)
    }
}

/// Handle to a running worker thread.
pub(crate) struct WorkerHandle {
    pub id: usize,
    requests: Sender<WorkerRequest>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Spawn worker `id`. Replies go to `responses`.
    pub fn spawn(
        id: usize,
        compute: Arc<dyn WaveformCompute>,
        responses: UnboundedSender<WorkerResponse>,
    ) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded::<WorkerRequest>();
        let thread = thread::Builder::new()
            .name(format!("sampledeck-worker-{id}"))
            .spawn(move || worker_loop(id, rx, compute, responses))?;
        debug!(worker = id, "worker thread started");
        Ok(Self {
            id,
            requests: tx,
            thread: Some(thread),
        })
    }

    /// Hand a request to the thread. Fails only if the thread has exited.
    pub fn send(&self, request: WorkerRequest) -> std::result::Result<(), WorkerRequest> {
        self.requests.send(request).map_err(|e| e.into_inner())
    }

    /// Drop the request channel without waiting. The thread exits once its
    /// current request, if any, returns.
    pub fn detach(mut self) {
        self.thread.take();
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        // Joining is only safe for threads that are idle; callers that may
        // own a stuck worker use `detach` instead.
        if let Some(thread) = self.thread.take() {
            let (closed, _) = crossbeam_channel::bounded(0);
            let _ = std::mem::replace(&mut self.requests, closed);
            if thread.join().is_err() {
                error!(worker = self.id, "worker thread panicked");
            }
        }
    }
}

fn worker_loop(
    id: usize,
    requests: Receiver<WorkerRequest>,
    compute: Arc<dyn WaveformCompute>,
    responses: UnboundedSender<WorkerResponse>,
) {
    while let Ok(request) = requests.recv() {
        let WorkerRequest::Generate {
            task_id,
            audio_data,
            config,
            cancel,
        } = request;

        if cancel.is_cancelled() {
            trace!(worker = id, task_id, "skipping cancelled task");
            let skipped = WorkerResponse::Error {
                task_id,
                error: SampleDeckError::Cancelled.to_string(),
            };
            if responses.send(skipped).is_err() {
                break;
            }
            continue;
        }

        let progress_tx = responses.clone();
        let report = config.report_progress;
        let mut on_progress = |fraction: f32, partial: &[f32]| {
            if report {
                let _ = progress_tx.send(WorkerResponse::Progress {
                    task_id,
                    fraction,
                    partial: partial.to_vec(),
                });
            }
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            compute.compute(&audio_data, &config, &cancel, &mut on_progress)
        }));

        let response = match outcome {
            Ok(Ok(data)) => WorkerResponse::Complete { task_id, data },
            Ok(Err(e)) => WorkerResponse::Error {
                task_id,
                error: e.to_string(),
            },
            Err(_) => {
                error!(worker = id, task_id, "waveform computation panicked");
                WorkerResponse::Error {
                    task_id,
                    error: "worker panicked".into(),
                }
            }
        };

        if responses.send(response).is_err() {
            break;
        }
    }
    debug!(worker = id, "worker thread exiting");
}
