//! Chunked waveform computation with progress reporting.
//!
//! The input is consumed in fixed-size chunks. Each chunk owns the output
//! buckets `floor(chunk_start * M / N)..floor(chunk_end * M / N)` and splits
//! its own samples across them proportionally. Bucket edges therefore snap
//! to chunk edges, and the result can differ slightly from [`downsample`]
//! over the whole buffer when a chunk boundary falls inside a bucket.
//!
//! [`downsample`]: crate::waveform::downsample

use crate::waveform::block_amplitude;
use sampledeck_core::DownsampleMethod;

/// Progress after one chunk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkProgress {
    /// Fraction of the input consumed (0.0 to 1.0).
    pub fraction: f32,
    /// Length of the valid output prefix.
    pub valid_len: usize,
}

/// Incremental downsampler. Call [`step`](Self::step) until it returns `None`.
pub struct ChunkedDownsampler<'a> {
    samples: &'a [f32],
    method: DownsampleMethod,
    chunk_size: usize,
    output: Vec<f32>,
    /// Input samples consumed so far.
    position: usize,
    /// Output values written so far.
    written: usize,
}

impl<'a> ChunkedDownsampler<'a> {
    /// Prepare a downsampler writing `target` values. A `chunk_size` of 0 is
    /// treated as 1.
    pub fn new(
        samples: &'a [f32],
        target: usize,
        method: DownsampleMethod,
        chunk_size: usize,
    ) -> Self {
        // Empty input has nothing to process; the zeroed output is final.
        let written = if samples.is_empty() { target } else { 0 };
        Self {
            samples,
            method,
            chunk_size: chunk_size.max(1),
            output: vec![0.0; target],
            position: 0,
            written,
        }
    }

    /// Whether every chunk has been processed.
    pub fn is_finished(&self) -> bool {
        self.position >= self.samples.len()
    }

    /// Fraction of the input consumed.
    pub fn fraction(&self) -> f32 {
        if self.samples.is_empty() {
            return 1.0;
        }
        self.position as f32 / self.samples.len() as f32
    }

    /// The output values computed so far.
    pub fn partial(&self) -> &[f32] {
        &self.output[..self.written]
    }

    /// Process the next chunk. Returns `None` once the input is exhausted.
    pub fn step(&mut self) -> Option<ChunkProgress> {
        if self.is_finished() {
            return None;
        }

        let n = self.samples.len();
        let m = self.output.len();
        let chunk_start = self.position;
        let chunk_end = (chunk_start + self.chunk_size).min(n);

        let out_start = self.written;
        let out_end = if chunk_end == n {
            m
        } else {
            (chunk_end as u64 * m as u64 / n as u64) as usize
        };

        let chunk = &self.samples[chunk_start..chunk_end];
        let buckets = out_end.saturating_sub(out_start);
        for j in 0..buckets {
            let start = (j as u64 * chunk.len() as u64 / buckets as u64) as usize;
            let end = ((j + 1) as u64 * chunk.len() as u64 / buckets as u64) as usize;
            let start = start.min(chunk.len() - 1);
            let end = end.max(start + 1).min(chunk.len());
            self.output[out_start + j] = block_amplitude(&chunk[start..end], self.method);
        }

        self.position = chunk_end;
        self.written = out_end.max(out_start);

        Some(ChunkProgress {
            fraction: self.fraction(),
            valid_len: self.written,
        })
    }

    /// Take the output. Buckets not yet reached are zero.
    pub fn finish(self) -> Vec<f32> {
        self.output
    }

    /// Run to completion on the current thread.
    ///
    /// `on_progress` sees each step and the valid output prefix. Returns
    /// `None` if `should_stop` becomes true between chunks.
    pub fn run(
        mut self,
        mut on_progress: impl FnMut(ChunkProgress, &[f32]),
        should_stop: impl Fn() -> bool,
    ) -> Option<Vec<f32>> {
        while let Some(progress) = self.step() {
            on_progress(progress, self.partial());
            if should_stop() {
                tracing::debug!(
                    fraction = progress.fraction,
                    "chunked downsampling stopped early"
                );
                return None;
            }
        }
        Some(self.finish())
    }
}
