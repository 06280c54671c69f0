//! Waveform computation for audio visualization.
//!
//! Reduces a channel of N samples to M amplitude values. Output bucket `i`
//! covers input samples `floor(i * N / M)..floor((i + 1) * N / M)`, so bucket
//! widths differ by at most one sample when N is not a multiple of M.

use sampledeck_core::DownsampleMethod;

/// Input range `[start, end)` covered by output bucket `index`.
///
/// When there are more buckets than samples the proportional range can be
/// empty; such buckets repeat the sample at `start`.
pub fn block_bounds(index: usize, input_len: usize, output_len: usize) -> (usize, usize) {
    let start = proportional(index, input_len, output_len);
    let end = proportional(index + 1, input_len, output_len);
    let start = start.min(input_len.saturating_sub(1));
    (start, end.max(start + 1).min(input_len))
}

fn proportional(index: usize, input_len: usize, output_len: usize) -> usize {
    (index as u64 * input_len as u64 / output_len as u64) as usize
}

/// Reduce one block of samples to a single amplitude.
pub fn block_amplitude(block: &[f32], method: DownsampleMethod) -> f32 {
    if block.is_empty() {
        return 0.0;
    }
    match method {
        DownsampleMethod::Rms => {
            let sum: f64 = block.iter().map(|&s| (s as f64) * (s as f64)).sum();
            (sum / block.len() as f64).sqrt() as f32
        }
        DownsampleMethod::Peak => block.iter().fold(0.0f32, |acc, &s| acc.max(s.abs())),
    }
}

/// Downsample a whole channel in one pass.
///
/// Always returns exactly `target` values. An empty input yields silence.
pub fn downsample(samples: &[f32], target: usize, method: DownsampleMethod) -> Vec<f32> {
    if samples.is_empty() {
        return vec![0.0; target];
    }

    (0..target)
        .map(|i| {
            let (start, end) = block_bounds(i, samples.len(), target);
            block_amplitude(&samples[start..end], method)
        })
        .collect()
}

/// Largest absolute value in `values`.
pub fn peak_amplitude(values: &[f32]) -> f32 {
    values.iter().fold(0.0f32, |acc, &v| acc.max(v.abs()))
}

/// Scale `values` so the largest magnitude becomes 1.0.
///
/// An all-zero slice is left untouched.
pub fn normalize(values: &mut [f32]) {
    let peak = peak_amplitude(values);
    if peak == 0.0 {
        return;
    }
    for v in values.iter_mut() {
        *v /= peak;
    }
}
