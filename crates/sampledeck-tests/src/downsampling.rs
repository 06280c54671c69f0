//! Integration tests for the downsampling algorithm.

use sampledeck_audio::{downsample, normalize, ChunkedDownsampler};
use sampledeck_core::DownsampleMethod;

fn sine(n: usize, freq: f32, rate: f32) -> Vec<f32> {
    (0..n)
        .map(|i| (i as f32 * freq * std::f32::consts::TAU / rate).sin())
        .collect()
}

#[test]
fn ten_seconds_at_44100_to_400_values() {
    let samples = sine(441_000, 440.0, 44_100.0);
    for method in [DownsampleMethod::Rms, DownsampleMethod::Peak] {
        let out = downsample(&samples, 400, method);
        assert_eq!(out.len(), 400);
        assert!(out.iter().all(|v| v.is_finite() && *v >= 0.0));
    }
}

#[test]
fn rms_of_full_scale_sine_is_about_0_707() {
    let samples = sine(44_100, 441.0, 44_100.0);
    let out = downsample(&samples, 10, DownsampleMethod::Rms);
    for v in out {
        assert!((v - std::f32::consts::FRAC_1_SQRT_2).abs() < 0.01, "rms {v}");
    }
}

#[test]
fn peak_never_below_rms() {
    let samples = sine(10_000, 37.0, 1_000.0);
    let rms = downsample(&samples, 50, DownsampleMethod::Rms);
    let peak = downsample(&samples, 50, DownsampleMethod::Peak);
    for (r, p) in rms.iter().zip(&peak) {
        assert!(p + 1e-6 >= *r);
    }
}

#[test]
fn normalizing_silence_keeps_zeros() {
    let mut out = downsample(&vec![0.0; 1000], 20, DownsampleMethod::Rms);
    normalize(&mut out);
    assert_eq!(out, vec![0.0; 20]);
}

#[test]
fn chunked_output_stays_close_to_whole_buffer() {
    let samples = sine(44_100, 1.0, 44_100.0);
    let whole = downsample(&samples, 400, DownsampleMethod::Peak);
    let chunked = ChunkedDownsampler::new(&samples, 400, DownsampleMethod::Peak, 4096)
        .run(|_, _| {}, || false)
        .unwrap();
    assert_eq!(chunked.len(), whole.len());
    // Slow sine: neighbouring buckets differ little, so boundary drift is small.
    for (a, b) in whole.iter().zip(&chunked) {
        assert!((a - b).abs() < 0.05);
    }
}
