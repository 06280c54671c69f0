//! Waveform request options, results and cache fingerprints.

use crate::buffer::SourceShape;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Per-block statistic used when reducing samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DownsampleMethod {
    /// Root mean square of each block. Smoother, more expensive.
    Rms,
    /// Largest absolute sample of each block.
    Peak,
}

/// Discrete quality levels, best first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum QualityLevel {
    #[default]
    High,
    Medium,
    Low,
    Minimal,
}

impl QualityLevel {
    /// All levels ordered from best to cheapest.
    pub const ALL: [QualityLevel; 4] = [Self::High, Self::Medium, Self::Low, Self::Minimal];

    /// Statistic used at this level.
    pub fn method(&self) -> DownsampleMethod {
        match self {
            Self::High | Self::Medium => DownsampleMethod::Rms,
            Self::Low | Self::Minimal => DownsampleMethod::Peak,
        }
    }

    /// Position in [`QualityLevel::ALL`].
    pub fn index(&self) -> usize {
        match self {
            Self::High => 0,
            Self::Medium => 1,
            Self::Low => 2,
            Self::Minimal => 3,
        }
    }

    /// Level `steps` below this one, saturating at the cheapest.
    pub fn lower(&self, steps: usize) -> Self {
        let idx = (self.index() + steps).min(Self::ALL.len() - 1);
        Self::ALL[idx]
    }

    /// Level one step better, saturating at the best.
    pub fn higher(&self) -> Self {
        Self::ALL[self.index().saturating_sub(1)]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Minimal => "minimal",
        }
    }
}

/// Options for a single waveform request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerateOptions {
    /// Number of output amplitude values.
    pub target_samples: usize,
    /// Source channel to reduce.
    pub channel: usize,
    /// Explicit quality; `None` uses the engine's current adaptive level.
    pub quality: Option<QualityLevel>,
    /// Divide the output by its maximum absolute value.
    pub normalize: bool,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            target_samples: 1000,
            channel: 0,
            quality: None,
            normalize: true,
        }
    }
}

impl GenerateOptions {
    pub fn with_target(target_samples: usize) -> Self {
        Self {
            target_samples,
            ..Default::default()
        }
    }
}

/// Deterministic cache fingerprint for a request.
///
/// Derived from the source shape and request options only, never from the
/// sample data, so sources with identical shape share a key.
pub fn fingerprint(shape: &SourceShape, options: &GenerateOptions) -> String {
    format!(
        "wf:{:.6}:{}:{}:{}:{}:{}",
        shape.duration,
        shape.sample_rate,
        shape.channels,
        options.target_samples,
        options.channel,
        u8::from(options.normalize)
    )
}

/// Descriptive data attached to a generated waveform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveformMetadata {
    pub method: DownsampleMethod,
    pub quality: QualityLevel,
    /// Unix timestamp in milliseconds.
    pub generated_at_ms: u64,
    /// Free-form description of the source (buffer id, "raw", ...).
    pub source: String,
    /// Computed on the calling task rather than a worker thread.
    pub cooperative: bool,
}

/// A downsampled waveform. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveformResult {
    /// Amplitude values, one per output bucket.
    pub samples: Vec<f32>,
    /// Nominal rate of the output (`samples.len() / duration`).
    pub sample_rate: f64,
    /// Source duration in seconds.
    pub duration: f64,
    /// Channel count of the source.
    pub channels: usize,
    pub metadata: WaveformMetadata,
}

impl WaveformResult {
    /// Estimated in-memory footprint in bytes.
    pub fn size_estimate(&self) -> usize {
        self.samples.len() * std::mem::size_of::<f32>()
            + self.metadata.source.len()
            + std::mem::size_of::<Self>()
    }
}

/// Current Unix time in milliseconds.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
