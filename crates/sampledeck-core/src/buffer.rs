//! Decoded audio buffers handed to the engine by its collaborators.

use crate::error::{Result, SampleDeckError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Bytes per stored sample (`f32`).
pub const BYTES_PER_SAMPLE: usize = 4;

/// Planar decoded audio: one `Vec<f32>` per channel, all the same length.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    channels: Vec<Vec<f32>>,
    sample_rate: u32,
}

/// Arc-wrapped audio buffer for shared ownership.
pub type SharedAudioBuffer = Arc<AudioBuffer>;

impl AudioBuffer {
    /// Create a buffer from planar channel data.
    ///
    /// Fails when there are no channels, the channels differ in length, or the
    /// sample rate is zero.
    pub fn new(channels: Vec<Vec<f32>>, sample_rate: u32) -> Result<Self> {
        if channels.is_empty() {
            return Err(SampleDeckError::InvalidInput(
                "audio buffer has no channels".into(),
            ));
        }
        if sample_rate == 0 {
            return Err(SampleDeckError::InvalidInput(
                "audio buffer sample rate is zero".into(),
            ));
        }
        let len = channels[0].len();
        if let Some(idx) = channels.iter().position(|c| c.len() != len) {
            return Err(SampleDeckError::InvalidInput(format!(
                "channel {idx} has {} samples, expected {len}",
                channels[idx].len()
            )));
        }
        Ok(Self {
            channels,
            sample_rate,
        })
    }

    /// Convenience constructor for a single channel.
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Result<Self> {
        Self::new(vec![samples], sample_rate)
    }

    /// Number of channels.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Samples per channel.
    pub fn len(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Duration in seconds.
    pub fn duration(&self) -> f64 {
        self.len() as f64 / self.sample_rate as f64
    }

    /// Samples of one channel, if the index is in range.
    pub fn channel(&self, index: usize) -> Option<&[f32]> {
        self.channels.get(index).map(Vec::as_slice)
    }

    /// Memory footprint as tracked by the memory manager:
    /// `channels x samples x 4`.
    pub fn byte_size(&self) -> usize {
        self.channel_count() * self.len() * BYTES_PER_SAMPLE
    }
}

/// Shape of a source, used for cache fingerprints and result metadata.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SourceShape {
    /// Duration in seconds.
    pub duration: f64,
    pub sample_rate: u32,
    pub channels: usize,
}

impl From<&AudioBuffer> for SourceShape {
    fn from(buffer: &AudioBuffer) -> Self {
        Self {
            duration: buffer.duration(),
            sample_rate: buffer.sample_rate(),
            channels: buffer.channel_count(),
        }
    }
}
