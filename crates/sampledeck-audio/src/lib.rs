//! SampleDeck Audio - Waveform downsampling
//!
//! Converts raw channel samples into compact amplitude envelopes for display.
//!
//! Architecture:
//! - `waveform`: whole-buffer RMS/peak reduction and normalization
//! - `progressive`: chunked reduction that reports progress between chunks

pub mod progressive;
pub mod waveform;

pub use progressive::{ChunkProgress, ChunkedDownsampler};
pub use waveform::{block_amplitude, block_bounds, downsample, normalize, peak_amplitude};
