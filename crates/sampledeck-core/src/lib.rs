//! SampleDeck Core - Foundation types for the waveform engine
//!
//! This crate provides the types shared by every SampleDeck crate:
//! - Decoded audio buffers and their tracked memory size
//! - Waveform requests, results and cache fingerprints
//! - Engine configuration with documented defaults
//! - The common error type

pub mod buffer;
pub mod config;
pub mod error;
pub mod waveform;

pub use buffer::{AudioBuffer, SharedAudioBuffer, SourceShape, BYTES_PER_SAMPLE};
pub use config::{
    memory_budget, CacheConfig, EngineConfig, MemoryConfig, MonitorConfig, PoolConfig,
    QualityConfig,
};
pub use error::{Result, SampleDeckError};
pub use waveform::{
    fingerprint, unix_millis, DownsampleMethod, GenerateOptions, QualityLevel, WaveformMetadata,
    WaveformResult,
};
