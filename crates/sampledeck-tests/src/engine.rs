//! End-to-end tests through the `WaveformEngine` facade.

use sampledeck_core::{
    AudioBuffer, EngineConfig, GenerateOptions, MemoryConfig, QualityLevel, SampleDeckError,
};
use sampledeck_engine::{
    AudioSource, BufferPriority, FileStore, PerformanceSignal, RegisterOptions, WaveformEngine,
    COMPUTE_OPERATION,
};
use std::sync::{Arc, Mutex};

fn sine(seconds: f64, rate: u32) -> Vec<f32> {
    let n = (seconds * rate as f64) as usize;
    (0..n)
        .map(|i| (i as f32 * 220.0 * std::f32::consts::TAU / rate as f32).sin())
        .collect()
}

fn compute_count(engine: &WaveformEngine) -> u64 {
    engine
        .performance_metrics()
        .operations
        .get(COMPUTE_OPERATION)
        .map_or(0, |op| op.count)
}

#[tokio::test]
async fn ten_second_mono_source_yields_400_samples() {
    let engine = WaveformEngine::new(EngineConfig::default());
    engine.start().unwrap();

    let result = engine
        .generate(
            AudioSource::Raw {
                samples: sine(10.0, 44_100),
                sample_rate: 44_100,
            },
            GenerateOptions::with_target(400),
        )
        .await
        .unwrap();

    assert_eq!(result.samples.len(), 400);
    assert!((result.duration - 10.0).abs() < 1e-9);
    assert!((result.sample_rate - 40.0).abs() < 1e-9);
    assert_eq!(result.channels, 1);
    let max = result.samples.iter().cloned().fold(0.0f32, f32::max);
    assert!((max - 1.0).abs() < 1e-6, "normalized peak {max}");
    engine.shutdown();
}

#[tokio::test]
async fn identical_requests_compute_once() {
    let engine = WaveformEngine::new(EngineConfig::default());
    engine.start().unwrap();
    let buffer = Arc::new(AudioBuffer::mono(sine(2.0, 22_050), 22_050).unwrap());
    engine
        .register_buffer("loop", buffer, RegisterOptions::default())
        .unwrap();

    for _ in 0..2 {
        engine
            .generate(
                AudioSource::Registered("loop".into()),
                GenerateOptions::with_target(256),
            )
            .await
            .unwrap();
    }
    assert_eq!(compute_count(&engine), 1);
    let stats = engine.cache_stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
}

#[tokio::test]
async fn same_shape_sources_share_a_cache_entry() {
    let engine = WaveformEngine::new(EngineConfig::default());
    let loud = AudioSource::Raw {
        samples: vec![0.9; 1000],
        sample_rate: 100,
    };
    let quiet = AudioSource::Raw {
        samples: vec![0.1; 1000],
        sample_rate: 100,
    };
    let options = GenerateOptions {
        normalize: false,
        ..GenerateOptions::with_target(10)
    };
    let first = engine.generate(loud, options.clone()).await.unwrap();
    let second = engine.generate(quiet, options).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(compute_count(&engine), 1);
}

#[tokio::test]
async fn file_store_serves_a_fresh_engine() {
    let tmp = tempfile::tempdir().expect("failed to create tempdir");
    let source = || AudioSource::Raw {
        samples: sine(1.0, 8_000),
        sample_rate: 8_000,
    };

    let writer = WaveformEngine::new(EngineConfig::default())
        .with_store(Arc::new(FileStore::new(tmp.path())));
    let written = writer
        .generate(source(), GenerateOptions::with_target(64))
        .await
        .unwrap();
    drop(writer);

    let reader = WaveformEngine::new(EngineConfig::default())
        .with_store(Arc::new(FileStore::new(tmp.path())));
    let read = reader
        .generate(source(), GenerateOptions::with_target(64))
        .await
        .unwrap();

    assert_eq!(read.samples, written.samples);
    assert_eq!(compute_count(&reader), 0);
    assert_eq!(reader.cache_stats().durable_hits, 1);
}

#[tokio::test]
async fn low_frame_rate_lowers_quality_and_output_resolution() {
    let engine = WaveformEngine::new(EngineConfig::default());
    let mut signals = engine.subscribe_signals();

    let signal = engine.report_frame_rate(10.0);
    assert!(matches!(signal, PerformanceSignal::Critical { .. }));
    assert!(matches!(
        signals.recv().await.unwrap(),
        PerformanceSignal::Critical { .. }
    ));
    assert_eq!(engine.quality_level(), QualityLevel::Low);

    let result = engine
        .generate(
            AudioSource::Raw {
                samples: vec![0.5; 10_000],
                sample_rate: 1_000,
            },
            GenerateOptions::with_target(5_000),
        )
        .await
        .unwrap();
    // Low caps output at 2048 values and reduces by peak.
    assert_eq!(result.samples.len(), 2048);
    assert_eq!(result.metadata.quality, QualityLevel::Low);

    // The slow frame rate is still on record when the request finishes.
    assert_eq!(engine.quality_level(), QualityLevel::Minimal);

    let healthy = engine.report_frame_rate(60.0);
    assert_eq!(healthy, PerformanceSignal::Healthy);
    assert_eq!(engine.quality_level(), QualityLevel::Low);
}

#[tokio::test]
async fn evictions_notify_cleanup_callbacks() {
    let config = EngineConfig {
        memory: MemoryConfig {
            max_memory_usage: 400,
            cleanup_threshold: 0.8,
            ..Default::default()
        },
        ..Default::default()
    };
    let engine = WaveformEngine::new(config);
    let released = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&released);
    engine.add_cleanup_callback(move |id, meta| {
        log.lock().unwrap().push((id.to_string(), meta.size));
    });

    let a = Arc::new(AudioBuffer::mono(vec![0.0; 75], 100).unwrap());
    let b = Arc::new(AudioBuffer::mono(vec![0.0; 37], 100).unwrap());
    engine
        .register_buffer(
            "a",
            a,
            RegisterOptions {
                priority: BufferPriority::Low,
                ..Default::default()
            },
        )
        .unwrap();
    let evicted = engine
        .register_buffer(
            "b",
            b,
            RegisterOptions {
                priority: BufferPriority::High,
                ..Default::default()
            },
        )
        .unwrap();

    assert_eq!(evicted, vec!["a".to_string()]);
    assert_eq!(*released.lock().unwrap(), vec![("a".to_string(), 300)]);
    assert!(engine.get_buffer("b").is_some());

    let oversized = Arc::new(AudioBuffer::mono(vec![0.0; 200], 100).unwrap());
    let err = engine
        .register_buffer("huge", oversized, RegisterOptions::default())
        .unwrap_err();
    assert!(matches!(err, SampleDeckError::MemoryPressure { .. }));
    assert!(engine.get_buffer("b").is_some());
}
