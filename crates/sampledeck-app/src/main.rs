//! SampleDeck - waveform engine demo
//!
//! Synthesizes a short stereo loop, registers it with the engine and asks
//! for waveforms at several resolutions, cold and warm, then prints the
//! engine's statistics.
//!
//! Usage: `sampledeck [config.json] [cache-dir]`

use anyhow::{Context, Result};
use sampledeck_core::{AudioBuffer, EngineConfig, GenerateOptions};
use sampledeck_engine::{
    AudioSource, BufferPriority, FileStore, GenerationProgress, RegisterOptions, WaveformEngine,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;

const SAMPLE_RATE: u32 = 44_100;
const LOOP_SECONDS: f64 = 10.0;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("SampleDeck starting...");

    let mut args = std::env::args().skip(1);
    let config = match args.next().map(PathBuf::from) {
        Some(path) => EngineConfig::from_json_file(&path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let cache_dir = args.next().map(PathBuf::from);

    let mut engine = WaveformEngine::new(config);
    if let Some(dir) = cache_dir {
        info!(dir = %dir.display(), "using file-backed waveform cache");
        let store = FileStore::new(dir).with_ttl(Duration::from_secs(24 * 60 * 60));
        store.ensure_dir()?;
        engine = engine.with_store(Arc::new(store));
    }
    engine.start()?;

    engine.add_cleanup_callback(|id, meta| {
        info!(buffer = %id, bytes = meta.size, "buffer released");
    });

    let buffer = Arc::new(synth_loop(LOOP_SECONDS, SAMPLE_RATE)?);
    let id = uuid::Uuid::new_v4().to_string();
    engine.register_buffer(
        id.clone(),
        Arc::clone(&buffer),
        RegisterOptions {
            priority: BufferPriority::High,
            tags: vec!["demo".into(), "loop".into()],
            source: Some("synthesized".into()),
            ..Default::default()
        },
    )?;

    for target in [400, 1000, 4000] {
        for pass in ["cold", "warm"] {
            let started = Instant::now();
            let waveform = engine
                .generate(
                    AudioSource::Registered(id.clone()),
                    GenerateOptions::with_target(target),
                )
                .await?;
            println!(
                "{pass:>4} {target:>5} -> {:>5} samples, {:.1} Hz, quality {}, {:?}",
                waveform.samples.len(),
                waveform.sample_rate,
                waveform.metadata.quality.name(),
                started.elapsed()
            );
        }
    }

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<GenerationProgress>();
    let printer = tokio::spawn(async move {
        while let Some(update) = rx.recv().await {
            println!(
                "progress {:>5.1}% ({} values ready)",
                update.fraction * 100.0,
                update.partial.len()
            );
        }
    });
    let right = buffer.channel(1).map(<[f32]>::to_vec).unwrap_or_default();
    engine
        .generate_with_progress(
            AudioSource::Raw {
                samples: right,
                sample_rate: SAMPLE_RATE,
            },
            GenerateOptions::with_target(800),
            tx,
        )
        .await?;
    printer.await?;

    let signal = engine.report_frame_rate(58.0);
    println!("signal after frame-rate report: {signal:?}");

    println!(
        "metrics: {}",
        serde_json::to_string_pretty(&engine.performance_metrics())?
    );
    println!("memory: {}", serde_json::to_string_pretty(&engine.memory_stats())?);
    println!("cache: {}", serde_json::to_string_pretty(&engine.cache_stats())?);
    if let Some(pool) = engine.pool_stats() {
        println!("pool: {}", serde_json::to_string_pretty(&pool)?);
    }
    for recommendation in engine.memory_optimization_recommendations() {
        println!("recommendation: {recommendation}");
    }

    engine.unregister_buffer(&id);
    engine.shutdown();
    Ok(())
}

/// Stereo loop: a decaying 110 Hz kick every half second on the left, a
/// detuned 220 Hz pad on the right.
fn synth_loop(seconds: f64, sample_rate: u32) -> sampledeck_core::Result<AudioBuffer> {
    let n = (seconds * sample_rate as f64) as usize;
    let rate = sample_rate as f32;
    let beat = (sample_rate / 2) as usize;
    let left = (0..n)
        .map(|i| {
            let t = (i % beat) as f32 / rate;
            (t * 110.0 * std::f32::consts::TAU).sin() * (-t * 8.0).exp()
        })
        .collect();
    let right = (0..n)
        .map(|i| {
            let t = i as f32 / rate;
            0.3 * (t * 220.0 * std::f32::consts::TAU).sin()
                + 0.2 * (t * 221.5 * std::f32::consts::TAU).sin()
        })
        .collect();
    AudioBuffer::new(vec![left, right], sample_rate)
}
