//! Integration tests for the memory manager.

use sampledeck_core::{AudioBuffer, MemoryConfig, SampleDeckError, SharedAudioBuffer};
use sampledeck_engine::{BufferPriority, MemoryManager, RegisterOptions};
use std::sync::Arc;

/// Mono buffer occupying exactly `bytes` tracked bytes (a multiple of 4).
fn buffer_of(bytes: usize) -> SharedAudioBuffer {
    Arc::new(AudioBuffer::mono(vec![0.0; bytes / 4], 1000).unwrap())
}

fn options(priority: BufferPriority) -> RegisterOptions {
    RegisterOptions {
        priority,
        ..Default::default()
    }
}

#[test]
fn low_priority_buffer_evicted_before_high_priority_admitted() {
    let mut memory = MemoryManager::new(MemoryConfig {
        max_memory_usage: 400,
        cleanup_threshold: 0.8,
        ..Default::default()
    });
    memory
        .register_buffer("a", buffer_of(300), options(BufferPriority::Low))
        .unwrap();
    let evicted = memory
        .register_buffer("b", buffer_of(148), options(BufferPriority::High))
        .unwrap();

    assert_eq!(evicted, vec!["a".to_string()]);
    assert!(!memory.contains("a"));
    assert!(memory.contains("b"));
    assert_eq!(memory.buffer_count(), 1);
    assert_eq!(memory.total_bytes(), 148);
}

#[test]
fn tracked_total_matches_sum_of_sizes() {
    let mut memory = MemoryManager::new(MemoryConfig::default());
    let shapes = [(1usize, 100usize), (2, 250), (6, 17)];
    let mut expected = 0;
    for (i, (channels, len)) in shapes.into_iter().enumerate() {
        let buffer =
            Arc::new(AudioBuffer::new(vec![vec![0.1; len]; channels], 48_000).unwrap());
        expected += channels * len * 4;
        memory
            .register_buffer(format!("buf-{i}"), buffer, RegisterOptions::default())
            .unwrap();
    }
    assert_eq!(memory.total_bytes(), expected);
    memory.unregister_buffer("buf-1");
    assert_eq!(memory.total_bytes(), expected - 2 * 250 * 4);
}

#[test]
fn persistent_buffers_survive_pressure() {
    let mut memory = MemoryManager::new(MemoryConfig {
        max_memory_usage: 1000,
        ..Default::default()
    });
    memory
        .register_buffer(
            "pinned",
            buffer_of(600),
            RegisterOptions {
                persistent: true,
                priority: BufferPriority::Low,
                ..Default::default()
            },
        )
        .unwrap();

    let err = memory
        .register_buffer("big", buffer_of(500), options(BufferPriority::High))
        .unwrap_err();
    assert!(matches!(err, SampleDeckError::MemoryPressure { .. }));
    assert!(memory.contains("pinned"));

    // Nothing is evictable, so this lands above the cleanup threshold.
    memory
        .register_buffer("small", buffer_of(300), options(BufferPriority::High))
        .unwrap();
    assert_eq!(memory.bytes_over_threshold(), 100);
    let evicted = memory.emergency_cleanup(usize::MAX);
    assert_eq!(evicted, vec!["small".to_string()]);
    assert!(memory.contains("pinned"));
}

#[test]
fn registrations_evict_in_keep_rank_order() {
    let mut memory = MemoryManager::new(MemoryConfig {
        max_memory_usage: 1000,
        cleanup_threshold: 0.8,
        ..Default::default()
    });
    for (id, priority) in [
        ("high", BufferPriority::High),
        ("low", BufferPriority::Low),
        ("medium", BufferPriority::Medium),
    ] {
        memory
            .register_buffer(id, buffer_of(250), options(priority))
            .unwrap();
    }
    assert_eq!(memory.eviction_order(), vec!["low", "medium", "high"]);

    let first = memory
        .register_buffer("new-1", buffer_of(250), options(BufferPriority::High))
        .unwrap();
    let second = memory
        .register_buffer("new-2", buffer_of(250), options(BufferPriority::High))
        .unwrap();
    assert_eq!(first, vec!["low".to_string()]);
    assert_eq!(second, vec!["medium".to_string()]);
    assert!(memory.contains("high"));
}
