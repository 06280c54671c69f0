//! Durable waveform storage.
//!
//! The cache treats persistence as an opaque key/value store. Two backends
//! ship with the engine:
//!
//! ```text
//! MemoryStore   in-process map, for tests and hosts without a disk
//! FileStore     one JSON file per key under a directory
//!   cache_dir/
//!     wf_10-000000_44100_1_400_0_1.json
//! ```

use parking_lot::Mutex;
use sampledeck_core::{unix_millis, Result, WaveformMetadata, WaveformResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Serialized form of a waveform result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredWaveform {
    pub samples: Vec<f32>,
    pub sample_rate: f64,
    pub duration: f64,
    pub channels: usize,
    /// Absent in blobs written by older hosts.
    #[serde(default)]
    pub metadata: Option<WaveformMetadata>,
}

impl From<&WaveformResult> for StoredWaveform {
    fn from(result: &WaveformResult) -> Self {
        Self {
            samples: result.samples.clone(),
            sample_rate: result.sample_rate,
            duration: result.duration,
            channels: result.channels,
            metadata: Some(result.metadata.clone()),
        }
    }
}

/// Opaque key/value persistence used as the cache's second tier.
pub trait DurableStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<StoredWaveform>>;
    fn put(&self, key: &str, value: &StoredWaveform) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

/// In-process store backed by a map.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, StoredWaveform>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl DurableStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<StoredWaveform>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn put(&self, key: &str, value: &StoredWaveform) -> Result<()> {
        self.entries.lock().insert(key.to_string(), value.clone());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.entries.lock().clear();
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct FileEnvelope {
    key: String,
    stored_at_ms: u64,
    value: StoredWaveform,
}

/// Directory of JSON files, one per key.
pub struct FileStore {
    dir: PathBuf,
    /// Entries older than this are treated as absent and removed on read.
    ttl: Option<Duration>,
    /// Oldest files are removed after a write that exceeds this count.
    max_entries: Option<usize>,
}

impl FileStore {
    /// Create a store rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ttl: None,
            max_entries: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Ensure the store directory exists.
    pub fn ensure_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    /// File path for a key. Fingerprints only contain digits, `:` and `.`,
    /// which map to `_` and `-`.
    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| match c {
                ':' => '_',
                '.' => '-',
                c if c.is_ascii_alphanumeric() || c == '-' || c == '_' => c,
                _ => '_',
            })
            .collect();
        self.dir.join(format!("{name}.json"))
    }

    fn json_files(&self) -> Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                files.push(path);
            }
        }
        Ok(files)
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> Result<usize> {
        Ok(self.json_files()?.len())
    }

    fn enforce_max_entries(&self) -> Result<()> {
        let Some(max) = self.max_entries else {
            return Ok(());
        };
        let mut files = self.json_files()?;
        if files.len() <= max {
            return Ok(());
        }
        files.sort_by_key(|path| {
            std::fs::metadata(path)
                .and_then(|m| m.modified())
                .ok()
        });
        let excess = files.len() - max;
        for path in files.into_iter().take(excess) {
            debug!(path = %path.display(), "removing oldest stored waveform");
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }
}

impl DurableStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<StoredWaveform>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }

        let json = std::fs::read_to_string(&path)?;
        let envelope: FileEnvelope = match serde_json::from_str(&json) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "discarding unreadable stored waveform");
                std::fs::remove_file(&path)?;
                return Ok(None);
            }
        };

        if envelope.key != key {
            return Ok(None);
        }

        if let Some(ttl) = self.ttl {
            let age = unix_millis().saturating_sub(envelope.stored_at_ms);
            if age > ttl.as_millis() as u64 {
                debug!(key, age_ms = age, "stored waveform expired");
                std::fs::remove_file(&path)?;
                return Ok(None);
            }
        }

        Ok(Some(envelope.value))
    }

    fn put(&self, key: &str, value: &StoredWaveform) -> Result<()> {
        self.ensure_dir()?;
        let envelope = FileEnvelope {
            key: key.to_string(),
            stored_at_ms: unix_millis(),
            value: value.clone(),
        };
        let json = serde_json::to_string(&envelope)?;
        std::fs::write(self.path_for(key), json)?;
        self.enforce_max_entries()
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        for path in self.json_files()? {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }
}
