//! Messages exchanged between the pool and its worker threads.
//!
//! ```text
//! pool ──Generate{task_id, audio_data, config}──▶ worker
//! pool ◀──Progress{task_id, ..}* ── Complete | Error ── worker
//! ```
//!
//! Requests travel over a per-worker crossbeam channel; every worker shares
//! one response channel back to the pool's router. Responses carry the task
//! id so the router can match them to the waiting caller.

use sampledeck_core::DownsampleMethod;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Parameters a worker needs to reduce one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub target_samples: usize,
    pub method: DownsampleMethod,
    pub normalize: bool,
    /// Input samples per progress step.
    pub progress_chunk: usize,
    /// Send `Progress` messages carrying the partial output.
    pub report_progress: bool,
}

/// Request sent to a worker thread.
#[derive(Debug)]
pub enum WorkerRequest {
    Generate {
        task_id: u64,
        audio_data: Vec<f32>,
        config: WorkerConfig,
        /// Cancelled when the task times out or the pool shuts down.
        cancel: CancellationToken,
    },
}

/// Reply from a worker thread. A task gets zero or more `Progress`
/// messages followed by exactly one `Complete` or `Error`.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerResponse {
    Progress {
        task_id: u64,
        fraction: f32,
        partial: Vec<f32>,
    },
    Complete {
        task_id: u64,
        data: Vec<f32>,
    },
    Error {
        task_id: u64,
        error: String,
    },
}

impl WorkerResponse {
    pub fn task_id(&self) -> u64 {
        match self {
            Self::Progress { task_id, .. }
            | Self::Complete { task_id, .. }
            | Self::Error { task_id, .. } => *task_id,
        }
    }

    /// Whether this message ends the task.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress { .. })
    }
}

/// Progress update delivered to callers of `generate_with_progress`.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationProgress {
    /// Fraction of the input consumed (0.0 to 1.0).
    pub fraction: f32,
    /// Output values computed so far, not yet normalized.
    pub partial: Vec<f32>,
}
