//! Bounded worker pool.
//!
//! Tasks are dispatched FIFO to idle worker slots; overflow waits in an
//! unbounded queue. Every submission carries a cancellation token derived
//! from the caller's; the worker sees a child of it plus a timer counted
//! from dispatch. On timeout the caller receives
//! [`SampleDeckError::WorkerTimeout`], the worker token is cancelled, the
//! slot gets a fresh worker thread and the next queued task is dispatched.
//! Replies arriving for a task that is no longer pending are dropped.
//!
//! A caller that cancels its token or drops the submit future abandons the
//! task: a queued task is removed without running, a running one has its
//! worker token cancelled.
//!
//! All bookkeeping lives behind one `parking_lot` mutex that is never held
//! across an `.await`. A router task drains the shared response channel.

use crate::protocol::{GenerationProgress, WorkerConfig, WorkerRequest, WorkerResponse};
use crate::worker::{WaveformCompute, WorkerHandle};
use parking_lot::Mutex;
use sampledeck_core::{PoolConfig, Result, SampleDeckError};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Number of workers for a configured cap: never more than the CPU count,
/// never fewer than one.
pub fn pool_size(max_workers: usize) -> usize {
    num_cpus::get().min(max_workers).max(1)
}

/// Finished tasks remembered for [`WorkerPool::task_status`].
const TASK_HISTORY: usize = 256;

/// Lifecycle of one submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    TimedOut,
    /// Abandoned by its caller.
    Cancelled,
}

impl TaskStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Queued | Self::Running)
    }
}

/// Counters and gauges for the pool.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub workers: usize,
    pub target_workers: usize,
    pub busy: usize,
    pub queued: usize,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    /// Replies dropped because their task had already timed out.
    pub late_replies: u64,
}

type Reply = oneshot::Sender<Result<Vec<f32>>>;

struct Slot {
    worker: WorkerHandle,
    /// Task currently assigned to this slot.
    task: Option<u64>,
}

struct QueuedTask {
    task_id: u64,
    audio_data: Vec<f32>,
    config: WorkerConfig,
    reply: Reply,
    progress: Option<UnboundedSender<GenerationProgress>>,
    /// Cancelled when the caller gives up.
    cancel: CancellationToken,
}

impl QueuedTask {
    fn is_abandoned(&self) -> bool {
        self.cancel.is_cancelled() || self.reply.is_closed()
    }
}

struct PendingTask {
    worker_id: usize,
    reply: Reply,
    progress: Option<UnboundedSender<GenerationProgress>>,
    /// The caller's side, as in [`QueuedTask`].
    cancel: CancellationToken,
    /// Child of `cancel` handed to the worker.
    worker_cancel: CancellationToken,
    /// Stops the timeout timer.
    timer: CancellationToken,
    dispatched_at: Instant,
}

#[derive(Default)]
struct PoolState {
    slots: Vec<Slot>,
    queue: VecDeque<QueuedTask>,
    pending: HashMap<u64, PendingTask>,
    target_size: usize,
    next_worker_id: usize,
    closed: bool,
    submitted: u64,
    completed: u64,
    failed: u64,
    timed_out: u64,
    cancelled: u64,
    late_replies: u64,
    history: VecDeque<(u64, TaskStatus)>,
}

impl PoolState {
    fn finish(&mut self, task_id: u64, status: TaskStatus) {
        match status {
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::TimedOut => self.timed_out += 1,
            TaskStatus::Cancelled => self.cancelled += 1,
            TaskStatus::Queued | TaskStatus::Running => return,
        }
        if self.history.len() == TASK_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back((task_id, status));
    }
}

struct PoolShared {
    state: Mutex<PoolState>,
    compute: Arc<dyn WaveformCompute>,
    responses: UnboundedSender<WorkerResponse>,
    runtime: Handle,
    task_timeout: Duration,
    next_task_id: AtomicU64,
    shutdown: CancellationToken,
}

/// Pool of worker threads running [`WaveformCompute`] jobs.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    /// Start `pool_size(config.max_workers)` workers. Must be called from
    /// within a tokio runtime.
    pub fn new(config: &PoolConfig, compute: Arc<dyn WaveformCompute>) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| {
            SampleDeckError::InvalidInput("worker pool requires a tokio runtime".into())
        })?;
        let (responses, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let size = pool_size(config.max_workers);

        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                target_size: size,
                ..Default::default()
            }),
            compute,
            responses,
            runtime: runtime.clone(),
            task_timeout: config.task_timeout,
            next_task_id: AtomicU64::new(1),
            shutdown: shutdown.clone(),
        });

        {
            let mut state = shared.state.lock();
            shared.ensure_workers(&mut state);
            if state.slots.is_empty() {
                return Err(SampleDeckError::Worker {
                    task_id: 0,
                    message: "no worker thread could be started".into(),
                });
            }
        }

        runtime.spawn(route_responses(Arc::downgrade(&shared), rx, shutdown));
        info!(
            workers = size,
            timeout_ms = config.task_timeout.as_millis() as u64,
            "worker pool started"
        );
        Ok(Self { shared })
    }

    /// Run one task and wait for its output.
    pub async fn submit(&self, audio_data: Vec<f32>, config: WorkerConfig) -> Result<Vec<f32>> {
        self.submit_with_cancel(audio_data, config, None, &CancellationToken::new())
            .await
    }

    /// Like [`submit`](Self::submit), forwarding worker progress to `progress`.
    pub async fn submit_with_progress(
        &self,
        audio_data: Vec<f32>,
        config: WorkerConfig,
        progress: UnboundedSender<GenerationProgress>,
    ) -> Result<Vec<f32>> {
        self.submit_with_cancel(audio_data, config, Some(progress), &CancellationToken::new())
            .await
    }

    /// Run one task until it finishes or `cancel` fires. A cancelled task
    /// fails with [`SampleDeckError::Cancelled`]; if it was still queued it
    /// never reaches a worker.
    pub async fn submit_with_cancel(
        &self,
        audio_data: Vec<f32>,
        config: WorkerConfig,
        progress: Option<UnboundedSender<GenerationProgress>>,
        cancel: &CancellationToken,
    ) -> Result<Vec<f32>> {
        if cancel.is_cancelled() {
            return Err(SampleDeckError::Cancelled);
        }
        let task_id = self.shared.next_task_id.fetch_add(1, Ordering::Relaxed);
        let token = cancel.child_token();
        let (reply, rx) = oneshot::channel();
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(SampleDeckError::PoolShutdown);
            }
            state.submitted += 1;
            state.queue.push_back(QueuedTask {
                task_id,
                audio_data,
                config,
                reply,
                progress,
                cancel: token.clone(),
            });
            trace!(task_id, queued = state.queue.len(), "task queued");
            self.shared.pump(&mut state);
        }

        let mut guard = AbandonOnDrop {
            shared: &self.shared,
            task_id,
            cancel: token.clone(),
            settled: false,
        };
        let outcome = tokio::select! {
            biased;
            outcome = rx => {
                guard.settled = true;
                outcome.unwrap_or(Err(SampleDeckError::PoolShutdown))
            }
            _ = token.cancelled() => Err(SampleDeckError::Cancelled),
        };
        match outcome {
            Err(_) if token.is_cancelled() => Err(SampleDeckError::Cancelled),
            other => other,
        }
    }

    /// Status of a task by id. Finished tasks are remembered for a while.
    pub fn task_status(&self, task_id: u64) -> Option<TaskStatus> {
        let state = self.shared.state.lock();
        if state.pending.contains_key(&task_id) {
            return Some(TaskStatus::Running);
        }
        if state.queue.iter().any(|t| t.task_id == task_id) {
            return Some(TaskStatus::Queued);
        }
        state
            .history
            .iter()
            .rev()
            .find(|(id, _)| *id == task_id)
            .map(|(_, status)| *status)
    }

    /// Running tasks (by id) followed by queued ones in dispatch order.
    pub fn active_tasks(&self) -> Vec<(u64, TaskStatus)> {
        let state = self.shared.state.lock();
        let mut running: Vec<u64> = state.pending.keys().copied().collect();
        running.sort_unstable();
        running
            .into_iter()
            .map(|id| (id, TaskStatus::Running))
            .chain(state.queue.iter().map(|t| (t.task_id, TaskStatus::Queued)))
            .collect()
    }

    /// Change the worker count. Growth is immediate; busy workers beyond
    /// the new size retire when their task ends. Returns the effective size.
    pub fn resize(&self, max_workers: usize) -> usize {
        let target = pool_size(max_workers);
        let mut state = self.shared.state.lock();
        if state.closed || state.target_size == target {
            return state.target_size;
        }
        let previous = state.target_size;
        state.target_size = target;
        while state.slots.len() > target {
            let Some(idx) = state.slots.iter().position(|s| s.task.is_none()) else {
                break;
            };
            state.slots.remove(idx).worker.detach();
        }
        self.shared.pump(&mut state);
        info!(from = previous, to = target, "worker pool resized");
        target
    }

    /// Current configured size.
    pub fn size(&self) -> usize {
        self.shared.state.lock().target_size
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            workers: state.slots.len(),
            target_workers: state.target_size,
            busy: state.slots.iter().filter(|s| s.task.is_some()).count(),
            queued: state.queue.len(),
            submitted: state.submitted,
            completed: state.completed,
            failed: state.failed,
            timed_out: state.timed_out,
            cancelled: state.cancelled,
            late_replies: state.late_replies,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Stop all workers. Pending and queued tasks fail with
    /// [`SampleDeckError::PoolShutdown`].
    pub fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        self.shared.shutdown.cancel();
        for slot in state.slots.drain(..) {
            slot.worker.detach();
        }
        let abandoned = state.pending.len() + state.queue.len();
        let pending: Vec<(u64, PendingTask)> = state.pending.drain().collect();
        for (task_id, pending) in pending {
            pending.worker_cancel.cancel();
            pending.timer.cancel();
            state.finish(task_id, TaskStatus::Failed);
            let _ = pending.reply.send(Err(SampleDeckError::PoolShutdown));
        }
        let queued: Vec<QueuedTask> = state.queue.drain(..).collect();
        for task in queued {
            state.finish(task.task_id, TaskStatus::Failed);
            let _ = task.reply.send(Err(SampleDeckError::PoolShutdown));
        }
        info!(abandoned, "worker pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Abandons a submitted task unless its reply was received.
struct AbandonOnDrop<'a> {
    shared: &'a Arc<PoolShared>,
    task_id: u64,
    cancel: CancellationToken,
    settled: bool,
}

impl Drop for AbandonOnDrop<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.cancel.cancel();
            self.shared.abandon(self.task_id);
        }
    }
}

impl PoolShared {
    /// Spawn workers until the slot count reaches the target size.
    fn ensure_workers(&self, state: &mut PoolState) {
        while state.slots.len() < state.target_size {
            let id = state.next_worker_id;
            state.next_worker_id += 1;
            match WorkerHandle::spawn(id, Arc::clone(&self.compute), self.responses.clone()) {
                Ok(worker) => state.slots.push(Slot { worker, task: None }),
                Err(e) => {
                    error!(worker = id, error = %e, "failed to start worker thread");
                    break;
                }
            }
        }
    }

    /// Dispatch queued tasks to idle slots.
    fn pump(self: &Arc<Self>, state: &mut PoolState) {
        if state.closed {
            return;
        }
        self.ensure_workers(state);
        if state.slots.is_empty() {
            let queued: Vec<QueuedTask> = state.queue.drain(..).collect();
            for task in queued {
                state.finish(task.task_id, TaskStatus::Failed);
                let _ = task.reply.send(Err(SampleDeckError::Worker {
                    task_id: task.task_id,
                    message: "no worker available".into(),
                }));
            }
            return;
        }
        while !state.queue.is_empty() {
            let Some(idx) = state.slots.iter().position(|s| s.task.is_none()) else {
                break;
            };
            let Some(task) = state.queue.pop_front() else {
                break;
            };
            if task.is_abandoned() {
                trace!(task_id = task.task_id, "dropping abandoned task");
                state.finish(task.task_id, TaskStatus::Cancelled);
                continue;
            }
            self.dispatch(state, idx, task);
        }
    }

    /// Forget a task whose caller stopped waiting. Queued tasks are removed;
    /// a running task keeps its slot until the worker replies or times out.
    fn abandon(&self, task_id: u64) {
        let mut state = self.state.lock();
        let Some(pos) = state.queue.iter().position(|t| t.task_id == task_id) else {
            return;
        };
        state.queue.remove(pos);
        state.finish(task_id, TaskStatus::Cancelled);
        debug!(task_id, queued = state.queue.len(), "queued task abandoned");
    }

    fn dispatch(self: &Arc<Self>, state: &mut PoolState, idx: usize, task: QueuedTask) {
        let QueuedTask {
            task_id,
            audio_data,
            config,
            reply,
            progress,
            cancel,
        } = task;
        let worker_cancel = cancel.child_token();
        let request = WorkerRequest::Generate {
            task_id,
            audio_data,
            config,
            cancel: worker_cancel.clone(),
        };

        let sent = match state.slots[idx].worker.send(request) {
            Ok(()) => Ok(()),
            Err(request) => {
                warn!(worker = state.slots[idx].worker.id, "worker thread gone, respawning");
                self.replace_worker(state, idx).and_then(|()| {
                    state.slots[idx]
                        .worker
                        .send(request)
                        .map_err(|_| SampleDeckError::Worker {
                            task_id,
                            message: "worker unavailable".into(),
                        })
                })
            }
        };
        if let Err(e) = sent {
            state.finish(task_id, TaskStatus::Failed);
            let _ = reply.send(Err(e));
            return;
        }

        let worker_id = state.slots[idx].worker.id;
        let timer = CancellationToken::new();
        state.slots[idx].task = Some(task_id);
        state.pending.insert(
            task_id,
            PendingTask {
                worker_id,
                reply,
                progress,
                cancel,
                worker_cancel,
                timer: timer.clone(),
                dispatched_at: Instant::now(),
            },
        );
        debug!(task_id, worker = worker_id, queued = state.queue.len(), "task dispatched");
        self.spawn_timer(task_id, timer);
    }

    fn spawn_timer(self: &Arc<Self>, task_id: u64, timer: CancellationToken) {
        let shared = Arc::downgrade(self);
        let timeout = self.task_timeout;
        self.runtime.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    if let Some(shared) = shared.upgrade() {
                        shared.on_timeout(task_id);
                    }
                }
                _ = timer.cancelled() => {}
            }
        });
    }

    /// Swap the worker in `idx` for a fresh thread, detaching the old one.
    fn replace_worker(&self, state: &mut PoolState, idx: usize) -> Result<()> {
        let id = state.next_worker_id;
        state.next_worker_id += 1;
        let fresh = WorkerHandle::spawn(id, Arc::clone(&self.compute), self.responses.clone())?;
        let old = std::mem::replace(&mut state.slots[idx].worker, fresh);
        debug!(old = old.id, new = id, "worker replaced");
        old.detach();
        state.slots[idx].task = None;
        Ok(())
    }

    /// Free the slot that ran a finished task. Slots above the target size
    /// are retired instead.
    fn release_slot(&self, state: &mut PoolState, worker_id: usize, replace: bool) {
        let Some(idx) = state.slots.iter().position(|s| s.worker.id == worker_id) else {
            return;
        };
        if state.slots.len() > state.target_size {
            let slot = state.slots.remove(idx);
            debug!(worker = slot.worker.id, "retiring worker after resize");
            slot.worker.detach();
            return;
        }
        if replace {
            if let Err(e) = self.replace_worker(state, idx) {
                error!(worker = worker_id, error = %e, "could not replace worker");
                state.slots.remove(idx).worker.detach();
            }
        } else {
            state.slots[idx].task = None;
        }
    }

    fn on_timeout(self: &Arc<Self>, task_id: u64) {
        let mut state = self.state.lock();
        let Some(pending) = state.pending.remove(&task_id) else {
            return;
        };
        pending.worker_cancel.cancel();
        state.finish(task_id, TaskStatus::TimedOut);
        let timeout_ms = self.task_timeout.as_millis() as u64;
        warn!(task_id, worker = pending.worker_id, timeout_ms, "task timed out");
        self.release_slot(&mut state, pending.worker_id, true);
        let _ = pending
            .reply
            .send(Err(SampleDeckError::WorkerTimeout { task_id, timeout_ms }));
        self.pump(&mut state);
    }

    fn handle_response(self: &Arc<Self>, response: WorkerResponse) {
        let mut state = self.state.lock();
        let (task_id, outcome) = match response {
            WorkerResponse::Progress {
                task_id,
                fraction,
                partial,
            } => {
                if let Some(tx) = state.pending.get(&task_id).and_then(|p| p.progress.as_ref()) {
                    let _ = tx.send(GenerationProgress { fraction, partial });
                }
                return;
            }
            WorkerResponse::Complete { task_id, data } => (task_id, Ok(data)),
            WorkerResponse::Error { task_id, error } => (
                task_id,
                Err(SampleDeckError::Worker {
                    task_id,
                    message: error,
                }),
            ),
        };

        let Some(pending) = state.pending.remove(&task_id) else {
            state.late_replies += 1;
            debug!(task_id, "discarding late worker reply");
            return;
        };
        pending.timer.cancel();
        let status = match &outcome {
            Ok(_) => TaskStatus::Completed,
            Err(_) if pending.cancel.is_cancelled() => TaskStatus::Cancelled,
            Err(_) => TaskStatus::Failed,
        };
        state.finish(task_id, status);
        trace!(
            task_id,
            elapsed_ms = pending.dispatched_at.elapsed().as_millis() as u64,
            ok = outcome.is_ok(),
            "task finished"
        );
        self.release_slot(&mut state, pending.worker_id, false);
        let _ = pending.reply.send(outcome);
        self.pump(&mut state);
    }
}

async fn route_responses(
    shared: Weak<PoolShared>,
    mut rx: UnboundedReceiver<WorkerResponse>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            message = rx.recv() => {
                let Some(response) = message else { break };
                let Some(shared) = shared.upgrade() else { break };
                shared.handle_response(response);
            }
        }
    }
    trace!("response router stopped");
}
