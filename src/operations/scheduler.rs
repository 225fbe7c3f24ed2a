//! Serial operation scheduler: a FIFO queue of transfer and archive
//! operations drained one at a time by a background task, with cooperative
//! cancellation and progress fan-out over the event bus.

use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::events::{EventBus, ListenerToken, QueueEvent};
use crate::operations::archive::{ArchiveEngine, ArchiveFormat, AvailableTools};
use crate::operations::operation::{
    Operation, OperationId, OperationPayload, OperationStatus, Outcome, QueueState, QueueStatus,
};
use crate::operations::traverse::{ensure_directories, traverse};
use crate::operations::upload::UploadEngine;
use crate::remote::{ContentSource, EntrySource, ExecChannel, SpawnOptions};

type DrainCallback = Box<dyn FnOnce() + Send>;

/// Queue bookkeeping behind one mutex. The lock is only ever held for short
/// synchronous sections, never across an await point.
struct QueueInner {
    operations: Vec<Operation>,
    /// Cancellation marks, polled by engines at their checkpoints. Cleared
    /// when the queue returns to idle.
    cancelled: HashSet<OperationId>,
    status: QueueStatus,
    /// True while a drain task owns the queue. Guards against spawning a
    /// second drain.
    draining: bool,
    /// Callbacks to flush on the next idle transition.
    drain_callbacks: Vec<DrainCallback>,
}

struct SchedulerInner {
    channel: Arc<dyn ExecChannel>,
    opts: SpawnOptions,
    upload: UploadEngine,
    archive: ArchiveEngine,
    state: Mutex<QueueInner>,
    events: EventBus,
    next_id: AtomicU64,
}

impl SchedulerInner {
    fn lock_state(&self) -> MutexGuard<'_, QueueInner> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn execute(&self, payload: &OperationPayload, ctx: &OpContext) -> Result<Outcome> {
        match payload {
            OperationPayload::Upload { source, dest_path } => {
                self.upload.upload(source, dest_path, ctx).await
            }
            OperationPayload::Compress {
                paths,
                format,
                output_path,
                parent_dir,
            } => {
                self.archive
                    .compress(paths, *format, output_path, parent_dir, ctx)
                    .await
            }
            OperationPayload::Extract {
                archive_path,
                dest_dir,
            } => self.archive.extract(archive_path, dest_dir, ctx).await,
        }
    }
}

/// Progress and cancellation handle passed into an engine for the duration of
/// one operation.
pub(crate) struct OpContext {
    inner: Arc<SchedulerInner>,
    id: OperationId,
}

impl OpContext {
    /// Whether a cancellation mark exists for this operation. Engines poll
    /// this at their checkpoints.
    pub fn is_cancelled(&self) -> bool {
        self.inner.lock_state().cancelled.contains(&self.id)
    }

    /// Record the estimated total unit count (archive item estimation runs
    /// after enqueue).
    pub fn set_total_units(&self, total: u64) {
        self.update(|op| op.total_units = total);
    }

    /// Byte-exact upload progress: `processed` is the absolute offset written
    /// so far.
    pub fn advance_bytes(&self, processed: u64) {
        self.update(|op| {
            op.processed_units = processed;
            let pct = if op.total_units == 0 {
                100
            } else {
                (processed.saturating_mul(100) / op.total_units).min(100) as u8
            };
            op.progress = op.progress.max(pct);
        });
    }

    /// Estimated archive progress. Capped at 99 because the item count is a
    /// guess; only a confirmed exit may report 100.
    pub fn advance_items(&self, processed: u64) {
        self.update(|op| {
            op.processed_units = processed;
            let pct = if op.total_units == 0 {
                0
            } else {
                (processed.saturating_mul(100) / op.total_units).min(99) as u8
            };
            op.progress = op.progress.max(pct);
        });
    }

    /// Snap to the full unit count after the archiver exited successfully.
    pub fn finish_items(&self) {
        self.update(|op| {
            op.processed_units = op.total_units;
            op.progress = 100;
        });
    }

    fn update(&self, f: impl FnOnce(&mut Operation)) {
        {
            let mut q = self.inner.lock_state();
            if let Some(op) = q.operations.iter_mut().find(|op| op.id == self.id) {
                f(op);
            }
        }
        self.inner.events.emit(QueueEvent::StateChanged);
    }
}

/// Handle to a serial operation queue. Cloning is cheap and every clone
/// addresses the same queue.
///
/// Operations run strictly one at a time, in enqueue order. Enqueueing while
/// the queue is active appends to the current drain; enqueueing while idle
/// starts a new one.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Scheduler over `channel`, requesting elevation for spawned commands
    /// when the channel can provide it.
    pub fn new(channel: Arc<dyn ExecChannel>) -> Self {
        Self::with_options(channel, SpawnOptions { superuser: true })
    }

    pub fn with_options(channel: Arc<dyn ExecChannel>, opts: SpawnOptions) -> Self {
        let inner = Arc::new(SchedulerInner {
            upload: UploadEngine::new(Arc::clone(&channel), opts),
            archive: ArchiveEngine::new(Arc::clone(&channel), opts),
            channel,
            opts,
            state: Mutex::new(QueueInner {
                operations: Vec::new(),
                cancelled: HashSet::new(),
                status: QueueStatus::Idle,
                draining: false,
                drain_callbacks: Vec::new(),
            }),
            events: EventBus::new(),
            next_id: AtomicU64::new(1),
        });
        Self { inner }
    }

    /// Queue a single file upload. Progress is reported in exact bytes.
    pub fn enqueue_upload(
        &self,
        source: Arc<dyn ContentSource>,
        dest_path: impl Into<String>,
    ) -> OperationId {
        let dest_path = dest_path.into();
        let display_name = dest_path
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or(dest_path.as_str())
            .to_string();
        let total = source.len();
        self.push(display_name, total, OperationPayload::Upload { source, dest_path })
    }

    /// Expand a directory and queue one upload per contained file, after
    /// materializing the remote directory skeleton.
    ///
    /// Traversal and directory creation happen before anything is enqueued;
    /// an error here queues nothing.
    pub async fn enqueue_directory(
        &self,
        root: Box<dyn EntrySource>,
        root_name: &str,
        target_path: &str,
    ) -> Result<Vec<OperationId>> {
        let files = traverse(root, root_name).await?;
        let paths: Vec<String> = files.iter().map(|f| f.relative_path.clone()).collect();
        ensure_directories(&*self.inner.channel, &self.inner.opts, &paths, target_path).await?;

        info!(root = %root_name, files = files.len(), "queueing directory upload");
        let ids = files
            .into_iter()
            .map(|f| self.enqueue_upload(f.source, format!("{target_path}/{}", f.relative_path)))
            .collect();
        Ok(ids)
    }

    /// Queue creation of an archive at `output_path` from `paths`, which must
    /// all live directly under `parent_dir`.
    pub fn enqueue_compress(
        &self,
        paths: Vec<String>,
        format: ArchiveFormat,
        output_path: impl Into<String>,
        parent_dir: impl Into<String>,
    ) -> OperationId {
        let output_path = output_path.into();
        let display_name = output_path
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or(output_path.as_str())
            .to_string();
        self.push(
            display_name,
            0,
            OperationPayload::Compress {
                paths,
                format,
                output_path,
                parent_dir: parent_dir.into(),
            },
        )
    }

    /// Queue extraction of `archive_path` into `dest_dir`. The format is
    /// derived from the archive's file name when the operation runs.
    pub fn enqueue_extract(
        &self,
        archive_path: impl Into<String>,
        dest_dir: impl Into<String>,
    ) -> OperationId {
        let archive_path = archive_path.into();
        let display_name = archive_path
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or(archive_path.as_str())
            .to_string();
        self.push(
            display_name,
            0,
            OperationPayload::Extract {
                archive_path,
                dest_dir: dest_dir.into(),
            },
        )
    }

    /// Cancel one operation.
    ///
    /// A pending operation becomes `Cancelled` right here; a running one is
    /// marked and stops at the engine's next checkpoint. Either way the final
    /// status is `Cancelled`, never `Error`. Terminal operations are
    /// unaffected.
    pub fn cancel(&self, id: OperationId) {
        let flipped = {
            let mut guard = self.inner.lock_state();
            let q = &mut *guard;
            match q.operations.iter_mut().find(|op| op.id == id) {
                Some(op) if op.status == OperationStatus::Pending => {
                    debug!(%id, "cancelled while pending");
                    op.status = OperationStatus::Cancelled;
                    true
                }
                Some(op) if op.status == OperationStatus::Running => {
                    debug!(%id, "cancellation requested");
                    q.cancelled.insert(id);
                    false
                }
                _ => return,
            }
        };
        if flipped {
            self.inner.events.emit(QueueEvent::OperationDone);
            self.inner.events.emit(QueueEvent::StateChanged);
        }
    }

    /// Cancel every non-terminal operation: pending ones become `Cancelled`
    /// immediately, the running one is marked.
    pub fn cancel_all(&self) {
        let flipped = {
            let mut guard = self.inner.lock_state();
            let q = &mut *guard;
            let mut flipped = 0usize;
            for op in q.operations.iter_mut() {
                match op.status {
                    OperationStatus::Pending => {
                        op.status = OperationStatus::Cancelled;
                        flipped += 1;
                    }
                    OperationStatus::Running => {
                        q.cancelled.insert(op.id);
                    }
                    _ => {}
                }
            }
            if flipped > 0 || !q.cancelled.is_empty() {
                info!(count = flipped, "cancelling all queued operations");
            }
            flipped
        };
        for _ in 0..flipped {
            self.inner.events.emit(QueueEvent::OperationDone);
        }
        if flipped > 0 {
            self.inner.events.emit(QueueEvent::StateChanged);
        }
    }

    /// Drop every terminal operation from the queue, keeping pending and
    /// running ones in order.
    pub fn clear_completed(&self) {
        {
            let mut q = self.inner.lock_state();
            q.operations.retain(|op| !op.status.is_terminal());
        }
        self.inner.events.emit(QueueEvent::StateChanged);
    }

    /// Re-queue a failed or cancelled operation as a fresh pending entry with
    /// a new identifier. Returns `None` for unknown ids and for operations
    /// that did not fail.
    pub fn retry(&self, id: OperationId) -> Option<OperationId> {
        let (display_name, total, payload) = {
            let q = self.inner.lock_state();
            let op = q.operations.iter().find(|op| op.id == id)?;
            if !matches!(op.status, OperationStatus::Error | OperationStatus::Cancelled) {
                return None;
            }
            let total = match &op.payload {
                OperationPayload::Upload { source, .. } => source.len(),
                _ => 0,
            };
            (op.display_name.clone(), total, op.payload.clone())
        };
        info!(%id, "retrying operation");
        Some(self.push(display_name, total, payload))
    }

    /// Snapshot of the whole queue.
    pub fn state(&self) -> QueueState {
        let q = self.inner.lock_state();
        QueueState {
            operations: q.operations.iter().map(Operation::snapshot).collect(),
            status: q.status,
        }
    }

    /// Subscribe to a queue event. See [`QueueEvent`] for the catalogue.
    pub fn on(&self, event: QueueEvent, listener: impl Fn() + Send + Sync + 'static) -> ListenerToken {
        self.inner.events.on(event, listener)
    }

    /// Remove a listener registered with [`Scheduler::on`].
    pub fn off(&self, event: QueueEvent, token: ListenerToken) {
        self.inner.events.off(event, token)
    }

    /// Run `callback` when the queue next becomes idle. If it already is,
    /// the callback runs synchronously before this returns.
    pub fn on_drain_complete(&self, callback: impl FnOnce() + Send + 'static) {
        let run_now = {
            let mut q = self.inner.lock_state();
            if q.draining {
                q.drain_callbacks.push(Box::new(callback));
                return;
            }
            true
        };
        if run_now {
            callback();
        }
    }

    /// Wait until the queue is idle. Resolves immediately when nothing is
    /// queued.
    pub async fn drained(&self) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.on_drain_complete(move || {
            let _ = tx.send(());
        });
        let _ = rx.await;
    }

    /// Probe the remote side for archive tools (cached after the first call).
    pub async fn available_tools(&self) -> AvailableTools {
        self.inner.archive.detect_tools().await
    }

    /// Archive formats compression can target, given the available tools.
    pub async fn compress_formats(&self) -> Vec<ArchiveFormat> {
        self.inner.archive.compress_formats().await
    }

    /// Whether `filename` looks extractable with the available tools.
    pub async fn can_extract(&self, filename: &str) -> bool {
        self.inner.archive.can_extract(filename).await
    }

    /// Append a pending operation and start a drain if none is running.
    fn push(&self, display_name: String, total_units: u64, payload: OperationPayload) -> OperationId {
        let id = OperationId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let kick = {
            let mut q = self.inner.lock_state();
            q.operations.push(Operation {
                id,
                display_name,
                status: OperationStatus::Pending,
                progress: 0,
                total_units,
                processed_units: 0,
                error: None,
                payload,
            });
            if q.draining {
                false
            } else {
                // Claim the drain under the same lock so a concurrent
                // enqueue cannot spawn a second one.
                q.draining = true;
                q.status = QueueStatus::Active;
                true
            }
        };
        self.inner.events.emit(QueueEvent::StateChanged);

        if kick {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(drain(inner));
        }
        id
    }
}

/// What the drain loop found when it looked at the queue.
enum Next {
    /// A pending operation to run.
    Run(OperationId, OperationPayload),
    /// Nothing pending; the queue went idle and these callbacks fire.
    Idle(Vec<DrainCallback>),
}

/// Background drain: repeatedly runs the first pending operation until none
/// remain. Exactly one drain task exists while `draining` is set, so at most
/// one operation is ever running. Cancelled-while-pending operations never
/// reach this loop; `cancel` retires them in place.
async fn drain(inner: Arc<SchedulerInner>) {
    loop {
        let next = {
            let mut q = inner.lock_state();
            match q.operations.iter_mut().find(|op| op.status == OperationStatus::Pending) {
                Some(op) => {
                    op.status = OperationStatus::Running;
                    Next::Run(op.id, op.payload.clone())
                }
                None => {
                    // Idle transition happens under the same lock as the
                    // emptiness check; an enqueue either lands before it (and
                    // is found above) or sees `draining == false` and starts
                    // a fresh drain.
                    q.draining = false;
                    q.status = QueueStatus::Idle;
                    q.cancelled.clear();
                    Next::Idle(std::mem::take(&mut q.drain_callbacks))
                }
            }
        };

        match next {
            Next::Run(id, payload) => {
                inner.events.emit(QueueEvent::StateChanged);

                let ctx = OpContext {
                    inner: Arc::clone(&inner),
                    id,
                };
                let result = inner.execute(&payload, &ctx).await;
                classify(&inner, id, result);

                inner.events.emit(QueueEvent::OperationDone);
                inner.events.emit(QueueEvent::StateChanged);
            }
            Next::Idle(callbacks) => {
                debug!("queue drained");
                inner.events.emit(QueueEvent::StateChanged);
                inner.events.emit(QueueEvent::DrainComplete);
                for cb in callbacks {
                    if catch_unwind(AssertUnwindSafe(cb)).is_err() {
                        error!("drain callback panicked");
                    }
                }
                return;
            }
        }
    }
}

/// Record an operation's terminal state. A cancellation mark observed here
/// overrides both success and failure: a marked operation is `Cancelled` even
/// if the engine finished or errored before reaching a checkpoint.
fn classify(inner: &SchedulerInner, id: OperationId, result: Result<Outcome>) {
    let mut q = inner.lock_state();
    let marked = q.cancelled.contains(&id);
    let Some(op) = q.operations.iter_mut().find(|op| op.id == id) else {
        return;
    };

    match result {
        Ok(Outcome::Cancelled) => {
            info!(%id, name = %op.display_name, "operation cancelled");
            op.status = OperationStatus::Cancelled;
        }
        Ok(Outcome::Completed) if marked => {
            info!(%id, name = %op.display_name, "operation cancelled at completion");
            op.status = OperationStatus::Cancelled;
        }
        Ok(Outcome::Completed) => {
            info!(%id, name = %op.display_name, "operation done");
            op.status = OperationStatus::Done;
            op.processed_units = op.total_units;
            op.progress = 100;
        }
        Err(_) if marked => {
            info!(%id, name = %op.display_name, "operation cancelled during failure");
            op.status = OperationStatus::Cancelled;
        }
        Err(e) => {
            warn!(%id, name = %op.display_name, error = %e, "operation failed");
            op.status = OperationStatus::Error;
            op.error = Some(e.to_string());
        }
    }
}
