//! Volume lock and deferred-task queue.
//!
//! One mutex serializes every engine call; the guard derefs straight to the
//! engine so there is no way to reach it unlocked. Paths that must not
//! sleep on the lock (reclaim, the flush thread) either succeed with
//! `try_lock` or leave their work in a bounded queue. The queue is applied
//! on acquire and again on release, so queued work never waits for a second
//! acquisition that might not come.

use crate::engine::{EngineHandle, FileId, FileSizes, FsEngine};
use crate::file::FileState;
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Queue capacity; past this `defer` refuses and the caller has to block.
pub(crate) const PENDING_LIMIT: usize = 512;

/// Work left behind by lock-averse paths.
pub(crate) enum PendingTask {
    /// Size triple write-back for a file evicted while the lock was busy.
    WriteSizes {
        file: Arc<FileState>,
        sizes: FileSizes,
    },
    /// Final engine close of an evicted file.
    Close { id: FileId, handle: EngineHandle },
}

pub struct VolumeLock<E> {
    engine: E,
    serial: Mutex<()>,
    pending: Mutex<VecDeque<PendingTask>>,
    flush_wanted: AtomicBool,
}

impl<E: FsEngine> VolumeLock<E> {
    pub(crate) fn new(engine: E) -> Self {
        Self {
            engine,
            serial: Mutex::new(()),
            pending: Mutex::new(VecDeque::new()),
            flush_wanted: AtomicBool::new(false),
        }
    }

    /// Blocking acquire. Queued work is applied before the guard is handed
    /// out.
    pub fn lock(&self) -> VolumeGuard<'_, E> {
        let inner = self.serial.lock();
        self.drain();
        VolumeGuard {
            lock: self,
            _inner: inner,
        }
    }

    /// Non-blocking acquire for paths that must never sleep here.
    pub fn try_lock(&self) -> Option<VolumeGuard<'_, E>> {
        let inner = self.serial.try_lock()?;
        self.drain();
        Some(VolumeGuard {
            lock: self,
            _inner: inner,
        })
    }

    /// Queue work for the next lock holder. False means the queue is full
    /// and the caller must block and apply the work itself.
    pub(crate) fn defer(&self, task: PendingTask) -> bool {
        let mut queue = self.pending.lock();
        if queue.len() >= PENDING_LIMIT {
            return false;
        }
        queue.push_back(task);
        true
    }

    /// All-or-nothing `defer` so a multi-step eviction never half-queues.
    pub(crate) fn defer_batch(&self, tasks: Vec<PendingTask>) -> bool {
        let mut queue = self.pending.lock();
        if queue.len() + tasks.len() > PENDING_LIMIT {
            return false;
        }
        queue.extend(tasks);
        true
    }

    /// Ask whoever holds or next takes the lock to begin an engine flush.
    pub(crate) fn request_flush(&self) {
        self.flush_wanted.store(true, Ordering::Release);
    }

    /// Dirtiness probe; the one engine call that is legal without the lock.
    pub(crate) fn engine_dirty(&self) -> bool {
        self.engine.is_dirty()
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Apply queued work. Only runs with `serial` held; the queue mutex is
    /// never held across an engine call.
    fn drain(&self) {
        loop {
            let task = self.pending.lock().pop_front();
            let Some(task) = task else { break };
            match task {
                PendingTask::WriteSizes { file, sizes } => {
                    if let Err(err) = self.engine.update_sizes(file.handle(), sizes) {
                        warn!(file = file.id(), "deferred size write-back failed: {err}");
                        file.set_wb_error(&err);
                    }
                }
                PendingTask::Close { id, handle } => {
                    debug!(file = id, "applying deferred close");
                    if let Err(err) = self.engine.close(handle) {
                        warn!(file = id, "deferred close failed: {err}");
                    }
                }
            }
        }
        if self.flush_wanted.swap(false, Ordering::AcqRel) {
            if let Err(err) = self.engine.flush(false) {
                warn!("deferred volume flush failed: {err}");
            }
        }
    }
}

pub struct VolumeGuard<'a, E: FsEngine> {
    lock: &'a VolumeLock<E>,
    _inner: MutexGuard<'a, ()>,
}

impl<E: FsEngine> Deref for VolumeGuard<'_, E> {
    type Target = E;

    fn deref(&self) -> &E {
        &self.lock.engine
    }
}

impl<E: FsEngine> Drop for VolumeGuard<'_, E> {
    fn drop(&mut self) {
        // Release-side drain: work queued while this guard was held does
        // not wait for the next acquisition.
        self.lock.drain();
    }
}
