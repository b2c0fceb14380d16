//! Outstanding-request tracking for batched write-back.
//!
//! Devices may finish submitted writes from any context in any order; the
//! batch is complete only once every completion has been settled. The first
//! error wins and is what `wait` reports.

use crate::error::{Result, VolError};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use tracing::warn;

struct BatchState {
    outstanding: usize,
    first_err: Option<VolError>,
}

struct BatchInner {
    state: Mutex<BatchState>,
    done: Condvar,
}

pub struct WritebackBatch {
    inner: Arc<BatchInner>,
}

impl Default for WritebackBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl WritebackBatch {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BatchInner {
                state: Mutex::new(BatchState {
                    outstanding: 0,
                    first_err: None,
                }),
                done: Condvar::new(),
            }),
        }
    }

    /// Ticket for one submission; every ticket must be finished (or dropped,
    /// which counts as an I/O failure) before `wait` returns.
    pub fn completion(&self) -> Completion {
        self.inner.state.lock().outstanding += 1;
        Completion {
            inner: Some(Arc::clone(&self.inner)),
        }
    }

    /// Block until every submission settled; first error wins.
    pub fn wait(&self) -> Result<()> {
        let mut st = self.inner.state.lock();
        while st.outstanding > 0 {
            self.inner.done.wait(&mut st);
        }
        match st.first_err.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

pub struct Completion {
    inner: Option<Arc<BatchInner>>,
}

impl Completion {
    pub fn finish(mut self, result: Result<()>) {
        if let Some(inner) = self.inner.take() {
            settle(&inner, result);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            warn!("write completion dropped without a result");
            settle(&inner, Err(VolError::IoError));
        }
    }
}

fn settle(inner: &BatchInner, result: Result<()>) {
    let mut st = inner.state.lock();
    st.outstanding -= 1;
    if let Err(err) = result {
        if st.first_err.is_none() {
            st.first_err = Some(err);
        }
    }
    if st.outstanding == 0 {
        inner.done.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn empty_batch_completes_immediately() {
        let batch = WritebackBatch::new();
        batch.wait().unwrap();
    }

    #[test]
    fn first_error_wins() {
        let batch = WritebackBatch::new();
        let a = batch.completion();
        let b = batch.completion();
        let c = batch.completion();
        a.finish(Ok(()));
        b.finish(Err(VolError::NoSpace));
        c.finish(Err(VolError::IoError));
        assert_eq!(batch.wait(), Err(VolError::NoSpace));
    }

    #[test]
    fn dropped_completion_counts_as_io_error() {
        let batch = WritebackBatch::new();
        drop(batch.completion());
        assert_eq!(batch.wait(), Err(VolError::IoError));
    }

    #[test]
    fn wait_blocks_until_every_thread_settles() {
        let batch = WritebackBatch::new();
        for i in 0..8 {
            let done = batch.completion();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(5 * (8 - i)));
                done.finish(Ok(()));
            });
        }
        batch.wait().unwrap();
        // All settled: a second wait sees nothing outstanding.
        batch.wait().unwrap();
    }
}
