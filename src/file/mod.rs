//! Per-open-file state.
//!
//! `FileState` owns everything the crate tracks for one file: the engine
//! handle, the immutable attribute bits, the size triple, the extent cache,
//! the sticky write-back error and the open count. Entries live in the
//! volume's registry and are shared out as `Arc<FileState>`.

use crate::engine::{EngineHandle, FileAttr, FileId, FileSizes};
use crate::error::VolError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::error;

pub(crate) mod extent;
pub(crate) mod sizes;

use extent::ExtentCache;
use sizes::SizeTracker;

pub struct FileState {
    id: FileId,
    handle: EngineHandle,
    sparse: bool,
    compressed: bool,
    encrypted: bool,
    pub(crate) sizes: SizeTracker,
    pub(crate) extents: ExtentCache,
    /// First Corruption/IoError seen on a write-back path; reported by the
    /// next fsync, then cleared.
    wb_error: Mutex<Option<VolError>>,
    sizes_dirty: AtomicBool,
    opens: AtomicU32,
}

impl FileState {
    pub(crate) fn new(id: FileId, handle: EngineHandle, attr: FileAttr) -> Self {
        Self {
            id,
            handle,
            sparse: attr.sparse,
            compressed: attr.compressed,
            encrypted: attr.encrypted,
            sizes: SizeTracker::new(attr.sizes()),
            extents: ExtentCache::new(),
            wb_error: Mutex::new(None),
            sizes_dirty: AtomicBool::new(false),
            opens: AtomicU32::new(1),
        }
    }

    pub fn id(&self) -> FileId {
        self.id
    }

    pub(crate) fn handle(&self) -> EngineHandle {
        self.handle
    }

    pub fn is_sparse(&self) -> bool {
        self.sparse
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn sizes(&self) -> FileSizes {
        self.sizes.get()
    }

    /// Size update after an engine resize: clamp valid on shrink, then drop
    /// any cached fragment the file no longer reaches.
    pub(crate) fn apply_resize(&self, new_size: u64, new_allocated: u64) {
        let s = self.sizes.update_after_resize(new_size, new_allocated);
        self.extents.trim(s.size);
        self.mark_sizes_dirty();
    }

    /// Record a write-back failure. Only Corruption/IoError stick; the first
    /// one wins until an fsync reports it.
    pub(crate) fn set_wb_error(&self, err: &VolError) {
        if !err.is_sticky() {
            return;
        }
        let mut slot = self.wb_error.lock();
        if slot.is_none() {
            error!(file = self.id, "write-back failed, holding error for fsync: {err}");
            *slot = Some(err.clone());
        }
    }

    pub(crate) fn take_wb_error(&self) -> Option<VolError> {
        self.wb_error.lock().take()
    }

    pub(crate) fn mark_sizes_dirty(&self) {
        self.sizes_dirty.store(true, Ordering::Release);
    }

    pub(crate) fn take_sizes_dirty(&self) -> bool {
        self.sizes_dirty.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn sizes_dirty(&self) -> bool {
        self.sizes_dirty.load(Ordering::Acquire)
    }

    /// Another host-level open of the same file.
    pub(crate) fn acquire_open(&self) {
        self.opens.fetch_add(1, Ordering::AcqRel);
    }

    /// Host-level close; returns the remaining open count.
    pub(crate) fn release_open(&self) -> u32 {
        self.opens.fetch_sub(1, Ordering::AcqRel) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Extent, FragFlags, Fragment};

    fn state(valid: u64, size: u64) -> FileState {
        FileState::new(
            1,
            EngineHandle::new(1),
            FileAttr {
                valid,
                size,
                allocated: size,
                ..FileAttr::default()
            },
        )
    }

    #[test]
    fn resize_shrink_trims_cached_fragment() {
        let f = state(8192, 16384);
        f.extents.install(Fragment::new(
            4096,
            8192,
            Extent::Mapped { lbo: 0 },
            FragFlags::empty(),
        ));
        f.apply_resize(8192, 8192);
        assert!(f.extents.cached().is_none());
        let s = f.sizes();
        assert_eq!(s.size, 8192);
        assert_eq!(s.valid, 8192);
        assert!(f.sizes_dirty());
    }

    #[test]
    fn sticky_error_first_wins_and_reports_once() {
        let f = state(0, 0);
        f.set_wb_error(&VolError::IoError);
        f.set_wb_error(&VolError::corruption(1));
        assert_eq!(f.take_wb_error(), Some(VolError::IoError));
        assert_eq!(f.take_wb_error(), None);
    }

    #[test]
    fn non_sticky_errors_do_not_stick() {
        let f = state(0, 0);
        f.set_wb_error(&VolError::NoSpace);
        assert_eq!(f.take_wb_error(), None);
    }

    #[test]
    fn open_count_tracks_last_close() {
        let f = state(0, 0);
        f.acquire_open();
        assert_eq!(f.release_open(), 1);
        assert_eq!(f.release_open(), 0);
    }
}
