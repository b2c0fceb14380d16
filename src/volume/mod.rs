//! Volume assembly: the open-file registry, the host-facing operation
//! surface and the background flush thread.
//!
//! Every operation follows one shape: resolve the `FileState`, do as much
//! as possible against per-file caches, and only then take the volume lock
//! for the engine round trip. Fine-grained locks are never held across an
//! engine call. The flush thread is spawned at open, holds a weak handle so
//! a leaked volume still unwinds, and is joined at shutdown.

mod flush;
mod lock;

pub use lock::{VolumeGuard, VolumeLock};

use crate::config::VolumeConfig;
use crate::device::BlockDevice;
use crate::engine::{Extent, FileId, FileSizes, FsEngine, Fragment};
use crate::error::{Result, VolError};
use crate::file::FileState;
use crate::io::classify::{self, AccessMode, IoClass, ReadSeg, WriteSeg, access_allowed};
use crate::io::writeback::WritebackBatch;
use crate::io::zerofill;
use crate::utils::{ZEROS, zero_slice};
use bytes::Bytes;
use dashmap::{DashMap, Entry};
use flush::FlushScheduler;
use lock::PendingTask;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct Volume<E: FsEngine, D: BlockDevice> {
    inner: Arc<VolumeInner<E, D>>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

struct VolumeInner<E: FsEngine, D: BlockDevice> {
    config: VolumeConfig,
    lock: VolumeLock<E>,
    device: D,
    files: DashMap<FileId, Arc<FileState>>,
    flush: FlushScheduler,
    shutdown: AtomicBool,
}

impl<E: FsEngine, D: BlockDevice> Volume<E, D> {
    /// Bring a volume up over an engine and its device; spawns the
    /// background flush thread.
    pub fn open(engine: E, device: D, config: VolumeConfig) -> Result<Self> {
        let inner = Arc::new(VolumeInner {
            lock: VolumeLock::new(engine),
            device,
            files: DashMap::new(),
            flush: FlushScheduler::new(config.debounce),
            shutdown: AtomicBool::new(false),
            config,
        });
        let weak = Arc::downgrade(&inner);
        let handle = std::thread::Builder::new()
            .name("volio-flush".into())
            .spawn(move || flush_loop(weak))?;
        info!(debounce = ?inner.config.debounce, "volume up");
        Ok(Self {
            inner,
            flusher: Mutex::new(Some(handle)),
        })
    }

    /// Runtime failure escalation: every later operation fails fast with
    /// IoError without reaching the engine.
    pub fn set_shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        warn!("volume forced down, operations now fail fast");
    }

    /// Orderly teardown: final durable sync, then stop and join the flush
    /// thread. Safe to call more than once.
    pub fn shutdown(&self) -> Result<()> {
        let res = if self.inner.shutdown.load(Ordering::Acquire) {
            Ok(())
        } else {
            self.inner.sync(true)
        };
        self.inner.flush.stop();
        if let Some(handle) = self.flusher.lock().take() {
            if handle.join().is_err() {
                error!("flush thread panicked");
                return res.and(Err(VolError::IoError));
            }
        }
        res
    }

    /// First open loads metadata through the engine; later opens of the
    /// same file only bump the count.
    pub fn open_file(&self, id: FileId) -> Result<Arc<FileState>> {
        self.inner.ensure_live()?;
        if let Some(existing) = self.inner.files.get(&id) {
            existing.acquire_open();
            return Ok(Arc::clone(existing.value()));
        }
        let (handle, attr) = {
            let guard = self.inner.lock.lock();
            guard.open(id)?
        };
        match self.inner.files.entry(id) {
            Entry::Occupied(entry) => {
                // Raced another first open; theirs won, ours closes.
                let winner = Arc::clone(entry.get());
                winner.acquire_open();
                drop(entry);
                let guard = self.inner.lock.lock();
                if let Err(err) = guard.close(handle) {
                    warn!(file = id, "closing redundant open failed: {err}");
                }
                Ok(winner)
            }
            Entry::Vacant(entry) => {
                debug!(file = id, "first open");
                let state = Arc::new(FileState::new(id, handle, attr));
                entry.insert(Arc::clone(&state));
                Ok(state)
            }
        }
    }

    /// Host-level close; the last one pushes dirty sizes and closes the
    /// engine handle.
    pub fn close_file(&self, id: FileId) -> Result<()> {
        self.inner.ensure_live()?;
        let file = self.inner.file(id)?;
        if file.release_open() > 0 {
            return Ok(());
        }
        self.inner.files.remove(&id);
        let sizes_dirty = file.take_sizes_dirty();
        let guard = self.inner.lock.lock();
        self.inner.finish_close(&guard, &file, sizes_dirty)
    }

    /// Reclaim-path close: never blocks on the volume lock. Work the lock
    /// would serialize is left for the next holder; a full queue falls back
    /// to blocking.
    pub fn evict_file(&self, id: FileId) -> Result<()> {
        self.inner.ensure_live()?;
        let file = self.inner.file(id)?;
        if file.release_open() > 0 {
            return Ok(());
        }
        self.inner.files.remove(&id);
        let sizes_dirty = file.take_sizes_dirty();
        match self.inner.lock.try_lock() {
            Some(guard) => self.inner.finish_close(&guard, &file, sizes_dirty),
            None => {
                let mut tasks = Vec::with_capacity(2);
                if sizes_dirty {
                    tasks.push(PendingTask::WriteSizes {
                        file: Arc::clone(&file),
                        sizes: file.sizes(),
                    });
                }
                tasks.push(PendingTask::Close {
                    id,
                    handle: file.handle(),
                });
                if self.inner.lock.defer_batch(tasks) {
                    debug!(file = id, "eviction deferred to the next lock holder");
                    return Ok(());
                }
                warn!(file = id, "deferred queue full, closing inline");
                let guard = self.inner.lock.lock();
                self.inner.finish_close(&guard, &file, sizes_dirty)
            }
        }
    }

    /// Fragment covering `vbo`; `need > 0` materializes at least that many
    /// bytes. A zero-length fragment with no error means nothing is mapped.
    pub fn lookup(&self, id: FileId, vbo: u64, need: u64) -> Result<Fragment> {
        self.inner.ensure_live()?;
        let file = self.inner.file(id)?;
        self.inner.lookup_frag(&file, vbo, need, need > 0)
    }

    /// What the leading bytes of `[vbo, vbo+len)` map to.
    pub fn classify(&self, id: FileId, vbo: u64, len: u64) -> Result<IoClass> {
        self.inner.ensure_live()?;
        let file = self.inner.file(id)?;
        let frag = self.inner.lookup_frag(&file, vbo, 0, false)?;
        Ok(IoClass::of(&frag, vbo, len))
    }

    /// Refuse access modes the file layout cannot serve.
    pub fn check_access(&self, id: FileId, mode: AccessMode) -> Result<()> {
        self.inner.ensure_live()?;
        let file = self.inner.file(id)?;
        if !access_allowed(mode, file.is_compressed(), file.is_encrypted()) {
            debug!(file = id, ?mode, "access refused for this layout");
            return Err(VolError::NotSupported);
        }
        Ok(())
    }

    /// Buffered read. Returns the bytes read, short only at end of file;
    /// anything past the valid size reads as zeros without device I/O.
    pub fn read_at(&self, id: FileId, vbo: u64, buf: &mut [u8]) -> Result<usize> {
        self.inner.ensure_live()?;
        if buf.is_empty() {
            return Ok(0);
        }
        let file = self.inner.file(id)?;
        if file.is_encrypted() {
            return Err(VolError::NotSupported);
        }
        let sizes = file.sizes();
        if vbo >= sizes.size {
            return Ok(0);
        }
        let len = (buf.len() as u64).min(sizes.size - vbo);
        let plan = classify::plan_read(
            id,
            sizes,
            u64::from(self.inner.config.cluster_size),
            vbo,
            len,
            |pos| self.inner.lookup_frag(&file, pos, 0, false),
        )?;
        for seg in &plan {
            self.inner.run_read(&file, vbo, buf, seg)?;
        }
        Ok(len as usize)
    }

    /// Buffered write. Extends the file when needed, zero-fills any gap
    /// between the valid size and the write start, and advances the valid
    /// size once the data is down. Runs under the host's per-file lock;
    /// two unsynchronized writers race the valid-size bookkeeping.
    pub fn write_at(&self, id: FileId, vbo: u64, data: &[u8]) -> Result<usize> {
        self.inner.ensure_live()?;
        if data.is_empty() {
            return Ok(0);
        }
        let file = self.inner.file(id)?;
        if file.is_encrypted() {
            return Err(VolError::NotSupported);
        }
        let end = vbo
            .checked_add(data.len() as u64)
            .ok_or(VolError::FileTooBig)?;
        if end > self.inner.config.size_limit(file.is_sparse()) {
            return Err(VolError::FileTooBig);
        }
        let sizes = file.sizes();
        if end > sizes.size {
            file.sizes.extend_size(end);
            file.mark_sizes_dirty();
        }
        if vbo > sizes.valid {
            // Never leave a stale window between the initialized prefix and
            // this write.
            self.inner.extend_valid(&file, vbo, false)?;
        }
        let plan = classify::plan_write(id, vbo, data.len() as u64, |pos, need| {
            self.inner.lookup_frag(&file, pos, need, true)
        })?;
        for seg in &plan {
            self.inner.run_write(&file, vbo, data, seg)?;
        }
        file.sizes.advance_valid(end);
        file.mark_sizes_dirty();
        self.inner.flush.mark_dirty();
        Ok(data.len())
    }

    /// Batched data write-back. Pages must already lie inside the written
    /// region (buffered writes advanced the sizes when the host absorbed
    /// the data); this path only moves bytes. Failures are recorded on the
    /// file and surface at the next fsync as well as here.
    pub fn write_back(&self, id: FileId, pages: &[(u64, Bytes)]) -> Result<()> {
        self.inner.ensure_live()?;
        if pages.is_empty() {
            return Ok(());
        }
        let file = self.inner.file(id)?;
        if file.is_encrypted() {
            return Err(VolError::NotSupported);
        }
        let limit = self.inner.config.size_limit(file.is_sparse());
        for (vbo, data) in pages {
            let end = vbo
                .checked_add(data.len() as u64)
                .ok_or(VolError::FileTooBig)?;
            if end > limit {
                return Err(VolError::FileTooBig);
            }
        }

        let batch = WritebackBatch::new();
        let mut res = Ok(());
        'submit: for (vbo, data) in pages {
            let plan = match classify::plan_write(id, *vbo, data.len() as u64, |pos, need| {
                self.inner.lookup_frag(&file, pos, need, true)
            }) {
                Ok(plan) => plan,
                Err(err) => {
                    res = Err(err);
                    break 'submit;
                }
            };
            for seg in &plan {
                let step = match *seg {
                    WriteSeg::Device { vbo: s, lbo, len } => {
                        let at = (s - vbo) as usize;
                        self.inner.device.submit_write(
                            lbo,
                            data.slice(at..at + len as usize),
                            batch.completion(),
                        );
                        Ok(())
                    }
                    WriteSeg::Zeros { lbo, len } => self.inner.zero_device(lbo, len),
                    WriteSeg::Engine { vbo: s, len } => {
                        let at = (s - vbo) as usize;
                        let written = {
                            let guard = self.inner.lock.lock();
                            guard.write(file.handle(), s, &data[at..at + len as usize])
                        };
                        written.map(|w| file.sizes.set_allocated(w.allocated))
                    }
                };
                if let Err(err) = step {
                    res = Err(err);
                    break 'submit;
                }
            }
        }
        match res.and(batch.wait()) {
            Ok(()) => {
                self.inner.flush.mark_dirty();
                Ok(())
            }
            Err(err) => {
                file.set_wb_error(&err);
                Err(err)
            }
        }
    }

    /// Push the initialized prefix out to `to` (clamped to the file size),
    /// writing zeros through the ordinary write path. `force` materializes
    /// holes instead of skipping them. Runs under the host's per-file
    /// lock: a failed pass rolls the valid size back to where it started,
    /// which must not interleave with another writer of the same file.
    pub fn extend_valid(&self, id: FileId, to: u64, force: bool) -> Result<()> {
        self.inner.ensure_live()?;
        let file = self.inner.file(id)?;
        self.inner.extend_valid(&file, to, force)
    }

    /// Change the logical size. Refused against the configured ceiling
    /// before the engine sees anything; shrink clamps the valid size and
    /// drops stale cached fragments. The host's per-file lock must fence
    /// this from concurrent reads and writes of the same file.
    pub fn truncate(&self, id: FileId, new_size: u64) -> Result<()> {
        self.inner.ensure_live()?;
        let file = self.inner.file(id)?;
        if new_size > self.inner.config.size_limit(file.is_sparse()) {
            return Err(VolError::FileTooBig);
        }
        {
            let guard = self.inner.lock.lock();
            let allocated = guard.resize(file.handle(), new_size)?;
            file.apply_resize(new_size, allocated);
        }
        self.inner.flush.mark_dirty();
        Ok(())
    }

    /// fsync: report a stored write-back error first, then push dirty sizes
    /// and ask for a durable flush down to the device.
    pub fn flush_file(&self, id: FileId) -> Result<()> {
        self.inner.ensure_live()?;
        let file = self.inner.file(id)?;
        if let Some(err) = file.take_wb_error() {
            return Err(err);
        }
        {
            let guard = self.inner.lock.lock();
            if file.take_sizes_dirty() {
                if let Err(err) = guard.update_sizes(file.handle(), file.sizes()) {
                    file.mark_sizes_dirty();
                    return Err(err);
                }
            }
            guard.flush(true)?;
        }
        self.inner.device.sync()?;
        Ok(())
    }

    /// Volume-wide flush; `wait` requests completion on stable storage.
    pub fn sync(&self, wait: bool) -> Result<()> {
        self.inner.ensure_live()?;
        self.inner.sync(wait)
    }

    pub fn sizes(&self, id: FileId) -> Result<FileSizes> {
        self.inner.ensure_live()?;
        Ok(self.inner.file(id)?.sizes())
    }

    /// Serialized engine access for multi-call host sequences.
    pub fn lock(&self) -> VolumeGuard<'_, E> {
        self.inner.lock.lock()
    }

    pub fn try_lock(&self) -> Option<VolumeGuard<'_, E>> {
        self.inner.lock.try_lock()
    }
}

impl<E: FsEngine, D: BlockDevice> Drop for Volume<E, D> {
    fn drop(&mut self) {
        self.inner.flush.stop();
        if let Some(handle) = self.flusher.lock().take() {
            let _ = handle.join();
        }
    }
}

impl<E: FsEngine, D: BlockDevice> VolumeInner<E, D> {
    fn ensure_live(&self) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(VolError::IoError);
        }
        Ok(())
    }

    fn file(&self, id: FileId) -> Result<Arc<FileState>> {
        self.files
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| VolError::not_found(id))
    }

    /// Translation with the per-file fragment cache in front of the engine.
    ///
    /// `create` materializes backing space, so a cached hole cannot satisfy
    /// it. Every fragment leaving here was bounds-checked against the
    /// device, on the hit path too.
    fn lookup_frag(&self, file: &FileState, vbo: u64, need: u64, create: bool) -> Result<Fragment> {
        if let Some(frag) = file.extents.probe(vbo, need) {
            if !(create && frag.extent == Extent::Hole) {
                self.check_run(file, &frag)?;
                return Ok(frag);
            }
        }
        let guard = self.lock.lock();
        let res = guard.map(file.handle(), vbo, need, create)?;
        let frag = res.fragment;
        if frag.is_empty() {
            return Ok(frag);
        }
        self.check_run(file, &frag)?;
        file.sizes.set_allocated(res.allocated);
        file.extents.install(frag);
        Ok(frag)
    }

    /// Corruption guard: a mapped run must land inside the device.
    fn check_run(&self, file: &FileState, frag: &Fragment) -> Result<()> {
        if let Extent::Mapped { lbo } = frag.extent {
            if lbo
                .checked_add(frag.len)
                .is_none_or(|end| end > self.device.len_bytes())
            {
                file.extents.invalidate();
                error!(
                    file = file.id(),
                    lbo,
                    len = frag.len,
                    device = self.device.len_bytes(),
                    "mapped run past device end"
                );
                return Err(VolError::corruption(file.id()));
            }
        }
        Ok(())
    }

    fn run_read(&self, file: &FileState, base: u64, buf: &mut [u8], seg: &ReadSeg) -> Result<()> {
        match *seg {
            ReadSeg::Device { vbo, lbo, len } => {
                let at = (vbo - base) as usize;
                self.device.read_at(lbo, &mut buf[at..at + len as usize])
            }
            ReadSeg::Engine { vbo, len } => {
                let at = (vbo - base) as usize;
                let dst = &mut buf[at..at + len as usize];
                let n = {
                    let guard = self.lock.lock();
                    guard.read(file.handle(), vbo, dst)?
                };
                // Short engine read: the remainder is implicitly zero.
                dst[n as usize..].fill(0);
                Ok(())
            }
            ReadSeg::Zero { vbo, len } => {
                let at = (vbo - base) as usize;
                buf[at..at + len as usize].fill(0);
                Ok(())
            }
        }
    }

    fn run_write(&self, file: &FileState, base: u64, data: &[u8], seg: &WriteSeg) -> Result<()> {
        match *seg {
            WriteSeg::Device { vbo, lbo, len } => {
                let at = (vbo - base) as usize;
                self.device.write_at(lbo, &data[at..at + len as usize])
            }
            WriteSeg::Zeros { lbo, len } => self.zero_device(lbo, len),
            WriteSeg::Engine { vbo, len } => {
                let at = (vbo - base) as usize;
                let res = {
                    let guard = self.lock.lock();
                    guard.write(file.handle(), vbo, &data[at..at + len as usize])?
                };
                file.sizes.set_allocated(res.allocated);
                Ok(())
            }
        }
    }

    /// Device-level zeroing in shared-buffer windows.
    fn zero_device(&self, mut lbo: u64, mut len: u64) -> Result<()> {
        while len > 0 {
            let n = len.min(ZEROS.len() as u64);
            self.device.write_at(lbo, &zero_slice(n as usize))?;
            lbo += n;
            len -= n;
        }
        Ok(())
    }

    /// One window of the zero-fill loop, pushed through the ordinary write
    /// plan so allocation and fresh-run zeroing behave exactly like a data
    /// write of zeros.
    fn write_zero_window(&self, file: &FileState, vbo: u64, len: u64) -> Result<()> {
        let plan = classify::plan_write(file.id(), vbo, len, |pos, need| {
            self.lookup_frag(file, pos, need, true)
        })?;
        for seg in &plan {
            match *seg {
                WriteSeg::Device { lbo, len, .. } => self.zero_device(lbo, len)?,
                WriteSeg::Zeros { lbo, len } => self.zero_device(lbo, len)?,
                WriteSeg::Engine { vbo, len } => {
                    let res = {
                        let guard = self.lock.lock();
                        guard.write(file.handle(), vbo, &zero_slice(len as usize))?
                    };
                    file.sizes.set_allocated(res.allocated);
                }
            }
        }
        Ok(())
    }

    fn extend_valid(&self, file: &Arc<FileState>, to: u64, force: bool) -> Result<()> {
        let before = file.sizes.get().valid;
        zerofill::extend_valid(
            &file.sizes,
            u64::from(self.config.cluster_size),
            file.is_sparse(),
            to,
            force,
            |vbo| self.lookup_frag(file, vbo, 0, false),
            |vbo, len| self.write_zero_window(file, vbo, len),
        )?;
        if file.sizes.get().valid != before {
            file.mark_sizes_dirty();
            self.flush.mark_dirty();
        }
        Ok(())
    }

    /// Shared tail of close/evict: dirty sizes first, then the engine
    /// handle. The first failure is reported, the close still happens.
    fn finish_close(
        &self,
        guard: &VolumeGuard<'_, E>,
        file: &FileState,
        sizes_dirty: bool,
    ) -> Result<()> {
        let mut first = Ok(());
        if sizes_dirty {
            if let Err(err) = guard.update_sizes(file.handle(), file.sizes()) {
                warn!(file = file.id(), "size write-back at close failed: {err}");
                first = Err(err);
            }
        }
        if let Err(err) = guard.close(file.handle()) {
            warn!(file = file.id(), "engine close failed: {err}");
            if first.is_ok() {
                first = Err(err);
            }
        }
        first
    }

    fn sync(&self, wait: bool) -> Result<()> {
        let dirty: Vec<Arc<FileState>> = self
            .files
            .iter()
            .filter(|entry| entry.value().sizes_dirty())
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let guard = self.lock.lock();
        for file in dirty {
            if !file.take_sizes_dirty() {
                continue;
            }
            if let Err(err) = guard.update_sizes(file.handle(), file.sizes()) {
                warn!(file = file.id(), "size write-back failed in sync: {err}");
                file.mark_sizes_dirty();
                file.set_wb_error(&err);
            }
        }
        guard.flush(wait)?;
        drop(guard);
        self.device.sync()?;
        Ok(())
    }
}

/// Background flush body. Waits for the debounce window, then flushes with
/// `try_lock`; contention hands the flush to the lock holder instead of
/// blocking, and a failed attempt waits out a fresh window. A forced
/// shutdown ends the loop before any engine call.
fn flush_loop<E: FsEngine, D: BlockDevice>(inner: Weak<VolumeInner<E, D>>) {
    loop {
        let Some(vol) = inner.upgrade() else { return };
        let Some(generation) = vol.flush.wait_due() else {
            return;
        };
        if vol.shutdown.load(Ordering::Acquire) {
            return;
        }
        if !vol.lock.engine_dirty() {
            vol.flush.confirm(generation);
            continue;
        }
        match vol.lock.try_lock() {
            Some(guard) => {
                debug!("debounce window expired, flushing");
                match guard.flush(false) {
                    Ok(()) => {
                        vol.flush.confirm(generation);
                    }
                    Err(err) => {
                        warn!("background flush failed, retrying after a window: {err}");
                        vol.flush.rearm();
                    }
                }
            }
            None => {
                // The holder applies it on release.
                vol.lock.request_flush();
                vol.flush.rearm();
            }
        }
    }
}
