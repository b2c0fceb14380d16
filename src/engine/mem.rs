//! In-memory engine for local development and tests.
//!
//! Behaves like a lazy-allocating format: `resize` only moves the logical
//! size, physical runs appear on `map(create)`. Per-file fragment maps stop
//! at classification boundaries, every trait call is counted, and write
//! failures can be injected, which is what the cache-coherency and
//! zero-fill properties in the test suite are asserted against.

use super::{
    EngineHandle, Extent, FileAttr, FileId, FileSizes, FragFlags, Fragment, FsEngine, MapResult,
    WriteResult,
};
use crate::error::{Result, VolError};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Initial file shape for [`MemEngine::add_file`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MemFileSpec {
    pub size: u64,
    pub valid: u64,
    pub sparse: bool,
    pub compressed: bool,
    pub encrypted: bool,
}

/// Snapshot of per-call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub open: u64,
    pub close: u64,
    pub map: u64,
    pub read: u64,
    pub write: u64,
    pub resize: u64,
    pub update_sizes: u64,
    pub flush: u64,
}

#[derive(Debug, Clone, Copy)]
struct StoredFrag {
    len: u64,
    extent: Extent,
    flags: FragFlags,
}

struct MemFile {
    valid: u64,
    size: u64,
    allocated: u64,
    sparse: bool,
    compressed: bool,
    encrypted: bool,
    /// Mapped/hole runs keyed by starting vbo; never overlapping.
    frags: BTreeMap<u64, StoredFrag>,
    /// Engine-private content for resident/compressed/encrypted files.
    content: Vec<u8>,
}

impl MemFile {
    fn attr(&self) -> FileAttr {
        FileAttr {
            valid: self.valid,
            size: self.size,
            allocated: self.allocated,
            sparse: self.sparse,
            compressed: self.compressed,
            encrypted: self.encrypted,
        }
    }
}

#[derive(Default)]
struct MemState {
    files: HashMap<FileId, MemFile>,
    handles: HashMap<u64, FileId>,
    next_handle: u64,
    next_lbo: u64,
}

#[derive(Default)]
struct Counters {
    open: AtomicU64,
    close: AtomicU64,
    map: AtomicU64,
    read: AtomicU64,
    write: AtomicU64,
    resize: AtomicU64,
    update_sizes: AtomicU64,
    flush: AtomicU64,
}

pub struct MemEngine {
    state: Mutex<MemState>,
    calls: Counters,
    fail_writes: AtomicBool,
    fail_flush: AtomicBool,
    dirty: AtomicBool,
    cluster: u64,
}

impl Default for MemEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemEngine {
    pub fn new() -> Self {
        Self::with_cluster(4096)
    }

    pub fn with_cluster(cluster: u64) -> Self {
        Self {
            state: Mutex::new(MemState {
                // Keep lbo 0 for the boot region so fresh runs never land there.
                next_lbo: cluster,
                ..MemState::default()
            }),
            calls: Counters::default(),
            fail_writes: AtomicBool::new(false),
            fail_flush: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            cluster,
        }
    }

    pub fn add_file(&self, id: FileId, spec: MemFileSpec) {
        let mut st = self.state.lock();
        st.files.insert(
            id,
            MemFile {
                valid: spec.valid.min(spec.size),
                size: spec.size,
                allocated: 0,
                sparse: spec.sparse,
                compressed: spec.compressed,
                encrypted: spec.encrypted,
                frags: BTreeMap::new(),
                content: Vec::new(),
            },
        );
    }

    /// Install a raw mapped run. The lbo is deliberately unvalidated so
    /// tests can fabricate runs past the device end; vbo and len must be
    /// cluster-aligned like every engine-created run.
    pub fn add_mapped(&self, id: FileId, vbo: u64, len: u64, lbo: u64) {
        debug_assert!(vbo % self.cluster == 0 && len % self.cluster == 0);
        let mut st = self.state.lock();
        if let Some(file) = st.files.get_mut(&id) {
            file.frags.insert(
                vbo,
                StoredFrag {
                    len,
                    extent: Extent::Mapped { lbo },
                    flags: FragFlags::empty(),
                },
            );
            file.allocated += len;
        }
    }

    /// Seed engine-private content (resident/compressed/encrypted files).
    pub fn set_content(&self, id: FileId, data: &[u8]) {
        let mut st = self.state.lock();
        if let Some(file) = st.files.get_mut(&id) {
            file.content = data.to_vec();
        }
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_flush(&self, fail: bool) {
        self.fail_flush.store(fail, Ordering::SeqCst);
    }

    pub fn counts(&self) -> CallCounts {
        CallCounts {
            open: self.calls.open.load(Ordering::SeqCst),
            close: self.calls.close.load(Ordering::SeqCst),
            map: self.calls.map.load(Ordering::SeqCst),
            read: self.calls.read.load(Ordering::SeqCst),
            write: self.calls.write.load(Ordering::SeqCst),
            resize: self.calls.resize.load(Ordering::SeqCst),
            update_sizes: self.calls.update_sizes.load(Ordering::SeqCst),
            flush: self.calls.flush.load(Ordering::SeqCst),
        }
    }

    fn align_down(&self, v: u64) -> u64 {
        v - v % self.cluster
    }

    fn align_up(&self, v: u64) -> u64 {
        v.div_ceil(self.cluster) * self.cluster
    }
}

fn resolve<'a>(st: &'a mut MemState, handle: EngineHandle) -> Result<&'a mut MemFile> {
    let id = *st.handles.get(&handle.raw()).ok_or(VolError::Stale)?;
    st.files
        .get_mut(&id)
        .ok_or(VolError::NotFound { file: id.into() })
}

impl FsEngine for MemEngine {
    fn open(&self, file: FileId) -> Result<(EngineHandle, FileAttr)> {
        self.calls.open.fetch_add(1, Ordering::SeqCst);
        let mut st = self.state.lock();
        let attr = st
            .files
            .get(&file)
            .map(MemFile::attr)
            .ok_or(VolError::not_found(file))?;
        st.next_handle += 1;
        let handle = EngineHandle::new(st.next_handle);
        st.handles.insert(handle.raw(), file);
        Ok((handle, attr))
    }

    fn close(&self, handle: EngineHandle) -> Result<()> {
        self.calls.close.fetch_add(1, Ordering::SeqCst);
        let mut st = self.state.lock();
        match st.handles.remove(&handle.raw()) {
            Some(_) => Ok(()),
            None => Err(VolError::Stale),
        }
    }

    fn map(&self, handle: EngineHandle, vbo: u64, len: u64, create: bool) -> Result<MapResult> {
        self.calls.map.fetch_add(1, Ordering::SeqCst);
        let cluster = self.cluster;
        let mut st = self.state.lock();

        // Whole-file pseudo runs first: these formats keep one classification
        // for all content and a fragment must not straddle a variant change.
        {
            let file = resolve(&mut st, handle)?;
            let pseudo = if file.encrypted {
                Some(Extent::Encrypted)
            } else if file.compressed {
                Some(Extent::Compressed)
            } else if file.size > 0 && file.size < cluster && !file.sparse && file.frags.is_empty()
            {
                // Small enough to stay inline in metadata.
                Some(Extent::Resident)
            } else {
                None
            };
            if let Some(extent) = pseudo {
                let run = file.size.div_ceil(cluster).max(1) * cluster;
                let fragment = if vbo < run {
                    Fragment::new(0, run, extent, FragFlags::empty())
                } else {
                    Fragment::none(vbo)
                };
                return Ok(MapResult {
                    fragment,
                    allocated: file.allocated,
                });
            }
        }

        // Existing run covering vbo.
        {
            let file = resolve(&mut st, handle)?;
            if let Some((&start, frag)) = file.frags.range(..=vbo).next_back() {
                if vbo < start + frag.len {
                    return Ok(MapResult {
                        fragment: Fragment::new(start, frag.len, frag.extent, frag.flags),
                        allocated: file.allocated,
                    });
                }
            }
        }

        if create {
            let (start, next_start) = {
                let file = resolve(&mut st, handle)?;
                let start = self.align_down(vbo);
                let next = file.frags.range(start..).next().map(|(&s, _)| s);
                (start, next)
            };
            let mut end = self.align_up(vbo + len.max(1));
            if let Some(next) = next_start {
                end = end.min(next);
            }
            let run_len = end - start;
            let lbo = st.next_lbo;
            st.next_lbo += run_len;
            let file = resolve(&mut st, handle)?;
            file.frags.insert(
                start,
                StoredFrag {
                    len: run_len,
                    extent: Extent::Mapped { lbo },
                    flags: FragFlags::UNINIT,
                },
            );
            file.allocated += run_len;
            self.dirty.store(true, Ordering::SeqCst);
            return Ok(MapResult {
                fragment: Fragment::new(
                    start,
                    run_len,
                    Extent::Mapped { lbo },
                    FragFlags::NEW_ALLOCATED | FragFlags::UNINIT,
                ),
                allocated: file.allocated,
            });
        }

        // Nothing mapped. Sparse files inside the logical size report the gap
        // as a hole ending at the next run or the aligned size.
        let file = resolve(&mut st, handle)?;
        if file.sparse && vbo < file.size {
            let next = file.frags.range(vbo..).next().map(|(&s, _)| s);
            let end = next.unwrap_or_else(|| self.align_up(file.size)).max(vbo + 1);
            return Ok(MapResult {
                fragment: Fragment::new(vbo, end - vbo, Extent::Hole, FragFlags::empty()),
                allocated: file.allocated,
            });
        }
        Ok(MapResult {
            fragment: Fragment::none(vbo),
            allocated: file.allocated,
        })
    }

    fn read(&self, handle: EngineHandle, vbo: u64, buf: &mut [u8]) -> Result<u64> {
        self.calls.read.fetch_add(1, Ordering::SeqCst);
        let mut st = self.state.lock();
        let file = resolve(&mut st, handle)?;
        let start = vbo as usize;
        if start >= file.content.len() {
            return Ok(0);
        }
        let n = buf.len().min(file.content.len() - start);
        buf[..n].copy_from_slice(&file.content[start..start + n]);
        Ok(n as u64)
    }

    fn write(&self, handle: EngineHandle, vbo: u64, data: &[u8]) -> Result<WriteResult> {
        self.calls.write.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(VolError::IoError);
        }
        let mut st = self.state.lock();
        let file = resolve(&mut st, handle)?;
        let start = vbo as usize;
        let end = start + data.len();
        if file.content.len() < end {
            file.content.resize(end, 0);
        }
        file.content[start..end].copy_from_slice(data);
        self.dirty.store(true, Ordering::SeqCst);
        Ok(WriteResult {
            written: data.len() as u64,
            allocated: file.allocated,
        })
    }

    fn resize(&self, handle: EngineHandle, new_size: u64) -> Result<u64> {
        self.calls.resize.fetch_add(1, Ordering::SeqCst);
        let aligned_end = self.align_up(new_size);
        let mut st = self.state.lock();
        let file = resolve(&mut st, handle)?;
        if new_size < file.size {
            // Drop runs past the new aligned end; shorten the straddler.
            file.frags.retain(|&start, frag| {
                if start >= aligned_end {
                    return false;
                }
                if start + frag.len > aligned_end {
                    frag.len = aligned_end - start;
                }
                true
            });
            file.allocated = file.frags.values().map(|f| f.len).sum();
            file.valid = file.valid.min(new_size);
            file.content.truncate(new_size as usize);
        }
        file.size = new_size;
        self.dirty.store(true, Ordering::SeqCst);
        Ok(file.allocated)
    }

    fn update_sizes(&self, handle: EngineHandle, sizes: FileSizes) -> Result<()> {
        self.calls.update_sizes.fetch_add(1, Ordering::SeqCst);
        let mut st = self.state.lock();
        let file = resolve(&mut st, handle)?;
        file.valid = sizes.valid;
        file.size = sizes.size;
        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn flush(&self, _wait: bool) -> Result<()> {
        self.calls.flush.fetch_add(1, Ordering::SeqCst);
        if self.fail_flush.load(Ordering::SeqCst) {
            return Err(VolError::IoError);
        }
        self.dirty.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(engine: &MemEngine, id: FileId, spec: MemFileSpec) -> EngineHandle {
        engine.add_file(id, spec);
        engine.open(id).unwrap().0
    }

    #[test]
    fn create_allocates_aligned_run_flagged_new() {
        let engine = MemEngine::new();
        let h = open(&engine, 1, MemFileSpec::default());
        let res = engine.map(h, 100, 1000, true).unwrap();
        assert_eq!(res.fragment.vbo, 0);
        assert_eq!(res.fragment.len, 4096);
        assert!(res.fragment.flags.contains(FragFlags::NEW_ALLOCATED));
        assert!(res.fragment.extent.is_mapped());
        assert_eq!(res.allocated, 4096);

        // The stored run no longer reports the allocation as fresh.
        let again = engine.map(h, 100, 0, false).unwrap();
        assert!(!again.fragment.flags.contains(FragFlags::NEW_ALLOCATED));
        assert_eq!(again.fragment.len, 4096);
    }

    #[test]
    fn sparse_gap_reports_hole_up_to_next_run() {
        let engine = MemEngine::new();
        let h = open(
            &engine,
            1,
            MemFileSpec {
                size: 64 * 1024,
                sparse: true,
                ..MemFileSpec::default()
            },
        );
        engine.add_mapped(1, 16384, 4096, 1 << 20);
        let res = engine.map(h, 0, 0, false).unwrap();
        assert_eq!(res.fragment.extent, Extent::Hole);
        assert_eq!(res.fragment.vbo, 0);
        assert_eq!(res.fragment.end(), 16384);

        let mapped = engine.map(h, 16384, 0, false).unwrap();
        assert_eq!(mapped.fragment.extent, Extent::Mapped { lbo: 1 << 20 });
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic]
    fn seeding_an_unaligned_run_is_refused() {
        let engine = MemEngine::new();
        engine.add_file(
            1,
            MemFileSpec {
                size: 8192,
                ..MemFileSpec::default()
            },
        );
        engine.add_mapped(1, 100, 4096, 0);
    }

    #[test]
    fn encrypted_file_maps_as_one_pseudo_run() {
        let engine = MemEngine::new();
        let h = open(
            &engine,
            7,
            MemFileSpec {
                size: 10_000,
                encrypted: true,
                ..MemFileSpec::default()
            },
        );
        let res = engine.map(h, 4097, 0, false).unwrap();
        assert_eq!(res.fragment.extent, Extent::Encrypted);
        assert_eq!(res.fragment.vbo, 0);
        assert_eq!(res.fragment.len, 12288);
    }

    #[test]
    fn shrink_drops_runs_and_clamps_valid() {
        let engine = MemEngine::new();
        let h = open(
            &engine,
            1,
            MemFileSpec {
                size: 0,
                ..MemFileSpec::default()
            },
        );
        engine.map(h, 0, 16384, true).unwrap();
        engine
            .update_sizes(
                h,
                FileSizes {
                    valid: 16384,
                    size: 16384,
                    allocated: 16384,
                },
            )
            .unwrap();
        let allocated = engine.resize(h, 4096).unwrap();
        assert_eq!(allocated, 4096);
        let attr = {
            let (h2, attr) = engine.open(1).unwrap();
            engine.close(h2).unwrap();
            attr
        };
        assert_eq!(attr.size, 4096);
        assert!(attr.valid <= 4096);
    }

    #[test]
    fn double_close_is_stale() {
        let engine = MemEngine::new();
        let h = open(&engine, 1, MemFileSpec::default());
        engine.close(h).unwrap();
        assert!(matches!(engine.close(h), Err(VolError::Stale)));
    }
}
