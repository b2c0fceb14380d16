//! Boundary with the backing filesystem engine.
//!
//! The engine owns every on-disk structural decision (extent layout,
//! directory trees, journaling, allocation); this crate only caches and
//! dispatches around it. All trait calls are blocking and are only legal
//! while holding the volume lock (`Volume::lock` hands out the engine
//! reference for exactly that reason).

use crate::error::Result;
use std::ops::BitOr;
use std::sync::Arc;

pub mod mem;

/// Host-assigned identity of a file on the volume.
pub type FileId = u64;

/// Engine-minted token for an open file.
///
/// Created on first engine-level open, destroyed on last close. The token
/// itself is plain data; the engine validates it on every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineHandle(u64);

impl EngineHandle {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// What a contiguous run of file bytes maps to.
///
/// Replaces the classic reserved-pseudo-offset encoding: there are no magic
/// address values anywhere in this crate, only this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extent {
    /// Unallocated; reads as zeros.
    Hole,
    /// Content lives inline in engine metadata, not in device extents.
    Resident,
    /// Content is compressed on disk; only the engine can move it.
    Compressed,
    /// Content is encrypted on disk; only the engine holds key material.
    Encrypted,
    /// Plain mapped run starting at this device byte offset.
    Mapped { lbo: u64 },
}

impl Extent {
    #[inline]
    pub fn is_mapped(self) -> bool {
        matches!(self, Extent::Mapped { .. })
    }
}

/// Fragment property bits, passed through from the engine.
///
/// Known bits are named below; anything else is format-specific and carried
/// opaquely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FragFlags(u32);

impl FragFlags {
    /// Allocation happened during this map call; the space is not zeroed.
    pub const NEW_ALLOCATED: FragFlags = FragFlags(1 << 0);
    /// Allocated earlier but never initialized.
    pub const UNINIT: FragFlags = FragFlags(1 << 1);
    /// Shares physical clusters with another file (reflink/clone).
    pub const CLONED: FragFlags = FragFlags(1 << 2);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn contains(self, other: FragFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: FragFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: FragFlags) {
        self.0 &= !other.0;
    }
}

impl BitOr for FragFlags {
    type Output = FragFlags;

    fn bitor(self, rhs: FragFlags) -> FragFlags {
        FragFlags(self.0 | rhs.0)
    }
}

/// One validated contiguous run of a file's mapping.
///
/// Invariants:
/// - For `Mapped { lbo }`, any `v` in `[vbo, vbo+len)` resolves to
///   `lbo + (v - vbo)`; other variants apply uniformly to the whole run.
/// - A fragment never straddles a classification boundary; engine refreshes
///   stop extension where the variant would change.
/// - `len == 0` means "nothing mapped here" and is never cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    pub vbo: u64,
    pub len: u64,
    pub extent: Extent,
    pub flags: FragFlags,
}

impl Fragment {
    pub fn new(vbo: u64, len: u64, extent: Extent, flags: FragFlags) -> Self {
        Self {
            vbo,
            len,
            extent,
            flags,
        }
    }

    /// Empty marker at `vbo`: nothing mapped, nothing cached.
    pub fn none(vbo: u64) -> Self {
        Self::new(vbo, 0, Extent::Hole, FragFlags::empty())
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn end(&self) -> u64 {
        self.vbo + self.len
    }

    #[inline]
    pub fn covers(&self, vbo: u64) -> bool {
        self.vbo <= vbo && vbo < self.end()
    }

    /// Bytes left in the fragment from `vbo` on; 0 when not covered.
    #[inline]
    pub fn remaining(&self, vbo: u64) -> u64 {
        if self.covers(vbo) {
            self.end() - vbo
        } else {
            0
        }
    }

    /// Device address for `vbo`, when the fragment is mapped and covers it.
    pub fn lbo_for(&self, vbo: u64) -> Option<u64> {
        match self.extent {
            Extent::Mapped { lbo } if self.covers(vbo) => Some(lbo + (vbo - self.vbo)),
            _ => None,
        }
    }
}

/// The `valid <= size` pair plus physically reserved bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileSizes {
    /// Prefix of the file known to contain initialized bytes.
    pub valid: u64,
    /// Logical file size.
    pub size: u64,
    /// Bytes physically reserved by the engine.
    pub allocated: u64,
}

/// Per-file metadata returned by `FsEngine::open`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileAttr {
    pub valid: u64,
    pub size: u64,
    pub allocated: u64,
    pub sparse: bool,
    pub compressed: bool,
    pub encrypted: bool,
}

impl FileAttr {
    pub fn sizes(&self) -> FileSizes {
        FileSizes {
            valid: self.valid,
            size: self.size,
            allocated: self.allocated,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MapResult {
    pub fragment: Fragment,
    /// Total bytes reserved for the file after this call.
    pub allocated: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct WriteResult {
    pub written: u64,
    pub allocated: u64,
}

/// Blocking engine interface.
///
/// Calls may sleep on physical I/O. Every method except `is_dirty` must be
/// reached through the volume lock; the crate enforces this internally by
/// routing engine access through the lock guard.
pub trait FsEngine: Send + Sync + 'static {
    /// First engine-level open; loads metadata for the file.
    fn open(&self, file: FileId) -> Result<(EngineHandle, FileAttr)>;

    /// Final close; the handle is dead afterwards.
    fn close(&self, handle: EngineHandle) -> Result<()>;

    /// Fragment covering `vbo`. `create` requests materialization of at
    /// least `len` bytes; without it the engine only reports what exists.
    /// A zero-length fragment with no error means nothing is mapped there.
    fn map(&self, handle: EngineHandle, vbo: u64, len: u64, create: bool) -> Result<MapResult>;

    /// Content read for resident/compressed/encrypted ranges.
    fn read(&self, handle: EngineHandle, vbo: u64, buf: &mut [u8]) -> Result<u64>;

    /// Content write for resident/compressed/encrypted ranges.
    fn write(&self, handle: EngineHandle, vbo: u64, data: &[u8]) -> Result<WriteResult>;

    /// Grow or shrink the file; returns the new reserved byte count.
    /// Fails with `FileTooBig` beyond the format maximum.
    fn resize(&self, handle: EngineHandle, new_size: u64) -> Result<u64>;

    /// Metadata write-back of the size triple (close/fsync/drain paths).
    fn update_sizes(&self, handle: EngineHandle, sizes: FileSizes) -> Result<()>;

    /// Volume-level flush. `wait` requests completion on stable storage.
    fn flush(&self, wait: bool) -> Result<()>;

    /// Cheap dirtiness probe; may be called without the volume lock.
    fn is_dirty(&self) -> bool;
}

/// Shared engines work anywhere an engine does.
impl<E: FsEngine + ?Sized> FsEngine for Arc<E> {
    fn open(&self, file: FileId) -> Result<(EngineHandle, FileAttr)> {
        (**self).open(file)
    }

    fn close(&self, handle: EngineHandle) -> Result<()> {
        (**self).close(handle)
    }

    fn map(&self, handle: EngineHandle, vbo: u64, len: u64, create: bool) -> Result<MapResult> {
        (**self).map(handle, vbo, len, create)
    }

    fn read(&self, handle: EngineHandle, vbo: u64, buf: &mut [u8]) -> Result<u64> {
        (**self).read(handle, vbo, buf)
    }

    fn write(&self, handle: EngineHandle, vbo: u64, data: &[u8]) -> Result<WriteResult> {
        (**self).write(handle, vbo, data)
    }

    fn resize(&self, handle: EngineHandle, new_size: u64) -> Result<u64> {
        (**self).resize(handle, new_size)
    }

    fn update_sizes(&self, handle: EngineHandle, sizes: FileSizes) -> Result<()> {
        (**self).update_sizes(handle, sizes)
    }

    fn flush(&self, wait: bool) -> Result<()> {
        (**self).flush(wait)
    }

    fn is_dirty(&self) -> bool {
        (**self).is_dirty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_address_math() {
        let frag = Fragment::new(
            8192,
            4096,
            Extent::Mapped { lbo: 65536 },
            FragFlags::empty(),
        );
        assert!(frag.covers(8192));
        assert!(frag.covers(12287));
        assert!(!frag.covers(12288));
        assert_eq!(frag.lbo_for(8192), Some(65536));
        assert_eq!(frag.lbo_for(10000), Some(65536 + 1808));
        assert_eq!(frag.remaining(10000), 2288);
        assert_eq!(frag.remaining(4096), 0);
    }

    #[test]
    fn non_mapped_fragments_have_no_address() {
        let frag = Fragment::new(0, 4096, Extent::Hole, FragFlags::empty());
        assert_eq!(frag.lbo_for(0), None);
        assert!(!frag.extent.is_mapped());
    }

    #[test]
    fn flags_preserve_unknown_bits() {
        let mut flags = FragFlags::from_bits(0x8000_0001);
        assert!(flags.contains(FragFlags::NEW_ALLOCATED));
        flags.remove(FragFlags::NEW_ALLOCATED);
        assert_eq!(flags.bits(), 0x8000_0000);
        flags.insert(FragFlags::CLONED);
        assert!(flags.contains(FragFlags::CLONED));
    }
}
