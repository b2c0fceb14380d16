//! Per-file single-fragment translation cache.
//!
//! One validated fragment per open file; anything the fragment does not
//! cover goes back to the engine under the volume lock and the result
//! replaces the entry wholesale. Single-entry is deliberate: sequential
//! I/O hits it almost always and there is no eviction policy to get wrong.

use crate::engine::{FragFlags, Fragment};
use parking_lot::RwLock;

pub struct ExtentCache {
    entry: RwLock<Option<Fragment>>,
}

impl ExtentCache {
    pub(crate) fn new() -> Self {
        Self {
            entry: RwLock::new(None),
        }
    }

    /// Cache probe: fragment covering `vbo` with at least `need` bytes left
    /// from there. `need == 0` accepts any covering fragment.
    pub(crate) fn probe(&self, vbo: u64, need: u64) -> Option<Fragment> {
        let entry = self.entry.read();
        match *entry {
            Some(frag) if frag.covers(vbo) && frag.remaining(vbo) >= need => Some(frag),
            _ => None,
        }
    }

    /// Replace the entry with a fresh engine result.
    ///
    /// The stored copy drops NEW_ALLOCATED so the allocation hint is served
    /// to exactly one caller; empty fragments are never cached.
    pub(crate) fn install(&self, fragment: Fragment) {
        if fragment.is_empty() {
            return;
        }
        let mut stored = fragment;
        stored.flags.remove(FragFlags::NEW_ALLOCATED);
        *self.entry.write() = Some(stored);
    }

    pub(crate) fn invalidate(&self) {
        *self.entry.write() = None;
    }

    /// Drop the entry when the file shrank below any part of it.
    pub(crate) fn trim(&self, new_size: u64) {
        let mut entry = self.entry.write();
        if let Some(frag) = *entry {
            if frag.end() > new_size {
                *entry = None;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn cached(&self) -> Option<Fragment> {
        *self.entry.read()
    }
}
