//! Valid-size tracking.
//!
//! `valid` is the prefix of the file known to contain initialized bytes;
//! everything between `valid` and `size` reads as zeros and must never be
//! served from the device. The three scalars swap under a dedicated rwlock
//! held only for the swap itself, never across an engine call, so a size
//! probe cannot block an extent lookup and vice versa.

use crate::engine::FileSizes;
use parking_lot::RwLock;

pub struct SizeTracker {
    inner: RwLock<FileSizes>,
}

impl SizeTracker {
    pub(crate) fn new(sizes: FileSizes) -> Self {
        debug_assert!(sizes.valid <= sizes.size);
        Self {
            inner: RwLock::new(sizes),
        }
    }

    pub fn get(&self) -> FileSizes {
        *self.inner.read()
    }

    /// Move `valid`, forward or back (zero-fill rollback), clamped to size.
    pub(crate) fn set_valid(&self, valid: u64) {
        let mut s = self.inner.write();
        s.valid = valid.min(s.size);
    }

    /// Forward-only variant used by write completion paths.
    pub(crate) fn advance_valid(&self, to: u64) {
        let mut s = self.inner.write();
        s.valid = s.valid.max(to.min(s.size));
    }

    /// Grow `size` when a write lands past the current end. Never shrinks;
    /// shrinking goes through `update_after_resize` so `valid` gets clamped.
    pub(crate) fn extend_size(&self, end: u64) {
        let mut s = self.inner.write();
        s.size = s.size.max(end);
    }

    /// Engine-reported total after a map/write call; authoritative.
    pub(crate) fn set_allocated(&self, allocated: u64) {
        let mut s = self.inner.write();
        s.allocated = allocated;
    }

    /// Shrink clamps `valid` first; growth leaves it where it was, the newly
    /// exposed range stays un-initialized until zero-fill advances it.
    pub(crate) fn update_after_resize(&self, new_size: u64, new_allocated: u64) -> FileSizes {
        let mut s = self.inner.write();
        if new_size < s.size {
            s.valid = s.valid.min(new_size);
        }
        s.size = new_size;
        s.allocated = new_allocated;
        *s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn tracker(valid: u64, size: u64) -> SizeTracker {
        SizeTracker::new(FileSizes {
            valid,
            size,
            allocated: size,
        })
    }

    #[test]
    fn shrink_clamps_valid_grow_leaves_it() {
        let t = tracker(500, 1000);
        t.update_after_resize(200, 200);
        let s = t.get();
        assert_eq!(s.size, 200);
        assert_eq!(s.valid, 200);

        t.update_after_resize(10_000, 10_000);
        let s = t.get();
        assert_eq!(s.size, 10_000);
        assert_eq!(s.valid, 200);
    }

    #[test]
    fn shrink_monotonicity_randomized() {
        let mut rng = rand::rng();
        for _ in 0..200 {
            let size = rng.random_range(1..1 << 20);
            let valid = rng.random_range(0..=size);
            let t = tracker(valid, size);
            let new_size = rng.random_range(0..size);
            t.update_after_resize(new_size, new_size);
            let s = t.get();
            assert_eq!(s.size, new_size);
            assert!(s.valid <= new_size);
            assert!(s.valid <= valid);
        }
    }

    #[test]
    fn set_valid_clamps_to_size() {
        let t = tracker(0, 100);
        t.set_valid(5000);
        assert_eq!(t.get().valid, 100);
        t.set_valid(10);
        assert_eq!(t.get().valid, 10);
    }

    #[test]
    fn advance_valid_never_moves_back() {
        let t = tracker(50, 100);
        t.advance_valid(20);
        assert_eq!(t.get().valid, 50);
        t.advance_valid(80);
        assert_eq!(t.get().valid, 80);
    }

    #[test]
    fn extend_size_grows_only() {
        let t = tracker(50, 100);
        t.extend_size(40);
        assert_eq!(t.get().size, 100);
        t.extend_size(300);
        let s = t.get();
        assert_eq!(s.size, 300);
        assert_eq!(s.valid, 50);
    }
}
