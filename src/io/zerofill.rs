//! Valid-size extension by zeroing.
//!
//! Everything between `valid` and the requested point gets written as zeros
//! through the caller's ordinary write path, one page window at a time, and
//! `valid` advances only behind completed windows. Sparse holes already read
//! as zeros and are skipped outright unless the caller forces allocation.

use crate::engine::{Extent, Fragment};
use crate::error::Result;
use crate::file::sizes::SizeTracker;

/// Zeroing window; per-window writes keep rollback page-accurate.
pub(crate) const ZERO_WINDOW: u64 = 4096;

/// Advance `valid` to `to` (clamped to the file size), zeroing every byte in
/// between. `classify` resolves the fragment at a cluster-aligned position
/// without materializing anything; `write_zeros` pushes a window of zeros
/// through the normal write path. On error `valid` snaps back to where it
/// started so a failed window is never exposed as initialized.
pub(crate) fn extend_valid(
    sizes: &SizeTracker,
    cluster: u64,
    sparse: bool,
    to: u64,
    force: bool,
    mut classify: impl FnMut(u64) -> Result<Fragment>,
    mut write_zeros: impl FnMut(u64, u64) -> Result<()>,
) -> Result<()> {
    let start = sizes.get().valid;
    let to = to.min(sizes.get().size);
    if to <= start {
        return Ok(());
    }
    let mut pos = start;
    let res = loop {
        if pos >= to {
            break Ok(());
        }
        if sparse && !force {
            // A hole is already zeros; skipping it costs one lookup.
            match classify(pos - pos % cluster) {
                Ok(frag) if frag.extent == Extent::Hole && frag.covers(pos) => {
                    pos = frag.end().min(to);
                    sizes.set_valid(pos);
                    continue;
                }
                Ok(_) => {}
                Err(err) => break Err(err),
            }
        }
        let n = (to - pos).min(ZERO_WINDOW - pos % ZERO_WINDOW);
        if let Err(err) = write_zeros(pos, n) {
            break Err(err);
        }
        pos += n;
        sizes.set_valid(pos);
    };
    if res.is_err() {
        // Bytes may have hit the device, but nothing counts as initialized
        // until valid says so.
        sizes.set_valid(start);
    }
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{FileSizes, FragFlags};
    use crate::error::VolError;

    fn tracker(valid: u64, size: u64) -> SizeTracker {
        SizeTracker::new(FileSizes {
            valid,
            size,
            allocated: size,
        })
    }

    fn no_classify(_: u64) -> Result<Fragment> {
        panic!("classify must not be called");
    }

    #[test]
    fn windows_align_to_pages_after_the_first() {
        let sizes = tracker(100, 16384);
        let mut windows = Vec::new();
        extend_valid(&sizes, 4096, false, 8202, false, no_classify, |vbo, len| {
            windows.push((vbo, len));
            Ok(())
        })
        .unwrap();
        assert_eq!(windows, vec![(100, 3996), (4096, 4096), (8192, 10)]);
        assert_eq!(sizes.get().valid, 8202);
    }

    #[test]
    fn holes_satisfy_the_range_without_writes() {
        let sizes = tracker(0, 65536);
        let mut writes = 0;
        extend_valid(
            &sizes,
            4096,
            true,
            65536,
            false,
            |vbo| Ok(Fragment::new(vbo, 65536 - vbo, Extent::Hole, FragFlags::empty())),
            |_, _| {
                writes += 1;
                Ok(())
            },
        )
        .unwrap();
        assert_eq!(writes, 0);
        assert_eq!(sizes.get().valid, 65536);
    }

    #[test]
    fn force_materializes_instead_of_skipping() {
        let sizes = tracker(0, 8192);
        let mut writes = 0;
        extend_valid(&sizes, 4096, true, 8192, true, no_classify, |_, _| {
            writes += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(writes, 2);
    }

    #[test]
    fn error_rolls_valid_back_to_the_start() {
        let sizes = tracker(4096, 32768);
        let mut windows = 0;
        let err = extend_valid(&sizes, 4096, false, 32768, false, no_classify, |_, _| {
            windows += 1;
            if windows == 3 {
                Err(VolError::IoError)
            } else {
                Ok(())
            }
        })
        .unwrap_err();
        assert_eq!(err, VolError::IoError);
        assert_eq!(sizes.get().valid, 4096);
    }

    #[test]
    fn already_initialized_range_is_a_no_op() {
        let sizes = tracker(8192, 8192);
        extend_valid(&sizes, 4096, false, 4096, false, no_classify, |_, _| {
            panic!("no writes expected")
        })
        .unwrap();
        assert_eq!(sizes.get().valid, 8192);
    }

    #[test]
    fn target_clamps_to_the_file_size() {
        let sizes = tracker(0, 6000);
        let mut windows = Vec::new();
        extend_valid(&sizes, 4096, false, 1 << 30, false, no_classify, |vbo, len| {
            windows.push((vbo, len));
            Ok(())
        })
        .unwrap();
        assert_eq!(windows, vec![(0, 4096), (4096, 1904)]);
        assert_eq!(sizes.get().valid, 6000);
    }
}
