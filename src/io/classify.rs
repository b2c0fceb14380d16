//! Byte-range classification and I/O planning.
//!
//! Given the fragment covering each position, a requested range becomes a
//! plan: device segments for plain mapped runs (coalesced while contiguous
//! in both file and device space), engine segments for resident/compressed
//! content, zero segments for holes and for anything past the valid size.
//! Planning is pure; the volume executes the segments.

use crate::engine::{Extent, FileId, FileSizes, FragFlags, Fragment};
use crate::error::{Result, VolError};

/// How the host intends to touch file content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Buffered,
    Direct,
    Mmap,
}

/// What the leading bytes of a range map to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoClass {
    /// Unallocated; reads as zeros.
    Hole,
    /// Content lives in engine metadata.
    Resident,
    /// Only the engine can move this content.
    Compressed,
    /// Refused at this layer entirely.
    Encrypted,
    /// Contiguous device run.
    Mapped { lbo: u64, len: u64 },
}

impl IoClass {
    /// Classification of `[vbo, vbo+len)` per the fragment covering its
    /// first byte. `len == 0` reports the full remaining run.
    pub(crate) fn of(frag: &Fragment, vbo: u64, len: u64) -> Self {
        if frag.is_empty() || !frag.covers(vbo) {
            return IoClass::Hole;
        }
        match frag.extent {
            Extent::Hole => IoClass::Hole,
            Extent::Resident => IoClass::Resident,
            Extent::Compressed => IoClass::Compressed,
            Extent::Encrypted => IoClass::Encrypted,
            Extent::Mapped { .. } => match frag.lbo_for(vbo) {
                Some(lbo) => {
                    let run = frag.remaining(vbo);
                    let run = if len > 0 { run.min(len) } else { run };
                    IoClass::Mapped { lbo, len: run }
                }
                None => IoClass::Hole,
            },
        }
    }
}

/// Whether a layout admits an access mode. Encrypted content never crosses
/// this crate (key material stays in the engine); compressed content cannot
/// be mapped or read raw because device bytes differ from file bytes.
pub(crate) fn access_allowed(mode: AccessMode, compressed: bool, encrypted: bool) -> bool {
    match mode {
        AccessMode::Buffered => !encrypted,
        AccessMode::Direct | AccessMode::Mmap => !encrypted && !compressed,
    }
}

/// One executable step of a read plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadSeg {
    /// Device read of a mapped run.
    Device { vbo: u64, lbo: u64, len: u64 },
    /// Engine content read (resident/compressed).
    Engine { vbo: u64, len: u64 },
    /// Fill the destination with zeros; no I/O.
    Zero { vbo: u64, len: u64 },
}

/// One executable step of a write plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteSeg {
    /// Device write of a mapped run.
    Device { vbo: u64, lbo: u64, len: u64 },
    /// Device-level zeroing of freshly allocated clusters the write does
    /// not cover.
    Zeros { lbo: u64, len: u64 },
    /// Engine content write (resident/compressed).
    Engine { vbo: u64, len: u64 },
}

/// Plan a read of `[vbo, vbo+len)`, clamped to the file size.
///
/// The valid size splits the range: everything past it zero-fills without
/// touching the device, whatever the mapping says. `lookup` resolves the
/// fragment covering a position and may go to the engine on a cache miss.
pub(crate) fn plan_read(
    file: FileId,
    sizes: FileSizes,
    cluster: u64,
    vbo: u64,
    len: u64,
    mut lookup: impl FnMut(u64) -> Result<Fragment>,
) -> Result<Vec<ReadSeg>> {
    let end = (vbo + len).min(sizes.size);
    if vbo >= end {
        return Ok(Vec::new());
    }
    let valid_end = end.min(sizes.valid);
    let mut plan = Vec::new();
    let mut pos = vbo;
    while pos < valid_end {
        let frag = lookup(pos)?;
        if frag.is_empty() {
            // Nothing mapped here; step to the next cluster boundary so a
            // later run is not skipped.
            let step = (cluster - pos % cluster).min(valid_end - pos);
            push_zero(&mut plan, pos, step);
            pos += step;
            continue;
        }
        let take = frag.remaining(pos).min(valid_end - pos);
        if take == 0 {
            return Err(VolError::corruption(file));
        }
        match frag.extent {
            Extent::Encrypted => return Err(VolError::NotSupported),
            Extent::Hole => push_zero(&mut plan, pos, take),
            Extent::Resident | Extent::Compressed => {
                plan.push(ReadSeg::Engine { vbo: pos, len: take });
            }
            Extent::Mapped { .. } => {
                if let Some(lbo) = frag.lbo_for(pos) {
                    push_device(&mut plan, pos, lbo, take);
                }
            }
        }
        pos += take;
    }
    if pos < end {
        push_zero(&mut plan, pos, end - pos);
    }
    Ok(plan)
}

/// Plan a write of `[vbo, vbo+len)`.
///
/// `lookup` is called with the bytes still needed and must materialize
/// backing space; a zero-length result means the engine could not. Freshly
/// allocated runs get explicit zeroing segments for the bytes around the
/// write window, emitted before the data segment so stale device content is
/// never reachable through a crash.
pub(crate) fn plan_write(
    file: FileId,
    vbo: u64,
    len: u64,
    mut lookup: impl FnMut(u64, u64) -> Result<Fragment>,
) -> Result<Vec<WriteSeg>> {
    let end = vbo + len;
    let mut plan = Vec::new();
    let mut pos = vbo;
    while pos < end {
        let frag = lookup(pos, end - pos)?;
        if frag.is_empty() {
            return Err(VolError::NoSpace);
        }
        let take = frag.remaining(pos).min(end - pos);
        if take == 0 {
            return Err(VolError::corruption(file));
        }
        match frag.extent {
            Extent::Encrypted => return Err(VolError::NotSupported),
            // Materialization must not come back as a hole.
            Extent::Hole => return Err(VolError::corruption(file)),
            Extent::Resident | Extent::Compressed => {
                plan.push(WriteSeg::Engine { vbo: pos, len: take });
            }
            Extent::Mapped { .. } => {
                if let Some(lbo) = frag.lbo_for(pos) {
                    if frag.flags.contains(FragFlags::NEW_ALLOCATED) {
                        let head = pos - frag.vbo;
                        if head > 0 {
                            plan.push(WriteSeg::Zeros {
                                lbo: lbo - head,
                                len: head,
                            });
                        }
                        let tail = frag.end() - (pos + take);
                        if tail > 0 {
                            plan.push(WriteSeg::Zeros {
                                lbo: lbo + take,
                                len: tail,
                            });
                        }
                    }
                    push_data(&mut plan, pos, lbo, take);
                }
            }
        }
        pos += take;
    }
    Ok(plan)
}

fn push_device(plan: &mut Vec<ReadSeg>, vbo: u64, lbo: u64, len: u64) {
    if let Some(ReadSeg::Device {
        vbo: v,
        lbo: l,
        len: n,
    }) = plan.last_mut()
    {
        if *v + *n == vbo && *l + *n == lbo {
            *n += len;
            return;
        }
    }
    plan.push(ReadSeg::Device { vbo, lbo, len });
}

fn push_zero(plan: &mut Vec<ReadSeg>, vbo: u64, len: u64) {
    if let Some(ReadSeg::Zero { vbo: v, len: n }) = plan.last_mut() {
        if *v + *n == vbo {
            *n += len;
            return;
        }
    }
    plan.push(ReadSeg::Zero { vbo, len });
}

fn push_data(plan: &mut Vec<WriteSeg>, vbo: u64, lbo: u64, len: u64) {
    if let Some(WriteSeg::Device {
        vbo: v,
        lbo: l,
        len: n,
    }) = plan.last_mut()
    {
        if *v + *n == vbo && *l + *n == lbo {
            *n += len;
            return;
        }
    }
    plan.push(WriteSeg::Device { vbo, lbo, len });
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLUSTER: u64 = 4096;

    fn sizes(valid: u64, size: u64) -> FileSizes {
        FileSizes {
            valid,
            size,
            allocated: size,
        }
    }

    fn mapped(vbo: u64, len: u64, lbo: u64) -> Fragment {
        Fragment::new(vbo, len, Extent::Mapped { lbo }, FragFlags::empty())
    }

    /// Lookup over a fixed fragment table; anything uncovered is empty.
    fn table(frags: Vec<Fragment>) -> impl FnMut(u64) -> Result<Fragment> {
        move |vbo| {
            Ok(frags
                .iter()
                .copied()
                .find(|f| f.covers(vbo))
                .unwrap_or_else(|| Fragment::none(vbo)))
        }
    }

    #[test]
    fn read_splits_at_valid_boundary() {
        let plan = plan_read(
            1,
            sizes(4096, 8192),
            CLUSTER,
            0,
            8192,
            table(vec![mapped(0, 8192, 1 << 16)]),
        )
        .unwrap();
        assert_eq!(
            plan,
            vec![
                ReadSeg::Device {
                    vbo: 0,
                    lbo: 1 << 16,
                    len: 4096
                },
                ReadSeg::Zero {
                    vbo: 4096,
                    len: 4096
                },
            ]
        );
    }

    #[test]
    fn physically_contiguous_runs_coalesce() {
        let frags = vec![mapped(0, 4096, 1 << 16), mapped(4096, 4096, (1 << 16) + 4096)];
        let plan = plan_read(1, sizes(8192, 8192), CLUSTER, 0, 8192, table(frags)).unwrap();
        assert_eq!(
            plan,
            vec![ReadSeg::Device {
                vbo: 0,
                lbo: 1 << 16,
                len: 8192
            }]
        );

        // Virtually adjacent but physically apart: two reads.
        let frags = vec![mapped(0, 4096, 1 << 16), mapped(4096, 4096, 1 << 20)];
        let plan = plan_read(1, sizes(8192, 8192), CLUSTER, 0, 8192, table(frags)).unwrap();
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn hole_then_run_then_tail() {
        let frags = vec![
            Fragment::new(0, 4096, Extent::Hole, FragFlags::empty()),
            mapped(4096, 4096, 1 << 20),
        ];
        let plan = plan_read(1, sizes(6144, 16384), CLUSTER, 0, 16384, table(frags)).unwrap();
        assert_eq!(
            plan,
            vec![
                ReadSeg::Zero { vbo: 0, len: 4096 },
                ReadSeg::Device {
                    vbo: 4096,
                    lbo: 1 << 20,
                    len: 2048
                },
                ReadSeg::Zero {
                    vbo: 6144,
                    len: 10240
                },
            ]
        );
    }

    #[test]
    fn unmapped_gaps_merge_into_one_zero_segment() {
        let mut lookups = 0_u32;
        let plan = plan_read(1, sizes(10000, 10000), CLUSTER, 0, 10000, |vbo| {
            lookups += 1;
            Ok(Fragment::none(vbo))
        })
        .unwrap();
        assert_eq!(
            plan,
            vec![ReadSeg::Zero {
                vbo: 0,
                len: 10000
            }]
        );
        assert_eq!(lookups, 3);
    }

    #[test]
    fn encrypted_range_is_refused() {
        let frags = vec![Fragment::new(0, 8192, Extent::Encrypted, FragFlags::empty())];
        let err = plan_read(1, sizes(8192, 8192), CLUSTER, 0, 4096, table(frags)).unwrap_err();
        assert_eq!(err, VolError::NotSupported);
    }

    #[test]
    fn resident_ranges_go_to_the_engine_per_request() {
        let frags = vec![Fragment::new(0, 4096, Extent::Resident, FragFlags::empty())];
        let plan = plan_read(1, sizes(100, 100), CLUSTER, 0, 100, table(frags)).unwrap();
        assert_eq!(plan, vec![ReadSeg::Engine { vbo: 0, len: 100 }]);
    }

    #[test]
    fn write_zeroes_the_edges_of_fresh_allocations() {
        let fresh = Fragment::new(
            0,
            16384,
            Extent::Mapped { lbo: 1 << 20 },
            FragFlags::NEW_ALLOCATED | FragFlags::UNINIT,
        );
        let plan = plan_write(1, 4096, 8192, |_, _| Ok(fresh)).unwrap();
        assert_eq!(
            plan,
            vec![
                WriteSeg::Zeros {
                    lbo: 1 << 20,
                    len: 4096
                },
                WriteSeg::Zeros {
                    lbo: (1 << 20) + 12288,
                    len: 4096
                },
                WriteSeg::Device {
                    vbo: 4096,
                    lbo: (1 << 20) + 4096,
                    len: 8192
                },
            ]
        );
    }

    #[test]
    fn write_to_existing_run_has_no_zeroing() {
        let plan = plan_write(1, 4096, 4096, |_, _| Ok(mapped(0, 16384, 1 << 20))).unwrap();
        assert_eq!(
            plan,
            vec![WriteSeg::Device {
                vbo: 4096,
                lbo: (1 << 20) + 4096,
                len: 4096
            }]
        );
    }

    #[test]
    fn write_with_nothing_materialized_is_no_space() {
        let err = plan_write(1, 0, 4096, |vbo, _| Ok(Fragment::none(vbo))).unwrap_err();
        assert_eq!(err, VolError::NoSpace);
    }

    #[test]
    fn class_of_clamps_mapped_run_to_request() {
        let frag = mapped(0, 16384, 1 << 20);
        assert_eq!(
            IoClass::of(&frag, 4096, 4096),
            IoClass::Mapped {
                lbo: (1 << 20) + 4096,
                len: 4096
            }
        );
        assert_eq!(
            IoClass::of(&frag, 4096, 0),
            IoClass::Mapped {
                lbo: (1 << 20) + 4096,
                len: 12288
            }
        );
        assert_eq!(IoClass::of(&Fragment::none(0), 0, 10), IoClass::Hole);
    }

    #[test]
    fn access_policy_matrix() {
        assert!(access_allowed(AccessMode::Buffered, false, false));
        assert!(access_allowed(AccessMode::Buffered, true, false));
        assert!(!access_allowed(AccessMode::Buffered, false, true));
        assert!(!access_allowed(AccessMode::Direct, true, false));
        assert!(!access_allowed(AccessMode::Mmap, true, false));
        assert!(!access_allowed(AccessMode::Direct, false, true));
        assert!(access_allowed(AccessMode::Mmap, false, false));
    }
}
