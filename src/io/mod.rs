//! I/O planning and write-back machinery.
//!
//! `classify` turns byte ranges into executable plans, `zerofill` advances
//! the valid size, `writeback` tracks batched device submissions. Planning
//! is pure; execution lives with the volume.

pub(crate) mod classify;
pub(crate) mod writeback;
pub(crate) mod zerofill;

pub use classify::{AccessMode, IoClass};
pub use writeback::{Completion, WritebackBatch};
