//! Block-mapping cache, valid-size tracking and I/O dispatch for
//! engine-backed volumes.
//!
//! The crate sits between a host (kernel shim, FUSE adapter, test harness)
//! and a filesystem engine that owns the on-disk format. Per open file it
//! caches vbo-to-lbo translations and tracks the initialized prefix, plans
//! reads and writes into device/engine/zero segments, serializes every
//! engine call behind one volume lock, and flushes dirty engine state from
//! a debounced background thread. Mapped runs are validated against the
//! device end before any I/O is issued against them.

pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod io;
pub mod volume;

mod file;
mod utils;

pub use config::VolumeConfig;
pub use device::{BlockDevice, FileDevice, MemDevice};
pub use engine::{
    EngineHandle, Extent, FileAttr, FileId, FileSizes, FragFlags, Fragment, FsEngine, MapResult,
    WriteResult,
};
pub use error::{FileHint, Result, VolError};
pub use file::FileState;
pub use io::{AccessMode, Completion, IoClass, WritebackBatch};
pub use volume::{Volume, VolumeGuard, VolumeLock};
