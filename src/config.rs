//! Volume-open configuration.
//!
//! Option parsing is the host's problem; by the time a volume is opened the
//! choices arrive here as a pre-resolved struct.

use std::time::Duration;

/// Default cluster size (4 KiB).
pub const DEFAULT_CLUSTER_SIZE: u32 = 4 * 1024;
/// Default quiet window before the background flush fires.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(5);
/// Default per-file size ceiling (16 TiB).
pub const DEFAULT_MAX_FILE_SIZE: u64 = 16 * 1024 * 1024 * 1024 * 1024;
/// Default per-file size ceiling for sparse files (256 TiB).
pub const DEFAULT_MAX_FILE_SIZE_SPARSE: u64 = 256 * 1024 * 1024 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct VolumeConfig {
    /// Name comparison mode for engines with a namespace.
    pub case_sensitive: bool,
    /// Allow discard/trim hints when backing runs are freed.
    pub discard_enabled: bool,
    /// Quiet window after the last dirty mark before the flush thread fires.
    pub debounce: Duration,
    /// Resize beyond this fails with FileTooBig before any engine call.
    pub max_file_size: u64,
    /// Separate ceiling for sparse files (hole-dominated layouts allow more).
    pub max_file_size_sparse: u64,
    /// Allocation granularity; drives hole-skip alignment in zero-fill.
    pub cluster_size: u32,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            case_sensitive: true,
            discard_enabled: false,
            debounce: DEFAULT_DEBOUNCE,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_file_size_sparse: DEFAULT_MAX_FILE_SIZE_SPARSE,
            cluster_size: DEFAULT_CLUSTER_SIZE,
        }
    }
}

#[allow(dead_code)]
impl VolumeConfig {
    pub fn case_sensitive(self, case_sensitive: bool) -> Self {
        Self {
            case_sensitive,
            ..self
        }
    }

    pub fn discard_enabled(self, discard_enabled: bool) -> Self {
        Self {
            discard_enabled,
            ..self
        }
    }

    pub fn debounce(self, debounce: Duration) -> Self {
        Self { debounce, ..self }
    }

    pub fn max_file_size(self, max_file_size: u64) -> Self {
        Self {
            max_file_size,
            ..self
        }
    }

    pub fn max_file_size_sparse(self, max_file_size_sparse: u64) -> Self {
        Self {
            max_file_size_sparse,
            ..self
        }
    }

    pub fn cluster_size(self, cluster_size: u32) -> Self {
        debug_assert!(cluster_size.is_power_of_two());
        Self {
            cluster_size,
            ..self
        }
    }
}

impl VolumeConfig {
    /// Size ceiling that applies to a given file layout.
    pub(crate) fn size_limit(&self, sparse: bool) -> u64 {
        if sparse {
            self.max_file_size_sparse
        } else {
            self.max_file_size
        }
    }
}
