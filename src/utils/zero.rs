use bytes::Bytes;
use std::sync::LazyLock;

/// Preallocated zero range so zero-fill never allocates per window.
pub(crate) static ZEROS: LazyLock<Bytes> = LazyLock::new(|| Bytes::from(vec![0_u8; 1024 * 1024]));

/// A zero slice of exactly `len` bytes; `len` must fit the shared buffer.
pub(crate) fn zero_slice(len: usize) -> Bytes {
    debug_assert!(len <= ZEROS.len());
    ZEROS.slice(0..len)
}
