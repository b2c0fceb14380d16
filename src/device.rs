//! Block device access for mapped extents.
//!
//! Only plain mapped runs go through here; resident/compressed/encrypted
//! content always moves through the engine. Buffered paths use the
//! synchronous calls, the batched write-back path goes through
//! `submit_write` and a [`WritebackBatch`](crate::io::WritebackBatch)
//! completion, which devices may finish from any thread in any order.

use crate::error::{Result, VolError};
use crate::io::Completion;
use bytes::Bytes;
use parking_lot::Mutex;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

pub trait BlockDevice: Send + Sync + 'static {
    /// Physical capacity in bytes; mapped runs are validated against this.
    fn len_bytes(&self) -> u64;

    fn read_at(&self, lbo: u64, buf: &mut [u8]) -> Result<()>;

    fn write_at(&self, lbo: u64, data: &[u8]) -> Result<()>;

    fn sync(&self) -> Result<()>;

    /// Queue one write of a batch. The default completes inline; devices
    /// with real queues finish from their own context.
    fn submit_write(&self, lbo: u64, data: Bytes, done: Completion) {
        done.finish(self.write_at(lbo, &data));
    }
}

struct MemDeviceInner {
    data: Mutex<Vec<u8>>,
    len: u64,
    reads: AtomicU64,
    writes: AtomicU64,
    fail_writes: AtomicBool,
    scatter: AtomicBool,
}

/// RAM-backed device for tests and local development.
///
/// Counts every read/write, can inject write failures, and with `scatter`
/// enabled completes submitted writes from spawned threads so batches see
/// arbitrary completion order.
#[derive(Clone)]
pub struct MemDevice {
    inner: Arc<MemDeviceInner>,
}

impl MemDevice {
    pub fn new(len: u64) -> Self {
        Self {
            inner: Arc::new(MemDeviceInner {
                data: Mutex::new(vec![0_u8; len as usize]),
                len,
                reads: AtomicU64::new(0),
                writes: AtomicU64::new(0),
                fail_writes: AtomicBool::new(false),
                scatter: AtomicBool::new(false),
            }),
        }
    }

    pub fn reads(&self) -> u64 {
        self.inner.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> u64 {
        self.inner.writes.load(Ordering::SeqCst)
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_scatter(&self, scatter: bool) {
        self.inner.scatter.store(scatter, Ordering::SeqCst);
    }

    /// Copy of the device bytes at `[lbo, lbo+len)`.
    pub fn snapshot(&self, lbo: u64, len: usize) -> Vec<u8> {
        let data = self.inner.data.lock();
        data[lbo as usize..lbo as usize + len].to_vec()
    }
}

impl BlockDevice for MemDevice {
    fn len_bytes(&self) -> u64 {
        self.inner.len
    }

    fn read_at(&self, lbo: u64, buf: &mut [u8]) -> Result<()> {
        let end = lbo as usize + buf.len();
        let data = self.inner.data.lock();
        if end > data.len() {
            return Err(VolError::IoError);
        }
        buf.copy_from_slice(&data[lbo as usize..end]);
        self.inner.reads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn write_at(&self, lbo: u64, data: &[u8]) -> Result<()> {
        if self.inner.fail_writes.load(Ordering::SeqCst) {
            return Err(VolError::IoError);
        }
        let end = lbo as usize + data.len();
        let mut dst = self.inner.data.lock();
        if end > dst.len() {
            return Err(VolError::IoError);
        }
        dst[lbo as usize..end].copy_from_slice(data);
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn submit_write(&self, lbo: u64, data: Bytes, done: Completion) {
        if self.inner.scatter.load(Ordering::SeqCst) {
            let dev = self.clone();
            std::thread::spawn(move || done.finish(dev.write_at(lbo, &data)));
        } else {
            done.finish(self.write_at(lbo, &data));
        }
    }
}

/// Device backed by a regular file (pread/pwrite).
pub struct FileDevice {
    file: File,
    len: u64,
}

impl FileDevice {
    pub fn new(file: File) -> Result<Self> {
        let len = file.metadata()?.len();
        Ok(Self { file, len })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)?;
        Self::new(file)
    }
}

impl BlockDevice for FileDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_at(&self, lbo: u64, buf: &mut [u8]) -> Result<()> {
        self.file.read_exact_at(buf, lbo)?;
        Ok(())
    }

    fn write_at(&self, lbo: u64, data: &[u8]) -> Result<()> {
        self.file.write_all_at(data, lbo)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::WritebackBatch;

    #[test]
    fn mem_device_round_trip() {
        let dev = MemDevice::new(64 * 1024);
        dev.write_at(4096, b"hello").unwrap();
        let mut buf = [0_u8; 5];
        dev.read_at(4096, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(dev.writes(), 1);
        assert_eq!(dev.reads(), 1);
    }

    #[test]
    fn mem_device_rejects_out_of_range() {
        let dev = MemDevice::new(4096);
        assert!(matches!(
            dev.write_at(4000, &[0_u8; 200]),
            Err(VolError::IoError)
        ));
        let mut buf = [0_u8; 200];
        assert!(dev.read_at(4000, &mut buf).is_err());
    }

    #[test]
    fn scattered_submissions_complete_in_any_order() {
        let dev = MemDevice::new(1024 * 1024);
        dev.set_scatter(true);
        let batch = WritebackBatch::new();
        for i in 0..16_u64 {
            dev.submit_write(
                i * 4096,
                Bytes::from(vec![i as u8; 4096]),
                batch.completion(),
            );
        }
        batch.wait().unwrap();
        assert_eq!(dev.writes(), 16);
        assert_eq!(dev.snapshot(5 * 4096, 1)[0], 5);
    }

    #[test]
    fn file_device_round_trip() {
        let file = tempfile::tempfile().unwrap();
        file.set_len(1024 * 1024).unwrap();
        let dev = FileDevice::new(file).unwrap();
        assert_eq!(dev.len_bytes(), 1024 * 1024);
        dev.write_at(8192, b"volio").unwrap();
        dev.sync().unwrap();
        let mut buf = [0_u8; 5];
        dev.read_at(8192, &mut buf).unwrap();
        assert_eq!(&buf, b"volio");
    }
}
