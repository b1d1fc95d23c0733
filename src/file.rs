//! Backing-file abstraction. Grounded on `treedb`'s `pager::File` trait and
//! its `mock::MemoryFile` test double; extended here with a real
//! positioned-I/O implementation over `std::fs::File` since the pack always
//! does random-access reads/writes by page position, never sequential ones.

use crate::error::{Error, IoKind, Result};
use parking_lot::Mutex;
use std::fs;
use std::sync::Arc;

pub trait File: Send + Sync {
    fn len(&self) -> Result<u64>;
    fn set_len(&self, len: u64) -> Result<()>;
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()>;
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<()>;
    fn sync_data(&self) -> Result<()>;
}

/// A real on-disk file, read and written via positioned syscalls so no
/// separate cursor/lock is needed between concurrent mutators.
pub struct OsFile {
    inner: fs::File,
}

impl OsFile {
    pub fn new(inner: fs::File) -> Self {
        Self { inner }
    }
}

#[cfg(unix)]
impl File for OsFile {
    fn len(&self) -> Result<u64> {
        self.inner
            .metadata()
            .map(|m| m.len())
            .map_err(|e| Error::io(IoKind::Size, e))
    }

    fn set_len(&self, len: u64) -> Result<()> {
        self.inner
            .set_len(len)
            .map_err(|e| Error::io(IoKind::Truncate, e))
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        use std::os::unix::fs::FileExt;
        self.inner
            .read_exact_at(buf, offset)
            .map_err(|e| Error::io(IoKind::Read, e))
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        use std::os::unix::fs::FileExt;
        self.inner
            .write_all_at(buf, offset)
            .map_err(|e| Error::io(IoKind::Write, e))
    }

    fn sync_data(&self) -> Result<()> {
        self.inner
            .sync_data()
            .map_err(|e| Error::io(IoKind::Force, e))
    }
}

/// In-memory file used by tests. Grounded on `pager/test.rs`'s
/// `mock::MemoryFile`: cloning shares the same backing buffer, which is what
/// lets a test close and "reopen" a pack without touching disk.
#[derive(Clone, Default)]
pub struct MemoryFile {
    data: Arc<Mutex<Vec<u8>>>,
}

impl MemoryFile {
    pub fn new() -> Self {
        Self::default()
    }
}

impl File for MemoryFile {
    fn len(&self) -> Result<u64> {
        Ok(self.data.lock().len() as u64)
    }

    fn set_len(&self, len: u64) -> Result<()> {
        self.data.lock().resize(len as usize, 0);
        Ok(())
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let data = self.data.lock();
        let offset = offset as usize;
        let end = offset + buf.len();
        if end > data.len() {
            return Err(Error::io(
                IoKind::Read,
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "read past end of file"),
            ));
        }
        buf.copy_from_slice(&data[offset..end]);
        Ok(())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        let mut data = self.data.lock();
        let offset = offset as usize;
        let end = offset + buf.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
        Ok(())
    }

    fn sync_data(&self) -> Result<()> {
        Ok(())
    }
}
