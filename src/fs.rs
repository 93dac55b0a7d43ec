// File and directory references held by processes and mappings
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use spin::Mutex;

/// Errors reported by a backing file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileError {
    NotReadable,
    IoError,
}

impl fmt::Display for FileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FileError::NotReadable => write!(f, "file not open for reading"),
            FileError::IoError => write!(f, "I/O error"),
        }
    }
}

/// Read capability of an open file, supplied by the file system layer.
pub trait File: Send + Sync {
    /// Reads up to `buf.len()` bytes starting at `offset`; returns the number of
    /// bytes read, 0 at end of file.
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, FileError>;

    fn readable(&self) -> bool;

    fn writable(&self) -> bool;
}

/// Directory reference (a process's working directory)
pub trait Inode: Send + Sync {
    fn inum(&self) -> u32;
}

/// Shared open-file reference; cloning is `filedup`, dropping is `fileclose`.
pub type FileRef = Arc<dyn File>;

/// Shared directory reference; cloning is `idup`, dropping is `iput`.
pub type InodeRef = Arc<dyn Inode>;

/// In-memory file used by the hosted build and tests
pub struct MemFile {
    data: Mutex<Vec<u8>>,
    readable: bool,
    writable: bool,
    failing: bool,
}

impl MemFile {
    pub fn new(data: &[u8], readable: bool, writable: bool) -> Self {
        Self {
            data: Mutex::new(data.to_vec()),
            readable,
            writable,
            failing: false,
        }
    }

    /// A readable file whose every read fails with `IoError`
    pub fn failing(data: &[u8]) -> Self {
        Self {
            failing: true,
            ..Self::new(data, true, true)
        }
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl File for MemFile {
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, FileError> {
        if !self.readable {
            return Err(FileError::NotReadable);
        }
        if self.failing {
            return Err(FileError::IoError);
        }
        let data = self.data.lock();
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn readable(&self) -> bool {
        self.readable
    }

    fn writable(&self) -> bool {
        self.writable
    }
}

/// In-memory directory inode
pub struct MemInode {
    inum: u32,
}

impl MemInode {
    pub fn new(inum: u32) -> Self {
        Self { inum }
    }
}

impl Inode for MemInode {
    fn inum(&self) -> u32 {
        self.inum
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_at_clamps_to_end_of_file() {
        let file = MemFile::new(b"hello world", true, false);
        let mut buf = [0u8; 8];
        assert_eq!(file.read_at(6, &mut buf), Ok(5));
        assert_eq!(&buf[..5], b"world");
        assert_eq!(file.read_at(64, &mut buf), Ok(0));
    }

    #[test]
    fn unreadable_and_failing_files_report_errors() {
        let mut buf = [0u8; 4];
        let write_only = MemFile::new(b"data", false, true);
        assert_eq!(write_only.read_at(0, &mut buf), Err(FileError::NotReadable));
        let broken = MemFile::failing(b"data");
        assert_eq!(broken.read_at(0, &mut buf), Err(FileError::IoError));
    }
}
