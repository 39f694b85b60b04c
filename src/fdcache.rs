//! Single-slot file descriptor cache.
//!
//! Consecutive work items are very often chunks of the same file; caching
//! one open source descriptor and one open destination descriptor per
//! worker avoids an open/close pair per chunk. A descriptor opened for
//! write is fsynced before it is replaced or dropped.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crate::error::{io_err, ArchiveError};

/// Positional copy of `len` bytes between two descriptors. Returns the
/// bytes copied, which is less than `len` only when the source ends early.
pub(crate) fn copy_range(
    src: &File,
    dst: &File,
    src_off: u64,
    dst_off: u64,
    len: u64,
    buf: &mut [u8],
) -> std::io::Result<u64> {
    let mut copied = 0u64;
    while copied < len {
        let step = buf.len().min((len - copied) as usize);
        let n = src.read_at(&mut buf[..step], src_off + copied)?;
        if n == 0 {
            break;
        }
        dst.write_all_at(&buf[..n], dst_off + copied)?;
        copied += n as u64;
    }
    Ok(copied)
}

#[derive(Default)]
pub struct FdCache {
    name: Option<PathBuf>,
    write: bool,
    file: Option<File>,
}

impl FdCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a descriptor for `path` opened in the requested mode, reusing
    /// the cached one when both the name and the mode match.
    pub fn open(&mut self, path: &Path, write: bool) -> Result<&File, ArchiveError> {
        let hit =
            self.file.is_some() && self.name.as_deref() == Some(path) && self.write == write;
        if !hit {
            self.close()?;
            let file = if write {
                OpenOptions::new()
                    .write(true)
                    .create(true)
                    .open(path)
                    .map_err(|e| io_err(e, path))?
            } else {
                File::open(path).map_err(|e| io_err(e, path))?
            };
            self.name = Some(path.to_path_buf());
            self.write = write;
            self.file = Some(file);
        }
        Ok(self.file.as_ref().expect("descriptor cached above"))
    }

    /// Close the cached descriptor, fsyncing first if it was open for write.
    pub fn close(&mut self) -> Result<(), ArchiveError> {
        if let Some(file) = self.file.take() {
            if self.write {
                if let Some(name) = &self.name {
                    file.sync_all().map_err(|e| io_err(e, name))?;
                }
            }
        }
        self.name = None;
        Ok(())
    }
}

impl Drop for FdCache {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn cache_hit_keeps_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        std::fs::write(&a, b"hello").unwrap();

        let mut cache = FdCache::new();
        let fd1 = {
            use std::os::unix::io::AsRawFd;
            cache.open(&a, false).unwrap().as_raw_fd()
        };
        let fd2 = {
            use std::os::unix::io::AsRawFd;
            cache.open(&a, false).unwrap().as_raw_fd()
        };
        assert_eq!(fd1, fd2);
    }

    #[test]
    fn mode_change_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        std::fs::write(&a, b"hello").unwrap();

        let mut cache = FdCache::new();
        cache.open(&a, false).unwrap();
        {
            let mut w = cache.open(&a, true).unwrap();
            w.write_all(b"HELLO").unwrap();
        }
        cache.close().unwrap();
        assert_eq!(std::fs::read(&a).unwrap(), b"HELLO");
    }

    #[test]
    fn different_path_evicts_old_slot() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        std::fs::write(&a, b"a").unwrap();
        std::fs::write(&b, b"b").unwrap();

        let mut cache = FdCache::new();
        cache.open(&a, false).unwrap();
        cache.open(&b, false).unwrap();
        use std::io::Read;
        let mut contents = String::new();
        cache.open(&b, false).unwrap().take(8).read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "b");
    }
}
