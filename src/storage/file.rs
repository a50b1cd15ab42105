//! # File-Backed Storage
//!
//! `FileStorage` implements the [`Storage`] contract over a plain
//! `std::fs::File` using positional I/O (`pread`/`pwrite` on unix,
//! `seek_read`/`seek_write` on windows). There is no memory mapping and no
//! buffering: every read and write goes straight to the file at an explicit
//! offset, so the allocator's write ordering is exactly the ordering the OS
//! sees.
//!
//! ## Durability
//!
//! `write_at` does not sync. Callers that need a durability barrier invoke
//! [`Storage::sync`], which maps to `File::sync_all`.
//!
//! ## Error Handling
//!
//! All fallible operations return `eyre::Result` with the file path and the
//! operation attached as context.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};

use super::Storage;

#[derive(Debug)]
pub struct FileStorage {
    file: File,
    path: PathBuf,
}

impl FileStorage {
    /// Opens `path` read-write, creating it empty if it does not exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .wrap_err_with(|| format!("failed to open heap file '{}'", path.display()))?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Creates `path`, discarding any previous contents.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create heap file '{}'", path.display()))?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(unix)]
    fn read_at_inner(&self, buf: &mut [u8], off: u64) -> std::io::Result<usize> {
        use std::os::unix::fs::FileExt;

        let mut read = 0;
        while read < buf.len() {
            match self.file.read_at(&mut buf[read..], off + read as u64) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(read)
    }

    #[cfg(windows)]
    fn read_at_inner(&self, buf: &mut [u8], off: u64) -> std::io::Result<usize> {
        use std::os::windows::fs::FileExt;

        let mut read = 0;
        while read < buf.len() {
            match self.file.seek_read(&mut buf[read..], off + read as u64) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(read)
    }

    #[cfg(unix)]
    fn write_at_inner(&self, buf: &[u8], off: u64) -> std::io::Result<()> {
        use std::os::unix::fs::FileExt;

        self.file.write_all_at(buf, off)
    }

    #[cfg(windows)]
    fn write_at_inner(&self, buf: &[u8], off: u64) -> std::io::Result<()> {
        use std::os::windows::fs::FileExt;

        let mut written = 0;
        while written < buf.len() {
            match self.file.seek_write(&buf[written..], off + written as u64) {
                Ok(0) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "failed to write whole buffer",
                    ))
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl Storage for FileStorage {
    fn read_at(&self, buf: &mut [u8], off: i64) -> Result<usize> {
        self.read_at_inner(buf, off as u64).wrap_err_with(|| {
            format!(
                "failed to read {} bytes at offset {} from '{}'",
                buf.len(),
                off,
                self.path.display()
            )
        })
    }

    fn write_at(&mut self, buf: &[u8], off: i64) -> Result<()> {
        self.write_at_inner(buf, off as u64).wrap_err_with(|| {
            format!(
                "failed to write {} bytes at offset {} to '{}'",
                buf.len(),
                off,
                self.path.display()
            )
        })
    }

    fn size(&self) -> Result<i64> {
        let metadata = self
            .file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", self.path.display()))?;
        Ok(metadata.len() as i64)
    }

    fn truncate(&mut self, n: i64) -> Result<()> {
        self.file
            .set_len(n as u64)
            .wrap_err_with(|| format!("failed to truncate '{}' to {} bytes", self.path.display(), n))
    }

    fn sync(&mut self) -> Result<()> {
        self.file
            .sync_all()
            .wrap_err_with(|| format!("failed to sync '{}'", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("heap.db");

        let store = FileStorage::open(&path).unwrap();

        assert!(path.exists());
        assert_eq!(store.size().unwrap(), 0);
    }

    #[test]
    fn open_preserves_existing_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("heap.db");

        let mut store = FileStorage::open(&path).unwrap();
        store.write_at(b"hello", 0).unwrap();
        drop(store);

        let store = FileStorage::open(&path).unwrap();
        assert_eq!(store.size().unwrap(), 5);
    }

    #[test]
    fn create_discards_existing_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("heap.db");

        let mut store = FileStorage::open(&path).unwrap();
        store.write_at(b"hello", 0).unwrap();
        drop(store);

        let store = FileStorage::create(&path).unwrap();
        assert_eq!(store.size().unwrap(), 0);
    }

    #[test]
    fn write_beyond_end_extends_file() {
        let dir = tempdir().unwrap();
        let mut store = FileStorage::open(dir.path().join("heap.db")).unwrap();

        store.write_at(&[7u8; 8], 100).unwrap();

        assert_eq!(store.size().unwrap(), 108);
    }

    #[test]
    fn read_at_returns_written_bytes() {
        let dir = tempdir().unwrap();
        let mut store = FileStorage::open(dir.path().join("heap.db")).unwrap();
        store.write_at(&[1, 2, 3, 4], 16).unwrap();

        let mut buf = [0u8; 4];
        let n = store.read_at(&mut buf, 16).unwrap();

        assert_eq!(n, 4);
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn read_at_end_of_file_is_short() {
        let dir = tempdir().unwrap();
        let mut store = FileStorage::open(dir.path().join("heap.db")).unwrap();
        store.write_at(&[9u8; 4], 0).unwrap();

        let mut buf = [0u8; 16];
        let n = store.read_at(&mut buf, 0).unwrap();

        assert_eq!(n, 4);
    }

    #[test]
    fn truncate_shrinks_file() {
        let dir = tempdir().unwrap();
        let mut store = FileStorage::open(dir.path().join("heap.db")).unwrap();
        store.write_at(&[0u8; 4096], 0).unwrap();

        store.truncate(256).unwrap();

        assert_eq!(store.size().unwrap(), 256);
    }
}
