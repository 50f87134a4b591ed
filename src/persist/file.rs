//! Shared file handle for one index file
//!
//! Node reads and writes from the B-tree and header commits all go through
//! this handle, so a single lock serializes access to the file cursor.

use crate::error::{IndexError, IndexResult};
use crate::persist::header::{IndexHeader, HEADER_SIZE};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// An open index file: header plus node region
pub struct IndexFile {
    path: PathBuf,
    /// `None` once the index is closed
    file: Mutex<Option<File>>,
    header: Mutex<IndexHeader>,
}

impl IndexFile {
    /// Create (or truncate) an index file with a fresh header
    pub fn create(path: impl AsRef<Path>, header: IndexHeader) -> IndexResult<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        file.write_all(&header.to_bytes())?;
        file.sync_all()?;

        Ok(Self {
            path,
            file: Mutex::new(Some(file)),
            header: Mutex::new(header),
        })
    }

    /// Open an existing index file and parse its header
    pub fn open(path: impl AsRef<Path>) -> IndexResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut buf = [0u8; HEADER_SIZE];
        match file.read_exact(&mut buf) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                return Err(IndexError::CorruptIndex("index file shorter than header".into()))
            }
            Err(e) => return Err(e.into()),
        }
        let header = IndexHeader::from_bytes(&buf)?;

        let file_len = file.metadata()?.len();
        if header.next_offset < HEADER_SIZE as u64 || header.next_offset > file_len {
            return Err(IndexError::CorruptIndex(format!(
                "node region ends at {} but file has {} bytes",
                header.next_offset, file_len
            )));
        }

        Ok(Self {
            path,
            file: Mutex::new(Some(file)),
            header: Mutex::new(header),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy of the last committed header
    pub fn header(&self) -> IndexHeader {
        self.header.lock().clone()
    }

    /// Run `f` against the open file handle
    fn with_file<T>(&self, f: impl FnOnce(&mut File) -> IndexResult<T>) -> IndexResult<T> {
        let mut guard = self.file.lock();
        match guard.as_mut() {
            Some(file) => f(file),
            None => Err(IndexError::Disposed),
        }
    }

    /// Read exactly `buf.len()` bytes at `offset`
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> IndexResult<()> {
        self.with_file(|file| {
            file.seek(SeekFrom::Start(offset))?;
            match file.read_exact(buf) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(IndexError::CorruptIndex(
                    format!("short read of {} bytes at offset {}", buf.len(), offset),
                )),
                Err(e) => Err(e.into()),
            }
        })
    }

    /// Write `buf` at `offset`
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> IndexResult<()> {
        self.with_file(|file| {
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(buf)?;
            Ok(())
        })
    }

    /// Apply `update` to the header and make it durable
    ///
    /// Node data is synced before the header is rewritten, so a header
    /// never points at nodes that did not reach the disk.
    pub fn commit(&self, update: impl FnOnce(&mut IndexHeader)) -> IndexResult<()> {
        let mut header = self.header.lock();
        let mut next = header.clone();
        update(&mut next);

        self.with_file(|file| {
            file.sync_data()?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&next.to_bytes())?;
            file.sync_all()?;
            Ok(())
        })?;

        *header = next;
        Ok(())
    }

    /// Mark the index incomplete and drop the node region
    pub fn clear_nodes(&self) -> IndexResult<()> {
        self.commit(|h| {
            h.complete = false;
            h.root_offset = 0;
            h.checkpoint_count = 0;
            h.height = 0;
            h.next_offset = HEADER_SIZE as u64;
            h.event_count = 0;
        })?;
        self.with_file(|file| {
            file.set_len(HEADER_SIZE as u64)?;
            Ok(())
        })
    }

    /// Drop the file handle; later reads and writes fail with `Disposed`
    pub fn close(&self) {
        self.file.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.file.lock().is_none()
    }
}

impl std::fmt::Debug for IndexFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexFile")
            .field("path", &self.path)
            .field("header", &*self.header.lock())
            .finish()
    }
}
