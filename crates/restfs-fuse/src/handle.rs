use crate::error::{RestFsError, Result};
use crate::path::RemotePath;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenFlags {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl OpenFlags {
    pub fn is_readable(&self) -> bool {
        match self {
            OpenFlags::ReadOnly | OpenFlags::ReadWrite => true,
            OpenFlags::WriteOnly => false,
        }
    }

    pub fn is_writable(&self) -> bool {
        match self {
            OpenFlags::WriteOnly | OpenFlags::ReadWrite => true,
            OpenFlags::ReadOnly => false,
        }
    }

    pub fn from_libc(flags: i32) -> Self {
        match flags & libc::O_ACCMODE {
            libc::O_WRONLY => OpenFlags::WriteOnly,
            libc::O_RDWR => OpenFlags::ReadWrite,
            _ => OpenFlags::ReadOnly,
        }
    }
}

/// Pending bytes of one handle: a single contiguous range starting at `start`.
#[derive(Debug, Default)]
pub struct WriteBuffer {
    start: u64,
    data: BytesMut,
}

impl WriteBuffer {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.start + self.data.len() as u64
    }

    /// Whether a write of `len` bytes at `offset` touches or overlaps the
    /// buffered range.
    pub fn can_absorb(&self, offset: u64, len: usize) -> bool {
        self.is_empty() || (offset <= self.end() && offset + len as u64 >= self.start)
    }

    /// Merge a write into the buffer. Newer bytes win where ranges overlap.
    /// Returns false, leaving the buffer untouched, when the write is not
    /// contiguous with it.
    pub fn absorb(&mut self, offset: u64, data: &[u8]) -> bool {
        if self.is_empty() {
            self.start = offset;
            self.data.clear();
            self.data.extend_from_slice(data);
            return true;
        }
        if !self.can_absorb(offset, data.len()) {
            return false;
        }

        if offset < self.start {
            let shift = (self.start - offset) as usize;
            let mut merged = BytesMut::with_capacity(shift + self.data.len().max(data.len()));
            merged.resize(shift, 0);
            merged.extend_from_slice(&self.data);
            self.data = merged;
            self.start = offset;
        }

        let at = (offset - self.start) as usize;
        let end = at + data.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[at..end].copy_from_slice(data);
        true
    }

    /// Remove and return the buffered range.
    pub fn take(&mut self) -> (u64, Bytes) {
        let start = self.start;
        self.start = 0;
        (start, self.data.split().freeze())
    }

    /// Drop buffered bytes at or beyond `size`.
    pub fn truncate(&mut self, size: u64) {
        if size <= self.start {
            self.data.clear();
            self.start = 0;
        } else if size < self.end() {
            self.data.truncate((size - self.start) as usize);
        }
    }
}

#[derive(Debug)]
pub struct FileHandle {
    pub fh: u64,
    pub path: RemotePath,
    pub flags: OpenFlags,
    /// Offset just past the last read or write, for sequential access.
    pub offset: u64,
    pub dirty: bool,
    /// The next flush replaces the whole remote resource.
    pub replace: bool,
    pub buffer: WriteBuffer,
}

impl FileHandle {
    fn new(fh: u64, path: RemotePath, flags: OpenFlags) -> Self {
        Self {
            fh,
            path,
            flags,
            offset: 0,
            dirty: false,
            replace: false,
            buffer: WriteBuffer::default(),
        }
    }
}

/// Open handles of one session.
///
/// Each handle sits behind its own async mutex; holding it for a whole HTTP
/// exchange serializes calls on that handle without blocking the others.
pub struct HandleTable {
    next_fh: AtomicU64,
    entries: DashMap<u64, Arc<Mutex<FileHandle>>>,
}

impl HandleTable {
    pub fn new() -> Self {
        tracing::debug!("Creating new handle table");
        Self {
            next_fh: AtomicU64::new(1),
            entries: DashMap::new(),
        }
    }

    /// Allocate a handle. Ids increase monotonically and are never reused.
    pub fn open(&self, path: RemotePath, flags: OpenFlags, replace: bool, dirty: bool) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        let mut handle = FileHandle::new(fh, path, flags);
        handle.replace = replace;
        handle.dirty = dirty;
        tracing::debug!(
            "Opened handle: fh={}, path={}, flags={:?}, replace={}",
            fh,
            handle.path,
            flags,
            replace
        );
        self.entries.insert(fh, Arc::new(Mutex::new(handle)));
        fh
    }

    pub fn get(&self, fh: u64) -> Result<Arc<Mutex<FileHandle>>> {
        self.entries
            .get(&fh)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(RestFsError::BadHandle { fh })
    }

    pub fn close(&self, fh: u64) -> Option<Arc<Mutex<FileHandle>>> {
        let removed = self.entries.remove(&fh).map(|(_, handle)| handle);
        if removed.is_some() {
            tracing::debug!("Closed handle: fh={}", fh);
        }
        removed
    }

    /// Snapshot of every open handle.
    pub fn handles(&self) -> Vec<Arc<Mutex<FileHandle>>> {
        self.entries.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Point handles under `from` at the matching path under `to`.
    pub async fn repath(&self, from: &RemotePath, to: &RemotePath) -> usize {
        let mut moved = 0;
        for handle in self.handles() {
            let mut handle = handle.lock().await;
            if let Some(new_path) = handle.path.rebase(from, to) {
                tracing::debug!("Re-pathed handle: fh={}, {} -> {}", handle.fh, handle.path, new_path);
                handle.path = new_path;
                moved += 1;
            }
        }
        moved
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}
