//! FUSE host integration.
//!
//! [`FuseBridge`] implements `fuser::Filesystem`. Each kernel request is
//! resolved from inode numbers to remote paths, its reply object is parked
//! under a fresh [`CallId`], and the call is queued for the engine.
//! [`FuseHost`] is the engine's side of the same queue: it hands calls out and
//! completes the parked replies.

use std::ffi::OsStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use fuser::{
    Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use std::os::raw::c_int;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::attr::{entry_kind_to_fuser_type, remote_attr_to_fuser, AttrDefaults, EntryKind};
use crate::call::{CallId, CallReply, FilesystemCall, FsOp};
use crate::error::{RestFsError, Result};
use crate::host::HostDispatch;
use crate::inode::{InodeId, InodeTable, ROOT_INODE};
use crate::path::RemotePath;

/// A kernel reply waiting for the engine's answer.
enum PendingReply {
    Entry {
        reply: ReplyEntry,
        path: RemotePath,
    },
    Attr {
        reply: ReplyAttr,
        ino: InodeId,
    },
    Data(ReplyData),
    Directory {
        reply: ReplyDirectory,
        ino: InodeId,
        path: RemotePath,
        offset: i64,
    },
    Open(ReplyOpen),
    Write(ReplyWrite),
    Create {
        reply: ReplyCreate,
        path: RemotePath,
    },
    Empty(ReplyEmpty),
    Removed {
        reply: ReplyEmpty,
        path: RemotePath,
    },
    Renamed {
        reply: ReplyEmpty,
        from: RemotePath,
        to: RemotePath,
    },
    Statfs(ReplyStatfs),
}

impl PendingReply {
    fn error(self, errno: c_int) {
        match self {
            PendingReply::Entry { reply, .. } => reply.error(errno),
            PendingReply::Attr { reply, .. } => reply.error(errno),
            PendingReply::Data(reply) => reply.error(errno),
            PendingReply::Directory { reply, .. } => reply.error(errno),
            PendingReply::Open(reply) => reply.error(errno),
            PendingReply::Write(reply) => reply.error(errno),
            PendingReply::Create { reply, .. } => reply.error(errno),
            PendingReply::Empty(reply) => reply.error(errno),
            PendingReply::Removed { reply, .. } => reply.error(errno),
            PendingReply::Renamed { reply, .. } => reply.error(errno),
            PendingReply::Statfs(reply) => reply.error(errno),
        }
    }
}

/// State shared by the kernel-facing bridge and the engine-facing host.
struct Shared {
    pending: DashMap<CallId, PendingReply>,
    inodes: Mutex<InodeTable>,
    defaults: AttrDefaults,
    ttl: Duration,
}

impl Shared {
    fn path_of(&self, ino: InodeId) -> Option<RemotePath> {
        self.inodes.lock().ok()?.path_of(ino)
    }

    fn child_path(&self, parent: InodeId, name: &OsStr) -> std::result::Result<RemotePath, c_int> {
        let parent_path = self.path_of(parent).ok_or(libc::ENOENT)?;
        let name = name.to_str().ok_or(libc::EINVAL)?;
        parent_path.join(name).map_err(|e| e.to_errno())
    }

    fn complete(&self, id: CallId, result: Result<CallReply>) {
        let Some((_, pending)) = self.pending.remove(&id) else {
            warn!("reply for unknown call {}", id);
            return;
        };
        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                pending.error(e.to_errno());
                return;
            }
        };

        match (pending, reply) {
            (PendingReply::Entry { reply, path }, CallReply::Attr(attr)) => {
                let Ok(mut inodes) = self.inodes.lock() else {
                    reply.error(libc::EIO);
                    return;
                };
                let ino = inodes.lookup(&path);
                reply.entry(&self.ttl, &remote_attr_to_fuser(ino, &attr, &self.defaults), 0);
            }
            (PendingReply::Attr { reply, ino }, CallReply::Attr(attr)) => {
                reply.attr(&self.ttl, &remote_attr_to_fuser(ino, &attr, &self.defaults));
            }
            (PendingReply::Data(reply), CallReply::Data(data)) => reply.data(&data),
            (
                PendingReply::Directory {
                    mut reply,
                    ino,
                    path,
                    offset,
                },
                CallReply::Listing(entries),
            ) => {
                let Ok(mut inodes) = self.inodes.lock() else {
                    reply.error(libc::EIO);
                    return;
                };
                let parent_ino = inodes.ino_of(&path.parent()).unwrap_or(ROOT_INODE);
                let mut listing: Vec<(InodeId, EntryKind, String)> = Vec::with_capacity(entries.len() + 2);
                listing.push((ino, EntryKind::Directory, ".".to_string()));
                listing.push((parent_ino, EntryKind::Directory, "..".to_string()));
                for entry in entries {
                    let Ok(child) = path.join(&entry.name) else {
                        continue;
                    };
                    listing.push((inodes.listing_ino(&child), entry.kind, entry.name));
                }
                drop(inodes);

                let skip = usize::try_from(offset).unwrap_or(0);
                for (i, (child_ino, kind, name)) in listing.into_iter().enumerate().skip(skip) {
                    if reply.add(child_ino, (i + 1) as i64, entry_kind_to_fuser_type(kind), name) {
                        break;
                    }
                }
                reply.ok();
            }
            (PendingReply::Open(reply), CallReply::Opened { fh }) => reply.opened(fh, 0),
            (PendingReply::Write(reply), CallReply::Written(n)) => reply.written(n),
            (PendingReply::Create { reply, path }, CallReply::Created { attr, fh }) => {
                let Ok(mut inodes) = self.inodes.lock() else {
                    reply.error(libc::EIO);
                    return;
                };
                let ino = inodes.lookup(&path);
                reply.created(&self.ttl, &remote_attr_to_fuser(ino, &attr, &self.defaults), 0, fh, 0);
            }
            (PendingReply::Empty(reply), _) => reply.ok(),
            (PendingReply::Removed { reply, path }, _) => {
                if let Ok(mut inodes) = self.inodes.lock() {
                    inodes.unlink(&path);
                }
                reply.ok();
            }
            (PendingReply::Renamed { reply, from, to }, _) => {
                if let Ok(mut inodes) = self.inodes.lock() {
                    inodes.rename(&from, &to);
                }
                reply.ok();
            }
            (PendingReply::Statfs(reply), CallReply::Statfs(s)) => {
                reply.statfs(s.blocks, s.bfree, s.bavail, s.files, s.ffree, s.bsize, s.namelen, s.frsize);
            }
            (pending, other) => {
                warn!("call {} got mismatched reply {:?}", id, other);
                pending.error(libc::EIO);
            }
        }
    }
}

/// The kernel-facing half: a `fuser::Filesystem` that forwards every request.
pub struct FuseBridge {
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<FilesystemCall>,
    next_id: AtomicU64,
}

impl FuseBridge {
    fn submit(&self, op: FsOp, pending: PendingReply) {
        let id = CallId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.shared.pending.insert(id, pending);
        if self.tx.send(FilesystemCall { id, op }).is_err() {
            // engine gone; fail the call rather than leave the kernel waiting
            if let Some((_, pending)) = self.shared.pending.remove(&id) {
                pending.error(libc::EIO);
            }
        }
    }
}

impl Filesystem for FuseBridge {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> std::result::Result<(), c_int> {
        debug!("restfs filesystem init");
        Ok(())
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let path = match self.shared.child_path(parent, name) {
            Ok(p) => p,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        self.submit(
            FsOp::Lookup { path: path.clone() },
            PendingReply::Entry { reply, path },
        );
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        if let Ok(mut inodes) = self.shared.inodes.lock() {
            inodes.forget(ino, nlookup);
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(path) = self.shared.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        self.submit(FsOp::GetAttr { path }, PendingReply::Attr { reply, ino });
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.shared.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        // ownership, mode and times have no remote counterpart
        let op = match size {
            Some(size) => FsOp::Truncate { path, size, fh },
            None => FsOp::GetAttr { path },
        };
        self.submit(op, PendingReply::Attr { reply, ino });
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let path = match self.shared.child_path(parent, name) {
            Ok(p) => p,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        self.submit(FsOp::Mkdir { path: path.clone() }, PendingReply::Entry { reply, path });
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.shared.child_path(parent, name) {
            Ok(p) => p,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        self.submit(FsOp::Unlink { path: path.clone() }, PendingReply::Removed { reply, path });
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.shared.child_path(parent, name) {
            Ok(p) => p,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        self.submit(FsOp::Rmdir { path: path.clone() }, PendingReply::Removed { reply, path });
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        if flags != 0 {
            // RENAME_NOREPLACE / RENAME_EXCHANGE cannot be expressed remotely
            reply.error(libc::EINVAL);
            return;
        }
        let from = match self.shared.child_path(parent, name) {
            Ok(p) => p,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let to = match self.shared.child_path(newparent, newname) {
            Ok(p) => p,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        self.submit(
            FsOp::Rename {
                from: from.clone(),
                to: to.clone(),
            },
            PendingReply::Renamed { reply, from, to },
        );
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.shared.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        self.submit(FsOp::Open { path, flags }, PendingReply::Open(reply));
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        self.submit(FsOp::Read { fh, offset, size }, PendingReply::Data(reply));
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        self.submit(
            FsOp::Write {
                fh,
                offset,
                data: Bytes::copy_from_slice(data),
            },
            PendingReply::Write(reply),
        );
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        self.submit(FsOp::Flush { fh }, PendingReply::Empty(reply));
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.submit(FsOp::Release { fh }, PendingReply::Empty(reply));
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        self.submit(FsOp::Fsync { fh }, PendingReply::Empty(reply));
    }

    fn readdir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, offset: i64, reply: ReplyDirectory) {
        let Some(path) = self.shared.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        self.submit(
            FsOp::ReadDir { path: path.clone() },
            PendingReply::Directory {
                reply,
                ino,
                path,
                offset,
            },
        );
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        self.submit(FsOp::Statfs, PendingReply::Statfs(reply));
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let path = match self.shared.child_path(parent, name) {
            Ok(p) => p,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        self.submit(
            FsOp::Create {
                path: path.clone(),
                flags,
            },
            PendingReply::Create { reply, path },
        );
    }
}

/// The engine-facing half of a FUSE mount.
pub struct FuseHost {
    shared: Arc<Shared>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<FilesystemCall>>,
    session: Mutex<Option<fuser::BackgroundSession>>,
}

impl FuseHost {
    /// Create a connected bridge/host pair.
    pub fn new(defaults: AttrDefaults, ttl: Duration) -> (FuseBridge, FuseHost) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            pending: DashMap::new(),
            inodes: Mutex::new(InodeTable::new()),
            defaults,
            ttl,
        });
        let bridge = FuseBridge {
            shared: Arc::clone(&shared),
            tx,
            next_id: AtomicU64::new(1),
        };
        let host = FuseHost {
            shared,
            rx: tokio::sync::Mutex::new(rx),
            session: Mutex::new(None),
        };
        (bridge, host)
    }

    /// Take ownership of the running kernel session so `deregister` can end it.
    pub fn attach(&self, session: fuser::BackgroundSession) {
        if let Ok(mut slot) = self.session.lock() {
            *slot = Some(session);
        }
    }

    pub fn pending_calls(&self) -> usize {
        self.shared.pending.len()
    }
}

#[async_trait]
impl HostDispatch for FuseHost {
    async fn receive_call(&self) -> Option<FilesystemCall> {
        self.rx.lock().await.recv().await
    }

    fn reply(&self, id: CallId, result: Result<CallReply>) {
        self.shared.complete(id, result);
    }

    fn deregister(&self) -> Result<()> {
        let session = self
            .session
            .lock()
            .map_err(|_| RestFsError::Io(std::io::Error::other("session lock poisoned")))?
            .take();
        if let Some(session) = session {
            debug!("ending FUSE session");
            // join unmounts, then panics if the session thread ended in error
            let joined = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| session.join()));
            if joined.is_err() {
                warn!("FUSE session thread ended with an error");
            }
        }
        // calls queued after the engine stopped receiving
        let stale: Vec<CallId> = self.shared.pending.iter().map(|e| *e.key()).collect();
        for id in stale {
            if let Some((_, pending)) = self.shared.pending.remove(&id) {
                pending.error(libc::EIO);
            }
        }
        Ok(())
    }
}
