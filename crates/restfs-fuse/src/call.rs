//! Filesystem calls as the engine sees them.
//!
//! Host integrations turn their native requests into [`FilesystemCall`]s and
//! receive a [`CallReply`] (or an error) for each one.

use crate::attr::{DirEntry, RemoteAttr};
use crate::path::RemotePath;
use bytes::Bytes;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallId(pub u64);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Lookup,
    GetAttr,
    ReadDir,
    Open,
    Read,
    Write,
    Flush,
    Release,
    Fsync,
    Create,
    Mkdir,
    Unlink,
    Rmdir,
    Rename,
    Truncate,
    Statfs,
}

impl CallKind {
    /// Calls that may be retried after a transient failure.
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self,
            CallKind::Lookup | CallKind::GetAttr | CallKind::ReadDir | CallKind::Read
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallKind::Lookup => "lookup",
            CallKind::GetAttr => "getattr",
            CallKind::ReadDir => "readdir",
            CallKind::Open => "open",
            CallKind::Read => "read",
            CallKind::Write => "write",
            CallKind::Flush => "flush",
            CallKind::Release => "release",
            CallKind::Fsync => "fsync",
            CallKind::Create => "create",
            CallKind::Mkdir => "mkdir",
            CallKind::Unlink => "unlink",
            CallKind::Rmdir => "rmdir",
            CallKind::Rename => "rename",
            CallKind::Truncate => "truncate",
            CallKind::Statfs => "statfs",
        }
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum FsOp {
    Lookup {
        path: RemotePath,
    },
    GetAttr {
        path: RemotePath,
    },
    ReadDir {
        path: RemotePath,
    },
    Open {
        path: RemotePath,
        flags: i32,
    },
    Read {
        fh: u64,
        offset: u64,
        size: u32,
    },
    Write {
        fh: u64,
        offset: u64,
        data: Bytes,
    },
    Flush {
        fh: u64,
    },
    Release {
        fh: u64,
    },
    Fsync {
        fh: u64,
    },
    Create {
        path: RemotePath,
        flags: i32,
    },
    Mkdir {
        path: RemotePath,
    },
    Unlink {
        path: RemotePath,
    },
    Rmdir {
        path: RemotePath,
    },
    Rename {
        from: RemotePath,
        to: RemotePath,
    },
    Truncate {
        path: RemotePath,
        size: u64,
        fh: Option<u64>,
    },
    Statfs,
}

impl FsOp {
    pub fn kind(&self) -> CallKind {
        match self {
            FsOp::Lookup { .. } => CallKind::Lookup,
            FsOp::GetAttr { .. } => CallKind::GetAttr,
            FsOp::ReadDir { .. } => CallKind::ReadDir,
            FsOp::Open { .. } => CallKind::Open,
            FsOp::Read { .. } => CallKind::Read,
            FsOp::Write { .. } => CallKind::Write,
            FsOp::Flush { .. } => CallKind::Flush,
            FsOp::Release { .. } => CallKind::Release,
            FsOp::Fsync { .. } => CallKind::Fsync,
            FsOp::Create { .. } => CallKind::Create,
            FsOp::Mkdir { .. } => CallKind::Mkdir,
            FsOp::Unlink { .. } => CallKind::Unlink,
            FsOp::Rmdir { .. } => CallKind::Rmdir,
            FsOp::Rename { .. } => CallKind::Rename,
            FsOp::Truncate { .. } => CallKind::Truncate,
            FsOp::Statfs => CallKind::Statfs,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FilesystemCall {
    pub id: CallId,
    pub op: FsOp,
}

/// Filesystem-level statistics reported by `statfs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatfsInfo {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

impl Default for StatfsInfo {
    fn default() -> Self {
        // the remote size is unknown; report a large, mostly free volume
        Self {
            blocks: 1024 * 1024 * 256,
            bfree: 1024 * 1024 * 256,
            bavail: 1024 * 1024 * 256,
            files: 1_000_000,
            ffree: 1_000_000,
            bsize: 4096,
            namelen: 255,
            frsize: 4096,
        }
    }
}

#[derive(Debug, Clone)]
pub enum CallReply {
    Attr(RemoteAttr),
    Data(Bytes),
    Listing(Vec<DirEntry>),
    Opened { fh: u64 },
    Written(u32),
    Created { attr: RemoteAttr, fh: u64 },
    Statfs(StatfsInfo),
    Empty,
}
