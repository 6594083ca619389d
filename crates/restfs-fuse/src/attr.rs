use crate::path::RemotePath;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// Attributes of a remote resource as reported by the host.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteAttr {
    pub path: RemotePath,
    pub kind: EntryKind,
    pub size: u64,
    pub mtime: Option<SystemTime>,
    pub content_type: Option<String>,
}

impl RemoteAttr {
    pub fn file(path: RemotePath, size: u64) -> Self {
        RemoteAttr {
            path,
            kind: EntryKind::File,
            size,
            mtime: None,
            content_type: None,
        }
    }

    pub fn directory(path: RemotePath) -> Self {
        RemoteAttr {
            path,
            kind: EntryKind::Directory,
            size: 0,
            mtime: None,
            content_type: None,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// One entry of a remote directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: Option<u64>,
}

/// Ownership and permission bits applied to every remote entry; HTTP has no
/// notion of either.
#[derive(Debug, Clone, Copy)]
pub struct AttrDefaults {
    pub uid: u32,
    pub gid: u32,
    pub file_mode: u16,
    pub dir_mode: u16,
}

impl Default for AttrDefaults {
    fn default() -> Self {
        AttrDefaults {
            uid: 0,
            gid: 0,
            file_mode: 0o644,
            dir_mode: 0o755,
        }
    }
}

const BLOCK_SIZE: u32 = 4096;

fn blocks_for_size(size: u64) -> u64 {
    size.div_ceil(512)
}

pub fn entry_kind_to_fuser_type(kind: EntryKind) -> fuser::FileType {
    match kind {
        EntryKind::File => fuser::FileType::RegularFile,
        EntryKind::Directory => fuser::FileType::Directory,
    }
}

pub fn remote_attr_to_fuser(ino: u64, attr: &RemoteAttr, defaults: &AttrDefaults) -> fuser::FileAttr {
    let mtime = attr.mtime.unwrap_or_else(SystemTime::now);
    let (perm, nlink) = match attr.kind {
        EntryKind::File => (defaults.file_mode, 1),
        EntryKind::Directory => (defaults.dir_mode, 2),
    };
    fuser::FileAttr {
        ino,
        size: attr.size,
        blocks: blocks_for_size(attr.size),
        atime: mtime,
        mtime,
        ctime: mtime,
        crtime: SystemTime::UNIX_EPOCH,
        kind: entry_kind_to_fuser_type(attr.kind),
        perm,
        nlink,
        uid: defaults.uid,
        gid: defaults.gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn path(p: &str) -> RemotePath {
        RemotePath::parse(p).unwrap()
    }

    #[test]
    fn test_file_constructor_sets_kind() {
        let attr = RemoteAttr::file(path("/a.txt"), 1000);
        assert_eq!(attr.kind, EntryKind::File);
        assert_eq!(attr.size, 1000);
        assert!(!attr.is_dir());
    }

    #[test]
    fn test_directory_constructor() {
        let attr = RemoteAttr::directory(path("/d"));
        assert!(attr.is_dir());
        assert_eq!(attr.size, 0);
    }

    #[test]
    fn test_fuser_attr_for_file() {
        let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(1_381_237_736);
        let mut attr = RemoteAttr::file(path("/hello.txt"), 2048);
        attr.mtime = Some(mtime);
        let defaults = AttrDefaults {
            uid: 1000,
            gid: 100,
            ..Default::default()
        };
        let fattr = remote_attr_to_fuser(2, &attr, &defaults);
        assert_eq!(fattr.ino, 2);
        assert_eq!(fattr.kind, fuser::FileType::RegularFile);
        assert_eq!(fattr.size, 2048);
        assert_eq!(fattr.blocks, 4);
        assert_eq!(fattr.perm, 0o644);
        assert_eq!(fattr.nlink, 1);
        assert_eq!(fattr.uid, 1000);
        assert_eq!(fattr.gid, 100);
        assert_eq!(fattr.mtime, mtime);
    }

    #[test]
    fn test_fuser_attr_for_directory() {
        let attr = RemoteAttr::directory(path("/"));
        let fattr = remote_attr_to_fuser(1, &attr, &AttrDefaults::default());
        assert_eq!(fattr.kind, fuser::FileType::Directory);
        assert_eq!(fattr.perm, 0o755);
        assert_eq!(fattr.nlink, 2);
    }

    #[test]
    fn test_blocks_round_up() {
        assert_eq!(blocks_for_size(0), 0);
        assert_eq!(blocks_for_size(1), 1);
        assert_eq!(blocks_for_size(512), 1);
        assert_eq!(blocks_for_size(513), 2);
    }
}
