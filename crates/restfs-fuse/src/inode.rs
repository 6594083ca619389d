//! Kernel inode numbers for remote paths.
//!
//! The engine speaks paths; the kernel speaks inode numbers. The table hands
//! out a number the first time a path is looked up and keeps it until the
//! kernel forgets every reference.

use crate::path::RemotePath;
use std::collections::HashMap;

pub type InodeId = u64;
pub const ROOT_INODE: InodeId = 1;

#[derive(Debug, Clone)]
pub struct InodeEntry {
    pub ino: InodeId,
    pub path: RemotePath,
    pub lookup_count: u64,
}

pub struct InodeTable {
    entries: HashMap<InodeId, InodeEntry>,
    by_path: HashMap<RemotePath, InodeId>,
    next_ino: InodeId,
}

impl InodeTable {
    pub fn new() -> Self {
        let mut table = InodeTable {
            entries: HashMap::new(),
            by_path: HashMap::new(),
            next_ino: ROOT_INODE + 1,
        };
        table.entries.insert(
            ROOT_INODE,
            InodeEntry {
                ino: ROOT_INODE,
                path: RemotePath::root(),
                lookup_count: 1,
            },
        );
        table.by_path.insert(RemotePath::root(), ROOT_INODE);
        table
    }

    pub fn path_of(&self, ino: InodeId) -> Option<RemotePath> {
        self.entries.get(&ino).map(|e| e.path.clone())
    }

    pub fn ino_of(&self, path: &RemotePath) -> Option<InodeId> {
        self.by_path.get(path).copied()
    }

    /// Inode number to report for a directory entry. Known paths keep their
    /// number; others get a fresh one that is not tracked, since the kernel
    /// never forgets plain readdir entries.
    pub fn listing_ino(&mut self, path: &RemotePath) -> InodeId {
        if let Some(ino) = self.ino_of(path) {
            return ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        ino
    }

    /// Inode for `path`, counting one kernel reference.
    pub fn lookup(&mut self, path: &RemotePath) -> InodeId {
        if let Some(ino) = self.ino_of(path) {
            if let Some(entry) = self.entries.get_mut(&ino) {
                entry.lookup_count += 1;
            }
            return ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.entries.insert(
            ino,
            InodeEntry {
                ino,
                path: path.clone(),
                lookup_count: 1,
            },
        );
        self.by_path.insert(path.clone(), ino);
        ino
    }

    /// Drop `nlookup` kernel references; the inode goes away at zero.
    pub fn forget(&mut self, ino: InodeId, nlookup: u64) {
        if ino == ROOT_INODE {
            return;
        }
        let Some(entry) = self.entries.get_mut(&ino) else {
            return;
        };
        entry.lookup_count = entry.lookup_count.saturating_sub(nlookup);
        if entry.lookup_count == 0 {
            let path = entry.path.clone();
            self.entries.remove(&ino);
            if self.by_path.get(&path) == Some(&ino) {
                self.by_path.remove(&path);
            }
        }
    }

    /// The path no longer exists remotely; a later lookup allocates afresh.
    pub fn unlink(&mut self, path: &RemotePath) {
        let doomed: Vec<RemotePath> = self
            .by_path
            .keys()
            .filter(|p| p.starts_with(path) && !p.is_root())
            .cloned()
            .collect();
        for p in doomed {
            if let Some(ino) = self.by_path.remove(&p) {
                // entries the kernel still references wait for forget
                if self.entries.get(&ino).is_some_and(|e| e.lookup_count == 0) {
                    self.entries.remove(&ino);
                }
            }
        }
    }

    /// Re-key every inode at or below `from` to the same place under `to`.
    pub fn rename(&mut self, from: &RemotePath, to: &RemotePath) {
        self.unlink(to);
        let moved: Vec<(RemotePath, InodeId)> = self
            .by_path
            .iter()
            .filter(|(p, _)| p.starts_with(from) && !p.is_root())
            .map(|(p, ino)| (p.clone(), *ino))
            .collect();
        for (old, ino) in moved {
            let Some(new_path) = old.rebase(from, to) else {
                continue;
            };
            self.by_path.remove(&old);
            self.by_path.insert(new_path.clone(), ino);
            if let Some(entry) = self.entries.get_mut(&ino) {
                entry.path = new_path;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(p: &str) -> RemotePath {
        RemotePath::parse(p).unwrap()
    }

    #[test]
    fn root_is_inode_one() {
        let table = InodeTable::new();
        assert_eq!(table.path_of(ROOT_INODE), Some(RemotePath::root()));
        assert_eq!(table.ino_of(&RemotePath::root()), Some(ROOT_INODE));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn lookup_is_stable_per_path() {
        let mut table = InodeTable::new();
        let a = table.lookup(&path("/a"));
        let again = table.lookup(&path("/a"));
        let b = table.lookup(&path("/b"));
        assert_eq!(a, again);
        assert_ne!(a, b);
        assert!(a > ROOT_INODE);
    }

    #[test]
    fn forget_releases_at_zero() {
        let mut table = InodeTable::new();
        let ino = table.lookup(&path("/a"));
        table.lookup(&path("/a"));
        table.forget(ino, 1);
        assert!(table.path_of(ino).is_some());
        table.forget(ino, 1);
        assert!(table.path_of(ino).is_none());
        assert!(table.ino_of(&path("/a")).is_none());
    }

    #[test]
    fn forget_never_drops_root() {
        let mut table = InodeTable::new();
        table.forget(ROOT_INODE, 100);
        assert!(table.path_of(ROOT_INODE).is_some());
    }

    #[test]
    fn rename_rekeys_subtree() {
        let mut table = InodeTable::new();
        let dir = table.lookup(&path("/d"));
        let child = table.lookup(&path("/d/f"));
        let sibling = table.lookup(&path("/dx"));
        table.rename(&path("/d"), &path("/e"));
        assert_eq!(table.path_of(dir), Some(path("/e")));
        assert_eq!(table.path_of(child), Some(path("/e/f")));
        assert_eq!(table.path_of(sibling), Some(path("/dx")));
        assert_eq!(table.ino_of(&path("/e/f")), Some(child));
        assert!(table.ino_of(&path("/d/f")).is_none());
    }

    #[test]
    fn rename_over_existing_target() {
        let mut table = InodeTable::new();
        let src = table.lookup(&path("/a"));
        let old_target = table.lookup(&path("/b"));
        table.rename(&path("/a"), &path("/b"));
        assert_eq!(table.ino_of(&path("/b")), Some(src));
        assert_ne!(table.ino_of(&path("/b")), Some(old_target));
    }

    #[test]
    fn listing_entries_are_not_retained() {
        let mut table = InodeTable::new();
        let known = table.lookup(&path("/d"));
        for i in 0..3000 {
            let child = path(&format!("/d/f{}", i));
            assert!(table.listing_ino(&child) > ROOT_INODE);
        }
        assert_eq!(table.listing_ino(&path("/d")), known);
        assert_eq!(table.len(), 2);
        assert!(table.ino_of(&path("/d/f7")).is_none());
    }

    #[test]
    fn unlink_drops_unreferenced_entries() {
        let mut table = InodeTable::new();
        let dir = table.lookup(&path("/d"));
        let child = table.lookup(&path("/d/f"));
        table.forget(child, 1);
        let kept = table.lookup(&path("/d/g"));
        table.unlink(&path("/d"));
        assert!(table.ino_of(&path("/d")).is_none());
        // still referenced by the kernel until forget
        assert!(table.path_of(dir).is_some());
        assert!(table.path_of(kept).is_some());
        table.forget(dir, 1);
        table.forget(kept, 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn unlink_allows_fresh_inode() {
        let mut table = InodeTable::new();
        let first = table.lookup(&path("/f"));
        table.unlink(&path("/f"));
        let second = table.lookup(&path("/f"));
        assert_ne!(first, second);
    }
}
