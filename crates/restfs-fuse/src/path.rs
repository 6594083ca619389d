//! Remote paths.
//!
//! A `RemotePath` is the location of a resource relative to the mounted host,
//! always absolute and normalized (`/`, `/a`, `/a/b`). It never contains the
//! local mount point.

use crate::error::{RestFsError, Result};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RemotePath(String);

impl RemotePath {
    /// The root of the remote tree.
    pub fn root() -> Self {
        RemotePath(String::from("/"))
    }

    /// Parse a slash-separated path, collapsing repeated separators.
    ///
    /// `.` segments are dropped; `..` is rejected rather than resolved, since
    /// the kernel never hands those to a FUSE filesystem.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut path = RemotePath::root();
        for segment in raw.split('/').filter(|s| !s.is_empty() && *s != ".") {
            path = path.join(segment)?;
        }
        Ok(path)
    }

    /// Append one child name.
    pub fn join(&self, name: &str) -> Result<Self> {
        validate_name(name)?;
        if self.is_root() {
            Ok(RemotePath(format!("/{}", name)))
        } else {
            Ok(RemotePath(format!("{}/{}", self.0, name)))
        }
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parent directory; the root is its own parent.
    pub fn parent(&self) -> RemotePath {
        match self.0.rfind('/') {
            Some(0) | None => RemotePath::root(),
            Some(idx) => RemotePath(self.0[..idx].to_string()),
        }
    }

    /// Final path component, empty for the root.
    pub fn name(&self) -> &str {
        match self.0.rfind('/') {
            Some(idx) => &self.0[idx + 1..],
            None => &self.0,
        }
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    /// Whether `self` equals `ancestor` or lies below it.
    pub fn starts_with(&self, ancestor: &RemotePath) -> bool {
        if ancestor.is_root() || self == ancestor {
            return true;
        }
        self.0.starts_with(&ancestor.0) && self.0.as_bytes().get(ancestor.0.len()) == Some(&b'/')
    }

    /// Re-root `self` from under `from` to under `to`.
    pub fn rebase(&self, from: &RemotePath, to: &RemotePath) -> Option<RemotePath> {
        if !self.starts_with(from) {
            return None;
        }
        if self == from {
            return Some(to.clone());
        }
        let rest = if from.is_root() {
            &self.0[1..]
        } else {
            &self.0[from.0.len() + 1..]
        };
        RemotePath::parse(&format!("{}/{}", to.0, rest)).ok()
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(RestFsError::InvalidArgument {
            msg: format!("invalid path component: {:?}", name),
        });
    }
    if name.contains('/') || name.contains('\0') {
        return Err(RestFsError::InvalidArgument {
            msg: format!("path component contains a separator or NUL: {:?}", name),
        });
    }
    Ok(())
}
