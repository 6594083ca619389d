//! Mount point management.
//!
//! Option parsing, mount point validation, and the process-wide registry that
//! keeps two sessions from claiming the same directory.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use thiserror::Error;

use crate::error::RestFsError;

/// Mount options for FUSE.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MountOptions {
    /// Allow other users to access.
    pub allow_other: bool,
    /// Allow root to access.
    pub allow_root: bool,
    /// Let the kernel check permissions against the reported modes.
    pub default_permissions: bool,
    /// Auto unmount on exit.
    pub auto_unmount: bool,
    /// Bypass page cache.
    pub direct_io: bool,
    /// Read-only mount.
    pub ro: bool,
}

#[derive(Debug, Error)]
pub enum MountError {
    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Already mounted: {0}")]
    AlreadyMounted(String),

    #[error("Invalid option: {0}")]
    InvalidOption(String),

    #[error("Mount rejected at {mountpoint}: {reason}")]
    Rejected { mountpoint: String, reason: String },
}

impl From<MountError> for RestFsError {
    fn from(e: MountError) -> Self {
        match e {
            MountError::PathNotFound(path) => RestFsError::NotFound { path },
            MountError::NotADirectory(path) => RestFsError::InvalidArgument {
                msg: format!("mount point is not a directory: {}", path),
            },
            MountError::AlreadyMounted(mountpoint) => RestFsError::MountConflict { mountpoint },
            MountError::InvalidOption(opt) => RestFsError::InvalidArgument {
                msg: format!("unknown mount option: {}", opt),
            },
            MountError::Rejected { mountpoint, reason } => {
                RestFsError::MountFailed { mountpoint, reason }
            }
        }
    }
}

/// Validate a mountpoint path.
pub fn validate_mountpoint(path: &Path) -> Result<(), MountError> {
    if !path.exists() {
        return Err(MountError::PathNotFound(path.display().to_string()));
    }

    if !path.is_dir() {
        return Err(MountError::NotADirectory(path.display().to_string()));
    }

    Ok(())
}

/// Parse mount options from a comma-separated string.
///
/// Valid options: allow_other, allow_root, default_permissions, auto_unmount,
/// direct_io, ro, rw.
pub fn parse_mount_options(opts_str: &str) -> Result<MountOptions, MountError> {
    let mut options = MountOptions::default();

    for opt in opts_str.split(',') {
        let opt = opt.trim();
        match opt {
            "allow_other" => options.allow_other = true,
            "allow_root" => options.allow_root = true,
            "default_permissions" => options.default_permissions = true,
            "auto_unmount" => options.auto_unmount = true,
            "direct_io" => options.direct_io = true,
            "ro" => options.ro = true,
            "rw" => options.ro = false,
            "" => {}
            _ => {
                return Err(MountError::InvalidOption(opt.to_string()));
            }
        }
    }

    Ok(options)
}

/// Convert MountOptions to fuser::MountOption vec, naming the mount after
/// the remote host.
pub fn options_to_fuser(opts: &MountOptions, host: &str) -> Vec<fuser::MountOption> {
    let mut fuser_opts = vec![
        fuser::MountOption::FSName(format!("restfs:{}", host)),
        fuser::MountOption::Subtype("restfs".into()),
    ];

    if opts.allow_other {
        fuser_opts.push(fuser::MountOption::AllowOther);
    }

    if opts.allow_root {
        fuser_opts.push(fuser::MountOption::AllowRoot);
    }

    if opts.default_permissions {
        fuser_opts.push(fuser::MountOption::DefaultPermissions);
    }

    if opts.auto_unmount {
        fuser_opts.push(fuser::MountOption::AutoUnmount);
    }

    if opts.direct_io {
        fuser_opts.push(fuser::MountOption::CUSTOM("direct_io".into()));
    }

    fuser_opts.push(if opts.ro {
        fuser::MountOption::RO
    } else {
        fuser::MountOption::RW
    });

    fuser_opts
}

fn registry() -> &'static Mutex<HashSet<PathBuf>> {
    static REGISTRY: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Exclusive claim on a mount point within this process. Released on drop.
#[derive(Debug)]
pub struct MountClaim {
    mountpoint: PathBuf,
}

impl MountClaim {
    /// Validate `path` and claim it. Fails if this process already serves it
    /// or the host mount table lists it.
    pub fn acquire(path: &Path) -> Result<Self, MountError> {
        validate_mountpoint(path)?;
        let mountpoint = path
            .canonicalize()
            .map_err(|_| MountError::PathNotFound(path.display().to_string()))?;

        if is_listed_in_mountinfo(&mountpoint) {
            return Err(MountError::AlreadyMounted(mountpoint.display().to_string()));
        }

        let mut claimed = registry()
            .lock()
            .map_err(|_| MountError::AlreadyMounted(mountpoint.display().to_string()))?;
        if !claimed.insert(mountpoint.clone()) {
            return Err(MountError::AlreadyMounted(mountpoint.display().to_string()));
        }
        tracing::debug!("Claimed mount point {}", mountpoint.display());
        Ok(MountClaim { mountpoint })
    }

    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }
}

impl Drop for MountClaim {
    fn drop(&mut self) {
        if let Ok(mut claimed) = registry().lock() {
            claimed.remove(&self.mountpoint);
        }
        tracing::debug!("Released mount point {}", self.mountpoint.display());
    }
}

/// Undo the octal escapes (`\040` for space) used in /proc mount tables.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let escaped = (bytes[i] == b'\\')
            .then(|| field.get(i + 1..i + 4))
            .flatten()
            .and_then(|digits| u8::from_str_radix(digits, 8).ok());
        match escaped {
            Some(byte) => {
                out.push(byte);
                i += 4;
            }
            None => {
                out.push(bytes[i]);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Whether `mountinfo` (the text of /proc/self/mountinfo) lists `mountpoint`.
pub fn mountinfo_lists(mountinfo: &str, mountpoint: &Path) -> bool {
    mountinfo
        .lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .any(|field| Path::new(&unescape_mount_field(field)) == mountpoint)
}

fn is_listed_in_mountinfo(mountpoint: &Path) -> bool {
    match std::fs::read_to_string("/proc/self/mountinfo") {
        Ok(text) => mountinfo_lists(&text, mountpoint),
        Err(_) => false,
    }
}
