use thiserror::Error;

#[derive(Debug, Error)]
pub enum RestFsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not found: {path}")]
    NotFound { path: String },

    #[error("Permission denied: {path}")]
    PermissionDenied { path: String },

    #[error("Already exists: {path}")]
    AlreadyExists { path: String },

    #[error("Directory not empty: {path}")]
    NotEmpty { path: String },

    #[error("Transport failure for {path}: {msg}")]
    Transport { path: String, msg: String },

    #[error("Unexpected HTTP status {status} for {path}")]
    Http { path: String, status: u16 },

    #[error("Adapter error: {msg}")]
    Adapter { msg: String },

    #[error("Already mounted: {mountpoint}")]
    MountConflict { mountpoint: String },

    #[error("Mount failed at {mountpoint}: {reason}")]
    MountFailed { mountpoint: String, reason: String },

    #[error("Invalid argument: {msg}")]
    InvalidArgument { msg: String },

    #[error("Operation not supported: {op}")]
    NotSupported { op: String },

    #[error("Bad file handle: {fh}")]
    BadHandle { fh: u64 },
}

pub type Result<T> = std::result::Result<T, RestFsError>;

impl RestFsError {
    pub fn to_errno(&self) -> i32 {
        use libc::*;
        match self {
            RestFsError::Io(e) => e.raw_os_error().unwrap_or(EIO),
            RestFsError::NotFound { .. } => ENOENT,
            RestFsError::PermissionDenied { .. } => EACCES,
            RestFsError::AlreadyExists { .. } => EEXIST,
            RestFsError::NotEmpty { .. } => ENOTEMPTY,
            RestFsError::Transport { .. } => EIO,
            RestFsError::Http { .. } => EIO,
            RestFsError::Adapter { .. } => EIO,
            RestFsError::MountConflict { .. } => EBUSY,
            RestFsError::MountFailed { .. } => EIO,
            RestFsError::InvalidArgument { .. } => EINVAL,
            RestFsError::NotSupported { .. } => ENOSYS,
            RestFsError::BadHandle { .. } => EBADF,
        }
    }

    /// Whether an idempotent call that failed this way may be attempted again.
    pub fn is_transient(&self) -> bool {
        match self {
            RestFsError::Transport { .. } => true,
            RestFsError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_errno() {
        let err = RestFsError::NotFound {
            path: "/missing".to_string(),
        };
        assert_eq!(err.to_errno(), libc::ENOENT);
    }

    #[test]
    fn test_permission_denied_errno() {
        let err = RestFsError::PermissionDenied {
            path: "/secret".to_string(),
        };
        assert_eq!(err.to_errno(), libc::EACCES);
    }

    #[test]
    fn test_already_exists_errno() {
        let err = RestFsError::AlreadyExists {
            path: "/a".to_string(),
        };
        assert_eq!(err.to_errno(), libc::EEXIST);
    }

    #[test]
    fn test_not_empty_errno() {
        let err = RestFsError::NotEmpty {
            path: "/dir".to_string(),
        };
        assert_eq!(err.to_errno(), libc::ENOTEMPTY);
    }

    #[test]
    fn test_transport_and_http_map_to_eio() {
        let transport = RestFsError::Transport {
            path: "/a".to_string(),
            msg: "connection reset".to_string(),
        };
        let http = RestFsError::Http {
            path: "/a".to_string(),
            status: 418,
        };
        let adapter = RestFsError::Adapter {
            msg: "boom".to_string(),
        };
        assert_eq!(transport.to_errno(), libc::EIO);
        assert_eq!(http.to_errno(), libc::EIO);
        assert_eq!(adapter.to_errno(), libc::EIO);
    }

    #[test]
    fn test_mount_conflict_errno() {
        let err = RestFsError::MountConflict {
            mountpoint: "/tmp/x".to_string(),
        };
        assert_eq!(err.to_errno(), libc::EBUSY);
    }

    #[test]
    fn test_bad_handle_errno() {
        assert_eq!(RestFsError::BadHandle { fh: 9 }.to_errno(), libc::EBADF);
    }

    #[test]
    fn test_io_error_keeps_raw_errno() {
        let err = RestFsError::Io(std::io::Error::from_raw_os_error(libc::ENOSPC));
        assert_eq!(err.to_errno(), libc::ENOSPC);
    }

    #[test]
    fn test_transient_classification() {
        assert!(RestFsError::Transport {
            path: "/".into(),
            msg: "timeout".into()
        }
        .is_transient());
        assert!(RestFsError::Http {
            path: "/".into(),
            status: 503
        }
        .is_transient());
        assert!(!RestFsError::Http {
            path: "/".into(),
            status: 400
        }
        .is_transient());
        assert!(!RestFsError::NotFound { path: "/".into() }.is_transient());
    }

    #[test]
    fn test_display_messages_non_empty() {
        let errors = [
            RestFsError::NotFound { path: "/a".into() },
            RestFsError::PermissionDenied { path: "/a".into() },
            RestFsError::AlreadyExists { path: "/a".into() },
            RestFsError::NotEmpty { path: "/a".into() },
            RestFsError::Http {
                path: "/a".into(),
                status: 500,
            },
            RestFsError::MountFailed {
                mountpoint: "/mnt".into(),
                reason: "rejected".into(),
            },
            RestFsError::NotSupported { op: "op".into() },
        ];
        for err in errors {
            let msg = err.to_string();
            assert!(!msg.is_empty(), "Error display should be non-empty");
        }
    }
}
