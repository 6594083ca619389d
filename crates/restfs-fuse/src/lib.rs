//! RestFS: a remote HTTP(S) resource tree mounted as a local FUSE filesystem.
//!
//! Filesystem calls arrive through a [`HostDispatch`], are translated into
//! HTTP requests, passed through an [`Adapter`], sent by a [`Transport`] and
//! interpreted back into attributes, data and errno values.

pub mod adapter;
pub mod attr;
pub mod call;
pub mod config;
pub mod engine;
pub mod error;
pub mod fuse;
pub mod handle;
pub mod host;
pub mod inode;
pub mod interpret;
pub mod listing;
pub mod mount;
pub mod path;
pub mod retry;
pub mod session;
pub mod translate;
pub mod transport;

pub use adapter::{parse_header_arg, Adapter, AdapterError, AdapterRequest, NoopAdapter, StaticHeaderAdapter};
pub use call::{CallId, CallKind, CallReply, FilesystemCall, FsOp};
pub use config::RestFsConfig;
pub use engine::{EngineConfig, EngineState, MountEngine};
pub use error::{RestFsError, Result};
pub use host::HostDispatch;
pub use path::RemotePath;
pub use retry::RetryPolicy;
pub use session::{interrupt_signal, mount, spawn_mount, MountHandle};
pub use translate::{Scheme, Translator, Verb};
pub use transport::{HttpTransport, RawResponse, Transport, TransportError};
