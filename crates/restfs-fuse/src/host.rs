//! Boundary between the engine and whatever delivers filesystem calls.

use crate::call::{CallId, CallReply, FilesystemCall};
use crate::error::Result;
use async_trait::async_trait;

/// A source of filesystem calls and a sink for their replies.
///
/// The FUSE integration is one implementation; tests drive the engine through
/// in-memory ones.
#[async_trait]
pub trait HostDispatch: Send + Sync + 'static {
    /// Next call, or `None` once the host will deliver no more (external
    /// unmount).
    async fn receive_call(&self) -> Option<FilesystemCall>;

    /// Deliver the result of call `id`. Called exactly once per received call.
    fn reply(&self, id: CallId, result: Result<CallReply>);

    /// Detach from the host. Called once, after every in-flight call replied.
    fn deregister(&self) -> Result<()>;
}
