//! Mount engine.
//!
//! Owns the session's lifecycle state and open handles, receives filesystem
//! calls from a [`HostDispatch`] and drives each one through
//! translate, precommit, transport, postcommit and interpret before replying.

use crate::adapter::{run_commit, run_postcommit, run_precommit, Adapter};
use crate::attr::RemoteAttr;
use crate::call::{CallId, CallKind, CallReply, FilesystemCall, FsOp, StatfsInfo};
use crate::error::{RestFsError, Result};
use crate::handle::{FileHandle, HandleTable, OpenFlags};
use crate::host::HostDispatch;
use crate::interpret::{interpret_attr, interpret_empty, interpret_listing, interpret_read};
use crate::path::RemotePath;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::translate::{PendingRequest, RemoteOp, Translator};
use crate::transport::{RawResponse, Transport};
use bytes::{Bytes, BytesMut};
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineState {
    #[default]
    Unmounted,
    Mounting,
    Serving,
    Unmounting,
}

impl EngineState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => EngineState::Mounting,
            2 => EngineState::Serving,
            3 => EngineState::Unmounting,
            _ => EngineState::Unmounted,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Calls driven at the same time.
    pub concurrency: usize,
    pub retry: RetryPolicy,
    /// Pending write bytes per handle before a flush is forced.
    pub write_buffer_bytes: usize,
    /// Emulate an unsupported MOVE with GET, PUT and DELETE.
    pub rename_fallback: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: 16,
            retry: RetryPolicy::default(),
            write_buffer_bytes: 4 * 1024 * 1024,
            rename_fallback: true,
        }
    }
}

pub struct MountEngine {
    adapter: Arc<dyn Adapter>,
    transport: Arc<dyn Transport>,
    translator: Translator,
    handles: HandleTable,
    config: EngineConfig,
    state: AtomicU8,
}

impl MountEngine {
    pub fn new(
        adapter: Arc<dyn Adapter>,
        transport: Arc<dyn Transport>,
        translator: Translator,
        config: EngineConfig,
    ) -> Self {
        Self {
            adapter,
            transport,
            translator,
            handles: HandleTable::new(),
            config,
            state: AtomicU8::new(EngineState::Unmounted as u8),
        }
    }

    pub fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: EngineState) {
        let previous = EngineState::from_u8(self.state.swap(state as u8, Ordering::SeqCst));
        if previous != state {
            info!("engine state {:?} -> {:?}", previous, state);
        }
    }

    /// Mark the session as being set up; the host is not serving yet.
    pub fn begin_mount(&self) {
        self.set_state(EngineState::Mounting);
    }

    /// Return to `Unmounted` after a failed mount.
    pub fn abort_mount(&self) {
        self.set_state(EngineState::Unmounted);
    }

    pub fn translator(&self) -> &Translator {
        &self.translator
    }

    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    /// Serve calls from `host` until `shutdown` resolves or the host closes.
    ///
    /// Every received call is replied to before this returns, and the host is
    /// deregistered exactly once.
    pub async fn serve<H, S>(self: Arc<Self>, host: Arc<H>, shutdown: S) -> Result<()>
    where
        H: HostDispatch,
        S: Future<Output = ()> + Send,
    {
        self.set_state(EngineState::Serving);
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("unmount requested, {} calls in flight", tasks.len());
                    break;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        warn!("call task ended abnormally: {}", e);
                    }
                }
                call = host.receive_call() => match call {
                    Some(call) => {
                        let engine = Arc::clone(&self);
                        let host = Arc::clone(&host);
                        let semaphore = Arc::clone(&semaphore);
                        tasks.spawn(async move {
                            let _permit = semaphore.acquire_owned().await.ok();
                            let id = call.id;
                            let result = engine.drive(call).await;
                            host.reply(id, result);
                        });
                    }
                    None => {
                        info!("host closed the call stream, {} calls in flight", tasks.len());
                        break;
                    }
                },
            }
        }

        self.set_state(EngineState::Unmounting);
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!("call task ended abnormally: {}", e);
            }
        }
        self.flush_all().await;

        let deregister_host = Arc::clone(&host);
        let deregistered = tokio::task::spawn_blocking(move || deregister_host.deregister())
            .await
            .map_err(|e| RestFsError::Io(std::io::Error::other(e.to_string())))
            .and_then(|r| r);
        if let Err(e) = &deregistered {
            warn!("deregister failed: {}", e);
        }
        self.set_state(EngineState::Unmounted);
        deregistered
    }

    /// Run one call to completion. A panic while driving it fails the call
    /// with EIO instead of leaving it unanswered.
    async fn drive(self: Arc<Self>, call: FilesystemCall) -> Result<CallReply> {
        let id = call.id;
        let kind = call.op.kind();
        match tokio::spawn(async move { self.dispatch(call).await }).await {
            Ok(result) => result,
            Err(e) => {
                warn!("{} {} aborted: {}", kind, id, e);
                Err(RestFsError::Io(std::io::Error::other(format!("{} aborted", kind))))
            }
        }
    }

    /// Carry out one filesystem call.
    pub async fn dispatch(&self, call: FilesystemCall) -> Result<CallReply> {
        let FilesystemCall { id, op } = call;
        let kind = op.kind();
        debug!("{} {} {:?}", kind, id, op);

        let result = match op {
            FsOp::Lookup { path } | FsOp::GetAttr { path } => {
                self.commit(kind, &path);
                self.getattr(id, kind, &path).await.map(CallReply::Attr)
            }
            FsOp::ReadDir { path } => {
                self.commit(kind, &path);
                self.readdir(id, &path).await.map(CallReply::Listing)
            }
            FsOp::Open { path, flags } => {
                self.commit(kind, &path);
                Ok(self.open(path, flags))
            }
            FsOp::Read { fh, offset, size } => self.read(id, fh, offset, size).await.map(CallReply::Data),
            FsOp::Write { fh, offset, data } => self.write(id, fh, offset, data).await.map(CallReply::Written),
            FsOp::Flush { fh } | FsOp::Fsync { fh } => {
                let handle = self.handles.get(fh)?;
                let mut handle = handle.lock().await;
                self.commit(kind, &handle.path);
                self.flush_locked(id, &mut handle).await.map(|_| CallReply::Empty)
            }
            FsOp::Release { fh } => self.release(id, fh).await.map(|_| CallReply::Empty),
            FsOp::Create { path, flags } => {
                self.commit(kind, &path);
                self.create(id, path, flags).await
            }
            FsOp::Mkdir { path } => {
                self.commit(kind, &path);
                self.run_empty(id, RemoteOp::Mkdir { path: path.clone() }, None)
                    .await
                    .map(|_| CallReply::Attr(RemoteAttr::directory(path)))
            }
            FsOp::Unlink { path } => {
                self.commit(kind, &path);
                self.run_empty(id, RemoteOp::Unlink { path }, None)
                    .await
                    .map(|_| CallReply::Empty)
            }
            FsOp::Rmdir { path } => {
                self.commit(kind, &path);
                self.run_empty(id, RemoteOp::Rmdir { path }, None)
                    .await
                    .map(|_| CallReply::Empty)
            }
            FsOp::Rename { from, to } => {
                self.commit(kind, &from);
                self.rename(id, &from, &to).await.map(|_| CallReply::Empty)
            }
            FsOp::Truncate { path, size, fh } => {
                self.commit(kind, &path);
                self.truncate(id, path, size, fh).await.map(CallReply::Attr)
            }
            FsOp::Statfs => Ok(CallReply::Statfs(StatfsInfo::default())),
        };

        if let Err(e) = &result {
            debug!("{} {} failed: {}", kind, id, e);
        }
        result
    }

    fn commit(&self, kind: CallKind, path: &RemotePath) {
        run_commit(self.adapter.as_ref(), kind, path);
    }

    /// Translate `op` and exchange it with the host, retrying idempotent
    /// calls. Responses with status below 500 are returned for interpretation.
    async fn execute(
        &self,
        id: CallId,
        op: &RemoteOp,
        fh: Option<u64>,
    ) -> Result<(PendingRequest, RawResponse)> {
        let pending = self.translator.translate(id, op, fh)?;
        let response = retry_with_backoff(&self.config.retry, pending.kind.is_idempotent(), |_| {
            self.send_once(&pending)
        })
        .await?;
        Ok((pending, response))
    }

    async fn send_once(&self, pending: &PendingRequest) -> Result<RawResponse> {
        let (request, url) = run_precommit(self.adapter.as_ref(), pending.to_adapter_request())?;
        let response = self
            .transport
            .send(request.verb, &url, &request.headers, request.body)
            .await
            .map_err(|e| RestFsError::Transport {
                path: pending.path.to_string(),
                msg: e.to_string(),
            })?;
        run_postcommit(self.adapter.as_ref(), &response);

        if response.status >= 500 {
            return Err(RestFsError::Http {
                path: pending.path.to_string(),
                status: response.status,
            });
        }
        Ok(response)
    }

    async fn run_empty(&self, id: CallId, op: RemoteOp, fh: Option<u64>) -> Result<()> {
        let (pending, response) = self.execute(id, &op, fh).await?;
        interpret_empty(pending.kind, &pending.path, &response)
    }

    async fn getattr(&self, id: CallId, kind: CallKind, path: &RemotePath) -> Result<RemoteAttr> {
        if path.is_root() {
            return Ok(RemoteAttr::directory(RemotePath::root()));
        }
        let op = match kind {
            CallKind::Lookup => RemoteOp::Lookup { path: path.clone() },
            _ => RemoteOp::GetAttr { path: path.clone() },
        };
        let (pending, response) = self.execute(id, &op, None).await?;
        interpret_attr(path, pending.kind, pending.verb, &response)
    }

    async fn readdir(&self, id: CallId, path: &RemotePath) -> Result<Vec<crate::attr::DirEntry>> {
        let op = RemoteOp::ReadDir { path: path.clone() };
        let (pending, response) = self.execute(id, &op, None).await?;
        let dir_url = response.url.clone().unwrap_or_else(|| pending.url.clone());
        interpret_listing(path, &dir_url, &response)
    }

    fn open(&self, path: RemotePath, flags: i32) -> CallReply {
        let access = OpenFlags::from_libc(flags);
        let truncate = access.is_writable() && flags & libc::O_TRUNC != 0;
        let fh = self.handles.open(path, access, truncate, truncate);
        CallReply::Opened { fh }
    }

    async fn create(&self, id: CallId, path: RemotePath, flags: i32) -> Result<CallReply> {
        self.run_empty(id, RemoteOp::Create { path: path.clone() }, None).await?;
        let mut access = OpenFlags::from_libc(flags);
        if !access.is_writable() {
            access = OpenFlags::ReadWrite;
        }
        let fh = self.handles.open(path.clone(), access, true, false);
        Ok(CallReply::Created {
            attr: RemoteAttr::file(path, 0),
            fh,
        })
    }

    async fn read(&self, id: CallId, fh: u64, offset: u64, size: u32) -> Result<Bytes> {
        let handle = self.handles.get(fh)?;
        let mut handle = handle.lock().await;
        self.commit(CallKind::Read, &handle.path);
        if !handle.flags.is_readable() {
            return Err(RestFsError::BadHandle { fh });
        }
        if size == 0 {
            return Ok(Bytes::new());
        }
        self.flush_locked(id, &mut handle).await?;

        let op = RemoteOp::Read {
            path: handle.path.clone(),
            offset,
            len: size,
        };
        let (_, response) = self.execute(id, &op, Some(fh)).await?;
        let data = interpret_read(&handle.path, &response, offset, size)?;
        handle.offset = offset + data.len() as u64;
        Ok(data)
    }

    async fn write(&self, id: CallId, fh: u64, offset: u64, data: Bytes) -> Result<u32> {
        let handle = self.handles.get(fh)?;
        let mut handle = handle.lock().await;
        self.commit(CallKind::Write, &handle.path);
        if !handle.flags.is_writable() {
            return Err(RestFsError::BadHandle { fh });
        }
        let len = u32::try_from(data.len()).map_err(|_| RestFsError::InvalidArgument {
            msg: format!("write of {} bytes is too large", data.len()),
        })?;
        if len == 0 {
            return Ok(0);
        }

        if !handle.buffer.can_absorb(offset, data.len()) {
            self.flush_locked(id, &mut handle).await?;
        }
        handle.buffer.absorb(offset, &data);
        handle.dirty = true;
        handle.offset = offset + u64::from(len);
        if handle.buffer.len() >= self.config.write_buffer_bytes {
            self.flush_locked(id, &mut handle).await?;
        }
        Ok(len)
    }

    /// Send the handle's pending bytes as one write request.
    async fn flush_locked(&self, id: CallId, handle: &mut FileHandle) -> Result<()> {
        if !handle.dirty {
            return Ok(());
        }
        let (start, data) = handle.buffer.take();
        if handle.replace {
            // replace the resource, then write the buffer past the hole
            let head = if start == 0 { data.clone() } else { Bytes::new() };
            let replaced = self
                .run_empty(
                    id,
                    RemoteOp::Write {
                        path: handle.path.clone(),
                        offset: 0,
                        data: head,
                        replace: true,
                    },
                    Some(handle.fh),
                )
                .await;
            if let Err(e) = replaced {
                handle.buffer.absorb(start, &data);
                return Err(e);
            }
            handle.replace = false;
            if start == 0 {
                handle.dirty = false;
                return Ok(());
            }
        } else if data.is_empty() {
            handle.dirty = false;
            return Ok(());
        }

        let op = RemoteOp::Write {
            path: handle.path.clone(),
            offset: start,
            data: data.clone(),
            replace: false,
        };
        match self.run_empty(id, op, Some(handle.fh)).await {
            Ok(()) => {
                handle.dirty = false;
                Ok(())
            }
            Err(e) => {
                // keep the bytes so a later flush can try again
                handle.buffer.absorb(start, &data);
                Err(e)
            }
        }
    }

    async fn release(&self, id: CallId, fh: u64) -> Result<()> {
        let handle = self.handles.get(fh)?;
        let flushed = {
            let mut handle = handle.lock().await;
            self.commit(CallKind::Release, &handle.path);
            self.flush_locked(id, &mut handle).await
        };
        self.handles.close(fh);
        if let Err(e) = &flushed {
            warn!("release of fh={} lost pending writes: {}", fh, e);
        }
        flushed
    }

    /// Flush every handle under `path`, ahead of a rename.
    async fn flush_under(&self, id: CallId, path: &RemotePath) -> Result<()> {
        for handle in self.handles.handles() {
            let mut handle = handle.lock().await;
            if handle.path.starts_with(path) {
                self.flush_locked(id, &mut handle).await?;
            }
        }
        Ok(())
    }

    async fn rename(&self, id: CallId, from: &RemotePath, to: &RemotePath) -> Result<()> {
        self.flush_under(id, from).await?;
        let moved = self
            .run_empty(
                id,
                RemoteOp::Rename {
                    from: from.clone(),
                    to: to.clone(),
                },
                None,
            )
            .await;

        match moved {
            Ok(()) => {}
            Err(RestFsError::NotSupported { .. }) if self.config.rename_fallback => {
                debug!("MOVE unsupported, copying {} to {}", from, to);
                self.copy_then_delete(id, from, to).await?;
            }
            Err(e) => return Err(e),
        }
        self.handles.repath(from, to).await;
        Ok(())
    }

    async fn copy_then_delete(&self, id: CallId, from: &RemotePath, to: &RemotePath) -> Result<()> {
        let attr = self.getattr(id, CallKind::GetAttr, from).await?;
        if attr.is_dir() {
            return Err(RestFsError::NotSupported {
                op: "rename of a directory without MOVE".to_string(),
            });
        }
        let data = self.read_prefix(id, from, attr.size).await?;
        self.run_empty(
            id,
            RemoteOp::Write {
                path: to.clone(),
                offset: 0,
                data,
                replace: true,
            },
            None,
        )
        .await?;
        self.run_empty(id, RemoteOp::Unlink { path: from.clone() }, None)
            .await
    }

    /// The first `len` bytes of `path`, zero-padded if the resource is shorter.
    async fn read_prefix(&self, id: CallId, path: &RemotePath, len: u64) -> Result<Bytes> {
        if len == 0 {
            return Ok(Bytes::new());
        }
        let want = u32::try_from(len).map_err(|_| RestFsError::InvalidArgument {
            msg: format!("{} is too large to copy ({} bytes)", path, len),
        })?;
        let op = RemoteOp::Read {
            path: path.clone(),
            offset: 0,
            len: want,
        };
        let (_, response) = self.execute(id, &op, None).await?;
        let data = interpret_read(path, &response, 0, want)?;
        if data.len() as u64 == len {
            return Ok(data);
        }
        let mut padded = BytesMut::with_capacity(len as usize);
        padded.extend_from_slice(&data);
        padded.resize(len as usize, 0);
        Ok(padded.freeze())
    }

    async fn truncate(&self, id: CallId, path: RemotePath, size: u64, fh: Option<u64>) -> Result<RemoteAttr> {
        let handle = match fh {
            Some(fh) => Some(self.handles.get(fh)?),
            None => None,
        };
        let mut guard = match &handle {
            Some(handle) => Some(handle.lock().await),
            None => None,
        };
        let target = match guard.as_mut() {
            Some(handle) => {
                self.flush_locked(id, handle).await?;
                handle.path.clone()
            }
            None => path,
        };

        let current = if size == 0 {
            None
        } else {
            Some(self.getattr(id, CallKind::Truncate, &target).await?.size)
        };
        let op = match current {
            Some(current) if current == size => None,
            // extending only needs the last byte; the host zero-fills the gap
            Some(current) if current < size => Some(RemoteOp::Write {
                path: target.clone(),
                offset: size - 1,
                data: Bytes::from_static(&[0]),
                replace: false,
            }),
            _ => Some(RemoteOp::Write {
                path: target.clone(),
                offset: 0,
                data: self.read_prefix(id, &target, size).await?,
                replace: true,
            }),
        };
        if let Some(op) = op {
            self.run_empty(id, op, fh).await?;
        }

        if let Some(handle) = guard.as_mut() {
            handle.buffer.truncate(size);
            handle.replace = false;
        }
        Ok(RemoteAttr::file(target, size))
    }

    /// Best-effort flush of every dirty handle, used while unmounting.
    async fn flush_all(&self) {
        for handle in self.handles.handles() {
            let mut handle = handle.lock().await;
            if !handle.dirty {
                continue;
            }
            if let Err(e) = self.flush_locked(CallId(0), &mut handle).await {
                warn!("unmount flush of {} (fh={}) failed: {}", handle.path, handle.fh, e);
            }
        }
    }
}
