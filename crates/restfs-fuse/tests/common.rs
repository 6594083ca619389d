//! Common test utilities: an in-memory remote host and a channel-backed
//! host dispatch, so the engine can be driven without a kernel or a network.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderValue};
use restfs_fuse::{
    Adapter, CallId, CallReply, EngineConfig, FilesystemCall, FsOp, HostDispatch, MountEngine,
    RawResponse, RemotePath, Result, RetryPolicy, Scheme, Transport, TransportError, Translator,
    Verb,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;

/// One request as the remote host saw it.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub verb: Verb,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

/// A remote resource tree held in memory with PUT-then-GET consistency.
///
/// Directories answer `GET dir/` with a JSON listing and carry
/// `x-restfs-type: directory` on metadata requests.
pub struct MemoryHost {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    dirs: Mutex<BTreeSet<String>>,
    log: Mutex<Vec<SeenRequest>>,
    /// Next N requests are answered with 503.
    fail_with_503: AtomicU32,
    /// Next N requests fail before reaching the host.
    fail_to_connect: AtomicU32,
    /// Answer MOVE with 405.
    reject_move: AtomicBool,
    /// Delay before answering each request.
    latency_ms: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for MemoryHost {
    fn default() -> Self {
        let mut dirs = BTreeSet::new();
        dirs.insert("/".to_string());
        Self {
            files: Mutex::new(BTreeMap::new()),
            dirs: Mutex::new(dirs),
            log: Mutex::new(Vec::new()),
            fail_with_503: AtomicU32::new(0),
            fail_to_connect: AtomicU32::new(0),
            reject_move: AtomicBool::new(false),
            latency_ms: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }
}

impl MemoryHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put_file(&self, path: &str, data: &[u8]) {
        self.files.lock().unwrap().insert(path.to_string(), data.to_vec());
    }

    pub fn add_dir(&self, path: &str) {
        self.dirs.lock().unwrap().insert(path.trim_end_matches('/').to_string());
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.dirs.lock().unwrap().contains(path)
    }

    pub fn requests(&self) -> Vec<SeenRequest> {
        self.log.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.log.lock().unwrap().len()
    }

    pub fn clear_log(&self) {
        self.log.lock().unwrap().clear();
    }

    pub fn fail_next_with_503(&self, n: u32) {
        self.fail_with_503.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_connects(&self, n: u32) {
        self.fail_to_connect.store(n, Ordering::SeqCst);
    }

    pub fn reject_move(&self) {
        self.reject_move.store(true, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn respond(&self, verb: Verb, url: &Url, headers: &HeaderMap, body: Option<Bytes>) -> RawResponse {
        let raw_path = url.path();
        let is_dir_url = raw_path.len() > 1 && raw_path.ends_with('/');
        let decoded = urlencoding::decode(raw_path)
            .map(|p| p.into_owned())
            .unwrap_or_else(|_| raw_path.to_string());
        let path = if decoded == "/" {
            decoded
        } else {
            decoded.trim_end_matches('/').to_string()
        };

        match verb {
            Verb::Head | Verb::Get if raw_path == "/" || is_dir_url => {
                if verb == Verb::Get {
                    self.listing(&path)
                } else {
                    self.dir_head(&path)
                }
            }
            Verb::Head => self.head(&path),
            Verb::Get => self.get(&path, headers),
            Verb::Put | Verb::Patch if is_dir_url => self.mkdir(&path),
            Verb::Put | Verb::Patch => self.put(&path, headers, body.unwrap_or_default()),
            Verb::Delete => self.delete(&path),
            Verb::Move => self.move_resource(&path, headers),
            _ => status(405),
        }
    }

    fn parent_exists(&self, path: &str) -> bool {
        let parent = match path.rsplit_once('/') {
            Some(("", _)) | None => "/",
            Some((parent, _)) => parent,
        };
        self.dirs.lock().unwrap().contains(parent)
    }

    fn dir_head(&self, path: &str) -> RawResponse {
        if self.has_dir(path) {
            directory_response()
        } else {
            status(404)
        }
    }

    fn head(&self, path: &str) -> RawResponse {
        if self.has_dir(path) {
            return directory_response();
        }
        match self.file(path) {
            Some(data) => {
                let mut resp = status(200);
                resp.headers.insert(header::CONTENT_LENGTH, HeaderValue::from(data.len()));
                resp
            }
            None => status(404),
        }
    }

    fn get(&self, path: &str, headers: &HeaderMap) -> RawResponse {
        if self.has_dir(path) {
            return directory_response();
        }
        let Some(data) = self.file(path) else {
            return status(404);
        };
        let total = data.len() as u64;
        let range = headers
            .get(header::RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_range);
        match range {
            None => {
                let mut resp = status(200);
                resp.body = Bytes::from(data);
                resp
            }
            Some((start, _)) if start >= total => {
                let mut resp = status(416);
                resp.headers.insert(
                    header::CONTENT_RANGE,
                    HeaderValue::from_str(&format!("bytes */{}", total)).unwrap(),
                );
                resp
            }
            Some((start, end)) => {
                let end = end.min(total - 1);
                let mut resp = status(206);
                resp.headers.insert(
                    header::CONTENT_RANGE,
                    HeaderValue::from_str(&format!("bytes {}-{}/{}", start, end, total)).unwrap(),
                );
                resp.body = Bytes::copy_from_slice(&data[start as usize..=end as usize]);
                resp
            }
        }
    }

    fn listing(&self, path: &str) -> RawResponse {
        if !self.has_dir(path) {
            return status(404);
        }
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        let direct_child = |p: &str| -> Option<String> {
            let rest = p.strip_prefix(&prefix)?;
            (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
        };

        let mut entries = Vec::new();
        for (name, data) in self.files.lock().unwrap().iter() {
            if let Some(child) = direct_child(name) {
                entries.push(serde_json::json!({"name": child, "type": "file", "size": data.len()}));
            }
        }
        for dir in self.dirs.lock().unwrap().iter() {
            if let Some(child) = direct_child(dir) {
                entries.push(serde_json::json!({"name": child, "type": "directory"}));
            }
        }
        let mut resp = status(200);
        resp.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        resp.body = Bytes::from(serde_json::to_vec(&entries).unwrap());
        resp
    }

    fn mkdir(&self, path: &str) -> RawResponse {
        if !self.parent_exists(path) {
            return status(404);
        }
        if self.has_dir(path) || self.file(path).is_some() {
            return status(409);
        }
        self.add_dir(path);
        status(201)
    }

    fn put(&self, path: &str, headers: &HeaderMap, body: Bytes) -> RawResponse {
        if self.has_dir(path) {
            return status(409);
        }
        if !self.parent_exists(path) {
            return status(404);
        }
        let range = headers
            .get(header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_start);
        let mut files = self.files.lock().unwrap();
        let created = !files.contains_key(path);
        match range {
            None => {
                files.insert(path.to_string(), body.to_vec());
            }
            Some(start) => {
                let data = files.entry(path.to_string()).or_default();
                let end = start as usize + body.len();
                if data.len() < end {
                    data.resize(end, 0);
                }
                data[start as usize..end].copy_from_slice(&body);
            }
        }
        status(if created { 201 } else { 204 })
    }

    fn delete(&self, path: &str) -> RawResponse {
        if self.files.lock().unwrap().remove(path).is_some() {
            return status(204);
        }
        if path != "/" && self.has_dir(path) {
            let prefix = format!("{}/", path);
            let busy = self.files.lock().unwrap().keys().any(|k| k.starts_with(&prefix))
                || self.dirs.lock().unwrap().iter().any(|d| d.starts_with(&prefix));
            if busy {
                return status(409);
            }
            self.dirs.lock().unwrap().remove(path);
            return status(204);
        }
        status(404)
    }

    fn move_resource(&self, from: &str, headers: &HeaderMap) -> RawResponse {
        if self.reject_move.load(Ordering::SeqCst) {
            return status(405);
        }
        let Some(destination) = headers
            .get("destination")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Url::parse(v).ok())
        else {
            return status(400);
        };
        let to = urlencoding::decode(destination.path())
            .map(|p| p.trim_end_matches('/').to_string())
            .unwrap_or_default();
        if !self.parent_exists(&to) {
            return status(409);
        }

        let mut files = self.files.lock().unwrap();
        if let Some(data) = files.remove(from) {
            files.insert(to, data);
            return status(201);
        }
        let mut dirs = self.dirs.lock().unwrap();
        if !dirs.contains(from) {
            return status(404);
        }
        let prefix = format!("{}/", from);
        let rebase = |p: &str| format!("{}{}", to, &p[from.len()..]);
        let moved_files: Vec<String> = files.keys().filter(|k| k.starts_with(&prefix)).cloned().collect();
        for key in moved_files {
            if let Some(data) = files.remove(&key) {
                files.insert(rebase(&key), data);
            }
        }
        let moved_dirs: Vec<String> = dirs
            .iter()
            .filter(|d| d.as_str() == from || d.starts_with(&prefix))
            .cloned()
            .collect();
        for dir in moved_dirs {
            dirs.remove(&dir);
            dirs.insert(rebase(&dir));
        }
        status(201)
    }
}

#[async_trait]
impl Transport for MemoryHost {
    async fn send(
        &self,
        verb: Verb,
        url: &Url,
        headers: &HeaderMap,
        body: Option<Bytes>,
    ) -> std::result::Result<RawResponse, TransportError> {
        self.log.lock().unwrap().push(SeenRequest {
            verb,
            url: url.to_string(),
            headers: headers.clone(),
            body: body.clone(),
        });

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if Self::take_one(&self.fail_to_connect) {
            return Err(TransportError::Connect(format!("{} refused", url)));
        }
        if Self::take_one(&self.fail_with_503) {
            return Ok(status(503));
        }
        let mut resp = self.respond(verb, url, headers, body);
        resp.url = Some(url.to_string());
        Ok(resp)
    }
}

fn status(code: u16) -> RawResponse {
    RawResponse {
        status: code,
        headers: HeaderMap::new(),
        body: Bytes::new(),
        url: None,
    }
}

fn directory_response() -> RawResponse {
    let mut resp = status(200);
    resp.headers
        .insert("x-restfs-type", HeaderValue::from_static("directory"));
    resp
}

/// `bytes=a-b` to `(a, b)`.
fn parse_range(value: &str) -> Option<(u64, u64)> {
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

/// Start offset of `bytes a-b/*`.
fn parse_content_range_start(value: &str) -> Option<u64> {
    let (start, _) = value.strip_prefix("bytes ")?.split_once('-')?;
    start.parse().ok()
}

/// Host dispatch fed by a channel; replies are forwarded to another channel.
pub struct ChannelHost {
    calls: tokio::sync::Mutex<mpsc::UnboundedReceiver<FilesystemCall>>,
    replies: mpsc::UnboundedSender<(CallId, Result<CallReply>)>,
    deregistered: AtomicUsize,
}

impl ChannelHost {
    pub fn new() -> (
        mpsc::UnboundedSender<FilesystemCall>,
        Arc<ChannelHost>,
        mpsc::UnboundedReceiver<(CallId, Result<CallReply>)>,
    ) {
        let (call_tx, call_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let host = Arc::new(ChannelHost {
            calls: tokio::sync::Mutex::new(call_rx),
            replies: reply_tx,
            deregistered: AtomicUsize::new(0),
        });
        (call_tx, host, reply_rx)
    }

    pub fn deregistered(&self) -> usize {
        self.deregistered.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HostDispatch for ChannelHost {
    async fn receive_call(&self) -> Option<FilesystemCall> {
        self.calls.lock().await.recv().await
    }

    fn reply(&self, id: CallId, result: Result<CallReply>) {
        let _ = self.replies.send((id, result));
    }

    fn deregister(&self) -> Result<()> {
        self.deregistered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_delay_ms: 1,
        max_delay_ms: 5,
        backoff_multiplier: 2.0,
    }
}

pub fn engine_with<A: Adapter + 'static>(
    adapter: A,
    remote: Arc<MemoryHost>,
    config: EngineConfig,
) -> Arc<MountEngine> {
    let translator = Translator::new(Scheme::Https, "example.com").unwrap();
    Arc::new(MountEngine::new(Arc::new(adapter), remote, translator, config))
}

pub fn engine(remote: Arc<MemoryHost>) -> Arc<MountEngine> {
    engine_with(
        restfs_fuse::NoopAdapter,
        remote,
        EngineConfig {
            retry: fast_retry(),
            ..Default::default()
        },
    )
}

pub fn path(p: &str) -> RemotePath {
    RemotePath::parse(p).unwrap()
}

pub fn call(id: u64, op: FsOp) -> FilesystemCall {
    FilesystemCall { id: CallId(id), op }
}

/// Open `p` with `flags` and return the handle.
pub async fn open(engine: &MountEngine, id: u64, p: &str, flags: i32) -> u64 {
    match engine
        .dispatch(call(id, FsOp::Open { path: path(p), flags }))
        .await
        .unwrap()
    {
        CallReply::Opened { fh } => fh,
        other => panic!("expected a handle, got {:?}", other),
    }
}
