//! Adapter contract.
//!
//! An adapter sees every request RestFS is about to send and every response it
//! receives. `precommit` may rewrite the outbound request; `postcommit` only
//! observes. Both run synchronously on the task driving the filesystem call.

use crate::call::CallKind;
use crate::path::RemotePath;
use crate::transport::RawResponse;
use crate::translate::Verb;
use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("adapter rejected the request: {0}")]
    Rejected(String),

    #[error("adapter returned a malformed request: {0}")]
    Malformed(String),

    #[error("adapter panicked: {0}")]
    Panicked(String),
}

impl From<AdapterError> for crate::error::RestFsError {
    fn from(e: AdapterError) -> Self {
        crate::error::RestFsError::Adapter { msg: e.to_string() }
    }
}

/// The `(verb, headers, url, body)` tuple handed to and returned from
/// [`Adapter::precommit`].
///
/// `body` is `None` for requests without a body and `Some` (possibly empty)
/// for requests that carry one.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterRequest {
    pub verb: Verb,
    pub headers: HeaderMap,
    pub url: String,
    pub body: Option<Bytes>,
}

impl AdapterRequest {
    /// Check that a (possibly rewritten) request can still be sent.
    pub fn validate(&self) -> Result<Url, AdapterError> {
        let url = Url::parse(&self.url)
            .map_err(|e| AdapterError::Malformed(format!("url {:?}: {}", self.url, e)))?;
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(AdapterError::Malformed(format!(
                    "unsupported scheme {:?} in {}",
                    other, self.url
                )))
            }
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(AdapterError::Malformed(format!("no host in {}", self.url)));
        }
        Ok(url)
    }
}

/// Interception hooks for outbound requests and completed responses.
///
/// Every method has a pass-through default, so an implementation overrides
/// only the hooks it needs.
pub trait Adapter: Send + Sync {
    /// Called right before a request is sent. The returned request is sent
    /// verbatim.
    fn precommit(&self, request: AdapterRequest) -> Result<AdapterRequest, AdapterError> {
        Ok(request)
    }

    /// Called after each response is received, before it is interpreted.
    /// Errors are logged and otherwise ignored.
    fn postcommit(&self, _status: u16, _response: &RawResponse) -> Result<(), AdapterError> {
        Ok(())
    }

    /// Called once per filesystem call before it is translated.
    fn commit(&self, _kind: CallKind, _path: &RemotePath) {}
}

/// Adapter that intercepts nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAdapter;

impl Adapter for NoopAdapter {}

/// Adds a fixed set of headers to every outbound request, replacing any
/// header of the same name.
#[derive(Debug, Clone, Default)]
pub struct StaticHeaderAdapter {
    headers: HeaderMap,
}

impl StaticHeaderAdapter {
    pub fn new<I, K, V>(pairs: I) -> Result<Self, AdapterError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            let name = HeaderName::from_bytes(name.as_ref().trim().as_bytes()).map_err(|e| {
                AdapterError::Malformed(format!("header name {:?}: {}", name.as_ref(), e))
            })?;
            let value = HeaderValue::from_str(value.as_ref().trim())
                .map_err(|e| AdapterError::Malformed(format!("header {}: {}", name, e)))?;
            headers.insert(name, value);
        }
        Ok(Self { headers })
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}

impl Adapter for StaticHeaderAdapter {
    fn precommit(&self, mut request: AdapterRequest) -> Result<AdapterRequest, AdapterError> {
        for (name, value) in &self.headers {
            request.headers.insert(name.clone(), value.clone());
        }
        Ok(request)
    }
}

/// Split a `Name: value` command-line header.
pub fn parse_header_arg(raw: &str) -> Option<(String, String)> {
    let (name, value) = raw.split_once(':')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), value.trim().to_string()))
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Run `precommit`, turning a panic into an error and validating the result.
pub(crate) fn run_precommit(
    adapter: &dyn Adapter,
    request: AdapterRequest,
) -> Result<(AdapterRequest, Url), AdapterError> {
    let rewritten = catch_unwind(AssertUnwindSafe(|| adapter.precommit(request)))
        .map_err(|p| AdapterError::Panicked(panic_message(p)))??;
    let url = rewritten.validate()?;
    Ok((rewritten, url))
}

/// Run `postcommit`, logging and discarding any failure.
pub(crate) fn run_postcommit(adapter: &dyn Adapter, response: &RawResponse) {
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        adapter.postcommit(response.status, response)
    }));
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("postcommit failed (ignored): {}", e),
        Err(p) => tracing::warn!("postcommit panicked (ignored): {}", panic_message(p)),
    }
}

/// Run `commit`, logging and discarding a panic.
pub(crate) fn run_commit(adapter: &dyn Adapter, kind: CallKind, path: &RemotePath) {
    if let Err(p) = catch_unwind(AssertUnwindSafe(|| adapter.commit(kind, path))) {
        tracing::warn!("commit hook panicked (ignored): {}", panic_message(p));
    }
}
