//! Request translation.
//!
//! Maps a remote filesystem operation onto the HTTP request that carries it:
//!
//! | call              | verb              | url                   | body / headers                 |
//! |-------------------|-------------------|-----------------------|--------------------------------|
//! | lookup / getattr  | HEAD (or GET)     | `scheme://host/path`  | none                           |
//! | readdir           | GET               | `scheme://host/path/` | none, `Accept`                 |
//! | read              | GET               | `scheme://host/path`  | none, `Range`                  |
//! | write             | PUT (or PATCH)    | `scheme://host/path`  | payload, `Content-Range`       |
//! | create            | PUT               | `scheme://host/path`  | empty                          |
//! | mkdir             | PUT               | `scheme://host/path/` | empty                          |
//! | unlink / rmdir    | DELETE            | `scheme://host/path`  | none                           |
//! | rename            | MOVE              | `scheme://host/old`   | none, `Destination: .../new`   |
//!
//! Adapters can rely on seeing exactly these shapes in `precommit`.

use crate::adapter::AdapterRequest;
use crate::call::{CallId, CallKind};
use crate::error::{RestFsError, Result};
use crate::path::RemotePath;
use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verb {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
    Move,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Get => "GET",
            Verb::Head => "HEAD",
            Verb::Post => "POST",
            Verb::Put => "PUT",
            Verb::Delete => "DELETE",
            Verb::Connect => "CONNECT",
            Verb::Options => "OPTIONS",
            Verb::Trace => "TRACE",
            Verb::Patch => "PATCH",
            Verb::Move => "MOVE",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    #[default]
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl FromStr for Scheme {
    type Err = RestFsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            other => Err(RestFsError::InvalidArgument {
                msg: format!("protocol must be http or https, got {:?}", other),
            }),
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The remote half of a filesystem call.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteOp {
    Lookup {
        path: RemotePath,
    },
    GetAttr {
        path: RemotePath,
    },
    ReadDir {
        path: RemotePath,
    },
    Read {
        path: RemotePath,
        offset: u64,
        len: u32,
    },
    /// `replace` sends the payload as the complete new resource; otherwise the
    /// payload is a byte range of it.
    Write {
        path: RemotePath,
        offset: u64,
        data: Bytes,
        replace: bool,
    },
    Create {
        path: RemotePath,
    },
    Mkdir {
        path: RemotePath,
    },
    Unlink {
        path: RemotePath,
    },
    Rmdir {
        path: RemotePath,
    },
    Rename {
        from: RemotePath,
        to: RemotePath,
    },
}

impl RemoteOp {
    pub fn kind(&self) -> CallKind {
        match self {
            RemoteOp::Lookup { .. } => CallKind::Lookup,
            RemoteOp::GetAttr { .. } => CallKind::GetAttr,
            RemoteOp::ReadDir { .. } => CallKind::ReadDir,
            RemoteOp::Read { .. } => CallKind::Read,
            RemoteOp::Write { .. } => CallKind::Write,
            RemoteOp::Create { .. } => CallKind::Create,
            RemoteOp::Mkdir { .. } => CallKind::Mkdir,
            RemoteOp::Unlink { .. } => CallKind::Unlink,
            RemoteOp::Rmdir { .. } => CallKind::Rmdir,
            RemoteOp::Rename { .. } => CallKind::Rename,
        }
    }

    /// The path the request addresses (the source, for a rename).
    pub fn path(&self) -> &RemotePath {
        match self {
            RemoteOp::Lookup { path }
            | RemoteOp::GetAttr { path }
            | RemoteOp::ReadDir { path }
            | RemoteOp::Read { path, .. }
            | RemoteOp::Write { path, .. }
            | RemoteOp::Create { path }
            | RemoteOp::Mkdir { path }
            | RemoteOp::Unlink { path }
            | RemoteOp::Rmdir { path } => path,
            RemoteOp::Rename { from, .. } => from,
        }
    }
}

/// One HTTP exchange on its way to the transport.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub call_id: CallId,
    pub kind: CallKind,
    pub path: RemotePath,
    pub verb: Verb,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub fh: Option<u64>,
}

impl PendingRequest {
    pub fn to_adapter_request(&self) -> AdapterRequest {
        AdapterRequest {
            verb: self.verb,
            headers: self.headers.clone(),
            url: self.url.clone(),
            body: self.body.clone(),
        }
    }
}

const LISTING_ACCEPT: &str = "application/json, text/html;q=0.9, text/plain;q=0.8";

#[derive(Debug, Clone)]
pub struct Translator {
    scheme: Scheme,
    host: String,
    metadata_verb: Verb,
    write_verb: Verb,
}

impl Translator {
    pub fn new(scheme: Scheme, host: &str) -> Result<Self> {
        validate_host(host)?;
        Ok(Translator {
            scheme,
            host: host.to_string(),
            metadata_verb: Verb::Head,
            write_verb: Verb::Put,
        })
    }

    /// Use GET (with a one-byte range) instead of HEAD for metadata lookups.
    pub fn with_metadata_verb(mut self, verb: Verb) -> Result<Self> {
        if !matches!(verb, Verb::Head | Verb::Get) {
            return Err(RestFsError::InvalidArgument {
                msg: format!("metadata verb must be HEAD or GET, got {}", verb),
            });
        }
        self.metadata_verb = verb;
        Ok(self)
    }

    pub fn with_write_verb(mut self, verb: Verb) -> Result<Self> {
        if !matches!(verb, Verb::Put | Verb::Patch) {
            return Err(RestFsError::InvalidArgument {
                msg: format!("write verb must be PUT or PATCH, got {}", verb),
            });
        }
        self.write_verb = verb;
        Ok(self)
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Absolute URL for `path`; `dir` appends the trailing separator used for
    /// collection resources.
    pub fn url_for(&self, path: &RemotePath, dir: bool) -> String {
        let mut url = format!("{}://{}", self.scheme, self.host);
        for segment in path.segments() {
            url.push('/');
            url.push_str(&urlencoding::encode(segment));
        }
        if path.is_root() || dir {
            url.push('/');
        }
        url
    }

    pub fn translate(
        &self,
        call_id: CallId,
        op: &RemoteOp,
        fh: Option<u64>,
    ) -> Result<PendingRequest> {
        let mut headers = HeaderMap::new();
        let (verb, url, body) = match op {
            RemoteOp::Lookup { path } | RemoteOp::GetAttr { path } => {
                if self.metadata_verb == Verb::Get {
                    headers.insert(header::RANGE, HeaderValue::from_static("bytes=0-0"));
                }
                (self.metadata_verb, self.url_for(path, false), None)
            }
            RemoteOp::ReadDir { path } => {
                headers.insert(header::ACCEPT, HeaderValue::from_static(LISTING_ACCEPT));
                (Verb::Get, self.url_for(path, true), None)
            }
            RemoteOp::Read { path, offset, len } => {
                if *len == 0 {
                    return Err(RestFsError::InvalidArgument {
                        msg: "zero-length read has no byte range".to_string(),
                    });
                }
                let last = offset + u64::from(*len) - 1;
                headers.insert(
                    header::RANGE,
                    header_value(&format!("bytes={}-{}", offset, last))?,
                );
                (Verb::Get, self.url_for(path, false), None)
            }
            RemoteOp::Write {
                path,
                offset,
                data,
                replace,
            } => {
                if *replace {
                    if *offset != 0 {
                        return Err(RestFsError::InvalidArgument {
                            msg: format!("replacing write must start at 0, got {}", offset),
                        });
                    }
                    (Verb::Put, self.url_for(path, false), Some(data.clone()))
                } else {
                    if data.is_empty() {
                        return Err(RestFsError::InvalidArgument {
                            msg: "partial write without payload".to_string(),
                        });
                    }
                    let last = offset + data.len() as u64 - 1;
                    headers.insert(
                        header::CONTENT_RANGE,
                        header_value(&format!("bytes {}-{}/*", offset, last))?,
                    );
                    (self.write_verb, self.url_for(path, false), Some(data.clone()))
                }
            }
            RemoteOp::Create { path } => (Verb::Put, self.url_for(path, false), Some(Bytes::new())),
            RemoteOp::Mkdir { path } => (Verb::Put, self.url_for(path, true), Some(Bytes::new())),
            RemoteOp::Unlink { path } | RemoteOp::Rmdir { path } => {
                (Verb::Delete, self.url_for(path, false), None)
            }
            RemoteOp::Rename { from, to } => {
                headers.insert(
                    HeaderName::from_static("destination"),
                    header_value(&self.url_for(to, false))?,
                );
                headers.insert(
                    HeaderName::from_static("overwrite"),
                    HeaderValue::from_static("T"),
                );
                (Verb::Move, self.url_for(from, false), None)
            }
        };

        Ok(PendingRequest {
            call_id,
            kind: op.kind(),
            path: op.path().clone(),
            verb,
            url,
            headers,
            body,
            fh,
        })
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| RestFsError::InvalidArgument {
        msg: format!("invalid header value {:?}: {}", value, e),
    })
}

/// Accepts `name` or `name:port`; anything that would change the URL's
/// structure is rejected.
pub fn validate_host(host: &str) -> Result<()> {
    let bad = host.is_empty()
        || host
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '/' | '\\' | '@' | '?' | '#'));
    if bad {
        return Err(RestFsError::InvalidArgument {
            msg: format!("invalid host {:?}", host),
        });
    }
    let parsed = url::Url::parse(&format!("http://{}/", host)).map_err(|e| {
        RestFsError::InvalidArgument {
            msg: format!("invalid host {:?}: {}", host, e),
        }
    })?;
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(RestFsError::InvalidArgument {
            msg: format!("invalid host {:?}", host),
        });
    }
    Ok(())
}
