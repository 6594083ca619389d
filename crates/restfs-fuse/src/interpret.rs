//! Response interpretation.
//!
//! Turns a [`RawResponse`] into filesystem results: attributes, bytes,
//! listings, or a [`RestFsError`] chosen by status code and call kind.

use crate::attr::{DirEntry, EntryKind, RemoteAttr};
use crate::call::CallKind;
use crate::error::{RestFsError, Result};
use crate::listing::parse_listing;
use crate::path::RemotePath;
use crate::translate::Verb;
use crate::transport::RawResponse;
use bytes::Bytes;
use http::header;
use std::time::SystemTime;

pub const TYPE_HEADER: &str = "x-restfs-type";

/// Map a non-success status to an error for `kind`; 2xx passes.
pub fn check_status(kind: CallKind, path: &RemotePath, status: u16) -> Result<()> {
    let path_str = || path.to_string();
    match status {
        200..=299 => Ok(()),
        404 | 410 => Err(RestFsError::NotFound { path: path_str() }),
        401 | 403 => Err(RestFsError::PermissionDenied { path: path_str() }),
        409 => match kind {
            CallKind::Create | CallKind::Mkdir | CallKind::Rename => {
                Err(RestFsError::AlreadyExists { path: path_str() })
            }
            CallKind::Rmdir => Err(RestFsError::NotEmpty { path: path_str() }),
            _ => Err(RestFsError::Http {
                path: path_str(),
                status,
            }),
        },
        412 if kind == CallKind::Create => Err(RestFsError::AlreadyExists { path: path_str() }),
        405 | 501 if kind == CallKind::Rename => Err(RestFsError::NotSupported {
            op: "MOVE".to_string(),
        }),
        500..=599 => Err(RestFsError::Http {
            path: path_str(),
            status,
        }),
        _ => {
            tracing::warn!("unexpected HTTP status {} for {} {}", status, kind, path);
            Err(RestFsError::Http {
                path: path_str(),
                status,
            })
        }
    }
}

fn media_type(response: &RawResponse) -> Option<String> {
    response
        .header_str(header::CONTENT_TYPE.as_str())
        .and_then(|ct| ct.split(';').next())
        .map(|ct| ct.trim().to_ascii_lowercase())
}

/// Whether the response describes a collection rather than a file.
pub fn is_directory(response: &RawResponse) -> bool {
    if response
        .header_str(TYPE_HEADER)
        .is_some_and(|t| t.trim().eq_ignore_ascii_case("directory"))
    {
        return true;
    }
    if matches!(
        media_type(response).as_deref(),
        Some("inode/directory") | Some("text/directory")
    ) {
        return true;
    }
    response
        .url
        .as_deref()
        .and_then(|u| url::Url::parse(u).ok())
        .is_some_and(|u| u.path().len() > 1 && u.path().ends_with('/'))
}

/// Total length from `Content-Range: bytes a-b/total`; `None` when absent or `*`.
pub fn content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.trim().rsplit_once('/')?;
    total.trim().parse().ok()
}

/// Parse an HTTP-date (`Sun, 06 Nov 1994 08:49:37 GMT`) or RFC 2822 date.
pub fn parse_http_date(value: &str) -> Option<SystemTime> {
    let value = value.trim();
    if let Ok(dt) = chrono::DateTime::parse_from_rfc2822(value) {
        return Some(SystemTime::from(dt));
    }
    chrono::NaiveDateTime::parse_from_str(value, "%a, %d %b %Y %H:%M:%S GMT")
        .ok()
        .map(|naive| SystemTime::from(naive.and_utc()))
}

/// Attributes from a metadata (HEAD, or ranged GET) response.
pub fn interpret_attr(path: &RemotePath, kind: CallKind, verb: Verb, response: &RawResponse) -> Result<RemoteAttr> {
    // a one-byte range on an empty resource; HEAD sends no range
    if response.status == 416 && verb == Verb::Get {
        let size = response
            .header_str(header::CONTENT_RANGE.as_str())
            .and_then(content_range_total)
            .unwrap_or(0);
        return Ok(RemoteAttr::file(path.clone(), size));
    }
    check_status(kind, path, response.status)?;

    let mtime = response
        .header_str(header::LAST_MODIFIED.as_str())
        .and_then(parse_http_date);
    let content_type = response
        .header_str(header::CONTENT_TYPE.as_str())
        .map(str::to_string);

    if is_directory(response) {
        return Ok(RemoteAttr {
            path: path.clone(),
            kind: EntryKind::Directory,
            size: 0,
            mtime,
            content_type,
        });
    }

    let size = if response.status == 206 {
        response
            .header_str(header::CONTENT_RANGE.as_str())
            .and_then(content_range_total)
    } else {
        None
    }
    .or_else(|| {
        response
            .header_str(header::CONTENT_LENGTH.as_str())
            .and_then(|v| v.trim().parse().ok())
    })
    .unwrap_or(response.body.len() as u64);

    Ok(RemoteAttr {
        path: path.clone(),
        kind: EntryKind::File,
        size,
        mtime,
        content_type,
    })
}

/// Bytes for a read of `len` bytes at `offset`.
///
/// A 206 body is the requested range, trimmed to `len`. A 200 body is the
/// whole resource (the host ignored `Range`) and is sliced. 416 is a read
/// past the end of the resource.
pub fn interpret_read(path: &RemotePath, response: &RawResponse, offset: u64, len: u32) -> Result<Bytes> {
    if response.status == 416 {
        return Ok(Bytes::new());
    }
    check_status(CallKind::Read, path, response.status)?;

    let len = len as usize;
    let body = &response.body;
    if response.status == 206 {
        return Ok(body.slice(..body.len().min(len)));
    }
    let start = usize::try_from(offset).unwrap_or(usize::MAX).min(body.len());
    let end = start.saturating_add(len).min(body.len());
    Ok(body.slice(start..end))
}

pub fn interpret_listing(path: &RemotePath, dir_url: &str, response: &RawResponse) -> Result<Vec<DirEntry>> {
    check_status(CallKind::ReadDir, path, response.status)?;
    let content_type = response.header_str(header::CONTENT_TYPE.as_str());
    parse_listing(dir_url, content_type, &response.body).map_err(|e| {
        tracing::warn!("unparseable listing for {}: {}", path, e);
        RestFsError::Http {
            path: path.to_string(),
            status: response.status,
        }
    })
}

/// Success-or-error for calls whose body carries nothing of interest.
pub fn interpret_empty(kind: CallKind, path: &RemotePath, response: &RawResponse) -> Result<()> {
    check_status(kind, path, response.status)
}
