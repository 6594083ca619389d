//! Directory listing parser.
//!
//! Remote hosts describe a collection in one of three shapes: a JSON document,
//! an HTML index page, or plain text with one name per line. Whatever the
//! shape, the result is a list of direct children with `.`/`..`, empty and
//! duplicate names removed.

use crate::attr::{DirEntry, EntryKind};
use serde_json::Value;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ListingError {
    #[error("invalid JSON listing: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unrecognized JSON listing shape")]
    Shape,

    #[error("listing body is not UTF-8")]
    Encoding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Json,
    Html,
    Text,
}

fn detect_format(content_type: Option<&str>, body: &str) -> Format {
    if let Some(ct) = content_type {
        let ct = ct.to_ascii_lowercase();
        if ct.contains("json") {
            return Format::Json;
        }
        if ct.contains("html") || ct.contains("xhtml") {
            return Format::Html;
        }
    }
    let trimmed = body.trim_start();
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        return Format::Json;
    }
    let lower = trimmed
        .chars()
        .take(512)
        .collect::<String>()
        .to_ascii_lowercase();
    if lower.starts_with("<!doctype html") || lower.contains("<html") || lower.contains("<a ") {
        return Format::Html;
    }
    Format::Text
}

/// Parse the body of a listing response for the collection at `dir_url`.
pub fn parse_listing(
    dir_url: &str,
    content_type: Option<&str>,
    body: &[u8],
) -> Result<Vec<DirEntry>, ListingError> {
    let text = std::str::from_utf8(body).map_err(|_| ListingError::Encoding)?;
    let raw = match detect_format(content_type, text) {
        Format::Json => parse_json(text)?,
        Format::Html => parse_html(dir_url, text),
        Format::Text => parse_text(text),
    };
    Ok(dedupe(raw))
}

struct RawEntry {
    name: String,
    kind: EntryKind,
    size: Option<u64>,
}

fn parse_json(text: &str) -> Result<Vec<RawEntry>, ListingError> {
    let value: Value = serde_json::from_str(text)?;
    let items = match &value {
        Value::Array(items) => items,
        Value::Object(map) => match map.get("entries") {
            Some(Value::Array(items)) => items,
            _ => return Err(ListingError::Shape),
        },
        _ => return Err(ListingError::Shape),
    };

    let mut entries = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::String(name) => entries.push(RawEntry {
                name: name.clone(),
                kind: EntryKind::File,
                size: None,
            }),
            Value::Object(obj) => {
                let Some(name) = obj.get("name").and_then(Value::as_str) else {
                    continue;
                };
                let kind = match obj.get("type").and_then(Value::as_str) {
                    Some(t) if t.eq_ignore_ascii_case("directory") || t.eq_ignore_ascii_case("dir") => {
                        EntryKind::Directory
                    }
                    _ => EntryKind::File,
                };
                entries.push(RawEntry {
                    name: name.to_string(),
                    kind,
                    size: obj.get("size").and_then(Value::as_u64),
                });
            }
            _ => {}
        }
    }
    Ok(entries)
}

fn href_values(html: &str) -> Vec<&str> {
    let lower = html.to_ascii_lowercase();
    let mut values = Vec::new();
    let mut cursor = 0;
    while let Some(found) = lower[cursor..].find("href") {
        let mut pos = cursor + found + 4;
        cursor = pos;
        let bytes = lower.as_bytes();
        while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
            pos += 1;
        }
        if bytes.get(pos) != Some(&b'=') {
            continue;
        }
        pos += 1;
        while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
            pos += 1;
        }
        let (start, end) = match bytes.get(pos) {
            Some(&q) if q == b'"' || q == b'\'' => {
                let start = pos + 1;
                match lower[start..].find(q as char) {
                    Some(len) => (start, start + len),
                    None => break,
                }
            }
            Some(_) => {
                let start = pos;
                let len = lower[start..]
                    .find(|c: char| c.is_ascii_whitespace() || c == '>')
                    .unwrap_or(lower.len() - start);
                (start, start + len)
            }
            None => break,
        };
        // ASCII lowercasing keeps byte offsets aligned with the original
        values.push(&html[start..end]);
        cursor = end;
    }
    values
}

fn dir_path_of(dir_url: &str) -> String {
    let path = url::Url::parse(dir_url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| "/".to_string());
    if path.ends_with('/') {
        path
    } else {
        format!("{}/", path)
    }
}

fn parse_html(dir_url: &str, html: &str) -> Vec<RawEntry> {
    let dir_url_slash = if dir_url.ends_with('/') {
        dir_url.to_string()
    } else {
        format!("{}/", dir_url)
    };
    let dir_path = dir_path_of(dir_url);

    let mut entries = Vec::new();
    for href in href_values(html) {
        let href = href.trim();
        if href.is_empty() || href.starts_with('?') || href.starts_with('#') {
            continue;
        }
        let relative = if href.contains("://") {
            match href.strip_prefix(dir_url_slash.as_str()) {
                Some(rest) => rest,
                None => continue,
            }
        } else if href.starts_with("//") {
            continue;
        } else if href.starts_with('/') {
            match href.strip_prefix(dir_path.as_str()) {
                Some(rest) => rest,
                None => continue,
            }
        } else if href.contains(':') && !href.contains('/') {
            // mailto:, javascript: and friends
            continue;
        } else {
            href.strip_prefix("./").unwrap_or(href)
        };

        let relative = relative
            .split(|c| c == '?' || c == '#')
            .next()
            .unwrap_or_default();
        let (name, kind) = match relative.strip_suffix('/') {
            Some(name) => (name, EntryKind::Directory),
            None => (relative, EntryKind::File),
        };
        if name.is_empty() || name.contains('/') {
            continue;
        }
        entries.push(RawEntry {
            name: name.to_string(),
            kind,
            size: None,
        });
    }
    entries
}

fn parse_text(text: &str) -> Vec<RawEntry> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| RawEntry {
            name: line.to_string(),
            kind: EntryKind::File,
            size: None,
        })
        .collect()
}

fn dedupe(raw: Vec<RawEntry>) -> Vec<DirEntry> {
    let mut seen = HashSet::new();
    let mut entries = Vec::with_capacity(raw.len());
    for entry in raw {
        let (name, kind) = match entry.name.strip_suffix('/') {
            Some(stripped) => (stripped, EntryKind::Directory),
            None => (entry.name.as_str(), entry.kind),
        };
        let name = match urlencoding::decode(name) {
            Ok(decoded) => decoded.into_owned(),
            Err(_) => name.to_string(),
        };
        if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0') {
            continue;
        }
        if !seen.insert(name.clone()) {
            continue;
        }
        entries.push(DirEntry {
            name,
            kind,
            size: entry.size,
        });
    }
    entries
}
