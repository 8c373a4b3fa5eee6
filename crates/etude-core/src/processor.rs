// src/processor.rs
//! Turns one raw request read into a response decision.
//!
//! The parser wants a complete header block. It keeps only the last path
//! segment of the request target and looks that name up directly under the
//! document root. Targets are used as raw bytes, never percent-decoded.

use std::ffi::OsStr;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// Shortest buffer that can carry `GET / HTTP/1.1\r\n\r\n`.
pub const MIN_REQUEST_LEN: usize = 18;

pub const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

pub const NOT_FOUND_RESPONSE: &[u8] = b"HTTP/1.1 404 Not Found\r\nConnection: close\r\n";

/// Success header block announcing a body of `content_length` bytes.
pub fn ok_headers(content_length: u64) -> Vec<u8> {
    format!(
        "HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Type: text/javascript\r\nContent-Length: {}\r\n\r\n",
        content_length
    )
    .into_bytes()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Found { path: PathBuf, size: u64 },
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    File { headers: Vec<u8>, body: Vec<u8> },
    NotFound,
}

impl Response {
    /// Wire segments in send order.
    pub fn segments(&self) -> Vec<&[u8]> {
        match self {
            Response::File { headers, body } => vec![headers.as_slice(), body.as_slice()],
            Response::NotFound => vec![NOT_FOUND_RESPONSE],
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestProcessor {
    root: PathBuf,
}

impl RequestProcessor {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Map a raw request onto a path under the document root, without
    /// touching the filesystem. `None` when the request is truncated or its
    /// target has no usable final segment.
    pub fn resolve(&self, raw: &[u8]) -> Option<PathBuf> {
        if raw.len() < MIN_REQUEST_LEN || !raw.ends_with(HEADER_TERMINATOR) {
            return None;
        }

        let target = raw
            .split(|b| b.is_ascii_whitespace())
            .filter(|token| !token.is_empty())
            .nth(1)?;

        let segment = final_segment(target)?;
        Some(self.root.join(OsStr::from_bytes(segment)))
    }

    /// Resolve and check for a regular file. A symlink is never followed,
    /// wherever it points.
    pub fn lookup(&self, raw: &[u8]) -> Lookup {
        let Some(path) = self.resolve(raw) else {
            return Lookup::NotFound;
        };

        match fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_file() => Lookup::Found {
                path,
                size: meta.len(),
            },
            Ok(_) => Lookup::NotFound,
            Err(err) => {
                tracing::debug!("lookup of {} failed: {}", path.display(), err);
                Lookup::NotFound
            }
        }
    }

    /// Full synchronous decision: the whole file is read into memory.
    pub fn process(&self, raw: &[u8]) -> Response {
        match self.lookup(raw) {
            Lookup::Found { path, size } => match read_regular(&path, size) {
                Ok(body) => Response::File {
                    headers: ok_headers(body.len() as u64),
                    body,
                },
                Err(err) => {
                    tracing::warn!("failed to read {}: {}", path.display(), err);
                    Response::NotFound
                }
            },
            Lookup::NotFound => Response::NotFound,
        }
    }
}

/// Open a file found by [`RequestProcessor::lookup`] without following a
/// symlink swapped in after the lookup.
pub(crate) fn open_regular(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NOFOLLOW)
        .open(path)
}

fn read_regular(path: &Path, size_hint: u64) -> io::Result<Vec<u8>> {
    let mut body = Vec::with_capacity(size_hint as usize);
    open_regular(path)?.read_to_end(&mut body)?;
    Ok(body)
}

/// Last path segment of a request target, `basename` style: trailing slashes
/// are ignored. Segments that would name the root itself or its parent are
/// refused so the joined path never leaves the root.
fn final_segment(target: &[u8]) -> Option<&[u8]> {
    let end = target.iter().rposition(|&b| b != b'/')? + 1;
    let trimmed = &target[..end];
    let start = trimmed.iter().rposition(|&b| b == b'/').map_or(0, |i| i + 1);
    let segment = &trimmed[start..];

    match segment {
        b"" | b"." | b".." => None,
        s if s.contains(&0) => None,
        s => Some(s),
    }
}
