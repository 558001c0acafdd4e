//! Static asset handler
//! Serves files below the static directory for requests under the static prefix
//!
//! Files are streamed from disk. `Last-Modified` / `If-Modified-Since` and
//! single `Range: bytes=` requests are honoured; a request naming several
//! ranges gets the whole file.

use crate::proxy::{empty_body, redirect_response, text_response, BoxError, ProxyBody};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use futures_util::TryStreamExt;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use hyper::header::{
    HeaderName, HeaderValue, ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE,
    IF_MODIFIED_SINCE, LAST_MODIFIED, RANGE,
};
use hyper::{HeaderMap, Method, Response, StatusCode};
use percent_encoding::percent_decode_str;
use std::fs::Metadata;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Component, Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

const INDEX_FILE: &str = "index.html";

/// IMF-fixdate, the only date form sent in headers
const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Serves files from one directory
#[derive(Debug, Clone)]
pub struct StaticFiles {
    root: PathBuf,
}

/// Byte range selected by a `Range` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteRange {
    Whole,
    /// Inclusive bounds
    Partial { start: u64, end: u64 },
    Unsatisfiable,
}

impl StaticFiles {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Serve `relative` (the request path with the prefix already stripped)
    pub async fn serve(&self, method: &Method, headers: &HeaderMap, relative: &str) -> Response<ProxyBody> {
        if method != Method::GET && method != Method::HEAD {
            return text_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
        }

        let Some(sanitized) = sanitize_relative_path(relative) else {
            return text_response(StatusCode::FORBIDDEN, "Forbidden");
        };

        // The root is resolved per request so a directory created after
        // startup is picked up.
        let root = match fs::canonicalize(&self.root).await {
            Ok(root) => root,
            Err(e) => return io_error_response(&self.root, e),
        };

        let full = root.join(&sanitized);
        let canonical = match fs::canonicalize(&full).await {
            Ok(path) => path,
            Err(e) => return io_error_response(&full, e),
        };

        if !canonical.starts_with(&root) {
            return text_response(StatusCode::FORBIDDEN, "Forbidden");
        }

        let metadata = match fs::metadata(&canonical).await {
            Ok(metadata) => metadata,
            Err(e) => return io_error_response(&canonical, e),
        };

        if metadata.is_dir() {
            // Relative links inside the index only resolve with the slash.
            if !relative.is_empty() && !relative.ends_with('/') {
                let last = relative.rsplit('/').next().unwrap_or_default();
                return redirect_response(StatusCode::MOVED_PERMANENTLY, &format!("{}/", last));
            }

            let index = canonical.join(INDEX_FILE);
            return match fs::metadata(&index).await {
                Ok(meta) if meta.is_file() => self.serve_file(method, headers, &index, &meta).await,
                _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
            };
        }

        self.serve_file(method, headers, &canonical, &metadata).await
    }

    async fn serve_file(
        &self,
        method: &Method,
        headers: &HeaderMap,
        path: &Path,
        metadata: &Metadata,
    ) -> Response<ProxyBody> {
        let size = metadata.len();
        let modified = metadata.modified().ok().map(DateTime::<Utc>::from);

        if let (Some(modified), Some(since)) = (modified, if_modified_since(headers)) {
            if modified.timestamp() <= since.timestamp() {
                let mut response = Response::new(empty_body());
                *response.status_mut() = StatusCode::NOT_MODIFIED;
                insert_str(response.headers_mut(), LAST_MODIFIED, &http_date(modified));
                return response;
            }
        }

        let (status, start, len) = match parse_range(headers.get(RANGE), size) {
            ByteRange::Whole => (StatusCode::OK, 0, size),
            ByteRange::Partial { start, end } => (StatusCode::PARTIAL_CONTENT, start, end - start + 1),
            ByteRange::Unsatisfiable => {
                let mut response =
                    text_response(StatusCode::RANGE_NOT_SATISFIABLE, "Range Not Satisfiable");
                insert_str(response.headers_mut(), CONTENT_RANGE, &format!("bytes */{}", size));
                return response;
            }
        };

        let body = if method == Method::HEAD {
            empty_body()
        } else {
            match open_range(path, start, len).await {
                Ok(body) => body,
                Err(e) => return io_error_response(path, e),
            }
        };

        debug!(path = %path.display(), size, start, len, "serving static file");

        let mime = mime_guess::from_path(path).first_or_octet_stream();
        let mut response = Response::new(body);
        *response.status_mut() = status;
        let headers = response.headers_mut();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_str(mime.essence_str())
                .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
        );
        headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
        headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        if let Some(modified) = modified {
            insert_str(headers, LAST_MODIFIED, &http_date(modified));
        }
        if status == StatusCode::PARTIAL_CONTENT {
            insert_str(
                headers,
                CONTENT_RANGE,
                &format!("bytes {}-{}/{}", start, start + len - 1, size),
            );
        }
        response
    }
}

/// Stream `len` bytes of the file starting at `start`
async fn open_range(path: &Path, start: u64, len: u64) -> std::io::Result<ProxyBody> {
    let mut file = File::open(path).await?;
    if start > 0 {
        file.seek(SeekFrom::Start(start)).await?;
    }

    let frames = ReaderStream::new(file.take(len)).map_ok(Frame::data);
    let body = BodyExt::map_err(StreamBody::new(frames), |e| Box::new(e) as BoxError);
    Ok(body.boxed())
}

fn parse_range(header: Option<&HeaderValue>, size: u64) -> ByteRange {
    let Some(spec) = header
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().strip_prefix("bytes="))
    else {
        return ByteRange::Whole;
    };
    if size == 0 || spec.contains(',') {
        return ByteRange::Whole;
    }

    let Some((first, last)) = spec.trim().split_once('-') else {
        return ByteRange::Unsatisfiable;
    };
    let (first, last) = (first.trim(), last.trim());

    if first.is_empty() {
        // Suffix form: the final `last` bytes.
        return match last.parse::<u64>() {
            Ok(0) | Err(_) => ByteRange::Unsatisfiable,
            Ok(suffix) => ByteRange::Partial {
                start: size.saturating_sub(suffix),
                end: size - 1,
            },
        };
    }

    let Ok(start) = first.parse::<u64>() else {
        return ByteRange::Unsatisfiable;
    };
    if start >= size {
        return ByteRange::Unsatisfiable;
    }

    let end = if last.is_empty() {
        size - 1
    } else {
        match last.parse::<u64>() {
            Ok(end) if end >= start => end.min(size - 1),
            _ => return ByteRange::Unsatisfiable,
        }
    };

    ByteRange::Partial { start, end }
}

fn if_modified_since(headers: &HeaderMap) -> Option<DateTime<Utc>> {
    let value = headers.get(IF_MODIFIED_SINCE)?.to_str().ok()?;
    let naive = NaiveDateTime::parse_from_str(value.trim(), HTTP_DATE).ok()?;
    Some(Utc.from_utc_datetime(&naive))
}

fn http_date(time: DateTime<Utc>) -> String {
    time.format(HTTP_DATE).to_string()
}

fn insert_str(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

/// Turn a URL path into a relative filesystem path, refusing `..`
fn sanitize_relative_path(path: &str) -> Option<PathBuf> {
    let decoded = percent_decode_str(path).decode_utf8().ok()?;
    let mut result = PathBuf::new();
    for component in Path::new(decoded.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => result.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(result)
}

fn io_error_response(path: &Path, error: std::io::Error) -> Response<ProxyBody> {
    match error.kind() {
        ErrorKind::NotFound => text_response(StatusCode::NOT_FOUND, "Not Found"),
        ErrorKind::PermissionDenied => text_response(StatusCode::FORBIDDEN, "Forbidden"),
        _ => {
            warn!(path = %path.display(), error = %error, "static file error");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
    }
}
