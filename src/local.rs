//! Serving from the local document root.
//!
//! When a request target starts with `/` and a document root is configured,
//! the object is served straight from disk with a Content-Type derived from
//! the file extension. Directory requests serve `index.html`. Local objects
//! are never revalidated against any origin. Path traversal is rejected
//! before the filesystem is touched.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::atom::Atom;
use crate::chunk::{ChunkPool, CHUNK_SIZE};
use crate::error::{ProxyError, Result};
use crate::object::{Object, ObjectFlags};
use crate::parse;

/// Map a URL path onto the document root.
///
/// Rejects traversal (`..`, `/./`) and strips the query string. Directories
/// resolve to their `index.html`.
pub fn resolve_path(root: &Path, url_path: &str) -> Result<PathBuf> {
    let path = url_path.split('?').next().unwrap_or(url_path);
    if !path.starts_with('/') {
        return Err(ProxyError::BadRequest("relative local path"));
    }
    if path.contains("..") || path.contains("/./") || path.contains('\0') {
        return Err(ProxyError::Forbidden);
    }
    let mut full = root.to_path_buf();
    full.push(path.trim_start_matches('/'));
    if path.ends_with('/') || full.is_dir() {
        full.push("index.html");
    }
    Ok(full)
}

/// Content-Type derived from the file extension.
pub fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "txt" => "text/plain",
        "json" => "application/json",
        "xml" => "application/xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

/// Populate a LOCAL object's metadata from the file it maps to.
pub fn load_metadata(obj: &Rc<Object>, root: &Path) -> Result<()> {
    let path = resolve_path(root, &obj.key.url.to_string())?;
    let meta = match std::fs::metadata(&path) {
        Ok(m) if m.is_file() => m,
        _ => {
            obj.set_code(404, Atom::intern(b"Not Found"));
            obj.set_flag(ObjectFlags::FAILED);
            obj.clear_flag(ObjectFlags::INITIAL);
            return Err(ProxyError::ObjectNotInCache);
        }
    };

    let mut headers = http::HeaderMap::new();
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static(content_type(&path)),
    );
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(-1);
    if mtime >= 0 {
        if let Ok(value) = http::HeaderValue::from_str(&parse::format_date(mtime)) {
            headers.insert(http::header::LAST_MODIFIED, value);
        }
    }

    obj.set_code(200, Atom::intern(b"OK"));
    obj.set_headers(Atom::intern(&parse::serialize_headers(&headers)));
    obj.set_length(meta.len() as i64);
    obj.set_last_modified(mtime);
    obj.set_date(crate::now());
    obj.set_age(crate::now());
    obj.clear_flag(ObjectFlags::INITIAL);
    Ok(())
}

/// Read missing chunks of a LOCAL object from its file. Returns true when
/// at least one byte was delivered.
pub fn fill(obj: &Rc<Object>, root: &Path, offset: i64, nchunks: usize, pool: &ChunkPool) -> bool {
    let Ok(path) = resolve_path(root, &obj.key.url.to_string()) else { return false };
    let Ok(mut file) = File::open(&path) else { return false };

    let mut delivered = false;
    for i in 0..nchunks {
        let chunk_offset = offset + (i * CHUNK_SIZE) as i64;
        if obj.length() >= 0 && chunk_offset >= obj.length() {
            break;
        }
        if obj.hole_size(chunk_offset) == 0 {
            continue;
        }
        let want = if obj.length() >= 0 {
            CHUNK_SIZE.min((obj.length() - chunk_offset) as usize)
        } else {
            CHUNK_SIZE
        };
        let mut data = vec![0u8; want];
        if file.seek(SeekFrom::Start(chunk_offset as u64)).is_err() {
            break;
        }
        let mut got = 0;
        while got < want {
            match file.read(&mut data[got..]) {
                Ok(0) => break,
                Ok(n) => got += n,
                Err(_) => break,
            }
        }
        if got == 0 {
            break;
        }
        if obj.add_data(chunk_offset, &data[..got], || pool.alloc()).is_err() {
            break;
        }
        delivered = true;
        if got < want {
            break;
        }
    }
    delivered
}
