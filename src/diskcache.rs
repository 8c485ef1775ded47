//! The on-disk cache.
//!
//! Every cacheable object maps to exactly one file under
//! `root/<host-escaped>/<base64(md5(url))>`. The file starts with a
//! self-describing text header: the status line, the stored response
//! headers, and the proprietary `X-Polipo-Location`, `X-Polipo-Date`,
//! `X-Polipo-Access` and `X-Polipo-Body-Offset` lines, followed by a blank
//! line and padding up to the body offset. The body offset is chosen from
//! the header length and body size so small objects fit one disk block and
//! large bodies are block-aligned; a file without an explicit body-offset
//! header implies the body starts right after the header block.
//!
//! At most `max_disk_entries` files are kept open, in an LRU of entries
//! caching the fd, body offset and size. Disk I/O is synchronous:
//! operations on a single cache directory are bounded, and the engine never
//! blocks on the network while holding a file.

use std::cell::{Cell, RefCell};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use lru::LruCache;
use md5::{Digest, Md5};

use crate::atom::Atom;
use crate::chunk::{ChunkPool, CHUNK_SIZE};
use crate::object::{Object, ObjectFlags};
use crate::parse;

const METADATA_SLACK: usize = 32;
const MAX_HEADER_REGION: usize = 32 * 1024;

struct DiskEntry {
    object: Weak<Object>,
    file: File,
    path: PathBuf,
    body_offset: u64,
    /// Body bytes present in the file.
    size: i64,
    metadata_dirty: bool,
}

impl std::fmt::Debug for DiskEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskEntry")
            .field("path", &self.path)
            .field("body_offset", &self.body_offset)
            .field("size", &self.size)
            .field("metadata_dirty", &self.metadata_dirty)
            .finish()
    }
}

/// The disk half of the two-tier cache.
pub struct DiskCache {
    root: PathBuf,
    entries: RefCell<LruCache<u64, DiskEntry>>,
    dirty: Cell<bool>,
}

impl std::fmt::Debug for DiskCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskCache")
            .field("root", &self.root)
            .field("open_entries", &self.entries.borrow().len())
            .field("dirty", &self.dirty.get())
            .finish()
    }
}

impl DiskCache {
    /// Open (creating if needed) a disk cache rooted at `root`.
    pub fn new(root: &Path, max_entries: usize) -> std::io::Result<DiskCache> {
        fs::create_dir_all(root)?;
        Ok(DiskCache {
            root: root.to_path_buf(),
            entries: RefCell::new(LruCache::new(
                NonZeroUsize::new(max_entries.max(1)).unwrap(),
            )),
            dirty: Cell::new(false),
        })
    }

    /// True when some object has body bytes not yet written out.
    pub fn is_dirty(&self) -> bool {
        self.dirty.get()
    }

    /// Mark the cache as having pending write-out work.
    pub fn mark_dirty(&self) {
        self.dirty.set(true);
    }

    /// Mark the cache as caught up.
    pub fn mark_clean(&self) {
        self.dirty.set(false);
    }

    /// The file this URL maps to.
    pub fn path_for(&self, url: &[u8]) -> PathBuf {
        let digest = Md5::digest(url);
        let name = URL_SAFE_NO_PAD.encode(digest);
        self.root.join(host_dir(url)).join(name)
    }

    /// Load stored metadata into a freshly-created object, if a valid disk
    /// file exists for it. Returns true when the object now has metadata.
    pub fn load_metadata(&self, obj: &Rc<Object>) -> bool {
        if obj.is(ObjectFlags::LOCAL) {
            return false;
        }
        if !obj.is(ObjectFlags::INITIAL) {
            return self.entry_of(obj).is_some() || obj.disk_size() > 0;
        }
        self.open_entry(obj, false).is_some()
    }

    fn entry_of(&self, obj: &Rc<Object>) -> Option<()> {
        self.entries.borrow_mut().get(&obj.id()).map(|_| ())
    }

    /// Ensure an open entry for `obj`, validating or creating the backing
    /// file. Returns `None` when the object cannot be stored (no metadata
    /// yet, local, or I/O failure).
    fn open_entry(&self, obj: &Rc<Object>, create: bool) -> Option<()> {
        if self.entry_of(obj).is_some() {
            return Some(());
        }
        if obj.is(ObjectFlags::LOCAL) {
            return None;
        }
        let path = self.path_for(obj.key.url.as_bytes());

        let entry = match open_existing(&path, obj) {
            OpenOutcome::Valid(entry) => Some(entry),
            OpenOutcome::Invalid => {
                // Stale or mismatching file; replace it.
                let _ = fs::remove_file(&path);
                None
            }
            OpenOutcome::Absent => None,
        };
        let entry = match entry {
            Some(e) => e,
            None if create => create_entry(&path, obj)?,
            None => return None,
        };

        obj.set_disk_size(entry.size);
        if obj.length() >= 0 && entry.size == obj.length() {
            obj.set_flag(ObjectFlags::DISK_COMPLETE);
        }
        self.insert_entry(obj.id(), entry);
        Some(())
    }

    fn insert_entry(&self, id: u64, entry: DiskEntry) {
        let mut entries = self.entries.borrow_mut();
        if let Some((_, old)) = entries.push(id, entry) {
            close_entry(old);
        }
    }

    /// Append body bytes from the entry's current size up to `upto`,
    /// bounded by `max_bytes`. Bytes must be resident in memory; the write
    /// stops at the first hole. Returns the number of bytes written.
    pub fn writeout(&self, obj: &Rc<Object>, upto: i64, max_bytes: usize) -> usize {
        if obj.code() == 0 || obj.is(ObjectFlags::INITIAL) || obj.is(ObjectFlags::LOCAL) {
            return 0;
        }
        if self.open_entry(obj, true).is_none() {
            return 0;
        }
        let mut entries = self.entries.borrow_mut();
        let Some(entry) = entries.get_mut(&obj.id()) else { return 0 };

        let mut written = 0usize;
        while written < max_bytes {
            let offset = entry.size;
            if offset >= upto {
                break;
            }
            let want = ((upto - offset) as usize).min(max_bytes - written).min(CHUNK_SIZE);
            let data = obj.copy_data(offset, want);
            if data.is_empty() {
                break;
            }
            if entry
                .file
                .seek(SeekFrom::Start(entry.body_offset + offset as u64))
                .and_then(|_| entry.file.write_all(&data))
                .is_err()
            {
                break;
            }
            entry.size += data.len() as i64;
            written += data.len();
        }
        if written > 0 {
            entry.metadata_dirty = true;
        }
        obj.set_disk_size(entry.size);
        if obj.length() >= 0 && entry.size >= obj.length() {
            obj.set_flag(ObjectFlags::DISK_COMPLETE);
        }
        written
    }

    /// Re-serialize the header region of the entry. When the new metadata no
    /// longer fits before the body offset, the whole file is rewritten:
    /// a new file is created alongside, the body copied across, and the new
    /// file renamed over the old one.
    pub fn writeout_metadata(&self, obj: &Rc<Object>) {
        if self.open_entry(obj, false).is_none() {
            return;
        }
        let mut entries = self.entries.borrow_mut();
        let Some(entry) = entries.get_mut(&obj.id()) else { return };

        let metadata = serialize_metadata(obj, Some(entry.body_offset));
        if can_fit_exact(&metadata, entry) && write_metadata_in_place(entry, &metadata).is_ok() {
            entry.metadata_dirty = false;
            return;
        }
        // Doesn't fit: rewrite into a fresh file and swap after rename.
        match rewrite_entry(entry, obj) {
            Ok(new_entry) => *entry = new_entry,
            Err(_) => {
                let path = entry.path.clone();
                entries.pop(&obj.id());
                let _ = fs::remove_file(path);
            }
        }
    }

    /// Read missing chunks back from disk: allocate slots covering
    /// `[offset, offset + nchunks * CHUNK_SIZE)`, read what the file has,
    /// and grow the object's size when the fill is contiguous with it.
    /// Returns true when at least one byte was delivered.
    pub fn fill_from_disk(
        &self,
        obj: &Rc<Object>,
        offset: i64,
        nchunks: usize,
        pool: &ChunkPool,
    ) -> bool {
        if offset < 0 || nchunks == 0 {
            return false;
        }
        if self.open_entry(obj, false).is_none() {
            return false;
        }
        let mut entries = self.entries.borrow_mut();
        let Some(entry) = entries.get_mut(&obj.id()) else { return false };

        let mut delivered = false;
        for i in 0..nchunks {
            let chunk_offset = offset + (i * CHUNK_SIZE) as i64;
            if chunk_offset >= entry.size {
                break;
            }
            if obj.hole_size(chunk_offset) == 0 {
                continue;
            }
            let want = CHUNK_SIZE.min((entry.size - chunk_offset) as usize);
            let mut data = vec![0u8; want];
            let got = entry
                .file
                .seek(SeekFrom::Start(entry.body_offset + chunk_offset as u64))
                .and_then(|_| read_fully(&mut entry.file, &mut data))
                .unwrap_or(0);
            if got == 0 {
                // Short file: trust what we actually saw.
                entry.size = chunk_offset;
                obj.set_disk_size(entry.size);
                break;
            }
            if obj.add_data(chunk_offset, &data[..got], || pool.alloc()).is_err() {
                break;
            }
            delivered = true;
            if got < want {
                entry.size = chunk_offset + got as i64;
                obj.set_disk_size(entry.size);
                break;
            }
        }
        delivered
    }

    /// Drop the open entry for `obj`, optionally deleting the file.
    pub fn destroy_entry(&self, obj: &Rc<Object>, delete_file: bool) {
        let entry = self.entries.borrow_mut().pop(&obj.id());
        let path = match entry {
            Some(entry) => {
                let path = entry.path.clone();
                if !delete_file {
                    close_entry(entry);
                }
                path
            }
            None => self.path_for(obj.key.url.as_bytes()),
        };
        if delete_file {
            let _ = fs::remove_file(path);
            obj.set_disk_size(0);
            obj.clear_flag(ObjectFlags::DISK_COMPLETE);
        }
    }

    /// Flush metadata on every open entry and close them all.
    pub fn flush_all(&self) {
        let mut entries = self.entries.borrow_mut();
        while let Some((_, mut entry)) = entries.pop_lru() {
            if entry.metadata_dirty {
                if let Some(obj) = entry.object.upgrade() {
                    let metadata = serialize_metadata(&obj, Some(entry.body_offset));
                    let _ = write_metadata_in_place(&mut entry, &metadata);
                }
            }
            close_entry(entry);
        }
    }
}

enum OpenOutcome {
    Valid(DiskEntry),
    Invalid,
    Absent,
}

fn open_existing(path: &Path, obj: &Rc<Object>) -> OpenOutcome {
    let mut file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(f) => f,
        Err(_) => return OpenOutcome::Absent,
    };

    // Read enough of the prefix to hold the whole header region.
    let mut prefix = Vec::with_capacity(CHUNK_SIZE);
    let head = loop {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let got = match file.read(&mut buf) {
            Ok(n) => n,
            Err(_) => return OpenOutcome::Invalid,
        };
        prefix.extend_from_slice(&buf[..got]);
        if let Some(end) = parse::find_end_of_headers(&prefix) {
            break end;
        }
        if got == 0 || prefix.len() > MAX_HEADER_REGION {
            return OpenOutcome::Invalid;
        }
    };

    let Ok(Some((mut parsed, _))) = parse::parse_response_head(&prefix[..head]) else {
        return OpenOutcome::Invalid;
    };

    let body_offset = parsed
        .headers
        .get("x-polipo-body-offset")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(head as u64);
    let stored_date = parsed
        .headers
        .get("x-polipo-date")
        .and_then(|v| v.to_str().ok())
        .map(parse::parse_date)
        .unwrap_or(-1);
    let stored_access = parsed
        .headers
        .get("x-polipo-access")
        .and_then(|v| v.to_str().ok())
        .map(parse::parse_date)
        .unwrap_or(-1);
    let length = parsed
        .headers
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<i64>().ok())
        .unwrap_or(-1);
    for name in ["x-polipo-location", "x-polipo-date", "x-polipo-access", "x-polipo-body-offset"] {
        parsed.headers.remove(name);
    }
    let etag = parsed
        .headers
        .get(http::header::ETAG)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string());
    let last_modified = parsed
        .headers
        .get(http::header::LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .map(parse::parse_date)
        .unwrap_or(-1);

    let file_size = file.metadata().map(|m| m.len()).unwrap_or(0);
    let body_size = file_size.saturating_sub(body_offset) as i64;

    if obj.is(ObjectFlags::INITIAL) {
        // Fresh object: adopt the file's metadata.
        obj.set_code(parsed.code, Atom::intern(parsed.reason.as_bytes()));
        let stored = parse::strip_hop_by_hop(&parsed.headers);
        obj.set_headers(Atom::intern(&parse::serialize_headers(&stored)));
        obj.set_etag(etag);
        obj.set_last_modified(last_modified);
        obj.set_length(length);
        obj.set_age(stored_date);
        if stored_access >= 0 {
            obj.set_atime(stored_access);
        }
        obj.set_date(
            parsed
                .headers
                .get(http::header::DATE)
                .and_then(|v| v.to_str().ok())
                .map(parse::parse_date)
                .unwrap_or(stored_date),
        );
        obj.set_expires(
            parsed
                .headers
                .get(http::header::EXPIRES)
                .and_then(|v| v.to_str().ok())
                .map(parse::parse_date)
                .unwrap_or(-1),
        );
        let cc = parse::parse_cache_control(&parsed.headers);
        obj.set_max_age(cc.max_age);
        obj.set_s_maxage(cc.s_maxage);
        obj.add_cache_flags(cc.flags);
        obj.clear_flag(ObjectFlags::INITIAL);
    } else {
        // The object already has metadata; the file must agree with it.
        let etag_mismatch = match (&obj.etag(), &etag) {
            (Some(a), Some(b)) => !parse::etag_match(a, b),
            (Some(_), None) | (None, Some(_)) => true,
            (None, None) => false,
        };
        let lm_mismatch = obj.last_modified() >= 0
            && last_modified >= 0
            && obj.last_modified() != last_modified;
        let length_mismatch =
            obj.length() >= 0 && length >= 0 && obj.length() != length;
        if etag_mismatch || lm_mismatch || length_mismatch {
            return OpenOutcome::Invalid;
        }
    }

    OpenOutcome::Valid(DiskEntry {
        object: Rc::downgrade(obj),
        file,
        path: path.to_path_buf(),
        body_offset,
        size: body_size.max(0),
        metadata_dirty: false,
    })
}

fn create_entry(path: &Path, obj: &Rc<Object>) -> Option<DiskEntry> {
    if obj.code() == 0 {
        return None;
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).ok()?;
    }
    let mut file =
        OpenOptions::new().read(true).write(true).create(true).truncate(true).open(path).ok()?;

    let probe = serialize_metadata(obj, None);
    let body_offset = match choose_body_offset(probe.len() + METADATA_SLACK, obj) {
        Some(offset) => offset,
        // Small object: body directly after the header block, no offset line.
        None => probe.len() as u64,
    };
    let metadata = if body_offset == probe.len() as u64 {
        probe
    } else {
        serialize_metadata(obj, Some(body_offset))
    };

    let mut region = metadata;
    if (region.len() as u64) < body_offset {
        region.resize(body_offset as usize, b' ');
    }
    file.write_all(&region).ok()?;

    Some(DiskEntry {
        object: Rc::downgrade(obj),
        file,
        path: path.to_path_buf(),
        body_offset,
        size: 0,
        metadata_dirty: false,
    })
}

fn write_metadata_in_place(entry: &mut DiskEntry, metadata: &[u8]) -> std::io::Result<()> {
    if metadata.len() as u64 > entry.body_offset {
        return Err(std::io::Error::other("metadata region overflow"));
    }
    let mut region = metadata.to_vec();
    region.resize(entry.body_offset as usize, b' ');
    entry.file.seek(SeekFrom::Start(0))?;
    entry.file.write_all(&region)
}

fn can_fit_exact(metadata: &[u8], entry: &DiskEntry) -> bool {
    metadata.len() as u64 <= entry.body_offset
}

fn rewrite_entry(entry: &mut DiskEntry, obj: &Rc<Object>) -> std::io::Result<DiskEntry> {
    let probe = serialize_metadata(obj, None);
    let body_offset = choose_body_offset(probe.len() + METADATA_SLACK, obj)
        .unwrap_or(probe.len() as u64 + METADATA_SLACK as u64);
    let metadata = serialize_metadata(obj, Some(body_offset));

    let tmp_path = entry.path.with_extension("new");
    let mut tmp = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)?;

    let mut region = metadata;
    region.resize(body_offset as usize, b' ');
    tmp.write_all(&region)?;

    // Copy the body across.
    entry.file.seek(SeekFrom::Start(entry.body_offset))?;
    let mut remaining = entry.size;
    let mut buf = vec![0u8; 64 * 1024];
    while remaining > 0 {
        let want = buf.len().min(remaining as usize);
        let got = entry.file.read(&mut buf[..want])?;
        if got == 0 {
            break;
        }
        tmp.write_all(&buf[..got])?;
        remaining -= got as i64;
    }

    fs::rename(&tmp_path, &entry.path)?;
    Ok(DiskEntry {
        object: Rc::downgrade(obj),
        file: tmp,
        path: entry.path.clone(),
        body_offset,
        size: entry.size - remaining,
        metadata_dirty: false,
    })
}

fn close_entry(mut entry: DiskEntry) {
    let _ = entry.file.flush();
}

fn read_fully(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let got = file.read(&mut buf[total..])?;
        if got == 0 {
            break;
        }
        total += got;
    }
    Ok(total)
}

/// Serialize the header region for `obj`.
fn serialize_metadata(obj: &Rc<Object>, body_offset: Option<u64>) -> Vec<u8> {
    let mut out = Vec::with_capacity(512);
    let message = obj.message();
    let reason = if message.is_empty() { "OK".to_string() } else { message.to_string() };
    out.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", obj.code(), reason).as_bytes());
    if let Some(headers) = obj.headers() {
        out.extend_from_slice(headers.as_bytes());
    }
    if obj.length() >= 0 {
        out.extend_from_slice(format!("Content-Length: {}\r\n", obj.length()).as_bytes());
    }
    out.extend_from_slice(b"X-Polipo-Location: ");
    out.extend_from_slice(obj.key.url.as_bytes());
    out.extend_from_slice(b"\r\n");
    if obj.age() >= 0 {
        out.extend_from_slice(
            format!("X-Polipo-Date: {}\r\n", parse::format_date(obj.age())).as_bytes(),
        );
    }
    if obj.atime() >= 0 {
        out.extend_from_slice(
            format!("X-Polipo-Access: {}\r\n", parse::format_date(obj.atime())).as_bytes(),
        );
    }
    if let Some(offset) = body_offset {
        out.extend_from_slice(format!("X-Polipo-Body-Offset: {offset}\r\n").as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// Pick the body offset for a file whose header region is `n` bytes.
///
/// `None` means "no gap": the object is small enough that headers and body
/// fit one disk block together, so the body starts right after the headers.
fn choose_body_offset(n: usize, obj: &Rc<Object>) -> Option<u64> {
    let length = obj.size().max(obj.length());

    if obj.length() >= 0 && obj.length() as usize + n < 4096 - 4 {
        return None;
    }

    let mut body_offset: usize = if n <= 128 {
        256
    } else if n <= 192 {
        384
    } else if n <= 256 {
        512
    } else if n <= 384 {
        768
    } else if n <= 512 {
        1024
    } else if n <= 1024 {
        2048
    } else if n < 2048 {
        4096
    } else {
        ((n + 4095) / 4096 + 1) * 4096
    };

    // Avoid burning a full block on a small tail.
    if obj.length() >= 0 && obj.length() < 64 * 1024 {
        let last = (body_offset + obj.length() as usize) % 4096;
        let gap = body_offset.saturating_sub(n);
        if last < gap / 2 {
            body_offset -= last;
        }
    }

    // Rewriting large objects is expensive; insist on a minimum gap, which
    // also block-aligns large bodies.
    if length >= 64 * 1024 {
        let min_gap: usize = if length >= 512 * 1024 {
            4096
        } else if length >= 256 * 1024 {
            2048
        } else {
            1024
        };
        let min_offset = ((n + min_gap - 1) / min_gap + 1) * min_gap;
        body_offset = body_offset.max(min_offset);
    }

    Some(body_offset as u64)
}

/// Directory name for a URL: the `scheme://host:port` part with everything
/// outside `[A-Za-z0-9._:-]` percent-escaped.
fn host_dir(url: &[u8]) -> String {
    let text = String::from_utf8_lossy(url);
    let rest = text.strip_prefix("http://").unwrap_or(&text);
    let host = rest.split('/').next().unwrap_or(rest);
    let mut out = String::with_capacity(host.len());
    for b in host.bytes() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'_' | b'-' | b':' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    if out.is_empty() {
        out.push('_');
    }
    out
}
