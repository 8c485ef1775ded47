//! Cached objects and the object store.
//!
//! A cached object holds a sparse vector of body chunks, the response
//! metadata the freshness engine works from, and a condition that waiters
//! park on while an upstream fetch is in progress. Public objects live in a
//! hash table keyed by `(kind, url)`; at most one public object exists per
//! key. An LRU across all objects, public and private, drives eviction.
//!
//! Ownership: the store's table is the only owning edge for public objects;
//! every other holder keeps an `Rc` obtained through a lookup. Chunks are
//! owned by their object and returned to the pool when the object is
//! stripped or dropped, so the pool's accounting holds no matter which path
//! releases an object.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::rc::{Rc, Weak};

use bitflags::bitflags;
use lru::LruCache;

use crate::atom::Atom;
use crate::chunk::{ChunkBuf, ChunkPool, CHUNK_SIZE};
use crate::cond::Condition;
use crate::config::Config;
use crate::error::{ProxyError, Result};
use crate::now;

bitflags! {
    /// Object state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ObjectFlags: u32 {
        /// The object is in the public table and shareable.
        const PUBLIC = 1 << 0;
        /// No response headers have been received yet.
        const INITIAL = 1 << 1;
        /// An upstream fetch is currently filling the object.
        const INPROGRESS = 1 << 2;
        /// A conditional revalidation is in flight.
        const VALIDATING = 1 << 3;
        /// The last fetch failed; `code`/`message` hold the error.
        const FAILED = 1 << 4;
        /// The object was aborted; waiters must surface the error.
        const ABORTED = 1 << 5;
        /// Served from the local document root, never revalidated.
        const LOCAL = 1 << 6;
        /// Single-consumer object (authorized response); never shared.
        const LINEAR = 1 << 7;
        /// Replaced by a fresh object; waiters must re-resolve.
        const SUPERSEDED = 1 << 8;
        /// A mutating request (POST/PUT) may replace this object.
        const MUTATING = 1 << 9;
        /// Response predates HTTP/1.1 validators; treated as dynamic.
        const DYNAMIC = 1 << 10;
        /// The disk mirror holds every byte in `[0, length)`.
        const DISK_COMPLETE = 1 << 11;
    }
}

bitflags! {
    /// Cache-Control directive flags, for requests and stored objects.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CacheFlags: u32 {
        /// no-cache was present.
        const NO_CACHE = 1 << 0;
        /// no-store was present.
        const NO_STORE = 1 << 1;
        /// no-transform was present.
        const NO_TRANSFORM = 1 << 2;
        /// public was present.
        const PUBLIC = 1 << 3;
        /// private was present.
        const PRIVATE = 1 << 4;
        /// must-revalidate was present.
        const MUST_REVALIDATE = 1 << 5;
        /// proxy-revalidate was present.
        const PROXY_REVALIDATE = 1 << 6;
        /// The response varies on something other than Host.
        const VARY = 1 << 7;
        /// The response carried Set-Cookie.
        const COOKIE = 1 << 8;
        /// The request carried Authorization.
        const AUTHORIZATION = 1 << 9;
        /// The stored object no longer matches the origin's entity.
        const MISMATCH = 1 << 10;
        /// only-if-cached was present on the request.
        const ONLY_IF_CACHED = 1 << 11;
    }
}

/// Parsed cache-control state: flags plus numeric directives, `-1` unset.
#[derive(Debug, Clone, Copy)]
pub struct CacheControl {
    /// Directive flags.
    pub flags: CacheFlags,
    /// max-age in seconds.
    pub max_age: i64,
    /// s-maxage in seconds.
    pub s_maxage: i64,
    /// min-fresh in seconds (requests only).
    pub min_fresh: i64,
    /// max-stale in seconds (requests only).
    pub max_stale: i64,
}

impl Default for CacheControl {
    fn default() -> CacheControl {
        CacheControl {
            flags: CacheFlags::empty(),
            max_age: -1,
            s_maxage: -1,
            min_fresh: -1,
            max_stale: -1,
        }
    }
}

/// What namespace an object key lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// A remote HTTP resource, keyed by absolute URL.
    Http,
    /// A file under the local document root, keyed by path.
    Local,
}

/// Identity of a cached object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    /// The key namespace.
    pub kind: ObjectKind,
    /// URL or local path.
    pub url: Atom,
}

/// One slot of the sparse chunk vector.
#[derive(Debug, Default)]
pub struct ChunkSlot {
    /// The page, absent when the data lives only on disk.
    pub data: Option<ChunkBuf>,
    /// Valid bytes in this chunk, `<= CHUNK_SIZE`.
    pub len: usize,
    /// Lock count; a locked chunk is never evicted.
    pub locked: u32,
}

/// A cached object.
///
/// All fields use interior mutability; the engine is single-threaded, so a
/// borrow is never held across a suspension point.
#[derive(Debug)]
pub struct Object {
    /// Cache key.
    pub key: ObjectKey,
    /// Condition signalled on progress, completion, abort, and supersede.
    pub cond: Condition,
    id: u64,
    pool: Rc<ChunkPool>,
    flags: Cell<ObjectFlags>,
    chunks: RefCell<Vec<ChunkSlot>>,
    length: Cell<i64>,
    size: Cell<i64>,
    code: Cell<u16>,
    message: RefCell<Atom>,
    headers: RefCell<Option<Atom>>,
    etag: RefCell<Option<String>>,
    last_modified: Cell<i64>,
    date: Cell<i64>,
    expires: Cell<i64>,
    age: Cell<i64>,
    atime: Cell<i64>,
    max_age: Cell<i64>,
    s_maxage: Cell<i64>,
    cache_flags: Cell<CacheFlags>,
    requestor: Cell<Option<u64>>,
    disk_size: Cell<i64>,
}

impl Object {
    fn new(key: ObjectKey, id: u64, pool: Rc<ChunkPool>) -> Object {
        Object {
            key,
            cond: Condition::new(),
            id,
            pool,
            flags: Cell::new(ObjectFlags::INITIAL),
            chunks: RefCell::new(Vec::new()),
            length: Cell::new(-1),
            size: Cell::new(0),
            code: Cell::new(0),
            message: RefCell::new(Atom::empty()),
            headers: RefCell::new(None),
            etag: RefCell::new(None),
            last_modified: Cell::new(-1),
            date: Cell::new(-1),
            expires: Cell::new(-1),
            age: Cell::new(-1),
            atime: Cell::new(now()),
            max_age: Cell::new(-1),
            s_maxage: Cell::new(-1),
            cache_flags: Cell::new(CacheFlags::empty()),
            requestor: Cell::new(None),
            disk_size: Cell::new(0),
        }
    }

    /// Internal identity, used as the LRU key.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current flag word.
    pub fn flags(&self) -> ObjectFlags {
        self.flags.get()
    }

    /// Set the given flags.
    pub fn set_flag(&self, f: ObjectFlags) {
        self.flags.set(self.flags.get() | f);
    }

    /// Clear the given flags.
    pub fn clear_flag(&self, f: ObjectFlags) {
        self.flags.set(self.flags.get() - f);
    }

    /// True when all of `f` are set.
    pub fn is(&self, f: ObjectFlags) -> bool {
        self.flags.get().contains(f)
    }

    /// Total byte length when known, else `-1`.
    pub fn length(&self) -> i64 {
        self.length.get()
    }

    /// Set the total byte length.
    pub fn set_length(&self, len: i64) {
        self.length.set(len);
    }

    /// Highest offset up to which the body prefix is valid.
    pub fn size(&self) -> i64 {
        self.size.get()
    }

    /// Force the valid size; used by abort and disk load.
    pub fn set_size(&self, size: i64) {
        self.size.set(size);
    }

    /// HTTP status, 0 before headers arrive.
    pub fn code(&self) -> u16 {
        self.code.get()
    }

    /// The reason phrase or error message.
    pub fn message(&self) -> Atom {
        self.message.borrow().clone()
    }

    /// Record status code and message.
    pub fn set_code(&self, code: u16, message: Atom) {
        self.code.set(code);
        *self.message.borrow_mut() = message;
    }

    /// The stored response headers, hop-by-hop stripped and serialized.
    pub fn headers(&self) -> Option<Atom> {
        self.headers.borrow().clone()
    }

    /// Replace the stored headers.
    pub fn set_headers(&self, headers: Atom) {
        *self.headers.borrow_mut() = Some(headers);
    }

    /// The entity tag, verbatim with quotes.
    pub fn etag(&self) -> Option<String> {
        self.etag.borrow().clone()
    }

    /// Set the entity tag.
    pub fn set_etag(&self, etag: Option<String>) {
        *self.etag.borrow_mut() = etag;
    }

    /// Last-Modified as epoch seconds, `-1` unset.
    pub fn last_modified(&self) -> i64 {
        self.last_modified.get()
    }

    /// Set Last-Modified.
    pub fn set_last_modified(&self, t: i64) {
        self.last_modified.set(t);
    }

    /// Response Date as epoch seconds, `-1` unset.
    pub fn date(&self) -> i64 {
        self.date.get()
    }

    /// Set the response date.
    pub fn set_date(&self, t: i64) {
        self.date.set(t);
    }

    /// Expires as epoch seconds, `-1` unset.
    pub fn expires(&self) -> i64 {
        self.expires.get()
    }

    /// Set Expires.
    pub fn set_expires(&self, t: i64) {
        self.expires.set(t);
    }

    /// The time the response was generated, from Age/Date arithmetic.
    pub fn age(&self) -> i64 {
        self.age.get()
    }

    /// Set the age reference time.
    pub fn set_age(&self, t: i64) {
        self.age.set(t);
    }

    /// Last access time.
    pub fn atime(&self) -> i64 {
        self.atime.get()
    }

    /// Touch the access time.
    pub fn touch(&self) {
        self.atime.set(now());
    }

    /// Set the access time, used when adopting disk metadata.
    pub fn set_atime(&self, t: i64) {
        self.atime.set(t);
    }

    /// Stored max-age directive, `-1` unset.
    pub fn max_age(&self) -> i64 {
        self.max_age.get()
    }

    /// Set max-age.
    pub fn set_max_age(&self, v: i64) {
        self.max_age.set(v);
    }

    /// Stored s-maxage directive, `-1` unset.
    pub fn s_maxage(&self) -> i64 {
        self.s_maxage.get()
    }

    /// Set s-maxage.
    pub fn set_s_maxage(&self, v: i64) {
        self.s_maxage.set(v);
    }

    /// Cache-control flags recorded on the object.
    pub fn cache_flags(&self) -> CacheFlags {
        self.cache_flags.get()
    }

    /// Merge cache-control flags into the object.
    pub fn add_cache_flags(&self, f: CacheFlags) {
        self.cache_flags.set(self.cache_flags.get() | f);
    }

    /// Replace the cache-control flags.
    pub fn set_cache_flags(&self, f: CacheFlags) {
        self.cache_flags.set(f);
    }

    /// The request currently authorised to drive the upstream fetch.
    pub fn requestor(&self) -> Option<u64> {
        self.requestor.get()
    }

    /// Claim the requestor slot. Returns false when another request holds it.
    pub fn claim_requestor(&self, id: u64) -> bool {
        match self.requestor.get() {
            None => {
                self.requestor.set(Some(id));
                true
            }
            Some(existing) => existing == id,
        }
    }

    /// Release the requestor slot if held by `id`.
    pub fn release_requestor(&self, id: u64) {
        if self.requestor.get() == Some(id) {
            self.requestor.set(None);
        }
    }

    /// Bytes of this object present on disk, maintained by the disk cache.
    pub fn disk_size(&self) -> i64 {
        self.disk_size.get()
    }

    /// Record how many body bytes the disk mirror holds.
    pub fn set_disk_size(&self, v: i64) {
        self.disk_size.set(v);
    }

    /// Number of chunk slots (present or not).
    pub fn chunk_slots(&self) -> usize {
        self.chunks.borrow().len()
    }

    /// Number of chunks currently resident in memory.
    pub fn chunks_in_memory(&self) -> usize {
        self.chunks.borrow().iter().filter(|s| s.data.is_some()).count()
    }

    /// Grow the sparse chunk vector to at least `n` slots. Never shrinks.
    pub fn set_chunks(&self, n: usize) {
        let mut chunks = self.chunks.borrow_mut();
        while chunks.len() < n {
            chunks.push(ChunkSlot::default());
        }
    }

    /// Write `data` into the object at `offset`, allocating chunks from
    /// `alloc` as needed. Handles within-chunk starts and multi-chunk spans.
    ///
    /// The valid size only advances when the written span is contiguous with
    /// it; range fills in the middle of a hole do not move `size`.
    pub fn add_data<F>(&self, offset: i64, data: &[u8], mut alloc: F) -> Result<()>
    where
        F: FnMut() -> Option<ChunkBuf>,
    {
        if data.is_empty() {
            return Ok(());
        }
        if offset < 0 {
            return Err(ProxyError::InternalInvariant("negative object offset"));
        }
        let end = offset + data.len() as i64;
        if self.length.get() >= 0 && end > self.length.get() {
            return Err(ProxyError::UpstreamProtoError("body longer than declared"));
        }

        let first = (offset as usize) / CHUNK_SIZE;
        let last = ((end - 1) as usize) / CHUNK_SIZE;
        self.set_chunks(last + 1);

        let mut chunks = self.chunks.borrow_mut();
        let mut copied = 0usize;
        for idx in first..=last {
            let chunk_start = idx * CHUNK_SIZE;
            let within = (offset as usize + copied) - chunk_start;
            let take = (CHUNK_SIZE - within).min(data.len() - copied);
            let slot = &mut chunks[idx];
            if slot.data.is_none() {
                match alloc() {
                    Some(buf) => slot.data = Some(buf),
                    None => return Err(ProxyError::AllocFail),
                }
            }
            let buf = slot.data.as_mut().unwrap();
            buf[within..within + take].copy_from_slice(&data[copied..copied + take]);
            if within <= slot.len {
                slot.len = slot.len.max(within + take);
            }
            copied += take;
        }
        drop(chunks);

        if offset <= self.size.get() && end > self.size.get() {
            self.size.set(end);
        }
        Ok(())
    }

    /// Copy up to `max` in-memory bytes starting at `offset` into a vector.
    /// Returns an empty vector when the byte at `offset` is not resident.
    pub fn copy_data(&self, offset: i64, max: usize) -> Vec<u8> {
        let mut out = Vec::new();
        if offset < 0 {
            return out;
        }
        let chunks = self.chunks.borrow();
        let mut pos = offset as usize;
        while out.len() < max {
            let idx = pos / CHUNK_SIZE;
            let within = pos % CHUNK_SIZE;
            let Some(slot) = chunks.get(idx) else { break };
            let Some(data) = slot.data.as_ref() else { break };
            if within >= slot.len {
                break;
            }
            let take = (slot.len - within).min(max - out.len());
            out.extend_from_slice(&data[within..within + take]);
            pos += take;
            if slot.len < CHUNK_SIZE {
                break;
            }
        }
        out
    }

    /// How many bytes from `offset` onward are missing in memory.
    ///
    /// `0` when the byte at `offset` is resident; `-1` when `offset` is past
    /// the end of the object; otherwise the distance to the next resident
    /// byte, bounded by the object length when known.
    pub fn hole_size(&self, offset: i64) -> i64 {
        if offset < 0 {
            return -1;
        }
        let length = self.length.get();
        if length >= 0 && offset >= length {
            return -1;
        }
        let chunks = self.chunks.borrow();
        let present = |pos: i64| -> bool {
            let idx = pos as usize / CHUNK_SIZE;
            let within = pos as usize % CHUNK_SIZE;
            chunks
                .get(idx)
                .map(|s| s.data.is_some() && within < s.len)
                .unwrap_or(false)
        };
        if present(offset) {
            return 0;
        }
        let bound = if length >= 0 { length } else { i64::MAX / 2 };
        // Scan forward chunk by chunk for the next resident byte.
        let mut pos = offset + 1;
        while pos < bound {
            let idx = pos as usize / CHUNK_SIZE;
            if idx >= chunks.len() {
                break;
            }
            if present(pos) {
                return pos - offset;
            }
            // Jump to the next chunk boundary; holes within a chunk only
            // occur at its tail.
            pos = ((idx + 1) * CHUNK_SIZE) as i64;
        }
        if length >= 0 {
            length - offset
        } else {
            -1
        }
    }

    /// Lock the chunk covering `offset` against eviction.
    pub fn lock_chunk(&self, idx: usize) {
        let mut chunks = self.chunks.borrow_mut();
        if let Some(slot) = chunks.get_mut(idx) {
            slot.locked += 1;
        }
    }

    /// Release one lock on chunk `idx`.
    pub fn unlock_chunk(&self, idx: usize) {
        let mut chunks = self.chunks.borrow_mut();
        if let Some(slot) = chunks.get_mut(idx) {
            debug_assert!(slot.locked > 0, "chunk lock underflow");
            slot.locked = slot.locked.saturating_sub(1);
        }
    }

    /// Drop every unlocked resident chunk back to the pool. With
    /// `filled_only`, only chunks with a full page of valid bytes are
    /// dropped (the partial tail keeps accumulating).
    ///
    /// Returns the number of chunks released.
    pub fn strip_chunks(&self, filled_only: bool) -> usize {
        let mut chunks = self.chunks.borrow_mut();
        let mut released = 0;
        for slot in chunks.iter_mut() {
            if slot.locked > 0 || slot.data.is_none() {
                continue;
            }
            if filled_only && slot.len < CHUNK_SIZE {
                continue;
            }
            if let Some(buf) = slot.data.take() {
                self.pool.dispose(buf);
                slot.len = 0;
                released += 1;
            }
        }
        released
    }

    /// Drop unlocked resident chunks that lie entirely below `covered`,
    /// which is how many body bytes the disk mirror holds. Their data can be
    /// read back later. Returns the number of chunks released.
    pub fn strip_covered_chunks(&self, covered: i64) -> usize {
        let mut chunks = self.chunks.borrow_mut();
        let mut released = 0;
        for (idx, slot) in chunks.iter_mut().enumerate() {
            if slot.locked > 0 || slot.data.is_none() {
                continue;
            }
            let end = ((idx * CHUNK_SIZE) + slot.len) as i64;
            if end > covered {
                continue;
            }
            if let Some(buf) = slot.data.take() {
                self.pool.dispose(buf);
                slot.len = 0;
                released += 1;
            }
        }
        released
    }

    /// Signal the object's condition, waking all current waiters.
    pub fn notify(&self) {
        self.cond.signal();
    }
}

impl Drop for Object {
    fn drop(&mut self) {
        // Chunks return to the pool no matter how the object dies.
        let chunks = self.chunks.get_mut();
        for slot in chunks.iter_mut() {
            if let Some(buf) = slot.data.take() {
                self.pool.dispose(buf);
            }
        }
    }
}

/// The in-memory object table plus global LRU.
pub struct ObjectStore {
    pool: Rc<ChunkPool>,
    public: RefCell<HashMap<ObjectKey, Rc<Object>>>,
    lru: RefCell<LruCache<u64, Weak<Object>>>,
    next_id: Cell<u64>,
    object_high: usize,
    public_low: usize,
}

impl std::fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStore")
            .field("public", &self.public.borrow().len())
            .field("object_high", &self.object_high)
            .field("public_low", &self.public_low)
            .finish_non_exhaustive()
    }
}

impl ObjectStore {
    /// Create a store bounded by the configured object counts.
    pub fn new(config: &Config, pool: Rc<ChunkPool>) -> ObjectStore {
        ObjectStore {
            pool,
            public: RefCell::new(HashMap::new()),
            lru: RefCell::new(LruCache::unbounded()),
            next_id: Cell::new(1),
            object_high: config.object_high_mark.max(16),
            public_low: config.public_object_low_mark.max(1),
        }
    }

    /// The chunk pool shared with this store's objects.
    pub fn pool(&self) -> &Rc<ChunkPool> {
        &self.pool
    }

    /// Number of public objects.
    pub fn public_count(&self) -> usize {
        self.public.borrow().len()
    }

    /// Background expiry threshold for public objects.
    pub fn public_low(&self) -> usize {
        self.public_low
    }

    /// Look up a public object, promoting it in the LRU and touching its
    /// access time.
    pub fn find(&self, kind: ObjectKind, url: &Atom) -> Option<Rc<Object>> {
        let key = ObjectKey { kind, url: url.clone() };
        let found = self.public.borrow().get(&key).cloned();
        if let Some(obj) = &found {
            obj.touch();
            self.lru.borrow_mut().promote(&obj.id());
        }
        found
    }

    /// Find or create an object for the key.
    ///
    /// A hit returns the existing public object. Creating a public object
    /// replaces any colliding entry (the collision is superseded first), so
    /// two public objects never share a key.
    pub fn make(&self, kind: ObjectKind, url: &Atom, public: bool) -> Result<Rc<Object>> {
        if public {
            if let Some(existing) = self.find(kind, url) {
                return Ok(existing);
            }
        }
        if self.lru.borrow().len() >= self.object_high {
            self.evict_some();
            if self.lru.borrow().len() >= self.object_high {
                return Err(ProxyError::AllocFail);
            }
        }
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let key = ObjectKey { kind, url: url.clone() };
        let obj = Rc::new(Object::new(key.clone(), id, self.pool.clone()));
        if public {
            obj.set_flag(ObjectFlags::PUBLIC);
            self.public.borrow_mut().insert(key, obj.clone());
        }
        self.lru.borrow_mut().push(id, Rc::downgrade(&obj));
        Ok(obj)
    }

    /// Remove an object from the public table and strip its unlocked chunks.
    /// The object survives as long as holders keep references, but no new
    /// lookups will reach it.
    pub fn privatise(&self, obj: &Rc<Object>) {
        if obj.is(ObjectFlags::PUBLIC) {
            obj.clear_flag(ObjectFlags::PUBLIC);
            self.public.borrow_mut().remove(&obj.key);
        }
        obj.strip_chunks(false);
        self.lru.borrow_mut().pop(&obj.id());
    }

    /// Abort an object with an error. Waiters wake and surface the error;
    /// the object leaves the public table.
    pub fn abort(&self, obj: &Rc<Object>, code: u16, message: &str) {
        obj.set_flag(ObjectFlags::ABORTED | ObjectFlags::FAILED);
        obj.clear_flag(ObjectFlags::INITIAL | ObjectFlags::VALIDATING | ObjectFlags::INPROGRESS);
        obj.set_code(code, Atom::intern(message.as_bytes()));
        obj.set_length(0);
        obj.set_size(0);
        self.privatise(obj);
        obj.notify();
    }

    /// Replace a public object's identity: waiters re-resolve through the
    /// table and find whatever fresh object the caller installs next.
    pub fn supersede(&self, obj: &Rc<Object>) {
        obj.set_flag(ObjectFlags::SUPERSEDED);
        self.privatise(obj);
        obj.notify();
    }

    /// Evict reclaimable objects from the LRU tail: dead weak slots and
    /// public objects nobody currently holds.
    pub fn evict_some(&self) {
        let victims: Vec<Rc<Object>> = {
            let lru = self.lru.borrow();
            let mut dead: Vec<u64> = Vec::new();
            let mut victims = Vec::new();
            for (id, weak) in lru.iter().rev() {
                match weak.upgrade() {
                    None => dead.push(*id),
                    // A count of two is the table's reference plus the one
                    // this upgrade just took: nobody else holds the object.
                    Some(obj)
                        if obj.is(ObjectFlags::PUBLIC)
                            && Rc::strong_count(&obj) == 2
                            && !obj.is(ObjectFlags::INPROGRESS) =>
                    {
                        victims.push(obj);
                        if victims.len() >= 16 {
                            break;
                        }
                    }
                    Some(_) => {}
                }
            }
            drop(lru);
            let mut lru = self.lru.borrow_mut();
            for id in dead {
                lru.pop(&id);
            }
            victims
        };
        for obj in victims {
            self.privatise(&obj);
        }
    }

    /// Objects from the LRU tail, least recent first, up to `max`.
    pub fn tail_objects(&self, max: usize) -> Vec<Rc<Object>> {
        let lru = self.lru.borrow();
        lru.iter().rev().filter_map(|(_, w)| w.upgrade()).take(max).collect()
    }

    /// Drop stale, unreferenced public objects until the public count is
    /// back under the low mark. Used by background expiry.
    pub fn expire_public(&self, is_stale: impl Fn(&Object) -> bool) {
        if self.public_count() <= self.public_low {
            return;
        }
        let victims: Vec<Rc<Object>> = {
            let lru = self.lru.borrow();
            lru.iter()
                .rev()
                .filter_map(|(_, w)| w.upgrade())
                .filter(|o| {
                    o.is(ObjectFlags::PUBLIC)
                        && !o.is(ObjectFlags::INPROGRESS)
                        && Rc::strong_count(o) == 2
                        && is_stale(o)
                })
                .collect()
        };
        let mut count = self.public_count();
        for obj in victims {
            if count <= self.public_low {
                break;
            }
            self.privatise(&obj);
            count -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ObjectStore {
        let pool = Rc::new(ChunkPool::new(64 * CHUNK_SIZE, 32 * CHUNK_SIZE, 48 * CHUNK_SIZE));
        ObjectStore::new(&Config::default(), pool)
    }

    fn url(s: &str) -> Atom {
        Atom::intern(s.as_bytes())
    }

    #[test]
    fn find_returns_same_identity_until_privatised() {
        let store = store();
        let u = url("http://x.test/a");
        let a = store.make(ObjectKind::Http, &u, true).unwrap();
        let b = store.find(ObjectKind::Http, &u).unwrap();
        assert!(Rc::ptr_eq(&a, &b));
        store.privatise(&a);
        assert!(store.find(ObjectKind::Http, &u).is_none());
    }

    #[test]
    fn add_data_spans_chunks_and_advances_size() {
        let store = store();
        let obj = store.make(ObjectKind::Http, &url("http://x.test/b"), true).unwrap();
        let pool = store.pool().clone();

        let body = vec![7u8; CHUNK_SIZE + 100];
        obj.add_data(0, &body, || pool.alloc()).unwrap();
        assert_eq!(obj.size(), (CHUNK_SIZE + 100) as i64);
        assert_eq!(obj.chunk_slots(), 2);
        assert_eq!(obj.chunks_in_memory(), 2);

        let data = obj.copy_data((CHUNK_SIZE - 10) as i64, 20);
        assert_eq!(data.len(), 20);
        assert!(data.iter().all(|&b| b == 7));
    }

    #[test]
    fn add_data_mid_hole_does_not_advance_size() {
        let store = store();
        let obj = store.make(ObjectKind::Http, &url("http://x.test/c"), true).unwrap();
        let pool = store.pool().clone();
        obj.set_length(3 * CHUNK_SIZE as i64);

        obj.add_data((2 * CHUNK_SIZE) as i64, &[1u8; 16], || pool.alloc()).unwrap();
        assert_eq!(obj.size(), 0);
        assert_eq!(obj.hole_size(0), (2 * CHUNK_SIZE) as i64);
        assert_eq!(obj.hole_size((2 * CHUNK_SIZE) as i64), 0);
    }

    #[test]
    fn add_data_respects_declared_length() {
        let store = store();
        let obj = store.make(ObjectKind::Http, &url("http://x.test/d"), true).unwrap();
        let pool = store.pool().clone();
        obj.set_length(4);
        assert!(obj.add_data(0, b"abcd", || pool.alloc()).is_ok());
        assert!(obj.add_data(4, b"e", || pool.alloc()).is_err());
    }

    #[test]
    fn hole_size_past_end_is_negative() {
        let store = store();
        let obj = store.make(ObjectKind::Http, &url("http://x.test/e"), true).unwrap();
        obj.set_length(10);
        assert_eq!(obj.hole_size(10), -1);
        assert_eq!(obj.hole_size(3), 10 - 3);
    }

    #[test]
    fn locked_chunks_survive_stripping() {
        let store = store();
        let obj = store.make(ObjectKind::Http, &url("http://x.test/f"), true).unwrap();
        let pool = store.pool().clone();
        let body = vec![1u8; 2 * CHUNK_SIZE];
        obj.add_data(0, &body, || pool.alloc()).unwrap();

        obj.lock_chunk(0);
        let released = obj.strip_chunks(false);
        assert_eq!(released, 1);
        assert_eq!(obj.chunks_in_memory(), 1);
        assert_eq!(obj.hole_size(0), 0);

        obj.unlock_chunk(0);
        obj.strip_chunks(false);
        assert_eq!(obj.chunks_in_memory(), 0);
    }

    #[test]
    fn chunk_accounting_balances_on_drop() {
        let pool = Rc::new(ChunkPool::new(64 * CHUNK_SIZE, 32 * CHUNK_SIZE, 48 * CHUNK_SIZE));
        let store = ObjectStore::new(&Config::default(), pool.clone());
        {
            let obj = store.make(ObjectKind::Http, &url("http://x.test/g"), true).unwrap();
            obj.add_data(0, &vec![0u8; 3 * CHUNK_SIZE], || pool.alloc()).unwrap();
            assert_eq!(pool.used(), 3);
            store.privatise(&obj);
            // privatise strips unlocked chunks immediately.
            assert_eq!(pool.used(), 0);
        }
        assert_eq!(pool.used(), 0);
    }

    #[test]
    fn supersede_marks_and_unlinks() {
        let store = store();
        let u = url("http://x.test/h");
        let obj = store.make(ObjectKind::Http, &u, true).unwrap();
        store.supersede(&obj);
        assert!(obj.is(ObjectFlags::SUPERSEDED));
        assert!(store.find(ObjectKind::Http, &u).is_none());
        // A fresh make produces a new identity.
        let fresh = store.make(ObjectKind::Http, &u, true).unwrap();
        assert!(!Rc::ptr_eq(&obj, &fresh));
    }

    #[test]
    fn abort_records_error_and_notifies_state() {
        let store = store();
        let obj = store.make(ObjectKind::Http, &url("http://x.test/i"), true).unwrap();
        obj.set_flag(ObjectFlags::INPROGRESS);
        store.abort(&obj, 502, "upstream protocol error");
        assert!(obj.is(ObjectFlags::ABORTED));
        assert!(!obj.is(ObjectFlags::INPROGRESS));
        assert_eq!(obj.code(), 502);
        assert_eq!(obj.length(), 0);
    }

    #[test]
    fn requestor_slot_is_exclusive() {
        let store = store();
        let obj = store.make(ObjectKind::Http, &url("http://x.test/j"), true).unwrap();
        assert!(obj.claim_requestor(1));
        assert!(obj.claim_requestor(1));
        assert!(!obj.claim_requestor(2));
        obj.release_requestor(1);
        assert!(obj.claim_requestor(2));
    }

    #[test]
    fn eviction_reclaims_unreferenced_public_objects() {
        let pool = Rc::new(ChunkPool::new(64 * CHUNK_SIZE, 32 * CHUNK_SIZE, 48 * CHUNK_SIZE));
        let config = Config { object_high_mark: 16, ..Config::default() };
        let store = ObjectStore::new(&config, pool);
        for i in 0..16 {
            let u = url(&format!("http://x.test/{i}"));
            store.make(ObjectKind::Http, &u, true).unwrap();
        }
        // The table is full of evictable objects, so creation still works.
        let extra = store.make(ObjectKind::Http, &url("http://x.test/extra"), true);
        assert!(extra.is_ok());
    }
}
