//! Engine wiring: the shared core, the accept loop, and the background
//! maintenance passes (chunk eviction, public-object expiry, idle disk
//! write-out).

use std::cell::Cell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::chunk::{ChunkBuf, ChunkPool, CHUNK_SIZE};
use crate::client;
use crate::config::Config;
use crate::diskcache::DiskCache;
use crate::error::Result;
use crate::external::{AllowAll, Resolver, SocksDialer, TokioResolver, UrlPolicy};
use crate::fresh;
use crate::object::{ObjectFlags, ObjectStore};
use crate::server::ServerPool;

/// How many body bytes an evicted object may still flush to disk.
const WRITEOUT_ON_CLOSE: usize = 64 * 1024;

/// Shared state of one proxy instance.
///
/// Everything hangs off an `Rc<Core>`: the chunk pool, the object store, the
/// per-origin server pool, the optional disk cache, and the collaborator
/// seams. All interior mutability is single-threaded.
pub struct Core {
    /// The configuration this instance runs with.
    pub config: Config,
    /// The watermarked chunk pool.
    pub pool: Rc<ChunkPool>,
    /// In-memory object table and LRU.
    pub store: ObjectStore,
    pub(crate) servers: ServerPool,
    pub(crate) disk: Option<DiskCache>,
    pub(crate) resolver: Rc<dyn Resolver>,
    pub(crate) policy: Rc<dyn UrlPolicy>,
    pub(crate) socks: Option<SocksDialer>,
    kick: Notify,
    next_request_id: Cell<u64>,
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core").field("config", &self.config).finish_non_exhaustive()
    }
}

impl Core {
    /// Build a core from a configuration, with the default collaborators.
    pub fn new(mut config: Config) -> Rc<Core> {
        config.repair();
        let pool = Rc::new(ChunkPool::new(
            config.chunk_high_mark,
            config.chunk_low_mark,
            config.chunk_critical_mark,
        ));
        let store = ObjectStore::new(&config, pool.clone());
        let disk = config.disk_cache_root.as_ref().and_then(|root| {
            match DiskCache::new(root, config.max_disk_entries) {
                Ok(cache) => Some(cache),
                Err(e) => {
                    warn!("disk cache disabled: {e}");
                    None
                }
            }
        });
        let socks = config
            .socks_parent_proxy
            .as_ref()
            .map(|(host, port)| SocksDialer { host: host.clone(), port: *port });
        Rc::new(Core {
            config,
            pool,
            store,
            servers: ServerPool::new(),
            disk,
            resolver: Rc::new(TokioResolver),
            policy: Rc::new(AllowAll),
            socks,
            kick: Notify::new(),
            next_request_id: Cell::new(1),
        })
    }

    /// A fresh request id, used for the object requestor slot.
    pub fn next_request_id(&self) -> u64 {
        let id = self.next_request_id.get();
        self.next_request_id.set(id + 1);
        id
    }

    /// Allocate a chunk, evicting under pressure.
    ///
    /// At the high mark a synchronous eviction pass runs, the free list is
    /// released, and the allocation is retried once. Crossing the low mark
    /// kicks the background eviction task.
    pub fn get_chunk(&self) -> Option<ChunkBuf> {
        let buf = match self.pool.alloc() {
            Some(buf) => Some(buf),
            None => {
                self.discard_objects(true);
                self.pool.release_free();
                self.pool.alloc()
            }
        };
        if self.pool.used() >= self.pool.low() {
            self.kick.notify_waiters();
        }
        buf
    }

    /// Allocate a chunk without ever evicting.
    pub fn maybe_get_chunk(&self) -> Option<ChunkBuf> {
        self.pool.alloc()
    }

    /// One eviction pass over the object LRU, least-recent first.
    ///
    /// First, objects holding more than a quarter of the low mark spill
    /// their write-covered chunks to disk and drop them. Second, above the
    /// low mark (or when forced) unreferenced objects are privatised out of
    /// the table. Third, above the critical mark (or forced) chunks are
    /// dropped from the middle of objects still in use, as long as the disk
    /// mirror covers them.
    pub fn discard_objects(&self, force: bool) {
        let tail = self.store.tail_objects(256);

        let spill_threshold = (self.pool.low() / 4).max(1);
        for obj in &tail {
            if !obj.is(ObjectFlags::PUBLIC) || obj.chunks_in_memory() <= spill_threshold {
                continue;
            }
            self.spill_object(obj, usize::MAX);
        }

        if force || self.pool.used() > self.pool.low() {
            // Dirty objects about to be dropped get a bounded write-out so
            // their bytes survive on disk.
            if self.disk.is_some() {
                for obj in &tail {
                    if obj.is(ObjectFlags::PUBLIC) && obj.disk_size() < obj.size() {
                        self.spill_object(obj, WRITEOUT_ON_CLOSE);
                    }
                }
            }
            self.store.evict_some();
        }

        if force || self.pool.used() > self.pool.critical() {
            for obj in &tail {
                if self.pool.used() <= self.pool.low() && !force {
                    break;
                }
                self.spill_object(obj, usize::MAX);
            }
        }
        debug!(used = self.pool.used(), "eviction pass done");
    }

    fn spill_object(&self, obj: &Rc<crate::object::Object>, max_bytes: usize) {
        if let Some(disk) = &self.disk {
            disk.writeout(obj, obj.size(), max_bytes);
            obj.strip_covered_chunks(obj.disk_size());
        }
    }

    /// The background maintenance loop: reacts to watermark kicks and runs
    /// every couple of seconds while memory stays above the low mark.
    pub async fn maintenance(self: Rc<Self>) {
        loop {
            let kicked = self.kick.notified();
            tokio::pin!(kicked);
            tokio::select! {
                _ = &mut kicked => {}
                _ = tokio::time::sleep(Duration::from_secs(2)) => {}
            }
            if self.pool.used() >= self.pool.low() {
                self.discard_objects(false);
            }
            if self.store.public_count() > self.store.public_low() {
                let config = self.config.clone();
                let now = crate::now();
                self.store.expire_public(|obj| {
                    fresh::is_stale(obj, &Default::default(), &config, now)
                });
            }
        }
    }

    /// The idle write-out loop: after `idle_time` of quiet, walk the LRU
    /// writing bounded amounts of dirty objects out to disk.
    pub async fn idle_writeout(self: Rc<Self>) {
        let idle = Duration::from_secs(self.config.idle_time.max(1));
        loop {
            tokio::time::sleep(idle).await;
            let Some(disk) = &self.disk else { continue };
            if !disk.is_dirty() {
                continue;
            }
            let mut remaining_objects = self.config.max_objects_when_idle.max(1);
            let mut caught_up = true;
            for obj in self.store.tail_objects(256) {
                if remaining_objects == 0 {
                    caught_up = false;
                    break;
                }
                if !obj.is(ObjectFlags::PUBLIC) || obj.is(ObjectFlags::INPROGRESS) {
                    continue;
                }
                if obj.disk_size() >= obj.size() {
                    continue;
                }
                disk.writeout(&obj, obj.size(), self.config.max_writeout_when_idle);
                if obj.disk_size() < obj.size() {
                    caught_up = false;
                }
                remaining_objects -= 1;
            }
            if caught_up {
                disk.mark_clean();
            }
        }
    }

    /// Flush disk state; called on shutdown.
    pub fn flush(&self) {
        if let Some(disk) = &self.disk {
            for obj in self.store.tail_objects(usize::MAX) {
                if obj.is(ObjectFlags::PUBLIC) && obj.disk_size() < obj.size() {
                    disk.writeout(&obj, obj.size(), usize::MAX);
                }
            }
            disk.flush_all();
        }
    }
}

/// A bound, ready-to-run proxy.
#[derive(Debug)]
pub struct Proxy {
    core: Rc<Core>,
    listener: TcpListener,
}

impl Proxy {
    /// Bind the configured listen address.
    pub async fn bind(config: Config) -> Result<Proxy> {
        let core = Core::new(config);
        let addr = SocketAddr::new(core.config.proxy_address, core.config.proxy_port);
        let listener = TcpListener::bind(addr).await?;
        Ok(Proxy { core, listener })
    }

    /// The bound address, useful with port 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// A handle to the shared core.
    pub fn core(&self) -> Rc<Core> {
        self.core.clone()
    }

    /// Accept clients forever. Must run inside a `LocalSet` on a
    /// current-thread runtime.
    pub async fn run(self) -> Result<()> {
        let Proxy { core, listener } = self;
        info!("listening on {}", listener.local_addr()?);

        tokio::task::spawn_local(core.clone().maintenance());
        tokio::task::spawn_local(core.clone().idle_writeout());

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    if !core.config.client_allowed(&peer.ip()) {
                        debug!("refusing client {peer}");
                        drop(stream);
                        continue;
                    }
                    let _ = stream.set_nodelay(true);
                    let core = core.clone();
                    tokio::task::spawn_local(async move {
                        if let Err(e) = client::handle_connection(core, stream, peer).await {
                            debug!("client {peer}: {e}");
                        }
                    });
                }
                Err(e) => {
                    // Out of descriptors or memory: shed what we can and
                    // retry in a second.
                    warn!("accept failed: {e}");
                    self::accept_backoff(&core).await;
                }
            }
        }
    }
}

async fn accept_backoff(core: &Rc<Core>) {
    core.pool.release_free();
    core.discard_objects(false);
    tokio::time::sleep(Duration::from_secs(1)).await;
}

/// Helper used by dispatchers: round an offset down to its chunk boundary.
pub fn chunk_floor(offset: i64) -> i64 {
    offset - offset.rem_euclid(CHUNK_SIZE as i64)
}
