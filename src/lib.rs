#![warn(missing_docs)]
#![deny(unsafe_code)]
//! A caching HTTP/1.1 forward proxy with a two-tier memory and disk cache.
//!
//! `cachew` accepts client connections, forwards requests to origin servers
//! (or a parent proxy), stores responses in a chunked in-memory cache mirrored
//! to disk, and serves subsequent matching requests from cache when freshness
//! rules permit. CONNECT requests are tunnelled bidirectionally.
//!
//! The engine is strictly single-threaded and cooperative: it runs on a
//! current-thread tokio runtime with a `LocalSet`, so no handler ever runs
//! concurrently with another and no locks exist. Network I/O is non-blocking;
//! disk I/O is synchronous and bounded by the cache directory.
//!
//! # Running a proxy
//!
//! ```no_run
//! use cachew::{Config, Proxy};
//!
//! # async fn run() -> cachew::Result<()> {
//! let config = Config::default();
//! let proxy = Proxy::bind(config).await?;
//! println!("listening on {}", proxy.local_addr()?);
//! proxy.run().await
//! # }
//! ```
//!
//! # Cache model
//!
//! Every response body is stored as a sparse vector of fixed-size chunks
//! allocated from a watermarked pool ([`ChunkPool`]). Under memory pressure
//! fully-filled chunks are written out to per-object disk files and dropped
//! from memory; on a later hit the missing ranges are read back in. At most
//! one upstream fetch is in flight per cached object; any number of clients
//! may wait on the object's condition and stream chunks as they arrive.

mod atom;
mod chunk;
mod client;
mod cond;
mod config;
mod diskcache;
mod error;
mod external;
mod fresh;
mod io;
mod local;
mod object;
mod parse;
mod proxy;
mod server;
mod tunnel;

pub use atom::Atom;
pub use chunk::{ChunkBuf, ChunkPool, CHUNK_SIZE};
pub use cond::Condition;
pub use config::Config;
pub use error::{ProxyError, Result};
pub use external::{
    AllowAll, PolicyDecision, Resolver, SocksDialer, TokioResolver, UrlPolicy,
};
pub use fresh::{is_stale, must_revalidate, stale_at};
pub use object::{CacheFlags, CacheControl, Object, ObjectFlags, ObjectKey, ObjectKind, ObjectStore};
pub use proxy::{Core, Proxy};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as whole seconds since the Unix epoch.
///
/// Freshness arithmetic is done in epoch seconds throughout, with `-1`
/// standing for "unset".
pub fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
