//! Proxy configuration.
//!
//! All tunables live in one [`Config`] struct with working defaults. A TOML
//! file can override any subset of fields, and the binary layers command-line
//! flags on top of that. Tests construct `Config` directly.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::chunk::CHUNK_SIZE;
use crate::error::{ProxyError, Result};

const MB: usize = 1024 * 1024;

/// Proxy configuration.
///
/// Field names match the TOML keys. Durations are whole seconds; memory
/// marks are bytes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Address to listen on.
    pub proxy_address: IpAddr,
    /// Port to listen on.
    pub proxy_port: u16,
    /// The name the proxy uses in Via and Warning headers. Defaults to the
    /// host name, falling back to "cachew".
    pub proxy_name: String,
    /// If non-empty, only these client addresses may connect.
    pub allowed_clients: Vec<IpAddr>,
    /// Ports CONNECT may tunnel to.
    pub allowed_ports: Vec<u16>,

    /// Upper bound on chunk memory, in bytes. Allocation past this fails.
    pub chunk_high_mark: usize,
    /// Background eviction starts above this many bytes of chunk memory.
    pub chunk_low_mark: usize,
    /// Above this mark eviction may drop chunks from in-use objects.
    pub chunk_critical_mark: usize,

    /// Maximum number of in-memory objects, public and private together.
    pub object_high_mark: usize,
    /// Background expiry of public objects starts above this count.
    pub public_object_low_mark: usize,

    /// Root directory of the on-disk cache. `None` disables the disk cache.
    pub disk_cache_root: Option<PathBuf>,
    /// Maximum number of cache files kept open at once.
    pub max_disk_entries: usize,
    /// Seconds of quiet before the idle write-out pass runs.
    pub idle_time: u64,
    /// Byte budget per object for one idle write-out pass.
    pub max_writeout_when_idle: usize,
    /// Object budget for one idle write-out pass.
    pub max_objects_when_idle: usize,

    /// Root directory for local document serving. `None` disables it.
    pub local_document_root: Option<PathBuf>,

    /// Seconds a client connection may sit idle mid-request.
    pub client_timeout: u64,
    /// Seconds an upstream connection may sit quiet mid-response.
    pub server_timeout: u64,
    /// Seconds an idle upstream connection is kept for reuse.
    pub server_expire_time: u64,
    /// Concurrent connections per origin server.
    pub server_slots: usize,
    /// Additional requests that may be pipelined behind the first on one
    /// upstream connection. Zero disables pipelining.
    pub pipeline_additional_requests: usize,

    /// Whether this cache is shared between users (enables s-maxage and the
    /// private directive).
    pub cache_is_shared: bool,
    /// Serve objects with a Vary header without revalidating. Off by
    /// default; a strong ETag always allows revalidation instead.
    pub mindlessly_cache_vary: bool,
    /// Refuse to cache responses that carry Set-Cookie.
    pub dont_cache_cookies: bool,
    /// Never talk to the network; serve what is cached and 502 the rest.
    pub proxy_offline: bool,

    /// Hard cap in seconds on object freshness from server directives.
    pub max_expires_age: i64,
    /// Hard cap in seconds on object freshness without server directives.
    pub max_age: i64,
    /// Fraction of (date - last_modified) used for heuristic expiry.
    pub max_age_fraction: f64,
    /// Freshness in seconds for objects with no validator at all.
    pub max_no_modified_age: i64,

    /// Parent proxy as (host, port); all upstream traffic goes through it.
    pub parent_proxy: Option<(String, u16)>,
    /// "user:password" presented to the parent proxy with Basic auth.
    pub parent_auth_credentials: Option<String>,
    /// SOCKS5 parent as (host, port).
    pub socks_parent_proxy: Option<(String, u16)>,
    /// Require clients to present this "user:password" with Basic
    /// Proxy-Authorization.
    pub auth_credentials: Option<String>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            proxy_address: IpAddr::from([127, 0, 0, 1]),
            proxy_port: 8123,
            proxy_name: hostname(),
            allowed_clients: Vec::new(),
            allowed_ports: vec![443, 563],
            chunk_high_mark: 24 * MB,
            chunk_low_mark: 0,
            chunk_critical_mark: 0,
            object_high_mark: 2048,
            public_object_low_mark: 0,
            disk_cache_root: None,
            max_disk_entries: 32,
            idle_time: 20,
            max_writeout_when_idle: 64 * 1024,
            max_objects_when_idle: 32,
            local_document_root: None,
            client_timeout: 120,
            server_timeout: 90,
            server_expire_time: 86400,
            server_slots: 2,
            pipeline_additional_requests: 4,
            cache_is_shared: true,
            mindlessly_cache_vary: false,
            dont_cache_cookies: false,
            proxy_offline: false,
            max_expires_age: 14 * 24 * 3600,
            max_age: 24 * 3600,
            max_age_fraction: 0.1,
            max_no_modified_age: 23,
            parent_proxy: None,
            parent_auth_credentials: None,
            socks_parent_proxy: None,
            auth_credentials: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, with defaults for absent keys.
    pub fn load(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&text)
            .map_err(|_| ProxyError::BadRequest("invalid configuration file"))?;
        config.repair();
        Ok(config)
    }

    /// Apply the consistency rules for derived fields.
    ///
    /// Mirrors the chunk-pool mark repair so that values reported in logs
    /// match what the pool actually enforces, and derives the public-object
    /// low mark from the high mark when unset.
    pub fn repair(&mut self) {
        if self.chunk_high_mark < 8 * CHUNK_SIZE {
            self.chunk_high_mark = 24 * MB;
        }
        if self.public_object_low_mark == 0
            || self.public_object_low_mark >= self.object_high_mark
        {
            self.public_object_low_mark = self.object_high_mark / 2;
        }
        if self.server_slots == 0 {
            self.server_slots = 1;
        }
        if self.proxy_name.is_empty() {
            self.proxy_name = "cachew".to_string();
        }
    }

    /// True when `addr` is allowed to connect.
    pub fn client_allowed(&self, addr: &IpAddr) -> bool {
        self.allowed_clients.is_empty() || self.allowed_clients.contains(addr)
    }

    /// True when CONNECT may tunnel to `port`.
    pub fn port_allowed(&self, port: u16) -> bool {
        self.allowed_ports.is_empty() || self.allowed_ports.contains(&port)
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "cachew".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let mut config = Config::default();
        config.repair();
        assert_eq!(config.proxy_port, 8123);
        assert!(config.port_allowed(443));
        assert!(!config.port_allowed(25));
        assert!(config.public_object_low_mark < config.object_high_mark);
    }

    #[test]
    fn empty_allow_list_admits_everyone() {
        let config = Config::default();
        assert!(config.client_allowed(&IpAddr::from([10, 0, 0, 1])));
    }

    #[test]
    fn allow_list_filters() {
        let config = Config {
            allowed_clients: vec![IpAddr::from([127, 0, 0, 1])],
            ..Config::default()
        };
        assert!(config.client_allowed(&IpAddr::from([127, 0, 0, 1])));
        assert!(!config.client_allowed(&IpAddr::from([10, 0, 0, 1])));
    }

    #[test]
    fn toml_overrides_subset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cachew.toml");
        std::fs::write(&path, "proxy_port = 3128\ndont_cache_cookies = true\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.proxy_port, 3128);
        assert!(config.dont_cache_cookies);
        // Untouched keys keep their defaults.
        assert_eq!(config.max_disk_entries, 32);
    }
}
