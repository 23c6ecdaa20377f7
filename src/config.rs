//! Configuration for the DNS server.
//!
//! Settings live in a JSON file (`homedns.json` by default, or whatever
//! `DNS_CONFIG` points at) and can be overridden from environment variables.
//! At runtime they are published through a [`SettingsHandle`], which hands
//! every query its own immutable snapshot.

use std::env;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwap;
use log::info;
use serde::{Deserialize, Serialize};

use crate::errors::DnsError;
use crate::persist::{read_json, write_json};

/// Maximum size of DNS packets in bytes.
pub const MAX_PACKET_SIZE: usize = 4096;

/// Settings file used when `DNS_CONFIG` is not set.
pub const DEFAULT_CONFIG_FILE: &str = "homedns.json";

pub const DEFAULT_MAX_CONCURRENT_QUERIES: usize = 1024;
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 5;

const DEFAULT_SERVERS_FILE: &str = "dnsservers.json";
const DEFAULT_RECORDS_FILE: &str = "dnsrecords.json";
const DEFAULT_CACHE_FILE: &str = "dnscache.json";

/// Locations of the data files.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileLocations {
    pub dnsserver_file: PathBuf,
    pub dnsrecords_file: PathBuf,
    pub cache_file: PathBuf,
}

/// Record handling flags as nested by older settings files.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RecordSettings {
    #[serde(default)]
    pub auto_build_ptr_from_a: bool,
    #[serde(default)]
    pub forward_ptr_queries: bool,
}

/// Ports are written as strings but accepted as strings or numbers.
mod port_string {
    use serde::{de, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    pub fn serialize<S: Serializer>(port: &u16, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(port)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
        match Port::deserialize(deserializer)? {
            Port::Number(port) => Ok(port),
            Port::Text(text) => text
                .trim()
                .parse()
                .map_err(|_| de::Error::custom(format!("invalid port: {text}"))),
        }
    }
}

/// The settings file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Upstream resolver address.
    pub fallback_server_ip: String,

    #[serde(with = "port_string")]
    pub fallback_server_port: u16,

    /// Upstream query timeout in seconds.
    pub timeout: u64,

    /// Port to listen on (UDP and TCP).
    #[serde(with = "port_string")]
    pub dns_port: u16,

    pub cache_records: bool,
    pub auto_build_ptr_from_a: bool,
    pub forward_ptr_queries: bool,
    pub file_locations: FileLocations,

    /// Cap on concurrently handled queries.
    pub max_concurrent_queries: usize,

    /// Soft limit on cache entries.
    pub cache_capacity: usize,

    /// Seconds to wait for in-flight queries on shutdown.
    pub drain_timeout: u64,

    /// Prometheus exporter listen address; no exporter when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_addr: Option<SocketAddr>,

    #[serde(rename = "DNSRecordSettings", skip_serializing)]
    legacy_record_settings: Option<RecordSettings>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            fallback_server_ip: "1.1.1.1".into(),
            fallback_server_port: 53,
            timeout: 2,
            dns_port: 53,
            cache_records: true,
            auto_build_ptr_from_a: true,
            forward_ptr_queries: false,
            file_locations: FileLocations::default(),
            max_concurrent_queries: DEFAULT_MAX_CONCURRENT_QUERIES,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT_SECS,
            metrics_addr: None,
            legacy_record_settings: None,
        }
    }
}

fn resolve_path(dir: &Path, value: &Path, fallback: &str) -> PathBuf {
    if value.as_os_str().is_empty() {
        dir.join(fallback)
    } else if value.is_absolute() {
        value.to_path_buf()
    } else {
        dir.join(value)
    }
}

fn parse_bool(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

impl ServerConfig {
    /// Load the settings file, creating it with defaults if it is missing.
    ///
    /// # Arguments
    /// * `path` - The settings file.
    ///
    /// # Returns
    /// The settings with file locations resolved against the file's directory.
    pub fn load(path: &Path) -> Result<Self, DnsError> {
        let mut config = match read_json::<ServerConfig>(path)? {
            Some(config) => config,
            None => {
                let config = ServerConfig::default();
                write_json(path, &config)?;
                info!("Created default settings file {}", path.display());
                config
            }
        };

        if let Some(legacy) = config.legacy_record_settings.take() {
            config.auto_build_ptr_from_a = legacy.auto_build_ptr_from_a;
            config.forward_ptr_queries = legacy.forward_ptr_queries;
        }

        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        config.resolve_paths(&dir);
        config.resolver_settings()?;
        Ok(config)
    }

    /// Load settings from the file named by `DNS_CONFIG` and apply environment overrides.
    ///
    /// # Returns
    /// The settings and the path they were read from.
    pub fn from_env() -> Result<(Self, PathBuf), DnsError> {
        let path = env::var("DNS_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));
        let mut config = Self::load(&path)?;
        config.apply_overrides(|key| env::var(key).ok())?;
        Ok((config, path))
    }

    /// Apply `DNS_*` overrides looked up through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), DnsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("DNS_PORT") {
            self.dns_port = port
                .trim()
                .parse()
                .map_err(|_| DnsError::Config("Invalid DNS_PORT".into()))?;
        }
        if let Some(upstream) = lookup("DNS_UPSTREAM") {
            let upstream = upstream.trim();
            if let Ok(addr) = upstream.parse::<SocketAddr>() {
                self.fallback_server_ip = addr.ip().to_string();
                self.fallback_server_port = addr.port();
            } else if upstream.parse::<IpAddr>().is_ok() {
                self.fallback_server_ip = upstream.to_string();
            } else {
                return Err(DnsError::Config("Invalid DNS_UPSTREAM address".into()));
            }
        }
        if let Some(timeout) = lookup("DNS_TIMEOUT") {
            self.timeout = timeout
                .trim()
                .parse()
                .map_err(|_| DnsError::Config("Invalid DNS_TIMEOUT".into()))?;
        }
        if let Some(cache) = lookup("DNS_CACHE_RECORDS") {
            self.cache_records = parse_bool(cache.trim());
        }
        if let Some(addr) = lookup("DNS_METRICS_ADDR") {
            self.metrics_addr = Some(
                addr.trim()
                    .parse()
                    .map_err(|_| DnsError::Config("Invalid DNS_METRICS_ADDR".into()))?,
            );
        }
        self.resolver_settings().map(|_| ())
    }

    /// Make every file location absolute relative to `dir`.
    pub fn resolve_paths(&mut self, dir: &Path) {
        let files = &mut self.file_locations;
        files.dnsserver_file = resolve_path(dir, &files.dnsserver_file, DEFAULT_SERVERS_FILE);
        files.dnsrecords_file = resolve_path(dir, &files.dnsrecords_file, DEFAULT_RECORDS_FILE);
        files.cache_file = resolve_path(dir, &files.cache_file, DEFAULT_CACHE_FILE);
    }

    /// Write the settings back to `path`.
    pub fn save(&self, path: &Path) -> Result<(), DnsError> {
        write_json(path, self)?;
        Ok(())
    }

    /// Validate and derive the typed settings the query path uses.
    pub fn resolver_settings(&self) -> Result<ResolverSettings, DnsError> {
        let ip: IpAddr = self.fallback_server_ip.trim().parse().map_err(|_| {
            DnsError::Config(format!(
                "Invalid fallback server address: {}",
                self.fallback_server_ip
            ))
        })?;
        if self.fallback_server_port == 0 {
            return Err(DnsError::Config("Fallback server port must not be 0".into()));
        }
        if self.timeout == 0 {
            return Err(DnsError::Config("Timeout must be at least 1 second".into()));
        }
        if self.max_concurrent_queries == 0 {
            return Err(DnsError::Config("max_concurrent_queries must be positive".into()));
        }

        Ok(ResolverSettings {
            upstream: SocketAddr::new(ip, self.fallback_server_port),
            query_timeout: Duration::from_secs(self.timeout),
            listen_port: self.dns_port,
            cache_enabled: self.cache_records,
            auto_build_ptr_from_a: self.auto_build_ptr_from_a,
            forward_ptr_queries: self.forward_ptr_queries,
        })
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout)
    }
}

/// Settings a query is resolved with, copied at request entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolverSettings {
    pub upstream: SocketAddr,
    pub query_timeout: Duration,
    pub listen_port: u16,
    pub cache_enabled: bool,
    pub auto_build_ptr_from_a: bool,
    pub forward_ptr_queries: bool,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        // The default config always validates.
        let config = ServerConfig::default();
        Self {
            upstream: SocketAddr::from(([1, 1, 1, 1], config.fallback_server_port)),
            query_timeout: Duration::from_secs(config.timeout),
            listen_port: config.dns_port,
            cache_enabled: config.cache_records,
            auto_build_ptr_from_a: config.auto_build_ptr_from_a,
            forward_ptr_queries: config.forward_ptr_queries,
        }
    }
}

#[derive(Debug)]
struct Published {
    config: ServerConfig,
    resolver: ResolverSettings,
}

/// Shared, atomically replaceable settings.
#[derive(Debug)]
pub struct SettingsHandle {
    current: ArcSwap<Published>,
    path: Option<PathBuf>,
    writer: Mutex<()>,
}

impl SettingsHandle {
    /// Publish `config`. Updates are written to `path` when one is given.
    pub fn new(config: ServerConfig, path: Option<PathBuf>) -> Result<Self, DnsError> {
        let resolver = config.resolver_settings()?;
        Ok(Self {
            current: ArcSwap::from_pointee(Published { config, resolver }),
            path,
            writer: Mutex::new(()),
        })
    }

    /// Handle over fixed settings, never written to disk.
    pub fn fixed(resolver: ResolverSettings) -> Self {
        let config = ServerConfig {
            fallback_server_ip: resolver.upstream.ip().to_string(),
            fallback_server_port: resolver.upstream.port(),
            timeout: resolver.query_timeout.as_secs().max(1),
            dns_port: resolver.listen_port,
            cache_records: resolver.cache_enabled,
            auto_build_ptr_from_a: resolver.auto_build_ptr_from_a,
            forward_ptr_queries: resolver.forward_ptr_queries,
            ..ServerConfig::default()
        };
        Self {
            current: ArcSwap::from_pointee(Published { config, resolver }),
            path: None,
            writer: Mutex::new(()),
        }
    }

    /// Snapshot of the settings for one query.
    pub fn resolver(&self) -> ResolverSettings {
        self.current.load().resolver.clone()
    }

    /// Copy of the full settings file contents.
    pub fn config(&self) -> ServerConfig {
        self.current.load().config.clone()
    }

    /// Change the settings.
    ///
    /// The new settings are validated and persisted before they become
    /// visible; on error nothing changes.
    pub fn update<F>(&self, change: F) -> Result<ResolverSettings, DnsError>
    where
        F: FnOnce(&mut ServerConfig),
    {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut config = self.current.load().config.clone();
        change(&mut config);
        let resolver = config.resolver_settings()?;
        if let Some(path) = &self.path {
            config.save(path)?;
        }
        self.current.store(Arc::new(Published {
            config,
            resolver: resolver.clone(),
        }));
        info!("Settings updated: upstream {}", resolver.upstream);
        Ok(resolver)
    }
}
