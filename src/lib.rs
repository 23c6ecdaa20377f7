//! homedns library
//!
//! This library provides a small authoritative-with-forwarding DNS server.
//! Queries are answered from an administrator-edited record store, then from
//! a cache of upstream answers, and finally by forwarding to one upstream
//! resolver over UDP or TCP.

pub mod cache;
pub mod config;
pub mod db;
pub mod dns;
pub mod errors;
pub mod forwarder;
pub mod handlers;
pub mod persist;
pub mod record;
pub mod resolver;
pub mod responder;
pub mod server;
pub mod stats;
pub mod utils;

// Re-export commonly used items
pub use cache::DnsCache;
pub use config::{ServerConfig, SettingsHandle};
pub use db::RecordStore;
pub use errors::DnsError;
pub use resolver::QueryPipeline;
pub use server::Server;
pub use stats::Stats;
