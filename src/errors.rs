//! Error types for the resolver.
//!
//! Protocol failures end up as DNS response codes, forwarding failures as
//! SERVFAIL, and administrative or persistence failures are returned to the
//! admin caller. Nothing here is ever sent to a DNS client verbatim.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Top-level error for the resolver.
#[derive(Error, Debug)]
pub enum DnsError {
    /// I/O errors from the standard library.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Errors related to DNS protocol parsing or formatting.
    #[error("Invalid DNS packet: {0}")]
    Protocol(String),

    /// Configuration errors.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Snapshot read/write errors.
    #[error(transparent)]
    Persist(#[from] PersistError),

    /// Record store errors.
    #[error(transparent)]
    Record(#[from] RecordError),

    /// Upstream forwarding errors.
    #[error(transparent)]
    Forward(#[from] ForwardError),
}

/// Errors surfaced by record store administration.
#[derive(Error, Debug)]
pub enum RecordError {
    /// A record with the same name, type and value already exists.
    #[error("duplicate record: {name} {rtype} {value}")]
    Duplicate {
        name: String,
        rtype: String,
        value: String,
    },

    /// No record matched the request.
    #[error("record not found: {name} {rtype}")]
    NotFound { name: String, rtype: String },

    /// The record failed validation.
    #[error("invalid record: {0}")]
    Invalid(String),

    /// The change could not be written; in-memory state is unchanged.
    #[error("failed to persist records: {0}")]
    Persist(#[from] PersistError),
}

/// Errors reading or writing a JSON snapshot file.
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("snapshot file {0} is empty")]
    Empty(PathBuf),

    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors returned by the upstream forwarder.
#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("upstream query timed out")]
    Timeout,

    #[error("network error talking to upstream: {0}")]
    Network(#[from] io::Error),

    #[error("upstream reply truncated even over TCP")]
    TruncatedAfterTcp,

    #[error("malformed upstream reply: {0}")]
    MalformedReply(String),
}
