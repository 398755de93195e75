use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while loading or validating the configuration document.
/// These are fatal at startup; the boundary layer decides whether to exit.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed configuration document: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("invalid configuration: {}", join_errors(.0))]
    Invalid(Vec<ValidationError>),
}

/// A single semantically invalid configuration field.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("invalid upstream '{input}': {reason}")]
    Upstream { input: String, reason: String },
    #[error("invalid duration '{input}': unexpected token '{token}'")]
    Duration { input: String, token: String },
    #[error("invalid IP address '{0}'")]
    IpAddress(String),
    #[error("{listener} listener port configured without cert_file and key_file")]
    MissingCertificate { listener: &'static str },
    #[error("single_name_order positions are 1-indexed, got {0}")]
    NameOrderIndex(usize),
}

/// Failure of one upstream during a group query. Recovered inside the
/// parallel querier; other group members may still win the race.
#[derive(Error, Debug)]
pub enum UpstreamQueryError {
    #[error("i/o error talking to {upstream}: {reason}")]
    Io { upstream: String, reason: String },
    #[error("{upstream} timed out after {timeout:?}")]
    Timeout { upstream: String, timeout: Duration },
    #[error("unparseable response from {upstream}: {reason}")]
    Protocol { upstream: String, reason: String },
    #[error("{upstream} answered with {rcode}")]
    ErrorStatus { upstream: String, rcode: String },
    #[error("tls session with {upstream} failed: {reason}")]
    Tls { upstream: String, reason: String },
    #[error("https exchange with {upstream} failed: {reason}")]
    Https { upstream: String, reason: String },
}

/// Every member of a resolver group failed or timed out. Surfaces from the
/// pipeline as a SERVFAIL answer, never as a process failure.
#[derive(Error, Debug)]
#[error("all {count} upstreams of group '{group}' failed: {detail}", count = .causes.len(), detail = join_errors(.causes))]
pub struct AllUpstreamsFailed {
    pub group: String,
    pub causes: Vec<UpstreamQueryError>,
}

/// Blacklist/whitelist source could not be fetched or compiled. Reported and
/// swallowed; the previous compiled snapshot stays authoritative.
#[derive(Error, Debug)]
pub enum ListRefreshError {
    #[error("read list file {path}: {reason}")]
    Read { path: PathBuf, reason: String },
    #[error("fetch list {url}: {reason}")]
    Fetch { url: String, reason: String },
    #[error("invalid pattern '{entry}' in list '{list}': {reason}")]
    Pattern {
        list: String,
        entry: String,
        reason: String,
    },
}

fn join_errors<E: std::fmt::Display>(errors: &[E]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
