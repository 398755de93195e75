use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::error::{ConfigError, ValidationError};
use crate::upstream::Upstream;

/// Raw configuration document, straight out of serde. Everything that needs
/// semantic validation stays a string here; the typed construction step lives
/// in [`crate::policy::Policy::from_config`].
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfig {
    /// Resolver groups: group name -> upstream endpoint strings.
    #[serde(default)]
    pub upstream: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub custom_dns: RawCustomDns,
    #[serde(default)]
    pub conditional: RawConditional,
    #[serde(default)]
    pub client_lookup: RawClientLookup,
    /// Client identity (IP, CIDR or resolved name) -> policy group names.
    #[serde(default)]
    pub client_groups: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub blocking: RawBlocking,
    #[serde(default)]
    pub caching: RawCaching,
    #[serde(default)]
    pub ports: RawPorts,
    #[serde(default)]
    pub cert_file: Option<String>,
    #[serde(default)]
    pub key_file: Option<String>,
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout: String,
    #[serde(default = "default_custom_ttl")]
    pub custom_ttl: String,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            upstream: HashMap::new(),
            custom_dns: RawCustomDns::default(),
            conditional: RawConditional::default(),
            client_lookup: RawClientLookup::default(),
            client_groups: HashMap::new(),
            blocking: RawBlocking::default(),
            caching: RawCaching::default(),
            ports: RawPorts::default(),
            cert_file: None,
            key_file: None,
            upstream_timeout: default_upstream_timeout(),
            custom_ttl: default_custom_ttl(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawCustomDns {
    /// domain -> comma-separated IP literals.
    #[serde(default)]
    pub mapping: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawConditional {
    /// domain suffix -> comma-separated upstream endpoint strings.
    #[serde(default)]
    pub mapping: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawClientLookup {
    /// Upstream used for PTR lookups of client addresses.
    #[serde(default)]
    pub upstream: Option<String>,
    /// 1-indexed preference over the names a reverse lookup returns.
    #[serde(default)]
    pub single_name_order: Vec<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawBlocking {
    /// list name -> blacklist sources (file paths or http(s) URLs).
    #[serde(default)]
    pub black_lists: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub white_lists: HashMap<String, Vec<String>>,
    /// policy group -> list names to enforce for that group.
    #[serde(default)]
    pub client_groups_block: HashMap<String, Vec<String>>,
    #[serde(default = "default_block_ttl")]
    pub block_ttl: String,
    #[serde(default = "default_refresh_period")]
    pub refresh_period: String,
}

impl Default for RawBlocking {
    fn default() -> Self {
        Self {
            black_lists: HashMap::new(),
            white_lists: HashMap::new(),
            client_groups_block: HashMap::new(),
            block_ttl: default_block_ttl(),
            refresh_period: default_refresh_period(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawCaching {
    /// Lower TTL clamp; absent or "0" passes the original TTL through.
    #[serde(default)]
    pub min_caching_time: Option<String>,
    /// Upper TTL clamp; absent or "0" means unbounded.
    #[serde(default)]
    pub max_caching_time: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawPorts {
    #[serde(default)]
    pub dns: ListenConfig,
    #[serde(default)]
    pub tls: ListenConfig,
    #[serde(default)]
    pub https: ListenConfig,
}

/// Listener specs, written either as a list or as one comma-separated
/// string ("55,:56"). Entries are `port`, `:port` or `addr:port`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenConfig(pub Vec<String>);

impl ListenConfig {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de> Deserialize<'de> for ListenConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            One(String),
            Many(Vec<String>),
        }
        let entries = match Raw::deserialize(deserializer)? {
            Raw::One(s) => s
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
            Raw::Many(v) => v,
        };
        Ok(ListenConfig(entries))
    }
}

fn default_block_ttl() -> String {
    "6h".to_string()
}

fn default_refresh_period() -> String {
    "4h".to_string()
}

fn default_upstream_timeout() -> String {
    "2s".to_string()
}

fn default_custom_ttl() -> String {
    "1h".to_string()
}

/// Load the raw document. A missing file is only an error when the config is
/// mandatory; a present but malformed file always is.
pub fn load_config(path: &Path, mandatory: bool) -> Result<RawConfig, ConfigError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound && !mandatory => {
            info!(path = %path.display(), "no configuration file, using defaults");
            return Ok(RawConfig::default());
        }
        Err(err) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: err,
            });
        }
    };
    serde_json::from_str(&raw).map_err(ConfigError::Parse)
}

/// Go-style duration string: a sequence of `<decimal><unit>` terms, units
/// `ns`, `us`/`µs`, `ms`, `s`, `m`, `h`. `"0"` is accepted bare.
pub fn parse_duration(input: &str) -> Result<Duration, ValidationError> {
    let bad = |token: &str| ValidationError::Duration {
        input: input.to_string(),
        token: token.to_string(),
    };

    let s = input.trim();
    if s.is_empty() {
        return Err(bad(s));
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_end == 0 {
            return Err(bad(rest));
        }
        let number = &rest[..num_end];
        let value: f64 = number.parse().map_err(|_| bad(number))?;
        rest = &rest[num_end..];

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit = &rest[..unit_end];
        let unit_secs = match unit {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            "" => return Err(bad(number)),
            other => return Err(bad(other)),
        };
        total += value * unit_secs;
        rest = &rest[unit_end..];
    }
    Ok(Duration::from_secs_f64(total))
}

/// Optional duration field: absent means zero (the "unset" sentinel).
pub fn parse_optional_duration(input: Option<&str>) -> Result<Duration, ValidationError> {
    match input {
        None => Ok(Duration::ZERO),
        Some(s) => parse_duration(s),
    }
}

/// Comma-separated IP literals.
pub fn parse_ip_list(input: &str) -> Result<Vec<IpAddr>, ValidationError> {
    input
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| {
            p.parse()
                .map_err(|_| ValidationError::IpAddress(p.to_string()))
        })
        .collect()
}

/// Comma-separated upstream endpoint strings.
pub fn parse_upstream_list(input: &str) -> Result<Vec<Upstream>, ValidationError> {
    input
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::parse)
        .collect()
}
