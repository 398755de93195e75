use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use ipnet::IpNet;

use crate::config::{
    self, ListenConfig, RawConfig, parse_duration, parse_ip_list, parse_optional_duration,
    parse_upstream_list,
};
use crate::error::{ConfigError, ValidationError};
use crate::upstream::Upstream;

/// The resolver group used when nothing more specific matches.
pub const DEFAULT_GROUP: &str = "default";

/// Validated, immutable runtime policy. Built once from a [`RawConfig`];
/// a reload builds a fresh value and swaps the active reference, the struct
/// itself is never mutated.
#[derive(Debug)]
pub struct Policy {
    /// Resolver groups, each an ordered set of redundant upstreams.
    pub groups: HashMap<String, Vec<Upstream>>,
    /// Exact domain -> literal answer IPs, bypassing upstream resolution.
    pub custom_dns: HashMap<String, Vec<IpAddr>>,
    /// Domain suffix -> dedicated resolver group.
    pub conditional: HashMap<String, ConditionalRoute>,
    /// Ordered client matching rules; first match does not win, the union of
    /// all matching rules' groups does.
    pub client_groups: Vec<ClientGroupRule>,
    pub client_lookup: ClientLookupConfig,
    pub blocking: BlockingConfig,
    pub caching: CacheBounds,
    pub ports: Ports,
    pub tls_identity: Option<TlsIdentity>,
    pub upstream_timeout: Duration,
    /// TTL attached to custom-DNS answers.
    pub custom_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct ConditionalRoute {
    /// Group label used in logs; the suffix that routed here.
    pub name: String,
    pub upstreams: Vec<Upstream>,
}

#[derive(Debug, Clone)]
pub enum ClientKey {
    Ip(IpAddr),
    Net(IpNet),
    /// Case-insensitive match against names from the reverse lookup.
    Name(String),
}

#[derive(Debug, Clone)]
pub struct ClientGroupRule {
    pub key: ClientKey,
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ClientLookupConfig {
    pub upstream: Option<Upstream>,
    pub single_name_order: Vec<usize>,
}

#[derive(Debug, Clone)]
pub enum ListSource {
    File(PathBuf),
    Url(String),
}

impl ListSource {
    fn classify(raw: &str) -> Self {
        if raw.starts_with("http://") || raw.starts_with("https://") {
            ListSource::Url(raw.to_string())
        } else {
            ListSource::File(PathBuf::from(raw))
        }
    }

    pub fn label(&self) -> String {
        match self {
            ListSource::File(p) => p.display().to_string(),
            ListSource::Url(u) => u.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct BlockingConfig {
    pub black_lists: HashMap<String, Vec<ListSource>>,
    pub white_lists: HashMap<String, Vec<ListSource>>,
    /// policy group -> names into black_lists/white_lists.
    pub client_groups_block: HashMap<String, Vec<String>>,
    pub block_ttl: Duration,
    /// Zero disables the periodic recompile.
    pub refresh_period: Duration,
}

/// TTL clamp bounds; zero means "unset" on either side.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheBounds {
    pub min: Duration,
    pub max: Duration,
}

#[derive(Debug, Default)]
pub struct Ports {
    pub dns: ListenConfig,
    pub tls: ListenConfig,
    pub https: ListenConfig,
}

#[derive(Debug, Clone)]
pub struct TlsIdentity {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

impl Policy {
    /// Typed construction over the raw document. Collects every field error
    /// instead of stopping at the first; the caller decides whether the
    /// aggregate is fatal.
    pub fn from_config(raw: &RawConfig) -> Result<Self, ConfigError> {
        let mut errors: Vec<ValidationError> = Vec::new();

        let mut groups = HashMap::new();
        for (name, entries) in &raw.upstream {
            let mut upstreams = Vec::with_capacity(entries.len());
            for entry in entries {
                match entry.parse::<Upstream>() {
                    Ok(u) => upstreams.push(u),
                    Err(e) => errors.push(e),
                }
            }
            groups.insert(name.clone(), upstreams);
        }

        let mut custom_dns = HashMap::new();
        for (domain, ips) in &raw.custom_dns.mapping {
            match parse_ip_list(ips) {
                Ok(ips) => {
                    custom_dns.insert(normalize_domain(domain), ips);
                }
                Err(e) => errors.push(e),
            }
        }

        let mut conditional = HashMap::new();
        for (suffix, entries) in &raw.conditional.mapping {
            match parse_upstream_list(entries) {
                Ok(upstreams) => {
                    let suffix = normalize_domain(suffix);
                    conditional.insert(
                        suffix.clone(),
                        ConditionalRoute {
                            name: suffix,
                            upstreams,
                        },
                    );
                }
                Err(e) => errors.push(e),
            }
        }

        let mut client_groups = Vec::new();
        for (key, names) in &raw.client_groups {
            client_groups.push(ClientGroupRule {
                key: parse_client_key(key),
                groups: names.clone(),
            });
        }

        let mut client_lookup = ClientLookupConfig::default();
        if let Some(entry) = &raw.client_lookup.upstream {
            match entry.parse::<Upstream>() {
                Ok(u) => client_lookup.upstream = Some(u),
                Err(e) => errors.push(e),
            }
        }
        for &pos in &raw.client_lookup.single_name_order {
            if pos == 0 {
                errors.push(ValidationError::NameOrderIndex(pos));
            }
        }
        client_lookup.single_name_order = raw.client_lookup.single_name_order.clone();

        let mut take_duration = |input: &str| match parse_duration(input) {
            Ok(d) => d,
            Err(e) => {
                errors.push(e);
                Duration::ZERO
            }
        };

        let blocking = BlockingConfig {
            black_lists: classify_lists(&raw.blocking.black_lists),
            white_lists: classify_lists(&raw.blocking.white_lists),
            client_groups_block: raw.blocking.client_groups_block.clone(),
            block_ttl: take_duration(&raw.blocking.block_ttl),
            refresh_period: take_duration(&raw.blocking.refresh_period),
        };

        let upstream_timeout = take_duration(&raw.upstream_timeout);
        let custom_ttl = take_duration(&raw.custom_ttl);

        let caching = {
            let min = parse_optional_duration(raw.caching.min_caching_time.as_deref());
            let max = parse_optional_duration(raw.caching.max_caching_time.as_deref());
            CacheBounds {
                min: min.unwrap_or_else(|e| {
                    errors.push(e);
                    Duration::ZERO
                }),
                max: max.unwrap_or_else(|e| {
                    errors.push(e);
                    Duration::ZERO
                }),
            }
        };

        let tls_identity = match (&raw.cert_file, &raw.key_file) {
            (Some(cert), Some(key)) => Some(TlsIdentity {
                cert_file: PathBuf::from(cert),
                key_file: PathBuf::from(key),
            }),
            _ => None,
        };
        if !raw.ports.tls.is_empty() && tls_identity.is_none() {
            errors.push(ValidationError::MissingCertificate { listener: "tls" });
        }
        if !raw.ports.https.is_empty() && tls_identity.is_none() {
            errors.push(ValidationError::MissingCertificate { listener: "https" });
        }

        if !errors.is_empty() {
            return Err(ConfigError::Invalid(errors));
        }

        Ok(Policy {
            groups,
            custom_dns,
            conditional,
            client_groups,
            client_lookup,
            blocking,
            caching,
            ports: Ports {
                dns: raw.ports.dns.clone(),
                tls: raw.ports.tls.clone(),
                https: raw.ports.https.clone(),
            },
            tls_identity,
            upstream_timeout,
            custom_ttl,
        })
    }

    /// Upstreams of the default group, if configured.
    pub fn default_group(&self) -> &[Upstream] {
        self.groups
            .get(DEFAULT_GROUP)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Longest-suffix conditional route for a query name: the name itself,
    /// then each ancestor (`a.b.c` -> `b.c` -> `c`).
    pub fn conditional_route(&self, qname: &str) -> Option<&ConditionalRoute> {
        let mut search = qname;
        loop {
            if let Some(route) = self.conditional.get(search) {
                return Some(route);
            }
            match search.find('.') {
                Some(idx) => search = &search[idx + 1..],
                None => return None,
            }
        }
    }
}

fn classify_lists(raw: &HashMap<String, Vec<String>>) -> HashMap<String, Vec<ListSource>> {
    raw.iter()
        .map(|(name, sources)| {
            (
                name.clone(),
                sources.iter().map(|s| ListSource::classify(s)).collect(),
            )
        })
        .collect()
}

fn parse_client_key(key: &str) -> ClientKey {
    if let Ok(ip) = key.parse::<IpAddr>() {
        ClientKey::Ip(ip)
    } else if let Ok(net) = key.parse::<IpNet>() {
        ClientKey::Net(net)
    } else {
        ClientKey::Name(key.to_ascii_lowercase())
    }
}

/// Lowercase, no trailing dot. All domain keys and query names go through
/// this so map lookups compare equal forms.
pub fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn policy_from(value: serde_json::Value) -> Result<Policy, ConfigError> {
        let raw: RawConfig = serde_json::from_value(value).expect("decode document");
        Policy::from_config(&raw)
    }

    #[test]
    fn compiles_groups_and_mappings() {
        let policy = policy_from(json!({
            "upstream": { "default": ["8.8.8.8", "tcp-tls:1.1.1.1"] },
            "custom_dns": { "mapping": { "My.DuckDNS.org": "192.168.178.3" } },
            "conditional": { "mapping": { "Fritz.Box": "192.168.178.1" } }
        }))
        .expect("valid policy");

        assert_eq!(policy.default_group().len(), 2);
        assert!(policy.custom_dns.contains_key("my.duckdns.org"));
        let route = policy.conditional_route("host.fritz.box").expect("route");
        assert_eq!(route.name, "fritz.box");
        assert_eq!(route.upstreams[0].host, "192.168.178.1");
    }

    #[test]
    fn conditional_route_walks_ancestors_only() {
        let policy = policy_from(json!({
            "conditional": { "mapping": { "fritz.box": "192.168.178.1" } }
        }))
        .expect("valid policy");

        assert!(policy.conditional_route("fritz.box").is_some());
        assert!(policy.conditional_route("a.b.fritz.box").is_some());
        assert!(policy.conditional_route("notfritz.box").is_none());
        assert!(policy.conditional_route("fritz.box.com").is_none());
    }

    #[test]
    fn bad_custom_dns_ip_is_collected() {
        let err = policy_from(json!({
            "custom_dns": { "mapping": { "some.domain": "192.168.178.WRONG" } }
        }))
        .unwrap_err();
        assert!(err.to_string().contains("192.168.178.WRONG"), "{err}");
    }

    #[test]
    fn bad_conditional_upstream_is_collected() {
        let err = policy_from(json!({
            "conditional": { "mapping": { "multiple.resolvers": "192.168.178.1,wrongprotocol:4.4.4.4:53" } }
        }))
        .unwrap_err();
        assert!(err.to_string().contains("wrongprotocol"), "{err}");
    }

    #[test]
    fn secure_ports_require_certificate_material() {
        let err = policy_from(json!({ "ports": { "tls": "953" } })).unwrap_err();
        assert!(err.to_string().contains("cert_file"), "{err}");

        let err = policy_from(json!({ "ports": { "https": "443" } })).unwrap_err();
        assert!(err.to_string().contains("cert_file"), "{err}");

        policy_from(json!({
            "ports": { "tls": "953" },
            "cert_file": "cert.pem",
            "key_file": "key.pem"
        }))
        .expect("cert and key present");
    }

    #[test]
    fn multiple_field_errors_are_aggregated() {
        let err = policy_from(json!({
            "upstream": { "default": ["bla:4.4.4.4:53"] },
            "blocking": { "refresh_period": "wrongduration" }
        }))
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("bla"), "{msg}");
        assert!(msg.contains("wrongduration"), "{msg}");
    }

    #[test]
    fn client_keys_classify_ip_net_and_name() {
        let policy = policy_from(json!({
            "client_groups": {
                "192.168.178.39": ["kids"],
                "10.0.0.0/8": ["lab"],
                "Laptop.fritz.box": ["adults"]
            }
        }))
        .expect("valid policy");

        let mut saw_ip = false;
        let mut saw_net = false;
        let mut saw_name = false;
        for rule in &policy.client_groups {
            match &rule.key {
                ClientKey::Ip(_) => saw_ip = true,
                ClientKey::Net(_) => saw_net = true,
                ClientKey::Name(n) => {
                    saw_name = true;
                    assert_eq!(n, "laptop.fritz.box");
                }
            }
        }
        assert!(saw_ip && saw_net && saw_name);
    }

    #[test]
    fn zero_order_position_is_rejected() {
        let err = policy_from(json!({
            "client_lookup": { "upstream": "192.168.178.1", "single_name_order": [0] }
        }))
        .unwrap_err();
        assert!(err.to_string().contains("1-indexed"), "{err}");
    }

    #[test]
    fn defaults_validate() {
        let policy = Policy::from_config(&config::RawConfig::default()).expect("defaults");
        assert!(policy.groups.is_empty());
        assert_eq!(policy.blocking.block_ttl, Duration::from_secs(6 * 3600));
        assert_eq!(policy.upstream_timeout, Duration::from_secs(2));
        assert_eq!(policy.caching.min, Duration::ZERO);
    }
}
