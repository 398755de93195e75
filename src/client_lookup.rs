use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{DNSClass, Name, RData, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use crate::error::UpstreamQueryError;
use crate::exchange::Exchanger;
use crate::policy::{ClientKey, Policy, normalize_domain};
use crate::upstream::Upstream;

/// Maps a requesting client to names (PTR lookup) and on to policy groups.
pub struct ClientLookup {
    policy: Arc<ArcSwap<Policy>>,
    exchanger: Arc<dyn Exchanger>,
    /// Names per client IP; reverse lookups are slow and clients are few.
    names: DashMap<IpAddr, Arc<Vec<String>>>,
    next_id: AtomicU16,
}

impl ClientLookup {
    pub fn new(policy: Arc<ArcSwap<Policy>>, exchanger: Arc<dyn Exchanger>) -> Self {
        Self {
            policy,
            exchanger,
            names: DashMap::new(),
            next_id: AtomicU16::new(1),
        }
    }

    /// Names the reverse zone returns for this client, in PTR order. Empty
    /// when no lookup upstream is configured or the lookup fails; group
    /// matching then falls back to raw-IP rules only.
    pub async fn resolve(&self, client: IpAddr) -> Arc<Vec<String>> {
        let policy = self.policy.load_full();
        let Some(upstream) = policy.client_lookup.upstream.clone() else {
            return Arc::new(Vec::new());
        };
        if let Some(hit) = self.names.get(&client) {
            return hit.clone();
        }
        match self
            .ptr_lookup(&upstream, client, policy.upstream_timeout)
            .await
        {
            Ok(names) => {
                let names = Arc::new(names);
                self.names.insert(client, names.clone());
                names
            }
            Err(err) => {
                debug!(client = %client, error = %err, "reverse lookup failed");
                Arc::new(Vec::new())
            }
        }
    }

    async fn ptr_lookup(
        &self,
        upstream: &Upstream,
        client: IpAddr,
        limit: Duration,
    ) -> Result<Vec<String>, UpstreamQueryError> {
        let protocol_err = |reason: String| UpstreamQueryError::Protocol {
            upstream: upstream.to_string(),
            reason,
        };

        let name =
            Name::from_str(&reverse_name(client)).map_err(|e| protocol_err(e.to_string()))?;
        let mut request = Message::new();
        request.set_id(self.next_id.fetch_add(1, Ordering::Relaxed));
        request.set_message_type(MessageType::Query);
        request.set_op_code(OpCode::Query);
        request.set_recursion_desired(true);
        let mut query = Query::new();
        query.set_name(name);
        query.set_query_type(RecordType::PTR);
        query.set_query_class(DNSClass::IN);
        request.add_query(query);
        let packet = request
            .to_bytes()
            .map_err(|e| protocol_err(e.to_string()))?;

        let bytes = self.exchanger.exchange(upstream, &packet, limit).await?;
        let response = Message::from_bytes(&bytes).map_err(|e| protocol_err(e.to_string()))?;
        Ok(response
            .answers()
            .iter()
            .filter_map(|record| match record.data() {
                Some(RData::PTR(ptr)) => Some(normalize_domain(&ptr.0.to_ascii())),
                _ => None,
            })
            .collect())
    }

    /// The one name for this client when exactly one is needed, picked by the
    /// configured 1-indexed preference order with fallback to the first name.
    pub fn canonical_name<'a>(&self, names: &'a [String]) -> Option<&'a str> {
        let policy = self.policy.load();
        pick_name(names, &policy.client_lookup.single_name_order)
    }

    /// Union of group names whose rule matches the raw IP or any resolved
    /// name; `["default"]` when nothing matches.
    pub async fn groups_for(&self, client: IpAddr) -> Vec<String> {
        let names = self.resolve(client).await;
        let policy = self.policy.load_full();

        let mut groups = BTreeSet::new();
        for rule in &policy.client_groups {
            let matched = match &rule.key {
                ClientKey::Ip(ip) => *ip == client,
                ClientKey::Net(net) => net.contains(&client),
                ClientKey::Name(name) => names.iter().any(|n| n.eq_ignore_ascii_case(name)),
            };
            if matched {
                groups.extend(rule.groups.iter().cloned());
            }
        }
        if groups.is_empty() {
            return vec![crate::policy::DEFAULT_GROUP.to_string()];
        }
        groups.into_iter().collect()
    }
}

fn pick_name<'a>(names: &'a [String], order: &[usize]) -> Option<&'a str> {
    for &pos in order {
        if let Some(name) = names.get(pos.saturating_sub(1)) {
            return Some(name);
        }
    }
    names.first().map(String::as_str)
}

/// `1.2.3.4` -> `4.3.2.1.in-addr.arpa.`; IPv6 gets the nibble form.
fn reverse_name(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.{}.{}.in-addr.arpa.", o[3], o[2], o[1], o[0])
        }
        IpAddr::V6(v6) => {
            let mut out = String::with_capacity(64 + 9);
            for byte in v6.octets().iter().rev() {
                out.push(char::from_digit((byte & 0x0F) as u32, 16).unwrap_or('0'));
                out.push('.');
                out.push(char::from_digit((byte >> 4) as u32, 16).unwrap_or('0'));
                out.push('.');
            }
            out.push_str("ip6.arpa.");
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RawConfig;
    use bytes::Bytes;
    use futures::future::BoxFuture;
    use hickory_proto::rr::rdata::PTR;
    use hickory_proto::rr::Record;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn policy_arc(value: serde_json::Value) -> Arc<ArcSwap<Policy>> {
        let raw: RawConfig = serde_json::from_value(value).expect("decode");
        Arc::new(ArcSwap::from_pointee(
            Policy::from_config(&raw).expect("valid policy"),
        ))
    }

    /// Answers every PTR query with a fixed set of names.
    struct PtrServer {
        names: Vec<&'static str>,
        calls: AtomicUsize,
    }

    impl Exchanger for PtrServer {
        fn exchange<'a>(
            &'a self,
            _upstream: &'a Upstream,
            packet: &'a [u8],
            _limit: Duration,
        ) -> BoxFuture<'a, Result<Bytes, UpstreamQueryError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let request = Message::from_bytes(packet).expect("ptr request");
            let question = request.queries()[0].clone();
            let mut response = Message::new();
            response.set_id(request.id());
            response.set_message_type(MessageType::Response);
            response.set_op_code(OpCode::Query);
            response.add_query(question.clone());
            for name in &self.names {
                response.add_answer(Record::from_rdata(
                    question.name().clone(),
                    600,
                    RData::PTR(PTR(Name::from_str(name).unwrap())),
                ));
            }
            let bytes = Bytes::from(response.to_bytes().unwrap());
            Box::pin(async move { Ok(bytes) })
        }
    }

    #[test]
    fn reverse_names_for_both_families() {
        assert_eq!(
            reverse_name("192.168.178.39".parse().unwrap()),
            "39.178.168.192.in-addr.arpa."
        );
        let v6 = reverse_name("2001:db8::1".parse().unwrap());
        assert!(v6.ends_with("ip6.arpa."));
        assert!(v6.starts_with("1.0.0.0."));
        assert_eq!(v6.matches('.').count(), 34);
    }

    #[test]
    fn name_order_prefers_configured_position_with_fallback() {
        let names = vec!["first.box".to_string(), "second.box".to_string()];
        assert_eq!(pick_name(&names, &[2, 1]), Some("second.box"));
        assert_eq!(pick_name(&names, &[5, 1]), Some("first.box"));
        assert_eq!(pick_name(&names, &[]), Some("first.box"));

        let single = vec!["only.box".to_string()];
        assert_eq!(pick_name(&single, &[2, 1]), Some("only.box"));
        assert_eq!(pick_name(&[], &[2, 1]), None);
    }

    #[tokio::test]
    async fn groups_union_ip_cidr_and_name_rules() {
        let policy = policy_arc(json!({
            "client_lookup": { "upstream": "192.168.178.1" },
            "client_groups": {
                "192.168.178.39": ["kids"],
                "192.168.178.0/24": ["lan"],
                "laptop.fritz.box": ["adults"]
            }
        }));
        let lookup = ClientLookup::new(
            policy,
            Arc::new(PtrServer {
                names: vec!["laptop.fritz.box."],
                calls: AtomicUsize::new(0),
            }),
        );

        let groups = lookup
            .groups_for("192.168.178.39".parse().unwrap())
            .await;
        assert_eq!(groups, vec!["adults", "kids", "lan"]);

        let groups = lookup.groups_for("192.168.178.7".parse().unwrap()).await;
        assert_eq!(groups, vec!["adults", "lan"]);

        let groups = lookup.groups_for("10.1.1.1".parse().unwrap()).await;
        assert_eq!(groups, vec!["adults"]);
    }

    #[tokio::test]
    async fn unmatched_clients_land_in_the_default_group() {
        let policy = policy_arc(json!({
            "client_groups": { "192.168.178.39": ["kids"] }
        }));
        let lookup = ClientLookup::new(
            policy,
            Arc::new(PtrServer {
                names: vec![],
                calls: AtomicUsize::new(0),
            }),
        );

        let groups = lookup.groups_for("10.0.0.1".parse().unwrap()).await;
        assert_eq!(groups, vec!["default"]);
    }

    #[tokio::test]
    async fn reverse_lookups_are_cached_per_client() {
        let policy = policy_arc(json!({
            "client_lookup": { "upstream": "192.168.178.1" }
        }));
        let server = Arc::new(PtrServer {
            names: vec!["host.fritz.box."],
            calls: AtomicUsize::new(0),
        });
        let lookup = ClientLookup::new(policy, server.clone());

        let client: IpAddr = "192.168.178.5".parse().unwrap();
        let first = lookup.resolve(client).await;
        let second = lookup.resolve(client).await;
        assert_eq!(*first, vec!["host.fritz.box".to_string()]);
        assert_eq!(first, second);
        assert_eq!(server.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_lookup_upstream_means_no_names() {
        let policy = policy_arc(json!({}));
        let server = Arc::new(PtrServer {
            names: vec!["host.fritz.box."],
            calls: AtomicUsize::new(0),
        });
        let lookup = ClientLookup::new(policy, server.clone());

        let names = lookup.resolve("192.168.178.5".parse().unwrap()).await;
        assert!(names.is_empty());
        assert_eq!(server.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn canonical_name_uses_policy_order() {
        let policy = policy_arc(json!({
            "client_lookup": { "upstream": "192.168.178.1", "single_name_order": [2, 1] }
        }));
        let lookup = ClientLookup::new(
            policy,
            Arc::new(PtrServer {
                names: vec![],
                calls: AtomicUsize::new(0),
            }),
        );
        let names = vec!["one.box".to_string(), "two.box".to_string()];
        assert_eq!(lookup.canonical_name(&names), Some("two.box"));
    }
}
