use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use arc_swap::ArcSwap;
use bytes::Bytes;
use dashmap::DashMap;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable, BinEncoder};
use rustc_hash::FxBuildHasher;
use std::str::FromStr;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::blocking::Blocker;
use crate::cache::{AnswerCache, CachedAnswer};
use crate::client_lookup::ClientLookup;
use crate::exchange::Exchanger;
use crate::policy::{DEFAULT_GROUP, Policy};
use crate::querier::ParallelQuerier;
use crate::wire::{self, QuestionKey};

const CACHE_CAPACITY: u64 = 10_000;

/// Same-key miss coalescing: waiters parked behind the one in-flight
/// resolution. `None` tells a waiter the leader failed upstream.
type Waiters = DashMap<u64, Vec<oneshot::Sender<Option<CachedAnswer>>>, FxBuildHasher>;

/// The resolution pipeline. Each query walks, in order: custom override,
/// conditional routing, block check, cache, raced upstream query, cache
/// store. Every stage after the first may short-circuit to an answer.
pub struct Resolver {
    policy: Arc<ArcSwap<Policy>>,
    cache: AnswerCache,
    blocker: Arc<Blocker>,
    clients: Arc<ClientLookup>,
    querier: ParallelQuerier,
    inflight: Arc<Waiters>,
}

impl Resolver {
    pub fn new(
        policy: Arc<ArcSwap<Policy>>,
        blocker: Arc<Blocker>,
        clients: Arc<ClientLookup>,
        exchanger: Arc<dyn Exchanger>,
    ) -> Self {
        let bounds = policy.load().caching;
        Self {
            policy,
            cache: AnswerCache::new(CACHE_CAPACITY, bounds),
            blocker,
            clients,
            querier: ParallelQuerier::new(exchanger),
            inflight: Arc::new(DashMap::with_hasher(FxBuildHasher::default())),
        }
    }

    /// Synchronous fast path for the receive loop: answers straight from the
    /// override table or the cache, without a full message decode or a task
    /// spawn. `None` means take the async path.
    pub fn try_fast_answer(&self, packet: &[u8]) -> Option<Bytes> {
        let question = wire::scan_question(packet)?;
        let policy = self.policy.load();

        if let Some(ips) = policy.custom_dns.get(&question.name) {
            let records = custom_records(
                &question.name,
                RecordType::from(question.qtype),
                ips,
                policy.custom_ttl,
            )?;
            return fast_response(&question, ResponseCode::NoError, records).ok();
        }

        let hit = self
            .cache
            .get(&question.name, question.qtype, question.qclass)?;
        let records = hit.records_with_remaining(Instant::now());
        fast_response(&question, hit.rcode, records).ok()
    }

    /// Full pipeline for one query.
    pub async fn handle_packet(&self, packet: &[u8], client: IpAddr) -> anyhow::Result<Bytes> {
        let request = Message::from_bytes(packet).context("parse request")?;
        let question = request
            .queries()
            .first()
            .context("empty question section")?
            .clone();
        let qname = crate::policy::normalize_domain(&question.name().to_ascii());
        let qtype = question.query_type();
        let qclass = question.query_class();
        let start = Instant::now();
        let policy = self.policy.load_full();

        // Custom override: literal IPs, nothing later runs.
        if let Some(ips) = policy.custom_dns.get(&qname) {
            let records =
                custom_records(&qname, qtype, ips, policy.custom_ttl).unwrap_or_default();
            let response = build_response(&request, ResponseCode::NoError, records)?;
            log_response(
                "custom_dns", &qname, qtype, ResponseCode::NoError, start, client, "custom", false,
            );
            return Ok(response);
        }

        // Conditional routing decides which group the upstream stage uses;
        // blocking and caching still apply.
        let (group_name, upstreams) = match policy.conditional_route(&qname) {
            Some(route) => (route.name.as_str(), route.upstreams.as_slice()),
            None => (DEFAULT_GROUP, policy.default_group()),
        };

        // Block check, against the groups this client resolves to.
        let client_groups = self.clients.groups_for(client).await;
        if self.blocker.is_blocked(&qname, &client_groups) {
            let (rcode, answers) = self.blocker.synthesize(&qname, qtype);
            let response = build_response(&request, rcode, answers)?;
            // The reverse-lookup names are already cached by groups_for.
            let names = self.clients.resolve(client).await;
            let client_name = self
                .clients
                .canonical_name(&names)
                .map(str::to_string)
                .unwrap_or_else(|| client.to_string());
            info!(
                event = "dns_response",
                reason = "blocked",
                qname = %qname,
                qtype = ?qtype,
                rcode = ?rcode,
                latency_ms = start.elapsed().as_millis() as u64,
                client_ip = %client,
                client_name = %client_name,
                groups = ?client_groups,
                "answered"
            );
            return Ok(response);
        }

        let qtype_num = u16::from(qtype);
        let qclass_num = u16::from(qclass);

        if let Some(hit) = self.cache.get(&qname, qtype_num, qclass_num) {
            let records = hit.records_with_remaining(Instant::now());
            let response = build_response(&request, hit.rcode, records)?;
            log_response("cached", &qname, qtype, hit.rcode, start, client, &hit.source, true);
            return Ok(response);
        }

        // Upstream stage, coalesced per cache key: one resolution in flight,
        // everyone else waits for its outcome.
        let key = AnswerCache::key(&qname, qtype_num, qclass_num);
        let mut guard = None;
        let waiter = {
            use dashmap::mapref::entry::Entry;
            match self.inflight.entry(key) {
                Entry::Occupied(mut entry) => {
                    let (tx, rx) = oneshot::channel();
                    entry.get_mut().push(tx);
                    Some(rx)
                }
                Entry::Vacant(entry) => {
                    entry.insert(Vec::new());
                    guard = Some(CoalesceGuard::new(Arc::clone(&self.inflight), key));
                    None
                }
            }
        };

        if let Some(rx) = waiter {
            match rx.await {
                Ok(Some(entry)) => {
                    let records = entry.records_with_remaining(Instant::now());
                    let response = build_response(&request, entry.rcode, records)?;
                    log_response(
                        "coalesced", &qname, qtype, entry.rcode, start, client, &entry.source, false,
                    );
                    return Ok(response);
                }
                Ok(None) => {
                    let response = build_response(&request, ResponseCode::ServFail, Vec::new())?;
                    log_response(
                        "coalesced", &qname, qtype, ResponseCode::ServFail, start, client, group_name,
                        false,
                    );
                    return Ok(response);
                }
                // Leader vanished without an outcome; query upstream ourselves.
                Err(_) => {
                    guard = Some(CoalesceGuard::new(Arc::clone(&self.inflight), key));
                }
            }
        }

        let raced = self
            .querier
            .query(group_name, upstreams, packet, policy.upstream_timeout)
            .await;

        match raced {
            Ok(answer) => {
                let original_ttl = min_answer_ttl(&answer.message);
                let entry = self.cache.put(
                    &qname,
                    qtype_num,
                    qclass_num,
                    answer.message.answers().to_vec(),
                    answer.message.response_code(),
                    &answer.upstream,
                    original_ttl,
                );
                if let Some(g) = guard.as_mut() {
                    g.settle(Some(entry.clone()));
                }
                let response =
                    build_response(&request, entry.rcode, answer.message.answers().to_vec())?;
                log_response(
                    "forwarded", &qname, qtype, entry.rcode, start, client, &answer.upstream, false,
                );
                Ok(response)
            }
            Err(failure) => {
                if let Some(g) = guard.as_mut() {
                    g.settle(None);
                }
                warn!(
                    event = "dns_response",
                    qname = %qname,
                    qtype = ?qtype,
                    client_ip = %client,
                    group = %failure.group,
                    error = %failure,
                    "all upstreams failed"
                );
                build_response(&request, ResponseCode::ServFail, Vec::new())
            }
        }
    }
}

/// Removes the in-flight marker and feeds whatever outcome the leader reached
/// to every parked waiter. Dropping unsettled (panic, cancellation) just
/// clears the marker; waiters then retry on their own.
struct CoalesceGuard {
    inflight: Arc<Waiters>,
    key: u64,
    outcome: Option<Option<CachedAnswer>>,
}

impl CoalesceGuard {
    fn new(inflight: Arc<Waiters>, key: u64) -> Self {
        Self {
            inflight,
            key,
            outcome: None,
        }
    }

    fn settle(&mut self, outcome: Option<CachedAnswer>) {
        self.outcome = Some(outcome);
    }
}

impl Drop for CoalesceGuard {
    fn drop(&mut self) {
        let waiters = self
            .inflight
            .remove(&self.key)
            .map(|(_, w)| w)
            .unwrap_or_default();
        if let Some(outcome) = self.outcome.take() {
            for tx in waiters {
                let _ = tx.send(outcome.clone());
            }
        }
    }
}

/// Records for a custom-DNS answer: the mapped addresses matching the query
/// type. Non-address query types get an empty answer.
fn custom_records(
    qname: &str,
    qtype: RecordType,
    ips: &[IpAddr],
    ttl: Duration,
) -> Option<Vec<Record>> {
    let name = Name::from_str(qname).ok()?;
    let ttl = ttl.as_secs() as u32;
    let records = ips
        .iter()
        .filter_map(|ip| match (qtype, ip) {
            (RecordType::A, IpAddr::V4(v4)) => {
                Some(Record::from_rdata(name.clone(), ttl, RData::A(A(*v4))))
            }
            (RecordType::AAAA, IpAddr::V6(v6)) => {
                Some(Record::from_rdata(name.clone(), ttl, RData::AAAA(AAAA(*v6))))
            }
            _ => None,
        })
        .collect();
    Some(records)
}

/// Smallest TTL in the answer section; zero (never cached) when there are no
/// answer records.
fn min_answer_ttl(message: &Message) -> Duration {
    message
        .answers()
        .iter()
        .map(|r| Duration::from_secs(u64::from(r.ttl())))
        .min()
        .unwrap_or(Duration::ZERO)
}

fn build_response(
    request: &Message,
    rcode: ResponseCode,
    answers: Vec<Record>,
) -> anyhow::Result<Bytes> {
    let mut response = Message::new();
    response.set_id(request.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(OpCode::Query);
    response.set_recursion_desired(request.recursion_desired());
    response.set_recursion_available(true);
    response.set_response_code(rcode);
    for query in request.queries() {
        response.add_query(query.clone());
    }
    for answer in answers {
        response.add_answer(answer);
    }
    encode(&response)
}

/// Response built from a scanned question alone, for the fast path.
fn fast_response(
    question: &QuestionKey,
    rcode: ResponseCode,
    answers: Vec<Record>,
) -> anyhow::Result<Bytes> {
    let mut response = Message::new();
    response.set_id(question.id);
    response.set_message_type(MessageType::Response);
    response.set_op_code(OpCode::Query);
    response.set_recursion_desired(true);
    response.set_recursion_available(true);
    response.set_response_code(rcode);
    let mut query = Query::new();
    query.set_name(Name::from_str(&question.name)?);
    query.set_query_type(RecordType::from(question.qtype));
    query.set_query_class(DNSClass::from(question.qclass));
    response.add_query(query);
    for answer in answers {
        response.add_answer(answer);
    }
    encode(&response)
}

fn encode(message: &Message) -> anyhow::Result<Bytes> {
    let mut out = Vec::with_capacity(512);
    {
        let mut encoder = BinEncoder::new(&mut out);
        message.emit(&mut encoder).context("encode response")?;
    }
    Ok(Bytes::from(out))
}

#[allow(clippy::too_many_arguments)]
fn log_response(
    reason: &str,
    qname: &str,
    qtype: RecordType,
    rcode: ResponseCode,
    start: Instant,
    client: IpAddr,
    upstream: &str,
    cache: bool,
) {
    info!(
        event = "dns_response",
        reason,
        qname = %qname,
        qtype = ?qtype,
        rcode = ?rcode,
        latency_ms = start.elapsed().as_millis() as u64,
        client_ip = %client,
        upstream = %upstream,
        cache,
        "answered"
    );
}
