use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use arc_swap::ArcSwap;
use futures::future::BoxFuture;
use hickory_proto::op::ResponseCode;
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use regex::Regex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::ListRefreshError;
use crate::policy::{DEFAULT_GROUP, ListSource, Policy, normalize_domain};

/// Fetches the raw text of one list source. The transport is a collaborator
/// behind this seam; tests feed lists from memory.
pub trait ListFetcher: Send + Sync {
    fn fetch<'a>(
        &'a self,
        source: &'a ListSource,
    ) -> BoxFuture<'a, Result<String, ListRefreshError>>;
}

/// File and http(s) sources.
pub struct DefaultListFetcher {
    http: reqwest::Client,
}

impl DefaultListFetcher {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .context("build list download client")?,
        })
    }
}

impl ListFetcher for DefaultListFetcher {
    fn fetch<'a>(
        &'a self,
        source: &'a ListSource,
    ) -> BoxFuture<'a, Result<String, ListRefreshError>> {
        Box::pin(async move {
            match source {
                ListSource::File(path) => tokio::fs::read_to_string(path).await.map_err(|e| {
                    ListRefreshError::Read {
                        path: path.clone(),
                        reason: e.to_string(),
                    }
                }),
                ListSource::Url(url) => {
                    let fetch_err = |reason: String| ListRefreshError::Fetch {
                        url: url.clone(),
                        reason,
                    };
                    let response = self
                        .http
                        .get(url)
                        .send()
                        .await
                        .map_err(|e| fetch_err(e.to_string()))?;
                    if !response.status().is_success() {
                        return Err(fetch_err(format!("http status {}", response.status())));
                    }
                    response.text().await.map_err(|e| fetch_err(e.to_string()))
                }
            }
        })
    }
}

/// Compiled form of one list: plain domains matched by exact name or ancestor
/// suffix, plus `/…/` regex entries matched against the whole name.
#[derive(Debug, Default)]
pub struct DomainSet {
    domains: HashSet<String>,
    patterns: Vec<Regex>,
}

impl DomainSet {
    fn insert_line(&mut self, raw: &str, list: &str) -> Result<(), ListRefreshError> {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            return Ok(());
        }
        if line.len() > 2 && line.starts_with('/') && line.ends_with('/') {
            let pattern = &line[1..line.len() - 1];
            let regex = Regex::new(pattern).map_err(|e| ListRefreshError::Pattern {
                list: list.to_string(),
                entry: line.to_string(),
                reason: e.to_string(),
            })?;
            self.patterns.push(regex);
            return Ok(());
        }
        // Hosts-file lines put an address first; the domain is the last field.
        let token = line.split_whitespace().last().unwrap_or(line);
        self.domains.insert(normalize_domain(token));
        Ok(())
    }

    /// `example.com` matches itself and any of its subdomains.
    pub fn matches(&self, domain: &str) -> bool {
        let mut current = domain;
        loop {
            if self.domains.contains(current) {
                return true;
            }
            match current.find('.') {
                Some(idx) => current = &current[idx + 1..],
                None => break,
            }
        }
        self.patterns.iter().any(|p| p.is_match(domain))
    }

    pub fn len(&self) -> usize {
        self.domains.len() + self.patterns.len()
    }
}

#[derive(Debug, Default)]
pub struct BlockSnapshot {
    deny: HashMap<String, DomainSet>,
    allow: HashMap<String, DomainSet>,
}

/// Blacklist/whitelist engine. Readers always see one complete compiled
/// snapshot; the refresher builds a new one off to the side and swaps it in,
/// and a failed rebuild leaves the previous snapshot authoritative.
pub struct Blocker {
    policy: Arc<ArcSwap<Policy>>,
    snapshot: ArcSwap<BlockSnapshot>,
    fetcher: Arc<dyn ListFetcher>,
}

impl Blocker {
    pub fn new(policy: Arc<ArcSwap<Policy>>, fetcher: Arc<dyn ListFetcher>) -> Self {
        Self {
            policy,
            snapshot: ArcSwap::from_pointee(BlockSnapshot::default()),
            fetcher,
        }
    }

    /// Startup load; a failure leaves the engine empty rather than refusing
    /// to start.
    pub async fn load(&self) {
        if let Err(err) = self.refresh().await {
            warn!(error = %err, "initial list load failed, starting with empty lists");
        }
    }

    /// Rebuild every configured list and swap the compiled snapshot. Never
    /// publishes a partial rebuild.
    pub async fn refresh(&self) -> Result<(), ListRefreshError> {
        let policy = self.policy.load_full();
        let mut next = BlockSnapshot::default();
        for (name, sources) in &policy.blocking.black_lists {
            next.deny.insert(name.clone(), self.compile(name, sources).await?);
        }
        for (name, sources) in &policy.blocking.white_lists {
            next.allow.insert(name.clone(), self.compile(name, sources).await?);
        }
        let denied: usize = next.deny.values().map(DomainSet::len).sum();
        let allowed: usize = next.allow.values().map(DomainSet::len).sum();
        self.snapshot.store(Arc::new(next));
        info!(denied, allowed, "block lists compiled");
        Ok(())
    }

    async fn compile(
        &self,
        list: &str,
        sources: &[ListSource],
    ) -> Result<DomainSet, ListRefreshError> {
        let mut set = DomainSet::default();
        for source in sources {
            let text = self.fetcher.fetch(source).await?;
            for line in text.lines() {
                set.insert_line(line, list)?;
            }
        }
        Ok(set)
    }

    /// Periodic recompile; a zero period disables it (load once at startup).
    pub fn spawn_refresher(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let period = self.policy.load().blocking.refresh_period;
        if period.is_zero() {
            return None;
        }
        let blocker = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // the startup load already ran
            loop {
                ticker.tick().await;
                if let Err(err) = blocker.refresh().await {
                    warn!(error = %err, "list refresh failed, keeping previous snapshot");
                }
            }
        }))
    }

    /// Union of the blacklists assigned to the client's groups, minus any
    /// whitelist hit from the same groups. A group without an assignment
    /// borrows the implicit default group's lists.
    pub fn is_blocked(&self, domain: &str, client_groups: &[String]) -> bool {
        let policy = self.policy.load();
        let snapshot = self.snapshot.load();
        let assignments = &policy.blocking.client_groups_block;

        let mut lists: Vec<&String> = Vec::new();
        for group in client_groups {
            match assignments.get(group) {
                Some(names) => lists.extend(names),
                None => {
                    if let Some(names) = assignments.get(DEFAULT_GROUP) {
                        lists.extend(names);
                    }
                }
            }
        }

        let denied = lists
            .iter()
            .any(|name| snapshot.deny.get(*name).is_some_and(|s| s.matches(domain)));
        if !denied {
            return false;
        }
        let allowed = lists
            .iter()
            .any(|name| snapshot.allow.get(*name).is_some_and(|s| s.matches(domain)));
        !allowed
    }

    /// Fabricated answer for a blocked name: the zero address for A/AAAA,
    /// an empty NoError otherwise, all carrying the configured block TTL.
    pub fn synthesize(&self, qname: &str, qtype: RecordType) -> (ResponseCode, Vec<Record>) {
        let ttl = self.policy.load().blocking.block_ttl.as_secs() as u32;
        let Ok(name) = Name::from_str(qname) else {
            return (ResponseCode::NoError, Vec::new());
        };
        let answers = match qtype {
            RecordType::A => vec![Record::from_rdata(
                name,
                ttl,
                RData::A(A(Ipv4Addr::UNSPECIFIED)),
            )],
            RecordType::AAAA => vec![Record::from_rdata(
                name,
                ttl,
                RData::AAAA(AAAA(Ipv6Addr::UNSPECIFIED)),
            )],
            _ => Vec::new(),
        };
        (ResponseCode::NoError, answers)
    }
}

/// In-memory fetcher keyed by source label; failures are scripted by
/// poisoning a label. Shared by the engine and pipeline tests.
#[cfg(test)]
pub(crate) struct MemoryLists {
    texts: std::sync::Mutex<HashMap<String, Result<String, String>>>,
}

#[cfg(test)]
impl MemoryLists {
    pub(crate) fn new(entries: &[(&str, &str)]) -> Self {
        Self {
            texts: std::sync::Mutex::new(
                entries
                    .iter()
                    .map(|(k, v)| (k.to_string(), Ok(v.to_string())))
                    .collect(),
            ),
        }
    }

    pub(crate) fn poison(&self, label: &str) {
        self.texts
            .lock()
            .unwrap()
            .insert(label.to_string(), Err("source unreachable".to_string()));
    }
}

#[cfg(test)]
impl ListFetcher for MemoryLists {
    fn fetch<'a>(
        &'a self,
        source: &'a ListSource,
    ) -> BoxFuture<'a, Result<String, ListRefreshError>> {
        let outcome = self
            .texts
            .lock()
            .unwrap()
            .get(&source.label())
            .cloned()
            .unwrap_or_else(|| Err("unknown source".to_string()));
        Box::pin(async move {
            outcome.map_err(|reason| ListRefreshError::Fetch {
                url: source.label(),
                reason,
            })
        })
    }
}
