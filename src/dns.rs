// src/dns.rs
//! DNS collaborators: the record-existence check used by `--dns`, MX lookups
//! for the SMTP driver, and apex (public-suffix+1) extraction.

use anyhow::{anyhow, Context, Result};
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::proto::rr::{RData, RecordType};
use hickory_resolver::TokioAsyncResolver;
use psl::Psl;
use psl_types::Type;
use publicsuffix::List;
use std::collections::HashMap;
use std::sync::{LazyLock, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::info;

const PUBLIC_SUFFIX_LIST_URL: &str = "https://publicsuffix.org/list/public_suffix_list.dat";

/// TTL for cached existence lookups.
const DNS_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

static RESOLVER: LazyLock<TokioAsyncResolver> = LazyLock::new(|| {
    TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
});

static DNS_CACHE: LazyLock<TtlCache> = LazyLock::new(|| TtlCache::new(DNS_CACHE_TTL));

/// Public suffix list downloaded with `--updatepsl`; when absent the list
/// compiled into the `psl` crate is used.
static UPDATED_LIST: RwLock<Option<List>> = RwLock::new(None);

/// Thread-safe TTL cache for existence lookups, keyed by apex domain.
struct TtlCache {
    entries: Mutex<HashMap<String, (bool, Instant)>>,
    ttl: Duration,
}

impl TtlCache {
    fn new(ttl: Duration) -> Self {
        TtlCache {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn get(&self, key: &str) -> Option<bool> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some((value, expires_at)) if Instant::now() < *expires_at => Some(*value),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn set(&self, key: &str, value: bool) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(key.to_string(), (value, Instant::now() + self.ttl));
    }
}

fn no_records(err: &ResolveError) -> bool {
    matches!(err.kind(), ResolveErrorKind::NoRecordsFound { .. })
}

/// Check whether any DNS records exist for the domain.
///
/// Queries NS, CNAME, then A/AAAA and returns true on the first non-empty
/// answer. A clean "no such records" answer is not an error.
pub async fn has_records(domain: &str, timeout: Duration) -> Result<bool> {
    for record_type in [RecordType::NS, RecordType::CNAME] {
        let lookup = tokio::time::timeout(timeout, RESOLVER.lookup(domain, record_type))
            .await
            .map_err(|_| anyhow!("{record_type} lookup for {domain} timed out"))?;
        match lookup {
            Ok(answer) => {
                if answer.iter().next().is_some() {
                    return Ok(true);
                }
            }
            Err(e) if no_records(&e) => {}
            Err(e) => {
                return Err(e).with_context(|| format!("{record_type} lookup for {domain}"))
            }
        }
    }

    let lookup = tokio::time::timeout(timeout, RESOLVER.lookup_ip(domain))
        .await
        .map_err(|_| anyhow!("address lookup for {domain} timed out"))?;
    match lookup {
        Ok(answer) => Ok(answer.iter().next().is_some()),
        Err(e) if no_records(&e) => Ok(false),
        Err(e) => Err(e).with_context(|| format!("address lookup for {domain}")),
    }
}

/// Cached variant of [`has_records`], keyed by the domain's apex.
pub async fn has_records_cache(domain: &str, timeout: Duration) -> Result<bool> {
    let apex = apex_domain(domain)?;
    if let Some(cached) = DNS_CACHE.get(&apex) {
        return Ok(cached);
    }
    let result = has_records(&apex, timeout).await;
    if let Ok(value) = result {
        DNS_CACHE.set(&apex, value);
    }
    result
}

/// Look up MX hosts for a domain, sorted by preference, trailing dots removed.
///
/// A domain without MX records yields an empty list, not an error.
pub async fn lookup_mx(domain: &str, timeout: Duration) -> Result<Vec<String>> {
    let lookup = tokio::time::timeout(timeout, RESOLVER.lookup(domain, RecordType::MX))
        .await
        .map_err(|_| anyhow!("MX lookup for {domain} timed out"))?;
    let answer = match lookup {
        Ok(answer) => answer,
        Err(e) if no_records(&e) => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("MX lookup for {domain}")),
    };

    let mut records: Vec<(u16, String)> = answer
        .iter()
        .filter_map(|rdata| {
            if let RData::MX(mx) = rdata {
                Some((mx.preference(), mx.exchange().to_utf8()))
            } else {
                None
            }
        })
        .collect();
    records.sort_by_key(|(preference, _)| *preference);

    Ok(records
        .into_iter()
        .map(|(_, host)| host.trim_end_matches('.').to_string())
        .filter(|host| !host.is_empty())
        .collect())
}

/// Download a fresh public suffix list and use it for all later apex lookups.
pub async fn update_public_suffix_list(timeout: Duration) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("failed to build HTTP client")?;
    let body = client
        .get(PUBLIC_SUFFIX_LIST_URL)
        .send()
        .await
        .context("failed to fetch public suffix list")?
        .error_for_status()
        .context("public suffix list request failed")?
        .text()
        .await
        .context("failed to read public suffix list body")?;

    let list: List = body
        .parse()
        .map_err(|e| anyhow!("failed to parse public suffix list: {e}"))?;
    *UPDATED_LIST.write().unwrap() = Some(list);
    info!("public suffix list updated from {}", PUBLIC_SUFFIX_LIST_URL);
    Ok(())
}

/// Return the apex (public-suffix+1) of a domain, private suffixes excluded.
pub fn apex_domain(domain: &str) -> Result<String> {
    let name = domain.trim().trim_end_matches('.').to_ascii_lowercase();
    let name = name.strip_prefix("*.").unwrap_or(&name);

    let updated = UPDATED_LIST.read().unwrap();
    let apex = match updated.as_ref() {
        Some(list) => registrable_apex(list, name),
        None => registrable_apex(&psl::List, name),
    };
    apex.ok_or_else(|| anyhow!("no registrable apex domain for {domain:?}"))
}

/// Longest-suffix apex extraction that skips rules from the private section
/// of the list (a private rule like `github.io` is not treated as a suffix;
/// its ICANN parent is).
fn registrable_apex<L: Psl>(list: &L, name: &str) -> Option<String> {
    let labels: Vec<&str> = name.split('.').collect();
    if labels.len() < 2 || labels.iter().any(|l| l.is_empty()) {
        return None;
    }
    for start in 1..labels.len() {
        let candidate = labels[start..].join(".");
        let Some(suffix) = list.suffix(candidate.as_bytes()) else {
            continue;
        };
        if suffix.as_bytes() == candidate.as_bytes() && suffix.typ() != Some(Type::Private) {
            return Some(labels[start - 1..].join("."));
        }
    }
    None
}
