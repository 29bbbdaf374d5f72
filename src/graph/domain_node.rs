// src/graph/domain_node.rs
use anyhow::Result;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use super::non_wildcard;
use crate::dns;
use crate::fingerprint::Fingerprint;
use crate::status::{Status, StatusMap};

/// A domain in the graph: its position in the BFS, the certificates seen for
/// it, and the related domains drivers surfaced alongside it.
///
/// A node is owned by the worker that visits it until it is handed to the
/// output stage; after that it is read-only.
#[derive(Debug, Default)]
pub struct DomainNode {
    /// Normalized name: lowercased, wildcard prefix stripped.
    pub domain: String,
    /// BFS depth at first admission (0 for seeds).
    pub depth: u32,
    /// True if this was a seed domain.
    pub root: bool,
    /// Result of the optional DNS existence check.
    pub has_dns: Option<bool>,
    /// Connection status of the domain itself.
    pub status: Status,
    /// Certificate fingerprints seen for this domain, with the drivers that
    /// asserted each edge (duplicates from the same driver allowed).
    pub certs: HashMap<Fingerprint, Vec<String>>,
    /// Domains surfaced next to this one (redirect targets, MX hosts) that
    /// are not themselves SAN edges.
    pub related: StatusMap,
}

impl DomainNode {
    pub fn new(domain: &str, depth: u32) -> Self {
        DomainNode {
            domain: non_wildcard(&domain.to_lowercase()).to_string(),
            depth,
            ..Default::default()
        }
    }

    /// Add related domains with `Unknown` status, skipping names already
    /// present. Case-insensitive.
    pub fn add_related_domains<S: AsRef<str>>(&mut self, domains: &[S]) {
        for domain in domains {
            let domain = domain.as_ref().to_lowercase();
            if self.related.contains(&domain) {
                continue;
            }
            self.related.set(domain, Status::default());
        }
    }

    /// Merge a status map into this node.
    ///
    /// An entry keyed by the node's own domain becomes the node status and is
    /// removed from the argument; everything else merges into `related`,
    /// overwriting existing entries.
    pub fn add_status_map(&mut self, statuses: &mut StatusMap) {
        if let Some(own) = statuses.remove(&self.domain) {
            self.status = own;
        }
        for (domain, status) in statuses.drain() {
            self.related.set(domain, status);
        }
    }

    /// Record that `driver` asserted the edge to certificate `fp`.
    pub fn add_cert_fingerprint(&mut self, fp: Fingerprint, driver: &str) {
        self.certs.entry(fp).or_default().push(driver.to_string());
    }

    /// Check for DNS records at the node's apex and remember the result.
    pub async fn check_for_dns(&mut self, timeout: Duration) -> Result<bool> {
        let result = dns::has_records_cache(&self.domain, timeout).await;
        self.has_dns = Some(*result.as_ref().unwrap_or(&false));
        result
    }

    /// Fingerprints of all certificates seen for this domain, unordered.
    pub fn get_certificates(&self) -> Vec<Fingerprint> {
        self.certs.keys().copied().collect()
    }

    /// Flat string map for JSON serialization.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut related: Vec<&str> = self.related.iter().map(|(d, _)| d.as_str()).collect();
        related.sort_unstable();

        let mut m = BTreeMap::new();
        m.insert("type".to_string(), "domain".to_string());
        m.insert("id".to_string(), self.domain.clone());
        m.insert("status".to_string(), self.status.to_string());
        m.insert("root".to_string(), self.root.to_string());
        m.insert("depth".to_string(), self.depth.to_string());
        m.insert("related".to_string(), related.join(" "));
        m.insert(
            "hasDNS".to_string(),
            self.has_dns.unwrap_or(false).to_string(),
        );
        m
    }
}

/// Tab-separated detail line: domain, depth, status, space-joined fingerprints.
impl fmt::Display for DomainNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let certs = self
            .certs
            .keys()
            .map(|fp| fp.hex_string())
            .collect::<Vec<_>>()
            .join(" ");
        write!(f, "{}\t{}\t{}\t{}", self.domain, self.depth, self.status, certs)
    }
}
