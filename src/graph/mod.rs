// src/graph/mod.rs
//! The bipartite certificate graph: domain nodes and certificate nodes,
//! linked by fingerprint and name strings rather than pointers.

use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use crate::fingerprint::Fingerprint;

pub mod cert_node;
pub mod domain_node;

pub use cert_node::CertNode;
pub use domain_node::DomainNode;

/// Strip a single leading wildcard label.
pub fn non_wildcard(domain: &str) -> &str {
    domain.strip_prefix("*.").unwrap_or(domain)
}

/// Concurrent store of domain and certificate nodes.
///
/// The domain map doubles as the crawl's visited set: a reserved key means
/// the domain has been admitted. Reservation is an atomic insert-if-absent;
/// the finished node is stored by its worker before neighbor expansion.
#[derive(Default)]
pub struct CertGraph {
    domains: RwLock<HashMap<String, Option<Arc<DomainNode>>>>,
    certs: RwLock<HashMap<Fingerprint, Arc<CertNode>>>,
    num_domains: AtomicUsize,
    max_depth: AtomicU32,
}

impl CertGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically reserve a domain slot for a candidate about to be visited.
    ///
    /// Returns false if the domain was already admitted. Updates the domain
    /// count and the maximum admitted depth.
    pub fn reserve_domain(&self, domain: &str, depth: u32) -> bool {
        let mut domains = self.domains.write().unwrap();
        if domains.contains_key(domain) {
            return false;
        }
        domains.insert(domain.to_string(), None);
        self.num_domains.fetch_add(1, Ordering::Relaxed);
        self.max_depth.fetch_max(depth, Ordering::Relaxed);
        true
    }

    /// Store a visited node, completing its reservation. Returns the shared
    /// handle the output stage reads from.
    pub fn add_domain(&self, node: DomainNode) -> Arc<DomainNode> {
        let node = Arc::new(node);
        self.domains
            .write()
            .unwrap()
            .insert(node.domain.clone(), Some(node.clone()));
        node
    }

    /// Store a certificate node, overwriting any previous entry (the
    /// fingerprint-to-certificate mapping is deterministic, so overwriting
    /// is safe).
    pub fn add_cert(&self, node: CertNode) -> Arc<CertNode> {
        let node = Arc::new(node);
        self.certs
            .write()
            .unwrap()
            .insert(node.fingerprint, node.clone());
        node
    }

    pub fn get_cert(&self, fp: &Fingerprint) -> Option<Arc<CertNode>> {
        self.certs.read().unwrap().get(fp).cloned()
    }

    /// Look up a visited domain node. Reserved-but-unvisited domains return
    /// `None`; use [`CertGraph::contains_domain`] for admission checks.
    pub fn get_domain(&self, domain: &str) -> Option<Arc<DomainNode>> {
        self.domains.read().unwrap().get(domain).cloned().flatten()
    }

    /// True if the domain has been admitted (reserved or visited).
    pub fn contains_domain(&self, domain: &str) -> bool {
        self.domains.read().unwrap().contains_key(domain)
    }

    /// Number of distinct domains ever admitted.
    pub fn num_domains(&self) -> usize {
        self.num_domains.load(Ordering::Relaxed)
    }

    /// Maximum admitted BFS depth.
    pub fn max_depth(&self) -> u32 {
        self.max_depth.load(Ordering::Relaxed)
    }

    /// Domains reachable from `domain` through its related entries and the
    /// SANs of its certificates.
    ///
    /// CDN certificates are skipped unless `include_cdn` is set; certificates
    /// spanning more than `max_sans_cap` distinct apex domains are skipped
    /// when the cap is nonzero. The source domain is never its own neighbor.
    pub fn get_domain_neighbors(
        &self,
        domain: &str,
        include_cdn: bool,
        max_sans_cap: usize,
    ) -> Vec<String> {
        let domain = non_wildcard(domain);
        let mut neighbors: HashSet<String> = HashSet::new();

        if let Some(node) = self.get_domain(domain) {
            for (related, _) in node.related.iter() {
                neighbors.insert(related.clone());
            }
            for fp in node.get_certificates() {
                let Some(cert) = self.get_cert(&fp) else {
                    continue;
                };
                if !include_cdn && cert.cdn_cert() {
                    continue;
                }
                if max_sans_cap > 0 && cert.apex_count() > max_sans_cap {
                    continue;
                }
                for san in &cert.domains {
                    neighbors.insert(san.clone());
                }
            }
        }

        neighbors.remove(domain);
        neighbors.into_iter().collect()
    }

    /// Nested map representation of the whole graph for JSON output:
    /// one node per domain and certificate, `domain -> certificate` links
    /// typed by the asserting drivers, and `certificate -> domain` "sans"
    /// links for SANs that are themselves domains in the graph.
    pub fn generate_map(&self) -> serde_json::Value {
        let mut nodes = Vec::new();
        let mut links = Vec::new();

        let domains = self.domains.read().unwrap();
        for node in domains.values().flatten() {
            nodes.push(json!(node.to_map()));
            for (fp, found) in &node.certs {
                links.push(json!({
                    "source": node.domain,
                    "target": fp.hex_string(),
                    "type": found.join(" "),
                }));
            }
        }

        let certs = self.certs.read().unwrap();
        for cert in certs.values() {
            nodes.push(json!(cert.to_map()));
            for san in &cert.domains {
                let san = non_wildcard(san);
                if domains.get(san).map_or(false, |slot| slot.is_some()) {
                    links.push(json!({
                        "source": cert.fingerprint.hex_string(),
                        "target": san,
                        "type": "sans",
                    }));
                }
            }
        }

        json!({
            "nodes": nodes,
            "links": links,
            "depth": self.max_depth(),
            "numDomains": self.num_domains(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cert(raw: &[u8], domains: &[&str]) -> CertNode {
        CertNode::new(
            Fingerprint::from_raw_cert_bytes(raw),
            domains.iter().map(|d| d.to_string()).collect(),
        )
    }

    fn visited(graph: &CertGraph, domain: &str, depth: u32) -> DomainNode {
        assert!(graph.reserve_domain(domain, depth));
        DomainNode::new(domain, depth)
    }

    #[test]
    fn test_reserve_is_one_shot() {
        let graph = CertGraph::new();
        assert!(graph.reserve_domain("example.com", 0));
        assert!(!graph.reserve_domain("example.com", 1));
        assert_eq!(graph.num_domains(), 1);
    }

    #[test]
    fn test_num_domains_counts_admissions() {
        let graph = CertGraph::new();
        graph.reserve_domain("a.com", 0);
        graph.reserve_domain("b.com", 1);
        graph.reserve_domain("a.com", 2);
        assert_eq!(graph.num_domains(), 2);
    }

    #[test]
    fn test_max_depth_is_monotonic() {
        let graph = CertGraph::new();
        graph.reserve_domain("a.com", 3);
        graph.reserve_domain("b.com", 1);
        assert_eq!(graph.max_depth(), 3);
    }

    #[test]
    fn test_get_domain_only_after_add() {
        let graph = CertGraph::new();
        graph.reserve_domain("example.com", 0);
        assert!(graph.contains_domain("example.com"));
        assert!(graph.get_domain("example.com").is_none());

        graph.add_domain(DomainNode::new("example.com", 0));
        assert!(graph.get_domain("example.com").is_some());
    }

    #[test]
    fn test_neighbors_from_cert_sans() {
        let graph = CertGraph::new();
        let c = graph.add_cert(cert(b"c1", &["example.com", "www.example.com", "example.org"]));

        let mut node = visited(&graph, "example.com", 0);
        node.add_cert_fingerprint(c.fingerprint, "http");
        graph.add_domain(node);

        let mut neighbors = graph.get_domain_neighbors("example.com", false, 0);
        neighbors.sort();
        assert_eq!(neighbors, vec!["example.org", "www.example.com"]);
    }

    #[test]
    fn test_neighbors_exclude_cdn_cert() {
        let graph = CertGraph::new();
        let c = graph.add_cert(cert(b"c1", &["a.example.com", "x.cloudflaressl.com"]));

        let mut node = visited(&graph, "example.com", 0);
        node.add_cert_fingerprint(c.fingerprint, "http");
        graph.add_domain(node);

        assert!(graph.get_domain_neighbors("example.com", false, 0).is_empty());

        let mut with_cdn = graph.get_domain_neighbors("example.com", true, 0);
        with_cdn.sort();
        assert_eq!(with_cdn, vec!["a.example.com", "x.cloudflaressl.com"]);
    }

    #[test]
    fn test_neighbors_respect_sans_cap() {
        let graph = CertGraph::new();
        // three distinct apexes
        let c = graph.add_cert(cert(b"c1", &["a.com", "b.com", "c.com"]));

        let mut node = visited(&graph, "a.com", 0);
        node.add_cert_fingerprint(c.fingerprint, "crtsh");
        graph.add_domain(node);

        assert!(graph.get_domain_neighbors("a.com", false, 2).is_empty());
        assert_eq!(graph.get_domain_neighbors("a.com", false, 3).len(), 2);
        // zero means unlimited
        assert_eq!(graph.get_domain_neighbors("a.com", false, 0).len(), 2);
    }

    #[test]
    fn test_neighbors_include_related() {
        let graph = CertGraph::new();
        let mut node = visited(&graph, "example.com", 0);
        node.add_related_domains(&["mail.example.net"]);
        graph.add_domain(node);

        assert_eq!(
            graph.get_domain_neighbors("example.com", false, 0),
            vec!["mail.example.net"]
        );
    }

    #[test]
    fn test_neighbors_of_unknown_domain_empty() {
        let graph = CertGraph::new();
        assert!(graph.get_domain_neighbors("nowhere.com", true, 0).is_empty());
    }

    #[test]
    fn test_generate_map_links() {
        let graph = CertGraph::new();
        let c = graph.add_cert(cert(b"c1", &["example.com", "www.example.com"]));
        c.add_found("http");

        let mut node = visited(&graph, "example.com", 0);
        node.root = true;
        node.add_cert_fingerprint(c.fingerprint, "http");
        graph.add_domain(node);

        let map = graph.generate_map();
        assert_eq!(map["numDomains"], 1);
        assert_eq!(map["depth"], 0);

        let nodes = map["nodes"].as_array().unwrap();
        assert_eq!(nodes.len(), 2);

        // one domain->cert link typed by driver, one cert->domain sans link
        // (www.example.com is not in the graph and produces no link)
        let links = map["links"].as_array().unwrap();
        assert_eq!(links.len(), 2);
        let types: Vec<&str> = links.iter().map(|l| l["type"].as_str().unwrap()).collect();
        assert!(types.contains(&"http"));
        assert!(types.contains(&"sans"));
    }
}
