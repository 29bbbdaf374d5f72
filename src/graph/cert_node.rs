// src/graph/cert_node.rs
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::Mutex;

use crate::dns;
use crate::fingerprint::Fingerprint;

/// SAN suffixes that mark a certificate as belonging to a CDN.
const CDN_SUFFIXES: &[&str] = &[".cloudflaressl.com", "fastly.net", ".akamai.net"];

/// A certificate in the graph: its fingerprint, the names it asserts, and the
/// drivers that discovered it.
///
/// The fingerprint and SAN list never change after construction; `found_by`
/// only grows.
pub struct CertNode {
    pub fingerprint: Fingerprint,
    /// Sorted, lowercased, deduplicated union of Common Name and DNS SANs.
    pub domains: Vec<String>,
    found_by: Mutex<BTreeSet<String>>,
}

impl CertNode {
    /// Build a node from a fingerprint and an already-normalized SAN list
    /// (see `CertResult`, which performs the normalization).
    pub fn new(fingerprint: Fingerprint, domains: Vec<String>) -> Self {
        CertNode {
            fingerprint,
            domains,
            found_by: Mutex::new(BTreeSet::new()),
        }
    }

    /// Record a driver as a source of this certificate. Idempotent.
    pub fn add_found(&self, driver: &str) {
        self.found_by.lock().unwrap().insert(driver.to_string());
    }

    /// Drivers that found this certificate, sorted.
    pub fn found(&self) -> Vec<String> {
        self.found_by.lock().unwrap().iter().cloned().collect()
    }

    /// True if any SAN carries a known CDN suffix.
    pub fn cdn_cert(&self) -> bool {
        self.domains
            .iter()
            .any(|d| CDN_SUFFIXES.iter().any(|suffix| d.ends_with(suffix)))
    }

    /// Number of distinct apex domains among the SANs. Names without a
    /// registrable apex are skipped.
    pub fn apex_count(&self) -> usize {
        let mut apexes = HashSet::new();
        for domain in &self.domains {
            if let Ok(apex) = dns::apex_domain(domain) {
                apexes.insert(apex);
            }
        }
        apexes.len()
    }

    /// Flat string map for JSON serialization.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut m = BTreeMap::new();
        m.insert("type".to_string(), "certificate".to_string());
        m.insert("id".to_string(), self.fingerprint.hex_string());
        m.insert("found".to_string(), self.found().join(" "));
        m
    }
}

impl fmt::Display for CertNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t{}\t{:?}",
            self.fingerprint.hex_string(),
            self.found().join(" "),
            self.domains
        )
    }
}
