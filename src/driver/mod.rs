// src/driver/mod.rs
//! The driver abstraction: a uniform query contract spanning live TLS
//! handshakes, SMTP STARTTLS, and Certificate Transparency sources.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::*;

use crate::config::CrawlConfig;
use crate::fingerprint::Fingerprint;
use crate::status::StatusMap;

pub mod censys;
pub mod crtsh;
pub mod google;
pub mod https;
pub mod multi;
pub mod save;
pub mod smtp;
mod tls;

/// Names accepted by the driver factory.
pub const DRIVERS: &[&str] = &["http", "smtp", "crtsh", "google", "censys"];

/// A certificate discovery source.
#[async_trait]
pub trait Driver: Send + Sync + std::fmt::Debug {
    /// Short name identifying the driver in output and `found_by` sets.
    fn name(&self) -> &str;

    /// Query all certificates the source knows for a domain.
    ///
    /// Errors are non-fatal to the crawl; the engine logs and moves on.
    async fn query_domain(&self, domain: &str) -> Result<Box<dyn QueryResult>>;
}

/// The outcome of a single [`Driver::query_domain`] call.
#[async_trait]
pub trait QueryResult: Send + Sync + std::fmt::Debug {
    /// Connection status for every host the query touched, including
    /// redirect chains.
    fn status(&self) -> StatusMap;

    /// Domains surfaced alongside the result without being SAN edges
    /// (redirect targets, MX hosts). Empty for CT sources.
    fn related(&self) -> Vec<String>;

    /// Fingerprints keyed by domain. Authoritative for the queried domain;
    /// other keys are best-effort.
    fn fingerprints(&self) -> FingerprintMap;

    /// Driver names that asserted the edge between `domain` and `fp`; a
    /// composite result reports every contributing child.
    fn sources(&self, domain: &str, fp: &Fingerprint) -> Vec<String>;

    /// Resolve a previously returned fingerprint into its SAN list.
    async fn query_cert(&self, fp: &Fingerprint) -> Result<CertResult>;
}

/// Mapping of domain to the certificate fingerprints found for it.
/// Duplicate fingerprints for the same domain are dropped on insert.
#[derive(Debug, Clone, Default)]
pub struct FingerprintMap(HashMap<String, Vec<Fingerprint>>);

impl FingerprintMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, domain: impl Into<String>, fp: Fingerprint) {
        let fps = self.0.entry(domain.into()).or_default();
        if !fps.contains(&fp) {
            fps.push(fp);
        }
    }

    /// Fingerprints recorded for one domain.
    pub fn for_domain(&self, domain: &str) -> Vec<Fingerprint> {
        self.0.get(domain).cloned().unwrap_or_default()
    }

    pub fn contains(&self, domain: &str, fp: &Fingerprint) -> bool {
        self.0.get(domain).is_some_and(|fps| fps.contains(fp))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<Fingerprint>)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Fingerprint and normalized SAN list of a resolved certificate.
#[derive(Debug, Clone)]
pub struct CertResult {
    pub fingerprint: Fingerprint,
    pub domains: Vec<String>,
}

impl CertResult {
    /// Build from a fingerprint and a raw name list: lowercase, drop empty
    /// entries, deduplicate, sort.
    pub fn new(fingerprint: Fingerprint, names: impl IntoIterator<Item = String>) -> Self {
        let mut domains: Vec<String> = names
            .into_iter()
            .map(|n| n.trim().to_lowercase())
            .filter(|n| !n.is_empty())
            .collect();
        domains.sort_unstable();
        domains.dedup();
        CertResult {
            fingerprint,
            domains,
        }
    }

    /// Parse a DER-encoded certificate: fingerprint over the raw bytes, SAN
    /// set from the Common Name plus every DNS SAN.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let fingerprint = Fingerprint::from_raw_cert_bytes(der);
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| anyhow::anyhow!("failed to parse X.509 certificate: {e:?}"))?;

        let mut names = Vec::new();
        if let Some(cn) = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|attr| attr.as_str().ok())
        {
            names.push(cn.to_string());
        }
        for ext in cert.extensions() {
            if let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
                for general_name in &san.general_names {
                    if let GeneralName::DNSName(dns_name) = general_name {
                        names.push(dns_name.to_string());
                    }
                }
            }
        }

        Ok(CertResult::new(fingerprint, names))
    }
}

/// Build the driver named by the configuration; a comma list produces a
/// fan-out composite. Unknown names and missing credentials are fatal
/// configuration errors.
pub fn from_name(name: &str, config: &CrawlConfig) -> Result<Arc<dyn Driver>> {
    if name.contains(',') {
        let mut drivers = Vec::new();
        for single in name.split(',') {
            drivers.push(single_driver(single.trim(), config)?);
        }
        return Ok(Arc::new(multi::MultiDriver::new(drivers)));
    }
    single_driver(name, config)
}

fn single_driver(name: &str, config: &CrawlConfig) -> Result<Arc<dyn Driver>> {
    let driver: Arc<dyn Driver> = match name {
        "http" => Arc::new(https::HttpsDriver::new(
            config.timeout,
            config.save_path.clone(),
        )?),
        "smtp" => Arc::new(smtp::SmtpDriver::new(
            config.timeout,
            config.save_path.clone(),
        )?),
        "crtsh" => Arc::new(crtsh::CrtshDriver::new(
            config.timeout,
            config.save_path.clone(),
            config.ct_subdomains,
            config.ct_expired,
        )?),
        "google" => Arc::new(google::GoogleCtDriver::new(
            config.timeout,
            config.save_path.clone(),
            config.ct_subdomains,
            config.ct_expired,
        )?),
        "censys" => {
            let (Some(app_id), Some(secret)) =
                (config.censys_app_id.clone(), config.censys_secret.clone())
            else {
                bail!("censys driver requires --censys-appid and --censys-secret");
            };
            Arc::new(censys::CensysDriver::new(
                app_id,
                secret,
                config.timeout,
                config.save_path.clone(),
                config.ct_subdomains,
                config.ct_expired,
            )?)
        }
        _ => bail!(
            "unknown driver name: {name} (expected one of {})",
            DRIVERS.join(", ")
        ),
    };
    Ok(driver)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_map_dedups_on_insert() {
        let mut m = FingerprintMap::new();
        let fp = Fingerprint::from_raw_cert_bytes(b"cert");
        m.add("example.com", fp);
        m.add("example.com", fp);
        assert_eq!(m.for_domain("example.com"), vec![fp]);
    }

    #[test]
    fn test_fingerprint_map_keys_are_independent() {
        let mut m = FingerprintMap::new();
        let fp = Fingerprint::from_raw_cert_bytes(b"cert");
        m.add("a.com", fp);
        assert!(m.contains("a.com", &fp));
        assert!(!m.contains("b.com", &fp));
        assert!(m.for_domain("b.com").is_empty());
    }

    #[test]
    fn test_cert_result_normalizes_names() {
        let fp = Fingerprint::from_raw_cert_bytes(b"cert");
        let result = CertResult::new(
            fp,
            vec![
                "WWW.Example.COM".to_string(),
                "example.com".to_string(),
                "www.example.com".to_string(),
                "".to_string(),
                "*.Example.net".to_string(),
            ],
        );
        assert_eq!(
            result.domains,
            vec!["*.example.net", "example.com", "www.example.com"]
        );
    }

    #[test]
    fn test_cert_result_from_garbage_der_fails() {
        assert!(CertResult::from_der(b"definitely not DER").is_err());
    }

    #[test]
    fn test_unknown_driver_name_is_fatal() {
        let config = CrawlConfig::default();
        let err = from_name("carrier-pigeon", &config).unwrap_err();
        assert!(err.to_string().contains("unknown driver name"));
    }

    #[test]
    fn test_censys_requires_credentials() {
        let config = CrawlConfig::default();
        assert!(from_name("censys", &config).is_err());
    }

    #[test]
    fn test_multi_name_from_comma_list() {
        let config = CrawlConfig::default();
        let driver = from_name("http,smtp", &config).unwrap();
        assert_eq!(driver.name(), "multi[http,smtp]");
    }
}
