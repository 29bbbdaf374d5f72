// src/driver/multi.rs
//! Fan-out composite that merges several drivers under the single-driver
//! contract.

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::future::try_join_all;
use std::collections::HashSet;
use std::sync::Arc;

use super::{CertResult, Driver, FingerprintMap, QueryResult};
use crate::fingerprint::Fingerprint;
use crate::status::{DomainStatus, Status, StatusMap};

/// Queries all wrapped drivers in parallel and merges their results.
///
/// The merge is strict: if any child query fails, the whole query fails.
#[derive(Debug)]
pub struct MultiDriver {
    drivers: Vec<Arc<dyn Driver>>,
    name: String,
}

impl MultiDriver {
    pub fn new(drivers: Vec<Arc<dyn Driver>>) -> Self {
        let names: Vec<&str> = drivers.iter().map(|d| d.name()).collect();
        let name = format!("multi[{}]", names.join(","));
        MultiDriver { drivers, name }
    }
}

#[async_trait]
impl Driver for MultiDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn query_domain(&self, domain: &str) -> Result<Box<dyn QueryResult>> {
        let queries = self.drivers.iter().map(|d| d.query_domain(domain));
        let results = try_join_all(queries).await?;

        // union per domain; FingerprintMap drops cross-driver duplicates on
        // insert
        let mut fingerprints = FingerprintMap::new();
        for result in &results {
            for (fp_domain, fps) in result.fingerprints().iter() {
                for fp in fps {
                    fingerprints.add(fp_domain.clone(), *fp);
                }
            }
        }

        let names: Vec<String> = self.drivers.iter().map(|d| d.name().to_string()).collect();
        Ok(Box::new(MultiResult {
            host: domain.to_string(),
            driver_names: names,
            results,
            fingerprints,
        }))
    }
}

#[derive(Debug)]
struct MultiResult {
    host: String,
    driver_names: Vec<String>,
    results: Vec<Box<dyn QueryResult>>,
    fingerprints: FingerprintMap,
}

#[async_trait]
impl QueryResult for MultiResult {
    /// A single `MULTI` entry for the queried host; the individual driver
    /// statuses are not nested.
    fn status(&self) -> StatusMap {
        StatusMap::single(self.host.clone(), Status::new(DomainStatus::Multi))
    }

    /// Deduplicated union of the children's related domains.
    fn related(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut related = Vec::new();
        for result in &self.results {
            for domain in result.related() {
                if seen.insert(domain.clone()) {
                    related.push(domain);
                }
            }
        }
        related
    }

    fn fingerprints(&self) -> FingerprintMap {
        self.fingerprints.clone()
    }

    /// Every child driver whose result asserted this domain-certificate edge.
    fn sources(&self, domain: &str, fp: &Fingerprint) -> Vec<String> {
        let mut sources = Vec::new();
        for (result, name) in self.results.iter().zip(&self.driver_names) {
            if result.fingerprints().contains(domain, fp) {
                sources.push(name.clone());
            }
        }
        sources
    }

    /// Probe each child in order and return the first answer.
    async fn query_cert(&self, fp: &Fingerprint) -> Result<CertResult> {
        for result in &self.results {
            if let Ok(cert) = result.query_cert(fp).await {
                return Ok(cert);
            }
        }
        bail!(
            "no wrapped driver could resolve certificate {}",
            fp.hex_string()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct StubDriver {
        name: &'static str,
        fps: Vec<Fingerprint>,
        related: Vec<String>,
        fail: bool,
    }

    #[derive(Debug)]
    struct StubResult {
        name: &'static str,
        host: String,
        fps: Vec<Fingerprint>,
        related: Vec<String>,
    }

    #[async_trait]
    impl Driver for StubDriver {
        fn name(&self) -> &str {
            self.name
        }

        async fn query_domain(&self, domain: &str) -> Result<Box<dyn QueryResult>> {
            if self.fail {
                bail!("stub failure");
            }
            Ok(Box::new(StubResult {
                name: self.name,
                host: domain.to_string(),
                fps: self.fps.clone(),
                related: self.related.clone(),
            }))
        }
    }

    #[async_trait]
    impl QueryResult for StubResult {
        fn status(&self) -> StatusMap {
            StatusMap::single(self.host.clone(), Status::new(DomainStatus::Ct))
        }

        fn related(&self) -> Vec<String> {
            self.related.clone()
        }

        fn fingerprints(&self) -> FingerprintMap {
            let mut m = FingerprintMap::new();
            for fp in &self.fps {
                m.add(self.host.clone(), *fp);
            }
            m
        }

        fn sources(&self, _domain: &str, _fp: &Fingerprint) -> Vec<String> {
            vec![self.name.to_string()]
        }

        async fn query_cert(&self, fp: &Fingerprint) -> Result<CertResult> {
            if self.fps.contains(fp) {
                Ok(CertResult::new(*fp, vec![self.host.clone()]))
            } else {
                bail!("not found")
            }
        }
    }

    fn stub(name: &'static str, fps: Vec<Fingerprint>) -> Arc<dyn Driver> {
        Arc::new(StubDriver {
            name,
            fps,
            related: Vec::new(),
            fail: false,
        })
    }

    #[tokio::test]
    async fn test_name_composition() {
        let multi = MultiDriver::new(vec![stub("a", vec![]), stub("b", vec![])]);
        assert_eq!(multi.name(), "multi[a,b]");
    }

    #[tokio::test]
    async fn test_fingerprints_dedupe_across_drivers() {
        let fp = Fingerprint::from_raw_cert_bytes(b"shared");
        let multi = MultiDriver::new(vec![stub("a", vec![fp]), stub("b", vec![fp])]);

        let result = multi.query_domain("example.com").await.unwrap();
        assert_eq!(result.fingerprints().for_domain("example.com"), vec![fp]);
    }

    #[tokio::test]
    async fn test_sources_report_all_asserting_drivers() {
        let fp = Fingerprint::from_raw_cert_bytes(b"shared");
        let only_a = Fingerprint::from_raw_cert_bytes(b"only a");
        let multi = MultiDriver::new(vec![stub("a", vec![fp, only_a]), stub("b", vec![fp])]);

        let result = multi.query_domain("example.com").await.unwrap();
        assert_eq!(result.sources("example.com", &fp), vec!["a", "b"]);
        assert_eq!(result.sources("example.com", &only_a), vec!["a"]);
    }

    #[tokio::test]
    async fn test_status_is_multi() {
        let multi = MultiDriver::new(vec![stub("a", vec![])]);
        let result = multi.query_domain("example.com").await.unwrap();
        assert_eq!(
            result.status().get("example.com").unwrap().status,
            DomainStatus::Multi
        );
    }

    #[tokio::test]
    async fn test_related_union_dedups() {
        let a = Arc::new(StubDriver {
            name: "a",
            fps: vec![],
            related: vec!["x.com".to_string(), "y.com".to_string()],
            fail: false,
        });
        let b = Arc::new(StubDriver {
            name: "b",
            fps: vec![],
            related: vec!["y.com".to_string(), "z.com".to_string()],
            fail: false,
        });
        let multi = MultiDriver::new(vec![a, b]);

        let result = multi.query_domain("example.com").await.unwrap();
        let mut related = result.related();
        related.sort();
        assert_eq!(related, vec!["x.com", "y.com", "z.com"]);
    }

    #[tokio::test]
    async fn test_child_failure_fails_merge() {
        let ok = stub("a", vec![]);
        let bad = Arc::new(StubDriver {
            name: "b",
            fps: vec![],
            related: vec![],
            fail: true,
        });
        let multi = MultiDriver::new(vec![ok, bad]);
        assert!(multi.query_domain("example.com").await.is_err());
    }

    #[tokio::test]
    async fn test_query_cert_probes_in_order() {
        let fp = Fingerprint::from_raw_cert_bytes(b"cert");
        let multi = MultiDriver::new(vec![stub("a", vec![]), stub("b", vec![fp])]);

        let result = multi.query_domain("example.com").await.unwrap();
        let cert = result.query_cert(&fp).await.unwrap();
        assert_eq!(cert.fingerprint, fp);

        let missing = Fingerprint::from_raw_cert_bytes(b"missing");
        assert!(result.query_cert(&missing).await.is_err());
    }
}
