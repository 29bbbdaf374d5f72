// src/driver/google.rs
//! Certificate Transparency driver for Google's transparency report API.
//!
//! The API is unofficial and reverse engineered: responses are JSONP with a
//! `)]}'` guard prefix and positional arrays instead of objects.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{CertResult, Driver, FingerprintMap, QueryResult};
use crate::fingerprint::Fingerprint;
use crate::status::{DomainStatus, Status, StatusMap};

const DRIVER_NAME: &str = "google";
const BASE_URL: &str = "https://transparencyreport.google.com/transparencyreport/api/v3/httpsreport/ct";
/// Stop paginating after this many result pages per domain.
const MAX_PAGES: u64 = 10;
/// Length of the `)]}'` + newline guard prefix on every response.
const JSONP_PREFIX_LEN: usize = 5;

#[derive(Debug)]
struct GoogleCtCore {
    client: reqwest::Client,
    base_url: String,
    include_subdomains: bool,
    include_expired: bool,
}

/// CT driver querying Google's certificate transparency search.
#[derive(Debug)]
pub struct GoogleCtDriver {
    core: Arc<GoogleCtCore>,
}

impl GoogleCtDriver {
    pub fn new(
        timeout: Duration,
        save_path: Option<PathBuf>,
        include_subdomains: bool,
        include_expired: bool,
    ) -> Result<Self> {
        if save_path.is_some() {
            bail!("google driver does not support saving certificates");
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .gzip(true)
            .build()
            .context("failed to build HTTP client")?;
        Ok(GoogleCtDriver {
            core: Arc::new(GoogleCtCore {
                client,
                base_url: BASE_URL.to_string(),
                include_subdomains,
                include_expired,
            }),
        })
    }

    #[cfg(test)]
    fn with_base_url(mut self, base_url: String) -> Self {
        Arc::get_mut(&mut self.core).unwrap().base_url = base_url;
        self
    }
}

impl GoogleCtCore {
    /// Fetch a JSONP endpoint and strip the guard prefix.
    async fn get_jsonp(&self, url: &str, query: &[(&str, String)]) -> Result<Value> {
        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;
        if !response.status().is_success() {
            bail!("got HTTP status {} from {url}", response.status());
        }
        let body = response.bytes().await.context("failed to read response body")?;
        if body.len() <= JSONP_PREFIX_LEN {
            bail!("response from {url} too short to be JSONP");
        }
        serde_json::from_slice(&body[JSONP_PREFIX_LEN..])
            .with_context(|| format!("failed to parse JSONP from {url}"))
    }
}

#[async_trait]
impl Driver for GoogleCtDriver {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    /// Page through the certsearch results for a domain, collecting base64
    /// certificate hashes.
    async fn query_domain(&self, domain: &str) -> Result<Box<dyn QueryResult>> {
        let core = &self.core;
        let mut fingerprints = FingerprintMap::new();

        let search_url = format!("{}/certsearch", core.base_url);
        let page_url = format!("{}/certsearch/page", core.base_url);

        let mut query: Vec<(&str, String)> = vec![
            ("include_expired", core.include_expired.to_string()),
            ("include_subdomains", core.include_subdomains.to_string()),
            ("domain", domain.to_string()),
        ];
        let mut url = search_url;
        let mut page = 1u64;

        loop {
            let raw = core.get_jsonp(&url, &query).await?;
            let envelope = raw
                .get(0)
                .and_then(Value::as_array)
                .ok_or_else(|| anyhow!("unexpected certsearch response shape"))?;

            if envelope.first().and_then(Value::as_str) != Some("https.ct.cdsr") {
                bail!(
                    "unexpected certsearch response tag: {:?}",
                    envelope.first()
                );
            }
            // a short envelope means no results
            if envelope.len() != 4 {
                break;
            }
            let Some(page_info) = envelope[3].as_array().filter(|p| p.len() == 5) else {
                break;
            };

            for cert in envelope[1].as_array().into_iter().flatten() {
                let Some(hash) = cert.get(5).and_then(Value::as_str) else {
                    continue;
                };
                match Fingerprint::from_b64(hash) {
                    Ok(fp) => fingerprints.add(domain, fp),
                    Err(e) => debug!("skipping malformed certificate hash: {e:#}"),
                }
            }

            // pageInfo: [prevToken, nextToken, ?, currentPage, totalPages]
            let next_token = page_info[1].as_str();
            page += 1;
            match next_token {
                Some(token) if page <= MAX_PAGES => {
                    url = page_url.clone();
                    query = vec![("p", token.to_string())];
                }
                _ => break,
            }
        }

        debug!(
            "google ct returned {} certificates for {domain}",
            fingerprints.for_domain(domain).len()
        );

        Ok(Box::new(GoogleCtResult {
            host: domain.to_string(),
            fingerprints,
            core: Arc::clone(core),
        }))
    }
}

#[derive(Debug)]
struct GoogleCtResult {
    host: String,
    fingerprints: FingerprintMap,
    core: Arc<GoogleCtCore>,
}

#[async_trait]
impl QueryResult for GoogleCtResult {
    fn status(&self) -> StatusMap {
        StatusMap::single(self.host.clone(), Status::new(DomainStatus::Ct))
    }

    fn related(&self) -> Vec<String> {
        Vec::new()
    }

    fn fingerprints(&self) -> FingerprintMap {
        self.fingerprints.clone()
    }

    fn sources(&self, _domain: &str, _fp: &Fingerprint) -> Vec<String> {
        vec![DRIVER_NAME.to_string()]
    }

    /// Resolve a fingerprint through the certbyhash endpoint.
    async fn query_cert(&self, fp: &Fingerprint) -> Result<CertResult> {
        let url = format!("{}/certbyhash", self.core.base_url);
        let raw = self
            .core
            .get_jsonp(&url, &[("hash", fp.b64_string())])
            .await?;
        let envelope = raw
            .get(0)
            .and_then(Value::as_array)
            .ok_or_else(|| anyhow!("unexpected certbyhash response shape"))?;

        if envelope.first().and_then(Value::as_str) != Some("https.ct.chr") {
            bail!("unexpected certbyhash response tag: {:?}", envelope.first());
        }
        if envelope.len() != 3 {
            bail!("certificate {} not found", fp.hex_string());
        }

        // certInfo holds the DNS names at index 7
        let names: Vec<String> = envelope[1]
            .as_array()
            .and_then(|info| info.get(7))
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(CertResult::new(*fp, names))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn jsonp(value: Value) -> String {
        format!(")]}}'\n{value}")
    }

    fn driver_for(server: &MockServer) -> GoogleCtDriver {
        GoogleCtDriver::new(Duration::from_secs(2), None, false, false)
            .unwrap()
            .with_base_url(server.uri())
    }

    #[tokio::test]
    async fn test_query_domain_single_page() {
        let server = MockServer::start().await;
        let fp = Fingerprint::from_raw_cert_bytes(b"cert one");

        let body = serde_json::json!([[
            "https.ct.cdsr",
            [[null, null, null, null, null, fp.b64_string()]],
            null,
            [null, null, null, 1.0, 1.0]
        ]]);
        Mock::given(method("GET"))
            .and(path("/certsearch"))
            .and(query_param("domain", "example.com"))
            .respond_with(ResponseTemplate::new(200).set_body_string(jsonp(body)))
            .mount(&server)
            .await;

        let driver = driver_for(&server);
        let result = driver.query_domain("example.com").await.unwrap();

        assert_eq!(result.fingerprints().for_domain("example.com"), vec![fp]);
        assert_eq!(
            result.status().get("example.com").unwrap().status,
            DomainStatus::Ct
        );
        assert!(result.related().is_empty());
    }

    #[tokio::test]
    async fn test_query_domain_follows_pagination() {
        let server = MockServer::start().await;
        let fp1 = Fingerprint::from_raw_cert_bytes(b"cert one");
        let fp2 = Fingerprint::from_raw_cert_bytes(b"cert two");

        let first = serde_json::json!([[
            "https.ct.cdsr",
            [[null, null, null, null, null, fp1.b64_string()]],
            null,
            [null, "NEXT_TOKEN", null, 1.0, 2.0]
        ]]);
        let second = serde_json::json!([[
            "https.ct.cdsr",
            [[null, null, null, null, null, fp2.b64_string()]],
            null,
            [null, null, null, 2.0, 2.0]
        ]]);

        Mock::given(method("GET"))
            .and(path("/certsearch"))
            .respond_with(ResponseTemplate::new(200).set_body_string(jsonp(first)))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/certsearch/page"))
            .and(query_param("p", "NEXT_TOKEN"))
            .respond_with(ResponseTemplate::new(200).set_body_string(jsonp(second)))
            .mount(&server)
            .await;

        let driver = driver_for(&server);
        let result = driver.query_domain("example.com").await.unwrap();

        let fps = result.fingerprints().for_domain("example.com");
        assert_eq!(fps, vec![fp1, fp2]);
    }

    #[tokio::test]
    async fn test_query_domain_no_results() {
        let server = MockServer::start().await;
        let body = serde_json::json!([["https.ct.cdsr"]]);
        Mock::given(method("GET"))
            .and(path("/certsearch"))
            .respond_with(ResponseTemplate::new(200).set_body_string(jsonp(body)))
            .mount(&server)
            .await;

        let driver = driver_for(&server);
        let result = driver.query_domain("example.com").await.unwrap();
        assert!(result.fingerprints().is_empty());
    }

    #[tokio::test]
    async fn test_query_cert_parses_names() {
        let server = MockServer::start().await;
        let fp = Fingerprint::from_raw_cert_bytes(b"cert one");

        let search = serde_json::json!([["https.ct.cdsr"]]);
        let cert = serde_json::json!([[
            "https.ct.chr",
            [null, null, null, null, null, null, null,
             ["Example.COM", "www.example.com", "example.com"]],
            null
        ]]);
        Mock::given(method("GET"))
            .and(path("/certsearch"))
            .respond_with(ResponseTemplate::new(200).set_body_string(jsonp(search)))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/certbyhash"))
            .and(query_param("hash", fp.b64_string()))
            .respond_with(ResponseTemplate::new(200).set_body_string(jsonp(cert)))
            .mount(&server)
            .await;

        let driver = driver_for(&server);
        let result = driver.query_domain("example.com").await.unwrap();
        let cert_result = result.query_cert(&fp).await.unwrap();

        assert_eq!(cert_result.fingerprint, fp);
        assert_eq!(cert_result.domains, vec!["example.com", "www.example.com"]);
    }

    #[tokio::test]
    async fn test_query_cert_missing_fails() {
        let server = MockServer::start().await;
        let fp = Fingerprint::from_raw_cert_bytes(b"cert one");

        let search = serde_json::json!([["https.ct.cdsr"]]);
        let missing = serde_json::json!([["https.ct.chr"]]);
        Mock::given(method("GET"))
            .and(path("/certsearch"))
            .respond_with(ResponseTemplate::new(200).set_body_string(jsonp(search)))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/certbyhash"))
            .respond_with(ResponseTemplate::new(200).set_body_string(jsonp(missing)))
            .mount(&server)
            .await;

        let driver = driver_for(&server);
        let result = driver.query_domain("example.com").await.unwrap();
        assert!(result.query_cert(&fp).await.is_err());
    }

    #[tokio::test]
    async fn test_http_error_fails_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/certsearch"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let driver = driver_for(&server);
        assert!(driver.query_domain("example.com").await.is_err());
    }

    #[test]
    fn test_saving_unsupported() {
        let err = GoogleCtDriver::new(
            Duration::from_secs(1),
            Some(PathBuf::from("/tmp/certs")),
            false,
            false,
        )
        .unwrap_err();
        assert!(err.to_string().contains("does not support saving"));
    }
}
