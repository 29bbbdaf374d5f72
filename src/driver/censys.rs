// src/driver/censys.rs
//! Certificate Transparency driver for the Censys certificate search API.
//!
//! Requires API credentials; the search endpoint is paginated but a single
//! page is queried per domain, matching the upstream behavior.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{save, CertResult, Driver, FingerprintMap, QueryResult};
use crate::fingerprint::Fingerprint;
use crate::status::{DomainStatus, Status, StatusMap};

const DRIVER_NAME: &str = "censys";
const BASE_URL: &str = "https://search.censys.io/api/v1";
const MAX_TRIES: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct CertSearchParam {
    query: String,
    page: u32,
    fields: Vec<String>,
    flatten: bool,
}

#[derive(Debug, Deserialize)]
struct CertSearchResponse {
    #[serde(default)]
    results: Vec<CertSearchHit>,
}

#[derive(Debug, Deserialize)]
struct CertSearchHit {
    #[serde(rename = "parsed.fingerprint_sha256")]
    fingerprint: String,
}

#[derive(Debug, Deserialize)]
struct CertViewResponse {
    #[serde(default)]
    raw: String,
    parsed: CertViewParsed,
}

#[derive(Debug, Deserialize)]
struct CertViewParsed {
    #[serde(default)]
    names: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_code: i64,
}

#[derive(Debug)]
struct CensysCore {
    client: reqwest::Client,
    base_url: String,
    app_id: String,
    secret: String,
    include_subdomains: bool,
    include_expired: bool,
    save_path: Option<PathBuf>,
}

/// CT driver querying the Censys certificate database.
#[derive(Debug)]
pub struct CensysDriver {
    core: Arc<CensysCore>,
}

impl CensysDriver {
    pub fn new(
        app_id: String,
        secret: String,
        timeout: Duration,
        save_path: Option<PathBuf>,
        include_subdomains: bool,
        include_expired: bool,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .gzip(true)
            .build()
            .context("failed to build HTTP client")?;
        Ok(CensysDriver {
            core: Arc::new(CensysCore {
                client,
                base_url: BASE_URL.to_string(),
                app_id,
                secret,
                include_subdomains,
                include_expired,
                save_path,
            }),
        })
    }

    #[cfg(test)]
    fn with_base_url(mut self, base_url: String) -> Self {
        Arc::get_mut(&mut self.core).unwrap().base_url = base_url;
        self
    }
}

impl CensysCore {
    fn search_param(&self, domain: &str) -> CertSearchParam {
        let mut query = if self.include_subdomains {
            format!("(parsed.names: {domain} )")
        } else {
            format!("(parsed.names.raw: {domain})")
        };
        if !self.include_expired {
            let date = chrono::Utc::now().format("%Y-%m-%d");
            query.push_str(&format!(
                " AND ((parsed.validity.end: [{date} TO *]) AND (parsed.validity.start: [* TO {date}]))"
            ));
        }
        CertSearchParam {
            query,
            page: 1,
            fields: vec![
                "parsed.fingerprint_sha256".to_string(),
                "parsed.names".to_string(),
            ],
            flatten: true,
        }
    }

    /// Send a request, retrying transport failures with a fixed pause.
    async fn request(&self, build: impl Fn() -> reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let mut attempt = 1;
        loop {
            let result = build()
                .basic_auth(&self.app_id, Some(&self.secret))
                .header("Accept", "application/json")
                .send()
                .await;
            match result {
                Ok(response) => return Ok(response),
                Err(e) if attempt < MAX_TRIES => {
                    debug!("censys request failed (attempt {attempt}/{MAX_TRIES}): {e}");
                    tokio::time::sleep(RETRY_DELAY).await;
                    attempt += 1;
                }
                Err(e) => return Err(e).context("censys request failed"),
            }
        }
    }

    async fn decode<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let err: ErrorResponse = response
                .json()
                .await
                .unwrap_or_else(|_| ErrorResponse {
                    error: "unreadable error body".to_string(),
                    error_code: 0,
                });
            bail!(
                "censys API returned {status}: {} (code {})",
                err.error,
                err.error_code
            );
        }
        response
            .json()
            .await
            .context("failed to decode censys response")
    }

    async fn query_cert(&self, fp: &Fingerprint) -> Result<CertResult> {
        let url = format!("{}/view/certificates/{}", self.base_url, fp.hex_string());
        let response = self.request(|| self.client.get(&url)).await?;
        let view: CertViewResponse = Self::decode(response).await?;

        if let Some(dir) = &self.save_path {
            if !view.raw.is_empty() {
                match base64::engine::general_purpose::STANDARD.decode(&view.raw) {
                    Ok(der) => {
                        let path = dir.join(format!("{}.pem", fp.hex_string()));
                        if let Err(e) = save::raw_cert_to_pem_file(&der, &path) {
                            warn!("failed to save certificate {}: {e:#}", fp.hex_string());
                        }
                    }
                    Err(e) => warn!("undecodable raw certificate {}: {e}", fp.hex_string()),
                }
            }
        }

        Ok(CertResult::new(*fp, view.parsed.names))
    }
}

#[async_trait]
impl Driver for CensysDriver {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    async fn query_domain(&self, domain: &str) -> Result<Box<dyn QueryResult>> {
        let core = &self.core;
        let url = format!("{}/search/certificates", core.base_url);
        let param = core.search_param(domain);

        let response = core
            .request(|| core.client.post(&url).json(&param))
            .await?;
        let search: CertSearchResponse = CensysCore::decode(response).await?;

        debug!(
            "censys returned {} certificates for {domain}",
            search.results.len()
        );

        let mut fingerprints = FingerprintMap::new();
        for hit in search.results {
            match Fingerprint::from_hex(&hit.fingerprint) {
                Ok(fp) => fingerprints.add(domain, fp),
                Err(e) => debug!("skipping malformed fingerprint: {e:#}"),
            }
        }

        Ok(Box::new(CensysResult {
            host: domain.to_string(),
            fingerprints,
            core: Arc::clone(core),
        }))
    }
}

#[derive(Debug)]
struct CensysResult {
    host: String,
    fingerprints: FingerprintMap,
    core: Arc<CensysCore>,
}

#[async_trait]
impl QueryResult for CensysResult {
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

    async fn query_cert(&self, fp: &Fingerprint) -> Result<CertResult> {
        self.core.query_cert(fp).await
    }
}
