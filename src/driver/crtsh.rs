// src/driver/crtsh.rs
//! Certificate Transparency driver backed by crt.sh's public Postgres mirror.
//!
//! The API is unofficial; queries are retried with backoff because the
//! mirror sheds load under pressure.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Executor;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{save, CertResult, Driver, FingerprintMap, QueryResult};
use crate::fingerprint::Fingerprint;
use crate::status::{DomainStatus, Status, StatusMap};

const DRIVER_NAME: &str = "crtsh";
const CONN_STR: &str = "postgres://guest@crt.sh/certwatch?sslmode=disable&application_name=sangraph";

/// Maximum rows pulled per domain search.
const QUERY_LIMIT: i64 = 1000;
const MAX_TRIES: u32 = 5;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

const DOMAIN_QUERY: &str = r#"WITH myconstants (include_expired, include_subdomains) AS (
    VALUES ($1::bool, $2::bool)
),
ci AS (
    SELECT digest(sub.CERTIFICATE, 'sha256') sha256,
           min(sub.CERTIFICATE_ID) ID,
           min(sub.ISSUER_CA_ID) ISSUER_CA_ID,
           array_agg(DISTINCT sub.NAME_VALUE) NAME_VALUES
        FROM (SELECT *
                  FROM certificate_and_identities cai, myconstants
                  WHERE plainto_tsquery('certwatch', $4) @@ identities(cai.CERTIFICATE)
                     AND (
                         (NOT myconstants.include_subdomains AND cai.NAME_VALUE ILIKE ($4))
                         OR
                         (myconstants.include_subdomains AND (cai.NAME_VALUE ILIKE ($4) OR cai.NAME_VALUE ILIKE ('%.' || $4)))
                     )
                      AND (
                          cai.NAME_TYPE = '2.5.4.3'
                          OR
                          cai.NAME_TYPE = 'san:dNSName'
                          )
                      AND
                          (myconstants.include_expired OR (coalesce(x509_notAfter(cai.CERTIFICATE), 'infinity'::timestamp) >= date_trunc('year', now() AT TIME ZONE 'UTC')
                          AND x509_notAfter(cai.CERTIFICATE) >= now() AT TIME ZONE 'UTC'))
                  LIMIT $3
             ) sub
        GROUP BY sub.CERTIFICATE
)
SELECT ci.sha256 FROM ci;"#;

const CERT_QUERY: &str = "SELECT DISTINCT NAME_VALUE FROM certificate_and_identities \
    WHERE digest(certificate, 'sha256') = $1 \
    AND (NAME_TYPE = '2.5.4.3' OR NAME_TYPE = 'san:dNSName');";

const RAW_CERT_QUERY: &str = "SELECT certificate FROM certificate_and_identities \
    WHERE digest(certificate, 'sha256') = $1 LIMIT 1;";

#[derive(Debug)]
struct CrtshCore {
    pool: PgPool,
    include_subdomains: bool,
    include_expired: bool,
    save_path: Option<PathBuf>,
}

/// CT driver querying crt.sh over SQL.
#[derive(Debug)]
pub struct CrtshDriver {
    core: Arc<CrtshCore>,
}

impl CrtshDriver {
    pub fn new(
        timeout: Duration,
        save_path: Option<PathBuf>,
        include_subdomains: bool,
        include_expired: bool,
    ) -> Result<Self> {
        let statement_timeout_ms = timeout.as_millis().max(1);
        let pool = PgPoolOptions::new()
            .max_connections(25)
            .min_connections(0)
            .idle_timeout(Duration::from_secs(5 * 60))
            .max_lifetime(Duration::from_secs(30 * 60))
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    conn.execute(format!("SET statement_timeout TO {statement_timeout_ms};").as_str())
                        .await?;
                    Ok(())
                })
            })
            .connect_lazy(CONN_STR)
            .context("failed to configure crt.sh connection pool")?;

        Ok(CrtshDriver {
            core: Arc::new(CrtshCore {
                pool,
                include_subdomains,
                include_expired,
                save_path,
            }),
        })
    }
}

impl CrtshCore {
    /// Fetch the SAN names recorded for a fingerprint and optionally save
    /// the raw certificate.
    async fn query_cert(&self, fp: &Fingerprint) -> Result<CertResult> {
        let names: Vec<String> = retry(MAX_TRIES, RETRY_BASE_DELAY, || {
            sqlx::query_scalar(CERT_QUERY)
                .bind(fp.as_bytes().as_slice())
                .fetch_all(&self.pool)
        })
        .await
        .with_context(|| format!("crt.sh certificate lookup for {}", fp.hex_string()))?;

        if let Some(dir) = &self.save_path {
            match sqlx::query_scalar::<_, Vec<u8>>(RAW_CERT_QUERY)
                .bind(fp.as_bytes().as_slice())
                .fetch_optional(&self.pool)
                .await
            {
                Ok(Some(raw)) => {
                    let path = dir.join(format!("{}.pem", fp.hex_string()));
                    if let Err(e) = save::raw_cert_to_pem_file(&raw, &path) {
                        warn!("failed to save certificate {}: {e:#}", fp.hex_string());
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("failed to fetch raw certificate {}: {e:#}", fp.hex_string()),
            }
        }

        Ok(CertResult::new(*fp, names))
    }
}

#[async_trait]
impl Driver for CrtshDriver {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    async fn query_domain(&self, domain: &str) -> Result<Box<dyn QueryResult>> {
        let core = &self.core;
        let hashes: Vec<Vec<u8>> = retry(MAX_TRIES, RETRY_BASE_DELAY, || {
            sqlx::query_scalar(DOMAIN_QUERY)
                .bind(core.include_expired)
                .bind(core.include_subdomains)
                .bind(QUERY_LIMIT)
                .bind(domain)
                .fetch_all(&core.pool)
        })
        .await
        .with_context(|| format!("crt.sh domain search for {domain}"))?;

        debug!("crt.sh returned {} certificates for {domain}", hashes.len());

        let mut fingerprints = FingerprintMap::new();
        for hash in hashes {
            fingerprints.add(domain, Fingerprint::from_hash_bytes(&hash));
        }

        Ok(Box::new(CrtshResult {
            host: domain.to_string(),
            fingerprints,
            core: Arc::clone(core),
        }))
    }
}

#[derive(Debug)]
struct CrtshResult {
    host: String,
    fingerprints: FingerprintMap,
    core: Arc<CrtshCore>,
}

#[async_trait]
impl QueryResult for CrtshResult {
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

/// Run a query up to `tries` times with exponential backoff, doubling from
/// `base_delay` between attempts.
async fn retry<T, F, Fut>(tries: u32, base_delay: Duration, mut op: F) -> sqlx::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = sqlx::Result<T>>,
{
    let mut delay = base_delay;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < tries => {
                debug!("crt.sh query failed (attempt {attempt}/{tries}): {e}");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_failures() {
        let calls = AtomicU32::new(0);
        let result = retry(5, Duration::from_millis(100), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(sqlx::Error::PoolTimedOut)
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_max_tries() {
        let calls = AtomicU32::new(0);
        let result: sqlx::Result<()> = retry(5, Duration::from_millis(100), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(sqlx::Error::PoolTimedOut) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }
}
