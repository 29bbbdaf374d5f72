// src/driver/https.rs
//! Certificate discovery through live HTTPS handshakes.
//!
//! The driver speaks HTTP/1.1 over the TLS stream itself so it can capture
//! the certificate of every hop in a redirect chain; an off-the-shelf HTTP
//! client would hide the handshakes from us.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};
use url::Url;

use super::{save, tls, CertResult, Driver, FingerprintMap, QueryResult};
use crate::fingerprint::Fingerprint;
use crate::status::{classify_net_error, DomainStatus, Status, StatusMap};

const DRIVER_NAME: &str = "http";
const HTTPS_PORT: u16 = 443;
const MAX_REDIRECTS: usize = 10;
/// Response head larger than this is cut off; we only need the status line
/// and a possible Location header.
const MAX_HEAD_BYTES: usize = 16 * 1024;

/// Discovers certificates by performing TLS handshakes against web servers.
pub struct HttpsDriver {
    connector: TlsConnector,
    timeout: Duration,
    save_path: Option<PathBuf>,
    port: u16,
}

impl std::fmt::Debug for HttpsDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpsDriver")
            .field("timeout", &self.timeout)
            .field("save_path", &self.save_path)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

impl HttpsDriver {
    pub fn new(timeout: Duration, save_path: Option<PathBuf>) -> Result<Self> {
        Ok(HttpsDriver {
            connector: tls::insecure_connector()?,
            timeout,
            save_path,
            port: HTTPS_PORT,
        })
    }

    /// Handshake with one host, record its certificate, and return the host
    /// a redirect response points at (if any).
    async fn fetch(&self, host: &str, result: &mut HttpsResult) -> io::Result<Option<String>> {
        let mut stream = tls::handshake(&self.connector, host, self.port, self.timeout).await?;

        let chain = tls::peer_chain(&stream);
        if let Some(leaf) = chain.first() {
            match CertResult::from_der(leaf) {
                Ok(cert) => {
                    result.fingerprints.add(host, cert.fingerprint);
                    if let Some(dir) = &self.save_path {
                        let path = dir.join(format!("{}.pem", cert.fingerprint.hex_string()));
                        if let Err(e) = save::certs_to_pem_file(&chain, &path) {
                            warn!("failed to save certificate chain for {host}: {e:#}");
                        }
                    }
                    result.certs.insert(cert.fingerprint, cert);
                }
                Err(e) => debug!("unparseable certificate from {host}: {e:#}"),
            }
        }

        let request = format!(
            "GET / HTTP/1.1\r\nHost: {host}\r\nUser-Agent: sangraph/{}\r\nAccept: */*\r\nConnection: close\r\n\r\n",
            env!("CARGO_PKG_VERSION")
        );
        tokio::time::timeout(self.timeout, stream.write_all(request.as_bytes()))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "request write timed out"))??;

        let head = self.read_head(&mut stream).await?;
        Ok(redirect_target(&head))
    }

    /// Read the response head (through the blank line) or up to the size cap.
    async fn read_head(
        &self,
        stream: &mut tokio_rustls::client::TlsStream<tokio::net::TcpStream>,
    ) -> io::Result<String> {
        let mut head = Vec::new();
        let mut buf = [0u8; 2048];
        loop {
            let n = tokio::time::timeout(self.timeout, stream.read(&mut buf))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "response read timed out"))??;
            if n == 0 {
                break;
            }
            head.extend_from_slice(&buf[..n]);
            if head.windows(4).any(|w| w == &b"\r\n\r\n"[..]) || head.len() >= MAX_HEAD_BYTES {
                break;
            }
        }
        Ok(String::from_utf8_lossy(&head).into_owned())
    }
}

#[async_trait]
impl Driver for HttpsDriver {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    /// Connect to the domain, following redirects and collecting the
    /// certificate of every server on the way.
    ///
    /// Connection failures are reported through the status map rather than
    /// as errors; a down host is an ordinary observation for this driver.
    async fn query_domain(&self, domain: &str) -> Result<Box<dyn QueryResult>> {
        let mut result = HttpsResult {
            status: StatusMap::new(),
            fingerprints: FingerprintMap::new(),
            related: Vec::new(),
            certs: HashMap::new(),
        };

        let mut current = domain.to_lowercase();
        for _ in 0..=MAX_REDIRECTS {
            match self.fetch(&current, &mut result).await {
                Ok(Some(next)) if next != current => {
                    debug!("{current} redirects to {next}");
                    result
                        .status
                        .set(current.clone(), Status::with_meta(DomainStatus::Redirect, next.as_str()));
                    if !result.status.contains(&next) {
                        result.status.set(next.clone(), Status::default());
                    }
                    result.related.push(next.clone());
                    current = next;
                }
                Ok(_) => {
                    result.status.set(current.clone(), Status::new(DomainStatus::Good));
                    break;
                }
                Err(e) => {
                    let status = classify_net_error(Some(&e));
                    debug!("{current}: {e} ({status})");
                    result.status.set(current.clone(), Status::new(status));
                    break;
                }
            }
        }

        Ok(Box::new(result))
    }
}

#[derive(Debug)]
struct HttpsResult {
    status: StatusMap,
    fingerprints: FingerprintMap,
    related: Vec<String>,
    certs: HashMap<Fingerprint, CertResult>,
}

#[async_trait]
impl QueryResult for HttpsResult {
    fn status(&self) -> StatusMap {
        self.status.clone()
    }

    fn related(&self) -> Vec<String> {
        self.related.clone()
    }

    fn fingerprints(&self) -> FingerprintMap {
        self.fingerprints.clone()
    }

    fn sources(&self, _domain: &str, _fp: &Fingerprint) -> Vec<String> {
        vec![DRIVER_NAME.to_string()]
    }

    async fn query_cert(&self, fp: &Fingerprint) -> Result<CertResult> {
        match self.certs.get(fp) {
            Some(cert) => Ok(cert.clone()),
            None => bail!("certificate with fingerprint {} not found", fp.hex_string()),
        }
    }
}

/// Extract the target hostname from a redirect response head, if the
/// response is a redirect pointing at another host.
fn redirect_target(head: &str) -> Option<String> {
    let mut lines = head.split("\r\n");
    let status_line = lines.next()?;
    let code: u16 = status_line.split_whitespace().nth(1)?.parse().ok()?;
    if !(300..400).contains(&code) || code == 304 {
        return None;
    }

    let location = lines.find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.eq_ignore_ascii_case("location")
            .then(|| value.trim().to_string())
    })?;

    // path-only redirects stay on the same host and end the chase
    if location.starts_with('/') && !location.starts_with("//") {
        return None;
    }
    let absolute = if let Some(rest) = location.strip_prefix("//") {
        format!("https://{rest}")
    } else {
        location
    };
    let url = Url::parse(&absolute).ok()?;
    url.host_str().map(|h| h.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redirect_target_absolute() {
        let head = "HTTP/1.1 301 Moved Permanently\r\nLocation: https://www.example.com/path\r\n\r\n";
        assert_eq!(redirect_target(head), Some("www.example.com".to_string()));
    }

    #[test]
    fn test_redirect_target_case_insensitive_header() {
        let head = "HTTP/1.1 302 Found\r\nlocation: https://Next.Example.ORG/\r\n\r\n";
        assert_eq!(redirect_target(head), Some("next.example.org".to_string()));
    }

    #[test]
    fn test_redirect_target_scheme_relative() {
        let head = "HTTP/1.1 307 Temporary Redirect\r\nLocation: //cdn.example.net/x\r\n\r\n";
        assert_eq!(redirect_target(head), Some("cdn.example.net".to_string()));
    }

    #[test]
    fn test_path_redirect_is_terminal() {
        let head = "HTTP/1.1 302 Found\r\nLocation: /login\r\n\r\n";
        assert_eq!(redirect_target(head), None);
    }

    #[test]
    fn test_success_response_is_not_redirect() {
        let head = "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\n\r\n";
        assert_eq!(redirect_target(head), None);
    }

    #[test]
    fn test_not_modified_is_not_redirect() {
        let head = "HTTP/1.1 304 Not Modified\r\nLocation: https://x.example.com/\r\n\r\n";
        assert_eq!(redirect_target(head), None);
    }

    #[test]
    fn test_garbage_head_is_not_redirect() {
        assert_eq!(redirect_target("not http at all"), None);
    }
}
