// src/driver/smtp.rs
//! Certificate discovery through SMTP STARTTLS.
//!
//! Mail servers present their certificates after a STARTTLS upgrade; the MX
//! hosts of the queried domain are surfaced as related domains.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use super::{save, tls, CertResult, Driver, FingerprintMap, QueryResult};
use crate::dns;
use crate::fingerprint::Fingerprint;
use crate::status::{classify_net_error, DomainStatus, Status, StatusMap};

const DRIVER_NAME: &str = "smtp";
const SMTP_PORT: u16 = 25;

/// Discovers certificates by upgrading SMTP connections with STARTTLS.
pub struct SmtpDriver {
    connector: TlsConnector,
    timeout: Duration,
    save_path: Option<PathBuf>,
    port: u16,
}

impl std::fmt::Debug for SmtpDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpDriver")
            .field("timeout", &self.timeout)
            .field("save_path", &self.save_path)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

impl SmtpDriver {
    pub fn new(timeout: Duration, save_path: Option<PathBuf>) -> Result<Self> {
        Ok(SmtpDriver {
            connector: tls::insecure_connector()?,
            timeout,
            save_path,
            port: SMTP_PORT,
        })
    }

    /// Run the STARTTLS dialogue and return the peer's DER chain.
    async fn starttls_chain(&self, host: &str) -> io::Result<Vec<Vec<u8>>> {
        let tcp = tokio::time::timeout(self.timeout, TcpStream::connect((host, self.port)))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "tcp connect timed out"))??;
        let mut stream = BufStream::new(tcp);

        expect_reply(&mut stream, self.timeout, 220).await?;
        send_command(&mut stream, self.timeout, "EHLO sangraph.invalid").await?;
        expect_reply(&mut stream, self.timeout, 250).await?;
        send_command(&mut stream, self.timeout, "STARTTLS").await?;
        expect_reply(&mut stream, self.timeout, 220).await?;

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let tls_stream =
            tokio::time::timeout(self.timeout, self.connector.connect(server_name, stream.into_inner()))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "tls handshake timed out"))??;

        Ok(tls::peer_chain(&tls_stream))
    }
}

#[async_trait]
impl Driver for SmtpDriver {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    /// Query the mail server certificate for a domain.
    ///
    /// MX hosts are looked up first and reported as related domains and in
    /// the status metadata; connection failures become statuses, not errors.
    async fn query_domain(&self, domain: &str) -> Result<Box<dyn QueryResult>> {
        let mut result = SmtpResult {
            host: domain.to_lowercase(),
            status: StatusMap::new(),
            fingerprints: FingerprintMap::new(),
            mx: Vec::new(),
            certs: HashMap::new(),
        };

        match dns::lookup_mx(&result.host, self.timeout).await {
            Ok(mx) => result.mx = mx,
            Err(e) => debug!("MX lookup for {domain} failed: {e:#}"),
        }
        let meta = if result.mx.is_empty() {
            String::new()
        } else {
            format!("MX({})", result.mx.join(" "))
        };

        let chain = self.starttls_chain(&result.host).await;
        let smtp_status = classify_net_error(chain.as_ref().err());
        result
            .status
            .set(result.host.clone(), Status::with_meta(smtp_status, meta));
        if smtp_status != DomainStatus::Good {
            return Ok(Box::new(result));
        }

        let chain = chain.unwrap_or_default();
        if let Some(leaf) = chain.first() {
            match CertResult::from_der(leaf) {
                Ok(cert) => {
                    result.fingerprints.add(result.host.clone(), cert.fingerprint);
                    if let Some(dir) = &self.save_path {
                        let path = dir.join(format!("{}.pem", cert.fingerprint.hex_string()));
                        if let Err(e) = save::certs_to_pem_file(&chain, &path) {
                            warn!("failed to save certificate chain for {domain}: {e:#}");
                        }
                    }
                    result.certs.insert(cert.fingerprint, cert);
                }
                Err(e) => debug!("unparseable certificate from {domain}: {e:#}"),
            }
        }

        Ok(Box::new(result))
    }
}

#[derive(Debug)]
struct SmtpResult {
    host: String,
    status: StatusMap,
    fingerprints: FingerprintMap,
    mx: Vec<String>,
    certs: HashMap<Fingerprint, CertResult>,
}

#[async_trait]
impl QueryResult for SmtpResult {
    fn status(&self) -> StatusMap {
        self.status.clone()
    }

    fn related(&self) -> Vec<String> {
        self.mx.clone()
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

async fn send_command(
    stream: &mut BufStream<TcpStream>,
    timeout: Duration,
    command: &str,
) -> io::Result<()> {
    let line = format!("{command}\r\n");
    tokio::time::timeout(timeout, async {
        stream.write_all(line.as_bytes()).await?;
        stream.flush().await
    })
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "smtp write timed out"))?
}

/// Read one (possibly multiline) SMTP reply and require the given code.
async fn expect_reply(
    stream: &mut BufStream<TcpStream>,
    timeout: Duration,
    expected: u16,
) -> io::Result<()> {
    let code = tokio::time::timeout(timeout, read_reply(stream))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "smtp read timed out"))??;
    if code != expected {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected smtp reply {code}, wanted {expected}"),
        ));
    }
    Ok(())
}

async fn read_reply(stream: &mut BufStream<TcpStream>) -> io::Result<u16> {
    let mut line = String::new();
    loop {
        line.clear();
        let n = stream.read_line(&mut line).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "smtp connection closed",
            ));
        }
        if line.len() < 4 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("malformed smtp reply {line:?}"),
            ));
        }
        // "250-..." continues a multiline reply, "250 ..." ends it
        if line.as_bytes()[3] != b'-' {
            return line[..3]
                .parse()
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "malformed smtp code"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn serve_script(listener: TcpListener, replies: Vec<&'static str>) {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut replies = replies.into_iter();
        // greeting comes unprompted
        socket
            .write_all(replies.next().unwrap().as_bytes())
            .await
            .unwrap();
        let mut buf = [0u8; 512];
        for reply in replies {
            let n = socket.read(&mut buf).await.unwrap();
            assert!(n > 0);
            socket.write_all(reply.as_bytes()).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    fn driver_on(port: u16) -> SmtpDriver {
        let mut d = SmtpDriver::new(Duration::from_secs(2), None).unwrap();
        d.port = port;
        d
    }

    #[tokio::test]
    async fn test_starttls_refused_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(serve_script(
            listener,
            vec![
                "220 mail.localhost ESMTP\r\n",
                "250-mail.localhost\r\n250 OK\r\n",
                "454 TLS not available\r\n",
            ],
        ));

        let driver = driver_on(port);
        let err = driver.starttls_chain("127.0.0.1").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_greeting_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(serve_script(listener, vec!["554 go away\r\n"]));

        let driver = driver_on(port);
        assert!(driver.starttls_chain("127.0.0.1").await.is_err());
    }

    #[tokio::test]
    async fn test_connection_refused_becomes_status() {
        // nothing listens on this port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let driver = driver_on(port);
        let err = driver.starttls_chain("127.0.0.1").await.unwrap_err();
        assert_eq!(classify_net_error(Some(&err)), DomainStatus::Refused);
    }
}
