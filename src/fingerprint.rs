// src/fingerprint.rs
//! SHA-256 certificate fingerprints, the certificate identity used everywhere
//! in the graph.

use anyhow::{Context, Result};
use base64::Engine;
use sha2::{Digest, Sha256};
use std::fmt;

/// Length of a fingerprint in bytes (SHA-256 digest size).
pub const FINGERPRINT_SIZE: usize = 32;

/// SHA-256 hash of the DER-encoded certificate bytes.
///
/// Equality and hashing are byte-wise; the value never changes once computed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; FINGERPRINT_SIZE]);

impl Fingerprint {
    /// Compute the fingerprint of raw DER certificate bytes.
    pub fn from_raw_cert_bytes(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut fp = [0u8; FINGERPRINT_SIZE];
        fp.copy_from_slice(&digest);
        Fingerprint(fp)
    }

    /// Build a fingerprint from already-hashed bytes.
    ///
    /// Short input is zero-padded, long input is truncated.
    pub fn from_hash_bytes(data: &[u8]) -> Self {
        let mut fp = [0u8; FINGERPRINT_SIZE];
        let n = data.len().min(FINGERPRINT_SIZE);
        fp[..n].copy_from_slice(&data[..n]);
        Fingerprint(fp)
    }

    /// Decode a fingerprint from a hex string.
    pub fn from_hex(hash: &str) -> Result<Self> {
        let decoded = hex::decode(hash.trim())
            .with_context(|| format!("failed to decode hex fingerprint {hash:?}"))?;
        Ok(Self::from_hash_bytes(&decoded))
    }

    /// Decode a fingerprint from a standard base64 string.
    pub fn from_b64(hash: &str) -> Result<Self> {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(hash.trim())
            .with_context(|| format!("failed to decode base64 fingerprint {hash:?}"))?;
        Ok(Self::from_hash_bytes(&decoded))
    }

    /// Render as uppercase hex, the display form used in output and filenames.
    pub fn hex_string(&self) -> String {
        let mut s = String::with_capacity(FINGERPRINT_SIZE * 2);
        for b in self.0 {
            s.push_str(&format!("{b:02X}"));
        }
        s
    }

    /// Render as standard base64, the form the CT APIs exchange.
    pub fn b64_string(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_SIZE] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex_string())
    }
}

// Debug prints the hex form; the raw byte array adds nothing when reading logs.
impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.hex_string())
    }
}
